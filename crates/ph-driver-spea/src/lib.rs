//! SPEA H3570 handler plugin.
//!
//! The H3570 sits on the LAN and never raises service requests. The plugin
//! polls it with `QUERY` and the handler answers with whatever it has to say:
//!
//! ```text
//! driver                      handler
//!   QUERY          ---->
//!                  <----      START_LOT | NO ACTION | TEST 1,0,1,1
//!   TEST RUN       ---->
//!                  <----      ACK
//!   RESULT 1,0,3,1 ---->
//!                  <----      ACK
//! ```

pub mod plugin;
pub mod protocol;

pub use plugin::{SpeaFactory, SpeaPlugin};

use ph_core::FactoryRegistry;

/// Register the SPEA factory.
pub fn register(registry: &impl FactoryRegistry) {
    registry.register_factory(Box::new(SpeaFactory));
}

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<SpeaFactory>());
}
