//! DB Design ATOM handler plugin.
//!
//! A single site GPIB handler without service requests. The plugin polls
//! `RFT?` ("ready for test") and bins with `BIN1` (pass) or `BIN2` (fail).

pub mod plugin;

pub use plugin::{AtomFactory, AtomPlugin};

use ph_core::FactoryRegistry;

/// Register the ATOM factory.
pub fn register(registry: &impl FactoryRegistry) {
    registry.register_factory(Box::new(AtomFactory));
}

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<AtomFactory>());
}
