//! Pyramid handler plugin.
//!
//! Pyramid handlers speak SECS/GEM over an HSMS connection. The driver is the
//! active side: it connects, selects the session and defines the event
//! reports it wants during the communication test. From then on the handler
//! reports device and lot events on its own:
//!
//! ```text
//! driver                                  handler
//!   S1F3  status?            ---->
//!                            <----        S1F4  85 (ready)
//!   S2F41 LOT_LOAD           ---->
//!                            <----        S2F42 HCACK
//!                            <----        S6F11 CEID 8011 lot loaded
//!                            <----        S6F11 CEID 8300 device ready
//!   S2F41 BIN_UNITS          ---->
//! ```
//!
//! A request whose reply is late is not sent again when the framework
//! repeats the call; the plugin only waits for the reply it is owed.
//!
//! Setting the status key `retest_from_bin_tray` to a bin tray label waits
//! for the sorting complete report (CEID 8008) and, when that tray holds
//! devices, stops the handler and sends `RETEST_FROM_BINTRAY`. The status key
//! `no_need_retest` tells whether the tray was empty.
//!
//! A background task reads the connection; see [`session`].

pub mod gem;
pub mod hsms;
pub mod plugin;
pub mod secs;
pub mod session;

pub use plugin::{PyramidFactory, PyramidPlugin};

use ph_core::FactoryRegistry;

/// Register the Pyramid factory.
pub fn register(registry: &impl FactoryRegistry) {
    registry.register_factory(Box::new(PyramidFactory));
}

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<PyramidFactory>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_does_not_panic() {
        link();
    }
}
