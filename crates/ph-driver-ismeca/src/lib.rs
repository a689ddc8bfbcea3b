//! Ismeca NY20 and NX16 handler plugin.
//!
//! The handlers talk over RS232 and never raise service requests; the plugin
//! polls them. Every command is a three step exchange:
//!
//! ```text
//! plugin  ENQ                 handler  ACK
//! plugin  STX command ETX     handler  ENQ
//! plugin  ACK                 handler  STX reply ETX
//! ```
//!
//! A poll asks for pending errors (`CA`) and then for the sites holding a
//! device (`CE`). Bin results are sent with `BA`.
//!
//! ```rust,ignore
//! let registry = PluginRegistry::new();
//! ph_driver_ismeca::register(&registry);
//! ```

pub mod plugin;
pub mod protocol;

pub use plugin::{IsmecaFactory, IsmecaPlugin};

use ph_core::FactoryRegistry;

/// Register the Ismeca factory.
pub fn register(registry: &impl FactoryRegistry) {
    registry.register_factory(Box::new(IsmecaFactory));
}

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<IsmecaFactory>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_does_not_panic() {
        link();
    }
}
