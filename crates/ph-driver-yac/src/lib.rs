//! YAC HYAC8086 handler plugin.
//!
//! The HYAC8086 announces devices with a service request whose bit 0 asks the
//! plugin to poll `FULLSITES?`. Alarm and transmission error bits of the same
//! byte are only reported. Bin commands always carry 32 slots.
//!
//! ```rust,ignore
//! let registry = PluginRegistry::new();
//! ph_driver_yac::register(&registry);
//! ```

pub mod plugin;

pub use plugin::{YacFactory, YacPlugin};

use ph_core::FactoryRegistry;

/// Register the YAC factory.
pub fn register(registry: &impl FactoryRegistry) {
    registry.register_factory(Box::new(YacFactory));
}

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<YacFactory>());
}
