//! Mirae handler plugin.
//!
//! MR5800, M660 and M330 handlers speak a dialect of the TechWing protocol:
//! devices are announced with a device ready request instead of a test start
//! request, and test tray handlers bin every tray position at once.
//!
//! ```rust,ignore
//! let registry = PluginRegistry::new();
//! ph_driver_mirae::register(&registry);
//! ```

pub mod plugin;
pub mod temperature;

pub use plugin::{MiraeFactory, MiraePlugin, Model};
pub use temperature::{TempControl, TempSetup};

use ph_core::FactoryRegistry;

/// Register the Mirae factory.
pub fn register(registry: &impl FactoryRegistry) {
    registry.register_factory(Box::new(MiraeFactory));
}

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<MiraeFactory>());
}
