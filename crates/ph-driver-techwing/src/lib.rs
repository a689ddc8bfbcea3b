//! TechWing handler plugin.
//!
//! Supports the TW2XX and TW3XX families over GPIB (through a TCP gateway),
//! LAN or RS-232. The message helpers in [`protocol`] are shared with the
//! Mirae plugin, whose handlers speak a close dialect.
//!
//! # Usage
//!
//! ```toml
//! [dependencies]
//! ph-driver-techwing = { path = "../ph-driver-techwing" }
//! ```
//!
//! ```rust,ignore
//! let registry = PluginRegistry::new();
//! ph_driver_techwing::register(&registry);
//! ```

pub mod plugin;
pub mod protocol;

pub use plugin::{Model, TechWingFactory, TechWingPlugin};

use ph_core::FactoryRegistry;

/// Register the TechWing factory.
pub fn register(registry: &impl FactoryRegistry) {
    registry.register_factory(Box::new(TechWingFactory));
}

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factories are
/// linked into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<TechWingFactory>());
}
