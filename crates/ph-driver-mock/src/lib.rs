//! Simulated handler.
//!
//! Delivers devices without hardware: every active site is filled on each
//! device request, or a seeded generator decides, or a scripted population
//! list is replayed. Failures such as jams and a lost connection can be
//! injected, see [`errors`].
//!
//! ```toml
//! driver_plugin = "mock"
//! model = "mock"
//! handler_site_ids = ["1", "2"]
//! mock_seed = 42
//! mock_fill_rate = 0.8
//! mock_lot_size = 100
//! ```

pub mod errors;
pub mod plugin;
pub mod rng;

pub use errors::{ErrorConfig, ErrorScenario};
pub use plugin::{MockFactory, MockPlugin};
pub use rng::MockRng;

use ph_core::FactoryRegistry;

/// Register the simulated handler factory.
pub fn register(registry: &impl FactoryRegistry) {
    registry.register_factory(Box::new(MockFactory));
}

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<MockFactory>());
}
