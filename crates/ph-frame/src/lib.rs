//! Handler driver framework.
//!
//! The framework sits between the test cell client and a handler plugin. It
//! keeps the driver level state, maps SmarTest bins to handler bins, and
//! turns plugin results into waiting, operator events or return values.
//!
//! - [`frame`]: the [`Frame`] and its operations
//! - [`tester`]: flags and results of the test cell client
//! - [`event`]: operator events and hand test
//! - [`registry`]: plugin factories by driver type

mod device;
pub mod event;
mod exception;
pub mod frame;
pub mod registry;
pub mod tester;

pub use event::{Attempt, EventHandler, EventResult, PolicyEvents, TimeoutEvent};
pub use frame::{CallAnswer, CallReturn, Frame};
pub use registry::{FactoryInfo, PluginRegistry};
pub use tester::{SimulatedTester, SiteFlag, SmartestBin, SystemFlag, Tester, TesterError};
