//! Core types for semiconductor test handler drivers.
//!
//! This crate holds everything the framework and the vendor plugins share:
//!
//! - [`plugin`]: the [`HandlerPlugin`](plugin::HandlerPlugin) contract and
//!   the [`PluginFactory`](plugin::PluginFactory) each vendor crate registers
//! - [`error`]: plugin result codes and transport failures
//! - [`estate`]: site population and handler flags
//! - [`config`]: driver configuration loaded with figment
//! - [`transport`] / [`transaction`]: message exchange with the handler
//! - [`state`] / [`binner`]: driver level state machine and bin mapping
//! - [`logging`]: tracing subscriber setup

pub mod availability;
pub mod binner;
pub mod config;
pub mod error;
pub mod estate;
pub mod logging;
pub mod plugin;
pub mod serial;
pub mod state;
pub mod transaction;
pub mod transport;

pub use availability::FuncAvailability;
pub use config::{load_handler_config, ConfigLoadError, HandlerConfig};
pub use error::{FuncError, FuncResult, InterfaceKind, TransportError};
pub use estate::{Estate, SiteUsage};
pub use plugin::{
    AbortFlag, FactoryRegistry, HandlerPlugin, PluginContext, PluginFactory, StatRequest,
};
pub use transaction::Transaction;
pub use transport::{StreamTransport, Transport};
