//! Operator facing events.
//!
//! Whenever a plugin call cannot complete on its own (a timeout, an interface
//! failure, an answer the plugin did not understand) the framework raises an
//! event. An interactive test cell shows a dialog; [`PolicyEvents`] applies
//! the configured timeout actions without asking anybody.
//!
//! Hand test mode replaces the handler by the operator: the framework asks
//! the event handler for device population and reports bins to it instead of
//! calling the plugin.

use crate::frame::CallReturn;
use ph_core::config::TimeoutAction;
use ph_core::estate::{Estate, SiteUsage};
use ph_core::{FuncAvailability, FuncError, FuncResult};
use std::time::Duration;
use tracing::{error, info, warn};

/// Answer of an event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventResult {
    /// Nothing was done.
    #[default]
    Void,
    /// Keep going with the current operation.
    Continue,
    /// The operation is considered complete.
    Handled,
    /// Stop the operation and return the given value to the test cell client.
    Abort(CallReturn),
}

/// One attempt at an operation, performed by the plugin or, in hand test
/// mode, by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The attempt finished with this plugin style result.
    Done(FuncResult<T>),
    /// The operator aborted; return the value to the test cell client.
    Abort(CallReturn),
}

impl<T> From<FuncResult<T>> for Attempt<T> {
    fn from(result: FuncResult<T>) -> Self {
        Attempt::Done(result)
    }
}

/// Data of a waiting timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutEvent {
    /// Plugin operation that is waiting.
    pub call: FuncAvailability,
    /// Time since the framework call started.
    pub elapsed: Duration,
    /// Configured reaction.
    pub action: TimeoutAction,
    /// The tester pause flag is set.
    pub pause: bool,
}

/// Receiver of framework events.
///
/// Every method has a non-interactive default, so an implementation only
/// overrides what it can present to an operator.
pub trait EventHandler: Send + Sync {
    /// Called on every heartbeat while a plugin operation is waiting.
    fn waiting(&self, _call: FuncAvailability, _elapsed: Duration) -> EventResult {
        EventResult::Void
    }

    /// The waiting time of an operation is exceeded.
    fn timeout(&self, event: &TimeoutEvent) -> EventResult {
        match event.action {
            TimeoutAction::Skip => {
                info!(call = event.call.call_name(), "timeout, skipping operation");
                EventResult::Handled
            }
            TimeoutAction::Continue => EventResult::Void,
            TimeoutAction::OperatorHelp => {
                warn!(
                    call = event.call.call_name(),
                    elapsed = ?event.elapsed,
                    "operation not yet completed, no operator dialog available, keep waiting"
                );
                EventResult::Void
            }
        }
    }

    /// Communication with the handler failed.
    fn interface_problem(&self, call: FuncAvailability, error: FuncError) -> EventResult {
        error!(call = call.call_name(), "interface problem: {}", error);
        EventResult::Void
    }

    /// The handler sent something the plugin could not interpret.
    fn answer_error(&self, call: FuncAvailability) -> EventResult {
        error!(call = call.call_name(), "handler not understood");
        EventResult::Void
    }

    /// A condition that may affect test quality. Returns `true` to quit.
    fn panic(&self, _message: &str) -> bool {
        false
    }

    /// Hand test: the operator inserted devices.
    fn handtest_get_start(&self, estate: &Estate) -> Attempt<()> {
        let sites = vec![SiteUsage::Populated; estate.site_count()];
        match estate.set_sites(&sites) {
            Ok(()) => Attempt::Done(Ok(())),
            Err(e) => {
                error!("{}", e);
                Attempt::Done(Err(FuncError::Fatal))
            }
        }
    }

    /// Hand test: the operator bins devices.
    fn handtest_bin(&self, estate: &Estate, bins: &[i64]) -> Attempt<()> {
        info!(?bins, "hand test binning");
        estate.mark_binned();
        Attempt::Done(Ok(()))
    }

    /// Hand test: the operator reprobes all devices.
    fn handtest_reprobe(&self, _estate: &Estate) -> Attempt<()> {
        Attempt::Done(Ok(()))
    }

    /// Hand test: the operator reprobes some devices and bins the rest.
    fn handtest_bin_reprobe(&self, _estate: &Estate, to_reprobe: &[bool], bins: &[i64]) -> Attempt<()> {
        info!(?to_reprobe, ?bins, "hand test bin and reprobe");
        Attempt::Done(Ok(()))
    }
}

/// Non-interactive event handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEvents {
    /// Quit the test program on a panic instead of continuing.
    pub quit_on_panic: bool,
}

impl PolicyEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quit_on_panic(mut self, quit: bool) -> Self {
        self.quit_on_panic = quit;
        self
    }
}

impl EventHandler for PolicyEvents {
    fn panic(&self, message: &str) -> bool {
        error!("driver panic: {}", message);
        self.quit_on_panic
    }
}
