//! Interpretation of plugin results.
//!
//! A plugin call either completes, or reports why it did not. Handler state
//! notifications (jam, lot start/done, device start) end the call and are
//! passed up to the test cell client. Pending calls go through the waiting
//! policy, interface and answer problems go to the event handler.

use crate::event::{EventResult, TimeoutEvent};
use crate::frame::{CallReturn, Frame};
use crate::tester::SystemFlag;
use ph_core::config::{TimeoutAction, DEFAULT_WAIT_TIMEOUT_SECS};
use ph_core::{FuncAvailability, FuncError, FuncResult};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What the dispatch loop does after a plugin result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Call the plugin again.
    Again,
    /// Stop without success.
    Completed,
    /// Stop, the operation is done.
    Succeeded,
}

impl Frame {
    /// Operator asked to stop: abort, reset, or a quit raised during this call.
    fn stop_requested(&self) -> bool {
        self.tester.is_set(SystemFlag::Abort)
            || self.tester.is_set(SystemFlag::Reset)
            || (self.tester.is_set(SystemFlag::Quit) && !self.initial_quit)
    }

    /// Timeout and configured reaction for waiting on `call`.
    pub(crate) fn timeout_policy(&self, call: FuncAvailability) -> (Duration, TimeoutAction) {
        let config = &self.config;
        let (secs, action) = if call == FuncAvailability::INIT {
            (config.waiting_for_lot_timeout, config.waiting_for_lot_timeout_action)
        } else if call.intersects(
            FuncAvailability::START
                | FuncAvailability::BIN
                | FuncAvailability::REPROBE
                | FuncAvailability::BINREPR,
        ) {
            (
                config.waiting_for_parts_timeout,
                config.waiting_for_parts_timeout_action,
            )
        } else {
            (config.general_timeout, config.general_timeout_action)
        };
        let secs = secs.unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS).max(0.0);
        (Duration::from_secs_f64(secs), action.unwrap_or_default())
    }

    /// One heartbeat passed without the plugin call completing.
    fn waiting(&mut self, call: FuncAvailability) -> EventResult {
        debug!("waiting for operation to complete, heartbeat timeout");

        if self.stop_requested() {
            info!("aborting current operation due to set system flags");
            return EventResult::Abort(CallReturn::Pass);
        }
        let pause = self.tester.is_set(SystemFlag::Pause);

        let total = self.total_timer.elapsed();
        let short = self.short_timer.elapsed();

        if let aborted @ EventResult::Abort(_) = self.events.waiting(call, total) {
            return aborted;
        }

        let (max, action) = self.timeout_policy(call);
        let new_pause = pause && !self.initial_pause;
        let hand = self.state.driver_mode().is_hand();
        if !(new_pause || short > max || hand) {
            return EventResult::Void;
        }

        let result = self.events.timeout(&TimeoutEvent {
            call,
            elapsed: total,
            action,
            pause,
        });

        if self.tester.is_set(SystemFlag::Abort) {
            return EventResult::Abort(CallReturn::Pass);
        }
        // a pause raised while waiting only interrupts the wait
        if new_pause {
            self.tester.raise(SystemFlag::Pause, false);
        }
        self.short_timer = tokio::time::Instant::now();
        result
    }

    fn interface_problem(&mut self, call: FuncAvailability, error: FuncError) -> EventResult {
        if self.stop_requested() {
            info!("aborting current operation due to set system flags");
            return EventResult::Abort(CallReturn::Pass);
        }
        let result = self.events.interface_problem(call, error);
        if self.tester.is_set(SystemFlag::Abort) {
            return EventResult::Abort(CallReturn::Pass);
        }
        result
    }

    fn answer_problem(&mut self, call: FuncAvailability) -> EventResult {
        if self.stop_requested() {
            info!("aborting current operation due to set system flags");
            return EventResult::Abort(CallReturn::Pass);
        }
        let result = self.events.answer_error(call);
        if self.tester.is_set(SystemFlag::Abort) {
            return EventResult::Abort(CallReturn::Pass);
        }
        result
    }

    /// Decide how to continue after `result` of plugin operation `call`.
    ///
    /// `ret` is updated with the value for the test cell client.
    pub(crate) fn handle_plugin_result(
        &mut self,
        result: FuncResult,
        call: FuncAvailability,
        ret: &mut CallReturn,
    ) -> Progress {
        let err = match result {
            Ok(()) => return Progress::Succeeded,
            Err(e) => e,
        };
        let name = call.call_name();

        match err {
            FuncError::Jam => {
                info!(call = name, "handler jam");
                *ret = CallReturn::Jam;
                Progress::Completed
            }
            FuncError::LotStart => {
                if call != FuncAvailability::LOT_START {
                    *ret = CallReturn::LotStart;
                }
                Progress::Completed
            }
            FuncError::LotDone => {
                if call != FuncAvailability::LOT_DONE {
                    *ret = CallReturn::LotDone;
                }
                Progress::Completed
            }
            FuncError::DeviceStart => {
                if call != FuncAvailability::START {
                    *ret = CallReturn::DeviceStart;
                }
                Progress::Completed
            }
            FuncError::NotInit
            | FuncError::InvalidHandle
            | FuncError::NotAvailable
            | FuncError::Memory
            | FuncError::Model
            | FuncError::Fatal => {
                error!(call = name, "{}", err);
                *ret = CallReturn::Error;
                Progress::Completed
            }
            FuncError::Binning | FuncError::Config => {
                error!(call = name, "{}", err);
                Progress::Completed
            }
            FuncError::Timeout | FuncError::Waiting => match self.waiting(call) {
                EventResult::Void | EventResult::Continue => Progress::Again,
                EventResult::Abort(value) => {
                    *ret = value;
                    Progress::Completed
                }
                EventResult::Handled => Progress::Succeeded,
            },
            FuncError::Gpib | FuncError::Rs232 | FuncError::Lan => {
                if err == FuncError::Lan {
                    self.tester.raise(SystemFlag::Abort, true);
                }
                match self.interface_problem(call, err) {
                    EventResult::Void => {
                        *ret = CallReturn::Error;
                        Progress::Completed
                    }
                    EventResult::Abort(value) => {
                        *ret = value;
                        Progress::Completed
                    }
                    EventResult::Continue | EventResult::Handled => Progress::Again,
                }
            }
            FuncError::Aborted => {
                info!(call = name, "plugin call aborted");
                self.tester.raise(SystemFlag::Abort, true);
                Progress::Completed
            }
            FuncError::Answer => match self.answer_problem(call) {
                EventResult::Void | EventResult::Abort(_) => {
                    *ret = CallReturn::Error;
                    Progress::Completed
                }
                EventResult::Continue | EventResult::Handled => Progress::Again,
            },
            FuncError::FirstRetest
            | FuncError::SecondRetest
            | FuncError::RetestDone
            | FuncError::HaveDeal => {
                warn!(call = name, "unexpected plugin result: {}", err);
                *ret = CallReturn::Error;
                Progress::Completed
            }
        }
    }
}
