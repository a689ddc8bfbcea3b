//! Framework dispatch.
//!
//! [`Frame`] is what the test cell client talks to. Every public operation
//! follows the same envelope:
//!
//! 1. refuse to run while the tester abort flag is set,
//! 2. check that the call is legal at the current level,
//! 3. run the plugin call until it completes, applying the waiting policy
//!    and raising operator events on the way,
//! 4. on success, move the state machine to the next level.

use crate::event::{Attempt, EventHandler};
use crate::tester::{SystemFlag, Tester};
use futures::future::BoxFuture;
use ph_core::binner::BinMapping;
use ph_core::state::{Action, DriverState, Level, StateError, StateFlags};
use ph_core::{AbortFlag, Estate, FuncAvailability, HandlerConfig, HandlerPlugin, PluginContext};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Value returned to the test cell client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum CallReturn {
    #[default]
    Pass,
    Error,
    /// The handler reported a jam.
    Jam,
    /// The handler started a lot while another operation was pending.
    LotStart,
    /// The handler finished the lot; no devices are delivered.
    LotDone,
    /// The handler delivered devices while another operation was pending.
    DeviceStart,
}

/// Result of an operation that also produces a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAnswer<T> {
    pub ret: CallReturn,
    /// Present when the plugin call completed successfully.
    pub value: Option<T>,
}

/// Handles passed into a single plugin attempt.
#[derive(Clone)]
pub(crate) struct CallCtx {
    pub plugin: Arc<dyn HandlerPlugin>,
    pub events: Arc<dyn EventHandler>,
    pub estate: Estate,
    /// Hand test mode: the operator stands in for the handler.
    pub hand: bool,
}

pub(crate) struct Driven<T> {
    pub success: bool,
    pub value: Option<T>,
}

/// Returned when the operator chose to quit after a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OperatorQuit;

/// One handler driver instance bound to a test cell client.
pub struct Frame {
    pub(crate) config: Arc<HandlerConfig>,
    pub(crate) plugin: Arc<dyn HandlerPlugin>,
    pub(crate) availability: FuncAvailability,
    pub(crate) tester: Arc<dyn Tester>,
    pub(crate) events: Arc<dyn EventHandler>,
    pub(crate) estate: Estate,
    pub(crate) abort: AbortFlag,
    pub(crate) state: DriverState,
    pub(crate) bins: BinMapping,
    pub(crate) smartest_sites: Vec<i64>,
    pub(crate) device_bins: Vec<i64>,
    pub(crate) device_to_reprobe: Vec<bool>,
    pub(crate) retest_rounds: u32,
    pub(crate) initial_pause: bool,
    pub(crate) initial_quit: bool,
    pub(crate) total_timer: Instant,
    pub(crate) short_timer: Instant,
}

impl Frame {
    /// Bind `plugin`, built from `ctx`, to a tester and an event handler.
    ///
    /// Bin mapping is set up by [`Frame::driver_start`].
    pub fn new(
        ctx: PluginContext,
        plugin: Arc<dyn HandlerPlugin>,
        tester: Arc<dyn Tester>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        let sites = ctx.config.site_count();
        let now = Instant::now();
        Self {
            smartest_sites: ctx.config.smartest_sites(),
            availability: plugin.availability(),
            config: ctx.config,
            plugin,
            tester,
            events,
            estate: ctx.estate,
            abort: ctx.abort,
            state: DriverState::new(),
            bins: BinMapping::default(),
            device_bins: vec![-1; sites],
            device_to_reprobe: vec![false; sites],
            retest_rounds: 0,
            initial_pause: false,
            initial_quit: false,
            total_timer: now,
            short_timer: now,
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn estate(&self) -> &Estate {
        &self.estate
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn level(&self) -> Level {
        self.state.level()
    }

    pub fn availability(&self) -> FuncAvailability {
        self.availability
    }

    /// Handler bins chosen by the last device done, per handler site.
    pub fn device_bins(&self) -> &[i64] {
        &self.device_bins
    }

    pub(crate) fn state_flags(&self) -> StateFlags {
        StateFlags {
            abort: self.tester.is_set(SystemFlag::Abort),
            retest: self.tester.is_set(SystemFlag::Retest),
            check_device: self.tester.is_set(SystemFlag::CheckDevice),
            skip: self.tester.is_set(SystemFlag::Skip),
        }
    }

    pub(crate) fn call_ctx(&self) -> CallCtx {
        CallCtx {
            plugin: self.plugin.clone(),
            events: self.events.clone(),
            estate: self.estate.clone(),
            hand: self.state.driver_mode().is_hand(),
        }
    }

    pub(crate) fn restart_timers(&mut self) {
        let now = Instant::now();
        self.total_timer = now;
        self.short_timer = now;
    }

    /// Start of every framework call. Returns the value to hand back
    /// immediately when the call must not run.
    pub(crate) fn enter(&mut self, action: Action) -> Option<CallReturn> {
        if self.tester.is_set(SystemFlag::Abort) {
            error!(?action, "driver aborts already, not executing handler driver call");
            self.abort.raise();
            return Some(CallReturn::Pass);
        }
        info!(?action, "called");

        let flags = self.state_flags();
        if let Err(e) = self.state.check_level_change(action, flags) {
            match e {
                StateError::Ignored(_) => {
                    info!("{}", e);
                    return Some(CallReturn::Pass);
                }
                StateError::IllegalTransition { .. } => warn!("{}", e),
            }
        }

        self.initial_pause = self.tester.is_set(SystemFlag::Pause);
        self.initial_quit = self.tester.is_set(SystemFlag::Quit);
        None
    }

    /// Successful end of a framework call.
    pub(crate) fn leave(&mut self, action: Action) {
        let flags = self.state_flags();
        let change = self.state.change_level(action, flags);
        if change.release_pause {
            self.tester.raise(SystemFlag::Pause, false);
        }
    }

    /// Log a panic and ask the event handler whether to quit.
    pub(crate) fn panic(&self, message: &str) -> Result<(), OperatorQuit> {
        error!("PANIC! {}", message);
        if self.events.panic(message) {
            self.tester.raise(SystemFlag::Quit, true);
            Err(OperatorQuit)
        } else {
            Ok(())
        }
    }

    /// Repeat a plugin attempt until the result handling completes it.
    ///
    /// `Err` carries the value to return when the operator aborted a hand
    /// test step or quit after a binning panic.
    pub(crate) async fn drive<T, F>(
        &mut self,
        call: FuncAvailability,
        ret: &mut CallReturn,
        mut attempt: F,
    ) -> Result<Driven<T>, CallReturn>
    where
        T: Send + 'static,
        F: FnMut(CallCtx) -> BoxFuture<'static, Attempt<T>>,
    {
        loop {
            let result = match attempt(self.call_ctx()).await {
                Attempt::Done(result) => result,
                Attempt::Abort(value) => {
                    error!("aborting handler driver");
                    return Err(value);
                }
            };
            let (result, value) = match result {
                Ok(v) => (Ok(()), Some(v)),
                Err(e) => (Err(e), None),
            };
            let binning_failed = result == Err(ph_core::FuncError::Binning);
            let progress = self.handle_plugin_result(result, call, ret);
            let quality_call =
                call.intersects(FuncAvailability::BIN | FuncAvailability::REPROBE | FuncAvailability::BINREPR);
            if binning_failed
                && quality_call
                && self
                    .panic("SEVERE ERROR WHICH MIGHT AFFECT DEVICE TEST QUALITY")
                    .is_err()
            {
                return Err(CallReturn::Error);
            }
            match progress {
                crate::exception::Progress::Again => {}
                crate::exception::Progress::Completed => {
                    return Ok(Driven {
                        success: false,
                        value,
                    })
                }
                crate::exception::Progress::Succeeded => {
                    return Ok(Driven {
                        success: true,
                        value,
                    })
                }
            }
        }
    }

    /// Run a plugin operation that is only forwarded when available.
    async fn forward<T, F>(&mut self, call: FuncAvailability, attempt: F) -> CallAnswer<T>
    where
        T: Send + 'static,
        F: FnMut(CallCtx) -> BoxFuture<'static, Attempt<T>>,
    {
        if !self.availability.contains(call) {
            warn!("{} is not available for the current handler driver", call.call_name());
            return CallAnswer {
                ret: CallReturn::Pass,
                value: None,
            };
        }
        self.restart_timers();
        let mut ret = CallReturn::Pass;
        match self.drive(call, &mut ret, attempt).await {
            Ok(driven) => CallAnswer {
                ret,
                value: driven.value,
            },
            Err(value) => CallAnswer { ret: value, value: None },
        }
    }

    /// Bring the driver up: bin mapping, communication test, handler
    /// configuration.
    #[instrument(skip(self), fields(driver = %self.config.driver_plugin))]
    pub async fn driver_start(&mut self) -> CallReturn {
        if let Some(ret) = self.enter(Action::DriverStart) {
            return ret;
        }

        self.bins = match BinMapping::from_config(&self.config) {
            Ok(bins) => bins,
            Err(e) => {
                error!("bin management configuration: {}", e);
                self.tester.raise(SystemFlag::Abort, true);
                return CallReturn::Error;
            }
        };
        if self.estate.site_count() != self.smartest_sites.len() {
            error!(
                estate = self.estate.site_count(),
                configured = self.smartest_sites.len(),
                "site configuration does not match equipment state"
            );
            self.tester.raise(SystemFlag::Abort, true);
            return CallReturn::Error;
        }

        let mut ret = CallReturn::Pass;
        if self.availability.contains(FuncAvailability::COMMTEST) {
            debug!("going to test communication link to handler...");
            self.restart_timers();
            let driven = self
                .drive(FuncAvailability::COMMTEST, &mut ret, |cx| {
                    Box::pin(async move { Attempt::Done(cx.plugin.comm_test().await) })
                })
                .await;
            match driven {
                Ok(d) if d.success => debug!("communication test has passed"),
                Ok(_) => {
                    error!("the handler driver is finally not able to communicate with the handler, giving up");
                    return CallReturn::Error;
                }
                Err(value) => return value,
            }
        } else {
            debug!("communication test not performed, not implemented for this plugin");
        }

        if self.availability.contains(FuncAvailability::RECONFIGURE) && ret == CallReturn::Pass {
            debug!("going to configure the handler driver plugin...");
            self.restart_timers();
            let driven = self
                .drive(FuncAvailability::RECONFIGURE, &mut ret, |cx| {
                    Box::pin(async move { Attempt::Done(cx.plugin.reconfigure().await) })
                })
                .await;
            match driven {
                Ok(d) if d.success => debug!("initial configuration has succeeded"),
                Ok(_) => {
                    error!("the handler driver is finally not able to configure the driver plugin, giving up");
                    return CallReturn::Error;
                }
                Err(value) => return value,
            }
        }

        if ret == CallReturn::Pass {
            self.leave(Action::DriverStart);
        }
        ret
    }

    pub async fn driver_done(&mut self) -> CallReturn {
        if let Some(ret) = self.enter(Action::DriverDone) {
            return ret;
        }
        self.leave(Action::DriverDone);
        CallReturn::Pass
    }

    /// Release the plugin's handler connection.
    pub async fn shutdown(&self) {
        if self.availability.contains(FuncAvailability::DESTROY) {
            if let Err(e) = self.plugin.destroy().await {
                warn!("destroying plugin: {}", e);
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn lot_start(&mut self, param: &str) -> CallReturn {
        if let Some(ret) = self.enter(Action::LotStart) {
            return ret;
        }
        let param = param.to_string();
        let answer = self
            .forward(FuncAvailability::LOT_START, move |cx| {
                let param = param.clone();
                Box::pin(async move { Attempt::Done(cx.plugin.lot_start(&param).await) })
            })
            .await;
        if answer.ret == CallReturn::Pass {
            self.leave(Action::LotStart);
        }
        answer.ret
    }

    #[instrument(skip(self))]
    pub async fn lot_done(&mut self, param: &str) -> CallReturn {
        if let Some(ret) = self.enter(Action::LotDone) {
            return ret;
        }
        let param = param.to_string();
        let answer = self
            .forward(FuncAvailability::LOT_DONE, move |cx| {
                let param = param.clone();
                Box::pin(async move { Attempt::Done(cx.plugin.lot_done(&param).await) })
            })
            .await;
        if answer.ret == CallReturn::Pass {
            self.leave(Action::LotDone);
        }
        answer.ret
    }

    pub async fn strip_start(&mut self, param: &str) -> CallReturn {
        if let Some(ret) = self.enter(Action::StripStart) {
            return ret;
        }
        let param = param.to_string();
        let answer = self
            .forward(FuncAvailability::STRIP_START, move |cx| {
                let param = param.clone();
                Box::pin(async move { Attempt::Done(cx.plugin.strip_start(&param).await) })
            })
            .await;
        if answer.ret == CallReturn::Pass {
            self.leave(Action::StripStart);
        }
        answer.ret
    }

    pub async fn strip_done(&mut self, param: &str) -> CallReturn {
        if let Some(ret) = self.enter(Action::StripDone) {
            return ret;
        }
        let param = param.to_string();
        let answer = self
            .forward(FuncAvailability::STRIP_DONE, move |cx| {
                let param = param.clone();
                Box::pin(async move { Attempt::Done(cx.plugin.strip_done(&param).await) })
            })
            .await;
        if answer.ret == CallReturn::Pass {
            self.leave(Action::StripDone);
        }
        answer.ret
    }

    /// Enter tester pause and forward it to the handler.
    pub async fn pause_start(&mut self) -> CallReturn {
        if let Some(ret) = self.enter(Action::PauseStart) {
            return ret;
        }
        let mut ret = CallReturn::Pass;
        if self.availability.contains(FuncAvailability::PAUSE) {
            if self.estate.paused() {
                info!("entering SmarTest pause after handler pause has been recognized");
            } else {
                info!("entering SmarTest pause, handler pause was not yet recognized");
            }
            ret = self
                .forward(FuncAvailability::PAUSE, |cx| {
                    Box::pin(async move { Attempt::Done(cx.plugin.pause().await) })
                })
                .await
                .ret;
            if self.estate.paused() {
                info!("the handler is now paused too");
            } else {
                info!("the driver assumes that the handler is not yet paused");
            }
        } else {
            debug!("forwarding the pause state to the handler is not supported by this handler driver, ignored");
        }
        if ret == CallReturn::Pass {
            self.leave(Action::PauseStart);
        }
        ret
    }

    /// Leave tester pause and release the handler.
    pub async fn pause_done(&mut self) -> CallReturn {
        if let Some(ret) = self.enter(Action::PauseDone) {
            return ret;
        }
        let mut ret = CallReturn::Pass;
        if self.availability.contains(FuncAvailability::UNPAUSE) {
            if self.estate.paused() {
                info!("leaving SmarTest pause while handler is still paused");
            } else {
                info!("leaving SmarTest pause, handler was not known to be paused");
            }
            ret = self
                .forward(FuncAvailability::UNPAUSE, |cx| {
                    Box::pin(async move { Attempt::Done(cx.plugin.unpause().await) })
                })
                .await
                .ret;
            if self.estate.paused() {
                info!("the handler still seems to be paused");
            } else {
                info!("the handler seems to be out of pause too");
            }
        } else {
            debug!("forwarding the unpause state to the handler is not supported by this handler driver, ignored");
        }
        if ret == CallReturn::Pass {
            self.leave(Action::PauseDone);
        }
        ret
    }

    async fn mode_action(&mut self, action: Action) -> CallReturn {
        if let Some(ret) = self.enter(action) {
            return ret;
        }
        self.leave(action);
        debug!(mode = ?self.state.driver_mode(), "driver mode");
        CallReturn::Pass
    }

    pub async fn handtest_start(&mut self) -> CallReturn {
        self.mode_action(Action::HandtestStart).await
    }

    pub async fn handtest_stop(&mut self) -> CallReturn {
        self.mode_action(Action::HandtestStop).await
    }

    pub async fn stepmode_start(&mut self) -> CallReturn {
        self.mode_action(Action::StepmodeStart).await
    }

    pub async fn stepmode_stop(&mut self) -> CallReturn {
        self.mode_action(Action::StepmodeStop).await
    }

    /// Reprobe the devices in the sockets.
    pub async fn reprobe(&mut self) -> CallReturn {
        if let Some(ret) = self.enter(Action::Reprobe) {
            return ret;
        }
        let ret = self.try_reprobe().await;
        if ret == CallReturn::Pass {
            self.leave(Action::Reprobe);
        }
        ret
    }

    /// Check that the handler answers. `value` is the plugin's verdict.
    pub async fn comm_test(&mut self) -> CallAnswer<bool> {
        self.restart_timers();
        self.forward(FuncAvailability::COMMTEST, |cx| {
            Box::pin(async move { Attempt::Done(cx.plugin.comm_test().await) })
        })
        .await
    }

    pub async fn equipment_id(&mut self) -> CallAnswer<String> {
        if let Some(ret) = self.enter(Action::GetId) {
            return CallAnswer { ret, value: None };
        }
        let answer = self
            .forward(FuncAvailability::EQUIPID, |cx| {
                Box::pin(async move { Attempt::Done(cx.plugin.equipment_id().await) })
            })
            .await;
        self.leave(Action::GetId);
        answer
    }

    pub async fn driver_id(&mut self) -> CallAnswer<String> {
        if let Some(ret) = self.enter(Action::GetId) {
            return CallAnswer { ret, value: None };
        }
        let answer = self
            .forward(FuncAvailability::DRIVERID, |cx| {
                Box::pin(async move { Attempt::Done(cx.plugin.driver_id().await) })
            })
            .await;
        self.leave(Action::GetId);
        answer
    }

    /// Read a handler status value.
    #[instrument(skip(self))]
    pub async fn get_status(&mut self, key: &str) -> CallAnswer<String> {
        if let Some(ret) = self.enter(Action::GetStatus) {
            return CallAnswer { ret, value: None };
        }
        let key = key.to_string();
        let answer = self
            .forward(FuncAvailability::GET_STATUS, move |cx| {
                let key = key.clone();
                Box::pin(async move { Attempt::Done(cx.plugin.get_status(&key).await) })
            })
            .await;
        self.leave(Action::GetStatus);
        answer
    }

    /// Write a handler status value.
    #[instrument(skip(self))]
    pub async fn set_status(&mut self, key: &str, value: &str) -> CallReturn {
        if let Some(ret) = self.enter(Action::SetStatus) {
            return ret;
        }
        let key = key.to_string();
        let value = value.to_string();
        let answer = self
            .forward(FuncAvailability::SET_STATUS, move |cx| {
                let key = key.clone();
                let value = value.clone();
                Box::pin(async move { Attempt::Done(cx.plugin.set_status(&key, &value).await) })
            })
            .await;
        self.leave(Action::SetStatus);
        answer.ret
    }

    pub async fn exec_gpib_cmd(&mut self, command: &str) -> CallAnswer<String> {
        if let Some(ret) = self.enter(Action::ExecGpibCmd) {
            return CallAnswer { ret, value: None };
        }
        let command = command.to_string();
        let answer = self
            .forward(FuncAvailability::EXECGPIBCMD, move |cx| {
                let command = command.clone();
                Box::pin(async move { Attempt::Done(cx.plugin.exec_gpib_cmd(&command).await) })
            })
            .await;
        self.leave(Action::ExecGpibCmd);
        answer
    }

    pub async fn exec_gpib_query(&mut self, query: &str) -> CallAnswer<String> {
        if let Some(ret) = self.enter(Action::ExecGpibQuery) {
            return CallAnswer { ret, value: None };
        }
        let query = query.to_string();
        let answer = self
            .forward(FuncAvailability::EXECGPIBQUERY, move |cx| {
                let query = query.clone();
                Box::pin(async move { Attempt::Done(cx.plugin.exec_gpib_query(&query).await) })
            })
            .await;
        self.leave(Action::ExecGpibQuery);
        answer
    }

    pub async fn get_srq_status_byte(&mut self) -> CallAnswer<u8> {
        if let Some(ret) = self.enter(Action::GetSrqStatusByte) {
            return CallAnswer { ret, value: None };
        }
        let answer = self
            .forward(FuncAvailability::GETSRQSTATUSBYTE, |cx| {
                Box::pin(async move { Attempt::Done(cx.plugin.get_srq_status_byte().await) })
            })
            .await;
        self.leave(Action::GetSrqStatusByte);
        answer
    }
}
