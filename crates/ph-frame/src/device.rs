//! Device start, device done and reprobe.

use crate::event::Attempt;
use crate::frame::{CallReturn, Frame, OperatorQuit};
use crate::tester::{SiteFlag, SITE_INSERTED_TO_TEST, SITE_NOT_INSERTED};
use ph_core::binner::BinChoice;
use ph_core::config::{BinMappingMode, ReprobeMode};
use ph_core::state::{Action, Level, SkipMode, TesterMode};
use ph_core::{FuncAvailability, SiteUsage};
use tracing::{debug, error, info, instrument, warn};

impl Frame {
    /// Wait for the handler to deliver devices.
    ///
    /// Returns [`CallReturn::LotDone`] when the handler ended the lot instead
    /// of delivering devices; the level is not changed in that case. Any
    /// other non-pass outcome is reported as an error.
    #[instrument(skip(self))]
    pub async fn device_start(&mut self) -> CallReturn {
        if let Some(ret) = self.enter(Action::DeviceStart) {
            return ret;
        }
        match self.run_device_start().await {
            CallReturn::Pass => {}
            CallReturn::LotDone => {
                info!("device start detected end of lot, will exit level");
                return CallReturn::LotDone;
            }
            other => {
                error!(?other, "device start did not pass");
                return CallReturn::Error;
            }
        }
        info!("device start detected");
        self.leave(Action::DeviceStart);
        CallReturn::Pass
    }

    /// Bin the tested devices.
    #[instrument(skip(self))]
    pub async fn device_done(&mut self) -> CallReturn {
        if let Some(ret) = self.enter(Action::DeviceDone) {
            return ret;
        }
        let ret = self.run_device_done().await;
        if ret != CallReturn::Pass {
            error!(?ret, "device done did not pass");
            return CallReturn::Error;
        }
        self.leave(Action::DeviceDone);
        CallReturn::Pass
    }

    async fn run_device_start(&mut self) -> CallReturn {
        let (label, auto_reprobe) = match self.state.tester_mode() {
            TesterMode::Normal => ("", None),
            TesterMode::Retest => ("retesting", self.config.auto_reprobe_on_retest_device),
            TesterMode::Check => ("checking", self.config.auto_reprobe_on_check_device),
        };
        if !label.is_empty() {
            info!("{} device(s), no new devices are requested from the handler now", label);
            if self.set_site_setup().is_err() {
                return CallReturn::Error;
            }
            return if auto_reprobe == Some(true) {
                self.try_reprobe().await
            } else {
                CallReturn::Pass
            };
        }

        self.restart_timers();
        let mut ret = CallReturn::Pass;
        let driven = self
            .drive(FuncAvailability::START, &mut ret, |cx| {
                Box::pin(async move {
                    if cx.hand {
                        info!("waiting for device(s) in hand test mode");
                        cx.events.handtest_get_start(&cx.estate)
                    } else {
                        Attempt::Done(cx.plugin.get_start().await)
                    }
                })
            })
            .await;
        let success = match driven {
            Ok(d) => d.success,
            Err(value) => return value,
        };
        info!(elapsed = ?self.total_timer.elapsed(), "stopped waiting for device(s)");

        if success {
            info!("got device(s)");
            if self.set_site_setup().is_err() {
                ret = CallReturn::Error;
            }
        }
        ret
    }

    async fn run_device_done(&mut self) -> CallReturn {
        let mode = self.current_tester_mode();
        if mode != TesterMode::Normal {
            info!(?mode, "device(s) scheduled for retest or check, no devices are binned now");
            return CallReturn::Pass;
        }

        if self.prepare_binning().is_err() {
            return CallReturn::Error;
        }

        self.restart_timers();
        let mut ret = CallReturn::Pass;
        let bins = self.device_bins.clone();
        let driven = self
            .drive(FuncAvailability::BIN, &mut ret, move |cx| {
                let bins = bins.clone();
                Box::pin(async move {
                    if cx.hand {
                        info!("binning device(s) in hand test mode");
                        cx.events.handtest_bin(&cx.estate, &bins)
                    } else {
                        Attempt::Done(cx.plugin.bin_device(&bins).await)
                    }
                })
            })
            .await;
        let success = match driven {
            Ok(d) => d.success,
            Err(value) => return value,
        };
        info!(elapsed = ?self.total_timer.elapsed(), "stopped binning device(s)");

        if success {
            info!("binned device(s)");
            self.clear_site_setup();
        } else {
            error!("binning device(s) stopped unsuccessfully");
        }
        ret
    }

    /// Reprobe after an explicit request or implicitly during a device cycle.
    pub(crate) async fn try_reprobe(&mut self) -> CallReturn {
        let implicit = match self.state.level() {
            Level::DeviceStarted | Level::DeviceDone => true,
            Level::PauseStarted => false,
            _ => {
                warn!("reprobe called while not expected, trying to reprobe all devices");
                false
            }
        };
        let mode = self.config.automatic_reprobe_mode;
        if implicit && mode == ReprobeMode::Off {
            warn!("reprobe is not performed, automatic_reprobe_mode is off");
            return CallReturn::Pass;
        }

        self.restart_timers();
        let mut ret = CallReturn::Pass;
        let mut success = false;

        if !implicit || mode == ReprobeMode::All {
            if self.availability.contains(FuncAvailability::REPROBE) {
                let mut back_to_pause = false;
                if self.estate.paused() && self.availability.contains(FuncAvailability::UNPAUSE) {
                    let driven = self
                        .drive(FuncAvailability::UNPAUSE, &mut ret, |cx| {
                            Box::pin(async move { Attempt::Done(cx.plugin.unpause().await) })
                        })
                        .await;
                    if let Err(value) = driven {
                        return value;
                    }
                    back_to_pause = true;
                }

                let driven = self
                    .drive(FuncAvailability::REPROBE, &mut ret, |cx| {
                        Box::pin(async move {
                            if cx.hand {
                                debug!("reprobing device(s) in hand test mode");
                                cx.events.handtest_reprobe(&cx.estate)
                            } else {
                                Attempt::Done(cx.plugin.reprobe().await)
                            }
                        })
                    })
                    .await;
                match driven {
                    Ok(d) => success = d.success,
                    Err(value) => return value,
                }

                if back_to_pause && self.availability.contains(FuncAvailability::PAUSE) {
                    let driven = self
                        .drive(FuncAvailability::PAUSE, &mut ret, |cx| {
                            Box::pin(async move { Attempt::Done(cx.plugin.pause().await) })
                        })
                        .await;
                    if let Err(value) = driven {
                        return value;
                    }
                }
            } else {
                warn!("reprobe is not available for the current handler driver");
            }
        } else if self.availability.contains(FuncAvailability::BINREPR) {
            if self.prepare_reprobe_binning().is_err() {
                return CallReturn::Error;
            }
            let to_reprobe = self.device_to_reprobe.clone();
            let bins = self.device_bins.clone();
            let driven = self
                .drive(FuncAvailability::BINREPR, &mut ret, move |cx| {
                    let to_reprobe = to_reprobe.clone();
                    let bins = bins.clone();
                    Box::pin(async move {
                        if cx.hand {
                            debug!("binning and reprobing device(s) in hand test mode");
                            cx.events.handtest_bin_reprobe(&cx.estate, &to_reprobe, &bins)
                        } else {
                            Attempt::Done(cx.plugin.bin_reprobe(&to_reprobe, &bins).await)
                        }
                    })
                })
                .await;
            match driven {
                Ok(d) => success = d.success,
                Err(value) => return value,
            }
        } else {
            warn!("reprobe with implicit binning is not available for the current handler driver");
        }

        info!(elapsed = ?self.total_timer.elapsed(), "stopped reprobing device(s)");
        if success {
            info!("reprobed device(s)");
            if self.set_site_setup().is_err() {
                ret = CallReturn::Error;
            }
        } else if implicit {
            error!("reprobing device(s) stopped unsuccessfully, will enter pause");
            self.tester.raise(crate::tester::SystemFlag::Pause, true);
        } else {
            error!("reprobing device(s) stopped unsuccessfully");
        }
        ret
    }

    /// Tester mode for device done. With `auto_reprobe_on_retest_device`
    /// a device headed for the retest bin is retested in place, up to
    /// `handler_retest_count` rounds.
    fn current_tester_mode(&mut self) -> TesterMode {
        let mode = self.state.tester_mode();
        if self.config.auto_reprobe_on_retest_device != Some(true) {
            return mode;
        }

        let max_rounds = self.config.handler_retest_count.unwrap_or(1);
        debug!(
            round = self.retest_rounds + 1,
            max_rounds, "checking for automatic retest"
        );
        if self.retest_rounds >= max_rounds {
            self.retest_rounds = 0;
            return mode;
        }

        let retest_bin = if self.bins.retest_defined() {
            match self.bins.retest_bin() {
                Some(bin) => bin,
                None => return mode,
            }
        } else {
            -1
        };

        let sites = self.estate.sites();
        for (site, usage) in sites.iter().enumerate() {
            if !matches!(usage, SiteUsage::Empty | SiteUsage::Populated) {
                continue;
            }
            let Some(&st_site) = self.smartest_sites.get(site) else {
                continue;
            };
            let Ok(result) = self.tester.bin_of_site(st_site) else {
                return mode;
            };
            let handler_bin = match self.bins.mode() {
                BinMappingMode::Default => result.number,
                _ => match self.bins.choose(result.number, &result.code) {
                    BinChoice::Mapped(bin) => bin,
                    _ => return mode,
                },
            };
            if handler_bin == retest_bin {
                self.state.set_tester_mode(TesterMode::Retest);
                self.retest_rounds += 1;
                info!(site = site + 1, "device binned to retest bin, retesting in place");
                return TesterMode::Retest;
            }
        }
        mode
    }

    fn prepare_binning(&mut self) -> Result<(), OperatorQuit> {
        let skip = self.state.skip_mode();
        let sites = self.estate.sites();
        let mut bin_panic = false;
        for (site, usage) in sites.iter().enumerate() {
            self.prepare_bin_one_site(site, skip, *usage, &mut bin_panic)?;
        }
        self.report_bin_panic(bin_panic)
    }

    fn prepare_reprobe_binning(&mut self) -> Result<(), OperatorQuit> {
        let skip = self.state.skip_mode();
        let sites = self.estate.sites();
        let mut bin_panic = false;
        for (site, usage) in sites.iter().enumerate() {
            self.prepare_reprobe_one_site(site, skip, *usage)?;
            if !self.device_to_reprobe[site] {
                self.prepare_bin_one_site(site, skip, *usage, &mut bin_panic)?;
            }
        }
        self.report_bin_panic(bin_panic)
    }

    fn report_bin_panic(&self, bin_panic: bool) -> Result<(), OperatorQuit> {
        if bin_panic {
            self.panic(
                "Couldn't determine correct handler bin for device(s). \
                 On CONTINUE the device(s) are binned to the handler's default retest bin, if existent.",
            )?;
        }
        Ok(())
    }

    fn prepare_bin_one_site(
        &mut self,
        site: usize,
        skip: SkipMode,
        usage: SiteUsage,
        bin_panic: &mut bool,
    ) -> Result<(), OperatorQuit> {
        let st_site = self.smartest_sites.get(site).copied().unwrap_or(site as i64 + 1);
        let mut passed = true;

        let bin = match (usage.holds_device(), skip) {
            (false, _) => -1,
            (true, SkipMode::Normal | SkipMode::Next) => {
                passed = match self.tester.site_flag(SiteFlag::GoodPart, st_site) {
                    Ok(v) => v != 0,
                    Err(e) => {
                        warn!("{}", e);
                        self.panic("couldn't get pass/fail result from SmarTest, assuming 'passed'")?;
                        true
                    }
                };
                let (number, code) = match self.tester.bin_of_site(st_site) {
                    Ok(result) => (result.number, result.code),
                    Err(e) => {
                        warn!("{}", e);
                        self.panic("couldn't get bin number from SmarTest")?;
                        (-1, String::from("db"))
                    }
                };
                match self.bins.choose(number, &code) {
                    BinChoice::Unmapped => {
                        *bin_panic = true;
                        -1
                    }
                    choice => choice.bin(),
                }
            }
            (true, SkipMode::Current | SkipMode::NextCurrent) => match self.bins.retest_bin() {
                Some(bin) => bin,
                None => {
                    error!(site = site + 1, "skipped device can not be binned to a retest bin");
                    *bin_panic = true;
                    -1
                }
            },
        };

        if let Some(slot) = self.device_bins.get_mut(site) {
            *slot = bin;
        }
        debug!(
            site = %self.config.handler_site_ids.get(site).map(String::as_str).unwrap_or("?"),
            smartest_site = st_site,
            ?usage,
            passed,
            bin,
            "bin data of site"
        );
        Ok(())
    }

    fn prepare_reprobe_one_site(
        &mut self,
        site: usize,
        skip: SkipMode,
        usage: SiteUsage,
    ) -> Result<(), OperatorQuit> {
        let st_site = self.smartest_sites.get(site).copied().unwrap_or(site as i64 + 1);
        let reprobe = match (usage.holds_device(), skip) {
            (true, SkipMode::Normal | SkipMode::Next) => {
                match self.tester.site_flag(SiteFlag::Reprobe, st_site) {
                    Ok(v) => v != 0,
                    Err(e) => {
                        warn!("{}", e);
                        self.panic("couldn't get reprobe flag from SmarTest, assuming 'don't reprobe'")?;
                        false
                    }
                }
            }
            _ => false,
        };
        if let Some(slot) = self.device_to_reprobe.get_mut(site) {
            *slot = reprobe;
        }
        debug!(site = site + 1, ?usage, reprobe, "reprobe data of site");
        Ok(())
    }

    /// Tell the tester which sites hold devices.
    fn set_site_setup(&mut self) -> Result<(), OperatorQuit> {
        let sites = self.estate.sites();
        if sites.len() != self.smartest_sites.len() {
            self.panic("the driver's internal site control is inconsistent")?;
        }
        for (site, usage) in sites.iter().enumerate() {
            let Some(&st_site) = self.smartest_sites.get(site) else {
                continue;
            };
            let value = if usage.holds_device() {
                debug!(site = site + 1, smartest_site = st_site, "handler site populated");
                SITE_INSERTED_TO_TEST
            } else {
                debug!(site = site + 1, smartest_site = st_site, "handler site currently not used");
                SITE_NOT_INSERTED
            };
            if let Err(e) = self.tester.set_site_flag(SiteFlag::SiteSetup, st_site, value) {
                warn!("{}", e);
            }
        }
        Ok(())
    }

    fn clear_site_setup(&mut self) {
        for &st_site in &self.smartest_sites {
            if let Err(e) = self
                .tester
                .set_site_flag(SiteFlag::SiteSetup, st_site, SITE_NOT_INSERTED)
            {
                warn!("{}", e);
            }
        }
    }
}
