//! Framework dispatch against a scripted plugin.

use async_trait::async_trait;
use parking_lot::Mutex;
use ph_core::config::{BinMappingMode, TimeoutAction};
use ph_core::state::{DriverMode, Level};
use ph_core::{
    Estate, FuncAvailability, FuncError, FuncResult, HandlerConfig, HandlerPlugin, PluginContext,
    SiteUsage,
};
use ph_frame::tester::{SITE_INSERTED_TO_TEST, SITE_NOT_INSERTED};
use ph_frame::{
    CallReturn, Frame, PolicyEvents, SimulatedTester, SiteFlag, SystemFlag, Tester,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

/// Plugin whose results are scripted per operation.
struct Scripted {
    estate: Estate,
    start: Mutex<VecDeque<FuncResult>>,
    population: Vec<SiteUsage>,
    bins: Mutex<Vec<Vec<i64>>>,
    start_calls: Mutex<usize>,
    /// Simulated time each pending get_start takes.
    heartbeat: Duration,
}

impl Scripted {
    fn new(estate: Estate, population: Vec<SiteUsage>, start: Vec<FuncResult>) -> Self {
        Self {
            estate,
            start: Mutex::new(start.into()),
            population,
            bins: Mutex::new(Vec::new()),
            start_calls: Mutex::new(0),
            heartbeat: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl HandlerPlugin for Scripted {
    fn availability(&self) -> FuncAvailability {
        FuncAvailability::MINIMUM
            | FuncAvailability::COMMTEST
            | FuncAvailability::LOT_START
            | FuncAvailability::LOT_DONE
    }

    async fn comm_test(&self) -> FuncResult<bool> {
        Ok(true)
    }

    async fn lot_start(&self, _param: &str) -> FuncResult {
        Ok(())
    }

    async fn lot_done(&self, _param: &str) -> FuncResult {
        Ok(())
    }

    async fn get_start(&self) -> FuncResult {
        *self.start_calls.lock() += 1;
        let next = self.start.lock().pop_front().unwrap_or(Ok(()));
        match next {
            Ok(()) => {
                self.estate.set_sites(&self.population).map_err(|_| FuncError::Fatal)?;
                Ok(())
            }
            Err(FuncError::Waiting) => {
                tokio::time::sleep(self.heartbeat).await;
                Err(FuncError::Waiting)
            }
            Err(e) => Err(e),
        }
    }

    async fn bin_device(&self, bins: &[i64]) -> FuncResult {
        self.bins.lock().push(bins.to_vec());
        self.estate.mark_binned();
        Ok(())
    }
}

struct Cell {
    frame: Frame,
    plugin: Arc<Scripted>,
    tester: Arc<SimulatedTester>,
}

fn two_sites() -> HandlerConfig {
    HandlerConfig {
        driver_plugin: "scripted".into(),
        handler_site_ids: vec!["A".into(), "B".into()],
        ..Default::default()
    }
}

fn cell(config: HandlerConfig, start: Vec<FuncResult>) -> Cell {
    let ctx = PluginContext::new(config);
    let plugin = Arc::new(Scripted::new(
        ctx.estate.clone(),
        vec![SiteUsage::Populated, SiteUsage::Empty],
        start,
    ));
    let tester = Arc::new(SimulatedTester::new());
    let frame = Frame::new(
        ctx,
        plugin.clone(),
        tester.clone(),
        Arc::new(PolicyEvents::new()),
    );
    Cell {
        frame,
        plugin,
        tester,
    }
}

async fn into_lot(frame: &mut Frame) {
    assert_eq!(frame.driver_start().await, CallReturn::Pass);
    assert_eq!(frame.lot_start("").await, CallReturn::Pass);
    assert_eq!(frame.level(), Level::LotStarted);
}

#[tokio::test]
async fn device_cycle_bins_mapped_hardbins() {
    let config = HandlerConfig {
        bin_mapping: BinMappingMode::MappedHardbins,
        handler_bin_ids: vec!["pass".into(), "fail".into()],
        hardbin_to_handler_bin_map: vec![vec![1], vec![2, 3]],
        ..two_sites()
    };
    let Cell {
        mut frame,
        plugin,
        tester,
    } = cell(config, vec![]);
    into_lot(&mut frame).await;

    assert_eq!(frame.device_start().await, CallReturn::Pass);
    assert_eq!(frame.level(), Level::DeviceStarted);
    assert_eq!(tester.site_flag(SiteFlag::SiteSetup, 1), Ok(SITE_INSERTED_TO_TEST));
    assert_eq!(tester.site_flag(SiteFlag::SiteSetup, 2), Ok(SITE_NOT_INSERTED));

    tester.set_result(1, 3, "3", false);
    assert_eq!(frame.device_done().await, CallReturn::Pass);
    assert_eq!(frame.level(), Level::DeviceDone);
    assert_eq!(plugin.bins.lock().clone(), vec![vec![1, -1]]);
    assert_eq!(tester.site_flag(SiteFlag::SiteSetup, 1), Ok(SITE_NOT_INSERTED));

    assert_eq!(frame.lot_done("").await, CallReturn::Pass);
    assert_eq!(frame.driver_done().await, CallReturn::Pass);
    assert_eq!(frame.level(), Level::DriverDone);
}

#[tokio::test]
async fn bad_bin_configuration_aborts_driver_start() {
    let config = HandlerConfig {
        bin_mapping: BinMappingMode::MappedHardbins,
        ..two_sites()
    };
    let Cell {
        mut frame, tester, ..
    } = cell(config, vec![]);
    assert_eq!(frame.driver_start().await, CallReturn::Error);
    assert!(tester.is_set(SystemFlag::Abort));

    // every further call is refused
    assert_eq!(frame.lot_start("").await, CallReturn::Pass);
    assert_eq!(frame.level(), Level::Start);
}

#[tokio::test(start_paused = true)]
async fn waiting_repeats_get_start() {
    let Cell {
        mut frame, plugin, ..
    } = cell(
        two_sites(),
        vec![Err(FuncError::Waiting), Err(FuncError::Waiting), Ok(())],
    );
    into_lot(&mut frame).await;
    assert_eq!(frame.device_start().await, CallReturn::Pass);
    assert_eq!(*plugin.start_calls.lock(), 3);
}

#[tokio::test(start_paused = true)]
async fn parts_timeout_with_skip_completes_call() {
    let config = HandlerConfig {
        waiting_for_parts_timeout: Some(12.0),
        waiting_for_parts_timeout_action: Some(TimeoutAction::Skip),
        ..two_sites()
    };
    let Cell {
        mut frame, plugin, ..
    } = cell(config, vec![Err(FuncError::Waiting); 50]);
    into_lot(&mut frame).await;

    assert_eq!(frame.device_start().await, CallReturn::Pass);
    // 5 s per heartbeat, the third one exceeds 12 s
    assert_eq!(*plugin.start_calls.lock(), 3);
    assert_eq!(frame.level(), Level::DeviceStarted);
}

#[tokio::test]
async fn lot_done_during_device_start_keeps_level() {
    let Cell { mut frame, .. } = cell(two_sites(), vec![Err(FuncError::LotDone)]);
    into_lot(&mut frame).await;
    assert_eq!(frame.device_start().await, CallReturn::LotDone);
    assert_eq!(frame.level(), Level::LotStarted);
    assert_eq!(frame.lot_done("").await, CallReturn::Pass);
}

#[tokio::test]
async fn unhandled_interface_problem_is_an_error() {
    let Cell { mut frame, .. } = cell(two_sites(), vec![Err(FuncError::Gpib)]);
    into_lot(&mut frame).await;
    assert_eq!(frame.device_start().await, CallReturn::Error);
    assert_eq!(frame.level(), Level::LotStarted);
}

#[tokio::test]
async fn lan_problem_raises_abort() {
    let Cell {
        mut frame, tester, ..
    } = cell(two_sites(), vec![Err(FuncError::Lan)]);
    into_lot(&mut frame).await;
    frame.device_start().await;
    assert!(tester.is_set(SystemFlag::Abort));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn abort_flag_stops_waiting() {
    let Cell {
        mut frame,
        plugin,
        tester,
    } = cell(two_sites(), vec![Err(FuncError::Waiting); 10]);
    into_lot(&mut frame).await;

    tester.raise(SystemFlag::Abort, true);
    // refused at entry, the plugin is never asked
    assert_eq!(frame.device_start().await, CallReturn::Pass);
    assert_eq!(*plugin.start_calls.lock(), 0);
    assert!(logs_contain("driver aborts already"));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn reset_flag_stops_waiting() {
    let Cell {
        mut frame,
        plugin,
        tester,
    } = cell(two_sites(), vec![Err(FuncError::Waiting); 10]);
    into_lot(&mut frame).await;

    tester.raise(SystemFlag::Reset, true);
    assert_eq!(frame.device_start().await, CallReturn::Pass);
    assert_eq!(*plugin.start_calls.lock(), 1);
    assert!(logs_contain("aborting current operation due to set system flags"));
}

#[tokio::test]
async fn retest_bin_retests_in_place() {
    let config = HandlerConfig {
        handler_retest_bins: vec![5],
        auto_reprobe_on_retest_device: Some(true),
        ..two_sites()
    };
    let Cell {
        mut frame,
        plugin,
        tester,
    } = cell(config, vec![]);
    into_lot(&mut frame).await;

    assert_eq!(frame.device_start().await, CallReturn::Pass);
    tester.set_result(1, 5, "5", false);
    assert_eq!(frame.device_done().await, CallReturn::Pass);
    assert!(plugin.bins.lock().is_empty());

    // retest: no new devices are requested
    assert_eq!(frame.device_start().await, CallReturn::Pass);
    assert_eq!(*plugin.start_calls.lock(), 1);

    // second round bins
    assert_eq!(frame.device_done().await, CallReturn::Pass);
    assert_eq!(plugin.bins.lock().clone(), vec![vec![5, -1]]);
}

#[tokio::test]
#[traced_test]
async fn missing_tester_bin_raises_a_panic() {
    let Cell {
        mut frame, tester, ..
    } = cell(two_sites(), vec![]);
    into_lot(&mut frame).await;
    assert_eq!(frame.device_start().await, CallReturn::Pass);

    // site 1 holds a device but the tester recorded no bin for it
    frame.device_done().await;
    assert!(logs_contain("couldn't get bin number from SmarTest"));
    assert!(!tester.is_set(SystemFlag::Quit));
}

#[tokio::test]
async fn missing_tester_bin_can_quit() {
    let ctx = PluginContext::new(two_sites());
    let plugin = Arc::new(Scripted::new(
        ctx.estate.clone(),
        vec![SiteUsage::Populated, SiteUsage::Empty],
        vec![],
    ));
    let tester = Arc::new(SimulatedTester::new());
    let mut frame = Frame::new(
        ctx,
        plugin.clone(),
        tester.clone(),
        Arc::new(PolicyEvents::new().quit_on_panic(true)),
    );
    into_lot(&mut frame).await;
    assert_eq!(frame.device_start().await, CallReturn::Pass);

    assert_eq!(frame.device_done().await, CallReturn::Error);
    assert!(tester.is_set(SystemFlag::Quit));
    assert!(plugin.bins.lock().is_empty());
}

#[tokio::test]
async fn hand_test_bypasses_the_plugin() {
    let Cell {
        mut frame,
        plugin,
        tester,
    } = cell(two_sites(), vec![]);
    into_lot(&mut frame).await;

    assert_eq!(frame.handtest_start().await, CallReturn::Pass);
    assert_eq!(frame.state().driver_mode(), DriverMode::Hand);
    // already in hand test
    assert_eq!(frame.handtest_start().await, CallReturn::Pass);

    assert_eq!(frame.device_start().await, CallReturn::Pass);
    assert_eq!(*plugin.start_calls.lock(), 0);
    assert_eq!(frame.estate().sites(), vec![SiteUsage::Populated; 2]);

    tester.set_result(1, 1, "1", true);
    tester.set_result(2, 2, "2", false);
    assert_eq!(frame.device_done().await, CallReturn::Pass);
    assert!(plugin.bins.lock().is_empty());
    assert_eq!(frame.device_bins(), &[1, 2]);
    assert_eq!(frame.estate().sites(), vec![SiteUsage::Empty; 2]);

    assert_eq!(frame.handtest_stop().await, CallReturn::Pass);
    assert_eq!(frame.state().driver_mode(), DriverMode::Normal);
}

#[tokio::test]
async fn unavailable_operations_pass_without_plugin_call() {
    let Cell { mut frame, .. } = cell(two_sites(), vec![]);
    into_lot(&mut frame).await;
    let answer = frame.get_status("name").await;
    assert_eq!(answer.ret, CallReturn::Pass);
    assert_eq!(answer.value, None);

    let answer = frame.comm_test().await;
    assert_eq!(answer.value, Some(true));
}
