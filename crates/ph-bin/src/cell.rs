//! Simulated test cell.
//!
//! Drives a [`Frame`] through one lot the way a test program would: start
//! the driver and the lot, then request devices, "test" them with random
//! pass/fail results and bin them until the handler ends the lot or the
//! device limit is reached.

use anyhow::{bail, Result};
use ph_frame::tester::SITE_INSERTED_TO_TEST;
use ph_frame::{CallReturn, Frame, SimulatedTester, SiteFlag, Tester};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

pub const PASS_BIN: i64 = 1;
pub const FAIL_BIN: i64 = 2;

#[derive(Debug, Clone)]
pub struct CellOptions {
    pub lot_id: String,
    /// Stop after this many device cycles.
    pub cycles: Option<u64>,
    pub pass_rate: f64,
    pub seed: Option<u64>,
}

impl Default for CellOptions {
    fn default() -> Self {
        Self {
            lot_id: String::new(),
            cycles: None,
            pass_rate: 0.9,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellSummary {
    pub cycles: u64,
    pub tested: u64,
    pub passed: u64,
    /// The handler ended the lot on its own.
    pub lot_done: bool,
}

fn expect_pass(step: &str, ret: CallReturn) -> Result<()> {
    if ret != CallReturn::Pass {
        bail!("{} returned {:?}", step, ret);
    }
    Ok(())
}

/// Run one lot on `frame`. `tester` must be the tester the frame was opened with.
pub async fn run_lot(
    frame: &mut Frame,
    tester: &SimulatedTester,
    options: &CellOptions,
) -> Result<CellSummary> {
    if !(0.0..=1.0).contains(&options.pass_rate) {
        bail!("pass rate must be between 0.0 and 1.0, got {}", options.pass_rate);
    }
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let sites = frame.config().smartest_sites();
    let mut summary = CellSummary::default();

    expect_pass("driver start", frame.driver_start().await)?;
    expect_pass("lot start", frame.lot_start(&options.lot_id).await)?;
    info!(lot = %options.lot_id, "lot started");

    loop {
        if options.cycles.is_some_and(|limit| summary.cycles >= limit) {
            info!(cycles = summary.cycles, "device limit reached");
            break;
        }
        match frame.device_start().await {
            CallReturn::Pass => {}
            CallReturn::LotDone => {
                summary.lot_done = true;
                break;
            }
            other => bail!("device start returned {:?}", other),
        }
        summary.cycles += 1;

        tester.clear_results();
        for &site in &sites {
            if tester.site_flag(SiteFlag::SiteSetup, site) != Ok(SITE_INSERTED_TO_TEST) {
                continue;
            }
            let passed = rng.gen_bool(options.pass_rate);
            let (bin, code) = if passed {
                (PASS_BIN, "PASS")
            } else {
                (FAIL_BIN, "FAIL")
            };
            tester.set_result(site, bin, code, passed);
            summary.tested += 1;
            summary.passed += u64::from(passed);
        }
        debug!(cycle = summary.cycles, bins = ?frame.device_bins(), "devices tested");
        expect_pass("device done", frame.device_done().await)?;
    }

    if frame.lot_done(&options.lot_id).await != CallReturn::Pass {
        warn!("lot done did not pass");
    }
    expect_pass("driver done", frame.driver_done().await)?;
    frame.shutdown().await;
    info!(
        cycles = summary.cycles,
        tested = summary.tested,
        passed = summary.passed,
        "lot finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ph_core::HandlerConfig;
    use ph_frame::{PluginRegistry, PolicyEvents};
    use std::sync::Arc;

    async fn mock_frame(config: &str) -> (Frame, Arc<SimulatedTester>) {
        let registry = PluginRegistry::new();
        ph_driver_mock::register(&registry);
        let config = HandlerConfig::from_toml_str(config).unwrap();
        let tester = Arc::new(SimulatedTester::new());
        let frame = registry
            .open_frame(config, tester.clone(), Arc::new(PolicyEvents::new()))
            .await
            .unwrap();
        (frame, tester)
    }

    #[tokio::test]
    async fn handler_ends_the_lot() {
        let (mut frame, tester) = mock_frame(
            r#"
            driver_plugin = "mock"
            model = "mock"
            handler_site_ids = ["1", "2", "3", "4"]
            mock_lot_size = 8
            "#,
        )
        .await;
        let options = CellOptions {
            pass_rate: 1.0,
            ..CellOptions::default()
        };
        let summary = run_lot(&mut frame, &tester, &options).await.unwrap();
        assert_eq!(
            summary,
            CellSummary {
                cycles: 2,
                tested: 8,
                passed: 8,
                lot_done: true,
            }
        );
    }

    #[tokio::test]
    async fn cycle_limit_and_failing_devices() {
        let (mut frame, tester) = mock_frame(
            r#"
            driver_plugin = "mock"
            model = "mock"
            handler_site_ids = ["1", "2"]
            "#,
        )
        .await;
        let options = CellOptions {
            cycles: Some(3),
            pass_rate: 0.0,
            seed: Some(7),
            ..CellOptions::default()
        };
        let summary = run_lot(&mut frame, &tester, &options).await.unwrap();
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.tested, 6);
        assert_eq!(summary.passed, 0);
        assert!(!summary.lot_done);
        assert_eq!(frame.device_bins(), &[FAIL_BIN, FAIL_BIN]);
    }

    #[tokio::test]
    async fn pass_rate_is_checked() {
        let (mut frame, tester) = mock_frame(
            r#"
            driver_plugin = "mock"
            model = "mock"
            handler_site_ids = ["1"]
            "#,
        )
        .await;
        let options = CellOptions {
            pass_rate: 1.5,
            ..CellOptions::default()
        };
        assert!(run_lot(&mut frame, &tester, &options).await.is_err());
    }
}
