//! Simulated handler plugin and its factory.
//!
//! Configuration keys (all optional, beside the common handler keys):
//!
//! | key                   | meaning                                              |
//! |-----------------------|------------------------------------------------------|
//! | `mock_seed`           | RNG seed for reproducible runs                       |
//! | `mock_fill_rate`      | chance that an active site receives a device (1.0)   |
//! | `mock_population`     | scripted populations, `"1,0,1;0,1,1"`, cycled        |
//! | `mock_lot_size`       | devices per lot, then `LotDone`                      |
//! | `mock_index_time`     | simulated handler index time in ms (0)               |
//! | `mock_failure_rate`   | chance of a random `Answer` failure per call         |
//! | `mock_jam_after`      | device requests before a jam is reported             |
//! | `mock_comm_loss_after`| device requests before the handler goes silent      |

use crate::errors::{ErrorConfig, ErrorScenario};
use crate::rng::MockRng;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use ph_core::estate::{population_after_reprobe, population_from_pending};
use ph_core::{
    FuncAvailability, FuncError, FuncResult, HandlerConfig, HandlerPlugin, PluginContext,
    PluginFactory, StatRequest,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

// =============================================================================
// MockFactory - PluginFactory implementation
// =============================================================================

static MODELS: &[&str] = &["MOCK"];

/// Factory for simulated handlers.
pub struct MockFactory;

impl PluginFactory for MockFactory {
    fn driver_type(&self) -> &'static str {
        "mock"
    }

    fn name(&self) -> &'static str {
        "Simulated handler"
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn availability(&self) -> FuncAvailability {
        MockPlugin::AVAILABILITY
    }

    fn validate(&self, config: &HandlerConfig) -> Result<()> {
        ph_core::plugin::check_model(&config.model, MODELS)?;
        Settings::from_config(config)?;
        Ok(())
    }

    fn build(&self, ctx: PluginContext) -> BoxFuture<'static, Result<Arc<dyn HandlerPlugin>>> {
        Box::pin(async move {
            let settings =
                Settings::from_config(&ctx.config).context("invalid mock handler settings")?;
            info!(seed = ?settings.seed, "simulated handler ready");
            Ok(Arc::new(MockPlugin::new(ctx, settings)) as Arc<dyn HandlerPlugin>)
        })
    }
}

// =============================================================================
// MockPlugin
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub seed: Option<u64>,
    pub fill_rate: f64,
    pub script: Vec<Vec<bool>>,
    pub lot_size: Option<u64>,
    pub index_time: Duration,
    pub failure_rate: f64,
    pub jam_after: Option<u32>,
    pub comm_loss_after: Option<u32>,
    pub active: Vec<bool>,
}

fn non_negative(config: &HandlerConfig, key: &str) -> Result<Option<f64>> {
    match config.extra_f64(key) {
        Some(v) if v < 0.0 => anyhow::bail!("{} must not be negative, got {}", key, v),
        other => Ok(other),
    }
}

fn rate(config: &HandlerConfig, key: &str, default: f64) -> Result<f64> {
    let value = non_negative(config, key)?.unwrap_or(default);
    if value > 1.0 {
        anyhow::bail!("{} must be between 0.0 and 1.0, got {}", key, value);
    }
    Ok(value)
}

/// Parse `"1,0,1;0,1,1"` into one population per device cycle.
fn parse_script(script: &str, sites: usize) -> Result<Vec<Vec<bool>>> {
    script
        .split(';')
        .map(str::trim)
        .filter(|cycle| !cycle.is_empty())
        .enumerate()
        .map(|(n, cycle)| {
            let flags = cycle
                .split(',')
                .map(|flag| match flag.trim() {
                    "1" => Ok(true),
                    "0" => Ok(false),
                    other => anyhow::bail!("population {}: '{}' is neither 0 nor 1", n + 1, other),
                })
                .collect::<Result<Vec<bool>>>()?;
            if flags.len() != sites {
                anyhow::bail!(
                    "population {} has {} entries but {} sites are configured",
                    n + 1,
                    flags.len(),
                    sites
                );
            }
            Ok(flags)
        })
        .collect()
}

impl Settings {
    pub fn from_config(config: &HandlerConfig) -> Result<Self> {
        let count = |key: &str| -> Result<Option<u32>> {
            Ok(non_negative(config, key)?.map(|v| v as u32))
        };
        let script = match config.extra_str("mock_population") {
            Some(script) => parse_script(script, config.site_count())?,
            None => Vec::new(),
        };
        Ok(Self {
            seed: non_negative(config, "mock_seed")?.map(|v| v as u64),
            fill_rate: rate(config, "mock_fill_rate", 1.0)?,
            script,
            lot_size: non_negative(config, "mock_lot_size")?
                .map(|v| v as u64)
                .filter(|n| *n > 0),
            index_time: Duration::from_secs_f64(
                non_negative(config, "mock_index_time")?.unwrap_or(0.0) / 1000.0,
            ),
            failure_rate: rate(config, "mock_failure_rate", 0.0)?,
            jam_after: count("mock_jam_after")?,
            comm_loss_after: count("mock_comm_loss_after")?,
            active: config.active_sites(),
        })
    }
}

/// Binnings kept for [`MockPlugin::bins`].
pub const BIN_HISTORY: usize = 16;

#[derive(Debug, Default)]
struct SimState {
    cycle: usize,
    devices_in_lot: u64,
    devices_total: u64,
    lot_id: String,
    bins: VecDeque<Vec<i64>>,
    values: BTreeMap<String, String>,
}

pub struct MockPlugin {
    ctx: PluginContext,
    settings: Settings,
    rng: Arc<MockRng>,
    errors: ErrorConfig,
    sim: Mutex<SimState>,
}

impl MockPlugin {
    pub const AVAILABILITY: FuncAvailability = FuncAvailability::MINIMUM
        .union(FuncAvailability::RECONFIGURE)
        .union(FuncAvailability::RESET)
        .union(FuncAvailability::DRIVERID)
        .union(FuncAvailability::EQUIPID)
        .union(FuncAvailability::REPROBE)
        .union(FuncAvailability::BINREPR)
        .union(FuncAvailability::PAUSE)
        .union(FuncAvailability::UNPAUSE)
        .union(FuncAvailability::STATUS)
        .union(FuncAvailability::COMMTEST)
        .union(FuncAvailability::LOT_START)
        .union(FuncAvailability::LOT_DONE)
        .union(FuncAvailability::GET_STATUS)
        .union(FuncAvailability::SET_STATUS)
        .union(FuncAvailability::DESTROY);

    pub fn new(ctx: PluginContext, settings: Settings) -> Self {
        let rng = Arc::new(MockRng::new(settings.seed));
        let mut scenarios = Vec::new();
        if let Some(after) = settings.jam_after {
            scenarios.push(ErrorScenario::Jam { after });
        }
        if let Some(after) = settings.comm_loss_after {
            scenarios.push(ErrorScenario::CommunicationLoss { after });
        }
        let mut rates = HashMap::new();
        if settings.failure_rate > 0.0 {
            rates.insert("*", settings.failure_rate);
        }
        let errors = ErrorConfig::build(rates, scenarios, rng.clone());
        Self::with_errors(ctx, settings, rng, errors)
    }

    /// Plugin with explicit error injection.
    pub fn with_errors(
        ctx: PluginContext,
        settings: Settings,
        rng: Arc<MockRng>,
        errors: ErrorConfig,
    ) -> Self {
        Self {
            ctx,
            settings,
            rng,
            errors,
            sim: Mutex::new(SimState {
                lot_id: "1".into(),
                ..SimState::default()
            }),
        }
    }

    /// The last [`BIN_HISTORY`] binnings, oldest first.
    pub fn bins(&self) -> Vec<Vec<i64>> {
        self.sim.lock().bins.iter().cloned().collect()
    }

    fn record_bins(&self, bins: Vec<i64>) {
        let mut sim = self.sim.lock();
        if sim.bins.len() == BIN_HISTORY {
            sim.bins.pop_front();
        }
        sim.bins.push_back(bins);
    }

    fn next_pending(&self) -> Vec<bool> {
        if !self.settings.script.is_empty() {
            let mut sim = self.sim.lock();
            let pending = self.settings.script[sim.cycle % self.settings.script.len()].clone();
            sim.cycle += 1;
            return pending;
        }
        self.rng
            .population(&self.settings.active, self.settings.fill_rate)
    }

    fn store(&self, population: &[ph_core::SiteUsage]) -> FuncResult {
        self.ctx.estate.set_sites(population).map_err(|e| {
            error!("{}", e);
            FuncError::Fatal
        })
    }
}

#[async_trait]
impl HandlerPlugin for MockPlugin {
    fn availability(&self) -> FuncAvailability {
        Self::AVAILABILITY
    }

    async fn reconfigure(&self) -> FuncResult {
        self.ctx.abort.check()
    }

    async fn reset(&self) -> FuncResult {
        self.errors.reset();
        let mut sim = self.sim.lock();
        sim.cycle = 0;
        sim.devices_in_lot = 0;
        Ok(())
    }

    async fn driver_id(&self) -> FuncResult<String> {
        Ok(format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
    }

    async fn equipment_id(&self) -> FuncResult<String> {
        Ok(match self.settings.seed {
            Some(seed) => format!("Simulated handler (seed {})", seed),
            None => "Simulated handler".into(),
        })
    }

    #[instrument(skip(self))]
    async fn get_start(&self) -> FuncResult {
        self.ctx.abort.check()?;
        self.errors.check_operation("get_start")?;
        if !self.settings.index_time.is_zero() {
            tokio::time::sleep(self.settings.index_time).await;
        }

        if let Some(lot_size) = self.settings.lot_size {
            let mut sim = self.sim.lock();
            if sim.devices_in_lot >= lot_size {
                info!(lot = %sim.lot_id, devices = sim.devices_in_lot, "lot complete");
                sim.devices_in_lot = 0;
                drop(sim);
                self.ctx.estate.set_lot_started(false);
                return Err(FuncError::LotDone);
            }
        }

        let pending = self.next_pending();
        let devices = pending.iter().filter(|p| **p).count() as u64;
        if devices == 0 {
            debug!("no device delivered this cycle");
            return Err(FuncError::Waiting);
        }
        {
            let mut sim = self.sim.lock();
            sim.devices_in_lot += devices;
            sim.devices_total += devices;
        }
        debug!(?pending, "devices delivered");
        self.store(&population_from_pending(&pending, &self.settings.active, true))
    }

    #[instrument(skip(self))]
    async fn bin_device(&self, bins: &[i64]) -> FuncResult {
        self.ctx.abort.check()?;
        self.errors.check_operation("bin")?;
        self.record_bins(bins.to_vec());
        self.ctx.estate.mark_binned();
        Ok(())
    }

    async fn reprobe(&self) -> FuncResult {
        let sites = self.settings.active.len();
        self.bin_reprobe(&vec![true; sites], &vec![-1; sites]).await
    }

    #[instrument(skip(self))]
    async fn bin_reprobe(&self, to_reprobe: &[bool], bins: &[i64]) -> FuncResult {
        self.ctx.abort.check()?;
        self.errors.check_operation("bin")?;
        let old = self.ctx.estate.sites();
        let pending: Vec<bool> = old
            .iter()
            .zip(to_reprobe.iter().chain(std::iter::repeat(&false)))
            .map(|(site, reprobe)| *reprobe && site.holds_device())
            .collect();
        let binned: Vec<i64> = bins
            .iter()
            .zip(to_reprobe.iter().chain(std::iter::repeat(&false)))
            .map(|(bin, reprobe)| if *reprobe { -1 } else { *bin })
            .collect();
        self.record_bins(binned);
        self.ctx.estate.set_paused(false);
        self.store(&population_after_reprobe(
            &old,
            &self.settings.active,
            to_reprobe,
            &pending,
        ))
    }

    async fn pause(&self) -> FuncResult {
        self.ctx.estate.set_paused(true);
        Ok(())
    }

    async fn unpause(&self) -> FuncResult {
        self.ctx.estate.set_paused(false);
        Ok(())
    }

    async fn status(&self, request: StatRequest) -> FuncResult<bool> {
        self.ctx.abort.apply(request)
    }

    async fn comm_test(&self) -> FuncResult<bool> {
        self.errors.check_operation("comm_test")?;
        Ok(true)
    }

    async fn lot_start(&self, param: &str) -> FuncResult {
        self.ctx.abort.check()?;
        self.errors.check_operation("lot_start")?;
        {
            let mut sim = self.sim.lock();
            if !param.trim().is_empty() {
                sim.lot_id = param.trim().to_string();
            }
            sim.devices_in_lot = 0;
            info!(lot = %sim.lot_id, "lot started");
        }
        self.ctx.estate.set_lot_started(true);
        Ok(())
    }

    async fn lot_done(&self, _param: &str) -> FuncResult {
        self.ctx.abort.check()?;
        self.errors.check_operation("lot_done")?;
        self.ctx.estate.set_lot_started(false);
        Ok(())
    }

    async fn get_status(&self, key: &str) -> FuncResult<String> {
        let key = key.trim().to_ascii_lowercase();
        let sim = self.sim.lock();
        match key.as_str() {
            "lot_id" => Ok(sim.lot_id.clone()),
            "devices_in_lot" => Ok(sim.devices_in_lot.to_string()),
            "devices_total" => Ok(sim.devices_total.to_string()),
            other => sim.values.get(other).cloned().ok_or(FuncError::NotAvailable),
        }
    }

    async fn set_status(&self, key: &str, value: &str) -> FuncResult {
        let key = key.trim().to_ascii_lowercase();
        let mut sim = self.sim.lock();
        if key == "lot_id" {
            sim.lot_id = value.trim().to_string();
        } else {
            sim.values.insert(key, value.to_string());
        }
        Ok(())
    }

    async fn destroy(&self) -> FuncResult {
        debug!("simulated handler closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ph_core::SiteUsage;

    fn config(extra: toml::Table) -> HandlerConfig {
        let mut value = toml::toml! {
            driver_plugin = "mock"
            model = "mock"
            handler_site_ids = ["1", "2", "3", "4"]
        };
        value.extend(extra);
        HandlerConfig::from_value(toml::Value::Table(value)).unwrap()
    }

    fn plugin(extra: toml::Table) -> MockPlugin {
        let config = config(extra);
        let settings = Settings::from_config(&config).unwrap();
        MockPlugin::new(PluginContext::new(config), settings)
    }

    #[tokio::test]
    async fn full_handler_fills_active_sites() {
        let mut config = config(toml::Table::new());
        config.handler_site_mask = vec![1, 1, 0, 1];
        let settings = Settings::from_config(&config).unwrap();
        let plugin = MockPlugin::new(PluginContext::new(config), settings);
        plugin.get_start().await.unwrap();
        assert_eq!(
            plugin.ctx.estate.sites(),
            vec![
                SiteUsage::Populated,
                SiteUsage::Populated,
                SiteUsage::Deactivated,
                SiteUsage::Populated
            ]
        );
    }

    #[tokio::test]
    async fn same_seed_same_populations() {
        let extra = toml::toml! {
            mock_seed = 1234
            mock_fill_rate = 0.5
        };
        let a = plugin(extra.clone());
        let b = plugin(extra);
        for _ in 0..20 {
            let (ra, rb) = (a.get_start().await, b.get_start().await);
            assert_eq!(ra, rb);
            assert_eq!(a.ctx.estate.sites(), b.ctx.estate.sites());
            if ra.is_ok() {
                a.bin_device(&[1, 1, 1, 1]).await.unwrap();
                b.bin_device(&[1, 1, 1, 1]).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn scripted_populations_cycle() {
        let plugin = plugin(toml::toml! {
            mock_population = "1,0,0,1; 0,0,0,0"
        });
        plugin.get_start().await.unwrap();
        assert_eq!(
            plugin.ctx.estate.sites(),
            vec![
                SiteUsage::Populated,
                SiteUsage::Empty,
                SiteUsage::Empty,
                SiteUsage::Populated
            ]
        );
        plugin.bin_device(&[3, -1, -1, 4]).await.unwrap();
        assert_eq!(plugin.get_start().await, Err(FuncError::Waiting));
        plugin.get_start().await.unwrap();
        assert_eq!(plugin.bins(), vec![vec![3, -1, -1, 4]]);
        assert_eq!(plugin.get_status("devices_total").await.as_deref(), Ok("4"));
    }

    #[tokio::test]
    async fn bin_history_is_bounded() {
        let plugin = plugin(toml::Table::new());
        for bin in 0..40 {
            plugin.get_start().await.unwrap();
            plugin.bin_device(&[bin; 4]).await.unwrap();
        }
        let bins = plugin.bins();
        assert_eq!(bins.len(), BIN_HISTORY);
        assert_eq!(bins.first(), Some(&vec![24; 4]));
        assert_eq!(bins.last(), Some(&vec![39; 4]));
    }

    #[tokio::test]
    async fn lot_ends_after_lot_size() {
        let plugin = plugin(toml::toml! {
            mock_lot_size = 8
        });
        plugin.lot_start("L7").await.unwrap();
        assert!(plugin.ctx.estate.lot_started());
        for _ in 0..2 {
            plugin.get_start().await.unwrap();
            plugin.bin_device(&[1, 1, 1, 1]).await.unwrap();
        }
        assert_eq!(plugin.get_start().await, Err(FuncError::LotDone));
        assert!(!plugin.ctx.estate.lot_started());
        assert_eq!(plugin.get_status("lot_id").await.as_deref(), Ok("L7"));
    }

    #[tokio::test]
    async fn injected_jam_and_loss() {
        let plugin = plugin(toml::toml! {
            mock_jam_after = 1
            mock_comm_loss_after = 3
        });
        assert_eq!(plugin.get_start().await, Ok(()));
        assert_eq!(plugin.get_start().await, Err(FuncError::Jam));
        assert_eq!(plugin.get_start().await, Ok(()));
        assert_eq!(plugin.get_start().await, Err(FuncError::Lan));
        assert_eq!(plugin.comm_test().await, Err(FuncError::Lan));

        plugin.reset().await.unwrap();
        assert_eq!(plugin.comm_test().await, Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn index_time_is_simulated() {
        let plugin = plugin(toml::toml! {
            mock_index_time = 250
        });
        let started = tokio::time::Instant::now();
        plugin.get_start().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn reprobe_keeps_reprobed_devices() {
        let plugin = plugin(toml::toml! {
            mock_population = "1,1,0,1"
        });
        plugin.get_start().await.unwrap();
        plugin
            .bin_reprobe(&[true, false, false, false], &[0, 5, -1, 6])
            .await
            .unwrap();
        assert_eq!(
            plugin.ctx.estate.sites(),
            vec![
                SiteUsage::Populated,
                SiteUsage::Empty,
                SiteUsage::Empty,
                SiteUsage::Empty
            ]
        );
        assert_eq!(plugin.bins(), vec![vec![-1, 5, -1, 6]]);
    }

    #[tokio::test]
    async fn status_values() {
        let plugin = plugin(toml::Table::new());
        assert_eq!(
            plugin.get_status("temperature").await,
            Err(FuncError::NotAvailable)
        );
        plugin.set_status("Temperature", "25.0").await.unwrap();
        assert_eq!(plugin.get_status("temperature").await.as_deref(), Ok("25.0"));
        plugin.set_status("lot_id", "A1").await.unwrap();
        assert_eq!(plugin.get_status("LOT_ID").await.as_deref(), Ok("A1"));
    }

    #[test]
    fn factory_validation() {
        let factory = MockFactory;
        assert!(factory.validate(&config(toml::Table::new())).is_ok());
        assert!(factory
            .validate(&config(toml::toml! { mock_fill_rate = 1.5 }))
            .is_err());
        assert!(factory
            .validate(&config(toml::toml! { mock_population = "1,0" }))
            .is_err());
        assert!(factory
            .validate(&config(toml::toml! { mock_population = "1,0,2,1" }))
            .is_err());
        assert!(factory
            .validate(&config(toml::toml! { mock_lot_size = "-3" }))
            .is_err());
        let mut other = config(toml::Table::new());
        other.model = "H3570".into();
        assert!(factory.validate(&other).is_err());
    }
}
