//! TechWing TW2XX / TW3XX handler plugin.
//!
//! The handler announces devices with service requests. A test start request
//! is followed by `TESTKIND?`, which tells whether this is a normal test, a
//! retest, or the end of the lot, and by `FULLSITES?` for the site population.
//! With `waiting_for_parts_method = "polling"` the plugin polls `FULLSITES?`
//! instead and ignores service requests.

use crate::protocol::{self, srq, TestKind, DONE, SETTING_OK};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use ph_core::config::PartsMethod;
use ph_core::estate::population_from_pending;
use ph_core::transport::open_transport;
use ph_core::{
    FuncAvailability, FuncError, FuncResult, HandlerConfig, HandlerPlugin, PluginContext,
    PluginFactory, StatRequest, Transaction, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// TechWingFactory - PluginFactory implementation
// =============================================================================

static MODELS: &[&str] = &["TW2XX", "TW3XX"];

/// Factory for TechWing handler plugins.
pub struct TechWingFactory;

impl PluginFactory for TechWingFactory {
    fn driver_type(&self) -> &'static str {
        "techwing"
    }

    fn name(&self) -> &'static str {
        "TechWing TW2XX/TW3XX"
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn availability(&self) -> FuncAvailability {
        TechWingPlugin::AVAILABILITY
    }

    fn validate(&self, config: &HandlerConfig) -> Result<()> {
        ph_core::plugin::check_model(&config.model, MODELS)?;
        if config.interface_type.is_none() {
            anyhow::bail!("interface_type must be configured for TechWing handlers");
        }
        if config.site_count() > 256 {
            anyhow::bail!(
                "TechWing handlers report at most 256 sites, {} configured",
                config.site_count()
            );
        }
        Ok(())
    }

    fn build(&self, ctx: PluginContext) -> BoxFuture<'static, Result<Arc<dyn HandlerPlugin>>> {
        Box::pin(async move {
            let model = Model::from_name(&ctx.config.model)
                .with_context(|| format!("unsupported TechWing model '{}'", ctx.config.model))?;
            let link = open_transport(&ctx.config)
                .await
                .context("failed to open TechWing handler interface")?;
            info!(model = ?model, "TechWing handler interface open");
            Ok(Arc::new(TechWingPlugin::new(ctx, model, Arc::new(link))) as Arc<dyn HandlerPlugin>)
        })
    }
}

// =============================================================================
// TechWingPlugin
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    Tw2xx,
    Tw3xx,
}

impl Model {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "TW2XX" => Some(Model::Tw2xx),
            "TW3XX" => Some(Model::Tw3xx),
            _ => None,
        }
    }

    fn site_select_command(self) -> &'static str {
        match self {
            Model::Tw2xx => "SITESEL",
            Model::Tw3xx => "CONTACTSEL",
        }
    }
}

/// Behaviour taken from the configuration at start.
#[derive(Debug, Clone)]
struct Settings {
    strict_polling: bool,
    polling_interval: Duration,
    verify_bins: bool,
    verify_retries: u32,
    send_site_selection: bool,
    mask_pending: bool,
    active: Vec<bool>,
    bin_ids: Vec<String>,
}

impl Settings {
    fn from_config(config: &HandlerConfig) -> Self {
        Self {
            strict_polling: config.waiting_for_parts_method == Some(PartsMethod::Polling),
            polling_interval: config.polling_interval_or(Duration::from_millis(200)),
            verify_bins: config.verify_bin_data.unwrap_or(true),
            verify_retries: config.verify_retry_count.unwrap_or(2),
            send_site_selection: config.mirae_send_siteselection_cmd.unwrap_or(false),
            mask_pending: config.mask_device_pending(),
            active: config.active_sites(),
            bin_ids: config.handler_bin_ids.clone(),
        }
    }
}

pub struct TechWingPlugin {
    ctx: PluginContext,
    model: Model,
    settings: Settings,
    link: Arc<dyn Transport>,
    trx: Mutex<Transaction>,
    /// `FR?` was answered once; later reconfigure calls leave the handler alone.
    configured: AtomicBool,
}

impl TechWingPlugin {
    pub const AVAILABILITY: FuncAvailability = FuncAvailability::MINIMUM
        .union(FuncAvailability::RECONFIGURE)
        .union(FuncAvailability::DRIVERID)
        .union(FuncAvailability::STATUS)
        .union(FuncAvailability::COMMTEST)
        .union(FuncAvailability::LOT_START)
        .union(FuncAvailability::LOT_DONE)
        .union(FuncAvailability::GET_STATUS)
        .union(FuncAvailability::SET_STATUS);

    pub fn new(ctx: PluginContext, model: Model, link: Arc<dyn Transport>) -> Self {
        let settings = Settings::from_config(&ctx.config);
        let trx = Transaction::new(ctx.config.heartbeat());
        Self {
            ctx,
            model,
            settings,
            link,
            trx: Mutex::new(trx),
            configured: AtomicBool::new(false),
        }
    }

    fn sites(&self) -> usize {
        self.settings.active.len()
    }

    /// Drop queued service requests and stale input.
    async fn flush_srqs(&self) -> FuncResult {
        let discarded = self
            .link
            .flush_input()
            .await
            .map_err(|e| e.to_func_error(self.link.interface()))?;
        if discarded > 0 {
            debug!(discarded, "flushed pending input");
        }
        Ok(())
    }

    async fn poll_parts(&self, trx: &mut Transaction) -> FuncResult<Vec<bool>> {
        let answer = trx.query(&*self.link, "FULLSITES?").await?;
        protocol::parse_fullsites(&answer, self.sites()).map_err(protocol::reject)
    }

    /// Poll until a device shows up or the heartbeat passed.
    async fn poll_until_parts(&self, trx: &mut Transaction) -> FuncResult<Vec<bool>> {
        let started = Instant::now();
        tokio::time::sleep(self.settings.polling_interval).await;
        let pending = loop {
            let mark = trx.mark();
            let pending = self.poll_parts(trx).await?;
            if pending.contains(&true) || started.elapsed() > trx.heartbeat() {
                break pending;
            }
            // only the last answer counts
            trx.rewind(mark);
            tokio::time::sleep(self.settings.polling_interval).await;
        };
        self.flush_srqs().await?;
        Ok(pending)
    }

    async fn wait_for_parts(&self, trx: &mut Transaction) -> FuncResult<Vec<bool>> {
        if self.settings.strict_polling {
            return self.poll_until_parts(trx).await;
        }
        let Some(byte) = trx.wait_srq(&*self.link).await? else {
            return Ok(vec![false; self.sites()]);
        };
        match byte {
            srq::LOT_START => {
                debug!("received lot start SRQ");
                Err(FuncError::LotStart)
            }
            srq::TEST_START => self.test_start(trx).await,
            srq::JAM => {
                warn!("received JAM SRQ 0x{:02x}", byte);
                Err(FuncError::Jam)
            }
            srq::LOT_END => {
                debug!("received lot end SRQ");
                Err(FuncError::LotDone)
            }
            other => {
                error!("received exceptional SRQ 0x{:02X}", other);
                Err(FuncError::Answer)
            }
        }
    }

    /// Follow a test start request.
    async fn test_start(&self, trx: &mut Transaction) -> FuncResult<Vec<bool>> {
        let answer = trx.query(&*self.link, "TESTKIND?").await?;
        let kind = protocol::parse_test_kind(&answer).map_err(protocol::reject)?;
        debug!(?kind, "received test start SRQ");
        match kind {
            TestKind::Normal | TestKind::PrimeLotStart => self.poll_parts(trx).await,
            TestKind::FirstRetest | TestKind::SecondRetest => {
                info!(?kind, "handler starts a retest");
                trx.send(&*self.link, "LOTCMD 0").await?;
                self.poll_parts(trx).await
            }
            TestKind::RetestDone => {
                info!("test of lot or retest finished, handler sorts devices");
                trx.send(&*self.link, "LOTCMD 0").await?;
                Ok(vec![false; self.sites()])
            }
            TestKind::LotEnd => {
                let total = trx.query(&*self.link, "LOTENDTOTAL?").await?;
                info!(total = %total, "lot finished");
                trx.send(&*self.link, "LOTCMD 2").await?;
                Err(FuncError::LotDone)
            }
        }
    }

    /// Send one bin command and check the echo.
    async fn send_binon(&self, trx: &mut Transaction, msg: &str) -> FuncResult {
        trx.send(&*self.link, msg).await?;
        if !self.settings.verify_bins {
            return Ok(());
        }
        let echo = trx.receive(&*self.link).await?;
        if protocol::echo_matches(msg, &echo, ':', self.sites()) {
            debug!("bin verification succeeded");
            trx.send(&*self.link, "ECHOOK").await
        } else {
            error!(
                sent = %msg,
                received = %echo,
                "difference found between sent and returned binning information"
            );
            trx.send(&*self.link, "ECHONG").await?;
            Err(FuncError::Binning)
        }
    }

    async fn send_bins(&self, trx: &mut Transaction, bins: &[i64]) -> FuncResult {
        let occupied: Vec<bool> = self
            .ctx
            .estate
            .sites()
            .iter()
            .zip(&self.settings.active)
            .map(|(usage, active)| usage.holds_device() && (*active || !self.settings.mask_pending))
            .collect();
        let msg = protocol::binon_message(
            "BINON:",
            self.sites(),
            protocol::EMPTY_SLOT,
            &occupied,
            bins,
            &self.settings.bin_ids,
        )
        .map_err(protocol::reject)?;
        let Some(msg) = msg else {
            debug!("no device to bin");
            return Ok(());
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mark = trx.mark();
            let result = self.send_binon(trx, &msg).await;
            let retry = match result {
                Err(FuncError::Binning) => self.settings.verify_bins,
                Err(FuncError::Timeout) => true,
                _ => false,
            };
            if !retry || attempt > self.settings.verify_retries {
                return result;
            }
            warn!(
                "will try to send bin data {} more time(s) before giving up",
                1 + self.settings.verify_retries - attempt
            );
            trx.rewind(mark);
        }
    }

    async fn send_site_selection(&self, trx: &mut Transaction) -> FuncResult {
        let keyword = self.model.site_select_command();
        if self.ctx.config.handler_site_mask.is_empty() {
            warn!("handler_site_mask not given, {} command will not be sent", keyword);
            return Ok(());
        }
        let command = format!("{} {}", keyword, protocol::site_mask_hex(&self.settings.active));
        let answer = trx.query(&*self.link, &command).await?;
        protocol::expect_reply(&command, &answer, SETTING_OK).map_err(protocol::reject)
    }

    async fn configure_handler(&self, trx: &mut Transaction) -> FuncResult {
        let running = trx.query(&*self.link, "FR?").await?;
        debug!(answer = %running, "FR? handler running state");
        if !running.trim().eq_ignore_ascii_case("FR 0") {
            info!("handler is running, will not be reconfigured");
            return Ok(());
        }
        if self.settings.send_site_selection {
            self.send_site_selection(trx).await?;
        }
        self.flush_srqs().await
    }

    /// Send `command` and require an answer starting with `expected`.
    async fn command(&self, command: String, expected: &'static str) -> FuncResult {
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::SET_STATUS);
        let result = match trx.query(&*self.link, &command).await {
            Ok(answer) => protocol::expect_reply(&command, &answer, expected)
                .map_err(protocol::reject),
            Err(e) => Err(e),
        };
        trx.settle(result)
    }
}

/// Handler query for a status key, `None` when the key is unknown.
fn status_query(key: &str, param: &str) -> Option<String> {
    let query = match key {
        "version" => "VERSION?",
        "name" => "NAME?",
        "testset" => "TESTSET?",
        "settemp" => "SETTEMP?",
        "meastemp" => return Some(format!("MEASTEMP {}?", param)),
        "status" => "STATUS?",
        "jam" => "JAM?",
        "jamcode" => "JAMCODE?",
        "jamque" => "JAMQUE?",
        "jamcount" => "JAMCOUNT?",
        "setlamp" => "SETLAMP?",
        _ => return None,
    };
    Some(query.to_string())
}

/// Handler command for a status key with its expected answer.
fn status_command(model: Model, key: &str, value: &str) -> FuncResult<(String, &'static str)> {
    let value = value.trim();
    let on_off = || match value {
        "0" | "1" => Ok(value),
        _ => {
            warn!(key, value, "expected 0 or 1");
            Err(FuncError::Config)
        }
    };
    match key {
        "start" => Ok(("START".into(), DONE)),
        "stop" => Ok(("STOP".into(), DONE)),
        "loader" => Ok(("LOADER".into(), DONE)),
        "plunger" => Ok((format!("PLUNGER {}", on_off()?), DONE)),
        "runmode" => Ok((format!("RUNMODE {}", on_off()?), SETTING_OK)),
        "name" => {
            if value.is_empty() || value.len() > 12 {
                warn!(value, "handler name must have 1 to 12 characters");
                return Err(FuncError::Config);
            }
            Ok((format!("SETNAME {}", value), SETTING_OK))
        }
        "contactsel" | "sitesel" => {
            if value.is_empty() || value.len() > 64 {
                warn!(value, "site selection must have 1 to 64 hex digits");
                return Err(FuncError::Config);
            }
            Ok((format!("{} {}", model.site_select_command(), value), SETTING_OK))
        }
        _ => {
            warn!(key, value, "status key not supported by TechWing handlers");
            Err(FuncError::NotAvailable)
        }
    }
}

#[async_trait]
impl HandlerPlugin for TechWingPlugin {
    fn availability(&self) -> FuncAvailability {
        Self::AVAILABILITY
    }

    #[instrument(skip(self), fields(model = ?self.model))]
    async fn reconfigure(&self) -> FuncResult {
        self.ctx.abort.check()?;
        if self.configured.load(Ordering::SeqCst) {
            debug!("repeated reconfigure, handler will not be reconfigured");
            return Ok(());
        }
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::RECONFIGURE);
        let result = self.configure_handler(&mut trx).await;
        if result.is_ok() {
            self.configured.store(true, Ordering::SeqCst);
        }
        trx.settle(result)
    }

    async fn driver_id(&self) -> FuncResult<String> {
        Ok(format!(
            "{} {} ({:?})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.model
        ))
    }

    #[instrument(skip(self), fields(model = ?self.model))]
    async fn get_start(&self) -> FuncResult {
        self.ctx.abort.check()?;
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::START);
        let result = self.wait_for_parts(&mut trx).await;
        let pending = match trx.settle(result) {
            Ok(pending) => pending,
            Err(
                e @ (FuncError::Jam
                | FuncError::LotDone
                | FuncError::Waiting
                | FuncError::Aborted
                | FuncError::Gpib
                | FuncError::Rs232
                | FuncError::Lan),
            ) => return Err(e),
            Err(e) => {
                debug!("waiting for parts ended with '{}', keep waiting", e);
                return Err(FuncError::Waiting);
            }
        };
        if !pending.contains(&true) {
            return Err(FuncError::Waiting);
        }

        let population =
            population_from_pending(&pending, &self.settings.active, self.settings.mask_pending);
        self.ctx.estate.set_sites(&population).map_err(|e| {
            error!("{}", e);
            FuncError::Fatal
        })
    }

    #[instrument(skip(self), fields(model = ?self.model))]
    async fn bin_device(&self, bins: &[i64]) -> FuncResult {
        self.ctx.abort.check()?;
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::BIN);
        let result = self.send_bins(&mut trx, bins).await;
        trx.settle(result)?;
        self.ctx.estate.mark_binned();
        Ok(())
    }

    async fn status(&self, request: StatRequest) -> FuncResult<bool> {
        if matches!(request, StatRequest::Reset | StatRequest::Handled) {
            self.trx.lock().await.reset();
        }
        self.ctx.abort.apply(request)
    }

    #[instrument(skip(self), fields(model = ?self.model))]
    async fn comm_test(&self) -> FuncResult<bool> {
        self.ctx.abort.check()?;
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::COMMTEST);
        let result = trx.query(&*self.link, "FR?").await;
        let running = trx.settle(result)?;
        debug!(answer = %running, "FR? handler running state");
        Ok(true)
    }

    #[instrument(skip(self), fields(model = ?self.model))]
    async fn lot_start(&self, _param: &str) -> FuncResult {
        self.ctx.abort.check()?;
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::LOT_START);
        let result = match trx.wait_srq(&*self.link).await {
            Ok(Some(srq::LOT_START)) => {
                debug!("received lot start SRQ");
                Ok(())
            }
            Ok(Some(srq::TEST_START)) => {
                warn!("received test start SRQ while waiting for lot start");
                Err(FuncError::DeviceStart)
            }
            Ok(Some(srq::JAM)) => {
                warn!("received JAM SRQ while waiting for lot start");
                Err(FuncError::Jam)
            }
            Ok(Some(srq::LOT_END)) => Err(FuncError::LotDone),
            Ok(Some(other)) => {
                error!("received exceptional SRQ 0x{:02X}", other);
                Err(FuncError::Answer)
            }
            Ok(None) => Err(FuncError::Waiting),
            Err(e) => Err(e),
        };
        trx.settle(result)
    }

    async fn lot_done(&self, _param: &str) -> FuncResult {
        self.ctx.abort.check()?;
        self.flush_srqs().await
    }

    #[instrument(skip(self), fields(model = ?self.model))]
    async fn get_status(&self, key: &str) -> FuncResult<String> {
        self.ctx.abort.check()?;
        let (name, param) = key.trim().split_once(' ').unwrap_or((key.trim(), ""));
        let name = name.to_ascii_lowercase();
        let Some(query) = status_query(&name, param.trim()) else {
            warn!(key = %name, "status key not supported by TechWing handlers");
            return Err(FuncError::NotAvailable);
        };
        if name == "meastemp" && param.trim().is_empty() {
            warn!("meastemp needs a sensor number");
            return Err(FuncError::NotAvailable);
        }
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::GET_STATUS);
        let result = trx.query(&*self.link, &query).await;
        trx.settle(result)
    }

    #[instrument(skip(self), fields(model = ?self.model))]
    async fn set_status(&self, key: &str, value: &str) -> FuncResult {
        self.ctx.abort.check()?;
        let (command, expected) = status_command(self.model, &key.trim().to_ascii_lowercase(), value)?;
        self.command(command, expected).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ph_core::{InterfaceKind, SiteUsage, StreamTransport};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tracing_test::traced_test;

    /// Plugin wired to an in-memory handler.
    struct Bench {
        plugin: TechWingPlugin,
        handler: BufReader<DuplexStream>,
    }

    impl Bench {
        fn new(config: HandlerConfig) -> Self {
            let (handler, device) = tokio::io::duplex(1024);
            let link = StreamTransport::new(Box::new(device), InterfaceKind::Gpib, "\r\n");
            let ctx = PluginContext::new(config);
            Self {
                plugin: TechWingPlugin::new(ctx, Model::Tw3xx, Arc::new(link)),
                handler: BufReader::new(handler),
            }
        }

        async fn say(&mut self, line: &str) {
            self.handler
                .get_mut()
                .write_all(format!("{}\r\n", line).as_bytes())
                .await
                .unwrap();
        }

        async fn heard(&mut self) -> String {
            let mut line = String::new();
            self.handler.read_line(&mut line).await.unwrap();
            line.trim_end().to_string()
        }
    }

    fn config() -> HandlerConfig {
        HandlerConfig {
            driver_plugin: "techwing".into(),
            model: "TW3XX".into(),
            interface_type: Some(InterfaceKind::Gpib),
            handler_site_ids: vec!["1".into(), "2".into(), "3".into(), "4".into()],
            flag_check_interval: Some(200.0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_polls_population() {
        let mut bench = Bench::new(config());
        bench.say("SRQ 0x41").await;
        bench.say("TESTKIND 00").await;
        bench.say("FULLSITES 00000005").await;

        assert_eq!(bench.plugin.get_start().await, Ok(()));
        assert_eq!(bench.heard().await, "TESTKIND?");
        assert_eq!(bench.heard().await, "FULLSITES?");
        assert_eq!(
            bench.plugin.ctx.estate.sites(),
            vec![
                SiteUsage::Populated,
                SiteUsage::Empty,
                SiteUsage::Populated,
                SiteUsage::Empty
            ]
        );
    }

    #[tokio::test]
    async fn no_service_request_is_waiting() {
        let bench = Bench::new(config());
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Waiting));
    }

    #[tokio::test]
    async fn late_population_answer_resumes_without_second_srq() {
        let mut bench = Bench::new(config());
        bench.say("SRQ 0x41").await;
        bench.say("TESTKIND 00").await;
        // population answer is late
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Waiting));
        assert_eq!(bench.heard().await, "TESTKIND?");
        assert_eq!(bench.heard().await, "FULLSITES?");

        bench.say("FULLSITES 00000001").await;
        assert_eq!(bench.plugin.get_start().await, Ok(()));
        // the population query is asked again, the test kind is not
        assert_eq!(bench.heard().await, "FULLSITES?");
        assert_eq!(bench.plugin.ctx.estate.sites()[0], SiteUsage::Populated);
    }

    #[tokio::test]
    async fn retest_acknowledges_before_polling() {
        let mut bench = Bench::new(config());
        bench.say("SRQ 65").await;
        bench.say("TESTKIND 04").await;
        bench.say("FULLSITES 2").await;
        assert_eq!(bench.plugin.get_start().await, Ok(()));
        assert_eq!(bench.heard().await, "TESTKIND?");
        assert_eq!(bench.heard().await, "LOTCMD 0");
        assert_eq!(bench.heard().await, "FULLSITES?");
    }

    #[tokio::test]
    async fn lot_end_test_kind_finishes_lot() {
        let mut bench = Bench::new(config());
        bench.say("SRQ 0x41").await;
        bench.say("TESTKIND 10").await;
        bench.say("LOTENDTOTAL 1000,990,10").await;
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::LotDone));
        assert_eq!(bench.heard().await, "TESTKIND?");
        assert_eq!(bench.heard().await, "LOTENDTOTAL?");
        assert_eq!(bench.heard().await, "LOTCMD 2");
    }

    #[tokio::test]
    async fn jam_and_unknown_requests() {
        let mut bench = Bench::new(config());
        bench.say("SRQ 0x3d").await;
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Jam));
        // unexpected request codes keep the framework waiting
        bench.say("SRQ 0x99").await;
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Waiting));
    }

    #[tokio::test]
    #[traced_test]
    async fn device_ready_request_is_exceptional() {
        let mut bench = Bench::new(config());
        bench.say("SRQ 0x47").await;
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Waiting));
        assert!(logs_contain("received exceptional SRQ 0x47"));

        bench.say("SRQ 0x47").await;
        assert_eq!(bench.plugin.lot_start("").await, Err(FuncError::Answer));
    }

    #[tokio::test(start_paused = true)]
    async fn strict_polling_asks_until_devices_arrive() {
        let config = HandlerConfig {
            waiting_for_parts_method: Some(PartsMethod::Polling),
            polling_interval: Some(10_000.0),
            flag_check_interval: Some(5_000.0),
            ..config()
        };
        let mut bench = Bench::new(config);
        bench.say("FULLSITES 0").await;
        bench.say("FULLSITES 8").await;
        assert_eq!(bench.plugin.get_start().await, Ok(()));
        assert_eq!(bench.heard().await, "FULLSITES?");
        assert_eq!(bench.heard().await, "FULLSITES?");
        assert_eq!(bench.plugin.ctx.estate.sites()[3], SiteUsage::Populated);
    }

    #[tokio::test]
    async fn bins_are_verified_and_sites_emptied() {
        let mut bench = Bench::new(config());
        bench
            .plugin
            .ctx
            .estate
            .set_sites(&[
                SiteUsage::Populated,
                SiteUsage::Empty,
                SiteUsage::Populated,
                SiteUsage::Empty,
            ])
            .unwrap();
        bench.say("ECHO:A3A1;").await;
        assert_eq!(bench.plugin.bin_device(&[0, -1, 2, -1]).await, Ok(()));
        assert_eq!(bench.heard().await, "BINON:A3A1;");
        assert_eq!(bench.heard().await, "ECHOOK");
        assert_eq!(bench.plugin.ctx.estate.sites(), vec![SiteUsage::Empty; 4]);
    }

    #[tokio::test]
    async fn bad_echo_is_retried_then_fails() {
        let config = HandlerConfig {
            verify_retry_count: Some(1),
            ..config()
        };
        let mut bench = Bench::new(config);
        bench
            .plugin
            .ctx
            .estate
            .set_sites(&[SiteUsage::Populated; 4])
            .unwrap();
        bench.say("ECHO:1111;").await;
        bench.say("ECHO:1111;").await;
        assert_eq!(
            bench.plugin.bin_device(&[1, 1, 1, 1]).await,
            Err(FuncError::Binning)
        );
        for _ in 0..2 {
            assert_eq!(bench.heard().await, "BINON:2222;");
            assert_eq!(bench.heard().await, "ECHONG");
        }
        // failed binning keeps the devices
        assert_eq!(bench.plugin.ctx.estate.sites(), vec![SiteUsage::Populated; 4]);
    }

    #[tokio::test]
    async fn invalid_bin_index_is_binning_error() {
        let config = HandlerConfig {
            handler_bin_ids: vec!["1".into(), "2".into()],
            ..config()
        };
        let bench = Bench::new(config);
        bench
            .plugin
            .ctx
            .estate
            .set_sites(&[SiteUsage::Populated; 4])
            .unwrap();
        assert_eq!(
            bench.plugin.bin_device(&[0, 1, 2, 0]).await,
            Err(FuncError::Binning)
        );
    }

    #[tokio::test]
    async fn reconfigure_sets_up_stopped_handler_once() {
        let config = HandlerConfig {
            mirae_send_siteselection_cmd: Some(true),
            handler_site_mask: vec![1, 1, 0, 1],
            ..config()
        };
        let mut bench = Bench::new(config);
        bench.say("FR 0").await;
        bench.say("SettingOK").await;
        assert_eq!(bench.plugin.reconfigure().await, Ok(()));
        assert_eq!(bench.heard().await, "FR?");
        assert_eq!(bench.heard().await, "CONTACTSEL B");

        // second call does not talk to the handler
        assert_eq!(bench.plugin.reconfigure().await, Ok(()));
    }

    #[tokio::test]
    #[traced_test]
    async fn site_selection_without_mask_is_skipped() {
        let config = HandlerConfig {
            mirae_send_siteselection_cmd: Some(true),
            ..config()
        };
        let mut bench = Bench::new(config);
        bench.say("FR 0").await;
        assert_eq!(bench.plugin.reconfigure().await, Ok(()));
        assert_eq!(bench.heard().await, "FR?");
        assert!(logs_contain("CONTACTSEL command will not be sent"));
    }

    #[tokio::test]
    async fn running_handler_is_not_reconfigured() {
        let config = HandlerConfig {
            mirae_send_siteselection_cmd: Some(true),
            handler_site_mask: vec![1, 1, 1, 1],
            ..config()
        };
        let mut bench = Bench::new(config);
        bench.say("FR 1").await;
        assert_eq!(bench.plugin.reconfigure().await, Ok(()));
        assert_eq!(bench.heard().await, "FR?");
        assert_eq!(bench.plugin.comm_test().await, Err(FuncError::Waiting));
        assert_eq!(bench.heard().await, "FR?");
    }

    #[tokio::test]
    async fn lot_start_waits_for_request() {
        let mut bench = Bench::new(config());
        assert_eq!(bench.plugin.lot_start("").await, Err(FuncError::Waiting));
        bench.say("SRQ 0x46").await;
        assert_eq!(bench.plugin.lot_start("").await, Ok(()));
        bench.say("SRQ 0x41").await;
        assert_eq!(
            bench.plugin.lot_start("").await,
            Err(FuncError::DeviceStart)
        );
    }

    #[tokio::test]
    async fn status_keys() {
        let mut bench = Bench::new(config());
        bench.say("done").await;
        assert_eq!(bench.plugin.set_status("plunger", "1").await, Ok(()));
        assert_eq!(bench.heard().await, "PLUNGER 1");

        assert_eq!(
            bench.plugin.set_status("name", "much-too-long-name").await,
            Err(FuncError::Config)
        );
        assert_eq!(
            bench.plugin.set_status("runmode", "3").await,
            Err(FuncError::Config)
        );

        bench.say("SettingNG").await;
        assert_eq!(
            bench.plugin.set_status("name", "TW1").await,
            Err(FuncError::Answer)
        );
        assert_eq!(bench.heard().await, "SETNAME TW1");

        bench.say("MEASTEMP 1 25.3").await;
        assert_eq!(
            bench.plugin.get_status("meastemp 1").await.as_deref(),
            Ok("MEASTEMP 1 25.3")
        );
        assert_eq!(bench.heard().await, "MEASTEMP 1?");
        assert_eq!(
            bench.plugin.get_status("humidity").await,
            Err(FuncError::NotAvailable)
        );
    }

    #[tokio::test]
    async fn pending_abort_is_reported_once() {
        let bench = Bench::new(config());
        assert_eq!(bench.plugin.status(StatRequest::Abort).await, Ok(true));
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Aborted));
        assert_eq!(bench.plugin.status(StatRequest::Query).await, Ok(false));
    }

    #[test]
    fn factory_validation() {
        let factory = TechWingFactory;
        let value = toml::toml! {
            driver_plugin = "techwing"
            model = "tw2xx"
            interface_type = "lan"
            symbolic_interface_name = "127.0.0.1:5000"
            handler_site_ids = ["1", "2"]
        };
        let config = HandlerConfig::from_value(toml::Value::Table(value)).unwrap();
        assert!(factory.validate(&config).is_ok());

        let other = HandlerConfig {
            model: "TW9".into(),
            ..config.clone()
        };
        assert!(factory.validate(&other).is_err());

        let no_interface = HandlerConfig {
            interface_type: None,
            ..config
        };
        assert!(factory.validate(&no_interface).is_err());
    }
}
