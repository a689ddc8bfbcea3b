//! ATOM plugin and its factory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use ph_core::config::TimeoutAction;
use ph_core::estate::population_from_pending;
use ph_core::transport::open_transport;
use ph_core::{
    FuncAvailability, FuncError, FuncResult, HandlerConfig, HandlerPlugin, PluginContext,
    PluginFactory, StatRequest, Transaction, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

const EQUIPMENT_ID: &str = "DB Design ATOM handler";
/// Shortest accepted `waiting_for_parts_timeout`, in seconds.
const MIN_PARTS_TIMEOUT: f64 = 5.0;

// =============================================================================
// AtomFactory - PluginFactory implementation
// =============================================================================

static MODELS: &[&str] = &["ATOM"];

/// Factory for DB Design ATOM handler plugins.
pub struct AtomFactory;

impl PluginFactory for AtomFactory {
    fn driver_type(&self) -> &'static str {
        "atom"
    }

    fn name(&self) -> &'static str {
        EQUIPMENT_ID
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn availability(&self) -> FuncAvailability {
        AtomPlugin::AVAILABILITY
    }

    fn validate(&self, config: &HandlerConfig) -> Result<()> {
        ph_core::plugin::check_model(&config.model, MODELS)?;
        if config.site_count() != 1 {
            anyhow::bail!(
                "the ATOM handler has a single site, {} configured",
                config.site_count()
            );
        }
        Settings::from_config(config)?;
        Ok(())
    }

    fn build(&self, ctx: PluginContext) -> BoxFuture<'static, Result<Arc<dyn HandlerPlugin>>> {
        Box::pin(async move {
            let link = open_transport(&ctx.config)
                .await
                .context("failed to open ATOM handler interface")?;
            let plugin = AtomPlugin::new(ctx, Arc::new(link))?;
            Ok(Arc::new(plugin) as Arc<dyn HandlerPlugin>)
        })
    }
}

// =============================================================================
// AtomPlugin
// =============================================================================

#[derive(Debug, Clone)]
struct Settings {
    /// Pause before the first `RFT?`, the handler is still busy binning.
    polling_delay: Duration,
    polling_interval: Duration,
    /// How long to poll before giving up on the lot.
    lot_timeout: Duration,
    lot_timeout_action: TimeoutAction,
    active: Vec<bool>,
    bin_ids: Vec<String>,
}

/// Microsecond value of a non-negative key.
fn micros(value: Option<f64>, key: &str, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(v) if v >= 0.0 => Ok(Duration::from_micros(v as u64)),
        Some(v) => anyhow::bail!("{} must not be negative, found {}", key, v),
    }
}

impl Settings {
    fn from_config(config: &HandlerConfig) -> Result<Self> {
        let parts_timeout = config
            .waiting_for_parts_timeout
            .context("waiting_for_parts_timeout is not defined")?;
        if parts_timeout < MIN_PARTS_TIMEOUT {
            anyhow::bail!(
                "waiting_for_parts_timeout must be at least {} seconds, found {}",
                MIN_PARTS_TIMEOUT,
                parts_timeout
            );
        }
        let lot_timeout = match config.waiting_for_lot_timeout {
            None => Duration::ZERO,
            Some(s) if s >= 0.0 => Duration::from_secs_f64(s),
            Some(s) => anyhow::bail!("waiting_for_lot_timeout must not be negative, found {}", s),
        };
        Ok(Self {
            polling_delay: micros(
                config.extra_f64("polling_delay"),
                "polling_delay",
                Duration::from_secs(5),
            )?,
            polling_interval: micros(
                config.polling_interval,
                "polling_interval",
                Duration::from_secs(1),
            )?,
            lot_timeout,
            lot_timeout_action: config.waiting_for_lot_timeout_action.unwrap_or_default(),
            active: config.active_sites(),
            bin_ids: config.handler_bin_ids.clone(),
        })
    }
}

pub struct AtomPlugin {
    ctx: PluginContext,
    settings: Settings,
    link: Arc<dyn Transport>,
    trx: Mutex<Transaction>,
}

/// `BIN1` for a passing device, `BIN2` otherwise.
fn bin_command(bin: i64, with_bin_ids: bool) -> &'static str {
    let pass = if with_bin_ids { bin == 0 } else { bin == 1 };
    if pass {
        "BIN1"
    } else {
        "BIN2"
    }
}

impl AtomPlugin {
    pub const AVAILABILITY: FuncAvailability = FuncAvailability::MINIMUM
        .union(FuncAvailability::DRIVERID)
        .union(FuncAvailability::EQUIPID)
        .union(FuncAvailability::STATUS)
        .union(FuncAvailability::COMMTEST)
        .union(FuncAvailability::LOT_START)
        .union(FuncAvailability::LOT_DONE)
        .union(FuncAvailability::EXECGPIBCMD)
        .union(FuncAvailability::EXECGPIBQUERY);

    pub fn new(ctx: PluginContext, link: Arc<dyn Transport>) -> Result<Self> {
        let settings = Settings::from_config(&ctx.config)?;
        info!(
            delay = ?settings.polling_delay,
            interval = ?settings.polling_interval,
            lot_timeout = ?settings.lot_timeout,
            "ATOM polling set up"
        );
        let trx = Transaction::new(ctx.config.heartbeat());
        Ok(Self {
            ctx,
            settings,
            link,
            trx: Mutex::new(trx),
        })
    }

    /// Ask `RFT?`: "0" is ready for test, "1" is not.
    async fn poll_parts(&self, trx: &mut Transaction) -> FuncResult<bool> {
        let answer = trx.query(&*self.link, "RFT?").await?;
        match answer.trim() {
            "0" => {
                debug!("device present at site \"1\" (polled)");
                Ok(true)
            }
            "1" => {
                debug!("no device at site \"1\" (polled)");
                Ok(false)
            }
            other => {
                error!("Received unexpected reply for GPIB query RFT? - {}", other);
                Err(FuncError::Fatal)
            }
        }
    }

    async fn wait_for_parts(&self, trx: &mut Transaction) -> FuncResult<bool> {
        tokio::time::sleep(self.settings.polling_delay).await;
        let started = Instant::now();
        loop {
            let mark = trx.mark();
            if self.poll_parts(trx).await? {
                return Ok(true);
            }
            trx.rewind(mark);
            if started.elapsed() >= self.settings.lot_timeout {
                break;
            }
            tokio::time::sleep(self.settings.polling_interval).await;
        }
        if self.settings.lot_timeout_action == TimeoutAction::Skip {
            warn!("no device ready for test after repeated queries, ending the lot");
            return Err(FuncError::LotDone);
        }
        debug!("no device ready for test after repeated queries, keep waiting");
        Ok(false)
    }

    async fn query(&self, call: FuncAvailability, query: &str) -> FuncResult<String> {
        let mut trx = self.trx.lock().await;
        trx.begin(call);
        info!("GPIB send: {}", query);
        let result = trx.query(&*self.link, query).await;
        trx.settle(result)
    }
}

#[async_trait]
impl HandlerPlugin for AtomPlugin {
    fn availability(&self) -> FuncAvailability {
        Self::AVAILABILITY
    }

    async fn driver_id(&self) -> FuncResult<String> {
        Ok(format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
    }

    async fn equipment_id(&self) -> FuncResult<String> {
        Ok(EQUIPMENT_ID.to_string())
    }

    #[instrument(skip(self))]
    async fn get_start(&self) -> FuncResult {
        self.ctx.abort.check()?;
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::START);
        let result = self.wait_for_parts(&mut trx).await;
        if !trx.settle(result)? {
            return Err(FuncError::Waiting);
        }
        let population = population_from_pending(&[true], &self.settings.active, true);
        self.ctx.estate.set_sites(&population).map_err(|e| {
            error!("{}", e);
            FuncError::Fatal
        })
    }

    #[instrument(skip(self))]
    async fn bin_device(&self, bins: &[i64]) -> FuncResult {
        self.ctx.abort.check()?;
        let bin = bins.first().copied().unwrap_or(-1);
        let command = bin_command(bin, !self.settings.bin_ids.is_empty());
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::BIN);
        let result = trx.send(&*self.link, command).await;
        trx.settle(result)?;
        debug!(bin, "sent {}", command);
        self.ctx.estate.mark_binned();
        Ok(())
    }

    async fn status(&self, request: StatRequest) -> FuncResult<bool> {
        if matches!(request, StatRequest::Reset | StatRequest::Handled) {
            self.trx.lock().await.reset();
        }
        self.ctx.abort.apply(request)
    }

    #[instrument(skip(self))]
    async fn comm_test(&self) -> FuncResult<bool> {
        info!("verify handler type now");
        let identity = self.query(FuncAvailability::COMMTEST, "IDN?").await?;
        if !identity.contains("DB Design") {
            error!("This handler is not supported - {}", identity);
            return Err(FuncError::Model);
        }
        info!("Handler found - {}", identity);
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn lot_start(&self, _param: &str) -> FuncResult {
        let answer = self.query(FuncAvailability::LOT_START, "ERROR?").await?;
        if answer.starts_with("No Error") {
            Ok(())
        } else {
            error!("Handler reported error: {}", answer);
            Err(FuncError::Fatal)
        }
    }

    async fn lot_done(&self, _param: &str) -> FuncResult {
        self.ctx.abort.check()
    }

    #[instrument(skip(self))]
    async fn exec_gpib_cmd(&self, command: &str) -> FuncResult<String> {
        info!("GPIB send: {}", command);
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::EXECGPIBCMD);
        let result = trx.send(&*self.link, command).await;
        trx.settle(result)?;
        Ok(String::new())
    }

    #[instrument(skip(self))]
    async fn exec_gpib_query(&self, query: &str) -> FuncResult<String> {
        let reply = self.query(FuncAvailability::EXECGPIBQUERY, query).await?;
        info!("Reply from handler: {}", reply);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ph_core::{InterfaceKind, SiteUsage, StreamTransport};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct Bench {
        plugin: AtomPlugin,
        handler: BufReader<DuplexStream>,
    }

    impl Bench {
        fn new(config: HandlerConfig) -> Self {
            let (handler, device) = tokio::io::duplex(1024);
            let link = StreamTransport::new(Box::new(device), InterfaceKind::Gpib, "\r\n");
            Self {
                plugin: AtomPlugin::new(PluginContext::new(config), Arc::new(link)).unwrap(),
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
            driver_plugin: "atom".into(),
            model: "ATOM".into(),
            interface_type: Some(InterfaceKind::Gpib),
            handler_site_ids: vec!["1".into()],
            flag_check_interval: Some(1000.0),
            waiting_for_parts_timeout: Some(10.0),
            waiting_for_lot_timeout: Some(3.0),
            ..Default::default()
        }
    }

    #[test]
    fn bin_commands() {
        assert_eq!(bin_command(1, false), "BIN1");
        assert_eq!(bin_command(0, false), "BIN2");
        assert_eq!(bin_command(0, true), "BIN1");
        assert_eq!(bin_command(1, true), "BIN2");
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_ready() {
        let mut bench = Bench::new(config());
        bench.say("1").await;
        bench.say("0").await;
        let started = Instant::now();
        assert_eq!(bench.plugin.get_start().await, Ok(()));
        // delay plus one interval
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert_eq!(bench.heard().await, "RFT?");
        assert_eq!(bench.heard().await, "RFT?");
        assert_eq!(bench.plugin.ctx.estate.sites(), vec![SiteUsage::Populated]);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_ready_answer_is_fatal() {
        let mut bench = Bench::new(config());
        bench.say("2").await;
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Fatal));
    }

    #[tokio::test(start_paused = true)]
    async fn lot_timeout_ends_lot_when_skipping() {
        let skipping = HandlerConfig {
            waiting_for_lot_timeout: Some(0.0),
            waiting_for_lot_timeout_action: Some(TimeoutAction::Skip),
            ..config()
        };
        let mut bench = Bench::new(skipping);
        bench.say("1").await;
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::LotDone));

        let mut bench = Bench::new(HandlerConfig {
            waiting_for_lot_timeout: Some(0.0),
            ..config()
        });
        bench.say("1").await;
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Waiting));
    }

    #[tokio::test]
    async fn pass_and_fail_bins() {
        let mut bench = Bench::new(config());
        bench.plugin.ctx.estate.set_sites(&[SiteUsage::Populated]).unwrap();
        assert_eq!(bench.plugin.bin_device(&[1]).await, Ok(()));
        assert_eq!(bench.heard().await, "BIN1");
        assert_eq!(bench.plugin.ctx.estate.sites(), vec![SiteUsage::Empty]);

        bench.plugin.ctx.estate.set_sites(&[SiteUsage::Populated]).unwrap();
        assert_eq!(bench.plugin.bin_device(&[7]).await, Ok(()));
        assert_eq!(bench.heard().await, "BIN2");
    }

    #[tokio::test]
    async fn comm_test_checks_vendor() {
        let mut bench = Bench::new(config());
        bench.say("DB Design ATOM V1.2").await;
        assert_eq!(bench.plugin.comm_test().await, Ok(true));
        assert_eq!(bench.heard().await, "IDN?");

        bench.say("Acme Handler").await;
        assert_eq!(bench.plugin.comm_test().await, Err(FuncError::Model));
    }

    #[tokio::test]
    async fn lot_start_checks_errors() {
        let mut bench = Bench::new(config());
        bench.say("No Error").await;
        assert_eq!(bench.plugin.lot_start("").await, Ok(()));
        assert_eq!(bench.heard().await, "ERROR?");

        bench.say("Error 12: vacuum").await;
        assert_eq!(bench.plugin.lot_start("").await, Err(FuncError::Fatal));
    }

    #[tokio::test]
    async fn gpib_passthrough() {
        let mut bench = Bench::new(config());
        assert_eq!(bench.plugin.exec_gpib_cmd("LAMP ON").await.as_deref(), Ok(""));
        assert_eq!(bench.heard().await, "LAMP ON");

        bench.say("42").await;
        assert_eq!(bench.plugin.exec_gpib_query("COUNT?").await.as_deref(), Ok("42"));
        assert_eq!(bench.heard().await, "COUNT?");
        assert_eq!(
            bench.plugin.equipment_id().await.as_deref(),
            Ok("DB Design ATOM handler")
        );
    }

    #[test]
    fn factory_validation() {
        let factory = AtomFactory;
        let value = toml::toml! {
            driver_plugin = "atom"
            model = "atom"
            interface_type = "gpib"
            handler_site_ids = ["1"]
            waiting_for_parts_timeout = 5
            polling_delay = 2000000
        };
        let config = HandlerConfig::from_value(toml::Value::Table(value)).unwrap();
        assert!(factory.validate(&config).is_ok());

        let short = HandlerConfig {
            waiting_for_parts_timeout: Some(4.0),
            ..config.clone()
        };
        assert!(factory.validate(&short).is_err());
        let missing = HandlerConfig {
            waiting_for_parts_timeout: None,
            ..config.clone()
        };
        assert!(factory.validate(&missing).is_err());
        let two_sites = HandlerConfig {
            handler_site_ids: vec!["1".into(), "2".into()],
            ..config
        };
        assert!(factory.validate(&two_sites).is_err());
    }
}
