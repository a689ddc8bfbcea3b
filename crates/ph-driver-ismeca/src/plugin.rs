//! Ismeca NY20 / NX16 handler plugin.

use crate::protocol::{self, CaResponse, IsmecaError, ACK, ENQ};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use ph_core::config::{PartsMethod, ReprobeMode};
use ph_core::estate::{population_after_reprobe, population_from_pending};
use ph_core::transport::open_transport;
use ph_core::{
    FuncAvailability, FuncError, FuncResult, HandlerConfig, HandlerPlugin, PluginContext,
    PluginFactory, SiteUsage, StatRequest, Transaction, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// IsmecaFactory - PluginFactory implementation
// =============================================================================

static MODELS: &[&str] = &["NY20", "NX16"];

/// Factory for Ismeca handler plugins.
pub struct IsmecaFactory;

impl PluginFactory for IsmecaFactory {
    fn driver_type(&self) -> &'static str {
        "ismeca"
    }

    fn name(&self) -> &'static str {
        "Ismeca NY20/NX16"
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn availability(&self) -> FuncAvailability {
        IsmecaPlugin::AVAILABILITY
    }

    fn validate(&self, config: &HandlerConfig) -> Result<()> {
        ph_core::plugin::check_model(&config.model, MODELS)?;
        if reprobe_bin_missing(config) {
            anyhow::bail!(
                "automatic_reprobe_mode {:?} needs handler_reprobe_bin",
                config.automatic_reprobe_mode
            );
        }
        Ok(())
    }

    fn build(&self, ctx: PluginContext) -> BoxFuture<'static, Result<Arc<dyn HandlerPlugin>>> {
        Box::pin(async move {
            let link = open_transport(&ctx.config)
                .await
                .context("failed to open Ismeca handler interface")?;
            // the handler needs a moment to reset its interface
            tokio::time::sleep(Duration::from_secs(1)).await;
            info!(model = %ctx.config.model, "Ismeca handler interface open");
            Ok(Arc::new(IsmecaPlugin::new(ctx, Arc::new(link))) as Arc<dyn HandlerPlugin>)
        })
    }
}

/// A reprobe mode was chosen without the bin that carries it.
fn reprobe_bin_missing(config: &HandlerConfig) -> bool {
    config.automatic_reprobe_mode != ReprobeMode::Off && config.handler_reprobe_bin.is_none()
}

// =============================================================================
// IsmecaPlugin
// =============================================================================

#[derive(Debug, Clone)]
struct Settings {
    polling_interval: Duration,
    abort_on_ca_error: bool,
    reprobe_bin: Option<i64>,
    active: Vec<bool>,
    site_ids: Vec<String>,
    bin_ids: Vec<String>,
}

pub struct IsmecaPlugin {
    ctx: PluginContext,
    settings: Settings,
    link: Arc<dyn Transport>,
    trx: Mutex<Transaction>,
    /// Peripheral ID from `CD`, asked once.
    equipment: SyncMutex<Option<String>>,
}

/// Give up the current exchange: it starts over from `mark` next time.
fn start_over<T>(trx: &mut Transaction, mark: usize, err: IsmecaError) -> FuncResult<T> {
    debug!("{}, will retry", err);
    trx.rewind(mark);
    Err(err.into())
}

impl IsmecaPlugin {
    pub const AVAILABILITY: FuncAvailability = FuncAvailability::MINIMUM
        .union(FuncAvailability::RECONFIGURE)
        .union(FuncAvailability::DRIVERID)
        .union(FuncAvailability::EQUIPID)
        .union(FuncAvailability::REPROBE)
        .union(FuncAvailability::BINREPR)
        .union(FuncAvailability::STATUS);

    pub fn new(ctx: PluginContext, link: Arc<dyn Transport>) -> Self {
        let config = &ctx.config;
        if config.waiting_for_parts_method == Some(PartsMethod::Interrupt) {
            warn!("Ismeca doesn't support interrupt mode, the interrupt setting is ignored");
        }
        let settings = Settings {
            polling_interval: config.polling_interval_or(Duration::from_millis(200)),
            abort_on_ca_error: config.ismeca_handler_abort_error_ca_response.unwrap_or(false),
            reprobe_bin: config.handler_reprobe_bin.map(i64::abs),
            active: config.active_sites(),
            site_ids: config.handler_site_ids.clone(),
            bin_ids: config.handler_bin_ids.clone(),
        };
        if let Some(bin) = settings.reprobe_bin {
            debug!("will send bin {} upon receiving a reprobe", bin);
        }
        let trx = Transaction::new(config.heartbeat());
        Self {
            ctx,
            settings,
            link,
            trx: Mutex::new(trx),
            equipment: SyncMutex::new(None),
        }
    }

    fn sites(&self) -> usize {
        self.settings.active.len()
    }

    /// ENQ, ACK and the framed `command`, without waiting for a reply.
    async fn announce(&self, trx: &mut Transaction, command: &str) -> FuncResult<()> {
        let mark = trx.mark();
        trx.send(&*self.link, &ENQ.to_string()).await?;
        let ack = trx.receive(&*self.link).await?;
        if let Err(e) = protocol::expect_control(&ack, ACK) {
            return start_over(trx, mark, e);
        }
        trx.send(&*self.link, &protocol::framed(command)).await
    }

    /// Full request/reply exchange of `command`, returning the framed reply.
    async fn exchange(&self, trx: &mut Transaction, command: &str) -> FuncResult<String> {
        let mark = trx.mark();
        self.announce(trx, command).await?;
        let enq = trx.receive(&*self.link).await?;
        if let Err(e) = protocol::expect_control(&enq, ENQ) {
            return start_over(trx, mark, e);
        }
        trx.send(&*self.link, &ACK.to_string()).await?;
        let reply = trx.receive(&*self.link).await?;
        debug!(command, reply = ?reply, "handler reply");
        Ok(reply)
    }

    /// Ask the peripheral ID with `CD`.
    async fn request_peripheral_id(&self, trx: &mut Transaction) -> FuncResult<String> {
        let mark = trx.mark();
        let reply = self.exchange(trx, "CD").await?;
        match protocol::unframe(&reply) {
            Ok(id) if !id.is_empty() => {
                let id = id.to_string();
                *self.equipment.lock() = Some(id.clone());
                // later steps of this call start from here
                trx.rewind(mark);
                Ok(id)
            }
            Ok(_) => start_over(trx, mark, IsmecaError::Unframed(reply)),
            Err(e) => start_over(trx, mark, e),
        }
    }

    async fn poll_parts(&self, trx: &mut Transaction) -> FuncResult<Vec<bool>> {
        let identified = self.equipment.lock().is_some();
        if !identified {
            self.request_peripheral_id(trx).await?;
        }

        let mark = trx.mark();
        let reply = self.exchange(trx, "CA").await?;
        let payload = match protocol::unframe(&reply) {
            Ok(payload) => payload,
            Err(e) => return start_over(trx, mark, e),
        };
        match CaResponse::parse(payload) {
            CaResponse::Clear => {}
            other => {
                match other {
                    CaResponse::NoMoreProduct => {
                        warn!("Test site EMPTY and no more product available!")
                    }
                    CaResponse::CannotBin => warn!("Device cannot be put in the desired bin!"),
                    _ => warn!(reply = %payload, "others error!"),
                }
                trx.rewind(mark);
                return Err(if self.settings.abort_on_ca_error {
                    FuncError::Aborted
                } else {
                    FuncError::Waiting
                });
            }
        }

        let reply = self.exchange(trx, "CE").await?;
        let payload = match protocol::unframe(&reply) {
            Ok(payload) => payload,
            Err(e) => return start_over(trx, mark, e),
        };
        if payload.is_empty() {
            return Ok(vec![false; self.sites()]);
        }
        debug!("poll parts devices is {:?} (polled)", payload);
        protocol::parse_sites(payload, self.sites()).map_err(|e| {
            error!("{}", e);
            e.into()
        })
    }

    /// Poll until a device shows up or the heartbeat passed.
    async fn wait_for_parts(&self, trx: &mut Transaction) -> FuncResult<Vec<bool>> {
        let started = Instant::now();
        tokio::time::sleep(self.settings.polling_interval).await;
        loop {
            let mark = trx.mark();
            let pending = self.poll_parts(trx).await?;
            if pending.contains(&true) || started.elapsed() > trx.heartbeat() {
                return Ok(pending);
            }
            trx.rewind(mark);
            tokio::time::sleep(self.settings.polling_interval).await;
        }
    }

    /// Send a `BA` command for every present device. Sites flagged in
    /// `to_reprobe` get the reprobe bin.
    async fn bin_and_reprobe(
        &self,
        trx: &mut Transaction,
        old: &[SiteUsage],
        to_reprobe: Option<&[bool]>,
        bins: &[i64],
    ) -> FuncResult {
        let mut entries = Vec::new();
        for (i, usage) in old.iter().enumerate() {
            let site = self.settings.site_ids.get(i).map(String::as_str).unwrap_or("");
            if !self.settings.active.get(i).copied().unwrap_or(false) || !usage.holds_device() {
                debug!("no device to reprobe or bin at site \"{}\"", site);
                continue;
            }
            let reprobe = to_reprobe.and_then(|r| r.get(i)).copied().unwrap_or(false);
            let bin = if reprobe {
                let Some(bin) = self.settings.reprobe_bin else {
                    error!(
                        "site \"{}\" needs reprobe while handler_reprobe_bin is not set, \
                         please check automatic_reprobe_mode and handler_reprobe_bin",
                        site
                    );
                    return Err(FuncError::Binning);
                };
                debug!("site \"{}\" needs reprobe", site);
                bin
            } else {
                let bin = bins.get(i).copied().unwrap_or(-1);
                protocol::bin_number(bin, &self.settings.bin_ids).map_err(|e| {
                    error!(site, "{}", e);
                    FuncError::from(e)
                })?
            };
            debug!("will bin device at site \"{}\" to {}", site, bin);
            entries.push((site, bin));
        }

        let Some(command) = protocol::ba_command(&entries) else {
            debug!("no device to bin");
            return Ok(());
        };
        self.announce(trx, &command).await?;
        debug!("sent command {:?}", command);
        Ok(())
    }
}

#[async_trait]
impl HandlerPlugin for IsmecaPlugin {
    fn availability(&self) -> FuncAvailability {
        Self::AVAILABILITY
    }

    #[instrument(skip(self), fields(model = %self.ctx.config.model))]
    async fn reconfigure(&self) -> FuncResult {
        self.ctx.abort.check()?;
        if reprobe_bin_missing(&self.ctx.config) {
            error!(
                "a reprobe mode has been defined without its corresponding bin number, \
                 please check the configuration values of automatic_reprobe_mode and \
                 handler_reprobe_bin"
            );
            return Err(FuncError::Config);
        }
        Ok(())
    }

    async fn driver_id(&self) -> FuncResult<String> {
        Ok(format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.ctx.config.model
        ))
    }

    #[instrument(skip(self), fields(model = %self.ctx.config.model))]
    async fn equipment_id(&self) -> FuncResult<String> {
        let known = self.equipment.lock().clone();
        if let Some(id) = known {
            return Ok(id);
        }
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::EQUIPID);
        let result = self.request_peripheral_id(&mut trx).await;
        trx.settle(result)
    }

    #[instrument(skip(self), fields(model = %self.ctx.config.model))]
    async fn get_start(&self) -> FuncResult {
        self.ctx.abort.check()?;
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::START);
        let result = self.wait_for_parts(&mut trx).await;
        let pending = trx.settle(result)?;
        if !pending.contains(&true) {
            return Err(FuncError::Waiting);
        }
        let population = population_from_pending(&pending, &self.settings.active, true);
        self.ctx.estate.set_sites(&population).map_err(|e| {
            error!("{}", e);
            FuncError::Fatal
        })
    }

    #[instrument(skip(self), fields(model = %self.ctx.config.model))]
    async fn bin_device(&self, bins: &[i64]) -> FuncResult {
        self.ctx.abort.check()?;
        let old = self.ctx.estate.sites();
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::BIN);
        let result = self.bin_and_reprobe(&mut trx, &old, None, bins).await;
        trx.settle(result)?;
        self.ctx.estate.mark_binned();
        Ok(())
    }

    async fn reprobe(&self) -> FuncResult {
        let Some(bin) = self.settings.reprobe_bin else {
            error!(
                "received reprobe command but no reprobe bin number defined, \
                 please check the configuration values of automatic_reprobe_mode and \
                 handler_reprobe_bin"
            );
            return Err(FuncError::Binning);
        };
        let sites = self.sites();
        self.bin_reprobe(&vec![true; sites], &vec![bin; sites]).await
    }

    #[instrument(skip(self), fields(model = %self.ctx.config.model))]
    async fn bin_reprobe(&self, to_reprobe: &[bool], bins: &[i64]) -> FuncResult {
        self.ctx.abort.check()?;
        let old = self.ctx.estate.sites();
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::BINREPR);
        let result = async {
            self.bin_and_reprobe(&mut trx, &old, Some(to_reprobe), bins)
                .await?;
            let mark = trx.mark();
            let pending = self.wait_for_parts(&mut trx).await?;
            if !pending.contains(&true) {
                trx.rewind(mark);
                return Err(FuncError::Waiting);
            }
            Ok(pending)
        }
        .await;
        let pending = trx.settle(result)?;

        self.ctx.estate.set_paused(false);
        let population =
            population_after_reprobe(&old, &self.settings.active, to_reprobe, &pending);
        self.ctx.estate.set_sites(&population).map_err(|e| {
            error!("{}", e);
            FuncError::Fatal
        })
    }

    async fn status(&self, request: StatRequest) -> FuncResult<bool> {
        if matches!(request, StatRequest::Reset | StatRequest::Handled) {
            self.trx.lock().await.reset();
        }
        self.ctx.abort.apply(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ETX, STX};
    use ph_core::{InterfaceKind, StreamTransport};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tracing_test::traced_test;

    struct Bench {
        plugin: IsmecaPlugin,
        handler: BufReader<DuplexStream>,
    }

    impl Bench {
        fn new(config: HandlerConfig) -> Self {
            let (handler, device) = tokio::io::duplex(1024);
            let link = StreamTransport::new(Box::new(device), InterfaceKind::Rs232, "\r\n");
            Self {
                plugin: IsmecaPlugin::new(PluginContext::new(config), Arc::new(link)),
                handler: BufReader::new(handler),
            }
        }

        /// Skip the `CD` request of the first poll.
        fn known(self) -> Self {
            *self.plugin.equipment.lock() = Some("NY20".into());
            self
        }

        async fn say(&mut self, line: &str) {
            self.handler
                .get_mut()
                .write_all(format!("{}\r\n", line).as_bytes())
                .await
                .unwrap();
        }

        /// Handler side of a complete exchange answering `reply`.
        async fn answer(&mut self, reply: &str) {
            self.say(&ACK.to_string()).await;
            self.say(&ENQ.to_string()).await;
            self.say(&format!("{STX}{reply}{ETX}")).await;
        }

        async fn heard(&mut self) -> String {
            let mut line = String::new();
            self.handler.read_line(&mut line).await.unwrap();
            line.trim_end().to_string()
        }

        async fn heard_exchange(&mut self, command: &str) {
            assert_eq!(self.heard().await, ENQ.to_string());
            assert_eq!(self.heard().await, format!("{STX}{command}{ETX}"));
            assert_eq!(self.heard().await, ACK.to_string());
        }
    }

    fn config() -> HandlerConfig {
        HandlerConfig {
            driver_plugin: "ismeca".into(),
            model: "NY20".into(),
            interface_type: Some(InterfaceKind::Rs232),
            handler_site_ids: vec!["1".into(), "2".into(), "3".into()],
            flag_check_interval: Some(200.0),
            polling_interval: Some(1000.0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_poll_reads_peripheral_id() {
        let mut bench = Bench::new(config());
        bench.answer("NY20 V2.1").await;
        bench.answer("").await;
        bench.answer("1,3").await;
        assert_eq!(bench.plugin.get_start().await, Ok(()));
        bench.heard_exchange("CD").await;
        bench.heard_exchange("CA").await;
        bench.heard_exchange("CE").await;
        assert_eq!(
            bench.plugin.ctx.estate.sites(),
            vec![SiteUsage::Populated, SiteUsage::Empty, SiteUsage::Populated]
        );
        assert_eq!(
            bench.plugin.equipment_id().await.as_deref(),
            Ok("NY20 V2.1")
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn pending_error_keeps_waiting() {
        let mut bench = Bench::new(config()).known();
        bench.answer("K").await;
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Waiting));
        assert!(logs_contain("no more product available"));
    }

    #[tokio::test]
    async fn pending_error_aborts_when_configured() {
        let config = HandlerConfig {
            ismeca_handler_abort_error_ca_response: Some(true),
            ..config()
        };
        let mut bench = Bench::new(config).known();
        bench.answer("J").await;
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Aborted));
    }

    #[tokio::test]
    async fn refused_handshake_starts_over() {
        let mut bench = Bench::new(config()).known();
        bench.say("\u{15}").await;
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Waiting));
        assert_eq!(bench.heard().await, ENQ.to_string());

        bench.answer("").await;
        bench.answer("2").await;
        assert_eq!(bench.plugin.get_start().await, Ok(()));
        bench.heard_exchange("CA").await;
        bench.heard_exchange("CE").await;
    }

    #[tokio::test]
    async fn more_sites_than_configured_is_fatal() {
        let mut bench = Bench::new(config()).known();
        bench.answer("").await;
        bench.answer("1,2,3,4").await;
        assert_eq!(bench.plugin.get_start().await, Err(FuncError::Fatal));
    }

    #[tokio::test]
    async fn bins_name_sites() {
        let mut bench = Bench::new(config());
        bench
            .plugin
            .ctx
            .estate
            .set_sites(&[SiteUsage::Populated, SiteUsage::Empty, SiteUsage::Populated])
            .unwrap();
        bench.say(&ACK.to_string()).await;
        assert_eq!(bench.plugin.bin_device(&[3, -1, 0]).await, Ok(()));
        assert_eq!(bench.heard().await, ENQ.to_string());
        assert_eq!(bench.heard().await, format!("{STX}BA1,0,3;3,0,0{ETX}"));
        assert_eq!(bench.plugin.ctx.estate.sites(), vec![SiteUsage::Empty; 3]);
    }

    #[tokio::test]
    async fn illegal_bin_is_not_sent() {
        let bench = Bench::new(config());
        bench
            .plugin
            .ctx
            .estate
            .set_sites(&[SiteUsage::Populated, SiteUsage::Empty, SiteUsage::Empty])
            .unwrap();
        assert_eq!(
            bench.plugin.bin_device(&[32, -1, -1]).await,
            Err(FuncError::Binning)
        );
    }

    #[tokio::test]
    async fn reprobe_needs_reprobe_bin() {
        let bench = Bench::new(config());
        assert_eq!(bench.plugin.reprobe().await, Err(FuncError::Binning));
    }

    #[tokio::test]
    async fn reprobe_bins_and_waits_for_the_same_devices() {
        let config = HandlerConfig {
            handler_reprobe_bin: Some(9),
            ..config()
        };
        let mut bench = Bench::new(config).known();
        bench
            .plugin
            .ctx
            .estate
            .set_sites(&[SiteUsage::Populated, SiteUsage::Populated, SiteUsage::Empty])
            .unwrap();
        bench.say(&ACK.to_string()).await;
        bench.answer("").await;
        bench.answer("1,3").await;
        assert_eq!(
            bench
                .plugin
                .bin_reprobe(&[true, false, false], &[0, 4, 0])
                .await,
            Ok(())
        );
        assert_eq!(bench.heard().await, ENQ.to_string());
        assert_eq!(bench.heard().await, format!("{STX}BA1,0,9;2,0,4{ETX}"));
        bench.heard_exchange("CA").await;
        bench.heard_exchange("CE").await;
        // site 3 is new and waits for the next cycle
        assert_eq!(
            bench.plugin.ctx.estate.sites(),
            vec![SiteUsage::Populated, SiteUsage::Empty, SiteUsage::Empty]
        );
    }

    #[tokio::test]
    async fn reprobe_mode_without_bin_is_config_error() {
        let config = HandlerConfig {
            automatic_reprobe_mode: ReprobeMode::PerSite,
            ..config()
        };
        let bench = Bench::new(config);
        assert_eq!(bench.plugin.reconfigure().await, Err(FuncError::Config));
    }

    #[test]
    fn factory_validation() {
        let factory = IsmecaFactory;
        let value = toml::toml! {
            driver_plugin = "ismeca"
            model = "nx16"
            interface_type = "rs232"
            symbolic_interface_name = "/dev/ttyS0"
            handler_site_ids = ["1", "2"]
            automatic_reprobe_mode = "all"
            handler_reprobe_bin = 9
        };
        let config = HandlerConfig::from_value(toml::Value::Table(value)).unwrap();
        assert!(factory.validate(&config).is_ok());

        let no_bin = HandlerConfig {
            handler_reprobe_bin: None,
            ..config
        };
        assert!(factory.validate(&no_bin).is_err());
    }
}
