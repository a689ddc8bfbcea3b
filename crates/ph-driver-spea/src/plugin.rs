//! SPEA H3570 plugin and its factory.

use crate::protocol::{self, QueryAnswer, NO_BINNING_RESULT};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
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
// SpeaFactory - PluginFactory implementation
// =============================================================================

static MODELS: &[&str] = &["H3570"];

/// Factory for SPEA handler plugins.
pub struct SpeaFactory;

impl PluginFactory for SpeaFactory {
    fn driver_type(&self) -> &'static str {
        "spea"
    }

    fn name(&self) -> &'static str {
        "SPEA H3570"
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn availability(&self) -> FuncAvailability {
        SpeaPlugin::AVAILABILITY
    }

    fn validate(&self, config: &HandlerConfig) -> Result<()> {
        ph_core::plugin::check_model(&config.model, MODELS)?;
        if reprobe_bin_missing(config) {
            anyhow::bail!(
                "automatic_reprobe_mode is {:?} but handler_reprobe_bin is not set",
                config.automatic_reprobe_mode
            );
        }
        Ok(())
    }

    fn build(&self, ctx: PluginContext) -> BoxFuture<'static, Result<Arc<dyn HandlerPlugin>>> {
        Box::pin(async move {
            let link = open_transport(&ctx.config)
                .await
                .context("failed to open SPEA handler connection")?;
            tokio::time::sleep(Duration::from_secs(1)).await;
            info!("SPEA handler connection open");
            Ok(Arc::new(SpeaPlugin::new(ctx, Arc::new(link))) as Arc<dyn HandlerPlugin>)
        })
    }
}

fn reprobe_bin_missing(config: &HandlerConfig) -> bool {
    config.automatic_reprobe_mode != ReprobeMode::Off && config.handler_reprobe_bin.is_none()
}

// =============================================================================
// SpeaPlugin
// =============================================================================

#[derive(Debug, Clone)]
struct Settings {
    polling_interval: Duration,
    reprobe_bin: Option<i64>,
    active: Vec<bool>,
    site_ids: Vec<String>,
    bin_ids: Vec<String>,
}

pub struct SpeaPlugin {
    ctx: PluginContext,
    settings: Settings,
    link: Arc<dyn Transport>,
    trx: Mutex<Transaction>,
}

impl SpeaPlugin {
    pub const AVAILABILITY: FuncAvailability = FuncAvailability::MINIMUM
        .union(FuncAvailability::RECONFIGURE)
        .union(FuncAvailability::DRIVERID)
        .union(FuncAvailability::EQUIPID)
        .union(FuncAvailability::REPROBE)
        .union(FuncAvailability::BINREPR)
        .union(FuncAvailability::STATUS)
        .union(FuncAvailability::SET_STATUS);

    pub fn new(ctx: PluginContext, link: Arc<dyn Transport>) -> Self {
        let config = &ctx.config;
        if config.waiting_for_parts_method == Some(PartsMethod::Interrupt) {
            warn!("SPEA doesn't support interrupt mode, the interrupt setting is ignored");
        }
        let settings = Settings {
            polling_interval: config.polling_interval_or(Duration::from_millis(200)),
            reprobe_bin: config.handler_reprobe_bin.map(i64::abs),
            active: config.active_sites(),
            site_ids: config.handler_site_ids.clone(),
            bin_ids: config.handler_bin_ids.clone(),
        };
        let trx = Transaction::new(config.heartbeat());
        Self {
            ctx,
            settings,
            link,
            trx: Mutex::new(trx),
        }
    }

    fn sites(&self) -> usize {
        self.settings.active.len()
    }

    fn site_id(&self, site: usize) -> &str {
        self.settings
            .site_ids
            .get(site)
            .map(String::as_str)
            .unwrap_or("?")
    }

    /// One `QUERY`. Anything but a site list is forgotten again and ends
    /// the call.
    async fn poll_parts(&self, trx: &mut Transaction) -> FuncResult<Vec<bool>> {
        let mark = trx.mark();
        let answer = trx.query(&*self.link, "QUERY").await?;
        let outcome = match QueryAnswer::parse(&answer) {
            QueryAnswer::Test(flags) => {
                if flags.len() > self.sites() {
                    warn!(
                        "The handler seems to present more devices than configured, \
                         the driver configuration must be changed to support more sites"
                    );
                }
                let mut pending = flags;
                pending.resize(self.sites(), false);
                for (i, present) in pending.iter().enumerate() {
                    if *present {
                        debug!("device present at site \"{}\" (polled)", self.site_id(i));
                    } else {
                        debug!("no device at site \"{}\" (polled)", self.site_id(i));
                    }
                }
                return Ok(pending);
            }
            QueryAnswer::EndLot => {
                if !self.ctx.estate.lot_started() {
                    warn!("Lot is not started but END_LOT is received from the handler");
                }
                self.ctx.estate.set_lot_started(false);
                Err(FuncError::LotDone)
            }
            QueryAnswer::StartLot => {
                if self.ctx.estate.lot_started() {
                    warn!("Repeated START_LOT (no END_LOT yet) is received from the handler");
                }
                self.ctx.estate.set_lot_started(true);
                Err(FuncError::Waiting)
            }
            QueryAnswer::Idle(what) | QueryAnswer::LotInfo(what) => {
                debug!("{} received from the handler, continue querying", what);
                Err(FuncError::Waiting)
            }
            QueryAnswer::MalformedTest(what) => {
                warn!(
                    "Incorrect site population received from handler: {:?}, \
                     format expected \"TEST x,x,x,x\"",
                    what
                );
                Err(FuncError::Waiting)
            }
            QueryAnswer::Unknown(what) => {
                error!("Unknown answer returned from handler: {}, will send QUERY again", what);
                Err(FuncError::Waiting)
            }
        };
        trx.rewind(mark);
        outcome
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

    /// Send `RESULT` with a code for every site. Sites flagged in
    /// `to_reprobe` get the reprobe bin.
    async fn bin_and_reprobe(
        &self,
        trx: &mut Transaction,
        old: &[SiteUsage],
        to_reprobe: Option<&[bool]>,
        bins: &[i64],
    ) -> FuncResult {
        let mut codes = Vec::with_capacity(self.sites());
        let mut any_device = false;
        for i in 0..self.sites() {
            let site = self.site_id(i);
            let holds = old.get(i).copied().unwrap_or_default().holds_device();
            if !self.settings.active[i] || !holds {
                debug!(
                    "no device to bin at site \"{}\", use {} as bin ID",
                    site, NO_BINNING_RESULT
                );
                codes.push(NO_BINNING_RESULT.to_string());
                continue;
            }
            any_device = true;
            if to_reprobe.and_then(|r| r.get(i)).copied().unwrap_or(false) {
                let Some(bin) = self.settings.reprobe_bin else {
                    error!(
                        "received reprobe command at site \"{}\" but no reprobe bin number \
                         defined, please check automatic_reprobe_mode and handler_reprobe_bin",
                        site
                    );
                    return Err(FuncError::Binning);
                };
                debug!("will reprobe device at site \"{}\"", site);
                codes.push(bin.to_string());
                continue;
            }
            let bin = bins.get(i).copied().unwrap_or(-1);
            let Some(code) = protocol::bin_code(bin, &self.settings.bin_ids) else {
                error!(
                    "unable to send binning at site \"{}\": bin index {} has no handler bin",
                    site, bin
                );
                return Err(FuncError::Binning);
            };
            debug!("will bin device at site \"{}\" to {}", site, code);
            codes.push(code);
        }

        if !any_device {
            debug!("no device to bin");
            return Ok(());
        }
        let mark = trx.mark();
        let command = protocol::result_command(&codes);
        let answer = trx.query(&*self.link, &command).await?;
        if !answer.trim().eq_ignore_ascii_case("ACK") {
            error!(
                "Expecting ACK but the response {:?} is received for the RESULT command, try again",
                answer
            );
            trx.rewind(mark);
            return Err(FuncError::Waiting);
        }
        Ok(())
    }
}

#[async_trait]
impl HandlerPlugin for SpeaPlugin {
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
        Ok(format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
    }

    async fn equipment_id(&self) -> FuncResult<String> {
        Ok(format!("SPEA {}", self.ctx.config.model))
    }

    #[instrument(skip(self), fields(model = %self.ctx.config.model))]
    async fn get_start(&self) -> FuncResult {
        self.ctx.abort.check()?;
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::START);
        let result = async {
            let mark = trx.mark();
            let pending = self.wait_for_parts(&mut trx).await?;
            if !pending.contains(&true) {
                trx.rewind(mark);
                return Err(FuncError::Waiting);
            }
            let mark = trx.mark();
            info!("Ready for test flow execution, send TEST RUN to the handler");
            let answer = trx.query(&*self.link, "TEST RUN").await?;
            if !answer.trim().eq_ignore_ascii_case("ACK") {
                warn!("received unexpected response {:?}, try to send again", answer);
                trx.rewind(mark);
                return Err(FuncError::Waiting);
            }
            Ok(pending)
        }
        .await;
        let pending = trx.settle(result)?;
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
                 please check automatic_reprobe_mode and handler_reprobe_bin"
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

    #[instrument(skip(self))]
    async fn set_status(&self, key: &str, value: &str) -> FuncResult {
        self.ctx.abort.check()?;
        let Some(command) = protocol::status_command(key, value) else {
            warn!("The key {:?} is not available, or may not be supported yet", key);
            return Err(FuncError::Answer);
        };
        debug!(command = %command, "set status");
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::SET_STATUS);
        let result = async {
            trx.send(&*self.link, &command).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            trx.receive(&*self.link).await
        }
        .await;
        let answer = trx.settle(result)?;
        if answer.trim() != "ACK" {
            error!("The handler didn't reply \"ACK\" to {}: {:?}", command, answer);
            return Err(FuncError::Answer);
        }
        Ok(())
    }
}
