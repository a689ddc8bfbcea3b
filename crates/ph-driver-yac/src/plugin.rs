//! YAC HYAC8086 handler plugin.

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
use ph_driver_techwing::protocol::{self, WireError};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Slots of every `BINON` command.
const BIN_SLOTS: usize = 32;
/// Slot filler where no device was tested.
const NO_BINNING_RESULT: &str = "0";
/// Highest SmarTest bin index without configured handler bins.
const MAX_DEFAULT_BIN: i64 = 14;

/// Service request bits.
mod srq {
    pub const TEST_START: u8 = 0x01;
    pub const ALARM: u8 = 0x04;
    pub const TRANSMISSION_ERROR: u8 = 0x08;
}

// =============================================================================
// YacFactory - PluginFactory implementation
// =============================================================================

static MODELS: &[&str] = &["HYAC8086"];

/// Factory for YAC handler plugins.
pub struct YacFactory;

impl PluginFactory for YacFactory {
    fn driver_type(&self) -> &'static str {
        "yac"
    }

    fn name(&self) -> &'static str {
        "YAC HYAC8086"
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn availability(&self) -> FuncAvailability {
        YacPlugin::AVAILABILITY
    }

    fn validate(&self, config: &HandlerConfig) -> Result<()> {
        ph_core::plugin::check_model(&config.model, MODELS)?;
        if config.interface_type.is_none() {
            anyhow::bail!("interface_type must be configured for YAC handlers");
        }
        if config.site_count() > BIN_SLOTS {
            anyhow::bail!(
                "the HYAC8086 bins at most {} sites, {} configured",
                BIN_SLOTS,
                config.site_count()
            );
        }
        Ok(())
    }

    fn build(&self, ctx: PluginContext) -> BoxFuture<'static, Result<Arc<dyn HandlerPlugin>>> {
        Box::pin(async move {
            let link = open_transport(&ctx.config)
                .await
                .context("failed to open YAC handler interface")?;
            info!("YAC handler interface open");
            Ok(Arc::new(YacPlugin::new(ctx, Arc::new(link))) as Arc<dyn HandlerPlugin>)
        })
    }
}

// =============================================================================
// YacPlugin
// =============================================================================

#[derive(Debug, Clone)]
struct Settings {
    strict_polling: bool,
    polling_interval: Duration,
    verify_bins: bool,
    verify_retries: u32,
    active: Vec<bool>,
    bin_ids: Vec<String>,
}

pub struct YacPlugin {
    ctx: PluginContext,
    settings: Settings,
    link: Arc<dyn Transport>,
    trx: Mutex<Transaction>,
    /// `FR?` is only asked on the first reconfigure.
    first_reconfigure: AtomicBool,
    /// Alarm and transmission error bits of the last service request.
    handler_status: AtomicU8,
}

/// Parse `FULLSITES <hex>`, one 64 bit word with site 0 in bit 0.
fn parse_fullsites(answer: &str, sites: usize) -> Result<Vec<bool>, WireError> {
    const KEYWORD: &str = "FULLSITES";
    let trimmed = answer.trim();
    let word = trimmed
        .get(..KEYWORD.len())
        .filter(|head| head.eq_ignore_ascii_case(KEYWORD))
        .and_then(|_| trimmed.get(KEYWORD.len()..))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .ok_or_else(|| WireError::BadPopulation(answer.to_string()))?;
    let pending: Vec<bool> = (0..sites.min(64)).map(|s| word & (1u64 << s) != 0).collect();
    if sites < 64 && word >> sites != 0 {
        warn!(
            sites,
            "handler seems to present more devices than configured, \
             the driver configuration must be changed to support more sites"
        );
    }
    Ok(pending)
}

/// Readable form of the alarm and transmission error bits.
fn describe_status(status: u8) -> String {
    let mut parts = Vec::new();
    if status & srq::ALARM != 0 {
        parts.push("Alarm");
    }
    if status & srq::TRANSMISSION_ERROR != 0 {
        parts.push("Error of transmission");
    }
    format!("handler status: {}", parts.join(" & "))
}

impl YacPlugin {
    pub const AVAILABILITY: FuncAvailability = FuncAvailability::MINIMUM
        .union(FuncAvailability::RECONFIGURE)
        .union(FuncAvailability::DRIVERID)
        .union(FuncAvailability::STATUS)
        .union(FuncAvailability::COMMTEST);

    pub fn new(ctx: PluginContext, link: Arc<dyn Transport>) -> Self {
        let config = &ctx.config;
        let settings = Settings {
            strict_polling: config.waiting_for_parts_method == Some(PartsMethod::Polling),
            polling_interval: config.polling_interval_or(Duration::from_millis(200)),
            verify_bins: config.verify_bin_data.unwrap_or(false),
            verify_retries: config.verify_retry_count.unwrap_or(2),
            active: config.active_sites(),
            bin_ids: config.handler_bin_ids.clone(),
        };
        let trx = Transaction::new(config.heartbeat());
        Self {
            ctx,
            settings,
            link,
            trx: Mutex::new(trx),
            first_reconfigure: AtomicBool::new(true),
            handler_status: AtomicU8::new(0),
        }
    }

    fn sites(&self) -> usize {
        self.settings.active.len()
    }

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
        parse_fullsites(&answer, self.sites()).map_err(protocol::reject)
    }

    async fn wait_for_parts(&self, trx: &mut Transaction) -> FuncResult<Vec<bool>> {
        if self.settings.strict_polling {
            let started = Instant::now();
            tokio::time::sleep(self.settings.polling_interval).await;
            let pending = loop {
                let mark = trx.mark();
                let pending = self.poll_parts(trx).await?;
                if pending.contains(&true) || started.elapsed() > trx.heartbeat() {
                    break pending;
                }
                trx.rewind(mark);
                tokio::time::sleep(self.settings.polling_interval).await;
            };
            self.flush_srqs().await?;
            return Ok(pending);
        }

        let Some(byte) = trx.wait_srq(&*self.link).await? else {
            return Ok(vec![false; self.sites()]);
        };
        let pending = if byte & srq::TEST_START != 0 {
            debug!("received generic test start SRQ, need to poll");
            self.poll_parts(trx).await?
        } else {
            vec![false; self.sites()]
        };
        let status = byte & (srq::ALARM | srq::TRANSMISSION_ERROR);
        self.handler_status.store(status, Ordering::SeqCst);
        if status != 0 {
            warn!("received exceptional SRQ 0x{:02x}: {}", byte, describe_status(status));
        }
        Ok(pending)
    }

    fn check_bins(&self, occupied: &[bool], bins: &[i64]) -> Result<(), WireError> {
        if !self.settings.bin_ids.is_empty() {
            return Ok(());
        }
        let out_of_range = occupied
            .iter()
            .zip(bins)
            .find(|(occupied, bin)| **occupied && !(0..=MAX_DEFAULT_BIN).contains(*bin));
        match out_of_range {
            Some((_, &bin)) => Err(WireError::BadBin {
                bin,
                available: MAX_DEFAULT_BIN as usize + 1,
            }),
            None => Ok(()),
        }
    }

    async fn send_binon(&self, trx: &mut Transaction, msg: &str) -> FuncResult {
        trx.send(&*self.link, msg).await?;
        if !self.settings.verify_bins {
            return Ok(());
        }
        debug!("will perform bin verification");
        let echo = trx.receive(&*self.link).await?;
        if protocol::echo_matches(msg, &echo, ':', BIN_SLOTS) {
            debug!("bin verification succeeded");
            trx.send(&*self.link, "ECHOOK").await
        } else {
            warn!(sent = %msg, received = %echo, "bin verification failed");
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
            .map(|(usage, active)| *active && usage.holds_device())
            .collect();
        self.check_bins(&occupied, bins).map_err(protocol::reject)?;
        let msg = protocol::binon_message(
            "BINON:",
            BIN_SLOTS,
            NO_BINNING_RESULT,
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
            let retry = result == Err(FuncError::Binning)
                && self.settings.verify_bins
                && attempt <= self.settings.verify_retries;
            if !retry {
                return result;
            }
            warn!(
                "will try to send bin data {} more time(s) before giving up",
                1 + self.settings.verify_retries - attempt
            );
            trx.rewind(mark);
        }
    }
}

#[async_trait]
impl HandlerPlugin for YacPlugin {
    fn availability(&self) -> FuncAvailability {
        Self::AVAILABILITY
    }

    #[instrument(skip(self))]
    async fn reconfigure(&self) -> FuncResult {
        self.ctx.abort.check()?;
        if !self.first_reconfigure.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::RECONFIGURE);
        let result = async {
            let running = trx.query(&*self.link, "FR?").await?;
            debug!(answer = %running, "FR? handler running state");
            self.flush_srqs().await
        }
        .await;
        if result.is_ok() {
            self.first_reconfigure.store(false, Ordering::SeqCst);
        }
        trx.settle(result)
    }

    async fn driver_id(&self) -> FuncResult<String> {
        Ok(format!(
            "{} {} (HYAC8086)",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ))
    }

    #[instrument(skip(self))]
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
            tracing::error!("{}", e);
            FuncError::Fatal
        })
    }

    #[instrument(skip(self))]
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

    #[instrument(skip(self))]
    async fn comm_test(&self) -> FuncResult<bool> {
        self.ctx.abort.check()?;
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::COMMTEST);
        let result = trx.query(&*self.link, "FR?").await;
        let running = trx.settle(result)?;
        debug!("FR? handler running returns \"{}\"", running);
        Ok(true)
    }
}
