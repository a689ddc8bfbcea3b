//! Mirae MR5800 / M660 / M330 handler plugin.

use crate::temperature::{TempControl, TempSetup};
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
use ph_driver_techwing::protocol::{self, srq, WireError, DONE, SETTING_OK};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Bin categories understood by `SETBIN`.
const BIN_CATEGORIES: usize = 15;

// =============================================================================
// MiraeFactory - PluginFactory implementation
// =============================================================================

static MODELS: &[&str] = &["MR5800", "M660", "M330"];

/// Factory for Mirae handler plugins.
pub struct MiraeFactory;

impl PluginFactory for MiraeFactory {
    fn driver_type(&self) -> &'static str {
        "mirae"
    }

    fn name(&self) -> &'static str {
        "Mirae MR5800/M660/M330"
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn availability(&self) -> FuncAvailability {
        MiraePlugin::AVAILABILITY
    }

    fn validate(&self, config: &HandlerConfig) -> Result<()> {
        ph_core::plugin::check_model(&config.model, MODELS)?;
        let model = Model::from_name(&config.model)
            .with_context(|| format!("unsupported Mirae model '{}'", config.model))?;
        if config.interface_type.is_none() {
            anyhow::bail!("interface_type must be configured for Mirae handlers");
        }
        let slots = model.bin_slots(config);
        if slots < config.site_count() {
            anyhow::bail!(
                "{} sites configured but BINON carries only {} (test_tray_test_in_parallel)",
                config.site_count(),
                slots
            );
        }
        TempSetup::from_config(config).context("invalid temperature control configuration")?;
        Ok(())
    }

    fn build(&self, ctx: PluginContext) -> BoxFuture<'static, Result<Arc<dyn HandlerPlugin>>> {
        Box::pin(async move {
            let model = Model::from_name(&ctx.config.model)
                .with_context(|| format!("unsupported Mirae model '{}'", ctx.config.model))?;
            let link = open_transport(&ctx.config)
                .await
                .context("failed to open Mirae handler interface")?;
            let plugin = MiraePlugin::new(ctx, model, Arc::new(link))?;
            info!(model = ?model, "Mirae handler interface open");
            Ok(Arc::new(plugin) as Arc<dyn HandlerPlugin>)
        })
    }
}

// =============================================================================
// MiraePlugin
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    Mr5800,
    M660,
    M330,
}

impl Model {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MR5800" => Some(Model::Mr5800),
            "M660" => Some(Model::M660),
            "M330" => Some(Model::M330),
            _ => None,
        }
    }

    fn site_select_command(self) -> &'static str {
        match self {
            Model::M660 => "CONTACTSEL",
            Model::Mr5800 | Model::M330 => "SITESEL",
        }
    }

    fn binon_prefix(self) -> &'static str {
        match self {
            Model::M330 => "BINON:",
            Model::Mr5800 | Model::M660 => "BINON ",
        }
    }

    fn echo_separator(self) -> char {
        match self {
            Model::M330 => ':',
            Model::Mr5800 | Model::M660 => ' ',
        }
    }

    fn status_query(self) -> &'static str {
        match self {
            Model::M660 => "HDLSTATUS?",
            Model::Mr5800 | Model::M330 => "STATUS?",
        }
    }

    /// Number of bin codes in a `BINON` command. Test tray handlers report
    /// every position of the tray in parallel.
    fn bin_slots(self, config: &HandlerConfig) -> usize {
        let parallel = config.test_tray_test_in_parallel.map(|p| p as usize);
        match self {
            Model::M330 => config.site_count(),
            Model::Mr5800 => parallel.unwrap_or(32),
            Model::M660 => parallel.unwrap_or(16),
        }
    }
}

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
    bin_slots: usize,
    temperature: TempSetup,
}

pub struct MiraePlugin {
    ctx: PluginContext,
    model: Model,
    settings: Settings,
    link: Arc<dyn Transport>,
    trx: Mutex<Transaction>,
    configured: AtomicBool,
}

/// Positive answers are "SettingOK" or "done".
fn accept(command: &str, answer: &str) -> Result<(), WireError> {
    protocol::expect_reply(command, answer, SETTING_OK)
        .or_else(|_| protocol::expect_reply(command, answer, DONE))
}

impl MiraePlugin {
    pub const AVAILABILITY: FuncAvailability = FuncAvailability::MINIMUM
        .union(FuncAvailability::RECONFIGURE)
        .union(FuncAvailability::DRIVERID)
        .union(FuncAvailability::STATUS)
        .union(FuncAvailability::COMMTEST)
        .union(FuncAvailability::LOT_START)
        .union(FuncAvailability::LOT_DONE)
        .union(FuncAvailability::GET_STATUS)
        .union(FuncAvailability::SET_STATUS);

    pub fn new(ctx: PluginContext, model: Model, link: Arc<dyn Transport>) -> Result<Self> {
        let config = &ctx.config;
        let settings = Settings {
            strict_polling: config.waiting_for_parts_method == Some(PartsMethod::Polling),
            polling_interval: config.polling_interval_or(Duration::from_millis(200)),
            verify_bins: config.verify_bin_data.unwrap_or(false),
            verify_retries: config.verify_retry_count.unwrap_or(2),
            send_site_selection: config.mirae_send_siteselection_cmd.unwrap_or(false),
            mask_pending: config.mask_device_pending(),
            active: config.active_sites(),
            bin_ids: config.handler_bin_ids.clone(),
            bin_slots: model.bin_slots(config),
            temperature: TempSetup::from_config(config)?,
        };
        let trx = Transaction::new(config.heartbeat());
        Ok(Self {
            ctx,
            model,
            settings,
            link,
            trx: Mutex::new(trx),
            configured: AtomicBool::new(false),
        })
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
        protocol::parse_fullsites(&answer, self.sites()).map_err(protocol::reject)
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

        match trx.wait_srq(&*self.link).await? {
            None => Ok(vec![false; self.sites()]),
            Some(srq::LOT_START) => {
                debug!("received lot start SRQ");
                Err(FuncError::LotStart)
            }
            Some(srq::DEVICE_READY) => {
                debug!("received generic test start SRQ, need to poll");
                self.poll_parts(trx).await
            }
            Some(srq::JAM) => {
                warn!("received JAM SRQ 0x3d");
                Err(FuncError::Jam)
            }
            Some(srq::LOT_END) => {
                debug!("received lot end SRQ");
                Err(FuncError::LotDone)
            }
            Some(other) => {
                error!("received exceptional SRQ 0x{:02X}", other);
                Err(FuncError::Answer)
            }
        }
    }

    async fn send_binon(&self, trx: &mut Transaction, msg: &str) -> FuncResult {
        trx.send(&*self.link, msg).await?;
        if !self.settings.verify_bins {
            return Ok(());
        }
        let echo = trx.receive(&*self.link).await?;
        if protocol::echo_matches(msg, &echo, self.model.echo_separator(), self.settings.bin_slots)
        {
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
            .map(|(usage, active)| *active && usage.holds_device())
            .collect();
        let msg = protocol::binon_message(
            self.model.binon_prefix(),
            self.settings.bin_slots,
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

    /// Send a setup command that answers "SettingOK" or "done".
    async fn setting(&self, trx: &mut Transaction, command: &str) -> FuncResult {
        let answer = trx.query(&*self.link, command).await?;
        accept(command, &answer).map_err(protocol::reject)?;
        debug!("sent {}", command);
        Ok(())
    }

    async fn send_test_set(&self, trx: &mut Transaction) -> FuncResult {
        let config = &self.ctx.config;
        let Some(parallel) = config.test_tray_test_in_parallel else {
            warn!("test_tray_test_in_parallel not given, TESTSET command will not be sent");
            return Ok(());
        };
        if ![32, 64, 128].contains(&parallel) {
            warn!(
                parallel,
                "test_tray_test_in_parallel should be 128, 64 or 32 and \
                 test_tray_test_in_parallel * test_tray_step should be 128"
            );
        }
        let step = config.test_tray_step.unwrap_or(4);
        if ![1, 2, 4].contains(&step) {
            warn!(step, "test_tray_step should be 1, 2 or 4");
        }
        let rows = config.test_tray_row.unwrap_or(0xf);
        self.setting(trx, &format!("TESTSET {},{},{:X}", parallel, step, rows))
            .await
    }

    async fn send_site_map(&self, trx: &mut Transaction) -> FuncResult {
        let map = &self.ctx.config.smartest_site_to_handler_site_map;
        if map.is_empty() {
            warn!("smartest_site_to_handler_site_map not given, SITEMAP command will not be sent");
            return Ok(());
        }
        let sites: Vec<String> = map.iter().map(|s| s.to_string()).collect();
        let command = format!("SITEMAP {};", sites.join(","));
        let answer = trx.query(&*self.link, &command).await?;
        // the handler echoes the map
        let echoed = answer
            .get(..command.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(&command));
        if !echoed {
            error!(sent = %command, received = %answer, "SITEMAP command returned an error");
            return Err(FuncError::Answer);
        }
        Ok(())
    }

    async fn send_site_selection(&self, trx: &mut Transaction) -> FuncResult {
        let keyword = self.model.site_select_command();
        if self.ctx.config.handler_site_mask.is_empty() {
            warn!("handler_site_mask not given, {} command will not be sent", keyword);
            return Ok(());
        }
        let command = format!("{} {}", keyword, protocol::site_mask_hex(&self.settings.active));
        self.setting(trx, &command).await
    }

    async fn send_bin_categories(&self, trx: &mut Transaction) -> FuncResult {
        let categories = &self.ctx.config.handler_bin_categories;
        if categories.is_empty() {
            warn!("handler_bin_categories not given, SETBIN command will not be sent");
            return Ok(());
        }
        let values: Vec<String> = (0..BIN_CATEGORIES)
            .map(|i| {
                categories
                    .get(i)
                    .and_then(|c| c.trim().parse::<f64>().ok())
                    .map(|c| c as i64)
                    .unwrap_or(0)
                    .to_string()
            })
            .collect();
        self.setting(trx, &format!("SETBIN {};", values.join(",")))
            .await
    }

    /// Setup of a stopped handler.
    async fn handler_setup(&self, trx: &mut Transaction) -> FuncResult {
        for command in self.settings.temperature.commands() {
            self.setting(trx, &command).await?;
        }
        if self.model == Model::Mr5800 {
            self.send_test_set(trx).await?;
            self.send_site_map(trx).await?;
        }
        if self.model != Model::M660 && self.settings.send_site_selection {
            self.send_site_selection(trx).await?;
        }
        if self.model == Model::Mr5800 {
            self.send_bin_categories(trx).await?;
        }
        self.flush_srqs().await
    }

    async fn configure_handler(&self, trx: &mut Transaction) -> FuncResult {
        let running = trx.query(&*self.link, "FR?").await?;
        debug!(answer = %running, "FR? handler running state");
        let stopped = ["FR 0", "FR0"]
            .iter()
            .any(|s| running.trim().eq_ignore_ascii_case(s));
        if stopped {
            self.handler_setup(trx).await
        } else {
            info!("handler is running, will not be reconfigured");
            Ok(())
        }
    }

    /// One setting command outside the device cycle.
    async fn set(&self, command: String) -> FuncResult {
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::SET_STATUS);
        let result = self.setting(&mut trx, &command).await;
        trx.settle(result)
    }
}

/// Handler query for a status key, `None` when the key is unknown.
fn status_query(model: Model, key: &str, param: &str) -> Option<String> {
    let query = match key {
        "version" => "VERSION?",
        "name" => "NAME?",
        "testset" => "TESTSET?",
        "settemp" => "SETTEMP?",
        "meastemp" if !param.is_empty() => return Some(format!("MEASTEMP {}?", param)),
        "status" => model.status_query(),
        "jam" => "JAM?",
        "jamcode" => "JAMCODE?",
        "jamque" => "JAMQUE?",
        "jamcount" => "JAMCOUNT?",
        "setlamp" => "SETLAMP?",
        "loterrcode" => "LOTERRCODE?",
        "lotalmcode" => "LOTALMCODE?",
        "lotdata" => "LOTDATA?",
        "accsortdvc" => "ACCSORTDVC?",
        "accjamcode" => "ACCJAMCODE?",
        "accerrcode" => "ACCERRCODE?",
        "accdata" => "ACCDATA?",
        "trayid" => "TRAY_ID?",
        "alarmrecord" => "ALMRECORD?",
        "tempmode" | "temperature_tempcontrol" => "TEMPMODE?",
        "lottotal" => "LOTTOTAL2?",
        _ => return None,
    };
    Some(query.to_string())
}

/// Handler command for a status key. `Ok(None)` marks an unsupported key or
/// a missing parameter.
fn status_command(model: Model, key: &str, value: &str) -> FuncResult<Option<String>> {
    let value = value.trim();
    let flag = |what: &str| -> FuncResult<Option<String>> {
        match value.parse::<i64>() {
            Ok(v @ (0 | 1)) => Ok(Some(format!("{} {}", what, v))),
            Ok(v) => {
                warn!(key, value = v, "expected 0 or 1");
                Err(FuncError::Config)
            }
            Err(_) => Ok(None),
        }
    };
    let command = match key {
        "start" => Some("START".to_string()),
        "stop" => Some("STOP".to_string()),
        "loader" => Some("LOADER".to_string()),
        "lotclear" => Some("LOTCLEAR".to_string()),
        "accclear" => Some("ACCCLEAR".to_string()),
        "plunger" => return flag("PLUNGER"),
        "runmode" => return flag("RUNMODE"),
        "name" if value.is_empty() => None,
        "name" => {
            if value.len() > 12 {
                warn!(value, "handler name must have 1 to 12 characters");
                return Err(FuncError::Config);
            }
            Some(format!("SETNAME {}", value))
        }
        "contactsel" | "sitesel" if value.is_empty() => None,
        "contactsel" | "sitesel" => {
            if value.len() > 64 {
                warn!(value, "site selection must have 1 to 64 hex digits");
                return Err(FuncError::Config);
            }
            Some(format!("{} {}", model.site_select_command(), value))
        }
        "tempmode" | "temperature_tempcontrol" => TempControl::parse(value)
            .map(|mode| format!("TEMPCTRL {}", mode.code())),
        _ => None,
    };
    Ok(command)
}

#[async_trait]
impl HandlerPlugin for MiraePlugin {
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
            Ok(Some(srq::DEVICE_READY)) => {
                warn!("received device start SRQ while waiting for lot start");
                Err(FuncError::DeviceStart)
            }
            Ok(Some(srq::JAM)) => {
                warn!("received JAM SRQ while waiting for lot start");
                Err(FuncError::Jam)
            }
            Ok(Some(srq::LOT_END)) => {
                warn!("received lot end SRQ while waiting for lot start");
                Err(FuncError::LotDone)
            }
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
        let Some(query) = status_query(self.model, &name.to_ascii_lowercase(), param.trim())
        else {
            debug!(key = %name, "status key not available for Mirae handlers");
            return Ok(format!("{}_KEY_NOT_AVAILABLE", name));
        };
        let mut trx = self.trx.lock().await;
        trx.begin(FuncAvailability::GET_STATUS);
        let result = trx.query(&*self.link, &query).await;
        trx.settle(result)
    }

    #[instrument(skip(self), fields(model = ?self.model))]
    async fn set_status(&self, key: &str, value: &str) -> FuncResult {
        self.ctx.abort.check()?;
        match status_command(self.model, &key.trim().to_ascii_lowercase(), value)? {
            Some(command) => self.set(command).await,
            None => {
                warn!(
                    "The command \"{} {}\" is invalid or not supported yet",
                    key, value
                );
                Ok(())
            }
        }
    }
}
