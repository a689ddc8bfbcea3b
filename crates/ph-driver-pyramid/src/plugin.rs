//! Pyramid plugin and its factory.

use crate::gem::{self, ceid, process, Event};
use crate::hsms::Message;
use crate::secs::Item;
use crate::session::{select_status, Session};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use ph_core::estate::population_from_pending;
use ph_core::serial::connect_tcp;
use ph_core::{
    FuncAvailability, FuncError, FuncResult, HandlerConfig, HandlerPlugin, InterfaceKind,
    PluginContext, PluginFactory, StatRequest,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// PyramidFactory - PluginFactory implementation
// =============================================================================

static MODELS: &[&str] = &["PYRAMID"];

/// Factory for Pyramid handler plugins.
pub struct PyramidFactory;

impl PluginFactory for PyramidFactory {
    fn driver_type(&self) -> &'static str {
        "pyramid"
    }

    fn name(&self) -> &'static str {
        "Pyramid (SECS/GEM)"
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn availability(&self) -> FuncAvailability {
        PyramidPlugin::AVAILABILITY
    }

    fn validate(&self, config: &HandlerConfig) -> Result<()> {
        ph_core::plugin::check_model(&config.model, MODELS)?;
        if config.interface_type != Some(InterfaceKind::Lan) {
            anyhow::bail!("Pyramid handlers are only reachable over LAN");
        }
        if config.symbolic_interface_name.is_empty() {
            anyhow::bail!("symbolic_interface_name must hold the handler address");
        }
        Ok(())
    }

    fn build(&self, ctx: PluginContext) -> BoxFuture<'static, Result<Arc<dyn HandlerPlugin>>> {
        Box::pin(async move {
            let stream = connect_tcp(
                &ctx.config.symbolic_interface_name,
                ctx.config.server_port,
                Duration::from_secs(5),
            )
            .await
            .context("failed to connect to Pyramid handler")?;
            let plugin = PyramidPlugin::new(ctx, stream);
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(Arc::new(plugin) as Arc<dyn HandlerPlugin>)
        })
    }
}

// =============================================================================
// PyramidPlugin
// =============================================================================

#[derive(Debug, Clone)]
struct Settings {
    heartbeat: Duration,
    active: Vec<bool>,
    site_ids: Vec<String>,
    bin_ids: Vec<String>,
}

/// Where `lot_start` resumes after a `Waiting` return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum LotStep {
    #[default]
    CheckStatus,
    AwaitReady,
    Load,
    AwaitLoaded,
    Start,
    AwaitStarted,
    StartTest,
}

/// Where `comm_test` resumes. The session stays selected once the handler
/// accepted the select.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum SetupStep {
    #[default]
    Select,
    Establish,
    Configure(usize),
}

/// Where a retest from the bin tray resumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum RetestStep {
    #[default]
    AwaitSorted,
    Stop,
    AwaitStopped,
    Retest,
    AwaitStarted,
    StartTest,
}

/// Request sent on an earlier call whose reply has not arrived yet.
#[derive(Debug, Clone)]
struct Owed {
    label: &'static str,
    system: u32,
}

#[derive(Debug, Default)]
struct Exchange {
    setup: SetupStep,
    lot: LotStep,
    retest: RetestStep,
    start_sent: bool,
    device_got: bool,
    owed: Option<Owed>,
    /// Site count the handler reported with its last device ready event.
    handler_sites: Option<usize>,
}

impl Exchange {
    fn finish_lot_steps(&mut self) {
        self.lot = LotStep::default();
        self.retest = RetestStep::default();
        self.start_sent = false;
        self.owed = None;
    }
}

/// Values set through `set_status` and collected from events.
#[derive(Debug)]
struct StatusValues {
    lot_id: String,
    quantity: String,
    summary_name: Option<String>,
    barcodes: String,
    /// The last retest request found no device in its bin tray.
    no_need_retest: bool,
}

impl Default for StatusValues {
    fn default() -> Self {
        Self {
            lot_id: "1".into(),
            quantity: "100".into(),
            summary_name: None,
            barcodes: String::new(),
            no_need_retest: false,
        }
    }
}

pub struct PyramidPlugin {
    ctx: PluginContext,
    settings: Settings,
    session: Session,
    exchange: Mutex<Exchange>,
    values: parking_lot::Mutex<StatusValues>,
}

impl PyramidPlugin {
    pub const AVAILABILITY: FuncAvailability = FuncAvailability::MINIMUM
        .union(FuncAvailability::DRIVERID)
        .union(FuncAvailability::EQUIPID)
        .union(FuncAvailability::STATUS)
        .union(FuncAvailability::COMMTEST)
        .union(FuncAvailability::LOT_START)
        .union(FuncAvailability::LOT_DONE)
        .union(FuncAvailability::GET_STATUS)
        .union(FuncAvailability::SET_STATUS);

    /// Take over an established connection to the handler.
    pub fn new<S>(ctx: PluginContext, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = &ctx.config;
        let settings = Settings {
            heartbeat: config.heartbeat(),
            active: config.active_sites(),
            site_ids: config.handler_site_ids.clone(),
            bin_ids: config.handler_bin_ids.clone(),
        };
        let session = Session::start(stream, settings.heartbeat);
        Self {
            ctx,
            settings,
            session,
            exchange: Mutex::new(Exchange::default()),
            values: parking_lot::Mutex::new(StatusValues::default()),
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

    fn parse_event(message: &Message) -> FuncResult<Event> {
        message.body.as_ref().and_then(Event::parse).ok_or_else(|| {
            warn!("{} without a readable event report", message.label());
            FuncError::Waiting
        })
    }

    /// Wait one heartbeat for event `wanted`. Other events are dropped.
    async fn await_event(&self, wanted: u32) -> FuncResult<Event> {
        let Some(message) = self.session.next_event(self.settings.heartbeat).await? else {
            debug!("no event {} within {:?}", wanted, self.settings.heartbeat);
            return Err(FuncError::Waiting);
        };
        let event = Self::parse_event(&message)?;
        if event.ceid != wanted {
            debug!("received event {}, expected {}", event.ceid, wanted);
            return Err(FuncError::Waiting);
        }
        Ok(event)
    }

    /// Wait for the reply to a request, sending it through `send` unless
    /// an earlier call already sent it under the same `label`. A reply that
    /// does not arrive in time stays owed for the next call.
    async fn owed_reply<F, Fut>(
        &self,
        owed: &mut Option<Owed>,
        label: &'static str,
        send: F,
    ) -> FuncResult<Message>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FuncResult<u32>>,
    {
        let system = match owed.take() {
            Some(pending) if pending.label == label => {
                debug!("{} already sent, waiting for its reply", label);
                pending.system
            }
            stale => {
                if let Some(pending) = stale {
                    debug!("no longer waiting for the reply to {}", pending.label);
                }
                send().await?
            }
        };
        match self.session.await_reply(system, label).await {
            Err(FuncError::Waiting) => {
                *owed = Some(Owed { label, system });
                Err(FuncError::Waiting)
            }
            other => other,
        }
    }

    async fn exchange_request(
        &self,
        owed: &mut Option<Owed>,
        label: &'static str,
        stream: u8,
        function: u8,
        body: Item,
    ) -> FuncResult<Message> {
        self.owed_reply(owed, label, || self.session.send_request(stream, function, body))
            .await
    }

    /// `S2F41` remote command. The acknowledge code is returned.
    async fn remote_command(
        &self,
        owed: &mut Option<Owed>,
        rcmd: &'static str,
        params: Vec<(&str, Item)>,
    ) -> FuncResult<i64> {
        debug!("sending remote command {}", rcmd);
        let reply = self
            .exchange_request(owed, rcmd, 2, 41, gem::remote_command(rcmd, params))
            .await?;
        let hcack = gem::ack_code(reply.body.as_ref()).unwrap_or(-1);
        if hcack != 0 {
            warn!("remote command {} acknowledged with HCACK {}", rcmd, hcack);
        }
        Ok(hcack)
    }

    /// Current value of the handler status variable.
    async fn handler_state(&self, owed: &mut Option<Owed>) -> FuncResult<i64> {
        let reply = self
            .exchange_request(owed, "S1F3", 1, 3, gem::status_request())
            .await?;
        gem::ack_code(reply.body.as_ref()).ok_or_else(|| {
            warn!("status reply carries no value, asking again");
            FuncError::Waiting
        })
    }

    /// `START` for a handler waiting for it, sent once per lot.
    async fn start_once(&self, ex: &mut Exchange) -> FuncResult {
        if ex.start_sent {
            debug!("START already sent, waiting for the handler to run");
            return Ok(());
        }
        let system = self.session.send_request(2, 41, gem::start()).await?;
        ex.start_sent = true;
        info!("handler waits for START, command sent");
        match self.session.await_reply(system, "START").await {
            Ok(_) | Err(FuncError::Waiting) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `LOT_START_TEST` with the lot id and summary name.
    async fn start_test(&self, owed: &mut Option<Owed>) -> FuncResult<i64> {
        let (lot_id, summary) = {
            let values = self.values.lock();
            let summary = values.summary_name.clone().unwrap_or_else(|| {
                chrono::Local::now().format("%Y_%m_%d_%H_%M_%S").to_string()
            });
            (values.lot_id.clone(), summary)
        };
        self.remote_command(
            owed,
            "LOT_START_TEST",
            vec![
                ("LOT_ID", Item::ascii(lot_id)),
                ("SUMMARY_NAME", Item::ascii(summary)),
            ],
        )
        .await
    }

    async fn lot_end(&self, owed: &mut Option<Owed>) -> FuncResult {
        let lot_id = self.values.lock().lot_id.clone();
        self.remote_command(owed, "LOT_END", vec![("LOT_ID", Item::ascii(lot_id))])
            .await?;
        self.ctx.estate.set_lot_started(false);
        Ok(())
    }

    /// End the lot after a failed retest; the failure is reported instead.
    async fn abandon_lot(&self, owed: &mut Option<Owed>) {
        info!("ending the lot");
        if let Err(e) = self.lot_end(owed).await {
            warn!("LOT_END failed: {:?}", e);
        }
    }

    async fn advance_lot(&self, ex: &mut Exchange) -> FuncResult {
        loop {
            debug!(step = ?ex.lot, "lot start");
            match ex.lot {
                LotStep::CheckStatus => match self.handler_state(&mut ex.owed).await? {
                    process::WAITING_FOR_START => {
                        self.start_once(ex).await?;
                        return Err(FuncError::Waiting);
                    }
                    process::READY => {
                        debug!("handler process is ready");
                        ex.lot = LotStep::Load;
                    }
                    process::STOPPED => {
                        debug!("handler is stopped, waiting for it to become ready");
                        ex.lot = LotStep::AwaitReady;
                    }
                    other => {
                        debug!("handler state {}, waiting for it to become ready", other);
                        ex.lot = LotStep::AwaitReady;
                    }
                },
                LotStep::AwaitReady => {
                    let event = self.await_event(ceid::PROCESS_STATE).await?;
                    if !event.is_process_ready() {
                        debug!("process state changed, but not to ready");
                        return Err(FuncError::Waiting);
                    }
                    ex.lot = LotStep::Load;
                }
                LotStep::Load => {
                    let (lot_id, quantity) = {
                        let values = self.values.lock();
                        (values.lot_id.clone(), values.quantity.clone())
                    };
                    self.remote_command(
                        &mut ex.owed,
                        "LOT_LOAD",
                        vec![
                            ("LOT_ID", Item::ascii(lot_id)),
                            ("QUANTITY", Item::ascii(quantity)),
                        ],
                    )
                    .await?;
                    ex.lot = LotStep::AwaitLoaded;
                }
                LotStep::AwaitLoaded => {
                    self.await_event(ceid::LOT_LOADED).await?;
                    info!("lot loaded");
                    ex.lot = LotStep::Start;
                }
                LotStep::Start => {
                    let lot_id = self.values.lock().lot_id.clone();
                    self.remote_command(
                        &mut ex.owed,
                        "LOT_START",
                        vec![("LOT_ID", Item::ascii(lot_id))],
                    )
                    .await?;
                    ex.lot = LotStep::AwaitStarted;
                }
                LotStep::AwaitStarted => {
                    self.await_event(ceid::LOT_STARTED).await?;
                    ex.lot = LotStep::StartTest;
                }
                LotStep::StartTest => {
                    if self.start_test(&mut ex.owed).await? != 0 {
                        return Err(FuncError::Waiting);
                    }
                    ex.finish_lot_steps();
                    return Ok(());
                }
            }
        }
    }

    /// Retest the devices of bin tray `label`: wait for the sorting complete
    /// report, stop the handler, ask for the retest and start testing again.
    async fn advance_retest(&self, ex: &mut Exchange, label: &str) -> FuncResult {
        loop {
            debug!(step = ?ex.retest, label, "retest from bin tray");
            match ex.retest {
                RetestStep::AwaitSorted => {
                    let event = self.await_event(ceid::SORTING_COMPLETE).await?;
                    match event.retest_count(label) {
                        None => {
                            error!("bin tray {:?} not reported by the handler", label);
                            self.abandon_lot(&mut ex.owed).await;
                            return Err(FuncError::Answer);
                        }
                        Some(count) if count > 0 => {
                            info!(count, "devices to retest from bin tray {}", label);
                            ex.retest = RetestStep::Stop;
                        }
                        Some(_) => {
                            info!("no device to retest in bin tray {}", label);
                            self.values.lock().no_need_retest = true;
                            return Ok(());
                        }
                    }
                }
                RetestStep::Stop => {
                    self.remote_command(&mut ex.owed, "STOP", Vec::new()).await?;
                    ex.retest = RetestStep::AwaitStopped;
                }
                RetestStep::AwaitStopped => match self.handler_state(&mut ex.owed).await? {
                    process::WAITING_FOR_START => {
                        self.start_once(ex).await?;
                        return Err(FuncError::Waiting);
                    }
                    process::STOPPED => ex.retest = RetestStep::Retest,
                    other => {
                        debug!("handler state {}, waiting for it to stop", other);
                        return Err(FuncError::Waiting);
                    }
                },
                RetestStep::Retest => {
                    let lot_id = self.values.lock().lot_id.clone();
                    let hcack = self
                        .remote_command(
                            &mut ex.owed,
                            "RETEST_FROM_BINTRAY",
                            vec![
                                ("LOT_ID", Item::ascii(lot_id)),
                                ("TPS_LABEL", Item::ascii(label)),
                            ],
                        )
                        .await?;
                    if hcack == gem::HCACK_BAD_PARAMETER {
                        error!("handler rejected the retest of bin tray {:?}", label);
                        self.abandon_lot(&mut ex.owed).await;
                        return Err(FuncError::Answer);
                    }
                    ex.retest = RetestStep::AwaitStarted;
                }
                RetestStep::AwaitStarted => {
                    self.await_event(ceid::LOT_STARTED).await?;
                    ex.retest = RetestStep::StartTest;
                }
                RetestStep::StartTest => {
                    self.start_test(&mut ex.owed).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn retest_from_bin_tray(&self, label: &str) -> FuncResult {
        let mut ex = self.exchange.lock().await;
        if ex.retest == RetestStep::AwaitSorted {
            self.values.lock().no_need_retest = false;
        }
        let result = self.advance_retest(&mut ex, label).await;
        if result != Err(FuncError::Waiting) {
            ex.finish_lot_steps();
        }
        result
    }

    /// Handler bin number for `bin`: the configured bin id, or `bin` itself.
    fn handler_bin(&self, bin: i64) -> Option<u32> {
        if self.settings.bin_ids.is_empty() {
            return u32::try_from(bin).ok();
        }
        usize::try_from(bin)
            .ok()
            .and_then(|i| self.settings.bin_ids.get(i))
            .and_then(|id| id.trim().parse().ok())
    }
}

#[async_trait]
impl HandlerPlugin for PyramidPlugin {
    fn availability(&self) -> FuncAvailability {
        Self::AVAILABILITY
    }

    async fn driver_id(&self) -> FuncResult<String> {
        Ok(format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
    }

    async fn equipment_id(&self) -> FuncResult<String> {
        Ok("Pyramid SECS/GEM handler".into())
    }

    #[instrument(skip(self), fields(model = %self.ctx.config.model))]
    async fn comm_test(&self) -> FuncResult<bool> {
        self.ctx.abort.check()?;
        let mut ex = self.exchange.lock().await;
        let ex = &mut *ex;

        if ex.setup == SetupStep::Select {
            let reply = self
                .owed_reply(&mut ex.owed, "Select.req", || self.session.send_select())
                .await?;
            let status = select_status(&reply)?;
            if status != 0 {
                warn!("handler refused select with status {}", status);
                return Err(FuncError::Answer);
            }
            info!("HSMS session selected");
            ex.setup = SetupStep::Establish;
        }

        if ex.setup == SetupStep::Establish {
            let reply = self
                .exchange_request(&mut ex.owed, "S1F13", 1, 13, gem::establish_communication())
                .await?;
            match gem::ack_code(reply.body.as_ref()) {
                Some(0) | Some(2) => {}
                other => {
                    warn!("communication refused, COMMACK {:?}", other);
                    return Ok(false);
                }
            }
            ex.setup = SetupStep::Configure(0);
        }

        let setup: [(&'static str, u8, u8, Item); 8] = [
            ("online", 1, 17, gem::request_online()),
            ("purge spool", 6, 23, gem::purge_spool()),
            ("reset spooling", 2, 43, gem::reset_spooling()),
            ("disable events", 2, 37, gem::enable_events(false)),
            ("delete reports", 2, 33, gem::delete_reports()),
            ("define reports", 2, 33, gem::define_reports()),
            ("link reports", 2, 35, gem::link_reports()),
            ("enable events", 2, 37, gem::enable_events(true)),
        ];
        let done = match ex.setup {
            SetupStep::Configure(done) => done,
            _ => 0,
        };
        for (step, (label, stream, function, body)) in setup.into_iter().enumerate().skip(done) {
            let reply = self
                .exchange_request(&mut ex.owed, label, stream, function, body)
                .await?;
            match gem::ack_code(reply.body.as_ref()) {
                Some(0) | None => debug!("{} done", label),
                Some(code) => warn!("{} acknowledged with {}", label, code),
            }
            ex.setup = SetupStep::Configure(step + 1);
        }
        ex.setup = SetupStep::Establish;
        Ok(true)
    }

    #[instrument(skip(self), fields(model = %self.ctx.config.model))]
    async fn get_start(&self) -> FuncResult {
        self.ctx.abort.check()?;
        let mut ex = self.exchange.lock().await;
        if ex.device_got {
            debug!("devices already received, not waiting again");
            return Ok(());
        }
        let Some(message) = self.session.next_event(self.settings.heartbeat).await? else {
            return Err(FuncError::Waiting);
        };
        let event = Self::parse_event(&message)?;
        match event.ceid {
            ceid::DEVICE_READY => {}
            ceid::LOT_TEST_COMPLETE => {
                info!("lot test complete");
                self.ctx.estate.set_lot_started(false);
                return Err(FuncError::LotDone);
            }
            other => {
                debug!("received event {}, expected {}", other, ceid::DEVICE_READY);
                return Err(FuncError::Waiting);
            }
        }

        let flags = event.site_flags();
        if flags.is_empty() {
            warn!("device ready event carries no site information, receive again");
            return Err(FuncError::Waiting);
        }
        if flags.len() > self.sites() {
            error!(
                "handler reports {} sites but only {} are configured",
                flags.len(),
                self.sites()
            );
            return Err(FuncError::Answer);
        }
        if let Some(codes) = event.barcodes(flags.len()) {
            debug!(barcodes = %codes, "device barcodes");
            self.values.lock().barcodes = codes;
        }
        ex.handler_sites = Some(flags.len());

        let mut pending = flags;
        pending.resize(self.sites(), false);
        for (i, present) in pending.iter().enumerate() {
            if *present {
                debug!("device present at site \"{}\"", self.site_id(i));
            }
        }
        let population = population_from_pending(&pending, &self.settings.active, true);
        self.ctx.estate.set_sites(&population).map_err(|e| {
            error!("{}", e);
            FuncError::Fatal
        })?;
        ex.device_got = true;
        Ok(())
    }

    #[instrument(skip(self), fields(model = %self.ctx.config.model))]
    async fn bin_device(&self, bins: &[i64]) -> FuncResult {
        self.ctx.abort.check()?;
        let old = self.ctx.estate.sites();
        let mut ex = self.exchange.lock().await;
        let handler_sites = ex.handler_sites.unwrap_or(self.sites());

        let mut codes = vec![0u32; handler_sites];
        let mut any_device = false;
        for (i, code) in codes.iter_mut().enumerate().take(self.sites()) {
            let holds = old.get(i).copied().unwrap_or_default().holds_device();
            if !self.settings.active[i] || !holds {
                continue;
            }
            let bin = bins.get(i).copied().unwrap_or(-1);
            let Some(handler_bin) = self.handler_bin(bin) else {
                error!(
                    "unable to send binning at site \"{}\": no handler bin for bin index {}",
                    self.site_id(i),
                    bin
                );
                return Err(FuncError::Binning);
            };
            debug!("will bin device at site \"{}\" to {}", self.site_id(i), handler_bin);
            *code = handler_bin;
            any_device = true;
        }

        if any_device {
            match self.session.request(2, 41, gem::bin_units(&codes)).await {
                Ok(reply) => {
                    let hcack = gem::ack_code(reply.body.as_ref()).unwrap_or(-1);
                    if hcack != 0 {
                        warn!("BIN_UNITS acknowledged with HCACK {}", hcack);
                    }
                }
                Err(FuncError::Waiting) => warn!("BIN_UNITS was not acknowledged in time"),
                Err(e) => return Err(e),
            }
        } else {
            debug!("no device to bin");
        }
        self.ctx.estate.mark_binned();
        ex.device_got = false;

        if let Some(message) = self.session.try_next_event().await? {
            let lot_done = message
                .body
                .as_ref()
                .and_then(Event::parse)
                .is_some_and(|event| event.ceid == ceid::LOT_TEST_COMPLETE);
            if lot_done {
                info!("lot test complete after binning");
                self.ctx.estate.set_lot_started(false);
                return Err(FuncError::LotDone);
            }
            self.session.hold(message);
        }
        Ok(())
    }

    async fn status(&self, request: StatRequest) -> FuncResult<bool> {
        if matches!(request, StatRequest::Reset | StatRequest::Handled) {
            self.exchange.lock().await.finish_lot_steps();
        }
        self.ctx.abort.apply(request)
    }

    #[instrument(skip(self), fields(model = %self.ctx.config.model))]
    async fn lot_start(&self, _param: &str) -> FuncResult {
        self.ctx.abort.check()?;
        let mut ex = self.exchange.lock().await;
        self.advance_lot(&mut ex).await?;
        self.ctx.estate.set_lot_started(true);
        info!("lot started");
        Ok(())
    }

    #[instrument(skip(self), fields(model = %self.ctx.config.model))]
    async fn lot_done(&self, _param: &str) -> FuncResult {
        self.ctx.abort.check()?;
        let mut ex = self.exchange.lock().await;
        self.lot_end(&mut ex.owed).await
    }

    async fn get_status(&self, key: &str) -> FuncResult<String> {
        let (name, param) = key.trim().split_once(' ').unwrap_or((key.trim(), ""));
        let name = name.to_ascii_lowercase();
        if name == "no_need_retest" {
            let no_need = self.values.lock().no_need_retest;
            return Ok(if no_need { "TRUE" } else { "FALSE" }.to_string());
        }
        if name != "barcode" && name != "device_id" {
            warn!(key = %name, "status key not supported by Pyramid handlers");
            return Err(FuncError::NotAvailable);
        }
        let barcodes = self.values.lock().barcodes.clone();
        let param = param.trim();
        if param.is_empty() {
            return Ok(barcodes);
        }
        match param.parse::<usize>() {
            Ok(site) if (1..=self.sites()).contains(&site) => Ok(barcodes
                .split(',')
                .nth(site - 1)
                .unwrap_or_default()
                .to_string()),
            _ => {
                warn!("the site number {:?} is illegal", param);
                Ok(String::new())
            }
        }
    }

    async fn set_status(&self, key: &str, value: &str) -> FuncResult {
        let key = key.trim().to_ascii_lowercase();
        if key == "retest_from_bin_tray" {
            self.ctx.abort.check()?;
            return self.retest_from_bin_tray(value.trim()).await;
        }
        let mut values = self.values.lock();
        match key.as_str() {
            "lot_id" => values.lot_id = value.trim().to_string(),
            "quantity" => values.quantity = value.trim().to_string(),
            "summary_name" => values.summary_name = Some(value.trim().to_string()),
            other => {
                warn!(key = %other, "status key not supported by Pyramid handlers");
                return Err(FuncError::NotAvailable);
            }
        }
        debug!(key = %key, value, "status value stored");
        Ok(())
    }
}
