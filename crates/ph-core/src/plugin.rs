//! Handler plugin contract.
//!
//! A handler driver consists of a [`PluginFactory`], registered once at
//! startup, and the [`HandlerPlugin`] it builds for a configured handler. The
//! framework only forwards calls whose [`FuncAvailability`] bit the plugin
//! advertises; every operation has a default body returning
//! [`FuncError::NotAvailable`] so plugins implement only what their handler
//! supports.

use crate::availability::FuncAvailability;
use crate::config::HandlerConfig;
use crate::error::{FuncError, FuncResult};
use crate::estate::Estate;
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Request passed to [`HandlerPlugin::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatRequest {
    /// Report whether an abort is pending.
    Query,
    /// Clear a pending abort.
    Reset,
    /// The framework handled the last plugin result.
    Handled,
    /// Interrupt the current and the next interruptible call.
    Abort,
}

/// Abort request shared between the framework and a plugin.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consume a pending abort: returns `Err(Aborted)` once and clears it.
    pub fn check(&self) -> FuncResult<()> {
        if self.0.swap(false, Ordering::SeqCst) {
            tracing::info!("plugin call aborted");
            Err(FuncError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Standard handling of a status request.
    pub fn apply(&self, request: StatRequest) -> FuncResult<bool> {
        match request {
            StatRequest::Query => Ok(self.is_raised()),
            StatRequest::Reset => {
                self.clear();
                Ok(false)
            }
            StatRequest::Handled => Ok(self.is_raised()),
            StatRequest::Abort => {
                self.raise();
                Ok(true)
            }
        }
    }
}

/// Everything a plugin needs from the framework.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub config: Arc<HandlerConfig>,
    /// Site population shared with the framework.
    pub estate: Estate,
    pub abort: AbortFlag,
}

impl PluginContext {
    /// Create a context with a fresh equipment state sized from the config.
    pub fn new(config: HandlerConfig) -> Self {
        let estate = Estate::new(config.site_count());
        Self {
            config: Arc::new(config),
            estate,
            abort: AbortFlag::new(),
        }
    }
}

/// Operations a handler driver may implement.
///
/// Site oriented arguments are indexed by handler site. A bin value of `-1`
/// means "no device at this site".
#[async_trait]
pub trait HandlerPlugin: Send + Sync {
    /// Operations this plugin implements.
    fn availability(&self) -> FuncAvailability;

    /// Re-read the configuration and bring the handler into a known state.
    async fn reconfigure(&self) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    async fn reset(&self) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    /// Identification of the driver itself.
    async fn driver_id(&self) -> FuncResult<String> {
        Err(FuncError::NotAvailable)
    }

    /// Identification of the attached handler.
    async fn equipment_id(&self) -> FuncResult<String> {
        Err(FuncError::NotAvailable)
    }

    /// Wait for devices and update the site population.
    async fn get_start(&self) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    /// Send one handler bin per site.
    async fn bin_device(&self, _bins: &[i64]) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    async fn reprobe(&self) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    /// Bin the sites not flagged in `to_reprobe` and reprobe the others.
    async fn bin_reprobe(&self, _to_reprobe: &[bool], _bins: &[i64]) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    async fn send_command(&self, _command: &str) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    async fn send_query(&self, _query: &str) -> FuncResult<String> {
        Err(FuncError::NotAvailable)
    }

    async fn diag(&self) -> FuncResult<String> {
        Err(FuncError::NotAvailable)
    }

    async fn pause(&self) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    async fn unpause(&self) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    /// Abort handling; see [`AbortFlag::apply`].
    async fn status(&self, _request: StatRequest) -> FuncResult<bool> {
        Err(FuncError::NotAvailable)
    }

    async fn update(&self) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    /// Check that the handler answers; `Ok(true)` when it does.
    async fn comm_test(&self) -> FuncResult<bool> {
        Err(FuncError::NotAvailable)
    }

    async fn strip_material_id(&self) -> FuncResult<String> {
        Err(FuncError::NotAvailable)
    }

    async fn strip_index_id(&self) -> FuncResult<String> {
        Err(FuncError::NotAvailable)
    }

    async fn lot_start(&self, _param: &str) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    async fn lot_done(&self, _param: &str) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    async fn strip_start(&self, _param: &str) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    async fn strip_done(&self, _param: &str) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    /// Read a handler status value by key.
    async fn get_status(&self, _key: &str) -> FuncResult<String> {
        Err(FuncError::NotAvailable)
    }

    /// Write a handler status value by key.
    async fn set_status(&self, _key: &str, _value: &str) -> FuncResult {
        Err(FuncError::NotAvailable)
    }

    async fn exec_gpib_cmd(&self, _command: &str) -> FuncResult<String> {
        Err(FuncError::NotAvailable)
    }

    async fn exec_gpib_query(&self, _query: &str) -> FuncResult<String> {
        Err(FuncError::NotAvailable)
    }

    async fn get_srq_status_byte(&self) -> FuncResult<u8> {
        Err(FuncError::NotAvailable)
    }

    /// Release the handler connection.
    async fn destroy(&self) -> FuncResult {
        Err(FuncError::NotAvailable)
    }
}

/// Builds plugins for one handler family.
///
/// Factories are registered once at startup and live for the program's
/// lifetime; `build` takes `&self` and returns a `'static` future, so a
/// factory holds no per-handler state.
pub trait PluginFactory: Send + Sync + 'static {
    /// Value of `driver_plugin` in the configuration, e.g. `"techwing"`.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name, e.g. "TechWing TW2XX/TW3XX".
    fn name(&self) -> &'static str;

    /// Supported `model` values.
    fn models(&self) -> &'static [&'static str];

    /// Operations plugins of this family implement.
    fn availability(&self) -> FuncAvailability;

    /// Check the configuration without touching hardware.
    fn validate(&self, config: &HandlerConfig) -> Result<()>;

    /// Connect to the handler and return the initialised plugin.
    fn build(&self, ctx: PluginContext) -> BoxFuture<'static, Result<Arc<dyn HandlerPlugin>>>;
}

/// Anything plugin factories can be registered with.
///
/// Vendor crates register through this trait so they do not depend on the
/// framework crate.
pub trait FactoryRegistry {
    fn register_factory(&self, factory: Box<dyn PluginFactory>);
}

/// Check that `model` is one of `models`, ignoring case.
pub fn check_model(model: &str, models: &[&str]) -> Result<()> {
    if models.iter().any(|m| m.eq_ignore_ascii_case(model)) {
        Ok(())
    } else {
        anyhow::bail!(
            "unsupported handler model '{}', expected one of: {}",
            model,
            models.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    #[async_trait]
    impl HandlerPlugin for Minimal {
        fn availability(&self) -> FuncAvailability {
            FuncAvailability::MINIMUM
        }
    }

    #[tokio::test]
    async fn unimplemented_operations_are_not_available() {
        let p = Minimal;
        assert_eq!(p.reprobe().await, Err(FuncError::NotAvailable));
        assert_eq!(p.get_status("name").await, Err(FuncError::NotAvailable));
        assert_eq!(p.bin_device(&[1, -1]).await, Err(FuncError::NotAvailable));
    }

    #[test]
    fn abort_is_consumed_once() {
        let flag = AbortFlag::new();
        assert_eq!(flag.apply(StatRequest::Abort), Ok(true));
        assert_eq!(flag.apply(StatRequest::Query), Ok(true));
        assert_eq!(flag.check(), Err(FuncError::Aborted));
        assert_eq!(flag.check(), Ok(()));

        flag.raise();
        assert_eq!(flag.apply(StatRequest::Reset), Ok(false));
        assert!(!flag.is_raised());
    }

    #[test]
    fn model_check_is_case_insensitive() {
        assert!(check_model("tw3xx", &["TW2XX", "TW3XX"]).is_ok());
        let err = check_model("TW9", &["TW2XX", "TW3XX"]).unwrap_err();
        assert!(err.to_string().contains("TW2XX, TW3XX"));
    }

    #[test]
    fn context_sizes_estate_from_config() {
        let config = HandlerConfig {
            handler_site_ids: vec!["1".into(), "2".into()],
            ..Default::default()
        };
        let ctx = PluginContext::new(config);
        assert_eq!(ctx.estate.site_count(), 2);
        assert!(!ctx.abort.is_raised());
    }
}
