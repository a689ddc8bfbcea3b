//! Handler driver configuration.
//!
//! A driver is configured by one TOML file. Key names follow the established
//! handler driver vocabulary (`handler_site_ids`, `verify_bin_data`, ...), so
//! existing configuration files translate one to one. Environment variables
//! prefixed with `PH_` override file values, e.g.
//! `PH_SYMBOLIC_INTERFACE_NAME=/dev/ttyS1`.
//!
//! Keys that only one vendor understands are kept in [`HandlerConfig::extra`]
//! and read with the typed accessors.
//!
//! # Example
//!
//! ```toml
//! driver_plugin = "techwing"
//! model = "TW3XX"
//! interface_type = "lan"
//! symbolic_interface_name = "192.168.1.20:5000"
//! handler_site_ids = ["1", "2", "3", "4"]
//! handler_site_mask = [1, 1, 1, 1]
//! handler_bin_ids = ["1", "2", "3"]
//! verify_bin_data = "yes"
//! ```

use crate::error::InterfaceKind;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Default timeout for waiting operations, in seconds.
pub const DEFAULT_WAIT_TIMEOUT_SECS: f64 = 120.0;

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Parse error (invalid TOML or wrong value types)
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Validation error
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Operator action when a waiting operation times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutAction {
    /// Keep waiting silently.
    Continue,
    /// Ask the operator what to do.
    #[default]
    OperatorHelp,
    /// Skip the current operation.
    Skip,
}

/// How SmarTest bins are translated into handler bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BinMappingMode {
    /// SmarTest hard bin numbers are used directly.
    #[default]
    Default,
    /// Hard bin numbers are mapped through `hardbin_to_handler_bin_map`.
    MappedHardbins,
    /// Soft bin codes are mapped through `softbin_to_handler_bin_map`.
    MappedSoftbins,
}

/// Automatic reprobe behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReprobeMode {
    /// No automatic reprobe.
    #[default]
    Off,
    /// Reprobe all sites when any site requests it.
    All,
    /// Reprobe only the requesting sites.
    PerSite,
}

/// How the plugin learns that devices are ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartsMethod {
    /// Handler raises a service request.
    Interrupt,
    /// Plugin polls the handler.
    Polling,
}

/// Accept `true`/`false` as well as the traditional `"yes"`/`"no"` strings.
fn yes_no<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Bool(b)) => Ok(Some(b)),
        Some(Raw::Text(s)) => match s.to_ascii_lowercase().as_str() {
            "yes" | "true" | "on" => Ok(Some(true)),
            "no" | "false" | "off" => Ok(Some(false)),
            other => Err(serde::de::Error::custom(format!(
                "expected \"yes\" or \"no\", got \"{}\"",
                other
            ))),
        },
    }
}

/// Complete configuration of one handler driver instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HandlerConfig {
    /// Driver type (`techwing`, `mirae`, `pyramid`, ...).
    pub driver_plugin: String,
    /// Handler model name as understood by the plugin.
    pub model: String,

    /// Interface kind.
    pub interface_type: Option<InterfaceKind>,
    /// Serial device path, or `host:port` for LAN and GPIB gateways.
    pub symbolic_interface_name: String,
    /// GPIB primary address of the handler behind the gateway.
    pub gpib_port: Option<u16>,
    /// TCP port when `symbolic_interface_name` holds a bare host name.
    pub server_port: Option<u16>,
    /// Serial baud rate.
    pub baud_rate: Option<u32>,
    /// Message terminator appended to every command.
    pub end_of_string: Option<String>,

    /// Heartbeat in milliseconds: the receive timeout of a single exchange.
    pub flag_check_interval: Option<f64>,
    /// Polling interval in microseconds.
    pub polling_interval: Option<f64>,
    pub waiting_for_parts_method: Option<PartsMethod>,

    pub waiting_for_parts_timeout: Option<f64>,
    pub waiting_for_parts_timeout_action: Option<TimeoutAction>,
    pub waiting_for_lot_timeout: Option<f64>,
    pub waiting_for_lot_timeout_action: Option<TimeoutAction>,
    pub general_timeout: Option<f64>,
    pub general_timeout_action: Option<TimeoutAction>,

    /// One name per handler site; its length defines the site count.
    pub handler_site_ids: Vec<String>,
    /// 1 = site active, 0 = site switched off.
    pub handler_site_mask: Vec<i64>,
    /// SmarTest site number for each handler site.
    pub smartest_site_to_handler_site_map: Vec<i64>,

    pub bin_mapping: BinMappingMode,
    pub handler_retest_bins: Vec<i64>,
    pub handler_bin_ids: Vec<String>,
    pub handler_bin_categories: Vec<String>,
    /// One list of SmarTest hard bins per handler bin.
    pub hardbin_to_handler_bin_map: Vec<Vec<i64>>,
    /// One list of SmarTest soft bin codes per handler bin.
    pub softbin_to_handler_bin_map: Vec<Vec<String>>,
    #[serde(deserialize_with = "yes_no")]
    pub verify_bin_data: Option<bool>,
    pub verify_retry_count: Option<u32>,

    #[serde(deserialize_with = "yes_no")]
    pub auto_reprobe_on_retest_device: Option<bool>,
    #[serde(deserialize_with = "yes_no")]
    pub auto_reprobe_on_check_device: Option<bool>,
    pub handler_reprobe_bin: Option<i64>,
    pub automatic_reprobe_mode: ReprobeMode,
    pub handler_retest_count: Option<u32>,

    #[serde(deserialize_with = "yes_no")]
    pub mirae_send_siteselection_cmd: Option<bool>,
    #[serde(deserialize_with = "yes_no")]
    pub mirae_mask_device_pending: Option<bool>,
    #[serde(deserialize_with = "yes_no")]
    pub stop_handler_on_smartest_pause: Option<bool>,
    #[serde(deserialize_with = "yes_no")]
    pub ismeca_handler_abort_error_ca_response: Option<bool>,

    pub test_tray_test_in_parallel: Option<u32>,
    pub test_tray_step: Option<u32>,
    pub test_tray_row: Option<u32>,

    /// Vendor specific keys not modelled above.
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl HandlerConfig {
    /// Parse a configuration from TOML text, without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigLoadError> {
        let config: HandlerConfig =
            toml::from_str(content).map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from an in-memory TOML value.
    pub fn from_value(value: toml::Value) -> Result<Self, ConfigLoadError> {
        let config: HandlerConfig = value
            .try_into()
            .map_err(|e: toml::de::Error| ConfigLoadError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that apply to every plugin.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let mut errors = Vec::new();
        let sites = self.handler_site_ids.len();

        if sites == 0 {
            errors.push("handler_site_ids must name at least one site".to_string());
        }
        if sites > crate::estate::MAX_SITES {
            errors.push(format!(
                "handler_site_ids defines {} sites, at most {} are supported",
                sites,
                crate::estate::MAX_SITES
            ));
        }
        if !self.handler_site_mask.is_empty() && self.handler_site_mask.len() != sites {
            errors.push(format!(
                "handler_site_mask has {} entries but {} sites are defined",
                self.handler_site_mask.len(),
                sites
            ));
        }
        if !self.smartest_site_to_handler_site_map.is_empty()
            && self.smartest_site_to_handler_site_map.len() != sites
        {
            errors.push(format!(
                "smartest_site_to_handler_site_map has {} entries but {} sites are defined",
                self.smartest_site_to_handler_site_map.len(),
                sites
            ));
        }
        match self.bin_mapping {
            BinMappingMode::MappedHardbins if self.hardbin_to_handler_bin_map.is_empty() => {
                errors.push(
                    "bin_mapping = mapped-hardbins requires hardbin_to_handler_bin_map".into(),
                );
            }
            BinMappingMode::MappedSoftbins if self.softbin_to_handler_bin_map.is_empty() => {
                errors.push(
                    "bin_mapping = mapped-softbins requires softbin_to_handler_bin_map".into(),
                );
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigLoadError::ValidationError(errors.join("\n")))
        }
    }

    /// Number of handler sites.
    pub fn site_count(&self) -> usize {
        self.handler_site_ids.len()
    }

    /// Active flag per site; an absent mask means all sites are active.
    pub fn active_sites(&self) -> Vec<bool> {
        (0..self.site_count())
            .map(|i| self.handler_site_mask.get(i).map(|m| *m != 0).unwrap_or(true))
            .collect()
    }

    /// SmarTest site number for each handler site (1-based by default).
    pub fn smartest_sites(&self) -> Vec<i64> {
        (0..self.site_count())
            .map(|i| {
                self.smartest_site_to_handler_site_map
                    .get(i)
                    .copied()
                    .unwrap_or(i as i64 + 1)
            })
            .collect()
    }

    /// Receive timeout of a single exchange (default 5 s).
    pub fn heartbeat(&self) -> Duration {
        self.flag_check_interval
            .map(|ms| Duration::from_secs_f64(ms.abs() / 1000.0))
            .unwrap_or(Duration::from_secs(5))
    }

    /// Polling interval, or `default` when not configured.
    pub fn polling_interval_or(&self, default: Duration) -> Duration {
        self.polling_interval
            .map(|us| Duration::from_secs_f64(us.abs() / 1_000_000.0))
            .unwrap_or(default)
    }

    /// Whether device pending flags are masked with the site mask (default yes).
    pub fn mask_device_pending(&self) -> bool {
        self.mirae_mask_device_pending.unwrap_or(true)
    }

    /// Message terminator (default CR LF).
    pub fn terminator(&self) -> &str {
        self.end_of_string.as_deref().unwrap_or("\r\n")
    }

    /// Vendor specific string value.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// Vendor specific numeric value; integers are widened.
    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(|v| match v {
            toml::Value::Float(f) => Some(*f),
            toml::Value::Integer(i) => Some(*i as f64),
            toml::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    /// Vendor specific yes/no flag.
    pub fn extra_flag(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(|v| match v {
            toml::Value::Boolean(b) => Some(*b),
            toml::Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "yes" | "true" => Some(true),
                "no" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        })
    }
}

/// Load a handler configuration from a TOML file, applying `PH_` overrides.
///
/// # Errors
///
/// Returns [`ConfigLoadError`] if the file is missing, does not parse, or
/// fails validation.
pub fn load_handler_config(path: &Path) -> Result<HandlerConfig, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()));
    }

    debug!("Loading handler config from: {}", path.display());

    let figment = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("PH_"));

    let config: HandlerConfig = figment
        .extract()
        .map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;

    config.validate()?;

    info!(
        driver = %config.driver_plugin,
        model = %config.model,
        sites = config.site_count(),
        "Loaded handler config"
    );

    Ok(config)
}
