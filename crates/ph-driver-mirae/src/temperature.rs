//! Temperature control setup sent while the handler is stopped.
//!
//! Configuration keys:
//!
//! | key | meaning |
//! |---|---|
//! | `temp_control` | `off` (default), `hot`, `ambient` or `cca` |
//! | `temp_setpoint` | set point in degrees, required for `hot` and `cca` |
//! | `temp_upper_guard_band` | symmetric guard band, optional |
//! | `temp_soaktime` | soak time in seconds, optional |
//!
//! Multi chamber lists are accepted; the handler has a single chamber so only
//! the first value is used.

use ph_core::HandlerConfig;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempControl {
    /// The driver leaves the handler temperature alone.
    Off,
    Hot,
    Ambient,
    /// Cold and controlled ambient.
    Cca,
}

impl TempControl {
    /// Parse a control mode, accepting the aliases the handler manual uses.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "stop" => Some(TempControl::Off),
            "hot" => Some(TempControl::Hot),
            "ambient" | "room" => Some(TempControl::Ambient),
            "cca" | "cold" => Some(TempControl::Cca),
            _ => None,
        }
    }

    /// Value of the `TEMPCTRL` command.
    pub fn code(self) -> u8 {
        match self {
            TempControl::Off => 0,
            TempControl::Hot => 1,
            TempControl::Ambient => 2,
            TempControl::Cca => 3,
        }
    }

    fn drives_setpoint(self) -> bool {
        matches!(self, TempControl::Hot | TempControl::Cca)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TempConfigError {
    #[error("temp_control '{0}' is not one of off, hot, ambient, cca")]
    UnknownControl(String),

    #[error("temp_control = {0:?} requires temp_setpoint")]
    MissingSetpoint(TempControl),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TempSetup {
    pub control: TempControl,
    pub setpoint: f64,
    pub guard_band: Option<i64>,
    pub soak_time: Option<i64>,
}

impl Default for TempSetup {
    fn default() -> Self {
        Self {
            control: TempControl::Off,
            setpoint: 0.0,
            guard_band: None,
            soak_time: None,
        }
    }
}

fn number(value: &toml::Value) -> Option<f64> {
    match value {
        toml::Value::Float(f) => Some(*f),
        toml::Value::Integer(i) => Some(*i as f64),
        toml::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First value of a scalar or list key.
fn first_number(config: &HandlerConfig, key: &str) -> Option<f64> {
    match config.extra.get(key)? {
        toml::Value::Array(values) => values.first().and_then(number),
        value => number(value),
    }
}

impl TempSetup {
    pub fn from_config(config: &HandlerConfig) -> Result<Self, TempConfigError> {
        let control = match config.extra_str("temp_control") {
            None => TempControl::Off,
            Some(value) => TempControl::parse(value)
                .ok_or_else(|| TempConfigError::UnknownControl(value.to_string()))?,
        };
        if !control.drives_setpoint() {
            return Ok(Self {
                control,
                ..Default::default()
            });
        }
        let setpoint = first_number(config, "temp_setpoint")
            .ok_or(TempConfigError::MissingSetpoint(control))?;
        Ok(Self {
            control,
            setpoint,
            guard_band: first_number(config, "temp_upper_guard_band").map(|v| v as i64),
            soak_time: first_number(config, "temp_soaktime").map(|v| v as i64),
        })
    }

    /// Commands to send, empty when the driver does not control temperature.
    pub fn commands(&self) -> Vec<String> {
        if !self.control.drives_setpoint() {
            return Vec::new();
        }
        let mut commands = vec![format!("SETTEMP {:.1}", self.setpoint)];
        if let Some(band) = self.guard_band {
            commands.push(format!("SETBAND {}", band));
        }
        if let Some(soak) = self.soak_time {
            commands.push(format!("SETSOAK {}", soak));
        }
        commands
    }
}
