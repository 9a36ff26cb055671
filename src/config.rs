//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. `config/seifert_xray.toml` (or an explicit path)
//! 2. Environment variables prefixed with `SEIFERT_`, nested keys separated by `__`
//!
//! ```text
//! SEIFERT_INSTRUMENT__HOST=10.0.0.7
//! SEIFERT_INSTRUMENT__TIMEOUT_MS=2000
//! SEIFERT_LOGGING__LEVEL=debug
//! ```
//!
//! Every key has a default, so a missing file yields a configuration for a
//! generator on `localhost:10001`.

use crate::protocol::codec::DEFAULT_REPLY_WIDTH;
use crate::protocol::UnitScale;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/seifert_xray.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XrayConfig {
    #[serde(default)]
    pub instrument: InstrumentConfig,
    #[serde(default)]
    pub units: UnitSettings,
    #[serde(default)]
    pub faults: FaultSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection and protocol settings of one generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reply timeout per exchange.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// Digits in a numeric reply.
    #[serde(default = "default_reply_width")]
    pub reply_width: usize,
    /// Follow the high-voltage bit of status word 1 on every poll.
    #[serde(default = "default_true")]
    pub auto_follow: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            host: default_host(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            terminator: default_terminator(),
            reply_width: default_reply_width(),
            auto_follow: default_true(),
        }
    }
}

impl InstrumentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Wire units per display unit. Firmware revisions differ on whether the
/// current is reported in µA or already in mA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSettings {
    #[serde(default)]
    pub current_wire_per_display: UnitScale,
    #[serde(default)]
    pub voltage_wire_per_display: UnitScale,
}

impl Default for UnitSettings {
    fn default() -> Self {
        Self {
            current_wire_per_display: UnitScale::MILLI,
            voltage_wire_per_display: UnitScale::MILLI,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSettings {
    /// Nonzero `SR:12` codes that do not put the instrument in Error.
    #[serde(default = "default_non_fault_codes")]
    pub non_fault_codes: Vec<i32>,
}

impl Default for FaultSettings {
    fn default() -> Self {
        Self {
            non_fault_codes: default_non_fault_codes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error. `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_id() -> String {
    "xray".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    10001
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_terminator() -> String {
    "\n".to_string()
}

fn default_reply_width() -> usize {
    DEFAULT_REPLY_WIDTH
}

fn default_true() -> bool {
    true
}

fn default_non_fault_codes() -> Vec<i32> {
    vec![76]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl XrayConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SEIFERT_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let instrument = &self.instrument;
        if instrument.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "instrument.host cannot be empty".to_string(),
            ));
        }
        if instrument.port == 0 {
            return Err(ConfigError::ValidationError(
                "instrument.port must be nonzero".to_string(),
            ));
        }
        if instrument.timeout_ms == 0 || instrument.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "instrument timeouts must be greater than 0 ms".to_string(),
            ));
        }
        if instrument.terminator.is_empty() {
            return Err(ConfigError::ValidationError(
                "instrument.terminator cannot be empty".to_string(),
            ));
        }
        // Ten digits already exceed i32 for large values; more can never parse.
        if !(1..=10).contains(&instrument.reply_width) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid instrument.reply_width {}. Must be 1-10",
                instrument.reply_width
            )));
        }

        for (name, scale) in [
            ("current_wire_per_display", self.units.current_wire_per_display),
            ("voltage_wire_per_display", self.units.voltage_wire_per_display),
        ] {
            if scale.0 <= 0 {
                return Err(ConfigError::ValidationError(format!(
                    "units.{} must be positive, got {}",
                    name, scale.0
                )));
            }
        }

        if self.faults.non_fault_codes.contains(&0) {
            return Err(ConfigError::ValidationError(
                "faults.non_fault_codes must not contain 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }
}
