//! File and environment configuration for kcache controllers.
//!
//! A flat TOML table, overridable with `KCACHE_*` environment variables,
//! translated to `kcache_core::ControllerConfig`. Durations are written
//! in humantime form (`"30s"`, `"1m"`, `"1h 30m"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use kcache_core::{ControllerConfig, ReconnectConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config ─────────────────────────────────────────────────────

/// On-disk controller tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Time between periodic relists.
    pub refresh_period: String,

    /// Delay before re-opening a failed watch.
    pub watch_retry_delay: String,

    /// Upper bound for the watch retry delay. Equal to
    /// `watch_retry_delay` means a fixed delay.
    pub watch_retry_max_delay: String,

    /// Give up re-opening the watch after this many consecutive failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_max_retries: Option<u32>,

    pub watch_buffer_size: usize,
    pub subscription_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_period: "1m".into(),
            watch_retry_delay: "1s".into(),
            watch_retry_max_delay: "1s".into(),
            watch_max_retries: None,
            watch_buffer_size: 100,
            subscription_buffer_size: 100,
        }
    }
}

impl Config {
    /// Validate and convert to the runtime configuration.
    pub fn to_controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        let refresh_period = parse_duration("refresh_period", &self.refresh_period)?;
        let initial_delay = parse_duration("watch_retry_delay", &self.watch_retry_delay)?;
        let max_delay = parse_duration("watch_retry_max_delay", &self.watch_retry_max_delay)?;

        if refresh_period.is_zero() {
            return Err(invalid("refresh_period", "must be greater than zero"));
        }
        if max_delay < initial_delay {
            return Err(invalid(
                "watch_retry_max_delay",
                "must not be shorter than watch_retry_delay",
            ));
        }
        if self.watch_buffer_size == 0 {
            return Err(invalid("watch_buffer_size", "must be greater than zero"));
        }
        if self.subscription_buffer_size == 0 {
            return Err(invalid("subscription_buffer_size", "must be greater than zero"));
        }

        Ok(ControllerConfig {
            refresh_period,
            reconnect: ReconnectConfig {
                initial_delay,
                max_delay,
                max_retries: self.watch_max_retries,
            },
            watch_buffer_size: self.watch_buffer_size,
            subscription_buffer_size: self.subscription_buffer_size,
        })
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| invalid(field, &format!("'{value}': {e}")))
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "kcache", "kcache").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("kcache");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Loading / saving ────────────────────────────────────────────────

/// Load from the canonical path, then `KCACHE_*` environment overrides.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path`, then `KCACHE_*` environment overrides.
///
/// A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("KCACHE_"))
        .extract()?;
    Ok(config)
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

/// Serialize config to TOML and write it to the canonical path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}
