//! Configuration loading, defaults, and construction-time validation.
//!
//! Configuration is read from `~/.config/mdfeed/config.toml` using the
//! same `serde` + `toml` + `dirs` pattern the teacher uses for its own
//! config file, but every numeric field is validated at construction
//! time into a [`ConfigError`] rather than trusted blindly — this
//! crate's configuration carries credentials and latency-sensitive
//! numeric bounds, unlike a printer IP address.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatcherConfig as RuntimeDispatcherConfig;
use crate::error::ConfigError;
use crate::health::HealthConfig as RuntimeHealthConfig;

/// Which broker environment to connect to. Mirrors the original's
/// `"SANDBOX"` string sentinel as a proper enum rather than magic string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Sandbox,
}

/// On-disk configuration file, deserialized as-is and validated
/// separately via [`FileConfig::validate`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileConfig {
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub dispatcher: DispatcherFileConfig,
    #[serde(default)]
    pub health: HealthFileConfig,
    #[serde(default)]
    pub decoder: DecoderFileConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportFileConfig {
    pub app_id: String,
    pub app_secret: String,
    pub app_code: String,
    pub broker_id: String,
    #[serde(default)]
    pub environment: Option<Environment>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keepalive")]
    pub keepalive: u32,
    #[serde(default = "default_reconnect_min_delay")]
    pub reconnect_min_delay_secs: f64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: f64,
    #[serde(default = "default_token_refresh_before_exp")]
    pub token_refresh_before_exp_secs: u64,
}

fn default_port() -> u16 {
    443
}
fn default_keepalive() -> u32 {
    30
}
fn default_reconnect_min_delay() -> f64 {
    1.0
}
fn default_reconnect_max_delay() -> f64 {
    30.0
}
fn default_token_refresh_before_exp() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherFileConfig {
    #[serde(default = "default_maxlen")]
    pub maxlen: usize,
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    #[serde(default = "default_drop_warning_threshold")]
    pub drop_warning_threshold: f64,
}

impl Default for DispatcherFileConfig {
    fn default() -> Self {
        Self {
            maxlen: default_maxlen(),
            ema_alpha: default_ema_alpha(),
            drop_warning_threshold: default_drop_warning_threshold(),
        }
    }
}

fn default_maxlen() -> usize {
    100_000
}
fn default_ema_alpha() -> f64 {
    0.01
}
fn default_drop_warning_threshold() -> f64 {
    0.01
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthFileConfig {
    #[serde(default = "default_max_gap_seconds")]
    pub max_gap_seconds: f64,
    #[serde(default)]
    pub per_symbol_max_gap: HashMap<String, f64>,
}

impl Default for HealthFileConfig {
    fn default() -> Self {
        Self {
            max_gap_seconds: default_max_gap_seconds(),
            per_symbol_max_gap: HashMap::new(),
        }
    }
}

fn default_max_gap_seconds() -> f64 {
    5.0
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DecoderFileConfig {
    #[serde(default)]
    pub full_depth: bool,
}

impl FileConfig {
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".config").join("mdfeed").join("config.toml"))
    }

    pub fn load() -> Result<Option<Self>, ConfigError> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: FileConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.validate()?;
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Validates every bound the original's Pydantic `Field(...)`
    /// constraints express, raising a typed [`ConfigError`] instead of
    /// trusting the deserialized value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transport;
        if t.app_id.is_empty() {
            return Err(ConfigError::Empty { field: "transport.app_id" });
        }
        if t.app_secret.is_empty() {
            return Err(ConfigError::Empty { field: "transport.app_secret" });
        }
        if t.broker_id.is_empty() {
            return Err(ConfigError::Empty { field: "transport.broker_id" });
        }
        if !(5..=300).contains(&t.keepalive) {
            return Err(ConfigError::OutOfRange {
                field: "transport.keepalive",
                value: t.keepalive as f64,
                min: 5.0,
                max: 300.0,
            });
        }
        if t.reconnect_min_delay_secs < 0.1 {
            return Err(ConfigError::MustBePositive {
                field: "transport.reconnect_min_delay_secs",
                value: t.reconnect_min_delay_secs,
            });
        }
        if t.reconnect_max_delay_secs < 1.0 {
            return Err(ConfigError::MustBePositive {
                field: "transport.reconnect_max_delay_secs",
                value: t.reconnect_max_delay_secs,
            });
        }
        if t.token_refresh_before_exp_secs < 10 {
            return Err(ConfigError::OutOfRange {
                field: "transport.token_refresh_before_exp_secs",
                value: t.token_refresh_before_exp_secs as f64,
                min: 10.0,
                max: f64::MAX,
            });
        }

        let d = &self.dispatcher;
        if d.maxlen == 0 {
            return Err(ConfigError::MustBePositive {
                field: "dispatcher.maxlen",
                value: 0.0,
            });
        }
        if !(0.0 < d.ema_alpha && d.ema_alpha <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "dispatcher.ema_alpha",
                value: d.ema_alpha,
                min: 0.0,
                max: 1.0,
            });
        }
        if !(0.0 < d.drop_warning_threshold && d.drop_warning_threshold <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "dispatcher.drop_warning_threshold",
                value: d.drop_warning_threshold,
                min: 0.0,
                max: 1.0,
            });
        }

        let h = &self.health;
        if h.max_gap_seconds <= 0.0 {
            return Err(ConfigError::MustBePositive {
                field: "health.max_gap_seconds",
                value: h.max_gap_seconds,
            });
        }

        Ok(())
    }

    pub fn dispatcher_config(&self) -> RuntimeDispatcherConfig {
        RuntimeDispatcherConfig {
            maxlen: self.dispatcher.maxlen,
            ema_alpha: self.dispatcher.ema_alpha,
            drop_warning_threshold: self.dispatcher.drop_warning_threshold,
        }
    }

    pub fn health_config(&self) -> RuntimeHealthConfig {
        RuntimeHealthConfig {
            max_gap_seconds: self.health.max_gap_seconds,
            per_symbol_max_gap: self.health.per_symbol_max_gap.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_transport() -> TransportFileConfig {
        TransportFileConfig {
            app_id: "id".into(),
            app_secret: "secret".into(),
            app_code: "code".into(),
            broker_id: "broker".into(),
            environment: None,
            base_url: None,
            port: default_port(),
            keepalive: default_keepalive(),
            reconnect_min_delay_secs: default_reconnect_min_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            token_refresh_before_exp_secs: default_token_refresh_before_exp(),
        }
    }

    fn valid_config() -> FileConfig {
        FileConfig {
            transport: valid_transport(),
            dispatcher: DispatcherFileConfig::default(),
            health: HealthFileConfig::default(),
            decoder: DecoderFileConfig::default(),
        }
    }

    mod validate_tests {
        use super::*;

        #[test]
        fn defaults_are_valid() {
            assert!(valid_config().validate().is_ok());
        }

        #[test]
        fn rejects_empty_app_id() {
            let mut config = valid_config();
            config.transport.app_id = String::new();
            assert!(matches!(
                config.validate(),
                Err(ConfigError::Empty { field: "transport.app_id" })
            ));
        }

        #[test]
        fn rejects_keepalive_out_of_range() {
            let mut config = valid_config();
            config.transport.keepalive = 1;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::OutOfRange { field: "transport.keepalive", .. })
            ));
        }

        #[test]
        fn rejects_ema_alpha_of_zero() {
            let mut config = valid_config();
            config.dispatcher.ema_alpha = 0.0;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::OutOfRange { field: "dispatcher.ema_alpha", .. })
            ));
        }

        #[test]
        fn rejects_zero_maxlen() {
            let mut config = valid_config();
            config.dispatcher.maxlen = 0;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::MustBePositive { field: "dispatcher.maxlen", .. })
            ));
        }

        #[test]
        fn rejects_nonpositive_max_gap_seconds() {
            let mut config = valid_config();
            config.health.max_gap_seconds = 0.0;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::MustBePositive { field: "health.max_gap_seconds", .. })
            ));
        }
    }
}
