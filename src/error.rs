//! Typed errors for each subsystem of the feed adapter.

use thiserror::Error;

/// Errors raised while validating or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be > 0, got {value}")]
    MustBePositive { field: &'static str, value: f64 },

    #[error("{field} must be in [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("could not determine home directory")]
    NoHomeDir,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors raised while establishing or re-establishing a broker connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("discovery returned no broker hosts")]
    NoHosts,

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("connection rejected by broker: {0:?}")]
    Rejected(rumqttc::ConnectReturnCode),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    IllegalState(#[from] StateError),
}

/// Errors raised by illegal state-machine transitions.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("illegal state transition: cannot {action} while in state {state}")]
    IllegalState {
        action: &'static str,
        state: &'static str,
    },
}

/// Errors raised by the dispatcher's consumer-facing API.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("max_events must be > 0, got {0}")]
    InvalidMaxEvents(usize),
}

/// Errors raised by the validating event constructors.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("symbol must not be empty")]
    EmptySymbol,

    #[error("flag must be in 0..=3, got {0}")]
    InvalidFlag(u8),
}
