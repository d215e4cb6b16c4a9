//! Low-latency market-data feed adapter.
//!
//! This crate is a library, not an application — the teacher's
//! module list here was a TUI binary's module declarations
//! (`app`/`demo`/`wizard`/`ui`); this crate has no terminal, no
//! keybindings, and no binary entrypoint. Callers wire the pieces
//! together: [`auth`] discovers a broker and token, [`transport`] holds
//! the MQTT session, [`decoder`] turns raw publishes into typed
//! [`events::FeedEvent`]s, [`dispatcher`] hands them to a consumer
//! thread under bounded backpressure, and [`health`] answers "is the
//! feed still alive".

pub mod auth;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod health;
pub mod transport;

pub use config::{Environment, FileConfig};
pub use decoder::{Decoder, DecoderConfig, DecoderStats, Money, RawBidOfferFrame};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHealth, DispatcherStats};
pub use events::{BestLevelEvent, FeedEvent, FullDepthEvent, SessionFlag};
pub use health::{FeedHealthMonitor, HealthConfig};
pub use transport::{
    ClientState, FrameCallback, Transport, TransportConfig, TransportEvent, TransportStats,
};

/// Installs a `tracing-subscriber` that reads its filter from
/// `RUST_LOG`, defaulting to `info` if unset. Not mandatory — any
/// `tracing` subscriber works — but this is the one the ambient stack
/// is built against, grounded on the same env-filter pattern the rest
/// of the Rust ecosystem uses for binaries embedding this crate.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
