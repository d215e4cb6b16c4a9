//! MQTT transport and session manager: TLS-WebSocket connection lifecycle,
//! the subscription registry, reconnect-with-backoff, and credential
//! refresh.
//!
//! Grounded in the teacher's `mqtt.rs` for the rumqttc wiring shape (an
//! `AsyncClient`/`EventLoop` pair driven by a single `tokio::spawn`'d IO
//! task, `Drop` aborting that task on shutdown) and in the original
//! Python transport for the state machine, the guarded reconnect worker,
//! and the token-refresh timer. Unlike the teacher, this transport talks
//! to a real broker over properly verified TLS — the teacher's
//! self-signed-certificate bypass has no place here.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport as MqttTransport,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{unix_now, TokenProvider};
use crate::config::TransportFileConfig;
use crate::error::{ConnectError, StateError};

/// Internal rumqttc request-channel capacity.
const MQTT_EVENT_QUEUE_CAPACITY: usize = 64;
/// Channel capacity for [`TransportEvent`]s delivered to the caller.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// A callback bound to one topic in the subscription registry. Invoked
/// with the raw publish payload; parsing/normalization is the caller's
/// concern (typically [`crate::decoder::Decoder::on_message`]).
pub type FrameCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Connection state machine. Transitions to `Connected` happen only
/// inside the `ConnAck` handler — a successful TCP/TLS handshake is not
/// the same as a broker-confirmed MQTT session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Connecting,
    Connected,
    Reconnecting,
    Shutdown,
}

impl ClientState {
    fn as_str(self) -> &'static str {
        match self {
            ClientState::Init => "Init",
            ClientState::Connecting => "Connecting",
            ClientState::Connected => "Connected",
            ClientState::Reconnecting => "Reconnecting",
            ClientState::Shutdown => "Shutdown",
        }
    }
}

/// Lifecycle events the transport delivers to its caller. Inbound
/// publishes are not delivered here — they're fanned out directly to the
/// callbacks registered via [`Transport::subscribe`], per-topic, in the
/// order they were registered.
#[derive(Debug)]
pub enum TransportEvent {
    Connected { conn_epoch: u32 },
    Disconnected,
    Error(String),
}

/// Snapshot returned by [`Transport::stats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportStats {
    pub state: &'static str,
    pub connected: bool,
    pub messages_received: u64,
    pub callback_errors: u64,
    pub reconnect_count: u64,
    pub last_connect_unix: Option<f64>,
    pub last_disconnect_unix: Option<f64>,
}

struct Shared {
    state: std::sync::Mutex<ClientState>,
    registry: std::sync::RwLock<HashMap<String, Vec<FrameCallback>>>,
    generation: AtomicU32,
    conn_epoch: AtomicU32,
    ever_connected: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_count: AtomicU64,
    messages_received: AtomicU64,
    callback_errors: AtomicU64,
    last_connect_unix: std::sync::Mutex<Option<f64>>,
    last_disconnect_unix: std::sync::Mutex<Option<f64>>,
}

impl Shared {
    fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap() = state;
    }
}

/// Runtime-facing subset of [`TransportFileConfig`] plus a resolved
/// reconnect backoff policy.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub port: u16,
    pub keepalive: Duration,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub token_refresh_before_exp: Duration,
}

impl From<&TransportFileConfig> for TransportConfig {
    fn from(c: &TransportFileConfig) -> Self {
        Self {
            port: c.port,
            keepalive: Duration::from_secs(c.keepalive as u64),
            reconnect_min_delay: Duration::from_secs_f64(c.reconnect_min_delay_secs),
            reconnect_max_delay: Duration::from_secs_f64(c.reconnect_max_delay_secs),
            token_refresh_before_exp: Duration::from_secs(c.token_refresh_before_exp_secs),
        }
    }
}

/// Returns `Ok(())` iff `state == Init`, else a `StateError::IllegalState`
/// naming `action`. Factored out of [`Transport::connect`] so the
/// illegal-state guard is unit-testable without a broker connection.
fn require_init_state(action: &'static str, state: ClientState) -> Result<(), StateError> {
    if state != ClientState::Init {
        return Err(StateError::IllegalState {
            action,
            state: state.as_str(),
        });
    }
    Ok(())
}

/// Returns `Ok(())` unless `state == Shutdown`. `subscribe`/`unsubscribe`
/// are valid in every other state per spec — the registry is always
/// mutable, only the broker-facing (re)subscribe is gated on `Connected`.
fn require_not_shutdown(action: &'static str, state: ClientState) -> Result<(), StateError> {
    if state == ClientState::Shutdown {
        return Err(StateError::IllegalState {
            action,
            state: state.as_str(),
        });
    }
    Ok(())
}

struct TransportTasks {
    io_handle: JoinHandle<()>,
    refresh_handle: JoinHandle<()>,
}

/// MQTT transport and session manager.
///
/// Constructed via [`Transport::new`] in the `Init` state; [`Transport::connect`]
/// performs the actual login/connect and starts the background IO and
/// credential-refresh tasks. Calling `connect` a second time (or after
/// `shutdown`) is an illegal-state error rather than silently rebuilding
/// the session underneath already-running tasks.
pub struct Transport {
    shared: Arc<Shared>,
    client: Arc<AsyncMutex<Option<AsyncClient>>>,
    tasks: AsyncMutex<Option<TransportTasks>>,
    cancel: CancellationToken,
    config: TransportConfig,
    token_provider: Arc<dyn TokenProvider>,
}

impl Transport {
    pub fn new(config: TransportConfig, token_provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: std::sync::Mutex::new(ClientState::Init),
                registry: std::sync::RwLock::new(HashMap::new()),
                generation: AtomicU32::new(0),
                conn_epoch: AtomicU32::new(0),
                ever_connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                reconnect_count: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                callback_errors: AtomicU64::new(0),
                last_connect_unix: std::sync::Mutex::new(None),
                last_disconnect_unix: std::sync::Mutex::new(None),
            }),
            client: Arc::new(AsyncMutex::new(None)),
            tasks: AsyncMutex::new(None),
            cancel: CancellationToken::new(),
            config,
            token_provider,
        }
    }

    /// Logs in, connects, and starts the background IO and
    /// credential-refresh tasks. Permitted only from `Init` — calling
    /// this on an already-connected or shut-down transport returns
    /// [`StateError::IllegalState`] wrapped in [`ConnectError::IllegalState`].
    pub async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, ConnectError> {
        {
            let state = self.shared.state();
            require_init_state("connect", state)?;
            self.shared.set_state(ClientState::Connecting);
        }

        let session = match self.token_provider.login_and_discover().await {
            Ok(session) => session,
            Err(e) => {
                // Authentication failure on initial connect is fatal and
                // propagated (spec §7); leave the transport usable for a
                // retried `connect()` rather than stuck in `Connecting`.
                self.shared.set_state(ClientState::Init);
                return Err(e);
            }
        };

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (reconnect_req_tx, reconnect_req_rx) = mpsc::channel(1);

        let bound_generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (client, eventloop) = build_client(&self.config, &session, bound_generation);
        *self.client.lock().await = Some(client);

        let io_handle = tokio::spawn(run_io_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.client),
            eventloop,
            bound_generation,
            self.config.clone(),
            Arc::clone(&self.token_provider),
            event_tx.clone(),
            reconnect_req_rx,
            self.cancel.clone(),
        ));

        let refresh_handle = tokio::spawn(run_token_refresh(
            self.config.clone(),
            session.expires_at_unix,
            reconnect_req_tx,
            self.cancel.clone(),
        ));

        *self.tasks.lock().await = Some(TransportTasks {
            io_handle,
            refresh_handle,
        });

        Ok(event_rx)
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Appends `callback` to the registry entry for `topic`, in order. If
    /// the topic has no prior entry and the session is currently
    /// `Connected`, also issues an MQTT SUBSCRIBE; otherwise the topic is
    /// replayed automatically on the next successful (re)connect. Valid
    /// in any state except `Shutdown`.
    pub async fn subscribe(&self, topic: &str, callback: FrameCallback) -> Result<(), ConnectError> {
        let state = self.shared.state();
        require_not_shutdown("subscribe", state)?;

        let is_new_topic = {
            let mut registry = self.shared.registry.write().unwrap();
            let is_new = !registry.contains_key(topic);
            registry.entry(topic.to_string()).or_default().push(callback);
            is_new
        };
        if is_new_topic && state == ClientState::Connected {
            if let Some(client) = self.client.lock().await.as_ref() {
                client.subscribe(topic, QoS::AtMostOnce).await?;
            }
        }
        Ok(())
    }

    /// Removes the entire registry entry (every callback) for `topic`;
    /// if `Connected`, also issues an MQTT UNSUBSCRIBE. No-op if unknown.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), ConnectError> {
        let state = self.shared.state();
        require_not_shutdown("unsubscribe", state)?;

        let existed = self.shared.registry.write().unwrap().remove(topic).is_some();
        if existed && state == ClientState::Connected {
            if let Some(client) = self.client.lock().await.as_ref() {
                client.unsubscribe(topic).await?;
            }
        }
        Ok(())
    }

    pub fn subscribed_topics(&self) -> HashSet<String> {
        self.shared.registry.read().unwrap().keys().cloned().collect()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.shared.messages_received.load(Ordering::Relaxed)
    }

    pub fn callback_errors(&self) -> u64 {
        self.shared.callback_errors.load(Ordering::Relaxed)
    }

    /// Snapshot of lifetime counters and connection bookkeeping (§4.1).
    pub fn stats(&self) -> TransportStats {
        let state = self.shared.state();
        TransportStats {
            state: state.as_str(),
            connected: state == ClientState::Connected,
            messages_received: self.shared.messages_received.load(Ordering::Relaxed),
            callback_errors: self.shared.callback_errors.load(Ordering::Relaxed),
            reconnect_count: self.shared.reconnect_count.load(Ordering::Relaxed),
            last_connect_unix: *self.shared.last_connect_unix.lock().unwrap(),
            last_disconnect_unix: *self.shared.last_disconnect_unix.lock().unwrap(),
        }
    }

    /// Orderly shutdown: cancels background tasks and disconnects from
    /// the broker. Idempotent.
    pub async fn shutdown(&self) -> Result<(), StateError> {
        if self.shared.state() == ClientState::Shutdown {
            return Ok(());
        }
        self.shared.set_state(ClientState::Shutdown);
        self.cancel.cancel();
        *self.shared.last_disconnect_unix.lock().unwrap() = Some(unix_now());
        if let Some(client) = self.client.lock().await.as_ref() {
            let _ = client.disconnect().await;
        }
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut tasks) = self.tasks.try_lock() {
            if let Some(tasks) = tasks.take() {
                tasks.io_handle.abort();
                tasks.refresh_handle.abort();
            }
        }
    }
}

/// Dispatcher WebSocket path, parameterized by the resolved broker id
/// (post-`SANDBOX` remap). Matches the original's
/// `ws_set_options(path=..., headers={"Authorization": ...})`.
fn dispatcher_ws_path(broker_id: &str) -> String {
    format!("/api/dispatcher/v3/{broker_id}/mqtt")
}

fn build_client(
    config: &TransportConfig,
    session: &crate::auth::BrokerSession,
    generation: u32,
) -> (AsyncClient, rumqttc::EventLoop) {
    let client_id = format!("mdfeed-{}-{generation}", std::process::id());
    let mut opts = MqttOptions::new(client_id, session.host.clone(), config.port);
    opts.set_keep_alive(config.keepalive);
    // At-most-once / clean-session: no server-side replay, no QoS
    // persistence across reconnects (§4.1, §GLOSSARY). Deliberate, not an
    // oversight — stale market data is worthless.
    opts.set_clean_session(true);

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    opts.set_transport(MqttTransport::wss_with_config(TlsConfiguration::Rustls(
        Arc::new(tls_config),
    )));

    // The broker authenticates the WebSocket upgrade itself, not the MQTT
    // CONNECT packet: no `set_credentials` call here. Instead the upgrade
    // request's URI path is rewritten to the dispatcher endpoint and an
    // `Authorization: {token_type} {token}` header is attached, mirroring
    // `ws_set_options(path=..., headers=...)` in the original transport.
    let path = dispatcher_ws_path(&session.broker_id);
    let auth_header = format!("{} {}", session.token_type, session.token);
    opts.set_request_modifier(move |mut request: http::Request<()>| {
        let path = path.clone();
        let auth_header = auth_header.clone();
        Box::pin(async move {
            let mut parts = request.uri().clone().into_parts();
            if let Ok(path_and_query) = http::uri::PathAndQuery::from_maybe_shared(path) {
                parts.path_and_query = Some(path_and_query);
            }
            if let Ok(uri) = http::Uri::from_parts(parts) {
                *request.uri_mut() = uri;
            }
            if let Ok(value) = http::HeaderValue::from_str(&auth_header) {
                request.headers_mut().insert(http::header::AUTHORIZATION, value);
            }
            request
        })
    });

    AsyncClient::new(opts, MQTT_EVENT_QUEUE_CAPACITY)
}

/// True if a callback bound to `bound_generation` should still be
/// trusted to dispatch under the currently live `current_generation`.
/// A stale client (one superseded by a reconnect) fails this check and
/// its in-flight callback is dropped rather than acted on.
fn accept_for_generation(bound_generation: u32, current_generation: u32) -> bool {
    bound_generation == current_generation
}

/// Invokes every callback registered for a topic, in order, isolating
/// per-callback failures: a panicking callback increments
/// `callback_errors` and is logged, but never prevents later callbacks
/// for the same frame from running.
fn fan_out(callbacks: &[FrameCallback], payload: &[u8], callback_errors: &AtomicU64, topic: &str) {
    for callback in callbacks {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(payload)));
        if result.is_err() {
            let count = callback_errors.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(topic, count, "transport callback error");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_io_loop(
    shared: Arc<Shared>,
    client: Arc<AsyncMutex<Option<AsyncClient>>>,
    mut eventloop: rumqttc::EventLoop,
    mut bound_generation: u32,
    config: TransportConfig,
    token_provider: Arc<dyn TokenProvider>,
    event_tx: mpsc::Sender<TransportEvent>,
    mut reconnect_req_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = reconnect_req_rx.recv() => {
                tracing::info!("controlled reconnect requested (token refresh)");
                match reconnect_with_backoff(&shared, &client, &config, &token_provider, &cancel).await {
                    Some((new_generation, new_eventloop)) => {
                        bound_generation = new_generation;
                        eventloop = new_eventloop;
                    }
                    None => return,
                }
            }
            event = eventloop.poll() => {
                // This task never polls two event loops concurrently, so
                // in practice `bound_generation` always matches
                // `shared.generation` here — the check documents and
                // enforces the invariant rather than papering over a race
                // that could otherwise be introduced by a future refactor
                // (e.g. speculatively polling a new loop before the old
                // one is torn down).
                if !accept_for_generation(bound_generation, shared.generation.load(Ordering::Relaxed)) {
                    continue;
                }
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            let _ = event_tx.send(TransportEvent::Error(format!(
                                "connection rejected: {:?}", ack.code
                            ))).await;
                            match reconnect_with_backoff(&shared, &client, &config, &token_provider, &cancel).await {
                                Some((new_generation, new_eventloop)) => {
                                    bound_generation = new_generation;
                                    eventloop = new_eventloop;
                                }
                                None => return,
                            }
                            continue;
                        }
                        shared.set_state(ClientState::Connected);
                        *shared.last_connect_unix.lock().unwrap() = Some(unix_now());
                        // The epoch starts at 0 and increments once per
                        // successful *reconnect* — the very first
                        // connection of a session leaves it at 0.
                        let epoch = if shared.ever_connected.swap(true, Ordering::Relaxed) {
                            shared.conn_epoch.fetch_add(1, Ordering::Relaxed) + 1
                        } else {
                            shared.conn_epoch.load(Ordering::Relaxed)
                        };

                        let topics: Vec<String> = shared.registry.read().unwrap().keys().cloned().collect();
                        {
                            let client_guard = client.lock().await;
                            if let Some(client) = client_guard.as_ref() {
                                for topic in &topics {
                                    let _ = client.subscribe(topic, QoS::AtMostOnce).await;
                                }
                            }
                        }
                        tracing::info!(epoch, replayed = topics.len(), "connected, subscriptions replayed");
                        let _ = event_tx.send(TransportEvent::Connected { conn_epoch: epoch }).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        shared.messages_received.fetch_add(1, Ordering::Relaxed);
                        let callbacks = shared.registry.read().unwrap().get(&publish.topic).cloned();
                        if let Some(callbacks) = callbacks {
                            fan_out(&callbacks, &publish.payload, &shared.callback_errors, &publish.topic);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "MQTT event loop error");
                        *shared.last_disconnect_unix.lock().unwrap() = Some(unix_now());
                        let _ = event_tx.send(TransportEvent::Disconnected).await;
                        match reconnect_with_backoff(&shared, &client, &config, &token_provider, &cancel).await {
                            Some((new_generation, new_eventloop)) => {
                                bound_generation = new_generation;
                                eventloop = new_eventloop;
                            }
                            None => return,
                        }
                    }
                }
            }
        }
    }
}

/// Guarded reconnect: fetches fresh credentials and rebuilds the MQTT
/// client, retrying with jittered exponential backoff until it succeeds
/// or shutdown is requested. Each invocation resets the backoff delay to
/// `reconnect_min_delay` — matching the original's "no persistent
/// backoff state across reconnect episodes" behavior.
///
/// Returns `None` if cancelled mid-backoff.
async fn reconnect_with_backoff(
    shared: &Arc<Shared>,
    client: &Arc<AsyncMutex<Option<AsyncClient>>>,
    config: &TransportConfig,
    token_provider: &Arc<dyn TokenProvider>,
    cancel: &CancellationToken,
) -> Option<(u32, rumqttc::EventLoop)> {
    if shared.state() == ClientState::Shutdown {
        return None;
    }
    shared.reconnecting.store(true, Ordering::Relaxed);
    shared.set_state(ClientState::Reconnecting);

    let mut delay = config.reconnect_min_delay;
    let result = loop {
        if cancel.is_cancelled() {
            break None;
        }
        match token_provider.login_and_discover().await {
            Ok(session) => {
                let generation = shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let (new_client, new_eventloop) = build_client(config, &session, generation);
                *client.lock().await = Some(new_client);
                shared.reconnect_count.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    generation,
                    total = shared.reconnect_count.load(Ordering::Relaxed),
                    "reconnect TCP/TLS success, awaiting ConnAck"
                );
                break Some((generation, new_eventloop));
            }
            Err(e) => {
                tracing::warn!(error = %e, delay_ms = delay.as_millis(), "reconnect attempt failed");
                let jitter = rand::thread_rng().gen_range(0.8..1.2);
                let jittered = delay.mul_f64(jitter);
                tokio::select! {
                    _ = cancel.cancelled() => break None,
                    _ = tokio::time::sleep(jittered) => {}
                }
                delay = (delay * 2).min(config.reconnect_max_delay);
            }
        }
    };
    shared.reconnecting.store(false, Ordering::Relaxed);
    result
}

/// Background timer that requests a controlled reconnect shortly before
/// the current token expires, so credentials are always refreshed ahead
/// of the broker rejecting them.
async fn run_token_refresh(
    config: TransportConfig,
    mut expires_at_unix: f64,
    reconnect_req_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    loop {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let time_until_refresh = expires_at_unix - config.token_refresh_before_exp.as_secs_f64() - now;

        if time_until_refresh <= 0.0 {
            tracing::info!(expires_at_unix, "token near expiry, requesting controlled reconnect");
            if reconnect_req_tx.send(()).await.is_err() {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(config.reconnect_max_delay) => {}
            }
            // A fresh expiry is only known to the IO task after it
            // reconnects; this timer re-checks on the same cadence and
            // relies on the next token fetch to push expiry forward.
            expires_at_unix = now + config.reconnect_max_delay.as_secs_f64();
        } else {
            let wait = Duration::from_secs_f64(time_until_refresh.min(60.0));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
