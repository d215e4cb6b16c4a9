//! Auth/discovery collaborator: the opaque upstream service that logs in
//! and hands back a broker host + bearer token.
//!
//! This crate treats authentication and broker discovery as a pluggable
//! collaborator ([`TokenProvider`]) rather than baking a specific
//! identity provider's REST API in directly — mirrors the way the
//! original injected an SDK `Context` object rather than hardcoding HTTP
//! calls inline in the MQTT client.

use async_trait::async_trait;

use crate::config::{Environment, TransportFileConfig};
use crate::error::ConnectError;

/// A freshly issued broker endpoint + credential, as returned by
/// [`TokenProvider::login`].
#[derive(Debug, Clone)]
pub struct BrokerSession {
    pub host: String,
    pub token: String,
    pub token_type: String,
    pub expires_at_unix: f64,
    /// Resolved broker id (post-`SANDBOX` remap), needed by the transport
    /// to build the dispatcher's WebSocket path.
    pub broker_id: String,
}

/// Authenticates and discovers a broker endpoint. Implementations own
/// whatever REST/login flow the upstream requires; the transport only
/// needs `host` + `Authorization` header material back.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn login_and_discover(&self) -> Result<BrokerSession, ConnectError>;
}

/// Real [`TokenProvider`] backed by the Settrade-shaped dispatcher REST
/// API: login for an access token, then `GET
/// /api/dispatcher/v3/{broker_id}/token` for the MQTT host + token.
pub struct HttpTokenProvider {
    http: reqwest::Client,
    base_url: String,
    broker_id: String,
    app_id: String,
    app_secret: String,
    app_code: String,
}

impl HttpTokenProvider {
    pub fn new(config: &TransportFileConfig) -> Self {
        let (base_url, broker_id) = resolve_environment(config);
        Self {
            http: reqwest::Client::new(),
            base_url,
            broker_id,
            app_id: config.app_id.clone(),
            app_secret: pad_base64(&config.app_secret),
            app_code: config.app_code.clone(),
        }
    }
}

/// "SANDBOX" is not a real broker id — it's a sentinel the original
/// resolved to the UAT environment + broker id "098". Here that
/// resolution happens once, explicitly, off the [`Environment`] enum
/// rather than a case-insensitive string compare sprinkled through the
/// auth flow.
fn resolve_environment(config: &TransportFileConfig) -> (String, String) {
    if let Some(base_url) = &config.base_url {
        return (base_url.clone(), config.broker_id.clone());
    }
    match config.environment {
        Some(Environment::Sandbox) => (
            "https://open-api-test.settrade.com".to_string(),
            "098".to_string(),
        ),
        _ => (
            "https://open-api.settrade.com".to_string(),
            config.broker_id.clone(),
        ),
    }
}

/// The API console sometimes hands out an `app_secret` missing its
/// base64 padding; pad it out to a multiple of 4 before use.
fn pad_base64(secret: &str) -> String {
    let secret = secret.trim();
    let padding_needed = (4 - secret.len() % 4) % 4;
    let mut padded = secret.to_string();
    padded.extend(std::iter::repeat('=').take(padding_needed));
    padded
}

#[derive(serde::Deserialize)]
struct LoginResponse {
    access_token: String,
    token_type: String,
    expires_in: f64,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    hosts: Vec<String>,
    token: String,
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn login_and_discover(&self) -> Result<BrokerSession, ConnectError> {
        let login: LoginResponse = self
            .http
            .post(format!("{}/api/oam/v1/login", self.base_url))
            .json(&serde_json_login_body(&self.app_id, &self.app_secret, &self.app_code))
            .send()
            .await?
            .json()
            .await?;

        let token_resp: TokenResponse = self
            .http
            .get(format!(
                "{}/api/dispatcher/v3/{}/token",
                self.base_url, self.broker_id
            ))
            .bearer_auth(&login.access_token)
            .send()
            .await?
            .json()
            .await?;

        let host = token_resp.hosts.into_iter().next().ok_or(ConnectError::NoHosts)?;

        Ok(BrokerSession {
            host,
            token: token_resp.token,
            token_type: login.token_type,
            expires_at_unix: unix_now() + login.expires_in,
            broker_id: self.broker_id.clone(),
        })
    }
}

fn serde_json_login_body(app_id: &str, app_secret: &str, app_code: &str) -> serde_json_lite::LoginBody {
    serde_json_lite::LoginBody {
        app_id: app_id.to_string(),
        app_secret: app_secret.to_string(),
        app_code: app_code.to_string(),
    }
}

/// Tiny private module instead of depending on `serde_json` solely for
/// one request body shape — `reqwest`'s `json()` accepts any `Serialize`.
mod serde_json_lite {
    #[derive(serde::Serialize)]
    pub struct LoginBody {
        pub app_id: String,
        pub app_secret: String,
        pub app_code: String,
    }
}

pub(crate) fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// In-memory [`TokenProvider`] double: returns a canned session or error
/// without any network call. Used by this module's and [`crate::transport`]'s
/// tests to exercise auth-failure and state-machine paths without a real
/// broker.
#[cfg(test)]
pub(crate) struct FakeTokenProvider {
    result: std::sync::Mutex<Result<BrokerSession, String>>,
}

#[cfg(test)]
impl FakeTokenProvider {
    pub(crate) fn always_ok(session: BrokerSession) -> Self {
        Self {
            result: std::sync::Mutex::new(Ok(session)),
        }
    }

    pub(crate) fn always_err(message: impl Into<String>) -> Self {
        Self {
            result: std::sync::Mutex::new(Err(message.into())),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl TokenProvider for FakeTokenProvider {
    async fn login_and_discover(&self) -> Result<BrokerSession, ConnectError> {
        match &*self.result.lock().unwrap() {
            Ok(session) => Ok(session.clone()),
            Err(message) => Err(ConnectError::Auth(message.clone())),
        }
    }
}
