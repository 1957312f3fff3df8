use serde::Deserialize;
use std::time::Duration;

use crate::Error;

/// How to reach and authenticate with the gateway.
///
/// Every field has a default, so a partial TOML table deserializes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway base URL. `http(s)://` is rewritten to `ws(s)://`.
    pub url: String,
    /// Optional bearer token, sent as `auth.token` and signed.
    pub token: Option<String>,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub locale: String,
    /// Agent addressed by `agent` requests.
    pub agent_id: String,
    /// How long to wait for `connect.challenge` after the socket opens.
    pub challenge_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:18789".to_string(),
            token: None,
            client_id: "wisprclaw".to_string(),
            client_mode: "ui".to_string(),
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            locale: "en-US".to_string(),
            agent_id: "main".to_string(),
            challenge_timeout_ms: 10_000,
        }
    }
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_millis(self.challenge_timeout_ms)
    }

    /// WebSocket endpoint for [`Self::url`].
    pub fn websocket_url(&self) -> Result<String, Error> {
        websocket_url(&self.url)
    }
}

/// Rewrite `http://` to `ws://` and `https://` to `wss://`.
pub fn websocket_url(base: &str) -> Result<String, Error> {
    let url = base
        .trim()
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(url)
    } else {
        Err(Error::InvalidUrl(base.to_string()))
    }
}
