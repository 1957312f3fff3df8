//! The signed `connect` request.
//!
//! The device proves possession of its key by signing a `|`-joined string
//! of the handshake fields. With a challenge nonce the string is tagged
//! `v2` and ends with the nonce; without one it is tagged `v1`:
//!
//! ```text
//! v2|deviceId|clientId|clientMode|role|scope1,scope2|signedAtMs|token|nonce
//! ```

use serde::Serialize;
use serde_json::{Map, Value};
use wisprclaw_core::{DeviceIdentity, PROTOCOL_VERSION, encode_url_safe};

use crate::{Error, GatewayConfig};

/// Payload type of a successful `connect` response.
pub const HELLO_OK: &str = "hello-ok";

/// Fields covered by the device signature.
#[derive(Debug, Clone, Copy)]
pub struct SignedFields<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: u64,
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

impl SignedFields<'_> {
    /// The exact string the device signs.
    pub fn signing_string(&self) -> String {
        let version = if self.nonce.is_some() { "v2" } else { "v1" };
        let scopes = self.scopes.join(",");
        let signed_at = self.signed_at_ms.to_string();
        let mut parts = vec![
            version,
            self.device_id,
            self.client_id,
            self.client_mode,
            self.role,
            scopes.as_str(),
            signed_at.as_str(),
            self.token.unwrap_or(""),
        ];
        if let Some(nonce) = self.nonce {
            parts.push(nonce);
        }
        parts.join("|")
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub permissions: Map<String, Value>,
    pub locale: String,
    pub user_agent: String,
    pub device: DeviceProof,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthToken>,
}

#[derive(Debug, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProof {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthToken {
    pub token: String,
}

impl ConnectParams {
    /// Build and sign the `connect` params.
    pub fn build(
        config: &GatewayConfig,
        identity: &DeviceIdentity,
        signed_at_ms: u64,
        nonce: Option<&str>,
    ) -> Result<Self, Error> {
        let token = config.token.as_deref().filter(|t| !t.is_empty());
        let fields = SignedFields {
            device_id: identity.device_id(),
            client_id: &config.client_id,
            client_mode: &config.client_mode,
            role: &config.role,
            scopes: &config.scopes,
            signed_at_ms,
            token,
            nonce,
        };
        let signature = identity.sign(fields.signing_string().as_bytes())?;
        let version = env!("CARGO_PKG_VERSION");

        Ok(Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: config.client_id.clone(),
                version: version.to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: config.client_mode.clone(),
            },
            role: config.role.clone(),
            scopes: config.scopes.clone(),
            caps: Vec::new(),
            commands: Vec::new(),
            permissions: Map::new(),
            locale: config.locale.clone(),
            user_agent: format!("wisprclaw/{version}"),
            device: DeviceProof {
                id: identity.device_id().to_string(),
                public_key: identity.public_key_url_safe(),
                signature: encode_url_safe(&signature),
                signed_at: signed_at_ms,
                nonce: nonce.map(str::to_string),
            },
            auth: token.map(|token| AuthToken {
                token: token.to_string(),
            }),
        })
    }

    pub fn to_value(&self) -> Result<Value, Error> {
        serde_json::to_value(self).map_err(|e| Error::Encode(e.to_string()))
    }
}

/// Check the `connect` response payload.
pub fn verify_hello(payload: &Value) -> Result<(), Error> {
    match payload.get("type").and_then(Value::as_str) {
        Some(HELLO_OK) => Ok(()),
        Some(other) => Err(Error::Handshake(format!(
            "expected {HELLO_OK} response, got {other}"
        ))),
        None => Err(Error::Handshake(
            "connect response has no type".to_string(),
        )),
    }
}
