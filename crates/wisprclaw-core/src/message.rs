//! Wire envelope.
//!
//! Every frame is a JSON object tagged by `type`:
//! `req` (client → gateway), `res` (reply to a `req` with the same `id`)
//! and `event` (unsolicited gateway push). Bodies are left as
//! [`serde_json::Value`]; their shape belongs to the method or event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name carrying the handshake nonce.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// Payload status of the intermediate acknowledgement in a two-phase reply.
pub const STATUS_ACCEPTED: &str = "accepted";

/// Payload status the agent reports on a failed run.
pub const STATUS_ERROR: &str = "error";

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Req(RequestFrame),
    Res(ResponseFrame),
    Event(EventFrame),
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A reply correlated to a request by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// `payload.status`, if present.
    pub fn status(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("status"))
            .and_then(Value::as_str)
    }

    /// True for the "accepted" acknowledgement that precedes the final reply.
    pub fn is_accepted(&self) -> bool {
        self.status() == Some(STATUS_ACCEPTED)
    }

    /// Best available error message for a failed response.
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "request failed".to_string())
    }
}

/// Error body of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// An unsolicited gateway event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl EventFrame {
    /// Nonce of a `connect.challenge` event. `None` for other events or a
    /// challenge without a nonce.
    pub fn challenge_nonce(&self) -> Option<&str> {
        if self.event != CHALLENGE_EVENT {
            return None;
        }
        self.payload.get("nonce").and_then(Value::as_str)
    }
}

/// Encode a frame as a text frame body.
pub fn encode(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Decode a text frame. Anything that is not a known envelope yields `None`.
pub fn decode(text: &str) -> Option<Frame> {
    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::trace!(error = %e, "Dropping undecodable frame");
            None
        }
    }
}

/// Decode a binary frame carrying the same JSON envelope.
pub fn decode_bytes(data: &[u8]) -> Option<Frame> {
    match serde_json::from_slice(data) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::trace!(error = %e, "Dropping undecodable binary frame");
            None
        }
    }
}
