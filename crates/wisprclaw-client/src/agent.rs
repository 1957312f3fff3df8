//! `agent` request params and reply text extraction.

use serde::Serialize;
use serde_json::Value;
use wisprclaw_core::message::STATUS_ERROR;

use crate::Error;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentParams<'a> {
    pub message: &'a str,
    pub idempotency_key: &'a str,
    pub deliver: bool,
    pub agent_id: &'a str,
}

impl<'a> AgentParams<'a> {
    pub fn new(message: &'a str, idempotency_key: &'a str, agent_id: &'a str) -> Self {
        Self {
            message,
            idempotency_key,
            deliver: false,
            agent_id,
        }
    }
}

/// Turn the final `agent` payload into the text shown to the user.
///
/// Non-empty `result.payloads[].text` entries joined by newlines and then
/// trimmed win, then `result.summary` / `summary`, then the empty string. A payload
/// with `status: "error"` is an agent failure.
pub fn reply_text(payload: &Value) -> Result<String, Error> {
    if payload.get("status").and_then(Value::as_str) == Some(STATUS_ERROR) {
        let message = str_field(payload, "error")
            .or_else(|| payload.pointer("/error/message").and_then(Value::as_str))
            .or_else(|| str_field(payload, "summary"))
            .unwrap_or("agent run failed");
        return Err(Error::Agent(message.to_string()));
    }

    let result = payload.get("result").unwrap_or(payload);
    let texts: Vec<&str> = result
        .get("payloads")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .filter(|t| !t.is_empty())
        .collect();

    let joined = texts.join("\n");
    let joined = joined.trim();
    if !joined.is_empty() {
        return Ok(joined.to_string());
    }

    let summary = str_field(result, "summary")
        .or_else(|| str_field(payload, "summary"))
        .unwrap_or("");
    Ok(summary.trim().to_string())
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}
