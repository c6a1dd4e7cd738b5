//! JSON-RPC 2.0 frame codec.
//!
//! One frame per line. `encode` produces a newline-terminated JSON object;
//! `decode` classifies an inbound line as a request, response, or
//! notification. Anything else is a `ProtocolError` for the session that read
//! it, never a panic.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use super::errors::ProtocolError;
use super::types::FailureKind;

// ─── Constants ───────────────────────────────────────────────────────────────

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Local: the transport failed before a response arrived.
    pub const TRANSPORT_ERROR: i32 = -32099;
}

// ─── Wire IDs ────────────────────────────────────────────────────────────────

/// Global monotonic wire id counter. Each attempt of a call gets a fresh id.
static NEXT_WIRE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a wire id that has never been used in this process.
pub fn next_wire_id() -> u64 {
    NEXT_WIRE_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Frames ──────────────────────────────────────────────────────────────────

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Classify the error code.
    pub fn kind(&self) -> FailureKind {
        match self.code {
            error_codes::TRANSPORT_ERROR => FailureKind::Transport,
            error_codes::PARSE_ERROR | error_codes::INVALID_REQUEST => FailureKind::Protocol,
            error_codes::METHOD_NOT_FOUND => FailureKind::UnknownTool,
            error_codes::INVALID_PARAMS => FailureKind::SchemaMismatch,
            _ => FailureKind::Tool,
        }
    }
}

/// A decoded JSON-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Carries an id and expects a response. Ids may be numbers or strings.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// Answers a request by id with a result or an error object.
    Response {
        id: Value,
        outcome: Result<Value, ErrorObject>,
    },
    /// No id, no response.
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Frame {
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        Frame::Request {
            id: Value::from(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Frame::Notification {
            method: method.to_string(),
            params,
        }
    }

    pub fn result(id: Value, result: Value) -> Self {
        Frame::Response {
            id,
            outcome: Ok(result),
        }
    }

    pub fn error(id: Value, error: ErrorObject) -> Self {
        Frame::Response {
            id,
            outcome: Err(error),
        }
    }

    /// Short label for logging.
    pub fn describe(&self) -> String {
        match self {
            Frame::Request { id, method, .. } => format!("request {method} (id {id})"),
            Frame::Response { id, .. } => format!("response (id {id})"),
            Frame::Notification { method, .. } => format!("notification {method}"),
        }
    }
}

// ─── Encode ──────────────────────────────────────────────────────────────────

/// Serialize a frame to one newline-terminated line.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let value = match frame {
        Frame::Request { id, method, params } => {
            let mut obj = json!({"jsonrpc": JSONRPC_VERSION, "id": id, "method": method});
            if let Some(params) = params {
                obj["params"] = params.clone();
            }
            obj
        }
        Frame::Response { id, outcome } => match outcome {
            Ok(result) => json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result}),
            Err(error) => json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": error}),
        },
        Frame::Notification { method, params } => {
            let mut obj = json!({"jsonrpc": JSONRPC_VERSION, "method": method});
            if let Some(params) = params {
                obj["params"] = params.clone();
            }
            obj
        }
    };

    let mut line = serde_json::to_string(&value)
        .map_err(|e| ProtocolError::new(format!("failed to serialize frame: {e}")))?;
    line.push('\n');
    Ok(line)
}

// ─── Decode ──────────────────────────────────────────────────────────────────

/// Field-level view of an inbound frame. `id` and `result` use
/// `deserialize_present` so that an explicit `null` is distinguishable from a
/// missing field.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "deserialize_present")]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Decode one inbound line.
pub fn decode(line: &str) -> Result<Frame, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.starts_with('[') {
        return Err(ProtocolError::new("batch frames are not supported"));
    }

    let raw: RawFrame = serde_json::from_str(trimmed)
        .map_err(|e| ProtocolError::new(format!("malformed frame: {e}")))?;

    match raw.jsonrpc.as_deref() {
        Some(JSONRPC_VERSION) => {}
        Some(other) => {
            return Err(ProtocolError::new(format!(
                "unsupported jsonrpc version '{other}'"
            )))
        }
        None => return Err(ProtocolError::new("missing jsonrpc version")),
    }

    if let Some(method) = raw.method {
        if raw.result.is_some() || raw.error.is_some() {
            return Err(ProtocolError::new(
                "frame carries both a method and a result/error",
            ));
        }
        return Ok(match raw.id {
            Some(Value::Null) | None => Frame::Notification {
                method,
                params: raw.params,
            },
            Some(id) => Frame::Request {
                id,
                method,
                params: raw.params,
            },
        });
    }

    let id = match raw.id {
        Some(id @ (Value::Number(_) | Value::String(_))) => id,
        Some(Value::Null) => {
            let detail = raw
                .error
                .map(|e| format!(": [{}] {}", e.code, e.message))
                .unwrap_or_default();
            return Err(ProtocolError::new(format!(
                "response with null id{detail}"
            )));
        }
        Some(other) => {
            return Err(ProtocolError::new(format!("invalid response id {other}")))
        }
        None => {
            return Err(ProtocolError::new(
                "frame is neither a request, response, nor notification",
            ))
        }
    };

    let outcome = match (raw.result, raw.error) {
        (Some(_), Some(_)) => {
            return Err(ProtocolError::new(
                "response carries both result and error",
            ))
        }
        (Some(result), None) => Ok(result),
        (None, Some(error)) => Err(error),
        (None, None) => {
            return Err(ProtocolError::new(
                "response missing both result and error",
            ))
        }
    };

    Ok(Frame::Response { id, outcome })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
