//! MCP Client error types.

use thiserror::Error;

use super::types::{FailureKind, SessionState};

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The transport to a server could not be established.
    #[error("failed to connect to server '{server}': {reason}")]
    ConnectFailed {
        server: String,
        reason: String,
    },

    /// The transport came up but the initialization handshake failed.
    #[error("server '{server}' handshake failed: {reason}")]
    HandshakeFailed {
        server: String,
        reason: String,
    },

    /// A malformed or unrecognized frame arrived on a session.
    #[error("protocol error on server '{server}': {reason}")]
    Protocol {
        server: String,
        reason: String,
    },

    /// I/O failure on an established session (write failed, peer closed).
    #[error("transport error for server '{server}': {reason}")]
    Transport {
        server: String,
        reason: String,
    },

    /// Dispatch attempted against a session that is missing or not Ready.
    #[error("server '{server}' is unavailable ({})", state.map(|s| s.as_str()).unwrap_or("not connected"))]
    SessionUnavailable {
        server: String,
        state: Option<SessionState>,
    },

    /// Tool not found in the registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// Tool call arguments failed input-schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    SchemaMismatch {
        tool: String,
        reason: String,
    },

    /// A request did not complete before its deadline.
    #[error("'{tool}' timed out after {timeout_ms}ms")]
    Timeout {
        tool: String,
        timeout_ms: u64,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request id is already in flight.
    #[error("request id '{request_id}' is already in flight")]
    DuplicateRequestId {
        request_id: String,
    },

    /// A server announced a tool set that cannot be registered.
    #[error("server '{server}' announced an invalid tool set: {reason}")]
    InvalidToolSet {
        server: String,
        reason: String,
    },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// All reconnect attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} reconnect attempts")]
    RestartExhausted {
        name: String,
        attempts: u32,
    },
}

impl McpError {
    /// Whether this error belongs to the ConnectError family (session could
    /// not be established).
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            McpError::ConnectFailed { .. } | McpError::HandshakeFailed { .. }
        )
    }

    /// The per-call failure kind this error reports as.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            McpError::ConnectFailed { .. }
            | McpError::HandshakeFailed { .. }
            | McpError::SessionUnavailable { .. }
            | McpError::RestartExhausted { .. } => FailureKind::SessionUnavailable,
            McpError::Protocol { .. } => FailureKind::Protocol,
            McpError::Transport { .. } | McpError::Timeout { .. } => FailureKind::Transport,
            McpError::UnknownTool { .. } => FailureKind::UnknownTool,
            McpError::SchemaMismatch { .. } => FailureKind::SchemaMismatch,
            McpError::DuplicateRequestId { .. } => FailureKind::DuplicateRequest,
            McpError::ServerError { .. }
            | McpError::InvalidToolSet { .. }
            | McpError::ConfigError { .. } => FailureKind::Tool,
        }
    }
}

/// A frame that could not be decoded. Isolated to the session that read it.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{reason}")]
pub struct ProtocolError {
    pub reason: String,
}

impl ProtocolError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Attach the server the frame arrived on.
    pub fn on_server(self, server: &str) -> McpError {
        McpError::Protocol {
            server: server.to_string(),
            reason: self.reason,
        }
    }
}
