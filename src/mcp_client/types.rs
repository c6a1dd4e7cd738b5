//! Shared types for the MCP client.
//!
//! Server configuration, tool descriptors, session state, and the
//! request/result shapes exchanged with the Dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

// ─── Server Configuration ────────────────────────────────────────────────────

/// How a session reaches its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking line-delimited JSON over stdin/stdout.
    Stdio,
    /// Plain TCP socket, line-delimited JSON.
    Tcp,
    /// Streamable HTTP: one POST per frame, JSON or SSE response bodies.
    Http,
}

/// How a tool invocation is framed on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallConvention {
    /// MCP standard: `method = "tools/call"`, `params = {name, arguments}`.
    #[default]
    ToolsCall,
    /// `method = <tool name>`, `params = <arguments>`.
    Direct,
}

/// Credentials presented to a server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// Sent as `Authorization: Bearer …` on HTTP transports.
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Extra environment injected into stdio server processes.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One tool-server descriptor from the ordered server list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_id: String,
    pub transport: TransportKind,
    /// Command (stdio), `host:port` (tcp), or URL (http).
    pub address: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for stdio server processes.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub call_convention: CallConvention,
    /// Per-server call timeout override (slow servers, e.g. chain RPC).
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
    /// Tools to treat as idempotent even if the server does not annotate them.
    #[serde(default)]
    pub idempotent_tools: Vec<String>,
}

impl ServerConfig {
    /// Minimal config for a server; remaining fields take their defaults.
    pub fn new(server_id: &str, transport: TransportKind, address: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            transport,
            address: address.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            credentials: Credentials::default(),
            call_convention: CallConvention::default(),
            call_timeout_ms: None,
            idempotent_tools: Vec::new(),
        }
    }

    /// A server id must be non-empty and free of `.`, which separates
    /// server from tool in qualified names.
    pub fn validate_id(&self) -> Result<(), String> {
        let id = self.server_id.trim();
        if id.is_empty() {
            return Err("server with empty server_id".into());
        }
        if id.contains('.') {
            return Err(format!("server_id '{id}' must not contain '.'"));
        }
        Ok(())
    }
}

// ─── Tool Descriptors ────────────────────────────────────────────────────────

/// A tool as announced by a server during `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
    #[serde(default, alias = "outputSchema")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub annotations: ToolAnnotations,
}

/// Behavioural hints attached to a tool definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolAnnotations {
    #[serde(default, alias = "idempotentHint")]
    pub idempotent_hint: bool,
    #[serde(default, alias = "readOnlyHint")]
    pub read_only_hint: bool,
}

/// A registered tool. Immutable once registered; replaced wholesale when the
/// owning server re-handshakes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub server_id: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub output_schema: Option<serde_json::Value>,
    /// Safe to execute more than once with the same arguments.
    pub idempotent: bool,
    /// Per-server call timeout, if configured.
    #[serde(skip)]
    pub call_timeout: Option<Duration>,
}

impl ToolDescriptor {
    /// Build a descriptor from a wire definition and its server's config.
    pub fn from_definition(def: McpToolDefinition, config: &ServerConfig) -> Self {
        let idempotent = def.annotations.idempotent_hint
            || def.annotations.read_only_hint
            || config.idempotent_tools.iter().any(|t| t == &def.name);
        Self {
            server_id: config.server_id.clone(),
            idempotent,
            call_timeout: config.call_timeout_ms.map(Duration::from_millis),
            name: def.name,
            description: def.description,
            input_schema: def.input_schema,
            output_schema: def.output_schema,
        }
    }

    /// `server.tool` form used in the LLM catalog.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.server_id, self.name)
    }
}

// ─── Session State ───────────────────────────────────────────────────────────

/// Lifecycle state of a server session.
///
/// Legal transitions: `Connecting → Ready`, `Ready ↔ Degraded`, any → `Closed`.
/// `Closed` is terminal; reconnecting creates a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Ready) | (Ready, Degraded) | (Degraded, Ready) | (Connecting, Closed)
                | (Ready, Closed)
                | (Degraded, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        }
    }
}

// ─── Tool Calls ──────────────────────────────────────────────────────────────

/// Caller-generated request identifier, unique for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(format!("req_{}", Uuid::new_v4()))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved tool invocation ready for dispatch.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub request_id: RequestId,
    pub tool_name: String,
    pub server_id: String,
    pub arguments: serde_json::Value,
    pub deadline: Instant,
}

impl ToolCallRequest {
    /// New request with a generated id and a deadline `timeout` from now.
    pub fn new(
        server_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Self {
        Self {
            request_id: RequestId::generate(),
            tool_name: tool_name.to_string(),
            server_id: server_id.to_string(),
            arguments,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.server_id, self.tool_name)
    }
}

/// Why a call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Session missing, closed, or degraded.
    SessionUnavailable,
    /// Tool not registered for the server.
    UnknownTool,
    /// Arguments did not validate against the input schema.
    SchemaMismatch,
    /// The request id is already in flight.
    DuplicateRequest,
    /// Transport-level failure (write failed, connection lost).
    Transport,
    /// Malformed response frame.
    Protocol,
    /// The tool or server reported an application-level error.
    Tool,
}

/// Terminal outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Success { payload: serde_json::Value },
    Failure { kind: FailureKind, detail: String },
    Timeout,
    Cancelled,
}

impl CallOutcome {
    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        CallOutcome::Failure {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success { .. })
    }
}

/// Result of a tool call execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub request_id: RequestId,
    pub server_id: String,
    pub tool_name: String,
    pub outcome: CallOutcome,
    /// Wire attempts made (retries included).
    pub attempts: u32,
    pub execution_time_ms: u64,
}

/// A server-initiated notification (no request id).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerNotification {
    pub server_id: String,
    pub method: String,
    pub params: Option<serde_json::Value>,
}

// ─── MCP Handshake Payloads ──────────────────────────────────────────────────

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    /// Some servers inline their tools here instead of answering `tools/list`.
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// One page of a `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
