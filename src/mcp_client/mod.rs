//! MCP Client: JSON-RPC sessions to external tool servers.
//!
//! This module handles:
//! - Line-framed JSON-RPC 2.0 over stdio, TCP, and streaming HTTP
//! - Session handshake, heartbeat, and reconnect with backoff
//! - Tool discovery into a snapshot-consistent registry
//! - Tool call routing with deadlines, cancellation, and idempotent retry
//!
//! The agent layer resolves utterances into calls and hands them to the
//! `Dispatcher` through `McpClient`.

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod schema;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use client::McpClient;
pub use dispatcher::{DispatchStats, Dispatcher, NotificationHub};
pub use errors::McpError;
pub use lifecycle::{ServerStatus, SessionManager};
pub use registry::{RegistrySnapshot, ToolRegistry, ToolResolution};
pub use types::{
    CallOutcome, FailureKind, RequestId, ServerConfig, SessionState, ToolCallRequest,
    ToolCallResult, ToolDescriptor, TransportKind,
};
