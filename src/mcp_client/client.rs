//! MCP Client: high-level interface for tool execution.
//!
//! Wires the session manager, tool registry, notification hub, and
//! dispatcher together. This is the handle the agent layer holds.

use std::sync::Arc;

use serde_json::Value;

use super::dispatcher::{DispatchStats, Dispatcher, NotificationHub};
use super::errors::McpError;
use super::lifecycle::{ServerStatus, SessionManager};
use super::registry::{RegistrySnapshot, ToolRegistry, ToolResolution};
use super::transport::{Connector, NetworkConnector};
use super::types::{ServerConfig, ToolCallResult};
use crate::config::{CoreConfig, DispatchSettings, SessionSettings};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client that manages multiple servers and routes tool calls.
pub struct McpClient {
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ToolRegistry>,
    /// Configured servers, in start order.
    configs: Vec<ServerConfig>,
}

impl McpClient {
    /// Create a client for the configured servers over the real transports.
    /// Nothing connects until `start_all`.
    pub fn new(config: &CoreConfig) -> Self {
        Self::with_connector(
            Arc::new(NetworkConnector::default()),
            config.servers.clone(),
            config.session.clone(),
            config.dispatch.clone(),
        )
    }

    /// Create a client over a custom connector.
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        configs: Vec<ServerConfig>,
        session: SessionSettings,
        dispatch: DispatchSettings,
    ) -> Self {
        let registry = Arc::new(ToolRegistry::new());
        let hub = Arc::new(NotificationHub::new());
        let sessions = SessionManager::new(connector, Arc::clone(&registry), Arc::clone(&hub), session);
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&sessions), hub, dispatch));
        Self {
            sessions,
            dispatcher,
            registry,
            configs,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect all configured servers.
    ///
    /// Returns the servers that failed to start (partial startup is OK; they
    /// keep retrying in the background).
    pub async fn start_all(&self) -> Vec<(String, McpError)> {
        let errors = self.sessions.start_all(self.configs.clone()).await;
        tracing::info!(
            configured = self.configs.len(),
            failed = errors.len(),
            tools = self.registry.len(),
            "MCP servers started"
        );
        errors
    }

    /// Connect one configured server by id.
    pub async fn start_server(&self, server_id: &str) -> Result<(), McpError> {
        let config = self
            .configs
            .iter()
            .find(|c| c.server_id == server_id)
            .cloned()
            .ok_or(McpError::ConfigError {
                reason: format!("no configuration for server '{server_id}'"),
            })?;
        self.sessions.connect(config).await.map(|_| ())
    }

    /// Close one server's session.
    pub async fn shutdown_server(&self, server_id: &str) -> bool {
        self.sessions.close(server_id).await
    }

    /// Close every session.
    pub async fn shutdown_all(&self) {
        self.sessions.shutdown_all().await;
    }

    /// Retire and reconnect a server, with backoff between failed attempts.
    pub async fn restart_server(&self, server_id: &str) -> Result<(), McpError> {
        self.sessions.reconnect(server_id).await.map(|_| ())
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a tool call by name.
    ///
    /// Accepts `server.tool` or, when it is unique, a bare `tool`. Names that
    /// do not resolve are rejected with `UnknownTool`; nothing is guessed.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let descriptor = match self.registry.snapshot().resolve(name) {
            ToolResolution::Exact(d) | ToolResolution::Unprefixed { tool: d, .. } => d,
            _ => {
                return Err(McpError::UnknownTool {
                    name: name.to_string(),
                })
            }
        };
        let request = self
            .dispatcher
            .prepare(&descriptor.server_id, &descriptor.name, arguments);
        Ok(self.dispatcher.call(request).await)
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.registry.snapshot()
    }

    pub fn tool_count(&self) -> usize {
        self.registry.len()
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.sessions.status()
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Check if a server has a `Ready` session.
    pub fn is_server_ready(&self, server_id: &str) -> bool {
        self.sessions.ready_session(server_id).is_ok()
    }

    /// Get ids of servers with a `Ready` session.
    pub fn ready_servers(&self) -> Vec<String> {
        self.configs
            .iter()
            .filter(|c| self.is_server_ready(&c.server_id))
            .map(|c| c.server_id.clone())
            .collect()
    }

    /// Get ids of all configured servers (including those that failed to start).
    pub fn configured_servers(&self) -> Vec<String> {
        self.configs.iter().map(|c| c.server_id.clone()).collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
