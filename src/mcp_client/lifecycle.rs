//! Server Session Manager.
//!
//! Owns every `ServerSession`: connects and handshakes, publishes each
//! server's tool set to the registry, runs one heartbeat task per session,
//! and reconnects lost servers with exponential backoff. Sessions are only
//! ever handed out by reference; callers never see a transport.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::codec::{error_codes, PROTOCOL_VERSION};
use super::dispatcher::NotificationHub;
use super::errors::McpError;
use super::registry::ToolRegistry;
use super::session::{ServerSession, SessionEvent};
use super::transport::Connector;
use super::types::{
    InitializeResult, ListToolsResult, McpToolDefinition, ServerConfig, SessionState,
    ToolDescriptor,
};
use crate::config::SessionSettings;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on `tools/list` pages accepted in one listing.
const MAX_TOOL_PAGES: usize = 100;

const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

// ─── Status ──────────────────────────────────────────────────────────────────

/// Health snapshot for one configured server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server_id: String,
    /// `None` when no session exists (never connected, lost, or closed).
    pub state: Option<SessionState>,
    pub generation: Option<u64>,
    /// Successful reconnects.
    pub restart_count: u32,
    /// Failed connect attempts since the last success.
    pub consecutive_failures: u32,
    pub heartbeat_failures: u32,
    /// Reconnect attempts exhausted; no further automatic retries.
    pub marked_failed: bool,
    pub last_error: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub pending_calls: usize,
    pub tool_count: usize,
}

#[derive(Debug, Default)]
struct ServerRecord {
    restart_count: u32,
    consecutive_failures: u32,
    marked_failed: bool,
    last_error: Option<String>,
}

/// Result of one heartbeat probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Healthy,
    /// Failed, still below the degrade threshold.
    Failed(u32),
    /// At or past the degrade threshold.
    Degraded(u32),
    /// At or past the close threshold.
    Dead(u32),
}

// ─── SessionManager ──────────────────────────────────────────────────────────

/// Lifecycle owner for all server sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<ServerSession>>>,
    configs: RwLock<HashMap<String, ServerConfig>>,
    records: Mutex<HashMap<String, ServerRecord>>,
    reconnecting: Mutex<HashSet<String>>,
    heartbeats: Mutex<HashMap<String, JoinHandle<()>>>,
    registry: Arc<ToolRegistry>,
    hub: Arc<NotificationHub>,
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Create a manager and start its event supervisor. Must be called from
    /// within a Tokio runtime.
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<ToolRegistry>,
        hub: Arc<NotificationHub>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            records: Mutex::new(HashMap::new()),
            reconnecting: Mutex::new(HashSet::new()),
            heartbeats: Mutex::new(HashMap::new()),
            registry,
            hub,
            connector,
            settings,
            events_tx,
            next_generation: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        });

        let task = tokio::spawn(supervise(Arc::downgrade(&manager), events_rx));
        *lock(&manager.supervisor) = Some(task);
        manager
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    // ─── Connect ─────────────────────────────────────────────────────────

    /// Connect one server: transport, handshake, registry publish, then
    /// `Ready`. Does not retry; see `start_all` and `reconnect`.
    pub async fn connect(self: &Arc<Self>, config: ServerConfig) -> Result<Arc<ServerSession>, McpError> {
        config
            .validate_id()
            .map_err(|reason| McpError::ConfigError { reason })?;
        let server_id = config.server_id.clone();
        write(&self.configs).insert(server_id.clone(), config.clone());

        match self.establish(&config).await {
            Ok(session) => {
                let mut records = lock(&self.records);
                let record = records.entry(server_id).or_default();
                record.consecutive_failures = 0;
                record.marked_failed = false;
                record.last_error = None;
                Ok(session)
            }
            Err(e) => {
                let mut records = lock(&self.records);
                let record = records.entry(server_id).or_default();
                record.consecutive_failures += 1;
                record.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>, config: &ServerConfig) -> Result<Arc<ServerSession>, McpError> {
        let server_id = config.server_id.as_str();
        let timeout = self.settings.handshake_timeout();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        tracing::info!(server = %server_id, generation, transport = ?config.transport, "connecting");

        let attempt = async {
            let transport = self.connector.connect(config).await?;
            let session = ServerSession::start(config, generation, transport, self.events_tx.clone());
            match handshake(&session, config, timeout).await {
                Ok(tools) => Ok((session, tools)),
                Err(e) => {
                    session.shutdown(self.settings.shutdown_timeout()).await;
                    Err(e)
                }
            }
        };

        let (session, tools) = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                tracing::warn!(server = %server_id, generation, error = %e, "connect failed");
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(server = %server_id, generation, "handshake timed out");
                return Err(McpError::HandshakeFailed {
                    server: server_id.to_string(),
                    reason: format!("timed out after {}ms", timeout.as_millis()),
                });
            }
        };

        if let Err(e) = self.registry.replace_server(server_id, generation, tools) {
            session.shutdown(self.settings.shutdown_timeout()).await;
            return Err(McpError::HandshakeFailed {
                server: server_id.to_string(),
                reason: e.to_string(),
            });
        }

        if !session.transition(SessionState::Ready) {
            self.registry.remove_server(server_id, Some(generation));
            return Err(McpError::HandshakeFailed {
                server: server_id.to_string(),
                reason: "session closed during handshake".into(),
            });
        }

        let previous = write(&self.sessions).insert(server_id.to_string(), Arc::clone(&session));
        if let Some(previous) = previous {
            let grace = self.settings.drain_grace();
            let timeout = self.settings.shutdown_timeout();
            tokio::spawn(async move { drain_and_close(&previous, grace, timeout).await });
        }
        self.spawn_heartbeat(Arc::clone(&session));

        tracing::info!(
            server = %server_id,
            generation,
            tool_count = self.registry.snapshot().tools_for_server(server_id),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "server ready"
        );
        Ok(session)
    }

    /// Connect all servers concurrently. Failures are returned in input
    /// order and retried in the background per the reconnect policy.
    pub async fn start_all(self: &Arc<Self>, configs: Vec<ServerConfig>) -> Vec<(String, McpError)> {
        let attempts = configs.into_iter().map(|config| {
            let id = config.server_id.clone();
            async move { (id, self.connect(config).await) }
        });

        let mut errors = Vec::new();
        for (id, result) in join_all(attempts).await {
            if let Err(e) = result {
                tracing::error!(server = %id, error = %e, "server failed to start");
                if !matches!(e, McpError::ConfigError { .. }) {
                    self.schedule_reconnect(&id);
                }
                errors.push((id, e));
            }
        }
        errors
    }

    // ─── Lookup ──────────────────────────────────────────────────────────

    /// The current session for a server, in any state.
    pub fn session(&self, server_id: &str) -> Option<Arc<ServerSession>> {
        read(&self.sessions).get(server_id).cloned()
    }

    /// The session for a server if it is `Ready`; otherwise fail fast.
    pub fn ready_session(&self, server_id: &str) -> Result<Arc<ServerSession>, McpError> {
        match self.session(server_id) {
            Some(session) if session.state() == SessionState::Ready => Ok(session),
            Some(session) => Err(McpError::SessionUnavailable {
                server: server_id.to_string(),
                state: Some(session.state()),
            }),
            None => Err(McpError::SessionUnavailable {
                server: server_id.to_string(),
                state: None,
            }),
        }
    }

    /// Status for every known server, ordered by server id.
    pub fn status(&self) -> Vec<ServerStatus> {
        let mut ids: Vec<String> = read(&self.configs).keys().cloned().collect();
        ids.sort();
        let snapshot = self.registry.snapshot();
        let records = lock(&self.records);

        ids.into_iter()
            .map(|id| {
                let session = self.session(&id);
                let record = records.get(&id);
                ServerStatus {
                    state: session.as_ref().map(|s| s.state()),
                    generation: session.as_ref().map(|s| s.generation()),
                    restart_count: record.map_or(0, |r| r.restart_count),
                    consecutive_failures: record.map_or(0, |r| r.consecutive_failures),
                    heartbeat_failures: session.as_ref().map_or(0, |s| s.heartbeat_failures()),
                    marked_failed: record.is_some_and(|r| r.marked_failed),
                    last_error: record.and_then(|r| r.last_error.clone()),
                    last_heartbeat: session.as_ref().and_then(|s| s.last_heartbeat()),
                    pending_calls: session.as_ref().map_or(0, |s| s.pending_call_count()),
                    tool_count: snapshot.tools_for_server(&id),
                    server_id: id,
                }
            })
            .collect()
    }

    /// Clear failure counters so a failed server can be retried.
    pub fn reset_failures(&self, server_id: &str) -> bool {
        match lock(&self.records).get_mut(server_id) {
            Some(record) => {
                record.consecutive_failures = 0;
                record.marked_failed = false;
                record.last_error = None;
                true
            }
            None => false,
        }
    }

    // ─── Heartbeat ───────────────────────────────────────────────────────

    /// Probe a session once and apply the health thresholds.
    ///
    /// Any response, including a JSON-RPC error, counts as alive.
    pub async fn heartbeat(&self, session: &ServerSession) -> HeartbeatOutcome {
        let result = session
            .call("ping", None, self.settings.heartbeat_timeout())
            .await;

        let alive = match &result {
            Ok(_) | Err(McpError::ServerError { .. }) => true,
            Err(_) => false,
        };

        if alive {
            session.record_heartbeat_success();
            if session.state() == SessionState::Degraded && session.transition(SessionState::Ready) {
                tracing::info!(server = %session.server_id(), "session recovered");
            }
            return HeartbeatOutcome::Healthy;
        }

        let failures = session.record_heartbeat_failure();
        let error = result.err().map(|e| e.to_string()).unwrap_or_default();
        tracing::warn!(server = %session.server_id(), failures, %error, "heartbeat failed");

        if failures >= self.settings.close_threshold {
            HeartbeatOutcome::Dead(failures)
        } else if failures >= self.settings.degrade_threshold {
            if session.state() == SessionState::Ready {
                session.transition(SessionState::Degraded);
            }
            HeartbeatOutcome::Degraded(failures)
        } else {
            HeartbeatOutcome::Failed(failures)
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>, session: Arc<ServerSession>) {
        let manager = Arc::downgrade(self);
        let interval = self.settings.heartbeat_interval();
        let server_id = session.server_id().to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if session.state() == SessionState::Closed {
                    return;
                }
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if let HeartbeatOutcome::Dead(failures) = manager.heartbeat(&session).await {
                    tracing::error!(
                        server = %session.server_id(),
                        failures,
                        "heartbeat failures reached close threshold"
                    );
                    manager
                        .retire(&session, &format!("{failures} consecutive heartbeat failures"))
                        .await;
                    manager.schedule_reconnect(session.server_id());
                    return;
                }
            }
        });

        if let Some(old) = lock(&self.heartbeats).insert(server_id, task) {
            old.abort();
        }
    }

    // ─── Close ───────────────────────────────────────────────────────────

    /// Close a server's session: no new dispatch, in-flight calls get the
    /// drain grace period, tools leave the registry. No reconnect follows.
    pub async fn close(&self, server_id: &str) -> bool {
        let Some(session) = self.session(server_id) else {
            return false;
        };
        self.retire(&session, "closed by request").await;
        true
    }

    /// Remove a session from service if it is still the current one for its
    /// server, then drain and close it.
    async fn retire(&self, session: &Arc<ServerSession>, reason: &str) {
        let server_id = session.server_id();
        let generation = session.generation();

        let removed = {
            let mut sessions = write(&self.sessions);
            match sessions.get(server_id) {
                Some(current) if current.generation() == generation => {
                    sessions.remove(server_id);
                    true
                }
                _ => false,
            }
        };
        self.registry.remove_server(server_id, Some(generation));

        if removed {
            tracing::info!(server = %server_id, generation, %reason, "retiring session");
            lock(&self.records)
                .entry(server_id.to_string())
                .or_default()
                .last_error = Some(reason.to_string());
        }

        drain_and_close(
            session,
            self.settings.drain_grace(),
            self.settings.shutdown_timeout(),
        )
        .await;
    }

    /// Close every session. Reconnects stop.
    pub async fn shutdown_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        for (_, task) in lock(&self.heartbeats).drain() {
            task.abort();
        }

        let sessions: Vec<Arc<ServerSession>> = write(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in &sessions {
            self.registry
                .remove_server(session.server_id(), Some(session.generation()));
        }

        let grace = self.settings.drain_grace();
        let timeout = self.settings.shutdown_timeout();
        join_all(sessions.iter().map(|s| drain_and_close(s, grace, timeout))).await;

        tracing::info!(count = sessions.len(), "all sessions closed");
    }

    // ─── Reconnect ───────────────────────────────────────────────────────

    /// Start a background reconnect loop unless one is already running.
    fn schedule_reconnect(self: &Arc<Self>, server_id: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if !lock(&self.reconnecting).insert(server_id.to_string()) {
            return;
        }
        let manager = Arc::clone(self);
        let server_id = server_id.to_string();
        tokio::spawn(async move {
            let _ = manager.run_reconnect(&server_id, true).await;
            lock(&manager.reconnecting).remove(&server_id);
        });
    }

    /// Retire any current session and reconnect now, with backoff between
    /// failed attempts.
    pub async fn reconnect(self: &Arc<Self>, server_id: &str) -> Result<Arc<ServerSession>, McpError> {
        if let Some(session) = self.session(server_id) {
            self.retire(&session, "reconnect requested").await;
        }
        self.reset_failures(server_id);
        self.run_reconnect(server_id, false).await
    }

    async fn run_reconnect(
        self: &Arc<Self>,
        server_id: &str,
        delay_first: bool,
    ) -> Result<Arc<ServerSession>, McpError> {
        let policy = self.settings.reconnect.clone();

        for attempt in 0..policy.max_attempts {
            if attempt > 0 || delay_first {
                let delay = policy.delay(attempt);
                tracing::info!(
                    server = %server_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                tokio::time::sleep(delay).await;
            }

            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(McpError::SessionUnavailable {
                    server: server_id.to_string(),
                    state: None,
                });
            }
            let config = read(&self.configs).get(server_id).cloned();
            let Some(config) = config else {
                return Err(McpError::ConfigError {
                    reason: format!("no config for server '{server_id}'"),
                });
            };

            match self.establish(&config).await {
                Ok(session) => {
                    let mut records = lock(&self.records);
                    let record = records.entry(server_id.to_string()).or_default();
                    record.restart_count += 1;
                    record.consecutive_failures = 0;
                    record.marked_failed = false;
                    record.last_error = None;
                    tracing::info!(server = %server_id, attempt = attempt + 1, "reconnected");
                    return Ok(session);
                }
                Err(e) => {
                    let mut records = lock(&self.records);
                    let record = records.entry(server_id.to_string()).or_default();
                    record.consecutive_failures += 1;
                    record.last_error = Some(e.to_string());
                    tracing::warn!(server = %server_id, attempt = attempt + 1, error = %e, "reconnect failed");
                }
            }
        }

        lock(&self.records)
            .entry(server_id.to_string())
            .or_default()
            .marked_failed = true;
        tracing::error!(
            server = %server_id,
            attempts = policy.max_attempts,
            "reconnect attempts exhausted, server marked failed"
        );
        Err(McpError::RestartExhausted {
            name: server_id.to_string(),
            attempts: policy.max_attempts,
        })
    }

    // ─── Events ──────────────────────────────────────────────────────────

    /// Re-list a server's tools and replace its registry entry atomically.
    /// On failure the previous tool set stays published.
    pub async fn refresh_tools(&self, server_id: &str) -> Result<usize, McpError> {
        let session = self.session(server_id).ok_or(McpError::SessionUnavailable {
            server: server_id.to_string(),
            state: None,
        })?;
        let config = read(&self.configs).get(server_id).cloned().ok_or(McpError::ConfigError {
            reason: format!("no config for server '{server_id}'"),
        })?;

        let defs = list_tools(&session, self.settings.handshake_timeout()).await?;
        let tools = to_descriptors(defs, &config);
        self.registry
            .replace_server(server_id, session.generation(), tools)
    }

    async fn on_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Notification(notification) => {
                if notification.method == TOOLS_LIST_CHANGED {
                    let manager = Arc::clone(self);
                    let server_id = notification.server_id.clone();
                    tokio::spawn(async move {
                        match manager.refresh_tools(&server_id).await {
                            Ok(count) => {
                                tracing::info!(server = %server_id, tool_count = count, "tool list refreshed");
                            }
                            Err(e) => {
                                tracing::warn!(server = %server_id, error = %e, "tool list refresh failed");
                            }
                        }
                    });
                }
                self.hub.publish(&notification);
            }
            SessionEvent::Lost {
                server_id,
                generation,
                reason,
            } => {
                let current = self
                    .session(&server_id)
                    .filter(|s| s.generation() == generation);
                if let Some(session) = current {
                    self.retire(&session, &reason).await;
                    self.schedule_reconnect(&server_id);
                }
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        for (_, task) in self
            .heartbeats
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
        {
            task.abort();
        }
    }
}

async fn supervise(manager: Weak<SessionManager>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.on_event(event).await;
    }
}

/// Stop new dispatch, give in-flight calls `grace` to finish, then close.
async fn drain_and_close(session: &ServerSession, grace: Duration, timeout: Duration) {
    session.transition(SessionState::Closed);
    if !session.wait_idle(grace).await {
        tracing::warn!(
            server = %session.server_id(),
            pending = session.pending_call_count(),
            "closing with calls still in flight"
        );
    }
    session.shutdown(timeout).await;
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// MCP initialization: `initialize`, `notifications/initialized`, tool list.
async fn handshake(
    session: &ServerSession,
    config: &ServerConfig,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let server_id = session.server_id();
    let fail = |reason: String| McpError::HandshakeFailed {
        server: server_id.to_string(),
        reason,
    };

    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {"name": "mcp-dispatch", "version": env!("CARGO_PKG_VERSION")},
    });
    let raw = session
        .call("initialize", Some(params), timeout)
        .await
        .map_err(|e| fail(format!("initialize failed: {e}")))?;
    let init: InitializeResult = serde_json::from_value(raw)
        .map_err(|e| fail(format!("failed to parse initialize response: {e}")))?;

    if let Some(version) = init.protocol_version.as_deref() {
        if version != PROTOCOL_VERSION {
            tracing::debug!(server = %server_id, %version, "server negotiated a different protocol version");
        }
    }
    if let Some(info) = &init.server_info {
        tracing::debug!(
            server = %server_id,
            name = info.name.as_deref().unwrap_or("unknown"),
            version = info.version.as_deref().unwrap_or("unknown"),
            "server info"
        );
    }

    session.notify("notifications/initialized", None)?;

    let defs = if init.tools.is_empty() {
        match list_tools(session, timeout).await {
            Ok(defs) => defs,
            Err(McpError::ServerError { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
                Vec::new()
            }
            Err(e) => return Err(fail(format!("tools/list failed: {e}"))),
        }
    } else {
        init.tools
    };

    Ok(to_descriptors(defs, config))
}

/// Follow `tools/list` pagination to the end.
async fn list_tools(session: &ServerSession, timeout: Duration) -> Result<Vec<McpToolDefinition>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.as_ref().map(|c| json!({"cursor": c}));
        let raw = session.call("tools/list", params, timeout).await?;
        let page: ListToolsResult = serde_json::from_value(raw).map_err(|e| McpError::Protocol {
            server: session.server_id().to_string(),
            reason: format!("failed to parse tools/list response: {e}"),
        })?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
            Some(_) => {
                return Err(McpError::Protocol {
                    server: session.server_id().to_string(),
                    reason: "tools/list returned the same cursor twice".into(),
                })
            }
            None => return Ok(tools),
        }
    }

    Err(McpError::Protocol {
        server: session.server_id().to_string(),
        reason: format!("tools/list exceeded {MAX_TOOL_PAGES} pages"),
    })
}

fn to_descriptors(defs: Vec<McpToolDefinition>, config: &ServerConfig) -> Vec<ToolDescriptor> {
    defs.into_iter()
        .map(|def| ToolDescriptor::from_definition(def, config))
        .collect()
}

// ─── Lock Helpers ────────────────────────────────────────────────────────────

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffPolicy;
    use crate::mcp_client::test_support::{text_result, tool_def, FakeConnector, FakeServer, ToolBehavior};
    use crate::mcp_client::types::TransportKind;

    fn fast_settings() -> SessionSettings {
        SessionSettings {
            handshake_timeout_ms: 1_000,
            heartbeat_interval_ms: 60_000,
            heartbeat_timeout_ms: 50,
            degrade_threshold: 2,
            close_threshold: 4,
            drain_grace_ms: 50,
            shutdown_timeout_ms: 200,
            reconnect: BackoffPolicy {
                base_delay_ms: 1,
                factor: 1.0,
                max_delay_ms: 1,
                jitter: 0.0,
                max_attempts: 3,
            },
        }
    }

    fn crypto_server() -> FakeServer {
        FakeServer::new()
            .with_tool(
                "get_price",
                json!({"type": "object", "properties": {"symbol": {"type": "string"}}}),
                true,
                ToolBehavior::Reply(text_result("3120.55")),
            )
            .with_tool("send_tx", json!({"type": "object"}), false, ToolBehavior::Hang)
    }

    fn manager_with(connector: FakeConnector, settings: SessionSettings) -> Arc<SessionManager> {
        SessionManager::new(
            Arc::new(connector),
            Arc::new(ToolRegistry::new()),
            Arc::new(NotificationHub::new()),
            settings,
        )
    }

    fn config(id: &str) -> ServerConfig {
        ServerConfig::new(id, TransportKind::Stdio, "fake")
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_connect_publishes_tools_then_ready() {
        let manager = manager_with(
            FakeConnector::new().with_server("crypto", crypto_server()),
            fast_settings(),
        );
        let session = manager.connect(config("crypto")).await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        let snap = manager.registry().snapshot();
        assert_eq!(snap.tools_for_server("crypto"), 2);
        assert!(snap.get("crypto", "get_price").unwrap().idempotent);
        assert!(!snap.get("crypto", "send_tx").unwrap().idempotent);
        assert!(manager.ready_session("crypto").is_ok());
    }

    #[tokio::test]
    async fn test_paginated_and_inline_tool_listing() {
        let paged = crypto_server()
            .with_tool("get_block", json!({}), true, ToolBehavior::Hang)
            .with_page_size(1);
        let inline = crypto_server().with_inline_tools();
        let manager = manager_with(
            FakeConnector::new()
                .with_server("paged", paged)
                .with_server("inline", inline),
            fast_settings(),
        );

        manager.connect(config("paged")).await.unwrap();
        manager.connect(config("inline")).await.unwrap();
        let snap = manager.registry().snapshot();
        assert_eq!(snap.tools_for_server("paged"), 3);
        assert_eq!(snap.tools_for_server("inline"), 2);
    }

    #[tokio::test]
    async fn test_failed_handshake_publishes_nothing() {
        let server = crypto_server();
        server.set_fail_initialize(true);
        let manager = manager_with(
            FakeConnector::new().with_server("crypto", server),
            fast_settings(),
        );

        let err = manager.connect(config("crypto")).await.unwrap_err();
        assert!(err.is_connect_error());
        assert!(manager.registry().is_empty());
        assert!(manager.session("crypto").is_none());

        let status = manager.status();
        assert_eq!(status[0].consecutive_failures, 1);
        assert!(status[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_tool_names_fail_handshake_atomically() {
        let server = FakeServer::new();
        server.set_tools(vec![
            tool_def("dup", json!({}), false),
            tool_def("dup", json!({}), false),
        ]);
        let manager = manager_with(
            FakeConnector::new().with_server("bad", server),
            fast_settings(),
        );
        let err = manager.connect(config("bad")).await.unwrap_err();
        assert!(matches!(err, McpError::HandshakeFailed { .. }));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_server_is_unavailable() {
        let manager = manager_with(FakeConnector::new(), fast_settings());
        let err = manager.ready_session("nope").unwrap_err();
        assert!(matches!(err, McpError::SessionUnavailable { state: None, .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_degrades_and_recovers() {
        let server = crypto_server();
        let manager = manager_with(
            FakeConnector::new().with_server("crypto", server.clone()),
            fast_settings(),
        );
        let session = manager.connect(config("crypto")).await.unwrap();

        assert_eq!(manager.heartbeat(&session).await, HeartbeatOutcome::Healthy);
        assert!(session.last_heartbeat().is_some());

        server.set_healthy(false);
        assert_eq!(manager.heartbeat(&session).await, HeartbeatOutcome::Failed(1));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(manager.heartbeat(&session).await, HeartbeatOutcome::Degraded(2));
        assert_eq!(session.state(), SessionState::Degraded);

        let err = manager.ready_session("crypto").unwrap_err();
        assert!(matches!(
            err,
            McpError::SessionUnavailable { state: Some(SessionState::Degraded), .. }
        ));

        server.set_healthy(true);
        assert_eq!(manager.heartbeat(&session).await, HeartbeatOutcome::Healthy);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.heartbeat_failures(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_close_threshold() {
        let server = crypto_server();
        server.set_healthy(false);
        let manager = manager_with(
            FakeConnector::new().with_server("crypto", server),
            fast_settings(),
        );
        let session = manager.connect(config("crypto")).await.unwrap();
        let mut last = HeartbeatOutcome::Healthy;
        for _ in 0..4 {
            last = manager.heartbeat(&session).await;
        }
        assert_eq!(last, HeartbeatOutcome::Dead(4));
    }

    #[tokio::test]
    async fn test_periodic_heartbeats_retire_dead_session_and_reconnect() {
        let server = crypto_server();
        let connector = Arc::new(FakeConnector::new().with_server("crypto", server.clone()));
        let mut settings = fast_settings();
        settings.heartbeat_interval_ms = 20;
        let manager = SessionManager::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(ToolRegistry::new()),
            Arc::new(NotificationHub::new()),
            settings,
        );
        let first = manager.connect(config("crypto")).await.unwrap();

        server.set_healthy(false);
        assert!(wait_for(|| first.state() == SessionState::Closed).await);
        server.set_healthy(true);

        assert!(
            wait_for(|| manager
                .session("crypto")
                .is_some_and(|s| s.state() == SessionState::Ready && s.generation() > first.generation()))
            .await
        );
        assert!(connector.connect_count("crypto") >= 2);
        assert_eq!(manager.status()[0].restart_count, 1);
    }

    #[tokio::test]
    async fn test_lost_session_removes_tools_and_reconnects() {
        let server = crypto_server();
        let manager = manager_with(
            FakeConnector::new().with_server("crypto", server.clone()),
            fast_settings(),
        );
        let first = manager.connect(config("crypto")).await.unwrap();

        server.set_behavior("send_tx", ToolBehavior::DropConnection);
        let _ = first.request("tools/call", Some(json!({"name": "send_tx"})));

        assert!(wait_for(|| first.state() == SessionState::Closed).await);
        assert!(
            wait_for(|| manager
                .session("crypto")
                .is_some_and(|s| s.generation() > first.generation()))
            .await
        );
        let snap = manager.registry().snapshot();
        assert_eq!(snap.tools_for_server("crypto"), 2);
        assert!(snap.generation("crypto").unwrap() > first.generation());
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_marks_failed() {
        let connector = FakeConnector::new();
        connector.refuse("crypto", u32::MAX);
        let connector = connector.with_server("crypto", crypto_server());
        let manager = manager_with(connector, fast_settings());

        let errors = manager.start_all(vec![config("crypto")]).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].1.is_connect_error());

        assert!(wait_for(|| manager.status()[0].marked_failed).await);
        let status = &manager.status()[0];
        assert_eq!(status.consecutive_failures, 4);
        assert!(status.state.is_none());
        assert!(manager.registry().is_empty());

        assert!(manager.reset_failures("crypto"));
        assert!(!manager.status()[0].marked_failed);
    }

    #[tokio::test]
    async fn test_forced_reconnect_after_refusals() {
        let connector = Arc::new(FakeConnector::new().with_server("crypto", crypto_server()));
        let manager = SessionManager::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(ToolRegistry::new()),
            Arc::new(NotificationHub::new()),
            fast_settings(),
        );
        let first = manager.connect(config("crypto")).await.unwrap();

        connector.refuse("crypto", 2);
        let second = manager.reconnect("crypto").await.unwrap();
        assert!(second.generation() > first.generation());
        assert_eq!(first.state(), SessionState::Closed);
        assert_eq!(connector.connect_count("crypto"), 4);
    }

    #[tokio::test]
    async fn test_start_all_is_partial() {
        let manager = manager_with(
            FakeConnector::new().with_server("crypto", crypto_server()),
            fast_settings(),
        );
        let errors = manager
            .start_all(vec![config("crypto"), config("missing")])
            .await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "missing");
        assert!(manager.ready_session("crypto").is_ok());
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_list_changed_replaces_tool_set() {
        let server = crypto_server();
        let manager = manager_with(
            FakeConnector::new().with_server("crypto", server.clone()),
            fast_settings(),
        );
        manager.connect(config("crypto")).await.unwrap();

        server.set_tools(vec![tool_def("get_gas", json!({}), true)]);
        server.notify_all(TOOLS_LIST_CHANGED, None);

        assert!(wait_for(|| manager.registry().get("crypto", "get_gas").is_some()).await);
        let snap = manager.registry().snapshot();
        assert_eq!(snap.tools_for_server("crypto"), 1);
        assert!(snap.get("crypto", "get_price").is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_dotted_server_id() {
        let connector = Arc::new(FakeConnector::new().with_server("a.b", crypto_server()));
        let manager = SessionManager::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(ToolRegistry::new()),
            Arc::new(NotificationHub::new()),
            fast_settings(),
        );

        let err = manager.connect(config("a.b")).await.unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }), "{err}");
        assert!(err.to_string().contains("must not contain '.'"));
        assert_eq!(connector.connect_count("a.b"), 0);
        assert!(manager.session("a.b").is_none());
        assert!(manager.registry().is_empty());

        let failures = manager.start_all(vec![config("a.b")]).await;
        assert_eq!(failures.len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.connect_count("a.b"), 0);
    }

    #[tokio::test]
    async fn test_failed_relist_keeps_previous_tools() {
        let server = crypto_server();
        let manager = manager_with(
            FakeConnector::new().with_server("crypto", server.clone()),
            fast_settings(),
        );
        manager.connect(config("crypto")).await.unwrap();
        let before = manager.registry().snapshot();
        let tool_count = before.tools_for_server("crypto");
        let generation = before.generation("crypto");

        server.set_fail_list_tools(true);
        server.set_tools(vec![tool_def("get_gas", json!({}), true)]);
        server.notify_all(TOOLS_LIST_CHANGED, None);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = manager.refresh_tools("crypto").await.unwrap_err();
        assert!(err.to_string().contains("listing unavailable"), "{err}");

        let after = manager.registry().snapshot();
        assert!(after.get("crypto", "get_price").is_some());
        assert!(after.get("crypto", "get_gas").is_none());
        assert_eq!(after.tools_for_server("crypto"), tool_count);
        assert_eq!(after.generation("crypto"), generation);
        assert_eq!(
            manager.session("crypto").unwrap().state(),
            SessionState::Ready
        );
    }

    #[tokio::test]
    async fn test_close_and_shutdown() {
        let manager = manager_with(
            FakeConnector::new()
                .with_server("a", crypto_server())
                .with_server("b", crypto_server()),
            fast_settings(),
        );
        let a = manager.connect(config("a")).await.unwrap();
        manager.connect(config("b")).await.unwrap();

        assert!(manager.close("a").await);
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(manager.registry().snapshot().tools_for_server("a"), 0);
        assert!(!manager.close("a").await);

        manager.shutdown_all().await;
        assert!(manager.registry().is_empty());
        assert!(manager.session("b").is_none());
    }
}
