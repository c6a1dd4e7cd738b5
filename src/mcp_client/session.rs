//! One live server session.
//!
//! A `ServerSession` owns a spawned I/O task, and that task exclusively owns
//! the transport. Everything else talks to the session through its outbound
//! queue and the pending-response table:
//! - `request` registers a slot keyed by a fresh wire id and queues the frame
//! - the I/O task routes each response to its slot, answers server `ping`,
//!   and forwards notifications to the manager
//! - dropping a `PendingResponse` removes its slot, so a response that shows
//!   up after a timeout or cancel finds nothing and is discarded

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::codec::{self, error_codes, ErrorObject, Frame};
use super::errors::McpError;
use super::transport::Transport;
use super::types::{CallConvention, ServerConfig, ServerNotification, SessionState};

// ─── Events ──────────────────────────────────────────────────────────────────

/// Session-originated events consumed by the Server Session Manager.
#[derive(Debug)]
pub enum SessionEvent {
    /// A server-initiated notification.
    Notification(ServerNotification),
    /// The transport failed or the peer went away. Not emitted for an
    /// explicit shutdown.
    Lost {
        server_id: String,
        generation: u64,
        reason: String,
    },
}

enum Outbound {
    Frame(String),
    Close(oneshot::Sender<()>),
}

type Reply = Result<Value, ErrorObject>;

// ─── Shared State ────────────────────────────────────────────────────────────

struct PendingSlot {
    method: String,
    tx: oneshot::Sender<Reply>,
}

struct Shared {
    server_id: String,
    state: RwLock<SessionState>,
    pending: Mutex<HashMap<u64, PendingSlot>>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    heartbeat_failures: AtomicU32,
    idle: Notify,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state == next {
            return true;
        }
        if !state.can_transition_to(next) {
            tracing::warn!(
                server = %self.server_id,
                from = state.as_str(),
                to = next.as_str(),
                "rejected illegal state transition"
            );
            return false;
        }
        tracing::info!(
            server = %self.server_id,
            from = state.as_str(),
            to = next.as_str(),
            "session state changed"
        );
        *state = next;
        true
    }

    fn take_slot(&self, wire_id: u64) -> Option<PendingSlot> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let slot = pending.remove(&wire_id);
        if slot.is_some() && pending.is_empty() {
            self.idle.notify_waiters();
        }
        slot
    }

    /// Fail every in-flight request with a transport error.
    fn fail_all(&self, reason: &str) {
        let drained: Vec<(u64, PendingSlot)> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().collect()
        };
        if !drained.is_empty() {
            tracing::warn!(
                server = %self.server_id,
                count = drained.len(),
                %reason,
                "failing in-flight requests"
            );
        }
        for (_, slot) in drained {
            let _ = slot
                .tx
                .send(Err(ErrorObject::new(error_codes::TRANSPORT_ERROR, reason)));
        }
        self.idle.notify_waiters();
    }

    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ─── Pending Response ────────────────────────────────────────────────────────

/// Handle to one in-flight request. Resolves to the server's result or error
/// object; dropping it unregisters the request.
pub struct PendingResponse {
    wire_id: u64,
    rx: oneshot::Receiver<Reply>,
    shared: Arc<Shared>,
}

impl PendingResponse {
    pub fn wire_id(&self) -> u64 {
        self.wire_id
    }
}

impl Future for PendingResponse {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|reply| {
            reply.unwrap_or_else(|_| {
                Err(ErrorObject::new(
                    error_codes::TRANSPORT_ERROR,
                    "session closed before responding",
                ))
            })
        })
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.shared.take_slot(self.wire_id).is_some() {
            tracing::debug!(
                server = %self.shared.server_id,
                wire_id = self.wire_id,
                "abandoned pending request"
            );
        }
    }
}

// ─── ServerSession ───────────────────────────────────────────────────────────

/// A live connection to one tool server.
pub struct ServerSession {
    server_id: String,
    generation: u64,
    call_convention: CallConvention,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("server_id", &self.server_id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("pending", &self.pending_call_count())
            .finish()
    }
}

impl ServerSession {
    /// Start a session in `Connecting` over an established transport.
    pub fn start(
        config: &ServerConfig,
        generation: u64,
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            server_id: config.server_id.clone(),
            state: RwLock::new(SessionState::Connecting),
            pending: Mutex::new(HashMap::new()),
            last_heartbeat: Mutex::new(None),
            heartbeat_failures: AtomicU32::new(0),
            idle: Notify::new(),
        });
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_io(
            Arc::clone(&shared),
            generation,
            transport,
            outbound_rx,
            events,
        ));

        Arc::new(Self {
            server_id: config.server_id.clone(),
            generation,
            call_convention: config.call_convention,
            shared,
            outbound: outbound_tx,
            io_task: Mutex::new(Some(task)),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Handshake generation; increases with every new session for a server.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Apply a state transition. Illegal transitions are refused and logged.
    pub fn transition(&self, next: SessionState) -> bool {
        self.shared.transition(next)
    }

    pub fn pending_call_count(&self) -> usize {
        self.shared.pending_len()
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self
            .shared
            .last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn heartbeat_failures(&self) -> u32 {
        self.shared.heartbeat_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_heartbeat_success(&self) {
        *self
            .shared
            .last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.shared.heartbeat_failures.store(0, Ordering::Relaxed);
    }

    /// Returns the consecutive failure count including this one.
    pub(crate) fn record_heartbeat_failure(&self) -> u32 {
        self.shared.heartbeat_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Method and params for invoking `tool` under this server's convention.
    pub fn tool_call_frame(&self, tool: &str, arguments: Value) -> (String, Value) {
        match self.call_convention {
            CallConvention::ToolsCall => (
                "tools/call".to_string(),
                json!({"name": tool, "arguments": arguments}),
            ),
            CallConvention::Direct => (tool.to_string(), arguments),
        }
    }

    /// Queue a request and register its pending slot.
    pub fn request(&self, method: &str, params: Option<Value>) -> Result<PendingResponse, McpError> {
        if self.state() == SessionState::Closed {
            return Err(McpError::SessionUnavailable {
                server: self.server_id.clone(),
                state: Some(SessionState::Closed),
            });
        }

        let wire_id = codec::next_wire_id();
        let line = codec::encode(&Frame::request(wire_id, method, params))
            .map_err(|e| e.on_server(&self.server_id))?;

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                wire_id,
                PendingSlot {
                    method: method.to_string(),
                    tx,
                },
            );
        let pending = PendingResponse {
            wire_id,
            rx,
            shared: Arc::clone(&self.shared),
        };

        self.outbound
            .send(Outbound::Frame(line))
            .map_err(|_| McpError::Transport {
                server: self.server_id.clone(),
                reason: "session I/O task has stopped".into(),
            })?;

        tracing::trace!(server = %self.server_id, wire_id, %method, "queued request");
        Ok(pending)
    }

    /// Queue a notification (no response).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let line = codec::encode(&Frame::notification(method, params))
            .map_err(|e| e.on_server(&self.server_id))?;
        self.outbound
            .send(Outbound::Frame(line))
            .map_err(|_| McpError::Transport {
                server: self.server_id.clone(),
                reason: "session I/O task has stopped".into(),
            })
    }

    /// Request/response with a timeout, for handshake and heartbeat traffic.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let pending = self.request(method, params)?;
        match tokio::time::timeout(timeout, pending).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(self.rpc_error(err)),
            Err(_) => Err(McpError::Timeout {
                tool: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Map a JSON-RPC error object received on this session to `McpError`.
    pub fn rpc_error(&self, err: ErrorObject) -> McpError {
        match err.code {
            error_codes::TRANSPORT_ERROR => McpError::Transport {
                server: self.server_id.clone(),
                reason: err.message,
            },
            error_codes::PARSE_ERROR => McpError::Protocol {
                server: self.server_id.clone(),
                reason: err.message,
            },
            _ => McpError::ServerError {
                code: err.code,
                message: err.message,
                data: err.data,
            },
        }
    }

    /// Wait until no requests are in flight, up to `grace`. Returns whether
    /// the session drained.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending_call_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending_call_count() == 0;
            }
        }
    }

    /// Close the session: transition to `Closed`, stop the I/O task (which
    /// closes the transport), and fail anything still pending.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shared.transition(SessionState::Closed);

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.outbound.send(Outbound::Close(ack_tx)).is_ok()
            && tokio::time::timeout(timeout, ack_rx).await.is_err()
        {
            tracing::warn!(server = %self.server_id, "session close timed out");
        }

        let task = self
            .io_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.shared.fail_all("session closed");
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if let Some(task) = self
            .io_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

// ─── I/O Task ────────────────────────────────────────────────────────────────

async fn run_io(
    shared: Arc<Shared>,
    generation: u64,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let lost_reason = loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Frame(line)) => {
                    if let Err(e) = transport.send(&line).await {
                        break Some(e.to_string());
                    }
                }
                Some(Outbound::Close(ack)) => {
                    transport.close().await;
                    let _ = ack.send(());
                    break None;
                }
                None => {
                    transport.close().await;
                    break None;
                }
            },
            inbound = transport.receive() => match inbound {
                Ok(Some(line)) => {
                    if let Some(reply) = handle_inbound(&shared, &events, &line) {
                        if let Err(e) = transport.send(&reply).await {
                            break Some(e.to_string());
                        }
                    }
                }
                Ok(None) => break Some("connection closed by server".to_string()),
                Err(e) => break Some(e.to_string()),
            },
        }
    };

    let Some(reason) = lost_reason else {
        shared.fail_all("session closed");
        return;
    };

    if let Some(diag) = transport.diagnostics() {
        tracing::warn!(server = %shared.server_id, stderr = %diag, "server output before loss");
    }
    transport.close().await;

    tracing::error!(server = %shared.server_id, generation, %reason, "session lost");
    shared.transition(SessionState::Closed);
    shared.fail_all(&format!("connection lost: {reason}"));
    let _ = events.send(SessionEvent::Lost {
        server_id: shared.server_id.clone(),
        generation,
        reason,
    });
}

/// Route one inbound line. Returns a reply line for server-initiated
/// requests.
fn handle_inbound(
    shared: &Shared,
    events: &mpsc::UnboundedSender<SessionEvent>,
    line: &str,
) -> Option<String> {
    if line.trim().is_empty() {
        return None;
    }

    let frame = match codec::decode(line) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(server = %shared.server_id, error = %err, "dropping malformed frame");
            // Fail the owning request if the id is still recognizable.
            let salvaged = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_u64));
            if let Some(slot) = salvaged.and_then(|id| shared.take_slot(id)) {
                let _ = slot.tx.send(Err(ErrorObject::new(
                    error_codes::PARSE_ERROR,
                    format!("malformed response: {err}"),
                )));
            }
            return None;
        }
    };

    match frame {
        Frame::Response { id, outcome } => {
            let slot = id.as_u64().and_then(|wire_id| shared.take_slot(wire_id));
            match slot {
                Some(slot) => {
                    tracing::trace!(server = %shared.server_id, %id, method = %slot.method, "response routed");
                    let _ = slot.tx.send(outcome);
                }
                None => {
                    tracing::debug!(
                        server = %shared.server_id,
                        %id,
                        "discarding response for unknown or expired request"
                    );
                }
            }
            None
        }
        Frame::Request { id, method, .. } => {
            let reply = if method == "ping" {
                Frame::result(id, json!({}))
            } else {
                tracing::debug!(server = %shared.server_id, %method, "unsupported server request");
                Frame::error(
                    id,
                    ErrorObject::new(
                        error_codes::METHOD_NOT_FOUND,
                        format!("client does not handle '{method}'"),
                    ),
                )
            };
            codec::encode(&reply).ok()
        }
        Frame::Notification { method, params } => {
            let _ = events.send(SessionEvent::Notification(ServerNotification {
                server_id: shared.server_id.clone(),
                method,
                params,
            }));
            None
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
