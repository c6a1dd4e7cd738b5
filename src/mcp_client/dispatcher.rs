//! Dispatcher: routes resolved tool calls to their server sessions.
//!
//! Per call: reject duplicate in-flight request ids, fail fast unless the
//! session is `Ready`, validate arguments against the registered input
//! schema, then race the pending response against the deadline and any
//! cancel signal. Idempotent tools get one retry on transport failure.
//! Server notifications fan out to subscribers registered here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::codec::ErrorObject;
use super::errors::McpError;
use super::lifecycle::SessionManager;
use super::registry::ToolRegistry;
use super::schema;
use super::session::ServerSession;
use super::types::{
    CallOutcome, FailureKind, RequestId, ServerNotification, ToolCallRequest, ToolCallResult,
};
use crate::config::DispatchSettings;

// ─── Notifications ───────────────────────────────────────────────────────────

/// Subscriber for server-initiated notifications.
pub type NotificationHandler = Arc<dyn Fn(&ServerNotification) + Send + Sync>;

/// Fan-out point for server notifications.
#[derive(Default)]
pub struct NotificationHub {
    handlers: RwLock<Vec<NotificationHandler>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: NotificationHandler) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Deliver to every subscriber. Handlers run on the caller's task and
    /// must not block.
    pub fn publish(&self, notification: &ServerNotification) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if handlers.is_empty() {
            tracing::debug!(
                server = %notification.server_id,
                method = %notification.method,
                "notification with no subscribers"
            );
        }
        for handler in handlers {
            handler(notification);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ─── Statistics ──────────────────────────────────────────────────────────────

/// Cumulative dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub retried: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &CallOutcome) {
        let counter = match outcome {
            CallOutcome::Success { .. } => &self.succeeded,
            CallOutcome::Failure { .. } => &self.failed,
            CallOutcome::Timeout => &self.timed_out,
            CallOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

type CancelSender = oneshot::Sender<String>;

/// What one wire attempt produced.
enum Attempt {
    Reply(Result<Value, ErrorObject>),
    /// The request never left the client.
    Rejected(McpError),
    TimedOut,
    Cancelled(String),
}

pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    registry: Arc<ToolRegistry>,
    hub: Arc<NotificationHub>,
    settings: DispatchSettings,
    /// Request ids currently executing, with their cancel signal.
    in_flight: Mutex<HashMap<RequestId, Option<CancelSender>>>,
    counters: Counters,
}

/// Unregisters a request id when its call finishes or is dropped.
struct InFlightGuard<'a> {
    dispatcher: &'a Dispatcher,
    request_id: RequestId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.request_id);
    }
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionManager>,
        hub: Arc<NotificationHub>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry: Arc::clone(sessions.registry()),
            sessions,
            hub,
            settings,
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Register a notification subscriber.
    pub fn on_notification<F>(&self, handler: F)
    where
        F: Fn(&ServerNotification) + Send + Sync + 'static,
    {
        self.hub.subscribe(Arc::new(handler));
    }

    /// Call timeout for a tool: the server's configured timeout, else the
    /// dispatch default.
    pub fn timeout_for(&self, server_id: &str, tool_name: &str) -> Duration {
        self.registry
            .get(server_id, tool_name)
            .and_then(|t| t.call_timeout)
            .unwrap_or_else(|| self.settings.default_timeout())
    }

    /// Build a request with a fresh id and the tool's deadline.
    pub fn prepare(&self, server_id: &str, tool_name: &str, arguments: Value) -> ToolCallRequest {
        let timeout = self.timeout_for(server_id, tool_name);
        ToolCallRequest::new(server_id, tool_name, arguments, timeout)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
        }
    }

    /// Cancel an in-flight call. Returns false if the id is not executing
    /// or was already cancelled. Other calls on the same session are
    /// unaffected.
    pub fn cancel(&self, request_id: &RequestId, reason: &str) -> bool {
        let sender = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(request_id)
            .and_then(Option::take);
        match sender {
            Some(tx) => {
                tracing::info!(request_id = %request_id, %reason, "cancelling call");
                tx.send(reason.to_string()).is_ok()
            }
            None => false,
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    /// Execute one call to a terminal outcome.
    pub async fn call(&self, request: ToolCallRequest) -> ToolCallResult {
        let started = Instant::now();
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let registered = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if in_flight.contains_key(&request.request_id) {
                false
            } else {
                in_flight.insert(request.request_id.clone(), Some(cancel_tx));
                true
            }
        };

        let (outcome, attempts) = if registered {
            let _guard = InFlightGuard {
                dispatcher: self,
                request_id: request.request_id.clone(),
            };
            self.execute(&request, &mut cancel_rx).await
        } else {
            tracing::warn!(request_id = %request.request_id, "rejected duplicate request id");
            let err = McpError::DuplicateRequestId {
                request_id: request.request_id.to_string(),
            };
            (rejected(err), 0)
        };

        self.counters.record(&outcome);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            CallOutcome::Success { .. } => tracing::info!(
                request_id = %request.request_id,
                server = %request.server_id,
                tool = %request.tool_name,
                attempts,
                elapsed_ms,
                "tool call succeeded"
            ),
            CallOutcome::Failure { kind, detail } => tracing::warn!(
                request_id = %request.request_id,
                server = %request.server_id,
                tool = %request.tool_name,
                ?kind,
                %detail,
                attempts,
                elapsed_ms,
                "tool call failed"
            ),
            CallOutcome::Timeout => tracing::warn!(
                request_id = %request.request_id,
                server = %request.server_id,
                tool = %request.tool_name,
                attempts,
                elapsed_ms,
                "tool call timed out"
            ),
            CallOutcome::Cancelled => tracing::info!(
                request_id = %request.request_id,
                server = %request.server_id,
                tool = %request.tool_name,
                elapsed_ms,
                "tool call cancelled"
            ),
        }

        ToolCallResult {
            request_id: request.request_id,
            server_id: request.server_id,
            tool_name: request.tool_name,
            outcome,
            attempts,
            execution_time_ms: elapsed_ms,
        }
    }

    /// Execute independent calls concurrently. Output order matches input
    /// order; one failure never cancels its siblings.
    pub async fn call_many(&self, requests: Vec<ToolCallRequest>) -> Vec<ToolCallResult> {
        join_all(requests.into_iter().map(|r| self.call(r))).await
    }

    async fn execute(
        &self,
        request: &ToolCallRequest,
        cancel_rx: &mut oneshot::Receiver<String>,
    ) -> (CallOutcome, u32) {
        let mut session = match self.sessions.ready_session(&request.server_id) {
            Ok(session) => session,
            Err(e) => return (rejected(e), 0),
        };

        let Some(tool) = self.registry.get(&request.server_id, &request.tool_name) else {
            let err = McpError::UnknownTool {
                name: request.qualified_name(),
            };
            return (rejected(err), 0);
        };

        if let Err(violation) = schema::validate(&tool.input_schema, &request.arguments) {
            let err = McpError::SchemaMismatch {
                tool: request.qualified_name(),
                reason: violation.to_string(),
            };
            return (rejected(err), 0);
        }

        let may_retry = tool.idempotent && self.settings.retry_idempotent;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let (method, params) = session.tool_call_frame(&tool.name, request.arguments.clone());

            let attempt = match session.request(&method, Some(params)) {
                Ok(pending) => {
                    let wire_id = pending.wire_id();
                    tracing::debug!(
                        request_id = %request.request_id,
                        server = %request.server_id,
                        tool = %request.tool_name,
                        wire_id,
                        attempt = attempts,
                        "dispatching"
                    );
                    let attempt = tokio::select! {
                        reason = &mut *cancel_rx => {
                            Attempt::Cancelled(reason.unwrap_or_else(|_| "cancelled".to_string()))
                        }
                        reply = tokio::time::timeout_at(request.deadline, pending) => match reply {
                            Ok(reply) => Attempt::Reply(reply),
                            Err(_) => Attempt::TimedOut,
                        },
                    };
                    match &attempt {
                        Attempt::Cancelled(reason) => notify_cancelled(&session, wire_id, reason),
                        Attempt::TimedOut => notify_cancelled(&session, wire_id, "deadline exceeded"),
                        Attempt::Reply(_) | Attempt::Rejected(_) => {}
                    }
                    attempt
                }
                Err(e) => Attempt::Rejected(e),
            };

            let (kind, detail) = match attempt {
                Attempt::Cancelled(_) => return (CallOutcome::Cancelled, attempts),
                Attempt::TimedOut => return (CallOutcome::Timeout, attempts),
                Attempt::Reply(Ok(result)) => return (tool_outcome(result), attempts),
                Attempt::Reply(Err(err)) => (err.kind(), format!("[{}] {}", err.code, err.message)),
                Attempt::Rejected(e) => (e.failure_kind(), e.to_string()),
            };

            if kind != FailureKind::Transport || !may_retry || attempts > 1 {
                return (CallOutcome::failure(kind, detail), attempts);
            }

            match self.sessions.ready_session(&request.server_id) {
                Ok(next) => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        request_id = %request.request_id,
                        server = %request.server_id,
                        tool = %request.tool_name,
                        error = %detail,
                        "retrying idempotent call after transport failure"
                    );
                    session = next;
                }
                Err(e) => {
                    tracing::debug!(request_id = %request.request_id, error = %e, "retry skipped");
                    return (CallOutcome::failure(kind, detail), attempts);
                }
            }
        }
    }
}

/// A call refused before it reached the server.
fn rejected(err: McpError) -> CallOutcome {
    CallOutcome::failure(err.failure_kind(), err.to_string())
}

/// Tell the server to stop working on an abandoned request.
fn notify_cancelled(session: &ServerSession, wire_id: u64, reason: &str) {
    let params = json!({"requestId": wire_id, "reason": reason});
    if let Err(e) = session.notify("notifications/cancelled", Some(params)) {
        tracing::debug!(server = %session.server_id(), wire_id, error = %e, "could not send cancellation");
    }
}

/// Map an MCP tool result to an outcome; `isError: true` is an
/// application-level failure.
fn tool_outcome(result: Value) -> CallOutcome {
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        let detail = content_text(&result).unwrap_or_else(|| "tool reported an error".to_string());
        return CallOutcome::failure(FailureKind::Tool, detail);
    }
    CallOutcome::Success { payload: result }
}

/// Joined text of an MCP `content` array, if it has any text blocks.
pub fn content_text(result: &Value) -> Option<String> {
    let texts: Vec<&str> = result
        .get("content")?
        .as_array()?
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::mcp_client::test_support::{text_result, FakeConnector, FakeServer, ToolBehavior};
    use crate::mcp_client::types::{ServerConfig, SessionState, TransportKind};
    use std::sync::atomic::AtomicUsize;

    fn price_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"symbol": {"type": "string"}},
            "required": ["symbol"],
        })
    }

    fn chain_server() -> FakeServer {
        FakeServer::new()
            .with_tool("get_price", price_schema(), true, ToolBehavior::Reply(text_result("3120.55")))
            .with_tool("search_web", json!({"type": "object"}), true, ToolBehavior::Reply(text_result("results")))
            .with_tool("send_tx", json!({"type": "object"}), false, ToolBehavior::Hang)
    }

    async fn setup(server: FakeServer) -> (Arc<SessionManager>, Arc<Dispatcher>) {
        let hub = Arc::new(NotificationHub::new());
        let manager = SessionManager::new(
            Arc::new(FakeConnector::new().with_server("chain", server)),
            Arc::new(ToolRegistry::new()),
            Arc::clone(&hub),
            SessionSettings::default(),
        );
        manager
            .connect(ServerConfig::new("chain", TransportKind::Stdio, "fake"))
            .await
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&manager),
            hub,
            DispatchSettings::default(),
        ));
        (manager, dispatcher)
    }

    fn request(tool: &str, args: Value, timeout_ms: u64) -> ToolCallRequest {
        ToolCallRequest::new("chain", tool, args, Duration::from_millis(timeout_ms))
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
    async fn test_call_success() {
        let (_manager, dispatcher) = setup(chain_server()).await;
        let result = dispatcher
            .call(request("get_price", json!({"symbol": "ETH"}), 1_000))
            .await;

        match &result.outcome {
            CallOutcome::Success { payload } => {
                assert_eq!(content_text(payload).as_deref(), Some("3120.55"));
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(result.attempts, 1);
        assert_eq!(dispatcher.stats().succeeded, 1);
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_call_many_preserves_input_order() {
        let server = chain_server()
            .with_tool(
                "slow",
                json!({}),
                true,
                ToolBehavior::Delayed(Duration::from_millis(80), text_result("slow")),
            )
            .with_tool(
                "medium",
                json!({}),
                true,
                ToolBehavior::Delayed(Duration::from_millis(30), text_result("medium")),
            );
        let (_manager, dispatcher) = setup(server).await;

        let requests = vec![
            request("slow", json!({}), 1_000),
            request("medium", json!({}), 1_000),
            request("search_web", json!({}), 1_000),
        ];
        let ids: Vec<RequestId> = requests.iter().map(|r| r.request_id.clone()).collect();
        let results = dispatcher.call_many(requests).await;

        let names: Vec<&str> = results.iter().map(|r| r.tool_name.as_str()).collect();
        assert_eq!(names, vec!["slow", "medium", "search_web"]);
        let got: Vec<RequestId> = results.iter().map(|r| r.request_id.clone()).collect();
        assert_eq!(got, ids);
        let texts: Vec<String> = results
            .iter()
            .map(|r| match &r.outcome {
                CallOutcome::Success { payload } => content_text(payload).unwrap_or_default(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["slow", "medium", "results"]);
    }

    #[tokio::test]
    async fn test_timeout_and_late_response_discarded() {
        let server = chain_server().with_tool(
            "lagging",
            json!({}),
            true,
            ToolBehavior::Delayed(Duration::from_millis(100), text_result("late")),
        );
        let (manager, dispatcher) = setup(server.clone()).await;

        let result = dispatcher.call(request("lagging", json!({}), 20)).await;
        assert_eq!(result.outcome, CallOutcome::Timeout);
        assert_eq!(dispatcher.stats().timed_out, 1);

        let next = dispatcher
            .call(request("get_price", json!({"symbol": "BTC"}), 1_000))
            .await;
        assert!(next.outcome.is_success());

        // Let the late reply arrive; it must not land anywhere.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let session = manager.session("chain").unwrap();
        assert_eq!(session.pending_call_count(), 0);
        assert_eq!(session.state(), SessionState::Ready);
        assert!(wait_for(|| !server.cancelled().is_empty()).await);
        assert_eq!(server.cancelled()[0]["reason"], "deadline exceeded");
    }

    #[tokio::test]
    async fn test_idempotent_retried_exactly_once() {
        let server = chain_server();
        server.set_behavior("get_price", ToolBehavior::TransportError);
        let (_manager, dispatcher) = setup(server.clone()).await;

        let result = dispatcher
            .call(request("get_price", json!({"symbol": "ETH"}), 1_000))
            .await;
        assert_eq!(result.attempts, 2);
        assert_eq!(server.call_count("get_price"), 2);
        assert!(matches!(
            result.outcome,
            CallOutcome::Failure { kind: FailureKind::Transport, .. }
        ));
        assert_eq!(dispatcher.stats().retried, 1);
    }

    #[tokio::test]
    async fn test_idempotent_retry_recovers() {
        let server = chain_server();
        server.set_behavior("search_web", ToolBehavior::TransportErrorOnce(text_result("ok")));
        let (_manager, dispatcher) = setup(server.clone()).await;

        let result = dispatcher.call(request("search_web", json!({}), 1_000)).await;
        assert!(result.outcome.is_success());
        assert_eq!(result.attempts, 2);
        assert_eq!(server.call_count("search_web"), 2);
    }

    #[tokio::test]
    async fn test_non_idempotent_never_retried() {
        let server = chain_server();
        server.set_behavior("send_tx", ToolBehavior::TransportError);
        let (_manager, dispatcher) = setup(server.clone()).await;

        let result = dispatcher.call(request("send_tx", json!({}), 1_000)).await;
        assert_eq!(result.attempts, 1);
        assert_eq!(server.call_count("send_tx"), 1);
        assert_eq!(dispatcher.stats().retried, 0);
    }

    #[tokio::test]
    async fn test_application_errors_not_retried() {
        let server = chain_server();
        server.set_behavior("get_price", ToolBehavior::RpcError(-32000, "rate limited".into()));
        server.set_behavior("search_web", ToolBehavior::ToolError("no results".into()));
        let (_manager, dispatcher) = setup(server.clone()).await;

        let rpc = dispatcher
            .call(request("get_price", json!({"symbol": "ETH"}), 1_000))
            .await;
        match rpc.outcome {
            CallOutcome::Failure { kind, detail } => {
                assert_eq!(kind, FailureKind::Tool);
                assert!(detail.contains("rate limited"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(server.call_count("get_price"), 1);

        let tool = dispatcher.call(request("search_web", json!({}), 1_000)).await;
        assert_eq!(
            tool.outcome,
            CallOutcome::failure(FailureKind::Tool, "no results")
        );
        assert_eq!(server.call_count("search_web"), 1);
    }

    #[tokio::test]
    async fn test_non_ready_sessions_fail_fast() {
        let server = chain_server();
        let (manager, dispatcher) = setup(server.clone()).await;

        let missing = ToolCallRequest::new("nowhere", "get_price", json!({}), Duration::from_secs(5));
        let started = Instant::now();
        let result = dispatcher.call(missing).await;
        assert!(matches!(
            result.outcome,
            CallOutcome::Failure { kind: FailureKind::SessionUnavailable, .. }
        ));

        let session = manager.session("chain").unwrap();
        session.transition(SessionState::Degraded);
        let degraded = dispatcher
            .call(request("get_price", json!({"symbol": "ETH"}), 5_000))
            .await;
        assert!(matches!(
            degraded.outcome,
            CallOutcome::Failure { kind: FailureKind::SessionUnavailable, .. }
        ));

        manager.close("chain").await;
        let closed = dispatcher
            .call(request("get_price", json!({"symbol": "ETH"}), 5_000))
            .await;
        assert!(matches!(
            closed.outcome,
            CallOutcome::Failure { kind: FailureKind::SessionUnavailable, .. }
        ));

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(server.call_count("get_price"), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_schema_mismatch() {
        let server = chain_server();
        let (_manager, dispatcher) = setup(server.clone()).await;

        let unknown = dispatcher.call(request("get_weather", json!({}), 1_000)).await;
        match unknown.outcome {
            CallOutcome::Failure { kind, detail } => {
                assert_eq!(kind, FailureKind::UnknownTool);
                assert_eq!(detail, "unknown tool: 'chain.get_weather'");
            }
            other => panic!("expected unknown tool, got {other:?}"),
        }

        let bad = dispatcher
            .call(request("get_price", json!({"symbol": 42}), 1_000))
            .await;
        match bad.outcome {
            CallOutcome::Failure { kind, detail } => {
                assert_eq!(kind, FailureKind::SchemaMismatch);
                assert!(detail.starts_with("invalid arguments for 'chain.get_price'"));
                assert!(detail.contains("symbol"));
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
        assert_eq!(server.call_count("get_price"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let server = chain_server().with_tool(
            "slow",
            json!({}),
            true,
            ToolBehavior::Delayed(Duration::from_millis(50), text_result("done")),
        );
        let (_manager, dispatcher) = setup(server.clone()).await;

        let id = RequestId::new("req_fixed");
        let first = request("slow", json!({}), 1_000).with_request_id(id.clone());
        let second = request("slow", json!({}), 1_000).with_request_id(id);
        let results = dispatcher.call_many(vec![first, second]).await;

        assert!(results[0].outcome.is_success());
        match &results[1].outcome {
            CallOutcome::Failure { kind, detail } => {
                assert_eq!(*kind, FailureKind::DuplicateRequest);
                assert_eq!(detail, "request id 'req_fixed' is already in flight");
            }
            other => panic!("expected duplicate rejection, got {other:?}"),
        }
        assert_eq!(results[1].attempts, 0);
        assert_eq!(server.call_count("slow"), 1);
    }

    #[tokio::test]
    async fn test_cancel_leaves_siblings_untouched() {
        let server = chain_server().with_tool(
            "slow",
            json!({}),
            true,
            ToolBehavior::Delayed(Duration::from_millis(100), text_result("sibling")),
        );
        let (_manager, dispatcher) = setup(server.clone()).await;

        let doomed = request("send_tx", json!({"to": "0xabc"}), 5_000);
        let doomed_id = doomed.request_id.clone();
        let sibling = request("slow", json!({}), 5_000);

        let d = Arc::clone(&dispatcher);
        let doomed_task = tokio::spawn(async move { d.call(doomed).await });
        let d = Arc::clone(&dispatcher);
        let sibling_task = tokio::spawn(async move { d.call(sibling).await });

        assert!(wait_for(|| server.call_count("send_tx") == 1).await);
        assert!(dispatcher.cancel(&doomed_id, "user aborted"));
        assert!(!dispatcher.cancel(&doomed_id, "again"));

        let cancelled = doomed_task.await.unwrap();
        assert_eq!(cancelled.outcome, CallOutcome::Cancelled);
        let sibling = sibling_task.await.unwrap();
        assert!(sibling.outcome.is_success());

        assert!(wait_for(|| server.cancelled().len() == 1).await);
        let note = &server.cancelled()[0];
        assert_eq!(note["reason"], "user aborted");
        assert!(note["requestId"].is_u64());
        assert_eq!(dispatcher.stats().cancelled, 1);
        assert!(!dispatcher.cancel(&RequestId::new("req_unknown"), "nope"));
    }

    #[tokio::test]
    async fn test_notifications_reach_subscribers() {
        let server = chain_server();
        let (_manager, dispatcher) = setup(server.clone()).await;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        dispatcher.on_notification(move |n| {
            if n.method == "notifications/progress" {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        server.notify_all("notifications/progress", Some(json!({"progress": 50})));
        assert!(wait_for(|| seen.load(Ordering::SeqCst) == 1).await);
    }

    #[test]
    fn test_content_text() {
        let result = json!({"content": [
            {"type": "text", "text": "a"},
            {"type": "image", "data": "..."},
            {"type": "text", "text": "b"},
        ]});
        assert_eq!(content_text(&result).as_deref(), Some("a\nb"));
        assert_eq!(content_text(&json!({"content": []})), None);
        assert_eq!(content_text(&json!({"value": 1})), None);
    }

    #[test]
    fn test_tool_outcome_is_error() {
        let mut result = text_result("boom");
        result["isError"] = json!(true);
        assert_eq!(tool_outcome(result), CallOutcome::failure(FailureKind::Tool, "boom"));
        assert!(tool_outcome(text_result("fine")).is_success());
    }
}
