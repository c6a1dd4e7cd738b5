//! In-memory transport and scriptable MCP server for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::codec::{self, error_codes, ErrorObject, Frame, PROTOCOL_VERSION};
use super::errors::McpError;
use super::transport::{Connector, Transport};
use super::types::ServerConfig;

// ─── Channel Transport ───────────────────────────────────────────────────────

/// Client side of an in-memory line pipe.
pub struct ChannelTransport {
    server_id: String,
    to_peer: mpsc::UnboundedSender<String>,
    from_peer: mpsc::UnboundedReceiver<String>,
}

/// Server side of an in-memory line pipe. Dropping it closes the connection.
pub struct ChannelPeer {
    rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
}

pub fn channel_transport(server_id: &str) -> (ChannelTransport, ChannelPeer) {
    let (client_tx, peer_rx) = mpsc::unbounded_channel();
    let (peer_tx, client_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            server_id: server_id.to_string(),
            to_peer: client_tx,
            from_peer: client_rx,
        },
        ChannelPeer {
            rx: peer_rx,
            tx: peer_tx,
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, line: &str) -> Result<(), McpError> {
        self.to_peer
            .send(line.to_string())
            .map_err(|_| McpError::Transport {
                server: self.server_id.clone(),
                reason: "peer closed".into(),
            })
    }

    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.from_peer.recv().await)
    }

    async fn close(&mut self) {
        self.from_peer.close();
    }
}

impl ChannelPeer {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn send_line(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }

    pub fn send_frame(&self, frame: Frame) {
        if let Ok(line) = codec::encode(&frame) {
            let _ = self.tx.send(line);
        }
    }
}

// ─── Fake Server ─────────────────────────────────────────────────────────────

/// How the fake server answers a tool invocation.
#[derive(Debug, Clone)]
pub enum ToolBehavior {
    /// Reply immediately with this `result`.
    Reply(Value),
    /// Reply with this `result` after a delay.
    Delayed(Duration, Value),
    /// JSON-RPC error response.
    RpcError(i32, String),
    /// MCP result with `isError: true`.
    ToolError(String),
    /// Synthesized transport failure response, every time.
    TransportError,
    /// Transport failure on the first call, then reply.
    TransportErrorOnce(Value),
    /// Close the connection on receipt.
    DropConnection,
    /// Never answer.
    Hang,
}

/// MCP `tools/call` result with a single text block.
pub fn text_result(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}]})
}

/// Tool definition as a server would announce it.
pub fn tool_def(name: &str, schema: Value, idempotent: bool) -> Value {
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": schema,
        "annotations": {"idempotentHint": idempotent},
    })
}

/// Scriptable MCP server. Clones share state, so a test keeps one handle
/// while the connector serves sessions from another.
#[derive(Clone)]
pub struct FakeServer {
    tools: Arc<Mutex<Vec<Value>>>,
    behaviors: Arc<Mutex<HashMap<String, ToolBehavior>>>,
    calls: Arc<Mutex<HashMap<String, u32>>>,
    cancelled: Arc<Mutex<Vec<Value>>>,
    healthy: Arc<AtomicBool>,
    fail_initialize: Arc<AtomicBool>,
    fail_list_tools: Arc<AtomicBool>,
    inline_tools: bool,
    page_size: usize,
    control: Arc<Mutex<Vec<mpsc::UnboundedSender<Frame>>>>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(Mutex::new(Vec::new())),
            behaviors: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(HashMap::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
            healthy: Arc::new(AtomicBool::new(true)),
            fail_initialize: Arc::new(AtomicBool::new(false)),
            fail_list_tools: Arc::new(AtomicBool::new(false)),
            inline_tools: false,
            page_size: 50,
            control: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_tool(self, name: &str, schema: Value, idempotent: bool, behavior: ToolBehavior) -> Self {
        self.tools.lock().unwrap().push(tool_def(name, schema, idempotent));
        self.behaviors.lock().unwrap().insert(name.to_string(), behavior);
        self
    }

    /// Announce tools in the `initialize` result instead of `tools/list`.
    pub fn with_inline_tools(mut self) -> Self {
        self.inline_tools = true;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn set_behavior(&self, name: &str, behavior: ToolBehavior) {
        self.behaviors.lock().unwrap().insert(name.to_string(), behavior);
    }

    pub fn set_tools(&self, tools: Vec<Value>) {
        *self.tools.lock().unwrap() = tools;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_initialize(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_list_tools(&self, fail: bool) {
        self.fail_list_tools.store(fail, Ordering::SeqCst);
    }

    pub fn call_count(&self, tool: &str) -> u32 {
        self.calls.lock().unwrap().get(tool).copied().unwrap_or(0)
    }

    /// Params of every `notifications/cancelled` received.
    pub fn cancelled(&self) -> Vec<Value> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Push a notification to every live connection.
    pub fn notify_all(&self, method: &str, params: Option<Value>) {
        for tx in self.control.lock().unwrap().iter() {
            let _ = tx.send(Frame::notification(method, params.clone()));
        }
    }

    /// Start serving one connection; returns the client end.
    pub fn serve(&self, server_id: &str) -> ChannelTransport {
        let (transport, peer) = channel_transport(server_id);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.control.lock().unwrap().push(control_tx);
        tokio::spawn(self.clone().run(peer, control_rx));
        transport
    }

    async fn run(self, mut peer: ChannelPeer, mut control: mpsc::UnboundedReceiver<Frame>) {
        loop {
            tokio::select! {
                line = peer.recv() => {
                    let Some(line) = line else { return };
                    let Ok(frame) = codec::decode(&line) else { continue };
                    if !self.handle(&peer, frame) {
                        return;
                    }
                }
                Some(frame) = control.recv() => peer.send_frame(frame),
            }
        }
    }

    /// Returns false when the connection should be dropped.
    fn handle(&self, peer: &ChannelPeer, frame: Frame) -> bool {
        match frame {
            Frame::Request { id, method, params } => match method.as_str() {
                "initialize" => {
                    if self.fail_initialize.load(Ordering::SeqCst) {
                        peer.send_frame(Frame::error(
                            id,
                            ErrorObject::new(error_codes::INTERNAL_ERROR, "init exploded"),
                        ));
                        return true;
                    }
                    let mut result = json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {"listChanged": true}},
                        "serverInfo": {"name": "fake", "version": "0.0.0"},
                    });
                    if self.inline_tools {
                        result["tools"] = Value::Array(self.tools.lock().unwrap().clone());
                    }
                    peer.send_frame(Frame::result(id, result));
                    true
                }
                "tools/list" => {
                    if self.fail_list_tools.load(Ordering::SeqCst) {
                        peer.send_frame(Frame::error(
                            id,
                            ErrorObject::new(error_codes::INTERNAL_ERROR, "listing unavailable"),
                        ));
                        return true;
                    }
                    let tools = self.tools.lock().unwrap().clone();
                    let start = params
                        .as_ref()
                        .and_then(|p| p.get("cursor"))
                        .and_then(Value::as_str)
                        .and_then(|c| c.parse::<usize>().ok())
                        .unwrap_or(0);
                    let end = (start + self.page_size).min(tools.len());
                    let page: Vec<Value> = tools[start.min(end)..end].to_vec();
                    let mut result = json!({"tools": page});
                    if end < tools.len() {
                        result["nextCursor"] = json!(end.to_string());
                    }
                    peer.send_frame(Frame::result(id, result));
                    true
                }
                "ping" => {
                    if self.healthy.load(Ordering::SeqCst) {
                        peer.send_frame(Frame::result(id, json!({})));
                    }
                    true
                }
                "tools/call" => {
                    let params = params.unwrap_or(Value::Null);
                    let name = params["name"].as_str().unwrap_or_default().to_string();
                    self.invoke(peer, id, &name)
                }
                other => {
                    if self.behaviors.lock().unwrap().contains_key(other) {
                        self.invoke(peer, id, other)
                    } else {
                        peer.send_frame(Frame::error(
                            id,
                            ErrorObject::new(error_codes::METHOD_NOT_FOUND, "Method not found"),
                        ));
                        true
                    }
                }
            },
            Frame::Notification { method, params } => {
                if method == "notifications/cancelled" {
                    self.cancelled
                        .lock()
                        .unwrap()
                        .push(params.unwrap_or(Value::Null));
                }
                true
            }
            Frame::Response { .. } => true,
        }
    }

    fn invoke(&self, peer: &ChannelPeer, id: Value, name: &str) -> bool {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let behavior = self.behaviors.lock().unwrap().get(name).cloned();

        match behavior {
            None => peer.send_frame(Frame::error(
                id,
                ErrorObject::new(error_codes::INVALID_PARAMS, format!("unknown tool {name}")),
            )),
            Some(ToolBehavior::Reply(result)) => peer.send_frame(Frame::result(id, result)),
            Some(ToolBehavior::Delayed(delay, result)) => {
                let tx = peer.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Ok(line) = codec::encode(&Frame::result(id, result)) {
                        let _ = tx.send(line);
                    }
                });
            }
            Some(ToolBehavior::RpcError(code, message)) => {
                peer.send_frame(Frame::error(id, ErrorObject::new(code, message)));
            }
            Some(ToolBehavior::ToolError(text)) => {
                let mut result = text_result(&text);
                result["isError"] = json!(true);
                peer.send_frame(Frame::result(id, result));
            }
            Some(ToolBehavior::TransportError) => peer.send_frame(Frame::error(
                id,
                ErrorObject::new(error_codes::TRANSPORT_ERROR, "connection reset"),
            )),
            Some(ToolBehavior::TransportErrorOnce(result)) => {
                if count == 1 {
                    peer.send_frame(Frame::error(
                        id,
                        ErrorObject::new(error_codes::TRANSPORT_ERROR, "connection reset"),
                    ));
                } else {
                    peer.send_frame(Frame::result(id, result));
                }
            }
            Some(ToolBehavior::DropConnection) => return false,
            Some(ToolBehavior::Hang) => {}
        }
        true
    }
}

// ─── Fake Connector ──────────────────────────────────────────────────────────

/// Connector that serves configured server ids from `FakeServer`s.
#[derive(Default)]
pub struct FakeConnector {
    servers: Mutex<HashMap<String, FakeServer>>,
    refusals: Mutex<HashMap<String, u32>>,
    connects: Mutex<HashMap<String, u32>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(self, server_id: &str, server: FakeServer) -> Self {
        self.servers.lock().unwrap().insert(server_id.to_string(), server);
        self
    }

    /// Refuse the next `times` connection attempts for a server.
    pub fn refuse(&self, server_id: &str, times: u32) {
        self.refusals.lock().unwrap().insert(server_id.to_string(), times);
    }

    pub fn connect_count(&self, server_id: &str) -> u32 {
        self.connects.lock().unwrap().get(server_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, McpError> {
        let id = config.server_id.as_str();
        *self.connects.lock().unwrap().entry(id.to_string()).or_insert(0) += 1;

        {
            let mut refusals = self.refusals.lock().unwrap();
            if let Some(left) = refusals.get_mut(id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(McpError::ConnectFailed {
                        server: id.to_string(),
                        reason: "connection refused".into(),
                    });
                }
            }
        }

        let server = self.servers.lock().unwrap().get(id).cloned();
        match server {
            Some(server) => Ok(Box::new(server.serve(id))),
            None => Err(McpError::ConnectFailed {
                server: id.to_string(),
                reason: "no such server".into(),
            }),
        }
    }
}
