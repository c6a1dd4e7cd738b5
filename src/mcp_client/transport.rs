//! Line transports for MCP sessions.
//!
//! Every transport moves newline-delimited JSON frames and implements the
//! same `Transport` capability set (send / receive / close), so sessions and
//! the dispatcher never see which kind of server they are talking to:
//! - `StdioTransport`: child process, frames on stdin/stdout
//! - `TcpTransport`: plain socket
//! - `HttpTransport`: streamable HTTP, one POST per outbound frame, JSON or
//!   SSE response bodies fed back as inbound lines

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::codec::{self, error_codes, ErrorObject, Frame};
use super::errors::McpError;
use super::types::{ServerConfig, TransportKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for a child process to exit after stdin is closed before it is
/// force-killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr lines retained per stdio server for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Header carrying the server-assigned session on streamable HTTP.
const SESSION_HEADER: &str = "mcp-session-id";

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// Bidirectional line transport owned by exactly one session I/O task.
#[async_trait]
pub trait Transport: Send {
    /// Write one newline-terminated frame.
    async fn send(&mut self, line: &str) -> Result<(), McpError>;

    /// Next inbound line, or `None` once the peer has closed.
    ///
    /// Must be cancel-safe: the session I/O task races it against outbound
    /// traffic and drops it mid-wait.
    async fn receive(&mut self) -> Result<Option<String>, McpError>;

    /// Release the connection. Idempotent.
    async fn close(&mut self);

    /// Recent diagnostic output (e.g. server stderr), if any.
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Establishes transports from server configs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, McpError>;
}

/// Connector for real servers: processes, sockets, and HTTP endpoints.
#[derive(Debug, Clone, Default)]
pub struct NetworkConnector {
    http: reqwest::Client,
}

impl NetworkConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Connector for NetworkConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, McpError> {
        match config.transport {
            TransportKind::Stdio => Ok(Box::new(StdioTransport::spawn(config)?)),
            TransportKind::Tcp => Ok(Box::new(TcpTransport::connect(config).await?)),
            TransportKind::Http => Ok(Box::new(HttpTransport::new(self.http.clone(), config))),
        }
    }
}

fn write_error(server: &str, e: std::io::Error) -> McpError {
    McpError::Transport {
        server: server.to_string(),
        reason: format!("write failed: {e}"),
    }
}

fn read_error(server: &str, e: std::io::Error) -> McpError {
    McpError::Transport {
        server: server.to_string(),
        reason: format!("read failed: {e}"),
    }
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

/// JSON-RPC over a child process's stdio.
pub struct StdioTransport {
    server_id: String,
    child: Child,
    writer: Option<ChildStdin>,
    reader: Lines<BufReader<ChildStdout>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl StdioTransport {
    /// Spawn the configured command with piped stdio.
    pub fn spawn(config: &ServerConfig) -> Result<Self, McpError> {
        let server_id = config.server_id.as_str();
        let mut cmd = Command::new(&config.address);
        cmd.args(&config.args);

        for (key, value) in config.env.iter().chain(config.credentials.env.iter()) {
            cmd.env(key, value);
        }
        if let Some(dir) = config.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectFailed {
            server: server_id.to_string(),
            reason: format!("failed to spawn '{}': {e}", config.address),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::ConnectFailed {
            server: server_id.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::ConnectFailed {
            server: server_id.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            let server = server_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "stderr: {line}");
                    let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        tracing::debug!(server = %server_id, command = %config.address, "spawned server process");

        Ok(Self {
            server_id: server_id.to_string(),
            child,
            writer: Some(stdin),
            reader: BufReader::new(stdout).lines(),
            stderr_tail,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, line: &str) -> Result<(), McpError> {
        let writer = self.writer.as_mut().ok_or_else(|| McpError::Transport {
            server: self.server_id.clone(),
            reason: "stdin already closed".into(),
        })?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| write_error(&self.server_id, e))?;
        writer
            .flush()
            .await
            .map_err(|e| write_error(&self.server_id, e))
    }

    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        self.reader
            .next_line()
            .await
            .map_err(|e| read_error(&self.server_id, e))
    }

    async fn close(&mut self) {
        // Closing stdin is the MCP stdio shutdown signal.
        self.writer.take();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_id, %status, "server process exited");
            }
            _ => {
                tracing::warn!(server = %self.server_id, "server did not exit, killing");
                let _ = self.child.kill().await;
            }
        }
    }

    fn diagnostics(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

// ─── TCP ─────────────────────────────────────────────────────────────────────

/// Line-delimited JSON over a TCP socket.
pub struct TcpTransport {
    server_id: String,
    writer: OwnedWriteHalf,
    reader: Lines<BufReader<OwnedReadHalf>>,
}

impl TcpTransport {
    pub async fn connect(config: &ServerConfig) -> Result<Self, McpError> {
        let stream = TcpStream::connect(&config.address)
            .await
            .map_err(|e| McpError::ConnectFailed {
                server: config.server_id.clone(),
                reason: format!("connect to {} failed: {e}", config.address),
            })?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Ok(Self {
            server_id: config.server_id.clone(),
            writer: write,
            reader: BufReader::new(read).lines(),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, line: &str) -> Result<(), McpError> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| write_error(&self.server_id, e))
    }

    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        self.reader
            .next_line()
            .await
            .map_err(|e| read_error(&self.server_id, e))
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

// ─── Streamable HTTP ─────────────────────────────────────────────────────────

/// MCP over streamable HTTP.
///
/// Each outbound frame is POSTed from its own task; response bodies (plain
/// JSON or an SSE stream) are split into frames and queued for `receive`.
/// A failed POST for a request is reported back as a synthesized
/// `TRANSPORT_ERROR` response for that request id.
pub struct HttpTransport {
    server_id: String,
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
    session_id: Arc<Mutex<Option<String>>>,
    inbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: mpsc::UnboundedReceiver<String>,
    posts: JoinSet<()>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, config: &ServerConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            server_id: config.server_id.clone(),
            client,
            url: config.address.clone(),
            bearer_token: config.credentials.bearer_token.clone(),
            session_id: Arc::new(Mutex::new(None)),
            inbound_tx,
            inbound_rx,
            posts: JoinSet::new(),
        }
    }

    fn request_builder(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, &self.url);
        if let Some(token) = &self.bearer_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        let session = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sid) = session.as_deref() {
            req = req.header(SESSION_HEADER, sid);
        }
        req
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, line: &str) -> Result<(), McpError> {
        while self.posts.try_join_next().is_some() {}

        let request_id = match codec::decode(line) {
            Ok(Frame::Request { id, .. }) => Some(id),
            _ => None,
        };

        let req = self
            .request_builder(reqwest::Method::POST)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(line.trim_end().to_string());

        let server = self.server_id.clone();
        let session_id = Arc::clone(&self.session_id);
        let inbound = self.inbound_tx.clone();

        self.posts.spawn(async move {
            if let Err(reason) = post_frame(req, &session_id, &inbound).await {
                tracing::warn!(server = %server, %reason, "http post failed");
                if let Some(id) = request_id {
                    let frame = Frame::error(id, ErrorObject::new(error_codes::TRANSPORT_ERROR, reason));
                    if let Ok(line) = codec::encode(&frame) {
                        let _ = inbound.send(line);
                    }
                }
            }
        });
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.inbound_rx.recv().await)
    }

    async fn close(&mut self) {
        self.posts.abort_all();
        let has_session = self
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        if has_session {
            let _ = self
                .request_builder(reqwest::Method::DELETE)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
        }
    }
}

/// POST one frame and queue every frame found in the response body.
async fn post_frame(
    req: reqwest::RequestBuilder,
    session_id: &Mutex<Option<String>>,
    inbound: &mpsc::UnboundedSender<String>,
) -> Result<(), String> {
    let response = req.send().await.map_err(|e| format!("request failed: {e}"))?;

    if let Some(sid) = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        *session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(sid.to_string());
    }

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("HTTP {status}: {}", body.chars().take(500).collect::<String>()));
    }

    let is_sse = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    if is_sse {
        let mut decoder = SseDecoder::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| format!("stream read failed: {e}"))?;
            for data in decoder.push(&chunk) {
                let _ = inbound.send(data);
            }
        }
        for data in decoder.finish() {
            let _ = inbound.send(data);
        }
    } else {
        let body = response
            .text()
            .await
            .map_err(|e| format!("body read failed: {e}"))?;
        for frame in split_json_body(&body) {
            let _ = inbound.send(frame);
        }
    }
    Ok(())
}

/// Frames in a plain JSON body: one object, or a batch array flattened.
fn split_json_body(body: &str) -> Vec<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Array(items)) => items.iter().map(|v| v.to_string()).collect(),
        _ => vec![trimmed.to_string()],
    }
}

/// Incremental Server-Sent Events parser yielding `data` payloads.
#[derive(Debug, Default)]
struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed bytes; returns completed event payloads.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
        }
        events
    }

    /// Flush a trailing event not terminated by a blank line.
    fn finish(&mut self) -> Vec<String> {
        let mut events = self.push(b"\n");
        if !self.data.is_empty() {
            events.push(self.data.join("\n"));
            self.data.clear();
        }
        events
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
