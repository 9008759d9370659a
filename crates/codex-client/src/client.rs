//! Codex app-server JSON-RPC client.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use crate::types::*;

const INBOUND_CHANNEL_CAPACITY: usize = 512;
const CONNECTION_CLOSED: &str = "App-server connection closed";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AppServerRequestId {
    String(String),
    Integer(i64),
}

impl fmt::Display for AppServerRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(value) => f.write_str(value),
            Self::Integer(value) => write!(f, "{value}"),
        }
    }
}

/// Structured error returned by the server in a response frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("App-server error {code}: {message}")]
pub struct AppServerError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AppServerNotification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct AppServerRequest {
    pub id: AppServerRequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// Unsolicited server traffic, delivered in wire arrival order.
#[derive(Debug, Clone)]
pub enum AppServerInbound {
    Notification(AppServerNotification),
    Request(AppServerRequest),
}

/// Closes when the connection ends for any reason.
pub type AppServerInboundReceiver = mpsc::Receiver<AppServerInbound>;

pub type AppServerWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type AppServerReader = Box<dyn AsyncRead + Send + Unpin>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingRequest = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct PendingRequests {
    closed: bool,
    waiting: HashMap<AppServerRequestId, PendingRequest>,
}

impl PendingRequests {
    fn close(&mut self) {
        self.closed = true;
        for (_, sender) in self.waiting.drain() {
            let _ = sender.send(Err(anyhow::anyhow!(CONNECTION_CLOSED)));
        }
    }
}

/// Settings for a locally spawned app-server process.
#[derive(Debug, Clone, Default)]
pub struct AppServerProcessConfig {
    /// Explicit executable; resolved from `PATH` when absent.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// JSON-lines record of every frame crossing the wire.
#[derive(Clone)]
pub struct AppServerWireLog {
    tx: mpsc::UnboundedSender<(WireDirection, String)>,
}

#[derive(Clone, Copy)]
enum WireDirection {
    Inbound,
    Outbound,
}

impl WireDirection {
    const fn label(self) -> &'static str {
        match self {
            Self::Inbound => "in",
            Self::Outbound => "out",
        }
    }
}

impl AppServerWireLog {
    /// Start a writer task appending to `path`. Must be called inside a tokio runtime.
    pub fn new(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(WireDirection, String)>();
        tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "Failed to open app-server wire log");
                    return;
                }
            };
            while let Some((direction, raw)) = rx.recv().await {
                let entry = serde_json::json!({
                    "timestamp_ms": current_timestamp_ms(),
                    "direction": direction.label(),
                    "raw": raw,
                });
                let mut line = entry.to_string();
                line.push('\n');
                if let Err(err) = file.write_all(line.as_bytes()).await {
                    tracing::warn!(error = %err, "App-server wire log write failed");
                    return;
                }
            }
        });
        Self { tx }
    }

    fn record(&self, direction: WireDirection, raw: &str) {
        let _ = self.tx.send((direction, raw.to_string()));
    }
}

/// Routes one raw inbound frame to a waiting request or the inbound channel.
#[derive(Clone)]
struct InboundDispatcher {
    pending: Arc<Mutex<PendingRequests>>,
    inbound_tx: mpsc::Sender<AppServerInbound>,
    wire_log: Option<AppServerWireLog>,
}

impl InboundDispatcher {
    /// Returns `false` once nobody listens for inbound traffic anymore.
    async fn dispatch(&self, raw: &str) -> bool {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return true;
        }
        if let Some(log) = &self.wire_log {
            log.record(WireDirection::Inbound, trimmed);
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, line = %trimmed, "App-server JSON parse failed");
                return true;
            }
        };

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            let params = value.get("params").cloned();
            let inbound = match value.get("id") {
                Some(id_value) => {
                    match serde_json::from_value::<AppServerRequestId>(id_value.clone()) {
                        Ok(id) => AppServerInbound::Request(AppServerRequest {
                            id,
                            method: method.to_string(),
                            params,
                        }),
                        Err(err) => {
                            tracing::warn!(error = %err, method, "App-server request id parse failed");
                            return true;
                        }
                    }
                }
                None => AppServerInbound::Notification(AppServerNotification {
                    method: method.to_string(),
                    params,
                }),
            };
            return self.inbound_tx.send(inbound).await.is_ok();
        }

        let Some(id_value) = value.get("id") else {
            tracing::debug!(line = %trimmed, "App-server frame without method or id");
            return true;
        };
        let id = match serde_json::from_value::<AppServerRequestId>(id_value.clone()) {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(error = %err, "App-server response id parse failed");
                return true;
            }
        };

        let result = match (value.get("error"), value.get("result")) {
            (Some(error), _) => Err(anyhow::Error::new(AppServerError {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string(),
            })),
            (None, Some(result)) => Ok(result.clone()),
            (None, None) => Ok(Value::Null),
        };

        match self.pending.lock().await.waiting.remove(&id) {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => tracing::warn!(%id, "App-server response without pending request"),
        }
        true
    }

    async fn close(&self) {
        self.pending.lock().await.close();
    }
}

enum FrameWriter {
    Lines(AppServerWriter),
    WebSocket(SplitSink<WsStream, Message>),
}

impl FrameWriter {
    async fn send_frame(&mut self, payload: &str) -> Result<()> {
        match self {
            Self::Lines(writer) => {
                writer
                    .write_all(payload.as_bytes())
                    .await
                    .context("App-server write failed")?;
                writer
                    .write_all(b"\n")
                    .await
                    .context("App-server write failed")?;
                writer.flush().await.context("App-server flush failed")
            }
            Self::WebSocket(sink) => sink
                .send(Message::Text(payload.to_string().into()))
                .await
                .context("App-server websocket send failed"),
        }
    }

    async fn close(&mut self) {
        match self {
            Self::Lines(writer) => {
                let _ = writer.shutdown().await;
            }
            Self::WebSocket(sink) => {
                let _ = sink.send(Message::Close(None)).await;
            }
        }
    }
}

fn spawn_line_reader(reader: AppServerReader, dispatcher: InboundDispatcher) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !dispatcher.dispatch(&line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "App-server read failed");
                    break;
                }
            }
        }
        dispatcher.close().await;
    })
}

fn spawn_websocket_reader(
    mut stream: SplitStream<WsStream>,
    dispatcher: InboundDispatcher,
    url: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if !dispatcher.dispatch(text.as_str()).await {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
                Err(err) => {
                    tracing::warn!(error = %err, url = %url, "App-server websocket read failed");
                    break;
                }
            }
        }
        dispatcher.close().await;
    })
}

struct AppServerTransport {
    writer: Mutex<FrameWriter>,
    pending: Arc<Mutex<PendingRequests>>,
    request_counter: AtomicI64,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    wire_log: Option<AppServerWireLog>,
}

impl AppServerTransport {
    fn new<F>(
        writer: FrameWriter,
        wire_log: Option<AppServerWireLog>,
        spawn_reader: F,
    ) -> (Self, AppServerInboundReceiver)
    where
        F: FnOnce(InboundDispatcher) -> JoinHandle<()>,
    {
        let pending = Arc::new(Mutex::new(PendingRequests::default()));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let reader_task = spawn_reader(InboundDispatcher {
            pending: pending.clone(),
            inbound_tx,
            wire_log: wire_log.clone(),
        });

        (
            Self {
                writer: Mutex::new(writer),
                pending,
                request_counter: AtomicI64::new(1),
                reader_task: std::sync::Mutex::new(Some(reader_task)),
                wire_log,
            },
            inbound_rx,
        )
    }

    async fn request<T, R>(&self, method: &str, params: Option<&T>) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let id = AppServerRequestId::Integer(self.request_counter.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(anyhow::anyhow!(CONNECTION_CLOSED));
            }
            pending.waiting.insert(id.clone(), tx);
        }

        let request = serde_json::json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.send_json(&request).await {
            self.pending.lock().await.waiting.remove(&id);
            return Err(err);
        }

        let result = rx.await.context("App-server request canceled")??;
        serde_json::from_value(result)
            .with_context(|| format!("App-server response parse failed for {method}"))
    }

    async fn notify<T>(&self, method: &str, params: Option<&T>) -> Result<()>
    where
        T: Serialize,
    {
        self.send_json(&serde_json::json!({
            "method": method,
            "params": params,
        }))
        .await
    }

    async fn respond<T>(&self, id: &AppServerRequestId, result: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.send_json(&serde_json::json!({
            "id": id,
            "result": result,
        }))
        .await
    }

    async fn send_json(&self, value: &Value) -> Result<()> {
        let payload = serde_json::to_string(value).context("App-server JSON encode failed")?;
        if let Some(log) = &self.wire_log {
            log.record(WireDirection::Outbound, &payload);
        }
        self.writer.lock().await.send_frame(&payload).await
    }

    async fn close(&self) {
        self.writer.lock().await.close().await;
        self.abort_reader();
        self.pending.lock().await.close();
    }

    fn abort_reader(&self) {
        let task = match self.reader_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for AppServerTransport {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

pub struct AppServerClient {
    transport: AppServerTransport,
    process: Mutex<Option<Child>>,
}

impl AppServerClient {
    /// Spawn a local app-server and talk to it over stdio.
    pub async fn spawn(
        config: AppServerProcessConfig,
        wire_log: Option<AppServerWireLog>,
    ) -> Result<(Self, AppServerInboundReceiver)> {
        let (program, args) = match config.program {
            Some(program) => (program, config.args),
            None => resolve_app_server_command()?,
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = config.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in config.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn app-server {}", program.display()))?;
        let stdin = child.stdin.take().context("app-server stdin missing")?;
        let stdout = child.stdout.take().context("app-server stdout missing")?;

        let (client, inbound) = Self::connect_with_io(Box::new(stdin), Box::new(stdout), wire_log);
        *client.process.lock().await = Some(child);
        Ok((client, inbound))
    }

    /// Newline-delimited JSON over an arbitrary byte stream pair.
    pub fn connect_with_io(
        writer: AppServerWriter,
        reader: AppServerReader,
        wire_log: Option<AppServerWireLog>,
    ) -> (Self, AppServerInboundReceiver) {
        let (transport, inbound) =
            AppServerTransport::new(FrameWriter::Lines(writer), wire_log, |dispatcher| {
                spawn_line_reader(reader, dispatcher)
            });
        (
            Self {
                transport,
                process: Mutex::new(None),
            },
            inbound,
        )
    }

    /// One JSON message per WebSocket text frame.
    pub async fn connect_websocket(
        url: &str,
        connect_timeout: Duration,
        wire_log: Option<AppServerWireLog>,
    ) -> Result<(Self, AppServerInboundReceiver)> {
        let parsed = Url::parse(url).with_context(|| format!("invalid app-server URL {url}"))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            anyhow::bail!(
                "app-server URL must use ws:// or wss://, got {}",
                parsed.scheme()
            );
        }

        let (stream, _response) = tokio::time::timeout(connect_timeout, connect_async(parsed.as_str()))
            .await
            .map_err(|_| anyhow::anyhow!("websocket connect to {url} timed out after {connect_timeout:?}"))?
            .with_context(|| format!("websocket connect to {url} failed"))?;
        let (sink, stream) = stream.split();
        let url_label = parsed.to_string();
        let (transport, inbound) =
            AppServerTransport::new(FrameWriter::WebSocket(sink), wire_log, |dispatcher| {
                spawn_websocket_reader(stream, dispatcher, url_label)
            });
        Ok((
            Self {
                transport,
                process: Mutex::new(None),
            },
            inbound,
        ))
    }

    /// Handshake: `initialize` followed by the `initialized` notification.
    pub async fn initialize<T>(&self, params: T) -> Result<InitializeResponse>
    where
        T: Into<InitializeParams>,
    {
        let params = params.into();
        let response = match self.transport.request("initialize", Some(&params)).await {
            Ok(response) => response,
            Err(err) if format!("{err}").contains("Already initialized") => {
                InitializeResponse::default()
            }
            Err(err) => return Err(err),
        };
        self.transport.notify::<Value>("initialized", None).await?;
        Ok(response)
    }

    pub async fn thread_start(&self, params: ThreadStartParams) -> Result<ThreadStartResponse> {
        self.transport.request("thread/start", Some(&params)).await
    }

    pub async fn thread_resume(&self, params: ThreadResumeParams) -> Result<ThreadResumeResponse> {
        self.transport.request("thread/resume", Some(&params)).await
    }

    pub async fn thread_fork(&self, params: ThreadForkParams) -> Result<ThreadForkResponse> {
        self.transport.request("thread/fork", Some(&params)).await
    }

    pub async fn thread_rollback(
        &self,
        params: ThreadRollbackParams,
    ) -> Result<ThreadRollbackResponse> {
        self.transport
            .request("thread/rollback", Some(&params))
            .await
    }

    pub async fn thread_archive(
        &self,
        params: ThreadArchiveParams,
    ) -> Result<ThreadArchiveResponse> {
        self.transport
            .request("thread/archive", Some(&params))
            .await
    }

    pub async fn thread_list(&self, params: ThreadListParams) -> Result<ThreadListResponse> {
        self.transport.request("thread/list", Some(&params)).await
    }

    pub async fn thread_name_set(
        &self,
        params: ThreadSetNameParams,
    ) -> Result<ThreadSetNameResponse> {
        self.transport
            .request("thread/name/set", Some(&params))
            .await
    }

    pub async fn turn_start(&self, params: TurnStartParams) -> Result<TurnStartResponse> {
        self.transport.request("turn/start", Some(&params)).await
    }

    pub async fn turn_interrupt(
        &self,
        params: TurnInterruptParams,
    ) -> Result<TurnInterruptResponse> {
        self.transport
            .request("turn/interrupt", Some(&params))
            .await
    }

    pub async fn account_read(&self, params: GetAccountParams) -> Result<GetAccountResponse> {
        self.transport.request("account/read", Some(&params)).await
    }

    /// Answer a server-initiated request.
    pub async fn respond<T>(&self, id: &AppServerRequestId, result: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.transport.respond(id, result).await
    }

    /// Close the connection, fail outstanding requests and stop a spawned process.
    pub async fn close(&self) {
        self.transport.close().await;
        if let Some(mut process) = self.process.lock().await.take() {
            let _ = process.kill().await;
            let _ = process.wait().await;
        }
    }
}

fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn env_program(name: &str) -> Option<PathBuf> {
    let value = env::var(name).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = PathBuf::from(trimmed);
    if candidate.is_file() {
        return Some(candidate);
    }
    which::which(trimmed).ok()
}

/// `CODEX_APP_SERVER`, then `codex-app-server` on `PATH`, then `CODEX_BIN`/`codex` with
/// the `app-server` subcommand.
fn resolve_app_server_command() -> Result<(PathBuf, Vec<String>)> {
    if let Some(program) = env_program("CODEX_APP_SERVER") {
        return Ok((program, Vec::new()));
    }
    if let Ok(program) = which::which("codex-app-server") {
        return Ok((program, Vec::new()));
    }
    let program = env_program("CODEX_BIN")
        .or_else(|| which::which("codex").ok())
        .context("codex executable not found")?;
    Ok((program, vec!["app-server".to_string()]))
}

/// Check if a local app-server can be spawned on this system.
pub fn is_codex_available() -> bool {
    resolve_app_server_command().is_ok()
}
