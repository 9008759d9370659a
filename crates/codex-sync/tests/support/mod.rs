//! Scripted in-memory app-servers for engine tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use codex_client::{AppServerClient, AppServerInboundReceiver, AppServerWireLog};
use codex_sync::{
    ConnectionTarget, Connector, RetryPolicy, ServerSource, ServerSpec, SyncConfig,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::mpsc;

pub enum Reply {
    Result(Value),
    Error(i64, String),
    /// Push these `(method, params)` notifications, then answer.
    NotifyThen(Vec<(String, Value)>, Value),
    /// Never answer.
    Silent,
}

type Script = dyn Fn(&str, &Value) -> Reply + Send + Sync;

enum Control {
    Frame(Value),
    Close,
}

struct MockInner {
    script: Box<Script>,
    refuse: AtomicUsize,
    opens: AtomicUsize,
    links: Mutex<Vec<mpsc::UnboundedSender<Control>>>,
    received: Mutex<Vec<Value>>,
}

/// One app-server; every `open` is a fresh connection to it.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<MockInner>,
}

/// Handshake and account replies shared by every script.
pub fn base_reply(method: &str) -> Reply {
    match method {
        "initialize" => Reply::Result(json!({"userAgent": "codex-mock/0.1"})),
        "account/read" => Reply::Result(json!({
            "account": {"type": "apiKey"},
            "requiresOpenaiAuth": true
        })),
        "thread/list" => Reply::Result(json!({"data": [], "nextCursor": null})),
        other => Reply::Error(-32601, format!("method not found: {other}")),
    }
}

impl MockServer {
    pub fn new(script: impl Fn(&str, &Value) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(MockInner {
                script: Box::new(script),
                refuse: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
                links: Mutex::new(Vec::new()),
                received: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn basic() -> Self {
        Self::new(|method, _| base_reply(method))
    }

    pub fn refuse_next(&self, count: usize) {
        self.inner.refuse.store(count, Ordering::SeqCst);
    }

    pub fn refuse_all(&self) {
        self.refuse_next(usize::MAX);
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    fn latest_link(&self) -> Option<mpsc::UnboundedSender<Control>> {
        self.inner
            .links
            .lock()
            .ok()
            .and_then(|links| links.last().cloned())
    }

    fn push(&self, control: Control) {
        if let Some(link) = self.latest_link() {
            let _ = link.send(control);
        }
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.push(Control::Frame(json!({"method": method, "params": params})));
    }

    pub fn request(&self, id: i64, method: &str, params: Value) {
        self.push(Control::Frame(json!({"id": id, "method": method, "params": params})));
    }

    /// Close the newest connection from the server side.
    pub fn drop_connection(&self) {
        self.push(Control::Close);
    }

    /// Params of every client request or notification with this method.
    pub fn received(&self, method: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|frame| frame.get("method").and_then(Value::as_str) == Some(method))
            .map(|frame| frame.get("params").cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Client responses to server-initiated requests.
    pub fn responses(&self) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|frame| frame.get("method").is_none())
            .collect()
    }

    fn frames(&self) -> Vec<Value> {
        self.inner
            .received
            .lock()
            .map(|frames| frames.clone())
            .unwrap_or_default()
    }

    fn take_refusal(&self) -> bool {
        self.inner
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                left => Some(left - 1),
            })
            .is_ok()
    }

    fn open_link(
        &self,
        wire_log: Option<AppServerWireLog>,
    ) -> anyhow::Result<(AppServerClient, AppServerInboundReceiver)> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        if self.take_refusal() {
            anyhow::bail!("connection refused");
        }
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        if let Ok(mut links) = self.inner.links.lock() {
            links.push(control_tx);
        }
        tokio::spawn(serve(Arc::clone(&self.inner), server_stream, control_rx));
        Ok(AppServerClient::connect_with_io(
            Box::new(client_write),
            Box::new(client_read),
            wire_log,
        ))
    }
}

#[async_trait]
impl Connector for MockServer {
    async fn open(
        &self,
        _target: &ConnectionTarget,
        wire_log: Option<AppServerWireLog>,
    ) -> anyhow::Result<(AppServerClient, AppServerInboundReceiver)> {
        self.open_link(wire_log)
    }
}

/// Several mock servers addressed by remote host.
pub struct MockFleet {
    servers: HashMap<String, MockServer>,
}

impl MockFleet {
    pub fn new<'a>(servers: impl IntoIterator<Item = (&'a str, MockServer)>) -> Self {
        Self {
            servers: servers
                .into_iter()
                .map(|(host, server)| (host.to_string(), server))
                .collect(),
        }
    }
}

#[async_trait]
impl Connector for MockFleet {
    async fn open(
        &self,
        target: &ConnectionTarget,
        wire_log: Option<AppServerWireLog>,
    ) -> anyhow::Result<(AppServerClient, AppServerInboundReceiver)> {
        let ConnectionTarget::Remote { host, .. } = target else {
            anyhow::bail!("fleet only serves remote targets");
        };
        let server = self
            .servers
            .get(host)
            .ok_or_else(|| anyhow::anyhow!("no route to {host}"))?;
        server.open_link(wire_log)
    }
}

async fn serve(
    inner: Arc<MockInner>,
    stream: DuplexStream,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(frame) = serde_json::from_str::<Value>(&line) else { continue };
                if let Ok(mut received) = inner.received.lock() {
                    received.push(frame.clone());
                }
                let (Some(id), Some(method)) =
                    (frame.get("id"), frame.get("method").and_then(Value::as_str))
                else {
                    continue;
                };
                let params = frame.get("params").cloned().unwrap_or(Value::Null);
                let frames = match (inner.script)(method, &params) {
                    Reply::Result(result) => vec![json!({"id": id, "result": result})],
                    Reply::Error(code, message) => {
                        vec![json!({"id": id, "error": {"code": code, "message": message}})]
                    }
                    Reply::NotifyThen(notices, result) => notices
                        .into_iter()
                        .map(|(method, params)| json!({"method": method, "params": params}))
                        .chain([json!({"id": id, "result": result})])
                        .collect(),
                    Reply::Silent => continue,
                };
                let mut failed = false;
                for frame in &frames {
                    if write_frame(&mut write, frame).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
            command = control.recv() => match command {
                Some(Control::Frame(frame)) => {
                    if write_frame(&mut write, &frame).await.is_err() {
                        break;
                    }
                }
                Some(Control::Close) | None => break,
            }
        }
    }
    let _ = write.shutdown().await;
}

async fn write_frame(write: &mut WriteHalf<DuplexStream>, value: &Value) -> anyhow::Result<()> {
    let line = format!("{}\n", serde_json::to_string(value)?);
    write.write_all(line.as_bytes()).await?;
    write.flush().await?;
    Ok(())
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        retry_delay_ms: 10,
        initialize_timeout_ms: 300,
        attempt_timeout_ms: 1_000,
    }
}

pub fn test_config(dir: &Path) -> SyncConfig {
    SyncConfig {
        local_retry: fast_retry(),
        remote_retry: fast_retry(),
        saved_servers_path: Some(dir.join("servers.json")),
        ..SyncConfig::default()
    }
}

pub fn remote_spec(id: &str, host: &str) -> ServerSpec {
    ServerSpec {
        id: id.to_string(),
        name: id.to_string(),
        source: ServerSource::Manual,
        target: ConnectionTarget::Remote {
            host: host.to_string(),
            port: 8390,
        },
    }
}

/// Poll until `condition` holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

pub fn turn(id: &str, user: &str, assistant: &str) -> Value {
    json!({
        "id": id,
        "items": [
            {"type": "userMessage", "id": format!("{id}-u"), "content": [{"type": "text", "text": user}]},
            {"type": "agentMessage", "id": format!("{id}-a"), "text": assistant}
        ]
    })
}
