//! The engine facade: servers, connections and the operations callers drive.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use codex_client::{
    AccountInfo, AppServerClient, AppServerInbound, AppServerRequestId, AppServerWireLog,
    ApprovalDecision, GetAccountParams,
};
use serde_json::json;
use tokio::sync::broadcast;

use crate::approvals::{self, ApprovalCorrelator, PendingApproval};
use crate::config::SyncConfig;
use crate::error::{OperationError, SyncError, SyncResult};
use crate::lifecycle::{SessionContext, SessionLifecycle};
use crate::model::{AuthStatus, ChatMessage, ServerSource, ServerState, ThreadKey};
use crate::persistence::{SavedServer, SavedServerStore};
use crate::reconcile::{Reconciler, SyncOutcome};
use crate::router::{NotificationRouter, RequestOutcome, RouteOutcome};
use crate::store::{StoreChange, ThreadStore};
use crate::supervisor::{
    AppServerConnector, ConnectionHandler, ConnectionRegistry, ConnectionSupervisor,
    ConnectionTarget, Connector,
};

const ACCOUNT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Server to connect, as supplied by discovery or manual entry.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub id: String,
    pub name: String,
    pub source: ServerSource,
    pub target: ConnectionTarget,
}

impl ServerSpec {
    /// `None` when the saved entry has no reachable target.
    pub fn from_saved(saved: &SavedServer) -> Option<Self> {
        Some(Self {
            id: saved.id.clone(),
            name: saved.name.clone(),
            source: saved.source,
            target: saved.target()?,
        })
    }

    fn saved(&self) -> SavedServer {
        let (hostname, port) = match &self.target {
            ConnectionTarget::Local(_) => ("localhost".to_string(), None),
            ConnectionTarget::Remote { host, port } => (host.clone(), Some(*port)),
            ConnectionTarget::Url(url) => split_ws_url(url),
        };
        SavedServer {
            id: self.id.clone(),
            name: self.name.clone(),
            hostname,
            port,
            source: self.source,
            has_codex_server: true,
        }
    }
}

fn split_ws_url(url: &str) -> (String, Option<u16>) {
    let rest = url
        .trim()
        .trim_start_matches("ws://")
        .trim_start_matches("wss://");
    let authority = rest.split('/').next().unwrap_or_default();
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.trim_matches(['[', ']']).to_string(), Some(port)),
            Err(_) => (authority.to_string(), None),
        },
        None => (authority.to_string(), None),
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: SyncConfig,
    store: ThreadStore,
    approvals: ApprovalCorrelator,
    router: NotificationRouter,
    connections: ConnectionRegistry,
    lifecycle: SessionLifecycle,
    reconciler: Reconciler,
    connector: Arc<dyn Connector>,
    saved: Mutex<SavedServerStore>,
    wire_log: Option<AppServerWireLog>,
}

impl SyncEngine {
    /// Must be called inside a tokio runtime when a wire log is configured.
    pub fn new(config: SyncConfig) -> Self {
        let connector = Arc::new(AppServerConnector {
            websocket_timeout: config.websocket_connect_timeout(),
        });
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: SyncConfig, connector: Arc<dyn Connector>) -> Self {
        let store = ThreadStore::new();
        let approvals = ApprovalCorrelator::new(store.change_sender());
        let connections = ConnectionRegistry::new();
        let saved = match &config.saved_servers_path {
            Some(path) => SavedServerStore::load(path.clone()),
            None => SavedServerStore::load_default(),
        };
        let wire_log = config.wire_log_path.clone().map(AppServerWireLog::new);

        let inner = EngineInner {
            router: NotificationRouter::new(store.clone(), approvals.clone()),
            lifecycle: SessionLifecycle::new(store.clone(), connections.clone()),
            reconciler: Reconciler::new(store.clone(), connections.clone(), config.prefer_local),
            config,
            store,
            approvals,
            connections,
            connector,
            saved: Mutex::new(saved),
            wire_log,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ThreadStore {
        &self.inner.store
    }

    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.inner.lifecycle
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.store.subscribe()
    }

    /// Defaults from config plus the current active thread.
    pub fn context(&self) -> SessionContext {
        let active = self.inner.store.active_thread();
        SessionContext {
            active_thread: active.as_ref().map(|thread| thread.key.clone()),
            cwd: active
                .as_ref()
                .map(|thread| thread.cwd.clone())
                .filter(|cwd| !cwd.is_empty()),
            model: None,
            approval_policy: self.inner.config.default_approval_policy,
            sandbox_mode: self.inner.config.default_sandbox_mode,
            effort: None,
        }
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.inner.approvals.pending()
    }

    pub fn saved_servers(&self) -> Vec<SavedServer> {
        self.inner.saved().servers().to_vec()
    }

    /// Register the server and run one connect cycle for it.
    pub async fn add_server(&self, spec: ServerSpec) -> SyncResult<()> {
        let inner = &self.inner;
        inner
            .store
            .insert_server(ServerState::new(&spec.id, &spec.name, spec.source));

        let policy = if spec.target.is_local() {
            inner.config.local_retry
        } else {
            inner.config.remote_retry
        };
        let supervisor = Arc::new(ConnectionSupervisor::new(
            spec.id.clone(),
            spec.target.clone(),
            policy,
            inner.config.client_info(),
            Arc::clone(&inner.connector),
            inner.store.clone(),
            inner.wire_log.clone(),
        ));
        if let Some(previous) = inner.connections.insert(Arc::clone(&supervisor)).await {
            previous.disconnect().await;
            inner.approvals.remove_server(&spec.id);
            inner.router.forget_server(&spec.id);
        }

        let ready = supervisor.connect().await?;
        let client = Arc::clone(&ready.client);
        let handler: Arc<dyn ConnectionHandler> = Arc::clone(&self.inner) as Arc<dyn ConnectionHandler>;
        supervisor.spawn_observer(ready, handler);
        refresh_auth(&inner.store, &spec.id, &client).await;

        if let Err(err) = inner.saved().upsert(spec.saved()) {
            tracing::warn!(server_id = %spec.id, error = %err, "saving server failed");
        }
        Ok(())
    }

    /// Forget the server entirely: connection, threads, approvals and saved entry.
    pub async fn remove_server(&self, server_id: &str) -> SyncResult<()> {
        let inner = &self.inner;
        if let Some(supervisor) = inner.connections.remove(server_id).await {
            supervisor.disconnect().await;
        }
        inner.approvals.remove_server(server_id);
        inner.router.forget_server(server_id);
        inner.store.remove_server(server_id);
        inner.saved().remove(server_id).map(|_| ())
    }

    /// Close the connection but keep the server and its threads.
    pub async fn disconnect(&self, server_id: &str) {
        if let Some(supervisor) = self.inner.connections.get(server_id).await {
            supervisor.disconnect().await;
        }
        self.inner.approvals.remove_server(server_id);
        self.inner.router.forget_server(server_id);
    }

    pub async fn shutdown(&self) {
        for server_id in self.inner.connections.server_ids().await {
            self.disconnect(&server_id).await;
        }
    }

    /// Connect every saved server concurrently; returns how many came up.
    pub async fn reconnect_all(&self) -> usize {
        let specs: Vec<ServerSpec> = self
            .saved_servers()
            .iter()
            .filter_map(ServerSpec::from_saved)
            .collect();
        let attempts = specs.into_iter().map(|spec| async move {
            let server_id = spec.id.clone();
            match self.add_server(spec).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(server_id = %server_id, error = %err, "saved server reconnect failed");
                    false
                }
            }
        });
        futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|connected| *connected)
            .count()
    }

    /// Send the decision in the request's own vocabulary; the approval is dropped once sent.
    pub async fn respond_to_approval(
        &self,
        server_id: &str,
        request_id: &AppServerRequestId,
        decision: ApprovalDecision,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        let approval = inner
            .approvals
            .get(server_id, request_id)
            .ok_or_else(|| OperationError::UnknownApproval(request_id.to_string()))?;
        let client = inner
            .connections
            .client(server_id)
            .await
            .ok_or_else(|| OperationError::NoConnection(server_id.to_string()))?;
        let payload = approvals::wire_decision(&approval.method, decision);
        client
            .respond(request_id, &payload)
            .await
            .map_err(|err| SyncError::from_rpc(&err))?;
        inner.approvals.remove(server_id, request_id);
        tracing::info!(server_id, request_id = %request_id, ?decision, "approval answered");
        Ok(())
    }

    pub async fn sync_thread(&self, key: &ThreadKey) -> SyncResult<SyncOutcome> {
        self.inner.reconciler.sync_thread_from_server(key).await
    }

    pub async fn sync_active_thread(&self) -> SyncResult<SyncOutcome> {
        let key = self
            .inner
            .store
            .active_key()
            .ok_or(OperationError::NoActiveThread)?;
        self.sync_thread(&key).await
    }

    pub async fn start_thread(&self, server_id: &str, ctx: &SessionContext) -> SyncResult<ThreadKey> {
        self.inner.lifecycle.start_thread(server_id, ctx).await
    }

    pub async fn resume_thread(&self, key: &ThreadKey, ctx: &SessionContext) -> SyncResult<()> {
        self.inner.lifecycle.resume_thread(key, ctx).await
    }

    pub async fn fork_thread(&self, source: &ThreadKey, ctx: &SessionContext) -> SyncResult<ThreadKey> {
        self.inner.lifecycle.fork_thread(source, ctx).await
    }

    pub async fn fork_from_message(
        &self,
        message: &ChatMessage,
        ctx: &SessionContext,
    ) -> SyncResult<ThreadKey> {
        self.inner.lifecycle.fork_from_message(message, ctx).await
    }

    pub async fn edit_message(&self, message: &ChatMessage, ctx: &SessionContext) -> SyncResult<String> {
        self.inner.lifecycle.edit_message(message, ctx).await
    }

    pub async fn archive_thread(&self, key: &ThreadKey) -> SyncResult<()> {
        self.inner.lifecycle.archive_thread(key).await
    }

    pub async fn interrupt(&self, ctx: &SessionContext) -> SyncResult<()> {
        self.inner.lifecycle.interrupt(ctx).await
    }

    pub async fn send_message(&self, ctx: &SessionContext, text: &str) -> SyncResult<ThreadKey> {
        self.inner.lifecycle.send_message(ctx, text).await
    }

    pub async fn rename_thread(&self, key: &ThreadKey, name: &str) -> SyncResult<()> {
        self.inner.lifecycle.rename_thread(key, name).await
    }

    pub async fn view_thread(&self, key: &ThreadKey, ctx: &SessionContext) -> SyncResult<()> {
        self.inner.lifecycle.view_thread(key, ctx).await
    }

    pub async fn refresh_sessions(&self, server_id: &str) -> SyncResult<usize> {
        self.inner.lifecycle.refresh_sessions(server_id).await
    }

    pub async fn refresh_all_sessions(&self) -> usize {
        self.inner.lifecycle.refresh_all_sessions().await
    }
}

impl EngineInner {
    fn saved(&self) -> MutexGuard<'_, SavedServerStore> {
        match self.saved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn refresh_auth(store: &ThreadStore, server_id: &str, client: &AppServerClient) {
    let read = tokio::time::timeout(
        ACCOUNT_READ_TIMEOUT,
        client.account_read(GetAccountParams {
            refresh_token: false,
        }),
    )
    .await
    .map_err(|_| anyhow::anyhow!("account/read timed out"))
    .and_then(|result| result);
    let auth = match read {
        Ok(response) => match response.account {
            Some(AccountInfo::ApiKey) => AuthStatus::ApiKey,
            Some(AccountInfo::Chatgpt { email, .. }) => AuthStatus::Chatgpt { email },
            None if response.requires_openai_auth => AuthStatus::NotLoggedIn,
            None => AuthStatus::Unknown,
        },
        Err(err) => {
            tracing::debug!(server_id, error = %err, "account/read failed");
            AuthStatus::Unknown
        }
    };
    store.update_server(server_id, |server| server.auth = auth);
}

#[async_trait]
impl ConnectionHandler for EngineInner {
    async fn on_inbound(
        &self,
        server_id: &str,
        client: &Arc<AppServerClient>,
        inbound: AppServerInbound,
    ) {
        match inbound {
            AppServerInbound::Notification(notification) => {
                let outcome =
                    self.router
                        .route(server_id, &notification.method, notification.params.as_ref());
                match outcome {
                    RouteOutcome::Reconcile(key) => {
                        let reconciler = self.reconciler.clone();
                        tokio::spawn(async move {
                            if let Err(err) = reconciler.sync_thread_from_server(&key).await {
                                tracing::warn!(
                                    server_id = %key.server_id,
                                    thread_id = %key.thread_id,
                                    error = %err,
                                    "resync after turn failed"
                                );
                            }
                        });
                    }
                    RouteOutcome::AccountChanged => {
                        let store = self.store.clone();
                        let server_id = server_id.to_string();
                        let client = Arc::clone(client);
                        tokio::spawn(async move {
                            refresh_auth(&store, &server_id, &client).await;
                        });
                    }
                    RouteOutcome::Applied | RouteOutcome::Ignored => {}
                }
            }
            AppServerInbound::Request(request) => {
                match self.router.route_request(server_id, &request) {
                    RequestOutcome::Pending(_) | RequestOutcome::Duplicate => {}
                    RequestOutcome::AnswerDefault => {
                        tracing::debug!(server_id, method = %request.method, "answering server request with empty result");
                        if let Err(err) = client.respond(&request.id, &json!({})).await {
                            tracing::warn!(server_id, error = %err, "server request response failed");
                        }
                    }
                }
            }
        }
    }

    async fn on_disconnect(&self, server_id: &str) {
        let dropped = self.approvals.remove_server(server_id);
        self.router.forget_server(server_id);
        tracing::info!(server_id, dropped_approvals = dropped, "server connection lost");
    }

    async fn on_reconnected(&self, server_id: &str, client: &Arc<AppServerClient>) {
        refresh_auth(&self.store, server_id, client).await;
    }
}
