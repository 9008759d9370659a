//! Connect/handshake/retry for one server, plus the drop observer that resumes it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use codex_client::{
    AppServerClient, AppServerInbound, AppServerInboundReceiver, AppServerProcessConfig,
    AppServerWireLog, ClientInfo,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::RetryPolicy;
use crate::error::{SyncError, SyncResult};
use crate::store::ThreadStore;

/// Where a server's app-server can be reached.
#[derive(Debug, Clone)]
pub enum ConnectionTarget {
    /// Spawned locally, spoken to over stdio.
    Local(AppServerProcessConfig),
    Remote { host: String, port: u16 },
    Url(String),
}

impl ConnectionTarget {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// WebSocket URL for remote targets.
    pub fn websocket_url(&self) -> Option<String> {
        match self {
            Self::Local(_) => None,
            Self::Url(url) => Some(url.clone()),
            Self::Remote { host, port } => {
                let host = host.trim();
                let host = if host.parse::<IpAddr>().is_ok_and(|ip| ip.is_ipv6()) {
                    format!("[{host}]")
                } else {
                    host.to_string()
                };
                Some(format!("ws://{host}:{port}"))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Local(config) => match &config.program {
                Some(program) => format!("local {}", program.display()),
                None => "local app-server".to_string(),
            },
            other => other.websocket_url().unwrap_or_default(),
        }
    }
}

/// Opens a transport for a target. Swapped out in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        target: &ConnectionTarget,
        wire_log: Option<AppServerWireLog>,
    ) -> anyhow::Result<(AppServerClient, AppServerInboundReceiver)>;
}

pub struct AppServerConnector {
    pub websocket_timeout: Duration,
}

#[async_trait]
impl Connector for AppServerConnector {
    async fn open(
        &self,
        target: &ConnectionTarget,
        wire_log: Option<AppServerWireLog>,
    ) -> anyhow::Result<(AppServerClient, AppServerInboundReceiver)> {
        match target {
            ConnectionTarget::Local(config) => AppServerClient::spawn(config.clone(), wire_log).await,
            ConnectionTarget::Remote { .. } | ConnectionTarget::Url(_) => {
                let url = target
                    .websocket_url()
                    .ok_or_else(|| anyhow::anyhow!("no websocket url for {}", target.describe()))?;
                AppServerClient::connect_websocket(&url, self.websocket_timeout, wire_log).await
            }
        }
    }
}

/// An initialized connection and the inbound stream that belongs to it.
pub struct ReadyConnection {
    pub client: Arc<AppServerClient>,
    pub inbound: AppServerInboundReceiver,
    pub user_agent: String,
}

/// Callbacks driven by the observer task, in wire order.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn on_inbound(
        &self,
        server_id: &str,
        client: &Arc<AppServerClient>,
        inbound: AppServerInbound,
    );

    /// The connection dropped while it was marked connected.
    async fn on_disconnect(&self, server_id: &str);

    async fn on_reconnected(&self, server_id: &str, client: &Arc<AppServerClient>);
}

pub struct ConnectionSupervisor {
    server_id: String,
    target: ConnectionTarget,
    policy: RetryPolicy,
    client_info: ClientInfo,
    connector: Arc<dyn Connector>,
    store: ThreadStore,
    wire_log: Option<AppServerWireLog>,
    client: RwLock<Option<Arc<AppServerClient>>>,
    connected: AtomicBool,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        server_id: impl Into<String>,
        target: ConnectionTarget,
        policy: RetryPolicy,
        client_info: ClientInfo,
        connector: Arc<dyn Connector>,
        store: ThreadStore,
        wire_log: Option<AppServerWireLog>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            target,
            policy,
            client_info,
            connector,
            store,
            wire_log,
            client: RwLock::new(None),
            connected: AtomicBool::new(false),
            observer: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The live client, only while connected.
    pub async fn client(&self) -> Option<Arc<AppServerClient>> {
        if !self.is_connected() {
            return None;
        }
        self.client.read().await.clone()
    }

    fn publish_phase(&self, phase: String, connected: bool) {
        self.store.update_server(&self.server_id, |server| {
            server.phase = phase;
            server.connected = connected;
        });
    }

    /// Up to `max_attempts` open+initialize attempts; the last error is returned on exhaustion.
    pub async fn connect(&self) -> SyncResult<ReadyConnection> {
        let max_attempts = self.policy.max_attempts.max(1);
        self.publish_phase("start".to_string(), false);
        let mut last_error = String::from("no connection attempt made");

        for attempt in 1..=max_attempts {
            self.publish_phase(format!("attempt {attempt}/{max_attempts}"), false);
            tracing::debug!(
                server_id = %self.server_id,
                attempt,
                max_attempts,
                target = %self.target.describe(),
                "connecting to app-server"
            );

            let outcome = tokio::time::timeout(self.policy.attempt_timeout(), self.attempt()).await;
            match outcome {
                Ok(Ok((client, inbound, user_agent))) => {
                    let client = Arc::new(client);
                    *self.client.write().await = Some(Arc::clone(&client));
                    self.connected.store(true, Ordering::SeqCst);
                    self.publish_phase("ready".to_string(), true);
                    let agent = (!user_agent.is_empty()).then(|| user_agent.clone());
                    self.store.update_server(&self.server_id, |server| {
                        server.user_agent = agent;
                    });
                    tracing::info!(server_id = %self.server_id, attempt, "app-server connected");
                    return Ok(ReadyConnection {
                        client,
                        inbound,
                        user_agent,
                    });
                }
                Ok(Err(err)) => {
                    last_error = format!("{err:#}");
                }
                Err(_) => {
                    last_error = format!(
                        "connection attempt timed out after {:?}",
                        self.policy.attempt_timeout()
                    );
                }
            }
            tracing::warn!(
                server_id = %self.server_id,
                attempt,
                max_attempts,
                error = %last_error,
                "app-server connection attempt failed"
            );
            if attempt < max_attempts {
                tokio::time::sleep(self.policy.retry_delay()).await;
            }
        }

        self.publish_phase(format!("error: {last_error}"), false);
        Err(SyncError::Connection(last_error))
    }

    async fn attempt(&self) -> anyhow::Result<(AppServerClient, AppServerInboundReceiver, String)> {
        let (client, inbound) = self
            .connector
            .open(&self.target, self.wire_log.clone())
            .await?;
        let handshake = tokio::time::timeout(
            self.policy.initialize_timeout(),
            client.initialize(self.client_info.clone()),
        )
        .await;
        match handshake {
            Ok(Ok(response)) => Ok((client, inbound, response.user_agent)),
            Ok(Err(err)) => {
                client.close().await;
                Err(err.context("initialize failed"))
            }
            Err(_) => {
                client.close().await;
                Err(anyhow::anyhow!(
                    "initialize timed out after {:?}",
                    self.policy.initialize_timeout()
                ))
            }
        }
    }

    /// Flip connected to disconnected; `false` when the drop was already handled or requested.
    fn mark_dropped(&self) -> bool {
        self.connected
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Pump inbound traffic into `handler`; after an unexpected drop run one connect cycle.
    pub fn spawn_observer(self: &Arc<Self>, ready: ReadyConnection, handler: Arc<dyn ConnectionHandler>) {
        let supervisor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ready = ready;
            loop {
                let ReadyConnection {
                    client, mut inbound, ..
                } = ready;
                while let Some(message) = inbound.recv().await {
                    handler
                        .on_inbound(&supervisor.server_id, &client, message)
                        .await;
                }

                if !supervisor.mark_dropped() {
                    return;
                }
                tracing::warn!(server_id = %supervisor.server_id, "app-server connection dropped");
                supervisor.publish_phase("disconnected".to_string(), false);
                *supervisor.client.write().await = None;
                handler.on_disconnect(&supervisor.server_id).await;

                match supervisor.connect().await {
                    Ok(next) => {
                        handler
                            .on_reconnected(&supervisor.server_id, &next.client)
                            .await;
                        ready = next;
                    }
                    Err(err) => {
                        tracing::warn!(
                            server_id = %supervisor.server_id,
                            error = %err,
                            "app-server reconnect gave up"
                        );
                        return;
                    }
                }
            }
        });

        let previous = match self.observer.lock() {
            Ok(mut guard) => guard.replace(task),
            Err(poisoned) => poisoned.into_inner().replace(task),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Explicit shutdown; cancels any background reconnect.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let observer = match self.observer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(observer) = observer {
            observer.abort();
        }
        let client = self.client.write().await.take();
        if let Some(client) = client {
            client.close().await;
        }
        self.publish_phase("disconnected".to_string(), false);
        tracing::info!(server_id = %self.server_id, "app-server disconnected");
    }
}

/// Supervisors keyed by server id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    supervisors: Arc<RwLock<HashMap<String, Arc<ConnectionSupervisor>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the supervisor previously registered under the same id.
    pub async fn insert(&self, supervisor: Arc<ConnectionSupervisor>) -> Option<Arc<ConnectionSupervisor>> {
        self.supervisors
            .write()
            .await
            .insert(supervisor.server_id().to_string(), supervisor)
    }

    pub async fn remove(&self, server_id: &str) -> Option<Arc<ConnectionSupervisor>> {
        self.supervisors.write().await.remove(server_id)
    }

    pub async fn get(&self, server_id: &str) -> Option<Arc<ConnectionSupervisor>> {
        self.supervisors.read().await.get(server_id).cloned()
    }

    pub async fn client(&self, server_id: &str) -> Option<Arc<AppServerClient>> {
        let supervisor = self.get(server_id).await?;
        supervisor.client().await
    }

    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.supervisors.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn connected_server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .supervisors
            .read()
            .await
            .values()
            .filter(|supervisor| supervisor.is_connected())
            .map(|supervisor| supervisor.server_id().to_string())
            .collect();
        ids.sort();
        ids
    }
}
