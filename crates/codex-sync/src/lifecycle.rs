//! Start, resume, fork, rollback, archive and turn operations against one server.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use codex_client::{
    AppServerClient, AskForApproval, SandboxMode, ThreadArchiveParams, ThreadForkParams,
    ThreadListParams, ThreadResumeParams, ThreadRollbackParams, ThreadSetNameParams,
    ThreadSnapshot, ThreadStartParams, TurnInterruptParams, TurnStartParams, UserInput,
};

use crate::error::{OperationError, SyncError, SyncResult};
use crate::items;
use crate::model::{ChatMessage, ThreadKey, ThreadState, ThreadStatus};
use crate::store::ThreadStore;
use crate::supervisor::ConnectionRegistry;

const DEFAULT_SANDBOX: SandboxMode = SandboxMode::WorkspaceWrite;
const FALLBACK_SANDBOX: SandboxMode = SandboxMode::DangerFullAccess;
const SANDBOX_ERROR_MARKERS: [&str; 2] = [
    "codex-linux-sandbox was required but not provided",
    "missing codex-linux-sandbox executable path",
];
const THREAD_LIST_PAGE_SIZE: u32 = 50;
const THREAD_LIST_MAX_PAGES: usize = 20;

/// Explicit per-call context in place of ambient UI state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// Overrides the store's active thread when set.
    pub active_thread: Option<ThreadKey>,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub approval_policy: AskForApproval,
    /// `None` lets the sandbox fallback kick in.
    pub sandbox_mode: Option<SandboxMode>,
    pub effort: Option<String>,
}

/// Trailing turns to drop so the message's turn becomes the last one.
pub fn rollback_depth(message: &ChatMessage, turn_count: usize) -> Result<u32, OperationError> {
    let index = message
        .source_turn_index
        .ok_or(OperationError::MissingTurnProvenance)?;
    if turn_count == 0 {
        return Err(OperationError::NoTurns);
    }
    if index >= turn_count {
        return Err(OperationError::TurnIndexOutOfRange { index, turn_count });
    }
    Ok(u32::try_from(turn_count - index - 1).unwrap_or(u32::MAX))
}

pub(crate) fn is_sandbox_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}").to_ascii_lowercase();
    SANDBOX_ERROR_MARKERS
        .iter()
        .any(|marker| text.contains(marker))
}

/// Run `call` with the requested sandbox; when none was requested and the server cannot
/// provide the default one, retry once with the relaxed mode.
async fn with_sandbox_fallback<T, F, Fut>(requested: Option<SandboxMode>, mut call: F) -> SyncResult<T>
where
    F: FnMut(SandboxMode) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let first = requested.unwrap_or(DEFAULT_SANDBOX);
    match call(first).await {
        Ok(value) => Ok(value),
        Err(err) if requested.is_none() && is_sandbox_error(&err) => {
            tracing::warn!(
                error = %err,
                fallback = FALLBACK_SANDBOX.as_str(),
                "sandbox unavailable on server, retrying with relaxed sandbox"
            );
            call(FALLBACK_SANDBOX)
                .await
                .map_err(|err| SyncError::from_rpc(&err))
        }
        Err(err) => Err(SyncError::from_rpc(&err)),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Install an authoritative snapshot as the thread's timeline.
fn install_snapshot(thread: &mut ThreadState, snapshot: &ThreadSnapshot) {
    thread.replace_messages(items::restore_messages(&snapshot.turns));
    thread.turn_count = snapshot.turns.len();
    thread.active_turn_id = None;
    let fallback = if snapshot.preview.trim().is_empty() {
        thread.preview.clone()
    } else {
        snapshot.preview.trim().to_string()
    };
    thread.preview = items::derive_preview(&thread.messages, &fallback);
}

#[derive(Clone)]
pub struct SessionLifecycle {
    store: ThreadStore,
    connections: ConnectionRegistry,
}

impl SessionLifecycle {
    pub fn new(store: ThreadStore, connections: ConnectionRegistry) -> Self {
        Self { store, connections }
    }

    async fn require_client(&self, server_id: &str) -> SyncResult<Arc<AppServerClient>> {
        self.connections
            .client(server_id)
            .await
            .ok_or_else(|| OperationError::NoConnection(server_id.to_string()).into())
    }

    fn require_thread(&self, key: &ThreadKey) -> SyncResult<ThreadState> {
        self.store
            .get(key)
            .ok_or_else(|| OperationError::UnknownThread(key.to_string()).into())
    }

    fn active_key(&self, ctx: &SessionContext) -> SyncResult<ThreadKey> {
        ctx.active_thread
            .clone()
            .or_else(|| self.store.active_key())
            .ok_or_else(|| OperationError::NoActiveThread.into())
    }

    pub async fn start_thread(&self, server_id: &str, ctx: &SessionContext) -> SyncResult<ThreadKey> {
        let cwd = non_empty(ctx.cwd.as_deref()).ok_or(OperationError::EmptyField("cwd"))?;
        let client = self.require_client(server_id).await?;

        let response = with_sandbox_fallback(ctx.sandbox_mode, |sandbox| {
            let client = Arc::clone(&client);
            let params = ThreadStartParams {
                model: ctx.model.clone(),
                cwd: Some(cwd.clone()),
                approval_policy: Some(ctx.approval_policy),
                sandbox: Some(sandbox),
            };
            async move { client.thread_start(params).await }
        })
        .await?;

        let key = ThreadKey::new(server_id, response.thread.id);
        self.store.upsert(&key, |thread| {
            thread.replace_messages(Vec::new());
            thread.status = ThreadStatus::Ready;
            thread.cwd.clone_from(&cwd);
            thread.model.clone_from(&response.model);
            thread.model_provider = response.model_provider.clone().unwrap_or_default();
            thread.turn_count = 0;
            thread.active_turn_id = None;
            thread.set_lineage(None, None);
        });
        self.store.set_active(Some(key.clone()));
        tracing::info!(server_id, thread_id = %key.thread_id, cwd = %cwd, "thread started");
        Ok(key)
    }

    pub async fn resume_thread(&self, key: &ThreadKey, ctx: &SessionContext) -> SyncResult<()> {
        let client = self.require_client(&key.server_id).await?;
        let cwd = non_empty(ctx.cwd.as_deref()).or_else(|| {
            self.store
                .get(key)
                .and_then(|thread| non_empty(Some(&thread.cwd)))
        });
        self.store.upsert(key, |thread| {
            if !thread.has_turn_active() {
                thread.status = ThreadStatus::Connecting;
            }
        });

        let resumed = with_sandbox_fallback(ctx.sandbox_mode, |sandbox| {
            let client = Arc::clone(&client);
            let params = ThreadResumeParams {
                thread_id: key.thread_id.clone(),
                model: ctx.model.clone(),
                cwd: cwd.clone(),
                approval_policy: Some(ctx.approval_policy),
                sandbox: Some(sandbox),
            };
            async move { client.thread_resume(params).await }
        })
        .await;
        let response = match resumed {
            Ok(response) => response,
            Err(err) => {
                let reason = err.reason();
                self.store.update(key, |thread| thread.status = ThreadStatus::Error(reason));
                return Err(err);
            }
        };

        self.store.upsert(key, |thread| {
            install_snapshot(thread, &response.thread);
            thread.status = ThreadStatus::Ready;
            thread.set_lineage(response.thread.lineage.parent(), response.thread.lineage.root());
            if let Some(cwd) = non_empty(response.cwd.as_deref()).or_else(|| cwd.clone()) {
                thread.cwd = cwd;
            }
            if !response.model.is_empty() {
                thread.model.clone_from(&response.model);
            }
            if let Some(provider) = non_empty(response.model_provider.as_deref()) {
                thread.model_provider = provider;
            }
        });
        self.store.set_active(Some(key.clone()));
        tracing::info!(
            server_id = %key.server_id,
            thread_id = %key.thread_id,
            turns = response.thread.turns.len(),
            "thread resumed"
        );
        Ok(())
    }

    pub async fn fork_thread(&self, source: &ThreadKey, ctx: &SessionContext) -> SyncResult<ThreadKey> {
        let source_thread = self.require_thread(source)?;
        if source_thread.has_turn_active() {
            return Err(OperationError::TurnActive.into());
        }
        let client = self.require_client(&source.server_id).await?;
        let cwd = non_empty(ctx.cwd.as_deref()).or_else(|| non_empty(Some(&source_thread.cwd)));

        let response = client
            .thread_fork(ThreadForkParams {
                thread_id: source.thread_id.clone(),
                model: ctx.model.clone(),
                cwd: cwd.clone(),
                approval_policy: Some(ctx.approval_policy),
                sandbox: ctx.sandbox_mode,
            })
            .await
            .map_err(|err| SyncError::from_rpc(&err))?;

        let key = ThreadKey::new(&source.server_id, response.thread.id.clone());
        let root = source_thread
            .root_thread_id
            .clone()
            .unwrap_or_else(|| source.thread_id.clone());
        self.store.upsert(&key, |thread| {
            install_snapshot(thread, &response.thread);
            thread.status = ThreadStatus::Ready;
            thread.set_lineage(Some(&source.thread_id), Some(&root));
            thread.cwd = non_empty(response.cwd.as_deref())
                .or(cwd)
                .unwrap_or_default();
            thread.model = if response.model.is_empty() {
                source_thread.model.clone()
            } else {
                response.model.clone()
            };
            thread.model_provider = non_empty(response.model_provider.as_deref())
                .unwrap_or_else(|| source_thread.model_provider.clone());
        });
        self.store.set_active(Some(key.clone()));
        tracing::info!(
            server_id = %source.server_id,
            source_thread_id = %source.thread_id,
            thread_id = %key.thread_id,
            "thread forked"
        );
        Ok(key)
    }

    /// Fork the active thread and roll the fork back to the message's turn.
    pub async fn fork_from_message(
        &self,
        message: &ChatMessage,
        ctx: &SessionContext,
    ) -> SyncResult<ThreadKey> {
        if !message.is_turn_boundary() {
            return Err(OperationError::NotTurnBoundary.into());
        }
        let source = self.active_key(ctx)?;
        let source_thread = self.require_thread(&source)?;
        if source_thread.has_turn_active() {
            return Err(OperationError::TurnActive.into());
        }
        rollback_depth(message, source_thread.turn_count)?;

        let fork = self.fork_thread(&source, ctx).await?;
        let fork_turns = self.store.get(&fork).map_or(0, |thread| thread.turn_count);
        let depth = rollback_depth(message, fork_turns)?;
        if depth > 0 {
            self.rollback(&fork, depth).await?;
        }
        Ok(fork)
    }

    /// Roll the active thread back to the message's turn and hand back its text for re-sending.
    pub async fn edit_message(&self, message: &ChatMessage, ctx: &SessionContext) -> SyncResult<String> {
        if !message.is_turn_boundary() {
            return Err(OperationError::NotTurnBoundary.into());
        }
        let key = self.active_key(ctx)?;
        let thread = self.require_thread(&key)?;
        if thread.has_turn_active() {
            return Err(OperationError::TurnActive.into());
        }
        let depth = rollback_depth(message, thread.turn_count)?;
        if depth > 0 {
            self.rollback(&key, depth).await?;
        }
        Ok(message.text.clone())
    }

    pub async fn rollback(&self, key: &ThreadKey, num_turns: u32) -> SyncResult<()> {
        let client = self.require_client(&key.server_id).await?;
        let response = client
            .thread_rollback(ThreadRollbackParams {
                thread_id: key.thread_id.clone(),
                num_turns,
            })
            .await
            .map_err(|err| SyncError::from_rpc(&err))?;
        self.store.upsert(key, |thread| {
            install_snapshot(thread, &response.thread);
            thread.status = ThreadStatus::Ready;
        });
        tracing::info!(
            server_id = %key.server_id,
            thread_id = %key.thread_id,
            num_turns,
            remaining = response.thread.turns.len(),
            "thread rolled back"
        );
        Ok(())
    }

    pub async fn archive_thread(&self, key: &ThreadKey) -> SyncResult<()> {
        let client = self.require_client(&key.server_id).await?;
        client
            .thread_archive(ThreadArchiveParams {
                thread_id: key.thread_id.clone(),
            })
            .await
            .map_err(|err| SyncError::from_rpc(&err))?;

        let was_active = self.store.active_key().as_ref() == Some(key);
        self.store.remove(key);
        if was_active {
            let next = self.store.sorted_threads().into_iter().next().map(|thread| thread.key);
            self.store.set_active(next);
        }
        tracing::info!(server_id = %key.server_id, thread_id = %key.thread_id, "thread archived");
        Ok(())
    }

    /// Optimistic: the thread is marked ready without waiting for the turn to end.
    pub async fn interrupt(&self, ctx: &SessionContext) -> SyncResult<()> {
        let key = self.active_key(ctx)?;
        let thread = self.require_thread(&key)?;
        let client = self.require_client(&key.server_id).await?;
        client
            .turn_interrupt(TurnInterruptParams {
                thread_id: key.thread_id.clone(),
                turn_id: thread.active_turn_id.clone(),
            })
            .await
            .map_err(|err| SyncError::from_rpc(&err))?;
        self.store.update(&key, |thread| {
            thread.status = ThreadStatus::Ready;
            thread.active_turn_id = None;
        });
        Ok(())
    }

    /// Send user text on the active thread, starting one on the first connected server if needed.
    pub async fn send_message(&self, ctx: &SessionContext, text: &str) -> SyncResult<ThreadKey> {
        let text = text.trim();
        if text.is_empty() {
            return Err(OperationError::EmptyField("message").into());
        }
        let key = match ctx.active_thread.clone().or_else(|| self.store.active_key()) {
            Some(key) => key,
            None => {
                let server_id = self
                    .connections
                    .connected_server_ids()
                    .await
                    .into_iter()
                    .next()
                    .ok_or_else(|| OperationError::NoConnection("any server".to_string()))?;
                self.start_thread(&server_id, ctx).await?
            }
        };
        let thread = self.require_thread(&key)?;
        if thread.has_turn_active() {
            return Err(OperationError::TurnActive.into());
        }
        let client = self.require_client(&key.server_id).await?;

        // Recorded before the request so streamed replies land after it.
        let turn_index = thread.turn_count;
        self.store.upsert(&key, |thread| {
            thread
                .messages
                .push(ChatMessage::user(text).with_turn(None, turn_index));
            thread.status = ThreadStatus::Thinking;
            thread.touch();
        });

        let cwd = non_empty(ctx.cwd.as_deref()).or_else(|| non_empty(Some(&thread.cwd)));
        let started = client
            .turn_start(TurnStartParams {
                thread_id: key.thread_id.clone(),
                input: vec![UserInput::Text {
                    text: text.to_string(),
                }],
                cwd,
                approval_policy: Some(ctx.approval_policy),
                model: ctx.model.clone(),
                effort: ctx.effort.clone(),
            })
            .await;

        match started {
            Ok(response) => {
                let turn_id = response.turn.id;
                self.store.upsert(&key, |thread| {
                    if let Some(message) = pending_boundary(thread, turn_index) {
                        message.source_turn_id = Some(turn_id.clone());
                    }
                    // The turn may already have completed while the request was in flight.
                    if thread.has_turn_active() {
                        thread.active_turn_id = Some(turn_id.clone());
                    }
                    thread.turn_count = thread.turn_count.max(turn_index + 1);
                    thread.preview = items::derive_preview(&thread.messages, &thread.preview);
                });
                tracing::debug!(
                    server_id = %key.server_id,
                    thread_id = %key.thread_id,
                    turn_id = %turn_id,
                    "turn started"
                );
                Ok(key)
            }
            Err(err) => {
                let err = SyncError::from_rpc(&err);
                let reason = err.reason();
                tracing::warn!(
                    server_id = %key.server_id,
                    thread_id = %key.thread_id,
                    error = %reason,
                    "turn start failed"
                );
                self.store.upsert(&key, |thread| {
                    if let Some(position) = thread.messages.iter().rposition(|message| {
                        message.is_turn_boundary()
                            && message.source_turn_index == Some(turn_index)
                            && message.source_turn_id.is_none()
                    }) {
                        thread.messages.remove(position);
                        thread.live.clear();
                    }
                    thread.status = ThreadStatus::Error(reason);
                });
                Err(err)
            }
        }
    }

    pub async fn rename_thread(&self, key: &ThreadKey, name: &str) -> SyncResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(OperationError::EmptyField("name").into());
        }
        let client = self.require_client(&key.server_id).await?;
        client
            .thread_name_set(ThreadSetNameParams {
                thread_id: key.thread_id.clone(),
                name: name.to_string(),
            })
            .await
            .map_err(|err| SyncError::from_rpc(&err))?;
        self.store.upsert(key, |thread| {
            thread.preview = name.to_string();
            thread.touch();
        });
        Ok(())
    }

    /// Activate a thread, loading its history on first view.
    pub async fn view_thread(&self, key: &ThreadKey, ctx: &SessionContext) -> SyncResult<()> {
        let needs_history = self
            .store
            .get(key)
            .is_none_or(|thread| thread.messages.is_empty());
        if needs_history {
            return self.resume_thread(key, ctx).await;
        }
        self.store.set_active(Some(key.clone()));
        Ok(())
    }

    /// Page through `thread/list` and fold the summaries into the store.
    pub async fn refresh_sessions(&self, server_id: &str) -> SyncResult<usize> {
        let client = self.require_client(server_id).await?;
        let mut cursor = None;
        let mut seen = 0;

        for _ in 0..THREAD_LIST_MAX_PAGES {
            let page = client
                .thread_list(ThreadListParams {
                    cursor: cursor.take(),
                    limit: Some(THREAD_LIST_PAGE_SIZE),
                })
                .await
                .map_err(|err| SyncError::from_rpc(&err))?;

            for summary in &page.data {
                let key = ThreadKey::new(server_id, summary.id.clone());
                self.store.upsert(&key, |thread| {
                    let title = summary.title().trim();
                    if !title.is_empty() {
                        thread.preview = title.to_string();
                    }
                    if let Some(cwd) = non_empty(summary.cwd.as_deref()) {
                        thread.cwd = cwd;
                    }
                    if let Some(provider) = non_empty(summary.model_provider.as_deref()) {
                        thread.model_provider = provider;
                    }
                    thread.set_lineage(summary.lineage.parent(), summary.lineage.root());
                    if let Some(updated_at) = timestamp(summary.updated_at) {
                        thread.updated_at = updated_at;
                    }
                });
            }
            seen += page.data.len();

            match page.next_cursor.filter(|next| !next.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        tracing::debug!(server_id, threads = seen, "thread list refreshed");
        Ok(seen)
    }

    pub async fn refresh_all_sessions(&self) -> usize {
        let servers = self.connections.connected_server_ids().await;
        let refreshes = servers.iter().map(|server_id| async move {
            match self.refresh_sessions(server_id).await {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(server_id = %server_id, error = %err, "thread list refresh failed");
                    0
                }
            }
        });
        futures::future::join_all(refreshes).await.into_iter().sum()
    }
}

fn pending_boundary(thread: &mut ThreadState, turn_index: usize) -> Option<&mut ChatMessage> {
    thread.messages.iter_mut().rev().find(|message| {
        message.is_turn_boundary()
            && message.source_turn_index == Some(turn_index)
            && message.source_turn_id.is_none()
    })
}

/// Unix seconds, or milliseconds when the value is too large to be seconds.
fn timestamp(value: i64) -> Option<DateTime<Utc>> {
    if value <= 0 {
        return None;
    }
    if value > 100_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}
