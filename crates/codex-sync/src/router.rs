//! Applies semantic events to the thread store, one server connection at a time.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use codex_client::AppServerRequest;
use serde_json::Value;

use crate::approvals::{ApprovalCorrelator, PendingApproval};
use crate::events::{self, Dialect, ItemKind, LiveItem, SemanticEvent};
use crate::items;
use crate::model::{ChatMessage, MessageRole, ThreadKey, ThreadState, ThreadStatus};
use crate::store::ThreadStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Applied,
    Ignored,
    /// A turn finished on the active thread; a resync should follow.
    Reconcile(ThreadKey),
    AccountChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Pending(PendingApproval),
    /// Same request id already queued for this server.
    Duplicate,
    /// Not an approval; the caller answers with an empty result.
    AnswerDefault,
}

pub struct NotificationRouter {
    store: ThreadStore,
    approvals: ApprovalCorrelator,
    item_dialect_servers: RwLock<HashSet<String>>,
}

impl NotificationRouter {
    pub fn new(store: ThreadStore, approvals: ApprovalCorrelator) -> Self {
        Self {
            store,
            approvals,
            item_dialect_servers: RwLock::new(HashSet::new()),
        }
    }

    fn locked_servers(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        match self.item_dialect_servers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn locked_servers_mut(&self) -> RwLockWriteGuard<'_, HashSet<String>> {
        match self.item_dialect_servers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether `server_id` has been seen speaking the `item/*` dialect.
    pub fn uses_item_dialect(&self, server_id: &str) -> bool {
        self.locked_servers().contains(server_id)
    }

    /// Reset dialect detection, e.g. when the connection is replaced.
    pub fn forget_server(&self, server_id: &str) {
        self.locked_servers_mut().remove(server_id);
    }

    /// Never fails; undecodable or redundant notifications are ignored.
    pub fn route(&self, server_id: &str, method: &str, params: Option<&Value>) -> RouteOutcome {
        match Dialect::of(method) {
            Dialect::Structured => {
                if !self.uses_item_dialect(server_id) {
                    tracing::debug!(server_id, method, "server uses item lifecycle dialect");
                    self.locked_servers_mut().insert(server_id.to_string());
                }
            }
            Dialect::Legacy if self.uses_item_dialect(server_id) => {
                tracing::trace!(server_id, method, "legacy event ignored after item dialect");
                return RouteOutcome::Ignored;
            }
            Dialect::Legacy | Dialect::Neutral => {}
        }

        let Some(event) = events::decode(method, params) else {
            tracing::trace!(server_id, method, "notification not decoded");
            return RouteOutcome::Ignored;
        };
        self.apply(server_id, event)
    }

    pub fn route_request(&self, server_id: &str, request: &AppServerRequest) -> RequestOutcome {
        match events::decode_request(server_id, request) {
            Some(SemanticEvent::ApprovalRequested(approval)) => {
                if self.approvals.enqueue(approval.clone()) {
                    tracing::info!(
                        server_id,
                        method = %request.method,
                        request_id = %request.id,
                        "approval requested"
                    );
                    RequestOutcome::Pending(approval)
                } else {
                    RequestOutcome::Duplicate
                }
            }
            _ => RequestOutcome::AnswerDefault,
        }
    }

    pub fn apply(&self, server_id: &str, event: SemanticEvent) -> RouteOutcome {
        match event {
            SemanticEvent::TurnStarted { thread_id, turn_id } => {
                let Some(key) = self.resolve(server_id, thread_id.as_deref()) else {
                    return RouteOutcome::Ignored;
                };
                self.mutate(&key, |thread| {
                    thread.status = ThreadStatus::Thinking;
                    if turn_id.is_some() {
                        thread.active_turn_id = turn_id;
                    }
                    thread.touch();
                })
            }
            SemanticEvent::TurnCompleted {
                thread_id,
                turn_id: _,
                error,
            } => self.complete_turn(server_id, thread_id.as_deref(), error),
            SemanticEvent::TurnFailed { thread_id, message } => {
                let Some(key) = self.resolve(server_id, thread_id.as_deref()) else {
                    return RouteOutcome::Ignored;
                };
                tracing::warn!(server_id, thread_id = %key.thread_id, error = %message, "turn failed");
                self.mutate(&key, |thread| {
                    thread.status = ThreadStatus::Error(message);
                    thread.active_turn_id = None;
                    thread.touch();
                })
            }
            SemanticEvent::TurnDiff {
                thread_id,
                turn_id,
                diff,
            } => {
                let Some(key) = self.resolve(server_id, thread_id.as_deref()) else {
                    return RouteOutcome::Ignored;
                };
                let Some(message) = items::diff_message(&diff) else {
                    return RouteOutcome::Ignored;
                };
                self.mutate(&key, |thread| {
                    let slot = turn_id
                        .or_else(|| thread.active_turn_id.clone())
                        .unwrap_or_default();
                    upsert_turn_diff(thread, slot, message);
                })
            }
            SemanticEvent::ItemStarted { thread_id, item } => {
                self.apply_item(server_id, thread_id.as_deref(), item, ItemPhase::Open)
            }
            SemanticEvent::ItemCompleted { thread_id, item } => {
                self.apply_item(server_id, thread_id.as_deref(), item, ItemPhase::Close)
            }
            SemanticEvent::ItemOutputDelta {
                thread_id,
                item_id,
                delta,
            } => {
                let Some(key) = self.resolve(server_id, thread_id.as_deref()) else {
                    return RouteOutcome::Ignored;
                };
                self.mutate(&key, |thread| {
                    match open_slot(thread, item_id.as_deref()) {
                        Some(index) => {
                            let merged = items::merge_command_output(&thread.messages[index].text, &delta);
                            thread.messages[index].text = merged;
                        }
                        None => {
                            if let Some(message) = items::command_output_message(&delta) {
                                thread.messages.push(message);
                            }
                        }
                    }
                    thread.touch();
                })
            }
            SemanticEvent::ItemProgress {
                thread_id,
                item_id,
                message,
            } => {
                let Some(key) = self.resolve(server_id, thread_id.as_deref()) else {
                    return RouteOutcome::Ignored;
                };
                self.mutate(&key, |thread| {
                    match open_slot(thread, item_id.as_deref()) {
                        Some(index) => {
                            let merged = items::merge_progress(&thread.messages[index].text, &message);
                            thread.messages[index].text = merged;
                        }
                        None => {
                            if let Some(progress) = items::mcp_progress_message(&message) {
                                thread.messages.push(progress);
                            }
                        }
                    }
                    thread.touch();
                })
            }
            SemanticEvent::AssistantDelta {
                thread_id,
                item_id,
                delta,
            } => {
                let Some(key) = self.resolve(server_id, thread_id.as_deref()) else {
                    return RouteOutcome::Ignored;
                };
                self.mutate(&key, |thread| {
                    match open_slot(thread, item_id.as_deref()) {
                        Some(index) => thread.messages[index].text.push_str(&delta),
                        None => append_uncorrelated_delta(thread, &delta),
                    }
                    thread.touch();
                })
            }
            SemanticEvent::ThreadRenamed { thread_id, name } => {
                let (Some(key), Some(name)) = (self.resolve(server_id, thread_id.as_deref()), name)
                else {
                    return RouteOutcome::Ignored;
                };
                self.mutate(&key, |thread| {
                    thread.preview = name;
                    thread.touch();
                })
            }
            SemanticEvent::AccountChanged => RouteOutcome::AccountChanged,
            SemanticEvent::ApprovalRequested(approval) => {
                if self.approvals.enqueue(approval) {
                    RouteOutcome::Applied
                } else {
                    RouteOutcome::Ignored
                }
            }
        }
    }

    fn resolve(&self, server_id: &str, thread_id: Option<&str>) -> Option<ThreadKey> {
        let key = self.store.resolve_thread_key(server_id, thread_id);
        if key.is_none() {
            tracing::debug!(server_id, "notification without a resolvable thread");
        }
        key
    }

    fn complete_turn(
        &self,
        server_id: &str,
        thread_id: Option<&str>,
        error: Option<String>,
    ) -> RouteOutcome {
        let keys = match thread_id.filter(|id| !id.is_empty()) {
            Some(thread_id) => {
                let key = ThreadKey::new(server_id, thread_id);
                if self.store.get(&key).is_none() {
                    tracing::debug!(server_id, thread_id, "completion for untracked thread");
                    return RouteOutcome::Ignored;
                }
                vec![key]
            }
            None => {
                let thinking: Vec<ThreadKey> = self
                    .store
                    .threads_on_server(server_id)
                    .into_iter()
                    .filter(|key| self.store.get(key).is_some_and(|thread| thread.has_turn_active()))
                    .collect();
                if thinking.is_empty() {
                    self.store
                        .resolve_thread_key(server_id, None)
                        .into_iter()
                        .collect()
                } else {
                    thinking
                }
            }
        };
        if keys.is_empty() {
            return RouteOutcome::Ignored;
        }

        for key in &keys {
            let error = error.clone();
            self.store.update(key, |thread| {
                thread.status = match error {
                    Some(reason) => ThreadStatus::Error(reason),
                    None => ThreadStatus::Ready,
                };
                thread.active_turn_id = None;
                thread.live.clear();
                thread.preview = items::derive_preview(&thread.messages, &thread.preview);
                thread.touch();
            });
        }

        match self.store.active_key() {
            Some(active) if thread_id.is_none() && active.server_id == server_id => {
                RouteOutcome::Reconcile(active)
            }
            Some(active) if keys.contains(&active) => RouteOutcome::Reconcile(active),
            _ => RouteOutcome::Applied,
        }
    }

    fn apply_item(
        &self,
        server_id: &str,
        thread_id: Option<&str>,
        item: LiveItem,
        phase: ItemPhase,
    ) -> RouteOutcome {
        if item.kind == ItemKind::UserMessage {
            return RouteOutcome::Ignored;
        }
        let Some(key) = self.resolve(server_id, thread_id) else {
            return RouteOutcome::Ignored;
        };
        let LiveItem {
            item_id,
            kind,
            message,
        } = item;

        let Some(message) = message else {
            // Nothing to render; a completion still closes the slot.
            if phase == ItemPhase::Close
                && let Some(item_id) = item_id
            {
                self.store.update(&key, |thread| {
                    thread.live.items.remove(&item_id);
                });
            }
            return RouteOutcome::Ignored;
        };
        let message = message.with_item_id(item_id.clone());

        self.mutate(&key, |thread| {
            match phase {
                ItemPhase::Open => open_item(thread, item_id, message),
                ItemPhase::Close => close_item(thread, item_id, kind, message),
            }
            thread.touch();
        })
    }

    /// Threads exist only once started, resumed or listed; traffic for any
    /// other thread is dropped.
    fn mutate(&self, key: &ThreadKey, apply: impl FnOnce(&mut ThreadState)) -> RouteOutcome {
        if self.store.update(key, apply).is_some() {
            RouteOutcome::Applied
        } else {
            tracing::debug!(
                server_id = %key.server_id,
                thread_id = %key.thread_id,
                "notification for untracked thread dropped"
            );
            RouteOutcome::Ignored
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemPhase {
    Open,
    Close,
}

fn open_slot(thread: &ThreadState, item_id: Option<&str>) -> Option<usize> {
    let index = *thread.live.items.get(item_id?)?;
    (index < thread.messages.len()).then_some(index)
}

fn open_item(thread: &mut ThreadState, item_id: Option<String>, message: ChatMessage) {
    if let Some(index) = open_slot(thread, item_id.as_deref()) {
        thread.messages[index] = message;
        return;
    }
    thread.messages.push(message);
    if let Some(item_id) = item_id {
        thread.live.items.insert(item_id, thread.messages.len() - 1);
    }
}

fn close_item(
    thread: &mut ThreadState,
    item_id: Option<String>,
    kind: ItemKind,
    message: ChatMessage,
) {
    let position = open_slot(thread, item_id.as_deref())
        .or_else(|| {
            let item_id = item_id.as_deref()?;
            thread
                .messages
                .iter()
                .rposition(|existing| existing.item_id.as_deref() == Some(item_id))
        })
        .or_else(|| {
            if kind != ItemKind::AgentMessage {
                return None;
            }
            let last = thread.messages.len().checked_sub(1)?;
            let trailing = &thread.messages[last];
            (trailing.role == MessageRole::Assistant && trailing.item_id.is_none()).then_some(last)
        });

    match position {
        Some(index) => thread.messages[index] = message,
        None => thread.messages.push(message),
    }
    if let Some(item_id) = item_id {
        thread.live.items.remove(&item_id);
    }
}

fn append_uncorrelated_delta(thread: &mut ThreadState, delta: &str) {
    if let Some(last) = thread.messages.last_mut()
        && last.role == MessageRole::Assistant
        && last.item_id.is_none()
    {
        last.text.push_str(delta);
        return;
    }
    thread.messages.push(ChatMessage::assistant(delta));
}

fn upsert_turn_diff(thread: &mut ThreadState, turn_id: String, message: ChatMessage) {
    if let Some(&index) = thread.live.turn_diffs.get(&turn_id)
        && index < thread.messages.len()
    {
        thread.messages[index] = message;
        thread.touch();
        return;
    }
    thread.messages.push(message);
    thread.live.turn_diffs.insert(turn_id, thread.messages.len() - 1);
    thread.touch();
}

#[cfg(test)]
mod tests {
    use super::*;
    use codex_client::AppServerRequestId;
    use serde_json::json;

    fn router() -> (ThreadStore, NotificationRouter) {
        let store = ThreadStore::new();
        let approvals = ApprovalCorrelator::new(store.change_sender());
        let router = NotificationRouter::new(store.clone(), approvals);
        (store, router)
    }

    fn tracked(store: &ThreadStore, server_id: &str, thread_id: &str) -> ThreadKey {
        let key = ThreadKey::new(server_id, thread_id);
        store.upsert(&key, |_| ());
        key
    }

    fn messages(store: &ThreadStore, key: &ThreadKey) -> Vec<ChatMessage> {
        store.get(key).map(|thread| thread.messages).unwrap_or_default()
    }

    #[test]
    fn started_deltas_completed_leave_one_message() {
        let (store, router) = router();
        let key = tracked(&store, "srv", "thr");
        let item = |status: &str, output: Option<&str>| {
            json!({
                "threadId": "thr",
                "item": {
                    "type": "commandExecution", "id": "cmd", "command": "make",
                    "status": status, "aggregatedOutput": output
                }
            })
        };

        router.route("srv", "item/started", Some(&item("inProgress", None)));
        router.route(
            "srv",
            "item/commandExecution/outputDelta",
            Some(&json!({"threadId": "thr", "itemId": "cmd", "delta": "building\n"})),
        );
        assert!(messages(&store, &key)[0].text.contains("building"));

        router.route("srv", "item/completed", Some(&item("completed", Some("done"))));
        router.route(
            "srv",
            "item/commandExecution/outputDelta",
            Some(&json!({"threadId": "thr", "itemId": "cmd", "delta": "late\n"})),
        );

        let messages = messages(&store, &key);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].text.contains("Status: completed"));
        assert!(messages[0].text.contains("done"));
        assert!(!messages[0].text.contains("building"));
        assert!(messages[1].text.starts_with("### Command Output"));
        assert!(store.get(&key).is_some_and(|thread| thread.live.items.is_empty()));
    }

    #[test]
    fn legacy_events_are_ignored_once_item_dialect_is_seen() {
        let (store, router) = router();
        let key = tracked(&store, "srv", "thr");
        let legacy = json!({
            "conversationId": "thr",
            "msg": {"type": "exec_command_begin", "call_id": "c1", "command": ["ls"]}
        });

        assert_eq!(router.route("srv", "codex/event", Some(&legacy)), RouteOutcome::Applied);
        router.route(
            "srv",
            "item/started",
            Some(&json!({"threadId": "thr", "item": {"type": "commandExecution", "id": "c2", "command": "pwd"}})),
        );
        assert_eq!(router.route("srv", "codex/event", Some(&legacy)), RouteOutcome::Ignored);
        assert_eq!(messages(&store, &key).len(), 2);

        router.forget_server("srv");
        assert!(!router.uses_item_dialect("srv"));
    }

    #[test]
    fn uncorrelated_assistant_deltas_extend_the_trailing_message() {
        let (store, router) = router();
        let key = ThreadKey::new("srv", "thr");
        store.upsert(&key, |thread| thread.messages.push(ChatMessage::user("hello")));

        for delta in ["hi", " there"] {
            router.route(
                "srv",
                "codex/event/agent_message_delta",
                Some(&json!({"msg": {"delta": delta, "thread_id": "thr"}})),
            );
        }
        let timeline = messages(&store, &key);
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[1].text, "hi there");

        router.route(
            "srv",
            "item/completed",
            Some(&json!({"threadId": "thr", "item": {"type": "agentMessage", "id": "a1", "text": "hi there!"}})),
        );
        let timeline = messages(&store, &key);
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[1].text, "hi there!");
        assert_eq!(timeline[1].item_id.as_deref(), Some("a1"));
    }

    #[test]
    fn turn_diffs_upsert_per_turn() {
        let (store, router) = router();
        let key = tracked(&store, "srv", "thr");
        for diff in ["+a", "+a\n+b"] {
            router.route(
                "srv",
                "turn/diff/updated",
                Some(&json!({"threadId": "thr", "turnId": "t1", "diff": diff})),
            );
        }
        let timeline = messages(&store, &key);
        assert_eq!(timeline.len(), 1);
        assert!(timeline[0].text.contains("+b"));
    }

    #[test]
    fn traffic_for_untracked_threads_is_dropped() {
        let (store, router) = router();
        let key = tracked(&store, "srv", "thr");
        store.remove(&key);

        let late = json!({"threadId": "thr", "item": {"type": "agentMessage", "id": "a1", "text": "late"}});
        assert_eq!(router.route("srv", "item/completed", Some(&late)), RouteOutcome::Ignored);
        assert_eq!(
            router.route(
                "srv",
                "item/agentMessage/delta",
                Some(&json!({"threadId": "thr", "itemId": "a1", "delta": "x"}))
            ),
            RouteOutcome::Ignored
        );
        assert_eq!(
            router.route("srv", "turn/completed", Some(&json!({"threadId": "never-known"}))),
            RouteOutcome::Ignored
        );
        assert_eq!(
            router.route("srv", "turn/started", Some(&json!({"threadId": "never-known"}))),
            RouteOutcome::Ignored
        );

        assert!(store.get(&key).is_none());
        assert!(store.get(&ThreadKey::new("srv", "never-known")).is_none());
        assert!(store.all().is_empty());
    }

    #[test]
    fn threadless_completion_settles_every_thinking_thread() {
        let (store, router) = router();
        let active = ThreadKey::new("srv", "one");
        let other = ThreadKey::new("srv", "two");
        let remote = ThreadKey::new("elsewhere", "three");
        for key in [&active, &other, &remote] {
            store.upsert(key, |thread| thread.status = ThreadStatus::Thinking);
        }
        store.set_active(Some(active.clone()));

        let outcome = router.route("srv", "codex/event/task_complete", Some(&json!({})));

        assert_eq!(outcome, RouteOutcome::Reconcile(active.clone()));
        assert_eq!(store.get(&active).map(|t| t.status), Some(ThreadStatus::Ready));
        assert_eq!(store.get(&other).map(|t| t.status), Some(ThreadStatus::Ready));
        assert_eq!(store.get(&remote).map(|t| t.status), Some(ThreadStatus::Thinking));
    }

    #[test]
    fn failed_turn_sets_error_status_only_on_that_thread() {
        let (store, router) = router();
        let failing = ThreadKey::new("srv", "a");
        let healthy = ThreadKey::new("srv", "b");
        store.upsert(&failing, |thread| thread.status = ThreadStatus::Thinking);
        store.upsert(&healthy, |thread| thread.status = ThreadStatus::Thinking);

        router.route(
            "srv",
            "error",
            Some(&json!({"threadId": "a", "error": {"message": "quota exceeded"}, "willRetry": false})),
        );

        assert_eq!(
            store.get(&failing).map(|t| t.status),
            Some(ThreadStatus::Error("quota exceeded".to_string()))
        );
        assert_eq!(store.get(&healthy).map(|t| t.status), Some(ThreadStatus::Thinking));
    }

    #[test]
    fn approval_requests_are_queued_once() {
        let (_store, router) = router();
        let request = AppServerRequest {
            id: AppServerRequestId::Integer(7),
            method: "execCommandApproval".to_string(),
            params: Some(json!({"conversationId": "thr", "callId": "c", "command": ["rm", "x"]})),
        };
        assert!(matches!(
            router.route_request("srv", &request),
            RequestOutcome::Pending(_)
        ));
        assert_eq!(router.route_request("srv", &request), RequestOutcome::Duplicate);

        let unknown = AppServerRequest {
            id: AppServerRequestId::Integer(8),
            method: "item/tool/call".to_string(),
            params: None,
        };
        assert_eq!(router.route_request("srv", &unknown), RequestOutcome::AnswerDefault);
    }
}
