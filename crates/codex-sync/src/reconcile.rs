//! Resync of a thread against the server's authoritative history.

use codex_client::ThreadResumeParams;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::items;
use crate::model::{ChatMessage, ThreadKey};
use crate::store::ThreadStore;
use crate::supervisor::ConnectionRegistry;

/// Thresholds of the anti-flicker guard that keeps richer local state over a stale snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferLocalPolicy {
    pub enabled: bool,
    /// Snapshot must be at least this many messages shorter than local.
    pub min_message_deficit: usize,
    /// Local must have at least this many more tool messages than the snapshot.
    pub min_tool_message_surplus: usize,
}

impl Default for PreferLocalPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_message_deficit: 1,
            min_tool_message_surplus: 1,
        }
    }
}

pub fn messages_equivalent(left: &[ChatMessage], right: &[ChatMessage]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right)
            .all(|(left, right)| left.structurally_equal(right))
}

pub fn should_prefer_local(
    policy: &PreferLocalPolicy,
    local: &[ChatMessage],
    snapshot: &[ChatMessage],
) -> bool {
    if !policy.enabled || local.is_empty() {
        return false;
    }
    if snapshot.is_empty() {
        return true;
    }
    let deficit = policy.min_message_deficit.max(1);
    if snapshot.len() + deficit <= local.len() {
        return true;
    }
    let local_tools = tool_message_count(local);
    let snapshot_tools = tool_message_count(snapshot);
    let surplus = policy.min_tool_message_surplus.max(1);
    local_tools >= snapshot_tools + surplus && snapshot.len() <= local.len()
}

fn tool_message_count(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .filter(|message| message.is_tool_system_message())
        .count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Turn running or no connection.
    Skipped,
    Unchanged,
    KeptLocal,
    Replaced,
}

#[derive(Clone)]
pub struct Reconciler {
    store: ThreadStore,
    connections: ConnectionRegistry,
    policy: PreferLocalPolicy,
}

impl Reconciler {
    pub fn new(store: ThreadStore, connections: ConnectionRegistry, policy: PreferLocalPolicy) -> Self {
        Self {
            store,
            connections,
            policy,
        }
    }

    pub async fn sync_thread_from_server(&self, key: &ThreadKey) -> SyncResult<SyncOutcome> {
        let local = self.store.get(key);
        if local.as_ref().is_some_and(|thread| thread.has_turn_active()) {
            return Ok(SyncOutcome::Skipped);
        }
        let Some(client) = self.connections.client(&key.server_id).await else {
            return Ok(SyncOutcome::Skipped);
        };

        let cwd = local
            .as_ref()
            .map(|thread| thread.cwd.clone())
            .filter(|cwd| !cwd.is_empty());
        let response = client
            .thread_resume(ThreadResumeParams {
                thread_id: key.thread_id.clone(),
                cwd,
                ..ThreadResumeParams::default()
            })
            .await
            .map_err(|err| SyncError::from_rpc(&err))?;
        let snapshot = items::restore_messages(&response.thread.turns);
        let turn_count = response.thread.turns.len();
        let policy = self.policy;

        let outcome = self.store.upsert(key, |thread| {
            // A turn may have started while the resume was in flight.
            if thread.has_turn_active() {
                return SyncOutcome::Skipped;
            }
            if messages_equivalent(&thread.messages, &snapshot) {
                thread.turn_count = turn_count;
                return SyncOutcome::Unchanged;
            }
            if should_prefer_local(&policy, &thread.messages, &snapshot) {
                return SyncOutcome::KeptLocal;
            }
            thread.replace_messages(snapshot);
            thread.turn_count = turn_count;
            thread.set_lineage(response.thread.lineage.parent(), response.thread.lineage.root());
            if let Some(provider) = response.model_provider.as_deref().filter(|p| !p.is_empty()) {
                thread.model_provider = provider.to_string();
            }
            if !response.model.is_empty() {
                thread.model.clone_from(&response.model);
            }
            SyncOutcome::Replaced
        });

        tracing::debug!(
            server_id = %key.server_id,
            thread_id = %key.thread_id,
            outcome = ?outcome,
            "thread resync finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(title: &str) -> ChatMessage {
        ChatMessage::system(format!("### {title}\nStatus: completed"))
    }

    #[test]
    fn shorter_snapshot_with_fewer_tool_messages_keeps_local() {
        let local = vec![
            ChatMessage::user("run the tests"),
            tool("Command Execution"),
            ChatMessage::assistant("running"),
            tool("File Change"),
            ChatMessage::assistant("done"),
            ChatMessage::user("thanks"),
        ];
        let snapshot = vec![
            ChatMessage::user("run the tests"),
            ChatMessage::assistant("running"),
            ChatMessage::assistant("done"),
            ChatMessage::user("thanks"),
        ];
        assert!(should_prefer_local(&PreferLocalPolicy::default(), &local, &snapshot));
    }

    #[test]
    fn longer_snapshot_wins() {
        let local = vec![ChatMessage::user("a"), tool("Command Execution")];
        let snapshot = vec![
            ChatMessage::user("a"),
            ChatMessage::assistant("b"),
            ChatMessage::assistant("c"),
        ];
        assert!(!should_prefer_local(&PreferLocalPolicy::default(), &local, &snapshot));
    }

    #[test]
    fn equal_length_snapshot_loses_to_richer_tool_history() {
        let local = vec![ChatMessage::user("a"), tool("MCP Tool Call")];
        let snapshot = vec![ChatMessage::user("a"), ChatMessage::assistant("b")];
        assert!(should_prefer_local(&PreferLocalPolicy::default(), &local, &snapshot));

        let plain = vec![ChatMessage::user("a"), ChatMessage::assistant("stale")];
        assert!(!should_prefer_local(&PreferLocalPolicy::default(), &plain, &snapshot));
    }

    #[test]
    fn empty_snapshot_never_erases_local_unless_disabled() {
        let local = vec![ChatMessage::user("a")];
        assert!(should_prefer_local(&PreferLocalPolicy::default(), &local, &[]));
        let disabled = PreferLocalPolicy {
            enabled: false,
            ..PreferLocalPolicy::default()
        };
        assert!(!should_prefer_local(&disabled, &local, &[]));
        assert!(!should_prefer_local(&PreferLocalPolicy::default(), &[], &[]));
    }

    #[test]
    fn equivalence_ignores_item_ids() {
        let live = vec![ChatMessage::assistant("hi").with_item_id(Some("a1".to_string()))];
        let restored = vec![ChatMessage::assistant("hi")];
        assert!(messages_equivalent(&live, &restored));
        assert!(!messages_equivalent(&live, &[]));
    }
}
