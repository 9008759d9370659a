//! Server-initiated approval requests awaiting a human decision.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use codex_client::{AppServerRequestId, ApprovalDecision, ApprovalResponse, ReviewDecision};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::store::StoreChange;

pub const COMMAND_APPROVAL_METHOD: &str = "item/commandExecution/requestApproval";
pub const FILE_CHANGE_APPROVAL_METHOD: &str = "item/fileChange/requestApproval";
pub const LEGACY_EXEC_APPROVAL_METHOD: &str = "execCommandApproval";
pub const LEGACY_PATCH_APPROVAL_METHOD: &str = "applyPatchApproval";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalKind {
    CommandExecution,
    FileChange,
}

impl ApprovalKind {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            COMMAND_APPROVAL_METHOD | LEGACY_EXEC_APPROVAL_METHOD => Some(Self::CommandExecution),
            FILE_CHANGE_APPROVAL_METHOD | LEGACY_PATCH_APPROVAL_METHOD => Some(Self::FileChange),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApproval {
    pub request_id: AppServerRequestId,
    pub server_id: String,
    pub method: String,
    pub kind: ApprovalKind,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub item_id: Option<String>,
    pub command: Option<String>,
    pub cwd: Option<String>,
    pub reason: Option<String>,
    pub grant_root: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingApproval {
    /// Legacy methods speak the `approved`/`denied` vocabulary.
    pub fn uses_legacy_vocabulary(&self) -> bool {
        is_legacy_method(&self.method)
    }
}

fn is_legacy_method(method: &str) -> bool {
    matches!(method, LEGACY_EXEC_APPROVAL_METHOD | LEGACY_PATCH_APPROVAL_METHOD)
}

/// Response body for `decision`, in the vocabulary of the originating method.
pub fn wire_decision(method: &str, decision: ApprovalDecision) -> Value {
    let encoded = if is_legacy_method(method) {
        serde_json::to_value(ApprovalResponse {
            decision: ReviewDecision::from(decision),
        })
    } else {
        serde_json::to_value(ApprovalResponse { decision })
    };
    encoded.unwrap_or(Value::Null)
}

/// Process-wide ordered queue, filtered by server on removal.
#[derive(Clone)]
pub struct ApprovalCorrelator {
    pending: Arc<RwLock<Vec<PendingApproval>>>,
    changes: broadcast::Sender<StoreChange>,
}

impl ApprovalCorrelator {
    pub fn new(changes: broadcast::Sender<StoreChange>) -> Self {
        Self {
            pending: Arc::new(RwLock::new(Vec::new())),
            changes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<PendingApproval>> {
        match self.pending.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<PendingApproval>> {
        match self.pending.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self) {
        let _ = self.changes.send(StoreChange::Approvals);
    }

    /// Returns `false` when the server already has a request with this id.
    pub fn enqueue(&self, approval: PendingApproval) -> bool {
        {
            let mut pending = self.write();
            let duplicate = pending.iter().any(|existing| {
                existing.server_id == approval.server_id
                    && existing.request_id == approval.request_id
            });
            if duplicate {
                return false;
            }
            pending.push(approval);
        }
        self.emit();
        true
    }

    pub fn get(&self, server_id: &str, request_id: &AppServerRequestId) -> Option<PendingApproval> {
        self.read()
            .iter()
            .find(|approval| approval.server_id == server_id && &approval.request_id == request_id)
            .cloned()
    }

    pub fn remove(
        &self,
        server_id: &str,
        request_id: &AppServerRequestId,
    ) -> Option<PendingApproval> {
        let removed = {
            let mut pending = self.write();
            let position = pending.iter().position(|approval| {
                approval.server_id == server_id && &approval.request_id == request_id
            })?;
            pending.remove(position)
        };
        self.emit();
        Some(removed)
    }

    pub fn pending(&self) -> Vec<PendingApproval> {
        self.read().clone()
    }

    pub fn pending_for(&self, server_id: &str) -> Vec<PendingApproval> {
        self.read()
            .iter()
            .filter(|approval| approval.server_id == server_id)
            .cloned()
            .collect()
    }

    /// Drop everything owned by `server_id`; other servers are untouched.
    pub fn remove_server(&self, server_id: &str) -> usize {
        let removed = {
            let mut pending = self.write();
            let before = pending.len();
            pending.retain(|approval| approval.server_id != server_id);
            before - pending.len()
        };
        if removed > 0 {
            self.emit();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approval(server_id: &str, id: i64, method: &str) -> PendingApproval {
        PendingApproval {
            request_id: AppServerRequestId::Integer(id),
            server_id: server_id.to_string(),
            method: method.to_string(),
            kind: ApprovalKind::from_method(method).unwrap_or(ApprovalKind::CommandExecution),
            thread_id: Some("thr".to_string()),
            turn_id: None,
            item_id: None,
            command: Some("rm -rf target".to_string()),
            cwd: None,
            reason: None,
            grant_root: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_ids_are_scoped_per_server() {
        let (tx, _rx) = broadcast::channel(16);
        let correlator = ApprovalCorrelator::new(tx);
        assert!(correlator.enqueue(approval("a", 1, COMMAND_APPROVAL_METHOD)));
        assert!(!correlator.enqueue(approval("a", 1, FILE_CHANGE_APPROVAL_METHOD)));
        assert!(correlator.enqueue(approval("b", 1, COMMAND_APPROVAL_METHOD)));

        let first = correlator
            .get("a", &AppServerRequestId::Integer(1))
            .expect("pending");
        assert_eq!(first.kind, ApprovalKind::CommandExecution);
        assert_eq!(correlator.pending().len(), 2);
    }

    #[test]
    fn removing_a_server_keeps_other_servers_approvals() {
        let (tx, _rx) = broadcast::channel(16);
        let correlator = ApprovalCorrelator::new(tx);
        correlator.enqueue(approval("a", 1, COMMAND_APPROVAL_METHOD));
        correlator.enqueue(approval("a", 2, LEGACY_PATCH_APPROVAL_METHOD));
        correlator.enqueue(approval("b", 3, COMMAND_APPROVAL_METHOD));

        assert_eq!(correlator.remove_server("a"), 2);
        let remaining = correlator.pending();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].server_id, "b");
    }

    #[test]
    fn decisions_follow_the_request_vocabulary() {
        assert_eq!(
            wire_decision(COMMAND_APPROVAL_METHOD, ApprovalDecision::Decline),
            json!({"decision": "decline"})
        );
        assert_eq!(
            wire_decision(LEGACY_EXEC_APPROVAL_METHOD, ApprovalDecision::Accept),
            json!({"decision": "approved"})
        );
        assert_eq!(
            wire_decision(LEGACY_PATCH_APPROVAL_METHOD, ApprovalDecision::Cancel),
            json!({"decision": "abort"})
        );
    }
}
