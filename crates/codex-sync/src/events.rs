//! Decoders from both wire dialects into one closed set of semantic events.

use chrono::Utc;
use codex_client::AppServerRequest;
use serde_json::Value;

use crate::approvals::{
    ApprovalKind, COMMAND_APPROVAL_METHOD, FILE_CHANGE_APPROVAL_METHOD, PendingApproval,
};
use crate::items::{self, first_string};
use crate::model::ChatMessage;

const LEGACY_EVENT_METHOD: &str = "codex/event";
const LEGACY_EVENT_PREFIX: &str = "codex/event/";
const THREAD_ID_FIELDS: [&str; 4] = ["threadId", "thread_id", "conversationId", "conversation_id"];
const CALL_ID_FIELDS: [&str; 2] = ["call_id", "callId"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `item/*` lifecycle notifications.
    Structured,
    /// `codex/event` and `codex/event/<type>`.
    Legacy,
    /// Turn, thread and account notifications shared by both.
    Neutral,
}

impl Dialect {
    pub fn of(method: &str) -> Self {
        if method.starts_with("item/") {
            Self::Structured
        } else if method == LEGACY_EVENT_METHOD || method.starts_with(LEGACY_EVENT_PREFIX) {
            Self::Legacy
        } else {
            Self::Neutral
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    UserMessage,
    AgentMessage,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveItem {
    pub item_id: Option<String>,
    pub kind: ItemKind,
    /// Rendered form; `None` when the item has nothing to show yet.
    pub message: Option<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemanticEvent {
    TurnStarted {
        thread_id: Option<String>,
        turn_id: Option<String>,
    },
    TurnCompleted {
        thread_id: Option<String>,
        turn_id: Option<String>,
        error: Option<String>,
    },
    TurnFailed {
        thread_id: Option<String>,
        message: String,
    },
    TurnDiff {
        thread_id: Option<String>,
        turn_id: Option<String>,
        diff: String,
    },
    ItemStarted {
        thread_id: Option<String>,
        item: LiveItem,
    },
    ItemCompleted {
        thread_id: Option<String>,
        item: LiveItem,
    },
    ItemOutputDelta {
        thread_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },
    ItemProgress {
        thread_id: Option<String>,
        item_id: Option<String>,
        message: String,
    },
    AssistantDelta {
        thread_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },
    ThreadRenamed {
        thread_id: Option<String>,
        name: Option<String>,
    },
    AccountChanged,
    ApprovalRequested(PendingApproval),
}

pub fn decode(method: &str, params: Option<&Value>) -> Option<SemanticEvent> {
    match Dialect::of(method) {
        Dialect::Legacy => decode_legacy(method, params),
        Dialect::Structured | Dialect::Neutral => decode_structured(method, params),
    }
}

pub fn decode_structured(method: &str, params: Option<&Value>) -> Option<SemanticEvent> {
    match method {
        "turn/started" => {
            let params = params?;
            Some(SemanticEvent::TurnStarted {
                thread_id: thread_id_of(params),
                turn_id: turn_id_of(params),
            })
        }
        "turn/completed" => {
            let Some(params) = params else {
                return Some(SemanticEvent::TurnCompleted {
                    thread_id: None,
                    turn_id: None,
                    error: None,
                });
            };
            let turn = params.get("turn");
            let failed = turn
                .and_then(|turn| turn.get("status"))
                .or_else(|| params.get("status"))
                .and_then(Value::as_str)
                .is_some_and(|status| status == "failed");
            let error = failed.then(|| {
                turn.and_then(|turn| turn.get("error"))
                    .or_else(|| params.get("error"))
                    .and_then(|error| error.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Turn failed")
                    .to_string()
            });
            Some(SemanticEvent::TurnCompleted {
                thread_id: thread_id_of(params),
                turn_id: turn_id_of(params),
                error,
            })
        }
        "turn/diff/updated" => {
            let params = params?;
            let diff = first_string(params, &["diff"])?;
            Some(SemanticEvent::TurnDiff {
                thread_id: thread_id_of(params),
                turn_id: first_string(params, &["turnId", "turn_id"]),
                diff,
            })
        }
        "item/started" | "item/completed" => {
            let params = params?;
            let item = live_item(params.get("item")?);
            let thread_id = thread_id_of(params);
            Some(if method == "item/started" {
                SemanticEvent::ItemStarted { thread_id, item }
            } else {
                SemanticEvent::ItemCompleted { thread_id, item }
            })
        }
        "item/agentMessage/delta" => {
            let params = params?;
            let delta = params.get("delta").and_then(Value::as_str)?;
            if delta.is_empty() {
                return None;
            }
            Some(SemanticEvent::AssistantDelta {
                thread_id: thread_id_of(params),
                item_id: first_string(params, &["itemId", "item_id"]),
                delta: delta.to_string(),
            })
        }
        "item/commandExecution/outputDelta" | "item/fileChange/outputDelta" => {
            let params = params?;
            let delta = params.get("delta").and_then(Value::as_str)?;
            if delta.trim().is_empty() {
                return None;
            }
            Some(SemanticEvent::ItemOutputDelta {
                thread_id: thread_id_of(params),
                item_id: first_string(params, &["itemId", "item_id"]),
                delta: delta.to_string(),
            })
        }
        "item/mcpToolCall/progress" => {
            let params = params?;
            let message = first_string(params, &["message"])?;
            Some(SemanticEvent::ItemProgress {
                thread_id: thread_id_of(params),
                item_id: first_string(params, &["itemId", "item_id"]),
                message,
            })
        }
        "error" => {
            let params = params?;
            let will_retry = params
                .get("willRetry")
                .or_else(|| params.get("will_retry"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if will_retry {
                return None;
            }
            let message = params
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .or_else(|| params.get("message").and_then(Value::as_str))
                .unwrap_or("Unknown turn error")
                .to_string();
            Some(SemanticEvent::TurnFailed {
                thread_id: thread_id_of(params),
                message,
            })
        }
        "thread/name/updated" => {
            let params = params?;
            Some(SemanticEvent::ThreadRenamed {
                thread_id: thread_id_of(params),
                name: first_string(params, &["threadName", "name"]),
            })
        }
        "account/updated" | "account/login/completed" => Some(SemanticEvent::AccountChanged),
        _ => None,
    }
}

pub fn decode_legacy(method: &str, params: Option<&Value>) -> Option<SemanticEvent> {
    let (payload, event_type) = if method == LEGACY_EVENT_METHOD {
        let msg = params?.get("msg")?;
        (msg, first_string(msg, &["type"])?)
    } else {
        let event_type = method.strip_prefix(LEGACY_EVENT_PREFIX)?.to_string();
        let payload = params.and_then(|params| params.get("msg")).or(params)?;
        (payload, event_type)
    };

    let thread_id = params
        .and_then(|params| first_string(params, &THREAD_ID_FIELDS))
        .or_else(|| first_string(payload, &THREAD_ID_FIELDS));
    let call_id = first_string(payload, &CALL_ID_FIELDS);
    let tool_item = |message: Option<ChatMessage>| LiveItem {
        item_id: call_id.clone(),
        kind: ItemKind::Other,
        message,
    };

    match event_type.as_str() {
        "exec_command_begin" => Some(SemanticEvent::ItemStarted {
            thread_id,
            item: tool_item(Some(items::legacy_exec_begin(payload)?)),
        }),
        "exec_command_output_delta" => {
            let delta = payload.get("chunk").and_then(Value::as_str)?;
            if delta.trim().is_empty() {
                return None;
            }
            Some(SemanticEvent::ItemOutputDelta {
                thread_id,
                item_id: call_id.clone(),
                delta: delta.to_string(),
            })
        }
        "exec_command_end" => Some(SemanticEvent::ItemCompleted {
            thread_id,
            item: tool_item(Some(items::legacy_exec_end(payload)?)),
        }),
        "mcp_tool_call_begin" => Some(SemanticEvent::ItemStarted {
            thread_id,
            item: tool_item(Some(items::legacy_mcp_begin(payload)?)),
        }),
        "mcp_tool_call_end" => Some(SemanticEvent::ItemCompleted {
            thread_id,
            item: tool_item(Some(items::legacy_mcp_end(payload)?)),
        }),
        "patch_apply_begin" => Some(SemanticEvent::ItemStarted {
            thread_id,
            item: tool_item(Some(items::legacy_patch_begin(payload)?)),
        }),
        "patch_apply_end" => Some(SemanticEvent::ItemCompleted {
            thread_id,
            item: tool_item(Some(items::legacy_patch_end(payload)?)),
        }),
        "turn_diff" => {
            let diff = first_string(payload, &["unified_diff"])?;
            let turn_id = params
                .and_then(|params| first_string(params, &["id", "turnId", "turn_id"]))
                .or_else(|| first_string(payload, &["id", "turnId", "turn_id"]));
            Some(SemanticEvent::TurnDiff {
                thread_id,
                turn_id,
                diff,
            })
        }
        "agent_message_delta" => {
            let delta = payload.get("delta").and_then(Value::as_str)?;
            if delta.is_empty() {
                return None;
            }
            Some(SemanticEvent::AssistantDelta {
                thread_id,
                item_id: None,
                delta: delta.to_string(),
            })
        }
        "task_started" => Some(SemanticEvent::TurnStarted {
            thread_id,
            turn_id: None,
        }),
        "task_complete" => Some(SemanticEvent::TurnCompleted {
            thread_id,
            turn_id: None,
            error: None,
        }),
        _ => None,
    }
}

/// Approval requests become events; any other server request has no semantic form.
pub fn decode_request(server_id: &str, request: &AppServerRequest) -> Option<SemanticEvent> {
    let kind = ApprovalKind::from_method(&request.method)?;
    let params = request.params.clone().unwrap_or(Value::Null);
    let structured = matches!(
        request.method.as_str(),
        COMMAND_APPROVAL_METHOD | FILE_CHANGE_APPROVAL_METHOD
    );
    let item_id = if structured {
        first_string(&params, &["itemId", "item_id"])
    } else {
        first_string(&params, &CALL_ID_FIELDS)
    };
    let command = match params.get("command") {
        Some(Value::Array(parts)) => Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        Some(Value::String(command)) => Some(command.trim().to_string()),
        _ => None,
    }
    .filter(|command| !command.is_empty());

    Some(SemanticEvent::ApprovalRequested(PendingApproval {
        request_id: request.id.clone(),
        server_id: server_id.to_string(),
        method: request.method.clone(),
        kind,
        thread_id: thread_id_of(&params),
        turn_id: first_string(&params, &["turnId", "turn_id"]),
        item_id,
        command,
        cwd: first_string(&params, &["cwd"]),
        reason: first_string(&params, &["reason"]),
        grant_root: first_string(&params, &["grantRoot", "grant_root"]),
        created_at: Utc::now(),
    }))
}

fn live_item(item: &Value) -> LiveItem {
    let kind = match items::item_type(item) {
        "userMessage" => ItemKind::UserMessage,
        "agentMessage" | "assistantMessage" => ItemKind::AgentMessage,
        _ => ItemKind::Other,
    };
    LiveItem {
        item_id: first_string(item, &["id"]),
        kind,
        message: items::chat_message_from_item(item),
    }
}

fn thread_id_of(params: &Value) -> Option<String> {
    first_string(params, &THREAD_ID_FIELDS).or_else(|| {
        params
            .get("thread")
            .and_then(|thread| first_string(thread, &["id"]))
    })
}

fn turn_id_of(params: &Value) -> Option<String> {
    params
        .get("turn")
        .and_then(|turn| first_string(turn, &["id"]))
        .or_else(|| first_string(params, &["turnId", "turn_id"]))
}
