//! Rendering of thread items and legacy events into chat messages.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use codex_client::ThreadTurn;
use serde_json::{Map, Value};

use crate::model::{ChatImage, ChatMessage, MessageRole};

const OUTPUT_PREFIX: &str = "\n\nOutput:\n```text\n";
const CLOSING_FENCE: &str = "\n```";
const PROGRESS_HEADING: &str = "\n\nProgress:\n";
const PREVIEW_LIMIT: usize = 120;

/// `### Title` message with a trimmed body; `None` when the body is blank.
pub fn system_message(title: &str, body: &str) -> Option<ChatMessage> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(ChatMessage::system(format!("### {title}\n{trimmed}")))
}

pub fn command_output_message(delta: &str) -> Option<ChatMessage> {
    system_message("Command Output", &format!("```text\n{delta}\n```"))
}

pub fn mcp_progress_message(progress: &str) -> Option<ChatMessage> {
    system_message("MCP Tool Progress", progress)
}

pub fn diff_message(diff: &str) -> Option<ChatMessage> {
    let diff = diff.trim();
    if diff.is_empty() {
        return None;
    }
    system_message("File Diff", &format!("```diff\n{diff}\n```"))
}

/// Insert streamed output inside the existing output fence, or open one.
pub fn merge_command_output(current: &str, delta: &str) -> String {
    if let Some(output_start) = current.find(OUTPUT_PREFIX)
        && let Some(close_start) = current.rfind(CLOSING_FENCE)
        && close_start >= output_start + OUTPUT_PREFIX.len()
    {
        let mut merged = String::with_capacity(current.len() + delta.len());
        merged.push_str(&current[..close_start]);
        merged.push_str(delta);
        merged.push_str(&current[close_start..]);
        return merged;
    }
    let mut merged = String::with_capacity(current.len() + OUTPUT_PREFIX.len() + delta.len() + 4);
    merged.push_str(current);
    merged.push_str(OUTPUT_PREFIX);
    merged.push_str(delta);
    if !delta.ends_with('\n') {
        merged.push('\n');
    }
    merged.push_str("```");
    merged
}

pub fn merge_progress(current: &str, progress: &str) -> String {
    if current.contains(PROGRESS_HEADING) {
        format!("{current}\n{progress}")
    } else {
        format!("{current}{PROGRESS_HEADING}{progress}")
    }
}

/// Replay authoritative turns. User messages carry the index of the turn they opened.
pub fn restore_messages(turns: &[ThreadTurn]) -> Vec<ChatMessage> {
    let mut restored = Vec::with_capacity(turns.len() * 3);
    for (index, turn) in turns.iter().enumerate() {
        for item in &turn.items {
            let Some(message) = chat_message_from_item(item) else {
                continue;
            };
            if message.role == MessageRole::User {
                restored.push(message.with_turn(Some(turn.id.clone()), index));
            } else {
                restored.push(message);
            }
        }
    }
    restored
}

pub fn item_type(item: &Value) -> &str {
    item.get("type").and_then(Value::as_str).unwrap_or_default().trim()
}

pub fn chat_message_from_item(item: &Value) -> Option<ChatMessage> {
    match item_type(item) {
        "userMessage" => {
            let (text, images) = render_user_input(item.get("content"), &text_of(item, "text"));
            if text.is_empty() && images.is_empty() {
                return None;
            }
            let mut message = ChatMessage::user(text);
            message.images = images;
            Some(message)
        }
        "agentMessage" | "assistantMessage" => {
            let text = text_of(item, "text");
            (!text.is_empty()).then(|| ChatMessage::assistant(text))
        }
        "plan" => system_message("Plan", &text_of(item, "text")),
        "reasoning" => {
            let summary = string_list(item.get("summary")).join("\n");
            let content = string_list(item.get("content")).join("\n\n");
            let sections: Vec<String> = [summary, content]
                .into_iter()
                .filter(|section| !section.is_empty())
                .collect();
            system_message("Reasoning", &sections.join("\n\n"))
        }
        "commandExecution" => command_execution_message(item),
        "fileChange" => file_change_message(item),
        "mcpToolCall" => mcp_tool_call_message(item),
        "collabAgentToolCall" => collab_message(item),
        "webSearch" | "web_search" | "web-search" | "websearch" => web_search_message(item),
        "imageView" => system_message("Image View", &format!("Path: {}", text_of(item, "path"))),
        "enteredReviewMode" => system_message(
            "Review Mode",
            &format!("Entered review: {}", text_of(item, "review")),
        ),
        "exitedReviewMode" => system_message(
            "Review Mode",
            &format!("Exited review: {}", text_of(item, "review")),
        ),
        "contextCompaction" => system_message("Context", "Context compaction occurred."),
        "" => None,
        other => system_message("Event", &format!("Unhandled item type: {other}")),
    }
}

fn command_execution_message(item: &Value) -> Option<ChatMessage> {
    let status = text_of(item, "status");
    let cwd = text_of(item, "cwd");
    let command = command_text(item.get("command"));
    let output = first_string(item, &["aggregatedOutput", "output", "stdout"]).unwrap_or_default();

    let mut lines = Vec::new();
    if !status.is_empty() {
        lines.push(format!("Status: {status}"));
    }
    if !cwd.is_empty() {
        lines.push(format!("Directory: {cwd}"));
    }
    if let Some(exit_code) = integer_of(item.get("exitCode")) {
        lines.push(format!("Exit code: {exit_code}"));
    }
    if let Some(duration) = integer_of(item.get("durationMs")) {
        lines.push(format!("Duration: {duration} ms"));
    }

    let mut body = lines.join("\n");
    append_fence(&mut body, "Command", "bash", &command);
    append_fence(&mut body, "Output", "text", &output);
    system_message("Command Execution", &body)
}

fn file_change_message(item: &Value) -> Option<ChatMessage> {
    let status = text_of(item, "status");
    let changes = item
        .get("changes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let parts: Vec<String> = changes
        .iter()
        .filter_map(|change| {
            let path = text_of(change, "path");
            let kind = match change.get("kind") {
                Some(Value::Object(kind)) => kind
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                Some(Value::String(kind)) => kind.trim().to_string(),
                _ => String::new(),
            };
            let kind = if kind.is_empty() { "update".to_string() } else { kind };
            let diff = first_string(change, &["diff", "unified_diff"]).unwrap_or_default();

            let mut piece = String::new();
            if !path.is_empty() {
                piece.push_str(&format!("Path: {path}\n"));
            }
            piece.push_str(&format!("Kind: {kind}"));
            if !diff.is_empty() {
                piece.push_str(&format!("\n\n```diff\n{diff}\n```"));
            }
            let piece = piece.trim().to_string();
            (!piece.is_empty()).then_some(piece)
        })
        .collect();

    let mut body = format!("Status: {status}");
    if !parts.is_empty() {
        body.push_str("\n\n");
        body.push_str(&parts.join("\n\n---\n\n"));
    }
    system_message("File Change", &body)
}

fn mcp_tool_call_message(item: &Value) -> Option<ChatMessage> {
    let status = text_of(item, "status");
    let server = text_of(item, "server");
    let tool = text_of(item, "tool");

    let mut lines = Vec::new();
    if !status.is_empty() {
        lines.push(format!("Status: {status}"));
    }
    if let Some(tool) = tool_label(&server, &tool) {
        lines.push(format!("Tool: {tool}"));
    }
    if let Some(duration) = integer_of(item.get("durationMs")) {
        lines.push(format!("Duration: {duration} ms"));
    }
    let error = item
        .get("error")
        .map(|error| text_of(error, "message"))
        .unwrap_or_default();
    if !error.is_empty() {
        lines.push(format!("Error: {error}"));
    }

    let mut body = lines.join("\n");
    if let Some(result) = item.get("result").filter(|result| result.is_object()) {
        let mut summary = Map::new();
        summary.insert(
            "content".to_string(),
            result.get("content").cloned().unwrap_or(Value::Array(Vec::new())),
        );
        summary.insert(
            "structuredContent".to_string(),
            result.get("structuredContent").cloned().unwrap_or(Value::Null),
        );
        if let Some(pretty) = pretty_json(&Value::Object(summary)) {
            append_fence(&mut body, "Result", "json", &pretty);
        }
    }
    system_message("MCP Tool Call", &body)
}

fn collab_message(item: &Value) -> Option<ChatMessage> {
    let mut lines = Vec::new();
    let status = text_of(item, "status");
    if !status.is_empty() {
        lines.push(format!("Status: {status}"));
    }
    let tool = text_of(item, "tool");
    if !tool.is_empty() {
        lines.push(format!("Tool: {tool}"));
    }
    let targets = string_list(item.get("receiverThreadIds"));
    if !targets.is_empty() {
        lines.push(format!("Targets: {}", targets.join(", ")));
    }
    let prompt = text_of(item, "prompt");
    if !prompt.is_empty() {
        lines.push(String::new());
        lines.push("Prompt:".to_string());
        lines.push(prompt);
    }
    system_message("Collaboration", &lines.join("\n"))
}

fn web_search_message(item: &Value) -> Option<ChatMessage> {
    let mut lines = Vec::new();
    let query = text_of(item, "query");
    if !query.is_empty() {
        lines.push(format!("Query: {query}"));
    }
    if let Some(action) = item.get("action").filter(|action| !action.is_null())
        && let Some(pretty) = pretty_json(action)
    {
        lines.push(String::new());
        lines.push("Action:".to_string());
        lines.push(format!("```json\n{pretty}\n```"));
    }
    system_message("Web Search", &lines.join("\n"))
}

fn render_user_input(content: Option<&Value>, fallback: &str) -> (String, Vec<ChatImage>) {
    let mut parts = Vec::new();
    let mut images = Vec::new();
    for input in content.and_then(Value::as_array).into_iter().flatten() {
        match item_type(input) {
            "text" => {
                let text = text_of(input, "text");
                if !text.is_empty() {
                    parts.push(text);
                }
            }
            "image" => {
                if let Some(data) = input
                    .get("url")
                    .and_then(Value::as_str)
                    .and_then(decode_base64_data_uri)
                {
                    images.push(ChatImage { data });
                }
            }
            "localImage" => {
                let path = text_of(input, "path");
                match std::fs::read(&path) {
                    Ok(data) => images.push(ChatImage { data }),
                    Err(err) => tracing::debug!(error = %err, path = %path, "Local image unreadable"),
                }
            }
            kind @ ("skill" | "mention") => {
                let label = if kind == "skill" { "[Skill]" } else { "[Mention]" };
                let name = text_of(input, "name");
                let path = text_of(input, "path");
                match (name.is_empty(), path.is_empty()) {
                    (false, false) => parts.push(format!("{label} {name} ({path})")),
                    (false, true) => parts.push(format!("{label} {name}")),
                    (true, false) => parts.push(format!("{label} {path}")),
                    (true, true) => {}
                }
            }
            _ => {}
        }
    }
    if parts.is_empty() && images.is_empty() {
        return (fallback.trim().to_string(), images);
    }
    (parts.join("\n"), images)
}

pub fn decode_base64_data_uri(uri: &str) -> Option<Vec<u8>> {
    let rest = uri.strip_prefix("data:")?;
    let (_, encoded) = rest.split_once(',')?;
    let cleaned: String = encoded.chars().filter(|ch| !ch.is_whitespace()).collect();
    STANDARD.decode(cleaned.as_bytes()).ok()
}

// Legacy `codex/event` payloads.

pub fn legacy_exec_begin(payload: &Value) -> Option<ChatMessage> {
    let command = command_text(payload.get("command"));
    let cwd = text_of(payload, "cwd");
    let mut lines = vec!["Status: inProgress".to_string()];
    if !cwd.is_empty() {
        lines.push(format!("Directory: {cwd}"));
    }
    let mut body = lines.join("\n");
    append_fence(&mut body, "Command", "bash", &command);
    system_message("Command Execution", &body)
}

pub fn legacy_exec_end(payload: &Value) -> Option<ChatMessage> {
    let command = command_text(payload.get("command"));
    let cwd = text_of(payload, "cwd");
    let status = first_string(payload, &["status"]).unwrap_or_else(|| "completed".to_string());
    let output: Vec<String> = ["aggregated_output", "formatted_output", "stdout", "stderr"]
        .into_iter()
        .filter_map(|field| first_string(payload, &[field]))
        .collect();

    let mut lines = vec![format!("Status: {status}")];
    if !cwd.is_empty() {
        lines.push(format!("Directory: {cwd}"));
    }
    if let Some(exit_code) = first_string(payload, &["exit_code", "exitCode"]) {
        lines.push(format!("Exit code: {exit_code}"));
    }
    if let Some(duration) = duration_millis(payload.get("duration")) {
        lines.push(format!("Duration: {duration} ms"));
    }
    let mut body = lines.join("\n");
    append_fence(&mut body, "Command", "bash", &command);
    append_fence(&mut body, "Output", "text", &output.join("\n"));
    system_message("Command Execution", &body)
}

pub fn legacy_mcp_begin(payload: &Value) -> Option<ChatMessage> {
    let invocation = payload.get("invocation").cloned().unwrap_or(Value::Null);
    let mut lines = vec!["Status: inProgress".to_string()];
    if let Some(tool) = tool_label(&text_of(&invocation, "server"), &text_of(&invocation, "tool")) {
        lines.push(format!("Tool: {tool}"));
    }
    let mut body = lines.join("\n");
    if let Some(arguments) = invocation.get("arguments").and_then(pretty_json) {
        append_fence(&mut body, "Arguments", "json", &arguments);
    }
    system_message("MCP Tool Call", &body)
}

pub fn legacy_mcp_end(payload: &Value) -> Option<ChatMessage> {
    let invocation = payload.get("invocation").cloned().unwrap_or(Value::Null);
    let result = payload.get("result");
    let failed = result
        .and_then(Value::as_object)
        .is_some_and(|result| result.contains_key("Err"));
    let mut lines = vec![format!(
        "Status: {}",
        if failed { "failed" } else { "completed" }
    )];
    if let Some(tool) = tool_label(&text_of(&invocation, "server"), &text_of(&invocation, "tool")) {
        lines.push(format!("Tool: {tool}"));
    }
    if let Some(duration) = duration_millis(payload.get("duration")) {
        lines.push(format!("Duration: {duration} ms"));
    }
    let mut body = lines.join("\n");
    if let Some(result) = result.and_then(pretty_json) {
        append_fence(&mut body, "Result", "json", &result);
    }
    system_message("MCP Tool Call", &body)
}

pub fn legacy_patch_begin(payload: &Value) -> Option<ChatMessage> {
    let auto_approved = payload
        .get("auto_approved")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let mut body = format!(
        "Status: inProgress\nApproval: {}",
        if auto_approved { "auto" } else { "requested" }
    );
    let changes = legacy_patch_changes(payload.get("changes"));
    if !changes.is_empty() {
        body.push_str("\n\n");
        body.push_str(&changes);
    }
    system_message("File Change", &body)
}

pub fn legacy_patch_end(payload: &Value) -> Option<ChatMessage> {
    let status = first_string(payload, &["status"]).unwrap_or_else(|| {
        let success = payload.get("success").and_then(Value::as_bool).unwrap_or(false);
        (if success { "completed" } else { "failed" }).to_string()
    });
    let mut body = format!("Status: {status}");
    let changes = legacy_patch_changes(payload.get("changes"));
    if !changes.is_empty() {
        body.push_str("\n\n");
        body.push_str(&changes);
    }
    append_fence(&mut body, "Output", "text", &text_of(payload, "stdout"));
    append_fence(&mut body, "Error", "text", &text_of(payload, "stderr"));
    system_message("File Change", &body)
}

fn legacy_patch_changes(changes: Option<&Value>) -> String {
    let Some(changes) = changes.and_then(Value::as_object) else {
        return String::new();
    };
    let mut paths: Vec<&String> = changes.keys().collect();
    paths.sort();

    let sections: Vec<String> = paths
        .into_iter()
        .filter_map(|path| {
            let change = changes.get(path)?.as_object()?;
            let change = Value::Object(change.clone());
            let kind = first_string(&change, &["type"]).unwrap_or_else(|| "update".to_string());
            let mut section = format!("Path: {path}\nKind: {kind}");
            match kind.as_str() {
                "update" => {
                    let diff = text_of(&change, "unified_diff");
                    if !diff.is_empty() {
                        section.push_str(&format!("\n\n```diff\n{diff}\n```"));
                    }
                }
                "add" | "delete" => {
                    let content = text_of(&change, "content");
                    if !content.is_empty() {
                        section.push_str(&format!("\n\n```text\n{content}\n```"));
                    }
                }
                _ => {}
            }
            Some(section)
        })
        .collect();
    sections.join("\n\n---\n\n")
}

/// Last user or assistant text, truncated; else the fallback.
pub fn derive_preview(messages: &[ChatMessage], fallback: &str) -> String {
    messages
        .iter()
        .rev()
        .find(|message| matches!(message.role, MessageRole::User | MessageRole::Assistant))
        .map(|message| message.text.trim())
        .filter(|text| !text.is_empty())
        .map(|text| text.chars().take(PREVIEW_LIMIT).collect())
        .unwrap_or_else(|| fallback.to_string())
}

fn append_fence(body: &mut String, label: &str, language: &str, content: &str) {
    let content = content.trim();
    if content.is_empty() {
        return;
    }
    if !body.is_empty() {
        body.push_str("\n\n");
    }
    body.push_str(&format!("{label}:\n```{language}\n{content}\n```"));
}

fn tool_label(server: &str, tool: &str) -> Option<String> {
    match (server.is_empty(), tool.is_empty()) {
        (true, true) => None,
        (true, false) => Some(tool.to_string()),
        _ => Some(format!("{server}/{tool}")),
    }
}

fn text_of(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// First present field rendered as trimmed non-empty text; numbers are stringified.
pub(crate) fn first_string(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| {
        let text = match value.get(*field)? {
            Value::String(text) => text.trim().to_string(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    })
}

fn integer_of(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn command_text(command: Option<&Value>) -> String {
    match command {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::String(text)) => text.trim().to_string(),
        _ => String::new(),
    }
}

/// Milliseconds from a number, a numeric string or a `{secs, nanos}` object.
fn duration_millis(duration: Option<&Value>) -> Option<i64> {
    match duration? {
        Value::Object(parts) => {
            let secs = integer_of(parts.get("secs"))?;
            let nanos = integer_of(parts.get("nanos")).unwrap_or(0);
            Some(secs * 1_000 + nanos / 1_000_000)
        }
        other => integer_of(Some(other)),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(text)) => {
            let text = text.trim();
            if text.is_empty() { Vec::new() } else { vec![text.to_string()] }
        }
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(|entry| match entry {
                Value::String(text) => Some(text.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|entry| !entry.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Pretty JSON with object keys sorted at every level.
pub(crate) fn pretty_json(value: &Value) -> Option<String> {
    if value.is_null() {
        return None;
    }
    let rendered = serde_json::to_string_pretty(&sorted_keys(value)).ok()?;
    let trimmed = rendered.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn sorted_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                if let Some(entry) = map.get(key) {
                    sorted.insert(key.clone(), sorted_keys(entry));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(entries) => Value::Array(entries.iter().map(sorted_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blank_bodies_produce_no_system_message() {
        assert!(system_message("Plan", "  \n ").is_none());
        let message = system_message("Plan", "  step one \n").expect("message");
        assert_eq!(message.text, "### Plan\nstep one");
        assert_eq!(message.role, MessageRole::System);
    }

    #[test]
    fn command_output_merges_inside_existing_fence() {
        let started = "### Command Execution\nStatus: inProgress\n\nCommand:\n```bash\nls\n```";
        let first = merge_command_output(started, "a.txt");
        assert_eq!(
            first,
            "### Command Execution\nStatus: inProgress\n\nCommand:\n```bash\nls\n```\n\nOutput:\n```text\na.txt\n```"
        );
        let second = merge_command_output(&first, "\nb.txt");
        assert_eq!(
            second,
            "### Command Execution\nStatus: inProgress\n\nCommand:\n```bash\nls\n```\n\nOutput:\n```text\na.txt\nb.txt\n```"
        );
    }

    #[test]
    fn progress_lines_share_one_heading() {
        let once = merge_progress("### MCP Tool Call\nStatus: inProgress", "fetching");
        let twice = merge_progress(&once, "parsing");
        assert_eq!(
            twice,
            "### MCP Tool Call\nStatus: inProgress\n\nProgress:\nfetching\nparsing"
        );
    }

    #[test]
    fn command_execution_item_renders_all_sections() {
        let message = chat_message_from_item(&json!({
            "type": "commandExecution",
            "id": "item-1",
            "command": ["cargo", "test"],
            "cwd": "/work",
            "status": "completed",
            "exitCode": 0,
            "durationMs": 1520,
            "aggregatedOutput": "ok\n"
        }))
        .expect("message");
        assert_eq!(
            message.text,
            "### Command Execution\nStatus: completed\nDirectory: /work\nExit code: 0\nDuration: 1520 ms\n\nCommand:\n```bash\ncargo test\n```\n\nOutput:\n```text\nok\n```"
        );
    }

    #[test]
    fn file_change_kind_accepts_string_or_object() {
        let message = chat_message_from_item(&json!({
            "type": "fileChange",
            "status": "completed",
            "changes": [
                {"path": "src/a.rs", "kind": {"type": "add"}, "diff": "+fn a() {}"},
                {"path": "src/b.rs", "kind": "delete"}
            ]
        }))
        .expect("message");
        assert_eq!(
            message.text,
            "### File Change\nStatus: completed\n\nPath: src/a.rs\nKind: add\n\n```diff\n+fn a() {}\n```\n\n---\n\nPath: src/b.rs\nKind: delete"
        );
    }

    #[test]
    fn mcp_result_is_pretty_printed_with_sorted_keys() {
        let message = chat_message_from_item(&json!({
            "type": "mcpToolCall",
            "server": "github",
            "tool": "search",
            "status": "failed",
            "error": {"message": "rate limited"},
            "result": {"structuredContent": {"b": 1, "a": 2}, "content": []}
        }))
        .expect("message");
        assert!(message.text.starts_with(
            "### MCP Tool Call\nStatus: failed\nTool: github/search\nError: rate limited\n\nResult:\n```json\n{\n  \"content\": [],\n  \"structuredContent\": {\n    \"a\": 2,\n    \"b\": 1\n  }\n}"
        ));
        assert!(message.is_tool_system_message());
    }

    #[test]
    fn user_input_renders_text_skills_and_inline_images() {
        let message = chat_message_from_item(&json!({
            "type": "userMessage",
            "content": [
                {"type": "text", "text": " fix the build "},
                {"type": "skill", "name": "mezo", "path": "/repo/skills/mezo/SKILL.md"},
                {"type": "mention", "name": "", "path": "src/lib.rs"},
                {"type": "image", "url": "data:image/png;base64,aGVsbG8="}
            ]
        }))
        .expect("message");
        assert_eq!(message.role, MessageRole::User);
        assert_eq!(
            message.text,
            "fix the build\n[Skill] mezo (/repo/skills/mezo/SKILL.md)\n[Mention] src/lib.rs"
        );
        assert_eq!(message.images, vec![ChatImage { data: b"hello".to_vec() }]);
    }

    #[test]
    fn user_message_without_content_falls_back_to_text() {
        let message = chat_message_from_item(&json!({"type": "userMessage", "text": "hi there"}))
            .expect("message");
        assert_eq!(message.text, "hi there");
    }

    #[test]
    fn unknown_items_are_reported_not_dropped() {
        let message = chat_message_from_item(&json!({"type": "hologram"})).expect("message");
        assert_eq!(message.text, "### Event\nUnhandled item type: hologram");
        assert!(chat_message_from_item(&json!({"id": "no-type"})).is_none());
    }

    #[test]
    fn restored_user_messages_carry_turn_provenance() {
        let turns = vec![
            ThreadTurn {
                id: "turn-a".to_string(),
                items: vec![
                    json!({"type": "userMessage", "content": [{"type": "text", "text": "one"}]}),
                    json!({"type": "agentMessage", "text": "first"}),
                ],
            },
            ThreadTurn {
                id: "turn-b".to_string(),
                items: vec![
                    json!({"type": "userMessage", "content": [{"type": "text", "text": "two"}]}),
                    json!({"type": "reasoning", "summary": ["think"], "content": []}),
                ],
            },
        ];
        let restored = restore_messages(&turns);
        assert_eq!(restored.len(), 4);
        assert_eq!(restored[0].source_turn_index, Some(0));
        assert_eq!(restored[0].source_turn_id.as_deref(), Some("turn-a"));
        assert!(restored[0].is_turn_boundary());
        assert_eq!(restored[1].source_turn_index, None);
        assert_eq!(restored[2].source_turn_index, Some(1));
        assert_eq!(restored[3].text, "### Reasoning\nthink");
    }

    #[test]
    fn legacy_exec_end_reads_snake_case_fields() {
        let message = legacy_exec_end(&json!({
            "call_id": "call-1",
            "command": ["bash", "-lc", "ls"],
            "cwd": "/work",
            "exit_code": 2,
            "duration": {"secs": 1, "nanos": 250_000_000},
            "stdout": "a",
            "stderr": "b"
        }))
        .expect("message");
        assert_eq!(
            message.text,
            "### Command Execution\nStatus: completed\nDirectory: /work\nExit code: 2\nDuration: 1250 ms\n\nCommand:\n```bash\nbash -lc ls\n```\n\nOutput:\n```text\na\nb\n```"
        );
    }

    #[test]
    fn legacy_patch_sections_are_sorted_by_path() {
        let message = legacy_patch_begin(&json!({
            "auto_approved": true,
            "changes": {
                "z.txt": {"type": "add", "content": "new"},
                "a.rs": {"type": "update", "unified_diff": "-a\n+b"}
            }
        }))
        .expect("message");
        assert_eq!(
            message.text,
            "### File Change\nStatus: inProgress\nApproval: auto\n\nPath: a.rs\nKind: update\n\n```diff\n-a\n+b\n```\n\n---\n\nPath: z.txt\nKind: add\n\n```text\nnew\n```"
        );

        let failed = legacy_patch_end(&json!({"success": false, "stderr": "conflict"}))
            .expect("message");
        assert_eq!(
            failed.text,
            "### File Change\nStatus: failed\n\nError:\n```text\nconflict\n```"
        );
    }

    #[test]
    fn legacy_mcp_end_with_err_result_fails() {
        let message = legacy_mcp_end(&json!({
            "invocation": {"server": "", "tool": "lookup", "arguments": {"q": "x"}},
            "result": {"Err": "boom"}
        }))
        .expect("message");
        assert!(message.text.starts_with("### MCP Tool Call\nStatus: failed\nTool: lookup"));
    }

    #[test]
    fn preview_uses_latest_conversational_message() {
        let messages = vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi"),
            ChatMessage::system("### Plan\nx"),
        ];
        assert_eq!(derive_preview(&messages, "old"), "hi");
        assert_eq!(derive_preview(&[], "old"), "old");
    }
}
