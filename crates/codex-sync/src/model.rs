//! In-memory model of servers, threads and their message timelines.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary key of all per-thread state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey {
    pub server_id: String,
    pub thread_id: String,
}

impl ThreadKey {
    pub fn new(server_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            thread_id: thread_id.into(),
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_id, self.thread_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatImage {
    #[serde(with = "image_bytes")]
    pub data: Vec<u8>,
}

mod image_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: MessageRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ChatImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_turn_index: Option<usize>,
    #[serde(default)]
    pub is_turn_boundary_user_message: bool,
    /// Live item correlation; absent on restored and uncorrelated messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            images: Vec::new(),
            source_turn_id: None,
            source_turn_index: None,
            is_turn_boundary_user_message: false,
            item_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, text)
    }

    /// Mark as the user message that opened turn `index`.
    pub fn with_turn(mut self, turn_id: Option<String>, index: usize) -> Self {
        self.source_turn_id = turn_id;
        self.source_turn_index = Some(index);
        self.is_turn_boundary_user_message = true;
        self
    }

    pub fn with_item_id(mut self, item_id: Option<String>) -> Self {
        self.item_id = item_id;
        self
    }

    /// Equality that ignores live item correlation.
    pub fn structurally_equal(&self, other: &Self) -> bool {
        self.role == other.role
            && self.text == other.text
            && self.source_turn_id == other.source_turn_id
            && self.source_turn_index == other.source_turn_index
            && self.is_turn_boundary_user_message == other.is_turn_boundary_user_message
            && self.images == other.images
    }

    pub fn is_turn_boundary(&self) -> bool {
        self.role == MessageRole::User && self.is_turn_boundary_user_message
    }

    /// Title of a `### Title` system message.
    pub fn system_title(&self) -> Option<&str> {
        if self.role != MessageRole::System {
            return None;
        }
        let first_line = self.text.lines().next()?;
        first_line.strip_prefix("### ").map(str::trim)
    }

    pub fn is_tool_system_message(&self) -> bool {
        const TOOL_MARKERS: [&str; 6] = ["command", "file", "mcp", "web", "collab", "image"];
        self.system_title().is_some_and(|title| {
            let lowered = title.to_ascii_lowercase();
            TOOL_MARKERS.iter().any(|marker| lowered.contains(marker))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ThreadStatus {
    Idle,
    Connecting,
    Ready,
    Thinking,
    Error(String),
}

impl ThreadStatus {
    pub fn has_turn_active(&self) -> bool {
        matches!(self, Self::Thinking)
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Thinking => "thinking",
            Self::Error(_) => "error",
        }
    }
}

/// Positions of still-open live slots; cleared on turn completion and resync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveIndices {
    pub items: HashMap<String, usize>,
    pub turn_diffs: HashMap<String, usize>,
}

impl LiveIndices {
    pub fn clear(&mut self) {
        self.items.clear();
        self.turn_diffs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.turn_diffs.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerSource {
    Local,
    Bonjour,
    Tailscale,
    #[default]
    Manual,
    Ssh,
}

impl ServerSource {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Bonjour => "bonjour",
            Self::Tailscale => "tailscale",
            Self::Manual => "manual",
            Self::Ssh => "ssh",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadState {
    pub key: ThreadKey,
    pub server_name: String,
    pub server_source: ServerSource,
    pub messages: Vec<ChatMessage>,
    pub status: ThreadStatus,
    pub preview: String,
    pub cwd: String,
    pub model: String,
    pub model_provider: String,
    pub parent_thread_id: Option<String>,
    pub root_thread_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Turns acknowledged by the server; only used for rollback depth.
    pub turn_count: usize,
    pub active_turn_id: Option<String>,
    pub live: LiveIndices,
}

impl ThreadState {
    pub fn new(key: ThreadKey) -> Self {
        Self {
            key,
            server_name: String::new(),
            server_source: ServerSource::default(),
            messages: Vec::new(),
            status: ThreadStatus::Idle,
            preview: String::new(),
            cwd: String::new(),
            model: String::new(),
            model_provider: String::new(),
            parent_thread_id: None,
            root_thread_id: None,
            updated_at: Utc::now(),
            turn_count: 0,
            active_turn_id: None,
            live: LiveIndices::default(),
        }
    }

    pub fn has_turn_active(&self) -> bool {
        self.status.has_turn_active()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Replace the whole timeline; live slots point into the old list and are dropped.
    pub fn replace_messages(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
        self.live.clear();
        self.touch();
    }

    pub fn set_lineage(&mut self, parent: Option<&str>, root: Option<&str>) {
        self.parent_thread_id = sanitize_id(parent);
        self.root_thread_id = sanitize_id(root);
    }
}

pub(crate) fn sanitize_id(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AuthStatus {
    #[default]
    Unknown,
    NotLoggedIn,
    ApiKey,
    Chatgpt { email: Option<String> },
}

/// Observable per-server connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerState {
    pub id: String,
    pub name: String,
    pub source: ServerSource,
    pub connected: bool,
    pub phase: String,
    pub auth: AuthStatus,
    pub user_agent: Option<String>,
}

impl ServerState {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source: ServerSource) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source,
            connected: false,
            phase: String::new(),
            auth: AuthStatus::Unknown,
            user_agent: None,
        }
    }
}
