use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use codex_client::{AskForApproval, ClientInfo, SandboxMode};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::reconcile::PreferLocalPolicy;

const CONFIG_FILE_NAME: &str = "codex-sync.toml";

/// Attempt budget for one connect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub initialize_timeout_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl RetryPolicy {
    /// In-process or spawned servers need time to boot.
    pub const fn local() -> Self {
        Self {
            max_attempts: 30,
            retry_delay_ms: 800,
            initialize_timeout_ms: 6_000,
            attempt_timeout_ms: 12_000,
        }
    }

    pub const fn remote() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 300,
            initialize_timeout_ms: 4_000,
            attempt_timeout_ms: 5_000,
        }
    }

    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub const fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::remote()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub client_name: String,
    pub client_title: Option<String>,
    pub client_version: String,
    pub local_retry: RetryPolicy,
    pub remote_retry: RetryPolicy,
    pub prefer_local: PreferLocalPolicy,
    pub default_approval_policy: AskForApproval,
    pub default_sandbox_mode: Option<SandboxMode>,
    pub websocket_connect_timeout_ms: u64,
    pub saved_servers_path: Option<PathBuf>,
    pub wire_log_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_name: "codex-sync".to_string(),
            client_title: Some("Codex Sync".to_string()),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            local_retry: RetryPolicy::local(),
            remote_retry: RetryPolicy::remote(),
            prefer_local: PreferLocalPolicy::default(),
            default_approval_policy: AskForApproval::Never,
            default_sandbox_mode: None,
            websocket_connect_timeout_ms: 5_000,
            saved_servers_path: None,
            wire_log_path: None,
        }
    }
}

impl SyncConfig {
    /// Missing file yields defaults; a malformed file is an error.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(SyncError::Config(format!(
                    "read {} failed: {err}",
                    path.display()
                )));
            }
        };
        toml::from_str(&raw)
            .map_err(|err| SyncError::Config(format!("parse {} failed: {err}", path.display())))
    }

    pub fn load_default() -> SyncResult<Self> {
        Self::load(&default_config_path())
    }

    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            name: self.client_name.clone(),
            title: self.client_title.clone(),
            version: self.client_version.clone(),
        }
    }

    pub const fn websocket_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.websocket_connect_timeout_ms)
    }
}

pub fn default_config_path() -> PathBuf {
    if let Some(mut config_dir) = dirs::config_dir() {
        config_dir.push("openagents");
        config_dir.push(CONFIG_FILE_NAME);
        return config_dir;
    }

    if let Some(mut home_dir) = dirs::home_dir() {
        home_dir.push(".openagents");
        home_dir.push(CONFIG_FILE_NAME);
        return home_dir;
    }

    PathBuf::from(CONFIG_FILE_NAME)
}
