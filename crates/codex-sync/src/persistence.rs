use std::fs;
use std::path::{Path, PathBuf};

use codex_client::AppServerProcessConfig;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::model::ServerSource;
use crate::supervisor::ConnectionTarget;

const SAVED_SERVERS_SCHEMA_VERSION: u32 = 1;
const SAVED_SERVERS_FILE_NAME: &str = "codex-sync-servers.v1.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedServer {
    pub id: String,
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub source: ServerSource,
    #[serde(default)]
    pub has_codex_server: bool,
}

impl SavedServer {
    /// `None` for a remote server without a known app-server port.
    pub fn target(&self) -> Option<ConnectionTarget> {
        if self.source == ServerSource::Local {
            return Some(ConnectionTarget::Local(AppServerProcessConfig::default()));
        }
        self.port.map(|port| ConnectionTarget::Remote {
            host: self.hostname.clone(),
            port,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SavedServersDocument {
    version: u32,
    servers: Vec<SavedServer>,
}

#[derive(Debug, Clone, Default)]
pub struct SavedServerStore {
    path: PathBuf,
    servers: Vec<SavedServer>,
}

impl SavedServerStore {
    pub fn load_default() -> Self {
        Self::load(default_saved_servers_path())
    }

    /// Unreadable, corrupt or wrong-version files load as empty.
    pub fn load(path: PathBuf) -> Self {
        let Ok(raw) = fs::read_to_string(&path) else {
            return Self {
                path,
                servers: Vec::new(),
            };
        };
        let servers = match serde_json::from_str::<SavedServersDocument>(&raw) {
            Ok(document) if document.version == SAVED_SERVERS_SCHEMA_VERSION => document.servers,
            Ok(document) => {
                tracing::warn!(
                    path = %path.display(),
                    version = document.version,
                    "ignoring saved servers with unknown schema version"
                );
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring corrupt saved servers file");
                Vec::new()
            }
        };
        Self { path, servers }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn servers(&self) -> &[SavedServer] {
        &self.servers
    }

    pub fn get(&self, id: &str) -> Option<&SavedServer> {
        self.servers.iter().find(|server| server.id == id)
    }

    /// Insert or replace by id, then write the file.
    pub fn upsert(&mut self, server: SavedServer) -> SyncResult<()> {
        match self.servers.iter_mut().find(|existing| existing.id == server.id) {
            Some(existing) => *existing = server,
            None => self.servers.push(server),
        }
        self.flush()
    }

    pub fn remove(&mut self, id: &str) -> SyncResult<bool> {
        let before = self.servers.len();
        self.servers.retain(|server| server.id != id);
        if self.servers.len() == before {
            return Ok(false);
        }
        self.flush().map(|()| true)
    }

    /// Replace the whole set, e.g. with the currently connected servers.
    pub fn replace_all(&mut self, servers: Vec<SavedServer>) -> SyncResult<()> {
        self.servers = servers;
        self.flush()
    }

    fn flush(&self) -> SyncResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|error| SyncError::Persistence(format!("saved servers mkdir failed: {error}")))?;
        }
        let mut servers = self.servers.clone();
        servers.sort_by(|left, right| left.id.cmp(&right.id));
        let encoded = serde_json::to_string_pretty(&SavedServersDocument {
            version: SAVED_SERVERS_SCHEMA_VERSION,
            servers,
        })
        .map_err(|error| SyncError::Persistence(format!("saved servers encode failed: {error}")))?;
        fs::write(&self.path, encoded)
            .map_err(|error| SyncError::Persistence(format!("saved servers write failed: {error}")))
    }
}

pub fn default_saved_servers_path() -> PathBuf {
    if let Some(mut data_dir) = dirs::data_local_dir() {
        data_dir.push("openagents");
        data_dir.push(SAVED_SERVERS_FILE_NAME);
        return data_dir;
    }

    if let Some(mut home_dir) = dirs::home_dir() {
        home_dir.push(".openagents");
        home_dir.push(SAVED_SERVERS_FILE_NAME);
        return home_dir;
    }

    PathBuf::from(SAVED_SERVERS_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devbox() -> SavedServer {
        SavedServer {
            id: "tailscale:devbox".to_string(),
            name: "devbox".to_string(),
            hostname: "100.64.0.7".to_string(),
            port: Some(8390),
            source: ServerSource::Tailscale,
            has_codex_server: true,
        }
    }

    #[test]
    fn saved_servers_round_trip_through_disk() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("nested").join(SAVED_SERVERS_FILE_NAME);
        let mut store = SavedServerStore::load(path.clone());
        assert!(store.servers().is_empty());

        store.upsert(devbox()).expect("write");
        let mut renamed = devbox();
        renamed.name = "devbox (work)".to_string();
        store.upsert(renamed).expect("overwrite");

        let recovered = SavedServerStore::load(path.clone());
        assert_eq!(recovered.servers().len(), 1);
        assert_eq!(
            recovered.get("tailscale:devbox").map(|server| server.name.as_str()),
            Some("devbox (work)")
        );

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"version\": 1"));
        assert!(raw.contains("\"hasCodexServer\": true"));
    }

    #[test]
    fn wrong_version_and_corrupt_files_load_empty() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join(SAVED_SERVERS_FILE_NAME);

        fs::write(&path, r#"{"version": 2, "servers": []}"#).expect("write");
        assert!(SavedServerStore::load(path.clone()).servers().is_empty());

        fs::write(&path, "not json").expect("write");
        assert!(SavedServerStore::load(path).servers().is_empty());
    }

    #[test]
    fn targets_follow_source_and_port() {
        assert!(matches!(
            devbox().target(),
            Some(ConnectionTarget::Remote { port: 8390, .. })
        ));
        let ssh_only = SavedServer {
            port: None,
            source: ServerSource::Ssh,
            ..devbox()
        };
        assert!(ssh_only.target().is_none());
        let local = SavedServer {
            source: ServerSource::Local,
            port: None,
            ..devbox()
        };
        assert!(local.target().is_some_and(|target| target.is_local()));
    }
}
