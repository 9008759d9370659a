//! Thread state store shared by the router, lifecycle manager and reconciler.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;

use crate::model::{ServerState, ThreadKey, ThreadState};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// One observable mutation, emitted after the write lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Thread(ThreadKey),
    ThreadRemoved(ThreadKey),
    Active(Option<ThreadKey>),
    Server(String),
    ServerRemoved(String),
    Approvals,
}

#[derive(Default)]
struct StoreState {
    threads: HashMap<ThreadKey, ThreadState>,
    servers: HashMap<String, ServerState>,
    active: Option<ThreadKey>,
}

/// Cheap to clone; all clones share the same state and change channel.
#[derive(Clone)]
pub struct ThreadStore {
    state: Arc<RwLock<StoreState>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for ThreadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub(crate) fn change_sender(&self) -> broadcast::Sender<StoreChange> {
        self.changes.clone()
    }

    fn emit(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, key: &ThreadKey) -> Option<ThreadState> {
        self.read().threads.get(key).cloned()
    }

    pub fn contains(&self, key: &ThreadKey) -> bool {
        self.read().threads.contains_key(key)
    }

    pub fn all(&self) -> Vec<ThreadState> {
        self.read().threads.values().cloned().collect()
    }

    /// Most recently updated first.
    pub fn sorted_threads(&self) -> Vec<ThreadState> {
        let mut threads = self.all();
        threads.sort_by(|left, right| {
            right
                .updated_at
                .cmp(&left.updated_at)
                .then_with(|| left.key.cmp(&right.key))
        });
        threads
    }

    /// Mutate the thread, creating it first if it is unknown.
    pub fn upsert<R>(&self, key: &ThreadKey, mutate: impl FnOnce(&mut ThreadState) -> R) -> R {
        let result = {
            let mut state = self.write();
            let server = state
                .servers
                .get(&key.server_id)
                .map(|server| (server.name.clone(), server.source));
            let thread = state.threads.entry(key.clone()).or_insert_with(|| {
                let mut thread = ThreadState::new(key.clone());
                if let Some((name, source)) = server {
                    thread.server_name = name;
                    thread.server_source = source;
                }
                thread
            });
            mutate(thread)
        };
        self.emit(StoreChange::Thread(key.clone()));
        result
    }

    /// Mutate an existing thread; unknown keys are left alone.
    pub fn update<R>(
        &self,
        key: &ThreadKey,
        mutate: impl FnOnce(&mut ThreadState) -> R,
    ) -> Option<R> {
        let result = {
            let mut state = self.write();
            state.threads.get_mut(key).map(mutate)
        };
        if result.is_some() {
            self.emit(StoreChange::Thread(key.clone()));
        }
        result
    }

    pub fn remove(&self, key: &ThreadKey) -> Option<ThreadState> {
        let (removed, cleared_active) = {
            let mut state = self.write();
            let removed = state.threads.remove(key);
            let cleared_active = state.active.as_ref() == Some(key);
            if cleared_active {
                state.active = None;
            }
            (removed, cleared_active)
        };
        if removed.is_some() {
            self.emit(StoreChange::ThreadRemoved(key.clone()));
        }
        if cleared_active {
            self.emit(StoreChange::Active(None));
        }
        removed
    }

    pub fn active_key(&self) -> Option<ThreadKey> {
        self.read().active.clone()
    }

    pub fn active_thread(&self) -> Option<ThreadState> {
        let state = self.read();
        state
            .active
            .as_ref()
            .and_then(|key| state.threads.get(key))
            .cloned()
    }

    pub fn set_active(&self, key: Option<ThreadKey>) {
        {
            let mut state = self.write();
            if state.active == key {
                return;
            }
            state.active.clone_from(&key);
        }
        self.emit(StoreChange::Active(key));
    }

    pub fn insert_server(&self, server: ServerState) {
        let id = server.id.clone();
        {
            let mut state = self.write();
            for thread in state.threads.values_mut() {
                if thread.key.server_id == id {
                    thread.server_name.clone_from(&server.name);
                    thread.server_source = server.source;
                }
            }
            state.servers.insert(id.clone(), server);
        }
        self.emit(StoreChange::Server(id));
    }

    pub fn update_server<R>(
        &self,
        server_id: &str,
        mutate: impl FnOnce(&mut ServerState) -> R,
    ) -> Option<R> {
        let result = {
            let mut state = self.write();
            state.servers.get_mut(server_id).map(mutate)
        };
        if result.is_some() {
            self.emit(StoreChange::Server(server_id.to_string()));
        }
        result
    }

    pub fn server(&self, server_id: &str) -> Option<ServerState> {
        self.read().servers.get(server_id).cloned()
    }

    pub fn servers(&self) -> Vec<ServerState> {
        let mut servers: Vec<_> = self.read().servers.values().cloned().collect();
        servers.sort_by(|left, right| left.id.cmp(&right.id));
        servers
    }

    /// Drop the server and every thread it hosts.
    pub fn remove_server(&self, server_id: &str) {
        let (removed_threads, cleared_active, had_server) = {
            let mut state = self.write();
            let had_server = state.servers.remove(server_id).is_some();
            let keys: Vec<ThreadKey> = state
                .threads
                .keys()
                .filter(|key| key.server_id == server_id)
                .cloned()
                .collect();
            for key in &keys {
                state.threads.remove(key);
            }
            let cleared_active = state
                .active
                .as_ref()
                .is_some_and(|key| key.server_id == server_id);
            if cleared_active {
                state.active = None;
            }
            (keys, cleared_active, had_server)
        };
        for key in removed_threads {
            self.emit(StoreChange::ThreadRemoved(key));
        }
        if cleared_active {
            self.emit(StoreChange::Active(None));
        }
        if had_server {
            self.emit(StoreChange::ServerRemoved(server_id.to_string()));
        }
    }

    pub fn threads_on_server(&self, server_id: &str) -> Vec<ThreadKey> {
        let mut keys: Vec<_> = self
            .read()
            .threads
            .keys()
            .filter(|key| key.server_id == server_id)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Key for a notification, falling back to the active thread on that server and
    /// then to a thread with a running turn.
    pub fn resolve_thread_key(&self, server_id: &str, thread_id: Option<&str>) -> Option<ThreadKey> {
        if let Some(thread_id) = thread_id.filter(|id| !id.is_empty()) {
            return Some(ThreadKey::new(server_id, thread_id));
        }
        let state = self.read();
        if let Some(active) = state.active.as_ref()
            && active.server_id == server_id
        {
            return Some(active.clone());
        }
        let mut thinking: Vec<&ThreadState> = state
            .threads
            .values()
            .filter(|thread| thread.key.server_id == server_id && thread.has_turn_active())
            .collect();
        thinking.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        thinking.first().map(|thread| thread.key.clone())
    }
}
