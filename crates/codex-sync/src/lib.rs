//! Session synchronization engine for Codex app-server conversations.
//!
//! Keeps an observable, replay-safe view of threads across many connected
//! app-servers: connection supervision, notification routing for both wire
//! dialects, approval correlation, lineage operations and resync.

pub mod approvals;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod items;
pub mod lifecycle;
pub mod model;
pub mod persistence;
pub mod reconcile;
pub mod router;
pub mod store;
pub mod supervisor;

pub use approvals::{ApprovalCorrelator, ApprovalKind, PendingApproval};
pub use config::{RetryPolicy, SyncConfig};
pub use engine::{ServerSpec, SyncEngine};
pub use error::{OperationError, SyncError, SyncResult};
pub use events::{Dialect, SemanticEvent};
pub use lifecycle::{SessionContext, SessionLifecycle, rollback_depth};
pub use model::{
    AuthStatus, ChatImage, ChatMessage, MessageRole, ServerSource, ServerState, ThreadKey,
    ThreadState, ThreadStatus,
};
pub use persistence::{SavedServer, SavedServerStore};
pub use reconcile::{PreferLocalPolicy, Reconciler, SyncOutcome};
pub use router::{NotificationRouter, RequestOutcome, RouteOutcome};
pub use store::{StoreChange, ThreadStore};
pub use supervisor::{
    AppServerConnector, ConnectionHandler, ConnectionRegistry, ConnectionSupervisor,
    ConnectionTarget, Connector, ReadyConnection,
};
