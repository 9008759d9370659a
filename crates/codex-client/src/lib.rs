//! Codex app-server JSON-RPC transport.
//!
//! One [`AppServerClient`] owns one bidirectional connection to one app-server,
//! either newline-delimited JSON over a byte stream (spawned process stdio or an
//! in-memory pipe) or one JSON message per WebSocket text frame.

pub mod client;
pub mod types;

pub use client::{
    AppServerClient, AppServerError, AppServerInbound, AppServerInboundReceiver,
    AppServerNotification, AppServerProcessConfig, AppServerReader, AppServerRequest,
    AppServerRequestId, AppServerWireLog, AppServerWriter, is_codex_available,
};
pub use types::*;
