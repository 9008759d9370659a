use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use codex_client::AppServerProcessConfig;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;

use crate::config::{SyncConfig, default_config_path};
use crate::engine::{ServerSpec, SyncEngine};
use crate::model::{ServerSource, ThreadKey, ThreadState};
use crate::persistence::SavedServerStore;
use crate::store::StoreChange;
use crate::supervisor::ConnectionTarget;

#[derive(Parser)]
#[command(name = "codex-sync")]
#[command(about = "Codex app-server session sync")]
pub struct SyncCli {
    /// Config file; defaults to the per-user openagents config dir.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List threads on one server
    Threads(ServerArgs),
    /// Resume a thread and stream its changes as JSON lines
    Watch(WatchArgs),
    /// Print saved servers
    Servers,
}

#[derive(Args, Clone)]
#[group(required = true, multiple = false)]
pub struct ServerArgs {
    /// Remote app-server, e.g. ws://devbox:8390
    #[arg(long)]
    pub url: Option<String>,
    /// Spawn a local app-server
    #[arg(long)]
    pub local: bool,
}

#[derive(Args)]
pub struct WatchArgs {
    pub thread_id: String,
    #[command(flatten)]
    pub server: ServerArgs,
    #[arg(long)]
    pub cwd: Option<String>,
}

impl ServerArgs {
    fn spec(&self) -> ServerSpec {
        match &self.url {
            Some(url) => ServerSpec {
                id: format!("manual:{url}"),
                name: url.clone(),
                source: ServerSource::Manual,
                target: ConnectionTarget::Url(url.clone()),
            },
            None => ServerSpec {
                id: "local".to_string(),
                name: "This machine".to_string(),
                source: ServerSource::Local,
                target: ConnectionTarget::Local(AppServerProcessConfig::default()),
            },
        }
    }
}

pub async fn run(cli: SyncCli) -> anyhow::Result<()> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = SyncConfig::load(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;

    match cli.command {
        Commands::Servers => {
            let saved = match &config.saved_servers_path {
                Some(path) => SavedServerStore::load(path.clone()),
                None => SavedServerStore::load_default(),
            };
            let mut stdout = std::io::stdout().lock();
            for server in saved.servers() {
                writeln!(stdout, "{}", serde_json::to_string(server)?)?;
            }
            Ok(())
        }
        Commands::Threads(args) => {
            let engine = SyncEngine::new(config);
            let spec = args.spec();
            let server_id = spec.id.clone();
            engine.add_server(spec).await.context("connect to app-server")?;
            engine
                .refresh_sessions(&server_id)
                .await
                .context("list threads")?;
            {
                let mut stdout = std::io::stdout().lock();
                for thread in engine.store().sorted_threads() {
                    writeln!(stdout, "{}", thread_line(&thread))?;
                }
            }
            engine.shutdown().await;
            Ok(())
        }
        Commands::Watch(args) => watch(config, args).await,
    }
}

async fn watch(config: SyncConfig, args: WatchArgs) -> anyhow::Result<()> {
    let engine = SyncEngine::new(config);
    let spec = args.server.spec();
    let key = ThreadKey::new(&spec.id, args.thread_id.trim());
    let mut changes = engine.subscribe();
    engine.add_server(spec).await.context("connect to app-server")?;

    let mut ctx = engine.context();
    ctx.cwd = args.cwd;
    engine
        .view_thread(&key, &ctx)
        .await
        .with_context(|| format!("resume thread {}", key.thread_id))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => {
                let change = match change {
                    Ok(change) => change,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "watch output fell behind");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let line = match change {
                    StoreChange::Thread(changed) if changed == key => {
                        engine.store().get(&changed).map(|thread| thread_line(&thread))
                    }
                    StoreChange::Server(server_id) => engine.store().server(&server_id).map(|server| {
                        json!({
                            "event": "server",
                            "serverId": server.id,
                            "connected": server.connected,
                            "phase": server.phase,
                        })
                    }),
                    StoreChange::Approvals => Some(json!({
                        "event": "approvals",
                        "pending": engine
                            .pending_approvals()
                            .iter()
                            .map(|approval| json!({
                                "requestId": approval.request_id,
                                "method": approval.method,
                                "command": approval.command,
                                "cwd": approval.cwd,
                            }))
                            .collect::<Vec<_>>(),
                    })),
                    _ => None,
                };
                if let Some(line) = line {
                    let mut stdout = std::io::stdout().lock();
                    writeln!(stdout, "{line}")?;
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn thread_line(thread: &ThreadState) -> Value {
    json!({
        "event": "thread",
        "serverId": thread.key.server_id,
        "threadId": thread.key.thread_id,
        "status": thread.status.label(),
        "preview": thread.preview,
        "cwd": thread.cwd,
        "modelProvider": thread.model_provider,
        "parentThreadId": thread.parent_thread_id,
        "rootThreadId": thread.root_thread_id,
        "updatedAt": thread.updated_at.to_rfc3339(),
        "turnCount": thread.turn_count,
        "messages": thread.messages.len(),
        "last": thread.messages.last(),
    })
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use clap::error::ErrorKind;

    use super::{Commands, SyncCli};

    #[test]
    fn cli_requires_subcommand() {
        let err = match SyncCli::try_parse_from(["codex-sync"]) {
            Ok(_) => panic!("expected missing subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn threads_needs_exactly_one_server() {
        assert!(SyncCli::try_parse_from(["codex-sync", "threads"]).is_err());
        assert!(
            SyncCli::try_parse_from(["codex-sync", "threads", "--local", "--url", "ws://h:1"])
                .is_err()
        );
        let cli = match SyncCli::try_parse_from(["codex-sync", "threads", "--url", "ws://devbox:8390"]) {
            Ok(cli) => cli,
            Err(err) => panic!("parse failed: {err}"),
        };
        let Commands::Threads(args) = cli.command else {
            panic!("expected threads command");
        };
        let spec = args.spec();
        assert_eq!(spec.id, "manual:ws://devbox:8390");
        assert!(!spec.target.is_local());
    }

    #[test]
    fn watch_takes_thread_and_server() {
        let cli = match SyncCli::try_parse_from(["codex-sync", "watch", "thr_1", "--local", "--cwd", "/work"]) {
            Ok(cli) => cli,
            Err(err) => panic!("parse failed: {err}"),
        };
        let Commands::Watch(args) = cli.command else {
            panic!("expected watch command");
        };
        assert_eq!(args.thread_id, "thr_1");
        assert_eq!(args.cwd.as_deref(), Some("/work"));
        assert!(args.server.spec().target.is_local());
    }
}
