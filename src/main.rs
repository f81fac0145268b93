//! # flowsync
//!
//! Command-line driver for the synchronization core: send work to a flow's
//! sessions and stream the reply, or keep a flow's document persisted while
//! it is being edited elsewhere.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowsync_core::ids::FlowId;
use flowsync_session::{ControllerNotice, SessionController};
use flowsync_settings::SyncSettings;
use flowsync_store::{
    HttpDocumentService, PersistenceConfig, PersistenceNotice, PersistencePipeline, ReconciliationStore,
};
use flowsync_stream::{ApiClient, ConnectionRegistry, HttpSessionApi, HttpTransport};
use tokio::sync::broadcast::error::RecvError;

/// Flow editor synchronization client.
#[derive(Parser, Debug)]
#[command(name = "flowsync", about = "Flow editor synchronization client")]
struct Cli {
    /// Settings file (defaults to `~/.flowsync/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a request to a flow, one of its tasks, or a task detail, and
    /// stream the reply until the session settles.
    Send {
        /// Flow id.
        flow_id: String,
        /// Request text.
        content: String,
        /// Address the session of this task.
        #[arg(long)]
        task: Option<usize>,
        /// Address the session of this detail step (requires `--task`).
        #[arg(long, requires = "task")]
        detail: Option<usize>,
    },
    /// Load a flow and keep it persisted until interrupted.
    Watch {
        /// Flow id.
        flow_id: String,
    },
}

/// Everything wired to one flow.
struct Wiring {
    store: Arc<ReconciliationStore>,
    pipeline: PersistencePipeline,
    registry: Arc<ConnectionRegistry>,
    client: ApiClient,
}

impl Wiring {
    fn new(settings: &SyncSettings) -> Result<Self> {
        let client = ApiClient::from_settings(settings).context("Failed to build API client")?;
        let registry = ConnectionRegistry::new(
            Arc::new(HttpTransport::new(client.clone())),
            settings.stream.idle_timeout(),
        );
        let store = Arc::new(ReconciliationStore::new(settings.persistence.history_limit));
        let pipeline = PersistencePipeline::new(
            Arc::clone(&store),
            Arc::new(HttpDocumentService::new(client.clone())),
            PersistenceConfig::from(&settings.persistence),
        );
        Ok(Self {
            store,
            pipeline,
            registry,
            client,
        })
    }

    fn shutdown(&self) {
        self.pipeline.shutdown();
        let _ = self.registry.shutdown();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args.settings.clone().unwrap_or_else(flowsync_settings::settings_path);
    let settings = flowsync_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    let mut logging = settings.logging.clone();
    if let Some(level) = &args.log_level {
        logging.level.clone_from(level);
    }
    flowsync_logging::init_from_settings(&logging);
    tracing::debug!(path = %settings_path.display(), base_url = %settings.api.base_url, "settings loaded");

    match args.command {
        Command::Send {
            flow_id,
            content,
            task,
            detail,
        } => send(&settings, FlowId::from(flow_id.as_str()), &content, task, detail).await,
        Command::Watch { flow_id } => watch(&settings, FlowId::from(flow_id.as_str())).await,
    }
}

async fn send(
    settings: &SyncSettings,
    flow_id: FlowId,
    content: &str,
    task: Option<usize>,
    detail: Option<usize>,
) -> Result<()> {
    let wiring = Wiring::new(settings)?;
    wiring
        .pipeline
        .load(&flow_id)
        .await
        .with_context(|| format!("Failed to load flow {flow_id}"))?;

    let controller = SessionController::new(
        flow_id.clone(),
        Arc::clone(&wiring.registry),
        Arc::new(HttpSessionApi::new(wiring.client.clone())),
        Arc::clone(&wiring.store),
    );
    if let Err(e) = controller.refresh_agent_state().await {
        tracing::warn!(error = %e, "continuing without current agent state");
    }

    let mut notices = controller.notices();
    let session = controller
        .start_processing(content, task, detail)
        .await
        .context("Request was not accepted")?;
    tracing::info!(session_id = %session, "request accepted");

    let outcome = tokio::select! {
        outcome = stream_notices(&mut notices) => outcome,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::info!("interrupted");
            Ok(())
        }
    };

    controller.shutdown();
    // flush generated nodes before exiting
    if let Err(e) = wiring.pipeline.save_now().await {
        tracing::warn!(error = %e, "final save failed");
    }
    wiring.shutdown();
    outcome
}

async fn stream_notices(notices: &mut tokio::sync::broadcast::Receiver<ControllerNotice>) -> Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        let notice = match notices.recv().await {
            Ok(notice) => notice,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "notice receiver lagged");
                continue;
            }
            Err(RecvError::Closed) => return Ok(()),
        };
        match notice {
            ControllerNotice::Token(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            ControllerNotice::ToolStarted { name } => {
                writeln!(stdout, "\n[tool] {} started", name.as_deref().unwrap_or("tool"))?;
            }
            ControllerNotice::ToolFinished { name } => {
                writeln!(stdout, "[tool] {} finished", name.as_deref().unwrap_or("tool"))?;
            }
            ControllerNotice::TaskProgress(progress) => {
                writeln!(
                    stdout,
                    "[task {}] {}: {}",
                    progress.task_index, progress.task_name, progress.status
                )?;
            }
            ControllerNotice::FallbackAdopted { derived, fallback } => {
                writeln!(stdout, "[session] {derived} unknown, continuing on {fallback}")?;
            }
            ControllerNotice::AgentStateChanged { tasks_changed } => {
                if tasks_changed {
                    writeln!(stdout, "[agent] task list updated")?;
                }
            }
            ControllerNotice::Error { session_id, error } => {
                writeln!(stdout)?;
                return Err(anyhow::Error::new(error).context(format!("Session {session_id} failed")));
            }
            ControllerNotice::Settled { .. } => {
                writeln!(stdout)?;
                return Ok(());
            }
        }
    }
}

async fn watch(settings: &SyncSettings, flow_id: FlowId) -> Result<()> {
    let wiring = Wiring::new(settings)?;
    let mut notices = wiring.pipeline.notices();
    wiring
        .pipeline
        .load(&flow_id)
        .await
        .with_context(|| format!("Failed to load flow {flow_id}"))?;
    let document = wiring.store.document();
    tracing::info!(
        flow_id = %flow_id,
        nodes = document.nodes.len(),
        edges = document.edges.len(),
        "watching flow"
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                break;
            }
            notice = notices.recv() => match notice {
                Ok(PersistenceNotice::Saved { flow_id }) => println!("saved {flow_id}"),
                Ok(PersistenceNotice::SaveFailed { flow_id, error }) => {
                    println!("save of {flow_id} failed: {error}");
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "notice receiver lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("Shutting down...");
    if let Err(e) = wiring.pipeline.save_now().await {
        tracing::warn!(error = %e, "final save failed");
    }
    wiring.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_send_defaults() {
        let cli = Cli::parse_from(["flowsync", "send", "F1", "add a review step"]);
        let Command::Send {
            flow_id,
            content,
            task,
            detail,
        } = cli.command
        else {
            panic!("expected send");
        };
        assert_eq!(flow_id, "F1");
        assert_eq!(content, "add a review step");
        assert_eq!(task, None);
        assert_eq!(detail, None);
        assert_eq!(cli.settings, None);
    }

    #[test]
    fn cli_send_with_task_and_detail() {
        let cli = Cli::parse_from(["flowsync", "send", "F1", "x", "--task", "2", "--detail", "0"]);
        let Command::Send { task, detail, .. } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(task, Some(2));
        assert_eq!(detail, Some(0));
    }

    #[test]
    fn cli_detail_requires_task() {
        assert!(Cli::try_parse_from(["flowsync", "send", "F1", "x", "--detail", "0"]).is_err());
    }

    #[test]
    fn cli_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "flowsync",
            "watch",
            "F1",
            "--settings",
            "/tmp/s.json",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/s.json")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::Watch { ref flow_id } if flow_id == "F1"));
    }
}
