//! Replays recorded realtime run events through the session layer and prints
//! the resulting run tree as JSON.
//!
//! Run with: cargo run -p run-replay -- demos/run-replay/data/workflow.jsonl

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use agent_console_core::{AuthStatusCell, RunEvent, RunKind, RunRequest, StreamingRunStore};
use agent_console_session::{MemoryHistory, ReplayLauncher, SessionManager};
use agent_console_transport::{BackendHealthInterceptor, ClientConfig, HttpTransport, LogNotifier};
use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "run-replay", about = "Replay run events and print the run tree")]
struct Args {
    /// JSON-lines file of realtime events (`data:` prefixes are accepted).
    events: PathBuf,

    /// Session the events belong to.
    #[arg(long, env = "RUN_REPLAY_SESSION", default_value = "replay")]
    session: String,

    /// Client configuration file.
    #[arg(long, env = "AGENT_CONSOLE_CONFIG")]
    config: Option<String>,

    /// Probe the execution backend first and gate streaming on its status.
    #[arg(long)]
    probe: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ClientConfig::load(args.config.as_deref()).context("loading configuration")?;
    let events = read_events(&args.events)?;
    tracing::info!(events = events.len(), path = %args.events.display(), "Loaded events");

    let store = if args.probe {
        let auth = AuthStatusCell::new();
        let backend = BackendHealthInterceptor::new(
            HttpTransport::new(&config)?,
            &config,
            auth.clone(),
            Arc::new(LogNotifier),
        )?;
        let status = backend.probe().await;
        tracing::info!(?status, url = %config.agent_os.base_url, "Backend probed");
        StreamingRunStore::with_auth_gate(auth)
    } else {
        StreamingRunStore::new()
    };

    let history = Arc::new(MemoryHistory::new());
    let launcher = ReplayLauncher::new().recording_into(Arc::clone(&history));
    launcher.push_script(events);
    let manager = SessionManager::new(Arc::new(store), history, launcher);

    let request = RunRequest::new(args.session.clone(), RunKind::Agent, "replay", "replay");
    let mut started = manager.start_run(request).await?;
    match started.confirmed_run_id().await {
        Some(run_id) => tracing::info!(%run_id, "Run confirmed"),
        None => tracing::warn!("Replay ended without a root start event"),
    }
    started.finished.await.context("event pump panicked")?;

    let tree = manager.store().run_tree(&args.session);
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

fn read_events(path: &Path) -> anyhow::Result<Vec<RunEvent>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            RunEvent::from_json_line(line).with_context(|| format!("line {}", idx + 1))
        })
        .collect()
}
