use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;
use tracing::{error, info, warn};

use scanarr_watcher::agent::Agent;
use scanarr_watcher::config::DEFAULT_WS_URL;
use scanarr_watcher::deleter::Deleter;
use scanarr_watcher::fs_watch::FileWatcher;
use scanarr_watcher::logging;
use scanarr_watcher::scanner::Scanner;
use scanarr_watcher::state::StateStore;
use scanarr_watcher::ws::{Client, EventSink};

/// Filesystem watcher agent for the Scanarr control plane.
#[derive(Parser, Debug)]
#[command(name = "scanarr-watcher", version)]
struct Args {
    /// Control-plane WebSocket endpoint.
    #[arg(long, env = "WS_URL", default_value = DEFAULT_WS_URL)]
    ws_url: String,

    /// Stable identity of this agent.
    #[arg(long, env = "WATCHER_ID")]
    watcher_id: String,

    /// Override for the persisted state file location.
    #[arg(long, env = "STATE_PATH")]
    state_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let store = StateStore::new(args.state_path.clone());
    let cached = match store.load() {
        Ok(state) => state,
        Err(err) => {
            eprintln!("failed to load state file, starting fresh: {err}");
            Default::default()
        }
    };

    // Seed the level from the last applied config until fresh config lands.
    let provisional_level = cached
        .config
        .as_ref()
        .and_then(|cfg| cfg.get("log_level"))
        .and_then(|level| level.as_str())
        .unwrap_or("info")
        .to_string();
    logging::init(&provisional_level);

    info!(
        watcher_id = %args.watcher_id,
        ws_url = %args.ws_url,
        "scanarr watcher starting"
    );

    let client = Client::new(args.ws_url.clone(), args.watcher_id.clone());
    if !cached.auth_token.is_empty() {
        client.set_token(cached.auth_token.clone());
        info!("restored auth token from state");
    }

    let sink: Arc<dyn EventSink> = Arc::new(client.clone());
    let watcher = Arc::new(
        FileWatcher::new(Arc::clone(&sink)).context("failed to create file watcher")?,
    );
    let scanner = Arc::new(Scanner::new(Arc::clone(&sink)));
    let deleter = Arc::new(Deleter::new(Arc::clone(&sink)));

    let agent = Agent::new(
        client.clone(),
        Arc::clone(&watcher),
        scanner,
        deleter,
        store,
    );

    let connection = {
        let client = client.clone();
        let handler = agent.clone();
        tokio::spawn(async move {
            if let Err(err) = client.run(Arc::new(handler)).await {
                error!(error = %err, "connection client stopped");
            }
        })
    };

    watcher.start();
    agent.start_heartbeat();

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!(signal = "SIGINT", "shutting down"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "shutting down"),
    }

    watcher.close();
    client.close();
    if timeout(Duration::from_secs(5), connection).await.is_err() {
        warn!("connection client did not stop in time");
    }
    info!("shutdown complete");
    Ok(())
}
