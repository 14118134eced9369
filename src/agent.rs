//! Agent supervisor: wires the connection client, watcher, scanner, and
//! deleter together, applies config updates, schedules startup and resync
//! scans, and routes inbound commands.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::deleter::Deleter;
use crate::fs_watch::FileWatcher;
use crate::logging;
use crate::protocol::{
    Command, EventPayload, StatusData, WatcherConfigData, REJECTED_TOKEN,
};
use crate::scanner::Scanner;
use crate::state::{PersistedState, StateStore};
use crate::ws::{Client, ClientHandler};

/// Grace period before startup and resync scans, letting the watch
/// subscriptions settle first.
const SCAN_SETTLE_DELAY: Duration = Duration::from_secs(2);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

pub struct Agent {
    client: Client,
    watcher: Arc<FileWatcher>,
    scanner: Arc<Scanner>,
    deleter: Arc<Deleter>,
    store: StateStore,
    runtime: Mutex<RuntimeConfig>,
    /// False until the first config has been applied; distinguishes the
    /// startup branch from hot reloads.
    configured: AtomicBool,
    started_at: Instant,
}

impl Agent {
    pub fn new(
        client: Client,
        watcher: Arc<FileWatcher>,
        scanner: Arc<Scanner>,
        deleter: Arc<Deleter>,
        store: StateStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            watcher,
            scanner,
            deleter,
            store,
            runtime: Mutex::new(RuntimeConfig::default()),
            configured: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    /// Emit `watcher.status` every minute for as long as the agent runs.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(HEARTBEAT_INTERVAL).await;
                let watched_paths = agent
                    .watcher
                    .watched_paths()
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect();
                agent.client.send(EventPayload::Status(StatusData {
                    status: "watching".to_string(),
                    watcher_id: agent.client.watcher_id().to_string(),
                    config_hash: agent.client.config_hash(),
                    watched_paths,
                    uptime_seconds: agent.started_at.elapsed().as_secs(),
                }));
            }
        });
    }

    async fn scan_sequentially(&self, paths: Vec<PathBuf>, trigger: &str) {
        for path in paths {
            let scan_id = Uuid::new_v4().to_string();
            info!(path = %path.display(), scan_id = %scan_id, trigger, "scan triggered");
            if let Err(err) = self.scanner.scan(&path, &scan_id).await {
                error!(path = %path.display(), error = %err, "scan failed");
            }
        }
    }

    fn spawn_scan(self: &Arc<Self>, path: PathBuf, trigger: &'static str) {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let scan_id = Uuid::new_v4().to_string();
            info!(path = %path.display(), scan_id = %scan_id, trigger, "scan triggered");
            if let Err(err) = agent.scanner.scan(&path, &scan_id).await {
                error!(path = %path.display(), error = %err, "scan failed");
            }
        });
    }

    fn persist(&self, config_hash: &str, runtime: &RuntimeConfig) {
        let state = PersistedState {
            auth_token: self.client.token().unwrap_or_default(),
            config_hash: config_hash.to_string(),
            config: Some(serde_json::json!({
                "log_level": runtime.log_level,
                "scan_on_start": runtime.scan_on_start,
                "watch_paths": runtime
                    .watch_paths
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect::<Vec<_>>(),
            })),
        };
        if let Err(err) = self.store.save(&state) {
            warn!(error = %err, "failed to save state");
        }
    }
}

#[async_trait]
impl ClientHandler for Arc<Agent> {
    async fn on_config(&self, cfg: WatcherConfigData) {
        if cfg.auth_token == REJECTED_TOKEN {
            warn!("token rejected, clearing state file");
            if let Err(err) = self.store.clear() {
                warn!(error = %err, "failed to clear state file");
            }
            return;
        }

        let next = {
            let mut runtime = self.runtime.lock().await;
            *runtime = runtime.apply(&cfg);
            runtime.clone()
        };

        self.client.set_reconnect_delay(next.reconnect_delay);
        self.client.set_ping_interval(next.ping_interval);
        self.persist(&next.config_hash, &next);
        logging::set_level(&next.log_level);

        let first = !self.configured.swap(true, Ordering::SeqCst);
        if first {
            // Startup: subscribe everything, then one sequential full
            // scan pass if asked for.
            for path in &next.watch_paths {
                if let Err(err) = self.watcher.add_path(path) {
                    error!(path = %path.display(), error = %err, "failed to add watch path");
                }
            }
            if next.scan_on_start && !next.watch_paths.is_empty() {
                let agent = Arc::clone(self);
                tokio::spawn(async move {
                    sleep(SCAN_SETTLE_DELAY).await;
                    agent.scan_sequentially(next.watch_paths.clone(), "startup").await;
                });
            }
        } else {
            // Hot reload: touch only the delta; surviving paths are not
            // rescanned.
            let existing: HashSet<PathBuf> = self.watcher.watched_paths().into_iter().collect();
            let desired: HashSet<PathBuf> = next.watch_paths.iter().cloned().collect();

            for path in desired.difference(&existing) {
                match self.watcher.add_path(path) {
                    Ok(()) => self.spawn_scan(path.clone(), "hot-reload"),
                    Err(err) => {
                        error!(path = %path.display(), error = %err, "failed to add watch path")
                    }
                }
            }
            for path in existing.difference(&desired) {
                if let Err(err) = self.watcher.remove_path(path) {
                    error!(path = %path.display(), error = %err, "failed to remove watch path");
                }
            }
        }
    }

    async fn on_command(&self, command: Command) {
        match command {
            Command::Scan(cmd) => {
                let agent = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = agent.scanner.scan(&cmd.path, &cmd.scan_id).await {
                        error!(path = %cmd.path.display(), error = %err, "scan failed");
                    }
                });
            }
            Command::WatchAdd(cmd) => {
                if let Err(err) = self.watcher.add_path(&cmd.path) {
                    error!(path = %cmd.path.display(), error = %err, "failed to add watch path");
                }
            }
            Command::WatchRemove(cmd) => {
                if let Err(err) = self.watcher.remove_path(&cmd.path) {
                    error!(path = %cmd.path.display(), error = %err, "failed to remove watch path");
                }
            }
            Command::FilesDelete(cmd) => {
                info!(
                    request_id = %cmd.request_id,
                    deletion_id = %cmd.deletion_id,
                    files = cmd.files.len(),
                    "received delete command"
                );
                let deleter = Arc::clone(&self.deleter);
                tokio::task::spawn_blocking(move || deleter.process_delete(cmd));
            }
            Command::FilesHardlink(cmd) => {
                info!(
                    request_id = %cmd.request_id,
                    deletion_id = %cmd.deletion_id,
                    source = %cmd.source_path.display(),
                    target = %cmd.target_path.display(),
                    "received hardlink command"
                );
                let deleter = Arc::clone(&self.deleter);
                tokio::task::spawn_blocking(move || deleter.process_hardlink(cmd));
            }
            Command::Other { kind } => debug!(kind, "unknown command"),
        }
    }

    async fn on_reconnect(&self) {
        info!("resync scan triggered after reconnection with dropped events");
        sleep(SCAN_SETTLE_DELAY).await;
        self.scan_sequentially(self.watcher.watched_paths(), "resync")
            .await;
    }
}
