//! Boot-time environment configuration and the API-supplied runtime
//! configuration, plus the merge rules applied on every `watcher.config`.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::WatcherConfigData;

pub const DEFAULT_WS_URL: &str = "ws://localhost:8081/ws/watcher";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Immutable configuration read once at startup.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub ws_url: String,
    pub watcher_id: String,
    pub state_path: Option<PathBuf>,
}

/// Mutable configuration, replaced wholesale on each config delivery.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub watch_paths: Vec<PathBuf>,
    pub scan_on_start: bool,
    pub log_level: String,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub log_retention_days: u32,
    pub debug_log_retention_hours: u32,
    pub config_hash: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            watch_paths: Vec::new(),
            scan_on_start: false,
            log_level: "info".to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            ping_interval: DEFAULT_PING_INTERVAL,
            log_retention_days: 0,
            debug_log_retention_hours: 0,
            config_hash: String::new(),
        }
    }
}

impl RuntimeConfig {
    /// Build the next runtime config from an API payload. Durations absent
    /// from the payload keep their current values; an empty log level falls
    /// back to `info`.
    pub fn apply(&self, cfg: &WatcherConfigData) -> Self {
        let mut next = Self {
            watch_paths: cfg.watch_paths.clone(),
            scan_on_start: cfg.scan_on_start,
            log_level: cfg.log_level.clone(),
            reconnect_delay: self.reconnect_delay,
            ping_interval: self.ping_interval,
            log_retention_days: cfg.log_retention_days,
            debug_log_retention_hours: cfg.debug_log_retention_hours,
            config_hash: cfg.config_hash.clone(),
        };

        if let Some(secs) = cfg.reconnect_delay {
            if secs >= 1 {
                next.reconnect_delay = Duration::from_secs(secs);
            }
        }
        if let Some(secs) = cfg.ping_interval {
            if secs >= 1 {
                next.ping_interval = Duration::from_secs(secs);
            }
        }
        if next.log_level.is_empty() {
            next.log_level = "info".to_string();
        }

        next
    }
}
