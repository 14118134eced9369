//! Wire protocol: JSON text frames shaped as
//! `{"type": ..., "timestamp": ..., "data": {...}}`.
//!
//! Outbound payloads are a tagged enum so the envelope shape is enforced by
//! the type system. Inbound frames are parsed once into [`Inbound`]: the
//! envelope is decoded, then `data` is deserialized per discriminant
//! without re-encoding.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel delivered through the config callback when the API rejects the
/// agent's token, so the supervisor can erase persisted state.
pub const REJECTED_TOKEN: &str = "__rejected__";

// ─── Outbound (agent → API) ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    #[serde(rename = "watcher.hello")]
    Hello(HelloData),
    #[serde(rename = "watcher.auth")]
    Auth(AuthData),
    #[serde(rename = "watcher.status")]
    Status(StatusData),
    #[serde(rename = "watcher.log")]
    Log(LogData),
    #[serde(rename = "file.created")]
    FileCreated(FileCreatedData),
    #[serde(rename = "file.modified")]
    FileModified(FileModifiedData),
    #[serde(rename = "file.deleted")]
    FileDeleted(FileDeletedData),
    #[serde(rename = "file.renamed")]
    FileRenamed(FileRenamedData),
    #[serde(rename = "scan.started")]
    ScanStarted(ScanStartedData),
    #[serde(rename = "scan.progress")]
    ScanProgress(ScanProgressData),
    #[serde(rename = "scan.file")]
    ScanFile(ScanFileData),
    #[serde(rename = "scan.completed")]
    ScanCompleted(ScanCompletedData),
    #[serde(rename = "files.delete.progress")]
    DeleteProgress(DeleteProgressData),
    #[serde(rename = "files.delete.completed")]
    DeleteCompleted(DeleteCompletedData),
    #[serde(rename = "files.hardlink.completed")]
    HardlinkCompleted(HardlinkCompletedData),
}

impl EventPayload {
    /// Wire name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Hello(_) => "watcher.hello",
            EventPayload::Auth(_) => "watcher.auth",
            EventPayload::Status(_) => "watcher.status",
            EventPayload::Log(_) => "watcher.log",
            EventPayload::FileCreated(_) => "file.created",
            EventPayload::FileModified(_) => "file.modified",
            EventPayload::FileDeleted(_) => "file.deleted",
            EventPayload::FileRenamed(_) => "file.renamed",
            EventPayload::ScanStarted(_) => "scan.started",
            EventPayload::ScanProgress(_) => "scan.progress",
            EventPayload::ScanFile(_) => "scan.file",
            EventPayload::ScanCompleted(_) => "scan.completed",
            EventPayload::DeleteProgress(_) => "files.delete.progress",
            EventPayload::DeleteCompleted(_) => "files.delete.completed",
            EventPayload::HardlinkCompleted(_) => "files.hardlink.completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HelloData {
    pub watcher_id: String,
    pub hostname: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthData {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusData {
    pub status: String,
    pub watcher_id: String,
    pub config_hash: String,
    pub watched_paths: Vec<String>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogData {
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileCreatedData {
    pub path: String,
    pub name: String,
    pub size_bytes: u64,
    pub hardlink_count: u64,
    pub inode: u64,
    pub device_id: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileModifiedData {
    pub path: String,
    pub name: String,
    pub size_bytes: u64,
    pub hardlink_count: u64,
    pub inode: u64,
    pub device_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileDeletedData {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRenamedData {
    pub old_path: String,
    pub new_path: String,
    pub name: String,
    pub size_bytes: u64,
    pub hardlink_count: u64,
    pub inode: u64,
    pub device_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanStartedData {
    pub scan_id: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanProgressData {
    pub scan_id: String,
    pub files_scanned: u64,
    pub dirs_scanned: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanFileData {
    pub scan_id: String,
    pub path: String,
    pub name: String,
    pub size_bytes: u64,
    pub hardlink_count: u64,
    pub is_dir: bool,
    pub mod_time: DateTime<Utc>,
    pub partial_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanCompletedData {
    pub scan_id: String,
    pub path: String,
    pub total_files: u64,
    pub total_dirs: u64,
    pub total_size_bytes: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteStatus {
    Deleted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteProgressData {
    pub request_id: String,
    pub deletion_id: String,
    pub media_file_id: String,
    pub status: DeleteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dirs_removed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteResultItem {
    pub media_file_id: String,
    pub status: DeleteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dirs_removed: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteCompletedData {
    pub request_id: String,
    pub deletion_id: String,
    pub total: u64,
    pub deleted: u64,
    pub failed: u64,
    pub dirs_removed: u64,
    pub results: Vec<DeleteResultItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HardlinkStatus {
    Created,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardlinkCompletedData {
    pub request_id: String,
    pub deletion_id: String,
    pub status: HardlinkStatus,
    pub source_path: String,
    pub target_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Inbound (API → agent) ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// A fully decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    AuthRequired,
    Pending,
    Config(WatcherConfigData),
    Rejected { reason: Option<String> },
    Command(Command),
}

/// Inbound frames the connection client does not consume itself.
#[derive(Debug, Clone)]
pub enum Command {
    Scan(ScanCommand),
    WatchAdd(WatchPathCommand),
    WatchRemove(WatchPathCommand),
    FilesDelete(DeleteCommand),
    FilesHardlink(HardlinkCommand),
    Other { kind: String },
}

impl Inbound {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let envelope: InboundEnvelope = serde_json::from_str(text)?;
        let data = envelope.data;
        Ok(match envelope.kind.as_str() {
            "watcher.auth_required" => Inbound::AuthRequired,
            "watcher.pending" => Inbound::Pending,
            "watcher.config" => Inbound::Config(serde_json::from_value(data)?),
            "watcher.rejected" => {
                let rejected: RejectedData = serde_json::from_value(data).unwrap_or_default();
                Inbound::Rejected {
                    reason: rejected.reason,
                }
            }
            "command.scan" => Inbound::Command(Command::Scan(serde_json::from_value(data)?)),
            "command.watch.add" => {
                Inbound::Command(Command::WatchAdd(serde_json::from_value(data)?))
            }
            "command.watch.remove" => {
                Inbound::Command(Command::WatchRemove(serde_json::from_value(data)?))
            }
            "command.files.delete" => {
                Inbound::Command(Command::FilesDelete(serde_json::from_value(data)?))
            }
            "command.files.hardlink" => {
                Inbound::Command(Command::FilesHardlink(serde_json::from_value(data)?))
            }
            other => Inbound::Command(Command::Other {
                kind: other.to_string(),
            }),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RejectedData {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatcherConfigData {
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,
    #[serde(default)]
    pub scan_on_start: bool,
    #[serde(default)]
    pub log_level: String,
    /// Seconds; absent or zero keeps the current value.
    #[serde(default)]
    pub reconnect_delay: Option<u64>,
    /// Seconds; absent or zero keeps the current value.
    #[serde(default)]
    pub ping_interval: Option<u64>,
    #[serde(default)]
    pub log_retention_days: u32,
    #[serde(default)]
    pub debug_log_retention_hours: u32,
    #[serde(default)]
    pub config_hash: String,
    /// Only set on first approval (or as the rejection sentinel).
    #[serde(default)]
    pub auth_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanCommand {
    pub path: PathBuf,
    pub scan_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchPathCommand {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteCommand {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub deletion_id: String,
    #[serde(default)]
    pub files: Vec<DeleteFileSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteFileSpec {
    pub media_file_id: String,
    pub volume_path: PathBuf,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HardlinkCommand {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub deletion_id: String,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub volume_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_envelope_shape() {
        let msg = OutboundMessage::new(EventPayload::Hello(HelloData {
            watcher_id: "w1".into(),
            hostname: "host".into(),
            version: "1.5.0".into(),
        }));
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "watcher.hello");
        assert_eq!(value["data"]["watcher_id"], "w1");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn delete_status_serializes_lowercase() {
        let progress = EventPayload::DeleteProgress(DeleteProgressData {
            request_id: "r".into(),
            deletion_id: "d".into(),
            media_file_id: "m".into(),
            status: DeleteStatus::Failed,
            error: Some("boom".into()),
            dirs_removed: 0,
        });
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["type"], "files.delete.progress");
        assert_eq!(value["data"]["status"], "failed");
        assert_eq!(value["data"]["error"], "boom");
    }

    #[test]
    fn error_field_omitted_on_success() {
        let done = EventPayload::HardlinkCompleted(HardlinkCompletedData {
            request_id: "r".into(),
            deletion_id: "d".into(),
            status: HardlinkStatus::Created,
            source_path: "/vol/a".into(),
            target_path: "/vol/b".into(),
            error: None,
        });
        let value = serde_json::to_value(&done).unwrap();
        assert_eq!(value["data"]["status"], "created");
        assert!(value["data"].get("error").is_none());
    }

    #[test]
    fn parse_config_frame() {
        let raw = r#"{
            "type": "watcher.config",
            "timestamp": "2026-01-01T00:00:00Z",
            "data": {
                "watch_paths": ["/data", "/media"],
                "scan_on_start": true,
                "log_level": "debug",
                "reconnect_delay": 10,
                "config_hash": "abc",
                "auth_token": "tok"
            }
        }"#;
        match Inbound::parse(raw).unwrap() {
            Inbound::Config(cfg) => {
                assert_eq!(cfg.watch_paths.len(), 2);
                assert!(cfg.scan_on_start);
                assert_eq!(cfg.log_level, "debug");
                assert_eq!(cfg.reconnect_delay, Some(10));
                assert_eq!(cfg.ping_interval, None);
                assert_eq!(cfg.config_hash, "abc");
                assert_eq!(cfg.auth_token, "tok");
            }
            other => panic!("expected config, got {other:?}"),
        }
    }

    #[test]
    fn parse_lifecycle_frames() {
        assert!(matches!(
            Inbound::parse(r#"{"type":"watcher.auth_required"}"#).unwrap(),
            Inbound::AuthRequired
        ));
        assert!(matches!(
            Inbound::parse(r#"{"type":"watcher.pending","data":{"watcher_id":"w1"}}"#).unwrap(),
            Inbound::Pending
        ));
        match Inbound::parse(r#"{"type":"watcher.rejected","data":{"reason":"revoked"}}"#).unwrap()
        {
            Inbound::Rejected { reason } => assert_eq!(reason.as_deref(), Some("revoked")),
            other => panic!("expected rejected, got {other:?}"),
        }
    }

    #[test]
    fn parse_delete_command() {
        let raw = r#"{
            "type": "command.files.delete",
            "data": {
                "request_id": "req-1",
                "deletion_id": "del-1",
                "files": [
                    {"media_file_id": "m1", "volume_path": "/vol", "file_path": "Movies/a.mkv"}
                ]
            }
        }"#;
        match Inbound::parse(raw).unwrap() {
            Inbound::Command(Command::FilesDelete(cmd)) => {
                assert_eq!(cmd.request_id, "req-1");
                assert_eq!(cmd.files.len(), 1);
                assert_eq!(cmd.files[0].media_file_id, "m1");
            }
            other => panic!("expected delete command, got {other:?}"),
        }
    }

    #[test]
    fn unknown_types_become_other_commands() {
        match Inbound::parse(r#"{"type":"command.future","data":{}}"#).unwrap() {
            Inbound::Command(Command::Other { kind }) => assert_eq!(kind, "command.future"),
            other => panic!("expected other, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(Inbound::parse("{not json").is_err());
    }
}
