//! Recursive media scanner: walks a root, enriches each media file with
//! metadata and a partial hash, and streams `scan.*` events. Individual
//! I/O failures are warnings; a scan never aborts on one unreadable entry.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::error::Result;
use crate::filter;
use crate::hash::partial_hash;
use crate::probe::FileMeta;
use crate::protocol::{
    EventPayload, ScanCompletedData, ScanFileData, ScanProgressData, ScanStartedData,
};
use crate::ws::EventSink;

/// Emit a `scan.progress` after this many files.
const PROGRESS_EVERY: u64 = 100;

pub struct Scanner {
    sink: Arc<dyn EventSink>,
}

struct ScanTotals {
    files: u64,
    dirs: u64,
    size_bytes: u64,
}

impl Scanner {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Walk `root` depth-first and report every processable file.
    pub async fn scan(&self, root: &Path, scan_id: &str) -> Result<()> {
        info!(path = %root.display(), scan_id, "starting scan");
        self.sink.emit(EventPayload::ScanStarted(ScanStartedData {
            scan_id: scan_id.to_string(),
            path: root.to_string_lossy().into_owned(),
        }));

        let started = Instant::now();
        let mut totals = ScanTotals {
            files: 0,
            dirs: 0,
            size_bytes: 0,
        };
        let mut stack: Vec<PathBuf> = Vec::new();

        match tokio::fs::symlink_metadata(root).await {
            Ok(md) if md.is_dir() => {
                totals.dirs += 1;
                stack.push(root.to_path_buf());
            }
            Ok(md) => {
                // A file root is scanned as a single candidate.
                self.visit_file(root, &md, scan_id, &mut totals).await;
            }
            Err(err) => {
                warn!(path = %root.display(), error = %err, "cannot access scan root");
            }
        }

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "cannot read directory");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(path = %dir.display(), error = %err, "directory iteration failed");
                        break;
                    }
                };
                let path = entry.path();
                let md = match tokio::fs::symlink_metadata(&path).await {
                    Ok(md) => md,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "cannot stat entry");
                        continue;
                    }
                };

                if md.is_dir() {
                    if filter::is_ignored_dir(&path.to_string_lossy()) {
                        continue;
                    }
                    totals.dirs += 1;
                    stack.push(path);
                } else {
                    self.visit_file(&path, &md, scan_id, &mut totals).await;
                }
            }
        }

        let completed = ScanCompletedData {
            scan_id: scan_id.to_string(),
            path: root.to_string_lossy().into_owned(),
            total_files: totals.files,
            total_dirs: totals.dirs,
            total_size_bytes: totals.size_bytes,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            path = %root.display(),
            scan_id,
            total_files = completed.total_files,
            total_dirs = completed.total_dirs,
            duration_ms = completed.duration_ms,
            "scan completed"
        );
        self.sink.emit(EventPayload::ScanCompleted(completed));
        Ok(())
    }

    async fn visit_file(
        &self,
        path: &Path,
        md: &Metadata,
        scan_id: &str,
        totals: &mut ScanTotals,
    ) {
        if !filter::should_process(&path.to_string_lossy()) {
            return;
        }

        let meta = FileMeta::from_metadata(md);
        let hash = match partial_hash(path).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "partial hash failed");
                String::new()
            }
        };

        totals.files += 1;
        totals.size_bytes += meta.size;

        self.sink.emit(EventPayload::ScanFile(ScanFileData {
            scan_id: scan_id.to_string(),
            path: path.to_string_lossy().into_owned(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size_bytes: meta.size,
            hardlink_count: meta.hardlink_count,
            is_dir: false,
            mod_time: meta.mod_time,
            partial_hash: hash,
        }));

        if totals.files % PROGRESS_EVERY == 0 {
            self.sink.emit(EventPayload::ScanProgress(ScanProgressData {
                scan_id: scan_id.to_string(),
                files_scanned: totals.files,
                dirs_scanned: totals.dirs,
            }));
        }
    }
}
