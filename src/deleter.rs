//! Command-driven filesystem mutation: safe deletes with companion-file
//! cleanup and empty-directory ascent, and hardlink creation. Every
//! operation is confined to its declared volume root; a resolved path that
//! escapes it fails that item without touching the disk.
//!
//! All functions here do blocking I/O; the supervisor runs them on the
//! blocking pool.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::filter;
use crate::protocol::{
    DeleteCommand, DeleteCompletedData, DeleteFileSpec, DeleteProgressData, DeleteResultItem,
    DeleteStatus, EventPayload, HardlinkCommand, HardlinkCompletedData, HardlinkStatus,
};
use crate::ws::EventSink;

const TRAVERSAL_RESOLVED: &str =
    "path traversal detected: resolved path is outside volume root";
const TRAVERSAL_SOURCE: &str = "path traversal detected: source path is outside volume root";
const TRAVERSAL_TARGET: &str = "path traversal detected: target path is outside volume root";

/// Lexically normalize a path: drop `.`, resolve `..` against preceding
/// components (never above the root), keep the result rooted.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) => out.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    // Relative paths keep leading `..`; absolute ones stop
                    // at the root, matching lexical cleaning.
                    if !out.has_root() {
                        out.push(Component::ParentDir.as_os_str());
                    }
                }
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Drop root/prefix components so the requested file path joins under the
/// volume even when it arrives absolute.
fn relative_part(path: &Path) -> PathBuf {
    path.components()
        .filter(|comp| {
            matches!(
                comp,
                Component::Normal(_) | Component::ParentDir | Component::CurDir
            )
        })
        .collect()
}

fn is_strictly_under(path: &Path, root: &Path) -> bool {
    path != root && path.starts_with(root)
}

pub struct Deleter {
    sink: Arc<dyn EventSink>,
}

impl Deleter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Execute a delete batch, emitting per-file progress and a final
    /// summary. Failures never abort the batch.
    pub fn process_delete(&self, cmd: DeleteCommand) {
        let mut deleted = 0u64;
        let mut failed = 0u64;
        let mut dirs_removed = 0u64;
        let mut results = Vec::with_capacity(cmd.files.len());

        for spec in &cmd.files {
            let item = self.delete_file(spec);
            match item.status {
                DeleteStatus::Deleted => deleted += 1,
                DeleteStatus::Failed => failed += 1,
            }
            dirs_removed += item.dirs_removed;

            self.sink.emit(EventPayload::DeleteProgress(DeleteProgressData {
                request_id: cmd.request_id.clone(),
                deletion_id: cmd.deletion_id.clone(),
                media_file_id: item.media_file_id.clone(),
                status: item.status,
                error: item.error.clone(),
                dirs_removed: item.dirs_removed,
            }));
            results.push(item);
        }

        self.sink.emit(EventPayload::DeleteCompleted(DeleteCompletedData {
            request_id: cmd.request_id.clone(),
            deletion_id: cmd.deletion_id.clone(),
            total: cmd.files.len() as u64,
            deleted,
            failed,
            dirs_removed,
            results,
        }));

        info!(
            request_id = %cmd.request_id,
            deletion_id = %cmd.deletion_id,
            total = cmd.files.len(),
            deleted,
            failed,
            dirs_removed,
            "delete command completed"
        );
    }

    fn delete_file(&self, spec: &DeleteFileSpec) -> DeleteResultItem {
        let root = clean_path(&spec.volume_path);
        let absolute = clean_path(&root.join(relative_part(&spec.file_path)));

        if !is_strictly_under(&absolute, &root) {
            error!(
                volume_root = %root.display(),
                resolved_path = %absolute.display(),
                file_path = %spec.file_path.display(),
                "path traversal blocked"
            );
            return DeleteResultItem {
                media_file_id: spec.media_file_id.clone(),
                status: DeleteStatus::Failed,
                error: Some(TRAVERSAL_RESOLVED.to_string()),
                dirs_removed: 0,
                size_bytes: 0,
            };
        }

        let size_bytes = fs::metadata(&absolute).map(|md| md.len()).unwrap_or(0);

        match fs::remove_file(&absolute) {
            Ok(()) => {}
            // Already gone counts as done.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                error!(path = %absolute.display(), error = %err, "failed to delete file");
                return DeleteResultItem {
                    media_file_id: spec.media_file_id.clone(),
                    status: DeleteStatus::Failed,
                    error: Some(err.to_string()),
                    dirs_removed: 0,
                    size_bytes,
                };
            }
        }
        info!(path = %absolute.display(), "file deleted");

        let companions = cleanup_companion_files(&absolute, &root);
        if companions > 0 {
            info!(
                path = %absolute.parent().unwrap_or(&root).display(),
                count = companions,
                "cleaned up companion files"
            );
        }

        DeleteResultItem {
            media_file_id: spec.media_file_id.clone(),
            status: DeleteStatus::Deleted,
            error: None,
            dirs_removed: cleanup_empty_dirs(&absolute, &root),
            size_bytes,
        }
    }

    /// Execute a hardlink command and report the outcome.
    pub fn process_hardlink(&self, cmd: HardlinkCommand) {
        let result = create_hardlink(&cmd.source_path, &cmd.target_path, &cmd.volume_path);
        self.sink
            .emit(EventPayload::HardlinkCompleted(HardlinkCompletedData {
                request_id: cmd.request_id,
                deletion_id: cmd.deletion_id,
                status: result.status,
                source_path: result.source_path,
                target_path: result.target_path,
                error: result.error,
            }));
    }
}

pub struct HardlinkResult {
    pub status: HardlinkStatus,
    pub source_path: String,
    pub target_path: String,
    pub error: Option<String>,
}

/// Link `target` to `source`. Both endpoints must be strictly under
/// `volume_root`; an existing target is replaced.
pub fn create_hardlink(source: &Path, target: &Path, volume_root: &Path) -> HardlinkResult {
    let root = clean_path(volume_root);
    let source = clean_path(source);
    let target = clean_path(target);

    let failed = |error: String| HardlinkResult {
        status: HardlinkStatus::Failed,
        source_path: source.to_string_lossy().into_owned(),
        target_path: target.to_string_lossy().into_owned(),
        error: Some(error),
    };

    if !is_strictly_under(&source, &root) {
        return failed(TRAVERSAL_SOURCE.to_string());
    }
    if !is_strictly_under(&target, &root) {
        return failed(TRAVERSAL_TARGET.to_string());
    }

    if let Err(err) = fs::metadata(&source) {
        return failed(format!("source file not found: {err}"));
    }

    if let Some(parent) = target.parent() {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o755);
        }
        if let Err(err) = builder.create(parent) {
            return failed(format!("failed to create target directory: {err}"));
        }
    }

    // Replace an existing target; absence is fine.
    let _ = fs::remove_file(&target);

    if let Err(err) = fs::hard_link(&source, &target) {
        error!(
            source = %source.display(),
            target = %target.display(),
            error = %err,
            "hardlink creation failed"
        );
        return failed(format!("hardlink creation failed: {err}"));
    }

    info!(source = %source.display(), target = %target.display(), "hardlink created");
    HardlinkResult {
        status: HardlinkStatus::Created,
        source_path: source.to_string_lossy().into_owned(),
        target_path: target.to_string_lossy().into_owned(),
        error: None,
    }
}

/// Remove leftover non-media entries beside a deleted file, but only when
/// no media file remains in that directory. The volume root itself is
/// never touched.
fn cleanup_companion_files(deleted: &Path, volume_root: &Path) -> u64 {
    let Some(dir) = deleted.parent() else {
        return 0;
    };
    if dir == volume_root {
        return 0;
    }

    let entries: Vec<_> = match fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|entry| entry.ok()).collect(),
        Err(_) => return 0,
    };

    for entry in &entries {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir && filter::is_media_file(&entry.file_name().to_string_lossy()) {
            // Another release still lives here; leave its companions alone.
            return 0;
        }
    }

    let mut removed = 0;
    for entry in entries {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let result = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                removed += 1;
                info!(path = %path.display(), "removed companion entry");
            }
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove companion entry"),
        }
    }
    removed
}

/// Walk upward from the deleted file's directory, removing each level that
/// is empty, stopping at the first non-empty level and never removing the
/// volume root.
fn cleanup_empty_dirs(deleted: &Path, volume_root: &Path) -> u64 {
    let mut removed = 0;
    let mut dir = match deleted.parent() {
        Some(parent) => parent.to_path_buf(),
        None => return 0,
    };

    while dir != *volume_root && dir.starts_with(volume_root) {
        match fs::read_dir(&dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    break;
                }
            }
            Err(_) => break,
        }
        if let Err(err) = fs::remove_dir(&dir) {
            warn!(path = %dir.display(), error = %err, "failed to remove empty directory");
            break;
        }
        info!(path = %dir.display(), "removed empty directory");
        removed += 1;
        dir = match dir.parent() {
            Some(parent) => parent.to_path_buf(),
            None => break,
        };
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_normalizes() {
        assert_eq!(clean_path(Path::new("/vol//Movies/./a.mkv")), PathBuf::from("/vol/Movies/a.mkv"));
        assert_eq!(clean_path(Path::new("/vol/Movies/../a.mkv")), PathBuf::from("/vol/a.mkv"));
        assert_eq!(clean_path(Path::new("/vol/../../etc/passwd")), PathBuf::from("/etc/passwd"));
        assert_eq!(clean_path(Path::new("/..")), PathBuf::from("/"));
        assert_eq!(clean_path(Path::new("a/../..")), PathBuf::from(".."));
        assert_eq!(clean_path(Path::new("")), PathBuf::from("."));
    }

    #[test]
    fn strict_containment() {
        let root = Path::new("/vol");
        assert!(is_strictly_under(Path::new("/vol/a.mkv"), root));
        assert!(is_strictly_under(Path::new("/vol/deep/a.mkv"), root));
        assert!(!is_strictly_under(Path::new("/vol"), root));
        assert!(!is_strictly_under(Path::new("/volatile/a.mkv"), root));
        assert!(!is_strictly_under(Path::new("/etc/passwd"), root));
    }

    #[test]
    fn relative_part_strips_roots() {
        assert_eq!(relative_part(Path::new("/etc/passwd")), PathBuf::from("etc/passwd"));
        assert_eq!(relative_part(Path::new("Movies/a.mkv")), PathBuf::from("Movies/a.mkv"));
        assert_eq!(
            relative_part(Path::new("../../etc/passwd")),
            PathBuf::from("../../etc/passwd")
        );
    }
}
