//! Path classification predicates shared by the watcher, scanner, and
//! deleter. All extension matching is case-insensitive.

use std::path::{Component, Path};

/// Video extensions the agent reports on.
const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "m4v", "wmv", "ts", "iso"];

/// In-progress download extensions, never reported.
const TEMP_EXTENSIONS: &[&str] = &["part", "tmp", "download", "!qb"];

/// Directory names that are never scanned or watched.
const IGNORED_DIRS: &[&str] = &["@eaDir", "$RECYCLE.BIN", "System Volume Information"];

fn extension_lower(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .map(|n| n.to_str().unwrap_or(path))
        .unwrap_or(path)
}

/// True if the file has a recognized media extension.
pub fn is_media_file(name: &str) -> bool {
    match extension_lower(name) {
        Some(ext) => MEDIA_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

/// True if the file has a temporary download extension.
pub fn is_temp_file(name: &str) -> bool {
    match extension_lower(name) {
        Some(ext) => TEMP_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

/// True if the basename starts with a dot.
pub fn is_hidden(name: &str) -> bool {
    basename(name).starts_with('.')
}

/// True if the directory should be skipped entirely.
pub fn is_ignored_dir(name: &str) -> bool {
    let base = basename(name);
    IGNORED_DIRS.contains(&base) || base.starts_with(".Trash-")
}

/// True if any component of the path is an ignored directory. Watch
/// subscriptions are recursive, so events under ignored subtrees are
/// filtered here rather than by skipping registration.
pub fn has_ignored_component(path: &Path) -> bool {
    path.components().any(|comp| match comp {
        Component::Normal(seg) => is_ignored_dir(&seg.to_string_lossy()),
        _ => false,
    })
}

/// True if the watcher and scanner should report this file.
pub fn should_process(path: &str) -> bool {
    let name = basename(path);
    !is_hidden(name) && !is_temp_file(name) && is_media_file(name)
}
