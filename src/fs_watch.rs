//! Filesystem watch pipeline: recursive notify subscriptions feeding an
//! async processing task that filters, debounces, pairs renames, and emits
//! enriched `file.*` events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::{Result, WatcherError};
use crate::filter;
use crate::probe::probe;
use crate::protocol::{
    EventPayload, FileCreatedData, FileDeletedData, FileModifiedData, FileRenamedData,
};
use crate::ws::EventSink;

/// Window within which a repeated `(op, path)` notification is a duplicate.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
/// How long a lone rename waits for its paired create before it is
/// reported as a delete.
const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(100);
/// Recent-event entries older than this are purged.
const RECENT_EVENT_TTL: Duration = Duration::from_secs(5);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Raw operation kinds after collapsing the notifier's event taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RawOp {
    Create,
    Remove,
    Rename,
    Write,
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

pub struct FileWatcher {
    inner: Arc<WatchInner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    raw_rx: StdMutex<Option<mpsc::Receiver<WatchMessage>>>,
}

struct WatchInner {
    sink: Arc<dyn EventSink>,
    watcher: StdMutex<RecommendedWatcher>,
    paths: StdMutex<Vec<PathBuf>>,
    recent: StdMutex<HashMap<(RawOp, PathBuf), Instant>>,
    pending_rename: Mutex<Option<PathBuf>>,
}

impl FileWatcher {
    /// Create the underlying notifier. Failure here is fatal at boot.
    pub fn new(sink: Arc<dyn EventSink>) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel::<WatchMessage>(4096);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = raw_tx.blocking_send(WatchMessage::Event(event));
                }
                Err(err) => {
                    let _ = raw_tx.blocking_send(WatchMessage::Error(err.to_string()));
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|err| WatcherError::Internal(format!("failed to create notifier: {err}")))?;

        Ok(Self {
            inner: Arc::new(WatchInner {
                sink,
                watcher: StdMutex::new(watcher),
                paths: StdMutex::new(Vec::new()),
                recent: StdMutex::new(HashMap::new()),
                pending_rename: Mutex::new(None),
            }),
            tasks: StdMutex::new(Vec::new()),
            raw_rx: StdMutex::new(Some(raw_rx)),
        })
    }

    /// Spawn the event-processing task and the recent-event sweeper.
    pub fn start(&self) {
        let Some(mut rx) = self.raw_rx.lock().ok().and_then(|mut guard| guard.take()) else {
            return;
        };

        let inner = Arc::clone(&self.inner);
        let event_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    WatchMessage::Event(event) => handle_notify_event(&inner, event).await,
                    WatchMessage::Error(message) => error!(error = %message, "watch error"),
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        let sweep_task = tokio::spawn(async move {
            loop {
                sleep(SWEEP_INTERVAL).await;
                if let Ok(mut recent) = inner.recent.lock() {
                    let now = Instant::now();
                    recent.retain(|_, seen| now.duration_since(*seen) <= RECENT_EVENT_TTL);
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(event_task);
            tasks.push(sweep_task);
        }
        info!("file watcher started");
    }

    /// Watch one more root recursively. Does not scan; the supervisor
    /// decides when to scan.
    pub fn add_path(&self, path: &Path) -> Result<()> {
        {
            let paths = self
                .inner
                .paths
                .lock()
                .map_err(|_| WatcherError::Internal("watch path list poisoned".into()))?;
            if paths.iter().any(|p| p == path) {
                return Ok(());
            }
        }

        self.inner
            .watcher
            .lock()
            .map_err(|_| WatcherError::Internal("notifier poisoned".into()))?
            .watch(path, RecursiveMode::Recursive)?;

        if let Ok(mut paths) = self.inner.paths.lock() {
            paths.push(path.to_path_buf());
        }
        info!(path = %path.display(), "watching path");
        Ok(())
    }

    /// Stop watching a root and prune it from the list.
    pub fn remove_path(&self, path: &Path) -> Result<()> {
        if let Ok(mut watcher) = self.inner.watcher.lock() {
            // The root may already be gone from disk; removal is best-effort.
            if let Err(err) = watcher.unwatch(path) {
                warn!(path = %path.display(), error = %err, "unwatch failed");
            }
        }
        if let Ok(mut paths) = self.inner.paths.lock() {
            paths.retain(|p| p != path);
        }
        info!(path = %path.display(), "stopped watching path");
        Ok(())
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.inner
            .paths
            .lock()
            .map(|paths| paths.clone())
            .unwrap_or_default()
    }

    /// Stop processing. The notifier itself is released on drop.
    pub fn close(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn handle_notify_event(inner: &Arc<WatchInner>, event: Event) {
    // A pre-paired rename carries both endpoints in one event.
    if matches!(
        event.kind,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both))
    ) {
        if event.paths.len() >= 2 {
            let old = event.paths[0].clone();
            let new = event.paths[1].clone();
            if !filter::has_ignored_component(&new)
                && filter::should_process(&new.to_string_lossy())
            {
                emit_renamed(inner, old, new).await;
            }
            return;
        }
    }

    let Some(op) = classify(&event.kind) else {
        return;
    };
    let Some(path) = event.paths.first().cloned() else {
        return;
    };
    handle_raw(inner, op, path).await;
}

fn classify(kind: &EventKind) -> Option<RawOp> {
    match kind {
        EventKind::Create(_) => Some(RawOp::Create),
        EventKind::Remove(_) => Some(RawOp::Remove),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(RawOp::Rename),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(RawOp::Create),
        EventKind::Modify(ModifyKind::Name(_)) => Some(RawOp::Rename),
        EventKind::Modify(_) => Some(RawOp::Write),
        _ => None,
    }
}

async fn handle_raw(inner: &Arc<WatchInner>, op: RawOp, path: PathBuf) {
    if filter::has_ignored_component(&path) {
        return;
    }

    let is_dir = tokio::fs::symlink_metadata(&path)
        .await
        .map(|md| md.is_dir())
        .unwrap_or(false);
    if is_dir {
        // Subscriptions are recursive, so new directories are already
        // covered, and directory events themselves are not reported.
        return;
    }

    if !filter::should_process(&path.to_string_lossy()) {
        return;
    }

    // Pair a create with an outstanding rename before debounce
    // bookkeeping can suppress it.
    if op == RawOp::Create {
        let old = inner.pending_rename.lock().await.take();
        if let Some(old) = old {
            emit_renamed(inner, old, path).await;
            return;
        }
    }

    if is_duplicate(inner, op, &path) {
        return;
    }

    match op {
        RawOp::Create => emit_created(inner, &path).await,
        RawOp::Remove => emit_deleted(inner, &path),
        RawOp::Write => emit_modified(inner, &path).await,
        RawOp::Rename => {
            *inner.pending_rename.lock().await = Some(path.clone());
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                sleep(RENAME_PAIR_WINDOW).await;
                let expired = {
                    let mut cell = inner.pending_rename.lock().await;
                    if cell.as_deref() == Some(path.as_path()) {
                        cell.take()
                    } else {
                        None
                    }
                };
                // No create followed; the file left the watched tree.
                if let Some(old) = expired {
                    emit_deleted(&inner, &old);
                }
            });
        }
    }
}

fn is_duplicate(inner: &Arc<WatchInner>, op: RawOp, path: &Path) -> bool {
    let Ok(mut recent) = inner.recent.lock() else {
        return false;
    };
    let key = (op, path.to_path_buf());
    let now = Instant::now();
    if let Some(seen) = recent.get(&key) {
        if now.duration_since(*seen) < DEBOUNCE_WINDOW {
            return true;
        }
    }
    recent.insert(key, now);
    false
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

async fn emit_created(inner: &Arc<WatchInner>, path: &Path) {
    let Ok(meta) = probe(path).await else {
        return;
    };
    info!(path = %path.display(), "file created");
    inner.sink.emit(EventPayload::FileCreated(FileCreatedData {
        path: path.to_string_lossy().into_owned(),
        name: file_name(path),
        size_bytes: meta.size,
        hardlink_count: meta.hardlink_count,
        inode: meta.inode,
        device_id: meta.device_id,
        is_dir: false,
    }));
}

async fn emit_modified(inner: &Arc<WatchInner>, path: &Path) {
    let Ok(meta) = probe(path).await else {
        return;
    };
    info!(path = %path.display(), "file modified");
    inner.sink.emit(EventPayload::FileModified(FileModifiedData {
        path: path.to_string_lossy().into_owned(),
        name: file_name(path),
        size_bytes: meta.size,
        hardlink_count: meta.hardlink_count,
        inode: meta.inode,
        device_id: meta.device_id,
    }));
}

fn emit_deleted(inner: &Arc<WatchInner>, path: &Path) {
    info!(path = %path.display(), "file deleted");
    inner.sink.emit(EventPayload::FileDeleted(FileDeletedData {
        path: path.to_string_lossy().into_owned(),
        name: file_name(path),
    }));
}

async fn emit_renamed(inner: &Arc<WatchInner>, old: PathBuf, new: PathBuf) {
    let meta = match probe(&new).await {
        Ok(meta) => meta,
        // The new endpoint vanished already; report the old one gone.
        Err(_) => {
            emit_deleted(inner, &old);
            return;
        }
    };
    info!(old_path = %old.display(), new_path = %new.display(), "file renamed");
    inner.sink.emit(EventPayload::FileRenamed(FileRenamedData {
        old_path: old.to_string_lossy().into_owned(),
        new_path: new.to_string_lossy().into_owned(),
        name: file_name(&new),
        size_bytes: meta.size,
        hardlink_count: meta.hardlink_count,
        inode: meta.inode,
        device_id: meta.device_id,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectingSink {
        events: StdMutex<Vec<EventPayload>>,
    }

    impl CollectingSink {
        fn take(&self) -> Vec<EventPayload> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
    }

    impl EventSink for CollectingSink {
        fn emit(&self, payload: EventPayload) {
            self.events.lock().unwrap().push(payload);
        }
    }

    fn test_inner(sink: Arc<CollectingSink>) -> Arc<WatchInner> {
        let watcher = RecommendedWatcher::new(
            |_res: std::result::Result<Event, notify::Error>| {},
            NotifyConfig::default(),
        )
        .unwrap();
        Arc::new(WatchInner {
            sink,
            watcher: StdMutex::new(watcher),
            paths: StdMutex::new(Vec::new()),
            recent: StdMutex::new(HashMap::new()),
            pending_rename: Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn create_emits_enriched_event() {
        let sink = Arc::new(CollectingSink::default());
        let inner = test_inner(sink.clone());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mkv");
        std::fs::write(&path, b"abcdef").unwrap();

        handle_raw(&inner, RawOp::Create, path.clone()).await;

        let events = sink.take();
        assert_eq!(events.len(), 1);
        match &events[0] {
            EventPayload::FileCreated(data) => {
                assert_eq!(data.name, "movie.mkv");
                assert_eq!(data.size_bytes, 6);
                assert!(data.hardlink_count >= 1);
                assert!(!data.is_dir);
            }
            other => panic!("expected file.created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_events_are_debounced() {
        let sink = Arc::new(CollectingSink::default());
        let inner = test_inner(sink.clone());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mkv");
        std::fs::write(&path, b"x").unwrap();

        handle_raw(&inner, RawOp::Write, path.clone()).await;
        handle_raw(&inner, RawOp::Write, path.clone()).await;

        assert_eq!(sink.take().len(), 1);
    }

    #[tokio::test]
    async fn different_ops_share_no_debounce_key() {
        let sink = Arc::new(CollectingSink::default());
        let inner = test_inner(sink.clone());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mkv");
        std::fs::write(&path, b"x").unwrap();

        handle_raw(&inner, RawOp::Create, path.clone()).await;
        handle_raw(&inner, RawOp::Write, path.clone()).await;

        assert_eq!(sink.take().len(), 2);
    }

    #[tokio::test]
    async fn non_media_and_hidden_paths_are_dropped() {
        let sink = Arc::new(CollectingSink::default());
        let inner = test_inner(sink.clone());
        let dir = tempfile::tempdir().unwrap();
        for name in ["notes.txt", ".hidden.mkv", "movie.mkv.part"] {
            let path = dir.path().join(name);
            std::fs::write(&path, b"x").unwrap();
            handle_raw(&inner, RawOp::Create, path).await;
        }
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn events_under_ignored_dirs_are_dropped() {
        let sink = Arc::new(CollectingSink::default());
        let inner = test_inner(sink.clone());
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("@eaDir");
        std::fs::create_dir(&nested).unwrap();
        let path = nested.join("movie.mkv");
        std::fs::write(&path, b"x").unwrap();

        handle_raw(&inner, RawOp::Create, path).await;
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn rename_followed_by_create_pairs_into_renamed() {
        let sink = Arc::new(CollectingSink::default());
        let inner = test_inner(sink.clone());
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("a.mkv");
        let new = dir.path().join("b.mkv");
        std::fs::write(&new, b"abc").unwrap();

        handle_raw(&inner, RawOp::Rename, old.clone()).await;
        handle_raw(&inner, RawOp::Create, new.clone()).await;

        // Let the 100 ms fallback expire to prove it stays silent.
        sleep(Duration::from_millis(150)).await;

        let events = sink.take();
        assert_eq!(events.len(), 1, "exactly one event expected: {events:?}");
        match &events[0] {
            EventPayload::FileRenamed(data) => {
                assert_eq!(data.old_path, old.to_string_lossy());
                assert_eq!(data.new_path, new.to_string_lossy());
                assert_eq!(data.name, "b.mkv");
            }
            other => panic!("expected file.renamed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rename_pairing_bypasses_create_debounce() {
        let sink = Arc::new(CollectingSink::default());
        let inner = test_inner(sink.clone());
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("a.mkv");
        let new = dir.path().join("b.mkv");
        std::fs::write(&new, b"abc").unwrap();

        // A create for the same path lands first and occupies the
        // debounce slot.
        handle_raw(&inner, RawOp::Create, new.clone()).await;
        handle_raw(&inner, RawOp::Rename, old.clone()).await;
        handle_raw(&inner, RawOp::Create, new.clone()).await;
        sleep(Duration::from_millis(150)).await;

        let events = sink.take();
        assert_eq!(events.len(), 2, "created then renamed: {events:?}");
        assert!(matches!(events[0], EventPayload::FileCreated(_)));
        assert!(matches!(events[1], EventPayload::FileRenamed(_)));
    }

    #[tokio::test]
    async fn unpaired_rename_becomes_delete() {
        let sink = Arc::new(CollectingSink::default());
        let inner = test_inner(sink.clone());
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("gone.mkv");

        handle_raw(&inner, RawOp::Rename, old.clone()).await;
        sleep(Duration::from_millis(200)).await;

        let events = sink.take();
        assert_eq!(events.len(), 1);
        match &events[0] {
            EventPayload::FileDeleted(data) => assert_eq!(data.name, "gone.mkv"),
            other => panic!("expected file.deleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_emits_deleted_without_stat() {
        let sink = Arc::new(CollectingSink::default());
        let inner = test_inner(sink.clone());
        // Path does not exist on disk; deletes never need metadata.
        handle_raw(&inner, RawOp::Remove, PathBuf::from("/vol/ghost.mkv")).await;

        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], EventPayload::FileDeleted(_)));
    }

    #[tokio::test]
    async fn directory_creates_are_not_emitted() {
        let sink = Arc::new(CollectingSink::default());
        let inner = test_inner(sink.clone());
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("Season 01.mkv");
        std::fs::create_dir(&sub).unwrap();

        handle_raw(&inner, RawOp::Create, sub).await;
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn add_and_remove_paths_track_the_list() {
        let sink = Arc::new(CollectingSink::default());
        let watcher = FileWatcher::new(sink).unwrap();
        let dir = tempfile::tempdir().unwrap();

        watcher.add_path(dir.path()).unwrap();
        assert_eq!(watcher.watched_paths(), vec![dir.path().to_path_buf()]);
        // Adding again is a no-op.
        watcher.add_path(dir.path()).unwrap();
        assert_eq!(watcher.watched_paths().len(), 1);

        watcher.remove_path(dir.path()).unwrap();
        assert!(watcher.watched_paths().is_empty());
    }
}
