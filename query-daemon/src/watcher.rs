//! Debounced filesystem watcher for the workspace root.
//!
//! Manifest changes (`.csproj`/`.sln`) mean the project graph itself moved
//! and are emitted immediately as full-reload batches. Source changes are
//! coalesced per path and flushed as one batch when the debounce window
//! closes. Watcher backend failures (overflow, rescan) leave our picture of
//! the tree unknown, so they also force a full reload.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::workspace::{MANIFEST_EXTENSIONS, SOURCE_EXTENSIONS};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<PathBuf>,
    /// Manifest-class change (or watcher failure): the whole workspace
    /// must be reloaded.
    pub full_reload: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileClass {
    Source,
    Manifest,
}

fn classify(path: &Path) -> Option<FileClass> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    if MANIFEST_EXTENSIONS.contains(&ext.as_str()) {
        return Some(FileClass::Manifest);
    }
    if SOURCE_EXTENSIONS.contains(&ext.as_str()) {
        return Some(FileClass::Source);
    }
    None
}

/// Last-writer-wins coalescing, with two refinements: a create followed by
/// a delete collapses to a delete, and a rename's original path survives
/// later events for the same destination.
fn merge(existing: Option<ChangeEvent>, incoming: ChangeEvent) -> ChangeEvent {
    let Some(existing) = existing else {
        return incoming;
    };
    let kind = match (existing.kind, incoming.kind) {
        (ChangeKind::Created, ChangeKind::Deleted) => ChangeKind::Deleted,
        (_, kind) => kind,
    };
    ChangeEvent {
        kind,
        path: incoming.path,
        old_path: incoming.old_path.or(existing.old_path),
        full_reload: existing.full_reload || incoming.full_reload,
    }
}

/// Raw input to the debounce loop: either mapped filesystem events or a
/// backend failure that invalidates everything we know.
#[derive(Debug)]
enum RawInput {
    Events(Vec<ChangeEvent>),
    Lost(String),
}

fn map_notify_event(event: Event) -> Vec<ChangeEvent> {
    use notify::event::{ModifyKind, RenameMode};

    let mut out = Vec::new();
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let old_path = event.paths[0].clone();
            let path = event.paths[1].clone();
            if let Some(class) = classify(&path).or_else(|| classify(&old_path)) {
                out.push(ChangeEvent {
                    kind: ChangeKind::Renamed,
                    full_reload: class == FileClass::Manifest,
                    path,
                    old_path: Some(old_path),
                });
            }
        }
        kind => {
            let mapped = match kind {
                EventKind::Create(_) => Some(ChangeKind::Created),
                EventKind::Remove(_) => Some(ChangeKind::Deleted),
                EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeKind::Deleted),
                EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeKind::Created),
                EventKind::Modify(_) => Some(ChangeKind::Modified),
                _ => None,
            };
            if let Some(change) = mapped {
                for path in event.paths {
                    if in_skipped_dir(&path) {
                        continue;
                    }
                    if let Some(class) = classify(&path) {
                        out.push(ChangeEvent {
                            kind: change,
                            full_reload: class == FileClass::Manifest,
                            path,
                            old_path: None,
                        });
                    }
                }
            }
        }
    }
    out
}

fn in_skipped_dir(path: &Path) -> bool {
    path.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        name == "bin" || name == "obj" || name.starts_with('.')
    })
}

/// Owns the OS watcher and the debounce task.
pub struct FileWatcher {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    // Dropping the backend stops event delivery.
    _backend: RecommendedWatcher,
}

impl FileWatcher {
    /// Watch `root` recursively; emit coalesced batches on `batches`.
    pub fn start(
        root: &Path,
        config: WatcherConfig,
        batches: mpsc::Sender<Vec<ChangeEvent>>,
    ) -> notify::Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let event_tx = raw_tx.clone();
        let mut backend = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if event.need_rescan() {
                        let _ = event_tx.send(RawInput::Lost("backend requested rescan".into()));
                        return;
                    }
                    let mapped = map_notify_event(event);
                    if !mapped.is_empty() {
                        let _ = event_tx.send(RawInput::Events(mapped));
                    }
                }
                Err(e) => {
                    // Includes queue overflow: state unknown, reload.
                    let _ = event_tx.send(RawInput::Lost(e.to_string()));
                }
            }
        })?;
        backend.watch(root, RecursiveMode::Recursive)?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(
            raw_rx,
            batches,
            config,
            root.to_path_buf(),
            cancel.clone(),
        ));
        debug!(root = %root.display(), "file watcher started");

        Ok(Self {
            cancel,
            task,
            _backend: backend,
        })
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Coalesce raw events and flush batches. Manifest events and lost-state
/// errors bypass the debounce window entirely.
async fn debounce_loop(
    mut raw: mpsc::UnboundedReceiver<RawInput>,
    batches: mpsc::Sender<Vec<ChangeEvent>>,
    config: WatcherConfig,
    root: PathBuf,
    cancel: CancellationToken,
) {
    let mut pending: HashMap<PathBuf, ChangeEvent> = HashMap::new();
    let mut order: Vec<PathBuf> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let sleep_until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                let batch: Vec<ChangeEvent> = order
                    .drain(..)
                    .filter_map(|path| pending.remove(&path))
                    .collect();
                deadline = None;
                if !batch.is_empty() {
                    debug!(events = batch.len(), "debounced change batch");
                    if batches.send(batch).await.is_err() {
                        return;
                    }
                }
            }
            input = raw.recv() => {
                let Some(input) = input else { return };
                match input {
                    RawInput::Lost(reason) => {
                        error!(reason = %reason, "watcher lost events, forcing full reload");
                        pending.clear();
                        order.clear();
                        deadline = None;
                        let reload = ChangeEvent {
                            kind: ChangeKind::Modified,
                            path: root.clone(),
                            old_path: None,
                            full_reload: true,
                        };
                        if batches.send(vec![reload]).await.is_err() {
                            return;
                        }
                    }
                    RawInput::Events(events) => {
                        let mut immediate = Vec::new();
                        for event in events {
                            if event.full_reload {
                                immediate.push(event);
                                continue;
                            }
                            if !pending.contains_key(&event.path) {
                                order.push(event.path.clone());
                            }
                            let merged = merge(pending.remove(&event.path), event);
                            pending.insert(merged.path.clone(), merged);
                            deadline = Some(Instant::now() + config.debounce);
                        }
                        if !immediate.is_empty() {
                            warn!(events = immediate.len(), "manifest change, immediate reload");
                            if batches.send(immediate).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(kind: ChangeKind, path: &str) -> ChangeEvent {
        ChangeEvent {
            kind,
            path: PathBuf::from(path),
            old_path: None,
            full_reload: false,
        }
    }

    #[test]
    fn classification_by_extension() {
        assert_eq!(classify(Path::new("a/b/C.cs")), Some(FileClass::Source));
        assert_eq!(
            classify(Path::new("a/App.csproj")),
            Some(FileClass::Manifest)
        );
        assert_eq!(classify(Path::new("a/All.sln")), Some(FileClass::Manifest));
        assert_eq!(classify(Path::new("a/readme.md")), None);
        assert_eq!(classify(Path::new("noext")), None);
    }

    #[test]
    fn create_then_delete_collapses_to_delete() {
        let merged = merge(
            Some(change(ChangeKind::Created, "A.cs")),
            change(ChangeKind::Deleted, "A.cs"),
        );
        assert_eq!(merged.kind, ChangeKind::Deleted);
    }

    #[test]
    fn rename_keeps_original_path_through_later_writes() {
        let rename = ChangeEvent {
            kind: ChangeKind::Renamed,
            path: PathBuf::from("New.cs"),
            old_path: Some(PathBuf::from("Old.cs")),
            full_reload: false,
        };
        let merged = merge(Some(rename), change(ChangeKind::Modified, "New.cs"));
        assert_eq!(merged.kind, ChangeKind::Modified);
        assert_eq!(merged.old_path, Some(PathBuf::from("Old.cs")));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_on_distinct_paths_emits_one_batch() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (batch_tx, mut batch_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(
            raw_rx,
            batch_tx,
            WatcherConfig::default(),
            PathBuf::from("/ws"),
            cancel.clone(),
        ));

        raw_tx
            .send(RawInput::Events(vec![
                change(ChangeKind::Modified, "/ws/A.cs"),
                change(ChangeKind::Modified, "/ws/B.cs"),
                change(ChangeKind::Modified, "/ws/A.cs"),
            ]))
            .unwrap();

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2, "three events, two distinct paths");
        assert!(batch.iter().all(|e| !e.full_reload));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timer_restarts_while_events_keep_arriving() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (batch_tx, mut batch_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(
            raw_rx,
            batch_tx,
            WatcherConfig::default(),
            PathBuf::from("/ws"),
            cancel.clone(),
        ));

        for i in 0..3 {
            raw_tx
                .send(RawInput::Events(vec![change(
                    ChangeKind::Modified,
                    &format!("/ws/F{i}.cs"),
                )]))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(batch_rx.try_recv().is_err(), "window still open");
        }

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn manifest_event_bypasses_debounce() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (batch_tx, mut batch_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(
            raw_rx,
            batch_tx,
            WatcherConfig::default(),
            PathBuf::from("/ws"),
            cancel.clone(),
        ));

        raw_tx
            .send(RawInput::Events(vec![ChangeEvent {
                kind: ChangeKind::Modified,
                path: PathBuf::from("/ws/App.csproj"),
                old_path: None,
                full_reload: true,
            }]))
            .unwrap();

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].full_reload);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lost_state_forces_full_reload_and_clears_pending() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (batch_tx, mut batch_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(
            raw_rx,
            batch_tx,
            WatcherConfig::default(),
            PathBuf::from("/ws"),
            cancel.clone(),
        ));

        raw_tx
            .send(RawInput::Events(vec![change(
                ChangeKind::Modified,
                "/ws/A.cs",
            )]))
            .unwrap();
        raw_tx.send(RawInput::Lost("queue overflow".into())).unwrap();

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].full_reload);

        // The pending source event was swallowed by the reload.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(batch_rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_backend_reports_source_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        let watcher = FileWatcher::start(
            dir.path(),
            WatcherConfig {
                debounce: Duration::from_millis(50),
            },
            batch_tx,
        )
        .unwrap();

        // Give the backend a beat to arm before writing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("A.cs"), "class A { }").unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), batch_rx.recv())
            .await
            .expect("watcher should emit within 5s")
            .unwrap();
        assert!(batch
            .iter()
            .any(|e| e.path.file_name().map(|n| n == "A.cs").unwrap_or(false)));

        watcher.stop().await;
    }
}
