//! Snapshot manager: immutable, versioned views of the loaded workspace.
//!
//! The central invariant: `current()` hands out a reference-counted handle
//! whose contents (including the analysis index) stay valid for as long as
//! the caller holds it, no matter what a concurrent reload is doing.
//! Writers never mutate a published snapshot; they build a replacement off
//! to the side and publish it with a pointer swap. Retirement is the `Arc`
//! refcount reaching zero.

use crate::analyzer::{AnalysisError, SemanticIndex, SymbolExtractor};
use crate::workspace::{
    canonical_document_path, load_layout, DocumentHandle, ProjectHandle, WorkspaceError,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// An immutable view of the workspace at one version. Never mutated after
/// publication.
#[derive(Debug)]
pub struct WorkspaceSnapshot {
    version: u64,
    root: PathBuf,
    manifest: PathBuf,
    projects: Vec<ProjectHandle>,
    documents: BTreeMap<PathBuf, DocumentHandle>,
    analysis: Arc<SemanticIndex>,
}

impl WorkspaceSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Path {
        &self.manifest
    }

    pub fn projects(&self) -> &[ProjectHandle] {
        &self.projects
    }

    pub fn documents(&self) -> &BTreeMap<PathBuf, DocumentHandle> {
        &self.documents
    }

    pub fn analysis(&self) -> &SemanticIndex {
        &self.analysis
    }

    /// Canonical lookup key for a request-supplied file, if the document is
    /// part of this snapshot.
    pub fn resolve_document(&self, file: &str) -> Option<PathBuf> {
        let canonical = canonical_document_path(&self.root, file);
        self.documents.contains_key(&canonical).then_some(canonical)
    }
}

/// Single-writer, many-readers holder of the current snapshot.
pub struct SnapshotManager {
    extractor: Arc<dyn SymbolExtractor>,
    manifest: PathBuf,
    /// Readers only ever clone the Arc under this lock; writers only swap
    /// the pointer. Neither side holds it across a suspension point.
    current: RwLock<Arc<WorkspaceSnapshot>>,
    /// Serializes reload/apply_edit. Held across the (long) load phase,
    /// which is why it is an async mutex and separate from `current`.
    writer: Mutex<()>,
}

impl SnapshotManager {
    /// Parse the workspace and publish snapshot version 1.
    pub async fn load_initial(
        manifest: PathBuf,
        extractor: Arc<dyn SymbolExtractor>,
        cancel: &CancellationToken,
    ) -> Result<Self, LoadError> {
        let snapshot = build_snapshot(&manifest, extractor.as_ref(), 1, cancel).await?;
        info!(
            version = snapshot.version,
            documents = snapshot.documents.len(),
            projects = snapshot.projects.len(),
            "initial snapshot published"
        );
        Ok(Self {
            extractor,
            manifest,
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    /// O(1), never blocks on a writer.
    pub fn current(&self) -> Arc<WorkspaceSnapshot> {
        self.current.read().clone()
    }

    /// Rebuild the workspace from disk and publish it as the next version.
    pub fn reload<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64, LoadError>> + Send + 'a>>
    {
        Box::pin(async move {
            let _writer = self.writer.lock().await;
            let next_version = self.current().version + 1;
            let snapshot = build_snapshot(
                &self.manifest,
                self.extractor.as_ref(),
                next_version,
                cancel,
            )
            .await?;
            let retired = self.publish(snapshot);
            info!(
                old_version = retired.version,
                new_version = next_version,
                "workspace reloaded"
            );
            Ok(next_version)
        })
    }

    /// Replace one document's text and publish the next version. Unknown
    /// paths are a no-op: files the loader has not seen are picked up by
    /// the next full reload.
    pub fn apply_edit<'a>(
        &'a self,
        path: &'a Path,
        new_text: Arc<str>,
        cancel: &'a CancellationToken,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Option<u64>, LoadError>> + Send + 'a>,
    > {
        Box::pin(async move {
            let _writer = self.writer.lock().await;
            let base = self.current();

            let canonical = canonical_document_path(&base.root, &path.to_string_lossy());
            if !base.documents.contains_key(&canonical) {
                debug!(path = %canonical.display(), "edit outside document set ignored");
                return Ok(None);
            }

            let analysis = base
                .analysis
                .with_document(self.extractor.as_ref(), &canonical, &new_text, cancel)
                .await?;

            let mut documents = base.documents.clone();
            documents.insert(
                canonical.clone(),
                DocumentHandle {
                    path: canonical,
                    text: new_text,
                },
            );

            let next_version = base.version + 1;
            let snapshot = WorkspaceSnapshot {
                version: next_version,
                root: base.root.clone(),
                manifest: base.manifest.clone(),
                projects: base.projects.clone(),
                documents,
                analysis: Arc::new(analysis),
            };
            self.publish(snapshot);
            debug!(version = next_version, "incremental snapshot published");
            Ok(Some(next_version))
        })
    }

    /// The pointer swap. Returns the retired snapshot; its resources are
    /// released when the last outstanding reader drops its handle.
    fn publish(&self, snapshot: WorkspaceSnapshot) -> Arc<WorkspaceSnapshot> {
        let next = Arc::new(snapshot);
        let mut current = self.current.write();
        std::mem::replace(&mut *current, next)
    }
}

async fn build_snapshot(
    manifest: &Path,
    extractor: &dyn SymbolExtractor,
    version: u64,
    cancel: &CancellationToken,
) -> Result<WorkspaceSnapshot, LoadError> {
    let layout = load_layout(manifest)?;
    for path in layout.documents.keys() {
        if !path.starts_with(&layout.root) {
            warn!(path = %path.display(), "document outside workspace root");
        }
    }
    let documents_for_analysis: Vec<(PathBuf, Arc<str>)> = layout
        .documents
        .iter()
        .map(|(path, doc)| (path.clone(), doc.text.clone()))
        .collect();
    let analysis = SemanticIndex::build(extractor, documents_for_analysis, cancel).await?;

    Ok(WorkspaceSnapshot {
        version,
        root: layout.root,
        manifest: layout.manifest,
        projects: layout.projects,
        documents: layout.documents,
        analysis: Arc::new(analysis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{initialize, CSharpExtractor};

    fn scratch_workspace(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("App.csproj"), "<Project />").unwrap();
        for (name, text) in files {
            std::fs::write(dir.path().join(name), text).unwrap();
        }
        dir
    }

    async fn manager_for(dir: &tempfile::TempDir) -> SnapshotManager {
        initialize();
        SnapshotManager::load_initial(
            dir.path().join("App.csproj"),
            Arc::new(CSharpExtractor::new()),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn initial_snapshot_is_version_one() {
        let dir = scratch_workspace(&[("A.cs", "class A { }")]);
        let manager = manager_for(&dir).await;
        let snapshot = manager.current();
        assert_eq!(snapshot.version(), 1);
        assert_eq!(snapshot.documents().len(), 1);
    }

    #[tokio::test]
    async fn load_failure_for_missing_manifest() {
        initialize();
        let result = SnapshotManager::load_initial(
            PathBuf::from("/nonexistent/App.csproj"),
            Arc::new(CSharpExtractor::new()),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(LoadError::Workspace(_))));
    }

    #[tokio::test]
    async fn reload_bumps_version_and_preserves_old_handles() {
        let dir = scratch_workspace(&[("A.cs", "class A { }")]);
        let manager = manager_for(&dir).await;

        let held = manager.current();
        std::fs::write(dir.path().join("B.cs"), "class B { }").unwrap();
        let v2 = manager.reload(&CancellationToken::new()).await.unwrap();
        assert_eq!(v2, 2);

        // The held handle still sees the old world.
        assert_eq!(held.version(), 1);
        assert_eq!(held.documents().len(), 1);
        assert_eq!(manager.current().documents().len(), 2);
    }

    #[tokio::test]
    async fn apply_edit_replaces_known_document() {
        let dir = scratch_workspace(&[("A.cs", "class A { }")]);
        let manager = manager_for(&dir).await;

        let path = manager.current().documents().keys().next().unwrap().clone();
        let version = manager
            .apply_edit(&path, Arc::from("class Renamed { }"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(version, Some(2));

        let snapshot = manager.current();
        assert!(snapshot
            .analysis()
            .symbol_at(&path, 1, 7)
            .is_some());
        assert_eq!(&*snapshot.documents()[&path].text, "class Renamed { }");
    }

    #[tokio::test]
    async fn apply_edit_on_unknown_path_is_noop() {
        let dir = scratch_workspace(&[("A.cs", "class A { }")]);
        let manager = manager_for(&dir).await;

        let outcome = manager
            .apply_edit(
                &dir.path().join("New.cs"),
                Arc::from("class New { }"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, None);
        assert_eq!(manager.current().version(), 1);
    }

    #[tokio::test]
    async fn concurrent_readers_survive_reloads() {
        let dir = scratch_workspace(&[("A.cs", "class A { void M() { } }")]);
        let manager = Arc::new(manager_for(&dir).await);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let snapshot = manager.current();
                    // Every field of a held snapshot stays coherent.
                    let version = snapshot.version();
                    assert!(version >= 1);
                    assert!(!snapshot.documents().is_empty());
                    let _ = snapshot.analysis().symbol_count();
                    assert_eq!(snapshot.version(), version);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for _ in 0..10 {
            manager.reload(&CancellationToken::new()).await.unwrap();
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(manager.current().version() >= 11);
    }
}
