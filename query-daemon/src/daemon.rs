//! Daemon supervisor: ordered startup, change pumping, signal handling,
//! ordered shutdown.
//!
//! Startup order matters: analyzer registration happens first, in a frame
//! that references nothing analyzer-adjacent; then the initial snapshot,
//! the watcher, the IPC server, and only once the daemon can actually
//! answer, the PID file.

use crate::analyzer::{CSharpExtractor, SymbolExtractor};
use crate::dispatch::{DispatchContext, Dispatcher};
use crate::pid_lock::{is_process_running, read_pid, PidFile};
use crate::server::IpcServer;
use crate::snapshot::{LoadError, SnapshotManager};
use crate::socket_path::{pid_path, remove_socket_file, socket_path};
use crate::watchdog::{ActivityTracker, IdleWatchdog};
use crate::watcher::{ChangeEvent, FileWatcher, WatcherConfig};
use crate::workspace::resolve_manifest;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub workspace: PathBuf,
    pub idle_timeout: Duration,
    pub watcher: WatcherConfig,
}

impl DaemonConfig {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            workspace,
            idle_timeout: Duration::from_secs(30 * 60),
            watcher: WatcherConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Workspace could not be loaded; maps to exit code 2.
    #[error("workspace load failure: {0}")]
    Load(#[from] LoadError),
    /// Another daemon already serves this workspace; maps to exit code 0.
    #[error("daemon already running (PID {0})")]
    AlreadyRunning(u32),
    /// Any other fatal condition; maps to exit code 1.
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

/// Analyzer registration, isolated in its own stack frame: nothing here
/// references any other analyzer item, and nothing analyzer-adjacent runs
/// until this returns.
fn register_analyzer() {
    crate::analyzer::initialize();
}

/// Start a daemon and block until it shuts down.
pub async fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    let daemon = Daemon::start(config).await?;
    daemon.wait().await;
    Ok(())
}

/// A started daemon. Tests drive this directly; the binary calls [`run`].
pub struct Daemon {
    shutdown: CancellationToken,
    server_task: tokio::task::JoinHandle<crate::ipc::IpcListener>,
    pump_task: tokio::task::JoinHandle<()>,
    watcher: FileWatcher,
    snapshots: Arc<SnapshotManager>,
    pid_file: PidFile,
    socket: String,
}

impl Daemon {
    pub async fn start(config: DaemonConfig) -> Result<Self, DaemonError> {
        register_analyzer();

        let manifest =
            resolve_manifest(&config.workspace).map_err(|e| DaemonError::Load(e.into()))?;
        let socket = socket_path(&manifest).map_err(anyhow::Error::from)?;
        let pid_file_path = pid_path(&manifest).map_err(anyhow::Error::from)?;

        let shutdown = CancellationToken::new();
        let extractor: Arc<dyn SymbolExtractor> = Arc::new(CSharpExtractor::new());
        let snapshots = Arc::new(
            SnapshotManager::load_initial(manifest.clone(), extractor, &shutdown).await?,
        );
        let root = snapshots.current().root().to_path_buf();
        info!(
            workspace = %manifest.display(),
            root = %root.display(),
            "workspace loaded"
        );

        let activity = ActivityTracker::new();

        let (batch_tx, batch_rx) = mpsc::channel(64);
        let watcher = FileWatcher::start(&root, config.watcher.clone(), batch_tx)
            .map_err(|e| DaemonError::Runtime(anyhow::anyhow!("starting watcher: {e}")))?;
        let pump_fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            Box::pin(change_pump(
                batch_rx,
                snapshots.clone(),
                activity.clone(),
                shutdown.clone(),
            ));
        let pump_task = tokio::spawn(pump_fut);

        let dispatcher = Arc::new(Dispatcher::new(DispatchContext {
            snapshots: snapshots.clone(),
            activity: activity.clone(),
            idle_timeout: config.idle_timeout,
            workspace: manifest.clone(),
            socket_path: socket.clone(),
            pid_file_path: pid_file_path.clone(),
        }));

        let server = match IpcServer::bind(&socket, dispatcher.clone(), activity.clone(), shutdown.clone())
        {
            Ok(server) => server,
            Err(bind_error) => {
                // A bind conflict only means "already running" if the PID
                // file agrees; otherwise clear the stale socket and retry.
                if let Some(pid) = read_pid(&pid_file_path) {
                    if is_process_running(pid) {
                        return Err(DaemonError::AlreadyRunning(pid));
                    }
                }
                warn!(error = %bind_error, "bind failed without live PID file, retrying once");
                remove_socket_file(&socket).map_err(anyhow::Error::from)?;
                IpcServer::bind(&socket, dispatcher, activity.clone(), shutdown.clone())
                    .map_err(DaemonError::Runtime)?
            }
        };
        let server_task = tokio::spawn(server.run());

        let pid_file = match PidFile::acquire(&pid_file_path) {
            Ok(pid_file) => pid_file,
            Err(e) => {
                shutdown.cancel();
                if let Some(pid) = read_pid(&pid_file_path) {
                    if is_process_running(pid) && pid != std::process::id() {
                        return Err(DaemonError::AlreadyRunning(pid));
                    }
                }
                return Err(DaemonError::Runtime(e));
            }
        };

        IdleWatchdog::new(activity.clone(), config.idle_timeout, shutdown.clone()).spawn();
        spawn_signal_listener(shutdown.clone());

        info!(socket = %socket, pid = pid_file.pid(), "daemon ready");
        Ok(Self {
            shutdown,
            server_task,
            pump_task,
            watcher,
            snapshots,
            pid_file,
            socket,
        })
    }

    pub fn socket_path(&self) -> &str {
        &self.socket
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Block until shutdown is requested, then tear down in order: drain
    /// in-flight handlers, stop the watcher, unlink the socket, retire the
    /// final snapshot, remove the PID file.
    pub async fn wait(self) {
        self.shutdown.cancelled().await;
        info!("daemon shutting down");

        let listener = match self.server_task.await {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!(error = %e, "server task panicked");
                None
            }
        };
        self.watcher.stop().await;
        let _ = self.pump_task.await;
        drop(listener);
        drop(self.snapshots);
        drop(self.pid_file);
        info!("daemon shutdown complete");
    }
}

/// Apply watcher batches to the snapshot manager. Every batch counts as
/// activity; manifest-class changes trigger a full reload, source
/// modifications an incremental edit. Creations and deletions of source
/// files are deferred to the next full reload.
async fn change_pump(
    mut batches: mpsc::Receiver<Vec<ChangeEvent>>,
    snapshots: Arc<SnapshotManager>,
    activity: Arc<ActivityTracker>,
    shutdown: CancellationToken,
) {
    let mut cancelled = std::pin::pin!(shutdown.clone().cancelled_owned());
    loop {
        let batch = tokio::select! {
            _ = &mut cancelled => return,
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => return,
            },
        };

        activity.touch();

        if batch.iter().any(|e| e.full_reload) {
            match snapshots.reload(&shutdown).await {
                Ok(version) => debug!(version, "full reload applied"),
                Err(e) => warn!(error = %e, "full reload failed, keeping current snapshot"),
            }
            continue;
        }

        for event in batch {
            use crate::watcher::ChangeKind;
            match event.kind {
                ChangeKind::Modified | ChangeKind::Renamed => {
                    let text = match std::fs::read_to_string(&event.path) {
                        Ok(text) => text,
                        Err(e) => {
                            debug!(path = %event.path.display(), error = %e, "unreadable changed file");
                            continue;
                        }
                    };
                    match snapshots
                        .apply_edit(&event.path, Arc::from(text.as_str()), &shutdown)
                        .await
                    {
                        Ok(Some(version)) => debug!(version, path = %event.path.display(), "edit applied"),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "incremental update failed"),
                    }
                }
                // Known-file deletions and new files surface on the next
                // full reload.
                ChangeKind::Created | ChangeKind::Deleted => {}
            }
        }
    }
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!(error = %e, "cannot install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    shutdown.cancel();
                }
                _ = term.recv() => {
                    info!("termination signal received");
                    shutdown.cancel();
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    shutdown.cancel();
                }
            }
        }
    });
}
