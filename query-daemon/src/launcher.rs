//! Client-side daemon rendezvous: find a live daemon for a workspace or
//! spawn one, then connect with backoff.

use crate::client::DaemonClient;
use crate::pid_lock::{is_process_running, read_pid};
use crate::socket_path::{pid_path, remove_socket_file, runtime_dir, socket_path, workspace_key};
use crate::workspace::{resolve_manifest, WorkspaceError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("daemon failed to start: {message}")]
    Daemon {
        message: String,
        /// Exit code of the dead child, when it exited cleanly enough to
        /// have one. Clients use this to distinguish load failures.
        exit_code: Option<i32>,
    },
    #[error("daemon did not accept a connection after {0} attempts")]
    ConnectFailed(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Passed through to the spawned daemon; `None` keeps its default.
    pub idle_timeout_minutes: Option<u64>,
    /// Explicit daemon executable; defaults to a sibling of the current
    /// binary, falling back to `$PATH`.
    pub daemon_binary: Option<PathBuf>,
    pub attempts: u32,
    pub retry_interval: Duration,
    /// Per-attempt connect deadline.
    pub connect_deadline: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: None,
            daemon_binary: None,
            attempts: 30,
            retry_interval: Duration::from_secs(1),
            connect_deadline: Duration::from_secs(2),
        }
    }
}

/// Status of a workspace's daemon as visible from the filesystem, before
/// any socket traffic.
#[derive(Debug, Clone)]
pub struct DaemonPresence {
    pub socket_path: String,
    pub pid_file_path: PathBuf,
    pub pid: Option<u32>,
    pub running: bool,
}

/// Inspect the PID file without touching the socket.
pub fn probe(workspace: &Path) -> Result<DaemonPresence, LaunchError> {
    let manifest = resolve_manifest(workspace)?;
    let socket_path = socket_path(&manifest)?;
    let pid_file_path = pid_path(&manifest)?;
    let pid = read_pid(&pid_file_path);
    let running = pid.map(is_process_running).unwrap_or(false);
    Ok(DaemonPresence {
        socket_path,
        pid_file_path,
        pid,
        running,
    })
}

/// Connect to an already-running daemon; never spawns.
pub async fn try_connect(
    workspace: &Path,
    deadline: Duration,
) -> Result<Option<DaemonClient>, LaunchError> {
    let presence = probe(workspace)?;
    if !presence.running {
        return Ok(None);
    }
    match DaemonClient::connect(&presence.socket_path, deadline).await {
        Ok(client) => Ok(Some(client)),
        Err(e) => {
            debug!(error = %e, "daemon PID is live but socket refused");
            Ok(None)
        }
    }
}

/// Find or start the daemon for a workspace and return a connected client.
pub async fn connect_or_spawn(
    workspace: &Path,
    options: &LaunchOptions,
) -> Result<DaemonClient, LaunchError> {
    let manifest = resolve_manifest(workspace)?;
    let socket = socket_path(&manifest)?;
    let pid_file = pid_path(&manifest)?;

    // Fast path: live PID file and answering socket.
    if let Some(pid) = read_pid(&pid_file) {
        if is_process_running(pid) {
            match DaemonClient::connect(&socket, options.connect_deadline).await {
                Ok(client) => {
                    debug!(pid, "reusing running daemon");
                    return Ok(client);
                }
                Err(e) => {
                    warn!(pid, error = %e, "daemon alive but unreachable, restarting");
                }
            }
        } else {
            debug!(pid, "removing stale PID file");
            let _ = std::fs::remove_file(&pid_file);
        }
    }
    remove_socket_file(&socket)?;

    let mut child = spawn_daemon(&manifest, options)?;
    info!(pid = child.child.id(), "spawned workspace daemon");

    for attempt in 1..=options.attempts {
        if let Some(status) = child.child.try_wait()? {
            let stderr = child.read_stderr();
            let message = if stderr.is_empty() {
                format!("exited with {status} before accepting connections")
            } else {
                stderr
            };
            return Err(LaunchError::Daemon {
                message,
                exit_code: status.code(),
            });
        }

        match DaemonClient::connect(&socket, options.connect_deadline).await {
            Ok(client) => {
                debug!(attempt, "connected to spawned daemon");
                return Ok(client);
            }
            Err(e) => {
                debug!(attempt, error = %e, "daemon not ready yet");
                sleep(options.retry_interval).await;
            }
        }
    }
    Err(LaunchError::ConnectFailed(options.attempts))
}

struct SpawnedDaemon {
    child: std::process::Child,
    stderr_path: PathBuf,
}

impl SpawnedDaemon {
    fn read_stderr(&self) -> String {
        std::fs::read_to_string(&self.stderr_path)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }
}

/// Spawn the daemon detached, with stderr captured to a file we can quote
/// if it dies before answering.
fn spawn_daemon(manifest: &Path, options: &LaunchOptions) -> Result<SpawnedDaemon, LaunchError> {
    let binary = match &options.daemon_binary {
        Some(path) => path.clone(),
        None => default_daemon_binary()?,
    };

    let stderr_path =
        runtime_dir()?.join(format!("roslyn-query-{}.stderr", workspace_key(manifest)));
    let stderr_file = std::fs::File::create(&stderr_path)?;

    let mut command = std::process::Command::new(&binary);
    command
        .arg(manifest)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(stderr_file);
    if let Some(minutes) = options.idle_timeout_minutes {
        command.arg("--idle-timeout").arg(minutes.to_string());
    }

    let child = command.spawn().map_err(|e| LaunchError::Daemon {
        message: format!("could not execute {}: {e}", binary.display()),
        exit_code: None,
    })?;
    Ok(SpawnedDaemon { child, stderr_path })
}

const DAEMON_BINARY_NAME: &str = if cfg!(windows) {
    "roslyn-query-daemon.exe"
} else {
    "roslyn-query-daemon"
};

fn default_daemon_binary() -> Result<PathBuf, LaunchError> {
    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let sibling = dir.join(DAEMON_BINARY_NAME);
            if sibling.is_file() {
                return Ok(sibling);
            }
        }
    }
    // Fall back to PATH resolution by the OS.
    Ok(PathBuf::from(DAEMON_BINARY_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("App.csproj"), "<Project />").unwrap();
        dir
    }

    #[tokio::test]
    async fn probe_reports_absent_daemon() {
        let dir = scratch_workspace();
        let presence = probe(dir.path()).unwrap();
        assert!(!presence.running);
        assert!(presence.pid.is_none());
    }

    #[tokio::test]
    async fn try_connect_without_daemon_is_none() {
        let dir = scratch_workspace();
        let client = try_connect(dir.path(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(client.is_none());
    }

    #[tokio::test]
    async fn dead_child_surfaces_its_stderr() {
        let dir = scratch_workspace();
        let options = LaunchOptions {
            // `false` exits immediately without printing; the exit status
            // becomes the message.
            daemon_binary: Some(PathBuf::from("false")),
            attempts: 3,
            retry_interval: Duration::from_millis(50),
            connect_deadline: Duration::from_millis(100),
            ..Default::default()
        };

        let err = connect_or_spawn(dir.path(), &options).await.unwrap_err();
        match err {
            LaunchError::Daemon { message, exit_code } => {
                assert!(message.contains("exit"), "unexpected message: {message}");
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("expected Daemon error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_fails_fast() {
        let dir = scratch_workspace();
        let options = LaunchOptions {
            daemon_binary: Some(PathBuf::from("/nonexistent/roslyn-query-daemon")),
            attempts: 1,
            ..Default::default()
        };
        assert!(matches!(
            connect_or_spawn(dir.path(), &options).await,
            Err(LaunchError::Daemon { .. })
        ));
    }
}
