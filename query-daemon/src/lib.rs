//! Workspace query daemon library.
//!
//! One daemon process per workspace, keyed by a stable hash of the
//! canonicalized workspace path, serving navigation queries over a local
//! socket. Clients embed [`client::DaemonClient`] and [`launcher`] to find
//! or start the daemon; the binary in `main.rs` is the daemon itself.

pub mod analyzer;
pub mod client;
pub mod daemon;
pub mod dispatch;
pub mod ipc;
pub mod launcher;
pub mod pid_lock;
pub mod protocol;
pub mod server;
pub mod snapshot;
pub mod socket_path;
pub mod watchdog;
pub mod watcher;
pub mod workspace;

pub use client::DaemonClient;
pub use daemon::{Daemon, DaemonConfig, DaemonError};
pub use launcher::{connect_or_spawn, probe, try_connect, LaunchError, LaunchOptions};
pub use protocol::{RpcRequest, RpcResponse, MAX_MESSAGE_SIZE};
pub use snapshot::{SnapshotManager, WorkspaceSnapshot};
pub use socket_path::{pid_path, socket_path, workspace_key};
