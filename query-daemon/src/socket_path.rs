//! Socket and PID file rendezvous paths.
//!
//! Every workspace gets its own daemon, keyed by a stable hash of the
//! canonicalized workspace path. The socket and PID files live under a
//! per-user runtime directory so that two users on one machine never
//! collide.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Subdirectory of the runtime dir holding all rendezvous files.
const RUNTIME_SUBDIR: &str = "roslyn-query";

/// Derive the stable workspace key: hex of the first 8 bytes of the
/// SHA-256 of the canonicalized path.
///
/// Canonicalization resolves symlinks and `..` via the filesystem when the
/// path exists; aliases the OS cannot resolve to one canonical form
/// (e.g. two mounts of the same tree) intentionally get distinct keys and
/// therefore distinct daemons.
pub fn workspace_key(workspace: &Path) -> String {
    let canonical = canonicalize_workspace_path(workspace);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Canonicalize a workspace path for keying and lookup.
///
/// Falls back to lexical cleanup when the path does not exist yet (the
/// launcher keys paths before the daemon has validated them). Case is
/// folded on platforms whose filesystems are case-insensitive by default.
pub fn canonicalize_workspace_path(path: &Path) -> PathBuf {
    let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| lexical_clean(path));

    #[cfg(any(windows, target_os = "macos"))]
    {
        PathBuf::from(resolved.to_string_lossy().to_lowercase())
    }

    #[cfg(not(any(windows, target_os = "macos")))]
    {
        resolved
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
fn lexical_clean(path: &Path) -> PathBuf {
    use std::path::Component;

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Directory holding socket and PID files, created on demand.
///
/// Prefers `$XDG_RUNTIME_DIR` when it points at an existing directory,
/// otherwise the system temp dir. The subdirectory is created 0700 where
/// the platform supports modes.
pub fn runtime_dir() -> std::io::Result<PathBuf> {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .unwrap_or_else(std::env::temp_dir);

    let dir = base.join(RUNTIME_SUBDIR);

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(&dir)?;
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(&dir)?;
    }

    Ok(dir)
}

/// Socket endpoint for the given workspace.
///
/// On unix this is a socket file in the runtime dir; on windows a named
/// pipe (pipes are not filesystem objects, so the runtime dir is unused).
pub fn socket_path(workspace: &Path) -> std::io::Result<String> {
    let key = workspace_key(workspace);

    #[cfg(unix)]
    {
        let dir = runtime_dir()?;
        Ok(dir
            .join(format!("roslyn-query-{key}.sock"))
            .to_string_lossy()
            .to_string())
    }

    #[cfg(windows)]
    {
        Ok(format!(r"\\.\pipe\roslyn-query-{key}"))
    }
}

/// PID file for the given workspace's daemon.
pub fn pid_path(workspace: &Path) -> std::io::Result<PathBuf> {
    let key = workspace_key(workspace);
    let dir = runtime_dir()?;
    Ok(dir.join(format!("roslyn-query-{key}.pid")))
}

/// Remove a socket file if present (no-op for windows pipes).
pub fn remove_socket_file(path: &str) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }
    }

    #[cfg(windows)]
    {
        let _ = path;
    }

    Ok(())
}
