//! PID file handling: atomic creation, liveness probes, stale cleanup.
//!
//! The PID file is the rendezvous the launcher uses to decide whether a
//! daemon is already serving a workspace. It can be stale (daemon killed),
//! so every reader tolerates a PID that no longer answers.

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// An owned PID file, removed on [`PidFile::release`] or drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Write our PID atomically (temp file + rename). Fails when another
    /// live process already owns the file; silently replaces stale files.
    ///
    /// A short-lived advisory lock on a sibling `.lock` file closes the
    /// window where two daemons race through the stale check together.
    pub fn acquire(path: &Path) -> Result<PidFile> {
        let lock_path = path.with_extension("pid.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&lock_path)
            .with_context(|| format!("opening coordination lock {}", lock_path.display()))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| anyhow!("another process is acquiring the daemon PID file"))?;

        let result = Self::acquire_locked(path);

        let _ = fs2::FileExt::unlock(&lock_file);
        let _ = std::fs::remove_file(&lock_path);
        result
    }

    fn acquire_locked(path: &Path) -> Result<PidFile> {
        if let Some(existing) = read_pid(path) {
            if is_process_running(existing) {
                return Err(anyhow!(
                    "daemon already running with PID {existing} ({})",
                    path.display()
                ));
            }
            warn!(pid = existing, "removing stale PID file");
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale PID file {}", path.display()))?;
        }

        let pid = std::process::id();
        let tmp = path.with_extension(format!("pid.tmp.{pid}"));
        std::fs::write(&tmp, format!("{pid}\n"))
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("publishing PID file {}", path.display()))?;
        debug!(pid, path = %path.display(), "PID file written");

        Ok(PidFile {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file, but only if it still names this process.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if read_pid(&self.path) == Some(self.pid) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove PID file");
            }
        }
    }
}

/// Read a PID from a file; `None` for missing, empty, or garbled files.
pub fn read_pid(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// Whether a process with this PID currently exists.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(windows)]
pub fn is_process_running(pid: u32) -> bool {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::OpenProcess;
    use winapi::um::winnt::PROCESS_QUERY_LIMITED_INFORMATION;

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            false
        } else {
            CloseHandle(handle);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.pid");

        let pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        drop(pid_file);
        assert!(!path.exists(), "released PID file is removed");
    }

    #[test]
    fn second_acquire_against_live_pid_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.pid");

        let _held = PidFile::acquire(&path).unwrap();
        assert!(PidFile::acquire(&path).is_err());
    }

    #[test]
    fn stale_pid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.pid");
        // Far above any real pid_max.
        std::fs::write(&path, "999999999\n").unwrap();

        let pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        drop(pid_file);
    }

    #[test]
    fn garbled_pid_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.pid");
        std::fs::write(&path, "not a pid\n").unwrap();
        assert_eq!(read_pid(&path), None);
    }

    #[test]
    fn own_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }
}
