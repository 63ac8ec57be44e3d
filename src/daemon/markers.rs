//! Runtime directory layout and on-disk markers.
//!
//! Markers are advisory. A daemon is only considered live after its socket
//! accepts a connection or its PID passes a liveness check.

use crate::error::{QueryMuxError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tracing::{debug, info};

const PID_FILE: &str = "daemon.pid";
const SOCKET_FILE: &str = "daemon.sock";
const LOG_FILE: &str = "daemon.log";
const LOCK_FILE: &str = "daemon.lock";

/// Files a daemon keeps in its runtime directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub dir: PathBuf,
    pub pid: PathBuf,
    pub socket: PathBuf,
    pub log: PathBuf,
    pub lock: PathBuf,
}

/// Exclusive claim on a runtime directory, released when dropped.
///
/// The lock file itself is never removed, so two daemons always contend on
/// the same inode.
#[derive(Debug)]
pub struct DaemonLock {
    _file: fs::File,
}

/// What the markers in a runtime directory say about the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// The socket accepts connections.
    Live,
    /// A process owns the PID marker but the socket does not answer yet.
    Starting(u32),
    /// Markers pointed at a dead daemon and were removed.
    Reaped,
    /// No markers.
    Absent,
}

impl RuntimePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            pid: dir.join(PID_FILE),
            socket: dir.join(SOCKET_FILE),
            log: dir.join(LOG_FILE),
            lock: dir.join(LOCK_FILE),
            dir,
        }
    }

    /// Creates the runtime directory, owner-only.
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            QueryMuxError::process(format!(
                "Failed to create runtime directory {}: {e}",
                self.dir.display()
            ))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    /// Takes the directory lock without blocking. `Ok(None)` means another
    /// process holds it.
    pub fn try_lock(&self) -> Result<Option<DaemonLock>> {
        use std::os::fd::AsRawFd;

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock)?;
        // SAFETY: the descriptor is owned by `file` for the duration of the call.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            return Ok(Some(DaemonLock { _file: file }));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(None)
        } else {
            Err(err.into())
        }
    }

    /// Reads the PID marker. Unparseable contents count as absent.
    pub fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pid)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn write_pid(&self, pid: u32) -> Result<()> {
        fs::write(&self.pid, format!("{pid}\n"))?;
        Ok(())
    }

    pub fn has_markers(&self) -> bool {
        self.pid.exists() || self.socket.exists()
    }

    /// Removes the PID and socket markers. Missing files are fine.
    pub fn remove_markers(&self) {
        for path in [&self.pid, &self.socket] {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!("Could not remove {}: {e}", path.display()),
            }
        }
    }

    /// Removes the markers only while they still belong to `pid`.
    pub fn remove_markers_of(&self, pid: u32) {
        if self.read_pid() == Some(pid) {
            self.remove_markers();
        }
    }

    /// Removes the markers if they name `pid` and that process has exited.
    pub fn remove_markers_if_dead(&self, pid: u32) {
        if self.read_pid() == Some(pid) && !process_alive(pid) {
            self.remove_markers();
        }
    }

    /// Inspects the markers and removes them if they are stale.
    pub async fn reap_stale(&self) -> MarkerState {
        if socket_answers(&self.socket).await {
            return MarkerState::Live;
        }
        match self.read_pid() {
            Some(pid) if pid != std::process::id() && process_alive(pid) => {
                MarkerState::Starting(pid)
            }
            _ if self.has_markers() => {
                info!("Removing stale daemon markers in {}", self.dir.display());
                self.remove_markers();
                MarkerState::Reaped
            }
            _ => MarkerState::Absent,
        }
    }
}

/// Returns true if something accepts connections on `path`.
pub async fn socket_answers(path: &Path) -> bool {
    UnixStream::connect(path).await.is_ok()
}

/// Returns true if a process with this PID exists.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the existence and permission check only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
