//! Single-instance enforcement.
//!
//! Two competing bot processes would fight over the same Telegram long-poll
//! queue, so startup first terminates any duplicate process running under our
//! executable name, then claims an exclusive pid lock file. The lock is a
//! scoped resource: `LockHandle` releases on drop, on every exit path.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, Signal, System};
use tracing::{info, warn};

/// How long a duplicate gets to exit after SIGTERM before it is killed.
const GRACE_WINDOW: Duration = Duration::from_secs(5);
const GRACE_POLL: Duration = Duration::from_millis(500);

/// Errors that can occur while enforcing single-instance mode.
#[derive(Debug)]
pub enum LockError {
    /// Duplicate processes survived both termination signals.
    DuplicatesAlive(usize),
    /// The lock file is owned by a process that is still running.
    HeldByLiveProcess { pid: u32, path: PathBuf },
    /// Filesystem error touching the lock file.
    Io { path: PathBuf, source: std::io::Error },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicatesAlive(n) => {
                write!(f, "{n} duplicate process(es) survived termination")
            }
            Self::HeldByLiveProcess { pid, path } => {
                write!(f, "lock '{}' is held by live process {pid}", path.display())
            }
            Self::Io { path, source } => {
                write!(f, "lock file error at '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Contents of the lock file, the externally observable proof of ownership.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: String,
    app: String,
}

/// Exclusive ownership of the single-instance lock.
///
/// Releasing is idempotent and also happens on drop, so the lock file is
/// removed on clean shutdown, fatal error unwind, and ctrl-c (teloxide's
/// handler stops the dispatcher, `main` returns, drop runs).
pub struct LockHandle {
    path: PathBuf,
    released: bool,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!("Instance lock released: {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove lock file {}: {e}", self.path.display()),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Enforces the "one running instance" invariant at startup.
pub struct InstanceGuard {
    app_name: String,
}

impl InstanceGuard {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self { app_name: app_name.into() }
    }

    /// Terminate duplicates, then claim the lock file.
    ///
    /// Failure here is fatal: the caller must abort startup, not retry.
    pub fn acquire(&self, lock_path: &Path) -> Result<LockHandle, LockError> {
        self.clear_duplicates()?;
        self.claim(lock_path)
    }

    /// Claim the lock file with atomic create-if-absent semantics.
    ///
    /// A stale lock (owner pid no longer running, or unparsable contents) is
    /// reclaimed by removing the file and retrying the create exactly once.
    pub fn claim(&self, lock_path: &Path) -> Result<LockHandle, LockError> {
        match self.try_create(lock_path) {
            Ok(handle) => Ok(handle),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match read_owner_pid(lock_path) {
                    Some(pid) if process_alive(pid) => {
                        Err(LockError::HeldByLiveProcess { pid, path: lock_path.to_path_buf() })
                    }
                    owner => {
                        info!(
                            "Reclaiming stale lock {} (owner {:?} not running)",
                            lock_path.display(),
                            owner
                        );
                        std::fs::remove_file(lock_path).map_err(|source| LockError::Io {
                            path: lock_path.to_path_buf(),
                            source,
                        })?;
                        self.try_create(lock_path).map_err(|source| LockError::Io {
                            path: lock_path.to_path_buf(),
                            source,
                        })
                    }
                }
            }
            Err(source) => Err(LockError::Io { path: lock_path.to_path_buf(), source }),
        }
    }

    fn try_create(&self, lock_path: &Path) -> Result<LockHandle, std::io::Error> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(lock_path)?;
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: chrono::Utc::now().to_rfc3339(),
            app: self.app_name.clone(),
        };
        let body = serde_json::to_string_pretty(&info).unwrap_or_default();
        file.write_all(body.as_bytes())?;
        info!("Instance lock acquired: {} (pid {})", lock_path.display(), info.pid);
        Ok(LockHandle { path: lock_path.to_path_buf(), released: false })
    }

    /// Find and terminate other live processes with our executable name.
    ///
    /// SIGTERM first, then SIGKILL for anything still alive after the grace
    /// window. Survivors make acquisition fail.
    fn clear_duplicates(&self) -> Result<(), LockError> {
        let mut sys = System::new();
        sys.refresh_processes();

        let duplicates = self.find_duplicates(&sys);
        if duplicates.is_empty() {
            info!("No duplicate instances found");
            return Ok(());
        }

        warn!("Found {} duplicate instance(s), terminating", duplicates.len());
        for pid in &duplicates {
            if let Some(process) = sys.process(*pid) {
                info!("Sending SIGTERM to duplicate pid {pid}");
                process.kill_with(Signal::Term);
            }
        }

        let deadline = std::time::Instant::now() + GRACE_WINDOW;
        loop {
            std::thread::sleep(GRACE_POLL);
            sys.refresh_processes();
            if duplicates.iter().all(|pid| sys.process(*pid).is_none()) {
                info!("All duplicates exited after SIGTERM");
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
        }

        for pid in &duplicates {
            if let Some(process) = sys.process(*pid) {
                warn!("Duplicate pid {pid} ignored SIGTERM, sending SIGKILL");
                process.kill();
            }
        }
        std::thread::sleep(GRACE_POLL);
        sys.refresh_processes();

        let survivors = duplicates.iter().filter(|pid| sys.process(**pid).is_some()).count();
        if survivors > 0 {
            return Err(LockError::DuplicatesAlive(survivors));
        }
        info!("Terminated {} duplicate instance(s)", duplicates.len());
        Ok(())
    }

    fn find_duplicates(&self, sys: &System) -> Vec<Pid> {
        let own_pid = std::process::id();
        sys.processes()
            .iter()
            .filter(|(pid, process)| {
                pid.as_u32() != own_pid && process.name() == self.app_name
            })
            .map(|(pid, _)| *pid)
            .collect()
    }
}

fn read_owner_pid(lock_path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(lock_path).ok()?;
    let info: LockInfo = serde_json::from_str(&content).ok()?;
    Some(info.pid)
}

fn process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_path(dir: &TempDir) -> PathBuf {
        dir.path().join(".test_instance.lock")
    }

    #[test]
    fn test_claim_writes_own_pid() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let guard = InstanceGuard::new("voxsight-test");

        let handle = guard.claim(&path).expect("first claim should succeed");
        assert_eq!(handle.path(), path);
        assert_eq!(read_owner_pid(&path), Some(std::process::id()));
    }

    #[test]
    fn test_second_claim_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let guard = InstanceGuard::new("voxsight-test");

        let _handle = guard.claim(&path).expect("first claim should succeed");
        // The lock file names our own (live) pid, so a competing claim from a
        // second starting instance must fail deterministically.
        let second = guard.claim(&path);
        assert!(matches!(second, Err(LockError::HeldByLiveProcess { .. })));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let guard = InstanceGuard::new("voxsight-test");

        // A pid far above any plausible live process id.
        let stale = LockInfo {
            pid: 3_999_999,
            acquired_at: chrono::Utc::now().to_rfc3339(),
            app: "voxsight-test".into(),
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let handle = guard.claim(&path).expect("stale lock should be reclaimed");
        assert_eq!(read_owner_pid(&path), Some(std::process::id()));
        drop(handle);
    }

    #[test]
    fn test_garbage_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let guard = InstanceGuard::new("voxsight-test");

        std::fs::write(&path, "not json at all").unwrap();
        guard.claim(&path).expect("unparsable lock should count as stale");
    }

    #[test]
    fn test_release_is_idempotent_and_runs_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let guard = InstanceGuard::new("voxsight-test");

        let mut handle = guard.claim(&path).unwrap();
        handle.release();
        assert!(!path.exists());
        handle.release(); // second call is a no-op

        let handle = guard.claim(&path).unwrap();
        drop(handle);
        assert!(!path.exists(), "drop must remove the lock file");
    }

    #[test]
    fn test_find_duplicates_excludes_self() {
        let guard = InstanceGuard::new("voxsight-test-no-such-process");
        let mut sys = System::new();
        sys.refresh_processes();
        assert!(guard.find_duplicates(&sys).is_empty());
    }
}
