//! Single-processor election through a PID lock file.
//!
//! The file holds JSON (`pid`, `started_at_ms`, `hostname`, `version`). It is
//! published with a hard link from a private temp file, so a reader never
//! sees partial contents. A file naming a dead process is stale and may be
//! replaced. Candidates hold an exclusive `flock` on `<path>.lock` while they
//! check, remove and publish, so only one of them can replace a stale file.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use parvault_core::{VaultError, VaultResult, unix_timestamp_ms};
use parvault_durability::is_process_alive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const ACQUIRE_ATTEMPTS: usize = 3;

/// Decides which process may drain the queue.
pub trait LeaderElection: Send {
    /// Become the leader, or fail with [`VaultError::ProcessorAlreadyRunning`].
    fn try_acquire(&mut self) -> VaultResult<()>;
    fn release(&mut self);
    fn is_leader(&self) -> bool;
    /// PID of the live leader, if any.
    fn leader_pid(&self) -> Option<u32>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidFileContents {
    pub pid: u32,
    pub started_at_ms: i64,
    pub hostname: String,
    pub version: String,
}

impl PidFileContents {
    pub fn current() -> VaultResult<Self> {
        Ok(Self {
            pid: std::process::id(),
            started_at_ms: unix_timestamp_ms()?,
            hostname: hostname(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    /// A lock taken on another host cannot be probed and counts as alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        if self.hostname != hostname() {
            return true;
        }
        is_process_alive(self.pid)
    }
}

#[derive(Debug)]
pub struct PidFileElection {
    path: PathBuf,
    acquired: bool,
}

impl PidFileElection {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            acquired: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn publish(&self, contents: &PidFileContents) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(contents)
            .map_err(|error| io::Error::new(ErrorKind::InvalidData, error))?;
        let staging = self
            .path
            .with_extension(format!("{}.tmp", contents.pid));
        fs::write(&staging, json)?;
        let linked = fs::hard_link(&staging, &self.path);
        if let Err(error) = fs::remove_file(&staging) {
            debug!(target: "parvault.election", error = %error, "staging file not removed");
        }
        linked
    }

    fn guard_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }
}

/// Exclusive `flock` held until drop. The guard file itself is never removed.
struct ElectionGuard {
    _file: File,
}

impl ElectionGuard {
    fn lock(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        loop {
            #[allow(unsafe_code)]
            // SAFETY: the descriptor is owned by `file`, which outlives the call.
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if result == 0 {
                return Ok(Self { _file: file });
            }
            let error = io::Error::last_os_error();
            if error.kind() != ErrorKind::Interrupted {
                return Err(error);
            }
        }
    }
}

impl LeaderElection for PidFileElection {
    fn try_acquire(&mut self) -> VaultResult<()> {
        if self.acquired {
            return Ok(());
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let contents = PidFileContents::current()?;
        let _guard = ElectionGuard::lock(&self.guard_path())?;

        for _ in 0..ACQUIRE_ATTEMPTS {
            match self.publish(&contents) {
                Ok(()) => {
                    self.acquired = true;
                    info!(
                        target: "parvault.election",
                        op = "election.acquire",
                        pid = contents.pid,
                        path = %self.path.display(),
                        "processor lock acquired"
                    );
                    return Ok(());
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {}
                Err(error) => return Err(error.into()),
            }

            match read_pid_file(&self.path) {
                Ok(existing) if existing.is_alive() => {
                    return Err(VaultError::ProcessorAlreadyRunning { pid: existing.pid });
                }
                Ok(existing) => warn!(
                    target: "parvault.election",
                    pid = existing.pid,
                    path = %self.path.display(),
                    "removing stale processor lock"
                ),
                Err(error) if error.kind() == ErrorKind::NotFound => continue,
                Err(error) => warn!(
                    target: "parvault.election",
                    error = %error,
                    path = %self.path.display(),
                    "removing unreadable processor lock"
                ),
            }
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }

        let pid = read_pid_file(&self.path).map_or(0, |existing| existing.pid);
        Err(VaultError::ProcessorAlreadyRunning { pid })
    }

    fn release(&mut self) {
        if !self.acquired {
            return;
        }
        self.acquired = false;
        // Only remove a file that still names us.
        match read_pid_file(&self.path) {
            Ok(existing) if existing.pid != std::process::id() => return,
            Err(_) => return,
            Ok(_) => {}
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(
                target: "parvault.election",
                path = %self.path.display(),
                "processor lock released"
            ),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!(
                target: "parvault.election",
                error = %error,
                path = %self.path.display(),
                "failed to remove processor lock"
            ),
        }
    }

    fn is_leader(&self) -> bool {
        self.acquired
    }

    fn leader_pid(&self) -> Option<u32> {
        live_leader(&self.path).map(|contents| contents.pid)
    }
}

impl Drop for PidFileElection {
    fn drop(&mut self) {
        self.release();
    }
}

/// Contents of the lock at `path` when its process is alive.
#[must_use]
pub fn live_leader(path: &Path) -> Option<PidFileContents> {
    read_pid_file(path)
        .ok()
        .filter(PidFileContents::is_alive)
}

fn read_pid_file(path: &Path) -> io::Result<PidFileContents> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|error| io::Error::new(ErrorKind::InvalidData, error))
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .or_else(|_| fs::read_to_string("/etc/hostname").map(|name| name.trim().to_owned()))
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("run").join("processor.pid")
    }

    #[test]
    fn acquire_writes_contents_and_release_removes_them() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        let mut election = PidFileElection::new(&path);
        election.try_acquire().unwrap();
        assert!(election.is_leader());

        let contents = read_pid_file(&path).unwrap();
        assert_eq!(contents.pid, std::process::id());
        assert_eq!(election.leader_pid(), Some(std::process::id()));

        election.release();
        assert!(!path.exists());
        assert_eq!(election.leader_pid(), None);
    }

    #[test]
    fn live_holder_blocks_a_second_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        let mut first = PidFileElection::new(&path);
        first.try_acquire().unwrap();

        let mut second = PidFileElection::new(&path);
        let err = second.try_acquire().unwrap_err();
        assert!(
            matches!(err, VaultError::ProcessorAlreadyRunning { pid } if pid == std::process::id())
        );
        drop(second);
        assert!(path.exists(), "loser must not remove the winner's lock");
    }

    #[test]
    fn dead_holder_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let stale = PidFileContents {
            pid: u32::try_from(i32::MAX).unwrap(),
            started_at_ms: 0,
            hostname: hostname(),
            version: "0.0.0".into(),
        };
        fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let mut election = PidFileElection::new(&path);
        election.try_acquire().unwrap();
        assert_eq!(read_pid_file(&path).unwrap().pid, std::process::id());
    }

    #[test]
    fn racing_candidates_elect_exactly_one_leader() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let stale = PidFileContents {
            pid: u32::try_from(i32::MAX).unwrap(),
            started_at_ms: 0,
            hostname: hostname(),
            version: "0.0.0".into(),
        };

        for _ in 0..25 {
            fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();
            let barrier = Arc::new(Barrier::new(2));
            let candidates: Vec<_> = (0..2)
                .map(|_| {
                    let barrier = Arc::clone(&barrier);
                    let path = path.clone();
                    thread::spawn(move || {
                        let mut election = PidFileElection::new(path);
                        barrier.wait();
                        let won = election.try_acquire().is_ok();
                        // Leaders hand back their election so the lock is kept
                        // until both threads have reported.
                        (won, election)
                    })
                })
                .collect();
            let results: Vec<_> = candidates
                .into_iter()
                .map(|candidate| candidate.join().unwrap())
                .collect();

            let winners = results.iter().filter(|(won, _)| *won).count();
            assert_eq!(winners, 1);
            assert_eq!(read_pid_file(&path).unwrap().pid, std::process::id());
            drop(results);
            assert!(!path.exists());
        }
    }

    #[test]
    fn garbage_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not json").unwrap();

        let mut election = PidFileElection::new(&path);
        election.try_acquire().unwrap();
        assert!(election.is_leader());
    }

    #[test]
    fn foreign_host_lock_counts_as_alive() {
        let contents = PidFileContents {
            pid: u32::try_from(i32::MAX).unwrap(),
            started_at_ms: 0,
            hostname: format!("{}-elsewhere", hostname()),
            version: "0.0.0".into(),
        };
        assert!(contents.is_alive());
    }
}
