//! Advisory locking with bounded retry.
//!
//! A lock attempt that finds the lock held is retried at a fixed poll
//! interval until the policy's timeout elapses, then fails with
//! [`LockError::Timeout`].

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default interval between lock attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed held for the whole timeout
    #[error("lock not acquired after {waited:?} ({attempts} attempt(s))")]
    Timeout {
        /// Time spent retrying
        waited: Duration,
        /// Number of attempts made
        attempts: u32,
    },

    /// The lock primitive itself failed
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How long and how often to retry a held lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Give up after this long; zero means a single attempt
    pub timeout: Duration,
    /// Wait between attempts
    pub poll_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl LockPolicy {
    /// Policy with the given timeout and the default poll interval.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// A lock that can be tried without blocking.
pub trait AdvisoryLock {
    /// Try once. `Ok(false)` means the lock is held elsewhere.
    fn try_lock(&mut self, exclusive: bool) -> io::Result<bool>;

    /// Release the lock.
    fn unlock(&mut self) -> io::Result<()>;
}

/// Acquire `lock`, retrying while it is held.
pub fn acquire<L: AdvisoryLock + ?Sized>(
    lock: &mut L,
    exclusive: bool,
    policy: &LockPolicy,
) -> Result<(), LockError> {
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if lock.try_lock(exclusive)? {
            tracing::trace!(attempts, exclusive, "Lock acquired");
            return Ok(());
        }

        let waited = started.elapsed();
        if waited >= policy.timeout {
            tracing::debug!(attempts, elapsed_ms = waited.as_millis() as u64, "Lock timed out");
            return Err(LockError::Timeout { waited, attempts });
        }
        thread::sleep(policy.poll_interval.min(policy.timeout - waited));
    }
}

/// `flock(2)` on a lock file.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Open (creating if needed) the lock file at `path`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { file, path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire under `policy`; the lock is released when the guard drops.
    pub fn lock(&mut self, exclusive: bool, policy: &LockPolicy) -> Result<LockGuard<'_>, LockError> {
        acquire(self, exclusive, policy)?;
        Ok(LockGuard { lock: self })
    }
}

#[cfg(unix)]
impl AdvisoryLock for FileLock {
    fn try_lock(&mut self, exclusive: bool) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;

        let mode = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        // SAFETY: the descriptor is owned by `self.file` and stays open.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), mode | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    fn unlock(&mut self) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        // SAFETY: as above.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
impl AdvisoryLock for FileLock {
    fn try_lock(&mut self, _exclusive: bool) -> io::Result<bool> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "advisory file locks need a unix host"))
    }

    fn unlock(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Holds a [`FileLock`] until dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a mut FileLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            tracing::warn!(path = %self.lock.path.display(), error = %e, "Failed to release lock");
        }
    }
}
