//! # hoard-lock
//!
//! Exclusive advisory locks used to serialize writers of a manifest or a
//! reference-count file.
//!
//! Locks are acquired with a bounded wait: the lock is retried every
//! `poll_interval` until `timeout` has elapsed, then [`LockError::Timeout`]
//! is returned. A [`LockGuard`] releases its lock when dropped.
//!
//! Two lockers are provided:
//! - [`FileLocker`]: `flock` on a lock file, visible across processes
//! - [`MemoryLocker`]: in-process only, for tests and single-process tools

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;

use hoard_config::{log_lock_debug, LockConfig};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Lock file guarding `target` (`<target>.lock`).
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Something that can hand out exclusive locks keyed by path.
pub trait Locker: Send + Sync {
    /// Block (bounded) until the lock at `path` is held.
    fn acquire(&self, path: &Path) -> Result<LockGuard>;

    /// Single attempt; `Ok(None)` when someone else holds the lock.
    fn try_acquire(&self, path: &Path) -> Result<Option<LockGuard>>;
}

enum Held {
    File(File),
    Memory(Arc<MemoryState>),
}

/// RAII handle for a held lock.
pub struct LockGuard {
    path: PathBuf,
    held: Held,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.held {
            Held::File(file) => {
                // Closing the descriptor releases the flock anyway.
                let _ = FileExt::unlock(file);
            }
            Held::Memory(state) => state.release(&self.path),
        }
        log_lock_debug!(path = %self.path.display(), "lock released");
    }
}

fn wait_for<F>(path: &Path, timeout: Duration, poll: Duration, mut attempt: F) -> Result<LockGuard>
where
    F: FnMut() -> Result<Option<LockGuard>>,
{
    let start = Instant::now();
    loop {
        if let Some(guard) = attempt()? {
            log_lock_debug!(path = %path.display(), waited_ms = start.elapsed().as_millis() as u64, "lock acquired");
            return Ok(guard);
        }
        let waited = start.elapsed();
        if waited >= timeout {
            return Err(LockError::Timeout {
                path: path.to_path_buf(),
                waited,
            });
        }
        std::thread::sleep(poll.min(timeout - waited));
    }
}

/// Cross-process locker backed by `flock(2)`.
#[derive(Debug, Clone)]
pub struct FileLocker {
    timeout: Duration,
    poll_interval: Duration,
}

impl Default for FileLocker {
    fn default() -> Self {
        Self::from_config(&LockConfig::default())
    }
}

impl FileLocker {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    pub fn from_config(cfg: &LockConfig) -> Self {
        Self::new(cfg.timeout(), cfg.poll_interval())
    }
}

impl Locker for FileLocker {
    fn acquire(&self, path: &Path) -> Result<LockGuard> {
        wait_for(path, self.timeout, self.poll_interval, || self.try_acquire(path))
    }

    fn try_acquire(&self, path: &Path) -> Result<Option<LockGuard>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockGuard {
                path: path.to_path_buf(),
                held: Held::File(file),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

struct MemoryState {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

impl MemoryState {
    fn release(&self, path: &Path) {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(path);
        self.released.notify_all();
    }
}

/// In-process locker. Paths never touch the filesystem.
#[derive(Clone)]
pub struct MemoryLocker {
    state: Arc<MemoryState>,
    timeout: Duration,
}

impl Default for MemoryLocker {
    fn default() -> Self {
        Self::new(LockConfig::default().timeout())
    }
}

impl MemoryLocker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(MemoryState {
                held: Mutex::new(HashSet::new()),
                released: Condvar::new(),
            }),
            timeout,
        }
    }

    pub fn is_held(&self, path: &Path) -> bool {
        self.state
            .held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(path)
    }

    fn guard(&self, path: &Path) -> LockGuard {
        LockGuard {
            path: path.to_path_buf(),
            held: Held::Memory(Arc::clone(&self.state)),
        }
    }
}

impl Locker for MemoryLocker {
    fn acquire(&self, path: &Path) -> Result<LockGuard> {
        let start = Instant::now();
        let mut held = self.state.held.lock().unwrap_or_else(|p| p.into_inner());
        while held.contains(path) {
            let waited = start.elapsed();
            if waited >= self.timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            held = self
                .state
                .released
                .wait_timeout(held, self.timeout - waited)
                .map(|(g, _)| g)
                .unwrap_or_else(|p| p.into_inner().0);
        }
        held.insert(path.to_path_buf());
        Ok(self.guard(path))
    }

    fn try_acquire(&self, path: &Path) -> Result<Option<LockGuard>> {
        let mut held = self.state.held.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(path.to_path_buf()) {
            return Ok(None);
        }
        Ok(Some(self.guard(path)))
    }
}
