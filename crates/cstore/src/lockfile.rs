//! Lock files guarding the image and layer record files.
//!
//! Each record kind has a lock file (`images.lock`, `layers.lock`) next to
//! its index. Writers hold an exclusive fcntl lock while they rewrite the
//! index and then stamp a new [`LastWrite`] token into the first 64 bytes of
//! the lock file, the same way containers/storage does. Readers hold a shared
//! lock while loading. An in-process `RwLock` orders threads of this process,
//! since fcntl locks are per process. For the same reason a process holds at
//! most one [`LockFile`] per path: closing any descriptor of a file drops all
//! of the process's fcntl locks on it.
//!
//! # LastWrite Token
//!
//! - bytes 0-7: Unix timestamp (nanoseconds, little-endian)
//! - bytes 8-15: write counter (little-endian)
//! - bytes 16-19: writer process ID (little-endian)
//! - bytes 20-63: random bytes
//!
//! A lock file shorter than 64 bytes has never been written and reads as
//! the empty token.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::fd::AsFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use rustix::fs::{fcntl_lock, FlockOperation};

const LAST_WRITE_SIZE: usize = 64;

/// Lock files open in this process, by canonical path.
fn open_lock_files() -> &'static Mutex<HashMap<PathBuf, Weak<LockFile>>> {
    static OPEN: OnceLock<Mutex<HashMap<PathBuf, Weak<LockFile>>>> = OnceLock::new();
    OPEN.get_or_init(Default::default)
}

/// Errors from taking a lock or reading and writing its token.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock file could not be opened, read or written.
    #[error("lock file I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The fcntl lock call failed.
    #[error("fcntl lock failed: {0}")]
    LockFailed(#[from] rustix::io::Errno),
}

/// Result type for lock file operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// The token a writer leaves in a lock file.
///
/// Two tokens compare equal only if no write happened in between, so callers
/// can keep one and later ask whether the store changed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LastWrite([u8; LAST_WRITE_SIZE]);

impl LastWrite {
    /// Nanoseconds since the Unix epoch at which the write happened.
    pub fn timestamp_nanos(&self) -> u64 {
        u64::from_le_bytes(self.field(0))
    }

    /// Number of writes recorded in the lock file so far.
    pub fn counter(&self) -> u64 {
        u64::from_le_bytes(self.field(8))
    }

    /// Process ID of the writer.
    pub fn pid(&self) -> u32 {
        u32::from_le_bytes(self.field(16))
    }

    /// Whether this is the token of a never-written lock file.
    pub fn is_empty(&self) -> bool {
        self.0 == [0; LAST_WRITE_SIZE]
    }

    fn field<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0; N];
        out.copy_from_slice(&self.0[offset..offset + N]);
        out
    }

    /// A fresh token for the write after `prev`.
    fn after(prev: &LastWrite) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        let mut buf = [0; LAST_WRITE_SIZE];
        buf[0..8].copy_from_slice(&nanos.to_le_bytes());
        buf[8..16].copy_from_slice(&prev.counter().wrapping_add(1).to_le_bytes());
        buf[16..20].copy_from_slice(&std::process::id().to_le_bytes());
        rand::rng().fill(&mut buf[20..]);
        Self(buf)
    }
}

impl Default for LastWrite {
    fn default() -> Self {
        Self([0; LAST_WRITE_SIZE])
    }
}

impl std::fmt::Debug for LastWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastWrite")
            .field("timestamp_nanos", &self.timestamp_nanos())
            .field("counter", &self.counter())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

/// A lock file opened for reading and writing.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    threads: RwLock<()>,
}

/// Holds the lock until dropped; `EXCLUSIVE` guards can record writes.
#[derive(Debug)]
pub struct LockGuard<'a, const EXCLUSIVE: bool> {
    file: &'a File,
    _threads: ThreadGuard<'a>,
}

#[derive(Debug)]
enum ThreadGuard<'a> {
    Shared { _guard: RwLockReadGuard<'a, ()> },
    Exclusive { _guard: RwLockWriteGuard<'a, ()> },
}

/// Shared lock guard.
pub type RLockGuard<'a> = LockGuard<'a, false>;

/// Exclusive lock guard.
pub type WLockGuard<'a> = LockGuard<'a, true>;

impl WLockGuard<'_> {
    /// Stamp a new [`LastWrite`] token into the lock file and return it.
    pub fn record_write(&self) -> Result<LastWrite> {
        let next = LastWrite::after(&read_token(self.file)?);
        self.file.write_all_at(&next.0, 0)?;
        Ok(next)
    }
}

impl<const EXCLUSIVE: bool> Drop for LockGuard<'_, EXCLUSIVE> {
    fn drop(&mut self) {
        if let Err(e) = fcntl_lock(self.file.as_fd(), FlockOperation::Unlock) {
            tracing::warn!("failed to release lock: {e}");
        }
    }
}

impl LockFile {
    /// Open the lock file at `path`, creating it if needed.
    ///
    /// Opening a path that is already open in this process returns the
    /// existing handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let key = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
                std::fs::canonicalize(parent)?.join(name)
            }
            _ => std::env::current_dir()?.join(path),
        };

        let mut open = open_lock_files()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = open.get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&key)?;
        let lockfile = Arc::new(Self {
            file,
            threads: RwLock::new(()),
        });
        open.retain(|_, handle| handle.strong_count() > 0);
        open.insert(key, Arc::downgrade(&lockfile));
        Ok(lockfile)
    }

    /// Take a shared lock, blocking until it is available.
    pub fn rlock(&self) -> Result<RLockGuard<'_>> {
        let threads = self.threads.read().unwrap_or_else(PoisonError::into_inner);
        fcntl_lock(self.file.as_fd(), FlockOperation::LockShared)?;
        Ok(LockGuard {
            file: &self.file,
            _threads: ThreadGuard::Shared { _guard: threads },
        })
    }

    /// Take an exclusive lock, blocking until it is available.
    pub fn lock(&self) -> Result<WLockGuard<'_>> {
        let threads = self.threads.write().unwrap_or_else(PoisonError::into_inner);
        fcntl_lock(self.file.as_fd(), FlockOperation::LockExclusive)?;
        Ok(LockGuard {
            file: &self.file,
            _threads: ThreadGuard::Exclusive { _guard: threads },
        })
    }

    /// Read the current [`LastWrite`] token.
    pub fn last_write(&self) -> Result<LastWrite> {
        read_token(&self.file)
    }
}

fn read_token(file: &File) -> Result<LastWrite> {
    let mut buf = [0; LAST_WRITE_SIZE];
    match file.read_exact_at(&mut buf, 0) {
        Ok(()) => Ok(LastWrite(buf)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(LastWrite::default()),
        Err(e) => Err(e.into()),
    }
}
