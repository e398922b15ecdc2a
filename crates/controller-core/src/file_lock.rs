//! File locking for the controller's persistent state directory.
//!
//! The controller and any agent subprocess it spawns never share a state
//! file, but two controller daemons pointed at the same `--state-dir` (or a
//! daemon racing its own background sweep against a command handler) must
//! not interleave writes to `instances.json`, `router_state.json`, or
//! `polling_offset.json`. Every mutation therefore takes an exclusive lock on
//! a `.lock` sidecar before reading-mutating-writing the target file in full.
//!
//! - **Shared locks** for reading: multiple readers may hold them simultaneously.
//! - **Exclusive locks** for writing: only one writer at a time, blocks readers.
//! - **Blocking by default**: operations wait for lock availability.
//! - **RAII guards**: locks release when the guard drops.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// A file lock for coordinating concurrent access to a shared state file.
///
/// Uses a `.lock` file alongside the target file for locking, rather than
/// locking the target file directly, since a full-rewrite save truncates and
/// replaces that file's contents.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    /// Creates a new file lock for the given path. The lock file is created
    /// at `{path}.lock`; the parent directory is created if missing.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let mut lock_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        lock_name.push_str(".lock");
        let lock_path = path.with_file_name(lock_name);

        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self { lock_path })
    }

    /// Acquires a shared (read) lock, blocking until available.
    pub fn shared(&self) -> io::Result<LockGuard> {
        self.acquire(LockType::Shared)
    }

    /// Acquires an exclusive (write) lock, blocking until available.
    pub fn exclusive(&self) -> io::Result<LockGuard> {
        self.acquire(LockType::Exclusive)
    }

    /// Tries to acquire a shared lock without blocking.
    pub fn try_shared(&self) -> io::Result<Option<LockGuard>> {
        self.try_acquire(LockType::Shared)
    }

    /// Tries to acquire an exclusive lock without blocking.
    pub fn try_exclusive(&self) -> io::Result<Option<LockGuard>> {
        self.try_acquire(LockType::Exclusive)
    }

    fn acquire(&self, lock_type: LockType) -> io::Result<LockGuard> {
        let file = self.open_lock_file()?;

        #[cfg(unix)]
        {
            use nix::fcntl::{Flock, FlockArg};

            let arg = match lock_type {
                LockType::Shared => FlockArg::LockShared,
                LockType::Exclusive => FlockArg::LockExclusive,
            };

            match Flock::lock(file, arg) {
                Ok(flock) => Ok(LockGuard {
                    _flock: flock,
                    _lock_type: lock_type,
                }),
                Err((_, errno)) => Err(io::Error::other(format!("flock failed: {errno}"))),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = (file, lock_type);
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "file locking is not supported on this platform",
            ))
        }
    }

    fn try_acquire(&self, lock_type: LockType) -> io::Result<Option<LockGuard>> {
        let file = self.open_lock_file()?;

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::fcntl::{Flock, FlockArg};

            let arg = match lock_type {
                LockType::Shared => FlockArg::LockSharedNonblock,
                LockType::Exclusive => FlockArg::LockExclusiveNonblock,
            };

            match Flock::lock(file, arg) {
                Ok(flock) => Ok(Some(LockGuard {
                    _flock: flock,
                    _lock_type: lock_type,
                })),
                Err((_, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EAGAIN => {
                    Ok(None)
                }
                Err((_, errno)) => Err(io::Error::other(format!("flock failed: {errno}"))),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = (file, lock_type);
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "file locking is not supported on this platform",
            ))
        }
    }

    fn open_lock_file(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockType {
    Shared,
    Exclusive,
}

/// RAII guard; the lock releases when this drops.
#[derive(Debug)]
pub struct LockGuard {
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<File>,
    _lock_type: LockType,
}

/// A locked JSON document: full-rewrite persistence for one state file,
/// guarded by its `.lock` sidecar.
///
/// This is the shape every persistent component in the controller
/// (`PortRegistry`, `SessionRouter`, the polling offset, the pending
/// notification store) builds on: read-mutate-write under an exclusive lock,
/// tolerant of a missing or empty file, and serialized through a full
/// overwrite rather than an in-place edit.
pub struct JsonStateFile<T> {
    path: PathBuf,
    lock: FileLock,
    _marker: std::marker::PhantomData<T>,
}

impl<T> JsonStateFile<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let lock = FileLock::new(&path)?;
        Ok(Self {
            path,
            lock,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the document under a shared lock. A missing or empty file
    /// yields `T::default()`.
    pub fn read(&self) -> Result<T, crate::error::StateError> {
        let _guard = self
            .lock
            .shared()
            .map_err(|e| crate::error::StateError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> Result<T, crate::error::StateError> {
        if !self.path.exists() {
            return Ok(T::default());
        }
        let contents =
            std::fs::read_to_string(&self.path).map_err(|e| crate::error::StateError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        if contents.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&contents).map_err(|e| crate::error::StateError::Parse {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Overwrites the document under an exclusive lock (full rewrite).
    pub fn write(&self, value: &T) -> Result<(), crate::error::StateError> {
        let _guard = self
            .lock
            .exclusive()
            .map_err(|e| crate::error::StateError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        self.write_unlocked(value)
    }

    fn write_unlocked(&self, value: &T) -> Result<(), crate::error::StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| crate::error::StateError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        }
        let json =
            serde_json::to_string_pretty(value).map_err(|e| crate::error::StateError::Parse {
                path: self.path.clone(),
                source: e,
            })?;
        std::fs::write(&self.path, json).map_err(|e| crate::error::StateError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Reads the current value, lets `f` mutate it, and writes the result
    /// back, all under a single exclusive lock so no writer can observe a
    /// partial update from another task or process.
    pub fn with_exclusive<F, R>(&self, f: F) -> Result<R, crate::error::StateError>
    where
        F: FnOnce(&mut T) -> R,
    {
        let _guard = self
            .lock
            .exclusive()
            .map_err(|e| crate::error::StateError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        let mut value = self.read_unlocked()?;
        let result = f(&mut value);
        self.write_unlocked(&value)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        n: i32,
    }

    #[test]
    fn lock_path_has_lock_suffix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instances.json");
        let lock = FileLock::new(&path).unwrap();
        assert_eq!(lock.lock_path(), dir.path().join("instances.json.lock"));
    }

    #[test]
    fn missing_file_reads_as_default() {
        let dir = TempDir::new().unwrap();
        let store: JsonStateFile<Counter> =
            JsonStateFile::new(dir.path().join("counter.json")).unwrap();
        assert_eq!(store.read().unwrap(), Counter::default());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let store: JsonStateFile<Counter> =
            JsonStateFile::new(dir.path().join("counter.json")).unwrap();
        store.write(&Counter { n: 7 }).unwrap();
        assert_eq!(store.read().unwrap(), Counter { n: 7 });
    }

    #[test]
    fn concurrent_increments_are_serialized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter.json");
        let store: JsonStateFile<Counter> = JsonStateFile::new(&path).unwrap();
        store.write(&Counter { n: 0 }).unwrap();

        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = path.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                let store: JsonStateFile<Counter> = JsonStateFile::new(&path).unwrap();
                barrier.wait();
                store
                    .with_exclusive(|c| {
                        let current = c.n;
                        thread::sleep(Duration::from_millis(5));
                        c.n = current + 1;
                    })
                    .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let store: JsonStateFile<Counter> = JsonStateFile::new(&path).unwrap();
        assert_eq!(store.read().unwrap(), Counter { n: 4 });
    }

    #[test]
    fn exclusive_blocks_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.txt");

        let lock1 = FileLock::new(&path).unwrap();
        let lock2 = FileLock::new(&path).unwrap();

        let _guard1 = lock1.exclusive().unwrap();
        let guard2 = lock2.try_exclusive().unwrap();
        assert!(guard2.is_none());
    }
}
