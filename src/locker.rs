//! Named mutual-exclusion locks, durable at the filesystem level.
//!
//! The durable cache tier can be shared by independent OS processes, so the
//! locks guarding it must be effective across process boundaries, not merely
//! in-process. Each named lock maps to a lock file in the locker's
//! directory; on unix the file is guarded with `flock`, which also
//! serializes threads of the same process because every acquisition opens
//! its own descriptor.

use crate::error::Result;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::trace;

/// Reserved name backing `lock(None)`.
pub const GLOBAL_LOCK: &str = "marmot.global";

pub struct Locker {
    directory: PathBuf,
    // Keeps the fallback directory alive for lockers without a configured one.
    _temp: Option<TempDir>,
}

impl Locker {
    /// Create a locker over the given directory. Without a directory the
    /// locker is backed by a fresh temporary directory and is only shared by
    /// handles cloned from the same instance.
    pub fn new(directory: Option<PathBuf>) -> Result<Self> {
        let (directory, temp) = match directory {
            Some(dir) => {
                fs::create_dir_all(&dir)?;
                (dir, None)
            }
            None => {
                let temp = TempDir::new()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        Ok(Self {
            directory,
            _temp: temp,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Acquire the named lock, blocking until the holder releases it.
    /// `None` maps to the reserved global name.
    pub fn lock(&self, name: Option<&str>) -> Result<LockGuard> {
        let name = name.unwrap_or(GLOBAL_LOCK);
        let path = self.directory.join(format!("{name}.lock"));
        trace!(operation = "lock", name, "acquiring");
        let guard = LockGuard::acquire(&path)?;
        trace!(operation = "lock", name, "acquired");
        Ok(guard)
    }

    /// Remove stale lock artifacts. Best effort: absence is not an error.
    /// Only meaningful while no locks from this directory are held.
    pub fn clear(&self) -> Result<()> {
        if let Ok(entries) = fs::read_dir(&self.directory) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "lock") {
                    let _ = fs::remove_file(&path);
                }
            }
        }
        Ok(())
    }
}

/// Scoped lock handle; the lock is released on drop.
#[cfg(unix)]
pub struct LockGuard {
    _flock: nix::fcntl::Flock<std::fs::File>,
}

#[cfg(unix)]
impl LockGuard {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let flock = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive)
            .map_err(|(_, errno)| std::io::Error::from(errno))?;
        Ok(Self { _flock: flock })
    }
}

/// Scoped lock handle; the lock is released on drop.
///
/// Portable fallback: the lock file itself is the token, created with
/// `create_new` and removed on release.
#[cfg(not(unix))]
pub struct LockGuard {
    path: PathBuf,
}

#[cfg(not(unix))]
impl LockGuard {
    fn acquire(path: &Path) -> Result<Self> {
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(not(unix))]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
