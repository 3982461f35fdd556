//! Advisory session lock
//!
//! One open container owns its file for the whole session. The lock lives
//! in a sidecar `<path>.lock` file held exclusively via `fs2`, so the data
//! file itself can be atomically replaced while the session lock stays
//! pinned to one inode. The guard releases on drop, which covers every
//! exit path out of `close`, including flush failure.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Suffix appended to the container path for the sidecar lock file
const LOCK_SUFFIX: &str = ".lock";

/// Exclusive advisory lock on a container path, held open-to-close.
#[derive(Debug)]
pub(crate) struct SessionLock {
    file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Path of the sidecar lock file for `container_path`
    pub(crate) fn lock_path(container_path: &Path) -> PathBuf {
        let mut os = container_path.as_os_str().to_os_string();
        os.push(LOCK_SUFFIX);
        PathBuf::from(os)
    }

    /// Acquire the session lock, failing with `Locked` if another live
    /// session already holds it.
    pub(crate) fn acquire(container_path: &Path) -> StorageResult<Self> {
        let path = Self::lock_path(container_path);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|err| {
            if err.kind() == fs2::lock_contended_error().kind() {
                StorageError::Locked
            } else {
                StorageError::Io(err)
            }
        })?;

        debug!(path = %path.display(), "acquired session lock");
        Ok(SessionLock { file, path })
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        // The OS releases the lock when the handle closes; unlock here so
        // the release is not delayed by a lingering duplicate descriptor.
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "released session lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let held = SessionLock::acquire(&path).unwrap();
        let err = SessionLock::acquire(&path).unwrap_err();
        assert!(matches!(err, StorageError::Locked));

        drop(held);
        SessionLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_lock_path_is_sidecar() {
        let path = SessionLock::lock_path(Path::new("/data/test.db"));
        assert_eq!(path, PathBuf::from("/data/test.db.lock"));
    }
}
