/*!
The binary cache: pluggable providers composed by configuration, and the
engine that orchestrates precheck, fetch, and store across them.
*/

pub(crate) mod config;
pub(crate) mod engine;
pub(crate) mod provider;

use log::warn;
use snafu::{ResultExt, Snafu};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("unable to create staging directory {}: {source}", path.display()))]
    StagingCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "the cache at {} is locked by another process (remove {} if that process is gone)",
        root.display(),
        lock.display()
    ))]
    CacheLocked { root: PathBuf, lock: PathBuf },

    #[snafu(display("unable to create lock file {}: {source}", path.display()))]
    LockCreate {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a fresh staging directory under `base`, named by pid and a
/// process-wide counter so concurrent stagings never collide.
pub(crate) fn staging_dir(base: &Path) -> Result<PathBuf> {
    let path = base.join("tmp").join(format!(
        "{}-{}",
        std::process::id(),
        STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&path).context(StagingCreateSnafu { path: &path })?;
    Ok(path)
}

/// What to do when the advisory cache lock cannot be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockBehavior {
    Fatal,
    WarnAndContinue,
}

/// Advisory lock on a local files cache directory. The lock file is removed
/// on drop; acquisition is best-effort.
#[derive(Debug)]
pub(crate) struct CacheLock {
    path: Option<PathBuf>,
}

impl CacheLock {
    pub(crate) fn acquire(root: &Path, behavior: LockBehavior) -> Result<Self> {
        let lock = root.join(".lock");
        match Self::try_create(&lock) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path: Some(lock) })
            }
            Err(e) => match behavior {
                LockBehavior::Fatal if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    CacheLockedSnafu { root, lock }.fail()
                }
                LockBehavior::Fatal => Err(e).context(LockCreateSnafu { path: lock }),
                LockBehavior::WarnAndContinue => {
                    warn!(
                        "unable to lock the cache at {} ({e}); continuing without the lock",
                        root.display()
                    );
                    Ok(Self { path: None })
                }
            },
        }
    }

    fn try_create(lock: &Path) -> std::io::Result<std::fs::File> {
        if let Some(parent) = lock.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock)
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_dirs_are_distinct() {
        let base = tempfile::tempdir().unwrap();
        let first = staging_dir(base.path()).unwrap();
        let second = staging_dir(base.path()).unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(base.path().join("tmp")));
        assert!(first.is_dir() && second.is_dir());
    }

    #[test]
    fn lock_is_exclusive_and_released() {
        let root = tempfile::tempdir().unwrap();
        let held = CacheLock::acquire(root.path(), LockBehavior::Fatal).unwrap();
        assert!(CacheLock::acquire(root.path(), LockBehavior::Fatal).is_err());
        // Warn-and-continue proceeds without the lock.
        let tolerated = CacheLock::acquire(root.path(), LockBehavior::WarnAndContinue).unwrap();
        drop(tolerated);
        // The tolerated lock holds nothing, so the file is still there.
        assert!(root.path().join(".lock").is_file());
        drop(held);
        assert!(!root.path().join(".lock").exists());
        assert!(CacheLock::acquire(root.path(), LockBehavior::Fatal).is_ok());
    }
}
