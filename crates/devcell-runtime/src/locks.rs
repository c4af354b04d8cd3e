//! Per-user operation locks.
//!
//! Inside one process every user gets an async mutex. When a lock directory
//! is configured, the guard also holds an exclusive `flock` on
//! `<dir>/<user>.lock`, so operations started by separate `devcellctl`
//! invocations against the same host exclude each other as well.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use devcell_common::error::{DevcellError, Result};
use devcell_common::types::UserId;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the duration of one user operation; releases on drop.
#[derive(Debug)]
pub struct UserGuard {
    _file: Option<Flock<File>>,
    _local: OwnedMutexGuard<()>,
}

/// One async mutex per user, created on first use, optionally backed by
/// a lock file per user.
///
/// Every lifecycle operation holds its user's guard for its whole duration,
/// so at most one multi-step operation runs per user at a time.
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
    dir: Option<PathBuf>,
}

impl UserLocks {
    /// Creates an empty lock table that only excludes within this process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a lock table that also takes a file lock under `dir`.
    #[must_use]
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            locks: Mutex::default(),
            dir: Some(dir.into()),
        }
    }

    /// Directory holding the lock files, if any.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn entry(&self, user_id: &UserId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(user_id.clone()).or_default())
    }

    /// Waits for and takes the user's lock.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Io`] if the lock file cannot be opened or
    /// locked.
    pub async fn lock(&self, user_id: &UserId) -> Result<UserGuard> {
        let local = self.entry(user_id).lock_owned().await;
        let file = match &self.dir {
            None => None,
            Some(dir) => {
                let path = lock_path(dir, user_id);
                let task_path = path.clone();
                tokio::task::spawn_blocking(move || acquire(&task_path, true))
                    .await
                    .map_err(|e| DevcellError::Io {
                        path,
                        source: std::io::Error::other(e),
                    })??
            }
        };
        Ok(UserGuard {
            _file: file,
            _local: local,
        })
    }

    /// Takes the user's lock if nobody holds it, in this process or any
    /// other.
    #[must_use]
    pub fn try_lock(&self, user_id: &UserId) -> Option<UserGuard> {
        let local = self.entry(user_id).try_lock_owned().ok()?;
        let file = match &self.dir {
            None => None,
            Some(dir) => match acquire(&lock_path(dir, user_id), false) {
                Ok(Some(file)) => Some(file),
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(user = %user_id, error = %e, "cannot take user lock file");
                    return None;
                }
            },
        };
        Some(UserGuard {
            _file: file,
            _local: local,
        })
    }
}

/// Lock file of a user. Characters outside `[A-Za-z0-9._-]` map to `_`;
/// ids that collide after mapping share one lock.
fn lock_path(dir: &Path, user_id: &UserId) -> PathBuf {
    let name: String = user_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{name}.lock"))
}

/// Opens and locks `path`. A non-blocking attempt on a held lock yields
/// `Ok(None)`.
fn acquire(path: &Path, blocking: bool) -> Result<Option<Flock<File>>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DevcellError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| DevcellError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    let arg = if blocking {
        FlockArg::LockExclusive
    } else {
        FlockArg::LockExclusiveNonblock
    };
    match Flock::lock(file, arg) {
        Ok(lock) => Ok(Some(lock)),
        Err((_, errno)) if !blocking && errno == Errno::EWOULDBLOCK => Ok(None),
        Err((_, errno)) => Err(DevcellError::Io {
            path: path.to_path_buf(),
            source: errno.into(),
        }),
    }
}
