//! Named process-wide locks backed by advisory file locks
//!
//! Concurrent orchestration runs, in this process or in others, serialize
//! access to shared hypervisor resources (networks, storage pools, box
//! volumes) through a lock file per name. Holding a [`LockGuard`] means
//! holding an exclusive `flock` on `<dir>/vmrig-<name>.lock`.

use nix::fcntl::{flock, FlockArg};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::error::{VmrigError, VmrigResult};

/// Lock guarding network lookup and creation
pub const NETWORKS_LOCK: &str = "networks";

/// Lock guarding storage pool and box volume creation
pub const STORAGE_LOCK: &str = "storage";

pub struct LockManager {
    dir: PathBuf,
    local: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive hold on a named lock; released on drop
pub struct LockGuard {
    name: String,
    file: File,
    _local: OwnedMutexGuard<()>,
}

impl LockManager {
    /// Lock files are created under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            local: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("vmrig-{}.lock", name))
    }

    /// Acquire the named lock, waiting as long as necessary
    pub async fn lock(&self, name: &str) -> VmrigResult<LockGuard> {
        // Waiters in this process queue here rather than each tying up a
        // blocking thread in flock.
        let local = {
            let mut locks = self.local.lock();
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let local = local.lock_owned().await;

        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        debug!("Waiting for lock '{}' at {}", name, path.display());
        let file = tokio::task::spawn_blocking(move || {
            flock(file.as_raw_fd(), FlockArg::LockExclusive)
                .map(|_| file)
                .map_err(std::io::Error::from)
        })
        .await
        .map_err(|e| VmrigError::internal(format!("lock task failed: {}", e)))??;
        debug!("Acquired lock '{}'", name);

        Ok(LockGuard {
            name: name.to_string(),
            file,
            _local: local,
        })
    }

    /// Run `work` while holding the named lock
    pub async fn with_lock<F, T>(&self, name: &str, work: F) -> VmrigResult<T>
    where
        F: Future<Output = VmrigResult<T>>,
    {
        let _guard = self.lock(name).await?;
        work.await
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!("Failed to release lock '{}': {}", self.name, e);
        } else {
            debug!("Released lock '{}'", self.name);
        }
    }
}
