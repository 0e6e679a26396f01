//! Process-wide bookkeeping for unlink and rename.
//!
//! One registry is created at startup and shared by every partitioned file.
//! It holds the set of file names with an unlink or rename in flight, and a
//! count of outstanding unlink/rename workers that shutdown waits on.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::Result;
use crate::Error;

#[derive(Debug, Default)]
pub struct UnlinkRegistry {
    pending: Mutex<HashSet<PathBuf>>,
    workers: AtomicUsize,
    idle: Notify,
}

/// Counts one outstanding unlink/rename worker until dropped.
pub struct WorkerGuard {
    registry: Arc<UnlinkRegistry>,
}

impl UnlinkRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks every path as pending. Fails without marking anything if one of
    /// them already has an operation in flight.
    pub fn mark_pending(&self, paths: &[PathBuf]) -> Result<()> {
        let mut pending = self.pending.lock();
        if let Some(busy) = paths.iter().find(|p| pending.contains(*p)) {
            return Err(Error::InvalidOperation(format!(
                "unlink or rename already in flight for {}",
                busy.display()
            )));
        }
        pending.extend(paths.iter().cloned());
        Ok(())
    }

    pub fn clear_pending(&self, paths: &[PathBuf]) {
        let mut pending = self.pending.lock();
        for path in paths {
            pending.remove(path);
        }
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.lock().contains(path)
    }

    /// The first of `paths` that is pending, if any.
    pub fn first_pending(&self, paths: &[PathBuf]) -> Option<PathBuf> {
        let pending = self.pending.lock();
        paths.iter().find(|p| pending.contains(*p)).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn begin_worker(self: &Arc<Self>) -> WorkerGuard {
        self.workers.fetch_add(1, Ordering::SeqCst);
        WorkerGuard {
            registry: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Waits until no unlink/rename worker is outstanding. Returns false if
    /// `timeout` passed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.outstanding() == 0;
            }
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if self.registry.workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.registry.idle.notify_waiters();
        }
    }
}
