//! Bounded pool for blocking file jobs.
//!
//! Jobs run on tokio's blocking threads. The pool only bounds how many may be
//! queued or running at once: when no slot is free, `try_submit` hands the job
//! back and the caller runs it inline instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::JobConfig;
use crate::error::Result;
use crate::Error;

/// Scheduling priority. `Urgent` corresponds to niceness 0: latency-sensitive
/// reads that may dip into the reserved slots but are retried less.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Urgent,
    Normal,
}

pub struct JobPool {
    slots: Arc<Semaphore>,
    max_jobs: usize,
    urgent_reserve: usize,
    stats: Arc<PoolStats>,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub available: usize,
}

/// A job accepted by the pool.
pub struct Job<T> {
    handle: JoinHandle<Result<T>>,
}

/// A job the pool had no room for.
pub struct Rejected<F>(pub F);

impl JobPool {
    pub fn new(config: &JobConfig) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.max_jobs)),
            max_jobs: config.max_jobs,
            urgent_reserve: config.urgent_reserve,
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Queues `f` unless the pool is full.
    ///
    /// `cancel` is checked when the job starts; a job whose token fired while
    /// it waited finishes with `Error::Cancelled` without running. Jobs already
    /// running are never interrupted.
    pub fn try_submit<F, T>(
        &self,
        priority: Priority,
        cancel: CancellationToken,
        f: F,
    ) -> std::result::Result<Job<T>, Rejected<F>>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return Err(self.reject(f)),
        };

        if priority == Priority::Normal && self.slots.available_permits() <= self.urgent_reserve {
            return Err(self.reject(f));
        }
        let permit = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(self.reject(f)),
        };

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::clone(&self.stats);
        let handle = runtime.spawn_blocking(move || run_job(permit, stats, cancel, f));
        Ok(Job { handle })
    }

    /// Runs `f` on the pool when possible, inline otherwise.
    pub async fn run<F, T>(&self, priority: Priority, cancel: CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match self.try_submit(priority, cancel.clone(), f) {
            Ok(job) => job.wait().await,
            Err(Rejected(f)) => {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                f()
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_jobs
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
            available: self.slots.available_permits(),
        }
    }

    fn reject<F>(&self, f: F) -> Rejected<F> {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(available = self.slots.available_permits(), "Job pool full, running inline");
        Rejected(f)
    }
}

fn run_job<F, T>(
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
    cancel: CancellationToken,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    if cancel.is_cancelled() {
        stats.cancelled.fetch_add(1, Ordering::Relaxed);
        return Err(Error::Cancelled);
    }
    let result = f();
    stats.completed.fetch_add(1, Ordering::Relaxed);
    result
}

impl<T> Job<T> {
    pub async fn wait(self) -> Result<T> {
        self.handle
            .await
            .map_err(|e| Error::InvalidState(format!("Job join error: {}", e)))?
    }
}

/// Submitted/completed counter for work fanned out over several jobs.
///
/// The work is done once it is sealed (no more submissions) and every
/// submitted piece has completed.
#[derive(Debug, Default)]
pub struct Tally {
    inner: Mutex<TallyState>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TallyState {
    pub submitted: usize,
    pub completed: usize,
    pub sealed: bool,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self) {
        let mut state = self.inner.lock();
        debug_assert!(!state.sealed, "submit after seal");
        state.submitted += 1;
    }

    /// Records one completion; true when this finished the work.
    pub fn complete(&self) -> bool {
        let mut state = self.inner.lock();
        state.completed += 1;
        state.sealed && state.completed == state.submitted
    }

    /// No further submissions; true when everything already completed.
    pub fn seal(&self) -> bool {
        let mut state = self.inner.lock();
        state.sealed = true;
        state.completed == state.submitted
    }

    pub fn is_done(&self) -> bool {
        let state = self.inner.lock();
        state.sealed && state.completed == state.submitted
    }

    pub fn state(&self) -> TallyState {
        *self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pool(max_jobs: usize, urgent_reserve: usize) -> JobPool {
        JobPool::new(&JobConfig {
            max_jobs,
            urgent_reserve,
        })
    }

    #[tokio::test]
    async fn test_submit_and_wait() -> Result<()> {
        let pool = pool(4, 0);
        let job = pool
            .try_submit(Priority::Normal, CancellationToken::new(), || Ok(41 + 1))
            .map_err(|_| Error::InvalidState("rejected".to_string()))?;
        assert_eq!(job.wait().await?, 42);

        let snap = pool.snapshot();
        assert_eq!(snap.submitted, 1);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.available, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_full_pool_rejects_and_run_falls_back_inline() -> Result<()> {
        let pool = pool(1, 0);
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let blocker = pool
            .try_submit(Priority::Normal, CancellationToken::new(), move || {
                rx.recv().ok();
                Ok(())
            })
            .map_err(|_| Error::InvalidState("rejected".to_string()))?;

        assert!(pool
            .try_submit(Priority::Urgent, CancellationToken::new(), || Ok(()))
            .is_err());

        // runs on this thread since the only slot is taken
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_inner = Arc::clone(&ran);
        pool.run(Priority::Normal, CancellationToken::new(), move || {
            ran_inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await?;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pool.snapshot().rejected, 2);

        tx.send(()).ok();
        blocker.wait().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_urgent_reserve() {
        let pool = pool(2, 2);
        assert!(pool
            .try_submit(Priority::Normal, CancellationToken::new(), || Ok(()))
            .is_err());
        let job = pool.try_submit(Priority::Urgent, CancellationToken::new(), || Ok(()));
        assert!(job.is_ok());
        if let Ok(job) = job {
            job.wait().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let pool = pool(4, 0);
        let token = CancellationToken::new();
        token.cancel();
        let result = pool.run(Priority::Normal, token, || Ok(())).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_rejects_without_runtime() {
        let pool = pool(4, 0);
        assert!(pool
            .try_submit(Priority::Normal, CancellationToken::new(), || Ok(()))
            .is_err());
    }

    #[test]
    fn test_tally() {
        let tally = Tally::new();
        tally.submit();
        tally.submit();
        assert!(!tally.complete());
        assert!(!tally.seal());
        assert!(tally.complete());
        assert!(tally.is_done());
        assert_eq!(
            tally.state(),
            TallyState {
                submitted: 2,
                completed: 2,
                sealed: true
            }
        );
    }
}
