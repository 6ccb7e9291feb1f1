//! Bounded pool for CPU-bound pipeline steps.
//!
//! Prompt assembly, response parsing, and per-file normalization run here so
//! long string and regex work never stalls the tasks driving network I/O.

use std::sync::Arc;

use prlens_core::PrLensError;
use tokio::sync::Semaphore;

/// A process-wide, cheaply clonable handle to a bounded set of blocking workers.
///
/// Every clone shares the same permits, so the bound holds across all jobs
/// submitting work concurrently.
///
/// # Examples
///
/// ```
/// use prlens_review::pool::WorkerPool;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let pool = WorkerPool::new(2);
/// let n = pool.run(|| (1..=10).sum::<u32>()).await.unwrap();
/// assert_eq!(n, 55);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool running at most `size` tasks at once (minimum 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Maximum number of tasks running at once.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `task` on a blocking worker once a slot is free.
    ///
    /// # Errors
    ///
    /// Returns [`PrLensError::Job`] if the pool was closed or the task panicked.
    pub async fn run<F, T>(&self, task: F) -> Result<T, PrLensError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PrLensError::Job("worker pool is closed".into()))?;
        tokio::task::spawn_blocking(task)
            .await
            .map_err(|e| PrLensError::Job(format!("worker task failed: {e}")))
    }

    /// Stop accepting work. Tasks already running finish normally.
    pub fn close(&self) {
        self.permits.close();
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}
