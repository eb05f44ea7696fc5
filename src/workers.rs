//! Bounded pool for blocking model and scoring work
//!
//! Embedding, cross-encoder and generation calls are CPU bound or block on
//! HTTP. They run on tokio's blocking threads, at most `max_concurrent` at a
//! time, so request handling never stalls behind them.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker pool is closed")]
    Closed,

    #[error("Worker task failed: {0}")]
    Join(String),

    #[error("Worker task timed out after {0:?}")]
    Timeout(Duration),
}

/// Cloneable handle to a shared semaphore-bounded blocking pool
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        let size = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on a blocking thread once a permit is available
    pub async fn run<F, T>(&self, job: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Closed)?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| WorkerError::Join(e.to_string()))
    }

    /// Like `run`, but gives up waiting after `limit`
    ///
    /// The blocking job itself cannot be interrupted; it finishes in the
    /// background and its result is dropped.
    pub async fn run_with_timeout<F, T>(&self, limit: Duration, job: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::time::timeout(limit, self.run(job))
            .await
            .map_err(|_| WorkerError::Timeout(limit))?
    }
}
