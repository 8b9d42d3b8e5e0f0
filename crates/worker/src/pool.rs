//! Bounded worker pool
//!
//! A semaphore of `C` permits is the single mechanism bounding concurrent
//! inference. The dispatcher acquires a permit before it dequeues, so
//! waiting work stays in the admission queue, and every unit of work holds
//! its permit until it completes.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tidecast_common::config::MAX_WORKERS;
use tidecast_common::{Result, ServeError, Telemetry};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, info};

/// Fixed-capacity execution gate
#[derive(Debug)]
pub struct WorkerPool {
    gate: Arc<Semaphore>,
    capacity: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    resize_lock: Mutex<()>,
    telemetry: Telemetry,
}

/// Marks one executing unit of work; dropping it releases the active count
#[derive(Debug)]
pub struct ActiveGuard {
    pool: Arc<WorkerPool>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
        self.pool.telemetry.worker_finished();
    }
}

impl WorkerPool {
    /// Create a pool with `capacity` slots
    pub fn new(capacity: usize, telemetry: Telemetry) -> Self {
        telemetry.set_workers_total(capacity);
        Self {
            gate: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            resize_lock: Mutex::new(()),
            telemetry,
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServeError::model_not_ready("Worker pool is closed"))
    }

    /// Mark the start of one unit of work
    pub fn enter(self: &Arc<Self>) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active.fetch_max(now, Ordering::AcqRel);
        self.telemetry.worker_started();
        ActiveGuard { pool: self.clone() }
    }

    /// Run CPU-bound work off the async runtime
    ///
    /// A panic inside `work` becomes [`ServeError::Unhandled`]; the caller's
    /// permit and guard are released as usual.
    pub async fn compute<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        match tokio::task::spawn_blocking(work).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!("Inference task panicked");
                Err(ServeError::unhandled("Inference task panicked"))
            }
            Err(e) => Err(ServeError::unhandled(format!("Inference task failed: {}", e))),
        }
    }

    /// Change the number of slots, returning the previous size
    ///
    /// Growing takes effect immediately. Shrinking retires permits as they
    /// are released, so running work is never interrupted.
    pub fn resize(&self, workers: usize) -> Result<usize> {
        if workers == 0 || workers > MAX_WORKERS {
            return Err(ServeError::invalid_input(format!(
                "workers must be within 1..={}",
                MAX_WORKERS
            )));
        }

        let _guard = self.resize_lock.lock();
        let previous = self.capacity.swap(workers, Ordering::AcqRel);
        if workers > previous {
            self.gate.add_permits(workers - previous);
        } else if workers < previous {
            let retire = (previous - workers) as u32;
            match self.gate.clone().try_acquire_many_owned(retire) {
                Ok(permits) => permits.forget(),
                Err(_) => {
                    let gate = self.gate.clone();
                    tokio::spawn(async move {
                        if let Ok(permits) = gate.acquire_many_owned(retire).await {
                            permits.forget();
                        }
                    });
                }
            }
        }

        self.telemetry.set_workers_total(workers);
        info!(previous, workers, "Worker pool resized");
        Ok(previous)
    }

    /// Stop handing out slots
    pub fn close(&self) {
        self.gate.close();
    }

    /// Configured number of slots
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Units of work executing right now
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Highest simultaneous execution count observed
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::Acquire)
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.gate.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tidecast_common::config::default_latency_buckets;

    fn pool(capacity: usize) -> Arc<WorkerPool> {
        let telemetry = Telemetry::new(default_latency_buckets()).unwrap();
        Arc::new(WorkerPool::new(capacity, telemetry))
    }

    #[tokio::test]
    async fn test_guard_tracks_active_and_peak() {
        let pool = pool(4);
        {
            let _a = pool.enter();
            let _b = pool.enter();
            assert_eq!(pool.active(), 2);
        }
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.peak_active(), 2);
    }

    #[tokio::test]
    async fn test_permits_bound_concurrency() {
        let pool = pool(2);
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let third = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(third.is_err());

        drop(_a);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_panics_become_unhandled_errors() {
        let pool = pool(1);
        let result: Result<()> = pool.compute(|| panic!("boom")).await;
        assert!(matches!(result, Err(ServeError::Unhandled(_))));

        let ok = pool.compute(|| Ok(5)).await.unwrap();
        assert_eq!(ok, 5);
    }

    #[tokio::test]
    async fn test_grow_and_shrink() {
        let pool = pool(2);
        assert_eq!(pool.resize(4).unwrap(), 2);
        assert_eq!(pool.available(), 4);

        assert_eq!(pool.resize(1).unwrap(), 4);
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.available(), 1);

        assert!(pool.resize(0).is_err());
        assert!(pool.resize(MAX_WORKERS + 1).is_err());
    }

    #[tokio::test]
    async fn test_shrink_waits_for_running_work() {
        let pool = pool(2);
        let held = pool.acquire().await.unwrap();

        pool.resize(1).unwrap();
        assert_eq!(pool.capacity(), 1);

        drop(held);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_permits() {
        let pool = pool(1);
        pool.close();
        assert!(pool.acquire().await.is_err());
    }
}
