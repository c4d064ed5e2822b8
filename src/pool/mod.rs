use crate::core::{FeedError, Result};
use crate::source::{SourceAdapter, SourceAdapterFactory};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{Level, event};

/// One detail worker: an adapter instance owned by the pool.
pub type DetailWorker = Box<dyn SourceAdapter>;

/// Detail worker pool
///
/// A fixed set of adapter instances shared by the slow lane. The semaphore
/// holds one permit per idle worker, so `acquire` waits instead of polling,
/// and a worker is returned to the queue before its permit is released.
pub struct DetailWorkerPool {
    /// Number of workers created at construction
    size: usize,
    /// Idle workers
    available: Arc<Mutex<VecDeque<DetailWorker>>>,
    /// One permit per idle worker
    permits: Arc<Semaphore>,
    /// Set once shutdown started
    closed: AtomicBool,
}

impl DetailWorkerPool {
    /// Create and start `size` workers.
    ///
    /// If any worker fails to come up, every worker created so far is closed
    /// and the error is returned; no half-built pool is ever handed out.
    pub async fn build(factory: &dyn SourceAdapterFactory, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(FeedError::PoolConstruction(
                "pool size must be greater than 0".to_string(),
            ));
        }

        let mut created: Vec<DetailWorker> = Vec::with_capacity(size);
        for index in 0..size {
            event!(Level::INFO, worker = index + 1, size, "starting detail worker");
            let worker = match factory.create(index).await {
                Ok(worker) => worker,
                Err(err) => {
                    teardown(created).await;
                    return Err(FeedError::PoolConstruction(format!(
                        "worker {} could not be created: {}",
                        index + 1,
                        err
                    )));
                }
            };
            if let Err(err) = worker.start().await {
                created.push(worker);
                teardown(created).await;
                return Err(FeedError::PoolConstruction(format!(
                    "worker {} failed to start: {}",
                    index + 1,
                    err
                )));
            }
            created.push(worker);
        }

        event!(Level::INFO, size, "detail worker pool ready");
        Ok(Self {
            size,
            available: Arc::new(Mutex::new(created.into_iter().collect())),
            permits: Arc::new(Semaphore::new(size)),
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for an idle worker.
    pub async fn acquire(&self) -> Result<WorkerGuard> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FeedError::PoolConstruction("worker pool is shut down".to_string()))?;

        let worker = lock(&self.available).pop_front().ok_or_else(|| {
            FeedError::PoolConstruction("permit granted but no idle worker".to_string())
        })?;

        Ok(WorkerGuard {
            worker: Some(worker),
            pool: self.available.clone(),
            _permit: permit,
        })
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let available = lock(&self.available).len();
        PoolStats {
            size: self.size,
            available,
            in_use: self.size.saturating_sub(available),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop handing out workers, wait up to `wait` for outstanding ones to
    /// come back, then close every worker in the pool.
    ///
    /// Close failures are logged and do not stop the remaining closes.
    pub async fn shutdown(&self, wait: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let all = u32::try_from(self.size).unwrap_or(u32::MAX);
        match tokio::time::timeout(wait, self.permits.acquire_many(all)).await {
            Ok(Ok(permits)) => permits.forget(),
            Ok(Err(_)) => {}
            Err(_) => {
                let stats = self.stats();
                event!(
                    Level::WARN,
                    in_use = stats.in_use,
                    "detail workers still busy at shutdown"
                );
            }
        }
        self.permits.close();

        let workers: Vec<DetailWorker> = lock(&self.available).drain(..).collect();
        teardown(workers).await;
        event!(Level::INFO, "detail worker pool closed");
    }
}

async fn teardown(workers: Vec<DetailWorker>) {
    let total = workers.len();
    for (index, worker) in workers.into_iter().enumerate() {
        if let Err(err) = worker.close().await {
            event!(
                Level::ERROR,
                worker = index + 1,
                total,
                error = %err,
                "failed to close detail worker"
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Worker pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} in use, {} available",
            self.in_use, self.size, self.available
        )
    }
}

/// RAII guard for a pooled worker
///
/// Returns the worker to the pool when dropped, on every exit path including
/// cancellation of the task holding it.
pub struct WorkerGuard {
    worker: Option<DetailWorker>,
    pool: Arc<Mutex<VecDeque<DetailWorker>>>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerGuard {
    pub fn worker(&self) -> &dyn SourceAdapter {
        self.worker
            .as_deref()
            .expect("worker is present until the guard is dropped")
    }

    /// Explicitly return the worker to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            lock(&self.pool).push_back(worker);
        }
        // `_permit` is released after this, once the worker is back.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DetailRecord;
    use crate::source::SummaryFetch;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingWorker {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceAdapter for CountingWorker {
        async fn fetch_live_summary(&self) -> Result<SummaryFetch> {
            Ok(SummaryFetch::ok(Vec::new()))
        }

        async fn fetch_detail(&self, _id: &str) -> Result<Option<DetailRecord>> {
            Ok(None)
        }

        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Factory {
        fail_at: Option<usize>,
        created: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    impl Factory {
        fn new(fail_at: Option<usize>) -> Self {
            Self {
                fail_at,
                created: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl SourceAdapterFactory for Factory {
        async fn create(&self, worker_index: usize) -> Result<Box<dyn SourceAdapter>> {
            if Some(worker_index) == self.fail_at {
                return Err(FeedError::SourceUnavailable("out of sessions".into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingWorker {
                closed: self.closed.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let factory = Factory::new(None);
        let pool = DetailWorkerPool::build(&factory, 3).await.unwrap();
        let stats = pool.stats();

        assert_eq!(stats.size, 3);
        assert_eq!(stats.available, 3);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_failed_construction_tears_down_created_workers() {
        let factory = Factory::new(Some(2));
        let result = DetailWorkerPool::build(&factory, 4).await;

        assert!(matches!(result, Err(FeedError::PoolConstruction(_))));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_worker_returned_on_drop() {
        let factory = Factory::new(None);
        let pool = DetailWorkerPool::build(&factory, 1).await.unwrap();

        {
            let _guard = pool.acquire().await.unwrap();
            assert_eq!(pool.stats().in_use, 1);
        }

        assert_eq!(pool.stats().available, 1);
        let guard = pool.acquire().await.unwrap();
        guard.release();
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let factory = Factory::new(None);
        let pool = Arc::new(DetailWorkerPool::build(&factory, 1).await.unwrap());
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let acquired = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_worker_returned_when_task_cancelled() {
        let factory = Factory::new(None);
        let pool = Arc::new(DetailWorkerPool::build(&factory, 2).await.unwrap());

        let task = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _guard = pool.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().in_use, 1);

        task.abort();
        let _ = task.await;
        assert_eq!(pool.stats().available, 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_and_rejects_acquire() {
        let factory = Factory::new(None);
        let pool = DetailWorkerPool::build(&factory, 3).await.unwrap();

        pool.shutdown(Duration::from_millis(100)).await;

        assert!(pool.is_closed());
        assert_eq!(factory.closed.load(Ordering::SeqCst), 3);
        assert!(pool.acquire().await.is_err());
    }
}
