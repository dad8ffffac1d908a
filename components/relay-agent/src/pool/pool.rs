// Local crates
use crate::model::event::LogEvent;
use crate::pool::models::{
    Job, JobFn, PoolError, PoolMetrics, WorkerPoolConfig, WorkerSnapshot, WorkerStats,
};

// External crates
use chrono::Utc;
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared job queue. One structure, internally synchronized; workers take
/// from the front, an optional steal claims from the tail.
#[derive(Debug)]
struct JobQueue {
    inner: StdMutex<VecDeque<Job>>,
    capacity: usize,
    closed: AtomicBool,
    not_empty: Notify,
    not_full: Notify,
}

impl JobQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: StdMutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Job>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    fn try_push(&self, job: Job) -> Result<(), (PoolError, Job)> {
        if self.is_closed() {
            return Err((PoolError::Closed, job));
        }
        {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                return Err((PoolError::QueueFull, job));
            }
            queue.push_back(job);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push, waiting for a slot until the caller's context is cancelled.
    async fn push(&self, mut job: Job, ctx: &CancellationToken) -> Result<(), PoolError> {
        loop {
            let notified = self.not_full.notified();
            match self.try_push(job) {
                Ok(()) => return Ok(()),
                Err((PoolError::QueueFull, returned)) => job = returned,
                Err((other, _)) => return Err(other),
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(PoolError::Cancelled),
                _ = notified => {}
            }
        }
    }

    /// Pop from the front, waiting for work. Resolves to `None` when the
    /// worker is cancelled or the queue is closed and drained.
    async fn pop(&self, cancel: &CancellationToken, steal: bool) -> Option<Job> {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut queue = self.lock();
                if let Some(job) = queue.pop_front() {
                    drop(queue);
                    self.not_full.notify_one();
                    return Some(job);
                }
            }
            // Pickup miss: one scan of the shared queue's tail before
            // parking. Ordering across producers is already unspecified.
            if steal {
                if let Some(job) = self.steal() {
                    return Some(job);
                }
            }
            if self.is_closed() {
                return None;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    fn steal(&self) -> Option<Job> {
        let job = self.lock().pop_back();
        if job.is_some() {
            self.not_full.notify_one();
        }
        job
    }
}

#[derive(Debug)]
struct WorkerHandle {
    stats: Arc<WorkerStats>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_timeout: AtomicU64,
    workers_active: AtomicUsize,
}

/// Fixed or dynamically-scaled set of workers consuming jobs from a shared
/// bounded queue, each job under a per-job deadline.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    job_fn: JobFn,
    queue: Arc<JobQueue>,
    counters: Arc<PoolCounters>,
    cancel: CancellationToken,
    workers: Mutex<Vec<WorkerHandle>>,
    next_worker_id: AtomicUsize,
    target_workers: AtomicUsize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("queue_len", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, job_fn: JobFn) -> Self {
        let queue = Arc::new(JobQueue::new(config.queue_size));
        Self {
            target_workers: AtomicUsize::new(config.num_workers),
            config,
            job_fn,
            queue,
            counters: Arc::new(PoolCounters::default()),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    /// Spawn the configured number of workers.
    pub async fn start(&self) {
        let target = self.target_workers.load(Ordering::Relaxed);
        let mut workers = self.workers.lock().await;
        while workers.len() < target {
            workers.push(self.spawn_worker());
        }
        tracing::info!(num_workers = workers.len(), "Worker pool started");
    }

    fn spawn_worker(&self) -> WorkerHandle {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(WorkerStats::new(id));
        let cancel = self.cancel.child_token();
        let queue = Arc::clone(&self.queue);
        let counters = Arc::clone(&self.counters);
        let job_fn = Arc::clone(&self.job_fn);
        let steal = self.config.enable_stealing;

        counters.workers_active.fetch_add(1, Ordering::Relaxed);
        let worker_stats = Arc::clone(&stats);
        let worker_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            tracing::debug!(worker_id = id, "Worker started");
            while let Some(job) = queue.pop(&worker_cancel, steal).await {
                worker_stats
                    .last_active
                    .store(Utc::now().timestamp(), Ordering::Relaxed);
                run_job(&job_fn, job, &counters, &worker_stats).await;
            }
            counters.workers_active.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(worker_id = id, "Worker stopped");
        });

        WorkerHandle { stats, cancel, join }
    }

    /// Enqueue a job and wait for its completion. The enqueue itself waits
    /// for a free slot until `ctx` is cancelled; completion is bounded by
    /// the pool's job timeout.
    pub async fn submit_sync(
        &self,
        ctx: &CancellationToken,
        event: LogEvent,
    ) -> Result<(), PoolError> {
        let (result_tx, result_rx) = oneshot::channel();
        let deadline = Instant::now() + self.config.job_timeout();
        let job = Job {
            event,
            deadline,
            result_tx,
            enqueued_at: Instant::now(),
        };
        self.queue.push(job, ctx).await?;

        tokio::select! {
            _ = ctx.cancelled() => Err(PoolError::Cancelled),
            result = result_rx => result.unwrap_or(Err(PoolError::Closed)),
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                Err(PoolError::JobTimeout)
            }
        }
    }

    /// Non-blocking enqueue; fails immediately when no slot is free. The
    /// completion notification is discarded.
    pub fn submit_async(&self, event: LogEvent) -> Result<(), PoolError> {
        let (result_tx, _result_rx) = oneshot::channel();
        let job = Job {
            event,
            deadline: Instant::now() + self.config.job_timeout(),
            result_tx,
            enqueued_at: Instant::now(),
        };
        self.queue.try_push(job).map_err(|(error, _)| error)
    }

    /// Grow or shrink the worker set. Shrinking cancels the surplus workers,
    /// which finish their current job and exit.
    pub async fn scale(&self, target: usize) {
        let target = target.max(1);
        self.target_workers.store(target, Ordering::Relaxed);
        let mut workers = self.workers.lock().await;
        while workers.len() < target {
            workers.push(self.spawn_worker());
        }
        let mut surplus = Vec::new();
        while workers.len() > target {
            if let Some(handle) = workers.pop() {
                handle.cancel.cancel();
                surplus.push(handle);
            }
        }
        drop(workers);
        for handle in surplus {
            let _ = handle.join.await;
        }
        tracing::info!(num_workers = target, "Worker pool scaled");
    }

    /// Close the queue and wait for workers to drain it. Metrics remain
    /// readable afterwards.
    pub async fn stop(&self) {
        self.queue.close();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.join.await;
        }
        tracing::info!(
            jobs_processed = self.counters.jobs_processed.load(Ordering::Relaxed),
            jobs_failed = self.counters.jobs_failed.load(Ordering::Relaxed),
            jobs_timeout = self.counters.jobs_timeout.load(Ordering::Relaxed),
            "Worker pool stopped"
        );
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let per_worker: Vec<WorkerSnapshot> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .map(|handle| WorkerSnapshot::from(handle.stats.as_ref()))
                .collect()
        };
        PoolMetrics {
            num_workers: self.target_workers.load(Ordering::Relaxed),
            jobs_processed: self.counters.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.counters.jobs_failed.load(Ordering::Relaxed),
            jobs_timeout: self.counters.jobs_timeout.load(Ordering::Relaxed),
            workers_active: self.counters.workers_active.load(Ordering::Relaxed),
            queue_size: self.queue.len(),
            queue_capacity: self.queue.capacity,
            per_worker,
        }
    }
}

/// Run one job under its deadline. A panicking job is recovered and counted
/// as failed; an overrunning one has its context cancelled and is counted
/// against the timeout metric whether or not it observes the cancellation.
async fn run_job(job_fn: &JobFn, job: Job, counters: &PoolCounters, stats: &WorkerStats) {
    let Job {
        event,
        deadline,
        result_tx,
        enqueued_at,
    } = job;
    let queued_for = enqueued_at.elapsed();
    let remaining = deadline.saturating_duration_since(Instant::now());
    let job_ctx = CancellationToken::new();

    let outcome = tokio::select! {
        result = AssertUnwindSafe((job_fn)(job_ctx.clone(), event)).catch_unwind() => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(PoolError::JobFailed(e.to_string())),
                Err(_) => Err(PoolError::JobFailed("job panicked".to_string())),
            }
        }
        _ = tokio::time::sleep(remaining) => {
            job_ctx.cancel();
            Err(PoolError::JobTimeout)
        }
    };

    counters.jobs_processed.fetch_add(1, Ordering::Relaxed);
    stats.jobs_processed.fetch_add(1, Ordering::Relaxed);
    match &outcome {
        Ok(()) => {}
        Err(PoolError::JobTimeout) => {
            counters.jobs_timeout.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                worker_id = stats.id,
                queued_ms = queued_for.as_millis() as u64,
                "Job deadline elapsed"
            );
        }
        Err(e) => {
            counters.jobs_failed.fetch_add(1, Ordering::Relaxed);
            stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(worker_id = stats.id, error = %e, "Job failed");
        }
    }
    let _ = result_tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event() -> LogEvent {
        LogEvent::from_line("test", "line\n")
    }

    fn pool_with<F>(config: WorkerPoolConfig, job: F) -> WorkerPool
    where
        F: Fn(CancellationToken, LogEvent) -> futures::future::BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        WorkerPool::new(config, Arc::new(job))
    }

    fn ok_job() -> JobFn {
        Arc::new(|_ctx, _event| async { Ok(()) }.boxed())
    }

    #[tokio::test]
    async fn submit_sync_completes_job() {
        let pool = WorkerPool::new(WorkerPoolConfig::default(), ok_job());
        pool.start().await;
        let ctx = CancellationToken::new();
        pool.submit_sync(&ctx, event()).await.unwrap();
        let metrics = pool.metrics().await;
        assert_eq!(metrics.jobs_processed, 1);
        assert_eq!(metrics.jobs_failed, 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn slow_job_counts_toward_timeout() {
        let config = WorkerPoolConfig {
            num_workers: 1,
            job_timeout_ms: 100,
            ..WorkerPoolConfig::default()
        };
        let pool = pool_with(config, |_ctx, _event| {
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            }
            .boxed()
        });
        pool.start().await;

        let ctx = CancellationToken::new();
        let err = pool.submit_sync(&ctx, event()).await.unwrap_err();
        assert_eq!(err, PoolError::JobTimeout);

        // Give the worker a beat to publish its counters.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.metrics().await.jobs_timeout, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn panicking_job_counts_as_failed_and_worker_survives() {
        let config = WorkerPoolConfig {
            num_workers: 1,
            ..WorkerPoolConfig::default()
        };
        let pool = pool_with(config, |_ctx, event| {
            async move {
                if event.message.contains("boom") {
                    panic!("kaboom");
                }
                Ok(())
            }
            .boxed()
        });
        pool.start().await;

        let ctx = CancellationToken::new();
        let err = pool
            .submit_sync(&ctx, LogEvent::from_line("t", "boom\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::JobFailed(_)));

        // The same worker keeps serving jobs afterwards.
        pool.submit_sync(&ctx, LogEvent::from_line("t", "fine\n"))
            .await
            .unwrap();

        let metrics = pool.metrics().await;
        assert_eq!(metrics.jobs_processed, 2);
        assert_eq!(metrics.jobs_failed, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn submit_async_reports_queue_full() {
        let config = WorkerPoolConfig {
            num_workers: 1,
            queue_size: 1,
            ..WorkerPoolConfig::default()
        };
        // Workers never started, so the queue fills immediately.
        let pool = pool_with(config, |_ctx, _event| async { Ok(()) }.boxed());
        pool.submit_async(event()).unwrap();
        assert_eq!(pool.submit_async(event()).unwrap_err(), PoolError::QueueFull);
    }

    #[tokio::test]
    async fn conservation_of_job_counts() {
        let config = WorkerPoolConfig {
            num_workers: 2,
            job_timeout_ms: 100,
            ..WorkerPoolConfig::default()
        };
        let pool = pool_with(config, |_ctx, event| {
            async move {
                match event.message.trim() {
                    "fail" => anyhow::bail!("nope"),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            .boxed()
        });
        pool.start().await;

        let ctx = CancellationToken::new();
        let _ = pool.submit_sync(&ctx, LogEvent::from_line("t", "ok\n")).await;
        let _ = pool.submit_sync(&ctx, LogEvent::from_line("t", "fail\n")).await;
        let _ = pool.submit_sync(&ctx, LogEvent::from_line("t", "slow\n")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let metrics = pool.metrics().await;
        let succeeded = metrics.jobs_processed - metrics.jobs_failed - metrics.jobs_timeout;
        assert_eq!(metrics.jobs_processed, 3);
        assert_eq!(succeeded, 1);
        assert_eq!(metrics.jobs_failed, 1);
        assert_eq!(metrics.jobs_timeout, 1);
        assert!(metrics.workers_active <= metrics.num_workers);
        pool.stop().await;
    }

    #[tokio::test]
    async fn scale_down_retires_surplus_workers() {
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                num_workers: 4,
                ..WorkerPoolConfig::default()
            },
            ok_job(),
        );
        pool.start().await;
        assert_eq!(pool.metrics().await.workers_active, 4);

        pool.scale(1).await;
        let metrics = pool.metrics().await;
        assert_eq!(metrics.workers_active, 1);
        assert_eq!(metrics.num_workers, 1);

        // Scaled-down pool still processes work.
        let ctx = CancellationToken::new();
        pool.submit_sync(&ctx, event()).await.unwrap();
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_queue_and_zeroes_active_workers() {
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                num_workers: 2,
                ..WorkerPoolConfig::default()
            },
            ok_job(),
        );
        for _ in 0..10 {
            pool.submit_async(event()).unwrap();
        }
        pool.start().await;
        pool.stop().await;

        let metrics = pool.metrics().await;
        assert_eq!(metrics.workers_active, 0);
        assert_eq!(metrics.jobs_processed, 10);
        assert_eq!(metrics.queue_size, 0);
    }

    #[tokio::test]
    async fn stealing_pool_processes_everything() {
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                num_workers: 4,
                enable_stealing: true,
                ..WorkerPoolConfig::default()
            },
            ok_job(),
        );
        for _ in 0..50 {
            pool.submit_async(event()).unwrap();
        }
        pool.start().await;
        pool.stop().await;
        assert_eq!(pool.metrics().await.jobs_processed, 50);
    }
}
