// Local crates
use crate::model::event::LogEvent;

// External crates
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PoolError {
    #[error("job queue is full")]
    QueueFull,
    #[error("submission cancelled by caller")]
    Cancelled,
    #[error("job deadline elapsed")]
    JobTimeout,
    #[error("job failed: {0}")]
    JobFailed(String),
    #[error("worker pool is stopped")]
    Closed,
}

/// The job body invoked per event. The token is cancelled when the job's
/// deadline elapses; jobs that ignore it are still counted against the
/// timeout metric once the worker-side deadline fires.
pub type JobFn =
    Arc<dyn Fn(CancellationToken, LogEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn default_num_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    1000
}

fn default_job_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    #[serde(default)]
    pub enable_stealing: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            queue_size: default_queue_size(),
            job_timeout_ms: default_job_timeout_ms(),
            enable_stealing: false,
        }
    }
}

impl WorkerPoolConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

/// One queued unit of work. Consumed by exactly one worker; the result
/// travels back over the one-shot channel and the job is gone.
#[derive(Debug)]
pub struct Job {
    pub event: LogEvent,
    pub deadline: Instant,
    pub result_tx: oneshot::Sender<Result<(), PoolError>>,
    pub enqueued_at: Instant,
}

/// Per-worker counters, shared between the worker task and metrics readers.
#[derive(Debug)]
pub struct WorkerStats {
    pub id: usize,
    pub jobs_processed: AtomicU64,
    pub jobs_failed: AtomicU64,
    /// Unix seconds of the last job pickup; 0 means never active.
    pub last_active: AtomicI64,
}

impl WorkerStats {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            jobs_processed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            last_active: AtomicI64::new(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub last_active: i64,
}

impl From<&WorkerStats> for WorkerSnapshot {
    fn from(stats: &WorkerStats) -> Self {
        Self {
            id: stats.id,
            jobs_processed: stats.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: stats.jobs_failed.load(Ordering::Relaxed),
            last_active: stats.last_active.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub num_workers: usize,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub jobs_timeout: u64,
    pub workers_active: usize,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub per_worker: Vec<WorkerSnapshot>,
}
