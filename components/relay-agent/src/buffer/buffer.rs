// Local crates
use crate::model::event::LogEvent;

// External crates
use rand::Rng;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BufferError {
    #[error("buffer is closed")]
    Closed,
    #[error("send deadline elapsed")]
    Timeout,
}

/// Policy applied when a producer outpaces the consumers.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressureStrategy {
    /// Producer suspends until space frees up or its deadline elapses.
    Block,
    /// Evict the oldest entry to make room; never blocks the producer.
    DropOldest,
    /// Drop the incoming event with probability proportional to fill level;
    /// never blocks the producer.
    Sample,
}

/// Bounded FIFO queue decoupling inputs from the worker pool. Capacity is
/// fixed at construction; order is preserved per producer.
#[derive(Debug)]
pub struct EventBuffer {
    queue: Mutex<VecDeque<LogEvent>>,
    capacity: usize,
    strategy: BackpressureStrategy,
    closed: AtomicBool,
    dropped: AtomicU64,
    sampled_out: AtomicU64,
    not_empty: Notify,
    not_full: Notify,
}

impl EventBuffer {
    pub fn new(capacity: usize, strategy: BackpressureStrategy) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            strategy,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            sampled_out: AtomicU64::new(0),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn sampled_out(&self) -> u64 {
        self.sampled_out.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the buffer. Pending sends fail with [`BufferError::Closed`];
    /// consumers keep draining until the queue is empty.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Enqueue under the configured strategy without a producer deadline;
    /// under `Block` this waits for space indefinitely.
    pub async fn send(&self, event: LogEvent) -> Result<(), BufferError> {
        self.send_with_deadline(event, None).await
    }

    /// Enqueue with an optional deadline for the `Block` strategy. The
    /// deadline is ignored by the non-blocking strategies.
    pub async fn send_with_deadline(
        &self,
        event: LogEvent,
        deadline: Option<Duration>,
    ) -> Result<(), BufferError> {
        match self.strategy {
            BackpressureStrategy::Block => self.send_blocking(event, deadline).await,
            BackpressureStrategy::DropOldest => {
                if self.is_closed() {
                    return Err(BufferError::Closed);
                }
                {
                    let mut queue = lock(&self.queue);
                    if queue.len() >= self.capacity {
                        queue.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    queue.push_back(event);
                }
                self.not_empty.notify_one();
                Ok(())
            }
            BackpressureStrategy::Sample => {
                if self.is_closed() {
                    return Err(BufferError::Closed);
                }
                {
                    let mut queue = lock(&self.queue);
                    let fill = queue.len() as f64 / self.capacity as f64;
                    if rand::rng().random::<f64>() < fill {
                        self.sampled_out.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    queue.push_back(event);
                }
                self.not_empty.notify_one();
                Ok(())
            }
        }
    }

    async fn send_blocking(
        &self,
        event: LogEvent,
        deadline: Option<Duration>,
    ) -> Result<(), BufferError> {
        let wait = async {
            loop {
                let notified = self.not_full.notified();
                if self.is_closed() {
                    return Err(BufferError::Closed);
                }
                {
                    let mut queue = lock(&self.queue);
                    if queue.len() < self.capacity {
                        queue.push_back(event);
                        break;
                    }
                }
                notified.await;
            }
            self.not_empty.notify_one();
            Ok(())
        };
        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, wait)
                .await
                .unwrap_or(Err(BufferError::Timeout)),
            None => wait.await,
        }
    }

    /// Dequeue the next event. Resolves to `None` once the buffer is closed
    /// and fully drained.
    pub async fn recv(&self) -> Option<LogEvent> {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut queue = lock(&self.queue);
                if let Some(event) = queue.pop_front() {
                    drop(queue);
                    self.not_full.notify_one();
                    return Some(event);
                }
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }
}

/// The queue mutex is only held for push/pop; poisoning can only happen if
/// a holder panicked mid-operation, at which point continuing with the
/// inner state is still sound for a queue of owned events.
fn lock(queue: &Mutex<VecDeque<LogEvent>>) -> std::sync::MutexGuard<'_, VecDeque<LogEvent>> {
    match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: usize) -> LogEvent {
        LogEvent::from_line("test", &format!("event-{n}\n"))
    }

    #[tokio::test]
    async fn fifo_order_within_producer() {
        let buffer = EventBuffer::new(8, BackpressureStrategy::Block);
        for n in 0..4 {
            buffer.send(event(n)).await.unwrap();
        }
        for n in 0..4 {
            assert_eq!(buffer.recv().await.unwrap().message, format!("event-{n}\n"));
        }
    }

    #[tokio::test]
    async fn drop_oldest_evicts_from_front() {
        let buffer = EventBuffer::new(4, BackpressureStrategy::DropOldest);
        for n in 1..=6 {
            buffer.send(event(n)).await.unwrap();
        }
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.dropped(), 2);
        for n in 3..=6 {
            assert_eq!(buffer.recv().await.unwrap().message, format!("event-{n}\n"));
        }
    }

    #[tokio::test]
    async fn block_strategy_times_out_when_full() {
        let buffer = EventBuffer::new(1, BackpressureStrategy::Block);
        buffer.send(event(0)).await.unwrap();
        let err = buffer
            .send_with_deadline(event(1), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err, BufferError::Timeout);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn block_strategy_resumes_when_space_frees() {
        let buffer = std::sync::Arc::new(EventBuffer::new(1, BackpressureStrategy::Block));
        buffer.send(event(0)).await.unwrap();

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.send(event(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.recv().await.unwrap().message, "event-0\n");
        producer.await.unwrap().unwrap();
        assert_eq!(buffer.recv().await.unwrap().message, "event-1\n");
    }

    #[tokio::test]
    async fn sample_never_blocks_and_drops_at_full() {
        let buffer = EventBuffer::new(4, BackpressureStrategy::Sample);
        for n in 0..32 {
            buffer.send(event(n)).await.unwrap();
        }
        // At fill level 1.0 the drop probability is 1, so the queue can
        // never exceed its capacity.
        assert!(buffer.len() <= 4);
        assert!(buffer.sampled_out() >= 28);
    }

    #[tokio::test]
    async fn len_never_exceeds_capacity() {
        for strategy in [
            BackpressureStrategy::DropOldest,
            BackpressureStrategy::Sample,
        ] {
            let buffer = EventBuffer::new(4, strategy);
            for n in 0..100 {
                buffer.send(event(n)).await.unwrap();
                assert!(buffer.len() <= buffer.capacity());
            }
        }
    }

    #[tokio::test]
    async fn closed_buffer_rejects_sends_and_drains() {
        let buffer = EventBuffer::new(4, BackpressureStrategy::Block);
        buffer.send(event(0)).await.unwrap();
        buffer.send(event(1)).await.unwrap();
        buffer.close();

        assert_eq!(buffer.send(event(2)).await.unwrap_err(), BufferError::Closed);
        assert_eq!(buffer.recv().await.unwrap().message, "event-0\n");
        assert_eq!(buffer.recv().await.unwrap().message, "event-1\n");
        assert!(buffer.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_blocked_producer() {
        let buffer = std::sync::Arc::new(EventBuffer::new(1, BackpressureStrategy::Block));
        buffer.send(event(0)).await.unwrap();
        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.send(event(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();
        assert_eq!(producer.await.unwrap().unwrap_err(), BufferError::Closed);
    }
}
