// External crates
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Entries unused for this long are evicted by the pruner.
const IDLE_EVICTION: Duration = Duration::from_secs(300);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Per-remote-address token bucket. Buckets refill at `rate` tokens per
/// second up to `burst`, are created on first sight of an address, and are
/// evicted after five minutes without a touch (idle time, not lifetime, so
/// steadily active clients are never dropped mid-conversation).
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    buckets: RwLock<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    /// `burst` defaults to twice the sustained rate.
    pub fn new(rate: f64, burst: Option<f64>) -> Self {
        let rate = rate.max(f64::MIN_POSITIVE);
        Self {
            rate,
            burst: burst.unwrap_or(rate * 2.0).max(1.0),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<IpAddr, Bucket>> {
        match self.buckets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take one token for `addr`, refilling first. Returns false when the
    /// bucket is empty.
    pub fn allow(&self, addr: IpAddr) -> bool {
        let now = Instant::now();
        let mut buckets = self.write();
        let bucket = buckets.entry(addr).or_insert_with(|| Bucket {
            tokens: self.burst,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle longer than `max_idle`; returns how many went.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_seen) < max_idle);
        before - buckets.len()
    }

    pub fn tracked_addresses(&self) -> usize {
        match self.buckets.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// One pruner per limiter table, not per entry.
    pub fn start_pruner(self: &Arc<Self>, cancel: CancellationToken) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = limiter.prune_idle(IDLE_EVICTION);
                        if evicted > 0 {
                            tracing::debug!(evicted, "Evicted idle rate-limiter entries");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn burst_is_granted_then_exhausted() {
        let limiter = RateLimiter::new(5.0, None);
        // Default burst = 2x rate.
        for _ in 0..10 {
            assert!(limiter.allow(addr(1)));
        }
        assert!(!limiter.allow(addr(1)));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(50.0, Some(1.0));
        assert!(limiter.allow(addr(1)));
        assert!(!limiter.allow(addr(1)));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.allow(addr(1)));
    }

    #[test]
    fn addresses_are_independent() {
        let limiter = RateLimiter::new(1.0, Some(1.0));
        assert!(limiter.allow(addr(1)));
        assert!(limiter.allow(addr(2)));
        assert!(!limiter.allow(addr(1)));
    }

    #[test]
    fn idle_entries_are_pruned_active_ones_kept() {
        let limiter = RateLimiter::new(10.0, None);
        limiter.allow(addr(1));
        assert_eq!(limiter.tracked_addresses(), 1);

        // Nothing is idle yet at a generous threshold.
        assert_eq!(limiter.prune_idle(Duration::from_secs(60)), 0);
        // Everything is idle at a zero threshold.
        assert_eq!(limiter.prune_idle(Duration::ZERO), 1);
        assert_eq!(limiter.tracked_addresses(), 0);
    }
}
