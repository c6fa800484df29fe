//! Per-pool token-bucket rate limiter.
//!
//! Capacity equals the configured messages-per-minute; refill is
//! capacity/60 tokens per second. Acquisition blocks in a short poll
//! loop so a live config change (limit raised, lowered, or removed)
//! takes effect mid-wait, and the loop aborts on shutdown.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// How long to sleep between permit checks while blocked.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of a blocking acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Token granted immediately.
    Granted,
    /// Token granted after at least one blocked poll.
    GrantedAfterWait,
    /// Shutdown signalled while waiting.
    Shutdown,
}

pub struct PoolRateLimiter {
    limiter: parking_lot::RwLock<Option<Arc<DirectLimiter>>>,
    rate_per_minute: parking_lot::RwLock<Option<u32>>,
}

impl PoolRateLimiter {
    pub fn new(rate_limit_per_minute: Option<u32>) -> Self {
        Self {
            limiter: parking_lot::RwLock::new(Self::build(rate_limit_per_minute)),
            rate_per_minute: parking_lot::RwLock::new(rate_limit_per_minute),
        }
    }

    fn build(rate_limit_per_minute: Option<u32>) -> Option<Arc<DirectLimiter>> {
        rate_limit_per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))))
    }

    /// Replace the bucket in place. `None` (or 0) disables limiting.
    pub fn update(&self, rate_limit_per_minute: Option<u32>) {
        let normalized = rate_limit_per_minute.filter(|rpm| *rpm > 0);
        if *self.rate_per_minute.read() == normalized {
            return;
        }
        *self.limiter.write() = Self::build(normalized);
        *self.rate_per_minute.write() = normalized;
    }

    pub fn rate_per_minute(&self) -> Option<u32> {
        *self.rate_per_minute.read()
    }

    /// Whether a token would be denied right now.
    pub fn is_throttled(&self) -> bool {
        self.limiter
            .read()
            .as_ref()
            .map(|l| l.check().is_err())
            .unwrap_or(false)
    }

    /// Block until a token is available or shutdown is signalled.
    pub async fn acquire(&self, shutdown: &watch::Receiver<bool>) -> Acquire {
        let mut waited = false;

        loop {
            // Re-read each iteration: the limiter may have been swapped
            // by a config refresh while we were waiting.
            let limiter = self.limiter.read().clone();

            match limiter {
                None => {
                    return if waited {
                        Acquire::GrantedAfterWait
                    } else {
                        Acquire::Granted
                    }
                }
                Some(l) => {
                    if l.check().is_ok() {
                        return if waited {
                            Acquire::GrantedAfterWait
                        } else {
                            Acquire::Granted
                        };
                    }

                    if *shutdown.borrow() {
                        return Acquire::Shutdown;
                    }

                    waited = true;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn unlimited_grants_immediately() {
        let limiter = PoolRateLimiter::new(None);
        assert_eq!(limiter.acquire(&no_shutdown()).await, Acquire::Granted);
        assert!(!limiter.is_throttled());
    }

    #[tokio::test]
    async fn exhausted_bucket_throttles() {
        // 60/min = 1 token/second; capacity 60 so drain the burst first.
        let limiter = PoolRateLimiter::new(Some(60));
        let shutdown = no_shutdown();

        for _ in 0..60 {
            let got = limiter.acquire(&shutdown).await;
            assert_ne!(got, Acquire::Shutdown);
        }

        assert!(limiter.is_throttled());
    }

    #[tokio::test]
    async fn shutdown_aborts_wait() {
        let limiter = PoolRateLimiter::new(Some(60));
        let (tx, rx) = watch::channel(false);

        // Drain the burst capacity.
        for _ in 0..60 {
            limiter.acquire(&rx).await;
        }

        tx.send(true).unwrap();
        assert_eq!(limiter.acquire(&rx).await, Acquire::Shutdown);
    }

    #[tokio::test]
    async fn removing_limit_unblocks() {
        let limiter = Arc::new(PoolRateLimiter::new(Some(60)));
        let shutdown = no_shutdown();

        for _ in 0..60 {
            limiter.acquire(&shutdown).await;
        }

        let waiter = {
            let limiter = limiter.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { limiter.acquire(&shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.update(None);

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Acquire::GrantedAfterWait);
    }

    #[test]
    fn update_zero_disables() {
        let limiter = PoolRateLimiter::new(Some(10));
        limiter.update(Some(0));
        assert_eq!(limiter.rate_per_minute(), None);
        assert!(!limiter.is_throttled());
    }
}
