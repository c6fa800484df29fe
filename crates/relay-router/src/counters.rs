//! Per-pool processing counters.
//!
//! Lock-free counters plus an exponentially weighted moving average of
//! processing time. Snapshots feed `PoolStats` and the monitoring API.

use relay_common::MediationResult;
use std::sync::atomic::{AtomicU64, Ordering};

/// EWMA smoothing factor.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Default)]
pub struct PoolCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    /// f64 bits of the current EWMA; 0 until the first sample.
    ewma_bits: AtomicU64,
}

impl PoolCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finalised message.
    pub fn record_outcome(&self, result: MediationResult, duration_ms: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        match result {
            MediationResult::Success => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.update_ewma(duration_ms as f64);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    fn update_ewma(&self, sample_ms: f64) {
        let mut current = self.ewma_bits.load(Ordering::Relaxed);
        loop {
            let old = f64::from_bits(current);
            let new = if self.processed.load(Ordering::Relaxed) <= 1 {
                sample_ms
            } else {
                EWMA_ALPHA * sample_ms + (1.0 - EWMA_ALPHA) * old
            };
            match self.ewma_bits.compare_exchange_weak(
                current,
                new.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn rate_limited(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }

    pub fn avg_processing_ms(&self) -> f64 {
        f64::from_bits(self.ewma_bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_outcomes() {
        let counters = PoolCounters::new();

        counters.record_outcome(MediationResult::Success, 100);
        counters.record_outcome(MediationResult::Success, 100);
        counters.record_outcome(MediationResult::ErrorServer, 200);

        assert_eq!(counters.processed(), 3);
        assert_eq!(counters.succeeded(), 2);
        assert_eq!(counters.failed(), 1);
    }

    #[test]
    fn first_sample_seeds_ewma() {
        let counters = PoolCounters::new();
        counters.record_outcome(MediationResult::Success, 500);
        assert!((counters.avg_processing_ms() - 500.0).abs() < 0.01);
    }

    #[test]
    fn ewma_moves_toward_recent_samples() {
        let counters = PoolCounters::new();
        counters.record_outcome(MediationResult::Success, 100);
        for _ in 0..20 {
            counters.record_outcome(MediationResult::Success, 1000);
        }
        let avg = counters.avg_processing_ms();
        assert!(avg > 800.0, "ewma {} should converge toward 1000", avg);
        assert!(avg <= 1000.0);
    }
}
