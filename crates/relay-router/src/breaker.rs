//! Per-target circuit breakers.
//!
//! Keyed by mediation target URL. A rolling window of recent call
//! results trips the breaker Closed -> Open once the window holds at
//! least `min_requests` calls with a failure ratio at or above
//! `failure_ratio`. Open rejects everything for `open_timeout`, then
//! Half-Open admits probes; `success_threshold` consecutive successes
//! close it again, any failure reopens.
//!
//! Only connection and server errors count as failures. A 4xx reached
//! the target over a working connection, so it counts as a success here
//! even though it is an error for the message.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use utoipa::ToSchema;

use relay_common::MediationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Stats snapshot for one breaker.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub failure_rate: f64,
    pub buffered_calls: u32,
    pub window_size: u32,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Rolling window length.
    pub window_size: u32,
    /// Minimum calls in the window before the ratio is evaluated.
    pub min_requests: u32,
    /// Failure ratio at which the breaker opens (0.0 - 1.0).
    pub failure_ratio: f64,
    /// Open duration before probing.
    pub open_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            min_requests: 10,
            failure_ratio: 0.5,
            open_timeout: Duration::from_secs(5),
            success_threshold: 3,
        }
    }
}

struct TargetBreaker {
    name: String,
    state: RwLock<BreakerState>,
    opened_at: RwLock<Option<Instant>>,
    window: RwLock<VecDeque<bool>>,
    half_open_successes: AtomicU32,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    config: BreakerConfig,
}

impl TargetBreaker {
    fn new(name: String, config: BreakerConfig) -> Self {
        Self {
            name,
            state: RwLock::new(BreakerState::Closed),
            opened_at: RwLock::new(None),
            window: RwLock::new(VecDeque::with_capacity(config.window_size as usize)),
            half_open_successes: AtomicU32::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            config,
        }
    }

    /// Whether a call may proceed. Drives the Open -> Half-Open
    /// transition once the open timeout elapses.
    fn allow_request(&self) -> bool {
        let state = *self.state.read();

        match state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let expired = self
                    .opened_at
                    .read()
                    .map(|t| t.elapsed() >= self.config.open_timeout)
                    .unwrap_or(true);

                if expired {
                    *self.state.write() = BreakerState::HalfOpen;
                    self.half_open_successes.store(0, Ordering::SeqCst);
                    info!(target = %self.name, "Circuit half-open, admitting probes");
                    true
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    fn push_window(&self, success: bool) {
        let mut window = self.window.write();
        if window.len() >= self.config.window_size as usize {
            window.pop_front();
        }
        window.push_back(success);
    }

    fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        self.push_window(true);

        let state = *self.state.read();
        if state == BreakerState::HalfOpen {
            let streak = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if streak >= self.config.success_threshold {
                *self.state.write() = BreakerState::Closed;
                *self.opened_at.write() = None;
                self.window.write().clear();
                info!(target = %self.name, successes = streak, "Circuit closed");
            }
        }
    }

    fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        self.push_window(false);

        let state = *self.state.read();
        match state {
            BreakerState::Closed => {
                let window = self.window.read();
                let total = window.len() as u32;
                if total >= self.config.min_requests {
                    let failures = window.iter().filter(|s| !**s).count() as f64;
                    let ratio = failures / total as f64;
                    drop(window);
                    if ratio >= self.config.failure_ratio {
                        *self.state.write() = BreakerState::Open;
                        *self.opened_at.write() = Some(Instant::now());
                        warn!(
                            target = %self.name,
                            failure_rate = ratio,
                            window = total,
                            "Circuit opened"
                        );
                    }
                }
            }
            BreakerState::HalfOpen => {
                *self.state.write() = BreakerState::Open;
                *self.opened_at.write() = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::SeqCst);
                warn!(target = %self.name, "Circuit re-opened on half-open failure");
            }
            BreakerState::Open => {}
        }
    }

    fn stats(&self) -> BreakerStats {
        let successful = self.successful_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);
        let total = successful + failed;

        let failure_rate = if total > 0 {
            failed as f64 / total as f64
        } else {
            0.0
        };

        BreakerStats {
            name: self.name.clone(),
            state: *self.state.read(),
            successful_calls: successful,
            failed_calls: failed,
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            failure_rate,
            buffered_calls: self.window.read().len() as u32,
            window_size: self.config.window_size,
        }
    }

    fn reset(&self) {
        *self.state.write() = BreakerState::Closed;
        *self.opened_at.write() = None;
        self.half_open_successes.store(0, Ordering::SeqCst);
        self.window.write().clear();
    }
}

/// Registry of per-target breakers.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<TargetBreaker>>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn get_or_create(&self, target: &str) -> Arc<TargetBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(target) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(target.to_string()).or_insert_with(|| {
            Arc::new(TargetBreaker::new(target.to_string(), self.config.clone()))
        }))
    }

    /// Whether a call to the target may proceed. A rejection is counted
    /// against the breaker's stats.
    pub fn allow_request(&self, target: &str) -> bool {
        self.get_or_create(target).allow_request()
    }

    /// Record a mediation attempt's outcome against the target.
    pub fn observe(&self, target: &str, result: MediationResult) {
        let breaker = self.get_or_create(target);
        if result.is_breaker_failure() {
            breaker.record_failure();
        } else {
            breaker.record_success();
        }
    }

    pub fn state(&self, target: &str) -> Option<BreakerState> {
        self.breakers.read().get(target).map(|b| *b.state.read())
    }

    pub fn stats(&self, target: &str) -> Option<BreakerStats> {
        self.breakers.read().get(target).map(|b| b.stats())
    }

    pub fn all_stats(&self) -> Vec<BreakerStats> {
        self.breakers.read().values().map(|b| b.stats()).collect()
    }

    pub fn reset(&self, target: &str) -> bool {
        if let Some(breaker) = self.breakers.read().get(target) {
            breaker.reset();
            true
        } else {
            false
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .read()
            .values()
            .filter(|b| *b.state.read() == BreakerState::Open)
            .count()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
