//! Health evaluation.
//!
//! The probe is binary: DOWN when Redis is unavailable while standby is
//! enabled, when a pool channel has been full past the threshold, or
//! when too many circuit breakers are open. Everything else is UP; the
//! aggregated report carries the per-check detail.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::warning::WarningStore;
use relay_common::{HealthCheck, HealthReport, HealthStatus, PoolStats};

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How long a pool channel may stay full before the probe fails.
    pub pool_full_threshold: Duration,
    /// Open-breaker count above which the probe fails.
    pub breaker_open_threshold: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            pool_full_threshold: Duration::from_secs(60),
            breaker_open_threshold: 5,
        }
    }
}

pub struct HealthService {
    config: HealthConfig,
    warnings: Arc<WarningStore>,
    standby_enabled: bool,
    /// When each pool's channel first became full.
    full_since: RwLock<HashMap<String, Instant>>,
}

impl HealthService {
    pub fn new(config: HealthConfig, warnings: Arc<WarningStore>, standby_enabled: bool) -> Self {
        Self {
            config,
            warnings,
            standby_enabled,
            full_since: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate the probe from current snapshots.
    ///
    /// `redis_available` is None when standby is disabled.
    pub fn evaluate(
        &self,
        pool_stats: &[PoolStats],
        open_breakers: usize,
        redis_available: Option<bool>,
    ) -> HealthReport {
        let mut checks = Vec::with_capacity(3);

        // Election backing store.
        let redis_healthy = match (self.standby_enabled, redis_available) {
            (true, Some(false)) => false,
            (true, None) => false,
            _ => true,
        };
        checks.push(HealthCheck {
            name: "election-store".to_string(),
            healthy: redis_healthy,
            detail: if self.standby_enabled {
                Some(format!("redis_available={:?}", redis_available))
            } else {
                Some("standby disabled".to_string())
            },
        });

        // Persistently full pool channels.
        let stuck_pools = self.track_full_pools(pool_stats);
        checks.push(HealthCheck {
            name: "pool-capacity".to_string(),
            healthy: stuck_pools.is_empty(),
            detail: if stuck_pools.is_empty() {
                None
            } else {
                Some(format!("channels full past threshold: {}", stuck_pools.join(", ")))
            },
        });

        // Circuit breaker storm.
        let breakers_healthy = open_breakers <= self.config.breaker_open_threshold;
        checks.push(HealthCheck {
            name: "circuit-breakers".to_string(),
            healthy: breakers_healthy,
            detail: Some(format!(
                "{} open (threshold {})",
                open_breakers, self.config.breaker_open_threshold
            )),
        });

        let status = if checks.iter().all(|c| c.healthy) {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        };

        if status == HealthStatus::Down {
            warn!(checks = ?checks, "Health probe DOWN");
        } else {
            debug!("Health probe UP");
        }

        HealthReport {
            status,
            checks,
            active_warnings: self.warnings.unacknowledged_count() as u32,
            critical_warnings: self.warnings.critical_count() as u32,
        }
    }

    /// Track how long each pool channel has been full; returns the
    /// pools past the threshold.
    fn track_full_pools(&self, pool_stats: &[PoolStats]) -> Vec<String> {
        let mut full_since = self.full_since.write();
        let mut stuck = Vec::new();

        for stat in pool_stats {
            if stat.queue_size >= stat.queue_capacity && stat.queue_capacity > 0 {
                let since = full_since
                    .entry(stat.pool_code.clone())
                    .or_insert_with(Instant::now);
                if since.elapsed() >= self.config.pool_full_threshold {
                    stuck.push(stat.pool_code.clone());
                }
            } else {
                full_since.remove(&stat.pool_code);
            }
        }

        // Forget pools that no longer exist.
        full_since.retain(|code, _| pool_stats.iter().any(|s| &s.pool_code == code));

        stuck
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_stat(code: &str, queue_size: u32, capacity: u32) -> PoolStats {
        PoolStats {
            pool_code: code.to_string(),
            concurrency: 4,
            active_workers: 0,
            queue_size,
            queue_capacity: capacity,
            rate_limit_per_minute: None,
            processed: 0,
            succeeded: 0,
            failed: 0,
            rate_limited: 0,
            avg_processing_ms: 0.0,
        }
    }

    fn service(standby_enabled: bool) -> HealthService {
        HealthService::new(
            HealthConfig {
                pool_full_threshold: Duration::from_millis(10),
                breaker_open_threshold: 2,
            },
            Arc::new(WarningStore::default()),
            standby_enabled,
        )
    }

    #[test]
    fn healthy_when_all_checks_pass() {
        let health = service(false);
        let report = health.evaluate(&[pool_stat("P1", 0, 100)], 0, None);
        assert_eq!(report.status, HealthStatus::Up);
    }

    #[test]
    fn down_when_redis_unavailable_with_standby() {
        let health = service(true);
        let report = health.evaluate(&[], 0, Some(false));
        assert_eq!(report.status, HealthStatus::Down);
    }

    #[test]
    fn redis_ignored_when_standby_disabled() {
        let health = service(false);
        let report = health.evaluate(&[], 0, None);
        assert_eq!(report.status, HealthStatus::Up);
    }

    #[test]
    fn down_when_too_many_breakers_open() {
        let health = service(false);
        let report = health.evaluate(&[], 3, None);
        assert_eq!(report.status, HealthStatus::Down);
    }

    #[test]
    fn transiently_full_pool_stays_up() {
        let health = service(false);
        let report = health.evaluate(&[pool_stat("P1", 100, 100)], 0, None);
        assert_eq!(report.status, HealthStatus::Up);
    }

    #[test]
    fn persistently_full_pool_goes_down() {
        let health = service(false);
        let stats = [pool_stat("P1", 100, 100)];

        health.evaluate(&stats, 0, None);
        std::thread::sleep(Duration::from_millis(20));
        let report = health.evaluate(&stats, 0, None);

        assert_eq!(report.status, HealthStatus::Down);
    }

    #[test]
    fn recovered_pool_resets_tracking() {
        let health = service(false);

        health.evaluate(&[pool_stat("P1", 100, 100)], 0, None);
        std::thread::sleep(Duration::from_millis(20));
        // Channel emptied before the second evaluation.
        let report = health.evaluate(&[pool_stat("P1", 0, 100)], 0, None);

        assert_eq!(report.status, HealthStatus::Up);
    }
}
