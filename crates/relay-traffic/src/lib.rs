//! Traffic registrar: wires election role transitions to an external
//! load balancer.
//!
//! On become-PRIMARY the instance registers itself (address + port); on
//! become-STANDBY or shutdown it deregisters. Strategies are pluggable
//! behind [`TrafficStrategy`]; everything is best-effort — a failed
//! registration is logged and retried on the next transition, never
//! propagated to the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use relay_standby::Role;

pub mod alb;

pub use alb::AlbTargetGroupStrategy;

#[derive(Error, Debug)]
pub enum TrafficError {
    #[error("Load balancer error: {0}")]
    LoadBalancer(String),

    #[error("Address detection failed: {0}")]
    AddressDetection(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TrafficError>;

/// Snapshot of the registrar for monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficStatus {
    pub enabled: bool,
    pub strategy_type: String,
    pub registered: bool,
    pub target_info: Option<String>,
    pub last_operation: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A load balancer registration strategy.
#[async_trait]
pub trait TrafficStrategy: Send + Sync {
    fn strategy_type(&self) -> &str;

    async fn register(&self) -> Result<()>;

    async fn deregister(&self) -> Result<()>;

    fn is_registered(&self) -> bool;

    fn status(&self) -> TrafficStatus;
}

/// Default strategy: no load balancer integration.
pub struct NoopStrategy;

#[async_trait]
impl TrafficStrategy for NoopStrategy {
    fn strategy_type(&self) -> &str {
        "NONE"
    }

    async fn register(&self) -> Result<()> {
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        Ok(())
    }

    fn is_registered(&self) -> bool {
        true
    }

    fn status(&self) -> TrafficStatus {
        TrafficStatus {
            enabled: false,
            strategy_type: "NONE".to_string(),
            registered: true,
            target_info: None,
            last_operation: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Register,
    Deregister,
}

impl Operation {
    fn label(self) -> &'static str {
        match self {
            Operation::Register => "register",
            Operation::Deregister => "deregister",
        }
    }
}

/// Retry policy for strategy operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

/// Drives a [`TrafficStrategy`] from election role transitions.
pub struct TrafficManager {
    strategy: Arc<dyn TrafficStrategy>,
    retry: RetryPolicy,
}

impl TrafficManager {
    pub fn new(strategy: Arc<dyn TrafficStrategy>, retry: RetryPolicy) -> Self {
        Self { strategy, retry }
    }

    pub fn status(&self) -> TrafficStatus {
        self.strategy.status()
    }

    /// Register with retries. Failures are logged, never returned.
    pub async fn register(&self) {
        self.run_with_retries(Operation::Register).await;
    }

    /// Deregister with retries. Failures are logged, never returned.
    pub async fn deregister(&self) {
        self.run_with_retries(Operation::Deregister).await;
    }

    async fn run_with_retries(&self, op: Operation) {
        let operation = op.label();
        let mut delay = self.retry.initial_delay;

        for attempt in 1..=self.retry.max_attempts {
            let result = match op {
                Operation::Register => self.strategy.register().await,
                Operation::Deregister => self.strategy.deregister().await,
            };

            match result {
                Ok(()) => {
                    info!(
                        operation = operation,
                        strategy = self.strategy.strategy_type(),
                        attempt = attempt,
                        "Traffic operation succeeded"
                    );
                    return;
                }
                Err(e) if attempt < self.retry.max_attempts => {
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Traffic operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!(
                        operation = operation,
                        attempts = attempt,
                        error = %e,
                        "Traffic operation failed after all attempts"
                    );
                }
            }
        }
    }

    /// Spawn the task that reacts to role changes: register when this
    /// instance becomes PRIMARY, deregister when it stops being one.
    pub fn spawn(self: Arc<Self>, mut role_rx: watch::Receiver<Role>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut was_primary = *role_rx.borrow() == Role::Primary;

            if was_primary {
                self.register().await;
            }

            while role_rx.changed().await.is_ok() {
                let is_primary = *role_rx.borrow() == Role::Primary;

                if is_primary && !was_primary {
                    info!("Became PRIMARY, registering with load balancer");
                    self.register().await;
                } else if !is_primary && was_primary {
                    info!("No longer PRIMARY, deregistering from load balancer");
                    self.deregister().await;
                }

                was_primary = is_primary;
            }

            // Watch sender dropped: shutdown. Deregister eagerly.
            if was_primary {
                self.deregister().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingStrategy {
        registers: AtomicU32,
        deregisters: AtomicU32,
        fail_first: AtomicU32,
    }

    impl CountingStrategy {
        fn new(fail_first: u32) -> Self {
            Self {
                registers: AtomicU32::new(0),
                deregisters: AtomicU32::new(0),
                fail_first: AtomicU32::new(fail_first),
            }
        }
    }

    #[async_trait]
    impl TrafficStrategy for CountingStrategy {
        fn strategy_type(&self) -> &str {
            "COUNTING"
        }

        async fn register(&self) -> Result<()> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(TrafficError::LoadBalancer("transient".to_string()));
            }
            Ok(())
        }

        async fn deregister(&self) -> Result<()> {
            self.deregisters.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_registered(&self) -> bool {
            true
        }

        fn status(&self) -> TrafficStatus {
            TrafficStatus {
                enabled: true,
                strategy_type: "COUNTING".to_string(),
                registered: true,
                target_info: None,
                last_operation: None,
                last_error: None,
            }
        }
    }

    #[tokio::test]
    async fn register_retries_on_failure() {
        let strategy = Arc::new(CountingStrategy::new(2));
        let manager = TrafficManager::new(
            strategy.clone(),
            RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
            },
        );

        manager.register().await;

        // Two failures then success
        assert_eq!(strategy.registers.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_never_propagate() {
        let strategy = Arc::new(CountingStrategy::new(10));
        let manager = TrafficManager::new(
            strategy.clone(),
            RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
            },
        );

        // Exhausts attempts without panicking or returning an error
        manager.register().await;
        assert_eq!(strategy.registers.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn role_transitions_drive_registration() {
        let strategy = Arc::new(CountingStrategy::new(0));
        let manager = Arc::new(TrafficManager::new(
            strategy.clone(),
            RetryPolicy {
                max_attempts: 1,
                initial_delay: Duration::from_millis(1),
            },
        ));

        let (role_tx, role_rx) = watch::channel(Role::Standby);
        let handle = manager.spawn(role_rx);

        role_tx.send(Role::Primary).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(strategy.registers.load(Ordering::SeqCst), 1);

        role_tx.send(Role::Standby).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(strategy.deregisters.load(Ordering::SeqCst), 1);

        drop(role_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn noop_strategy_reports_registered() {
        let noop = NoopStrategy;
        assert!(noop.register().await.is_ok());
        assert!(noop.is_registered());
        assert_eq!(noop.status().strategy_type, "NONE");
    }
}
