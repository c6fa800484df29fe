//! Relay message router core.
//!
//! The dispatch engine between bursty queue producers and rate-sensitive
//! downstream webhooks:
//! - DispatchEngine: orchestrator owning pools, consumers, and shutdown
//! - WorkerPool: bounded channel with a resizable worker set per pool
//! - Admission: in-flight dedup and bounded enqueue
//! - HttpMediator: outbound delivery with classification and retries
//! - BreakerRegistry: per-target circuit breakers
//! - PoolRateLimiter: per-pool token bucket
//! - WarningStore / HealthService: operator surface
//! - ConfigResolver: local or remote topology with live refresh
//! - api: monitoring endpoints

pub mod admission;
pub mod api;
pub mod breaker;
pub mod counters;
pub mod engine;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod limiter;
pub mod mediator;
pub mod pool;
pub mod resolver;
pub mod telemetry;
pub mod warning;

pub use admission::{Admission, AdmissionVerdict, InFlightSet};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, BreakerStats};
pub use counters::PoolCounters;
pub use engine::{ConsumerFactory, DispatchEngine, EngineConfig};
pub use error::RouterError;
pub use health::{HealthConfig, HealthService};
pub use limiter::{Acquire, PoolRateLimiter};
pub use mediator::{HttpMediator, HttpMediatorConfig, Mediator};
pub use pool::{DispatchJob, PoolContext, WorkerPool};
pub use resolver::{spawn_refresh_task, ConfigResolver, TopologySource};
pub use warning::{spawn_warning_cleanup, WarningStore, WarningStoreConfig};

pub type Result<T> = std::result::Result<T, RouterError>;
