use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use utoipa::ToSchema;

pub mod logging;

// ============================================================================
// Core Message Types
// ============================================================================

/// The message body as it appears on the wire (camelCase JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub pool_code: String,
    pub mediation_target: String,
    pub auth_token: Option<String>,
    /// Per-message mediation timeout override in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// A message received from a queue, together with everything needed to
/// finalise it: the broker receipt, the originating queue, and the
/// reception instant. Immutable per reception; dropped after ack/nack.
#[derive(Debug, Clone)]
pub struct MessagePointer {
    pub message: Message,
    pub receipt: String,
    pub source_queue: String,
    pub received_at: Instant,
}

impl MessagePointer {
    pub fn new(message: Message, receipt: String, source_queue: String) -> Self {
        Self {
            message,
            receipt,
            source_queue,
            received_at: Instant::now(),
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.received_at.elapsed().as_secs()
    }
}

/// Entry tracked in the process-wide in-flight set while a message is
/// admitted but not yet finalised.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub message_id: String,
    pub pool_code: String,
    pub source_queue: String,
    pub started_at: Instant,
}

impl InFlightEntry {
    pub fn new(pointer: &MessagePointer) -> Self {
        Self {
            message_id: pointer.message.id.clone(),
            pool_code: pointer.message.pool_code.clone(),
            source_queue: pointer.source_queue.clone(),
            started_at: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// A processing pool definition: bounded concurrency, optional rate limit,
/// and the capacity of the in-memory admission channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PoolConfig {
    pub code: String,
    pub concurrency: u32,
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: u32,
}

fn default_queue_capacity() -> u32 {
    100
}

/// Queue adapter flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Sqs,
    Amqp,
    Sqlite,
}

impl Default for QueueKind {
    fn default() -> Self {
        QueueKind::Sqs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub kind: QueueKind,
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout: u32,
    #[serde(default = "default_wait_time")]
    pub wait_time_seconds: u32,
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
}

fn default_visibility_timeout() -> u32 {
    120
}

fn default_wait_time() -> u32 {
    5
}

fn default_max_messages() -> u32 {
    10
}

/// The full routing topology: pools plus the queues feeding them.
/// Produced by the config resolver from a local file or a remote source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RouterTopology {
    pub pools: Vec<PoolConfig>,
    pub queues: Vec<QueueConfig>,
}

// ============================================================================
// Mediation Outcome Taxonomy
// ============================================================================

/// Classified result of one mediation. Drives the ack/nack decision:
/// Success and ErrorConfig ack; everything else nacks for redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediationResult {
    Success,
    /// Target is misconfigured (most 4xx, 501). Terminal: ack so the
    /// queue does not wedge on a permanently broken endpoint.
    ErrorConfig,
    /// Target asked for a retry (400, 429, or 2xx with ack=false).
    ErrorProcess,
    /// Target failed server-side (5xx).
    ErrorServer,
    /// Transport failure: refused, DNS, timeout, or open circuit.
    ErrorConnection,
}

impl MediationResult {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MediationResult::ErrorProcess
                | MediationResult::ErrorServer
                | MediationResult::ErrorConnection
        )
    }

    /// Whether the result counts against the target's circuit breaker.
    /// ErrorConfig reached the target fine, so it counts as a success.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self,
            MediationResult::ErrorServer | MediationResult::ErrorConnection
        )
    }
}

/// Outcome of a mediation attempt: the classification plus the optional
/// retry delay and diagnostic detail.
#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub delay_seconds: Option<u32>,
    pub status_code: Option<u16>,
    pub detail: Option<String>,
}

impl MediationOutcome {
    pub fn success(status_code: u16) -> Self {
        Self {
            result: MediationResult::Success,
            delay_seconds: None,
            status_code: Some(status_code),
            detail: None,
        }
    }

    pub fn error_config(status_code: u16, detail: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorConfig,
            delay_seconds: None,
            status_code: Some(status_code),
            detail: Some(detail.into()),
        }
    }

    pub fn error_process(
        status_code: Option<u16>,
        delay_seconds: Option<u32>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            delay_seconds,
            status_code,
            detail: Some(detail.into()),
        }
    }

    pub fn error_server(status_code: u16, detail: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorServer,
            delay_seconds: None,
            status_code: Some(status_code),
            detail: Some(detail.into()),
        }
    }

    pub fn error_connection(detail: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorConnection,
            delay_seconds: None,
            status_code: None,
            detail: Some(detail.into()),
        }
    }
}

// ============================================================================
// Warning System Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum WarningCategory {
    Routing,
    Processing,
    Configuration,
    RateLimiting,
    QueueConnectivity,
    PoolCapacity,
    Election,
    Traffic,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

// ============================================================================
// Health & Stats Types
// ============================================================================

/// Probe-level health. The instance is DOWN when Redis is unavailable
/// while standby is enabled, a pool channel stays full past the
/// threshold, or too many circuit breakers are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

/// One named health check inside the aggregated report.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthCheck {
    pub name: String,
    pub healthy: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub active_warnings: u32,
    pub critical_warnings: u32,
}

/// Read-only snapshot of one pool's gauges and counters.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub pool_code: String,
    pub concurrency: u32,
    pub active_workers: u32,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rate_limited: u64,
    /// Exponentially weighted moving average of processing time.
    pub avg_processing_ms: f64,
}

/// Read-only snapshot of one queue consumer's counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_identifier: String,
    /// Approximate messages visible at the broker.
    pub pending: u64,
    /// Approximate messages hidden at the broker (in flight there).
    pub in_flight_at_broker: u64,
    pub total_polled: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_wire_format_is_camel_case() {
        let json = r#"{
            "id": "01HZX4",
            "poolCode": "P1",
            "mediationTarget": "https://example.test/hook",
            "authToken": "tok"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.pool_code, "P1");
        assert_eq!(msg.mediation_target, "https://example.test/hook");
        assert_eq!(msg.auth_token.as_deref(), Some("tok"));
        assert_eq!(msg.timeout_seconds, None);
    }

    #[test]
    fn message_timeout_override_parses() {
        let json = r#"{"id":"a","poolCode":"P","mediationTarget":"t","authToken":null,"timeoutSeconds":90}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.timeout_seconds, Some(90));
    }

    #[test]
    fn retryable_classification() {
        assert!(!MediationResult::Success.is_retryable());
        assert!(!MediationResult::ErrorConfig.is_retryable());
        assert!(MediationResult::ErrorProcess.is_retryable());
        assert!(MediationResult::ErrorServer.is_retryable());
        assert!(MediationResult::ErrorConnection.is_retryable());
    }

    #[test]
    fn breaker_failure_classification() {
        assert!(MediationResult::ErrorServer.is_breaker_failure());
        assert!(MediationResult::ErrorConnection.is_breaker_failure());
        assert!(!MediationResult::ErrorConfig.is_breaker_failure());
        assert!(!MediationResult::ErrorProcess.is_breaker_failure());
        assert!(!MediationResult::Success.is_breaker_failure());
    }

    #[test]
    fn pool_config_default_capacity() {
        let toml_free: PoolConfig =
            serde_json::from_str(r#"{"code":"P","concurrency":4,"rate_limit_per_minute":null}"#)
                .unwrap();
        assert_eq!(toml_free.queue_capacity, 100);
    }
}
