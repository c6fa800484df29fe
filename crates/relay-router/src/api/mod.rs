//! Monitoring HTTP API.
//!
//! Read-only JSON endpoints for probes, pool/queue/breaker stats,
//! warnings, and election/traffic state, plus a manual topology reload.
//! All endpoints stay available on STANDBY instances: observability is
//! global, only processing is gated.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::breaker::{BreakerRegistry, BreakerStats};
use crate::engine::DispatchEngine;
use crate::health::HealthService;
use crate::resolver::ConfigResolver;
use crate::warning::WarningStore;
use relay_common::{
    HealthCheck, HealthReport, HealthStatus, PoolStats, QueueStats, Warning, WarningCategory,
    WarningSeverity,
};
use relay_standby::{Election, Role};
use relay_traffic::TrafficManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub warnings: Arc<WarningStore>,
    pub health: Arc<HealthService>,
    pub breakers: Arc<BreakerRegistry>,
    pub resolver: Option<Arc<ConfigResolver>>,
    pub election: Option<Arc<Election>>,
    pub traffic: Option<Arc<TrafficManager>>,
    pub standby_enabled: bool,
    pub instance_id: String,
}

impl AppState {
    fn health_report(&self) -> HealthReport {
        let redis_available = self.election.as_ref().map(|e| e.redis_available());
        self.health.evaluate(
            &self.engine.pool_stats(),
            self.breakers.open_count(),
            redis_available,
        )
    }
}

#[derive(Serialize, ToSchema)]
pub struct ProbeResponse {
    /// UP or DOWN.
    pub status: String,
    pub version: String,
}

#[derive(Serialize, ToSchema)]
pub struct StandbyStatusResponse {
    #[serde(rename = "standbyEnabled")]
    pub standby_enabled: bool,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    pub role: String,
    #[serde(rename = "redisAvailable")]
    pub redis_available: bool,
    #[serde(rename = "currentLockHolder")]
    pub current_lock_holder: Option<String>,
    #[serde(rename = "lastSuccessfulRefresh")]
    pub last_successful_refresh: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct TrafficStatusResponse {
    pub enabled: bool,
    #[serde(rename = "strategyType")]
    pub strategy_type: String,
    pub registered: bool,
    #[serde(rename = "targetInfo")]
    pub target_info: Option<String>,
    #[serde(rename = "lastOperation")]
    pub last_operation: Option<String>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct InFlightMessageResponse {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "poolCode")]
    pub pool_code: String,
    #[serde(rename = "sourceQueue")]
    pub source_queue: String,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
}

#[derive(Deserialize, Default, ToSchema)]
pub struct WarningsQuery {
    /// INFO, WARN, ERROR, or CRITICAL.
    pub severity: Option<String>,
    /// Routing, Processing, Configuration, ...
    pub category: Option<String>,
    pub acknowledged: Option<bool>,
}

#[derive(Deserialize, Default, ToSchema)]
pub struct ClearWarningsQuery {
    pub older_than_hours: Option<i64>,
}

#[derive(Deserialize, Default, ToSchema)]
pub struct InFlightQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize, ToSchema)]
pub struct ReloadResponse {
    pub success: bool,
    pub changed: bool,
    pub error: Option<String>,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Relay Message Router API",
        version = "0.1.0",
        description = "Monitoring and operations endpoints for the Relay message router"
    ),
    paths(
        health_handler,
        liveness_probe,
        readiness_probe,
        monitoring_health,
        queue_stats_handler,
        pool_stats_handler,
        circuit_breakers_handler,
        reset_circuit_breaker,
        reset_all_circuit_breakers,
        list_warnings,
        acknowledge_warning,
        acknowledge_all_warnings,
        clear_warnings,
        standby_status,
        traffic_status,
        in_flight_handler,
        reload_topology,
    ),
    components(schemas(
        ProbeResponse,
        StandbyStatusResponse,
        TrafficStatusResponse,
        InFlightMessageResponse,
        ReloadResponse,
        HealthReport,
        HealthStatus,
        HealthCheck,
        PoolStats,
        QueueStats,
        Warning,
        WarningCategory,
        WarningSeverity,
        BreakerStats,
    )),
    tags(
        (name = "health", description = "Probes"),
        (name = "monitoring", description = "Stats and state snapshots"),
        (name = "warnings", description = "Warning management"),
    )
)]
pub struct ApiDoc;

/// Build the monitoring router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/monitoring/health", get(monitoring_health))
        .route("/monitoring/queue-stats", get(queue_stats_handler))
        .route("/monitoring/pool-stats", get(pool_stats_handler))
        .route("/monitoring/circuit-breakers", get(circuit_breakers_handler))
        .route(
            "/monitoring/circuit-breakers/:name/reset",
            post(reset_circuit_breaker),
        )
        .route(
            "/monitoring/circuit-breakers/reset-all",
            post(reset_all_circuit_breakers),
        )
        .route(
            "/monitoring/warnings",
            get(list_warnings).delete(clear_warnings),
        )
        .route(
            "/monitoring/warnings/:id/acknowledge",
            post(acknowledge_warning),
        )
        .route(
            "/monitoring/warnings/acknowledge-all",
            post(acknowledge_all_warnings),
        )
        .route("/monitoring/standby-status", get(standby_status))
        .route("/monitoring/traffic-status", get(traffic_status))
        .route("/monitoring/in-flight", get(in_flight_handler))
        .route("/config/reload", post(reload_topology))
        .with_state(state)
}

// ============================================================================
// Probes
// ============================================================================

/// Binary health probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Instance is UP", body = ProbeResponse),
        (status = 503, description = "Instance is DOWN", body = ProbeResponse)
    )
)]
async fn health_handler(State(state): State<AppState>) -> Response {
    let report = state.health_report();

    let (code, label) = match report.status {
        HealthStatus::Up => (StatusCode::OK, "UP"),
        HealthStatus::Down => (StatusCode::SERVICE_UNAVAILABLE, "DOWN"),
    };

    (
        code,
        Json(ProbeResponse {
            status: label.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
        .into_response()
}

/// Liveness probe: the process is running.
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses((status = 200, description = "Live", body = ProbeResponse))
)]
async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "LIVE".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe: same checks as /health.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Ready", body = ProbeResponse),
        (status = 503, description = "Not ready", body = ProbeResponse)
    )
)]
async fn readiness_probe(State(state): State<AppState>) -> Response {
    health_handler(State(state)).await
}

// ============================================================================
// Monitoring
// ============================================================================

/// Aggregated health report.
#[utoipa::path(
    get,
    path = "/monitoring/health",
    tag = "monitoring",
    responses((status = 200, description = "Health report", body = HealthReport))
)]
async fn monitoring_health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health_report())
}

/// Per-queue counters.
#[utoipa::path(
    get,
    path = "/monitoring/queue-stats",
    tag = "monitoring",
    responses((status = 200, description = "Queue stats", body = Vec<QueueStats>))
)]
async fn queue_stats_handler(State(state): State<AppState>) -> Json<Vec<QueueStats>> {
    Json(state.engine.queue_stats().await)
}

/// Per-pool gauges and counters.
#[utoipa::path(
    get,
    path = "/monitoring/pool-stats",
    tag = "monitoring",
    responses((status = 200, description = "Pool stats", body = Vec<PoolStats>))
)]
async fn pool_stats_handler(State(state): State<AppState>) -> Json<Vec<PoolStats>> {
    Json(state.engine.pool_stats())
}

/// Per-target circuit breaker state.
#[utoipa::path(
    get,
    path = "/monitoring/circuit-breakers",
    tag = "monitoring",
    responses((status = 200, description = "Breaker stats", body = Vec<BreakerStats>))
)]
async fn circuit_breakers_handler(State(state): State<AppState>) -> Json<Vec<BreakerStats>> {
    Json(state.breakers.all_stats())
}

/// Reset one circuit breaker by (URL-encoded) target name.
#[utoipa::path(
    post,
    path = "/monitoring/circuit-breakers/{name}/reset",
    tag = "monitoring",
    params(("name" = String, Path, description = "Target URL, percent-encoded")),
    responses(
        (status = 200, description = "Breaker reset"),
        (status = 404, description = "No breaker for that target")
    )
)]
async fn reset_circuit_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let decoded = urlencoding::decode(&name).unwrap_or(std::borrow::Cow::Borrowed(&name));

    if state.breakers.reset(&decoded) {
        info!(target = %decoded, "Circuit breaker reset");
        (StatusCode::OK, Json(serde_json::json!({"status": "reset"}))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no breaker for target"})),
        )
            .into_response()
    }
}

/// Reset every circuit breaker.
#[utoipa::path(
    post,
    path = "/monitoring/circuit-breakers/reset-all",
    tag = "monitoring",
    responses((status = 200, description = "All breakers reset"))
)]
async fn reset_all_circuit_breakers(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.breakers.reset_all();
    info!("All circuit breakers reset");
    Json(serde_json::json!({"status": "reset"}))
}

/// Election state snapshot.
#[utoipa::path(
    get,
    path = "/monitoring/standby-status",
    tag = "monitoring",
    responses((status = 200, description = "Standby status", body = StandbyStatusResponse))
)]
async fn standby_status(State(state): State<AppState>) -> Json<StandbyStatusResponse> {
    match &state.election {
        Some(election) => {
            let lock_state = election.state();
            Json(StandbyStatusResponse {
                standby_enabled: true,
                instance_id: state.instance_id.clone(),
                role: role_label(lock_state.role).to_string(),
                redis_available: lock_state.redis_available,
                current_lock_holder: lock_state.lock_holder,
                last_successful_refresh: lock_state.last_refresh.map(|t| t.to_rfc3339()),
            })
        }
        None if state.standby_enabled => {
            // Standby is configured but the election never came up
            // (Redis unreachable at startup).
            Json(StandbyStatusResponse {
                standby_enabled: true,
                instance_id: state.instance_id.clone(),
                role: "UNKNOWN".to_string(),
                redis_available: false,
                current_lock_holder: None,
                last_successful_refresh: None,
            })
        }
        None => Json(StandbyStatusResponse {
            standby_enabled: false,
            instance_id: state.instance_id.clone(),
            role: "PRIMARY".to_string(),
            redis_available: false,
            current_lock_holder: Some(state.instance_id.clone()),
            last_successful_refresh: None,
        }),
    }
}

/// Traffic registrar snapshot.
#[utoipa::path(
    get,
    path = "/monitoring/traffic-status",
    tag = "monitoring",
    responses((status = 200, description = "Traffic status", body = TrafficStatusResponse))
)]
async fn traffic_status(State(state): State<AppState>) -> Json<TrafficStatusResponse> {
    match &state.traffic {
        Some(traffic) => {
            let status = traffic.status();
            Json(TrafficStatusResponse {
                enabled: status.enabled,
                strategy_type: status.strategy_type,
                registered: status.registered,
                target_info: status.target_info,
                last_operation: status.last_operation.map(|t| t.to_rfc3339()),
                last_error: status.last_error,
            })
        }
        None => Json(TrafficStatusResponse {
            enabled: false,
            strategy_type: "NONE".to_string(),
            registered: true,
            target_info: None,
            last_operation: None,
            last_error: None,
        }),
    }
}

/// Messages admitted but not yet finalised, oldest first.
#[utoipa::path(
    get,
    path = "/monitoring/in-flight",
    tag = "monitoring",
    params(("limit" = Option<usize>, Query, description = "Max entries, default 100")),
    responses((status = 200, description = "In-flight messages", body = Vec<InFlightMessageResponse>))
)]
async fn in_flight_handler(
    State(state): State<AppState>,
    Query(query): Query<InFlightQuery>,
) -> Json<Vec<InFlightMessageResponse>> {
    let entries = state.engine.in_flight_snapshot(query.limit.unwrap_or(100));
    Json(
        entries
            .into_iter()
            .map(|e| InFlightMessageResponse {
                elapsed_ms: e.elapsed_ms(),
                message_id: e.message_id,
                pool_code: e.pool_code,
                source_queue: e.source_queue,
            })
            .collect(),
    )
}

// ============================================================================
// Warnings
// ============================================================================

/// List warnings with optional filters.
#[utoipa::path(
    get,
    path = "/monitoring/warnings",
    tag = "warnings",
    responses((status = 200, description = "Warnings", body = Vec<Warning>))
)]
async fn list_warnings(
    State(state): State<AppState>,
    Query(query): Query<WarningsQuery>,
) -> Json<Vec<Warning>> {
    let mut warnings = state.warnings.all();

    if let Some(severity) = query.severity.as_deref().and_then(parse_severity) {
        warnings.retain(|w| w.severity == severity);
    }
    if let Some(ref category) = query.category {
        warnings.retain(|w| format!("{:?}", w.category).eq_ignore_ascii_case(category));
    }
    if let Some(acknowledged) = query.acknowledged {
        warnings.retain(|w| w.acknowledged == acknowledged);
    }

    warnings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(warnings)
}

/// Acknowledge one warning.
#[utoipa::path(
    post,
    path = "/monitoring/warnings/{id}/acknowledge",
    tag = "warnings",
    params(("id" = String, Path, description = "Warning id")),
    responses(
        (status = 200, description = "Acknowledged"),
        (status = 404, description = "Unknown warning id")
    )
)]
async fn acknowledge_warning(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.warnings.acknowledge(&id) {
        (StatusCode::OK, Json(serde_json::json!({"acknowledged": id}))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown warning id"})),
        )
            .into_response()
    }
}

/// Acknowledge every warning.
#[utoipa::path(
    post,
    path = "/monitoring/warnings/acknowledge-all",
    tag = "warnings",
    responses((status = 200, description = "Count acknowledged"))
)]
async fn acknowledge_all_warnings(State(state): State<AppState>) -> Json<serde_json::Value> {
    let count = state.warnings.acknowledge_all();
    Json(serde_json::json!({"acknowledged": count}))
}

/// Clear warnings, optionally only those older than a threshold.
#[utoipa::path(
    delete,
    path = "/monitoring/warnings",
    tag = "warnings",
    params(("older_than_hours" = Option<i64>, Query, description = "Only clear older entries")),
    responses((status = 200, description = "Count removed"))
)]
async fn clear_warnings(
    State(state): State<AppState>,
    Query(query): Query<ClearWarningsQuery>,
) -> Json<serde_json::Value> {
    let removed = match query.older_than_hours {
        Some(hours) => state.warnings.clear_older_than(hours),
        None => state.warnings.clear(),
    };
    Json(serde_json::json!({"removed": removed}))
}

// ============================================================================
// Configuration
// ============================================================================

/// Trigger a topology refresh outside the schedule.
#[utoipa::path(
    post,
    path = "/config/reload",
    tag = "monitoring",
    responses(
        (status = 200, description = "Refresh outcome", body = ReloadResponse),
        (status = 503, description = "No resolver configured", body = ReloadResponse)
    )
)]
async fn reload_topology(State(state): State<AppState>) -> Response {
    let Some(resolver) = &state.resolver else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReloadResponse {
                success: false,
                changed: false,
                error: Some("no topology resolver configured".to_string()),
            }),
        )
            .into_response();
    };

    match resolver.refresh().await {
        Ok(changed) => (
            StatusCode::OK,
            Json(ReloadResponse {
                success: true,
                changed,
                error: None,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ReloadResponse {
                success: false,
                changed: false,
                error: Some(e.to_string()),
            }),
        )
            .into_response(),
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Primary => "PRIMARY",
        Role::Standby => "STANDBY",
        Role::Unknown => "UNKNOWN",
    }
}

fn parse_severity(raw: &str) -> Option<WarningSeverity> {
    match raw.to_uppercase().as_str() {
        "INFO" => Some(WarningSeverity::Info),
        "WARN" | "WARNING" => Some(WarningSeverity::Warn),
        "ERROR" => Some(WarningSeverity::Error),
        "CRITICAL" => Some(WarningSeverity::Critical),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parsing() {
        assert_eq!(parse_severity("critical"), Some(WarningSeverity::Critical));
        assert_eq!(parse_severity("WARN"), Some(WarningSeverity::Warn));
        assert_eq!(parse_severity("warning"), Some(WarningSeverity::Warn));
        assert_eq!(parse_severity("bogus"), None);
    }

    #[test]
    fn role_labels() {
        assert_eq!(role_label(Role::Primary), "PRIMARY");
        assert_eq!(role_label(Role::Standby), "STANDBY");
        assert_eq!(role_label(Role::Unknown), "UNKNOWN");
    }
}
