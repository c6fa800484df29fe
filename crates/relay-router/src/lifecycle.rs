//! Per-message lifecycle.
//!
//! Runs inside a pool worker after admission: circuit gate, rate-limit
//! acquisition, mediation, then finalisation against the source queue.
//! The ack/nack decision is a pure function of the outcome class:
//! Success and ErrorConfig ack, everything else nacks.

use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::counters::PoolCounters;
use crate::limiter::{Acquire, PoolRateLimiter};
use crate::pool::{DispatchJob, PoolContext};
use crate::telemetry;
use relay_common::{MediationOutcome, MediationResult, WarningCategory, WarningSeverity};

fn outcome_label(result: MediationResult) -> &'static str {
    match result {
        MediationResult::Success => "success",
        MediationResult::ErrorConfig => "error_config",
        MediationResult::ErrorProcess => "error_process",
        MediationResult::ErrorServer => "error_server",
        MediationResult::ErrorConnection => "error_connection",
    }
}

/// Process one admitted message to completion.
pub async fn process(
    ctx: &PoolContext,
    limiter: &PoolRateLimiter,
    counters: &PoolCounters,
    pool_code: &str,
    job: DispatchJob,
    shutdown: &watch::Receiver<bool>,
) {
    let DispatchJob { pointer, consumer } = job;
    let message = &pointer.message;
    let target = &message.mediation_target;
    let started = Instant::now();

    let outcome = if !ctx.breakers.allow_request(target) {
        debug!(message_id = %message.id, target = %target, "Circuit open, skipping mediation");
        MediationOutcome::error_connection("circuit open for target")
    } else {
        match limiter.acquire(shutdown).await {
            Acquire::Shutdown => {
                // Shutting down before mediation started: leave the
                // message unacked so the broker redelivers it.
                ctx.in_flight.remove(&message.id);
                return;
            }
            Acquire::GrantedAfterWait => {
                counters.record_rate_limited();
                telemetry::record_rate_limited(pool_code);
                ctx.mediator.mediate(message).await
            }
            Acquire::Granted => ctx.mediator.mediate(message).await,
        }
    };

    let duration = started.elapsed();

    let finalisation = match outcome.result {
        MediationResult::Success => {
            debug!(
                message_id = %message.id,
                duration_ms = duration.as_millis() as u64,
                "Message processed"
            );
            consumer.ack(&pointer.receipt).await
        }
        MediationResult::ErrorConfig => {
            // Acked: retrying a misconfigured target would wedge the
            // queue. The mediator already raised the warning.
            warn!(
                message_id = %message.id,
                target = %target,
                status = ?outcome.status_code,
                detail = ?outcome.detail,
                "Configuration error, acking without retry"
            );
            consumer.ack(&pointer.receipt).await
        }
        MediationResult::ErrorProcess => {
            warn!(
                message_id = %message.id,
                delay_seconds = ?outcome.delay_seconds,
                detail = ?outcome.detail,
                "Processing error, nacking for retry"
            );
            consumer.nack(&pointer.receipt, outcome.delay_seconds).await
        }
        MediationResult::ErrorServer | MediationResult::ErrorConnection => {
            warn!(
                message_id = %message.id,
                target = %target,
                result = ?outcome.result,
                detail = ?outcome.detail,
                "Delivery failed, nacking for retry"
            );
            consumer.nack(&pointer.receipt, None).await
        }
    };

    if let Err(e) = finalisation {
        // Typically an expired receipt after slow processing: the
        // broker will redeliver on its own, so drop silently beyond
        // the warning.
        warn!(
            message_id = %message.id,
            queue = %pointer.source_queue,
            error = %e,
            "Finalisation failed, leaving message to broker redelivery"
        );
        ctx.warnings.add(
            WarningCategory::Processing,
            WarningSeverity::Warn,
            format!(
                "Finalisation failed for message {} on queue {}: {}",
                message.id, pointer.source_queue, e
            ),
            "Lifecycle".to_string(),
        );
    }

    ctx.in_flight.remove(&message.id);
    counters.record_outcome(outcome.result, duration.as_millis() as u64);
    telemetry::record_message_processed(pool_code, outcome_label(outcome.result));
    telemetry::record_mediation_latency(pool_code, duration);
}
