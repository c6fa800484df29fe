//! HTTP mediation.
//!
//! POSTs `{"messageId":"<id>"}` to the message's mediation target and
//! classifies the response into a [`MediationOutcome`]:
//!
//! - 2xx with `ack:true` (or no/invalid body) is Success
//! - 2xx with `ack:false` is ErrorProcess, honouring `delaySeconds`
//! - 400 and 429 are ErrorProcess (429 takes `delaySeconds`, default 5)
//! - 501 and the remaining 4xx are ErrorConfig
//! - 5xx is ErrorServer
//! - transport failures and timeouts are ErrorConnection
//!
//! Retryable outcomes are retried internally with linear backoff; every
//! attempt is observed by the target's circuit breaker.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::breaker::BreakerRegistry;
use crate::warning::WarningStore;
use relay_common::{MediationOutcome, MediationResult, Message, WarningCategory, WarningSeverity};

/// Response bodies are read up to this many bytes; the rest is discarded.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Default retry delay for 429 responses without a `delaySeconds` body.
const DEFAULT_THROTTLE_DELAY_SECONDS: u32 = 5;

/// Trait for message mediation. One HTTP implementation; other
/// transports slot in behind the same contract.
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn mediate(&self, message: &Message) -> MediationOutcome;
}

/// Request payload sent to the mediation target.
#[derive(Debug, Serialize)]
struct MediationPayload<'a> {
    #[serde(rename = "messageId")]
    message_id: &'a str,
}

/// Expected 2xx response body. Absent or invalid bodies mean `ack=true`.
#[derive(Debug, Deserialize, Default)]
struct MediationResponse {
    #[serde(default = "default_ack")]
    ack: bool,
    #[serde(rename = "delaySeconds")]
    delay_seconds: Option<u32>,
}

fn default_ack() -> bool {
    true
}

/// Body of a 429 response.
#[derive(Debug, Deserialize, Default)]
struct ThrottleResponse {
    #[serde(rename = "delaySeconds")]
    delay_seconds: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    /// Default request timeout; messages may override per call.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Total attempts for retryable outcomes.
    pub max_retries: u32,
    /// Linear backoff base: attempt N sleeps N * base_backoff.
    pub base_backoff: Duration,
    /// Negotiate HTTP/2 via ALPN; false forces HTTP/1.1.
    pub http2: bool,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            http2: true,
        }
    }
}

pub struct HttpMediator {
    client: Client,
    config: HttpMediatorConfig,
    breakers: Arc<BreakerRegistry>,
    warnings: Option<Arc<WarningStore>>,
}

impl HttpMediator {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self::with_config(HttpMediatorConfig::default(), breakers)
    }

    pub fn with_config(config: HttpMediatorConfig, breakers: Arc<BreakerRegistry>) -> Self {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10);

        if !config.http2 {
            builder = builder.http1_only();
        }

        let client = builder.build().expect("failed to build HTTP client");

        info!(
            timeout_secs = config.timeout.as_secs(),
            max_retries = config.max_retries,
            http2 = config.http2,
            "HttpMediator initialized"
        );

        Self {
            client,
            config,
            breakers,
            warnings: None,
        }
    }

    pub fn with_warning_store(mut self, warnings: Arc<WarningStore>) -> Self {
        self.warnings = Some(warnings);
        self
    }

    fn warn_config(&self, message_id: &str, target: &str, status: u16, description: &str) {
        if let Some(ref warnings) = self.warnings {
            let severity = if status == 501 {
                WarningSeverity::Critical
            } else {
                WarningSeverity::Error
            };
            warnings.add(
                WarningCategory::Configuration,
                severity,
                format!(
                    "HTTP {} {} for message {}: target {}",
                    status, description, message_id, target
                ),
                "HttpMediator".to_string(),
            );
        }
    }

    async fn mediate_once(&self, message: &Message) -> MediationOutcome {
        let target = &message.mediation_target;

        if !self.breakers.allow_request(target) {
            debug!(message_id = %message.id, target = %target, "Circuit open, rejecting mediation");
            return MediationOutcome::error_connection("circuit open for target");
        }

        let payload = MediationPayload {
            message_id: &message.id,
        };

        let timeout = message
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.timeout);

        let mut request = self
            .client
            .post(target)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&payload);

        if let Some(token) = &message.auth_token {
            request = request.bearer_auth(token);
        }

        let outcome = match request.send().await {
            Ok(response) => self.classify_response(message, response).await,
            Err(e) => {
                if e.is_timeout() {
                    warn!(message_id = %message.id, target = %target, "Mediation request timeout");
                    MediationOutcome::error_connection("request timeout")
                } else if e.is_connect() {
                    warn!(message_id = %message.id, target = %target, error = %e, "Connection error");
                    MediationOutcome::error_connection(format!("connection error: {}", e))
                } else {
                    warn!(message_id = %message.id, target = %target, error = %e, "Request failed");
                    MediationOutcome::error_connection(format!("request failed: {}", e))
                }
            }
        };

        self.breakers.observe(target, outcome.result);
        outcome
    }

    async fn classify_response(&self, message: &Message, response: Response) -> MediationOutcome {
        let status = response.status();
        let status_code = status.as_u16();

        if status.is_success() {
            let body = read_bounded_body(response).await;
            if let Ok(resp) = serde_json::from_str::<MediationResponse>(&body) {
                if !resp.ack {
                    debug!(
                        message_id = %message.id,
                        delay_seconds = ?resp.delay_seconds,
                        "Target returned ack=false"
                    );
                    return MediationOutcome::error_process(
                        Some(status_code),
                        resp.delay_seconds,
                        "target returned ack=false",
                    );
                }
            }

            info!(message_id = %message.id, status_code = status_code, "Message delivered");
            return MediationOutcome::success(status_code);
        }

        match status_code {
            400 => {
                warn!(message_id = %message.id, "Bad request from target, will retry");
                MediationOutcome::error_process(Some(400), None, "HTTP 400: bad request")
            }
            429 => {
                let body = read_bounded_body(response).await;
                let delay = serde_json::from_str::<ThrottleResponse>(&body)
                    .ok()
                    .and_then(|r| r.delay_seconds)
                    .unwrap_or(DEFAULT_THROTTLE_DELAY_SECONDS);

                warn!(
                    message_id = %message.id,
                    delay_seconds = delay,
                    "Target throttled the request"
                );
                MediationOutcome::error_process(
                    Some(429),
                    Some(delay),
                    "HTTP 429: too many requests",
                )
            }
            501 => {
                warn!(message_id = %message.id, "Target does not implement mediation");
                self.warn_config(
                    &message.id,
                    &message.mediation_target,
                    501,
                    "Not Implemented",
                );
                MediationOutcome::error_config(501, "HTTP 501: not implemented")
            }
            _ if status.is_client_error() => {
                let description = status.canonical_reason().unwrap_or("Client Error");
                warn!(message_id = %message.id, status_code = status_code, "Client error from target");
                self.warn_config(
                    &message.id,
                    &message.mediation_target,
                    status_code,
                    description,
                );
                MediationOutcome::error_config(
                    status_code,
                    format!("HTTP {}: {}", status_code, description),
                )
            }
            _ if status.is_server_error() => {
                warn!(message_id = %message.id, status_code = status_code, "Server error from target");
                MediationOutcome::error_server(
                    status_code,
                    format!("HTTP {}: server error", status_code),
                )
            }
            _ => {
                warn!(message_id = %message.id, status_code = status_code, "Unexpected status from target");
                MediationOutcome::error_process(
                    Some(status_code),
                    None,
                    format!("HTTP {}: unexpected status", status_code),
                )
            }
        }
    }
}

/// Read at most [`MAX_RESPONSE_BYTES`] of the body; the remainder is
/// discarded without being buffered.
async fn read_bounded_body(mut response: Response) -> String {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);

    while let Ok(Some(chunk)) = response.chunk().await {
        let remaining = MAX_RESPONSE_BYTES - buf.len();
        if chunk.len() >= remaining {
            buf.extend_from_slice(&chunk[..remaining]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }

    String::from_utf8_lossy(&buf).into_owned()
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn mediate(&self, message: &Message) -> MediationOutcome {
        let mut attempts = 0u32;

        loop {
            let outcome = self.mediate_once(message).await;

            if !outcome.result.is_retryable() {
                return outcome;
            }

            attempts += 1;
            if attempts >= self.config.max_retries.max(1) {
                return outcome;
            }

            let delay = self.config.base_backoff * attempts;
            debug!(
                message_id = %message.id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                result = ?outcome.result,
                "Retrying mediation"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_body_defaults_to_ack() {
        let parsed: MediationResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.ack);
        assert_eq!(parsed.delay_seconds, None);

        let parsed: MediationResponse =
            serde_json::from_str(r#"{"ack":false,"delaySeconds":12}"#).unwrap();
        assert!(!parsed.ack);
        assert_eq!(parsed.delay_seconds, Some(12));
    }
}
