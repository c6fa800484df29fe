//! HttpMediator tests: response classification, retries, bounded body
//! reads, and circuit breaker integration.

use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_common::{MediationResult, Message};
use relay_router::{BreakerConfig, BreakerRegistry, HttpMediator, HttpMediatorConfig, Mediator};

fn test_message(target: &str) -> Message {
    Message {
        id: "msg-1".to_string(),
        pool_code: "P1".to_string(),
        mediation_target: target.to_string(),
        auth_token: None,
        timeout_seconds: None,
    }
}

fn quick_config() -> HttpMediatorConfig {
    HttpMediatorConfig {
        max_retries: 1,
        base_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

fn mediator(config: HttpMediatorConfig) -> (HttpMediator, Arc<BreakerRegistry>) {
    let breakers = Arc::new(BreakerRegistry::default());
    (
        HttpMediator::with_config(config, Arc::clone(&breakers)),
        breakers,
    )
}

#[tokio::test]
async fn delivers_expected_payload_and_headers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("Content-Type", "application/json"))
        .and(header("Accept", "application/json"))
        .and(header("Authorization", "Bearer tok-123"))
        .and(body_json(serde_json::json!({"messageId": "msg-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .expect(1)
        .mount(&server)
        .await;

    let (mediator, _) = mediator(quick_config());
    let mut message = test_message(&format!("{}/hook", server.uri()));
    message.auth_token = Some("tok-123".to_string());

    let outcome = mediator.mediate(&message).await;
    assert_eq!(outcome.result, MediationResult::Success);
}

#[tokio::test]
async fn empty_body_counts_as_ack() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (mediator, _) = mediator(quick_config());
    let outcome = mediator.mediate(&test_message(&format!("{}/hook", server.uri()))).await;

    assert_eq!(outcome.result, MediationResult::Success);
}

#[tokio::test]
async fn ack_false_yields_process_error_with_delay() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"ack": false, "delaySeconds": 60})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (mediator, _) = mediator(quick_config());
    let outcome = mediator.mediate(&test_message(&format!("{}/hook", server.uri()))).await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert_eq!(outcome.delay_seconds, Some(60));
}

#[tokio::test]
async fn http_400_is_retryable_process_error() {
    let server = MockServer::start().await;

    // 400 is a retryable router-level outcome, so both attempts fire.
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(400))
        .expect(2)
        .mount(&server)
        .await;

    let config = HttpMediatorConfig {
        max_retries: 2,
        base_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    let (mediator, _) = mediator(config);
    let outcome = mediator.mediate(&test_message(&format!("{}/hook", server.uri()))).await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert_eq!(outcome.status_code, Some(400));
}

#[tokio::test]
async fn auth_and_missing_endpoints_are_config_errors() {
    for status in [401u16, 403, 404, 405, 422] {
        let server = MockServer::start().await;

        // Config errors return immediately, no retry.
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount(&server)
            .await;

        let config = HttpMediatorConfig {
            max_retries: 3,
            base_backoff: Duration::from_millis(10),
            ..Default::default()
        };
        let (mediator, _) = mediator(config);
        let outcome = mediator.mediate(&test_message(&format!("{}/hook", server.uri()))).await;

        assert_eq!(outcome.result, MediationResult::ErrorConfig, "status {}", status);
        assert_eq!(outcome.status_code, Some(status));
    }
}

#[tokio::test]
async fn http_429_honours_body_delay() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(
            ResponseTemplate::new(429).set_body_json(serde_json::json!({"delaySeconds": 7})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (mediator, _) = mediator(quick_config());
    let outcome = mediator.mediate(&test_message(&format!("{}/hook", server.uri()))).await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert_eq!(outcome.delay_seconds, Some(7));
}

#[tokio::test]
async fn http_429_without_body_defaults_to_five_seconds() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let (mediator, _) = mediator(quick_config());
    let outcome = mediator.mediate(&test_message(&format!("{}/hook", server.uri()))).await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert_eq!(outcome.delay_seconds, Some(5));
}

#[tokio::test]
async fn http_501_is_config_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(501))
        .expect(1)
        .mount(&server)
        .await;

    let (mediator, _) = mediator(quick_config());
    let outcome = mediator.mediate(&test_message(&format!("{}/hook", server.uri()))).await;

    assert_eq!(outcome.result, MediationResult::ErrorConfig);
    assert_eq!(outcome.status_code, Some(501));
}

#[tokio::test]
async fn http_500_is_server_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let (mediator, _) = mediator(quick_config());
    let outcome = mediator.mediate(&test_message(&format!("{}/hook", server.uri()))).await;

    assert_eq!(outcome.result, MediationResult::ErrorServer);
    assert_eq!(outcome.status_code, Some(500));
}

#[tokio::test]
async fn retries_server_error_then_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .expect(1)
        .mount(&server)
        .await;

    let config = HttpMediatorConfig {
        max_retries: 3,
        base_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    let (mediator, breakers) = mediator(config);
    let target = format!("{}/hook", server.uri());
    let outcome = mediator.mediate(&test_message(&target)).await;

    assert_eq!(outcome.result, MediationResult::Success);

    // Both attempts were observed by the breaker.
    let stats = breakers.stats(&target).unwrap();
    assert_eq!(stats.failed_calls, 1);
    assert_eq!(stats.successful_calls, 1);
}

#[tokio::test]
async fn exhausted_retries_return_last_outcome() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let config = HttpMediatorConfig {
        max_retries: 3,
        base_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    let (mediator, _) = mediator(config);
    let outcome = mediator.mediate(&test_message(&format!("{}/hook", server.uri()))).await;

    assert_eq!(outcome.result, MediationResult::ErrorServer);
    assert_eq!(outcome.status_code, Some(503));
}

#[tokio::test]
async fn connection_refused_is_connection_error() {
    let (mediator, _) = mediator(quick_config());
    let outcome = mediator
        .mediate(&test_message("http://127.0.0.1:59999/hook"))
        .await;

    assert_eq!(outcome.result, MediationResult::ErrorConnection);
    assert!(outcome.detail.is_some());
}

#[tokio::test]
async fn slow_response_times_out_as_connection_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let config = HttpMediatorConfig {
        timeout: Duration::from_millis(100),
        max_retries: 1,
        base_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    let (mediator, _) = mediator(config);
    let outcome = mediator.mediate(&test_message(&format!("{}/hook", server.uri()))).await;

    assert_eq!(outcome.result, MediationResult::ErrorConnection);
}

#[tokio::test]
async fn per_message_timeout_overrides_default() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    // Default timeout is 30s; the message asks for 1s.
    let (mediator, _) = mediator(quick_config());
    let mut message = test_message(&format!("{}/hook", server.uri()));
    message.timeout_seconds = Some(1);

    let outcome = mediator.mediate(&message).await;
    assert_eq!(outcome.result, MediationResult::ErrorConnection);
}

#[tokio::test]
async fn oversized_body_is_truncated_not_fatal() {
    let server = MockServer::start().await;

    // 100 KiB of garbage after the status line: the first 64 KiB parse
    // fails, which means ack=true on a 2xx.
    let big_body = "x".repeat(100 * 1024);
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string(big_body))
        .expect(1)
        .mount(&server)
        .await;

    let (mediator, _) = mediator(quick_config());
    let outcome = mediator.mediate(&test_message(&format!("{}/hook", server.uri()))).await;

    assert_eq!(outcome.result, MediationResult::Success);
}

#[tokio::test]
async fn open_breaker_short_circuits_without_calling_target() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
        window_size: 10,
        min_requests: 2,
        failure_ratio: 0.5,
        open_timeout: Duration::from_secs(60),
        success_threshold: 3,
    }));

    let target = format!("{}/hook", server.uri());
    breakers.observe(&target, MediationResult::ErrorServer);
    breakers.observe(&target, MediationResult::ErrorServer);

    let mediator = HttpMediator::with_config(quick_config(), Arc::clone(&breakers));
    let outcome = mediator.mediate(&test_message(&target)).await;

    assert_eq!(outcome.result, MediationResult::ErrorConnection);
    assert!(outcome.detail.as_ref().unwrap().contains("circuit open"));
}
