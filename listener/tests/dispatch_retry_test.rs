//! Integration tests for webhook delivery and retry behavior.
//!
//! These tests drive the dispatcher against a mock HTTP server and verify
//! the retry policy: transient failures back off and retry, permanent
//! rejections stop immediately, rate limits honor Retry-After, and one
//! failing endpoint never blocks deliveries to the others.

use std::time::{Duration, Instant};

use serde_json::{json, Value};
use switchboard_listener::dispatch::{DispatchError, Dispatcher, RetryPolicy};
use switchboard_listener::events::{Event, RawEvent};
use switchboard_listener::rules::Rule;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Test Helpers
// =============================================================================

/// Creates an event of the given kind from a raw JSON payload.
fn make_event(kind: &str, data: Value) -> Event {
    let raw = RawEvent {
        kind: kind.to_string(),
        data: data.as_object().cloned().unwrap_or_default(),
    };
    Event::from_raw(raw)
}

/// Creates an enabled match-all rule pointing at `url`.
fn make_rule(name: &str, url: &str) -> Rule {
    Rule {
        name: name.to_string(),
        webhook_url: url.to_string(),
        enabled: true,
        event_type: None,
        scope_type: None,
        scope_id: None,
    }
}

/// Creates a dispatcher with millisecond retry delays.
fn test_dispatcher() -> Dispatcher {
    Dispatcher::new(RetryPolicy::fast_for_tests())
}

// =============================================================================
// Delivery Tests
// =============================================================================

/// Verifies the delivery payload carries the event kind, rule name, summary,
/// scope ids, and the verbatim platform payload under `data`.
#[tokio::test]
async fn first_try_delivery_posts_the_full_payload() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({
            "event_type": "message",
            "rule": "primary",
            "summary": "alice: hi",
            "guild_id": "123",
            "channel_id": "456",
            "data": {
                "author": "alice",
                "content": "hi",
            },
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let event = make_event(
        "message",
        json!({
            "author": "alice",
            "content": "hi",
            "guild_id": "123",
            "channel_id": "456",
        }),
    );
    let rule = make_rule("primary", &format!("{}/hook", mock_server.uri()));

    let outcome = test_dispatcher().dispatch(&event, &rule).await;

    assert!(outcome.delivered());
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.rule, "primary");
}

/// A 204 response (common for webhook endpoints) counts as delivered.
#[tokio::test]
async fn no_content_response_counts_as_delivered() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let event = make_event("message", json!({}));
    let rule = make_rule("primary", &mock_server.uri());

    let outcome = test_dispatcher().dispatch(&event, &rule).await;

    assert!(outcome.delivered());
}

// =============================================================================
// Retry Tests
// =============================================================================

/// Two server errors followed by a success: the delivery recovers and uses
/// exactly three attempts.
#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let mock_server = MockServer::start().await;

    // First two attempts fail with 500.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&mock_server)
        .await;

    // Third attempt succeeds.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let event = make_event("message", json!({"content": "retry me"}));
    let rule = make_rule("retrying", &mock_server.uri());

    let outcome = test_dispatcher().dispatch(&event, &rule).await;

    assert!(outcome.delivered());
    assert_eq!(outcome.attempts, 3);
}

/// A persistently failing endpoint exhausts the attempt budget and reports
/// the final server error; no further requests are made.
#[tokio::test]
async fn exhausted_retries_report_the_server_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let event = make_event("message", json!({}));
    let rule = make_rule("doomed", &mock_server.uri());

    let outcome = test_dispatcher().dispatch(&event, &rule).await;

    assert!(!outcome.delivered());
    assert_eq!(outcome.attempts, 3);
    assert!(matches!(
        outcome.result,
        Err(DispatchError::ServerError {
            status: 503,
            attempts: 3
        })
    ));
}

/// Client errors other than 429 are permanent: one request, no retries.
#[tokio::test]
async fn client_rejection_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such hook"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let event = make_event("message", json!({}));
    let rule = make_rule("gone", &mock_server.uri());

    let outcome = test_dispatcher().dispatch(&event, &rule).await;

    assert!(!outcome.delivered());
    assert_eq!(outcome.attempts, 1);
    assert!(matches!(
        outcome.result,
        Err(DispatchError::Rejected { status: 404, .. })
    ));
}

/// A 429 with a seconds-form Retry-After header delays the retry by at least
/// that long instead of using the backoff schedule.
#[tokio::test]
async fn rate_limit_honors_retry_after() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429).insert_header("retry-after", "1"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let event = make_event("message", json!({}));
    let rule = make_rule("limited", &mock_server.uri());

    let started = Instant::now();
    let outcome = test_dispatcher().dispatch(&event, &rule).await;

    assert!(outcome.delivered());
    assert_eq!(outcome.attempts, 2);
    // The fast test policy would have retried after ~10ms; a 1s wait proves
    // the header won.
    assert!(started.elapsed() >= Duration::from_secs(1));
}

/// A 429 whose Retry-After is not a seconds value falls back to the backoff
/// schedule instead of stalling or failing the delivery.
#[tokio::test]
async fn unparseable_retry_after_falls_back_to_backoff() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "soon"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let event = make_event("message", json!({}));
    let rule = make_rule("limited", &mock_server.uri());

    let started = Instant::now();
    let outcome = test_dispatcher().dispatch(&event, &rule).await;

    assert!(outcome.delivered());
    assert_eq!(outcome.attempts, 2);
    // Backoff retries within tens of milliseconds; a header taken at face
    // value would not return this quickly.
    assert!(started.elapsed() < Duration::from_millis(500));
}

/// Connection failures are transient: retried up to the budget, then
/// reported as exhausted.
#[tokio::test]
async fn connection_failures_exhaust_the_attempt_budget() {
    // Nothing listens here; connections are refused immediately.
    let event = make_event("message", json!({}));
    let rule = make_rule("unreachable", "http://127.0.0.1:9/hook");

    let outcome = test_dispatcher().dispatch(&event, &rule).await;

    assert!(!outcome.delivered());
    assert_eq!(outcome.attempts, 3);
    assert!(matches!(
        outcome.result,
        Err(DispatchError::MaxRetriesExceeded { attempts: 3 })
    ));
}

// =============================================================================
// Isolation Tests
// =============================================================================

/// One failing endpoint must not block or fail the sibling delivery of the
/// same event.
#[tokio::test]
async fn failing_endpoint_does_not_block_siblings() {
    let healthy = MockServer::start().await;
    let broken = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&healthy)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&broken)
        .await;

    let event = make_event("message", json!({"content": "fan out"}));
    let good_rule = make_rule("healthy", &healthy.uri());
    let bad_rule = make_rule("broken", &broken.uri());

    let outcomes = test_dispatcher()
        .dispatch_all(&event, &[&bad_rule, &good_rule])
        .await;

    assert_eq!(outcomes.len(), 2);
    let healthy_outcome = outcomes.iter().find(|o| o.rule == "healthy").unwrap();
    let broken_outcome = outcomes.iter().find(|o| o.rule == "broken").unwrap();
    assert!(healthy_outcome.delivered());
    assert!(!broken_outcome.delivered());
}

/// Every matching rule receives its own delivery of the same event.
#[tokio::test]
async fn fan_out_covers_every_matching_rule() {
    let mock_server = MockServer::start().await;

    for hook in ["/a", "/b", "/c"] {
        Mock::given(method("POST"))
            .and(path(hook))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    let event = make_event("member_join", json!({"member": "bob", "guild": "Acme"}));
    let rules: Vec<Rule> = ["a", "b", "c"]
        .iter()
        .map(|name| make_rule(name, &format!("{}/{name}", mock_server.uri())))
        .collect();
    let refs: Vec<&Rule> = rules.iter().collect();

    let outcomes = test_dispatcher().dispatch_all(&event, &refs).await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.delivered()));
}

/// The fan-out future must stay usable from a spawned task, which is how the
/// intake loop runs it: the task owns the event and rules and the combined
/// future has to be `Send + 'static`.
#[tokio::test]
async fn fan_out_runs_inside_a_spawned_task() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&mock_server)
        .await;

    let event = make_event("message", json!({"content": "spawned"}));
    let rules = vec![
        make_rule("one", &mock_server.uri()),
        make_rule("two", &mock_server.uri()),
    ];

    let outcomes = tokio::spawn(async move {
        let refs: Vec<&Rule> = rules.iter().collect();
        test_dispatcher().dispatch_all(&event, &refs).await
    })
    .await
    .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.delivered()));
}

// =============================================================================
// Probe Tests
// =============================================================================

/// The test-webhook probe succeeds against a healthy endpoint.
#[tokio::test]
async fn probe_accepts_a_healthy_endpoint() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"event_type": "test"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let result = test_dispatcher().send_test(&mock_server.uri()).await;

    assert!(result.is_ok());
}

/// The probe reports a rejection without retrying.
#[tokio::test]
async fn probe_reports_a_rejecting_endpoint() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let result = test_dispatcher().send_test(&mock_server.uri()).await;

    assert!(matches!(
        result,
        Err(DispatchError::Rejected { status: 403, .. })
    ));
}
