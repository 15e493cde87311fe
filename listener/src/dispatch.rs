//! Webhook dispatcher for the Switchboard listener.
//!
//! This module delivers matched events to their webhook endpoints with:
//!
//! - Connection pooling via reqwest
//! - A bounded per-request timeout (10s)
//! - Exponential backoff retry for transient failures (timeout, connect
//!   error, 5xx), capped at 3 attempts with ±25% jitter
//! - Rate limit handling (429 with Retry-After header)
//! - Per-webhook isolation: one endpoint's failure never affects delivery to
//!   the other webhooks matched by the same event
//!
//! Outcomes are recorded, not propagated — a failed delivery is logged and
//! returned as data so the intake loop keeps flowing.
//!
//! # Example
//!
//! ```no_run
//! use switchboard_listener::dispatch::{Dispatcher, RetryPolicy};
//! use switchboard_listener::events::{Event, RawEvent};
//! use switchboard_listener::rules::{Rule, RuleSet};
//!
//! #[tokio::main]
//! async fn main() {
//!     let dispatcher = Dispatcher::new(RetryPolicy::default());
//!     let rules = RuleSet::new(vec![Rule {
//!         name: "everything".to_string(),
//!         webhook_url: "https://example.com/hooks/a".to_string(),
//!         enabled: true,
//!         event_type: None,
//!         scope_type: None,
//!         scope_id: None,
//!     }]);
//!
//!     let raw: RawEvent =
//!         serde_json::from_str(r#"{"type": "message", "data": {}}"#).unwrap();
//!     let event = Event::from_raw(raw);
//!
//!     let outcomes = dispatcher.dispatch_all(&event, &rules.matching(&event)).await;
//!     for outcome in outcomes {
//!         println!("{} delivered={}", outcome.rule, outcome.delivered());
//!     }
//! }
//! ```

use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::events::Event;
use crate::rules::Rule;

/// HTTP request timeout per delivery attempt.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Initial retry delay in seconds.
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Maximum retry delay in seconds.
const MAX_RETRY_DELAY_SECS: u64 = 30;

/// Jitter factor (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// Attempts per delivery before recording failure.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Upper bound honored from a Retry-After header; anything larger falls back
/// to the backoff schedule.
const RETRY_AFTER_CAP_SECS: u64 = 60;

/// Simultaneous webhook calls per event.
const DEFAULT_FANOUT_LIMIT: usize = 4;

/// Errors that can occur while delivering to a webhook.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Transport-level failure that is not retryable (bad URL, TLS, ...).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint rejected the delivery with a permanent status (4xx other
    /// than 429). Never retried.
    #[error("webhook rejected delivery: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// The endpoint kept failing with server errors through the attempt cap.
    #[error("webhook server error after {attempts} attempts: {status}")]
    ServerError { status: u16, attempts: u32 },

    /// Transient failures (timeout, connection error, rate limit) exhausted
    /// the attempt cap.
    #[error("delivery failed after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },
}

/// Retry/backoff parameters for webhook deliveries.
///
/// The production defaults implement the delivery contract: 10s request
/// timeout, 3 attempts, exponential backoff from 1s capped at 30s with ±25%
/// jitter. Tests swap in [`RetryPolicy::fast_for_tests`] so retry scenarios
/// complete in milliseconds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per delivery, first try included.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the doubled delay.
    pub max_delay: Duration,

    /// Fractional jitter applied to every wait (±).
    pub jitter: f64,

    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_DELIVERY_ATTEMPTS,
            initial_delay: Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
            max_delay: Duration::from_secs(MAX_RETRY_DELAY_SECS),
            jitter: JITTER_FACTOR,
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

impl RetryPolicy {
    /// A policy with millisecond delays for integration tests.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self {
            max_attempts: MAX_DELIVERY_ATTEMPTS,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            jitter: JITTER_FACTOR,
            request_timeout: Duration::from_secs(2),
        }
    }

    /// Adds ± `jitter` to a duration.
    fn jittered(&self, duration: Duration) -> Duration {
        let mut rng = rand::rng();
        let jitter_range = duration.as_secs_f64() * self.jitter;
        let jitter = rng.random_range(-jitter_range..=jitter_range);
        let new_secs = (duration.as_secs_f64() + jitter).max(0.001);
        Duration::from_secs_f64(new_secs)
    }

    /// Doubles the delay up to the maximum.
    fn increased(&self, delay: Duration) -> Duration {
        (delay * 2).min(self.max_delay)
    }
}

/// The recorded result of one delivery (one event, one rule).
#[derive(Debug)]
pub struct DispatchOutcome {
    /// Name of the matched rule.
    pub rule: String,

    /// Id of the event that was delivered.
    pub event_id: String,

    /// How many HTTP attempts were made.
    pub attempts: u32,

    /// `Ok` when the endpoint accepted the delivery.
    pub result: Result<(), DispatchError>,
}

impl DispatchOutcome {
    /// Whether the delivery was accepted.
    #[must_use]
    pub fn delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// Webhook dispatcher with bounded fan-out and per-delivery retry.
///
/// Cheap to clone is not required — the listener holds one behind an `Arc`
/// and shares it across dispatch tasks. All methods take `&self`; retry state
/// is local to each delivery so concurrent deliveries never interfere.
pub struct Dispatcher {
    client: Client,
    policy: RetryPolicy,
    fanout_limit: usize,
}

impl Dispatcher {
    /// Creates a dispatcher with the given retry policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        let client = Client::builder()
            .timeout(policy.request_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            policy,
            fanout_limit: DEFAULT_FANOUT_LIMIT,
        }
    }

    /// Overrides the number of simultaneous webhook calls per event.
    ///
    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_fanout_limit(mut self, limit: usize) -> Self {
        self.fanout_limit = limit.max(1);
        self
    }

    /// Delivers `event` to every rule in `matches`, concurrently, bounded by
    /// the fan-out limit.
    ///
    /// Outcomes are returned in completion order. A failing endpoint only
    /// shows up in its own outcome; sibling deliveries proceed regardless.
    pub async fn dispatch_all(&self, event: &Event, matches: &[&Rule]) -> Vec<DispatchOutcome> {
        // Collected eagerly: a borrowing closure inside the stream leaves
        // the combined future unusable from spawned tasks.
        let calls: Vec<_> = matches
            .iter()
            .map(|rule| self.dispatch(event, rule))
            .collect();
        stream::iter(calls)
            .buffer_unordered(self.fanout_limit)
            .collect()
            .await
    }

    /// Delivers `event` to a single rule's webhook.
    ///
    /// Never returns an error: the outcome records success or the final
    /// failure after the retry policy is exhausted.
    pub async fn dispatch(&self, event: &Event, rule: &Rule) -> DispatchOutcome {
        let payload = render_payload(event, rule);
        let (attempts, result) = self.deliver(&rule.webhook_url, &payload).await;

        match &result {
            Ok(()) => info!(
                rule = %rule.name,
                event = %event.id,
                attempts,
                "Webhook delivered"
            ),
            Err(e) => error!(
                rule = %rule.name,
                event = %event.id,
                attempts,
                error = %e,
                "Webhook delivery failed"
            ),
        }

        DispatchOutcome {
            rule: rule.name.clone(),
            event_id: event.id.clone(),
            attempts,
            result,
        }
    }

    /// Sends a one-shot probe payload to `url` — no retries.
    ///
    /// Used by `switchboard-listener test-webhook` to verify an endpoint
    /// before it is put in a rule.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Rejected`] for any non-2xx response and
    /// [`DispatchError::Http`] for transport failures.
    pub async fn send_test(&self, url: &str) -> Result<(), DispatchError> {
        let payload = json!({
            "event_type": "test",
            "rule": "webhook test",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "summary": "Switchboard webhook test",
            "data": {},
        });

        let response = self.client.post(url).json(&payload).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(DispatchError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// POSTs `payload` to `url` with the retry policy applied.
    ///
    /// Returns the attempt count alongside the result so outcomes can report
    /// how hard the dispatcher tried.
    async fn deliver(&self, url: &str, payload: &Value) -> (u32, Result<(), DispatchError>) {
        let mut attempts = 0;
        let mut delay = self.policy.initial_delay;

        loop {
            attempts += 1;

            debug!(url = %url, attempt = attempts, "Posting webhook");

            let result = self.client.post(url).json(payload).send().await;

            match result {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return (attempts, Ok(()));
                    }

                    match status {
                        StatusCode::TOO_MANY_REQUESTS => {
                            if attempts >= self.policy.max_attempts {
                                return (
                                    attempts,
                                    Err(DispatchError::MaxRetriesExceeded { attempts }),
                                );
                            }

                            let retry_after = response
                                .headers()
                                .get(RETRY_AFTER)
                                .and_then(|v| v.to_str().ok());
                            let wait = parse_retry_after(retry_after)
                                .unwrap_or_else(|| self.policy.jittered(delay));
                            warn!(
                                url = %url,
                                wait_ms = wait.as_millis(),
                                "Rate limited by webhook, waiting"
                            );
                            sleep(wait).await;
                            delay = self.policy.increased(delay);
                        }
                        _ if status.is_server_error() => {
                            if attempts >= self.policy.max_attempts {
                                return (
                                    attempts,
                                    Err(DispatchError::ServerError {
                                        status: status.as_u16(),
                                        attempts,
                                    }),
                                );
                            }

                            warn!(
                                url = %url,
                                status = status.as_u16(),
                                "Webhook server error, will retry"
                            );
                            let wait = self.policy.jittered(delay);
                            sleep(wait).await;
                            delay = self.policy.increased(delay);
                        }
                        _ => {
                            let message = response.text().await.unwrap_or_default();
                            return (
                                attempts,
                                Err(DispatchError::Rejected {
                                    status: status.as_u16(),
                                    message,
                                }),
                            );
                        }
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    if attempts >= self.policy.max_attempts {
                        return (attempts, Err(DispatchError::MaxRetriesExceeded { attempts }));
                    }

                    warn!(url = %url, error = %e, "Connection error, will retry");
                    let wait = self.policy.jittered(delay);
                    sleep(wait).await;
                    delay = self.policy.increased(delay);
                }
                Err(e) => return (attempts, Err(DispatchError::Http(e))),
            }
        }
    }
}

/// Parses a seconds-form Retry-After value, capped so a hostile header
/// cannot stall a delivery indefinitely.
///
/// Returns `None` for an absent, non-numeric, or HTTP-date-form value; the
/// caller then falls back to the backoff schedule.
fn parse_retry_after(header: Option<&str>) -> Option<Duration> {
    let secs = header?.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs.min(RETRY_AFTER_CAP_SECS)))
}

/// Renders the delivery payload for `event` matched by `rule`.
///
/// The wrapper carries the event kind, the matching rule's name, the
/// delivery timestamp, a human-readable summary line, the scope ids when
/// present, and the raw event payload under `data`.
#[must_use]
pub fn render_payload(event: &Event, rule: &Rule) -> Value {
    let mut payload = serde_json::Map::new();
    payload.insert("event_type".to_string(), json!(event.kind.as_str()));
    payload.insert("rule".to_string(), json!(rule.name));
    payload.insert(
        "timestamp".to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    payload.insert("summary".to_string(), json!(event.summary()));
    if let Some(id) = &event.guild_id {
        payload.insert("guild_id".to_string(), json!(id));
    }
    if let Some(id) = &event.channel_id {
        payload.insert("channel_id".to_string(), json!(id));
    }
    payload.insert("data".to_string(), Value::Object(event.payload.clone()));
    Value::Object(payload)
}
