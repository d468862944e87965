//! Single-attempt HTTP webhook dispatch.
//!
//! The dispatcher executes exactly one delivery attempt end-to-end:
//! serialize the canonical payload, sign it when the subscription carries a
//! secret, POST through the endpoint's circuit breaker with a hard
//! per-attempt timeout, classify the outcome, and hand back one
//! [`DeliveryAttempt`] audit record. It never decides whether to retry;
//! that stays with the scheduler.
//!
//! Outcome classification (delivery never follows redirects):
//! - 2xx: delivered
//! - 3xx and 4xx except 408/425/429: permanent failure
//! - 408/425/429, 5xx, network errors, timeouts: retryable failure
//! - breaker open: retryable failure deferred by the remaining open window

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use courier_breaker::CircuitBreaker;
use courier_clock::SharedClock;
use courier_retry::{ErrorClass, classify_http_status, parse_retry_after};
use courier_signature::{SIGNATURE_HEADER, sign};
use courier_types::{DeliveryAttempt, Event, Subscription, truncate_body};
use uuid::Uuid;

/// Header naming the event kind, e.g. `issue.updated`.
pub const EVENT_HEADER: &str = "X-Webhook-Event";

/// Header carrying the stable event id; receivers may deduplicate on it.
pub const ID_HEADER: &str = "X-Webhook-Id";

/// Structured result of one delivery attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Delivered {
        http_status: u16,
    },
    Retryable {
        error: String,
        http_status: Option<u16>,
        /// Server-provided deferral from a 429 `Retry-After` header.
        retry_after: Option<Duration>,
    },
    Permanent {
        error: String,
        http_status: Option<u16>,
    },
    /// Rejected by the circuit breaker without an HTTP call.
    BreakerOpen {
        retry_in: Duration,
    },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Delivered { .. })
    }

    /// The error string recorded on the event, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            AttemptOutcome::Delivered { .. } => None,
            AttemptOutcome::Retryable { error, .. } | AttemptOutcome::Permanent { error, .. } => {
                Some(error)
            }
            AttemptOutcome::BreakerOpen { .. } => Some("circuit breaker open"),
        }
    }
}

/// Executes single delivery attempts. Cheap to clone per worker via `Arc`.
pub struct Dispatcher {
    client: reqwest::Client,
    clock: SharedClock,
}

impl Dispatcher {
    /// Build the dispatcher with a shared HTTP client. Per-attempt timeouts
    /// come from each subscription, so the client carries none. Redirects
    /// are never followed; a 3xx is a delivery failure.
    pub fn new(clock: SharedClock) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self { client, clock })
    }

    /// Execute one attempt for `event` against `subscription`.
    ///
    /// Exactly one [`DeliveryAttempt`] is produced per call, breaker
    /// rejections included; the caller persists it.
    pub async fn dispatch(
        &self,
        event: &Event,
        subscription: &Subscription,
        breaker: &CircuitBreaker,
    ) -> (AttemptOutcome, DeliveryAttempt) {
        let body = match event.payload.to_canonical_json() {
            Ok(body) => body,
            Err(error) => {
                let outcome = AttemptOutcome::Permanent {
                    error: format!("failed to serialize payload: {error}"),
                    http_status: None,
                };
                let attempt = self.attempt_record(event, &outcome, 0, None, None, None);
                return (outcome, attempt);
            }
        };

        let mut headers: Vec<(String, String)> = vec![
            ("Content-Type".to_string(), "application/json; charset=utf-8".to_string()),
            (EVENT_HEADER.to_string(), event.kind.to_string()),
            (ID_HEADER.to_string(), event.id.clone()),
        ];
        if let Some(secret) = &subscription.secret {
            headers.push((SIGNATURE_HEADER.to_string(), sign(secret, body.as_bytes())));
        }
        for (name, value) in &subscription.headers {
            headers.push((name.clone(), value.clone()));
        }
        let request_headers: BTreeMap<String, String> = headers.iter().cloned().collect();

        if let Err(open) = breaker.try_acquire() {
            tracing::debug!(
                event_id = %event.id,
                url = %subscription.url,
                retry_in_ms = open.retry_in.as_millis() as u64,
                "delivery rejected by open circuit breaker"
            );
            let outcome = AttemptOutcome::BreakerOpen { retry_in: open.retry_in };
            let attempt =
                self.attempt_record(event, &outcome, 0, None, Some(request_headers), None);
            return (outcome, attempt);
        }

        tracing::debug!(
            event_id = %event.id,
            url = %subscription.url,
            attempt = event.attempts,
            "sending webhook HTTP request"
        );

        let mut builder = self
            .client
            .post(&subscription.url)
            .timeout(subscription.timeout);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        let result = builder.body(body).send().await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let response_headers: BTreeMap<String, String> = response
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.as_str().to_string(),
                            String::from_utf8_lossy(value.as_bytes()).into_owned(),
                        )
                    })
                    .collect();
                let retry_after = if status == 429 {
                    response_headers
                        .get("retry-after")
                        .and_then(|value| parse_retry_after(value, self.clock.now()))
                } else {
                    None
                };
                let response_body = response.text().await.unwrap_or_default();
                let captured =
                    (!response_body.is_empty()).then(|| truncate_body(&response_body));

                let outcome = if (200..300).contains(&status) {
                    breaker.record_success(elapsed);
                    AttemptOutcome::Delivered { http_status: status }
                } else {
                    breaker.record_failure(Some(elapsed));
                    let error = format!("webhook returned HTTP {status}");
                    match classify_http_status(status) {
                        ErrorClass::Retryable => AttemptOutcome::Retryable {
                            error,
                            http_status: Some(status),
                            retry_after,
                        },
                        ErrorClass::Permanent => AttemptOutcome::Permanent {
                            error,
                            http_status: Some(status),
                        },
                    }
                };

                let attempt = self.attempt_record(
                    event,
                    &outcome,
                    elapsed.as_millis() as u64,
                    captured,
                    Some(request_headers),
                    Some(response_headers),
                );
                (outcome, attempt)
            }
            Err(error) => {
                breaker.record_failure(Some(elapsed));
                let message = if error.is_timeout() {
                    format!(
                        "request timed out after {}ms",
                        subscription.timeout.as_millis()
                    )
                } else {
                    format!("request failed: {error}")
                };
                tracing::debug!(
                    event_id = %event.id,
                    url = %subscription.url,
                    error = %message,
                    "webhook request failed"
                );
                let outcome = AttemptOutcome::Retryable {
                    error: message,
                    http_status: None,
                    retry_after: None,
                };
                let attempt = self.attempt_record(
                    event,
                    &outcome,
                    elapsed.as_millis() as u64,
                    None,
                    Some(request_headers),
                    None,
                );
                (outcome, attempt)
            }
        }
    }

    fn attempt_record(
        &self,
        event: &Event,
        outcome: &AttemptOutcome,
        response_time_ms: u64,
        response_body: Option<String>,
        request_headers: Option<BTreeMap<String, String>>,
        response_headers: Option<BTreeMap<String, String>>,
    ) -> DeliveryAttempt {
        let http_status = match outcome {
            AttemptOutcome::Delivered { http_status } => Some(*http_status),
            AttemptOutcome::Retryable { http_status, .. }
            | AttemptOutcome::Permanent { http_status, .. } => *http_status,
            AttemptOutcome::BreakerOpen { .. } => None,
        };
        DeliveryAttempt {
            id: Uuid::new_v4().to_string(),
            event_id: event.id.clone(),
            attempt_number: event.attempts,
            timestamp: self.clock.now(),
            http_status,
            response_time_ms,
            success: outcome.is_success(),
            error: outcome.error().map(str::to_string),
            response_body,
            request_headers,
            response_headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_breaker::BreakerConfig;
    use courier_clock::system_clock;
    use courier_signature::verify;
    use courier_types::{
        ChangeAction, DocumentClass, EnvelopeData, EnvelopeEvent, EventEnvelope, EventKind,
        EventStatus, MAX_CAPTURED_BODY_BYTES,
    };
    use serde_json::json;
    use std::io::Read;
    use std::sync::{Arc, Mutex};
    use std::thread;

    struct Received {
        body: String,
        headers: BTreeMap<String, String>,
    }

    /// Serve `responses` in order on an ephemeral port, capturing requests.
    fn spawn_server(
        responses: Vec<(u16, Vec<(&'static str, String)>, String)>,
    ) -> (String, Arc<Mutex<Vec<Received>>>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let url = format!("http://{}", server.server_addr());
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);

        thread::spawn(move || {
            for (status, headers, body) in responses {
                let Ok(mut request) = server.recv() else { return };
                let mut content = String::new();
                let _ = request.as_reader().read_to_string(&mut content);
                let header_map = request
                    .headers()
                    .iter()
                    .map(|h| (h.field.as_str().as_str().to_lowercase(), h.value.to_string()))
                    .collect();
                received_clone
                    .lock()
                    .unwrap()
                    .push(Received { body: content, headers: header_map });

                let mut response =
                    tiny_http::Response::from_string(body).with_status_code(status);
                for (name, value) in headers {
                    response.add_header(
                        tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes())
                            .expect("header"),
                    );
                }
                let _ = request.respond(response);
            }
        });

        (url, received)
    }

    fn event_for(url_kind: EventKind, attempts: u32) -> Event {
        let now = Utc::now();
        Event {
            id: "evt-1".to_string(),
            kind: url_kind,
            object_id: "I-1".to_string(),
            object_class: url_kind.class,
            subscription_id: "sub-1".to_string(),
            payload: EventEnvelope {
                event: EnvelopeEvent {
                    id: "evt-1".to_string(),
                    timestamp: now.timestamp_millis(),
                    kind: url_kind,
                    action: url_kind.action,
                    object_id: "I-1".to_string(),
                    object_class: url_kind.class,
                },
                workspace: "acme".to_string(),
                modified_by: "user-7".to_string(),
                data: EnvelopeData {
                    action: url_kind.action,
                    object: Some(json!({"title": "Boot"})),
                    operations: None,
                },
            },
            status: EventStatus::InFlight,
            attempts,
            created_on: now,
            last_attempted_on: Some(now),
            next_attempt_after: now,
            last_error: None,
        }
    }

    fn issue_created_event(attempts: u32) -> Event {
        event_for(EventKind::new(DocumentClass::Issue, ChangeAction::Created), attempts)
    }

    fn breaker_for(url: &str) -> CircuitBreaker {
        CircuitBreaker::new(url, BreakerConfig::default(), system_clock())
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(system_clock()).expect("dispatcher")
    }

    #[tokio::test]
    async fn delivers_signed_payload_with_webhook_headers() {
        let (url, received) = spawn_server(vec![(200, vec![], "ok".to_string())]);
        let mut sub = Subscription::new("sub-1", &url);
        sub.secret = Some("k".to_string());
        sub.headers
            .insert("X-Custom".to_string(), "custom-value".to_string());

        let event = issue_created_event(1);
        let breaker = breaker_for(&url);
        let (outcome, attempt) = dispatcher().dispatch(&event, &sub, &breaker).await;

        assert!(matches!(outcome, AttemptOutcome::Delivered { http_status: 200 }));
        assert!(attempt.success);
        assert_eq!(attempt.attempt_number, 1);
        assert_eq!(attempt.http_status, Some(200));
        assert_eq!(attempt.response_body.as_deref(), Some("ok"));

        let requests = received.lock().unwrap();
        let request = &requests[0];
        assert_eq!(
            request.headers.get("content-type").map(String::as_str),
            Some("application/json; charset=utf-8")
        );
        assert_eq!(
            request.headers.get("x-webhook-event").map(String::as_str),
            Some("issue.created")
        );
        assert_eq!(
            request.headers.get("x-webhook-id").map(String::as_str),
            Some("evt-1")
        );
        assert_eq!(
            request.headers.get("x-custom").map(String::as_str),
            Some("custom-value")
        );

        // Signature verifies against the exact bytes that were sent.
        let signature = request.headers.get("x-webhook-signature").expect("signed");
        assert!(verify("k", request.body.as_bytes(), signature));
        assert!(!verify("other", request.body.as_bytes(), signature));

        // And the body is the canonical envelope.
        assert_eq!(request.body, event.payload.to_canonical_json().unwrap());
    }

    #[tokio::test]
    async fn unsigned_when_no_secret_is_configured() {
        let (url, received) = spawn_server(vec![(204, vec![], String::new())]);
        let sub = Subscription::new("sub-1", &url);
        let breaker = breaker_for(&url);

        let (outcome, attempt) =
            dispatcher().dispatch(&issue_created_event(1), &sub, &breaker).await;

        assert!(outcome.is_success());
        assert_eq!(attempt.response_body, None);
        let requests = received.lock().unwrap();
        assert!(!requests[0].headers.contains_key("x-webhook-signature"));
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let (url, _received) = spawn_server(vec![(503, vec![], "unavailable".to_string())]);
        let sub = Subscription::new("sub-1", &url);
        let breaker = breaker_for(&url);

        let (outcome, attempt) =
            dispatcher().dispatch(&issue_created_event(1), &sub, &breaker).await;

        match outcome {
            AttemptOutcome::Retryable { error, http_status, retry_after } => {
                assert!(error.contains("503"));
                assert_eq!(http_status, Some(503));
                assert_eq!(retry_after, None);
            }
            other => panic!("expected retryable, got {other:?}"),
        }
        assert!(!attempt.success);
        assert_eq!(attempt.response_body.as_deref(), Some("unavailable"));
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let (url, _received) = spawn_server(vec![(401, vec![], "no".to_string())]);
        let sub = Subscription::new("sub-1", &url);
        let breaker = breaker_for(&url);

        let (outcome, attempt) =
            dispatcher().dispatch(&issue_created_event(1), &sub, &breaker).await;

        match outcome {
            AttemptOutcome::Permanent { error, http_status } => {
                assert!(error.contains("401"));
                assert_eq!(http_status, Some(401));
            }
            other => panic!("expected permanent, got {other:?}"),
        }
        assert_eq!(attempt.error.as_deref(), Some("webhook returned HTTP 401"));
    }

    #[tokio::test]
    async fn redirects_are_permanent() {
        let (url, _received) = spawn_server(vec![(
            308,
            vec![("Location", "https://elsewhere.example/hook".to_string())],
            String::new(),
        )]);
        let sub = Subscription::new("sub-1", &url);
        let breaker = breaker_for(&url);

        let (outcome, _attempt) =
            dispatcher().dispatch(&issue_created_event(1), &sub, &breaker).await;
        assert!(matches!(
            outcome,
            AttemptOutcome::Permanent { http_status: Some(308), .. }
        ));
    }

    #[tokio::test]
    async fn rate_limited_responses_carry_retry_after() {
        let (url, _received) = spawn_server(vec![(
            429,
            vec![("Retry-After", "7".to_string())],
            String::new(),
        )]);
        let sub = Subscription::new("sub-1", &url);
        let breaker = breaker_for(&url);

        let (outcome, _attempt) =
            dispatcher().dispatch(&issue_created_event(1), &sub, &breaker).await;
        match outcome {
            AttemptOutcome::Retryable { retry_after, http_status, .. } => {
                assert_eq!(http_status, Some(429));
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected retryable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn network_errors_are_retryable() {
        // Nothing listens on this port.
        let sub = Subscription::new("sub-1", "http://127.0.0.1:9/hook");
        let breaker = breaker_for(&sub.url);

        let (outcome, attempt) =
            dispatcher().dispatch(&issue_created_event(1), &sub, &breaker).await;
        match outcome {
            AttemptOutcome::Retryable { http_status, .. } => assert_eq!(http_status, None),
            other => panic!("expected retryable, got {other:?}"),
        }
        assert_eq!(attempt.http_status, None);
        assert!(attempt.error.is_some());
    }

    #[tokio::test]
    async fn breaker_open_short_circuits_without_a_request() {
        let (url, received) = spawn_server(vec![(200, vec![], String::new())]);
        let sub = Subscription::new("sub-1", &url);
        let breaker = breaker_for(&url);
        for _ in 0..10 {
            breaker.record_failure(Some(Duration::from_millis(5)));
        }

        let (outcome, attempt) =
            dispatcher().dispatch(&issue_created_event(2), &sub, &breaker).await;

        match outcome {
            AttemptOutcome::BreakerOpen { retry_in } => {
                assert!(retry_in <= Duration::from_secs(60));
                assert!(retry_in > Duration::ZERO);
            }
            other => panic!("expected breaker open, got {other:?}"),
        }
        assert!(!attempt.success);
        assert_eq!(attempt.attempt_number, 2);
        assert_eq!(attempt.error.as_deref(), Some("circuit breaker open"));
        // The endpoint never saw the request.
        assert!(received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn response_bodies_are_truncated() {
        let big = "z".repeat(MAX_CAPTURED_BODY_BYTES + 4096);
        let (url, _received) = spawn_server(vec![(500, vec![], big)]);
        let sub = Subscription::new("sub-1", &url);
        let breaker = breaker_for(&url);

        let (_outcome, attempt) =
            dispatcher().dispatch(&issue_created_event(1), &sub, &breaker).await;
        assert_eq!(
            attempt.response_body.as_ref().map(String::len),
            Some(MAX_CAPTURED_BODY_BYTES)
        );
    }

    #[tokio::test]
    async fn attempt_captures_headers_for_audit_only() {
        let (url, _received) = spawn_server(vec![(200, vec![], String::new())]);
        let mut sub = Subscription::new("sub-1", &url);
        sub.secret = Some("k".to_string());
        let breaker = breaker_for(&url);

        let (_outcome, attempt) =
            dispatcher().dispatch(&issue_created_event(1), &sub, &breaker).await;

        let request_headers = attempt.request_headers.as_ref().expect("captured");
        assert!(request_headers.contains_key(SIGNATURE_HEADER));
        assert!(attempt.response_headers.is_some());

        // Hidden from serialized views.
        let json = serde_json::to_string(&attempt).expect("serialize");
        assert!(!json.contains("request_headers"));
        assert!(!json.contains("response_headers"));
    }

    #[tokio::test]
    async fn timeouts_are_retryable_and_mention_the_budget() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let url = format!("http://{}", server.server_addr());
        // Accept the connection but never respond within the timeout.
        thread::spawn(move || {
            let Ok(request) = server.recv() else { return };
            thread::sleep(Duration::from_millis(500));
            let _ = request.respond(tiny_http::Response::from_string("late"));
        });

        let mut sub = Subscription::new("sub-1", &url);
        sub.timeout = Duration::from_millis(100);
        let breaker = breaker_for(&url);

        let (outcome, attempt) =
            dispatcher().dispatch(&issue_created_event(1), &sub, &breaker).await;
        match outcome {
            AttemptOutcome::Retryable { error, http_status, .. } => {
                assert_eq!(http_status, None);
                assert!(error.contains("timed out"));
                assert!(error.contains("100"));
            }
            other => panic!("expected retryable timeout, got {other:?}"),
        }
        assert!(!attempt.success);
    }
}
