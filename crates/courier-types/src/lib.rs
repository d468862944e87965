//! # Types
//!
//! Core domain types for courier: subscriptions, events, delivery attempts,
//! rolling stats, and the canonical webhook envelope.
//!
//! This crate defines the fundamental data structures used throughout courier:
//! - [`Subscription`] - A configured webhook target with filters and limits
//! - [`Event`] - One pending or completed notification for a single subscription
//! - [`DeliveryAttempt`] - Append-only audit record of a single HTTP try
//! - [`DeliveryStats`] - Rolling per-subscription delivery counters
//! - [`EventEnvelope`] - The canonical wire payload
//!
//! ## Serialization
//!
//! Most types implement `Serialize` and `Deserialize` from `serde` for
//! persistence. Durations are serialized as milliseconds and deserialized
//! from either milliseconds or human-readable strings (`"30s"`).
//!
//! ## Envelope key order
//!
//! [`EventEnvelope`] field declaration order is the wire key order. HMAC
//! signatures are computed over the serialized bytes, so the order is part
//! of the delivery contract and must not change.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// The closed set of observed document classes.
///
/// Adding a class is a code change: extend this enum, and the event-kind set
/// grows by three (`created`/`updated`/`deleted`) automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentClass {
    Issue,
    Project,
    Component,
    Milestone,
    ChatMessage,
}

impl DocumentClass {
    /// All observed classes, in declaration order.
    pub const ALL: [DocumentClass; 5] = [
        DocumentClass::Issue,
        DocumentClass::Project,
        DocumentClass::Component,
        DocumentClass::Milestone,
        DocumentClass::ChatMessage,
    ];

    /// Wire name of the class (lowerCamelCase).
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentClass::Issue => "issue",
            DocumentClass::Project => "project",
            DocumentClass::Component => "component",
            DocumentClass::Milestone => "milestone",
            DocumentClass::ChatMessage => "chatMessage",
        }
    }

    /// Whether the class belongs to the tracker family, i.e. its documents
    /// can be scoped to a project.
    pub fn is_tracker(&self) -> bool {
        !matches!(self, DocumentClass::ChatMessage)
    }
}

impl fmt::Display for DocumentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentClass {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// The kind of change a transaction describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Created => "created",
            ChangeAction::Updated => "updated",
            ChangeAction::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeAction {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ChangeAction::Created),
            "updated" => Ok(ChangeAction::Updated),
            "deleted" => Ok(ChangeAction::Deleted),
            other => Err(UnknownEventKind(other.to_string())),
        }
    }
}

/// Error returned when parsing an event kind or one of its halves fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

/// A typed event kind: one (class, action) pair from the closed set.
///
/// Renders as `issue.created`, `project.deleted`, `chatMessage.updated`, etc.
/// Exactly 15 kinds exist; parsing rejects everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKind {
    pub class: DocumentClass,
    pub action: ChangeAction,
}

impl EventKind {
    pub fn new(class: DocumentClass, action: ChangeAction) -> Self {
        Self { class, action }
    }

    /// Every kind in the closed set, in class-major order.
    pub fn all() -> Vec<EventKind> {
        let mut kinds = Vec::with_capacity(15);
        for class in DocumentClass::ALL {
            for action in [ChangeAction::Created, ChangeAction::Updated, ChangeAction::Deleted] {
                kinds.push(EventKind { class, action });
            }
        }
        kinds
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.action)
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (class, action) = s
            .split_once('.')
            .ok_or_else(|| UnknownEventKind(s.to_string()))?;
        Ok(EventKind {
            class: class.parse()?,
            action: action.parse()?,
        })
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Subscription configuration rejected at write time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("subscription URL is not valid: {0}")]
    InvalidUrl(String),
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("rate limit period must be greater than zero when a rate limit is set")]
    ZeroRateLimitPeriod,
}

fn default_enabled() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_rate_limit_period() -> Duration {
    Duration::from_secs(60)
}

/// A configured webhook target.
///
/// Subscriptions are operator-supplied data: created and edited upstream,
/// long-lived, and read here to decide which document changes fan out into
/// events and how those events are delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Opaque subscription id.
    pub id: String,
    /// Delivery target URL (https recommended).
    pub url: String,
    /// Shared secret for HMAC signing; unsigned delivery when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Disabled subscriptions produce no new events and dispatch nothing.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Event-kind filter. An empty set subscribes to every kind.
    #[serde(default)]
    pub events: BTreeSet<EventKind>,
    /// Optional space scope: only changes in this space match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    /// Optional project scope: tracker documents must belong to one of these.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects: Option<Vec<String>>,
    /// Retries after the first failed attempt (`attempts <= retry_attempts + 1`).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Hard per-attempt HTTP timeout.
    #[serde(
        default = "default_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    /// Max attempt starts per `rate_limit_period`; 0 disables throttling.
    #[serde(default)]
    pub rate_limit: u32,
    /// Sliding window for `rate_limit`.
    #[serde(
        default = "default_rate_limit_period",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub rate_limit_period: Duration,
    /// Static headers attached to every delivery.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Last modification time; used as a freshness hint when loading.
    pub modified_on: DateTime<Utc>,
}

impl Subscription {
    /// Create a subscription with defaults for everything but id and URL.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            secret: None,
            enabled: true,
            events: BTreeSet::new(),
            space: None,
            projects: None,
            retry_attempts: default_retry_attempts(),
            timeout: default_timeout(),
            rate_limit: 0,
            rate_limit_period: default_rate_limit_period(),
            headers: BTreeMap::new(),
            modified_on: Utc::now(),
        }
    }

    /// Write-time validation. Runtime code assumes a validated subscription.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rest = self
            .url
            .strip_prefix("https://")
            .or_else(|| self.url.strip_prefix("http://"));
        match rest {
            Some(host) if !host.is_empty() => {}
            _ => return Err(ConfigError::InvalidUrl(self.url.clone())),
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.rate_limit > 0 && self.rate_limit_period.is_zero() {
            return Err(ConfigError::ZeroRateLimitPeriod);
        }
        Ok(())
    }

    /// Whether this subscription's event filter matches `kind`.
    pub fn wants(&self, kind: EventKind) -> bool {
        self.events.is_empty() || self.events.contains(&kind)
    }
}

/// Delivery state of an event.
///
/// Transitions form a DAG: `pending -> in-flight -> (delivered |
/// failed-retryable | dead-lettered)`, with `failed-retryable -> in-flight`
/// as the only back-edge. `pending` and `failed-retryable` events whose
/// subscription disappeared move straight to `dead-lettered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventStatus {
    Pending,
    InFlight,
    Delivered,
    FailedRetryable,
    DeadLettered,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::InFlight => "in-flight",
            EventStatus::Delivered => "delivered",
            EventStatus::FailedRetryable => "failed-retryable",
            EventStatus::DeadLettered => "dead-lettered",
        }
    }

    /// Terminal events are never dispatched again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Delivered | EventStatus::DeadLettered)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(&self, to: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, to),
            (Pending, InFlight)
                | (Pending, DeadLettered)
                | (InFlight, Delivered)
                | (InFlight, FailedRetryable)
                | (InFlight, DeadLettered)
                | (FailedRetryable, InFlight)
                | (FailedRetryable, DeadLettered)
        )
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pending or completed notification directed at exactly one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Opaque event id; stable across retries and exposed as `X-Webhook-Id`.
    pub id: String,
    pub kind: EventKind,
    pub object_id: String,
    pub object_class: DocumentClass,
    /// Owning subscription. Deleting the subscription orphans the event;
    /// dispatch recognizes that and dead-letters.
    pub subscription_id: String,
    /// Canonical payload, built once at translation time.
    pub payload: EventEnvelope,
    pub status: EventStatus,
    /// Attempts started so far (incremented at admission, not completion).
    #[serde(default)]
    pub attempts: u32,
    pub created_on: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempted_on: Option<DateTime<Utc>>,
    pub next_attempt_after: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Captured response bodies are truncated to this many bytes.
pub const MAX_CAPTURED_BODY_BYTES: usize = 8 * 1024;

/// Truncate a response body to [`MAX_CAPTURED_BODY_BYTES`], respecting
/// UTF-8 character boundaries.
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_CAPTURED_BODY_BYTES {
        return body.to_string();
    }
    let mut end = MAX_CAPTURED_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Audit record of a single HTTP try for an event. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: String,
    pub event_id: String,
    /// 1-based, strictly increasing per event.
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub response_time_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Response body, truncated to [`MAX_CAPTURED_BODY_BYTES`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Captured for audit; hidden from serialized views.
    #[serde(skip)]
    pub request_headers: Option<BTreeMap<String, String>>,
    /// Captured for audit; hidden from serialized views.
    #[serde(skip)]
    pub response_headers: Option<BTreeMap<String, String>>,
}

/// The UTC day bucket used for [`DeliveryStats`] periods.
pub fn stats_period(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Per-attempt stats contribution.
#[derive(Debug, Clone, Copy)]
pub struct StatsDelta {
    pub delivered: bool,
    pub response_time_ms: u64,
    pub at: DateTime<Utc>,
}

/// Rolling per-subscription delivery counters for one period.
///
/// Best-effort data: losing a delta is not a correctness issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub subscription_id: String,
    pub period: String,
    pub total_events: u64,
    pub delivered_events: u64,
    pub failed_events: u64,
    pub total_response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delivery_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_delivery: Option<DateTime<Utc>>,
}

impl DeliveryStats {
    pub fn new(subscription_id: impl Into<String>, period: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            period: period.into(),
            total_events: 0,
            delivered_events: 0,
            failed_events: 0,
            total_response_time_ms: 0,
            last_delivery_attempt: None,
            last_successful_delivery: None,
        }
    }

    pub fn apply(&mut self, delta: &StatsDelta) {
        self.total_events += 1;
        if delta.delivered {
            self.delivered_events += 1;
            self.last_successful_delivery = Some(delta.at);
        } else {
            self.failed_events += 1;
        }
        self.total_response_time_ms += delta.response_time_ms;
        self.last_delivery_attempt = Some(delta.at);
    }

    pub fn average_response_time_ms(&self) -> f64 {
        if self.total_events == 0 {
            return 0.0;
        }
        self.total_response_time_ms as f64 / self.total_events as f64
    }

    /// Delivered fraction of completed attempts, in `0.0..=1.0`.
    pub fn success_rate(&self) -> f64 {
        let completed = self.delivered_events + self.failed_events;
        if completed == 0 {
            return 0.0;
        }
        self.delivered_events as f64 / completed as f64
    }
}

/// The canonical wire payload.
///
/// Field declaration order here *is* the serialized key order, and the
/// signature is computed over the serialized bytes. Do not reorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: EnvelopeEvent,
    pub workspace: String,
    #[serde(rename = "modifiedBy")]
    pub modified_by: String,
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeEvent {
    pub id: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub action: ChangeAction,
    #[serde(rename = "objectId")]
    pub object_id: String,
    #[serde(rename = "objectClass")]
    pub object_class: DocumentClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeData {
    pub action: ChangeAction,
    /// Document snapshot; explicitly `null` when a removed document's state
    /// is unavailable.
    pub object: Option<Value>,
    /// Field changes; present only for `updated`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<Value>,
}

impl EventEnvelope {
    /// Serialize to the canonical JSON bytes that get signed and sent.
    pub fn to_canonical_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> EventEnvelope {
        EventEnvelope {
            event: EnvelopeEvent {
                id: "evt-1".to_string(),
                timestamp: 1_700_000_000_000,
                kind: EventKind::new(DocumentClass::Issue, ChangeAction::Created),
                action: ChangeAction::Created,
                object_id: "I-1".to_string(),
                object_class: DocumentClass::Issue,
            },
            workspace: "acme".to_string(),
            modified_by: "user-7".to_string(),
            data: EnvelopeData {
                action: ChangeAction::Created,
                object: Some(json!({"title": "Boot"})),
                operations: None,
            },
        }
    }

    #[test]
    fn event_kind_renders_class_dot_action() {
        let kind = EventKind::new(DocumentClass::Issue, ChangeAction::Created);
        assert_eq!(kind.to_string(), "issue.created");

        let kind = EventKind::new(DocumentClass::ChatMessage, ChangeAction::Updated);
        assert_eq!(kind.to_string(), "chatMessage.updated");
    }

    #[test]
    fn event_kind_parses_every_member_of_the_closed_set() {
        for kind in EventKind::all() {
            let parsed: EventKind = kind.to_string().parse().expect("parse");
            assert_eq!(parsed, kind);
        }
        assert_eq!(EventKind::all().len(), 15);
    }

    #[test]
    fn event_kind_rejects_unknown_strings() {
        assert!("issue.archived".parse::<EventKind>().is_err());
        assert!("document.created".parse::<EventKind>().is_err());
        assert!("issuecreated".parse::<EventKind>().is_err());
        assert!("".parse::<EventKind>().is_err());
    }

    #[test]
    fn event_kind_serializes_as_string() {
        let kind = EventKind::new(DocumentClass::Milestone, ChangeAction::Deleted);
        let json = serde_json::to_string(&kind).expect("serialize");
        assert_eq!(json, "\"milestone.deleted\"");
        let back: EventKind = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, kind);
    }

    #[test]
    fn tracker_family_excludes_chat_messages() {
        assert!(DocumentClass::Issue.is_tracker());
        assert!(DocumentClass::Project.is_tracker());
        assert!(DocumentClass::Component.is_tracker());
        assert!(DocumentClass::Milestone.is_tracker());
        assert!(!DocumentClass::ChatMessage.is_tracker());
    }

    #[test]
    fn status_transitions_follow_the_dag() {
        use EventStatus::*;
        assert!(Pending.can_transition(InFlight));
        assert!(Pending.can_transition(DeadLettered));
        assert!(InFlight.can_transition(Delivered));
        assert!(InFlight.can_transition(FailedRetryable));
        assert!(InFlight.can_transition(DeadLettered));
        assert!(FailedRetryable.can_transition(InFlight));
        assert!(FailedRetryable.can_transition(DeadLettered));

        assert!(!Pending.can_transition(Delivered));
        assert!(!Delivered.can_transition(InFlight));
        assert!(!DeadLettered.can_transition(InFlight));
        assert!(!InFlight.can_transition(Pending));
    }

    #[test]
    fn terminal_statuses() {
        assert!(EventStatus::Delivered.is_terminal());
        assert!(EventStatus::DeadLettered.is_terminal());
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::InFlight.is_terminal());
        assert!(!EventStatus::FailedRetryable.is_terminal());
    }

    #[test]
    fn status_wire_names_are_kebab_case() {
        let json = serde_json::to_string(&EventStatus::FailedRetryable).expect("serialize");
        assert_eq!(json, "\"failed-retryable\"");
        let json = serde_json::to_string(&EventStatus::InFlight).expect("serialize");
        assert_eq!(json, "\"in-flight\"");
    }

    #[test]
    fn subscription_defaults_from_minimal_json() {
        let json = r#"{
            "id": "sub-1",
            "url": "https://example.com/hook",
            "modified_on": "2026-01-15T10:30:00Z"
        }"#;
        let sub: Subscription = serde_json::from_str(json).expect("deserialize");
        assert!(sub.enabled);
        assert!(sub.events.is_empty());
        assert_eq!(sub.retry_attempts, 3);
        assert_eq!(sub.timeout, Duration::from_secs(30));
        assert_eq!(sub.rate_limit, 0);
        assert_eq!(sub.rate_limit_period, Duration::from_secs(60));
        assert!(sub.headers.is_empty());
    }

    #[test]
    fn subscription_duration_accepts_humantime_strings() {
        let json = r#"{
            "id": "sub-1",
            "url": "https://example.com/hook",
            "timeout": "5s",
            "rate_limit_period": 10000,
            "modified_on": "2026-01-15T10:30:00Z"
        }"#;
        let sub: Subscription = serde_json::from_str(json).expect("deserialize");
        assert_eq!(sub.timeout, Duration::from_secs(5));
        assert_eq!(sub.rate_limit_period, Duration::from_secs(10));
    }

    #[test]
    fn subscription_validation_rejects_bad_config() {
        let mut sub = Subscription::new("s", "ftp://example.com");
        assert_eq!(
            sub.validate(),
            Err(ConfigError::InvalidUrl("ftp://example.com".to_string()))
        );

        sub.url = "https://".to_string();
        assert!(matches!(sub.validate(), Err(ConfigError::InvalidUrl(_))));

        sub.url = "https://example.com/hook".to_string();
        sub.timeout = Duration::ZERO;
        assert_eq!(sub.validate(), Err(ConfigError::ZeroTimeout));

        sub.timeout = Duration::from_secs(30);
        sub.rate_limit = 5;
        sub.rate_limit_period = Duration::ZERO;
        assert_eq!(sub.validate(), Err(ConfigError::ZeroRateLimitPeriod));

        sub.rate_limit_period = Duration::from_secs(60);
        assert_eq!(sub.validate(), Ok(()));
    }

    #[test]
    fn empty_event_filter_subscribes_to_all() {
        let mut sub = Subscription::new("s", "https://example.com/hook");
        for kind in EventKind::all() {
            assert!(sub.wants(kind));
        }

        sub.events
            .insert(EventKind::new(DocumentClass::Issue, ChangeAction::Created));
        assert!(sub.wants(EventKind::new(DocumentClass::Issue, ChangeAction::Created)));
        assert!(!sub.wants(EventKind::new(DocumentClass::Issue, ChangeAction::Updated)));
    }

    #[test]
    fn body_truncation_respects_char_boundaries() {
        let short = "hello";
        assert_eq!(truncate_body(short), "hello");

        let long = "x".repeat(MAX_CAPTURED_BODY_BYTES + 100);
        assert_eq!(truncate_body(&long).len(), MAX_CAPTURED_BODY_BYTES);

        // Multi-byte character straddling the cut point must not split.
        let mut tricky = "x".repeat(MAX_CAPTURED_BODY_BYTES - 1);
        tricky.push('é');
        tricky.push_str("tail");
        let truncated = truncate_body(&tricky);
        assert!(truncated.len() <= MAX_CAPTURED_BODY_BYTES);
        assert!(truncated.is_char_boundary(truncated.len()));
    }

    #[test]
    fn attempt_headers_are_hidden_from_serialized_views() {
        let attempt = DeliveryAttempt {
            id: "att-1".to_string(),
            event_id: "evt-1".to_string(),
            attempt_number: 1,
            timestamp: Utc::now(),
            http_status: Some(200),
            response_time_ms: 42,
            success: true,
            error: None,
            response_body: None,
            request_headers: Some(BTreeMap::from([(
                "X-Webhook-Signature".to_string(),
                "sha256=abcd".to_string(),
            )])),
            response_headers: None,
        };

        let json = serde_json::to_string(&attempt).expect("serialize");
        assert!(!json.contains("X-Webhook-Signature"));
        assert!(!json.contains("request_headers"));
    }

    #[test]
    fn stats_accumulate_and_derive() {
        let now = Utc::now();
        let mut stats = DeliveryStats::new("sub-1", stats_period(now));

        stats.apply(&StatsDelta { delivered: true, response_time_ms: 100, at: now });
        stats.apply(&StatsDelta { delivered: true, response_time_ms: 300, at: now });
        stats.apply(&StatsDelta { delivered: false, response_time_ms: 200, at: now });

        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.delivered_events, 2);
        assert_eq!(stats.failed_events, 1);
        assert!((stats.average_response_time_ms() - 200.0).abs() < f64::EPSILON);
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.last_successful_delivery, Some(now));
    }

    #[test]
    fn stats_period_is_a_utc_day_bucket() {
        let at = chrono::DateTime::parse_from_rfc3339("2026-08-01T23:59:59Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(stats_period(at), "2026-08-01");
    }

    #[test]
    fn envelope_key_order_is_fixed() {
        let json = envelope().to_canonical_json().expect("serialize");
        insta::assert_snapshot!(
            json,
            @r#"{"event":{"id":"evt-1","timestamp":1700000000000,"type":"issue.created","action":"created","objectId":"I-1","objectClass":"issue"},"workspace":"acme","modifiedBy":"user-7","data":{"action":"created","object":{"title":"Boot"}}}"#
        );
    }

    #[test]
    fn envelope_serialization_is_deterministic() {
        let a = envelope().to_canonical_json().expect("serialize");
        let b = envelope().to_canonical_json().expect("serialize");
        assert_eq!(a, b);
    }

    #[test]
    fn deleted_envelope_carries_explicit_null_object() {
        let env = EventEnvelope {
            event: EnvelopeEvent {
                id: "evt-2".to_string(),
                timestamp: 1_700_000_000_000,
                kind: EventKind::new(DocumentClass::Project, ChangeAction::Deleted),
                action: ChangeAction::Deleted,
                object_id: "P-1".to_string(),
                object_class: DocumentClass::Project,
            },
            workspace: "acme".to_string(),
            modified_by: "user-7".to_string(),
            data: EnvelopeData {
                action: ChangeAction::Deleted,
                object: None,
                operations: None,
            },
        };

        let json = env.to_canonical_json().expect("serialize");
        assert!(json.contains("\"object\":null"));
        assert!(!json.contains("operations"));
    }

    #[test]
    fn envelope_roundtrips() {
        let env = envelope();
        let json = env.to_canonical_json().expect("serialize");
        let back: EventEnvelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, env);
    }

    proptest::proptest! {
        #[test]
        fn truncation_never_exceeds_cap_or_splits_chars(body in "\\PC*") {
            let truncated = truncate_body(&body);
            proptest::prop_assert!(truncated.len() <= MAX_CAPTURED_BODY_BYTES);
            proptest::prop_assert!(truncated.is_char_boundary(truncated.len()));
            proptest::prop_assert!(body.starts_with(&truncated));
        }
    }
}
