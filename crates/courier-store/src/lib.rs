//! Store abstraction for events, delivery attempts, and stats.
//!
//! The delivery core persists through two narrow traits so any durable
//! backend can plug in: [`EventStore`] for the event state machine and its
//! audit trail, [`SubscriptionStore`] for operator-managed webhook
//! configuration. [`MemoryStore`] implements both and backs the test
//! suites and embedded deployments.
//!
//! Event mutation is optimistic: [`EventStore::update_event`] is a
//! compare-and-set on `(id, status, attempts)` and reports
//! [`UpdateOutcome::Conflict`] instead of clobbering concurrent writers.
//! This is what guarantees that no two workers ever hold the same event.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_types::{
    DeliveryAttempt, DeliveryStats, Event, EventStatus, StatsDelta, Subscription,
};

/// Store failures. Losing stats is tolerable; events and attempts are not.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("event not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization failure: {0}")]
    Serialization(String),
}

/// Result of a conditional event update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The stored `(status, attempts)` no longer matched; nothing changed.
    Conflict,
}

/// Field changes applied by a successful [`EventStore::update_event`].
///
/// `None` leaves a field untouched; `last_error: Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct EventUpdate {
    pub status: Option<EventStatus>,
    pub attempts: Option<u32>,
    pub last_attempted_on: Option<DateTime<Utc>>,
    pub next_attempt_after: Option<DateTime<Utc>>,
    pub last_error: Option<Option<String>>,
}

/// Durable home of events, delivery attempts, and rolling stats.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event(&self, event: Event) -> Result<(), StoreError>;

    /// Compare-and-set on `(id, expect_status, expect_attempts)`.
    async fn update_event(
        &self,
        id: &str,
        expect_status: EventStatus,
        expect_attempts: u32,
        update: EventUpdate,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Events in `pending` or `failed-retryable` whose `next_attempt_after`
    /// has passed, ordered by `(next_attempt_after, created_on)` ascending.
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Event>, StoreError>;

    async fn insert_attempt(&self, attempt: DeliveryAttempt) -> Result<(), StoreError>;

    /// Merge `delta` into the `(subscription, period)` counters.
    async fn upsert_stats(
        &self,
        subscription_id: &str,
        period: &str,
        delta: StatsDelta,
    ) -> Result<(), StoreError>;

    async fn get_event(&self, id: &str) -> Result<Option<Event>, StoreError>;

    /// Attempts for one event, ordered by attempt number.
    async fn attempts_for(&self, event_id: &str) -> Result<Vec<DeliveryAttempt>, StoreError>;

    async fn stats_for(
        &self,
        subscription_id: &str,
        period: &str,
    ) -> Result<Option<DeliveryStats>, StoreError>;
}

/// Read access to operator-managed webhook configuration.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Subscription>, StoreError>;

    /// Enabled subscriptions, newest `modified_on` first.
    async fn list_enabled(&self) -> Result<Vec<Subscription>, StoreError>;
}

/// In-memory implementation of both store traits.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<BTreeMap<String, Event>>,
    attempts: Mutex<Vec<DeliveryAttempt>>,
    stats: Mutex<BTreeMap<(String, String), DeliveryStats>>,
    subscriptions: Mutex<BTreeMap<String, Subscription>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription);
    }

    pub fn remove_subscription(&self, id: &str) {
        self.subscriptions.lock().unwrap().remove(id);
    }

    pub fn set_subscription_enabled(&self, id: &str, enabled: bool) {
        if let Some(sub) = self.subscriptions.lock().unwrap().get_mut(id) {
            sub.enabled = enabled;
        }
    }

    /// Number of stored events, regardless of status.
    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, event: Event) -> Result<(), StoreError> {
        self.events.lock().unwrap().insert(event.id.clone(), event);
        Ok(())
    }

    async fn update_event(
        &self,
        id: &str,
        expect_status: EventStatus,
        expect_attempts: u32,
        update: EventUpdate,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut events = self.events.lock().unwrap();
        let event = events
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if event.status != expect_status || event.attempts != expect_attempts {
            return Ok(UpdateOutcome::Conflict);
        }

        if let Some(status) = update.status {
            event.status = status;
        }
        if let Some(attempts) = update.attempts {
            event.attempts = attempts;
        }
        if let Some(at) = update.last_attempted_on {
            event.last_attempted_on = Some(at);
        }
        if let Some(after) = update.next_attempt_after {
            event.next_attempt_after = after;
        }
        if let Some(error) = update.last_error {
            event.last_error = error;
        }
        Ok(UpdateOutcome::Updated)
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Event>, StoreError> {
        let events = self.events.lock().unwrap();
        let mut due: Vec<Event> = events
            .values()
            .filter(|e| {
                matches!(
                    e.status,
                    EventStatus::Pending | EventStatus::FailedRetryable
                ) && e.next_attempt_after <= now
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            (a.next_attempt_after, a.created_on, &a.id)
                .cmp(&(b.next_attempt_after, b.created_on, &b.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn insert_attempt(&self, attempt: DeliveryAttempt) -> Result<(), StoreError> {
        self.attempts.lock().unwrap().push(attempt);
        Ok(())
    }

    async fn upsert_stats(
        &self,
        subscription_id: &str,
        period: &str,
        delta: StatsDelta,
    ) -> Result<(), StoreError> {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats
            .entry((subscription_id.to_string(), period.to_string()))
            .or_insert_with(|| DeliveryStats::new(subscription_id, period));
        entry.apply(&delta);
        Ok(())
    }

    async fn get_event(&self, id: &str) -> Result<Option<Event>, StoreError> {
        Ok(self.events.lock().unwrap().get(id).cloned())
    }

    async fn attempts_for(&self, event_id: &str) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let mut attempts: Vec<DeliveryAttempt> = self
            .attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.event_id == event_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn stats_for(
        &self,
        subscription_id: &str,
        period: &str,
    ) -> Result<Option<DeliveryStats>, StoreError> {
        Ok(self
            .stats
            .lock()
            .unwrap()
            .get(&(subscription_id.to_string(), period.to_string()))
            .cloned())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.lock().unwrap().get(id).cloned())
    }

    async fn list_enabled(&self) -> Result<Vec<Subscription>, StoreError> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.modified_on.cmp(&a.modified_on));
        Ok(subs)
    }
}
