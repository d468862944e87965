//! Delivery scheduling: the state-machine driver for pending events.
//!
//! One control loop polls the store for due events and admits them to a
//! bounded worker pool under three gates:
//!
//! 1. **Per-endpoint serialization** — at most one in-flight attempt per
//!    subscription URL, which (with due events ordered by readiness and
//!    creation) keeps deliveries for the same object in creation order.
//! 2. **Rate limiting** — a sliding window of attempt starts per URL;
//!    events over the limit are deferred to the window's earliest exit.
//! 3. **Optimistic admission** — a compare-and-set on `(status, attempts)`
//!    transitions the event to `in-flight`, so no two workers can ever hold
//!    the same event.
//!
//! Workers run one dispatch each and record the outcome: `delivered`,
//! `failed-retryable` with exponential backoff (or a server-provided
//! `Retry-After`, or the breaker's remaining open window), or
//! `dead-lettered` when failure is permanent or retries are exhausted.
//!
//! `stop()` stops admissions immediately and gives in-flight workers a
//! drain deadline; a worker cancelled mid-attempt records a cancellation
//! attempt and rolls its event back to `failed-retryable`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_breaker::BreakerManager;
use courier_clock::SharedClock;
use courier_dispatch::{AttemptOutcome, Dispatcher};
use courier_retry::{BackoffConfig, backoff_delay};
use courier_store::{EventStore, EventUpdate, SubscriptionStore, UpdateOutcome};
use courier_types::{
    DeliveryAttempt, Event, EventStatus, StatsDelta, Subscription, stats_period,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CANCELLED_ERROR: &str = "delivery cancelled by shutdown";
const SUBSCRIPTION_GONE: &str = "subscription gone";
const RETRIES_EXHAUSTED: &str = "retries exhausted";

fn default_max_workers() -> usize {
    8
}

fn default_fetch_batch() -> usize {
    100
}

fn default_poll_busy() -> Duration {
    Duration::from_millis(100)
}

fn default_poll_idle() -> Duration {
    Duration::from_secs(2)
}

fn default_drain_deadline() -> Duration {
    Duration::from_secs(30)
}

/// Scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on concurrent delivery workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Due events fetched per poll.
    #[serde(default = "default_fetch_batch")]
    pub fetch_batch: usize,
    /// Poll cadence while work was admitted last tick.
    #[serde(default = "default_poll_busy", with = "humantime_serde")]
    pub poll_busy: Duration,
    /// Poll cadence while idle.
    #[serde(default = "default_poll_idle", with = "humantime_serde")]
    pub poll_idle: Duration,
    /// How long `stop()` waits for in-flight workers before cancelling them.
    #[serde(default = "default_drain_deadline", with = "humantime_serde")]
    pub drain_deadline: Duration,
    /// Retry backoff parameters.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            fetch_batch: default_fetch_batch(),
            poll_busy: default_poll_busy(),
            poll_idle: default_poll_idle(),
            drain_deadline: default_drain_deadline(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Operator-facing scheduler state snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerHealth {
    pub running: bool,
    /// Endpoints with an attempt currently in flight.
    pub in_flight: usize,
    pub last_poll: Option<DateTime<Utc>>,
    /// Most recent store failure, if any.
    pub last_error: Option<String>,
}

struct HealthInner {
    running: bool,
    last_poll: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct Shared {
    store: Arc<dyn EventStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    dispatcher: Arc<Dispatcher>,
    breakers: Arc<BreakerManager>,
    clock: SharedClock,
    config: SchedulerConfig,
    busy_urls: Mutex<HashSet<String>>,
    health: Mutex<HealthInner>,
}

struct ControlHandles {
    shutdown: CancellationToken,
    nudge: mpsc::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

/// Drives events through their state machine toward terminality.
pub struct DeliveryScheduler {
    shared: Arc<Shared>,
    control: Mutex<Option<ControlHandles>>,
}

impl DeliveryScheduler {
    pub fn new(
        store: Arc<dyn EventStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        dispatcher: Arc<Dispatcher>,
        breakers: Arc<BreakerManager>,
        clock: SharedClock,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                subscriptions,
                dispatcher,
                breakers,
                clock,
                config,
                busy_urls: Mutex::new(HashSet::new()),
                health: Mutex::new(HealthInner {
                    running: false,
                    last_poll: None,
                    last_error: None,
                }),
            }),
            control: Mutex::new(None),
        }
    }

    /// Start the control loop. Idempotent.
    pub fn start(&self) {
        let mut control = self.control.lock().unwrap();
        if control.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        let (nudge_tx, nudge_rx) = mpsc::channel(64);
        self.shared.health.lock().unwrap().running = true;
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.shared),
            shutdown.clone(),
            nudge_rx,
        ));
        *control = Some(ControlHandles { shutdown, nudge: nudge_tx, handle });
        tracing::info!("delivery scheduler started");
    }

    /// Stop admissions and drain in-flight workers. Idempotent.
    pub async fn stop(&self) {
        let handles = self.control.lock().unwrap().take();
        let Some(ControlHandles { shutdown, nudge, handle }) = handles else {
            return;
        };
        shutdown.cancel();
        let mut handle = handle;
        let grace = self.shared.config.drain_deadline + Duration::from_secs(5);
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            tracing::warn!("scheduler loop exceeded the drain deadline, aborting");
            handle.abort();
            self.shared.health.lock().unwrap().running = false;
        }
        drop(nudge);
        tracing::info!("delivery scheduler stopped");
    }

    /// Fast path for a just-persisted event: skip the poll latency.
    pub fn enqueue(&self, event: &Event) {
        tracing::debug!(event_id = %event.id, "enqueue fast path");
        if let Some(handles) = &*self.control.lock().unwrap() {
            let _ = handles.nudge.try_send(());
        }
    }

    pub fn health(&self) -> SchedulerHealth {
        let inner = self.shared.health.lock().unwrap();
        SchedulerHealth {
            running: inner.running,
            in_flight: self.shared.busy_urls.lock().unwrap().len(),
            last_poll: inner.last_poll,
            last_error: inner.last_error.clone(),
        }
    }
}

fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    at + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
}

/// Earliest instant at which the URL's sliding window frees a slot, or
/// `None` while the window still has room. Expired entries are pruned.
fn rate_limit_exit(
    window: &mut VecDeque<DateTime<Utc>>,
    rate_limit: u32,
    period: Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    while let Some(oldest) = window.front() {
        if after(*oldest, period) <= now {
            window.pop_front();
        } else {
            break;
        }
    }
    if window.len() >= rate_limit as usize {
        window.front().map(|oldest| after(*oldest, period))
    } else {
        None
    }
}

async fn run_loop(shared: Arc<Shared>, shutdown: CancellationToken, mut nudge_rx: mpsc::Receiver<()>) {
    let abort = CancellationToken::new();
    let semaphore = Arc::new(Semaphore::new(shared.config.max_workers.max(1)));
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut windows: HashMap<String, VecDeque<DateTime<Utc>>> = HashMap::new();

    loop {
        while workers.try_join_next().is_some() {}

        let admitted = tick(&shared, &semaphore, &mut workers, &mut windows, &shutdown, &abort).await;

        let pause = if admitted {
            shared.config.poll_busy
        } else {
            shared.config.poll_idle
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
            Some(_) = nudge_rx.recv() => {}
        }
    }

    // Drain phase: no new admissions. In-flight workers get until the
    // deadline, then the abort token turns their attempts into recorded
    // cancellations.
    let deadline = tokio::time::sleep(shared.config.drain_deadline);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            joined = workers.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
            _ = &mut deadline => {
                tracing::warn!("drain deadline reached, cancelling in-flight deliveries");
                abort.cancel();
                while workers.join_next().await.is_some() {}
                break;
            }
        }
    }
    shared.health.lock().unwrap().running = false;
}

/// One scheduling pass. Returns whether any event was admitted.
async fn tick(
    shared: &Arc<Shared>,
    semaphore: &Arc<Semaphore>,
    workers: &mut JoinSet<()>,
    windows: &mut HashMap<String, VecDeque<DateTime<Utc>>>,
    shutdown: &CancellationToken,
    abort: &CancellationToken,
) -> bool {
    let now = shared.clock.now();
    shared.health.lock().unwrap().last_poll = Some(now);

    let due = match shared.store.find_due(now, shared.config.fetch_batch).await {
        Ok(due) => due,
        Err(error) => {
            tracing::warn!(error = %error, "failed to poll due events");
            shared.health.lock().unwrap().last_error = Some(error.to_string());
            return false;
        }
    };
    if due.is_empty() {
        return false;
    }
    tracing::debug!(count = due.len(), "found due events");

    let mut subs_cache: HashMap<String, Option<Subscription>> = HashMap::new();
    // One computed exit per URL per tick, so every deferred event of that
    // URL lands on the same next_attempt_after and creation order survives.
    let mut rate_exits: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut admitted = false;

    for event in due {
        if shutdown.is_cancelled() {
            break;
        }

        let sub = match subs_cache.get(&event.subscription_id) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = match shared.subscriptions.get(&event.subscription_id).await {
                    Ok(sub) => sub,
                    Err(error) => {
                        tracing::warn!(
                            event_id = %event.id,
                            subscription = %event.subscription_id,
                            error = %error,
                            "failed to load subscription, leaving event queued"
                        );
                        continue;
                    }
                };
                subs_cache.insert(event.subscription_id.clone(), fetched.clone());
                fetched
            }
        };
        let Some(sub) = sub.filter(|s| s.enabled) else {
            dead_letter(shared, &event, SUBSCRIPTION_GONE).await;
            continue;
        };

        // Per-endpoint serialization: one in-flight attempt per URL.
        if shared.busy_urls.lock().unwrap().contains(&sub.url) {
            continue;
        }

        if sub.rate_limit > 0 {
            let exit = match rate_exits.get(&sub.url) {
                Some(exit) => Some(*exit),
                None => rate_limit_exit(
                    windows.entry(sub.url.clone()).or_default(),
                    sub.rate_limit,
                    sub.rate_limit_period,
                    now,
                ),
            };
            if let Some(exit) = exit {
                rate_exits.insert(sub.url.clone(), exit);
                defer(shared, &event, exit).await;
                continue;
            }
        }

        let permit = tokio::select! {
            permit = Arc::clone(semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.cancelled() => break,
        };

        // A cancelled final attempt leaves a failed-retryable event with an
        // exhausted budget; it terminates here instead of re-admitting.
        if event.attempts >= sub.retry_attempts + 1 {
            dead_letter(shared, &event, RETRIES_EXHAUSTED).await;
            continue;
        }

        let admit = EventUpdate {
            status: Some(EventStatus::InFlight),
            attempts: Some(event.attempts + 1),
            last_attempted_on: Some(now),
            ..EventUpdate::default()
        };
        match shared
            .store
            .update_event(&event.id, event.status, event.attempts, admit)
            .await
        {
            Ok(UpdateOutcome::Updated) => {}
            Ok(UpdateOutcome::Conflict) => {
                tracing::debug!(event_id = %event.id, "admission lost to a concurrent writer");
                continue;
            }
            Err(error) => {
                tracing::warn!(event_id = %event.id, error = %error, "failed to admit event");
                shared.health.lock().unwrap().last_error = Some(error.to_string());
                continue;
            }
        }

        shared.busy_urls.lock().unwrap().insert(sub.url.clone());
        if sub.rate_limit > 0 {
            windows.entry(sub.url.clone()).or_default().push_back(now);
        }

        let mut claimed = event;
        claimed.status = EventStatus::InFlight;
        claimed.attempts += 1;
        claimed.last_attempted_on = Some(now);

        admitted = true;
        let shared = Arc::clone(shared);
        let abort = abort.clone();
        workers.spawn(async move {
            let _permit = permit;
            run_worker(shared, claimed, sub, abort).await;
        });
    }
    admitted
}

async fn run_worker(shared: Arc<Shared>, event: Event, sub: Subscription, abort: CancellationToken) {
    let breaker = shared.breakers.breaker(&sub.url);
    let result = tokio::select! {
        result = shared.dispatcher.dispatch(&event, &sub, &breaker) => Some(result),
        _ = abort.cancelled() => None,
    };
    match result {
        Some((outcome, attempt)) => finish_attempt(&shared, &event, &sub, outcome, attempt).await,
        None => cancel_attempt(&shared, &event).await,
    }
    shared.busy_urls.lock().unwrap().remove(&sub.url);
}

async fn finish_attempt(
    shared: &Shared,
    event: &Event,
    sub: &Subscription,
    outcome: AttemptOutcome,
    attempt: DeliveryAttempt,
) {
    let now = shared.clock.now();
    let response_time_ms = attempt.response_time_ms;

    if let Err(error) = shared.store.insert_attempt(attempt).await {
        tracing::warn!(event_id = %event.id, error = %error, "failed to record delivery attempt");
    }
    // Stats are best-effort.
    let delta = StatsDelta {
        delivered: outcome.is_success(),
        response_time_ms,
        at: now,
    };
    if let Err(error) = shared
        .store
        .upsert_stats(&sub.id, &stats_period(now), delta)
        .await
    {
        tracing::debug!(subscription = %sub.id, error = %error, "failed to update delivery stats");
    }

    let retries_left = event.attempts < sub.retry_attempts + 1;
    let (status, next_attempt_after, last_error) = match outcome {
        AttemptOutcome::Delivered { http_status } => {
            tracing::debug!(event_id = %event.id, status = http_status, "webhook delivered");
            (EventStatus::Delivered, None, None)
        }
        AttemptOutcome::Retryable { error, retry_after, .. } if retries_left => {
            let delay = retry_after
                .map(|hint| hint.min(shared.config.backoff.max_delay))
                .unwrap_or_else(|| backoff_delay(&shared.config.backoff, event.attempts));
            tracing::debug!(
                event_id = %event.id,
                attempt = event.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "delivery failed, retry scheduled"
            );
            (EventStatus::FailedRetryable, Some(after(now, delay)), Some(error))
        }
        AttemptOutcome::BreakerOpen { retry_in } if retries_left => {
            tracing::debug!(
                event_id = %event.id,
                retry_in_ms = retry_in.as_millis() as u64,
                "circuit breaker open, retry deferred to window close"
            );
            (
                EventStatus::FailedRetryable,
                Some(after(now, retry_in)),
                Some("circuit breaker open".to_string()),
            )
        }
        AttemptOutcome::Retryable { error, .. } => {
            tracing::warn!(event_id = %event.id, error = %error, "retries exhausted, dead-lettering");
            (EventStatus::DeadLettered, None, Some(error))
        }
        AttemptOutcome::BreakerOpen { .. } => {
            tracing::warn!(event_id = %event.id, "circuit breaker open on final attempt, dead-lettering");
            (EventStatus::DeadLettered, None, Some("circuit breaker open".to_string()))
        }
        AttemptOutcome::Permanent { error, .. } => {
            tracing::warn!(event_id = %event.id, error = %error, "permanent failure, dead-lettering");
            (EventStatus::DeadLettered, None, Some(error))
        }
    };

    let update = EventUpdate {
        status: Some(status),
        next_attempt_after,
        last_error: last_error.map(Some),
        ..EventUpdate::default()
    };
    match shared
        .store
        .update_event(&event.id, EventStatus::InFlight, event.attempts, update)
        .await
    {
        Ok(UpdateOutcome::Updated) => {}
        Ok(UpdateOutcome::Conflict) => {
            tracing::warn!(event_id = %event.id, "event changed under an in-flight worker");
        }
        Err(error) => {
            tracing::warn!(event_id = %event.id, error = %error, "failed to record delivery outcome");
        }
    }
}

/// Shutdown reached an attempt before its HTTP call returned: record the
/// cancellation and roll the event back to retryable with a small backoff.
async fn cancel_attempt(shared: &Shared, event: &Event) {
    let now = shared.clock.now();
    let attempt = DeliveryAttempt {
        id: Uuid::new_v4().to_string(),
        event_id: event.id.clone(),
        attempt_number: event.attempts,
        timestamp: now,
        http_status: None,
        response_time_ms: 0,
        success: false,
        error: Some(CANCELLED_ERROR.to_string()),
        response_body: None,
        request_headers: None,
        response_headers: None,
    };
    if let Err(error) = shared.store.insert_attempt(attempt).await {
        tracing::warn!(event_id = %event.id, error = %error, "failed to record cancelled attempt");
    }

    let update = EventUpdate {
        status: Some(EventStatus::FailedRetryable),
        next_attempt_after: Some(after(now, shared.config.backoff.base_delay)),
        last_error: Some(Some(CANCELLED_ERROR.to_string())),
        ..EventUpdate::default()
    };
    match shared
        .store
        .update_event(&event.id, EventStatus::InFlight, event.attempts, update)
        .await
    {
        Ok(UpdateOutcome::Updated) => {
            tracing::debug!(event_id = %event.id, "attempt cancelled by shutdown, event rolled back");
        }
        Ok(UpdateOutcome::Conflict) => {
            tracing::warn!(event_id = %event.id, "cancelled event changed under the worker");
        }
        Err(error) => {
            tracing::warn!(event_id = %event.id, error = %error, "failed to roll back cancelled event");
        }
    }
}

async fn dead_letter(shared: &Shared, event: &Event, reason: &str) {
    tracing::warn!(event_id = %event.id, reason, "dead-lettering event");
    let update = EventUpdate {
        status: Some(EventStatus::DeadLettered),
        last_error: Some(Some(reason.to_string())),
        ..EventUpdate::default()
    };
    match shared
        .store
        .update_event(&event.id, event.status, event.attempts, update)
        .await
    {
        Ok(UpdateOutcome::Updated) => {}
        Ok(UpdateOutcome::Conflict) => {
            tracing::debug!(event_id = %event.id, "dead-letter lost to a concurrent writer");
        }
        Err(error) => {
            tracing::warn!(event_id = %event.id, error = %error, "failed to dead-letter event");
        }
    }
}

/// Defer an event to a rate-limit window exit without consuming an attempt.
async fn defer(shared: &Shared, event: &Event, until: DateTime<Utc>) {
    tracing::debug!(event_id = %event.id, until = %until, "rate limited, deferring");
    let update = EventUpdate {
        next_attempt_after: Some(until),
        ..EventUpdate::default()
    };
    match shared
        .store
        .update_event(&event.id, event.status, event.attempts, update)
        .await
    {
        Ok(UpdateOutcome::Updated) => {}
        Ok(UpdateOutcome::Conflict) => {
            tracing::debug!(event_id = %event.id, "deferral lost to a concurrent writer");
        }
        Err(error) => {
            tracing::warn!(event_id = %event.id, error = %error, "failed to defer event");
        }
    }
}
