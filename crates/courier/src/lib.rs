//! # Courier
//!
//! A reliable webhook delivery engine for document collaboration platforms.
//!
//! Courier observes document-change transactions supplied by a host
//! platform and delivers HTTP notifications to operator-configured
//! endpoints with at-least-once semantics, per-endpoint serialization,
//! exponential backoff, HMAC signing, rate limiting, and circuit breaking.
//!
//! ## Pipeline
//!
//! The core flow is **translate → schedule → dispatch**, gated per endpoint
//! by a circuit breaker:
//!
//! 1. [`Trigger::translate`] turns each transaction batch into pending
//!    [`Event`]s, one per `(transaction, matching subscription)` pair,
//!    carrying the canonical signed payload.
//! 2. [`DeliveryScheduler`] polls due events and admits them to a bounded
//!    worker pool: one in-flight attempt per endpoint URL, sliding-window
//!    rate limits, optimistic `in-flight` claims.
//! 3. [`Dispatcher`] performs one signed HTTP POST per attempt with a hard
//!    timeout and records a [`DeliveryAttempt`] audit row.
//! 4. [`BreakerManager`] holds one [`CircuitBreaker`] per endpoint; open
//!    breakers fail fast and their events are deferred to the window close.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use courier::{CourierConfig, MemoryStore, WebhookService, system_clock};
//!
//! let store = Arc::new(MemoryStore::new());
//! let service = WebhookService::new(
//!     store.clone(),
//!     store,
//!     CourierConfig::default(),
//!     system_clock(),
//! )?;
//! service.start();
//!
//! // Host platform callback:
//! // let events = service.handle_transactions(&batch, &control).await?;
//! ```
//!
//! ## Key Types
//!
//! - [`Subscription`] — A configured delivery target: URL, secret, filters, limits
//! - [`Event`] — One pending or completed notification for one subscription
//! - [`DeliveryAttempt`] — Audit record of a single HTTP try
//! - [`EventEnvelope`] — The canonical wire payload; key order is the contract
//! - [`WebhookService`] — Composition root wiring all of the above
//!
//! ## Modules
//!
//! - [`config`] — Configuration file (`.courier.toml`) loading
//! - [`service`] — Service composition and the host trigger callback

pub mod config;
pub mod service;

pub use config::{CONFIG_FILE, CourierConfig, config_path, load_config};
pub use service::WebhookService;

pub use courier_breaker::{
    BreakerConfig, BreakerManager, BreakerMetrics, BreakerOpen, BreakerState, CircuitBreaker,
    HealthProbe, RESPONSE_TIME_SAMPLES,
};
pub use courier_clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use courier_dispatch::{AttemptOutcome, Dispatcher, EVENT_HEADER, ID_HEADER};
pub use courier_retry::{
    BackoffConfig, ErrorClass, backoff_delay, classify_http_status, parse_retry_after,
};
pub use courier_scheduler::{DeliveryScheduler, SchedulerConfig, SchedulerHealth};
pub use courier_signature::{SIGNATURE_HEADER, SIGNATURE_PREFIX, sign, verify};
pub use courier_store::{
    EventStore, EventUpdate, MemoryStore, StoreError, SubscriptionStore, UpdateOutcome,
};
pub use courier_trigger::{
    ChangeTx, PlatformControl, Trigger, TxDetail, WorkspaceInfo, observed_class,
};
pub use courier_types::{
    ChangeAction, ConfigError, DeliveryAttempt, DeliveryStats, DocumentClass, EnvelopeData,
    EnvelopeEvent, Event, EventEnvelope, EventKind, EventStatus, MAX_CAPTURED_BODY_BYTES,
    StatsDelta, Subscription, UnknownEventKind, stats_period, truncate_body,
};
