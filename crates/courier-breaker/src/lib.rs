//! Per-endpoint circuit breakers for webhook delivery.
//!
//! Each endpoint URL gets one [`CircuitBreaker`] with three states:
//! `closed` (requests flow), `open` (requests are rejected fast), and
//! `half-open` (probing recovery). The breaker is response-time aware: a
//! slow 2xx counts as a failure, and a moving average over the last 100
//! observations can trip the breaker even when every request "succeeds".
//!
//! Breakers are advisory for the scheduler (a rejection is just another
//! retryable outcome) but authoritative inside the dispatcher: every
//! outbound call goes through [`CircuitBreaker::try_acquire`] /
//! `record_*`, or the combined [`CircuitBreaker::execute`] contract.
//!
//! [`BreakerManager`] owns one breaker per URL plus an optional background
//! health-check task driven by a pluggable [`HealthProbe`]. The probe is
//! disabled until an operator configures one.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_clock::SharedClock;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Size of the response-time ring buffer.
pub const RESPONSE_TIME_SAMPLES: usize = 100;

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_open_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_request_volume_threshold() -> u32 {
    10
}

fn default_response_time_threshold() -> Duration {
    Duration::from_secs(10)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

/// Per-endpoint breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes that re-close the breaker.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long the breaker stays open before probing.
    #[serde(default = "default_open_duration", with = "humantime_serde")]
    pub open_duration: Duration,
    /// Minimum requests seen before the trip condition is evaluated.
    #[serde(default = "default_request_volume_threshold")]
    pub request_volume_threshold: u32,
    /// A response slower than this counts as a failure even on 2xx.
    #[serde(default = "default_response_time_threshold", with = "humantime_serde")]
    pub response_time_threshold: Duration,
    /// Cadence of the background health probe, when one is configured.
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_duration: default_open_duration(),
            request_volume_threshold: default_request_volume_threshold(),
            response_time_threshold: default_response_time_threshold(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time breaker observation, carried on [`BreakerOpen`] and
/// exposed through health views.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    /// Mean of the response-time ring buffer; `None` while empty.
    pub mean_response_time_ms: Option<u64>,
    /// Remaining open window; `None` unless state is `open`.
    pub open_remaining_ms: Option<u64>,
}

/// Distinguished rejection returned while the breaker is open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit breaker open; retry in {retry_in:?}")]
pub struct BreakerOpen {
    /// Remaining open window at rejection time.
    pub retry_in: Duration,
    pub metrics: BreakerMetrics,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u64,
    opened_at: Option<DateTime<Utc>>,
    samples: VecDeque<Duration>,
}

/// Fast-fail gate for one endpoint URL.
pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                total_requests: 0,
                opened_at: None,
                samples: VecDeque::with_capacity(RESPONSE_TIME_SAMPLES),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock().unwrap();
        self.metrics_locked(&inner, self.clock.now())
    }

    /// Admit one request, or reject fast while the open window holds.
    ///
    /// An expired open window transitions the breaker to half-open and
    /// admits the caller as the recovery probe.
    pub fn try_acquire(&self) -> Result<(), BreakerOpen> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let now = self.clock.now();
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = (now - opened_at).to_std().unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_duration {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    tracing::info!(endpoint = %self.endpoint, "circuit breaker half-open");
                    Ok(())
                } else {
                    Err(BreakerOpen {
                        retry_in: self.config.open_duration - elapsed,
                        metrics: self.metrics_locked(&inner, now),
                    })
                }
            }
        }
    }

    /// Record a completed request that returned a success.
    ///
    /// A response slower than `response_time_threshold` is accounted as a
    /// failure regardless.
    pub fn record_success(&self, response_time: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_requests += 1;
        push_sample(&mut inner.samples, response_time);

        if response_time > self.config.response_time_threshold {
            self.note_failure(&mut inner);
            return;
        }

        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;
        match inner.state {
            BreakerState::HalfOpen => {
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.close(&mut inner);
                }
            }
            BreakerState::Closed => self.evaluate_trip(&mut inner),
            BreakerState::Open => {}
        }
    }

    /// Record a completed request that failed (non-2xx, network error,
    /// timeout). `response_time` feeds the moving average when known.
    pub fn record_failure(&self, response_time: Option<Duration>) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_requests += 1;
        if let Some(elapsed) = response_time {
            push_sample(&mut inner.samples, elapsed);
        }
        self.note_failure(&mut inner);
    }

    /// An external health probe saw the endpoint healthy.
    pub fn note_probe_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::Open {
            inner.state = BreakerState::HalfOpen;
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            tracing::info!(endpoint = %self.endpoint, "health probe succeeded, circuit breaker half-open");
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Either `op` runs and its outcome is recorded (with its wall time as
    /// the response-time observation), or, while the open window holds, the
    /// call returns immediately with [`BreakerOpen`] and `op` is never
    /// started.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<Result<T, E>, BreakerOpen>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire()?;
        let started = Instant::now();
        let result = op().await;
        let elapsed = started.elapsed();
        match &result {
            Ok(_) => self.record_success(elapsed),
            Err(_) => self.record_failure(Some(elapsed)),
        }
        Ok(result)
    }

    fn note_failure(&self, inner: &mut Inner) {
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::HalfOpen => self.trip(inner),
            BreakerState::Closed => self.evaluate_trip(inner),
            BreakerState::Open => {}
        }
    }

    fn evaluate_trip(&self, inner: &mut Inner) {
        if inner.total_requests < u64::from(self.config.request_volume_threshold) {
            return;
        }
        let slow = mean_response_time(&inner.samples)
            .is_some_and(|mean| mean > self.config.response_time_threshold);
        if inner.consecutive_failures >= self.config.failure_threshold || slow {
            self.trip(inner);
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(self.clock.now());
        inner.consecutive_successes = 0;
        tracing::warn!(
            endpoint = %self.endpoint,
            consecutive_failures = inner.consecutive_failures,
            "circuit breaker open"
        );
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.total_requests = 0;
        inner.opened_at = None;
        inner.samples.clear();
        tracing::info!(endpoint = %self.endpoint, "circuit breaker closed");
    }

    fn metrics_locked(&self, inner: &Inner, now: DateTime<Utc>) -> BreakerMetrics {
        let open_remaining_ms = match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened_at)) => {
                let elapsed = (now - opened_at).to_std().unwrap_or(Duration::ZERO);
                Some(
                    self.config
                        .open_duration
                        .saturating_sub(elapsed)
                        .as_millis() as u64,
                )
            }
            _ => None,
        };
        BreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_requests: inner.total_requests,
            mean_response_time_ms: mean_response_time(&inner.samples)
                .map(|d| d.as_millis() as u64),
            open_remaining_ms,
        }
    }
}

fn push_sample(samples: &mut VecDeque<Duration>, sample: Duration) {
    if samples.len() == RESPONSE_TIME_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(sample);
}

fn mean_response_time(samples: &VecDeque<Duration>) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let total: u128 = samples.iter().map(|d| d.as_millis()).sum();
    Some(Duration::from_millis((total / samples.len() as u128) as u64))
}

/// Decides whether an endpoint looks healthy; used to move an open breaker
/// to half-open ahead of its window.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, url: &str) -> bool;
}

/// Owns one [`CircuitBreaker`] per endpoint URL, plus the optional
/// background health-check task.
pub struct BreakerManager {
    config: BreakerConfig,
    clock: SharedClock,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    probe: Option<Arc<dyn HealthProbe>>,
    cancel: CancellationToken,
    probe_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BreakerManager {
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: Arc::new(DashMap::new()),
            probe: None,
            cancel: CancellationToken::new(),
            probe_task: Mutex::new(None),
        }
    }

    /// Configure a health probe. Without one, health checks stay disabled.
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// The breaker for `url`, created on first use.
    pub fn breaker(&self, url: &str) -> Arc<CircuitBreaker> {
        let entry = self.breakers.entry(url.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                url,
                self.config.clone(),
                self.clock.clone(),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Current metrics for every known endpoint.
    pub fn snapshot(&self) -> Vec<(String, BreakerMetrics)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect()
    }

    /// Start the background health-check task. No-op without a probe, and
    /// idempotent.
    pub fn start_health_checks(&self) {
        let Some(probe) = self.probe.clone() else {
            return;
        };
        let mut guard = self.probe_task.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let breakers = Arc::clone(&self.breakers);
        let cancel = self.cancel.clone();
        let interval = self.config.health_check_interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let open: Vec<(String, Arc<CircuitBreaker>)> = breakers
                    .iter()
                    .filter(|entry| entry.value().state() == BreakerState::Open)
                    .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
                    .collect();
                for (url, breaker) in open {
                    if probe.check(&url).await {
                        breaker.note_probe_success();
                    } else {
                        tracing::debug!(endpoint = %url, "health probe failed, breaker stays open");
                    }
                }
            }
        }));
    }

    /// Stop the health-check task. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.probe_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for BreakerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
