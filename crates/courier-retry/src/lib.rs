//! Backoff policies and delivery-outcome classification.
//!
//! The scheduler retries failed deliveries with exponential backoff and
//! jitter; this crate computes the delays and decides which HTTP outcomes
//! are worth retrying at all.
//!
//! # Example
//!
//! ```
//! use courier_retry::{BackoffConfig, ErrorClass, backoff_delay, classify_http_status};
//! use std::time::Duration;
//!
//! let config = BackoffConfig::default();
//! let delay = backoff_delay(&config, 3);
//! assert!(delay >= Duration::from_millis(3600)); // 4s - 10% jitter
//!
//! assert_eq!(classify_http_status(503), ErrorClass::Retryable);
//! assert_eq!(classify_http_status(401), ErrorClass::Permanent);
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a failed delivery outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Error is transient and the event should be retried
    Retryable,
    /// Error is permanent and the event dead-letters immediately
    Permanent,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_jitter() -> f64 {
    0.1
}

/// Configuration for exponential backoff between delivery attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry; doubles each attempt.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap on the computed delay; `Retry-After` hints are capped here too.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor (0.1 = delay * (0.9 to 1.1)).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Calculate the delay before the next attempt.
///
/// `attempt` is the number of attempts already started (1-indexed): after the
/// first failed attempt the delay is `base_delay`, after the second
/// `2 * base_delay`, and so on, capped at `max_delay` and spread by jitter.
pub fn backoff_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let delay = config
        .base_delay
        .saturating_mul(2_u32.saturating_pow(pow))
        .min(config.max_delay);
    apply_jitter(delay, config.jitter)
}

/// Apply jitter to a delay value.
/// Jitter factor of 0.1 means delay * (0.9 to 1.1).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let random_value: f64 = rand::random();
    let random_factor = 1.0 - jitter + (random_value * 2.0 * jitter);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Classify a non-success HTTP status.
///
/// Redirects are permanent because webhook delivery never follows them;
/// 408/425/429 are the only retryable client errors; everything in 5xx is
/// worth another try.
pub fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        408 | 425 | 429 => ErrorClass::Retryable,
        300..=499 => ErrorClass::Permanent,
        _ => ErrorClass::Retryable,
    }
}

/// Parse a `Retry-After` header value: either delay-seconds or an HTTP-date.
///
/// A date in the past yields a zero delay. The caller caps the result at
/// `max_delay`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    match (when.with_timezone(&Utc) - now).to_std() {
        Ok(delay) => Some(delay),
        Err(_) => Some(Duration::ZERO),
    }
}
