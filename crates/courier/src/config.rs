//! Configuration file handling.
//!
//! Courier loads engine configuration from a `.courier.toml` file with
//! full defaults when the file or any section is absent. Per-subscription
//! configuration (URLs, secrets, filters, limits) is operator data that
//! lives in the store, not here.
//!
//! # Example
//!
//! ```toml
//! [scheduler]
//! max_workers = 16
//! poll_idle = "2s"
//!
//! [scheduler.backoff]
//! base_delay = "1s"
//! max_delay = "5m"
//!
//! [breaker]
//! failure_threshold = 5
//! open_duration = "60s"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use courier_breaker::BreakerConfig;
use courier_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};

/// Default configuration file name
pub const CONFIG_FILE: &str = ".courier.toml";

/// Get the config file path for a directory
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete courier engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Delivery scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,
}

/// Load configuration from `dir/.courier.toml`.
///
/// A missing file yields the defaults; a present but malformed file is an
/// error the operator has to fix.
pub fn load_config(dir: &Path) -> Result<CourierConfig> {
    let path = config_path(dir);
    if !path.exists() {
        return Ok(CourierConfig::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}
