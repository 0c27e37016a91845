//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::Priority;
use crate::error::RequestError;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Max operations in flight at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Default freshness window for cached results, in milliseconds
    #[serde(default = "default_cache_duration_ms")]
    pub default_cache_duration_ms: u64,

    /// Default priority for new requests
    #[serde(default)]
    pub default_priority: Priority,

    /// Max admissions per rate window (unlimited when absent)
    #[serde(default)]
    pub max_requests_per_window: Option<u32>,

    /// Rate limit window duration in seconds
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_cache_duration_ms() -> u64 {
    60_000
}

fn default_rate_window_secs() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_cache_duration_ms: default_cache_duration_ms(),
            default_priority: Priority::Low,
            max_requests_per_window: None,
            rate_window_secs: default_rate_window_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Get the rate window as a Duration
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    /// Get the default cache duration as a Duration
    pub fn default_cache_duration(&self) -> Duration {
        Duration::from_millis(self.default_cache_duration_ms)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.max_concurrent == 0 {
            return Err(RequestError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if let Some(limit) = self.max_requests_per_window {
            if limit == 0 {
                return Err(RequestError::InvalidConfig(
                    "max_requests_per_window must be at least 1".to_string(),
                ));
            }
            if self.rate_window_secs == 0 {
                return Err(RequestError::InvalidConfig(
                    "rate_window_secs must be at least 1 when rate limiting".to_string(),
                ));
            }
        }
        Ok(())
    }
}
