//! Runtime configuration.
//!
//! All loop caps, retry counts and thresholds live here and are threaded
//! explicitly through constructors, never read from global state. The
//! struct deserializes from JSON with per-field defaults so embedders can
//! override a subset.

use serde::Deserialize;
use std::time::Duration;

/// When the runtime refreshes dynamically discovered capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityRefresh {
    /// Discover once, on the first loop iteration.
    #[default]
    FirstIteration,
    /// Re-discover on every loop iteration.
    EveryIteration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Reasoning/acting loop cap per agent. Exceeding it yields a synthetic
    /// "unfinished" result rather than an error.
    pub max_iterations: usize,
    /// Consecutive invocation failures before the circuit breaker aborts the
    /// agent. Any success resets the counter.
    pub consecutive_failure_limit: usize,
    /// Estimated transcript size (chars) above which the gateway compresses
    /// history before the next reasoning request.
    pub compress_threshold_chars: usize,
    /// Transport retry cap for reasoning requests.
    pub max_retries: usize,
    /// Base delay for exponential backoff, doubled per attempt with jitter.
    pub retry_base_delay_ms: u64,
    /// Per-request timeout on protocol calls.
    pub request_timeout_secs: u64,
    /// Heartbeat interval for the streaming protocol binding.
    pub heartbeat_interval_secs: u64,
    /// Delay before the single reconnect attempt after a stream error.
    pub reconnect_delay_ms: u64,
    /// When to refresh dynamically discovered capabilities.
    pub capability_refresh: CapabilityRefresh,
    /// Give the agent one extra iteration to confirm a pure-text answer is
    /// actually complete.
    pub double_check_completion: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            consecutive_failure_limit: 10,
            compress_threshold_chars: 200_000,
            max_retries: 3,
            retry_base_delay_ms: 500,
            request_timeout_secs: 30,
            heartbeat_interval_secs: 30,
            reconnect_delay_ms: 1_000,
            capability_refresh: CapabilityRefresh::default(),
            double_check_completion: false,
        }
    }
}

impl RuntimeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Backoff delay for the given zero-based attempt, with jitter.
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        use rand::Rng;
        let base = self.retry_base_delay_ms.saturating_mul(1 << attempt.min(6));
        let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
        Duration::from_millis(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.consecutive_failure_limit, 10);
        assert_eq!(config.capability_refresh, CapabilityRefresh::FirstIteration);
    }

    #[test]
    fn partial_json_override() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"max_iterations": 5, "capability_refresh": "every_iteration"}"#)
                .unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.capability_refresh, CapabilityRefresh::EveryIteration);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn backoff_grows() {
        let config = RuntimeConfig::default();
        assert!(config.backoff_delay(2) >= Duration::from_millis(2_000));
    }
}
