//! Supervisor tuning knobs.

use std::path::PathBuf;
use std::time::Duration;

/// Default local gRPC port probed when the user has not chosen one.
pub const DEFAULT_LOCAL_PORT: u16 = 9011;

/// Behavior knobs for the probe/launch/watchdog pipeline.
///
/// Defaults mirror the shipped product; tests shrink the durations.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Deadline for the capability probe.
    pub probe_timeout: Duration,
    /// Deadline for the server-mode launch to print its sentinel.
    pub launch_timeout: Duration,
    /// Interval between watchdog echo round-trips.
    pub watchdog_interval: Duration,
    /// Consecutive local failures before the `error` state surfaces.
    pub local_failure_threshold: u32,
    /// Consecutive failures after which the watchdog gives up entirely.
    pub failure_ceiling: u32,
    /// Retry a timed-out probe automatically. Off by default: the retry
    /// loop was disabled in the product and product intent is unresolved
    /// (see DESIGN.md), so it stays opt-in.
    pub retry_on_timeout: bool,
    /// Attempt budget when `retry_on_timeout` is set.
    pub max_probe_attempts: u32,
    /// `--frontend` identifier passed to the engine.
    pub frontend: String,
    /// Alternate database pair (`--profile-db` / `--project-db`).
    pub database_pair: Option<(PathBuf, PathBuf)>,
    /// Pass `--disable-output` to the engine.
    pub disable_output: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(10_000),
            launch_timeout: Duration::from_millis(5_000),
            watchdog_interval: Duration::from_secs(1),
            local_failure_threshold: 5,
            failure_ceiling: 20,
            retry_on_timeout: false,
            max_probe_attempts: 3,
            frontend: "yakit".to_string(),
            database_pair: None,
            disable_output: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_on_timeout_defaults_off() {
        let config = LinkConfig::default();
        assert!(!config.retry_on_timeout);
        assert_eq!(config.max_probe_attempts, 3);
    }

    #[test]
    fn default_thresholds_match_policy() {
        let config = LinkConfig::default();
        assert_eq!(config.local_failure_threshold, 5);
        assert_eq!(config.failure_ceiling, 20);
    }
}
