//! Core configuration.
//!
//! All structs deserialize with every field defaulted, so an empty config is
//! a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Number of worker threads computers execute on.
    pub computer_threads: usize,
    /// Maximum number of files a single computer may hold open.
    pub max_files_open: usize,
    pub timeout: TimeoutConfig,
    pub main_thread: MainThreadConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            computer_threads: 1,
            max_files_open: 128,
            timeout: TimeoutConfig::default(),
            main_thread: MainThreadConfig::default(),
        }
    }
}

/// Execution-time budgets for a single computer.
///
/// The escalation order (soft abort, then hard abort, then declaring the
/// worker dead) is fixed; only the durations are tunable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Total execution time before a computer is asked to wind down, in ms.
    pub timeout_ms: u64,
    /// Grace period between escalation stages, in ms.
    pub abort_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig { timeout_ms: 7_000, abort_timeout_ms: 1_500 }
    }
}

impl TimeoutConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub(crate) fn timeout_nanos(&self) -> u64 {
        self.timeout_ms * 1_000_000
    }

    pub(crate) fn abort_nanos(&self) -> u64 {
        self.abort_timeout_ms * 1_000_000
    }
}

/// Budgets for work computers push onto the host's main thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MainThreadConfig {
    /// Total main-thread time available to all computers per tick, in ms.
    pub max_global_time_ms: u64,
    /// Main-thread time a single computer may consume per tick, in ms.
    pub max_computer_time_ms: u64,
}

impl Default for MainThreadConfig {
    fn default() -> Self {
        MainThreadConfig { max_global_time_ms: 10, max_computer_time_ms: 5 }
    }
}

impl MainThreadConfig {
    pub(crate) fn max_global_time(&self) -> Duration {
        Duration::from_millis(self.max_global_time_ms)
    }

    pub(crate) fn max_computer_time(&self) -> Duration {
        Duration::from_millis(self.max_computer_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_deserializes_to_defaults() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.computer_threads, 1);
        assert_eq!(config.max_files_open, 128);
        assert_eq!(config.timeout.timeout_ms, 7_000);
        assert_eq!(config.main_thread.max_computer_time_ms, 5);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"computer_threads": 4, "timeout": {"timeout_ms": 100}}"#)
                .unwrap();
        assert_eq!(config.computer_threads, 4);
        assert_eq!(config.timeout.timeout_ms, 100);
        assert_eq!(config.timeout.abort_timeout_ms, 1_500);
    }
}
