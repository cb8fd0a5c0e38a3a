//! Scheduler configuration.

use crate::errors::JobflowError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the job scheduler and its pipeline driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Recomputations of a stage whose output fails its shape check.
    #[serde(default = "default_max_structural_retries")]
    pub max_structural_retries: usize,
    /// Attempts for the terminal (completed or failed) write of a run.
    #[serde(default = "default_terminal_write_attempts")]
    pub terminal_write_attempts: usize,
    /// Delay between terminal write attempts in milliseconds.
    #[serde(default = "default_terminal_write_backoff_ms")]
    pub terminal_write_backoff_ms: u64,
    /// How long a force-stop waits for the run to exit before aborting it.
    #[serde(default = "default_cancel_grace_period_ms")]
    pub cancel_grace_period_ms: u64,
}

fn default_max_structural_retries() -> usize {
    2
}

fn default_terminal_write_attempts() -> usize {
    3
}

fn default_terminal_write_backoff_ms() -> u64 {
    50
}

fn default_cancel_grace_period_ms() -> u64 {
    5000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_structural_retries: default_max_structural_retries(),
            terminal_write_attempts: default_terminal_write_attempts(),
            terminal_write_backoff_ms: default_terminal_write_backoff_ms(),
            cancel_grace_period_ms: default_cancel_grace_period_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `JobflowError::Serialization` for malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self, JobflowError> {
        serde_json::from_str(json).map_err(|e| JobflowError::Serialization(e.to_string()))
    }

    /// Sets the structural retry bound.
    #[must_use]
    pub fn with_max_structural_retries(mut self, retries: usize) -> Self {
        self.max_structural_retries = retries;
        self
    }

    /// Sets the terminal write attempts. At least one attempt is made.
    #[must_use]
    pub fn with_terminal_write_attempts(mut self, attempts: usize) -> Self {
        self.terminal_write_attempts = attempts.max(1);
        self
    }

    /// Sets the delay between terminal write attempts.
    #[must_use]
    pub fn with_terminal_write_backoff_ms(mut self, backoff: u64) -> Self {
        self.terminal_write_backoff_ms = backoff;
        self
    }

    /// Sets the force-stop grace period.
    #[must_use]
    pub fn with_cancel_grace_period_ms(mut self, grace: u64) -> Self {
        self.cancel_grace_period_ms = grace;
        self
    }

    /// Gets the terminal write backoff as Duration.
    #[must_use]
    pub fn terminal_write_backoff(&self) -> Duration {
        Duration::from_millis(self.terminal_write_backoff_ms)
    }

    /// Gets the grace period as Duration.
    #[must_use]
    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_structural_retries, 2);
        assert_eq!(config.terminal_write_attempts, 3);
        assert_eq!(config.terminal_write_backoff(), Duration::from_millis(50));
        assert_eq!(config.cancel_grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = SchedulerConfig::from_json_str(r#"{"max_structural_retries": 5}"#).unwrap();
        assert_eq!(config.max_structural_retries, 5);
        assert_eq!(config.terminal_write_attempts, 3);

        assert!(matches!(
            SchedulerConfig::from_json_str("{not json"),
            Err(JobflowError::Serialization(_))
        ));
    }

    #[test]
    fn test_builders() {
        let config = SchedulerConfig::new()
            .with_terminal_write_attempts(0)
            .with_terminal_write_backoff_ms(1)
            .with_cancel_grace_period_ms(250);
        assert_eq!(config.terminal_write_attempts, 1);
        assert_eq!(config.terminal_write_backoff_ms, 1);
        assert_eq!(config.cancel_grace_period(), Duration::from_millis(250));
    }
}
