//! Configuration for the sync engine.

use crate::state::DEFAULT_SETTLED_STATE_CAPACITY;
use rand::Rng;
use std::time::Duration;

/// Default echo-suppression window.
pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(5);

/// Default minimum version jump required to undelete an entity.
pub const DEFAULT_UNDELETE_BUMP: u64 = 1000;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long a pushed entity is treated as "ours" when it echoes back.
    pub echo_window: Duration,
    /// Minimum version increase required by `persist_undelete`.
    pub undelete_bump: u64,
    /// Maximum number of IDs per `id IN (...)` pull during reconciliation.
    pub pull_chunk_size: usize,
    /// Maximum number of records per batched upsert.
    pub push_batch_size: usize,
    /// Backoff hint for offline queue drains.
    pub retry: RetryConfig,
    /// How many `Synced` entity states are remembered before the oldest
    /// are forgotten.
    pub settled_state_capacity: usize,
}

impl SyncConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            echo_window: DEFAULT_ECHO_WINDOW,
            undelete_bump: DEFAULT_UNDELETE_BUMP,
            pull_chunk_size: 100,
            push_batch_size: 50,
            retry: RetryConfig::default(),
            settled_state_capacity: DEFAULT_SETTLED_STATE_CAPACITY,
        }
    }

    /// Sets the echo-suppression window.
    pub fn with_echo_window(mut self, window: Duration) -> Self {
        self.echo_window = window;
        self
    }

    /// Sets the undelete version bump.
    pub fn with_undelete_bump(mut self, bump: u64) -> Self {
        self.undelete_bump = bump;
        self
    }

    /// Sets the reconciliation pull chunk size.
    pub fn with_pull_chunk_size(mut self, size: usize) -> Self {
        self.pull_chunk_size = size.max(1);
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets how many synced entity states are remembered.
    pub fn with_settled_state_capacity(mut self, capacity: usize) -> Self {
        self.settled_state_capacity = capacity;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff settings used to suggest when the host should drain the queue again.
///
/// The engine never schedules retries itself.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between drains.
    pub initial_delay: Duration,
    /// Maximum delay between drains.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before the next drain, given how many times the
    /// head operation has already failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25%
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..=1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.echo_window, Duration::from_secs(5));
        assert_eq!(config.undelete_bump, 1000);
        assert_eq!(config.pull_chunk_size, 100);
        assert_eq!(config.push_batch_size, 50);
        assert_eq!(config.settled_state_capacity, DEFAULT_SETTLED_STATE_CAPACITY);
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_echo_window(Duration::from_millis(250))
            .with_undelete_bump(10)
            .with_pull_chunk_size(0)
            .with_push_batch_size(7)
            .with_settled_state_capacity(16);

        assert_eq!(config.echo_window, Duration::from_millis(250));
        assert_eq!(config.undelete_bump, 10);
        assert_eq!(config.pull_chunk_size, 1);
        assert_eq!(config.push_batch_size, 7);
        assert_eq!(config.settled_state_capacity, 16);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(Duration::from_millis(100)).with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig::new(Duration::from_millis(100));
        let delay = config.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(125));
    }
}
