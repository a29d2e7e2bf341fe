//! Configuration for the sync engine.

use fieldsync_protocol::ConflictPolicy;
use rand::Rng;
use std::time::Duration;

/// Configuration for sync passes.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum operations loaded from the queue at a time.
    pub batch_size: usize,
    /// Timeout for each remote call.
    pub request_timeout: Duration,
    /// Retry and backoff for transient failures.
    pub retry: RetryConfig,
    /// Interval of the periodic sync timer; `None` disables it.
    pub sync_interval: Option<Duration>,
    /// Policy for overlapping-field conflicts.
    pub conflict_policy: ConflictPolicy,
    /// Maximum age of a cached resource served by fresh reads.
    pub cache_max_age: Duration,
    /// Superseded journal records tolerated before compaction.
    pub compact_threshold: usize,
}

impl SyncConfig {
    /// Creates a configuration with the defaults.
    pub fn new() -> Self {
        Self {
            batch_size: 50,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            sync_interval: Some(Duration::from_secs(5 * 60)),
            conflict_policy: ConflictPolicy::Manual,
            cache_max_age: Duration::from_secs(24 * 60 * 60),
            compact_threshold: 512,
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the periodic sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Disables the periodic sync timer.
    pub fn without_sync_interval(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the cache max age.
    pub fn with_cache_max_age(mut self, max_age: Duration) -> Self {
        self.cache_max_age = max_age;
        self
    }

    /// Sets the compaction threshold.
    pub fn with_compact_threshold(mut self, threshold: usize) -> Self {
        self.compact_threshold = threshold;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry behavior for operations that failed transiently.
///
/// An operation keeps being retried after `max_attempts`; from then on it
/// is reported as a persistent error instead of being discarded.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after which an operation counts as a persistent error.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Retries on every pass without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
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
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay before the next attempt once `attempt` attempts have failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        let delay_secs = if self.add_jitter {
            delay_secs + delay_secs * 0.25 * rand::thread_rng().gen::<f64>()
        } else {
            delay_secs
        };
        // Negative, NaN or out-of-range values fall back to the cap.
        Duration::try_from_secs_f64(delay_secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_interval, Some(Duration::from_secs(300)));
        assert_eq!(config.cache_max_age, Duration::from_secs(86_400));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.conflict_policy, ConflictPolicy::Manual);
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_batch_size(0)
            .with_request_timeout(Duration::from_secs(5))
            .with_conflict_policy(ConflictPolicy::ServerWins)
            .without_sync_interval();

        assert_eq!(config.batch_size, 1);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.conflict_policy, ConflictPolicy::ServerWins);
        assert!(config.sync_interval.is_none());
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay3 = config.delay_for_attempt(3);
        assert!(delay3 >= Duration::from_millis(400));
        assert!(delay3 <= Duration::from_millis(500));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn extreme_retry_settings_do_not_panic() {
        let unbounded = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::MAX);
        assert_eq!(unbounded.delay_for_attempt(u32::MAX), Duration::MAX);

        let capped = Duration::from_secs(30);
        for multiplier in [f64::NAN, f64::INFINITY, -3.0] {
            let config = RetryConfig::new(10)
                .with_max_delay(capped)
                .with_backoff_multiplier(multiplier)
                .with_jitter(false);
            for attempt in [1, 2, 3, 64] {
                assert!(config.delay_for_attempt(attempt) <= capped);
            }
        }
    }

    #[test]
    fn immediate_retry_has_no_delay() {
        let config = RetryConfig::immediate(3);
        assert_eq!(config.delay_for_attempt(7), Duration::ZERO);
    }
}
