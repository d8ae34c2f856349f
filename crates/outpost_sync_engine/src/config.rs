//! Configuration for the facility sync engine.

use crate::error::{SyncError, SyncResult};
use serde::Deserialize;
use std::time::Duration;

/// Configuration for one facility's sync sessions.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Facility this node serves.
    pub facility_id: String,
    /// Device ID of this node.
    pub device_id: String,
    /// Page-size tuning for push and pull.
    pub limiter: LimiterConfig,
    /// Retry configuration for transient transport errors.
    pub retry: RetryConfig,
    /// Longest a single transport request may take. Handed to the
    /// transport when the engine is built.
    pub timeout: Duration,
    /// How long to wait for in-flight local writers before snapshotting.
    pub tick_wait_timeout: Duration,
    /// How often to ask central whether a push has been persisted.
    pub push_poll_interval: Duration,
    /// Give up waiting for central to persist a push after this long.
    pub push_complete_timeout: Duration,
    /// Maximum number of pulled records saved per transaction.
    pub save_batch_size: usize,
    /// Only pull these models. `None` pulls every model.
    pub pull_models: Option<Vec<String>>,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(facility_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            facility_id: facility_id.into(),
            device_id: device_id.into(),
            limiter: LimiterConfig::default(),
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
            tick_wait_timeout: Duration::from_secs(60),
            push_poll_interval: Duration::from_millis(250),
            push_complete_timeout: Duration::from_secs(300),
            save_batch_size: 10_000,
            pull_models: None,
        }
    }

    /// Sets the page-size tuning.
    pub fn with_limiter(mut self, limiter: LimiterConfig) -> Self {
        self.limiter = limiter;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the writer wait timeout.
    pub fn with_tick_wait_timeout(mut self, timeout: Duration) -> Self {
        self.tick_wait_timeout = timeout;
        self
    }

    /// Sets how push completion is polled.
    pub fn with_push_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.push_poll_interval = interval;
        self.push_complete_timeout = timeout;
        self
    }

    /// Sets how many pulled records are saved per transaction.
    pub fn with_save_batch_size(mut self, size: usize) -> Self {
        self.save_batch_size = size;
        self
    }

    /// Restricts pulls to the named models.
    pub fn with_pull_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pull_models = Some(models.into_iter().map(Into::into).collect());
        self
    }

    /// Checks the configuration before a session uses it.
    pub fn validate(&self) -> SyncResult<()> {
        if self.facility_id.is_empty() {
            return Err(SyncError::InvalidConfig("facility_id is empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(SyncError::InvalidConfig("timeout must be positive".into()));
        }
        if self.save_batch_size == 0 {
            return Err(SyncError::InvalidConfig("save_batch_size must be positive".into()));
        }
        self.limiter.validate()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Tuning for adaptive page sizes.
///
/// Read once per session, typically from the facility's settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Page size of the first request.
    pub initial_limit: u32,
    /// Smallest page size.
    pub min_limit: u32,
    /// Largest page size.
    pub max_limit: u32,
    /// Largest fractional change between consecutive pages.
    pub max_limit_change_per_page: f64,
    /// Target transfer time of one page, in milliseconds.
    pub optimal_time_per_page_ms: u64,
}

impl LimiterConfig {
    /// Creates a configuration with fixed limits.
    pub fn new(initial_limit: u32, min_limit: u32, max_limit: u32) -> Self {
        Self {
            initial_limit,
            min_limit,
            max_limit,
            ..Self::default()
        }
    }

    /// Sets the largest fractional change per page.
    pub fn with_max_change_per_page(mut self, fraction: f64) -> Self {
        self.max_limit_change_per_page = fraction;
        self
    }

    /// Sets the target time per page.
    pub fn with_optimal_time_per_page(mut self, time: Duration) -> Self {
        self.optimal_time_per_page_ms = u64::try_from(time.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Target time per page.
    pub fn optimal_time_per_page(&self) -> Duration {
        Duration::from_millis(self.optimal_time_per_page_ms)
    }

    /// Checks `1 <= min <= initial <= max` and a change fraction in (0, 1].
    pub fn validate(&self) -> SyncResult<()> {
        if self.min_limit == 0 {
            return Err(SyncError::InvalidConfig("min_limit must be positive".into()));
        }
        if !(self.min_limit <= self.initial_limit && self.initial_limit <= self.max_limit) {
            return Err(SyncError::InvalidConfig(format!(
                "limits out of order: min {} initial {} max {}",
                self.min_limit, self.initial_limit, self.max_limit
            )));
        }
        if !(self.max_limit_change_per_page > 0.0 && self.max_limit_change_per_page <= 1.0) {
            return Err(SyncError::InvalidConfig(format!(
                "max_limit_change_per_page {} outside (0, 1]",
                self.max_limit_change_per_page
            )));
        }
        if self.optimal_time_per_page_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "optimal_time_per_page_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            initial_limit: 10_000,
            min_limit: 1_000,
            max_limit: 40_000,
            max_limit_change_per_page: 0.3,
            optimal_time_per_page_ms: 10_000,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
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

    /// Turns jitter on or off.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top.
            let jitter = delay_secs * 0.25 * clock_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// A value in [0, 1) taken from the wall clock's sub-second part.
fn clock_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
