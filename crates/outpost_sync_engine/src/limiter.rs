//! Adaptive page sizing.

use crate::config::LimiterConfig;
use std::time::Duration;
use tracing::debug;

/// Tunes the page size toward pages that take the configured optimal time.
///
/// Each step moves by at most `max_limit_change_per_page` of the current
/// limit and always stays within `[min_limit, max_limit]`.
#[derive(Debug, Clone)]
pub struct DynamicLimiter {
    config: LimiterConfig,
    current: u32,
}

impl DynamicLimiter {
    /// Starts at `initial_limit`.
    pub fn new(config: LimiterConfig) -> Self {
        let current = config
            .initial_limit
            .max(config.min_limit)
            .min(config.max_limit)
            .max(1);
        Self { config, current }
    }

    /// Page size to request next.
    pub fn current_limit(&self) -> u32 {
        self.current
    }

    /// Records that the last full page took `elapsed` and returns the next
    /// limit.
    pub fn next_limit(&mut self, elapsed: Duration) -> u32 {
        let current = f64::from(self.current);
        let per_record = elapsed.as_secs_f64() / current;
        let optimal = if per_record > 0.0 {
            self.config.optimal_time_per_page().as_secs_f64() / per_record
        } else {
            f64::INFINITY
        };

        let step = current * self.config.max_limit_change_per_page;
        let lower = (current - step).max(f64::from(self.config.min_limit));
        let upper = (current + step).min(f64::from(self.config.max_limit));
        let mut next = optimal.min(upper).max(lower).floor();
        // Small limits would otherwise round back to themselves.
        if optimal > current && next <= current {
            next = (current + 1.0).min(f64::from(self.config.max_limit));
        }

        // Bounded by max_limit, so the cast cannot overflow.
        let next = (next as u32).max(1);
        if next != self.current {
            debug!(
                previous = self.current,
                next,
                elapsed_ms = elapsed.as_millis() as u64,
                "adjusted page limit"
            );
        }
        self.current = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> LimiterConfig {
        LimiterConfig::new(100, 10, 1000)
            .with_max_change_per_page(0.3)
            .with_optimal_time_per_page(Duration::from_millis(1000))
    }

    #[test]
    fn fast_pages_grow_by_at_most_the_step() {
        let mut limiter = DynamicLimiter::new(config());
        assert_eq!(limiter.next_limit(Duration::from_millis(10)), 130);
        assert_eq!(limiter.next_limit(Duration::ZERO), 169);
    }

    #[test]
    fn slow_pages_shrink_by_at_most_the_step() {
        let mut limiter = DynamicLimiter::new(config());
        assert_eq!(limiter.next_limit(Duration::from_secs(60)), 70);
    }

    #[test]
    fn near_optimal_pages_settle() {
        let mut limiter = DynamicLimiter::new(config());
        // 100 records in 900ms means 111 fit in a second.
        assert_eq!(limiter.next_limit(Duration::from_millis(900)), 111);
    }

    #[test]
    fn small_limits_still_grow() {
        let mut limiter = DynamicLimiter::new(
            LimiterConfig::new(3, 1, 10).with_optimal_time_per_page(Duration::from_secs(1)),
        );
        assert_eq!(limiter.next_limit(Duration::ZERO), 4);
        assert_eq!(limiter.next_limit(Duration::ZERO), 5);
        assert_eq!(limiter.next_limit(Duration::ZERO), 6);

        let mut capped = DynamicLimiter::new(LimiterConfig::new(3, 1, 3));
        assert_eq!(capped.next_limit(Duration::ZERO), 3);
    }

    #[test]
    fn respects_bounds() {
        let mut limiter = DynamicLimiter::new(LimiterConfig::new(900, 850, 1000));
        assert_eq!(limiter.next_limit(Duration::ZERO), 1000);
        assert_eq!(limiter.next_limit(Duration::ZERO), 1000);
        assert_eq!(limiter.next_limit(Duration::from_secs(3600)), 850);
    }

    proptest! {
        #[test]
        fn always_within_bounds(
            initial in 1u32..5000,
            elapsed_ms in proptest::collection::vec(0u64..60_000, 1..20),
        ) {
            let config = LimiterConfig::new(initial, 1, 5000)
                .with_optimal_time_per_page(Duration::from_millis(500));
            let mut limiter = DynamicLimiter::new(config.clone());
            for ms in elapsed_ms {
                let before = f64::from(limiter.current_limit());
                let next = limiter.next_limit(Duration::from_millis(ms));
                prop_assert!(next >= config.min_limit && next <= config.max_limit);
                prop_assert!(f64::from(next) <= before * 1.3 + 1.0);
                prop_assert!(f64::from(next) >= (before * 0.7).floor() - 1.0);
            }
        }
    }
}
