//! Retry bookkeeping of failed file and slice operations.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use stream_core::UtcTime;
use stream_core::config::RetryConfig;

/// Computes when a failed operation may be retried.
pub trait RetryBackoff: Send + Sync {
    /// Time of the next attempt after the `attempt`-th failure at `failed_at`.
    fn retry_after(&self, failed_at: UtcTime, attempt: u32) -> UtcTime;
}

/// Exponential backoff with jitter.
///
/// The jitter is drawn from a generator seeded by the failure time, so the
/// same failure always yields the same delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th retry, without jitter.
    pub fn interval(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_interval.as_secs_f64();
        let max = self.config.max_interval.as_secs_f64();
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = (initial * self.config.multiplier.powi(exp)).min(max);
        Duration::from_secs_f64(secs)
    }

    /// Delay before the `attempt`-th retry, with jitter seeded by `failed_at`.
    pub fn randomized_interval(&self, failed_at: UtcTime, attempt: u32) -> Duration {
        let interval = self.interval(attempt).as_secs_f64();
        let delta = interval * self.config.randomization_factor;
        if delta <= 0.0 {
            return Duration::from_secs_f64(interval);
        }
        let mut rng = StdRng::seed_from_u64(failed_at.unix_nanos() as u64);
        Duration::from_secs_f64(rng.gen_range((interval - delta)..=(interval + delta)))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryBackoff for ExponentialBackoff {
    fn retry_after(&self, failed_at: UtcTime, attempt: u32) -> UtcTime {
        failed_at.add(self.randomized_interval(failed_at, attempt))
    }
}

/// Retry state embedded in files and slices.
///
/// All fields are zero while no failure is pending; a successful state
/// transition resets them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retryable {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_attempt: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub retry_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failed_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<UtcTime>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl Retryable {
    pub fn increment(&mut self, backoff: &dyn RetryBackoff, now: UtcTime, reason: impl Into<String>) {
        self.retry_attempt += 1;
        self.retry_reason = reason.into();
        if self.first_failed_at.is_none() {
            self.first_failed_at = Some(now);
        }
        self.last_failed_at = Some(now);
        self.retry_after = Some(backoff.retry_after(now, self.retry_attempt));
    }

    pub fn reset(&mut self) {
        *self = Retryable::default();
    }

    /// True if no retry is pending or the backoff has elapsed.
    pub fn allowed(&self, now: UtcTime) -> bool {
        self.retry_after.is_none_or(|after| now >= after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(s: &str) -> UtcTime {
        UtcTime::parse(s).unwrap()
    }

    #[test]
    fn test_interval_grows_and_caps() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.interval(1), Duration::from_secs(60));
        assert_eq!(backoff.interval(2), Duration::from_secs(240));
        assert_eq!(backoff.interval(3), Duration::from_secs(960));
        assert_eq!(backoff.interval(4), Duration::from_secs(3840));
        assert_eq!(backoff.interval(5), Duration::from_secs(3 * 3600));
        assert_eq!(backoff.interval(50), Duration::from_secs(3 * 3600));
    }

    #[test]
    fn test_randomized_interval_within_bounds() {
        let backoff = ExponentialBackoff::default();
        let now = time("2000-01-01T01:00:00.000Z");
        for attempt in 1..10 {
            let base = backoff.interval(attempt).as_secs_f64();
            let d = backoff.randomized_interval(now, attempt).as_secs_f64();
            assert!(d >= base * 0.8 - 0.001 && d <= base * 1.2 + 0.001, "attempt {attempt}: {d}");
        }
    }

    #[test]
    fn test_same_failure_time_is_reproducible() {
        let backoff = ExponentialBackoff::default();
        let now = time("2000-01-01T01:00:00.000Z");
        assert_eq!(backoff.retry_after(now, 2), backoff.retry_after(now, 2));
    }

    #[test]
    fn test_no_jitter() {
        let backoff = ExponentialBackoff::new(RetryConfig {
            randomization_factor: 0.0,
            ..RetryConfig::default()
        });
        let now = time("2000-01-01T01:00:00.000Z");
        assert_eq!(backoff.retry_after(now, 1), time("2000-01-01T01:01:00.000Z"));
    }

    #[test]
    fn test_increment_and_reset() {
        let backoff = ExponentialBackoff::new(RetryConfig {
            randomization_factor: 0.0,
            ..RetryConfig::default()
        });
        let mut retry = Retryable::default();
        assert!(retry.allowed(time("2000-01-01T01:00:00.000Z")));

        retry.increment(&backoff, time("2000-01-01T01:00:00.000Z"), "some error");
        retry.increment(&backoff, time("2000-01-01T02:00:00.000Z"), "another error");
        assert_eq!(retry.retry_attempt, 2);
        assert_eq!(retry.retry_reason, "another error");
        assert_eq!(retry.first_failed_at, Some(time("2000-01-01T01:00:00.000Z")));
        assert_eq!(retry.last_failed_at, Some(time("2000-01-01T02:00:00.000Z")));
        assert_eq!(retry.retry_after, Some(time("2000-01-01T02:04:00.000Z")));
        assert!(!retry.allowed(time("2000-01-01T02:03:59.000Z")));
        assert!(retry.allowed(time("2000-01-01T02:04:00.000Z")));

        retry.reset();
        assert_eq!(retry, Retryable::default());
    }

    #[test]
    fn test_zero_fields_are_omitted() {
        assert_eq!(serde_json::to_string(&Retryable::default()).unwrap(), "{}");
    }
}
