//! Retry policy and jittered exponential backoff for outbox delivery.
//!
//! ```text
//! attempt    nominal delay (base=1s, x2)    with jitter (±25%)
//! ───────────────────────────────────────────────────────────
//!    1              1s                      0.75s - 1.25s
//!    2              2s                      1.5s  - 2.5s
//!    3              4s                      3s    - 5s
//!   >max        DEAD LETTER            max_retries_exceeded
//! ```
//!
//! `delay = min(base * multiplier^(attempt-1), max_delay) * jitter` where the
//! jitter factor is drawn uniformly from `[1 - j, 1 + j]`.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, StorageError};

/// Default retry budget before dead-lettering
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay in milliseconds
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Default max delay in milliseconds (5 minutes)
const DEFAULT_MAX_DELAY_MS: u64 = 300_000;

const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default jitter factor (±25%)
pub const DEFAULT_JITTER_FACTOR: f64 = 0.25;

/// Per-event retry parameters, persisted alongside each outbox row.
///
/// `max_attempts` is the number of retries granted after failed deliveries:
/// the event dead-letters on the failure that pushes `delivery_attempts`
/// past it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryPolicy(max_attempts={}, base_delay={}ms, max_delay={}ms, multiplier={})",
            self.max_attempts, self.base_delay_ms, self.max_delay_ms, self.backoff_multiplier
        )
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier,
        }
    }

    /// Faster recovery for latency-sensitive events.
    pub fn aggressive() -> Self {
        Self::new(3, 200, 10_000, 2.0)
    }

    /// Reject policies whose delays could shrink between attempts or that
    /// never deliver.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(StorageError::InvalidRetryPolicy(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(StorageError::InvalidRetryPolicy(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(StorageError::InvalidRetryPolicy(format!(
                "base_delay_ms ({}) cannot exceed max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Whether another delivery may be scheduled after `attempts` failures.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_attempts
    }

    /// Delay before the next delivery after the `attempt`-th failure (1-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before the next delivery with multiplicative jitter applied.
    pub fn delay(&self, attempt: u32, jitter: Jitter) -> Duration {
        jitter.apply(self.nominal_delay(attempt))
    }

    /// Absolute time of the next delivery.
    pub fn next_retry_at(&self, attempt: u32, jitter: Jitter, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay(attempt, jitter);
        now + chrono::Duration::milliseconds(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
    }

    /// Nominal delays for every retry this policy allows.
    pub fn delay_schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts).map(|a| self.nominal_delay(a)).collect()
    }
}

/// Bounded multiplicative jitter: scales a delay by a factor in `[1 - f, 1 + f]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    factor: f64,
}

impl Jitter {
    /// `factor` is clamped into `[0, 1)`.
    pub fn new(factor: f64) -> Self {
        let factor = if factor.is_finite() {
            factor.clamp(0.0, 0.999)
        } else {
            0.0
        };
        Self { factor }
    }

    pub fn none() -> Self {
        Self { factor: 0.0 }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        if self.factor == 0.0 {
            return delay;
        }
        let scale = rand::thread_rng().gen_range((1.0 - self.factor)..=(1.0 + self.factor));
        delay.mul_f64(scale)
    }

    /// Inclusive range a jittered `delay` falls into.
    pub fn bounds(&self, delay: Duration) -> (Duration, Duration) {
        (
            delay.mul_f64(1.0 - self.factor),
            delay.mul_f64(1.0 + self.factor),
        )
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::new(DEFAULT_JITTER_FACTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn scenario_policy() -> RetryPolicy {
        RetryPolicy::new(3, 1_000, 60_000, 2.0)
    }

    #[rstest]
    #[case(1, 1_000)]
    #[case(2, 2_000)]
    #[case(3, 4_000)]
    fn test_nominal_delay_doubles(#[case] attempt: u32, #[case] expected_ms: u64) {
        assert_eq!(
            scenario_policy().nominal_delay(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_delay_is_capped_at_max() {
        let policy = RetryPolicy::new(20, 1_000, 5_000, 2.0);
        assert_eq!(policy.nominal_delay(10), Duration::from_millis(5_000));
        assert_eq!(policy.nominal_delay(500), Duration::from_millis(5_000));
    }

    #[test]
    fn test_delay_schedule_is_non_decreasing() {
        let policy = RetryPolicy::new(12, 250, 30_000, 1.7);
        let schedule = policy.delay_schedule();

        assert_eq!(schedule.len(), 12);
        assert!(schedule.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*schedule.last().unwrap(), Duration::from_millis(30_000));
    }

    #[rstest]
    #[case(RetryPolicy::new(3, 1_000, 60_000, 0.5))]
    #[case(RetryPolicy::new(3, 1_000, 60_000, f64::NAN))]
    #[case(RetryPolicy::new(3, 90_000, 60_000, 2.0))]
    #[case(RetryPolicy::new(0, 1_000, 60_000, 2.0))]
    fn test_validate_rejects_shrinking_or_empty_policies(#[case] policy: RetryPolicy) {
        assert!(matches!(
            policy.validate(),
            Err(StorageError::InvalidRetryPolicy(_))
        ));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::aggressive().validate().is_ok());
        assert!(RetryPolicy::new(1, 500, 500, 1.0).validate().is_ok());
    }

    #[test]
    fn test_can_retry_grants_max_attempts_retries() {
        let policy = scenario_policy();
        assert!(policy.can_retry(1));
        assert!(policy.can_retry(3));
        assert!(!policy.can_retry(4));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let jitter = Jitter::new(0.25);
        let delay = Duration::from_millis(2_000);
        let (low, high) = jitter.bounds(delay);

        for _ in 0..200 {
            let d = jitter.apply(delay);
            assert!(d >= low && d <= high, "{:?} outside [{:?}, {:?}]", d, low, high);
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let delay = Duration::from_millis(1_234);
        assert_eq!(Jitter::none().apply(delay), delay);
        assert_eq!(Jitter::new(-3.0).factor(), 0.0);
    }

    #[test]
    fn test_next_retry_at_without_jitter() {
        let now = Utc::now();
        let at = scenario_policy().next_retry_at(2, Jitter::none(), now);
        assert_eq!((at - now).num_milliseconds(), 2_000);
    }
}
