//! # Reconnect Backoff
//!
//! Exponential backoff with additive jitter:
//!
//! ```text
//! delay(attempt) = min(max_delay, min_delay * growth_factor ^ attempt) + jitter
//! ```
//!
//! where `jitter` is drawn uniformly from `[0, policy.jitter)`. The policy is a
//! pure function of the attempt number and a jitter sample so it can be checked
//! without waiting on real time; [`Backoff`] is the inspectable retry state the
//! connection actor carries between attempts.

use std::time::Duration;

use rand::Rng;

/// Parameters of the reconnect schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub growth_factor: f64,
    /// Exclusive upper bound of the random component added to every delay.
    pub jitter: Duration,
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            growth_factor: 1.3,
            jitter: Duration::from_millis(4000),
            max_retries: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    ///
    /// `jitter_fraction` is clamped to `[0, 1)` and scales `self.jitter`.
    pub fn delay_for(&self, attempt: u32, jitter_fraction: f64) -> Duration {
        let base_ms = self.min_delay.as_millis() as f64;
        let cap_ms = self.max_delay.as_millis() as f64;
        // powf saturates to +inf for large attempts, which min() then caps.
        let exponential_ms = (base_ms * self.growth_factor.powf(f64::from(attempt))).min(cap_ms);

        let fraction = if jitter_fraction.is_finite() {
            jitter_fraction.clamp(0.0, 1.0 - f64::EPSILON)
        } else {
            0.0
        };
        let jitter_ms = self.jitter.as_millis() as f64 * fraction;

        Duration::from_millis((exponential_ms + jitter_ms) as u64)
    }

    /// Whether another retry is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_retries.map_or(true, |max| attempts < max)
    }
}

/// Retry state between reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    next_delay: Option<Duration>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            next_delay: None,
        }
    }

    /// Number of retries scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay of the most recently scheduled retry, if one is pending.
    pub fn next_delay(&self) -> Option<Duration> {
        self.next_delay
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Schedules the next retry with a random jitter sample.
    ///
    /// Returns `None` once the retry budget is exhausted.
    pub fn schedule(&mut self) -> Option<Duration> {
        let sample = rand::rng().random::<f64>();
        self.schedule_with(sample)
    }

    /// Deterministic variant of [`schedule`](Self::schedule).
    pub fn schedule_with(&mut self, jitter_fraction: f64) -> Option<Duration> {
        if !self.policy.allows(self.attempt) {
            self.next_delay = None;
            return None;
        }
        let delay = self.policy.delay_for(self.attempt, jitter_fraction);
        self.attempt += 1;
        self.next_delay = Some(delay);
        Some(delay)
    }

    /// Clears the retry state after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            growth_factor: 2.0,
            jitter: Duration::from_millis(500),
            max_retries: Some(3),
        }
    }

    #[test]
    fn test_delay_grows_exponentially_without_jitter() {
        let p = policy();
        assert_eq!(p.delay_for(0, 0.0), Duration::from_millis(1000));
        assert_eq!(p.delay_for(1, 0.0), Duration::from_millis(2000));
        assert_eq!(p.delay_for(2, 0.0), Duration::from_millis(4000));
        assert_eq!(p.delay_for(3, 0.0), Duration::from_millis(8000));
    }

    #[test]
    fn test_delay_is_capped_before_jitter() {
        let p = policy();
        assert_eq!(p.delay_for(10, 0.0), Duration::from_millis(10_000));
        assert_eq!(p.delay_for(10, 0.5), Duration::from_millis(10_250));
        // Enormous attempt counts must not overflow.
        assert_eq!(p.delay_for(u32::MAX, 0.0), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_below_bound() {
        let p = policy();
        assert!(p.delay_for(0, 1.0) < Duration::from_millis(1500));
        assert_eq!(p.delay_for(0, -3.0), Duration::from_millis(1000));
        assert_eq!(p.delay_for(0, f64::NAN), Duration::from_millis(1000));
    }

    #[test]
    fn test_default_first_delay_range() {
        let p = BackoffPolicy::default();
        for _ in 0..100 {
            let d = Backoff::new(p.clone()).schedule().unwrap();
            assert!(d >= Duration::from_millis(1000) && d < Duration::from_millis(5000));
        }
    }

    #[test]
    fn test_backoff_respects_retry_budget_and_resets() {
        let mut b = Backoff::new(policy());
        assert_eq!(b.schedule_with(0.0), Some(Duration::from_millis(1000)));
        assert_eq!(b.schedule_with(0.0), Some(Duration::from_millis(2000)));
        assert_eq!(b.schedule_with(0.0), Some(Duration::from_millis(4000)));
        assert_eq!(b.attempt(), 3);
        assert_eq!(b.schedule_with(0.0), None);
        assert_eq!(b.next_delay(), None);

        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.schedule_with(0.0), Some(Duration::from_millis(1000)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_unbounded_policy_always_allows() {
        let p = BackoffPolicy::default();
        assert!(p.allows(0));
        assert!(p.allows(u32::MAX - 1));
    }
}
