//! One retry policy shared by every channel.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total delivery attempts per receipt before it fails permanently.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay to randomise, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            ..Self::default()
        }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Deterministic part of the delay after `attempt` (1-based) failed:
    /// `base * 2^(attempt-1)`, capped at `max`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let factor = 1u32 << exp;
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Nominal delay with +/- `jitter` applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        nominal.mul_f64((1.0 + spread).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_delay_doubles_and_caps() {
        let p = BackoffPolicy::new(5, Duration::from_secs(1)).with_max(Duration::from_secs(5));
        assert_eq!(p.nominal_delay(1), Duration::from_secs(1));
        assert_eq!(p.nominal_delay(2), Duration::from_secs(2));
        assert_eq!(p.nominal_delay(3), Duration::from_secs(4));
        assert_eq!(p.nominal_delay(4), Duration::from_secs(5));
        assert_eq!(p.nominal_delay(60), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = BackoffPolicy::new(3, Duration::from_millis(1000)).with_jitter(0.25);
        for _ in 0..100 {
            let d = p.delay(1);
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250), "{d:?}");
        }
    }

    #[test]
    fn zero_attempts_become_one() {
        assert_eq!(BackoffPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
