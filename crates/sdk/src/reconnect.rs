//! Exponential backoff with jitter; owns the "should retry" decision.
//!
//! `delay_n = min(2^min(n-1,5), 32) * base + jitter`, `jitter = uniform(0,
//! 0.3) * delay_n`. Attempt counter resets on a successful authenticated
//! session.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxAttemptsReached;

pub struct Reconnector {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Reconnector {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    /// Reset the attempt counter. Call this after a successful authenticated
    /// connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Compute the delay before the next reconnect attempt, advancing the
    /// counter. Returns `Err` once `max_attempts` (if bounded) is exceeded.
    pub fn next_delay(&mut self) -> Result<Duration, MaxAttemptsReached> {
        self.attempt += 1;
        if self.max_attempts != 0 && self.attempt > self.max_attempts {
            return Err(MaxAttemptsReached);
        }

        let exponent = (self.attempt - 1).min(5);
        let capped_multiplier = 2u64.saturating_pow(exponent as u32);
        let base_delay = self.base.saturating_mul(capped_multiplier as u32).min(Duration::from_secs(32));

        let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..0.3);
        let jitter = base_delay.mul_f64(jitter_fraction);
        Ok(base_delay + jitter)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_within_bounds_up_to_attempt_6() {
        let mut r = Reconnector::new(Duration::from_secs(1), 0);
        for n in 1..=4u32 {
            let delay = r.next_delay().unwrap();
            let base = 2f64.powi((n - 1) as i32);
            assert!(delay.as_secs_f64() >= base, "attempt {n}: {delay:?} < {base}");
            assert!(delay.as_secs_f64() <= base * 1.3 + 0.001, "attempt {n}: {delay:?} > {}", base * 1.3);
        }
    }

    #[test]
    fn delay_caps_at_32s_base_from_attempt_6_onward() {
        let mut r = Reconnector::new(Duration::from_secs(1), 0);
        for _ in 1..=6 {
            r.next_delay().unwrap();
        }
        let delay = r.next_delay().unwrap();
        assert!(delay.as_secs_f64() >= 32.0);
        assert!(delay.as_secs_f64() <= 32.0 * 1.3 + 0.001);
    }

    #[test]
    fn bounded_attempts_reports_max_reached() {
        let mut r = Reconnector::new(Duration::from_millis(1), 2);
        assert!(r.next_delay().is_ok());
        assert!(r.next_delay().is_ok());
        assert!(r.next_delay().is_err());
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut r = Reconnector::new(Duration::from_secs(1), 0);
        r.next_delay().unwrap();
        r.next_delay().unwrap();
        r.reset();
        assert_eq!(r.attempt(), 0);
        let delay = r.next_delay().unwrap();
        assert!(delay.as_secs_f64() >= 1.0 && delay.as_secs_f64() <= 1.3 + 0.001);
    }
}
