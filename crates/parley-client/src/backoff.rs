use std::time::Duration;

use rand::Rng;

const INITIAL_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_secs(10);
const FACTOR: u32 = 2;
const JITTER: f64 = 0.2;

/// Exponential reconnect backoff with jitter. Each `next_delay` doubles the
/// base up to the cap and spreads the result +/-20% so a crowd of clients
/// killed by the same outage does not redial in lockstep.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            current: INITIAL_DELAY,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The delay to wait before the next dial, or `None` once the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;

        let base = self.current;
        self.current = (self.current * FACTOR).min(MAX_DELAY);

        let scale = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
        Some(base.mul_f64(scale))
    }

    /// Call after a successful dial so the next outage starts from the
    /// initial delay again.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = INITIAL_DELAY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_within_jitter() {
        let mut backoff = Backoff::new(5);
        let mut expected = INITIAL_DELAY;
        for _ in 0..5 {
            let delay = backoff.next_delay().unwrap();
            let lo = expected.mul_f64(1.0 - JITTER);
            let hi = expected.mul_f64(1.0 + JITTER);
            assert!(delay >= lo && delay <= hi, "{delay:?} outside [{lo:?}, {hi:?}]");
            expected = (expected * FACTOR).min(MAX_DELAY);
        }
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut backoff = Backoff::new(3);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn delay_caps_at_max() {
        let mut backoff = Backoff::new(32);
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = backoff.next_delay().unwrap();
        }
        assert!(last <= MAX_DELAY.mul_f64(1.0 + JITTER));
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff = Backoff::new(10);
        for _ in 0..6 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let delay = backoff.next_delay().unwrap();
        assert!(delay <= INITIAL_DELAY.mul_f64(1.0 + JITTER));
    }
}
