/// Exponential backoff calculator for reconnection logic.
///
/// The nominal delay for attempt `n` is `min(base × 2^n, max)`; a uniform
/// jitter in `[0, max(1s, nominal/4))` is added on top so that a fleet of
/// clients kicked off the same server does not reconnect in lockstep.
/// Calling `reset()` returns to the base delay (used after a connection
/// has been stable long enough).
use std::time::Duration;

use rand::Rng;

pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    /// Number of consecutive attempts (resets on `reset()`).
    pub attempt: u32,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            attempt: 0,
        }
    }

    /// The capped exponential delay for the current attempt, before jitter.
    pub fn nominal_delay(&self) -> Duration {
        let doubled = self
            .base_delay
            .checked_mul(1u32 << self.attempt.min(30))
            .unwrap_or(self.max_delay);
        doubled.min(self.max_delay)
    }

    /// Returns the jittered delay for this attempt and advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal_delay();
        self.attempt += 1;
        nominal + jitter(nominal)
    }

    /// Resets the backoff to its initial state.
    /// Called when a connection has been stable long enough.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns true if the consecutive attempt count has reached `max`.
    pub fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}

fn jitter(nominal: Duration) -> Duration {
    let cap = (nominal / 4).max(Duration::from_secs(1));
    let secs = rand::thread_rng().gen_range(0.0..cap.as_secs_f64());
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(2), Duration::from_secs(60))
    }

    #[test]
    fn test_nominal_sequence_matches_doubling_with_cap() {
        let mut b = backoff();
        let mut nominal = Vec::new();
        for _ in 0..10 {
            nominal.push(b.nominal_delay().as_secs());
            b.next_delay();
        }
        assert_eq!(nominal, vec![2, 4, 8, 16, 32, 60, 60, 60, 60, 60]);
    }

    #[test]
    fn test_jitter_stays_within_quarter_of_nominal() {
        let mut b = backoff();
        for _ in 0..10 {
            let nominal = b.nominal_delay();
            let delay = b.next_delay();
            assert!(delay >= nominal);
            let cap = (nominal / 4).max(Duration::from_secs(1));
            assert!(delay < nominal + cap);
        }
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut b = backoff();
        b.next_delay();
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempt, 3);

        b.reset();
        assert_eq!(b.attempt, 0);
        assert_eq!(b.nominal_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_exceeded_max_attempts() {
        let mut b = backoff();
        assert!(!b.exceeded_max_attempts(3));
        b.next_delay();
        b.next_delay();
        assert!(!b.exceeded_max_attempts(3));
        b.next_delay();
        assert!(b.exceeded_max_attempts(3));
    }

    #[test]
    fn test_attempt_counter_advances() {
        let mut b = backoff();
        assert_eq!(b.attempt, 0);
        b.next_delay();
        assert_eq!(b.attempt, 1);
        b.next_delay();
        assert_eq!(b.attempt, 2);
    }

    #[test]
    fn test_large_attempt_count_does_not_overflow() {
        let mut b = backoff();
        b.attempt = 40;
        assert_eq!(b.nominal_delay(), Duration::from_secs(60));
    }
}
