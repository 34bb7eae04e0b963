//! Retry pacing for cloud transport failures.
//!
//! Exponential growth with a cap, randomized with equal jitter (uniform
//! in `[delay/2, delay]`) so a fleet of devices does not reconnect in
//! lockstep. Attempt 1 is the first retry.

use std::cell::Cell;
use std::time::Duration;

use rand::Rng;

pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: Cell<u32>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: Cell::new(0),
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&self) -> Duration {
        let attempt = self.attempt.get().saturating_add(1);
        self.attempt.set(attempt);
        self.jitter(self.raw_delay(attempt))
    }

    /// A success clears the failure streak.
    pub fn reset(&self) {
        self.attempt.set(0);
    }

    pub fn attempts(&self) -> u32 {
        self.attempt.get()
    }

    fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = 1u128 << exponent;
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        Duration::from_nanos(nanos.min(self.max.as_nanos()) as u64).min(self.max)
    }

    fn jitter(&self, delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis < 2 {
            return delay;
        }
        let half = millis / 2;
        let jittered = half + rand::thread_rng().gen_range(0..=half);
        Duration::from_millis(jittered)
    }
}
