use std::time::Duration;

use rand::{RngExt, rng};

pub const DEFAULT_BASE: Duration = Duration::from_secs(10);
pub const DEFAULT_JITTER: Duration = Duration::from_secs(2);

/// Fixed-delay retry policy with uniform jitter.
///
/// Every retry waits `base + U[0, jitter)`; the delay never grows and retries
/// never stop. `attempts` only counts consecutive failures for logging.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    jitter: Duration,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_JITTER)
    }
}

impl Backoff {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self {
            base,
            jitter,
            attempts: 0,
        }
    }

    /// Delay before the next attempt.
    pub fn next(&self) -> Duration {
        let window = self.jitter.as_nanos().min(u128::from(u64::MAX)) as u64;
        if window == 0 {
            return self.base;
        }
        self.base + Duration::from_nanos(rng().random_range(0..window))
    }

    /// Record a failed attempt and return the delay to wait before retrying.
    pub fn fail(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.next()
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_window_and_does_not_grow() {
        let mut b = Backoff::default();
        for _ in 0..1000 {
            let d = b.fail();
            assert!(d >= DEFAULT_BASE, "{d:?} below base");
            assert!(d < DEFAULT_BASE + DEFAULT_JITTER, "{d:?} above window");
        }
        assert_eq!(b.attempts(), 1000);
    }

    #[test]
    fn reset_restores_same_bound() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(20));
        b.fail();
        b.fail();
        b.reset();
        assert_eq!(b.attempts(), 0);
        let d = b.fail();
        assert!(d >= Duration::from_millis(100) && d < Duration::from_millis(120));
    }

    #[test]
    fn zero_jitter_is_exact() {
        let b = Backoff::new(Duration::from_millis(250), Duration::ZERO);
        assert_eq!(b.next(), Duration::from_millis(250));
    }

    #[test]
    fn jitter_is_actually_random() {
        let b = Backoff::default();
        let first = b.next();
        assert!((0..100).any(|_| b.next() != first));
    }
}
