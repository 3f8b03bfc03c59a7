//! Monotonic time source.
//!
//! Every interval gate and timeout in the crate reads time through a
//! [`Clock`] so uploads can be simulated without real delays.

use std::thread;
use std::time::{Duration, Instant};

/// Source of monotonic time plus a short blocking delay.
pub trait Clock {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Wait for a short device-settle delay.
    fn sleep(&self, duration: Duration);

    /// Time elapsed since `since`, saturating at zero.
    fn elapsed(&self, since: Instant) -> Duration {
        self.now().saturating_duration_since(since)
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// Wall-independent system clock backed by [`Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}


#[cfg(test)]
mod tests {
    use super::manual::ManualClock;
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_steps_on_read() {
        let clock = ManualClock::new(Duration::from_millis(1));
        let a = clock.now();
        let b = clock.now();
        assert_eq!(b - a, Duration::from_millis(1));
    }

    #[test]
    fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new(Duration::ZERO);
        let start = clock.now();
        clock.sleep(Duration::from_millis(500));
        assert_eq!(clock.elapsed(start), Duration::from_millis(500));
    }
}
