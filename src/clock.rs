//! Clock abstraction for testability.
//!
//! The fetcher needs three things from time: a wall clock for `captured_at`,
//! a monotonic clock for inter-request pacing, and a way to wait. Production
//! uses the system; tests use [`ManualClock`], where sleeping simply advances
//! both clocks so rate-limit behavior is deterministic and instantaneous.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Real clock backed by the OS.
#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock. Records every sleep.
pub struct ManualClock {
    base_instant: Instant,
    state: Mutex<ManualState>,
}

struct ManualState {
    wall: DateTime<Utc>,
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            base_instant: Instant::now(),
            state: Mutex::new(ManualState {
                wall: start,
                elapsed: Duration::ZERO,
                sleeps: Vec::new(),
            }),
        }
    }

    /// Move time forward without recording a sleep
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.elapsed += duration;
        state.wall += chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        // A poisoned lock only means another test thread panicked mid-update;
        // the state itself is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.lock().wall
    }

    fn monotonic(&self) -> Instant {
        self.base_instant + self.lock().elapsed
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.lock();
        state.sleeps.push(duration);
        state.elapsed += duration;
        state.wall += chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_sleep_advances_both_clocks() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let t0 = clock.monotonic();

        clock.sleep(Duration::from_millis(1500));
        clock.advance(Duration::from_millis(500));

        assert_eq!(clock.monotonic() - t0, Duration::from_secs(2));
        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(2));
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(1500)]);
    }
}
