#[cfg(not(target_arch = "wasm32"))]
pub use std::time::{Duration, Instant};

#[cfg(target_arch = "wasm32")]
pub use web_time::{Duration, Instant};

/// Interval timer driving the discard-and-swap cadence.
///
/// The timer is polled once per frame with the frame's timestamp. An
/// interval of `None` never fires.
#[derive(Debug, Clone)]
pub struct EvictionTimer {
    interval: Option<Duration>,
    last_fired: Instant,
    /// Number of times the timer has fired
    pub cycles: u64,
}

impl EvictionTimer {
    #[must_use]
    pub fn new(interval: Option<Duration>) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    #[must_use]
    pub fn starting_at(interval: Option<Duration>, now: Instant) -> Self {
        Self {
            interval,
            last_fired: now,
            cycles: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Returns `true` and restarts the interval when it has elapsed at `now`.
    pub fn poll(&mut self, now: Instant) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };
        if now.saturating_duration_since(self.last_fired) < interval {
            return false;
        }
        self.last_fired = now;
        self.cycles += 1;
        true
    }

    /// Time left until the next cycle, `None` when disabled.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let interval = self.interval?;
        Some(interval.saturating_sub(now.saturating_duration_since(self.last_fired)))
    }
}
