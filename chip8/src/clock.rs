//! Wall-clock pacing for drivers.
use std::{
    thread,
    time::{Duration, Instant},
};

use crate::constants::NANOS_IN_SECOND;

/// Frequency, in hertz (per second)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(transparent))]
pub struct Hz(pub u64);

impl From<Hz> for Duration {
    fn from(freq: Hz) -> Self {
        if freq.0 == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(NANOS_IN_SECOND / freq.0)
        }
    }
}

/// Timer to synchronize a driver thread with the emulated clock.
///
/// It is designed to work with the yielding cooperative pattern
/// of a step loop. When the driver does other work between steps,
/// that time is taken into account when determining the next cycle.
pub struct Clock {
    start: Instant,
    period: Duration,
}

impl Clock {
    /// Creates a new clock with the current time as internal state.
    ///
    /// A frequency of zero never blocks.
    pub fn new(freq: Hz) -> Self {
        Self {
            start: Instant::now(),
            period: freq.into(),
        }
    }

    /// Set the clock state back to zero.
    pub fn reset(&mut self) {
        self.start = Instant::now()
    }

    /// Block the current thread until the next clock cycle.
    pub fn wait(&mut self) {
        loop {
            if self.start.elapsed() < self.period {
                // Sleep does not have enough resolution, and causes
                // the clock to run at 30 FPS.
                //
                // Spinning a loop causes high CPU usage and fan madness.
                //
                // Yielding in a loop is the best alternative.
                thread::yield_now();
            } else {
                // Reset back to zero, rather than trying to catch up.
                //
                // If the driver was paused for debugging, and a large
                // amount of time has elapsed until it is resumed,
                // it should simply continue at the next cycle running
                // at its usual speed.
                self.reset();
                return;
            }
        }
    }
}
