//! Present-rate limiting.

use std::thread;
use std::time::{Duration, Instant};

/// Holds presents to a minimum interval.
///
/// The interval is measured from the end of one paced present to the end of
/// the next, so time spent rendering and capturing counts toward it.
#[derive(Debug, Clone)]
pub struct FramePacer {
    interval: Option<Duration>,
    last_present: Option<Instant>,
}

impl FramePacer {
    /// A pacer targeting `interval` between presents; `None` never sleeps.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval: interval.filter(|interval| !interval.is_zero()),
            last_present: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// How long a present at `now` would have to wait.
    pub fn delay_at(&self, now: Instant) -> Duration {
        match (self.interval, self.last_present) {
            (Some(interval), Some(last)) => interval.saturating_sub(now.saturating_duration_since(last)),
            _ => Duration::ZERO,
        }
    }

    /// Sleeps out the rest of the interval and records the present. Returns
    /// the time slept.
    pub fn pace(&mut self) -> Duration {
        if self.interval.is_none() {
            return Duration::ZERO;
        }
        let delay = self.delay_at(Instant::now());
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.last_present = Some(Instant::now());
        delay
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new(Some(crate::config::DEFAULT_FRAME_INTERVAL))
    }
}
