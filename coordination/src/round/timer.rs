//! Round timing
//!
//! Built on `tokio::time::Instant` so paused-clock tests can drive a whole
//! round with `tokio::time::advance`.

use std::time::Duration;

use tokio::time::Instant;

const ONE_SECOND: Duration = Duration::from_secs(1);

/// Counts down one round. Expiry is the only time-based end of a round.
#[derive(Debug, Clone, Copy)]
pub struct RoundTimer {
    started: Instant,
    duration: Duration,
    forced: bool,
}

impl RoundTimer {
    pub fn start(duration: Duration) -> Self {
        Self {
            started: Instant::now(),
            duration,
            forced: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed().as_secs()
    }

    pub fn time_left(&self) -> Duration {
        if self.forced {
            Duration::ZERO
        } else {
            self.duration.saturating_sub(self.elapsed())
        }
    }

    pub fn time_left_ms(&self) -> u64 {
        self.time_left().as_millis() as u64
    }

    pub fn is_expired(&self) -> bool {
        self.forced || self.elapsed() >= self.duration
    }

    /// End the round at the next tick.
    pub fn force_expire(&mut self) {
        self.forced = true;
    }
}

/// Fires once per simulated second
#[derive(Debug, Clone, Copy)]
pub struct SecondTick {
    next: Instant,
}

impl SecondTick {
    pub fn start() -> Self {
        Self {
            next: Instant::now() + ONE_SECOND,
        }
    }

    /// True once for every second boundary that has passed.
    pub fn is_due(&mut self) -> bool {
        if Instant::now() >= self.next {
            self.next += ONE_SECOND;
            true
        } else {
            false
        }
    }
}

impl Default for SecondTick {
    fn default() -> Self {
        Self::start()
    }
}
