//! Wall-clock sources shared by the timers and the services.

use std::{fmt, time::SystemTime};

use tokio::time::Instant;

/// Source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Wall clock advanced by the tokio timer, so paused-time tests see deadlines move.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall_origin: SystemTime,
    instant_origin: Instant,
}

impl TokioClock {
    /// Anchor the clock at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    /// Anchor the clock at `wall_origin`.
    pub fn starting_at(wall_origin: SystemTime) -> Self {
        Self {
            wall_origin,
            instant_origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> SystemTime {
        self.wall_origin + self.instant_origin.elapsed()
    }
}
