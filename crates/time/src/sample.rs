use serde::{Deserialize, Serialize};

use crate::wire::PongMessage;

/// One completed 4-timestamp round trip, in seconds.
///
/// `t0`/`t3` come from the measuring side's clock, `t1`/`t2` from the
/// responder's clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSample {
    /// Local send time
    pub t0: f64,
    /// Remote receive time
    pub t1: f64,
    /// Remote send time
    pub t2: f64,
    /// Local receive time
    pub t3: f64,
}

impl TimeSample {
    pub fn new(t0: f64, t1: f64, t2: f64, t3: f64) -> Self {
        Self { t0, t1, t2, t3 }
    }

    /// Complete a pong with the local receive time.
    pub fn from_pong(pong: &PongMessage, t3: f64) -> Self {
        Self::new(pong.t0, pong.t1, pong.t2, t3)
    }

    /// Network time of the exchange: `(t3 - t0) - (t2 - t1)`.
    pub fn round_trip_delay(&self) -> f64 {
        (self.t3 - self.t0) - (self.t2 - self.t1)
    }

    /// Remote minus local clock, assuming symmetric paths.
    pub fn offset(&self) -> f64 {
        ((self.t1 - self.t0) + (self.t2 - self.t3)) / 2.0
    }

    /// Local instant the offset was measured at.
    pub fn local_midpoint(&self) -> f64 {
        (self.t0 + self.t3) / 2.0
    }

    pub fn is_finite(&self) -> bool {
        self.t0.is_finite() && self.t1.is_finite() && self.t2.is_finite() && self.t3.is_finite()
    }

    /// Both sides' durations are non-negative.
    pub fn is_ordered(&self) -> bool {
        self.t1 <= self.t2 && self.t0 <= self.t3
    }
}
