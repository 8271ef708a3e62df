// src/time_source.rs
//
// Local clock capability. Every peer supplies its own monotonic clock in
// seconds; the synchronization core never reads the system clock directly.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Result, SyncError};

/// Origin shared by every [`MonotonicClock`] in the process.
static PROCESS_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// A monotonic clock returning seconds since an arbitrary origin.
pub trait TimeSource: Send + Sync {
    /// Current time in seconds.
    fn now(&self) -> f64;
}

impl<F> TimeSource for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn now(&self) -> f64 {
        self()
    }
}

/// Time source shared between a loop task and its handle.
pub type SharedTimeSource = Arc<dyn TimeSource>;

/// Check a time source once, at construction.
///
/// The source must be present and its first reading must be a finite
/// number of seconds.
pub fn validate_time_source(source: Option<SharedTimeSource>) -> Result<SharedTimeSource> {
    let source = source.ok_or(SyncError::MissingTimeSource)?;
    let probe = source.now();
    if !probe.is_finite() {
        return Err(SyncError::InvalidTimeSource(probe));
    }
    Ok(source)
}

/// Seconds elapsed since the first use of any `MonotonicClock` in this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    pub fn new() -> Self {
        Lazy::force(&PROCESS_ORIGIN);
        Self
    }

    pub fn shared() -> SharedTimeSource {
        Arc::new(Self::new())
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> f64 {
        PROCESS_ORIGIN.elapsed().as_secs_f64()
    }
}

/// Another clock seen through a fixed offset and a constant drift.
///
/// `now = base + offset + drift * base`. Simulations use it to model a peer
/// whose oscillator disagrees with the reference.
pub struct OffsetClock {
    base: SharedTimeSource,
    offset: f64,
    drift: f64,
}

impl OffsetClock {
    pub fn new(base: SharedTimeSource, offset: f64) -> Self {
        Self {
            base,
            offset,
            drift: 0.0,
        }
    }

    pub fn with_drift(mut self, drift: f64) -> Self {
        self.drift = drift;
        self
    }
}

impl TimeSource for OffsetClock {
    fn now(&self) -> f64 {
        let base = self.base.now();
        base + self.offset + self.drift * base
    }
}

impl fmt::Debug for OffsetClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetClock")
            .field("offset", &self.offset)
            .field("drift", &self.drift)
            .finish()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    seconds: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            seconds: Mutex::new(start),
        }
    }

    pub fn set(&self, seconds: f64) {
        *self.seconds.lock() = seconds;
    }

    pub fn advance(&self, seconds: f64) {
        *self.seconds.lock() += seconds;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> f64 {
        *self.seconds.lock()
    }
}
