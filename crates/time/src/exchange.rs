//! Pieces of the ping/pong exchange shared by the peer loop and the
//! reference-side prober.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::correlation::CorrelationTable;
use crate::estimator::RoundTripEstimator;
use crate::report::{Connectivity, Report, SyncStatus};
use crate::sample::TimeSample;
use crate::time_source::TimeSource;
use crate::wire::{decode_ping, encode_pong, PongMessage, WireError};

/// Answer a ping body with a pong stamped by `clock`.
///
/// `t1` is read before decoding and `t2` right before encoding so the
/// responder's processing time is accounted for in the round trip.
pub fn answer_ping(clock: &dyn TimeSource, body: &[u8]) -> Result<Vec<u8>, WireError> {
    let t1 = clock.now();
    let ping = decode_ping(body)?;
    let t2 = clock.now().max(t1);
    encode_pong(ping.id, ping.t0, t1, t2)
}

/// Delay until the next ping: frequent while converging, coarse once synchronized.
pub fn next_interval(status: SyncStatus, config: &ExchangeConfig) -> Duration {
    match status {
        SyncStatus::Sync => config.sync_interval(),
        SyncStatus::Uninitialized | SyncStatus::Training => config.training_interval(),
    }
}

/// Counts consecutive missed pongs and flags degraded connectivity.
#[derive(Debug)]
pub(crate) struct TimeoutTracker {
    consecutive: u32,
    threshold: u32,
    degraded: bool,
}

impl TimeoutTracker {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
            degraded: false,
        }
    }

    /// Returns the new connectivity when this timeout crosses the threshold.
    pub(crate) fn record_timeout(&mut self, peer: &str) -> Option<Connectivity> {
        self.consecutive = self.consecutive.saturating_add(1);
        if !self.degraded && self.consecutive >= self.threshold {
            self.degraded = true;
            warn!(
                "clock sync with {} degraded after {} consecutive timeouts",
                peer, self.consecutive
            );
            return Some(Connectivity::Degraded);
        }
        None
    }

    /// Returns the new connectivity when a pong arrives after a degraded spell.
    pub(crate) fn record_success(&mut self, peer: &str) -> Option<Connectivity> {
        self.consecutive = 0;
        if self.degraded {
            self.degraded = false;
            info!("clock sync with {} recovered", peer);
            return Some(Connectivity::Healthy);
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Per-peer state of the side that sends pings.
pub(crate) struct RoundTrips<'a> {
    pub(crate) peer: &'a str,
    pub(crate) pending: &'a mut CorrelationTable,
    pub(crate) timeouts: &'a mut TimeoutTracker,
    pub(crate) estimator: &'a Mutex<RoundTripEstimator>,
}

impl RoundTrips<'_> {
    /// Match a pong received at `t3` and feed the round trip to the estimator.
    ///
    /// Returns the report to publish: the updated model for an accepted
    /// sample, or the current one when the pong only restored connectivity.
    /// Unknown ids and pongs whose origin time differs from the ping's are
    /// ignored without retiring anything.
    pub(crate) fn complete(&mut self, pong: &PongMessage, t3: f64) -> Option<Report> {
        if !self.pending.contains(pong.id) {
            debug!("ignoring pong with unknown id {} from {}", pong.id, self.peer);
            return None;
        }
        if self.pending.complete_matching(pong.id, pong.t0).is_none() {
            debug!(
                "ignoring pong {} from {} with mismatched origin time",
                pong.id, self.peer
            );
            return None;
        }

        let recovered = self.timeouts.record_success(self.peer);
        let mut estimator = self.estimator.lock();
        if let Some(connectivity) = recovered {
            estimator.set_connectivity(connectivity);
        }
        match estimator.observe(TimeSample::from_pong(pong, t3)) {
            Ok(report) => Some(report),
            Err(rejection) => {
                debug!("rejected sample {} from {}: {}", pong.id, self.peer, rejection);
                recovered.map(|_| estimator.report())
            }
        }
    }

    /// Retire overdue pings. Returns how many expired and, if connectivity
    /// degraded as a result, the report to publish.
    pub(crate) fn expire(&mut self, now: Instant) -> (usize, Option<Report>) {
        let expired = self.pending.expire(now);
        let mut degraded = None;
        for _ in 0..expired {
            debug!("pong from {} timed out", self.peer);
            if let Some(connectivity) = self.timeouts.record_timeout(self.peer) {
                let mut estimator = self.estimator.lock();
                estimator.set_connectivity(connectivity);
                degraded = Some(estimator.report());
            }
        }
        (expired, degraded)
    }
}
