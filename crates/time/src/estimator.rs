// src/estimator.rs
//
// Round-trip estimator: turns 4-timestamp samples into an affine
// local→reference mapping:
//
//     reference = local + offset + drift * (local - anchor)
//
// Offset and anchor come from the lowest-delay sample of a bounded window
// of recent accepted samples; drift is the least-squares slope of measured
// offsets over the window. Samples with an untrustworthy delay are dropped
// before they touch the model.

use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::EstimatorConfig;
use crate::error::Result;
use crate::report::{Connectivity, Report, SyncStatus};
use crate::sample::TimeSample;
use crate::time_source::SharedTimeSource;

/// Smallest time span (seconds²) over which a slope is fitted.
const MIN_FIT_SPAN: f64 = 1e-9;

/// Why a sample was dropped. The model is untouched in every case.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum SampleRejection {
    #[error("sample contains a non-finite timestamp")]
    NonFinite,

    #[error("sample timestamps are out of order")]
    Unordered,

    #[error("negative round-trip delay {delay:.6}s")]
    NegativeDelay { delay: f64 },

    #[error("round-trip delay {delay:.6}s exceeds outlier limit {limit:.6}s")]
    Outlier { delay: f64, limit: f64 },
}

/// Offset/drift model of one remote clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockModel {
    pub offset: f64,
    pub drift: f64,
    /// Local instant the offset was measured at
    pub anchor: f64,
    pub confidence: f64,
    pub status: SyncStatus,
}

impl ClockModel {
    pub fn to_reference(&self, local: f64) -> f64 {
        local + self.offset + self.drift * (local - self.anchor)
    }

    pub fn to_local(&self, reference: f64) -> f64 {
        (reference - self.offset + self.drift * self.anchor) / (1.0 + self.drift)
    }
}

impl Default for ClockModel {
    fn default() -> Self {
        Self {
            offset: 0.0,
            drift: 0.0,
            anchor: 0.0,
            confidence: 0.0,
            status: SyncStatus::Uninitialized,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    local: f64,
    offset: f64,
    delay: f64,
}

/// Per-peer offset/drift estimator.
///
/// Owned by exactly one session or client; every mutation goes through
/// that owner's exchange path.
pub struct RoundTripEstimator {
    config: EstimatorConfig,
    time_source: SharedTimeSource,
    model: ClockModel,
    window: VecDeque<WindowEntry>,
    min_delay: Option<f64>,
    round_trip: f64,
    accepted: u64,
    rejected: u64,
    last_local: Option<f64>,
    connectivity: Connectivity,
}

impl RoundTripEstimator {
    pub fn new(config: EstimatorConfig, time_source: SharedTimeSource) -> Result<Self> {
        config.validate()?;
        let window = VecDeque::with_capacity(config.window_size + 1);
        Ok(Self {
            config,
            time_source,
            model: ClockModel::default(),
            window,
            min_delay: None,
            round_trip: 0.0,
            accepted: 0,
            rejected: 0,
            last_local: None,
            connectivity: Connectivity::Healthy,
        })
    }

    /// Feed one round trip. Returns the updated report, or why the sample was dropped.
    pub fn observe(&mut self, sample: TimeSample) -> std::result::Result<Report, SampleRejection> {
        if let Err(rejection) = self.screen(&sample) {
            self.rejected += 1;
            return Err(rejection);
        }

        if self.model.status.is_initialized() && self.is_discontinuous(&sample) {
            warn!(
                "local clock discontinuity detected (offset {:.6}s vs model {:.6}s), resetting",
                sample.offset(),
                self.model.to_reference(sample.local_midpoint()) - sample.local_midpoint()
            );
            self.reset();
        }

        let delay = sample.round_trip_delay();
        self.min_delay = Some(self.min_delay.map_or(delay, |min| min.min(delay)));
        self.window.push_back(WindowEntry {
            local: sample.local_midpoint(),
            offset: sample.offset(),
            delay,
        });
        if self.window.len() > self.config.window_size {
            self.window.pop_front();
        }
        self.accepted += 1;
        self.last_local = Some(sample.t3);

        self.refit();
        Ok(self.report())
    }

    /// Discard the model if no sample was accepted for `max_staleness_secs`.
    pub fn check_staleness(&mut self, now: f64) -> Option<Report> {
        let last = self.last_local?;
        if !self.model.status.is_initialized() || now - last <= self.config.max_staleness_secs {
            return None;
        }
        warn!(
            "no sample accepted for {:.1}s, discarding clock model",
            now - last
        );
        self.reset();
        Some(self.report())
    }

    /// Forget everything learned; status returns to `Uninitialized`.
    pub fn reset(&mut self) {
        self.model = ClockModel::default();
        self.window.clear();
        self.min_delay = None;
        self.round_trip = 0.0;
        self.accepted = 0;
        self.rejected = 0;
        self.last_local = None;
    }

    /// Map a local time (or now) to reference time.
    pub fn to_reference_time(&self, local: Option<f64>) -> f64 {
        let local = local.unwrap_or_else(|| self.time_source.now());
        self.model.to_reference(local)
    }

    /// Map a reference time (or the reference time of now) back to local time.
    pub fn to_local_time(&self, reference: Option<f64>) -> f64 {
        match reference {
            Some(reference) => self.model.to_local(reference),
            None => self.time_source.now(),
        }
    }

    /// Record exchange health; returns `true` if it changed.
    pub fn set_connectivity(&mut self, connectivity: Connectivity) -> bool {
        let changed = self.connectivity != connectivity;
        self.connectivity = connectivity;
        changed
    }

    pub fn report(&self) -> Report {
        Report {
            status: self.model.status,
            offset: self.model.offset,
            drift: self.model.drift,
            confidence: self.model.confidence,
            timestamp: self.time_source.now(),
            round_trip: self.round_trip,
            accepted: self.accepted,
            rejected: self.rejected,
            connectivity: self.connectivity,
        }
    }

    pub fn model(&self) -> ClockModel {
        self.model
    }

    pub fn status(&self) -> SyncStatus {
        self.model.status
    }

    pub fn min_delay(&self) -> Option<f64> {
        self.min_delay
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    fn screen(&self, sample: &TimeSample) -> std::result::Result<(), SampleRejection> {
        if !sample.is_finite() {
            return Err(SampleRejection::NonFinite);
        }
        if !sample.is_ordered() {
            return Err(SampleRejection::Unordered);
        }
        let delay = sample.round_trip_delay();
        if delay < 0.0 {
            return Err(SampleRejection::NegativeDelay { delay });
        }
        if let Some(min) = self.min_delay {
            let limit = self.config.outlier_factor * min.max(self.config.delay_floor_secs);
            if delay > limit {
                return Err(SampleRejection::Outlier { delay, limit });
            }
        }
        Ok(())
    }

    fn is_discontinuous(&self, sample: &TimeSample) -> bool {
        let threshold = self.config.discontinuity_threshold_secs;
        let went_backwards = self
            .last_local
            .is_some_and(|last| sample.t0 < last - threshold);
        let local = sample.local_midpoint();
        let predicted = self.model.to_reference(local) - local;
        // path asymmetry alone can move the measured offset by up to delay / 2
        let tolerance = threshold + sample.round_trip_delay() / 2.0;
        went_backwards || (sample.offset() - predicted).abs() > tolerance
    }

    fn refit(&mut self) {
        let Some(best) = self
            .window
            .iter()
            .copied()
            .reduce(|best, entry| if entry.delay <= best.delay { entry } else { best })
        else {
            return;
        };

        let (drift, dispersion) = fit_drift(&self.window, self.config.max_drift);
        let previous = self.model;

        let n = self.accepted as f64;
        let scale = self.config.dispersion_scale_secs;
        let mut confidence = n / (n + 1.0) * scale / (scale + dispersion);

        let mut status = match previous.status {
            SyncStatus::Uninitialized => SyncStatus::Training,
            status => status,
        };
        if status == SyncStatus::Training {
            confidence = confidence.max(previous.confidence);
            if confidence >= self.config.confidence_threshold
                && self.accepted >= self.config.min_sync_samples as u64
            {
                status = SyncStatus::Sync;
            }
        }

        if status != previous.status {
            info!(
                "clock model {} -> {} (offset {:.6}s, drift {:.3e}, confidence {:.3})",
                previous.status, status, best.offset, drift, confidence
            );
        }

        self.round_trip = best.delay;
        self.model = ClockModel {
            offset: best.offset,
            drift,
            anchor: best.local,
            confidence,
            status,
        };
    }
}

impl fmt::Debug for RoundTripEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundTripEstimator")
            .field("model", &self.model)
            .field("window", &self.window.len())
            .field("min_delay", &self.min_delay)
            .field("accepted", &self.accepted)
            .field("rejected", &self.rejected)
            .finish()
    }
}

/// Least-squares slope of offset over local time, clamped to `±max_drift`,
/// and the RMS residual around the fitted line.
fn fit_drift(window: &VecDeque<WindowEntry>, max_drift: f64) -> (f64, f64) {
    let n = window.len() as f64;
    if window.len() < 2 {
        return (0.0, 0.0);
    }
    let mean_x = window.iter().map(|e| e.local).sum::<f64>() / n;
    let mean_y = window.iter().map(|e| e.offset).sum::<f64>() / n;
    let (sxx, sxy) = window.iter().fold((0.0, 0.0), |(sxx, sxy), e| {
        let dx = e.local - mean_x;
        (sxx + dx * dx, sxy + dx * (e.offset - mean_y))
    });

    let drift = if sxx > MIN_FIT_SPAN {
        (sxy / sxx).clamp(-max_drift, max_drift)
    } else {
        0.0
    };

    let residuals = window
        .iter()
        .map(|e| {
            let r = e.offset - (mean_y + drift * (e.local - mean_x));
            r * r
        })
        .sum::<f64>();
    (drift, (residuals / n).sqrt())
}
