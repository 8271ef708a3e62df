//! Typed configuration for estimators, clients and the reference.
//!
//! Every struct deserializes with serde (missing fields fall back to the
//! defaults below) and is checked once by `validate()` before a session is
//! built. Loop timings are whole milliseconds; estimator tolerances are
//! seconds of the local time source.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SyncError};

pub const DEFAULT_NAMESPACE: &str = "sync";

/// Numeric knobs of the round-trip estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Number of recent accepted samples kept for the drift fit
    pub window_size: usize,
    /// A sample is an outlier when its delay exceeds this multiple of the minimum delay
    pub outlier_factor: f64,
    /// Lower bound applied to the minimum delay before scaling by `outlier_factor`
    pub delay_floor_secs: f64,
    /// Confidence required to leave training
    pub confidence_threshold: f64,
    /// Accepted samples required to leave training
    pub min_sync_samples: usize,
    /// Offset dispersion at which confidence is halved
    pub dispersion_scale_secs: f64,
    /// Jump in local time or offset treated as a clock discontinuity
    pub discontinuity_threshold_secs: f64,
    /// Time without an accepted sample after which the model is discarded
    pub max_staleness_secs: f64,
    /// Largest plausible drift magnitude (seconds per second)
    pub max_drift: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            window_size: 16,
            outlier_factor: 10.0,
            delay_floor_secs: 0.001,
            confidence_threshold: 0.75,
            min_sync_samples: 8,
            dispersion_scale_secs: 0.01,
            discontinuity_threshold_secs: 0.5,
            max_staleness_secs: 30.0,
            max_drift: 5e-4,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size < 2 {
            return invalid("estimator.window_size must be at least 2");
        }
        if !(self.outlier_factor.is_finite() && self.outlier_factor > 1.0) {
            return invalid("estimator.outlier_factor must be a finite number above 1");
        }
        positive("estimator.delay_floor_secs", self.delay_floor_secs)?;
        if !(self.confidence_threshold > 0.0 && self.confidence_threshold < 1.0) {
            return invalid("estimator.confidence_threshold must lie in (0, 1)");
        }
        if self.min_sync_samples == 0 {
            return invalid("estimator.min_sync_samples must be at least 1");
        }
        positive("estimator.dispersion_scale_secs", self.dispersion_scale_secs)?;
        positive(
            "estimator.discontinuity_threshold_secs",
            self.discontinuity_threshold_secs,
        )?;
        positive("estimator.max_staleness_secs", self.max_staleness_secs)?;
        if !(self.max_drift.is_finite() && (0.0..1.0).contains(&self.max_drift)) {
            return invalid("estimator.max_drift must lie in [0, 1)");
        }
        Ok(())
    }
}

/// Cadence of a ping loop, shared by clients and reference-side probers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Ping period while the estimator is converging
    pub training_interval_ms: u64,
    /// Ping period once synchronized
    pub sync_interval_ms: u64,
    /// How long a ping may stay unanswered before its id is retired
    pub pong_timeout_ms: u64,
    /// Consecutive timeouts before connectivity is reported as degraded
    pub max_consecutive_timeouts: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            training_interval_ms: 250,
            sync_interval_ms: 2_000,
            pong_timeout_ms: 1_000,
            max_consecutive_timeouts: 3,
        }
    }
}

impl ExchangeConfig {
    pub fn training_interval(&self) -> Duration {
        Duration::from_millis(self.training_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.training_interval_ms == 0 || self.sync_interval_ms == 0 {
            return invalid("exchange intervals must be non-zero");
        }
        if self.pong_timeout_ms == 0 {
            return invalid("exchange.pong_timeout_ms must be non-zero");
        }
        if self.max_consecutive_timeouts == 0 {
            return invalid("exchange.max_consecutive_timeouts must be at least 1");
        }
        Ok(())
    }
}

/// Peer-side configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub namespace: String,
    pub exchange: ExchangeConfig,
    pub estimator: EstimatorConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            exchange: ExchangeConfig::default(),
            estimator: EstimatorConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        validate_namespace(&self.namespace)?;
        self.exchange.validate()?;
        self.estimator.validate()
    }
}

/// Reference-side configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub namespace: String,
    /// Also measure every peer's clock from the reference
    pub probe_peers: bool,
    pub exchange: ExchangeConfig,
    pub estimator: EstimatorConfig,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            probe_peers: false,
            exchange: ExchangeConfig::default(),
            estimator: EstimatorConfig::default(),
        }
    }
}

impl ReferenceConfig {
    pub fn validate(&self) -> Result<()> {
        validate_namespace(&self.namespace)?;
        self.exchange.validate()?;
        self.estimator.validate()
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.trim().is_empty() {
        return invalid("namespace must not be empty");
    }
    Ok(())
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SyncError::InvalidConfig(format!(
            "{name} must be a positive number of seconds, got {value}"
        )))
    }
}

fn invalid(message: &str) -> Result<()> {
    Err(SyncError::InvalidConfig(message.to_string()))
}
