//! Metronome Time Library
//!
//! Keeps the clocks of many peers mapped onto one trusted reference clock
//! using NTP-style four-timestamp round trips.
//!
//! # Features
//! - Compact ping/pong wire codec with exact-length validation
//! - Offset and drift estimation from the lowest-delay recent samples
//! - Outlier and discontinuity handling with automatic retraining
//! - Adaptive exchange cadence and degraded-connectivity reporting
//! - Per-peer reference sessions with isolated state
//! - Transport-agnostic: hosts plug in a [`transport::MessageSink`]

pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod estimator;
pub mod exchange;
pub mod reference;
pub mod report;
pub mod sample;
pub mod session;
pub mod time_source;
pub mod transport;
pub mod wire;

pub use client::{ClientOptions, ClockSyncClient, ReportCallback};
pub use config::{ClientConfig, EstimatorConfig, ExchangeConfig, ReferenceConfig};
pub use error::{Result, SyncError};
pub use estimator::{ClockModel, RoundTripEstimator, SampleRejection};
pub use reference::{ReferenceOptions, SyncReference};
pub use report::{Connectivity, Report, ReportHub, Subscription, SyncStatus};
pub use sample::TimeSample;
pub use session::{PeerId, PeerSyncSession, SessionRegistry};
pub use time_source::{
    validate_time_source, ManualClock, MonotonicClock, OffsetClock, SharedTimeSource, TimeSource,
};
pub use transport::{Frame, MessageSink};
pub use wire::{ChannelKind, ChannelNames, CorrelationId, PingMessage, PongMessage, WireError};
