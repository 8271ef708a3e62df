//! Error types for the synchronization core.

use thiserror::Error;

use crate::wire::WireError;

/// Errors surfaced by clients, sessions and the reference facade.
///
/// Sample-level anomalies are not errors: they are reported through
/// [`crate::estimator::SampleRejection`] and never abort a session.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No time source was supplied at construction
    #[error("missing time source: a monotonic clock in seconds is mandatory")]
    MissingTimeSource,

    /// The time source returned a value that cannot be used as seconds
    #[error("invalid time source: probe returned {0}")]
    InvalidTimeSource(f64),

    /// A configuration value is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Wire encoding or decoding failed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// A session for this peer already exists
    #[error("peer {0} is already registered")]
    PeerAlreadyRegistered(String),

    /// No session exists for this peer
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    /// The session was removed while the operation was in progress
    #[error("session for peer {0} is closed")]
    SessionClosed(String),

    /// `start` was called on a running client
    #[error("clock sync client is already running")]
    AlreadyRunning,

    /// The exchange loop ended before the operation completed
    #[error("clock sync loop stopped")]
    Stopped,

    /// The host transport refused an outbound frame
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;
