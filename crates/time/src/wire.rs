//! Ping/pong wire codec.
//!
//! Bodies are fixed-width little-endian binary produced by `bincode` over
//! plain serde structs: a `u32` correlation id followed by `f64` seconds.
//! A ping is 12 bytes and a pong 28 bytes, small enough to stay within the
//! overhead of a minimal transport frame. Timestamps are never rendered as
//! text so sub-millisecond precision survives the round trip.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token pairing a pong with the ping that caused it.
pub type CorrelationId = u32;

/// Encoded size of a ping body.
pub const PING_LEN: usize = 4 + 8;
/// Encoded size of a pong body.
pub const PONG_LEN: usize = 4 + 3 * 8;

const PING_SUFFIX: &str = "ping";
const PONG_SUFFIX: &str = "pong";

#[derive(Error, Debug)]
pub enum WireError {
    #[error("{kind} body must be {expected} bytes, got {actual}")]
    Length {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("codec failure: {0}")]
    Codec(#[from] bincode::Error),
}

/// Request sent by the side that wants to measure: `(id, t0)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingMessage {
    pub id: CorrelationId,
    pub t0: f64,
}

/// Answer stamped by the responder: `(id, t0, t1, t2)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PongMessage {
    pub id: CorrelationId,
    pub t0: f64,
    pub t1: f64,
    pub t2: f64,
}

pub fn encode_ping(id: CorrelationId, t0: f64) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(PING_LEN);
    bincode::serialize_into(&mut buf, &PingMessage { id, t0 })?;
    Ok(buf)
}

pub fn decode_ping(bytes: &[u8]) -> Result<PingMessage, WireError> {
    check_len("ping", PING_LEN, bytes)?;
    Ok(bincode::deserialize(bytes)?)
}

pub fn encode_pong(id: CorrelationId, t0: f64, t1: f64, t2: f64) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(PONG_LEN);
    bincode::serialize_into(&mut buf, &PongMessage { id, t0, t1, t2 })?;
    Ok(buf)
}

pub fn decode_pong(bytes: &[u8]) -> Result<PongMessage, WireError> {
    check_len("pong", PONG_LEN, bytes)?;
    Ok(bincode::deserialize(bytes)?)
}

fn check_len(kind: &'static str, expected: usize, bytes: &[u8]) -> Result<(), WireError> {
    if bytes.len() != expected {
        return Err(WireError::Length {
            kind,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Which half of the exchange a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Ping,
    Pong,
}

/// Channel names of one sync instance: `<namespace>:ping` and `<namespace>:pong`.
///
/// Namespacing lets several independent sync instances share one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    ping: String,
    pong: String,
}

impl ChannelNames {
    pub fn new(namespace: &str) -> Self {
        Self {
            ping: format!("{namespace}:{PING_SUFFIX}"),
            pong: format!("{namespace}:{PONG_SUFFIX}"),
        }
    }

    pub fn ping(&self) -> &str {
        &self.ping
    }

    pub fn pong(&self) -> &str {
        &self.pong
    }

    /// Classify an inbound channel name; `None` for channels of other instances.
    pub fn classify(&self, channel: &str) -> Option<ChannelKind> {
        if channel == self.ping {
            Some(ChannelKind::Ping)
        } else if channel == self.pong {
            Some(ChannelKind::Pong)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bodies_have_fixed_size() {
        assert_eq!(encode_ping(7, 1.5).unwrap().len(), PING_LEN);
        assert_eq!(encode_pong(7, 1.5, 2.0, 2.25).unwrap().len(), PONG_LEN);
    }

    #[test]
    fn timestamps_survive_with_full_precision() {
        let t0 = 12_345.678_901_234_5;
        let body = encode_pong(u32::MAX, t0, t0 + 1e-7, t0 + 2e-7).unwrap();
        let pong = decode_pong(&body).unwrap();
        assert_eq!(pong.id, u32::MAX);
        assert_eq!(pong.t0.to_bits(), t0.to_bits());
        assert_eq!(pong.t1.to_bits(), (t0 + 1e-7).to_bits());
        assert_eq!(pong.t2.to_bits(), (t0 + 2e-7).to_bits());
    }

    #[test]
    fn layout_is_little_endian_id_then_seconds() {
        let body = encode_ping(1, 0.5).unwrap();
        assert_eq!(&body[..4], &1u32.to_le_bytes());
        assert_eq!(&body[4..], &0.5f64.to_le_bytes());
    }

    #[test]
    fn wrong_lengths_are_rejected() {
        let ping = encode_ping(3, 9.0).unwrap();
        assert!(matches!(
            decode_pong(&ping),
            Err(WireError::Length { expected: PONG_LEN, actual: PING_LEN, .. })
        ));

        let mut long = ping.clone();
        long.push(0);
        assert!(decode_ping(&long).is_err());
        assert!(decode_ping(&[]).is_err());
    }

    #[test]
    fn channel_names_are_namespaced() {
        let names = ChannelNames::new("sw:sync");
        assert_eq!(names.ping(), "sw:sync:ping");
        assert_eq!(names.pong(), "sw:sync:pong");
        assert_eq!(names.classify("sw:sync:ping"), Some(ChannelKind::Ping));
        assert_eq!(names.classify("sw:sync:pong"), Some(ChannelKind::Pong));
        assert_eq!(names.classify("sw:other:ping"), None);
    }
}
