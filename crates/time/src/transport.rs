//! Host transport seam.
//!
//! The core never owns a socket. Hosts hand it a [`MessageSink`] for
//! outbound frames and push inbound frames through a channel (client side)
//! or [`crate::reference::SyncReference::handle_frame`] (reference side).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};

/// A named message on the logical channel between one peer and the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: String,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(channel: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            channel: channel.into(),
            body,
        }
    }
}

/// Outbound half of a reliable, ordered, per-peer message channel.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<()>;
}

#[async_trait]
impl MessageSink for mpsc::UnboundedSender<Frame> {
    async fn send(&self, frame: Frame) -> Result<()> {
        mpsc::UnboundedSender::send(self, frame)
            .map_err(|_| SyncError::Transport("outbound channel closed".to_string()))
    }
}

#[async_trait]
impl MessageSink for mpsc::Sender<Frame> {
    async fn send(&self, frame: Frame) -> Result<()> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| SyncError::Transport("outbound channel closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unbounded_sender_is_a_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        MessageSink::send(&tx, Frame::new("ns:ping", vec![1, 2, 3]))
            .await
            .unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.channel, "ns:ping");
        assert_eq!(frame.body, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn closed_sink_reports_transport_error() {
        let (tx, rx) = mpsc::unbounded_channel::<Frame>();
        drop(rx);
        let err = MessageSink::send(&tx, Frame::new("ns:pong", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }
}
