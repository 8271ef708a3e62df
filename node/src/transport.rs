//! Length-prefixed TCP framing for clock sync frames.
//!
//! Each frame on the socket is a big-endian `u32` byte count followed by a
//! bincode-encoded [`Frame`].

use anyhow::{Context, Result};
use metronome_time::Frame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Largest encoded frame accepted from or written to a socket.
pub const MAX_FRAME_LEN: usize = 4 * 1024;

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("failed to read frame length"),
    };
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit");
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .context("connection closed mid-frame")?;
    let frame = bincode::deserialize(&buf).context("failed to decode frame")?;
    Ok(Some(frame))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = bincode::serialize(frame).context("failed to encode frame")?;
    if buf.len() > MAX_FRAME_LEN {
        anyhow::bail!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            buf.len()
        );
    }
    writer.write_u32(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// A TCP connection split into frame channels.
pub struct Connection {
    /// Frames queued here are written to the socket in order
    pub outbound: mpsc::UnboundedSender<Frame>,
    /// Frames read from the socket; closes when the peer goes away
    pub inbound: mpsc::UnboundedReceiver<Frame>,
    writer: JoinHandle<()>,
}

impl Connection {
    pub fn spawn(stream: TcpStream, label: String) -> Self {
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Frame>();

        let reader_label = label.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        if inbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("{} closed the connection", reader_label);
                        break;
                    }
                    Err(err) => {
                        warn!("dropping connection to {}: {:#}", reader_label, err);
                        break;
                    }
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = write_frame(&mut write_half, &frame).await {
                    warn!("failed to write to {}: {:#}", label, err);
                    break;
                }
            }
        });

        Self {
            outbound,
            inbound,
            writer,
        }
    }

    /// Stop writing; frames still queued are discarded.
    pub fn close(self) {
        self.writer.abort();
    }
}
