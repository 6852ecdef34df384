//! The host's per-call submission connection.
//!
//! A [`FireChannel`] is one TCP connection to the device listener, opened by
//! the dispatcher for a single call. The write half carries the request
//! frame, rewritten on every retry tick until acknowledged. The read half is
//! drained by a background task: acknowledgments become
//! [`ChannelEvent::Acked`], response frames are delivered straight to the
//! [`CallbackCorrelator`], and end of stream becomes
//! [`ChannelEvent::Closed`].
//!
//! Each channel carries a generation number so the dispatcher can ignore
//! events from a channel it has already replaced.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::correlator::{CallbackCorrelator, DeliveryStatus, DeviceReply};
use crate::envelope::DeviceMessage;
use crate::wire::{read_frame, FrameLimits};

/// Something observed on a fire channel's read half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The device acknowledged receipt of `id`.
    Acked { generation: u64, id: String },
    /// The connection ended or produced an unreadable frame.
    Closed { generation: u64, reason: String },
}

/// An open submission connection.
pub struct FireChannel {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
    local_addr: SocketAddr,
    generation: u64,
}

impl FireChannel {
    /// Connect to `address` within `connect_timeout` and start the reader.
    pub async fn open(
        address: &str,
        generation: u64,
        connect_timeout: Duration,
        limits: FrameLimits,
        correlator: CallbackCorrelator,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> io::Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let (read_half, writer) = stream.into_split();
        let reader = tokio::spawn(read_loop(generation, read_half, limits, correlator, events));
        debug!(address, %local_addr, generation, "fire channel open");
        Ok(Self {
            writer,
            reader,
            local_addr,
            generation,
        })
    }

    /// The local socket address, reported to the device as the callback
    /// address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write one complete encoded frame.
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await
    }
}

impl Drop for FireChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    generation: u64,
    mut reader: OwnedReadHalf,
    limits: FrameLimits,
    correlator: CallbackCorrelator,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    loop {
        let frame = match read_frame(&mut reader, &limits).await {
            Ok(frame) => frame,
            Err(e) => {
                let _ = events.send(ChannelEvent::Closed {
                    generation,
                    reason: e.to_string(),
                });
                return;
            }
        };

        match DeviceMessage::from_frame(frame) {
            Ok(DeviceMessage::Ack { id }) => {
                trace!(id = %id, generation, "ack");
                if events.send(ChannelEvent::Acked { generation, id }).is_err() {
                    return;
                }
            }
            Ok(DeviceMessage::Response { envelope, binary }) => {
                let id = envelope.id.clone();
                let reply = DeviceReply { envelope, binary };
                if correlator.deliver(&id, reply) == DeliveryStatus::NotFound {
                    debug!(id = %id, "late or duplicate response ignored");
                }
            }
            Err(e) => warn!(error = %e, "undecodable frame from device"),
        }
    }
}
