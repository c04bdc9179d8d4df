//! Stream multiplexer
//!
//! Splits one ordered, reliable duplex byte stream into the session's
//! logical substreams. Frames carry (channel, length, payload); a
//! zero-length frame is a FIN for its channel. Reads and writes run on
//! dedicated tasks, so a blocked reader on one channel never stalls
//! writes on another, and closing the underlying connection unblocks
//! every substream with an error.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Control requests and responses.
pub const CHANNEL_CONTROL: u8 = 0;
/// Outbound file content, served to the peer's stager.
pub const CHANNEL_RSYNC_SERVER: u8 = 1;
/// Inbound file content for the local stager.
pub const CHANNEL_RSYNC_CLIENT: u8 = 2;
/// Coalesced filesystem change ticks.
pub const CHANNEL_WATCH_EVENTS: u8 = 3;
/// Staging progress snapshots.
pub const CHANNEL_RSYNC_STATE: u8 = 4;

pub const CHANNEL_COUNT: usize = 5;

/// Ceiling on a single frame's payload.
pub const MAXIMUM_FRAME_LENGTH: u32 = 64 * 1024 * 1024;

/// Per-channel inbound buffering, in frames.
const INBOUND_BUFFER_FRAMES: usize = 64;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("connection closed")]
    Closed,
    #[error("stream truncated mid-read")]
    Truncated,
}

struct Frame {
    channel: u8,
    payload: Bytes,
}

/// One ordered byte stream within the multiplexed connection.
pub struct Substream {
    channel: u8,
    incoming: mpsc::Receiver<Bytes>,
    outgoing: mpsc::Sender<Frame>,
    pending: BytesMut,
}

impl Substream {
    /// Receive exactly `length` bytes, spanning frame boundaries as
    /// needed.
    ///
    /// # Errors
    /// Returns [`MuxError::Closed`] if the stream ends before any byte of
    /// the read, [`MuxError::Truncated`] if it ends mid-read.
    pub async fn recv_exact(&mut self, length: usize) -> Result<Bytes, MuxError> {
        loop {
            if self.pending.len() >= length {
                return Ok(self.pending.split_to(length).freeze());
            }
            match self.incoming.recv().await {
                Some(bytes) => self.pending.extend_from_slice(&bytes),
                None if self.pending.is_empty() => return Err(MuxError::Closed),
                None => return Err(MuxError::Truncated),
            }
        }
    }

    /// Send one payload as a single frame. The payload is delivered to
    /// the peer's substream intact and in order.
    ///
    /// # Errors
    /// Returns [`MuxError::Closed`] if the connection is gone.
    pub async fn send(&mut self, payload: Bytes) -> Result<(), MuxError> {
        if payload.is_empty() {
            return Ok(());
        }
        self.outgoing
            .send(Frame {
                channel: self.channel,
                payload,
            })
            .await
            .map_err(|_| MuxError::Closed)
    }

    /// Signal end-of-stream to the peer's side of this channel only.
    ///
    /// # Errors
    /// Returns [`MuxError::Closed`] if the connection is gone.
    pub async fn finish(self) -> Result<(), MuxError> {
        self.outgoing
            .send(Frame {
                channel: self.channel,
                payload: Bytes::new(),
            })
            .await
            .map_err(|_| MuxError::Closed)
    }
}

/// The session's substreams, one per logical channel.
pub struct Channels {
    pub control: Substream,
    pub rsync_server: Substream,
    pub rsync_client: Substream,
    pub watch_events: Substream,
    pub rsync_state: Substream,
}

fn substream(
    channel: u8,
    inbound: &mut Vec<mpsc::Sender<Bytes>>,
    frames: &mpsc::Sender<Frame>,
) -> Substream {
    let (tx, rx) = mpsc::channel(INBOUND_BUFFER_FRAMES);
    inbound.push(tx);
    Substream {
        channel,
        incoming: rx,
        outgoing: frames.clone(),
        pending: BytesMut::new(),
    }
}

/// Multiplex a duplex connection (as read and write halves) into the
/// session's channels. Spawns the routing tasks; they terminate when the
/// connection closes or every substream is dropped.
pub fn multiplex<R, W>(reader: R, writer: W) -> Channels
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(CHANNEL_COUNT * 4);
    let mut inbound = Vec::with_capacity(CHANNEL_COUNT);

    let channels = Channels {
        control: substream(CHANNEL_CONTROL, &mut inbound, &frame_tx),
        rsync_server: substream(CHANNEL_RSYNC_SERVER, &mut inbound, &frame_tx),
        rsync_client: substream(CHANNEL_RSYNC_CLIENT, &mut inbound, &frame_tx),
        watch_events: substream(CHANNEL_WATCH_EVENTS, &mut inbound, &frame_tx),
        rsync_state: substream(CHANNEL_RSYNC_STATE, &mut inbound, &frame_tx),
    };
    drop(frame_tx);

    tokio::spawn(route_inbound(reader, inbound));
    tokio::spawn(route_outbound(writer, frame_rx));

    channels
}

/// Read frames off the connection and hand each to its channel's buffer.
/// Any read failure or malformed frame ends the loop; dropping the
/// senders then unblocks every pending substream read.
async fn route_inbound<R>(mut reader: R, senders: Vec<mpsc::Sender<Bytes>>)
where
    R: AsyncRead + Unpin,
{
    let mut senders: Vec<Option<mpsc::Sender<Bytes>>> = senders.into_iter().map(Some).collect();
    loop {
        let mut header = [0u8; 5];
        if reader.read_exact(&mut header).await.is_err() {
            return;
        }
        let channel = header[0] as usize;
        let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if channel >= CHANNEL_COUNT || length > MAXIMUM_FRAME_LENGTH {
            return;
        }
        if length == 0 {
            // FIN: close this channel's inbound side only.
            senders[channel] = None;
            continue;
        }
        let mut payload = vec![0u8; length as usize];
        if reader.read_exact(&mut payload).await.is_err() {
            return;
        }
        if let Some(sender) = &senders[channel] {
            if sender.send(Bytes::from(payload)).await.is_err() {
                // Receiver dropped; discard further traffic on the channel.
                senders[channel] = None;
            }
        }
    }
}

/// Serialize outbound frames onto the connection. A write failure ends
/// the loop; dropping the receiver then fails every substream send.
async fn route_outbound<W>(mut writer: W, mut frames: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let mut header = [0u8; 5];
        header[0] = frame.channel;
        header[1..5].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());
        if writer.write_all(&header).await.is_err() {
            return;
        }
        if writer.write_all(&frame.payload).await.is_err() {
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}
