//! Length-prefixed message codec
//!
//! Each message is a 32-bit big-endian length followed by a JSON-encoded
//! record, carried over one multiplexed substream. Encoding is atomic at
//! the frame level: a message is handed to the multiplexer as a single
//! payload, so the peer never observes a partial write.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::mux::{MuxError, Substream};

/// Ceiling on a single message body.
pub const DEFAULT_MESSAGE_SIZE_LIMIT: u32 = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: stream truncated")]
    MalformedFrame,
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: u32, limit: u32 },
    #[error("schema mismatch: {0}")]
    Schema(#[source] serde_json::Error),
    #[error("connection closed")]
    Closed,
}

/// Typed message framing over one substream.
pub struct MessageStream {
    stream: Substream,
    limit: u32,
}

impl MessageStream {
    #[must_use]
    pub fn new(stream: Substream) -> Self {
        Self {
            stream,
            limit: DEFAULT_MESSAGE_SIZE_LIMIT,
        }
    }

    /// Encode and send one message.
    ///
    /// # Errors
    /// Returns [`CodecError::MessageTooLarge`] above the size ceiling and
    /// [`CodecError::Closed`] if the connection is gone.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), CodecError> {
        let body = serde_json::to_vec(message).map_err(CodecError::Schema)?;
        let size = u32::try_from(body.len()).map_err(|_| CodecError::MessageTooLarge {
            size: u32::MAX,
            limit: self.limit,
        })?;
        if size > self.limit {
            return Err(CodecError::MessageTooLarge {
                size,
                limit: self.limit,
            });
        }

        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(size);
        frame.extend_from_slice(&body);
        self.stream.send(frame.freeze()).await.map_err(map_send)
    }

    /// Receive and decode one message.
    ///
    /// # Errors
    /// Returns [`CodecError::Closed`] on end-of-stream between messages,
    /// [`CodecError::MalformedFrame`] on truncation mid-message,
    /// [`CodecError::MessageTooLarge`] above the size ceiling, and
    /// [`CodecError::Schema`] on a structural mismatch.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        let prefix = match self.stream.recv_exact(4).await {
            Ok(prefix) => prefix,
            Err(MuxError::Closed) => return Err(CodecError::Closed),
            Err(MuxError::Truncated) => return Err(CodecError::MalformedFrame),
        };
        let size = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        if size > self.limit {
            return Err(CodecError::MessageTooLarge {
                size,
                limit: self.limit,
            });
        }

        let body = self
            .stream
            .recv_exact(size as usize)
            .await
            .map_err(|_| CodecError::MalformedFrame)?;
        serde_json::from_slice(&body).map_err(CodecError::Schema)
    }
}

fn map_send(error: MuxError) -> CodecError {
    match error {
        MuxError::Closed => CodecError::Closed,
        MuxError::Truncated => CodecError::MalformedFrame,
    }
}
