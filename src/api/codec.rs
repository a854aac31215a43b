//! Frame codec
//!
//! Both the local and the upstream transports carry newline-delimited JSON
//! frames. A request frame is always answered by exactly one reply frame on
//! the same stream.

use log::trace;
use serde::{Deserialize, Serialize};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::{Connection, NetworkServiceRequest};
use crate::common::{ErrorKind, ProxyError, Result};

/// Upper bound for a single encoded frame
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Messages exchanged on a mesh stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Establish or refresh a connection
    Request { request: NetworkServiceRequest },
    /// Tear a connection down
    Close { connection: Connection },
    /// Reply to `Request`
    Connection { connection: Connection },
    /// Reply to `Close`
    Closed,
    /// Reply to either request when it failed
    Error { kind: ErrorKind, message: String },
}

impl Frame {
    /// Encode an error as a reply frame
    pub fn error(err: &ProxyError) -> Self {
        Frame::Error {
            kind: err.kind(),
            message: err.message(),
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "request",
            Frame::Close { .. } => "close",
            Frame::Connection { .. } => "connection",
            Frame::Closed => "closed",
            Frame::Error { .. } => "error",
        }
    }

    /// Interpret a reply to a `Request` frame
    pub fn into_connection(self) -> Result<Connection> {
        match self {
            Frame::Connection { connection } => Ok(connection),
            Frame::Error { kind, message } => Err(ProxyError::from_wire(kind, message)),
            other => Err(ProxyError::Protocol(format!(
                "Unexpected '{}' frame in reply to request",
                other.name()
            ))),
        }
    }

    /// Interpret a reply to a `Close` frame
    pub fn into_closed(self) -> Result<()> {
        match self {
            Frame::Closed => Ok(()),
            Frame::Error { kind, message } => Err(ProxyError::from_wire(kind, message)),
            other => Err(ProxyError::Protocol(format!(
                "Unexpected '{}' frame in reply to close",
                other.name()
            ))),
        }
    }
}

/// Framed stream over any bidirectional byte stream
///
/// Lines are cut by [`LinesCodec`]. A line longer than [`MAX_FRAME_LEN`] is
/// reported once as a protocol error and skipped up to its newline, so the
/// next frame is read intact.
pub struct FrameStream<S> {
    stream: S,
    codec: LinesCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            codec: LinesCodec::new_with_max_length(MAX_FRAME_LEN),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::new(),
        }
    }

    /// Underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Underlying stream, for writes that bypass framing
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Read the next frame
    ///
    /// Returns `Ok(None)` when the peer closed the stream. Cancel safe: bytes
    /// already received stay buffered for the next call.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let line = match self.codec.decode(&mut self.read_buf).map_err(line_error)? {
                Some(line) => line,
                None => {
                    let n = self.stream.read_buf(&mut self.read_buf).await?;
                    if n != 0 {
                        continue;
                    }
                    match self.codec.decode_eof(&mut self.read_buf).map_err(line_error)? {
                        Some(line) => line,
                        None => return Ok(None),
                    }
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let frame: Frame = serde_json::from_str(trimmed)?;
            trace!("Received '{}' frame", frame.name());
            return Ok(Some(frame));
        }
    }

    /// Write a frame and flush it
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let line = serde_json::to_string(frame)?;
        self.write_buf.clear();
        self.codec.encode(line, &mut self.write_buf).map_err(line_error)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        trace!("Sent '{}' frame", frame.name());
        Ok(())
    }

    /// Send a frame and wait for its reply
    pub async fn call(&mut self, frame: &Frame) -> Result<Frame> {
        self.write_frame(frame).await?;
        self.read_frame()
            .await?
            .ok_or_else(|| ProxyError::UpstreamUnreachable("Connection closed by peer".to_string()))
    }

    /// Shut the write side down
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn line_error(err: LinesCodecError) -> ProxyError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            ProxyError::Protocol(format!("Frame exceeds {} bytes", MAX_FRAME_LEN))
        }
        LinesCodecError::Io(e) => e.into(),
    }
}
