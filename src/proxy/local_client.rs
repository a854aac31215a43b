//! Client for the local listener
//!
//! Speaks the local `Request`/`Close` protocol over plain TCP. Used by local
//! callers written in Rust and by tests.

use chrono::Utc;
use std::net::SocketAddr;
use tokio::net::TcpStream;

use crate::api::{Connection, Frame, FrameStream, NetworkServiceRequest, PathSegment};
use crate::common::Result;

/// Lifetime in hours written into the caller's own segment; the proxy re-signs it
const CALLER_SEGMENT_HOURS: i64 = 1;

struct CallerSegment {
    name: String,
    token: String,
}

pub struct LocalClient {
    frames: FrameStream<TcpStream>,
    caller: Option<CallerSegment>,
}

impl LocalClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            frames: FrameStream::new(stream),
            caller: None,
        })
    }

    /// Put a segment named `name` carrying `token` at the head of every
    /// request that arrives with an empty path
    pub fn with_segment(mut self, name: impl Into<String>, token: impl Into<String>) -> Self {
        self.caller = Some(CallerSegment {
            name: name.into(),
            token: token.into(),
        });
        self
    }

    pub async fn request(&mut self, mut request: NetworkServiceRequest) -> Result<Connection> {
        if let Some(caller) = &self.caller {
            let connection = request.connection_mut();
            if connection.path.is_empty() {
                let id = connection.id.clone();
                connection.path.index = 0;
                connection.path.path_segments.push(PathSegment {
                    name: caller.name.clone(),
                    id,
                    token: caller.token.clone(),
                    expires: Utc::now() + chrono::Duration::hours(CALLER_SEGMENT_HOURS),
                });
            }
        }

        self.frames
            .call(&Frame::Request { request })
            .await?
            .into_connection()
    }

    pub async fn close(&mut self, connection: &Connection) -> Result<()> {
        self.frames
            .call(&Frame::Close {
                connection: connection.clone(),
            })
            .await?
            .into_closed()
    }

    /// Hang up; the proxy closes the session's upstream connection
    pub async fn shutdown(mut self) -> Result<()> {
        self.frames.shutdown().await
    }
}
