//! Local session handler
//!
//! Runs one local caller's frame loop: every request and close frame is
//! handed to the session exactly once, in arrival order, and its outcome is
//! written back as the reply frame.

use log::{debug, info};
use std::net::SocketAddr;
use tokio::net::TcpStream;

use super::errors::ErrorSender;
use super::session::Session;
use crate::api::{Frame, FrameStream};
use crate::common::{Context, ProxyError, Result};
use crate::mesh::MeshClient;

/// Handle a single local caller
///
/// Returns once the caller disconnects or `ctx` ends; the session's upstream
/// connection is closed in both cases.
pub async fn handle_local_session(
    ctx: Context,
    stream: TcpStream,
    peer_addr: SocketAddr,
    mesh: MeshClient,
    errors: ErrorSender,
) -> Result<()> {
    let session = Session::new(&ctx, &mesh, errors);
    let mut frames = FrameStream::new(stream);

    let result = serve_frames(&ctx, &session, &mut frames).await;
    session.shutdown().await;
    info!("Local session {} ended ({})", peer_addr, session.state().await);
    result
}

async fn serve_frames(ctx: &Context, session: &Session, frames: &mut FrameStream<TcpStream>) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = ctx.done() => return Ok(()),
            frame = frames.read_frame() => frame,
        };

        let reply = match frame {
            Ok(None) => {
                debug!("Local caller disconnected");
                return Ok(());
            }
            Ok(Some(Frame::Request { request })) => match session.request(request).await {
                Ok(connection) => Frame::Connection { connection },
                Err(e) => Frame::error(&e),
            },
            Ok(Some(Frame::Close { connection })) => match session.close(connection).await {
                Ok(()) => Frame::Closed,
                Err(e) => Frame::error(&e),
            },
            Ok(Some(other)) => Frame::error(&ProxyError::Protocol(format!("unexpected '{}' frame", other.name()))),
            Err(e @ ProxyError::Protocol(_)) => Frame::error(&e),
            Err(e) => return Err(e),
        };
        frames.write_frame(&reply).await?;
    }
}
