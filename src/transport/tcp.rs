//! TCP bridge between the in-process channels and the outside world.
//!
//! Each of the four channels gets its own listener. Request listeners accept
//! one client at a time and pump length-prefixed multipart messages in both
//! directions; broadcast listeners accept any number of subscribers and fan
//! the feed out to all of them. A slow or dead subscriber is dropped, never
//! waited on.

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::error::{ScopeError, ScopeResult};
use crate::transport::framing::{encode_multipart, Multipart, MAX_FRAMES, MAX_FRAME_LEN};
use crate::transport::mux::RequestEndpoint;

/// Serve one request/reply channel.
///
/// Clients are handled strictly one at a time; the channel is a dialogue
/// with a single supervisor or console process, not a public API.
pub async fn serve_requests(listener: TcpListener, mut endpoint: RequestEndpoint) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("request listener accept failed: {e}");
                continue;
            }
        };
        info!("request client connected from {addr}");
        match pump_request_stream(stream, &mut endpoint).await {
            Ok(()) => info!("request client {addr} disconnected"),
            Err(ScopeError::Transport(reason)) => {
                // The mux side is gone, so there is no one left to serve.
                debug!("request bridge stopping: {reason}");
                return;
            }
            Err(e) => warn!("request client {addr} dropped: {e}"),
        }
    }
}

async fn pump_request_stream(stream: TcpStream, endpoint: &mut RequestEndpoint) -> ScopeResult<()> {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        tokio::select! {
            message = read_multipart(&mut reader) => {
                match message? {
                    Some(frames) => endpoint.send(frames)?,
                    None => return Ok(()),
                }
            }
            reply = endpoint.recv() => {
                match reply {
                    Some(frames) => write_multipart(&mut writer, &frames).await?,
                    None => return Err(ScopeError::Transport("reply channel closed".to_string())),
                }
            }
        }
    }
}

/// Serve one broadcast channel, fanning the feed out to every subscriber.
pub async fn serve_broadcasts(listener: TcpListener, feed: broadcast::Sender<Multipart>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("broadcast listener accept failed: {e}");
                continue;
            }
        };
        info!("broadcast subscriber connected from {addr}");
        let receiver = feed.subscribe();
        tokio::spawn(async move {
            if let Err(e) = pump_broadcast_stream(stream, receiver).await {
                debug!("broadcast subscriber {addr} dropped: {e}");
            }
        });
    }
}

async fn pump_broadcast_stream(
    mut stream: TcpStream,
    mut receiver: broadcast::Receiver<Multipart>,
) -> ScopeResult<()> {
    loop {
        match receiver.recv().await {
            Ok(frames) => stream.write_all(&encode_multipart(&frames)).await?,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("broadcast subscriber lagged, {missed} messages skipped");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// Read one length-prefixed multipart message, `None` on a clean EOF at a
/// message boundary.
async fn read_multipart(reader: &mut OwnedReadHalf) -> ScopeResult<Option<Multipart>> {
    let count = match reader.read_u32_le().await {
        Ok(count) => count as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if count > MAX_FRAMES {
        return Err(ScopeError::Decode(format!(
            "message frame count {count} exceeds limit {MAX_FRAMES}"
        )));
    }
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.read_u32_le().await? as usize;
        if len > MAX_FRAME_LEN {
            return Err(ScopeError::Decode(format!(
                "frame length {len} exceeds limit {MAX_FRAME_LEN}"
            )));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(Some(frames))
}

async fn write_multipart(writer: &mut OwnedWriteHalf, frames: &Multipart) -> ScopeResult<()> {
    writer.write_all(&encode_multipart(frames)).await?;
    Ok(())
}
