//! Multipart message framing.
//!
//! Every message on every channel is a sequence of byte frames. Peer
//! request/reply traffic is wrapped in an [`Envelope`]: a leading empty
//! delimiter frame followed by the body, as the supervisor's router expects.
//! Console traffic is a bare single-frame body, and broadcasts are
//! `[topic, payload]` pairs.
//!
//! For the TCP bridge the frame sequence is flattened into bytes with a
//! little-endian length-prefixed layout: a `u32` frame count, then each frame
//! as a `u32` length followed by that many bytes.

use crate::error::{ScopeError, ScopeResult};

/// One wire frame.
pub type Frame = Vec<u8>;
/// One message: an ordered sequence of frames.
pub type Multipart = Vec<Frame>;

/// Upper bound on frames per message. Nothing in the protocol needs more
/// than two.
pub const MAX_FRAMES: usize = 4;
/// Upper bound on a single frame, sized for the largest waveform payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Peer-channel message body behind its empty delimiter frame.
///
/// The delimiter is not optional: a peer message without it, or with a
/// non-empty first frame, is malformed and never reaches command decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope(pub Frame);

impl Envelope {
    /// Wrap a body for transmission on the peer channel.
    pub fn into_frames(self) -> Multipart {
        vec![Vec::new(), self.0]
    }

    /// Strip the delimiter from a received peer message.
    pub fn from_frames(mut frames: Multipart) -> ScopeResult<Self> {
        if frames.len() != 2 {
            return Err(ScopeError::Decode(format!(
                "peer message must be [delimiter, body], got {} frames",
                frames.len()
            )));
        }
        if !frames[0].is_empty() {
            return Err(ScopeError::Decode(
                "peer message delimiter frame is not empty".to_string(),
            ));
        }
        match frames.pop() {
            Some(body) => Ok(Envelope(body)),
            None => Err(ScopeError::Internal(
                "frame vector emptied during unwrap".to_string(),
            )),
        }
    }
}

/// Body of a console-channel message, which carries no delimiter.
pub fn console_body(mut frames: Multipart) -> ScopeResult<Frame> {
    if frames.len() != 1 {
        return Err(ScopeError::Decode(format!(
            "console message must be a single frame, got {}",
            frames.len()
        )));
    }
    match frames.pop() {
        Some(body) => Ok(body),
        None => Err(ScopeError::Internal(
            "frame vector emptied during unwrap".to_string(),
        )),
    }
}

/// Build the `[topic, payload]` pair used on broadcast channels.
pub fn publish_frames(topic: &str, payload: &serde_json::Value) -> ScopeResult<Multipart> {
    let body = serde_json::to_vec(payload).map_err(|e| ScopeError::Internal(e.to_string()))?;
    Ok(vec![topic.as_bytes().to_vec(), body])
}

/// Flatten a multipart message into the length-prefixed byte layout.
pub fn encode_multipart(frames: &Multipart) -> Vec<u8> {
    let total: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut buf = Vec::with_capacity(4 + total);
    buf.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        buf.extend_from_slice(frame);
    }
    buf
}

/// Parse one complete length-prefixed message from a byte slice.
///
/// The slice must contain exactly one message; partial or trailing data is
/// an error. The streaming TCP path reads incrementally instead, this form
/// exists for tests and for decoding buffered messages.
pub fn decode_multipart(data: &[u8]) -> ScopeResult<Multipart> {
    let mut offset = 0;
    let count = read_u32(data, &mut offset)? as usize;
    if count > MAX_FRAMES {
        return Err(ScopeError::Decode(format!(
            "message frame count {count} exceeds limit {MAX_FRAMES}"
        )));
    }
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_u32(data, &mut offset)? as usize;
        if len > MAX_FRAME_LEN {
            return Err(ScopeError::Decode(format!(
                "frame length {len} exceeds limit {MAX_FRAME_LEN}"
            )));
        }
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| ScopeError::Decode("insufficient data for frame body".to_string()))?;
        frames.push(data[offset..end].to_vec());
        offset = end;
    }
    if offset != data.len() {
        return Err(ScopeError::Decode(format!(
            "{} trailing bytes after message",
            data.len() - offset
        )));
    }
    Ok(frames)
}

fn read_u32(data: &[u8], offset: &mut usize) -> ScopeResult<u32> {
    let end = *offset + 4;
    if end > data.len() {
        return Err(ScopeError::Decode(
            "insufficient data for length prefix".to_string(),
        ));
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[*offset..end]);
    *offset = end;
    Ok(u32::from_le_bytes(bytes))
}
