//! The transport multiplexer owned by the worker.
//!
//! `TransportMux` gathers the four channels the backend speaks on: two
//! request/reply channels (peer and console) and two broadcast channels
//! (peer telemetry and console feed). The worker never touches sockets; it
//! polls the mux, receives decoded commands, sends replies, and publishes
//! broadcasts. Process-external delivery is the TCP bridge's job, wired to
//! the [`MuxEndpoints`] half returned by [`TransportMux::new`].
//!
//! Polling follows the two-timeout discipline of the dispatch loop: a zero
//! timeout peeks without waiting, no timeout parks until a request arrives
//! or every request endpoint is gone. At most one message per channel is
//! surfaced per poll.

use std::time::Duration;

use log::debug;
use tokio::sync::{broadcast, mpsc};

use crate::error::{ScopeError, ScopeResult};
use crate::protocol::{self, Command, Origin, Reply};
use crate::transport::framing::{console_body, publish_frames, Envelope, Multipart};

/// Buffered broadcasts per subscriber before the oldest are dropped.
/// Broadcast delivery is lossy by design, a slow subscriber never stalls
/// the worker.
pub const BROADCAST_CAPACITY: usize = 64;

/// Which broadcast channel a publish goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// Fire-and-forget telemetry consumed by the supervisor.
    PeerTelemetry,
    /// Notification feed consumed by operator consoles.
    ConsoleFeed,
}

/// Result of one poll of the request channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Channels with a message ready, at most one entry per channel.
    /// Empty when a finite timeout elapsed with nothing to read.
    Ready(Vec<Origin>),
    /// Every request endpoint is gone and nothing is left to read.
    Disconnected,
}

struct RequestChannel {
    origin: Origin,
    incoming: mpsc::UnboundedReceiver<Multipart>,
    outgoing: mpsc::UnboundedSender<Multipart>,
    pending: Option<Multipart>,
    open: bool,
}

impl RequestChannel {
    /// Move at most one waiting message into the pending slot.
    fn pump(&mut self) {
        if self.pending.is_some() || !self.open {
            return;
        }
        match self.incoming.try_recv() {
            Ok(frames) => self.pending = Some(frames),
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => {
                debug!("{:?} request endpoint disconnected", self.origin);
                self.open = false;
            }
        }
    }

    fn drained(&self) -> bool {
        !self.open && self.pending.is_none()
    }
}

/// The bridge-facing half of one request/reply channel.
pub struct RequestEndpoint {
    /// Requests into the mux.
    pub requests: mpsc::UnboundedSender<Multipart>,
    /// Replies out of the mux.
    pub replies: mpsc::UnboundedReceiver<Multipart>,
}

impl RequestEndpoint {
    /// Submit a request message.
    pub fn send(&self, frames: Multipart) -> ScopeResult<()> {
        self.requests
            .send(frames)
            .map_err(|_| ScopeError::Transport("request channel closed".to_string()))
    }

    /// Wait for the next reply, `None` once the mux is gone.
    pub async fn recv(&mut self) -> Option<Multipart> {
        self.replies.recv().await
    }
}

/// External handles for all four channels.
pub struct MuxEndpoints {
    /// Peer request/reply endpoint.
    pub peer: RequestEndpoint,
    /// Console request/reply endpoint.
    pub console: RequestEndpoint,
    /// Subscribe handle for peer telemetry broadcasts.
    pub peer_telemetry: broadcast::Sender<Multipart>,
    /// Subscribe handle for console feed broadcasts.
    pub console_feed: broadcast::Sender<Multipart>,
}

/// Worker-side bundle of all transport channels.
pub struct TransportMux {
    peer: RequestChannel,
    console: RequestChannel,
    peer_telemetry: broadcast::Sender<Multipart>,
    console_feed: broadcast::Sender<Multipart>,
}

impl TransportMux {
    /// Create the mux and the matching external endpoints.
    pub fn new() -> (Self, MuxEndpoints) {
        let (peer_req_tx, peer_req_rx) = mpsc::unbounded_channel();
        let (peer_rep_tx, peer_rep_rx) = mpsc::unbounded_channel();
        let (console_req_tx, console_req_rx) = mpsc::unbounded_channel();
        let (console_rep_tx, console_rep_rx) = mpsc::unbounded_channel();
        let (peer_telemetry, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (console_feed, _) = broadcast::channel(BROADCAST_CAPACITY);

        let mux = TransportMux {
            peer: RequestChannel {
                origin: Origin::Peer,
                incoming: peer_req_rx,
                outgoing: peer_rep_tx,
                pending: None,
                open: true,
            },
            console: RequestChannel {
                origin: Origin::Console,
                incoming: console_req_rx,
                outgoing: console_rep_tx,
                pending: None,
                open: true,
            },
            peer_telemetry: peer_telemetry.clone(),
            console_feed: console_feed.clone(),
        };
        let endpoints = MuxEndpoints {
            peer: RequestEndpoint {
                requests: peer_req_tx,
                replies: peer_rep_rx,
            },
            console: RequestEndpoint {
                requests: console_req_tx,
                replies: console_rep_rx,
            },
            peer_telemetry,
            console_feed,
        };
        (mux, endpoints)
    }

    /// Poll the request channels.
    ///
    /// `Some(Duration::ZERO)` checks without waiting. Any other finite
    /// timeout waits at most that long. `None` blocks until a message
    /// arrives or every endpoint disconnects.
    pub async fn poll(&mut self, timeout: Option<Duration>) -> PollStatus {
        self.peer.pump();
        self.console.pump();
        if let Some(ready) = self.ready() {
            return PollStatus::Ready(ready);
        }
        if self.peer.drained() && self.console.drained() {
            return PollStatus::Disconnected;
        }
        match timeout {
            Some(limit) if limit.is_zero() => {
                // Keep a running-mode loop from monopolizing the executor.
                tokio::task::yield_now().await;
                PollStatus::Ready(Vec::new())
            }
            Some(limit) => match tokio::time::timeout(limit, self.wait_ready()).await {
                Ok(status) => status,
                Err(_) => PollStatus::Ready(Vec::new()),
            },
            None => self.wait_ready().await,
        }
    }

    fn ready(&self) -> Option<Vec<Origin>> {
        let mut ready = Vec::new();
        if self.peer.pending.is_some() {
            ready.push(Origin::Peer);
        }
        if self.console.pending.is_some() {
            ready.push(Origin::Console);
        }
        if ready.is_empty() {
            None
        } else {
            Some(ready)
        }
    }

    async fn wait_ready(&mut self) -> PollStatus {
        loop {
            if self.peer.drained() && self.console.drained() {
                return PollStatus::Disconnected;
            }
            tokio::select! {
                message = self.peer.incoming.recv(), if self.peer.open => {
                    match message {
                        Some(frames) => {
                            self.peer.pending = Some(frames);
                            return PollStatus::Ready(vec![Origin::Peer]);
                        }
                        None => self.peer.open = false,
                    }
                }
                message = self.console.incoming.recv(), if self.console.open => {
                    match message {
                        Some(frames) => {
                            self.console.pending = Some(frames);
                            return PollStatus::Ready(vec![Origin::Console]);
                        }
                        None => self.console.open = false,
                    }
                }
            }
        }
    }

    /// Take the pending message of a channel and decode it into a command.
    ///
    /// Peer messages must carry their delimiter frame, console messages must
    /// be a single frame. Either way the body must decode into the command
    /// vocabulary.
    pub fn receive(&mut self, origin: Origin) -> ScopeResult<Command> {
        let frames = self
            .channel_mut(origin)
            .pending
            .take()
            .ok_or_else(|| ScopeError::Transport(format!("no message pending on {origin:?}")))?;
        let body = match origin {
            Origin::Peer => Envelope::from_frames(frames)?.0,
            Origin::Console => console_body(frames)?,
        };
        protocol::decode_command(&body)
    }

    /// Send a reply back on the channel a request came from, with that
    /// channel's framing.
    pub fn reply(&mut self, origin: Origin, reply: &Reply) -> ScopeResult<()> {
        let body = reply.to_bytes()?;
        let frames = match origin {
            Origin::Peer => Envelope(body).into_frames(),
            Origin::Console => vec![body],
        };
        self.channel_mut(origin)
            .outgoing
            .send(frames)
            .map_err(|_| ScopeError::Transport(format!("reply channel {origin:?} closed")))
    }

    /// Announce the backend on the peer channel at startup.
    pub fn send_handshake(&mut self) -> ScopeResult<()> {
        let body = serde_json::to_vec(&protocol::handshake())
            .map_err(|e| ScopeError::Internal(e.to_string()))?;
        self.peer
            .outgoing
            .send(Envelope(body).into_frames())
            .map_err(|_| ScopeError::Transport("peer channel closed".to_string()))
    }

    /// Publish `[topic, payload]` on a broadcast channel. Delivery is
    /// fire-and-forget; having no subscribers is not an error.
    pub fn publish(&self, sink: Sink, topic: &str, payload: &serde_json::Value) -> ScopeResult<()> {
        let frames = publish_frames(topic, payload)?;
        let sender = match sink {
            Sink::PeerTelemetry => &self.peer_telemetry,
            Sink::ConsoleFeed => &self.console_feed,
        };
        let _ = sender.send(frames);
        Ok(())
    }

    /// Close every channel. Anything not yet delivered is discarded.
    pub fn shutdown(self) {
        debug!("transport mux closed, undelivered messages discarded");
    }

    fn channel_mut(&mut self, origin: Origin) -> &mut RequestChannel {
        match origin {
            Origin::Peer => &mut self.peer,
            Origin::Console => &mut self.console,
        }
    }
}
