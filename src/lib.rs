//! # scope-bridge
//!
//! Headless backend that puts an oscilloscope on the network for two kinds
//! of clients: a supervising peer that speaks request/reply with delimiter
//! framing and consumes waveform telemetry, and operator consoles that send
//! bare requests and subscribe to a notification feed.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: The capture cycle (arm, busy-wait, read out) and its
//!   timeout handling.
//! - **`config`**: TOML settings loaded through the `config` crate. See
//!   [`config::Settings`].
//! - **`error`**: The central [`error::ScopeError`] enum; the variants map
//!   one-to-one onto the failure classes the dispatch loop distinguishes.
//! - **`instrument`**: The [`instrument::Instrument`] trait the worker
//!   drives, plus the deterministic [`instrument::MockScope`].
//! - **`protocol`**: The closed command vocabulary, replies and broadcast
//!   topic names.
//! - **`transport`**: Multipart framing, the worker-side channel
//!   multiplexer, and the TCP bridge.
//! - **`worker`**: The single-threaded dispatch loop tying it all together.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod instrument;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use error::{ScopeError, ScopeResult};
