//! Wire vocabulary shared by every transport channel.
//!
//! Requests are JSON objects of the form
//! `{"command": "<name>", "params": {...}}` and decode into the closed
//! [`Command`] enum; anything outside the vocabulary is rejected at decode
//! time and never reaches a handler. Replies are JSON objects with a
//! `"status"` of `"ok"` or `"error"`, a `"payload"` or `"message"`, and a
//! fixed `"type": "reply"` marker so console listeners can tell replies from
//! broadcasts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ScopeError, ScopeResult};

/// Broadcast topic names recognized by peers and consoles.
pub mod topics {
    /// Worker state changes, published as the uppercase state name.
    pub const BACKEND_STATE: &str = "backend_state";
    /// Operational errors surfaced outside the request/reply path.
    pub const ERROR: &str = "error";
    /// Combined waveform document for console plotting.
    pub const WAVEFORM: &str = "waveform";
    /// Shared sample interval, published once per acquisition cycle.
    pub const WAVEFORM_TIMEDIV: &str = "waveform_timediv";
    /// Per-channel waveform topics are `waveform_ch<N>`.
    pub const WAVEFORM_CHANNEL_PREFIX: &str = "waveform_ch";

    /// Topic for one channel's waveform samples.
    pub fn waveform_channel(channel: u32) -> String {
        format!("{WAVEFORM_CHANNEL_PREFIX}{channel}")
    }
}

/// Which request channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The supervisor link. Messages carry an empty delimiter frame.
    Peer,
    /// The operator console link. Messages are a single body frame.
    Console,
}

/// Trigger edge selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSlope {
    /// Trigger on the rising edge.
    #[serde(rename = "RISE")]
    Rise,
    /// Trigger on the falling edge.
    #[serde(rename = "FALL")]
    Fall,
}

/// Acquisition mode requested by `set_acquisition_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionMode {
    /// Repeated capture cycles until stopped.
    #[serde(rename = "CONT")]
    Continuous,
    /// Exactly one capture cycle, then back to idle.
    #[serde(rename = "SINGLE")]
    Single,
    /// Stop any running acquisition.
    #[serde(rename = "OFF")]
    Off,
}

/// The closed command vocabulary.
///
/// Decoding is strict: an unrecognized command name, a missing parameter, or
/// a parameter of the wrong type all fail before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum Command {
    /// Enable or disable a display channel.
    SetChannelEnabled { channel: u32, enabled: bool },
    /// Set a channel's vertical scale, in volts per division.
    SetChannelScale { channel: u32, scale: f64 },
    /// Select the trigger source channel.
    SetTriggerChannel { channel: u32 },
    /// Select the trigger edge.
    SetTriggerSlope { slope: TriggerSlope },
    /// Set the trigger level, in volts.
    SetTriggerLevel { level: f64 },
    /// Set the horizontal scale, in seconds per division.
    SetAcquisitionTimediv { level: f64 },
    /// Set the capture settle timeout, in milliseconds.
    SetAcquisitionTimeout { level: u64 },
    /// Set whether continuous mode survives a timed-out cycle.
    SetAcquisitionIgnore { state: bool },
    /// Start or stop an acquisition mode.
    SetAcquisitionMode { state: AcquisitionMode },
    /// Pass a raw query string to the device and return its response.
    RawQuery { query: String },
    /// Pass a raw command string to the device, no response expected.
    RawWrite { command: String },
}

impl Command {
    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetChannelEnabled { .. } => "set_channel_enabled",
            Command::SetChannelScale { .. } => "set_channel_scale",
            Command::SetTriggerChannel { .. } => "set_trigger_channel",
            Command::SetTriggerSlope { .. } => "set_trigger_slope",
            Command::SetTriggerLevel { .. } => "set_trigger_level",
            Command::SetAcquisitionTimediv { .. } => "set_acquisition_timediv",
            Command::SetAcquisitionTimeout { .. } => "set_acquisition_timeout",
            Command::SetAcquisitionIgnore { .. } => "set_acquisition_ignore",
            Command::SetAcquisitionMode { .. } => "set_acquisition_mode",
            Command::RawQuery { .. } => "raw_query",
            Command::RawWrite { .. } => "raw_write",
        }
    }
}

/// Decode one request body into the command vocabulary.
pub fn decode_command(body: &[u8]) -> ScopeResult<Command> {
    serde_json::from_slice(body).map_err(|e| ScopeError::Decode(e.to_string()))
}

/// A decoded request together with the channel it came from, so the reply can
/// be routed back with the right framing.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// The decoded command.
    pub command: Command,
    /// The channel it arrived on.
    pub origin: Origin,
}

/// Reply status marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// The command was carried out.
    #[serde(rename = "ok")]
    Ok,
    /// The command was rejected or failed.
    #[serde(rename = "error")]
    Error,
}

/// Reply sent back on the request channel the command arrived on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Outcome marker.
    pub status: ReplyStatus,
    /// Handler result, present on `ok` replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Human-readable failure description, present on `error` replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Always `"reply"`, so console listeners can tell replies from
    /// broadcasts.
    #[serde(rename = "type")]
    pub kind: String,
}

impl Reply {
    /// Successful reply carrying a handler result.
    pub fn ok(payload: Value) -> Self {
        Reply {
            status: ReplyStatus::Ok,
            payload: Some(payload),
            message: None,
            kind: "reply".to_string(),
        }
    }

    /// Successful reply for a request that had no effect.
    pub fn warning(message: &str) -> Self {
        Reply::ok(Value::String(format!("Warning: {message}")))
    }

    /// Failed reply carrying a human-readable message.
    pub fn error(message: impl Into<String>) -> Self {
        Reply {
            status: ReplyStatus::Error,
            payload: None,
            message: Some(message.into()),
            kind: "reply".to_string(),
        }
    }

    /// True for `"status": "ok"` replies.
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Serialize to the wire body.
    pub fn to_bytes(&self) -> ScopeResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ScopeError::Internal(e.to_string()))
    }
}

/// Startup handshake body, sent once on the peer channel so the supervisor
/// learns the backend's identity as soon as it connects.
pub fn handshake() -> Value {
    serde_json::json!({
        "type": "handshake",
        "payload": format!("scope-bridge {} online", env!("CARGO_PKG_VERSION")),
    })
}
