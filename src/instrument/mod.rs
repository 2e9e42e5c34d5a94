//! The instrument abstraction the worker drives.
//!
//! Exactly one [`Instrument`] is owned by the worker, which serializes all
//! access through its dispatch loop; the trait therefore takes `&mut self`
//! and needs no interior locking. Implementations translate these semantic
//! operations into whatever command language the physical scope speaks.

pub mod mock;

pub use mock::MockScope;

use async_trait::async_trait;

use crate::error::ScopeResult;
use crate::protocol::TriggerSlope;

/// Control and readout surface of an oscilloscope.
///
/// ## Contract
///
/// - Operations complete before returning; there is no queued or deferred
///   work behind an `Ok`.
/// - Readout reflects the device as it is now. Implementations must not
///   serve cached channel lists or waveforms.
/// - Waveform samples are returned in volts with the device's scale, offset
///   and zero position already applied.
#[async_trait]
pub trait Instrument: Send {
    /// Halt any running acquisition.
    async fn stop_acquisition(&mut self) -> ScopeResult<()>;

    /// Arm the device for a single capture sequence.
    async fn arm_single_sequence(&mut self) -> ScopeResult<()>;

    /// Start the armed acquisition.
    async fn start_acquisition(&mut self) -> ScopeResult<()>;

    /// Whether the device is still acquiring.
    async fn is_busy(&mut self) -> ScopeResult<bool>;

    /// Channels currently enabled on the device, queried fresh.
    async fn active_channels(&mut self) -> ScopeResult<Vec<u32>>;

    /// Read the latest capture of one channel, in volts.
    async fn read_waveform(&mut self, channel: u32) -> ScopeResult<Vec<f64>>;

    /// Seconds between consecutive samples, shared by all channels of a
    /// capture.
    async fn time_increment(&mut self) -> ScopeResult<f64>;

    /// Enable or disable a display channel.
    async fn set_channel_enabled(&mut self, channel: u32, enabled: bool) -> ScopeResult<()>;

    /// Set a channel's vertical scale in volts per division.
    async fn set_channel_scale(&mut self, channel: u32, volts_per_div: f64) -> ScopeResult<()>;

    /// Select the trigger source channel.
    async fn set_trigger_channel(&mut self, channel: u32) -> ScopeResult<()>;

    /// Select the trigger edge.
    async fn set_trigger_slope(&mut self, slope: TriggerSlope) -> ScopeResult<()>;

    /// Set the trigger level in volts.
    async fn set_trigger_level(&mut self, level: f64) -> ScopeResult<()>;

    /// Set the horizontal scale in seconds per division.
    async fn set_time_division(&mut self, seconds_per_div: f64) -> ScopeResult<()>;

    /// Send a raw query string and return the device's textual response.
    async fn query(&mut self, query: &str) -> ScopeResult<String>;

    /// Send a raw command string with no response expected.
    async fn write(&mut self, command: &str) -> ScopeResult<()>;
}
