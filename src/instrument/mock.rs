//! A deterministic in-memory oscilloscope.
//!
//! `MockScope` stands in for real hardware in tests and in deployments
//! without an attached device. Acquisition timing is modelled as a countdown
//! of busy polls, so tests can script exactly how many status checks a
//! capture takes, or pin the device busy forever to exercise the timeout
//! path.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::error::{ScopeError, ScopeResult};
use crate::instrument::Instrument;
use crate::protocol::TriggerSlope;

const CHANNEL_COUNT: u32 = 4;

/// Simulated four-channel oscilloscope.
#[derive(Debug, Clone)]
pub struct MockScope {
    channels: BTreeMap<u32, bool>,
    scales: HashMap<u32, f64>,
    samples_per_channel: usize,
    time_increment: f64,
    busy_polls: u32,
    busy_remaining: u32,
    hold_busy: bool,
    start_fault: Option<String>,
    query_replies: HashMap<String, String>,
    writes: Vec<String>,
    trigger_channel: u32,
    trigger_slope: TriggerSlope,
    trigger_level: f64,
    time_division: f64,
    running: bool,
    armed_single: bool,
}

impl MockScope {
    /// A scope with channel 1 enabled, 1000 samples per capture and an
    /// identification reply scripted for `*IDN?`.
    pub fn new() -> Self {
        let mut channels = BTreeMap::new();
        for channel in 1..=CHANNEL_COUNT {
            channels.insert(channel, channel == 1);
        }
        let mut query_replies = HashMap::new();
        query_replies.insert("*IDN?".to_string(), "INSTR,1.0".to_string());
        MockScope {
            channels,
            scales: HashMap::new(),
            samples_per_channel: 1000,
            time_increment: 4e-6,
            busy_polls: 0,
            busy_remaining: 0,
            hold_busy: false,
            start_fault: None,
            query_replies,
            writes: Vec::new(),
            trigger_channel: 1,
            trigger_slope: TriggerSlope::Rise,
            trigger_level: 0.0,
            time_division: 1e-3,
            running: false,
            armed_single: false,
        }
    }

    /// Enable exactly the given channels.
    pub fn with_active_channels(mut self, active: &[u32]) -> Self {
        for enabled in self.channels.values_mut() {
            *enabled = false;
        }
        for channel in active {
            self.channels.insert(*channel, true);
        }
        self
    }

    /// Set the number of samples each capture produces per channel.
    pub fn with_samples_per_channel(mut self, samples: usize) -> Self {
        self.samples_per_channel = samples;
        self
    }

    /// Set the sample interval reported after a capture.
    pub fn with_time_increment(mut self, seconds: f64) -> Self {
        self.time_increment = seconds;
        self
    }

    /// Report busy for the given number of status polls after each start.
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Stay busy forever once started. Used to exercise timeout handling.
    pub fn with_hold_busy(mut self) -> Self {
        self.hold_busy = true;
        self
    }

    /// Fail the next acquisition start with a device error.
    pub fn with_start_fault(mut self, message: &str) -> Self {
        self.start_fault = Some(message.to_string());
        self
    }

    /// Script the reply for one raw query string.
    pub fn with_query_reply(mut self, query: &str, reply: &str) -> Self {
        self.query_replies
            .insert(query.to_string(), reply.to_string());
        self
    }

    /// Raw commands received so far, in order.
    pub fn writes(&self) -> &[String] {
        &self.writes
    }

    /// Whether a channel is currently enabled.
    pub fn channel_enabled(&self, channel: u32) -> bool {
        self.channels.get(&channel).copied().unwrap_or(false)
    }

    /// Last configured trigger level in volts.
    pub fn trigger_level(&self) -> f64 {
        self.trigger_level
    }

    /// Last configured horizontal scale in seconds per division.
    pub fn time_division(&self) -> f64 {
        self.time_division
    }

    fn check_channel(&self, channel: u32) -> ScopeResult<()> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(ScopeError::Device(format!(
                "no such channel: {channel} (device has 1..={CHANNEL_COUNT})"
            )))
        }
    }
}

impl Default for MockScope {
    fn default() -> Self {
        MockScope::new()
    }
}

#[async_trait]
impl Instrument for MockScope {
    async fn stop_acquisition(&mut self) -> ScopeResult<()> {
        self.running = false;
        self.busy_remaining = 0;
        Ok(())
    }

    async fn arm_single_sequence(&mut self) -> ScopeResult<()> {
        self.armed_single = true;
        Ok(())
    }

    async fn start_acquisition(&mut self) -> ScopeResult<()> {
        if let Some(message) = self.start_fault.take() {
            return Err(ScopeError::Device(message));
        }
        self.running = true;
        self.busy_remaining = self.busy_polls;
        Ok(())
    }

    async fn is_busy(&mut self) -> ScopeResult<bool> {
        if !self.running {
            return Ok(false);
        }
        if self.hold_busy {
            return Ok(true);
        }
        if self.busy_remaining > 0 {
            self.busy_remaining -= 1;
            Ok(true)
        } else {
            // A single sequence disarms once the capture completes.
            if self.armed_single {
                self.running = false;
                self.armed_single = false;
            }
            Ok(false)
        }
    }

    async fn active_channels(&mut self) -> ScopeResult<Vec<u32>> {
        Ok(self
            .channels
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(channel, _)| *channel)
            .collect())
    }

    async fn read_waveform(&mut self, channel: u32) -> ScopeResult<Vec<f64>> {
        self.check_channel(channel)?;
        if !self.channel_enabled(channel) {
            return Err(ScopeError::Device(format!(
                "channel {channel} is not enabled"
            )));
        }
        let scale = self.scales.get(&channel).copied().unwrap_or(1.0);
        // Deterministic ramp, distinct per channel.
        Ok((0..self.samples_per_channel)
            .map(|i| scale * (f64::from(channel) + i as f64 * self.time_increment))
            .collect())
    }

    async fn time_increment(&mut self) -> ScopeResult<f64> {
        Ok(self.time_increment)
    }

    async fn set_channel_enabled(&mut self, channel: u32, enabled: bool) -> ScopeResult<()> {
        self.check_channel(channel)?;
        self.channels.insert(channel, enabled);
        Ok(())
    }

    async fn set_channel_scale(&mut self, channel: u32, volts_per_div: f64) -> ScopeResult<()> {
        self.check_channel(channel)?;
        if volts_per_div <= 0.0 {
            return Err(ScopeError::Device(format!(
                "invalid vertical scale: {volts_per_div}"
            )));
        }
        self.scales.insert(channel, volts_per_div);
        Ok(())
    }

    async fn set_trigger_channel(&mut self, channel: u32) -> ScopeResult<()> {
        self.check_channel(channel)?;
        self.trigger_channel = channel;
        Ok(())
    }

    async fn set_trigger_slope(&mut self, slope: TriggerSlope) -> ScopeResult<()> {
        self.trigger_slope = slope;
        Ok(())
    }

    async fn set_trigger_level(&mut self, level: f64) -> ScopeResult<()> {
        self.trigger_level = level;
        Ok(())
    }

    async fn set_time_division(&mut self, seconds_per_div: f64) -> ScopeResult<()> {
        if seconds_per_div <= 0.0 {
            return Err(ScopeError::Device(format!(
                "invalid time division: {seconds_per_div}"
            )));
        }
        self.time_division = seconds_per_div;
        Ok(())
    }

    async fn query(&mut self, query: &str) -> ScopeResult<String> {
        match self.query_replies.get(query) {
            Some(reply) => Ok(reply.clone()),
            None => Err(ScopeError::Device(format!(
                "unrecognized query: '{query}'"
            ))),
        }
    }

    async fn write(&mut self, command: &str) -> ScopeResult<()> {
        self.writes.push(command.to_string());
        Ok(())
    }
}
