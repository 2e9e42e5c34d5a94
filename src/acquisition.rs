//! The acquisition cycle: arm, wait, read out.
//!
//! A cycle always runs the same device protocol: stop whatever is running,
//! arm a single capture sequence, start it, then poll the device's busy
//! status until it settles or the timeout expires. Status queries are rate
//! limited to one per 10 ms of elapsed time so a slow instrument link is not
//! flooded. After the device settles, every active channel is read out fresh
//! along with the shared sample interval.

use std::time::Duration;

use log::{debug, trace};

use crate::error::{ScopeError, ScopeResult};
use crate::instrument::Instrument;

/// Default wait for a capture to settle.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
/// Elapsed time allotted per busy-status query.
const STATUS_POLL_INTERVAL_MS: u64 = 10;
/// Sleep between gate checks while waiting on the device.
const POLL_YIELD: Duration = Duration::from_millis(1);

/// Everything one completed cycle produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    /// Channel number and samples in volts, in ascending channel order.
    pub waveforms: Vec<(u32, Vec<f64>)>,
    /// Seconds between consecutive samples, shared by all channels.
    pub time_increment: f64,
}

/// Runs acquisition cycles and holds their tunables.
#[derive(Debug, Clone)]
pub struct AcquisitionEngine {
    timeout_ms: u64,
    ignore_timeout: bool,
}

impl AcquisitionEngine {
    /// Engine with the default timeout and timeouts treated as fatal to
    /// continuous mode.
    pub fn new() -> Self {
        AcquisitionEngine {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            ignore_timeout: false,
        }
    }

    /// Change the settle timeout. Zero is rejected, it would time out every
    /// cycle before the first status query.
    pub fn set_timeout_ms(&mut self, timeout_ms: u64) -> ScopeResult<()> {
        if timeout_ms == 0 {
            return Err(ScopeError::Decode(
                "acquisition timeout must be at least 1 ms".to_string(),
            ));
        }
        self.timeout_ms = timeout_ms;
        Ok(())
    }

    /// Current settle timeout in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Whether a timed-out cycle should leave continuous mode running.
    pub fn ignore_timeout(&self) -> bool {
        self.ignore_timeout
    }

    /// Set whether continuous mode survives a timed-out cycle.
    pub fn set_ignore_timeout(&mut self, ignore: bool) {
        self.ignore_timeout = ignore;
    }

    /// Run one full cycle against the device.
    ///
    /// Device faults propagate as [`ScopeError::Device`]; a capture that
    /// never settles is the distinct [`ScopeError::AcquisitionTimeout`].
    pub async fn run_cycle(&self, device: &mut dyn Instrument) -> ScopeResult<Capture> {
        device.stop_acquisition().await?;
        device.arm_single_sequence().await?;
        device.start_acquisition().await?;
        self.wait_until_settled(device).await?;

        let channels = device.active_channels().await?;
        debug!("capture settled, reading {} channel(s)", channels.len());
        let mut waveforms = Vec::with_capacity(channels.len());
        for &channel in &channels {
            waveforms.push((channel, device.read_waveform(channel).await?));
        }
        let time_increment = device.time_increment().await?;
        Ok(Capture {
            waveforms,
            time_increment,
        })
    }

    async fn wait_until_settled(&self, device: &mut dyn Instrument) -> ScopeResult<()> {
        let started = tokio::time::Instant::now();
        let limit = Duration::from_millis(self.timeout_ms);
        let mut queries_issued: u64 = 0;
        loop {
            let elapsed = started.elapsed();
            if elapsed >= limit {
                trace!("capture still busy after {queries_issued} status queries");
                return Err(ScopeError::AcquisitionTimeout {
                    timeout_ms: self.timeout_ms,
                });
            }
            // One status query per STATUS_POLL_INTERVAL_MS of elapsed time.
            if elapsed.as_millis() as u64 / STATUS_POLL_INTERVAL_MS >= queries_issued {
                queries_issued += 1;
                if !device.is_busy().await? {
                    return Ok(());
                }
            }
            tokio::time::sleep(POLL_YIELD).await;
        }
    }
}

impl Default for AcquisitionEngine {
    fn default() -> Self {
        AcquisitionEngine::new()
    }
}
