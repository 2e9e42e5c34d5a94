//! Service configuration loaded from TOML files.
//!
//! Settings are read with the `config` crate and deserialized into typed
//! structs, so a malformed file fails at startup with a clear error rather
//! than surfacing mid-run.

use serde::Deserialize;

use crate::acquisition::DEFAULT_TIMEOUT_MS;
use crate::error::{ScopeError, ScopeResult};

/// Top-level settings for the backend service.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Listener addresses for the four transport channels.
    pub transport: TransportSettings,
    /// Acquisition tunables.
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    /// Which instrument to drive.
    #[serde(default)]
    pub instrument: InstrumentSettings,
}

/// One listen address per channel.
#[derive(Debug, Deserialize, Clone)]
pub struct TransportSettings {
    /// Supervisor request/reply channel.
    pub peer_requests: String,
    /// Console request/reply channel.
    pub console_requests: String,
    /// Supervisor telemetry broadcasts.
    pub peer_telemetry: String,
    /// Console notification broadcasts.
    pub console_feed: String,
}

/// Startup values for the acquisition engine.
#[derive(Debug, Deserialize, Clone)]
pub struct AcquisitionSettings {
    /// How long a capture may take to settle, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Whether continuous mode survives a timed-out cycle.
    #[serde(default)]
    pub ignore_timeout: bool,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        AcquisitionSettings {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            ignore_timeout: false,
        }
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Instrument selection.
#[derive(Debug, Deserialize, Clone)]
pub struct InstrumentSettings {
    /// Driver name; only `"mock"` is built in.
    #[serde(default = "default_driver")]
    pub driver: String,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        InstrumentSettings {
            driver: default_driver(),
        }
    }
}

fn default_driver() -> String {
    "mock".to_string()
}

impl Settings {
    /// Load settings from a TOML file, without its extension.
    pub fn load(path: &str) -> ScopeResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()
            .map_err(ScopeError::Config)?;
        Ok(settings)
    }
}
