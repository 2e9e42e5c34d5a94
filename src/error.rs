//! Custom error types for the application.
//!
//! This module defines the primary error type, `ScopeError`, for the entire
//! service. Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify failures so that the dispatch loop can turn each
//! one into the right reply or broadcast.
//!
//! ## Error Hierarchy
//!
//! `ScopeError` is an enum that consolidates the failure classes the worker
//! distinguishes:
//!
//! - **`Config`**: Wraps errors from the `config` crate, typically file parsing
//!   or format issues in the configuration files.
//! - **`Decode`**: A request that could not be understood, either because its
//!   framing was malformed, its command name is not in the vocabulary, or its
//!   parameters failed validation.
//! - **`Admission`**: A well-formed command that is not allowed in the current
//!   worker state.
//! - **`Device`**: A failure reported by the instrument itself while executing
//!   a command or an acquisition step.
//! - **`AcquisitionTimeout`**: The instrument never reported idle within the
//!   configured window. Kept separate from `Device` because the worker reacts
//!   differently to the two.
//! - **`Io` / `Transport`**: Socket-level and channel-level delivery failures.
//!
//! By using `#[from]`, `ScopeError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the service with the
//! `?` operator.

use thiserror::Error;

/// Convenience alias for results using the service error type.
pub type ScopeResult<T> = std::result::Result<T, ScopeError>;

/// Central error type for the oscilloscope backend.
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Request framing, command name, or parameters were malformed.
    #[error("Invalid request: {0}")]
    Decode(String),

    /// Command is not allowed in the current worker state.
    #[error("Command not allowed: {0}")]
    Admission(String),

    /// The instrument reported a fault.
    #[error("Device error: {0}")]
    Device(String),

    /// The instrument never reported idle within the configured window.
    #[error("Acquisition timed out after {timeout_ms} ms")]
    AcquisitionTimeout {
        /// The timeout that was in effect when the acquisition gave up.
        timeout_ms: u64,
    },

    /// Socket-level read or write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An in-process channel was closed on the other side.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A bug surfaced; reported rather than propagated as a panic.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScopeError {
    /// True when the error is the acquisition-timeout case, which the worker
    /// treats differently from a device fault.
    pub fn is_acquisition_timeout(&self) -> bool {
        matches!(self, ScopeError::AcquisitionTimeout { .. })
    }
}
