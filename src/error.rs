//! Custom error types for the synchronization engine.
//!
//! This module defines the error taxonomy for the whole crate. Using the
//! `thiserror` crate, every failure a run can hit is classified at the
//! component boundary where it happens, so the sequencer can decide whether to
//! abort the run, degrade, or just log.
//!
//! ## Error Hierarchy
//!
//! `SyncError` consolidates the individual families:
//!
//! - **`Io`**: digital line reads/writes and detector commands. These abort the
//!   current run only; the poller keeps sampling.
//! - **`Flux`**: the flux source refused to reach steady output. `Fault` needs
//!   operator intervention and is never retried.
//! - **`Protocol`**: sequencing violations, such as a trigger request arriving
//!   while another run is in flight, or a run cancelled part-way through.
//! - **`Config`**: configuration could not be loaded or failed validation.
//! - **`EngineStopped`**: the engine's command channel is closed.
//!
//! Device traits in [`crate::hardware`] return `anyhow::Result`; the engine
//! wraps those into [`IoError::Device`] with the failing operation named.

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Top-level error for every engine operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Flux source error: {0}")]
    Flux(#[from] FluxError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Synchronization engine is not running")]
    EngineStopped,
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

/// Digital line and detector command failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IoError {
    #[error("digital input read failed: {0}")]
    Read(String),

    #[error("digital output write returned device status {code}")]
    WriteStatus { code: i32 },

    #[error("digital output write failed: {0}")]
    Write(String),

    #[error("digital output write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("digital line poller stopped after repeated read failures")]
    PollerStopped,

    #[error("{op} failed: {message}")]
    Device { op: &'static str, message: String },
}

impl IoError {
    /// Wraps an opaque device error with the name of the failing operation.
    pub fn device(op: &'static str, err: anyhow::Error) -> Self {
        IoError::Device {
            op,
            message: format!("{err:#}"),
        }
    }
}

/// Reasons the flux source did not reach steady output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FluxError {
    #[error("flux source '{source_name}' is in fault state")]
    Fault { source_name: String },

    #[error("flux source '{source_name}' is still warming up")]
    NotReady { source_name: String },

    #[error("flux source '{source_name}' did not report steady output within {waited:?}")]
    Timeout { source_name: String, waited: Duration },

    #[error("flux source '{source_name}' command failed: {message}")]
    Command { source_name: String, message: String },
}

/// Sequencing violations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("a synchronization run is already in progress")]
    ConcurrentRunRejected,

    #[error("run aborted: {reason}")]
    AbortedMidRun { reason: AbortReason },

    #[error("hard protocol requested but the digital I/O subsystem is unavailable")]
    HardProtocolUnavailable,
}

impl ProtocolError {
    /// Shorthand for a run interrupted by an abort request.
    pub fn cancelled() -> Self {
        ProtocolError::AbortedMidRun {
            reason: AbortReason::Cancelled,
        }
    }
}

/// Why a run stopped before reaching `Settling`.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// An abort request was honored.
    Cancelled,
    /// A bounded handshake wait expired.
    Timeout { line: &'static str, waited: Duration },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Cancelled => write!(f, "cancelled by abort request"),
            AbortReason::Timeout { line, waited } => {
                write!(f, "timed out after {waited:?} waiting for {line}")
            }
        }
    }
}
