//! Message types for the sequencer actor
//!
//! Every request to the engine is a [`SyncCommand`] carrying a oneshot
//! responder. The sequencer task is the only place run state changes, so
//! callers never share mutable state with it.

use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::{FluxMode, SyncMode};
use crate::engine::{ExposureSample, TriggerLevel};
use crate::error::SyncResult;

/// Options for a single synchronization run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerRequest {
    /// Protocol override; `None` uses the protocol selected at startup
    pub protocol: Option<SyncMode>,
}

impl TriggerRequest {
    pub fn with_protocol(protocol: SyncMode) -> Self {
        Self {
            protocol: Some(protocol),
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Monotonic run number since engine start
    pub run_id: u64,
    pub protocol: SyncMode,
    pub sample: ExposureSample,
    /// Present from the second exposure of a scan on
    pub duty_cycle: Option<f64>,
    /// Whether this run was part of a running scan
    pub in_scan: bool,
    /// Whether this run captured the scan's final point
    pub scan_completed: bool,
}

/// Which abort was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbortKind {
    /// Raised by the scan engine: stop this run
    Scan,
    /// Operator: stop everything including motion
    Master,
}

/// What an abort did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbortReport {
    pub kind: AbortKind,
    pub run_cancelled: bool,
    pub flux_stopped: bool,
    pub samples_cleared: usize,
    pub axes_stopped: usize,
}

/// Commands that can be sent to the sequencer
#[derive(Debug)]
pub enum SyncCommand {
    /// Start a run; answered when the run finishes
    Trigger {
        request: TriggerRequest,
        response: oneshot::Sender<SyncResult<RunSummary>>,
    },

    /// Scan or master abort
    Abort {
        kind: AbortKind,
        response: oneshot::Sender<AbortReport>,
    },

    /// Write the trigger line directly
    FireTrigger {
        level: TriggerLevel,
        response: oneshot::Sender<SyncResult<()>>,
    },

    /// Select the flux source used by subsequent runs
    SetFluxMode {
        mode: FluxMode,
        response: oneshot::Sender<()>,
    },

    /// Enable or disable end-of-scan reporting
    SetReporting {
        enabled: bool,
        response: oneshot::Sender<()>,
    },

    /// Samples accumulated for the scan in progress
    GetSamples {
        response: oneshot::Sender<Vec<ExposureSample>>,
    },

    /// Abort any run, switch the source off and stop all engine tasks
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

impl SyncCommand {
    /// Helper to create a Trigger command
    pub fn trigger(request: TriggerRequest) -> (Self, oneshot::Receiver<SyncResult<RunSummary>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Trigger { request, response: tx }, rx)
    }

    /// Helper to create an Abort command
    pub fn abort(kind: AbortKind) -> (Self, oneshot::Receiver<AbortReport>) {
        let (tx, rx) = oneshot::channel();
        (Self::Abort { kind, response: tx }, rx)
    }

    /// Helper to create a FireTrigger command
    pub fn fire_trigger(level: TriggerLevel) -> (Self, oneshot::Receiver<SyncResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::FireTrigger { level, response: tx }, rx)
    }

    /// Helper to create a SetFluxMode command
    pub fn set_flux_mode(mode: FluxMode) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetFluxMode { mode, response: tx }, rx)
    }

    /// Helper to create a SetReporting command
    pub fn set_reporting(enabled: bool) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetReporting { enabled, response: tx }, rx)
    }

    /// Helper to create a GetSamples command
    pub fn get_samples() -> (Self, oneshot::Receiver<Vec<ExposureSample>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetSamples { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
