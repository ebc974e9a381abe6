//! Synchronization engine.
//!
//! [`SyncEngine::start`] wires the device capabilities into a set of tasks:
//!
//! - the Edge Poller, sampling the handshake lines (hard protocol only)
//! - the timing task, turning edges into [`ExposureSample`]s (hard protocol only)
//! - the sequencer actor, owning the run state machine
//!
//! and returns a cloneable [`SyncHandle`] through which triggers, aborts and
//! queries are sent as messages.

pub mod abort;
pub mod cancel;
pub mod flux;
pub mod poller;
pub mod sequencer;
pub mod timing;
pub mod trigger;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{FluxMode, Settings, SyncMode};
use crate::error::{SyncError, SyncResult};
use crate::hardware::{Detector, DigitalLines, FluxSource, MotionAxis, ReportSink, ScanSequencer};
use crate::messages::{AbortKind, AbortReport, RunSummary, SyncCommand, TriggerRequest};

pub use cancel::{cancel_pair, CancelToken, CancelTrigger};
pub use flux::{FluxController, FluxSources};
pub use poller::{DigitalLineState, EdgeKind, LineEdge, PollerHandle, PollerHealth};
pub use sequencer::{RunState, SyncEvent, SyncStatus};
pub use timing::{ExposureSample, TimedExposure, TimingTracker};
pub use trigger::{TriggerDriver, TriggerLevel};

use sequencer::{HardPath, SequencerActor};

/// Device capabilities the engine drives.
#[derive(Clone)]
pub struct SyncDevices {
    pub lines: Arc<dyn DigitalLines>,
    pub detector: Arc<dyn Detector>,
    pub flux: FluxSources,
    pub scan: Arc<dyn ScanSequencer>,
    /// Axes stopped by a master abort
    pub axes: Vec<Arc<dyn MotionAxis>>,
    /// Receives end-of-scan reports when reporting is enabled
    pub reports: Option<Arc<dyn ReportSink>>,
}

impl SyncDevices {
    pub fn new(
        lines: Arc<dyn DigitalLines>,
        detector: Arc<dyn Detector>,
        source_a: Arc<dyn FluxSource>,
        source_b: Arc<dyn FluxSource>,
        scan: Arc<dyn ScanSequencer>,
    ) -> Self {
        Self {
            lines,
            detector,
            flux: FluxSources { source_a, source_b },
            scan,
            axes: Vec::new(),
            reports: None,
        }
    }

    pub fn with_axis(mut self, axis: Arc<dyn MotionAxis>) -> Self {
        self.axes.push(axis);
        self
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.reports = Some(sink);
        self
    }
}

/// Entry point for starting the engine.
pub struct SyncEngine;

impl SyncEngine {
    /// Validate `settings`, bring up the digital I/O path if the hard
    /// protocol is wanted, and spawn the engine tasks.
    ///
    /// A failing digital I/O initialization is not an error: the engine
    /// falls back to the soft protocol and reports itself degraded.
    pub async fn start(settings: Settings, devices: SyncDevices) -> SyncResult<SyncHandle> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let engine = &settings.engine;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut degraded = false;
        let hardware_ready = match engine.sync_mode {
            Some(SyncMode::Soft) => {
                info!("Soft protocol selected, digital I/O not initialized");
                false
            }
            _ => match devices.lines.initialize().await {
                Ok(()) => true,
                Err(err) => {
                    warn!("Digital I/O initialization failed, using soft protocol: {:#}", err);
                    degraded = true;
                    false
                }
            },
        };

        let mut tasks = Vec::new();
        let hard = if hardware_ready {
            let (poller, poller_task) = poller::spawn_poller(
                devices.lines.clone(),
                engine.poll_interval(),
                engine.max_consecutive_read_failures,
                engine.event_capacity,
                shutdown_rx.clone(),
            );
            let (samples, _) = broadcast::channel(engine.event_capacity);
            let timing_task =
                timing::spawn_timing_task(poller.subscribe_edges(), samples.clone(), shutdown_rx.clone());
            tasks.push(poller_task);
            tasks.push(timing_task);

            Some(HardPath {
                trigger: TriggerDriver::new(devices.lines.clone(), engine.trigger_write_timeout()),
                poller,
                samples,
            })
        } else {
            None
        };

        let protocol = if hard.is_some() {
            SyncMode::Hard
        } else {
            SyncMode::Soft
        };
        let lines = hard.as_ref().map(|h| h.poller.lines.clone());

        let (command_tx, command_rx) = mpsc::channel(engine.command_capacity);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(engine.event_capacity);

        let actor = SequencerActor::new(
            settings.clone(),
            devices,
            hard,
            protocol,
            degraded,
            events_tx.clone(),
            updates_tx,
            shutdown_tx,
        );
        let status = actor.status_receiver();
        tasks.push(tokio::spawn(actor.run(command_rx, updates_rx)));

        info!(%protocol, degraded, "Synchronization engine started");

        Ok(SyncHandle {
            commands: command_tx,
            status,
            events: events_tx,
            lines,
            tasks: Arc::new(std::sync::Mutex::new(tasks)),
        })
    }
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
    status: watch::Receiver<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
    lines: Option<watch::Receiver<DigitalLineState>>,
    tasks: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl SyncHandle {
    async fn request<T>(
        &self,
        (command, response): (SyncCommand, tokio::sync::oneshot::Receiver<T>),
    ) -> SyncResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        response.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Run one synchronized exposure and return its timing.
    ///
    /// Rejected with `ConcurrentRunRejected` while another run is active.
    pub async fn trigger(&self, request: TriggerRequest) -> SyncResult<RunSummary> {
        self.request(SyncCommand::trigger(request)).await?
    }

    /// Cancel the active run, switch the source off and discard scan samples.
    pub async fn scan_abort(&self) -> SyncResult<AbortReport> {
        self.request(SyncCommand::abort(AbortKind::Scan)).await
    }

    /// Scan abort without waiting; for callers that must not block.
    pub fn spawn_scan_abort(&self) -> JoinHandle<SyncResult<AbortReport>> {
        let handle = self.clone();
        tokio::spawn(async move { handle.scan_abort().await })
    }

    /// Scan abort plus stopping the scan, moving axes and acquisition.
    pub async fn master_abort(&self) -> SyncResult<AbortReport> {
        self.request(SyncCommand::abort(AbortKind::Master)).await
    }

    /// Drive the trigger line outside a run.
    pub async fn fire_trigger(&self, level: TriggerLevel) -> SyncResult<()> {
        self.request(SyncCommand::fire_trigger(level)).await?
    }

    /// Select the source for subsequent runs. An active run keeps its source.
    pub async fn set_flux_mode(&self, mode: FluxMode) -> SyncResult<()> {
        self.request(SyncCommand::set_flux_mode(mode)).await
    }

    pub async fn set_reporting(&self, enabled: bool) -> SyncResult<()> {
        self.request(SyncCommand::set_reporting(enabled)).await
    }

    /// Samples of the scan in progress.
    pub async fn samples(&self) -> SyncResult<Vec<ExposureSample>> {
        self.request(SyncCommand::get_samples()).await
    }

    /// Abort any run, switch the source off and stop every engine task.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.request(SyncCommand::shutdown()).await?;
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Wait until the run state satisfies `predicate`.
    pub async fn wait_for_state(&self, predicate: impl Fn(RunState) -> bool) -> SyncResult<RunState> {
        let mut status = self.status.clone();
        let current = status
            .wait_for(|s| predicate(s.run_state))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        Ok(current.run_state)
    }

    pub fn run_state(&self) -> RunState {
        self.status.borrow().run_state
    }

    pub fn flux_mode(&self) -> FluxMode {
        self.status.borrow().flux_mode
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.status.borrow().protocol
    }

    pub fn is_degraded(&self) -> bool {
        self.status.borrow().degraded
    }

    pub fn last_sample(&self) -> Option<ExposureSample> {
        self.status.borrow().last_sample
    }

    /// Seconds from exposure start to trigger-ready reassertion in the last
    /// exposure (exposure plus readout).
    pub fn shutter_duration(&self) -> Option<f64> {
        self.last_sample().map(|s| s.shutter_duration)
    }

    pub fn idle_duration(&self) -> Option<f64> {
        self.last_sample().map(|s| s.idle_duration)
    }

    pub fn ready_to_expose_delay(&self) -> Option<f64> {
        self.last_sample().map(|s| s.ready_to_expose_delay)
    }

    /// Duty cycle percentage of the last exposure within a scan.
    pub fn duty_cycle(&self) -> Option<f64> {
        self.status.borrow().duty_cycle
    }

    /// Latest sampled line levels; `None` without a digital I/O path.
    pub fn line_state(&self) -> Option<DigitalLineState> {
        self.lines.as_ref().map(|rx| *rx.borrow())
    }
}
