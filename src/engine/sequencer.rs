//! Sync Sequencer
//!
//! The sequencer actor owns the authoritative [`RunState`] and the samples of
//! the scan in progress. It processes [`SyncCommand`]s one at a time; each
//! accepted trigger request spawns a short-lived run task that drives
//! Flux Controller -> Trigger Driver -> line handshake and reports progress
//! back as [`RunUpdate`] messages. At most one run is active. Requests that
//! arrive while it is are rejected with
//! [`ProtocolError::ConcurrentRunRejected`].
//!
//! ```text
//! Idle -> AwaitingFluxReady -> AwaitingTriggerReady -> Exposing -> Settling -> Idle
//!                                                  \-- (soft) ----/
//! ```
//!
//! Any error or abort returns the machine to `Idle`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cancel::{cancel_pair, CancelToken, CancelTrigger};
use super::flux::FluxController;
use super::poller::{DigitalLineState, PollerHandle, PollerHealth};
use super::timing::{ExposureSample, TimedExposure};
use super::trigger::{TriggerDriver, TriggerLevel};
use super::SyncDevices;
use crate::config::{EngineConfig, FluxMode, Settings, SyncMode};
use crate::error::{AbortReason, FluxError, IoError, ProtocolError, SyncError, SyncResult};
use crate::hardware::{Detector, DetectorTriggerMode, ImageMode, ImageStatistics, ScanProgress};
use crate::messages::{AbortReport, RunSummary, SyncCommand, TriggerRequest};
use crate::report::{aggregate_after_discard, ScanReport};

/// State of the synchronization state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunState {
    Idle,
    AwaitingFluxReady,
    AwaitingTriggerReady,
    Exposing,
    Settling,
}

/// Snapshot published after every change, for getters and record mirrors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub run_state: RunState,
    /// Protocol used when a request does not override it
    pub protocol: SyncMode,
    /// Hard protocol was wanted but the digital I/O subsystem failed
    pub degraded: bool,
    pub flux_mode: FluxMode,
    pub reporting: bool,
    pub last_sample: Option<ExposureSample>,
    pub duty_cycle: Option<f64>,
    pub scan_samples: usize,
    pub runs_completed: u64,
}

/// Events broadcast by the sequencer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StateChanged { from: RunState, to: RunState },
    SampleCaptured { sample: ExposureSample, duty_cycle: Option<f64> },
    RunFailed { error: SyncError },
    ScanCompleted(Arc<ScanReport>),
    Aborted(AbortReport),
}

/// Digital I/O path available to hard-protocol runs.
#[derive(Clone)]
pub(crate) struct HardPath {
    pub trigger: TriggerDriver,
    pub poller: PollerHandle,
    pub samples: broadcast::Sender<TimedExposure>,
}

/// What a finished run captured.
#[derive(Debug)]
pub(crate) enum RunCapture {
    /// Timed from the detector's handshake lines
    Timed(ExposureSample),
    /// Soft protocol; timed by the run itself
    Soft {
        triggered_at: Instant,
        completed_at: Instant,
    },
}

/// Messages from run tasks back to the sequencer.
#[derive(Debug)]
pub(crate) enum RunUpdate {
    State {
        generation: u64,
        state: RunState,
    },
    Finished {
        generation: u64,
        outcome: SyncResult<RunCapture>,
    },
}

pub(super) struct ActiveRun {
    pub generation: u64,
    pub protocol: SyncMode,
    pub cancel: CancelTrigger,
    pub task: JoinHandle<()>,
    pub responder: oneshot::Sender<SyncResult<RunSummary>>,
}

#[derive(Debug, Default)]
pub(super) struct ScanAccumulator {
    pub samples: Vec<ExposureSample>,
    pub duty_cycles: Vec<f64>,
    pub image_statistics: Vec<ImageStatistics>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ScanAccumulator {
    /// Drop everything; returns how many samples were held.
    pub fn clear(&mut self) -> usize {
        let held = self.samples.len();
        *self = Self::default();
        held
    }
}

/// Actor owning the run state machine.
pub(crate) struct SequencerActor {
    pub(super) settings: Arc<Settings>,
    pub(super) devices: SyncDevices,
    pub(super) hard: Option<HardPath>,
    pub(super) protocol: SyncMode,
    pub(super) degraded: bool,
    pub(super) flux_mode: FluxMode,
    pub(super) reporting: bool,
    pub(super) run_state: RunState,
    pub(super) generation: u64,
    pub(super) runs_completed: u64,
    pub(super) active: Option<ActiveRun>,
    pub(super) engaged_flux: Option<FluxController>,
    pub(super) scan: ScanAccumulator,
    pub(super) last_sample: Option<ExposureSample>,
    pub(super) last_duty: Option<f64>,
    pub(super) last_soft_completion: Option<Instant>,
    pub(super) status_tx: watch::Sender<SyncStatus>,
    pub(super) events_tx: broadcast::Sender<SyncEvent>,
    pub(super) updates_tx: mpsc::UnboundedSender<RunUpdate>,
    pub(super) shutdown_tx: watch::Sender<bool>,
}

impl SequencerActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        settings: Arc<Settings>,
        devices: SyncDevices,
        hard: Option<HardPath>,
        protocol: SyncMode,
        degraded: bool,
        events_tx: broadcast::Sender<SyncEvent>,
        updates_tx: mpsc::UnboundedSender<RunUpdate>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        let flux_mode = settings.flux.mode;
        let reporting = settings.report.enabled;
        let (status_tx, _) = watch::channel(SyncStatus {
            run_state: RunState::Idle,
            protocol,
            degraded,
            flux_mode,
            reporting,
            last_sample: None,
            duty_cycle: None,
            scan_samples: 0,
            runs_completed: 0,
        });
        Self {
            settings,
            devices,
            hard,
            protocol,
            degraded,
            flux_mode,
            reporting,
            run_state: RunState::Idle,
            generation: 0,
            runs_completed: 0,
            active: None,
            engaged_flux: None,
            scan: ScanAccumulator::default(),
            last_sample: None,
            last_duty: None,
            last_soft_completion: None,
            status_tx,
            events_tx,
            updates_tx,
            shutdown_tx,
        }
    }

    pub(crate) fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn snapshot(&self) -> SyncStatus {
        SyncStatus {
            run_state: self.run_state,
            protocol: self.protocol,
            degraded: self.degraded,
            flux_mode: self.flux_mode,
            reporting: self.reporting,
            last_sample: self.last_sample,
            duty_cycle: self.last_duty,
            scan_samples: self.scan.samples.len(),
            runs_completed: self.runs_completed,
        }
    }

    /// Runs the actor event loop until shutdown or until every handle is dropped.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<SyncCommand>,
        mut updates: mpsc::UnboundedReceiver<RunUpdate>,
    ) {
        info!(protocol = %self.protocol, degraded = self.degraded, "Sequencer started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SyncCommand::Shutdown { response }) => {
                        self.shutdown().await;
                        let _ = response.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(update) = updates.recv() => self.handle_update(update).await,
            }
        }

        info!("Sequencer stopped");
    }

    async fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Trigger { request, response } => {
                self.start_run(request, response).await;
            }
            SyncCommand::Abort { kind, response } => {
                let report = self.abort(kind).await;
                let _ = response.send(report);
            }
            SyncCommand::FireTrigger { level, response } => {
                let result = self.fire_manual(level).await;
                let _ = response.send(result);
            }
            SyncCommand::SetFluxMode { mode, response } => {
                info!(from = %self.flux_mode, to = %mode, "Flux mode changed");
                self.flux_mode = mode;
                self.publish_status();
                let _ = response.send(());
            }
            SyncCommand::SetReporting { enabled, response } => {
                if enabled {
                    info!("Post-scan report will be produced");
                }
                self.reporting = enabled;
                self.publish_status();
                let _ = response.send(());
            }
            SyncCommand::GetSamples { response } => {
                let _ = response.send(self.scan.samples.clone());
            }
            SyncCommand::Shutdown { response } => {
                // Intercepted by the event loop.
                let _ = response.send(());
            }
        }
    }

    async fn start_run(
        &mut self,
        request: TriggerRequest,
        responder: oneshot::Sender<SyncResult<RunSummary>>,
    ) {
        if self.active.is_some() || self.run_state != RunState::Idle {
            warn!(state = ?self.run_state, "Trigger request rejected, a run is in progress");
            let _ = responder.send(Err(ProtocolError::ConcurrentRunRejected.into()));
            return;
        }

        let protocol = request.protocol.unwrap_or(self.protocol);
        if protocol == SyncMode::Hard && self.hard.is_none() {
            warn!("Hard protocol requested without a digital I/O subsystem");
            let _ = responder.send(Err(ProtocolError::HardProtocolUnavailable.into()));
            return;
        }

        let flux = FluxController::resolve(&self.settings.flux, self.flux_mode, &self.devices.flux);
        if let Some(previous) = self.engaged_flux.take() {
            if previous.mode() != flux.mode() {
                previous.ensure_off().await;
            }
        }
        self.engaged_flux = Some(flux.clone());

        self.generation += 1;
        let generation = self.generation;
        let (cancel, token) = cancel_pair();
        let context = RunContext {
            generation,
            protocol,
            detector: self.devices.detector.clone(),
            flux,
            hard: self.hard.clone(),
            engine: self.settings.engine.clone(),
            cancel: token,
            updates: self.updates_tx.clone(),
        };

        self.set_state(RunState::AwaitingFluxReady);
        let task = tokio::spawn(context.execute());
        self.active = Some(ActiveRun {
            generation,
            protocol,
            cancel,
            task,
            responder,
        });
        info!(run = generation, %protocol, flux = %self.flux_mode, "Synchronization run started");
    }

    fn is_active(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|run| run.generation == generation)
    }

    async fn handle_update(&mut self, update: RunUpdate) {
        match update {
            RunUpdate::State { generation, state } => {
                if self.is_active(generation) {
                    self.set_state(state);
                }
            }
            RunUpdate::Finished { generation, outcome } => {
                if !self.is_active(generation) {
                    debug!(run = generation, "Ignoring result of a cancelled run");
                    return;
                }
                let Some(run) = self.active.take() else {
                    return;
                };
                let result = match outcome {
                    Ok(capture) => Ok(self.settle(generation, run.protocol, capture).await),
                    Err(err) => {
                        self.fail_run(generation, &err).await;
                        Err(err)
                    }
                };
                let _ = run.responder.send(result);
            }
        }
    }

    /// Integrate a captured exposure with the scan and return to `Idle`.
    async fn settle(&mut self, run_id: u64, protocol: SyncMode, capture: RunCapture) -> RunSummary {
        self.set_state(RunState::Settling);

        let sample = match capture {
            RunCapture::Timed(sample) => sample,
            RunCapture::Soft {
                triggered_at,
                completed_at,
            } => {
                let idle = self
                    .last_soft_completion
                    .map(|previous| triggered_at.saturating_duration_since(previous).as_secs_f64())
                    .unwrap_or(0.0);
                self.last_soft_completion = Some(completed_at);
                ExposureSample {
                    shutter_duration: completed_at
                        .saturating_duration_since(triggered_at)
                        .as_secs_f64(),
                    idle_duration: idle,
                    ready_to_expose_delay: 0.0,
                }
            }
        };
        self.last_sample = Some(sample);

        let progress = match self.devices.scan.progress().await {
            Ok(progress) => progress,
            Err(err) => {
                warn!("Scan progress unavailable, treating as single exposure: {:#}", err);
                ScanProgress::default()
            }
        };

        let mut duty_cycle = None;
        let mut scan_completed = false;

        if progress.running {
            if progress.points_completed == 0 && !self.scan.samples.is_empty() {
                let stale = self.scan.clear();
                warn!(stale, "New scan started, discarding samples of an unfinished scan");
            }
            if self.scan.samples.is_empty() {
                self.scan.started_at = Some(Utc::now());
            }
            self.scan.samples.push(sample);
            if self.scan.samples.len() >= 2 {
                let duty = sample.duty_cycle();
                self.scan.duty_cycles.push(duty);
                self.last_duty = Some(duty);
                duty_cycle = Some(duty);
            }
            if self.reporting {
                match self.devices.detector.image_statistics().await {
                    Ok(Some(stats)) => self.scan.image_statistics.push(stats),
                    Ok(None) => {}
                    Err(err) => warn!("Failed to read image statistics: {:#}", err),
                }
            }

            let is_final = progress.is_final_point();
            if let Err(err) = self.devices.scan.release_wait().await {
                warn!("Failed to release scan wait gate: {:#}", err);
            }
            if is_final {
                self.complete_scan(protocol, progress).await;
                scan_completed = true;
            }
        } else {
            let stale = self.scan.clear();
            if stale > 0 {
                info!(stale, "Scan no longer running, discarding its samples");
            }
            if let Some(flux) = self.engaged_flux.take() {
                flux.ensure_off().await;
            }
        }

        let _ = self.events_tx.send(SyncEvent::SampleCaptured { sample, duty_cycle });
        self.runs_completed += 1;
        self.set_state(RunState::Idle);
        info!(run = run_id, ?duty_cycle, "Synchronization run completed");

        RunSummary {
            run_id,
            protocol,
            sample,
            duty_cycle,
            in_scan: progress.running,
            scan_completed,
        }
    }

    async fn complete_scan(&mut self, protocol: SyncMode, progress: ScanProgress) {
        let flux = self.engaged_flux.take();
        let flux_mode = flux.as_ref().map(FluxController::mode).unwrap_or(self.flux_mode);
        let flux_totals = match &flux {
            Some(flux) => {
                flux.ensure_off().await;
                flux.exposure_totals().await
            }
            None => None,
        };

        let scan = std::mem::take(&mut self.scan);
        let shutter: Vec<f64> = scan.samples.iter().map(|s| s.shutter_duration).collect();
        let report_config = &self.settings.report;
        let shutter_statistics =
            aggregate_after_discard(&shutter, report_config.discard_leading_shutter);
        let duty_cycle_statistics =
            aggregate_after_discard(&scan.duty_cycles, report_config.discard_leading_duty);
        if shutter_statistics.is_none() || duty_cycle_statistics.is_none() {
            info!(samples = scan.samples.len(), "Too few exposures for scan statistics");
        }

        let report = ScanReport {
            scan_id: Uuid::new_v4(),
            started_at: scan.started_at,
            completed_at: Utc::now(),
            points_total: progress.points_total,
            protocol,
            flux_mode,
            samples: scan.samples,
            duty_cycles: scan.duty_cycles,
            shutter_statistics,
            duty_cycle_statistics,
            image_statistics: scan.image_statistics,
            flux_totals,
        };
        info!(
            scan = %report.scan_id,
            points = report.points_total,
            exposures = report.samples.len(),
            "Scan completed"
        );

        if self.reporting {
            if let Some(sink) = &self.devices.reports {
                if let Err(err) = sink.submit(report.clone()).await {
                    warn!("Report sink rejected scan report: {:#}", err);
                }
            }
        }
        let _ = self.events_tx.send(SyncEvent::ScanCompleted(Arc::new(report)));
    }

    async fn fail_run(&mut self, run_id: u64, err: &SyncError) {
        error!(run = run_id, "Synchronization run failed: {}", err);
        let flux = self.engaged_flux.take();
        match err {
            // The source refused to start; it is left as the operator finds it.
            SyncError::Flux(FluxError::Fault { .. } | FluxError::NotReady { .. }) => {}
            _ => {
                if let Some(flux) = flux {
                    flux.ensure_off().await;
                }
            }
        }
        let _ = self.events_tx.send(SyncEvent::RunFailed { error: err.clone() });
        self.set_state(RunState::Idle);
    }

    async fn fire_manual(&mut self, level: TriggerLevel) -> SyncResult<()> {
        if self.active.is_some() {
            return Err(ProtocolError::ConcurrentRunRejected.into());
        }
        let hard = self
            .hard
            .as_ref()
            .ok_or(ProtocolError::HardProtocolUnavailable)?;
        hard.trigger.fire(level).await.map_err(SyncError::from)
    }

    pub(super) fn set_state(&mut self, state: RunState) {
        if self.run_state == state {
            return;
        }
        let from = std::mem::replace(&mut self.run_state, state);
        info!(?from, to = ?state, "Run state changed");
        let _ = self.events_tx.send(SyncEvent::StateChanged { from, to: state });
        self.publish_status();
    }

    pub(super) fn publish_status(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    async fn shutdown(&mut self) {
        info!("Sequencer shutting down");
        let report = self.scan_abort().await;
        if report.run_cancelled {
            warn!("Shutdown cancelled an active run");
        }
        self.shutdown_tx.send_replace(true);
    }
}

/// Everything a run task needs, moved into the task.
struct RunContext {
    generation: u64,
    protocol: SyncMode,
    detector: Arc<dyn Detector>,
    flux: FluxController,
    hard: Option<HardPath>,
    engine: EngineConfig,
    cancel: CancelToken,
    updates: mpsc::UnboundedSender<RunUpdate>,
}

impl RunContext {
    async fn execute(self) {
        let outcome = match self.protocol {
            SyncMode::Hard => self.run_hard().await,
            SyncMode::Soft => self.run_soft().await,
        };
        let _ = self.updates.send(RunUpdate::Finished {
            generation: self.generation,
            outcome,
        });
    }

    fn enter(&self, state: RunState) {
        let _ = self.updates.send(RunUpdate::State {
            generation: self.generation,
            state,
        });
    }

    async fn configure_detector(&self, image: ImageMode, trigger: DetectorTriggerMode) -> SyncResult<()> {
        self.detector
            .set_image_mode(image)
            .await
            .map_err(|e| IoError::device("detector image mode", e))?;
        self.detector
            .set_trigger_mode(trigger)
            .await
            .map_err(|e| IoError::device("detector trigger mode", e))?;
        Ok(())
    }

    async fn run_hard(&self) -> SyncResult<RunCapture> {
        let hard = self
            .hard
            .as_ref()
            .ok_or(ProtocolError::HardProtocolUnavailable)?;
        if *hard.poller.health.borrow() == PollerHealth::Failed {
            return Err(IoError::PollerStopped.into());
        }

        self.configure_detector(ImageMode::Continuous, DetectorTriggerMode::Hard)
            .await?;
        self.detector
            .set_acquire(true)
            .await
            .map_err(|e| IoError::device("detector acquire", e))?;

        self.flux.ensure_on(&self.cancel).await?;
        self.enter(RunState::AwaitingTriggerReady);

        hard.trigger.fire(TriggerLevel::Low).await?;
        self.pause(self.engine.settle_delay()).await?;
        self.wait_for_line(hard, "trigger-ready", |s| s.ready, self.engine.ready_timeout())
            .await?;

        let mut samples = hard.samples.subscribe();
        let fired_at = Instant::now();
        hard.trigger.fire(TriggerLevel::High).await?;
        self.pause(self.engine.settle_delay()).await?;
        self.enter(RunState::Exposing);

        self.wait_for_line(hard, "exposing", |s| !s.exposing, self.engine.exposing_timeout())
            .await?;
        let sample = self.next_sample(&mut samples, fired_at).await?;

        self.enter(RunState::Settling);
        Ok(RunCapture::Timed(sample))
    }

    async fn run_soft(&self) -> SyncResult<RunCapture> {
        self.configure_detector(ImageMode::Single, DetectorTriggerMode::Soft)
            .await?;

        self.flux.ensure_on(&self.cancel).await?;
        self.enter(RunState::AwaitingTriggerReady);

        let acquire_time = self
            .detector
            .acquire_time()
            .await
            .map_err(|e| IoError::device("detector acquire time", e))?;
        let triggered_at = Instant::now();
        self.detector
            .set_acquire(true)
            .await
            .map_err(|e| IoError::device("detector acquire", e))?;
        self.pause(acquire_time).await?;

        self.enter(RunState::Settling);
        Ok(RunCapture::Soft {
            triggered_at,
            completed_at: Instant::now(),
        })
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            Err(ProtocolError::cancelled().into())
        } else {
            Ok(())
        }
    }

    /// Sleep in poll-interval slices so an abort is honored mid-delay.
    async fn pause(&self, duration: Duration) -> SyncResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_cancelled()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            sleep((deadline - now).min(self.engine.poll_interval())).await;
        }
    }

    async fn wait_for_line(
        &self,
        hard: &HardPath,
        line: &'static str,
        condition: impl Fn(&DigitalLineState) -> bool,
        limit: Duration,
    ) -> SyncResult<()> {
        let started = Instant::now();
        loop {
            self.check_cancelled()?;
            if *hard.poller.health.borrow() == PollerHealth::Failed {
                return Err(IoError::PollerStopped.into());
            }
            if condition(&*hard.poller.lines.borrow()) {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= limit {
                return Err(ProtocolError::AbortedMidRun {
                    reason: AbortReason::Timeout { line, waited },
                }
                .into());
            }
            sleep(self.engine.poll_interval()).await;
        }
    }

    /// Wait for the timing sample of the exposure this run started. Samples of
    /// exposures that opened before `fired_at` belong to an earlier, aborted
    /// cycle and are skipped.
    async fn next_sample(
        &self,
        samples: &mut broadcast::Receiver<TimedExposure>,
        fired_at: Instant,
    ) -> SyncResult<ExposureSample> {
        let started = Instant::now();
        let limit = self.engine.sample_timeout();
        loop {
            self.check_cancelled()?;
            match timeout(self.engine.poll_interval(), samples.recv()).await {
                Ok(Ok(exposure)) if exposure.opened_at >= fired_at => return Ok(exposure.sample),
                Ok(Ok(stale)) => {
                    debug!(
                        run = self.generation,
                        shutter_s = stale.sample.shutter_duration,
                        "Skipping sample of an earlier exposure"
                    );
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(IoError::PollerStopped.into())
                }
                Err(_) => {}
            }
            let waited = started.elapsed();
            if waited >= limit {
                return Err(ProtocolError::AbortedMidRun {
                    reason: AbortReason::Timeout {
                        line: "trigger-ready after exposure",
                        waited,
                    },
                }
                .into());
            }
        }
    }
}
