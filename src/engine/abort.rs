//! Abort Coordinator
//!
//! Aborts are commands like any other, so they are serialized through the
//! sequencer and observe a single run state. Repeated or overlapping aborts
//! find nothing left to cancel and leave the source alone.

use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::sequencer::{RunState, SequencerActor, SyncEvent};
use crate::error::ProtocolError;
use crate::messages::{AbortKind, AbortReport};

impl SequencerActor {
    pub(super) async fn abort(&mut self, kind: AbortKind) -> AbortReport {
        match kind {
            AbortKind::Scan => self.scan_abort().await,
            AbortKind::Master => self.master_abort().await,
        }
    }

    /// Cancel the active run, switch the engaged source off and discard the
    /// scan's samples.
    pub(super) async fn scan_abort(&mut self) -> AbortReport {
        let report = self.stop_scan().await;
        if report.run_cancelled || report.flux_stopped || report.samples_cleared > 0 {
            info!(
                run_cancelled = report.run_cancelled,
                flux_stopped = report.flux_stopped,
                samples_cleared = report.samples_cleared,
                "Scan aborted"
            );
            let _ = self.events_tx.send(SyncEvent::Aborted(report.clone()));
        } else {
            debug!("Scan abort with nothing to stop");
        }
        report
    }

    async fn stop_scan(&mut self) -> AbortReport {
        let run_cancelled = self.cancel_active_run().await;

        let flux_stopped = match self.engaged_flux.take() {
            Some(flux) => {
                flux.ensure_off().await;
                true
            }
            None => false,
        };
        let samples_cleared = self.scan.clear();

        self.set_state(RunState::Idle);
        self.publish_status();

        AbortReport {
            kind: AbortKind::Scan,
            run_cancelled,
            flux_stopped,
            samples_cleared,
            axes_stopped: 0,
        }
    }

    /// Scan abort, then stop the scan sequencer, any axis in motion and
    /// detector acquisition. Device failures are logged and skipped so one
    /// unreachable device does not keep the rest running.
    pub(super) async fn master_abort(&mut self) -> AbortReport {
        warn!("Master abort requested");
        let mut report = self.stop_scan().await;
        report.kind = AbortKind::Master;

        if let Err(err) = self.devices.scan.abort().await {
            warn!("Failed to abort scan sequencer: {:#}", err);
        }

        for axis in &self.devices.axes {
            match axis.is_moving().await {
                Ok(true) => match axis.stop().await {
                    Ok(()) => {
                        info!(axis = %axis.name(), "Stopped moving axis");
                        report.axes_stopped += 1;
                    }
                    Err(err) => warn!(axis = %axis.name(), "Failed to stop axis: {:#}", err),
                },
                Ok(false) => {}
                Err(err) => warn!(axis = %axis.name(), "Failed to read motion status: {:#}", err),
            }
        }

        if let Err(err) = self.devices.detector.set_acquire(false).await {
            warn!("Failed to stop detector acquisition: {:#}", err);
        }

        let _ = self.events_tx.send(SyncEvent::Aborted(report.clone()));
        report
    }

    /// Signal the active run to stop and wait briefly for its task to exit.
    async fn cancel_active_run(&mut self) -> bool {
        let Some(mut run) = self.active.take() else {
            return false;
        };

        run.cancel.cancel();
        let _ = run.responder.send(Err(ProtocolError::cancelled().into()));

        let grace = self.settings.engine.abort_grace();
        if timeout(grace, &mut run.task).await.is_err() {
            warn!(run = run.generation, ?grace, "Run did not stop within grace period, aborting task");
            run.task.abort();
        }
        info!(run = run.generation, protocol = %run.protocol, "Active run cancelled");
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::{FluxMode, Settings, SyncMode};
    use crate::engine::{RunState, SyncDevices, SyncEngine};
    use crate::error::{ProtocolError, SyncError};
    use crate::hardware::Detector;
    use crate::hardware::mock::{MockFluxSource, MockMotionAxis, MockScanSequencer, SimulatedDetector};
    use crate::messages::{AbortKind, TriggerRequest};

    fn devices(detector: Arc<SimulatedDetector>, flux: Arc<MockFluxSource>) -> SyncDevices {
        SyncDevices::new(detector.clone(), detector, flux.clone(), flux, Arc::new(MockScanSequencer::idle()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_when_idle_touches_nothing() {
        let detector = Arc::new(SimulatedDetector::new());
        let flux = Arc::new(MockFluxSource::new(Duration::ZERO));
        let engine = SyncEngine::start(Settings::default(), devices(detector, flux.clone()))
            .await
            .unwrap();

        let report = engine.scan_abort().await.unwrap();
        assert!(!report.run_cancelled);
        assert!(!report.flux_stopped);
        assert_eq!(flux.off_commands(), 0);
        assert_eq!(engine.run_state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_flux_wait_cancels_run() {
        let detector = Arc::new(SimulatedDetector::new());
        let flux = Arc::new(MockFluxSource::new(Duration::ZERO));
        flux.set_never_fires(true);
        let mut settings = Settings::default();
        settings.flux.mode = FluxMode::SourceB;
        let engine = SyncEngine::start(settings, devices(detector, flux.clone()))
            .await
            .unwrap();

        let run = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.trigger(TriggerRequest::default()).await })
        };
        engine
            .wait_for_state(|s| s == RunState::AwaitingFluxReady)
            .await
            .unwrap();

        let report = engine.scan_abort().await.unwrap();
        assert!(report.run_cancelled);
        assert!(report.flux_stopped);
        assert_eq!(flux.off_commands(), 1);

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err, SyncError::Protocol(ProtocolError::cancelled()));
        assert_eq!(engine.run_state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_abort_stops_only_moving_axes() {
        let detector = Arc::new(SimulatedDetector::new());
        let flux = Arc::new(MockFluxSource::new(Duration::ZERO));
        let scan = Arc::new(MockScanSequencer::running(3));
        let moving = Arc::new(MockMotionAxis::new("sample_x", true));
        let parked = Arc::new(MockMotionAxis::new("sample_y", false));
        let devices = SyncDevices::new(detector.clone(), detector.clone(), flux.clone(), flux, scan.clone())
            .with_axis(moving.clone())
            .with_axis(parked.clone());
        let mut settings = Settings::default();
        settings.engine.sync_mode = Some(SyncMode::Soft);
        let engine = SyncEngine::start(settings, devices).await.unwrap();
        detector.set_acquire(true).await.unwrap();

        let report = engine.master_abort().await.unwrap();
        assert_eq!(report.kind, AbortKind::Master);
        assert_eq!(report.axes_stopped, 1);
        assert_eq!(moving.stop_count(), 1);
        assert_eq!(parked.stop_count(), 0);
        assert_eq!(scan.abort_count(), 1);
        assert!(!detector.is_acquiring().await);
    }
}
