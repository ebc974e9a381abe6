//! Scan and master abort behavior while runs are in flight.

use std::sync::Arc;
use std::time::Duration;

use detector_sync::config::{FluxMode, Settings};
use detector_sync::engine::{RunState, SyncEvent};
use detector_sync::error::{AbortReason, ProtocolError, SyncError};
use detector_sync::hardware::mock::{
    MockFluxSource, MockMotionAxis, MockScanSequencer, SimulatedDetector,
};
use detector_sync::messages::{AbortKind, TriggerRequest};
use detector_sync::{SyncDevices, SyncEngine};
use futures::future::join_all;

#[tokio::test(start_paused = true)]
async fn test_concurrent_aborts_mid_exposure_switch_source_off_once() {
    let detector = Arc::new(SimulatedDetector::new());
    let source = Arc::new(MockFluxSource::new(Duration::from_millis(50)));
    let scan = Arc::new(MockScanSequencer::running(10));
    let devices = SyncDevices::new(
        detector.clone(),
        detector.clone(),
        source.clone(),
        source.clone(),
        scan.clone(),
    );
    let mut settings = Settings::default();
    settings.flux.mode = FluxMode::SourceB;
    let engine = SyncEngine::start(settings, devices).await.unwrap();

    // Two completed points, so the scan holds samples when the abort lands.
    engine.trigger(TriggerRequest::default()).await.unwrap();
    engine.trigger(TriggerRequest::default()).await.unwrap();
    assert_eq!(engine.samples().await.unwrap().len(), 2);

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.trigger(TriggerRequest::default()).await })
    };
    engine
        .wait_for_state(|s| s == RunState::Exposing)
        .await
        .unwrap();

    let aborts = join_all((0..3).map(|_| engine.spawn_scan_abort())).await;
    let mut cancelled_runs = 0;
    let mut cleared = 0;
    for abort in aborts {
        let report = abort.unwrap().unwrap();
        cancelled_runs += usize::from(report.run_cancelled);
        cleared += report.samples_cleared;
    }

    assert_eq!(cancelled_runs, 1);
    assert_eq!(cleared, 2);
    assert_eq!(source.off_commands(), 1);
    assert_eq!(engine.run_state(), RunState::Idle);
    assert!(engine.samples().await.unwrap().is_empty());

    let err = run.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        SyncError::Protocol(ProtocolError::AbortedMidRun {
            reason: AbortReason::Cancelled
        })
    );

    // The engine accepts the next request right after an abort.
    let next = engine.trigger(TriggerRequest::default()).await.unwrap();
    assert!((next.sample.shutter_duration - 0.120).abs() < 0.005);
}

#[tokio::test(start_paused = true)]
async fn test_run_after_abort_ignores_aborted_exposure() {
    let detector = Arc::new(SimulatedDetector::new());
    let source = Arc::new(MockFluxSource::new(Duration::ZERO));
    let devices = SyncDevices::new(
        detector.clone(),
        detector.clone(),
        source.clone(),
        source,
        Arc::new(MockScanSequencer::idle()),
    );
    let engine = SyncEngine::start(Settings::default(), devices).await.unwrap();

    engine.trigger(TriggerRequest::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let aborted = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.trigger(TriggerRequest::default()).await })
    };
    engine
        .wait_for_state(|s| s == RunState::Exposing)
        .await
        .unwrap();
    engine.scan_abort().await.unwrap();
    assert!(aborted.await.unwrap().is_err());

    // The aborted exposure idled for ~300ms; this one follows it closely.
    let summary = engine.trigger(TriggerRequest::default()).await.unwrap();
    assert!(summary.sample.idle_duration > 0.0);
    assert!(
        summary.sample.idle_duration < 0.1,
        "took the aborted exposure's sample: {:?}",
        summary.sample
    );
    assert!((summary.sample.shutter_duration - 0.120).abs() < 0.005);
    assert!((summary.sample.ready_to_expose_delay - 0.004).abs() < 0.003);
}

#[tokio::test(start_paused = true)]
async fn test_master_abort_stops_motion_and_acquisition() {
    let detector = Arc::new(SimulatedDetector::new());
    let source = Arc::new(MockFluxSource::new(Duration::from_millis(50)));
    let scan = Arc::new(MockScanSequencer::running(10));
    let moving = Arc::new(MockMotionAxis::new("rotation", true));
    let parked = Arc::new(MockMotionAxis::new("height", false));
    let devices = SyncDevices::new(
        detector.clone(),
        detector.clone(),
        source.clone(),
        source.clone(),
        scan.clone(),
    )
    .with_axis(moving.clone())
    .with_axis(parked.clone());
    let mut settings = Settings::default();
    settings.flux.mode = FluxMode::SourceB;
    let engine = SyncEngine::start(settings, devices).await.unwrap();
    let mut events = engine.subscribe_events();

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.trigger(TriggerRequest::default()).await })
    };
    engine
        .wait_for_state(|s| s == RunState::AwaitingTriggerReady || s == RunState::Exposing)
        .await
        .unwrap();

    let report = engine.master_abort().await.unwrap();
    assert_eq!(report.kind, AbortKind::Master);
    assert!(report.run_cancelled);
    assert!(report.flux_stopped);
    assert_eq!(report.axes_stopped, 1);

    assert!(run.await.unwrap().is_err());
    assert_eq!(moving.stop_count(), 1);
    assert_eq!(parked.stop_count(), 0);
    assert_eq!(scan.abort_count(), 1);
    assert!(!scan.snapshot().await.running);
    assert!(!detector.is_acquiring().await);
    assert_eq!(source.off_commands(), 1);
    assert_eq!(engine.run_state(), RunState::Idle);

    let mut aborted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::Aborted(report) = event {
            aborted.push(report.kind);
        }
    }
    assert_eq!(aborted, vec![AbortKind::Master]);
}

#[tokio::test(start_paused = true)]
async fn test_abort_without_run_is_harmless() {
    let detector = Arc::new(SimulatedDetector::new());
    let source = Arc::new(MockFluxSource::new(Duration::ZERO));
    let devices = SyncDevices::new(
        detector.clone(),
        detector,
        source.clone(),
        source.clone(),
        Arc::new(MockScanSequencer::idle()),
    );
    let engine = SyncEngine::start(Settings::default(), devices).await.unwrap();

    for _ in 0..3 {
        let report = engine.scan_abort().await.unwrap();
        assert!(!report.run_cancelled);
        assert_eq!(report.samples_cleared, 0);
    }
    assert_eq!(source.off_commands(), 0);
    assert_eq!(engine.run_state(), RunState::Idle);
}
