//! Record mirroring and record writes routed into the engine.

use std::sync::Arc;
use std::time::Duration;

use detector_sync::config::{FluxMode, Settings};
use detector_sync::engine::RunState;
use detector_sync::hardware::mock::{
    MemoryPublisher, MockFluxSource, MockScanSequencer, SimulatedDetector,
};
use detector_sync::messages::TriggerRequest;
use detector_sync::publish::{
    apply_write, spawn_status_mirror, RecordValue, FLUX_MODE, REPORT, RUN_STATE, SEND_TRIGGER,
    SHUTTER_TIME, TRIGGER,
};
use detector_sync::{SyncDevices, SyncEngine, SyncHandle};

async fn start(detector: Arc<SimulatedDetector>) -> SyncHandle {
    let source = Arc::new(MockFluxSource::new(Duration::ZERO));
    let devices = SyncDevices::new(
        detector.clone(),
        detector,
        source.clone(),
        source,
        Arc::new(MockScanSequencer::idle()),
    );
    SyncEngine::start(Settings::default(), devices).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_mirror_publishes_initial_and_updated_status() {
    let engine = start(Arc::new(SimulatedDetector::new())).await;
    let publisher = Arc::new(MemoryPublisher::new());
    let mirror = spawn_status_mirror(&engine, publisher.clone());

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(
        publisher.latest(RUN_STATE),
        Some(RecordValue::Text("Idle".to_string()))
    );
    assert!(matches!(publisher.latest(SHUTTER_TIME), Some(RecordValue::Float(v)) if v.is_nan()));

    engine.trigger(TriggerRequest::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    match publisher.latest(SHUTTER_TIME) {
        Some(RecordValue::Float(shutter)) => assert!((shutter - 0.120).abs() < 0.005),
        other => panic!("unexpected shutter record {other:?}"),
    }

    engine.shutdown().await.unwrap();
    mirror.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_record_writes_drive_engine() {
    let detector = Arc::new(SimulatedDetector::new());
    let engine = start(detector.clone()).await;

    apply_write(&engine, FLUX_MODE, RecordValue::Text("source_a".into()))
        .await
        .unwrap();
    assert_eq!(engine.flux_mode(), FluxMode::SourceA);

    apply_write(&engine, REPORT, RecordValue::Bool(true)).await.unwrap();
    assert!(engine.status().reporting);

    apply_write(&engine, SEND_TRIGGER, RecordValue::Bool(true))
        .await
        .unwrap();
    assert!(detector.output_high().await);
    apply_write(&engine, SEND_TRIGGER, RecordValue::Bool(false))
        .await
        .unwrap();

    apply_write(&engine, TRIGGER, RecordValue::Bool(true)).await.unwrap();
    engine
        .wait_for_state(|s| s != RunState::Idle)
        .await
        .unwrap();
    engine
        .wait_for_state(|s| s == RunState::Idle)
        .await
        .unwrap();
    assert!(engine.last_sample().is_some());
}

#[tokio::test]
async fn test_invalid_writes_are_rejected() {
    let engine = start(Arc::new(SimulatedDetector::new())).await;

    assert!(apply_write(&engine, FLUX_MODE, RecordValue::Text("xenon".into()))
        .await
        .is_err());
    assert!(apply_write(&engine, SHUTTER_TIME, RecordValue::Float(1.0))
        .await
        .is_err());
    assert_eq!(engine.flux_mode(), FluxMode::None);
}
