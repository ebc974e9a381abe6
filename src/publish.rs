//! Record publication adapter.
//!
//! The engine only emits status; this module mirrors it onto named records of
//! an external record server and routes record writes back into engine
//! commands. The server itself is behind [`RecordPublisher`].

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FluxMode;
use crate::engine::{SyncHandle, SyncStatus, TriggerLevel};
use crate::error::{SyncError, SyncResult};
use crate::messages::TriggerRequest;

pub const RUN_STATE: &str = "RunState";
pub const SYNC_MODE: &str = "SyncMode";
pub const DEGRADED: &str = "Degraded";
pub const FLUX_MODE: &str = "FluxMode";
pub const REPORT: &str = "Report";
pub const SHUTTER_TIME: &str = "ShutterTime";
pub const IDLE_TIME: &str = "IdleTime";
pub const READY_TO_EXPOSE_DELAY: &str = "ReadyToExposeDelay";
pub const DUTY_CYCLE: &str = "DutyCycle";
pub const SCAN_SAMPLES: &str = "ScanSamples";

// Write-only
pub const TRIGGER: &str = "Trigger";
pub const ABORT: &str = "Abort";
pub const MASTER_ABORT: &str = "MasterAbort";
pub const SEND_TRIGGER: &str = "SendTrigger";

/// Value of a published record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RecordValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

/// Sink for record values.
pub trait RecordPublisher: Send + Sync {
    fn publish(&self, record: &'static str, value: RecordValue) -> anyhow::Result<()>;
}

/// Publishes records as debug log lines.
#[derive(Debug, Default)]
pub struct TracingPublisher;

impl RecordPublisher for TracingPublisher {
    fn publish(&self, record: &'static str, value: RecordValue) -> anyhow::Result<()> {
        debug!(record, ?value, "record updated");
        Ok(())
    }
}

/// Record values for a status snapshot. Timing records read NaN until the
/// first exposure completes.
pub fn status_records(status: &SyncStatus) -> Vec<(&'static str, RecordValue)> {
    let sample = status.last_sample;
    vec![
        (RUN_STATE, RecordValue::Text(format!("{:?}", status.run_state))),
        (SYNC_MODE, RecordValue::Text(status.protocol.to_string())),
        (DEGRADED, RecordValue::Bool(status.degraded)),
        (FLUX_MODE, RecordValue::Text(status.flux_mode.to_string())),
        (REPORT, RecordValue::Bool(status.reporting)),
        (
            SHUTTER_TIME,
            RecordValue::Float(sample.map_or(f64::NAN, |s| s.shutter_duration)),
        ),
        (
            IDLE_TIME,
            RecordValue::Float(sample.map_or(f64::NAN, |s| s.idle_duration)),
        ),
        (
            READY_TO_EXPOSE_DELAY,
            RecordValue::Float(sample.map_or(f64::NAN, |s| s.ready_to_expose_delay)),
        ),
        (
            DUTY_CYCLE,
            RecordValue::Float(status.duty_cycle.unwrap_or(f64::NAN)),
        ),
        (SCAN_SAMPLES, RecordValue::Int(status.scan_samples as i64)),
    ]
}

fn unchanged(previous: Option<&RecordValue>, value: &RecordValue) -> bool {
    match (previous, value) {
        (Some(RecordValue::Float(a)), RecordValue::Float(b)) => {
            a == b || (a.is_nan() && b.is_nan())
        }
        (Some(previous), value) => previous == value,
        (None, _) => false,
    }
}

/// Mirror every status change onto `publisher` until the engine stops.
///
/// Only records whose value changed are republished.
pub fn spawn_status_mirror(handle: &SyncHandle, publisher: Arc<dyn RecordPublisher>) -> JoinHandle<()> {
    let mut status = handle.subscribe_status();
    tokio::spawn(async move {
        let mut last: HashMap<&'static str, RecordValue> = HashMap::new();
        loop {
            let snapshot = status.borrow_and_update().clone();
            for (record, value) in status_records(&snapshot) {
                if unchanged(last.get(record), &value) {
                    continue;
                }
                if let Err(err) = publisher.publish(record, value.clone()) {
                    warn!(record, "Failed to publish record: {:#}", err);
                    continue;
                }
                last.insert(record, value);
            }

            if status.changed().await.is_err() {
                break;
            }
        }
        info!("Status mirror stopped");
    })
}

/// Apply a write to a named record.
///
/// Trigger and abort writes start work in the background and return
/// immediately; their outcome shows up in the mirrored status.
pub async fn apply_write(handle: &SyncHandle, record: &str, value: RecordValue) -> SyncResult<()> {
    match (record, value) {
        (FLUX_MODE, RecordValue::Text(mode)) => {
            let mode = FluxMode::from_str(&mode)?;
            handle.set_flux_mode(mode).await
        }
        (REPORT, RecordValue::Bool(enabled)) => handle.set_reporting(enabled).await,
        (TRIGGER, RecordValue::Bool(true)) => {
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(err) = handle.trigger(TriggerRequest::default()).await {
                    warn!("Triggered run did not complete: {}", err);
                }
            });
            Ok(())
        }
        (ABORT, RecordValue::Bool(true)) => {
            drop(handle.spawn_scan_abort());
            Ok(())
        }
        (MASTER_ABORT, RecordValue::Bool(true)) => {
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(err) = handle.master_abort().await {
                    warn!("Master abort failed: {}", err);
                }
            });
            Ok(())
        }
        (SEND_TRIGGER, RecordValue::Bool(high)) => {
            let level = if high { TriggerLevel::High } else { TriggerLevel::Low };
            handle.fire_trigger(level).await
        }
        (TRIGGER | ABORT | MASTER_ABORT, RecordValue::Bool(false)) => Ok(()),
        (record, value) => Err(SyncError::Config(format!(
            "record {record} does not accept {value:?}"
        ))),
    }
}
