//! Core library for the detector_sync engine.
//!
//! Coordinates a pixel-array X-ray detector, an X-ray source and a scan
//! sequencer so that every scan point produces exactly one exposure taken
//! under steady flux, with the exposure timing recorded per point.
//!
//! Devices are reached through the capability traits in [`hardware`]; the
//! engine itself lives in [`engine`] and is driven through a
//! [`engine::SyncHandle`].

pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod messages;
pub mod publish;
pub mod report;

pub use config::Settings;
pub use engine::{SyncDevices, SyncEngine, SyncHandle};
pub use error::{SyncError, SyncResult};
