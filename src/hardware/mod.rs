//! Hardware capability traits
//!
//! Every device the engine talks to sits behind one of these async traits:
//!
//! - [`DigitalLines`] - the digital I/O subsystem carrying the detector
//!   handshake inputs (trigger-ready, exposing) and the trigger output
//! - [`Detector`] - detector acquisition controls
//! - [`FluxSource`] - an X-ray generator
//! - [`ScanSequencer`] - the external scan engine's progress and wait gate
//! - [`MotionAxis`] - a motor stopped by a master abort
//! - [`ReportSink`] - consumer of end-of-scan reports
//!
//! Implementations handle protocol-specific details (channel access, vendor
//! DAQ drivers). Trait methods return `anyhow::Result`; the engine classifies
//! failures into [`crate::error`] types at the call site.
//!
//! The [`mock`] module provides simulated implementations of all of them.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::report::ScanReport;

pub mod mock;

/// Raw levels of the two detector handshake inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineLevels {
    /// Trigger-ready line
    pub ready: bool,
    /// Exposing line
    pub exposing: bool,
}

/// Digital I/O subsystem wired to the detector.
#[async_trait]
pub trait DigitalLines: Send + Sync {
    /// Create and start the input and output tasks.
    ///
    /// A failure here is not fatal; the engine degrades to the soft protocol.
    async fn initialize(&self) -> Result<()>;

    /// Sample both handshake inputs once.
    async fn read_inputs(&self) -> Result<LineLevels>;

    /// Write a pattern to the trigger output line and return the device status
    /// code (0 = success).
    async fn write_output(&self, pattern: u8) -> Result<i32>;
}

/// Detector image mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageMode {
    Single,
    Multiple,
    Continuous,
}

/// Where the detector takes its exposure trigger from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorTriggerMode {
    /// Software command
    Soft,
    /// Digital trigger input
    Hard,
}

/// Per-image statistics reported by the detector's statistics plugin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageStatistics {
    pub mean: f64,
    pub sigma: f64,
}

impl ImageStatistics {
    /// Sigma divided by mean, NaN when the mean is zero.
    pub fn normalized_sigma(&self) -> f64 {
        if self.mean == 0.0 {
            f64::NAN
        } else {
            self.sigma / self.mean
        }
    }
}

/// Detector acquisition controls.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn set_image_mode(&self, mode: ImageMode) -> Result<()>;

    async fn set_trigger_mode(&self, mode: DetectorTriggerMode) -> Result<()>;

    /// Start (`true`) or stop (`false`) acquisition. In soft trigger mode,
    /// starting acquisition is the software trigger.
    async fn set_acquire(&self, acquire: bool) -> Result<()>;

    /// Acquire time the detector reports for the current settings.
    async fn acquire_time(&self) -> Result<Duration>;

    /// Statistics of the most recent image, if the plugin is enabled.
    async fn image_statistics(&self) -> Result<Option<ImageStatistics>>;
}

/// Status reported by a flux source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FluxStatus {
    Warming,
    Standby,
    Outputting,
    Pulsing,
    Fault,
}

/// Accumulated source output, used in scan reports.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FluxTotals {
    /// Accumulated exposure time in minutes
    pub exposure_minutes: f64,
    /// Accumulated tube charge in mAs
    pub charge_mas: f64,
}

/// An X-ray generator.
#[async_trait]
pub trait FluxSource: Send + Sync {
    async fn status(&self) -> Result<FluxStatus>;

    /// Switch output on or off.
    async fn set_output(&self, on: bool) -> Result<()>;

    /// Leave pulse mode and output continuously.
    async fn set_continuous(&self) -> Result<()>;

    /// Whether output has reached its set points.
    async fn is_firing(&self) -> Result<bool>;

    async fn exposure_totals(&self) -> Result<FluxTotals>;
}

/// Progress of the external scan engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanProgress {
    pub points_completed: u64,
    pub points_total: u64,
    pub running: bool,
}

impl ScanProgress {
    /// Progress for a multi-dimensional scan; the total is the product of the
    /// per-axis point counts.
    pub fn from_axes(points_completed: u64, points_per_axis: &[u64], running: bool) -> Self {
        let points_total = if points_per_axis.is_empty() {
            0
        } else {
            points_per_axis.iter().product()
        };
        Self {
            points_completed: points_completed.min(points_total),
            points_total,
            running,
        }
    }

    /// Whether the point being captured now is the last one. Evaluated before
    /// the wait gate is released, so the current point is not yet counted.
    pub fn is_final_point(&self) -> bool {
        self.running && self.points_completed + 1 >= self.points_total
    }
}

/// The external scan engine.
#[async_trait]
pub trait ScanSequencer: Send + Sync {
    async fn progress(&self) -> Result<ScanProgress>;

    /// Release the scan's wait gate so it can move to the next point.
    async fn release_wait(&self) -> Result<()>;

    /// Abort all scans.
    async fn abort(&self) -> Result<()>;
}

/// A motor axis stopped by a master abort.
#[async_trait]
pub trait MotionAxis: Send + Sync {
    fn name(&self) -> &str;

    async fn is_moving(&self) -> Result<bool>;

    async fn stop(&self) -> Result<()>;
}

/// Consumer of end-of-scan reports (file writers, plotting).
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn submit(&self, report: ScanReport) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_axis_total_is_product() {
        let progress = ScanProgress::from_axes(3, &[4, 5], true);
        assert_eq!(progress.points_total, 20);
        assert_eq!(progress.points_completed, 3);
        assert!(!progress.is_final_point());
    }

    #[test]
    fn test_completed_clamped_to_total() {
        let progress = ScanProgress::from_axes(9, &[2, 2], true);
        assert_eq!(progress.points_completed, 4);
    }

    #[test]
    fn test_final_point_detection() {
        let progress = ScanProgress {
            points_completed: 4,
            points_total: 5,
            running: true,
        };
        assert!(progress.is_final_point());

        let idle = ScanProgress {
            running: false,
            ..progress
        };
        assert!(!idle.is_final_point());
    }

    #[test]
    fn test_normalized_sigma() {
        let stats = ImageStatistics { mean: 200.0, sigma: 10.0 };
        assert!((stats.normalized_sigma() - 0.05).abs() < 1e-12);
        assert!(ImageStatistics { mean: 0.0, sigma: 1.0 }.normalized_sigma().is_nan());
    }
}
