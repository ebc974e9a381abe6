//! End-of-scan report data.
//!
//! The engine supplies the data; file formats and plots belong to whatever
//! [`crate::hardware::ReportSink`] consumes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{FluxMode, SyncMode};
use crate::engine::ExposureSample;
use crate::hardware::{FluxTotals, ImageStatistics};

/// Mean, population standard deviation, min and max of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Number of finite values aggregated
    pub count: usize,
}

impl SummaryStatistics {
    /// Aggregate the finite values of `values`; NaN entries are skipped.
    /// Returns `None` if nothing is left.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return None;
        }

        let count = finite.len();
        let mean = finite.iter().sum::<f64>() / count as f64;
        let variance = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Some(Self {
            mean,
            std_dev: variance.sqrt(),
            min,
            max,
            count,
        })
    }
}

/// Aggregate `values` after dropping the first `discard` entries, which carry
/// startup settling artifacts. Skipped (`None`) when too few values exist.
pub fn aggregate_after_discard(values: &[f64], discard: usize) -> Option<SummaryStatistics> {
    if values.len() <= discard {
        return None;
    }
    SummaryStatistics::from_values(&values[discard..])
}

/// Everything collected over one completed scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub scan_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub points_total: u64,
    pub protocol: SyncMode,
    pub flux_mode: FluxMode,
    /// One sample per completed exposure, in order
    pub samples: Vec<ExposureSample>,
    /// Duty cycle percentages from the second exposure on
    pub duty_cycles: Vec<f64>,
    pub shutter_statistics: Option<SummaryStatistics>,
    pub duty_cycle_statistics: Option<SummaryStatistics>,
    /// Per-point image statistics, captured when reporting is enabled
    pub image_statistics: Vec<ImageStatistics>,
    /// Accumulated source output; `None` for dark scans
    pub flux_totals: Option<FluxTotals>,
}

impl ScanReport {
    /// Sigma/mean per captured image.
    pub fn normalized_sigma(&self) -> Vec<f64> {
        self.image_statistics
            .iter()
            .map(ImageStatistics::normalized_sigma)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_of_simple_series() {
        let stats = SummaryStatistics::from_values(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(stats.mean, 2.5);
        assert!((stats.std_dev - 1.118_033_988_749_895).abs() < 1e-12);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.count, 4);
    }

    #[test]
    fn test_nan_values_are_skipped() {
        let stats = SummaryStatistics::from_values(&[f64::NAN, 2.0, 4.0]).unwrap();
        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.count, 2);
        assert!(SummaryStatistics::from_values(&[f64::NAN]).is_none());
    }

    #[test]
    fn test_discard_leading_two_duty_cycles() {
        let duty = [10.0, 20.0, 60.0, 80.0];
        let stats = aggregate_after_discard(&duty, 2).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean, 70.0);
        assert_eq!(stats.min, 60.0);
        assert_eq!(stats.max, 80.0);
    }

    #[test]
    fn test_too_few_values_skips_aggregation() {
        assert!(aggregate_after_discard(&[50.0], 2).is_none());
        assert!(aggregate_after_discard(&[50.0, 51.0], 2).is_none());
        assert!(aggregate_after_discard(&[], 0).is_none());
    }
}
