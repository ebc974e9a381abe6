//! Mock Hardware Implementations
//!
//! Provides simulated devices for testing without physical hardware.
//! All timing uses `tokio::time`, so tests can run on a paused clock.
//!
//! # Available Mocks
//!
//! - `SimulatedDetector` - detector plus the digital lines it drives
//! - `MockFluxSource` - X-ray generator with a configurable ramp time
//! - `MockScanSequencer` - scan engine that advances when its wait gate is released
//! - `MockMotionAxis` - motor that can be stopped
//! - `CollectingReportSink` - keeps submitted reports in memory
//! - `MemoryPublisher` - records every published record value
//!
//! # Detector Timeline
//!
//! After a low-to-high trigger write (hard trigger mode, acquiring, ready):
//!
//! ```text
//! +busy_after          ready falls
//! +expose_delay        exposing rises
//! +exposure            exposing falls
//! +readout             ready rises
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration, Instant};

use super::{
    Detector, DetectorTriggerMode, DigitalLines, FluxSource, FluxStatus, FluxTotals, ImageMode,
    ImageStatistics, LineLevels, MotionAxis, ReportSink, ScanProgress, ScanSequencer,
};
use crate::publish::{RecordPublisher, RecordValue};
use crate::report::ScanReport;

// =============================================================================
// SimulatedDetector - Detector and Digital Lines
// =============================================================================

/// Phase offsets of one simulated exposure cycle.
#[derive(Debug, Clone, Copy)]
pub struct DetectorTiming {
    /// Trigger edge to ready falling
    pub busy_after: Duration,
    /// Ready falling to exposing rising
    pub expose_delay: Duration,
    /// Exposing high time
    pub exposure: Duration,
    /// Exposing falling to ready rising
    pub readout: Duration,
}

impl Default for DetectorTiming {
    fn default() -> Self {
        Self {
            busy_after: Duration::from_millis(1),
            expose_delay: Duration::from_millis(4),
            exposure: Duration::from_millis(100),
            readout: Duration::from_millis(20),
        }
    }
}

#[derive(Debug)]
struct DetectorState {
    acquiring: bool,
    output_high: bool,
    fired_at: Option<Instant>,
    image_mode: ImageMode,
    trigger_mode: DetectorTriggerMode,
}

/// Simulated detector wired to a simulated digital I/O card.
///
/// One instance implements both [`DigitalLines`] and [`Detector`] because the
/// detector is what drives the handshake lines.
///
/// # Example
///
/// ```rust,ignore
/// let detector = Arc::new(SimulatedDetector::new());
/// detector.set_trigger_mode(DetectorTriggerMode::Hard).await?;
/// detector.set_acquire(true).await?;
/// detector.write_output(0).await?;
/// detector.write_output(1).await?; // starts an exposure
/// ```
#[derive(Debug)]
pub struct SimulatedDetector {
    timing: DetectorTiming,
    state: RwLock<DetectorState>,
    fail_init: AtomicBool,
    failing_reads: AtomicU32,
    write_status: AtomicI32,
    write_latency_ms: AtomicU64,
    reads: AtomicUsize,
    writes: AtomicUsize,
    soft_triggers: AtomicUsize,
    images: AtomicUsize,
}

impl SimulatedDetector {
    /// Detector with the default timeline (100ms exposure, 20ms readout).
    pub fn new() -> Self {
        Self::with_timing(DetectorTiming::default())
    }

    pub fn with_timing(timing: DetectorTiming) -> Self {
        Self {
            timing,
            state: RwLock::new(DetectorState {
                acquiring: false,
                output_high: false,
                fired_at: None,
                image_mode: ImageMode::Single,
                trigger_mode: DetectorTriggerMode::Soft,
            }),
            fail_init: AtomicBool::new(false),
            failing_reads: AtomicU32::new(0),
            write_status: AtomicI32::new(0),
            write_latency_ms: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            soft_triggers: AtomicUsize::new(0),
            images: AtomicUsize::new(0),
        }
    }

    /// Make `initialize` fail, as when the I/O card is missing.
    pub fn set_fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` input reads.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Status code returned by subsequent output writes.
    pub fn set_write_status(&self, code: i32) {
        self.write_status.store(code, Ordering::SeqCst);
    }

    /// Delay applied to subsequent output writes.
    pub fn set_write_latency(&self, latency: Duration) {
        self.write_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn soft_trigger_count(&self) -> usize {
        self.soft_triggers.load(Ordering::SeqCst)
    }

    pub async fn output_high(&self) -> bool {
        self.state.read().await.output_high
    }

    pub async fn is_acquiring(&self) -> bool {
        self.state.read().await.acquiring
    }

    pub async fn trigger_mode(&self) -> DetectorTriggerMode {
        self.state.read().await.trigger_mode
    }

    pub async fn image_mode(&self) -> ImageMode {
        self.state.read().await.image_mode
    }

    fn levels_at(&self, state: &DetectorState, now: Instant) -> LineLevels {
        if !state.acquiring {
            return LineLevels::default();
        }
        let Some(fired) = state.fired_at else {
            return LineLevels {
                ready: true,
                exposing: false,
            };
        };

        let busy_start = fired + self.timing.busy_after;
        let expose_start = busy_start + self.timing.expose_delay;
        let expose_end = expose_start + self.timing.exposure;
        let ready_again = expose_end + self.timing.readout;

        LineLevels {
            ready: !(now >= busy_start && now < ready_again),
            exposing: now >= expose_start && now < expose_end,
        }
    }
}

impl Default for SimulatedDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DigitalLines for SimulatedDetector {
    async fn initialize(&self) -> Result<()> {
        if self.fail_init.load(Ordering::SeqCst) {
            bail!("SimulatedDetector: digital I/O device not found");
        }
        Ok(())
    }

    async fn read_inputs(&self) -> Result<LineLevels> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_reads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_reads.store(remaining - 1, Ordering::SeqCst);
            bail!("SimulatedDetector: input read failed");
        }
        let state = self.state.read().await;
        Ok(self.levels_at(&state, Instant::now()))
    }

    async fn write_output(&self, pattern: u8) -> Result<i32> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let latency = self.write_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            sleep(Duration::from_millis(latency)).await;
        }
        let status = self.write_status.load(Ordering::SeqCst);
        if status != 0 {
            return Ok(status);
        }

        let now = Instant::now();
        let mut state = self.state.write().await;
        let high = pattern != 0;
        let rising = high && !state.output_high;
        state.output_high = high;

        if rising
            && state.trigger_mode == DetectorTriggerMode::Hard
            && self.levels_at(&state, now).ready
        {
            state.fired_at = Some(now);
            self.images.fetch_add(1, Ordering::SeqCst);
        }
        Ok(0)
    }
}

#[async_trait]
impl Detector for SimulatedDetector {
    async fn set_image_mode(&self, mode: ImageMode) -> Result<()> {
        self.state.write().await.image_mode = mode;
        Ok(())
    }

    async fn set_trigger_mode(&self, mode: DetectorTriggerMode) -> Result<()> {
        self.state.write().await.trigger_mode = mode;
        Ok(())
    }

    async fn set_acquire(&self, acquire: bool) -> Result<()> {
        let mut state = self.state.write().await;
        if acquire && state.trigger_mode == DetectorTriggerMode::Soft {
            self.soft_triggers.fetch_add(1, Ordering::SeqCst);
            self.images.fetch_add(1, Ordering::SeqCst);
        }
        if !acquire {
            state.fired_at = None;
        }
        state.acquiring = acquire;
        Ok(())
    }

    async fn acquire_time(&self) -> Result<Duration> {
        Ok(self.timing.exposure + self.timing.readout)
    }

    async fn image_statistics(&self) -> Result<Option<ImageStatistics>> {
        let image = self.images.load(Ordering::SeqCst) as f64;
        Ok(Some(ImageStatistics {
            mean: 1000.0 + image,
            sigma: 10.0,
        }))
    }
}

// =============================================================================
// MockFluxSource - Simulated X-ray Generator
// =============================================================================

#[derive(Debug)]
struct FluxState {
    status: FluxStatus,
    on_since: Option<Instant>,
    accumulated: Duration,
}

/// Mock X-ray generator that reaches its set points `ramp` after switching on.
#[derive(Debug)]
pub struct MockFluxSource {
    ramp: Duration,
    tube_current_ma: f64,
    state: RwLock<FluxState>,
    never_fires: AtomicBool,
    on_commands: AtomicUsize,
    off_commands: AtomicUsize,
    continuous_commands: AtomicUsize,
}

impl MockFluxSource {
    /// Source in standby.
    pub fn new(ramp: Duration) -> Self {
        Self {
            ramp,
            tube_current_ma: 0.5,
            state: RwLock::new(FluxState {
                status: FluxStatus::Standby,
                on_since: None,
                accumulated: Duration::ZERO,
            }),
            never_fires: AtomicBool::new(false),
            on_commands: AtomicUsize::new(0),
            off_commands: AtomicUsize::new(0),
            continuous_commands: AtomicUsize::new(0),
        }
    }

    pub async fn set_status(&self, status: FluxStatus) {
        self.state.write().await.status = status;
    }

    /// Keep the firing flag low forever.
    pub fn set_never_fires(&self, never: bool) {
        self.never_fires.store(never, Ordering::SeqCst);
    }

    pub fn on_commands(&self) -> usize {
        self.on_commands.load(Ordering::SeqCst)
    }

    pub fn off_commands(&self) -> usize {
        self.off_commands.load(Ordering::SeqCst)
    }

    pub fn continuous_commands(&self) -> usize {
        self.continuous_commands.load(Ordering::SeqCst)
    }

    pub async fn is_output_on(&self) -> bool {
        self.state.read().await.on_since.is_some()
    }
}

#[async_trait]
impl FluxSource for MockFluxSource {
    async fn status(&self) -> Result<FluxStatus> {
        Ok(self.state.read().await.status)
    }

    async fn set_output(&self, on: bool) -> Result<()> {
        let mut state = self.state.write().await;
        if on {
            self.on_commands.fetch_add(1, Ordering::SeqCst);
            if state.on_since.is_none() {
                state.on_since = Some(Instant::now());
            }
            state.status = FluxStatus::Outputting;
        } else {
            self.off_commands.fetch_add(1, Ordering::SeqCst);
            if let Some(since) = state.on_since.take() {
                state.accumulated += since.elapsed();
            }
            if state.status != FluxStatus::Fault {
                state.status = FluxStatus::Standby;
            }
        }
        Ok(())
    }

    async fn set_continuous(&self) -> Result<()> {
        self.continuous_commands.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        state.status = FluxStatus::Outputting;
        if let Some(since) = state.on_since.replace(Instant::now()) {
            state.accumulated += since.elapsed();
        }
        Ok(())
    }

    async fn is_firing(&self) -> Result<bool> {
        if self.never_fires.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let state = self.state.read().await;
        Ok(state
            .on_since
            .map(|since| since.elapsed() >= self.ramp)
            .unwrap_or(false))
    }

    async fn exposure_totals(&self) -> Result<FluxTotals> {
        let state = self.state.read().await;
        let mut total = state.accumulated;
        if let Some(since) = state.on_since {
            total += since.elapsed();
        }
        Ok(FluxTotals {
            exposure_minutes: total.as_secs_f64() / 60.0,
            charge_mas: total.as_secs_f64() * self.tube_current_ma,
        })
    }
}

// =============================================================================
// MockScanSequencer - Simulated Scan Engine
// =============================================================================

/// Scan engine that completes a point each time its wait gate is released.
#[derive(Debug)]
pub struct MockScanSequencer {
    progress: RwLock<ScanProgress>,
    releases: AtomicUsize,
    aborts: AtomicUsize,
}

impl MockScanSequencer {
    /// No scan running (single exposures).
    pub fn idle() -> Self {
        Self {
            progress: RwLock::new(ScanProgress::default()),
            releases: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    /// A running scan of `points_total` points.
    pub fn running(points_total: u64) -> Self {
        Self {
            progress: RwLock::new(ScanProgress {
                points_completed: 0,
                points_total,
                running: true,
            }),
            ..Self::idle()
        }
    }

    /// A running grid scan over several axes.
    pub fn grid(points_per_axis: &[u64]) -> Self {
        Self {
            progress: RwLock::new(ScanProgress::from_axes(0, points_per_axis, true)),
            ..Self::idle()
        }
    }

    pub async fn start_scan(&self, points_total: u64) {
        *self.progress.write().await = ScanProgress {
            points_completed: 0,
            points_total,
            running: true,
        };
    }

    pub async fn snapshot(&self) -> ScanProgress {
        *self.progress.read().await
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanSequencer for MockScanSequencer {
    async fn progress(&self) -> Result<ScanProgress> {
        Ok(*self.progress.read().await)
    }

    async fn release_wait(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        let mut progress = self.progress.write().await;
        if progress.running {
            progress.points_completed = (progress.points_completed + 1).min(progress.points_total);
            if progress.points_completed >= progress.points_total {
                progress.running = false;
            }
        }
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.progress.write().await.running = false;
        Ok(())
    }
}

// =============================================================================
// MockMotionAxis - Simulated Motor
// =============================================================================

/// Motor axis that reports moving until stopped.
#[derive(Debug)]
pub struct MockMotionAxis {
    name: String,
    moving: AtomicBool,
    stops: AtomicUsize,
}

impl MockMotionAxis {
    pub fn new(name: impl Into<String>, moving: bool) -> Self {
        Self {
            name: name.into(),
            moving: AtomicBool::new(moving),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MotionAxis for MockMotionAxis {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_moving(&self) -> Result<bool> {
        Ok(self.moving.load(Ordering::SeqCst))
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.moving.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// CollectingReportSink
// =============================================================================

/// Keeps every submitted report.
#[derive(Debug, Default)]
pub struct CollectingReportSink {
    reports: Mutex<Vec<ScanReport>>,
}

impl CollectingReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<ScanReport> {
        self.reports.lock().await.clone()
    }
}

#[async_trait]
impl ReportSink for CollectingReportSink {
    async fn submit(&self, report: ScanReport) -> Result<()> {
        self.reports.lock().await.push(report);
        Ok(())
    }
}

// =============================================================================
// MemoryPublisher
// =============================================================================

/// Record publisher that keeps every update, in order.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    updates: std::sync::Mutex<Vec<(&'static str, RecordValue)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<(&'static str, RecordValue)> {
        match self.updates.lock() {
            Ok(updates) => updates.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Most recent value published to `record`.
    pub fn latest(&self, record: &str) -> Option<RecordValue> {
        self.updates()
            .into_iter()
            .rev()
            .find(|(name, _)| *name == record)
            .map(|(_, value)| value)
    }
}

impl RecordPublisher for MemoryPublisher {
    fn publish(&self, record: &'static str, value: RecordValue) -> Result<()> {
        match self.updates.lock() {
            Ok(mut updates) => updates.push((record, value)),
            Err(_) => bail!("MemoryPublisher: update log poisoned"),
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_detector_timeline() {
        let detector = SimulatedDetector::new();
        detector.set_trigger_mode(DetectorTriggerMode::Hard).await.unwrap();

        // Not acquiring: both lines low
        assert_eq!(detector.read_inputs().await.unwrap(), LineLevels::default());

        detector.set_acquire(true).await.unwrap();
        assert!(detector.read_inputs().await.unwrap().ready);

        detector.write_output(0).await.unwrap();
        detector.write_output(1).await.unwrap();

        sleep(Duration::from_millis(10)).await;
        let levels = detector.read_inputs().await.unwrap();
        assert!(!levels.ready);
        assert!(levels.exposing);

        sleep(Duration::from_millis(100)).await;
        let levels = detector.read_inputs().await.unwrap();
        assert!(!levels.ready);
        assert!(!levels.exposing);

        sleep(Duration::from_millis(20)).await;
        assert!(detector.read_inputs().await.unwrap().ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_ignored_in_soft_mode() {
        let detector = SimulatedDetector::new();
        detector.set_acquire(true).await.unwrap();
        detector.write_output(1).await.unwrap();

        sleep(Duration::from_millis(10)).await;
        assert!(!detector.read_inputs().await.unwrap().exposing);
        assert_eq!(detector.soft_trigger_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flux_ramp() {
        let source = MockFluxSource::new(Duration::from_millis(50));
        assert!(!source.is_firing().await.unwrap());

        source.set_output(true).await.unwrap();
        assert!(!source.is_firing().await.unwrap());
        sleep(Duration::from_millis(50)).await;
        assert!(source.is_firing().await.unwrap());

        source.set_output(false).await.unwrap();
        assert!(!source.is_firing().await.unwrap());
        let totals = source.exposure_totals().await.unwrap();
        assert!((totals.exposure_minutes * 60.0 - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_scan_advances_on_release() {
        let scan = MockScanSequencer::running(2);
        scan.release_wait().await.unwrap();
        assert_eq!(scan.snapshot().await.points_completed, 1);
        assert!(scan.snapshot().await.running);

        scan.release_wait().await.unwrap();
        let progress = scan.snapshot().await;
        assert_eq!(progress.points_completed, 2);
        assert!(!progress.running);
    }

    #[tokio::test]
    async fn test_axis_stop() {
        let axis = MockMotionAxis::new("m1", true);
        assert!(axis.is_moving().await.unwrap());
        axis.stop().await.unwrap();
        assert!(!axis.is_moving().await.unwrap());
        assert_eq!(axis.stop_count(), 1);
    }
}
