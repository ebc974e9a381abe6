//! Edge Poller
//!
//! Samples the detector's trigger-ready and exposing lines at a fixed cadence,
//! turns level changes into timestamped [`LineEdge`]s and publishes them.
//!
//! The poller is the only owner of the last-seen [`DigitalLineState`]. Other
//! tasks see it through a `watch` channel (latest sample) and a `broadcast`
//! channel (edges), never through shared mutable state.
//!
//! A failed read is retried on the next tick. Only after
//! `max_consecutive_read_failures` failures in a row does the poller stop and
//! report [`PollerHealth::Failed`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{IoError, SyncResult};
use crate::hardware::{DigitalLines, LineLevels};

/// One sample of both handshake lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DigitalLineState {
    pub ready: bool,
    pub exposing: bool,
    /// Monotonic sample time
    pub sampled_at: Instant,
}

impl DigitalLineState {
    fn from_levels(levels: LineLevels, sampled_at: Instant) -> Self {
        Self {
            ready: levels.ready,
            exposing: levels.exposing,
            sampled_at,
        }
    }

    fn levels(&self) -> LineLevels {
        LineLevels {
            ready: self.ready,
            exposing: self.exposing,
        }
    }
}

/// The four named transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EdgeKind {
    ReadyAsserted,
    ReadyDeasserted,
    ExposingAsserted,
    ExposingDeasserted,
}

impl EdgeKind {
    /// Level the line has after this edge.
    pub fn level(self) -> bool {
        matches!(self, EdgeKind::ReadyAsserted | EdgeKind::ExposingAsserted)
    }

    pub fn is_ready_line(self) -> bool {
        matches!(self, EdgeKind::ReadyAsserted | EdgeKind::ReadyDeasserted)
    }
}

/// A transition on one line with the time of the sample that revealed it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineEdge {
    pub kind: EdgeKind,
    pub at: Instant,
}

/// Health of the poller task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollerHealth {
    Running,
    /// Stopped after too many consecutive read failures
    Failed,
    Stopped,
}

/// Compares consecutive samples and reports which lines changed.
#[derive(Debug, Default)]
pub struct EdgeDetector {
    previous: Option<LineLevels>,
}

impl EdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample. The first sample only establishes the baseline.
    ///
    /// When both lines change within one tick, deassertions are reported
    /// before assertions, and the exposing line asserts before the ready line.
    /// That matches the physical order of a detector cycle.
    pub fn update(&mut self, state: &DigitalLineState) -> Vec<LineEdge> {
        let current = state.levels();
        let Some(previous) = self.previous.replace(current) else {
            return Vec::new();
        };

        let mut edges = Vec::with_capacity(2);
        let at = state.sampled_at;

        if previous.ready && !current.ready {
            edges.push(LineEdge { kind: EdgeKind::ReadyDeasserted, at });
        }
        if previous.exposing && !current.exposing {
            edges.push(LineEdge { kind: EdgeKind::ExposingDeasserted, at });
        }
        if !previous.exposing && current.exposing {
            edges.push(LineEdge { kind: EdgeKind::ExposingAsserted, at });
        }
        if !previous.ready && current.ready {
            edges.push(LineEdge { kind: EdgeKind::ReadyAsserted, at });
        }

        edges
    }
}

/// Receivers other tasks use to observe the poller.
#[derive(Debug, Clone)]
pub struct PollerHandle {
    pub lines: watch::Receiver<DigitalLineState>,
    pub health: watch::Receiver<PollerHealth>,
    edges: broadcast::Sender<LineEdge>,
}

impl PollerHandle {
    pub fn subscribe_edges(&self) -> broadcast::Receiver<LineEdge> {
        self.edges.subscribe()
    }
}

/// Polls the digital input lines and publishes samples and edges.
pub struct EdgePoller {
    lines: Arc<dyn DigitalLines>,
    detector: EdgeDetector,
    state_tx: watch::Sender<DigitalLineState>,
    edge_tx: broadcast::Sender<LineEdge>,
    health_tx: watch::Sender<PollerHealth>,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
}

impl EdgePoller {
    pub fn new(
        lines: Arc<dyn DigitalLines>,
        max_consecutive_failures: u32,
        edge_capacity: usize,
    ) -> (Self, PollerHandle) {
        let initial = DigitalLineState::from_levels(LineLevels::default(), Instant::now());
        let (state_tx, state_rx) = watch::channel(initial);
        let (edge_tx, _) = broadcast::channel(edge_capacity);
        let (health_tx, health_rx) = watch::channel(PollerHealth::Running);

        let handle = PollerHandle {
            lines: state_rx,
            health: health_rx,
            edges: edge_tx.clone(),
        };

        let poller = Self {
            lines,
            detector: EdgeDetector::new(),
            state_tx,
            edge_tx,
            health_tx,
            consecutive_failures: 0,
            max_consecutive_failures,
        };

        (poller, handle)
    }

    /// Take one sample, publish it and any edges it reveals.
    pub async fn poll(&mut self) -> SyncResult<DigitalLineState> {
        let levels = match self.lines.read_inputs().await {
            Ok(levels) => levels,
            Err(err) => {
                self.consecutive_failures += 1;
                return Err(IoError::Read(format!("{err:#}")).into());
            }
        };
        self.consecutive_failures = 0;

        let state = DigitalLineState::from_levels(levels, Instant::now());
        self.state_tx.send_replace(state);

        for edge in self.detector.update(&state) {
            debug!(edge = ?edge.kind, "line edge");
            // No receivers is fine; nobody is timing exposures right now.
            let _ = self.edge_tx.send(edge);
        }

        Ok(state)
    }

    /// Poll until shutdown or until reads fail too many times in a row.
    pub async fn run(mut self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?poll_interval, "Edge poller started");
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(err) = self.poll().await {
                if self.consecutive_failures >= self.max_consecutive_failures {
                    error!(
                        failures = self.consecutive_failures,
                        "Edge poller giving up: {}", err
                    );
                    self.health_tx.send_replace(PollerHealth::Failed);
                    return;
                }
                warn!(
                    attempt = self.consecutive_failures,
                    "Line sample failed, retrying next tick: {}", err
                );
            }
        }

        self.health_tx.send_replace(PollerHealth::Stopped);
        info!("Edge poller stopped");
    }
}

/// Spawn a poller task on the current runtime.
pub fn spawn_poller(
    lines: Arc<dyn DigitalLines>,
    poll_interval: Duration,
    max_consecutive_failures: u32,
    edge_capacity: usize,
    shutdown: watch::Receiver<bool>,
) -> (PollerHandle, JoinHandle<()>) {
    let (poller, handle) = EdgePoller::new(lines, max_consecutive_failures, edge_capacity);
    let task = tokio::spawn(poller.run(poll_interval, shutdown));
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedDetector;

    fn sample(ready: bool, exposing: bool, at: Instant) -> DigitalLineState {
        DigitalLineState {
            ready,
            exposing,
            sampled_at: at,
        }
    }

    #[test]
    fn test_first_sample_raises_nothing() {
        let mut detector = EdgeDetector::new();
        let edges = detector.update(&sample(true, true, Instant::now()));
        assert!(edges.is_empty());
    }

    #[test]
    fn test_each_line_reports_independently() {
        let t0 = Instant::now();
        let mut detector = EdgeDetector::new();
        detector.update(&sample(true, false, t0));

        let edges = detector.update(&sample(false, false, t0 + Duration::from_millis(1)));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, EdgeKind::ReadyDeasserted);

        let edges = detector.update(&sample(false, true, t0 + Duration::from_millis(2)));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, EdgeKind::ExposingAsserted);
        assert_eq!(edges[0].at, t0 + Duration::from_millis(2));

        let edges = detector.update(&sample(false, true, t0 + Duration::from_millis(3)));
        assert!(edges.is_empty(), "unchanged sample must not raise edges");
    }

    #[test]
    fn test_simultaneous_changes_follow_cycle_order() {
        let t0 = Instant::now();
        let mut detector = EdgeDetector::new();
        detector.update(&sample(false, true, t0));

        let kinds: Vec<_> = detector
            .update(&sample(true, false, t0 + Duration::from_millis(1)))
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EdgeKind::ExposingDeasserted, EdgeKind::ReadyAsserted]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_read_failure_is_retried() {
        let device = Arc::new(SimulatedDetector::new());
        device.fail_next_reads(1);
        let (mut poller, handle) = EdgePoller::new(device.clone(), 3, 16);

        assert!(poller.poll().await.is_err());
        assert!(poller.poll().await.is_ok());
        assert_eq!(*handle.health.borrow(), PollerHealth::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_failures_stop_poller() {
        let device = Arc::new(SimulatedDetector::new());
        device.fail_next_reads(u32::MAX);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let (mut handle, task) =
            spawn_poller(device.clone(), Duration::from_millis(1), 5, 16, shutdown_rx);
        task.await.unwrap();

        assert_eq!(*handle.health.borrow_and_update(), PollerHealth::Failed);
        assert_eq!(device.read_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_poller() {
        let device = Arc::new(SimulatedDetector::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) =
            spawn_poller(device, Duration::from_millis(1), 5, 16, shutdown_rx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_tx.send_replace(true);
        task.await.unwrap();
        assert_eq!(*handle.health.borrow(), PollerHealth::Stopped);
    }
}
