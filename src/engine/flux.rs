//! Flux Controller
//!
//! Switches the selected X-ray source on and waits until it reports steady
//! output, or switches it off. Which source, and how readiness is detected,
//! is resolved once per run into a [`FluxController`] from the mode selected
//! at that moment; the controller is then passed by value into the run.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use super::cancel::CancelToken;
use crate::config::{FluxConfig, FluxHandshake, FluxMode};
use crate::error::{FluxError, ProtocolError, SyncResult};
use crate::hardware::{FluxSource, FluxStatus, FluxTotals};

/// The two selectable sources.
#[derive(Clone)]
pub struct FluxSources {
    pub source_a: Arc<dyn FluxSource>,
    pub source_b: Arc<dyn FluxSource>,
}

impl FluxSources {
    fn get(&self, mode: FluxMode) -> Option<Arc<dyn FluxSource>> {
        match mode {
            FluxMode::None => None,
            FluxMode::SourceA => Some(self.source_a.clone()),
            FluxMode::SourceB => Some(self.source_b.clone()),
        }
    }
}

#[derive(Clone)]
struct FluxProfile {
    name: String,
    handshake: FluxHandshake,
    source: Arc<dyn FluxSource>,
    poll_interval: Duration,
    ready_timeout: Duration,
}

/// Flux control for one run.
#[derive(Clone)]
pub struct FluxController {
    mode: FluxMode,
    profile: Option<FluxProfile>,
}

impl std::fmt::Debug for FluxController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluxController")
            .field("mode", &self.mode)
            .field("source", &self.profile.as_ref().map(|p| p.name.as_str()))
            .finish()
    }
}

impl FluxController {
    /// Resolve the controller for `mode`.
    pub fn resolve(config: &FluxConfig, mode: FluxMode, sources: &FluxSources) -> Self {
        let profile = config.endpoint(mode).zip(sources.get(mode)).map(|(endpoint, source)| {
            FluxProfile {
                name: endpoint.name.clone(),
                handshake: endpoint.handshake,
                source,
                poll_interval: config.poll_interval(),
                ready_timeout: config.ready_timeout(),
            }
        });
        Self { mode, profile }
    }

    pub fn mode(&self) -> FluxMode {
        self.mode
    }

    /// Bring the source to steady output.
    ///
    /// Returns immediately with [`FluxError::Fault`] or [`FluxError::NotReady`]
    /// without touching the source; retrying later is the caller's call.
    pub async fn ensure_on(&self, cancel: &CancelToken) -> SyncResult<()> {
        let Some(profile) = &self.profile else {
            info!("No flux source selected, acquiring dark image");
            return Ok(());
        };

        if profile.handshake == FluxHandshake::Direct {
            profile
                .source
                .set_output(true)
                .await
                .map_err(|e| command_error(profile, e))?;
            info!(source = %profile.name, "X-ray output requested");
            return Ok(());
        }

        let status = profile
            .source
            .status()
            .await
            .map_err(|e| command_error(profile, e))?;

        match status {
            FluxStatus::Fault => {
                warn!(source = %profile.name, "X-ray source is in fault mode");
                return Err(FluxError::Fault {
                    source_name: profile.name.clone(),
                }
                .into());
            }
            FluxStatus::Warming => {
                warn!(source = %profile.name, "X-ray source is still warming up");
                return Err(FluxError::NotReady {
                    source_name: profile.name.clone(),
                }
                .into());
            }
            FluxStatus::Standby => {
                profile
                    .source
                    .set_output(true)
                    .await
                    .map_err(|e| command_error(profile, e))?;
            }
            FluxStatus::Pulsing | FluxStatus::Outputting => {
                profile
                    .source
                    .set_continuous()
                    .await
                    .map_err(|e| command_error(profile, e))?;
            }
        }

        self.wait_until_firing(profile, cancel).await?;
        info!(source = %profile.name, "X-ray is outputting at set points");
        Ok(())
    }

    async fn wait_until_firing(&self, profile: &FluxProfile, cancel: &CancelToken) -> SyncResult<()> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(ProtocolError::cancelled().into());
            }
            if profile
                .source
                .is_firing()
                .await
                .map_err(|e| command_error(profile, e))?
            {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= profile.ready_timeout {
                return Err(FluxError::Timeout {
                    source_name: profile.name.clone(),
                    waited,
                }
                .into());
            }
            sleep(profile.poll_interval).await;
        }
    }

    /// Switch the source off. Safe to call in any state; failures are logged.
    pub async fn ensure_off(&self) {
        let Some(profile) = &self.profile else {
            return;
        };
        match profile.source.set_output(false).await {
            Ok(()) => info!(source = %profile.name, "X-ray is off"),
            Err(err) => warn!(source = %profile.name, "Failed to switch X-ray off: {:#}", err),
        }
    }

    /// Accumulated source output, `None` in dark mode or if the read fails.
    pub async fn exposure_totals(&self) -> Option<FluxTotals> {
        let profile = self.profile.as_ref()?;
        match profile.source.exposure_totals().await {
            Ok(totals) => Some(totals),
            Err(err) => {
                warn!(source = %profile.name, "Failed to read exposure totals: {:#}", err);
                None
            }
        }
    }
}

fn command_error(profile: &FluxProfile, err: anyhow::Error) -> FluxError {
    FluxError::Command {
        source_name: profile.name.clone(),
        message: format!("{err:#}"),
    }
}
