//! Configuration System using Figment
//!
//! Strongly-typed settings for the synchronization engine. Configuration is
//! loaded from:
//! 1. `config/sync.toml` (base configuration)
//! 2. Environment variables prefixed with `DETSYNC_`, nested keys separated by `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! DETSYNC_APPLICATION__LOG_LEVEL=debug
//! DETSYNC_ENGINE__SETTLE_DELAY_MS=40
//! DETSYNC_FLUX__MODE=source_b
//! ```
//!
//! # Example
//!
//! ```no_run
//! use detector_sync::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     println!("Poll interval: {:?}", settings.engine.poll_interval());
//!     println!("Flux mode: {}", settings.flux.mode);
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/sync.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Polling, handshake and actor settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Flux source selection and endpoints
    #[serde(default)]
    pub flux: FluxConfig,
    /// End-of-scan reporting
    #[serde(default)]
    pub report: ReportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Trigger protocol used by the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Trigger and handshake through the digital I/O subsystem.
    Hard,
    /// Software trigger plus the detector's reported acquire time.
    Soft,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Hard => write!(f, "hard"),
            SyncMode::Soft => write!(f, "soft"),
        }
    }
}

/// Engine timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Edge poller tick interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Consecutive failed line reads before the poller gives up
    #[serde(default = "default_read_failures")]
    pub max_consecutive_read_failures: u32,
    /// Delay after each trigger write before polling the detector lines
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Upper bound on a single digital output write
    #[serde(default = "default_write_timeout")]
    pub trigger_write_timeout_ms: u64,
    /// Upper bound on the wait for the trigger-ready line
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
    /// Upper bound on the wait for the exposing line to deassert
    #[serde(default = "default_exposing_timeout")]
    pub exposing_timeout_ms: u64,
    /// Upper bound on the wait for the exposure's timing sample after the shutter closes
    #[serde(default = "default_sample_timeout")]
    pub sample_timeout_ms: u64,
    /// Time a cancelled run gets to unwind before its task is dropped
    #[serde(default = "default_abort_grace")]
    pub abort_grace_ms: u64,
    /// Sequencer command mailbox capacity
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    /// Event broadcast capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Forces a protocol instead of probing the digital I/O subsystem
    #[serde(default)]
    pub sync_mode: Option<SyncMode>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_consecutive_read_failures: default_read_failures(),
            settle_delay_ms: default_settle_delay(),
            trigger_write_timeout_ms: default_write_timeout(),
            ready_timeout_ms: default_ready_timeout(),
            exposing_timeout_ms: default_exposing_timeout(),
            sample_timeout_ms: default_sample_timeout(),
            abort_grace_ms: default_abort_grace(),
            command_capacity: default_command_capacity(),
            event_capacity: default_event_capacity(),
            sync_mode: None,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn trigger_write_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_write_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn exposing_timeout(&self) -> Duration {
        Duration::from_millis(self.exposing_timeout_ms)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}

/// Which flux source, if any, is synchronized with the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FluxMode {
    /// No source; dark acquisition.
    #[default]
    None,
    SourceA,
    SourceB,
}

impl fmt::Display for FluxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FluxMode::None => write!(f, "none"),
            FluxMode::SourceA => write!(f, "source_a"),
            FluxMode::SourceB => write!(f, "source_b"),
        }
    }
}

impl std::str::FromStr for FluxMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(FluxMode::None),
            "source_a" | "a" => Ok(FluxMode::SourceA),
            "source_b" | "b" => Ok(FluxMode::SourceB),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid flux mode '{}'. Must be one of: none, source_a, source_b",
                other
            ))),
        }
    }
}

/// How a flux source signals that it has reached steady output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FluxHandshake {
    /// Check the reported status, switch on, and wait for the firing flag.
    Status,
    /// Issue "on" and treat the source as ready.
    Direct,
}

/// A single flux source endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxEndpointConfig {
    /// Human-readable source name used in logs and errors
    pub name: String,
    /// Readiness handshake
    #[serde(default = "default_handshake")]
    pub handshake: FluxHandshake,
}

/// Flux source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxConfig {
    /// Mode selected at startup
    #[serde(default)]
    pub mode: FluxMode,
    /// Readiness poll cadence in milliseconds
    #[serde(default = "default_flux_poll_interval")]
    pub poll_interval_ms: u64,
    /// Upper bound on the wait for steady output
    #[serde(default = "default_flux_ready_timeout")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_source_a")]
    pub source_a: FluxEndpointConfig,
    #[serde(default = "default_source_b")]
    pub source_b: FluxEndpointConfig,
}

impl Default for FluxConfig {
    fn default() -> Self {
        Self {
            mode: FluxMode::None,
            poll_interval_ms: default_flux_poll_interval(),
            ready_timeout_ms: default_flux_ready_timeout(),
            source_a: default_source_a(),
            source_b: default_source_b(),
        }
    }
}

impl FluxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Endpoint for a mode, `None` for dark acquisition.
    pub fn endpoint(&self, mode: FluxMode) -> Option<&FluxEndpointConfig> {
        match mode {
            FluxMode::None => None,
            FluxMode::SourceA => Some(&self.source_a),
            FluxMode::SourceB => Some(&self.source_b),
        }
    }
}

/// End-of-scan report configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Whether reports are produced at startup
    #[serde(default)]
    pub enabled: bool,
    /// Leading shutter durations dropped before aggregation
    #[serde(default = "default_discard_shutter")]
    pub discard_leading_shutter: usize,
    /// Leading duty cycles dropped before aggregation
    #[serde(default = "default_discard_duty")]
    pub discard_leading_duty: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            discard_leading_shutter: default_discard_shutter(),
            discard_leading_duty: default_discard_duty(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "detector_sync".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> u64 {
    1
}

fn default_read_failures() -> u32 {
    10
}

fn default_settle_delay() -> u64 {
    25
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_ready_timeout() -> u64 {
    10_000
}

fn default_exposing_timeout() -> u64 {
    60_000
}

fn default_sample_timeout() -> u64 {
    5_000
}

fn default_abort_grace() -> u64 {
    500
}

fn default_command_capacity() -> usize {
    32
}

fn default_event_capacity() -> usize {
    256
}

fn default_flux_poll_interval() -> u64 {
    10
}

fn default_flux_ready_timeout() -> u64 {
    30_000
}

fn default_handshake() -> FluxHandshake {
    FluxHandshake::Status
}

fn default_source_a() -> FluxEndpointConfig {
    FluxEndpointConfig {
        name: "SRI".to_string(),
        handshake: FluxHandshake::Direct,
    }
}

fn default_source_b() -> FluxEndpointConfig {
    FluxEndpointConfig {
        name: "OXFORD".to_string(),
        handshake: FluxHandshake::Status,
    }
}

fn default_discard_shutter() -> usize {
    1
}

fn default_discard_duty() -> usize {
    2
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from `config/sync.toml` and `DETSYNC_` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific file path.
    ///
    /// Missing keys fall back to the built-in defaults, so a partial file is
    /// valid. Environment variables take precedence over the file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DETSYNC_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let intervals = [
            ("engine.poll_interval_ms", self.engine.poll_interval_ms),
            ("engine.trigger_write_timeout_ms", self.engine.trigger_write_timeout_ms),
            ("engine.ready_timeout_ms", self.engine.ready_timeout_ms),
            ("engine.exposing_timeout_ms", self.engine.exposing_timeout_ms),
            ("engine.sample_timeout_ms", self.engine.sample_timeout_ms),
            ("flux.poll_interval_ms", self.flux.poll_interval_ms),
            ("flux.ready_timeout_ms", self.flux.ready_timeout_ms),
        ];
        for (key, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "'{}' must be greater than zero",
                    key
                )));
            }
        }

        if self.engine.max_consecutive_read_failures == 0 {
            return Err(ConfigError::ValidationError(
                "'engine.max_consecutive_read_failures' must be at least 1".to_string(),
            ));
        }

        if self.engine.command_capacity == 0 || self.engine.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Channel capacities must be greater than zero".to_string(),
            ));
        }

        for (key, endpoint) in [("source_a", &self.flux.source_a), ("source_b", &self.flux.source_b)] {
            if endpoint.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "flux.{}: 'name' cannot be empty",
                    key
                )));
            }
        }

        Ok(())
    }
}
