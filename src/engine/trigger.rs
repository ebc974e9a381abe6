//! Trigger Driver
//!
//! Writes the detector's trigger input line. A low-to-high transition requests
//! an exposure.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, error};

use crate::error::IoError;
use crate::hardware::DigitalLines;

/// Requested level of the trigger output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerLevel {
    Low,
    High,
}

impl TriggerLevel {
    /// Single-line bit pattern written to the output port.
    pub fn pattern(self) -> u8 {
        match self {
            TriggerLevel::Low => 0,
            TriggerLevel::High => 1,
        }
    }
}

/// Drives the trigger output line with a bounded write.
#[derive(Clone)]
pub struct TriggerDriver {
    lines: Arc<dyn DigitalLines>,
    write_timeout: Duration,
}

impl TriggerDriver {
    pub fn new(lines: Arc<dyn DigitalLines>, write_timeout: Duration) -> Self {
        Self {
            lines,
            write_timeout,
        }
    }

    /// Write `level` to the trigger line.
    ///
    /// Any non-zero device status is returned as [`IoError::WriteStatus`];
    /// the caller decides what that means for the run.
    pub async fn fire(&self, level: TriggerLevel) -> Result<(), IoError> {
        let result = match timeout(self.write_timeout, self.lines.write_output(level.pattern())).await
        {
            Err(_) => Err(IoError::WriteTimeout(self.write_timeout)),
            Ok(Err(err)) => Err(IoError::Write(format!("{err:#}"))),
            Ok(Ok(0)) => Ok(()),
            Ok(Ok(code)) => Err(IoError::WriteStatus { code }),
        };

        match &result {
            Ok(()) => debug!(?level, "Trigger line written"),
            Err(err) => error!(?level, "Trigger write failed: {}", err),
        }
        result
    }
}

impl std::fmt::Debug for TriggerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerDriver")
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}
