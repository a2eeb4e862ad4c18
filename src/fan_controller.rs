//! Fan driver abstraction.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FanControlError, Result};

/// Requested speed for one fan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FanSpeed {
    /// Fixed percentage, leaves curve control.
    Percent(f32),
    /// Hand the fan back to the firmware.
    Auto,
}

impl FanSpeed {
    pub fn percent(value: f32) -> Result<Self> {
        if (0.0..=100.0).contains(&value) {
            Ok(Self::Percent(value))
        } else {
            Err(FanControlError::invalid(format!(
                "fan speed {value}% is outside 0-100"
            )))
        }
    }
}

impl FromStr for FanSpeed {
    type Err = FanControlError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        let value: f32 = s
            .trim_end_matches('%')
            .parse()
            .map_err(|_| FanControlError::invalid(format!("'{s}' is neither a percentage nor 'auto'")))?;
        Self::percent(value)
    }
}

impl fmt::Display for FanSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanSpeed::Percent(p) => write!(f, "{p:.1}%"),
            FanSpeed::Auto => f.write_str("auto"),
        }
    }
}

/// Register-level control of the fans of one configuration.
///
/// Failures are reported as `DriverIo` and never retried here; the control
/// loop decides what a failure means.
#[async_trait]
pub trait FanController: Send + Sync + fmt::Debug {
    fn fan_count(&self) -> usize;

    /// Runs the configuration's initialization register writes.
    async fn initialize(&self) -> Result<()>;

    async fn apply(&self, fan: usize, percent: f32) -> Result<()>;

    /// Current speed as reported by the read register.
    async fn read_speed(&self, fan: usize) -> Result<f32>;

    /// `None` when the fan has no RPM register.
    async fn read_rpm(&self, fan: usize) -> Result<Option<u32>>;

    /// Returns `false` when the fan has no automatic mode.
    async fn set_automatic(&self, fan: usize) -> Result<bool>;

    /// Hands every fan and register back to the firmware.
    async fn release(&self) -> Result<()>;
}
