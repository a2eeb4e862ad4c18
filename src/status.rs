//! Status snapshots published by the control loop.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use zvariant::Type;

use crate::{
    error::{FanControlError, Result},
    sensors::TemperatureReading,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlState {
    Stopped,
    Starting,
    Running,
    FaultFallback,
}

impl ControlState {
    /// True while a hardware session is open.
    pub fn is_active(self) -> bool {
        self != ControlState::Stopped
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlState::Stopped => "stopped",
            ControlState::Starting => "starting",
            ControlState::Running => "running",
            ControlState::FaultFallback => "fault-fallback",
        })
    }
}

impl std::str::FromStr for ControlState {
    type Err = FanControlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(ControlState::Stopped),
            "starting" => Ok(ControlState::Starting),
            "running" => Ok(ControlState::Running),
            "fault-fallback" => Ok(ControlState::FaultFallback),
            other => Err(FanControlError::Remote(format!("unknown control state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "percent", rename_all = "kebab-case")]
pub enum FanMode {
    /// Firmware controls the fan.
    Automatic,
    ManualCurve,
    /// Fixed percentage set by a client.
    Fixed(f32),
    Disabled,
}

impl FanMode {
    fn wire_name(self) -> &'static str {
        match self {
            FanMode::Automatic => "automatic",
            FanMode::ManualCurve => "manual-curve",
            FanMode::Fixed(_) => "fixed",
            FanMode::Disabled => "disabled",
        }
    }
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanMode::Fixed(p) => write!(f, "fixed {p:.1}%"),
            other => f.write_str(other.wire_name()),
        }
    }
}

/// Per-fan control state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanState {
    pub name: String,
    pub temperature: Option<f32>,
    pub target: Option<f32>,
    pub applied: Option<f32>,
    pub rpm: Option<u32>,
    pub mode: FanMode,
    pub stale: bool,
    pub consecutive_failures: u32,
}

impl FanState {
    pub fn disabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temperature: None,
            target: None,
            applied: None,
            rpm: None,
            mode: FanMode::Disabled,
            stale: false,
            consecutive_failures: 0,
        }
    }
}

/// Aggregated service snapshot, replaced on every publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: ControlState,
    pub config_name: Option<String>,
    pub cpu_temperature: Option<f32>,
    pub readings: Vec<TemperatureReading>,
    pub fans: Vec<FanState>,
    pub service_available: bool,
    pub timestamp: DateTime<Utc>,
}

impl ServiceStatus {
    pub fn stopped(config_name: Option<String>) -> Self {
        Self {
            state: ControlState::Stopped,
            config_name,
            cpu_temperature: None,
            readings: Vec::new(),
            fans: Vec::new(),
            service_available: true,
            timestamp: Utc::now(),
        }
    }

    /// Snapshot reported when no service answers.
    pub fn unavailable() -> Self {
        Self {
            service_available: false,
            ..Self::stopped(None)
        }
    }
}

// D-Bus has no optional values: absent numbers travel as NaN or -1 and
// absent strings as "".

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct ReadingRecord {
    pub sensor: u32,
    pub value: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct FanRecord {
    pub name: String,
    pub mode: String,
    pub fixed_percent: f64,
    pub temperature: f64,
    pub target: f64,
    pub applied: f64,
    pub rpm: i64,
    pub stale: bool,
    pub consecutive_failures: u32,
}

/// `ServiceStatus` as sent over D-Bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct StatusRecord {
    pub state: String,
    pub config_name: String,
    pub cpu_temperature: f64,
    pub service_available: bool,
    pub timestamp_ms: i64,
    pub readings: Vec<ReadingRecord>,
    pub fans: Vec<FanRecord>,
}

fn to_wire(value: Option<f32>) -> f64 {
    value.map_or(f64::NAN, f64::from)
}

fn from_wire(value: f64) -> Option<f32> {
    (!value.is_nan()).then_some(value as f32)
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl From<&ServiceStatus> for StatusRecord {
    fn from(status: &ServiceStatus) -> Self {
        Self {
            state: status.state.to_string(),
            config_name: status.config_name.clone().unwrap_or_default(),
            cpu_temperature: to_wire(status.cpu_temperature),
            service_available: status.service_available,
            timestamp_ms: status.timestamp.timestamp_millis(),
            readings: status
                .readings
                .iter()
                .map(|r| ReadingRecord {
                    sensor: r.sensor as u32,
                    value: f64::from(r.value),
                    timestamp_ms: r.timestamp.timestamp_millis(),
                })
                .collect(),
            fans: status
                .fans
                .iter()
                .map(|fan| FanRecord {
                    name: fan.name.clone(),
                    mode: fan.mode.wire_name().to_string(),
                    fixed_percent: match fan.mode {
                        FanMode::Fixed(p) => f64::from(p),
                        _ => f64::NAN,
                    },
                    temperature: to_wire(fan.temperature),
                    target: to_wire(fan.target),
                    applied: to_wire(fan.applied),
                    rpm: fan.rpm.map_or(-1, i64::from),
                    stale: fan.stale,
                    consecutive_failures: fan.consecutive_failures,
                })
                .collect(),
        }
    }
}

impl TryFrom<StatusRecord> for ServiceStatus {
    type Error = FanControlError;

    fn try_from(record: StatusRecord) -> Result<Self> {
        let fans = record
            .fans
            .into_iter()
            .map(|fan| {
                let mode = match fan.mode.as_str() {
                    "automatic" => FanMode::Automatic,
                    "manual-curve" => FanMode::ManualCurve,
                    "fixed" => FanMode::Fixed(fan.fixed_percent as f32),
                    "disabled" => FanMode::Disabled,
                    other => {
                        return Err(FanControlError::Remote(format!("unknown fan mode '{other}'")));
                    }
                };
                Ok(FanState {
                    name: fan.name,
                    temperature: from_wire(fan.temperature),
                    target: from_wire(fan.target),
                    applied: from_wire(fan.applied),
                    rpm: u32::try_from(fan.rpm).ok(),
                    mode,
                    stale: fan.stale,
                    consecutive_failures: fan.consecutive_failures,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            state: record.state.parse()?,
            config_name: Some(record.config_name).filter(|n| !n.is_empty()),
            cpu_temperature: from_wire(record.cpu_temperature),
            readings: record
                .readings
                .into_iter()
                .map(|r| TemperatureReading {
                    sensor: r.sensor as usize,
                    value: r.value as f32,
                    timestamp: timestamp(r.timestamp_ms),
                })
                .collect(),
            fans,
            service_available: record.service_available,
            timestamp: timestamp(record.timestamp_ms),
        })
    }
}
