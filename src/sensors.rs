use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Lowest plausible temperature in °C.
pub const MIN_VALID_TEMPERATURE: f32 = -40.0;
/// Highest plausible temperature in °C.
pub const MAX_VALID_TEMPERATURE: f32 = 150.0;

/// One temperature sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub sensor: usize,
    pub value: f32,
    pub timestamp: DateTime<Utc>,
}

impl TemperatureReading {
    pub fn now(sensor: usize, value: f32) -> Self {
        Self {
            sensor,
            value,
            timestamp: Utc::now(),
        }
    }
}

/// Source of temperature readings. Every call performs a fresh read.
#[async_trait]
pub trait TemperatureSensor: Send + Sync {
    /// Position of the sensor in its configuration.
    fn index(&self) -> usize;

    fn label(&self) -> String;

    async fn read(&self) -> Result<TemperatureReading>;
}

pub fn is_plausible(value: f32) -> bool {
    (MIN_VALID_TEMPERATURE..=MAX_VALID_TEMPERATURE).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plausibility_bounds_are_inclusive() {
        assert!(is_plausible(-40.0));
        assert!(is_plausible(150.0));
        assert!(!is_plausible(150.5));
        assert!(!is_plausible(f32::NAN));
    }
}
