use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;

use crate::{
    error::{FanControlError, Result},
    sensors::{TemperatureReading, TemperatureSensor, is_plausible},
};

const MILLIDEGREE_DIVISOR: f32 = 1000.0;

/// hwmon `temp*_input` file.
#[derive(Debug)]
pub struct HwmonSensor {
    index: usize,
    label: String,
    path: PathBuf,
    timeout: Duration,
}

impl HwmonSensor {
    pub fn new(index: usize, label: String, path: PathBuf, timeout: Duration) -> Self {
        Self {
            index,
            label,
            path,
            timeout,
        }
    }
}

#[async_trait]
impl TemperatureSensor for HwmonSensor {
    fn index(&self) -> usize {
        self.index
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    async fn read(&self) -> Result<TemperatureReading> {
        let fail = |reason: String| {
            FanControlError::sensor(self.index, format!("{}: {reason}", self.path.display()))
        };

        let text = tokio::time::timeout(self.timeout, tokio::fs::read_to_string(&self.path))
            .await
            .map_err(|_| fail("read timed out".into()))?
            .map_err(|e| fail(e.to_string()))?;

        let millidegrees: i64 = text
            .trim()
            .parse()
            .map_err(|_| fail(format!("unparsable value '{}'", text.trim())))?;

        let value = millidegrees as f32 / MILLIDEGREE_DIVISOR;
        if !is_plausible(value) {
            return Err(fail(format!("{value}°C is out of range")));
        }
        Ok(TemperatureReading::now(self.index, value))
    }
}
