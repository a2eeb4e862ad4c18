use async_trait::async_trait;
use log::debug;

use crate::{
    drivers::EcAccess,
    error::{FanControlError, Result},
    sensors::{TemperatureReading, TemperatureSensor, is_plausible},
};

/// Temperature held in one EC register (or little-endian word).
///
/// `0x00` and `0xFF` are what most controllers return for an absent or
/// not-yet-sampled thermal sensor, so both count as unavailable.
#[derive(Debug)]
pub struct EcRegisterSensor {
    pub(crate) index: usize,
    pub(crate) label: String,
    pub(crate) register: u8,
    pub(crate) word: bool,
    pub(crate) offset: f32,
    pub(crate) ec: EcAccess,
}

#[async_trait]
impl TemperatureSensor for EcRegisterSensor {
    fn index(&self) -> usize {
        self.index
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    async fn read(&self) -> Result<TemperatureReading> {
        let raw = if self.word {
            self.ec.read_word(self.register).await
        } else {
            self.ec.read_byte(self.register).await.map(u16::from)
        }
        .map_err(|e| FanControlError::sensor(self.index, e))?;

        let sentinel = if self.word { [0x0000, 0xFFFF] } else { [0x00, 0xFF] };
        if sentinel.contains(&raw) {
            return Err(FanControlError::sensor(
                self.index,
                format!("register {:#04x} returned sentinel {raw:#x}", self.register),
            ));
        }

        let value = f32::from(raw) + self.offset;
        if !is_plausible(value) {
            return Err(FanControlError::sensor(
                self.index,
                format!("{value}°C is out of range"),
            ));
        }

        debug!("{}: {value}°C", self.label);
        Ok(TemperatureReading::now(self.index, value))
    }
}
