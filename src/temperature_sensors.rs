//! Temperature sources built from a fan configuration's sensor list.

pub mod ec_register;
pub mod hwmon;

use std::time::Duration;

use crate::{drivers::EcAccess, fan_config::SensorCfg, sensors::TemperatureSensor};

pub use ec_register::EcRegisterSensor;
pub use hwmon::HwmonSensor;

/// Builds one sensor per configuration entry, keeping their order.
pub fn build(
    cfg: &[SensorCfg],
    ec: &EcAccess,
    io_timeout: Duration,
) -> Vec<Box<dyn TemperatureSensor>> {
    cfg.iter()
        .enumerate()
        .map(|(index, sensor)| match sensor {
            SensorCfg::EcRegister {
                register,
                word,
                offset,
                ..
            } => Box::new(EcRegisterSensor {
                index,
                label: sensor.label(index),
                register: *register,
                word: *word,
                offset: *offset,
                ec: ec.clone(),
            }) as Box<dyn TemperatureSensor>,
            SensorCfg::Hwmon { path, .. } => Box::new(HwmonSensor::new(
                index,
                sensor.label(index),
                path.clone(),
                io_timeout,
            )),
        })
        .collect()
}
