//! Fan driver for notebook embedded controllers.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::{
    error::{FanControlError, Result},
    fan_config::{FanCfg, FanConfiguration, RegisterWrite, WriteMode, WriteOccasion},
    fan_controller::FanController,
};

use super::device_io::EcAccess;

/// Two percentages closer than this are the same override.
const OVERRIDE_EPSILON: f32 = 0.01;

/// Percentage to raw register value, honoring write overrides.
///
/// `min + (max - min) * p / 100`, rounded; `min > max` is allowed for
/// controllers where a lower value means a faster fan.
pub fn percent_to_raw(fan: &FanCfg, percent: f32) -> u16 {
    let percent = percent.clamp(0.0, 100.0);
    if let Some(o) = fan
        .speed_overrides
        .iter()
        .find(|o| o.applies_to_write() && (o.percent - percent).abs() < OVERRIDE_EPSILON)
    {
        return o.value;
    }

    let min = f32::from(fan.min_speed_value);
    let max = f32::from(fan.max_speed_value);
    (min + (max - min) * percent / 100.0).round() as u16
}

/// Raw register value to percentage, honoring read overrides.
pub fn raw_to_percent(fan: &FanCfg, raw: u16) -> f32 {
    if let Some(o) = fan
        .speed_overrides
        .iter()
        .find(|o| o.applies_to_read() && o.value == raw)
    {
        return o.percent;
    }

    let min = f32::from(fan.min_speed_value);
    let max = f32::from(fan.max_speed_value);
    ((f32::from(raw) - min) / (max - min) * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug)]
pub struct EcFanDriver {
    ec: EcAccess,
    config: Arc<FanConfiguration>,
}

impl EcFanDriver {
    pub fn new(ec: EcAccess, config: Arc<FanConfiguration>) -> Self {
        Self { ec, config }
    }

    fn fan(&self, fan: usize) -> Result<&FanCfg> {
        self.config.fans.get(fan).ok_or_else(|| {
            FanControlError::invalid(format!(
                "fan {fan} does not exist in '{}'",
                self.config.name
            ))
        })
    }

    async fn write_raw(&self, ec: &EcAccess, register: u8, value: u16) -> Result<()> {
        if self.config.read_write_words {
            ec.write_word(register, value).await
        } else {
            ec.write_byte(register, value as u8).await
        }
    }

    async fn read_raw(&self, register: u8) -> Result<u16> {
        if self.config.read_write_words {
            self.ec.read_word(register).await
        } else {
            self.ec.read_byte(register).await.map(u16::from)
        }
    }

    async fn register_write(
        ec: &EcAccess,
        register: u8,
        mode: WriteMode,
        value: u8,
    ) -> Result<()> {
        let value = match mode {
            WriteMode::Set => value,
            _ => mode.combine(ec.read_byte(register).await?, value),
        };
        ec.write_byte(register, value).await
    }

    async fn run_writes(&self, occasion: WriteOccasion) -> Result<()> {
        for RegisterWrite {
            register,
            value,
            mode,
            ..
        } in self
            .config
            .register_writes
            .iter()
            .filter(|w| w.occasion == occasion)
        {
            Self::register_write(&self.ec, *register, *mode, *value).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FanController for EcFanDriver {
    fn fan_count(&self) -> usize {
        self.config.fans.len()
    }

    async fn initialize(&self) -> Result<()> {
        info!("Initializing embedded controller for '{}'", self.config.name);
        self.run_writes(WriteOccasion::Initialization).await
    }

    async fn apply(&self, fan: usize, percent: f32) -> Result<()> {
        let cfg = self.fan(fan)?;
        self.run_writes(WriteOccasion::FanSpeedWrite).await?;

        let raw = percent_to_raw(cfg, percent);
        debug!("fan {fan}: {percent:.1}% -> raw {raw:#x}");
        self.write_raw(&self.ec, cfg.write_register, raw).await
    }

    async fn read_speed(&self, fan: usize) -> Result<f32> {
        let cfg = self.fan(fan)?;
        let raw = self.read_raw(cfg.read_register).await?;
        Ok(raw_to_percent(cfg, raw))
    }

    async fn read_rpm(&self, fan: usize) -> Result<Option<u32>> {
        match self.fan(fan)?.rpm_register {
            Some(register) => Ok(Some(u32::from(self.ec.read_word(register).await?))),
            None => Ok(None),
        }
    }

    async fn set_automatic(&self, fan: usize) -> Result<bool> {
        let cfg = self.fan(fan)?;
        match cfg.reset_value {
            Some(reset) => {
                self.write_raw(&self.ec, cfg.write_register, reset).await?;
                info!("fan {fan} handed back to firmware control");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self) -> Result<()> {
        // Release also runs after a stop cancelled the session.
        let ec = self.ec.detached();
        let mut first_error = None;

        for (idx, fan) in self.config.fans.iter().enumerate() {
            if let Some(reset) = fan.reset_value {
                if let Err(e) = self.write_raw(&ec, fan.write_register, reset).await {
                    warn!("Failed to reset fan {idx}: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        for w in &self.config.register_writes {
            if let Some(reset) = w.reset_value {
                if let Err(e) = Self::register_write(&ec, w.register, w.mode, reset).await {
                    warn!("Failed to reset register {:#04x}: {e}", w.register);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Released embedded controller for '{}'", self.config.name);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drivers::MemoryEc,
        fan_config::{OverrideDirection, SpeedOverride},
        fan_curve::FanCurve,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn fan(min: u16, max: u16) -> FanCfg {
        FanCfg {
            name: None,
            write_register: 0x94,
            read_register: 0x95,
            rpm_register: Some(0x84),
            min_speed_value: min,
            max_speed_value: max,
            reset_value: Some(0xFF),
            sensors: None,
            curve: FanCurve::from_pairs(&[(40.0, 30.0)]).unwrap(),
            speed_overrides: Vec::new(),
        }
    }

    fn driver(fans: Vec<FanCfg>, writes: Vec<RegisterWrite>) -> (Arc<MemoryEc>, EcFanDriver) {
        let ec = Arc::new(MemoryEc::new());
        let config = FanConfiguration {
            name: "test".into(),
            model: None,
            polling_interval_ms: 1000,
            hysteresis: 2.0,
            critical_temperature: None,
            read_write_words: false,
            sensors: Vec::new(),
            fans,
            register_writes: writes,
        };
        let access = EcAccess::new(ec.clone(), Duration::from_millis(200), CancellationToken::new());
        (ec, EcFanDriver::new(access, Arc::new(config)))
    }

    #[test]
    fn percent_maps_linearly_onto_raw_range() {
        let cfg = fan(0, 200);
        assert_eq!(percent_to_raw(&cfg, 0.0), 0);
        assert_eq!(percent_to_raw(&cfg, 50.0), 100);
        assert_eq!(percent_to_raw(&cfg, 100.0), 200);
        assert_eq!(percent_to_raw(&cfg, 33.3), 67);
    }

    #[test]
    fn inverted_range_maps_backwards() {
        let cfg = fan(255, 0);
        assert_eq!(percent_to_raw(&cfg, 0.0), 255);
        assert_eq!(percent_to_raw(&cfg, 100.0), 0);
        assert_eq!(raw_to_percent(&cfg, 0), 100.0);
    }

    #[test]
    fn overrides_respect_direction() {
        let mut cfg = fan(0, 200);
        cfg.speed_overrides = vec![
            SpeedOverride {
                percent: 0.0,
                value: 0xFF,
                direction: OverrideDirection::Both,
            },
            SpeedOverride {
                percent: 100.0,
                value: 0x80,
                direction: OverrideDirection::Read,
            },
        ];

        assert_eq!(percent_to_raw(&cfg, 0.0), 0xFF);
        assert_eq!(raw_to_percent(&cfg, 0xFF), 0.0);
        assert_eq!(percent_to_raw(&cfg, 100.0), 200);
        assert_eq!(raw_to_percent(&cfg, 0x80), 100.0);
    }

    #[tokio::test]
    async fn apply_writes_raw_value() {
        let (ec, driver) = driver(vec![fan(0, 200)], Vec::new());
        driver.apply(0, 50.0).await.unwrap();
        assert_eq!(ec.get(0x94), 100);
    }

    #[tokio::test]
    async fn speed_write_occasion_precedes_each_write() {
        let (ec, driver) = driver(
            vec![fan(0, 200)],
            vec![RegisterWrite {
                register: 0x93,
                value: 0x01,
                mode: WriteMode::Or,
                occasion: WriteOccasion::FanSpeedWrite,
                reset_value: None,
            }],
        );
        ec.set(0x93, 0x10);

        driver.apply(0, 100.0).await.unwrap();
        assert_eq!(ec.writes(), vec![(0x93, 0x11), (0x94, 200)]);
    }

    #[tokio::test]
    async fn initialize_and_release_restore_registers() {
        let (ec, driver) = driver(
            vec![fan(0, 200)],
            vec![RegisterWrite {
                register: 0x93,
                value: 0x14,
                mode: WriteMode::Set,
                occasion: WriteOccasion::Initialization,
                reset_value: Some(0x04),
            }],
        );

        driver.initialize().await.unwrap();
        assert_eq!(ec.get(0x93), 0x14);

        driver.release().await.unwrap();
        assert_eq!(ec.get(0x93), 0x04);
        assert_eq!(ec.get(0x94), 0xFF);
    }

    #[tokio::test]
    async fn release_works_on_cancelled_session() {
        let ec = Arc::new(MemoryEc::new());
        let mut config = FanConfiguration::from_yaml(
            "t",
            crate::fan_config::tests::TWO_FANS,
        )
        .unwrap();
        config.register_writes.clear();
        let cancel = CancellationToken::new();
        let access = EcAccess::new(ec.clone(), Duration::from_millis(200), cancel.clone());
        let driver = EcFanDriver::new(access, Arc::new(config));

        cancel.cancel();
        assert!(driver.apply(0, 50.0).await.is_err());
        driver.release().await.unwrap();
        assert_eq!(ec.get(148), 255);
    }

    #[tokio::test]
    async fn release_continues_after_failure() {
        let (ec, driver) = driver(
            vec![fan(0, 200)],
            vec![RegisterWrite {
                register: 0x93,
                value: 0x14,
                mode: WriteMode::Set,
                occasion: WriteOccasion::Initialization,
                reset_value: Some(0x04),
            }],
        );
        ec.fail_writes(0x94, true);

        assert!(driver.release().await.is_err());
        assert_eq!(ec.get(0x93), 0x04);
    }

    #[tokio::test]
    async fn automatic_mode_needs_reset_value() {
        let mut no_reset = fan(0, 200);
        no_reset.reset_value = None;
        no_reset.write_register = 0x96;
        let (ec, driver) = driver(vec![fan(0, 200), no_reset], Vec::new());

        assert!(driver.set_automatic(0).await.unwrap());
        assert_eq!(ec.get(0x94), 0xFF);
        assert!(!driver.set_automatic(1).await.unwrap());
        assert!(ec.writes().iter().all(|(reg, _)| *reg != 0x96));
    }

    #[tokio::test]
    async fn reads_speed_and_rpm() {
        let (ec, driver) = driver(vec![fan(0, 200)], Vec::new());
        ec.set(0x95, 50);
        ec.set(0x84, 0xB8);
        ec.set(0x85, 0x0B);

        assert_eq!(driver.read_speed(0).await.unwrap(), 25.0);
        assert_eq!(driver.read_rpm(0).await.unwrap(), Some(3000));
    }

    #[tokio::test]
    async fn unknown_fan_is_invalid() {
        let (_ec, driver) = driver(vec![fan(0, 200)], Vec::new());
        assert!(matches!(
            driver.apply(3, 10.0).await.unwrap_err(),
            FanControlError::InvalidConfiguration(_)
        ));
    }
}
