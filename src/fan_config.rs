//! Fan configuration documents and the store that loads them.
//!
//! A fan configuration describes one notebook model: which EC registers hold
//! temperatures and fan speeds, the raw speed range of every fan, its curve,
//! and the register writes needed to take over (and hand back) control.
//! Documents live as `<configs_dir>/<name>.yml`.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    error::{FanControlError, Result},
    fan_curve::FanCurve,
};

/// Temperature source of a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SensorCfg {
    /// EC register holding a temperature in °C.
    EcRegister {
        register: u8,
        /// Read a little-endian word instead of a single byte.
        #[serde(default)]
        word: bool,
        /// Added to the raw value.
        #[serde(default)]
        offset: f32,
        #[serde(default)]
        label: Option<String>,
    },
    /// hwmon `temp*_input` file in millidegrees.
    Hwmon {
        path: PathBuf,
        #[serde(default)]
        label: Option<String>,
    },
}

impl SensorCfg {
    pub fn label(&self, index: usize) -> String {
        match self {
            SensorCfg::EcRegister { label: Some(l), .. } | SensorCfg::Hwmon { label: Some(l), .. } => {
                l.clone()
            }
            SensorCfg::EcRegister { register, .. } => format!("ec:{register:#04x}"),
            SensorCfg::Hwmon { .. } => format!("hwmon{index}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideDirection {
    #[default]
    Both,
    Read,
    Write,
}

/// Exact percentage that maps to a fixed raw register value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedOverride {
    pub percent: f32,
    pub value: u16,
    #[serde(default)]
    pub direction: OverrideDirection,
}

impl SpeedOverride {
    pub fn applies_to_write(&self) -> bool {
        self.direction != OverrideDirection::Read
    }

    pub fn applies_to_read(&self) -> bool {
        self.direction != OverrideDirection::Write
    }
}

/// One fan of a configuration; its index is its position in the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanCfg {
    #[serde(default)]
    pub name: Option<String>,
    pub write_register: u8,
    pub read_register: u8,
    #[serde(default)]
    pub rpm_register: Option<u8>,
    pub min_speed_value: u16,
    pub max_speed_value: u16,
    /// Raw value that hands the fan back to the firmware.
    #[serde(default)]
    pub reset_value: Option<u16>,
    /// Indices into the configuration's sensor list; all sensors when absent.
    #[serde(default)]
    pub sensors: Option<Vec<usize>>,
    pub curve: FanCurve,
    #[serde(default)]
    pub speed_overrides: Vec<SpeedOverride>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Set,
    And,
    Or,
}

impl WriteMode {
    pub fn combine(self, current: u8, value: u8) -> u8 {
        match self {
            WriteMode::Set => value,
            WriteMode::And => current & value,
            WriteMode::Or => current | value,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteOccasion {
    /// Once when control starts.
    #[default]
    Initialization,
    /// Before every fan speed write.
    FanSpeedWrite,
}

/// Register write needed to enable manual fan control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterWrite {
    pub register: u8,
    pub value: u8,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub occasion: WriteOccasion,
    /// Written back with the same mode when control is released.
    #[serde(default)]
    pub reset_value: Option<u8>,
}

/// Validated fan configuration document.
///
/// # Example
///
/// ```yaml
/// model: Example 14
/// polling_interval_ms: 3000
/// hysteresis: 2.0
/// critical_temperature: 90
/// sensors:
///   - kind: ec-register
///     register: 0x68
/// fans:
///   - name: CPU fan
///     write_register: 0x94
///     read_register: 0x95
///     min_speed_value: 0
///     max_speed_value: 255
///     reset_value: 255
///     curve:
///       - { temperature: 40, speed: 30 }
///       - { temperature: 60, speed: 60 }
///       - { temperature: 80, speed: 100 }
/// register_writes:
///   - register: 0x93
///     value: 0x14
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanConfiguration {
    /// File stem the document was loaded from.
    #[serde(skip)]
    pub name: String,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default = "defaults::polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Hysteresis margin in °C.
    #[serde(default = "defaults::hysteresis")]
    pub hysteresis: f32,

    #[serde(default)]
    pub critical_temperature: Option<f32>,

    /// Fan speed registers are little-endian words.
    #[serde(default)]
    pub read_write_words: bool,

    pub sensors: Vec<SensorCfg>,

    pub fans: Vec<FanCfg>,

    #[serde(default)]
    pub register_writes: Vec<RegisterWrite>,
}

mod defaults {
    pub fn polling_interval_ms() -> u64 {
        3000
    }

    pub fn hysteresis() -> f32 {
        crate::fan_curve::DEFAULT_HYSTERESIS
    }
}

const MIN_POLLING_INTERVAL_MS: u64 = 100;

impl FanConfiguration {
    pub fn from_yaml(name: &str, text: &str) -> Result<Self> {
        let mut config: FanConfiguration = serde_yaml::from_str(text)
            .map_err(|e| FanControlError::invalid(format!("{name}: {e}")))?;
        config.name = name.to_string();
        config.validate()?;
        Ok(config)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Sensor indices feeding fan `fan`.
    pub fn fan_sensors(&self, fan: usize) -> Vec<usize> {
        match self.fans.get(fan).and_then(|f| f.sensors.as_ref()) {
            Some(selected) => selected.clone(),
            None => (0..self.sensors.len()).collect(),
        }
    }

    pub fn fan_name(&self, fan: usize) -> String {
        self.fans
            .get(fan)
            .and_then(|f| f.name.clone())
            .unwrap_or_else(|| format!("fan{fan}"))
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(FanControlError::invalid(format!("{}: {reason}", self.name)));

        if self.sensors.is_empty() {
            return fail("no sensors configured".into());
        }
        if self.fans.is_empty() {
            return fail("no fans configured".into());
        }
        if self.polling_interval_ms < MIN_POLLING_INTERVAL_MS {
            return fail(format!(
                "polling interval {} ms is below {MIN_POLLING_INTERVAL_MS} ms",
                self.polling_interval_ms
            ));
        }
        if !self.hysteresis.is_finite() || self.hysteresis < 0.0 {
            return fail(format!("hysteresis {} must be a non-negative number", self.hysteresis));
        }
        if self.critical_temperature.is_some_and(|t| !t.is_finite()) {
            return fail("critical temperature must be finite".into());
        }

        for (idx, sensor) in self.sensors.iter().enumerate() {
            if let SensorCfg::EcRegister {
                register,
                word: true,
                ..
            } = sensor
            {
                if *register == u8::MAX {
                    return fail(format!("sensor {idx}: word register {register:#04x} has no high byte"));
                }
            }
        }

        let max_raw = if self.read_write_words {
            u16::MAX
        } else {
            u16::from(u8::MAX)
        };

        for (idx, fan) in self.fans.iter().enumerate() {
            let raw_values = [fan.min_speed_value, fan.max_speed_value]
                .into_iter()
                .chain(fan.reset_value)
                .chain(fan.speed_overrides.iter().map(|o| o.value));
            if let Some(v) = raw_values.into_iter().find(|v| *v > max_raw) {
                return fail(format!("fan {idx}: raw value {v} exceeds register width"));
            }
            if fan.min_speed_value == fan.max_speed_value {
                return fail(format!("fan {idx}: min and max speed values are equal"));
            }
            if self.read_write_words
                && (fan.write_register == u8::MAX || fan.read_register == u8::MAX)
            {
                return fail(format!("fan {idx}: word register has no high byte"));
            }
            if fan.rpm_register == Some(u8::MAX) {
                return fail(format!("fan {idx}: rpm register has no high byte"));
            }
            if let Some(o) = fan
                .speed_overrides
                .iter()
                .find(|o| !(0.0..=100.0).contains(&o.percent))
            {
                return fail(format!("fan {idx}: override percentage {} is out of range", o.percent));
            }
            if let Some(s) = fan
                .sensors
                .iter()
                .flatten()
                .find(|s| **s >= self.sensors.len())
            {
                return fail(format!("fan {idx}: sensor index {s} does not exist"));
            }
            if fan.sensors.as_ref().is_some_and(Vec::is_empty) {
                return fail(format!("fan {idx}: empty sensor selection"));
            }
        }

        Ok(())
    }
}

/// Directory of named fan configurations.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing configuration `name`.
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
            || name.contains('\0')
        {
            return Err(FanControlError::invalid(format!(
                "'{name}' is not a valid configuration name"
            )));
        }
        Ok(self.dir.join(format!("{name}.yml")))
    }

    /// Reads, parses and validates configuration `name`.
    pub async fn load(&self, name: &str) -> Result<Arc<FanConfiguration>> {
        let path = self.path_for(name)?;
        debug!("Loading fan configuration from {}", path.display());

        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            FanControlError::invalid(format!("cannot read configuration '{name}': {e}"))
        })?;
        let config = FanConfiguration::from_yaml(name, &text)?;

        info!(
            "Loaded fan configuration '{}' ({} fans, {} sensors)",
            name,
            config.fans.len(),
            config.sensors.len()
        );
        Ok(Arc::new(config))
    }

    /// Names of all `*.yml` documents, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            FanControlError::invalid(format!(
                "cannot list configurations in {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FanControlError::invalid(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "yml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
