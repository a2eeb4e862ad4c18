//! Service configuration for the nbfcd daemon.
//!
//! Holds the settings of the service itself: where fan configurations live,
//! which one is selected, how to reach the embedded controller and which
//! bus to serve on. Fan configurations themselves are separate documents
//! handled by [`ConfigStore`](crate::fan_config::ConfigStore).

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

/// Main configuration structure for the nbfcd daemon.
///
/// # Example
///
/// ```yaml
/// version: 1
/// configs_dir: /etc/nbfcd/configs
/// selected_config: testbook
/// autostart: true
/// retry_threshold: 3
/// io_timeout_ms: 500
/// bus: system
/// ec:
///   backend: ec-sys
///   path: /sys/kernel/debug/ec/ec0/io
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Directory holding `<name>.yml` fan configurations.
    #[serde(default = "defaults::configs_dir")]
    pub configs_dir: PathBuf,

    /// Fan configuration loaded on `start`.
    #[serde(default)]
    pub selected_config: Option<String>,

    /// Start fan control as soon as the daemon is up.
    #[serde(default)]
    pub autostart: bool,

    /// Consecutive failed ticks before a fan falls back.
    #[serde(default = "defaults::retry_threshold")]
    pub retry_threshold: u32,

    /// Upper bound of every single hardware call.
    #[serde(default = "defaults::io_timeout_ms")]
    pub io_timeout_ms: u64,

    #[serde(default)]
    pub bus: BusKind,

    #[serde(default)]
    pub ec: EcCfg,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EcBackendKind {
    /// Kernel `ec_sys` register file.
    #[default]
    EcSys,
    /// In-memory registers, for trying configurations without hardware.
    Memory,
}

/// Embedded controller access settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcCfg {
    #[serde(default)]
    pub backend: EcBackendKind,

    #[serde(default = "defaults::ec_path")]
    pub path: PathBuf,

    /// Initial register contents of the memory backend.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub registers: BTreeMap<u8, u8>,
}

impl Default for EcCfg {
    fn default() -> Self {
        Self {
            backend: EcBackendKind::default(),
            path: defaults::ec_path(),
            registers: BTreeMap::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            configs_dir: defaults::configs_dir(),
            selected_config: None,
            autostart: false,
            retry_threshold: defaults::retry_threshold(),
            io_timeout_ms: defaults::io_timeout_ms(),
            bus: BusKind::default(),
            ec: EcCfg::default(),
        }
    }
}

impl Config {
    /// Validates the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.retry_threshold == 0 {
            anyhow::bail!("retry_threshold must be at least 1");
        }
        if self.io_timeout_ms == 0 {
            anyhow::bail!("io_timeout_ms must be positive");
        }
        if let Some(name) = &self.selected_config {
            if name.trim().is_empty() {
                anyhow::bail!("selected_config cannot be empty");
            }
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

mod defaults {
    use std::path::PathBuf;

    use crate::drivers::ec_sys::DEFAULT_EC_PATH;

    pub fn configs_dir() -> PathBuf {
        PathBuf::from("/etc/nbfcd/configs")
    }

    pub fn retry_threshold() -> u32 {
        3
    }

    pub fn io_timeout_ms() -> u64 {
        500
    }

    pub fn ec_path() -> PathBuf {
        PathBuf::from(DEFAULT_EC_PATH)
    }
}

fn locate_config() -> Result<PathBuf> {
    if let Ok(env_path) = env::var("NBFCD_CONFIG") {
        return Ok(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("nbfcd/config.yml");
        if cfg_dir.exists() {
            return Ok(cfg_dir);
        }
    }

    let etc = Path::new("/etc/nbfcd/config.yml");
    if etc.exists() {
        return Ok(etc.to_path_buf());
    }

    anyhow::bail!("Configuration file not found in any standard location")
}

/// Owns the service configuration and the file it came from.
///
/// # Example
///
/// ```no_run
/// use nbfcd::config::ConfigManager;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// let configs_dir = config_manager.get().await.configs_dir.clone();
///
/// config_manager.set_selected("testbook").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. NBFCD_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/nbfcd/config.yml or ~/.config/nbfcd/config.yml
    /// 4. /etc/nbfcd/config.yml
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => locate_config().context("No configuration file found")?,
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self::new(config, config_path))
    }

    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    pub async fn get_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, Config> {
        self.config.write().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Updates the selection and saves the file atomically (temp file,
    /// then rename).
    pub async fn set_selected(&self, name: &str) -> Result<()> {
        let mut config = self.config.write().await;
        if config.selected_config.as_deref() == Some(name) {
            return Ok(());
        }
        config.selected_config = Some(name.to_string());
        Self::save_to_path(&config, &self.path)
    }

    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    fn save_to_path(config: &Config, path: &Path) -> Result<()> {
        let config_yaml =
            serde_yaml::to_string(config).context("Failed to serialize configuration")?;

        let tmp_path = path.with_extension("yml.tmp");
        fs::write(&tmp_path, config_yaml).with_context(|| {
            format!("Failed to write temporary config to {}", tmp_path.display())
        })?;

        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to move config to {}", path.display()))?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        if config.version != 1 {
            anyhow::bail!(
                "Unsupported config version {} in file: {}",
                config.version,
                path.display()
            );
        }

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}
