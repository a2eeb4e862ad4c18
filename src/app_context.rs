//! Application state shared by the daemon's services.

use std::sync::{Arc, Mutex, PoisonError};

use log::warn;

use crate::{
    config::{Config, ConfigManager, EcBackendKind},
    control_loop::{ControlHandle, ControlLoop, LoopSettings},
    controller::{EcBackend, EcConnector, HardwareConnector},
    drivers::MemoryEc,
    error::Result,
    event::EventBus,
    fan_config::ConfigStore,
};

/// Shared application state.
///
/// The control loop itself is handed out once, to the service that runs it;
/// everything else talks to it through [`ControlHandle`].
pub struct AppState {
    pub config_manager: Arc<ConfigManager>,
    pub control: ControlHandle,
    control_loop: Mutex<Option<ControlLoop>>,
}

impl AppState {
    /// Builds the control loop for the hardware named in the configuration.
    pub async fn new(config_manager: ConfigManager, event_bus: EventBus) -> anyhow::Result<Self> {
        let config = config_manager.clone_config().await;
        let connector = Arc::new(EcConnector::new(ec_backend(&config), config.io_timeout()));
        Ok(Self::with_connector(config_manager, &config, connector, event_bus))
    }

    pub fn with_connector(
        config_manager: ConfigManager,
        config: &Config,
        connector: Arc<dyn HardwareConnector>,
        event_bus: EventBus,
    ) -> Self {
        let (control_loop, control) = ControlLoop::new(
            ConfigStore::new(&config.configs_dir),
            connector,
            LoopSettings {
                retry_threshold: config.retry_threshold,
                selected_config: config.selected_config.clone(),
            },
        );

        Self {
            config_manager: Arc::new(config_manager),
            control,
            control_loop: Mutex::new(Some(control_loop.with_events(event_bus))),
        }
    }

    pub async fn config(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config_manager.get().await
    }

    /// Takes the control loop; `None` once a service owns it.
    pub fn take_control_loop(&self) -> Option<ControlLoop> {
        self.control_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Selects a fan configuration and remembers it across restarts.
    ///
    /// A failure to persist the choice is logged; the selection still
    /// applies to the running service.
    pub async fn select_configuration(&self, name: &str) -> Result<()> {
        self.control.select_configuration(name).await?;
        if let Err(e) = self.config_manager.set_selected(name).await {
            warn!("Selected '{name}' but could not save it: {e:#}");
        }
        Ok(())
    }
}

fn ec_backend(config: &Config) -> EcBackend {
    match config.ec.backend {
        EcBackendKind::EcSys => EcBackend::EcSys(config.ec.path.clone()),
        EcBackendKind::Memory => {
            EcBackend::Memory(Arc::new(MemoryEc::with_registers(&config.ec.registers)))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{fan_config::tests::TWO_FANS, status::ControlState};
    use pretty_assertions::assert_eq;
    use std::{collections::BTreeMap, fs};
    use tempfile::TempDir;

    /// Service state over the memory backend with one fan configuration.
    pub(crate) async fn memory_state(dir: &TempDir) -> Arc<AppState> {
        let configs_dir = dir.path().join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::write(configs_dir.join("testbook.yml"), TWO_FANS).unwrap();
        fs::write(configs_dir.join("quiet.yml"), TWO_FANS).unwrap();

        let config = Config {
            configs_dir,
            selected_config: Some("testbook".into()),
            ec: crate::config::EcCfg {
                backend: EcBackendKind::Memory,
                registers: BTreeMap::from([(104, 45), (105, 45)]),
                ..Default::default()
            },
            ..Config::default()
        };
        let path = dir.path().join("config.yml");
        fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let manager = ConfigManager::load(Some(path)).await.unwrap();
        Arc::new(AppState::new(manager, EventBus::new()).await.unwrap())
    }

    #[tokio::test]
    async fn control_loop_is_handed_out_once() {
        let dir = TempDir::new().unwrap();
        let state = memory_state(&dir).await;

        assert!(state.take_control_loop().is_some());
        assert!(state.take_control_loop().is_none());
    }

    #[tokio::test]
    async fn selection_is_persisted() {
        let dir = TempDir::new().unwrap();
        let state = memory_state(&dir).await;
        let control_loop = state.take_control_loop().unwrap();
        let shutdown = tokio_util::sync::CancellationToken::new();
        let task = tokio::spawn(control_loop.run(shutdown.clone()));

        state.select_configuration("quiet").await.unwrap();
        assert_eq!(state.config().await.selected_config.as_deref(), Some("quiet"));
        let saved = ConfigManager::load(Some(dir.path().join("config.yml")))
            .await
            .unwrap();
        assert_eq!(saved.get().await.selected_config.as_deref(), Some("quiet"));

        assert!(state.select_configuration("../etc/passwd").await.is_err());
        assert_eq!(state.config().await.selected_config.as_deref(), Some("quiet"));
        assert_eq!(state.control.get_status().state, ControlState::Stopped);

        shutdown.cancel();
        task.await.unwrap();
    }
}
