//! Application entry point and builder.

use crate::{
    config::{BusKind, ConfigManager},
    coordinator::SystemCoordinator,
};
use anyhow::Result;

/// The daemon: configuration plus the coordinator that runs its services.
///
/// # Example
///
/// ```no_run
/// use nbfcd::{application::Application, config::ConfigManager};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// Application::builder()
///     .with_config_manager(config_manager)
///     .build()?
///     .run()
///     .await
/// # }
/// ```
pub struct Application {
    coordinator: SystemCoordinator,
    config_manager: ConfigManager,
    with_bus: bool,
    bus_override: Option<BusKind>,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// Initializes, starts all services and runs until shutdown.
    pub async fn run(mut self) -> Result<()> {
        let bus = self.bus().await;
        self.coordinator
            .initialize(self.config_manager.clone(), bus)
            .await?;
        self.coordinator.start_all_services().await?;
        self.coordinator.run_main_loop().await
    }

    async fn bus(&self) -> Option<BusKind> {
        if !self.with_bus {
            return None;
        }
        match self.bus_override {
            Some(bus) => Some(bus),
            None => Some(self.config_manager.get().await.bus),
        }
    }
}

pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
    with_bus: bool,
    bus_override: Option<BusKind>,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self {
            config_manager: None,
            with_bus: true,
            bus_override: None,
        }
    }

    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    /// Serves on `bus` regardless of the configured one. Not persisted.
    pub fn with_bus_kind(mut self, bus: BusKind) -> Self {
        self.bus_override = Some(bus);
        self
    }

    /// Runs without the D-Bus services.
    pub fn without_bus(mut self) -> Self {
        self.with_bus = false;
        self
    }

    pub fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow::anyhow!("Configuration manager is required"))?;

        Ok(Application {
            coordinator: SystemCoordinator::new(),
            config_manager,
            with_bus: self.with_bus,
            bus_override: self.bus_override,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::path::PathBuf;

    fn manager() -> ConfigManager {
        ConfigManager::new(Config::default(), PathBuf::from("/nonexistent/config.yml"))
    }

    #[test]
    fn config_manager_is_required() {
        assert!(Application::builder().build().is_err());
    }

    #[tokio::test]
    async fn bus_follows_configuration_unless_overridden() {
        let app = Application::builder()
            .with_config_manager(manager())
            .build()
            .unwrap();
        assert_eq!(app.bus().await, Some(BusKind::System));

        let app = Application::builder()
            .with_config_manager(manager())
            .with_bus_kind(BusKind::Session)
            .build()
            .unwrap();
        assert_eq!(app.bus().await, Some(BusKind::Session));

        let app = Application::builder()
            .with_config_manager(manager())
            .with_bus_kind(BusKind::Session)
            .without_bus()
            .build()
            .unwrap();
        assert_eq!(app.bus().await, None);
    }
}
