//! Service lifecycle: startup in priority order, event handling, shutdown.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    app_context::AppState,
    config::{BusKind, ConfigManager},
    event::{Event, EventBus},
    providers::{
        AppStateProvider, AsyncProvider, ConfigWatcherServiceProvider, ControlServiceProvider,
        DBusServiceProvider, ServiceProvider, StatusBroadcastServiceProvider,
    },
    task_manager::TaskManager,
};

/// Owns the services of the daemon and reacts to application events.
pub struct SystemCoordinator {
    task_manager: TaskManager,
    event_bus: EventBus,
    shared_state: Option<Arc<AppState>>,
    service_providers: Vec<Box<dyn ServiceProvider>>,
}

impl Default for SystemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCoordinator {
    pub fn new() -> Self {
        Self {
            task_manager: TaskManager::new(),
            event_bus: EventBus::new(),
            shared_state: None,
            service_providers: Vec::new(),
        }
    }

    /// Builds the shared state and registers all services.
    ///
    /// With `bus` set to `None` the D-Bus services are skipped entirely.
    pub async fn initialize(
        &mut self,
        config_manager: ConfigManager,
        bus: Option<BusKind>,
    ) -> Result<()> {
        info!("Initializing SystemCoordinator...");

        let state = AppStateProvider::new(config_manager, self.event_bus.clone())
            .provide()
            .await
            .context("Failed to initialize application state")?;
        self.shared_state = Some(state.clone());

        let mut providers: Vec<Box<dyn ServiceProvider>> = vec![
            Box::new(ControlServiceProvider::new(state.clone())),
            Box::new(ConfigWatcherServiceProvider::new(
                state.clone(),
                self.event_bus.clone(),
            )),
        ];

        if let Some(bus) = bus {
            match DBusServiceProvider::new(state.clone(), bus).await {
                Ok(dbus) => {
                    providers.push(Box::new(StatusBroadcastServiceProvider::new(
                        state.clone(),
                        dbus.connection().clone(),
                    )));
                    providers.push(Box::new(dbus));
                }
                Err(e) => warn!("D-Bus unavailable, skipping D-Bus services: {e:#}"),
            }
        }

        providers.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        self.service_providers = providers;

        info!(
            "Registered {} service providers in priority order",
            self.service_providers.len()
        );
        Ok(())
    }

    /// Starts all registered services in priority order.
    ///
    /// Critical services must start successfully, while non-critical services
    /// can fail without stopping the system.
    pub async fn start_all_services(&mut self) -> Result<()> {
        for provider in &self.service_providers {
            match provider.start(&mut self.task_manager).await {
                Ok(()) => info!(
                    "Service '{}' started (priority: {}, critical: {})",
                    provider.name(),
                    provider.priority(),
                    provider.is_critical()
                ),
                Err(e) if provider.is_critical() => {
                    return Err(e).with_context(|| {
                        format!("Critical service '{}' failed to start", provider.name())
                    });
                }
                Err(e) => warn!(
                    "Non-critical service '{}' failed to start: {e:#}",
                    provider.name()
                ),
            }
        }
        Ok(())
    }

    /// Runs until Ctrl-C, SIGTERM or a [`Event::SystemShutdown`].
    pub async fn run_main_loop(&mut self) -> Result<()> {
        let mut event_rx = self.event_bus.subscribe();
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        info!("Starting main event loop");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl+C")?;
                    info!("Received Ctrl+C, shutting down");
                    break;
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }
                event = event_rx.recv() => {
                    if !self.handle_event(event).await? {
                        break;
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// Returns false when the daemon should stop.
    async fn handle_event(&mut self, event: Result<Event, RecvError>) -> Result<bool> {
        match event {
            Ok(Event::ConfigChangeDetected { name }) => self.reload_configuration(&name).await,
            Ok(Event::ControlStateChanged { from, to }) => {
                info!("Fan control changed from {from} to {to}");
            }
            Ok(Event::FaultFallback { fan, automatic }) => {
                let handed = if automatic { "firmware" } else { "last safe speed" };
                warn!("Fan {fan} left curve control ({handed}); restart fan control to recover");
            }
            Ok(Event::SystemShutdown) => {
                info!("Shutdown requested");
                return Ok(false);
            }
            Err(RecvError::Lagged(n)) => warn!("Event bus lagged by {n} messages"),
            Err(RecvError::Closed) => return Err(anyhow!("Event bus channel closed unexpectedly")),
        }
        Ok(true)
    }

    /// Re-selects the active configuration after an edit on disk.
    ///
    /// An invalid edit is logged and the running configuration stays.
    async fn reload_configuration(&self, name: &str) {
        let Some(state) = &self.shared_state else {
            return;
        };

        match state.control.select_configuration(name).await {
            Ok(()) => info!("Reloaded fan configuration '{name}'"),
            Err(e) => error!("Keeping current configuration, '{name}' is invalid: {e}"),
        }
    }

    /// Hands the fans back to the firmware, then stops every task.
    async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown...");

        if let Some(state) = &self.shared_state {
            if let Err(e) = state.control.stop().await {
                error!("Failed to stop fan control: {e}");
            }
        }
        if let Err(e) = self.task_manager.shutdown_all().await {
            error!("Error during task shutdown: {e:#}");
        }

        info!("Shutdown complete");
        Ok(())
    }

    pub const fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn shared_state(&self) -> Option<&Arc<AppState>> {
        self.shared_state.as_ref()
    }

    pub fn running_services(&self) -> Vec<&'static str> {
        self.service_providers.iter().map(|p| p.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{app_context::tests::memory_state, status::ControlState};
    use pretty_assertions::assert_eq;
    use std::{fs, time::Duration};
    use tempfile::TempDir;

    async fn coordinator(dir: &TempDir) -> SystemCoordinator {
        let state = memory_state(dir).await;
        let manager = ConfigManager::load(Some(dir.path().join("config.yml")))
            .await
            .unwrap();
        drop(state);

        let mut coordinator = SystemCoordinator::new();
        coordinator.initialize(manager, None).await.unwrap();
        coordinator
    }

    #[tokio::test]
    async fn registers_core_services_by_priority() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir).await;

        assert_eq!(
            coordinator.running_services(),
            vec!["ControlService", "ConfigWatcherService"]
        );
    }

    #[tokio::test]
    async fn shutdown_event_releases_hardware() {
        let dir = TempDir::new().unwrap();
        let mut coordinator = coordinator(&dir).await;
        coordinator.start_all_services().await.unwrap();

        let state = coordinator.shared_state().unwrap().clone();
        state.control.start().await.unwrap();
        let mut status = state.control.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.state == ControlState::Running),
        )
        .await
        .unwrap()
        .unwrap();

        let bus = coordinator.event_bus().clone();
        let main = tokio::spawn(async move { coordinator.run_main_loop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish(Event::SystemShutdown).unwrap();

        tokio::time::timeout(Duration::from_secs(5), main)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let last = state.control.get_status();
        assert_eq!(last.state, ControlState::Stopped);
        assert!(!last.service_available);
    }

    #[tokio::test]
    async fn invalid_edit_keeps_running_configuration() {
        let dir = TempDir::new().unwrap();
        let mut coordinator = coordinator(&dir).await;
        coordinator.start_all_services().await.unwrap();
        let state = coordinator.shared_state().unwrap().clone();
        state.control.start().await.unwrap();

        fs::write(dir.path().join("configs/testbook.yml"), "fans: [").unwrap();
        coordinator.reload_configuration("testbook").await;
        assert!(state.control.get_status().state.is_active());

        coordinator.shutdown().await.unwrap();
    }
}
