//! Application state provider for dependency injection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    app_context::AppState, config::ConfigManager, event::EventBus,
    providers::traits::AsyncProvider,
};

/// Builds [`AppState`] from the service configuration.
pub struct AppStateProvider {
    config_manager: ConfigManager,
    event_bus: EventBus,
}

impl AppStateProvider {
    pub const fn new(config_manager: ConfigManager, event_bus: EventBus) -> Self {
        Self {
            config_manager,
            event_bus,
        }
    }
}

#[async_trait]
impl AsyncProvider<Arc<AppState>> for AppStateProvider {
    async fn provide(&self) -> Result<Arc<AppState>> {
        let state = AppState::new(self.config_manager.clone(), self.event_bus.clone())
            .await
            .context("Failed to build application state")?;
        Ok(Arc::new(state))
    }
}
