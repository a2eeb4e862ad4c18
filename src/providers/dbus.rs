//! D-Bus service provider.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use zbus::{Connection, connection};

use crate::{
    app_context::AppState,
    config::BusKind,
    interface::{FanControlInterface, OBJECT_PATH, SERVICE_NAME},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// Serves [`FanControlInterface`] on the system or session bus.
///
/// - **Priority**: 8
/// - **Critical**: Yes, once the bus is reachable. The coordinator skips
///   the provider when [`new`](Self::new) fails.
///
/// The object and the well-known name `io.github.nbfcd` are registered in
/// `new`, so the connection handed to other services already serves it.
pub struct DBusServiceProvider {
    connection: Connection,
}

impl DBusServiceProvider {
    pub async fn new(state: Arc<AppState>, bus: BusKind) -> Result<Self> {
        let builder = match bus {
            BusKind::System => connection::Builder::system(),
            BusKind::Session => connection::Builder::session(),
        }
        .with_context(|| format!("Failed to reach the {bus:?} bus"))?;

        let interface = FanControlInterface::new(state, env!("CARGO_PKG_VERSION").to_string());
        let connection = builder
            .name(SERVICE_NAME)?
            .serve_at(OBJECT_PATH, interface)?
            .build()
            .await
            .with_context(|| format!("Failed to register {SERVICE_NAME}"))?;

        info!("Serving {SERVICE_NAME} at {OBJECT_PATH} on the {bus:?} bus");
        Ok(Self { connection })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[async_trait]
impl ServiceProvider for DBusServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let connection = self.connection.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                serve_until_cancelled(connection, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "DBusService"
    }

    fn priority(&self) -> i32 {
        8
    }

    fn is_critical(&self) -> bool {
        true
    }
}

async fn serve_until_cancelled(connection: Connection, cancel_token: CancellationToken) -> Result<()> {
    cancel_token.cancelled().await;

    connection
        .object_server()
        .remove::<FanControlInterface, _>(OBJECT_PATH)
        .await
        .context("Failed to unregister the D-Bus object")?;
    connection.release_name(SERVICE_NAME).await?;
    info!("D-Bus service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app_context::tests::memory_state, client::FanControlClient, fan_controller::FanSpeed,
        providers::ControlServiceProvider, status::ControlState,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    // Needs a session bus; skipped where none is available.
    #[tokio::test]
    async fn client_drives_service_over_session_bus() {
        let dir = TempDir::new().unwrap();
        let state = memory_state(&dir).await;
        let Ok(provider) = DBusServiceProvider::new(state.clone(), BusKind::Session).await else {
            eprintln!("no session bus, skipping");
            return;
        };
        assert_eq!(provider.name(), "DBusService");
        assert!(provider.is_critical());

        let mut tasks = TaskManager::new();
        ControlServiceProvider::new(state.clone())
            .start(&mut tasks)
            .await
            .unwrap();
        provider.start(&mut tasks).await.unwrap();

        let client = FanControlClient::connect(BusKind::Session).await.unwrap();
        assert_eq!(
            client.list_configurations().await.unwrap(),
            vec!["quiet", "testbook"]
        );
        client.start().await.unwrap();

        let mut status = state.control.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.state == ControlState::Running),
        )
        .await
        .unwrap()
        .unwrap();

        client.set_fan_speed(0, FanSpeed::Percent(50.0)).await.unwrap();
        let remote = client.get_status().await.unwrap();
        assert_eq!(remote.state, ControlState::Running);
        assert_eq!(remote.fans[0].applied, Some(50.0));

        assert!(client.set_fan_speed(7, FanSpeed::Auto).await.is_err());
        client.stop().await.unwrap();

        tasks.shutdown_all().await.unwrap();
    }
}
