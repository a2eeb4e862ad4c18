use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::{future::Future, sync::Arc};
use tokio::sync::watch;
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tokio_util::sync::CancellationToken;
use zbus::Connection;

use crate::{
    app_context::AppState,
    interface::{FanControlInterface, OBJECT_PATH},
    providers::traits::ServiceProvider,
    status::{ServiceStatus, StatusRecord},
    task_manager::TaskManager,
};

/// Emits the D-Bus `StatusChanged` signal for every published snapshot.
///
/// - **Priority**: 3
/// - **Critical**: No
///
/// Clients that subscribe to the signal see every tick without polling
/// `GetStatus`.
pub struct StatusBroadcastServiceProvider {
    state: Arc<AppState>,
    connection: Connection,
}

impl StatusBroadcastServiceProvider {
    pub fn new(state: Arc<AppState>, connection: Connection) -> Self {
        Self { state, connection }
    }
}

#[async_trait]
impl ServiceProvider for StatusBroadcastServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let interface = self
            .connection
            .object_server()
            .interface::<_, FanControlInterface>(OBJECT_PATH)
            .await
            .context("D-Bus object is not served")?;
        let updates = self.state.control.subscribe();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                broadcast_status(updates, cancel_token, |record| {
                    let interface = interface.clone();
                    async move {
                        FanControlInterface::status_changed(interface.signal_emitter(), record)
                            .await
                    }
                })
                .await;
                Ok(())
            })
            .await
    }

    fn name(&self) -> &'static str {
        "StatusBroadcastService"
    }

    fn priority(&self) -> i32 {
        3
    }
}

/// Forwards every snapshot from `updates` to `emit` until cancelled or the
/// control loop goes away. Emission failures are logged and skipped.
async fn broadcast_status<F, Fut>(
    updates: watch::Receiver<Arc<ServiceStatus>>,
    cancel_token: CancellationToken,
    mut emit: F,
) where
    F: FnMut(StatusRecord) -> Fut,
    Fut: Future<Output = zbus::Result<()>>,
{
    let mut updates = WatchStream::from_changes(updates);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            status = updates.next() => {
                let Some(status) = status else {
                    debug!("Status channel closed");
                    break;
                };
                if let Err(e) = emit(StatusRecord::from(status.as_ref())).await {
                    warn!("Failed to emit StatusChanged: {e}");
                }
            }
        }
    }

    info!("Status broadcast stopped");
}
