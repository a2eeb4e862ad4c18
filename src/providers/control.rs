//! Runs the fan control loop as a service.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;

use crate::{app_context::AppState, providers::traits::ServiceProvider, task_manager::TaskManager};

/// Owns the control loop task.
///
/// - **Priority**: 10, started before every client-facing service
/// - **Critical**: Yes
///
/// With `autostart` set, fan control starts as soon as the loop runs. A
/// failed autostart is logged and leaves the service stopped.
pub struct ControlServiceProvider {
    state: Arc<AppState>,
}

impl ControlServiceProvider {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ServiceProvider for ControlServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let control_loop = self
            .state
            .take_control_loop()
            .ok_or_else(|| anyhow!("Control loop is already running"))?;
        let autostart = self.state.config().await.autostart;
        let control = self.state.control.clone();

        task_manager
            .spawn_task(self.name().to_string(), move |cancel_token| async move {
                let autostart = async {
                    if !autostart {
                        return;
                    }
                    info!("Autostarting fan control");
                    if let Err(e) = control.start().await {
                        warn!("Autostart failed: {e}");
                    }
                };
                tokio::join!(control_loop.run(cancel_token), autostart);
                Ok(())
            })
            .await
    }

    fn name(&self) -> &'static str {
        "ControlService"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_critical(&self) -> bool {
        true
    }
}
