//! D-Bus object served by the daemon.

use std::sync::Arc;

use zbus::{fdo, interface, object_server::SignalEmitter};

use crate::{
    app_context::AppState, error::FanControlError, fan_controller::FanSpeed,
    status::StatusRecord,
};

pub const SERVICE_NAME: &str = "io.github.nbfcd";
pub const OBJECT_PATH: &str = "/io/github/nbfcd";

pub struct FanControlInterface {
    state: Arc<AppState>,
    version: String,
}

impl FanControlInterface {
    pub fn new(state: Arc<AppState>, version: String) -> Self {
        Self { state, version }
    }
}

#[interface(name = "io.github.nbfcd1")]
impl FanControlInterface {
    /// Latest snapshot; never waits for the control loop.
    async fn get_status(&self) -> StatusRecord {
        StatusRecord::from(self.state.control.get_status().as_ref())
    }

    async fn start(&self) -> fdo::Result<()> {
        Ok(self.state.control.start().await?)
    }

    async fn stop(&self) -> fdo::Result<()> {
        Ok(self.state.control.stop().await?)
    }

    async fn select_configuration(&self, name: String) -> fdo::Result<()> {
        Ok(self.state.select_configuration(&name).await?)
    }

    async fn set_fan_speed(&self, fan: u8, percent: f64) -> fdo::Result<()> {
        let speed = FanSpeed::percent(percent as f32)?;
        Ok(self.state.control.set_fan_speed(fan.into(), speed).await?)
    }

    async fn set_fan_auto(&self, fan: u8) -> fdo::Result<()> {
        Ok(self
            .state
            .control
            .set_fan_speed(fan.into(), FanSpeed::Auto)
            .await?)
    }

    async fn list_configurations(&self) -> fdo::Result<Vec<String>> {
        self.state
            .control
            .list_configurations()
            .await
            .map_err(FanControlError::into)
    }

    #[zbus(signal)]
    pub async fn status_changed(
        emitter: &SignalEmitter<'_>,
        status: StatusRecord,
    ) -> zbus::Result<()>;

    #[zbus(property)]
    async fn version(&self) -> String {
        self.version.clone()
    }
}
