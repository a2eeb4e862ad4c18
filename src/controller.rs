//! Hardware sessions: the sensors and fan driver of one active configuration.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::info;
use tokio_util::sync::CancellationToken;

use crate::{
    drivers::{EcAccess, EcFanDriver, EcSysPort, EmbeddedController, MemoryEc},
    error::{FanControlError, Result},
    fan_config::FanConfiguration,
    fan_controller::FanController,
    sensors::TemperatureSensor,
    temperature_sensors,
};

/// Open hardware handles of one control session.
///
/// Dropping it closes the underlying register file.
pub struct Hardware {
    pub sensors: Vec<Box<dyn TemperatureSensor>>,
    pub driver: Box<dyn FanController>,
}

impl fmt::Debug for Hardware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hardware")
            .field("sensors", &self.sensors.len())
            .field("driver", &self.driver)
            .finish()
    }
}

/// Opens hardware for a configuration.
#[async_trait]
pub trait HardwareConnector: Send + Sync {
    /// `cancel` aborts every register access of the returned session.
    async fn connect(
        &self,
        config: Arc<FanConfiguration>,
        cancel: CancellationToken,
    ) -> Result<Hardware>;
}

#[derive(Debug, Clone)]
pub enum EcBackend {
    /// Kernel EC register file at the given path.
    EcSys(PathBuf),
    /// Shared in-memory register file.
    Memory(Arc<MemoryEc>),
}

#[derive(Debug, Clone)]
pub struct EcConnector {
    backend: EcBackend,
    io_timeout: Duration,
}

impl EcConnector {
    pub fn new(backend: EcBackend, io_timeout: Duration) -> Self {
        Self {
            backend,
            io_timeout,
        }
    }

    async fn open(&self) -> Result<Arc<dyn EmbeddedController>> {
        match &self.backend {
            EcBackend::EcSys(path) => {
                let path = path.clone();
                let port = tokio::task::spawn_blocking(move || EcSysPort::open(path))
                    .await
                    .map_err(|e| FanControlError::driver_io("open", e))?
                    .map_err(|e| FanControlError::driver_io("open", format!("{e:#}")))?;
                Ok(Arc::new(port))
            }
            EcBackend::Memory(ec) => Ok(ec.clone()),
        }
    }
}

#[async_trait]
impl HardwareConnector for EcConnector {
    async fn connect(
        &self,
        config: Arc<FanConfiguration>,
        cancel: CancellationToken,
    ) -> Result<Hardware> {
        let ec = EcAccess::new(self.open().await?, self.io_timeout, cancel);
        let sensors = temperature_sensors::build(&config.sensors, &ec, self.io_timeout);

        info!(
            "Hardware session opened for '{}' ({} sensors)",
            config.name,
            sensors.len()
        );
        Ok(Hardware {
            sensors,
            driver: Box::new(EcFanDriver::new(ec, config)),
        })
    }
}
