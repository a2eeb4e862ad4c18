//! Client side of the D-Bus protocol.

use futures::{Stream, StreamExt};
use log::debug;
use zbus::{Connection, proxy};

use crate::{
    config::BusKind,
    error::{FanControlError, Result},
    fan_controller::FanSpeed,
    status::{ServiceStatus, StatusRecord},
};

#[proxy(
    interface = "io.github.nbfcd1",
    default_service = "io.github.nbfcd",
    default_path = "/io/github/nbfcd"
)]
pub trait FanControl {
    fn get_status(&self) -> zbus::Result<StatusRecord>;

    fn start(&self) -> zbus::Result<()>;

    fn stop(&self) -> zbus::Result<()>;

    fn select_configuration(&self, name: &str) -> zbus::Result<()>;

    fn set_fan_speed(&self, fan: u8, percent: f64) -> zbus::Result<()>;

    fn set_fan_auto(&self, fan: u8) -> zbus::Result<()>;

    fn list_configurations(&self) -> zbus::Result<Vec<String>>;

    #[zbus(signal)]
    fn status_changed(&self, status: StatusRecord) -> zbus::Result<()>;

    #[zbus(property)]
    fn version(&self) -> zbus::Result<String>;
}

/// Typed access to a running nbfcd.
///
/// Every failure to reach the service is reported as
/// [`FanControlError::ServiceUnavailable`].
#[derive(Debug, Clone)]
pub struct FanControlClient {
    proxy: FanControlProxy<'static>,
}

impl FanControlClient {
    pub async fn connect(bus: BusKind) -> Result<Self> {
        let connection = match bus {
            BusKind::System => Connection::system().await,
            BusKind::Session => Connection::session().await,
        }
        .map_err(|e| FanControlError::ServiceUnavailable(format!("{bus:?} bus: {e}")))?;

        let proxy = FanControlProxy::new(&connection).await?;
        Ok(Self { proxy })
    }

    pub async fn get_status(&self) -> Result<ServiceStatus> {
        ServiceStatus::try_from(self.proxy.get_status().await?)
    }

    /// Like [`get_status`](Self::get_status), but an unreachable service
    /// yields an "unavailable" snapshot instead of an error.
    pub async fn status_or_unavailable(&self) -> Result<ServiceStatus> {
        match self.get_status().await {
            Err(FanControlError::ServiceUnavailable(reason)) => {
                debug!("Service unavailable: {reason}");
                Ok(ServiceStatus::unavailable())
            }
            other => other,
        }
    }

    pub async fn start(&self) -> Result<()> {
        Ok(self.proxy.start().await?)
    }

    pub async fn stop(&self) -> Result<()> {
        Ok(self.proxy.stop().await?)
    }

    pub async fn select_configuration(&self, name: &str) -> Result<()> {
        Ok(self.proxy.select_configuration(name).await?)
    }

    pub async fn set_fan_speed(&self, fan: usize, speed: FanSpeed) -> Result<()> {
        let fan = u8::try_from(fan)
            .map_err(|_| FanControlError::invalid(format!("fan {fan} does not exist")))?;
        match speed {
            FanSpeed::Percent(p) => Ok(self.proxy.set_fan_speed(fan, f64::from(p)).await?),
            FanSpeed::Auto => Ok(self.proxy.set_fan_auto(fan).await?),
        }
    }

    pub async fn list_configurations(&self) -> Result<Vec<String>> {
        Ok(self.proxy.list_configurations().await?)
    }

    pub async fn version(&self) -> Result<String> {
        Ok(self.proxy.version().await?)
    }

    /// Snapshots pushed by the service on every change.
    ///
    /// Signals that fail to decode are skipped.
    pub async fn status_updates(&self) -> Result<impl Stream<Item = ServiceStatus> + use<>> {
        let signals = self.proxy.receive_status_changed().await?;
        Ok(signals.filter_map(|signal| async move {
            let args = signal.args().ok()?;
            ServiceStatus::try_from(args.status().clone()).ok()
        }))
    }
}
