//! Error taxonomy shared by the control core and the client boundary.

use thiserror::Error;

/// Result alias used by the control core.
pub type Result<T> = std::result::Result<T, FanControlError>;

/// Errors surfaced by sensors, drivers, configuration loading and clients.
///
/// Tick-level `SensorUnavailable` / `DriverIo` failures are recovered inside
/// the control loop; the remaining variants are returned to callers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FanControlError {
    #[error("sensor {sensor} unavailable: {reason}")]
    SensorUnavailable { sensor: usize, reason: String },

    #[error("driver I/O error during {operation}: {reason}")]
    DriverIo {
        operation: &'static str,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("fan control service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("service error: {0}")]
    Remote(String),
}

impl FanControlError {
    pub fn sensor(sensor: usize, reason: impl std::fmt::Display) -> Self {
        Self::SensorUnavailable {
            sensor,
            reason: reason.to_string(),
        }
    }

    pub fn driver_io(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::DriverIo {
            operation,
            reason: reason.to_string(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration(reason.into())
    }
}

impl From<FanControlError> for zbus::fdo::Error {
    fn from(err: FanControlError) -> Self {
        match err {
            FanControlError::InvalidConfiguration(msg) => zbus::fdo::Error::InvalidArgs(msg),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}

impl From<zbus::fdo::Error> for FanControlError {
    fn from(err: zbus::fdo::Error) -> Self {
        use zbus::fdo::Error as Fdo;
        match err {
            Fdo::InvalidArgs(msg) => Self::InvalidConfiguration(msg),
            Fdo::ServiceUnknown(msg)
            | Fdo::NameHasNoOwner(msg)
            | Fdo::NoReply(msg)
            | Fdo::NoServer(msg)
            | Fdo::Disconnected(msg)
            | Fdo::Timeout(msg) => Self::ServiceUnavailable(msg),
            Fdo::ZBus(inner) => Self::from(inner),
            other => Self::Remote(other.to_string()),
        }
    }
}

impl From<zbus::Error> for FanControlError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(..) | zbus::Error::FDO(_) => {
                Self::from(zbus::fdo::Error::from(err))
            }
            other => Self::ServiceUnavailable(other.to_string()),
        }
    }
}
