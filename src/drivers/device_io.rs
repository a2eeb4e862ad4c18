//! Register access seam between the control core and EC backends.

use std::{sync::Arc, time::Duration};

use anyhow::Result as IoResult;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{FanControlError, Result};

/// Synchronous byte access to an embedded controller.
///
/// Implementations may block; callers go through [`EcAccess`], which moves
/// every call onto a blocking thread and bounds it with a timeout.
#[cfg_attr(test, mockall::automock)]
pub trait EmbeddedController: Send + Sync + 'static {
    fn read_byte(&self, register: u8) -> IoResult<u8>;

    fn write_byte(&self, register: u8, value: u8) -> IoResult<()>;

    /// Little-endian word: low byte at `register`, high byte at `register + 1`.
    fn read_word(&self, register: u8) -> IoResult<u16> {
        let low = self.read_byte(register)?;
        let high = self.read_byte(register.wrapping_add(1))?;
        Ok(u16::from_le_bytes([low, high]))
    }

    fn write_word(&self, register: u8, value: u16) -> IoResult<()> {
        let [low, high] = value.to_le_bytes();
        self.write_byte(register, low)?;
        self.write_byte(register.wrapping_add(1), high)
    }
}

/// Bounded, cancellable access to an [`EmbeddedController`].
///
/// Every call runs on `spawn_blocking`, is limited by the configured I/O
/// timeout and aborts as soon as the session token is cancelled. All
/// failures come back as [`FanControlError::DriverIo`].
///
/// Accesses are serialized in call order, detached ones included. A call
/// that was abandoned by timeout or cancellation keeps the controller until
/// its blocking work has finished, so later writes always land after it.
#[derive(Clone)]
pub struct EcAccess {
    ec: Arc<dyn EmbeddedController>,
    timeout: Duration,
    cancel: CancellationToken,
    serial: Arc<Mutex<()>>,
}

impl std::fmt::Debug for EcAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcAccess")
            .field("timeout", &self.timeout)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl EcAccess {
    pub fn new(
        ec: Arc<dyn EmbeddedController>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ec,
            timeout,
            cancel,
            serial: Arc::new(Mutex::new(())),
        }
    }

    /// Same controller and timeout, detached from session cancellation.
    ///
    /// Used to hand registers back after the session was cancelled.
    pub fn detached(&self) -> Self {
        Self {
            ec: Arc::clone(&self.ec),
            timeout: self.timeout,
            cancel: CancellationToken::new(),
            serial: Arc::clone(&self.serial),
        }
    }

    pub async fn read_byte(&self, register: u8) -> Result<u8> {
        self.call("read", register, move |ec| ec.read_byte(register))
            .await
    }

    pub async fn write_byte(&self, register: u8, value: u8) -> Result<()> {
        self.call("write", register, move |ec| ec.write_byte(register, value))
            .await
    }

    pub async fn read_word(&self, register: u8) -> Result<u16> {
        self.call("read word", register, move |ec| ec.read_word(register))
            .await
    }

    pub async fn write_word(&self, register: u8, value: u16) -> Result<()> {
        self.call("write word", register, move |ec| {
            ec.write_word(register, value)
        })
        .await
    }

    async fn call<T, F>(&self, operation: &'static str, register: u8, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn EmbeddedController) -> IoResult<T> + Send + 'static,
    {
        let fail = |reason: String| {
            FanControlError::driver_io(operation, format!("register {register:#04x}: {reason}"))
        };

        if self.cancel.is_cancelled() {
            return Err(fail("session cancelled".into()));
        }

        let ec = Arc::clone(&self.ec);
        let serial = Arc::clone(&self.serial);
        let task = async move {
            let guard = serial.lock_owned().await;
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                f(ec.as_ref())
            })
            .await
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(fail("session cancelled".into())),
            res = tokio::time::timeout(self.timeout, task) => match res {
                Err(_) => Err(fail(format!("timed out after {} ms", self.timeout.as_millis()))),
                Ok(Err(join)) => Err(fail(join.to_string())),
                Ok(Ok(Err(e))) => Err(fail(e.to_string())),
                Ok(Ok(Ok(value))) => Ok(value),
            },
        }
    }
}
