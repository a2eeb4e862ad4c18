//! Linux `ec_sys` / `acpi_ec` register file backend.
//!
//! The kernel exposes the 256 EC registers as a seekable file; each register
//! is the byte at its own offset.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use anyhow::{Context, Result, anyhow};
use log::info;

use super::device_io::EmbeddedController;

pub const DEFAULT_EC_PATH: &str = "/sys/kernel/debug/ec/ec0/io";

#[derive(Debug)]
pub struct EcSysPort {
    path: PathBuf,
    file: Mutex<File>,
}

impl EcSysPort {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open EC register file {}", path.display()))?;

        info!("Opened EC register file {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| anyhow!("EC register file lock poisoned"))
    }
}

impl EmbeddedController for EcSysPort {
    fn read_byte(&self, register: u8) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.file()?
            .read_exact_at(&mut buf, u64::from(register))
            .with_context(|| format!("read from {}", self.path.display()))?;
        Ok(buf[0])
    }

    fn write_byte(&self, register: u8, value: u8) -> Result<()> {
        self.file()?
            .write_all_at(&[value], u64::from(register))
            .with_context(|| format!("write to {}", self.path.display()))
    }
}
