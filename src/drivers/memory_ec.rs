//! In-memory register file used for dry runs and tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{Result, bail};

use super::device_io::EmbeddedController;

#[derive(Debug)]
struct Registers {
    values: [u8; 256],
    failing_reads: HashSet<u8>,
    failing_writes: HashSet<u8>,
    latency: Duration,
    write_stalls: HashMap<u8, Duration>,
    writes: Vec<(u8, u8)>,
}

/// 256-byte register file with fault injection.
#[derive(Debug)]
pub struct MemoryEc(Mutex<Registers>);

impl Default for MemoryEc {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEc {
    pub fn new() -> Self {
        Self(Mutex::new(Registers {
            values: [0; 256],
            failing_reads: HashSet::new(),
            failing_writes: HashSet::new(),
            latency: Duration::ZERO,
            write_stalls: HashMap::new(),
            writes: Vec::new(),
        }))
    }

    pub fn with_registers(preset: &BTreeMap<u8, u8>) -> Self {
        let ec = Self::new();
        for (&register, &value) in preset {
            ec.set(register, value);
        }
        ec
    }

    /// Sets a register without recording it as a write.
    pub fn set(&self, register: u8, value: u8) {
        self.lock().values[register as usize] = value;
    }

    pub fn get(&self, register: u8) -> u8 {
        self.lock().values[register as usize]
    }

    pub fn fail_reads(&self, register: u8, failing: bool) {
        toggle(&mut self.lock().failing_reads, register, failing);
    }

    pub fn fail_writes(&self, register: u8, failing: bool) {
        toggle(&mut self.lock().failing_writes, register, failing);
    }

    /// Delay applied to every access, to emulate a stalled controller.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Makes only the next write to `register` hang for `latency`.
    pub fn stall_next_write(&self, register: u8, latency: Duration) {
        self.lock().write_stalls.insert(register, latency);
    }

    /// Every successful write so far, in order.
    pub fn writes(&self) -> Vec<(u8, u8)> {
        self.lock().writes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Registers> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stall(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }
}

fn toggle(set: &mut HashSet<u8>, register: u8, on: bool) {
    if on {
        set.insert(register);
    } else {
        set.remove(&register);
    }
}

impl EmbeddedController for MemoryEc {
    fn read_byte(&self, register: u8) -> Result<u8> {
        self.stall();
        let regs = self.lock();
        if regs.failing_reads.contains(&register) {
            bail!("injected read fault");
        }
        Ok(regs.values[register as usize])
    }

    fn write_byte(&self, register: u8, value: u8) -> Result<()> {
        self.stall();
        let stall = self.lock().write_stalls.remove(&register);
        if let Some(latency) = stall {
            std::thread::sleep(latency);
        }
        let mut regs = self.lock();
        if regs.failing_writes.contains(&register) {
            bail!("injected write fault");
        }
        regs.values[register as usize] = value;
        regs.writes.push((register, value));
        Ok(())
    }
}
