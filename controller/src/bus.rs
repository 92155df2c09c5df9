//! Byte-level bus transport to the analyzer
//!
//! The analyzer sits alone on a single-master I2C bus; every interaction is
//! a write of 1 or 5 bytes, optionally followed by a read of 1 or 4 bytes.
//! This module defines the transport seam (`Bus`), the Linux hardware
//! backend, and an in-process simulated analyzer used in dev mode and by
//! the test suite.
//
// All callers go through one `SharedBus` mutex, held for the duration of a
// logical transaction (one write plus its immediate read). The worker and
// the HTTP handlers therefore never interleave inside a transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device;

/// Transport-level failure talking to the analyzer.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus I/O error: {0}")]
    Io(String),
}

/// Ordered byte transport to a single device address.
pub trait Bus: Send {
    /// Write `data` to the device at `addr`.
    fn write_bytes(&mut self, addr: u16, data: &[u8]) -> Result<(), BusError>;
    /// Fill `buf` from the device at `addr`.
    fn read_bytes(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), BusError>;
}

/// The shared bus handle. One mutex guards every transaction.
pub type SharedBus = Arc<tokio::sync::Mutex<Box<dyn Bus>>>;

/// Wrap a backend into the shared handle.
pub fn shared(bus: impl Bus + 'static) -> SharedBus {
    Arc::new(tokio::sync::Mutex::new(Box::new(bus)))
}

/// Hardware backend over a Linux I2C character device.
#[cfg(target_os = "linux")]
pub struct LinuxI2cBus {
    device: i2cdev::linux::LinuxI2CDevice,
    /// Slave address the device handle is currently bound to
    addr: u16,
}

#[cfg(target_os = "linux")]
impl LinuxI2cBus {
    /// Open the I2C character device at `path`, initially bound to `addr`.
    pub fn open(path: &str, addr: u16) -> Result<Self, BusError> {
        let device = i2cdev::linux::LinuxI2CDevice::new(path, addr)
            .map_err(|e| BusError::Io(format!("failed to open {}: {}", path, e)))?;
        Ok(Self { device, addr })
    }

    fn bind(&mut self, addr: u16) -> Result<(), BusError> {
        if addr != self.addr {
            self.device
                .set_slave_address(addr)
                .map_err(|e| BusError::Io(e.to_string()))?;
            self.addr = addr;
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Bus for LinuxI2cBus {
    fn write_bytes(&mut self, addr: u16, data: &[u8]) -> Result<(), BusError> {
        use i2cdev::core::I2CDevice;
        self.bind(addr)?;
        self.device
            .write(data)
            .map_err(|e| BusError::Io(e.to_string()))
    }

    fn read_bytes(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), BusError> {
        use i2cdev::core::I2CDevice;
        self.bind(addr)?;
        self.device
            .read(buf)
            .map_err(|e| BusError::Io(e.to_string()))
    }
}

/// In-process analyzer model.
///
/// Used as the bus backend in simulate mode and throughout the tests. A
/// start opcode makes the status busy for a configurable number of polls;
/// result and factor reads return scripted values; 5-byte calibration
/// writes store their payload as the new factor for the matching read
/// opcode. The handle is cloneable so tests can keep scripting the device
/// after it has been installed behind the shared bus mutex.
#[derive(Clone)]
pub struct SimulatedAnalyzer {
    state: Arc<Mutex<SimState>>,
}

struct SimState {
    /// Busy polls each started action takes before going idle
    busy_polls: u32,
    busy_remaining: u32,
    /// Measurement returned by a result read
    result: f32,
    /// Stored calibration factors, keyed by their read opcode
    factors: HashMap<u8, f32>,
    /// When set, status polls report the error state
    faulted: bool,
    /// When set, every bus access fails
    io_broken: bool,
    /// Opcode of the most recent write, dispatching the next read
    last_opcode: u8,
    /// Journal of every write, for test assertions
    writes: Vec<Vec<u8>>,
}

impl Default for SimulatedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAnalyzer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                busy_polls: 2,
                busy_remaining: 0,
                result: 0.0,
                factors: HashMap::new(),
                faulted: false,
                io_broken: false,
                last_opcode: 0,
                writes: Vec::new(),
            })),
        }
    }

    // Poisoning only happens if a holder panicked; the test is lost anyway.
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("analyzer state lock poisoned")
    }

    /// Value the next result read returns.
    pub fn set_result(&self, value: f32) {
        self.state().result = value;
    }

    /// How many busy polls each started action takes.
    pub fn set_busy_polls(&self, polls: u32) {
        self.state().busy_polls = polls;
    }

    /// Make status polls report the device error state.
    pub fn set_faulted(&self, faulted: bool) {
        self.state().faulted = faulted;
    }

    /// Make every bus access fail with an I/O error.
    pub fn set_io_broken(&self, broken: bool) {
        self.state().io_broken = broken;
    }

    /// Stored factor for a factor-read opcode.
    pub fn factor(&self, read_opcode: u8) -> Option<f32> {
        self.state().factors.get(&read_opcode).copied()
    }

    /// Every write observed so far.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    /// Map a calibration start opcode to the factor-read opcode it feeds.
    fn factor_read_opcode(start: u8) -> Option<u8> {
        match start {
            // pump calibration value -> pump factor
            0x21 => Some(0x35),
            // parameter calibration value -> matching parameter factor
            0x22..=0x26 => Some(start + 0x14),
            _ => None,
        }
    }

    fn is_start_opcode(op: u8) -> bool {
        matches!(op, 0x11..=0x15 | 0x21..=0x26 | 0x27..=0x2B)
    }
}

impl Bus for SimulatedAnalyzer {
    fn write_bytes(&mut self, _addr: u16, data: &[u8]) -> Result<(), BusError> {
        let mut state = self.state();
        if state.io_broken {
            return Err(BusError::Io("simulated bus failure".to_string()));
        }
        if data.is_empty() {
            return Err(BusError::Io("empty write".to_string()));
        }

        state.writes.push(data.to_vec());
        let op = data[0];
        state.last_opcode = op;

        if Self::is_start_opcode(op) {
            state.busy_remaining = state.busy_polls;
        }
        if data.len() == 5 {
            if let (Some(read_op), Ok(bytes)) =
                (Self::factor_read_opcode(op), <[u8; 4]>::try_from(&data[1..5]))
            {
                state.factors.insert(read_op, f32::from_le_bytes(bytes));
            }
        }
        Ok(())
    }

    fn read_bytes(&mut self, _addr: u16, buf: &mut [u8]) -> Result<(), BusError> {
        let mut state = self.state();
        if state.io_broken {
            return Err(BusError::Io("simulated bus failure".to_string()));
        }

        match state.last_opcode {
            device::OPCODE_READ_STATUS if buf.len() == 1 => {
                buf[0] = if state.faulted {
                    device::STATUS_ERROR
                } else if state.busy_remaining > 0 {
                    state.busy_remaining -= 1;
                    device::STATUS_BUSY
                } else {
                    device::STATUS_IDLE
                };
                Ok(())
            }
            device::OPCODE_READ_RESULT if buf.len() == 4 => {
                buf.copy_from_slice(&state.result.to_le_bytes());
                Ok(())
            }
            op @ 0x35..=0x3A if buf.len() == 4 => {
                let factor = state.factors.get(&op).copied().unwrap_or(1.0);
                buf.copy_from_slice(&factor.to_le_bytes());
                Ok(())
            }
            op => Err(BusError::Io(format!(
                "read of {} bytes not valid after opcode {:#04x}",
                buf.len(),
                op
            ))),
        }
    }
}
