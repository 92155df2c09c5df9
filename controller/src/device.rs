//! Device protocol for the analyzer
//!
//! Wire format: single-byte opcodes, little-endian payloads, float values
//! IEEE-754 binary32. Every transaction is a bus write of 1 or 5 bytes,
//! optionally followed by a bus read of 1 or 4 bytes. The status byte
//! returned by a status read is 0 (idle), 1 (busy), or 2 (error).

use std::time::Duration;
use tokio::time::Instant;

use crate::bus::{BusError, SharedBus};

/// Opcode to read the status byte.
pub const OPCODE_READ_STATUS: u8 = 0x31;
/// Opcode to read the most recent measurement (float32).
pub const OPCODE_READ_RESULT: u8 = 0x32;

/// Device is idle; the last action completed successfully.
pub const STATUS_IDLE: u8 = 0;
/// Device is still working on the current action.
pub const STATUS_BUSY: u8 = 1;
/// Device failed the current action.
pub const STATUS_ERROR: u8 = 2;

/// Failure of a device transaction or of a running action.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("analyzer reported an error state")]
    Fault,

    #[error("unexpected status byte {0:#04x}")]
    UnexpectedStatus(u8),

    #[error("timed out waiting for the analyzer to become idle")]
    Timeout,
}

/// Typed transactions against the analyzer.
///
/// Each method acquires the shared bus mutex for one logical transaction
/// (the write plus its immediate read) and releases it before any sleep,
/// so concurrent status polls from the HTTP surface interleave between
/// transactions, never inside one.
#[derive(Clone)]
pub struct Device {
    bus: SharedBus,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl Device {
    pub fn new(bus: SharedBus, poll_interval: Duration, poll_timeout: Duration) -> Self {
        Self {
            bus,
            poll_interval,
            poll_timeout,
        }
    }

    /// Write a start opcode (one byte).
    pub async fn start(&self, addr: u16, opcode: u8) -> Result<(), DeviceError> {
        let mut bus = self.bus.lock().await;
        bus.write_bytes(addr, &[opcode])?;
        Ok(())
    }

    /// Read the raw status byte.
    pub async fn read_status(&self, addr: u16) -> Result<u8, DeviceError> {
        let mut bus = self.bus.lock().await;
        bus.write_bytes(addr, &[OPCODE_READ_STATUS])?;
        let mut buf = [0u8; 1];
        bus.read_bytes(addr, &mut buf)?;
        Ok(buf[0])
    }

    /// Read the measurement produced by the last completed test.
    pub async fn read_result(&self, addr: u16) -> Result<f32, DeviceError> {
        self.read_float(addr, OPCODE_READ_RESULT).await
    }

    /// Read a calibration factor back via its read opcode.
    pub async fn read_factor(&self, addr: u16, opcode: u8) -> Result<f32, DeviceError> {
        self.read_float(addr, opcode).await
    }

    async fn read_float(&self, addr: u16, opcode: u8) -> Result<f32, DeviceError> {
        let mut bus = self.bus.lock().await;
        bus.write_bytes(addr, &[opcode])?;
        let mut buf = [0u8; 4];
        bus.read_bytes(addr, &mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    /// Write an opcode followed by a float32 value (5 bytes, one write).
    pub async fn write_value(&self, addr: u16, opcode: u8, value: f32) -> Result<(), DeviceError> {
        let mut payload = [0u8; 5];
        payload[0] = opcode;
        payload[1..5].copy_from_slice(&value.to_le_bytes());

        let mut bus = self.bus.lock().await;
        bus.write_bytes(addr, &payload)?;
        Ok(())
    }

    /// Poll the status byte until the device goes idle.
    ///
    /// Busy polls sleep `poll_interval` between transactions. An error
    /// status terminates with [`DeviceError::Fault`]; exceeding
    /// `poll_timeout` terminates with [`DeviceError::Timeout`].
    pub async fn wait_idle(&self, addr: u16) -> Result<(), DeviceError> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            match self.read_status(addr).await? {
                STATUS_IDLE => return Ok(()),
                STATUS_BUSY => {
                    if Instant::now() >= deadline {
                        return Err(DeviceError::Timeout);
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                STATUS_ERROR => return Err(DeviceError::Fault),
                other => return Err(DeviceError::UnexpectedStatus(other)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{self, SimulatedAnalyzer};

    fn test_device(sim: &SimulatedAnalyzer) -> Device {
        Device::new(
            bus::shared(sim.clone()),
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_write_value_wire_format() {
        let sim = SimulatedAnalyzer::new();
        let device = test_device(&sim);

        device.write_value(0x10, 0x22, 420.0).await.unwrap();

        // opcode followed by the little-endian float32
        assert_eq!(sim.writes(), vec![vec![0x22, 0x00, 0x00, 0xD2, 0x43]]);
    }

    #[tokio::test]
    async fn test_wait_idle_follows_busy_then_idle() {
        let sim = SimulatedAnalyzer::new();
        sim.set_busy_polls(3);
        let device = test_device(&sim);

        device.start(0x10, 0x11).await.unwrap();
        device.wait_idle(0x10).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_surfaces_device_fault() {
        let sim = SimulatedAnalyzer::new();
        sim.set_faulted(true);
        let device = test_device(&sim);

        let err = device.wait_idle(0x10).await.unwrap_err();
        assert!(matches!(err, DeviceError::Fault));
    }

    #[tokio::test]
    async fn test_wait_idle_times_out() {
        let sim = SimulatedAnalyzer::new();
        sim.set_busy_polls(u32::MAX);
        let device = Device::new(
            bus::shared(sim.clone()),
            Duration::from_millis(1),
            Duration::from_millis(5),
        );

        device.start(0x10, 0x11).await.unwrap();
        let err = device.wait_idle(0x10).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout));
    }

    #[tokio::test]
    async fn test_result_roundtrip_is_bit_exact() {
        let sim = SimulatedAnalyzer::new();
        sim.set_result(410.5);
        let device = test_device(&sim);

        assert_eq!(device.read_result(0x10).await.unwrap(), 410.5);
    }
}
