//! Task execution against the analyzer
//!
//! The executor runs on the queue worker and performs the per-task I/O
//! sequence: start the device action, poll the status byte to idle, read
//! back whatever the action produces, and settle the bookkeeping (readings,
//! reagent and waste accounting, activity log).
//
// Configuration is read fresh at the points a task needs it; there is no
// snapshot captured at enqueue time. Reagent/waste mutations go through the
// accounting mutex shared with `PUT /config`, and always write back the
// full record that was just read.

use anyhow::Result;
use shared::config::Parameter;
use shared::task::{Reading, Task, TaskKind, OPCODE_FACTOR_BASE};
use shared::utils::current_timestamp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::activity::ActivityLog;
use crate::database::ControllerDatabase;
use crate::device::{Device, DeviceError};

/// Executes one task at a time on behalf of the queue worker.
#[derive(Clone)]
pub struct TaskExecutor {
    database: Arc<Mutex<ControllerDatabase>>,
    device: Device,
    activity: ActivityLog,
    /// Serializes reagent/waste read-modify-write against `PUT /config`
    accounting: Arc<Mutex<()>>,
    /// Pause between a calibration going idle and the factor read-back
    settle_delay: Duration,
}

impl TaskExecutor {
    pub fn new(
        database: Arc<Mutex<ControllerDatabase>>,
        device: Device,
        activity: ActivityLog,
        accounting: Arc<Mutex<()>>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            database,
            device,
            activity,
            accounting,
            settle_delay,
        }
    }

    /// Run one task to completion.
    ///
    /// Failures abort the task only: the error is logged to the activity
    /// ring here and returned for the worker's structured log; the next
    /// queued task proceeds. Tasks are never auto-retried.
    pub async fn execute(&self, task: &Task) -> Result<()> {
        debug!(param = %task.param, id = task.id, "Executing task");
        match task.param {
            TaskKind::Test(p) => self.run_test(p, task.code).await,
            TaskKind::PumpCalibration => self.run_pump_calibration(task.code).await,
            TaskKind::Calibration(p) => self.run_calibration(p).await,
            TaskKind::Flush(p) => self.run_flush(p, task.code).await,
        }
    }

    async fn bus_addr(&self) -> Result<u16> {
        let mut database = self.database.lock().await;
        Ok(database.load_config().await?.i2c_addr)
    }

    /// Log a device failure to the activity ring and abort the task.
    async fn fail(&self, label: &str, err: DeviceError) -> Result<()> {
        let line = match &err {
            DeviceError::Fault => format!("{}: device reported error", label),
            DeviceError::Timeout => format!("{}: timed out waiting for device", label),
            DeviceError::UnexpectedStatus(status) => {
                format!("{}: unexpected device status {:#04x}", label, status)
            }
            DeviceError::Bus(e) => format!("{}: bus error: {}", label, e),
        };
        self.activity.append(line).await;
        Err(err.into())
    }

    /// Measurement: start, poll to idle, read the float32 result, persist
    /// it, and account for the reagent consumed.
    async fn run_test(&self, p: Parameter, code: u8) -> Result<()> {
        let addr = self.bus_addr().await?;

        if let Err(e) = self.device.start(addr, code).await {
            return self.fail(p.label(), e).await;
        }
        if let Err(e) = self.device.wait_idle(addr).await {
            return self.fail(p.label(), e).await;
        }
        let value = match self.device.read_result(addr).await {
            Ok(value) => value,
            Err(e) => return self.fail(p.label(), e).await,
        };

        let reading = Reading {
            param: p,
            ts: current_timestamp(),
            value,
        };
        {
            let mut database = self.database.lock().await;
            database.append_reading(&reading).await?;
        }

        // One test's worth of reagent leaves the bottle and lands in the
        // waste tank.
        {
            let _accounting = self.accounting.lock().await;
            let mut database = self.database.lock().await;
            let mut config = database.load_config().await?;
            let use_ml = config.parameter(p).reagent_use_ml;
            let pc = config.parameter_mut(p);
            pc.reagent_remain_ml = (pc.reagent_remain_ml - use_ml).max(0.0);
            config.waste_remaining_ml += use_ml;
            database.store_config(&config).await?;
        }

        info!(parameter = %p, value, "Test complete");
        self.activity
            .append(format!("{} test complete: {:.2}", p.label(), value))
            .await;
        Ok(())
    }

    /// Pump calibration run: the device dispenses a nominal volume; the
    /// operator measures it and submits the value through the boundary.
    async fn run_pump_calibration(&self, code: u8) -> Result<()> {
        let addr = self.bus_addr().await?;

        if let Err(e) = self.device.start(addr, code).await {
            return self.fail("PUMP", e).await;
        }
        if let Err(e) = self.device.wait_idle(addr).await {
            return self.fail("PUMP", e).await;
        }

        self.activity
            .append("PUMP: calibration run complete, enter the dispensed volume")
            .await;
        Ok(())
    }

    /// Parameter calibration: the boundary already transmitted the known
    /// value before this task was enqueued, so the work left here is to
    /// wait out the device, let it settle, and read the new factor back.
    async fn run_calibration(&self, p: Parameter) -> Result<()> {
        let addr = self.bus_addr().await?;

        if let Err(e) = self.device.wait_idle(addr).await {
            return self.fail(p.label(), e).await;
        }
        tokio::time::sleep(self.settle_delay).await;

        let factor = match self
            .device
            .read_factor(addr, OPCODE_FACTOR_BASE + p.index())
            .await
        {
            Ok(factor) => factor,
            Err(e) => return self.fail(p.label(), e).await,
        };

        info!(parameter = %p, factor, "Calibration complete");
        self.activity
            .append(format!(
                "{} calibration complete, factor now {:.4}",
                p.label(),
                factor
            ))
            .await;
        Ok(())
    }

    /// Flush: cycle reagent through the fluidics. Only a fully successful
    /// flush resets the remaining volume to a full bottle.
    async fn run_flush(&self, p: Parameter, code: u8) -> Result<()> {
        let addr = self.bus_addr().await?;

        if let Err(e) = self.device.start(addr, code).await {
            return self.fail(p.label(), e).await;
        }
        if let Err(e) = self.device.wait_idle(addr).await {
            return self.fail(p.label(), e).await;
        }

        {
            let _accounting = self.accounting.lock().await;
            let mut database = self.database.lock().await;
            let mut config = database.load_config().await?;
            let pc = config.parameter_mut(p);
            pc.reagent_remain_ml = pc.reagent_start_ml;
            database.store_config(&config).await?;
        }

        info!(parameter = %p, "Flush complete");
        self.activity
            .append(format!("{} flush complete, reagent refilled", p.label()))
            .await;
        Ok(())
    }
}
