//! Task and reading model
//!
//! A task is a single queued unit of device work: a test, a pump or
//! parameter calibration, or a flush. Tasks are persisted in the queue
//! bucket and identified by their parameter string, which also determines
//! the opcode written to the analyzer to start the action.

use crate::config::Parameter;
use crate::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opcode written to start a test (`ca` = 0x11 .. `po4` = 0x15).
pub const OPCODE_TEST_BASE: u8 = 0x11;
/// Opcode written to start the pump calibration.
pub const OPCODE_PUMP_CALIBRATION: u8 = 0x21;
/// Opcode written to start a parameter calibration (`ca` = 0x22 .. `po4` = 0x26).
pub const OPCODE_CALIBRATION_BASE: u8 = 0x22;
/// Opcode written to start a flush (`ca` = 0x27 .. `po4` = 0x2B).
pub const OPCODE_FLUSH_BASE: u8 = 0x27;
/// Opcode to read the pump calibration factor back.
pub const OPCODE_PUMP_FACTOR: u8 = 0x35;
/// Opcode to read a parameter calibration factor back (`ca` = 0x36 .. `po4` = 0x3A).
pub const OPCODE_FACTOR_BASE: u8 = 0x36;

/// The kind of device work a task performs.
///
/// The string form is the task's `param` identifier: `ca`/`alk`/`mg`/`no3`/
/// `po4` for tests, `pump`, `cal_<p>`, and `flush_<p>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TaskKind {
    /// Run a measurement for one parameter
    Test(Parameter),
    /// Calibrate the dosing pump
    PumpCalibration,
    /// Calibrate one parameter against a known value
    Calibration(Parameter),
    /// Flush the fluidics for one parameter
    Flush(Parameter),
}

impl TaskKind {
    /// Opcode written as the first byte to start this action.
    pub fn opcode(self) -> u8 {
        match self {
            TaskKind::Test(p) => OPCODE_TEST_BASE + p.index(),
            TaskKind::PumpCalibration => OPCODE_PUMP_CALIBRATION,
            TaskKind::Calibration(p) => OPCODE_CALIBRATION_BASE + p.index(),
            TaskKind::Flush(p) => OPCODE_FLUSH_BASE + p.index(),
        }
    }

    /// Opcode to read the calibration factor associated with this action,
    /// if it has one.
    pub fn factor_opcode(self) -> Option<u8> {
        match self {
            TaskKind::PumpCalibration => Some(OPCODE_PUMP_FACTOR),
            TaskKind::Calibration(p) => Some(OPCODE_FACTOR_BASE + p.index()),
            TaskKind::Test(_) | TaskKind::Flush(_) => None,
        }
    }

    /// The parameter this task concerns, if it is parameter-specific.
    pub fn parameter(self) -> Option<Parameter> {
        match self {
            TaskKind::Test(p) | TaskKind::Calibration(p) | TaskKind::Flush(p) => Some(p),
            TaskKind::PumpCalibration => None,
        }
    }

    /// Uppercase label used in operator-facing log lines.
    pub fn label(self) -> &'static str {
        match self {
            TaskKind::PumpCalibration => "PUMP",
            TaskKind::Test(p) | TaskKind::Calibration(p) | TaskKind::Flush(p) => p.label(),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Test(p) => f.write_str(p.as_str()),
            TaskKind::PumpCalibration => f.write_str("pump"),
            TaskKind::Calibration(p) => write!(f, "cal_{}", p),
            TaskKind::Flush(p) => write!(f, "flush_{}", p),
        }
    }
}

impl FromStr for TaskKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "pump" {
            return Ok(TaskKind::PumpCalibration);
        }
        if let Some(rest) = s.strip_prefix("cal_") {
            let p = rest
                .parse::<Parameter>()
                .map_err(|_| ModelError::UnknownTask(s.to_string()))?;
            return Ok(TaskKind::Calibration(p));
        }
        if let Some(rest) = s.strip_prefix("flush_") {
            let p = rest
                .parse::<Parameter>()
                .map_err(|_| ModelError::UnknownTask(s.to_string()))?;
            return Ok(TaskKind::Flush(p));
        }
        let p = s
            .parse::<Parameter>()
            .map_err(|_| ModelError::UnknownTask(s.to_string()))?;
        Ok(TaskKind::Test(p))
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for TaskKind {
    type Error = ModelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A queued unit of device work.
///
/// `id` is the store-assigned key; `ts` (seconds since epoch) is the sole
/// ordering key. The record persisted in the queue bucket is the
/// [`TaskRecord`] portion; `id` comes from the row key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned key, unique within the queue bucket
    pub id: i64,
    /// Task identifier, also the dedup key
    pub param: TaskKind,
    /// Opcode sent to initiate the device action
    pub code: u8,
    /// Enqueue time, seconds since epoch
    pub ts: u64,
}

/// The JSON document persisted for a queued task (the key lives outside).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub param: TaskKind,
    pub code: u8,
    pub ts: u64,
}

impl TaskRecord {
    /// Attach the store-assigned key to a loaded record.
    pub fn into_task(self, id: i64) -> Task {
        Task {
            id,
            param: self.param,
            code: self.code,
            ts: self.ts,
        }
    }
}

/// A single measurement result. Append-only; never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub param: Parameter,
    /// Measurement time, seconds since epoch
    pub ts: u64,
    pub value: f32,
}
