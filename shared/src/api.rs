//! API types and structures for the controller's REST surface
//!
//! This module defines the request and response types used by the HTTP
//! endpoints, plus the endpoint path constants shared between the router
//! and the tests.

use crate::config::AnalyzerConfig;
use serde::{Deserialize, Serialize};

/// Body for the calibration endpoints: the known or measured value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationRequest {
    pub value: f32,
}

/// Response for `GET /status/{param}`.
///
/// `status` is the live device status byte (0 idle, 1 busy, 2 error);
/// `param` names the task currently being executed, or is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: u8,
    pub param: String,
}

/// Calibration factors read live from the device, merged into the rendered
/// configuration. A factor is `null` when the device read failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationFactors {
    pub pump_calibration: Option<f32>,
    pub calibration_ca: Option<f32>,
    pub calibration_alk: Option<f32>,
    pub calibration_mg: Option<f32>,
    pub calibration_no3: Option<f32>,
    pub calibration_po4: Option<f32>,
}

impl CalibrationFactors {
    /// Store a factor by its parameter.
    pub fn set(&mut self, p: crate::config::Parameter, value: Option<f32>) {
        use crate::config::Parameter;
        match p {
            Parameter::Ca => self.calibration_ca = value,
            Parameter::Alk => self.calibration_alk = value,
            Parameter::Mg => self.calibration_mg = value,
            Parameter::No3 => self.calibration_no3 = value,
            Parameter::Po4 => self.calibration_po4 = value,
        }
    }
}

/// Response for `GET /config`: the persisted record plus live factors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    #[serde(flatten)]
    pub config: AnalyzerConfig,
    #[serde(flatten)]
    pub factors: CalibrationFactors,
}

/// One activity log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Seconds since epoch
    pub ts: u64,
    pub message: String,
}

/// API endpoint paths. Parameterized routes use the axum `{param}` capture
/// syntax; the constants keep the router and the tests consistent.
pub mod endpoints {
    pub const HEALTH: &str = "/health";
    pub const CONFIG: &str = "/config";
    pub const RUN: &str = "/run/{param}";
    pub const CALIBRATE_PUMP_START: &str = "/calibrate/pump/start";
    pub const CALIBRATE_START: &str = "/calibrate/{param}/start";
    pub const CALIBRATE: &str = "/calibrate/{param}";
    pub const STATUS: &str = "/status/{param}";
    pub const RESULTS: &str = "/results/{param}";
    pub const QUEUE: &str = "/queue";
    pub const QUEUE_ENTRY: &str = "/queue/{param}";
    pub const LOG: &str = "/log";
    pub const FILL: &str = "/fill/{param}";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Parameter;

    #[test]
    fn test_config_response_is_flat() {
        let response = ConfigResponse {
            config: AnalyzerConfig::default(),
            factors: CalibrationFactors::default(),
        };
        let value = serde_json::to_value(&response).unwrap();
        // Persisted fields and live factors share one flat JSON object.
        assert!(value.get("i2c_addr").is_some());
        assert!(value.get("waste_threshold_ml").is_some());
        assert!(value.get("pump_calibration").is_some());
        assert!(value.get("calibration_no3").is_some());
    }

    #[test]
    fn test_factor_set_by_parameter() {
        let mut factors = CalibrationFactors::default();
        factors.set(Parameter::Mg, Some(1.25));
        assert_eq!(factors.calibration_mg, Some(1.25));
        assert_eq!(factors.calibration_ca, None);
    }

    #[test]
    fn test_calibration_request_decoding() {
        let request: CalibrationRequest = serde_json::from_str(r#"{"value":420.0}"#).unwrap();
        assert_eq!(request.value, 420.0);
    }
}
