//! Configuration record and parameter model for the auto-tester
//!
//! This module defines the five measurable parameters, the per-parameter
//! settings, and the single persisted analyzer configuration record,
//! including validation logic and serialization support.

use crate::defaults::*;
use crate::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the five analytes the analyzer can measure.
///
/// The set is closed: every test, calibration, and flush is keyed by one of
/// these values, and the wire opcodes are derived from the declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parameter {
    Ca,
    Alk,
    Mg,
    No3,
    Po4,
}

impl Parameter {
    /// All parameters, in opcode order.
    pub const ALL: [Parameter; 5] = [
        Parameter::Ca,
        Parameter::Alk,
        Parameter::Mg,
        Parameter::No3,
        Parameter::Po4,
    ];

    /// Position within the opcode order (ca = 0 .. po4 = 4).
    pub fn index(self) -> u8 {
        match self {
            Parameter::Ca => 0,
            Parameter::Alk => 1,
            Parameter::Mg => 2,
            Parameter::No3 => 3,
            Parameter::Po4 => 4,
        }
    }

    /// Lowercase wire/storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Parameter::Ca => "ca",
            Parameter::Alk => "alk",
            Parameter::Mg => "mg",
            Parameter::No3 => "no3",
            Parameter::Po4 => "po4",
        }
    }

    /// Uppercase label used in operator-facing log lines.
    pub fn label(self) -> &'static str {
        match self {
            Parameter::Ca => "CA",
            Parameter::Alk => "ALK",
            Parameter::Mg => "MG",
            Parameter::No3 => "NO3",
            Parameter::Po4 => "PO4",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Parameter {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ca" => Ok(Parameter::Ca),
            "alk" => Ok(Parameter::Alk),
            "mg" => Ok(Parameter::Mg),
            "no3" => Ok(Parameter::No3),
            "po4" => Ok(Parameter::Po4),
            other => Err(ModelError::UnknownParameter(other.to_string())),
        }
    }
}

/// Why a test may not be enqueued right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inadmissible {
    /// Not enough reagent left for one more test.
    ReagentLow,
    /// The waste tank would exceed its threshold.
    WasteFull,
}

impl fmt::Display for Inadmissible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inadmissible::ReagentLow => f.write_str("reagent low"),
            Inadmissible::WasteFull => f.write_str("waste tank full"),
        }
    }
}

/// Per-parameter settings within the analyzer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterConfig {
    /// Whether scheduled tests run for this parameter
    #[serde(default)]
    pub enable: bool,
    /// Recurrence rule for scheduled tests (RRULE subset); empty disables
    #[serde(default)]
    pub schedule: String,
    /// Reagent consumed per test, in mL
    #[serde(default = "default_reagent_use_ml")]
    pub reagent_use_ml: f32,
    /// Reagent volume of a freshly-filled bottle, in mL
    #[serde(default = "default_reagent_start_ml")]
    pub reagent_start_ml: f32,
    /// Reagent volume currently remaining, in mL
    #[serde(default = "default_reagent_start_ml")]
    pub reagent_remain_ml: f32,
}

impl Default for ParameterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            schedule: String::new(),
            reagent_use_ml: default_reagent_use_ml(),
            reagent_start_ml: default_reagent_start_ml(),
            reagent_remain_ml: default_reagent_start_ml(),
        }
    }
}

/// The single persisted analyzer configuration record (store key `default`).
///
/// Calibration factors are deliberately absent: they live on the device and
/// are merged into the rendered configuration at read time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyzerConfig {
    /// Bus address of the analyzer
    #[serde(default = "default_bus_addr")]
    pub i2c_addr: u16,
    #[serde(default)]
    pub ca: ParameterConfig,
    #[serde(default)]
    pub alk: ParameterConfig,
    #[serde(default)]
    pub mg: ParameterConfig,
    #[serde(default)]
    pub no3: ParameterConfig,
    #[serde(default)]
    pub po4: ParameterConfig,
    /// Waste tank capacity before tests are blocked, in mL
    #[serde(default = "default_waste_threshold_ml")]
    pub waste_threshold_ml: f32,
    /// Waste volume accumulated so far, in mL
    #[serde(default)]
    pub waste_remaining_ml: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            i2c_addr: default_bus_addr(),
            ca: ParameterConfig::default(),
            alk: ParameterConfig::default(),
            mg: ParameterConfig::default(),
            no3: ParameterConfig::default(),
            po4: ParameterConfig::default(),
            waste_threshold_ml: default_waste_threshold_ml(),
            waste_remaining_ml: 0.0,
        }
    }
}

impl AnalyzerConfig {
    /// Settings for one parameter.
    pub fn parameter(&self, p: Parameter) -> &ParameterConfig {
        match p {
            Parameter::Ca => &self.ca,
            Parameter::Alk => &self.alk,
            Parameter::Mg => &self.mg,
            Parameter::No3 => &self.no3,
            Parameter::Po4 => &self.po4,
        }
    }

    /// Mutable settings for one parameter.
    pub fn parameter_mut(&mut self, p: Parameter) -> &mut ParameterConfig {
        match p {
            Parameter::Ca => &mut self.ca,
            Parameter::Alk => &mut self.alk,
            Parameter::Mg => &mut self.mg,
            Parameter::No3 => &mut self.no3,
            Parameter::Po4 => &mut self.po4,
        }
    }

    /// Semantic validation of a configuration record.
    ///
    /// Recurrence rule syntax is checked separately by the controller, which
    /// owns the rule parser; this covers the numeric invariants only.
    pub fn validate(&self) -> Result<(), ModelError> {
        for p in Parameter::ALL {
            let pc = self.parameter(p);
            if pc.reagent_use_ml < 0.0 {
                return Err(ModelError::InvalidConfig(format!(
                    "{}: reagent_use_ml must not be negative",
                    p
                )));
            }
            if pc.reagent_start_ml < 0.0 {
                return Err(ModelError::InvalidConfig(format!(
                    "{}: reagent_start_ml must not be negative",
                    p
                )));
            }
            if pc.reagent_remain_ml < 0.0 || pc.reagent_remain_ml > pc.reagent_start_ml {
                return Err(ModelError::InvalidConfig(format!(
                    "{}: reagent_remain_ml must be between 0 and reagent_start_ml",
                    p
                )));
            }
        }
        if self.waste_threshold_ml < 0.0 {
            return Err(ModelError::InvalidConfig(
                "waste_threshold_ml must not be negative".to_string(),
            ));
        }
        if self.waste_remaining_ml < 0.0 {
            return Err(ModelError::InvalidConfig(
                "waste_remaining_ml must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Resource-safety precondition for enqueueing a test: enough reagent
    /// must remain, and the waste produced must still fit under the
    /// configured threshold.
    pub fn test_admissible(&self, p: Parameter) -> Result<(), Inadmissible> {
        let pc = self.parameter(p);
        if pc.reagent_remain_ml < pc.reagent_use_ml {
            return Err(Inadmissible::ReagentLow);
        }
        if self.waste_remaining_ml + pc.reagent_use_ml > self.waste_threshold_ml {
            return Err(Inadmissible::WasteFull);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_roundtrip() {
        for p in Parameter::ALL {
            assert_eq!(p.as_str().parse::<Parameter>().unwrap(), p);
        }
        assert!("ph".parse::<Parameter>().is_err());
    }

    #[test]
    fn test_parameter_serde_lowercase() {
        let json = serde_json::to_string(&Parameter::No3).unwrap();
        assert_eq!(json, "\"no3\"");
        let p: Parameter = serde_json::from_str("\"alk\"").unwrap();
        assert_eq!(p, Parameter::Alk);
    }

    #[test]
    fn test_config_defaults_from_empty_record() {
        let config: AnalyzerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.i2c_addr, 0x10);
        assert_eq!(config.ca.reagent_start_ml, 100.0);
        assert_eq!(config.ca.reagent_remain_ml, 100.0);
        assert!(!config.ca.enable);
        assert_eq!(config.waste_remaining_ml, 0.0);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = AnalyzerConfig::default();
        config.mg.enable = true;
        config.mg.schedule = "FREQ=DAILY;BYHOUR=8;BYMINUTE=30".to_string();
        config.waste_remaining_ml = 12.5;

        let json = serde_json::to_string(&config).unwrap();
        let back: AnalyzerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_validate_rejects_remain_above_start() {
        let mut config = AnalyzerConfig::default();
        config.ca.reagent_start_ml = 50.0;
        config.ca.reagent_remain_ml = 60.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_admissibility_reagent_low() {
        let mut config = AnalyzerConfig::default();
        config.ca.reagent_use_ml = 2.0;
        config.ca.reagent_remain_ml = 1.5;
        assert_eq!(
            config.test_admissible(Parameter::Ca),
            Err(Inadmissible::ReagentLow)
        );
    }

    #[test]
    fn test_admissibility_waste_full() {
        let mut config = AnalyzerConfig::default();
        config.ca.reagent_use_ml = 2.0;
        config.ca.reagent_remain_ml = 2.0;
        config.waste_threshold_ml = 10.0;
        config.waste_remaining_ml = 9.0;
        assert_eq!(
            config.test_admissible(Parameter::Ca),
            Err(Inadmissible::WasteFull)
        );
    }

    #[test]
    fn test_admissibility_exact_fit_is_allowed() {
        let mut config = AnalyzerConfig::default();
        config.ca.reagent_use_ml = 2.0;
        config.ca.reagent_remain_ml = 2.0;
        config.waste_threshold_ml = 10.0;
        config.waste_remaining_ml = 8.0;
        assert!(config.test_admissible(Parameter::Ca).is_ok());
    }
}
