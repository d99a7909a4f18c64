// Timeouts, topics, drivetrain configuration
use std::f64::consts::PI;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::estimator::EstimatorConfig;
use crate::geometry::Translation;
use crate::kinematics::MODULE_COUNT;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Follower replication period (slower than the control loop)
pub const REPLICATION_PERIOD: Duration = Duration::from_millis(100);

// Zenoh topics
pub const TOPIC_CMD_DRIVE: &str = "swerve/cmd/drive"; // velocity commands
pub const TOPIC_VISION: &str = "swerve/cmd/vision"; // external pose corrections
pub const TOPIC_TELEMETRY: &str = "swerve/state/telemetry"; // drivetrain telemetry
pub const TOPIC_HEALTH: &str = "swerve/state/health"; // health status

// Default chassis: 0.6 m square, SDS MK4 L2-style gearing
const HALF_TRACK: f64 = 0.3;
const MAX_SPEED: f64 = 4.0; // m/s
const WHEEL_DIAMETER: f64 = 0.1016; // meters
const DRIVE_GEAR_RATIO: f64 = 6.75;
const STEER_GEAR_RATIO: f64 = 12.8;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Fixed description of one swerve module
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Wheel contact point relative to the robot center (meters, X forward, Y left)
    pub offset: Translation,
    /// Drive speed limit in m/s
    pub max_speed: f64,
    /// Absolute encoder reading (degrees) when the wheel points forward
    pub absolute_offset_deg: f64,
    pub drive_inverted: bool,
    pub steer_inverted: bool,
    /// Drive motor rotations per meter of travel
    pub drive_rotations_per_meter: f64,
    /// Drive controller time base per second (60 for RPM)
    pub drive_time_conversion: f64,
    /// Steering motor rotations per degree of module rotation
    pub steer_rotations_per_degree: f64,
}

impl ModuleConfig {
    /// Default gearing at a given position
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            offset: Translation::new(x, y),
            max_speed: MAX_SPEED,
            absolute_offset_deg: 0.0,
            drive_inverted: false,
            steer_inverted: false,
            drive_rotations_per_meter: DRIVE_GEAR_RATIO / (PI * WHEEL_DIAMETER),
            drive_time_conversion: 1.0,
            steer_rotations_per_degree: STEER_GEAR_RATIO / 360.0,
        }
    }

    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        let positive = [
            ("max_speed", self.max_speed),
            ("drive_rotations_per_meter", self.drive_rotations_per_meter.abs()),
            ("drive_time_conversion", self.drive_time_conversion.abs()),
            ("steer_rotations_per_degree", self.steer_rotations_per_degree.abs()),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "module {index}: {name} must be positive and finite, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Everything needed to build a drivetrain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Front-left, front-right, back-left, back-right
    pub modules: [ModuleConfig; MODULE_COUNT],
    pub estimator: EstimatorConfig,
    /// Period used for discretization correction, in seconds
    pub control_period_s: f64,
    pub field_relative: bool,
    pub discretize: bool,
    pub throttle: f64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            modules: [
                ModuleConfig::at(HALF_TRACK, HALF_TRACK),
                ModuleConfig::at(HALF_TRACK, -HALF_TRACK),
                ModuleConfig::at(-HALF_TRACK, HALF_TRACK),
                ModuleConfig::at(-HALF_TRACK, -HALF_TRACK),
            ],
            estimator: EstimatorConfig::default(),
            control_period_s: 1.0 / LOOP_HZ as f64,
            field_relative: true,
            discretize: true,
            throttle: 1.0,
        }
    }
}

impl DriveConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, module) in self.modules.iter().enumerate() {
            module.validate(index)?;
        }
        if !(self.control_period_s.is_finite() && self.control_period_s > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "control_period_s must be positive, got {}",
                self.control_period_s
            )));
        }
        if !(self.estimator.history_window_s.is_finite() && self.estimator.history_window_s > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "history_window_s must be positive, got {}",
                self.estimator.history_window_s
            )));
        }
        if !(0.0..=1.0).contains(&self.throttle) {
            return Err(ConfigError::Invalid(format!(
                "throttle must be within [0, 1], got {}",
                self.throttle
            )));
        }
        Ok(())
    }

    pub fn max_speeds(&self) -> [f64; MODULE_COUNT] {
        self.modules.map(|m| m.max_speed)
    }

    pub fn offsets(&self) -> [Translation; MODULE_COUNT] {
        self.modules.map(|m| m.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DriveConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_speeds(), [4.0; MODULE_COUNT]);
        assert_eq!(config.offsets()[1], Translation::new(0.3, -0.3));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DriveConfig =
            serde_json::from_str(r#"{ "throttle": 0.5, "field_relative": false }"#).unwrap();
        assert_eq!(config.throttle, 0.5);
        assert!(!config.field_relative);
        assert_eq!(config.modules, DriveConfig::default().modules);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = DriveConfig::default();
        config.modules[2].max_speed = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = DriveConfig::default();
        config.throttle = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join("swerve_runtime_config_test.json");
        std::fs::write(&path, r#"{ "control_period_s": 0.01 }"#).unwrap();
        let config = DriveConfig::from_json_file(&path).unwrap();
        assert_eq!(config.control_period_s, 0.01);
        std::fs::remove_file(&path).ok();

        assert!(matches!(
            DriveConfig::from_json_file("/nonexistent/swerve.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
