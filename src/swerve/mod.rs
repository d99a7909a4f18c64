// Swerve drivetrain: four steerable modules, kinematics, pose estimation
//
// Provides:
// - Per-module shortest-path steering and absolute-encoder calibration
// - The drivetrain control surface and the once-per-tick `periodic` entry point
// - Read-only telemetry snapshots

pub mod drivetrain;
pub mod module;
pub mod telemetry;

pub use drivetrain::{Drivetrain, ModuleHardware, VisionSender};
pub use module::{SwerveModule, optimize};
pub use telemetry::{DriveTelemetry, ModuleTelemetry, TelemetryObserver, WatchObserver};

use crate::config::ConfigError;
use crate::estimator::EstimatorError;
use crate::hardware::HardwareError;
use crate::kinematics::KinematicsError;
use crate::motor::MotorError;

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Motor(#[from] MotorError),

    #[error("Sensor error: {0}")]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Kinematics(#[from] KinematicsError),

    #[error("Rejected pose measurement: {0}")]
    Estimator(#[from] EstimatorError),

    #[error("Module number must be between 0 and 3, got {index}")]
    InvalidModuleIndex { index: usize },

    #[error("Throttle must be a number, got {value}")]
    InvalidThrottle { value: f64 },

    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: &'static str },

    #[error("Vision measurement channel is closed")]
    VisionChannelClosed,
}

pub type Result<T> = std::result::Result<T, DriveError>;
