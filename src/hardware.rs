// Capabilities the drivetrain needs from hardware
//
// Concrete vendor drivers implement these traits outside this crate; the `sim`
// module provides ideal in-process implementations.

use serde::{Deserialize, Serialize};

/// Errors reported by device drivers
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HardwareError {
    #[error("Timeout waiting for response from {device}")]
    Timeout { device: String },

    #[error("{device} reported fault: {reason}")]
    Fault { device: String, reason: String },

    #[error("{device} is disconnected")]
    Disconnected { device: String },
}

pub type Result<T> = std::result::Result<T, HardwareError>;

/// What a motor does with zero output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeutralMode {
    Brake,
    Coast,
}

/// A motor controller in native (raw) units
///
/// Raw positions are motor rotations and raw velocities are rotations per
/// the controller's native time base; `Motor` converts to mechanism units.
pub trait MotorController: Send {
    fn set_percent_output(&mut self, output: f64) -> Result<()>;

    fn set_voltage(&mut self, volts: f64) -> Result<()>;

    fn set_velocity(&mut self, raw_velocity: f64, feed_forward: f64) -> Result<()>;

    fn set_position(&mut self, raw_position: f64, feed_forward: f64) -> Result<()>;

    /// Redefine the current raw position without moving
    fn reset_raw_position(&mut self, raw_position: f64) -> Result<()>;

    /// Output actually applied, as a fraction of bus voltage in [-1, 1]
    fn applied_output(&self) -> Result<f64>;

    fn raw_position(&self) -> Result<f64>;

    fn raw_velocity(&self) -> Result<f64>;

    fn set_neutral_mode(&mut self, mode: NeutralMode) -> Result<()>;

    fn set_inverted(&mut self, inverted: bool) -> Result<()>;

    fn enable_voltage_compensation(&mut self, volts: f64) -> Result<()>;
}

/// Heading sensor, all angles in degrees (CCW positive yaw)
pub trait Gyro: Send {
    fn yaw(&self) -> Result<f64>;

    fn pitch(&self) -> Result<f64>;

    fn roll(&self) -> Result<f64>;

    /// Redefine the current yaw
    fn reset_to(&mut self, yaw_degrees: f64) -> Result<()>;
}

/// Steering angle sensor that keeps its reference across power cycles
pub trait AbsoluteEncoder: Send {
    /// Raw absolute angle in degrees, before calibration
    fn absolute_degrees(&self) -> Result<f64>;

    /// Whether the sensor is currently responding
    fn is_connected(&self) -> bool {
        self.absolute_degrees().is_ok()
    }
}
