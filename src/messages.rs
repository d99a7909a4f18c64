// Message types exchanged with teleop, vision and monitoring over zenoh

use serde::{Deserialize, Serialize};

use crate::geometry::Pose;
use crate::kinematics::VelocityScrew;

// Command from teleop/autonomy -> runtime
// vx, vy in m/s, omega in rad/s (CCW positive)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveCommand {
    pub vx: f64,
    pub vy: f64,
    pub omega: f64,
    /// Overrides the runtime's frame for this command when present
    #[serde(default)]
    pub field_relative: Option<bool>,
}

impl From<&DriveCommand> for VelocityScrew {
    fn from(cmd: &DriveCommand) -> Self {
        VelocityScrew::new(cmd.vx, cmd.vy, cmd.omega)
    }
}

// Pose correction from a vision pipeline -> runtime
// timestamp is on the runtime clock, in seconds since start
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisionMeasurement {
    pub x: f64,
    pub y: f64,
    pub heading_deg: f64,
    pub timestamp: f64,
}

impl VisionMeasurement {
    pub fn pose(&self) -> Pose {
        Pose::from_xy_degrees(self.x, self.y, self.heading_deg)
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    /// One or more modules stopped responding
    ModuleFault,
}
