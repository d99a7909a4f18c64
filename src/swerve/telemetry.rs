// Read-only drivetrain telemetry
//
// Snapshots are built on request and pushed to an optional observer after
// each tick. Nothing in the control path reads them back.

use serde::Serialize;
use tokio::sync::watch;

use crate::geometry::Pose;
use crate::kinematics::{MODULE_COUNT, VelocityScrew};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModuleTelemetry {
    pub number: usize,
    /// Calibrated absolute encoder angle, `None` if the encoder is not responding
    pub absolute_deg: Option<f64>,
    pub commanded_angle_deg: f64,
    pub commanded_speed: f64,
    pub measured_angle_deg: f64,
    pub measured_speed: f64,
    pub healthy: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoseTelemetry {
    pub x: f64,
    pub y: f64,
    pub heading_deg: f64,
}

impl From<Pose> for PoseTelemetry {
    fn from(pose: Pose) -> Self {
        Self {
            x: pose.x(),
            y: pose.y(),
            heading_deg: pose.rotation.normalized().degrees(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriveTelemetry {
    pub timestamp: f64,
    pub modules: [ModuleTelemetry; MODULE_COUNT],
    pub pose: PoseTelemetry,
    pub raw_estimated_pose: PoseTelemetry,
    pub robot_velocity: VelocityScrew,
    pub field_velocity: VelocityScrew,
    pub speed: f64,
    pub yaw_deg: f64,
    pub field_relative: bool,
    pub throttle: f64,
}

/// Receives a snapshot after every drivetrain tick
pub trait TelemetryObserver: Send {
    fn publish(&mut self, telemetry: &DriveTelemetry);
}

/// Observer that keeps the latest snapshot in a tokio watch channel
pub struct WatchObserver {
    sender: watch::Sender<DriveTelemetry>,
}

impl WatchObserver {
    pub fn new() -> (Self, watch::Receiver<DriveTelemetry>) {
        let (sender, receiver) = watch::channel(DriveTelemetry::default());
        (Self { sender }, receiver)
    }
}

impl TelemetryObserver for WatchObserver {
    fn publish(&mut self, telemetry: &DriveTelemetry) {
        // No receivers is fine, the snapshot is simply dropped
        self.sender.send_replace(telemetry.clone());
    }
}
