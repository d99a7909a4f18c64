// Motor command layer for the swerve modules
//
// Provides:
// - Mode dispatch with clamping and unit conversion
// - Suppression of repeated identical commands
// - Periodic leader/follower output replication

mod driver;
pub mod follower;

pub use driver::{ControlMode, MAX_PERCENT_OUTPUT, MAX_VOLTAGE, Motor, MotorError};
pub use follower::{DEFAULT_REPLICATION_PERIOD, FollowerRegistry, ReplicationTask};
