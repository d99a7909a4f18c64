// Swerve drive control core
//
// Layers, bottom up:
// - geometry, kinematics: planar math and the module transform
// - estimator: odometry fused with late pose corrections
// - hardware, motor: device traits and the deduplicating command layer
// - swerve: modules and the drivetrain
// - runtime: zenoh host loop on simulated hardware

pub mod config;
pub mod estimator;
pub mod geometry;
pub mod hardware;
pub mod kinematics;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod sim;
pub mod swerve;
