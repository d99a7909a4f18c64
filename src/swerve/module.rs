// One swerve module: a steering motor, a drive motor and an absolute encoder
//
// The steering motor's relative encoder loses its reference on power loss, so
// it is re-zeroed from the absolute encoder with `reset_to_absolute`.

use std::cell::Cell;

use tracing::{debug, info, warn};

use super::Result;
use crate::config::ModuleConfig;
use crate::geometry::{Rotation, normalize_degrees};
use crate::hardware::{AbsoluteEncoder, NeutralMode};
use crate::kinematics::{ModulePosition, ModuleState};
use crate::motor::{ControlMode, Motor};

/// Nominal battery voltage used for voltage compensation
const COMPENSATION_VOLTS: f64 = 12.0;

/// Pick the steering setpoint closest to `current` that realizes `target`
///
/// Returns a state whose angle is the continuous steering setpoint (current
/// plus a delta of at most 90 degrees) and whose speed is negated when the
/// wheel is turned to the opposite heading.
pub fn optimize(target: ModuleState, current: Rotation) -> ModuleState {
    let mut delta = normalize_degrees(target.angle.degrees() - current.degrees());
    let mut speed = target.speed;
    if delta.abs() > 90.0 {
        delta -= 180.0f64.copysign(delta);
        speed = -speed;
    }
    ModuleState::new(Rotation::from_degrees(current.degrees() + delta), speed)
}

pub struct SwerveModule {
    number: usize,
    config: ModuleConfig,
    steer: Motor,
    drive: Motor,
    encoder: Box<dyn AbsoluteEncoder>,
    desired: ModuleState,
    /// Last health reported by `running_state`
    healthy: Cell<bool>,
}

impl SwerveModule {
    /// Configure the motors for this module's gearing and inversion
    pub fn new(
        number: usize,
        config: ModuleConfig,
        steer: Motor,
        drive: Motor,
        encoder: Box<dyn AbsoluteEncoder>,
    ) -> Result<Self> {
        steer.set_unit_conversion(config.steer_rotations_per_degree);
        steer.set_inverted(config.steer_inverted)?;
        steer.set_neutral_mode(NeutralMode::Brake)?;
        steer.enable_voltage_compensation(COMPENSATION_VOLTS)?;

        drive.set_unit_conversion(config.drive_rotations_per_meter);
        drive.set_time_conversion(config.drive_time_conversion);
        drive.set_inverted(config.drive_inverted)?;
        drive.set_neutral_mode(NeutralMode::Brake)?;
        drive.enable_voltage_compensation(COMPENSATION_VOLTS)?;

        Ok(Self {
            number,
            config,
            steer,
            drive,
            encoder,
            desired: ModuleState::default(),
            healthy: Cell::new(true),
        })
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn steer_motor(&self) -> &Motor {
        &self.steer
    }

    pub fn drive_motor(&self) -> &Motor {
        &self.drive
    }

    /// Absolute encoder reading before calibration
    pub fn raw_absolute_angle(&self) -> Result<Rotation> {
        Ok(Rotation::from_degrees(self.encoder.absolute_degrees()?))
    }

    /// Calibrated absolute wheel angle, 0 degrees pointing forward
    pub fn absolute_angle(&self) -> Result<Rotation> {
        let raw = self.encoder.absolute_degrees()?;
        Ok(Rotation::from_degrees(normalize_degrees(
            raw - self.config.absolute_offset_deg,
        )))
    }

    /// Re-zero the steering motor from the absolute encoder
    pub fn reset_to_absolute(&mut self) -> Result<()> {
        let angle = self.absolute_angle()?;
        self.steer.reset_position(angle.degrees())?;
        debug!(
            "Module {}: steering reference set to {:.2} deg",
            self.number,
            angle.degrees()
        );
        Ok(())
    }

    /// Steering angle from the steering motor, continuous (not wrapped)
    pub fn angle(&self) -> Result<Rotation> {
        Ok(Rotation::from_degrees(self.steer.position()?))
    }

    /// Command the module, steering at most 90 degrees
    ///
    /// Returns the state that was applied after optimization.
    pub fn set_desired_state(&mut self, target: ModuleState) -> Result<ModuleState> {
        let applied = optimize(target, self.angle()?);
        self.steer
            .set(applied.angle.degrees(), ControlMode::Position, 0.0)?;
        self.drive.set(applied.speed, ControlMode::Velocity, 0.0)?;
        self.desired = applied;
        Ok(applied)
    }

    /// Point the wheel along `degrees` (either direction) with the drive stopped
    pub fn set_steer_angle(&mut self, degrees: f64) -> Result<()> {
        let target = optimize(
            ModuleState::new(Rotation::from_degrees(degrees), 0.0),
            self.angle()?,
        );
        self.steer
            .set(target.angle.degrees(), ControlMode::Position, 0.0)?;
        self.drive.set_output(0.0)?;
        self.desired = ModuleState::new(target.angle, 0.0);
        Ok(())
    }

    /// Last state applied through `set_desired_state`
    pub fn desired_state(&self) -> ModuleState {
        self.desired
    }

    /// Measured angle and drive velocity (m/s)
    pub fn state(&self) -> Result<ModuleState> {
        Ok(ModuleState::new(self.angle()?, self.drive.velocity()?))
    }

    /// Measured angle and cumulative drive distance (m)
    pub fn position(&self) -> Result<ModulePosition> {
        Ok(ModulePosition::new(self.drive.position()?, self.angle()?))
    }

    pub fn stop(&mut self) -> Result<()> {
        self.drive.set_output(0.0)?;
        self.steer.set_output(0.0)?;
        self.desired.speed = 0.0;
        Ok(())
    }

    pub fn set_brake_mode(&self, brake: bool) -> Result<()> {
        let mode = if brake {
            NeutralMode::Brake
        } else {
            NeutralMode::Coast
        };
        self.drive.set_neutral_mode(mode)?;
        self.steer.set_neutral_mode(mode)?;
        Ok(())
    }

    pub fn set_drive_voltage(&self, volts: f64) -> Result<()> {
        self.drive.set(volts, ControlMode::Voltage, 0.0)?;
        Ok(())
    }

    /// Whether the encoder and both motors respond
    ///
    /// Logs only when the answer changes.
    pub fn running_state(&self) -> bool {
        let healthy = self.encoder.is_connected()
            && self.steer.position().is_ok()
            && self.drive.position().is_ok();
        if healthy != self.healthy.replace(healthy) {
            if healthy {
                info!("Module {} is responding again", self.number);
            } else {
                warn!("Module {} is not responding", self.number);
            }
        }
        healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCommand, SimEncoder, SimMotor};
    use approx::assert_abs_diff_eq;

    struct Rig {
        module: SwerveModule,
        steer: SimMotor,
        drive: SimMotor,
        encoder: SimEncoder,
    }

    fn rig(absolute_deg: f64, offset_deg: f64) -> Rig {
        let steer = SimMotor::new();
        let drive = SimMotor::new();
        let encoder = SimEncoder::new(absolute_deg);
        let config = ModuleConfig {
            absolute_offset_deg: offset_deg,
            ..ModuleConfig::at(0.3, 0.3)
        };
        let module = SwerveModule::new(
            0,
            config,
            Motor::new("steer", Box::new(steer.clone())),
            Motor::new("drive", Box::new(drive.clone())),
            Box::new(encoder.clone()),
        )
        .unwrap();
        Rig {
            module,
            steer,
            drive,
            encoder,
        }
    }

    #[test]
    fn test_optimize_bounds_steering_travel() {
        let mut current = -720.0;
        while current <= 720.0 {
            let mut target = -180.0;
            while target <= 180.0 {
                let state = ModuleState::new(Rotation::from_degrees(target), 1.0);
                let applied = optimize(state, Rotation::from_degrees(current));
                let travel = applied.angle.degrees() - current;
                assert!(
                    travel.abs() <= 90.0 + 1e-9,
                    "current {current} target {target} travel {travel}"
                );

                // Same wheel velocity vector either way
                let wanted = crate::geometry::Translation::from_polar(1.0, state.angle);
                let got = crate::geometry::Translation::from_polar(applied.speed, applied.angle);
                assert_abs_diff_eq!(wanted.x, got.x, epsilon = 1e-9);
                assert_abs_diff_eq!(wanted.y, got.y, epsilon = 1e-9);
                target += 7.5;
            }
            current += 13.0;
        }
    }

    #[test]
    fn test_optimize_flips_past_ninety() {
        let applied = optimize(
            ModuleState::new(Rotation::from_degrees(170.0), 2.0),
            Rotation::from_degrees(0.0),
        );
        assert_abs_diff_eq!(applied.angle.degrees(), -10.0, epsilon = 1e-9);
        assert_eq!(applied.speed, -2.0);

        let kept = optimize(
            ModuleState::new(Rotation::from_degrees(80.0), 2.0),
            Rotation::from_degrees(0.0),
        );
        assert_abs_diff_eq!(kept.angle.degrees(), 80.0, epsilon = 1e-9);
        assert_eq!(kept.speed, 2.0);
    }

    #[test]
    fn test_reset_to_absolute_applies_offset() {
        let mut rig = rig(100.0, 30.0);
        rig.module.reset_to_absolute().unwrap();
        assert_abs_diff_eq!(rig.module.angle().unwrap().degrees(), 70.0, epsilon = 1e-9);

        let rotations_per_degree = rig.module.config().steer_rotations_per_degree;
        assert_abs_diff_eq!(
            rig.steer.shaft_position(),
            70.0 * rotations_per_degree,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_absolute_angle_wraps() {
        let rig = rig(10.0, 350.0);
        assert_abs_diff_eq!(
            rig.module.absolute_angle().unwrap().degrees(),
            20.0,
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(
            rig.module.raw_absolute_angle().unwrap().degrees(),
            10.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_set_desired_state_commands_both_motors() {
        let mut rig = rig(0.0, 0.0);
        rig.module.reset_to_absolute().unwrap();

        let applied = rig
            .module
            .set_desired_state(ModuleState::new(Rotation::from_degrees(-135.0), 1.5))
            .unwrap();
        // -135 is more than 90 away from 0, so steer to 45 and reverse
        assert_abs_diff_eq!(applied.angle.degrees(), 45.0, epsilon = 1e-9);
        assert_eq!(applied.speed, -1.5);
        assert_eq!(rig.module.desired_state(), applied);

        let config = rig.module.config();
        match rig.drive.last_command() {
            Some(SimCommand::Velocity { raw, .. }) => {
                assert_abs_diff_eq!(raw, -1.5 * config.drive_rotations_per_meter, epsilon = 1e-9)
            }
            other => panic!("unexpected drive command {other:?}"),
        }
        assert_abs_diff_eq!(rig.module.angle().unwrap().degrees(), 45.0, epsilon = 1e-9);
        assert_abs_diff_eq!(rig.module.state().unwrap().speed, -1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_position_tracks_drive_distance() {
        let mut rig = rig(0.0, 0.0);
        rig.module
            .set_desired_state(ModuleState::new(Rotation::zero(), 2.0))
            .unwrap();
        rig.drive.step(0.5);
        let position = rig.module.position().unwrap();
        assert_abs_diff_eq!(position.distance, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(position.angle.degrees(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_repeated_state_is_not_resent() {
        let mut rig = rig(0.0, 0.0);
        let target = ModuleState::new(Rotation::zero(), 1.0);
        rig.module.set_desired_state(target).unwrap();
        rig.module.set_desired_state(target).unwrap();
        assert_eq!(rig.drive.dispatch_count(), 1);
        assert_eq!(rig.steer.dispatch_count(), 1);
    }

    #[test]
    fn test_set_steer_angle_takes_short_way() {
        let mut rig = rig(0.0, 0.0);
        rig.module.reset_to_absolute().unwrap();
        rig.module.set_steer_angle(135.0).unwrap();
        assert_abs_diff_eq!(rig.module.angle().unwrap().degrees(), -45.0, epsilon = 1e-9);
        assert_eq!(rig.module.desired_state().speed, 0.0);
        assert_eq!(rig.drive.output(), 0.0);
    }

    #[test]
    fn test_running_state_reports_encoder_loss() {
        let rig = rig(0.0, 0.0);
        assert!(rig.module.running_state());
        rig.encoder.disconnect();
        assert!(!rig.module.running_state());
        assert!(rig.module.absolute_angle().is_err());
    }

    #[test]
    fn test_running_state_tracks_transitions() {
        let rig = rig(0.0, 0.0);
        assert!(rig.module.healthy.get());

        rig.encoder.disconnect();
        for _ in 0..3 {
            assert!(!rig.module.running_state());
            assert!(!rig.module.healthy.get());
        }

        rig.encoder.set_degrees(15.0);
        assert!(rig.module.running_state());
        assert!(rig.module.healthy.get());
    }
}
