// Four-module swerve drivetrain
//
// The host calls `periodic` once per control tick. Inside a tick the wheel
// measurements are read first, then the estimator integrates them, then any
// queued pose corrections are blended in.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::module::SwerveModule;
use super::telemetry::{DriveTelemetry, ModuleTelemetry, TelemetryObserver};
use super::{DriveError, Result};
use crate::config::{DriveConfig, ModuleConfig};
use crate::estimator::PoseEstimator;
use crate::geometry::{Pose, Rotation, Translation};
use crate::hardware::{AbsoluteEncoder, Gyro};
use crate::kinematics::{
    MODULE_COUNT, ModulePosition, ModuleState, SwerveKinematics, VelocityScrew, desaturate,
};
use crate::motor::Motor;

/// Wheel angles that point every module at the center, resisting pushes
const X_LOCK_DEG: [f64; MODULE_COUNT] = [45.0, -45.0, 135.0, -135.0];

/// Wheel angles tangent to the rotation circle
const O_LOCK_DEG: [f64; MODULE_COUNT] = [135.0, 45.0, -135.0, -45.0];

const ZERO_LOCK_DEG: [f64; MODULE_COUNT] = [0.0; MODULE_COUNT];

/// Devices that make up one module
pub struct ModuleHardware {
    pub steer: Motor,
    pub drive: Motor,
    pub encoder: Box<dyn AbsoluteEncoder>,
}

/// Cloneable handle for submitting pose corrections from other tasks
///
/// Corrections are queued and applied during the next `periodic` call.
#[derive(Debug, Clone)]
pub struct VisionSender {
    sender: mpsc::UnboundedSender<(Pose, f64)>,
}

impl VisionSender {
    pub fn send(&self, pose: Pose, timestamp: f64) -> Result<()> {
        self.sender
            .send((pose, timestamp))
            .map_err(|_| DriveError::VisionChannelClosed)
    }
}

pub struct Drivetrain {
    modules: [SwerveModule; MODULE_COUNT],
    kinematics: SwerveKinematics,
    estimator: PoseEstimator,
    gyro: Box<dyn Gyro>,
    max_speeds: [f64; MODULE_COUNT],
    control_period_s: f64,
    field_relative: bool,
    discretize: bool,
    throttle: f64,
    vision_tx: mpsc::UnboundedSender<(Pose, f64)>,
    vision_rx: mpsc::UnboundedReceiver<(Pose, f64)>,
    observer: Option<Box<dyn TelemetryObserver>>,
    last_timestamp: f64,
}

impl Drivetrain {
    /// Build the drivetrain, zero the steering from the absolute encoders and
    /// start odometry at the origin facing the gyro heading
    ///
    /// Hardware is given front-left, front-right, back-left, back-right.
    pub fn new(
        config: &DriveConfig,
        gyro: Box<dyn Gyro>,
        hardware: [ModuleHardware; MODULE_COUNT],
    ) -> Result<Self> {
        config.validate()?;
        let kinematics = SwerveKinematics::new(config.offsets())?;

        let [front_left, front_right, back_left, back_right] = hardware;
        let modules = [
            build_module(0, config.modules[0], front_left)?,
            build_module(1, config.modules[1], front_right)?,
            build_module(2, config.modules[2], back_left)?,
            build_module(3, config.modules[3], back_right)?,
        ];

        let heading = Rotation::from_degrees(gyro.yaw()?);
        let positions = read_positions(&modules)?;
        let estimator = PoseEstimator::new(
            kinematics.clone(),
            config.estimator,
            heading,
            positions,
            Pose::new(Translation::default(), heading),
        );

        let (vision_tx, vision_rx) = mpsc::unbounded_channel();
        info!(
            "Drivetrain ready: field_relative={}, discretize={}, throttle={:.2}",
            config.field_relative, config.discretize, config.throttle
        );

        Ok(Self {
            modules,
            kinematics,
            estimator,
            gyro,
            max_speeds: config.max_speeds(),
            control_period_s: config.control_period_s,
            field_relative: config.field_relative,
            discretize: config.discretize,
            throttle: config.throttle,
            vision_tx,
            vision_rx,
            observer: None,
            last_timestamp: 0.0,
        })
    }

    // ---- Control surface ----

    /// Drive in the frame selected by the field-relative flag
    pub fn drive(&mut self, screw: VelocityScrew) -> Result<[ModuleState; MODULE_COUNT]> {
        if self.field_relative {
            self.drive_field_relative(screw)
        } else {
            self.drive_robot_relative(screw)
        }
    }

    pub fn drive_field_relative(
        &mut self,
        screw: VelocityScrew,
    ) -> Result<[ModuleState; MODULE_COUNT]> {
        let heading = self.gyro_rotation()?;
        self.assign(screw.from_field_relative(heading))
    }

    pub fn drive_robot_relative(
        &mut self,
        screw: VelocityScrew,
    ) -> Result<[ModuleState; MODULE_COUNT]> {
        self.assign(screw)
    }

    fn assign(&mut self, screw: VelocityScrew) -> Result<[ModuleState; MODULE_COUNT]> {
        let mut screw = screw;
        if self.discretize {
            screw = screw.discretize(self.control_period_s);
        }
        let screw = screw.scaled(self.throttle);

        // A zero screw has no wheel direction, keep the wheels where they point
        let states = if screw.is_zero() {
            self.modules
                .each_ref()
                .map(|m| ModuleState::new(m.desired_state().angle, 0.0))
        } else {
            self.kinematics.to_module_states(screw)
        };
        self.set_module_states(states)
    }

    /// Desaturate and send per-module targets, returning what each module applied
    pub fn set_module_states(
        &mut self,
        states: [ModuleState; MODULE_COUNT],
    ) -> Result<[ModuleState; MODULE_COUNT]> {
        let mut states = states;
        desaturate(&mut states, self.max_speeds);

        let mut applied = [ModuleState::default(); MODULE_COUNT];
        for ((module, state), out) in self.modules.iter_mut().zip(states).zip(applied.iter_mut()) {
            *out = module.set_desired_state(state)?;
        }
        Ok(applied)
    }

    pub fn stop(&mut self) -> Result<()> {
        for module in &mut self.modules {
            module.stop()?;
        }
        Ok(())
    }

    pub fn set_brake_mode(&self, brake: bool) -> Result<()> {
        for module in &self.modules {
            module.set_brake_mode(brake)?;
        }
        debug!("Drive neutral mode: {}", if brake { "brake" } else { "coast" });
        Ok(())
    }

    /// Open-loop drive voltage on every module, steering untouched
    pub fn set_drive_voltage(&self, volts: f64) -> Result<()> {
        for module in &self.modules {
            module.set_drive_voltage(volts)?;
        }
        Ok(())
    }

    pub fn x_lock(&mut self) -> Result<()> {
        self.lock(X_LOCK_DEG)
    }

    pub fn o_lock(&mut self) -> Result<()> {
        self.lock(O_LOCK_DEG)
    }

    pub fn zero_lock(&mut self) -> Result<()> {
        self.lock(ZERO_LOCK_DEG)
    }

    fn lock(&mut self, angles: [f64; MODULE_COUNT]) -> Result<()> {
        for (module, degrees) in self.modules.iter_mut().zip(angles) {
            module.set_steer_angle(degrees)?;
        }
        Ok(())
    }

    // ---- Tick ----

    /// Advance one control tick at `timestamp` (seconds) and return the pose
    pub fn periodic(&mut self, timestamp: f64) -> Result<Pose> {
        let heading = self.gyro_rotation()?;
        let positions = self.positions()?;
        self.estimator.update(timestamp, heading, positions)?;
        self.last_timestamp = timestamp;

        while let Ok((pose, measured_at)) = self.vision_rx.try_recv() {
            if let Err(e) = self.estimator.add_vision_measurement(pose, measured_at) {
                warn!("Dropping pose measurement from {:.3}s: {}", measured_at, e);
            }
        }

        if self.observer.is_some() {
            match self.telemetry() {
                Ok(telemetry) => {
                    if let Some(observer) = self.observer.as_mut() {
                        observer.publish(&telemetry);
                    }
                }
                Err(e) => warn!("Telemetry unavailable: {}", e),
            }
        }

        self.pose()
    }

    // ---- Pose ----

    /// Estimated translation with the gyro heading
    pub fn pose(&self) -> Result<Pose> {
        Ok(Pose::new(
            self.estimator.estimated_pose().translation,
            self.gyro_rotation()?,
        ))
    }

    /// Estimator output, heading included
    pub fn raw_estimated_pose(&self) -> Pose {
        self.estimator.estimated_pose()
    }

    /// Blend an external pose captured at `timestamp` into the estimate now
    pub fn add_vision_measurement(&mut self, pose: Pose, timestamp: f64) -> Result<()> {
        self.estimator.add_vision_measurement(pose, timestamp)?;
        Ok(())
    }

    pub fn set_vision_std_devs(&mut self, measurement_std_devs: [f64; 3]) {
        self.estimator.set_measurement_std_devs(measurement_std_devs);
    }

    pub fn vision_sender(&self) -> VisionSender {
        VisionSender {
            sender: self.vision_tx.clone(),
        }
    }

    /// Redefine the gyro heading and hard-set the estimate to `pose`
    pub fn reset_odometry(&mut self, pose: Pose) -> Result<()> {
        self.gyro.reset_to(pose.rotation.degrees())?;
        let heading = self.gyro_rotation()?;
        let positions = self.positions()?;
        self.estimator.reset_position(heading, positions, pose);
        info!(
            "Odometry reset to ({:.3}, {:.3}) heading {:.1} deg",
            pose.x(),
            pose.y(),
            pose.rotation.degrees()
        );
        Ok(())
    }

    /// Re-zero every steering motor from its absolute encoder
    pub fn reset_encoders(&mut self) -> Result<()> {
        for module in &mut self.modules {
            module.reset_to_absolute()?;
        }
        Ok(())
    }

    /// Redefine the gyro heading, keeping the estimated translation
    pub fn reset_gyro(&mut self, degrees: f64) -> Result<()> {
        let translation = self.estimator.estimated_pose().translation;
        self.gyro.reset_to(degrees)?;
        let heading = self.gyro_rotation()?;
        let positions = self.positions()?;
        self.estimator
            .reset_position(heading, positions, Pose::new(translation, heading));
        info!("Gyro reset to {:.1} deg", degrees);
        Ok(())
    }

    /// Origin pose, steering re-zeroed, gyro at zero
    pub fn reset_all(&mut self) -> Result<()> {
        self.reset_odometry(Pose::default())?;
        self.reset_encoders()?;
        self.reset_gyro(0.0)
    }

    // ---- Sensors ----

    pub fn gyro_rotation(&self) -> Result<Rotation> {
        Ok(Rotation::from_degrees(self.gyro.yaw()?))
    }

    pub fn yaw(&self) -> Result<f64> {
        Ok(self.gyro.yaw()?)
    }

    pub fn pitch(&self) -> Result<f64> {
        Ok(self.gyro.pitch()?)
    }

    pub fn roll(&self) -> Result<f64> {
        Ok(self.gyro.roll()?)
    }

    pub fn states(&self) -> Result<[ModuleState; MODULE_COUNT]> {
        let mut states = [ModuleState::default(); MODULE_COUNT];
        for (state, module) in states.iter_mut().zip(&self.modules) {
            *state = module.state()?;
        }
        Ok(states)
    }

    pub fn positions(&self) -> Result<[ModulePosition; MODULE_COUNT]> {
        read_positions(&self.modules)
    }

    pub fn module(&self, index: usize) -> Result<&SwerveModule> {
        self.modules
            .get(index)
            .ok_or(DriveError::InvalidModuleIndex { index })
    }

    pub fn modules(&self) -> &[SwerveModule; MODULE_COUNT] {
        &self.modules
    }

    pub fn kinematics(&self) -> &SwerveKinematics {
        &self.kinematics
    }

    // ---- Queries ----

    /// Measured velocity in the robot frame
    pub fn robot_velocity(&self) -> Result<VelocityScrew> {
        Ok(self.kinematics.to_screw(&self.states()?))
    }

    /// Measured velocity in the field frame
    pub fn field_velocity(&self) -> Result<VelocityScrew> {
        Ok(self.robot_velocity()?.to_field_relative(self.gyro_rotation()?))
    }

    /// Linear speed in m/s
    pub fn speed(&self) -> Result<f64> {
        Ok(self.robot_velocity()?.linear_speed())
    }

    pub fn predict_pose(&self, _dt: f64) -> Result<Pose> {
        Err(DriveError::Unsupported {
            operation: "pose prediction without a velocity",
        })
    }

    /// Pose after holding a field-relative `velocity` for `dt` seconds
    pub fn predict_pose_with(&self, velocity: VelocityScrew, dt: f64) -> Result<Pose> {
        let pose = self.pose()?;
        Ok(Pose::new(
            pose.translation + Translation::new(velocity.vx * dt, velocity.vy * dt),
            pose.rotation + Rotation::from_radians(velocity.omega * dt),
        ))
    }

    /// Robot position relative to `point` (robot minus point)
    pub fn translation_to(&self, point: Translation) -> Result<Translation> {
        Ok(self.pose()?.translation - point)
    }

    pub fn distance_to(&self, point: Translation) -> Result<f64> {
        Ok(self.pose()?.translation.distance(point))
    }

    /// Turn needed to face `point`, in (-180, 180] degrees
    pub fn rotation_to_point(&self, point: Translation) -> Result<Rotation> {
        let pose = self.pose()?;
        Ok(((point - pose.translation).angle() - pose.rotation).normalized())
    }

    /// Heading error against `target` (gyro minus target), positive when the
    /// robot is counter-clockwise of it
    pub fn rotation_to_heading(&self, target: Rotation) -> Result<Rotation> {
        Ok((self.gyro_rotation()? - target).normalized())
    }

    /// `rotation_to_heading` in radians, within (-pi, pi]
    pub fn angle_to(&self, target: Rotation) -> Result<f64> {
        Ok(self.rotation_to_heading(target)?.radians())
    }

    pub fn nearest_pose(&self, candidates: &[Pose]) -> Result<Option<Pose>> {
        Ok(self.pose()?.nearest(candidates))
    }

    pub fn nearest_translation(&self, candidates: &[Translation]) -> Result<Option<Translation>> {
        Ok(self.pose()?.translation.nearest(candidates))
    }

    pub fn nearest_rotation(&self, _candidates: &[Rotation]) -> Result<Rotation> {
        Err(DriveError::Unsupported {
            operation: "nearest rotation",
        })
    }

    /// Raw absolute encoder angles, to be copied into `absolute_offset_deg`
    /// with every wheel pointing forward
    pub fn identify_offsets(&self) -> Result<[f64; MODULE_COUNT]> {
        let mut offsets = [0.0; MODULE_COUNT];
        for (offset, module) in offsets.iter_mut().zip(&self.modules) {
            *offset = module.raw_absolute_angle()?.degrees();
        }
        info!(
            "Absolute encoder offsets (deg): FL {:.2}, FR {:.2}, BL {:.2}, BR {:.2}",
            offsets[0], offsets[1], offsets[2], offsets[3]
        );
        Ok(offsets)
    }

    // ---- Flags ----

    pub fn field_relative(&self) -> bool {
        self.field_relative
    }

    pub fn set_field_relative(&mut self, field_relative: bool) {
        if self.field_relative != field_relative {
            info!("Field-relative drive {}", if field_relative { "on" } else { "off" });
        }
        self.field_relative = field_relative;
    }

    pub fn toggle_field_relative(&mut self) {
        self.set_field_relative(!self.field_relative);
    }

    pub fn throttle(&self) -> f64 {
        self.throttle
    }

    /// Scale applied to every drive request, clamped to [0, 1]
    pub fn set_throttle(&mut self, throttle: f64) -> Result<()> {
        if throttle.is_nan() {
            return Err(DriveError::InvalidThrottle { value: throttle });
        }
        self.throttle = throttle.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn discretize(&self) -> bool {
        self.discretize
    }

    pub fn set_discretize(&mut self, discretize: bool) {
        self.discretize = discretize;
    }

    // ---- Telemetry ----

    pub fn set_observer(&mut self, observer: Box<dyn TelemetryObserver>) {
        self.observer = Some(observer);
    }

    pub fn clear_observer(&mut self) {
        self.observer = None;
    }

    pub fn telemetry(&self) -> Result<DriveTelemetry> {
        let mut modules: [ModuleTelemetry; MODULE_COUNT] = Default::default();
        for (entry, module) in modules.iter_mut().zip(&self.modules) {
            let desired = module.desired_state();
            let measured = module.state()?;
            *entry = ModuleTelemetry {
                number: module.number(),
                absolute_deg: module.absolute_angle().ok().map(|a| a.degrees()),
                commanded_angle_deg: desired.angle.degrees(),
                commanded_speed: desired.speed,
                measured_angle_deg: measured.angle.degrees(),
                measured_speed: measured.speed,
                healthy: module.running_state(),
            };
        }

        let robot_velocity = self.robot_velocity()?;
        let heading = self.gyro_rotation()?;
        Ok(DriveTelemetry {
            timestamp: self.last_timestamp,
            modules,
            pose: self.pose()?.into(),
            raw_estimated_pose: self.raw_estimated_pose().into(),
            robot_velocity,
            field_velocity: robot_velocity.to_field_relative(heading),
            speed: robot_velocity.linear_speed(),
            yaw_deg: heading.degrees(),
            field_relative: self.field_relative,
            throttle: self.throttle,
        })
    }

    /// Per-module health, front-left first
    pub fn health_check(&self) -> [bool; MODULE_COUNT] {
        self.modules.each_ref().map(|m| m.running_state())
    }
}

fn build_module(
    number: usize,
    config: ModuleConfig,
    hardware: ModuleHardware,
) -> Result<SwerveModule> {
    let mut module = SwerveModule::new(
        number,
        config,
        hardware.steer,
        hardware.drive,
        hardware.encoder,
    )?;
    module.reset_to_absolute()?;
    Ok(module)
}

fn read_positions(
    modules: &[SwerveModule; MODULE_COUNT],
) -> Result<[ModulePosition; MODULE_COUNT]> {
    let mut positions = [ModulePosition::default(); MODULE_COUNT];
    for (position, module) in positions.iter_mut().zip(modules) {
        *position = module.position()?;
    }
    Ok(positions)
}
