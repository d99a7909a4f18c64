// Swerve kinematics for a four-module base
// Converts body-frame velocity screws to per-module (angle, speed) targets and back.

use nalgebra::{SMatrix, SVector};
use serde::{Deserialize, Serialize};

use crate::geometry::{Pose, Rotation, Translation, Twist};

/// Number of swerve modules on the base
pub const MODULE_COUNT: usize = 4;

/// Rotations smaller than this over one period are not corrected
const DISCRETIZE_EPSILON: f64 = 1e-9;

/// Singular values below this are treated as zero when inverting the transform
const RANK_EPSILON: f64 = 1e-9;

#[derive(Debug, thiserror::Error)]
pub enum KinematicsError {
    #[error("Module offsets do not span a full rigid-body transform (rank {rank})")]
    DegenerateLayout { rank: usize },

    #[error("Failed to invert kinematics: {0}")]
    Inversion(&'static str),
}

/// Planar motion intent: vx, vy in m/s and omega in rad/s (CCW positive)
///
/// Whether the linear part is field- or robot-relative is decided by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityScrew {
    pub vx: f64,
    pub vy: f64,
    pub omega: f64,
}

impl VelocityScrew {
    pub const fn new(vx: f64, vy: f64, omega: f64) -> Self {
        Self { vx, vy, omega }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Convert a field-relative screw to the robot frame given the robot heading
    pub fn from_field_relative(self, heading: Rotation) -> Self {
        let linear = Translation::new(self.vx, self.vy).rotate_by(-heading);
        Self::new(linear.x, linear.y, self.omega)
    }

    /// Convert a robot-relative screw to the field frame given the robot heading
    pub fn to_field_relative(self, heading: Rotation) -> Self {
        let linear = Translation::new(self.vx, self.vy).rotate_by(heading);
        Self::new(linear.x, linear.y, self.omega)
    }

    /// Correct for the curvature picked up by holding this screw for `dt` seconds
    ///
    /// The displacement the screw asks for over one period, (vx*dt, vy*dt, omega*dt),
    /// is reached exactly when the returned screw is integrated along an arc.
    pub fn discretize(self, dt: f64) -> Self {
        let theta = self.omega * dt;
        if theta.abs() < DISCRETIZE_EPSILON || dt <= 0.0 {
            return self;
        }

        let desired = Pose::new(
            Translation::new(self.vx * dt, self.vy * dt),
            Rotation::from_radians(theta),
        );
        let twist = Pose::default().log(&desired);
        Self::new(twist.dx / dt, twist.dy / dt, twist.dtheta / dt)
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self::new(self.vx * factor, self.vy * factor, self.omega * factor)
    }

    /// Magnitude of the linear part
    pub fn linear_speed(&self) -> f64 {
        self.vx.hypot(self.vy)
    }

    pub fn is_zero(&self) -> bool {
        self.vx == 0.0 && self.vy == 0.0 && self.omega == 0.0
    }
}

/// Commanded wheel target: steering angle and signed drive speed (m/s)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleState {
    pub angle: Rotation,
    pub speed: f64,
}

impl ModuleState {
    pub const fn new(angle: Rotation, speed: f64) -> Self {
        Self { angle, speed }
    }

    fn from_vector(vx: f64, vy: f64) -> Self {
        let vector = Translation::new(vx, vy);
        Self::new(vector.angle(), vector.norm())
    }
}

/// Measured wheel sample: steering angle and cumulative drive distance (m)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModulePosition {
    pub distance: f64,
    pub angle: Rotation,
}

impl ModulePosition {
    pub const fn new(distance: f64, angle: Rotation) -> Self {
        Self { distance, angle }
    }
}

/// Scale all module speeds down uniformly so none exceeds its limit
///
/// Directions are untouched; when every speed is already within its limit
/// the states are left as they are.
pub fn desaturate(states: &mut [ModuleState; MODULE_COUNT], max_speeds: [f64; MODULE_COUNT]) {
    let ratio = states
        .iter()
        .zip(max_speeds)
        .map(|(state, max)| state.speed.abs() / max)
        .fold(0.0f64, f64::max);

    if ratio > 1.0 {
        for state in states.iter_mut() {
            state.speed /= ratio;
        }
    }
}

/// Linear map between a body screw and the four module velocity vectors
///
/// Row pair i of the inverse matrix maps (vx, vy, omega) to module i's
/// (vx_i, vy_i) = (vx - omega * ry_i, vy + omega * rx_i). The forward matrix is
/// its least-squares pseudo-inverse, computed once.
#[derive(Debug, Clone)]
pub struct SwerveKinematics {
    offsets: [Translation; MODULE_COUNT],
    inverse: SMatrix<f64, 8, 3>,
    forward: SMatrix<f64, 3, 8>,
}

impl SwerveKinematics {
    /// Build from module offsets relative to the robot center (meters)
    pub fn new(offsets: [Translation; MODULE_COUNT]) -> Result<Self, KinematicsError> {
        let mut inverse = SMatrix::<f64, 8, 3>::zeros();
        for (i, offset) in offsets.iter().enumerate() {
            inverse[(2 * i, 0)] = 1.0;
            inverse[(2 * i, 2)] = -offset.y;
            inverse[(2 * i + 1, 1)] = 1.0;
            inverse[(2 * i + 1, 2)] = offset.x;
        }

        let rank = inverse.rank(RANK_EPSILON);
        if rank < 3 {
            return Err(KinematicsError::DegenerateLayout { rank });
        }

        let forward = inverse
            .pseudo_inverse(RANK_EPSILON)
            .map_err(KinematicsError::Inversion)?;

        Ok(Self {
            offsets,
            inverse,
            forward,
        })
    }

    pub fn offsets(&self) -> &[Translation; MODULE_COUNT] {
        &self.offsets
    }

    /// Inverse kinematics: robot-relative screw to module targets
    pub fn to_module_states(&self, screw: VelocityScrew) -> [ModuleState; MODULE_COUNT] {
        let vectors = self.inverse * SVector::<f64, 3>::new(screw.vx, screw.vy, screw.omega);
        std::array::from_fn(|i| ModuleState::from_vector(vectors[2 * i], vectors[2 * i + 1]))
    }

    /// Forward kinematics: module velocities to the robot-relative screw
    pub fn to_screw(&self, states: &[ModuleState; MODULE_COUNT]) -> VelocityScrew {
        let [vx, vy, omega] = self.solve(states.map(|s| (s.speed, s.angle)));
        VelocityScrew::new(vx, vy, omega)
    }

    /// Forward kinematics on module distance deltas, for odometry
    pub fn to_twist(&self, deltas: &[ModulePosition; MODULE_COUNT]) -> Twist {
        let [dx, dy, dtheta] = self.solve(deltas.map(|d| (d.distance, d.angle)));
        Twist::new(dx, dy, dtheta)
    }

    fn solve(&self, polar: [(f64, Rotation); MODULE_COUNT]) -> [f64; 3] {
        let mut vectors = SVector::<f64, 8>::zeros();
        for (i, (magnitude, angle)) in polar.iter().enumerate() {
            vectors[2 * i] = magnitude * angle.cos();
            vectors[2 * i + 1] = magnitude * angle.sin();
        }
        let solved = self.forward * vectors;
        [solved[0], solved[1], solved[2]]
    }
}
