// Planar geometry for the drivetrain
//
// Field frame: X forward (away from the driver station), Y left, CCW positive.
// Angles are stored in radians; degree accessors are provided because the
// steering actuators and the gyro speak degrees.

use std::f64::consts::PI;
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Below this magnitude a rotation is treated as zero in the exp/log maps.
const SMALL_ANGLE: f64 = 1e-9;

/// Wrap an angle in degrees into (-180, 180]
pub fn normalize_degrees(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// Wrap an angle in radians into (-pi, pi]
pub fn normalize_radians(radians: f64) -> f64 {
    let wrapped = radians.rem_euclid(2.0 * PI);
    if wrapped > PI {
        wrapped - 2.0 * PI
    } else {
        wrapped
    }
}

/// A planar heading
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rotation {
    radians: f64,
}

impl Rotation {
    pub const fn from_radians(radians: f64) -> Self {
        Self { radians }
    }

    pub fn from_degrees(degrees: f64) -> Self {
        Self::from_radians(degrees.to_radians())
    }

    pub const fn zero() -> Self {
        Self::from_radians(0.0)
    }

    pub fn radians(&self) -> f64 {
        self.radians
    }

    pub fn degrees(&self) -> f64 {
        self.radians.to_degrees()
    }

    pub fn cos(&self) -> f64 {
        self.radians.cos()
    }

    pub fn sin(&self) -> f64 {
        self.radians.sin()
    }

    /// Same heading wrapped into (-pi, pi]
    pub fn normalized(&self) -> Self {
        Self::from_radians(normalize_radians(self.radians))
    }

    /// Heading of the vector (cos, sin); zero vectors map to zero
    fn from_components(cos: f64, sin: f64) -> Self {
        if cos == 0.0 && sin == 0.0 {
            Self::zero()
        } else {
            Self::from_radians(sin.atan2(cos))
        }
    }
}

impl Add for Rotation {
    type Output = Rotation;

    fn add(self, rhs: Rotation) -> Rotation {
        Rotation::from_radians(self.radians + rhs.radians)
    }
}

impl Sub for Rotation {
    type Output = Rotation;

    fn sub(self, rhs: Rotation) -> Rotation {
        Rotation::from_radians(self.radians - rhs.radians)
    }
}

impl Neg for Rotation {
    type Output = Rotation;

    fn neg(self) -> Rotation {
        Rotation::from_radians(-self.radians)
    }
}

/// A point or displacement in the plane, in meters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub x: f64,
    pub y: f64,
}

impl Translation {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn from_polar(distance: f64, angle: Rotation) -> Self {
        Self::new(distance * angle.cos(), distance * angle.sin())
    }

    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn distance(&self, other: Translation) -> f64 {
        (other - *self).norm()
    }

    /// Direction of this vector from the origin
    pub fn angle(&self) -> Rotation {
        Rotation::from_components(self.x, self.y)
    }

    pub fn rotate_by(&self, rotation: Rotation) -> Self {
        let (sin, cos) = rotation.radians().sin_cos();
        Self::new(self.x * cos - self.y * sin, self.x * sin + self.y * cos)
    }

    /// Closest candidate by euclidean distance, `None` for an empty slice
    pub fn nearest(&self, candidates: &[Translation]) -> Option<Translation> {
        candidates
            .iter()
            .copied()
            .min_by(|a, b| self.distance(*a).total_cmp(&self.distance(*b)))
    }
}

impl Add for Translation {
    type Output = Translation;

    fn add(self, rhs: Translation) -> Translation {
        Translation::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Translation {
    type Output = Translation;

    fn sub(self, rhs: Translation) -> Translation {
        Translation::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Translation {
    type Output = Translation;

    fn mul(self, rhs: f64) -> Translation {
        Translation::new(self.x * rhs, self.y * rhs)
    }
}

/// A change in pose along an arc, expressed in the starting pose's frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Twist {
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
}

impl Twist {
    pub const fn new(dx: f64, dy: f64, dtheta: f64) -> Self {
        Self { dx, dy, dtheta }
    }

    /// Componentwise scaling, used for Kalman-gain weighting
    pub fn scaled(&self, gains: [f64; 3]) -> Self {
        Self::new(
            self.dx * gains[0],
            self.dy * gains[1],
            self.dtheta * gains[2],
        )
    }
}

/// Robot position and heading on the field
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub translation: Translation,
    pub rotation: Rotation,
}

impl Pose {
    pub const fn new(translation: Translation, rotation: Rotation) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn from_xy_degrees(x: f64, y: f64, heading_deg: f64) -> Self {
        Self::new(Translation::new(x, y), Rotation::from_degrees(heading_deg))
    }

    pub fn x(&self) -> f64 {
        self.translation.x
    }

    pub fn y(&self) -> f64 {
        self.translation.y
    }

    pub fn is_finite(&self) -> bool {
        self.translation.x.is_finite()
            && self.translation.y.is_finite()
            && self.rotation.radians().is_finite()
    }

    /// Apply a displacement expressed in this pose's frame
    pub fn transform_by(&self, translation: Translation, rotation: Rotation) -> Self {
        Self::new(
            self.translation + translation.rotate_by(self.rotation),
            self.rotation + rotation,
        )
    }

    /// Express `other` in this pose's frame
    pub fn relative_to(&self, other: &Pose) -> Pose {
        Pose::new(
            (other.translation - self.translation).rotate_by(-self.rotation),
            other.rotation - self.rotation,
        )
    }

    /// Follow `twist` along a constant-curvature arc from this pose
    pub fn exp(&self, twist: Twist) -> Pose {
        let Twist { dx, dy, dtheta } = twist;
        let (sin_theta, cos_theta) = dtheta.sin_cos();

        let (s, c) = if dtheta.abs() < SMALL_ANGLE {
            (1.0 - dtheta * dtheta / 6.0, 0.5 * dtheta)
        } else {
            (sin_theta / dtheta, (1.0 - cos_theta) / dtheta)
        };

        let translation = Translation::new(dx * s - dy * c, dx * c + dy * s);
        self.transform_by(translation, Rotation::from_components(cos_theta, sin_theta))
    }

    /// The twist that takes this pose to `end` along a constant-curvature arc
    pub fn log(&self, end: &Pose) -> Twist {
        let transform = self.relative_to(end);
        let dtheta = transform.rotation.normalized().radians();
        let half_dtheta = dtheta / 2.0;
        let cos_minus_one = dtheta.cos() - 1.0;

        let half_theta_by_tan = if cos_minus_one.abs() < SMALL_ANGLE {
            1.0 - dtheta * dtheta / 12.0
        } else {
            -(half_dtheta * dtheta.sin()) / cos_minus_one
        };

        let translation = transform
            .translation
            .rotate_by(Rotation::from_components(half_theta_by_tan, -half_dtheta))
            * half_theta_by_tan.hypot(half_dtheta);

        Twist::new(translation.x, translation.y, dtheta)
    }

    /// Closest candidate by distance, ties broken by heading difference
    pub fn nearest(&self, candidates: &[Pose]) -> Option<Pose> {
        candidates.iter().copied().min_by(|a, b| {
            let da = self.translation.distance(a.translation);
            let db = self.translation.distance(b.translation);
            da.total_cmp(&db).then_with(|| {
                let ra = (a.rotation - self.rotation).normalized().radians().abs();
                let rb = (b.rotation - self.rotation).normalized().radians().abs();
                ra.total_cmp(&rb)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_normalize_degrees_range() {
        assert_eq!(normalize_degrees(180.0), 180.0);
        assert_eq!(normalize_degrees(-180.0), 180.0);
        assert_eq!(normalize_degrees(270.0), -90.0);
        assert_eq!(normalize_degrees(-450.0), -90.0);
        assert_eq!(normalize_degrees(0.0), 0.0);
    }

    #[test]
    fn test_exp_straight_line() {
        let start = Pose::from_xy_degrees(1.0, 1.0, 90.0);
        let end = start.exp(Twist::new(2.0, 0.0, 0.0));
        // Forward in a pose facing +Y moves along +Y
        assert_abs_diff_eq!(end.x(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(end.y(), 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_exp_quarter_circle() {
        // Arc of radius 1 through a quarter turn
        let end = Pose::default().exp(Twist::new(FRAC_PI_2, 0.0, FRAC_PI_2));
        assert_abs_diff_eq!(end.x(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(end.y(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(end.rotation.radians(), FRAC_PI_2, epsilon = 1e-9);
    }

    #[test]
    fn test_log_inverts_exp() {
        let start = Pose::from_xy_degrees(0.5, -2.0, 30.0);
        let twist = Twist::new(0.7, -0.3, 0.9);
        let recovered = start.log(&start.exp(twist));
        assert_abs_diff_eq!(recovered.dx, twist.dx, epsilon = 1e-9);
        assert_abs_diff_eq!(recovered.dy, twist.dy, epsilon = 1e-9);
        assert_abs_diff_eq!(recovered.dtheta, twist.dtheta, epsilon = 1e-9);
    }

    #[test]
    fn test_nearest() {
        let here = Pose::from_xy_degrees(0.0, 0.0, 0.0);
        let poses = [
            Pose::from_xy_degrees(3.0, 0.0, 0.0),
            Pose::from_xy_degrees(1.0, 0.0, 170.0),
            Pose::from_xy_degrees(0.0, 1.0, 10.0),
        ];
        assert_eq!(here.nearest(&poses), Some(poses[2]));
        assert_eq!(here.nearest(&[]), None);

        let origin = Translation::default();
        let points = [Translation::new(2.0, 2.0), Translation::new(-1.0, 0.5)];
        assert_eq!(origin.nearest(&points), Some(points[1]));
    }
}
