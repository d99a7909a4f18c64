// Pose estimator: wheel odometry fused with delayed external pose corrections
//
// Odometry samples are kept for a bounded time window. A correction is blended
// in at the retained sample nearest its capture time and the later odometry is
// replayed on top, so a late measurement still lands where the robot was when
// it was taken.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::{Pose, Rotation};
use crate::kinematics::{MODULE_COUNT, ModulePosition, SwerveKinematics};

/// Default retained odometry history, in seconds
pub const DEFAULT_HISTORY_WINDOW_S: f64 = 1.5;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EstimatorError {
    #[error("No odometry history to align a measurement against")]
    NoHistory,

    #[error("Measurement at {timestamp:.3}s predates retained history (oldest {oldest:.3}s)")]
    MeasurementTooOld { timestamp: f64, oldest: f64 },

    #[error("Measurement contains non-finite values")]
    NonFinite,
}

/// Noise model for the estimator
///
/// Standard deviations are (x meters, y meters, heading radians). Larger state
/// deviations trust corrections more; larger measurement deviations trust them less.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub state_std_devs: [f64; 3],
    pub measurement_std_devs: [f64; 3],
    pub history_window_s: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            state_std_devs: [0.1, 0.1, 0.1],
            measurement_std_devs: [0.9, 0.9, 0.9],
            history_window_s: DEFAULT_HISTORY_WINDOW_S,
        }
    }
}

/// Per-axis steady-state gain for a measurement blended against the state
fn kalman_gains(state_std_devs: [f64; 3], measurement_std_devs: [f64; 3]) -> [f64; 3] {
    std::array::from_fn(|i| {
        let q = state_std_devs[i] * state_std_devs[i];
        let r = measurement_std_devs[i] * measurement_std_devs[i];
        if q == 0.0 { 0.0 } else { q / (q + (q * r).sqrt()) }
    })
}

#[derive(Debug, Clone, Copy)]
struct OdometrySample {
    timestamp: f64,
    gyro: Rotation,
    positions: [ModulePosition; MODULE_COUNT],
    pose: Pose,
}

pub struct PoseEstimator {
    kinematics: SwerveKinematics,
    state_std_devs: [f64; 3],
    gains: [f64; 3],
    history_window_s: f64,
    history: VecDeque<OdometrySample>,
    /// Field heading minus gyro heading
    gyro_offset: Rotation,
    previous_gyro: Rotation,
    previous_positions: [ModulePosition; MODULE_COUNT],
    pose: Pose,
}

impl PoseEstimator {
    pub fn new(
        kinematics: SwerveKinematics,
        config: EstimatorConfig,
        gyro: Rotation,
        positions: [ModulePosition; MODULE_COUNT],
        initial_pose: Pose,
    ) -> Self {
        Self {
            kinematics,
            state_std_devs: config.state_std_devs,
            gains: kalman_gains(config.state_std_devs, config.measurement_std_devs),
            history_window_s: config.history_window_s,
            history: VecDeque::new(),
            gyro_offset: initial_pose.rotation - gyro,
            previous_gyro: gyro,
            previous_positions: positions,
            pose: initial_pose,
        }
    }

    /// Current estimate
    pub fn estimated_pose(&self) -> Pose {
        self.pose
    }

    /// Replace the measurement noise model, e.g. when corrections degrade with distance
    pub fn set_measurement_std_devs(&mut self, measurement_std_devs: [f64; 3]) {
        self.gains = kalman_gains(self.state_std_devs, measurement_std_devs);
    }

    /// Number of retained odometry samples
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Discard history and hard-set the estimate
    pub fn reset_position(
        &mut self,
        gyro: Rotation,
        positions: [ModulePosition; MODULE_COUNT],
        pose: Pose,
    ) {
        self.history.clear();
        self.gyro_offset = pose.rotation - gyro;
        self.previous_gyro = gyro;
        self.previous_positions = positions;
        self.pose = pose;
    }

    /// Integrate one odometry sample and record it
    ///
    /// A clock jump of more than the history window, forward or backward,
    /// discards the history; the pose keeps integrating across it.
    pub fn update(
        &mut self,
        timestamp: f64,
        gyro: Rotation,
        positions: [ModulePosition; MODULE_COUNT],
    ) -> Result<Pose, EstimatorError> {
        if !timestamp.is_finite() {
            return Err(EstimatorError::NonFinite);
        }

        self.pose = self.integrate(
            self.pose,
            self.previous_gyro,
            &self.previous_positions,
            gyro,
            &positions,
        );
        self.previous_gyro = gyro;
        self.previous_positions = positions;

        if let Some(newest) = self.history.back().map(|s| s.timestamp) {
            if (timestamp - newest).abs() > self.history_window_s {
                debug!(
                    "Odometry clock jumped from {:.3}s to {:.3}s, discarding history",
                    newest, timestamp
                );
                self.history.clear();
            }
        }

        // Samples must stay in time order; a repeated or stale stamp replaces the newest
        let mut timestamp = timestamp;
        if let Some(newest) = self.history.back() {
            if timestamp <= newest.timestamp {
                timestamp = newest.timestamp;
                self.history.pop_back();
            }
        }
        self.history.push_back(OdometrySample {
            timestamp,
            gyro,
            positions,
            pose: self.pose,
        });

        while let Some(oldest) = self.history.front() {
            if self.history.len() > 1 && oldest.timestamp < timestamp - self.history_window_s {
                self.history.pop_front();
            } else {
                break;
            }
        }

        Ok(self.pose)
    }

    /// Blend an external pose captured at `timestamp` into the estimate
    ///
    /// Measurements older than the retained history are rejected; measurements
    /// newer than the latest odometry sample are applied at that sample.
    pub fn add_vision_measurement(&mut self, pose: Pose, timestamp: f64) -> Result<(), EstimatorError> {
        if !pose.is_finite() || !timestamp.is_finite() {
            return Err(EstimatorError::NonFinite);
        }
        let oldest = self.history.front().ok_or(EstimatorError::NoHistory)?.timestamp;
        if timestamp < oldest {
            debug!(
                "Rejecting measurement at {:.3}s, oldest retained sample is {:.3}s",
                timestamp, oldest
            );
            return Err(EstimatorError::MeasurementTooOld { timestamp, oldest });
        }

        let index = self.nearest_index(timestamp);
        let sample = self.history[index];
        let correction = sample.pose.log(&pose).scaled(self.gains);
        let corrected = sample.pose.exp(correction);

        self.gyro_offset = corrected.rotation - sample.gyro;
        self.history[index].pose = corrected;

        for i in index + 1..self.history.len() {
            let previous = self.history[i - 1];
            let current = self.history[i];
            self.history[i].pose = self.integrate(
                previous.pose,
                previous.gyro,
                &previous.positions,
                current.gyro,
                &current.positions,
            );
        }

        if let Some(newest) = self.history.back() {
            self.pose = newest.pose;
        }
        Ok(())
    }

    #[cfg(test)]
    fn timestamps(&self) -> Vec<f64> {
        self.history.iter().map(|s| s.timestamp).collect()
    }

    fn nearest_index(&self, timestamp: f64) -> usize {
        let after = self.history.partition_point(|s| s.timestamp < timestamp);
        if after == 0 {
            return 0;
        }
        if after >= self.history.len() {
            return self.history.len() - 1;
        }
        let before_gap = timestamp - self.history[after - 1].timestamp;
        let after_gap = self.history[after].timestamp - timestamp;
        if before_gap <= after_gap { after - 1 } else { after }
    }

    /// Advance `from` by the wheel motion between two samples
    ///
    /// Heading comes from the gyro, only the translation is taken from the wheels.
    fn integrate(
        &self,
        from: Pose,
        from_gyro: Rotation,
        from_positions: &[ModulePosition; MODULE_COUNT],
        to_gyro: Rotation,
        to_positions: &[ModulePosition; MODULE_COUNT],
    ) -> Pose {
        let deltas: [ModulePosition; MODULE_COUNT] = std::array::from_fn(|i| {
            ModulePosition::new(
                to_positions[i].distance - from_positions[i].distance,
                to_positions[i].angle,
            )
        });

        let mut twist = self.kinematics.to_twist(&deltas);
        twist.dtheta = (to_gyro - from_gyro).normalized().radians();

        let moved = from.exp(twist);
        Pose::new(moved.translation, to_gyro + self.gyro_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Translation;
    use approx::assert_abs_diff_eq;

    const DT: f64 = 0.02;

    fn kinematics() -> SwerveKinematics {
        SwerveKinematics::new([
            Translation::new(0.3, 0.3),
            Translation::new(0.3, -0.3),
            Translation::new(-0.3, 0.3),
            Translation::new(-0.3, -0.3),
        ])
        .unwrap()
    }

    fn straight(distance: f64) -> [ModulePosition; MODULE_COUNT] {
        [ModulePosition::new(distance, Rotation::zero()); MODULE_COUNT]
    }

    fn estimator(config: EstimatorConfig) -> PoseEstimator {
        PoseEstimator::new(
            kinematics(),
            config,
            Rotation::zero(),
            straight(0.0),
            Pose::default(),
        )
    }

    /// Drive forward at 1 m/s for `ticks` control periods
    fn drive_forward(estimator: &mut PoseEstimator, ticks: usize) {
        for tick in 1..=ticks {
            let t = tick as f64 * DT;
            estimator.update(t, Rotation::zero(), straight(t)).unwrap();
        }
    }

    #[test]
    fn test_odometry_straight_line() {
        let mut estimator = estimator(EstimatorConfig::default());
        drive_forward(&mut estimator, 50);
        let pose = estimator.estimated_pose();
        assert_abs_diff_eq!(pose.x(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.y(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_heading_follows_gyro() {
        let mut estimator = estimator(EstimatorConfig::default());
        // Wheels report no rotation at all; the gyro says we turned
        estimator
            .update(DT, Rotation::from_degrees(30.0), straight(0.0))
            .unwrap();
        assert_abs_diff_eq!(
            estimator.estimated_pose().rotation.degrees(),
            30.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_reset_position_sets_pose() {
        let mut estimator = estimator(EstimatorConfig::default());
        drive_forward(&mut estimator, 10);

        let target = Pose::from_xy_degrees(3.0, -2.0, 45.0);
        estimator.reset_position(Rotation::from_degrees(10.0), straight(0.2), target);
        let pose = estimator.estimated_pose();
        assert_abs_diff_eq!(pose.x(), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pose.y(), -2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pose.rotation.degrees(), 45.0, epsilon = 1e-9);
        assert_eq!(estimator.history_len(), 0);

        // Heading offset carries through subsequent gyro samples
        estimator
            .update(1.0, Rotation::from_degrees(20.0), straight(0.2))
            .unwrap();
        assert_abs_diff_eq!(
            estimator.estimated_pose().rotation.degrees(),
            55.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_measurement_before_history_rejected() {
        let mut estimator = estimator(EstimatorConfig::default());
        assert_eq!(
            estimator.add_vision_measurement(Pose::default(), 0.0),
            Err(EstimatorError::NoHistory)
        );

        drive_forward(&mut estimator, 10);
        let result = estimator.add_vision_measurement(Pose::default(), 0.001);
        assert!(matches!(result, Err(EstimatorError::MeasurementTooOld { .. })));
    }

    #[test]
    fn test_non_finite_measurement_rejected() {
        let mut estimator = estimator(EstimatorConfig::default());
        drive_forward(&mut estimator, 2);
        let bad = Pose::new(Translation::new(f64::NAN, 0.0), Rotation::zero());
        assert_eq!(
            estimator.add_vision_measurement(bad, DT),
            Err(EstimatorError::NonFinite)
        );
    }

    #[test]
    fn test_full_trust_measurement_snaps_and_replays() {
        // Zero measurement noise: the correction is taken as truth
        let config = EstimatorConfig {
            measurement_std_devs: [0.0; 3],
            ..EstimatorConfig::default()
        };
        let mut estimator = estimator(config);
        drive_forward(&mut estimator, 50);

        // At t = 0.5 s the robot was actually 0.2 m to the left of where odometry thinks
        let measured = Pose::from_xy_degrees(0.5, 0.2, 0.0);
        estimator.add_vision_measurement(measured, 0.5).unwrap();

        // Odometry after 0.5 s (another 0.5 m forward) is replayed on top
        let pose = estimator.estimated_pose();
        assert_abs_diff_eq!(pose.x(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.y(), 0.2, epsilon = 1e-9);
        assert_eq!(estimator.history_len(), 50);
    }

    #[test]
    fn test_partial_trust_moves_toward_measurement() {
        let mut estimator = estimator(EstimatorConfig::default());
        drive_forward(&mut estimator, 50);

        estimator
            .add_vision_measurement(Pose::from_xy_degrees(1.0, 1.0, 0.0), 1.0)
            .unwrap();
        let pose = estimator.estimated_pose();
        // q = 0.01, r = 0.81 -> k = 0.01 / (0.01 + 0.09) = 0.1
        assert_abs_diff_eq!(pose.y(), 0.1, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.x(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_history_bounded_by_window() {
        let config = EstimatorConfig {
            history_window_s: 0.1,
            ..EstimatorConfig::default()
        };
        let mut estimator = estimator(config);
        drive_forward(&mut estimator, 100);
        // Samples from 1.90 s through 2.00 s
        assert!(estimator.history_len() <= 6);
        assert!(estimator.history_len() >= 5);
    }

    #[test]
    fn test_stale_timestamp_replaces_newest() {
        let mut estimator = estimator(EstimatorConfig::default());
        estimator.update(0.1, Rotation::zero(), straight(0.1)).unwrap();
        estimator.update(0.1, Rotation::zero(), straight(0.2)).unwrap();
        assert_eq!(estimator.history_len(), 1);
        assert_abs_diff_eq!(estimator.estimated_pose().x(), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_non_finite_timestamp_rejected() {
        let config = EstimatorConfig {
            history_window_s: 0.1,
            ..EstimatorConfig::default()
        };
        let mut estimator = estimator(config);
        drive_forward(&mut estimator, 5);
        let before = estimator.estimated_pose();

        assert_eq!(
            estimator.update(f64::NAN, Rotation::zero(), straight(1.0)),
            Err(EstimatorError::NonFinite)
        );
        assert_eq!(
            estimator.update(f64::INFINITY, Rotation::zero(), straight(1.0)),
            Err(EstimatorError::NonFinite)
        );
        assert_eq!(estimator.estimated_pose(), before);
        assert_eq!(estimator.history_len(), 5);

        // Trimming keeps working afterwards
        for tick in 6..=100 {
            let t = tick as f64 * DT;
            estimator.update(t, Rotation::zero(), straight(t)).unwrap();
        }
        assert!(estimator.history_len() <= 6);
        assert_abs_diff_eq!(estimator.estimated_pose().x(), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_clock_jump_discards_history() {
        let mut estimator = estimator(EstimatorConfig::default());
        drive_forward(&mut estimator, 10);

        // One sample stamped far in the future
        estimator.update(1e9, Rotation::zero(), straight(0.2)).unwrap();
        assert_eq!(estimator.timestamps(), vec![1e9]);

        // Back on the real clock: history restarts instead of re-stamping to 1e9
        for tick in 11..=60 {
            let t = tick as f64 * DT;
            estimator.update(t, Rotation::zero(), straight(t)).unwrap();
        }
        let timestamps = estimator.timestamps();
        assert_eq!(timestamps.len(), 50);
        assert!(timestamps.iter().all(|&t| t < 2.0));
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));

        estimator
            .add_vision_measurement(Pose::from_xy_degrees(1.0, 0.0, 0.0), 1.0)
            .unwrap();
        assert_abs_diff_eq!(estimator.estimated_pose().x(), 1.2, epsilon = 1e-9);
    }

    #[test]
    fn test_out_of_order_corrections_replay_from_earliest() {
        let mut estimator = estimator(EstimatorConfig::default());
        drive_forward(&mut estimator, 50);
        let before = estimator.timestamps();

        estimator
            .add_vision_measurement(Pose::from_xy_degrees(0.8, 0.3, 0.0), 0.8)
            .unwrap();
        assert_abs_diff_eq!(estimator.estimated_pose().y(), 0.03, epsilon = 1e-9);

        // Older correction arrives late: odometry is replayed from the 0.4 s sample
        estimator
            .add_vision_measurement(Pose::from_xy_degrees(0.4, 0.5, 0.0), 0.4)
            .unwrap();

        let after = estimator.timestamps();
        assert_eq!(after, before);
        assert!(after.windows(2).all(|w| w[0] < w[1]));

        // k = 0.1 moves the 0.4 s sample to (0.4, 0.05); 0.6 m of straight odometry follows
        let pose = estimator.estimated_pose();
        assert_abs_diff_eq!(pose.x(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.y(), 0.05, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.rotation.radians(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_kalman_gains() {
        let gains = kalman_gains([0.1, 0.0, 0.5], [0.9, 0.9, 0.0]);
        assert_abs_diff_eq!(gains[0], 0.1, epsilon = 1e-12);
        assert_eq!(gains[1], 0.0);
        assert_abs_diff_eq!(gains[2], 1.0, epsilon = 1e-12);
    }
}
