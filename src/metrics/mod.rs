//! Pose error metrics and summary statistics.

use crate::geometry::CameraPose;
use nalgebra::Rotation3;
use serde::{Deserialize, Serialize};

/// Angle of the relative rotation `R_a^T R_b`, in degrees.
///
/// The cosine is clamped to `[-1, 1]`, so nearly identical rotations whose trace
/// overshoots 3 by rounding still give 0.
pub fn rotation_angle_deg(a: &Rotation3<f64>, b: &Rotation3<f64>) -> f64 {
    let relative = a.matrix().transpose() * b.matrix();
    let cos = ((relative.trace() - 1.0) / 2.0).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

pub fn rotation_error_deg(estimate: &CameraPose, ground_truth: &CameraPose) -> f64 {
    rotation_angle_deg(estimate.rotation(), ground_truth.rotation())
}

/// Distance between camera centers, in scene units.
pub fn translation_error(estimate: &CameraPose, ground_truth: &CameraPose) -> f64 {
    (estimate.camera_center() - ground_truth.camera_center()).norm()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseError {
    pub rotation_deg: f64,
    /// Scene units (meters for 7-Scenes).
    pub translation: f64,
}

impl PoseError {
    pub fn within(&self, max_rotation_deg: f64, max_translation: f64) -> bool {
        self.rotation_deg <= max_rotation_deg && self.translation <= max_translation
    }
}

pub fn pose_error(estimate: &CameraPose, ground_truth: &CameraPose) -> PoseError {
    PoseError {
        rotation_deg: rotation_error_deg(estimate, ground_truth),
        translation: translation_error(estimate, ground_truth),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation.
    pub stddev: f64,
}

impl ErrorStats {
    /// Statistics over `values`; `None` for an empty series.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mean = values.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 1 {
            sorted[count / 2]
        } else {
            0.5 * (sorted[count / 2 - 1] + sorted[count / 2])
        };
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        Some(ErrorStats {
            count,
            mean,
            median,
            min: sorted[0],
            max: sorted[count - 1],
            stddev: variance.sqrt(),
        })
    }

    /// Same statistics with every value multiplied by `factor` (unit conversion).
    pub fn scaled(&self, factor: f64) -> Self {
        ErrorStats {
            count: self.count,
            mean: self.mean * factor,
            median: self.median * factor,
            min: self.min * factor,
            max: self.max * factor,
            stddev: self.stddev * factor.abs(),
        }
    }
}

/// Fraction of frames whose rotation and translation errors are both within bounds.
///
/// The two series are paired index-for-index; 0 for empty input.
pub fn accuracy_within(
    rotation_deg: &[f64],
    translation: &[f64],
    max_rotation_deg: f64,
    max_translation: f64,
) -> f64 {
    let n = rotation_deg.len().min(translation.len());
    if n == 0 {
        return 0.0;
    }
    let hits = rotation_deg
        .iter()
        .zip(translation.iter())
        .filter(|(r, t)| **r <= max_rotation_deg && **t <= max_translation)
        .count();
    hits as f64 / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};

    fn rotations() -> Vec<Rotation3<f64>> {
        vec![
            Rotation3::identity(),
            Rotation3::from_euler_angles(0.1, 0.2, 0.3),
            Rotation3::from_euler_angles(-1.2, 0.4, 2.9),
            Rotation3::from_axis_angle(&Vector3::z_axis(), std::f64::consts::PI),
        ]
    }

    #[test]
    fn test_rotation_error_identity_and_symmetry() {
        for a in rotations() {
            assert!(rotation_angle_deg(&a, &a) < 1e-5);
            for b in rotations() {
                assert_relative_eq!(
                    rotation_angle_deg(&a, &b),
                    rotation_angle_deg(&b, &a),
                    epsilon = 1e-9
                );
            }
        }
        let a = Rotation3::identity();
        let b = Rotation3::from_axis_angle(&Vector3::x_axis(), 10.0_f64.to_radians());
        assert_relative_eq!(rotation_angle_deg(&a, &b), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rotation_error_clamps_overshoot() {
        // Trace slightly above 3 from rounding must not produce NaN.
        let overshoot = Rotation3::from_matrix_unchecked(Matrix3::identity() * (1.0 + 1e-12));
        let error = rotation_angle_deg(&Rotation3::identity(), &overshoot);
        assert!(error.is_finite());
        assert_eq!(error, 0.0);

        let flipped = Rotation3::from_matrix_unchecked(-Matrix3::identity() * (1.0 + 1e-12));
        assert!(rotation_angle_deg(&Rotation3::identity(), &flipped).is_finite());
    }

    #[test]
    fn test_translation_error_uses_camera_centers() {
        let gt = CameraPose::from_camera_to_world(
            Rotation3::from_euler_angles(0.0, 0.5, 0.0),
            Vector3::new(1.0, 2.0, 3.0),
        );
        let est = CameraPose::from_camera_to_world(
            Rotation3::from_euler_angles(0.0, 0.6, 0.0),
            Vector3::new(1.0, 2.0, 3.05),
        );
        let error = pose_error(&est, &gt);
        assert_relative_eq!(error.translation, 0.05, epsilon = 1e-12);
        assert_relative_eq!(error.rotation_deg, 0.1_f64.to_degrees(), epsilon = 1e-9);
        assert!(error.within(6.0, 0.05 + 1e-9));
        assert!(!error.within(5.0, 1.0));
    }

    #[test]
    fn test_error_stats() {
        assert!(ErrorStats::from_values(&[]).is_none());
        let stats = ErrorStats::from_values(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(stats.count, 4);
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert_relative_eq!(stats.stddev, 1.25_f64.sqrt());

        let odd = ErrorStats::from_values(&[5.0, 1.0, 3.0]).unwrap();
        assert_eq!(odd.median, 3.0);
        assert_relative_eq!(odd.scaled(100.0).mean, 300.0);
    }

    #[test]
    fn test_accuracy_within() {
        let rot = [1.0, 6.0, 2.0, 0.5];
        let trans = [0.01, 0.01, 0.2, 0.04];
        assert_relative_eq!(accuracy_within(&rot, &trans, 5.0, 0.05), 0.5);
        assert_eq!(accuracy_within(&[], &[], 5.0, 0.05), 0.0);
    }
}
