//! Camera intrinsics and the pinhole model used by every stage of the refinement loop.
//!
//! Query and render cameras share the same [`Intrinsics`] layout. The refinement
//! core only ever needs the undistorted pinhole model, so [`PinholeModel`] is the
//! single implementation of [`CameraModel`].

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod pinhole;

pub use pinhole::PinholeModel;

/// Focal lengths and principal point of a pinhole camera, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Single-focal intrinsics with the principal point at the image center.
    ///
    /// Dataset calibration files for 7-Scenes and Cambridge Landmarks only carry a
    /// focal length; the principal point is assumed to sit at `(width / 2, height / 2)`.
    pub fn from_focal(focal: f64, resolution: &Resolution) -> Self {
        Intrinsics {
            fx: focal,
            fy: focal,
            cx: resolution.width as f64 / 2.0,
            cy: resolution.height as f64 / 2.0,
        }
    }

    /// Maps a pixel to normalized image coordinates on the `z = 1` plane.
    pub fn normalize(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
        )
    }

    /// Projects a camera-frame point without any image-bounds check.
    ///
    /// Returns `None` when the point lies on or behind the image plane.
    pub fn project_unchecked(&self, point: &Vector3<f64>) -> Option<Vector2<f64>> {
        if point.z < f64::EPSILON.sqrt() {
            return None;
        }
        Some(Vector2::new(
            self.fx * point.x / point.z + self.cx,
            self.fy * point.y / point.z + self.cy,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether a continuous pixel coordinate falls inside the image.
    pub fn contains(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= 0.0
            && pixel.x < self.width as f64
            && pixel.y >= 0.0
            && pixel.y < self.height as f64
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraError {
    #[error("Projection is outside the image")]
    ProjectionOutSideImage,
    #[error("Input point is outside the image")]
    PointIsOutSideImage,
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Depth must be positive and finite, got {0}")]
    InvalidDepth(f64),
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraError::YamlError(err.to_string())
    }
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in camera coordinates to 2D image coordinates
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraError>;

    /// Unproject 2D image coordinates to a unit-length 3D ray
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraError>;

    /// Back-project a pixel with a known z-depth to a camera-frame 3D point
    fn unproject_with_depth(
        &self,
        point_2d: &Vector2<f64>,
        depth: f64,
    ) -> Result<Vector3<f64>, CameraError>;

    /// Load camera parameters from a YAML file
    fn load_from_yaml(path: &str) -> Result<Self, CameraError>
    where
        Self: Sized;

    /// Save camera parameters to a YAML file
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraError>;

    fn get_resolution(&self) -> Resolution;

    fn get_intrinsics(&self) -> Intrinsics;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraError> {
        let positive = |f: f64| f.is_finite() && f > 0.0;
        if !positive(intrinsics.fx) || !positive(intrinsics.fy) {
            return Err(CameraError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_focal_centers_principal_point() {
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        let intrinsics = Intrinsics::from_focal(525.0, &resolution);
        assert_eq!(intrinsics.fx, 525.0);
        assert_eq!(intrinsics.fy, 525.0);
        assert_eq!(intrinsics.cx, 320.0);
        assert_eq!(intrinsics.cy, 240.0);
    }

    #[test]
    fn test_normalize_and_project_are_inverse() {
        let intrinsics = Intrinsics {
            fx: 500.0,
            fy: 480.0,
            cx: 320.0,
            cy: 240.0,
        };
        let pixel = Vector2::new(400.0, 100.0);
        let n = intrinsics.normalize(&pixel);
        let back = intrinsics
            .project_unchecked(&Vector3::new(n.x * 3.0, n.y * 3.0, 3.0))
            .unwrap();
        assert_relative_eq!(back, pixel, epsilon = 1e-9);
        assert!(intrinsics
            .project_unchecked(&Vector3::new(0.0, 0.0, -1.0))
            .is_none());
    }

    #[test]
    fn test_validate_intrinsics_rejects_bad_focal() {
        let intrinsics = Intrinsics {
            fx: 0.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
        };
        assert!(matches!(
            validation::validate_intrinsics(&intrinsics),
            Err(CameraError::FocalLengthMustBePositive)
        ));
        let nan_focal = Intrinsics {
            fx: f64::NAN,
            ..intrinsics
        };
        assert!(validation::validate_intrinsics(&nan_focal).is_err());
    }
}
