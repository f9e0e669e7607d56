//! Implements the Pinhole camera model.
//!
//! This module provides the [`PinholeModel`] struct used for both the query camera
//! and the render camera. It adheres to the [`CameraModel`] trait defined in the
//! parent `camera` module ([`crate::camera`]). Besides the usual ray unprojection it
//! supports depth back-projection, which is what lifts rendered pixels to 3D.

use crate::camera::{validation, CameraError, CameraModel, Intrinsics, Resolution};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use yaml_rust::YamlLoader;

/// Represents a Pinhole camera model.
///
/// This struct holds the intrinsic parameters (focal length, principal point)
/// and image resolution for a pinhole camera. It assumes no lens distortion.
///
/// # Examples
///
/// ```rust
/// use reloc_refine::camera::{Intrinsics, PinholeModel, Resolution};
///
/// let model = PinholeModel::new(
///     Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 },
///     Resolution { width: 640, height: 480 },
/// )
/// .unwrap();
///
/// assert_eq!(model.intrinsics.fx, 500.0);
/// assert_eq!(model.resolution.width, 640);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinholeModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
}

impl PinholeModel {
    /// Creates a new [`PinholeModel`] and validates its parameters.
    ///
    /// # Errors
    ///
    /// * [`CameraError::FocalLengthMustBePositive`]
    /// * [`CameraError::PrincipalPointMustBeFinite`]
    pub fn new(intrinsics: Intrinsics, resolution: Resolution) -> Result<Self, CameraError> {
        let model = PinholeModel {
            intrinsics,
            resolution,
        };

        model.validate_params()?;

        Ok(model)
    }
}

impl CameraModel for PinholeModel {
    /// Projects a 3D point from camera coordinates to 2D image coordinates.
    ///
    /// `u = fx * X / Z + cx`, `v = fy * Y / Z + cy`
    ///
    /// # Errors
    ///
    /// * [`CameraError::PointAtCameraCenter`]: If the 3D point's Z-coordinate is too close to zero.
    /// * [`CameraError::ProjectionOutSideImage`]: If the projected point falls outside the resolution.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraError> {
        let pixel = self
            .intrinsics
            .project_unchecked(point_3d)
            .ok_or(CameraError::PointAtCameraCenter)?;

        if !self.resolution.contains(&pixel) {
            return Err(CameraError::ProjectionOutSideImage);
        }

        Ok(pixel)
    }

    /// Unprojects a 2D image point to a normalized 3D ray in camera coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraError::PointIsOutSideImage`]: If the input 2D point is outside the camera's resolution.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraError> {
        if !self.resolution.contains(point_2d) {
            return Err(CameraError::PointIsOutSideImage);
        }

        let m = self.intrinsics.normalize(point_2d);
        Ok(Vector3::new(m.x, m.y, 1.0).normalize())
    }

    /// Back-projects a pixel with z-depth to a camera-frame point.
    ///
    /// `X = (u - cx) * depth / fx`, `Y = (v - cy) * depth / fy`, `Z = depth`.
    /// Pixels outside the image are still accepted: render-side coordinates may sit
    /// on the half-pixel border after sub-pixel refinement.
    ///
    /// # Errors
    ///
    /// * [`CameraError::InvalidDepth`]: If `depth` is non-positive or not finite.
    fn unproject_with_depth(
        &self,
        point_2d: &Vector2<f64>,
        depth: f64,
    ) -> Result<Vector3<f64>, CameraError> {
        if !depth.is_finite() || depth <= 0.0 {
            return Err(CameraError::InvalidDepth(depth));
        }

        let m = self.intrinsics.normalize(point_2d);
        Ok(Vector3::new(m.x * depth, m.y * depth, depth))
    }

    /// Loads camera parameters from a YAML file.
    ///
    /// The expected layout is `cam0: { intrinsics: [fx, fy, cx, cy], resolution: [w, h] }`.
    ///
    /// # Errors
    ///
    /// * [`CameraError::IOError`] when the file cannot be read.
    /// * [`CameraError::YamlError`] for malformed YAML.
    /// * [`CameraError::InvalidParams`] when a field is missing or mistyped.
    fn load_from_yaml(path: &str) -> Result<Self, CameraError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs
            .first()
            .ok_or_else(|| CameraError::YamlError(format!("{path} is empty")))?;

        let intrinsics_yaml = doc["cam0"]["intrinsics"].as_vec().ok_or_else(|| {
            CameraError::InvalidParams("YAML missing 'intrinsics' or not an array".to_string())
        })?;
        let resolution_yaml = doc["cam0"]["resolution"].as_vec().ok_or_else(|| {
            CameraError::InvalidParams("YAML missing 'resolution' or not an array".to_string())
        })?;

        if intrinsics_yaml.len() < 4 || resolution_yaml.len() < 2 {
            return Err(CameraError::InvalidParams(
                "'intrinsics' needs 4 values and 'resolution' needs 2".to_string(),
            ));
        }

        let float = |idx: usize, name: &str| {
            let value = &intrinsics_yaml[idx];
            value
                .as_f64()
                .or_else(|| value.as_i64().map(|v| v as f64))
                .ok_or_else(|| CameraError::InvalidParams(format!("Invalid {name}: not a float")))
        };
        let intrinsics = Intrinsics {
            fx: float(0, "fx")?,
            fy: float(1, "fy")?,
            cx: float(2, "cx")?,
            cy: float(3, "cy")?,
        };

        let dimension = |idx: usize, name: &str| {
            let value = resolution_yaml[idx].as_i64().ok_or_else(|| {
                CameraError::InvalidParams(format!("Invalid {name}: not an integer"))
            })?;
            u32::try_from(value).map_err(|_| {
                CameraError::InvalidParams(format!("Invalid {name}: {value} is out of range"))
            })
        };
        let resolution = Resolution {
            width: dimension(0, "width")?,
            height: dimension(1, "height")?,
        };

        PinholeModel::new(intrinsics, resolution)
    }

    /// Saves the camera model's parameters to a YAML file readable by
    /// [`PinholeModel::load_from_yaml()`].
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraError> {
        let yaml = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::String("cam0".to_string()),
            serde_yaml::to_value(serde_yaml::Mapping::from_iter([
                (
                    serde_yaml::Value::String("camera_model".to_string()),
                    serde_yaml::Value::String("pinhole".to_string()),
                ),
                (
                    serde_yaml::Value::String("intrinsics".to_string()),
                    serde_yaml::to_value(vec![
                        self.intrinsics.fx,
                        self.intrinsics.fy,
                        self.intrinsics.cx,
                        self.intrinsics.cy,
                    ])
                    .map_err(|e| CameraError::YamlError(e.to_string()))?,
                ),
                (
                    serde_yaml::Value::String("resolution".to_string()),
                    serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])
                        .map_err(|e| CameraError::YamlError(e.to_string()))?,
                ),
            ]))
            .map_err(|e| CameraError::YamlError(e.to_string()))?,
        )]))
        .map_err(|e| CameraError::YamlError(e.to_string()))?;

        let yaml_string =
            serde_yaml::to_string(&yaml).map_err(|e| CameraError::YamlError(e.to_string()))?;

        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;

        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(CameraError::InvalidParams(
                "Resolution must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }
}

/// Contains unit tests for the Pinhole camera model.
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pinhole_load_from_yaml() {
        let path = "samples/pinhole.yaml";
        let model = PinholeModel::load_from_yaml(path).unwrap();

        assert_eq!(model.intrinsics.fx, 525.0);
        assert_eq!(model.intrinsics.fy, 525.0);
        assert_eq!(model.intrinsics.cx, 320.0);
        assert_eq!(model.intrinsics.cy, 240.0);
        assert_eq!(model.resolution.width, 640);
        assert_eq!(model.resolution.height, 480);
    }

    #[test]
    fn test_pinhole_save_then_load() {
        let model = PinholeModel::load_from_yaml("samples/pinhole.yaml").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.yaml");
        let path = path.to_str().unwrap();

        model.save_to_yaml(path).unwrap();
        let reloaded = PinholeModel::load_from_yaml(path).unwrap();
        assert_eq!(model, reloaded);
    }

    #[test]
    fn test_pinhole_rejects_out_of_range_resolution() {
        let dir = tempfile::tempdir().unwrap();
        for resolution in ["[-640, 480]", "[640, 4294967296]"] {
            let path = dir.path().join("camera.yaml");
            std::fs::write(
                &path,
                format!("cam0:\n  intrinsics: [500.0, 500.0, 320.0, 240.0]\n  resolution: {resolution}\n"),
            )
            .unwrap();
            assert!(matches!(
                PinholeModel::load_from_yaml(path.to_str().unwrap()),
                Err(CameraError::InvalidParams(_))
            ));
        }
    }

    #[test]
    fn test_pinhole_project_unproject() {
        let model = PinholeModel::load_from_yaml("samples/pinhole.yaml").unwrap();

        let point_3d = Vector3::new(0.3, -0.2, 2.0);
        let norm_3d = point_3d.normalize();

        let point_2d = model.project(&point_3d).unwrap();
        let ray = model.unproject(&point_2d).unwrap();
        assert_relative_eq!(ray, norm_3d, epsilon = 1e-9);

        let lifted = model.unproject_with_depth(&point_2d, point_3d.z).unwrap();
        assert_relative_eq!(lifted, point_3d, epsilon = 1e-9);
    }

    #[test]
    fn test_pinhole_rejects_invalid_depth() {
        let model = PinholeModel::load_from_yaml("samples/pinhole.yaml").unwrap();
        let pixel = Vector2::new(100.0, 100.0);
        for depth in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                model.unproject_with_depth(&pixel, depth),
                Err(CameraError::InvalidDepth(_))
            ));
        }
    }

    #[test]
    fn test_pinhole_projection_outside_image() {
        let model = PinholeModel::load_from_yaml("samples/pinhole.yaml").unwrap();
        assert!(matches!(
            model.project(&Vector3::new(10.0, 0.0, 1.0)),
            Err(CameraError::ProjectionOutSideImage)
        ));
        assert!(matches!(
            model.project(&Vector3::new(0.0, 0.0, 0.0)),
            Err(CameraError::PointAtCameraCenter)
        ));
    }
}
