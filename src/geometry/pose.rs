//! Rigid camera poses.
//!
//! [`CameraPose`] always stores the **world-to-camera** transform:
//! `x_cam = R * x_world + t`. Camera-to-world data (dataset pose files, scene
//! coordinate regressors, some PnP back-ends) is converted at construction time
//! through [`CameraPose::from_camera_to_world`] or
//! [`CameraPose::from_camera_to_world_matrix4`], never at the call sites.

use nalgebra::{Matrix3, Matrix4, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Matrix contains non-finite values")]
    NonFinite,
    #[error("Rotation block is not a proper rotation (det = {0})")]
    NotARotation(f64),
    #[error("Last row of a rigid transform must be [0, 0, 0, 1]")]
    NotRigid,
}

/// Projects an almost-orthonormal matrix onto SO(3).
///
/// Returns `None` for non-finite input or when the closest orthonormal matrix is a
/// reflection, which means the input was not a rotation to begin with.
pub fn orthonormalize(m: &Matrix3<f64>) -> Option<Rotation3<f64>> {
    if m.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let svd = m.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let r = u * v_t;
    if r.determinant() <= 0.0 {
        return None;
    }
    Some(Rotation3::from_matrix_unchecked(r))
}

/// A world-to-camera rigid transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[[f64; 4]; 4]", into = "[[f64; 4]; 4]")]
pub struct CameraPose {
    rotation: Rotation3<f64>,
    translation: Vector3<f64>,
}

impl Default for CameraPose {
    fn default() -> Self {
        Self::identity()
    }
}

impl CameraPose {
    pub fn identity() -> Self {
        CameraPose {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Builds a pose from a world-to-camera rotation and translation.
    pub fn from_world_to_camera(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        // Rotation3 can be built unchecked; re-project so det(R) = +1 survives conversions.
        let rotation = orthonormalize(rotation.matrix()).unwrap_or(rotation);
        CameraPose {
            rotation,
            translation,
        }
    }

    /// Builds a pose from the camera orientation in the world (`R_wc`) and the camera center.
    pub fn from_camera_to_world(rotation_c2w: Rotation3<f64>, center: Vector3<f64>) -> Self {
        let rotation = rotation_c2w.inverse();
        let translation = -(rotation * center);
        Self::from_world_to_camera(rotation, translation)
    }

    /// Builds a world-to-camera pose from a raw rotation matrix, re-orthonormalizing it.
    pub fn try_from_parts(
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> Result<Self, GeometryError> {
        if translation.iter().any(|v| !v.is_finite()) {
            return Err(GeometryError::NonFinite);
        }
        let rotation = orthonormalize(rotation).ok_or_else(|| {
            let det = rotation.determinant();
            if det.is_finite() {
                GeometryError::NotARotation(det)
            } else {
                GeometryError::NonFinite
            }
        })?;
        Ok(CameraPose {
            rotation,
            translation: *translation,
        })
    }

    /// Parses a 4x4 world-to-camera matrix.
    pub fn from_matrix4(m: &Matrix4<f64>) -> Result<Self, GeometryError> {
        let (rotation, translation) = split_rigid(m)?;
        Self::try_from_parts(&rotation, &translation)
    }

    /// Parses a 4x4 camera-to-world matrix (the layout of 7-Scenes pose files).
    pub fn from_camera_to_world_matrix4(m: &Matrix4<f64>) -> Result<Self, GeometryError> {
        let (rotation, center) = split_rigid(m)?;
        let rotation_c2w = orthonormalize(&rotation)
            .ok_or_else(|| GeometryError::NotARotation(rotation.determinant()))?;
        Ok(Self::from_camera_to_world(rotation_c2w, center))
    }

    /// World-to-camera rotation `R`.
    pub fn rotation(&self) -> &Rotation3<f64> {
        &self.rotation
    }

    /// World-to-camera translation `t`.
    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// Camera orientation expressed in the world frame (`R^T`).
    pub fn camera_to_world_rotation(&self) -> Rotation3<f64> {
        self.rotation.inverse()
    }

    /// Camera center in world coordinates (`-R^T t`).
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    pub fn to_matrix4(&self) -> Matrix4<f64> {
        compose_rigid(self.rotation.matrix(), &self.translation)
    }

    pub fn camera_to_world_matrix4(&self) -> Matrix4<f64> {
        compose_rigid(
            self.camera_to_world_rotation().matrix(),
            &self.camera_center(),
        )
    }

    /// Maps a world point into the camera frame.
    pub fn transform_point(&self, world: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * world + self.translation
    }

    /// Maps a camera-frame point into the world frame.
    pub fn inverse_transform_point(&self, camera: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * (camera - self.translation)
    }

    /// Returns a copy whose camera orientation is rotated by `axis_angle` (in the camera
    /// frame) and whose center is shifted by `center_offset` (in the world frame).
    ///
    /// The rotation error to the original pose equals `|axis_angle|` and the camera
    /// center moves by exactly `|center_offset|`.
    pub fn perturbed(&self, axis_angle: &Vector3<f64>, center_offset: &Vector3<f64>) -> Self {
        let rotation_c2w =
            self.camera_to_world_rotation() * Rotation3::from_scaled_axis(*axis_angle);
        Self::from_camera_to_world(rotation_c2w, self.camera_center() + center_offset)
    }
}

fn split_rigid(m: &Matrix4<f64>) -> Result<(Matrix3<f64>, Vector3<f64>), GeometryError> {
    if m.iter().any(|v| !v.is_finite()) {
        return Err(GeometryError::NonFinite);
    }
    let last = m.row(3);
    if last[0].abs() > 1e-9 || last[1].abs() > 1e-9 || last[2].abs() > 1e-9 {
        return Err(GeometryError::NotRigid);
    }
    if (last[3] - 1.0).abs() > 1e-9 {
        return Err(GeometryError::NotRigid);
    }
    let rotation = m.fixed_view::<3, 3>(0, 0).into_owned();
    let translation = m.fixed_view::<3, 1>(0, 3).into_owned();
    Ok((rotation, translation))
}

fn compose_rigid(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    m
}

impl From<CameraPose> for [[f64; 4]; 4] {
    fn from(pose: CameraPose) -> Self {
        let m = pose.to_matrix4();
        let mut rows = [[0.0; 4]; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = m[(r, c)];
            }
        }
        rows
    }
}

impl TryFrom<[[f64; 4]; 4]> for CameraPose {
    type Error = GeometryError;

    fn try_from(rows: [[f64; 4]; 4]) -> Result<Self, Self::Error> {
        let m = Matrix4::from_fn(|r, c| rows[r][c]);
        CameraPose::from_matrix4(&m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> CameraPose {
        CameraPose::from_world_to_camera(
            Rotation3::from_euler_angles(0.3, -0.2, 0.9),
            Vector3::new(0.5, -1.0, 2.0),
        )
    }

    #[test]
    fn test_camera_to_world_round_trip() {
        let pose = sample_pose();
        let rebuilt =
            CameraPose::from_camera_to_world(pose.camera_to_world_rotation(), pose.camera_center());
        assert_relative_eq!(rebuilt.to_matrix4(), pose.to_matrix4(), epsilon = 1e-12);

        let c2w = pose.camera_to_world_matrix4();
        assert_relative_eq!(
            c2w * pose.to_matrix4(),
            Matrix4::identity(),
            epsilon = 1e-12
        );
        let parsed = CameraPose::from_camera_to_world_matrix4(&c2w).unwrap();
        assert_relative_eq!(parsed.to_matrix4(), pose.to_matrix4(), epsilon = 1e-12);
    }

    #[test]
    fn test_camera_center_maps_to_origin() {
        let pose = sample_pose();
        let center = pose.camera_center();
        assert_relative_eq!(pose.transform_point(&center), Vector3::zeros(), epsilon = 1e-12);

        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(
            pose.inverse_transform_point(&pose.transform_point(&p)),
            p,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_rotation_stays_orthonormal() {
        let noisy = Rotation3::from_euler_angles(0.1, 0.2, 0.3).matrix() * 1.0001;
        let pose = CameraPose::try_from_parts(&noisy, &Vector3::zeros()).unwrap();
        let r = pose.rotation().matrix();
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(r.transpose() * r, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_rejects_reflections_and_non_rigid() {
        let reflection = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0));
        assert!(matches!(
            CameraPose::try_from_parts(&reflection, &Vector3::zeros()),
            Err(GeometryError::NotARotation(_))
        ));

        let mut m = Matrix4::identity();
        m[(3, 0)] = 0.5;
        assert_eq!(CameraPose::from_matrix4(&m), Err(GeometryError::NotRigid));

        m = Matrix4::identity();
        m[(0, 3)] = f64::NAN;
        assert_eq!(CameraPose::from_matrix4(&m), Err(GeometryError::NonFinite));
    }

    #[test]
    fn test_perturbation_magnitudes() {
        let pose = sample_pose();
        let delta = Vector3::new(0.0, 2.0_f64.to_radians(), 0.0);
        let offset = Vector3::new(0.03, 0.0, -0.04);
        let moved = pose.perturbed(&delta, &offset);

        let relative = pose.rotation().inverse() * moved.rotation();
        assert_relative_eq!(relative.angle(), delta.norm(), epsilon = 1e-12);
        assert_relative_eq!(
            (moved.camera_center() - pose.camera_center()).norm(),
            0.05,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_serde_as_row_major_matrix() {
        let pose = sample_pose();
        let json = serde_json::to_string(&pose).unwrap();
        let parsed: CameraPose = serde_json::from_str(&json).unwrap();
        assert_relative_eq!(parsed.to_matrix4(), pose.to_matrix4(), epsilon = 1e-12);

        let rows: Vec<Vec<f64>> = serde_json::from_str(&json).unwrap();
        assert_eq!(rows.len(), 4);
        assert_relative_eq!(rows[0][3], pose.translation().x, epsilon = 1e-12);
    }
}
