//! Linear PnP on bearing vectors.
//!
//! Image points are lifted to normalized coordinates and world points are
//! Hartley-normalized before the direct linear transform; inliers are scored by
//! the angle between observed and predicted rays. The linear back-end reports
//! the camera orientation and center in the world frame, which is converted to
//! the world-to-camera convention before leaving this module. Coplanar point sets
//! go through a plane homography instead of the full projection matrix.

use super::ransac::{ransac_fit, Estimator, RansacOptions};
use super::{check_input, rmse, PnpSolution, PoseSolver, PrincipalAxes, SolverError};
use crate::camera::Intrinsics;
use crate::geometry::{orthonormalize, CameraPose};
use log::debug;
use nalgebra::{DMatrix, Matrix3, Rotation3, UnitQuaternion, Vector2, Vector3};

/// Camera placement as produced by the linear back-end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraToWorld {
    pub orientation: UnitQuaternion<f64>,
    pub center: Vector3<f64>,
}

impl From<CameraToWorld> for CameraPose {
    fn from(c2w: CameraToWorld) -> Self {
        CameraPose::from_camera_to_world(c2w.orientation.to_rotation_matrix(), c2w.center)
    }
}

/// Centroid and isotropic scale mapping points to mean distance `sqrt(3)`.
fn hartley(points: &[Vector3<f64>]) -> Option<(Vector3<f64>, f64)> {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector3<f64>>() / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }
    Some((centroid, 3.0_f64.sqrt() / mean_dist))
}

/// Pose from the homography between the points' plane and the image.
fn planar_camera_to_world(
    world: &[Vector3<f64>],
    normalized: &[Vector2<f64>],
    principal: &PrincipalAxes,
) -> Result<CameraToWorld, SolverError> {
    let (e1, e2) = (principal.axis(0), principal.axis(1));
    let plane: Vec<Vector2<f64>> = world
        .iter()
        .map(|p| {
            let d = p - principal.centroid;
            Vector2::new(e1.dot(&d), e2.dot(&d))
        })
        .collect();
    let n = plane.len();
    let mean_dist = plane.iter().map(|q| q.norm()).sum::<f64>() / n as f64;
    if mean_dist <= f64::EPSILON {
        return Err(SolverError::Degenerate("world points coincide".to_string()));
    }
    let scale = 2.0_f64.sqrt() / mean_dist;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (q, uv)) in plane.iter().zip(normalized.iter()).enumerate() {
        let q = q * scale;
        let (r0, r1) = (2 * i, 2 * i + 1);
        for (c, value) in [q.x, q.y, 1.0].into_iter().enumerate() {
            a[(r0, c)] = value;
            a[(r0, 6 + c)] = -uv.x * value;
            a[(r1, 3 + c)] = value;
            a[(r1, 6 + c)] = -uv.y * value;
        }
    }
    let ata = a.transpose() * &a;
    let eig = ata.symmetric_eigen();
    let h = eig.eigenvectors.column(eig.eigenvalues.imin()).into_owned();
    let h = Matrix3::from_fn(|r, c| h[3 * r + c]);

    // H ~ [r1 / s, r2 / s, t]; the plane origin must be in front of the camera.
    let (g1, g2) = (h.column(0) * scale, h.column(1) * scale);
    let lambda = 0.5 * (g1.norm() + g2.norm());
    if lambda <= f64::EPSILON {
        return Err(SolverError::Degenerate(
            "rank-deficient homography".to_string(),
        ));
    }
    let sign = if h[(2, 2)] < 0.0 { -1.0 } else { 1.0 };
    let r1 = g1 * (sign / lambda);
    let r2 = g2 * (sign / lambda);
    let t = h.column(2) * (sign / lambda);
    let in_plane = orthonormalize(&Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]))
        .ok_or_else(|| SolverError::Numerical("homography rotation is singular".to_string()))?;

    // World -> plane frame is A^T (p - centroid) with A = [e1 e2 e1 x e2].
    let frame = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[e1, e2, e1.cross(&e2)]));
    let rotation = in_plane * frame.inverse();
    let translation = t - rotation * principal.centroid;

    let rotation_c2w = rotation.inverse();
    Ok(CameraToWorld {
        orientation: UnitQuaternion::from_rotation_matrix(&rotation_c2w),
        center: -(rotation_c2w * translation),
    })
}

/// DLT on normalized image coordinates; needs six or more points, not all on a line.
pub fn dlt_camera_to_world(
    world: &[Vector3<f64>],
    normalized: &[Vector2<f64>],
) -> Result<CameraToWorld, SolverError> {
    let n = world.len();
    if n < 6 || normalized.len() != n {
        return Err(SolverError::InsufficientData {
            required: 6,
            found: n.min(normalized.len()),
        });
    }
    let principal = PrincipalAxes::new(world)
        .ok_or_else(|| SolverError::Degenerate("world points coincide".to_string()))?;
    if principal.is_collinear() {
        return Err(SolverError::Degenerate(
            "world points are collinear".to_string(),
        ));
    }
    if principal.is_planar() {
        return planar_camera_to_world(world, normalized, &principal);
    }
    let (centroid, scale) = hartley(world)
        .ok_or_else(|| SolverError::Degenerate("world points coincide".to_string()))?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (pw, uv)) in world.iter().zip(normalized.iter()).enumerate() {
        let p = (pw - centroid) * scale;
        let (r0, r1) = (2 * i, 2 * i + 1);
        for (c, value) in [p.x, p.y, p.z, 1.0].into_iter().enumerate() {
            a[(r0, c)] = value;
            a[(r0, 8 + c)] = -uv.x * value;
            a[(r1, 4 + c)] = value;
            a[(r1, 8 + c)] = -uv.y * value;
        }
    }

    let ata = a.transpose() * &a;
    let eig = ata.symmetric_eigen();
    let p = eig.eigenvectors.column(eig.eigenvalues.imin()).into_owned();

    let mut m = Matrix3::from_fn(|r, c| p[4 * r + c]);
    let mut t = Vector3::new(p[3], p[7], p[11]);
    // P is defined up to sign; a proper rotation block puts the scene in front.
    if m.determinant() < 0.0 {
        m = -m;
        t = -t;
    }
    let row_scale = (m.row(0).norm() + m.row(1).norm() + m.row(2).norm()) / 3.0;
    if row_scale <= f64::EPSILON {
        return Err(SolverError::Degenerate(
            "rank-deficient DLT system".to_string(),
        ));
    }
    let rotation = orthonormalize(&(m / row_scale))
        .ok_or_else(|| SolverError::Numerical("DLT rotation block is singular".to_string()))?;

    // Undo the Hartley scaling: t' = lambda * (R c + t) with lambda = row_scale * scale.
    let lambda = row_scale * scale;
    let translation = t / lambda - rotation * centroid;

    let rotation_c2w: Rotation3<f64> = rotation.inverse();
    Ok(CameraToWorld {
        orientation: UnitQuaternion::from_rotation_matrix(&rotation_c2w),
        center: -(rotation_c2w * translation),
    })
}

struct BearingEstimator<'a> {
    world: &'a [Vector3<f64>],
    normalized: Vec<Vector2<f64>>,
    bearings: Vec<Vector3<f64>>,
}

impl Estimator for BearingEstimator<'_> {
    type Model = CameraPose;
    const MIN_SAMPLES: usize = 6;

    fn num_data(&self) -> usize {
        self.world.len()
    }

    fn fit(&self, indices: &[usize]) -> Option<CameraPose> {
        let world: Vec<_> = indices.iter().map(|&i| self.world[i]).collect();
        let normalized: Vec<_> = indices.iter().map(|&i| self.normalized[i]).collect();
        dlt_camera_to_world(&world, &normalized).ok().map(CameraPose::from)
    }

    /// Angle in radians between the observed ray and the predicted one.
    fn residual(&self, model: &CameraPose, index: usize) -> f64 {
        let predicted = model.transform_point(&self.world[index]);
        if predicted.z <= 0.0 {
            return f64::INFINITY;
        }
        let cos = predicted.normalize().dot(&self.bearings[index]);
        cos.clamp(-1.0, 1.0).acos()
    }
}

/// RANSAC around the normalized DLT with an angular inlier test.
///
/// `options.threshold` stays in pixels and is converted to an angle with the
/// mean focal length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedDltSolver {
    pub options: RansacOptions,
}

impl NormalizedDltSolver {
    pub fn new(options: RansacOptions) -> Self {
        NormalizedDltSolver { options }
    }
}

impl Default for NormalizedDltSolver {
    fn default() -> Self {
        NormalizedDltSolver::new(RansacOptions {
            max_iterations: 10_000,
            ..RansacOptions::default()
        })
    }
}

impl PoseSolver for NormalizedDltSolver {
    fn name(&self) -> &'static str {
        "normalized_dlt"
    }

    fn min_correspondences(&self) -> usize {
        BearingEstimator::MIN_SAMPLES
    }

    fn solve(
        &self,
        world: &[Vector3<f64>],
        image: &[Vector2<f64>],
        intrinsics: &Intrinsics,
    ) -> Result<PnpSolution, SolverError> {
        check_input(world, image, self.min_correspondences())?;
        let normalized: Vec<_> = image.iter().map(|p| intrinsics.normalize(p)).collect();
        let bearings = normalized
            .iter()
            .map(|p| Vector3::new(p.x, p.y, 1.0).normalize())
            .collect();
        let estimator = BearingEstimator {
            world,
            normalized,
            bearings,
        };

        let focal = 0.5 * (intrinsics.fx + intrinsics.fy);
        let options = RansacOptions {
            threshold: (self.options.threshold / focal).atan(),
            ..self.options
        };
        let result = ransac_fit(&estimator, &options)?;
        let reprojection_rmse = rmse(&result.model, intrinsics, world, image, &result.inliers);
        debug!(
            "Normalized DLT: {} inliers, rmse {:.3} px",
            result.inliers.len(),
            reprojection_rmse
        );
        Ok(PnpSolution {
            pose: result.model,
            inliers: result.inliers,
            reprojection_rmse,
        })
    }
}
