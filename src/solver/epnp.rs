//! EPnP (Lepetit et al.) and the RANSAC solver built on it.
//!
//! The world points are expressed as barycentric combinations of control points
//! taken from their principal axes; the camera-frame control points are the null
//! vector of a `2n x 3k` system built from normalized image coordinates. Four
//! control points are used in general, three when the points lie on a plane.

use super::ransac::{ransac_fit, Estimator, RansacOptions};
use super::{check_input, pose_from_points, reprojection_error, rmse};
use super::{PnpSolution, PoseSolver, PrincipalAxes, SolverError};
use crate::camera::Intrinsics;
use crate::geometry::CameraPose;
use log::debug;
use nalgebra::{DMatrix, Vector2, Vector3};

/// EPnP on normalized image coordinates (`K^-1 [u v 1]`).
///
/// Needs four or more points that are not collinear.
pub fn epnp(world: &[Vector3<f64>], normalized: &[Vector2<f64>]) -> Result<CameraPose, SolverError> {
    let n = world.len();
    if n < 4 || normalized.len() != n {
        return Err(SolverError::InsufficientData {
            required: 4,
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
    let dims = if principal.is_planar() { 2 } else { 3 };
    let k = dims + 1;

    let extents: Vec<f64> = (0..dims).map(|i| principal.variances[i].sqrt()).collect();
    let mut control_w = vec![principal.centroid];
    control_w.extend((0..dims).map(|i| principal.centroid + principal.axis(i) * extents[i]));

    let alphas: Vec<Vec<f64>> = world
        .iter()
        .map(|p| {
            let d = p - principal.centroid;
            let c: Vec<f64> = (0..dims)
                .map(|i| principal.axis(i).dot(&d) / extents[i])
                .collect();
            let mut a = vec![1.0 - c.iter().sum::<f64>()];
            a.extend(c);
            a
        })
        .collect();

    let mut m = DMatrix::<f64>::zeros(2 * n, 3 * k);
    for (i, (a, uv)) in alphas.iter().zip(normalized.iter()).enumerate() {
        for (j, &alpha) in a.iter().enumerate() {
            let c = 3 * j;
            m[(2 * i, c)] = alpha;
            m[(2 * i, c + 2)] = -uv.x * alpha;
            m[(2 * i + 1, c + 1)] = alpha;
            m[(2 * i + 1, c + 2)] = -uv.y * alpha;
        }
    }

    // The null vector is the eigenvector of M^T M with the smallest eigenvalue.
    let mtm = m.transpose() * &m;
    let eig = mtm.symmetric_eigen();
    let min_idx = eig.eigenvalues.imin();
    let sol = eig.eigenvectors.column(min_idx);

    let control_c: Vec<Vector3<f64>> = (0..k)
        .map(|j| Vector3::new(sol[3 * j], sol[3 * j + 1], sol[3 * j + 2]))
        .collect();

    let (mut sum_w, mut sum_c) = (0.0, 0.0);
    for i in 0..k {
        for j in (i + 1)..k {
            sum_w += (control_w[i] - control_w[j]).norm_squared();
            sum_c += (control_c[i] - control_c[j]).norm_squared();
        }
    }
    if sum_c <= f64::EPSILON {
        return Err(SolverError::Degenerate(
            "control points collapsed to a single point".to_string(),
        ));
    }
    let mut scale = (sum_w / sum_c).sqrt();

    let camera_points = |scale: f64| -> Vec<Vector3<f64>> {
        alphas
            .iter()
            .map(|a| {
                a.iter()
                    .zip(control_c.iter())
                    .map(|(&alpha, c)| c * (alpha * scale))
                    .sum()
            })
            .collect()
    };
    let mut camera = camera_points(scale);

    // The null vector has an arbitrary sign; the scene must lie in front of the camera.
    let mean_z = camera.iter().map(|p| p.z).sum::<f64>() / n as f64;
    if mean_z < 0.0 {
        scale = -scale;
        camera = camera_points(scale);
    }

    pose_from_points(world, &camera)
}

/// Shared RANSAC data for pixel-space PnP hypotheses.
pub(crate) struct PnpEstimator<'a> {
    pub world: &'a [Vector3<f64>],
    pub image: &'a [Vector2<f64>],
    pub normalized: Vec<Vector2<f64>>,
    pub intrinsics: &'a Intrinsics,
}

impl<'a> PnpEstimator<'a> {
    pub fn new(
        world: &'a [Vector3<f64>],
        image: &'a [Vector2<f64>],
        intrinsics: &'a Intrinsics,
    ) -> Self {
        PnpEstimator {
            world,
            image,
            normalized: image.iter().map(|p| intrinsics.normalize(p)).collect(),
            intrinsics,
        }
    }
}

impl Estimator for PnpEstimator<'_> {
    type Model = CameraPose;
    const MIN_SAMPLES: usize = 6;

    fn num_data(&self) -> usize {
        self.world.len()
    }

    fn fit(&self, indices: &[usize]) -> Option<CameraPose> {
        let world: Vec<_> = indices.iter().map(|&i| self.world[i]).collect();
        let normalized: Vec<_> = indices.iter().map(|&i| self.normalized[i]).collect();
        epnp(&world, &normalized).ok()
    }

    fn residual(&self, model: &CameraPose, index: usize) -> f64 {
        reprojection_error(model, self.intrinsics, &self.world[index], &self.image[index])
    }
}

/// EPnP hypotheses inside RANSAC, refitted on the consensus set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpnpSolver {
    pub options: RansacOptions,
}

impl EpnpSolver {
    pub fn new(options: RansacOptions) -> Self {
        EpnpSolver { options }
    }
}

impl Default for EpnpSolver {
    fn default() -> Self {
        EpnpSolver::new(RansacOptions {
            max_iterations: 100,
            ..RansacOptions::default()
        })
    }
}

impl PoseSolver for EpnpSolver {
    fn name(&self) -> &'static str {
        "epnp"
    }

    fn min_correspondences(&self) -> usize {
        PnpEstimator::MIN_SAMPLES
    }

    fn solve(
        &self,
        world: &[Vector3<f64>],
        image: &[Vector2<f64>],
        intrinsics: &Intrinsics,
    ) -> Result<PnpSolution, SolverError> {
        check_input(world, image, self.min_correspondences())?;
        let estimator = PnpEstimator::new(world, image, intrinsics);
        let result = ransac_fit(&estimator, &self.options)?;
        let reprojection_rmse = rmse(&result.model, intrinsics, world, image, &result.inliers);
        debug!(
            "EPnP: {} inliers, rmse {:.3} px",
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
