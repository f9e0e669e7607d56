//! Robust Perspective-n-Point solvers.
//!
//! All solvers share the [`PoseSolver`] contract: given world points, their pixel
//! observations in the query image and the query intrinsics, return a
//! world-to-camera pose together with the RANSAC inlier set. Solvers whose
//! back-end produces camera-to-world output convert before returning, so callers
//! only ever see [`CameraPose`].

use crate::camera::Intrinsics;
use crate::geometry::{reproject, CameraPose};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod dlt;
pub mod epnp;
pub mod iterative;
pub mod ransac;
pub mod refine;

pub use dlt::NormalizedDltSolver;
pub use epnp::EpnpSolver;
pub use iterative::IterativeSolver;
pub use ransac::RansacOptions;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("Need at least {required} correspondences, got {found}")]
    InsufficientData { required: usize, found: usize },
    #[error("Degenerate configuration: {0}")]
    Degenerate(String),
    #[error("No consensus: best hypothesis had {best} inliers, {required} required")]
    NoConsensus { best: usize, required: usize },
    #[error("Numerical failure: {0}")]
    Numerical(String),
}

/// Output of a successful solve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PnpSolution {
    /// World-to-camera pose of the query camera.
    pub pose: CameraPose,
    /// Indices into the input arrays, ascending.
    pub inliers: Vec<usize>,
    /// Root mean square reprojection error over the inliers, in pixels.
    pub reprojection_rmse: f64,
}

pub trait PoseSolver {
    fn name(&self) -> &'static str;

    /// Smallest input size the solver accepts.
    fn min_correspondences(&self) -> usize;

    fn solve(
        &self,
        world: &[Vector3<f64>],
        image: &[Vector2<f64>],
        intrinsics: &Intrinsics,
    ) -> Result<PnpSolution, SolverError>;
}

impl<S: PoseSolver + ?Sized> PoseSolver for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn min_correspondences(&self) -> usize {
        (**self).min_correspondences()
    }

    fn solve(
        &self,
        world: &[Vector3<f64>],
        image: &[Vector2<f64>],
        intrinsics: &Intrinsics,
    ) -> Result<PnpSolution, SolverError> {
        (**self).solve(world, image, intrinsics)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    Iterative,
    Epnp,
    NormalizedDlt,
}

impl SolverKind {
    pub fn default_iterations(&self) -> usize {
        match self {
            SolverKind::Iterative => 20_000,
            SolverKind::Epnp => 100,
            SolverKind::NormalizedDlt => 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub kind: SolverKind,
    /// RANSAC iteration cap; `None` uses the solver's own default.
    pub ransac_iterations: Option<usize>,
    /// Inlier threshold in pixels.
    pub reprojection_threshold: f64,
    pub confidence: f64,
    /// Minimum consensus size; never lower than the solver's minimal sample.
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            kind: SolverKind::Iterative,
            ransac_iterations: None,
            reprojection_threshold: 8.0,
            confidence: 0.99,
            min_inliers: 6,
            seed: 100,
        }
    }
}

impl SolverConfig {
    pub fn ransac_options(&self) -> RansacOptions {
        RansacOptions {
            max_iterations: self
                .ransac_iterations
                .unwrap_or_else(|| self.kind.default_iterations()),
            threshold: self.reprojection_threshold,
            confidence: self.confidence,
            min_inliers: self.min_inliers,
            seed: self.seed,
        }
    }
}

/// Builds the solver selected by `config.kind`.
pub fn build_solver(config: &SolverConfig) -> Box<dyn PoseSolver> {
    let options = config.ransac_options();
    match config.kind {
        SolverKind::Iterative => Box::new(IterativeSolver::new(options)),
        SolverKind::Epnp => Box::new(EpnpSolver::new(options)),
        SolverKind::NormalizedDlt => Box::new(NormalizedDltSolver::new(options)),
    }
}

/// Rejects mismatched or too-small inputs before any solver runs.
pub(crate) fn check_input(
    world: &[Vector3<f64>],
    image: &[Vector2<f64>],
    required: usize,
) -> Result<(), SolverError> {
    if world.len() != image.len() {
        return Err(SolverError::Degenerate(format!(
            "{} world points but {} image points",
            world.len(),
            image.len()
        )));
    }
    if world.len() < required {
        return Err(SolverError::InsufficientData {
            required,
            found: world.len(),
        });
    }
    let finite = world.iter().all(|p| p.iter().all(|v| v.is_finite()))
        && image.iter().all(|p| p.iter().all(|v| v.is_finite()));
    if !finite {
        return Err(SolverError::Degenerate(
            "input contains non-finite coordinates".to_string(),
        ));
    }
    Ok(())
}

/// Pixel distance between the reprojection of `world` and `pixel`; infinite behind the camera.
pub(crate) fn reprojection_error(
    pose: &CameraPose,
    intrinsics: &Intrinsics,
    world: &Vector3<f64>,
    pixel: &Vector2<f64>,
) -> f64 {
    reproject(pose, intrinsics, world)
        .map(|p| (p - pixel).norm())
        .unwrap_or(f64::INFINITY)
}

pub(crate) fn rmse(
    pose: &CameraPose,
    intrinsics: &Intrinsics,
    world: &[Vector3<f64>],
    image: &[Vector2<f64>],
    indices: &[usize],
) -> f64 {
    if indices.is_empty() {
        return 0.0;
    }
    let sum: f64 = indices
        .iter()
        .map(|&i| reprojection_error(pose, intrinsics, &world[i], &image[i]).powi(2))
        .sum();
    (sum / indices.len() as f64).sqrt()
}

/// Variance ratio below which a point set is treated as lacking that axis.
const FLAT_RATIO: f64 = 1e-8;

/// Principal axes of a point cloud, sorted by decreasing variance.
#[derive(Debug, Clone)]
pub(crate) struct PrincipalAxes {
    pub centroid: Vector3<f64>,
    /// Unit axes as columns.
    pub axes: Matrix3<f64>,
    pub variances: Vector3<f64>,
}

impl PrincipalAxes {
    /// `None` for an empty or single-point cloud.
    pub fn new(points: &[Vector3<f64>]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        let n = points.len() as f64;
        let centroid = points.iter().sum::<Vector3<f64>>() / n;
        let mut cov = Matrix3::zeros();
        for p in points {
            let d = p - centroid;
            cov += d * d.transpose();
        }
        cov /= n;

        let eig = cov.symmetric_eigen();
        let mut order = [0, 1, 2];
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
        let variances = Vector3::from_fn(|i, _| eig.eigenvalues[order[i]].max(0.0));
        if variances[0] <= f64::EPSILON {
            return None;
        }
        let axes = Matrix3::from_columns(&order.map(|i| eig.eigenvectors.column(i).into_owned()));
        Some(PrincipalAxes {
            centroid,
            axes,
            variances,
        })
    }

    pub fn axis(&self, i: usize) -> Vector3<f64> {
        self.axes.column(i).into_owned()
    }

    pub fn is_collinear(&self) -> bool {
        self.variances[1] < self.variances[0] * FLAT_RATIO
    }

    pub fn is_planar(&self) -> bool {
        self.variances[2] < self.variances[0] * FLAT_RATIO
    }
}

/// Rigid alignment of world points to their camera-frame positions (Kabsch).
pub(crate) fn pose_from_points(
    world: &[Vector3<f64>],
    camera: &[Vector3<f64>],
) -> Result<CameraPose, SolverError> {
    if world.len() != camera.len() || world.len() < 3 {
        return Err(SolverError::Degenerate(
            "alignment needs three or more point pairs".to_string(),
        ));
    }
    let n = world.len() as f64;
    let c_w = world.iter().sum::<Vector3<f64>>() / n;
    let c_c = camera.iter().sum::<Vector3<f64>>() / n;

    let mut h = Matrix3::zeros();
    for (pw, pc) in world.iter().zip(camera.iter()) {
        h += (pc - c_c) * (pw - c_w).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| SolverError::Numerical("SVD failed in alignment".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| SolverError::Numerical("SVD failed in alignment".to_string()))?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fix = u;
        u_fix.column_mut(2).neg_mut();
        r = u_fix * v_t;
    }
    let t = c_c - r * c_w;
    CameraPose::try_from_parts(&r, &t).map_err(|e| SolverError::Numerical(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pose_from_points_recovers_transform() {
        let pose = ground_truth();
        let (world, _) = scene(10);
        let camera: Vec<_> = world.iter().map(|p| pose.transform_point(p)).collect();
        let estimate = pose_from_points(&world, &camera).unwrap();
        assert_relative_eq!(estimate.to_matrix4(), pose.to_matrix4(), epsilon = 1e-9);
    }

    #[test]
    fn test_check_input() {
        let (world, image) = scene(5);
        assert_eq!(
            check_input(&world, &image, 6),
            Err(SolverError::InsufficientData {
                required: 6,
                found: 5
            })
        );
        assert!(matches!(
            check_input(&world, &image[..4], 3),
            Err(SolverError::Degenerate(_))
        ));
        assert!(check_input(&world, &image, 4).is_ok());
    }

    #[test]
    fn test_principal_axes_flatness() {
        let (cloud, _) = scene(20);
        let axes = PrincipalAxes::new(&cloud).unwrap();
        assert!(!axes.is_planar());
        assert!(axes.variances[0] >= axes.variances[1] && axes.variances[1] >= axes.variances[2]);

        let (plane, _) = planar_scene(20);
        let axes = PrincipalAxes::new(&plane).unwrap();
        assert!(axes.is_planar() && !axes.is_collinear());
        assert_relative_eq!(axes.axis(2).z.abs(), 1.0, epsilon = 1e-9);

        let line: Vec<_> = (0..5).map(|i| Vector3::new(i as f64, 2.0 * i as f64, 0.0)).collect();
        assert!(PrincipalAxes::new(&line).unwrap().is_collinear());
        assert!(PrincipalAxes::new(&[Vector3::new(1.0, 2.0, 3.0)]).is_none());
    }

    #[test]
    fn test_every_solver_handles_planar_scene() {
        let (world, mut image) = planar_scene(100);
        let corrupted = corrupt(&mut image, 9);
        for kind in [SolverKind::Iterative, SolverKind::Epnp, SolverKind::NormalizedDlt] {
            let config = SolverConfig {
                kind,
                ransac_iterations: Some(500),
                ..SolverConfig::default()
            };
            let solution = build_solver(&config)
                .solve(&world, &image, &intrinsics())
                .unwrap();
            assert_eq!(solution.inliers.len(), 100 - corrupted.len(), "{kind:?}");
            assert!(rotation_error_deg(&solution.pose, &ground_truth()) < 1e-4, "{kind:?}");
            assert_relative_eq!(
                solution.pose.camera_center(),
                ground_truth().camera_center(),
                epsilon = 1e-5
            );
        }
    }

    #[test]
    fn test_config_defaults_per_kind() {
        let config = SolverConfig {
            kind: SolverKind::Epnp,
            ..SolverConfig::default()
        };
        assert_eq!(config.ransac_options().max_iterations, 100);
        assert_eq!(SolverConfig::default().ransac_options().max_iterations, 20_000);
        let solver = build_solver(&config);
        assert_eq!(solver.name(), "epnp");
    }
}
