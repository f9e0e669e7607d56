use super::epnp::PnpEstimator;
use super::ransac::{ransac_fit, Estimator, RansacOptions};
use super::refine::refine_pose;
use super::{check_input, reprojection_error, rmse, PnpSolution, PoseSolver, SolverError};
use crate::camera::Intrinsics;
use log::{debug, warn};
use nalgebra::{Vector2, Vector3};

/// RANSAC with EPnP hypotheses followed by Levenberg-Marquardt on the inliers.
///
/// This is the default solver of the refinement pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterativeSolver {
    pub options: RansacOptions,
}

impl IterativeSolver {
    pub fn new(options: RansacOptions) -> Self {
        IterativeSolver { options }
    }
}

impl Default for IterativeSolver {
    fn default() -> Self {
        IterativeSolver::new(RansacOptions {
            max_iterations: 20_000,
            ..RansacOptions::default()
        })
    }
}

impl PoseSolver for IterativeSolver {
    fn name(&self) -> &'static str {
        "iterative"
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
        let consensus = ransac_fit(&estimator, &self.options)?;
        let coarse_rmse = rmse(&consensus.model, intrinsics, world, image, &consensus.inliers);

        let inlier_world: Vec<_> = consensus.inliers.iter().map(|&i| world[i]).collect();
        let inlier_image: Vec<_> = consensus.inliers.iter().map(|&i| image[i]).collect();
        let refined = match refine_pose(&consensus.model, &inlier_world, &inlier_image, intrinsics) {
            Ok(pose) => pose,
            Err(e) => {
                warn!("Pose refinement failed, keeping RANSAC estimate: {e}");
                return Ok(PnpSolution {
                    pose: consensus.model,
                    inliers: consensus.inliers,
                    reprojection_rmse: coarse_rmse,
                });
            }
        };

        let inliers: Vec<usize> = (0..world.len())
            .filter(|&i| {
                reprojection_error(&refined, intrinsics, &world[i], &image[i])
                    <= self.options.threshold
            })
            .collect();
        let refined_rmse = rmse(&refined, intrinsics, world, image, &consensus.inliers);
        if inliers.len() < consensus.inliers.len() || refined_rmse > coarse_rmse {
            debug!(
                "Refinement did not improve the consensus ({} -> {} inliers), keeping RANSAC estimate",
                consensus.inliers.len(),
                inliers.len()
            );
            return Ok(PnpSolution {
                pose: consensus.model,
                inliers: consensus.inliers,
                reprojection_rmse: coarse_rmse,
            });
        }

        let reprojection_rmse = rmse(&refined, intrinsics, world, image, &inliers);
        debug!(
            "Iterative PnP: {} inliers after {} RANSAC iterations, rmse {:.3} -> {:.3} px",
            inliers.len(),
            consensus.iterations,
            coarse_rmse,
            reprojection_rmse
        );
        Ok(PnpSolution {
            pose: refined,
            inliers,
            reprojection_rmse,
        })
    }
}
