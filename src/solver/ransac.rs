//! Seeded RANSAC over an arbitrary minimal-sample estimator.

use super::SolverError;
use log::debug;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RansacOptions {
    pub max_iterations: usize,
    /// Residual at or below which a datum is an inlier.
    pub threshold: f64,
    /// Desired probability of drawing one all-inlier sample; drives early termination.
    pub confidence: f64,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacOptions {
    fn default() -> Self {
        RansacOptions {
            max_iterations: 1000,
            threshold: 8.0,
            confidence: 0.99,
            min_inliers: 6,
            seed: 100,
        }
    }
}

/// A model that can be fitted from index subsets of some data set.
pub trait Estimator {
    type Model;

    /// Size of the minimal sample.
    const MIN_SAMPLES: usize;

    fn num_data(&self) -> usize;

    fn fit(&self, indices: &[usize]) -> Option<Self::Model>;

    fn residual(&self, model: &Self::Model, index: usize) -> f64;
}

#[derive(Debug, Clone)]
pub struct RansacResult<M> {
    pub model: M,
    /// Ascending inlier indices.
    pub inliers: Vec<usize>,
    pub iterations: usize,
}

fn inliers_of<E: Estimator>(estimator: &E, model: &E::Model, threshold: f64) -> Vec<usize> {
    (0..estimator.num_data())
        .filter(|&i| estimator.residual(model, i) <= threshold)
        .collect()
}

/// Iterations needed to draw an all-inlier sample with probability `confidence`.
fn required_iterations(inlier_ratio: f64, sample_size: usize, confidence: f64) -> usize {
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let p_good = inlier_ratio.powi(sample_size as i32);
    if p_good <= f64::EPSILON {
        return usize::MAX;
    }
    let k = (1.0 - confidence).ln() / (1.0 - p_good).ln();
    if k.is_finite() {
        k.ceil().max(1.0) as usize
    } else {
        usize::MAX
    }
}

/// Runs RANSAC and refits the winning model on its consensus set.
pub fn ransac_fit<E: Estimator>(
    estimator: &E,
    options: &RansacOptions,
) -> Result<RansacResult<E::Model>, SolverError> {
    let n = estimator.num_data();
    if n < E::MIN_SAMPLES {
        return Err(SolverError::InsufficientData {
            required: E::MIN_SAMPLES,
            found: n,
        });
    }
    let required_inliers = options.min_inliers.max(E::MIN_SAMPLES);

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut best: Option<(E::Model, Vec<usize>)> = None;
    let mut budget = options.max_iterations;
    let mut iterations = 0;

    while iterations < budget {
        iterations += 1;
        let sample = index::sample(&mut rng, n, E::MIN_SAMPLES).into_vec();
        let Some(model) = estimator.fit(&sample) else {
            continue;
        };
        let inliers = inliers_of(estimator, &model, options.threshold);
        let best_count = best.as_ref().map_or(0, |(_, b)| b.len());
        if inliers.len() > best_count {
            let ratio = inliers.len() as f64 / n as f64;
            budget = budget.min(required_iterations(ratio, E::MIN_SAMPLES, options.confidence));
            best = Some((model, inliers));
        }
    }

    let Some((model, inliers)) = best else {
        return Err(SolverError::NoConsensus {
            best: 0,
            required: required_inliers,
        });
    };
    if inliers.len() < required_inliers {
        return Err(SolverError::NoConsensus {
            best: inliers.len(),
            required: required_inliers,
        });
    }
    debug!(
        "RANSAC: {} of {} inliers after {} iterations",
        inliers.len(),
        n,
        iterations
    );

    // Refit on the consensus set; keep it only if it does not lose support.
    if let Some(refit) = estimator.fit(&inliers) {
        let refit_inliers = inliers_of(estimator, &refit, options.threshold);
        if refit_inliers.len() >= inliers.len() {
            return Ok(RansacResult {
                model: refit,
                inliers: refit_inliers,
                iterations,
            });
        }
    }
    Ok(RansacResult {
        model,
        inliers,
        iterations,
    })
}
