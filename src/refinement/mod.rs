//! Per-frame render-and-match refinement.
//!
//! For every frame the [`Refiner`] walks the same stages:
//!
//! ```text
//! AwaitCoarsePose -> Rendered -> Matched -> Refined | Fallback -> Recorded
//! ```
//!
//! The coarse pose is rendered, the render is matched against the query image,
//! matched render pixels are lifted to world points with the rendered depth and
//! a robust PnP solve produces the refined pose. Whenever there are not enough
//! correspondences, or the solver gives up, the coarse pose is kept as the final
//! pose. Every frame ends up recorded exactly once.

use crate::config::{FailurePolicy, RefinementConfig};
use crate::dataset::{DatasetError, Frame};
use crate::geometry::{unproject_correspondences, CameraPose, WorldCorrespondences};
use crate::matching::{CorrespondenceMatcher, Correspondences, MatchError, QueryView};
use crate::metrics::{pose_error, PoseError};
use crate::render::{CollaboratorError, RenderOutput, SceneRenderer};
use crate::report::{match_image, match_image_name, save_match_image, RunAggregator};
use crate::solver::{PoseSolver, SolverError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

pub mod prior;

pub use prior::{PriorError, PriorTable};

#[derive(thiserror::Error, Debug)]
pub enum RefineError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("Matcher failed: {0}")]
    Match(#[from] MatchError),
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),
}

/// Coarse pose hypothesis for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoarseEstimate {
    /// World-to-camera.
    pub pose: CameraPose,
    /// Provider-specific confidence, e.g. the RANSAC inlier count of a scene
    /// coordinate regressor. Higher is better; `None` when the provider has none.
    pub quality: Option<f64>,
}

/// Source of the initial pose that gets refined.
///
/// Providers only see the query image and its camera; ground truth stays with
/// the refiner for evaluation.
pub trait CoarsePoseProvider {
    fn estimate(&self, query: &QueryView<'_>) -> Result<CoarseEstimate, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseSource {
    Coarse,
    Refined,
}

impl fmt::Display for PoseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoseSource::Coarse => write!(f, "coarse"),
            PoseSource::Refined => write!(f, "refined"),
        }
    }
}

/// Why a frame kept its coarse pose.
///
/// Only used for reporting; every reason leads to the same fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FallbackReason {
    /// The matcher found no pair at all.
    NoMatch,
    TooFewMatches { found: usize, required: usize },
    /// Too few points survived unprojection for the solver.
    SolverInsufficient { found: usize, required: usize },
    SolverFailed(String),
}

impl FallbackReason {
    pub fn label(&self) -> &'static str {
        match self {
            FallbackReason::NoMatch => "no_match",
            FallbackReason::TooFewMatches { .. } => "too_few_matches",
            FallbackReason::SolverInsufficient { .. } => "solver_insufficient",
            FallbackReason::SolverFailed(_) => "solver_failed",
        }
    }

    pub fn is_no_match(&self) -> bool {
        matches!(self, FallbackReason::NoMatch)
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NoMatch => write!(f, "no correspondences"),
            FallbackReason::TooFewMatches { found, required } => {
                write!(f, "{found} correspondences, {required} required")
            }
            FallbackReason::SolverInsufficient { found, required } => {
                write!(f, "{found} points left for the solver, {required} required")
            }
            FallbackReason::SolverFailed(reason) => write!(f, "solver failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementOutcome {
    Refined {
        inliers: usize,
        reprojection_rmse: f64,
    },
    Fallback(FallbackReason),
}

/// Wall time spent in each stage, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StageTimings {
    pub coarse: f64,
    pub render: f64,
    pub matching: f64,
    pub unproject: f64,
    pub solve: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementStage {
    AwaitCoarsePose,
    Rendered,
    Matched,
    Refined,
    Fallback,
    Recorded,
}

impl fmt::Display for RefinementStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefinementStage::AwaitCoarsePose => "AWAIT_COARSE_POSE",
            RefinementStage::Rendered => "RENDERED",
            RefinementStage::Matched => "MATCHED",
            RefinementStage::Refined => "REFINED",
            RefinementStage::Fallback => "FALLBACK",
            RefinementStage::Recorded => "RECORDED",
        };
        write!(f, "{name}")
    }
}

/// Outcome of one frame. Created once and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefinementResult {
    /// Position of the frame in the split enumeration.
    pub index: usize,
    pub frame_id: String,
    pub coarse_pose: CameraPose,
    pub final_pose: CameraPose,
    pub coarse_quality: Option<f64>,
    pub outcome: RefinementOutcome,
    /// Error of the coarse pose against ground truth.
    pub prior_error: PoseError,
    /// Error of the final pose; equal to `prior_error` on fallback.
    pub final_error: PoseError,
    /// Pairs returned by the matcher, before unprojection.
    pub num_matches: usize,
    /// Lifted correspondences handed to the solver. Reports persist a capped sample.
    #[serde(skip)]
    pub correspondences: WorldCorrespondences,
    /// Solver inliers, as indices into `correspondences`.
    pub inliers: Vec<usize>,
    pub timings: StageTimings,
}

impl RefinementResult {
    pub fn source(&self) -> PoseSource {
        match self.outcome {
            RefinementOutcome::Refined { .. } => PoseSource::Refined,
            RefinementOutcome::Fallback(_) => PoseSource::Coarse,
        }
    }

    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        match &self.outcome {
            RefinementOutcome::Fallback(reason) => Some(reason),
            RefinementOutcome::Refined { .. } => None,
        }
    }
}

fn transition(frame_id: &str, from: RefinementStage, to: RefinementStage) {
    debug!("[{frame_id}] {from} -> {to}");
}

fn seconds_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

/// Runs the refinement loop with externally owned collaborators.
///
/// The refiner never constructs or mutates its collaborators; they are created
/// once per run and shared by reference.
pub struct Refiner<'a> {
    provider: &'a dyn CoarsePoseProvider,
    renderer: &'a dyn SceneRenderer,
    matcher: &'a dyn CorrespondenceMatcher,
    solver: &'a dyn PoseSolver,
    config: &'a RefinementConfig,
}

impl<'a> Refiner<'a> {
    pub fn new(
        provider: &'a dyn CoarsePoseProvider,
        renderer: &'a dyn SceneRenderer,
        matcher: &'a dyn CorrespondenceMatcher,
        solver: &'a dyn PoseSolver,
        config: &'a RefinementConfig,
    ) -> Self {
        Refiner {
            provider,
            renderer,
            matcher,
            solver,
            config,
        }
    }

    /// Refines a single frame.
    ///
    /// Errors are collaborator failures (coarse pose provider, renderer, matcher).
    /// Lack of correspondences and solver failures are not errors: they produce a
    /// fallback result carrying the coarse pose.
    pub fn refine_frame(
        &self,
        index: usize,
        frame: &Frame,
    ) -> Result<RefinementResult, RefineError> {
        let id = frame.id.as_str();
        let start = Instant::now();
        let mut timings = StageTimings::default();

        let query = QueryView {
            frame_id: id,
            image: &frame.image,
            intrinsics: &frame.intrinsics,
        };

        let stage_start = Instant::now();
        let coarse = self.provider.estimate(&query)?;
        timings.coarse = seconds_since(stage_start);
        if let Some(quality) = coarse
            .quality
            .filter(|q| *q < self.config.min_coarse_quality)
        {
            warn!(
                "[{id}] Coarse pose quality {quality:.1} is below {:.1}, refining anyway",
                self.config.min_coarse_quality
            );
        }

        let stage_start = Instant::now();
        let render = self.renderer.render(&coarse.pose, &frame.camera())?;
        render.validate()?;
        timings.render = seconds_since(stage_start);
        transition(id, RefinementStage::AwaitCoarsePose, RefinementStage::Rendered);

        let stage_start = Instant::now();
        let matches = self.matcher.match_views(&query, &render)?;
        timings.matching = seconds_since(stage_start);
        let num_matches = matches.as_ref().map_or(0, Correspondences::len);
        transition(id, RefinementStage::Rendered, RefinementStage::Matched);
        debug!("[{id}] {} returned {num_matches} matches", self.matcher.name());

        let mut correspondences = WorldCorrespondences::default();
        let mut inliers = Vec::new();
        let required = self.config.min_correspondences;
        let (final_pose, outcome) = match &matches {
            None => (coarse.pose, RefinementOutcome::Fallback(FallbackReason::NoMatch)),
            Some(m) if m.len() < required => (
                coarse.pose,
                RefinementOutcome::Fallback(FallbackReason::TooFewMatches {
                    found: m.len(),
                    required,
                }),
            ),
            Some(m) => {
                let stage_start = Instant::now();
                correspondences =
                    unproject_correspondences(m, &render.depth, &render.intrinsics, &render.pose);
                timings.unproject = seconds_since(stage_start);

                let stage_start = Instant::now();
                let solved = self.solver.solve(
                    &correspondences.world,
                    &correspondences.query,
                    &frame.intrinsics,
                );
                timings.solve = seconds_since(stage_start);
                match solved {
                    Ok(solution) => {
                        let outcome = RefinementOutcome::Refined {
                            inliers: solution.inliers.len(),
                            reprojection_rmse: solution.reprojection_rmse,
                        };
                        inliers = solution.inliers;
                        (solution.pose, outcome)
                    }
                    Err(SolverError::InsufficientData { required, found }) => (
                        coarse.pose,
                        RefinementOutcome::Fallback(FallbackReason::SolverInsufficient {
                            found,
                            required,
                        }),
                    ),
                    Err(e) => (
                        coarse.pose,
                        RefinementOutcome::Fallback(FallbackReason::SolverFailed(e.to_string())),
                    ),
                }
            }
        };

        let prior_error = pose_error(&coarse.pose, &frame.ground_truth);
        let final_error = match &outcome {
            RefinementOutcome::Refined { .. } => {
                transition(id, RefinementStage::Matched, RefinementStage::Refined);
                pose_error(&final_pose, &frame.ground_truth)
            }
            RefinementOutcome::Fallback(reason) => {
                transition(id, RefinementStage::Matched, RefinementStage::Fallback);
                debug!("[{id}] Keeping coarse pose: {reason}");
                prior_error
            }
        };
        timings.total = seconds_since(start);

        let result = RefinementResult {
            index,
            frame_id: frame.id.clone(),
            coarse_pose: coarse.pose,
            final_pose,
            coarse_quality: coarse.quality,
            outcome,
            prior_error,
            final_error,
            num_matches,
            correspondences,
            inliers,
            timings,
        };

        if let Some(matches) = &matches {
            self.write_match_image(frame, &render, matches, &result);
        }

        info!(
            "[{index}] {id}: {} | rot {:.3} -> {:.3} deg | trans {:.4} -> {:.4} | {:.3} s",
            result.source(),
            prior_error.rotation_deg,
            final_error.rotation_deg,
            prior_error.translation,
            final_error.translation,
            timings.total
        );
        Ok(result)
    }

    /// Writes the side-by-side diagnostic when `match_image_dir` is configured.
    /// Failing to write it is logged and otherwise ignored.
    fn write_match_image(
        &self,
        frame: &Frame,
        render: &RenderOutput,
        matches: &Correspondences,
        result: &RefinementResult,
    ) {
        let Some(dir) = &self.config.match_image_dir else {
            return;
        };
        // Solver inliers index the lifted set; map them back to matcher pairs.
        let inliers: Option<Vec<usize>> = (result.source() == PoseSource::Refined).then(|| {
            result
                .inliers
                .iter()
                .map(|&i| result.correspondences.source_indices[i])
                .collect()
        });
        let canvas = match_image(&frame.image, &render.color, matches, inliers.as_deref());
        let name = match_image_name(
            result.index,
            &frame.id,
            &result.prior_error,
            &result.final_error,
            self.config.report.translation_scale,
        );
        if let Err(e) = save_match_image(&canvas, dir, &name) {
            warn!("[{}] Could not write match image {name}: {e}", frame.id);
        }
    }

    /// Refines every frame of a split in enumeration order.
    ///
    /// Failures to load, render or match a frame follow the configured
    /// [`FailurePolicy`]: `Abort` returns the error, `Skip` records the frame as
    /// skipped and moves on. Returns the number of recorded frames.
    pub fn run_split<I>(
        &self,
        frames: I,
        aggregator: &mut RunAggregator,
    ) -> Result<usize, RefineError>
    where
        I: IntoIterator<Item = Result<Frame, DatasetError>>,
    {
        let mut recorded = 0;
        for (index, frame) in frames.into_iter().enumerate() {
            let (id, attempt) = match frame {
                Ok(frame) => (frame.id.clone(), self.refine_frame(index, &frame)),
                Err(e) => (format!("#{index}"), Err(e.into())),
            };
            match attempt {
                Ok(result) => {
                    let from = match result.source() {
                        PoseSource::Refined => RefinementStage::Refined,
                        PoseSource::Coarse => RefinementStage::Fallback,
                    };
                    transition(&id, from, RefinementStage::Recorded);
                    aggregator.record(result);
                    recorded += 1;
                }
                Err(e) => match self.config.failure_policy {
                    FailurePolicy::Abort => return Err(e),
                    FailurePolicy::Skip => {
                        warn!("Skipping frame {id}: {e}");
                        aggregator.record_skipped(id, e.to_string());
                    }
                },
            }
        }
        info!(
            "Split '{}': {recorded} frames recorded, {} skipped",
            aggregator.split(),
            aggregator.skipped().len()
        );
        Ok(recorded)
    }
}
