//! Render-and-match camera pose refinement
//!
//! Given a query image and a coarse camera pose, this library renders the scene
//! at the coarse pose, matches the render against the query image, lifts the
//! matched render pixels to world points with the rendered depth and solves a
//! robust PnP problem for a corrected pose. Frames without enough
//! correspondences keep their coarse pose. The main pieces are:
//! - [`refinement`]: the per-frame refinement loop and its fallback policy
//! - [`matching`]: interchangeable correspondence strategies (feature/score maps,
//!   image pairs, dense end-to-end networks)
//! - [`solver`]: RANSAC PnP solvers (EPnP + Levenberg-Marquardt, EPnP, normalized DLT)
//! - [`geometry`]: poses, reprojection and depth unprojection
//! - [`metrics`] and [`report`]: pose errors, per-split aggregation and persistence
//!
//! Poses are world-to-camera everywhere ([`geometry::CameraPose`]). The renderer,
//! coarse pose regressor and matching networks are external collaborators behind
//! the [`render::SceneRenderer`], [`refinement::CoarsePoseProvider`] and
//! [`matching`] back-end traits; [`synthetic`] provides exact stand-ins.

pub mod camera;
pub mod config;
pub mod dataset;
pub mod geometry;
pub mod matching;
pub mod metrics;
pub mod refinement;
pub mod render;
pub mod report;
pub mod solver;
pub mod synthetic;

// Re-export commonly used types
pub use camera::{CameraError, CameraModel, Intrinsics, PinholeModel, Resolution};
pub use config::{FailurePolicy, RefinementConfig};
pub use dataset::{Frame, SplitSource};
pub use geometry::{CameraPose, WorldCorrespondences};
pub use matching::{CorrespondenceMatcher, Correspondences, QueryView};
pub use metrics::{pose_error, PoseError};
pub use refinement::{
    CoarseEstimate, CoarsePoseProvider, PriorTable, RefineError, RefinementResult, Refiner,
};
pub use render::{RenderOutput, SceneRenderer};
pub use report::{RunAggregator, SplitSummary};
pub use solver::{build_solver, PnpSolution, PoseSolver};
