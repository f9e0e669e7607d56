//! Run configuration, loaded from YAML.
//!
//! Every field has a default, so a config file only needs the values it changes.
//! See `samples/refinement.yaml` for a complete file.

use crate::matching::MatcherConfig;
use crate::report::ReportConfig;
use crate::solver::SolverConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What to do when a collaborator cannot produce output for a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the split and return the error.
    Abort,
    /// Record the frame as skipped and continue.
    #[default]
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Fewer matcher pairs than this keeps the coarse pose.
    pub min_correspondences: usize,
    /// Coarse poses below this quality are refined anyway but logged.
    pub min_coarse_quality: f64,
    pub matcher: MatcherConfig,
    pub solver: SolverConfig,
    pub failure_policy: FailurePolicy,
    pub report: ReportConfig,
    /// When set, a side-by-side match image is written per matched frame.
    pub match_image_dir: Option<PathBuf>,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        RefinementConfig {
            min_correspondences: 30,
            min_coarse_quality: 100.0,
            matcher: MatcherConfig::default(),
            solver: SolverConfig::default(),
            failure_policy: FailurePolicy::default(),
            report: ReportConfig::default(),
            match_image_dir: None,
        }
    }
}

impl RefinementConfig {
    /// Loads and validates a configuration file.
    pub fn load_from_yaml(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: RefinementConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_yaml(&self, path: &str) -> Result<(), ConfigError> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.min_correspondences == 0 {
            return invalid("min_correspondences must be at least 1".to_string());
        }
        if self.matcher.max_keypoints == 0 || self.matcher.max_matches == 0 {
            return invalid("matcher.max_keypoints and matcher.max_matches must be positive".to_string());
        }
        if !(-1.0..=1.0).contains(&self.matcher.min_similarity) {
            return invalid(format!(
                "matcher.min_similarity must lie in [-1, 1], got {}",
                self.matcher.min_similarity
            ));
        }
        if let Some(ratio) = self.matcher.ratio_test {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return invalid(format!("matcher.ratio_test must lie in (0, 1], got {ratio}"));
            }
        }
        let solver = &self.solver;
        if !(solver.reprojection_threshold.is_finite() && solver.reprojection_threshold > 0.0) {
            return invalid(format!(
                "solver.reprojection_threshold must be positive, got {}",
                solver.reprojection_threshold
            ));
        }
        if !(solver.confidence > 0.0 && solver.confidence < 1.0) {
            return invalid(format!(
                "solver.confidence must lie in (0, 1), got {}",
                solver.confidence
            ));
        }
        if solver.ransac_iterations == Some(0) {
            return invalid("solver.ransac_iterations must be positive".to_string());
        }
        if !(self.report.translation_scale.is_finite() && self.report.translation_scale > 0.0) {
            return invalid(format!(
                "report.translation_scale must be positive, got {}",
                self.report.translation_scale
            ));
        }
        if self
            .report
            .thresholds
            .iter()
            .any(|[t, r]| !(*t >= 0.0 && *r >= 0.0))
        {
            return invalid("report.thresholds must be non-negative".to_string());
        }
        Ok(())
    }
}
