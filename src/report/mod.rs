//! Per-split accumulation of refinement results and their persistence.
//!
//! A [`RunAggregator`] collects one [`RefinementResult`] per processed frame, in
//! processing order. Results are independent: a run interrupted halfway leaves
//! every recorded frame valid, and [`RunAggregator::flush`] can be called at any
//! point to persist what has been collected so far.

use crate::metrics::{accuracy_within, ErrorStats};
use crate::refinement::{PoseSource, RefinementResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod visualize;

pub use visualize::{match_image, match_image_name, save_match_image};

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("Split '{0}' produced no frames")]
    EmptySplit(String),
    #[error("Split '{split}': none of {frames} frames could be matched against its render")]
    NothingMatched { split: String, frames: usize },
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("CSV Error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Image Error: {0}")]
    ImageError(#[from] image::ImageError),
}

/// Reporting units and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Factor applied to translation errors in reports (100 turns meters into cm).
    pub translation_scale: f64,
    pub translation_unit: String,
    /// Joint accuracy thresholds as `[translation (report unit), rotation (deg)]`.
    pub thresholds: Vec<[f64; 2]>,
    /// Cap on the correspondence samples persisted per frame.
    pub max_saved_correspondences: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            translation_scale: 100.0,
            translation_unit: "cm".to_string(),
            thresholds: vec![[5.0, 5.0], [2.0, 2.0]],
            max_saved_correspondences: 128,
        }
    }
}

/// A frame that was skipped after a collaborator failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFrame {
    pub frame_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyEntry {
    pub max_translation: f64,
    pub max_rotation_deg: f64,
    pub prior: f64,
    #[serde(rename = "final")]
    pub final_: f64,
}

/// Aggregated statistics of one split. Translation values are in the report unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitSummary {
    pub split: String,
    pub frames: usize,
    pub refined: usize,
    /// Fallback frames per reason label.
    pub fallback: BTreeMap<String, usize>,
    pub skipped: usize,
    pub translation_unit: String,
    pub prior_rotation: Option<ErrorStats>,
    pub prior_translation: Option<ErrorStats>,
    pub final_rotation: Option<ErrorStats>,
    pub final_translation: Option<ErrorStats>,
    pub accuracy: Vec<AccuracyEntry>,
    /// Mean wall time over all recorded frames.
    pub mean_elapsed_secs: Option<f64>,
}

impl SplitSummary {
    pub fn fallback_total(&self) -> usize {
        self.fallback.values().sum()
    }
}

fn write_stats_row(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    stats: &Option<ErrorStats>,
) -> fmt::Result {
    match stats {
        Some(s) => writeln!(
            f,
            "{:<24} | {:>10.4} | {:>10.4} | {:>10.4} | {:>10.4} | {:>10.4}",
            label, s.mean, s.median, s.min, s.max, s.stddev
        ),
        None => writeln!(f, "{label:<24} | {:>10}", "n/a"),
    }
}

impl fmt::Display for SplitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RENDER-AND-MATCH REFINEMENT SUMMARY: {}", self.split)?;
        writeln!(f, "==========================================")?;
        writeln!(f)?;
        writeln!(f, "Frames recorded:   {}", self.frames)?;
        writeln!(f, "Refined:           {}", self.refined)?;
        writeln!(f, "Fallback:          {}", self.fallback_total())?;
        for (reason, count) in &self.fallback {
            writeln!(f, "  - {reason:<16} {count}")?;
        }
        writeln!(f, "Skipped:           {}", self.skipped)?;
        writeln!(f)?;

        writeln!(
            f,
            "{:<24} | {:>10} | {:>10} | {:>10} | {:>10} | {:>10}",
            "Error", "Mean", "Median", "Min", "Max", "Stddev"
        )?;
        writeln!(
            f,
            "{:-<24}-+-{:-<10}-+-{:-<10}-+-{:-<10}-+-{:-<10}-+-{:-<10}",
            "", "", "", "", "", ""
        )?;
        let unit = &self.translation_unit;
        write_stats_row(f, "prior rotation (deg)", &self.prior_rotation)?;
        write_stats_row(f, &format!("prior translation ({unit})"), &self.prior_translation)?;
        write_stats_row(f, "final rotation (deg)", &self.final_rotation)?;
        write_stats_row(f, &format!("final translation ({unit})"), &self.final_translation)?;
        writeln!(f)?;

        for entry in &self.accuracy {
            writeln!(
                f,
                "Within {}{unit}, {}deg: prior {:.1}% -> final {:.1}%",
                entry.max_translation,
                entry.max_rotation_deg,
                entry.prior * 100.0,
                entry.final_ * 100.0
            )?;
        }
        match self.mean_elapsed_secs {
            Some(secs) => writeln!(f, "Mean elapsed time: {secs:.4} s"),
            None => writeln!(f, "Mean elapsed time: n/a"),
        }
    }
}

/// One row of `<split>_errors.csv`.
#[derive(Debug, Serialize)]
struct ErrorRow<'a> {
    index: usize,
    frame_id: &'a str,
    source: PoseSource,
    fallback_reason: &'a str,
    prior_rotation_deg: f64,
    prior_translation: f64,
    final_rotation_deg: f64,
    final_translation: f64,
    matches: usize,
    inliers: usize,
    elapsed_secs: f64,
}

/// One entry of `<split>_frames.json`.
#[derive(Debug, Serialize)]
struct FrameEntry<'a> {
    #[serde(flatten)]
    result: &'a RefinementResult,
    world_samples: Vec<[f64; 3]>,
    query_samples: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Default)]
pub struct RunAggregator {
    split: String,
    results: Vec<RefinementResult>,
    skipped: Vec<SkippedFrame>,
}

impl RunAggregator {
    pub fn new(split: impl Into<String>) -> Self {
        RunAggregator {
            split: split.into(),
            results: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn split(&self) -> &str {
        &self.split
    }

    pub fn record(&mut self, result: RefinementResult) {
        self.results.push(result);
    }

    pub fn record_skipped(&mut self, frame_id: impl Into<String>, reason: impl Into<String>) {
        self.skipped.push(SkippedFrame {
            frame_id: frame_id.into(),
            reason: reason.into(),
        });
    }

    pub fn results(&self) -> &[RefinementResult] {
        &self.results
    }

    pub fn skipped(&self) -> &[SkippedFrame] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn prior_rotation(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.prior_error.rotation_deg).collect()
    }

    pub fn prior_translation(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.prior_error.translation).collect()
    }

    pub fn final_rotation(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.final_error.rotation_deg).collect()
    }

    pub fn final_translation(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.final_error.translation).collect()
    }

    pub fn elapsed_secs(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.timings.total).collect()
    }

    pub fn summary(&self, config: &ReportConfig) -> SplitSummary {
        let scale = config.translation_scale;
        let prior_rotation = self.prior_rotation();
        let prior_translation = self.prior_translation();
        let final_rotation = self.final_rotation();
        let final_translation = self.final_translation();

        let mut fallback = BTreeMap::new();
        for reason in self.results.iter().filter_map(|r| r.fallback_reason()) {
            *fallback.entry(reason.label().to_string()).or_insert(0) += 1;
        }

        let accuracy = config
            .thresholds
            .iter()
            .map(|&[max_translation, max_rotation_deg]| {
                // Thresholds are in the report unit, errors in scene units.
                let bound = max_translation / scale;
                AccuracyEntry {
                    max_translation,
                    max_rotation_deg,
                    prior: accuracy_within(
                        &prior_rotation,
                        &prior_translation,
                        max_rotation_deg,
                        bound,
                    ),
                    final_: accuracy_within(
                        &final_rotation,
                        &final_translation,
                        max_rotation_deg,
                        bound,
                    ),
                }
            })
            .collect();

        let elapsed = self.elapsed_secs();
        let mean_elapsed_secs =
            (!elapsed.is_empty()).then(|| elapsed.iter().sum::<f64>() / elapsed.len() as f64);

        SplitSummary {
            split: self.split.clone(),
            frames: self.results.len(),
            refined: self
                .results
                .iter()
                .filter(|r| r.source() == PoseSource::Refined)
                .count(),
            fallback,
            skipped: self.skipped.len(),
            translation_unit: config.translation_unit.clone(),
            prior_rotation: ErrorStats::from_values(&prior_rotation),
            prior_translation: ErrorStats::from_values(&prior_translation).map(|s| s.scaled(scale)),
            final_rotation: ErrorStats::from_values(&final_rotation),
            final_translation: ErrorStats::from_values(&final_translation).map(|s| s.scaled(scale)),
            accuracy,
            mean_elapsed_secs,
        }
    }

    fn path(&self, dir: &Path, suffix: &str) -> PathBuf {
        dir.join(format!("{}_{suffix}", self.split))
    }

    /// Writes the per-frame JSON records and the CSV error table.
    pub fn write_records(&self, dir: &Path, config: &ReportConfig) -> Result<(), ReportError> {
        fs::create_dir_all(dir)?;

        let cap = config.max_saved_correspondences;
        let entries: Vec<FrameEntry<'_>> = self
            .results
            .iter()
            .map(|result| {
                let samples = &result.correspondences;
                FrameEntry {
                    result,
                    world_samples: samples.world.iter().take(cap).map(|p| [p.x, p.y, p.z]).collect(),
                    query_samples: samples.query.iter().take(cap).map(|p| [p.x, p.y]).collect(),
                }
            })
            .collect();
        let json = File::create(self.path(dir, "frames.json"))?;
        serde_json::to_writer_pretty(json, &entries)?;

        let mut writer = csv::Writer::from_path(self.path(dir, "errors.csv"))?;
        for r in &self.results {
            writer.serialize(ErrorRow {
                index: r.index,
                frame_id: &r.frame_id,
                source: r.source(),
                fallback_reason: r.fallback_reason().map_or("", |reason| reason.label()),
                prior_rotation_deg: r.prior_error.rotation_deg,
                prior_translation: r.prior_error.translation * config.translation_scale,
                final_rotation_deg: r.final_error.rotation_deg,
                final_translation: r.final_error.translation * config.translation_scale,
                matches: r.num_matches,
                inliers: r.inliers.len(),
                elapsed_secs: r.timings.total,
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_summary(
        &self,
        dir: &Path,
        config: &ReportConfig,
    ) -> Result<SplitSummary, ReportError> {
        fs::create_dir_all(dir)?;
        let summary = self.summary(config);
        let mut file = File::create(self.path(dir, "summary.txt"))?;
        write!(file, "{summary}")?;
        if !self.skipped.is_empty() {
            writeln!(file)?;
            writeln!(file, "SKIPPED FRAMES")?;
            for skipped in &self.skipped {
                writeln!(file, "{}: {}", skipped.frame_id, skipped.reason)?;
            }
        }
        Ok(summary)
    }

    /// Persists records and summary for whatever has been recorded so far.
    pub fn flush(&self, dir: &Path, config: &ReportConfig) -> Result<SplitSummary, ReportError> {
        self.write_records(dir, config)?;
        self.write_summary(dir, config)
    }

    /// End-of-split flush.
    ///
    /// Records are always written. A split without any recorded frame, or whose
    /// frames all failed to produce a single match, gets an error instead of a
    /// summary.
    pub fn finish(&self, dir: &Path, config: &ReportConfig) -> Result<SplitSummary, ReportError> {
        self.write_records(dir, config)?;
        if self.results.is_empty() {
            return Err(ReportError::EmptySplit(self.split.clone()));
        }
        let nothing_matched = self
            .results
            .iter()
            .all(|r| r.fallback_reason().is_some_and(|reason| reason.is_no_match()));
        if nothing_matched {
            return Err(ReportError::NothingMatched {
                split: self.split.clone(),
                frames: self.results.len(),
            });
        }
        self.write_summary(dir, config)
    }
}
