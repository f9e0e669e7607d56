//! Correspondence matching between the query image and a rendered view.
//!
//! Every strategy implements [`CorrespondenceMatcher`] and is chosen once, when the
//! refiner is built, through [`build_matcher`]:
//!
//! - [`FeatureScoreMatcher`]: database keypoints come from the renderer's score map
//!   and descriptors from its feature map; only the query image is encoded.
//! - [`ImagePairMatcher`]: one encoder runs on the query and on the rendered color image.
//! - [`DenseMatcher`]: an end-to-end network emits correspondences directly.
//!
//! Network back-ends (detectors, learned matchers, dense matchers) are external and
//! plug in through [`FeatureEncoder`], [`FeatureDecoder`], [`DescriptorMatcher`] and
//! [`DensePairNetwork`].

use crate::camera::Intrinsics;
use crate::render::RenderOutput;
use image::RgbImage;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

pub mod dense;
pub mod descriptor;
pub mod feature_score;
pub mod image_pair;
pub mod keypoints;

pub use dense::{DenseMatch, DenseMatcher, DensePairNetwork};
pub use descriptor::{DescriptorMatch, DescriptorMatcher, MutualNearestNeighbor};
pub use feature_score::{FeatureDecoder, FeatureScoreMatcher};
pub use image_pair::ImagePairMatcher;
pub use keypoints::{DetectionParams, FeatureEncoder, Keypoints};

#[derive(thiserror::Error, Debug)]
pub enum MatchError {
    #[error("Correspondence lists differ in length: {query} query vs {render} render")]
    LengthMismatch { query: usize, render: usize },
    #[error("Confidence list holds {confidence} values for {pairs} pairs")]
    ConfidenceLengthMismatch { pairs: usize, confidence: usize },
    #[error("Renderer did not provide a {0}")]
    MissingRenderChannel(&'static str),
    #[error("Descriptor dimension mismatch: query {query} vs render {render}")]
    DescriptorMismatch { query: usize, render: usize },
    #[error("Matcher back-end '{0}' was not supplied")]
    MissingBackend(&'static str),
    #[error("Matcher back-end failed: {0}")]
    Backend(String),
}

/// Paired pixels: `query[i]` in the query image matches `render[i]` in the render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Correspondences {
    query: Vec<Vector2<f64>>,
    render: Vec<Vector2<f64>>,
    confidence: Option<Vec<f32>>,
}

impl Correspondences {
    pub fn new(
        query: Vec<Vector2<f64>>,
        render: Vec<Vector2<f64>>,
    ) -> Result<Self, MatchError> {
        if query.len() != render.len() {
            return Err(MatchError::LengthMismatch {
                query: query.len(),
                render: render.len(),
            });
        }
        Ok(Correspondences {
            query,
            render,
            confidence: None,
        })
    }

    pub fn with_confidence(
        query: Vec<Vector2<f64>>,
        render: Vec<Vector2<f64>>,
        confidence: Vec<f32>,
    ) -> Result<Self, MatchError> {
        if confidence.len() != query.len() {
            return Err(MatchError::ConfidenceLengthMismatch {
                pairs: query.len(),
                confidence: confidence.len(),
            });
        }
        let mut matches = Self::new(query, render)?;
        matches.confidence = Some(confidence);
        Ok(matches)
    }

    pub fn len(&self) -> usize {
        self.query.len()
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_empty()
    }

    pub fn query(&self) -> &[Vector2<f64>] {
        &self.query
    }

    pub fn render(&self) -> &[Vector2<f64>] {
        &self.render
    }

    pub fn confidence(&self) -> Option<&[f32]> {
        self.confidence.as_deref()
    }

    /// Iterates `(query, render)` pixel pairs in order.
    pub fn pairs(&self) -> impl Iterator<Item = (&Vector2<f64>, &Vector2<f64>)> {
        self.query.iter().zip(self.render.iter())
    }

    /// Keeps the `k` most confident pairs, preserving their original order.
    ///
    /// Without confidences the first `k` pairs are kept.
    pub fn truncate_top_k(&mut self, k: usize) {
        if self.len() <= k {
            return;
        }
        let keep: Vec<usize> = match &self.confidence {
            Some(confidence) => {
                let mut order: Vec<usize> = (0..confidence.len()).collect();
                order.sort_by(|&a, &b| confidence[b].total_cmp(&confidence[a]));
                let mut keep = order[..k].to_vec();
                keep.sort_unstable();
                keep
            }
            None => (0..k).collect(),
        };
        self.retain_indices(&keep);
    }

    /// Keeps only the pairs at `indices` (ascending, in range).
    pub fn retain_indices(&mut self, indices: &[usize]) {
        self.query = indices.iter().map(|&i| self.query[i]).collect();
        self.render = indices.iter().map(|&i| self.render[i]).collect();
        if let Some(confidence) = &self.confidence {
            self.confidence = Some(indices.iter().map(|&i| confidence[i]).collect());
        }
    }
}

/// The query side of a match: the real image and its camera.
#[derive(Debug, Clone, Copy)]
pub struct QueryView<'a> {
    /// Stable frame identifier, used for diagnostics and lookups only.
    pub frame_id: &'a str,
    pub image: &'a RgbImage,
    pub intrinsics: &'a Intrinsics,
}

/// Matches a query image against a rendered view.
pub trait CorrespondenceMatcher {
    fn name(&self) -> &'static str;

    /// Returns `Ok(None)` when no usable pair was found; a returned set is never empty.
    fn match_views(
        &self,
        query: &QueryView<'_>,
        render: &RenderOutput,
    ) -> Result<Option<Correspondences>, MatchError>;
}

impl<M: CorrespondenceMatcher + ?Sized> CorrespondenceMatcher for Box<M> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn match_views(
        &self,
        query: &QueryView<'_>,
        render: &RenderOutput,
    ) -> Result<Option<Correspondences>, MatchError> {
        (**self).match_views(query, render)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    FeatureScore,
    ImagePair,
    Dense,
}

/// Thresholds shared by the matching strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub kind: MatcherKind,
    /// Minimum render score for a database keypoint.
    pub keypoint_threshold: f32,
    /// Side length of the non-maximum suppression window, in pixels.
    pub nms_kernel: u32,
    /// Keypoints closer than this to the image border are discarded.
    pub border: u32,
    pub max_keypoints: usize,
    /// Minimum cosine similarity accepted by the built-in nearest-neighbour matcher.
    pub min_similarity: f32,
    /// Optional Lowe ratio on descriptor distances.
    pub ratio_test: Option<f32>,
    /// Minimum confidence for dense matches.
    pub min_confidence: f32,
    pub max_matches: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            kind: MatcherKind::FeatureScore,
            keypoint_threshold: 0.01,
            nms_kernel: 7,
            border: 4,
            max_keypoints: 1024,
            min_similarity: 0.8,
            ratio_test: None,
            min_confidence: 0.01,
            max_matches: 2048,
        }
    }
}

impl MatcherConfig {
    pub fn detection(&self) -> DetectionParams {
        DetectionParams {
            threshold: self.keypoint_threshold,
            nms_kernel: self.nms_kernel,
            border: self.border,
            max_keypoints: self.max_keypoints,
        }
    }
}

/// Network back-ends handed to [`build_matcher`]. Only the ones required by the
/// selected [`MatcherKind`] need to be present.
#[derive(Default)]
pub struct MatcherBackends {
    pub encoder: Option<Box<dyn FeatureEncoder>>,
    pub decoder: Option<Box<dyn FeatureDecoder>>,
    /// Learned sparse matcher; defaults to [`MutualNearestNeighbor`].
    pub descriptor_matcher: Option<Box<dyn DescriptorMatcher>>,
    pub dense: Option<Box<dyn DensePairNetwork>>,
}

/// Builds the strategy selected by `config.kind`.
pub fn build_matcher(
    config: &MatcherConfig,
    backends: MatcherBackends,
) -> Result<Box<dyn CorrespondenceMatcher>, MatchError> {
    let MatcherBackends {
        encoder,
        decoder,
        descriptor_matcher,
        dense,
    } = backends;
    let descriptor_matcher = descriptor_matcher.unwrap_or_else(|| {
        Box::new(MutualNearestNeighbor {
            min_similarity: config.min_similarity,
            ratio: config.ratio_test,
        })
    });

    match config.kind {
        MatcherKind::FeatureScore => {
            let encoder = encoder.ok_or(MatchError::MissingBackend("feature encoder"))?;
            let mut matcher =
                FeatureScoreMatcher::new(encoder, descriptor_matcher, config.detection());
            if let Some(decoder) = decoder {
                matcher = matcher.with_decoder(decoder);
            }
            Ok(Box::new(matcher))
        }
        MatcherKind::ImagePair => {
            let encoder = encoder.ok_or(MatchError::MissingBackend("feature encoder"))?;
            Ok(Box::new(ImagePairMatcher::new(encoder, descriptor_matcher)))
        }
        MatcherKind::Dense => {
            let network = dense.ok_or(MatchError::MissingBackend("dense matcher"))?;
            Ok(Box::new(DenseMatcher::new(
                network,
                config.min_confidence,
                config.max_matches,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(n: usize) -> Vec<Vector2<f64>> {
        (0..n).map(|i| Vector2::new(i as f64, 2.0 * i as f64)).collect()
    }

    #[test]
    fn test_correspondences_reject_length_mismatch() {
        assert!(matches!(
            Correspondences::new(points(3), points(2)),
            Err(MatchError::LengthMismatch {
                query: 3,
                render: 2
            })
        ));
        assert!(matches!(
            Correspondences::with_confidence(points(3), points(3), vec![1.0; 2]),
            Err(MatchError::ConfidenceLengthMismatch {
                pairs: 3,
                confidence: 2
            })
        ));
    }

    #[test]
    fn test_truncate_top_k_keeps_order() {
        let mut matches =
            Correspondences::with_confidence(points(5), points(5), vec![0.1, 0.9, 0.5, 0.8, 0.2])
                .unwrap();
        matches.truncate_top_k(3);
        assert_eq!(matches.len(), 3);
        assert_eq!(matches.confidence().unwrap(), &[0.9, 0.5, 0.8]);
        assert_eq!(matches.query()[0], Vector2::new(1.0, 2.0));
        assert_eq!(matches.query().len(), matches.render().len());

        let mut plain = Correspondences::new(points(5), points(5)).unwrap();
        plain.truncate_top_k(2);
        assert_eq!(plain.render(), &points(2)[..]);
    }

    #[test]
    fn test_build_requires_backends() {
        let config = MatcherConfig::default();
        assert!(matches!(
            build_matcher(&config, MatcherBackends::default()),
            Err(MatchError::MissingBackend("feature encoder"))
        ));
        let dense = MatcherConfig {
            kind: MatcherKind::Dense,
            ..MatcherConfig::default()
        };
        assert!(matches!(
            build_matcher(&dense, MatcherBackends::default()),
            Err(MatchError::MissingBackend("dense matcher"))
        ));
    }
}
