use super::feature_score::pair_keypoints;
use super::keypoints::FeatureEncoder;
use super::{CorrespondenceMatcher, Correspondences, DescriptorMatcher, MatchError, QueryView};
use crate::render::RenderOutput;
use log::debug;

/// Runs the same encoder on the query and on the rendered color image.
pub struct ImagePairMatcher {
    encoder: Box<dyn FeatureEncoder>,
    matcher: Box<dyn DescriptorMatcher>,
}

impl ImagePairMatcher {
    pub fn new(encoder: Box<dyn FeatureEncoder>, matcher: Box<dyn DescriptorMatcher>) -> Self {
        ImagePairMatcher { encoder, matcher }
    }
}

impl CorrespondenceMatcher for ImagePairMatcher {
    fn name(&self) -> &'static str {
        "image_pair"
    }

    fn match_views(
        &self,
        query: &QueryView<'_>,
        render: &RenderOutput,
    ) -> Result<Option<Correspondences>, MatchError> {
        let rendered = self.encoder.encode(&render.color)?;
        let keypoints = self.encoder.encode(query.image)?;
        if rendered.is_empty() || keypoints.is_empty() {
            debug!(
                "Frame {}: {} query / {} rendered keypoints, nothing to match",
                query.frame_id,
                keypoints.len(),
                rendered.len()
            );
            return Ok(None);
        }
        let matches = self.matcher.match_descriptors(&keypoints, &rendered)?;
        pair_keypoints(&keypoints, &rendered, &matches)
    }
}
