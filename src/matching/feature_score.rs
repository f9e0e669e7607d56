use super::keypoints::{describe_rendered, DetectionParams, FeatureEncoder, Keypoints};
use super::{
    CorrespondenceMatcher, Correspondences, DescriptorMatcher, MatchError, QueryView,
};
use crate::render::RenderOutput;
use log::debug;
use nalgebra::DMatrix;

/// Lifts low-dimensional rendered features into the query descriptor space.
pub trait FeatureDecoder {
    fn decode(&self, descriptors: &DMatrix<f32>) -> Result<DMatrix<f32>, MatchError>;
}

impl<F: FeatureDecoder + ?Sized> FeatureDecoder for Box<F> {
    fn decode(&self, descriptors: &DMatrix<f32>) -> Result<DMatrix<f32>, MatchError> {
        (**self).decode(descriptors)
    }
}

/// Matches the query against keypoints read off the renderer's score and feature maps.
pub struct FeatureScoreMatcher {
    encoder: Box<dyn FeatureEncoder>,
    decoder: Option<Box<dyn FeatureDecoder>>,
    matcher: Box<dyn DescriptorMatcher>,
    detection: DetectionParams,
}

impl FeatureScoreMatcher {
    pub fn new(
        encoder: Box<dyn FeatureEncoder>,
        matcher: Box<dyn DescriptorMatcher>,
        detection: DetectionParams,
    ) -> Self {
        FeatureScoreMatcher {
            encoder,
            decoder: None,
            matcher,
            detection,
        }
    }

    pub fn with_decoder(mut self, decoder: Box<dyn FeatureDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    fn database_keypoints(&self, render: &RenderOutput) -> Result<Keypoints, MatchError> {
        let features = render
            .features
            .as_ref()
            .ok_or(MatchError::MissingRenderChannel("feature map"))?;
        let scores = render
            .scores
            .as_ref()
            .ok_or(MatchError::MissingRenderChannel("score map"))?;
        let keypoints = describe_rendered(scores, features, &self.detection)?;
        match &self.decoder {
            Some(decoder) if !keypoints.is_empty() => {
                let decoded = decoder.decode(keypoints.descriptors())?;
                keypoints.with_descriptors(decoded)
            }
            _ => Ok(keypoints),
        }
    }
}

impl CorrespondenceMatcher for FeatureScoreMatcher {
    fn name(&self) -> &'static str {
        "feature_score"
    }

    fn match_views(
        &self,
        query: &QueryView<'_>,
        render: &RenderOutput,
    ) -> Result<Option<Correspondences>, MatchError> {
        let database = self.database_keypoints(render)?;
        if database.is_empty() {
            debug!("Frame {}: no keypoints in rendered score map", query.frame_id);
            return Ok(None);
        }
        let keypoints = self.encoder.encode(query.image)?;
        if keypoints.is_empty() {
            debug!("Frame {}: no keypoints in query image", query.frame_id);
            return Ok(None);
        }
        debug!(
            "Frame {}: {} query / {} rendered keypoints",
            query.frame_id,
            keypoints.len(),
            database.len()
        );
        let matches = self.matcher.match_descriptors(&keypoints, &database)?;
        pair_keypoints(&keypoints, &database, &matches)
    }
}

/// Converts index matches into pixel correspondences; `None` when nothing matched.
pub(crate) fn pair_keypoints(
    query: &Keypoints,
    render: &Keypoints,
    matches: &[super::DescriptorMatch],
) -> Result<Option<Correspondences>, MatchError> {
    if matches.is_empty() {
        return Ok(None);
    }
    let mut query_points = Vec::with_capacity(matches.len());
    let mut render_points = Vec::with_capacity(matches.len());
    let mut confidence = Vec::with_capacity(matches.len());
    for m in matches {
        let (Some(q), Some(r)) = (
            query.positions().get(m.query_index),
            render.positions().get(m.render_index),
        ) else {
            return Err(MatchError::Backend(format!(
                "match ({}, {}) refers to a missing keypoint",
                m.query_index, m.render_index
            )));
        };
        query_points.push(*q);
        render_points.push(*r);
        confidence.push(m.confidence);
    }
    Correspondences::with_confidence(query_points, render_points, confidence).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Intrinsics;
    use crate::geometry::CameraPose;
    use crate::matching::MutualNearestNeighbor;
    use crate::render::{DepthMap, FeatureMap, FloatImage, ScoreMap};
    use image::{Luma, RgbImage};
    use nalgebra::Vector2;

    /// Reports fixed keypoints regardless of the image.
    struct FixedEncoder(Keypoints);

    impl FeatureEncoder for FixedEncoder {
        fn encode(&self, _image: &RgbImage) -> Result<Keypoints, MatchError> {
            Ok(self.0.clone())
        }
    }

    struct Doubling;

    impl FeatureDecoder for Doubling {
        fn decode(&self, descriptors: &DMatrix<f32>) -> Result<DMatrix<f32>, MatchError> {
            let mut out = DMatrix::zeros(descriptors.nrows(), descriptors.ncols() * 2);
            for r in 0..descriptors.nrows() {
                for c in 0..descriptors.ncols() {
                    out[(r, 2 * c)] = descriptors[(r, c)];
                    out[(r, 2 * c + 1)] = descriptors[(r, c)];
                }
            }
            Ok(out)
        }
    }

    fn intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 20.0,
            fy: 20.0,
            cx: 10.0,
            cy: 10.0,
        }
    }

    /// Two peaks: (5,5) with descriptor x, (14,12) with descriptor y.
    fn render(with_maps: bool) -> RenderOutput {
        let mut scores = FloatImage::new(20, 20);
        scores.put_pixel(5, 5, Luma([0.9]));
        scores.put_pixel(14, 12, Luma([0.7]));
        let mut data = vec![0.0f32; 20 * 20 * 2];
        for y in 0..20 {
            for x in 0..20 {
                let i = (y * 20 + x) * 2;
                if x < 10 {
                    data[i] = 1.0;
                } else {
                    data[i + 1] = 1.0;
                }
            }
        }
        RenderOutput {
            pose: CameraPose::identity(),
            intrinsics: intrinsics(),
            color: RgbImage::new(20, 20),
            depth: DepthMap::filled(20, 20, 1.0),
            features: with_maps.then(|| FeatureMap::new(20, 20, 2, data).unwrap()),
            scores: with_maps.then(|| ScoreMap::new(scores)),
        }
    }

    fn query_keypoints(dimension: usize) -> Keypoints {
        let mut descriptors = DMatrix::zeros(2, dimension);
        descriptors[(0, dimension - 1)] = 1.0;
        descriptors[(1, 0)] = 1.0;
        Keypoints::new(
            vec![Vector2::new(15.0, 11.0), Vector2::new(4.0, 6.0)],
            vec![0.5, 0.5],
            descriptors,
        )
        .unwrap()
    }

    fn detection() -> DetectionParams {
        DetectionParams {
            threshold: 0.1,
            nms_kernel: 3,
            border: 1,
            max_keypoints: 10,
        }
    }

    #[test]
    fn test_matches_rendered_keypoints() {
        let matcher = FeatureScoreMatcher::new(
            Box::new(FixedEncoder(query_keypoints(2))),
            Box::new(MutualNearestNeighbor::default()),
            detection(),
        );
        let image = RgbImage::new(20, 20);
        let k = intrinsics();
        let view = QueryView {
            frame_id: "seq-01/frame-000000",
            image: &image,
            intrinsics: &k,
        };
        let matches = matcher.match_views(&view, &render(true)).unwrap().unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches.query()[0], Vector2::new(15.0, 11.0));
        assert_eq!(matches.render()[0], Vector2::new(14.0, 12.0));
        assert_eq!(matches.render()[1], Vector2::new(5.0, 5.0));
    }

    #[test]
    fn test_decoder_lifts_render_descriptors() {
        let matcher = FeatureScoreMatcher::new(
            Box::new(FixedEncoder(query_keypoints(4))),
            Box::new(MutualNearestNeighbor {
                min_similarity: 0.5,
                ratio: None,
            }),
            detection(),
        )
        .with_decoder(Box::new(Doubling));
        let image = RgbImage::new(20, 20);
        let k = intrinsics();
        let view = QueryView {
            frame_id: "f",
            image: &image,
            intrinsics: &k,
        };
        let matches = matcher.match_views(&view, &render(true)).unwrap().unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn test_missing_channels_and_empty_query() {
        let image = RgbImage::new(20, 20);
        let k = intrinsics();
        let view = QueryView {
            frame_id: "f",
            image: &image,
            intrinsics: &k,
        };
        let matcher = FeatureScoreMatcher::new(
            Box::new(FixedEncoder(query_keypoints(2))),
            Box::new(MutualNearestNeighbor::default()),
            detection(),
        );
        assert!(matches!(
            matcher.match_views(&view, &render(false)),
            Err(MatchError::MissingRenderChannel("feature map"))
        ));

        let empty = FeatureScoreMatcher::new(
            Box::new(FixedEncoder(Keypoints::empty(2))),
            Box::new(MutualNearestNeighbor::default()),
            detection(),
        );
        assert!(empty.match_views(&view, &render(true)).unwrap().is_none());
    }
}
