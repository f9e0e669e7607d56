use super::{CorrespondenceMatcher, Correspondences, MatchError, QueryView};
use crate::render::RenderOutput;
use image::RgbImage;
use log::debug;
use nalgebra::Vector2;

/// One correspondence emitted by a dense matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenseMatch {
    pub query: Vector2<f64>,
    pub render: Vector2<f64>,
    pub confidence: f32,
}

/// End-to-end matcher taking an image pair (LoFTR-style).
pub trait DensePairNetwork {
    fn correspond(&self, query: &RgbImage, render: &RgbImage)
        -> Result<Vec<DenseMatch>, MatchError>;
}

impl<N: DensePairNetwork + ?Sized> DensePairNetwork for Box<N> {
    fn correspond(
        &self,
        query: &RgbImage,
        render: &RgbImage,
    ) -> Result<Vec<DenseMatch>, MatchError> {
        (**self).correspond(query, render)
    }
}

pub struct DenseMatcher {
    network: Box<dyn DensePairNetwork>,
    min_confidence: f32,
    max_matches: usize,
}

impl DenseMatcher {
    pub fn new(network: Box<dyn DensePairNetwork>, min_confidence: f32, max_matches: usize) -> Self {
        DenseMatcher {
            network,
            min_confidence,
            max_matches,
        }
    }
}

impl CorrespondenceMatcher for DenseMatcher {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn match_views(
        &self,
        query: &QueryView<'_>,
        render: &RenderOutput,
    ) -> Result<Option<Correspondences>, MatchError> {
        let raw = self.network.correspond(query.image, &render.color)?;
        let resolution = render.resolution();
        let total = raw.len();
        let (mut query_points, mut render_points, mut confidence) =
            (Vec::new(), Vec::new(), Vec::new());
        for m in raw {
            if m.confidence.is_nan()
                || m.confidence < self.min_confidence
                || !resolution.contains(&m.render)
                || !m.query.iter().all(|v| v.is_finite())
            {
                continue;
            }
            query_points.push(m.query);
            render_points.push(m.render);
            confidence.push(m.confidence);
        }
        debug!(
            "Frame {}: kept {} of {} dense matches",
            query.frame_id,
            query_points.len(),
            total
        );
        if query_points.is_empty() {
            return Ok(None);
        }
        let mut matches = Correspondences::with_confidence(query_points, render_points, confidence)?;
        matches.truncate_top_k(self.max_matches);
        Ok(Some(matches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Intrinsics;
    use crate::geometry::CameraPose;
    use crate::render::DepthMap;

    struct Canned(Vec<DenseMatch>);

    impl DensePairNetwork for Canned {
        fn correspond(
            &self,
            _query: &RgbImage,
            _render: &RgbImage,
        ) -> Result<Vec<DenseMatch>, MatchError> {
            Ok(self.0.clone())
        }
    }

    fn dense(q: (f64, f64), r: (f64, f64), confidence: f32) -> DenseMatch {
        DenseMatch {
            query: Vector2::new(q.0, q.1),
            render: Vector2::new(r.0, r.1),
            confidence,
        }
    }

    #[test]
    fn test_filters_confidence_bounds_and_caps() {
        let network = Canned(vec![
            dense((1.0, 1.0), (2.0, 2.0), 0.9),
            dense((3.0, 3.0), (4.0, 4.0), 0.05),
            dense((5.0, 5.0), (50.0, 4.0), 0.95),
            dense((6.0, 6.0), (7.0, 7.0), 0.7),
            dense((8.0, 8.0), (9.0, 9.0), f32::NAN),
            dense((9.0, 1.0), (1.0, 9.0), 0.8),
            dense((f64::NAN, 2.0), (3.0, 3.0), 0.99),
            dense((2.0, 2.0), (f64::NAN, 3.0), 0.99),
        ]);
        let matcher = DenseMatcher::new(Box::new(network), 0.1, 2);
        let image = RgbImage::new(16, 16);
        let render = RenderOutput {
            pose: CameraPose::identity(),
            intrinsics: Intrinsics {
                fx: 10.0,
                fy: 10.0,
                cx: 8.0,
                cy: 8.0,
            },
            color: RgbImage::new(16, 16),
            depth: DepthMap::filled(16, 16, 1.0),
            features: None,
            scores: None,
        };
        let view = QueryView {
            frame_id: "f",
            image: &image,
            intrinsics: &render.intrinsics,
        };
        let matches = matcher.match_views(&view, &render).unwrap().unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches.confidence().unwrap(), &[0.9, 0.8]);
        assert_eq!(matches.render()[1], Vector2::new(1.0, 9.0));
    }
}
