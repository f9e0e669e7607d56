//! Sparse keypoints and their extraction from rendered score and feature maps.

use super::MatchError;
use crate::render::{FeatureMap, ScoreMap};
use image::RgbImage;
use nalgebra::{DMatrix, Vector2};

/// Keypoints with one L2-normalized descriptor per row of `descriptors`.
#[derive(Debug, Clone, PartialEq)]
pub struct Keypoints {
    positions: Vec<Vector2<f64>>,
    scores: Vec<f32>,
    descriptors: DMatrix<f32>,
}

impl Keypoints {
    pub fn new(
        positions: Vec<Vector2<f64>>,
        scores: Vec<f32>,
        descriptors: DMatrix<f32>,
    ) -> Result<Self, MatchError> {
        if positions.len() != scores.len() || positions.len() != descriptors.nrows() {
            return Err(MatchError::Backend(format!(
                "keypoint arrays disagree: {} positions, {} scores, {} descriptors",
                positions.len(),
                scores.len(),
                descriptors.nrows()
            )));
        }
        let mut descriptors = descriptors;
        for mut row in descriptors.row_iter_mut() {
            let norm = row.norm();
            if norm > f32::EPSILON {
                row /= norm;
            }
        }
        Ok(Keypoints {
            positions,
            scores,
            descriptors,
        })
    }

    pub fn empty(dimension: usize) -> Self {
        Keypoints {
            positions: Vec::new(),
            scores: Vec::new(),
            descriptors: DMatrix::zeros(0, dimension),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Vector2<f64>] {
        &self.positions
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn descriptors(&self) -> &DMatrix<f32> {
        &self.descriptors
    }

    pub fn dimension(&self) -> usize {
        self.descriptors.ncols()
    }

    /// Replaces the descriptors, keeping positions and scores.
    pub fn with_descriptors(self, descriptors: DMatrix<f32>) -> Result<Self, MatchError> {
        Self::new(self.positions, self.scores, descriptors)
    }
}

/// Detects keypoints and computes descriptors on an image (SuperPoint-style).
pub trait FeatureEncoder {
    fn encode(&self, image: &RgbImage) -> Result<Keypoints, MatchError>;
}

impl<E: FeatureEncoder + ?Sized> FeatureEncoder for Box<E> {
    fn encode(&self, image: &RgbImage) -> Result<Keypoints, MatchError> {
        (**self).encode(image)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    pub threshold: f32,
    pub nms_kernel: u32,
    pub border: u32,
    pub max_keypoints: usize,
}

/// Picks local maxima of a rendered score map.
///
/// A pixel survives when its score reaches `threshold`, it is the maximum of the
/// `nms_kernel` window around it and it lies at least `border` pixels inside the
/// image. Plateaus keep their first pixel in raster order. The result is sorted by
/// decreasing score and capped at `max_keypoints`.
pub fn detect_from_scores(scores: &ScoreMap, params: &DetectionParams) -> Vec<(Vector2<f64>, f32)> {
    let resolution = scores.resolution();
    let (width, height) = (resolution.width, resolution.height);
    let radius = (params.nms_kernel / 2) as i64;
    let border = params.border;
    if width <= 2 * border || height <= 2 * border {
        return Vec::new();
    }

    let mut detections = Vec::new();
    for y in border..height - border {
        for x in border..width - border {
            let score = scores.score(x, y);
            if !score.is_finite() || score < params.threshold {
                continue;
            }
            if is_window_maximum(scores, x, y, radius) {
                detections.push((Vector2::new(x as f64, y as f64), score));
            }
        }
    }

    detections.sort_by(|a, b| b.1.total_cmp(&a.1));
    detections.truncate(params.max_keypoints);
    detections
}

fn is_window_maximum(scores: &ScoreMap, x: u32, y: u32, radius: i64) -> bool {
    let resolution = scores.resolution();
    let center = scores.score(x, y);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx == 0 && dy == 0 {
                continue;
            }
            let (nx, ny) = (x as i64 + dx, y as i64 + dy);
            if nx < 0 || ny < 0 || nx >= resolution.width as i64 || ny >= resolution.height as i64
            {
                continue;
            }
            let neighbour = scores.score(nx as u32, ny as u32);
            let earlier = dy < 0 || (dy == 0 && dx < 0);
            if neighbour > center || (earlier && neighbour == center) {
                return false;
            }
        }
    }
    true
}

/// Keypoints from a rendered score map, described by the rendered feature map.
pub fn describe_rendered(
    scores: &ScoreMap,
    features: &FeatureMap,
    params: &DetectionParams,
) -> Result<Keypoints, MatchError> {
    let detections = detect_from_scores(scores, params);
    let mut positions = Vec::with_capacity(detections.len());
    let mut kept_scores = Vec::with_capacity(detections.len());
    let mut rows = Vec::with_capacity(detections.len() * features.channels());
    for (position, score) in detections {
        let Some(descriptor) = features.sample(&position) else {
            continue;
        };
        positions.push(position);
        kept_scores.push(score);
        rows.extend(descriptor);
    }
    let descriptors = DMatrix::from_row_slice(positions.len(), features.channels(), &rows);
    Keypoints::new(positions, kept_scores, descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::FloatImage;
    use approx::assert_relative_eq;
    use image::Luma;

    fn score_map(width: u32, height: u32, peaks: &[(u32, u32, f32)]) -> ScoreMap {
        let mut image = FloatImage::new(width, height);
        for &(x, y, s) in peaks {
            image.put_pixel(x, y, Luma([s]));
        }
        ScoreMap::new(image)
    }

    fn params() -> DetectionParams {
        DetectionParams {
            threshold: 0.1,
            nms_kernel: 5,
            border: 2,
            max_keypoints: 10,
        }
    }

    #[test]
    fn test_nms_suppresses_neighbours() {
        let scores = score_map(
            20,
            20,
            &[(5, 5, 0.9), (6, 6, 0.5), (12, 12, 0.7), (15, 4, 0.05), (0, 0, 1.0)],
        );
        let detections = detect_from_scores(&scores, &params());
        let positions: Vec<_> = detections.iter().map(|(p, _)| *p).collect();
        // (6,6) is inside the window of the stronger (5,5); (15,4) is below threshold;
        // (0,0) lies on the border.
        assert_eq!(positions, vec![Vector2::new(5.0, 5.0), Vector2::new(12.0, 12.0)]);
        assert_relative_eq!(detections[0].1, 0.9);
    }

    #[test]
    fn test_plateau_keeps_single_pixel() {
        let scores = score_map(10, 10, &[(4, 4, 0.5), (5, 4, 0.5)]);
        let detections = detect_from_scores(&scores, &params());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].0, Vector2::new(4.0, 4.0));
    }

    #[test]
    fn test_max_keypoints_keeps_strongest() {
        let scores = score_map(40, 10, &[(5, 5, 0.2), (15, 5, 0.8), (25, 5, 0.5)]);
        let detections = detect_from_scores(
            &scores,
            &DetectionParams {
                max_keypoints: 2,
                ..params()
            },
        );
        let values: Vec<f32> = detections.iter().map(|(_, s)| *s).collect();
        assert_eq!(values, vec![0.8, 0.5]);
    }

    #[test]
    fn test_describe_rendered_normalizes_rows() {
        let scores = score_map(10, 10, &[(4, 5, 0.9)]);
        let mut data = Vec::new();
        for _ in 0..100 {
            data.extend([3.0, 4.0]);
        }
        let features = FeatureMap::new(10, 10, 2, data).unwrap();
        let keypoints = describe_rendered(&scores, &features, &params()).unwrap();
        assert_eq!(keypoints.len(), 1);
        assert_eq!(keypoints.dimension(), 2);
        assert_relative_eq!(keypoints.descriptors()[(0, 0)], 0.6, epsilon = 1e-6);
        assert_relative_eq!(keypoints.descriptors()[(0, 1)], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_keypoints_reject_mismatched_arrays() {
        let result = Keypoints::new(vec![Vector2::zeros()], vec![], DMatrix::zeros(1, 4));
        assert!(matches!(result, Err(MatchError::Backend(_))));
    }
}
