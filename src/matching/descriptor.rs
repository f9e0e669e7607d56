//! Sparse descriptor matching.

use super::{Keypoints, MatchError};

/// One accepted pair between two keypoint sets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptorMatch {
    pub query_index: usize,
    pub render_index: usize,
    pub confidence: f32,
}

/// Pairs query keypoints with render keypoints (nearest neighbour, LightGlue, ...).
pub trait DescriptorMatcher {
    fn match_descriptors(
        &self,
        query: &Keypoints,
        render: &Keypoints,
    ) -> Result<Vec<DescriptorMatch>, MatchError>;
}

impl<D: DescriptorMatcher + ?Sized> DescriptorMatcher for Box<D> {
    fn match_descriptors(
        &self,
        query: &Keypoints,
        render: &Keypoints,
    ) -> Result<Vec<DescriptorMatch>, MatchError> {
        (**self).match_descriptors(query, render)
    }
}

/// Mutual nearest neighbours under cosine similarity.
///
/// The optional `ratio` applies Lowe's test to the descriptor distances
/// `sqrt(2 - 2 * similarity)` of the best and second best render candidates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MutualNearestNeighbor {
    pub min_similarity: f32,
    pub ratio: Option<f32>,
}

impl Default for MutualNearestNeighbor {
    fn default() -> Self {
        MutualNearestNeighbor {
            min_similarity: 0.8,
            ratio: None,
        }
    }
}

fn distance(similarity: f32) -> f32 {
    (2.0 - 2.0 * similarity).max(0.0).sqrt()
}

impl DescriptorMatcher for MutualNearestNeighbor {
    fn match_descriptors(
        &self,
        query: &Keypoints,
        render: &Keypoints,
    ) -> Result<Vec<DescriptorMatch>, MatchError> {
        if query.dimension() != render.dimension() {
            return Err(MatchError::DescriptorMismatch {
                query: query.dimension(),
                render: render.dimension(),
            });
        }
        if query.is_empty() || render.is_empty() {
            return Ok(Vec::new());
        }

        // rows: query keypoints, columns: render keypoints
        let similarity = query.descriptors() * render.descriptors().transpose();

        let best_query_for_render: Vec<usize> = (0..similarity.ncols())
            .map(|j| similarity.column(j).imax())
            .collect();

        let mut matches = Vec::new();
        for i in 0..similarity.nrows() {
            let row = similarity.row(i);
            let j = row.transpose().imax();
            let best = row[j];
            if best_query_for_render[j] != i || best < self.min_similarity {
                continue;
            }
            if let Some(ratio) = self.ratio {
                let second = row
                    .iter()
                    .enumerate()
                    .filter(|(k, _)| *k != j)
                    .map(|(_, s)| *s)
                    .fold(f32::NEG_INFINITY, f32::max);
                if second.is_finite() && distance(best) >= ratio * distance(second) {
                    continue;
                }
            }
            matches.push(DescriptorMatch {
                query_index: i,
                render_index: j,
                confidence: best,
            });
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, Vector2};

    fn keypoints(rows: &[[f32; 3]]) -> Keypoints {
        let positions = (0..rows.len())
            .map(|i| Vector2::new(i as f64, 0.0))
            .collect();
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Keypoints::new(
            positions,
            vec![1.0; rows.len()],
            DMatrix::from_row_slice(rows.len(), 3, &flat),
        )
        .unwrap()
    }

    #[test]
    fn test_mutual_matches_only() {
        let query = keypoints(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.9, 0.1, 0.0]]);
        let render = keypoints(&[[0.0, 1.0, 0.05], [1.0, 0.0, 0.0]]);
        let matcher = MutualNearestNeighbor {
            min_similarity: 0.5,
            ratio: None,
        };
        let matches = matcher.match_descriptors(&query, &render).unwrap();
        let pairs: Vec<(usize, usize)> = matches
            .iter()
            .map(|m| (m.query_index, m.render_index))
            .collect();
        // Query 2 also prefers render 1, but render 1 prefers query 0.
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
        assert!(matches.iter().all(|m| m.confidence >= 0.5));
    }

    #[test]
    fn test_similarity_and_ratio_thresholds() {
        let query = keypoints(&[[1.0, 1.0, 0.0]]);
        let render = keypoints(&[[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);
        let strict = MutualNearestNeighbor {
            min_similarity: 0.9,
            ratio: None,
        };
        assert!(strict.match_descriptors(&query, &render).unwrap().is_empty());

        let ambiguous_query = keypoints(&[[1.0, 0.0, 0.0]]);
        let ambiguous_render = keypoints(&[[0.99, 0.1, 0.0], [0.98, 0.12, 0.0]]);
        let with_ratio = MutualNearestNeighbor {
            min_similarity: 0.5,
            ratio: Some(0.8),
        };
        assert!(with_ratio
            .match_descriptors(&ambiguous_query, &ambiguous_render)
            .unwrap()
            .is_empty());
        let without_ratio = MutualNearestNeighbor {
            ratio: None,
            ..with_ratio
        };
        assert_eq!(
            without_ratio
                .match_descriptors(&ambiguous_query, &ambiguous_render)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_dimension_mismatch() {
        let query = keypoints(&[[1.0, 0.0, 0.0]]);
        let render = Keypoints::new(
            vec![Vector2::zeros()],
            vec![1.0],
            DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
        )
        .unwrap();
        assert!(matches!(
            MutualNearestNeighbor::default().match_descriptors(&query, &render),
            Err(MatchError::DescriptorMismatch { query: 3, render: 2 })
        ));
    }
}
