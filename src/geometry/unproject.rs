//! Lifting render-side matches to world points.

use crate::camera::{CameraModel, Intrinsics, PinholeModel};
use crate::geometry::CameraPose;
use crate::matching::Correspondences;
use crate::render::DepthMap;
use log::debug;
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Correspondences after 3D lifting.
///
/// `world[i]` pairs with `query[i]`; `source_indices[i]` is the index of that pair
/// in the [`Correspondences`] it was lifted from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldCorrespondences {
    pub world: Vec<Vector3<f64>>,
    pub query: Vec<Vector2<f64>>,
    pub source_indices: Vec<usize>,
}

impl WorldCorrespondences {
    pub fn len(&self) -> usize {
        self.world.len()
    }

    pub fn is_empty(&self) -> bool {
        self.world.is_empty()
    }
}

/// Back-projects the render-side pixels of `matches` with the rendered depth and
/// moves them into the world frame.
///
/// `render_pose` is the world-to-camera pose the depth map was rendered at. Pairs
/// whose depth is missing, non-finite or non-positive are dropped together with
/// their query-side point; this is filtering, not an error. So are pairs with a
/// non-finite query pixel or lifted point.
pub fn unproject_correspondences(
    matches: &Correspondences,
    depth: &DepthMap,
    intrinsics: &Intrinsics,
    render_pose: &CameraPose,
) -> WorldCorrespondences {
    let camera = PinholeModel {
        intrinsics: *intrinsics,
        resolution: depth.resolution(),
    };

    let mut lifted = WorldCorrespondences::default();
    for (idx, (query, render)) in matches.pairs().enumerate() {
        if !query.iter().all(|v| v.is_finite()) {
            continue;
        }
        let Some(z) = depth.depth_at(render) else {
            continue;
        };
        let Ok(point_cam) = camera.unproject_with_depth(render, z) else {
            continue;
        };
        let world = render_pose.inverse_transform_point(&point_cam);
        if !world.iter().all(|v| v.is_finite()) {
            continue;
        }
        lifted.world.push(world);
        lifted.query.push(*query);
        lifted.source_indices.push(idx);
    }

    debug!(
        "Unprojected {} of {} correspondences",
        lifted.len(),
        matches.len()
    );
    lifted
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 500.0,
            fy: 500.0,
            cx: 160.0,
            cy: 120.0,
        }
    }

    fn pose() -> CameraPose {
        CameraPose::from_world_to_camera(
            Rotation3::from_euler_angles(0.05, -0.3, 0.2),
            Vector3::new(0.2, -0.1, 1.5),
        )
    }

    #[test]
    fn test_round_trip_flat_depth() {
        let depth = DepthMap::filled(320, 240, 2.5);
        let k = intrinsics();
        let pose = pose();

        let render: Vec<Vector2<f64>> = vec![
            Vector2::new(10.0, 20.0),
            Vector2::new(160.0, 120.0),
            Vector2::new(300.25, 7.75),
            Vector2::new(45.5, 210.0),
        ];
        let matches = Correspondences::new(render.clone(), render.clone()).unwrap();
        let lifted = unproject_correspondences(&matches, &depth, &k, &pose);
        assert_eq!(lifted.len(), render.len());

        for (world, pixel) in lifted.world.iter().zip(render.iter()) {
            let cam = pose.transform_point(world);
            assert_relative_eq!(cam.z, 2.5, epsilon = 1e-9);
            let reprojected = k.project_unchecked(&cam).unwrap();
            assert!((reprojected - pixel).norm() < 1e-4);
        }
    }

    #[test]
    fn test_invalid_depth_is_filtered_index_for_index() {
        let mut depth = DepthMap::filled(64, 48, 1.0);
        depth.set(3, 4, 0.0);
        depth.set(10, 10, -2.0);
        depth.set(20, 30, f32::NAN);

        let render = vec![
            Vector2::new(1.0, 1.0),
            Vector2::new(3.0, 4.0),
            Vector2::new(5.0, 6.0),
            Vector2::new(10.0, 10.0),
            Vector2::new(20.0, 30.0),
            Vector2::new(100.0, 2.0),
            Vector2::new(40.0, 40.0),
        ];
        let query: Vec<Vector2<f64>> = (0..render.len())
            .map(|i| Vector2::new(i as f64, 1000.0 + i as f64))
            .collect();
        let matches = Correspondences::new(query.clone(), render).unwrap();

        let lifted = unproject_correspondences(&matches, &depth, &intrinsics(), &pose());
        // Three non-positive / NaN depths plus one pixel outside the map.
        assert_eq!(lifted.len(), 7 - 4);
        assert_eq!(lifted.source_indices, vec![0, 2, 6]);
        for (q, idx) in lifted.query.iter().zip(lifted.source_indices.iter()) {
            assert_eq!(*q, query[*idx]);
        }
    }

    #[test]
    fn test_non_finite_pixels_are_dropped() {
        let depth = DepthMap::filled(64, 48, 2.0);
        let mut query: Vec<Vector2<f64>> = (0..40)
            .map(|i| Vector2::new((i % 8) as f64 * 7.0, (i / 8) as f64 * 9.0))
            .collect();
        let mut render = query.clone();
        query.push(Vector2::new(5.0, 5.0));
        render.push(Vector2::new(f64::NAN, f64::NAN));
        query.push(Vector2::new(f64::INFINITY, 3.0));
        render.push(Vector2::new(6.0, 6.0));
        let matches = Correspondences::new(query, render).unwrap();

        let lifted = unproject_correspondences(&matches, &depth, &intrinsics(), &pose());
        assert_eq!(lifted.len(), 40);
        assert_eq!(lifted.source_indices, (0..40).collect::<Vec<_>>());
        assert!(lifted.world.iter().all(|p| p.iter().all(|v| v.is_finite())));
    }
}
