//! Synthetic cube scene with exact geometry.
//!
//! Stand-ins for the external collaborators: a ray-casting [`CubeRenderer`], an
//! [`OracleMatcher`] that knows the true query pose and a
//! [`PerturbedPoseProvider`] that corrupts known true poses by a fixed amount.
//! Together they exercise the whole refinement loop without any network.

use crate::camera::{CameraModel, Intrinsics, PinholeModel, Resolution};
use crate::dataset::Frame;
use crate::geometry::{reproject, sample_grid, CameraPose};
use crate::matching::{CorrespondenceMatcher, Correspondences, MatchError, QueryView};
use crate::refinement::{CoarseEstimate, CoarsePoseProvider};
use crate::render::{CollaboratorError, DepthMap, RenderOutput, SceneRenderer};
use image::{Rgb, RgbImage};
use log::debug;
use nalgebra::{Matrix3, Rotation3, Vector2, Vector3};
use std::collections::HashMap;

/// Base color per face, indexed by `2 * axis + positive_side`.
const FACE_COLORS: [[u8; 3]; 6] = [
    [220, 60, 60],
    [60, 200, 80],
    [70, 90, 230],
    [230, 200, 60],
    [200, 70, 210],
    [60, 200, 210],
];

const CHECKER_CELLS: f64 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    /// Ray parameter of the entry point.
    pub t: f64,
    /// `2 * axis + 1` for the face on the positive side of `axis`.
    pub face: usize,
}

/// Axis-aligned box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubeScene {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl CubeScene {
    pub fn new(center: Vector3<f64>, half_size: f64) -> Self {
        let half = Vector3::repeat(half_size);
        CubeScene {
            min: center - half,
            max: center + half,
        }
    }

    pub fn center(&self) -> Vector3<f64> {
        0.5 * (self.min + self.max)
    }

    /// First intersection of the ray `origin + t * direction` with the box
    /// surface, `t > 0`. Rays starting inside the box never hit.
    pub fn intersect(&self, origin: &Vector3<f64>, direction: &Vector3<f64>) -> Option<Hit> {
        let mut t_enter = f64::NEG_INFINITY;
        let mut t_exit = f64::INFINITY;
        let mut face = 0;
        for axis in 0..3 {
            let (o, d) = (origin[axis], direction[axis]);
            if d.abs() < 1e-12 {
                if o < self.min[axis] || o > self.max[axis] {
                    return None;
                }
                continue;
            }
            let t_min = (self.min[axis] - o) / d;
            let t_max = (self.max[axis] - o) / d;
            let (near, far, near_face) = if d > 0.0 {
                (t_min, t_max, 2 * axis)
            } else {
                (t_max, t_min, 2 * axis + 1)
            };
            if near > t_enter {
                t_enter = near;
                face = near_face;
            }
            t_exit = t_exit.min(far);
        }
        (t_enter <= t_exit && t_enter > 0.0).then_some(Hit { t: t_enter, face })
    }

    /// Whether `point` on the surface is the first thing seen from `eye`.
    pub fn visible_from(&self, eye: &Vector3<f64>, point: &Vector3<f64>) -> bool {
        let offset = point - eye;
        let distance = offset.norm();
        if distance <= f64::EPSILON {
            return false;
        }
        self.intersect(eye, &(offset / distance))
            .is_some_and(|hit| (hit.t - distance).abs() <= 1e-4 * distance.max(1.0))
    }

    fn shade(&self, point: &Vector3<f64>, face: usize) -> Rgb<u8> {
        let axis = face / 2;
        let size = self.max - self.min;
        let cell = |a: usize| ((point[a] - self.min[a]) / size[a] * CHECKER_CELLS).floor() as i64;
        let (u, v) = ((axis + 1) % 3, (axis + 2) % 3);
        let [r, g, b] = FACE_COLORS[face];
        if (cell(u) + cell(v)).rem_euclid(2) == 0 {
            Rgb([r, g, b])
        } else {
            Rgb([r / 2, g / 2, b / 2])
        }
    }
}

/// World-to-camera pose of a camera at `eye` looking at `target`.
///
/// Image `y` points away from `up`. `None` when the viewing direction is parallel
/// to `up`.
pub fn look_at(
    eye: &Vector3<f64>,
    target: &Vector3<f64>,
    up: &Vector3<f64>,
) -> Option<CameraPose> {
    let forward = (target - eye).try_normalize(1e-12)?;
    let right = forward.cross(up).try_normalize(1e-12)?;
    let down = forward.cross(&right);
    let rotation_c2w = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[
        right, down, forward,
    ]));
    Some(CameraPose::from_camera_to_world(rotation_c2w, *eye))
}

/// Ray-casting renderer for a [`CubeScene`].
///
/// Depth is the camera-frame `z` of the first hit; background pixels get depth
/// `0`, which unprojection treats as invalid.
#[derive(Debug, Clone, Copy)]
pub struct CubeRenderer {
    pub scene: CubeScene,
    pub background: Rgb<u8>,
}

impl CubeRenderer {
    pub fn new(scene: CubeScene) -> Self {
        CubeRenderer {
            scene,
            background: Rgb([24, 24, 24]),
        }
    }
}

impl SceneRenderer for CubeRenderer {
    fn render(
        &self,
        pose: &CameraPose,
        camera: &PinholeModel,
    ) -> Result<RenderOutput, CollaboratorError> {
        let Resolution { width, height } = camera.get_resolution();
        if width == 0 || height == 0 {
            return Err(CollaboratorError::Renderer(
                "cannot render an empty image".to_string(),
            ));
        }
        let eye = pose.camera_center();
        let rotation_c2w = pose.camera_to_world_rotation();
        let mut color = RgbImage::from_pixel(width, height, self.background);
        let mut depth = DepthMap::filled(width, height, 0.0);

        for y in 0..height {
            for x in 0..width {
                let ray_cam = camera
                    .unproject(&Vector2::new(x as f64, y as f64))
                    .map_err(|e| CollaboratorError::Renderer(e.to_string()))?;
                let ray = rotation_c2w * ray_cam;
                if let Some(hit) = self.scene.intersect(&eye, &ray) {
                    let point = eye + hit.t * ray;
                    color.put_pixel(x, y, self.scene.shade(&point, hit.face));
                    // Unit ray: z-depth is the distance scaled by the ray's z.
                    depth.set(x, y, (hit.t * ray_cam.z) as f32);
                }
            }
        }

        Ok(RenderOutput {
            pose: *pose,
            intrinsics: camera.get_intrinsics(),
            color,
            depth,
            features: None,
            scores: None,
        })
    }
}

/// Renders the query image of a synthetic frame at its ground-truth pose.
pub fn render_frame(
    renderer: &dyn SceneRenderer,
    id: impl Into<String>,
    ground_truth: CameraPose,
    camera: &PinholeModel,
) -> Result<Frame, CollaboratorError> {
    let render = renderer.render(&ground_truth, camera)?;
    Ok(Frame {
        id: id.into(),
        image: render.color,
        intrinsics: camera.get_intrinsics(),
        resolution: camera.get_resolution(),
        ground_truth,
    })
}

/// Matcher that knows the true pose of every query frame.
///
/// Render pixels on a regular grid are lifted with the rendered depth and
/// projected into the query image with the ground-truth pose. Points hidden from
/// the query camera or outside its image are dropped. Unknown frames get no match.
#[derive(Debug, Clone)]
pub struct OracleMatcher {
    scene: CubeScene,
    ground_truth: HashMap<String, CameraPose>,
    samples: usize,
}

impl OracleMatcher {
    pub fn new(scene: CubeScene, samples: usize) -> Self {
        OracleMatcher {
            scene,
            ground_truth: HashMap::new(),
            samples,
        }
    }

    pub fn insert(&mut self, frame_id: impl Into<String>, ground_truth: CameraPose) {
        self.ground_truth.insert(frame_id.into(), ground_truth);
    }
}

fn lift(render: &RenderOutput, pixel: &Vector2<f64>) -> Option<Vector3<f64>> {
    let z = render.depth.depth_at(pixel)?;
    let m = render.intrinsics.normalize(pixel);
    Some(
        render
            .pose
            .inverse_transform_point(&Vector3::new(m.x * z, m.y * z, z)),
    )
}

impl CorrespondenceMatcher for OracleMatcher {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn match_views(
        &self,
        query: &QueryView<'_>,
        render: &RenderOutput,
    ) -> Result<Option<Correspondences>, MatchError> {
        let Some(truth) = self.ground_truth.get(query.frame_id) else {
            return Ok(None);
        };
        let eye = truth.camera_center();
        let bounds = Resolution {
            width: query.image.width(),
            height: query.image.height(),
        };

        let (mut query_points, mut render_points) = (Vec::new(), Vec::new());
        for pixel in sample_grid(&render.resolution(), self.samples) {
            let Some(world) = lift(render, &pixel) else {
                continue;
            };
            if !self.scene.visible_from(&eye, &world) {
                continue;
            }
            let Some(observed) = reproject(truth, query.intrinsics, &world) else {
                continue;
            };
            if bounds.contains(&observed) {
                query_points.push(observed);
                render_points.push(pixel);
            }
        }
        debug!(
            "Frame {}: oracle produced {} matches",
            query.frame_id,
            query_points.len()
        );
        if query_points.is_empty() {
            return Ok(None);
        }
        Correspondences::new(query_points, render_points).map(Some)
    }
}

/// Coarse poses obtained by perturbing known true poses by a fixed amount.
///
/// Frames without a registered pose are reported as missing priors.
#[derive(Debug, Clone, PartialEq)]
pub struct PerturbedPoseProvider {
    /// Rotation applied in the camera frame, axis times angle in radians.
    pub axis_angle: Vector3<f64>,
    /// Shift of the camera center in the world frame.
    pub center_offset: Vector3<f64>,
    pub quality: f64,
    ground_truth: HashMap<String, CameraPose>,
}

impl PerturbedPoseProvider {
    pub fn new(axis_angle: Vector3<f64>, center_offset: Vector3<f64>) -> Self {
        PerturbedPoseProvider {
            axis_angle,
            center_offset,
            quality: 1000.0,
            ground_truth: HashMap::new(),
        }
    }

    /// Rotation of `rotation_deg` and center shift of `translation` along fixed
    /// diagonal directions.
    pub fn from_magnitudes(rotation_deg: f64, translation: f64) -> Self {
        let axis = Vector3::new(1.0, -1.0, 1.0).normalize();
        let direction = Vector3::new(1.0, 1.0, -1.0).normalize();
        Self::new(
            axis * rotation_deg.to_radians(),
            direction * translation,
        )
    }

    pub fn insert(&mut self, frame_id: impl Into<String>, ground_truth: CameraPose) {
        self.ground_truth.insert(frame_id.into(), ground_truth);
    }
}

impl CoarsePoseProvider for PerturbedPoseProvider {
    fn estimate(&self, query: &QueryView<'_>) -> Result<CoarseEstimate, CollaboratorError> {
        let truth = self
            .ground_truth
            .get(query.frame_id)
            .ok_or_else(|| CollaboratorError::MissingPrior(query.frame_id.to_string()))?;
        Ok(CoarseEstimate {
            pose: truth.perturbed(&self.axis_angle, &self.center_offset),
            quality: Some(self.quality),
        })
    }
}

/// Cameras on a circle around the scene center, all looking at it.
pub fn orbit(scene: &CubeScene, count: usize, radius: f64, height: f64) -> Vec<CameraPose> {
    let center = scene.center();
    (0..count)
        .filter_map(|i| {
            let angle = 0.4 + i as f64 * std::f64::consts::TAU / count.max(1) as f64;
            let eye = center + Vector3::new(radius * angle.cos(), radius * angle.sin(), height);
            look_at(&eye, &center, &Vector3::z())
        })
        .collect()
}

/// Camera used by the synthetic tests and demo.
pub fn default_camera() -> PinholeModel {
    let resolution = Resolution {
        width: 320,
        height: 240,
    };
    PinholeModel {
        intrinsics: Intrinsics::from_focal(300.0, &resolution),
        resolution,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn frontal() -> CameraPose {
        CameraPose::from_camera_to_world(Rotation3::identity(), Vector3::new(0.0, 0.0, -3.0))
    }

    #[test]
    fn test_intersect_and_visibility() {
        let scene = CubeScene::new(Vector3::zeros(), 0.5);
        let eye = Vector3::new(0.0, 0.0, -3.0);
        let hit = scene.intersect(&eye, &Vector3::z()).unwrap();
        assert_relative_eq!(hit.t, 2.5);
        assert_eq!(hit.face, 4);
        assert!(scene.intersect(&eye, &-Vector3::z()).is_none());
        assert!(scene.intersect(&Vector3::zeros(), &Vector3::x()).is_none());

        assert!(scene.visible_from(&eye, &Vector3::new(0.1, 0.2, -0.5)));
        assert!(!scene.visible_from(&eye, &Vector3::new(0.1, 0.2, 0.5)));
    }

    #[test]
    fn test_look_at_points_the_optical_axis() {
        let eye = Vector3::new(2.0, -1.6, 1.2);
        let pose = look_at(&eye, &Vector3::zeros(), &Vector3::z()).unwrap();
        assert_relative_eq!(pose.camera_center(), eye, epsilon = 1e-12);
        let target_cam = pose.transform_point(&Vector3::zeros());
        assert_relative_eq!(target_cam.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(target_cam.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(target_cam.z, eye.norm(), epsilon = 1e-12);
        // World up maps to image up (negative y).
        assert!(pose.transform_point(&Vector3::new(0.0, 0.0, 0.5)).y < 0.0);
        assert!(pose.rotation().matrix().determinant() > 0.0);

        assert!(look_at(&Vector3::zeros(), &Vector3::z(), &Vector3::z()).is_none());
    }

    #[test]
    fn test_renderer_depth_and_background() {
        let scene = CubeScene::new(Vector3::zeros(), 0.5);
        let renderer = CubeRenderer::new(scene);
        let camera = PinholeModel {
            intrinsics: Intrinsics {
                fx: 50.0,
                fy: 50.0,
                cx: 32.0,
                cy: 24.0,
            },
            resolution: Resolution {
                width: 64,
                height: 48,
            },
        };
        let render = renderer.render(&frontal(), &camera).unwrap();
        render.validate().unwrap();
        assert_relative_eq!(
            render.depth.depth_at(&Vector2::new(32.0, 24.0)).unwrap(),
            2.5,
            epsilon = 1e-6
        );
        assert!(render.depth.depth_at(&Vector2::new(0.0, 0.0)).is_none());
        assert_eq!(*render.color.get_pixel(0, 0), renderer.background);
        assert_ne!(*render.color.get_pixel(32, 24), renderer.background);
    }

    #[test]
    fn test_oracle_matches_are_consistent() {
        let scene = CubeScene::new(Vector3::zeros(), 0.5);
        let renderer = CubeRenderer::new(scene);
        let camera = default_camera();
        let truth = look_at(&Vector3::new(2.0, -1.6, 1.2), &Vector3::zeros(), &Vector3::z()).unwrap();
        let frame = render_frame(&renderer, "cube-0", truth, &camera).unwrap();

        let mut oracle = OracleMatcher::new(scene, 900);
        oracle.insert("cube-0", truth);
        let render = renderer.render(&truth, &camera).unwrap();
        let query = QueryView {
            frame_id: &frame.id,
            image: &frame.image,
            intrinsics: &frame.intrinsics,
        };
        let matches = oracle.match_views(&query, &render).unwrap().unwrap();
        assert!(matches.len() > 50);
        // Rendering at the true pose maps every pixel onto itself.
        for (q, r) in matches.pairs() {
            assert_relative_eq!(q, r, epsilon = 1e-3);
        }

        let unknown = QueryView {
            frame_id: "other",
            ..query
        };
        assert!(oracle.match_views(&unknown, &render).unwrap().is_none());
    }

    #[test]
    fn test_perturbed_provider_magnitudes() {
        let scene = CubeScene::new(Vector3::zeros(), 0.5);
        let renderer = CubeRenderer::new(scene);
        let truth = orbit(&scene, 4, 3.0, 1.0)[0];
        let frame = render_frame(&renderer, "f", truth, &default_camera()).unwrap();
        let mut provider = PerturbedPoseProvider::from_magnitudes(2.0, 0.05);
        provider.insert("f", truth);
        let query = QueryView {
            frame_id: &frame.id,
            image: &frame.image,
            intrinsics: &frame.intrinsics,
        };
        let estimate = provider.estimate(&query).unwrap();
        let error = crate::metrics::pose_error(&estimate.pose, &truth);
        assert_relative_eq!(error.rotation_deg, 2.0, epsilon = 1e-6);
        assert_relative_eq!(error.translation, 0.05, epsilon = 1e-9);
        assert_eq!(estimate.quality, Some(1000.0));

        let unknown = QueryView {
            frame_id: "g",
            ..query
        };
        assert!(matches!(
            provider.estimate(&unknown),
            Err(CollaboratorError::MissingPrior(id)) if id == "g"
        ));
    }
}
