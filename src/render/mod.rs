//! Render outputs and the scene renderer contract.
//!
//! The renderer itself (a point-based differentiable rasterizer) lives outside this
//! crate. It only has to honour [`SceneRenderer`]: for a world-to-camera pose it
//! produces a color image and a z-depth map, and optionally a dense feature map and
//! a keypoint score map, all pixel-aligned with the rendered camera.

use crate::camera::{Intrinsics, PinholeModel, Resolution};
use crate::geometry::CameraPose;
use image::{ImageBuffer, Luma, RgbImage};
use nalgebra::Vector2;

/// Single-channel float image.
pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Failure of an external collaborator (renderer, coarse pose provider, network).
#[derive(thiserror::Error, Debug)]
pub enum CollaboratorError {
    #[error("Renderer failed: {0}")]
    Renderer(String),
    #[error("Coarse pose provider failed: {0}")]
    CoarsePose(String),
    #[error("No coarse pose available for frame {0}")]
    MissingPrior(String),
    #[error("Invalid render output: {0}")]
    InvalidOutput(String),
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Rendered z-depth, one value per pixel.
#[derive(Debug, Clone)]
pub struct DepthMap(FloatImage);

impl DepthMap {
    pub fn new(image: FloatImage) -> Self {
        DepthMap(image)
    }

    pub fn from_raw(width: u32, height: u32, data: Vec<f32>) -> Result<Self, CollaboratorError> {
        let expected = width as usize * height as usize;
        let found = data.len();
        FloatImage::from_raw(width, height, data)
            .map(DepthMap)
            .ok_or_else(|| {
                CollaboratorError::InvalidOutput(format!(
                    "depth buffer holds {found} values, expected {expected}"
                ))
            })
    }

    pub fn filled(width: u32, height: u32, depth: f32) -> Self {
        DepthMap(FloatImage::from_pixel(width, height, Luma([depth])))
    }

    pub fn set(&mut self, x: u32, y: u32, depth: f32) {
        self.0.put_pixel(x, y, Luma([depth]));
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.0.width(),
            height: self.0.height(),
        }
    }

    /// Depth at the pixel nearest to `pixel`.
    ///
    /// `None` when the pixel is not finite, lies outside the map, or the stored
    /// depth is not a positive finite number (background, holes).
    pub fn depth_at(&self, pixel: &Vector2<f64>) -> Option<f64> {
        let (x, y) = (pixel.x.round(), pixel.y.round());
        if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
            return None;
        }
        let value = self.0.get_pixel_checked(x as u32, y as u32)?.0[0];
        (value.is_finite() && value > 0.0).then_some(value as f64)
    }

    pub fn as_image(&self) -> &FloatImage {
        &self.0
    }
}

/// Per-pixel keypoint score rendered alongside the color image.
#[derive(Debug, Clone)]
pub struct ScoreMap(FloatImage);

impl ScoreMap {
    pub fn new(image: FloatImage) -> Self {
        ScoreMap(image)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.0.width(),
            height: self.0.height(),
        }
    }

    pub fn score(&self, x: u32, y: u32) -> f32 {
        self.0.get_pixel(x, y).0[0]
    }
}

/// Dense descriptor map stored channel-last (`H x W x C`).
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    width: u32,
    height: u32,
    channels: usize,
    data: Vec<f32>,
}

impl FeatureMap {
    pub fn new(
        width: u32,
        height: u32,
        channels: usize,
        data: Vec<f32>,
    ) -> Result<Self, CollaboratorError> {
        let expected = width as usize * height as usize * channels;
        if channels == 0 || expected == 0 || data.len() != expected {
            return Err(CollaboratorError::InvalidOutput(format!(
                "feature buffer holds {} values, expected {expected} ({width}x{height}x{channels})",
                data.len()
            )));
        }
        Ok(FeatureMap {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }

    fn texel(&self, x: u32, y: u32) -> &[f32] {
        let start = (y as usize * self.width as usize + x as usize) * self.channels;
        &self.data[start..start + self.channels]
    }

    /// Bilinearly interpolated descriptor at a sub-pixel location.
    pub fn sample(&self, pixel: &Vector2<f64>) -> Option<Vec<f32>> {
        let max_x = (self.width - 1) as f64;
        let max_y = (self.height - 1) as f64;
        if !(0.0..=max_x).contains(&pixel.x) || !(0.0..=max_y).contains(&pixel.y) {
            return None;
        }
        let x0 = pixel.x.floor() as u32;
        let y0 = pixel.y.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let ax = (pixel.x - x0 as f64) as f32;
        let ay = (pixel.y - y0 as f64) as f32;

        let (c00, c10, c01, c11) = (
            self.texel(x0, y0),
            self.texel(x1, y0),
            self.texel(x0, y1),
            self.texel(x1, y1),
        );
        Some(
            (0..self.channels)
                .map(|c| {
                    let top = c00[c] * (1.0 - ax) + c10[c] * ax;
                    let bottom = c01[c] * (1.0 - ax) + c11[c] * ax;
                    top * (1.0 - ay) + bottom * ay
                })
                .collect(),
        )
    }
}

/// Everything the renderer produced for one pose hypothesis.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    /// World-to-camera pose the view was rendered at.
    pub pose: CameraPose,
    pub intrinsics: Intrinsics,
    pub color: RgbImage,
    pub depth: DepthMap,
    pub features: Option<FeatureMap>,
    pub scores: Option<ScoreMap>,
}

impl RenderOutput {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.color.width(),
            height: self.color.height(),
        }
    }

    /// Checks that every channel is pixel-aligned with the color image.
    pub fn validate(&self) -> Result<(), CollaboratorError> {
        let expected = self.resolution();
        let mismatch = |name: &str, found: Resolution| {
            CollaboratorError::InvalidOutput(format!(
                "{name} is {}x{}, color is {}x{}",
                found.width, found.height, expected.width, expected.height
            ))
        };
        if self.depth.resolution() != expected {
            return Err(mismatch("depth", self.depth.resolution()));
        }
        if let Some(features) = &self.features {
            if features.resolution() != expected {
                return Err(mismatch("feature map", features.resolution()));
            }
        }
        if let Some(scores) = &self.scores {
            if scores.resolution() != expected {
                return Err(mismatch("score map", scores.resolution()));
            }
        }
        Ok(())
    }
}

/// Renders the scene from a candidate pose.
///
/// Implementations must be deterministic for a fixed pose and scene model.
pub trait SceneRenderer {
    fn render(
        &self,
        pose: &CameraPose,
        camera: &PinholeModel,
    ) -> Result<RenderOutput, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_depth_lookup_rounds_to_nearest() {
        let mut depth = DepthMap::filled(4, 3, 2.0);
        depth.set(2, 1, 5.0);
        assert_eq!(depth.depth_at(&Vector2::new(1.6, 0.6)), Some(5.0));
        assert_eq!(depth.depth_at(&Vector2::new(1.4, 0.6)), Some(2.0));
        assert_eq!(depth.depth_at(&Vector2::new(-0.7, 0.0)), None);
        assert_eq!(depth.depth_at(&Vector2::new(3.6, 0.0)), None);
        assert_eq!(depth.depth_at(&Vector2::new(f64::NAN, f64::NAN)), None);
        assert_eq!(depth.depth_at(&Vector2::new(0.0, f64::INFINITY)), None);
    }

    #[test]
    fn test_depth_from_raw_checks_size() {
        assert!(DepthMap::from_raw(2, 2, vec![1.0; 4]).is_ok());
        assert!(matches!(
            DepthMap::from_raw(2, 2, vec![1.0; 3]),
            Err(CollaboratorError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_feature_map_bilinear_sample() {
        // 2x2 map with 2 channels: channel 0 = x, channel 1 = y.
        let data = vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let features = FeatureMap::new(2, 2, 2, data).unwrap();
        let d = features.sample(&Vector2::new(0.25, 0.75)).unwrap();
        assert_relative_eq!(d[0], 0.25, epsilon = 1e-6);
        assert_relative_eq!(d[1], 0.75, epsilon = 1e-6);
        assert!(features.sample(&Vector2::new(1.5, 0.0)).is_none());
        assert!(FeatureMap::new(2, 2, 3, vec![0.0; 8]).is_err());
    }

    #[test]
    fn test_render_output_alignment() {
        let intrinsics = Intrinsics {
            fx: 10.0,
            fy: 10.0,
            cx: 2.0,
            cy: 2.0,
        };
        let mut output = RenderOutput {
            pose: CameraPose::identity(),
            intrinsics,
            color: RgbImage::new(4, 4),
            depth: DepthMap::filled(4, 4, 1.0),
            features: None,
            scores: Some(ScoreMap::new(FloatImage::new(4, 4))),
        };
        assert!(output.validate().is_ok());
        output.depth = DepthMap::filled(3, 4, 1.0);
        assert!(output.validate().is_err());
    }
}
