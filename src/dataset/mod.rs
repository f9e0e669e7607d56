//! Query frames of a dataset split (7-Scenes / Cambridge Landmarks layout).
//!
//! A split directory holds:
//!
//! * `rgb/` (or `images/`): query images, `frame-000000.color.png` style names;
//! * `poses/`: ground-truth camera-to-world poses, one 4x4 text matrix per frame;
//! * calibration, either a shared `camera.yaml` (at the split root or inside
//!   `calibration/`) or one text file per frame in `calibration/` holding a single
//!   focal length.
//!
//! Files are paired by sorted filename order. Frames are loaded lazily, one image
//! at a time, in that same order.

use crate::camera::{CameraError, CameraModel, Intrinsics, PinholeModel, Resolution};
use crate::geometry::CameraPose;
use image::RgbImage;
use log::info;
use nalgebra::Matrix4;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Image Error: {0}")]
    ImageError(#[from] image::ImageError),
    #[error("Camera Error: {0}")]
    CameraError(#[from] CameraError),
    #[error("Missing directory: {0}")]
    MissingDirectory(PathBuf),
    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("Found {images} images but {found} {kind} files")]
    CountMismatch {
        images: usize,
        found: usize,
        kind: &'static str,
    },
}

/// One query image with everything needed to refine and evaluate it.
#[derive(Debug, Clone)]
pub struct Frame {
    /// File stem of the image with any `.color` suffix removed.
    pub id: String,
    pub image: RgbImage,
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    /// World-to-camera. Used for evaluation only.
    pub ground_truth: CameraPose,
}

impl Frame {
    pub fn camera(&self) -> PinholeModel {
        PinholeModel {
            intrinsics: self.intrinsics,
            resolution: self.resolution,
        }
    }
}

#[derive(Debug, Clone)]
enum Calibration {
    Shared(PinholeModel),
    /// One focal-length file per frame.
    PerFrame(Vec<PathBuf>),
}

/// Indexed split directory.
#[derive(Debug, Clone)]
pub struct SplitSource {
    name: String,
    images: Vec<PathBuf>,
    poses: Vec<PathBuf>,
    calibration: Calibration,
}

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

fn sorted_files(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, DatasetError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)));
        if path.is_file() && matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// `frame-000000.color.png` -> `frame-000000`
pub fn frame_id(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.strip_suffix(".color") {
        Some(id) => id.to_string(),
        None => stem,
    }
}

fn parse_error(path: &Path, reason: impl Into<String>) -> DatasetError {
    DatasetError::Parse {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_numbers(path: &Path) -> Result<Vec<f64>, DatasetError> {
    fs::read_to_string(path)?
        .split_whitespace()
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|e| parse_error(path, format!("'{token}': {e}")))
        })
        .collect()
}

/// Reads a row-major 4x4 camera-to-world matrix.
pub fn read_pose(path: &Path) -> Result<CameraPose, DatasetError> {
    let values = read_numbers(path)?;
    if values.len() != 16 {
        return Err(parse_error(
            path,
            format!("expected 16 values, found {}", values.len()),
        ));
    }
    let m = Matrix4::from_row_slice(&values);
    CameraPose::from_camera_to_world_matrix4(&m).map_err(|e| parse_error(path, e.to_string()))
}

/// Reads a calibration file holding a single focal length.
pub fn read_focal(path: &Path) -> Result<f64, DatasetError> {
    match read_numbers(path)?.as_slice() {
        [focal] if focal.is_finite() && *focal > 0.0 => Ok(*focal),
        values => Err(parse_error(
            path,
            format!("expected one positive focal length, found {values:?}"),
        )),
    }
}

impl SplitSource {
    pub fn open(split_dir: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let root = split_dir.as_ref();
        let image_dir = ["rgb", "images"]
            .iter()
            .map(|d| root.join(d))
            .find(|d| d.is_dir())
            .ok_or_else(|| DatasetError::MissingDirectory(root.join("rgb")))?;
        let pose_dir = root.join("poses");
        if !pose_dir.is_dir() {
            return Err(DatasetError::MissingDirectory(pose_dir));
        }

        let images = sorted_files(&image_dir, &IMAGE_EXTENSIONS)?;
        let poses = sorted_files(&pose_dir, &["txt"])?;
        if poses.len() != images.len() {
            return Err(DatasetError::CountMismatch {
                images: images.len(),
                found: poses.len(),
                kind: "pose",
            });
        }

        let calibration_dir = root.join("calibration");
        let shared = [root.join("camera.yaml"), calibration_dir.join("camera.yaml")]
            .into_iter()
            .find(|p| p.is_file());
        let calibration = match shared {
            Some(path) => Calibration::Shared(PinholeModel::load_from_yaml(
                &path.to_string_lossy(),
            )?),
            None => {
                if !calibration_dir.is_dir() {
                    return Err(DatasetError::MissingDirectory(calibration_dir));
                }
                let files = sorted_files(&calibration_dir, &["txt"])?;
                if files.len() != images.len() {
                    return Err(DatasetError::CountMismatch {
                        images: images.len(),
                        found: files.len(),
                        kind: "calibration",
                    });
                }
                Calibration::PerFrame(files)
            }
        };

        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "split".to_string());
        info!("Indexed split '{name}' with {} frames", images.len());
        Ok(SplitSource {
            name,
            images,
            poses,
            calibration,
        })
    }

    /// Directory name of the split.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn load_frame(&self, index: usize) -> Result<Frame, DatasetError> {
        let image_path = &self.images[index];
        let image = image::open(image_path)?.to_rgb8();
        let resolution = Resolution {
            width: image.width(),
            height: image.height(),
        };
        let intrinsics = match &self.calibration {
            Calibration::Shared(camera) => camera.intrinsics,
            Calibration::PerFrame(files) => {
                Intrinsics::from_focal(read_focal(&files[index])?, &resolution)
            }
        };
        Ok(Frame {
            id: frame_id(image_path),
            image,
            intrinsics,
            resolution,
            ground_truth: read_pose(&self.poses[index])?,
        })
    }

    /// Frames in sorted filename order, decoded on demand.
    pub fn frames(&self) -> impl Iterator<Item = Result<Frame, DatasetError>> + '_ {
        (0..self.len()).map(move |i| self.load_frame(i))
    }
}
