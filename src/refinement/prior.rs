//! Coarse poses exported by an external regressor.
//!
//! File layout:
//!
//! ```json
//! {
//!   "convention": "camera_to_world",
//!   "poses": {
//!     "seq-01/frame-000000": { "matrix": [[1,0,0,0],[0,1,0,0],[0,0,1,0],[0,0,0,1]], "quality": 812.0 }
//!   }
//! }
//! ```
//!
//! `convention` defaults to `camera_to_world`, which is what scene coordinate
//! regressors produce. `quality` is optional.

use super::{CoarseEstimate, CoarsePoseProvider};
use crate::geometry::{CameraPose, GeometryError};
use crate::matching::QueryView;
use crate::render::CollaboratorError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum PriorError {
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid pose for frame {frame}: {source}")]
    InvalidPose {
        frame: String,
        source: GeometryError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseConvention {
    #[default]
    CameraToWorld,
    WorldToCamera,
}

#[derive(Debug, Deserialize)]
struct PriorEntry {
    matrix: [[f64; 4]; 4],
    #[serde(default)]
    quality: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PriorFile {
    #[serde(default)]
    convention: PoseConvention,
    poses: BTreeMap<String, PriorEntry>,
}

/// Precomputed coarse poses keyed by frame id.
#[derive(Debug, Clone, Default)]
pub struct PriorTable {
    estimates: HashMap<String, CoarseEstimate>,
}

impl PriorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, frame_id: impl Into<String>, estimate: CoarseEstimate) {
        self.estimates.insert(frame_id.into(), estimate);
    }

    pub fn get(&self, frame_id: &str) -> Option<&CoarseEstimate> {
        self.estimates.get(frame_id)
    }

    pub fn len(&self) -> usize {
        self.estimates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.estimates.is_empty()
    }

    pub fn load_from_json(path: impl AsRef<Path>) -> Result<Self, PriorError> {
        let reader = BufReader::new(File::open(path)?);
        let file: PriorFile = serde_json::from_reader(reader)?;

        let mut table = PriorTable::new();
        for (frame, entry) in file.poses {
            let m = nalgebra::Matrix4::from_fn(|r, c| entry.matrix[r][c]);
            let pose = match file.convention {
                PoseConvention::CameraToWorld => CameraPose::from_camera_to_world_matrix4(&m),
                PoseConvention::WorldToCamera => CameraPose::from_matrix4(&m),
            };
            let pose = match pose {
                Ok(pose) => pose,
                Err(source) => return Err(PriorError::InvalidPose { frame, source }),
            };
            table.insert(
                frame,
                CoarseEstimate {
                    pose,
                    quality: entry.quality,
                },
            );
        }
        Ok(table)
    }
}

impl CoarsePoseProvider for PriorTable {
    fn estimate(&self, query: &QueryView<'_>) -> Result<CoarseEstimate, CollaboratorError> {
        self.get(query.frame_id)
            .copied()
            .ok_or_else(|| CollaboratorError::MissingPrior(query.frame_id.to_string()))
    }
}
