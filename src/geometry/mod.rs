//! Pose representation, reprojection helpers and depth unprojection.

use crate::camera::{Intrinsics, Resolution};
use nalgebra::{Vector2, Vector3};

pub mod pose;
pub mod unproject;

pub use pose::{orthonormalize, CameraPose, GeometryError};
pub use unproject::{unproject_correspondences, WorldCorrespondences};

/// Projects a world point into the image of a camera at `pose`.
///
/// Returns `None` for points behind the camera; no image-bounds check is applied.
pub fn reproject(
    pose: &CameraPose,
    intrinsics: &Intrinsics,
    world: &Vector3<f64>,
) -> Option<Vector2<f64>> {
    intrinsics.project_unchecked(&pose.transform_point(world))
}

/// Generate a grid of sample pixels that are evenly distributed across the image
///
/// # Arguments
///
/// * `resolution` - Image size in pixels
/// * `n` - The approximate number of points to generate
///
/// # Returns
///
/// Cell-center pixel coordinates, row by row.
pub fn sample_grid(resolution: &Resolution, n: usize) -> Vec<Vector2<f64>> {
    let width = resolution.width as f64;
    let height = resolution.height as f64;
    if n == 0 || width <= 0.0 || height <= 0.0 {
        return Vec::new();
    }

    // Calculate the number of cells in each dimension
    let num_cells_x = ((n as f64 * (width / height)).sqrt().round() as usize).max(1);
    let num_cells_y = ((n as f64 * (height / width)).sqrt().round() as usize).max(1);

    // Calculate the dimensions of each cell
    let cell_width = width / num_cells_x as f64;
    let cell_height = height / num_cells_y as f64;

    let mut points = Vec::with_capacity(num_cells_x * num_cells_y);
    for i in 0..num_cells_y {
        for j in 0..num_cells_x {
            let x = ((j as f64 + 0.5) * cell_width).floor();
            let y = ((i as f64 + 0.5) * cell_height).floor();
            points.push(Vector2::new(x, y));
        }
    }

    points
}
