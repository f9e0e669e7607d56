//! Side-by-side match images for diagnostics.

use super::ReportError;
use crate::matching::Correspondences;
use crate::metrics::PoseError;
use image::{Rgb, RgbImage};
use nalgebra::Vector2;
use std::path::Path;

const INLIER: Rgb<u8> = Rgb([0, 255, 0]);
const OUTLIER: Rgb<u8> = Rgb([255, 0, 0]);

fn draw_circle(img: &mut RgbImage, center: &Vector2<f64>, radius: i32, color: Rgb<u8>) {
    let center_x = center.x.round() as i32;
    let center_y = center.y.round() as i32;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                let x = center_x + dx;
                let y = center_y + dy;
                if x >= 0 && x < img.width() as i32 && y >= 0 && y < img.height() as i32 {
                    img.put_pixel(x as u32, y as u32, color);
                }
            }
        }
    }
}

/// Bresenham line, clipped to the image.
fn draw_line(img: &mut RgbImage, from: &Vector2<f64>, to: &Vector2<f64>, color: Rgb<u8>) {
    let (mut x0, mut y0) = (from.x.round() as i64, from.y.round() as i64);
    let (x1, y1) = (to.x.round() as i64, to.y.round() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        if x0 >= 0 && y0 >= 0 && x0 < img.width() as i64 && y0 < img.height() as i64 {
            img.put_pixel(x0 as u32, y0 as u32, color);
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// Query on the left, render on the right, one line per correspondence.
///
/// Pairs whose index is in `inliers` are drawn green, the rest red. Without an
/// inlier set every pair is drawn green.
pub fn match_image(
    query: &RgbImage,
    render: &RgbImage,
    matches: &Correspondences,
    inliers: Option<&[usize]>,
) -> RgbImage {
    let width = query.width() + render.width();
    let height = query.height().max(render.height());
    let mut canvas = RgbImage::new(width, height);
    for (x, y, pixel) in query.enumerate_pixels() {
        canvas.put_pixel(x, y, *pixel);
    }
    let offset = query.width();
    for (x, y, pixel) in render.enumerate_pixels() {
        canvas.put_pixel(x + offset, y, *pixel);
    }

    let shift = Vector2::new(offset as f64, 0.0);
    for (i, (q, r)) in matches.pairs().enumerate() {
        let color = match inliers {
            Some(set) if set.binary_search(&i).is_err() => OUTLIER,
            _ => INLIER,
        };
        let r = r + shift;
        draw_line(&mut canvas, q, &r, color);
        draw_circle(&mut canvas, q, 2, color);
        draw_circle(&mut canvas, &r, 2, color);
    }
    canvas
}

/// `<index>_<frame>__(T:<prior>_R:<prior>)__(T:<final>_R:<final>).png`
///
/// Translations are multiplied by `translation_scale`; path separators in the
/// frame id are replaced.
pub fn match_image_name(
    index: usize,
    frame_id: &str,
    prior: &PoseError,
    final_: &PoseError,
    translation_scale: f64,
) -> String {
    let name = frame_id.replace(['/', '\\'], "_");
    format!(
        "{index}_{name}__(T:{:.2}_R:{:.2})__(T:{:.2}_R:{:.2}).png",
        prior.translation * translation_scale,
        prior.rotation_deg,
        final_.translation * translation_scale,
        final_.rotation_deg
    )
}

pub fn save_match_image(image: &RgbImage, dir: &Path, name: &str) -> Result<(), ReportError> {
    std::fs::create_dir_all(dir)?;
    image.save(dir.join(name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_image_layout_and_colors() {
        let query = RgbImage::from_pixel(20, 10, Rgb([10, 10, 10]));
        let render = RgbImage::from_pixel(20, 12, Rgb([50, 50, 50]));
        let matches = Correspondences::new(
            vec![Vector2::new(2.0, 2.0), Vector2::new(10.0, 8.0)],
            vec![Vector2::new(2.0, 2.0), Vector2::new(15.0, 9.0)],
        )
        .unwrap();
        let canvas = match_image(&query, &render, &matches, Some(&[0]));
        assert_eq!(canvas.dimensions(), (40, 12));
        assert_eq!(*canvas.get_pixel(2, 2), INLIER);
        assert_eq!(*canvas.get_pixel(22, 2), INLIER);
        assert_eq!(*canvas.get_pixel(35, 9), OUTLIER);
        // Area below the shorter query image stays black.
        assert_eq!(*canvas.get_pixel(0, 11), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_match_image_name() {
        let prior = PoseError {
            rotation_deg: 2.3456,
            translation: 0.0512,
        };
        let final_ = PoseError {
            rotation_deg: 0.5,
            translation: 0.01,
        };
        assert_eq!(
            match_image_name(7, "seq-02/frame-000010", &prior, &final_, 100.0),
            "7_seq-02_frame-000010__(T:5.12_R:2.35)__(T:1.00_R:0.50).png"
        );
    }

    #[test]
    fn test_save_match_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbImage::new(4, 4);
        save_match_image(&image, &dir.path().join("matches"), "a.png").unwrap();
        assert!(dir.path().join("matches/a.png").exists());
    }
}
