use std::path::{Path, PathBuf};

use image::{imageops, DynamicImage, GrayImage, Pixel, Rgba, RgbaImage};
use imageproc::drawing;
use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::features::keypoint::KeyPoint;
use crate::tracking::frame::DataFrame;

static RED: Lazy<Rgba<u8>> = Lazy::new(|| *Rgba::from_slice(&[255, 0, 0, 255]));
static BLUE: Lazy<Rgba<u8>> = Lazy::new(|| *Rgba::from_slice(&[0, 0, 255, 255]));
static GREEN: Lazy<Rgba<u8>> = Lazy::new(|| *Rgba::from_slice(&[0, 255, 0, 255]));

fn to_rgba(image: &GrayImage) -> RgbaImage {
    DynamicImage::ImageLuma8(image.clone()).to_rgba8()
}

fn draw_keypoints(canvas: &mut RgbaImage, keypoints: &[KeyPoint], offset: f32, color: Rgba<u8>) {
    for keypoint in keypoints {
        drawing::draw_hollow_circle_mut(
            canvas,
            ((keypoint.x() + offset) as i32, keypoint.y() as i32),
            // circle covers the keypoint neighbourhood
            ((keypoint.size / 2.0) as i32).max(1),
            color,
        );
    }
}

/// Previous frame on the left, current frame on the right, with keypoints
/// of both and a line for every match of `current`.
pub fn draw_matches(previous: &DataFrame, current: &DataFrame) -> RgbaImage {
    let (left_width, left_height) = previous.image.dimensions();
    let (right_width, right_height) = current.image.dimensions();
    let mut canvas = RgbaImage::new(left_width + right_width, left_height.max(right_height));

    imageops::replace(&mut canvas, &to_rgba(&previous.image), 0, 0);
    imageops::replace(&mut canvas, &to_rgba(&current.image), left_width as i64, 0);

    let offset = left_width as f32;
    draw_keypoints(&mut canvas, &previous.keypoints, 0.0, *RED);
    draw_keypoints(&mut canvas, &current.keypoints, offset, *GREEN);

    for found in &current.matches {
        let (Some(from), Some(to)) = (
            previous.keypoints.get(found.query_idx),
            current.keypoints.get(found.train_idx),
        ) else {
            continue;
        };
        drawing::draw_line_segment_mut(
            &mut canvas,
            (from.x(), from.y()),
            (to.x() + offset, to.y()),
            *BLUE,
        );
    }

    canvas
}

/// `<output_dir>/matches_<index>.png`
pub fn match_image_path(output_dir: &Path, index: usize) -> PathBuf {
    output_dir.join(format!("matches_{index:04}.png"))
}

/// Writes the match image to `path`, creating parent directories
pub fn save(canvas: &RgbaImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    canvas.save(path).map_err(|source| Error::Image {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::Match;
    use image::Luma;

    fn frame(width: u32, keypoints: Vec<KeyPoint>) -> DataFrame {
        let mut frame = DataFrame::new(GrayImage::from_pixel(width, 40, Luma([0])));
        frame.keypoints = keypoints;
        frame
    }

    #[test]
    fn frames_are_placed_side_by_side() {
        let previous = frame(50, vec![KeyPoint::new(10.0, 20.0, 8.0)]);
        let mut current = frame(60, vec![KeyPoint::new(30.0, 20.0, 8.0)]);
        current.matches = vec![Match {
            query_idx: 0,
            train_idx: 0,
            distance: 0.0,
        }];

        let canvas = draw_matches(&previous, &current);
        assert_eq!(canvas.dimensions(), (110, 40));
        // bottom of the circle outlines of radius 4
        assert_eq!(*canvas.get_pixel(10, 24), *RED);
        assert_eq!(*canvas.get_pixel(80, 24), *GREEN);
        // the match line runs along y = 20 between the two centres
        assert_eq!(*canvas.get_pixel(40, 20), *BLUE);
        assert_eq!(*canvas.get_pixel(40, 5), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn stale_match_indices_are_skipped() {
        let previous = frame(20, Vec::new());
        let mut current = frame(20, Vec::new());
        current.matches = vec![Match {
            query_idx: 3,
            train_idx: 1,
            distance: 1.0,
        }];
        let canvas = draw_matches(&previous, &current);
        assert!(canvas.pixels().all(|p| *p == Rgba([0, 0, 0, 255])));
    }

    #[test]
    fn saves_png_into_new_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = match_image_path(&dir.path().join("nested"), 7);
        assert!(path.ends_with("matches_0007.png"));
        save(&RgbaImage::new(4, 4), &path).unwrap();
        assert!(path.exists());
    }
}
