//! ORB (Oriented FAST and Rotated BRIEF)

use image::{imageops, GrayImage};
use imageproc::corners::corners_fast9;
use log::debug;
use nalgebra::Point2;
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::algorithms::corners::suppress_corners;
use crate::features::{
    descriptor::{BinaryDescriptor, BitWriter},
    keypoint::{retain_best, KeyPoint},
};

const DESCRIPTOR_BITS: usize = 256;

/// Ranking applied to the FAST corners of every pyramid level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreType {
    Harris,
    Fast,
}

#[derive(Debug, Clone)]
pub struct Orb {
    pub n_features: usize,
    pub scale_factor: f32,
    pub n_levels: usize,
    /// Border in which no features are detected, should roughly match `patch_size`
    pub edge_threshold: u32,
    pub score_type: ScoreType,
    pub patch_size: u32,
    pub fast_threshold: u8,
}

impl Default for Orb {
    fn default() -> Self {
        Self {
            n_features: 500,
            scale_factor: 1.2,
            n_levels: 8,
            edge_threshold: 31,
            score_type: ScoreType::Harris,
            patch_size: 31,
            fast_threshold: 20,
        }
    }
}

struct Level {
    image: GrayImage,
    scale: f32,
}

impl Orb {
    const HARRIS_BLOCK_SIZE: i32 = 7;
    const HARRIS_K: f32 = 0.04;

    fn pyramid(&self, image: &GrayImage) -> Vec<Level> {
        let mut levels = vec![Level {
            image: image.clone(),
            scale: 1.0,
        }];

        for level in 1..self.n_levels {
            let scale = self.scale_factor.powi(level as i32);
            let width = (image.width() as f32 / scale).round() as u32;
            let height = (image.height() as f32 / scale).round() as u32;
            if width <= 2 * self.edge_threshold || height <= 2 * self.edge_threshold {
                break;
            }
            levels.push(Level {
                image: imageops::resize(image, width, height, imageops::FilterType::Triangle),
                scale,
            });
        }

        levels
    }

    /// Number of features each level may contribute, decaying geometrically with the scale
    pub fn features_per_level(&self) -> Vec<usize> {
        let factor = 1.0 / self.scale_factor;
        let mut desired = self.n_features as f32 * (1.0 - factor)
            / (1.0 - factor.powi(self.n_levels as i32));

        let mut budget = Vec::with_capacity(self.n_levels);
        let mut total = 0;
        for _ in 0..self.n_levels.saturating_sub(1) {
            let n = desired.round() as usize;
            budget.push(n);
            total += n;
            desired *= factor;
        }
        budget.push(self.n_features.saturating_sub(total));
        budget
    }

    pub fn detect(&self, image: &GrayImage) -> Vec<KeyPoint> {
        let budget = self.features_per_level();
        let half_patch = (self.patch_size / 2) as i32;
        let mut keypoints = Vec::new();

        for (octave, level) in self.pyramid(image).iter().enumerate() {
            let (width, height) = level.image.dimensions();
            let border = self.edge_threshold;

            let corners = corners_fast9(&level.image, self.fast_threshold);
            let mut level_keypoints = suppress_corners(&corners, width as usize, height as usize)
                .into_iter()
                .filter(|c| {
                    c.x >= border
                        && c.y >= border
                        && c.x < width.saturating_sub(border)
                        && c.y < height.saturating_sub(border)
                })
                .map(|c| KeyPoint::new(c.x as f32, c.y as f32, 0.0).with_response(c.score))
                .collect::<Vec<_>>();

            let wanted = budget[octave];
            if self.score_type == ScoreType::Harris {
                retain_best(&mut level_keypoints, 2 * wanted);
                for keypoint in level_keypoints.iter_mut() {
                    keypoint.response = harris_score(
                        &level.image,
                        keypoint.x() as i32,
                        keypoint.y() as i32,
                        Self::HARRIS_BLOCK_SIZE,
                        Self::HARRIS_K,
                    );
                }
            }
            retain_best(&mut level_keypoints, wanted);

            for mut keypoint in level_keypoints {
                let angle = intensity_centroid_angle(
                    &level.image,
                    keypoint.x() as i32,
                    keypoint.y() as i32,
                    half_patch,
                );
                keypoint = keypoint.with_angle(angle);
                keypoint.point = Point2::new(keypoint.x() * level.scale, keypoint.y() * level.scale);
                keypoint.size = self.patch_size as f32 * level.scale;
                keypoint.octave = octave as i32;
                keypoints.push(keypoint);
            }
        }

        debug!("orb detected {} keypoints", keypoints.len());
        keypoints
    }

    /// Steered BRIEF on the pyramid level of every keypoint.
    ///
    /// Keypoints without an orientation get one from the intensity centroid.
    pub fn compute(&self, image: &GrayImage, keypoints: &mut Vec<KeyPoint>) -> Vec<BinaryDescriptor> {
        let border = self.edge_threshold as f32;
        let (width, height) = (image.width() as f32, image.height() as f32);
        keypoints.retain(|k| {
            k.x() >= border && k.y() >= border && k.x() < width - border && k.y() < height - border
        });

        let levels = self
            .pyramid(image)
            .into_iter()
            .map(|level| Level {
                image: imageproc::filter::gaussian_blur_f32(&level.image, 2.0),
                scale: level.scale,
            })
            .collect::<Vec<_>>();
        let half_patch = (self.patch_size / 2) as i32;

        keypoints
            .iter_mut()
            .map(|keypoint| {
                let octave = keypoint.octave.clamp(0, levels.len() as i32 - 1) as usize;
                let level = &levels[octave];
                let x = (keypoint.x() / level.scale).round() as i32;
                let y = (keypoint.y() / level.scale).round() as i32;

                if keypoint.angle.is_none() {
                    let angle = intensity_centroid_angle(&level.image, x, y, half_patch);
                    *keypoint = keypoint.with_angle(angle);
                }

                steered_brief(&level.image, x, y, keypoint.angle_radians())
            })
            .collect()
    }
}

#[inline]
fn pixel(image: &GrayImage, x: i32, y: i32) -> f32 {
    let x = x.clamp(0, image.width() as i32 - 1) as u32;
    let y = y.clamp(0, image.height() as i32 - 1) as u32;
    image.get_pixel(x, y).0[0] as f32
}

/// Harris response on a `block_size` window of 3x3 Sobel derivatives
pub(crate) fn harris_score(image: &GrayImage, x: i32, y: i32, block_size: i32, k: f32) -> f32 {
    let radius = block_size / 2;
    let scale = 1.0 / (4.0 * block_size as f32 * 255.0);

    let (mut a, mut b, mut c) = (0f32, 0f32, 0f32);
    for v in y - radius..y - radius + block_size {
        for u in x - radius..x - radius + block_size {
            let ix = (pixel(image, u + 1, v) - pixel(image, u - 1, v)) * 2.0
                + (pixel(image, u + 1, v - 1) - pixel(image, u - 1, v - 1))
                + (pixel(image, u + 1, v + 1) - pixel(image, u - 1, v + 1));
            let iy = (pixel(image, u, v + 1) - pixel(image, u, v - 1)) * 2.0
                + (pixel(image, u - 1, v + 1) - pixel(image, u - 1, v - 1))
                + (pixel(image, u + 1, v + 1) - pixel(image, u + 1, v - 1));
            a += ix * ix;
            b += iy * iy;
            c += ix * iy;
        }
    }

    let scale_4 = scale.powi(4);
    (a * b - c * c - k * (a + b) * (a + b)) * scale_4
}

/// Orientation in degrees of the vector from the keypoint to the intensity
/// centroid of the circular patch of radius `half_patch`
pub(crate) fn intensity_centroid_angle(image: &GrayImage, x: i32, y: i32, half_patch: i32) -> f32 {
    let (mut m01, mut m10) = (0f32, 0f32);
    for v in -half_patch..=half_patch {
        let extent = (((half_patch * half_patch - v * v) as f32).sqrt()).round() as i32;
        for u in -extent..=extent {
            let intensity = pixel(image, x + u, y + v);
            m10 += u as f32 * intensity;
            m01 += v as f32 * intensity;
        }
    }
    m01.atan2(m10).to_degrees().rem_euclid(360.0)
}

fn steered_brief(image: &GrayImage, x: i32, y: i32, angle: f32) -> BinaryDescriptor {
    let (sin, cos) = angle.sin_cos();
    let sample = |px: i8, py: i8| {
        let (px, py) = (px as f32, py as f32);
        pixel(
            image,
            x + (px * cos - py * sin).round() as i32,
            y + (px * sin + py * cos).round() as i32,
        )
    };

    let mut descriptor = BitWriter::new();
    for &[p1x, p1y, p2x, p2y] in ORB_PATTERN.iter() {
        descriptor.push(sample(p1x, p1y) < sample(p2x, p2y));
    }
    descriptor.finish()
}

/// Test pairs inside the 31x31 patch
static ORB_PATTERN: Lazy<[[i8; 4]; DESCRIPTOR_BITS]> = Lazy::new(|| {
    let mut rng = StdRng::seed_from_u64(0x0DDB1A5E);
    let normal_dist: Normal<f32> = Normal::new(0.0, 31.0 / 5.0).unwrap();

    let mut pattern = [[0; 4]; DESCRIPTOR_BITS];
    for pair in pattern.iter_mut() {
        for coordinate in pair.iter_mut() {
            *coordinate = normal_dist.sample(&mut rng).round().clamp(-13.0, 13.0) as i8;
        }
    }
    pattern
});
