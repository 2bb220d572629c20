//! FREAK (Fast Retina Keypoint) descriptor
//!
//! 43 receptive fields on 8 concentric rings, denser and sharper towards the
//! centre. Bits compare the smoothed field intensities of a fixed pair selection.

use std::f32::consts::PI;

use image::GrayImage;
use nalgebra::{Point2, Vector2};
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::algorithms::sampling::BoxSampler;
use crate::features::{
    descriptor::{BinaryDescriptor, BitWriter},
    keypoint::KeyPoint,
};

const POINTS: usize = 43;
const PAIRS: usize = 512;
const ORIENTATION_PAIRS: usize = 45;
const SCALES_PER_OCTAVE: f32 = 16.0;
/// Keypoint size mapped to the unscaled pattern
const SMALLEST_KEYPOINT_SIZE: f32 = 7.0;

#[derive(Debug, Clone)]
pub struct Freak {
    pub orientation_normalized: bool,
    pub scale_normalized: bool,
    pub pattern_scale: f32,
    pub octaves: usize,
}

impl Default for Freak {
    fn default() -> Self {
        Self {
            orientation_normalized: true,
            scale_normalized: true,
            pattern_scale: 22.0,
            octaves: 4,
        }
    }
}

struct Field {
    offset: Vector2<f32>,
    sigma: f32,
}

struct RetinaPattern {
    fields: Vec<Field>,
    pairs: Vec<(usize, usize)>,
    orientation_pairs: Vec<(usize, usize)>,
}

impl RetinaPattern {
    fn build() -> Self {
        let big_r = 2.0 / 3.0;
        let small_r = 2.0 / 24.0;
        let unit = (big_r - small_r) / 21.0;
        let radius = [
            big_r,
            big_r - 6.0 * unit,
            big_r - 11.0 * unit,
            big_r - 15.0 * unit,
            big_r - 18.0 * unit,
            big_r - 20.0 * unit,
            small_r,
            0.0,
        ];
        let sigma = [
            radius[0] / 2.0,
            radius[1] / 2.0,
            radius[2] / 2.0,
            radius[3] / 2.0,
            radius[4] / 2.0,
            radius[5] / 2.0,
            radius[6] / 2.0,
            radius[6] / 2.0,
        ];
        let counts = [6, 6, 6, 6, 6, 6, 6, 1];

        let mut fields = Vec::with_capacity(POINTS);
        for ring in 0..counts.len() {
            // neighbouring rings are staggered by half a step
            let beta = PI / counts[ring] as f32 * (ring % 2) as f32;
            for k in 0..counts[ring] {
                let alpha = k as f32 * 2.0 * PI / counts[ring] as f32 + beta;
                fields.push(Field {
                    offset: Vector2::new(radius[ring] * alpha.cos(), radius[ring] * alpha.sin()),
                    sigma: sigma[ring],
                });
            }
        }

        let mut candidates = (1..POINTS)
            .flat_map(|i| (0..i).map(move |j| (i, j)))
            .collect::<Vec<_>>();
        let mut rng = StdRng::seed_from_u64(0xF4EA_u64);
        candidates.shuffle(&mut rng);
        candidates.truncate(PAIRS);

        let orientation_pairs = (0..5)
            .flat_map(|ring| {
                let base = ring * 6;
                [(0, 3), (1, 4), (2, 5), (0, 2), (1, 3), (2, 4), (3, 5), (4, 0), (5, 1)]
                    .into_iter()
                    .map(move |(i, j)| (base + i, base + j))
            })
            .collect::<Vec<_>>();
        debug_assert_eq!(orientation_pairs.len(), ORIENTATION_PAIRS);

        Self {
            fields,
            pairs: candidates,
            orientation_pairs,
        }
    }

    fn outer_extent(&self) -> f32 {
        self.fields
            .iter()
            .map(|f| f.offset.norm() + f.sigma)
            .fold(0.0, f32::max)
    }
}

static PATTERN: Lazy<RetinaPattern> = Lazy::new(RetinaPattern::build);

impl Freak {
    /// Pattern scale factor used for a keypoint of the given size
    fn scale_factor(&self, size: f32) -> f32 {
        if !self.scale_normalized {
            return 1.0;
        }
        let max_index = SCALES_PER_OCTAVE * self.octaves as f32 - 1.0;
        let index = (SCALES_PER_OCTAVE * (size / SMALLEST_KEYPOINT_SIZE).log2())
            .round()
            .clamp(0.0, max_index.max(0.0));
        2f32.powf(index / SCALES_PER_OCTAVE)
    }

    fn intensities(&self, sampler: &BoxSampler, center: Point2<f32>, scale: f32, angle: f32) -> Vec<f32> {
        let (sin, cos) = angle.sin_cos();
        let radius = scale * self.pattern_scale;
        PATTERN
            .fields
            .iter()
            .map(|field| {
                let (dx, dy) = (field.offset.x, field.offset.y);
                sampler.mean(
                    center.x + (dx * cos - dy * sin) * radius,
                    center.y + (dx * sin + dy * cos) * radius,
                    field.sigma * radius,
                )
            })
            .collect()
    }

    pub fn compute(&self, image: &GrayImage, keypoints: &mut Vec<KeyPoint>) -> Vec<BinaryDescriptor> {
        let (width, height) = (image.width() as f32, image.height() as f32);
        let extent = PATTERN.outer_extent();
        keypoints.retain(|k| {
            let reach = extent * self.scale_factor(k.size) * self.pattern_scale + 1.0;
            k.x() >= reach && k.y() >= reach && k.x() < width - reach && k.y() < height - reach
        });

        let sampler = BoxSampler::new(image);

        keypoints
            .iter_mut()
            .map(|keypoint| {
                let scale = self.scale_factor(keypoint.size);

                let angle = if self.orientation_normalized {
                    let unrotated = self.intensities(&sampler, keypoint.point, scale, 0.0);
                    let mut direction = Vector2::zeros();
                    for &(i, j) in PATTERN.orientation_pairs.iter() {
                        let delta = PATTERN.fields[i].offset - PATTERN.fields[j].offset;
                        direction += delta * ((unrotated[i] - unrotated[j]) / delta.norm_squared());
                    }
                    direction.y.atan2(direction.x)
                } else {
                    0.0
                };
                *keypoint = keypoint.with_angle(angle.to_degrees());

                let intensities = self.intensities(&sampler, keypoint.point, scale, angle);
                let mut descriptor = BitWriter::new();
                for &(i, j) in PATTERN.pairs.iter() {
                    descriptor.push(intensities[i] > intensities[j]);
                }
                descriptor.finish()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::descriptor::hamming_distance;
    use image::Luma;

    fn gradient(shift: u32) -> GrayImage {
        GrayImage::from_fn(160, 120, |x, y| {
            let x = x + shift;
            Luma([((x * 5 + y * 3) % 97 + (x / 7 * 11 + y / 9 * 13) % 61) as u8])
        })
    }

    #[test]
    fn pattern_layout() {
        let pattern = &*PATTERN;
        assert_eq!(pattern.fields.len(), POINTS);
        assert_eq!(pattern.pairs.len(), PAIRS);
        assert_eq!(pattern.orientation_pairs.len(), ORIENTATION_PAIRS);
        assert!(pattern.pairs.iter().all(|&(i, j)| i < POINTS && j < i));
    }

    #[test]
    fn scale_follows_keypoint_size() {
        let freak = Freak::default();
        assert_eq!(freak.scale_factor(7.0), 1.0);
        assert_eq!(freak.scale_factor(3.0), 1.0);
        assert!((freak.scale_factor(14.0) - 2.0).abs() < 1e-4);
    }

    #[test]
    fn border_keypoints_are_removed() {
        let image = gradient(0);
        let mut keypoints = vec![
            KeyPoint::new(5.0, 60.0, 7.0),
            KeyPoint::new(80.0, 60.0, 7.0),
            KeyPoint::new(80.0, 60.0, 200.0),
        ];
        let descriptors = Freak::default().compute(&image, &mut keypoints);
        assert_eq!(keypoints.len(), 1);
        assert_eq!(descriptors.len(), 1);
        assert!(keypoints[0].angle.is_some());
    }

    #[test]
    fn shifted_patch_matches_its_source() {
        let freak = Freak::default();
        let mut original = vec![KeyPoint::new(80.0, 60.0, 7.0)];
        let mut shifted = vec![KeyPoint::new(77.0, 60.0, 7.0)];
        let a = freak.compute(&gradient(0), &mut original);
        let b = freak.compute(&gradient(3), &mut shifted);
        assert_eq!(hamming_distance(&a[0], &b[0]), 0);
    }
}
