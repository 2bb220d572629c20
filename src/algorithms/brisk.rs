//! BRISK (Binary Robust Invariant Scalable Keypoints)
//!
//! Detection runs FAST on a pyramid of octaves `c_i` and intra-octaves `d_i`
//! and keeps corners that dominate both their layer and the adjacent layers.
//! The descriptor compares box smoothed intensities on a concentric ring
//! pattern, oriented by the long distance pairs.

use image::{imageops, GrayImage};
use imageproc::corners::corners_fast9;
use log::debug;
use nalgebra::Point2;
use once_cell::sync::Lazy;

use crate::algorithms::corners::local_maxima_3x3;
use crate::algorithms::sampling::BoxSampler;
use crate::features::{
    descriptor::{BinaryDescriptor, BitWriter},
    keypoint::KeyPoint,
};

const RADII: [f32; 5] = [0.0, 2.9, 4.9, 7.4, 10.8];
const POINTS_PER_RING: [usize; 5] = [1, 10, 14, 15, 20];
const RADIUS_FACTOR: f32 = 0.85;
const SIGMA_SCALE: f32 = 1.3;
/// Pairs closer than this are compared for the descriptor bits
const SHORT_PAIR_DISTANCE: f32 = 5.85;
/// Pairs further apart than this estimate the orientation
const LONG_PAIR_DISTANCE: f32 = 8.2;
const MAX_BITS: usize = 512;

#[derive(Debug, Clone)]
pub struct Brisk {
    /// FAST threshold
    pub threshold: u8,
    /// Number of octaves, `0` runs single scale
    pub octaves: usize,
    pub pattern_scale: f32,
}

impl Default for Brisk {
    fn default() -> Self {
        Self {
            threshold: 30,
            octaves: 3,
            pattern_scale: 1.0,
        }
    }
}

struct Layer {
    width: usize,
    height: usize,
    scale: f32,
    scores: Vec<f32>,
}

impl Layer {
    fn new(image: &GrayImage, scale: f32, threshold: u8) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let mut scores = vec![0f32; width * height];
        for corner in corners_fast9(image, threshold) {
            scores[corner.y as usize * width + corner.x as usize] = corner.score.max(f32::EPSILON);
        }
        Self {
            width,
            height,
            scale,
            scores,
        }
    }

    fn score(&self, x: isize, y: isize) -> f32 {
        if x < 0 || y < 0 || x >= self.width as isize || y >= self.height as isize {
            return 0.0;
        }
        self.scores[y as usize * self.width + x as usize]
    }

    /// Strongest score in the 3x3 window around the position of an image coordinate
    fn score_near(&self, image_x: f32, image_y: f32) -> f32 {
        let x = ((image_x + 0.5) / self.scale - 0.5).round() as isize;
        let y = ((image_y + 0.5) / self.scale - 0.5).round() as isize;
        let mut best = 0f32;
        for dy in -1..=1 {
            for dx in -1..=1 {
                best = best.max(self.score(x + dx, y + dy));
            }
        }
        best
    }

    fn to_image(&self, x: f32, y: f32) -> (f32, f32) {
        ((x + 0.5) * self.scale - 0.5, (y + 0.5) * self.scale - 0.5)
    }
}

/// Vertex offset of the parabola through three equally spaced samples
fn parabola_peak(previous: f32, center: f32, next: f32) -> f32 {
    let curvature = previous - 2.0 * center + next;
    if curvature >= 0.0 {
        return 0.0;
    }
    (0.5 * (previous - next) / curvature).clamp(-0.5, 0.5)
}

impl Brisk {
    /// Keypoint size of a feature found at scale `1`
    pub const BASIC_SIZE: f32 = 12.0;
    const MIN_LAYER_SIZE: u32 = 10;

    fn layers(&self, image: &GrayImage) -> Vec<Layer> {
        let mut layers = vec![Layer::new(image, 1.0, self.threshold)];
        if self.octaves == 0 {
            return layers;
        }

        let (width, height) = image.dimensions();
        let mut octave = image.clone();
        let mut intra = imageops::resize(
            image,
            width * 2 / 3,
            height * 2 / 3,
            imageops::FilterType::Triangle,
        );

        for i in 0..self.octaves {
            let scale = 2f32.powi(i as i32);
            if i > 0 {
                octave = imageops::resize(
                    &octave,
                    octave.width() / 2,
                    octave.height() / 2,
                    imageops::FilterType::Triangle,
                );
                intra = imageops::resize(
                    &intra,
                    intra.width() / 2,
                    intra.height() / 2,
                    imageops::FilterType::Triangle,
                );
                if octave.width() < Self::MIN_LAYER_SIZE || octave.height() < Self::MIN_LAYER_SIZE {
                    break;
                }
                layers.push(Layer::new(&octave, scale, self.threshold));
            }
            if intra.width() < Self::MIN_LAYER_SIZE || intra.height() < Self::MIN_LAYER_SIZE {
                break;
            }
            layers.push(Layer::new(&intra, 1.5 * scale, self.threshold));
        }

        layers
    }

    pub fn detect(&self, image: &GrayImage) -> Vec<KeyPoint> {
        let layers = self.layers(image);
        let mut keypoints = Vec::new();

        for (index, layer) in layers.iter().enumerate() {
            let below = index.checked_sub(1).map(|i| &layers[i]);
            let above = layers.get(index + 1);

            for (x, y) in local_maxima_3x3(&layer.scores, layer.width, layer.height) {
                let (xi, yi) = (x as isize, y as isize);
                let score = layer.score(xi, yi);
                let (image_x, image_y) = layer.to_image(x as f32, y as f32);

                let score_below = below.map(|l| l.score_near(image_x, image_y));
                let score_above = above.map(|l| l.score_near(image_x, image_y));
                if score_below.map_or(false, |s| s > score) || score_above.map_or(false, |s| s > score) {
                    continue;
                }

                let dx = parabola_peak(layer.score(xi - 1, yi), score, layer.score(xi + 1, yi));
                let dy = parabola_peak(layer.score(xi, yi - 1), score, layer.score(xi, yi + 1));
                let (kx, ky) = layer.to_image(x as f32 + dx, y as f32 + dy);

                let scale = match (below, score_below, above, score_above) {
                    (Some(lower), Some(s_below), Some(upper), Some(s_above)) => {
                        let offset = parabola_peak(s_below, score, s_above);
                        let step = if offset > 0.0 {
                            (upper.scale / layer.scale).ln()
                        } else {
                            (layer.scale / lower.scale).ln()
                        };
                        (layer.scale.ln() + offset * step).exp()
                    }
                    _ => layer.scale,
                };

                let mut keypoint = KeyPoint::new(kx, ky, Self::BASIC_SIZE * scale).with_response(score);
                keypoint.octave = index as i32;
                keypoints.push(keypoint);
            }
        }

        debug!("brisk detected {} keypoints over {} layers", keypoints.len(), layers.len());
        keypoints
    }

    /// Distance from the keypoint the pattern reaches at scale `scale`
    fn reach(&self, scale: f32) -> f32 {
        let pattern = &*PATTERN;
        (pattern.max_radius + pattern.max_sigma) * self.pattern_scale * scale + 1.0
    }

    pub fn compute(&self, image: &GrayImage, keypoints: &mut Vec<KeyPoint>) -> Vec<BinaryDescriptor> {
        let (width, height) = (image.width() as f32, image.height() as f32);
        keypoints.retain(|k| {
            let reach = self.reach(k.size / Self::BASIC_SIZE);
            k.x() >= reach && k.y() >= reach && k.x() < width - reach && k.y() < height - reach
        });

        let sampler = BoxSampler::new(image);
        let pattern = &*PATTERN;

        keypoints
            .iter_mut()
            .map(|keypoint| {
                let scale = keypoint.size / Self::BASIC_SIZE * self.pattern_scale;

                let unrotated = pattern.sample(&sampler, keypoint.point, scale, 0.0);
                let angle = pattern.orientation(&unrotated);
                *keypoint = keypoint.with_angle(angle.to_degrees());

                let intensities = pattern.sample(&sampler, keypoint.point, scale, angle);
                let mut descriptor = BitWriter::new();
                for &(i, j) in pattern.short_pairs.iter() {
                    descriptor.push(intensities[i] > intensities[j]);
                }
                descriptor.finish()
            })
            .collect()
    }
}

struct Pattern {
    points: Vec<(Point2<f32>, f32)>,
    short_pairs: Vec<(usize, usize)>,
    long_pairs: Vec<(usize, usize)>,
    max_radius: f32,
    max_sigma: f32,
}

impl Pattern {
    fn build() -> Self {
        let mut points = Vec::new();
        for (ring, (&radius, &count)) in RADII.iter().zip(POINTS_PER_RING.iter()).enumerate() {
            let radius = radius * RADIUS_FACTOR;
            let sigma = SIGMA_SCALE * radius * (std::f32::consts::PI / count as f32).sin();
            for j in 0..count {
                let alpha = j as f32 * 2.0 * std::f32::consts::PI / count as f32;
                let position = Point2::new(radius * alpha.cos(), radius * alpha.sin());
                points.push((position, if ring == 0 { 0.0 } else { sigma }));
            }
        }

        let mut short_pairs = Vec::new();
        let mut long_pairs = Vec::new();
        for i in 1..points.len() {
            for j in 0..i {
                let distance = nalgebra::distance(&points[i].0, &points[j].0);
                if distance < SHORT_PAIR_DISTANCE && short_pairs.len() < MAX_BITS {
                    short_pairs.push((i, j));
                } else if distance > LONG_PAIR_DISTANCE {
                    long_pairs.push((i, j));
                }
            }
        }

        let max_radius = RADII[RADII.len() - 1] * RADIUS_FACTOR;
        let max_sigma = points.iter().map(|p| p.1).fold(0.0, f32::max);

        Self {
            points,
            short_pairs,
            long_pairs,
            max_radius,
            max_sigma,
        }
    }

    fn sample(&self, sampler: &BoxSampler, center: Point2<f32>, scale: f32, angle: f32) -> Vec<f32> {
        let (sin, cos) = angle.sin_cos();
        self.points
            .iter()
            .map(|(p, sigma)| {
                let x = center.x + (p.x * cos - p.y * sin) * scale;
                let y = center.y + (p.x * sin + p.y * cos) * scale;
                sampler.mean(x, y, sigma * scale)
            })
            .collect()
    }

    /// Mean local gradient over the long pairs, in radians
    fn orientation(&self, intensities: &[f32]) -> f32 {
        let (mut gx, mut gy) = (0f32, 0f32);
        for &(i, j) in self.long_pairs.iter() {
            let delta = self.points[j].0 - self.points[i].0;
            let weight = (intensities[j] - intensities[i]) / delta.norm_squared();
            gx += weight * delta.x;
            gy += weight * delta.y;
        }
        gy.atan2(gx)
    }
}

static PATTERN: Lazy<Pattern> = Lazy::new(Pattern::build);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::descriptor::hamming_distance;
    use image::Luma;

    fn squares(shift: u32) -> GrayImage {
        GrayImage::from_fn(240, 180, |x, y| {
            let x = x + shift;
            let inside = (x % 60) > 20 && (x % 60) < 45 && (y % 50) > 15 && (y % 50) < 35;
            let texture = ((x * 3 + y * 5) % 11) as u8 * 4;
            Luma([(if inside { 210 } else { 30 }) + texture])
        })
    }

    #[test]
    fn pattern_layout() {
        let pattern = &*PATTERN;
        assert_eq!(pattern.points.len(), 60);
        assert!(!pattern.short_pairs.is_empty());
        assert!(pattern.short_pairs.len() <= MAX_BITS);
        assert!(!pattern.long_pairs.is_empty());
    }

    #[test]
    fn flat_image_has_no_keypoints() {
        let image = GrayImage::from_pixel(120, 120, Luma([77]));
        assert!(Brisk::default().detect(&image).is_empty());
    }

    #[test]
    fn detect_finds_square_corners() {
        let image = squares(0);
        let keypoints = Brisk::default().detect(&image);
        assert!(!keypoints.is_empty());
        for keypoint in keypoints.iter() {
            assert!(keypoint.size >= Brisk::BASIC_SIZE * 0.5);
            assert!(keypoint.response > 0.0);
            assert!(keypoint.x() > -1.0 && keypoint.x() < 240.0);
            assert!(keypoint.y() > -1.0 && keypoint.y() < 180.0);
        }
    }

    #[test]
    fn compute_drops_border_keypoints_and_orients() {
        let image = squares(0);
        let mut keypoints = vec![
            KeyPoint::new(3.0, 90.0, 12.0),
            KeyPoint::new(120.0, 90.0, 12.0),
        ];
        let descriptors = Brisk::default().compute(&image, &mut keypoints);
        assert_eq!(keypoints.len(), 1);
        assert_eq!(descriptors.len(), 1);
        assert!(keypoints[0].angle.is_some());
    }

    #[test]
    fn shifted_patch_matches_its_source() {
        let brisk = Brisk::default();
        let mut original = vec![KeyPoint::new(100.0, 90.0, 12.0)];
        let mut shifted = vec![KeyPoint::new(96.0, 90.0, 12.0)];
        let a = brisk.compute(&squares(0), &mut original);
        let b = brisk.compute(&squares(4), &mut shifted);
        assert_eq!(hamming_distance(&a[0], &b[0]), 0);
    }
}
