//! SIFT (Scale Invariant Feature Transform)

use std::f32::consts::PI;

use image::GrayImage;
use log::debug;
use nalgebra::{Matrix3, Vector3};

use crate::algorithms::float_image::FloatImage;
use crate::features::{
    descriptor::{FloatDescriptor, FLOAT_DESCRIPTOR_LEN},
    keypoint::{retain_best, KeyPoint},
};

/// Blur already present in the input image
const INIT_SIGMA: f32 = 0.5;
/// Extrema closer than this to the border of their octave are ignored
const IMAGE_BORDER: usize = 5;
const MAX_INTERPOLATION_STEPS: usize = 5;

const ORIENTATION_BINS: usize = 36;
const ORIENTATION_PEAK_RATIO: f32 = 0.8;
const ORIENTATION_SIGMA_FACTOR: f32 = 1.5;
const ORIENTATION_RADIUS: f32 = 3.0 * ORIENTATION_SIGMA_FACTOR;

const DESCRIPTOR_WIDTH: usize = 4;
const DESCRIPTOR_BINS: usize = 8;
const DESCRIPTOR_SCALE_FACTOR: f32 = 3.0;
const DESCRIPTOR_MAGNITUDE_THRESHOLD: f32 = 0.2;

#[derive(Debug, Clone)]
pub struct Sift {
    /// Keep only the strongest features, `0` keeps all of them
    pub n_features: usize,
    pub octave_layers: usize,
    pub contrast_threshold: f32,
    pub edge_threshold: f32,
    /// Blur of the first octave layer
    pub sigma: f32,
}

impl Default for Sift {
    fn default() -> Self {
        Self {
            n_features: 0,
            octave_layers: 3,
            contrast_threshold: 0.04,
            edge_threshold: 10.0,
            sigma: 1.6,
        }
    }
}

/// Gaussian and difference of Gaussian octaves of the doubled input image
struct Pyramid {
    gaussians: Vec<Vec<FloatImage>>,
    dogs: Vec<Vec<FloatImage>>,
}

/// Refined scale space extremum
struct Extremum {
    octave: usize,
    layer: usize,
    x: usize,
    y: usize,
    offset: Vector3<f32>,
    response: f32,
}

impl Sift {
    fn pyramid(&self, image: &GrayImage) -> Pyramid {
        let doubled = FloatImage::from_gray(image, 1.0 / 255.0).upsample();
        let initial_blur = (self.sigma * self.sigma - 4.0 * INIT_SIGMA * INIT_SIGMA)
            .max(0.01)
            .sqrt();
        let base = doubled.gaussian_blur(initial_blur);

        let layers = self.octave_layers + 3;
        let k = 2f32.powf(1.0 / self.octave_layers as f32);
        let mut increments = vec![self.sigma];
        for i in 1..layers {
            let previous = self.sigma * k.powi(i as i32 - 1);
            let total = previous * k;
            increments.push((total * total - previous * previous).sqrt());
        }

        let smallest_side = base.width.min(base.height).max(1) as f32;
        let octaves = (smallest_side.log2().floor() as i32 - 2).max(1) as usize;

        let mut gaussians: Vec<Vec<FloatImage>> = Vec::with_capacity(octaves);
        for octave in 0..octaves {
            let first = match gaussians.last() {
                None => base.clone(),
                Some(previous) => previous[self.octave_layers].decimate(),
            };
            let mut images = vec![first];
            for sigma in increments.iter().skip(1) {
                let blurred = images[images.len() - 1].gaussian_blur(*sigma);
                images.push(blurred);
            }
            debug_assert_eq!(images.len(), layers, "octave {octave}");
            gaussians.push(images);
        }

        let dogs = gaussians
            .iter()
            .map(|images| images.windows(2).map(|w| w[1].subtract(&w[0])).collect())
            .collect();

        Pyramid { gaussians, dogs }
    }

    pub fn detect(&self, image: &GrayImage) -> Vec<KeyPoint> {
        let pyramid = self.pyramid(image);
        let threshold = 0.5 * self.contrast_threshold / self.octave_layers as f32;
        let mut keypoints = Vec::new();

        for (octave, dogs) in pyramid.dogs.iter().enumerate() {
            let (width, height) = (dogs[0].width, dogs[0].height);
            if width <= 2 * IMAGE_BORDER || height <= 2 * IMAGE_BORDER {
                continue;
            }

            for layer in 1..=self.octave_layers {
                for y in IMAGE_BORDER..height - IMAGE_BORDER {
                    for x in IMAGE_BORDER..width - IMAGE_BORDER {
                        let value = dogs[layer].get(x, y);
                        if value.abs() <= threshold || !is_extremum(dogs, layer, x, y) {
                            continue;
                        }
                        let Some(extremum) = self.refine(dogs, octave, layer, x, y) else {
                            continue;
                        };
                        self.oriented_keypoints(&pyramid, &extremum, &mut keypoints);
                    }
                }
            }
        }

        if self.n_features > 0 {
            retain_best(&mut keypoints, self.n_features);
        }

        debug!("sift detected {} keypoints", keypoints.len());
        keypoints
    }

    /// Fits a 3D quadratic to the DoG around `(x, y, layer)`, moving the sample
    /// point until the offset stays inside the pixel
    fn refine(&self, dogs: &[FloatImage], octave: usize, layer: usize, x: usize, y: usize) -> Option<Extremum> {
        let (width, height) = (dogs[0].width, dogs[0].height);
        let (mut x, mut y, mut layer) = (x, y, layer);

        let mut converged = None;
        for _ in 0..MAX_INTERPOLATION_STEPS {
            let (gradient, hessian, _) = dog_derivatives(dogs, layer, x, y);
            let offset = -hessian.lu().solve(&gradient)?;
            if offset.iter().all(|o| o.abs() < 0.5) {
                converged = Some(offset);
                break;
            }
            if offset.iter().any(|o| !o.is_finite() || o.abs() > 1.0e4) {
                return None;
            }

            let next_x = x as f32 + offset.x.round();
            let next_y = y as f32 + offset.y.round();
            let next_layer = layer as f32 + offset.z.round();
            if next_layer < 1.0
                || next_layer > self.octave_layers as f32
                || next_x < IMAGE_BORDER as f32
                || next_x >= (width - IMAGE_BORDER) as f32
                || next_y < IMAGE_BORDER as f32
                || next_y >= (height - IMAGE_BORDER) as f32
            {
                return None;
            }
            x = next_x as usize;
            y = next_y as usize;
            layer = next_layer as usize;
        }
        let offset = converged?;

        let (gradient, hessian, value) = dog_derivatives(dogs, layer, x, y);
        let contrast = value + 0.5 * gradient.dot(&offset);
        if contrast.abs() * (self.octave_layers as f32) < self.contrast_threshold {
            return None;
        }

        // principal curvature ratio on the spatial Hessian
        let trace = hessian[(0, 0)] + hessian[(1, 1)];
        let determinant = hessian[(0, 0)] * hessian[(1, 1)] - hessian[(0, 1)] * hessian[(0, 1)];
        let edge = self.edge_threshold;
        if determinant <= 0.0 || trace * trace * edge >= (edge + 1.0) * (edge + 1.0) * determinant {
            return None;
        }

        Some(Extremum {
            octave,
            layer,
            x,
            y,
            offset,
            response: contrast.abs(),
        })
    }

    /// One keypoint per dominant orientation of the extremum
    fn oriented_keypoints(&self, pyramid: &Pyramid, extremum: &Extremum, keypoints: &mut Vec<KeyPoint>) {
        let octave_scale = (1 << extremum.octave) as f32;
        let layer_position = extremum.layer as f32 + extremum.offset.z;
        let octave_sigma = self.sigma * 2f32.powf(layer_position / self.octave_layers as f32);

        let doubled_x = (extremum.x as f32 + extremum.offset.x) * octave_scale;
        let doubled_y = (extremum.y as f32 + extremum.offset.y) * octave_scale;
        let mut keypoint = KeyPoint::new(
            0.5 * doubled_x - 0.25,
            0.5 * doubled_y - 0.25,
            octave_sigma * octave_scale,
        )
        .with_response(extremum.response);
        keypoint.octave = extremum.octave as i32 - 1;

        let image = &pyramid.gaussians[extremum.octave][extremum.layer];
        let histogram = orientation_histogram(
            image,
            extremum.x,
            extremum.y,
            (ORIENTATION_RADIUS * octave_sigma).round() as isize,
            ORIENTATION_SIGMA_FACTOR * octave_sigma,
        );

        let peak = histogram.iter().copied().fold(0f32, f32::max);
        for bin in 0..ORIENTATION_BINS {
            let left = histogram[(bin + ORIENTATION_BINS - 1) % ORIENTATION_BINS];
            let right = histogram[(bin + 1) % ORIENTATION_BINS];
            let value = histogram[bin];
            if value > left && value > right && value >= ORIENTATION_PEAK_RATIO * peak {
                let interpolated = bin as f32 + 0.5 * (left - right) / (left - 2.0 * value + right);
                let angle = 360.0 / ORIENTATION_BINS as f32 * interpolated;
                keypoints.push(keypoint.with_angle(angle));
            }
        }
    }

    /// Octave and layer whose blur best matches a keypoint of the given size
    fn locate(&self, size: f32, octaves: usize) -> (usize, usize) {
        let layers = self.octave_layers as i64;
        let position = (size.max(1.0e-3) / self.sigma).log2() * layers as f32;
        let index = (position.round() as i64).max(1);
        let octave = ((index - 1).div_euclid(layers)).min(octaves as i64 - 1);
        let layer = (index - octave * layers).clamp(1, layers);
        (octave as usize, layer as usize)
    }

    /// 4x4x8 gradient histograms around every keypoint.
    ///
    /// Keypoints from other detectors are described at the scale implied by
    /// their size, without orientation when they carry none.
    pub fn compute(&self, image: &GrayImage, keypoints: &mut Vec<KeyPoint>) -> Vec<FloatDescriptor> {
        let pyramid = self.pyramid(image);

        keypoints
            .iter()
            .map(|keypoint| {
                let (octave, layer) = self.locate(keypoint.size, pyramid.gaussians.len());
                let octave_scale = (1 << octave) as f32;
                let x = 2.0 * (keypoint.x() + 0.25) / octave_scale;
                let y = 2.0 * (keypoint.y() + 0.25) / octave_scale;
                let sigma = keypoint.size / octave_scale;

                gradient_histograms(
                    &pyramid.gaussians[octave][layer],
                    x,
                    y,
                    keypoint.angle_radians(),
                    sigma,
                )
            })
            .collect()
    }
}

fn is_extremum(dogs: &[FloatImage], layer: usize, x: usize, y: usize) -> bool {
    let value = dogs[layer].get(x, y);
    for image in &dogs[layer - 1..=layer + 1] {
        for v in y - 1..=y + 1 {
            for u in x - 1..=x + 1 {
                let neighbour = image.get(u, v);
                if value > 0.0 && neighbour > value || value < 0.0 && neighbour < value {
                    return false;
                }
            }
        }
    }
    true
}

/// Gradient, Hessian and value of the DoG at a sample point, in `(x, y, layer)` order
fn dog_derivatives(dogs: &[FloatImage], layer: usize, x: usize, y: usize) -> (Vector3<f32>, Matrix3<f32>, f32) {
    let (previous, current, next) = (&dogs[layer - 1], &dogs[layer], &dogs[layer + 1]);
    let at = |image: &FloatImage, dx: isize, dy: isize| {
        image.get((x as isize + dx) as usize, (y as isize + dy) as usize)
    };

    let value = at(current, 0, 0);
    let gradient = Vector3::new(
        0.5 * (at(current, 1, 0) - at(current, -1, 0)),
        0.5 * (at(current, 0, 1) - at(current, 0, -1)),
        0.5 * (at(next, 0, 0) - at(previous, 0, 0)),
    );

    let dxx = at(current, 1, 0) + at(current, -1, 0) - 2.0 * value;
    let dyy = at(current, 0, 1) + at(current, 0, -1) - 2.0 * value;
    let dss = at(next, 0, 0) + at(previous, 0, 0) - 2.0 * value;
    let dxy = 0.25
        * (at(current, 1, 1) - at(current, -1, 1) - at(current, 1, -1) + at(current, -1, -1));
    let dxs = 0.25 * (at(next, 1, 0) - at(next, -1, 0) - at(previous, 1, 0) + at(previous, -1, 0));
    let dys = 0.25 * (at(next, 0, 1) - at(next, 0, -1) - at(previous, 0, 1) + at(previous, 0, -1));

    #[rustfmt::skip]
    let hessian = Matrix3::new(
        dxx, dxy, dxs,
        dxy, dyy, dys,
        dxs, dys, dss,
    );
    (gradient, hessian, value)
}

/// Smoothed histogram of gradient directions around `(x, y)`
fn orientation_histogram(
    image: &FloatImage,
    x: usize,
    y: usize,
    radius: isize,
    sigma: f32,
) -> [f32; ORIENTATION_BINS] {
    let mut raw = [0f32; ORIENTATION_BINS];
    let weight_scale = -1.0 / (2.0 * sigma * sigma);

    for dy in -radius..=radius {
        let v = y as isize + dy;
        if v <= 0 || v >= image.height as isize - 1 {
            continue;
        }
        for dx in -radius..=radius {
            let u = x as isize + dx;
            if u <= 0 || u >= image.width as isize - 1 {
                continue;
            }
            let (u, v) = (u as usize, v as usize);
            let gx = image.get(u + 1, v) - image.get(u - 1, v);
            let gy = image.get(u, v + 1) - image.get(u, v - 1);
            let weight = (((dx * dx + dy * dy) as f32) * weight_scale).exp();
            let angle = gy.atan2(gx).rem_euclid(2.0 * PI);
            let bin = (angle * ORIENTATION_BINS as f32 / (2.0 * PI)).round() as usize % ORIENTATION_BINS;
            raw[bin] += weight * gx.hypot(gy);
        }
    }

    let n = ORIENTATION_BINS;
    let mut smoothed = [0f32; ORIENTATION_BINS];
    for (i, bin) in smoothed.iter_mut().enumerate() {
        *bin = (raw[(i + n - 2) % n] + raw[(i + 2) % n]) * (1.0 / 16.0)
            + (raw[(i + n - 1) % n] + raw[(i + 1) % n]) * (4.0 / 16.0)
            + raw[i] * (6.0 / 16.0);
    }
    smoothed
}

/// Trilinearly interpolated 4x4 spatial by 8 orientation histogram,
/// normalised, clipped at 0.2 and scaled to `0..=255`
fn gradient_histograms(image: &FloatImage, x: f32, y: f32, angle: f32, sigma: f32) -> FloatDescriptor {
    let d = DESCRIPTOR_WIDTH;
    let n = DESCRIPTOR_BINS;
    let (sin, cos) = angle.sin_cos();
    let bins_per_radian = n as f32 / (2.0 * PI);
    let exp_scale = -1.0 / (d as f32 * d as f32 * 0.5);
    let hist_width = (DESCRIPTOR_SCALE_FACTOR * sigma).max(1.0e-3);

    let diagonal = ((image.width * image.width + image.height * image.height) as f32).sqrt();
    let radius = (hist_width * std::f32::consts::SQRT_2 * (d as f32 + 1.0) * 0.5)
        .round()
        .min(diagonal) as isize;
    let (cos_t, sin_t) = (cos / hist_width, sin / hist_width);
    let (px, py) = (x.round() as isize, y.round() as isize);

    let mut hist = vec![0f32; (d + 2) * (d + 2) * (n + 2)];
    for i in -radius..=radius {
        for j in -radius..=radius {
            // sample offset in the keypoint frame, in histogram cells
            let c_rot = j as f32 * cos_t + i as f32 * sin_t;
            let r_rot = -(j as f32) * sin_t + i as f32 * cos_t;
            let rbin = r_rot + d as f32 / 2.0 - 0.5;
            let cbin = c_rot + d as f32 / 2.0 - 0.5;
            let (r, c) = (py + i, px + j);

            if rbin <= -1.0 || rbin >= d as f32 || cbin <= -1.0 || cbin >= d as f32 {
                continue;
            }
            if r <= 0 || r >= image.height as isize - 1 || c <= 0 || c >= image.width as isize - 1 {
                continue;
            }

            let (r, c) = (r as usize, c as usize);
            let dx = image.get(c + 1, r) - image.get(c - 1, r);
            let dy = image.get(c, r + 1) - image.get(c, r - 1);
            let magnitude = dx.hypot(dy) * ((c_rot * c_rot + r_rot * r_rot) * exp_scale).exp();
            let obin = (dy.atan2(dx) - angle).rem_euclid(2.0 * PI) * bins_per_radian;

            let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
            let (rf, cf, of) = (rbin - r0, cbin - c0, obin - o0);
            let o0 = (o0 as usize) % n;

            let v_r1 = magnitude * rf;
            let v_r0 = magnitude - v_r1;
            let v_rc11 = v_r1 * cf;
            let v_rc10 = v_r1 - v_rc11;
            let v_rc01 = v_r0 * cf;
            let v_rc00 = v_r0 - v_rc01;

            let idx = ((r0 as isize + 1) as usize * (d + 2) + (c0 as isize + 1) as usize) * (n + 2) + o0;
            for (offset, value) in [
                (0, v_rc00),
                (n + 2, v_rc01),
                ((d + 2) * (n + 2), v_rc10),
                ((d + 3) * (n + 2), v_rc11),
            ] {
                let upper = value * of;
                hist[idx + offset] += value - upper;
                hist[idx + offset + 1] += upper;
            }
        }
    }

    let mut descriptor = [0f32; FLOAT_DESCRIPTOR_LEN];
    for i in 0..d {
        for j in 0..d {
            let idx = ((i + 1) * (d + 2) + (j + 1)) * (n + 2);
            // orientation wraps around
            hist[idx] += hist[idx + n];
            hist[idx + 1] += hist[idx + n + 1];
            for k in 0..n {
                descriptor[(i * d + j) * n + k] = hist[idx + k];
            }
        }
    }

    let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
    let clip = norm * DESCRIPTOR_MAGNITUDE_THRESHOLD;
    descriptor.iter_mut().for_each(|v| *v = v.min(clip));
    let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
    let scale = 512.0 / norm.max(f32::EPSILON);
    descriptor
        .iter_mut()
        .for_each(|v| *v = (*v * scale).round().clamp(0.0, 255.0));
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::descriptor::euclidean_distance;
    use image::Luma;

    fn blob(cx: f32, cy: f32) -> GrayImage {
        GrayImage::from_fn(96, 96, |x, y| {
            let r2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            Luma([(20.0 + 220.0 * (-r2 / (2.0 * 4.0 * 4.0)).exp()) as u8])
        })
    }

    #[test]
    fn locate_recovers_detection_layer() {
        let sift = Sift::default();
        for octave in 0..4 {
            for layer in 1..=3 {
                let size = sift.sigma * 2f32.powf(layer as f32 / 3.0) * (1 << octave) as f32;
                assert_eq!(sift.locate(size, 5), (octave, layer));
            }
        }
        assert_eq!(sift.locate(0.0, 5), (0, 1));
        assert_eq!(sift.locate(1.0e6, 5), (4, 3));
    }

    #[test]
    fn bright_blob_is_detected() {
        let keypoints = Sift::default().detect(&blob(48.3, 47.6));
        assert!(keypoints
            .iter()
            .any(|k| (k.x() - 48.3).abs() < 1.5 && (k.y() - 47.6).abs() < 1.5));
        assert!(keypoints.iter().all(|k| k.angle.is_some() && k.size > 0.0));
    }

    #[test]
    fn n_features_limits_the_output() {
        let image = GrayImage::from_fn(96, 96, |x, y| {
            let spot = (x % 24).abs_diff(12) < 4 && (y % 24).abs_diff(12) < 4;
            Luma([if spot { 230 } else { 30 }])
        });
        let all = Sift::default().detect(&image);
        let limited = Sift {
            n_features: 3,
            ..Default::default()
        }
        .detect(&image);
        assert!(limited.len() <= 3);
        assert!(limited.len() <= all.len());
    }

    #[test]
    fn descriptors_are_normalised() {
        let image = blob(48.3, 47.6);
        let sift = Sift::default();
        let mut keypoints = vec![KeyPoint::new(44.0, 40.0, 7.0), KeyPoint::new(48.0, 48.0, 12.0)];
        let descriptors = sift.compute(&image, &mut keypoints);
        assert_eq!(descriptors.len(), 2);
        for descriptor in descriptors.iter() {
            assert!(descriptor.iter().all(|&v| (0.0..=255.0).contains(&v)));
            assert!(descriptor.iter().any(|&v| v > 0.0));
        }
        assert!(keypoints.iter().all(|k| k.angle.is_none()));
    }

    #[test]
    fn shifted_patch_matches_its_source() {
        let sift = Sift::default();
        // small enough to be described in the first octave
        let mut original = vec![KeyPoint::new(40.0, 48.0, 3.0)];
        let mut shifted = vec![KeyPoint::new(44.0, 48.0, 3.0)];
        assert_eq!(sift.locate(3.0, 5).0, 0);

        let a = sift.compute(&blob(44.0, 48.0), &mut original);
        let b = sift.compute(&blob(48.0, 48.0), &mut shifted);
        assert!(a[0].iter().any(|&v| v > 0.0));
        assert!(euclidean_distance(&a[0], &b[0]) < 1e-3);
    }
}
