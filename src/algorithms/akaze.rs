//! AKAZE (Accelerated KAZE)
//!
//! Keypoints are maxima of the scale normalised Hessian determinant in a
//! nonlinear scale space built with Fast Explicit Diffusion. Descriptors are
//! Modified-Local Difference Binaries over the same evolution levels, so they
//! can only describe keypoints found by this detector.

use std::f32::consts::PI;

use image::GrayImage;
use log::{debug, trace};
use nalgebra::{Matrix2, Vector2};

use crate::algorithms::float_image::FloatImage;
use crate::error::{Error, Result};
use crate::features::{
    descriptor::{BinaryDescriptor, BitWriter},
    keypoint::KeyPoint,
};

/// Conductance of the nonlinear diffusion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diffusivity {
    /// Perona-Malik `1 / (1 + |∇L|² / k²)`, favours wide regions
    PmG2,
    /// Perona-Malik `exp(-|∇L|² / k²)`, favours high contrast edges
    PmG1,
}

#[derive(Debug, Clone)]
pub struct Akaze {
    pub octaves: usize,
    pub sublevels: usize,
    /// Base scale offset of the first level
    pub sigma_offset: f32,
    /// Detector response threshold
    pub threshold: f32,
    pub diffusivity: Diffusivity,
    /// Gradient histogram percentile taken as contrast factor
    pub contrast_percentile: f32,
    pub contrast_bins: usize,
    /// Half extent of the descriptor grid in units of keypoint scale
    pub pattern_size: i32,
}

impl Default for Akaze {
    fn default() -> Self {
        Self {
            octaves: 4,
            sublevels: 4,
            sigma_offset: 1.6,
            threshold: 0.001,
            diffusivity: Diffusivity::PmG2,
            contrast_percentile: 0.7,
            contrast_bins: 300,
            pattern_size: 10,
        }
    }
}

/// One level of the nonlinear scale space
struct Evolution {
    /// Diffused image
    lt: FloatImage,
    lx: FloatImage,
    ly: FloatImage,
    /// Scale normalised Hessian determinant
    ldet: FloatImage,
    esigma: f32,
    octave: usize,
    /// Derivative step in pixels of the octave
    sigma_size: usize,
}

impl Evolution {
    fn ratio(&self) -> f32 {
        (1 << self.octave) as f32
    }
}

const DERIVATIVE_FACTOR: f32 = 1.5;
const MIN_OCTAVE_SIZE: usize = 32;
const FED_TAU_MAX: f32 = 0.25;
const DEFAULT_CONTRAST: f32 = 0.03;

impl Akaze {
    fn scale_space(&self, image: &GrayImage) -> Vec<Evolution> {
        let base = FloatImage::from_gray(image, 1.0 / 255.0);
        let mut contrast = contrast_factor(&base, self.contrast_percentile, self.contrast_bins);
        trace!("akaze contrast factor {contrast}");

        let mut evolutions: Vec<Evolution> = Vec::new();
        let mut lt = base.gaussian_blur(self.sigma_offset);
        let mut previous_time = 0.0;

        'octaves: for octave in 0..self.octaves {
            for sublevel in 0..self.sublevels {
                let esigma = self.sigma_offset
                    * 2f32.powf(octave as f32 + sublevel as f32 / self.sublevels as f32);
                let etime = 0.5 * esigma * esigma;

                if !evolutions.is_empty() {
                    if sublevel == 0 {
                        lt = lt.half_sample();
                        contrast *= 0.75;
                        if lt.width < MIN_OCTAVE_SIZE || lt.height < MIN_OCTAVE_SIZE {
                            break 'octaves;
                        }
                    }

                    let smooth = lt.gaussian_blur(1.0);
                    let flow = conductance(
                        &scharr(&smooth, 1, true),
                        &scharr(&smooth, 1, false),
                        contrast,
                        self.diffusivity,
                    );
                    for tau in fed_steps(etime - previous_time, FED_TAU_MAX) {
                        let step = diffusion_step(&lt, &flow);
                        lt.data
                            .iter_mut()
                            .zip(step.data.iter())
                            .for_each(|(l, s)| *l += tau * s);
                    }
                }
                previous_time = etime;

                let ratio = (1 << octave) as f32;
                let sigma_size = ((esigma / ratio).round() as usize).max(1);
                let smooth = lt.gaussian_blur(1.0);
                let lx = scharr(&smooth, sigma_size, true);
                let ly = scharr(&smooth, sigma_size, false);
                let lxx = scharr(&lx, sigma_size, true);
                let lyy = scharr(&ly, sigma_size, false);
                let lxy = scharr(&lx, sigma_size, false);
                let normalization = (sigma_size as f32).powi(4);
                let ldet = FloatImage {
                    width: lt.width,
                    height: lt.height,
                    data: (0..lt.data.len())
                        .map(|i| (lxx.data[i] * lyy.data[i] - lxy.data[i] * lxy.data[i]) * normalization)
                        .collect(),
                };

                evolutions.push(Evolution {
                    lt: lt.clone(),
                    lx,
                    ly,
                    ldet,
                    esigma,
                    octave,
                    sigma_size,
                });
            }
        }

        evolutions
    }

    pub fn detect(&self, image: &GrayImage) -> Vec<KeyPoint> {
        let evolutions = self.scale_space(image);
        let mut keypoints: Vec<KeyPoint> = Vec::new();

        for (level, evolution) in evolutions.iter().enumerate() {
            let det = &evolution.ldet;
            let margin = evolution.sigma_size + 1;
            if det.width <= 2 * margin || det.height <= 2 * margin {
                continue;
            }

            for y in margin..det.height - margin {
                for x in margin..det.width - margin {
                    let value = det.get(x, y);
                    if value <= self.threshold || !is_local_max(det, x, y) {
                        continue;
                    }
                    let Some(candidate) = refine(evolution, level, x, y) else {
                        continue;
                    };
                    suppress_across_levels(&mut keypoints, candidate);
                }
            }
        }

        for keypoint in keypoints.iter_mut() {
            let evolution = &evolutions[keypoint.class_id as usize];
            *keypoint = keypoint.with_angle(main_orientation(evolution, keypoint).to_degrees());
        }

        debug!("akaze detected {} keypoints over {} levels", keypoints.len(), evolutions.len());
        keypoints
    }

    /// M-LDB descriptors, 486 bits each.
    ///
    /// Every keypoint must carry the evolution level it was detected at in `class_id`.
    pub fn compute(&self, image: &GrayImage, keypoints: &mut [KeyPoint]) -> Result<Vec<BinaryDescriptor>> {
        let evolutions = self.scale_space(image);

        if let Some(foreign) = keypoints
            .iter()
            .find(|k| k.class_id < 0 || k.class_id as usize >= evolutions.len())
        {
            return Err(Error::IncompatibleKeypoints {
                descriptor: "AKAZE",
                reason: format!(
                    "keypoint at ({:.1}, {:.1}) has no AKAZE evolution level (class_id {})",
                    foreign.x(),
                    foreign.y(),
                    foreign.class_id
                ),
            });
        }

        Ok(keypoints
            .iter_mut()
            .map(|keypoint| {
                let evolution = &evolutions[keypoint.class_id as usize];
                if keypoint.angle.is_none() {
                    *keypoint = keypoint.with_angle(main_orientation(evolution, keypoint).to_degrees());
                }
                self.mldb(evolution, keypoint)
            })
            .collect())
    }

    fn mldb(&self, evolution: &Evolution, keypoint: &KeyPoint) -> BinaryDescriptor {
        let ratio = evolution.ratio();
        let scale = (0.5 * keypoint.size / ratio).round().max(1.0);
        let (xf, yf) = (keypoint.x() / ratio, keypoint.y() / ratio);
        let (sin, cos) = keypoint.angle_radians().sin_cos();
        let pattern = self.pattern_size;

        let mut descriptor = BitWriter::new();
        for cells_per_side in 2..=4 {
            let step = (2 * pattern + cells_per_side - 1) / cells_per_side;

            let mut cells: Vec<[f32; 3]> = Vec::new();
            for i in (-pattern..pattern).step_by(step as usize) {
                for j in (-pattern..pattern).step_by(step as usize) {
                    let mut sum = [0f32; 3];
                    let mut samples = 0;
                    for k in i..(i + step).min(pattern) {
                        for l in j..(j + step).min(pattern) {
                            let (u, v) = (l as f32 * scale, k as f32 * scale);
                            let sx = (xf + u * cos - v * sin).round() as isize;
                            let sy = (yf + u * sin + v * cos).round() as isize;

                            let rx = evolution.lx.get_clamped(sx, sy);
                            let ry = evolution.ly.get_clamped(sx, sy);
                            sum[0] += evolution.lt.get_clamped(sx, sy);
                            sum[1] += rx * cos + ry * sin;
                            sum[2] += -rx * sin + ry * cos;
                            samples += 1;
                        }
                    }
                    let n = samples.max(1) as f32;
                    cells.push([sum[0] / n, sum[1] / n, sum[2] / n]);
                }
            }

            for a in 0..cells.len() {
                for b in a + 1..cells.len() {
                    for channel in 0..3 {
                        descriptor.push(cells[a][channel] > cells[b][channel]);
                    }
                }
            }
        }

        descriptor.finish()
    }
}

/// Histogram percentile of the gradient modulus of the lightly smoothed image
fn contrast_factor(image: &FloatImage, percentile: f32, bins: usize) -> f32 {
    let smooth = image.gaussian_blur(1.0);
    let lx = scharr(&smooth, 1, true);
    let ly = scharr(&smooth, 1, false);

    let mut moduli = Vec::new();
    for y in 1..smooth.height.saturating_sub(1) {
        for x in 1..smooth.width.saturating_sub(1) {
            let modulus = lx.get(x, y).hypot(ly.get(x, y));
            if modulus > 0.0 {
                moduli.push(modulus);
            }
        }
    }

    let max = moduli.iter().copied().fold(0f32, f32::max);
    if max <= 0.0 || bins == 0 {
        return DEFAULT_CONTRAST;
    }

    let mut histogram = vec![0usize; bins];
    for modulus in moduli.iter() {
        let bin = ((modulus / max) * bins as f32) as usize;
        histogram[bin.min(bins - 1)] += 1;
    }

    let wanted = (moduli.len() as f32 * percentile) as usize;
    let mut accumulated = 0;
    let mut bin = 0;
    while bin < bins && accumulated < wanted {
        accumulated += histogram[bin];
        bin += 1;
    }

    let contrast = max * bin as f32 / bins as f32;
    if contrast > 0.0 {
        contrast
    } else {
        DEFAULT_CONTRAST
    }
}

/// Scharr derivative with the taps `step` pixels apart, per pixel units
fn scharr(image: &FloatImage, step: usize, horizontal: bool) -> FloatImage {
    let k = step as isize;
    let norm = 1.0 / (32.0 * step as f32);
    let mut out = FloatImage::new(image.width, image.height);

    for y in 0..image.height as isize {
        for x in 0..image.width as isize {
            let g = |dx: isize, dy: isize| {
                if horizontal {
                    image.get_reflect(x + dx, y + dy)
                } else {
                    image.get_reflect(x + dy, y + dx)
                }
            };
            let d = 3.0 * (g(k, -k) - g(-k, -k)) + 10.0 * (g(k, 0) - g(-k, 0)) + 3.0 * (g(k, k) - g(-k, k));
            out.set(x as usize, y as usize, d * norm);
        }
    }
    out
}

fn conductance(lx: &FloatImage, ly: &FloatImage, contrast: f32, diffusivity: Diffusivity) -> FloatImage {
    let inverse_k2 = 1.0 / (contrast * contrast);
    FloatImage {
        width: lx.width,
        height: lx.height,
        data: lx
            .data
            .iter()
            .zip(ly.data.iter())
            .map(|(gx, gy)| {
                let gradient = (gx * gx + gy * gy) * inverse_k2;
                match diffusivity {
                    Diffusivity::PmG2 => 1.0 / (1.0 + gradient),
                    Diffusivity::PmG1 => (-gradient).exp(),
                }
            })
            .collect(),
    }
}

/// Step sizes of one Fast Explicit Diffusion cycle reaching diffusion time `time`
fn fed_steps(time: f32, tau_max: f32) -> Vec<f32> {
    if time <= 0.0 {
        return Vec::new();
    }
    let n = ((3.0 * time / tau_max + 0.25).sqrt() - 0.5 - 1.0e-8).ceil().max(1.0) as usize;
    let scale = 3.0 * time / (tau_max * (n * (n + 1)) as f32);
    let c = 1.0 / (4.0 * n as f32 + 2.0);
    let d = scale * tau_max / 2.0;

    (0..n)
        .map(|i| {
            let h = (PI * (2 * i + 1) as f32 * c).cos();
            d / (h * h)
        })
        .collect()
}

/// Divergence of the conductance weighted gradient, zero flux at the border
fn diffusion_step(lt: &FloatImage, flow: &FloatImage) -> FloatImage {
    let mut step = FloatImage::new(lt.width, lt.height);
    for y in 0..lt.height as isize {
        for x in 0..lt.width as isize {
            let l = lt.get_clamped(x, y);
            let c = flow.get_clamped(x, y);
            let x_pos = (c + flow.get_clamped(x + 1, y)) * (lt.get_clamped(x + 1, y) - l);
            let x_neg = (flow.get_clamped(x - 1, y) + c) * (l - lt.get_clamped(x - 1, y));
            let y_pos = (c + flow.get_clamped(x, y + 1)) * (lt.get_clamped(x, y + 1) - l);
            let y_neg = (flow.get_clamped(x, y - 1) + c) * (l - lt.get_clamped(x, y - 1));
            step.set(x as usize, y as usize, 0.5 * (x_pos - x_neg + y_pos - y_neg));
        }
    }
    step
}

fn is_local_max(image: &FloatImage, x: usize, y: usize) -> bool {
    let value = image.get(x, y);
    for dy in -1isize..=1 {
        for dx in -1isize..=1 {
            if (dx != 0 || dy != 0) && image.get_clamped(x as isize + dx, y as isize + dy) >= value {
                return false;
            }
        }
    }
    true
}

/// Quadratic subpixel fit of the determinant, `None` when the peak leaves the pixel
fn refine(evolution: &Evolution, level: usize, x: usize, y: usize) -> Option<KeyPoint> {
    let det = &evolution.ldet;
    let (xi, yi) = (x as isize, y as isize);
    let d = |dx: isize, dy: isize| det.get_clamped(xi + dx, yi + dy);

    let gradient = Vector2::new(0.5 * (d(1, 0) - d(-1, 0)), 0.5 * (d(0, 1) - d(0, -1)));
    let dxx = d(1, 0) + d(-1, 0) - 2.0 * d(0, 0);
    let dyy = d(0, 1) + d(0, -1) - 2.0 * d(0, 0);
    let dxy = 0.25 * (d(1, 1) + d(-1, -1) - d(-1, 1) - d(1, -1));

    let offset = Matrix2::new(dxx, dxy, dxy, dyy)
        .try_inverse()
        .map(|inverse| -(inverse * gradient))
        .unwrap_or_else(Vector2::zeros);
    if offset.x.abs() > 1.0 || offset.y.abs() > 1.0 {
        return None;
    }

    let ratio = evolution.ratio();
    let mut keypoint = KeyPoint::new(
        (x as f32 + offset.x) * ratio + 0.5 * (ratio - 1.0),
        (y as f32 + offset.y) * ratio + 0.5 * (ratio - 1.0),
        evolution.esigma * DERIVATIVE_FACTOR,
    )
    .with_response(d(0, 0));
    keypoint.octave = evolution.octave as i32;
    keypoint.class_id = level as i32;
    Some(keypoint)
}

/// Keeps the stronger of two responses on the same or adjacent levels
/// whose centres are closer than the keypoint size
fn suppress_across_levels(keypoints: &mut Vec<KeyPoint>, candidate: KeyPoint) {
    let radius2 = candidate.size * candidate.size;
    let neighbour = keypoints.iter().position(|kept| {
        (kept.class_id - candidate.class_id).abs() <= 1
            && nalgebra::distance_squared(&kept.point, &candidate.point) <= radius2
    });

    match neighbour {
        Some(index) if keypoints[index].response < candidate.response => keypoints[index] = candidate,
        Some(_) => {}
        None => keypoints.push(candidate),
    }
}

/// Dominant gradient direction in radians, from a sliding 60 degree window
fn main_orientation(evolution: &Evolution, keypoint: &KeyPoint) -> f32 {
    let ratio = evolution.ratio();
    let s = (0.5 * keypoint.size / ratio).round().max(1.0);
    let (xf, yf) = (keypoint.x() / ratio, keypoint.y() / ratio);

    let mut responses = Vec::with_capacity(113);
    for i in -6i32..=6 {
        for j in -6i32..=6 {
            if i * i + j * j >= 36 {
                continue;
            }
            let ix = (xf + i as f32 * s).round() as isize;
            let iy = (yf + j as f32 * s).round() as isize;
            let weight = (-((i * i + j * j) as f32) / (2.0 * 2.5 * 2.5)).exp();
            let rx = weight * evolution.lx.get_clamped(ix, iy);
            let ry = weight * evolution.ly.get_clamped(ix, iy);
            responses.push((ry.atan2(rx).rem_euclid(2.0 * PI), rx, ry));
        }
    }

    let window = PI / 3.0;
    let mut best = (0f32, 0f32, 0f32);
    let mut start = 0f32;
    while start < 2.0 * PI {
        let end = start + window;
        let (mut sum_x, mut sum_y) = (0f32, 0f32);
        for &(angle, rx, ry) in responses.iter() {
            let inside = if end <= 2.0 * PI {
                angle >= start && angle < end
            } else {
                angle >= start || angle < end - 2.0 * PI
            };
            if inside {
                sum_x += rx;
                sum_y += ry;
            }
        }
        let magnitude = sum_x * sum_x + sum_y * sum_y;
        if magnitude > best.0 {
            best = (magnitude, sum_x, sum_y);
        }
        start += 0.15;
    }

    best.2.atan2(best.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::descriptor::hamming_distance;
    use image::Luma;

    fn gaussian_blob(cx: f32, cy: f32) -> GrayImage {
        GrayImage::from_fn(128, 128, |x, y| {
            let r2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            Luma([(20.0 + 220.0 * (-r2 / (2.0 * 6.0 * 6.0)).exp()) as u8])
        })
    }

    #[test]
    fn fed_cycle_reaches_the_diffusion_time() {
        for time in [0.3, 1.0, 4.5, 20.0] {
            let steps = fed_steps(time, FED_TAU_MAX);
            let total: f32 = steps.iter().sum();
            assert!((total - time).abs() < 1e-3 * time, "time {time} total {total}");
        }
        assert!(fed_steps(0.0, FED_TAU_MAX).is_empty());
    }

    #[test]
    fn contrast_of_flat_image_falls_back() {
        let image = FloatImage::new(40, 40);
        assert_eq!(contrast_factor(&image, 0.7, 300), DEFAULT_CONTRAST);
    }

    #[test]
    fn scharr_of_ramp_is_its_slope() {
        let mut ramp = FloatImage::new(20, 20);
        for y in 0..20 {
            for x in 0..20 {
                ramp.set(x, y, 0.5 * x as f32);
            }
        }
        for step in 1..=3 {
            let lx = scharr(&ramp, step, true);
            let ly = scharr(&ramp, step, false);
            assert!((lx.get(10, 10) - 0.5).abs() < 1e-5);
            assert!(ly.get(10, 10).abs() < 1e-5);
        }
    }

    #[test]
    fn blob_centre_is_detected() {
        let akaze = Akaze::default();
        let keypoints = akaze.detect(&gaussian_blob(64.0, 64.0));
        assert!(!keypoints.is_empty());
        assert!(keypoints
            .iter()
            .any(|k| (k.x() - 64.0).abs() < 2.0 && (k.y() - 64.0).abs() < 2.0));
        assert!(keypoints.iter().all(|k| k.class_id >= 0 && k.angle.is_some()));
    }

    #[test]
    fn descriptors_require_akaze_keypoints() {
        let akaze = Akaze::default();
        let image = gaussian_blob(64.0, 64.0);

        let mut keypoints = akaze.detect(&image);
        let descriptors = akaze.compute(&image, &mut keypoints).unwrap();
        assert_eq!(descriptors.len(), keypoints.len());
        // 486 bits used, the rest is padding
        assert!(descriptors.iter().all(|d| d[61..].iter().all(|&b| b == 0)));

        let mut foreign = vec![KeyPoint::new(64.0, 64.0, 7.0)];
        assert!(matches!(
            akaze.compute(&image, &mut foreign),
            Err(Error::IncompatibleKeypoints { descriptor: "AKAZE", .. })
        ));
    }

    #[test]
    fn shifted_patch_matches_its_source() {
        let akaze = Akaze::default();
        // first evolution level, upright so every sample lands on whole pixels
        let keypoint = |x: f32| {
            let mut keypoint = KeyPoint::new(x, 64.0, 4.8).with_angle(0.0);
            keypoint.class_id = 0;
            keypoint
        };
        let mut original = vec![keypoint(58.0)];
        let mut shifted = vec![keypoint(62.0)];
        let a = akaze.compute(&gaussian_blob(64.0, 64.0), &mut original).unwrap();
        let b = akaze.compute(&gaussian_blob(68.0, 64.0), &mut shifted).unwrap();
        assert!(a[0].iter().any(|&byte| byte != 0));
        assert_eq!(hamming_distance(&a[0], &b[0]), 0);
    }
}
