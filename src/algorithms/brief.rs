use image::GrayImage;
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::features::{
    descriptor::{BinaryDescriptor, BitWriter},
    keypoint::KeyPoint,
};

/// Side of the square patch the test pairs are drawn from
pub const PATCH_SIZE: i16 = 48;
/// Smoothing kernel applied before the intensity tests
const KERNEL_SIZE: i16 = 9;
const MAX_TESTS: usize = 512;

/// BRIEF (Binary Robust Independent Elementary Features) extractor
#[derive(Debug, Clone)]
pub struct Brief {
    /// Descriptor length in bytes, one of 16, 32 or 64
    pub bytes: usize,
    /// Rotate the test pattern by the keypoint angle
    pub use_orientation: bool,
}

impl Default for Brief {
    fn default() -> Self {
        Self {
            bytes: 32,
            use_orientation: false,
        }
    }
}

impl Brief {
    /// Keypoints closer than this to the border are dropped
    pub const BORDER: f32 = (PATCH_SIZE / 2 + KERNEL_SIZE / 2) as f32;

    pub fn compute(&self, image: &GrayImage, keypoints: &mut Vec<KeyPoint>) -> Vec<BinaryDescriptor> {
        // using a kernel value of 2 indicated by reference:
        // https://medium.com/data-breach/introduction-to-brief-binary-robust-independent-elementary-features-436f4a31a0e6
        const GAUSSIAN_KERNEL_SIGMA: f32 = 2.0;

        let (width, height) = (image.width() as f32, image.height() as f32);
        keypoints.retain(|k| {
            k.x() >= Self::BORDER
                && k.y() >= Self::BORDER
                && k.x() < width - Self::BORDER
                && k.y() < height - Self::BORDER
        });

        // apply a guassion blur to the image for computing BRIEF descriptors,
        // that way the image is not overly sesnsitive to high frequency noise.
        let smoothed_image = imageproc::filter::gaussian_blur_f32(image, GAUSSIAN_KERNEL_SIGMA);

        keypoints
            .iter()
            .map(|keypoint| {
                let angle = if self.use_orientation {
                    keypoint.angle_radians()
                } else {
                    0.0
                };
                compute_descriptor(
                    keypoint.x().round() as i32,
                    keypoint.y().round() as i32,
                    angle,
                    self.bytes * 8,
                    &smoothed_image,
                )
            })
            .collect()
    }
}

/// Compute BRIEF on a smoothed grayscale image at the target pixel.
///
/// Test points falling outside the image read as `0`.
pub fn compute_descriptor(
    x: i32,
    y: i32,
    angle: f32,
    tests: usize,
    image: &GrayImage,
) -> BinaryDescriptor {
    let (sin, cos) = angle.sin_cos();
    let rotate = |px: i16, py: i16| -> (i32, i32) {
        if angle == 0.0 {
            (x + px as i32, y + py as i32)
        } else {
            let (px, py) = (px as f32, py as f32);
            (
                x + (px * cos - py * sin).round() as i32,
                y + (px * sin + py * cos).round() as i32,
            )
        }
    };

    let intensity = |(px, py): (i32, i32)| -> u8 {
        if px >= 0 && py >= 0 && (px as u32) < image.width() && (py as u32) < image.height() {
            image.get_pixel(px as u32, py as u32).0[0]
        } else {
            0
        }
    };

    let mut descriptor = BitWriter::new();
    for &[p1x, p1y, p2x, p2y] in BRIEF_SAMPLES.iter().take(tests.min(MAX_TESTS)) {
        let first = intensity(rotate(p1x, p1y));
        let second = intensity(rotate(p2x, p2y));
        descriptor.push(first < second);
    }

    descriptor.finish()
}

/// Precomputed test pairs, up to 512 bits.
/// The values remain consistent accross frames, because we want to achieve a similar level of entropy
/// to best match our previous encounters with points.
pub(crate) static BRIEF_SAMPLES: Lazy<[[i16; 4]; MAX_TESTS]> = Lazy::new(|| {
    // use reproducible random numbers so that descriptors are comparable between runs
    let mut rng = StdRng::seed_from_u64(42);

    // isotropic gaussian with sigma^2 = S^2 / 25, clamped to the patch
    let normal_dist: Normal<f64> = Normal::new(0.0, PATCH_SIZE as f64 / 5.0).unwrap();
    let bound = (PATCH_SIZE / 2 - 1) as f64;

    let mut samples = [[0; 4]; MAX_TESTS];
    for sample in samples.iter_mut() {
        for coordinate in sample.iter_mut() {
            *coordinate = normal_dist.sample(&mut rng).round().clamp(-bound, bound) as i16;
        }
    }

    samples
});
