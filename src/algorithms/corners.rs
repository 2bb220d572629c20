//! Classical corner detectors: Shi-Tomasi, Harris and FAST

use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use log::trace;

use crate::algorithms::float_image::reflect101;
use crate::features::keypoint::KeyPoint;

/// Per pixel sums of the gradient products over a `block_size` window.
///
/// Returns `(sum dx*dx, sum dx*dy, sum dy*dy)` as row major buffers.
pub(crate) fn structure_tensor(
    image: &GrayImage,
    block_size: u32,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);

    let gx = horizontal_sobel(image);
    let gy = vertical_sobel(image);

    let mut xx = vec![0f32; w * h];
    let mut xy = vec![0f32; w * h];
    let mut yy = vec![0f32; w * h];
    for (i, (dx, dy)) in gx.as_raw().iter().zip(gy.as_raw().iter()).enumerate() {
        let (dx, dy) = (*dx as f32, *dy as f32);
        xx[i] = dx * dx;
        xy[i] = dx * dy;
        yy[i] = dy * dy;
    }

    (
        box_sum(&xx, w, h, block_size),
        box_sum(&xy, w, h, block_size),
        box_sum(&yy, w, h, block_size),
    )
}

/// Unnormalised `block_size` box filter with reflect-101 borders
fn box_sum(src: &[f32], w: usize, h: usize, block_size: u32) -> Vec<f32> {
    // anchor at the block centre, so an even block extends one pixel further back
    let start = -((block_size / 2) as isize);
    let end = start + block_size as isize;

    let mut rows = vec![0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            rows[y * w + x] = (start..end)
                .map(|k| src[y * w + reflect101(x as isize + k, w as isize)])
                .sum();
        }
    }

    let mut out = vec![0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            out[y * w + x] = (start..end)
                .map(|k| rows[reflect101(y as isize + k, h as isize) * w + x])
                .sum();
        }
    }
    out
}

/// Indices of the entries which are the strict maximum of their 3x3 neighbourhood.
///
/// `scores` is a dense `width * height` buffer, zero meaning "no candidate".
/// Ties are resolved in favour of the first pixel in raster order.
pub(crate) fn local_maxima_3x3(scores: &[f32], width: usize, height: usize) -> Vec<(usize, usize)> {
    let mut maxima = Vec::new();
    for y in 0..height {
        for x in 0..width {
            let score = scores[y * width + x];
            if score <= 0.0 {
                continue;
            }

            let mut is_max = true;
            'neighbours: for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let (nx, ny) = (x as isize + dx, y as isize + dy);
                    if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                        continue;
                    }
                    let neighbour = scores[ny as usize * width + nx as usize];
                    // earlier pixels win ties
                    let before = dy < 0 || (dy == 0 && dx < 0);
                    if neighbour > score || (before && neighbour == score) {
                        is_max = false;
                        break 'neighbours;
                    }
                }
            }

            if is_max {
                maxima.push((x, y));
            }
        }
    }
    maxima
}

/// Shi-Tomasi "good features to track" parameters
#[derive(Debug, Clone)]
pub struct ShiTomasi {
    pub block_size: u32,
    /// Maximum permissible overlap between two features
    pub max_overlap: f64,
    pub quality_level: f32,
}

impl Default for ShiTomasi {
    fn default() -> Self {
        Self {
            block_size: 4,
            max_overlap: 0.0,
            quality_level: 0.01,
        }
    }
}

impl ShiTomasi {
    pub fn min_distance(&self) -> f64 {
        (1.0 - self.max_overlap) * self.block_size as f64
    }

    pub fn max_corners(&self, image: &GrayImage) -> usize {
        let area = (image.width() * image.height()) as f64;
        (area / self.min_distance().max(1.0)) as usize
    }

    /// Corners sorted by descending quality
    pub fn detect(&self, image: &GrayImage) -> Vec<KeyPoint> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        if width < 3 || height < 3 {
            return Vec::new();
        }

        let (xx, xy, yy) = structure_tensor(image, self.block_size);
        let mut eigen = xx
            .iter()
            .zip(xy.iter())
            .zip(yy.iter())
            .map(|((&a, &b), &c)| {
                let (a, c) = (a * 0.5, c * 0.5);
                (a + c) - ((a - c) * (a - c) + b * b).sqrt()
            })
            .collect::<Vec<_>>();

        let max = eigen.iter().copied().fold(0f32, f32::max);
        if max <= 0.0 {
            return Vec::new();
        }
        let threshold = max * self.quality_level;
        eigen.iter_mut().for_each(|v| {
            if *v < threshold {
                *v = 0.0
            }
        });

        // the outermost ring of pixels is never reported
        let mut candidates = local_maxima_3x3(&eigen, width, height)
            .into_iter()
            .filter(|&(x, y)| x > 0 && y > 0 && x < width - 1 && y < height - 1)
            .map(|(x, y)| (x, y, eigen[y * width + x]))
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

        let min_distance = self.min_distance() as f32;
        let max_corners = self.max_corners(image);

        // grid of accepted corners, each cell is min_distance wide
        let cell = min_distance.max(1.0);
        let grid_w = (width as f32 / cell).ceil() as usize + 1;
        let grid_h = (height as f32 / cell).ceil() as usize + 1;
        let mut grid: Vec<Vec<(f32, f32)>> = vec![Vec::new(); grid_w * grid_h];

        let mut keypoints = Vec::new();
        for (x, y, quality) in candidates {
            if keypoints.len() >= max_corners {
                break;
            }
            let (fx, fy) = (x as f32, y as f32);
            let (cx, cy) = ((fx / cell) as usize, (fy / cell) as usize);

            let crowded = (cy.saturating_sub(1)..=(cy + 1).min(grid_h - 1)).any(|gy| {
                (cx.saturating_sub(1)..=(cx + 1).min(grid_w - 1)).any(|gx| {
                    grid[gy * grid_w + gx].iter().any(|&(ox, oy)| {
                        (ox - fx) * (ox - fx) + (oy - fy) * (oy - fy) < min_distance * min_distance
                    })
                })
            });
            if crowded {
                continue;
            }

            grid[cy * grid_w + cx].push((fx, fy));
            keypoints.push(KeyPoint::new(fx, fy, self.block_size as f32).with_response(quality));
        }

        keypoints
    }
}

/// Harris corner detector with overlap based non-maximum suppression
#[derive(Debug, Clone)]
pub struct Harris {
    /// Neighbourhood considered for every pixel
    pub block_size: u32,
    /// Sobel aperture, must be odd
    pub aperture_size: u32,
    /// Minimum value in the 8 bit scaled response
    pub min_response: i32,
    pub k: f32,
    /// Maximum permissible overlap between two features
    pub max_overlap: f32,
}

impl Default for Harris {
    fn default() -> Self {
        Self {
            block_size: 2,
            aperture_size: 3,
            min_response: 100,
            k: 0.04,
            max_overlap: 0.0,
        }
    }
}

impl Harris {
    /// Harris response min-max normalised to `[0, 255]`
    pub fn normalized_response(&self, image: &GrayImage) -> Vec<f32> {
        let (xx, xy, yy) = structure_tensor(image, self.block_size);
        let response = xx
            .iter()
            .zip(xy.iter())
            .zip(yy.iter())
            .map(|((&a, &b), &c)| a * c - b * b - self.k * (a + c) * (a + c))
            .collect::<Vec<_>>();

        let min = response.iter().copied().fold(f32::MAX, f32::min);
        let max = response.iter().copied().fold(f32::MIN, f32::max);
        if !(max > min) {
            return vec![0.0; response.len()];
        }

        let scale = 255.0 / (max - min);
        response.into_iter().map(|r| (r - min) * scale).collect()
    }

    pub fn detect(&self, image: &GrayImage) -> Vec<KeyPoint> {
        let width = image.width() as usize;
        let response = self.normalized_response(image);

        let mut keypoints: Vec<KeyPoint> = Vec::new();
        for (i, value) in response.iter().enumerate() {
            let strength = *value as i32;
            if strength <= self.min_response {
                continue;
            }

            let candidate = KeyPoint::new(
                (i % width) as f32,
                (i / width) as f32,
                (2 * self.aperture_size) as f32,
            )
            .with_response(strength as f32);

            self.suppress(&mut keypoints, candidate);
        }

        trace!("harris kept {} keypoints", keypoints.len());
        keypoints
    }

    /// Non-maximum suppression in the neighbourhood of `candidate`.
    ///
    /// The first overlapping keypoint with a weaker response is replaced, a
    /// candidate which overlaps nothing is appended.
    pub fn suppress(&self, keypoints: &mut Vec<KeyPoint>, candidate: KeyPoint) {
        let mut overlap = false;
        for kept in keypoints.iter_mut() {
            if KeyPoint::overlap(&candidate, kept) > self.max_overlap {
                overlap = true;
                if candidate.response > kept.response {
                    *kept = candidate;
                    break;
                }
            }
        }

        if !overlap {
            keypoints.push(candidate);
        }
    }
}

/// FAST 9-16 segment test
#[derive(Debug, Clone)]
pub struct Fast {
    pub threshold: u8,
    pub non_max_suppression: bool,
}

impl Default for Fast {
    fn default() -> Self {
        Self {
            threshold: 10,
            non_max_suppression: true,
        }
    }
}

impl Fast {
    /// OpenCV reports FAST keypoints with a 7 pixel diameter
    pub const KEYPOINT_SIZE: f32 = 7.0;

    pub fn detect(&self, image: &GrayImage) -> Vec<KeyPoint> {
        let corners = corners_fast9(image, self.threshold);
        let corners = if self.non_max_suppression {
            suppress_corners(&corners, image.width() as usize, image.height() as usize)
        } else {
            corners
        };

        corners
            .into_iter()
            .map(|Corner { x, y, score }| {
                KeyPoint::new(x as f32, y as f32, Self::KEYPOINT_SIZE).with_response(score)
            })
            .collect()
    }
}

/// 3x3 non-maximum suppression of FAST corners on their score
pub(crate) fn suppress_corners(corners: &[Corner], width: usize, height: usize) -> Vec<Corner> {
    let mut scores = vec![0f32; width * height];
    for corner in corners {
        // zero scored corners still count as candidates
        scores[corner.y as usize * width + corner.x as usize] = corner.score.max(f32::EPSILON);
    }

    local_maxima_3x3(&scores, width, height)
        .into_iter()
        .map(|(x, y)| Corner::new(x as u32, y as u32, scores[y * width + x]))
        .collect()
}
