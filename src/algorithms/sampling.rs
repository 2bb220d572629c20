use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::integral_image::integral_image;

/// Box smoothed intensity lookups backed by an integral image.
///
/// Shared by the sampling pattern descriptors (BRISK, FREAK).
pub(crate) struct BoxSampler<'a> {
    image: &'a GrayImage,
    // one row and column larger than `image`, the first row and column are zero
    integral: Image<Luma<u32>>,
}

impl<'a> BoxSampler<'a> {
    pub fn new(image: &'a GrayImage) -> Self {
        Self {
            image,
            integral: integral_image::<_, u32>(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Mean intensity of the square of half side `sigma` centred on `(x, y)`.
    ///
    /// Below half a pixel the value is interpolated bilinearly instead.
    pub fn mean(&self, x: f32, y: f32, sigma: f32) -> f32 {
        let (w, h) = (self.image.width() as i64, self.image.height() as i64);

        if sigma < 0.5 {
            let (x0, y0) = (x.floor(), y.floor());
            let (fx, fy) = (x - x0, y - y0);
            let at = |u: i64, v: i64| -> f32 {
                let u = u.clamp(0, w - 1) as u32;
                let v = v.clamp(0, h - 1) as u32;
                self.image.get_pixel(u, v).0[0] as f32
            };
            let (x0, y0) = (x0 as i64, y0 as i64);
            let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1, y0) * fx;
            let bottom = at(x0, y0 + 1) * (1.0 - fx) + at(x0 + 1, y0 + 1) * fx;
            return top * (1.0 - fy) + bottom * fy;
        }

        let left = ((x - sigma).round() as i64).clamp(0, w - 1);
        let right = ((x + sigma).round() as i64).clamp(0, w - 1);
        let top = ((y - sigma).round() as i64).clamp(0, h - 1);
        let bottom = ((y + sigma).round() as i64).clamp(0, h - 1);

        let sum = self.sum(left as u32, top as u32, right as u32, bottom as u32);
        let area = ((right - left + 1) * (bottom - top + 1)) as f32;
        sum as f32 / area
    }

    /// Sum over the inclusive rectangle
    fn sum(&self, left: u32, top: u32, right: u32, bottom: u32) -> i64 {
        let at = |x: u32, y: u32| self.integral.get_pixel(x, y).0[0] as i64;
        at(right + 1, bottom + 1) - at(left, bottom + 1) - at(right + 1, top) + at(left, top)
    }
}
