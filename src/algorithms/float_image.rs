use image::GrayImage;

/// Single channel `f32` image used by the scale space detectors (SIFT, AKAZE)
#[derive(Debug, Clone, PartialEq)]
pub struct FloatImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl FloatImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    /// Converts an 8 bit image, multiplying every intensity by `scale`
    pub fn from_gray(image: &GrayImage, scale: f32) -> Self {
        Self {
            width: image.width() as usize,
            height: image.height() as usize,
            data: image.as_raw().iter().map(|&v| v as f32 * scale).collect(),
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.data[y * self.width + x] = value;
    }

    /// Pixel access with reflect-101 borders (`-1 -> 1`, `w -> w - 2`)
    #[inline]
    pub fn get_reflect(&self, x: isize, y: isize) -> f32 {
        self.get(
            reflect101(x, self.width as isize),
            reflect101(y, self.height as isize),
        )
    }

    /// Pixel access clamped to the image border
    #[inline]
    pub fn get_clamped(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.get(x, y)
    }

    /// Bilinear interpolation, clamped to the border
    pub fn sample(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as isize, y0 as isize);

        let top = self.get_clamped(x0, y0) * (1.0 - fx) + self.get_clamped(x0 + 1, y0) * fx;
        let bottom =
            self.get_clamped(x0, y0 + 1) * (1.0 - fx) + self.get_clamped(x0 + 1, y0 + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Separable Gaussian blur with reflect-101 borders
    pub fn gaussian_blur(&self, sigma: f32) -> FloatImage {
        if sigma <= 0.0 || self.data.is_empty() {
            return self.clone();
        }
        let kernel = gaussian_kernel(sigma);
        let radius = (kernel.len() / 2) as isize;

        let mut horizontal = FloatImage::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let sum = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, weight)| {
                        weight * self.get_reflect(x as isize + k as isize - radius, y as isize)
                    })
                    .sum();
                horizontal.set(x, y, sum);
            }
        }

        let mut blurred = FloatImage::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let sum = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, weight)| {
                        weight * horizontal.get_reflect(x as isize, y as isize + k as isize - radius)
                    })
                    .sum();
                blurred.set(x, y, sum);
            }
        }

        blurred
    }

    /// Keeps every second pixel in both directions
    pub fn decimate(&self) -> FloatImage {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut out = FloatImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                out.set(x, y, self.get((2 * x).min(self.width - 1), (2 * y).min(self.height - 1)));
            }
        }
        out
    }

    /// Averages 2x2 blocks
    pub fn half_sample(&self) -> FloatImage {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut out = FloatImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let (x0, y0) = (2 * x as isize, 2 * y as isize);
                let sum = self.get_clamped(x0, y0)
                    + self.get_clamped(x0 + 1, y0)
                    + self.get_clamped(x0, y0 + 1)
                    + self.get_clamped(x0 + 1, y0 + 1);
                out.set(x, y, sum * 0.25);
            }
        }
        out
    }

    /// Bilinear up-sampling by a factor of two
    pub fn upsample(&self) -> FloatImage {
        let mut out = FloatImage::new(self.width * 2, self.height * 2);
        for y in 0..out.height {
            for x in 0..out.width {
                let value = self.sample((x as f32 + 0.5) * 0.5 - 0.5, (y as f32 + 0.5) * 0.5 - 0.5);
                out.set(x, y, value);
            }
        }
        out
    }

    pub fn subtract(&self, other: &FloatImage) -> FloatImage {
        FloatImage {
            width: self.width,
            height: self.height,
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| a - b)
                .collect(),
        }
    }
}

/// Normalised 1D Gaussian kernel covering `+-3 sigma`
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as isize;
    let denominator = 2.0 * sigma * sigma;
    let mut kernel = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / denominator).exp())
        .collect::<Vec<_>>();
    let total: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= total);
    kernel
}

#[inline]
pub(crate) fn reflect101(index: isize, len: isize) -> usize {
    if len == 1 {
        return 0;
    }
    let mut i = index;
    while i < 0 || i >= len {
        if i < 0 {
            i = -i;
        }
        if i >= len {
            i = 2 * (len - 1) - i;
        }
    }
    i as usize
}
