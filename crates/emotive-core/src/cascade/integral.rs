//! Summed-area tables over a grayscale frame.

use crate::frame::GrayFrame;

/// Integral and squared-integral images with one row and column of zero padding.
pub(crate) struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
}

impl IntegralImage {
    pub fn new(frame: &GrayFrame) -> Self {
        let w = frame.width as usize;
        let h = frame.height as usize;
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sqsum = vec![0u64; stride * (h + 1)];

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sqsum = 0u64;
            for x in 0..w {
                let p = frame.data[y * w + x] as u64;
                row_sum += p;
                row_sqsum += p * p;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row_sum;
                sqsum[idx] = sqsum[idx - stride] + row_sqsum;
            }
        }

        Self { stride, sum, sqsum }
    }

    fn area_sum(table: &[u64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> u64 {
        let tl = table[y * stride + x];
        let tr = table[y * stride + x + w];
        let bl = table[(y + h) * stride + x];
        let br = table[(y + h) * stride + x + w];
        (br + tl) - (tr + bl)
    }

    /// Sum of pixels in the `w` × `h` rectangle at (`x`, `y`).
    pub fn rect_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::area_sum(&self.sum, self.stride, x, y, w, h)
    }

    /// Sum of squared pixels in the `w` × `h` rectangle at (`x`, `y`).
    pub fn rect_sqsum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::area_sum(&self.sqsum, self.stride, x, y, w, h)
    }

    /// Reciprocal of `area * stddev` over a rectangle, or 1 for a flat region.
    pub fn inv_variance_norm(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        let area = (w * h) as f64;
        let s = self.rect_sum(x, y, w, h) as f64;
        let sq = self.rect_sqsum(x, y, w, h) as f64;
        let nf = area * sq - s * s;
        let nf = if nf > 0.0 { nf.sqrt() } else { 1.0 };
        1.0 / nf
    }
}
