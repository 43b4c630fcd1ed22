//! Grayscale frames: decoding, luma conversion, crop and bilinear resize.

use crate::types::FaceRect;
use thiserror::Error;

// BT.601 luma in 14-bit fixed point, rounding constant 1 << 13.
const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;
const LUMA_SHIFT: u32 = 14;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has zero width or height")]
    Empty,
    #[error("crop {rect:?} does not fit a {width}x{height} frame")]
    CropOutOfBounds { rect: FaceRect, width: u32, height: u32 },
    #[error("pixel buffer has {actual} bytes, expected {expected}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A single-channel 8-bit image, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl GrayFrame {
    /// Wrap an existing buffer of exactly `width * height` bytes.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, ImageError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(ImageError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height })
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> u8) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { data, width, height }
    }

    /// Decode an encoded image (JPEG, PNG, ...) and convert it to grayscale.
    ///
    /// Any alpha channel is dropped before the luma conversion.
    pub fn decode(bytes: &[u8]) -> Result<Self, ImageError> {
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(ImageError::Empty);
        }
        let data = rgb.pixels().map(|p| rgb_to_luma(p.0)).collect();
        Ok(Self { data, width, height })
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// Copy out the sub-image covered by `rect`.
    pub fn crop(&self, rect: &FaceRect) -> Result<GrayFrame, ImageError> {
        if !rect.fits_within(self.width, self.height) {
            return Err(ImageError::CropOutOfBounds {
                rect: *rect,
                width: self.width,
                height: self.height,
            });
        }
        let w = self.width as usize;
        let mut data = Vec::with_capacity(rect.area() as usize);
        for y in rect.y..rect.bottom() {
            let start = y as usize * w + rect.x as usize;
            data.extend_from_slice(&self.data[start..start + rect.width as usize]);
        }
        Ok(GrayFrame {
            data,
            width: rect.width,
            height: rect.height,
        })
    }

    /// Resize with bilinear interpolation on half-pixel centres.
    ///
    /// Source coordinates are clamped to the border, so a uniform frame stays
    /// uniform at any output size.
    pub fn resize(&self, new_width: u32, new_height: u32) -> GrayFrame {
        if self.is_empty() || new_width == 0 || new_height == 0 {
            return GrayFrame {
                data: Vec::new(),
                width: new_width,
                height: new_height,
            };
        }

        let (width, height) = (self.width as usize, self.height as usize);
        let (new_w, new_h) = (new_width as usize, new_height as usize);
        let inv_scale_x = width as f32 / new_w as f32;
        let inv_scale_y = height as f32 / new_h as f32;

        let mut resized = vec![0u8; new_w * new_h];
        for y in 0..new_h {
            let src_y = ((y as f32 + 0.5) * inv_scale_y - 0.5).max(0.0);
            let y0 = (src_y.floor() as usize).min(height - 1);
            let y1 = (y0 + 1).min(height - 1);
            let fy = (src_y - y0 as f32).clamp(0.0, 1.0);

            for x in 0..new_w {
                let src_x = ((x as f32 + 0.5) * inv_scale_x - 0.5).max(0.0);
                let x0 = (src_x.floor() as usize).min(width - 1);
                let x1 = (x0 + 1).min(width - 1);
                let fx = (src_x - x0 as f32).clamp(0.0, 1.0);

                let tl = self.data[y0 * width + x0] as f32;
                let tr = self.data[y0 * width + x1] as f32;
                let bl = self.data[y1 * width + x0] as f32;
                let br = self.data[y1 * width + x1] as f32;

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;

                resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
            }
        }

        GrayFrame {
            data: resized,
            width: new_width,
            height: new_height,
        }
    }
}

/// Convert one RGB pixel to 8-bit luma.
pub fn rgb_to_luma([r, g, b]: [u8; 3]) -> u8 {
    let y = r as u32 * LUMA_R + g as u32 * LUMA_G + b as u32 * LUMA_B + (1 << (LUMA_SHIFT - 1));
    (y >> LUMA_SHIFT) as u8
}
