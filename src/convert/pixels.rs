//! Source frame layouts and pixel conversion helpers

use image::RgbaImage;

use crate::capture::frame::PixelFormat;
use crate::error::ConvertError;

/// A captured frame to be converted
#[derive(Debug, Clone, Copy)]
pub struct SourceFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Row pitch in pixels, at least `width`
    pub stride: u32,
    pub format: PixelFormat,
}

/// Where each YUV 4:2:0 plane starts and how it is walked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct YuvLayout {
    pub y_offset: usize,
    pub y_stride: usize,
    pub u_offset: usize,
    pub v_offset: usize,
    pub c_stride: usize,
    /// Distance between neighbouring chroma samples of one plane
    pub c_step: usize,
    pub len: usize,
}

fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

impl SourceFrame<'_> {
    fn check_dimensions(&self) -> Result<(), ConvertError> {
        let invalid = ConvertError::InvalidDimensions {
            width: self.width,
            height: self.height,
        };
        if self.width == 0 || self.height == 0 || self.stride < self.width {
            return Err(invalid);
        }
        // 4:2:0 output needs whole chroma blocks
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(invalid);
        }
        Ok(())
    }

    fn check_len(&self, needed: usize) -> Result<(), ConvertError> {
        if self.data.len() < needed {
            return Err(ConvertError::SourceTooSmall {
                needed,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn yuv_layout(&self) -> Result<YuvLayout, ConvertError> {
        self.check_dimensions()?;
        let stride = self.stride as usize;
        let height = self.height as usize;
        let y_size = stride * height;

        let layout = match self.format {
            // Interleaved V/U after the luma plane
            PixelFormat::Nv21 => YuvLayout {
                y_offset: 0,
                y_stride: stride,
                v_offset: y_size,
                u_offset: y_size + 1,
                c_stride: stride,
                c_step: 2,
                len: y_size + stride * height / 2,
            },
            PixelFormat::Nv12 => YuvLayout {
                y_offset: 0,
                y_stride: stride,
                u_offset: y_size,
                v_offset: y_size + 1,
                c_stride: stride,
                c_step: 2,
                len: y_size + stride * height / 2,
            },
            // Cr plane then Cb plane, chroma rows aligned to 16 bytes
            PixelFormat::Yv12 => {
                let c_stride = align(stride / 2, 16);
                let c_size = c_stride * height / 2;
                YuvLayout {
                    y_offset: 0,
                    y_stride: stride,
                    v_offset: y_size,
                    u_offset: y_size + c_size,
                    c_stride,
                    c_step: 1,
                    len: y_size + 2 * c_size,
                }
            }
            other => return Err(ConvertError::UnsupportedFormat(format!("{:?}", other))),
        };
        self.check_len(layout.len)?;
        Ok(layout)
    }

    /// Copy an RGBA8888 frame into a tightly packed image
    pub(crate) fn to_rgba_image(&self) -> Result<RgbaImage, ConvertError> {
        if self.format != PixelFormat::Rgba8888 {
            return Err(ConvertError::UnsupportedFormat(format!("{:?}", self.format)));
        }
        self.check_dimensions()?;
        let row_bytes = self.width as usize * 4;
        let pitch = self.stride as usize * 4;
        let height = self.height as usize;
        self.check_len(pitch * (height - 1) + row_bytes)?;

        let mut packed = Vec::with_capacity(row_bytes * height);
        for row in self.data.chunks(pitch).take(height) {
            packed.extend_from_slice(&row[..row_bytes]);
        }
        RgbaImage::from_raw(self.width, self.height, packed).ok_or(
            ConvertError::InvalidDimensions {
                width: self.width,
                height: self.height,
            },
        )
    }
}

/// Bytes needed for a tightly packed I420 frame
pub fn i420_len(width: u32, height: u32) -> usize {
    let (width, height) = (width as usize, height as usize);
    width * height + 2 * (width / 2) * (height / 2)
}

#[inline]
fn rgb_to_y(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

#[inline]
fn rgb_to_u(r: i32, g: i32, b: i32) -> u8 {
    (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8
}

#[inline]
fn rgb_to_v(r: i32, g: i32, b: i32) -> u8 {
    (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8
}

/// BT.601 limited-range RGBA to I420, chroma averaged over 2x2 blocks
pub(crate) fn rgba_to_i420(image: &RgbaImage, y: &mut [u8], u: &mut [u8], v: &mut [u8]) {
    let (width, height) = (image.width(), image.height());
    for (px, py, pixel) in image.enumerate_pixels() {
        let [r, g, b, _] = pixel.0;
        y[(py * width + px) as usize] = rgb_to_y(i32::from(r), i32::from(g), i32::from(b));
    }

    let c_width = width / 2;
    for cy in 0..height / 2 {
        for cx in 0..c_width {
            let (mut r, mut g, mut b) = (0i32, 0i32, 0i32);
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let [pr, pg, pb, _] = image.get_pixel(cx * 2 + dx, cy * 2 + dy).0;
                r += i32::from(pr);
                g += i32::from(pg);
                b += i32::from(pb);
            }
            let (r, g, b) = (r / 4, g / 4, b / 4);
            let index = (cy * c_width + cx) as usize;
            u[index] = rgb_to_u(r, g, b);
            v[index] = rgb_to_v(r, g, b);
        }
    }
}
