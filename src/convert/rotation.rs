//! Rotate captured frames into upright I420 buffers

use std::fmt;
use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::capture::frame::PixelFormat;
use crate::convert::pixels::{i420_len, rgba_to_i420, SourceFrame};
use crate::error::ConvertError;
use crate::pipeline::pool::{FrameBufferPool, FrameSlot};
use crate::RotationConfig;

/// Clockwise rotation applied to a frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Result<Self, ConvertError> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(ConvertError::InvalidRotation(other)),
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Whether width and height trade places
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    /// Output dimensions for a `width` x `height` input
    pub fn output_size(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// Rotation needed to show a camera image upright on the current screen.
///
/// A back camera image is counter-rotated by the screen angle; a front
/// camera is mirrored by the sensor so the screen angle adds.
pub fn rotate_amount(
    screen_angle: i32,
    camera_mount_angle: i32,
    back_camera: bool,
) -> Result<Rotation, ConvertError> {
    let degrees = if back_camera {
        (camera_mount_angle - screen_angle).rem_euclid(360)
    } else {
        (camera_mount_angle + screen_angle).rem_euclid(360)
    };
    Rotation::from_degrees(degrees)
}

/// Copy one plane into `dst` rotated clockwise.
///
/// `src_step` is the byte distance between horizontally adjacent samples,
/// 2 for one half of an interleaved chroma plane.
#[allow(clippy::too_many_arguments)]
pub(crate) fn rotate_plane(
    src: &[u8],
    src_stride: usize,
    src_step: usize,
    width: usize,
    height: usize,
    dst: &mut [u8],
    dst_stride: usize,
    rotation: Rotation,
) {
    for y in 0..height {
        let row = &src[y * src_stride..];
        for x in 0..width {
            let (dx, dy) = match rotation {
                Rotation::Deg0 => (x, y),
                Rotation::Deg90 => (height - 1 - y, x),
                Rotation::Deg180 => (width - 1 - x, height - 1 - y),
                Rotation::Deg270 => (y, width - 1 - x),
            };
            dst[dy * dst_stride + dx] = row[x * src_step];
        }
    }
}

/// Tightly packed I420 frame backed by a converter pool slot.
///
/// The slot goes back to its pool when the frame is dropped.
pub struct I420Frame {
    slot: Option<FrameSlot>,
    pool: Arc<FrameBufferPool>,
    width: u32,
    height: u32,
}

impl I420Frame {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn chroma_len(&self) -> usize {
        (self.width as usize / 2) * (self.height as usize / 2)
    }

    /// All three planes, Y then U then V
    pub fn data(&self) -> &[u8] {
        match &self.slot {
            Some(slot) => &slot.as_slice()[..i420_len(self.width, self.height)],
            None => &[],
        }
    }

    pub fn y(&self) -> &[u8] {
        &self.data()[..self.luma_len()]
    }

    pub fn u(&self) -> &[u8] {
        let start = self.luma_len();
        &self.data()[start..start + self.chroma_len()]
    }

    pub fn v(&self) -> &[u8] {
        let start = self.luma_len() + self.chroma_len();
        &self.data()[start..start + self.chroma_len()]
    }

    fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let (luma, chroma) = (self.luma_len(), self.chroma_len());
        let data: &mut [u8] = match self.slot.as_mut() {
            Some(slot) => &mut slot.as_mut_slice()[..luma + 2 * chroma],
            None => &mut [],
        };
        let luma = luma.min(data.len());
        let (y, rest) = data.split_at_mut(luma);
        let chroma = chroma.min(rest.len());
        let (u, v) = rest.split_at_mut(chroma);
        (y, u, v)
    }
}

impl fmt::Debug for I420Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I420Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("heap_id", &self.pool.heap_id())
            .finish()
    }
}

impl Drop for I420Frame {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Err(e) = self.pool.release(slot) {
                debug!("Failed to return rotated frame: {}", e);
            }
        }
    }
}

/// Converts frames to upright BT.601 I420 using a small output pool
pub struct RotationConverter {
    rotation: Rotation,
    pool_size: usize,
    /// Output pool and the dimensions it was sized for
    pool: Option<((u32, u32), Arc<FrameBufferPool>)>,
}

impl RotationConverter {
    pub fn new(rotation: Rotation, pool_size: usize) -> Self {
        Self {
            rotation,
            pool_size: pool_size.max(1),
            pool: None,
        }
    }

    pub fn from_config(config: &RotationConfig) -> Result<Self, ConvertError> {
        let rotation = rotate_amount(
            config.screen_angle,
            config.camera_mount_angle,
            config.back_camera,
        )?;
        debug!(
            "Rotation {} (screen {}, mount {}, back {})",
            rotation, config.screen_angle, config.camera_mount_angle, config.back_camera
        );
        Ok(Self::new(rotation, config.pool_size))
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn set_rotation(&mut self, rotation: Rotation) {
        self.rotation = rotation;
    }

    fn pool_for(&mut self, width: u32, height: u32) -> Result<Arc<FrameBufferPool>, ConvertError> {
        if let Some((size, pool)) = &self.pool {
            if *size == (width, height) {
                return Ok(Arc::clone(pool));
            }
        }
        let pool = Arc::new(FrameBufferPool::new(
            i420_len(width, height),
            self.pool_size,
        )?);
        debug!(
            "Rotation output pool rebuilt for {}x{} ({} buffers)",
            width, height, self.pool_size
        );
        self.pool = Some(((width, height), Arc::clone(&pool)));
        Ok(pool)
    }

    /// Rotate `frame` into a fresh I420 buffer.
    ///
    /// Returns `Ok(None)` when every output buffer is still held by the
    /// consumer; that frame is dropped.
    pub fn convert(&mut self, frame: &SourceFrame<'_>) -> Result<Option<I420Frame>, ConvertError> {
        // Validate before touching the pool
        match frame.format {
            PixelFormat::Nv21 | PixelFormat::Nv12 | PixelFormat::Yv12 => {
                frame.yuv_layout()?;
            }
            PixelFormat::Rgba8888 => {}
            other => return Err(ConvertError::UnsupportedFormat(format!("{:?}", other))),
        }

        let (width, height) = self.rotation.output_size(frame.width, frame.height);
        let pool = self.pool_for(width, height)?;
        let Some(slot) = pool.acquire() else {
            counter!("camsource.rotation_dropped").increment(1);
            trace!("No rotation buffer available, dropping frame");
            return Ok(None);
        };
        let mut output = I420Frame {
            slot: Some(slot),
            pool,
            width,
            height,
        };

        if frame.format.is_yuv() {
            self.rotate_yuv(frame, &mut output)?;
        } else {
            self.rotate_rgba(frame, &mut output)?;
        }
        Ok(Some(output))
    }

    fn rotate_yuv(&self, frame: &SourceFrame<'_>, output: &mut I420Frame) -> Result<(), ConvertError> {
        let layout = frame.yuv_layout()?;
        let (width, height) = (frame.width as usize, frame.height as usize);
        let (y_stride, c_stride) = (output.width as usize, output.width as usize / 2);
        let rotation = self.rotation;
        let (dst_y, dst_u, dst_v) = output.planes_mut();

        rotate_plane(
            &frame.data[layout.y_offset..],
            layout.y_stride,
            1,
            width,
            height,
            dst_y,
            y_stride,
            rotation,
        );
        rotate_plane(
            &frame.data[layout.u_offset..],
            layout.c_stride,
            layout.c_step,
            width / 2,
            height / 2,
            dst_u,
            c_stride,
            rotation,
        );
        rotate_plane(
            &frame.data[layout.v_offset..],
            layout.c_stride,
            layout.c_step,
            width / 2,
            height / 2,
            dst_v,
            c_stride,
            rotation,
        );
        Ok(())
    }

    fn rotate_rgba(&self, frame: &SourceFrame<'_>, output: &mut I420Frame) -> Result<(), ConvertError> {
        let image = frame.to_rgba_image()?;
        let image = match self.rotation {
            Rotation::Deg0 => image,
            Rotation::Deg90 => image::imageops::rotate90(&image),
            Rotation::Deg180 => image::imageops::rotate180(&image),
            Rotation::Deg270 => image::imageops::rotate270(&image),
        };
        let (y, u, v) = output.planes_mut();
        rgba_to_i420(&image, y, u, v);
        Ok(())
    }
}

impl fmt::Debug for RotationConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationConverter")
            .field("rotation", &self.rotation)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}
