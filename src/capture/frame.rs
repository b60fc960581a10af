//! Frame, format and buffer types shared by the capture path

use std::fmt;
use std::sync::Weak;

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::capture::device::{DeviceFrame, NativeHandle};
use crate::pipeline::buffer_queue::{GraphicBuffer, NativeBufferId};
use crate::pipeline::pool::FrameSlot;

/// Bytes reserved per metadata slot: type tag, native id, fence fd.
pub const METADATA_SLOT_SIZE: usize = 16;

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Buffer pixel formats understood by the buffer queue and the rotation path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba8888,
    /// YCrCb 4:2:0 semi-planar (NV21)
    Nv21,
    /// YCbCr 4:2:0 semi-planar (NV12)
    Nv12,
    /// Y plane followed by Cr then Cb planes
    Yv12,
    /// Chosen by the device, opaque to software
    ImplementationDefined,
}

impl PixelFormat {
    pub fn is_yuv(self) -> bool {
        matches!(self, PixelFormat::Nv21 | PixelFormat::Nv12 | PixelFormat::Yv12)
    }
}

/// Color formats a camera can advertise for its video frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorFormat {
    Yuv420Planar,
    Yuv422SemiPlanar,
    Yuv420SemiPlanar,
    YCbYCr,
    Rgb565,
    TiYuv420PackedSemiPlanar,
    AndroidOpaque,
}

impl ColorFormat {
    /// Map a camera parameter string onto a color format
    pub fn from_camera_string(value: &str) -> Option<Self> {
        match value {
            "yuv420p" => Some(ColorFormat::Yuv420Planar),
            "yuv422sp" => Some(ColorFormat::Yuv422SemiPlanar),
            "yuv420sp" => Some(ColorFormat::Yuv420SemiPlanar),
            "yuv422i-yuyv" => Some(ColorFormat::YCbYCr),
            "rgb565" => Some(ColorFormat::Rgb565),
            "OMX_TI_COLOR_FormatYUV420PackedSemiPlanar" => {
                Some(ColorFormat::TiYuv420PackedSemiPlanar)
            }
            "android-opaque" => Some(ColorFormat::AndroidOpaque),
            _ => None,
        }
    }
}

/// Color space hint passed to the buffer queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataSpace {
    Unknown,
    Bt601,
    #[default]
    Bt709,
}

/// How the camera hands recording frames to the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoBufferMode {
    /// Real YUV data lent through the data callback
    DataCallbackYuv,
    /// Native handles lent through the data callback
    DataCallbackMetadata,
    /// Buffers pushed into a producer/consumer queue
    BufferQueue,
}

/// What a consumer finds inside the buffers returned by `read`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBufferType {
    Invalid = -1,
    AnwBuffer = 2,
    NativeHandleSource = 3,
}

impl From<VideoBufferMode> for MetadataBufferType {
    fn from(mode: VideoBufferMode) -> Self {
        match mode {
            VideoBufferMode::DataCallbackYuv => MetadataBufferType::Invalid,
            VideoBufferMode::DataCallbackMetadata => MetadataBufferType::NativeHandleSource,
            VideoBufferMode::BufferQueue => MetadataBufferType::AnwBuffer,
        }
    }
}

/// Decoded contents of a metadata slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoMetadata {
    NativeHandle { handle_id: u64 },
    AnwBuffer { buffer_id: u64, fence_fd: i32 },
}

pub(crate) fn encode_handle_metadata(slot: &mut [u8], handle_id: u64) {
    let mut out = &mut slot[..METADATA_SLOT_SIZE];
    out.put_i32_le(MetadataBufferType::NativeHandleSource as i32);
    out.put_u64_le(handle_id);
    out.put_i32_le(-1);
}

pub(crate) fn encode_anw_metadata(slot: &mut [u8], buffer_id: u64) {
    let mut out = &mut slot[..METADATA_SLOT_SIZE];
    out.put_i32_le(MetadataBufferType::AnwBuffer as i32);
    out.put_u64_le(buffer_id);
    // No acquire fence: buffers are handed over already signalled
    out.put_i32_le(-1);
}

/// Decode a metadata payload produced in the metadata or buffer-queue modes
pub fn decode_metadata(data: &[u8]) -> Option<VideoMetadata> {
    if data.len() < METADATA_SLOT_SIZE {
        return None;
    }
    let mut input = data;
    let tag = input.get_i32_le();
    let id = input.get_u64_le();
    let fence_fd = input.get_i32_le();
    match tag {
        t if t == MetadataBufferType::NativeHandleSource as i32 => {
            Some(VideoMetadata::NativeHandle { handle_id: id })
        }
        t if t == MetadataBufferType::AnwBuffer as i32 => Some(VideoMetadata::AnwBuffer {
            buffer_id: id,
            fence_fd,
        }),
        _ => None,
    }
}

/// Identity of a payload handed to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadId {
    /// Memory lent by the device
    Device(u64),
    /// A slot of one of the source's metadata heaps
    Slot { heap: u32, index: u32 },
}

/// A frame payload together with the backing store it came from
pub(crate) enum Payload {
    Device(DeviceFrame),
    Handle {
        slot: FrameSlot,
        handle: NativeHandle,
    },
    Queue {
        slot: FrameSlot,
        buffer: NativeBufferId,
        timestamp_ns: i64,
    },
}

impl Payload {
    pub(crate) fn id(&self) -> PayloadId {
        match self {
            Payload::Device(frame) => PayloadId::Device(frame.id),
            Payload::Handle { slot, .. } | Payload::Queue { slot, .. } => PayloadId::Slot {
                heap: slot.heap_id(),
                index: slot.index(),
            },
        }
    }

    /// Bytes the consumer sees for this payload
    pub(crate) fn contents(&self) -> Bytes {
        match self {
            Payload::Device(frame) => frame.data.clone(),
            Payload::Handle { slot, .. } | Payload::Queue { slot, .. } => {
                Bytes::copy_from_slice(&slot.as_slice()[..METADATA_SLOT_SIZE])
            }
        }
    }
}

/// Receives buffers the consumer hands back
pub(crate) trait BufferObserver: Send + Sync {
    fn buffer_returned(&self, id: PayloadId);
}

/// A captured frame handed out by `read`.
///
/// Dropping the buffer returns it to the source; `signal_buffer_returned`
/// does the same explicitly.
pub struct VideoBuffer {
    id: PayloadId,
    data: Bytes,
    capture_time_us: i64,
    presentation_time_us: i64,
    graphic_buffer: Option<GraphicBuffer>,
    observer: Option<Weak<dyn BufferObserver>>,
}

impl VideoBuffer {
    pub(crate) fn new(
        id: PayloadId,
        data: Bytes,
        capture_time_us: i64,
        presentation_time_us: i64,
        graphic_buffer: Option<GraphicBuffer>,
        observer: Weak<dyn BufferObserver>,
    ) -> Self {
        Self {
            id,
            data,
            capture_time_us,
            presentation_time_us,
            graphic_buffer,
            observer: Some(observer),
        }
    }

    pub fn id(&self) -> PayloadId {
        self.id
    }

    /// Pixel data, or encoded metadata in the metadata and buffer-queue modes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Device clock timestamp of the capture
    pub fn capture_time_us(&self) -> i64 {
        self.capture_time_us
    }

    /// Recording clock timestamp
    pub fn presentation_time_us(&self) -> i64 {
        self.presentation_time_us
    }

    /// The queue buffer holding the pixels, in buffer-queue mode
    pub fn graphic_buffer(&self) -> Option<&GraphicBuffer> {
        self.graphic_buffer.as_ref()
    }

    /// Stop this buffer from notifying its source on drop
    pub(crate) fn disarm(&mut self) -> Option<Weak<dyn BufferObserver>> {
        self.observer.take()
    }
}

impl fmt::Debug for VideoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoBuffer")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .field("capture_time_us", &self.capture_time_us)
            .field("presentation_time_us", &self.presentation_time_us)
            .finish()
    }
}

impl Drop for VideoBuffer {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.take().and_then(|weak| weak.upgrade()) {
            observer.buffer_returned(self.id);
        }
    }
}

/// Format of the frames a started source produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub mime: String,
    pub color_format: ColorFormat,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub slice_height: u32,
    pub frame_rate: u32,
}
