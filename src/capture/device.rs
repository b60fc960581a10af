//! Camera device seam: what the capture source needs from the hardware

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::frame::{Size, VideoBufferMode};
use crate::error::DeviceError;
use crate::pipeline::buffer_queue::BufferQueueProducer;

/// Frame memory lent by the device through the data callback
#[derive(Clone)]
pub struct DeviceFrame {
    pub id: u64,
    pub data: Bytes,
}

impl fmt::Debug for DeviceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFrame")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Opaque native handle lent by the device in metadata mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle {
    pub id: u64,
}

/// Device configuration as read from and written to the camera
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraParameters {
    pub preview_size: Size,
    /// `None` when the camera records at the preview size
    pub video_size: Option<Size>,
    pub supported_preview_sizes: Vec<Size>,
    /// Empty when video size cannot be set separately from preview size
    pub supported_video_sizes: Vec<Size>,
    pub preview_frame_rate: Option<u32>,
    pub supported_preview_frame_rates: Vec<u32>,
    pub video_frame_format: Option<String>,
}

/// Receives recording frames from a device
pub trait FrameListener: Send + Sync {
    /// A frame in [`VideoBufferMode::DataCallbackYuv`]
    fn on_frame_data(&self, timestamp_us: i64, frame: DeviceFrame);

    /// A frame in [`VideoBufferMode::DataCallbackMetadata`]
    fn on_frame_handle(&self, timestamp_us: i64, handle: NativeHandle);
}

/// A camera the capture source can drive.
///
/// The device is shared with the rest of the system; the source only
/// registers itself as listener while a session is running. Once
/// `stop_recording` returns no listener callback may still be in progress.
pub trait CameraDevice: Send + Sync {
    fn pull_parameters(&self) -> Result<CameraParameters, DeviceError>;

    fn push_parameters(&self, params: &CameraParameters) -> Result<(), DeviceError>;

    fn set_listener(&self, listener: Option<Arc<dyn FrameListener>>);

    fn set_video_buffer_mode(&self, mode: VideoBufferMode) -> Result<(), DeviceError>;

    /// Producer end of the queue the device pushes into in buffer-queue mode
    fn set_video_target(&self, producer: BufferQueueProducer) -> Result<(), DeviceError>;

    fn start_recording(&self) -> Result<(), DeviceError>;

    fn stop_recording(&self);

    fn release_recording_frame(&self, frame: DeviceFrame);

    fn release_recording_frame_handle(&self, handle: NativeHandle);

    /// Ask the preview path to throttle while the consumer falls behind
    fn on_rate_limit_preview(&self, _limit: bool) {}

    fn clear_calling_identity(&self) -> i64 {
        0
    }

    fn restore_calling_identity(&self, _token: i64) {}
}

/// Clears the caller identity for the duration of a release call
pub(crate) struct CallingIdentityGuard<'a> {
    device: &'a dyn CameraDevice,
    token: i64,
}

impl<'a> CallingIdentityGuard<'a> {
    pub fn new(device: &'a dyn CameraDevice) -> Self {
        let token = device.clear_calling_identity();
        Self { device, token }
    }
}

impl Drop for CallingIdentityGuard<'_> {
    fn drop(&mut self) {
        self.device.restore_calling_identity(self.token);
    }
}
