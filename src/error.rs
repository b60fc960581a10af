//! Error types for the capture source and its collaborators.

use thiserror::Error;

use crate::capture::frame::PayloadId;

/// Convenience alias for results using the capture source error type.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Errors reported by a camera device implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device is busy: {0}")]
    Busy(String),

    #[error("Operation not supported by device: {0}")]
    NotSupported(String),

    #[error("Device streaming failed: {0}")]
    Stream(String),
}

/// Errors from a [`FrameBufferPool`](crate::pipeline::FrameBufferPool).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Failed to allocate {slot_count} slots of {slot_size} bytes")]
    Allocation { slot_size: usize, slot_count: usize },

    #[error("Slot belongs to heap {got}, expected heap {expected}")]
    HeapMismatch { got: u32, expected: u32 },

    #[error("Slot {0} released into a pool that is already full")]
    Overflow(u32),
}

/// Errors from the buffer queue bridge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Buffer queue already exists")]
    AlreadyExists,

    #[error("Buffer queue is not initialized")]
    NotInitialized,

    #[error("Buffer queue listener is already running")]
    AlreadyRunning,

    #[error("Buffer queue was abandoned")]
    Abandoned,

    #[error("Buffer {0} is not dequeued by the producer")]
    NotDequeued(u64),

    #[error("Failed to spawn listener thread: {0}")]
    Spawn(String),
}

/// Errors from the rotation converter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Unsupported source format for rotation: {0}")]
    UnsupportedFormat(String),

    #[error("Source buffer too small: need {needed} bytes, got {actual}")]
    SourceTooSmall { needed: usize, actual: usize },

    #[error("Invalid rotation angle: {0}")]
    InvalidRotation(i32),

    #[error("Invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Output pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Errors surfaced by [`CameraSource`](crate::capture::CameraSource) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Camera source already started")]
    AlreadyStarted,

    #[error("Camera source is not initialized")]
    NotInitialized,

    #[error("Could not change camera settings, someone else is using the camera: {0}")]
    DeviceBusy(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Camera did not apply the requested configuration: {0}")]
    ConfigurationMismatch(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} already exists")]
    AlreadyExists(&'static str),

    #[error("Returned buffer {0:?} is not being encoded")]
    UnknownBuffer(PayloadId),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Buffer queue error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Conversion error: {0}")]
    Convert(#[from] ConvertError),
}
