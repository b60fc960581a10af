pub mod device;
pub mod frame;
pub mod gate;
pub mod negotiate;
pub mod pending;
pub mod source;
pub mod synthetic;

pub use device::{CameraDevice, CameraParameters, DeviceFrame, FrameListener, NativeHandle};
pub use frame::{
    decode_metadata, ColorFormat, DataSpace, MetadataBufferType, PayloadId, PixelFormat, Size,
    VideoBuffer, VideoBufferMode, VideoFormat, VideoMetadata,
};
pub use gate::{DropReason, FrameSkipPolicy, FrameTimingGate, GateDecision, TimeLapsePolicy};
pub use negotiate::{NegotiatedFormat, VideoRequest};
pub use pending::Statistics;
pub use source::{
    CameraSource, DirectBufferListener, ReadOptions, SourceState, StartOptions,
};
pub use synthetic::{DeviceCall, SyntheticCamera};
