pub mod capture;
pub mod convert;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::{DataSpace, PixelFormat};
use serde::{Deserialize, Serialize};

pub use capture::{CameraDevice, CameraSource, ReadOptions, SourceState, StartOptions, VideoBuffer};
pub use convert::{Rotation, RotationConverter};
pub use error::{Result, SourceError};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub rotation: RotationConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Defaults, then the optional TOML file, then `CAMSOURCE__*` variables
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(
                config::Environment::with_prefix("CAMSOURCE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

/// What the recording session asks the camera for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    /// Frames captured before this time are dropped
    pub start_time_us: i64,
    pub stop_time_us: Option<i64>,
    /// Encoder input buffers in buffer-queue mode
    pub buffer_count: usize,
    pub pixel_format: PixelFormat,
    pub data_space: DataSpace,
    pub store_metadata_only: bool,
}

/// Timeouts and pool sizes of the capture pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Added to the frame interval when waiting for frames or returns
    pub read_timeout_ms: u64,
    /// Wait for a free metadata slot before dropping the frame
    pub memory_base_timeout_ms: u64,
    /// Wake-up interval of the buffer queue listener
    pub frame_available_timeout_ms: u64,
    /// Extra queue buffers the consumer may hold
    pub consumer_buffer_reserve: usize,
    /// Metadata slots in handle mode
    pub video_buffer_count: usize,
    /// Minimum gap between frames that counts as a glitch
    pub glitch_threshold_us: i64,
    pub collect_stats: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub enabled: bool,
    pub screen_angle: i32,
    pub camera_mount_angle: i32,
    pub back_camera: bool,
    /// Output buffers; frames are dropped while all are held
    pub pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: Some(640),
            height: Some(480),
            frame_rate: Some(30),
            start_time_us: 0,
            stop_time_us: None,
            buffer_count: 1,
            pixel_format: PixelFormat::ImplementationDefined,
            data_space: DataSpace::Bt709,
            store_metadata_only: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 3000,
            memory_base_timeout_ms: 200,
            frame_available_timeout_ms: 50,
            consumer_buffer_reserve: 8,
            video_buffer_count: 32,
            glitch_threshold_us: 200_000,
            collect_stats: true,
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            screen_angle: 0,
            camera_mount_angle: 90,
            back_camera: true,
            pool_size: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "camsource=debug".to_string(),
        }
    }
}
