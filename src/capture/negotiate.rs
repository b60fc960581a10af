//! Camera configuration negotiation: size, frame rate, color format, buffer mode

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::device::{CameraDevice, CameraParameters};
use crate::capture::frame::{ColorFormat, Size, VideoBufferMode, VideoFormat};
use crate::error::{DeviceError, Result, SourceError};

/// Highest frame rate a request may ask for
pub const MAX_FRAME_RATE: u32 = 120;

/// Requested video size and rate; `None` keeps the camera's current setting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
}

impl VideoRequest {
    pub fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            frame_rate: Some(frame_rate),
        }
    }

    fn size(&self) -> Result<Option<Size>> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Ok(Some(Size::new(width, height))),
            (None, None) => Ok(None),
            _ => {
                error!(
                    "Requested video size ({:?}x{:?}) is not supported",
                    self.width, self.height
                );
                Err(SourceError::UnsupportedConfiguration(format!(
                    "only one of width ({:?}) and height ({:?}) given",
                    self.width, self.height
                )))
            }
        }
    }
}

/// What the camera agreed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub size: Size,
    pub frame_rate: u32,
    pub color_format: ColorFormat,
}

impl From<NegotiatedFormat> for VideoFormat {
    fn from(format: NegotiatedFormat) -> Self {
        // Stride and slice height are not reported by the camera
        VideoFormat {
            mime: "video/raw".to_string(),
            color_format: format.color_format,
            width: format.size.width,
            height: format.size.height,
            stride: format.size.width,
            slice_height: format.size.height,
            frame_rate: format.frame_rate,
        }
    }
}

/// Sizes the camera accepts for recording, and whether video size is
/// configured separately from the preview
fn supported_video_sizes(params: &CameraParameters) -> (&[Size], bool) {
    if params.supported_video_sizes.is_empty() {
        (&params.supported_preview_sizes, false)
    } else {
        (&params.supported_video_sizes, true)
    }
}

pub fn parse_color_format(params: &CameraParameters) -> Result<ColorFormat> {
    let raw = params.video_frame_format.as_deref().unwrap_or_default();
    ColorFormat::from_camera_string(raw).ok_or_else(|| {
        error!("Unknown video frame format '{}'", raw);
        SourceError::UnsupportedConfiguration(format!("video frame format '{}'", raw))
    })
}

/// Apply the request to `params` and push it if anything changed
pub fn configure_camera(
    device: &dyn CameraDevice,
    params: &mut CameraParameters,
    request: &VideoRequest,
) -> Result<()> {
    let mut changed = false;

    if let Some(size) = request.size()? {
        let (sizes, separate_video_size) = supported_video_sizes(params);
        if !sizes.contains(&size) {
            error!("Video dimension ({}) is unsupported", size);
            return Err(SourceError::UnsupportedConfiguration(format!(
                "video size {}",
                size
            )));
        }
        if separate_video_size {
            params.video_size = Some(size);
        } else {
            params.preview_size = size;
        }
        changed = true;
    }

    if let Some(rate) = request.frame_rate {
        if rate == 0 || rate > MAX_FRAME_RATE {
            return Err(SourceError::UnsupportedConfiguration(format!(
                "frame rate {} outside 1..={}",
                rate, MAX_FRAME_RATE
            )));
        }
        if !params.supported_preview_frame_rates.contains(&rate) {
            error!(
                "Requested frame rate ({}) is not supported: {:?}",
                rate, params.supported_preview_frame_rates
            );
            return Err(SourceError::UnsupportedConfiguration(format!(
                "frame rate {}",
                rate
            )));
        }
        params.preview_frame_rate = Some(rate);
        changed = true;
    }

    if changed {
        device.push_parameters(params).map_err(|e| {
            error!("Could not change settings. Someone else is using camera?");
            match e {
                DeviceError::Busy(reason) => SourceError::DeviceBusy(reason),
                other => SourceError::DeviceBusy(other.to_string()),
            }
        })?;
    }
    Ok(())
}

/// Read back the size the camera records at and compare with the request
pub fn check_video_size(params: &CameraParameters, request: &VideoRequest) -> Result<Size> {
    let (_, separate_video_size) = supported_video_sizes(params);
    let actual = if separate_video_size {
        params.video_size
    } else {
        Some(params.preview_size)
    };

    let actual = match actual {
        Some(size) if size.width > 0 && size.height > 0 => size,
        other => {
            error!("Failed to retrieve video frame size ({:?})", other);
            return Err(SourceError::ConfigurationMismatch(
                "camera reports no video size".into(),
            ));
        }
    };

    if let Some(requested) = request.size()? {
        if requested != actual {
            error!(
                "Failed to set video frame size to {}. The actual video size is {}",
                requested, actual
            );
            return Err(SourceError::ConfigurationMismatch(format!(
                "requested {}, camera uses {}",
                requested, actual
            )));
        }
    }
    Ok(actual)
}

/// Read back the frame rate and compare with the request
pub fn check_frame_rate(params: &CameraParameters, request: &VideoRequest) -> Result<u32> {
    let actual = match params.preview_frame_rate {
        Some(rate) if rate > 0 => rate,
        other => {
            error!("Failed to retrieve preview frame rate ({:?})", other);
            return Err(SourceError::ConfigurationMismatch(
                "camera reports no frame rate".into(),
            ));
        }
    };

    if let Some(requested) = request.frame_rate {
        if requested != actual {
            error!(
                "Failed to set preview frame rate to {} fps. The actual frame rate is {}",
                requested, actual
            );
            return Err(SourceError::ConfigurationMismatch(format!(
                "requested {} fps, camera uses {}",
                requested, actual
            )));
        }
    }
    Ok(actual)
}

/// Configure the camera for `request` and report what it settled on
#[instrument(skip(device))]
pub fn negotiate(device: &dyn CameraDevice, request: &VideoRequest) -> Result<NegotiatedFormat> {
    let mut params = device.pull_parameters()?;
    let color_format = parse_color_format(&params)?;

    configure_camera(device, &mut params, request)?;

    // Verify against what the camera actually applied
    let applied = device.pull_parameters()?;
    let size = check_video_size(&applied, request)?;
    let frame_rate = check_frame_rate(&applied, request)?;

    info!(
        "Negotiated {} @ {} fps, {:?}",
        size, frame_rate, color_format
    );
    Ok(NegotiatedFormat {
        size,
        frame_rate,
        color_format,
    })
}

/// Pick how frames travel from the camera, preferring the buffer queue when
/// metadata-only buffers were asked for
#[instrument(skip(device))]
pub fn select_buffer_mode(
    device: &dyn CameraDevice,
    store_metadata_only: bool,
) -> Result<VideoBufferMode> {
    if store_metadata_only {
        for mode in [
            VideoBufferMode::BufferQueue,
            VideoBufferMode::DataCallbackMetadata,
        ] {
            match device.set_video_buffer_mode(mode) {
                Ok(()) => {
                    debug!("Using video buffer mode {:?}", mode);
                    return Ok(mode);
                }
                Err(e) => debug!("Video buffer mode {:?} refused: {}", mode, e),
            }
        }
    }

    device
        .set_video_buffer_mode(VideoBufferMode::DataCallbackYuv)
        .map_err(|e| {
            warn!("Setting video buffer mode to DataCallbackYuv failed: {}", e);
            SourceError::Device(e)
        })?;
    Ok(VideoBufferMode::DataCallbackYuv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::SyntheticCamera;

    fn camera() -> SyntheticCamera {
        SyntheticCamera::new(SyntheticCamera::default_parameters())
    }

    #[test]
    fn test_supported_request() {
        let camera = camera();
        let format = negotiate(&camera, &VideoRequest::new(640, 480, 30)).unwrap();
        assert_eq!(format.size, Size::new(640, 480));
        assert_eq!(format.frame_rate, 30);
        assert_eq!(format.color_format, ColorFormat::Yuv420SemiPlanar);
    }

    #[test]
    fn test_unsupported_size() {
        let camera = camera();
        let err = negotiate(&camera, &VideoRequest::new(640, 481, 30)).unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedConfiguration(_)));
        assert_eq!(camera.pushed_parameters(), 0);
    }

    #[test]
    fn test_half_specified_size() {
        let request = VideoRequest {
            width: Some(640),
            height: None,
            frame_rate: None,
        };
        let err = negotiate(&camera(), &request).unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedConfiguration(_)));
    }

    #[test]
    fn test_keep_current() {
        let camera = camera();
        let format = negotiate(&camera, &VideoRequest::default()).unwrap();
        assert_eq!(format.size, Size::new(640, 480));
        assert_eq!(format.frame_rate, 30);
        // Nothing changed, nothing pushed
        assert_eq!(camera.pushed_parameters(), 0);
    }

    #[test]
    fn test_frame_rate_bounds() {
        let camera = camera();
        for rate in [0, 121, 24] {
            let request = VideoRequest {
                frame_rate: Some(rate),
                ..VideoRequest::default()
            };
            assert!(matches!(
                negotiate(&camera, &request),
                Err(SourceError::UnsupportedConfiguration(_))
            ));
        }
        let request = VideoRequest {
            frame_rate: Some(15),
            ..VideoRequest::default()
        };
        assert_eq!(negotiate(&camera, &request).unwrap().frame_rate, 15);
    }

    #[test]
    fn test_busy_device() {
        let camera = camera();
        camera.set_busy(true);
        let err = negotiate(&camera, &VideoRequest::new(640, 480, 30)).unwrap_err();
        assert!(matches!(err, SourceError::DeviceBusy(_)));
    }

    #[test]
    fn test_ignored_push_is_mismatch() {
        let camera = camera();
        camera.set_ignore_pushes(true);
        let err = negotiate(&camera, &VideoRequest::new(320, 240, 30)).unwrap_err();
        assert!(matches!(err, SourceError::ConfigurationMismatch(_)));
    }

    #[test]
    fn test_unknown_color_format() {
        let mut params = SyntheticCamera::default_parameters();
        params.video_frame_format = Some("bayer-rggb".into());
        let camera = SyntheticCamera::new(params);
        assert!(matches!(
            negotiate(&camera, &VideoRequest::default()),
            Err(SourceError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_separate_video_size() {
        let mut params = SyntheticCamera::default_parameters();
        params.supported_video_sizes = vec![Size::new(1280, 720)];
        params.video_size = Some(Size::new(1280, 720));
        let camera = SyntheticCamera::new(params);

        // Preview sizes no longer apply once video sizes are listed
        assert!(negotiate(&camera, &VideoRequest::new(640, 480, 30)).is_err());
        let format = negotiate(&camera, &VideoRequest::new(1280, 720, 30)).unwrap();
        assert_eq!(format.size, Size::new(1280, 720));
    }

    #[test]
    fn test_buffer_mode_fallback() {
        let camera = camera();
        assert_eq!(
            select_buffer_mode(&camera, true).unwrap(),
            VideoBufferMode::BufferQueue
        );

        camera.refuse_mode(VideoBufferMode::BufferQueue);
        assert_eq!(
            select_buffer_mode(&camera, true).unwrap(),
            VideoBufferMode::DataCallbackMetadata
        );

        camera.refuse_mode(VideoBufferMode::DataCallbackMetadata);
        assert_eq!(
            select_buffer_mode(&camera, true).unwrap(),
            VideoBufferMode::DataCallbackYuv
        );

        camera.refuse_mode(VideoBufferMode::DataCallbackYuv);
        assert!(select_buffer_mode(&camera, false).is_err());
    }
}
