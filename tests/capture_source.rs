use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use camsource::capture::frame::{decode_metadata, ColorFormat, MetadataBufferType, VideoMetadata};
use camsource::capture::{
    CameraParameters, DeviceCall, DirectBufferListener, Size, SyntheticCamera, TimeLapsePolicy,
    VideoBufferMode, VideoRequest,
};
use camsource::{
    CameraSource, PipelineConfig, ReadOptions, SourceError, SourceState, StartOptions, VideoBuffer,
};

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        read_timeout_ms: 200,
        memory_base_timeout_ms: 20,
        frame_available_timeout_ms: 10,
        ..PipelineConfig::default()
    }
}

/// A device supporting exactly 640x480 at 15 or 30 fps
fn camera_params() -> CameraParameters {
    CameraParameters {
        supported_preview_sizes: vec![Size::new(640, 480)],
        ..SyntheticCamera::default_parameters()
    }
}

fn setup() -> (Arc<SyntheticCamera>, CameraSource) {
    let camera = Arc::new(SyntheticCamera::new(camera_params()));
    let source = CameraSource::new(camera.clone(), pipeline_config());
    (camera, source)
}

fn options(width: u32, height: u32, frame_rate: u32) -> StartOptions {
    StartOptions {
        request: VideoRequest::new(width, height, frame_rate),
        ..StartOptions::default()
    }
}

fn frame() -> Bytes {
    Bytes::from_static(b"frame")
}

fn read(source: &CameraSource) -> Option<VideoBuffer> {
    source.read(&ReadOptions::default()).unwrap()
}

#[test]
fn test_start_negotiates_format() {
    let (camera, source) = setup();
    source.start(&options(640, 480, 30)).unwrap();
    assert_eq!(source.state(), SourceState::Started);
    assert!(camera.is_recording());

    let format = source.get_format().unwrap();
    assert_eq!((format.width, format.height), (640, 480));
    assert_eq!(format.frame_rate, 30);
    assert_eq!(format.color_format, ColorFormat::Yuv420SemiPlanar);
    assert_eq!(source.metadata_buffer_type(), MetadataBufferType::Invalid);

    source.stop().unwrap();
    assert_eq!(source.state(), SourceState::Stopped);
    assert!(!camera.is_recording());
    assert!(!camera.has_listener());
}

#[test]
fn test_unsupported_size_leaves_released() {
    let (camera, source) = setup();
    let err = source.start(&options(640, 481, 30)).unwrap_err();
    assert!(matches!(err, SourceError::UnsupportedConfiguration(_)));
    assert_eq!(source.state(), SourceState::Released);
    assert!(!camera.is_recording());
    assert_eq!(
        source.read(&ReadOptions::default()).unwrap_err(),
        SourceError::NotInitialized
    );
}

#[test]
fn test_busy_device() {
    let (camera, source) = setup();
    camera.set_busy(true);
    let err = source.start(&options(640, 480, 15)).unwrap_err();
    assert!(matches!(err, SourceError::DeviceBusy(_)));
    assert_eq!(source.state(), SourceState::Released);
}

#[test]
fn test_failed_start_releases_listener() {
    let (camera, source) = setup();
    camera.set_fail_start(true);
    let err = source.start(&options(640, 480, 30)).unwrap_err();
    assert!(matches!(err, SourceError::Device(_)));
    assert_eq!(source.state(), SourceState::Released);
    assert!(!camera.has_listener());
    assert!(source.get_format().is_err());
}

#[test]
fn test_lifecycle_errors() {
    let (_camera, source) = setup();
    assert_eq!(
        source.read(&ReadOptions::default()).unwrap_err(),
        SourceError::NotInitialized
    );
    // Stop before start is a no-op
    source.stop().unwrap();

    source.start(&options(640, 480, 30)).unwrap();
    assert_eq!(
        source.start(&options(640, 480, 30)).unwrap_err(),
        SourceError::AlreadyStarted
    );
    let seek = ReadOptions {
        seek_to_us: Some(1000),
        ..ReadOptions::default()
    };
    assert!(matches!(
        source.read(&seek),
        Err(SourceError::Unsupported(_))
    ));
    assert!(matches!(
        source.set_stop_time_us(Some(-1)),
        Err(SourceError::InvalidArgument(_))
    ));

    source.stop().unwrap();
    source.stop().unwrap();
    assert_eq!(source.state(), SourceState::Stopped);
    assert!(read(&source).is_none());

    source.reset().unwrap();
    assert_eq!(source.state(), SourceState::Released);
    assert_eq!(
        source.read(&ReadOptions::default()).unwrap_err(),
        SourceError::NotInitialized
    );
}

#[test]
fn test_frames_read_in_order() {
    let (camera, source) = setup();
    source.start(&options(640, 480, 30)).unwrap();

    for ts in [1000, 2000, 3000] {
        assert!(camera.emit_frame(ts, frame()));
    }
    assert_eq!(source.queued_frames(), 3);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let buffer = read(&source).unwrap();
        assert_eq!(buffer.data(), &frame());
        seen.push((buffer.capture_time_us(), buffer.presentation_time_us()));
        source.signal_buffer_returned(buffer).unwrap();
    }
    assert_eq!(seen, vec![(1000, 0), (2000, 1000), (3000, 2000)]);

    source.stop().unwrap();
    let stats = source.stats();
    assert_eq!((stats.received, stats.encoded, stats.dropped), (3, 3, 0));
    assert!(stats.is_balanced());
    assert_eq!(camera.outstanding(), 0);
    assert_eq!(camera.unknown_releases(), 0);
}

#[test]
fn test_gate_drops_backward_timestamps() {
    let (camera, source) = setup();
    source.start(&options(640, 480, 30)).unwrap();

    for ts in [100, 100, 150, 140, 300] {
        assert!(camera.emit_frame(ts, frame()));
    }
    let mut accepted = Vec::new();
    while source.queued_frames() > 0 {
        let buffer = read(&source).unwrap();
        accepted.push(buffer.capture_time_us());
    }
    assert_eq!(accepted, vec![100, 150, 300]);

    source.stop().unwrap();
    let stats = source.stats();
    assert_eq!((stats.received, stats.encoded, stats.dropped), (5, 3, 2));
    assert_eq!(camera.outstanding(), 0);
}

#[test]
fn test_stop_time_ends_stream() {
    let (camera, source) = setup();
    source.set_stop_time_us(Some(500)).unwrap();
    source.start(&options(640, 480, 30)).unwrap();

    assert!(camera.emit_frame(100, frame()));
    assert!(camera.emit_frame(600, frame()));

    let buffer = read(&source).unwrap();
    assert_eq!(buffer.capture_time_us(), 100);
    assert!(read(&source).is_none());
    assert!(read(&source).is_none());
    drop(buffer);

    source.stop().unwrap();
    let stats = source.stats();
    assert_eq!((stats.received, stats.encoded, stats.dropped), (2, 1, 1));
    assert_eq!(camera.outstanding(), 0);
}

#[test]
fn test_stop_wakes_blocked_reader() {
    let (_camera, source) = setup();
    let source = Arc::new(source);
    source.start(&options(640, 480, 30)).unwrap();

    let reader = {
        let source = Arc::clone(&source);
        thread::spawn(move || source.read(&ReadOptions::default()).map(|b| b.is_none()))
    };
    thread::sleep(Duration::from_millis(50));
    source.stop().unwrap();
    assert_eq!(reader.join().unwrap(), Ok(true));
}

#[test]
fn test_stop_waits_for_outstanding_frames() {
    let (camera, source) = setup();
    let source = Arc::new(source);
    source.start(&options(640, 480, 30)).unwrap();

    for ts in [1000, 2000, 3000] {
        assert!(camera.emit_frame(ts, frame()));
    }
    let held = read(&source).unwrap();
    assert_eq!(source.frames_being_encoded(), 1);

    let stopper = {
        let source = Arc::clone(&source);
        thread::spawn(move || source.stop())
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!stopper.is_finished());
    // Queued frames went back before the wait
    assert_eq!(source.queued_frames(), 0);
    assert!(camera.is_recording());

    drop(held);
    stopper.join().unwrap().unwrap();
    assert!(!camera.is_recording());

    let stats = source.stats();
    assert_eq!((stats.received, stats.encoded, stats.dropped), (3, 1, 2));
    assert_eq!(camera.outstanding(), 0);

    // Every frame went back to the device before it stopped streaming
    let calls = camera.calls();
    let stop_at = calls
        .iter()
        .position(|c| *c == DeviceCall::StopRecording)
        .unwrap();
    let last_release = calls
        .iter()
        .rposition(|c| matches!(c, DeviceCall::ReleaseFrame(_)))
        .unwrap();
    assert!(last_release < stop_at);
}

#[test]
fn test_rate_limit_follows_backlog() {
    let (camera, source) = setup();
    source.start(&options(640, 480, 30)).unwrap();

    assert!(camera.emit_frame(1000, frame()));
    assert!(!camera.rate_limited());
    assert!(camera.emit_frame(2000, frame()));
    assert!(camera.rate_limited());

    drop(read(&source));
    drop(read(&source));
    assert!(camera.emit_frame(3000, frame()));
    assert!(!camera.rate_limited());

    assert!(camera.emit_frame(4000, frame()));
    assert!(camera.rate_limited());
    source.stop().unwrap();
    assert!(!camera.rate_limited());
}

#[test]
fn test_restart_after_stop() {
    let (camera, source) = setup();
    source.start(&options(640, 480, 30)).unwrap();
    assert!(camera.emit_frame(1000, frame()));
    source.stop().unwrap();
    assert_eq!(source.stats().dropped, 1);

    source.start(&options(640, 480, 15)).unwrap();
    assert_eq!(source.get_format().unwrap().frame_rate, 15);
    assert!(camera.emit_frame(5000, frame()));
    let buffer = read(&source).unwrap();
    assert_eq!(buffer.presentation_time_us(), 0);
    drop(buffer);
    source.stop().unwrap();

    let stats = source.stats();
    assert_eq!((stats.received, stats.encoded, stats.dropped), (1, 1, 0));
}

#[test]
fn test_frames_after_stop_go_back_to_device() {
    let (camera, source) = setup();
    source.start(&options(640, 480, 30)).unwrap();
    source.stop().unwrap();
    // Listener is detached, the camera refuses to deliver
    assert!(!camera.emit_frame(1000, frame()));
    assert_eq!(camera.outstanding(), 0);
}

#[test]
fn test_metadata_mode() {
    let (camera, source) = setup();
    camera.refuse_mode(VideoBufferMode::BufferQueue);
    let start = StartOptions {
        store_metadata_only: true,
        ..options(640, 480, 30)
    };
    source.start(&start).unwrap();
    assert_eq!(
        camera.video_buffer_mode(),
        Some(VideoBufferMode::DataCallbackMetadata)
    );
    assert_eq!(
        source.metadata_buffer_type(),
        MetadataBufferType::NativeHandleSource
    );

    assert!(camera.emit_handle(1000));
    assert!(camera.emit_handle(2000));
    let buffer = read(&source).unwrap();
    match decode_metadata(buffer.data()) {
        Some(VideoMetadata::NativeHandle { handle_id }) => assert!(handle_id > 0),
        other => panic!("unexpected metadata {:?}", other),
    }
    source.signal_buffer_returned(buffer).unwrap();

    source.stop().unwrap();
    let stats = source.stats();
    assert_eq!((stats.received, stats.encoded, stats.dropped), (2, 1, 1));
    assert_eq!(camera.outstanding(), 0);
    assert_eq!(camera.unknown_releases(), 0);
}

#[test]
fn test_buffer_queue_mode() {
    let (camera, source) = setup();
    let start = StartOptions {
        store_metadata_only: true,
        buffer_count: 2,
        ..options(640, 480, 30)
    };
    source.start(&start).unwrap();
    assert_eq!(camera.video_buffer_mode(), Some(VideoBufferMode::BufferQueue));
    assert_eq!(source.metadata_buffer_type(), MetadataBufferType::AnwBuffer);
    assert!(camera.calls().contains(&DeviceCall::SetVideoTarget));

    assert!(camera.emit_queue_buffer(1000, frame()));
    let buffer = read(&source).unwrap();
    assert_eq!(buffer.capture_time_us(), 1000);
    let graphic = buffer.graphic_buffer().cloned().unwrap();
    assert_eq!(graphic.data, frame());
    assert_eq!(
        decode_metadata(buffer.data()),
        Some(VideoMetadata::AnwBuffer {
            buffer_id: graphic.id.0,
            fence_fd: -1
        })
    );
    drop(buffer);

    // The returned buffer can be dequeued again
    for ts in [2000, 3000, 4000] {
        assert!(camera.emit_queue_buffer(ts, frame()));
        drop(read(&source).unwrap());
    }

    source.stop().unwrap();
    let stats = source.stats();
    assert_eq!((stats.received, stats.encoded, stats.dropped), (4, 4, 0));
}

struct Collector {
    seen: Mutex<Vec<i64>>,
}

impl DirectBufferListener for Collector {
    fn buffer_available(&self, buffer: VideoBuffer) {
        self.seen.lock().push(buffer.capture_time_us());
    }
}

#[test]
fn test_direct_listener_receives_frames() {
    let (camera, source) = setup();
    let collector = Arc::new(Collector {
        seen: Mutex::new(Vec::new()),
    });
    source.add_direct_buffer_listener(collector.clone()).unwrap();
    assert!(matches!(
        source.add_direct_buffer_listener(collector.clone()),
        Err(SourceError::AlreadyExists(_))
    ));
    source.start(&options(640, 480, 30)).unwrap();

    assert!(camera.emit_frame(1000, frame()));
    assert!(camera.emit_frame(2000, frame()));
    assert_eq!(*collector.seen.lock(), vec![1000, 2000]);
    assert_eq!(source.frames_being_encoded(), 0);

    source.stop().unwrap();
    let stats = source.stats();
    assert_eq!((stats.received, stats.encoded, stats.dropped), (2, 2, 0));
}

#[test]
fn test_time_lapse_policy() {
    let (camera, source) = setup();
    source.set_frame_skip_policy(Some(Box::new(TimeLapsePolicy::new(1000))));
    source.start(&options(640, 480, 30)).unwrap();

    for ts in [1000, 1500, 2000, 2999, 3000] {
        assert!(camera.emit_frame(ts, frame()));
    }
    let mut kept = Vec::new();
    while source.queued_frames() > 0 {
        kept.push(read(&source).unwrap().capture_time_us());
    }
    assert_eq!(kept, vec![1000, 2000, 3000]);
    source.stop().unwrap();
}

#[test]
fn test_generator_streams_until_stop() {
    let camera = Arc::new(SyntheticCamera::new(SyntheticCamera::default_parameters()));
    let source = Arc::new(CameraSource::new(camera.clone(), pipeline_config()));
    source.start(&options(320, 240, 30)).unwrap();
    camera.spawn_generator(100).unwrap();

    let mut last = -1;
    for _ in 0..5 {
        let buffer = read(&source).unwrap();
        assert_eq!(buffer.data().len(), 320 * 240 * 3 / 2);
        assert!(buffer.presentation_time_us() > last);
        last = buffer.presentation_time_us();
    }
    source.stop().unwrap();

    let stats = source.stats();
    assert!(stats.is_balanced());
    assert_eq!(stats.encoded, 5);
    assert_eq!(camera.outstanding(), 0);
}

#[test]
fn test_read_deadline() {
    let (camera, source) = setup();
    source.start(&options(640, 480, 30)).unwrap();

    let bounded = ReadOptions {
        timeout: Some(Duration::from_millis(30)),
        ..ReadOptions::default()
    };
    match source.read(&bounded) {
        Err(SourceError::Timeout(waited_ms)) => assert!(waited_ms >= 30),
        other => panic!("expected a timeout, got {:?}", other.map(|b| b.is_some())),
    }

    assert!(camera.emit_frame(1000, frame()));
    let buffer = source.read(&bounded).unwrap().unwrap();
    assert_eq!(buffer.capture_time_us(), 1000);
    drop(buffer);

    source.stop().unwrap();
    let stats = source.stats();
    assert_eq!((stats.received, stats.encoded, stats.dropped), (1, 1, 0));
}

#[test]
fn test_metadata_slot_timeout_drops_frames() {
    let camera = Arc::new(SyntheticCamera::new(camera_params()));
    let config = PipelineConfig {
        video_buffer_count: 2,
        ..pipeline_config()
    };
    let source = CameraSource::new(camera.clone(), config);
    camera.refuse_mode(VideoBufferMode::BufferQueue);
    let start = StartOptions {
        store_metadata_only: true,
        ..options(640, 480, 30)
    };
    source.start(&start).unwrap();

    // Two handles fill the slots, the next two wait out the slot timeout
    for ts in [1000, 2000, 3000, 4000] {
        assert!(camera.emit_handle(ts));
    }
    assert_eq!(source.queued_frames(), 2);
    assert_eq!(camera.outstanding(), 2);

    source.stop().unwrap();
    let stats = source.stats();
    assert_eq!((stats.received, stats.encoded, stats.dropped), (4, 0, 4));
    assert_eq!(camera.outstanding(), 0);
    assert_eq!(camera.unknown_releases(), 0);
}

#[test]
fn test_buffer_queue_reader_races_stop() {
    for _ in 0..5 {
        let camera = Arc::new(SyntheticCamera::new(SyntheticCamera::default_parameters()));
        let source = Arc::new(CameraSource::new(camera.clone(), pipeline_config()));
        let start = StartOptions {
            store_metadata_only: true,
            ..options(320, 240, 30)
        };
        source.start(&start).unwrap();
        assert_eq!(camera.video_buffer_mode(), Some(VideoBufferMode::BufferQueue));
        camera.spawn_generator(200).unwrap();

        let reader = {
            let source = Arc::clone(&source);
            thread::spawn(move || {
                let mut frames = 0u64;
                while let Some(buffer) = read(&source) {
                    frames += 1;
                    drop(buffer);
                }
                frames
            })
        };

        thread::sleep(Duration::from_millis(50));
        source.stop().unwrap();
        let frames = reader.join().unwrap();

        let stats = source.stats();
        assert!(stats.is_balanced(), "{:?}", stats);
        assert_eq!(stats.encoded, frames);
        assert_eq!(source.frames_being_encoded(), 0);
    }
}
