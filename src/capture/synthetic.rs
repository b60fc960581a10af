//! In-process camera that generates NV21 test frames

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::capture::device::{
    CameraDevice, CameraParameters, DeviceFrame, FrameListener, NativeHandle,
};
use crate::capture::frame::{Size, VideoBufferMode};
use crate::error::DeviceError;
use crate::pipeline::buffer_queue::BufferQueueProducer;
use crate::utils::frame_interval;

/// A call the source made on the camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    PullParameters,
    PushParameters,
    SetListener(bool),
    SetVideoBufferMode(VideoBufferMode),
    SetVideoTarget,
    StartRecording,
    StopRecording,
    ReleaseFrame(u64),
    ReleaseHandle(u64),
    RateLimit(bool),
}

#[derive(Default)]
struct State {
    params: CameraParameters,
    busy: bool,
    ignore_pushes: bool,
    fail_start: bool,
    refused_modes: Vec<VideoBufferMode>,
    mode: Option<VideoBufferMode>,
    listener: Option<Arc<dyn FrameListener>>,
    target: Option<BufferQueueProducer>,
    recording: bool,
    rate_limited: bool,
    next_id: u64,
    sequence: u64,
    outstanding: HashSet<u64>,
    unknown_releases: usize,
    pushes: usize,
    calls: Vec<DeviceCall>,
}

/// Camera double that records every call and delivers injected frames
pub struct SyntheticCamera {
    state: Mutex<State>,
    generator: Mutex<Option<JoinHandle<()>>>,
    generating: Arc<AtomicBool>,
    epoch: Instant,
}

impl SyntheticCamera {
    pub fn new(params: CameraParameters) -> Self {
        Self {
            state: Mutex::new(State {
                params,
                next_id: 1,
                ..State::default()
            }),
            generator: Mutex::new(None),
            generating: Arc::new(AtomicBool::new(false)),
            epoch: Instant::now(),
        }
    }

    /// 640x480 and 320x240 NV21 at 15 or 30 fps, currently 640x480@30
    pub fn default_parameters() -> CameraParameters {
        CameraParameters {
            preview_size: Size::new(640, 480),
            video_size: None,
            supported_preview_sizes: vec![Size::new(640, 480), Size::new(320, 240)],
            supported_video_sizes: Vec::new(),
            preview_frame_rate: Some(30),
            supported_preview_frame_rates: vec![15, 30],
            video_frame_format: Some("yuv420sp".into()),
        }
    }

    pub fn set_busy(&self, busy: bool) {
        self.state.lock().busy = busy;
    }

    /// Accept parameter pushes without applying them
    pub fn set_ignore_pushes(&self, ignore: bool) {
        self.state.lock().ignore_pushes = ignore;
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    pub fn refuse_mode(&self, mode: VideoBufferMode) {
        self.state.lock().refused_modes.push(mode);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    pub fn pushed_parameters(&self) -> usize {
        self.state.lock().pushes
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    pub fn has_listener(&self) -> bool {
        self.state.lock().listener.is_some()
    }

    pub fn rate_limited(&self) -> bool {
        self.state.lock().rate_limited
    }

    pub fn video_buffer_mode(&self) -> Option<VideoBufferMode> {
        self.state.lock().mode
    }

    /// Frames and handles lent to the listener and not yet released
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Releases of frames this camera never lent
    pub fn unknown_releases(&self) -> usize {
        self.state.lock().unknown_releases
    }

    /// Microseconds on the camera clock
    pub fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    fn video_size(params: &CameraParameters) -> Size {
        if params.supported_video_sizes.is_empty() {
            params.preview_size
        } else {
            params.video_size.unwrap_or(params.preview_size)
        }
    }

    /// Deliver a frame in data-callback mode
    pub fn emit_frame(&self, timestamp_us: i64, data: Bytes) -> bool {
        let (listener, id) = {
            let mut state = self.state.lock();
            let Some(listener) = state.listener.clone().filter(|_| state.recording) else {
                return false;
            };
            let id = state.next_id;
            state.next_id += 1;
            state.outstanding.insert(id);
            (listener, id)
        };
        trace!("Emitting frame {} at {} us", id, timestamp_us);
        listener.on_frame_data(timestamp_us, DeviceFrame { id, data });
        true
    }

    /// Deliver a native handle in metadata mode
    pub fn emit_handle(&self, timestamp_us: i64) -> bool {
        let (listener, id) = {
            let mut state = self.state.lock();
            let Some(listener) = state.listener.clone().filter(|_| state.recording) else {
                return false;
            };
            let id = state.next_id;
            state.next_id += 1;
            state.outstanding.insert(id);
            (listener, id)
        };
        listener.on_frame_handle(timestamp_us, NativeHandle { id });
        true
    }

    /// Push a filled buffer into the video target in buffer-queue mode
    pub fn emit_queue_buffer(&self, timestamp_us: i64, data: Bytes) -> bool {
        let producer = {
            let state = self.state.lock();
            match state.target.clone().filter(|_| state.recording) {
                Some(producer) => producer,
                None => return false,
            }
        };
        match producer.dequeue_buffer() {
            Ok(Some(id)) => producer.queue_buffer(id, data, timestamp_us * 1000).is_ok(),
            Ok(None) => {
                trace!("No free queue buffer, dropping frame at {} us", timestamp_us);
                false
            }
            Err(e) => {
                debug!("Video target unavailable: {}", e);
                false
            }
        }
    }

    /// Deliver one test frame the way the current buffer mode expects
    pub fn emit(&self, timestamp_us: i64) -> bool {
        let (mode, size, sequence) = {
            let mut state = self.state.lock();
            state.sequence += 1;
            (state.mode, Self::video_size(&state.params), state.sequence)
        };
        match mode {
            Some(VideoBufferMode::DataCallbackMetadata) => self.emit_handle(timestamp_us),
            Some(VideoBufferMode::BufferQueue) => {
                self.emit_queue_buffer(timestamp_us, test_pattern(size, sequence))
            }
            Some(VideoBufferMode::DataCallbackYuv) | None => {
                self.emit_frame(timestamp_us, test_pattern(size, sequence))
            }
        }
    }

    /// Emit frames at `fps` on a background thread until recording stops
    pub fn spawn_generator(self: &Arc<Self>, fps: u32) -> Result<(), DeviceError> {
        let mut generator = self.generator.lock();
        if generator.is_some() {
            return Err(DeviceError::Busy("generator already running".into()));
        }
        let interval = frame_interval(fps);
        let camera: Weak<Self> = Arc::downgrade(self);
        let generating = Arc::clone(&self.generating);
        generating.store(true, Ordering::Release);

        let handle = thread::Builder::new()
            .name("camsource-synthetic".into())
            .spawn(move || {
                while generating.load(Ordering::Acquire) {
                    let Some(camera) = camera.upgrade() else {
                        break;
                    };
                    camera.emit(camera.now_us());
                    drop(camera);
                    thread::sleep(interval);
                }
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;
        *generator = Some(handle);
        info!("Synthetic camera generating at {} fps", fps);
        Ok(())
    }
}

/// NV21 frame with a moving luma ramp and neutral chroma
pub fn test_pattern(size: Size, sequence: u64) -> Bytes {
    let (width, height) = (size.width as usize, size.height as usize);
    let mut buf = BytesMut::with_capacity(width * height * 3 / 2);
    for y in 0..height {
        for x in 0..width {
            buf.put_u8(((x + y + sequence as usize) & 0xff) as u8);
        }
    }
    buf.put_bytes(128, width * height / 2);
    buf.freeze()
}

impl CameraDevice for SyntheticCamera {
    fn pull_parameters(&self) -> Result<CameraParameters, DeviceError> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::PullParameters);
        Ok(state.params.clone())
    }

    fn push_parameters(&self, params: &CameraParameters) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::PushParameters);
        if state.busy {
            return Err(DeviceError::Busy("camera locked by another client".into()));
        }
        state.pushes += 1;
        if !state.ignore_pushes {
            state.params = params.clone();
        }
        Ok(())
    }

    fn set_listener(&self, listener: Option<Arc<dyn FrameListener>>) {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::SetListener(listener.is_some()));
        state.listener = listener;
    }

    fn set_video_buffer_mode(&self, mode: VideoBufferMode) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::SetVideoBufferMode(mode));
        if state.refused_modes.contains(&mode) {
            return Err(DeviceError::NotSupported(format!("{:?}", mode)));
        }
        state.mode = Some(mode);
        Ok(())
    }

    fn set_video_target(&self, producer: BufferQueueProducer) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::SetVideoTarget);
        state.target = Some(producer);
        Ok(())
    }

    fn start_recording(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::StartRecording);
        if state.fail_start {
            return Err(DeviceError::Stream("sensor failed to start".into()));
        }
        state.recording = true;
        Ok(())
    }

    fn stop_recording(&self) {
        {
            let mut state = self.state.lock();
            state.calls.push(DeviceCall::StopRecording);
            state.recording = false;
            state.target = None;
        }
        self.generating.store(false, Ordering::Release);
        let handle = self.generator.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Synthetic generator thread panicked");
            }
        }
    }

    fn release_recording_frame(&self, frame: DeviceFrame) {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::ReleaseFrame(frame.id));
        if !state.outstanding.remove(&frame.id) {
            state.unknown_releases += 1;
        }
    }

    fn release_recording_frame_handle(&self, handle: NativeHandle) {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::ReleaseHandle(handle.id));
        if !state.outstanding.remove(&handle.id) {
            state.unknown_releases += 1;
        }
    }

    fn on_rate_limit_preview(&self, limit: bool) {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::RateLimit(limit));
        state.rate_limited = limit;
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        self.generating.store(false, Ordering::Release);
    }
}
