//! Camera capture source: owns a recording session and hands frames to a consumer

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use metrics::histogram;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::device::{
    CallingIdentityGuard, CameraDevice, DeviceFrame, FrameListener, NativeHandle,
};
use crate::capture::frame::{
    encode_anw_metadata, encode_handle_metadata, BufferObserver, DataSpace, MetadataBufferType,
    Payload, PayloadId, PixelFormat, VideoBuffer, VideoBufferMode, VideoFormat,
    METADATA_SLOT_SIZE,
};
use crate::capture::gate::{FrameSkipPolicy, FrameTimingGate, GateDecision};
use crate::capture::negotiate::{negotiate, select_buffer_mode, VideoRequest};
use crate::capture::pending::{PendingFrame, PendingQueue, Statistics};
use crate::error::{BridgeError, Result, SourceError};
use crate::pipeline::{
    BufferItem, BufferItemMap, BufferQueueBridge, BufferQueueConfig, BufferQueueConsumer,
    FrameBufferPool, FrameSlot,
};
use crate::utils::frame_interval_us;
use crate::{CaptureConfig, PipelineConfig};

/// Lifecycle of a [`CameraSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Released,
    Allocated,
    Started,
    Stopped,
}

/// Parameters for [`CameraSource::start`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub request: VideoRequest,
    /// Recording clock time of the first frame; earlier frames are dropped
    pub start_time_us: i64,
    /// Encoder input buffers for the buffer queue
    pub buffer_count: usize,
    pub pixel_format: PixelFormat,
    pub data_space: DataSpace,
    /// Ask the camera for metadata buffers instead of pixel data
    pub store_metadata_only: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            request: VideoRequest::default(),
            start_time_us: 0,
            buffer_count: 1,
            pixel_format: PixelFormat::ImplementationDefined,
            data_space: DataSpace::Bt709,
            store_metadata_only: false,
        }
    }
}

impl From<&CaptureConfig> for StartOptions {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            request: VideoRequest {
                width: config.width,
                height: config.height,
                frame_rate: config.frame_rate,
            },
            start_time_us: config.start_time_us,
            buffer_count: config.buffer_count,
            pixel_format: config.pixel_format,
            data_space: config.data_space,
            store_metadata_only: config.store_metadata_only,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub seek_to_us: Option<i64>,
    /// Give up with [`SourceError::Timeout`] when no frame arrives in time
    pub timeout: Option<Duration>,
}

/// Receives every frame as soon as it is queued, in place of a reader
pub trait DirectBufferListener: Send + Sync {
    fn buffer_available(&self, buffer: VideoBuffer);
}

struct Backing {
    pool: Option<Arc<FrameBufferPool>>,
    queue: Option<BufferQueueConsumer>,
}

struct Session {
    /// Frames are being accepted
    started: bool,
    /// Between allocation and the end of stop
    active: bool,
    /// A session was started since the last reset
    initialized: bool,
    gate: FrameTimingGate,
    pending: PendingQueue,
    being_encoded: Vec<Payload>,
    stats: Statistics,
    backing: Option<Backing>,
    buffer_items: BufferItemMap,
    rate_limit: bool,
    direct_listener: Option<Arc<dyn DirectBufferListener>>,
    frame_interval_us: i64,
}

impl Session {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            started: false,
            active: false,
            initialized: false,
            gate: FrameTimingGate::new(0, config.glitch_threshold_us),
            pending: PendingQueue::default(),
            being_encoded: Vec::new(),
            stats: Statistics::default(),
            backing: None,
            buffer_items: BufferItemMap::default(),
            rate_limit: false,
            direct_listener: None,
            frame_interval_us: 0,
        }
    }

    fn begin(&mut self, start_time_us: i64, glitch_threshold_us: i64, frame_rate: u32) {
        debug_assert!(self.pending.is_empty() && self.being_encoded.is_empty());
        self.gate.restart(start_time_us, glitch_threshold_us);
        self.stats = Statistics::default();
        self.frame_interval_us = self
            .gate
            .capture_interval_us()
            .unwrap_or_else(|| frame_interval_us(frame_rate));
        self.rate_limit = false;
        self.buffer_items = BufferItemMap::default();
    }

    fn snapshot(&self) -> Statistics {
        Statistics {
            glitches: self.gate.glitches(),
            first_frame_time_us: self.gate.first_frame_time_us(),
            last_frame_time_us: self.gate.last_timestamp_us(),
            ..self.stats
        }
    }

    fn pool(&self) -> Option<Arc<FrameBufferPool>> {
        self.backing.as_ref().and_then(|b| b.pool.clone())
    }

    fn queue(&self) -> Option<BufferQueueConsumer> {
        self.backing.as_ref().and_then(|b| b.queue.clone())
    }
}

struct Control {
    phase: SourceState,
    bridge: Option<BufferQueueBridge>,
    format: Option<VideoFormat>,
    mode: Option<VideoBufferMode>,
}

struct SourceInner {
    device: Arc<dyn CameraDevice>,
    config: PipelineConfig,
    session: Mutex<Session>,
    frame_available: Condvar,
    frame_complete: Condvar,
    /// Serialises start, stop and reset
    control: Mutex<Control>,
    weak_self: Weak<SourceInner>,
}

/// Streams frames from a [`CameraDevice`] to a consumer.
///
/// The consumer pulls frames with [`read`](Self::read) and hands each one
/// back with [`signal_buffer_returned`](Self::signal_buffer_returned) or by
/// dropping it. `stop` does not return while frames are still out.
pub struct CameraSource {
    inner: Arc<SourceInner>,
}

impl CameraSource {
    pub fn new(device: Arc<dyn CameraDevice>, config: PipelineConfig) -> Self {
        let inner = Arc::new_cyclic(|weak_self| SourceInner {
            device,
            session: Mutex::new(Session::new(&config)),
            config,
            frame_available: Condvar::new(),
            frame_complete: Condvar::new(),
            control: Mutex::new(Control {
                phase: SourceState::Released,
                bridge: None,
                format: None,
                mode: None,
            }),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    pub fn state(&self) -> SourceState {
        self.inner.control.lock().phase
    }

    /// Negotiate the format, allocate buffers and begin streaming
    #[instrument(skip(self, options), fields(request = ?options.request))]
    pub fn start(&self, options: &StartOptions) -> Result<()> {
        let mut control = self.inner.control.lock();
        if control.phase == SourceState::Started {
            return Err(SourceError::AlreadyStarted);
        }

        match self.inner.start_session(&mut control, options) {
            Ok(()) => {
                control.phase = SourceState::Started;
                info!("Camera source started in {:?} mode", control.mode);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start camera source: {}", e);
                self.inner.abort_start(&mut control);
                Err(e)
            }
        }
    }

    /// Drain outstanding frames and stop the camera; a no-op unless started
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<()> {
        let mut control = self.inner.control.lock();
        if control.phase != SourceState::Started {
            debug!("Camera source not started, nothing to stop");
            return Ok(());
        }
        self.inner.stop_session(&mut control);
        Ok(())
    }

    /// Stop, then forget the negotiated format
    #[instrument(skip(self))]
    pub fn reset(&self) -> Result<()> {
        let mut control = self.inner.control.lock();
        if control.phase == SourceState::Started {
            self.inner.stop_session(&mut control);
        }
        control.format = None;
        control.mode = None;
        {
            let mut session = self.inner.session.lock();
            session.initialized = false;
            session.direct_listener = None;
        }
        control.phase = SourceState::Released;
        Ok(())
    }

    /// Block until a frame is ready.
    ///
    /// Returns `Ok(None)` once the source is stopped or the stop time was
    /// reached and every queued frame has been read.
    pub fn read(&self, options: &ReadOptions) -> Result<Option<VideoBuffer>> {
        if options.seek_to_us.is_some() {
            return Err(SourceError::Unsupported("seeking"));
        }

        let inner = &self.inner;
        let mut session = inner.session.lock();
        if !session.initialized {
            return Err(SourceError::NotInitialized);
        }

        let timeout = inner.wait_timeout(&session);
        let wait_start = Instant::now();
        let deadline = options.timeout.map(|limit| wait_start + limit);
        while session.started && !session.gate.eos() && session.pending.is_empty() {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let waited_ms = wait_start.elapsed().as_millis() as u64;
                        debug!("Read gave up after {} ms", waited_ms);
                        return Err(SourceError::Timeout(waited_ms));
                    }
                    timeout.min(deadline - now)
                }
                None => timeout,
            };
            if inner
                .frame_available
                .wait_for(&mut session, wait)
                .timed_out()
                && deadline.is_none()
                && session.started
                && session.pending.is_empty()
            {
                warn!(
                    "Timed out waiting for incoming camera video frames: {} us",
                    session.gate.last_timestamp_us()
                );
            }
        }
        histogram!("camsource.read_wait_us").record(wait_start.elapsed().as_micros() as f64);

        if !session.started {
            return Ok(None);
        }
        Ok(inner.take_next(&mut session))
    }

    /// Hand a frame back to the source once the consumer is done with it
    pub fn signal_buffer_returned(&self, mut buffer: VideoBuffer) -> Result<()> {
        buffer.disarm();
        self.inner.return_buffer(buffer.id())
    }

    /// Frames captured at or after `stop_time_us` end the stream; `None` clears it
    pub fn set_stop_time_us(&self, stop_time_us: Option<i64>) -> Result<()> {
        if let Some(stop) = stop_time_us.filter(|&stop| stop < 0) {
            error!("Invalid stop time {} us", stop);
            return Err(SourceError::InvalidArgument(format!(
                "stop time {} us",
                stop
            )));
        }
        self.inner.session.lock().gate.set_stop_time_us(stop_time_us);
        Ok(())
    }

    pub fn set_frame_skip_policy(&self, policy: Option<Box<dyn FrameSkipPolicy>>) {
        let mut session = self.inner.session.lock();
        session.gate.set_skip_policy(policy);
        if let Some(interval) = session.gate.capture_interval_us() {
            session.frame_interval_us = interval;
        }
    }

    pub fn add_direct_buffer_listener(&self, listener: Arc<dyn DirectBufferListener>) -> Result<()> {
        let mut session = self.inner.session.lock();
        if session.direct_listener.is_some() {
            return Err(SourceError::AlreadyExists("direct buffer listener"));
        }
        session.direct_listener = Some(listener);
        Ok(())
    }

    pub fn get_format(&self) -> Result<VideoFormat> {
        self.inner
            .control
            .lock()
            .format
            .clone()
            .ok_or(SourceError::NotInitialized)
    }

    /// What consumers find in the buffers returned by `read`
    pub fn metadata_buffer_type(&self) -> MetadataBufferType {
        self.inner
            .control
            .lock()
            .mode
            .map(MetadataBufferType::from)
            .unwrap_or(MetadataBufferType::Invalid)
    }

    pub fn stats(&self) -> Statistics {
        self.inner.session.lock().snapshot()
    }

    /// Frames accepted but not read yet
    pub fn queued_frames(&self) -> usize {
        self.inner.session.lock().pending.len()
    }

    /// Frames read but not returned yet
    pub fn frames_being_encoded(&self) -> usize {
        self.inner.session.lock().being_encoded.len()
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        if let Err(e) = self.reset() {
            warn!("Failed to reset camera source: {}", e);
        }
    }
}

impl SourceInner {
    fn start_session(&self, control: &mut Control, options: &StartOptions) -> Result<()> {
        let negotiated = negotiate(&*self.device, &options.request)?;
        control.format = Some(negotiated.into());
        control.phase = SourceState::Allocated;

        let mode = select_buffer_mode(&*self.device, options.store_metadata_only)?;
        control.mode = Some(mode);

        let glitch_threshold_us = FrameTimingGate::glitch_threshold_for(
            negotiated.frame_rate,
            self.config.glitch_threshold_us,
        );
        self.session.lock().begin(
            options.start_time_us,
            glitch_threshold_us,
            negotiated.frame_rate,
        );

        let backing = match mode {
            VideoBufferMode::DataCallbackYuv => Backing {
                pool: None,
                queue: None,
            },
            VideoBufferMode::DataCallbackMetadata => Backing {
                pool: Some(Arc::new(FrameBufferPool::new(
                    METADATA_SLOT_SIZE,
                    self.config.video_buffer_count,
                )?)),
                queue: None,
            },
            VideoBufferMode::BufferQueue => {
                let buffer_count = options.buffer_count.max(1) + self.config.consumer_buffer_reserve;
                let mut bridge = BufferQueueBridge::new(Duration::from_millis(
                    self.config.frame_available_timeout_ms,
                ));
                let producer = bridge.initialize(BufferQueueConfig {
                    width: negotiated.size.width,
                    height: negotiated.size.height,
                    format: options.pixel_format,
                    data_space: options.data_space,
                    buffer_count,
                })?;
                self.device.set_video_target(producer)?;

                let pool = Arc::new(FrameBufferPool::new(METADATA_SLOT_SIZE, buffer_count)?);
                let consumer = bridge
                    .consumer()
                    .cloned()
                    .ok_or(BridgeError::NotInitialized)?;

                let source = self.weak_self.clone();
                let orphaned = consumer.clone();
                bridge.start(move |item| match source.upgrade() {
                    Some(source) => source.on_queue_item(item),
                    None => {
                        let _ = orphaned.release_buffer(item.buffer.id);
                    }
                })?;
                control.bridge = Some(bridge);

                Backing {
                    pool: Some(pool),
                    queue: Some(consumer),
                }
            }
        };

        {
            let mut session = self.session.lock();
            session.backing = Some(backing);
            session.active = true;
            session.initialized = true;
        }

        let listener: Arc<dyn FrameListener> = Arc::new(SourceListener {
            source: self.weak_self.clone(),
        });
        self.device.set_listener(Some(listener));
        self.device.start_recording()?;

        self.session.lock().started = true;
        Ok(())
    }

    /// Undo a partial start and go back to `Released`
    fn abort_start(&self, control: &mut Control) {
        let listener_set = {
            let mut session = self.session.lock();
            let listener_set = session.initialized;
            session.started = false;
            session.initialized = false;
            listener_set
        };
        if listener_set {
            self.device.set_listener(None);
        }
        if let Some(mut bridge) = control.bridge.take() {
            bridge.stop();
        }
        {
            let mut session = self.session.lock();
            session.backing = None;
            session.active = false;
        }
        control.format = None;
        control.mode = None;
        control.phase = SourceState::Released;
    }

    fn stop_session(&self, control: &mut Control) {
        debug!("Stopping camera source");
        let rate_limited = {
            let mut session = self.session.lock();
            session.started = false;
            self.frame_available.notify_all();

            // Frames nobody read yet
            while let Some((frame, _)) = session.pending.pop() {
                self.release_frame(&mut session, frame.payload);
                session.stats.record_dropped();
            }

            let timeout = self.wait_timeout(&session);
            while !session.being_encoded.is_empty() {
                if self
                    .frame_complete
                    .wait_for(&mut session, timeout)
                    .timed_out()
                {
                    warn!(
                        "Timed out waiting for outstanding frames being encoded: {}",
                        session.being_encoded.len()
                    );
                }
            }
            session.direct_listener = None;
            std::mem::take(&mut session.rate_limit)
        };

        self.device.set_listener(None);
        self.device.stop_recording();

        if let Some(mut bridge) = control.bridge.take() {
            bridge.stop();
        }

        let stats = {
            let mut session = self.session.lock();
            if !session.buffer_items.is_empty() {
                warn!(
                    "{} buffer queue items still mapped at stop",
                    session.buffer_items.len()
                );
                let queue = session.queue();
                for item in session.buffer_items.drain() {
                    release_item(queue.as_ref(), item);
                }
            }
            session.backing = None;
            session.active = false;
            session.gate.set_stop_time_us(None);
            session.snapshot()
        };

        if self.config.collect_stats {
            info!(
                "Frames received/encoded/dropped: {}/{}/{} in {} us",
                stats.received,
                stats.encoded,
                stats.dropped,
                stats.recorded_duration_us()
            );
        }
        if stats.glitches > 0 {
            warn!(
                "{} long delays between neighboring video frames",
                stats.glitches
            );
        }
        if !stats.is_balanced() {
            error!(
                "Frame accounting mismatch: received {} != encoded {} + dropped {}",
                stats.received, stats.encoded, stats.dropped
            );
        }
        debug_assert!(stats.is_balanced(), "unbalanced frame statistics: {:?}", stats);

        if rate_limited {
            self.device.on_rate_limit_preview(false);
        }
        control.phase = SourceState::Stopped;
        info!("Camera source stopped");
    }

    fn wait_timeout(&self, session: &Session) -> Duration {
        Duration::from_micros(session.frame_interval_us.max(0) as u64)
            + Duration::from_millis(self.config.read_timeout_ms)
    }

    /// Run the gate for one delivered frame; `Some` carries the presentation time
    fn admit(&self, session: &mut Session, timestamp_us: i64) -> Option<i64> {
        let started = session.started;
        match session.gate.should_skip(timestamp_us, started) {
            GateDecision::Accept {
                presentation_time_us,
            } => Some(presentation_time_us),
            GateDecision::EndOfStream => {
                self.frame_available.notify_all();
                None
            }
            GateDecision::Drop(reason) => {
                trace!("Dropping frame at {} us: {:?}", timestamp_us, reason);
                None
            }
        }
    }

    /// Queue an accepted frame and wake a reader
    fn enqueue(
        &self,
        mut session: MutexGuard<'_, Session>,
        payload: Payload,
        capture_time_us: i64,
        presentation_time_us: i64,
        data_callback: bool,
    ) {
        // A backlog means the consumer is falling behind
        let rate_limit = !session.pending.is_empty();
        let rate_changed = data_callback && rate_limit != session.rate_limit;
        if data_callback {
            session.rate_limit = rate_limit;
        }

        session
            .pending
            .push(payload, capture_time_us, presentation_time_us);
        trace!(
            "Queued frame {} us as {} us",
            capture_time_us,
            presentation_time_us
        );
        self.frame_available.notify_one();

        let direct = if data_callback {
            session.direct_listener.clone()
        } else {
            None
        };
        drop(session);

        if rate_changed {
            self.device.on_rate_limit_preview(rate_limit);
        }
        if let Some(listener) = direct {
            if let Some(buffer) = self.try_read() {
                listener.buffer_available(buffer);
            }
        }
    }

    fn on_frame_data(&self, timestamp_us: i64, frame: DeviceFrame) {
        let mut session = self.session.lock();
        if !session.active {
            drop(session);
            self.release_device_frame(frame);
            return;
        }

        session.stats.record_received();
        let Some(presentation_time_us) = self.admit(&mut session, timestamp_us) else {
            session.stats.record_dropped();
            drop(session);
            self.release_device_frame(frame);
            return;
        };
        self.enqueue(
            session,
            Payload::Device(frame),
            timestamp_us,
            presentation_time_us,
            true,
        );
    }

    fn on_frame_handle(&self, timestamp_us: i64, handle: NativeHandle) {
        let (presentation_time_us, pool) = {
            let mut session = self.session.lock();
            if !session.active {
                drop(session);
                self.release_handle(handle);
                return;
            }
            session.stats.record_received();
            let pool = session.pool();
            match (self.admit(&mut session, timestamp_us), pool) {
                (Some(presentation_time_us), Some(pool)) => (presentation_time_us, pool),
                _ => {
                    session.stats.record_dropped();
                    drop(session);
                    self.release_handle(handle);
                    return;
                }
            }
        };

        // Wait for a slot without holding the session lock
        let slot = pool.acquire_timeout(Duration::from_millis(self.config.memory_base_timeout_ms));

        let mut session = self.session.lock();
        let Some(mut slot) = slot else {
            warn!(
                "No metadata slot within {} ms, dropping frame at {} us",
                self.config.memory_base_timeout_ms, timestamp_us
            );
            session.stats.record_dropped();
            drop(session);
            self.release_handle(handle);
            return;
        };
        if !session.started {
            session.stats.record_dropped();
            drop(session);
            return_slot(&pool, slot);
            self.release_handle(handle);
            return;
        }

        encode_handle_metadata(slot.as_mut_slice(), handle.id);
        self.enqueue(
            session,
            Payload::Handle { slot, handle },
            timestamp_us,
            presentation_time_us,
            true,
        );
    }

    fn on_queue_item(&self, item: BufferItem) {
        let timestamp_us = item.timestamp_ns / 1000;
        let (presentation_time_us, pool, queue) = {
            let mut session = self.session.lock();
            let queue = session.queue();
            if !session.active {
                drop(session);
                release_item(queue.as_ref(), item);
                return;
            }
            session.stats.record_received();
            let pool = session.pool();
            match (self.admit(&mut session, timestamp_us), pool) {
                (Some(presentation_time_us), Some(pool)) => (presentation_time_us, pool, queue),
                _ => {
                    session.stats.record_dropped();
                    drop(session);
                    release_item(queue.as_ref(), item);
                    return;
                }
            }
        };

        let slot = pool.acquire_timeout(Duration::from_millis(self.config.memory_base_timeout_ms));

        let mut session = self.session.lock();
        let Some(mut slot) = slot else {
            warn!(
                "No metadata slot within {} ms, dropping queue buffer at {} us",
                self.config.memory_base_timeout_ms, timestamp_us
            );
            session.stats.record_dropped();
            drop(session);
            release_item(queue.as_ref(), item);
            return;
        };
        if !session.started {
            session.stats.record_dropped();
            drop(session);
            return_slot(&pool, slot);
            release_item(queue.as_ref(), item);
            return;
        }

        encode_anw_metadata(slot.as_mut_slice(), item.buffer.id.0);
        let buffer = item.buffer.id;
        let timestamp_ns = item.timestamp_ns;
        session.buffer_items.insert(item);
        self.enqueue(
            session,
            Payload::Queue {
                slot,
                buffer,
                timestamp_ns,
            },
            timestamp_us,
            presentation_time_us,
            false,
        );
    }

    /// Pop the oldest queued frame and lend it to the consumer
    fn take_next(&self, session: &mut Session) -> Option<VideoBuffer> {
        let (frame, presentation_time_us) = session.pending.pop()?;
        let PendingFrame {
            payload,
            capture_time_us,
        } = frame;

        let id = payload.id();
        let data = payload.contents();
        let graphic_buffer = match &payload {
            Payload::Queue { buffer, .. } => session
                .buffer_items
                .get(*buffer)
                .map(|item| item.buffer.clone()),
            _ => None,
        };
        session.being_encoded.push(payload);

        let observer: Weak<dyn BufferObserver> = self.weak_self.clone();
        Some(VideoBuffer::new(
            id,
            data,
            capture_time_us,
            presentation_time_us,
            graphic_buffer,
            observer,
        ))
    }

    fn try_read(&self) -> Option<VideoBuffer> {
        let mut session = self.session.lock();
        if !session.started {
            return None;
        }
        self.take_next(&mut session)
    }

    fn return_buffer(&self, id: PayloadId) -> Result<()> {
        let mut session = self.session.lock();
        let index = session.being_encoded.iter().position(|p| p.id() == id);
        debug_assert!(index.is_some(), "returned buffer {:?} is not being encoded", id);
        let Some(index) = index else {
            error!("Returned buffer {:?} is not being encoded", id);
            return Err(SourceError::UnknownBuffer(id));
        };

        let payload = session.being_encoded.remove(index);
        self.release_frame(&mut session, payload);
        session.stats.record_encoded();
        self.frame_complete.notify_all();
        Ok(())
    }

    /// Give a payload back to whatever backs it
    fn release_frame(&self, session: &mut Session, payload: Payload) {
        match payload {
            Payload::Device(frame) => self.release_device_frame(frame),
            Payload::Handle { slot, handle } => {
                self.release_handle(handle);
                match session.pool() {
                    Some(pool) => return_slot(&pool, slot),
                    None => warn!("Metadata pool gone, dropping slot {}", slot.index()),
                }
            }
            Payload::Queue {
                slot,
                buffer,
                timestamp_ns,
            } => {
                match session.buffer_items.take(buffer, timestamp_ns) {
                    Some(item) => release_item(session.queue().as_ref(), item),
                    None => error!("No buffer item for buffer {}", buffer.0),
                }
                match session.pool() {
                    Some(pool) => return_slot(&pool, slot),
                    None => warn!("Metadata pool gone, dropping slot {}", slot.index()),
                }
            }
        }
    }

    fn release_device_frame(&self, frame: DeviceFrame) {
        let _identity = CallingIdentityGuard::new(&*self.device);
        self.device.release_recording_frame(frame);
    }

    fn release_handle(&self, handle: NativeHandle) {
        let _identity = CallingIdentityGuard::new(&*self.device);
        self.device.release_recording_frame_handle(handle);
    }
}

impl BufferObserver for SourceInner {
    fn buffer_returned(&self, id: PayloadId) {
        if let Err(e) = self.return_buffer(id) {
            error!("Failed to return buffer: {}", e);
        }
    }
}

fn return_slot(pool: &FrameBufferPool, slot: FrameSlot) {
    if let Err(e) = pool.release(slot) {
        error!("Mismatched metadata heap, ignoring release: {}", e);
    }
}

fn release_item(queue: Option<&BufferQueueConsumer>, item: BufferItem) {
    match queue {
        Some(queue) => {
            if let Err(e) = queue.release_buffer(item.buffer.id) {
                warn!("Failed to release queue buffer {}: {}", item.buffer.id.0, e);
            }
        }
        None => debug!("Buffer queue gone, dropping buffer {}", item.buffer.id.0),
    }
}

/// Registered with the device while a session runs
struct SourceListener {
    source: Weak<SourceInner>,
}

impl FrameListener for SourceListener {
    fn on_frame_data(&self, timestamp_us: i64, frame: DeviceFrame) {
        match self.source.upgrade() {
            Some(source) => source.on_frame_data(timestamp_us, frame),
            None => trace!("Source gone, dropping frame {}", frame.id),
        }
    }

    fn on_frame_handle(&self, timestamp_us: i64, handle: NativeHandle) {
        match self.source.upgrade() {
            Some(source) => source.on_frame_handle(timestamp_us, handle),
            None => trace!("Source gone, dropping handle {}", handle.id),
        }
    }
}
