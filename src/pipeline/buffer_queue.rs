//! In-process producer/consumer buffer queue for zero-copy frame delivery

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::capture::frame::{DataSpace, PixelFormat};
use crate::error::BridgeError;

/// Identity of a buffer owned by a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeBufferId(pub u64);

/// A buffer filled by the producer
#[derive(Clone)]
pub struct GraphicBuffer {
    pub id: NativeBufferId,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

impl fmt::Debug for GraphicBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicBuffer")
            .field("id", &self.id)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("stride", &self.stride)
            .field("format", &self.format)
            .finish()
    }
}

/// A queued buffer as seen by the consumer
#[derive(Debug, Clone)]
pub struct BufferItem {
    pub buffer: GraphicBuffer,
    pub timestamp_ns: i64,
    pub frame_number: u64,
}

/// Shape of the buffers a queue hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferQueueConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data_space: DataSpace,
    pub buffer_count: usize,
}

/// Notified by the queue each time the producer queues a buffer
pub trait FrameAvailableListener: Send + Sync {
    fn on_frame_available(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Free,
    Dequeued,
    Queued,
    Acquired,
}

struct Shared {
    config: BufferQueueConfig,
    free: ArrayQueue<NativeBufferId>,
    queued: ArrayQueue<BufferItem>,
    states: Mutex<Vec<BufferState>>,
    listener: Mutex<Option<Arc<dyn FrameAvailableListener>>>,
    frame_number: AtomicU64,
    abandoned: AtomicBool,
}

impl Shared {
    fn transition(
        &self,
        id: NativeBufferId,
        from: BufferState,
        to: BufferState,
    ) -> Result<(), BridgeError> {
        let mut states = self.states.lock();
        match states.get_mut(id.0 as usize) {
            Some(state) if *state == from => {
                *state = to;
                Ok(())
            }
            _ => Err(BridgeError::NotDequeued(id.0)),
        }
    }

    fn recycle(&self, id: NativeBufferId) {
        // Every id has exactly one state, so the free list never overflows
        let _ = self.free.push(id);
    }
}

/// Create a queue with `config.buffer_count` buffers
pub fn create_buffer_queue(config: BufferQueueConfig) -> (BufferQueueProducer, BufferQueueConsumer) {
    let count = config.buffer_count.max(1);
    let free = ArrayQueue::new(count);
    for id in 0..count as u64 {
        let _ = free.push(NativeBufferId(id));
    }

    debug!(
        "Created buffer queue: {}x{} {:?}, {} buffers",
        config.width, config.height, config.format, count
    );

    let shared = Arc::new(Shared {
        config: BufferQueueConfig {
            buffer_count: count,
            ..config
        },
        free,
        queued: ArrayQueue::new(count),
        states: Mutex::new(vec![BufferState::Free; count]),
        listener: Mutex::new(None),
        frame_number: AtomicU64::new(0),
        abandoned: AtomicBool::new(false),
    });

    (
        BufferQueueProducer {
            shared: Arc::clone(&shared),
        },
        BufferQueueConsumer { shared },
    )
}

/// Producer end, handed to the camera device
#[derive(Clone)]
pub struct BufferQueueProducer {
    shared: Arc<Shared>,
}

impl BufferQueueProducer {
    pub fn config(&self) -> BufferQueueConfig {
        self.shared.config
    }

    /// Take a free buffer to fill; `None` when all buffers are in use
    pub fn dequeue_buffer(&self) -> Result<Option<NativeBufferId>, BridgeError> {
        if self.shared.abandoned.load(Ordering::Acquire) {
            return Err(BridgeError::Abandoned);
        }
        let Some(id) = self.shared.free.pop() else {
            return Ok(None);
        };
        self.shared
            .transition(id, BufferState::Free, BufferState::Dequeued)?;
        Ok(Some(id))
    }

    /// Hand a filled buffer to the consumer
    pub fn queue_buffer(
        &self,
        id: NativeBufferId,
        data: Bytes,
        timestamp_ns: i64,
    ) -> Result<(), BridgeError> {
        if self.shared.abandoned.load(Ordering::Acquire) {
            return Err(BridgeError::Abandoned);
        }
        self.shared
            .transition(id, BufferState::Dequeued, BufferState::Queued)?;

        let config = &self.shared.config;
        let item = BufferItem {
            buffer: GraphicBuffer {
                id,
                width: config.width,
                height: config.height,
                stride: config.width,
                format: config.format,
                data,
            },
            timestamp_ns,
            frame_number: self.shared.frame_number.fetch_add(1, Ordering::Relaxed),
        };
        // Only dequeued buffers get here, the queue has room for all of them
        let _ = self.shared.queued.push(item);
        trace!("Queued buffer {} at {} ns", id.0, timestamp_ns);

        let listener = self.shared.listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_frame_available();
        }
        Ok(())
    }

    /// Give a dequeued buffer back without queueing it
    pub fn cancel_buffer(&self, id: NativeBufferId) -> Result<(), BridgeError> {
        self.shared
            .transition(id, BufferState::Dequeued, BufferState::Free)?;
        self.shared.recycle(id);
        Ok(())
    }
}

/// Consumer end, drained by the bridge listener
#[derive(Clone)]
pub struct BufferQueueConsumer {
    shared: Arc<Shared>,
}

impl BufferQueueConsumer {
    pub fn config(&self) -> BufferQueueConfig {
        self.shared.config
    }

    /// Take the oldest queued buffer without blocking
    pub fn acquire_buffer(&self) -> Option<BufferItem> {
        let item = self.shared.queued.pop()?;
        let _ = self.shared.transition(
            item.buffer.id,
            BufferState::Queued,
            BufferState::Acquired,
        );
        Some(item)
    }

    /// Return an acquired buffer to the producer
    pub fn release_buffer(&self, id: NativeBufferId) -> Result<(), BridgeError> {
        self.shared
            .transition(id, BufferState::Acquired, BufferState::Free)?;
        self.shared.recycle(id);
        trace!("Released buffer {}", id.0);
        Ok(())
    }

    pub fn set_frame_available_listener(&self, listener: Option<Arc<dyn FrameAvailableListener>>) {
        *self.shared.listener.lock() = listener;
    }

    /// Number of buffers currently held by the consumer
    pub fn acquired_count(&self) -> usize {
        self.shared
            .states
            .lock()
            .iter()
            .filter(|&&state| state == BufferState::Acquired)
            .count()
    }

    /// Detach the producer and recycle everything still queued
    pub fn abandon(&self) {
        if self.shared.abandoned.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.shared.listener.lock() = None;
        while let Some(item) = self.shared.queued.pop() {
            let _ = self.shared.transition(
                item.buffer.id,
                BufferState::Queued,
                BufferState::Free,
            );
            self.shared.recycle(item.buffer.id);
        }
        debug!("Buffer queue abandoned");
    }
}
