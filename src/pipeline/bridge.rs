//! Buffer queue bridge: owns the queue and the thread that drains it

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use metrics::counter;
use tracing::{debug, info, trace, warn};

use crate::error::BridgeError;
use crate::pipeline::buffer_queue::{
    create_buffer_queue, BufferItem, BufferQueueConfig, BufferQueueConsumer, BufferQueueProducer,
    FrameAvailableListener, NativeBufferId,
};

/// Lifecycle of a [`BufferQueueBridge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

/// Coalesces frame-available notifications into a single pending wakeup
struct FrameSignal(Sender<()>);

impl FrameAvailableListener for FrameSignal {
    fn on_frame_available(&self) {
        let _ = self.0.try_send(());
    }
}

pub struct BufferQueueBridge {
    state: BridgeState,
    frame_available_timeout: Duration,
    consumer: Option<BufferQueueConsumer>,
    signal: Option<Receiver<()>>,
    exit: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl BufferQueueBridge {
    pub fn new(frame_available_timeout: Duration) -> Self {
        Self {
            state: BridgeState::Uninitialized,
            frame_available_timeout,
            consumer: None,
            signal: None,
            exit: Arc::new(AtomicBool::new(false)),
            listener: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Create the queue and return its producer end
    pub fn initialize(
        &mut self,
        config: BufferQueueConfig,
    ) -> Result<BufferQueueProducer, BridgeError> {
        if self.consumer.is_some() {
            return Err(BridgeError::AlreadyExists);
        }

        let (producer, consumer) = create_buffer_queue(config);
        let (tx, rx) = flume::bounded(1);
        consumer.set_frame_available_listener(Some(Arc::new(FrameSignal(tx))));

        self.consumer = Some(consumer);
        self.signal = Some(rx);
        self.exit.store(false, Ordering::Release);
        self.state = BridgeState::Initialized;
        Ok(producer)
    }

    pub fn consumer(&self) -> Option<&BufferQueueConsumer> {
        self.consumer.as_ref()
    }

    /// Spawn the listener thread; every drained item goes through `process`
    pub fn start<F>(&mut self, mut process: F) -> Result<(), BridgeError>
    where
        F: FnMut(BufferItem) + Send + 'static,
    {
        match self.state {
            BridgeState::Initialized => {}
            BridgeState::Running => return Err(BridgeError::AlreadyRunning),
            BridgeState::Uninitialized | BridgeState::Stopped => {
                return Err(BridgeError::NotInitialized)
            }
        }
        let (Some(consumer), Some(signal)) = (self.consumer.clone(), self.signal.clone()) else {
            return Err(BridgeError::NotInitialized);
        };

        let exit = Arc::clone(&self.exit);
        let timeout = self.frame_available_timeout;
        let handle = thread::Builder::new()
            .name("camsource-bq".into())
            .spawn(move || {
                debug!("Buffer queue listener started");
                loop {
                    // Drain everything that is ready
                    while !exit.load(Ordering::Acquire) {
                        match consumer.acquire_buffer() {
                            Some(item) => {
                                trace!("Acquired buffer {}", item.buffer.id.0);
                                process(item);
                            }
                            None => break,
                        }
                    }
                    if exit.load(Ordering::Acquire) {
                        break;
                    }
                    match signal.recv_timeout(timeout) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Buffer queue listener exiting");
            })
            .map_err(|e| BridgeError::Spawn(e.to_string()))?;

        self.listener = Some(handle);
        self.state = BridgeState::Running;
        info!("Buffer queue listener running");
        Ok(())
    }

    /// Stop and join the listener, then release the queue
    pub fn stop(&mut self) {
        self.exit.store(true, Ordering::Release);
        if let Some(handle) = self.listener.take() {
            if handle.join().is_err() {
                warn!("Buffer queue listener panicked");
            }
        }
        if let Some(consumer) = self.consumer.take() {
            consumer.abandon();
        }
        self.signal = None;
        if self.state != BridgeState::Uninitialized {
            self.state = BridgeState::Stopped;
        }
    }
}

impl Drop for BufferQueueBridge {
    fn drop(&mut self) {
        if self.listener.is_some() {
            self.stop();
        }
    }
}

/// Queue items lent to the consumer, keyed by native buffer
#[derive(Debug, Default)]
pub struct BufferItemMap {
    items: HashMap<NativeBufferId, BufferItem>,
}

impl BufferItemMap {
    pub fn insert(&mut self, item: BufferItem) {
        if let Some(previous) = self.items.insert(item.buffer.id, item) {
            warn!(
                "Buffer {} was still mapped (frame {})",
                previous.buffer.id.0, previous.frame_number
            );
        }
    }

    pub fn get(&self, id: NativeBufferId) -> Option<&BufferItem> {
        self.items.get(&id)
    }

    /// Remove the item for `id`; when it is missing fall back to the item
    /// whose timestamp is closest to `timestamp_ns`.
    pub fn take(&mut self, id: NativeBufferId, timestamp_ns: i64) -> Option<BufferItem> {
        if let Some(item) = self.items.remove(&id) {
            return Some(item);
        }

        let nearest = self
            .items
            .iter()
            .min_by_key(|(_, item)| item.timestamp_ns.abs_diff(timestamp_ns))
            .map(|(&key, _)| key)?;
        let item = self.items.remove(&nearest)?;
        warn!(
            "No buffer item for buffer {} at {} ns, using buffer {} at {} ns",
            id.0, timestamp_ns, item.buffer.id.0, item.timestamp_ns
        );
        counter!("camsource.buffer_map_nearest_match").increment(1);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = BufferItem> + '_ {
        self.items.drain().map(|(_, item)| item)
    }
}
