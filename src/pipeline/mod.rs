pub mod bridge;
pub mod buffer_queue;
pub mod pool;

pub use bridge::{BridgeState, BufferItemMap, BufferQueueBridge};
pub use buffer_queue::{
    create_buffer_queue, BufferItem, BufferQueueConfig, BufferQueueConsumer, BufferQueueProducer,
    GraphicBuffer, NativeBufferId,
};
pub use pool::{FrameBufferPool, FrameSlot};
