//! Fixed-size pool of reusable frame slots carved from one contiguous heap

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossbeam::utils::CachePadded;
use metrics::counter;
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::{debug, trace};

use crate::error::PoolError;

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(1);

/// One fixed-size region of a pool's heap.
///
/// Slots are owned values: whoever holds one has exclusive access to its
/// bytes until it goes back through [`FrameBufferPool::release`].
pub struct FrameSlot {
    heap_id: u32,
    index: u32,
    data: BytesMut,
}

impl FrameSlot {
    pub fn heap_id(&self) -> u32 {
        self.heap_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSlot")
            .field("heap_id", &self.heap_id)
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Bounded set of slots with a blocking, time-limited acquire
pub struct FrameBufferPool {
    heap_id: u32,
    slot_size: usize,
    slot_count: usize,

    /// Available slots; guarded separately from any session state
    free: Mutex<HeapRb<FrameSlot>>,
    available: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    acquired: AtomicUsize,
    released: AtomicUsize,
    exhausted: AtomicUsize,
}

impl FrameBufferPool {
    /// Allocate `slot_count` slots of `slot_size` bytes from one backing region
    pub fn new(slot_size: usize, slot_count: usize) -> Result<Self, PoolError> {
        let total = slot_size
            .checked_mul(slot_count)
            .filter(|&total| slot_size > 0 && slot_count > 0 && total <= isize::MAX as usize)
            .ok_or(PoolError::Allocation {
                slot_size,
                slot_count,
            })?;
        let index_limit = u32::try_from(slot_count).map_err(|_| PoolError::Allocation {
            slot_size,
            slot_count,
        })?;

        let mut region = Vec::<u8>::new();
        region
            .try_reserve_exact(total)
            .map_err(|_| PoolError::Allocation {
                slot_size,
                slot_count,
            })?;
        region.resize(total, 0);
        let mut heap = BytesMut::from(Bytes::from(region));

        let heap_id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        let mut free = HeapRb::new(slot_count);
        for index in 0..index_limit {
            let slot = FrameSlot {
                heap_id,
                index,
                data: heap.split_to(slot_size),
            };
            // Capacity equals slot_count, the push cannot fail
            let _ = free.try_push(slot);
        }

        debug!(
            "Allocated heap {} with {} slots of {} bytes",
            heap_id, slot_count, slot_size
        );

        Ok(Self {
            heap_id,
            slot_size,
            slot_count,
            free: Mutex::new(free),
            available: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        })
    }

    pub fn heap_id(&self) -> u32 {
        self.heap_id
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Number of slots currently available
    pub fn available(&self) -> usize {
        self.free.lock().occupied_len()
    }

    /// Number of slots currently handed out
    pub fn in_use(&self) -> usize {
        self.slot_count - self.available()
    }

    /// Take a slot without blocking
    pub fn acquire(&self) -> Option<FrameSlot> {
        let slot = self.free.lock().try_pop();
        if slot.is_some() {
            self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        }
        slot
    }

    /// Take a slot, waiting up to `timeout` for one to be released
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<FrameSlot> {
        let deadline = Instant::now() + timeout;
        let mut free = self.free.lock();
        loop {
            if let Some(slot) = free.try_pop() {
                self.stats.acquired.fetch_add(1, Ordering::Relaxed);
                return Some(slot);
            }
            if self.available.wait_until(&mut free, deadline).timed_out() {
                if let Some(slot) = free.try_pop() {
                    self.stats.acquired.fetch_add(1, Ordering::Relaxed);
                    return Some(slot);
                }
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                counter!("camsource.pool_exhausted").increment(1);
                trace!("Heap {} exhausted after {:?}", self.heap_id, timeout);
                return None;
            }
        }
    }

    /// Return a slot and wake one waiter
    pub fn release(&self, slot: FrameSlot) -> Result<(), PoolError> {
        if slot.heap_id != self.heap_id {
            return Err(PoolError::HeapMismatch {
                got: slot.heap_id,
                expected: self.heap_id,
            });
        }
        let index = slot.index;
        self.free
            .lock()
            .try_push(slot)
            .map_err(|_| PoolError::Overflow(index))?;
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
        Ok(())
    }

    /// (acquired, released, exhausted)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.acquired.load(Ordering::Relaxed),
            self.stats.released.load(Ordering::Relaxed),
            self.stats.exhausted.load(Ordering::Relaxed),
        )
    }
}

impl fmt::Debug for FrameBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBufferPool")
            .field("heap_id", &self.heap_id)
            .field("slot_size", &self.slot_size)
            .field("slot_count", &self.slot_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_partition() {
        let pool = FrameBufferPool::new(16, 4).unwrap();
        assert_eq!(pool.available(), 4);

        let mut indices = Vec::new();
        let mut slots = Vec::new();
        while let Some(slot) = pool.acquire() {
            assert_eq!(slot.len(), 16);
            assert_eq!(slot.heap_id(), pool.heap_id());
            indices.push(slot.index());
            slots.push(slot);
        }
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(pool.in_use(), 4);

        for slot in slots {
            pool.release(slot).unwrap();
        }
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(matches!(
            FrameBufferPool::new(0, 4),
            Err(PoolError::Allocation { .. })
        ));
        assert!(matches!(
            FrameBufferPool::new(usize::MAX, 2),
            Err(PoolError::Allocation { .. })
        ));
    }

    #[test]
    fn test_refused_allocation() {
        // Fits in isize but no allocator will hand out an exabyte
        assert_eq!(
            FrameBufferPool::new(1 << 40, 1 << 20).unwrap_err(),
            PoolError::Allocation {
                slot_size: 1 << 40,
                slot_count: 1 << 20,
            }
        );
    }

    #[test]
    fn test_foreign_slot_rejected() {
        let a = FrameBufferPool::new(8, 1).unwrap();
        let b = FrameBufferPool::new(8, 1).unwrap();
        assert_ne!(a.heap_id(), b.heap_id());

        let slot = a.acquire().unwrap();
        let err = b.release(slot).unwrap_err();
        assert_eq!(
            err,
            PoolError::HeapMismatch {
                got: a.heap_id(),
                expected: b.heap_id()
            }
        );
    }

    #[test]
    fn test_acquire_timeout_expires() {
        let pool = FrameBufferPool::new(8, 1).unwrap();
        let _held = pool.acquire().unwrap();
        let start = Instant::now();
        assert!(pool.acquire_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(pool.stats().2, 1);
    }

    #[test]
    fn test_release_wakes_waiter() {
        let pool = Arc::new(FrameBufferPool::new(8, 1).unwrap());
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(held).unwrap();

        let slot = waiter.join().unwrap();
        assert!(slot.is_some());
    }

    #[test]
    fn test_slots_are_disjoint() {
        let pool = FrameBufferPool::new(4, 2).unwrap();
        let mut a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        a.as_mut_slice().fill(0xff);
        assert!(b.as_slice().iter().all(|&byte| byte == 0));
    }

    proptest! {
        #[test]
        fn prop_in_use_never_exceeds_total(
            slot_count in 1usize..8,
            ops in proptest::collection::vec(any::<bool>(), 0..64),
        ) {
            let pool = FrameBufferPool::new(4, slot_count).unwrap();
            let mut held = Vec::new();
            let mut acquires = 0usize;
            let mut releases = 0usize;

            for acquire in ops {
                if acquire {
                    if let Some(slot) = pool.acquire() {
                        acquires += 1;
                        held.push(slot);
                    }
                } else if let Some(slot) = held.pop() {
                    pool.release(slot).unwrap();
                    releases += 1;
                }
                prop_assert!(acquires <= releases + slot_count);
                prop_assert_eq!(pool.in_use(), held.len());
                prop_assert_eq!(pool.available() + held.len(), slot_count);
            }
        }
    }
}
