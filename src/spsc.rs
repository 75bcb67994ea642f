//! Single-producer single-consumer lock-free ring queue.
//!
//! Moves ownership of items from the strategy thread to a worker thread
//! with minimal overhead. Power-of-two capacity with atomic head/tail on
//! separate cache lines; a failed push returns the item untouched.
//!
//! # Memory ordering protocol
//!
//! Producer: load `head` Relaxed (sole writer), load `tail` Acquire
//! (synchronises with consumer), write slot, store `head` Release
//! (publishes the write). Consumer mirrors it: load `tail` Relaxed,
//! load `head` Acquire, read slot, store `tail` Release. `len`/`is_empty`
//! are approximate from either side.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

struct RingBuffer<T> {
    /// Producer index (next write position).
    head: CachePadded<AtomicUsize>,
    /// Consumer index (next read position).
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    capacity: usize,
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// One producer and one consumer may touch the buffer concurrently; the
// head/tail protocol guarantees they never alias the same slot.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        // Round up to a power of two for bitwise masking; one slot stays
        // empty to distinguish full from empty.
        let capacity = capacity.max(2).next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
            capacity,
            buffer,
        }
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & self.mask
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        // Drain whatever the consumer never popped.
        let mut tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        while tail != head {
            unsafe {
                (*self.buffer[tail & self.mask].get()).assume_init_drop();
            }
            tail = tail.wrapping_add(1);
        }
    }
}

/// Producer half. Not cloneable: exactly one producer thread may push.
pub struct Producer<T> {
    ring: Arc<RingBuffer<T>>,
}

/// Consumer half. Not cloneable: exactly one consumer thread may pop.
pub struct Consumer<T> {
    ring: Arc<RingBuffer<T>>,
}

unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Send for Consumer<T> {}

/// Create a bounded SPSC queue. Capacity is rounded up to a power of two;
/// usable capacity is one less than the rounded value.
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let ring = Arc::new(RingBuffer::new(capacity));
    (
        Producer { ring: ring.clone() },
        Consumer { ring },
    )
}

impl<T> Producer<T> {
    /// Enqueue an item. On a full queue the item is handed back unchanged.
    pub fn push(&self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let next_head = head.wrapping_add(1);

        if next_head & ring.mask == ring.tail.load(Ordering::Acquire) & ring.mask {
            return Err(item);
        }

        unsafe {
            (*ring.buffer[head & ring.mask].get()).write(item);
        }
        ring.head.store(next_head, Ordering::Release);
        Ok(())
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl<T> Consumer<T> {
    /// Dequeue an item, or `None` when the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);

        if tail == ring.head.load(Ordering::Acquire) {
            return None;
        }

        let item = unsafe { (*ring.buffer[tail & ring.mask].get()).assume_init_read() };
        ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Usable slot count.
    pub fn capacity(&self) -> usize {
        self.ring.capacity - 1
    }
}
