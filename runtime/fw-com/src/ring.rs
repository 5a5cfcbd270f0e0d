//! Lock-free single-producer/single-consumer ring with owned ends

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{ComError, Result};

/// Fixed-size record ring in memory shared with the firmware
///
/// `N` must be a power of two. One slot stays unused so a full ring can be
/// told from an empty one, leaving `N - 1` usable slots.
///
/// The ring itself has no public push or pop. [`SharedRing::split`] hands
/// out exactly one [`Producer`] and one [`Consumer`], and both mutate
/// through `&mut self`.
#[repr(C)]
pub struct SharedRing<T: Copy, const N: usize> {
    buffer: UnsafeCell<[T; N]>,
    /// Next slot the producer fills
    head: AtomicUsize,
    /// Next slot the consumer drains
    tail: AtomicUsize,
}

// Slots between tail and head belong to the consumer, the rest to the
// producer, and each end exists once
unsafe impl<T: Copy + Send, const N: usize> Sync for SharedRing<T, N> {}

impl<T: Copy + Default, const N: usize> SharedRing<T, N> {
    /// Create an empty ring
    ///
    /// # Panics
    /// If `N` is not a power of two
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "ring capacity must be a power of two");

        Self {
            buffer: UnsafeCell::new([T::default(); N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }
}

impl<T: Copy + Default, const N: usize> Default for SharedRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize> SharedRing<T, N> {
    /// Consume the ring and return its only two ends
    pub fn split(self) -> (Producer<T, N>, Consumer<T, N>) {
        let ring = Arc::new(self);
        (Producer { ring: ring.clone() }, Consumer { ring })
    }

    /// Only called through the unique `Producer`
    fn push(&self, item: T) -> Result<()> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if (head + 1) % N == tail {
            return Err(ComError::QueueFull { capacity: N });
        }

        unsafe {
            let slot = (self.buffer.get() as *mut T).add(head);
            core::ptr::write_volatile(slot, item);
        }

        // Publishes the record before the index
        self.head.store((head + 1) % N, Ordering::Release);
        Ok(())
    }

    /// Only called through the unique `Consumer`
    fn pop(&self) -> Result<T> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);

        if head == tail {
            return Err(ComError::QueueEmpty);
        }

        let item = unsafe {
            let slot = (self.buffer.get() as *const T).add(tail);
            core::ptr::read_volatile(slot)
        };

        self.tail.store((tail + 1) % N, Ordering::Release);
        Ok(item)
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + N - tail) % N
    }
}

/// Write end of a ring
pub struct Producer<T: Copy, const N: usize> {
    ring: Arc<SharedRing<T, N>>,
}

impl<T: Copy, const N: usize> Producer<T, N> {
    /// # Errors
    /// `ComError::QueueFull` if the consumer has not caught up
    pub fn push(&mut self, item: T) -> Result<()> {
        self.ring.push(item)
    }

    pub fn is_full(&self) -> bool {
        self.ring.len() == N - 1
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}

/// Read end of a ring
pub struct Consumer<T: Copy, const N: usize> {
    ring: Arc<SharedRing<T, N>>,
}

impl<T: Copy, const N: usize> Consumer<T, N> {
    /// # Errors
    /// `ComError::QueueEmpty` if nothing is queued
    pub fn pop(&mut self) -> Result<T> {
        self.ring.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.len() == 0
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}
