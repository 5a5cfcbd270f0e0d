//! Ownership bitmap backing a [`Resource`](crate::Resource)
//!
//! One bit per element, packed into `u64` chunks. The length is fixed at
//! creation; every index passed in must be below it.

use alloc::vec;
use alloc::vec::Vec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    chunks: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Create a bitmap of `len` bits, all clear
    pub fn new(len: usize) -> Self {
        Self {
            chunks: vec![0u64; len.div_ceil(64)],
            len,
        }
    }

    /// Number of bits
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_set(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        (self.chunks[index / 64] & (1u64 << (index % 64))) != 0
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.chunks[index / 64] |= 1u64 << (index % 64);
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.chunks[index / 64] &= !(1u64 << (index % 64));
    }

    pub fn set_range(&mut self, start: usize, len: usize) {
        for index in start..start + len {
            self.set(index);
        }
    }

    pub fn clear_range(&mut self, start: usize, len: usize) {
        for index in start..start + len {
            self.clear(index);
        }
    }

    /// True when `start..start + len` lies inside the bitmap and no bit in it
    /// is set
    pub fn range_is_clear(&self, start: usize, len: usize) -> bool {
        match start.checked_add(len) {
            Some(end) if end <= self.len => (start..end).all(|index| !self.is_set(index)),
            _ => false,
        }
    }

    /// First-fit search for `len` consecutive clear bits
    pub fn find_zero_area(&self, len: usize) -> Option<usize> {
        if len == 0 || len > self.len {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..self.len {
            if self.is_set(index) {
                run_len = 0;
                run_start = index + 1;
                continue;
            }
            run_len += 1;
            if run_len == len {
                return Some(run_start);
            }
        }
        None
    }

    /// Number of set bits
    pub fn count_set(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.count_ones() as usize).sum()
    }
}
