//! Monotonic heap for the managed runtime
//!
//! The managed runtime's object, string and array allocations are carved
//! from the heap half of the stack-and-heap region set up at boot. Memory is
//! handed out zero-filled and never reclaimed.

#![no_std]

use core::ptr::NonNull;

/// Bump heap over a fixed extent
///
/// Allocations are contiguous and unaligned beyond what the caller's sizes
/// imply. A failed allocation leaves the heap pointer where it was.
pub struct BumpHeap<'a> {
    /// Start of the managed extent
    heap_start: usize,
    /// Unallocated tail of the extent; its start is the heap pointer
    remaining: &'a mut [u8],
}

impl<'a> BumpHeap<'a> {
    /// Create a heap over `region`
    pub fn new(region: &'a mut [u8]) -> Self {
        Self {
            heap_start: region.as_ptr() as usize,
            remaining: region,
        }
    }

    /// Create a heap over the raw range `[start, end)`
    ///
    /// # Safety
    /// The range must be mapped, writable, and used by nothing else for the
    /// lifetime of the process.
    pub unsafe fn from_raw_parts(start: usize, end: usize) -> BumpHeap<'static> {
        let len = end.saturating_sub(start);
        // SAFETY: the caller guarantees exclusive ownership of the range.
        let region = unsafe { core::slice::from_raw_parts_mut(start as *mut u8, len) };
        BumpHeap::new(region)
    }

    /// Allocate exactly `size` zero-filled bytes
    ///
    /// Returns `None` once `heap_ptr + size` would pass `heap_end`.
    pub fn allocate_zeroed(&mut self, size: usize) -> Option<&'a mut [u8]> {
        if size > self.remaining.len() {
            log::warn!(
                "allocate_zeroed: out of memory, heap_ptr={:#x}, size={}, heap_end={:#x}",
                self.heap_ptr(),
                size,
                self.heap_end()
            );
            return None;
        }

        let region = core::mem::take(&mut self.remaining);
        let (block, rest) = region.split_at_mut(size);
        self.remaining = rest;

        block.fill(0);
        Some(block)
    }

    /// Allocate and return a raw pointer, for the runtime's allocation hooks
    pub fn allocate_zeroed_ptr(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_zeroed(size)
            .map(|block| NonNull::from(block).cast::<u8>())
    }

    pub fn heap_start(&self) -> usize {
        self.heap_start
    }

    /// Next address to be handed out
    pub fn heap_ptr(&self) -> usize {
        self.remaining.as_ptr() as usize
    }

    pub fn heap_end(&self) -> usize {
        self.heap_ptr() + self.remaining.len()
    }

    /// Bytes handed out so far
    pub fn used(&self) -> usize {
        self.heap_ptr() - self.heap_start
    }

    pub fn available(&self) -> usize {
        self.remaining.len()
    }

    /// Log the heap range and current pointer
    pub fn log_status(&self) {
        log::info!(
            "heap: {:#x}~{:#x}, current_ptr: {:#x}",
            self.heap_start,
            self.heap_end(),
            self.heap_ptr()
        );
    }
}
