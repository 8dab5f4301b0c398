//! Physical block allocator
//!
//! Hands out naturally aligned, power-of-two sized runs of page-sized chunks
//! from an address-ordered free list. The list is an index arena rather than
//! links threaded through the free memory, so it works over memory the
//! allocator cannot address and can be checked in tests.
//!
//! Allocated blocks are zero-filled through a [`PhysWindow`].

use alloc::vec::Vec;
use core::ops::Range;

use l4_platform::PAGE_SIZE;

use crate::{CapabilityError, Result};

/// Granularity of the free list
pub const CHUNK_SIZE: usize = PAGE_SIZE;

/// Write access to the memory the allocator manages
pub trait PhysWindow {
    /// Zero `len` bytes starting at `addr`
    fn zero(&mut self, addr: usize, len: usize);
}

/// Window onto memory mapped at its own address
#[derive(Debug)]
pub struct DirectMap {
    _private: (),
}

impl DirectMap {
    /// # Safety
    /// Every range later passed to [`BlockAllocator::free`] must be mapped
    /// writable at its own address and owned by the allocator.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl PhysWindow for DirectMap {
    fn zero(&mut self, addr: usize, len: usize) {
        // SAFETY: guaranteed by the contract of `DirectMap::new`.
        unsafe { core::ptr::write_bytes(addr as *mut u8, 0, len) };
    }
}

/// Window onto an ordinary buffer standing in for the range at `base`
#[derive(Debug)]
pub struct BufferWindow<'a> {
    base: usize,
    bytes: &'a mut [u8],
}

impl<'a> BufferWindow<'a> {
    pub fn new(base: usize, bytes: &'a mut [u8]) -> Self {
        Self { base, bytes }
    }

    /// Address range the buffer stands in for
    pub fn range(&self) -> Range<usize> {
        self.base..self.base + self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &*self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }
}

impl PhysWindow for BufferWindow<'_> {
    fn zero(&mut self, addr: usize, len: usize) {
        let off = addr - self.base;
        self.bytes[off..off + len].fill(0);
    }
}

/// Free-list node: one free chunk
#[derive(Debug, Clone, Copy)]
struct ChunkNode {
    addr: usize,
    next: Option<usize>,
}

/// Address-ordered free list of page-sized chunks
pub struct BlockAllocator<M: PhysWindow> {
    /// Node arena; free nodes are listed in `spare`
    nodes: Vec<ChunkNode>,
    spare: Vec<usize>,
    /// Lowest free chunk
    head: Option<usize>,
    free_chunks: usize,
    memory: M,
}

impl<M: PhysWindow> BlockAllocator<M> {
    /// Allocator with nothing free
    pub fn empty(memory: M) -> Self {
        Self {
            nodes: Vec::new(),
            spare: Vec::new(),
            head: None,
            free_chunks: 0,
            memory,
        }
    }

    /// Allocator owning all of `range`
    pub fn new(range: Range<usize>, memory: M) -> Result<Self> {
        let mut allocator = Self::empty(memory);
        if !range.is_empty() {
            allocator.free(range.start, range.end - range.start)?;
        }
        Ok(allocator)
    }

    /// Return `[addr, addr + size)` to the free list
    ///
    /// Sizes below one chunk count as one chunk; otherwise only whole chunks
    /// are taken back. The region must not overlap anything already free.
    pub fn free(&mut self, addr: usize, size: usize) -> Result<()> {
        if addr % CHUNK_SIZE != 0 {
            return Err(CapabilityError::InvalidArgument("block address not chunk aligned"));
        }

        let pieces = size.max(CHUNK_SIZE) / CHUNK_SIZE;
        let span_end = addr
            .checked_add(pieces * CHUNK_SIZE)
            .ok_or(CapabilityError::InvalidArgument("block wraps the address space"))?;

        // Equal addresses go in front of the existing chunk; the overlap
        // check below rejects them anyway.
        let mut prev: Option<usize> = None;
        let mut cur = self.head;
        while let Some(i) = cur {
            if self.nodes[i].addr > addr {
                break;
            }
            prev = Some(i);
            cur = self.nodes[i].next;
        }

        let below_overlaps = prev.is_some_and(|p| self.nodes[p].addr + CHUNK_SIZE > addr);
        let above_overlaps = cur.is_some_and(|c| self.nodes[c].addr < span_end);
        if below_overlaps || above_overlaps {
            log::warn!("block_alloc: free of {:#x}+{:#x} overlaps free memory", addr, size);
            return Err(CapabilityError::OverlappingFree { addr, size });
        }

        let mut next = cur;
        for k in (0..pieces).rev() {
            next = Some(self.push_node(addr + k * CHUNK_SIZE, next));
        }
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }

        self.free_chunks += pieces;
        log::debug!("block_alloc: freed {:#x}~{:#x}", addr, span_end);
        Ok(())
    }

    /// Allocate a zero-filled block of at least `size` bytes
    ///
    /// The block is `max(size, CHUNK_SIZE)` rounded up to a power of two and
    /// aligned to its own size. The lowest suitable run wins.
    pub fn alloc(&mut self, size: usize) -> Result<usize> {
        let block = size
            .max(CHUNK_SIZE)
            .checked_next_power_of_two()
            .ok_or(CapabilityError::OutOfMemory { requested: size })?;
        let count = block / CHUNK_SIZE;

        let mut prev: Option<usize> = None;
        let mut cur = self.head;
        while let Some(i) = cur {
            let base = self.nodes[i].addr;
            if base & (block - 1) == 0 {
                if let Some(after) = self.run_end(i, count) {
                    match prev {
                        Some(p) => self.nodes[p].next = after,
                        None => self.head = after,
                    }
                    self.recycle(i, count);
                    self.free_chunks -= count;

                    self.memory.zero(base, block);
                    log::debug!("block_alloc: allocated {:#x}+{:#x}", base, block);
                    return Ok(base);
                }
            }
            prev = Some(i);
            cur = self.nodes[i].next;
        }

        log::warn!(
            "block_alloc: no aligned run for {} bytes ({} chunks free)",
            block,
            self.free_chunks
        );
        Err(CapabilityError::OutOfMemory { requested: size })
    }

    /// Number of free chunks
    pub fn free_chunks(&self) -> usize {
        self.free_chunks
    }

    pub fn free_bytes(&self) -> usize {
        self.free_chunks * CHUNK_SIZE
    }

    /// Free chunk addresses in list order
    pub fn chunks(&self) -> impl Iterator<Item = usize> + '_ {
        core::iter::successors(self.head, |&i| self.nodes[i].next).map(|i| self.nodes[i].addr)
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// If `count` chunks starting at node `first` are contiguous, the link
    /// that follows them
    fn run_end(&self, first: usize, count: usize) -> Option<Option<usize>> {
        let base = self.nodes[first].addr;
        let mut node = first;
        for k in 1..count {
            let next = self.nodes[node].next?;
            if self.nodes[next].addr != base + k * CHUNK_SIZE {
                return None;
            }
            node = next;
        }
        Some(self.nodes[node].next)
    }

    fn recycle(&mut self, first: usize, count: usize) {
        let mut node = Some(first);
        for _ in 0..count {
            let Some(i) = node else { break };
            node = self.nodes[i].next;
            self.spare.push(i);
        }
    }

    fn push_node(&mut self, addr: usize, next: Option<usize>) -> usize {
        let node = ChunkNode { addr, next };
        match self.spare.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }
}
