//! Thread-local storage descriptor tables
//!
//! Each task with an active thread-local store owns one table of
//! [`GDT_ENTRY_TLS_ENTRIES`] descriptors, carved from a one-page slab. A
//! `set_thread_area` request rewrites one entry of the table and reloads the
//! whole table into the calling thread's GDT slots.

use core::ops::RangeInclusive;

use l4_platform::{CapIdx, Microkernel, PAGE_SIZE};
use static_assertions::const_assert;

use crate::descriptor::{SegmentDescriptor, UserDesc, GDT_ENTRY_TLS_ENTRIES, LDT_ENTRY_SIZE};
use crate::{rejected, CapabilityError, Result};

/// Size of one slab slot
pub const TLS_SLAB_SLOT_SIZE: usize = 256;

/// Slots in the slab page
pub const TLS_SLAB_SLOTS: usize = PAGE_SIZE / TLS_SLAB_SLOT_SIZE;

const_assert!(GDT_ENTRY_TLS_ENTRIES * LDT_ENTRY_SIZE <= TLS_SLAB_SLOT_SIZE);
const_assert!(TLS_SLAB_SLOTS <= u8::MAX as usize);

/// One task's thread-local descriptors
pub type DescriptorTable = [SegmentDescriptor; GDT_ENTRY_TLS_ENTRIES];

/// Ownership of one slab slot
///
/// Not `Clone`: freeing consumes the handle, so a table cannot be freed
/// twice or used after it went back to the slab.
#[derive(Debug, PartialEq, Eq)]
pub struct TableHandle(u8);

impl TableHandle {
    /// Slot index inside the slab
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Fixed pool of descriptor tables
#[derive(Debug)]
pub struct TlsSlab {
    tables: [DescriptorTable; TLS_SLAB_SLOTS],
    next: [Option<u8>; TLS_SLAB_SLOTS],
    head: Option<u8>,
    available: usize,
}

impl Default for TlsSlab {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsSlab {
    /// Slab with every slot free, lowest slot first
    pub fn new() -> Self {
        let mut next = [None; TLS_SLAB_SLOTS];
        for (i, link) in next.iter_mut().enumerate().take(TLS_SLAB_SLOTS - 1) {
            *link = Some(i as u8 + 1);
        }

        Self {
            tables: [[SegmentDescriptor::EMPTY; GDT_ENTRY_TLS_ENTRIES]; TLS_SLAB_SLOTS],
            next,
            head: Some(0),
            available: TLS_SLAB_SLOTS,
        }
    }

    /// Take a slot; its table starts out all empty
    pub fn alloc_table(&mut self) -> Result<TableHandle> {
        let Some(slot) = self.head else {
            log::warn!("tls: descriptor slab exhausted");
            return Err(CapabilityError::TlsSlabExhausted);
        };

        let i = slot as usize;
        self.head = self.next[i].take();
        self.tables[i] = [SegmentDescriptor::EMPTY; GDT_ENTRY_TLS_ENTRIES];
        self.available -= 1;
        Ok(TableHandle(slot))
    }

    /// Return a slot
    pub fn free_table(&mut self, table: TableHandle) {
        let i = table.index();
        self.tables[i] = [SegmentDescriptor::EMPTY; GDT_ENTRY_TLS_ENTRIES];
        self.next[i] = self.head;
        self.head = Some(table.0);
        self.available += 1;
    }

    pub fn table(&self, table: &TableHandle) -> &DescriptorTable {
        &self.tables[table.index()]
    }

    fn table_mut(&mut self, table: &TableHandle) -> &mut DescriptorTable {
        &mut self.tables[table.index()]
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.available
    }
}

/// Thread-area requests against the kernel's GDT
pub struct TlsManager<'k, K: Microkernel> {
    kernel: &'k K,
    slab: TlsSlab,
    /// First GDT entry of the thread-local range
    entry_min: usize,
}

impl<'k, K: Microkernel> TlsManager<'k, K> {
    /// Query the thread-local GDT range from the kernel
    pub fn new(kernel: &'k K) -> Result<Self> {
        let entry_min = kernel
            .gdt_entry_offset(kernel.main_thread())
            .map_err(rejected("gdt_entry_offset"))?;
        log::debug!(
            "tls: entries {}..={}",
            entry_min,
            entry_min + GDT_ENTRY_TLS_ENTRIES - 1
        );

        Ok(Self {
            kernel,
            slab: TlsSlab::new(),
            entry_min,
        })
    }

    /// GDT entry numbers a table covers
    pub fn entry_range(&self) -> RangeInclusive<usize> {
        self.entry_min..=self.entry_min + GDT_ENTRY_TLS_ENTRIES - 1
    }

    pub fn alloc_table(&mut self) -> Result<TableHandle> {
        self.slab.alloc_table()
    }

    pub fn free_table(&mut self, table: TableHandle) {
        self.slab.free_table(table)
    }

    pub fn table(&self, table: &TableHandle) -> &DescriptorTable {
        self.slab.table(table)
    }

    pub fn slab(&self) -> &TlsSlab {
        &self.slab
    }

    /// Set one thread-local segment and reload the table into `thread`
    ///
    /// `idx` of -1 means the request's own `entry_number`; if that is -1 too
    /// and `can_allocate` is set, the first empty entry is picked and written
    /// back into `info.entry_number`.
    pub fn set_thread_area(
        &mut self,
        thread: CapIdx,
        table: &TableHandle,
        mut idx: i32,
        info: &mut UserDesc,
        can_allocate: bool,
    ) -> Result<()> {
        if idx == -1 {
            idx = info.entry_number;
        }

        if idx == -1 && can_allocate {
            idx = self.free_entry(table)?;
            info.entry_number = idx;
        }

        let range = self.entry_range();
        let entry = usize::try_from(idx)
            .ok()
            .filter(|e| range.contains(e))
            .ok_or(CapabilityError::InvalidTlsIndex {
                index: idx,
                min: *range.start(),
                max: *range.end(),
            })?;

        let desc = if info.is_empty() {
            SegmentDescriptor::EMPTY
        } else {
            SegmentDescriptor::encode(info)
        };
        self.slab.table_mut(table)[entry - self.entry_min] = desc;

        self.load(thread, table)
    }

    /// First empty entry, as a GDT entry number
    fn free_entry(&self, table: &TableHandle) -> Result<i32> {
        self.slab
            .table(table)
            .iter()
            .position(SegmentDescriptor::is_empty)
            .map(|i| (self.entry_min + i) as i32)
            .ok_or(CapabilityError::NoFreeTlsEntry)
    }

    /// Install the whole table into the thread's GDT slots
    fn load(&self, thread: CapIdx, table: &TableHandle) -> Result<()> {
        let mut bytes = [0u8; GDT_ENTRY_TLS_ENTRIES * LDT_ENTRY_SIZE];
        for (chunk, desc) in bytes
            .chunks_exact_mut(LDT_ENTRY_SIZE)
            .zip(self.slab.table(table))
        {
            chunk.copy_from_slice(&desc.to_bytes());
        }

        self.kernel
            .gdt_set(thread, &bytes, 0)
            .map_err(rejected("gdt_set"))
    }
}
