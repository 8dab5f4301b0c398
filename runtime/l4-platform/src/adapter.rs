//! Microkernel Adapter Layer
//!
//! The kernel services the capability core consumes, expressed as one trait.
//! Every call is synchronous: the caller blocks until the kernel replies, and
//! no call can be cancelled once issued.
//!
//! Methods take `&self`. Kernel invocations carry no Rust-visible state, and
//! the capability core only ever drives them from one management thread.

use crate::types::*;

/// Kernel services used by the capability and thread-lifecycle core
pub trait Microkernel {
    // ========== Environment ==========

    /// The calling process's main thread
    fn main_thread(&self) -> CapIdx;

    /// Look up a named capability handed over by the loader
    ///
    /// Returns [`CapIdx::INVALID`] when the name is unknown.
    fn env_cap(&self, name: &str) -> CapIdx;

    // ========== Factory ==========

    /// Materialize a task in `slot` with its UTCB area described by `utcb_area`
    fn create_task(&self, slot: CapIdx, utcb_area: Fpage) -> KResult<()>;

    /// Materialize a thread in `slot`
    fn create_thread(&self, slot: CapIdx) -> KResult<()>;

    /// Materialize an IPC gate in `slot` bound to `thread`, delivering `label`
    fn create_gate(&self, slot: CapIdx, thread: CapIdx, label: Word) -> KResult<()>;

    /// Bind an existing gate to a receiving thread
    fn gate_bind_thread(&self, gate: CapIdx, thread: CapIdx, label: Word) -> KResult<()>;

    // ========== Task ==========

    /// Map an object capability of the calling task into `dest_task`
    fn map_object(&self, dest_task: CapIdx, object: Fpage) -> KResult<()>;

    /// Unmap `object` from the calling task and delete the kernel object
    fn delete_object(&self, object: CapIdx) -> KResult<()>;

    /// Unmap a batch of flexpages from `task`, from all address spaces
    ///
    /// At most [`MSG_REGS`]` - 2` flexpages fit in one call.
    fn unmap_batch(&self, task: CapIdx, fpages: &[Fpage]) -> KResult<()>;

    // ========== Thread ==========

    /// Commit pager, exception handler and address-space binding atomically
    fn thread_control(&self, thread: CapIdx, control: &ThreadControl) -> KResult<()>;

    /// Set instruction and stack pointer, resuming the thread
    fn thread_ex_regs(&self, thread: CapIdx, ip: Word, sp: Word) -> KResult<()>;

    /// Apply scheduling parameters to a thread
    fn run_thread(&self, thread: CapIdx, param: SchedParam) -> KResult<()>;

    /// First GDT entry number available for thread-local segments
    fn gdt_entry_offset(&self, thread: CapIdx) -> KResult<usize>;

    /// Install packed segment descriptors into the thread's GDT slots
    ///
    /// `descriptors` is a whole number of 8-byte descriptors, installed
    /// starting at entry `first` of the thread-local range.
    fn gdt_set(&self, thread: CapIdx, descriptors: &[u8], first: usize) -> KResult<()>;

    /// Attach a debug name to a kernel object
    fn set_object_name(&self, object: CapIdx, name: &str) -> KResult<()>;

    // ========== Memory ==========

    /// Allocate `size` bytes of backing memory as a dataspace in `ds`
    fn mem_alloc(&self, size: usize, ds: CapIdx, flags: AllocFlags) -> KResult<()>;

    /// Attach a dataspace into the local address space
    ///
    /// With [`AttachFlags::SEARCH_ADDR`] the kernel picks an address aligned to
    /// `1 << align`. Returns the start address.
    fn rm_attach(
        &self,
        size: usize,
        flags: AttachFlags,
        ds: CapIdx,
        offset: usize,
        align: usize,
    ) -> KResult<Word>;

    /// Reserve an address range without backing it
    fn rm_reserve_area(
        &self,
        addr: Word,
        size: usize,
        flags: AttachFlags,
        align: usize,
    ) -> KResult<Word>;

    // ========== IPC ==========

    /// Block for an incoming message
    ///
    /// `buffers` are the pre-armed buffer registers; on return each holds the
    /// capability received for that item, or [`CapIdx::INVALID`].
    fn ipc_wait(&self, buffers: &mut [BufferItem], timeout: Timeout) -> KResult<Message>;
}

// ========== Helper Functions ==========

/// Map a raw kernel return code to a result
#[inline]
pub fn check(code: i32) -> KResult<()> {
    match KernelError::from_code(code) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

#[inline]
pub fn is_ok(code: i32) -> bool {
    check(code).is_ok()
}

#[inline]
pub fn is_err(code: i32) -> bool {
    !is_ok(code)
}
