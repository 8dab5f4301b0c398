//! Capability Broker - capability and thread-lifecycle core
//!
//! # Purpose
//! Owns every kernel object the managed environment creates on top of the
//! L4 microkernel: capability slots, physical blocks, thread-local segment
//! descriptors, tasks and threads, and the memory regions negotiated with the
//! companion OS at boot.
//!
//! # Integration Points
//! - Depends on: the [`Microkernel`] interface from `l4-platform`
//! - Provides to: the managed runtime glue (boot parameters, heap, threads)
//! - IPC endpoints: one gate per thread, plus the process's own pager gate
//! - Capabilities required: main thread, `linux_server` and `vandroid` gates
//!
//! # Architecture
//! [`init`] runs once on the management thread. It binds the pager gate,
//! builds the [`TlsManager`], negotiates memory through [`Bootstrap`] and hands
//! back a [`System`] whose [`BootContext`] is immutable from then on. All later
//! kernel-object churn goes through the [`LifecycleManager`], which owns the
//! [`CapSlotPool`].
//!
//! # Testing Strategy
//! - Unit tests: slot pool, block allocator, descriptor codec, TLS slab
//! - Integration tests: boot sequence and thread lifecycle against the mock
//!   kernel, with failures injected at every kernel step

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

use l4_platform::{KernelError, Microkernel, SchedParam};
use thiserror::Error;

mod block_alloc;
mod boot;
mod cspace;
mod descriptor;
mod flush;
mod lifecycle;
mod shared;
mod tls;

pub use block_alloc::{BlockAllocator, BufferWindow, DirectMap, PhysWindow, CHUNK_SIZE};
pub use boot::{BootConfig, BootContext, BootParams, Bootstrap, MemoryLayout, Region, SharedMemory};
pub use cspace::CapSlotPool;
pub use descriptor::{DescriptorFields, SegmentDescriptor, UserDesc, GDT_ENTRY_TLS_ENTRIES, LDT_ENTRY_SIZE};
pub use flush::{RegionPages, FLUSH_BATCH};
pub use lifecycle::{LifecycleManager, Task, Thread, ThreadState, UTCB_SIZE};
pub use shared::{
    CompanionCommand, CompanionLabel, ControlBlock, CONTROL_BLOCK_SIZE, IPC_BUF_SIZE,
    MIN_SYNC_CALL_BUF_SIZE, SYNC_CALL_BUF_SIZE,
};
pub use tls::{DescriptorTable, TableHandle, TlsManager, TlsSlab, TLS_SLAB_SLOTS, TLS_SLAB_SLOT_SIZE};

/// Error types for capability operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Out of capability slots")]
    OutOfSlots,

    #[error("Capability slot {slot} was not handed out")]
    SlotNotAllocated { slot: usize },

    #[error("Out of memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("Region {addr:#x}+{size:#x} overlaps memory already free")]
    OverlappingFree { addr: usize, size: usize },

    #[error("TLS descriptor slab exhausted")]
    TlsSlabExhausted,

    #[error("No free TLS entry in descriptor table")]
    NoFreeTlsEntry,

    #[error("TLS entry {index} outside {min}..={max}")]
    InvalidTlsIndex { index: i32, min: usize, max: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("UTCB area of task exhausted")]
    UtcbExhausted,

    #[error("Invalid capability")]
    InvalidCap,

    #[error("{op} rejected by kernel: {err}")]
    Kernel { op: &'static str, err: KernelError },

    #[error("Partial teardown of thread {thread:#x} / gate {gate:#x}, slots retained")]
    PartialTeardown { thread: usize, gate: usize },

    #[error("Companion handshake: {0}")]
    Handshake(&'static str),
}

/// Broad class of a [`CapabilityError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Slots, memory, descriptor tables or UTCBs ran out
    ResourceExhaustion,
    /// The kernel refused an operation
    KernelRejection,
    /// The caller passed something out of range
    InvalidArgument,
    /// The companion OS sent something unexpected, or never sent it
    ProtocolViolation,
}

impl CapabilityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfSlots
            | Self::OutOfMemory { .. }
            | Self::TlsSlabExhausted
            | Self::NoFreeTlsEntry
            | Self::UtcbExhausted => ErrorKind::ResourceExhaustion,
            Self::Kernel { .. } | Self::PartialTeardown { .. } => ErrorKind::KernelRejection,
            Self::SlotNotAllocated { .. }
            | Self::OverlappingFree { .. }
            | Self::InvalidTlsIndex { .. }
            | Self::InvalidArgument(_)
            | Self::InvalidCap => ErrorKind::InvalidArgument,
            Self::Handshake(_) => ErrorKind::ProtocolViolation,
        }
    }
}

pub type Result<T> = core::result::Result<T, CapabilityError>;

/// Wrap a kernel error with the name of the operation that produced it
pub(crate) fn rejected(op: &'static str) -> impl FnOnce(KernelError) -> CapabilityError {
    move |err| {
        log::warn!("{}: kernel rejected: {}", op, err);
        CapabilityError::Kernel { op, err }
    }
}

/// Everything [`init`] sets up
pub struct System<'k, K: Microkernel> {
    pub context: BootContext,
    pub lifecycle: LifecycleManager<'k, K>,
    pub tls: TlsManager<'k, K>,
}

/// Bring the capability core up
///
/// Raises the main thread to its configured priority, binds the pager gate,
/// queries the TLS entry range, then runs memory bootstrap and the companion
/// handshake. Every failure is fatal to boot and is logged before returning.
pub fn init<'k, K: Microkernel>(kernel: &'k K, config: &BootConfig) -> Result<System<'k, K>> {
    log::debug!("boot: {} kernel", l4_platform::config::platform_mode());

    let main = kernel.main_thread();
    kernel
        .run_thread(main, SchedParam::new(config.main_priority))
        .map_err(rejected("run_thread"))
        .inspect_err(|e| log::error!("boot: cannot set main thread priority: {}", e))?;

    let mut slots = CapSlotPool::new(config.cap_slots.clone());
    let mut bootstrap = Bootstrap::new(kernel, &mut slots, config);

    let companion = bootstrap
        .bind_pager_gate()
        .inspect_err(|e| log::error!("boot: pager gate: {}", e))?;

    let tls = TlsManager::new(kernel).inspect_err(|e| log::error!("boot: tls: {}", e))?;

    let layout = bootstrap
        .init_mm(config.stack_and_heap_size)
        .inspect_err(|e| log::error!("boot: memory: {}", e))?;
    let shm = bootstrap
        .init_shm()
        .inspect_err(|e| log::error!("boot: shared memory: {}", e))?;

    let context = BootContext::new(main, companion, layout, shm, config.sync_call_buf_size);
    context.log_layout();

    let lifecycle = LifecycleManager::new(kernel, slots, main);

    Ok(System {
        context,
        lifecycle,
        tls,
    })
}
