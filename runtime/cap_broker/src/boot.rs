//! Memory Bootstrap - regions and handshake at process start
//!
//! At boot the process sets up, in order:
//! - its main memory (one superpage-aligned dataspace)
//! - the stack and heap region, with the lowest page reserved as a guard
//! - the IPC buffer and the companion's main memory, both received from the
//!   companion OS in a single handshake message
//!
//! The result is a [`BootContext`] that never changes afterwards.

use core::ops::Range;

use l4_platform::{
    AllocFlags, AttachFlags, BufferItem, CapIdx, Microkernel, Timeout, PAGE_SHIFT, PAGE_SIZE,
    SUPERPAGE_SHIFT,
};
use managed_heap::BumpHeap;
use static_assertions::const_assert_eq;

use crate::cspace::CapSlotPool;
use crate::shared::{
    CompanionCommand, CompanionLabel, ControlBlock, CONTROL_BLOCK_SIZE, MIN_SYNC_CALL_BUF_SIZE,
    SYNC_CALL_BUF_SIZE,
};
use crate::{rejected, CapabilityError, Result};

/// Address range `[start, start + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub start: usize,
    pub size: usize,
}

impl Region {
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }
}

/// Boot-time configuration
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Size of the main memory dataspace
    pub main_memory_size: usize,
    /// Size of the stack and heap region
    pub stack_and_heap_size: usize,
    /// Stack part of the stack and heap region, guard page included
    pub stack_size: usize,
    /// Synchronous-call area at the start of the IPC buffer
    pub sync_call_buf_size: usize,
    /// Scheduling priority of the main thread
    pub main_priority: u32,
    /// Capability slots the process may allocate from
    pub cap_slots: Range<usize>,
    /// Environment name of the companion's server gate
    pub companion_gate: &'static str,
    /// Environment name of this process's own gate
    pub own_gate: &'static str,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            main_memory_size: 96 * 1024 * 1024,
            stack_and_heap_size: 96 * 1024 * 1024,
            stack_size: 128 * 1024,
            sync_call_buf_size: SYNC_CALL_BUF_SIZE,
            main_priority: 10,
            cap_slots: 64..4096,
            companion_gate: "linux_server",
            own_gate: "vandroid",
        }
    }
}

/// Local memory set up by [`Bootstrap::init_mm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub main_memory_ds: CapIdx,
    pub main_memory: Region,
    pub stack_and_heap_ds: CapIdx,
    pub stack_and_heap: Region,
    /// Reserved, unbacked lowest page of the stack
    pub guard: Region,
    /// Usable stack, above the guard page
    pub stack: Region,
    pub heap: Region,
}

/// Memory received in the companion handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedMemory {
    pub ipc_ds: CapIdx,
    pub ipc_buffer: Region,
    pub companion_ds: CapIdx,
    pub companion_memory: Region,
    /// Address of the [`ControlBlock`] inside the IPC buffer
    pub control_block: usize,
}

/// Boot sequence steps
pub struct Bootstrap<'k, 'p, K: Microkernel> {
    kernel: &'k K,
    slots: &'p mut CapSlotPool,
    config: &'p BootConfig,
}

impl<'k, 'p, K: Microkernel> Bootstrap<'k, 'p, K> {
    pub fn new(kernel: &'k K, slots: &'p mut CapSlotPool, config: &'p BootConfig) -> Self {
        Self {
            kernel,
            slots,
            config,
        }
    }

    /// Bind this process's gate to the main thread
    ///
    /// Calls arriving through the gate are labelled with the companion's
    /// server handle, which is returned.
    pub fn bind_pager_gate(&mut self) -> Result<CapIdx> {
        let companion = self.kernel.env_cap(self.config.companion_gate);
        if companion.is_invalid() {
            return Err(CapabilityError::Handshake("companion gate not in environment"));
        }

        let gate = self.kernel.env_cap(self.config.own_gate);
        if gate.is_invalid() {
            return Err(CapabilityError::Handshake("own gate not in environment"));
        }

        self.kernel
            .gate_bind_thread(gate, self.kernel.main_thread(), companion.raw())
            .map_err(rejected("gate_bind_thread"))?;
        log::debug!("boot: gate {:#x} bound, companion {:#x}", gate.raw(), companion.raw());
        Ok(companion)
    }

    /// Allocate and attach the main memory dataspace
    pub fn init_main_memory(&mut self) -> Result<(CapIdx, Region)> {
        self.alloc_and_attach(self.config.main_memory_size)
    }

    /// Set up main memory, then a stack and heap region of `size` bytes
    ///
    /// The stack takes the low `stack_size` bytes, its lowest page reserved
    /// so an overflow faults; the heap takes the rest.
    pub fn init_mm(&mut self, size: usize) -> Result<MemoryLayout> {
        let stack_size = self.config.stack_size;
        if stack_size <= PAGE_SIZE || stack_size % PAGE_SIZE != 0 || stack_size >= size {
            return Err(CapabilityError::InvalidArgument(
                "stack does not fit stack and heap region",
            ));
        }

        let (main_memory_ds, main_memory) = self.init_main_memory()?;
        let (stack_and_heap_ds, stack_and_heap) = match self.alloc_and_attach(size) {
            Ok(ds) => ds,
            Err(err) => {
                self.discard(main_memory_ds);
                return Err(err);
            }
        };

        let guard = Region::new(stack_and_heap.start, PAGE_SIZE);
        if let Err(err) = self.kernel.rm_reserve_area(
            guard.start,
            guard.size,
            AttachFlags::OVERMAP | AttachFlags::RESERVED | AttachFlags::IN_AREA,
            PAGE_SHIFT,
        ) {
            self.discard(stack_and_heap_ds);
            self.discard(main_memory_ds);
            return Err(rejected("rm_reserve_area")(err));
        }

        let stack_end = stack_and_heap.start + stack_size;
        Ok(MemoryLayout {
            main_memory_ds,
            main_memory,
            stack_and_heap_ds,
            stack_and_heap,
            guard,
            stack: Region::new(guard.end(), stack_end - guard.end()),
            heap: Region::new(stack_end, stack_and_heap.end() - stack_end),
        })
    }

    /// Wait for the companion's handshake and attach what it sends
    ///
    /// The message carries the IPC buffer size in word 1, the control block
    /// offset in word 2 and the companion memory size in word 3, with the two
    /// dataspaces in the first two buffer registers.
    pub fn init_shm(&mut self) -> Result<SharedMemory> {
        let ipc_ds = self.slots.allocate()?;
        let companion_ds = match self.slots.allocate() {
            Ok(cap) => cap,
            Err(err) => {
                self.release(ipc_ds);
                return Err(err);
            }
        };

        let mut buffers = [
            BufferItem::single_local(ipc_ds),
            BufferItem::single_local(companion_ds),
        ];
        let mut received = false;
        let result = self.receive_shm(&mut buffers, &mut received);

        if let Err(err) = &result {
            log::warn!("boot: handshake failed: {}", err);
            if received {
                for item in buffers.iter().filter(|b| b.cap.is_valid()) {
                    if let Err(e) = self.kernel.delete_object(item.cap) {
                        log::debug!("boot: dropping received {:#x}: {}", item.cap.raw(), e);
                    }
                }
            }
            self.release(ipc_ds);
            self.release(companion_ds);
        }
        result
    }

    fn receive_shm(
        &mut self,
        buffers: &mut [BufferItem; 2],
        received: &mut bool,
    ) -> Result<SharedMemory> {
        let msg = self
            .kernel
            .ipc_wait(buffers, Timeout::Never)
            .map_err(rejected("ipc_wait"))?;
        *received = true;

        if msg.tag.has_error() {
            return Err(CapabilityError::Handshake("error in message tag"));
        }

        let kickstart = CompanionLabel::try_from(msg.tag.label()) == Ok(CompanionLabel::Cmd)
            && CompanionCommand::try_from(msg.mr[0]) == Ok(CompanionCommand::Kickstart);
        if !kickstart {
            log::warn!(
                "boot: handshake label {} command {} is not a kickstart",
                msg.tag.label(),
                msg.mr[0]
            );
        }

        let ipc_buf_size = msg.mr[1];
        let control_block_off = msg.mr[2];
        let companion_size = msg.mr[3];
        log::debug!(
            "boot: handshake ipc buffer {:#x}, control block at +{:#x}, companion memory {:#x}",
            ipc_buf_size,
            control_block_off,
            companion_size
        );

        let [ipc, companion] = *buffers;
        if ipc.cap.is_invalid() || companion.cap.is_invalid() {
            return Err(CapabilityError::Handshake("dataspace missing from handshake"));
        }
        if ipc_buf_size == 0 || companion_size == 0 {
            return Err(CapabilityError::Handshake("empty shared region"));
        }
        let inside = control_block_off
            .checked_add(CONTROL_BLOCK_SIZE)
            .is_some_and(|end| end <= ipc_buf_size);
        if !inside || control_block_off % core::mem::align_of::<ControlBlock>() != 0 {
            return Err(CapabilityError::Handshake("control block outside ipc buffer"));
        }

        let ipc_start = self.attach(ipc.cap, ipc_buf_size)?;
        let companion_start = self.attach(companion.cap, companion_size)?;

        Ok(SharedMemory {
            ipc_ds: ipc.cap,
            ipc_buffer: Region::new(ipc_start, ipc_buf_size),
            companion_ds: companion.cap,
            companion_memory: Region::new(companion_start, companion_size),
            control_block: ipc_start + control_block_off,
        })
    }

    /// New superpage-backed dataspace of `size` bytes, attached locally
    fn alloc_and_attach(&mut self, size: usize) -> Result<(CapIdx, Region)> {
        let ds = self.slots.allocate()?;
        if let Err(err) = self.kernel.mem_alloc(size, ds, AllocFlags::SUPER_PAGES) {
            self.release(ds);
            return Err(rejected("mem_alloc")(err));
        }

        match self.attach(ds, size) {
            Ok(start) => {
                log::debug!("boot: dataspace {:#x} at {:#x}+{:#x}", ds.raw(), start, size);
                Ok((ds, Region::new(start, size)))
            }
            Err(err) => {
                self.discard(ds);
                Err(err)
            }
        }
    }

    /// Delete a dataspace; its slot is released only once the delete succeeds
    fn discard(&mut self, ds: CapIdx) {
        if let Err(e) = self.kernel.delete_object(ds) {
            log::warn!("boot: dataspace {:#x} leaked: {}", ds.raw(), e);
        } else {
            self.release(ds);
        }
    }

    fn attach(&self, ds: CapIdx, size: usize) -> Result<usize> {
        self.kernel
            .rm_attach(
                size,
                AttachFlags::SEARCH_ADDR | AttachFlags::EAGER_MAP,
                ds,
                0,
                SUPERPAGE_SHIFT,
            )
            .map_err(rejected("rm_attach"))
    }

    fn release(&mut self, cap: CapIdx) {
        if let Err(err) = self.slots.free(cap) {
            log::warn!("boot: slot {:#x} not released: {}", cap.raw(), err);
        }
    }
}

/// Parameters handed to the managed runtime's entry point
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootParams {
    pub main_memory_start: usize,
    pub main_memory_size: usize,
    pub companion_tid: usize,
    pub companion_memory_start: usize,
    pub companion_memory_size: usize,
    pub sync_ipc_shm_base: usize,
    pub sync_ipc_shm_size: usize,
    pub completion_queue_start: usize,
    pub completion_queue_size: usize,
}

const_assert_eq!(core::mem::size_of::<BootParams>(), 9 * core::mem::size_of::<usize>());

/// Process-wide facts established at boot
#[derive(Debug, Clone)]
pub struct BootContext {
    main_thread: CapIdx,
    companion: CapIdx,
    layout: MemoryLayout,
    shm: SharedMemory,
    sync_call_buf_size: usize,
}

impl BootContext {
    pub fn new(
        main_thread: CapIdx,
        companion: CapIdx,
        layout: MemoryLayout,
        shm: SharedMemory,
        sync_call_buf_size: usize,
    ) -> Self {
        Self {
            main_thread,
            companion,
            layout,
            shm,
            sync_call_buf_size,
        }
    }

    pub fn main_thread(&self) -> CapIdx {
        self.main_thread
    }

    /// The companion's server handle
    pub fn companion(&self) -> CapIdx {
        self.companion
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn shared(&self) -> &SharedMemory {
        &self.shm
    }

    /// Main memory, for seeding a [`crate::BlockAllocator`]
    pub fn main_memory(&self) -> Region {
        self.layout.main_memory
    }

    pub fn stack(&self) -> Region {
        self.layout.stack
    }

    /// Initial stack pointer of the main thread
    pub fn stack_top(&self) -> usize {
        self.layout.stack.end()
    }

    pub fn heap(&self) -> Region {
        self.layout.heap
    }

    pub fn sync_call_buffer(&self) -> Region {
        Region::new(self.shm.ipc_buffer.start, self.sync_call_buf_size)
    }

    /// The IPC buffer after the synchronous-call area and control block
    pub fn completion_queue(&self) -> Result<Region> {
        let used = self.sync_call_buf_size + CONTROL_BLOCK_SIZE;
        let ipc = self.shm.ipc_buffer;
        if used > ipc.size {
            return Err(CapabilityError::Handshake("ipc buffer too small for completion queue"));
        }
        Ok(Region::new(ipc.start + used, ipc.size - used))
    }

    /// Assemble the runtime's boot parameters
    pub fn boot_params(&self) -> Result<BootParams> {
        if self.sync_call_buf_size < MIN_SYNC_CALL_BUF_SIZE {
            return Err(CapabilityError::InvalidArgument("sync call buffer below minimum"));
        }

        let completion = self.completion_queue()?;
        Ok(BootParams {
            main_memory_start: self.layout.main_memory.start,
            main_memory_size: self.layout.main_memory.size,
            companion_tid: self.companion.raw(),
            companion_memory_start: self.shm.companion_memory.start,
            companion_memory_size: self.shm.companion_memory.size,
            sync_ipc_shm_base: self.shm.ipc_buffer.start,
            sync_ipc_shm_size: self.sync_call_buf_size,
            completion_queue_start: completion.start,
            completion_queue_size: completion.size,
        })
    }

    /// The control block shared with the companion
    ///
    /// # Safety
    /// The IPC buffer must really be mapped at the address the kernel
    /// reported, for the rest of the process's life.
    pub unsafe fn control_block(&self) -> &'static ControlBlock {
        // SAFETY: the handshake checked alignment and bounds; mapping is
        // upheld by the caller.
        unsafe { ControlBlock::from_addr(self.shm.control_block) }
    }

    /// The managed runtime's heap
    ///
    /// # Safety
    /// The heap region must be mapped and writable, and this may be called
    /// at most once.
    pub unsafe fn managed_heap(&self) -> BumpHeap<'static> {
        // SAFETY: upheld by the caller.
        unsafe { BumpHeap::from_raw_parts(self.layout.heap.start, self.layout.heap.end()) }
    }

    /// Log where everything ended up
    pub fn log_layout(&self) {
        let report = |name: &str, r: Region| log::info!("{}: {:#x}~{:#x}", name, r.start, r.end());

        report("stack", self.layout.stack);
        report("heap", self.layout.heap);
        report("shared buffer", self.sync_call_buffer());
        match self.completion_queue() {
            Ok(queue) => report("completion queue", queue),
            Err(err) => log::info!("completion queue: none ({})", err),
        }
        report("main memory", self.layout.main_memory);
        report("companion memory", self.shm.companion_memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use l4_platform::mock::{KernelOp, MockKernel, ObjectKind, Transfer};
    use l4_platform::{KernelError, Message, MsgTag};

    const IPC_BUF: usize = 2 * 1024 * 1024;
    const COMPANION_MEM: usize = 64 * 1024 * 1024;

    fn handshake(kernel: &MockKernel, cb_off: usize) {
        kernel.queue_message(
            Message::new(
                CompanionLabel::Cmd.tag(4, 2),
                &[CompanionCommand::Kickstart as usize, IPC_BUF, cb_off, COMPANION_MEM],
            ),
            &[
                Transfer::Dataspace { size: IPC_BUF },
                Transfer::Dataspace { size: COMPANION_MEM },
            ],
        );
    }

    #[test]
    fn test_default_config() {
        let config = BootConfig::default();
        assert_eq!(config.main_memory_size, 96 << 20);
        assert_eq!(config.stack_size, 128 << 10);
        assert_eq!(config.sync_call_buf_size, 68 << 10);
        assert_eq!(config.main_priority, 10);
        assert_eq!(config.companion_gate, "linux_server");
        assert_eq!(config.own_gate, "vandroid");
    }

    #[test]
    fn test_init_mm_layout() {
        let kernel = MockKernel::new();
        let config = BootConfig::default();
        let mut slots = CapSlotPool::new(config.cap_slots.clone());
        let mut boot = Bootstrap::new(&kernel, &mut slots, &config);

        let layout = boot.init_mm(config.stack_and_heap_size).unwrap();
        let region = layout.stack_and_heap;
        assert_eq!(region.start % (1 << SUPERPAGE_SHIFT), 0);
        assert_eq!(layout.main_memory.start % (1 << SUPERPAGE_SHIFT), 0);
        assert_eq!(layout.main_memory.size, config.main_memory_size);

        assert_eq!(layout.guard, Region::new(region.start, PAGE_SIZE));
        assert_eq!(layout.stack.start, region.start + PAGE_SIZE);
        assert_eq!(layout.stack.end(), region.start + config.stack_size);
        assert_eq!(layout.heap.start, layout.stack.end());
        assert_eq!(layout.heap.end(), region.end());

        assert_eq!(kernel.reservations(), [(region.start, PAGE_SIZE)]);
    }

    #[test]
    fn test_init_mm_rejects_tiny_region() {
        let kernel = MockKernel::new();
        let config = BootConfig::default();
        let mut slots = CapSlotPool::new(config.cap_slots.clone());
        let mut boot = Bootstrap::new(&kernel, &mut slots, &config);

        assert!(matches!(
            boot.init_mm(64 * 1024),
            Err(CapabilityError::InvalidArgument(_))
        ));
        assert_eq!(kernel.count(KernelOp::MemAlloc), 0);
    }

    #[test]
    fn test_init_mm_guard_failure_drops_dataspaces() {
        let kernel = MockKernel::new();
        let config = BootConfig::default();
        let mut slots = CapSlotPool::new(config.cap_slots.clone());
        kernel.fail_next(KernelOp::ReserveArea, KernelError::NoMemory);

        let mut boot = Bootstrap::new(&kernel, &mut slots, &config);
        assert!(matches!(
            boot.init_mm(config.stack_and_heap_size),
            Err(CapabilityError::Kernel { op: "rm_reserve_area", .. })
        ));
        drop(boot);

        assert_eq!(slots.in_use(), 0);
        assert_eq!(kernel.live_count(|k| matches!(k, ObjectKind::Dataspace { .. })), 0);
    }

    #[test]
    fn test_init_mm_second_alloc_failure_drops_main_memory() {
        let kernel = MockKernel::new();
        let config = BootConfig::default();
        let mut slots = CapSlotPool::new(config.cap_slots.clone());
        kernel.fail_nth(KernelOp::MemAlloc, 1, KernelError::NoMemory);

        let mut boot = Bootstrap::new(&kernel, &mut slots, &config);
        assert!(boot.init_mm(config.stack_and_heap_size).is_err());
        drop(boot);

        assert_eq!(slots.in_use(), 0);
        assert_eq!(kernel.live_count(|k| matches!(k, ObjectKind::Dataspace { .. })), 0);
    }

    #[test]
    fn test_attach_failure_releases_slot() {
        let kernel = MockKernel::new();
        let config = BootConfig::default();
        let mut slots = CapSlotPool::new(config.cap_slots.clone());
        kernel.fail_next(KernelOp::Attach, KernelError::NoMemory);

        let mut boot = Bootstrap::new(&kernel, &mut slots, &config);
        assert!(boot.init_main_memory().is_err());
        drop(boot);

        assert_eq!(slots.in_use(), 0);
        let dataspaces = kernel.live_count(|k| matches!(k, ObjectKind::Dataspace { .. }));
        assert_eq!(dataspaces, 0);
    }

    #[test]
    fn test_init_shm() {
        let kernel = MockKernel::new();
        let config = BootConfig::default();
        let mut slots = CapSlotPool::new(config.cap_slots.clone());
        handshake(&kernel, SYNC_CALL_BUF_SIZE);

        let mut boot = Bootstrap::new(&kernel, &mut slots, &config);
        let shm = boot.init_shm().unwrap();
        assert_eq!(shm.ipc_buffer.size, IPC_BUF);
        assert_eq!(shm.companion_memory.size, COMPANION_MEM);
        assert_eq!(shm.control_block, shm.ipc_buffer.start + SYNC_CALL_BUF_SIZE);
        assert_eq!(shm.ipc_buffer.start % (1 << SUPERPAGE_SHIFT), 0);
    }

    #[test]
    fn test_init_shm_rejects_missing_dataspace() {
        let kernel = MockKernel::new();
        let config = BootConfig::default();
        let mut slots = CapSlotPool::new(config.cap_slots.clone());
        kernel.queue_message(
            Message::new(
                CompanionLabel::Cmd.tag(4, 1),
                &[CompanionCommand::Kickstart as usize, IPC_BUF, 0, COMPANION_MEM],
            ),
            &[Transfer::Dataspace { size: IPC_BUF }, Transfer::Nothing],
        );

        let mut boot = Bootstrap::new(&kernel, &mut slots, &config);
        assert_eq!(
            boot.init_shm(),
            Err(CapabilityError::Handshake("dataspace missing from handshake"))
        );
        drop(boot);
        assert_eq!(slots.in_use(), 0);
        assert_eq!(kernel.count(KernelOp::Attach), 0);
        // The dataspace that did arrive was dropped again
        assert_eq!(kernel.count(KernelOp::DeleteObject), 1);
    }

    #[test]
    fn test_init_shm_rejects_control_block_outside_buffer() {
        let kernel = MockKernel::new();
        let config = BootConfig::default();
        let mut slots = CapSlotPool::new(config.cap_slots.clone());
        handshake(&kernel, IPC_BUF - 16);

        let mut boot = Bootstrap::new(&kernel, &mut slots, &config);
        assert!(matches!(boot.init_shm(), Err(CapabilityError::Handshake(_))));
    }

    #[test]
    fn test_init_shm_error_tag() {
        let kernel = MockKernel::new();
        let config = BootConfig::default();
        let mut slots = CapSlotPool::new(config.cap_slots.clone());
        kernel.queue_message(Message::new(MsgTag::new(0, 0, 0, MsgTag::ERROR), &[]), &[]);

        let mut boot = Bootstrap::new(&kernel, &mut slots, &config);
        assert_eq!(
            boot.init_shm(),
            Err(CapabilityError::Handshake("error in message tag"))
        );
    }

    #[test]
    fn test_bind_pager_gate() {
        let kernel = MockKernel::new();
        let config = BootConfig::default();
        let mut slots = CapSlotPool::new(config.cap_slots.clone());
        let mut boot = Bootstrap::new(&kernel, &mut slots, &config);

        assert!(matches!(boot.bind_pager_gate(), Err(CapabilityError::Handshake(_))));

        let companion = kernel.add_env_gate("linux_server");
        let own = kernel.add_env_gate("vandroid");
        assert_eq!(boot.bind_pager_gate(), Ok(companion));
        assert_eq!(
            kernel.gate_bindings(),
            [(own, kernel.main_thread(), companion.raw())]
        );
    }
}
