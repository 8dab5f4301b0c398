//! MOCK L4 kernel for development and unit testing
//!
//! An in-memory stand-in for the microkernel: it tracks which capability
//! slots hold live objects, records every invocation, and lets a test make
//! any operation fail on its n-th call. No real memory is handed out;
//! attached regions are fake addresses from a bump cursor.
//!
//! ## Usage
//!
//! ```rust
//! use l4_platform::mock::{KernelOp, MockKernel};
//! use l4_platform::KernelError;
//!
//! let kernel = MockKernel::new();
//! kernel.fail_next(KernelOp::CreateGate, KernelError::NoMemory);
//! ```

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::adapter::Microkernel;
use crate::types::*;

/// Kernel operations the mock can record and fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KernelOp {
    CreateTask,
    CreateThread,
    CreateGate,
    GateBind,
    MapObject,
    DeleteObject,
    UnmapBatch,
    ThreadControl,
    ExRegs,
    RunThread,
    GdtEntryOffset,
    GdtSet,
    SetName,
    MemAlloc,
    Attach,
    ReserveArea,
    IpcWait,
}

/// Kind of kernel object living in a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Task,
    Thread,
    Gate,
    Dataspace { size: usize },
}

/// Capability transfer carried by a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// A dataspace of the given size lands in the armed buffer slot
    Dataspace { size: usize },
    /// Nothing arrives for this item
    Nothing,
}

/// Slot of the mock's main thread
pub const MAIN_THREAD_SLOT: usize = 1;

/// First slot the mock hands out for environment capabilities
const ENV_SLOT_BASE: usize = 8;

/// Base of the fake address range returned by `rm_attach`
const ATTACH_BASE: Word = 0x1000_0000;

/// Default GDT entry offset for thread-local segments
pub const DEFAULT_GDT_OFFSET: usize = 6;

#[derive(Debug)]
struct Fault {
    op: KernelOp,
    skip: usize,
    err: KernelError,
}

#[derive(Debug)]
struct Delivery {
    message: Message,
    transfers: Vec<Transfer>,
}

/// Attached region recorded by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub addr: Word,
    pub size: usize,
    pub ds: CapIdx,
    pub flags: AttachFlags,
}

#[derive(Debug, Default)]
struct MockState {
    objects: BTreeMap<Word, ObjectKind>,
    faults: Vec<Fault>,
    calls: Vec<KernelOp>,
    env: BTreeMap<String, CapIdx>,
    names: BTreeMap<Word, String>,
    regs: BTreeMap<Word, (Word, Word)>,
    sched: BTreeMap<Word, SchedParam>,
    controls: BTreeMap<Word, ThreadControl>,
    gate_bindings: Vec<(CapIdx, CapIdx, Word)>,
    mappings: Vec<(CapIdx, Fpage)>,
    unmaps: Vec<(CapIdx, Vec<Fpage>)>,
    gdt: Vec<(CapIdx, Vec<u8>, usize)>,
    attachments: Vec<Attachment>,
    reservations: Vec<(Word, usize)>,
    inbox: VecDeque<Delivery>,
    next_env_slot: usize,
    next_vaddr: Word,
    gdt_offset: usize,
}

/// In-memory microkernel
#[derive(Debug)]
pub struct MockKernel {
    state: RefCell<MockState>,
}

impl Default for MockKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKernel {
    /// Create a mock kernel with a live main thread and nothing else
    pub fn new() -> Self {
        let mut state = MockState {
            next_env_slot: ENV_SLOT_BASE,
            next_vaddr: ATTACH_BASE,
            gdt_offset: DEFAULT_GDT_OFFSET,
            ..MockState::default()
        };
        state
            .objects
            .insert(CapIdx::from_slot(MAIN_THREAD_SLOT).raw(), ObjectKind::Thread);

        Self {
            state: RefCell::new(state),
        }
    }

    // ========== Setup ==========

    /// Register a named environment capability backed by a live gate
    pub fn add_env_gate(&self, name: &str) -> CapIdx {
        let mut st = self.state.borrow_mut();
        let cap = CapIdx::from_slot(st.next_env_slot);
        st.next_env_slot += 1;
        st.objects.insert(cap.raw(), ObjectKind::Gate);
        st.env.insert(name.to_string(), cap);
        cap
    }

    /// Change the GDT entry offset reported to callers
    pub fn set_gdt_offset(&self, offset: usize) {
        self.state.borrow_mut().gdt_offset = offset;
    }

    /// Queue a message for the next `ipc_wait`
    pub fn queue_message(&self, message: Message, transfers: &[Transfer]) {
        self.state.borrow_mut().inbox.push_back(Delivery {
            message,
            transfers: transfers.to_vec(),
        });
    }

    /// Fail the next call of `op` with `err`
    pub fn fail_next(&self, op: KernelOp, err: KernelError) {
        self.fail_nth(op, 0, err);
    }

    /// Let `skip` calls of `op` succeed, then fail the following one
    pub fn fail_nth(&self, op: KernelOp, skip: usize, err: KernelError) {
        self.state.borrow_mut().faults.push(Fault { op, skip, err });
    }

    // ========== Inspection ==========

    /// Every invocation so far, in order
    pub fn calls(&self) -> Vec<KernelOp> {
        self.state.borrow().calls.clone()
    }

    /// Number of invocations of `op`
    pub fn count(&self, op: KernelOp) -> usize {
        self.state.borrow().calls.iter().filter(|c| **c == op).count()
    }

    /// Does `cap` name a live object?
    pub fn is_live(&self, cap: CapIdx) -> bool {
        self.state.borrow().objects.contains_key(&cap.raw())
    }

    /// Kind of the object in `cap`, if any
    pub fn object(&self, cap: CapIdx) -> Option<ObjectKind> {
        self.state.borrow().objects.get(&cap.raw()).copied()
    }

    /// Number of live objects matching `pred`
    pub fn live_count(&self, pred: impl Fn(ObjectKind) -> bool) -> usize {
        self.state
            .borrow()
            .objects
            .values()
            .filter(|k| pred(**k))
            .count()
    }

    pub fn object_name(&self, cap: CapIdx) -> Option<String> {
        self.state.borrow().names.get(&cap.raw()).cloned()
    }

    /// Last instruction/stack pointer written to `thread`
    pub fn thread_regs(&self, thread: CapIdx) -> Option<(Word, Word)> {
        self.state.borrow().regs.get(&thread.raw()).copied()
    }

    pub fn sched_param(&self, thread: CapIdx) -> Option<SchedParam> {
        self.state.borrow().sched.get(&thread.raw()).copied()
    }

    pub fn thread_control_of(&self, thread: CapIdx) -> Option<ThreadControl> {
        self.state.borrow().controls.get(&thread.raw()).copied()
    }

    /// Object capabilities mapped into other tasks, as `(task, object)`
    pub fn mappings(&self) -> Vec<(CapIdx, Fpage)> {
        self.state.borrow().mappings.clone()
    }

    /// Gate bindings as `(gate, thread, label)`
    pub fn gate_bindings(&self) -> Vec<(CapIdx, CapIdx, Word)> {
        self.state.borrow().gate_bindings.clone()
    }

    /// Every unmap batch issued, as `(task, fpages)`
    pub fn unmap_batches(&self) -> Vec<(CapIdx, Vec<Fpage>)> {
        self.state.borrow().unmaps.clone()
    }

    /// Every descriptor installation, as `(thread, bytes, first entry)`
    pub fn gdt_installs(&self) -> Vec<(CapIdx, Vec<u8>, usize)> {
        self.state.borrow().gdt.clone()
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.state.borrow().attachments.clone()
    }

    /// Reserved-but-unbacked ranges, as `(addr, size)`
    pub fn reservations(&self) -> Vec<(Word, usize)> {
        self.state.borrow().reservations.clone()
    }

    // ========== Internals ==========

    /// Record the call and consume a matching fault, if one is due
    fn enter(&self, op: KernelOp) -> KResult<()> {
        let mut st = self.state.borrow_mut();
        st.calls.push(op);

        let Some(pos) = st.faults.iter().position(|f| f.op == op) else {
            return Ok(());
        };

        if st.faults[pos].skip > 0 {
            st.faults[pos].skip -= 1;
            return Ok(());
        }

        let fault = st.faults.remove(pos);
        log::debug!("mock: injected {:?} failure: {}", op, fault.err);
        Err(fault.err)
    }

    fn create(&self, slot: CapIdx, kind: ObjectKind) -> KResult<()> {
        if slot.is_invalid() {
            return Err(KernelError::InvalidCapability);
        }

        let mut st = self.state.borrow_mut();
        if st.objects.contains_key(&slot.raw()) {
            return Err(KernelError::Exists);
        }

        st.objects.insert(slot.raw(), kind);
        Ok(())
    }

    fn expect_kind(&self, cap: CapIdx, pred: impl Fn(ObjectKind) -> bool) -> KResult<ObjectKind> {
        match self.state.borrow().objects.get(&cap.raw()) {
            Some(kind) if pred(*kind) => Ok(*kind),
            _ => Err(KernelError::InvalidCapability),
        }
    }
}

fn align_up(addr: Word, align: Word) -> Word {
    (addr + align - 1) & !(align - 1)
}

impl Microkernel for MockKernel {
    fn main_thread(&self) -> CapIdx {
        CapIdx::from_slot(MAIN_THREAD_SLOT)
    }

    fn env_cap(&self, name: &str) -> CapIdx {
        self.state
            .borrow()
            .env
            .get(name)
            .copied()
            .unwrap_or(CapIdx::INVALID)
    }

    fn create_task(&self, slot: CapIdx, utcb_area: Fpage) -> KResult<()> {
        self.enter(KernelOp::CreateTask)?;
        if utcb_area.order() < PAGE_SHIFT as u8 {
            return Err(KernelError::InvalidArgument);
        }
        self.create(slot, ObjectKind::Task)
    }

    fn create_thread(&self, slot: CapIdx) -> KResult<()> {
        self.enter(KernelOp::CreateThread)?;
        self.create(slot, ObjectKind::Thread)
    }

    fn create_gate(&self, slot: CapIdx, thread: CapIdx, label: Word) -> KResult<()> {
        self.enter(KernelOp::CreateGate)?;
        self.expect_kind(thread, |k| k == ObjectKind::Thread)?;
        self.create(slot, ObjectKind::Gate)?;
        self.state
            .borrow_mut()
            .gate_bindings
            .push((slot, thread, label));
        Ok(())
    }

    fn gate_bind_thread(&self, gate: CapIdx, thread: CapIdx, label: Word) -> KResult<()> {
        self.enter(KernelOp::GateBind)?;
        self.expect_kind(gate, |k| k == ObjectKind::Gate)?;
        self.expect_kind(thread, |k| k == ObjectKind::Thread)?;
        self.state
            .borrow_mut()
            .gate_bindings
            .push((gate, thread, label));
        Ok(())
    }

    fn map_object(&self, dest_task: CapIdx, object: Fpage) -> KResult<()> {
        self.enter(KernelOp::MapObject)?;
        self.expect_kind(dest_task, |k| k == ObjectKind::Task)?;
        self.expect_kind(CapIdx::from_raw(object.base()), |_| true)?;
        self.state.borrow_mut().mappings.push((dest_task, object));
        Ok(())
    }

    fn delete_object(&self, object: CapIdx) -> KResult<()> {
        self.enter(KernelOp::DeleteObject)?;
        let mut st = self.state.borrow_mut();
        if st.objects.remove(&object.raw()).is_none() {
            return Err(KernelError::InvalidCapability);
        }
        st.mappings.retain(|(_, fp)| fp.base() != object.raw());
        st.controls.remove(&object.raw());
        Ok(())
    }

    fn unmap_batch(&self, task: CapIdx, fpages: &[Fpage]) -> KResult<()> {
        self.enter(KernelOp::UnmapBatch)?;
        if fpages.len() > MSG_REGS - 2 {
            return Err(KernelError::InvalidArgument);
        }
        self.expect_kind(task, |k| k == ObjectKind::Task)?;
        self.state
            .borrow_mut()
            .unmaps
            .push((task, fpages.to_vec()));
        Ok(())
    }

    fn thread_control(&self, thread: CapIdx, control: &ThreadControl) -> KResult<()> {
        self.enter(KernelOp::ThreadControl)?;
        self.expect_kind(thread, |k| k == ObjectKind::Thread)?;
        self.expect_kind(control.bind_task, |k| k == ObjectKind::Task)?;
        self.expect_kind(control.pager, |k| k == ObjectKind::Gate)?;
        self.expect_kind(control.exc_handler, |k| k == ObjectKind::Gate)?;
        self.state
            .borrow_mut()
            .controls
            .insert(thread.raw(), *control);
        Ok(())
    }

    fn thread_ex_regs(&self, thread: CapIdx, ip: Word, sp: Word) -> KResult<()> {
        self.enter(KernelOp::ExRegs)?;
        self.expect_kind(thread, |k| k == ObjectKind::Thread)?;
        self.state.borrow_mut().regs.insert(thread.raw(), (ip, sp));
        Ok(())
    }

    fn run_thread(&self, thread: CapIdx, param: SchedParam) -> KResult<()> {
        self.enter(KernelOp::RunThread)?;
        self.expect_kind(thread, |k| k == ObjectKind::Thread)?;
        self.state.borrow_mut().sched.insert(thread.raw(), param);
        Ok(())
    }

    fn gdt_entry_offset(&self, thread: CapIdx) -> KResult<usize> {
        self.enter(KernelOp::GdtEntryOffset)?;
        self.expect_kind(thread, |k| k == ObjectKind::Thread)?;
        Ok(self.state.borrow().gdt_offset)
    }

    fn gdt_set(&self, thread: CapIdx, descriptors: &[u8], first: usize) -> KResult<()> {
        self.enter(KernelOp::GdtSet)?;
        if descriptors.len() % 8 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.expect_kind(thread, |k| k == ObjectKind::Thread)?;
        self.state
            .borrow_mut()
            .gdt
            .push((thread, descriptors.to_vec(), first));
        Ok(())
    }

    fn set_object_name(&self, object: CapIdx, name: &str) -> KResult<()> {
        self.enter(KernelOp::SetName)?;
        self.expect_kind(object, |_| true)?;
        self.state
            .borrow_mut()
            .names
            .insert(object.raw(), name.to_string());
        Ok(())
    }

    fn mem_alloc(&self, size: usize, ds: CapIdx, _flags: AllocFlags) -> KResult<()> {
        self.enter(KernelOp::MemAlloc)?;
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.create(ds, ObjectKind::Dataspace { size })
    }

    fn rm_attach(
        &self,
        size: usize,
        flags: AttachFlags,
        ds: CapIdx,
        offset: usize,
        align: usize,
    ) -> KResult<Word> {
        self.enter(KernelOp::Attach)?;
        let ObjectKind::Dataspace { size: ds_size } =
            self.expect_kind(ds, |k| matches!(k, ObjectKind::Dataspace { .. }))?
        else {
            return Err(KernelError::InvalidCapability);
        };

        if size == 0 || offset + size > ds_size || !flags.contains(AttachFlags::SEARCH_ADDR) {
            return Err(KernelError::InvalidArgument);
        }

        let mut st = self.state.borrow_mut();
        let addr = align_up(st.next_vaddr, 1 << align.max(PAGE_SHIFT));
        st.next_vaddr = align_up(addr + size, PAGE_SIZE);
        st.attachments.push(Attachment {
            addr,
            size,
            ds,
            flags,
        });
        Ok(addr)
    }

    fn rm_reserve_area(
        &self,
        addr: Word,
        size: usize,
        flags: AttachFlags,
        align: usize,
    ) -> KResult<Word> {
        self.enter(KernelOp::ReserveArea)?;
        if size == 0 || addr % (1 << align) != 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut st = self.state.borrow_mut();
        let end = addr + size;
        let overlaps = |a: Word, s: usize| addr < a + s && a < end;

        if !flags.contains(AttachFlags::OVERMAP)
            && st.attachments.iter().any(|a| overlaps(a.addr, a.size))
        {
            return Err(KernelError::Exists);
        }
        if st.reservations.iter().any(|(a, s)| overlaps(*a, *s)) {
            return Err(KernelError::Exists);
        }

        st.reservations.push((addr, size));
        Ok(addr)
    }

    fn ipc_wait(&self, buffers: &mut [BufferItem], timeout: Timeout) -> KResult<Message> {
        self.enter(KernelOp::IpcWait)?;
        let mut st = self.state.borrow_mut();

        let Some(delivery) = st.inbox.pop_front() else {
            // Nobody will ever send; a real kernel would block forever.
            log::debug!("mock: ipc_wait with empty inbox ({:?})", timeout);
            return Err(KernelError::IpcTimeout);
        };

        for (i, item) in buffers.iter_mut().enumerate() {
            match delivery.transfers.get(i) {
                Some(Transfer::Dataspace { size }) if item.cap.is_valid() => {
                    st.objects
                        .insert(item.cap.raw(), ObjectKind::Dataspace { size: *size });
                }
                _ => item.cap = CapIdx::INVALID,
            }
        }

        Ok(delivery.message)
    }
}
