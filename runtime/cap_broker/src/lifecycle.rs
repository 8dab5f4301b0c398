//! Task and Thread Lifecycle
//!
//! Creates tasks, and threads inside them, each thread paired with an IPC
//! gate that serves as its pager and exception handler.
//!
//! # Thread Model
//! A thread handed out by [`LifecycleManager::create_thread`] is
//! *Configured*:
//! - thread and gate objects both live
//! - the gate mapped into the owning task
//! - pager, exception handler, UTCB and task committed in one kernel call
//!
//! [`LifecycleManager::start_thread`] moves it to *Started*. Deletion consumes
//! the handle. Slots go back to the pool only once both kernel objects are
//! confirmed gone.
//!
//! # Example
//! ```ignore
//! let mut task = lifecycle.create_task(Some("app"), UTCB_AREA, 17)?;
//! let mut thread = lifecycle.spawn_thread(&mut task)?;
//! lifecycle.start_thread(&mut thread, entry, stack_top)?;
//! ```

use alloc::vec::Vec;

use l4_platform::{
    CapIdx, Fpage, FpageRights, Microkernel, SchedParam, ThreadControl, PAGE_SHIFT, PAGE_SIZE,
};

use crate::cspace::CapSlotPool;
use crate::flush::{RegionPages, FLUSH_BATCH};
use crate::{rejected, CapabilityError, Result};

/// Bytes of UTCB per thread
pub const UTCB_SIZE: usize = PAGE_SIZE;

/// A task created by this process
#[derive(Debug)]
pub struct Task {
    cap: CapIdx,
    /// Base of the UTCB area inside the task
    utcb_base: usize,
    utcb_capacity: usize,
    utcb_next: usize,
}

impl Task {
    pub fn cap(&self) -> CapIdx {
        self.cap
    }

    pub fn utcb_base(&self) -> usize {
        self.utcb_base
    }

    /// Threads the UTCB area has room for
    pub fn utcb_capacity(&self) -> usize {
        self.utcb_capacity
    }

    /// Next unused UTCB address, if any remain
    pub fn alloc_utcb(&mut self) -> Option<usize> {
        if self.utcb_next >= self.utcb_capacity {
            return None;
        }
        let utcb = self.utcb_base + self.utcb_next * UTCB_SIZE;
        self.utcb_next += 1;
        Some(utcb)
    }
}

/// Where a thread is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Objects live and bound, not yet running
    Configured,
    /// Registers set and running
    Started,
}

/// A thread and its gate
#[derive(Debug)]
pub struct Thread {
    thread: CapIdx,
    gate: CapIdx,
    task: CapIdx,
    utcb: usize,
    state: ThreadState,
}

impl Thread {
    pub fn cap(&self) -> CapIdx {
        self.thread
    }

    pub fn gate(&self) -> CapIdx {
        self.gate
    }

    /// Task the thread runs in
    pub fn task(&self) -> CapIdx {
        self.task
    }

    pub fn utcb(&self) -> usize {
        self.utcb
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }
}

/// Kernel objects materialized so far by a thread build
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Built {
    Nothing,
    Thread,
    ThreadAndGate,
}

/// Creates and tears down tasks and threads
pub struct LifecycleManager<'k, K: Microkernel> {
    kernel: &'k K,
    slots: CapSlotPool,
    /// Thread every gate is bound to
    pager: CapIdx,
    /// Thread/gate slot pairs whose objects may still be live
    quarantined: Vec<(CapIdx, CapIdx)>,
}

impl<'k, K: Microkernel> LifecycleManager<'k, K> {
    /// Create a lifecycle manager
    ///
    /// # Arguments
    /// * `kernel` - Kernel interface
    /// * `slots` - Slot pool this manager owns from now on
    /// * `pager` - Thread that serves every gate created here
    pub fn new(kernel: &'k K, slots: CapSlotPool, pager: CapIdx) -> Self {
        Self {
            kernel,
            slots,
            pager,
            quarantined: Vec::new(),
        }
    }

    pub fn slots(&self) -> &CapSlotPool {
        &self.slots
    }

    /// Thread/gate pairs kept out of the pool after a failed deletion
    pub fn quarantined(&self) -> &[(CapIdx, CapIdx)] {
        &self.quarantined
    }

    /// Create a task
    ///
    /// # Arguments
    /// * `name` - Debug name; naming failures are only logged
    /// * `utcb_area` - Base of the UTCB area inside the new task
    /// * `utcb_log2_size` - log2 of the UTCB area size
    pub fn create_task(
        &mut self,
        name: Option<&str>,
        utcb_area: usize,
        utcb_log2_size: u8,
    ) -> Result<Task> {
        if (utcb_log2_size as usize) < PAGE_SHIFT || (utcb_log2_size as u32) >= usize::BITS {
            return Err(CapabilityError::InvalidArgument("utcb area smaller than a page"));
        }

        let cap = self.slots.allocate()?;
        let area = Fpage::memory(utcb_area, utcb_log2_size, FpageRights::empty());
        if let Err(err) = self.kernel.create_task(cap, area) {
            self.release(cap);
            return Err(rejected("create_task")(err));
        }
        log::debug!("lifecycle: task {:#x} created, utcb area {:#x}", cap.raw(), area.base());

        if let Some(name) = name {
            if let Err(err) = self.kernel.set_object_name(cap, name) {
                log::debug!("lifecycle: naming task {:#x} failed: {}", cap.raw(), err);
            }
        }

        Ok(Task {
            cap,
            utcb_base: area.base(),
            utcb_capacity: area.size() / UTCB_SIZE,
            utcb_next: 0,
        })
    }

    /// Create a thread in `parent` with its UTCB at `utcb`
    ///
    /// Either everything succeeds and the thread is Configured, or every
    /// object created along the way is deleted and both slots are released.
    /// If a rollback deletion fails, the slots are quarantined instead.
    pub fn create_thread(&mut self, utcb: usize, parent: &Task) -> Result<Thread> {
        let thread = self.slots.allocate()?;
        let gate = match self.slots.allocate() {
            Ok(gate) => gate,
            Err(err) => {
                self.release(thread);
                return Err(err);
            }
        };

        let mut built = Built::Nothing;
        if let Err(err) = self.build_thread(thread, gate, utcb, parent.cap(), &mut built) {
            log::warn!(
                "lifecycle: thread build failed ({}), rolling back {:?}",
                err,
                built
            );
            self.unwind(thread, gate, built);
            return Err(err);
        }

        log::debug!(
            "lifecycle: thread {:#x} gate {:#x} in task {:#x} configured",
            thread.raw(),
            gate.raw(),
            parent.cap().raw()
        );
        Ok(Thread {
            thread,
            gate,
            task: parent.cap(),
            utcb,
            state: ThreadState::Configured,
        })
    }

    /// Create a thread at the task's next free UTCB
    pub fn spawn_thread(&mut self, parent: &mut Task) -> Result<Thread> {
        let utcb = parent.alloc_utcb().ok_or(CapabilityError::UtcbExhausted)?;
        self.create_thread(utcb, parent)
    }

    /// Set the entry point and stack of a Configured thread and let it run
    pub fn start_thread(&self, thread: &mut Thread, ip: usize, sp: usize) -> Result<()> {
        if thread.state != ThreadState::Configured {
            return Err(CapabilityError::InvalidArgument("thread already started"));
        }

        self.kernel
            .thread_ex_regs(thread.thread, ip, sp)
            .map_err(rejected("thread_ex_regs"))?;
        thread.state = ThreadState::Started;
        log::debug!("lifecycle: thread {:#x} started at {:#x}", thread.thread.raw(), ip);
        Ok(())
    }

    /// Delete a thread and its gate
    ///
    /// Both deletions are attempted. If either fails, neither slot is reused:
    /// the pair is quarantined and [`CapabilityError::PartialTeardown`] is
    /// returned.
    pub fn delete_thread(&mut self, thread: Thread) -> Result<()> {
        let thread_gone = self.kernel.delete_object(thread.thread);
        let gate_gone = self.kernel.delete_object(thread.gate);

        if let (Ok(()), Ok(())) = (&thread_gone, &gate_gone) {
            log::debug!(
                "lifecycle: thread {:#x} gate {:#x} deleted",
                thread.thread.raw(),
                thread.gate.raw()
            );
            self.release(thread.gate);
            self.release(thread.thread);
            return Ok(());
        }

        log::warn!(
            "lifecycle: teardown of thread {:#x} ({:?}) gate {:#x} ({:?}) incomplete, slots quarantined",
            thread.thread.raw(),
            thread_gone,
            thread.gate.raw(),
            gate_gone
        );
        self.quarantined.push((thread.thread, thread.gate));
        Err(CapabilityError::PartialTeardown {
            thread: thread.thread.raw(),
            gate: thread.gate.raw(),
        })
    }

    /// Change a thread's scheduling priority
    pub fn set_priority(&self, thread: CapIdx, priority: u32) -> Result<()> {
        self.kernel
            .run_thread(thread, SchedParam::new(priority))
            .map_err(rejected("run_thread"))
    }

    /// Revoke `[start, end)` from `task`, from every address space it was
    /// mapped on to
    ///
    /// Returns the number of unmap batches issued. An invalid task handle is
    /// a no-op.
    pub fn flush_regions(
        &self,
        task: CapIdx,
        start: usize,
        end: usize,
        rights: FpageRights,
    ) -> Result<usize> {
        if task.is_invalid() {
            return Ok(0);
        }

        let mut pages = RegionPages::new(start, end, rights);
        let mut batch = [Fpage::memory(0, PAGE_SHIFT as u8, rights); FLUSH_BATCH];
        let mut batches = 0;

        loop {
            let mut n = 0;
            for (slot, page) in batch.iter_mut().zip(pages.by_ref()) {
                *slot = page;
                n += 1;
            }
            if n == 0 {
                break;
            }

            self.kernel
                .unmap_batch(task, &batch[..n])
                .map_err(rejected("unmap_batch"))?;
            batches += 1;
        }

        log::debug!(
            "lifecycle: flushed {:#x}~{:#x} from task {:#x} in {} batches",
            start,
            end,
            task.raw(),
            batches
        );
        Ok(batches)
    }

    fn build_thread(
        &self,
        thread: CapIdx,
        gate: CapIdx,
        utcb: usize,
        task: CapIdx,
        built: &mut Built,
    ) -> Result<()> {
        self.kernel
            .create_thread(thread)
            .map_err(rejected("create_thread"))?;
        *built = Built::Thread;

        self.kernel
            .create_gate(gate, self.pager, thread.raw())
            .map_err(rejected("create_gate"))?;
        *built = Built::ThreadAndGate;

        self.kernel
            .map_object(task, Fpage::object(gate, FpageRights::RWX))
            .map_err(rejected("map_object"))?;

        let control = ThreadControl {
            pager: gate,
            exc_handler: gate,
            utcb,
            bind_task: task,
        };
        self.kernel
            .thread_control(thread, &control)
            .map_err(rejected("thread_control"))
    }

    /// Delete what a failed build created and release both slots
    ///
    /// A slot whose object survives its rollback deletion still names that
    /// object, so the pair is quarantined instead.
    fn unwind(&mut self, thread: CapIdx, gate: CapIdx, built: Built) {
        let mut clean = true;
        if built >= Built::ThreadAndGate {
            if let Err(err) = self.kernel.delete_object(gate) {
                log::warn!("lifecycle: rollback of gate {:#x} failed: {}", gate.raw(), err);
                clean = false;
            }
        }
        if built >= Built::Thread {
            if let Err(err) = self.kernel.delete_object(thread) {
                log::warn!("lifecycle: rollback of thread {:#x} failed: {}", thread.raw(), err);
                clean = false;
            }
        }

        if clean {
            self.release(gate);
            self.release(thread);
        } else {
            log::warn!(
                "lifecycle: thread {:#x} gate {:#x} slots quarantined after rollback",
                thread.raw(),
                gate.raw()
            );
            self.quarantined.push((thread, gate));
        }
    }

    fn release(&mut self, cap: CapIdx) {
        if let Err(err) = self.slots.free(cap) {
            log::warn!("lifecycle: slot {:#x} not released: {}", cap.raw(), err);
        }
    }
}
