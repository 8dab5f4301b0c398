//! Integration tests for the complete capability core
//!
//! These tests drive end-to-end workflows against the mock kernel:
//! - Boot: pager gate, TLS range, memory regions, companion handshake
//! - Thread lifecycle with failures injected at every kernel step
//! - Region flushing across unmap batches
//! - Block allocator and managed heap over boot-provided memory

use cap_broker::*;
use l4_platform::mock::{KernelOp, MockKernel, ObjectKind, Transfer};
use l4_platform::{CapIdx, FpageRights, KernelError, Message, Microkernel, SUPERPAGE_SHIFT};
use managed_heap::BumpHeap;

const COMPANION_MEM: usize = 32 * 1024 * 1024;
const UTCB_AREA: usize = 0xb300_0000;
/// log2 of the threads one task's UTCB area holds
const THREADS_PER_TASK_LOG2: usize = 5;

/// Mock kernel with both environment gates and a queued handshake
fn companion_ready(ipc_buf_size: usize, control_block_off: usize) -> (MockKernel, CapIdx) {
    let kernel = MockKernel::new();
    let companion = kernel.add_env_gate("linux_server");
    kernel.add_env_gate("vandroid");
    kernel.queue_message(
        Message::new(
            CompanionLabel::Cmd.tag(4, 2),
            &[
                CompanionCommand::Kickstart as usize,
                ipc_buf_size,
                control_block_off,
                COMPANION_MEM,
            ],
        ),
        &[
            Transfer::Dataspace { size: ipc_buf_size },
            Transfer::Dataspace { size: COMPANION_MEM },
        ],
    );
    (kernel, companion)
}

fn small_config() -> BootConfig {
    BootConfig {
        main_memory_size: 4 * 1024 * 1024,
        stack_and_heap_size: 8 * 1024 * 1024,
        ..BootConfig::default()
    }
}

/// Test complete system initialization
#[test]
fn test_full_system_initialization() {
    let (kernel, companion) = companion_ready(IPC_BUF_SIZE, SYNC_CALL_BUF_SIZE);
    let config = BootConfig::default();

    let system = init(&kernel, &config).expect("Failed to boot");
    let ctx = &system.context;

    // 1. Main thread runs at the configured priority
    let main = kernel.main_thread();
    assert_eq!(kernel.sched_param(main).map(|p| p.priority), Some(10));

    // 2. Own gate bound to the main thread, labelled with the companion
    assert!(kernel
        .gate_bindings()
        .iter()
        .any(|(_, thread, label)| *thread == main && *label == companion.raw()));
    assert_eq!(ctx.companion(), companion);

    // 3. Memory regions are superpage aligned and sized as configured
    assert_eq!(ctx.main_memory().size, config.main_memory_size);
    assert_eq!(ctx.main_memory().start % (1 << SUPERPAGE_SHIFT), 0);
    assert_eq!(ctx.stack_top(), ctx.heap().start);
    assert_eq!(ctx.heap().end(), ctx.layout().stack_and_heap.end());

    // 4. Boot parameters describe the shared buffer split
    let params = ctx.boot_params().expect("Failed to assemble boot params");
    let ipc = ctx.shared().ipc_buffer;
    assert_eq!(params.companion_tid, companion.raw());
    assert_eq!(params.sync_ipc_shm_base, ipc.start);
    assert_eq!(params.sync_ipc_shm_size, SYNC_CALL_BUF_SIZE);
    assert_eq!(
        params.completion_queue_start,
        ipc.start + SYNC_CALL_BUF_SIZE + CONTROL_BLOCK_SIZE
    );
    assert_eq!(
        params.completion_queue_size,
        IPC_BUF_SIZE - SYNC_CALL_BUF_SIZE - CONTROL_BLOCK_SIZE
    );
    assert_eq!(params.companion_memory_size, COMPANION_MEM);
    assert_eq!(ctx.shared().control_block, ipc.start + SYNC_CALL_BUF_SIZE);

    // 5. TLS range comes from the kernel
    assert_eq!(system.tls.entry_range().count(), GDT_ENTRY_TLS_ENTRIES);
}

/// Test that boot stops before touching memory when the companion is absent
#[test]
fn test_boot_without_companion() {
    let kernel = MockKernel::new();
    kernel.add_env_gate("vandroid");

    let err = init(&kernel, &BootConfig::default()).err().expect("Boot should fail");
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(kernel.count(KernelOp::MemAlloc), 0);
}

/// Test that a failed handshake is a protocol violation, not a hang
#[test]
fn test_boot_handshake_never_arrives() {
    let kernel = MockKernel::new();
    kernel.add_env_gate("linux_server");
    kernel.add_env_gate("vandroid");

    let err = init(&kernel, &small_config()).err().expect("Boot should fail");
    assert!(matches!(
        err,
        CapabilityError::Kernel {
            op: "ipc_wait",
            err: KernelError::IpcTimeout
        }
    ));
}

/// Test that a synchronous buffer below the minimum is refused
#[test]
fn test_boot_params_minimum_sync_buffer() {
    let (kernel, _) = companion_ready(IPC_BUF_SIZE, 64 * 1024);
    let config = BootConfig {
        sync_call_buf_size: 64 * 1024,
        ..small_config()
    };

    let system = init(&kernel, &config).expect("Failed to boot");
    assert!(matches!(
        system.context.boot_params(),
        Err(CapabilityError::InvalidArgument(_))
    ));
}

/// Test an IPC buffer too small for the completion queue
#[test]
fn test_completion_queue_needs_room() {
    let (kernel, _) = companion_ready(SYNC_CALL_BUF_SIZE, 0);
    let system = init(&kernel, &small_config()).expect("Failed to boot");

    let err = system.context.boot_params().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
}

/// Test thread creation is all-or-nothing at every kernel step
#[test]
fn test_create_thread_atomicity() {
    for (step, op) in [
        KernelOp::CreateThread,
        KernelOp::CreateGate,
        KernelOp::MapObject,
        KernelOp::ThreadControl,
    ]
    .into_iter()
    .enumerate()
    {
        let (kernel, _) = companion_ready(IPC_BUF_SIZE, SYNC_CALL_BUF_SIZE);
        let mut system = init(&kernel, &small_config()).expect("Failed to boot");
        let lifecycle = &mut system.lifecycle;
        let task = lifecycle
            .create_task(Some("app"), UTCB_AREA, 12)
            .expect("Failed to create task");

        let slots_before = lifecycle.slots().in_use();
        let threads_before = kernel.live_count(|k| k == ObjectKind::Thread);
        let gates_before = kernel.live_count(|k| k == ObjectKind::Gate);

        kernel.fail_next(op, KernelError::NoMemory);
        let err = lifecycle
            .create_thread(UTCB_AREA, &task)
            .expect_err("Injected failure should surface");
        assert_eq!(err.kind(), ErrorKind::KernelRejection, "step {}", step);

        assert_eq!(lifecycle.slots().in_use(), slots_before, "step {}", step);
        assert_eq!(
            kernel.live_count(|k| k == ObjectKind::Thread),
            threads_before,
            "step {}",
            step
        );
        assert_eq!(
            kernel.live_count(|k| k == ObjectKind::Gate),
            gates_before,
            "step {}",
            step
        );

        // The next attempt reuses the released slots and succeeds
        let thread = lifecycle
            .create_thread(UTCB_AREA, &task)
            .expect("Retry should succeed");
        assert_eq!(thread.state(), ThreadState::Configured);
    }
}

/// Test spawning, starting and deleting threads in one task
#[test]
fn test_thread_lifecycle_workflow() {
    let (kernel, _) = companion_ready(IPC_BUF_SIZE, SYNC_CALL_BUF_SIZE);
    let mut system = init(&kernel, &small_config()).expect("Failed to boot");
    let lifecycle = &mut system.lifecycle;

    let mut task = lifecycle
        .create_task(Some("app"), UTCB_AREA, 12 + THREADS_PER_TASK_LOG2 as u8)
        .expect("Failed to create task");
    assert_eq!(task.utcb_capacity(), 1 << THREADS_PER_TASK_LOG2);

    let mut first = lifecycle.spawn_thread(&mut task).expect("Failed to spawn");
    let second = lifecycle.spawn_thread(&mut task).expect("Failed to spawn");
    assert_eq!(second.utcb(), first.utcb() + UTCB_SIZE);
    assert_ne!(first.cap(), second.cap());
    assert_ne!(first.gate(), second.gate());

    lifecycle
        .start_thread(&mut first, 0x0804_8000, 0xbfff_0000)
        .expect("Failed to start");
    assert_eq!(first.state(), ThreadState::Started);

    let (gate, thread) = (second.gate(), second.cap());
    lifecycle.delete_thread(second).expect("Failed to delete");
    assert!(!kernel.is_live(thread));
    assert!(!kernel.is_live(gate));

    // Released slots come back last-in first-out
    let third = lifecycle.spawn_thread(&mut task).expect("Failed to spawn");
    assert_eq!(third.cap(), thread);
    assert_eq!(third.gate(), gate);
}

/// Test that a half-failed deletion never releases either slot
#[test]
fn test_partial_teardown_quarantine() {
    let (kernel, _) = companion_ready(IPC_BUF_SIZE, SYNC_CALL_BUF_SIZE);
    let mut system = init(&kernel, &small_config()).expect("Failed to boot");
    let lifecycle = &mut system.lifecycle;

    let mut task = lifecycle.create_task(None, UTCB_AREA, 14).expect("task");
    let thread = lifecycle.spawn_thread(&mut task).expect("thread");
    let (t, g) = (thread.cap(), thread.gate());
    let in_use = lifecycle.slots().in_use();

    kernel.fail_next(KernelOp::DeleteObject, KernelError::Busy);
    let err = lifecycle.delete_thread(thread).unwrap_err();
    assert_eq!(
        err,
        CapabilityError::PartialTeardown {
            thread: t.raw(),
            gate: g.raw()
        }
    );
    assert_eq!(lifecycle.slots().in_use(), in_use);
    assert_eq!(lifecycle.quarantined(), &[(t, g)]);

    // Gate deletion was still attempted
    assert!(kernel.is_live(t));
    assert!(!kernel.is_live(g));

    let next = lifecycle.spawn_thread(&mut task).expect("thread");
    assert!(![t, g].contains(&next.cap()));
    assert!(![t, g].contains(&next.gate()));
}

/// Test that flushing covers the range exactly, in bounded batches
#[test]
#[cfg(target_pointer_width = "64")]
fn test_flush_regions_batches() {
    let (kernel, _) = companion_ready(IPC_BUF_SIZE, SYNC_CALL_BUF_SIZE);
    let mut system = init(&kernel, &small_config()).expect("Failed to boot");
    let task = system
        .lifecycle
        .create_task(None, UTCB_AREA, 12)
        .expect("task");

    let (start, end) = (0x1000usize, (1usize << 47) - 0x1000);
    let batches = system
        .lifecycle
        .flush_regions(task.cap(), start + 0x123, end + 0x456, FpageRights::RWX)
        .expect("Failed to flush");
    assert_eq!(batches, 2);

    let issued = kernel.unmap_batches();
    assert_eq!(issued.len(), 2);
    assert_eq!(issued[0].1.len(), FLUSH_BATCH);

    let mut cursor = start;
    for (target, fpages) in &issued {
        assert_eq!(*target, task.cap());
        assert!(fpages.len() <= FLUSH_BATCH);
        for fp in fpages {
            assert_eq!(fp.base(), cursor);
            assert_eq!(fp.base() % fp.size(), 0);
            assert_eq!(fp.rights(), FpageRights::RWX);
            cursor = fp.end();
        }
    }
    assert_eq!(cursor, end);
}

/// Test a flush failing in the kernel is reported
#[test]
fn test_flush_regions_kernel_failure() {
    let (kernel, _) = companion_ready(IPC_BUF_SIZE, SYNC_CALL_BUF_SIZE);
    let mut system = init(&kernel, &small_config()).expect("Failed to boot");
    let task = system.lifecycle.create_task(None, UTCB_AREA, 12).expect("task");

    kernel.fail_next(KernelOp::UnmapBatch, KernelError::InvalidArgument);
    let err = system
        .lifecycle
        .flush_regions(task.cap(), 0x1000, 0x5000, FpageRights::RW)
        .unwrap_err();
    assert!(matches!(err, CapabilityError::Kernel { op: "unmap_batch", .. }));
}

/// Test thread-local descriptors installed for a spawned thread
#[test]
fn test_tls_for_spawned_thread() {
    let (kernel, _) = companion_ready(IPC_BUF_SIZE, SYNC_CALL_BUF_SIZE);
    let mut system = init(&kernel, &small_config()).expect("Failed to boot");
    let mut task = system.lifecycle.create_task(None, UTCB_AREA, 12).expect("task");
    let thread = system.lifecycle.spawn_thread(&mut task).expect("thread");

    let table = system.tls.alloc_table().expect("Failed to allocate table");
    let mut info = UserDesc {
        entry_number: -1,
        base_addr: 0x4000_1000,
        limit: 0xfffff,
        seg_32bit: true,
        limit_in_pages: true,
        useable: true,
        ..UserDesc::default()
    };
    system
        .tls
        .set_thread_area(thread.cap(), &table, -1, &mut info, true)
        .expect("Failed to set thread area");
    assert_eq!(info.entry_number as usize, *system.tls.entry_range().start());

    let installs = kernel.gdt_installs();
    let (target, bytes, first) = installs.last().expect("descriptors installed");
    assert_eq!(*target, thread.cap());
    assert_eq!(*first, 0);
    let packed: [u8; LDT_ENTRY_SIZE] = bytes[..LDT_ENTRY_SIZE].try_into().expect("8 bytes");
    let fields = SegmentDescriptor::from_bytes(packed).decode();
    assert_eq!(fields.base, 0x4000_1000);
    assert_eq!(fields.dpl, 3);
    assert!(!fields.long_mode);

    system.tls.free_table(table);
    assert_eq!(system.tls.slab().available(), TLS_SLAB_SLOTS);
}

/// Test the block allocator round trip over a main-memory sized window
#[test]
fn test_block_allocator_round_trip() {
    let base = 0x1000_0000;
    let size = 256 * CHUNK_SIZE;
    let mut backing = vec![0x5Au8; size];
    let window = BufferWindow::new(base, &mut backing);
    let mut alloc = BlockAllocator::new(base..base + size, window).expect("Failed to seed");
    let initial: Vec<usize> = alloc.chunks().collect();

    let mut held = Vec::new();
    for request in [1, CHUNK_SIZE, 3 * CHUNK_SIZE, 8 * CHUNK_SIZE, 5000, 32 * CHUNK_SIZE] {
        let addr = alloc.alloc(request).expect("Failed to allocate");
        let block = request.max(CHUNK_SIZE).next_power_of_two();
        assert_eq!(addr % block, 0);

        let off = addr - base;
        assert!(alloc.memory().bytes()[off..off + block].iter().all(|b| *b == 0));
        held.push((addr, block));
    }

    // Blocks never overlap
    held.sort();
    for pair in held.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0);
    }

    for (addr, block) in held.into_iter().rev() {
        alloc.free(addr, block).expect("Failed to free");
    }
    let restored: Vec<usize> = alloc.chunks().collect();
    assert_eq!(restored, initial);
}

/// Test the managed heap carved from a boot-sized heap region
#[test]
fn test_managed_heap_exhaustion() {
    let mut backing = vec![0xFFu8; 3 * 4096];
    let mut heap = BumpHeap::new(&mut backing);

    let first = heap.allocate_zeroed(4096).expect("Failed to allocate");
    assert!(first.iter().all(|b| *b == 0));
    heap.allocate_zeroed(8192).expect("Failed to allocate");

    let ptr = heap.heap_ptr();
    assert!(heap.allocate_zeroed(1).is_none());
    assert_eq!(heap.heap_ptr(), ptr);
    heap.log_status();
}
