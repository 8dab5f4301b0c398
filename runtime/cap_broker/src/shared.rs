//! Memory and messages shared with the companion OS
//!
//! The IPC buffer the companion hands over at boot is laid out as
//!
//! ```text
//! +----------------------+ ipc buffer start
//! | sync call buffer     |  SYNC_CALL_BUF_SIZE
//! +----------------------+
//! | control block        |  CONTROL_BLOCK_SIZE
//! +----------------------+
//! | completion queue     |  rest of the buffer
//! +----------------------+ ipc buffer end
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use l4_platform::{MsgTag, Word};
use static_assertions::const_assert_eq;

use crate::{CapabilityError, Result};

/// Synchronous-call area at the start of the IPC buffer
pub const SYNC_CALL_BUF_SIZE: usize = 68 * 1024;

/// Smallest synchronous-call area the runtime accepts
pub const MIN_SYNC_CALL_BUF_SIZE: usize = 65 * 1024;

/// Space reserved for the control block
pub const CONTROL_BLOCK_SIZE: usize = 4096;

/// IPC buffer size the companion normally offers
pub const IPC_BUF_SIZE: usize = 2 * 1024 * 1024;

/// State shared with the companion, at the start of the control block area
///
/// Updated by both sides without locks; the single naturally aligned word is
/// the only atomicity there is.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ControlBlock {
    /// Replies the companion still owes us
    pending_reply_count: AtomicU32,
}

const_assert_eq!(core::mem::size_of::<ControlBlock>(), 4);

impl ControlBlock {
    pub const fn new() -> Self {
        Self {
            pending_reply_count: AtomicU32::new(0),
        }
    }

    /// View the control block at `addr`
    ///
    /// # Safety
    /// `addr` must point at a mapped, 4-byte aligned control block that
    /// stays mapped for `'a`.
    pub unsafe fn from_addr<'a>(addr: usize) -> &'a Self {
        debug_assert_eq!(addr % core::mem::align_of::<Self>(), 0);
        // SAFETY: upheld by the caller.
        unsafe { &*(addr as *const Self) }
    }

    pub fn pending_replies(&self) -> u32 {
        self.pending_reply_count.load(Ordering::Relaxed)
    }

    /// A request went out that the companion will answer asynchronously
    pub fn reply_expected(&self) {
        self.pending_reply_count.fetch_add(1, Ordering::Relaxed);
    }

    /// An asynchronous reply came back; never drops below zero
    pub fn reply_received(&self) {
        let _ = self
            .pending_reply_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

/// Labels of messages exchanged with the companion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CompanionLabel {
    /// Forwarded system call
    Ipc = 2,
    /// Drain the completion queue
    FlushRetQueue = 3,
    /// Control command, see [`CompanionCommand`]
    Cmd = 4,
}

impl CompanionLabel {
    /// Message tag carrying this label
    pub fn tag(self, words: Word, items: Word) -> MsgTag {
        MsgTag::new(self as Word, words, items, 0)
    }
}

impl TryFrom<Word> for CompanionLabel {
    type Error = CapabilityError;

    fn try_from(label: Word) -> Result<Self> {
        match label {
            2 => Ok(Self::Ipc),
            3 => Ok(Self::FlushRetQueue),
            4 => Ok(Self::Cmd),
            _ => Err(CapabilityError::Handshake("unknown message label")),
        }
    }
}

/// Control commands, carried in the first word of a `Cmd` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CompanionCommand {
    Kickstart = 0,
    EnableProfiler = 1,
    DisableProfiler = 2,
    FlushConsole = 3,
}

impl TryFrom<Word> for CompanionCommand {
    type Error = CapabilityError;

    fn try_from(cmd: Word) -> Result<Self> {
        match cmd {
            0 => Ok(Self::Kickstart),
            1 => Ok(Self::EnableProfiler),
            2 => Ok(Self::DisableProfiler),
            3 => Ok(Self::FlushConsole),
            _ => Err(CapabilityError::Handshake("unknown command")),
        }
    }
}
