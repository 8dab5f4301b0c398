//! Kernel ABI types
//!
//! Capability handles, flexpages, message tags and the flag words passed to
//! the memory allocator and region manager. Layouts follow the Fiasco.OC
//! ABI so the values can be handed to the real kernel unchanged.

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use thiserror::Error;

/// Machine word as seen by the kernel
pub type Word = usize;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// log2 of the page size
pub const PAGE_SHIFT: usize = 12;

/// log2 of a superpage (4MB on x86-32)
pub const SUPERPAGE_SHIFT: usize = 22;

/// Capability indices are slot numbers shifted by this amount
pub const CAP_SHIFT: usize = 12;

/// Number of message registers in the UTCB
pub const MSG_REGS: usize = 63;

/// Number of buffer registers in the UTCB
pub const BUF_REGS: usize = 58;

/// Capability index naming a kernel object in the caller's capability space
///
/// A handle is either valid or the invalid sentinel. Any value with bit
/// `CAP_SHIFT - 1` set is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CapIdx(Word);

const INVALID_CAP_BIT: Word = 1 << (CAP_SHIFT - 1);

impl CapIdx {
    /// The invalid sentinel
    pub const INVALID: CapIdx = CapIdx(!0 << (CAP_SHIFT - 1));

    /// Wrap a raw capability index
    pub const fn from_raw(raw: Word) -> Self {
        Self(raw)
    }

    /// Capability index for a slot number
    pub const fn from_slot(slot: usize) -> Self {
        Self(slot << CAP_SHIFT)
    }

    /// Raw value as passed to the kernel
    pub const fn raw(self) -> Word {
        self.0
    }

    /// Slot number this index names
    pub const fn slot(self) -> usize {
        self.0 >> CAP_SHIFT
    }

    pub const fn is_invalid(self) -> bool {
        self.0 & INVALID_CAP_BIT != 0
    }

    pub const fn is_valid(self) -> bool {
        !self.is_invalid()
    }
}

bitflags! {
    /// Access rights carried in the low bits of a flexpage
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FpageRights: Word {
        const X = 0x1;
        const W = 0x2;
        const R = 0x4;
        const RX = Self::R.bits() | Self::X.bits();
        const RW = Self::R.bits() | Self::W.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

/// What a flexpage refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum FpageKind {
    Memory = 1,
    Io = 2,
    Object = 3,
}

/// Flexpage: a naturally aligned, power-of-two sized region of some space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fpage {
    base: Word,
    order: u8,
    kind: FpageKind,
    rights: FpageRights,
}

const_assert_eq!(core::mem::size_of::<Word>(), core::mem::size_of::<*const u8>());

impl Fpage {
    const ORDER_SHIFT: usize = 6;
    const KIND_SHIFT: usize = 4;

    /// Memory flexpage of `1 << order` bytes at `base`
    ///
    /// `base` is truncated to the alignment implied by `order`.
    pub fn memory(base: Word, order: u8, rights: FpageRights) -> Self {
        Self {
            base: base & !Self::mask(order),
            order,
            kind: FpageKind::Memory,
            rights,
        }
    }

    /// Object flexpage naming a single capability
    pub fn object(cap: CapIdx, rights: FpageRights) -> Self {
        Self {
            base: cap.raw(),
            order: 0,
            kind: FpageKind::Object,
            rights,
        }
    }

    fn mask(order: u8) -> Word {
        if order as u32 >= Word::BITS {
            !0
        } else {
            (1 << order) - 1
        }
    }

    pub fn base(&self) -> Word {
        self.base
    }

    /// log2 of the size in bytes
    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn size(&self) -> Word {
        1 << self.order
    }

    /// One past the last byte covered
    pub fn end(&self) -> Word {
        self.base + self.size()
    }

    pub fn kind(&self) -> FpageKind {
        self.kind
    }

    pub fn rights(&self) -> FpageRights {
        self.rights
    }

    /// Packed word as passed in a message register
    pub fn raw(&self) -> Word {
        let base = match self.kind {
            FpageKind::Object => self.base & !(PAGE_SIZE - 1),
            _ => self.base,
        };
        base | ((self.order as Word) << Self::ORDER_SHIFT)
            | ((self.kind as Word) << Self::KIND_SHIFT)
            | self.rights.bits()
    }
}

/// Message tag: label, untyped word count, typed item count and flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct MsgTag(Word);

impl MsgTag {
    /// Error flag set by the kernel on failed IPC
    pub const ERROR: Word = 0x8000;

    pub const fn new(label: Word, words: Word, items: Word, flags: Word) -> Self {
        Self((label << 16) | (words & 0x3f) | ((items & 0x3f) << 6) | (flags & 0xf000))
    }

    pub const fn from_raw(raw: Word) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> Word {
        self.0
    }

    pub const fn label(self) -> Word {
        self.0 >> 16
    }

    pub const fn words(self) -> Word {
        self.0 & 0x3f
    }

    pub const fn items(self) -> Word {
        (self.0 >> 6) & 0x3f
    }

    pub const fn flags(self) -> Word {
        self.0 & 0xf000
    }

    pub const fn has_error(self) -> bool {
        self.0 & Self::ERROR != 0
    }
}

/// IPC timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until the partner is ready
    Never,
    /// Fail immediately if the partner is not ready
    Zero,
    /// Relative timeout in microseconds
    Micros(u32),
}

/// Scheduling parameter passed to the kernel scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedParam {
    pub priority: u32,
    /// Time quantum in microseconds, 0 selects the kernel default
    pub quantum: u32,
}

impl SchedParam {
    pub const fn new(priority: u32) -> Self {
        Self { priority, quantum: 0 }
    }
}

/// Thread configuration committed in a single `thread_control` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadControl {
    /// Gate that receives page faults
    pub pager: CapIdx,
    /// Gate that receives exceptions
    pub exc_handler: CapIdx,
    /// UTCB address inside `bind_task`
    pub utcb: Word,
    /// Task the thread runs in
    pub bind_task: CapIdx,
}

bitflags! {
    /// Memory allocator flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: Word {
        const CONTINUOUS = 0x01;
        const PINNED = 0x02;
        const SUPER_PAGES = 0x04;
    }
}

bitflags! {
    /// Region manager attach/reserve flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttachFlags: Word {
        const READ_ONLY = 0x01;
        const SEARCH_ADDR = 0x20;
        const IN_AREA = 0x40;
        const EAGER_MAP = 0x80;
        const OVERMAP = 0x100;
        const RESERVED = 0x200;
    }
}

bitflags! {
    /// Receive item flags for pre-armed buffer registers
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecvFlags: Word {
        const SINGLE_CAP = 0x08;
        const LOCAL_ID = 0x02;
    }
}

/// Buffer register armed to receive one capability
///
/// The kernel overwrites `cap` with what was actually received, or
/// [`CapIdx::INVALID`] when nothing arrived for this item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferItem {
    pub cap: CapIdx,
    pub flags: RecvFlags,
}

impl BufferItem {
    pub fn single_local(cap: CapIdx) -> Self {
        Self {
            cap,
            flags: RecvFlags::SINGLE_CAP | RecvFlags::LOCAL_ID,
        }
    }

    /// Raw buffer register value
    pub fn raw(&self) -> Word {
        self.cap.raw() | self.flags.bits()
    }
}

/// Received message: tag plus the message registers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: MsgTag,
    pub sender: Word,
    pub mr: [Word; MSG_REGS],
}

impl Message {
    pub fn new(tag: MsgTag, words: &[Word]) -> Self {
        let mut mr = [0; MSG_REGS];
        let n = words.len().min(MSG_REGS);
        mr[..n].copy_from_slice(&words[..n]);
        Self { tag, sender: 0, mr }
    }
}

/// Kernel error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("no such entity")]
    NoEntry,

    #[error("permission denied")]
    Permission,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("out of memory")]
    NoMemory,

    #[error("object busy")]
    Busy,

    #[error("object exists")]
    Exists,

    #[error("invalid capability")]
    InvalidCapability,

    #[error("IPC timeout")]
    IpcTimeout,

    #[error("IPC canceled")]
    IpcCanceled,

    #[error("kernel error code {0}")]
    Other(i32),
}

impl KernelError {
    /// Map a raw kernel return code, `0` meaning success
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code.unsigned_abs() {
            0 => return None,
            1 => Self::Permission,
            2 => Self::NoEntry,
            12 => Self::NoMemory,
            16 => Self::Busy,
            17 => Self::Exists,
            22 => Self::InvalidArgument,
            2001 => Self::InvalidCapability,
            2002 => Self::IpcTimeout,
            2003 => Self::IpcCanceled,
            _ => Self::Other(code),
        };
        Some(err)
    }

    /// Negative code as returned by the kernel
    pub fn code(self) -> i32 {
        match self {
            Self::Permission => -1,
            Self::NoEntry => -2,
            Self::NoMemory => -12,
            Self::Busy => -16,
            Self::Exists => -17,
            Self::InvalidArgument => -22,
            Self::InvalidCapability => -2001,
            Self::IpcTimeout => -2002,
            Self::IpcCanceled => -2003,
            Self::Other(code) => code,
        }
    }
}

/// Result of a kernel call
pub type KResult<T> = core::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_cap_sentinel() {
        assert!(CapIdx::INVALID.is_invalid());
        assert!(!CapIdx::INVALID.is_valid());

        let cap = CapIdx::from_slot(42);
        assert!(cap.is_valid());
        assert_eq!(cap.slot(), 42);
        assert_eq!(cap.raw(), 42 << CAP_SHIFT);
    }

    #[test]
    fn test_fpage_encoding() {
        let fp = Fpage::memory(0x0804_9123, 12, FpageRights::RW);
        assert_eq!(fp.base(), 0x0804_9000);
        assert_eq!(fp.size(), 4096);
        assert_eq!(fp.end(), 0x0804_a000);
        assert_eq!(fp.raw(), 0x0804_9000 | (12 << 6) | (1 << 4) | 0x6);
    }

    #[test]
    fn test_object_fpage() {
        let fp = Fpage::object(CapIdx::from_slot(7), FpageRights::RWX);
        assert_eq!(fp.kind(), FpageKind::Object);
        assert_eq!(fp.raw() & 0x7, 0x7);
        assert_eq!(fp.raw() >> CAP_SHIFT, 7);
    }

    #[test]
    fn test_msgtag_fields() {
        let tag = MsgTag::new(2, 5, 1, 0);
        assert_eq!(tag.label(), 2);
        assert_eq!(tag.words(), 5);
        assert_eq!(tag.items(), 1);
        assert!(!tag.has_error());

        let err = MsgTag::new(0, 0, 0, MsgTag::ERROR);
        assert!(err.has_error());
    }

    #[test]
    fn test_kernel_error_codes() {
        assert_eq!(KernelError::from_code(0), None);
        assert_eq!(KernelError::from_code(-22), Some(KernelError::InvalidArgument));
        assert_eq!(KernelError::from_code(-12), Some(KernelError::NoMemory));
        assert_eq!(KernelError::from_code(-99), Some(KernelError::Other(-99)));
        assert_eq!(KernelError::Busy.code(), -16);
    }
}
