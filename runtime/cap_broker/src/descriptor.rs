//! x86 segment descriptors for thread-local storage
//!
//! A thread-area request arrives as a [`UserDesc`] (the `set_thread_area`
//! layout) and is packed into an 8-byte [`SegmentDescriptor`] for the GDT.
//! Packing and unpacking are total functions over plain values; the byte
//! layout only matters in [`SegmentDescriptor::to_bytes`].

use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// GDT entries reserved for thread-local segments
pub const GDT_ENTRY_TLS_ENTRIES: usize = 3;

/// Size of one packed descriptor
pub const LDT_ENTRY_SIZE: usize = 8;

/// Thread-area request as passed to `set_thread_area`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserDesc {
    /// GDT entry to write, or -1 to have one picked
    pub entry_number: i32,
    pub base_addr: u32,
    /// 20-bit segment limit
    pub limit: u32,
    pub seg_32bit: bool,
    /// Segment contents (data, stack, code), two bits
    pub contents: u8,
    pub read_exec_only: bool,
    pub limit_in_pages: bool,
    pub seg_not_present: bool,
    pub useable: bool,
    /// Long-mode request; never honored for thread-local segments
    pub lm: bool,
}

impl UserDesc {
    /// The request that clears an entry
    pub const fn empty(entry_number: i32) -> Self {
        Self {
            entry_number,
            base_addr: 0,
            limit: 0,
            seg_32bit: false,
            contents: 0,
            read_exec_only: true,
            limit_in_pages: false,
            seg_not_present: true,
            useable: false,
            lm: false,
        }
    }

    /// Does this request clear the entry instead of describing a segment?
    pub fn is_empty(&self) -> bool {
        self.base_addr == 0
            && self.limit == 0
            && self.contents == 0
            && self.read_exec_only
            && !self.seg_32bit
            && !self.limit_in_pages
            && self.seg_not_present
            && !self.useable
    }
}

bitflags! {
    /// Single-bit fields of the descriptor's high word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct HighFlags: u32 {
        /// Code/data rather than system segment
        const S = 1 << 12;
        const PRESENT = 1 << 15;
        const AVL = 1 << 20;
        const LONG = 1 << 21;
        const DB = 1 << 22;
        const GRANULARITY = 1 << 23;
    }
}

const DPL_SHIFT: u32 = 13;
const TYPE_SHIFT: u32 = 8;

/// Packed hardware segment descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct SegmentDescriptor {
    a: u32,
    b: u32,
}

const_assert_eq!(core::mem::size_of::<SegmentDescriptor>(), LDT_ENTRY_SIZE);

/// Fields of a descriptor, unpacked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorFields {
    pub base: u32,
    pub limit: u32,
    /// Four-bit segment type
    pub seg_type: u8,
    pub system: bool,
    pub dpl: u8,
    pub present: bool,
    pub available: bool,
    pub long_mode: bool,
    pub default_32bit: bool,
    pub granularity: bool,
}

impl SegmentDescriptor {
    /// All-zero descriptor, as installed for cleared entries
    pub const EMPTY: Self = Self { a: 0, b: 0 };

    /// Pack a thread-area request
    ///
    /// The descriptor is always user-privilege, code/data, and never
    /// long-mode, whatever the request says.
    pub fn encode(info: &UserDesc) -> Self {
        let base = info.base_addr;
        let limit = info.limit;
        let seg_type = (((!info.read_exec_only) as u32) << 1) | (((info.contents & 3) as u32) << 2);

        let mut flags = HighFlags::S;
        flags.set(HighFlags::PRESENT, !info.seg_not_present);
        flags.set(HighFlags::AVL, info.useable);
        flags.set(HighFlags::DB, info.seg_32bit);
        flags.set(HighFlags::GRANULARITY, info.limit_in_pages);

        let a = (limit & 0xffff) | ((base & 0xffff) << 16);
        let b = ((base >> 16) & 0xff)
            | (seg_type << TYPE_SHIFT)
            | (3 << DPL_SHIFT)
            | (limit & 0xf_0000)
            | (base & 0xff00_0000)
            | flags.bits();

        Self { a, b }
    }

    /// Unpack every field
    pub fn decode(&self) -> DescriptorFields {
        let flags = HighFlags::from_bits_truncate(self.b);
        DescriptorFields {
            base: (self.a >> 16) | ((self.b & 0xff) << 16) | (self.b & 0xff00_0000),
            limit: (self.a & 0xffff) | (self.b & 0xf_0000),
            seg_type: ((self.b >> TYPE_SHIFT) & 0xf) as u8,
            system: flags.contains(HighFlags::S),
            dpl: ((self.b >> DPL_SHIFT) & 3) as u8,
            present: flags.contains(HighFlags::PRESENT),
            available: flags.contains(HighFlags::AVL),
            long_mode: flags.contains(HighFlags::LONG),
            default_32bit: flags.contains(HighFlags::DB),
            granularity: flags.contains(HighFlags::GRANULARITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Low and high words
    pub fn words(&self) -> (u32, u32) {
        (self.a, self.b)
    }

    /// Little-endian bytes as loaded into the GDT
    pub fn to_bytes(&self) -> [u8; LDT_ENTRY_SIZE] {
        let mut out = [0; LDT_ENTRY_SIZE];
        out[..4].copy_from_slice(&self.a.to_le_bytes());
        out[4..].copy_from_slice(&self.b.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; LDT_ENTRY_SIZE]) -> Self {
        let [a0, a1, a2, a3, b0, b1, b2, b3] = bytes;
        Self {
            a: u32::from_le_bytes([a0, a1, a2, a3]),
            b: u32::from_le_bytes([b0, b1, b2, b3]),
        }
    }
}

impl DescriptorFields {
    /// The thread-area request that packs to these fields
    ///
    /// Only meaningful for user code/data descriptors.
    pub fn to_user_desc(&self, entry_number: i32) -> UserDesc {
        UserDesc {
            entry_number,
            base_addr: self.base,
            limit: self.limit,
            seg_32bit: self.default_32bit,
            contents: (self.seg_type >> 2) & 3,
            read_exec_only: self.seg_type & 0x2 == 0,
            limit_in_pages: self.granularity,
            seg_not_present: !self.present,
            useable: self.available,
            lm: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_data() -> UserDesc {
        UserDesc {
            entry_number: 6,
            base_addr: 0x1234_5678,
            limit: 0xfffff,
            seg_32bit: true,
            contents: 0,
            read_exec_only: false,
            limit_in_pages: true,
            seg_not_present: false,
            useable: true,
            lm: false,
        }
    }

    #[test]
    fn test_encode_flat_data_segment() {
        let desc = SegmentDescriptor::encode(&flat_data());
        let (a, b) = desc.words();
        assert_eq!(a, 0x5678_ffff);
        // base[23:16]=0x34, type=0x2, S, DPL3, P, limit[19:16]=0xf, AVL, D, G, base[31:24]=0x12
        assert_eq!(b, 0x12df_f234);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let info = UserDesc {
            contents: 1,
            ..flat_data()
        };
        let fields = SegmentDescriptor::encode(&info).decode();
        assert_eq!(fields.base, 0x1234_5678);
        assert_eq!(fields.limit, 0xfffff);
        assert_eq!(fields.seg_type, 0x6);
        assert_eq!(fields.dpl, 3);
        assert!(fields.system);
        assert!(fields.present);
        assert!(!fields.long_mode);

        let back = fields.to_user_desc(6);
        assert!(!back.lm);
        assert_eq!(back, info);
    }

    #[test]
    fn test_long_mode_never_set() {
        let info = UserDesc {
            lm: true,
            ..flat_data()
        };
        let fields = SegmentDescriptor::encode(&info).decode();
        assert!(!fields.long_mode);
    }

    #[test]
    fn test_contents_and_read_exec_only_form_type() {
        let info = UserDesc {
            contents: 2,
            read_exec_only: true,
            ..flat_data()
        };
        assert_eq!(SegmentDescriptor::encode(&info).decode().seg_type, 0x8);

        let info = UserDesc {
            contents: 1,
            read_exec_only: false,
            ..flat_data()
        };
        assert_eq!(SegmentDescriptor::encode(&info).decode().seg_type, 0x6);
    }

    #[test]
    fn test_empty_pattern() {
        assert!(UserDesc::empty(7).is_empty());
        assert!(!flat_data().is_empty());

        let almost = UserDesc {
            useable: true,
            ..UserDesc::empty(7)
        };
        assert!(!almost.is_empty());
    }

    #[test]
    fn test_byte_layout() {
        let desc = SegmentDescriptor::encode(&flat_data());
        let bytes = desc.to_bytes();
        assert_eq!(bytes, [0xff, 0xff, 0x78, 0x56, 0x34, 0xf2, 0xdf, 0x12]);
        assert_eq!(SegmentDescriptor::from_bytes(bytes), desc);
        assert_eq!(SegmentDescriptor::EMPTY.to_bytes(), [0; 8]);
    }
}
