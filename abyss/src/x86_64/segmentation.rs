//! Segmentation.

use super::PrivilegeLevel;

bitflags::bitflags! {
    /// X86_64's access permission of segment.
    pub struct SegmentAccess: u64 {
        /// Granularity
        const G = 1 << 55;
        /// Default operation size (0 = 16-bit segment; 1 = 32-bit segment)
        const D_B = 1 << 54;
        /// 64-bit code segment (IA-32e mode only)
        const L = 1 << 53;
        /// Available for use by system software
        const AVL = 1 << 52;

        /// Segment present
        const P = 1 << 47;
        /// Descriptor type  (0 = system; 1 = code or data).
        const S = 1 << 44;
        /// Data or Code
        const CODE = 1 << 43;
        /// Expand_down/Conforming.
        const EC = 1 << 42;
        /// Writable/Readable.
        const WR = 1 << 41;
        /// Accessed.
        const A = 1 << 40;
    }
}

impl SegmentAccess {
    const BASE_31_24_SHIFT: u64 = 56;
    const SEG_LIMIT_SHIFT: u64 = 48;
    const DPL_SHIFT: u64 = 45;
    const BASE_23_0_SHIFT: u64 = 16;
}

/// X86_64's Segment Descriptor.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    /// Create a null segment.
    #[inline]
    pub const fn null() -> Self {
        Self::new(0, 0, SegmentAccess::empty(), PrivilegeLevel::Ring0)
    }

    /// Flat 64-bit ring 0 code segment.
    #[inline]
    pub const fn kernel_code() -> Self {
        Self::new(
            0,
            0xfffff,
            SegmentAccess::from_bits_truncate(
                SegmentAccess::P.bits()
                | SegmentAccess::S.bits()
                | SegmentAccess::L.bits()
                | SegmentAccess::G.bits()
                // Code, readable.
                | SegmentAccess::CODE.bits()
                | SegmentAccess::WR.bits(),
            ),
            PrivilegeLevel::Ring0,
        )
    }

    /// Flat ring 0 data segment.
    #[inline]
    pub const fn kernel_data() -> Self {
        Self::new(
            0,
            0xfffff,
            SegmentAccess::from_bits_truncate(
                SegmentAccess::P.bits()
                | SegmentAccess::S.bits()
                | SegmentAccess::D_B.bits()
                | SegmentAccess::G.bits()
                // Data, writable.
                | SegmentAccess::WR.bits(),
            ),
            PrivilegeLevel::Ring0,
        )
    }

    /// Create a new segment.
    #[inline]
    pub const fn new(base: u64, limit: u64, access: SegmentAccess, dpl: PrivilegeLevel) -> Self {
        let (limit_15_0, base_23_0, access, dpl, limit_23_16, base_31_24) = (
            limit & 0xffff,
            base & 0xff_ffff,
            access.bits(),
            dpl as u64,
            (limit >> 16) & 0xf,
            (base >> 24) & 0xff,
        );

        Self(
            limit_15_0
                | base_23_0 << SegmentAccess::BASE_23_0_SHIFT
                | access
                | dpl << SegmentAccess::DPL_SHIFT
                | limit_23_16 << SegmentAccess::SEG_LIMIT_SHIFT
                | base_31_24 << SegmentAccess::BASE_31_24_SHIFT,
        )
    }

    /// Raw descriptor word.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }
}

bitflags::bitflags! {
    /// X86_64's access permission of 64bit segment.
    pub struct SegmentAccess64: u64 {
        /// Granularity
        const G = 1 << 55;
        /// Available for use by system software
        const AVL = 1 << 52;

        /// Segment present
        const P = 1 << 47;
        /// Available 64-bit TSS
        const T64A = 0x9 << Self::TYPE_SHIFT;
        /// Busy 64-bit TSS
        const T64B = 0xB << Self::TYPE_SHIFT;
    }
}

impl SegmentAccess64 {
    const BASE_31_24_SHIFT: u64 = 56;
    const SEG_LIMIT_SHIFT: u64 = 48;
    const DPL_SHIFT: u64 = 45;
    const BASE_23_0_SHIFT: u64 = 16;
    const TYPE_SHIFT: u64 = 40;
}

/// X86_64's 64bit Segment Descriptor.
///
/// System descriptors (TSS, LDT) occupy two consecutive slots of the GDT.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegmentDescriptor64(u64, u64);

impl SegmentDescriptor64 {
    /// Create a null segment.
    #[inline]
    pub const fn null() -> Self {
        Self::new(0, 0, SegmentAccess64::empty(), PrivilegeLevel::Ring0)
    }

    /// Create a new segment.
    #[inline]
    pub const fn new(base: u64, limit: u64, access: SegmentAccess64, dpl: PrivilegeLevel) -> Self {
        let (limit_15_0, base_23_0, access, dpl, limit_23_16, base_31_24, base_63_32) = (
            limit & 0xffff,
            base & 0xff_ffff,
            access.bits(),
            dpl as u64,
            (limit >> 16) & 0xf,
            (base >> 24) & 0xff,
            (base >> 32) & 0xffff_ffff,
        );

        Self(
            limit_15_0
                | base_23_0 << SegmentAccess64::BASE_23_0_SHIFT
                | access
                | dpl << SegmentAccess64::DPL_SHIFT
                | limit_23_16 << SegmentAccess64::SEG_LIMIT_SHIFT
                | base_31_24 << SegmentAccess64::BASE_31_24_SHIFT,
            base_63_32,
        )
    }

    /// Lower and upper descriptor words.
    #[inline]
    pub const fn words(self) -> (u64, u64) {
        (self.0, self.1)
    }

    /// Base address encoded in this descriptor.
    #[inline]
    pub const fn base(self) -> u64 {
        ((self.0 >> SegmentAccess64::BASE_23_0_SHIFT) & 0xff_ffff)
            | ((self.0 >> SegmentAccess64::BASE_31_24_SHIFT) & 0xff) << 24
            | (self.1 & 0xffff_ffff) << 32
    }

    /// Segment limit encoded in this descriptor.
    #[inline]
    pub const fn limit(self) -> u64 {
        (self.0 & 0xffff) | ((self.0 >> SegmentAccess64::SEG_LIMIT_SHIFT) & 0xf) << 16
    }

    /// Access bits of this descriptor.
    #[inline]
    pub const fn access(self) -> SegmentAccess64 {
        SegmentAccess64::from_bits_truncate(self.0)
    }
}

/// X86_64's segment selector.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct SegmentSelector(u16);

impl core::fmt::Debug for SegmentSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("SegmentSelector")
            .field("index", &self.index())
            .field("dpl", &self.dpl())
            .finish()
    }
}

impl SegmentSelector {
    /// Create a new SegmentSelector from the index and dpl.
    #[inline]
    pub const fn new(index: u16, dpl: PrivilegeLevel) -> Self {
        Self((index << 3) | dpl as u16)
    }

    /// Pack the SegmentSelector into a word.
    #[inline]
    pub const fn pack(self) -> u16 {
        self.0
    }

    /// Get index of the SegmentSelector.
    #[inline]
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    /// Get dpl of the SegmentSelector.
    #[inline]
    pub const fn dpl(self) -> PrivilegeLevel {
        match self.0 & 3 {
            0 => PrivilegeLevel::Ring0,
            1 => PrivilegeLevel::Ring1,
            2 => PrivilegeLevel::Ring2,
            _ => PrivilegeLevel::Ring3,
        }
    }
}
