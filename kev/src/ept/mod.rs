//! Extended Page Table.
//!
//! ## Background
//! When multiple virtual machines are running on a single physical machine, the hypervisor must have a method
//! for mapping each virtual machine's memory addresses to the physical memory of the host.
//! EPT lets the processor do this second translation step (guest physical to host physical) in hardware,
//! while the guest keeps full control over its own page tables.
//!
//! The EPT is a four-level radix tree indexed by the guest-physical address:
//!
//! | level | address bits | one entry maps |
//! |-------|--------------|----------------|
//! | PML4  | 47:39        | 512 GiB        |
//! | PDPT  | 38:30        | 1 GiB          |
//! | PD    | 29:21        | 2 MiB          |
//! | PT    | 20:12        | 4 KiB          |
//!
//! A PDPT or PD entry with the `entry_type` bit set maps a large page directly and terminates the walk.
//! Intermediate entries always grant every permission; restrictions are applied only on the leaf.
//!
//! ## Synchronization
//! [`ExtendedPageTable`] performs no locking. The owner of the guest-physical address space must serialize
//! every mutating call, and must invalidate the cached translations (see [`Invalidation`]) after any permission
//! downgrade before resuming a vCPU that may still hold the old translation.

mod entry;
mod field;
mod invept;
mod table;

pub use entry::EptEntry;
pub use field::{
    AttrType, BitField, EntryDump, EntryField, EnumField, FieldCodec, Flag, MemoryType,
    ACCESSED_FLAG, ATTR_TYPE, DIRTY, ENTRY_TYPE, EXECUTE_ACCESS, EXECUTE_ACCESS_USER, IGNORE_PAT,
    LEAF_CAPABLE_FIELDS, MEMORY_TYPE, PHYS_ADDR, PML4_FIELDS, READ_ACCESS, SUPPRESS_VE,
    WRITE_ACCESS,
};
#[cfg(target_arch = "x86_64")]
pub use invept::invept;
pub use invept::InveptType;
pub use table::{
    DirectMap, EptMappingError, EptTable, ExtendedPageTable, IdentityMap, Invalidation,
    PhysMapper,
};

use crate::vm::Gpa;

/// Number of entries in a table of any level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Mask of a 9-bit table index.
pub const INDEX_MASK: u64 = 0x1ff;

/// 4 KiB page.
pub const PAGE_SIZE_4K: usize = 0x1000;
/// 2 MiB page.
pub const PAGE_SIZE_2M: usize = 0x20_0000;
/// 1 GiB page.
pub const PAGE_SIZE_1G: usize = 0x4000_0000;

/// Level of a paging structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    /// Bit offset of this level's index inside of a guest-physical address.
    #[inline]
    pub const fn shift(self) -> u32 {
        match self {
            Level::Pml4 => 39,
            Level::Pdpt => 30,
            Level::Pd => 21,
            Level::Pt => 12,
        }
    }

    /// Index of the entry that translates `gpa` at this level.
    #[inline]
    pub const fn index(self, gpa: Gpa) -> usize {
        index_at_level(gpa.into_u64(), self)
    }

    /// Bytes of guest-physical address space covered by one entry.
    #[inline]
    pub const fn entry_span(self) -> usize {
        1 << self.shift()
    }

    /// The level below, if any.
    #[inline]
    pub const fn next(self) -> Option<Level> {
        match self {
            Level::Pml4 => Some(Level::Pdpt),
            Level::Pdpt => Some(Level::Pd),
            Level::Pd => Some(Level::Pt),
            Level::Pt => None,
        }
    }

    /// Whether an entry of this level can map a page directly.
    #[inline]
    pub const fn is_leaf_capable(self) -> bool {
        !matches!(self, Level::Pml4)
    }
}

/// Extract the 9-bit index of `level` from the guest-physical address `gpa`.
#[inline(always)]
pub const fn index_at_level(gpa: u64, level: Level) -> usize {
    ((gpa >> level.shift()) & INDEX_MASK) as usize
}

/// Size of a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size1G,
}

impl PageSize {
    /// Every page size, largest first.
    pub const DESCENDING: [PageSize; 3] = [PageSize::Size1G, PageSize::Size2M, PageSize::Size4K];

    /// Size in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            PageSize::Size4K => PAGE_SIZE_4K,
            PageSize::Size2M => PAGE_SIZE_2M,
            PageSize::Size1G => PAGE_SIZE_1G,
        }
    }

    /// Level whose entry maps a page of this size.
    #[inline]
    pub const fn leaf_level(self) -> Level {
        match self {
            PageSize::Size4K => Level::Pt,
            PageSize::Size2M => Level::Pd,
            PageSize::Size1G => Level::Pdpt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_of_reference_address() {
        // 0x0000008040201000 = 1 << 39 | 1 << 30 | 1 << 21 | 1 << 12.
        let gpa = 0x0000_0080_4020_1000u64;
        assert_eq!(index_at_level(gpa, Level::Pml4), 1);
        assert_eq!(index_at_level(gpa, Level::Pdpt), 1);
        assert_eq!(index_at_level(gpa, Level::Pd), 1);
        assert_eq!(index_at_level(gpa, Level::Pt), 1);
    }

    #[test]
    fn index_extracts_only_nine_bits() {
        let gpa = 0x0000_ffff_ffff_ffffu64;
        for level in [Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt] {
            assert_eq!(index_at_level(gpa, level), 511);
        }
        // Bits above 47 and the page offset never leak into an index.
        let gpa = 0xffff_0000_0000_0fffu64;
        for level in [Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt] {
            assert_eq!(index_at_level(gpa, level), 0);
        }
        let gpa = Gpa::new(0x0000_7f80_3fe0_0000).unwrap();
        assert_eq!(Level::Pml4.index(gpa), 0xff);
        assert_eq!(Level::Pdpt.index(gpa), 0);
        assert_eq!(Level::Pd.index(gpa), 0x1ff);
        assert_eq!(Level::Pt.index(gpa), 0);
    }

    #[test]
    fn page_sizes() {
        assert_eq!(PageSize::Size1G.leaf_level().entry_span(), PAGE_SIZE_1G);
        assert_eq!(PageSize::Size2M.leaf_level().entry_span(), PAGE_SIZE_2M);
        assert_eq!(PageSize::Size4K.leaf_level().entry_span(), PAGE_SIZE_4K);
        assert_eq!(Level::Pt.next(), None);
        assert!(!Level::Pml4.is_leaf_capable());
    }
}
