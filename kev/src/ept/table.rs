use super::{
    entry::EptEntry,
    field::{AttrType, EntryDump, MemoryType, ENTRY_TYPE},
    Level, PageSize, ENTRIES_PER_TABLE,
};
use crate::{config::EptConfig, probe::Probe, vm::Gpa, VmError};
use abyss::{
    addressing::{Pa, Va, PAGE_MASK},
    mm::try_zeroed_box,
};
use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::ops::{Deref, DerefMut};
use log::{debug, trace};

/// Errors of EPT manipulation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EptMappingError {
    /// Unaligned address
    Unaligned,
    /// Not exist
    NotExist,
    /// Has a duplicated mapping.
    Duplicated,
    /// Failed to allocate a paging structure.
    OutOfMemory,
    /// The address does not fit the guest-physical address width.
    AddressWidth,
}

impl core::fmt::Display for EptMappingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unaligned => write!(f, "unaligned address"),
            Self::NotExist => write!(f, "mapping does not exist"),
            Self::Duplicated => write!(f, "mapping already exists"),
            Self::OutOfMemory => write!(f, "out of memory for paging structures"),
            Self::AddressWidth => write!(f, "address exceeds the guest-physical address width"),
        }
    }
}

/// A paging structure of any level.
#[repr(C, align(4096))]
pub struct EptTable([EptEntry; ENTRIES_PER_TABLE]);

impl EptTable {
    /// Allocate a zeroed table.
    pub fn new_boxed() -> Option<Box<Self>> {
        // SAFETY: the zero word is the unused entry.
        unsafe { try_zeroed_box() }
    }

    /// Whether every entry of this table is unused.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(EptEntry::is_unused)
    }
}

impl Deref for EptTable {
    type Target = [EptEntry];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EptTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Translation from host virtual addresses of the tables to the host
/// physical addresses written into the entries.
pub trait PhysMapper {
    fn virt_to_phys(&self, va: Va) -> Option<Pa>;
}

/// Host whose heap lives in the kernel direct map.
pub struct DirectMap;

impl PhysMapper for DirectMap {
    #[inline]
    fn virt_to_phys(&self, va: Va) -> Option<Pa> {
        Some(va.into_pa())
    }
}

/// Host whose virtual addresses equal physical addresses.
pub struct IdentityMap;

impl PhysMapper for IdentityMap {
    #[inline]
    fn virt_to_phys(&self, va: Va) -> Option<Pa> {
        Pa::new(va.into_usize())
    }
}

/// Whether cached translations have to be flushed after an update.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// Permissions were reduced; stale translations would grant too much.
    Required,
    NotRequired,
}

impl Invalidation {
    #[inline]
    pub fn is_required(self) -> bool {
        self == Self::Required
    }

    /// Flush translations derived from `eptp` if required.
    ///
    /// # Safety
    /// Must be executed in VMX root operation.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn flush(self, eptp: u64) -> Result<(), VmError> {
        match self {
            Self::Required => super::invept(super::InveptType::SingleContext, eptp),
            Self::NotRequired => Ok(()),
        }
    }
}

const EPTP_MEMORY_TYPE_WB: u64 = 6;
const EPTP_WALK_LENGTH_4: u64 = (4 - 1) << 3;
const EPTP_ACCESSED_DIRTY: u64 = 1 << 6;

/// Extended page table of a virtual machine.
///
/// Owns every paging structure reachable from its root. Tables are keyed by
/// the host physical address written into their parent entry, so a walk
/// follows entries without dereferencing raw addresses.
pub struct ExtendedPageTable<M: PhysMapper = DirectMap> {
    root: Pa,
    tables: BTreeMap<Pa, Box<EptTable>>,
    mapper: M,
    config: EptConfig,
}

impl ExtendedPageTable<DirectMap> {
    /// Create an empty table with the default configuration.
    pub fn new() -> Result<Self, VmError> {
        Self::with_mapper(DirectMap, EptConfig::default())
    }
}

impl<M: PhysMapper> ExtendedPageTable<M> {
    /// Create an empty table whose structures are translated by `mapper`.
    pub fn with_mapper(mapper: M, config: EptConfig) -> Result<Self, VmError> {
        config.validate()?;
        let mut this = Self {
            root: Pa::ZERO,
            tables: BTreeMap::new(),
            mapper,
            config,
        };
        this.root = this.alloc_table()?;
        Ok(this)
    }

    /// Physical address of the PML4 table.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.root
    }

    /// EPT pointer to be written into the VMCS.
    pub fn eptp(&self) -> u64 {
        let ad = if self.config.accessed_dirty {
            EPTP_ACCESSED_DIRTY
        } else {
            0
        };
        self.root.into_u64() | EPTP_MEMORY_TYPE_WB | EPTP_WALK_LENGTH_4 | ad
    }

    /// Number of paging structures owned, the root included.
    #[inline]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    fn alloc_table(&mut self) -> Result<Pa, EptMappingError> {
        let table = EptTable::new_boxed().ok_or_else(|| {
            log::error!("ept: failed to allocate a paging structure");
            EptMappingError::OutOfMemory
        })?;
        let pa = self
            .mapper
            .virt_to_phys(Va::from_ptr(&*table))
            .ok_or(EptMappingError::AddressWidth)?;
        trace!("ept: new table at {:?}", pa);
        self.tables.insert(pa, table);
        Ok(pa)
    }

    fn table(&self, pa: Pa) -> Result<&EptTable, EptMappingError> {
        self.tables
            .get(&pa)
            .map(|t| &**t)
            .ok_or(EptMappingError::NotExist)
    }

    fn table_mut(&mut self, pa: Pa) -> Result<&mut EptTable, EptMappingError> {
        self.tables
            .get_mut(&pa)
            .map(|t| &mut **t)
            .ok_or(EptMappingError::NotExist)
    }

    fn check_width(&self, gpa: Gpa, len: usize) -> Result<(), EptMappingError> {
        let last = gpa
            .into_u64()
            .checked_add(len.max(1) as u64 - 1)
            .ok_or(EptMappingError::AddressWidth)?;
        if last >> self.config.gpa_width != 0 {
            Err(EptMappingError::AddressWidth)
        } else {
            Ok(())
        }
    }

    // Table holding the leaf entry of `gpa`, and its level.
    fn locate(&self, gpa: Gpa) -> Result<(Level, Pa), EptMappingError> {
        self.check_width(gpa, 1)?;
        let (mut level, mut pa) = (Level::Pml4, self.root);
        loop {
            let entry = self.table(pa)?[level.index(gpa)];
            match level.next() {
                Some(next) if !(level.is_leaf_capable() && entry.is_large_page()) => {
                    pa = entry.next_table().ok_or(EptMappingError::NotExist)?;
                    level = next;
                }
                _ if entry.is_unused() => return Err(EptMappingError::NotExist),
                _ => return Ok((level, pa)),
            }
        }
    }

    /// Find the leaf entry that maps `gpa` and the level it lives at.
    pub fn lookup(&self, gpa: Gpa) -> Result<(Level, &EptEntry), EptMappingError> {
        let (level, pa) = self.locate(gpa)?;
        Ok((level, &self.table(pa)?[level.index(gpa)]))
    }

    fn lookup_mut(&mut self, gpa: Gpa) -> Result<(Level, &mut EptEntry), EptMappingError> {
        let (level, pa) = self.locate(gpa)?;
        Ok((level, &mut self.table_mut(pa)?[level.index(gpa)]))
    }

    /// Find the leaf entry that maps `gpa`.
    ///
    /// Never allocates: an unmapped intermediate level yields
    /// [`EptMappingError::NotExist`]. The walk stops early at a large page.
    pub fn walk(&self, gpa: Gpa) -> Result<&EptEntry, EptMappingError> {
        self.lookup(gpa).map(|(_, entry)| entry)
    }

    /// Find the entry that maps a page of `size` at `gpa`, creating the
    /// intermediate tables on the way.
    ///
    /// New intermediate entries grant every permission. Running into a large
    /// page above the requested level yields [`EptMappingError::Duplicated`].
    /// The returned entry may be unused.
    pub fn walk_mut(&mut self, gpa: Gpa, size: PageSize) -> Result<&mut EptEntry, EptMappingError> {
        self.check_width(gpa, size.bytes())?;
        let leaf = size.leaf_level();
        let (mut level, mut pa) = (Level::Pml4, self.root);
        while level != leaf {
            let index = level.index(gpa);
            let entry = self.table(pa)?[index];
            if level.is_leaf_capable() && entry.is_large_page() {
                return Err(EptMappingError::Duplicated);
            }
            pa = match entry.next_table() {
                Some(next) => next,
                None => {
                    let next = self.alloc_table()?;
                    self.table_mut(pa)?[index]
                        .set_phys_addr(next)
                        .set_attr_type(AttrType::PassThrough);
                    next
                }
            };
            level = level.next().ok_or(EptMappingError::NotExist)?;
        }
        Ok(&mut self.table_mut(pa)?[leaf.index(gpa)])
    }

    /// Map a page of `size` at `gpa` to `hpa`.
    pub fn map(
        &mut self,
        gpa: Gpa,
        hpa: Pa,
        size: PageSize,
        attr: AttrType,
        mtype: MemoryType,
    ) -> Result<(), EptMappingError> {
        let bytes = size.bytes();
        if gpa.into_usize() & (bytes - 1) != 0 || !hpa.is_aligned(bytes) {
            return Err(EptMappingError::Unaligned);
        }
        let entry = self.walk_mut(gpa, size)?;
        if !entry.is_unused() {
            return Err(EptMappingError::Duplicated);
        }
        entry
            .set_phys_addr(hpa)
            .set_attr_type(attr)
            .set_memory_type(mtype);
        if size != PageSize::Size4K {
            entry.enable(ENTRY_TYPE);
        }
        trace!("ept: map {:?} -> {:?} ({:?}, {:?})", gpa, hpa, size, attr);
        Ok(())
    }

    /// Map `len` bytes at `gpa` to `hpa` with the largest pages that fit.
    ///
    /// Either the whole range is mapped or nothing is. Tables created by a
    /// failed call stay allocated until [`Self::reclaim`] is called on the
    /// range.
    pub fn map_range(
        &mut self,
        gpa: Gpa,
        hpa: Pa,
        len: usize,
        attr: AttrType,
        mtype: MemoryType,
    ) -> Result<(), EptMappingError> {
        if (gpa.into_usize() | hpa.into_usize() | len) & PAGE_MASK != 0 {
            return Err(EptMappingError::Unaligned);
        }
        self.check_width(gpa, len)?;
        let mut mapped = Vec::new();
        let mut offset = 0;
        while offset < len {
            let (gpa, hpa) = (gpa + offset, hpa + offset);
            let size = PageSize::DESCENDING
                .iter()
                .copied()
                .find(|size| {
                    let bytes = size.bytes();
                    len - offset >= bytes
                        && gpa.into_usize() & (bytes - 1) == 0
                        && hpa.is_aligned(bytes)
                })
                .unwrap_or(PageSize::Size4K);
            if let Err(e) = self.map(gpa, hpa, size, attr, mtype) {
                for gpa in mapped.into_iter().rev() {
                    let undone = self.unmap(gpa);
                    debug_assert!(undone.is_ok(), "rollback of {:?} failed", gpa);
                }
                return Err(e);
            }
            mapped.push(gpa);
            offset += size.bytes();
        }
        Ok(())
    }

    /// Clear the leaf entry that maps `gpa` and return its old value.
    ///
    /// Removing a mapping always revokes access, so the returned
    /// [`Invalidation`] is always [`Invalidation::Required`]. Tables left
    /// empty stay allocated until [`Self::reclaim`] is called.
    pub fn unmap(&mut self, gpa: Gpa) -> Result<(EptEntry, Invalidation), EptMappingError> {
        let (level, entry) = self.lookup_mut(gpa)?;
        if gpa.into_usize() & (level.entry_span() - 1) != 0 {
            return Err(EptMappingError::Unaligned);
        }
        let old = *entry;
        entry.clear();
        trace!("ept: unmap {:?} (was {:?})", gpa, old);
        Ok((old, Invalidation::Required))
    }

    /// Change the access policy of the page that maps `gpa`.
    ///
    /// When the new policy grants less than the old one, the caller must
    /// flush before resuming any vCPU that uses this table.
    pub fn protect(&mut self, gpa: Gpa, attr: AttrType) -> Result<Invalidation, EptMappingError> {
        let (_, entry) = self.lookup_mut(gpa)?;
        let old = entry.attr_type();
        entry.set_attr_type(attr);
        Ok(if attr.contains(old) {
            Invalidation::NotRequired
        } else {
            Invalidation::Required
        })
    }

    /// Translate `gpa` into the host physical address.
    pub fn translate(&self, gpa: Gpa) -> Option<Pa> {
        let (level, entry) = self.lookup(gpa).ok()?;
        Some(entry.phys_addr() + (gpa.into_usize() & (level.entry_span() - 1)))
    }

    /// Free the tables on the path of `gpa` that no longer hold any entry,
    /// from the bottom up. The root is never freed.
    ///
    /// Processors may keep paging-structure entries that point at these
    /// tables. The invalidation reported by [`Self::unmap`] must be flushed
    /// before this is called on a table that a vcpu has used.
    ///
    /// Returns the number of freed tables.
    pub fn reclaim(&mut self, gpa: Gpa) -> Result<usize, EptMappingError> {
        self.check_width(gpa, 1)?;
        // (parent table, index in parent, child table)
        let mut path: [Option<(Pa, usize, Pa)>; 3] = [None; 3];
        let (mut level, mut pa) = (Level::Pml4, self.root);
        for slot in path.iter_mut() {
            let index = level.index(gpa);
            let entry = self.table(pa)?[index];
            if level.is_leaf_capable() && entry.is_large_page() {
                break;
            }
            let (Some(child), Some(next)) = (entry.next_table(), level.next()) else {
                break;
            };
            *slot = Some((pa, index, child));
            pa = child;
            level = next;
        }

        let mut freed = 0;
        for (parent, index, child) in path.iter().rev().flatten() {
            if !self.table(*child)?.is_empty() {
                break;
            }
            self.table_mut(*parent)?[*index].clear();
            self.tables.remove(child);
            debug!("ept: reclaimed table {:?} under {:?}", child, gpa);
            freed += 1;
        }
        Ok(freed)
    }

    /// Log every entry on the path of `gpa`.
    pub fn dump(&self, gpa: Gpa) {
        let (mut level, mut pa) = (Level::Pml4, self.root);
        while let Ok(table) = self.table(pa) {
            let entry = table[level.index(gpa)];
            debug!(
                "{:?}: [{}] {}",
                gpa,
                level.index(gpa),
                EntryDump::new(level, entry.bits())
            );
            if level.is_leaf_capable() && entry.is_large_page() {
                return;
            }
            match (entry.next_table(), level.next()) {
                (Some(next), Some(next_level)) => {
                    pa = next;
                    level = next_level;
                }
                _ => return,
            }
        }
    }
}

impl<M: PhysMapper> Probe for ExtendedPageTable<M> {
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa> {
        self.translate(gpa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::{PAGE_SIZE_2M, PAGE_SIZE_4K};

    fn ept() -> ExtendedPageTable<IdentityMap> {
        ExtendedPageTable::with_mapper(IdentityMap, EptConfig::default()).unwrap()
    }

    fn gpa(addr: usize) -> Gpa {
        Gpa::new(addr).unwrap()
    }

    fn pa(addr: usize) -> Pa {
        Pa::new(addr).unwrap()
    }

    #[test]
    fn read_walk_never_allocates() {
        let ept = ept();
        assert_eq!(ept.walk(gpa(0x1000)), Err(EptMappingError::NotExist));
        assert_eq!(ept.table_count(), 1);
    }

    #[test]
    fn create_walk_builds_pass_through_path() {
        let mut ept = ept();
        let target = gpa(0x0000_0080_4020_1000);
        let leaf = ept.walk_mut(target, PageSize::Size4K).unwrap() as *const EptEntry;
        assert_eq!(ept.table_count(), 4);

        // Same arguments, no intervening mutation: same entry, nothing new.
        let again = ept.walk_mut(target, PageSize::Size4K).unwrap() as *const EptEntry;
        assert_eq!(leaf, again);
        assert_eq!(ept.table_count(), 4);

        let mut table = ept.pa();
        for level in [Level::Pml4, Level::Pdpt, Level::Pd] {
            let entry = ept.table(table).unwrap()[1];
            assert_eq!(entry.attr_type(), AttrType::PassThrough);
            assert!(!entry.is_large_page());
            table = entry.next_table().unwrap();
            assert!(ept.tables.contains_key(&table), "{:?}", level);
        }
    }

    #[test]
    fn map_and_walk() {
        let mut ept = ept();
        ept.map(
            gpa(0x4000),
            pa(0x20_0000),
            PageSize::Size4K,
            AttrType::ReadWrite,
            MemoryType::WriteBack,
        )
        .unwrap();

        let first = ept.walk(gpa(0x4000)).unwrap();
        let second = ept.walk(gpa(0x4000)).unwrap();
        assert!(core::ptr::eq(first, second));
        assert_eq!(first.phys_addr(), pa(0x20_0000));
        assert_eq!(first.attr_type(), AttrType::ReadWrite);
        assert_eq!(first.memory_type(), MemoryType::WriteBack);
        assert!(!first.is_large_page());

        assert_eq!(ept.translate(gpa(0x4123)), Some(pa(0x20_0123)));
        assert_eq!(ept.gpa2hpa(gpa(0x5000)), None);
        assert_eq!(
            ept.map(
                gpa(0x4000),
                pa(0x30_0000),
                PageSize::Size4K,
                AttrType::ReadOnly,
                MemoryType::WriteBack
            ),
            Err(EptMappingError::Duplicated)
        );
    }

    #[test]
    fn alignment_and_width_checks() {
        let mut ept = ept();
        assert_eq!(
            ept.map(
                gpa(0x1000),
                pa(0x20_0000),
                PageSize::Size2M,
                AttrType::ReadWrite,
                MemoryType::WriteBack
            ),
            Err(EptMappingError::Unaligned)
        );
        assert_eq!(
            ept.map(
                gpa(0x1000),
                pa(0x20_0800),
                PageSize::Size4K,
                AttrType::ReadWrite,
                MemoryType::WriteBack
            ),
            Err(EptMappingError::Unaligned)
        );
        assert_eq!(
            ept.map(
                gpa(1 << 48),
                pa(0x1000),
                PageSize::Size4K,
                AttrType::ReadWrite,
                MemoryType::WriteBack
            ),
            Err(EptMappingError::AddressWidth)
        );
        assert_eq!(ept.walk(gpa(1 << 48)), Err(EptMappingError::AddressWidth));
        assert_eq!(ept.table_count(), 1);
    }

    #[test]
    fn large_page_terminates_walk() {
        let mut ept = ept();
        ept.map(
            gpa(PAGE_SIZE_2M * 3),
            pa(PAGE_SIZE_2M),
            PageSize::Size2M,
            AttrType::ReadExecute,
            MemoryType::WriteBack,
        )
        .unwrap();
        // PML4 -> PDPT -> PD, no PT.
        assert_eq!(ept.table_count(), 3);

        let (level, entry) = ept.lookup(gpa(PAGE_SIZE_2M * 3 + 0x5000)).unwrap();
        assert_eq!(level, Level::Pd);
        assert!(entry.is_large_page());
        assert_eq!(
            ept.translate(gpa(PAGE_SIZE_2M * 3 + 0x1234)),
            Some(pa(PAGE_SIZE_2M + 0x1234))
        );

        // A 4K mapping inside of the large page collides.
        assert_eq!(
            ept.map(
                gpa(PAGE_SIZE_2M * 3 + PAGE_SIZE_4K),
                pa(0x1000),
                PageSize::Size4K,
                AttrType::ReadOnly,
                MemoryType::WriteBack
            ),
            Err(EptMappingError::Duplicated)
        );
        assert_eq!(
            ept.unmap(gpa(PAGE_SIZE_2M * 3 + PAGE_SIZE_4K)),
            Err(EptMappingError::Unaligned)
        );
        assert!(ept.unmap(gpa(PAGE_SIZE_2M * 3)).unwrap().0.is_large_page());
    }

    #[test]
    fn unmap_leaves_tables_until_reclaimed() {
        let mut ept = ept();
        let target = gpa(0x0000_0080_4020_1000);
        ept.map(
            target,
            pa(0x7000),
            PageSize::Size4K,
            AttrType::PassThrough,
            MemoryType::Uncacheable,
        )
        .unwrap();
        ept.map(
            gpa(0x0000_0080_4020_2000),
            pa(0x8000),
            PageSize::Size4K,
            AttrType::PassThrough,
            MemoryType::Uncacheable,
        )
        .unwrap();
        assert_eq!(ept.table_count(), 4);

        let (old, invalidation) = ept.unmap(target).unwrap();
        assert_eq!(old.phys_addr(), pa(0x7000));
        assert_eq!(invalidation, Invalidation::Required);
        assert_eq!(ept.walk(target), Err(EptMappingError::NotExist));
        assert_eq!(ept.unmap(target), Err(EptMappingError::NotExist));
        assert_eq!(ept.table_count(), 4);

        // The PT still holds the neighbour.
        assert_eq!(ept.reclaim(target), Ok(0));
        assert!(ept.unmap(gpa(0x0000_0080_4020_2000)).unwrap().1.is_required());
        assert_eq!(ept.reclaim(target), Ok(3));
        assert_eq!(ept.table_count(), 1);
        assert!(ept.table(ept.pa()).unwrap().is_empty());

        // The freed path can be rebuilt.
        ept.map(
            target,
            pa(0x7000),
            PageSize::Size4K,
            AttrType::ReadOnly,
            MemoryType::WriteBack,
        )
        .unwrap();
        assert_eq!(ept.translate(target), Some(pa(0x7000)));
    }

    #[test]
    fn protect_reports_downgrades() {
        let mut ept = ept();
        ept.map(
            gpa(0x1000),
            pa(0x1000),
            PageSize::Size4K,
            AttrType::ReadWrite,
            MemoryType::WriteBack,
        )
        .unwrap();
        assert_eq!(
            ept.protect(gpa(0x1000), AttrType::ReadOnly),
            Ok(Invalidation::Required)
        );
        assert_eq!(
            ept.protect(gpa(0x1000), AttrType::PassThrough),
            Ok(Invalidation::NotRequired)
        );
        assert_eq!(ept.walk(gpa(0x1000)).unwrap().attr_type(), AttrType::PassThrough);
        assert!(ept
            .protect(gpa(0x1000), AttrType::ExecuteOnly)
            .unwrap()
            .is_required());
        assert_eq!(
            ept.protect(gpa(0x2000), AttrType::ReadOnly),
            Err(EptMappingError::NotExist)
        );
    }

    #[test]
    fn map_range_uses_large_pages() {
        let mut ept = ept();
        ept.map_range(
            gpa(0),
            pa(0),
            PAGE_SIZE_2M + 2 * PAGE_SIZE_4K,
            AttrType::PassThrough,
            MemoryType::WriteBack,
        )
        .unwrap();
        assert_eq!(ept.lookup(gpa(0)).unwrap().0, Level::Pd);
        assert_eq!(ept.lookup(gpa(PAGE_SIZE_2M)).unwrap().0, Level::Pt);
        assert_eq!(
            ept.translate(gpa(PAGE_SIZE_2M + PAGE_SIZE_4K + 8)),
            Some(pa(PAGE_SIZE_2M + PAGE_SIZE_4K + 8))
        );
        assert_eq!(ept.walk(gpa(PAGE_SIZE_2M + 2 * PAGE_SIZE_4K)), Err(EptMappingError::NotExist));
    }

    #[test]
    fn map_range_is_all_or_nothing() {
        let mut ept = ept();
        ept.map(
            gpa(0x3000),
            pa(0x9000),
            PageSize::Size4K,
            AttrType::ReadOnly,
            MemoryType::WriteBack,
        )
        .unwrap();
        assert_eq!(
            ept.map_range(
                gpa(0x1000),
                pa(0x1000),
                4 * PAGE_SIZE_4K,
                AttrType::PassThrough,
                MemoryType::WriteBack
            ),
            Err(EptMappingError::Duplicated)
        );
        assert_eq!(ept.walk(gpa(0x1000)), Err(EptMappingError::NotExist));
        assert_eq!(ept.walk(gpa(0x2000)), Err(EptMappingError::NotExist));
        assert_eq!(ept.translate(gpa(0x3000)), Some(pa(0x9000)));
        assert_eq!(
            ept.map_range(gpa(0x1000), pa(0x1000), 0x800, AttrType::ReadOnly, MemoryType::WriteBack),
            Err(EptMappingError::Unaligned)
        );
    }

    #[test]
    fn failed_map_range_leaves_tables_for_reclaim() {
        let mut ept = ept();
        ept.map(
            gpa(PAGE_SIZE_2M),
            pa(PAGE_SIZE_2M),
            PageSize::Size2M,
            AttrType::ReadWrite,
            MemoryType::WriteBack,
        )
        .unwrap();
        assert_eq!(ept.table_count(), 3);

        // The first page needs a new PT, the second hits the large page.
        let start = gpa(PAGE_SIZE_2M - PAGE_SIZE_4K);
        assert_eq!(
            ept.map_range(
                start,
                pa(0x1000),
                2 * PAGE_SIZE_4K,
                AttrType::ReadOnly,
                MemoryType::WriteBack
            ),
            Err(EptMappingError::Duplicated)
        );
        assert_eq!(ept.walk(start), Err(EptMappingError::NotExist));
        assert_eq!(ept.table_count(), 4);
        assert_eq!(ept.reclaim(start), Ok(1));
        assert_eq!(ept.table_count(), 3);
        assert_eq!(ept.translate(gpa(PAGE_SIZE_2M + 8)), Some(pa(PAGE_SIZE_2M + 8)));
    }

    #[test]
    fn frames_above_256_tib() {
        let mut ept = ept();
        let high = pa(1 << 48);
        ept.map(gpa(0x1000), high, PageSize::Size4K, AttrType::ReadWrite, MemoryType::WriteBack)
            .unwrap();
        assert_eq!(ept.walk(gpa(0x1000)).unwrap().phys_addr(), high);
        assert_eq!(ept.translate(gpa(0x1234)), Some(high + 0x234));

        let top = pa(0x000f_ffff_ffff_f000);
        ept.map(gpa(0x2000), top, PageSize::Size4K, AttrType::ReadOnly, MemoryType::WriteBack)
            .unwrap();
        assert_eq!(ept.translate(gpa(0x2fff)), Some(top + 0xfff));
    }

    #[test]
    fn hva_only_inside_of_direct_map() {
        let mut ept = ept();
        ept.map(gpa(0x1000), pa(0x5000), PageSize::Size4K, AttrType::ReadWrite, MemoryType::WriteBack)
            .unwrap();
        ept.map(gpa(0x2000), pa(1 << 40), PageSize::Size4K, AttrType::ReadWrite, MemoryType::WriteBack)
            .unwrap();
        assert_eq!(ept.gpa2hva(gpa(0x1008)).map(Va::into_pa), Some(pa(0x5008)));
        assert_eq!(ept.gpa2hpa(gpa(0x2000)), Some(pa(1 << 40)));
        assert_eq!(ept.gpa2hva(gpa(0x2000)), None);
        assert_eq!(ept.gpa2hva(gpa(0x3000)), None);
    }

    #[test]
    fn eptp_layout() {
        let ept = ept();
        let eptp = ept.eptp();
        assert_eq!(eptp & 0x7, 6);
        assert_eq!((eptp >> 3) & 0x7, 3);
        assert_eq!(eptp & (1 << 6), 0);
        assert_eq!(eptp & !0xfff, ept.pa().into_u64());

        let ept = ExtendedPageTable::with_mapper(
            IdentityMap,
            EptConfig {
                accessed_dirty: true,
                ..EptConfig::default()
            },
        )
        .unwrap();
        assert_ne!(ept.eptp() & (1 << 6), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EptConfig {
            gpa_width: 64,
            ..EptConfig::default()
        };
        assert!(matches!(
            ExtendedPageTable::with_mapper(IdentityMap, config),
            Err(VmError::InvalidConfig(_))
        ));
    }
}
