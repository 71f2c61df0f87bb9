use super::field::{
    AttrType, BitField, Flag, MemoryType, ATTR_TYPE, ENTRY_TYPE, MEMORY_TYPE, PHYS_ADDR,
};
use abyss::addressing::{Pa, PAGE_MASK};

/// An entry of an EPT paging structure, at any level.
///
/// The word is only ever modified through the field accessors of
/// [`super::field`], so updating one field never disturbs another.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    /// The all-zero entry.
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw entry word.
    #[inline]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Whether no bit of this entry is set.
    #[inline]
    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// Clear the whole entry.
    #[inline]
    pub fn clear(&mut self) -> &mut Self {
        self.0 = 0;
        self
    }

    #[inline]
    pub const fn get(&self, field: BitField) -> u64 {
        field.get(self.0)
    }

    #[inline]
    pub fn set(&mut self, field: BitField, value: u64) -> &mut Self {
        self.0 = field.set(self.0, value);
        self
    }

    #[inline]
    pub const fn is_enabled(&self, flag: Flag) -> bool {
        flag.is_enabled(self.0)
    }

    #[inline]
    pub const fn is_disabled(&self, flag: Flag) -> bool {
        flag.is_disabled(self.0)
    }

    #[inline]
    pub fn enable(&mut self, flag: Flag) -> &mut Self {
        self.0 = flag.enable(self.0);
        self
    }

    #[inline]
    pub fn disable(&mut self, flag: Flag) -> &mut Self {
        self.0 = flag.disable(self.0);
        self
    }

    /// Access policy of this entry.
    #[inline]
    pub fn attr_type(&self) -> AttrType {
        ATTR_TYPE.get(self.0)
    }

    /// Set the access policy, rewriting bits 2:0 at once.
    #[inline]
    pub fn set_attr_type(&mut self, attr: AttrType) -> &mut Self {
        self.0 = ATTR_TYPE.set(self.0, attr);
        self
    }

    /// Memory type of this entry. Meaningless on PML4 entries.
    #[inline]
    pub fn memory_type(&self) -> MemoryType {
        MEMORY_TYPE.get(self.0)
    }

    #[inline]
    pub fn set_memory_type(&mut self, mtype: MemoryType) -> &mut Self {
        self.0 = MEMORY_TYPE.set(self.0, mtype);
        self
    }

    /// Physical address held by this entry, possibly zero.
    #[inline]
    pub fn phys_addr(&self) -> Pa {
        // The field is at most 52 bits wide, so this never fails.
        Pa::new(PHYS_ADDR.get(self.0) as usize).unwrap_or(Pa::ZERO)
    }

    /// Set the physical address.
    ///
    /// `pa` must be page aligned; offset bits are dropped.
    #[inline]
    pub fn set_phys_addr(&mut self, pa: Pa) -> &mut Self {
        debug_assert_eq!(pa.into_usize() & PAGE_MASK, 0);
        self.0 = PHYS_ADDR.set(self.0, pa.into_u64());
        self
    }

    /// Address of the next-level table, if this entry references one.
    #[inline]
    pub fn next_table(&self) -> Option<Pa> {
        match self.phys_addr() {
            Pa::ZERO => None,
            pa => Some(pa),
        }
    }

    /// Whether this entry maps a large page.
    #[inline]
    pub const fn is_large_page(&self) -> bool {
        ENTRY_TYPE.is_enabled(self.0)
    }
}

impl core::fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EptEntry({:#x})", self.0)
    }
}
