//! Memory abstraction.
//!
//! The host maps its kernel virtual memory directly onto physical memory.
//! The first page of the direct map is the first frame of physical memory,
//! the second page is the second frame, and so on. Thus, physical addresses
//! and direct-mapped virtual addresses differ by a constant offset.

const VA_TO_PA_OFF: usize = 0xffff000000000000 | (510 << 39);

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;

/// Maximum physical address width supported by the architecture.
pub const MAX_PHYS_ADDR_BITS: usize = 52;

/// Physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address with a check.
    ///
    /// Returns `None` if `addr` does not fit the architectural physical
    /// address width.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr >> MAX_PHYS_ADDR_BITS == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0 as u64
    }

    /// Cast into virtual address of the direct map.
    ///
    /// Returns `None` if the frame lies beyond the direct map window.
    #[inline]
    pub const fn into_va(self) -> Option<Va> {
        match self.0.checked_add(VA_TO_PA_OFF) {
            Some(va) => Some(Va(va)),
            None => None,
        }
    }

    /// Offset inside of the page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Whether this address is aligned to `align`, which must be a power of two.
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }
}

/// Virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Create a new virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Virtual address of the object behind `ptr`.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0 as u64
    }

    /// Cast into physical address.
    ///
    /// Only meaningful for addresses inside of the direct map.
    #[inline]
    pub const fn into_pa(self) -> Pa {
        Pa(self.0.wrapping_sub(VA_TO_PA_OFF))
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
