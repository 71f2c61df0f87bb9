//! Guest address types.

use abyss::addressing::MAX_PHYS_ADDR_BITS;

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Gpa(usize);

impl Gpa {
    /// Create a new guest physical address with a check.
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
}

impl core::ops::Add<usize> for Gpa {
    type Output = Self;

    fn add(self, other: usize) -> Self::Output {
        Self(self.0 + other)
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

impl core::fmt::Display for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}
