use crate::vm::Gpa;
use abyss::addressing::{Pa, Va};

/// Traits to probe guest memory.
pub trait Probe {
    /// Translate guest physical address to host physical address
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa>;
    /// Translate guest physical address to host virtual address
    ///
    /// Frames outside of the host direct map have no virtual address.
    #[inline]
    fn gpa2hva(&self, gpa: Gpa) -> Option<Va> {
        self.gpa2hpa(gpa).and_then(Pa::into_va)
    }
}
