//! Global and Interrupt Descriptor Table.

use super::interrupt::InterruptGateDescriptor;
use super::segmentation::{SegmentDescriptor, SegmentDescriptor64};

/// Global descriptor table with `N` 8-byte slots.
///
/// The all-zero value is a valid (empty) table, so it can be allocated with
/// [`crate::mm::try_zeroed_box`].
#[repr(C, align(4096))]
pub struct GlobalDescriptorTable<const N: usize> {
    entries: [u64; N],
}

impl<const N: usize> GlobalDescriptorTable<N> {
    /// Create an empty table. Slot 0 is the null descriptor.
    pub const fn empty() -> Self {
        Self { entries: [0; N] }
    }

    /// Install a code or data descriptor at `index`.
    ///
    /// Returns false if `index` is out of the table or is the null slot.
    pub fn set(&mut self, index: usize, desc: SegmentDescriptor) -> bool {
        if index == 0 || index >= N {
            return false;
        }
        self.entries[index] = desc.bits();
        true
    }

    /// Install a system descriptor (TSS or LDT) at `index` and `index + 1`.
    pub fn set_system(&mut self, index: usize, desc: SegmentDescriptor64) -> bool {
        if index == 0 || index + 1 >= N {
            return false;
        }
        let (lo, hi) = desc.words();
        self.entries[index] = lo;
        self.entries[index + 1] = hi;
        true
    }

    /// Raw descriptor word at `index`.
    pub fn get(&self, index: usize) -> Option<u64> {
        self.entries.get(index).copied()
    }

    /// Linear address of the table.
    pub fn base(&self) -> u64 {
        self as *const _ as usize as u64
    }

    /// Table limit as loaded into GDTR.
    pub const fn limit(&self) -> u16 {
        (N * core::mem::size_of::<u64>() - 1) as u16
    }

    /// Register image that describes this table.
    pub fn register(&self) -> SystemTableRegister {
        SystemTableRegister::new(self.base(), self.limit())
    }
}

/// Number of vectors of an interrupt descriptor table.
pub const IDT_ENTRIES: usize = 256;

/// Table of interrupt descriptors.
///
/// The all-zero value is a valid table with every gate absent.
#[repr(C, align(4096))]
pub struct InterruptDescriptorTable {
    gates: [InterruptGateDescriptor; IDT_ENTRIES],
}

impl InterruptDescriptorTable {
    /// Create a table with every gate absent.
    pub const fn empty() -> Self {
        Self {
            gates: [InterruptGateDescriptor::empty(); IDT_ENTRIES],
        }
    }

    /// Install `gate` for `vector`.
    #[inline]
    pub fn set(&mut self, vector: u8, gate: InterruptGateDescriptor) {
        self.gates[vector as usize] = gate;
    }

    /// Gate of `vector`.
    #[inline]
    pub fn get(&self, vector: u8) -> &InterruptGateDescriptor {
        &self.gates[vector as usize]
    }

    /// Linear address of the table.
    pub fn base(&self) -> u64 {
        self as *const _ as usize as u64
    }

    /// Table limit as loaded into IDTR.
    pub const fn limit(&self) -> u16 {
        (core::mem::size_of::<Self>() - 1) as u16
    }

    /// Register image that describes this table.
    pub fn register(&self) -> SystemTableRegister {
        SystemTableRegister::new(self.base(), self.limit())
    }
}

/// X86_64's system table register.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SystemTableRegister {
    pub size: u16,
    pub address: u64,
}

impl SystemTableRegister {
    /// Create a system table register image.
    #[inline]
    pub const fn new(address: u64, size: u16) -> Self {
        Self { size, address }
    }
}

impl core::fmt::Debug for SystemTableRegister {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (size, address) = (self.size, self.address);
        f.debug_struct("SystemTableRegister")
            .field("size", &format_args!("{:#x}", size))
            .field("address", &format_args!("{:#x}", address))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86_64::{interrupt::GateType, segmentation::SegmentSelector, PrivilegeLevel};

    #[test]
    fn gdt_slots() {
        let mut gdt = GlobalDescriptorTable::<8>::empty();
        assert!(!gdt.set(0, SegmentDescriptor::kernel_code()));
        assert!(gdt.set(1, SegmentDescriptor::kernel_code()));
        assert!(!gdt.set_system(7, SegmentDescriptor64::null()));
        assert!(gdt.set_system(3, SegmentDescriptor64::null()));
        assert_eq!(gdt.get(1), Some(SegmentDescriptor::kernel_code().bits()));
        assert_eq!(gdt.get(8), None);
        assert_eq!(gdt.limit(), 63);
        assert_eq!(gdt.base() % 4096, 0);
    }

    #[test]
    fn idt_geometry() {
        let mut idt = alloc::boxed::Box::new(InterruptDescriptorTable::empty());
        assert_eq!(idt.limit(), 4095);
        let gate = InterruptGateDescriptor::new(
            0x1000,
            SegmentSelector::new(1, PrivilegeLevel::Ring0),
            0,
            GateType::Trap,
            PrivilegeLevel::Ring0,
        );
        idt.set(255, gate);
        assert_eq!(*idt.get(255), gate);
        assert!(!idt.get(0).is_present());
        let reg = idt.register();
        assert_eq!({ reg.address }, idt.base());
        assert_eq!({ reg.size }, 4095);
    }
}
