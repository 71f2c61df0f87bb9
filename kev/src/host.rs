//! Host execution context of a vcpu.
//!
//! On every vmexit the processor reloads the host state from the vmcs: the
//! segment selectors, the descriptor tables, the task register, the stack
//! pointer and the instruction pointer. A wrong value there does not fail
//! gracefully. The first exception inside an exit handler turns into a
//! triple fault.
//!
//! [`HostContext`] owns everything that state points to:
//!
//! | GDT slot | Descriptor                  | Selector |
//! |----------|-----------------------------|----------|
//! | 0        | null                        |          |
//! | 1        | 64-bit kernel code          | `0x08`   |
//! | 2        | kernel data                 | `0x10`   |
//! | 3, 4     | task state segment (16B)    | `0x18`   |
//!
//! Every exception vector (0 to 31) is delivered through an interrupt gate
//! that switches to IST1, a stack dedicated to exceptions. A fault raised
//! while an exit handler runs therefore never lands on the handler's own,
//! possibly corrupted, stack.
//!
//! All the structures are freed when the context is dropped, which happens
//! after the fini handlers ran and no more vmexit can occur on it.
use crate::{
    config::HostContextConfig,
    vmcs::{Field, Vmcs},
    VmError,
};
use abyss::{
    mm::try_zeroed_box,
    x86_64::{
        interrupt::{ExceptionVector, GateType, InterruptGateDescriptor},
        segmentation::{SegmentDescriptor, SegmentSelector},
        table::{GlobalDescriptorTable, InterruptDescriptorTable, SystemTableRegister},
        tss::TaskStateSegment,
        PrivilegeLevel,
    },
};
use alloc::{
    alloc::{alloc, dealloc, Layout},
    boxed::Box,
};
use core::ptr::NonNull;
use log::error;

/// Number of slots in the host global descriptor table.
pub const GDT_ENTRIES: usize = 512;

/// IST slot used for the exceptions.
pub const EXCEPTION_IST: u8 = 1;

/// Host code segment selector.
pub const KERNEL_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(1, PrivilegeLevel::Ring0);
/// Host data segment selector.
pub const KERNEL_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(2, PrivilegeLevel::Ring0);
/// Host task state segment selector.
pub const TSS_SELECTOR: SegmentSelector = SegmentSelector::new(3, PrivilegeLevel::Ring0);

/// Entry points of the host exception routines.
pub trait ExceptionRoutines {
    /// Linear address of the routine for the exception `vector`.
    fn routine(&self, vector: u8) -> u64;
}

/// A page aligned stack owned by the host context.
pub struct HostStack {
    base: NonNull<u8>,
    layout: Layout,
}

// The stack is plain memory, only reached through the host context.
unsafe impl Send for HostStack {}

impl HostStack {
    /// Allocate a stack of `size` bytes.
    pub fn new(size: usize) -> Result<Self, VmError> {
        let layout = Layout::from_size_align(size, abyss::addressing::PAGE_SIZE)
            .map_err(|_| VmError::InvalidConfig("host stack size overflows"))?;
        if layout.size() == 0 {
            return Err(VmError::InvalidConfig("host stack size is zero"));
        }
        // Safety: the layout is non-zero sized.
        let base = NonNull::new(unsafe { alloc(layout) }).ok_or(VmError::OutOfMemory)?;
        Ok(Self { base, layout })
    }

    /// Lowest address of the stack.
    #[inline]
    pub fn bottom(&self) -> u64 {
        self.base.as_ptr() as usize as u64
    }

    /// Address one past the highest byte of the stack.
    #[inline]
    pub fn top(&self) -> u64 {
        self.bottom() + self.layout.size() as u64
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HostStack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Host side cpu state of a vcpu.
pub struct HostContext {
    tss: Box<TaskStateSegment>,
    gdt: Box<GlobalDescriptorTable<GDT_ENTRIES>>,
    idt: Box<InterruptDescriptorTable>,
    ist_stack: HostStack,
    stack: HostStack,
}

fn zeroed<T>(what: &'static str) -> Result<Box<T>, VmError> {
    // Safety: every structure built here is valid when all-zero.
    unsafe { try_zeroed_box::<T>() }.ok_or_else(|| {
        error!("host: failed to allocate the {}", what);
        VmError::OutOfMemory
    })
}

fn alloc_stack(size: usize, what: &'static str) -> Result<HostStack, VmError> {
    HostStack::new(size).map_err(|e| {
        error!("host: failed to allocate the {} ({:#x} bytes): {}", what, size, e);
        e
    })
}

impl HostContext {
    /// Build the host context.
    ///
    /// Any allocation failure aborts the construction; no partial context is
    /// returned.
    pub fn new(
        config: &HostContextConfig,
        routines: &dyn ExceptionRoutines,
    ) -> Result<Self, VmError> {
        config.validate()?;

        let ist_stack = alloc_stack(config.ist_stack_size, "exception stack")?;
        let stack = alloc_stack(config.stack_size, "host stack")?;

        let mut tss = zeroed::<TaskStateSegment>("task state segment")?;
        *tss = TaskStateSegment::empty();
        let ist_set = tss.set_ist(EXCEPTION_IST, ist_stack.top());
        debug_assert!(ist_set, "ist{} does not exist", EXCEPTION_IST);

        let mut gdt = zeroed::<GlobalDescriptorTable<GDT_ENTRIES>>("global descriptor table")?;
        let code_set = gdt.set(
            KERNEL_CODE_SELECTOR.index() as usize,
            SegmentDescriptor::kernel_code(),
        );
        let data_set = gdt.set(
            KERNEL_DATA_SELECTOR.index() as usize,
            SegmentDescriptor::kernel_data(),
        );
        let tss_set = gdt.set_system(TSS_SELECTOR.index() as usize, tss.segment_descriptor());
        debug_assert!(
            code_set && data_set && tss_set,
            "host gdt layout does not fit {} entries",
            GDT_ENTRIES
        );

        let mut idt = zeroed::<InterruptDescriptorTable>("interrupt descriptor table")?;
        for vector in 0..ExceptionVector::COUNT as u8 {
            idt.set(
                vector,
                InterruptGateDescriptor::new(
                    routines.routine(vector),
                    KERNEL_CODE_SELECTOR,
                    EXCEPTION_IST,
                    GateType::Interrupt,
                    PrivilegeLevel::Ring0,
                ),
            );
        }

        Ok(Self {
            tss,
            gdt,
            idt,
            ist_stack,
            stack,
        })
    }

    /// The task state segment.
    pub fn tss(&self) -> &TaskStateSegment {
        &self.tss
    }

    /// The global descriptor table.
    pub fn gdt(&self) -> &GlobalDescriptorTable<GDT_ENTRIES> {
        &self.gdt
    }

    /// The interrupt descriptor table.
    pub fn idt(&self) -> &InterruptDescriptorTable {
        &self.idt
    }

    /// Stack switched to on exceptions.
    pub fn ist_stack(&self) -> &HostStack {
        &self.ist_stack
    }

    /// Stack the exit handlers run on.
    pub fn stack(&self) -> &HostStack {
        &self.stack
    }

    /// Image of the GDTR.
    pub fn gdtr(&self) -> SystemTableRegister {
        self.gdt.register()
    }

    /// Image of the IDTR.
    pub fn idtr(&self) -> SystemTableRegister {
        self.idt.register()
    }

    /// Write the host state area of `vmcs`.
    ///
    /// `exit_entry` is the address the processor jumps to on vmexit.
    pub fn write_host_state(&self, vmcs: &mut dyn Vmcs, exit_entry: u64) -> Result<(), VmError> {
        // Load segments
        for field in [
            Field::HostEsSelector,
            Field::HostSsSelector,
            Field::HostDsSelector,
            Field::HostFsSelector,
            Field::HostGsSelector,
        ] {
            vmcs.write(field, KERNEL_DATA_SELECTOR.pack() as u64)?;
        }
        vmcs.write(Field::HostCsSelector, KERNEL_CODE_SELECTOR.pack() as u64)?;
        vmcs.write(Field::HostTrSelector, TSS_SELECTOR.pack() as u64)?;

        // Load gdt, idt, tss
        vmcs.write(Field::HostGdtrBase, self.gdt.base())?;
        vmcs.write(Field::HostIdtrBase, self.idt.base())?;
        vmcs.write(Field::HostTrBase, &*self.tss as *const _ as usize as u64)?;
        vmcs.write(Field::HostFsBase, 0)?;
        vmcs.write(Field::HostGsBase, 0)?;

        // Vmexit location
        vmcs.write(Field::HostRsp, self.stack.top())?;
        vmcs.write(Field::HostRip, exit_entry)
    }
}
