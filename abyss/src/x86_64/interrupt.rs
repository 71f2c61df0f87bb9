//! Interrupt.

use super::segmentation::SegmentSelector;
use super::PrivilegeLevel;

/// Exception vector enumeration of the x86_64.
///
/// Only the architecturally defined vectors are listed; vectors 32 to 255 are
/// external interrupts and are not named.
///
/// See Intel 64 and IA-32 Architectures Software Developer's Manual, Volume
/// 3A: System Programming Guide, Part 1, Chapter 6.15.
#[derive(Clone, Copy, PartialEq, Eq, Debug, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum ExceptionVector {
    /// Interrupt 0 - Divide Error Exception (#DE)
    DivideError = 0,
    /// Interrupt 1 - Debug Exception (#DB)
    Debug = 1,
    /// Interrupt 2 - NonMaskableInterrupt Interrupt
    NonMaskableInterrupt = 2,
    /// Interrupt 3 - Breakpoint Exception (#BP)
    Breakpoint = 3,
    /// Interrupt 4 - Overflow Exception (#OF)
    OverflowException = 4,
    /// Interrupt 5 - Bound Range Exceeded Exception (#BR)
    BoundRangeExceeded = 5,
    /// Interrupt 6 - Invalid Opcode Exception (#UD)
    InvalidOpcode = 6,
    /// Interrupt 7 - Device Not Available Exception (#NM)
    DeviceNotAvailable = 7,
    /// Interrupt 8 - Double Fault Exception (#DF)
    DoubleFault = 8,
    /// Interrupt 9 - Coprocessor Segment Overrun
    CoprocessorSegmentOverrun = 9,
    /// Interrupt 10 - Invalid TSS Exception (#TS)
    InvalidTss = 10,
    /// Interrupt 11 - Segment Not Present (#NP)
    SegmentNotPresent = 11,
    /// Interrupt 12 - Stack Fault Exception (#SS)
    StackFault = 12,
    /// Interrupt 13 - General Protection Exception (#GP)
    GeneralProtection = 13,
    /// Interrupt 14 - Page-Fault Exception (#PF)
    PageFault = 14,
    /// Interrupt 15 - Reserved.
    Reserved15 = 15,
    /// Interrupt 16 - x87 FPU Floating-Point Error (#MF)
    X87FpuFloatingPointError = 16,
    /// Interrupt 17 - Alignment Check Exception (#AC)
    AlignmentCheckException = 17,
    /// Interrupt 18 - Machine-Check Exception (#MC)
    MachineCheckException = 18,
    /// Interrupt 19 - SIMD Floating-Point Exception (#XM)
    SimdFloatingPointException = 19,
    /// Interrupt 20 - Virtualization Exception (#VE)
    VirtualizationException = 20,
    /// Interrupt 21 - Control Protection Exception (#CP)
    ControlProtection = 21,
    /// Interrupt 22 - Reserved.
    Reserved22 = 22,
    /// Interrupt 23 - Reserved.
    Reserved23 = 23,
    /// Interrupt 24 - Reserved.
    Reserved24 = 24,
    /// Interrupt 25 - Reserved.
    Reserved25 = 25,
    /// Interrupt 26 - Reserved.
    Reserved26 = 26,
    /// Interrupt 27 - Reserved.
    Reserved27 = 27,
    /// Interrupt 28 - Hypervisor Injection Exception.
    HypervisorInjection = 28,
    /// Interrupt 29 - VMM Communication Exception.
    VmmCommunication = 29,
    /// Interrupt 30 - Security Exception.
    Security = 30,
    /// Interrupt 31 - Reserved.
    Reserved31 = 31,
}

impl ExceptionVector {
    /// Number of architecturally defined exception vectors.
    pub const COUNT: usize = 32;
}

/// Type of a gate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GateType {
    /// Interrupts are disabled on entry.
    Interrupt = 0xe,
    /// Interrupts keep their state on entry.
    Trap = 0xf,
}

/// 64-bit interrupt/trap gate descriptor.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InterruptGateDescriptor {
    lo: u16,
    selector: u16,
    options: u16,
    mid: u16,
    hi: u32,
    _rev: u32,
}

impl InterruptGateDescriptor {
    /// Empty this gate entry.
    #[inline(always)]
    pub const fn empty() -> Self {
        InterruptGateDescriptor {
            lo: 0,
            selector: 0,
            options: 0,
            mid: 0,
            hi: 0,
            _rev: 0,
        }
    }

    /// Create a present gate that enters `handler` through the code segment
    /// `ss`.
    ///
    /// `ist` selects the interrupt stack table slot of the TSS to switch to
    /// (0 keeps the current stack).
    #[inline(always)]
    pub const fn new(
        handler: u64,
        ss: SegmentSelector,
        ist: u8,
        ty_: GateType,
        dpl: PrivilegeLevel,
    ) -> Self {
        InterruptGateDescriptor {
            lo: handler as u16,
            selector: ss.pack(),
            options: (1 << 15) | (dpl as u16) << 13 | (ty_ as u16) << 8 | (ist as u16 & 0x7),
            mid: (handler >> 16) as u16,
            hi: (handler >> 32) as u32,
            _rev: 0,
        }
    }

    /// Entry point of the gate.
    #[inline]
    pub const fn handler(&self) -> u64 {
        self.lo as u64 | (self.mid as u64) << 16 | (self.hi as u64) << 32
    }

    /// Code segment selector of the gate.
    #[inline]
    pub const fn selector(&self) -> u16 {
        self.selector
    }

    /// Interrupt stack table slot of the gate.
    #[inline]
    pub const fn ist(&self) -> u8 {
        (self.options & 0x7) as u8
    }

    /// Whether the gate is present.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.options & (1 << 15) != 0
    }

    /// Gate type, if present.
    #[inline]
    pub const fn gate_type(&self) -> Option<GateType> {
        match (self.options >> 8) & 0xf {
            0xe => Some(GateType::Interrupt),
            0xf => Some(GateType::Trap),
            _ => None,
        }
    }
}

/// General purpose register, numbered as the processor reports them in
/// vm-exit qualifications and instruction information.
#[derive(num_enum::TryFromPrimitive, Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// X86_64 general purpose registers
///
/// The stack pointer is not part of the frame; it is saved by whoever owns
/// the execution context (e.g. the VMCS guest-state area).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GeneralPurposeRegisters {
    // callee-preserved.
    pub r15: u64,
    // callee-preserved.
    pub r14: u64,
    // callee-preserved.
    pub r13: u64,
    // callee-preserved.
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    // callee-preserved.
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    // callee-preserved.
    pub rbx: u64,
    pub rax: u64,
}

impl GeneralPurposeRegisters {
    /// Read the register `reg`.
    ///
    /// Returns `None` for [`Register::Rsp`].
    pub fn get(&self, reg: Register) -> Option<u64> {
        self.slot(reg).map(|v| *v)
    }

    /// Write `v` into the register `reg`.
    ///
    /// Returns false for [`Register::Rsp`].
    pub fn set(&mut self, reg: Register, v: u64) -> bool {
        match self.slot_mut(reg) {
            Some(slot) => {
                *slot = v;
                true
            }
            None => false,
        }
    }

    fn slot(&self, reg: Register) -> Option<&u64> {
        Some(match reg {
            Register::Rax => &self.rax,
            Register::Rcx => &self.rcx,
            Register::Rdx => &self.rdx,
            Register::Rbx => &self.rbx,
            Register::Rsp => return None,
            Register::Rbp => &self.rbp,
            Register::Rsi => &self.rsi,
            Register::Rdi => &self.rdi,
            Register::R8 => &self.r8,
            Register::R9 => &self.r9,
            Register::R10 => &self.r10,
            Register::R11 => &self.r11,
            Register::R12 => &self.r12,
            Register::R13 => &self.r13,
            Register::R14 => &self.r14,
            Register::R15 => &self.r15,
        })
    }

    fn slot_mut(&mut self, reg: Register) -> Option<&mut u64> {
        Some(match reg {
            Register::Rax => &mut self.rax,
            Register::Rcx => &mut self.rcx,
            Register::Rdx => &mut self.rdx,
            Register::Rbx => &mut self.rbx,
            Register::Rsp => return None,
            Register::Rbp => &mut self.rbp,
            Register::Rsi => &mut self.rsi,
            Register::Rdi => &mut self.rdi,
            Register::R8 => &mut self.r8,
            Register::R9 => &mut self.r9,
            Register::R10 => &mut self.r10,
            Register::R11 => &mut self.r11,
            Register::R12 => &mut self.r12,
            Register::R13 => &mut self.r13,
            Register::R14 => &mut self.r14,
            Register::R15 => &mut self.r15,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn gate_encoding() {
        let cs = SegmentSelector::new(1, PrivilegeLevel::Ring0);
        let gate = InterruptGateDescriptor::new(
            0xffff_8000_dead_beef,
            cs,
            1,
            GateType::Interrupt,
            PrivilegeLevel::Ring0,
        );
        assert!(gate.is_present());
        assert_eq!(gate.handler(), 0xffff_8000_dead_beef);
        assert_eq!(gate.selector(), 0x08);
        assert_eq!(gate.ist(), 1);
        assert_eq!(gate.gate_type(), Some(GateType::Interrupt));
        assert_eq!(core::mem::size_of::<InterruptGateDescriptor>(), 16);
        assert!(!InterruptGateDescriptor::empty().is_present());
    }

    #[test]
    fn register_numbering() {
        assert_eq!(Register::try_from(4u8).ok(), Some(Register::Rsp));
        assert_eq!(Register::try_from(15u8).ok(), Some(Register::R15));
        assert!(Register::try_from(16u8).is_err());
        assert_eq!(
            ExceptionVector::try_from(14u8).ok(),
            Some(ExceptionVector::PageFault)
        );
        assert!(ExceptionVector::try_from(32u8).is_err());
    }

    #[test]
    fn register_access() {
        let mut gprs = GeneralPurposeRegisters::default();
        assert!(gprs.set(Register::R11, 0x11));
        assert!(!gprs.set(Register::Rsp, 0x22));
        assert_eq!(gprs.r11, 0x11);
        assert_eq!(gprs.get(Register::R11), Some(0x11));
        assert_eq!(gprs.get(Register::Rsp), None);
    }
}
