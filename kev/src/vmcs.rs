//! Virtual-Machine Control State (VMCS) related apis.
//!
//! The hypervisor core treats the VMCS as a key-value store addressed by
//! [`Field`]. [`ActiveVmcs`] talks to the processor through VMREAD and
//! VMWRITE; anything else that implements [`Vmcs`] can stand in for it.
use crate::VmError;
#[cfg(target_arch = "x86_64")]
use core::arch::asm;
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

/// Possible errors for vm-related instructions.
///
/// # Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 30-1. Vm-Instruction Error Numbers.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, FromPrimitive)]
#[repr(u64)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation
    VmcallInVmxRoot = 1,
    /// VMCLEAR with invalid physical address
    VmclearWithInvAddr = 2,
    /// VMCLEAR with VMXON pointer
    VmclearWithVmxon = 3,
    /// VMLAUNCH with non-clear VMCS
    VmlaunchWithNonclearVmcs = 4,
    /// VMRESUME with non-launched VMCS
    VmresumeWithNonlaunchedVmcs = 5,
    /// VMRESUME after VMXOFF
    VmresumeAfterVmxoff = 6,
    /// VM entry with invalid control field(s)
    InvalidCs = 7,
    /// VM entry with invalid host-state field(s)
    InvalidHostState = 8,
    /// VMPTRLD with invalid physical address
    VmPtrLdWithInvAddr = 9,
    /// VMPTRLD with VMXON pointer
    VmPtrLdWithVmxOn = 10,
    /// VMPTRLD with incorrect VMCS revision identifier
    VmPtrLdWithIncorrectRevId = 11,
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedVmcsField = 12,
    /// VMWRITE to read-only VMCS component
    WriteToRoField = 13,
    /// VMXON executed in VMX root operation
    VmxonInVmxRoot = 15,
    /// VM entry with invalid executive-VMCS pointer
    VmEntryWithInvalidExecVmcs = 16,
    /// VM entry with non-launched executive VMCS
    VmEntryWithNonlaunchedExecVmcs = 17,
    /// VM entry with executive-VMCS pointer not VMXON pointer
    VmEntryWithExecVmcs = 18,
    /// VMCALL with non-clear VMCS
    VmcallWithNonclearVmcs = 19,
    /// VMCALL with invalid VM-exit control fields
    VmcallWithInvVmexitCs = 20,
    /// VMCALL with incorrect MSEG revision identifier
    VmcallWithIncorrectMsegRevId = 22,
    /// VMXOFF under dual-monitor treatment of SMIs and SMM
    VmxoffUnderDualMonitorTreatment = 23,
    /// VMCALL with invalid SMM-monitor features
    VmcallWithInvSmmMonitor = 24,
    /// VM entry with invalid VM-execution control fields in executive VMCS
    VmentryWithInvVmExecCs = 25,
    /// VM entry with events blocked by MOV SS.
    VmentryWithEventBlockedByMovss = 26,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidOperandToInveptInvvpid = 28,
    /// Unknown error.
    #[num_enum(default)]
    Unknown = 0,
}

/// Vmcs field.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    // 16bit fields
    HostEsSelector = 0x00000C00,
    HostCsSelector = 0x00000C02,
    HostSsSelector = 0x00000C04,
    HostDsSelector = 0x00000C06,
    HostFsSelector = 0x00000C08,
    HostGsSelector = 0x00000C0A,
    HostTrSelector = 0x00000C0C,
    // 64bit fields
    Eptptr = 0x0000201A,
    GuestPhysicalAddr = 0x00002400,
    GuestIa32Debugctl = 0x00002802,
    GuestIa32Pat = 0x00002804,
    GuestIa32Efer = 0x00002806,
    GuestIa32PerfGlobalCtrl = 0x00002808,
    // 32bit fields
    InstructionError = 0x00004400,
    VmexitReason = 0x00004402,
    VmexitInterruptionInfo = 0x00004404,
    VmexitInstructionLength = 0x0000440C,
    VmexitInstructionInfo = 0x0000440E,
    GuestIa32SysenterCsMsr = 0x0000482A,
    // natural width fields
    VmexitQualification = 0x00006400,
    GuestLinearAddr = 0x0000640A,
    GuestFsBase = 0x0000680E,
    GuestGsBase = 0x00006810,
    GuestRsp = 0x0000681C,
    GuestRip = 0x0000681E,
    GuestRflags = 0x00006820,
    GuestIa32SysenterEspMsr = 0x00006824,
    GuestIa32SysenterEipMsr = 0x00006826,
    HostFsBase = 0x00006C06,
    HostGsBase = 0x00006C08,
    HostTrBase = 0x00006C0A,
    HostGdtrBase = 0x00006C0C,
    HostIdtrBase = 0x00006C0E,
    HostRsp = 0x00006C14,
    HostRip = 0x00006C16,
}

/// Key-value view of a virtual-machine control structure.
pub trait Vmcs {
    /// Read the field.
    fn read(&self, field: Field) -> Result<u64, VmError>;

    /// Write to the field.
    fn write(&mut self, field: Field, v: u64) -> Result<(), VmError>;

    /// Resolve the exit reason of the last vmexit.
    fn exit_reason(&self) -> Result<ExitReason, VmError> {
        self.read(Field::VmexitReason).map(ExitReason::new)
    }

    /// Forward to the next instruction.
    fn forward_rip(&mut self) -> Result<(), VmError> {
        let rip = self.read(Field::GuestRip)?;
        let len = self.read(Field::VmexitInstructionLength)?;
        self.write(Field::GuestRip, rip.wrapping_add(len))
    }
}

/// The VMCS currently loaded on this processor.
#[cfg(target_arch = "x86_64")]
pub struct ActiveVmcs {
    _p: (),
}

#[cfg(target_arch = "x86_64")]
impl ActiveVmcs {
    /// Get the handle of the activated vmcs.
    ///
    /// # Safety
    /// The processor must be in VMX root operation with a current VMCS.
    pub unsafe fn activated() -> Self {
        Self { _p: () }
    }
}

#[cfg(target_arch = "x86_64")]
impl Vmcs for ActiveVmcs {
    fn read(&self, field: Field) -> Result<u64, VmError> {
        unsafe {
            let err: i8;
            let v: u64;
            asm!(
                "clc",
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) field as u64,
                out(reg_byte) err
            );
            if err != 0 {
                Err(VmError::VmxOperationError(instruction_error()))
            } else {
                Ok(v)
            }
        }
    }

    fn write(&mut self, field: Field, v: u64) -> Result<(), VmError> {
        unsafe {
            let err: i8;
            asm!(
                "clc",
                "vmwrite {}, {}",
                "setna {}",
                in(reg) field as u64,
                in(reg) v,
                out(reg_byte) err
            );
            if err != 0 {
                Err(VmError::VmxOperationError(instruction_error()))
            } else {
                Ok(())
            }
        }
    }
}

/// Read the error number of the last failed VMX instruction.
#[cfg(target_arch = "x86_64")]
pub(crate) fn instruction_error() -> InstructionError {
    unsafe {
        let err: i8;
        let v: u64;
        asm!(
            "clc",
            "vmread {}, {}",
            "setna {}",
            out(reg) v,
            in(reg) Field::InstructionError as u64,
            out(reg_byte) err
        );
        if err != 0 {
            InstructionError::Unknown
        } else {
            InstructionError::from(v)
        }
    }
}

/// Possible list of basic vmexit reasons.
///
/// See Table C-1. Basic Exit Reasons for details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSmi = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    MovCr = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntfailGuestState = 33,
    EntfailMsrLoading = 34,
    Mwait = 36,
    Mtf = 37,
    Monitor = 39,
    Pause = 40,
    EntfailMachineChk = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    AccessGdtrOrIdtr = 46,
    AccessLdtrOrTr = 47,
    EptViolation = 48,
    EptMisconfig = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptTimer = 52,
    Invvpid = 53,
    Wbinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PmlFull = 62,
    Xsaves = 63,
    Xrstors = 64,
    Pconfig = 65,
    SppEvent = 66,
    Umwait = 67,
    Tpause = 68,
    Loadiwkey = 69,
}

impl BasicExitReason {
    /// Numeric code of the reason.
    #[inline]
    pub fn code(self) -> u64 {
        u16::from(self) as u64
    }
}

bitflags::bitflags! {
    /// Upper bits of the exit reason field.
    ///
    /// See Table 24-15. Format of Exit Reason.
    pub struct ExitReasonFlags: u64 {
        /// The exit was incident to enclave mode.
        const ENCLAVE_MODE = 1 << 27;
        /// A pending MTF VM exit.
        const PENDING_MTF = 1 << 28;
        /// The exit was from VMX root operation.
        const FROM_VMX_ROOT = 1 << 29;
        /// VM-entry failure.
        const ENTRY_FAILURE = 1 << 31;
    }
}

/// Exit reason of a vmexit.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExitReason(u64);

impl ExitReason {
    /// Mask of the basic exit reason.
    pub const BASIC_MASK: u64 = 0xffff;

    /// Wrap the raw exit reason field.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value of the field.
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Basic exit reason code (bits 15:0).
    #[inline]
    pub const fn code(&self) -> u64 {
        self.0 & Self::BASIC_MASK
    }

    /// Decoded basic exit reason, if architecturally defined.
    pub fn basic(&self) -> Option<BasicExitReason> {
        BasicExitReason::try_from(self.code() as u16).ok()
    }

    #[inline]
    pub const fn flags(&self) -> ExitReasonFlags {
        ExitReasonFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub const fn is_entry_failure(&self) -> bool {
        self.flags().contains(ExitReasonFlags::ENTRY_FAILURE)
    }
}

impl core::fmt::Debug for ExitReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.basic() {
            Some(basic) => write!(f, "{:?}", basic)?,
            None => write!(f, "Unknown({:#x})", self.code())?,
        }
        if !self.flags().is_empty() {
            write!(f, " {:?}", self.flags())?;
        }
        Ok(())
    }
}
