//! Model-specific register (MSR).

#[cfg(target_arch = "x86_64")]
use core::arch::asm;

/// IA32_SYSENTER_CS.
pub const IA32_SYSENTER_CS: u32 = 0x174;
/// IA32_SYSENTER_ESP.
pub const IA32_SYSENTER_ESP: u32 = 0x175;
/// IA32_SYSENTER_EIP.
pub const IA32_SYSENTER_EIP: u32 = 0x176;
/// IA32_DEBUGCTL.
pub const IA32_DEBUGCTL: u32 = 0x1d9;
/// IA32_PAT.
pub const IA32_PAT: u32 = 0x277;
/// IA32_PERF_GLOBAL_CTRL.
pub const IA32_PERF_GLOBAL_CTRL: u32 = 0x38f;
/// IA32_EFER.
pub const IA32_EFER: u32 = 0xc000_0080;
/// IA32_FS_BASE.
pub const IA32_FS_BASE: u32 = 0xc000_0100;
/// IA32_GS_BASE.
pub const IA32_GS_BASE: u32 = 0xc000_0101;

/// Read the msr `addr`.
///
/// # Safety
/// `addr` must name an MSR implemented by the processor.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn rdmsr(addr: u32) -> u64 {
    let hi: u32;
    let lo: u32;
    asm!("rdmsr", out("edx") hi, out("eax") lo, in("ecx") addr, options(nomem, nostack));
    ((hi as u64) << 32) | (lo as u64)
}

/// Write `v` to the msr `addr`.
///
/// # Safety
/// Writing an MSR can change the processor's operating mode.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn wrmsr(addr: u32, v: u64) {
    asm!(
        "wrmsr",
        in("edx") (v >> 32) as u32,
        in("eax") v as u32,
        in("ecx") addr,
        options(nomem, nostack)
    );
}
