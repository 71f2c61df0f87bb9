//! Virtual CPU state visible to the exit handlers.
//!
//! Handlers never touch model specific registers or execute `cpuid` on their
//! own. They go through [`MsrAccess`] and [`CpuidSource`] carried by the
//! [`GenericVCpuState`], so the same handler runs on hardware and in tests.
use crate::{vmcs::Vmcs, VmError};
use abyss::x86_64::interrupt::GeneralPurposeRegisters;

/// Access to the model specific registers that back the guest.
pub trait MsrAccess {
    /// Read the msr.
    fn read(&mut self, msr: u32) -> Result<u64, VmError>;
    /// Write `v` to the msr.
    fn write(&mut self, msr: u32, v: u64) -> Result<(), VmError>;
}

/// Model specific registers of the current processor.
#[cfg(target_arch = "x86_64")]
pub struct HardwareMsrs {
    _p: (),
}

#[cfg(target_arch = "x86_64")]
impl HardwareMsrs {
    /// Get the handle of the hardware msrs.
    ///
    /// # Safety
    /// Must run in ring 0. Accessing an msr that the processor does not
    /// implement raises a general protection fault.
    pub unsafe fn new() -> Self {
        Self { _p: () }
    }
}

#[cfg(target_arch = "x86_64")]
impl MsrAccess for HardwareMsrs {
    fn read(&mut self, msr: u32) -> Result<u64, VmError> {
        Ok(unsafe { abyss::x86_64::msr::rdmsr(msr) })
    }

    fn write(&mut self, msr: u32, v: u64) -> Result<(), VmError> {
        unsafe { abyss::x86_64::msr::wrmsr(msr, v) };
        Ok(())
    }
}

/// Output of the cpuid instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidResult {
    /// eax
    pub eax: u32,
    /// ebx
    pub ebx: u32,
    /// ecx
    pub ecx: u32,
    /// edx
    pub edx: u32,
}

/// Source of the cpuid values presented to the guest.
pub trait CpuidSource {
    /// Query the `leaf` with `subleaf`.
    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> CpuidResult;
}

/// Host processor's cpuid.
#[cfg(target_arch = "x86_64")]
#[derive(Default)]
pub struct HostCpuid;

#[cfg(target_arch = "x86_64")]
impl CpuidSource for HostCpuid {
    #[allow(unused_unsafe)]
    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> CpuidResult {
        let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
        CpuidResult {
            eax: r.eax,
            ebx: r.ebx,
            ecx: r.ecx,
            edx: r.edx,
        }
    }
}

/// A visible state for VCpu.
pub struct GenericVCpuState<'a> {
    /// The vmcs of the vcpu.
    pub vmcs: &'a mut dyn Vmcs,
    /// general purpose register of the vcpu.
    pub gprs: &'a mut GeneralPurposeRegisters,
    /// Model specific registers that back the vcpu.
    pub msrs: &'a mut dyn MsrAccess,
    /// Cpuid values for the vcpu.
    pub cpuid: &'a mut dyn CpuidSource,
    // smp id of this vcpu.
    id: usize,
}

impl<'a> GenericVCpuState<'a> {
    /// Bundle the state of the vcpu `id`.
    pub fn new(
        id: usize,
        vmcs: &'a mut dyn Vmcs,
        gprs: &'a mut GeneralPurposeRegisters,
        msrs: &'a mut dyn MsrAccess,
        cpuid: &'a mut dyn CpuidSource,
    ) -> Self {
        Self {
            vmcs,
            gprs,
            msrs,
            cpuid,
            id,
        }
    }

    /// Get smp id of this vcpu.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }
}
