//! Register emulation hooks for the exit handlers.
//!
//! Some model specific registers of the guest are not backed by the hardware
//! msrs. The processor loads and saves them through the guest state area of
//! the vmcs on every vm entry and vmexit, so reading the hardware msr inside
//! an exit handler would return the host's value. [`emulate_rdmsr`] and
//! [`emulate_wrmsr`] route those registers to the vmcs and everything else to
//! [`MsrAccess`](crate::vcpu::MsrAccess).
//!
//! [`emulate_rdgpr`] and [`emulate_wrgpr`] access the general purpose register
//! named by the exit qualification of a control register access
//! (bits 11:8). The guest rsp also lives in the vmcs.
use crate::{
    vcpu::GenericVCpuState,
    vmcs::{Field, Vmcs},
    VmError,
};
use abyss::x86_64::{interrupt::Register, msr};

/// The vmcs field that holds the guest copy of `index`, if any.
pub fn msr_to_vmcs_field(index: u32) -> Option<Field> {
    match index {
        msr::IA32_DEBUGCTL => Some(Field::GuestIa32Debugctl),
        msr::IA32_PAT => Some(Field::GuestIa32Pat),
        msr::IA32_EFER => Some(Field::GuestIa32Efer),
        msr::IA32_PERF_GLOBAL_CTRL => Some(Field::GuestIa32PerfGlobalCtrl),
        msr::IA32_SYSENTER_CS => Some(Field::GuestIa32SysenterCsMsr),
        msr::IA32_SYSENTER_ESP => Some(Field::GuestIa32SysenterEspMsr),
        msr::IA32_SYSENTER_EIP => Some(Field::GuestIa32SysenterEipMsr),
        msr::IA32_FS_BASE => Some(Field::GuestFsBase),
        msr::IA32_GS_BASE => Some(Field::GuestGsBase),
        _ => None,
    }
}

/// Read the guest's view of the msr `index`.
pub fn emulate_rdmsr(state: &mut GenericVCpuState, index: u32) -> Result<u64, VmError> {
    match msr_to_vmcs_field(index) {
        Some(field) => state.vmcs.read(field),
        None => state.msrs.read(index),
    }
}

/// Write `value` to the guest's view of the msr `index`.
pub fn emulate_wrmsr(state: &mut GenericVCpuState, index: u32, value: u64) -> Result<(), VmError> {
    match msr_to_vmcs_field(index) {
        // 32-bit field.
        Some(Field::GuestIa32SysenterCsMsr) => state
            .vmcs
            .write(Field::GuestIa32SysenterCsMsr, value & 0xffff_ffff),
        Some(field) => state.vmcs.write(field, value),
        None => state.msrs.write(index, value),
    }
}

fn qualified_register(vmcs: &dyn Vmcs) -> Result<Register, VmError> {
    let qualification = vmcs.read(Field::VmexitQualification)?;
    // Four bits always name a register.
    Register::try_from(((qualification >> 8) & 0xf) as u8)
        .map_err(|_| VmError::HandleVmexitFailed(qualification))
}

/// Read the general purpose register named by the exit qualification.
pub fn emulate_rdgpr(state: &mut GenericVCpuState) -> Result<u64, VmError> {
    match qualified_register(&*state.vmcs)? {
        Register::Rsp => state.vmcs.read(Field::GuestRsp),
        reg => state
            .gprs
            .get(reg)
            .ok_or(VmError::HandleVmexitFailed(reg as u64)),
    }
}

/// Write `value` to the general purpose register named by the exit
/// qualification.
pub fn emulate_wrgpr(state: &mut GenericVCpuState, value: u64) -> Result<(), VmError> {
    match qualified_register(&*state.vmcs)? {
        Register::Rsp => state.vmcs.write(Field::GuestRsp, value),
        reg => {
            state.gprs.set(reg, value);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FixedCpuid, MemoryMsrs, MemoryVmcs};
    use abyss::x86_64::interrupt::GeneralPurposeRegisters;

    #[test]
    fn vmcs_backed_msrs() {
        let mut vmcs = MemoryVmcs::default();
        let mut gprs = GeneralPurposeRegisters::default();
        let mut msrs = MemoryMsrs::default();
        let mut cpuid = FixedCpuid::default();
        vmcs.write(Field::GuestIa32Efer, 0xd01).unwrap();
        msrs.write_raw(msr::IA32_EFER, 0x500);
        msrs.write_raw(0x10, 0x1234);

        let mut state = GenericVCpuState::new(0, &mut vmcs, &mut gprs, &mut msrs, &mut cpuid);
        assert_eq!(emulate_rdmsr(&mut state, msr::IA32_EFER).unwrap(), 0xd01);
        // TSC is not kept in the vmcs.
        assert_eq!(emulate_rdmsr(&mut state, 0x10).unwrap(), 0x1234);

        emulate_wrmsr(&mut state, msr::IA32_SYSENTER_CS, 0xdead_0000_0010).unwrap();
        emulate_wrmsr(&mut state, msr::IA32_GS_BASE, 0xffff_8000_0000_0000).unwrap();
        emulate_wrmsr(&mut state, 0x10, 0).unwrap();

        assert_eq!(vmcs.read(Field::GuestIa32SysenterCsMsr).unwrap(), 0x10);
        assert_eq!(vmcs.read(Field::GuestGsBase).unwrap(), 0xffff_8000_0000_0000);
        assert_eq!(msrs.read_raw(0x10), Some(0));
        assert_eq!(msrs.read_raw(msr::IA32_GS_BASE), None);
    }

    #[test]
    fn gpr_from_qualification() {
        let mut vmcs = MemoryVmcs::default();
        let mut gprs = GeneralPurposeRegisters::default();
        let mut msrs = MemoryMsrs::default();
        let mut cpuid = FixedCpuid::default();
        gprs.rbx = 0x42;
        vmcs.write(Field::GuestRsp, 0x7000).unwrap();

        {
            let mut state =
                GenericVCpuState::new(0, &mut vmcs, &mut gprs, &mut msrs, &mut cpuid);
            // mov cr0, rbx
            state.vmcs.write(Field::VmexitQualification, 3 << 8).unwrap();
            assert_eq!(emulate_rdgpr(&mut state).unwrap(), 0x42);
            emulate_wrgpr(&mut state, 0x43).unwrap();

            // mov cr3, rsp
            state
                .vmcs
                .write(Field::VmexitQualification, (4 << 8) | 3)
                .unwrap();
            assert_eq!(emulate_rdgpr(&mut state).unwrap(), 0x7000);
            emulate_wrgpr(&mut state, 0x6000).unwrap();

            // mov cr4, r15
            state
                .vmcs
                .write(Field::VmexitQualification, (15 << 8) | 4)
                .unwrap();
            emulate_wrgpr(&mut state, 0xf).unwrap();
        }
        assert_eq!(gprs.rbx, 0x43);
        assert_eq!(gprs.r15, 0xf);
        assert_eq!(vmcs.read(Field::GuestRsp).unwrap(), 0x6000);
    }
}
