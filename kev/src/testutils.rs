//! In-memory stand-ins for the hardware capabilities.
use crate::{
    host::ExceptionRoutines,
    vcpu::{CpuidResult, CpuidSource, MsrAccess},
    vmcs::{Field, Vmcs},
    VmError,
};
use alloc::collections::BTreeMap;

/// Vmcs backed by a map. Reading a field that was never written fails.
#[derive(Default, Debug)]
pub struct MemoryVmcs {
    fields: BTreeMap<Field, u64>,
}

impl MemoryVmcs {
    pub fn with(fields: &[(Field, u64)]) -> Self {
        Self {
            fields: fields.iter().copied().collect(),
        }
    }
}

impl Vmcs for MemoryVmcs {
    fn read(&self, field: Field) -> Result<u64, VmError> {
        self.fields
            .get(&field)
            .copied()
            .ok_or(VmError::UnsupportedVmcsField(field))
    }

    fn write(&mut self, field: Field, v: u64) -> Result<(), VmError> {
        self.fields.insert(field, v);
        Ok(())
    }
}

/// Msrs backed by a map. Unknown msrs read as zero.
#[derive(Default, Debug)]
pub struct MemoryMsrs {
    msrs: BTreeMap<u32, u64>,
}

impl MemoryMsrs {
    pub fn write_raw(&mut self, index: u32, v: u64) {
        self.msrs.insert(index, v);
    }

    pub fn read_raw(&self, index: u32) -> Option<u64> {
        self.msrs.get(&index).copied()
    }
}

impl MsrAccess for MemoryMsrs {
    fn read(&mut self, msr: u32) -> Result<u64, VmError> {
        Ok(self.msrs.get(&msr).copied().unwrap_or(0))
    }

    fn write(&mut self, msr: u32, v: u64) -> Result<(), VmError> {
        self.msrs.insert(msr, v);
        Ok(())
    }
}

/// Cpuid table. Unknown leaves read as zero.
#[derive(Default, Debug)]
pub struct FixedCpuid {
    leaves: BTreeMap<(u32, u32), CpuidResult>,
}

impl FixedCpuid {
    pub fn set(&mut self, leaf: u32, subleaf: u32, r: CpuidResult) {
        self.leaves.insert((leaf, subleaf), r);
    }
}

impl CpuidSource for FixedCpuid {
    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.leaves
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or_default()
    }
}

/// Exception routines at `0xffff_8000_0010_0000 + vector * 0x10`.
pub struct FakeRoutines;

impl FakeRoutines {
    pub const BASE: u64 = 0xffff_8000_0010_0000;
}

impl ExceptionRoutines for FakeRoutines {
    fn routine(&self, vector: u8) -> u64 {
        Self::BASE + vector as u64 * 0x10
    }
}
