//! Default cpuid handler.
//!
//! A 64-bit guest cannot boot without `cpuid`, so this is the one handler the
//! dispatcher registers on its own. The values come from the
//! [`CpuidSource`](crate::vcpu::CpuidSource) of the vcpu, except the initial
//! apic id in leaf 1 (EBX\[31:24\]): the host reports the id of the physical
//! core that happens to run the vcpu, which must be replaced with the vcpu id.
//!
//! Two leaves are private to the hypervisor and never reach this handler:
//! [`CPUID_INIT_LEAF`] and [`CPUID_FINI_LEAF`]. The guest side of the
//! hypervisor executes them to ask for the init and fini chains of the
//! dispatcher.
use crate::{vcpu::GenericVCpuState, VmError};

/// Leaf that runs the init chain.
pub const CPUID_INIT_LEAF: u32 = 0xBF01;
/// Leaf that runs the fini chain and tears down the vcpu.
pub const CPUID_FINI_LEAF: u32 = 0xBF00;

/// Lifecycle request carried by a cpuid exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// [`CPUID_INIT_LEAF`]
    Init,
    /// [`CPUID_FINI_LEAF`]
    Fini,
}

/// Decode the lifecycle request of a cpuid exit, if the leaf is one.
pub fn lifecycle_leaf(state: &GenericVCpuState) -> Option<Lifecycle> {
    match state.gprs.rax as u32 {
        CPUID_INIT_LEAF => Some(Lifecycle::Init),
        CPUID_FINI_LEAF => Some(Lifecycle::Fini),
        _ => None,
    }
}

/// Emulate the cpuid instruction and advance the guest rip.
///
/// The leaf is taken from EAX and the subleaf from ECX. Results are written
/// zero extended into RAX, RBX, RCX and RDX.
pub fn emulate_cpuid(state: &mut GenericVCpuState) -> Result<bool, VmError> {
    let (leaf, subleaf) = (state.gprs.rax as u32, state.gprs.rcx as u32);
    let mut r = state.cpuid.cpuid(leaf, subleaf);
    if leaf == 1 {
        r.ebx = (r.ebx & 0x00ff_ffff) | ((state.id() as u32 & 0xff) << 24);
    }

    state.gprs.rax = r.eax as u64;
    state.gprs.rbx = r.ebx as u64;
    state.gprs.rcx = r.ecx as u64;
    state.gprs.rdx = r.edx as u64;
    state.vmcs.forward_rip()?;
    Ok(true)
}
