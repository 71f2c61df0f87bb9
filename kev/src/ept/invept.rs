//! Invalidation of cached EPT translations.
//!
//! See Intel® 64 and IA-32 Architectures Software Developer’s Manual, 29.4.3.1
//! Operations that Invalidate Cached Mappings.

use crate::VmError;

/// Scope of an INVEPT.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InveptType {
    /// Invalidate the mappings derived from one EPTP.
    SingleContext = 1,
    /// Invalidate the mappings derived from every EPTP.
    AllContexts = 2,
}

/// Execute INVEPT.
///
/// `eptp` is ignored for [`InveptType::AllContexts`].
///
/// # Safety
/// Must be executed in VMX root operation with EPT supported.
#[cfg(target_arch = "x86_64")]
pub unsafe fn invept(ty: InveptType, eptp: u64) -> Result<(), VmError> {
    let descriptor: [u64; 2] = [
        match ty {
            InveptType::SingleContext => eptp,
            InveptType::AllContexts => 0,
        },
        0,
    ];
    let err: i8;
    core::arch::asm!(
        "clc",
        "invept {}, [{}]",
        "setna {}",
        in(reg) ty as u64,
        in(reg) &descriptor,
        out(reg_byte) err,
        options(nostack)
    );
    if err != 0 {
        Err(VmError::VmxOperationError(crate::vmcs::instruction_error()))
    } else {
        Ok(())
    }
}
