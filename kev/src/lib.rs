//! The KeV virtual cpu core.
//!
//! This crate holds the pieces of a type 2 hypervisor that every virtual cpu
//! touches on each vmexit:
//!
//! - [`ept`]: the extended page table that translates guest physical addresses
//!   into host physical addresses, with page granular permissions and
//!   caching attributes.
//! - [`host`]: the host side cpu state (task state segment, descriptor tables
//!   and stacks) that must be valid before guest code runs. When a vmexit
//!   happens, the processor reloads this state and jumps into the hypervisor.
//! - [`vmexits`]: the exit dispatcher that routes each vmexit into the chain
//!   of handlers registered for its exit reason.
//!
//! The virtual-machine control structure is reached through the [`vmcs::Vmcs`]
//! trait. On real hardware it is the [`vmcs::ActiveVmcs`], which uses
//! `vmread` and `vmwrite`. Every other hardware capability that a handler
//! needs (model specific registers, `cpuid`, physical address mapping) sits
//! behind a small trait as well, so the whole exit path can run against
//! in-memory stand-ins.
//!
//! ## Lifecycle of a vcpu
//! 1. Build an [`vmexits::ExitDispatcher`]. This allocates the host context.
//!    Allocation failure aborts the construction.
//! 2. Register handlers with [`vmexits::ExitDispatcher::add_handler`] and the
//!    init/fini/exit chains.
//! 3. Write the host state into the vmcs with
//!    [`host::HostContext::write_host_state`] and the eptp of the
//!    [`ept::ExtendedPageTable`] into [`vmcs::Field::Eptptr`].
//! 4. [`vmexits::ExitDispatcher::start`] the dispatcher and call
//!    [`vmexits::ExitDispatcher::handle`] on every vmexit until it reports
//!    [`vmexits::ExitOutcome::Teardown`] or an error.
//!
//! Logging goes through the [`log`] facade. The embedding kernel installs the
//! logger.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod emulate;
pub mod ept;
pub mod host;
pub mod probe;
pub mod vcpu;
pub mod vm;
pub mod vmcs;
pub mod vmexits;

#[doc(hidden)]
pub mod testutils;

use alloc::boxed::Box;
use core::fmt;

pub use probe::Probe;

/// Possible errors of the virtual cpu core.
#[derive(Debug)]
pub enum VmError {
    /// No handler claimed the exit reason.
    HandleVmexitFailed(u64),
    /// Exit reason is larger than the dispatcher can register.
    ExitReasonOutOfRange(u64),
    /// The dispatcher is not in a state that allows the operation.
    InvalidState(vmexits::DispatcherState),
    /// Failed to allocate memory.
    OutOfMemory,
    /// Configuration is rejected.
    InvalidConfig(&'static str),
    /// Error while editing the extended page table.
    EptMappingError(ept::EptMappingError),
    /// A vmx instruction failed.
    VmxOperationError(vmcs::InstructionError),
    /// The vmcs store does not provide the field.
    UnsupportedVmcsField(vmcs::Field),
    /// Error from the extension.
    ControllerError(Box<dyn fmt::Debug + Send + Sync>),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::HandleVmexitFailed(reason) => {
                write!(f, "unhandled exit reason {:?}", vmcs::ExitReason::new(*reason))
            }
            VmError::ExitReasonOutOfRange(reason) => {
                write!(f, "exit reason {:#x} is out of range", reason)
            }
            VmError::InvalidState(state) => write!(f, "invalid dispatcher state {:?}", state),
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::InvalidConfig(why) => write!(f, "invalid configuration: {}", why),
            VmError::EptMappingError(e) => write!(f, "ept: {}", e),
            VmError::VmxOperationError(e) => write!(f, "vmx operation failed: {:?}", e),
            VmError::UnsupportedVmcsField(field) => write!(f, "unsupported vmcs field {:?}", field),
            VmError::ControllerError(e) => write!(f, "controller error: {:?}", e),
        }
    }
}

impl From<ept::EptMappingError> for VmError {
    fn from(e: ept::EptMappingError) -> Self {
        VmError::EptMappingError(e)
    }
}
