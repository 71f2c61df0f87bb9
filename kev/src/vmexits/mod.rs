//! Interface to play with vmexits.
//!
//! Every vmexit is routed through an [`ExitDispatcher`]. The dispatcher keeps
//! one handler chain per basic exit reason and three chains that are not tied
//! to a reason:
//!
//! - exit handlers run on every vmexit, before the reason is even read. They
//!   are for bookkeeping; whatever they return is ignored.
//! - init handlers run once, on the first exit that the hypervisor causes on
//!   purpose ([`CPUID_INIT_LEAF`]).
//! - fini handlers run once, right before the vcpu is torn down
//!   ([`CPUID_FINI_LEAF`] or [`ExitDispatcher::stop`]).
//!
//! Handlers of a chain are invoked from the most recently registered one to
//! the oldest one, until a handler claims the exit by returning `Ok(true)`.
//! A feature installed late therefore gets the first refusal over the
//! generic handlers installed before it.
//!
//! An exit that no handler claims is fatal. The dispatcher logs the exit
//! reason and the register state of the guest, stops and returns
//! [`VmError::HandleVmexitFailed`]. The same applies when a handler returns
//! an error.
//!
//! The dispatcher is owned by a single vcpu and runs on the thread that runs
//! the vcpu, so it does not lock anything.
pub mod cpuid;

pub use cpuid::{emulate_cpuid, Lifecycle, CPUID_FINI_LEAF, CPUID_INIT_LEAF};

use crate::{
    config::HostContextConfig,
    host::{ExceptionRoutines, HostContext},
    vcpu::GenericVCpuState,
    vmcs::{BasicExitReason, ExitReason, Field},
    VmError,
};
use alloc::{boxed::Box, vec::Vec};
use log::{debug, error, info, trace};

/// Number of exit reasons that can hold a handler chain.
pub const MAX_EXIT_REASONS: usize = 128;

/// A handler of vmexits.
///
/// Returns `Ok(true)` when the handler claims the exit.
pub type ExitHandler = Box<dyn FnMut(&mut GenericVCpuState) -> Result<bool, VmError> + Send>;

/// State of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Built, the vcpu has not run yet.
    Constructed,
    /// The guest is running.
    Running,
    /// A vmexit is being handled.
    HandlingExit,
    /// The fini handlers ran; the vcpu must not be resumed.
    TearingDown,
    /// The vcpu is halted.
    Stopped,
}

/// What the vcpu should do after a handled vmexit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Resume the guest.
    Resume,
    /// The guest asked for teardown; do not resume.
    Teardown,
}

/// Exit dispatcher of a vcpu.
pub struct ExitDispatcher {
    state: DispatcherState,
    host: HostContext,
    handlers: Vec<Vec<ExitHandler>>,
    exit_handlers: Vec<ExitHandler>,
    init_handlers: Vec<ExitHandler>,
    fini_handlers: Vec<ExitHandler>,
    init_done: bool,
    fini_done: bool,
}

impl ExitDispatcher {
    /// Create a dispatcher and its host context.
    ///
    /// The default cpuid handler is registered for
    /// [`BasicExitReason::Cpuid`].
    pub fn new(
        config: &HostContextConfig,
        routines: &dyn ExceptionRoutines,
    ) -> Result<Self, VmError> {
        let host = HostContext::new(config, routines)?;
        let mut handlers = Vec::new();
        handlers.resize_with(MAX_EXIT_REASONS, Vec::new);

        let mut dispatcher = Self {
            state: DispatcherState::Constructed,
            host,
            handlers,
            exit_handlers: Vec::new(),
            init_handlers: Vec::new(),
            fini_handlers: Vec::new(),
            init_done: false,
            fini_done: false,
        };
        dispatcher.add_handler(BasicExitReason::Cpuid.code(), emulate_cpuid)?;
        Ok(dispatcher)
    }

    /// Current state of the dispatcher.
    #[inline]
    pub fn state(&self) -> DispatcherState {
        self.state
    }

    /// Host context of the vcpu.
    #[inline]
    pub fn host(&self) -> &HostContext {
        &self.host
    }

    /// Append `handler` to the chain of exit `reason`.
    pub fn add_handler<F>(&mut self, reason: u64, handler: F) -> Result<(), VmError>
    where
        F: FnMut(&mut GenericVCpuState) -> Result<bool, VmError> + Send + 'static,
    {
        let chain = usize::try_from(reason)
            .ok()
            .and_then(|index| self.handlers.get_mut(index))
            .ok_or(VmError::ExitReasonOutOfRange(reason))?;
        chain.push(Box::new(handler));
        Ok(())
    }

    /// Append `handler` to the handlers that run on every vmexit.
    pub fn add_exit_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut GenericVCpuState) -> Result<bool, VmError> + Send + 'static,
    {
        self.exit_handlers.push(Box::new(handler));
    }

    /// Append `handler` to the init handlers.
    pub fn add_init_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut GenericVCpuState) -> Result<bool, VmError> + Send + 'static,
    {
        self.init_handlers.push(Box::new(handler));
    }

    /// Append `handler` to the fini handlers.
    pub fn add_fini_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut GenericVCpuState) -> Result<bool, VmError> + Send + 'static,
    {
        self.fini_handlers.push(Box::new(handler));
    }

    /// Number of handlers registered for `reason`.
    pub fn handler_count(&self, reason: u64) -> usize {
        usize::try_from(reason)
            .ok()
            .and_then(|index| self.handlers.get(index))
            .map_or(0, Vec::len)
    }

    /// Mark the vcpu as running.
    pub fn start(&mut self) -> Result<(), VmError> {
        match self.state {
            DispatcherState::Constructed => {
                self.state = DispatcherState::Running;
                Ok(())
            }
            state => Err(VmError::InvalidState(state)),
        }
    }

    /// Halt the vcpu.
    ///
    /// Runs the fini handlers if they have not run yet.
    pub fn stop(&mut self, state: &mut GenericVCpuState) -> Result<(), VmError> {
        if self.state == DispatcherState::Stopped {
            return Err(VmError::InvalidState(self.state));
        }
        let result = self.run_fini(state);
        self.state = DispatcherState::Stopped;
        info!("vcpu {}: stopped", state.id());
        result
    }

    /// Handle a vmexit.
    ///
    /// This is called by the vmexit trampoline on every vmexit. Any error is
    /// fatal: the dispatcher is [`DispatcherState::Stopped`] afterwards.
    pub fn handle(&mut self, state: &mut GenericVCpuState) -> Result<ExitOutcome, VmError> {
        if self.state != DispatcherState::Running {
            return Err(VmError::InvalidState(self.state));
        }
        self.state = DispatcherState::HandlingExit;
        let result = self.dispatch(state);
        self.state = match &result {
            Ok(ExitOutcome::Resume) => DispatcherState::Running,
            Ok(ExitOutcome::Teardown) => DispatcherState::TearingDown,
            Err(e) => {
                error!("vcpu {}: failed to handle vmexit: {}", state.id(), e);
                DispatcherState::Stopped
            }
        };
        result
    }

    fn dispatch(&mut self, state: &mut GenericVCpuState) -> Result<ExitOutcome, VmError> {
        for handler in self.exit_handlers.iter_mut().rev() {
            let _ = handler(&mut *state);
        }

        let reason = state.vmcs.exit_reason()?;
        trace!("vcpu {}: vmexit {:?}", state.id(), reason);

        if reason.basic() == Some(BasicExitReason::Cpuid) {
            if let Some(lifecycle) = cpuid::lifecycle_leaf(state) {
                return self.lifecycle(lifecycle, state);
            }
        }

        let code = reason.code();
        let chain = match self.handlers.get_mut(code as usize) {
            Some(chain) => chain,
            None => return Err(unhandled(reason, state)),
        };
        for handler in chain.iter_mut().rev() {
            if handler(&mut *state)? {
                return Ok(ExitOutcome::Resume);
            }
        }
        Err(unhandled(reason, state))
    }

    fn lifecycle(
        &mut self,
        lifecycle: Lifecycle,
        state: &mut GenericVCpuState,
    ) -> Result<ExitOutcome, VmError> {
        state.gprs.rax = 0;
        state.gprs.rbx = 0;
        state.gprs.rcx = 0;
        state.gprs.rdx = 0;
        state.vmcs.forward_rip()?;
        match lifecycle {
            Lifecycle::Init => {
                if self.init_done {
                    debug!("vcpu {}: init handlers already ran", state.id());
                } else {
                    info!("vcpu {}: running init handlers", state.id());
                    self.init_done = true;
                    for handler in self.init_handlers.iter_mut().rev() {
                        handler(&mut *state)?;
                    }
                }
                Ok(ExitOutcome::Resume)
            }
            Lifecycle::Fini => {
                self.run_fini(state)?;
                info!("vcpu {}: tearing down", state.id());
                Ok(ExitOutcome::Teardown)
            }
        }
    }

    fn run_fini(&mut self, state: &mut GenericVCpuState) -> Result<(), VmError> {
        if self.fini_done {
            return Ok(());
        }
        info!("vcpu {}: running fini handlers", state.id());
        self.fini_done = true;
        for handler in self.fini_handlers.iter_mut().rev() {
            handler(&mut *state)?;
        }
        Ok(())
    }
}

fn unhandled(reason: ExitReason, state: &GenericVCpuState) -> VmError {
    let rip = state.vmcs.read(Field::GuestRip).ok();
    let rsp = state.vmcs.read(Field::GuestRsp).ok();
    error!(
        "vcpu {}: unhandled vmexit {:?} (raw: {:#x}, entry failure: {}, rip: {:x?}, rsp: {:x?})",
        state.id(),
        reason,
        reason.raw(),
        reason.is_entry_failure(),
        rip,
        rsp
    );
    error!("vcpu {}: {:#x?}", state.id(), state.gprs);
    VmError::HandleVmexitFailed(reason.raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FakeRoutines, FixedCpuid, MemoryMsrs, MemoryVmcs};
    use abyss::x86_64::interrupt::GeneralPurposeRegisters;

    fn dispatcher() -> ExitDispatcher {
        let mut d = ExitDispatcher::new(&HostContextConfig::default(), &FakeRoutines).unwrap();
        d.start().unwrap();
        d
    }

    #[test]
    fn state_machine() {
        let mut d = ExitDispatcher::new(&HostContextConfig::default(), &FakeRoutines).unwrap();
        assert_eq!(d.state(), DispatcherState::Constructed);
        assert_eq!(d.handler_count(BasicExitReason::Cpuid.code()), 1);

        let mut vmcs = MemoryVmcs::with(&[(Field::VmexitReason, BasicExitReason::Hlt.code())]);
        let mut gprs = GeneralPurposeRegisters::default();
        let mut msrs = MemoryMsrs::default();
        let mut cpuid = FixedCpuid::default();
        let mut state = GenericVCpuState::new(0, &mut vmcs, &mut gprs, &mut msrs, &mut cpuid);

        // Not started yet.
        assert!(matches!(
            d.handle(&mut state),
            Err(VmError::InvalidState(DispatcherState::Constructed))
        ));
        d.start().unwrap();
        assert!(matches!(
            d.start(),
            Err(VmError::InvalidState(DispatcherState::Running))
        ));
        d.stop(&mut state).unwrap();
        assert_eq!(d.state(), DispatcherState::Stopped);
        assert!(matches!(
            d.stop(&mut state),
            Err(VmError::InvalidState(DispatcherState::Stopped))
        ));
    }

    #[test]
    fn reason_out_of_range() {
        let mut d = dispatcher();
        assert!(matches!(
            d.add_handler(MAX_EXIT_REASONS as u64, |_| Ok(true)),
            Err(VmError::ExitReasonOutOfRange(128))
        ));
        assert!(d.add_handler(MAX_EXIT_REASONS as u64 - 1, |_| Ok(true)).is_ok());
    }

    #[test]
    fn handler_error_is_fatal() {
        let mut d = dispatcher();
        d.add_handler(BasicExitReason::Hlt.code(), |_| {
            Err(VmError::ControllerError(Box::new("halt")))
        })
        .unwrap();
        let mut vmcs = MemoryVmcs::with(&[(Field::VmexitReason, BasicExitReason::Hlt.code())]);
        let mut gprs = GeneralPurposeRegisters::default();
        let mut msrs = MemoryMsrs::default();
        let mut cpuid = FixedCpuid::default();
        let mut state = GenericVCpuState::new(0, &mut vmcs, &mut gprs, &mut msrs, &mut cpuid);
        assert!(matches!(
            d.handle(&mut state),
            Err(VmError::ControllerError(_))
        ));
        assert_eq!(d.state(), DispatcherState::Stopped);
    }

    #[test]
    fn unreadable_reason_is_fatal() {
        let mut d = dispatcher();
        let mut vmcs = MemoryVmcs::default();
        let mut gprs = GeneralPurposeRegisters::default();
        let mut msrs = MemoryMsrs::default();
        let mut cpuid = FixedCpuid::default();
        let mut state = GenericVCpuState::new(0, &mut vmcs, &mut gprs, &mut msrs, &mut cpuid);
        assert!(matches!(
            d.handle(&mut state),
            Err(VmError::UnsupportedVmcsField(Field::VmexitReason))
        ));
        assert_eq!(d.state(), DispatcherState::Stopped);
    }

    #[test]
    fn entry_failure_is_unhandled() {
        let mut d = dispatcher();
        let mut vmcs = MemoryVmcs::with(&[(Field::VmexitReason, 0x8000_0021)]);
        let mut gprs = GeneralPurposeRegisters::default();
        let mut msrs = MemoryMsrs::default();
        let mut cpuid = FixedCpuid::default();
        let mut state = GenericVCpuState::new(0, &mut vmcs, &mut gprs, &mut msrs, &mut cpuid);
        assert!(matches!(
            d.handle(&mut state),
            Err(VmError::HandleVmexitFailed(0x8000_0021))
        ));
    }
}
