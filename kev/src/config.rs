//! Runtime configuration.

use crate::VmError;

/// Sizes of the host stacks built for each vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostContextConfig {
    /// Stack used by the exit handlers.
    pub stack_size: usize,
    /// Stack switched to on host exceptions (IST1).
    pub ist_stack_size: usize,
}

impl Default for HostContextConfig {
    fn default() -> Self {
        Self {
            stack_size: 0x8000,
            ist_stack_size: 0x8000,
        }
    }
}

impl HostContextConfig {
    /// Check that both stacks are non-empty and keep the 16-byte stack
    /// alignment of the System V ABI.
    pub fn validate(&self) -> Result<(), VmError> {
        for size in [self.stack_size, self.ist_stack_size] {
            if size == 0 {
                return Err(VmError::InvalidConfig("host stack size is zero"));
            }
            if size % 16 != 0 {
                return Err(VmError::InvalidConfig(
                    "host stack size is not a multiple of 16",
                ));
            }
        }
        Ok(())
    }
}

/// Guest-physical address space parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EptConfig {
    /// Guest-physical address width in bits.
    pub gpa_width: u32,
    /// Enable the accessed and dirty flags in the EPT pointer.
    pub accessed_dirty: bool,
}

impl Default for EptConfig {
    fn default() -> Self {
        Self {
            gpa_width: 48,
            accessed_dirty: false,
        }
    }
}

impl EptConfig {
    pub fn validate(&self) -> Result<(), VmError> {
        // A four-level walk translates at most 48 bits.
        if !(36..=48).contains(&self.gpa_width) {
            return Err(VmError::InvalidConfig(
                "guest-physical address width out of range",
            ));
        }
        Ok(())
    }
}
