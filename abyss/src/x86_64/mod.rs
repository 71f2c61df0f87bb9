//! x86_64 specific

pub mod interrupt;
pub mod msr;
pub mod segmentation;
pub mod table;
pub mod tss;

/// Privilege Levels.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrivilegeLevel {
    Ring0 = 0,
    Ring1 = 1,
    Ring2 = 2,
    Ring3 = 3,
}
