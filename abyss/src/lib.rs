//! The abyss of the hypervisor that operates hardwares.
//!
//! This crate contains the architecture primitives the hypervisor core is
//! built on: bit-field accessors, physical and virtual addresses, descriptor
//! tables, the task-state segment, interrupt gates and model-specific
//! registers. Nothing in here knows about virtual machines.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addressing;
pub mod bits;
pub mod mm;
pub mod x86_64;
