//! Task-state segment

use super::segmentation::{SegmentAccess64, SegmentDescriptor64};
use super::PrivilegeLevel;

/// 64bit task state segment.
///
/// See Intel (R) 64 and IA-32 Architectures Software Developer's Manual, Volume
/// 3A: System Programming Guide, Part 1 Figure 7-11.
#[repr(C, packed)]
pub struct TaskStateSegment {
    _res0: u32,
    pub rsp0: u64,
    pub rsp1: u64,
    pub rsp2: u64,
    _res1: u64,
    pub ist1: u64,
    pub ist2: u64,
    pub ist3: u64,
    pub ist4: u64,
    pub ist5: u64,
    pub ist6: u64,
    pub ist7: u64,
    _res2: u64,
    _res3: u16,
    pub io_map_base: u16,
}

impl TaskStateSegment {
    /// Create a empty TaskStateSegment.
    ///
    /// The I/O permission bitmap is placed past the segment limit, so every
    /// port access from ring 3 faults.
    pub const fn empty() -> Self {
        Self {
            _res0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _res1: 0,
            ist1: 0,
            ist2: 0,
            ist3: 0,
            ist4: 0,
            ist5: 0,
            ist6: 0,
            ist7: 0,
            _res2: 0,
            _res3: 0,
            io_map_base: core::mem::size_of::<Self>() as u16,
        }
    }

    /// Set the interrupt stack table slot `index` (1 to 7) to `top`.
    ///
    /// Returns false if `index` does not name an IST slot.
    pub fn set_ist(&mut self, index: u8, top: u64) -> bool {
        match index {
            1 => self.ist1 = top,
            2 => self.ist2 = top,
            3 => self.ist3 = top,
            4 => self.ist4 = top,
            5 => self.ist5 = top,
            6 => self.ist6 = top,
            7 => self.ist7 = top,
            _ => return false,
        }
        true
    }

    /// Read the interrupt stack table slot `index` (1 to 7).
    pub fn ist(&self, index: u8) -> Option<u64> {
        Some(match index {
            1 => self.ist1,
            2 => self.ist2,
            3 => self.ist3,
            4 => self.ist4,
            5 => self.ist5,
            6 => self.ist6,
            7 => self.ist7,
            _ => return None,
        })
    }

    /// Build the GDT descriptor that points to this segment.
    pub fn segment_descriptor(&self) -> SegmentDescriptor64 {
        SegmentDescriptor64::new(
            self as *const _ as usize as u64,
            core::mem::size_of::<Self>() as u64 - 1,
            SegmentAccess64::P | SegmentAccess64::T64A,
            PrivilegeLevel::Ring0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn layout_matches_hardware() {
        assert_eq!(size_of::<TaskStateSegment>(), 104);
        assert_eq!(offset_of!(TaskStateSegment, rsp0), 0x04);
        assert_eq!(offset_of!(TaskStateSegment, ist1), 0x24);
        assert_eq!(offset_of!(TaskStateSegment, ist7), 0x54);
        assert_eq!(offset_of!(TaskStateSegment, io_map_base), 0x66);
    }

    #[test]
    fn ist_slots() {
        let mut tss = TaskStateSegment::empty();
        assert!(tss.set_ist(1, 0xdead_0000));
        assert!(!tss.set_ist(0, 1));
        assert!(!tss.set_ist(8, 1));
        assert_eq!(tss.ist(1), Some(0xdead_0000));
        assert_eq!(tss.ist(2), Some(0));
        assert_eq!(tss.ist(8), None);
    }

    #[test]
    fn descriptor_points_to_segment() {
        let tss = TaskStateSegment::empty();
        let desc = tss.segment_descriptor();
        assert_eq!(desc.base(), &tss as *const _ as u64);
        assert_eq!(desc.limit(), 103);
        assert_eq!({ tss.io_map_base }, 104);
    }
}
