//! Bit-field model of an EPT paging-structure entry.
//!
//! Every entry of every level is a 64-bit word. Instead of one accessor type
//! per level, each named field is described once by a [`BitField`] (mask and
//! shift) and each level lists the fields it carries in a small static table
//! (see [`Level::fields`]). All accessors are pure: they take an entry word and
//! return either the decoded value or the updated word, touching nothing
//! outside of the field's mask.
//!
//! See Intel® 64 and IA-32 Architectures Software Developer’s Manual, 29.3.2
//! EPT Translation Mechanism, Table 29-1 to 29-6.

use super::Level;
use abyss::bits::{clear_bit, get_bits, is_bit_set, set_bit, set_bits};
use core::fmt;
use core::marker::PhantomData;
use num_enum::{FromPrimitive, IntoPrimitive};

/// A named bit-field of an entry word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitField {
    name: &'static str,
    mask: u64,
    shift: u32,
}

impl BitField {
    /// Describe the field `name` that lives under `mask`. The field value is
    /// the masked word shifted right by `shift`.
    pub const fn new(name: &'static str, mask: u64, shift: u32) -> Self {
        Self { name, mask, shift }
    }

    /// Name of the field.
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Mask of the field inside of the entry word.
    #[inline]
    pub const fn mask(&self) -> u64 {
        self.mask
    }

    /// Shift amount of the field.
    #[inline]
    pub const fn shift(&self) -> u32 {
        self.shift
    }

    /// Extract the field value from `entry`.
    #[inline(always)]
    pub const fn get(&self, entry: u64) -> u64 {
        get_bits(entry, self.mask) >> self.shift
    }

    /// Return `entry` with the field replaced by `value`.
    ///
    /// Bits of `value` that do not fit the field are dropped.
    #[inline(always)]
    pub const fn set(&self, entry: u64, value: u64) -> u64 {
        set_bits(entry, self.mask, value << self.shift)
    }
}

/// A single-bit field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flag(BitField);

impl Flag {
    /// Describe the flag `name` at `bit`.
    pub const fn new(name: &'static str, bit: u32) -> Self {
        Self(BitField::new(name, 1 << bit, bit))
    }

    /// Underlying field descriptor.
    #[inline]
    pub const fn field(&self) -> BitField {
        self.0
    }

    /// Bit position of the flag.
    #[inline]
    pub const fn bit(&self) -> u32 {
        self.0.shift
    }

    #[inline(always)]
    pub const fn is_enabled(&self, entry: u64) -> bool {
        is_bit_set(entry, self.bit())
    }

    #[inline(always)]
    pub const fn is_disabled(&self, entry: u64) -> bool {
        !self.is_enabled(entry)
    }

    #[inline(always)]
    pub const fn enable(&self, entry: u64) -> u64 {
        set_bit(entry, self.bit())
    }

    #[inline(always)]
    pub const fn disable(&self, entry: u64) -> u64 {
        clear_bit(entry, self.bit())
    }
}

/// Conversion between an enumerated field value and its raw bits.
pub trait FieldCodec: Copy {
    /// Decode raw (already shifted) bits. Unmapped patterns decode to the
    /// type's invalid member.
    fn decode(raw: u64) -> Self;
    /// Encode into raw (unshifted) bits.
    fn encode(self) -> u64;
    /// Whether this value may be written into an entry.
    fn is_valid(self) -> bool;
}

/// A field whose raw bits map to a closed set of named values.
pub struct EnumField<T> {
    field: BitField,
    _codec: PhantomData<fn() -> T>,
}

impl<T> Clone for EnumField<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for EnumField<T> {}

impl<T> PartialEq for EnumField<T> {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field
    }
}

impl<T> Eq for EnumField<T> {}

impl<T> fmt::Debug for EnumField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.field.fmt(f)
    }
}

impl<T> EnumField<T> {
    pub const fn new(field: BitField) -> Self {
        Self {
            field,
            _codec: PhantomData,
        }
    }

    /// Underlying field descriptor.
    #[inline]
    pub const fn field(&self) -> BitField {
        self.field
    }
}

impl<T: FieldCodec> EnumField<T> {
    /// Decode the field of `entry`.
    #[inline(always)]
    pub fn get(&self, entry: u64) -> T {
        T::decode(self.field.get(entry))
    }

    /// Return `entry` with the field replaced by `value`.
    ///
    /// `value` must not be the invalid member; that member only exists as a
    /// decode result.
    #[inline(always)]
    pub fn set(&self, entry: u64, value: T) -> u64 {
        debug_assert!(value.is_valid(), "encoding an invalid {}", self.field.name);
        self.field.set(entry, value.encode())
    }
}

/// Access policy encoded in the read, write and execute bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u64)]
pub enum AttrType {
    /// No access; every access exits.
    Trap = 0,
    ReadOnly = 1,
    ReadWrite = 3,
    ExecuteOnly = 4,
    ReadExecute = 5,
    /// Read, write and execute.
    PassThrough = 7,
    /// Any other bit pattern.
    #[num_enum(default)]
    Invalid = 0xff,
}

impl AttrType {
    /// Whether `self` grants every permission `other` grants.
    pub fn contains(self, other: AttrType) -> bool {
        let (this, other): (u64, u64) = (self.into(), other.into());
        other & !this & 0x7 == 0
    }
}

impl FieldCodec for AttrType {
    #[inline(always)]
    fn decode(raw: u64) -> Self {
        Self::from(raw)
    }

    #[inline(always)]
    fn encode(self) -> u64 {
        self.into()
    }

    #[inline(always)]
    fn is_valid(self) -> bool {
        self != Self::Invalid
    }
}

/// EPT memory type of the mapped page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u64)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
    /// Reserved encodings.
    #[num_enum(default)]
    Invalid = 0xff,
}

impl FieldCodec for MemoryType {
    #[inline(always)]
    fn decode(raw: u64) -> Self {
        Self::from(raw)
    }

    #[inline(always)]
    fn encode(self) -> u64 {
        self.into()
    }

    #[inline(always)]
    fn is_valid(self) -> bool {
        self != Self::Invalid
    }
}

/// Bit 0: reads allowed.
pub const READ_ACCESS: Flag = Flag::new("read_access", 0);
/// Bit 1: writes allowed.
pub const WRITE_ACCESS: Flag = Flag::new("write_access", 1);
/// Bit 2: instruction fetches allowed (supervisor fetches under mode-based
/// execute control).
pub const EXECUTE_ACCESS: Flag = Flag::new("execute_access", 2);
/// Bits 2:0 viewed as one access policy.
pub const ATTR_TYPE: EnumField<AttrType> =
    EnumField::new(BitField::new("attr_type", 0x0000_0000_0000_0007, 0));
/// Bits 5:3, leaf entries of PDPT, PD and PT only.
pub const MEMORY_TYPE: EnumField<MemoryType> =
    EnumField::new(BitField::new("memory_type", 0x0000_0000_0000_0038, 3));
/// Bit 6: ignore the guest PAT memory type.
pub const IGNORE_PAT: Flag = Flag::new("ignore_pat", 6);
/// Bit 7: the entry maps a large page instead of referencing a table.
pub const ENTRY_TYPE: Flag = Flag::new("entry_type", 7);
/// Bit 8: set by the processor when the entry was used for translation.
pub const ACCESSED_FLAG: Flag = Flag::new("accessed_flag", 8);
/// Bit 9: set by the processor on write.
pub const DIRTY: Flag = Flag::new("dirty", 9);
/// Bit 10: user-mode fetches allowed under mode-based execute control.
pub const EXECUTE_ACCESS_USER: Flag = Flag::new("execute_access_user", 10);
/// Bits 51:12: physical address of the next table or of the page. The value
/// is kept in place, so the shift is zero.
pub const PHYS_ADDR: BitField = BitField::new("phys_addr", 0x000F_FFFF_FFFF_F000, 0);
/// Bit 63: suppress #VE on violations through this entry.
pub const SUPPRESS_VE: Flag = Flag::new("suppress_ve", 63);

/// One entry of a per-level field table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryField {
    Flag(Flag),
    AttrType(EnumField<AttrType>),
    MemoryType(EnumField<MemoryType>),
    Address(BitField),
}

impl EntryField {
    /// Underlying field descriptor.
    pub const fn field(&self) -> BitField {
        match self {
            Self::Flag(f) => f.field(),
            Self::AttrType(f) => f.field(),
            Self::MemoryType(f) => f.field(),
            Self::Address(f) => *f,
        }
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        self.field().name()
    }

    #[inline]
    pub const fn mask(&self) -> u64 {
        self.field().mask()
    }

    fn write_value(&self, entry: u64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(flag) => write!(f, "{}", flag.is_enabled(entry) as u8),
            Self::AttrType(field) => write!(f, "{:?}", field.get(entry)),
            Self::MemoryType(field) => write!(f, "{:?}", field.get(entry)),
            Self::Address(field) => write!(f, "{:#x}", field.get(entry)),
        }
    }
}

/// Fields of a PML4 entry.
pub static PML4_FIELDS: [EntryField; 8] = [
    EntryField::Flag(READ_ACCESS),
    EntryField::Flag(WRITE_ACCESS),
    EntryField::Flag(EXECUTE_ACCESS),
    EntryField::AttrType(ATTR_TYPE),
    EntryField::Flag(ACCESSED_FLAG),
    EntryField::Flag(EXECUTE_ACCESS_USER),
    EntryField::Address(PHYS_ADDR),
    EntryField::Flag(SUPPRESS_VE),
];

/// Fields of a PDPT, PD or PT entry.
pub static LEAF_CAPABLE_FIELDS: [EntryField; 12] = [
    EntryField::Flag(READ_ACCESS),
    EntryField::Flag(WRITE_ACCESS),
    EntryField::Flag(EXECUTE_ACCESS),
    EntryField::AttrType(ATTR_TYPE),
    EntryField::MemoryType(MEMORY_TYPE),
    EntryField::Flag(IGNORE_PAT),
    EntryField::Flag(ENTRY_TYPE),
    EntryField::Flag(ACCESSED_FLAG),
    EntryField::Flag(DIRTY),
    EntryField::Flag(EXECUTE_ACCESS_USER),
    EntryField::Address(PHYS_ADDR),
    EntryField::Flag(SUPPRESS_VE),
];

impl Level {
    /// Field table of this level.
    pub fn fields(self) -> &'static [EntryField] {
        match self {
            Level::Pml4 => &PML4_FIELDS,
            Level::Pdpt | Level::Pd | Level::Pt => &LEAF_CAPABLE_FIELDS,
        }
    }

    /// Whether entries of this level carry `field`.
    pub fn has_field(self, field: &EntryField) -> bool {
        self.fields().iter().any(|f| f == field)
    }

    /// Boolean fields of this level.
    pub fn flags(self) -> impl Iterator<Item = Flag> {
        self.fields().iter().filter_map(|f| match f {
            EntryField::Flag(flag) => Some(*flag),
            _ => None,
        })
    }
}

/// Human readable rendering of an entry word through its level's field
/// table.
pub struct EntryDump {
    level: Level,
    entry: u64,
}

impl EntryDump {
    pub fn new(level: Level, entry: u64) -> Self {
        Self { level, entry }
    }
}

impl fmt::Display for EntryDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#018x})", self.level, self.entry)?;
        for field in self.level.fields() {
            write!(f, " {}=", field.name())?;
            field.write_value(self.entry, f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    const SAMPLES: [u64; 4] = [
        0,
        u64::MAX,
        0x8000_0012_3456_7abc,
        0x0000_000f_dead_b0b5,
    ];

    #[test]
    fn flag_round_trip_leaves_other_bits_alone() {
        for level in [Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt] {
            for flag in level.flags() {
                let outside = !flag.field().mask();
                for entry in SAMPLES {
                    let enabled = flag.enable(entry);
                    assert!(flag.is_enabled(enabled), "{}", flag.field().name());
                    assert_eq!(enabled & outside, entry & outside);

                    let disabled = flag.disable(entry);
                    assert!(flag.is_disabled(disabled), "{}", flag.field().name());
                    assert_eq!(disabled & outside, entry & outside);
                }
            }
        }
    }

    #[test]
    fn attr_type_matches_access_bits() {
        let cases = [
            (AttrType::Trap, [false, false, false]),
            (AttrType::ReadOnly, [true, false, false]),
            (AttrType::ReadWrite, [true, true, false]),
            (AttrType::ExecuteOnly, [false, false, true]),
            (AttrType::ReadExecute, [true, false, true]),
            (AttrType::PassThrough, [true, true, true]),
        ];
        for entry in SAMPLES {
            for (attr, [r, w, x]) in cases {
                let updated = ATTR_TYPE.set(entry, attr);
                assert_eq!(ATTR_TYPE.get(updated), attr);
                assert_eq!(READ_ACCESS.is_enabled(updated), r);
                assert_eq!(WRITE_ACCESS.is_enabled(updated), w);
                assert_eq!(EXECUTE_ACCESS.is_enabled(updated), x);
                assert_eq!(updated & !0x7, entry & !0x7);
            }
        }
    }

    #[test]
    fn unmapped_access_patterns_are_invalid() {
        // write-only and write+execute are not expressible policies.
        assert_eq!(ATTR_TYPE.get(0b010), AttrType::Invalid);
        assert_eq!(ATTR_TYPE.get(0b110), AttrType::Invalid);
        // Toggling individual bits is reflected by the composite view.
        let entry = WRITE_ACCESS.enable(READ_ACCESS.enable(0));
        assert_eq!(ATTR_TYPE.get(entry), AttrType::ReadWrite);
        assert_eq!(ATTR_TYPE.get(EXECUTE_ACCESS.enable(entry)), AttrType::PassThrough);
    }

    #[test]
    fn memory_type_round_trip() {
        for mtype in [
            MemoryType::Uncacheable,
            MemoryType::WriteCombining,
            MemoryType::WriteThrough,
            MemoryType::WriteProtected,
            MemoryType::WriteBack,
        ] {
            for entry in SAMPLES {
                let updated = MEMORY_TYPE.set(entry, mtype);
                assert_eq!(MEMORY_TYPE.get(updated), mtype);
                assert_eq!(updated & !0x38, entry & !0x38);
            }
        }
        for reserved in [2u64, 3, 7] {
            assert_eq!(MEMORY_TYPE.get(reserved << 3), MemoryType::Invalid);
        }
    }

    #[test]
    fn phys_addr_keeps_flags() {
        let entry = SUPPRESS_VE.enable(ATTR_TYPE.set(0, AttrType::ReadOnly));
        let updated = PHYS_ADDR.set(entry, 0x0000_0012_3456_7000);
        assert_eq!(PHYS_ADDR.get(updated), 0x0000_0012_3456_7000);
        assert!(SUPPRESS_VE.is_enabled(updated));
        assert_eq!(ATTR_TYPE.get(updated), AttrType::ReadOnly);
        // Low bits of the address are not part of the field.
        assert_eq!(PHYS_ADDR.get(PHYS_ADDR.set(0, 0x1fff)), 0x1000);
    }

    #[test]
    fn phys_addr_spans_52_bits() {
        let top = 0x000F_FFFF_FFFF_F000;
        assert_eq!(PHYS_ADDR.get(PHYS_ADDR.set(0, top)), top);
        assert_eq!(PHYS_ADDR.get(PHYS_ADDR.set(0, 1 << 48)), 1 << 48);
        // Bit 52 and up belong to other fields.
        let entry = PHYS_ADDR.set(0, u64::MAX);
        assert_eq!(entry, top);
        assert!(!SUPPRESS_VE.is_enabled(entry));
    }

    #[test]
    fn per_level_tables() {
        let memory_type = EntryField::MemoryType(MEMORY_TYPE);
        let dirty = EntryField::Flag(DIRTY);
        assert!(!Level::Pml4.has_field(&memory_type));
        assert!(!Level::Pml4.has_field(&dirty));
        assert!(!Level::Pml4.has_field(&EntryField::Flag(ENTRY_TYPE)));
        for level in [Level::Pdpt, Level::Pd, Level::Pt] {
            assert!(level.has_field(&memory_type));
            assert!(level.has_field(&dirty));
        }
        // No two fields of a level share a flag bit.
        for level in [Level::Pml4, Level::Pt] {
            let mut seen = 0u64;
            for flag in level.flags() {
                assert_eq!(seen & flag.field().mask(), 0);
                seen |= flag.field().mask();
            }
        }
    }

    #[test]
    fn attr_type_containment() {
        assert!(AttrType::PassThrough.contains(AttrType::ReadWrite));
        assert!(AttrType::ReadWrite.contains(AttrType::ReadOnly));
        assert!(!AttrType::ReadOnly.contains(AttrType::ReadWrite));
        assert!(!AttrType::ReadExecute.contains(AttrType::ReadWrite));
        assert!(AttrType::ReadOnly.contains(AttrType::Trap));
    }

    #[test]
    fn dump_lists_level_fields() {
        let entry = PHYS_ADDR.set(ATTR_TYPE.set(0, AttrType::PassThrough), 0x5000);
        let text = EntryDump::new(Level::Pml4, entry).to_string();
        assert!(text.contains("attr_type=PassThrough"));
        assert!(text.contains("phys_addr=0x5000"));
        assert!(!text.contains("memory_type"));
        let text = EntryDump::new(Level::Pt, entry).to_string();
        assert!(text.contains("memory_type=Uncacheable"));
    }
}
