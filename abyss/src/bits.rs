//! Bit-level accessors over a 64-bit word.
//!
//! Every table-entry field and exit-reason decoder in the hypervisor is built
//! on top of these helpers. They sit on the hottest paths (every VM exit and
//! every page-table edit), so none of them validate their inputs: a bit index
//! greater than 63 or a mask that does not describe the intended field is a
//! caller bug. Debug builds catch the former with an assertion.

/// Returns true if `bit` of `value` is set.
#[inline(always)]
pub const fn is_bit_set(value: u64, bit: u32) -> bool {
    debug_assert!(bit < u64::BITS);
    value & (1u64 << bit) != 0
}

/// Returns true if `bit` of `value` is cleared.
#[inline(always)]
pub const fn is_bit_cleared(value: u64, bit: u32) -> bool {
    !is_bit_set(value, bit)
}

/// Returns `value` with `bit` set.
#[inline(always)]
pub const fn set_bit(value: u64, bit: u32) -> u64 {
    debug_assert!(bit < u64::BITS);
    value | (1u64 << bit)
}

/// Returns `value` with `bit` cleared.
#[inline(always)]
pub const fn clear_bit(value: u64, bit: u32) -> u64 {
    debug_assert!(bit < u64::BITS);
    value & !(1u64 << bit)
}

/// Returns `value & mask`.
///
/// The result is not shifted; the caller shifts it down when it needs the
/// field's numeric value.
#[inline(always)]
pub const fn get_bits(value: u64, mask: u64) -> u64 {
    value & mask
}

/// Returns `value` with the bits under `mask` replaced by `bits`.
///
/// Bits of `bits` outside of `mask` are discarded, so the rest of `value` is
/// never disturbed.
#[inline(always)]
pub const fn set_bits(value: u64, mask: u64, bits: u64) -> u64 {
    (value & !mask) | (bits & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_bit_primitives() {
        assert!(is_bit_set(0b100, 2));
        assert!(!is_bit_set(0b100, 1));
        assert!(is_bit_cleared(0b100, 0));
        assert_eq!(set_bit(0, 63), 0x8000_0000_0000_0000);
        assert_eq!(clear_bit(u64::MAX, 0), u64::MAX - 1);
        assert_eq!(set_bit(0b1, 0), 0b1);
        assert_eq!(clear_bit(0b10, 0), 0b10);
    }

    #[test]
    fn masked_access_keeps_other_bits() {
        let value = 0xdead_beef_0000_0fffu64;
        assert_eq!(get_bits(value, 0x38), 0x38);
        let updated = set_bits(value, 0x38, 0x30);
        assert_eq!(updated & !0x38, value & !0x38);
        assert_eq!(get_bits(updated, 0x38), 0x30);
        // Bits outside the mask are dropped.
        assert_eq!(set_bits(0, 0xf0, 0xfff), 0xf0);
    }
}
