//! Scalar evaluation of IR operations.
//!
//! One implementation of the arithmetic shared by constant folding and the
//! debug interpreter, so the two can never disagree with each other. The
//! native emitter is checked against this by the differential tests.

use veloce_types::{ShiftType, Width};

/// `lhs + rhs + carry` at `width`. Returns the zero-extended result and the
/// packed NZCV word for it. Subtraction is `lhs + !rhs + 1`, which makes C
/// the architectural not-borrow.
pub fn add_with_carry(width: Width, lhs: u64, rhs: u64, carry: u64) -> (u64, u32) {
    let a = width.truncate(lhs);
    let b = width.truncate(rhs);
    let wide = a as u128 + b as u128 + (carry & 1) as u128;
    let result = width.truncate(wide as u64);
    let n = width.sign_bit(result);
    let z = result == 0;
    let c = wide >> width.bits() != 0;
    let v = width.sign_bit(a) == width.sign_bit(b) && width.sign_bit(a) != n;
    (result, pack_nzcv(n, z, c, v))
}

pub const fn pack_nzcv(n: bool, z: bool, c: bool, v: bool) -> u32 {
    (n as u32) << 31 | (z as u32) << 30 | (c as u32) << 29 | (v as u32) << 28
}

/// N and Z (packed) for a result value.
pub fn nz_flags(width: Width, value: u64) -> u32 {
    let value = width.truncate(value);
    pack_nzcv(width.sign_bit(value), value == 0, false, false)
}

/// Shift with the amount taken modulo the operation width, matching LSLV
/// and friends.
pub fn shift(kind: ShiftType, width: Width, value: u64, amount: u64) -> u64 {
    let value = width.truncate(value);
    let amount = amount as u32 % width.bits();
    let result = match kind {
        ShiftType::Lsl => value << amount,
        ShiftType::Lsr => value >> amount,
        ShiftType::Asr => (width.sign_extend(value) as i64 >> amount) as u64,
        ShiftType::Ror => {
            if amount == 0 {
                value
            } else {
                value >> amount | value << (width.bits() - amount)
            }
        }
    };
    width.truncate(result)
}

/// Byte-reverse the whole value at `width`.
pub fn rev(width: Width, value: u64) -> u64 {
    width.truncate(value).swap_bytes() >> (64 - width.bits())
}

/// Byte-reverse each 16-bit lane.
pub fn rev16(width: Width, value: u64) -> u64 {
    let value = width.truncate(value);
    const LOW: u64 = 0x00ff_00ff_00ff_00ff;
    width.truncate((value & LOW) << 8 | (value >> 8) & LOW)
}

/// Byte-reverse each 32-bit lane of a 64-bit value.
pub fn rev32(value: u64) -> u64 {
    (value as u32).swap_bytes() as u64 | (((value >> 32) as u32).swap_bytes() as u64) << 32
}

/// Reverse the bits of the `width`-sized value.
pub fn rbit(width: Width, value: u64) -> u64 {
    width.truncate(value).reverse_bits() >> (64 - width.bits())
}

/// Leading zeros; an all-zero input yields `width.bits()`.
pub fn clz(width: Width, value: u64) -> u64 {
    let value = width.truncate(value);
    if value == 0 {
        width.bits() as u64
    } else {
        (value.leading_zeros() - (64 - width.bits())) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_with_carry_flags() {
        let (r, nzcv) = add_with_carry(Width::W64, 1, 2, 0);
        assert_eq!(r, 3);
        assert_eq!(nzcv, 0);

        // 0 - 1: borrow, negative.
        let (r, nzcv) = add_with_carry(Width::W32, 0, !1u64, 1);
        assert_eq!(r, 0xffff_ffff);
        assert_eq!(nzcv, pack_nzcv(true, false, false, false));

        // x - x: zero, carry (no borrow).
        let (r, nzcv) = add_with_carry(Width::W64, 5, !5u64, 1);
        assert_eq!(r, 0);
        assert_eq!(nzcv, pack_nzcv(false, true, true, false));

        // Signed overflow at W32.
        let (_, nzcv) = add_with_carry(Width::W32, 0x7fff_ffff, 1, 0);
        assert_eq!(nzcv, pack_nzcv(true, false, false, true));
    }

    #[test]
    fn shifts_mask_their_amount() {
        assert_eq!(shift(ShiftType::Lsl, Width::W32, 1, 33), 2);
        assert_eq!(shift(ShiftType::Lsr, Width::W64, 0x8000_0000_0000_0000, 63), 1);
        assert_eq!(
            shift(ShiftType::Asr, Width::W32, 0x8000_0000, 4),
            0xf800_0000
        );
        assert_eq!(shift(ShiftType::Ror, Width::W32, 0x1, 4), 0x1000_0000);
        assert_eq!(shift(ShiftType::Ror, Width::W64, 0xabcd, 0), 0xabcd);
    }

    #[test]
    fn byte_and_bit_reversal() {
        assert_eq!(rev(Width::W64, 0xaabb_ccdd_eeff_1100), 0x0011_ffee_ddcc_bbaa);
        assert_eq!(rev(Width::W32, 0xaabb_ccdd), 0xddcc_bbaa);
        assert_eq!(rev16(Width::W32, 0xaabb_ccdd), 0xbbaa_ddcc);
        assert_eq!(rev16(Width::W64, 0xaabb_ccdd_eeff_1100), 0xbbaa_ddcc_ffee_0011);
        assert_eq!(rev32(0xaabb_ccdd_eeff_1100), 0xddcc_bbaa_0011_ffee);
        assert_eq!(rbit(Width::W32, 0x1), 0x8000_0000);
        assert_eq!(rbit(Width::W64, 0x3), 0xc000_0000_0000_0000);
    }

    #[test]
    fn clz_counts() {
        assert_eq!(clz(Width::W32, 0), 32);
        assert_eq!(clz(Width::W64, 0), 64);
        assert_eq!(clz(Width::W32, 1), 31);
        assert_eq!(clz(Width::W64, 0x0000_8000_0000_0000), 16);
    }
}
