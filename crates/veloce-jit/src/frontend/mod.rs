//! Guest instruction decoding and lowering to IR.
//!
//! Each frontend is a mask/value decode table over fetched instruction
//! words plus a translator that walks guest code from a compilation
//! location and builds one [`crate::ir::IrBlock`]. The compilation location
//! itself is packed here: the PC alone is not a valid key, the
//! execution-context fingerprint (instruction set, IT state, FP control
//! bits) is part of it, and two fingerprints never share a block.

pub mod a32;
pub mod a64;

use crate::ir::LocationDescriptor;

/// One decode-table row: `word & mask == value` selects `handler`.
pub(crate) struct DecodeRow<T> {
    pub mask: u32,
    pub value: u32,
    pub handler: T,
}

pub(crate) fn lookup<T: Copy>(table: &[DecodeRow<T>], word: u32) -> Option<T> {
    table
        .iter()
        .find(|row| word & row.mask == row.value)
        .map(|row| row.handler)
}

/// FPCR/FPSCR bits that participate in the compilation fingerprint:
/// RMode, FZ and DN.
pub fn fp_fingerprint(fpcr: u32) -> u64 {
    (fpcr as u64 >> 22) & 0xf
}

// A64 location: PC in bits 0..55 (guests with code above 2^56 alias, as in
// other translators keying on a packed descriptor), FP fingerprint in bits
// 56..59, and bit 63 set to keep the two instruction sets' keys disjoint.
const A64_PC_MASK: u64 = (1 << 56) - 1;
const A64_TAG: u64 = 1 << 63;

pub fn a64_location(pc: u64, fpcr: u32) -> LocationDescriptor {
    LocationDescriptor(A64_TAG | (pc & A64_PC_MASK) | fp_fingerprint(fpcr) << 56)
}

pub fn a64_location_pc(loc: LocationDescriptor) -> u64 {
    loc.0 & A64_PC_MASK
}

pub(crate) fn a64_location_fp(loc: LocationDescriptor) -> u64 {
    loc.0 >> 56 & 0xf
}

/// Rebuild an A64 key from a PC and an already-extracted fingerprint.
pub(crate) fn a64_location_raw(pc: u64, fp_key: u64) -> LocationDescriptor {
    LocationDescriptor(A64_TAG | (pc & A64_PC_MASK) | fp_key << 56)
}

// A32 location: PC in bits 0..31, Thumb bit 32, ITSTATE bits 33..40, FP
// fingerprint bits 41..44.
pub fn a32_location(pc: u32, thumb: bool, it_state: u8, fpscr: u32) -> LocationDescriptor {
    LocationDescriptor(
        pc as u64
            | (thumb as u64) << 32
            | (it_state as u64) << 33
            | fp_fingerprint(fpscr) << 41,
    )
}

pub fn a32_location_pc(loc: LocationDescriptor) -> u32 {
    loc.0 as u32
}

pub fn a32_location_thumb(loc: LocationDescriptor) -> bool {
    loc.0 >> 32 & 1 != 0
}

pub fn a32_location_it(loc: LocationDescriptor) -> u8 {
    (loc.0 >> 33) as u8
}

pub(crate) fn a32_location_fp(loc: LocationDescriptor) -> u64 {
    loc.0 >> 41 & 0xf
}

/// Rebuild an A32 key from parts and an already-extracted fingerprint.
pub(crate) fn a32_location_raw(
    pc: u32,
    thumb: bool,
    it_state: u8,
    fp_key: u64,
) -> LocationDescriptor {
    LocationDescriptor(
        pc as u64 | (thumb as u64) << 32 | (it_state as u64) << 33 | fp_key << 41,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a64_key_roundtrip_and_fingerprint_split() {
        let base = a64_location(0x1_0000, 0);
        assert_eq!(a64_location_pc(base), 0x1_0000);
        // Same PC, different rounding mode: different block.
        let rm = a64_location(0x1_0000, 1 << 22);
        assert_ne!(base, rm);
        assert_eq!(a64_location_pc(rm), 0x1_0000);
    }

    #[test]
    fn a32_key_separates_thumb_and_it() {
        let arm = a32_location(0x8000, false, 0, 0);
        let thumb = a32_location(0x8000, true, 0, 0);
        let thumb_it = a32_location(0x8000, true, 0xa8, 0);
        assert_ne!(arm, thumb);
        assert_ne!(thumb, thumb_it);
        assert_eq!(a32_location_pc(thumb_it), 0x8000);
        assert!(a32_location_thumb(thumb_it));
        assert_eq!(a32_location_it(thumb_it), 0xa8);
    }

    #[test]
    fn instruction_sets_never_share_keys() {
        assert_ne!(a64_location(0x8000, 0), a32_location(0x8000, false, 0, 0));
    }
}
