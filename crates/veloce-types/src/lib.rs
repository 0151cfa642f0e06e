//! Shared leaf types for the veloce dynamic binary translator.
//!
//! Everything in this crate is plain data with `const fn` accessors so the
//! frontends, optimizer, backend and interpreter can all agree on widths,
//! condition codes and flag sets without depending on each other.

/// Operation width for IR values and ALU operations.
///
/// IR values are always held as `u64`; `W8`/`W16`/`W32` operations treat the
/// low bits as significant and produce zero-extended results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    pub const fn bytes(self) -> u64 {
        self.bits() as u64 / 8
    }

    /// All-significant-bits mask for this width.
    pub const fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xff,
            Width::W16 => 0xffff,
            Width::W32 => 0xffff_ffff,
            Width::W64 => u64::MAX,
        }
    }

    /// Zero-extend `value` from this width.
    pub const fn truncate(self, value: u64) -> u64 {
        value & self.mask()
    }

    /// Sign-extend the low `bits()` of `value` to 64 bits.
    pub const fn sign_extend(self, value: u64) -> u64 {
        let shift = 64 - self.bits();
        (((value << shift) as i64) >> shift) as u64
    }

    /// Sign bit of `value` at this width.
    pub const fn sign_bit(self, value: u64) -> bool {
        value >> (self.bits() - 1) & 1 != 0
    }
}

/// Memory access size. Separate from [`Width`] because exclusive pair
/// accesses are 16 bytes while IR values stay 64-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemSize {
    U8,
    U16,
    U32,
    U64,
    U128,
}

impl MemSize {
    pub const fn bytes(self) -> u64 {
        match self {
            MemSize::U8 => 1,
            MemSize::U16 => 2,
            MemSize::U32 => 4,
            MemSize::U64 => 8,
            MemSize::U128 => 16,
        }
    }

    /// Widest [`Width`] that covers one element of this access (pairs are
    /// handled as two 64-bit halves).
    pub const fn element_width(self) -> Width {
        match self {
            MemSize::U8 => Width::W8,
            MemSize::U16 => Width::W16,
            MemSize::U32 => Width::W32,
            MemSize::U64 | MemSize::U128 => Width::W64,
        }
    }
}

/// A single PSTATE condition flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    N,
    Z,
    C,
    V,
}

impl Flag {
    /// Bit position inside the packed NZCV word (PSTATE layout).
    pub const fn bit(self) -> u32 {
        match self {
            Flag::N => 31,
            Flag::Z => 30,
            Flag::C => 29,
            Flag::V => 28,
        }
    }

    pub const ALL: [Flag; 4] = [Flag::N, Flag::Z, Flag::C, Flag::V];
}

/// Set of NZCV flags, stored as a 4-bit mask.
///
/// Used both as "which flags does this instruction write" metadata and as the
/// liveness lattice for the flag-elision pass.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagSet(u8);

impl FlagSet {
    pub const EMPTY: FlagSet = FlagSet(0);
    pub const N: FlagSet = FlagSet(0b1000);
    pub const Z: FlagSet = FlagSet(0b0100);
    pub const C: FlagSet = FlagSet(0b0010);
    pub const V: FlagSet = FlagSet(0b0001);
    /// All four flags.
    pub const NZCV: FlagSet = FlagSet(0b1111);
    /// N and Z, the pair written by flag-setting logical operations.
    pub const NZ: FlagSet = FlagSet(0b1100);

    pub const fn from_flag(flag: Flag) -> FlagSet {
        match flag {
            Flag::N => FlagSet::N,
            Flag::Z => FlagSet::Z,
            Flag::C => FlagSet::C,
            Flag::V => FlagSet::V,
        }
    }

    pub const fn union(self, other: FlagSet) -> FlagSet {
        FlagSet(self.0 | other.0)
    }

    pub const fn intersect(self, other: FlagSet) -> FlagSet {
        FlagSet(self.0 & other.0)
    }

    pub const fn without(self, other: FlagSet) -> FlagSet {
        FlagSet(self.0 & !other.0)
    }

    pub const fn contains(self, other: FlagSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: FlagSet) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Flag> {
        Flag::ALL
            .into_iter()
            .filter(move |f| self.contains(FlagSet::from_flag(*f)))
    }

    /// Mask over the packed NZCV word covering exactly these flags.
    pub fn nzcv_mask(self) -> u32 {
        self.iter().fold(0, |m, f| m | 1 << f.bit())
    }
}

impl core::fmt::Debug for FlagSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        for flag in self.iter() {
            write!(f, "{flag:?}")?;
        }
        Ok(())
    }
}

/// ARM condition code, shared between A32 and A64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
    /// Encoding 0b1111. Behaves as always on A64; A32 reserves it for
    /// unconditional-space instructions, which the frontend handles before
    /// condition grouping.
    Nv,
}

impl Cond {
    pub const fn from_bits(bits: u8) -> Cond {
        match bits & 0xf {
            0b0000 => Cond::Eq,
            0b0001 => Cond::Ne,
            0b0010 => Cond::Cs,
            0b0011 => Cond::Cc,
            0b0100 => Cond::Mi,
            0b0101 => Cond::Pl,
            0b0110 => Cond::Vs,
            0b0111 => Cond::Vc,
            0b1000 => Cond::Hi,
            0b1001 => Cond::Ls,
            0b1010 => Cond::Ge,
            0b1011 => Cond::Lt,
            0b1100 => Cond::Gt,
            0b1101 => Cond::Le,
            0b1110 => Cond::Al,
            _ => Cond::Nv,
        }
    }

    pub const fn bits(self) -> u8 {
        match self {
            Cond::Eq => 0b0000,
            Cond::Ne => 0b0001,
            Cond::Cs => 0b0010,
            Cond::Cc => 0b0011,
            Cond::Mi => 0b0100,
            Cond::Pl => 0b0101,
            Cond::Vs => 0b0110,
            Cond::Vc => 0b0111,
            Cond::Hi => 0b1000,
            Cond::Ls => 0b1001,
            Cond::Ge => 0b1010,
            Cond::Lt => 0b1011,
            Cond::Gt => 0b1100,
            Cond::Le => 0b1101,
            Cond::Al => 0b1110,
            Cond::Nv => 0b1111,
        }
    }

    pub const fn invert(self) -> Cond {
        Cond::from_bits(self.bits() ^ 1)
    }

    pub const fn is_unconditional(self) -> bool {
        matches!(self, Cond::Al | Cond::Nv)
    }

    /// Evaluate against concrete flag values.
    pub const fn holds(self, n: bool, z: bool, c: bool, v: bool) -> bool {
        match self {
            Cond::Eq => z,
            Cond::Ne => !z,
            Cond::Cs => c,
            Cond::Cc => !c,
            Cond::Mi => n,
            Cond::Pl => !n,
            Cond::Vs => v,
            Cond::Vc => !v,
            Cond::Hi => c && !z,
            Cond::Ls => !c || z,
            Cond::Ge => n == v,
            Cond::Lt => n != v,
            Cond::Gt => !z && n == v,
            Cond::Le => z || n != v,
            Cond::Al | Cond::Nv => true,
        }
    }

    /// Evaluate against a packed NZCV word (flags at bits 31..28).
    pub const fn holds_nzcv(self, nzcv: u32) -> bool {
        self.holds(
            nzcv >> 31 & 1 != 0,
            nzcv >> 30 & 1 != 0,
            nzcv >> 29 & 1 != 0,
            nzcv >> 28 & 1 != 0,
        )
    }

    /// Flags this condition reads.
    pub const fn flags_read(self) -> FlagSet {
        match self {
            Cond::Eq | Cond::Ne => FlagSet::Z,
            Cond::Cs | Cond::Cc => FlagSet::C,
            Cond::Mi | Cond::Pl => FlagSet::N,
            Cond::Vs | Cond::Vc => FlagSet::V,
            Cond::Hi | Cond::Ls => FlagSet::C.union(FlagSet::Z),
            Cond::Ge | Cond::Lt => FlagSet::N.union(FlagSet::V),
            Cond::Gt | Cond::Le => FlagSet::N.union(FlagSet::Z).union(FlagSet::V),
            Cond::Al | Cond::Nv => FlagSet::EMPTY,
        }
    }
}

/// Barrel/variable shift kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftType {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftType {
    pub const fn from_bits(bits: u8) -> ShiftType {
        match bits & 0b11 {
            0b00 => ShiftType::Lsl,
            0b01 => ShiftType::Lsr,
            0b10 => ShiftType::Asr,
            _ => ShiftType::Ror,
        }
    }
}

/// Floating-point rounding mode, decoded from FPCR/FPSCR RMode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundingMode {
    /// Round to nearest, ties to even.
    Nearest,
    TowardsPlusInfinity,
    TowardsMinusInfinity,
    TowardsZero,
}

impl RoundingMode {
    pub const fn from_bits(bits: u32) -> RoundingMode {
        match bits & 0b11 {
            0b00 => RoundingMode::Nearest,
            0b01 => RoundingMode::TowardsPlusInfinity,
            0b10 => RoundingMode::TowardsMinusInfinity,
            _ => RoundingMode::TowardsZero,
        }
    }
}
