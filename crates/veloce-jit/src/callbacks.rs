//! Host-facing callback traits.
//!
//! The engine owns no guest memory and no platform knowledge: every byte of
//! guest data, every system register and every exception goes through these
//! traits. Implementations are free to back them with flat buffers, page
//! tables or trap-and-emulate devices.

use thiserror::Error;
use veloce_types::RoundingMode;

/// Synchronous data-access failure reported by a [`Memory`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest memory fault at {addr:#x} ({bytes}-byte access, write={write})")]
pub struct MemoryFault {
    pub addr: u64,
    pub write: bool,
    pub bytes: u8,
}

pub type MemResult<T> = Result<T, MemoryFault>;

/// Guest memory access interface.
///
/// Data accesses are byte-addressed with guest endianness already applied
/// (values are plain integers). Code fetch is separate so hosts can refuse
/// execution from device memory without failing data reads.
pub trait Memory {
    /// Fetch a 32-bit instruction word. `None` means the location is not
    /// executable; translation stops and the block ends in an exception.
    fn read_code32(&mut self, addr: u64) -> Option<u32>;

    /// Fetch a 16-bit Thumb halfword. The default picks the halfword out of
    /// the containing aligned word, which is correct for RAM-backed hosts.
    fn read_code16(&mut self, addr: u64) -> Option<u16> {
        let word = self.read_code32(addr & !3)?;
        Some(if addr & 2 == 0 {
            word as u16
        } else {
            (word >> 16) as u16
        })
    }

    fn read8(&mut self, addr: u64) -> MemResult<u8>;
    fn read16(&mut self, addr: u64) -> MemResult<u16>;
    fn read32(&mut self, addr: u64) -> MemResult<u32>;
    fn read64(&mut self, addr: u64) -> MemResult<u64>;
    fn read128(&mut self, addr: u64) -> MemResult<u128>;

    fn write8(&mut self, addr: u64, value: u8) -> MemResult<()>;
    fn write16(&mut self, addr: u64, value: u16) -> MemResult<()>;
    fn write32(&mut self, addr: u64, value: u32) -> MemResult<()>;
    fn write64(&mut self, addr: u64, value: u64) -> MemResult<()>;
    fn write128(&mut self, addr: u64, value: u128) -> MemResult<()>;
}

/// Architectural exception delivered to [`SystemHandler::exception_raised`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// Undecodable or unallocated encoding.
    UndefinedInstruction { opcode: u32 },
    /// BRK / BKPT.
    Breakpoint { imm: u32 },
    /// A data access faulted; carries the fault the memory callback
    /// returned.
    DataAbort(MemoryFault),
    /// Code fetch at this location was refused.
    InstructionAbort,
    /// WFI / WFE hint reached.
    WaitForInterrupt,
}

/// What the host wants done after an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionAction {
    /// Continue executing at `pc` (e.g. a vectored handler, or the next
    /// instruction if the host emulated the faulting access itself).
    Resume { pc: u64 },
    /// Stop the current run; [`crate::RunExit::Halted`] is returned.
    Halt,
}

/// System-level guest events: exceptions, SVC and system registers.
pub trait SystemHandler {
    fn exception_raised(&mut self, pc: u64, exception: Exception) -> ExceptionAction;

    /// SVC executed; called between the SVC and its successor block.
    fn call_supervisor(&mut self, swi: u32);

    /// MRS from a register the engine does not model internally. `sysreg`
    /// packs the encoding as `op0:op1:CRn:CRm:op2` (A64) or the coprocessor
    /// transfer fields (A32).
    fn system_register_read(&mut self, sysreg: u32) -> u64 {
        let _ = sysreg;
        0
    }

    fn system_register_write(&mut self, sysreg: u32, value: u64) {
        let _ = (sysreg, value);
    }
}

bitflags::bitflags! {
    /// Cumulative FPSR exception bits produced by an FP operation, in the
    /// architectural bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FpFlags: u32 {
        const INVALID_OP   = 1 << 0;
        const DIV_BY_ZERO  = 1 << 1;
        const OVERFLOW     = 1 << 2;
        const UNDERFLOW    = 1 << 3;
        const INEXACT      = 1 << 4;
        const INPUT_DENORM = 1 << 7;
    }
}

/// Scalar floating-point arithmetic.
///
/// Operations are pure: inputs and results are raw bit patterns, the
/// rounding mode and flush-to-zero come from the decoded FPCR, and sticky
/// flags are returned rather than stored.
pub trait FpOps {
    fn add32(&self, a: u32, b: u32, mode: RoundingMode, ftz: bool) -> (u32, FpFlags);
    fn add64(&self, a: u64, b: u64, mode: RoundingMode, ftz: bool) -> (u64, FpFlags);
    fn sub32(&self, a: u32, b: u32, mode: RoundingMode, ftz: bool) -> (u32, FpFlags);
    fn sub64(&self, a: u64, b: u64, mode: RoundingMode, ftz: bool) -> (u64, FpFlags);
    fn mul32(&self, a: u32, b: u32, mode: RoundingMode, ftz: bool) -> (u32, FpFlags);
    fn mul64(&self, a: u64, b: u64, mode: RoundingMode, ftz: bool) -> (u64, FpFlags);
}

/// [`FpOps`] backed by host arithmetic.
///
/// The host FPU runs in round-to-nearest; hosts that need bit-exact
/// directed rounding supply their own [`FpOps`]. Flush-to-zero and default
/// NaN are applied in software so FPCR.FZ/DN behave architecturally.
pub struct HostFpOps;

fn host_op32(a: u32, b: u32, ftz: bool, op: impl Fn(f32, f32) -> f32) -> (u32, FpFlags) {
    let mut flags = FpFlags::empty();
    let (a, b) = if ftz {
        (flush32(a, &mut flags), flush32(b, &mut flags))
    } else {
        (a, b)
    };
    let (fa, fb) = (f32::from_bits(a), f32::from_bits(b));
    if is_signaling32(a) || is_signaling32(b) {
        flags |= FpFlags::INVALID_OP;
    }
    if fa.is_nan() || fb.is_nan() {
        return (f32::NAN.to_bits(), flags);
    }
    let result = op(fa, fb);
    if result.is_nan() {
        // inf - inf, 0 * inf and friends.
        flags |= FpFlags::INVALID_OP;
        return (f32::NAN.to_bits(), flags);
    }
    if result.is_infinite() {
        flags |= FpFlags::OVERFLOW | FpFlags::INEXACT;
    }
    if ftz && result.is_subnormal() {
        flags |= FpFlags::UNDERFLOW;
        return (result.to_bits() & 0x8000_0000, flags);
    }
    (result.to_bits(), flags)
}

fn host_op64(a: u64, b: u64, ftz: bool, op: impl Fn(f64, f64) -> f64) -> (u64, FpFlags) {
    let mut flags = FpFlags::empty();
    let (a, b) = if ftz {
        (flush64(a, &mut flags), flush64(b, &mut flags))
    } else {
        (a, b)
    };
    let (fa, fb) = (f64::from_bits(a), f64::from_bits(b));
    if is_signaling64(a) || is_signaling64(b) {
        flags |= FpFlags::INVALID_OP;
    }
    if fa.is_nan() || fb.is_nan() {
        return (f64::NAN.to_bits(), flags);
    }
    let result = op(fa, fb);
    if result.is_nan() {
        flags |= FpFlags::INVALID_OP;
        return (f64::NAN.to_bits(), flags);
    }
    if result.is_infinite() {
        flags |= FpFlags::OVERFLOW | FpFlags::INEXACT;
    }
    if ftz && result.is_subnormal() {
        flags |= FpFlags::UNDERFLOW;
        return (result.to_bits() & 0x8000_0000_0000_0000, flags);
    }
    (result.to_bits(), flags)
}

fn flush32(bits: u32, flags: &mut FpFlags) -> u32 {
    if f32::from_bits(bits).is_subnormal() {
        *flags |= FpFlags::INPUT_DENORM;
        bits & 0x8000_0000
    } else {
        bits
    }
}

fn flush64(bits: u64, flags: &mut FpFlags) -> u64 {
    if f64::from_bits(bits).is_subnormal() {
        *flags |= FpFlags::INPUT_DENORM;
        bits & 0x8000_0000_0000_0000
    } else {
        bits
    }
}

fn is_signaling32(bits: u32) -> bool {
    f32::from_bits(bits).is_nan() && bits & 0x0040_0000 == 0
}

fn is_signaling64(bits: u64) -> bool {
    f64::from_bits(bits).is_nan() && bits & 0x0008_0000_0000_0000 == 0
}

impl FpOps for HostFpOps {
    fn add32(&self, a: u32, b: u32, _mode: RoundingMode, ftz: bool) -> (u32, FpFlags) {
        host_op32(a, b, ftz, |x, y| x + y)
    }
    fn add64(&self, a: u64, b: u64, _mode: RoundingMode, ftz: bool) -> (u64, FpFlags) {
        host_op64(a, b, ftz, |x, y| x + y)
    }
    fn sub32(&self, a: u32, b: u32, _mode: RoundingMode, ftz: bool) -> (u32, FpFlags) {
        host_op32(a, b, ftz, |x, y| x - y)
    }
    fn sub64(&self, a: u64, b: u64, _mode: RoundingMode, ftz: bool) -> (u64, FpFlags) {
        host_op64(a, b, ftz, |x, y| x - y)
    }
    fn mul32(&self, a: u32, b: u32, _mode: RoundingMode, ftz: bool) -> (u32, FpFlags) {
        host_op32(a, b, ftz, |x, y| x * y)
    }
    fn mul64(&self, a: u64, b: u64, _mode: RoundingMode, ftz: bool) -> (u64, FpFlags) {
        host_op64(a, b, ftz, |x, y| x * y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_fp_basic_arithmetic() {
        let fp = HostFpOps;
        let (r, flags) =
            fp.add64(2.5f64.to_bits(), 0.25f64.to_bits(), RoundingMode::Nearest, false);
        assert_eq!(f64::from_bits(r), 2.75);
        assert_eq!(flags, FpFlags::empty());
    }

    #[test]
    fn host_fp_flush_to_zero() {
        let fp = HostFpOps;
        let denorm = 1u32; // smallest positive f32 subnormal
        let (r, flags) = fp.add32(denorm, denorm, RoundingMode::Nearest, true);
        assert_eq!(r, 0);
        assert!(flags.contains(FpFlags::INPUT_DENORM));
    }

    #[test]
    fn host_fp_nan_propagation() {
        let fp = HostFpOps;
        let (r, flags) = fp.mul64(
            f64::INFINITY.to_bits(),
            0f64.to_bits(),
            RoundingMode::Nearest,
            false,
        );
        assert!(f64::from_bits(r).is_nan());
        assert!(flags.contains(FpFlags::INVALID_OP));
    }

    #[test]
    fn code16_default_picks_halfword() {
        struct Words;
        impl Memory for Words {
            fn read_code32(&mut self, addr: u64) -> Option<u32> {
                Some(if addr == 0 { 0xbbbb_aaaa } else { 0xdddd_cccc })
            }
            fn read8(&mut self, _: u64) -> MemResult<u8> { unreachable!() }
            fn read16(&mut self, _: u64) -> MemResult<u16> { unreachable!() }
            fn read32(&mut self, _: u64) -> MemResult<u32> { unreachable!() }
            fn read64(&mut self, _: u64) -> MemResult<u64> { unreachable!() }
            fn read128(&mut self, _: u64) -> MemResult<u128> { unreachable!() }
            fn write8(&mut self, _: u64, _: u8) -> MemResult<()> { unreachable!() }
            fn write16(&mut self, _: u64, _: u16) -> MemResult<()> { unreachable!() }
            fn write32(&mut self, _: u64, _: u32) -> MemResult<()> { unreachable!() }
            fn write64(&mut self, _: u64, _: u64) -> MemResult<()> { unreachable!() }
            fn write128(&mut self, _: u64, _: u128) -> MemResult<()> { unreachable!() }
        }
        let mut m = Words;
        assert_eq!(m.read_code16(0), Some(0xaaaa));
        assert_eq!(m.read_code16(2), Some(0xbbbb));
        assert_eq!(m.read_code16(4), Some(0xcccc));
    }
}
