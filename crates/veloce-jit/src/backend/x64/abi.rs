//! Runtime environment and the helper functions generated code calls.
//!
//! Generated code cannot hold the borrows the callback traits need, so the
//! engine parks them in a [`RuntimeEnv`] for the duration of a run and
//! stores a raw pointer to it in the context's `env` slot. Helpers are
//! `extern "sysv64"` with the context pointer as the first argument; they
//! recover the environment from the context, do the work through the
//! callbacks and report faults by setting the context fault word (generated
//! code tests it right after the call).

use veloce_types::RoundingMode;

use crate::callbacks::{FpOps, Memory, MemoryFault, SystemHandler};
use crate::ctx::{JitContext, FAULT_MEMORY};
use crate::ir::FpBinOp;
use crate::monitor::ExclusiveMonitor;

/// Callback bundle for one run. Lives on the dispatcher's stack; the
/// pointer placed in `JitContext::env` must not outlive it.
pub struct RuntimeEnv<'a> {
    pub mem: &'a mut dyn Memory,
    pub sys: &'a mut dyn SystemHandler,
    pub fp: &'a dyn FpOps,
    pub monitor: &'a ExclusiveMonitor,
    pub processor_id: usize,
    /// Fault recorded by the most recent helper, consumed by the
    /// dispatcher when the block exits through the fault stub.
    pub fault: Option<MemoryFault>,
}

unsafe fn env_of<'e>(ctx: *mut JitContext) -> &'e mut RuntimeEnv<'e> {
    &mut *((*ctx).env as *mut RuntimeEnv)
}

unsafe fn record_fault(ctx: *mut JitContext, fault: MemoryFault) {
    (*ctx).fault = FAULT_MEMORY;
    env_of(ctx).fault = Some(fault);
}

fn read_bytes(mem: &mut dyn Memory, addr: u64, bytes: u32) -> Result<u64, MemoryFault> {
    Ok(match bytes {
        1 => mem.read8(addr)? as u64,
        2 => mem.read16(addr)? as u64,
        4 => mem.read32(addr)? as u64,
        8 => mem.read64(addr)?,
        _ => unreachable!("unsupported access width"),
    })
}

fn write_bytes(
    mem: &mut dyn Memory,
    addr: u64,
    value: u64,
    bytes: u32,
) -> Result<(), MemoryFault> {
    match bytes {
        1 => mem.write8(addr, value as u8),
        2 => mem.write16(addr, value as u16),
        4 => mem.write32(addr, value as u32),
        8 => mem.write64(addr, value),
        _ => unreachable!("unsupported access width"),
    }
}

pub(super) unsafe extern "sysv64" fn helper_read(
    ctx: *mut JitContext,
    addr: u64,
    bytes: u32,
) -> u64 {
    let env = env_of(ctx);
    match read_bytes(env.mem, addr, bytes) {
        Ok(v) => v,
        Err(fault) => {
            record_fault(ctx, fault);
            0
        }
    }
}

pub(super) unsafe extern "sysv64" fn helper_write(
    ctx: *mut JitContext,
    addr: u64,
    value: u64,
    bytes: u32,
) {
    let env = env_of(ctx);
    match write_bytes(env.mem, addr, value, bytes) {
        Ok(()) if env.monitor.processor_count() > 1 => {
            env.monitor
                .notify_incompatible_access(env.processor_id, addr, bytes as u64);
        }
        Ok(()) => {}
        Err(fault) => record_fault(ctx, fault),
    }
}

/// Exclusive load: marks the reservation, then reads. A 16-byte access
/// returns the low half and leaves the high half in the context pair
/// scratch slot.
pub(super) unsafe extern "sysv64" fn helper_read_exclusive(
    ctx: *mut JitContext,
    addr: u64,
    bytes: u32,
) -> u64 {
    let env = env_of(ctx);
    env.monitor.mark_exclusive(env.processor_id, addr, bytes as u64);
    if bytes == 16 {
        match env.mem.read128(addr) {
            Ok(v) => {
                (*ctx).pair_scratch = (v >> 64) as u64;
                v as u64
            }
            Err(fault) => {
                record_fault(ctx, fault);
                0
            }
        }
    } else {
        match read_bytes(env.mem, addr, bytes) {
            Ok(v) => v,
            Err(fault) => {
                record_fault(ctx, fault);
                0
            }
        }
    }
}

/// Returns 0 on success, 1 on a lost reservation.
pub(super) unsafe extern "sysv64" fn helper_write_exclusive(
    ctx: *mut JitContext,
    addr: u64,
    value: u64,
    bytes: u32,
) -> u64 {
    let env = env_of(ctx);
    if !env.monitor.check_and_clear(env.processor_id, addr, bytes as u64) {
        return 1;
    }
    if let Err(fault) = write_bytes(env.mem, addr, value, bytes) {
        record_fault(ctx, fault);
    }
    0
}

pub(super) unsafe extern "sysv64" fn helper_write_exclusive_pair(
    ctx: *mut JitContext,
    addr: u64,
    lo: u64,
    hi: u64,
) -> u64 {
    let env = env_of(ctx);
    if !env.monitor.check_and_clear(env.processor_id, addr, 16) {
        return 1;
    }
    let value = (hi as u128) << 64 | lo as u128;
    if let Err(fault) = env.mem.write128(addr, value) {
        record_fault(ctx, fault);
    }
    0
}

pub(super) unsafe extern "sysv64" fn helper_clear_exclusive(ctx: *mut JitContext) {
    let env = env_of(ctx);
    env.monitor.clear_processor(env.processor_id);
}

pub(super) unsafe extern "sysv64" fn helper_call_supervisor(ctx: *mut JitContext, imm: u32) {
    env_of(ctx).sys.call_supervisor(imm);
}

pub(super) unsafe extern "sysv64" fn helper_sysreg_read(ctx: *mut JitContext, sysreg: u32) -> u64 {
    env_of(ctx).sys.system_register_read(sysreg)
}

pub(super) unsafe extern "sysv64" fn helper_sysreg_write(
    ctx: *mut JitContext,
    sysreg: u32,
    value: u64,
) {
    env_of(ctx).sys.system_register_write(sysreg, value);
}

/// Packed FP opcode: bits 7..0 select the operation, bit 8 the width.
pub(super) const fn fp_op_word(op: FpBinOp, is64: bool) -> u32 {
    let code = match op {
        FpBinOp::Add => 0,
        FpBinOp::Sub => 1,
        FpBinOp::Mul => 2,
    };
    code | (is64 as u32) << 8
}

pub(super) unsafe extern "sysv64" fn helper_fp_op(
    ctx: *mut JitContext,
    op: u32,
    lhs: u64,
    rhs: u64,
) -> u64 {
    let env = env_of(ctx);
    let fpcr = (*ctx).fpcr;
    let mode = RoundingMode::from_bits(fpcr >> 22);
    let ftz = fpcr & 1 << 24 != 0;
    let is64 = op & 1 << 8 != 0;
    let (result, flags) = if is64 {
        match op & 0xff {
            0 => env.fp.add64(lhs, rhs, mode, ftz),
            1 => env.fp.sub64(lhs, rhs, mode, ftz),
            2 => env.fp.mul64(lhs, rhs, mode, ftz),
            _ => unreachable!("unknown fp opcode"),
        }
    } else {
        let (r, flags) = match op & 0xff {
            0 => env.fp.add32(lhs as u32, rhs as u32, mode, ftz),
            1 => env.fp.sub32(lhs as u32, rhs as u32, mode, ftz),
            2 => env.fp.mul32(lhs as u32, rhs as u32, mode, ftz),
            _ => unreachable!("unknown fp opcode"),
        };
        (r as u64, flags)
    };
    (*ctx).fpsr |= flags.bits();
    result
}
