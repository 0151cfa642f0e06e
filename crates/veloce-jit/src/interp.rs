//! IR interpreter.
//!
//! Executes a translated block directly against the guest context. The
//! engines use it for single stepping and as a reference for the native
//! backend; both consume the same optimized IR, so a divergence between the
//! two is a backend bug, not a translation bug.

use veloce_types::{MemSize, RoundingMode, Width};

use crate::callbacks::{Exception, FpOps, Memory, MemoryFault, SystemHandler};
use crate::ctx::JitContext;
use crate::eval;
use crate::ir::{CtxField, FpBinOp, Inst, IrBlock, LocationDescriptor, Operand, Terminator};
use crate::monitor::ExclusiveMonitor;

/// How a block left interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockExit {
    /// Continue at a statically known location.
    Link(LocationDescriptor),
    /// Continue at a dynamically computed PC; the caller re-keys.
    Dispatch(u64),
    /// An exception surfaced at `pc`.
    Exception { pc: u64, exception: Exception },
}

pub(crate) struct InterpEnv<'a> {
    pub ctx: &'a mut JitContext,
    pub mem: &'a mut dyn Memory,
    pub sys: &'a mut dyn SystemHandler,
    pub fp: &'a dyn FpOps,
    pub monitor: &'a ExclusiveMonitor,
    pub processor_id: usize,
}

pub(crate) fn run_block(block: &IrBlock, env: &mut InterpEnv) -> BlockExit {
    if !block.entry_cond.holds_nzcv(env.ctx.nzcv) {
        if let Some(it) = block.cond_fail_it {
            env.ctx.it_state = it as u32;
        }
        let target = block
            .cond_fail_target
            .expect("conditional block carries a fail target");
        return BlockExit::Link(target);
    }

    let mut values = vec![0u64; block.value_count() as usize];
    let op = |values: &[u64], operand: Operand| match operand {
        Operand::Value(v) => values[v.0 as usize],
        Operand::Imm(imm) => imm,
    };
    let set = |values: &mut [u64], dst: crate::ir::ValueId, v: u64| {
        values[dst.0 as usize] = v;
    };

    for inst in &block.insts {
        match *inst {
            Inst::GetReg { dst, reg } => {
                let v = env.ctx.regs[reg as usize];
                set(&mut values, dst, v);
            }
            Inst::SetReg { reg, src } => {
                env.ctx.regs[reg as usize] = op(&values, src);
            }
            Inst::GetVecElem { dst, reg, width, lane } => {
                let lane64 = env.ctx.vecs[reg as usize][(lane as usize * width.bytes() as usize) / 8];
                let v = match width {
                    Width::W64 => lane64,
                    _ => {
                        let per = 64 / width.bits();
                        let idx = lane as u32 % per;
                        lane64 >> (idx * width.bits()) & width.mask()
                    }
                };
                set(&mut values, dst, v);
            }
            Inst::SetVecElem { reg, width, lane, src } => {
                let v = op(&values, src) & width.mask();
                let slot = (lane as usize * width.bytes() as usize) / 8;
                match width {
                    Width::W64 => env.ctx.vecs[reg as usize][slot] = v,
                    _ => {
                        let per = 64 / width.bits();
                        let idx = lane as u32 % per;
                        let shift = idx * width.bits();
                        let old = env.ctx.vecs[reg as usize][slot];
                        env.ctx.vecs[reg as usize][slot] =
                            (old & !(width.mask() << shift)) | v << shift;
                    }
                }
            }
            Inst::GetNzcv { dst } => set(&mut values, dst, env.ctx.nzcv as u64),
            Inst::SetNzcv { src, flags } => {
                let mask = flags.nzcv_mask();
                let v = op(&values, src) as u32;
                env.ctx.nzcv = (env.ctx.nzcv & !mask) | (v & mask);
            }
            Inst::SetNzFromValue { src, width, flags } => {
                let v = op(&values, src) & width.mask();
                let nz = eval::nz_flags(width, v);
                let mask = flags.nzcv_mask();
                env.ctx.nzcv = (env.ctx.nzcv & !mask) | (nz & mask);
            }
            Inst::SetFlag { flag, src } => {
                let bit = 1u32 << flag.bit();
                if op(&values, src) & 1 != 0 {
                    env.ctx.nzcv |= bit;
                } else {
                    env.ctx.nzcv &= !bit;
                }
            }
            Inst::TestCond { dst, cond } => {
                set(&mut values, dst, cond.holds_nzcv(env.ctx.nzcv) as u64);
            }
            Inst::GetCtxField { dst, field } => {
                let v = match field {
                    CtxField::ThumbBit => env.ctx.cpsr_thumb as u64,
                    CtxField::ItState => env.ctx.it_state as u64,
                    CtxField::Fpcr => env.ctx.fpcr as u64,
                    CtxField::Fpsr => env.ctx.fpsr as u64,
                };
                set(&mut values, dst, v);
            }
            Inst::SetCtxField { field, src } => {
                let v = op(&values, src) as u32;
                match field {
                    CtxField::ThumbBit => env.ctx.cpsr_thumb = v & 1,
                    CtxField::ItState => env.ctx.it_state = v & 0xff,
                    CtxField::Fpcr => env.ctx.fpcr = v,
                    CtxField::Fpsr => env.ctx.fpsr = v,
                }
            }
            Inst::AddWithCarry { dst, lhs, rhs, carry, width, flags } => {
                let (result, nzcv) = eval::add_with_carry(
                    width,
                    op(&values, lhs),
                    op(&values, rhs),
                    op(&values, carry) & 1,
                );
                if !flags.is_empty() {
                    let mask = flags.nzcv_mask();
                    env.ctx.nzcv = (env.ctx.nzcv & !mask) | (nzcv & mask);
                }
                set(&mut values, dst, result);
            }
            Inst::And { dst, lhs, rhs, width } => {
                let v = op(&values, lhs) & op(&values, rhs) & width.mask();
                set(&mut values, dst, v);
            }
            Inst::Orr { dst, lhs, rhs, width } => {
                let v = (op(&values, lhs) | op(&values, rhs)) & width.mask();
                set(&mut values, dst, v);
            }
            Inst::Eor { dst, lhs, rhs, width } => {
                let v = (op(&values, lhs) ^ op(&values, rhs)) & width.mask();
                set(&mut values, dst, v);
            }
            Inst::Mul { dst, lhs, rhs, width } => {
                let v = op(&values, lhs).wrapping_mul(op(&values, rhs)) & width.mask();
                set(&mut values, dst, v);
            }
            Inst::Shift { dst, kind, src, amount, width } => {
                let v = eval::shift(kind, width, op(&values, src), op(&values, amount));
                set(&mut values, dst, v);
            }
            Inst::Rev { dst, src, width } => {
                let v = eval::rev(width, op(&values, src));
                set(&mut values, dst, v);
            }
            Inst::Rev16 { dst, src, width } => {
                let v = eval::rev16(width, op(&values, src));
                set(&mut values, dst, v);
            }
            Inst::Rev32 { dst, src } => {
                let v = eval::rev32(op(&values, src));
                set(&mut values, dst, v);
            }
            Inst::RBit { dst, src, width } => {
                let v = eval::rbit(width, op(&values, src));
                set(&mut values, dst, v);
            }
            Inst::Clz { dst, src, width } => {
                let v = eval::clz(width, op(&values, src));
                set(&mut values, dst, v);
            }
            Inst::IsZero { dst, src, width } => {
                let v = (op(&values, src) & width.mask() == 0) as u64;
                set(&mut values, dst, v);
            }
            Inst::Select { dst, cond, if_true, if_false } => {
                let v = if op(&values, cond) & 1 != 0 {
                    op(&values, if_true)
                } else {
                    op(&values, if_false)
                };
                set(&mut values, dst, v);
            }
            Inst::Load { dst, addr, size, pc } => {
                let a = op(&values, addr);
                match read_mem(env.mem, a, size) {
                    Ok(v) => set(&mut values, dst, v),
                    Err(fault) => return data_abort(pc, fault),
                }
            }
            Inst::Store { addr, src, size, pc } => {
                let a = op(&values, addr);
                let v = op(&values, src);
                if let Err(fault) = write_mem(env.mem, a, v, size) {
                    return data_abort(pc, fault);
                }
                if env.monitor.processor_count() > 1 {
                    env.monitor
                        .notify_incompatible_access(env.processor_id, a, size.bytes());
                }
            }
            Inst::LoadExclusive { dst, addr, size, pc } => {
                let a = op(&values, addr);
                env.monitor.mark_exclusive(env.processor_id, a, size.bytes());
                if size == MemSize::U128 {
                    match env.mem.read128(a) {
                        Ok(v) => {
                            env.ctx.pair_scratch = (v >> 64) as u64;
                            set(&mut values, dst, v as u64);
                        }
                        Err(fault) => return data_abort(pc, fault),
                    }
                } else {
                    match read_mem(env.mem, a, size) {
                        Ok(v) => set(&mut values, dst, v),
                        Err(fault) => return data_abort(pc, fault),
                    }
                }
            }
            Inst::ReadPairHigh { dst } => {
                let v = env.ctx.pair_scratch;
                set(&mut values, dst, v);
            }
            Inst::StoreExclusive { dst, addr, src, size, pc } => {
                let a = op(&values, addr);
                let v = op(&values, src);
                let ok = env
                    .monitor
                    .check_and_clear(env.processor_id, a, size.bytes());
                if ok {
                    if let Err(fault) = write_mem(env.mem, a, v, size) {
                        return data_abort(pc, fault);
                    }
                }
                set(&mut values, dst, !ok as u64);
            }
            Inst::StoreExclusivePair { dst, addr, lo, hi, pc } => {
                let a = op(&values, addr);
                let ok = env.monitor.check_and_clear(env.processor_id, a, 16);
                if ok {
                    let v = (op(&values, hi) as u128) << 64 | op(&values, lo) as u128;
                    if let Err(fault) = env.mem.write128(a, v) {
                        return data_abort(pc, fault);
                    }
                }
                set(&mut values, dst, !ok as u64);
            }
            Inst::ClearExclusive => env.monitor.clear_processor(env.processor_id),
            Inst::Fp { dst, op: fp_op, width, lhs, rhs } => {
                let a = op(&values, lhs);
                let b = op(&values, rhs);
                let mode = RoundingMode::from_bits(env.ctx.fpcr >> 22);
                let ftz = env.ctx.fpcr >> 24 & 1 != 0;
                let (v, flags) = match (fp_op, width) {
                    (FpBinOp::Add, Width::W32) => {
                        let (r, f) = env.fp.add32(a as u32, b as u32, mode, ftz);
                        (r as u64, f)
                    }
                    (FpBinOp::Sub, Width::W32) => {
                        let (r, f) = env.fp.sub32(a as u32, b as u32, mode, ftz);
                        (r as u64, f)
                    }
                    (FpBinOp::Mul, Width::W32) => {
                        let (r, f) = env.fp.mul32(a as u32, b as u32, mode, ftz);
                        (r as u64, f)
                    }
                    (FpBinOp::Add, _) => {
                        let (r, f) = env.fp.add64(a, b, mode, ftz);
                        (r, f)
                    }
                    (FpBinOp::Sub, _) => {
                        let (r, f) = env.fp.sub64(a, b, mode, ftz);
                        (r, f)
                    }
                    (FpBinOp::Mul, _) => {
                        let (r, f) = env.fp.mul64(a, b, mode, ftz);
                        (r, f)
                    }
                };
                env.ctx.fpsr |= flags.bits();
                set(&mut values, dst, v);
            }
            Inst::CallSupervisor { imm, pc } => {
                env.ctx.pc = pc;
                env.sys.call_supervisor(imm);
            }
            Inst::SysRegRead { dst, sysreg, pc } => {
                env.ctx.pc = pc;
                let v = env.sys.system_register_read(sysreg);
                set(&mut values, dst, v);
            }
            Inst::SysRegWrite { sysreg, src, pc } => {
                env.ctx.pc = pc;
                let v = op(&values, src);
                env.sys.system_register_write(sysreg, v);
            }
            Inst::GetTicks { dst } => {
                let v = env.ctx.ticks();
                set(&mut values, dst, v);
            }
            Inst::Nop => {}
        }
    }

    match block.terminator {
        Terminator::LinkBlock { target } => BlockExit::Link(target),
        Terminator::ReturnToDispatch { next_pc } => BlockExit::Dispatch(op(&values, next_pc)),
        Terminator::If { cond, then_target, else_target } => {
            if op(&values, cond) & 1 != 0 {
                BlockExit::Link(then_target)
            } else {
                BlockExit::Link(else_target)
            }
        }
        Terminator::Exception { pc, exception } => BlockExit::Exception { pc, exception },
    }
}

fn data_abort(pc: u64, fault: MemoryFault) -> BlockExit {
    BlockExit::Exception {
        pc,
        exception: Exception::DataAbort(fault),
    }
}

fn read_mem(mem: &mut dyn Memory, addr: u64, size: MemSize) -> Result<u64, MemoryFault> {
    Ok(match size {
        MemSize::U8 => mem.read8(addr)? as u64,
        MemSize::U16 => mem.read16(addr)? as u64,
        MemSize::U32 => mem.read32(addr)? as u64,
        MemSize::U64 => mem.read64(addr)?,
        MemSize::U128 => mem.read128(addr)? as u64,
    })
}

fn write_mem(mem: &mut dyn Memory, addr: u64, value: u64, size: MemSize) -> Result<(), MemoryFault> {
    match size {
        MemSize::U8 => mem.write8(addr, value as u8),
        MemSize::U16 => mem.write16(addr, value as u16),
        MemSize::U32 => mem.write32(addr, value as u32),
        MemSize::U64 => mem.write64(addr, value),
        MemSize::U128 => mem.write128(addr, value as u128),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veloce_types::FlagSet;
    use crate::callbacks::{ExceptionAction, HostFpOps, MemResult};
    use crate::ir::ValueId;
    use veloce_types::Cond;

    struct FlatMem(Vec<u8>);

    impl Memory for FlatMem {
        fn read_code32(&mut self, addr: u64) -> Option<u32> {
            let b = self.0.get(addr as usize..addr as usize + 4)?;
            Some(u32::from_le_bytes(b.try_into().ok()?))
        }
        fn read8(&mut self, addr: u64) -> MemResult<u8> {
            self.0
                .get(addr as usize)
                .copied()
                .ok_or(MemoryFault { addr, write: false, bytes: 1 })
        }
        fn read16(&mut self, addr: u64) -> MemResult<u16> {
            Ok(self.read8(addr)? as u16 | (self.read8(addr + 1)? as u16) << 8)
        }
        fn read32(&mut self, addr: u64) -> MemResult<u32> {
            Ok(self.read16(addr)? as u32 | (self.read16(addr + 2)? as u32) << 16)
        }
        fn read64(&mut self, addr: u64) -> MemResult<u64> {
            Ok(self.read32(addr)? as u64 | (self.read32(addr + 4)? as u64) << 32)
        }
        fn read128(&mut self, addr: u64) -> MemResult<u128> {
            Ok(self.read64(addr)? as u128 | (self.read64(addr + 8)? as u128) << 64)
        }
        fn write8(&mut self, addr: u64, value: u8) -> MemResult<()> {
            *self
                .0
                .get_mut(addr as usize)
                .ok_or(MemoryFault { addr, write: true, bytes: 1 })? = value;
            Ok(())
        }
        fn write16(&mut self, addr: u64, value: u16) -> MemResult<()> {
            self.write8(addr, value as u8)?;
            self.write8(addr + 1, (value >> 8) as u8)
        }
        fn write32(&mut self, addr: u64, value: u32) -> MemResult<()> {
            self.write16(addr, value as u16)?;
            self.write16(addr + 2, (value >> 16) as u16)
        }
        fn write64(&mut self, addr: u64, value: u64) -> MemResult<()> {
            self.write32(addr, value as u32)?;
            self.write32(addr + 4, (value >> 32) as u32)
        }
        fn write128(&mut self, addr: u64, value: u128) -> MemResult<()> {
            self.write64(addr, value as u64)?;
            self.write64(addr + 8, (value >> 64) as u64)
        }
    }

    struct NullSys;

    impl SystemHandler for NullSys {
        fn exception_raised(&mut self, _pc: u64, _exception: Exception) -> ExceptionAction {
            ExceptionAction::Halt
        }
        fn call_supervisor(&mut self, _swi: u32) {}
    }

    fn run(block: &IrBlock, ctx: &mut JitContext, mem: &mut FlatMem) -> BlockExit {
        let monitor = ExclusiveMonitor::new(1);
        let mut sys = NullSys;
        let mut env = InterpEnv {
            ctx,
            mem,
            sys: &mut sys,
            fp: &HostFpOps,
            monitor: &monitor,
            processor_id: 0,
        };
        run_block(block, &mut env)
    }

    #[test]
    fn add_writes_register_and_flags() {
        let mut block = IrBlock::new(LocationDescriptor(0));
        let lhs = block.new_value();
        block.push(Inst::GetReg { dst: lhs, reg: 0 });
        let sum = block.new_value();
        block.push(Inst::AddWithCarry {
            dst: sum,
            lhs: Operand::Value(lhs),
            rhs: Operand::Imm(u64::MAX),
            carry: Operand::Imm(0),
            width: Width::W64,
            flags: FlagSet::NZCV,
        });
        block.push(Inst::SetReg { reg: 1, src: Operand::Value(sum) });
        block.terminator = Terminator::LinkBlock {
            target: LocationDescriptor(4),
        };

        let mut ctx = JitContext::new();
        ctx.regs[0] = 1;
        let mut mem = FlatMem(vec![0; 64]);
        let exit = run(&block, &mut ctx, &mut mem);
        assert_eq!(exit, BlockExit::Link(LocationDescriptor(4)));
        assert_eq!(ctx.regs[1], 0);
        // 1 + (-1): zero and carry.
        assert_eq!(ctx.nzcv, 0x6000_0000);
    }

    #[test]
    fn failed_guard_jumps_to_fail_target_and_advances_it() {
        let mut block = IrBlock::new(LocationDescriptor(0));
        block.entry_cond = Cond::Eq;
        block.cond_fail_target = Some(LocationDescriptor(2));
        block.cond_fail_it = Some(0x18);
        block.push(Inst::SetReg { reg: 0, src: Operand::Imm(7) });
        block.terminator = Terminator::LinkBlock {
            target: LocationDescriptor(2),
        };

        let mut ctx = JitContext::new();
        ctx.nzcv = 0; // Z clear: EQ fails
        let mut mem = FlatMem(vec![0; 16]);
        let exit = run(&block, &mut ctx, &mut mem);
        assert_eq!(exit, BlockExit::Link(LocationDescriptor(2)));
        assert_eq!(ctx.regs[0], 0);
        assert_eq!(ctx.it_state, 0x18);
    }

    #[test]
    fn lost_reservation_fails_store_exclusive() {
        let mut block = IrBlock::new(LocationDescriptor(0));
        let status = block.new_value();
        block.push(Inst::StoreExclusive {
            dst: status,
            addr: Operand::Imm(8),
            src: Operand::Imm(0xdead),
            size: MemSize::U32,
            pc: 0,
        });
        block.push(Inst::SetReg { reg: 2, src: Operand::Value(status) });
        block.terminator = Terminator::LinkBlock {
            target: LocationDescriptor(4),
        };

        let mut ctx = JitContext::new();
        let mut mem = FlatMem(vec![0; 32]);
        run(&block, &mut ctx, &mut mem);
        // No prior exclusive load: the store must fail and not write.
        assert_eq!(ctx.regs[2], 1);
        assert_eq!(mem.0[8], 0);
    }

    #[test]
    fn load_fault_surfaces_as_data_abort() {
        let mut block = IrBlock::new(LocationDescriptor(0));
        let v = block.new_value();
        block.push(Inst::Load {
            dst: v,
            addr: Operand::Imm(0x1000),
            size: MemSize::U8,
            pc: 0x40,
        });
        block.push(Inst::SetReg { reg: 0, src: Operand::Value(v) });
        block.terminator = Terminator::LinkBlock {
            target: LocationDescriptor(4),
        };

        let mut ctx = JitContext::new();
        let mut mem = FlatMem(vec![0; 16]);
        let exit = run(&block, &mut ctx, &mut mem);
        assert_eq!(
            exit,
            BlockExit::Exception {
                pc: 0x40,
                exception: Exception::DataAbort(MemoryFault {
                    addr: 0x1000,
                    write: false,
                    bytes: 1,
                }),
            }
        );
    }
}
