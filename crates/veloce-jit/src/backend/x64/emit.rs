//! Block compiler: IR to x86-64 through dynasm.
//!
//! All blocks share one [`JitArena`]. The arena owns a single entry thunk
//! (saves host registers, pins the context in r13, jumps to a block) and a
//! single pair of exit stubs every block funnels through. Static block
//! edges are emitted as 15-byte patch sites that initially return an
//! `EXIT_LINK` word; the dispatcher overwrites them with a direct `jmp`
//! once the successor is compiled.

use dynasmrt::{dynasm, AssemblyOffset, DynamicLabel, DynasmApi, DynasmLabelApi};
use veloce_types::{Cond, Flag, ShiftType, Width};

use crate::backend::{exit_exception_word, exit_link_word, EXIT_BUDGET, EXIT_FAULT};
use crate::callbacks::Exception;
use crate::ctx::{
    off_reg, off_vec_lane, JitContext, OFF_BUDGET_START, OFF_CPSR_THUMB, OFF_FAULT, OFF_FPCR,
    OFF_FPSR, OFF_IT_STATE, OFF_NZCV, OFF_PAIR_SCRATCH, OFF_PC, OFF_REMAINING, OFF_TICK_BASE,
};
use crate::ir::{CtxField, Inst, IrBlock, LocationDescriptor, Operand, Terminator};

use super::abi;
use super::regalloc::{Allocator, ArgSrc, MAX_SPILL_SLOTS, R8, R9, RCX, RDI, RDX, RSI};

pub(crate) type Assembler = dynasmrt::x64::Assembler;

/// Host frame below the saved registers: the spill arena plus alignment
/// padding, sized so RSP is 16-aligned at helper calls.
const FRAME: i32 = MAX_SPILL_SLOTS as i32 * 8 + 8;

/// Argument registers of the sysv64 call convention, in order.
const ARG_REGS: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// Byte length of an unlinked patch site: `mov rax, imm64` (10) plus
/// `jmp rel32` (5). Linking rewrites it as `jmp rel32` plus 10 nops.
pub const PATCH_SITE_LEN: usize = 15;

/// One patchable static edge out of a compiled block.
#[derive(Debug, Clone, Copy)]
pub struct PatchSite {
    pub offset: AssemblyOffset,
    pub target: LocationDescriptor,
    /// Exit word the site produces while unlinked; restored on unlink.
    pub exit_word: u64,
}

/// Result of compiling one block.
pub struct CompiledCode {
    pub entry: AssemblyOffset,
    pub entry_label: DynamicLabel,
    pub patch_sites: Vec<PatchSite>,
}

enum HelperArg {
    Ctx,
    Imm(u64),
    Op(Operand),
}

pub struct JitArena {
    ops: Assembler,
    enter: AssemblyOffset,
    exit_restore: DynamicLabel,
    exit_fault: DynamicLabel,
}

impl JitArena {
    pub fn new() -> JitArena {
        let mut ops = Assembler::new().expect("failed to create assembler");
        let exit_restore = ops.new_dynamic_label();
        let exit_fault = ops.new_dynamic_label();
        let enter = ops.offset();
        // Entry thunk: rdi = context, rsi = block entry point.
        dynasm!(ops
            ; .arch x64
            ; push rbp
            ; push rbx
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; sub rsp, FRAME
            ; mov r13, rdi
            ; jmp rsi
            // Shared exits. Fault falls through into restore with the
            // fault exit word.
            ; =>exit_fault
            ; mov eax, EXIT_FAULT as i32
            ; =>exit_restore
            ; add rsp, FRAME
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbx
            ; pop rbp
            ; ret
        );
        ops.commit().expect("failed to commit entry thunk");
        JitArena {
            ops,
            enter,
            exit_restore,
            exit_fault,
        }
    }

    /// Compile one block. `exceptions` is the arena-lifetime exception
    /// table; `Exception` terminators append to it and exit with the index.
    pub fn compile(
        &mut self,
        block: &IrBlock,
        block_id: u32,
        guest_pc: u64,
        exceptions: &mut Vec<Exception>,
    ) -> CompiledCode {
        tracing::trace!(
            location = block.location.0,
            block_id,
            insts = block.insts.len(),
            "compiling block"
        );
        let entry_label = self.ops.new_dynamic_label();
        let entry = self.ops.offset();
        let mut patch_sites = Vec::new();

        // Budget check, then the per-block charge.
        dynasm!(self.ops
            ; .arch x64
            ; =>entry_label
            ; cmp QWORD [r13 + OFF_REMAINING], 0
            ; jg >budget_ok
            ; mov rax, QWORD guest_pc as i64
            ; mov [r13 + OFF_PC], rax
            ; mov eax, EXIT_BUDGET as i32
            ; jmp =>self.exit_restore
            ; budget_ok:
            ; sub QWORD [r13 + OFF_REMAINING], block.cycle_count as i32
        );

        // Entry guard for conditional blocks.
        if !matches!(block.entry_cond, Cond::Al | Cond::Nv) {
            emit_test_cond(&mut self.ops, block.entry_cond);
            dynasm!(self.ops
                ; .arch x64
                ; test eax, eax
                ; jnz >guard_pass
            );
            if let Some(it) = block.cond_fail_it {
                dynasm!(self.ops
                    ; .arch x64
                    ; mov DWORD [r13 + OFF_IT_STATE], it as i32
                );
            }
            let target = block
                .cond_fail_target
                .expect("conditional block without a fail target");
            self.emit_patch_site(&mut patch_sites, block_id, target);
            dynasm!(self.ops
                ; .arch x64
                ; guard_pass:
            );
        }

        let mut alloc = Allocator::new(block);
        for inst in &block.insts {
            alloc.begin_inst();
            self.emit_inst(&mut alloc, inst);
            inst.for_each_use(|v| alloc.retire_use(v));
            if let Some(dst) = inst.dst() {
                alloc.release_if_dead(dst);
            }
        }

        alloc.begin_inst();
        self.emit_terminator(&mut alloc, &block.terminator, block_id, &mut patch_sites, exceptions);

        self.ops.commit().expect("failed to commit compiled block");
        CompiledCode {
            entry,
            entry_label,
            patch_sites,
        }
    }

    /// Overwrite a patch site with a direct jump to `target_entry`.
    pub fn link(&mut self, site: &PatchSite, target_entry: DynamicLabel) {
        self.ops
            .alter(|m| {
                m.goto(site.offset);
                dynasm!(m
                    ; .arch x64
                    ; jmp =>target_entry
                );
                for _ in 0..PATCH_SITE_LEN - 5 {
                    m.push(0x90);
                }
            })
            .expect("failed to patch block link");
    }

    /// Restore a patch site to its unlinked form.
    pub fn unlink(&mut self, site: &PatchSite) {
        let exit_restore = self.exit_restore;
        self.ops
            .alter(|m| {
                m.goto(site.offset);
                dynasm!(m
                    ; .arch x64
                    ; mov rax, QWORD site.exit_word as i64
                    ; jmp =>exit_restore
                );
            })
            .expect("failed to unpatch block link");
    }

    /// Run generated code starting at `entry`. Returns the raw exit word.
    ///
    /// # Safety
    ///
    /// `ctx` must point at a live [`JitContext`] whose `env` field points at
    /// a live `RuntimeEnv` if the block performs memory, system or FP
    /// operations.
    pub unsafe fn execute(&self, ctx: *mut JitContext, entry: AssemblyOffset) -> u64 {
        let reader = self.ops.reader();
        let buf = reader.lock();
        let enter: unsafe extern "sysv64" fn(*mut JitContext, *const u8) -> u64 =
            std::mem::transmute(buf.ptr(self.enter));
        enter(ctx, buf.ptr(entry))
    }

    fn emit_patch_site(
        &mut self,
        sites: &mut Vec<PatchSite>,
        block_id: u32,
        target: LocationDescriptor,
    ) {
        let slot = sites.len() as u8;
        let exit_word = exit_link_word(block_id, slot);
        let offset = self.ops.offset();
        dynasm!(self.ops
            ; .arch x64
            ; mov rax, QWORD exit_word as i64
            ; jmp =>self.exit_restore
        );
        sites.push(PatchSite {
            offset,
            target,
            exit_word,
        });
    }

    fn emit_inst(&mut self, alloc: &mut Allocator, inst: &Inst) {
        let ops = &mut self.ops;
        match *inst {
            Inst::GetReg { dst, reg } => {
                let rd = alloc.write(ops, dst);
                dynasm!(ops ; .arch x64 ; mov Rq(rd), [r13 + off_reg(reg)]);
            }
            Inst::SetReg { reg, src } => match src {
                Operand::Imm(imm) => {
                    dynasm!(ops
                        ; .arch x64
                        ; mov rax, QWORD imm as i64
                        ; mov [r13 + off_reg(reg)], rax
                    );
                }
                Operand::Value(v) => {
                    let rs = alloc.read(ops, v);
                    dynasm!(ops ; .arch x64 ; mov [r13 + off_reg(reg)], Rq(rs));
                }
            },
            Inst::GetVecElem { dst, reg, width, lane } => {
                let rd = alloc.write(ops, dst);
                let off = off_vec_lane(reg, 0) + lane as i32 * width.bits() as i32 / 8;
                match width {
                    Width::W8 => dynasm!(ops ; .arch x64 ; movzx Rd(rd), BYTE [r13 + off]),
                    Width::W16 => dynasm!(ops ; .arch x64 ; movzx Rd(rd), WORD [r13 + off]),
                    Width::W32 => dynasm!(ops ; .arch x64 ; mov Rd(rd), [r13 + off]),
                    Width::W64 => dynasm!(ops ; .arch x64 ; mov Rq(rd), [r13 + off]),
                }
            }
            Inst::SetVecElem { reg, width, lane, src } => {
                let rs = self.materialize(alloc, src);
                let ops = &mut self.ops;
                let off = off_vec_lane(reg, 0) + lane as i32 * width.bits() as i32 / 8;
                match width {
                    Width::W8 => dynasm!(ops ; .arch x64 ; mov [r13 + off], Rb(rs)),
                    Width::W16 => dynasm!(ops ; .arch x64 ; mov [r13 + off], Rw(rs)),
                    Width::W32 => dynasm!(ops ; .arch x64 ; mov [r13 + off], Rd(rs)),
                    Width::W64 => dynasm!(ops ; .arch x64 ; mov [r13 + off], Rq(rs)),
                }
            }
            Inst::GetNzcv { dst } => {
                let rd = alloc.write(ops, dst);
                dynasm!(ops ; .arch x64 ; mov Rd(rd), [r13 + OFF_NZCV]);
            }
            Inst::SetNzcv { src, flags } => {
                let mask = flags.nzcv_mask();
                match src {
                    Operand::Imm(imm) => {
                        dynasm!(ops ; .arch x64 ; mov eax, (imm as u32 & mask) as i32);
                    }
                    Operand::Value(v) => {
                        let rs = alloc.read(ops, v);
                        dynasm!(ops
                            ; .arch x64
                            ; mov eax, Rd(rs)
                            ; and eax, mask as i32
                        );
                    }
                }
                emit_nzcv_merge(ops, mask);
            }
            Inst::SetNzFromValue { src, width, flags } => {
                let rs = self.materialize(alloc, src);
                let ops = &mut self.ops;
                match width {
                    Width::W32 => dynasm!(ops ; .arch x64 ; test Rd(rs), Rd(rs)),
                    _ => dynasm!(ops ; .arch x64 ; test Rq(rs), Rq(rs)),
                }
                // Pack SF/ZF into the top of eax at the architectural N/Z
                // positions.
                dynasm!(ops
                    ; .arch x64
                    ; lahf
                    ; shr eax, 8
                    ; and eax, 0xC0
                    ; shl eax, 24
                );
                emit_nzcv_merge(ops, flags.nzcv_mask());
            }
            Inst::SetFlag { flag, src } => {
                let bit = flag_bit(flag);
                match src {
                    Operand::Imm(imm) => {
                        dynasm!(ops ; .arch x64 ; mov eax, ((imm as u32 & 1) << bit) as i32);
                    }
                    Operand::Value(v) => {
                        let rs = alloc.read(ops, v);
                        dynasm!(ops
                            ; .arch x64
                            ; mov eax, Rd(rs)
                            ; and eax, 1
                            ; shl eax, bit as i8
                        );
                    }
                }
                emit_nzcv_merge(ops, 1 << bit);
            }
            Inst::TestCond { dst, cond } => {
                emit_test_cond(ops, cond);
                let rd = alloc.write(ops, dst);
                dynasm!(ops ; .arch x64 ; mov Rd(rd), eax);
            }
            Inst::GetCtxField { dst, field } => {
                let rd = alloc.write(ops, dst);
                dynasm!(ops ; .arch x64 ; mov Rd(rd), [r13 + ctx_field_off(field)]);
            }
            Inst::SetCtxField { field, src } => {
                let off = ctx_field_off(field);
                match src {
                    Operand::Imm(imm) => {
                        dynasm!(ops ; .arch x64 ; mov DWORD [r13 + off], imm as u32 as i32);
                    }
                    Operand::Value(v) => {
                        let rs = alloc.read(ops, v);
                        dynasm!(ops ; .arch x64 ; mov [r13 + off], Rd(rs));
                    }
                }
            }
            Inst::AddWithCarry { dst, lhs, rhs, carry, width, flags } => {
                self.emit_add_with_carry(alloc, dst, lhs, rhs, carry, width, flags);
            }
            Inst::And { dst, lhs, rhs, width } => {
                self.emit_bitwise(alloc, BitOp::And, dst, lhs, rhs, width);
            }
            Inst::Orr { dst, lhs, rhs, width } => {
                self.emit_bitwise(alloc, BitOp::Orr, dst, lhs, rhs, width);
            }
            Inst::Eor { dst, lhs, rhs, width } => {
                self.emit_bitwise(alloc, BitOp::Eor, dst, lhs, rhs, width);
            }
            Inst::Mul { dst, lhs, rhs, width } => {
                let rl = self.materialize(alloc, lhs);
                let rr = self.materialize_second(alloc, rhs);
                let rd = alloc.write(&mut self.ops, dst);
                let ops = &mut self.ops;
                dynasm!(ops
                    ; .arch x64
                    ; mov Rq(rd), Rq(rl)
                    ; imul Rq(rd), Rq(rr)
                );
                truncate(ops, rd, width);
            }
            Inst::Shift { dst, kind, src, amount, width } => {
                self.emit_shift(alloc, dst, kind, src, amount, width);
            }
            Inst::Rev { dst, src, width } => {
                let rs = self.materialize(alloc, src);
                let rd = alloc.write(&mut self.ops, dst);
                let ops = &mut self.ops;
                match width {
                    Width::W32 => dynasm!(ops
                        ; .arch x64
                        ; mov Rd(rd), Rd(rs)
                        ; bswap Rq(rd)
                        ; shr Rq(rd), 32
                    ),
                    _ => dynasm!(ops
                        ; .arch x64
                        ; mov Rq(rd), Rq(rs)
                        ; bswap Rq(rd)
                    ),
                }
            }
            Inst::Rev16 { dst, src, width } => {
                let rs = self.materialize(alloc, src);
                let rd = alloc.write(&mut self.ops, dst);
                let ops = &mut self.ops;
                dynasm!(ops
                    ; .arch x64
                    ; mov Rq(rd), Rq(rs)
                    ; mov r10, Rq(rd)
                    ; shr r10, 8
                    ; mov r11, QWORD 0x00ff_00ff_00ff_00ffu64 as i64
                    ; and r10, r11
                    ; and Rq(rd), r11
                    ; shl Rq(rd), 8
                    ; or Rq(rd), r10
                );
                truncate(ops, rd, width);
            }
            Inst::Rev32 { dst, src } => {
                let rs = self.materialize(alloc, src);
                let rd = alloc.write(&mut self.ops, dst);
                let ops = &mut self.ops;
                dynasm!(ops
                    ; .arch x64
                    ; mov Rq(rd), Rq(rs)
                    ; bswap Rq(rd)
                    ; ror Rq(rd), 32
                );
            }
            Inst::RBit { dst, src, width } => {
                let rs = self.materialize(alloc, src);
                let rd = alloc.write(&mut self.ops, dst);
                let ops = &mut self.ops;
                dynasm!(ops ; .arch x64 ; mov Rq(rd), Rq(rs));
                // Swap bit pairs, then nibbles' halves, then nibbles; byte
                // reversal finishes the full 64-bit reversal.
                for (mask, shift) in [
                    (0x5555_5555_5555_5555u64, 1i8),
                    (0x3333_3333_3333_3333u64, 2),
                    (0x0f0f_0f0f_0f0f_0f0fu64, 4),
                ] {
                    dynasm!(ops
                        ; .arch x64
                        ; mov r10, Rq(rd)
                        ; shr r10, shift
                        ; mov r11, QWORD mask as i64
                        ; and r10, r11
                        ; and Rq(rd), r11
                        ; shl Rq(rd), shift
                        ; or Rq(rd), r10
                    );
                }
                dynasm!(ops ; .arch x64 ; bswap Rq(rd));
                if width == Width::W32 {
                    dynasm!(ops ; .arch x64 ; shr Rq(rd), 32);
                }
            }
            Inst::Clz { dst, src, width } => {
                let rs = self.materialize(alloc, src);
                let rd = alloc.write(&mut self.ops, dst);
                let ops = &mut self.ops;
                // bsr leaves the destination untouched on zero input; the
                // cmov turns that into index -1, making the result
                // width.bits() as the architecture requires.
                match width {
                    Width::W32 => dynasm!(ops ; .arch x64 ; bsr r10d, Rd(rs)),
                    _ => dynasm!(ops ; .arch x64 ; bsr r10, Rq(rs)),
                }
                dynasm!(ops
                    ; .arch x64
                    ; mov r11, -1
                    ; cmovz r10, r11
                    ; mov Rq(rd), (width.bits() - 1) as i32
                    ; sub Rq(rd), r10
                );
            }
            Inst::IsZero { dst, src, width } => {
                let rs = self.materialize(alloc, src);
                let rd = alloc.write(&mut self.ops, dst);
                let ops = &mut self.ops;
                dynasm!(ops ; .arch x64 ; xor Rd(rd), Rd(rd));
                match width {
                    Width::W8 => dynasm!(ops ; .arch x64 ; test Rb(rs), Rb(rs)),
                    Width::W16 => dynasm!(ops ; .arch x64 ; test Rw(rs), Rw(rs)),
                    Width::W32 => dynasm!(ops ; .arch x64 ; test Rd(rs), Rd(rs)),
                    Width::W64 => dynasm!(ops ; .arch x64 ; test Rq(rs), Rq(rs)),
                }
                dynasm!(ops ; .arch x64 ; setz Rb(rd));
            }
            Inst::Select { dst, cond, if_true, if_false } => {
                match cond {
                    Operand::Imm(c) => {
                        let chosen = if c & 1 != 0 { if_true } else { if_false };
                        let rs = self.materialize(alloc, chosen);
                        let rd = alloc.write(&mut self.ops, dst);
                        let ops = &mut self.ops;
                        dynasm!(ops ; .arch x64 ; mov Rq(rd), Rq(rs));
                    }
                    Operand::Value(c) => {
                        let rc = alloc.read(&mut self.ops, c);
                        let rt = self.materialize(alloc, if_true);
                        let rf = self.materialize_second(alloc, if_false);
                        let rd = alloc.write(&mut self.ops, dst);
                        let ops = &mut self.ops;
                        dynasm!(ops
                            ; .arch x64
                            ; mov Rq(rd), Rq(rf)
                            ; test Rq(rc), 1
                            ; cmovnz Rq(rd), Rq(rt)
                        );
                    }
                }
            }
            Inst::Load { dst, addr, size, pc } => {
                self.emit_helper_call(
                    alloc,
                    abi::helper_read as usize,
                    &[HelperArg::Ctx, HelperArg::Op(addr), HelperArg::Imm(size.bytes())],
                    Some(pc),
                    true,
                );
                self.take_result(alloc, dst);
            }
            Inst::Store { addr, src, size, pc } => {
                self.emit_helper_call(
                    alloc,
                    abi::helper_write as usize,
                    &[
                        HelperArg::Ctx,
                        HelperArg::Op(addr),
                        HelperArg::Op(src),
                        HelperArg::Imm(size.bytes()),
                    ],
                    Some(pc),
                    true,
                );
            }
            Inst::LoadExclusive { dst, addr, size, pc } => {
                self.emit_helper_call(
                    alloc,
                    abi::helper_read_exclusive as usize,
                    &[HelperArg::Ctx, HelperArg::Op(addr), HelperArg::Imm(size.bytes())],
                    Some(pc),
                    true,
                );
                self.take_result(alloc, dst);
            }
            Inst::ReadPairHigh { dst } => {
                let rd = alloc.write(ops, dst);
                dynasm!(ops ; .arch x64 ; mov Rq(rd), [r13 + OFF_PAIR_SCRATCH]);
            }
            Inst::StoreExclusive { dst, addr, src, size, pc } => {
                self.emit_helper_call(
                    alloc,
                    abi::helper_write_exclusive as usize,
                    &[
                        HelperArg::Ctx,
                        HelperArg::Op(addr),
                        HelperArg::Op(src),
                        HelperArg::Imm(size.bytes()),
                    ],
                    Some(pc),
                    true,
                );
                self.take_result(alloc, dst);
            }
            Inst::StoreExclusivePair { dst, addr, lo, hi, pc } => {
                self.emit_helper_call(
                    alloc,
                    abi::helper_write_exclusive_pair as usize,
                    &[
                        HelperArg::Ctx,
                        HelperArg::Op(addr),
                        HelperArg::Op(lo),
                        HelperArg::Op(hi),
                    ],
                    Some(pc),
                    true,
                );
                self.take_result(alloc, dst);
            }
            Inst::ClearExclusive => {
                self.emit_helper_call(
                    alloc,
                    abi::helper_clear_exclusive as usize,
                    &[HelperArg::Ctx],
                    None,
                    false,
                );
            }
            Inst::Fp { dst, op, width, lhs, rhs } => {
                let word = abi::fp_op_word(op, width == Width::W64);
                self.emit_helper_call(
                    alloc,
                    abi::helper_fp_op as usize,
                    &[
                        HelperArg::Ctx,
                        HelperArg::Imm(word as u64),
                        HelperArg::Op(lhs),
                        HelperArg::Op(rhs),
                    ],
                    None,
                    false,
                );
                self.take_result(alloc, dst);
            }
            Inst::CallSupervisor { imm, pc } => {
                self.emit_helper_call(
                    alloc,
                    abi::helper_call_supervisor as usize,
                    &[HelperArg::Ctx, HelperArg::Imm(imm as u64)],
                    Some(pc),
                    false,
                );
            }
            Inst::SysRegRead { dst, sysreg, pc } => {
                self.emit_helper_call(
                    alloc,
                    abi::helper_sysreg_read as usize,
                    &[HelperArg::Ctx, HelperArg::Imm(sysreg as u64)],
                    Some(pc),
                    false,
                );
                self.take_result(alloc, dst);
            }
            Inst::SysRegWrite { sysreg, src, pc } => {
                self.emit_helper_call(
                    alloc,
                    abi::helper_sysreg_write as usize,
                    &[HelperArg::Ctx, HelperArg::Imm(sysreg as u64), HelperArg::Op(src)],
                    Some(pc),
                    false,
                );
            }
            Inst::GetTicks { dst } => {
                let rd = alloc.write(ops, dst);
                dynasm!(ops
                    ; .arch x64
                    ; mov rax, [r13 + OFF_BUDGET_START]
                    ; sub rax, [r13 + OFF_REMAINING]
                    ; add rax, [r13 + OFF_TICK_BASE]
                    ; mov Rq(rd), rax
                );
            }
            Inst::Nop => {}
        }
    }

    fn emit_add_with_carry(
        &mut self,
        alloc: &mut Allocator,
        dst: crate::ir::ValueId,
        lhs: Operand,
        rhs: Operand,
        carry: Operand,
        width: Width,
        flags: veloce_types::FlagSet,
    ) {
        // Read everything before touching CF: register moves and reloads
        // preserve flags, the arithmetic itself must not be preceded by
        // anything that does not.
        let rl = match lhs {
            Operand::Value(v) => Some(alloc.read(&mut self.ops, v)),
            Operand::Imm(_) => None,
        };
        let rr = match rhs {
            Operand::Value(v) => Some(alloc.read(&mut self.ops, v)),
            Operand::Imm(_) => None,
        };
        let rc = match carry {
            Operand::Value(v) => Some(alloc.read(&mut self.ops, v)),
            Operand::Imm(_) => None,
        };
        let rd = alloc.write(&mut self.ops, dst);
        let ops = &mut self.ops;

        match (lhs, rl) {
            (_, Some(r)) => dynasm!(ops ; .arch x64 ; mov Rq(rd), Rq(r)),
            (Operand::Imm(imm), None) => {
                dynasm!(ops ; .arch x64 ; mov Rq(rd), QWORD imm as i64)
            }
            _ => unreachable!(),
        }
        // rhs into r10 when it is a large immediate; small immediates go
        // straight into the arithmetic below.
        let rhs_imm32 = match (rhs, rr) {
            (Operand::Imm(imm), None) => {
                let small = imm as i64 >= i32::MIN as i64 && imm as i64 <= i32::MAX as i64;
                if small {
                    Some(imm as i32)
                } else {
                    dynasm!(ops ; .arch x64 ; mov r10, QWORD imm as i64);
                    None
                }
            }
            _ => None,
        };
        let rhs_reg = rr.unwrap_or(super::regalloc::R10);

        let with_carry = match carry {
            Operand::Imm(0) => false,
            Operand::Imm(_) => {
                dynasm!(ops ; .arch x64 ; stc);
                true
            }
            Operand::Value(_) => {
                let c = rc.expect("carry register");
                dynasm!(ops ; .arch x64 ; bt Rq(c), 0);
                true
            }
        };

        let use_flags = !flags.is_empty();
        match (use_flags && width == Width::W32, with_carry, rhs_imm32) {
            (true, true, Some(imm)) => dynasm!(ops ; .arch x64 ; adc Rd(rd), imm),
            (true, true, None) => dynasm!(ops ; .arch x64 ; adc Rd(rd), Rd(rhs_reg)),
            (true, false, Some(imm)) => dynasm!(ops ; .arch x64 ; add Rd(rd), imm),
            (true, false, None) => dynasm!(ops ; .arch x64 ; add Rd(rd), Rd(rhs_reg)),
            (false, true, Some(imm)) => dynasm!(ops ; .arch x64 ; adc Rq(rd), imm),
            (false, true, None) => dynasm!(ops ; .arch x64 ; adc Rq(rd), Rq(rhs_reg)),
            (false, false, Some(imm)) => dynasm!(ops ; .arch x64 ; add Rq(rd), imm),
            (false, false, None) => dynasm!(ops ; .arch x64 ; add Rq(rd), Rq(rhs_reg)),
        }

        if use_flags {
            // Pack the host flags into NZCV order: SF/ZF via lahf, CF from
            // the low lahf bit, OF via seto.
            dynasm!(ops
                ; .arch x64
                ; seto r10b
                ; lahf
                ; shr eax, 8
                ; mov r11d, eax
                ; and r11d, 0xC0
                ; shl r11d, 24
                ; and eax, 1
                ; shl eax, 29
                ; or r11d, eax
                ; movzx r10d, r10b
                ; shl r10d, 28
                ; or r11d, r10d
            );
            let mask = flags.nzcv_mask();
            if mask == veloce_types::FlagSet::NZCV.nzcv_mask() {
                dynasm!(ops ; .arch x64 ; mov [r13 + OFF_NZCV], r11d);
            } else {
                dynasm!(ops
                    ; .arch x64
                    ; and r11d, mask as i32
                    ; mov eax, [r13 + OFF_NZCV]
                    ; and eax, !mask as i32
                    ; or eax, r11d
                    ; mov [r13 + OFF_NZCV], eax
                );
            }
        } else {
            truncate(ops, rd, width);
        }
    }

    fn emit_bitwise(
        &mut self,
        alloc: &mut Allocator,
        op: BitOp,
        dst: crate::ir::ValueId,
        lhs: Operand,
        rhs: Operand,
        width: Width,
    ) {
        let rl = self.materialize(alloc, lhs);
        let rr = self.materialize_second(alloc, rhs);
        let rd = alloc.write(&mut self.ops, dst);
        let ops = &mut self.ops;
        dynasm!(ops ; .arch x64 ; mov Rq(rd), Rq(rl));
        match op {
            BitOp::And => dynasm!(ops ; .arch x64 ; and Rq(rd), Rq(rr)),
            BitOp::Orr => dynasm!(ops ; .arch x64 ; or Rq(rd), Rq(rr)),
            BitOp::Eor => dynasm!(ops ; .arch x64 ; xor Rq(rd), Rq(rr)),
        }
        truncate(ops, rd, width);
    }

    fn emit_shift(
        &mut self,
        alloc: &mut Allocator,
        dst: crate::ir::ValueId,
        kind: ShiftType,
        src: Operand,
        amount: Operand,
        width: Width,
    ) {
        match amount {
            Operand::Imm(a) => {
                let rs = self.materialize(alloc, src);
                let rd = alloc.write(&mut self.ops, dst);
                let ops = &mut self.ops;
                let amt = (a % width.bits() as u64) as i8;
                match width {
                    Width::W32 => {
                        dynasm!(ops ; .arch x64 ; mov Rd(rd), Rd(rs));
                        match kind {
                            ShiftType::Lsl => dynasm!(ops ; .arch x64 ; shl Rd(rd), amt),
                            ShiftType::Lsr => dynasm!(ops ; .arch x64 ; shr Rd(rd), amt),
                            ShiftType::Asr => dynasm!(ops ; .arch x64 ; sar Rd(rd), amt),
                            ShiftType::Ror => dynasm!(ops ; .arch x64 ; ror Rd(rd), amt),
                        }
                    }
                    Width::W64 => {
                        dynasm!(ops ; .arch x64 ; mov Rq(rd), Rq(rs));
                        match kind {
                            ShiftType::Lsl => dynasm!(ops ; .arch x64 ; shl Rq(rd), amt),
                            ShiftType::Lsr => dynasm!(ops ; .arch x64 ; shr Rq(rd), amt),
                            ShiftType::Asr => dynasm!(ops ; .arch x64 ; sar Rq(rd), amt),
                            ShiftType::Ror => dynasm!(ops ; .arch x64 ; ror Rq(rd), amt),
                        }
                    }
                    _ => unreachable!("shift width below 32 bits"),
                }
            }
            Operand::Value(v) => {
                // Amount goes to CL first so the later source read cannot
                // land in RCX.
                alloc.read_fixed(&mut self.ops, v, RCX);
                let rs = self.materialize(alloc, src);
                let rd = alloc.write(&mut self.ops, dst);
                let ops = &mut self.ops;
                // The host masks CL to the operand width, which matches the
                // modulo the IR specifies.
                match width {
                    Width::W32 => {
                        dynasm!(ops ; .arch x64 ; mov Rd(rd), Rd(rs));
                        match kind {
                            ShiftType::Lsl => dynasm!(ops ; .arch x64 ; shl Rd(rd), cl),
                            ShiftType::Lsr => dynasm!(ops ; .arch x64 ; shr Rd(rd), cl),
                            ShiftType::Asr => dynasm!(ops ; .arch x64 ; sar Rd(rd), cl),
                            ShiftType::Ror => dynasm!(ops ; .arch x64 ; ror Rd(rd), cl),
                        }
                    }
                    Width::W64 => {
                        dynasm!(ops ; .arch x64 ; mov Rq(rd), Rq(rs));
                        match kind {
                            ShiftType::Lsl => dynasm!(ops ; .arch x64 ; shl Rq(rd), cl),
                            ShiftType::Lsr => dynasm!(ops ; .arch x64 ; shr Rq(rd), cl),
                            ShiftType::Asr => dynasm!(ops ; .arch x64 ; sar Rq(rd), cl),
                            ShiftType::Ror => dynasm!(ops ; .arch x64 ; ror Rq(rd), cl),
                        }
                    }
                    _ => unreachable!("shift width below 32 bits"),
                }
            }
        }
    }

    /// Place an operand in a readable register; immediates go to r10.
    fn materialize(&mut self, alloc: &mut Allocator, op: Operand) -> u8 {
        match op {
            Operand::Value(v) => alloc.read(&mut self.ops, v),
            Operand::Imm(imm) => {
                let ops = &mut self.ops;
                dynasm!(ops ; .arch x64 ; mov r10, QWORD imm as i64);
                super::regalloc::R10
            }
        }
    }

    /// Second-operand variant using r11, so two immediates never collide.
    fn materialize_second(&mut self, alloc: &mut Allocator, op: Operand) -> u8 {
        match op {
            Operand::Value(v) => alloc.read(&mut self.ops, v),
            Operand::Imm(imm) => {
                let ops = &mut self.ops;
                dynasm!(ops ; .arch x64 ; mov r11, QWORD imm as i64);
                super::regalloc::R11
            }
        }
    }

    fn take_result(&mut self, alloc: &mut Allocator, dst: crate::ir::ValueId) {
        let rd = alloc.write(&mut self.ops, dst);
        let ops = &mut self.ops;
        dynasm!(ops ; .arch x64 ; mov Rq(rd), rax);
    }

    fn emit_helper_call(
        &mut self,
        alloc: &mut Allocator,
        func: usize,
        args: &[HelperArg],
        pc: Option<u64>,
        check_fault: bool,
    ) {
        let ops = &mut self.ops;
        if let Some(pc) = pc {
            dynasm!(ops
                ; .arch x64
                ; mov rax, QWORD pc as i64
                ; mov [r13 + OFF_PC], rax
            );
        }
        alloc.spill_for_call(ops);
        for (i, arg) in args.iter().enumerate() {
            let dest = ARG_REGS[i];
            match arg {
                HelperArg::Ctx => dynasm!(ops ; .arch x64 ; mov Rq(dest), r13),
                HelperArg::Imm(imm) => {
                    dynasm!(ops ; .arch x64 ; mov Rq(dest), QWORD *imm as i64)
                }
                HelperArg::Op(op) => match alloc.arg_src(*op) {
                    ArgSrc::Imm(imm) => {
                        dynasm!(ops ; .arch x64 ; mov Rq(dest), QWORD imm as i64)
                    }
                    ArgSrc::Reg(r) => dynasm!(ops ; .arch x64 ; mov Rq(dest), Rq(r)),
                    ArgSrc::Slot(slot) => {
                        dynasm!(ops ; .arch x64 ; mov Rq(dest), [rsp + slot as i32 * 8])
                    }
                },
            }
        }
        dynasm!(ops
            ; .arch x64
            ; mov rax, QWORD func as i64
            ; call rax
        );
        if check_fault {
            dynasm!(ops
                ; .arch x64
                ; cmp DWORD [r13 + OFF_FAULT], 0
                ; jne =>self.exit_fault
            );
        }
    }

    fn emit_terminator(
        &mut self,
        alloc: &mut Allocator,
        term: &Terminator,
        block_id: u32,
        patch_sites: &mut Vec<PatchSite>,
        exceptions: &mut Vec<Exception>,
    ) {
        match *term {
            Terminator::LinkBlock { target } => {
                self.emit_patch_site(patch_sites, block_id, target);
            }
            Terminator::ReturnToDispatch { next_pc } => {
                match next_pc {
                    Operand::Imm(pc) => {
                        let ops = &mut self.ops;
                        dynasm!(ops
                            ; .arch x64
                            ; mov rax, QWORD pc as i64
                            ; mov [r13 + OFF_PC], rax
                        );
                    }
                    Operand::Value(v) => {
                        let rs = alloc.read(&mut self.ops, v);
                        let ops = &mut self.ops;
                        dynasm!(ops ; .arch x64 ; mov [r13 + OFF_PC], Rq(rs));
                    }
                }
                let ops = &mut self.ops;
                dynasm!(ops
                    ; .arch x64
                    ; xor eax, eax
                    ; jmp =>self.exit_restore
                );
            }
            Terminator::If { cond, then_target, else_target } => match cond {
                Operand::Imm(c) => {
                    let target = if c & 1 != 0 { then_target } else { else_target };
                    self.emit_patch_site(patch_sites, block_id, target);
                }
                Operand::Value(v) => {
                    let rc = alloc.read(&mut self.ops, v);
                    {
                        let ops = &mut self.ops;
                        dynasm!(ops
                            ; .arch x64
                            ; test Rq(rc), 1
                            ; jz >not_taken
                        );
                    }
                    self.emit_patch_site(patch_sites, block_id, then_target);
                    {
                        let ops = &mut self.ops;
                        dynasm!(ops ; .arch x64 ; not_taken:);
                    }
                    self.emit_patch_site(patch_sites, block_id, else_target);
                }
            },
            Terminator::Exception { pc, exception } => {
                let index = exceptions.len();
                exceptions.push(exception);
                let word = exit_exception_word(index);
                let ops = &mut self.ops;
                dynasm!(ops
                    ; .arch x64
                    ; mov rax, QWORD pc as i64
                    ; mov [r13 + OFF_PC], rax
                    ; mov rax, QWORD word as i64
                    ; jmp =>self.exit_restore
                );
            }
        }
    }
}

enum BitOp {
    And,
    Orr,
    Eor,
}

fn flag_bit(flag: Flag) -> u32 {
    match flag {
        Flag::N => 31,
        Flag::Z => 30,
        Flag::C => 29,
        Flag::V => 28,
    }
}

fn ctx_field_off(field: CtxField) -> i32 {
    match field {
        CtxField::ThumbBit => OFF_CPSR_THUMB,
        CtxField::ItState => OFF_IT_STATE,
        CtxField::Fpcr => OFF_FPCR,
        CtxField::Fpsr => OFF_FPSR,
    }
}

/// Merge eax (bits already at architectural positions, masked) into the
/// stored NZCV under `mask`. Clobbers r11d.
fn emit_nzcv_merge(ops: &mut Assembler, mask: u32) {
    dynasm!(ops
        ; .arch x64
        ; and eax, mask as i32
        ; mov r11d, [r13 + OFF_NZCV]
        ; and r11d, !mask as i32
        ; or r11d, eax
        ; mov [r13 + OFF_NZCV], r11d
    );
}

/// Zero-extend a register's low `width` bits in place.
fn truncate(ops: &mut Assembler, rd: u8, width: Width) {
    match width {
        Width::W64 => {}
        Width::W32 => dynasm!(ops ; .arch x64 ; mov Rd(rd), Rd(rd)),
        Width::W16 => dynasm!(ops ; .arch x64 ; movzx Rd(rd), Rw(rd)),
        Width::W8 => dynasm!(ops ; .arch x64 ; movzx Rd(rd), Rb(rd)),
    }
}

/// Evaluate `cond` against the stored NZCV; eax ends up 0 or 1. Clobbers
/// r10d and r11d.
fn emit_test_cond(ops: &mut Assembler, cond: Cond) {
    if matches!(cond, Cond::Al | Cond::Nv) {
        dynasm!(ops ; .arch x64 ; mov eax, 1);
        return;
    }
    dynasm!(ops ; .arch x64 ; mov r10d, [r13 + OFF_NZCV]);
    match cond {
        // Single-flag conditions: shift the flag down to bit 0.
        Cond::Eq | Cond::Ne => dynasm!(ops ; .arch x64 ; mov eax, r10d ; shr eax, 30),
        Cond::Cs | Cond::Cc => dynasm!(ops ; .arch x64 ; mov eax, r10d ; shr eax, 29),
        Cond::Mi | Cond::Pl => dynasm!(ops ; .arch x64 ; mov eax, r10d ; shr eax, 31),
        Cond::Vs | Cond::Vc => dynasm!(ops ; .arch x64 ; mov eax, r10d ; shr eax, 28),
        // C && !Z
        Cond::Hi | Cond::Ls => dynasm!(ops
            ; .arch x64
            ; mov eax, r10d
            ; shr eax, 29
            ; mov r11d, r10d
            ; shr r11d, 30
            ; not r11d
            ; and eax, r11d
        ),
        // N ^ V (the base computes "less than"; Ge negates below).
        Cond::Ge | Cond::Lt => dynasm!(ops
            ; .arch x64
            ; mov eax, r10d
            ; shr eax, 31
            ; mov r11d, r10d
            ; shr r11d, 28
            ; xor eax, r11d
        ),
        // Z | (N ^ V) (the base computes "less or equal"; Gt negates).
        Cond::Gt | Cond::Le => dynasm!(ops
            ; .arch x64
            ; mov eax, r10d
            ; shr eax, 31
            ; mov r11d, r10d
            ; shr r11d, 28
            ; xor eax, r11d
            ; mov r11d, r10d
            ; shr r11d, 30
            ; or eax, r11d
        ),
        Cond::Al | Cond::Nv => unreachable!(),
    }
    dynasm!(ops ; .arch x64 ; and eax, 1);
    if matches!(
        cond,
        Cond::Ne | Cond::Cc | Cond::Pl | Cond::Vc | Cond::Ls | Cond::Ge | Cond::Gt
    ) {
        dynasm!(ops ; .arch x64 ; xor eax, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExitCode, EXIT_DISPATCH};
    use veloce_types::FlagSet;

    fn run(arena: &JitArena, ctx: &mut JitContext, code: &CompiledCode) -> u64 {
        unsafe { arena.execute(ctx, code.entry) }
    }

    #[test]
    fn add_block_executes_and_returns_dispatch() {
        let mut block = IrBlock::new(LocationDescriptor(0x1000));
        block.cycle_count = 1;
        let x0 = block.new_value();
        let sum = block.new_value();
        block.push(Inst::GetReg { dst: x0, reg: 0 });
        block.push(Inst::AddWithCarry {
            dst: sum,
            lhs: Operand::Value(x0),
            rhs: Operand::Imm(41),
            carry: Operand::Imm(0),
            width: Width::W64,
            flags: FlagSet::EMPTY,
        });
        block.push(Inst::SetReg { reg: 1, src: Operand::Value(sum) });
        block.terminator = Terminator::ReturnToDispatch {
            next_pc: Operand::Imm(0x2000),
        };

        let mut arena = JitArena::new();
        let mut exceptions = Vec::new();
        let code = arena.compile(&block, 0, 0x1000, &mut exceptions);

        let mut ctx = JitContext::new();
        ctx.regs[0] = 1;
        ctx.remaining = 10;
        ctx.budget_start = 10;
        let word = run(&arena, &mut ctx, &code);
        assert_eq!(word, EXIT_DISPATCH);
        assert_eq!(ctx.regs[1], 42);
        assert_eq!(ctx.pc, 0x2000);
        assert_eq!(ctx.remaining, 9);
    }

    #[test]
    fn flag_setting_subtract_produces_architectural_nzcv() {
        // 5 - 5 through lhs + !rhs + 1: Z and C set, N and V clear.
        let mut block = IrBlock::new(LocationDescriptor(0));
        block.cycle_count = 1;
        let d = block.new_value();
        block.push(Inst::AddWithCarry {
            dst: d,
            lhs: Operand::Imm(5),
            rhs: Operand::Imm(!5u64),
            carry: Operand::Imm(1),
            width: Width::W64,
            flags: FlagSet::NZCV,
        });
        block.push(Inst::SetReg { reg: 0, src: Operand::Value(d) });
        block.terminator = Terminator::ReturnToDispatch { next_pc: Operand::Imm(4) };

        let mut arena = JitArena::new();
        let code = arena.compile(&block, 0, 0, &mut Vec::new());
        let mut ctx = JitContext::new();
        ctx.remaining = 1;
        run(&arena, &mut ctx, &code);
        assert_eq!(ctx.regs[0], 0);
        assert_eq!(ctx.nzcv, 0x6000_0000);
    }

    #[test]
    fn budget_exhaustion_exits_before_executing() {
        let mut block = IrBlock::new(LocationDescriptor(0x40));
        block.cycle_count = 1;
        block.push(Inst::SetReg { reg: 0, src: Operand::Imm(1) });
        block.terminator = Terminator::ReturnToDispatch { next_pc: Operand::Imm(0x44) };

        let mut arena = JitArena::new();
        let code = arena.compile(&block, 0, 0x40, &mut Vec::new());
        let mut ctx = JitContext::new();
        ctx.remaining = 0;
        let word = run(&arena, &mut ctx, &code);
        assert_eq!(ExitCode::decode(word), ExitCode::Budget);
        assert_eq!(ctx.regs[0], 0);
        assert_eq!(ctx.pc, 0x40);
    }

    #[test]
    fn linking_a_static_edge_chains_blocks() {
        let mut first = IrBlock::new(LocationDescriptor(0));
        first.cycle_count = 1;
        first.push(Inst::SetReg { reg: 0, src: Operand::Imm(7) });
        first.terminator = Terminator::LinkBlock {
            target: LocationDescriptor(4),
        };
        let mut second = IrBlock::new(LocationDescriptor(4));
        second.cycle_count = 1;
        second.push(Inst::SetReg { reg: 1, src: Operand::Imm(9) });
        second.terminator = Terminator::ReturnToDispatch { next_pc: Operand::Imm(8) };

        let mut arena = JitArena::new();
        let code_a = arena.compile(&first, 0, 0, &mut Vec::new());
        let code_b = arena.compile(&second, 1, 4, &mut Vec::new());

        let mut ctx = JitContext::new();
        ctx.remaining = 10;
        let word = run(&arena, &mut ctx, &code_a);
        assert_eq!(
            ExitCode::decode(word),
            ExitCode::Link { block_id: 0, slot: 0 }
        );
        assert_eq!(ctx.regs[1], 0);

        arena.link(&code_a.patch_sites[0], code_b.entry_label);
        let mut ctx = JitContext::new();
        ctx.remaining = 10;
        let word = run(&arena, &mut ctx, &code_a);
        assert_eq!(word, EXIT_DISPATCH);
        assert_eq!(ctx.regs[0], 7);
        assert_eq!(ctx.regs[1], 9);
        assert_eq!(ctx.pc, 8);

        // Unlinking restores the original exit.
        arena.unlink(&code_a.patch_sites[0]);
        let mut ctx = JitContext::new();
        ctx.remaining = 10;
        let word = run(&arena, &mut ctx, &code_a);
        assert_eq!(
            ExitCode::decode(word),
            ExitCode::Link { block_id: 0, slot: 0 }
        );
    }

    #[test]
    fn conditional_terminator_selects_edge() {
        let mut block = IrBlock::new(LocationDescriptor(0));
        block.cycle_count = 1;
        let x0 = block.new_value();
        let z = block.new_value();
        block.push(Inst::GetReg { dst: x0, reg: 0 });
        block.push(Inst::IsZero { dst: z, src: Operand::Value(x0), width: Width::W64 });
        block.terminator = Terminator::If {
            cond: Operand::Value(z),
            then_target: LocationDescriptor(0x100),
            else_target: LocationDescriptor(0x200),
        };

        let mut arena = JitArena::new();
        let code = arena.compile(&block, 3, 0, &mut Vec::new());
        assert_eq!(code.patch_sites.len(), 2);
        assert_eq!(code.patch_sites[0].target, LocationDescriptor(0x100));
        assert_eq!(code.patch_sites[1].target, LocationDescriptor(0x200));

        let mut ctx = JitContext::new();
        ctx.remaining = 10;
        let word = run(&arena, &mut ctx, &code);
        assert_eq!(
            ExitCode::decode(word),
            ExitCode::Link { block_id: 3, slot: 0 }
        );

        let mut ctx = JitContext::new();
        ctx.regs[0] = 5;
        ctx.remaining = 10;
        let word = run(&arena, &mut ctx, &code);
        assert_eq!(
            ExitCode::decode(word),
            ExitCode::Link { block_id: 3, slot: 1 }
        );
    }

    #[test]
    fn shifts_and_bit_ops_match_reference() {
        let mut block = IrBlock::new(LocationDescriptor(0));
        block.cycle_count = 1;
        let x0 = block.new_value();
        let shifted = block.new_value();
        let reversed = block.new_value();
        let leading = block.new_value();
        block.push(Inst::GetReg { dst: x0, reg: 0 });
        block.push(Inst::Shift {
            dst: shifted,
            kind: ShiftType::Lsl,
            src: Operand::Value(x0),
            amount: Operand::Imm(4),
            width: Width::W64,
        });
        block.push(Inst::Rev {
            dst: reversed,
            src: Operand::Value(x0),
            width: Width::W64,
        });
        block.push(Inst::Clz {
            dst: leading,
            src: Operand::Value(x0),
            width: Width::W64,
        });
        block.push(Inst::SetReg { reg: 1, src: Operand::Value(shifted) });
        block.push(Inst::SetReg { reg: 2, src: Operand::Value(reversed) });
        block.push(Inst::SetReg { reg: 3, src: Operand::Value(leading) });
        block.terminator = Terminator::ReturnToDispatch { next_pc: Operand::Imm(4) };

        let mut arena = JitArena::new();
        let code = arena.compile(&block, 0, 0, &mut Vec::new());
        let mut ctx = JitContext::new();
        ctx.regs[0] = 0x0011_2233_4455_6677;
        ctx.remaining = 10;
        run(&arena, &mut ctx, &code);
        assert_eq!(ctx.regs[1], 0x0112_2334_4556_6770);
        assert_eq!(ctx.regs[2], 0x7766_5544_3322_1100);
        assert_eq!(ctx.regs[3], 11);
    }

    #[test]
    fn clz_of_zero_is_width() {
        let mut block = IrBlock::new(LocationDescriptor(0));
        block.cycle_count = 1;
        let c = block.new_value();
        block.push(Inst::Clz { dst: c, src: Operand::Imm(0), width: Width::W32 });
        block.push(Inst::SetReg { reg: 0, src: Operand::Value(c) });
        block.terminator = Terminator::ReturnToDispatch { next_pc: Operand::Imm(4) };

        let mut arena = JitArena::new();
        let code = arena.compile(&block, 0, 0, &mut Vec::new());
        let mut ctx = JitContext::new();
        ctx.remaining = 1;
        run(&arena, &mut ctx, &code);
        assert_eq!(ctx.regs[0], 32);
    }

    #[test]
    fn entry_guard_takes_fail_edge_and_stores_it_state() {
        let mut block = IrBlock::new(LocationDescriptor(0));
        block.cycle_count = 1;
        block.entry_cond = Cond::Eq;
        block.cond_fail_target = Some(LocationDescriptor(0x80));
        block.cond_fail_it = Some(0x10);
        block.push(Inst::SetReg { reg: 0, src: Operand::Imm(1) });
        block.terminator = Terminator::LinkBlock {
            target: LocationDescriptor(0x40),
        };

        let mut arena = JitArena::new();
        let code = arena.compile(&block, 0, 0, &mut Vec::new());
        // Z clear: the guard fails, the body is skipped, ITSTATE advances.
        let mut ctx = JitContext::new();
        ctx.remaining = 10;
        let word = run(&arena, &mut ctx, &code);
        assert_eq!(
            ExitCode::decode(word),
            ExitCode::Link { block_id: 0, slot: 0 }
        );
        assert_eq!(code.patch_sites[0].target, LocationDescriptor(0x80));
        assert_eq!(ctx.regs[0], 0);
        assert_eq!(ctx.it_state, 0x10);

        // Z set: the body runs and the terminator edge is taken.
        let mut ctx = JitContext::new();
        ctx.remaining = 10;
        ctx.nzcv = 0x4000_0000;
        let word = run(&arena, &mut ctx, &code);
        assert_eq!(
            ExitCode::decode(word),
            ExitCode::Link { block_id: 0, slot: 1 }
        );
        assert_eq!(ctx.regs[0], 1);
    }
}
