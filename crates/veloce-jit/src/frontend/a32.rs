//! A32 decoder and translator (ARM and Thumb-16 encodings).
//!
//! ARM blocks group a run of equally conditional instructions behind one
//! entry guard; the run ends when the condition changes or a guarded
//! instruction writes flags. Thumb IT blocks translate one instruction per
//! block with ITSTATE carried in the location key. Reads of R15 resolve to
//! constants here, so the IR never sees the pipeline offset.
//!
//! Register-shifted-register data-processing forms and the 32-bit Thumb
//! encoding space are not decoded and raise an undefined-instruction
//! exception.

use veloce_types::{Cond, Flag, FlagSet, MemSize, ShiftType, Width};

use crate::callbacks::{Exception, Memory};
use crate::frontend::{
    a32_location_fp, a32_location_it, a32_location_pc, a32_location_raw, a32_location_thumb,
    DecodeRow,
};
use crate::ir::{CtxField, Inst, IrBlock, LocationDescriptor, Operand, Terminator, ValueId};

/// Translate one block starting at `loc`, decoding at most `max_insts`
/// guest instructions.
pub fn translate(mem: &mut dyn Memory, loc: LocationDescriptor, max_insts: usize) -> IrBlock {
    let mut xl = Xl {
        block: IrBlock::new(loc),
        mem,
        pc: a32_location_pc(loc),
        thumb: a32_location_thumb(loc),
        it_state: a32_location_it(loc),
        fp_key: a32_location_fp(loc),
        term: None,
        wrote_flags: false,
        in_it: false,
    };
    if xl.thumb {
        translate_thumb(&mut xl, max_insts);
    } else {
        translate_arm(&mut xl, max_insts);
    }
    let mut block = xl.block;
    block.terminator = xl.term.expect("translation loop exits with a terminator");
    block.guest_start = a32_location_pc(loc) as u64;
    let inst_bytes = if a32_location_thumb(loc) { 2 } else { 4 };
    block.guest_len = (block.cycle_count * inst_bytes).max(inst_bytes);
    block.update_flags();
    block
}

fn translate_arm(xl: &mut Xl, max_insts: usize) {
    let mut group_cond: Option<Cond> = None;
    while xl.term.is_none() {
        if xl.block.cycle_count as usize >= max_insts {
            let target = xl.loc(xl.pc);
            xl.end(Terminator::LinkBlock { target });
            break;
        }
        let Some(word) = xl.mem.read_code32(xl.pc as u64) else {
            xl.end(Terminator::Exception {
                pc: xl.pc as u64,
                exception: Exception::InstructionAbort,
            });
            break;
        };
        // cond=1111 is the unconditional space, grouped like AL.
        let nv = word >> 28 == 0xf;
        let cond = if nv {
            Cond::Al
        } else {
            Cond::from_bits((word >> 28) as u8)
        };
        match group_cond {
            None => {
                group_cond = Some(cond);
                xl.block.entry_cond = cond;
            }
            Some(c) if c != cond => {
                let target = xl.loc(xl.pc);
                xl.end(Terminator::LinkBlock { target });
                break;
            }
            Some(_) => {}
        }

        xl.block.cycle_count += 1;
        xl.wrote_flags = false;
        let table = if nv { ARM_NV_TABLE } else { ARM_TABLE };
        match crate::frontend::lookup(table, word) {
            Some(handler) => handler(xl, word),
            None => xl.undefined(word),
        }
        xl.pc = xl.pc.wrapping_add(4);

        // A guarded flag write may change whether the guard itself holds,
        // so the next same-condition instruction starts a new block.
        if xl.term.is_none() && xl.block.entry_cond != Cond::Al && xl.wrote_flags {
            let target = xl.loc(xl.pc);
            xl.end(Terminator::LinkBlock { target });
        }
    }
    if xl.block.entry_cond != Cond::Al {
        xl.block.cond_fail_target = Some(xl.loc(xl.pc));
    }
}

fn translate_thumb(xl: &mut Xl, max_insts: usize) {
    if xl.it_state & 0xf != 0 {
        return translate_thumb_in_it(xl);
    }
    while xl.term.is_none() {
        if xl.block.cycle_count as usize >= max_insts {
            let target = xl.loc(xl.pc);
            xl.end(Terminator::LinkBlock { target });
            break;
        }
        let Some(half) = xl.mem.read_code16(xl.pc as u64) else {
            xl.end(Terminator::Exception {
                pc: xl.pc as u64,
                exception: Exception::InstructionAbort,
            });
            break;
        };
        xl.block.cycle_count += 1;
        match crate::frontend::lookup(THUMB_TABLE, half as u32) {
            Some(handler) => handler(xl, half as u32),
            None => xl.undefined(half as u32),
        }
        xl.pc = xl.pc.wrapping_add(2);
    }
}

// One instruction per block inside an IT run: the condition comes from
// ITSTATE, the advanced ITSTATE is stored on both the taken and the
// guard-fail path, and the successor key carries the advanced state.
fn translate_thumb_in_it(xl: &mut Xl) {
    let cond = Cond::from_bits(xl.it_state >> 4);
    let next = it_advance(xl.it_state);
    xl.block.entry_cond = cond;
    xl.block.cond_fail_it = Some(next);
    xl.it_state = next;
    xl.in_it = true;
    xl.push(Inst::SetCtxField {
        field: CtxField::ItState,
        src: Operand::Imm(next as u64),
    });

    let Some(half) = xl.mem.read_code16(xl.pc as u64) else {
        xl.end(Terminator::Exception {
            pc: xl.pc as u64,
            exception: Exception::InstructionAbort,
        });
        xl.block.cond_fail_target = Some(xl.loc(xl.pc.wrapping_add(2)));
        return;
    };
    xl.block.cycle_count = 1;
    match crate::frontend::lookup(THUMB_TABLE, half as u32) {
        Some(handler) => handler(xl, half as u32),
        None => xl.undefined(half as u32),
    }
    xl.pc = xl.pc.wrapping_add(2);
    if xl.term.is_none() {
        let target = xl.loc(xl.pc);
        xl.end(Terminator::LinkBlock { target });
    }
    if !cond.is_unconditional() {
        xl.block.cond_fail_target = Some(xl.loc(xl.pc));
    }
}

/// ITAdvance: shift the mask, clearing the state when the run ends.
fn it_advance(it: u8) -> u8 {
    if it & 0x7 == 0 {
        0
    } else {
        (it & 0xe0) | (it << 1 & 0x1f)
    }
}

struct Xl<'m> {
    block: IrBlock,
    mem: &'m mut dyn Memory,
    pc: u32,
    thumb: bool,
    it_state: u8,
    fp_key: u64,
    term: Option<Terminator>,
    wrote_flags: bool,
    in_it: bool,
}

type Handler = for<'a, 'm> fn(&'a mut Xl<'m>, u32);

static ARM_TABLE: &[DecodeRow<Handler>] = &[
    DecodeRow { mask: 0x0fff_fff0, value: 0x012f_ff10, handler: arm_bx },
    DecodeRow { mask: 0x0fff_fff0, value: 0x012f_ff30, handler: arm_blx_reg },
    DecodeRow { mask: 0x0ff0_0fff, value: 0x0190_0f9f, handler: arm_ldrex },
    DecodeRow { mask: 0x0ff0_0ff0, value: 0x0180_0f90, handler: arm_strex },
    DecodeRow { mask: 0x0ff0_0000, value: 0x0300_0000, handler: arm_movw },
    DecodeRow { mask: 0x0ff0_0000, value: 0x0340_0000, handler: arm_movt },
    DecodeRow { mask: 0x0ff0_00f0, value: 0x0770_00f0, handler: arm_udf },
    DecodeRow { mask: 0x0e00_0010, value: 0x0000_0000, handler: arm_dp_reg },
    DecodeRow { mask: 0x0e00_0000, value: 0x0200_0000, handler: arm_dp_imm },
    DecodeRow { mask: 0x0e00_0000, value: 0x0400_0000, handler: arm_ldst_imm },
    DecodeRow { mask: 0x0e00_0010, value: 0x0600_0000, handler: arm_ldst_reg },
    DecodeRow { mask: 0x0e00_0000, value: 0x0a00_0000, handler: arm_b_bl },
    DecodeRow { mask: 0x0f00_0000, value: 0x0f00_0000, handler: arm_svc },
];

// cond=1111 space.
static ARM_NV_TABLE: &[DecodeRow<Handler>] = &[DecodeRow {
    mask: 0xffff_ffff,
    value: 0xf57f_f01f,
    handler: arm_clrex,
}];

impl<'m> Xl<'m> {
    fn val(&mut self) -> ValueId {
        self.block.new_value()
    }

    fn push(&mut self, inst: Inst) {
        self.block.push(inst);
    }

    fn end(&mut self, term: Terminator) {
        self.term = Some(term);
    }

    fn loc(&self, pc: u32) -> LocationDescriptor {
        a32_location_raw(pc, self.thumb, self.it_state, self.fp_key)
    }

    fn undefined(&mut self, word: u32) {
        self.end(Terminator::Exception {
            pc: self.pc as u64,
            exception: Exception::UndefinedInstruction { opcode: word },
        });
    }

    /// Reads of R15 yield the pipeline-offset PC as a constant.
    fn read_reg(&mut self, reg: u32) -> Operand {
        if reg == 15 {
            let offset = if self.thumb { 4 } else { 8 };
            return Operand::Imm(self.pc.wrapping_add(offset) as u64);
        }
        let dst = self.val();
        self.push(Inst::GetReg { dst, reg: reg as u8 });
        Operand::Value(dst)
    }

    fn write_reg(&mut self, reg: u32, src: Operand) {
        debug_assert_ne!(reg, 15, "PC writes go through a branch helper");
        self.push(Inst::SetReg { reg: reg as u8, src });
    }

    /// BXWritePC: bit 0 selects the instruction set.
    fn write_pc_interworking(&mut self, value: Operand) {
        let bit = self.and(value, Operand::Imm(1));
        self.push(Inst::SetCtxField {
            field: CtxField::ThumbBit,
            src: bit,
        });
        let addr = self.and(value, Operand::Imm(0xffff_fffe));
        self.end(Terminator::ReturnToDispatch { next_pc: addr });
    }

    /// BranchWritePC: stay in the current instruction set.
    fn write_pc_branch(&mut self, value: Operand) {
        let mask = if self.thumb { 0xffff_fffe } else { 0xffff_fffc };
        let addr = self.and(value, Operand::Imm(mask));
        self.end(Terminator::ReturnToDispatch { next_pc: addr });
    }

    fn add_op(
        &mut self,
        lhs: Operand,
        rhs: Operand,
        carry: Operand,
        flags: FlagSet,
    ) -> Operand {
        let dst = self.val();
        self.push(Inst::AddWithCarry {
            dst,
            lhs,
            rhs,
            carry,
            width: Width::W32,
            flags,
        });
        Operand::Value(dst)
    }

    fn and(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        let dst = self.val();
        self.push(Inst::And {
            dst,
            lhs,
            rhs,
            width: Width::W32,
        });
        Operand::Value(dst)
    }

    fn and64(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        let dst = self.val();
        self.push(Inst::And {
            dst,
            lhs,
            rhs,
            width: Width::W64,
        });
        Operand::Value(dst)
    }

    fn orr(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        let dst = self.val();
        self.push(Inst::Orr {
            dst,
            lhs,
            rhs,
            width: Width::W32,
        });
        Operand::Value(dst)
    }

    fn eor(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        let dst = self.val();
        self.push(Inst::Eor {
            dst,
            lhs,
            rhs,
            width: Width::W32,
        });
        Operand::Value(dst)
    }

    fn not_op(&mut self, src: Operand) -> Operand {
        self.eor(src, Operand::Imm(0xffff_ffff))
    }

    fn shift_w(&mut self, kind: ShiftType, src: Operand, amount: Operand, width: Width) -> Operand {
        let dst = self.val();
        self.push(Inst::Shift {
            dst,
            kind,
            src,
            amount,
            width,
        });
        Operand::Value(dst)
    }

    fn test_cond(&mut self, cond: Cond) -> Operand {
        let dst = self.val();
        self.push(Inst::TestCond { dst, cond });
        Operand::Value(dst)
    }

    fn is_zero(&mut self, src: Operand, width: Width) -> Operand {
        let dst = self.val();
        self.push(Inst::IsZero { dst, src, width });
        Operand::Value(dst)
    }

    fn select(&mut self, cond: Operand, if_true: Operand, if_false: Operand) -> Operand {
        let dst = self.val();
        self.push(Inst::Select {
            dst,
            cond,
            if_true,
            if_false,
        });
        Operand::Value(dst)
    }

    fn carry_in(&mut self) -> Operand {
        let nzcv = self.val();
        self.push(Inst::GetNzcv { dst: nzcv });
        self.shift_w(
            ShiftType::Lsr,
            Operand::Value(nzcv),
            Operand::Imm(Flag::C.bit() as u64),
            Width::W32,
        )
    }

    fn set_nz(&mut self, result: Operand) {
        self.push(Inst::SetNzFromValue {
            src: result,
            width: Width::W32,
            flags: FlagSet::NZ,
        });
        self.wrote_flags = true;
    }

    fn set_carry(&mut self, carry: Operand) {
        self.push(Inst::SetFlag {
            flag: Flag::C,
            src: carry,
        });
        self.wrote_flags = true;
    }

    /// Current-mode "next instruction" address with the Thumb LR bit.
    fn link_value(&self, next: u32) -> u64 {
        if self.thumb {
            (next | 1) as u64
        } else {
            next as u64
        }
    }

    fn load(&mut self, addr: Operand, size: MemSize) -> Operand {
        let dst = self.val();
        self.push(Inst::Load {
            dst,
            addr,
            size,
            pc: self.pc as u64,
        });
        Operand::Value(dst)
    }

    fn store(&mut self, addr: Operand, src: Operand, size: MemSize) {
        self.push(Inst::Store {
            addr,
            src,
            size,
            pc: self.pc as u64,
        });
    }

    /// Sign-extend the low `bits` of a 32-bit value.
    fn sext32(&mut self, src: Operand, bits: u32) -> Operand {
        let up = self.shift_w(
            ShiftType::Lsl,
            src,
            Operand::Imm((32 - bits) as u64),
            Width::W32,
        );
        self.shift_w(
            ShiftType::Asr,
            up,
            Operand::Imm((32 - bits) as u64),
            Width::W32,
        )
    }
}

fn sext_imm(value: u32, bits: u32) -> u32 {
    let shift = 32 - bits;
    ((value << shift) as i32 >> shift) as u32
}

// Immediate-shift operand decoding shared by ARM data-processing and
// load/store offsets. `imm5 == 0` encodes LSR #32, ASR #32 and RRX.
struct Shifted {
    value: Operand,
    /// Shifter carry-out, when it differs from the incoming C flag.
    carry: Option<Operand>,
}

fn arm_shifted_reg(xl: &mut Xl, word: u32, want_carry: bool) -> Shifted {
    let rm = word & 0xf;
    let imm5 = word >> 7 & 0x1f;
    let kind = ShiftType::from_bits((word >> 5) as u8);
    let src = xl.read_reg(rm);
    let carry_bit = |xl: &mut Xl, bit: u64| {
        let shifted = xl.shift_w(ShiftType::Lsr, src, Operand::Imm(bit), Width::W32);
        Some(xl.and(shifted, Operand::Imm(1)))
    };
    match (kind, imm5) {
        (ShiftType::Lsl, 0) => Shifted { value: src, carry: None },
        (ShiftType::Lsl, n) => {
            let value = xl.shift_w(ShiftType::Lsl, src, Operand::Imm(n as u64), Width::W32);
            let carry = if want_carry { carry_bit(xl, (32 - n) as u64) } else { None };
            Shifted { value, carry }
        }
        (ShiftType::Lsr, 0) => {
            let carry = if want_carry { carry_bit(xl, 31) } else { None };
            Shifted { value: Operand::Imm(0), carry }
        }
        (ShiftType::Lsr, n) => {
            let value = xl.shift_w(ShiftType::Lsr, src, Operand::Imm(n as u64), Width::W32);
            let carry = if want_carry { carry_bit(xl, (n - 1) as u64) } else { None };
            Shifted { value, carry }
        }
        (ShiftType::Asr, 0) => {
            // ASR #32: every result bit is the sign.
            let value = xl.shift_w(ShiftType::Asr, src, Operand::Imm(31), Width::W32);
            let carry = if want_carry { carry_bit(xl, 31) } else { None };
            Shifted { value, carry }
        }
        (ShiftType::Asr, n) => {
            let value = xl.shift_w(ShiftType::Asr, src, Operand::Imm(n as u64), Width::W32);
            let carry = if want_carry { carry_bit(xl, (n - 1) as u64) } else { None };
            Shifted { value, carry }
        }
        (ShiftType::Ror, 0) => {
            // RRX.
            let c = xl.carry_in();
            let high = xl.shift_w(ShiftType::Lsl, c, Operand::Imm(31), Width::W32);
            let low = xl.shift_w(ShiftType::Lsr, src, Operand::Imm(1), Width::W32);
            let value = xl.orr(high, low);
            let carry = if want_carry { Some(xl.and(src, Operand::Imm(1))) } else { None };
            Shifted { value, carry }
        }
        (ShiftType::Ror, n) => {
            let value = xl.shift_w(ShiftType::Ror, src, Operand::Imm(n as u64), Width::W32);
            let carry = if want_carry { carry_bit(xl, (n - 1) as u64) } else { None };
            Shifted { value, carry }
        }
    }
}

fn arm_expand_imm(word: u32) -> (u32, Option<bool>) {
    let imm8 = word & 0xff;
    let rotate = (word >> 8 & 0xf) * 2;
    let value = imm8.rotate_right(rotate);
    let carry = if rotate == 0 { None } else { Some(value >> 31 != 0) };
    (value, carry)
}

fn arm_dp_reg(xl: &mut Xl, word: u32) {
    let opcode = word >> 21 & 0xf;
    let set_flags = word >> 20 & 1 != 0;
    let want_carry = set_flags && matches!(opcode, 0 | 1 | 8 | 9 | 12 | 13 | 14 | 15);
    let shifted = arm_shifted_reg(xl, word, want_carry);
    arm_dp_common(xl, word, shifted.value, shifted.carry);
}

fn arm_dp_imm(xl: &mut Xl, word: u32) {
    let (imm, rot_carry) = arm_expand_imm(word);
    let opcode = word >> 21 & 0xf;
    let set_flags = word >> 20 & 1 != 0;
    let want_carry = set_flags && matches!(opcode, 0 | 1 | 8 | 9 | 12 | 13 | 14 | 15);
    let carry = match rot_carry {
        Some(c) if want_carry => Some(Operand::Imm(c as u64)),
        _ => None,
    };
    arm_dp_common(xl, word, Operand::Imm(imm as u64), carry);
}

fn arm_dp_common(xl: &mut Xl, word: u32, op2: Operand, shifter_carry: Option<Operand>) {
    let opcode = word >> 21 & 0xf;
    let set_flags = word >> 20 & 1 != 0;
    let rn = word >> 16 & 0xf;
    let rd = word >> 12 & 0xf;

    // Compare/test opcodes without S are MRS/MSR and friends.
    if matches!(opcode, 8..=11) && !set_flags {
        return xl.undefined(word);
    }
    if set_flags && rd == 15 {
        return xl.undefined(word);
    }

    let flags = if set_flags { FlagSet::NZCV } else { FlagSet::EMPTY };
    let result = match opcode {
        0 | 8 => {
            let lhs = xl.read_reg(rn);
            xl.and(lhs, op2)
        }
        1 | 9 => {
            let lhs = xl.read_reg(rn);
            xl.eor(lhs, op2)
        }
        2 | 10 => {
            let lhs = xl.read_reg(rn);
            let rhs = xl.not_op(op2);
            xl.add_op(lhs, rhs, Operand::Imm(1), flags)
        }
        3 => {
            let lhs = xl.read_reg(rn);
            let inv = xl.not_op(lhs);
            xl.add_op(op2, inv, Operand::Imm(1), flags)
        }
        4 | 11 => {
            let lhs = xl.read_reg(rn);
            xl.add_op(lhs, op2, Operand::Imm(0), flags)
        }
        5 => {
            let lhs = xl.read_reg(rn);
            let c = xl.carry_in();
            xl.add_op(lhs, op2, c, flags)
        }
        6 => {
            let lhs = xl.read_reg(rn);
            let rhs = xl.not_op(op2);
            let c = xl.carry_in();
            xl.add_op(lhs, rhs, c, flags)
        }
        7 => {
            let lhs = xl.read_reg(rn);
            let inv = xl.not_op(lhs);
            let c = xl.carry_in();
            xl.add_op(op2, inv, c, flags)
        }
        12 => {
            let lhs = xl.read_reg(rn);
            xl.orr(lhs, op2)
        }
        13 => op2,
        14 => {
            let lhs = xl.read_reg(rn);
            let inv = xl.not_op(op2);
            xl.and(lhs, inv)
        }
        _ => xl.not_op(op2),
    };

    let is_logical = matches!(opcode, 0 | 1 | 8 | 9 | 12 | 13 | 14 | 15);
    if set_flags {
        if is_logical {
            xl.set_nz(result);
            if let Some(c) = shifter_carry {
                xl.set_carry(c);
            }
        }
        xl.wrote_flags = true;
    }

    // Compare/test opcodes have no destination.
    if matches!(opcode, 8..=11) {
        return;
    }
    if rd == 15 {
        xl.write_pc_interworking(result);
    } else {
        xl.write_reg(rd, result);
    }
}

fn arm_movw(xl: &mut Xl, word: u32) {
    let imm = (word >> 4 & 0xf000) | (word & 0xfff);
    let rd = word >> 12 & 0xf;
    if rd == 15 {
        return xl.undefined(word);
    }
    xl.write_reg(rd, Operand::Imm(imm as u64));
}

fn arm_movt(xl: &mut Xl, word: u32) {
    let imm = (word >> 4 & 0xf000) | (word & 0xfff);
    let rd = word >> 12 & 0xf;
    if rd == 15 {
        return xl.undefined(word);
    }
    let old = xl.read_reg(rd);
    let low = xl.and(old, Operand::Imm(0xffff));
    let result = xl.orr(low, Operand::Imm((imm as u64) << 16));
    xl.write_reg(rd, result);
}

fn arm_b_bl(xl: &mut Xl, word: u32) {
    let offset = sext_imm(word & 0x00ff_ffff, 24) << 2;
    if word >> 24 & 1 != 0 {
        let ret = xl.link_value(xl.pc.wrapping_add(4));
        xl.write_reg(14, Operand::Imm(ret));
    }
    let target = xl.loc(xl.pc.wrapping_add(8).wrapping_add(offset));
    xl.end(Terminator::LinkBlock { target });
}

fn arm_bx(xl: &mut Xl, word: u32) {
    let target = xl.read_reg(word & 0xf);
    xl.write_pc_interworking(target);
}

fn arm_blx_reg(xl: &mut Xl, word: u32) {
    let target = xl.read_reg(word & 0xf);
    let ret = xl.link_value(xl.pc.wrapping_add(4));
    xl.write_reg(14, Operand::Imm(ret));
    xl.write_pc_interworking(target);
}

// LDR/STR/LDRB/STRB with an immediate offset, including pre/post-indexed
// writeback. The translation forms (LDRT and friends) are not decoded.
fn arm_ldst_imm(xl: &mut Xl, word: u32) {
    let offset = Operand::Imm((word & 0xfff) as u64);
    arm_ldst_common(xl, word, offset);
}

fn arm_ldst_reg(xl: &mut Xl, word: u32) {
    let shifted = arm_shifted_reg(xl, word, false);
    arm_ldst_common(xl, word, shifted.value);
}

fn arm_ldst_common(xl: &mut Xl, word: u32, offset: Operand) {
    let pre = word >> 24 & 1 != 0;
    let up = word >> 23 & 1 != 0;
    let byte = word >> 22 & 1 != 0;
    let writeback = word >> 21 & 1 != 0;
    let load = word >> 20 & 1 != 0;
    let rn = word >> 16 & 0xf;
    let rt = word >> 12 & 0xf;
    if !pre && writeback {
        return xl.undefined(word);
    }
    if (writeback || !pre) && (rn == 15 || rn == rt) {
        return xl.undefined(word);
    }

    let base = xl.read_reg(rn);
    let indexed = if up {
        xl.add_op(base, offset, Operand::Imm(0), FlagSet::EMPTY)
    } else {
        let inv = xl.not_op(offset);
        xl.add_op(base, inv, Operand::Imm(1), FlagSet::EMPTY)
    };
    let addr = if pre { indexed } else { base };
    let size = if byte { MemSize::U8 } else { MemSize::U32 };

    if load {
        let value = xl.load(addr, size);
        if writeback || !pre {
            xl.write_reg(rn, indexed);
        }
        if rt == 15 {
            xl.write_pc_interworking(value);
        } else {
            xl.write_reg(rt, value);
        }
    } else {
        let src = xl.read_reg(rt);
        xl.store(addr, src, size);
        if writeback || !pre {
            xl.write_reg(rn, indexed);
        }
    }
}

fn arm_ldrex(xl: &mut Xl, word: u32) {
    let rn = word >> 16 & 0xf;
    let rt = word >> 12 & 0xf;
    if rn == 15 || rt == 15 {
        return xl.undefined(word);
    }
    let addr = xl.read_reg(rn);
    let dst = xl.val();
    xl.push(Inst::LoadExclusive {
        dst,
        addr,
        size: MemSize::U32,
        pc: xl.pc as u64,
    });
    xl.write_reg(rt, Operand::Value(dst));
}

fn arm_strex(xl: &mut Xl, word: u32) {
    let rn = word >> 16 & 0xf;
    let rd = word >> 12 & 0xf;
    let rt = word & 0xf;
    if rn == 15 || rd == 15 || rt == 15 || rd == rn || rd == rt {
        return xl.undefined(word);
    }
    let addr = xl.read_reg(rn);
    let src = xl.read_reg(rt);
    let dst = xl.val();
    xl.push(Inst::StoreExclusive {
        dst,
        addr,
        src,
        size: MemSize::U32,
        pc: xl.pc as u64,
    });
    xl.write_reg(rd, Operand::Value(dst));
}

fn arm_clrex(xl: &mut Xl, _word: u32) {
    xl.push(Inst::ClearExclusive);
}

fn arm_svc(xl: &mut Xl, word: u32) {
    xl.push(Inst::CallSupervisor {
        imm: word & 0x00ff_ffff,
        pc: xl.pc as u64,
    });
    let target = xl.loc(xl.pc.wrapping_add(4));
    xl.end(Terminator::LinkBlock { target });
}

fn arm_udf(xl: &mut Xl, word: u32) {
    xl.undefined(word);
}

static THUMB_TABLE: &[DecodeRow<Handler>] = &[
    DecodeRow { mask: 0xff00, value: 0xbf00, handler: thumb_it_hints },
    DecodeRow { mask: 0xf500, value: 0xb100, handler: thumb_cbz },
    DecodeRow { mask: 0xff00, value: 0xb000, handler: thumb_adjust_sp },
    DecodeRow { mask: 0xff00, value: 0xb200, handler: thumb_extend },
    DecodeRow { mask: 0xff00, value: 0xba00, handler: thumb_rev },
    DecodeRow { mask: 0xfe00, value: 0xb400, handler: thumb_push },
    DecodeRow { mask: 0xfe00, value: 0xbc00, handler: thumb_pop },
    DecodeRow { mask: 0xfc00, value: 0x4000, handler: thumb_dp_reg },
    DecodeRow { mask: 0xfc00, value: 0x4400, handler: thumb_special_data },
    DecodeRow { mask: 0xf800, value: 0x4800, handler: thumb_ldr_literal },
    DecodeRow { mask: 0xf000, value: 0x5000, handler: thumb_ldst_reg },
    DecodeRow { mask: 0xe000, value: 0x6000, handler: thumb_ldst_imm5 },
    DecodeRow { mask: 0xf000, value: 0x8000, handler: thumb_ldst_half },
    DecodeRow { mask: 0xf000, value: 0x9000, handler: thumb_ldst_sp },
    DecodeRow { mask: 0xf800, value: 0xa000, handler: thumb_adr },
    DecodeRow { mask: 0xf800, value: 0xa800, handler: thumb_add_sp_imm },
    DecodeRow { mask: 0xe000, value: 0x0000, handler: thumb_shift_add_sub },
    DecodeRow { mask: 0xe000, value: 0x2000, handler: thumb_imm8 },
    DecodeRow { mask: 0xf000, value: 0xd000, handler: thumb_b_cond },
    DecodeRow { mask: 0xf800, value: 0xe000, handler: thumb_b },
];

// Thumb variable-shift flag semantics need the carry for any amount in
// 0..=255, built branchlessly from 64-bit shifts with a clamped amount.
fn thumb_var_shift(xl: &mut Xl, kind: ShiftType, src: Operand, rs: u32) -> (Operand, Operand) {
    let amount_reg = xl.read_reg(rs);
    let amount = xl.and(amount_reg, Operand::Imm(0xff));
    let amount_zero = xl.is_zero(amount, Width::W64);
    let old_c = xl.carry_in();

    if kind == ShiftType::Ror {
        let amt5 = xl.and(amount, Operand::Imm(31));
        let result = xl.shift_w(ShiftType::Ror, src, amt5, Width::W32);
        let am1 = xl.add_op64(amount, Operand::Imm(u64::MAX));
        let am1_31 = xl.and64(am1, Operand::Imm(31));
        let bit = xl.shift_w(ShiftType::Lsr, src, am1_31, Width::W32);
        let bit = xl.and(bit, Operand::Imm(1));
        let carry = xl.select(amount_zero, old_c, bit);
        return (result, carry);
    }

    // Clamp to 63: wider amounts shift everything out either way.
    let high = xl.shift_w(ShiftType::Lsr, amount, Operand::Imm(6), Width::W64);
    let small = xl.is_zero(high, Width::W64);
    let clamped = xl.select(small, amount, Operand::Imm(63));

    let (wide, carry_bit) = match kind {
        ShiftType::Lsl => {
            let wide = xl.shift_w(ShiftType::Lsl, src, clamped, Width::W64);
            let c = xl.shift_w(ShiftType::Lsr, wide, Operand::Imm(32), Width::W64);
            (wide, c)
        }
        ShiftType::Lsr | ShiftType::Asr => {
            let signed = if kind == ShiftType::Asr {
                let up = xl.shift_w(ShiftType::Lsl, src, Operand::Imm(32), Width::W64);
                xl.shift_w(ShiftType::Asr, up, Operand::Imm(32), Width::W64)
            } else {
                src
            };
            let wide = xl.shift_w(kind, signed, clamped, Width::W64);
            let am1 = xl.add_op64(clamped, Operand::Imm(u64::MAX));
            let c = xl.shift_w(kind, signed, am1, Width::W64);
            (wide, c)
        }
        ShiftType::Ror => unreachable!(),
    };
    let result32 = xl.and64(wide, Operand::Imm(0xffff_ffff));
    let bit = xl.and64(carry_bit, Operand::Imm(1));
    let result = xl.select(amount_zero, src, result32);
    let carry = xl.select(amount_zero, old_c, bit);
    (result, carry)
}

impl<'m> Xl<'m> {
    fn add_op64(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        let dst = self.val();
        self.push(Inst::AddWithCarry {
            dst,
            lhs,
            rhs,
            carry: Operand::Imm(0),
            width: Width::W64,
            flags: FlagSet::EMPTY,
        });
        Operand::Value(dst)
    }
}

fn thumb_shift_add_sub(xl: &mut Xl, half: u32) {
    let rd = half & 0x7;
    let rn = half >> 3 & 0x7;
    let set_flags = !xl.in_it;
    let flags = if set_flags { FlagSet::NZCV } else { FlagSet::EMPTY };
    match half >> 11 & 0x3 {
        0b11 => {
            // ADD/SUB register or 3-bit immediate.
            let sub = half >> 9 & 1 != 0;
            let lhs = xl.read_reg(rn);
            let rhs = if half >> 10 & 1 != 0 {
                Operand::Imm((half >> 6 & 0x7) as u64)
            } else {
                xl.read_reg(half >> 6 & 0x7)
            };
            let result = if sub {
                let inv = xl.not_op(rhs);
                xl.add_op(lhs, inv, Operand::Imm(1), flags)
            } else {
                xl.add_op(lhs, rhs, Operand::Imm(0), flags)
            };
            xl.wrote_flags |= set_flags;
            xl.write_reg(rd, result);
        }
        op => {
            let kind = match op {
                0b00 => ShiftType::Lsl,
                0b01 => ShiftType::Lsr,
                _ => ShiftType::Asr,
            };
            let imm5 = half >> 6 & 0x1f;
            let src = xl.read_reg(rn);
            // imm5 == 0 encodes a 32-position shift for LSR/ASR.
            let (result, carry) = match (kind, imm5) {
                (ShiftType::Lsl, 0) => (src, None),
                (ShiftType::Lsl, n) => {
                    let r = xl.shift_w(kind, src, Operand::Imm(n as u64), Width::W32);
                    let c = xl.shift_w(ShiftType::Lsr, src, Operand::Imm((32 - n) as u64), Width::W32);
                    let c = xl.and(c, Operand::Imm(1));
                    (r, Some(c))
                }
                (ShiftType::Lsr, 0) => {
                    let c = xl.shift_w(ShiftType::Lsr, src, Operand::Imm(31), Width::W32);
                    (Operand::Imm(0), Some(c))
                }
                (ShiftType::Asr, 0) => {
                    let r = xl.shift_w(ShiftType::Asr, src, Operand::Imm(31), Width::W32);
                    let c = xl.shift_w(ShiftType::Lsr, src, Operand::Imm(31), Width::W32);
                    (r, Some(c))
                }
                (_, n) => {
                    let r = xl.shift_w(kind, src, Operand::Imm(n as u64), Width::W32);
                    let c = xl.shift_w(ShiftType::Lsr, src, Operand::Imm((n - 1) as u64), Width::W32);
                    let c = xl.and(c, Operand::Imm(1));
                    (r, Some(c))
                }
            };
            if set_flags {
                xl.set_nz(result);
                if let Some(c) = carry {
                    xl.set_carry(c);
                }
            }
            xl.write_reg(rd, result);
        }
    }
}

fn thumb_imm8(xl: &mut Xl, half: u32) {
    let rd = half >> 8 & 0x7;
    let imm = Operand::Imm((half & 0xff) as u64);
    let set_flags = !xl.in_it;
    match half >> 11 & 0x3 {
        0b00 => {
            if set_flags {
                xl.set_nz(imm);
            }
            xl.write_reg(rd, imm);
        }
        0b01 => {
            let lhs = xl.read_reg(rd);
            let inv = xl.not_op(imm);
            xl.add_op(lhs, inv, Operand::Imm(1), FlagSet::NZCV);
            xl.wrote_flags = true;
        }
        0b10 => {
            let lhs = xl.read_reg(rd);
            let flags = if set_flags { FlagSet::NZCV } else { FlagSet::EMPTY };
            let result = xl.add_op(lhs, imm, Operand::Imm(0), flags);
            xl.wrote_flags |= set_flags;
            xl.write_reg(rd, result);
        }
        _ => {
            let lhs = xl.read_reg(rd);
            let inv = xl.not_op(imm);
            let flags = if set_flags { FlagSet::NZCV } else { FlagSet::EMPTY };
            let result = xl.add_op(lhs, inv, Operand::Imm(1), flags);
            xl.wrote_flags |= set_flags;
            xl.write_reg(rd, result);
        }
    }
}

fn thumb_dp_reg(xl: &mut Xl, half: u32) {
    let rd = half & 0x7;
    let rm = half >> 3 & 0x7;
    let set_flags = !xl.in_it;
    let flags = if set_flags { FlagSet::NZCV } else { FlagSet::EMPTY };
    let op = half >> 6 & 0xf;
    match op {
        2 | 3 | 4 | 7 => {
            let kind = match op {
                2 => ShiftType::Lsl,
                3 => ShiftType::Lsr,
                4 => ShiftType::Asr,
                _ => ShiftType::Ror,
            };
            let src = xl.read_reg(rd);
            let (result, carry) = thumb_var_shift(xl, kind, src, rm);
            if set_flags {
                xl.set_nz(result);
                xl.set_carry(carry);
            }
            xl.write_reg(rd, result);
        }
        0 | 8 => {
            let lhs = xl.read_reg(rd);
            let rhs = xl.read_reg(rm);
            let result = xl.and(lhs, rhs);
            if set_flags || op == 8 {
                xl.set_nz(result);
            }
            if op == 0 {
                xl.write_reg(rd, result);
            }
        }
        1 => {
            let lhs = xl.read_reg(rd);
            let rhs = xl.read_reg(rm);
            let result = xl.eor(lhs, rhs);
            if set_flags {
                xl.set_nz(result);
            }
            xl.write_reg(rd, result);
        }
        5 => {
            let lhs = xl.read_reg(rd);
            let rhs = xl.read_reg(rm);
            let c = xl.carry_in();
            let result = xl.add_op(lhs, rhs, c, flags);
            xl.wrote_flags |= set_flags;
            xl.write_reg(rd, result);
        }
        6 => {
            let lhs = xl.read_reg(rd);
            let rhs = xl.read_reg(rm);
            let inv = xl.not_op(rhs);
            let c = xl.carry_in();
            let result = xl.add_op(lhs, inv, c, flags);
            xl.wrote_flags |= set_flags;
            xl.write_reg(rd, result);
        }
        9 => {
            // RSB Rd, Rm, #0.
            let rhs = xl.read_reg(rm);
            let inv = xl.not_op(rhs);
            let result = xl.add_op(Operand::Imm(0), inv, Operand::Imm(1), flags);
            xl.wrote_flags |= set_flags;
            xl.write_reg(rd, result);
        }
        10 => {
            let lhs = xl.read_reg(rd);
            let rhs = xl.read_reg(rm);
            let inv = xl.not_op(rhs);
            xl.add_op(lhs, inv, Operand::Imm(1), FlagSet::NZCV);
            xl.wrote_flags = true;
        }
        11 => {
            let lhs = xl.read_reg(rd);
            let rhs = xl.read_reg(rm);
            xl.add_op(lhs, rhs, Operand::Imm(0), FlagSet::NZCV);
            xl.wrote_flags = true;
        }
        12 => {
            let lhs = xl.read_reg(rd);
            let rhs = xl.read_reg(rm);
            let result = xl.orr(lhs, rhs);
            if set_flags {
                xl.set_nz(result);
            }
            xl.write_reg(rd, result);
        }
        13 => {
            let lhs = xl.read_reg(rd);
            let rhs = xl.read_reg(rm);
            let dst = xl.val();
            xl.push(Inst::Mul {
                dst,
                lhs,
                rhs,
                width: Width::W32,
            });
            if set_flags {
                xl.set_nz(Operand::Value(dst));
            }
            xl.write_reg(rd, Operand::Value(dst));
        }
        14 => {
            let lhs = xl.read_reg(rd);
            let rhs = xl.read_reg(rm);
            let inv = xl.not_op(rhs);
            let result = xl.and(lhs, inv);
            if set_flags {
                xl.set_nz(result);
            }
            xl.write_reg(rd, result);
        }
        _ => {
            let rhs = xl.read_reg(rm);
            let result = xl.not_op(rhs);
            if set_flags {
                xl.set_nz(result);
            }
            xl.write_reg(rd, result);
        }
    }
}

fn thumb_special_data(xl: &mut Xl, half: u32) {
    let rd = (half >> 4 & 0x8) | (half & 0x7);
    let rm = half >> 3 & 0xf;
    match half >> 8 & 0x3 {
        0b00 => {
            let lhs = xl.read_reg(rd);
            let rhs = xl.read_reg(rm);
            let result = xl.add_op(lhs, rhs, Operand::Imm(0), FlagSet::EMPTY);
            if rd == 15 {
                xl.write_pc_branch(result);
            } else {
                xl.write_reg(rd, result);
            }
        }
        0b01 => {
            let lhs = xl.read_reg(rd);
            let rhs = xl.read_reg(rm);
            let inv = xl.not_op(rhs);
            xl.add_op(lhs, inv, Operand::Imm(1), FlagSet::NZCV);
            xl.wrote_flags = true;
        }
        0b10 => {
            let value = xl.read_reg(rm);
            if rd == 15 {
                xl.write_pc_branch(value);
            } else {
                xl.write_reg(rd, value);
            }
        }
        _ => {
            let target = xl.read_reg(rm);
            if half >> 7 & 1 != 0 {
                let ret = (xl.pc.wrapping_add(2) | 1) as u64;
                xl.write_reg(14, Operand::Imm(ret));
            }
            xl.write_pc_interworking(target);
        }
    }
}

fn thumb_ldr_literal(xl: &mut Xl, half: u32) {
    let rt = half >> 8 & 0x7;
    let imm = (half & 0xff) << 2;
    let base = (xl.pc.wrapping_add(4) & !3).wrapping_add(imm);
    let value = xl.load(Operand::Imm(base as u64), MemSize::U32);
    xl.write_reg(rt, value);
}

fn thumb_ldst_reg(xl: &mut Xl, half: u32) {
    let rt = half & 0x7;
    let rn = half >> 3 & 0x7;
    let rm = half >> 6 & 0x7;
    let base = xl.read_reg(rn);
    let offset = xl.read_reg(rm);
    let addr = xl.add_op(base, offset, Operand::Imm(0), FlagSet::EMPTY);
    match half >> 9 & 0x7 {
        0b000 => {
            let src = xl.read_reg(rt);
            xl.store(addr, src, MemSize::U32);
        }
        0b001 => {
            let src = xl.read_reg(rt);
            xl.store(addr, src, MemSize::U16);
        }
        0b010 => {
            let src = xl.read_reg(rt);
            xl.store(addr, src, MemSize::U8);
        }
        0b011 => {
            let v = xl.load(addr, MemSize::U8);
            let v = xl.sext32(v, 8);
            xl.write_reg(rt, v);
        }
        0b100 => {
            let v = xl.load(addr, MemSize::U32);
            xl.write_reg(rt, v);
        }
        0b101 => {
            let v = xl.load(addr, MemSize::U16);
            xl.write_reg(rt, v);
        }
        0b110 => {
            let v = xl.load(addr, MemSize::U8);
            xl.write_reg(rt, v);
        }
        _ => {
            let v = xl.load(addr, MemSize::U16);
            let v = xl.sext32(v, 16);
            xl.write_reg(rt, v);
        }
    }
}

fn thumb_ldst_imm5(xl: &mut Xl, half: u32) {
    let rt = half & 0x7;
    let rn = half >> 3 & 0x7;
    let imm5 = half >> 6 & 0x1f;
    let byte = half >> 12 & 1 != 0;
    let load = half >> 11 & 1 != 0;
    let (size, scale) = if byte { (MemSize::U8, 0) } else { (MemSize::U32, 2) };
    let base = xl.read_reg(rn);
    let addr = xl.add_op(
        base,
        Operand::Imm((imm5 << scale) as u64),
        Operand::Imm(0),
        FlagSet::EMPTY,
    );
    if load {
        let v = xl.load(addr, size);
        xl.write_reg(rt, v);
    } else {
        let src = xl.read_reg(rt);
        xl.store(addr, src, size);
    }
}

fn thumb_ldst_half(xl: &mut Xl, half: u32) {
    let rt = half & 0x7;
    let rn = half >> 3 & 0x7;
    let imm5 = half >> 6 & 0x1f;
    let load = half >> 11 & 1 != 0;
    let base = xl.read_reg(rn);
    let addr = xl.add_op(
        base,
        Operand::Imm((imm5 << 1) as u64),
        Operand::Imm(0),
        FlagSet::EMPTY,
    );
    if load {
        let v = xl.load(addr, MemSize::U16);
        xl.write_reg(rt, v);
    } else {
        let src = xl.read_reg(rt);
        xl.store(addr, src, MemSize::U16);
    }
}

fn thumb_ldst_sp(xl: &mut Xl, half: u32) {
    let rt = half >> 8 & 0x7;
    let imm = (half & 0xff) << 2;
    let load = half >> 11 & 1 != 0;
    let base = xl.read_reg(13);
    let addr = xl.add_op(base, Operand::Imm(imm as u64), Operand::Imm(0), FlagSet::EMPTY);
    if load {
        let v = xl.load(addr, MemSize::U32);
        xl.write_reg(rt, v);
    } else {
        let src = xl.read_reg(rt);
        xl.store(addr, src, MemSize::U32);
    }
}

fn thumb_adr(xl: &mut Xl, half: u32) {
    let rd = half >> 8 & 0x7;
    let imm = (half & 0xff) << 2;
    let value = (xl.pc.wrapping_add(4) & !3).wrapping_add(imm);
    xl.write_reg(rd, Operand::Imm(value as u64));
}

fn thumb_add_sp_imm(xl: &mut Xl, half: u32) {
    let rd = half >> 8 & 0x7;
    let imm = (half & 0xff) << 2;
    let sp = xl.read_reg(13);
    let result = xl.add_op(sp, Operand::Imm(imm as u64), Operand::Imm(0), FlagSet::EMPTY);
    xl.write_reg(rd, result);
}

fn thumb_adjust_sp(xl: &mut Xl, half: u32) {
    let imm = (half & 0x7f) << 2;
    let sp = xl.read_reg(13);
    let result = if half >> 7 & 1 != 0 {
        let inv = xl.not_op(Operand::Imm(imm as u64));
        xl.add_op(sp, inv, Operand::Imm(1), FlagSet::EMPTY)
    } else {
        xl.add_op(sp, Operand::Imm(imm as u64), Operand::Imm(0), FlagSet::EMPTY)
    };
    xl.write_reg(13, result);
}

fn thumb_extend(xl: &mut Xl, half: u32) {
    let rd = half & 0x7;
    let rm = half >> 3 & 0x7;
    let src = xl.read_reg(rm);
    let result = match half >> 6 & 0x3 {
        0b00 => xl.sext32(src, 16),
        0b01 => xl.sext32(src, 8),
        0b10 => xl.and(src, Operand::Imm(0xffff)),
        _ => xl.and(src, Operand::Imm(0xff)),
    };
    xl.write_reg(rd, result);
}

fn thumb_rev(xl: &mut Xl, half: u32) {
    let rd = half & 0x7;
    let rm = half >> 3 & 0x7;
    let src = xl.read_reg(rm);
    match half >> 6 & 0x3 {
        0b00 => {
            let dst = xl.val();
            xl.push(Inst::Rev {
                dst,
                src,
                width: Width::W32,
            });
            xl.write_reg(rd, Operand::Value(dst));
        }
        0b01 => {
            let dst = xl.val();
            xl.push(Inst::Rev16 {
                dst,
                src,
                width: Width::W32,
            });
            xl.write_reg(rd, Operand::Value(dst));
        }
        0b11 => {
            // REVSH: byte-swap the low halfword, then sign-extend it.
            let dst = xl.val();
            xl.push(Inst::Rev {
                dst,
                src,
                width: Width::W16,
            });
            let result = xl.sext32(Operand::Value(dst), 16);
            xl.write_reg(rd, result);
        }
        _ => xl.undefined(half),
    }
}

fn thumb_push(xl: &mut Xl, half: u32) {
    let with_lr = half >> 8 & 1 != 0;
    let list = half & 0xff;
    let count = list.count_ones() + with_lr as u32;
    if count == 0 {
        return xl.undefined(half);
    }
    let sp = xl.read_reg(13);
    let inv = xl.not_op(Operand::Imm((count * 4) as u64));
    let base = xl.add_op(sp, inv, Operand::Imm(1), FlagSet::EMPTY);
    let mut offset = 0u32;
    for reg in 0..8 {
        if list >> reg & 1 != 0 {
            let addr = xl.add_op(base, Operand::Imm(offset as u64), Operand::Imm(0), FlagSet::EMPTY);
            let src = xl.read_reg(reg);
            xl.store(addr, src, MemSize::U32);
            offset += 4;
        }
    }
    if with_lr {
        let addr = xl.add_op(base, Operand::Imm(offset as u64), Operand::Imm(0), FlagSet::EMPTY);
        let src = xl.read_reg(14);
        xl.store(addr, src, MemSize::U32);
    }
    xl.write_reg(13, base);
}

fn thumb_pop(xl: &mut Xl, half: u32) {
    let with_pc = half >> 8 & 1 != 0;
    let list = half & 0xff;
    let count = list.count_ones() + with_pc as u32;
    if count == 0 {
        return xl.undefined(half);
    }
    let sp = xl.read_reg(13);
    let mut offset = 0u32;
    let mut pc_value = None;
    for reg in 0..8 {
        if list >> reg & 1 != 0 {
            let addr = xl.add_op(sp, Operand::Imm(offset as u64), Operand::Imm(0), FlagSet::EMPTY);
            let v = xl.load(addr, MemSize::U32);
            xl.write_reg(reg, v);
            offset += 4;
        }
    }
    if with_pc {
        let addr = xl.add_op(sp, Operand::Imm(offset as u64), Operand::Imm(0), FlagSet::EMPTY);
        pc_value = Some(xl.load(addr, MemSize::U32));
    }
    let new_sp = xl.add_op(sp, Operand::Imm((count * 4) as u64), Operand::Imm(0), FlagSet::EMPTY);
    xl.write_reg(13, new_sp);
    if let Some(value) = pc_value {
        xl.write_pc_interworking(value);
    }
}

fn thumb_cbz(xl: &mut Xl, half: u32) {
    if xl.in_it {
        return xl.undefined(half);
    }
    let rn = half & 0x7;
    let on_nonzero = half >> 11 & 1 != 0;
    let imm = ((half >> 9 & 1) << 5 | (half >> 3 & 0x1f)) << 1;
    let value = xl.read_reg(rn);
    let zero = xl.is_zero(value, Width::W32);
    let taken = xl.loc(xl.pc.wrapping_add(4).wrapping_add(imm));
    let fallthrough = xl.loc(xl.pc.wrapping_add(2));
    let (then_target, else_target) = if on_nonzero {
        (fallthrough, taken)
    } else {
        (taken, fallthrough)
    };
    xl.end(Terminator::If {
        cond: zero,
        then_target,
        else_target,
    });
}

fn thumb_it_hints(xl: &mut Xl, half: u32) {
    let mask = half & 0xf;
    if mask == 0 {
        // NOP/YIELD/WFE/WFI hint space.
        if matches!(half >> 4 & 0xf, 0b0010 | 0b0011) {
            xl.end(Terminator::Exception {
                pc: xl.pc as u64,
                exception: Exception::WaitForInterrupt,
            });
        }
        return;
    }
    if xl.in_it {
        return xl.undefined(half);
    }
    // IT: the new state takes effect from the next instruction, so the
    // successor key carries it.
    let new_it = (half & 0xff) as u8;
    xl.push(Inst::SetCtxField {
        field: CtxField::ItState,
        src: Operand::Imm(new_it as u64),
    });
    xl.it_state = new_it;
    let target = xl.loc(xl.pc.wrapping_add(2));
    xl.end(Terminator::LinkBlock { target });
}

fn thumb_b_cond(xl: &mut Xl, half: u32) {
    let cond_bits = (half >> 8 & 0xf) as u8;
    match cond_bits {
        0b1111 => {
            xl.push(Inst::CallSupervisor {
                imm: half & 0xff,
                pc: xl.pc as u64,
            });
            let target = xl.loc(xl.pc.wrapping_add(2));
            xl.end(Terminator::LinkBlock { target });
        }
        0b1110 => xl.undefined(half),
        _ => {
            if xl.in_it {
                return xl.undefined(half);
            }
            let cond = Cond::from_bits(cond_bits);
            let offset = sext_imm(half & 0xff, 8) << 1;
            let taken = xl.loc(xl.pc.wrapping_add(4).wrapping_add(offset));
            let fallthrough = xl.loc(xl.pc.wrapping_add(2));
            let test = xl.test_cond(cond);
            xl.end(Terminator::If {
                cond: test,
                then_target: taken,
                else_target: fallthrough,
            });
        }
    }
}

fn thumb_b(xl: &mut Xl, half: u32) {
    let offset = sext_imm(half & 0x7ff, 11) << 1;
    let target = xl.loc(xl.pc.wrapping_add(4).wrapping_add(offset));
    xl.end(Terminator::LinkBlock { target });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_advance_shifts_and_terminates() {
        // ITTE EQ: 0000 0110 -> advance twice, then done after the last.
        let it = 0b0000_0110u8;
        let one = it_advance(it);
        assert_eq!(one, 0b0000_1100);
        let two = it_advance(one);
        assert_eq!(two, 0b0001_1000);
        let three = it_advance(two);
        assert_eq!(three, 0);
    }

    #[test]
    fn arm_immediate_expansion() {
        assert_eq!(arm_expand_imm(0x0000_00ff), (0xff, None));
        // 0xff ror 8 = 0xff000000, carry out = bit 31.
        assert_eq!(arm_expand_imm(0x0000_04ff), (0xff00_0000, Some(true)));
    }
}
