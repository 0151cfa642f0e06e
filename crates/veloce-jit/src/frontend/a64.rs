//! A64 decoder and translator.
//!
//! One pass per block: fetch words from the code callback starting at the
//! location's PC, match each against the decode table and lower it through
//! the handler, until an instruction ends the block or the instruction
//! limit is reached. X31 resolves to XZR or SP per encoding class; PC-
//! relative values are folded to constants here, so the IR never reads PC.

use veloce_types::{Cond, Flag, FlagSet, MemSize, ShiftType, Width};

use crate::callbacks::{Exception, Memory};
use crate::frontend::{a64_location_fp, a64_location_pc, DecodeRow};
use crate::ir::{CtxField, FpBinOp, Inst, IrBlock, LocationDescriptor, Operand, Terminator, ValueId};

/// Translate one block starting at `loc`, decoding at most `max_insts`
/// guest instructions.
pub fn translate(mem: &mut dyn Memory, loc: LocationDescriptor, max_insts: usize) -> IrBlock {
    let mut xl = Xl {
        block: IrBlock::new(loc),
        mem,
        pc: a64_location_pc(loc),
        fp_key: a64_location_fp(loc),
        term: None,
    };

    while xl.term.is_none() {
        if xl.block.cycle_count as usize >= max_insts {
            let target = xl.loc(xl.pc);
            xl.end(Terminator::LinkBlock { target });
            break;
        }
        let Some(word) = xl.mem.read_code32(xl.pc) else {
            xl.end(Terminator::Exception {
                pc: xl.pc,
                exception: Exception::InstructionAbort,
            });
            break;
        };
        xl.block.cycle_count += 1;
        match crate::frontend::lookup(TABLE, word) {
            Some(handler) => handler(&mut xl, word),
            None => xl.undefined(word),
        }
        xl.pc = xl.pc.wrapping_add(4);
    }

    let mut block = xl.block;
    block.terminator = xl.term.expect("translation loop exits with a terminator");
    block.guest_start = a64_location_pc(loc);
    // A block that aborts on its first fetch still covers the faulting
    // word, so invalidation reaches it.
    block.guest_len = (block.cycle_count * 4).max(4);
    block.update_flags();
    block
}

struct Xl<'m> {
    block: IrBlock,
    mem: &'m mut dyn Memory,
    pc: u64,
    fp_key: u64,
    term: Option<Terminator>,
}

type Handler = for<'a, 'm> fn(&'a mut Xl<'m>, u32);

static TABLE: &[DecodeRow<Handler>] = &[
    DecodeRow { mask: 0x1f80_0000, value: 0x1100_0000, handler: add_sub_imm },
    DecodeRow { mask: 0x1f20_0000, value: 0x0b00_0000, handler: add_sub_shifted },
    DecodeRow { mask: 0x1f00_0000, value: 0x0a00_0000, handler: logical_shifted },
    DecodeRow { mask: 0x1f80_0000, value: 0x1200_0000, handler: logical_imm },
    DecodeRow { mask: 0x1f80_0000, value: 0x1280_0000, handler: move_wide },
    DecodeRow { mask: 0x7fff_0000, value: 0x5ac0_0000, handler: dp_1src },
    DecodeRow { mask: 0x7fe0_0000, value: 0x1ac0_0000, handler: dp_2src },
    DecodeRow { mask: 0x1fe0_fc00, value: 0x1a00_0000, handler: adc_sbc },
    DecodeRow { mask: 0x3fe0_0800, value: 0x1a80_0000, handler: csel_family },
    DecodeRow { mask: 0x3fe0_0410, value: 0x3a40_0000, handler: ccmp_ccmn },
    DecodeRow { mask: 0x1f00_0000, value: 0x1000_0000, handler: adr_adrp },
    DecodeRow { mask: 0x7c00_0000, value: 0x1400_0000, handler: b_uncond },
    DecodeRow { mask: 0xff00_0010, value: 0x5400_0000, handler: b_cond },
    DecodeRow { mask: 0x7e00_0000, value: 0x3400_0000, handler: cbz_cbnz },
    DecodeRow { mask: 0x7e00_0000, value: 0x3600_0000, handler: tbz_tbnz },
    DecodeRow { mask: 0xffff_fc1f, value: 0xd61f_0000, handler: br_blr_ret },
    DecodeRow { mask: 0xffff_fc1f, value: 0xd63f_0000, handler: br_blr_ret },
    DecodeRow { mask: 0xffff_fc1f, value: 0xd65f_0000, handler: br_blr_ret },
    DecodeRow { mask: 0x3f00_0000, value: 0x3900_0000, handler: ldst_unsigned_imm },
    DecodeRow { mask: 0x3f20_0c00, value: 0x3820_0800, handler: ldst_reg_offset },
    DecodeRow { mask: 0xffff_f0ff, value: 0xd503_305f, handler: clrex },
    DecodeRow { mask: 0x3f00_0000, value: 0x0800_0000, handler: ldst_exclusive },
    DecodeRow { mask: 0xfff0_0000, value: 0xd530_0000, handler: mrs },
    DecodeRow { mask: 0xfff0_0000, value: 0xd510_0000, handler: msr },
    DecodeRow { mask: 0xffff_f01f, value: 0xd503_201f, handler: hints },
    DecodeRow { mask: 0xffe0_001f, value: 0xd400_0001, handler: svc },
    DecodeRow { mask: 0xffe0_001f, value: 0xd420_0000, handler: brk },
    DecodeRow { mask: 0xff20_0c00, value: 0x1e20_0800, handler: fp_2src },
    DecodeRow { mask: 0x7f20_fc00, value: 0x1e20_0000, handler: fmov_general },
    DecodeRow { mask: 0xff3f_fc00, value: 0x1e20_4000, handler: fmov_register },
];

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

    fn loc(&self, pc: u64) -> LocationDescriptor {
        crate::frontend::a64_location_raw(pc, self.fp_key)
    }

    fn link(&mut self, pc: u64) {
        let target = self.loc(pc);
        self.end(Terminator::LinkBlock { target });
    }

    fn undefined(&mut self, word: u32) {
        self.end(Terminator::Exception {
            pc: self.pc,
            exception: Exception::UndefinedInstruction { opcode: word },
        });
    }

    /// Read Xn with X31 as the zero register.
    fn read_xr(&mut self, reg: u32) -> Operand {
        if reg == 31 {
            return Operand::Imm(0);
        }
        let dst = self.val();
        self.push(Inst::GetReg { dst, reg: reg as u8 });
        Operand::Value(dst)
    }

    /// Read Xn with X31 as SP.
    fn read_xr_sp(&mut self, reg: u32) -> Operand {
        let dst = self.val();
        self.push(Inst::GetReg { dst, reg: reg as u8 });
        Operand::Value(dst)
    }

    /// Write Xn; writes to X31 are discarded (XZR).
    fn write_xr(&mut self, reg: u32, src: Operand) {
        if reg != 31 {
            self.push(Inst::SetReg { reg: reg as u8, src });
        }
    }

    fn write_xr_sp(&mut self, reg: u32, src: Operand) {
        self.push(Inst::SetReg { reg: reg as u8, src });
    }

    fn add(
        &mut self,
        lhs: Operand,
        rhs: Operand,
        carry: Operand,
        width: Width,
        flags: FlagSet,
    ) -> Operand {
        let dst = self.val();
        self.push(Inst::AddWithCarry {
            dst,
            lhs,
            rhs,
            carry,
            width,
            flags,
        });
        Operand::Value(dst)
    }

    fn not_op(&mut self, src: Operand, width: Width) -> Operand {
        let dst = self.val();
        self.push(Inst::Eor {
            dst,
            lhs: src,
            rhs: Operand::Imm(width.mask()),
            width,
        });
        Operand::Value(dst)
    }

    fn and(&mut self, lhs: Operand, rhs: Operand, width: Width) -> Operand {
        let dst = self.val();
        self.push(Inst::And { dst, lhs, rhs, width });
        Operand::Value(dst)
    }

    fn orr(&mut self, lhs: Operand, rhs: Operand, width: Width) -> Operand {
        let dst = self.val();
        self.push(Inst::Orr { dst, lhs, rhs, width });
        Operand::Value(dst)
    }

    fn eor(&mut self, lhs: Operand, rhs: Operand, width: Width) -> Operand {
        let dst = self.val();
        self.push(Inst::Eor { dst, lhs, rhs, width });
        Operand::Value(dst)
    }

    fn shift(&mut self, kind: ShiftType, src: Operand, amount: Operand, width: Width) -> Operand {
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

    /// Sets N and Z from `result` and clears C and V, the A64 flag-setting
    /// logical-instruction behavior.
    fn set_nz_clear_cv(&mut self, result: Operand, width: Width) {
        self.push(Inst::SetNzFromValue {
            src: result,
            width,
            flags: FlagSet::NZ,
        });
        self.push(Inst::SetFlag {
            flag: Flag::C,
            src: Operand::Imm(0),
        });
        self.push(Inst::SetFlag {
            flag: Flag::V,
            src: Operand::Imm(0),
        });
    }

    /// Shifted-register operand: `reg` shifted by `amount` with `kind`.
    fn shifted_reg(&mut self, reg: u32, kind: ShiftType, amount: u32, width: Width) -> Operand {
        let base = self.read_xr(reg);
        if amount == 0 {
            return base;
        }
        self.shift(kind, base, Operand::Imm(amount as u64), width)
    }
}

fn sf_width(word: u32) -> Width {
    if word >> 31 != 0 {
        Width::W64
    } else {
        Width::W32
    }
}

fn rd(word: u32) -> u32 {
    word & 0x1f
}

fn rn(word: u32) -> u32 {
    word >> 5 & 0x1f
}

fn rm(word: u32) -> u32 {
    word >> 16 & 0x1f
}

fn sext(value: u64, bits: u32) -> u64 {
    let shift = 64 - bits;
    ((value << shift) as i64 >> shift) as u64
}

// ADD/SUB (immediate). X31 is SP on both sides.
fn add_sub_imm(xl: &mut Xl, word: u32) {
    let width = sf_width(word);
    let sub = word >> 30 & 1 != 0;
    let set_flags = word >> 29 & 1 != 0;
    let imm12 = (word >> 10 & 0xfff) as u64;
    let imm = if word >> 22 & 1 != 0 { imm12 << 12 } else { imm12 };

    let lhs = xl.read_xr_sp(rn(word));
    let flags = if set_flags { FlagSet::NZCV } else { FlagSet::EMPTY };
    let result = if sub {
        xl.add(lhs, Operand::Imm(!imm & width.mask()), Operand::Imm(1), width, flags)
    } else {
        xl.add(lhs, Operand::Imm(imm), Operand::Imm(0), width, flags)
    };
    if set_flags {
        xl.write_xr(rd(word), result);
    } else {
        xl.write_xr_sp(rd(word), result);
    }
}

// ADD/SUB (shifted register).
fn add_sub_shifted(xl: &mut Xl, word: u32) {
    let width = sf_width(word);
    let sub = word >> 30 & 1 != 0;
    let set_flags = word >> 29 & 1 != 0;
    let kind = ShiftType::from_bits((word >> 22) as u8);
    let amount = word >> 10 & 0x3f;
    if kind == ShiftType::Ror || (width == Width::W32 && amount >= 32) {
        return xl.undefined(word);
    }

    let lhs = xl.read_xr(rn(word));
    let rhs = xl.shifted_reg(rm(word), kind, amount, width);
    let flags = if set_flags { FlagSet::NZCV } else { FlagSet::EMPTY };
    let result = if sub {
        let inverted = xl.not_op(rhs, width);
        xl.add(lhs, inverted, Operand::Imm(1), width, flags)
    } else {
        xl.add(lhs, rhs, Operand::Imm(0), width, flags)
    };
    xl.write_xr(rd(word), result);
}

// AND/BIC/ORR/ORN/EOR/EON/ANDS/BICS (shifted register).
fn logical_shifted(xl: &mut Xl, word: u32) {
    let width = sf_width(word);
    let opc = word >> 29 & 0x3;
    let invert = word >> 21 & 1 != 0;
    let kind = ShiftType::from_bits((word >> 22) as u8);
    let amount = word >> 10 & 0x3f;
    if width == Width::W32 && amount >= 32 {
        return xl.undefined(word);
    }

    let lhs = xl.read_xr(rn(word));
    let mut rhs = xl.shifted_reg(rm(word), kind, amount, width);
    if invert {
        rhs = xl.not_op(rhs, width);
    }
    let result = match opc {
        0b00 | 0b11 => xl.and(lhs, rhs, width),
        0b01 => xl.orr(lhs, rhs, width),
        _ => xl.eor(lhs, rhs, width),
    };
    if opc == 0b11 {
        xl.set_nz_clear_cv(result, width);
    }
    xl.write_xr(rd(word), result);
}

// AND/ORR/EOR/ANDS (bitmask immediate). Rn=31 is ZR; Rd=31 is SP except
// for ANDS.
fn logical_imm(xl: &mut Xl, word: u32) {
    let width = sf_width(word);
    let opc = word >> 29 & 0x3;
    let n = word >> 22 & 1;
    let immr = word >> 16 & 0x3f;
    let imms = word >> 10 & 0x3f;
    let Some(imm) = decode_bit_masks(n, imms, immr, width) else {
        return xl.undefined(word);
    };

    let lhs = xl.read_xr(rn(word));
    let result = match opc {
        0b00 | 0b11 => xl.and(lhs, Operand::Imm(imm), width),
        0b01 => xl.orr(lhs, Operand::Imm(imm), width),
        _ => xl.eor(lhs, Operand::Imm(imm), width),
    };
    if opc == 0b11 {
        xl.set_nz_clear_cv(result, width);
        xl.write_xr(rd(word), result);
    } else {
        xl.write_xr_sp(rd(word), result);
    }
}

// MOVN/MOVZ/MOVK.
fn move_wide(xl: &mut Xl, word: u32) {
    let width = sf_width(word);
    let opc = word >> 29 & 0x3;
    let hw = word >> 21 & 0x3;
    if opc == 0b01 || (width == Width::W32 && hw > 1) {
        return xl.undefined(word);
    }
    let shift = hw * 16;
    let imm = (word >> 5 & 0xffff) as u64;
    match opc {
        0b00 => xl.write_xr(rd(word), Operand::Imm(!(imm << shift) & width.mask())),
        0b10 => xl.write_xr(rd(word), Operand::Imm(imm << shift)),
        _ => {
            let old = xl.read_xr(rd(word));
            let cleared = xl.and(old, Operand::Imm(!(0xffff << shift) & width.mask()), width);
            let result = xl.orr(cleared, Operand::Imm(imm << shift), width);
            xl.write_xr(rd(word), result);
        }
    }
}

// RBIT/REV16/REV32/REV/CLZ.
fn dp_1src(xl: &mut Xl, word: u32) {
    let width = sf_width(word);
    let opcode = word >> 10 & 0x3f;
    let src = xl.read_xr(rn(word));
    let dst = xl.val();
    let inst = match (opcode, width) {
        (0b000000, _) => Inst::RBit { dst, src, width },
        (0b000001, _) => Inst::Rev16 { dst, src, width },
        (0b000010, Width::W32) => Inst::Rev { dst, src, width },
        (0b000010, Width::W64) => Inst::Rev32 { dst, src },
        (0b000011, Width::W64) => Inst::Rev { dst, src, width },
        (0b000100, _) => Inst::Clz { dst, src, width },
        _ => return xl.undefined(word),
    };
    xl.push(inst);
    xl.write_xr(rd(word), Operand::Value(dst));
}

// LSLV/LSRV/ASRV/RORV.
fn dp_2src(xl: &mut Xl, word: u32) {
    let width = sf_width(word);
    let kind = match word >> 10 & 0x3f {
        0b001000 => ShiftType::Lsl,
        0b001001 => ShiftType::Lsr,
        0b001010 => ShiftType::Asr,
        0b001011 => ShiftType::Ror,
        _ => return xl.undefined(word),
    };
    let src = xl.read_xr(rn(word));
    let amount = xl.read_xr(rm(word));
    let result = xl.shift(kind, src, amount, width);
    xl.write_xr(rd(word), result);
}

// ADC/ADCS/SBC/SBCS: carry comes from the current C flag.
fn adc_sbc(xl: &mut Xl, word: u32) {
    let width = sf_width(word);
    let sub = word >> 30 & 1 != 0;
    let set_flags = word >> 29 & 1 != 0;
    let lhs = xl.read_xr(rn(word));
    let mut rhs = xl.read_xr(rm(word));
    if sub {
        rhs = xl.not_op(rhs, width);
    }
    let nzcv = xl.val();
    xl.push(Inst::GetNzcv { dst: nzcv });
    let carry = xl.shift(
        ShiftType::Lsr,
        Operand::Value(nzcv),
        Operand::Imm(Flag::C.bit() as u64),
        Width::W32,
    );
    let flags = if set_flags { FlagSet::NZCV } else { FlagSet::EMPTY };
    let result = xl.add(lhs, rhs, carry, width, flags);
    xl.write_xr(rd(word), result);
}

// CSEL/CSINC/CSINV/CSNEG.
fn csel_family(xl: &mut Xl, word: u32) {
    let width = sf_width(word);
    let negate = word >> 30 & 1 != 0;
    let increment = word >> 10 & 1 != 0;
    let cond = Cond::from_bits((word >> 12) as u8);
    let if_true = xl.read_xr(rn(word));
    let mut if_false = xl.read_xr(rm(word));
    if negate {
        if_false = xl.not_op(if_false, width);
    }
    if increment {
        if_false = xl.add(if_false, Operand::Imm(1), Operand::Imm(0), width, FlagSet::EMPTY);
    }
    let test = xl.test_cond(cond);
    let result = xl.select(test, if_true, if_false);
    xl.write_xr(rd(word), result);
}

// CCMP/CCMN (register and immediate forms): if cond holds the flags come
// from the comparison, otherwise from the immediate nzcv field. Lowered
// branchlessly: test the condition against the old flags, run the compare,
// then select between the two flag words.
fn ccmp_ccmn(xl: &mut Xl, word: u32) {
    let width = sf_width(word);
    let is_ccmp = word >> 30 & 1 != 0;
    let imm_form = word >> 11 & 1 != 0;
    let cond = Cond::from_bits((word >> 12) as u8);
    let nzcv_imm = ((word & 0xf) as u64) << 28;

    let test = xl.test_cond(cond);
    let lhs = xl.read_xr(rn(word));
    let rhs = if imm_form {
        Operand::Imm((rm(word)) as u64)
    } else {
        xl.read_xr(rm(word))
    };
    if is_ccmp {
        let inverted = xl.not_op(rhs, width);
        xl.add(lhs, inverted, Operand::Imm(1), width, FlagSet::NZCV);
    } else {
        xl.add(lhs, rhs, Operand::Imm(0), width, FlagSet::NZCV);
    }
    let compared = xl.val();
    xl.push(Inst::GetNzcv { dst: compared });
    let merged = xl.select(test, Operand::Value(compared), Operand::Imm(nzcv_imm));
    xl.push(Inst::SetNzcv {
        src: merged,
        flags: FlagSet::NZCV,
    });
}

// ADR/ADRP: PC-relative constants.
fn adr_adrp(xl: &mut Xl, word: u32) {
    let page = word >> 31 != 0;
    let immlo = (word >> 29 & 0x3) as u64;
    let immhi = (word >> 5 & 0x7_ffff) as u64;
    let imm = sext(immhi << 2 | immlo, 21);
    let value = if page {
        (xl.pc & !0xfff).wrapping_add(imm << 12)
    } else {
        xl.pc.wrapping_add(imm)
    };
    xl.write_xr(rd(word), Operand::Imm(value));
}

// B / BL.
fn b_uncond(xl: &mut Xl, word: u32) {
    let offset = sext((word & 0x03ff_ffff) as u64, 26) << 2;
    if word >> 31 != 0 {
        xl.write_xr(30, Operand::Imm(xl.pc.wrapping_add(4)));
    }
    xl.link(xl.pc.wrapping_add(offset));
}

// B.cond.
fn b_cond(xl: &mut Xl, word: u32) {
    let cond = Cond::from_bits(word as u8);
    let offset = sext((word >> 5 & 0x7_ffff) as u64, 19) << 2;
    let taken = xl.loc(xl.pc.wrapping_add(offset));
    let fallthrough = xl.loc(xl.pc.wrapping_add(4));
    if cond.is_unconditional() {
        return xl.end(Terminator::LinkBlock { target: taken });
    }
    let test = xl.test_cond(cond);
    xl.end(Terminator::If {
        cond: test,
        then_target: taken,
        else_target: fallthrough,
    });
}

// CBZ/CBNZ.
fn cbz_cbnz(xl: &mut Xl, word: u32) {
    let width = sf_width(word);
    let on_nonzero = word >> 24 & 1 != 0;
    let offset = sext((word >> 5 & 0x7_ffff) as u64, 19) << 2;
    let value = xl.read_xr(rd(word));
    let zero = xl.is_zero(value, width);
    let taken = xl.loc(xl.pc.wrapping_add(offset));
    let fallthrough = xl.loc(xl.pc.wrapping_add(4));
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

// TBZ/TBNZ.
fn tbz_tbnz(xl: &mut Xl, word: u32) {
    let bit = (word >> 31) << 5 | word >> 19 & 0x1f;
    let on_nonzero = word >> 24 & 1 != 0;
    let offset = sext((word >> 5 & 0x3fff) as u64, 14) << 2;
    let value = xl.read_xr(rd(word));
    let masked = xl.and(value, Operand::Imm(1 << bit), Width::W64);
    let zero = xl.is_zero(masked, Width::W64);
    let taken = xl.loc(xl.pc.wrapping_add(offset));
    let fallthrough = xl.loc(xl.pc.wrapping_add(4));
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

// BR/BLR/RET: indirect control flow returns to the dispatcher.
fn br_blr_ret(xl: &mut Xl, word: u32) {
    let opc = word >> 21 & 0x3;
    let target = xl.read_xr(rn(word));
    if opc == 0b01 {
        xl.write_xr(30, Operand::Imm(xl.pc.wrapping_add(4)));
    }
    xl.end(Terminator::ReturnToDispatch { next_pc: target });
}

// LDR/STR (unsigned immediate), integer, all sizes.
fn ldst_unsigned_imm(xl: &mut Xl, word: u32) {
    let size = word >> 30 & 0x3;
    let opc = word >> 22 & 0x3;
    let mem_size = match size {
        0 => MemSize::U8,
        1 => MemSize::U16,
        2 => MemSize::U32,
        _ => MemSize::U64,
    };
    let imm = ((word >> 10 & 0xfff) as u64) << size;
    let base = xl.read_xr_sp(rn(word));
    let addr = xl.add(base, Operand::Imm(imm), Operand::Imm(0), Width::W64, FlagSet::EMPTY);
    match opc {
        0b00 => {
            let src = xl.read_xr(rd(word));
            xl.push(Inst::Store {
                addr,
                src,
                size: mem_size,
                pc: xl.pc,
            });
        }
        0b01 => {
            let dst = xl.val();
            xl.push(Inst::Load {
                dst,
                addr,
                size: mem_size,
                pc: xl.pc,
            });
            xl.write_xr(rd(word), Operand::Value(dst));
        }
        _ => xl.undefined(word),
    }
}

// LDR/STR (register offset).
fn ldst_reg_offset(xl: &mut Xl, word: u32) {
    let size = word >> 30 & 0x3;
    let opc = word >> 22 & 0x3;
    let option = word >> 13 & 0x7;
    let scaled = word >> 12 & 1 != 0;
    let mem_size = match size {
        0 => MemSize::U8,
        1 => MemSize::U16,
        2 => MemSize::U32,
        _ => MemSize::U64,
    };

    let index = xl.read_xr(rm(word));
    let extended = match option {
        0b011 | 0b111 => index,
        0b010 => xl.and(index, Operand::Imm(0xffff_ffff), Width::W64),
        0b110 => {
            let low = xl.and(index, Operand::Imm(0xffff_ffff), Width::W64);
            let hi = xl.shift(ShiftType::Lsl, low, Operand::Imm(32), Width::W64);
            xl.shift(ShiftType::Asr, hi, Operand::Imm(32), Width::W64)
        }
        _ => return xl.undefined(word),
    };
    let offset = if scaled {
        xl.shift(ShiftType::Lsl, extended, Operand::Imm(size as u64), Width::W64)
    } else {
        extended
    };
    let base = xl.read_xr_sp(rn(word));
    let addr = xl.add(base, offset, Operand::Imm(0), Width::W64, FlagSet::EMPTY);
    match opc {
        0b00 => {
            let src = xl.read_xr(rd(word));
            xl.push(Inst::Store {
                addr,
                src,
                size: mem_size,
                pc: xl.pc,
            });
        }
        0b01 => {
            let dst = xl.val();
            xl.push(Inst::Load {
                dst,
                addr,
                size: mem_size,
                pc: xl.pc,
            });
            xl.write_xr(rd(word), Operand::Value(dst));
        }
        _ => xl.undefined(word),
    }
}

fn clrex(xl: &mut Xl, _word: u32) {
    xl.push(Inst::ClearExclusive);
}

// Exclusive and acquire/release loads/stores, single and pair.
fn ldst_exclusive(xl: &mut Xl, word: u32) {
    let size = word >> 30 & 0x3;
    let ordered_only = word >> 23 & 1 != 0; // LDAR/STLR: no reservation
    let load = word >> 22 & 1 != 0;
    let pair = word >> 21 & 1 != 0;
    let rs = rm(word);
    let rt2 = word >> 10 & 0x1f;
    let mem_size = match size {
        0 => MemSize::U8,
        1 => MemSize::U16,
        2 => MemSize::U32,
        _ => MemSize::U64,
    };

    if pair && size < 2 {
        return xl.undefined(word);
    }
    let addr = xl.read_xr_sp(rn(word));

    match (load, pair, ordered_only) {
        (true, false, true) => {
            let dst = xl.val();
            xl.push(Inst::Load {
                dst,
                addr,
                size: mem_size,
                pc: xl.pc,
            });
            xl.write_xr(rd(word), Operand::Value(dst));
        }
        (false, false, true) => {
            let src = xl.read_xr(rd(word));
            xl.push(Inst::Store {
                addr,
                src,
                size: mem_size,
                pc: xl.pc,
            });
        }
        (true, false, false) => {
            let dst = xl.val();
            xl.push(Inst::LoadExclusive {
                dst,
                addr,
                size: mem_size,
                pc: xl.pc,
            });
            xl.write_xr(rd(word), Operand::Value(dst));
        }
        (false, false, false) => {
            let src = xl.read_xr(rd(word));
            let dst = xl.val();
            xl.push(Inst::StoreExclusive {
                dst,
                addr,
                src,
                size: mem_size,
                pc: xl.pc,
            });
            xl.write_xr(rs, Operand::Value(dst));
        }
        (true, true, _) => {
            if size == 2 {
                // 32-bit pair: one 64-bit exclusive read, split.
                let dst = xl.val();
                xl.push(Inst::LoadExclusive {
                    dst,
                    addr,
                    size: MemSize::U64,
                    pc: xl.pc,
                });
                let lo = xl.and(Operand::Value(dst), Operand::Imm(0xffff_ffff), Width::W64);
                let hi = xl.shift(
                    ShiftType::Lsr,
                    Operand::Value(dst),
                    Operand::Imm(32),
                    Width::W64,
                );
                xl.write_xr(rd(word), lo);
                xl.write_xr(rt2, hi);
            } else {
                let lo = xl.val();
                xl.push(Inst::LoadExclusive {
                    dst: lo,
                    addr,
                    size: MemSize::U128,
                    pc: xl.pc,
                });
                let hi = xl.val();
                xl.push(Inst::ReadPairHigh { dst: hi });
                xl.write_xr(rd(word), Operand::Value(lo));
                xl.write_xr(rt2, Operand::Value(hi));
            }
        }
        (false, true, _) => {
            let lo = xl.read_xr(rd(word));
            let hi = xl.read_xr(rt2);
            let dst = xl.val();
            if size == 2 {
                let lo32 = xl.and(lo, Operand::Imm(0xffff_ffff), Width::W64);
                let hi_shifted = xl.shift(ShiftType::Lsl, hi, Operand::Imm(32), Width::W64);
                let combined = xl.orr(lo32, hi_shifted, Width::W64);
                xl.push(Inst::StoreExclusive {
                    dst,
                    addr,
                    src: combined,
                    size: MemSize::U64,
                    pc: xl.pc,
                });
            } else {
                xl.push(Inst::StoreExclusivePair {
                    dst,
                    addr,
                    lo,
                    hi,
                    pc: xl.pc,
                });
            }
            xl.write_xr(rs, Operand::Value(dst));
        }
    }
}

// System registers the engine models internally.
const SYSREG_NZCV: u32 = 0x5a10;
const SYSREG_FPCR: u32 = 0x5a20;
const SYSREG_FPSR: u32 = 0x5a21;
const SYSREG_CNTPCT: u32 = 0x5f01;

fn sysreg_id(word: u32) -> u32 {
    word >> 5 & 0x7fff
}

fn mrs(xl: &mut Xl, word: u32) {
    let rt = rd(word);
    match sysreg_id(word) {
        SYSREG_NZCV => {
            let dst = xl.val();
            xl.push(Inst::GetNzcv { dst });
            xl.write_xr(rt, Operand::Value(dst));
        }
        SYSREG_FPCR => {
            let dst = xl.val();
            xl.push(Inst::GetCtxField {
                dst,
                field: CtxField::Fpcr,
            });
            xl.write_xr(rt, Operand::Value(dst));
        }
        SYSREG_FPSR => {
            let dst = xl.val();
            xl.push(Inst::GetCtxField {
                dst,
                field: CtxField::Fpsr,
            });
            xl.write_xr(rt, Operand::Value(dst));
        }
        SYSREG_CNTPCT => {
            // Timing-sensitive: end the block so the charged budget is
            // observable before the read.
            let dst = xl.val();
            xl.push(Inst::GetTicks { dst });
            xl.write_xr(rt, Operand::Value(dst));
            xl.link(xl.pc.wrapping_add(4));
        }
        other => {
            let dst = xl.val();
            xl.push(Inst::SysRegRead {
                dst,
                sysreg: other,
                pc: xl.pc,
            });
            xl.write_xr(rt, Operand::Value(dst));
            xl.link(xl.pc.wrapping_add(4));
        }
    }
}

fn msr(xl: &mut Xl, word: u32) {
    let src = xl.read_xr(rd(word));
    match sysreg_id(word) {
        SYSREG_NZCV => xl.push(Inst::SetNzcv {
            src,
            flags: FlagSet::NZCV,
        }),
        SYSREG_FPSR => xl.push(Inst::SetCtxField {
            field: CtxField::Fpsr,
            src,
        }),
        SYSREG_FPCR => {
            // FPCR participates in the compilation fingerprint; re-key at
            // the dispatcher.
            xl.push(Inst::SetCtxField {
                field: CtxField::Fpcr,
                src,
            });
            xl.end(Terminator::ReturnToDispatch {
                next_pc: Operand::Imm(xl.pc.wrapping_add(4)),
            });
        }
        other => {
            xl.push(Inst::SysRegWrite {
                sysreg: other,
                src,
                pc: xl.pc,
            });
            xl.link(xl.pc.wrapping_add(4));
        }
    }
}

// Hint space: NOP and friends. WFI/WFE surface to the host.
fn hints(xl: &mut Xl, word: u32) {
    let crm_op2 = word >> 5 & 0x7f;
    if crm_op2 == 0b0000_010 || crm_op2 == 0b0000_011 {
        xl.end(Terminator::Exception {
            pc: xl.pc,
            exception: Exception::WaitForInterrupt,
        });
    }
}

fn svc(xl: &mut Xl, word: u32) {
    let imm = word >> 5 & 0xffff;
    xl.push(Inst::CallSupervisor { imm, pc: xl.pc });
    xl.link(xl.pc.wrapping_add(4));
}

fn brk(xl: &mut Xl, word: u32) {
    let imm = word >> 5 & 0xffff;
    xl.end(Terminator::Exception {
        pc: xl.pc,
        exception: Exception::Breakpoint { imm },
    });
}

// FADD/FSUB/FMUL (scalar).
fn fp_2src(xl: &mut Xl, word: u32) {
    let width = match word >> 22 & 0x3 {
        0b00 => Width::W32,
        0b01 => Width::W64,
        _ => return xl.undefined(word),
    };
    let op = match word >> 12 & 0xf {
        0b0000 => FpBinOp::Mul,
        0b0010 => FpBinOp::Add,
        0b0011 => FpBinOp::Sub,
        _ => return xl.undefined(word),
    };
    let lhs_v = xl.val();
    xl.push(Inst::GetVecElem {
        dst: lhs_v,
        reg: rn(word) as u8,
        width,
        lane: 0,
    });
    let rhs_v = xl.val();
    xl.push(Inst::GetVecElem {
        dst: rhs_v,
        reg: rm(word) as u8,
        width,
        lane: 0,
    });
    let dst = xl.val();
    xl.push(Inst::Fp {
        dst,
        op,
        width,
        lhs: Operand::Value(lhs_v),
        rhs: Operand::Value(rhs_v),
    });
    write_scalar(xl, rd(word) as u8, Operand::Value(dst));
}

// Scalar writes zero the remainder of the vector register.
fn write_scalar(xl: &mut Xl, reg: u8, value: Operand) {
    xl.push(Inst::SetVecElem {
        reg,
        width: Width::W64,
        lane: 0,
        src: value,
    });
    xl.push(Inst::SetVecElem {
        reg,
        width: Width::W64,
        lane: 1,
        src: Operand::Imm(0),
    });
}

// FMOV between general and FP registers.
fn fmov_general(xl: &mut Xl, word: u32) {
    let sf = word >> 31 != 0;
    let ftype = word >> 22 & 0x3;
    let rmode = word >> 19 & 0x3;
    let opcode = word >> 16 & 0x7;
    if rmode != 0 {
        return xl.undefined(word);
    }
    match (sf, ftype, opcode) {
        // FMOV Wn -> Sd / Xn -> Dd
        (false, 0b00, 0b111) => {
            let src = xl.read_xr(rn(word));
            let low = xl.and(src, Operand::Imm(0xffff_ffff), Width::W64);
            write_scalar(xl, rd(word) as u8, low);
        }
        (true, 0b01, 0b111) => {
            let src = xl.read_xr(rn(word));
            write_scalar(xl, rd(word) as u8, src);
        }
        // FMOV Sn -> Wd / Dn -> Xd
        (false, 0b00, 0b110) => {
            let dst = xl.val();
            xl.push(Inst::GetVecElem {
                dst,
                reg: rn(word) as u8,
                width: Width::W32,
                lane: 0,
            });
            xl.write_xr(rd(word), Operand::Value(dst));
        }
        (true, 0b01, 0b110) => {
            let dst = xl.val();
            xl.push(Inst::GetVecElem {
                dst,
                reg: rn(word) as u8,
                width: Width::W64,
                lane: 0,
            });
            xl.write_xr(rd(word), Operand::Value(dst));
        }
        _ => xl.undefined(word),
    }
}

// FMOV (register), scalar.
fn fmov_register(xl: &mut Xl, word: u32) {
    let width = match word >> 22 & 0x3 {
        0b00 => Width::W32,
        0b01 => Width::W64,
        _ => return xl.undefined(word),
    };
    let dst = xl.val();
    xl.push(Inst::GetVecElem {
        dst,
        reg: rn(word) as u8,
        width,
        lane: 0,
    });
    write_scalar(xl, rd(word) as u8, Operand::Value(dst));
}

/// Replicated bitmask immediate decoding (logical immediate instructions).
/// Returns `None` for the reserved encodings.
pub(crate) fn decode_bit_masks(n: u32, imms: u32, immr: u32, width: Width) -> Option<u64> {
    let combined = n << 6 | (!imms & 0x3f);
    if combined == 0 {
        return None;
    }
    let len = 31 - combined.leading_zeros();
    let esize = 1u32 << len;
    if esize > width.bits() {
        return None;
    }
    let levels = esize - 1;
    let s = imms & levels;
    let r = immr & levels;
    if s == levels {
        return None;
    }

    let welem: u64 = (1u128 << (s + 1)).wrapping_sub(1) as u64;
    let emask = if esize == 64 { u64::MAX } else { (1u64 << esize) - 1 };
    let rotated = if r == 0 {
        welem
    } else {
        (welem >> r | welem << (esize - r)) & emask
    };
    let mut result = 0u64;
    let mut bit = 0;
    while bit < width.bits() {
        result |= rotated << bit;
        bit += esize;
    }
    Some(result & width.mask())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_immediates() {
        // The classic byte-replicated and halfword patterns.
        assert_eq!(
            decode_bit_masks(0, 0b110000, 0b000000, Width::W32),
            Some(0x0101_0101)
        );
        assert_eq!(
            decode_bit_masks(0, 0b100011, 0b001100, Width::W32),
            Some(0x00f0_00f0)
        );
        assert_eq!(
            decode_bit_masks(0, 0b011110, 0b000000, Width::W32),
            Some(0x7fff_ffff)
        );
        // All-ones is reserved.
        assert_eq!(decode_bit_masks(0, 0b111111, 0, Width::W32), None);
        // N=1 is invalid at 32 bits.
        assert_eq!(decode_bit_masks(1, 0, 0, Width::W32), None);
        // 64-bit element.
        assert_eq!(
            decode_bit_masks(1, 0b000000, 0b000000, Width::W64),
            Some(1)
        );
    }
}
