//! Constant folding.
//!
//! Single forward sweep: operands referring to already-known constants are
//! rewritten to immediates, and pure instructions whose inputs are all
//! immediates are evaluated at translation time. A flag-setting arithmetic
//! instruction folds into a direct [`Inst::SetNzcv`] of the computed flag
//! word. A fully-constant two-way terminator collapses into a direct link.

use crate::eval;
use crate::ir::{Inst, IrBlock, Operand, Terminator};
use crate::opt::ValueMap;
use veloce_types::FlagSet;

pub fn run(block: &mut IrBlock) -> bool {
    let mut map = ValueMap::new(block.value_count());
    let mut changed = false;

    for inst in &mut block.insts {
        inst.for_each_operand_mut(|op| {
            changed |= map.apply(op);
        });

        match *inst {
            Inst::AddWithCarry {
                dst,
                lhs: Operand::Imm(a),
                rhs: Operand::Imm(b),
                carry: Operand::Imm(c),
                width,
                flags,
            } => {
                let (result, nzcv) = eval::add_with_carry(width, a, b, c);
                map.record_const(dst, result);
                *inst = if flags.is_empty() {
                    Inst::Nop
                } else {
                    Inst::SetNzcv {
                        src: Operand::Imm(nzcv as u64),
                        flags,
                    }
                };
                changed = true;
            }
            Inst::And {
                dst,
                lhs: Operand::Imm(a),
                rhs: Operand::Imm(b),
                width,
            } => {
                map.record_const(dst, width.truncate(a & b));
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::Orr {
                dst,
                lhs: Operand::Imm(a),
                rhs: Operand::Imm(b),
                width,
            } => {
                map.record_const(dst, width.truncate(a | b));
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::Eor {
                dst,
                lhs: Operand::Imm(a),
                rhs: Operand::Imm(b),
                width,
            } => {
                map.record_const(dst, width.truncate(a ^ b));
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::Mul {
                dst,
                lhs: Operand::Imm(a),
                rhs: Operand::Imm(b),
                width,
            } => {
                map.record_const(dst, width.truncate(a.wrapping_mul(b)));
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::Shift {
                dst,
                kind,
                src: Operand::Imm(v),
                amount: Operand::Imm(n),
                width,
            } => {
                map.record_const(dst, eval::shift(kind, width, v, n));
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::Rev {
                dst,
                src: Operand::Imm(v),
                width,
            } => {
                map.record_const(dst, eval::rev(width, v));
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::Rev16 {
                dst,
                src: Operand::Imm(v),
                width,
            } => {
                map.record_const(dst, eval::rev16(width, v));
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::Rev32 {
                dst,
                src: Operand::Imm(v),
            } => {
                map.record_const(dst, eval::rev32(v));
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::RBit {
                dst,
                src: Operand::Imm(v),
                width,
            } => {
                map.record_const(dst, eval::rbit(width, v));
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::Clz {
                dst,
                src: Operand::Imm(v),
                width,
            } => {
                map.record_const(dst, eval::clz(width, v));
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::IsZero {
                dst,
                src: Operand::Imm(v),
                width,
            } => {
                map.record_const(dst, (width.truncate(v) == 0) as u64);
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::Select {
                dst,
                cond: Operand::Imm(c),
                if_true,
                if_false,
            } => {
                let chosen = if c & 1 != 0 { if_true } else { if_false };
                match chosen {
                    Operand::Imm(k) => map.record_const(dst, k),
                    Operand::Value(v) => map.record_copy(dst, v),
                }
                *inst = Inst::Nop;
                changed = true;
            }
            Inst::SetNzFromValue {
                src: Operand::Imm(v),
                width,
                flags,
            } => {
                *inst = Inst::SetNzcv {
                    src: Operand::Imm(eval::nz_flags(width, v) as u64),
                    flags: flags.intersect(FlagSet::NZ),
                };
                changed = true;
            }
            _ => {}
        }
    }

    changed |= map.apply_terminator(block);
    if let Terminator::If {
        cond: Operand::Imm(c),
        then_target,
        else_target,
    } = block.terminator
    {
        block.terminator = Terminator::LinkBlock {
            target: if c & 1 != 0 { then_target } else { else_target },
        };
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::LocationDescriptor;
    use veloce_types::Width;

    #[test]
    fn folds_through_chains() {
        let mut b = IrBlock::new(LocationDescriptor(0));
        let v0 = b.new_value();
        let v1 = b.new_value();
        b.push(Inst::And {
            dst: v0,
            lhs: Operand::Imm(0xff00),
            rhs: Operand::Imm(0x0ff0),
            width: Width::W64,
        });
        b.push(Inst::Orr {
            dst: v1,
            lhs: Operand::Value(v0),
            rhs: Operand::Imm(1),
            width: Width::W64,
        });
        b.push(Inst::SetReg {
            reg: 0,
            src: Operand::Value(v1),
        });
        assert!(run(&mut b));
        assert_eq!(
            b.insts[2],
            Inst::SetReg {
                reg: 0,
                src: Operand::Imm(0x0f01)
            }
        );
    }

    #[test]
    fn flagged_add_folds_to_flag_write() {
        let mut b = IrBlock::new(LocationDescriptor(0));
        let v0 = b.new_value();
        // 5 - 5 as 5 + !5 + 1.
        b.push(Inst::AddWithCarry {
            dst: v0,
            lhs: Operand::Imm(5),
            rhs: Operand::Imm(!5u64),
            carry: Operand::Imm(1),
            width: Width::W64,
            flags: FlagSet::NZCV,
        });
        assert!(run(&mut b));
        assert_eq!(
            b.insts[0],
            Inst::SetNzcv {
                src: Operand::Imm(0x6000_0000), // Z and C
                flags: FlagSet::NZCV,
            }
        );
    }

    #[test]
    fn constant_branch_collapses() {
        let mut b = IrBlock::new(LocationDescriptor(0));
        let v0 = b.new_value();
        b.push(Inst::Eor {
            dst: v0,
            lhs: Operand::Imm(1),
            rhs: Operand::Imm(0),
            width: Width::W32,
        });
        b.terminator = Terminator::If {
            cond: Operand::Value(v0),
            then_target: LocationDescriptor(0x10),
            else_target: LocationDescriptor(0x20),
        };
        assert!(run(&mut b));
        assert_eq!(
            b.terminator,
            Terminator::LinkBlock {
                target: LocationDescriptor(0x10)
            }
        );
    }
}
