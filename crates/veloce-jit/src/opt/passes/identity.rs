//! Identity simplification.
//!
//! Strength-reduces algebraic no-ops left behind by the frontends: masking
//! with an all-ones immediate, adding zero, shifting by zero, or-ing and
//! xor-ing with zero, and selects with equal arms. Simplified instructions
//! become copies recorded in the substitution map and erased.

use crate::ir::{Inst, IrBlock, Operand};
use crate::opt::ValueMap;

pub fn run(block: &mut IrBlock) -> bool {
    let mut map = ValueMap::new(block.value_count());
    let mut changed = false;

    for inst in &mut block.insts {
        inst.for_each_operand_mut(|op| {
            changed |= map.apply(op);
        });

        let replacement = match *inst {
            Inst::And {
                dst, lhs, rhs, width,
            } => match (lhs, rhs) {
                (x, Operand::Imm(m)) | (Operand::Imm(m), x) if m & width.mask() == width.mask() => {
                    Some((dst, x))
                }
                (_, Operand::Imm(0)) | (Operand::Imm(0), _) => Some((dst, Operand::Imm(0))),
                (Operand::Value(a), Operand::Value(b)) if a == b => {
                    Some((dst, Operand::Value(a)))
                }
                _ => None,
            },
            Inst::Orr { dst, lhs, rhs, .. } => match (lhs, rhs) {
                (x, Operand::Imm(0)) | (Operand::Imm(0), x) => Some((dst, x)),
                (Operand::Value(a), Operand::Value(b)) if a == b => {
                    Some((dst, Operand::Value(a)))
                }
                _ => None,
            },
            Inst::Eor { dst, lhs, rhs, .. } => match (lhs, rhs) {
                (x, Operand::Imm(0)) | (Operand::Imm(0), x) => Some((dst, x)),
                (Operand::Value(a), Operand::Value(b)) if a == b => {
                    Some((dst, Operand::Imm(0)))
                }
                _ => None,
            },
            Inst::AddWithCarry {
                dst,
                lhs,
                rhs,
                carry,
                flags,
                ..
            } if flags.is_empty() => match (lhs, rhs, carry) {
                (x, Operand::Imm(0), Operand::Imm(0)) | (Operand::Imm(0), x, Operand::Imm(0)) => {
                    Some((dst, x))
                }
                // x + !0 + 1 == x: a subtraction of zero.
                (x, Operand::Imm(u64::MAX), Operand::Imm(1)) => Some((dst, x)),
                _ => None,
            },
            Inst::Shift {
                dst,
                src,
                amount: Operand::Imm(0),
                ..
            } => Some((dst, src)),
            Inst::Mul { dst, lhs, rhs, .. } => match (lhs, rhs) {
                (x, Operand::Imm(1)) | (Operand::Imm(1), x) => Some((dst, x)),
                (_, Operand::Imm(0)) | (Operand::Imm(0), _) => Some((dst, Operand::Imm(0))),
                _ => None,
            },
            Inst::Select {
                dst,
                if_true,
                if_false,
                ..
            } if if_true == if_false => Some((dst, if_true)),
            _ => None,
        };

        if let Some((dst, value)) = replacement {
            match value {
                Operand::Imm(k) => map.record_const(dst, k),
                Operand::Value(v) => map.record_copy(dst, v),
            }
            *inst = Inst::Nop;
            changed = true;
        }
    }

    changed |= map.apply_terminator(block);
    changed
}
