//! Flag-write elision.
//!
//! Backward liveness over the four NZCV flags. Flags are architectural
//! state, so all four are live at the block end; within the block, a flag
//! write that is overwritten before any read is dead and gets narrowed out
//! of the writing instruction. An instruction whose only job was the dead
//! flag write disappears entirely.

use crate::ir::IrBlock;
use veloce_types::FlagSet;

pub fn run(block: &mut IrBlock) -> bool {
    let mut live = FlagSet::NZCV;
    let mut changed = false;

    for inst in block.insts.iter_mut().rev() {
        let written = inst.flags_written();
        if !written.is_empty() && !live.contains(written) {
            inst.narrow_flags(live);
            changed = true;
        }
        live = live.without(written).union(inst.flags_read());
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Inst, LocationDescriptor, Operand};
    use veloce_types::{Cond, Width};

    fn cmp(b: &mut IrBlock, flags: FlagSet) -> Inst {
        let dst = b.new_value();
        Inst::AddWithCarry {
            dst,
            lhs: Operand::Imm(1),
            rhs: Operand::Imm(!2u64),
            carry: Operand::Imm(1),
            width: Width::W64,
            flags,
        }
    }

    #[test]
    fn overwritten_flags_are_narrowed() {
        let mut b = IrBlock::new(LocationDescriptor(0));
        let first = cmp(&mut b, FlagSet::NZCV);
        let second = cmp(&mut b, FlagSet::NZCV);
        b.push(first);
        b.push(second.clone());
        assert!(run(&mut b));
        assert_eq!(b.insts[0].flags_written(), FlagSet::EMPTY);
        assert_eq!(b.insts[1], second);
    }

    #[test]
    fn read_between_writes_keeps_flags() {
        let mut b = IrBlock::new(LocationDescriptor(0));
        let first = cmp(&mut b, FlagSet::NZCV);
        b.push(first.clone());
        let t = b.new_value();
        b.push(Inst::TestCond { dst: t, cond: Cond::Le });
        let second = cmp(&mut b, FlagSet::NZCV);
        b.push(second);
        // LE reads N, Z and V; only C is overwritten unread, but C alone is
        // still live into the first write because the second write covers it
        // after the read. The first compare keeps N, Z and V.
        assert!(run(&mut b));
        assert_eq!(
            b.insts[0].flags_written(),
            FlagSet::N.union(FlagSet::Z).union(FlagSet::V)
        );
    }

    #[test]
    fn final_flags_always_survive() {
        let mut b = IrBlock::new(LocationDescriptor(0));
        let only = cmp(&mut b, FlagSet::NZCV);
        b.push(only.clone());
        assert!(!run(&mut b));
        assert_eq!(b.insts[0], only);
    }
}
