//! Dead-code elimination.
//!
//! Reference-counts every value, then walks the block backwards removing
//! side-effect-free instructions whose result is unused; each removal
//! releases its operands, so whole dead chains fall out in one sweep.
//! Finishes by dropping the `Nop`s this and the earlier passes left behind.

use crate::ir::{Inst, IrBlock};

pub fn run(block: &mut IrBlock) -> bool {
    let mut uses = vec![0u32; block.value_count() as usize];
    for inst in &block.insts {
        inst.for_each_use(|v| uses[v.0 as usize] += 1);
    }
    block.terminator.for_each_use(|v| uses[v.0 as usize] += 1);

    let mut changed = false;
    for inst in block.insts.iter_mut().rev() {
        if matches!(inst, Inst::Nop) {
            continue;
        }
        let dead = match inst.dst() {
            Some(dst) => uses[dst.0 as usize] == 0,
            None => true,
        };
        if dead && !inst.has_side_effect() {
            inst.for_each_use(|v| uses[v.0 as usize] -= 1);
            *inst = Inst::Nop;
            changed = true;
        }
    }

    let before = block.insts.len();
    block.insts.retain(|inst| !matches!(inst, Inst::Nop));
    changed || block.insts.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Operand;
    use crate::ir::{LocationDescriptor, Terminator};
    use veloce_types::{MemSize, Width};

    #[test]
    fn dead_chains_disappear() {
        let mut b = IrBlock::new(LocationDescriptor(0));
        let v0 = b.new_value();
        let v1 = b.new_value();
        let v2 = b.new_value();
        b.push(Inst::GetReg { dst: v0, reg: 1 });
        b.push(Inst::And {
            dst: v1,
            lhs: Operand::Value(v0),
            rhs: Operand::Imm(0xff),
            width: Width::W64,
        });
        b.push(Inst::GetReg { dst: v2, reg: 2 });
        b.push(Inst::SetReg {
            reg: 0,
            src: Operand::Value(v2),
        });
        assert!(run(&mut b));
        // v0 and v1 were only used by each other; both go.
        assert_eq!(b.insts.len(), 2);
        assert_eq!(b.insts[0], Inst::GetReg { dst: v2, reg: 2 });
    }

    #[test]
    fn unused_load_survives() {
        let mut b = IrBlock::new(LocationDescriptor(0));
        let v0 = b.new_value();
        b.push(Inst::Load {
            dst: v0,
            addr: Operand::Imm(0x1000),
            size: MemSize::U64,
            pc: 0,
        });
        assert!(!run(&mut b));
        assert_eq!(b.insts.len(), 1);
    }

    #[test]
    fn terminator_uses_count() {
        let mut b = IrBlock::new(LocationDescriptor(0));
        let v0 = b.new_value();
        b.push(Inst::GetReg { dst: v0, reg: 30 });
        b.terminator = Terminator::ReturnToDispatch {
            next_pc: Operand::Value(v0),
        };
        assert!(!run(&mut b));
        assert_eq!(b.insts.len(), 1);
    }
}
