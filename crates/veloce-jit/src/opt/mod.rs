//! Block-local optimization pipeline.
//!
//! Four peephole-scale passes run in a fixed order over the linear IR of a
//! single block: constant folding, identity simplification, flag-write
//! elision, then dead-code elimination. Each pass reports whether it changed
//! anything; the pipeline is idempotent, which the tests assert by running
//! it twice.

pub mod passes;

use crate::ir::{IrBlock, Operand, ValueId};

/// Run the full pipeline once.
pub fn optimize(block: &mut IrBlock) {
    let changed = run_pipeline(block);
    if changed {
        block.update_flags();
        tracing::trace!(location = ?block.location, "optimizer simplified block");
    }
}

/// Run every pass once, in order. Returns whether anything changed.
pub fn run_pipeline(block: &mut IrBlock) -> bool {
    let mut changed = false;
    changed |= passes::const_fold::run(block);
    changed |= passes::identity::run(block);
    changed |= passes::flag_elim::run(block);
    changed |= passes::dce::run(block);
    changed
}

/// Forward substitution map built up by the rewriting passes: values known
/// to be constants, or pure copies of earlier values.
pub(crate) struct ValueMap {
    entries: Vec<Option<Known>>,
}

#[derive(Clone, Copy)]
pub(crate) enum Known {
    Const(u64),
    Copy(ValueId),
}

impl ValueMap {
    pub fn new(value_count: u32) -> ValueMap {
        ValueMap {
            entries: vec![None; value_count as usize],
        }
    }

    pub fn record_const(&mut self, dst: ValueId, value: u64) {
        self.entries[dst.0 as usize] = Some(Known::Const(value));
    }

    /// Record `dst` as a copy of `src`, collapsing chains so later lookups
    /// resolve in one step.
    pub fn record_copy(&mut self, dst: ValueId, src: ValueId) {
        let resolved = match self.entries[src.0 as usize] {
            Some(known) => known,
            None => Known::Copy(src),
        };
        self.entries[dst.0 as usize] = Some(resolved);
    }

    pub fn lookup_const(&self, v: ValueId) -> Option<u64> {
        match self.entries[v.0 as usize] {
            Some(Known::Const(k)) => Some(k),
            _ => None,
        }
    }

    /// Rewrite an operand through the map. Returns true if it changed.
    pub fn apply(&self, op: &mut Operand) -> bool {
        if let Operand::Value(v) = *op {
            match self.entries[v.0 as usize] {
                Some(Known::Const(k)) => {
                    *op = Operand::Imm(k);
                    return true;
                }
                Some(Known::Copy(src)) => {
                    *op = Operand::Value(src);
                    return true;
                }
                None => {}
            }
        }
        false
    }

    /// Apply the map to the block terminator's operands.
    pub fn apply_terminator(&self, block: &mut IrBlock) -> bool {
        use crate::ir::Terminator;
        match &mut block.terminator {
            Terminator::ReturnToDispatch { next_pc } => self.apply(next_pc),
            Terminator::If { cond, .. } => self.apply(cond),
            _ => false,
        }
    }
}
