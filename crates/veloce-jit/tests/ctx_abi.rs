//! Locks the `JitContext` layout against the hand-maintained offset
//! constants the emitter bakes into generated code.

use memoffset::offset_of;
use veloce_jit::ctx::{
    off_reg, off_vec_lane, JitContext, OFF_BUDGET_START, OFF_CPSR_THUMB, OFF_ENV, OFF_FAULT,
    OFF_FPCR, OFF_FPSR, OFF_IT_STATE, OFF_NZCV, OFF_PAIR_SCRATCH, OFF_PC, OFF_REGS,
    OFF_REMAINING, OFF_TICK_BASE, OFF_VECS,
};

#[test]
fn context_offsets_match_the_struct_layout() {
    assert_eq!(OFF_REGS as usize, offset_of!(JitContext, regs));
    assert_eq!(OFF_VECS as usize, offset_of!(JitContext, vecs));
    assert_eq!(OFF_PC as usize, offset_of!(JitContext, pc));
    assert_eq!(OFF_REMAINING as usize, offset_of!(JitContext, remaining));
    assert_eq!(OFF_BUDGET_START as usize, offset_of!(JitContext, budget_start));
    assert_eq!(OFF_TICK_BASE as usize, offset_of!(JitContext, tick_base));
    assert_eq!(OFF_PAIR_SCRATCH as usize, offset_of!(JitContext, pair_scratch));
    assert_eq!(OFF_ENV as usize, offset_of!(JitContext, env));
    assert_eq!(OFF_NZCV as usize, offset_of!(JitContext, nzcv));
    assert_eq!(OFF_CPSR_THUMB as usize, offset_of!(JitContext, cpsr_thumb));
    assert_eq!(OFF_IT_STATE as usize, offset_of!(JitContext, it_state));
    assert_eq!(OFF_FPCR as usize, offset_of!(JitContext, fpcr));
    assert_eq!(OFF_FPSR as usize, offset_of!(JitContext, fpsr));
    assert_eq!(OFF_FAULT as usize, offset_of!(JitContext, fault));
}

#[test]
fn per_register_offsets_stride_correctly() {
    assert_eq!(off_reg(7) as usize, offset_of!(JitContext, regs) + 7 * 8);
    assert_eq!(
        off_vec_lane(3, 1) as usize,
        offset_of!(JitContext, vecs) + 3 * 16 + 8
    );
}
