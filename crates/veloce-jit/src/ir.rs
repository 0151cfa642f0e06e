//! Architecture-neutral intermediate representation.
//!
//! Both guest frontends lower into this IR; the optimizer, the x64 emitter
//! and the debug interpreter all consume it. The opcode set is deliberately
//! closed: every instruction here has a native lowering, an interpreter
//! case and liveness metadata, and nothing else is allowed in a block.
//!
//! Values are SSA-ish: each [`ValueId`] is defined exactly once and holds a
//! `u64` (narrower widths are zero-extended). Guest state (registers, NZCV,
//! vector lanes, context words) is read and written through explicit
//! `Get*`/`Set*` instructions, never aliased by values; that is what keeps
//! passes in [`crate::opt`] simple sweeps instead of alias analyses.

use veloce_types::{Cond, Flag, FlagSet, MemSize, Width};

use crate::callbacks::Exception;

/// Dense index of an IR value within one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Instruction input: a prior value or an inline 64-bit constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Value(ValueId),
    Imm(u64),
}

impl Operand {
    pub fn as_imm(self) -> Option<u64> {
        match self {
            Operand::Imm(v) => Some(v),
            Operand::Value(_) => None,
        }
    }
}

/// Opaque compilation key: guest PC plus the execution-context fingerprint
/// (instruction set, IT state, FP control bits) packed by the owning
/// frontend. Two locations compare equal only if a compiled block for one is
/// valid at the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationDescriptor(pub u64);

/// Context words exposed to the IR besides the GPR/vector files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxField {
    /// A32 Thumb bit (bit 0 of the word).
    ThumbBit,
    /// A32 ITSTATE byte.
    ItState,
    Fpcr,
    Fpsr,
}

/// Scalar floating-point operation carried out through the FP callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpBinOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    /// dst = guest GPR `reg` (A64: X0..X30 + SP slot 31; A32: R0..R14).
    GetReg { dst: ValueId, reg: u8 },
    SetReg { reg: u8, src: Operand },
    /// dst = zero-extended element `lane` of vector register `reg`.
    GetVecElem { dst: ValueId, reg: u8, width: Width, lane: u8 },
    /// Writes only the addressed element; frontends emit explicit zeroing
    /// writes where the architecture clears the rest of the register.
    SetVecElem { reg: u8, width: Width, lane: u8, src: Operand },
    /// dst = packed NZCV word (flags at bits 31..28, rest zero).
    GetNzcv { dst: ValueId },
    /// Overwrites the flags in `flags` from the packed word in `src`.
    SetNzcv { src: Operand, flags: FlagSet },
    /// Sets N and Z from a result value. `flags` ⊆ {N,Z}; the elision pass
    /// narrows it.
    SetNzFromValue { src: Operand, width: Width, flags: FlagSet },
    /// Sets a single flag from bit 0 of `src`.
    SetFlag { flag: Flag, src: Operand },
    /// dst = 1 if `cond` holds on the current flags, else 0.
    TestCond { dst: ValueId, cond: Cond },
    GetCtxField { dst: ValueId, field: CtxField },
    SetCtxField { field: CtxField, src: Operand },

    /// dst = lhs + rhs + carry(bit 0), at `width`; writes the flags named in
    /// `flags` from the full-width computation. Subtraction and reverse
    /// subtraction are expressed as `lhs + ~rhs + 1` by the frontends, which
    /// yields the architectural C and V directly.
    AddWithCarry {
        dst: ValueId,
        lhs: Operand,
        rhs: Operand,
        carry: Operand,
        width: Width,
        flags: FlagSet,
    },
    And { dst: ValueId, lhs: Operand, rhs: Operand, width: Width },
    Orr { dst: ValueId, lhs: Operand, rhs: Operand, width: Width },
    Eor { dst: ValueId, lhs: Operand, rhs: Operand, width: Width },
    Mul { dst: ValueId, lhs: Operand, rhs: Operand, width: Width },
    /// dst = src shifted by `amount % width.bits()`. A32 shifts that need
    /// the amount == width or carry-out behavior build it from this plus
    /// selects.
    Shift {
        dst: ValueId,
        kind: veloce_types::ShiftType,
        src: Operand,
        amount: Operand,
        width: Width,
    },
    /// Byte-reverse the whole `width`-sized value.
    Rev { dst: ValueId, src: Operand, width: Width },
    /// Byte-reverse each 16-bit lane.
    Rev16 { dst: ValueId, src: Operand, width: Width },
    /// Byte-reverse each 32-bit lane of a 64-bit value.
    Rev32 { dst: ValueId, src: Operand },
    RBit { dst: ValueId, src: Operand, width: Width },
    /// Count leading zeros; all-zero input yields `width.bits()`.
    Clz { dst: ValueId, src: Operand, width: Width },
    /// dst = 1 if the `width`-sized value is zero, else 0. Used for CBZ,
    /// TBZ and friends, which test a register without touching NZCV.
    IsZero { dst: ValueId, src: Operand, width: Width },
    /// dst = cond(bit 0) != 0 ? if_true : if_false. Always branchless.
    Select {
        dst: ValueId,
        cond: Operand,
        if_true: Operand,
        if_false: Operand,
    },

    /// Guest load through the memory callback. `pc` is the guest PC of the
    /// originating instruction, stored to context before the call so faults
    /// report it exactly.
    Load { dst: ValueId, addr: Operand, size: MemSize, pc: u64 },
    Store { addr: Operand, src: Operand, size: MemSize, pc: u64 },
    /// Exclusive load: marks the monitor and reads. A `U128` access leaves
    /// the low half in `dst` and the high half in the pair scratch slot,
    /// read back with [`Inst::ReadPairHigh`].
    LoadExclusive { dst: ValueId, addr: Operand, size: MemSize, pc: u64 },
    ReadPairHigh { dst: ValueId },
    /// Exclusive store; dst = 0 on success, 1 on a lost reservation.
    StoreExclusive {
        dst: ValueId,
        addr: Operand,
        src: Operand,
        size: MemSize,
        pc: u64,
    },
    StoreExclusivePair {
        dst: ValueId,
        addr: Operand,
        lo: Operand,
        hi: Operand,
        pc: u64,
    },
    ClearExclusive,

    /// Scalar FP through the FP callback; reads FPCR, accumulates FPSR.
    Fp {
        dst: ValueId,
        op: FpBinOp,
        width: Width,
        lhs: Operand,
        rhs: Operand,
    },
    CallSupervisor { imm: u32, pc: u64 },
    SysRegRead { dst: ValueId, sysreg: u32, pc: u64 },
    SysRegWrite { sysreg: u32, src: Operand, pc: u64 },
    /// Retired-instruction counter (CNTPCT_EL0).
    GetTicks { dst: ValueId },

    /// Erased instruction; removed by dead-code elimination.
    Nop,
}

/// Every block ends in exactly one terminator. Static successors are named
/// by [`LocationDescriptor`] so the dispatcher can link compiled blocks
/// directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    /// Unconditional jump to a statically known location (patchable).
    LinkBlock { target: LocationDescriptor },
    /// Indirect jump: write `next_pc` to the context and return to the
    /// dispatcher, which re-derives the location key.
    ReturnToDispatch { next_pc: Operand },
    /// Two-way branch on an already-materialized boolean value; both edges
    /// are patchable.
    If {
        cond: Operand,
        then_target: LocationDescriptor,
        else_target: LocationDescriptor,
    },
    /// Deliver an exception at `pc` through the system callback.
    Exception { pc: u64, exception: Exception },
}

bitflags::bitflags! {
    /// Block attribute summary, derived from the instruction list after
    /// optimization. The cache and dispatcher consult it without rescanning
    /// the block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        const MEMORY_READ = 1 << 0;
        const MEMORY_WRITE = 1 << 1;
        /// May raise an exception mid-block (SVC, faulting access).
        const EXCEPTION = 1 << 2;
        const HELPER_CALL = 1 << 3;
    }
}

/// One translated basic block.
///
/// `entry_cond` is the block-entry condition: on A32 a run of equally
/// conditional instructions becomes one block guarded once at entry, jumping
/// to `cond_fail_target` when the guard fails. Unconditional blocks carry
/// `Cond::Al` and no fail target.
#[derive(Debug, Clone)]
pub struct IrBlock {
    pub location: LocationDescriptor,
    pub entry_cond: Cond,
    pub cond_fail_target: Option<LocationDescriptor>,
    /// ITSTATE byte to store to the context when the entry guard fails.
    /// Inside a Thumb IT block the IT advance happens whether or not the
    /// guarded instruction executes; the executing path carries an explicit
    /// [`Inst::SetCtxField`] instead.
    pub cond_fail_it: Option<u8>,
    pub insts: Vec<Inst>,
    pub terminator: Terminator,
    /// Guest instructions decoded into this block; charged against the run
    /// budget at block entry.
    pub cycle_count: u32,
    /// Guest code bytes this block was translated from, for invalidation.
    pub guest_start: u64,
    pub guest_len: u32,
    pub flags: BlockFlags,
    next_value: u32,
}

impl IrBlock {
    pub fn new(location: LocationDescriptor) -> IrBlock {
        IrBlock {
            location,
            entry_cond: Cond::Al,
            cond_fail_target: None,
            cond_fail_it: None,
            insts: Vec::new(),
            terminator: Terminator::ReturnToDispatch {
                next_pc: Operand::Imm(0),
            },
            cycle_count: 0,
            guest_start: 0,
            guest_len: 0,
            flags: BlockFlags::empty(),
            next_value: 0,
        }
    }

    /// Recompute the attribute flags from the instruction list. Run after
    /// translation and again after optimization, which can remove the last
    /// memory access or helper call.
    pub fn update_flags(&mut self) {
        let mut flags = BlockFlags::empty();
        for inst in &self.insts {
            match inst {
                Inst::Load { .. } | Inst::LoadExclusive { .. } => {
                    flags |= BlockFlags::MEMORY_READ | BlockFlags::EXCEPTION;
                }
                Inst::Store { .. }
                | Inst::StoreExclusive { .. }
                | Inst::StoreExclusivePair { .. } => {
                    flags |= BlockFlags::MEMORY_WRITE | BlockFlags::EXCEPTION;
                }
                Inst::CallSupervisor { .. } => flags |= BlockFlags::EXCEPTION,
                _ => {}
            }
            if inst.is_helper_call() {
                flags |= BlockFlags::HELPER_CALL;
            }
        }
        if matches!(self.terminator, Terminator::Exception { .. }) {
            flags |= BlockFlags::EXCEPTION;
        }
        self.flags = flags;
    }

    /// True if executing the block's body changes no observable guest
    /// state. A self-targeting block with an effect-free body can never
    /// leave its loop, which is what idle-loop detection keys on.
    pub fn is_effect_free(&self) -> bool {
        self.insts.iter().all(|inst| !inst.has_side_effect())
    }

    pub fn new_value(&mut self) -> ValueId {
        let id = self.next_value;
        self.next_value = self
            .next_value
            .checked_add(1)
            .expect("IR ValueId space exhausted");
        ValueId(id)
    }

    pub fn value_count(&self) -> u32 {
        self.next_value
    }

    pub fn push(&mut self, inst: Inst) {
        self.insts.push(inst);
    }
}

impl Inst {
    /// Value defined by this instruction, if any.
    pub fn dst(&self) -> Option<ValueId> {
        use Inst::*;
        match *self {
            GetReg { dst, .. }
            | GetVecElem { dst, .. }
            | GetNzcv { dst }
            | TestCond { dst, .. }
            | GetCtxField { dst, .. }
            | AddWithCarry { dst, .. }
            | And { dst, .. }
            | Orr { dst, .. }
            | Eor { dst, .. }
            | Mul { dst, .. }
            | Shift { dst, .. }
            | Rev { dst, .. }
            | Rev16 { dst, .. }
            | Rev32 { dst, .. }
            | RBit { dst, .. }
            | Clz { dst, .. }
            | IsZero { dst, .. }
            | Select { dst, .. }
            | Load { dst, .. }
            | LoadExclusive { dst, .. }
            | ReadPairHigh { dst }
            | StoreExclusive { dst, .. }
            | StoreExclusivePair { dst, .. }
            | Fp { dst, .. }
            | SysRegRead { dst, .. }
            | GetTicks { dst } => Some(dst),
            SetReg { .. }
            | SetVecElem { .. }
            | SetNzcv { .. }
            | SetNzFromValue { .. }
            | SetFlag { .. }
            | SetCtxField { .. }
            | Store { .. }
            | ClearExclusive
            | CallSupervisor { .. }
            | SysRegWrite { .. }
            | Nop => None,
        }
    }

    /// Visit every operand slot, mutably. Used by folding to substitute
    /// computed constants into later uses.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Operand)) {
        use Inst::*;
        match self {
            SetReg { src, .. }
            | SetVecElem { src, .. }
            | SetNzcv { src, .. }
            | SetNzFromValue { src, .. }
            | SetFlag { src, .. }
            | SetCtxField { src, .. }
            | Rev { src, .. }
            | Rev16 { src, .. }
            | Rev32 { src, .. }
            | RBit { src, .. }
            | Clz { src, .. }
            | IsZero { src, .. }
            | SysRegWrite { src, .. } => f(src),
            AddWithCarry {
                lhs, rhs, carry, ..
            } => {
                f(lhs);
                f(rhs);
                f(carry);
            }
            And { lhs, rhs, .. }
            | Orr { lhs, rhs, .. }
            | Eor { lhs, rhs, .. }
            | Mul { lhs, rhs, .. }
            | Fp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Shift { src, amount, .. } => {
                f(src);
                f(amount);
            }
            Select {
                cond,
                if_true,
                if_false,
                ..
            } => {
                f(cond);
                f(if_true);
                f(if_false);
            }
            Load { addr, .. } | LoadExclusive { addr, .. } => f(addr),
            Store { addr, src, .. } | StoreExclusive { addr, src, .. } => {
                f(addr);
                f(src);
            }
            StoreExclusivePair { addr, lo, hi, .. } => {
                f(addr);
                f(lo);
                f(hi);
            }
            GetReg { .. }
            | GetVecElem { .. }
            | GetNzcv { .. }
            | TestCond { .. }
            | GetCtxField { .. }
            | ReadPairHigh { .. }
            | ClearExclusive
            | CallSupervisor { .. }
            | SysRegRead { .. }
            | GetTicks { .. }
            | Nop => {}
        }
    }

    pub fn for_each_use(&self, mut f: impl FnMut(ValueId)) {
        // Share the slot walk with the mutable visitor via a clone-free
        // match would duplicate it; a throwaway clone keeps one source of
        // truth and blocks are small.
        let mut copy = self.clone();
        copy.for_each_operand_mut(|op| {
            if let Operand::Value(v) = *op {
                f(v);
            }
        });
    }

    /// NZCV flags written by this instruction.
    pub fn flags_written(&self) -> FlagSet {
        match *self {
            Inst::AddWithCarry { flags, .. } => flags,
            Inst::SetNzcv { flags, .. } => flags,
            Inst::SetNzFromValue { flags, .. } => flags,
            Inst::SetFlag { flag, .. } => FlagSet::from_flag(flag),
            _ => FlagSet::EMPTY,
        }
    }

    /// NZCV flags read by this instruction.
    pub fn flags_read(&self) -> FlagSet {
        match *self {
            Inst::TestCond { cond, .. } => cond.flags_read(),
            Inst::GetNzcv { .. } => FlagSet::NZCV,
            _ => FlagSet::EMPTY,
        }
    }

    /// Narrow this instruction's flag writes to `live`. Flag-only writers
    /// whose entire output is dead become [`Inst::Nop`].
    pub fn narrow_flags(&mut self, live: FlagSet) {
        match self {
            Inst::AddWithCarry { flags, .. } => *flags = flags.intersect(live),
            Inst::SetNzcv { flags, .. } => {
                *flags = flags.intersect(live);
                if flags.is_empty() {
                    *self = Inst::Nop;
                }
            }
            Inst::SetNzFromValue { flags, .. } => {
                *flags = flags.intersect(live);
                if flags.is_empty() {
                    *self = Inst::Nop;
                }
            }
            Inst::SetFlag { flag, .. } => {
                if !live.contains(FlagSet::from_flag(*flag)) {
                    *self = Inst::Nop;
                }
            }
            _ => {}
        }
    }

    /// True if the instruction must survive dead-code elimination even when
    /// its value (if any) is unused: guest-state writes, memory and monitor
    /// traffic, helper calls with observable effects.
    pub fn has_side_effect(&self) -> bool {
        use Inst::*;
        match self {
            SetReg { .. }
            | SetVecElem { .. }
            | SetCtxField { .. }
            | Store { .. }
            | LoadExclusive { .. }
            | StoreExclusive { .. }
            | StoreExclusivePair { .. }
            | ClearExclusive
            | CallSupervisor { .. }
            | SysRegRead { .. }
            | SysRegWrite { .. }
            | Fp { .. } => true,
            // Loads can fault; removing one would hide the abort.
            Load { .. } => true,
            SetNzcv { flags, .. } | SetNzFromValue { flags, .. } => !flags.is_empty(),
            SetFlag { .. } => true,
            AddWithCarry { flags, .. } => !flags.is_empty(),
            GetReg { .. }
            | GetVecElem { .. }
            | GetNzcv { .. }
            | TestCond { .. }
            | GetCtxField { .. }
            | ReadPairHigh { .. }
            | And { .. }
            | Orr { .. }
            | Eor { .. }
            | Mul { .. }
            | Shift { .. }
            | Rev { .. }
            | Rev16 { .. }
            | Rev32 { .. }
            | RBit { .. }
            | Clz { .. }
            | IsZero { .. }
            | Select { .. }
            | GetTicks { .. }
            | Nop => false,
        }
    }

    /// True for instructions lowered to a host helper call (the register
    /// allocator spills caller-saved state around these).
    pub fn is_helper_call(&self) -> bool {
        use Inst::*;
        matches!(
            self,
            Load { .. }
                | Store { .. }
                | LoadExclusive { .. }
                | StoreExclusive { .. }
                | StoreExclusivePair { .. }
                | ClearExclusive
                | Fp { .. }
                | CallSupervisor { .. }
                | SysRegRead { .. }
                | SysRegWrite { .. }
                | GetTicks { .. }
        )
    }
}

impl Terminator {
    pub fn for_each_use(&self, mut f: impl FnMut(ValueId)) {
        match *self {
            Terminator::ReturnToDispatch {
                next_pc: Operand::Value(v),
            } => f(v),
            Terminator::If {
                cond: Operand::Value(v),
                ..
            } => f(v),
            _ => {}
        }
    }

    /// Static successors, in patch-slot order.
    pub fn static_targets(&self) -> impl Iterator<Item = LocationDescriptor> + '_ {
        let pair = match *self {
            Terminator::LinkBlock { target } => [Some(target), None],
            Terminator::If {
                then_target,
                else_target,
                ..
            } => [Some(then_target), Some(else_target)],
            _ => [None, None],
        };
        pair.into_iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_ids_are_dense() {
        let mut b = IrBlock::new(LocationDescriptor(0x1000));
        let a = b.new_value();
        let c = b.new_value();
        assert_eq!(a, ValueId(0));
        assert_eq!(c, ValueId(1));
        assert_eq!(b.value_count(), 2);
    }

    #[test]
    fn flag_metadata() {
        let add = Inst::AddWithCarry {
            dst: ValueId(0),
            lhs: Operand::Imm(1),
            rhs: Operand::Imm(2),
            carry: Operand::Imm(0),
            width: Width::W64,
            flags: FlagSet::NZCV,
        };
        assert_eq!(add.flags_written(), FlagSet::NZCV);
        assert!(add.has_side_effect());

        let mut narrowed = add.clone();
        narrowed.narrow_flags(FlagSet::EMPTY);
        assert_eq!(narrowed.flags_written(), FlagSet::EMPTY);
        assert!(!narrowed.has_side_effect());

        let mut set_nz = Inst::SetNzFromValue {
            src: Operand::Value(ValueId(0)),
            width: Width::W32,
            flags: FlagSet::NZ,
        };
        set_nz.narrow_flags(FlagSet::C);
        assert_eq!(set_nz, Inst::Nop);
    }

    #[test]
    fn operand_visitors_agree() {
        let sel = Inst::Select {
            dst: ValueId(3),
            cond: Operand::Value(ValueId(0)),
            if_true: Operand::Imm(7),
            if_false: Operand::Value(ValueId(2)),
        };
        let mut uses = Vec::new();
        sel.for_each_use(|v| uses.push(v));
        assert_eq!(uses, vec![ValueId(0), ValueId(2)]);
    }

    #[test]
    fn terminator_targets_in_slot_order() {
        let t = Terminator::If {
            cond: Operand::Value(ValueId(0)),
            then_target: LocationDescriptor(0x10),
            else_target: LocationDescriptor(0x20),
        };
        let targets: Vec<_> = t.static_targets().collect();
        assert_eq!(
            targets,
            vec![LocationDescriptor(0x10), LocationDescriptor(0x20)]
        );
    }
}
