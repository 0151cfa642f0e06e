//! Linear-scan register allocation for block emission.
//!
//! Works in two phases per block: a use-position scan over the IR, then
//! on-the-fly assignment during emission. Values live in pool registers or
//! in a per-run spill arena addressed off RSP; when the pool is full the
//! value with the furthest next use is evicted. RAX, R10 and R11 are never
//! allocated and stay free as emission scratch; R13 holds the context
//! pointer for the whole run.

use dynasmrt::{dynasm, DynasmApi};

use crate::ir::{IrBlock, Operand, ValueId};

use super::emit::Assembler;

pub(crate) const RCX: u8 = 1;
pub(crate) const RDX: u8 = 2;
pub(crate) const RBX: u8 = 3;
pub(crate) const RSI: u8 = 6;
pub(crate) const RDI: u8 = 7;
pub(crate) const R8: u8 = 8;
pub(crate) const R9: u8 = 9;
pub(crate) const R10: u8 = 10;
pub(crate) const R11: u8 = 11;
pub(crate) const R12: u8 = 12;
pub(crate) const R14: u8 = 14;
pub(crate) const R15: u8 = 15;

/// Registers handed out to IR values. Caller-saved members come first so
/// short-lived values cluster there and call-crossing values migrate to
/// the callee-saved tail.
pub(crate) const POOL: [u8; 10] = [RCX, RDX, RSI, RDI, R8, R9, RBX, R12, R14, R15];

/// Pool members clobbered by a sysv64 call.
pub(crate) const CALLER_SAVED_POOL: [u8; 6] = [RCX, RDX, RSI, RDI, R8, R9];

/// Spill arena size in 8-byte slots; part of the fixed run frame.
pub(crate) const MAX_SPILL_SLOTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    None,
    Reg(u8),
    Slot(u16),
}

pub(crate) struct Allocator {
    /// Ascending use positions per value; the terminator counts as one past
    /// the last instruction.
    uses: Vec<Vec<u32>>,
    cursor: Vec<usize>,
    loc: Vec<Loc>,
    owner: [Option<ValueId>; 16],
    slot_used: [bool; MAX_SPILL_SLOTS],
    pinned: u16,
}

/// Where a value or operand can be fetched from when marshaling helper
/// arguments (after [`Allocator::spill_for_call`] no live value remains in
/// a caller-saved register).
#[derive(Debug, Clone, Copy)]
pub(crate) enum ArgSrc {
    Imm(u64),
    Reg(u8),
    Slot(u16),
}

impl Allocator {
    pub fn new(block: &IrBlock) -> Allocator {
        let count = block.value_count() as usize;
        let mut uses = vec![Vec::new(); count];
        for (i, inst) in block.insts.iter().enumerate() {
            inst.for_each_use(|v| uses[v.0 as usize].push(i as u32));
        }
        let end = block.insts.len() as u32;
        block.terminator.for_each_use(|v| uses[v.0 as usize].push(end));
        Allocator {
            uses,
            cursor: vec![0; count],
            loc: vec![Loc::None; count],
            owner: [None; 16],
            slot_used: [false; MAX_SPILL_SLOTS],
            pinned: 0,
        }
    }

    /// Start of a new instruction: operand registers become evictable
    /// again.
    pub fn begin_inst(&mut self) {
        self.pinned = 0;
    }

    fn next_use(&self, v: ValueId) -> u32 {
        self.uses[v.0 as usize]
            .get(self.cursor[v.0 as usize])
            .copied()
            .unwrap_or(u32::MAX)
    }

    fn pin(&mut self, reg: u8) {
        self.pinned |= 1 << reg;
    }

    fn take_slot(&mut self) -> u16 {
        let slot = self
            .slot_used
            .iter()
            .position(|used| !used)
            .expect("spill slot arena exhausted");
        self.slot_used[slot] = true;
        slot as u16
    }

    fn spill(&mut self, ops: &mut Assembler, reg: u8) {
        let v = self.owner[reg as usize].expect("spilling an unowned register");
        let slot = self.take_slot();
        dynasm!(ops
            ; .arch x64
            ; mov [rsp + slot as i32 * 8], Rq(reg)
        );
        self.loc[v.0 as usize] = Loc::Slot(slot);
        self.owner[reg as usize] = None;
    }

    /// Take a pool register, evicting the unpinned value with the furthest
    /// next use when none is free.
    fn alloc_reg(&mut self, ops: &mut Assembler) -> u8 {
        for &reg in &POOL {
            if self.owner[reg as usize].is_none() && self.pinned & 1 << reg == 0 {
                return reg;
            }
        }
        let victim = POOL
            .iter()
            .copied()
            .filter(|&r| self.pinned & 1 << r == 0)
            .max_by_key(|&r| {
                let v = self.owner[r as usize].expect("full pool register has an owner");
                self.next_use(v)
            })
            .expect("register pool fully pinned");
        self.spill(ops, victim);
        victim
    }

    /// Place `v` in a register, reloading from its spill slot if needed.
    pub fn read(&mut self, ops: &mut Assembler, v: ValueId) -> u8 {
        match self.loc[v.0 as usize] {
            Loc::Reg(reg) => {
                self.pin(reg);
                reg
            }
            Loc::Slot(slot) => {
                let reg = self.alloc_reg(ops);
                dynasm!(ops
                    ; .arch x64
                    ; mov Rq(reg), [rsp + slot as i32 * 8]
                );
                self.slot_used[slot as usize] = false;
                self.loc[v.0 as usize] = Loc::Reg(reg);
                self.owner[reg as usize] = Some(v);
                self.pin(reg);
                reg
            }
            Loc::None => panic!("read of undefined IR value {v:?}"),
        }
    }

    /// Allocate a destination register for a freshly defined value.
    pub fn write(&mut self, ops: &mut Assembler, v: ValueId) -> u8 {
        let reg = self.alloc_reg(ops);
        self.owner[reg as usize] = Some(v);
        self.loc[v.0 as usize] = Loc::Reg(reg);
        self.pin(reg);
        reg
    }

    /// Place `v` in a specific register (shift amounts need CL).
    pub fn read_fixed(&mut self, ops: &mut Assembler, v: ValueId, reg: u8) {
        if self.loc[v.0 as usize] == Loc::Reg(reg) {
            self.pin(reg);
            return;
        }
        self.pin(reg);
        if let Some(tenant) = self.owner[reg as usize] {
            let other = self.alloc_reg(ops);
            dynasm!(ops
                ; .arch x64
                ; mov Rq(other), Rq(reg)
            );
            self.owner[other as usize] = Some(tenant);
            self.loc[tenant.0 as usize] = Loc::Reg(other);
            self.owner[reg as usize] = None;
        }
        match self.loc[v.0 as usize] {
            Loc::Reg(from) => {
                dynasm!(ops
                    ; .arch x64
                    ; mov Rq(reg), Rq(from)
                );
                self.owner[from as usize] = None;
            }
            Loc::Slot(slot) => {
                dynasm!(ops
                    ; .arch x64
                    ; mov Rq(reg), [rsp + slot as i32 * 8]
                );
                self.slot_used[slot as usize] = false;
            }
            Loc::None => panic!("read of undefined IR value {v:?}"),
        }
        self.owner[reg as usize] = Some(v);
        self.loc[v.0 as usize] = Loc::Reg(reg);
    }

    /// Move every live value out of caller-saved registers ahead of a
    /// helper call.
    pub fn spill_for_call(&mut self, ops: &mut Assembler) {
        for &reg in &CALLER_SAVED_POOL {
            if self.owner[reg as usize].is_some() {
                self.spill(ops, reg);
            }
        }
    }

    /// Fetch location for argument marshaling. Valid between
    /// [`Allocator::spill_for_call`] and the call itself.
    pub fn arg_src(&self, operand: Operand) -> ArgSrc {
        match operand {
            Operand::Imm(imm) => ArgSrc::Imm(imm),
            Operand::Value(v) => match self.loc[v.0 as usize] {
                Loc::Reg(reg) => ArgSrc::Reg(reg),
                Loc::Slot(slot) => ArgSrc::Slot(slot),
                Loc::None => panic!("read of undefined IR value {v:?}"),
            },
        }
    }

    /// Retire one use of each operand value; storage for values past their
    /// last use is released.
    pub fn retire_use(&mut self, v: ValueId) {
        self.cursor[v.0 as usize] += 1;
        if self.cursor[v.0 as usize] >= self.uses[v.0 as usize].len() {
            self.release(v);
        }
    }

    /// Drop a defined value that is never used (status results of stores
    /// whose destination register is the zero register, for example).
    pub fn release_if_dead(&mut self, v: ValueId) {
        if self.uses[v.0 as usize].is_empty() {
            self.release(v);
        }
    }

    fn release(&mut self, v: ValueId) {
        match self.loc[v.0 as usize] {
            Loc::Reg(reg) => self.owner[reg as usize] = None,
            Loc::Slot(slot) => self.slot_used[slot as usize] = false,
            Loc::None => {}
        }
        self.loc[v.0 as usize] = Loc::None;
    }
}
