//! Guest execution context shared between Rust and generated code.
//!
//! [`JitContext`] is the single `#[repr(C)]` struct generated code touches.
//! The emitter addresses it exclusively through the `OFF_*` constants below
//! (the context base lives in a pinned host register for the whole run);
//! helper functions receive `*mut JitContext` and use normal field access.
//!
//! Layout is append-only in spirit: the offset constants are asserted
//! against `memoffset` in tests, so any accidental reorder fails fast
//! instead of corrupting guest state.

/// Architectural and bookkeeping state for one guest processor.
///
/// A64 uses `regs[0..=30]` for X0..X30 and `regs[31]` for SP; A32 uses
/// `regs[0..=14]` with the PC held separately in `pc` (frontends resolve
/// R15 reads to constants). Vector registers are stored as two 64-bit
/// lanes each.
#[repr(C)]
pub struct JitContext {
    pub regs: [u64; 32],
    pub vecs: [[u64; 2]; 32],
    /// Guest PC. Updated by block exits, and by memory/exception
    /// instructions just before their helper call so faults report the
    /// exact faulting instruction.
    pub pc: u64,
    /// Remaining run budget in guest instructions. Charged per block at
    /// entry; a block whose entry check sees zero or less returns to the
    /// dispatcher instead.
    pub remaining: i64,
    /// `remaining` at the start of the current run; the retired count so
    /// far is `budget_start - remaining`.
    pub budget_start: i64,
    /// Instructions retired in previous runs.
    pub tick_base: u64,
    /// High half of the most recent exclusive-pair load.
    pub pair_scratch: u64,
    /// Type-erased pointer to the engine's runtime environment (callbacks,
    /// monitor, pending fault). Valid only while a run is in progress.
    pub env: *mut core::ffi::c_void,
    /// Packed NZCV at bits 31..28; other bits are zero.
    pub nzcv: u32,
    /// A32 Thumb state (0 or 1).
    pub cpsr_thumb: u32,
    /// A32 ITSTATE byte in the architectural encoding.
    pub it_state: u32,
    pub fpcr: u32,
    pub fpsr: u32,
    /// Pending-fault discriminant, see `FAULT_*`. Generated code tests this
    /// after every helper call and bails out through the fault stub.
    pub fault: u32,
}

pub const OFF_REGS: i32 = 0x000;
pub const OFF_VECS: i32 = 0x100;
pub const OFF_PC: i32 = 0x300;
pub const OFF_REMAINING: i32 = 0x308;
pub const OFF_BUDGET_START: i32 = 0x310;
pub const OFF_TICK_BASE: i32 = 0x318;
pub const OFF_PAIR_SCRATCH: i32 = 0x320;
pub const OFF_ENV: i32 = 0x328;
pub const OFF_NZCV: i32 = 0x330;
pub const OFF_CPSR_THUMB: i32 = 0x334;
pub const OFF_IT_STATE: i32 = 0x338;
pub const OFF_FPCR: i32 = 0x33c;
pub const OFF_FPSR: i32 = 0x340;
pub const OFF_FAULT: i32 = 0x344;

pub const fn off_reg(reg: u8) -> i32 {
    OFF_REGS + reg as i32 * 8
}

pub const fn off_vec_lane(reg: u8, lane: u8) -> i32 {
    OFF_VECS + reg as i32 * 16 + lane as i32 * 8
}

/// No fault pending.
pub const FAULT_NONE: u32 = 0;
/// A memory callback returned a fault; details in the runtime environment.
pub const FAULT_MEMORY: u32 = 1;
/// An instruction raised an architectural exception.
pub const FAULT_EXCEPTION: u32 = 2;

impl JitContext {
    pub fn new() -> JitContext {
        JitContext {
            regs: [0; 32],
            vecs: [[0; 2]; 32],
            pc: 0,
            remaining: 0,
            budget_start: 0,
            tick_base: 0,
            pair_scratch: 0,
            env: core::ptr::null_mut(),
            nzcv: 0,
            cpsr_thumb: 0,
            it_state: 0,
            fpcr: 0,
            fpsr: 0,
            fault: FAULT_NONE,
        }
    }

    /// Instructions retired since the context was created, including the
    /// current run. This is the CNTPCT_EL0 value guests observe.
    pub fn ticks(&self) -> u64 {
        self.tick_base
            .wrapping_add((self.budget_start - self.remaining) as u64)
    }
}

impl Default for JitContext {
    fn default() -> JitContext {
        JitContext::new()
    }
}
