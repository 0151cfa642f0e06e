//! x86-64 emitter.
//!
//! Register conventions for generated code:
//!   r13        guest context pointer, live across the whole run
//!   rax        exit word / primary scratch / flag packing
//!   r10, r11   secondary scratch, never allocated to IR values
//!   rsp        host frame with the spill arena at the bottom
//! Everything else is handed out by the allocator in `regalloc`.

mod abi;
mod emit;
mod regalloc;

pub use abi::RuntimeEnv;
pub use emit::{CompiledCode, JitArena, PatchSite};
