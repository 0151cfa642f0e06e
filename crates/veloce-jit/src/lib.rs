//! Dynamic binary translator for AArch64 and AArch32 guests.
//!
//! Guest instructions are decoded into a small SSA-style IR
//! ([`ir::IrBlock`]), optionally run through the optimizer ([`opt`]), and
//! either compiled to native x86-64 code or executed by the reference
//! interpreter. [`A64Engine`] and [`A32Engine`] are the entry points; the
//! host supplies memory, exception and floating-point behaviour through the
//! traits in [`callbacks`].

pub mod backend;
pub mod cache;
pub mod callbacks;
pub mod ctx;
pub mod engine;
pub mod eval;
pub mod frontend;
pub(crate) mod interp;
pub mod ir;
pub mod monitor;
pub mod opt;

pub use callbacks::{
    Exception, ExceptionAction, FpFlags, FpOps, HostFpOps, MemResult, Memory, MemoryFault,
    SystemHandler,
};
pub use engine::{
    A32Engine, A64Engine, EngineConfig, EngineError, InvalidationHandle, RunExit, StepExit,
};
pub use ir::LocationDescriptor;
pub use monitor::ExclusiveMonitor;
