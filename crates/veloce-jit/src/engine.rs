//! Engine control surfaces and the dispatcher.
//!
//! [`A64Engine`] and [`A32Engine`] wrap a shared core: guest context,
//! callback bundle, block cache and (on x86-64 hosts) the native code
//! arena. `run` drives the translate/compile/link/execute cycle until the
//! instruction budget drains or the system handler halts; `step` executes a
//! single guest instruction through the IR interpreter regardless of host
//! architecture, which is what the differential tests lean on.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::callbacks::{Exception, ExceptionAction, FpOps, Memory, SystemHandler};
use crate::ctx::JitContext;
use crate::frontend;
use crate::interp::{self, BlockExit, InterpEnv};
use crate::ir::{IrBlock, LocationDescriptor};
use crate::monitor::ExclusiveMonitor;
use crate::opt;

#[cfg(target_arch = "x86_64")]
use crate::backend::x64::{CompiledCode, JitArena, RuntimeEnv};
#[cfg(target_arch = "x86_64")]
use crate::backend::ExitCode;
#[cfg(target_arch = "x86_64")]
use crate::cache::{BlockCache, CachedBlock, LinkState};
#[cfg(target_arch = "x86_64")]
use crate::ctx::FAULT_NONE;
#[cfg(not(target_arch = "x86_64"))]
use crate::cache::{BlockCache, CachedBlock};

/// Why [`run`](A64Engine::run) returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The instruction budget is spent.
    BudgetExhausted,
    /// The guest entered a loop that can never change state; the remaining
    /// budget was drained without executing it.
    IdleLoop,
    /// The system handler answered an exception with
    /// [`ExceptionAction::Halt`].
    Halted,
}

/// Outcome of a single [`step`](A64Engine::step).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    Executed,
    Halted,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("processor id {id} out of range for a monitor with {count} slots")]
    ProcessorIdOutOfRange { id: usize, count: usize },
}

/// Construction parameters shared by both engines.
pub struct EngineConfig {
    pub mem: Box<dyn Memory>,
    pub sys: Box<dyn SystemHandler>,
    pub fp: Box<dyn FpOps>,
    /// Shared global monitor; engines built without one get a private
    /// single-processor monitor.
    pub monitor: Option<Arc<ExclusiveMonitor>>,
    pub processor_id: usize,
    /// Upper bound on guest instructions decoded into one block.
    pub max_block_instructions: usize,
    pub optimize: bool,
}

impl EngineConfig {
    pub fn new(
        mem: Box<dyn Memory>,
        sys: Box<dyn SystemHandler>,
        fp: Box<dyn FpOps>,
    ) -> EngineConfig {
        EngineConfig {
            mem,
            sys,
            fp,
            monitor: None,
            processor_id: 0,
            max_block_instructions: 32,
            optimize: true,
        }
    }
}

/// Cloneable cross-thread invalidation signal. Ranges queued here are
/// applied at the next dispatch boundary, never while a block is running.
#[derive(Clone, Default)]
pub struct InvalidationHandle {
    inner: Arc<Mutex<Pending>>,
}

#[derive(Default)]
struct Pending {
    ranges: Vec<(u64, u64)>,
    all: bool,
}

impl InvalidationHandle {
    pub fn new() -> InvalidationHandle {
        InvalidationHandle::default()
    }

    /// Queue invalidation of guest code bytes `[start, end)`.
    pub fn invalidate_range(&self, start: u64, end: u64) {
        self.inner
            .lock()
            .expect("invalidation queue poisoned")
            .ranges
            .push((start, end));
    }

    pub fn invalidate_all(&self) {
        self.inner
            .lock()
            .expect("invalidation queue poisoned")
            .all = true;
    }

    fn take(&self) -> (Vec<(u64, u64)>, bool) {
        let mut pending = self.inner.lock().expect("invalidation queue poisoned");
        let all = std::mem::take(&mut pending.all);
        (std::mem::take(&mut pending.ranges), all)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum GuestArch {
    A64,
    A32,
}

struct Core {
    arch: GuestArch,
    ctx: Box<JitContext>,
    mem: Box<dyn Memory>,
    sys: Box<dyn SystemHandler>,
    fp: Box<dyn FpOps>,
    monitor: Arc<ExclusiveMonitor>,
    processor_id: usize,
    max_block_insts: usize,
    optimize: bool,
    pending: InvalidationHandle,
    #[cfg(target_arch = "x86_64")]
    arena: JitArena,
    #[cfg(target_arch = "x86_64")]
    cache: BlockCache<CompiledCode>,
    /// Exception table indexed by the exit words of `Exception`
    /// terminators; lives as long as the arena.
    #[cfg(target_arch = "x86_64")]
    exceptions: Vec<Exception>,
    #[cfg(not(target_arch = "x86_64"))]
    cache: BlockCache<IrBlock>,
}

impl Core {
    fn new(arch: GuestArch, config: EngineConfig) -> Result<Core, EngineError> {
        let monitor = config
            .monitor
            .unwrap_or_else(|| Arc::new(ExclusiveMonitor::new(1)));
        if config.processor_id >= monitor.processor_count() {
            return Err(EngineError::ProcessorIdOutOfRange {
                id: config.processor_id,
                count: monitor.processor_count(),
            });
        }
        Ok(Core {
            arch,
            ctx: Box::new(JitContext::new()),
            mem: config.mem,
            sys: config.sys,
            fp: config.fp,
            monitor,
            processor_id: config.processor_id,
            max_block_insts: config.max_block_instructions.max(1),
            optimize: config.optimize,
            pending: InvalidationHandle::new(),
            #[cfg(target_arch = "x86_64")]
            arena: JitArena::new(),
            #[cfg(target_arch = "x86_64")]
            cache: BlockCache::new(),
            #[cfg(target_arch = "x86_64")]
            exceptions: Vec::new(),
            #[cfg(not(target_arch = "x86_64"))]
            cache: BlockCache::new(),
        })
    }

    fn current_location(&self) -> LocationDescriptor {
        match self.arch {
            GuestArch::A64 => frontend::a64_location(self.ctx.pc, self.ctx.fpcr),
            GuestArch::A32 => frontend::a32_location(
                self.ctx.pc as u32,
                self.ctx.cpsr_thumb != 0,
                self.ctx.it_state as u8,
                self.ctx.fpcr,
            ),
        }
    }

    fn location_pc(&self, loc: LocationDescriptor) -> u64 {
        match self.arch {
            GuestArch::A64 => frontend::a64_location_pc(loc),
            GuestArch::A32 => frontend::a32_location_pc(loc) as u64,
        }
    }

    fn translate(&mut self, loc: LocationDescriptor) -> IrBlock {
        let mut block = match self.arch {
            GuestArch::A64 => frontend::a64::translate(&mut *self.mem, loc, self.max_block_insts),
            GuestArch::A32 => frontend::a32::translate(&mut *self.mem, loc, self.max_block_insts),
        };
        if self.optimize {
            opt::optimize(&mut block);
        }
        block
    }

    /// Answer from the system handler to a delivered exception; true means
    /// keep running.
    fn deliver(&mut self, pc: u64, exception: Exception) -> bool {
        match self.sys.exception_raised(pc, exception) {
            ExceptionAction::Resume { pc } => {
                self.ctx.pc = pc;
                true
            }
            ExceptionAction::Halt => false,
        }
    }

    fn run(&mut self, budget: u64) -> RunExit {
        self.drain_invalidations();
        // Roll the spent part of any previous budget into the tick base
        // before installing the new one.
        self.ctx.tick_base = self.ctx.ticks();
        self.ctx.budget_start = budget as i64;
        self.ctx.remaining = budget as i64;
        self.dispatch_loop()
    }

    /// Execute one guest instruction through the IR interpreter.
    fn step(&mut self) -> StepExit {
        self.drain_invalidations();
        let loc = self.current_location();
        let block = self.translate_for_step(loc);
        self.ctx.remaining -= block.cycle_count as i64;
        let exit = {
            let mut env = InterpEnv {
                ctx: &mut self.ctx,
                mem: &mut *self.mem,
                sys: &mut *self.sys,
                fp: &*self.fp,
                monitor: &self.monitor,
                processor_id: self.processor_id,
            };
            interp::run_block(&block, &mut env)
        };
        match exit {
            BlockExit::Link(target) => {
                self.ctx.pc = self.location_pc(target);
                StepExit::Executed
            }
            BlockExit::Dispatch(pc) => {
                self.ctx.pc = pc;
                StepExit::Executed
            }
            BlockExit::Exception { pc, exception } => {
                if self.deliver(pc, exception) {
                    StepExit::Executed
                } else {
                    StepExit::Halted
                }
            }
        }
    }

    fn translate_for_step(&mut self, loc: LocationDescriptor) -> IrBlock {
        match self.arch {
            GuestArch::A64 => frontend::a64::translate(&mut *self.mem, loc, 1),
            GuestArch::A32 => frontend::a32::translate(&mut *self.mem, loc, 1),
        }
    }

    fn invalidate_range(&mut self, start: u64, end: u64) {
        self.pending.invalidate_range(start, end);
        self.drain_invalidations();
    }

    fn invalidate_all(&mut self) {
        self.pending.invalidate_all();
        self.drain_invalidations();
    }

    fn invalidation_handle(&self) -> InvalidationHandle {
        self.pending.clone()
    }

    fn drain_invalidations(&mut self) {
        let (ranges, all) = self.pending.take();
        if all {
            self.apply_invalidate_all();
            return;
        }
        for (start, end) in ranges {
            self.apply_invalidate_range(start, end);
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Core {
    fn dispatch_loop(&mut self) -> RunExit {
        let mut next: Option<LocationDescriptor> = None;
        loop {
            self.drain_invalidations();
            let loc = next.take().unwrap_or_else(|| self.current_location());
            let id = match self.cache.find(loc) {
                Some(id) => id,
                None => self.compile_block(loc),
            };
            let entry = self.cache.get(id).code.entry;
            let (word, fault) = {
                let mut env = RuntimeEnv {
                    mem: &mut *self.mem,
                    sys: &mut *self.sys,
                    fp: &*self.fp,
                    monitor: &self.monitor,
                    processor_id: self.processor_id,
                    fault: None,
                };
                self.ctx.env = &mut env as *mut RuntimeEnv as *mut core::ffi::c_void;
                let word = unsafe { self.arena.execute(&mut *self.ctx, entry) };
                self.ctx.env = std::ptr::null_mut();
                (word, env.fault)
            };
            match ExitCode::decode(word) {
                ExitCode::Dispatch => {}
                ExitCode::Budget => return RunExit::BudgetExhausted,
                ExitCode::Exception { index } => {
                    let exception = self.exceptions[index];
                    if !self.deliver(self.ctx.pc, exception) {
                        return RunExit::Halted;
                    }
                }
                ExitCode::Link { block_id, slot } => {
                    let source = self.cache.get(block_id);
                    let site = source.code.patch_sites[slot as usize];
                    if site.target == source.location && source.effect_free {
                        self.ctx.pc = self.location_pc(site.target);
                        self.ctx.remaining = 0;
                        return RunExit::IdleLoop;
                    }
                    let target_id = match self.cache.find(site.target) {
                        Some(id) => id,
                        None => self.compile_block(site.target),
                    };
                    let target_label = self.cache.get(target_id).code.entry_label;
                    self.arena.link(&site, target_label);
                    self.cache.mark_linked(block_id, slot);
                    next = Some(site.target);
                }
                ExitCode::Fault => {
                    self.ctx.fault = FAULT_NONE;
                    let fault = fault.expect("fault exit without a recorded fault");
                    if !self.deliver(self.ctx.pc, Exception::DataAbort(fault)) {
                        return RunExit::Halted;
                    }
                }
            }
        }
    }

    fn compile_block(&mut self, loc: LocationDescriptor) -> u32 {
        let block = self.translate(loc);
        let id = self.cache.next_id();
        let code = self
            .arena
            .compile(&block, id, block.guest_start, &mut self.exceptions);
        let links = code
            .patch_sites
            .iter()
            .map(|site| LinkState {
                target: site.target,
                linked: false,
            })
            .collect();
        tracing::debug!(
            location = loc.0,
            guest_start = block.guest_start,
            insts = block.cycle_count,
            "compiled block"
        );
        self.cache.insert(CachedBlock {
            location: loc,
            guest_start: block.guest_start,
            guest_end: block.guest_start + block.guest_len as u64,
            flags: block.flags,
            effect_free: block.is_effect_free(),
            code,
            links,
        })
    }

    fn apply_invalidate_range(&mut self, start: u64, end: u64) {
        for (id, slot) in self.cache.invalidate_range(start, end) {
            let site = self.cache.get(id).code.patch_sites[slot as usize];
            self.arena.unlink(&site);
        }
    }

    fn apply_invalidate_all(&mut self) {
        tracing::debug!("invalidating all cached blocks");
        self.cache.clear();
        self.exceptions.clear();
        // Dropping the old arena releases its executable pages.
        self.arena = JitArena::new();
    }

    fn compile_count(&self) -> u64 {
        self.cache.compile_count()
    }
}

#[cfg(not(target_arch = "x86_64"))]
impl Core {
    fn dispatch_loop(&mut self) -> RunExit {
        let mut next: Option<LocationDescriptor> = None;
        loop {
            self.drain_invalidations();
            let loc = next.take().unwrap_or_else(|| self.current_location());
            if self.ctx.remaining <= 0 {
                self.ctx.pc = self.location_pc(loc);
                return RunExit::BudgetExhausted;
            }
            let id = match self.cache.find(loc) {
                Some(id) => id,
                None => self.compile_block(loc),
            };
            let entry = self.cache.get(id);
            let cycle_count = entry.code.cycle_count;
            let effect_free = entry.effect_free;
            self.ctx.remaining -= cycle_count as i64;
            let exit = {
                // The cache is append-only while this borrow lives; split
                // it off so the interpreter can borrow the rest of self.
                let block: *const IrBlock = &entry.code;
                let mut env = InterpEnv {
                    ctx: &mut self.ctx,
                    mem: &mut *self.mem,
                    sys: &mut *self.sys,
                    fp: &*self.fp,
                    monitor: &self.monitor,
                    processor_id: self.processor_id,
                };
                interp::run_block(unsafe { &*block }, &mut env)
            };
            match exit {
                BlockExit::Link(target) => {
                    if target == loc && effect_free {
                        self.ctx.pc = self.location_pc(target);
                        self.ctx.remaining = 0;
                        return RunExit::IdleLoop;
                    }
                    next = Some(target);
                }
                BlockExit::Dispatch(pc) => self.ctx.pc = pc,
                BlockExit::Exception { pc, exception } => {
                    if !self.deliver(pc, exception) {
                        return RunExit::Halted;
                    }
                }
            }
        }
    }

    fn compile_block(&mut self, loc: LocationDescriptor) -> u32 {
        let block = self.translate(loc);
        tracing::debug!(
            location = loc.0,
            guest_start = block.guest_start,
            insts = block.cycle_count,
            "translated block"
        );
        self.cache.insert(CachedBlock {
            location: loc,
            guest_start: block.guest_start,
            guest_end: block.guest_start + block.guest_len as u64,
            flags: block.flags,
            effect_free: block.is_effect_free(),
            links: Vec::new(),
            code: block,
        })
    }

    fn apply_invalidate_range(&mut self, start: u64, end: u64) {
        self.cache.invalidate_range(start, end);
    }

    fn apply_invalidate_all(&mut self) {
        tracing::debug!("invalidating all cached blocks");
        self.cache.clear();
    }

    fn compile_count(&self) -> u64 {
        self.cache.compile_count()
    }
}

macro_rules! shared_engine_api {
    () => {
        /// Execute up to `budget` guest instructions.
        pub fn run(&mut self, budget: u64) -> RunExit {
            self.core.run(budget)
        }

        /// Execute a single guest instruction.
        pub fn step(&mut self) -> StepExit {
            self.core.step()
        }

        /// Guest instructions retired since construction (the value
        /// CNTPCT_EL0 reads).
        pub fn ticks(&self) -> u64 {
            self.core.ctx.ticks()
        }

        pub fn invalidate_range(&mut self, start: u64, end: u64) {
            self.core.invalidate_range(start, end);
        }

        pub fn invalidate_all(&mut self) {
            self.core.invalidate_all();
        }

        /// Handle for queueing invalidations from other threads.
        pub fn invalidation_handle(&self) -> InvalidationHandle {
            self.core.invalidation_handle()
        }

        /// Blocks translated since construction; invalidation-triggered
        /// re-translation shows up here.
        pub fn compile_count(&self) -> u64 {
            self.core.compile_count()
        }

        pub fn clear_exclusive_state(&mut self) {
            self.core.monitor.clear_processor(self.core.processor_id);
        }

        pub fn nzcv(&self) -> u32 {
            self.core.ctx.nzcv
        }

        pub fn set_nzcv(&mut self, nzcv: u32) {
            self.core.ctx.nzcv = nzcv & 0xf000_0000;
        }

        pub fn fpcr(&self) -> u32 {
            self.core.ctx.fpcr
        }

        pub fn set_fpcr(&mut self, fpcr: u32) {
            self.core.ctx.fpcr = fpcr;
        }

        pub fn fpsr(&self) -> u32 {
            self.core.ctx.fpsr
        }

        pub fn set_fpsr(&mut self, fpsr: u32) {
            self.core.ctx.fpsr = fpsr;
        }

        pub fn vec(&self, reg: usize) -> u128 {
            let [lo, hi] = self.core.ctx.vecs[reg];
            (hi as u128) << 64 | lo as u128
        }

        pub fn set_vec(&mut self, reg: usize, value: u128) {
            self.core.ctx.vecs[reg] = [value as u64, (value >> 64) as u64];
        }
    };
}

/// AArch64 guest processor.
pub struct A64Engine {
    core: Core,
}

impl A64Engine {
    pub fn new(config: EngineConfig) -> Result<A64Engine, EngineError> {
        Ok(A64Engine {
            core: Core::new(GuestArch::A64, config)?,
        })
    }

    shared_engine_api!();

    pub fn x(&self, reg: usize) -> u64 {
        assert!(reg < 31, "X register index out of range");
        self.core.ctx.regs[reg]
    }

    pub fn set_x(&mut self, reg: usize, value: u64) {
        assert!(reg < 31, "X register index out of range");
        self.core.ctx.regs[reg] = value;
    }

    pub fn sp(&self) -> u64 {
        self.core.ctx.regs[31]
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.core.ctx.regs[31] = sp;
    }

    pub fn pc(&self) -> u64 {
        self.core.ctx.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.core.ctx.pc = pc;
    }
}

/// AArch32 guest processor.
pub struct A32Engine {
    core: Core,
}

impl A32Engine {
    pub fn new(config: EngineConfig) -> Result<A32Engine, EngineError> {
        Ok(A32Engine {
            core: Core::new(GuestArch::A32, config)?,
        })
    }

    shared_engine_api!();

    pub fn r(&self, reg: usize) -> u32 {
        assert!(reg < 15, "R register index out of range");
        self.core.ctx.regs[reg] as u32
    }

    pub fn set_r(&mut self, reg: usize, value: u32) {
        assert!(reg < 15, "R register index out of range");
        self.core.ctx.regs[reg] = value as u64;
    }

    pub fn pc(&self) -> u32 {
        self.core.ctx.pc as u32
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.core.ctx.pc = pc as u64;
    }

    pub fn thumb(&self) -> bool {
        self.core.ctx.cpsr_thumb != 0
    }

    pub fn set_thumb(&mut self, thumb: bool) {
        self.core.ctx.cpsr_thumb = thumb as u32;
    }

    pub fn it_state(&self) -> u8 {
        self.core.ctx.it_state as u8
    }

    pub fn set_it_state(&mut self, it: u8) {
        self.core.ctx.it_state = it as u32;
    }
}
