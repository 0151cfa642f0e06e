//! Shared harness for the integration tests: RAM-backed guest memory and a
//! recording system handler.
//!
//! Each test binary uses a different subset of the helpers.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use veloce_jit::{
    EngineConfig, Exception, ExceptionAction, HostFpOps, MemResult, Memory, MemoryFault,
    SystemHandler,
};

/// Flat RAM starting at guest address 0. Accesses past the end fault.
pub struct FlatMemory {
    ram: Rc<RefCell<Vec<u8>>>,
}

impl FlatMemory {
    pub fn new(size: usize) -> FlatMemory {
        FlatMemory {
            ram: Rc::new(RefCell::new(vec![0; size])),
        }
    }

    /// Second handle onto the same RAM, for tests that patch guest code
    /// while an engine owns the memory callback.
    pub fn share(&self) -> FlatMemory {
        FlatMemory {
            ram: Rc::clone(&self.ram),
        }
    }

    pub fn write_word(&self, addr: u64, word: u32) {
        self.ram.borrow_mut()[addr as usize..addr as usize + 4]
            .copy_from_slice(&word.to_le_bytes());
    }

    pub fn write_half(&self, addr: u64, half: u16) {
        self.ram.borrow_mut()[addr as usize..addr as usize + 2]
            .copy_from_slice(&half.to_le_bytes());
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let ram = self.ram.borrow();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&ram[addr as usize..addr as usize + 8]);
        u64::from_le_bytes(bytes)
    }

    pub fn write_u64(&self, addr: u64, value: u64) {
        self.ram.borrow_mut()[addr as usize..addr as usize + 8]
            .copy_from_slice(&value.to_le_bytes());
    }

    fn get(&self, addr: u64, bytes: usize, write: bool) -> MemResult<std::ops::Range<usize>> {
        let start = addr as usize;
        let end = start.checked_add(bytes);
        match end {
            Some(end) if end <= self.ram.borrow().len() => Ok(start..end),
            _ => Err(MemoryFault {
                addr,
                write,
                bytes: bytes as u8,
            }),
        }
    }

    fn load(&self, addr: u64, bytes: usize) -> MemResult<u128> {
        let range = self.get(addr, bytes, false)?;
        let ram = self.ram.borrow();
        let mut out = [0u8; 16];
        out[..bytes].copy_from_slice(&ram[range]);
        Ok(u128::from_le_bytes(out))
    }

    fn store(&mut self, addr: u64, bytes: usize, value: u128) -> MemResult<()> {
        let range = self.get(addr, bytes, true)?;
        self.ram.borrow_mut()[range].copy_from_slice(&value.to_le_bytes()[..bytes]);
        Ok(())
    }
}

impl Memory for FlatMemory {
    fn read_code32(&mut self, addr: u64) -> Option<u32> {
        self.load(addr, 4).ok().map(|v| v as u32)
    }

    fn read8(&mut self, addr: u64) -> MemResult<u8> {
        self.load(addr, 1).map(|v| v as u8)
    }
    fn read16(&mut self, addr: u64) -> MemResult<u16> {
        self.load(addr, 2).map(|v| v as u16)
    }
    fn read32(&mut self, addr: u64) -> MemResult<u32> {
        self.load(addr, 4).map(|v| v as u32)
    }
    fn read64(&mut self, addr: u64) -> MemResult<u64> {
        self.load(addr, 8).map(|v| v as u64)
    }
    fn read128(&mut self, addr: u64) -> MemResult<u128> {
        self.load(addr, 16)
    }

    fn write8(&mut self, addr: u64, value: u8) -> MemResult<()> {
        self.store(addr, 1, value as u128)
    }
    fn write16(&mut self, addr: u64, value: u16) -> MemResult<()> {
        self.store(addr, 2, value as u128)
    }
    fn write32(&mut self, addr: u64, value: u32) -> MemResult<()> {
        self.store(addr, 4, value as u128)
    }
    fn write64(&mut self, addr: u64, value: u64) -> MemResult<()> {
        self.store(addr, 8, value as u128)
    }
    fn write128(&mut self, addr: u64, value: u128) -> MemResult<()> {
        self.store(addr, 16, value)
    }
}

/// Records every delivered exception and supervisor call. Exceptions halt
/// the run unless a resume PC is configured.
pub struct RecordingSystem {
    pub log: Rc<RefCell<SystemLog>>,
    pub resume_at: Option<u64>,
}

#[derive(Default)]
pub struct SystemLog {
    pub exceptions: Vec<(u64, Exception)>,
    pub supervisor_calls: Vec<u32>,
    pub sysreg_writes: Vec<(u32, u64)>,
}

impl RecordingSystem {
    pub fn new() -> (RecordingSystem, Rc<RefCell<SystemLog>>) {
        let log = Rc::new(RefCell::new(SystemLog::default()));
        let sys = RecordingSystem {
            log: Rc::clone(&log),
            resume_at: None,
        };
        (sys, log)
    }
}

impl SystemHandler for RecordingSystem {
    fn exception_raised(&mut self, pc: u64, exception: Exception) -> ExceptionAction {
        self.log.borrow_mut().exceptions.push((pc, exception));
        match self.resume_at {
            Some(pc) => ExceptionAction::Resume { pc },
            None => ExceptionAction::Halt,
        }
    }

    fn call_supervisor(&mut self, swi: u32) {
        self.log.borrow_mut().supervisor_calls.push(swi);
    }

    fn system_register_read(&mut self, sysreg: u32) -> u64 {
        sysreg as u64
    }

    fn system_register_write(&mut self, sysreg: u32, value: u64) {
        self.log.borrow_mut().sysreg_writes.push((sysreg, value));
    }
}

/// Engine configuration over a fresh recording handler.
pub fn config_with(mem: FlatMemory) -> (EngineConfig, Rc<RefCell<SystemLog>>) {
    let (sys, log) = RecordingSystem::new();
    let config = EngineConfig::new(Box::new(mem), Box::new(sys), Box::new(HostFpOps));
    (config, log)
}
