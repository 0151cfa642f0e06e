//! Native code generation.
//!
//! Compiled blocks run under a small contract with the dispatcher: the run
//! thunk returns a packed exit word in RAX describing why control came
//! back. The dispatcher decodes it with [`ExitCode::decode`] and decides
//! whether to look up the next block, patch a link site, deliver an
//! exception or stop the run.

#[cfg(target_arch = "x86_64")]
pub mod x64;

/// Block exited through `ReturnToDispatch`; the next guest PC is already in
/// the context.
pub const EXIT_DISPATCH: u64 = 0;
/// Run budget exhausted at a block entry check; the context PC points at
/// the unexecuted block.
pub const EXIT_BUDGET: u64 = 1;
/// Exception terminator; bits 63..8 index the compile-time exception table.
pub const EXIT_EXCEPTION: u64 = 2;
/// Unlinked static edge taken; bits 15..8 hold the patch slot, bits 63..32
/// the exiting block id.
pub const EXIT_LINK: u64 = 3;
/// A memory helper recorded a fault; details in the runtime environment.
pub const EXIT_FAULT: u64 = 4;

/// Decoded form of the exit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Dispatch,
    Budget,
    Exception { index: usize },
    Link { block_id: u32, slot: u8 },
    Fault,
}

impl ExitCode {
    pub fn decode(word: u64) -> ExitCode {
        match word & 0xff {
            EXIT_DISPATCH => ExitCode::Dispatch,
            EXIT_BUDGET => ExitCode::Budget,
            EXIT_EXCEPTION => ExitCode::Exception {
                index: (word >> 8) as usize,
            },
            EXIT_LINK => ExitCode::Link {
                block_id: (word >> 32) as u32,
                slot: (word >> 8) as u8,
            },
            EXIT_FAULT => ExitCode::Fault,
            other => panic!("generated code returned unknown exit code {other:#x}"),
        }
    }
}

pub const fn exit_exception_word(index: usize) -> u64 {
    EXIT_EXCEPTION | (index as u64) << 8
}

pub const fn exit_link_word(block_id: u32, slot: u8) -> u64 {
    EXIT_LINK | (slot as u64) << 8 | (block_id as u64) << 32
}
