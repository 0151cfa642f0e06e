//! Block cache behavior: reuse, range invalidation of self-modifying code,
//! link severing and full flushes.

mod common;

use common::{config_with, FlatMemory};
use veloce_jit::{A64Engine, RunExit};

fn engine_with(mem: FlatMemory) -> A64Engine {
    let (config, _log) = config_with(mem);
    A64Engine::new(config).expect("engine construction")
}

#[test]
fn cached_blocks_are_not_retranslated() {
    let mem = FlatMemory::new(0x10000);
    mem.write_word(0x1000, 0x9100_0400); // add x0, x0, #1
    mem.write_word(0x1004, 0x17ff_ffff); // b 0x1000

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);

    assert_eq!(cpu.run(10), RunExit::BudgetExhausted);
    assert_eq!(cpu.compile_count(), 1);
    assert_eq!(cpu.run(10), RunExit::BudgetExhausted);
    assert_eq!(cpu.compile_count(), 1);
    assert_eq!(cpu.x(0), 10);
}

#[test]
fn range_invalidation_picks_up_modified_code() {
    let mem = FlatMemory::new(0x10000);
    mem.write_word(0x1000, 0x9100_0400); // add x0, x0, #1
    mem.write_word(0x1004, 0x17ff_ffff); // b 0x1000
    let code = mem.share();

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    assert_eq!(cpu.run(2), RunExit::BudgetExhausted);
    assert_eq!(cpu.x(0), 1);

    // Self-modifying write: bump the immediate to #2, then invalidate.
    code.write_word(0x1000, 0x9100_0800);
    cpu.invalidate_range(0x1000, 0x1004);

    assert_eq!(cpu.run(2), RunExit::BudgetExhausted);
    assert_eq!(cpu.x(0), 3);
    assert_eq!(cpu.compile_count(), 2);
}

#[test]
fn invalidating_a_link_target_severs_the_edge() {
    let mem = FlatMemory::new(0x10000);
    // Two blocks chained in a loop: A at 0x1000, B at 0x1008.
    mem.write_word(0x1000, 0x9100_0400); // add x0, x0, #1
    mem.write_word(0x1004, 0x1400_0001); // b 0x1008
    mem.write_word(0x1008, 0x9100_0800); // add x0, x0, #2
    mem.write_word(0x100c, 0x17ff_fffd); // b 0x1000
    let code = mem.share();

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    assert_eq!(cpu.run(8), RunExit::BudgetExhausted);
    assert_eq!(cpu.x(0), 6);
    assert_eq!(cpu.compile_count(), 2);

    // Replace B's increment, drop only B from the cache. A survives but
    // its direct jump into the stale B must be unlinked.
    code.write_word(0x1008, 0x9100_1400); // add x0, x0, #5
    cpu.invalidate_range(0x1008, 0x1010);

    assert_eq!(cpu.run(8), RunExit::BudgetExhausted);
    assert_eq!(cpu.x(0), 6 + 12);
    assert_eq!(cpu.compile_count(), 3);
}

#[test]
fn invalidate_all_flushes_every_block() {
    let mem = FlatMemory::new(0x10000);
    mem.write_word(0x1000, 0x9100_0400); // add x0, x0, #1
    mem.write_word(0x1004, 0x1400_0002); // b 0x100c
    mem.write_word(0x100c, 0x9100_0400); // add x0, x0, #1
    mem.write_word(0x1010, 0x17ff_fffc); // b 0x1000

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    assert_eq!(cpu.run(8), RunExit::BudgetExhausted);
    assert_eq!(cpu.compile_count(), 2);

    cpu.invalidate_all();
    assert_eq!(cpu.run(8), RunExit::BudgetExhausted);
    assert_eq!(cpu.compile_count(), 4, "both blocks retranslate after a flush");
    assert_eq!(cpu.x(0), 8);
}

#[test]
fn invalidation_handle_applies_at_the_next_dispatch() {
    let mem = FlatMemory::new(0x10000);
    mem.write_word(0x1000, 0x9100_0400); // add x0, x0, #1
    mem.write_word(0x1004, 0x17ff_ffff); // b 0x1000
    let code = mem.share();

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    assert_eq!(cpu.run(2), RunExit::BudgetExhausted);

    // Queue through the cloneable handle, as a device emulation thread
    // would, then patch the code.
    let handle = cpu.invalidation_handle();
    code.write_word(0x1000, 0x9100_0c00); // add x0, x0, #3
    handle.invalidate_range(0x1000, 0x1004);

    assert_eq!(cpu.run(2), RunExit::BudgetExhausted);
    assert_eq!(cpu.x(0), 1 + 3);
    assert_eq!(cpu.compile_count(), 2);
}

#[test]
fn invalidation_misses_leave_the_cache_alone() {
    let mem = FlatMemory::new(0x10000);
    mem.write_word(0x1000, 0x9100_0400); // add x0, x0, #1
    mem.write_word(0x1004, 0x17ff_ffff); // b 0x1000

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    assert_eq!(cpu.run(2), RunExit::BudgetExhausted);

    // Adjacent but non-overlapping ranges.
    cpu.invalidate_range(0x0, 0x1000);
    cpu.invalidate_range(0x1008, 0x2000);

    assert_eq!(cpu.run(2), RunExit::BudgetExhausted);
    assert_eq!(cpu.compile_count(), 1);
}
