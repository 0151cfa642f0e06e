//! Exclusive monitor semantics across engines sharing one global monitor.

mod common;

use std::sync::Arc;

use common::{config_with, FlatMemory};
use veloce_jit::{A64Engine, EngineError, ExclusiveMonitor, RunExit};

fn shared_engine(monitor: &Arc<ExclusiveMonitor>, processor_id: usize) -> A64Engine {
    let mem = FlatMemory::new(0x10000);
    // 0x1000: ldxr x0, [x1]; b .
    mem.write_word(0x1000, 0xc85f_7c20);
    mem.write_word(0x1004, 0x1400_0000);
    // 0x2000: stxr w2, x0, [x1]; b .
    mem.write_word(0x2000, 0xc802_7c20);
    mem.write_word(0x2004, 0x1400_0000);
    // 0x3000: str x0, [x1]; b .
    mem.write_word(0x3000, 0xf900_0020);
    mem.write_word(0x3004, 0x1400_0000);

    let (mut config, _log) = config_with(mem);
    config.monitor = Some(Arc::clone(monitor));
    config.processor_id = processor_id;
    let mut cpu = A64Engine::new(config).expect("engine construction");
    cpu.set_x(1, 0x8000);
    cpu
}

fn run_ldxr(cpu: &mut A64Engine) {
    cpu.set_pc(0x1000);
    assert_eq!(cpu.run(100), RunExit::IdleLoop);
}

fn run_stxr(cpu: &mut A64Engine) -> u64 {
    cpu.set_pc(0x2000);
    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    cpu.x(2)
}

#[test]
fn peer_store_exclusive_steals_the_reservation() {
    let monitor = Arc::new(ExclusiveMonitor::new(2));
    let mut cpu0 = shared_engine(&monitor, 0);
    let mut cpu1 = shared_engine(&monitor, 1);

    run_ldxr(&mut cpu0);
    run_ldxr(&mut cpu1);

    // First store wins and clears every overlapping reservation.
    assert_eq!(run_stxr(&mut cpu1), 0);
    assert_eq!(run_stxr(&mut cpu0), 1, "reservation was taken by the peer");
}

#[test]
fn peer_plain_store_clears_the_reservation() {
    let monitor = Arc::new(ExclusiveMonitor::new(2));
    let mut cpu0 = shared_engine(&monitor, 0);
    let mut cpu1 = shared_engine(&monitor, 1);

    run_ldxr(&mut cpu0);

    // An ordinary store by the peer to the reserved granule.
    cpu1.set_pc(0x3000);
    assert_eq!(cpu1.run(100), RunExit::IdleLoop);

    assert_eq!(run_stxr(&mut cpu0), 1, "plain peer write must clear it");
}

#[test]
fn reservations_at_distinct_granules_do_not_interfere() {
    let monitor = Arc::new(ExclusiveMonitor::new(2));
    let mut cpu0 = shared_engine(&monitor, 0);
    let mut cpu1 = shared_engine(&monitor, 1);
    // Put the second processor's reservation one granule away.
    cpu1.set_x(1, 0x8010);

    run_ldxr(&mut cpu0);
    run_ldxr(&mut cpu1);

    assert_eq!(run_stxr(&mut cpu1), 0);
    assert_eq!(run_stxr(&mut cpu0), 0, "disjoint granule must survive");
}

#[test]
fn clear_exclusive_state_drops_the_reservation() {
    let monitor = Arc::new(ExclusiveMonitor::new(1));
    let mut cpu = shared_engine(&monitor, 0);

    run_ldxr(&mut cpu);
    cpu.clear_exclusive_state();
    assert_eq!(run_stxr(&mut cpu), 1);
}

#[test]
fn store_exclusive_without_a_reservation_fails() {
    let monitor = Arc::new(ExclusiveMonitor::new(1));
    let mut cpu = shared_engine(&monitor, 0);
    assert_eq!(run_stxr(&mut cpu), 1);
}

#[test]
fn processor_id_must_fit_the_monitor() {
    let monitor = Arc::new(ExclusiveMonitor::new(2));
    let (mut config, _log) = config_with(FlatMemory::new(0x1000));
    config.monitor = Some(monitor);
    config.processor_id = 2;
    match A64Engine::new(config) {
        Err(EngineError::ProcessorIdOutOfRange { id: 2, count: 2 }) => {}
        other => panic!(
            "expected an out-of-range error, got {:?}",
            other.err().map(|e| e.to_string())
        ),
    }
}
