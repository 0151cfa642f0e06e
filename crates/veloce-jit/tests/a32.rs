//! End-to-end A32 execution: ARM condition grouping, Thumb, IT blocks and
//! interworking.

mod common;

use common::{config_with, FlatMemory};
use veloce_jit::{A32Engine, RunExit};

fn engine_with(mem: FlatMemory) -> A32Engine {
    let (config, _log) = config_with(mem);
    A32Engine::new(config).expect("engine construction")
}

#[test]
fn arm_conditional_instructions_follow_the_flags() {
    let mem = FlatMemory::new(0x10000);
    mem.write_word(0x1000, 0xe300_0005); // movw r0, #5
    mem.write_word(0x1004, 0xe300_1003); // movw r1, #3
    mem.write_word(0x1008, 0xe090_2001); // adds r2, r0, r1
    mem.write_word(0x100c, 0x13a0_3001); // movne r3, #1
    mem.write_word(0x1010, 0x03a0_4001); // moveq r4, #1
    mem.write_word(0x1014, 0xeaff_fffe); // b .

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);

    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert_eq!(cpu.r(2), 8);
    assert_eq!(cpu.r(3), 1, "NE guard should pass");
    assert_eq!(cpu.r(4), 0, "EQ guard should fail");
    assert_eq!(cpu.pc(), 0x1014);
}

#[test]
fn bx_switches_to_thumb() {
    let mem = FlatMemory::new(0x10000);
    // ARM at 0x1000: load 0x2001 and interwork to it.
    mem.write_word(0x1000, 0xe302_0001); // movw r0, #0x2001
    mem.write_word(0x1004, 0xe12f_ff10); // bx r0
    // Thumb at 0x2000.
    mem.write_half(0x2000, 0x3101); // adds r1, #1
    mem.write_half(0x2002, 0xe7fd); // b 0x2000

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);

    assert_eq!(cpu.run(8), RunExit::BudgetExhausted);
    assert!(cpu.thumb());
    assert_eq!(cpu.pc(), 0x2000);
    // 2 ARM instructions, then 3 passes of the 2-instruction Thumb loop.
    assert_eq!(cpu.r(1), 3);
}

#[test]
fn thumb_it_block_executes_when_the_condition_holds() {
    let mem = FlatMemory::new(0x10000);
    mem.write_half(0x100, 0x2000); // movs r0, #0
    mem.write_half(0x102, 0xbf08); // it eq
    mem.write_half(0x104, 0x3101); // addeq r1, #1
    mem.write_half(0x106, 0x3201); // adds r2, #1
    mem.write_half(0x108, 0xe7fe); // b .

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x100);
    cpu.set_thumb(true);

    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert_eq!(cpu.r(1), 1, "IT body should run when Z is set");
    assert_eq!(cpu.r(2), 1);
    assert_eq!(cpu.it_state(), 0, "ITSTATE should be exhausted");
}

#[test]
fn thumb_it_block_skips_when_the_condition_fails() {
    let mem = FlatMemory::new(0x10000);
    mem.write_half(0x100, 0x2001); // movs r0, #1
    mem.write_half(0x102, 0xbf08); // it eq
    mem.write_half(0x104, 0x3101); // addeq r1, #1
    mem.write_half(0x106, 0x3201); // adds r2, #1
    mem.write_half(0x108, 0xe7fe); // b .

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x100);
    cpu.set_thumb(true);

    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert_eq!(cpu.r(1), 0, "IT body must be skipped when Z is clear");
    assert_eq!(cpu.r(2), 1, "execution resumes after the IT run");
    assert_eq!(cpu.it_state(), 0);
}

#[test]
fn thumb_itte_takes_both_legs() {
    let mem = FlatMemory::new(0x10000);
    mem.write_half(0x100, 0x2000); // movs r0, #0
    mem.write_half(0x102, 0xbf06); // itte eq
    mem.write_half(0x104, 0x3101); // addeq r1, #1
    mem.write_half(0x106, 0x3201); // addeq r2, #1
    mem.write_half(0x108, 0x3301); // addne r3, #1
    mem.write_half(0x10a, 0xe7fe); // b .

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x100);
    cpu.set_thumb(true);

    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert_eq!(cpu.r(1), 1);
    assert_eq!(cpu.r(2), 1);
    assert_eq!(cpu.r(3), 0, "the else leg must not run when Z is set");
}

#[test]
fn ldrex_strex_round_trip() {
    let mem = FlatMemory::new(0x10000);
    mem.write_word(0x1000, 0xe191_2f9f); // ldrex r2, [r1]
    mem.write_word(0x1004, 0xe282_2001); // add r2, r2, #1
    mem.write_word(0x1008, 0xe181_3f92); // strex r3, r2, [r1]
    mem.write_word(0x100c, 0xeaff_fffe); // b .
    mem.write_word(0x8000, 41);
    let data = mem.share();

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    cpu.set_r(1, 0x8000);

    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert_eq!(cpu.r(3), 0, "store-exclusive status should be success");
    assert_eq!(cpu.r(2), 42);
    assert_eq!(data.read_u64(0x8000) as u32, 42);
}

#[test]
fn clrex_fails_the_following_strex() {
    let mem = FlatMemory::new(0x10000);
    mem.write_word(0x1000, 0xe191_2f9f); // ldrex r2, [r1]
    mem.write_word(0x1004, 0xf57f_f01f); // clrex
    mem.write_word(0x1008, 0xe181_3f92); // strex r3, r2, [r1]
    mem.write_word(0x100c, 0xeaff_fffe); // b .
    mem.write_word(0x8000, 41);
    let data = mem.share();

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    cpu.set_r(1, 0x8000);

    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert_eq!(cpu.r(3), 1);
    assert_eq!(data.read_u64(0x8000) as u32, 41);
}

#[test]
fn arm_shifter_carry_feeds_the_flags() {
    let mem = FlatMemory::new(0x10000);
    mem.write_word(0x1000, 0xe1b0_0081); // movs r0, r1, lsl #1
    mem.write_word(0x1004, 0xeaff_fffe); // b .

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    cpu.set_r(1, 0x8000_0001);

    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert_eq!(cpu.r(0), 2);
    // Bit 31 shifted out into C; result is positive and nonzero.
    assert_eq!(cpu.nzcv(), 0x2000_0000);
}

#[test]
fn thumb_push_pop_round_trip() {
    let mem = FlatMemory::new(0x10000);
    mem.write_half(0x100, 0xb407); // push {r0, r1, r2}
    mem.write_half(0x102, 0x2000); // movs r0, #0
    mem.write_half(0x104, 0x2100); // movs r1, #0
    mem.write_half(0x106, 0xbc06); // pop {r1, r2}
    mem.write_half(0x108, 0xe7fe); // b .

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x100);
    cpu.set_thumb(true);
    cpu.set_r(13, 0x8000);
    cpu.set_r(0, 11);
    cpu.set_r(1, 22);
    cpu.set_r(2, 33);

    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    // pop {r1, r2} reads the two lowest slots: the pushed r0 and r1.
    assert_eq!(cpu.r(1), 11);
    assert_eq!(cpu.r(2), 22);
    assert_eq!(cpu.r(13), 0x8000 - 12 + 8);
}

#[test]
fn thumb_bl_style_interworking_back_to_arm() {
    let mem = FlatMemory::new(0x10000);
    // Thumb at 0x100: blx r0 with r0 = 0x1000 (bit 0 clear: ARM).
    mem.write_half(0x100, 0x4780); // blx r0
    // ARM at 0x1000.
    mem.write_word(0x1000, 0xe2811001); // add r1, r1, #1
    mem.write_word(0x1004, 0xeaff_fffe); // b .

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x100);
    cpu.set_thumb(true);
    cpu.set_r(0, 0x1000);

    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert!(!cpu.thumb());
    assert_eq!(cpu.r(1), 1);
    // LR holds the Thumb return address with bit 0 set.
    assert_eq!(cpu.r(14), 0x103);
}

#[test]
fn thumb_cbz_and_cbnz_steer_on_the_register() {
    let program = |mem: &FlatMemory| {
        mem.write_half(0x1000, 0xb110); // cbz r0, 0x1008
        mem.write_half(0x1002, 0xe7fe); // b . (nonzero path)
        mem.write_half(0x1008, 0xe7fe); // b . (zero path)
    };

    let mem = FlatMemory::new(0x10000);
    program(&mem);
    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    cpu.set_thumb(true);
    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert_eq!(cpu.pc(), 0x1008);

    let mem = FlatMemory::new(0x10000);
    program(&mem);
    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    cpu.set_thumb(true);
    cpu.set_r(0, 1);
    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert_eq!(cpu.pc(), 0x1002);

    let mem = FlatMemory::new(0x10000);
    mem.write_half(0x1000, 0xb910); // cbnz r0, 0x1008
    mem.write_half(0x1002, 0xe7fe); // b .
    mem.write_half(0x1008, 0xe7fe); // b .
    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    cpu.set_thumb(true);
    cpu.set_r(0, 1);
    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert_eq!(cpu.pc(), 0x1008);
}

#[test]
fn thumb_register_shifts_compute_the_carry() {
    let mem = FlatMemory::new(0x10000);
    mem.write_half(0x1000, 0x409a); // lsls r2, r3
    mem.write_half(0x1002, 0x40c8); // lsrs r0, r1
    mem.write_half(0x1004, 0x4135); // asrs r5, r6
    mem.write_half(0x1006, 0xe7fe); // b .

    let mut cpu = engine_with(mem);
    cpu.set_pc(0x1000);
    cpu.set_thumb(true);
    // Shift amount past the register width: everything falls out.
    cpu.set_r(2, 1);
    cpu.set_r(3, 33);
    // One-bit right shift dropping a set bit into the carry.
    cpu.set_r(0, 3);
    cpu.set_r(1, 1);
    // Zero amount: value and carry both survive.
    cpu.set_r(5, 0x8000_0000);
    cpu.set_r(6, 0);

    assert_eq!(cpu.run(100), RunExit::IdleLoop);
    assert_eq!(cpu.r(2), 0);
    assert_eq!(cpu.r(0), 1);
    assert_eq!(cpu.r(5), 0x8000_0000);
    // N from the untouched r5, C preserved from the lsrs.
    assert_eq!(cpu.nzcv(), 0xa000_0000);
}
