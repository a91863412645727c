// Behavioral coverage of the ARM and Thumb instruction families, driven
// through whole programs the same way the host would run them.

use emgba::fields::{Mode, CPSR_C, CPSR_FIQ_DISABLE, CPSR_Z, PC, SP};
use emgba::gba;
use emgba::{Emulator, Shared};

fn emulator_with_arm(words: &[u32]) -> Emulator {
    let mut emulator = Emulator::new(gba::agb(), Shared::default());
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes().to_vec()).collect();
    emulator.load_bios(&bytes);
    emulator
}

fn emulator_with_thumb(halfwords: &[u16]) -> Emulator {
    let mut emulator = Emulator::new(gba::agb(), Shared::default());
    let bytes: Vec<u8> = halfwords.iter().flat_map(|h| h.to_le_bytes().to_vec()).collect();
    emulator.load_bios(&bytes);
    emulator.cpu.cpsr |= emgba::fields::CPSR_THUMB_STATE;
    emulator
}

#[test]
fn arm_conditions_gate_execution() {
    // movs r0, #0 sets Z; moveq executes, movne falls through.
    let mut emulator = emulator_with_arm(&[0xe3b0_0000, 0x03a0_1001, 0x13a0_2001]);
    for _ in 0..3 {
        emulator.tick().unwrap();
    }
    assert_eq!(emulator.cpu.reg(1), 1);
    assert_eq!(emulator.cpu.reg(2), 0);
    // A failing condition still advances the PC.
    assert_eq!(emulator.cpu.regs[PC], 0x0c);
}

#[test]
fn arm_shifted_register_operands() {
    let mut emulator = emulator_with_arm(&[
        0xe3a0_2003, // mov r2, #3
        0xe1a0_5082, // mov r5, r2, lsl #1
        0xe1a0_50a2, // mov r5, r2, lsr #1
        0xe1a0_50c2, // mov r5, r2, asr #1
        0xe1a0_50e2, // mov r5, r2, ror #1
        0xe350_0000, // cmp r0, #0 (sets carry)
        0xe1a0_6062, // mov r6, r2, rrx
    ]);
    emulator.tick().unwrap();
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(5), 6);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(5), 1);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(5), 1);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(5), 0x8000_0001);
    emulator.tick().unwrap();
    assert_ne!(emulator.cpu.cpsr & CPSR_C, 0);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(6), 0x8000_0001);
}

#[test]
fn arm_carry_chains_through_adc_and_sbc() {
    let mut emulator = emulator_with_arm(&[
        0xe3a0_0005, // mov r0, #5
        0xe350_0000, // cmp r0, #0 (carry set, no borrow)
        0xe2c0_1001, // sbc r1, r0, #1
        0xe2a1_1001, // adc r1, r1, #1
    ]);
    for _ in 0..4 {
        emulator.tick().unwrap();
    }
    assert_eq!(emulator.cpu.reg(1), 6);
}

#[test]
fn arm_mrs_reads_the_cpsr() {
    let mut emulator = emulator_with_arm(&[0xe10f_0000]);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(0), Mode::System as u32 | CPSR_FIQ_DISABLE);
}

#[test]
fn arm_msr_switches_the_mode_and_the_bank() {
    // msr cpsr_c, #0x12 drops to IRQ mode; SP follows the bank.
    let mut emulator = emulator_with_arm(&[0xe321_f012]);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.mode(), Mode::Irq);
    assert_eq!(emulator.cpu.reg(SP), 0x0300_7fa0);
}

#[test]
fn arm_halfword_and_signed_transfers() {
    let mut emulator = emulator_with_arm(&[
        0xe1c0_10b0, // strh r1, [r0]
        0xe1d0_20f0, // ldrsh r2, [r0]
        0xe1d0_30d0, // ldrsb r3, [r0]
    ]);
    emulator.cpu.set_reg(0, 0x0200_0000);
    emulator.cpu.set_reg(1, 0x8001);
    for _ in 0..3 {
        emulator.tick().unwrap();
    }
    assert_eq!(
        emulator.cpu.bus.borrow_mut().read_half(0x0200_0000).unwrap(),
        0x8001
    );
    assert_eq!(emulator.cpu.reg(2), 0xffff_8001);
    assert_eq!(emulator.cpu.reg(3), 0x01);
}

#[test]
fn arm_single_data_swap() {
    let mut emulator = emulator_with_arm(&[0xe103_1092]);
    emulator.cpu.set_reg(3, 0x0200_0010);
    emulator.cpu.set_reg(2, 0x5566_7788);
    emulator.cpu.bus.borrow_mut().write_word(0x0200_0010, 0x1122_3344).unwrap();
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(1), 0x1122_3344);
    assert_eq!(
        emulator.cpu.bus.borrow_mut().read_word(0x0200_0010).unwrap(),
        0x5566_7788
    );
}

#[test]
fn arm_post_indexed_load_writes_back() {
    let mut emulator = emulator_with_arm(&[0xe491_2004]);
    emulator.cpu.set_reg(1, 0x0200_0020);
    emulator.cpu.bus.borrow_mut().write_word(0x0200_0020, 0xabcd_1234).unwrap();
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(2), 0xabcd_1234);
    assert_eq!(emulator.cpu.reg(1), 0x0200_0024);
}

#[test]
fn arm_long_multiplies() {
    let mut emulator = emulator_with_arm(&[0xe082_1493]);
    emulator.cpu.set_reg(3, 0xffff_ffff);
    emulator.cpu.set_reg(4, 2);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(1), 0xffff_fffe);
    assert_eq!(emulator.cpu.reg(2), 1);

    // smull treats the same operands as -1 * 2.
    let mut emulator = emulator_with_arm(&[0xe0c2_1493]);
    emulator.cpu.set_reg(3, 0xffff_ffff);
    emulator.cpu.set_reg(4, 2);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(1), 0xffff_fffe);
    assert_eq!(emulator.cpu.reg(2), 0xffff_ffff);
}

#[test]
fn arm_branch_exchange_enters_thumb() {
    let mut words = vec![
        0xe3a0_0009, // mov r0, #9
        0xe12f_ff10, // bx r0
    ];
    // Thumb instruction at byte 8: mov r0, #7.
    words.push(0x0000_2007);
    let mut emulator = emulator_with_arm(&words);
    emulator.tick().unwrap();
    emulator.tick().unwrap();
    assert!(emulator.cpu.thumb_state());
    assert_eq!(emulator.cpu.regs[PC], 0x8);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(0), 7);
    assert_eq!(emulator.cpu.regs[PC], 0xa);
}

#[test]
fn thumb_alu_operations() {
    // and r0, r1 after mov r0, #5; mov r1, #3
    let mut emulator = emulator_with_thumb(&[0x2005, 0x2103, 0x4008]);
    for _ in 0..3 {
        emulator.tick().unwrap();
    }
    assert_eq!(emulator.cpu.reg(0), 1);

    // neg r0, r1
    let mut emulator = emulator_with_thumb(&[0x2103, 0x4248]);
    emulator.tick().unwrap();
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(0), 0xffff_fffd);

    // lsl r0, r1 (shift amount from a register)
    let mut emulator = emulator_with_thumb(&[0x2001, 0x2104, 0x4088]);
    for _ in 0..3 {
        emulator.tick().unwrap();
    }
    assert_eq!(emulator.cpu.reg(0), 16);
}

#[test]
fn thumb_add_subtract_three_operand() {
    // mov r0, #7; mov r1, #2; sub r4, r0, r1; add r2, r0, #1
    let mut emulator = emulator_with_thumb(&[0x2007, 0x2102, 0x1a44, 0x1c42]);
    for _ in 0..4 {
        emulator.tick().unwrap();
    }
    assert_eq!(emulator.cpu.reg(4), 5);
    assert_eq!(emulator.cpu.reg(2), 8);
}

#[test]
fn thumb_high_register_move() {
    let mut emulator = emulator_with_thumb(&[0x2005, 0x4680]);
    emulator.tick().unwrap();
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(8), 5);
}

#[test]
fn thumb_halfword_load_store() {
    let mut emulator = emulator_with_thumb(&[0x2042, 0x8008, 0x880a]);
    emulator.cpu.set_reg(1, 0x0200_0000);
    for _ in 0..3 {
        emulator.tick().unwrap();
    }
    assert_eq!(emulator.cpu.reg(2), 0x42);
}

#[test]
fn thumb_sp_relative_load_store() {
    let mut emulator = emulator_with_thumb(&[0x2077, 0x9001, 0x9901]);
    for _ in 0..3 {
        emulator.tick().unwrap();
    }
    assert_eq!(emulator.cpu.reg(1), 0x77);
}

#[test]
fn thumb_load_address_is_word_aligned() {
    let mut emulator = emulator_with_thumb(&[0xa202]);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(2), 12);
}

#[test]
fn thumb_pc_relative_load_reads_the_literal_pool() {
    let mut emulator =
        emulator_with_thumb(&[0x4801, 0x46c0, 0x46c0, 0x46c0, 0x5678, 0x1234]);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.reg(0), 0x1234_5678);
}

#[test]
fn thumb_conditional_branch_variants() {
    // cmp r0, #0 sets Z and C; bne falls through, bcs takes.
    let mut emulator = emulator_with_thumb(&[0x2800, 0xd1ff, 0xd201]);
    emulator.tick().unwrap();
    assert_ne!(emulator.cpu.cpsr & CPSR_Z, 0);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.regs[PC], 0x4);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.regs[PC], 0xa);
}

#[test]
fn thumb_multiple_store_with_writeback() {
    let mut emulator = emulator_with_thumb(&[0x2011, 0x2122, 0xc403]);
    emulator.cpu.set_reg(4, 0x0200_0000);
    for _ in 0..3 {
        emulator.tick().unwrap();
    }
    assert_eq!(emulator.cpu.reg(4), 0x0200_0008);
    let mut bus = emulator.cpu.bus.borrow_mut();
    assert_eq!(bus.read_word(0x0200_0000).unwrap(), 0x11);
    assert_eq!(bus.read_word(0x0200_0004).unwrap(), 0x22);
}

#[test]
fn thumb_software_interrupt_returns_to_arm_vector() {
    let mut emulator = emulator_with_thumb(&[0xdf05]);
    emulator.tick().unwrap();
    assert_eq!(emulator.cpu.mode(), Mode::Supervisor);
    assert!(!emulator.cpu.thumb_state());
    assert_eq!(emulator.cpu.regs[PC], 0x08);
    assert_eq!(emulator.cpu.reg(14), 0x2);
}
