use crate::fields::{
    add_with_flags, reg_name, sub_with_flags, Condition, Mode, Operand, CPSR_C, CPSR_N,
    CPSR_THUMB_STATE, CPSR_V, CPSR_Z, LR, PC,
};
use crate::processor::{Cpu, VECTOR_SOFTWARE_INTERRUPT, VECTOR_UNDEFINED};
use crate::Fault;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum AluOp {
    And = 0b0000,
    Eor = 0b0001,
    Sub = 0b0010,
    Rsb = 0b0011,
    Add = 0b0100,
    Adc = 0b0101,
    Sbc = 0b0110,
    Rsc = 0b0111,
    Tst = 0b1000,
    Teq = 0b1001,
    Cmp = 0b1010,
    Cmn = 0b1011,
    Orr = 0b1100,
    Mov = 0b1101,
    Bic = 0b1110,
    Mvn = 0b1111,
}

impl AluOp {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0xf {
            0b0000 => Self::And,
            0b0001 => Self::Eor,
            0b0010 => Self::Sub,
            0b0011 => Self::Rsb,
            0b0100 => Self::Add,
            0b0101 => Self::Adc,
            0b0110 => Self::Sbc,
            0b0111 => Self::Rsc,
            0b1000 => Self::Tst,
            0b1001 => Self::Teq,
            0b1010 => Self::Cmp,
            0b1011 => Self::Cmn,
            0b1100 => Self::Orr,
            0b1101 => Self::Mov,
            0b1110 => Self::Bic,
            _ => Self::Mvn,
        }
    }
    fn is_test(self) -> bool {
        matches!(self, Self::Tst | Self::Teq | Self::Cmp | Self::Cmn)
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum HalfwordKind {
    Half,
    SignedByte,
    SignedHalf,
}

impl HalfwordKind {
    pub fn from_bits(sh: u32) -> Self {
        match sh & 0x3 {
            0b10 => Self::SignedByte,
            0b11 => Self::SignedHalf,
            _ => Self::Half,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum HalfwordOffset {
    Immediate(u32),
    Register(usize),
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Instruction {
    DataProcessing { op: AluOp, s: bool, rn: usize, rd: usize, op2: Operand },
    Mrs { spsr: bool, rd: usize },
    Msr { spsr: bool, fields: u32, op2: Operand },
    Multiply { accumulate: bool, s: bool, rd: usize, rn: usize, rs: usize, rm: usize },
    MultiplyLong { signed: bool, accumulate: bool, s: bool, rd_hi: usize, rd_lo: usize, rs: usize, rm: usize },
    Swap { byte: bool, rn: usize, rd: usize, rm: usize },
    Branch { link: bool, offset: i32 },
    BranchExchange { rn: usize },
    SingleTransfer { load: bool, pre: bool, up: bool, byte: bool, writeback: bool, rn: usize, rd: usize, offset: Operand },
    HalfwordTransfer { load: bool, pre: bool, up: bool, writeback: bool, kind: HalfwordKind, rn: usize, rd: usize, offset: HalfwordOffset },
    BlockTransfer { load: bool, pre: bool, up: bool, user_bank: bool, writeback: bool, rn: usize, list: u16 },
    SoftwareInterrupt { comment: u32 },
    Undefined { opcode: u32 },
    // The two halves of the Thumb long branch with link.
    LongBranchHigh { offset: i32 },
    LongBranchLow { offset: u32 },
}

fn apply_offset(base: u32, offset: u32, up: bool) -> u32 {
    if up {
        base.wrapping_add(offset)
    } else {
        base.wrapping_sub(offset)
    }
}

impl Instruction {
    pub fn execute(&self, cpu: &mut Cpu) -> Result<(), Fault> {
        match *self {
            Self::DataProcessing { op, s, rn, rd, op2 } => {
                execute_data_processing(cpu, op, s, rn, rd, op2);
                Ok(())
            }
            Self::Mrs { spsr, rd } => {
                let value = if spsr { cpu.spsr_value() } else { cpu.cpsr };
                cpu.set_reg(rd, value);
                Ok(())
            }
            Self::Msr { spsr, fields, op2 } => {
                let (value, _) = op2.value(cpu);
                let mut mask = 0u32;
                for field in 0..4 {
                    if fields & (1 << field) != 0 {
                        mask |= 0xff << (field * 8);
                    }
                }
                if spsr {
                    cpu.set_spsr((cpu.spsr_value() & !mask) | (value & mask));
                } else {
                    // The control field is protected in user mode.
                    if cpu.mode() == Mode::User {
                        mask &= 0xf000_0000;
                    }
                    cpu.cpsr = (cpu.cpsr & !mask) | (value & mask);
                }
                Ok(())
            }
            Self::Multiply { accumulate, s, rd, rn, rs, rm } => {
                let mut result = cpu.reg(rm).wrapping_mul(cpu.reg(rs));
                if accumulate {
                    result = result.wrapping_add(cpu.reg(rn));
                }
                cpu.set_reg(rd, result);
                if s {
                    cpu.set_flag(CPSR_N, result & 0x8000_0000 != 0);
                    cpu.set_flag(CPSR_Z, result == 0);
                }
                Ok(())
            }
            Self::MultiplyLong { signed, accumulate, s, rd_hi, rd_lo, rs, rm } => {
                let product = if signed {
                    (cpu.reg(rm) as i32 as i64).wrapping_mul(cpu.reg(rs) as i32 as i64) as u64
                } else {
                    (cpu.reg(rm) as u64).wrapping_mul(cpu.reg(rs) as u64)
                };
                let accumulator = if accumulate {
                    ((cpu.reg(rd_hi) as u64) << 32) | cpu.reg(rd_lo) as u64
                } else {
                    0
                };
                let result = product.wrapping_add(accumulator);
                cpu.set_reg(rd_lo, result as u32);
                cpu.set_reg(rd_hi, (result >> 32) as u32);
                if s {
                    cpu.set_flag(CPSR_N, result & 0x8000_0000_0000_0000 != 0);
                    cpu.set_flag(CPSR_Z, result == 0);
                }
                Ok(())
            }
            Self::Swap { byte, rn, rd, rm } => {
                let address = cpu.reg(rn);
                let source = cpu.reg(rm);
                if byte {
                    let loaded = cpu.read_byte(address)? as u32;
                    cpu.write_byte(address, source as u8)?;
                    cpu.set_reg(rd, loaded);
                } else {
                    let loaded = cpu.read_word(address)?;
                    cpu.write_word(address, source)?;
                    cpu.set_reg(rd, loaded);
                }
                Ok(())
            }
            Self::Branch { link, offset } => {
                let pc = cpu.reg(PC);
                let prefetch = cpu.instruction_size() * 2;
                if link {
                    cpu.set_reg(LR, pc.wrapping_add(cpu.instruction_size()));
                }
                cpu.set_reg(PC, pc.wrapping_add(prefetch).wrapping_add(offset as u32));
                Ok(())
            }
            Self::BranchExchange { rn } => {
                let target = cpu.reg(rn);
                cpu.set_flag_raw(CPSR_THUMB_STATE, target & 1 != 0);
                cpu.set_reg(PC, target);
                Ok(())
            }
            Self::SingleTransfer { load, pre, up, byte, writeback, rn, rd, offset } => {
                let (offset, _) = offset.value(cpu);
                let mut base = cpu.reg_operand(rn);
                if rn == PC {
                    // Literal pools address from a word-aligned PC.
                    base &= !2;
                }
                let address = if pre { apply_offset(base, offset, up) } else { base };
                if load {
                    let value = if byte {
                        cpu.read_byte(address)? as u32
                    } else {
                        cpu.read_word(address)?
                    };
                    if !pre {
                        cpu.set_reg(rn, apply_offset(base, offset, up));
                    } else if writeback {
                        cpu.set_reg(rn, address);
                    }
                    // A load into the base register wins over the writeback.
                    cpu.set_reg(rd, value);
                } else {
                    let value = cpu.reg_operand(rd);
                    if byte {
                        cpu.write_byte(address, value as u8)?;
                    } else {
                        cpu.write_word(address, value)?;
                    }
                    if !pre {
                        cpu.set_reg(rn, apply_offset(base, offset, up));
                    } else if writeback {
                        cpu.set_reg(rn, address);
                    }
                }
                Ok(())
            }
            Self::HalfwordTransfer { load, pre, up, writeback, kind, rn, rd, offset } => {
                let offset = match offset {
                    HalfwordOffset::Immediate(value) => value,
                    HalfwordOffset::Register(rm) => cpu.reg(rm),
                };
                let base = cpu.reg_operand(rn);
                let address = if pre { apply_offset(base, offset, up) } else { base };
                if load {
                    let value = match kind {
                        HalfwordKind::Half => cpu.read_half(address)? as u32,
                        HalfwordKind::SignedByte => cpu.read_byte_signed(address)? as u32,
                        HalfwordKind::SignedHalf => cpu.read_half_signed(address)? as u32,
                    };
                    if !pre {
                        cpu.set_reg(rn, apply_offset(base, offset, up));
                    } else if writeback {
                        cpu.set_reg(rn, address);
                    }
                    cpu.set_reg(rd, value);
                } else {
                    cpu.write_half(address, cpu.reg_operand(rd) as u16)?;
                    if !pre {
                        cpu.set_reg(rn, apply_offset(base, offset, up));
                    } else if writeback {
                        cpu.set_reg(rn, address);
                    }
                }
                Ok(())
            }
            Self::BlockTransfer { load, pre, up, user_bank, writeback, rn, list } => {
                execute_block_transfer(cpu, load, pre, up, user_bank, writeback, rn, list)
            }
            Self::SoftwareInterrupt { .. } => {
                let return_address = cpu.reg(PC).wrapping_add(cpu.instruction_size());
                cpu.enter_exception(Mode::Supervisor, VECTOR_SOFTWARE_INTERRUPT, return_address);
                Ok(())
            }
            Self::Undefined { .. } => {
                let return_address = cpu.reg(PC).wrapping_add(cpu.instruction_size());
                cpu.enter_exception(Mode::Undefined, VECTOR_UNDEFINED, return_address);
                Ok(())
            }
            Self::LongBranchHigh { offset } => {
                let pc = cpu.reg(PC);
                cpu.set_reg(LR, pc.wrapping_add(4).wrapping_add(offset as u32));
                Ok(())
            }
            Self::LongBranchLow { offset } => {
                let pc = cpu.reg(PC);
                let target = cpu.reg(LR).wrapping_add(offset << 1);
                // Mark the return address as a return to Thumb state.
                cpu.set_reg(LR, pc.wrapping_add(2) | 1);
                cpu.set_reg(PC, target);
                Ok(())
            }
        }
    }
}

impl Instruction {
    /// Assembly rendering for the debugger's disassembly panel.
    pub fn as_asm(&self, condition: Condition) -> String {
        let cond = condition.as_asm();
        match *self {
            Self::DataProcessing { op, s, rn, rd, op2 } => {
                let mnemonic = match op {
                    AluOp::And => "and",
                    AluOp::Eor => "eor",
                    AluOp::Sub => "sub",
                    AluOp::Rsb => "rsb",
                    AluOp::Add => "add",
                    AluOp::Adc => "adc",
                    AluOp::Sbc => "sbc",
                    AluOp::Rsc => "rsc",
                    AluOp::Tst => "tst",
                    AluOp::Teq => "teq",
                    AluOp::Cmp => "cmp",
                    AluOp::Cmn => "cmn",
                    AluOp::Orr => "orr",
                    AluOp::Mov => "mov",
                    AluOp::Bic => "bic",
                    AluOp::Mvn => "mvn",
                };
                if op.is_test() {
                    format!("{}{} {}, {}", mnemonic, cond, reg_name(rn), op2)
                } else if matches!(op, AluOp::Mov | AluOp::Mvn) {
                    let s = if s { "s" } else { "" };
                    format!("{}{}{} {}, {}", mnemonic, cond, s, reg_name(rd), op2)
                } else {
                    let s = if s { "s" } else { "" };
                    format!("{}{}{} {}, {}, {}", mnemonic, cond, s, reg_name(rd), reg_name(rn), op2)
                }
            }
            Self::Mrs { spsr, rd } => {
                format!("mrs{} {}, {}", cond, reg_name(rd), if spsr { "spsr" } else { "cpsr" })
            }
            Self::Msr { spsr, fields, op2 } => {
                let mut mask = String::new();
                for (bit, name) in [(3, 'f'), (2, 's'), (1, 'x'), (0, 'c')].iter() {
                    if fields & (1 << bit) != 0 {
                        mask.push(*name);
                    }
                }
                format!("msr{} {}_{}, {}", cond, if spsr { "spsr" } else { "cpsr" }, mask, op2)
            }
            Self::Multiply { accumulate, s, rd, rn, rs, rm } => {
                let s = if s { "s" } else { "" };
                if accumulate {
                    format!("mla{}{} {}, {}, {}, {}", cond, s, reg_name(rd), reg_name(rm), reg_name(rs), reg_name(rn))
                } else {
                    format!("mul{}{} {}, {}, {}", cond, s, reg_name(rd), reg_name(rm), reg_name(rs))
                }
            }
            Self::MultiplyLong { signed, accumulate, s, rd_hi, rd_lo, rs, rm } => {
                format!(
                    "{}{}l{}{} {}, {}, {}, {}",
                    if signed { "s" } else { "u" },
                    if accumulate { "mla" } else { "mul" },
                    cond,
                    if s { "s" } else { "" },
                    reg_name(rd_lo),
                    reg_name(rd_hi),
                    reg_name(rm),
                    reg_name(rs),
                )
            }
            Self::Swap { byte, rn, rd, rm } => {
                let b = if byte { "b" } else { "" };
                format!("swp{}{} {}, {}, [{}]", cond, b, reg_name(rd), reg_name(rm), reg_name(rn))
            }
            Self::Branch { link, offset } => {
                format!("b{}{} #{:+}", if link { "l" } else { "" }, cond, offset)
            }
            Self::BranchExchange { rn } => format!("bx{} {}", cond, reg_name(rn)),
            Self::SingleTransfer { load, pre, up, byte, writeback, rn, rd, offset } => {
                let mnemonic = if load { "ldr" } else { "str" };
                let b = if byte { "b" } else { "" };
                let sign = if up { "" } else { "-" };
                if pre {
                    let bang = if writeback { "!" } else { "" };
                    format!("{}{}{} {}, [{}, {}{}]{}", mnemonic, cond, b, reg_name(rd), reg_name(rn), sign, offset, bang)
                } else {
                    format!("{}{}{} {}, [{}], {}{}", mnemonic, cond, b, reg_name(rd), reg_name(rn), sign, offset)
                }
            }
            Self::HalfwordTransfer { load, pre, up, writeback, kind, rn, rd, offset } => {
                let mnemonic = match (load, kind) {
                    (false, _) => "strh",
                    (true, HalfwordKind::Half) => "ldrh",
                    (true, HalfwordKind::SignedByte) => "ldrsb",
                    (true, HalfwordKind::SignedHalf) => "ldrsh",
                };
                let sign = if up { "" } else { "-" };
                let offset = match offset {
                    HalfwordOffset::Immediate(value) => format!("#0x{:x}", value),
                    HalfwordOffset::Register(rm) => reg_name(rm),
                };
                if pre {
                    let bang = if writeback { "!" } else { "" };
                    format!("{}{} {}, [{}, {}{}]{}", mnemonic, cond, reg_name(rd), reg_name(rn), sign, offset, bang)
                } else {
                    format!("{}{} {}, [{}], {}{}", mnemonic, cond, reg_name(rd), reg_name(rn), sign, offset)
                }
            }
            Self::BlockTransfer { load, pre, up, user_bank, writeback, rn, list } => {
                let mnemonic = if load { "ldm" } else { "stm" };
                let order = match (up, pre) {
                    (true, false) => "ia",
                    (true, true) => "ib",
                    (false, false) => "da",
                    (false, true) => "db",
                };
                let mut registers = String::new();
                for r in 0..16 {
                    if list & (1 << r) != 0 {
                        if !registers.is_empty() {
                            registers.push_str(", ");
                        }
                        registers.push_str(&reg_name(r));
                    }
                }
                format!(
                    "{}{}{} {}{}, {{{}}}{}",
                    mnemonic,
                    order,
                    cond,
                    reg_name(rn),
                    if writeback { "!" } else { "" },
                    registers,
                    if user_bank { "^" } else { "" },
                )
            }
            Self::SoftwareInterrupt { comment } => format!("swi{} #0x{:x}", cond, comment),
            Self::Undefined { opcode } => format!("undefined (0x{:08x})", opcode),
            Self::LongBranchHigh { offset } => format!("bl.hi #{:+}", offset),
            Self::LongBranchLow { offset } => format!("bl.lo #0x{:x}", offset << 1),
        }
    }
}

fn execute_data_processing(cpu: &mut Cpu, op: AluOp, s: bool, rn: usize, rd: usize, op2: Operand) {
    let (operand, shift_carry) = op2.value(cpu);
    let mut rn_value = cpu.reg_operand(rn);
    if cpu.thumb_state() && rn == PC {
        // Thumb ADR reads a word-aligned PC.
        rn_value &= !2;
    }
    let carry_in = (cpu.cpsr >> 29) & 1;
    let current_v = cpu.cpsr & CPSR_V != 0;

    let (result, carry, overflow) = match op {
        AluOp::And | AluOp::Tst => (rn_value & operand, shift_carry, current_v),
        AluOp::Eor | AluOp::Teq => (rn_value ^ operand, shift_carry, current_v),
        AluOp::Orr => (rn_value | operand, shift_carry, current_v),
        AluOp::Bic => (rn_value & !operand, shift_carry, current_v),
        AluOp::Mov => (operand, shift_carry, current_v),
        AluOp::Mvn => (!operand, shift_carry, current_v),
        AluOp::Add | AluOp::Cmn => add_with_flags(rn_value, operand, 0),
        AluOp::Adc => add_with_flags(rn_value, operand, carry_in),
        AluOp::Sub | AluOp::Cmp => sub_with_flags(rn_value, operand, 1),
        AluOp::Sbc => sub_with_flags(rn_value, operand, carry_in),
        AluOp::Rsb => sub_with_flags(operand, rn_value, 1),
        AluOp::Rsc => sub_with_flags(operand, rn_value, carry_in),
    };

    if op.is_test() {
        cpu.set_flag(CPSR_N, result & 0x8000_0000 != 0);
        cpu.set_flag(CPSR_Z, result == 0);
        cpu.set_flag(CPSR_C, carry);
        cpu.set_flag(CPSR_V, overflow);
        return;
    }

    if s {
        if rd == PC {
            // S with a PC destination restores the saved status register.
            cpu.restore_cpsr();
        } else {
            cpu.set_flag(CPSR_N, result & 0x8000_0000 != 0);
            cpu.set_flag(CPSR_Z, result == 0);
            cpu.set_flag(CPSR_C, carry);
            cpu.set_flag(CPSR_V, overflow);
        }
    }
    cpu.set_reg(rd, result);
}

fn execute_block_transfer(
    cpu: &mut Cpu,
    load: bool,
    pre: bool,
    up: bool,
    user_bank: bool,
    writeback: bool,
    rn: usize,
    list: u16,
) -> Result<(), Fault> {
    let base = cpu.reg(rn);
    let count = list.count_ones();
    let lowest = if up {
        if pre {
            base.wrapping_add(4)
        } else {
            base
        }
    } else if pre {
        base.wrapping_sub(4 * count)
    } else {
        base.wrapping_sub(4 * count).wrapping_add(4)
    };
    let final_base = if up { base.wrapping_add(4 * count) } else { base.wrapping_sub(4 * count) };

    // The S bit transfers user-bank registers, except that a load including
    // PC restores SPSR into CPSR instead.
    let restore = user_bank && load && list & (1 << PC) != 0;
    let user_transfer = user_bank && !restore;

    let mut address = lowest;
    if load {
        if writeback && list & (1 << rn) == 0 {
            cpu.set_reg(rn, final_base);
        }
        for r in 0..16 {
            if list & (1 << r) == 0 {
                continue;
            }
            let value = cpu.read_word(address)?;
            address = address.wrapping_add(4);
            if r == PC && restore {
                cpu.restore_cpsr();
            }
            if user_transfer {
                cpu.set_user_reg(r, value);
            } else {
                cpu.set_reg(r, value);
            }
        }
    } else {
        for r in 0..16 {
            if list & (1 << r) == 0 {
                continue;
            }
            let value = if r == PC {
                cpu.reg_operand(PC)
            } else if user_transfer {
                cpu.user_reg(r)
            } else {
                cpu.reg(r)
            };
            cpu.write_word(address, value)?;
            address = address.wrapping_add(4);
        }
        if writeback {
            cpu.set_reg(rn, final_base);
        }
    }
    Ok(())
}
