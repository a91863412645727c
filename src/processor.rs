// The processor core: the register file with its banked fan-out, the
// fetch/decode/execute cycle, exception entry and the debugger that rides
// along with it. Instruction semantics live in the instructions module;
// decoding in parser.

use crate::fields::{
    Mode, ARM_INSTRUCTION_SIZE, CPSR_C, CPSR_FIQ_DISABLE, CPSR_IRQ_DISABLE, CPSR_MODE_MASK,
    CPSR_N, CPSR_THUMB_STATE, CPSR_V, CPSR_Z, PC, THUMB_INSTRUCTION_SIZE,
};
use crate::gba::{REG_INTERRUPT_ENABLE, REG_INTERRUPT_MASTER_ENABLE, REG_INTERRUPT_REQUEST_FLAGS};
use crate::memory::BusPtr;
use crate::parser::{parse_arm, parse_thumb};
use crate::Fault;
use std::fmt;
use std::io;
use std::io::prelude::*;
use termion::{color, cursor};

pub const VECTOR_UNDEFINED: u32 = 0x04;
pub const VECTOR_SOFTWARE_INTERRUPT: u32 = 0x08;
pub const VECTOR_IRQ: u32 = 0x18;

pub struct Cpu {
    /// User-bank register file; R15 is the PC and is never banked.
    pub regs: [u32; 16],
    /// Banked R13/R14 per exception mode; the FIQ row additionally banks
    /// R8-R12 (slots 0..4).
    pub banked: [[u32; 7]; 5],
    pub cpsr: u32,
    pub spsr: [u32; 5],
    pub cycle_count: u64,
    pub bus: BusPtr,
    pc_written: bool,
}

impl Cpu {
    pub fn new(bus: BusPtr) -> Self {
        Cpu {
            regs: [0; 16],
            banked: [[0; 7]; 5],
            cpsr: Mode::System as u32 | CPSR_FIQ_DISABLE,
            spsr: [0; 5],
            cycle_count: 0,
            bus,
            pc_written: false,
        }
    }

    pub fn reset(&mut self) {
        self.regs = [0; 16];
        self.banked = [[0; 7]; 5];
        self.spsr = [0; 5];
        self.cpsr = Mode::System as u32 | CPSR_FIQ_DISABLE;
        self.cycle_count = 0;
    }

    pub fn mode(&self) -> Mode {
        Mode::from_bits(self.cpsr & CPSR_MODE_MASK)
    }

    pub fn thumb_state(&self) -> bool {
        self.cpsr & CPSR_THUMB_STATE != 0
    }

    pub fn instruction_size(&self) -> u32 {
        if self.thumb_state() {
            THUMB_INSTRUCTION_SIZE
        } else {
            ARM_INSTRUCTION_SIZE
        }
    }

    pub fn reg(&self, r: usize) -> u32 {
        match self.mode() {
            Mode::Fiq if (8..=14).contains(&r) => self.banked[0][r - 8],
            mode => match mode.bank_index() {
                Some(bank) if r == 13 || r == 14 => self.banked[bank][r - 13],
                _ => self.regs[r],
            },
        }
    }

    pub fn set_reg(&mut self, r: usize, value: u32) {
        if r == PC {
            // The PC is forced into alignment for the current state.
            let mask = if self.thumb_state() { !1 } else { !3 };
            self.regs[PC] = value & mask;
            self.pc_written = true;
            return;
        }
        match self.mode() {
            Mode::Fiq if (8..=14).contains(&r) => self.banked[0][r - 8] = value,
            mode => match mode.bank_index() {
                Some(bank) if r == 13 || r == 14 => self.banked[bank][r - 13] = value,
                _ => self.regs[r] = value,
            },
        }
    }

    /// User-bank access regardless of the current mode, for the S-bit forms
    /// of the block transfer.
    pub fn user_reg(&self, r: usize) -> u32 {
        self.regs[r]
    }

    pub fn set_user_reg(&mut self, r: usize, value: u32) {
        self.regs[r] = value;
    }

    /// Register read as an operand: the PC reads ahead of the instruction by
    /// one fetch (8 bytes in ARM state, 4 in Thumb).
    pub fn reg_operand(&self, r: usize) -> u32 {
        if r == PC {
            self.regs[PC].wrapping_add(self.instruction_size() * 2)
        } else {
            self.reg(r)
        }
    }

    pub fn spsr_value(&self) -> u32 {
        match self.mode().bank_index() {
            Some(bank) => self.spsr[bank],
            None => self.cpsr,
        }
    }

    pub fn set_spsr(&mut self, value: u32) {
        if let Some(bank) = self.mode().bank_index() {
            self.spsr[bank] = value;
        }
    }

    /// Exception return: copy the saved status register back.
    pub fn restore_cpsr(&mut self) {
        if let Some(bank) = self.mode().bank_index() {
            self.cpsr = self.spsr[bank];
        }
    }

    pub fn set_flag(&mut self, mask: u32, value: bool) {
        if value {
            self.cpsr |= mask;
        } else {
            self.cpsr &= !mask;
        }
    }

    /// Same as set_flag; kept apart so flag updates of the condition bits
    /// read differently from state-bit changes at the call sites.
    pub fn set_flag_raw(&mut self, mask: u32, value: bool) {
        self.set_flag(mask, value);
    }

    pub fn read_byte(&self, address: u32) -> Result<u8, Fault> {
        self.bus.borrow_mut().read_byte(address)
    }

    pub fn read_half(&self, address: u32) -> Result<u16, Fault> {
        self.bus.borrow_mut().read_half(address)
    }

    pub fn read_word(&self, address: u32) -> Result<u32, Fault> {
        self.bus.borrow_mut().read_word(address)
    }

    pub fn read_byte_signed(&self, address: u32) -> Result<i32, Fault> {
        self.bus.borrow_mut().read_byte_signed(address)
    }

    pub fn read_half_signed(&self, address: u32) -> Result<i32, Fault> {
        self.bus.borrow_mut().read_half_signed(address)
    }

    pub fn write_byte(&self, address: u32, value: u8) -> Result<(), Fault> {
        self.bus.borrow_mut().write_byte(address, value)
    }

    pub fn write_half(&self, address: u32, value: u16) -> Result<(), Fault> {
        self.bus.borrow_mut().write_half(address, value)
    }

    pub fn write_word(&self, address: u32, value: u32) -> Result<(), Fault> {
        self.bus.borrow_mut().write_word(address, value)
    }

    /// Fetch, decode and execute the instruction at PC, advancing PC unless
    /// the instruction itself wrote it. A failing condition still advances.
    pub fn cycle(&mut self) -> Result<(), Fault> {
        let pc = self.regs[PC];
        self.bus.borrow_mut().pc = pc;
        let (condition, instruction) = if self.thumb_state() {
            let opcode = self.read_half(pc)?;
            parse_thumb(opcode)
        } else {
            let opcode = self.read_word(pc)?;
            parse_arm(opcode)
        };
        self.pc_written = false;
        if condition.passes(self.cpsr) {
            instruction.execute(self)?;
        }
        if !self.pc_written {
            self.regs[PC] = pc.wrapping_add(self.instruction_size());
        }
        Ok(())
    }

    /// IRQ delivery point, checked once per tick after the instruction.
    pub fn interrupt_cycle(&mut self) {
        let (master, enabled, requested) = {
            let bus = self.bus.borrow();
            (
                bus.io_half(REG_INTERRUPT_MASTER_ENABLE),
                bus.io_half(REG_INTERRUPT_ENABLE),
                bus.io_half(REG_INTERRUPT_REQUEST_FLAGS),
            )
        };
        if master & 1 == 0 || self.cpsr & CPSR_IRQ_DISABLE != 0 || enabled & requested == 0 {
            return;
        }
        let return_address = self.regs[PC].wrapping_add(4);
        self.enter_exception(Mode::Irq, VECTOR_IRQ, return_address);
    }

    /// Common exception entry: save CPSR into the target mode's SPSR, switch
    /// mode, disable IRQ, drop to ARM state and jump through the vector.
    pub fn enter_exception(&mut self, mode: Mode, vector: u32, return_address: u32) {
        let old = self.cpsr;
        self.cpsr = (old & !(CPSR_MODE_MASK | CPSR_THUMB_STATE)) | mode as u32 | CPSR_IRQ_DISABLE;
        self.set_spsr(old);
        self.set_reg(crate::fields::LR, return_address);
        self.set_reg(PC, vector);
    }

    /// Disassemble the next instructions at PC without disturbing state.
    pub fn disassemble(&self, count: usize) -> Vec<(u32, u32, String)> {
        let mut lines = Vec::with_capacity(count);
        let mut address = self.regs[PC];
        for _ in 0..count {
            if self.thumb_state() {
                match self.read_half(address) {
                    Ok(opcode) => {
                        let (condition, instruction) = parse_thumb(opcode);
                        lines.push((address, opcode as u32, instruction.as_asm(condition)));
                    }
                    Err(_) => lines.push((address, 0, String::from("??"))),
                }
                address = address.wrapping_add(2);
            } else {
                match self.read_word(address) {
                    Ok(opcode) => {
                        let (condition, instruction) = parse_arm(opcode);
                        lines.push((address, opcode, instruction.as_asm(condition)));
                    }
                    Err(_) => lines.push((address, 0, String::from("??"))),
                }
                address = address.wrapping_add(4);
            }
        }
        lines
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::from("\n");
        s.push_str(&format!("{r}╔════════════════════════════════════╗", r = cursor::Goto(1, 2)));
        s.push_str(&format!("{r}║ CPU state                          ║", r = cursor::Goto(1, 3)));
        s.push_str(&format!("{r}╟──────┬───────────┬─────┬───────────╢", r = cursor::Goto(1, 4)));
        for j in 0..8 {
            s.push_str(&format!(
                "{r}║ R{j:<2}  │  {lo:08x} │ R{hi:<2} │  {hv:08x} ║",
                j = j,
                lo = self.reg(j),
                hi = j + 8,
                hv = self.reg(j + 8),
                r = cursor::Goto(1, (j + 5) as u16),
            ));
        }
        let mode = match self.mode() {
            Mode::User => "usr",
            Mode::Fiq => "fiq",
            Mode::Irq => "irq",
            Mode::Supervisor => "svc",
            Mode::Abort => "abt",
            Mode::Undefined => "und",
            Mode::System => "sys",
        };
        s.push_str(&format!("{r}╟──────┼─┬─┬─┬─┬─┬─┴┬────┴┬──────────╢", r = cursor::Goto(1, 13)));
        s.push_str(&format!(
            "{r}║ {m:<4} │{n}│{z}│{c}│{v}│{t} │ CYC │ {cy:8} ║",
            m = mode,
            n = (self.cpsr & CPSR_N != 0) as u8,
            z = (self.cpsr & CPSR_Z != 0) as u8,
            c = (self.cpsr & CPSR_C != 0) as u8,
            v = (self.cpsr & CPSR_V != 0) as u8,
            t = if self.thumb_state() { 'T' } else { 'A' },
            cy = self.cycle_count,
            r = cursor::Goto(1, 14),
        ));
        s.push_str(&format!("{r}╚══════╧═╧═╧═╧═╧═╧══╧═════╧══════════╝", r = cursor::Goto(1, 15)));
        write!(f, "{}", s)
    }
}

/// Commands travelling from the host's debugger prompt to the emulation
/// worker over a bounded channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugCommand {
    Continue,
    Break,
    Step(u32),
    NextFrame,
    Reset,
    SetBreakpoint(u32),
    DeleteBreakpoint(u32),
    Watch(u32),
    Unwatch(u32),
    SaveState(String),
    LoadState(String),
    Quit,
}

/// Line-oriented debugger prompt. Runs on the host side; the worker only
/// ever sees the parsed commands.
pub struct Debugger {
    last_command: DebugCommand,
}

impl Debugger {
    pub fn new() -> Self {
        Debugger { last_command: DebugCommand::Step(1) }
    }

    pub fn read_command(&mut self) -> DebugCommand {
        print!(
            "{g}dbg>{n} ",
            g = color::Fg(color::Green),
            n = color::Fg(color::Reset)
        );
        io::stdout().flush().ok();
        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            return DebugCommand::Quit;
        }
        if input.is_empty() {
            // EOF on stdin.
            return DebugCommand::Quit;
        }
        let mut words = input.split_whitespace();
        let command = match words.next() {
            Some("c") => DebugCommand::Continue,
            Some("i") => DebugCommand::Break,
            Some("s") | Some("n") => {
                let count = words.next().and_then(|w| w.parse().ok()).unwrap_or(1);
                DebugCommand::Step(count)
            }
            Some("f") => DebugCommand::NextFrame,
            Some("r") => DebugCommand::Reset,
            Some("b") => match parse_address(words.next()) {
                Some(address) => DebugCommand::SetBreakpoint(address),
                None => self.last_command.clone(),
            },
            Some("d") => match parse_address(words.next()) {
                Some(address) => DebugCommand::DeleteBreakpoint(address),
                None => self.last_command.clone(),
            },
            Some("w") => match parse_address(words.next()) {
                Some(address) => DebugCommand::Watch(address),
                None => self.last_command.clone(),
            },
            Some("u") => match parse_address(words.next()) {
                Some(address) => DebugCommand::Unwatch(address),
                None => self.last_command.clone(),
            },
            Some("save") => match words.next() {
                Some(path) => DebugCommand::SaveState(path.to_string()),
                None => self.last_command.clone(),
            },
            Some("load") => match words.next() {
                Some(path) => DebugCommand::LoadState(path.to_string()),
                None => self.last_command.clone(),
            },
            Some("q") => DebugCommand::Quit,
            // A bare return repeats the previous command.
            None => self.last_command.clone(),
            _ => {
                println!(
                    "commands: c continue, i break, s/n [count] step, f frame, r reset, \
                     b/d <addr> breakpoints, w/u <addr> watches, save/load <path>, q quit"
                );
                self.last_command.clone()
            }
        };
        self.last_command = command.clone();
        command
    }
}

fn parse_address(word: Option<&str>) -> Option<u32> {
    let word = word?;
    u32::from_str_radix(word.trim_start_matches("0x"), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Bus;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn cpu() -> Cpu {
        Cpu::new(Rc::new(RefCell::new(Bus::new())))
    }

    #[test]
    fn banked_registers_follow_the_mode() {
        let mut cpu = cpu();
        cpu.set_reg(13, 0x100);
        cpu.cpsr = (cpu.cpsr & !CPSR_MODE_MASK) | Mode::Irq as u32;
        cpu.set_reg(13, 0x200);
        assert_eq!(cpu.reg(13), 0x200);
        cpu.cpsr = (cpu.cpsr & !CPSR_MODE_MASK) | Mode::System as u32;
        assert_eq!(cpu.reg(13), 0x100);
    }

    #[test]
    fn fiq_banks_r8_to_r12_as_well() {
        let mut cpu = cpu();
        cpu.set_reg(8, 0x11);
        cpu.set_reg(12, 0x22);
        cpu.cpsr = (cpu.cpsr & !CPSR_MODE_MASK) | Mode::Fiq as u32;
        cpu.set_reg(8, 0x33);
        assert_eq!(cpu.reg(8), 0x33);
        assert_eq!(cpu.user_reg(8), 0x11);
        cpu.cpsr = (cpu.cpsr & !CPSR_MODE_MASK) | Mode::User as u32;
        assert_eq!(cpu.reg(8), 0x11);
        assert_eq!(cpu.reg(12), 0x22);
    }

    #[test]
    fn exception_entry_saves_and_restores_cpsr() {
        let mut cpu = cpu();
        let before = cpu.cpsr;
        cpu.enter_exception(Mode::Irq, VECTOR_IRQ, 0x8000_0104);
        assert_eq!(cpu.mode(), Mode::Irq);
        assert_ne!(cpu.cpsr & CPSR_IRQ_DISABLE, 0);
        assert_eq!(cpu.reg(14), 0x8000_0104);
        assert_eq!(cpu.regs[PC], VECTOR_IRQ);
        cpu.restore_cpsr();
        assert_eq!(cpu.cpsr, before);
    }

    #[test]
    fn pc_writes_are_aligned_for_the_state() {
        let mut cpu = cpu();
        cpu.set_reg(PC, 0x1007);
        assert_eq!(cpu.regs[PC], 0x1004);
        cpu.cpsr |= CPSR_THUMB_STATE;
        cpu.set_reg(PC, 0x1007);
        assert_eq!(cpu.regs[PC], 0x1006);
    }
}
