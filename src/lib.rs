use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info};
use thiserror::Error;

pub mod backup;
pub mod dma;
pub mod fields;
pub mod gba;
mod instructions;
pub mod memory;
mod parser;
pub mod processor;
pub mod timers;
pub mod video;

use fields::{PC, SP};
use gba::{Configuration, REG_KEY_STATUS, REG_VERTICAL_COUNT};
use memory::{Bus, BusPtr};
use processor::{Cpu, DebugCommand};
use timers::Timers;
use video::{Gpu, FRAME_HEIGHT, FRAME_WIDTH, VBLANK_SCANLINE};

/// The unrecoverable faults of the core, surfaced as values throughout.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("address {address:#010x} belongs to no memory region (pc {pc:#010x})")]
    Address { address: u32, pc: u32 },
    #[error("pc {pc:#010x} is misaligned for the current execution state")]
    Alignment { pc: u32 },
    #[error("dma channel {channel} uses the prohibited source address mode")]
    ProhibitedDma { channel: usize },
    #[error("eeprom stream of {bits} bits does not form a recognized command")]
    BackupCommand { bits: u32 },
    #[error("eeprom read transfer without a latched read address")]
    BackupRead,
    #[error("i/o failure on {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// The only state shared between the emulation worker and the presenter:
/// the key register, the kill flag, and the frame buffer.
#[derive(Clone)]
pub struct Shared {
    pub keys: Arc<AtomicU16>,
    pub kill: Arc<AtomicBool>,
    pub frame: Arc<Mutex<Vec<u16>>>,
}

impl Default for Shared {
    fn default() -> Self {
        Shared {
            keys: Arc::new(AtomicU16::new(gba::ALL_KEYS_RELEASED)),
            kill: Arc::new(AtomicBool::new(false)),
            frame: Arc::new(Mutex::new(vec![0; FRAME_WIDTH * FRAME_HEIGHT])),
        }
    }
}

pub struct Emulator {
    pub cpu: Cpu,
    gpu: Gpu,
    timers: Timers,
    shared: Shared,
}

impl Emulator {
    pub fn new(config: Configuration, shared: Shared) -> Emulator {
        let mut bus = Bus::new();
        bus.rom_write_protection = config.rom_write_protection;
        let timers = Timers::new();
        gba::install_hooks(&mut bus, &timers);
        gba::seed_io(&mut bus);
        let bus: BusPtr = Rc::new(RefCell::new(bus));
        let mut cpu = Cpu::new(Rc::clone(&bus));
        seed_stack_pointers(&mut cpu);
        let gpu = Gpu::new(Arc::clone(&shared.frame));
        Emulator { cpu, gpu, timers, shared }
    }

    pub fn load_bios(&mut self, bytes: &[u8]) {
        self.cpu.bus.borrow_mut().load_bios(bytes);
        info!("loaded bios image ({} bytes)", bytes.len());
    }

    pub fn load_rom(&mut self, bytes: &[u8]) {
        self.cpu.bus.borrow_mut().load_rom(bytes);
        info!("loaded rom image ({} bytes)", bytes.len());
    }

    pub fn set_key_status(&self, value: u16) {
        self.shared.keys.store(value & 0x03ff, Ordering::Relaxed);
    }

    pub fn kill(&self) {
        self.shared.kill.store(true, Ordering::Relaxed);
    }

    /// One emulator tick: CPU, interrupt delivery, pixel pipeline, DMA and
    /// timers, in that order, all against the shared bus.
    pub fn tick(&mut self) -> Result<(), Fault> {
        let pc = self.cpu.regs[PC];
        if pc % self.cpu.instruction_size() != 0 {
            return Err(Fault::Alignment { pc });
        }

        {
            let mut bus = self.cpu.bus.borrow_mut();
            let keys = self.shared.keys.load(Ordering::Relaxed) & 0x03ff;
            bus.set_io_half(REG_KEY_STATUS, keys);
        }

        self.cpu.cycle()?;
        self.cpu.interrupt_cycle();
        {
            let mut bus = self.cpu.bus.borrow_mut();
            self.gpu.cycle(&mut bus, self.cpu.cycle_count);
        }
        dma::cycle(&mut self.cpu)?;
        {
            let mut bus = self.cpu.bus.borrow_mut();
            self.timers.cycle(&mut bus, self.cpu.cycle_count);
        }
        self.cpu.cycle_count += 1;
        Ok(())
    }

    /// Zero the working memories and the CPU; cartridge backup survives.
    pub fn soft_reset(&mut self) {
        self.cpu.reset();
        seed_stack_pointers(&mut self.cpu);
        self.timers.reset();
        let mut bus = self.cpu.bus.borrow_mut();
        bus.soft_reset();
        gba::seed_io(&mut bus);
        info!("soft reset");
    }

    pub fn save_state<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let bus = self.cpu.bus.borrow();
        writer.write_all(&self.cpu.cycle_count.to_le_bytes())?;
        for value in self.cpu.regs.iter() {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.write_all(&self.cpu.cpsr.to_le_bytes())?;
        for value in self.cpu.spsr.iter() {
            writer.write_all(&value.to_le_bytes())?;
        }
        for bank in self.cpu.banked.iter() {
            for value in bank.iter() {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        writer.write_all(&bus.ewram)?;
        writer.write_all(&bus.iwram)?;
        writer.write_all(&bus.io)?;
        writer.write_all(&bus.palette)?;
        writer.write_all(&bus.vram)?;
        writer.write_all(&bus.oam)?;
        writer.write_all(&bus.sram[..0x10000])?;
        Ok(())
    }

    pub fn load_state<R: Read>(&mut self, reader: &mut R) -> io::Result<()> {
        let mut bus = self.cpu.bus.borrow_mut();
        let mut word = [0u8; 8];
        reader.read_exact(&mut word)?;
        self.cpu.cycle_count = u64::from_le_bytes(word);
        let mut read_u32 = |reader: &mut R| -> io::Result<u32> {
            let mut bytes = [0u8; 4];
            reader.read_exact(&mut bytes)?;
            Ok(u32::from_le_bytes(bytes))
        };
        for slot in 0..16 {
            self.cpu.regs[slot] = read_u32(reader)?;
        }
        self.cpu.cpsr = read_u32(reader)?;
        for slot in 0..5 {
            self.cpu.spsr[slot] = read_u32(reader)?;
        }
        for bank in 0..5 {
            for slot in 0..7 {
                self.cpu.banked[bank][slot] = read_u32(reader)?;
            }
        }
        reader.read_exact(&mut bus.ewram)?;
        reader.read_exact(&mut bus.iwram)?;
        reader.read_exact(&mut bus.io)?;
        reader.read_exact(&mut bus.palette)?;
        reader.read_exact(&mut bus.vram)?;
        reader.read_exact(&mut bus.oam)?;
        reader.read_exact(&mut bus.sram[..0x10000])?;
        Ok(())
    }

    /// The emulation worker loop. Ticks until the kill flag is set,
    /// processing debugger commands from the bounded channel; on a fault the
    /// frame buffer freezes and the loop parks until reset, load or quit.
    pub fn run(&mut self, commands: Receiver<DebugCommand>, start_broken: bool) {
        let mut broken = start_broken;
        let mut breakpoints: HashSet<u32> = HashSet::new();
        let mut watches: BTreeSet<u32> = BTreeSet::new();
        while !self.shared.kill.load(Ordering::Relaxed) {
            let command = if broken {
                match commands.recv_timeout(Duration::from_millis(50)) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                commands.try_recv().ok()
            };

            if let Some(command) = command {
                match command {
                    DebugCommand::Continue => {
                        // Step over a breakpoint on the current instruction.
                        broken = self.guarded_tick().is_err();
                    }
                    DebugCommand::Break => {
                        broken = true;
                        self.print_debug_view(&watches);
                    }
                    DebugCommand::Step(count) => {
                        broken = true;
                        for _ in 0..count {
                            if self.guarded_tick().is_err() {
                                break;
                            }
                        }
                        self.print_debug_view(&watches);
                        continue;
                    }
                    DebugCommand::NextFrame => {
                        broken = true;
                        self.run_to_next_frame();
                        self.print_debug_view(&watches);
                        continue;
                    }
                    DebugCommand::Reset => self.soft_reset(),
                    DebugCommand::SetBreakpoint(address) => {
                        breakpoints.insert(address);
                    }
                    DebugCommand::DeleteBreakpoint(address) => {
                        breakpoints.remove(&address);
                    }
                    DebugCommand::Watch(address) => {
                        watches.insert(address);
                    }
                    DebugCommand::Unwatch(address) => {
                        watches.remove(&address);
                    }
                    DebugCommand::SaveState(path) => {
                        if let Err(fault) = self.save_state_to(&path) {
                            error!("{}", fault);
                        } else {
                            info!("state saved to {}", path);
                        }
                    }
                    DebugCommand::LoadState(path) => {
                        if let Err(fault) = self.load_state_from(&path) {
                            error!("{}", fault);
                        } else {
                            info!("state loaded from {}", path);
                        }
                    }
                    DebugCommand::Quit => {
                        self.kill();
                        break;
                    }
                }
            }

            if broken {
                continue;
            }
            if !breakpoints.is_empty() && breakpoints.contains(&self.cpu.regs[PC]) {
                broken = true;
                self.print_debug_view(&watches);
                continue;
            }
            if self.guarded_tick().is_err() {
                broken = true;
            }
        }
    }

    fn print_debug_view(&self, watches: &BTreeSet<u32>) {
        eprintln!("{}", self.cpu);
        for (address, opcode, text) in self.cpu.disassemble(8) {
            eprintln!("{:08x}: {:08x}  {}", address, opcode, text);
        }
        for address in watches.iter() {
            match self.cpu.bus.borrow_mut().read_word(*address) {
                Ok(value) => eprintln!("watch {:08x}: {:08x}", address, value),
                Err(_) => eprintln!("watch {:08x}: <unmapped>", address),
            }
        }
    }

    fn guarded_tick(&mut self) -> Result<(), Fault> {
        self.tick().map_err(|fault| {
            error!("{}", fault);
            eprintln!("{}", self.cpu);
            fault
        })
    }

    fn run_to_next_frame(&mut self) {
        let scanline = |emulator: &Emulator| {
            emulator.cpu.bus.borrow().io_byte(REG_VERTICAL_COUNT) as u32
        };
        while scanline(self) != VBLANK_SCANLINE {
            if self.guarded_tick().is_err() {
                return;
            }
        }
        while scanline(self) == VBLANK_SCANLINE {
            if self.guarded_tick().is_err() {
                return;
            }
        }
    }

    pub fn save_state_to(&self, path: &str) -> Result<(), Fault> {
        let mut file = File::create(path).map_err(|source| Fault::Io {
            path: path.to_string(),
            source,
        })?;
        self.save_state(&mut file).map_err(|source| Fault::Io {
            path: path.to_string(),
            source,
        })
    }

    pub fn load_state_from(&mut self, path: &str) -> Result<(), Fault> {
        let mut file = File::open(path).map_err(|source| Fault::Io {
            path: path.to_string(),
            source,
        })?;
        self.load_state(&mut file).map_err(|source| Fault::Io {
            path: path.to_string(),
            source,
        })
    }
}

/// Stack pointers the firmware would normally establish.
fn seed_stack_pointers(cpu: &mut Cpu) {
    // Supervisor and IRQ banks hold R13 in slot 0.
    cpu.banked[2][0] = 0x0300_7fe0;
    cpu.banked[1][0] = 0x0300_7fa0;
    cpu.regs[SP] = 0x0300_7f00;
}
