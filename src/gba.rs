// Console-specific wiring: the memory-mapped register set, the hooks the
// machine installs on the bus, and the initial seeding a freshly powered
// unit presents to the program.

use crate::memory::Bus;
use crate::timers::{Timers, TIMER_CONTROL_ENABLE};
use bitflags::bitflags;
use std::rc::Rc;

pub const REG_LCD_CONTROL: u32 = 0x0400_0000;
pub const REG_LCD_STATUS: u32 = 0x0400_0004;
pub const REG_VERTICAL_COUNT: u32 = 0x0400_0006;
pub const REG_BG0_CONTROL: u32 = 0x0400_0008;
pub const REG_BG2_CONTROL: u32 = 0x0400_000c;
pub const REG_BG0_X_OFFSET: u32 = 0x0400_0010;
pub const REG_BG0_Y_OFFSET: u32 = 0x0400_0012;
pub const REG_BG2_PARAM_A: u32 = 0x0400_0020;
pub const REG_BG2_X_REF: u32 = 0x0400_0028;
pub const REG_BG3_PARAM_A: u32 = 0x0400_0030;
pub const REG_BG3_X_REF: u32 = 0x0400_0038;
pub const REG_WIN0_H: u32 = 0x0400_0040;
pub const REG_WIN1_H: u32 = 0x0400_0042;
pub const REG_WIN0_V: u32 = 0x0400_0044;
pub const REG_WIN1_V: u32 = 0x0400_0046;
pub const REG_WINDOW_INSIDE: u32 = 0x0400_0048;
pub const REG_WINDOW_OUTSIDE: u32 = 0x0400_004a;
pub const REG_BLEND_CONTROL: u32 = 0x0400_0050;
pub const REG_BLEND_ALPHA: u32 = 0x0400_0052;
pub const REG_BLEND_BRIGHTNESS: u32 = 0x0400_0054;
pub const REG_KEY_STATUS: u32 = 0x0400_0130;
pub const REG_INTERRUPT_ENABLE: u32 = 0x0400_0200;
pub const REG_INTERRUPT_REQUEST_FLAGS: u32 = 0x0400_0202;
pub const REG_INTERRUPT_MASTER_ENABLE: u32 = 0x0400_0208;

/// Reads at the EEPROM base report the previous transaction as complete.
pub const EEPROM_READY_ADDRESS: u32 = 0x0d00_0000;

pub const LCD_STATUS_VBLANK_FLAG: u16 = 1;
pub const LCD_STATUS_HBLANK_FLAG: u16 = 1 << 1;
pub const LCD_STATUS_VCOUNT_MATCH_FLAG: u16 = 1 << 2;
pub const LCD_STATUS_VBLANK_IRQ_ENABLE: u16 = 1 << 3;
pub const LCD_STATUS_HBLANK_IRQ_ENABLE: u16 = 1 << 4;
pub const LCD_STATUS_VCOUNT_IRQ_ENABLE: u16 = 1 << 5;

pub fn dma_source(channel: usize) -> u32 {
    0x0400_00b0 + 12 * channel as u32
}

pub fn dma_destination(channel: usize) -> u32 {
    dma_source(channel) + 4
}

pub fn dma_count(channel: usize) -> u32 {
    dma_source(channel) + 8
}

pub fn dma_control(channel: usize) -> u32 {
    dma_source(channel) + 10
}

pub fn timer_counter(channel: usize) -> u32 {
    0x0400_0100 + 4 * channel as u32
}

pub fn timer_control(channel: usize) -> u32 {
    timer_counter(channel) + 2
}

bitflags! {
    /// Bits of the interrupt enable and request registers.
    pub struct IrqBits: u16 {
        const VBLANK = 1;
        const HBLANK = 1 << 1;
        const VCOUNT = 1 << 2;
        const TIMER0 = 1 << 3;
        const TIMER1 = 1 << 4;
        const TIMER2 = 1 << 5;
        const TIMER3 = 1 << 6;
        const SERIAL = 1 << 7;
        const DMA0 = 1 << 8;
        const DMA1 = 1 << 9;
        const DMA2 = 1 << 10;
        const DMA3 = 1 << 11;
        const KEYPAD = 1 << 12;
        const GAMEPAK = 1 << 13;
    }
}

impl IrqBits {
    pub fn timer(channel: usize) -> Self {
        IrqBits::from_bits_truncate(1 << (3 + channel))
    }
    pub fn dma(channel: usize) -> Self {
        IrqBits::from_bits_truncate(1 << (8 + channel))
    }
}

bitflags! {
    /// Buttons of the key status register; a clear bit means pressed.
    pub struct KeyButtons: u16 {
        const A = 1;
        const B = 1 << 1;
        const SELECT = 1 << 2;
        const START = 1 << 3;
        const RIGHT = 1 << 4;
        const LEFT = 1 << 5;
        const UP = 1 << 6;
        const DOWN = 1 << 7;
        const R = 1 << 8;
        const L = 1 << 9;
    }
}

pub const ALL_KEYS_RELEASED: u16 = 0x03ff;

/// Set request bits directly, bypassing the clear-on-write hook.
pub fn raise_interrupt(bus: &mut Bus, bits: IrqBits) {
    let flags = bus.io_half(REG_INTERRUPT_REQUEST_FLAGS) | bits.bits();
    bus.set_io_half(REG_INTERRUPT_REQUEST_FLAGS, flags);
}

pub struct Configuration {
    pub rom_write_protection: bool,
}

/// The stock console configuration.
pub fn agb() -> Configuration {
    Configuration { rom_write_protection: true }
}

pub fn install_hooks(bus: &mut Bus, timers: &Timers) {
    // Writing the interrupt request flags clears the bits set in the value.
    bus.on_write(
        REG_INTERRUPT_REQUEST_FLAGS,
        Rc::new(|bus: &mut Bus, address: u32, value: u32| {
            let flags = bus.io_half(address) & !(value as u16);
            bus.set_io_half(address, flags);
        }),
    );

    // The key status register is read-only from the program's side.
    bus.on_write(REG_KEY_STATUS, Rc::new(|_: &mut Bus, _: u32, _: u32| {}));

    bus.on_read(EEPROM_READY_ADDRESS, Rc::new(|_: &mut Bus, _: u32| 1));

    for channel in 0..4 {
        // Reading the counter register returns the live counter.
        let counters = Rc::clone(&timers.counters);
        bus.on_read(
            timer_counter(channel),
            Rc::new(move |_: &mut Bus, _: u32| counters.borrow()[channel]),
        );

        // Enabling a stopped timer reloads the counter from the reload value.
        let counters = Rc::clone(&timers.counters);
        bus.on_write(
            timer_control(channel),
            Rc::new(move |bus: &mut Bus, address: u32, value: u32| {
                let previous = bus.io_half(address);
                if previous & TIMER_CONTROL_ENABLE == 0 && value as u16 & TIMER_CONTROL_ENABLE != 0 {
                    counters.borrow_mut()[channel] = bus.io_half(timer_counter(channel)) as u32;
                }
                bus.set_io_half(address, value as u16);
            }),
        );
    }
}

/// Power-on register and backup seeding.
pub fn seed_io(bus: &mut Bus) {
    bus.set_io_half(REG_KEY_STATUS, ALL_KEYS_RELEASED);
    // Flash ID pair at the start of SRAM so presence probes succeed before
    // the program issues any flash command.
    bus.sram[0] = 0x62;
    bus.sram[1] = 0x13;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_request_flags_clear_on_write() {
        let mut bus = Bus::new();
        let timers = Timers::new();
        install_hooks(&mut bus, &timers);
        raise_interrupt(&mut bus, IrqBits::VBLANK | IrqBits::TIMER0);
        bus.write_half(REG_INTERRUPT_REQUEST_FLAGS, IrqBits::VBLANK.bits()).unwrap();
        assert_eq!(bus.io_half(REG_INTERRUPT_REQUEST_FLAGS), IrqBits::TIMER0.bits());
    }

    #[test]
    fn key_status_writes_are_ignored() {
        let mut bus = Bus::new();
        let timers = Timers::new();
        install_hooks(&mut bus, &timers);
        seed_io(&mut bus);
        bus.write_half(REG_KEY_STATUS, 0).unwrap();
        assert_eq!(bus.io_half(REG_KEY_STATUS), ALL_KEYS_RELEASED);
    }

    #[test]
    fn eeprom_base_reads_ready() {
        let mut bus = Bus::new();
        let timers = Timers::new();
        install_hooks(&mut bus, &timers);
        assert_eq!(bus.read_half(EEPROM_READY_ADDRESS).unwrap(), 1);
    }

    #[test]
    fn enabling_a_timer_reloads_its_counter() {
        let mut bus = Bus::new();
        let timers = Timers::new();
        install_hooks(&mut bus, &timers);
        bus.write_half(timer_counter(2), 0xffe0).unwrap();
        bus.write_half(timer_control(2), TIMER_CONTROL_ENABLE).unwrap();
        assert_eq!(timers.counters.borrow()[2], 0xffe0);
        // Re-writing the control of a running timer does not reload.
        timers.counters.borrow_mut()[2] = 5;
        bus.write_half(timer_control(2), TIMER_CONTROL_ENABLE).unwrap();
        assert_eq!(timers.counters.borrow()[2], 5);
    }
}
