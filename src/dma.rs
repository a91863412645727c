use crate::gba::{
    dma_control, dma_count, dma_destination, dma_source, raise_interrupt, IrqBits,
    LCD_STATUS_HBLANK_FLAG, LCD_STATUS_VBLANK_FLAG, REG_LCD_STATUS,
};
use crate::processor::Cpu;
use crate::Fault;

const ENABLE_FLAG: u16 = 1 << 15;

fn in_eeprom_region(address: u32) -> bool {
    (0x0d00_0000..0x0e00_0000).contains(&address)
}

/// Scan the channels in order and process at most one per tick.
pub fn cycle(cpu: &mut Cpu) -> Result<(), Fault> {
    for channel in 0..4 {
        if process_channel(cpu, channel)? {
            break;
        }
    }
    Ok(())
}

fn process_channel(cpu: &mut Cpu, channel: usize) -> Result<bool, Fault> {
    let (mut source, mut destination, count, control) = {
        let bus = cpu.bus.borrow();
        (
            bus.io_word(dma_source(channel)),
            bus.io_word(dma_destination(channel)),
            bus.io_half(dma_count(channel)) as u32,
            bus.io_half(dma_control(channel)),
        )
    };
    if control & ENABLE_FLAG == 0 {
        return Ok(false);
    }

    match (control >> 11) & 0x3 {
        // Immediate transfers start as soon as the channel is enabled.
        0 => {}
        1 => {
            if cpu.bus.borrow().io_half(REG_LCD_STATUS) & LCD_STATUS_VBLANK_FLAG == 0 {
                return Ok(false);
            }
        }
        2 => {
            if cpu.bus.borrow().io_half(REG_LCD_STATUS) & LCD_STATUS_HBLANK_FLAG == 0 {
                return Ok(false);
            }
        }
        // Special mode drives the sound FIFO, which is not attached.
        _ => return Ok(false),
    }

    let destination_control = (control >> 5) & 0x3;
    let source_control = (control >> 7) & 0x3;
    if source_control == 3 {
        return Err(Fault::ProhibitedDma { channel });
    }
    let repeat = control & (1 << 9) != 0;
    let word_transfer = control & (1 << 10) != 0;
    let irq_on_completion = control & (1 << 13) != 0;
    let unit: u32 = if word_transfer { 4 } else { 2 };

    let serial_write = in_eeprom_region(destination);
    for i in 0..count {
        if in_eeprom_region(destination) {
            // Writes toward the EEPROM feed its shift buffer one bit per unit.
            let bit = cpu.read_half(source)? & 1;
            cpu.bus.borrow_mut().eeprom.collect_bit(bit);
        } else if in_eeprom_region(source) {
            // Reads shift the latched word out one bit per unit; the first
            // four units are protocol padding and transfer nothing.
            let bit = cpu.bus.borrow_mut().eeprom.shift_out(i)?;
            if i >= 4 {
                cpu.write_half(destination, bit)?;
            }
        } else if word_transfer {
            let data = cpu.read_word(source)?;
            cpu.write_word(destination, data)?;
        } else {
            let data = cpu.read_half(source)?;
            cpu.write_half(destination, data)?;
        }

        match destination_control {
            0 | 3 => destination = destination.wrapping_add(unit),
            1 => destination = destination.wrapping_sub(unit),
            _ => {}
        }
        match source_control {
            0 => source = source.wrapping_add(unit),
            1 => source = source.wrapping_sub(unit),
            _ => {}
        }
        cpu.bus.borrow_mut().set_io_half(dma_count(channel), (count - i - 1) as u16);
    }

    if serial_write {
        cpu.bus.borrow_mut().eeprom.execute_command()?;
    }

    let mut bus = cpu.bus.borrow_mut();
    if repeat {
        bus.set_io_half(dma_count(channel), count as u16);
    } else {
        bus.set_io_half(dma_control(channel), control & !ENABLE_FLAG);
    }
    if irq_on_completion {
        raise_interrupt(&mut bus, IrqBits::dma(channel));
    }
    Ok(true)
}
