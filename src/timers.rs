use crate::gba::{raise_interrupt, timer_control, timer_counter, IrqBits};
use crate::memory::Bus;
use std::cell::RefCell;
use std::rc::Rc;

pub const TIMER_CONTROL_ENABLE: u16 = 1 << 7;
const TIMER_CONTROL_COUNT_UP: u16 = 1 << 2;
const TIMER_CONTROL_IRQ_ENABLE: u16 = 1 << 6;

const PRESCALER_INTERVALS: [u64; 4] = [1, 64, 256, 1024];

/// Four cascadable counters. The counters live behind a shared handle
/// because the bus hooks for the counter registers read and reload them.
pub struct Timers {
    pub counters: Rc<RefCell<[u32; 4]>>,
    overflow: [bool; 4],
}

impl Timers {
    pub fn new() -> Self {
        Timers { counters: Rc::new(RefCell::new([0; 4])), overflow: [false; 4] }
    }

    pub fn reset(&mut self) {
        *self.counters.borrow_mut() = [0; 4];
        self.overflow = [false; 4];
    }

    pub fn cycle(&mut self, bus: &mut Bus, cycle_count: u64) {
        self.overflow = [false; 4];
        for channel in 0..4 {
            let control = bus.io_half(timer_control(channel));
            if control & TIMER_CONTROL_ENABLE == 0 {
                continue;
            }
            let interval = PRESCALER_INTERVALS[(control & 0x3) as usize];
            let count_up = control & TIMER_CONTROL_COUNT_UP != 0;

            let mut counters = self.counters.borrow_mut();
            if count_up && channel > 0 {
                if self.overflow[channel - 1] {
                    counters[channel] += 1;
                }
            } else if cycle_count % interval == 0 {
                counters[channel] += 1;
            }

            if counters[channel] > 0xffff {
                self.overflow[channel] = true;
                counters[channel] = bus.io_half(timer_counter(channel)) as u32;
                drop(counters);
                if control & TIMER_CONTROL_IRQ_ENABLE != 0 {
                    raise_interrupt(bus, IrqBits::timer(channel));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gba::REG_INTERRUPT_REQUEST_FLAGS;

    #[test]
    fn prescaler_divides_the_cycle_count() {
        let mut bus = Bus::new();
        let mut timers = Timers::new();
        // Prescaler 64, enabled.
        bus.set_io_half(timer_control(0), TIMER_CONTROL_ENABLE | 1);
        for cycle in 0..256u64 {
            timers.cycle(&mut bus, cycle);
        }
        assert_eq!(timers.counters.borrow()[0], 4);
    }

    #[test]
    fn overflow_reloads_and_raises_the_flag() {
        let mut bus = Bus::new();
        let mut timers = Timers::new();
        bus.set_io_half(timer_counter(0), 0xfffe);
        bus.set_io_half(timer_control(0), TIMER_CONTROL_ENABLE | TIMER_CONTROL_IRQ_ENABLE);
        timers.counters.borrow_mut()[0] = 0xffff;
        timers.cycle(&mut bus, 0);
        assert_eq!(timers.counters.borrow()[0], 0xfffe);
        assert!(timers.overflow[0]);
        assert_eq!(bus.io_half(REG_INTERRUPT_REQUEST_FLAGS), IrqBits::TIMER0.bits());
    }

    #[test]
    fn count_up_follows_the_previous_channel() {
        let mut bus = Bus::new();
        let mut timers = Timers::new();
        bus.set_io_half(timer_control(0), TIMER_CONTROL_ENABLE);
        bus.set_io_half(timer_control(1), TIMER_CONTROL_ENABLE | TIMER_CONTROL_COUNT_UP);
        timers.counters.borrow_mut()[0] = 0xffff;
        timers.cycle(&mut bus, 0);
        let counters = timers.counters.borrow();
        assert_eq!(counters[0], 0);
        assert_eq!(counters[1], 1);
    }

    #[test]
    fn disabled_timer_does_not_count() {
        let mut bus = Bus::new();
        let mut timers = Timers::new();
        for cycle in 0..64u64 {
            timers.cycle(&mut bus, cycle);
        }
        assert_eq!(timers.counters.borrow()[0], 0);
    }
}
