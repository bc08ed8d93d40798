/*
 * 8254 Programmable Interval Timer
 *
 * Channel 0 drives IRQ 0 at the scheduler's tick rate.
 */

use x86::io::outb;

const PIT_CH0: u16 = 0x40;
const PIT_CMD: u16 = 0x43;

/// Input clock of the PIT in Hz.
const PIT_HZ: u32 = 1_193_180;

/// Rate-generator mode on channel 0, lobyte/hibyte access.
const MODE_RATE: u8 = 0x34;

pub fn init(frequency: u32) {
    let divisor = (PIT_HZ / frequency).clamp(1, 65535) as u16;
    unsafe {
        outb(PIT_CMD, MODE_RATE);
        outb(PIT_CH0, (divisor & 0xff) as u8);
        outb(PIT_CH0, (divisor >> 8) as u8);
    }
    log::info!("PIT: {} Hz (divisor {})", frequency, divisor);
}
