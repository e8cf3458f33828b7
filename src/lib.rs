// Emulator for a Z80-based 8-bit retrocomputer: paged MMU, NOR flash,
// SRAM, video/audio/DMA coprocessor, PIO-multiplexed buses (I2C, keyboard,
// UART), CompactFlash and a host-filesystem bridge. The CPU core comes
// from the iz80 crate; everything behind its memory and port callbacks is
// implemented here.

pub mod bus;
pub mod compactflash;
pub mod config;
pub mod debugger;
pub mod disasm;
pub mod eeprom;
pub mod flash;
pub mod gdb;
pub mod hostfs;
pub mod i2c;
pub mod keyboard;
pub mod machine;
pub mod mmu;
pub mod pio;
pub mod ram;
pub mod rtc;
pub mod uart;
pub mod vpu;

pub use machine::{Machine, MachineConfig, MachineError};

/// CPU clock of the board.
pub const CPU_FREQ_HZ: u64 = 10_000_000;

/// Convert a duration in microseconds into CPU T-states.
pub fn us_to_tstates(us: f64) -> u64 {
    (us * (CPU_FREQ_HZ as f64 / 1_000_000.0)) as u64
}
