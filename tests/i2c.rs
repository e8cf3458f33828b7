// Drives the I2C bus the way the guest does: bit-banging SCL and SDA
// through the PIO port B data register and sampling SDA-in between clock
// edges.

use emz80::bus::Device;
use emz80::eeprom::{Eeprom, EEPROM_ADDR};
use emz80::i2c::I2cBus;
use emz80::pio::PioSubsystem;

const PORT_B_DATA: u16 = 1;
const PORT_B_CTRL: u16 = 3;

const SDA: u8 = 1 << 0;
const SCL: u8 = 1 << 1;
const SDA_IN: u8 = 2;

struct Master {
    pio: PioSubsystem,
    sda: bool,
}

impl Master {
    fn new() -> Master {
        let mut i2c = I2cBus::new();
        i2c.connect(Box::new(Eeprom::new(None)));
        let mut pio = PioSubsystem::new(i2c);
        // Bit-control mode; SDA and SCL are outputs, the rest inputs
        pio.io_write(PORT_B_CTRL, 0xCF);
        pio.io_write(PORT_B_CTRL, !(SDA | SCL));
        let mut master = Master { pio, sda: true };
        master.lines(true, true);
        master
    }

    fn lines(&mut self, sda: bool, scl: bool) {
        self.sda = sda;
        let value = if sda { SDA } else { 0 } | if scl { SCL } else { 0 };
        self.pio.io_write(PORT_B_DATA, value);
    }

    fn start(&mut self) {
        self.lines(true, true);
        self.lines(false, true);
        self.lines(false, false);
    }

    fn stop(&mut self) {
        self.lines(false, false);
        self.lines(false, true);
        self.lines(true, true);
    }

    /// Clock one byte out and consume the ACK cycle; returns the ACK level.
    fn write_byte(&mut self, byte: u8) -> u8 {
        for bit in (0..8).rev() {
            let sda = byte & (1 << bit) != 0;
            self.lines(self.sda, false);
            self.lines(sda, false);
            self.lines(sda, true);
        }
        // ACK cycle: the slave drives SDA-in
        self.lines(self.sda, false);
        self.lines(self.sda, true);
        let ack = self.pio.get_b_pin(SDA_IN);
        ack
    }

    /// Clock one byte in, then drive the ACK cycle.
    fn read_byte(&mut self) -> u8 {
        let mut byte = 0u8;
        for _ in 0..8 {
            self.lines(self.sda, false);
            self.lines(self.sda, true);
            byte = (byte << 1) | self.pio.get_b_pin(SDA_IN);
        }
        self.lines(self.sda, false);
        self.lines(self.sda, true);
        byte
    }
}

#[test]
fn eeprom_round_trip() {
    let mut master = Master::new();

    // Write three bytes at 0x0010
    master.start();
    assert_eq!(master.write_byte(EEPROM_ADDR << 1), 0);
    master.write_byte(0x00);
    master.write_byte(0x10);
    for byte in [0xDE, 0xAD, 0xBE] {
        master.write_byte(byte);
    }
    master.stop();

    // Point the address back at 0x0010
    master.start();
    master.write_byte(EEPROM_ADDR << 1);
    master.write_byte(0x00);
    master.write_byte(0x10);
    master.stop();

    // Read them back
    master.start();
    assert_eq!(master.write_byte((EEPROM_ADDR << 1) | 1), 0);
    assert_eq!(master.read_byte(), 0xDE);
    assert_eq!(master.read_byte(), 0xAD);
    assert_eq!(master.read_byte(), 0xBE);
    master.stop();
}

#[test]
fn missing_device_nacks() {
    let mut master = Master::new();
    master.start();
    // No device at address 0x23
    assert_eq!(master.write_byte(0x23 << 1), 1);
    master.stop();
}
