// I2C bus recovered from two PIO output pins. The bus watches SCL/SDA
// edges, detects START/STOP conditions, shifts bytes in both directions
// and drives ACK/NACK and read data back on the SDA-in pin. Slaves hang
// off a small trait with start/read/write/stop callbacks.

use crate::pio::{Port, B_I2C_SDA_IN, B_I2C_SDA_OUT, B_I2C_SCL_OUT};

const ACK: u8 = 0;
const NACK: u8 = 1;

pub trait I2cDevice {
    /// 7-bit address of the device.
    fn address(&self) -> u8;
    fn start(&mut self) {}
    fn read(&mut self) -> u8 {
        0xff
    }
    fn write(&mut self, _data: u8) {}
    fn stop(&mut self) {}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BusState {
    Idle,
    StartReceived,
    AddrReceived,
    RestartReceived,
    ReaddrReceived,
}

pub struct I2cBus {
    cur_bit: u32,
    cur_byte: u8,
    dev_addr: u8,
    /// True while shifting data out to the master.
    output: bool,
    /// True while the ACK/NACK cycle of the last byte is on the wire.
    has_reply: bool,
    st: BusState,
    devices: Vec<Box<dyn I2cDevice>>,
}

impl I2cBus {
    pub fn new() -> I2cBus {
        I2cBus {
            cur_bit: 0,
            cur_byte: 0,
            dev_addr: 0,
            output: false,
            has_reply: false,
            st: BusState::Idle,
            devices: Vec::new(),
        }
    }

    /// Connect a slave on the bus.
    pub fn connect(&mut self, device: Box<dyn I2cDevice>) -> bool {
        let addr = device.address();
        if addr >= 0x80 {
            log::error!("[I2C] cannot connect device 0x{:x}: invalid address", addr);
            return false;
        }
        if self.devices.iter().any(|d| d.address() == addr) {
            log::error!("[I2C] two devices connected to address 0x{:x}", addr);
            return false;
        }
        self.devices.push(device);
        true
    }

    fn is_read(&self) -> bool {
        self.dev_addr & 1 == 1
    }

    fn cur_device(&mut self) -> Option<&mut Box<dyn I2cDevice>> {
        let addr = self.dev_addr >> 1;
        self.devices.iter_mut().find(|d| d.address() == addr)
    }

    fn clear_data(&mut self) {
        self.cur_bit = 0;
        self.cur_byte = 0;
        self.dev_addr = 0;
        self.output = false;
        self.has_reply = false;
    }

    /// A full byte crossed the bus; returns the ACK level and, for read
    /// transactions, the next byte to shift out.
    fn process_byte(&mut self, data: u8) -> (u8, u8) {
        match self.st {
            BusState::Idle => {
                log::warn!("[I2C] received a byte without start");
                (NACK, 0)
            }
            BusState::StartReceived | BusState::RestartReceived => {
                self.st = if self.st == BusState::StartReceived {
                    BusState::AddrReceived
                } else {
                    BusState::ReaddrReceived
                };
                self.dev_addr = data;
                self.output = self.is_read();
                let is_read = self.is_read();
                match self.cur_device() {
                    None => {
                        log::info!("[I2C] no device found at address 0x{:x}", data);
                        (NACK, 0)
                    }
                    Some(dev) => {
                        dev.start();
                        // A read transaction outputs its first byte right away
                        let next = if is_read { dev.read() } else { 0 };
                        (ACK, next)
                    }
                }
            }
            BusState::AddrReceived | BusState::ReaddrReceived => {
                let is_read = self.is_read();
                if let Some(dev) = self.cur_device() {
                    if is_read {
                        return (ACK, dev.read());
                    }
                    dev.write(data);
                }
                (ACK, 0)
            }
        }
    }

    /// SCL pin written by the master.
    pub fn scl_written(&mut self, port: &mut Port, bit: u8, transition: bool) {
        if !transition {
            return;
        }

        // Skip the ACK/NACK clock cycle of the previous byte
        if self.has_reply {
            if bit == 0 {
                // Reply being set up
                return;
            }
            self.has_reply = false;
            return;
        }

        if self.output {
            self.output_mode(port, bit);
        } else {
            self.input_mode(port, bit);
        }
    }

    /// Master is reading: shift the current byte out on SDA-in.
    fn output_mode(&mut self, port: &mut Port, scl: u8) {
        if scl == 0 {
            let next_bit = if self.cur_byte & 0x80 != 0 { 1 } else { 0 };
            port.set_pin(B_I2C_SDA_IN, next_bit);
            self.cur_byte <<= 1;
            self.cur_bit += 1;
        } else if self.cur_bit == 8 {
            self.cur_bit = 0;
            let (_ack, next) = self.process_byte(0);
            self.cur_byte = next;
            self.has_reply = true;
        }
    }

    /// Master is writing: sample SDA on the rising clock edge.
    fn input_mode(&mut self, port: &mut Port, scl: u8) {
        if scl == 0 {
            return;
        }
        let sda = port.get_pin(B_I2C_SDA_OUT);
        self.cur_byte = (self.cur_byte << 1) | sda;
        self.cur_bit += 1;
        if self.cur_bit == 8 {
            self.cur_bit = 0;
            let byte = self.cur_byte;
            let (ack, next) = self.process_byte(byte);
            self.cur_byte = next;
            port.set_pin(B_I2C_SDA_IN, ack);
            self.has_reply = true;
        }
    }

    /// SDA pin written by the master; only START and STOP matter here.
    pub fn sda_written(&mut self, port: &mut Port, bit: u8, transition: bool) {
        let scl = port.get_pin(B_I2C_SCL_OUT);
        if !transition || scl == 0 {
            return;
        }

        if bit == 0 {
            // START: SDA falling while SCL is high
            match self.st {
                BusState::Idle => self.st = BusState::StartReceived,
                BusState::AddrReceived => {
                    self.clear_data();
                    self.st = BusState::RestartReceived;
                }
                _ => {
                    log::info!("[I2C] invalid protocol detected");
                    self.st = BusState::StartReceived;
                }
            }
        } else {
            // STOP: SDA rising while SCL is high
            if let Some(dev) = self.cur_device() {
                dev.stop();
            }
            self.st = BusState::Idle;
            self.clear_data();
        }
    }
}
