// Parallel I/O controller (Zilog PIO protocol) plus the board peripherals
// hanging off its pins. Pin listeners are tagged handles: a data write on a
// port produces a list of pin events which the subsystem routes to the I2C
// bus or the UART, and those may drive input pins back synchronously.

use crate::bus::Device;
use crate::i2c::I2cBus;
use crate::uart::Uart;

pub const MODE_OUTPUT: u8 = 0;
pub const MODE_INPUT: u8 = 1;
pub const MODE_BIDIR: u8 = 2;
pub const MODE_BITCTRL: u8 = 3;

pub const DIR_OUTPUT: u8 = 0;
pub const DIR_INPUT: u8 = 1;

pub const PIN_COUNT: usize = 8;

// Port B wiring of the board
pub const B_I2C_SDA_OUT: u8 = 0;
pub const B_I2C_SCL_OUT: u8 = 1;
pub const B_I2C_SDA_IN: u8 = 2;
pub const B_UART_RX: u8 = 3;
pub const B_UART_TX: u8 = 4;
pub const B_KEYBOARD: u8 = 7;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PortId {
    A,
    B,
}

/// Tagged handle naming the peripheral that listens on a pin.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PinHandler {
    I2cScl,
    I2cSda,
    UartTx,
}

/// One pin notification produced by a data write.
#[derive(Clone, Copy, Debug)]
pub struct PinEvent {
    pub port: PortId,
    pub pin: u8,
    pub bit: u8,
    pub changed: bool,
    pub handler: PinHandler,
}

#[derive(Clone, Copy)]
struct LevelListener {
    level: u8,
    handler: PinHandler,
}

pub struct Port {
    id: PortId,
    pub mode: u8,
    pub state: u8,
    pub dir: u8,
    pub int_vector: u8,
    pub int_enable: bool,
    pub int_mask: u8,
    pub and_op: bool,
    pub active_high: bool,
    mask_follows: bool,
    dir_follows: bool,
    listeners: [Option<PinHandler>; PIN_COUNT],
    level_listeners: [Option<LevelListener>; PIN_COUNT],
    irq: Option<u8>,
}

impl Port {
    fn new(id: PortId) -> Port {
        Port {
            id,
            mode: MODE_OUTPUT,
            state: 0xf0,
            dir: 0xff,
            int_vector: 0,
            int_enable: false,
            int_mask: 0,
            and_op: true,
            active_high: false,
            mask_follows: false,
            dir_follows: false,
            listeners: [None; PIN_COUNT],
            level_listeners: [None; PIN_COUNT],
            irq: None,
        }
    }

    pub fn listen(&mut self, pin: u8, handler: PinHandler) {
        if (pin as usize) < PIN_COUNT && self.listeners[pin as usize].is_none() {
            self.listeners[pin as usize] = Some(handler);
        }
    }

    pub fn listen_change(&mut self, pin: u8, level: u8, handler: PinHandler) {
        if (pin as usize) < PIN_COUNT {
            self.level_listeners[pin as usize] = Some(LevelListener { level, handler });
        }
    }

    pub fn unlisten_change(&mut self, pin: u8) {
        if (pin as usize) < PIN_COUNT {
            self.level_listeners[pin as usize] = None;
        }
    }

    fn control_write(&mut self, value: u8) {
        if self.dir_follows {
            self.dir_follows = false;
            self.dir = value;
        } else if self.mask_follows {
            self.mask_follows = false;
            self.int_mask = value;
        } else if value & 0xf == 0xf {
            // Mode select word, the upper two bits carry the mode
            self.mode = (value >> 6) & 0x3;
            self.dir_follows = self.mode == MODE_BITCTRL;
        } else if value & 0xf == 7 {
            // Interrupt control word
            self.mask_follows = value & (1 << 4) != 0;
            self.active_high = value & (1 << 5) != 0;
            self.and_op = value & (1 << 6) != 0;
            self.int_enable = value & (1 << 7) != 0;
            // The PIO manual states that a pending mask resets the
            // interrupt requests; reset the stored mask here
            if self.mask_follows {
                self.int_mask = 0xff;
            }
        } else if value & 0xf == 3 {
            // Interrupt enable flip-flop
            self.int_enable = value & (1 << 7) != 0;
        } else if value & 1 == 0 {
            self.int_vector = value;
        }
    }

    fn data_write(&mut self, value: u8, events: &mut Vec<PinEvent>) {
        if self.mode == MODE_INPUT {
            return;
        }
        let former = self.state;
        if self.mode == MODE_BIDIR || self.mode == MODE_OUTPUT {
            self.state = value;
        } else {
            // Only output pins take the new value; input pins (dir bit 1)
            // keep their state
            let new_out = value & !self.dir;
            self.state = (self.state & self.dir) | new_out;
        }

        for pin in 0..PIN_COUNT as u8 {
            let bit = (self.state >> pin) & 1;
            let former_bit = (former >> pin) & 1;
            let changed = bit != former_bit;
            if (self.dir >> pin) & 1 == DIR_OUTPUT {
                if let Some(handler) = self.listeners[pin as usize] {
                    events.push(PinEvent { port: self.id, pin, bit, changed, handler });
                }
            }
            if changed {
                if let Some(ll) = self.level_listeners[pin as usize] {
                    if ll.level == bit {
                        events.push(PinEvent { port: self.id, pin, bit, changed, handler: ll.handler });
                    }
                }
            }
        }
    }

    /// Whether a device-driven pin change must raise an interrupt when the
    /// port operates in bit-control mode.
    fn bitctrl_interrupt(&self, pin: u8, value: u8) -> bool {
        let active_mask: u8 = if self.active_high { 0xff } else { 0 };
        self.mode == MODE_BITCTRL
            && self.int_mask & (1 << pin) == 0
            && (active_mask & 1) == value
            && (!self.and_op || self.state == active_mask)
    }

    /// Drive an input-direction pin from a device. Generates an interrupt
    /// request when armed.
    pub fn set_pin(&mut self, pin: u8, value: u8) {
        let previous = self.state;
        if value == 0 {
            self.state &= !(1 << pin);
        } else {
            self.state |= 1 << pin;
        }
        let changed = previous != self.state;

        if self.int_enable
            && changed
            && self.mode != MODE_OUTPUT
            && (self.mode != MODE_BITCTRL || self.bitctrl_interrupt(pin, value))
        {
            self.irq = Some(self.int_vector);
        }
    }

    pub fn get_pin(&self, pin: u8) -> u8 {
        (self.state >> pin) & 1
    }

    pub fn take_irq(&mut self) -> Option<u8> {
        self.irq.take()
    }
}

/// The PIO chip itself: two ports, register layout A-data/B-data/A-ctrl/B-ctrl.
pub struct Pio {
    pub port_a: Port,
    pub port_b: Port,
}

impl Pio {
    pub fn new() -> Pio {
        Pio { port_a: Port::new(PortId::A), port_b: Port::new(PortId::B) }
    }

    pub fn io_read(&mut self, addr: u16) -> u8 {
        let port = if addr & 1 == 0 { &self.port_a } else { &self.port_b };
        if addr & 2 != 0 {
            // Any control-byte read returns the chip identifier
            0x43
        } else {
            port.state
        }
    }

    pub fn io_write(&mut self, addr: u16, value: u8) -> Vec<PinEvent> {
        let port = if addr & 1 == 0 { &mut self.port_a } else { &mut self.port_b };
        let mut events = Vec::new();
        if addr & 2 != 0 {
            port.control_write(value);
        } else {
            port.data_write(value, &mut events);
        }
        events
    }
}

/// The PIO plus everything wired to its pins. Owning the I2C bus and the
/// UART here keeps the listener calls plain method calls: a port write can
/// reach a slave, and the slave can drive SDA-in back, without any shared
/// mutable state.
pub struct PioSubsystem {
    pub pio: Pio,
    pub i2c: I2cBus,
    uart: Uart,
}

impl PioSubsystem {
    pub fn new(i2c: I2cBus) -> PioSubsystem {
        let mut pio = Pio::new();
        pio.port_b.listen(B_I2C_SCL_OUT, PinHandler::I2cScl);
        pio.port_b.listen(B_I2C_SDA_OUT, PinHandler::I2cSda);
        pio.port_b.listen(B_UART_TX, PinHandler::UartTx);
        // Idle levels of the wired-or lines
        pio.port_b.set_pin(B_I2C_SCL_OUT, 1);
        pio.port_b.set_pin(B_I2C_SDA_OUT, 1);
        pio.port_b.set_pin(B_UART_RX, 1);
        pio.port_b.set_pin(B_KEYBOARD, 1);
        PioSubsystem { pio, i2c, uart: Uart::new() }
    }

    fn dispatch(&mut self, events: Vec<PinEvent>) {
        for ev in events {
            match ev.handler {
                PinHandler::I2cScl => self.i2c.scl_written(&mut self.pio.port_b, ev.bit, ev.changed),
                PinHandler::I2cSda => self.i2c.sda_written(&mut self.pio.port_b, ev.bit, ev.changed),
                PinHandler::UartTx => self.uart.tx_bit(ev.bit),
            }
        }
    }

    /// Drive a port B input pin from a device (keyboard clock line).
    pub fn set_b_pin(&mut self, pin: u8, value: u8) {
        self.pio.port_b.set_pin(pin, value);
    }

    pub fn get_b_pin(&self, pin: u8) -> u8 {
        self.pio.port_b.get_pin(pin)
    }

    /// Pending interrupt vector from either port, if any.
    pub fn take_interrupt(&mut self) -> Option<u8> {
        self.pio.port_a.take_irq().or_else(|| self.pio.port_b.take_irq())
    }
}

impl Device for PioSubsystem {
    fn name(&self) -> &'static str {
        "pio_dev"
    }

    fn io_size(&self) -> u16 {
        0x10
    }

    fn io_read(&mut self, addr: u16) -> u8 {
        self.pio.io_read(addr)
    }

    fn io_write(&mut self, addr: u16, value: u8) {
        let events = self.pio.io_write(addr, value);
        self.dispatch(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_read_returns_identifier() {
        let mut pio = Pio::new();
        assert_eq!(pio.io_read(2), 0x43);
        assert_eq!(pio.io_read(3), 0x43);
    }

    #[test]
    fn bitctrl_keeps_input_pins() {
        let mut pio = Pio::new();
        // Bit-control mode, direction follows: pins 4..7 inputs
        pio.io_write(3, 0b11_00_1111);
        pio.io_write(3, 0xf0);
        pio.port_b.set_pin(7, 1);
        pio.io_write(1, 0x00);
        // Output pins cleared, input pin 7 untouched
        assert_eq!(pio.port_b.get_pin(7), 1);
        assert_eq!(pio.port_b.state & 0x0f, 0);
    }

    #[test]
    fn level_listener_fires_on_configured_transition_only() {
        let mut port = Port::new(PortId::A);
        port.mode = MODE_OUTPUT;
        port.state = 0;
        port.listen_change(3, 1, PinHandler::UartTx);

        let mut events = Vec::new();
        port.data_write(0x08, &mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pin, 3);

        // Falling edge does not match the armed level
        events.clear();
        port.data_write(0x00, &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn bitctrl_interrupt_generation() {
        let mut port = Port::new(PortId::B);
        port.state = 0;
        // Mode select: bit-control, then all pins inputs
        port.control_write(0b11_00_1111);
        port.control_write(0xff);
        // Interrupt control word: enable, OR, active high, mask follows
        port.control_write(0b1011_0111);
        // Monitor pin 7 only
        port.control_write(!(1 << 7));
        port.int_vector = 0x42;

        port.set_pin(7, 1);
        assert_eq!(port.take_irq(), Some(port.int_vector));
        // Already high, no change, no new request
        port.set_pin(7, 1);
        assert_eq!(port.take_irq(), None);
    }
}
