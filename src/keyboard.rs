// PS/2 keyboard. Host key events become scan-code sequences (set 2,
// including 0xE0-extended codes and the PAUSE multi-byte sequence) queued
// in a FIFO. A three-phase state machine paces each byte out against the
// PIO pin the guest watches: assert the line for ~19.7us, then hold off
// ~3.9ms before the next byte. A coarse timer tells the host loop when to
// poll for input, and the host-side tracker implements key auto-repeat.

use crate::bus::Device;
use crate::pio::{PioSubsystem, B_KEYBOARD};
use crate::us_to_tstates;
use minifb::Key;
use std::collections::{HashMap, VecDeque};

const FIFO_SIZE: usize = 512;
const BREAK_CODE: u8 = 0xF0;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Ps2State {
    Idle,
    Active,
    Inactive,
}

pub struct Keyboard {
    queue: VecDeque<u8>,
    shift_register: u8,
    pin_state: u8,
    state: Ps2State,
    elapsed_tstates: u64,
    check_timer: u64,
    /// T-states the active pulse lasts (~19.7us on hardware).
    scancode_duration: u64,
    /// T-states between two scancodes (~3.9ms).
    key_timing: u64,
    /// Host input poll period (~15ms).
    check_period: u64,
}

impl Keyboard {
    pub fn new() -> Keyboard {
        Keyboard {
            queue: VecDeque::with_capacity(FIFO_SIZE),
            shift_register: 0,
            pin_state: 1,
            state: Ps2State::Idle,
            elapsed_tstates: 0,
            check_timer: 0,
            scancode_duration: us_to_tstates(19.7),
            key_timing: us_to_tstates(3900.0),
            check_period: us_to_tstates(15000.0),
        }
    }

    fn push(&mut self, byte: u8) {
        if self.queue.len() < FIFO_SIZE {
            self.queue.push_back(byte);
        }
    }

    /// Advance the host-poll timer; true when it is time to read the host
    /// keyboard again.
    pub fn check(&mut self, elapsed: u64) -> bool {
        self.check_timer += elapsed;
        if self.check_timer >= self.check_period {
            self.check_timer = 0;
            return true;
        }
        false
    }

    /// Advance the shift-out state machine against the PIO pin.
    pub fn tick(&mut self, pio: &mut PioSubsystem, elapsed: u64) {
        self.elapsed_tstates += elapsed;

        match self.state {
            Ps2State::Idle => {
                if let Some(code) = self.queue.pop_front() {
                    self.shift_register = code;
                    self.pin_state = 0;
                    pio.set_b_pin(B_KEYBOARD, self.pin_state);
                    self.elapsed_tstates = 0;
                    self.state = Ps2State::Active;
                }
            }
            Ps2State::Active => {
                if self.elapsed_tstates >= self.scancode_duration {
                    self.pin_state = 1;
                    pio.set_b_pin(B_KEYBOARD, self.pin_state);
                    self.elapsed_tstates = 0;
                    self.state = Ps2State::Inactive;
                }
            }
            Ps2State::Inactive => {
                // The line needs some time before accepting new codes
                if self.elapsed_tstates >= self.key_timing {
                    self.pin_state = 1;
                    pio.set_b_pin(B_KEYBOARD, self.pin_state);
                    self.elapsed_tstates = 0;
                    self.state = Ps2State::Idle;
                }
            }
        }
    }

    pub fn key_pressed(&mut self, key: Key) {
        let mut codes = [0u8; 8];
        let n = ps2_sequence(key, &mut codes);
        for code in &codes[..n] {
            self.push(*code);
        }
    }

    pub fn key_released(&mut self, key: Key) {
        // PAUSE has no break code
        if key == Key::Pause {
            return;
        }
        let mut codes = [0u8; 8];
        let n = ps2_sequence(key, &mut codes);
        if n == 0 {
            return;
        }
        // Extended codes send E0 before the break code
        let mut from = 0;
        if codes[0] == 0xE0 {
            self.push(codes[0]);
            from = 1;
        }
        self.push(BREAK_CODE);
        for code in &codes[from..n] {
            self.push(*code);
        }
    }

    #[cfg(test)]
    pub fn queued(&self) -> Vec<u8> {
        self.queue.iter().copied().collect()
    }
}

impl Device for Keyboard {
    fn name(&self) -> &'static str {
        "keyboard_dev"
    }

    fn io_size(&self) -> u16 {
        0x10
    }

    fn io_read(&mut self, _addr: u16) -> u8 {
        self.shift_register
    }
}

/// Build the PS/2 sequence for a host key; returns the number of bytes.
fn ps2_sequence(key: Key, codes: &mut [u8; 8]) -> usize {
    if key == Key::Pause {
        codes.copy_from_slice(&[0xE1, 0x14, 0x77, 0xE1, 0xF0, 0x14, 0xE0, 0x77]);
        return 8;
    }
    let code = scan_code(key);
    if code == 0 {
        return 0;
    }
    if code > 0xFF {
        codes[0] = (code >> 8) as u8;
        codes[1] = (code & 0xFF) as u8;
        2
    } else {
        codes[0] = code as u8;
        1
    }
}

/// Scan-code set 2 table; extended codes carry the 0xE0 prefix in the
/// upper byte.
fn scan_code(key: Key) -> u16 {
    match key {
        Key::Backspace => 0x66,
        Key::Tab => 0x0D,
        Key::Enter => 0x5A,
        Key::LeftShift => 0x12,
        Key::RightShift => 0x59,
        Key::LeftCtrl => 0xE014,
        Key::RightCtrl => 0xE014,
        Key::LeftAlt => 0x11,
        Key::RightAlt => 0xE011,
        Key::CapsLock => 0x58,
        Key::Escape => 0x76,
        Key::PageUp => 0xE07D,
        Key::Space => 0x29,
        Key::PageDown => 0xE07A,
        Key::End => 0xE069,
        Key::Home => 0xE06C,
        Key::Left => 0xE06B,
        Key::Up => 0xE075,
        Key::Right => 0xE074,
        Key::Down => 0xE072,
        Key::Insert => 0xE070,
        Key::Delete => 0xE071,
        Key::Key0 => 0x45,
        Key::Key1 => 0x16,
        Key::Key2 => 0x1E,
        Key::Key3 => 0x26,
        Key::Key4 => 0x25,
        Key::Key5 => 0x2E,
        Key::Key6 => 0x36,
        Key::Key7 => 0x3D,
        Key::Key8 => 0x3E,
        Key::Key9 => 0x46,
        Key::A => 0x1C,
        Key::B => 0x32,
        Key::C => 0x21,
        Key::D => 0x23,
        Key::E => 0x24,
        Key::F => 0x2B,
        Key::G => 0x34,
        Key::H => 0x33,
        Key::I => 0x43,
        Key::J => 0x3B,
        Key::K => 0x42,
        Key::L => 0x4B,
        Key::M => 0x3A,
        Key::N => 0x31,
        Key::O => 0x44,
        Key::P => 0x4D,
        Key::Q => 0x15,
        Key::R => 0x2D,
        Key::S => 0x1B,
        Key::T => 0x2C,
        Key::U => 0x3C,
        Key::V => 0x2A,
        Key::W => 0x1D,
        Key::X => 0x22,
        Key::Y => 0x35,
        Key::Z => 0x1A,
        Key::LeftSuper => 0xE01F,
        Key::RightSuper => 0xE027,
        Key::NumPad0 => 0x70,
        Key::NumPad1 => 0x69,
        Key::NumPad2 => 0x72,
        Key::NumPad3 => 0x7A,
        Key::NumPad4 => 0x6B,
        Key::NumPad5 => 0x73,
        Key::NumPad6 => 0x74,
        Key::NumPad7 => 0x6C,
        Key::NumPad8 => 0x75,
        Key::NumPad9 => 0x7D,
        Key::NumPadAsterisk => 0x7C,
        Key::NumPadPlus => 0x79,
        Key::NumPadMinus => 0x7B,
        Key::NumPadDot => 0x71,
        Key::NumPadSlash => 0xE04A,
        Key::F1 => 0x05,
        Key::F2 => 0x06,
        Key::F3 => 0x04,
        Key::F4 => 0x0C,
        Key::F5 => 0x03,
        Key::F6 => 0x0B,
        Key::F7 => 0x83,
        Key::F8 => 0x0A,
        Key::F9 => 0x01,
        Key::F10 => 0x09,
        Key::F11 => 0x78,
        Key::F12 => 0x07,
        Key::NumLock => 0x77,
        Key::ScrollLock => 0x7E,
        Key::Semicolon => 0x4C,
        Key::Equal => 0x55,
        Key::Comma => 0x41,
        Key::Minus => 0x4E,
        Key::Period => 0x49,
        Key::Slash => 0x4A,
        Key::LeftBracket => 0x54,
        Key::Backslash => 0x5D,
        Key::RightBracket => 0x5B,
        Key::Apostrophe => 0x52,
        Key::Backquote => 0x0E,
        _ => 0,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HostKeyState {
    Pressed,
    Repeated,
}

/// Host-side key tracker: generates press, release and auto-repeat events
/// out of the polled key list. The first repeat fires after ~500ms held,
/// the following ones every ~50ms; modifiers never repeat.
pub struct HostKeys {
    states: HashMap<Key, (HostKeyState, u64)>,
    start_delay: u64,
    repeat_delay: u64,
}

impl HostKeys {
    pub fn new() -> HostKeys {
        HostKeys {
            states: HashMap::new(),
            start_delay: us_to_tstates(500_000.0),
            repeat_delay: us_to_tstates(50_000.0),
        }
    }

    pub fn reset(&mut self) {
        self.states.clear();
    }

    fn can_repeat(key: Key) -> bool {
        !matches!(
            key,
            Key::LeftShift
                | Key::RightShift
                | Key::LeftCtrl
                | Key::RightCtrl
                | Key::LeftAlt
                | Key::RightAlt
                | Key::LeftSuper
                | Key::RightSuper
                | Key::CapsLock
                | Key::NumLock
        )
    }

    /// Feed the currently-down host keys; `delta` is the elapsed T-states
    /// since the previous poll.
    pub fn update(&mut self, keyboard: &mut Keyboard, down: &[Key], delta: u64) {
        // Newly pressed keys
        for key in down {
            if !self.states.contains_key(key) {
                self.states.insert(*key, (HostKeyState::Pressed, 0));
                keyboard.key_pressed(*key);
            }
        }

        // Released keys, and repeats for those still held
        let held: Vec<Key> = self.states.keys().copied().collect();
        for key in held {
            if !down.contains(&key) {
                self.states.remove(&key);
                keyboard.key_released(key);
                continue;
            }
            let (state, duration) = self.states.get_mut(&key).unwrap();
            *duration += delta;
            match state {
                HostKeyState::Pressed if Self::can_repeat(key) && *duration >= self.start_delay => {
                    *state = HostKeyState::Repeated;
                    *duration = 0;
                    keyboard.key_pressed(key);
                }
                HostKeyState::Repeated if *duration >= self.repeat_delay => {
                    *duration = 0;
                    keyboard.key_pressed(key);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i2c::I2cBus;

    #[test]
    fn release_emits_break_sequence() {
        let mut kb = Keyboard::new();
        kb.key_released(Key::A);
        assert_eq!(kb.queued(), vec![0xF0, 0x1C]);
    }

    #[test]
    fn extended_release_keeps_prefix_first() {
        let mut kb = Keyboard::new();
        kb.key_released(Key::Up);
        assert_eq!(kb.queued(), vec![0xE0, 0xF0, 0x75]);
    }

    #[test]
    fn pause_sequence_has_no_break() {
        let mut kb = Keyboard::new();
        kb.key_pressed(Key::Pause);
        assert_eq!(kb.queued().len(), 8);
        kb.key_released(Key::Pause);
        assert_eq!(kb.queued().len(), 8);
    }

    #[test]
    fn host_key_repeat_pacing() {
        let mut kb = Keyboard::new();
        let mut host = HostKeys::new();

        host.update(&mut kb, &[Key::A], 0);
        assert_eq!(kb.queued().len(), 1);

        // Held below the start delay: no repeat yet
        host.update(&mut kb, &[Key::A], us_to_tstates(499_000.0));
        assert_eq!(kb.queued().len(), 1);
        // Crossing ~500ms fires the first repeat
        host.update(&mut kb, &[Key::A], us_to_tstates(2_000.0));
        assert_eq!(kb.queued().len(), 2);
        // Then one repeat per ~50ms
        host.update(&mut kb, &[Key::A], us_to_tstates(50_000.0));
        assert_eq!(kb.queued().len(), 3);

        // Releasing queues the break sequence
        host.update(&mut kb, &[], 0);
        assert_eq!(kb.queued().len(), 5);
    }

    #[test]
    fn modifiers_do_not_repeat() {
        let mut kb = Keyboard::new();
        let mut host = HostKeys::new();
        host.update(&mut kb, &[Key::LeftShift], 0);
        host.update(&mut kb, &[Key::LeftShift], us_to_tstates(2_000_000.0));
        assert_eq!(kb.queued().len(), 1);
    }

    #[test]
    fn shift_out_phases() {
        let mut pio = PioSubsystem::new(I2cBus::new());
        let mut kb = Keyboard::new();
        kb.key_pressed(Key::A);

        // Idle -> Active: line goes low and the code is latched
        kb.tick(&mut pio, 1);
        assert_eq!(pio.get_b_pin(B_KEYBOARD), 0);
        assert_eq!(kb.io_read(0), 0x1C);

        // Active pulse elapses: line back high
        kb.tick(&mut pio, kb.scancode_duration);
        assert_eq!(pio.get_b_pin(B_KEYBOARD), 1);
        assert_eq!(kb.state, Ps2State::Inactive);

        // Hold-off elapses: ready for the next code
        kb.tick(&mut pio, kb.key_timing);
        assert_eq!(kb.state, Ps2State::Idle);
    }
}
