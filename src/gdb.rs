// GDB remote-serial-protocol glue: a minimal TCP server mapping the
// generic debugger operations (registers, memory, continue, step,
// breakpoints) onto the machine. One client at a time; `continue` polls
// the socket for the interrupt byte while the machine runs.

use crate::debugger::{Watchpoint, WATCHPOINT_READ, WATCHPOINT_WRITE};
use crate::machine::Machine;
use iz80::Reg16;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

pub struct GdbServer {
    listener: TcpListener,
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

impl GdbServer {
    pub fn bind(port: u16) -> std::io::Result<GdbServer> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        log::info!("[GDB] waiting for a client on port {}", port);
        Ok(GdbServer { listener })
    }

    /// Accept one client and serve it until detach, kill or disconnect.
    pub fn serve(&self, machine: &mut Machine) -> std::io::Result<()> {
        let (stream, peer) = self.listener.accept()?;
        log::info!("[GDB] client connected from {}", peer);
        let mut session = Session { stream, machine };
        session.run()
    }
}

struct Session<'a> {
    stream: TcpStream,
    machine: &'a mut Machine,
}

impl Session<'_> {
    fn run(&mut self) -> std::io::Result<()> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            let n = self.stream.read(&mut byte)?;
            if n == 0 {
                return Ok(());
            }
            match byte[0] {
                b'$' => {
                    buf.clear();
                    let mut sum = [0u8; 2];
                    loop {
                        self.stream.read_exact(&mut byte)?;
                        if byte[0] == b'#' {
                            break;
                        }
                        buf.push(byte[0]);
                    }
                    self.stream.read_exact(&mut sum)?;
                    // Ack, then dispatch
                    self.stream.write_all(b"+")?;
                    let packet = String::from_utf8_lossy(&buf).to_string();
                    if !self.dispatch(&packet)? {
                        return Ok(());
                    }
                }
                // Acks from the client and stray interrupts are ignored here
                b'+' | b'-' | 0x03 => {}
                _ => {}
            }
        }
    }

    fn reply(&mut self, data: &str) -> std::io::Result<()> {
        let packet = format!("${}#{:02x}", data, checksum(data.as_bytes()));
        self.stream.write_all(packet.as_bytes())
    }

    /// Handle one packet; false ends the session.
    fn dispatch(&mut self, packet: &str) -> std::io::Result<bool> {
        match packet.chars().next() {
            Some('q') => {
                if packet.starts_with("qSupported") {
                    self.reply("PacketSize=4000")?;
                } else {
                    self.reply("")?;
                }
            }
            Some('?') => self.reply("S05")?,
            Some('g') => {
                let regs = self.read_registers();
                self.reply(&regs)?;
            }
            Some('G') => {
                self.write_registers(&packet[1..]);
                self.reply("OK")?;
            }
            Some('m') => {
                let response = self.read_memory(&packet[1..]);
                self.reply(&response)?;
            }
            Some('M') => {
                if self.write_memory(&packet[1..]) {
                    self.reply("OK")?;
                } else {
                    self.reply("E01")?;
                }
            }
            Some('s') => {
                self.machine.step();
                self.reply("S05")?;
            }
            Some('c') => {
                self.cont()?;
                self.reply("S05")?;
            }
            Some('Z') | Some('z') => {
                let set = packet.starts_with('Z');
                if self.breakpoint(&packet[1..], set) {
                    self.reply("OK")?;
                } else {
                    self.reply("E01")?;
                }
            }
            Some('D') => {
                self.reply("OK")?;
                return Ok(false);
            }
            Some('k') => {
                self.machine.request_exit();
                return Ok(false);
            }
            _ => self.reply("")?,
        }
        Ok(true)
    }

    /// The z80 register file in the layout gdb expects: af, bc, de, hl,
    /// sp, pc, ix, iy, then the shadow bank and ir (not exposed by the CPU
    /// core, reported as zero). 16-bit little-endian each.
    fn read_registers(&mut self) -> String {
        let pc = self.machine.pc();
        let regs = self.machine.registers();
        let values = [
            regs.get16(Reg16::AF),
            regs.get16(Reg16::BC),
            regs.get16(Reg16::DE),
            regs.get16(Reg16::HL),
            regs.get16(Reg16::SP),
            pc,
            regs.get16(Reg16::IX),
            regs.get16(Reg16::IY),
            0,
            0,
            0,
            0,
            0,
        ];
        let mut out = String::new();
        for value in values {
            out.push_str(&format!("{:02x}{:02x}", value & 0xff, value >> 8));
        }
        out
    }

    fn write_registers(&mut self, data: &str) {
        let pairs = [Reg16::AF, Reg16::BC, Reg16::DE, Reg16::HL, Reg16::SP];
        let word = |i: usize| -> Option<u16> {
            let lo = u8::from_str_radix(data.get(i * 4..i * 4 + 2)?, 16).ok()?;
            let hi = u8::from_str_radix(data.get(i * 4 + 2..i * 4 + 4)?, 16).ok()?;
            Some((hi as u16) << 8 | lo as u16)
        };
        for (i, reg) in pairs.iter().enumerate() {
            if let Some(value) = word(i) {
                self.machine.registers().set16(*reg, value);
            }
        }
        if let Some(pc) = word(5) {
            self.machine.set_pc(pc);
        }
        if let Some(ix) = word(6) {
            self.machine.registers().set16(Reg16::IX, ix);
        }
        if let Some(iy) = word(7) {
            self.machine.registers().set16(Reg16::IY, iy);
        }
    }

    fn read_memory(&mut self, args: &str) -> String {
        let (addr, len) = match parse_addr_len(args, ',') {
            Some(v) => v,
            None => return "E01".to_string(),
        };
        let mut out = String::new();
        for i in 0..len {
            out.push_str(&format!("{:02x}", self.machine.debug_mem_read(addr.wrapping_add(i as u16))));
        }
        out
    }

    fn write_memory(&mut self, args: &str) -> bool {
        let (head, data) = match args.split_once(':') {
            Some(v) => v,
            None => return false,
        };
        let (addr, len) = match parse_addr_len(head, ',') {
            Some(v) => v,
            None => return false,
        };
        for i in 0..len {
            let byte = match data.get(i * 2..i * 2 + 2).and_then(|h| u8::from_str_radix(h, 16).ok()) {
                Some(b) => b,
                None => return false,
            };
            self.machine.mem_write(addr.wrapping_add(i as u16), byte);
        }
        true
    }

    fn breakpoint(&mut self, args: &str, set: bool) -> bool {
        let mut parts = args.split(',');
        let kind = parts.next().unwrap_or("");
        let addr = match parts.next().and_then(|a| u16::from_str_radix(a, 16).ok()) {
            Some(addr) => addr,
            None => return false,
        };
        match kind {
            // Software and hardware breakpoints share the table
            "0" | "1" => {
                if set {
                    self.machine.debugger.set_breakpoint(addr)
                } else {
                    self.machine.debugger.clear_breakpoint(addr)
                }
            }
            "2" => self.watchpoint(addr, WATCHPOINT_WRITE, set),
            "3" => self.watchpoint(addr, WATCHPOINT_READ, set),
            "4" => self.watchpoint(addr, WATCHPOINT_READ | WATCHPOINT_WRITE, set),
            _ => false,
        }
    }

    fn watchpoint(&mut self, addr: u16, kind: u8, set: bool) -> bool {
        if set {
            self.machine.debugger.add_watchpoint(Watchpoint { addr, kind })
        } else {
            self.machine.debugger.remove_watchpoint(addr)
        }
    }

    /// Run until a breakpoint hits or the client interrupts.
    fn cont(&mut self) -> std::io::Result<()> {
        self.stream.set_nonblocking(true)?;
        let mut byte = [0u8; 1];
        let mut steps: u32 = 0;

        loop {
            self.machine.step();
            if self.machine.should_exit() || self.machine.debugger.is_breakpoint_set(self.machine.pc()) {
                self.machine.debugger.clear_breakpoint_if_temporary(self.machine.pc());
                break;
            }
            steps = steps.wrapping_add(1);
            if steps % 4096 == 0 {
                match self.stream.read(&mut byte) {
                    Ok(0) => break,
                    Ok(_) if byte[0] == 0x03 => break,
                    Ok(_) => {}
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => {
                        self.stream.set_nonblocking(false)?;
                        return Err(err);
                    }
                }
            }
        }

        self.stream.set_nonblocking(false)
    }
}

fn parse_addr_len(args: &str, sep: char) -> Option<(u16, usize)> {
    let (addr, len) = args.split_once(sep)?;
    let addr = u32::from_str_radix(addr, 16).ok()?;
    let len = usize::from_str_radix(len, 16).ok()?;
    if addr > 0xffff {
        return None;
    }
    Some((addr as u16, len))
}
