// Debugger core: fixed-size breakpoint and watchpoint tables, the symbol
// map, and a small interactive shell driving the machine from the
// terminal. Temporary breakpoints implement step-over: a one-shot entry
// planted after the current instruction, cleared on the first hit.

use crate::disasm;
use crate::machine::Machine;
use iz80::Reg16;
use std::io::{BufRead, Write};
use termion::color;

pub const DBG_MAX_POINTS: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DbgState {
    Running,
    Paused,
    ReqStep,
    ReqStepOver,
}

#[derive(Clone, Copy, Default)]
struct Breakpoint {
    active: bool,
    temporary: bool,
    addr: u16,
}

pub const WATCHPOINT_READ: u8 = 1;
pub const WATCHPOINT_WRITE: u8 = 2;

#[derive(Clone, Copy, Default)]
pub struct Watchpoint {
    pub addr: u16,
    pub kind: u8,
}

struct Symbol {
    name: String,
    addr: u16,
}

pub struct Debugger {
    breakpoints: [Breakpoint; DBG_MAX_POINTS],
    watchpoints: [Watchpoint; DBG_MAX_POINTS],
    symbols: Vec<Symbol>,
}

impl Debugger {
    pub fn new() -> Debugger {
        Debugger {
            breakpoints: [Breakpoint::default(); DBG_MAX_POINTS],
            watchpoints: [Watchpoint::default(); DBG_MAX_POINTS],
            symbols: Vec::new(),
        }
    }

    fn find_breakpoint(&mut self, address: u16) -> Option<&mut Breakpoint> {
        self.breakpoints.iter_mut().find(|b| b.active && b.addr == address)
    }

    pub fn is_breakpoint_set(&self, address: u16) -> bool {
        self.breakpoints.iter().any(|b| b.active && b.addr == address)
    }

    pub fn set_breakpoint(&mut self, address: u16) -> bool {
        if let Some(brk) = self.find_breakpoint(address) {
            // An existing temporary breakpoint becomes permanent
            brk.temporary = false;
            return true;
        }
        match self.breakpoints.iter_mut().find(|b| !b.active) {
            Some(brk) => {
                *brk = Breakpoint { active: true, temporary: false, addr: address };
                true
            }
            None => false,
        }
    }

    /// One-shot breakpoint used by step-over; not planted when a real one
    /// already covers the address.
    pub fn set_temporary_breakpoint(&mut self, address: u16) -> bool {
        if self.is_breakpoint_set(address) {
            return false;
        }
        match self.breakpoints.iter_mut().find(|b| !b.active) {
            Some(brk) => {
                *brk = Breakpoint { active: true, temporary: true, addr: address };
                true
            }
            None => false,
        }
    }

    pub fn clear_breakpoint_if_temporary(&mut self, address: u16) -> bool {
        match self.find_breakpoint(address) {
            Some(brk) if brk.temporary => {
                brk.active = false;
                true
            }
            _ => false,
        }
    }

    pub fn clear_breakpoint(&mut self, address: u16) -> bool {
        match self.find_breakpoint(address) {
            Some(brk) if !brk.temporary => {
                brk.active = false;
                true
            }
            _ => false,
        }
    }

    pub fn toggle_breakpoint(&mut self, address: u16) -> bool {
        let permanent = self.breakpoints.iter().any(|b| b.active && !b.temporary && b.addr == address);
        if permanent {
            self.clear_breakpoint(address)
        } else {
            self.set_breakpoint(address)
        }
    }

    pub fn breakpoints(&self) -> Vec<u16> {
        self.breakpoints
            .iter()
            .filter(|b| b.active && !b.temporary)
            .map(|b| b.addr)
            .collect()
    }

    /// Parse a comma-separated breakpoint list of addresses and symbols.
    pub fn set_breakpoints_str(&mut self, list: &str) {
        for token in list.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match parse_address(token) {
                Some(addr) => {
                    self.set_breakpoint(addr);
                }
                None => match self.find_symbol(token) {
                    Some(addr) => {
                        self.set_breakpoint(addr);
                    }
                    None => log::info!("[DEBUGGER] unknown symbol '{}', ignoring", token),
                },
            }
        }
    }

    pub fn add_watchpoint(&mut self, wp: Watchpoint) -> bool {
        if let Some(existing) = self.watchpoints.iter_mut().find(|w| w.addr == wp.addr && w.kind != 0) {
            existing.kind |= wp.kind;
            return true;
        }
        match self.watchpoints.iter_mut().find(|w| w.kind == 0) {
            Some(slot) => {
                *slot = wp;
                true
            }
            None => false,
        }
    }

    pub fn remove_watchpoint(&mut self, address: u16) -> bool {
        match self.watchpoints.iter_mut().find(|w| w.addr == address && w.kind != 0) {
            Some(wp) => {
                *wp = Watchpoint::default();
                true
            }
            None => false,
        }
    }

    pub fn is_watchpoint_set(&self, address: u16) -> bool {
        self.watchpoints.iter().any(|w| w.addr == address && w.kind != 0)
    }

    pub fn watchpoints(&self) -> Vec<Watchpoint> {
        self.watchpoints.iter().filter(|w| w.kind != 0).copied().collect()
    }

    /// Load symbols from a map file; accepted lines look like
    /// `label = $1234 ; addr,`.
    pub fn load_symbols(&mut self, path: &std::path::Path) -> bool {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                log::error!("[MAP] could not open {}: {}", path.display(), err);
                return false;
            }
        };

        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 5 && parts[1] == "=" && parts[4] == "addr," {
                if let Some(hex) = parts[2].strip_prefix('$') {
                    if let Ok(addr) = u16::from_str_radix(hex, 16) {
                        self.symbols.push(Symbol { name: parts[0].to_string(), addr });
                    }
                }
            }
        }

        log::info!("[MAP] {} loaded successfully", path.display());
        true
    }

    pub fn symbol_at(&self, address: u16) -> Option<&str> {
        self.symbols.iter().find(|s| s.addr == address).map(|s| s.name.as_str())
    }

    pub fn find_symbol(&self, name: &str) -> Option<u16> {
        self.symbols.iter().find(|s| s.name == name).map(|s| s.addr)
    }
}

/// Parse `0x1234`, `$1234` or a decimal address.
fn parse_address(token: &str) -> Option<u16> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix('$')) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        token.parse::<u16>().ok()
    }
}

fn disassemble_at(machine: &Machine, addr: u16) -> (String, usize) {
    let mut opcodes = [0u8; 4];
    for (i, b) in opcodes.iter_mut().enumerate() {
        *b = machine.debug_mem_read(addr.wrapping_add(i as u16));
    }
    disasm::disassemble(&opcodes, addr, |target| {
        machine.debugger.symbol_at(target).map(|s| s.to_string())
    })
}

fn print_registers(machine: &mut Machine) {
    let pc = machine.pc();
    let regs = machine.registers();
    println!(
        "AF {:04x}  BC {:04x}  DE {:04x}  HL {:04x}",
        regs.get16(Reg16::AF),
        regs.get16(Reg16::BC),
        regs.get16(Reg16::DE),
        regs.get16(Reg16::HL),
    );
    println!(
        "IX {:04x}  IY {:04x}  SP {:04x}  PC {:04x}",
        regs.get16(Reg16::IX),
        regs.get16(Reg16::IY),
        regs.get16(Reg16::SP),
        pc,
    );
}

fn print_disassembly(machine: &Machine, mut addr: u16, count: usize) {
    for _ in 0..count {
        let (text, size) = disassemble_at(machine, addr);
        match machine.debugger.symbol_at(addr) {
            Some(label) => println!("{:04x} <{}>: {}", addr, label, text),
            None => println!("{:04x}: {}", addr, text),
        }
        addr = addr.wrapping_add(size as u16);
    }
}

fn print_memory(machine: &Machine, addr: u16, len: usize) {
    for row in 0..(len + 15) / 16 {
        let base = addr.wrapping_add((row * 16) as u16);
        print!("{:04x}:", base);
        for i in 0..16 {
            print!(" {:02x}", machine.debug_mem_read(base.wrapping_add(i)));
        }
        println!();
    }
}

/// Read and execute one shell command; called while the machine is paused.
pub fn shell_prompt(machine: &mut Machine) {
    let pc = machine.pc();
    let (text, _) = disassemble_at(machine, pc);
    println!(
        "{}[{:04x}]{} {}",
        color::Fg(color::Yellow),
        pc,
        color::Fg(color::Reset),
        text
    );
    print!("dbg> ");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).is_err() {
        machine.request_exit();
        return;
    }
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or("");
    let arg = words.next();

    match command {
        "" | "s" | "step" => machine.set_dbg_state(DbgState::ReqStep),
        "o" | "over" => machine.set_dbg_state(DbgState::ReqStepOver),
        "c" | "continue" => machine.set_dbg_state(DbgState::Running),
        "b" | "break" => match arg.and_then(parse_address).or_else(|| arg.and_then(|a| machine.debugger.find_symbol(a))) {
            Some(addr) => {
                machine.debugger.set_breakpoint(addr);
                println!("breakpoint set at {:04x}", addr);
            }
            None => println!("usage: break <addr|symbol>"),
        },
        "del" => match arg.and_then(parse_address) {
            Some(addr) => {
                machine.debugger.clear_breakpoint(addr);
            }
            None => println!("usage: del <addr>"),
        },
        "bl" => {
            for addr in machine.debugger.breakpoints() {
                println!("{:04x}", addr);
            }
        }
        "r" | "regs" => print_registers(machine),
        "m" | "mem" => match arg.and_then(parse_address) {
            Some(addr) => {
                let len = words.next().and_then(|w| w.parse().ok()).unwrap_or(64);
                print_memory(machine, addr, len);
            }
            None => println!("usage: mem <addr> [len]"),
        },
        "d" | "dis" => {
            let addr = arg.and_then(parse_address).unwrap_or(pc);
            print_disassembly(machine, addr, 10);
        }
        "sym" => match arg {
            Some(path) => {
                machine.debugger.load_symbols(std::path::Path::new(path));
            }
            None => println!("usage: sym <map-file>"),
        },
        "flush" => match arg {
            Some(path) => match machine.save_flash(std::path::Path::new(path)) {
                Ok(()) => println!("flash saved"),
                Err(err) => println!("could not save flash: {}", err),
            },
            None => println!("usage: flush <file>"),
        },
        "reset" => machine.reset(),
        "q" | "quit" => machine.request_exit(),
        _ => {
            println!("commands: step over continue break del bl regs mem dis sym flush reset quit");
        }
    }
}
