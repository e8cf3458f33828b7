// DMA engine of the video board. A write to the control register walks a
// chain of 12-byte descriptors through the physical memory facade, copying
// byte by byte with independent increment/decrement/hold stepping on each
// endpoint, until a descriptor carries the `last` flag.

use crate::bus::MemOps;

const REG_CTRL: u16 = 0x0;
const REG_DESC_ADDR0: u16 = 0x1;
const REG_DESC_ADDR1: u16 = 0x2;
const REG_DESC_ADDR2: u16 = 0x3;
const REG_CLK_DIV: u16 = 0x9;

const CTRL_START: u8 = 0x80;

const OP_INC: u8 = 0;
const OP_DEC: u8 = 1;

pub const DESCRIPTOR_SIZE: u32 = 12;

struct Descriptor {
    rd_addr: u32,
    wr_addr: u32,
    length: u16,
    last: bool,
    rd_op: u8,
    wr_op: u8,
}

impl Descriptor {
    /// Explicit little-endian layout: rd (24), wr (24), length (16),
    /// flags (8), reserved (24).
    fn decode(raw: &[u8; DESCRIPTOR_SIZE as usize]) -> Descriptor {
        let flags = raw[8];
        Descriptor {
            rd_addr: raw[0] as u32 | (raw[1] as u32) << 8 | (raw[2] as u32) << 16,
            wr_addr: raw[3] as u32 | (raw[4] as u32) << 8 | (raw[5] as u32) << 16,
            length: raw[6] as u16 | (raw[7] as u16) << 8,
            last: flags & 1 != 0,
            rd_op: (flags >> 1) & 0x3,
            wr_op: (flags >> 3) & 0x3,
        }
    }
}

pub struct Dma {
    desc_addr: u32,
    clk: u8,
    ops: MemOps,
}

impl Dma {
    pub fn new(ops: MemOps) -> Dma {
        Dma { desc_addr: 0, clk: 0x11, ops }
    }

    pub fn reset(&mut self) {
        // Reset values differ from the boot ones on hardware
        self.clk = 0x56;
        // Descriptor address unchanged on reset
    }

    fn start_transfer(&mut self) {
        loop {
            let mut raw = [0u8; DESCRIPTOR_SIZE as usize];
            self.ops.phys_read_bytes(self.desc_addr, &mut raw);
            let mut desc = Descriptor::decode(&raw);

            for _ in 0..desc.length {
                let data = self.ops.phys_read_byte(desc.rd_addr);
                self.ops.phys_write_byte(desc.wr_addr, data);

                match desc.rd_op {
                    OP_INC => desc.rd_addr = desc.rd_addr.wrapping_add(1),
                    OP_DEC => desc.rd_addr = desc.rd_addr.wrapping_sub(1),
                    _ => {}
                }
                match desc.wr_op {
                    OP_INC => desc.wr_addr = desc.wr_addr.wrapping_add(1),
                    OP_DEC => desc.wr_addr = desc.wr_addr.wrapping_sub(1),
                    _ => {}
                }
            }

            self.desc_addr = self.desc_addr.wrapping_add(DESCRIPTOR_SIZE);
            if desc.last {
                break;
            }
        }
    }

    pub fn read(&mut self, port: u16) -> u8 {
        match port {
            REG_DESC_ADDR0 => self.desc_addr as u8,
            REG_DESC_ADDR1 => (self.desc_addr >> 8) as u8,
            REG_DESC_ADDR2 => (self.desc_addr >> 16) as u8,
            REG_CLK_DIV => self.clk,
            _ => 0,
        }
    }

    pub fn write(&mut self, port: u16, value: u8) {
        match port {
            REG_CTRL => {
                if value & CTRL_START != 0 {
                    self.start_transfer();
                }
            }
            REG_DESC_ADDR0 => self.desc_addr = (self.desc_addr & 0xffff00) | value as u32,
            REG_DESC_ADDR1 => self.desc_addr = (self.desc_addr & 0xff00ff) | (value as u32) << 8,
            REG_DESC_ADDR2 => self.desc_addr = (self.desc_addr & 0x00ffff) | (value as u32) << 16,
            REG_CLK_DIV => self.clk = value,
            _ => {}
        }
    }
}
