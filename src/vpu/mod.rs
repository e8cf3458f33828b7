// The video coprocessor. Video memory (tilemaps, palette, sprites, font,
// tileset) is a separate memory-bus device; this module holds the I/O side:
// identity and scratch registers, the configuration block (scroll latches,
// mode, status), the bank selector multiplexing the text controller, SPI,
// CRC32, sound and DMA sub-controllers into one 16-byte window, and the
// raster clock whose v-blank edge asks the host for a frame.

pub mod crc;
pub mod dma;
pub mod render;
pub mod sound;
pub mod spi;
pub mod text;
pub mod vram;

use crate::bus::{Device, MemOps};
use crate::us_to_tstates;
use crc::Crc32;
use dma::Dma;
use sound::Sound;
use spi::Spi;
use std::cell::RefCell;
use std::rc::Rc;
use text::TextController;
use vram::Vram;

pub const VPU_IO_SIZE: u16 = 3 * 16;

pub const MAX_RES_WIDTH: usize = 640;
pub const MAX_RES_HEIGHT: usize = 480;

const EMULATED_REV: u8 = 0;
const EMULATED_MINOR: u8 = 0;
const EMULATED_MAJOR: u8 = 1;

// I/O registers
const REG_REV: u16 = 0x00;
const REG_MINOR: u16 = 0x01;
const REG_MAJOR: u16 = 0x02;
const REG_SCRATCH0: u16 = 0x08;
const REG_SCRATCH3: u16 = 0x0b;
const REG_BANK: u16 = 0x0e;
const REG_MEM_CONF: u16 = 0x0f;
const CONF_START: u16 = 0x10;
const CONF_LAST: u16 = 0x1f;
const BANK_START: u16 = 0x20;
const BANK_LAST: u16 = 0x2f;

// Configuration sub-registers
const CONF_L0_SCR_Y_LOW: u16 = 0x04;
const CONF_L0_SCR_Y_HIGH: u16 = 0x05;
const CONF_L0_SCR_X_LOW: u16 = 0x06;
const CONF_L0_SCR_X_HIGH: u16 = 0x07;
const CONF_L1_SCR_Y_LOW: u16 = 0x08;
const CONF_L1_SCR_Y_HIGH: u16 = 0x09;
const CONF_L1_SCR_X_LOW: u16 = 0x0a;
const CONF_L1_SCR_X_HIGH: u16 = 0x0b;
const CONF_MODE: u16 = 0x0c;
const CONF_STATUS: u16 = 0x0d;

// Bank selector values
const BANK_TEXT: u8 = 0;
const BANK_SPI: u8 = 1;
const BANK_CRC: u8 = 2;
const BANK_SOUND: u8 = 3;
const BANK_DMA: u8 = 4;

// Status register bits; bit 0 is h_blank, read-only and never raised here
const STATUS_V_BLANK: u8 = 1 << 1;
const STATUS_VID_ENA: u8 = 1 << 7;

pub const MODE_TEXT_640: u8 = 0;
pub const MODE_TEXT_320: u8 = 1;
pub const MODE_BITMAP_256: u8 = 2;
pub const MODE_BITMAP_320: u8 = 3;
pub const MODE_GFX_640_8BIT: u8 = 4;
pub const MODE_GFX_320_8BIT: u8 = 5;
pub const MODE_GFX_640_4BIT: u8 = 6;
pub const MODE_GFX_320_4BIT: u8 = 7;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RasterState {
    /// Raster inside the visible area.
    Visible,
    VBlank,
}

pub struct Vpu {
    vram: Rc<RefCell<Vram>>,
    pub mode: u8,
    vid_ena: bool,
    v_blank: bool,
    io_bank: u8,
    scratch: [u8; 4],
    l0_latch: u8,
    l1_latch: u8,
    pub l0_scroll_x: u16,
    pub l0_scroll_y: u16,
    pub l1_scroll_x: u16,
    pub l1_scroll_y: u16,
    state: RasterState,
    tstates_counter: i64,
    need_render: bool,
    pub text: TextController,
    pub spi: Spi,
    pub crc: Crc32,
    pub sound: Sound,
    pub dma: Dma,
}

impl Vpu {
    pub fn new(vram: Rc<RefCell<Vram>>, ops: MemOps) -> Vpu {
        Vpu {
            vram,
            mode: MODE_TEXT_640,
            vid_ena: true,
            v_blank: false,
            io_bank: 0,
            scratch: [0; 4],
            l0_latch: 0,
            l1_latch: 0,
            l0_scroll_x: 0,
            l0_scroll_y: 0,
            l1_scroll_x: 0,
            l1_scroll_y: 0,
            state: RasterState::Visible,
            tstates_counter: Vpu::state_duration(RasterState::Visible),
            need_render: false,
            text: TextController::new(),
            spi: Spi::new(),
            crc: Crc32::new(),
            sound: Sound::new(),
            dma: Dma::new(ops),
        }
    }

    fn state_duration(state: RasterState) -> i64 {
        match state {
            // The raster spends 15.253 ms in the visible area
            RasterState::Visible => us_to_tstates(15253.0) as i64,
            // and 1.430 ms in v-blank
            RasterState::VBlank => us_to_tstates(1430.0) as i64,
        }
    }

    /// Feed elapsed CPU cycles into the raster clock.
    pub fn tick(&mut self, tstates: u64) {
        self.tstates_counter -= tstates as i64;
        if self.tstates_counter <= 0 {
            self.state = match self.state {
                RasterState::Visible => RasterState::VBlank,
                RasterState::VBlank => RasterState::Visible,
            };
            self.tstates_counter = Vpu::state_duration(self.state);
            if self.state == RasterState::VBlank {
                self.v_blank = true;
                self.need_render = true;
            } else {
                self.v_blank = false;
            }
        }
    }

    /// Whether a frame should be presented; clears the flag.
    pub fn take_need_render(&mut self) -> bool {
        std::mem::replace(&mut self.need_render, false)
    }

    pub fn force_render(&mut self) {
        self.need_render = true;
    }

    pub fn vid_ena(&self) -> bool {
        self.vid_ena
    }

    fn status(&self) -> u8 {
        // h_blank stays low: the raster model has no horizontal phase
        let mut status = 0;
        if self.v_blank {
            status |= STATUS_V_BLANK;
        }
        if self.vid_ena {
            status |= STATUS_VID_ENA;
        }
        status
    }

    fn conf_read(&mut self, addr: u16) -> u8 {
        match addr {
            CONF_L0_SCR_Y_LOW => self.l0_scroll_y as u8,
            CONF_L0_SCR_Y_HIGH => (self.l0_scroll_y >> 8) as u8,
            CONF_L0_SCR_X_LOW => self.l0_scroll_x as u8,
            CONF_L0_SCR_X_HIGH => (self.l0_scroll_x >> 8) as u8,
            CONF_L1_SCR_Y_LOW => self.l1_scroll_y as u8,
            CONF_L1_SCR_Y_HIGH => (self.l1_scroll_y >> 8) as u8,
            CONF_L1_SCR_X_LOW => self.l1_scroll_x as u8,
            CONF_L1_SCR_X_HIGH => (self.l1_scroll_x >> 8) as u8,
            CONF_MODE => self.mode,
            CONF_STATUS => self.status(),
            _ => {
                log::warn!("[VPU] unknown configuration register 0x{:x}", addr);
                0
            }
        }
    }

    fn conf_write(&mut self, addr: u16, value: u8) {
        match addr {
            // Scrolls latch on the low byte; the high byte commits
            CONF_L0_SCR_Y_LOW | CONF_L0_SCR_X_LOW => self.l0_latch = value,
            CONF_L0_SCR_Y_HIGH => self.l0_scroll_y = (value as u16) << 8 | self.l0_latch as u16,
            CONF_L0_SCR_X_HIGH => self.l0_scroll_x = (value as u16) << 8 | self.l0_latch as u16,
            CONF_L1_SCR_Y_LOW | CONF_L1_SCR_X_LOW => self.l1_latch = value,
            CONF_L1_SCR_Y_HIGH => self.l1_scroll_y = (value as u16) << 8 | self.l1_latch as u16,
            CONF_L1_SCR_X_HIGH => self.l1_scroll_x = (value as u16) << 8 | self.l1_latch as u16,
            CONF_MODE => {
                self.mode = value;
                self.text.set_mode(value != MODE_TEXT_320);
            }
            CONF_STATUS => self.vid_ena = value & STATUS_VID_ENA != 0,
            _ => log::warn!("[VPU] unknown configuration register 0x{:x}", addr),
        }
    }
}

impl Device for Vpu {
    fn name(&self) -> &'static str {
        "vpu_dev"
    }

    fn io_size(&self) -> u16 {
        VPU_IO_SIZE
    }

    fn io_read(&mut self, addr: u16) -> u8 {
        let addr = addr & 0xff;
        match addr {
            REG_REV => EMULATED_REV,
            REG_MINOR => EMULATED_MINOR,
            REG_MAJOR => EMULATED_MAJOR,
            REG_SCRATCH0..=REG_SCRATCH3 => self.scratch[(addr - REG_SCRATCH0) as usize],
            REG_BANK => self.io_bank,
            CONF_START..=CONF_LAST => self.conf_read(addr - CONF_START),
            BANK_START..=BANK_LAST => {
                let sub = addr - BANK_START;
                match self.io_bank {
                    BANK_TEXT => self.text.read(sub),
                    BANK_SPI => self.spi.read(sub),
                    BANK_CRC => self.crc.read(sub),
                    BANK_SOUND => self.sound.read(sub),
                    BANK_DMA => self.dma.read(sub),
                    _ => 0,
                }
            }
            _ => 0,
        }
    }

    fn io_write(&mut self, addr: u16, data: u8) {
        let addr = addr & 0xff;
        match addr {
            REG_SCRATCH0..=REG_SCRATCH3 => self.scratch[(addr - REG_SCRATCH0) as usize] = data,
            REG_BANK => self.io_bank = data,
            REG_MEM_CONF => log::warn!("[VPU] memory mapping register is not supported"),
            CONF_START..=CONF_LAST => self.conf_write(addr - CONF_START, data),
            BANK_START..=BANK_LAST => {
                let sub = addr - BANK_START;
                match self.io_bank {
                    BANK_TEXT => self.text.write(sub, data, &mut self.vram.borrow_mut()),
                    BANK_SPI => self.spi.write(sub, data),
                    BANK_CRC => self.crc.write(sub, data),
                    BANK_SOUND => self.sound.write(sub, data),
                    BANK_DMA => self.dma.write(sub, data),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.text.reset();
        self.spi.reset();
        self.crc.reset();
        self.sound.reset();
        self.dma.reset();
    }
}
