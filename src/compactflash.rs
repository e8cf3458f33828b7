// CompactFlash card in true IDE mode: eight registers, LBA addressing and
// a 512-byte sector buffer pumped through the data register. Reads and
// writes are backed by an image file, written through on every completed
// sector. Only the feature set the OS driver uses is implemented.

use crate::bus::Device;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

const SECTOR_SIZE: usize = 512;

// Register offsets; error/feature and command/status share a byte
const REG_DATA: u16 = 0;
const REG_FEATURE: u16 = 1;
const REG_SEC_CNT: u16 = 2;
const REG_LBA_0: u16 = 3;
const REG_LBA_8: u16 = 4;
const REG_LBA_16: u16 = 5;
const REG_LBA_24: u16 = 6;
const REG_COMMAND: u16 = 7;

// Status bits
const STAT_RDY: u8 = 6;
const STAT_DSC: u8 = 4;
const STAT_DRQ: u8 = 3;
const STAT_ERR: u8 = 0;

// Error bits
const ERR_IDNF: u8 = 4;

// Commands
const CMD_NOP: u8 = 0x00;
const CMD_READ_SECTOR: u8 = 0x20;
const CMD_READ_SECTOR_NR: u8 = 0x21;
const CMD_WRITE_SECTOR: u8 = 0x30;
const CMD_WRITE_SECTOR_NR: u8 = 0x31;
const CMD_READ_BUFFER: u8 = 0xE4;
const CMD_WRITE_BUFFER: u8 = 0xE8;
const CMD_IDENTIFY: u8 = 0xEC;
const CMD_SET_FEATURE: u8 = 0xEF;

#[derive(Debug, Error)]
pub enum CompactFlashError {
    #[error("could not access CompactFlash image: {0}")]
    Io(#[from] std::io::Error),
    #[error("image must be at least 1MB big")]
    ImageTooSmall,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum DataState {
    Idle,
    Cmd,
    DataIn,
    DataOut,
    DataError,
}

pub struct CompactFlash {
    file: std::fs::File,
    total_sectors: u32,
    data_ofs: Option<u64>,
    sector_buffer: [u8; SECTOR_SIZE],
    sector_buffer_idx: usize,
    state: DataState,
    master: bool,
    lba_mode: bool,
    status: u8,
    error: u8,
    feature: u8,
    sec_cnt: u16,
    sec_cur: u16,
    lba_0: u8,
    lba_8: u8,
    lba_16: u8,
    lba_24: u8,
    identity: [u16; 256],
}

impl CompactFlash {
    pub fn new(image: &Path) -> Result<CompactFlash, CompactFlashError> {
        let file = OpenOptions::new().read(true).write(true).open(image)?;
        let size = file.metadata()?.len();
        if size < 1024 * 1024 {
            return Err(CompactFlashError::ImageTooSmall);
        }
        // Round the total amount of sectors up
        let total_sectors = ((size + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64) as u32;

        let mut identity = [0u16; 256];
        identity[0] = 0x848A; // CFA magic value
        identity[49] = 1 << 9; // LBA supported
        identity[60] = (total_sectors & 0xFFFF) as u16; // current capacity in sectors
        identity[61] = (total_sectors >> 16) as u16;
        identity[83] = 1 << 2; // CFA feature set

        Ok(CompactFlash {
            file,
            total_sectors,
            data_ofs: None,
            sector_buffer: [0; SECTOR_SIZE],
            sector_buffer_idx: 0,
            state: DataState::Idle,
            master: true,
            lba_mode: true,
            status: (1 << STAT_RDY) | (1 << STAT_DSC),
            error: 0,
            feature: 0,
            sec_cnt: 1,
            sec_cur: 0,
            lba_0: 0,
            lba_8: 0,
            lba_16: 0,
            lba_24: 0xE0,
            identity,
        })
    }

    fn abort(&mut self, msg: &str) -> ! {
        log::error!("[COMPACTFLASH] {}", msg);
        std::process::exit(1);
    }

    fn data_state(&mut self, state: DataState) {
        self.state = state;
        match state {
            DataState::Idle | DataState::Cmd => {
                self.status &= !(1 << STAT_DRQ);
            }
            DataState::DataIn | DataState::DataOut => {
                self.status |= 1 << STAT_DRQ;
                self.sector_buffer_idx = 0;
                self.sec_cur = 0;
            }
            DataState::DataError => {
                self.status &= !(1 << STAT_DRQ);
                self.status |= 1 << STAT_ERR;
                self.error = 1 << ERR_IDNF;
            }
        }
    }

    /// Byte offset in the image for the programmed LBA, validated against
    /// the device geometry.
    fn transfer_offset(&mut self) -> Option<u64> {
        if !self.master {
            log::info!("[COMPACTFLASH] slave device does not support data access");
            return None;
        }
        if !self.lba_mode {
            log::info!("[COMPACTFLASH] CHS mode not supported");
            return None;
        }
        let sector = ((self.lba_24 as u32 & 0xF) << 24)
            | ((self.lba_16 as u32) << 16)
            | ((self.lba_8 as u32) << 8)
            | self.lba_0 as u32;
        if sector + self.sec_cnt as u32 >= self.total_sectors {
            log::info!("[COMPACTFLASH] sector out of bounds: {}, cnt {}", sector, self.sec_cnt);
            return None;
        }
        Some(sector as u64 * SECTOR_SIZE as u64)
    }

    fn read_sector_buffer(&mut self) {
        let ofs = self.data_ofs.unwrap_or(0);
        if self.file.seek(SeekFrom::Start(ofs)).is_err() {
            self.abort("seek failed on image");
        }
        match self.file.read(&mut self.sector_buffer) {
            Ok(n) => self.sector_buffer[n..].fill(0),
            Err(_) => self.abort("read failed on image"),
        }
    }

    fn write_sector_buffer(&mut self) {
        let ofs = self.data_ofs.unwrap_or(0);
        if self.file.seek(SeekFrom::Start(ofs)).is_err() {
            self.abort("seek failed on image");
        }
        if self.file.write_all(&self.sector_buffer).is_err() {
            self.abort("write failed on image");
        }
    }

    fn read_data(&mut self) -> u8 {
        if self.state != DataState::DataIn {
            return 0;
        }
        let data = self.sector_buffer[self.sector_buffer_idx];
        self.sector_buffer_idx = (self.sector_buffer_idx + 1) % SECTOR_SIZE;
        if self.sector_buffer_idx == 0 {
            self.sec_cur += 1;
            if self.sec_cur < self.sec_cnt {
                self.data_ofs = self.data_ofs.map(|o| o + SECTOR_SIZE as u64);
                self.read_sector_buffer();
            } else {
                self.data_state(DataState::Idle);
            }
        }
        data
    }

    fn write_data(&mut self, value: u8) {
        if self.state != DataState::DataOut {
            return;
        }
        self.sector_buffer[self.sector_buffer_idx] = value;
        self.sector_buffer_idx = (self.sector_buffer_idx + 1) % SECTOR_SIZE;
        if self.sector_buffer_idx == 0 {
            self.write_sector_buffer();
            self.sec_cur += 1;
            if self.sec_cur < self.sec_cnt {
                self.data_ofs = self.data_ofs.map(|o| o + SECTOR_SIZE as u64);
            } else {
                self.data_state(DataState::Idle);
            }
        }
    }

    fn process_command(&mut self, cmd: u8) {
        self.status &= !(1 << STAT_ERR);
        self.error = 0;
        self.state = DataState::Cmd;

        match cmd {
            CMD_NOP | CMD_SET_FEATURE => {}

            CMD_IDENTIFY => {
                for (i, word) in self.identity.iter().enumerate() {
                    self.sector_buffer[i * 2] = (*word & 0xFF) as u8;
                    self.sector_buffer[i * 2 + 1] = (*word >> 8) as u8;
                }
                self.data_state(DataState::DataIn);
            }

            CMD_READ_SECTOR | CMD_READ_SECTOR_NR | CMD_READ_BUFFER => {
                if cmd != CMD_READ_BUFFER {
                    self.data_ofs = self.transfer_offset();
                }
                if self.data_ofs.is_none() {
                    return self.data_state(DataState::DataError);
                }
                self.read_sector_buffer();
                self.data_state(DataState::DataIn);
            }

            CMD_WRITE_SECTOR | CMD_WRITE_SECTOR_NR | CMD_WRITE_BUFFER => {
                if cmd != CMD_WRITE_BUFFER {
                    self.data_ofs = self.transfer_offset();
                }
                if self.data_ofs.is_none() {
                    return self.data_state(DataState::DataError);
                }
                self.data_state(DataState::DataOut);
            }

            _ => log::info!("[COMPACTFLASH] unsupported command 0x{:02x}", cmd),
        }
    }
}

impl Device for CompactFlash {
    fn name(&self) -> &'static str {
        "compactflash_dev"
    }

    fn io_size(&self) -> u16 {
        8
    }

    fn io_read(&mut self, addr: u16) -> u8 {
        if !self.master {
            return 0;
        }
        match addr & 0xff {
            REG_COMMAND => self.status,
            REG_FEATURE => self.error,
            REG_SEC_CNT => (self.sec_cnt & 0xff) as u8,
            REG_LBA_0 => self.lba_0,
            REG_LBA_8 => self.lba_8,
            REG_LBA_16 => self.lba_16,
            REG_LBA_24 => self.lba_24,
            REG_DATA => self.read_data(),
            _ => 0,
        }
    }

    fn io_write(&mut self, addr: u16, value: u8) {
        match addr & 0xff {
            REG_DATA => self.write_data(value),
            REG_COMMAND => self.process_command(value),
            REG_FEATURE => self.feature = value,
            // A sector count of 0 means 256 sectors
            REG_SEC_CNT => self.sec_cnt = if value == 0 { 256 } else { value as u16 },
            REG_LBA_0 => self.lba_0 = value,
            REG_LBA_8 => self.lba_8 = value,
            REG_LBA_16 => self.lba_16 = value,
            REG_LBA_24 => {
                self.lba_24 = value;
                self.master = value & 0x10 == 0; // bit 4: master/slave
                self.lba_mode = value & 0x40 != 0; // bit 6: LBA/CHS
            }
            _ => log::info!("[COMPACTFLASH] unsupported write, reg 0x{:02x}, data 0x{:02x}", addr, value),
        }
    }
}
