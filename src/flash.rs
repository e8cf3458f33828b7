// NOR flash emulation (SST39-style). Reads normally serve the array, but a
// software command sequence written through the memory bus drives a small
// state machine implementing software ID, byte program, sector erase and
// chip erase, including the programmed delays and the JEDEC toggle-bit busy
// protocol the OS polls during writes.

use crate::bus::Device;
use crate::us_to_tstates;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

/// Biggest supported part; the default board carries the 256 KiB variant,
/// mirrored in the upper half of the flash window.
pub const FLASH_SIZE_MAX: usize = 512 * 1024;
pub const FLASH_SIZE: usize = FLASH_SIZE_MAX / 2;

const SECTOR_SIZE: usize = 4096;

/// SST manufacturer and device IDs returned in software-ID state.
const MANUFACTURER_ID: u8 = 0xBF;
const DEVICE_ID: u8 = 0xB6;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("could not access flash image: {0}")]
    Io(#[from] std::io::Error),
    #[error("no operating system found in the ROM, cannot override the init program")]
    OsNotFound,
    #[error("user file is too big to fit in the ROM")]
    UserFileTooBig,
    #[error("invalid user file address")]
    BadUserAddress,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FsmState {
    Idle,
    SoftwareId,
    /// Reached after *(0x5555)=0xAA, common to every command sequence.
    SpecialStep0,
    /// Similarly, after *(0x2AAA)=0x55.
    SpecialStep1,
    /// Erase-only continuation steps.
    SpecialStep2,
    SpecialStep3,
    /// A sector/chip erase byte is expected next.
    PerformErase,
    /// The data byte to program is expected next.
    WritePending,
    /// Byte programmed, busy protocol active until the delay elapses.
    WriteDelay,
    /// Erase performed, delaying.
    EraseDelay,
}

pub struct Flash {
    data: Vec<u8>,
    state: FsmState,
    /// Byte being programmed, pre-flipped for the busy protocol.
    writing_byte: u8,
    ticks_remaining: i64,
    dirty: bool,
}

impl Flash {
    pub fn new() -> Flash {
        Flash {
            // An empty flash contains FF bytes
            data: vec![0xFF; FLASH_SIZE],
            state: FsmState::Idle,
            writing_byte: 0,
            ticks_remaining: 0,
            dirty: false,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Count down a pending program/erase delay.
    pub fn tick(&mut self, elapsed_tstates: u64) {
        if self.state == FsmState::WriteDelay || self.state == FsmState::EraseDelay {
            self.ticks_remaining -= elapsed_tstates as i64;
            if self.ticks_remaining <= 0 {
                self.state = FsmState::Idle;
            }
        }
    }

    fn process_write(&mut self, addr: u32, data: u8) {
        match self.state {
            FsmState::Idle => {
                if addr == 0x5555 && data == 0xaa {
                    self.state = FsmState::SpecialStep0;
                }
            }
            FsmState::SpecialStep0 => {
                if addr == 0x2aaa && data == 0x55 {
                    self.state = FsmState::SpecialStep1;
                } else {
                    self.retry(addr, data);
                }
            }
            FsmState::SpecialStep1 => {
                if addr == 0x5555 && data == 0x90 {
                    self.state = FsmState::SoftwareId;
                } else if addr == 0x5555 && data == 0xa0 {
                    self.state = FsmState::WritePending;
                } else if addr == 0x5555 && data == 0x80 {
                    self.state = FsmState::SpecialStep2;
                } else {
                    self.retry(addr, data);
                }
            }
            FsmState::SpecialStep2 => {
                if addr == 0x5555 && data == 0xaa {
                    self.state = FsmState::SpecialStep3;
                } else {
                    self.retry(addr, data);
                }
            }
            FsmState::SpecialStep3 => {
                if addr == 0x2aaa && data == 0x55 {
                    self.state = FsmState::PerformErase;
                } else {
                    self.retry(addr, data);
                }
            }
            FsmState::PerformErase => {
                if data == 0x30 {
                    // Sector erase: the 4 KiB sector containing the address
                    let sector = (addr as usize & 0x3ff000) % self.data.len();
                    log::info!("[FLASH] erasing sector {} @ address 0x{:x}", sector / SECTOR_SIZE, sector);
                    self.data[sector..sector + SECTOR_SIZE].fill(0xFF);
                    self.dirty = true;
                    // Erasing a sector takes 25ms on real hardware
                    self.ticks_remaining = us_to_tstates(25_000.0) as i64;
                    self.state = FsmState::EraseDelay;
                } else if data == 0x10 && addr == 0x5555 {
                    log::info!("[FLASH] erasing chip");
                    self.data.fill(0xFF);
                    self.dirty = true;
                    // Erasing the whole chip takes 100ms
                    self.ticks_remaining = us_to_tstates(100_000.0) as i64;
                    self.state = FsmState::EraseDelay;
                } else {
                    self.retry(addr, data);
                }
            }
            FsmState::WritePending => {
                // Only bits at 1 can be programmed to 0, so AND the value in
                let idx = addr as usize % self.data.len();
                self.data[idx] &= data;
                self.dirty = true;
                // DQ7 is exposed inverted while busy, DQ6 toggles per read
                self.writing_byte = data ^ 0x80;
                // Programming a byte takes 20us on real hardware
                self.ticks_remaining = us_to_tstates(20.0) as i64;
                self.state = FsmState::WriteDelay;
            }
            FsmState::WriteDelay | FsmState::EraseDelay => {}
            FsmState::SoftwareId => {
                if data == 0xf0 {
                    self.state = FsmState::Idle;
                }
            }
        }
    }

    /// The sequence broke: reset the FSM and reprocess the byte so a
    /// legitimate sequence starting here is not lost.
    fn retry(&mut self, addr: u32, data: u8) {
        self.state = FsmState::Idle;
        self.process_write(addr, data);
    }

    /// Load a raw ROM image into the array.
    pub fn load_from_file(&mut self, path: &Path) -> Result<(), FlashError> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let count = buf.len().min(self.data.len());
        self.data[..count].copy_from_slice(&buf[..count]);
        log::info!("[FLASH] {} loaded successfully", path.display());
        Ok(())
    }

    /// Dump the array back to a file if anything was programmed or erased.
    pub fn save_to_file(&self, path: &Path) -> Result<(), FlashError> {
        if !self.dirty {
            return Ok(());
        }
        let mut file = OpenOptions::new().write(true).truncate(true).create(true).open(path)?;
        file.write_all(&self.data)?;
        log::info!("[FLASH] dump saved to {} successfully", path.display());
        Ok(())
    }

    fn read_le16(&self, addr: usize) -> u16 {
        let addr = addr % self.data.len();
        self.data[addr] as u16 | ((self.data[(addr + 1) % self.data.len()] as u16) << 8)
    }

    /// Find the page where the operating system is flashed: each 16 KiB page
    /// is probed for the OS configuration structure, whose 16-bit pointer
    /// lives at offset 4 and whose first byte names this board as target.
    fn find_os_page(&self) -> Option<(usize, u16)> {
        const CONFIG_OFFSET: usize = 4;
        const BOARD_TARGET: u8 = 1;

        for page in (0..self.data.len()).step_by(16384) {
            let config_addr = self.read_le16(page + CONFIG_OFFSET);
            // The config sits in the first 4 KiB but after the reset vectors
            if (0x40..0x1000).contains(&config_addr)
                && self.data[page + config_addr as usize] == BOARD_TARGET
            {
                log::info!("[FLASH] operating system found at offset 0x{:x}", page);
                return Some((page, config_addr));
            }
        }
        None
    }

    /// Check that the OS init path points into the romdisk (`A:/` prefix,
    /// at most 16 printable characters after it).
    fn is_init_path(path: &[u8]) -> bool {
        if path.len() < 3 || !(path[0] == b'A' || path[0] == b'a') || path[1] != b':' || path[2] != b'/' {
            return false;
        }
        for i in 0..16 {
            match path.get(i + 3) {
                Some(0) | None => return true,
                Some(c) if c.is_ascii_graphic() || *c == b' ' => {}
                Some(_) => return false,
            }
        }
        true
    }

    /// Override the romdisk with a user program: synthesise a one-entry
    /// romdisk header and patch the supplied binary after it. The argument
    /// may carry an explicit romdisk address as `file,hexaddr`; otherwise
    /// the romdisk is assumed to sit in the page after the OS.
    pub fn override_romdisk(&mut self, userprog: &str) -> Result<(), FlashError> {
        const ROMDISK_HEADER: usize = 64;

        let (path, explicit_addr) = match userprog.split_once(',') {
            Some((p, addr)) => {
                let addr = usize::from_str_radix(addr.trim_start_matches("0x"), 16)
                    .map_err(|_| FlashError::BadUserAddress)?;
                if addr >= self.data.len() {
                    return Err(FlashError::BadUserAddress);
                }
                (p, Some(addr))
            }
            None => (userprog, None),
        };

        let (os_offset, config_addr) = self.find_os_page().ok_or(FlashError::OsNotFound)?;
        let romdisk_offset = explicit_addr.unwrap_or(os_offset + 0x4000);

        let mut file = File::open(path)?;
        let mut program = Vec::new();
        file.read_to_end(&mut program)?;
        if romdisk_offset + ROMDISK_HEADER + program.len() > self.data.len() {
            return Err(FlashError::UserFileTooBig);
        }

        // Name the entry after the OS init path when it points to the romdisk
        let init_addr = self.read_le16(os_offset + config_addr as usize + 0xa) as usize;
        let init_start = (os_offset + init_addr).min(self.data.len());
        let init_path = &self.data[init_start..(init_start + 20).min(self.data.len())];
        let mut name = [0u8; 16];
        if Flash::is_init_path(init_path) {
            for (i, c) in init_path[3..].iter().take_while(|c| **c != 0).take(15).enumerate() {
                name[i] = *c;
            }
        } else {
            name[..8].copy_from_slice(b"init.bin");
        }
        log::info!("[FLASH] loading user program as {}", String::from_utf8_lossy(&name).trim_end_matches('\0'));

        // One-entry romdisk header, explicit little-endian layout:
        // entry count (2), name (16), size (4), offset (4), date (10)
        let mut header = [0u8; ROMDISK_HEADER];
        header[0..2].copy_from_slice(&1u16.to_le_bytes());
        header[2..18].copy_from_slice(&name);
        header[18..22].copy_from_slice(&(program.len() as u32).to_le_bytes());
        header[22..26].copy_from_slice(&(ROMDISK_HEADER as u32).to_le_bytes());

        self.data[romdisk_offset..romdisk_offset + ROMDISK_HEADER].copy_from_slice(&header);
        self.data[romdisk_offset + ROMDISK_HEADER..romdisk_offset + ROMDISK_HEADER + program.len()]
            .copy_from_slice(&program);

        log::info!("[FLASH] user program {} loaded successfully @ 0x{:x}", path, romdisk_offset);
        Ok(())
    }
}

impl Device for Flash {
    fn name(&self) -> &'static str {
        "nor_flash_dev"
    }

    fn mem_size(&self) -> u32 {
        self.data.len() as u32
    }

    fn mem_read(&mut self, addr: u32) -> u8 {
        match self.state {
            FsmState::EraseDelay => 0xff,
            FsmState::WriteDelay => {
                // DQ7 was flipped when the write was armed; DQ6 toggles here
                let ret = self.writing_byte;
                self.writing_byte ^= 0x40;
                ret
            }
            FsmState::SoftwareId => match addr {
                0 => MANUFACTURER_ID,
                1 => DEVICE_ID,
                _ => 0xFF,
            },
            _ => match self.data.get(addr as usize) {
                Some(b) => *b,
                None => {
                    log::error!("[FLASH] invalid read at 0x{:08x}", addr);
                    0
                }
            },
        }
    }

    fn mem_debug_read(&mut self, addr: u32) -> u8 {
        match self.data.get(addr as usize) {
            Some(b) => *b,
            None => 0,
        }
    }

    fn mem_write(&mut self, addr: u32, data: u8) {
        self.process_write(addr, data);
    }
}
