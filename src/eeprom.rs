// I2C EEPROM (AT24-style, 64 KiB). A master write sends two address bytes
// then data; data writes wrap inside the current 128-byte page, the way the
// hardware page-write behaves. On STOP the written page is flushed to the
// backing image. Reads auto-increment over the whole array.

use crate::i2c::I2cDevice;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const EEPROM_ADDR: u8 = 0x50;
pub const EEPROM_SIZE: usize = 64 * 1024;
pub const EEPROM_PAGE: usize = 128;

pub struct Eeprom {
    data: Vec<u8>,
    address: usize,
    count: usize,
    writing: bool,
    page_written: usize,
    file: Option<std::fs::File>,
}

impl Eeprom {
    pub fn new(image: Option<&Path>) -> Eeprom {
        let mut eeprom = Eeprom {
            data: vec![0; EEPROM_SIZE],
            address: 0,
            count: 0,
            writing: false,
            page_written: 0,
            file: None,
        };

        if let Some(path) = image {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(mut file) => {
                    match file.read(&mut eeprom.data) {
                        Ok(count) => {
                            log::info!("[EEPROM] loaded from {}", path.display());
                            if count < EEPROM_SIZE {
                                log::warn!("[EEPROM] image size is smaller than EEPROM size");
                            }
                            eeprom.file = Some(file);
                        }
                        Err(err) => log::error!("[EEPROM] could not read image {}: {}", path.display(), err),
                    }
                }
                Err(err) => log::error!("[EEPROM] could not open image {}: {}", path.display(), err),
            }
        }

        eeprom
    }

    #[cfg(test)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl I2cDevice for Eeprom {
    fn address(&self) -> u8 {
        EEPROM_ADDR
    }

    fn start(&mut self) {
        self.count = 0;
        self.writing = false;
    }

    fn read(&mut self) -> u8 {
        let byte = self.data[self.address];
        self.address = (self.address + 1) % EEPROM_SIZE;
        byte
    }

    fn write(&mut self, byte: u8) {
        match self.count {
            0 => self.address = (byte as usize) << 8,
            1 => self.address |= byte as usize,
            _ => {
                if !self.writing {
                    self.page_written = self.address / EEPROM_PAGE;
                    self.writing = true;
                }
                self.data[self.address] = byte;
                self.address = (self.address + 1) % EEPROM_SIZE;
                if self.address % EEPROM_PAGE == 0 {
                    // Page boundary reached: roll back to the page start
                    self.address = (self.address + EEPROM_SIZE - EEPROM_PAGE) % EEPROM_SIZE;
                }
            }
        }
        self.count += 1;
    }

    fn stop(&mut self) {
        if self.writing {
            if let Some(file) = self.file.as_mut() {
                let page_start = self.page_written * EEPROM_PAGE;
                let flush = file
                    .seek(SeekFrom::Start(page_start as u64))
                    .and_then(|_| file.write_all(&self.data[page_start..page_start + EEPROM_PAGE]));
                if let Err(err) = flush {
                    log::error!("[EEPROM] could not write back page 0x{:x}: {}", self.page_written, err);
                }
            }
        }
        self.writing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_write_wraps_inside_page() {
        let mut eeprom = Eeprom::new(None);
        eeprom.start();
        eeprom.write(0x00);
        eeprom.write(0xFE);
        for byte in [b'A', b'B', b'C', b'D', b'E'] {
            eeprom.write(byte);
        }
        eeprom.stop();
        assert_eq!(eeprom.data()[0xFE], b'A');
        assert_eq!(eeprom.data()[0xFF], b'B');
        assert_eq!(eeprom.data()[0x80], b'C');
        assert_eq!(eeprom.data()[0x81], b'D');
        assert_eq!(eeprom.data()[0x82], b'E');
    }

    #[test]
    fn reads_auto_increment_over_whole_array() {
        let mut eeprom = Eeprom::new(None);
        eeprom.start();
        eeprom.write(0xFF);
        eeprom.write(0xFF);
        eeprom.write(0x11);
        eeprom.stop();
        // Address FFFF wraps to 0 on read auto-increment... the write wrapped
        // within the last page, so the byte went to 0xFFFF.
        eeprom.start();
        eeprom.write(0xFF);
        eeprom.write(0xFF);
        eeprom.stop();
        assert_eq!(eeprom.read(), 0x11);
        assert_eq!(eeprom.address, 0);
    }
}
