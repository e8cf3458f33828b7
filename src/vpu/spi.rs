// SPI controller of the video board and the TF card behind its chip
// select. A transaction is batched: the guest fills the write shift-RAM,
// programs the length and fires the start bit; the controller scans the
// outgoing bytes for an SD command frame, runs the card state machine and
// stages the response into the read shift-RAM. Block reads and writes use
// the standard data-token framing against a backing image file.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const SPI_RAM_LEN: usize = 8;
const SPI_VERSION: u8 = 1;

const REG_VERSION: u16 = 0;
const REG_CTRL: u16 = 1;
const REG_CLK_DIV: u16 = 2;
const REG_RAM_LEN: u16 = 3;
const REG_CHECKSUM: u16 = 4;
const REG_RAM_FIFO: u16 = 7;
const REG_RAM_FROM: u16 = 8;
const REG_RAM_TO: u16 = 15;

// Control register bits
const CTRL_START: u8 = 1 << 7;
const CTRL_RESET: u8 = 1 << 6;
const CTRL_CS_START: u8 = 1 << 5;
const CTRL_CS_END: u8 = 1 << 4;
const CTRL_CS_SEL: u8 = 1 << 3;

const TF_CMD_MASK: u8 = 0x40;
const TF_DATA_TOKEN: u8 = 0xFE;
const TF_BLK_SIZE: usize = 512;
/// Dummy + ACK + token bytes preceding the data of a block read.
const TF_BLK_DUMMY_BYTES: usize = 3;

const CMD_READ_BLK: u32 = 17;
const CMD_WRITE_BLK: u32 = 24;

// R1 response bits
const R1_IDLE: u8 = 1 << 0;
const R1_ILL_CMD: u8 = 1 << 2;
const R1_PARAM_ERR: u8 = 1 << 6;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TfState {
    Idle,
    Cmd55Received,
    ReadBlock,
    WriteBlockWaitTok,
    WriteBlock,
    WriteBlockSendResp,
}

impl TfState {
    fn is_write(self) -> bool {
        matches!(self, TfState::WriteBlockWaitTok | TfState::WriteBlock | TfState::WriteBlockSendResp)
    }
}

struct TfCard {
    state: TfState,
    img: Option<std::fs::File>,
    img_size: u64,
    /// Staged response bytes, also used as the receive buffer of a block
    /// write (reply_idx then counts received bytes).
    reply: [u8; 1024],
    reply_idx: usize,
    reply_len: usize,
}

impl TfCard {
    fn next_byte(&mut self) -> u8 {
        if self.reply_idx < self.reply_len {
            let byte = self.reply[self.reply_idx];
            self.reply_idx += 1;
            byte
        } else {
            0xFF
        }
    }

    fn r1_response(&mut self, r1: u8) {
        self.reply[0] = 0xFF;
        self.reply[1] = r1;
        self.reply_idx = 0;
        self.reply_len = 2;
    }
}

struct ShiftRam {
    data: [u8; SPI_RAM_LEN],
    idx: usize,
}

impl ShiftRam {
    fn new() -> ShiftRam {
        ShiftRam { data: [0; SPI_RAM_LEN], idx: 0 }
    }
}

pub struct Spi {
    clk_div: u8,
    ram_len: usize,
    ram_rd: ShiftRam,
    ram_wr: ShiftRam,
    /// High while the TF chip select line is asserted.
    tf_cs: bool,
    tf: TfCard,
}

impl Spi {
    pub fn new() -> Spi {
        let mut spi = Spi {
            clk_div: 0,
            ram_len: 0,
            ram_rd: ShiftRam::new(),
            ram_wr: ShiftRam::new(),
            tf_cs: false,
            tf: TfCard {
                state: TfState::Idle,
                img: None,
                img_size: 0,
                reply: [0; 1024],
                reply_idx: 0,
                reply_len: 0,
            },
        };
        spi.reset();
        spi
    }

    pub fn reset(&mut self) {
        self.clk_div = 10;
        self.ram_rd.idx = 0;
        self.ram_wr.idx = 0;
        self.ram_len = 0;
        self.tf_cs = false;
        self.tf.state = TfState::Idle;
    }

    /// Attach a TF card image, opened in read and write.
    pub fn load_tf_image(&mut self, path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        self.tf.img_size = file.metadata()?.len();
        self.tf.img = Some(file);
        log::info!("[TF] {} loaded successfully", path.display());
        Ok(())
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        match addr {
            REG_CTRL => {
                // Only the TF chip select (0) exists; CS_START wins over CS_END
                if value & CTRL_CS_SEL == 0 {
                    if value & CTRL_CS_START != 0 {
                        self.tf_cs = true;
                    } else if value & CTRL_CS_END != 0 {
                        self.tf_cs = false;
                        self.tf_deassert();
                    }
                }

                if value & CTRL_RESET != 0 {
                    self.clk_div = 2;
                    self.ram_len = 0;
                    self.ram_rd.idx = 0;
                    self.ram_wr.idx = 0;
                } else if value & CTRL_START != 0 && self.tf_cs {
                    self.tf_start();
                }
            }
            REG_CLK_DIV => {
                // The divider must never be 0
                self.clk_div = if value == 0 { 1 } else { value };
            }
            REG_RAM_LEN => {
                self.ram_len = (value & 0xf) as usize;
                if value & 0x80 != 0 {
                    self.ram_rd.idx = 0;
                    self.ram_wr.idx = 0;
                }
            }
            REG_RAM_FIFO => {
                let idx = self.ram_wr.idx;
                self.ram_wr.data[idx] = value;
                self.ram_wr.idx = (idx + 1) % SPI_RAM_LEN;
            }
            REG_RAM_FROM..=REG_RAM_TO => {
                self.ram_wr.data[(addr - REG_RAM_FROM) as usize] = value;
            }
            _ => {}
        }
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        match addr {
            REG_VERSION => SPI_VERSION,
            // The controller always reports the IDLE state
            REG_CTRL => 0,
            REG_CLK_DIV => self.clk_div,
            REG_RAM_LEN => self.ram_len as u8,
            REG_CHECKSUM => 0,
            REG_RAM_FIFO => {
                let data = self.ram_rd.data[self.ram_rd.idx];
                self.ram_rd.idx = (self.ram_rd.idx + 1) % SPI_RAM_LEN;
                data
            }
            REG_RAM_FROM..=REG_RAM_TO => self.ram_rd.data[(addr - REG_RAM_FROM) as usize],
            _ => 0,
        }
    }

    fn tf_deassert(&mut self) {
        if self.tf.state == TfState::ReadBlock || self.tf.state == TfState::WriteBlockSendResp {
            if self.tf.state == TfState::ReadBlock && self.tf.reply_idx != TF_BLK_SIZE + TF_BLK_DUMMY_BYTES {
                log::warn!(
                    "[TF] read block command did not read the whole block ({}/{})",
                    self.tf.reply_idx.saturating_sub(TF_BLK_DUMMY_BYTES),
                    TF_BLK_SIZE
                );
            }
            self.tf.state = TfState::Idle;
        }
    }

    fn process_command(&mut self, command: u32, param: u32) {
        let tf = &mut self.tf;
        match command {
            0 => {
                // Reset is always accepted
                tf.state = TfState::Idle;
                tf.r1_response(R1_IDLE);
            }
            8 => {
                // Voltage-range check, fixed 0x1AA echo
                tf.reply[..6].copy_from_slice(&[0xFF, R1_IDLE, 0x00, 0x00, 0x01, 0xAA]);
                tf.reply_idx = 0;
                tf.reply_len = 6;
            }
            16 => {
                // Block-size change, only 512 accepted
                if tf.state != TfState::Idle {
                    tf.r1_response(R1_IDLE | R1_ILL_CMD);
                } else if param != 512 {
                    log::error!("[TF] cannot set block size to another value than 512 bytes");
                    tf.r1_response(R1_IDLE | R1_PARAM_ERR);
                } else {
                    tf.r1_response(0);
                }
            }
            CMD_READ_BLK => {
                if tf.state != TfState::Idle {
                    tf.r1_response(R1_IDLE | R1_ILL_CMD);
                    return;
                }
                tf.state = TfState::ReadBlock;
                let offset = param as u64 * TF_BLK_SIZE as u64;
                let img = tf.img.as_mut().expect("transaction without image");
                if img.seek(SeekFrom::Start(offset)).is_err() {
                    log::error!("[TF] could not seek into image for reading");
                    tf.state = TfState::Idle;
                    tf.r1_response(R1_IDLE | R1_PARAM_ERR);
                    return;
                }
                tf.reply[0] = 0xFF; // dummy
                tf.reply[1] = 0x00; // ACK
                tf.reply[2] = TF_DATA_TOKEN;
                match img.read(&mut tf.reply[TF_BLK_DUMMY_BYTES..TF_BLK_DUMMY_BYTES + TF_BLK_SIZE]) {
                    Ok(n) if n < TF_BLK_SIZE => {
                        log::warn!("[TF] could only read {}/{} bytes from the image file", n, TF_BLK_SIZE)
                    }
                    Ok(_) => {}
                    Err(err) => log::error!("[TF] read failed on image: {}", err),
                }
                tf.reply_idx = 0;
                tf.reply_len = TF_BLK_SIZE + TF_BLK_DUMMY_BYTES;
            }
            CMD_WRITE_BLK => {
                if tf.state != TfState::Idle {
                    tf.r1_response(R1_IDLE | R1_ILL_CMD);
                    return;
                }
                tf.state = TfState::WriteBlockWaitTok;
                let offset = param as u64 * TF_BLK_SIZE as u64;
                if offset >= tf.img_size {
                    log::error!("[TF] invalid write offset: 0x{:x}/0x{:x}", offset, tf.img_size);
                    tf.r1_response(R1_IDLE | R1_PARAM_ERR);
                    tf.state = TfState::Idle;
                    return;
                }
                let img = tf.img.as_mut().expect("transaction without image");
                if img.seek(SeekFrom::Start(offset)).is_err() {
                    log::error!("[TF] could not seek into image for writing");
                    tf.r1_response(R1_IDLE | R1_PARAM_ERR);
                    tf.state = TfState::Idle;
                    return;
                }
                tf.reply[0] = 0xFF; // dummy
                tf.reply[1] = 0x00; // ACK
                tf.reply_idx = 0;
                tf.reply_len = 2;
            }
            55 => {
                // CMD55 is only accepted in IDLE
                if tf.state != TfState::Idle {
                    tf.r1_response(R1_IDLE | R1_ILL_CMD);
                } else {
                    tf.state = TfState::Cmd55Received;
                    tf.r1_response(R1_IDLE);
                }
            }
            41 => {
                // ACMD41 only directly after CMD55
                if tf.state == TfState::Cmd55Received {
                    tf.r1_response(0);
                } else {
                    tf.r1_response(R1_IDLE | R1_ILL_CMD);
                }
                tf.state = TfState::Idle;
            }
            59 => {
                // CRC enable/disable
                if tf.state != TfState::Idle {
                    tf.r1_response(R1_IDLE | R1_ILL_CMD);
                } else {
                    tf.r1_response(0);
                }
            }
            _ => {
                tf.r1_response(R1_IDLE | R1_ILL_CMD);
                tf.state = TfState::Idle;
            }
        }
    }

    /// Continue a block write: hunt for the data token, accumulate the 512
    /// data bytes plus CRC, flush the block, then serve the data response.
    fn tf_start_write(&mut self) {
        let length = self.ram_len;
        let mut i = 0;

        if self.tf.state == TfState::WriteBlockWaitTok {
            while i < length {
                let byte = self.ram_wr.data[i];
                i += 1;
                if byte == TF_DATA_TOKEN {
                    self.tf.reply_idx = 0;
                    self.tf.state = TfState::WriteBlock;
                    break;
                }
            }
        }

        if self.tf.state == TfState::WriteBlock {
            while i < length && self.tf.reply_idx < TF_BLK_SIZE + 2 {
                self.tf.reply[self.tf.reply_idx] = self.ram_wr.data[i];
                self.tf.reply_idx += 1;
                i += 1;
            }

            if self.tf.reply_idx == TF_BLK_SIZE + 2 {
                // Block and CRC received; the image was seeked by the command
                let img = self.tf.img.as_mut().expect("transaction without image");
                match img.write(&self.tf.reply[..TF_BLK_SIZE]) {
                    Ok(n) if n < TF_BLK_SIZE => {
                        log::warn!("[TF] could only write {}/{} bytes to the image file", n, TF_BLK_SIZE)
                    }
                    Ok(_) => {}
                    Err(err) => log::error!("[TF] write failed on image: {}", err),
                }
                self.tf.state = TfState::WriteBlockSendResp;
                self.tf.reply_idx = 0;
            }
        }

        if self.tf.state == TfState::WriteBlockSendResp {
            if self.tf.reply_idx == 0 && i < length {
                // Data response token
                self.ram_rd.data[i] = 0x05;
                i += 1;
                self.tf.reply_idx += 1;
            }
            if self.tf.reply_idx == 1 && i < length {
                // Busy flag
                self.ram_rd.data[i] = 0x00;
                i += 1;
                self.tf.reply_idx += 1;
            }
            if self.tf.reply_idx >= 2 && i < length {
                self.ram_rd.data[i..length].fill(0xFF);
            }
        }
    }

    /// Run one SPI transaction against the TF card.
    fn tf_start(&mut self) {
        let length = self.ram_len;
        if self.tf.img.is_none() {
            // No card mounted: the bus floats high
            self.ram_rd.data[..length].fill(0xFF);
            return;
        }
        if length > SPI_RAM_LEN {
            log::error!("[TF] length is bigger than the shift RAM");
            return;
        }

        if self.tf.state.is_write() {
            self.tf_start_write();
            return;
        }

        // Scan the outgoing bytes for a command marker (top bits 0b01),
        // draining the pending reply into the read RAM as we go
        let mut i = 0;
        while i < length {
            self.ram_rd.data[i] = self.tf.next_byte();
            if self.ram_wr.data[i] >> 6 == 0b01 {
                break;
            }
            i += 1;
        }

        if i == length {
            // No command in this transaction
            return;
        }

        if i + 5 >= self.ram_len {
            log::error!("[TF] parameters must be provided with the command");
            return;
        }

        let command = (self.ram_wr.data[i] & (TF_CMD_MASK - 1)) as u32;
        let param = (self.ram_wr.data[i + 1] as u32) << 24
            | (self.ram_wr.data[i + 2] as u32) << 16
            | (self.ram_wr.data[i + 3] as u32) << 8
            | self.ram_wr.data[i + 4] as u32;
        // CRC byte at i + 5 is ignored
        i += 6;

        self.process_command(command, param);
        while i < length {
            self.ram_rd.data[i] = self.tf.next_byte();
            i += 1;
        }
    }
}
