// Host-filesystem bridge: sixteen I/O registers exposing open, close,
// stat, read, write, mkdir, rm and directory iteration to the guest OS.
// Paths come out of guest memory through the memory facade, get joined to
// the mounted root and normalised; anything resolving outside the root is
// refused. Status codes follow the guest OS ABI.

use crate::bus::{Device, MemOps};
use chrono::{DateTime, Datelike, Local, Timelike};
use std::fs::{File, OpenOptions, ReadDir};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const STATUS_SUCCESS: u8 = 0;
pub const STATUS_FAILURE: u8 = 1;
pub const STATUS_NO_SUCH_ENTRY: u8 = 4;
pub const STATUS_CANNOT_REGISTER_MORE: u8 = 20;
pub const STATUS_NO_MORE_ENTRIES: u8 = 21;
pub const STATUS_PENDING: u8 = 0xFF;

const OP_WHOAMI: u8 = 0;
const OP_OPEN: u8 = 1;
const OP_STAT: u8 = 2;
const OP_READ: u8 = 3;
const OP_WRITE: u8 = 4;
const OP_CLOSE: u8 = 5;
const OP_OPENDIR: u8 = 6;
const OP_READDIR: u8 = 7;
const OP_MKDIR: u8 = 8;
const OP_RM: u8 = 9;
const OP_LAST: u8 = OP_RM;

const OPERATION_REG: u16 = 0xF;
const STATUS_REG: usize = 0xF;

const MAX_OPENED_FILES: usize = 256;
const NAME_LENGTH: usize = 16;

// Offsets inside the guest file-descriptor structure
const FD_OFFSET: u16 = 8;
const FD_USER: u16 = 12;

// Open flags of the guest OS ABI
const FL_WRONLY: u8 = 1;
const FL_RDWR: u8 = 2;
const FL_TRUNC: u8 = 1 << 2;
const FL_APPEND: u8 = 2 << 2;
const FL_CREAT: u8 = 4 << 2;

const WHOAMI_ID: u8 = 0xD3;

enum Backing {
    File(File),
    Dir(ReadDir),
}

struct Descriptor {
    name: [u8; NAME_LENGTH],
    path: PathBuf,
    backing: Backing,
}

/// Outcome of one operation: the final status plus the argument-register
/// writes to apply, applied centrally by the dispatcher.
struct Reply {
    status: u8,
    writes: Vec<(usize, u8)>,
}

impl Reply {
    fn status(status: u8) -> Reply {
        Reply { status, writes: Vec::new() }
    }
}

pub struct HostFs {
    registers: [u8; 16],
    descriptors: Vec<Option<Descriptor>>,
    root: Option<PathBuf>,
    ops: MemOps,
}

impl HostFs {
    pub fn new(ops: MemOps) -> HostFs {
        HostFs {
            registers: [0; 16],
            descriptors: (0..MAX_OPENED_FILES).map(|_| None).collect(),
            root: None,
            ops,
        }
    }

    /// Mount a host directory as the guest-visible root.
    pub fn mount(&mut self, root: &Path) -> std::io::Result<()> {
        let resolved = std::fs::canonicalize(root)?;
        if !resolved.is_dir() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "root must be a directory"));
        }
        log::info!("[HOSTFS] {} mounted successfully", resolved.display());
        self.root = Some(resolved);
        Ok(())
    }

    fn reg16(&self, low: usize) -> u16 {
        (self.registers[low + 1] as u16) << 8 | self.registers[low] as u16
    }

    /// Read the NUL-terminated guest path from memory, join it to the root
    /// and normalise it. `..` pops a segment; a path popping past the root
    /// is refused.
    fn resolve_path(&self) -> Result<PathBuf, u8> {
        let root = self.root.as_ref().ok_or(STATUS_NO_SUCH_ENTRY)?;
        let mut addr = self.reg16(1);
        let mut raw = Vec::new();
        while raw.len() < 255 {
            let byte = self.ops.read_byte(addr);
            addr = addr.wrapping_add(1);
            if byte == 0 {
                break;
            }
            raw.push(byte);
        }
        let guest_path = String::from_utf8(raw).map_err(|_| STATUS_NO_SUCH_ENTRY)?;

        let mut resolved = root.clone();
        let mut depth = 0usize;
        for segment in guest_path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if depth == 0 {
                        log::warn!("[HOSTFS] invalid path {}", guest_path);
                        return Err(STATUS_NO_SUCH_ENTRY);
                    }
                    resolved.pop();
                    depth -= 1;
                }
                seg => {
                    resolved.push(seg);
                    depth += 1;
                }
            }
        }

        if !resolved.starts_with(root) {
            log::warn!("[HOSTFS] invalid path {}", guest_path);
            return Err(STATUS_NO_SUCH_ENTRY);
        }
        Ok(resolved)
    }

    /// Always make a file name 16 bytes big; longer names end with '~'.
    fn format_name(input: &str) -> [u8; NAME_LENGTH] {
        let mut out = [0u8; NAME_LENGTH];
        let bytes = input.as_bytes();
        if bytes.len() <= NAME_LENGTH {
            out[..bytes.len()].copy_from_slice(bytes);
        } else {
            out[..NAME_LENGTH - 1].copy_from_slice(&bytes[..NAME_LENGTH - 1]);
            out[NAME_LENGTH - 1] = b'~';
        }
        out
    }

    fn free_slot(&self) -> Option<usize> {
        self.descriptors.iter().position(|d| d.is_none())
    }

    fn whoami(&mut self) -> Reply {
        Reply::status(WHOAMI_ID)
    }

    fn register_dir(&mut self, path: PathBuf) -> Reply {
        let dir = match std::fs::read_dir(&path) {
            Ok(dir) => dir,
            Err(_) => return Reply::status(STATUS_NO_SUCH_ENTRY),
        };
        let slot = match self.free_slot() {
            Some(slot) => slot,
            None => return Reply::status(STATUS_CANNOT_REGISTER_MORE),
        };
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("/");
        self.descriptors[slot] = Some(Descriptor {
            name: HostFs::format_name(name),
            path,
            backing: Backing::Dir(dir),
        });
        Reply {
            status: STATUS_SUCCESS,
            // Descriptor index, then the "is a directory" marker
            writes: vec![(4, slot as u8), (5, 1)],
        }
    }

    fn open(&mut self) -> Reply {
        let path = match self.resolve_path() {
            Ok(path) => path,
            Err(status) => return Reply::status(status),
        };

        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return Reply::status(STATUS_NO_SUCH_ENTRY),
        };

        if meta.is_dir() {
            return self.register_dir(path);
        }

        let flags = self.registers[0];
        let mut options = OpenOptions::new();
        match flags & 0x3 {
            FL_WRONLY => options.write(true),
            FL_RDWR => options.read(true).write(true),
            _ => options.read(true),
        };
        if flags & FL_CREAT != 0 {
            options.create(true);
        }
        if flags & FL_TRUNC != 0 {
            options.write(true).truncate(true);
        }
        if flags & FL_APPEND != 0 {
            options.append(true);
        }

        let file = match options.open(&path) {
            Ok(file) => file,
            Err(_) => return Reply::status(STATUS_NO_SUCH_ENTRY),
        };
        let slot = match self.free_slot() {
            Some(slot) => slot,
            None => return Reply::status(STATUS_CANNOT_REGISTER_MORE),
        };
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        self.descriptors[slot] = Some(Descriptor {
            name: HostFs::format_name(name),
            path,
            backing: Backing::File(file),
        });
        let size = meta.len().min(u32::MAX as u64) as u32;
        Reply {
            status: STATUS_SUCCESS,
            writes: vec![
                (0, size as u8),
                (1, (size >> 8) as u8),
                (2, (size >> 16) as u8),
                (3, (size >> 24) as u8),
                (4, slot as u8),
                (5, 0),
            ],
        }
    }

    fn close(&mut self) -> Reply {
        let desc = self.registers[0] as usize;
        if desc >= MAX_OPENED_FILES || self.descriptors[desc].is_none() {
            return Reply::status(STATUS_FAILURE);
        }
        self.descriptors[desc] = None;
        Reply::status(STATUS_SUCCESS)
    }

    fn stat(&mut self) -> Reply {
        let struct_addr = self.reg16(0);
        let desc_idx = self.registers[2] as usize;
        let descriptor = match self.descriptors.get(desc_idx).and_then(|d| d.as_ref()) {
            Some(d) => d,
            None => return Reply::status(STATUS_NO_SUCH_ENTRY),
        };

        let meta = match std::fs::metadata(&descriptor.path) {
            Ok(meta) => meta,
            Err(_) => {
                log::error!("[HOSTFS] could not stat file");
                return Reply::status(STATUS_FAILURE);
            }
        };

        let size = meta.len().min(u32::MAX as u64) as u32;
        let mtime: DateTime<Local> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Local::now());
        let fields: [u32; 8] = [
            mtime.year() as u32 / 100,
            mtime.year() as u32 % 100,
            mtime.month(),
            mtime.day(),
            mtime.weekday().num_days_from_sunday(),
            mtime.hour(),
            mtime.minute(),
            mtime.second(),
        ];

        let mut reply = [0u8; 4 + 8 + NAME_LENGTH];
        reply[0..4].copy_from_slice(&size.to_le_bytes());
        for (i, f) in fields.iter().enumerate() {
            // BCD (hexadecimal representation)
            reply[4 + i] = (((f / 10) << 4) | (f % 10)) as u8;
        }
        reply[12..].copy_from_slice(&descriptor.name);

        // For files, the guest pointer designates the date field directly
        if matches!(descriptor.backing, Backing::Dir(_)) {
            self.ops.write_bytes(struct_addr, &reply);
        } else {
            self.ops.write_bytes(struct_addr, &reply[4..]);
        }
        Reply::status(STATUS_SUCCESS)
    }

    /// Seek the backing file to the 32-bit offset stored in the guest
    /// descriptor structure.
    fn seek_to_guest_offset(ops: &MemOps, struct_addr: u16, file: &mut File) {
        let mut offset = [0u8; 4];
        ops.read_bytes(struct_addr.wrapping_add(FD_OFFSET), &mut offset);
        let _ = file.seek(SeekFrom::Start(u32::from_le_bytes(offset) as u64));
    }

    fn read(&mut self) -> Reply {
        let struct_addr = self.reg16(0);
        let buffer_addr = self.reg16(2);
        let buffer_len = self.reg16(4);

        let desc_idx = self.ops.read_byte(struct_addr.wrapping_add(FD_USER)) as usize;
        let ops = self.ops.clone();
        let file = match self.descriptors.get_mut(desc_idx).and_then(|d| d.as_mut()) {
            Some(Descriptor { backing: Backing::File(file), .. }) => file,
            _ => return Reply::status(STATUS_FAILURE),
        };

        HostFs::seek_to_guest_offset(&ops, struct_addr, file);

        let mut chunk = [0u8; 1024];
        let mut remaining = buffer_len as usize;
        let mut total = 0usize;
        while remaining > 0 {
            let want = remaining.min(chunk.len());
            let got = match file.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => return Reply::status(STATUS_FAILURE),
            };
            ops.write_bytes(buffer_addr.wrapping_add(total as u16), &chunk[..got]);
            total += got;
            remaining -= got;
        }

        Reply {
            status: STATUS_SUCCESS,
            writes: vec![(4, total as u8), (5, (total >> 8) as u8)],
        }
    }

    fn write(&mut self) -> Reply {
        let struct_addr = self.reg16(0);
        let buffer_addr = self.reg16(2);
        let buffer_len = self.reg16(4);

        let desc_idx = self.ops.read_byte(struct_addr.wrapping_add(FD_USER)) as usize;
        let ops = self.ops.clone();
        let file = match self.descriptors.get_mut(desc_idx).and_then(|d| d.as_mut()) {
            Some(Descriptor { backing: Backing::File(file), .. }) => file,
            _ => return Reply::status(STATUS_FAILURE),
        };

        HostFs::seek_to_guest_offset(&ops, struct_addr, file);

        let mut chunk = [0u8; 1024];
        let mut remaining = buffer_len as usize;
        let mut total = 0usize;
        while remaining > 0 {
            let count = remaining.min(chunk.len());
            ops.read_bytes(buffer_addr.wrapping_add(total as u16), &mut chunk[..count]);
            if file.write_all(&chunk[..count]).is_err() {
                return Reply::status(STATUS_FAILURE);
            }
            total += count;
            remaining -= count;
        }

        Reply {
            status: STATUS_SUCCESS,
            writes: vec![(4, total as u8), (5, (total >> 8) as u8)],
        }
    }

    fn mkdir(&mut self) -> Reply {
        let path = match self.resolve_path() {
            Ok(path) => path,
            Err(_) => return Reply::status(STATUS_FAILURE),
        };
        match std::fs::create_dir(&path) {
            Ok(()) => Reply::status(STATUS_SUCCESS),
            Err(err) => {
                log::warn!("[HOSTFS] could not create directory: {}", err);
                Reply::status(STATUS_FAILURE)
            }
        }
    }

    fn rm(&mut self) -> Reply {
        let path = match self.resolve_path() {
            Ok(path) => path,
            Err(status) => return Reply::status(status),
        };
        let removed = std::fs::remove_file(&path).or_else(|_| std::fs::remove_dir(&path));
        match removed {
            Ok(()) => Reply::status(STATUS_SUCCESS),
            Err(_) => Reply::status(STATUS_FAILURE),
        }
    }

    fn opendir(&mut self) -> Reply {
        match self.resolve_path() {
            Ok(path) => self.register_dir(path),
            Err(status) => Reply::status(status),
        }
    }

    fn readdir(&mut self) -> Reply {
        let buffer_addr = self.reg16(0);
        let desc_idx = self.registers[2] as usize;
        let dir = match self.descriptors.get_mut(desc_idx).and_then(|d| d.as_mut()) {
            Some(Descriptor { backing: Backing::Dir(dir), .. }) => dir,
            _ => return Reply::status(STATUS_FAILURE),
        };

        // Look for the next regular file or directory
        let (name, is_file) = loop {
            let entry = match dir.next() {
                Some(Ok(entry)) => entry,
                Some(Err(_)) => continue,
                None => return Reply::status(STATUS_NO_MORE_ENTRIES),
            };
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_file() || file_type.is_dir() {
                break (entry.file_name(), file_type.is_file());
            }
        };

        let formatted = HostFs::format_name(name.to_str().unwrap_or(""));
        self.ops.write_byte(buffer_addr, is_file as u8);
        self.ops.write_bytes(buffer_addr.wrapping_add(1), &formatted);
        Reply::status(STATUS_SUCCESS)
    }

    fn handle_operation(&mut self, operation: u8) -> Reply {
        match operation {
            OP_WHOAMI => self.whoami(),
            OP_OPEN => self.open(),
            OP_CLOSE => self.close(),
            OP_STAT => self.stat(),
            OP_READ => self.read(),
            OP_WRITE => self.write(),
            OP_MKDIR => self.mkdir(),
            OP_RM => self.rm(),
            OP_OPENDIR => self.opendir(),
            OP_READDIR => self.readdir(),
            _ => Reply::status(STATUS_FAILURE),
        }
    }

    #[cfg(test)]
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.iter().filter(|d| d.is_some()).count()
    }
}

impl Device for HostFs {
    fn name(&self) -> &'static str {
        "hostfs_dev"
    }

    fn io_size(&self) -> u16 {
        0x10
    }

    fn io_read(&mut self, addr: u16) -> u8 {
        self.registers[(addr & 0xf) as usize]
    }

    fn io_write(&mut self, addr: u16, value: u8) {
        let addr = addr & 0xff;
        if addr == OPERATION_REG {
            if value <= OP_LAST {
                self.registers[STATUS_REG] = STATUS_PENDING;
                let reply = self.handle_operation(value);
                for (reg, val) in reply.writes {
                    self.registers[reg] = val;
                }
                self.registers[STATUS_REG] = reply.status;
            } else {
                log::error!("[HOSTFS] invalid operation 0x{:x}", value);
                self.registers[STATUS_REG] = STATUS_FAILURE;
            }
        } else if addr <= 7 {
            self.registers[addr as usize] = value;
        } else {
            log::error!("[HOSTFS] unknown register 0x{:x} write", addr);
        }
    }
}
