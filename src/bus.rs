// The address-decoding fabric. Two spaces are decoded here: the 22-bit
// physical memory space (16 KiB granularity, one slot per page) and the
// 8-bit I/O space (byte granularity). Devices implement the Device trait
// and get registered into one or both maps; the CPU callbacks and the
// MemOps facade below are the only ways anything reaches a device region.

use crate::mmu::Mmu;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

/// Size of the physical memory space.
pub const MEM_SPACE_SIZE: u32 = 4 * 1024 * 1024;
/// Granularity of the memory space, i.e. the smallest page a device can own.
pub const MEM_SPACE_ALIGN: u32 = 16 * 1024;
/// Number of slots in the memory map.
pub const MEM_MAPPING_SIZE: usize = (MEM_SPACE_SIZE / MEM_SPACE_ALIGN) as usize;
/// Size of the I/O space.
pub const IO_MAPPING_SIZE: usize = 256;

pub type DeviceRef = Rc<RefCell<dyn Device>>;

/// Contract between the machine and every on-board device. A device may own
/// a memory region, an I/O region, or both; a region exists when the
/// corresponding size is non-zero. Addresses passed to the handlers are
/// relative to the start of the region. I/O handlers additionally receive
/// the upper byte of the 16-bit port address in the high byte of `addr`,
/// which devices like the MMU decode.
pub trait Device {
    fn name(&self) -> &'static str;

    fn mem_size(&self) -> u32 {
        0
    }
    fn io_size(&self) -> u16 {
        0
    }

    fn mem_read(&mut self, _addr: u32) -> u8 {
        0
    }
    fn mem_write(&mut self, _addr: u32, _data: u8) {}

    /// Same as `mem_read` but must stay valid for write-only areas and must
    /// not advance any device state (used by the debugger).
    fn mem_debug_read(&mut self, addr: u32) -> u8 {
        self.mem_read(addr)
    }

    fn io_read(&mut self, _addr: u16) -> u8 {
        0
    }
    fn io_write(&mut self, _addr: u16, _data: u8) {}

    fn reset(&mut self) {}
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("invalid region 0x{base:x} ({size} bytes)")]
    InvalidRegion { base: u32, size: u32 },
    #[error("region 0x{base:x} ({size} bytes) is not aligned to {align} bytes")]
    Misaligned { base: u32, size: u32, align: u32 },
    #[error("page {page} is already mapped to {owner}")]
    Overlap { page: usize, owner: &'static str },
}

struct MemEntry {
    dev: DeviceRef,
    page_from: usize,
}

struct IoEntry {
    dev: DeviceRef,
    base: u8,
}

/// The two decoded spaces plus the list of registered devices. The maps are
/// write-once at machine init; at runtime they are only read.
pub struct AddressSpace {
    mem_map: RefCell<Vec<Option<MemEntry>>>,
    io_map: RefCell<Vec<Option<IoEntry>>>,
    devices: RefCell<Vec<DeviceRef>>,
}

impl AddressSpace {
    pub fn new() -> Rc<AddressSpace> {
        Rc::new(AddressSpace {
            mem_map: RefCell::new((0..MEM_MAPPING_SIZE).map(|_| None).collect()),
            io_map: RefCell::new((0..IO_MAPPING_SIZE).map(|_| None).collect()),
            devices: RefCell::new(Vec::new()),
        })
    }

    /// Register a device's memory region at the given physical base address.
    /// The first owner of a page wins: on overlap the device is not
    /// installed and the conflict is reported.
    pub fn add_mem_device(&self, base: u32, dev: DeviceRef) -> Result<(), MapError> {
        let size = dev.borrow().mem_size();
        let name = dev.borrow().name();
        if size == 0 || base >= MEM_SPACE_SIZE || base + size > MEM_SPACE_SIZE {
            log::error!("[BUS] cannot register {}: invalid region 0x{:06x} ({} bytes)", name, base, size);
            return Err(MapError::InvalidRegion { base, size });
        }
        if base % MEM_SPACE_ALIGN != 0 || size % MEM_SPACE_ALIGN != 0 {
            log::error!("[BUS] cannot register {}: invalid alignment for region 0x{:06x} ({} bytes)", name, base, size);
            return Err(MapError::Misaligned { base, size, align: MEM_SPACE_ALIGN });
        }

        let start_page = (base / MEM_SPACE_ALIGN) as usize;
        let page_count = (size / MEM_SPACE_ALIGN) as usize;
        let mut map = self.mem_map.borrow_mut();

        for page in start_page..start_page + page_count {
            if let Some(entry) = &map[page] {
                let owner = entry.dev.borrow().name();
                log::error!("[BUS] cannot register {} in page {}, {} is already mapped", name, page, owner);
                return Err(MapError::Overlap { page, owner });
            }
        }
        for page in start_page..start_page + page_count {
            map[page] = Some(MemEntry { dev: Rc::clone(&dev), page_from: start_page });
        }
        self.track(dev);
        Ok(())
    }

    /// Register a device's I/O region at the given port base.
    pub fn add_io_device(&self, base: u8, dev: DeviceRef) -> Result<(), MapError> {
        let size = dev.borrow().io_size() as usize;
        let name = dev.borrow().name();
        let start = base as usize;
        if size == 0 || start + size > IO_MAPPING_SIZE {
            log::error!("[BUS] cannot register {}: invalid I/O region 0x{:02x} ({} bytes)", name, base, size);
            return Err(MapError::InvalidRegion { base: base as u32, size: size as u32 });
        }

        let mut map = self.io_map.borrow_mut();
        for port in start..start + size {
            if let Some(entry) = &map[port] {
                let owner = entry.dev.borrow().name();
                log::error!("[BUS] cannot register {} at port 0x{:02x}, {} is already mapped", name, port, owner);
                return Err(MapError::Overlap { page: port, owner });
            }
        }
        for port in start..start + size {
            map[port] = Some(IoEntry { dev: Rc::clone(&dev), base });
        }
        self.track(dev);
        Ok(())
    }

    fn track(&self, dev: DeviceRef) {
        let mut devices = self.devices.borrow_mut();
        if !devices.iter().any(|d| Rc::ptr_eq(d, &dev)) {
            devices.push(dev);
        }
    }

    /// Invoke the reset handler of every registered device.
    pub fn reset_devices(&self) {
        for dev in self.devices.borrow().iter() {
            dev.borrow_mut().reset();
        }
    }

    pub fn mem_read(&self, phys: u32) -> u8 {
        if phys >= MEM_SPACE_SIZE {
            log::info!("[BUS] invalid physical address memory read: 0x{:06x}", phys);
            return 0;
        }
        let page = (phys / MEM_SPACE_ALIGN) as usize;
        match &self.mem_map.borrow()[page] {
            Some(entry) => {
                let start = entry.page_from as u32 * MEM_SPACE_ALIGN;
                entry.dev.borrow_mut().mem_read(phys - start)
            }
            None => {
                log::info!("[BUS] no device replied to memory read: 0x{:06x}", phys);
                0
            }
        }
    }

    pub fn mem_write(&self, phys: u32, data: u8) {
        if phys >= MEM_SPACE_SIZE {
            log::info!("[BUS] invalid physical address memory write: 0x{:06x}", phys);
            return;
        }
        let page = (phys / MEM_SPACE_ALIGN) as usize;
        match &self.mem_map.borrow()[page] {
            Some(entry) => {
                let start = entry.page_from as u32 * MEM_SPACE_ALIGN;
                entry.dev.borrow_mut().mem_write(phys - start, data);
            }
            None => log::info!("[BUS] no device replied to memory write: 0x{:06x}", phys),
        }
    }

    /// Read for the debugger: write-only regions stay readable and no
    /// device state machine advances.
    pub fn mem_debug_read(&self, phys: u32) -> u8 {
        if phys >= MEM_SPACE_SIZE {
            return 0;
        }
        let page = (phys / MEM_SPACE_ALIGN) as usize;
        match &self.mem_map.borrow()[page] {
            Some(entry) => {
                let start = entry.page_from as u32 * MEM_SPACE_ALIGN;
                entry.dev.borrow_mut().mem_debug_read(phys - start)
            }
            None => 0,
        }
    }

    /// Dispatch an I/O read. Only the low byte decides the device; the
    /// upper byte travels with the relative address so devices can decode it.
    pub fn io_read(&self, port: u16) -> u8 {
        let low = (port & 0xff) as usize;
        match &self.io_map.borrow()[low] {
            Some(entry) => {
                let rel = (low as u8 - entry.base) as u16;
                entry.dev.borrow_mut().io_read((port & 0xff00) | rel)
            }
            None => {
                log::info!("[BUS] no device replied to I/O read: 0x{:02x}", low);
                0
            }
        }
    }

    pub fn io_write(&self, port: u16, data: u8) {
        let low = (port & 0xff) as usize;
        match &self.io_map.borrow()[low] {
            Some(entry) => {
                let rel = (low as u8 - entry.base) as u16;
                entry.dev.borrow_mut().io_write((port & 0xff00) | rel, data);
            }
            None => log::info!("[BUS] no device replied to I/O write: 0x{:02x}", low),
        }
    }
}

/// Memory operations handed to devices that reach memory outside their own
/// region (DMA engine, host-FS bridge). Virtual accesses are translated
/// through the MMU; physical accesses go straight to the memory map.
#[derive(Clone)]
pub struct MemOps {
    space: Rc<AddressSpace>,
    mmu: Rc<RefCell<Mmu>>,
}

impl MemOps {
    pub fn new(space: Rc<AddressSpace>, mmu: Rc<RefCell<Mmu>>) -> MemOps {
        MemOps { space, mmu }
    }

    pub fn read_byte(&self, addr: u16) -> u8 {
        self.space.mem_read(self.mmu.borrow().translate(addr))
    }

    pub fn write_byte(&self, addr: u16, data: u8) {
        self.space.mem_write(self.mmu.borrow().translate(addr), data);
    }

    pub fn read_bytes(&self, addr: u16, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_byte(addr.wrapping_add(i as u16));
        }
    }

    pub fn write_bytes(&self, addr: u16, buf: &[u8]) {
        for (i, b) in buf.iter().enumerate() {
            self.write_byte(addr.wrapping_add(i as u16), *b);
        }
    }

    pub fn phys_read_byte(&self, addr: u32) -> u8 {
        self.space.mem_read(addr)
    }

    pub fn phys_write_byte(&self, addr: u32, data: u8) {
        self.space.mem_write(addr, data);
    }

    pub fn phys_read_bytes(&self, addr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.space.mem_read(addr.wrapping_add(i as u32));
        }
    }
}

/// The bus as seen by the CPU core: byte-level memory and port callbacks.
pub struct Bus {
    space: Rc<AddressSpace>,
    mmu: Rc<RefCell<Mmu>>,
}

impl Bus {
    pub fn new(space: Rc<AddressSpace>, mmu: Rc<RefCell<Mmu>>) -> Bus {
        Bus { space, mmu }
    }
}

impl iz80::Machine for Bus {
    fn peek(&mut self, address: u16) -> u8 {
        self.space.mem_read(self.mmu.borrow().translate(address))
    }

    fn poke(&mut self, address: u16, value: u8) {
        self.space.mem_write(self.mmu.borrow().translate(address), value);
    }

    fn port_in(&mut self, address: u16) -> u8 {
        self.space.io_read(address)
    }

    fn port_out(&mut self, address: u16, value: u8) {
        self.space.io_write(address, value);
    }
}
