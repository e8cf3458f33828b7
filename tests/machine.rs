use emz80::bus::{AddressSpace, Device, MapError};
use emz80::machine::{Machine, MachineConfig};
use std::cell::RefCell;
use std::rc::Rc;

struct TestRam {
    name: &'static str,
    size: u32,
    data: Vec<u8>,
}

impl TestRam {
    fn new(name: &'static str, size: u32) -> Rc<RefCell<TestRam>> {
        Rc::new(RefCell::new(TestRam { name, size, data: vec![0; size as usize] }))
    }
}

impl Device for TestRam {
    fn name(&self) -> &'static str {
        self.name
    }
    fn mem_size(&self) -> u32 {
        self.size
    }
    fn mem_read(&mut self, addr: u32) -> u8 {
        self.data[addr as usize]
    }
    fn mem_write(&mut self, addr: u32, data: u8) {
        self.data[addr as usize] = data;
    }
}

#[test]
fn device_receives_region_relative_offsets() {
    let space = AddressSpace::new();
    let ram = TestRam::new("a", 0x8000);
    space.add_mem_device(0x080000, ram.clone()).unwrap();

    space.mem_write(0x080000, 0x11);
    space.mem_write(0x084321, 0x22);
    assert_eq!(ram.borrow().data[0x0000], 0x11);
    assert_eq!(ram.borrow().data[0x4321], 0x22);
    assert_eq!(space.mem_read(0x084321), 0x22);
}

#[test]
fn unmapped_memory_reads_zero_and_ignores_writes() {
    let space = AddressSpace::new();
    assert_eq!(space.mem_read(0x200000), 0);
    space.mem_write(0x200000, 0xAA);
    assert_eq!(space.mem_read(0x200000), 0);
    // Out of the physical space entirely
    assert_eq!(space.mem_read(0x400000), 0);
}

#[test]
fn registration_rejects_misalignment_and_overlap() {
    let space = AddressSpace::new();
    let a = TestRam::new("a", 0x4000);
    let b = TestRam::new("b", 0x8000);
    let c = TestRam::new("c", 0x1000);

    assert!(space.add_mem_device(0x000000, a).is_ok());
    // Overlaps the first page: first owner wins
    assert!(matches!(space.add_mem_device(0x000000, b.clone()), Err(MapError::Overlap { .. })));
    assert_eq!(space.mem_read(0x000000), 0);
    // Unaligned base and unaligned size
    assert!(matches!(space.add_mem_device(0x1000, c.clone()), Err(MapError::Misaligned { .. })));
    assert!(matches!(space.add_mem_device(0x4000, c), Err(MapError::Misaligned { .. })));
    // Crossing the end of the space
    assert!(matches!(space.add_mem_device(0x3FC000, b), Err(MapError::InvalidRegion { .. })));
}

#[test]
fn mmu_pages_route_cpu_addresses() {
    let mut machine = Machine::new(MachineConfig::default()).unwrap();

    // Map virtual page 2 onto the start of RAM (physical page 0x20)
    machine.io_write(0xF2, 0x20);
    machine.mem_write(0x8000, 0x5A);
    assert_eq!(machine.phys_debug_read(0x080000), 0x5A);
    assert_eq!(machine.debug_mem_read(0x8000), 0x5A);

    // Page registers read back through the upper I/O address byte
    assert_eq!(machine.io_read(0x80F0), 0x20);
}

#[test]
fn mmu_reset_keeps_upper_pages() {
    let mut machine = Machine::new(MachineConfig::default()).unwrap();
    machine.io_write(0xF0, 0x01);
    machine.io_write(0xF3, 0x22);
    machine.reset();
    assert_eq!(machine.io_read(0x00F0), 0x00);
    assert_eq!(machine.io_read(0xC0F0), 0x22);
}

#[test]
fn unmapped_io_reads_zero() {
    let mut machine = Machine::new(MachineConfig::default()).unwrap();
    assert_eq!(machine.io_read(0x0010), 0);
    machine.io_write(0x0010, 0xFF);
}
