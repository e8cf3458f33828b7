// Exercises the host-FS bridge through the machine: paths and buffers live
// in guest RAM, registers and commands go through the I/O ports.

use emz80::machine::{Machine, MachineConfig};
use std::io::Write;
use tempfile::TempDir;

const IO_BASE: u16 = 0xC0;
const OP_REG: u16 = IO_BASE + 0xF;

const OP_WHOAMI: u8 = 0;
const OP_OPEN: u8 = 1;
const OP_READ: u8 = 3;
const OP_WRITE: u8 = 4;
const OP_CLOSE: u8 = 5;
const OP_OPENDIR: u8 = 6;
const OP_READDIR: u8 = 7;
const OP_MKDIR: u8 = 8;

const STATUS_SUCCESS: u8 = 0;
const STATUS_FAILURE: u8 = 1;
const STATUS_NO_SUCH_ENTRY: u8 = 4;
const STATUS_NO_MORE_ENTRIES: u8 = 21;

/// Guest addresses used by the tests (mapped onto RAM below).
const PATH_ADDR: u16 = 0x8000;
const STRUCT_ADDR: u16 = 0x8100;
const BUFFER_ADDR: u16 = 0x8200;

fn machine_with_root(root: &TempDir) -> Machine {
    let mut machine = Machine::new(MachineConfig {
        hostfs_root: Some(root.path().to_path_buf()),
        ..MachineConfig::default()
    })
    .unwrap();
    // Map virtual page 2 onto the start of RAM
    machine.io_write(0xF2, 0x20);
    machine
}

fn put_path(machine: &mut Machine, path: &str) {
    for (i, byte) in path.as_bytes().iter().enumerate() {
        machine.mem_write(PATH_ADDR + i as u16, *byte);
    }
    machine.mem_write(PATH_ADDR + path.len() as u16, 0);
    machine.io_write(IO_BASE + 1, PATH_ADDR as u8);
    machine.io_write(IO_BASE + 2, (PATH_ADDR >> 8) as u8);
}

fn status(machine: &mut Machine) -> u8 {
    machine.io_read(OP_REG)
}

#[test]
fn whoami_returns_identification() {
    let root = TempDir::new().unwrap();
    let mut machine = machine_with_root(&root);
    machine.io_write(OP_REG, OP_WHOAMI);
    assert_eq!(status(&mut machine), 0xD3);
}

#[test]
fn path_escape_is_refused() {
    let root = TempDir::new().unwrap();
    let mut machine = machine_with_root(&root);

    put_path(&mut machine, "../../etc/passwd");
    machine.io_write(IO_BASE, 0); // read-only
    machine.io_write(OP_REG, OP_OPEN);
    assert_eq!(status(&mut machine), STATUS_NO_SUCH_ENTRY);

    // No descriptor was allocated
    machine.io_write(IO_BASE, 0);
    machine.io_write(OP_REG, OP_CLOSE);
    assert_eq!(status(&mut machine), STATUS_FAILURE);
}

#[test]
fn dotdot_inside_the_root_is_fine() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir(root.path().join("sub")).unwrap();
    std::fs::File::create(root.path().join("file.bin")).unwrap();
    let mut machine = machine_with_root(&root);

    put_path(&mut machine, "sub/../file.bin");
    machine.io_write(IO_BASE, 0);
    machine.io_write(OP_REG, OP_OPEN);
    assert_eq!(status(&mut machine), STATUS_SUCCESS);
}

#[test]
fn open_read_and_write_a_file() {
    let root = TempDir::new().unwrap();
    let mut file = std::fs::File::create(root.path().join("hello.txt")).unwrap();
    file.write_all(b"hello guest").unwrap();
    drop(file);

    let mut machine = machine_with_root(&root);

    // Open read/write
    put_path(&mut machine, "hello.txt");
    machine.io_write(IO_BASE, 2);
    machine.io_write(OP_REG, OP_OPEN);
    assert_eq!(status(&mut machine), STATUS_SUCCESS);
    // Size comes back in the first four registers, descriptor in r4
    assert_eq!(machine.io_read(IO_BASE), 11);
    assert_eq!(machine.io_read(IO_BASE + 5), 0);
    let desc = machine.io_read(IO_BASE + 4);

    // Build the guest descriptor structure: 32-bit offset at +8, context
    // byte at +12
    for i in 0..4 {
        machine.mem_write(STRUCT_ADDR + 8 + i, if i == 0 { 6 } else { 0 });
    }
    machine.mem_write(STRUCT_ADDR + 12, desc);

    // Read 5 bytes from offset 6
    machine.io_write(IO_BASE, STRUCT_ADDR as u8);
    machine.io_write(IO_BASE + 1, (STRUCT_ADDR >> 8) as u8);
    machine.io_write(IO_BASE + 2, BUFFER_ADDR as u8);
    machine.io_write(IO_BASE + 3, (BUFFER_ADDR >> 8) as u8);
    machine.io_write(IO_BASE + 4, 5);
    machine.io_write(IO_BASE + 5, 0);
    machine.io_write(OP_REG, OP_READ);
    assert_eq!(status(&mut machine), STATUS_SUCCESS);
    assert_eq!(machine.io_read(IO_BASE + 4), 5);
    let read: Vec<u8> = (0..5).map(|i| machine.debug_mem_read(BUFFER_ADDR + i)).collect();
    assert_eq!(&read, b"guest");

    // Overwrite the start of the file
    for (i, byte) in b"HELLO".iter().enumerate() {
        machine.mem_write(BUFFER_ADDR + i as u16, *byte);
    }
    machine.mem_write(STRUCT_ADDR + 8, 0);
    machine.io_write(IO_BASE, STRUCT_ADDR as u8);
    machine.io_write(IO_BASE + 1, (STRUCT_ADDR >> 8) as u8);
    machine.io_write(IO_BASE + 2, BUFFER_ADDR as u8);
    machine.io_write(IO_BASE + 3, (BUFFER_ADDR >> 8) as u8);
    machine.io_write(IO_BASE + 4, 5);
    machine.io_write(IO_BASE + 5, 0);
    machine.io_write(OP_REG, OP_WRITE);
    assert_eq!(status(&mut machine), STATUS_SUCCESS);

    machine.io_write(IO_BASE, desc);
    machine.io_write(OP_REG, OP_CLOSE);
    assert_eq!(status(&mut machine), STATUS_SUCCESS);

    assert_eq!(std::fs::read(root.path().join("hello.txt")).unwrap(), b"HELLO guest");
}

#[test]
fn mkdir_and_directory_iteration() {
    let root = TempDir::new().unwrap();
    std::fs::File::create(root.path().join("a.txt")).unwrap();
    let mut machine = machine_with_root(&root);

    put_path(&mut machine, "newdir");
    machine.io_write(OP_REG, OP_MKDIR);
    assert_eq!(status(&mut machine), STATUS_SUCCESS);
    assert!(root.path().join("newdir").is_dir());

    put_path(&mut machine, "");
    machine.io_write(OP_REG, OP_OPENDIR);
    assert_eq!(status(&mut machine), STATUS_SUCCESS);
    let desc = machine.io_read(IO_BASE + 4);
    // Directory marker
    assert_eq!(machine.io_read(IO_BASE + 5), 1);

    // Iterate: two entries then NO_MORE_ENTRIES
    let mut names = Vec::new();
    loop {
        machine.io_write(IO_BASE, BUFFER_ADDR as u8);
        machine.io_write(IO_BASE + 1, (BUFFER_ADDR >> 8) as u8);
        machine.io_write(IO_BASE + 2, desc);
        machine.io_write(OP_REG, OP_READDIR);
        match status(&mut machine) {
            STATUS_SUCCESS => {
                let is_file = machine.debug_mem_read(BUFFER_ADDR);
                let mut name = String::new();
                for i in 0..16 {
                    let byte = machine.debug_mem_read(BUFFER_ADDR + 1 + i);
                    if byte == 0 {
                        break;
                    }
                    name.push(byte as char);
                }
                names.push((name, is_file));
            }
            STATUS_NO_MORE_ENTRIES => break,
            other => panic!("unexpected status {}", other),
        }
    }
    names.sort();
    assert_eq!(names, vec![("a.txt".to_string(), 1), ("newdir".to_string(), 0)]);
}
