use emz80::bus::Device;
use emz80::compactflash::CompactFlash;
use std::io::Write;
use tempfile::NamedTempFile;

const REG_DATA: u16 = 0;
const REG_ERROR: u16 = 1;
const REG_SEC_CNT: u16 = 2;
const REG_LBA_0: u16 = 3;
const REG_LBA_24: u16 = 6;
const REG_COMMAND: u16 = 7;
const REG_STATUS: u16 = 7;

const STAT_DRQ: u8 = 1 << 3;
const STAT_ERR: u8 = 1 << 0;
const ERR_IDNF: u8 = 1 << 4;

fn image(megabytes: usize) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&vec![0u8; megabytes * 1024 * 1024]).unwrap();
    file.flush().unwrap();
    file
}

fn card(file: &NamedTempFile) -> CompactFlash {
    CompactFlash::new(file.path()).unwrap()
}

fn select_lba(cf: &mut CompactFlash, lba: u32, count: u8) {
    cf.io_write(REG_LBA_0, lba as u8);
    cf.io_write(REG_LBA_0 + 1, (lba >> 8) as u8);
    cf.io_write(REG_LBA_0 + 2, (lba >> 16) as u8);
    // LBA mode, master, top nibble of the address
    cf.io_write(REG_LBA_24, 0xE0 | ((lba >> 24) & 0xF) as u8);
    cf.io_write(REG_SEC_CNT, count);
}

#[test]
fn identify_exposes_signature_and_capacity() {
    let file = image(1);
    let mut cf = card(&file);
    cf.io_write(REG_COMMAND, 0xEC);
    assert_ne!(cf.io_read(REG_STATUS) & STAT_DRQ, 0);

    let mut block = [0u8; 512];
    for b in block.iter_mut() {
        *b = cf.io_read(REG_DATA);
    }
    // Data exhausted: DRQ drops
    assert_eq!(cf.io_read(REG_STATUS) & STAT_DRQ, 0);

    let word = |i: usize| block[i * 2] as u32 | (block[i * 2 + 1] as u32) << 8;
    assert_eq!(word(0), 0x848A);
    let total_sectors = 1024 * 1024 / 512;
    assert_eq!(word(60) | word(61) << 16, total_sectors);
}

#[test]
fn write_then_read_sector() {
    let file = image(1);
    let mut cf = card(&file);

    select_lba(&mut cf, 3, 1);
    cf.io_write(REG_COMMAND, 0x30);
    for i in 0..512u32 {
        cf.io_write(REG_DATA, (i % 251) as u8);
    }
    assert_eq!(cf.io_read(REG_STATUS) & STAT_DRQ, 0);

    select_lba(&mut cf, 3, 1);
    cf.io_write(REG_COMMAND, 0x20);
    for i in 0..512u32 {
        assert_eq!(cf.io_read(REG_DATA), (i % 251) as u8);
    }
}

#[test]
fn multi_sector_read_crosses_sectors() {
    let file = image(1);
    let mut cf = card(&file);

    // Two sectors with distinct first bytes
    for sector in [5u32, 6] {
        select_lba(&mut cf, sector, 1);
        cf.io_write(REG_COMMAND, 0x30);
        cf.io_write(REG_DATA, sector as u8);
        for _ in 1..512 {
            cf.io_write(REG_DATA, 0);
        }
    }

    select_lba(&mut cf, 5, 2);
    cf.io_write(REG_COMMAND, 0x20);
    assert_eq!(cf.io_read(REG_DATA), 5);
    for _ in 1..512 {
        cf.io_read(REG_DATA);
    }
    assert_eq!(cf.io_read(REG_DATA), 6);
}

#[test]
fn out_of_range_lba_sets_idnf() {
    let file = image(1);
    let mut cf = card(&file);
    select_lba(&mut cf, 0x10000, 1);
    cf.io_write(REG_COMMAND, 0x20);
    assert_ne!(cf.io_read(REG_STATUS) & STAT_ERR, 0);
    assert_ne!(cf.io_read(REG_ERROR) & ERR_IDNF, 0);
    assert_eq!(cf.io_read(REG_STATUS) & STAT_DRQ, 0);
}

#[test]
fn sector_count_zero_means_256() {
    let file = image(1);
    let mut cf = card(&file);
    select_lba(&mut cf, 0, 0);
    assert_eq!(cf.io_read(REG_SEC_CNT), 0);
}

#[test]
fn slave_reads_return_zero() {
    let file = image(1);
    let mut cf = card(&file);
    // Bit 4 of the top LBA byte selects the slave device
    cf.io_write(REG_LBA_24, 0xF0);
    assert_eq!(cf.io_read(REG_STATUS), 0);
}
