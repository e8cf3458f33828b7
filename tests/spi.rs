// TF card behind the SPI controller, driven the way the guest does it:
// batch the outgoing bytes into the write shift-RAM, fire a transaction,
// and drain the response from the read shift-RAM.

use emz80::vpu::spi::{Spi, SPI_RAM_LEN};
use std::io::Write;
use tempfile::NamedTempFile;

const REG_CTRL: u16 = 1;
const REG_RAM_LEN: u16 = 3;
const REG_RAM_FIFO: u16 = 7;

const CTRL_START: u8 = 1 << 7;
const CTRL_CS_START: u8 = 1 << 5;
const CTRL_CS_END: u8 = 1 << 4;

const BLOCK: usize = 512;

fn image(blocks: usize) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..blocks * BLOCK).map(|i| (i % 253) as u8).collect();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    file
}

fn card(file: &NamedTempFile) -> Spi {
    let mut spi = Spi::new();
    spi.load_tf_image(file.path()).unwrap();
    spi.write(REG_CTRL, CTRL_CS_START);
    spi
}

/// Run one 8-byte transaction and return what came back on the bus.
fn transact(spi: &mut Spi, out: &[u8]) -> Vec<u8> {
    assert!(out.len() <= SPI_RAM_LEN);
    spi.write(REG_RAM_LEN, out.len() as u8 | 0x80);
    for byte in out {
        spi.write(REG_RAM_FIFO, *byte);
    }
    spi.write(REG_CTRL, CTRL_START);
    (0..out.len()).map(|_| spi.read(REG_RAM_FIFO)).collect()
}

fn command(spi: &mut Spi, cmd: u8, param: u32) -> Vec<u8> {
    let frame = [
        0xFF,
        0x40 | cmd,
        (param >> 24) as u8,
        (param >> 16) as u8,
        (param >> 8) as u8,
        param as u8,
        0xFF, // CRC, ignored
        0xFF,
    ];
    transact(spi, &frame)
}

fn drain(spi: &mut Spi) -> Vec<u8> {
    transact(spi, &[0xFF; 8])
}

#[test]
fn reset_and_init_sequence() {
    let file = image(2);
    let mut spi = card(&file);

    command(&mut spi, 0, 0);
    // R1 with the idle bit, preceded by the pending dummy byte
    assert_eq!(drain(&mut spi)[0], 0x01);

    // Voltage check echoes 0x1AA
    command(&mut spi, 8, 0x1AA);
    let reply = drain(&mut spi);
    assert_eq!(&reply[0..5], &[0x01, 0x00, 0x00, 0x01, 0xAA]);

    // ACMD41 right after CMD55 leaves idle
    command(&mut spi, 55, 0);
    assert_eq!(drain(&mut spi)[0], 0x01);
    command(&mut spi, 41, 0);
    assert_eq!(drain(&mut spi)[0], 0x00);

    // CMD16 only accepts 512-byte blocks
    command(&mut spi, 16, 1024);
    assert_ne!(drain(&mut spi)[0] & (1 << 6), 0);
    command(&mut spi, 16, 512);
    assert_eq!(drain(&mut spi)[0], 0x00);
}

#[test]
fn block_read_follows_token_framing() {
    let file = image(2);
    let mut spi = card(&file);

    command(&mut spi, 17, 1);
    let mut stream = Vec::new();
    // dummy + ACK + token + 512 data bytes
    while stream.len() < 2 + BLOCK {
        let chunk = drain(&mut spi);
        stream.extend_from_slice(&chunk);
    }

    assert_eq!(stream[0], 0x00); // ACK
    assert_eq!(stream[1], 0xFE); // data token
    for (i, byte) in stream[2..2 + BLOCK].iter().enumerate() {
        assert_eq!(*byte, ((BLOCK + i) % 253) as u8);
    }

    spi.write(REG_CTRL, CTRL_CS_END);
    // The card accepts commands again once reselected
    spi.write(REG_CTRL, CTRL_CS_START);
    command(&mut spi, 0, 0);
    assert_eq!(drain(&mut spi)[0], 0x01);
}

#[test]
fn block_write_lands_in_the_image() {
    let file = image(2);
    let mut spi = card(&file);

    command(&mut spi, 24, 0);

    // Token, then 512 data bytes plus two CRC bytes
    let payload: Vec<u8> = (0..BLOCK).map(|i| (i % 7) as u8 + 1).collect();
    let mut outgoing = vec![0xFE];
    outgoing.extend_from_slice(&payload);
    outgoing.extend_from_slice(&[0x00, 0x00]);

    let mut responses = Vec::new();
    for chunk in outgoing.chunks(8) {
        responses.extend(transact(&mut spi, chunk));
    }
    responses.extend(drain(&mut spi));
    // The data-response token and the busy flag follow the last data byte
    let accepted = responses.windows(2).any(|w| w == [0x05, 0x00]);
    assert!(accepted, "no data response in {:02x?}", responses);

    spi.write(REG_CTRL, CTRL_CS_END);

    let content = std::fs::read(file.path()).unwrap();
    assert_eq!(&content[..BLOCK], &payload[..]);
    // The second block is untouched
    assert_eq!(content[BLOCK], (BLOCK % 253) as u8);
}

#[test]
fn no_card_floats_the_bus_high() {
    let mut spi = Spi::new();
    spi.write(REG_CTRL, CTRL_CS_START);
    let reply = command(&mut spi, 0, 0);
    assert!(reply.iter().all(|b| *b == 0xFF));
}
