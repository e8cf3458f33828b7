// Video coprocessor through the machine: banked I/O, scroll latches, the
// raster clock, the text controller and the DMA engine.

use emz80::machine::{Machine, MachineConfig};
use emz80::us_to_tstates;

const IO_BASE: u16 = 0x80;
const REG_BANK: u16 = IO_BASE + 0x0E;
const CONF_BASE: u16 = IO_BASE + 0x10;
const BANK_BASE: u16 = IO_BASE + 0x20;

const BANK_TEXT: u8 = 0;
const BANK_DMA: u8 = 4;

// Text controller registers inside the banked window
const TEXT_PRINT: u16 = BANK_BASE;
const TEXT_CURSOR_Y: u16 = BANK_BASE + 1;
const TEXT_SCROLL_Y: u16 = BANK_BASE + 3;
const TEXT_CONTROL: u16 = BANK_BASE + 9;

fn machine() -> Machine {
    Machine::new(MachineConfig::default()).unwrap()
}

#[test]
fn identity_registers() {
    let mut m = machine();
    assert_eq!(m.io_read(IO_BASE), 0); // revision
    assert_eq!(m.io_read(IO_BASE + 1), 0); // minor
    assert_eq!(m.io_read(IO_BASE + 2), 1); // major
    m.io_write(IO_BASE + 0x08, 0x5A);
    assert_eq!(m.io_read(IO_BASE + 0x08), 0x5A);
}

#[test]
fn scroll_registers_latch_low_byte_first() {
    let mut m = machine();
    // Low byte alone does not change the register
    m.io_write(CONF_BASE + 0x06, 0x34);
    assert_eq!(m.io_read(CONF_BASE + 0x06), 0);
    // High byte commits the pair
    m.io_write(CONF_BASE + 0x07, 0x12);
    assert_eq!(m.io_read(CONF_BASE + 0x06), 0x34);
    assert_eq!(m.io_read(CONF_BASE + 0x07), 0x12);
}

#[test]
fn raster_phases_conserve_time() {
    let mut m = machine();
    let visible = us_to_tstates(15253.0);
    let vblank = us_to_tstates(1430.0);

    // Still in the visible phase just before the boundary
    for _ in 0..10 {
        m.tick_video(visible - 1);
        assert_eq!(m.io_read(CONF_BASE + 0x0D) & 0x02, 0);
        m.tick_video(1);
        assert_eq!(m.io_read(CONF_BASE + 0x0D) & 0x02, 0x02);
        assert!(m.take_need_render());

        m.tick_video(vblank - 1);
        assert_eq!(m.io_read(CONF_BASE + 0x0D) & 0x02, 0x02);
        m.tick_video(1);
        assert_eq!(m.io_read(CONF_BASE + 0x0D) & 0x02, 0);
        assert!(!m.take_need_render());
    }
}

#[test]
fn text_newlines_scroll_at_the_bottom() {
    let mut m = machine();
    m.io_write(REG_BANK, BANK_TEXT);
    // Arm auto-scroll-y
    m.io_write(TEXT_CONTROL, 1 << 4);
    for _ in 0..40 {
        m.io_write(TEXT_CONTROL, (1 << 4) | 1);
    }
    assert_eq!(m.io_read(TEXT_SCROLL_Y), 1);
    assert_eq!(m.io_read(TEXT_CURSOR_Y), 39);
}

#[test]
fn printed_characters_land_in_the_tilemap() {
    let mut m = machine();
    m.io_write(REG_BANK, BANK_TEXT);
    m.io_write(TEXT_PRINT, b'H');
    m.io_write(TEXT_PRINT, b'i');

    // Tilemaps are write-only for the CPU but visible to the debugger
    assert_eq!(m.phys_debug_read(0x100000), b'H');
    assert_eq!(m.phys_debug_read(0x100001), b'i');
    // The CPU-visible read stays 0
    assert_eq!(m.io_read(TEXT_CURSOR_Y), 0);
}

#[test]
fn text_mode_renders_cell_colors() {
    let mut m = machine();

    // Palette entry 1 = pure red in RGB565, committed low byte first
    m.phys_mem_write(0x100E02, 0x00);
    m.phys_mem_write(0x100E03, 0xF8);

    // Character 'A' with an empty glyph, background colour 1
    m.io_write(REG_BANK, BANK_TEXT);
    m.io_write(BANK_BASE + 5, 0x10); // colour register: bg 1, fg 0
    m.io_write(TEXT_PRINT, b'A');

    let mut frame = vec![0u32; 640 * 480];
    m.render_frame(&mut frame);
    // The whole first cell is background red
    assert_eq!(frame[0], 0xFF0000);
    assert_eq!(frame[7 + 11 * 640], 0xFF0000);
    // The neighbouring cell keeps palette entry 0 (black)
    assert_eq!(frame[8], 0x000000);
}

#[test]
fn bitmap_mode_renders_border_and_pixels() {
    let mut m = machine();
    // Palette entry 2 = pure blue, entry 3 = pure green
    m.phys_mem_write(0x100E04, 0x1F);
    m.phys_mem_write(0x100E05, 0x00);
    m.phys_mem_write(0x100E06, 0xE0);
    m.phys_mem_write(0x100E07, 0x07);

    // 256x240 bitmap mode: first pixel colour 3, border colour byte at the
    // end of the tileset picks colour 2
    m.io_write(CONF_BASE + 0x0C, 2);
    m.phys_mem_write(0x110000, 3);
    m.phys_mem_write(0x11FFFF, 2);

    let mut frame = vec![0u32; 640 * 480];
    m.render_frame(&mut frame);
    // Left border (32 logical pixels, doubled): blue
    assert_eq!(frame[0], 0x0000FF);
    // First bitmap pixel at logical x=32: green
    assert_eq!(frame[64], 0x00FF00);
}

#[test]
fn dma_descriptor_chain_copy() {
    let mut m = machine();

    // Source bytes at the start of RAM
    for i in 0..256u32 {
        m.phys_mem_write(0x080000 + i, (i % 256) as u8);
    }

    // One descriptor: rd=0x080000, wr=0x081000, length=256, last + INC/INC
    let desc: [u8; 12] = [
        0x00, 0x00, 0x08, // rd_addr
        0x00, 0x10, 0x08, // wr_addr
        0x00, 0x01, // length
        0x01, // flags: last, both INC
        0x00, 0x00, 0x00,
    ];
    let desc_addr = 0x082000u32;
    for (i, byte) in desc.iter().enumerate() {
        m.phys_mem_write(desc_addr + i as u32, *byte);
    }

    m.io_write(REG_BANK, BANK_DMA);
    m.io_write(BANK_BASE + 1, desc_addr as u8);
    m.io_write(BANK_BASE + 2, (desc_addr >> 8) as u8);
    m.io_write(BANK_BASE + 3, (desc_addr >> 16) as u8);
    m.io_write(BANK_BASE, 0x80);

    for i in 0..256u32 {
        assert_eq!(m.phys_debug_read(0x081000 + i), (i % 256) as u8);
    }
    // The descriptor pointer moved past the consumed descriptor
    assert_eq!(m.io_read(BANK_BASE + 1), (desc_addr + 12) as u8);
}

#[test]
fn dma_copies_into_video_memory() {
    let mut m = machine();
    m.phys_mem_write(0x080000, 0x77);

    // Copy one byte from RAM into the tileset
    let desc: [u8; 12] = [
        0x00, 0x00, 0x08, // rd_addr
        0x00, 0x00, 0x11, // wr_addr = tileset start
        0x01, 0x00, // length
        0x01, // flags: last
        0x00, 0x00, 0x00,
    ];
    for (i, byte) in desc.iter().enumerate() {
        m.phys_mem_write(0x082000 + i as u32, *byte);
    }

    m.io_write(REG_BANK, BANK_DMA);
    m.io_write(BANK_BASE + 1, 0x00);
    m.io_write(BANK_BASE + 2, 0x20);
    m.io_write(BANK_BASE + 3, 0x08);
    m.io_write(BANK_BASE, 0x80);

    assert_eq!(m.phys_debug_read(0x110000), 0x77);
}

#[test]
fn dma_hold_and_decrement_stepping() {
    let mut m = machine();
    m.phys_mem_write(0x080000, 0xAB);

    // rd HOLD, wr DEC, length 4: the single source byte lands on four
    // descending addresses
    let desc: [u8; 12] = [
        0x00, 0x00, 0x08, // rd_addr
        0x13, 0x10, 0x08, // wr_addr
        0x04, 0x00, // length
        0x01 | (2 << 1) | (1 << 3), // last, rd HOLD, wr DEC
        0x00, 0x00, 0x00,
    ];
    for (i, byte) in desc.iter().enumerate() {
        m.phys_mem_write(0x082000 + i as u32, *byte);
    }

    m.io_write(REG_BANK, BANK_DMA);
    m.io_write(BANK_BASE + 1, 0x00);
    m.io_write(BANK_BASE + 2, 0x20);
    m.io_write(BANK_BASE + 3, 0x08);
    m.io_write(BANK_BASE, 0x80);

    for i in 0..4u32 {
        assert_eq!(m.phys_debug_read(0x081010 + i), 0xAB);
    }
}
