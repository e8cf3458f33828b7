// Software renderer: composes the visible frame out of video memory into a
// 640x480 RGB framebuffer for the host window. Text modes draw glyph cells
// from the font, graphics modes blend the two tile layers and overlay the
// sprites, bitmap modes copy the tileset as a linear image with a border.
// The half-resolution modes render pixel-doubled.

use crate::vpu::text::CursorInfo;
use crate::vpu::vram::{
    Vram, FONT_CHAR_HEIGHT, FONT_CHAR_WIDTH, SPRITE_COUNT, TILEMAP_COLUMNS, TILEMAP_LINES,
    TILE_HEIGHT, TILE_WIDTH,
};
use crate::vpu::{
    Vpu, MAX_RES_HEIGHT, MAX_RES_WIDTH, MODE_BITMAP_256, MODE_BITMAP_320, MODE_GFX_320_4BIT,
    MODE_GFX_320_8BIT, MODE_GFX_640_4BIT, MODE_TEXT_320, MODE_TEXT_640,
};

pub const FRAME_PIXELS: usize = MAX_RES_WIDTH * MAX_RES_HEIGHT;

#[inline]
fn put_scaled(frame: &mut [u32], x: usize, y: usize, scale: usize, color: u32) {
    let base = y * scale * MAX_RES_WIDTH + x * scale;
    for dy in 0..scale {
        let row = base + dy * MAX_RES_WIDTH;
        frame[row..row + scale].fill(color);
    }
}

/// Render the current frame.
pub fn render_frame(vpu: &mut Vpu, vram: &Vram, frame: &mut [u32]) {
    if !vpu.vid_ena() {
        frame.fill(0);
        return;
    }

    match vpu.mode {
        MODE_TEXT_640 | MODE_TEXT_320 => render_text_mode(vpu, vram, frame),
        MODE_BITMAP_256 | MODE_BITMAP_320 => render_bitmap_mode(vpu, vram, frame),
        _ => render_gfx_mode(vpu, vram, frame),
    }
}

fn draw_char(frame: &mut [u32], glyph: &[u8], col: usize, line: usize, scale: usize, bg: u32, fg: u32) {
    let x0 = col * FONT_CHAR_WIDTH;
    let y0 = line * FONT_CHAR_HEIGHT;
    for (row, pixels) in glyph.iter().enumerate().take(FONT_CHAR_HEIGHT) {
        for bit in 0..FONT_CHAR_WIDTH {
            // Bit 7 is the leftmost pixel of the character
            let lit = (pixels >> (FONT_CHAR_WIDTH - 1 - bit)) & 1 != 0;
            put_scaled(frame, x0 + bit, y0 + row, scale, if lit { fg } else { bg });
        }
    }
}

fn render_text_mode(vpu: &mut Vpu, vram: &Vram, frame: &mut [u32]) {
    let scale = if vpu.mode == MODE_TEXT_320 { 2 } else { 1 };
    let (total_cols, total_lines) = if vpu.mode == MODE_TEXT_320 { (40, 20) } else { (80, 40) };
    let info: CursorInfo = vpu.text.cursor_info();

    for line in 0..total_lines {
        for col in 0..total_cols {
            let (charidx, bg_idx, fg_idx);
            if info.shown && col == info.x as usize && line == info.y as usize {
                charidx = info.charidx;
                bg_idx = info.bg;
                fg_idx = info.fg;
            } else {
                let map_col = (col + info.scroll_x as usize) % TILEMAP_COLUMNS;
                let map_line = (line + info.scroll_y as usize) % TILEMAP_LINES;
                let index = map_line * TILEMAP_COLUMNS + map_col;
                charidx = vram.layer0[index];
                // The attribute byte carries two palette indexes
                let attrs = vram.layer1[index];
                bg_idx = (attrs >> 4) & 0xf;
                fg_idx = attrs & 0xf;
            }

            let bg = vram.palette.color(bg_idx);
            let fg = vram.palette.color(fg_idx);
            let glyph_start = charidx as usize * FONT_CHAR_HEIGHT;
            let glyph = &vram.font[glyph_start..glyph_start + FONT_CHAR_HEIGHT];
            draw_char(frame, glyph, col, line, scale, bg, fg);
        }
    }
}

fn render_gfx_mode(vpu: &mut Vpu, vram: &Vram, frame: &mut [u32]) {
    if vpu.mode == MODE_GFX_640_4BIT || vpu.mode == MODE_GFX_320_4BIT {
        log::warn!("[VPU] 4-bit graphics modes are not supported yet");
        return;
    }

    let half = vpu.mode == MODE_GFX_320_8BIT;
    let scale = if half { 2 } else { 1 };
    let (total_cols, total_lines) = if half { (20, 15) } else { (40, 30) };

    for line in 0..total_lines {
        for col in 0..total_cols {
            // Both layers take their own scroll into account, in tiles
            let l0_col = (col + vpu.l0_scroll_x as usize) % TILEMAP_COLUMNS;
            let l0_line = (line + vpu.l0_scroll_y as usize) % TILEMAP_LINES;
            let bg_tile = vram.layer0[l0_line * TILEMAP_COLUMNS + l0_col];
            let bg_pixels = vram.tile_pixels(bg_tile as u16);

            let l1_col = (col + vpu.l1_scroll_x as usize) % TILEMAP_COLUMNS;
            let l1_line = (line + vpu.l1_scroll_y as usize) % TILEMAP_LINES;
            let fg_tile = vram.layer1[l1_line * TILEMAP_COLUMNS + l1_col];
            let fg_pixels = vram.tile_pixels(fg_tile as u16);

            for y in 0..TILE_HEIGHT {
                for x in 0..TILE_WIDTH {
                    let fg = fg_pixels[y * TILE_WIDTH + x];
                    let index = if fg != 0 { fg } else { bg_pixels[y * TILE_WIDTH + x] };
                    put_scaled(
                        frame,
                        col * TILE_WIDTH + x,
                        line * TILE_HEIGHT + y,
                        scale,
                        vram.palette.color(index),
                    );
                }
            }
        }
    }

    render_sprites(vram, frame, scale);
}

fn render_sprites(vram: &Vram, frame: &mut [u32], scale: usize) {
    let screen_w = (MAX_RES_WIDTH / scale) as i32;
    let screen_h = (MAX_RES_HEIGHT / scale) as i32;

    for i in 0..SPRITE_COUNT {
        let spr = vram.sprite(i);
        // Sprite coordinates carry a +16 offset
        let sx = spr.x as i32 - 16;
        let sy = spr.y as i32 - 16;
        let spr_width = TILE_WIDTH as i32;
        let spr_height = if spr.height_32 { 32 } else { TILE_HEIGHT as i32 };
        if sx >= screen_w || sy >= screen_h || sx <= -spr_width || sy <= -spr_height {
            continue;
        }

        // Clip against the screen edges
        let mut src_x = 0;
        let mut src_y = 0;
        let mut dst_x = sx;
        let mut dst_y = sy;
        if dst_x < 0 {
            src_x = -dst_x;
            dst_x = 0;
        }
        if dst_y < 0 {
            src_y = -dst_y;
            dst_y = 0;
        }
        let mut draw_w = spr_width - src_x;
        let mut draw_h = spr_height - src_y;
        if dst_x + draw_w > screen_w {
            draw_w = screen_w - dst_x;
        }
        if dst_y + draw_h > screen_h {
            draw_h = screen_h - dst_y;
        }

        let pixels = vram.tile_pixels(spr.tile_number);
        for y in 0..draw_h {
            let mut src_line = src_y + y;
            if spr.flip_y {
                src_line = (spr_height - 1) - src_line;
            }
            // A 16x32 sprite spans two consecutive tiles
            let row = if src_line >= TILE_HEIGHT as i32 {
                let next = vram.tile_pixels(spr.tile_number.wrapping_add(1));
                &next[(src_line as usize - TILE_HEIGHT) * TILE_WIDTH..][..TILE_WIDTH]
            } else {
                &pixels[src_line as usize * TILE_WIDTH..][..TILE_WIDTH]
            };

            for x in 0..draw_w {
                let mut src_col = src_x + x;
                if spr.flip_x {
                    src_col = (spr_width - 1) - src_col;
                }
                let pixel = row[src_col as usize];
                // Colour index 0 is transparent
                if pixel == 0 {
                    continue;
                }
                put_scaled(
                    frame,
                    (dst_x + x) as usize,
                    (dst_y + y) as usize,
                    scale,
                    vram.palette.color(pixel),
                );
            }
        }
    }
}

fn render_bitmap_mode(vpu: &mut Vpu, vram: &Vram, frame: &mut [u32]) {
    // Bitmap modes run at half the maximum resolution
    let screen_w = MAX_RES_WIDTH / 2;
    let screen_h = MAX_RES_HEIGHT / 2;
    let (width, height) = if vpu.mode == MODE_BITMAP_256 { (256, 240) } else { (320, 200) };
    let border_x = (screen_w - width) / 2;
    let border_y = (screen_h - height) / 2;

    // The last tileset entry is the border colour
    let border = vram.palette.color(vram.tileset[vram.tileset.len() - 1]);
    for y in 0..screen_h {
        for x in 0..screen_w {
            put_scaled(frame, x, y, 2, border);
        }
    }

    for y in 0..height {
        for x in 0..width {
            let index = vram.tileset[y * width + x];
            put_scaled(frame, x + border_x, y + border_y, 2, vram.palette.color(index));
        }
    }
}
