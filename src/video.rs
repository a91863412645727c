use crate::gba::{
    raise_interrupt, IrqBits, LCD_STATUS_HBLANK_FLAG, LCD_STATUS_HBLANK_IRQ_ENABLE,
    LCD_STATUS_VBLANK_FLAG, LCD_STATUS_VBLANK_IRQ_ENABLE, LCD_STATUS_VCOUNT_IRQ_ENABLE,
    LCD_STATUS_VCOUNT_MATCH_FLAG, REG_BG0_CONTROL, REG_BG0_X_OFFSET, REG_BG0_Y_OFFSET,
    REG_BG2_CONTROL, REG_BG2_PARAM_A, REG_BG2_X_REF, REG_BG3_PARAM_A, REG_BG3_X_REF,
    REG_BLEND_ALPHA, REG_BLEND_BRIGHTNESS, REG_BLEND_CONTROL, REG_LCD_CONTROL, REG_LCD_STATUS,
    REG_VERTICAL_COUNT, REG_WIN0_H, REG_WIN0_V, REG_WIN1_H, REG_WIN1_V, REG_WINDOW_INSIDE,
    REG_WINDOW_OUTSIDE,
};
use crate::memory::Bus;
use std::sync::{Arc, Mutex};

pub const FRAME_WIDTH: usize = 240;
pub const FRAME_HEIGHT: usize = 160;

pub const CYCLES_PER_SCANLINE: u64 = 1232;
pub const HBLANK_CYCLES: u64 = 272;
pub const VBLANK_SCANLINE: u32 = 160;
pub const LAST_SCANLINE: u32 = 227;

const TILE_SIZE: usize = 8;
const TILE_4BPP_BYTES: usize = 32;
const TILE_8BPP_BYTES: usize = 64;

/// Bit 15 of a buffered color marks the pixel as opaque.
pub const ENABLE_PIXEL: u16 = 0x8000;

const SOURCE_BG0: usize = 0;
const SOURCE_BG1: usize = 1;
const SOURCE_BG2: usize = 2;
const SOURCE_BG3: usize = 3;
const SOURCE_OBJ: usize = 4;
const SOURCE_BACKDROP: usize = 5;

// Resolution order inside one priority level: the object layer wins over
// backgrounds, lower-numbered backgrounds win over higher ones.
const SOURCE_ORDER: [usize; 5] = [SOURCE_OBJ, SOURCE_BG0, SOURCE_BG1, SOURCE_BG2, SOURCE_BG3];

#[derive(Copy, Clone)]
struct WindowControl {
    layers: [bool; 5],
    effects: bool,
}

impl WindowControl {
    fn from_bits(bits: u16) -> Self {
        WindowControl {
            layers: [
                bits & 0x01 != 0,
                bits & 0x02 != 0,
                bits & 0x04 != 0,
                bits & 0x08 != 0,
                bits & 0x10 != 0,
            ],
            effects: bits & 0x20 != 0,
        }
    }
}

/// Per-scanline rasterizer. All scanline state lives in fixed arrays that
/// are cleared at line start and resolved at line end.
pub struct Gpu {
    pub frame: Arc<Mutex<Vec<u16>>>,
    scanline: [u16; FRAME_WIDTH],
    effects: [u16; FRAME_WIDTH],
    obj_window: [bool; FRAME_WIDTH],
    semi_transparent: [bool; FRAME_WIDTH],
    layers: [[[u16; 6]; 4]; FRAME_WIDTH],
}

impl Gpu {
    pub fn new(frame: Arc<Mutex<Vec<u16>>>) -> Self {
        Gpu {
            frame,
            scanline: [0; FRAME_WIDTH],
            effects: [0; FRAME_WIDTH],
            obj_window: [false; FRAME_WIDTH],
            semi_transparent: [false; FRAME_WIDTH],
            layers: [[[0; 6]; 4]; FRAME_WIDTH],
        }
    }

    /// Advance the scanline state machine by the tick that just elapsed.
    pub fn cycle(&mut self, bus: &mut Bus, cycle_count: u64) {
        let into_line = cycle_count % CYCLES_PER_SCANLINE;
        if into_line == 0 {
            self.complete_scanline(bus);
            let status = bus.io_half(REG_LCD_STATUS) & !LCD_STATUS_HBLANK_FLAG;
            bus.set_io_half(REG_LCD_STATUS, status);
        } else if into_line == CYCLES_PER_SCANLINE - HBLANK_CYCLES {
            let status = bus.io_half(REG_LCD_STATUS) | LCD_STATUS_HBLANK_FLAG;
            bus.set_io_half(REG_LCD_STATUS, status);
            if status & LCD_STATUS_HBLANK_IRQ_ENABLE != 0 {
                raise_interrupt(bus, IrqBits::HBLANK);
            }
        }
    }

    fn complete_scanline(&mut self, bus: &mut Bus) {
        let line = bus.io_byte(REG_VERTICAL_COUNT) as u32;
        let mut status = bus.io_half(REG_LCD_STATUS);

        let match_target = (status >> 8) as u32;
        if line == match_target {
            status |= LCD_STATUS_VCOUNT_MATCH_FLAG;
            bus.set_io_half(REG_LCD_STATUS, status);
            if status & LCD_STATUS_VCOUNT_IRQ_ENABLE != 0 {
                raise_interrupt(bus, IrqBits::VCOUNT);
            }
        } else if status & LCD_STATUS_VCOUNT_MATCH_FLAG != 0 {
            status &= !LCD_STATUS_VCOUNT_MATCH_FLAG;
            bus.set_io_half(REG_LCD_STATUS, status);
        }

        if line == VBLANK_SCANLINE {
            status |= LCD_STATUS_VBLANK_FLAG;
            bus.set_io_half(REG_LCD_STATUS, status);
            if status & LCD_STATUS_VBLANK_IRQ_ENABLE != 0 {
                raise_interrupt(bus, IrqBits::VBLANK);
            }
        }

        if line < VBLANK_SCANLINE {
            self.render_scanline(bus, line);
        }

        if line == 226 {
            status &= !LCD_STATUS_VBLANK_FLAG;
            bus.set_io_half(REG_LCD_STATUS, status);
        }

        let next = if line == LAST_SCANLINE { 0 } else { line + 1 };
        bus.set_io_byte(REG_VERTICAL_COUNT, next as u8);
    }

    pub fn render_scanline(&mut self, bus: &Bus, line: u32) {
        self.clear_buffers();

        let backdrop = backdrop_color(bus);
        for pixel in self.scanline.iter_mut() {
            *pixel = backdrop;
        }

        self.render_backgrounds(bus, line);
        self.render_objects(bus, line);
        self.apply_window_to_layers(bus, line);
        self.apply_special_effects(bus);
        self.apply_window_to_effects(bus, line);
        self.resolve_scanline();

        let offset = line as usize * FRAME_WIDTH;
        let mut frame = self.frame.lock().expect("frame buffer poisoned");
        frame[offset..offset + FRAME_WIDTH].copy_from_slice(&self.scanline);
    }

    fn clear_buffers(&mut self) {
        self.scanline = [0; FRAME_WIDTH];
        self.effects = [0; FRAME_WIDTH];
        self.obj_window = [false; FRAME_WIDTH];
        self.semi_transparent = [false; FRAME_WIDTH];
        self.layers = [[[0; 6]; 4]; FRAME_WIDTH];
    }

    fn render_backgrounds(&mut self, bus: &Bus, line: u32) {
        let disp = bus.io_half(REG_LCD_CONTROL);
        let mode = disp & 0x7;
        for bg in 0..4 {
            if disp & (1 << (8 + bg)) == 0 {
                continue;
            }
            match (mode, bg) {
                (0, _) => self.render_text_background(bus, line, bg),
                (1, 0) | (1, 1) => self.render_text_background(bus, line, bg),
                (1, 2) => self.render_affine_background(bus, line, bg),
                (2, 2) | (2, 3) => self.render_affine_background(bus, line, bg),
                (3, 2) | (4, 2) | (5, 2) => self.render_bitmap_background(bus, line, mode),
                _ => {}
            }
        }
    }

    fn render_text_background(&mut self, bus: &Bus, line: u32, bg: usize) {
        let control = bus.io_half(REG_BG0_CONTROL + 2 * bg as u32);
        let priority = (control & 0x3) as usize;
        let char_base = ((control >> 2) & 0x3) as usize * 0x4000;
        let is_256_color = control & (1 << 7) != 0;
        let screen_base = ((control >> 8) & 0x1f) as usize * 0x800;
        let (width_tiles, height_tiles): (usize, usize) = match (control >> 14) & 0x3 {
            0 => (32, 32),
            1 => (64, 32),
            2 => (32, 64),
            _ => (64, 64),
        };
        let width_px = width_tiles * TILE_SIZE;
        let height_px = height_tiles * TILE_SIZE;
        let scroll_x = (bus.io_half(REG_BG0_X_OFFSET + 4 * bg as u32) & 0x1ff) as usize;
        let scroll_y = (bus.io_half(REG_BG0_Y_OFFSET + 4 * bg as u32) & 0x1ff) as usize;

        for x in 0..FRAME_WIDTH {
            let texture_x = (x + scroll_x) % width_px;
            let texture_y = (line as usize + scroll_y) % height_px;
            let tile_x = texture_x / TILE_SIZE;
            let tile_y = texture_y / TILE_SIZE;
            let mut in_tile_x = texture_x % TILE_SIZE;
            let mut in_tile_y = texture_y % TILE_SIZE;

            // Screen maps larger than 256 pixels split into 32x32 blocks.
            let block = if width_tiles == height_tiles {
                (tile_y / 32) * (width_tiles / 32) + tile_x / 32
            } else if width_tiles > height_tiles {
                tile_x / 32
            } else {
                tile_y / 32
            };
            let entry_offset = screen_base + block * 0x800 + ((tile_y % 32) * 32 + tile_x % 32) * 2;
            let entry = vram_half(bus, entry_offset);
            let tile_index = (entry & 0x3ff) as usize;
            if entry & 0x400 != 0 {
                in_tile_x = TILE_SIZE - 1 - in_tile_x;
            }
            if entry & 0x800 != 0 {
                in_tile_y = TILE_SIZE - 1 - in_tile_y;
            }

            let palette_index = if is_256_color {
                vram_byte(bus, char_base + tile_index * TILE_8BPP_BYTES + in_tile_y * TILE_SIZE + in_tile_x)
                    as usize
            } else {
                let pair = vram_byte(
                    bus,
                    char_base + tile_index * TILE_4BPP_BYTES + in_tile_y * TILE_SIZE / 2 + in_tile_x / 2,
                );
                let nibble = if in_tile_x % 2 == 0 { pair & 0xf } else { pair >> 4 };
                if nibble == 0 {
                    continue;
                }
                ((entry >> 12) & 0xf) as usize * 16 + nibble as usize
            };
            if palette_index == 0 {
                continue;
            }
            self.layers[x][priority][bg] = palette_color(bus, palette_index) | ENABLE_PIXEL;
        }
    }

    fn render_affine_background(&mut self, bus: &Bus, line: u32, bg: usize) {
        let control = bus.io_half(REG_BG0_CONTROL + 2 * bg as u32);
        let priority = (control & 0x3) as usize;
        let char_base = ((control >> 2) & 0x3) as usize * 0x4000;
        let screen_base = ((control >> 8) & 0x1f) as usize * 0x800;
        let width_tiles = 16usize << ((control >> 14) & 0x3);
        let width_px = (width_tiles * TILE_SIZE) as i32;

        let (param_base, ref_base) = if bg == 2 {
            (REG_BG2_PARAM_A, REG_BG2_X_REF)
        } else {
            (REG_BG3_PARAM_A, REG_BG3_X_REF)
        };
        let pa = bus.io_half(param_base) as i16 as i32;
        let pb = bus.io_half(param_base + 2) as i16 as i32;
        let pc = bus.io_half(param_base + 4) as i16 as i32;
        let pd = bus.io_half(param_base + 6) as i16 as i32;
        // Reference points are 28-bit signed fixed point with 8 fractional bits.
        let ref_x = ((bus.io_word(ref_base) << 4) as i32) >> 4;
        let ref_y = ((bus.io_word(ref_base + 4) << 4) as i32) >> 4;

        let line = line as i32;
        for x in 0..FRAME_WIDTH {
            let texture_x = (ref_x + pa * x as i32 + pb * line) >> 8;
            let texture_y = (ref_y + pc * x as i32 + pd * line) >> 8;
            if texture_x < 0 || texture_x >= width_px || texture_y < 0 || texture_y >= width_px {
                continue;
            }
            let tile_x = texture_x as usize / TILE_SIZE;
            let tile_y = texture_y as usize / TILE_SIZE;
            // One byte per map entry, tiles are always 256-color.
            let tile_index = vram_byte(bus, screen_base + tile_y * width_tiles + tile_x) as usize;
            let palette_index = vram_byte(
                bus,
                char_base
                    + tile_index * TILE_8BPP_BYTES
                    + (texture_y as usize % TILE_SIZE) * TILE_SIZE
                    + texture_x as usize % TILE_SIZE,
            ) as usize;
            if palette_index == 0 {
                continue;
            }
            self.layers[x][priority][bg] = palette_color(bus, palette_index) | ENABLE_PIXEL;
        }
    }

    fn render_bitmap_background(&mut self, bus: &Bus, line: u32, mode: u16) {
        let disp = bus.io_half(REG_LCD_CONTROL);
        let control = bus.io_half(REG_BG2_CONTROL);
        let priority = (control & 0x3) as usize;
        let frame_base = if disp & (1 << 4) != 0 { 0xa000 } else { 0 };
        let line = line as usize;

        match mode {
            // Full-screen 16-bit direct color.
            3 => {
                for x in 0..FRAME_WIDTH {
                    let color = vram_half(bus, (line * FRAME_WIDTH + x) * 2);
                    self.layers[x][priority][SOURCE_BG2] = color | ENABLE_PIXEL;
                }
            }
            // Paletted full-screen bitmap with two page-flip frames.
            4 => {
                for x in 0..FRAME_WIDTH {
                    let palette_index = vram_byte(bus, frame_base + line * FRAME_WIDTH + x) as usize;
                    if palette_index == 0 {
                        continue;
                    }
                    self.layers[x][priority][SOURCE_BG2] =
                        palette_color(bus, palette_index) | ENABLE_PIXEL;
                }
            }
            // 160x128 direct color with two page-flip frames.
            _ => {
                if line >= 128 {
                    return;
                }
                for x in 0..160 {
                    let color = vram_half(bus, frame_base + (line * 160 + x) * 2);
                    self.layers[x][priority][SOURCE_BG2] = color | ENABLE_PIXEL;
                }
            }
        }
    }

    fn render_objects(&mut self, bus: &Bus, line: u32) {
        let disp = bus.io_half(REG_LCD_CONTROL);
        let one_dimensional = disp & (1 << 6) != 0;
        // The lower character blocks belong to the bitmap in modes 3..5.
        let obj_tile_base: usize = if disp & 0x7 >= 3 { 0x14000 } else { 0x10000 };

        // Reverse order so the lowest sprite index wins ties.
        for sprite in (0..128).rev() {
            let attr0 = oam_half(bus, sprite * 8);
            let affine = attr0 & (1 << 8) != 0;
            let double_or_disabled = attr0 & (1 << 9) != 0;
            if !affine && double_or_disabled {
                continue;
            }
            let obj_mode = (attr0 >> 10) & 0x3;
            if obj_mode == 3 {
                continue;
            }
            let attr1 = oam_half(bus, sprite * 8 + 2);
            let attr2 = oam_half(bus, sprite * 8 + 4);

            let is_256_color = attr0 & (1 << 13) != 0;
            let (width, height) = obj_size((attr0 >> 14) & 0x3, (attr1 >> 14) & 0x3);

            let mut x = (attr1 & 0x1ff) as i32;
            if x > 255 {
                x -= 512;
            }
            let mut y = (attr0 & 0xff) as i32;
            if y > 160 {
                y -= 256;
            }

            let (bbox_width, bbox_height) = if affine && double_or_disabled {
                (width * 2, height * 2)
            } else {
                (width, height)
            };
            if affine && double_or_disabled && y + bbox_height > 256 {
                y -= 256;
            }

            let line = line as i32;
            if line < y || line >= y + bbox_height {
                continue;
            }

            let mut tile_base = (attr2 & 0x3ff) as usize;
            if is_256_color {
                // The low bit of the tile number is ignored in 256-color mode.
                tile_base >>= 1;
            }
            let priority = ((attr2 >> 10) & 0x3) as usize;
            let palette_bank = (attr2 >> 12) as usize;

            let (pa, pb, pc, pd) = if affine {
                obj_affine_params(bus, attr1)
            } else {
                (1 << 8, 0, 0, 1 << 8)
            };
            let horizontal_flip = !affine && attr1 & (1 << 12) != 0;
            let vertical_flip = !affine && attr1 & (1 << 13) != 0;

            let width_tiles = width as usize / TILE_SIZE;
            let tile_bytes = if is_256_color { TILE_8BPP_BYTES } else { TILE_4BPP_BYTES };
            let half_width = bbox_width / 2;
            let half_height = bbox_height / 2;
            let center_x = x + half_width;
            let iy = (line - y) - half_height;

            for ix in -half_width..half_width {
                let (mut texture_x, mut texture_y) = if affine {
                    ((pa * ix + pb * iy) >> 8, (pc * ix + pd * iy) >> 8)
                } else {
                    (ix, iy)
                };
                texture_x += width / 2;
                texture_y += height / 2;

                let screen_x = center_x + ix;
                if screen_x < 0 || screen_x >= FRAME_WIDTH as i32 {
                    continue;
                }
                if texture_x < 0 || texture_x >= width || texture_y < 0 || texture_y >= height {
                    continue;
                }
                let mut texture_x = texture_x as usize;
                let mut texture_y = texture_y as usize;
                if horizontal_flip {
                    texture_x = width as usize - 1 - texture_x;
                }
                if vertical_flip {
                    texture_y = height as usize - 1 - texture_y;
                }

                let column = texture_x / TILE_SIZE;
                let row = texture_y / TILE_SIZE;
                let tile_index = if one_dimensional {
                    tile_base + row * width_tiles + column
                } else if is_256_color {
                    tile_base + row * 16 + column
                } else {
                    tile_base + row * 32 + column
                };
                let tile_offset = obj_tile_base + tile_index * tile_bytes;
                let in_tile_x = texture_x % TILE_SIZE;
                let in_tile_y = texture_y % TILE_SIZE;

                let palette_index = if is_256_color {
                    vram_byte(bus, tile_offset + in_tile_y * TILE_SIZE + in_tile_x) as usize
                } else {
                    let pair = vram_byte(bus, tile_offset + in_tile_y * TILE_SIZE / 2 + in_tile_x / 2);
                    let nibble = if in_tile_x % 2 == 0 { pair & 0xf } else { pair >> 4 };
                    if nibble == 0 {
                        continue;
                    }
                    palette_bank * 16 + nibble as usize
                };
                if palette_index == 0 {
                    continue;
                }

                let screen_x = screen_x as usize;
                if obj_mode != 2 {
                    // Sprite palette occupies the upper half of palette RAM.
                    let color = palette_color(bus, 0x100 + palette_index) | ENABLE_PIXEL;
                    self.layers[screen_x][priority][SOURCE_OBJ] = color;
                }
                if obj_mode == 1 {
                    self.semi_transparent[screen_x] = true;
                } else if obj_mode == 2 {
                    self.obj_window[screen_x] = true;
                }
            }
        }
    }

    /// Which window governs this pixel, if windowing is active at all.
    fn window_control_at(&self, bus: &Bus, x: usize, line: u32) -> Option<WindowControl> {
        let disp = bus.io_half(REG_LCD_CONTROL);
        let win0 = disp & (1 << 13) != 0;
        let win1 = disp & (1 << 14) != 0;
        let obj_window = disp & (1 << 15) != 0;
        if !win0 && !win1 && !obj_window {
            return None;
        }
        let inside = bus.io_half(REG_WINDOW_INSIDE);
        let outside = bus.io_half(REG_WINDOW_OUTSIDE);
        if win0 && in_window(bus, REG_WIN0_H, REG_WIN0_V, x, line) {
            return Some(WindowControl::from_bits(inside));
        }
        if win1 && in_window(bus, REG_WIN1_H, REG_WIN1_V, x, line) {
            return Some(WindowControl::from_bits(inside >> 8));
        }
        if obj_window && self.obj_window[x] {
            return Some(WindowControl::from_bits(outside >> 8));
        }
        Some(WindowControl::from_bits(outside))
    }

    fn apply_window_to_layers(&mut self, bus: &Bus, line: u32) {
        for x in 0..FRAME_WIDTH {
            let control = match self.window_control_at(bus, x, line) {
                Some(control) => control,
                None => continue,
            };
            for priority in 0..4 {
                for source in 0..5 {
                    if self.layers[x][priority][source] > 0 && !control.layers[source] {
                        self.layers[x][priority][source] = 0;
                    }
                }
            }
        }
    }

    fn apply_window_to_effects(&mut self, bus: &Bus, line: u32) {
        for x in 0..FRAME_WIDTH {
            if self.effects[x] == 0 {
                continue;
            }
            if let Some(control) = self.window_control_at(bus, x, line) {
                if !control.effects {
                    self.effects[x] = 0;
                }
            }
        }
    }

    /// Topmost opaque pixel and the next one below it. The second OBJ pixel
    /// is skipped since only one OBJ color survives per column.
    fn top_two_pixels(&self, x: usize) -> ((usize, u16), (usize, u16)) {
        let mut first: Option<(usize, u16)> = None;
        for priority in 0..4 {
            for &source in SOURCE_ORDER.iter() {
                let color = self.layers[x][priority][source];
                if color == 0 {
                    continue;
                }
                match first {
                    None => first = Some((source, color)),
                    Some((first_source, _)) => {
                        if source == SOURCE_OBJ && first_source == SOURCE_OBJ {
                            continue;
                        }
                        return (first.unwrap_or((SOURCE_BACKDROP, 0)), (source, color));
                    }
                }
            }
        }
        (first.unwrap_or((SOURCE_BACKDROP, 0)), (SOURCE_BACKDROP, 0))
    }

    fn apply_special_effects(&mut self, bus: &Bus) {
        let control = bus.io_half(REG_BLEND_CONTROL);
        let mode = (control >> 6) & 0x3;
        if mode == 0 {
            return;
        }
        let mut target_1 = [false; 6];
        let mut target_2 = [false; 6];
        for source in 0..6 {
            target_1[source] = control & (1 << source) != 0;
            target_2[source] = control & (1 << (8 + source)) != 0;
        }
        let backdrop = backdrop_color(bus);

        match mode {
            1 => {
                let coefficients = bus.io_half(REG_BLEND_ALPHA);
                let alpha_a = ((coefficients & 0x1f) as u32).min(16);
                let alpha_b = (((coefficients >> 8) & 0x1f) as u32).min(16);
                for x in 0..FRAME_WIDTH {
                    let ((source_1, color_1), (source_2, mut color_2)) = self.top_two_pixels(x);
                    if source_1 == SOURCE_BACKDROP {
                        continue;
                    }
                    if source_2 == SOURCE_BACKDROP {
                        color_2 = backdrop;
                    }
                    // A semi-transparent OBJ pixel blends regardless of the
                    // Target 1 enable; Target 2 is always checked.
                    let forced = source_1 == SOURCE_OBJ && self.semi_transparent[x];
                    if !forced && !target_1[source_1] {
                        continue;
                    }
                    if !target_2[source_2] {
                        continue;
                    }
                    self.effects[x] = blend(color_1, color_2, alpha_a, alpha_b) | ENABLE_PIXEL;
                }
            }
            brightness => {
                let coefficient = ((bus.io_byte(REG_BLEND_BRIGHTNESS) & 0x1f) as u32).min(16);
                for x in 0..FRAME_WIDTH {
                    let ((source_1, mut color_1), _) = self.top_two_pixels(x);
                    if source_1 == SOURCE_BACKDROP {
                        color_1 = backdrop;
                    }
                    if !target_1[source_1] {
                        continue;
                    }
                    let adjusted = if brightness == 2 {
                        brighten(color_1, coefficient)
                    } else {
                        darken(color_1, coefficient)
                    };
                    self.effects[x] = adjusted | ENABLE_PIXEL;
                }
            }
        }
    }

    fn resolve_scanline(&mut self) {
        for x in 0..FRAME_WIDTH {
            if self.effects[x] > 0 {
                self.scanline[x] = self.effects[x];
                continue;
            }
            'column: for priority in 0..4 {
                for &source in SOURCE_ORDER.iter() {
                    let color = self.layers[x][priority][source];
                    if color > 0 {
                        self.scanline[x] = color;
                        break 'column;
                    }
                }
            }
        }
    }
}

fn vram_byte(bus: &Bus, offset: usize) -> u8 {
    bus.vram.get(offset).copied().unwrap_or(0)
}

fn vram_half(bus: &Bus, offset: usize) -> u16 {
    u16::from_le_bytes([vram_byte(bus, offset), vram_byte(bus, offset + 1)])
}

fn oam_half(bus: &Bus, offset: usize) -> u16 {
    u16::from_le_bytes([bus.oam[offset], bus.oam[offset + 1]])
}

fn palette_color(bus: &Bus, index: usize) -> u16 {
    u16::from_le_bytes([bus.palette[index * 2], bus.palette[index * 2 + 1]])
}

fn backdrop_color(bus: &Bus) -> u16 {
    palette_color(bus, 0) | ENABLE_PIXEL
}

fn in_window(bus: &Bus, h_register: u32, v_register: u32, x: usize, line: u32) -> bool {
    let horizontal = bus.io_half(h_register);
    let left = (horizontal >> 8) as usize;
    let right = (horizontal & 0xff) as usize;
    let vertical = bus.io_half(v_register);
    let top = (vertical >> 8) as u32;
    let bottom = (vertical & 0xff) as u32;
    // An edge pair in the wrong order wraps around the screen border.
    let in_h = if left <= right { x >= left && x < right } else { x >= left || x < right };
    let in_v = if top <= bottom { line >= top && line < bottom } else { line >= top || line < bottom };
    in_h && in_v
}

fn obj_size(shape: u16, size: u16) -> (i32, i32) {
    match (shape, size) {
        (0, 0) => (8, 8),
        (0, 1) => (16, 16),
        (0, 2) => (32, 32),
        (0, _) => (64, 64),
        (1, 0) => (16, 8),
        (1, 1) => (32, 8),
        (1, 2) => (32, 16),
        (1, _) => (64, 32),
        (2, 0) => (8, 16),
        (2, 1) => (8, 32),
        (2, 2) => (16, 32),
        _ => (32, 64),
    }
}

/// Affine parameters live interleaved in OAM: one matrix slot every 0x20
/// bytes, elements 8 bytes apart.
fn obj_affine_params(bus: &Bus, attr1: u16) -> (i32, i32, i32, i32) {
    let slot = ((attr1 >> 9) & 0x1f) as usize;
    let base = 6 + slot * 0x20;
    (
        oam_half(bus, base) as i16 as i32,
        oam_half(bus, base + 8) as i16 as i32,
        oam_half(bus, base + 16) as i16 as i32,
        oam_half(bus, base + 24) as i16 as i32,
    )
}

fn channels(color: u16) -> (u32, u32, u32) {
    ((color & 0x1f) as u32, ((color >> 5) & 0x1f) as u32, ((color >> 10) & 0x1f) as u32)
}

fn pack(r: u32, g: u32, b: u32) -> u16 {
    (r.min(0x1f) | (g.min(0x1f) << 5) | (b.min(0x1f) << 10)) as u16
}

fn blend(color_1: u16, color_2: u16, alpha_a: u32, alpha_b: u32) -> u16 {
    let (r1, g1, b1) = channels(color_1);
    let (r2, g2, b2) = channels(color_2);
    pack(
        (r1 * alpha_a + r2 * alpha_b) >> 4,
        (g1 * alpha_a + g2 * alpha_b) >> 4,
        (b1 * alpha_a + b2 * alpha_b) >> 4,
    )
}

fn brighten(color: u16, coefficient: u32) -> u16 {
    let (r, g, b) = channels(color);
    pack(
        r + ((0x1f - r) * coefficient) / 16,
        g + ((0x1f - g) * coefficient) / 16,
        b + ((0x1f - b) * coefficient) / 16,
    )
}

fn darken(color: u16, coefficient: u32) -> u16 {
    let (r, g, b) = channels(color);
    pack(r - r * coefficient / 16, g - g * coefficient / 16, b - b * coefficient / 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gba::REG_BG0_CONTROL;

    fn gpu() -> Gpu {
        Gpu::new(Arc::new(Mutex::new(vec![0; FRAME_WIDTH * FRAME_HEIGHT])))
    }

    fn set_palette(bus: &mut Bus, index: usize, color: u16) {
        bus.palette[index * 2..index * 2 + 2].copy_from_slice(&color.to_le_bytes());
    }

    #[test]
    fn backdrop_fills_the_line() {
        let mut bus = Bus::new();
        set_palette(&mut bus, 0, 0x1234);
        let mut gpu = gpu();
        gpu.render_scanline(&bus, 0);
        let frame = gpu.frame.lock().unwrap();
        assert!(frame[..FRAME_WIDTH].iter().all(|&pixel| pixel == 0x1234 | ENABLE_PIXEL));
    }

    #[test]
    fn text_background_renders_a_tile_row() {
        let mut bus = Bus::new();
        set_palette(&mut bus, 0, 0x0000);
        set_palette(&mut bus, 1, 0x7fff);
        // Enable mode 0 with BG0; the screen map sits in block 1 so it does
        // not overlap the tile data. Tile 1 is solid color 1 in 4bpp.
        bus.set_io_half(REG_LCD_CONTROL, 1 << 8);
        bus.set_io_half(REG_BG0_CONTROL, 1 << 8);
        for byte in 0..TILE_4BPP_BYTES {
            bus.vram[TILE_4BPP_BYTES + byte] = 0x11;
        }
        // Map entry (0, 0) selects tile 1.
        bus.vram[0x800] = 1;
        let mut gpu = gpu();
        gpu.render_scanline(&bus, 0);
        let frame = gpu.frame.lock().unwrap();
        assert_eq!(frame[0], 0x7fff | ENABLE_PIXEL);
        assert_eq!(frame[7], 0x7fff | ENABLE_PIXEL);
        // Map entry (1, 0) is tile 0 (transparent), backdrop shows through.
        assert_eq!(frame[8], ENABLE_PIXEL);
    }

    #[test]
    fn bitmap_mode_3_is_direct_color() {
        let mut bus = Bus::new();
        bus.set_io_half(REG_LCD_CONTROL, 3 | (1 << 10));
        let color: u16 = 0x03e0;
        bus.vram[..2].copy_from_slice(&color.to_le_bytes());
        let mut gpu = gpu();
        gpu.render_scanline(&bus, 0);
        let frame = gpu.frame.lock().unwrap();
        assert_eq!(frame[0], color | ENABLE_PIXEL);
    }

    #[test]
    fn priority_resolution_prefers_lower_priority_value() {
        let mut gpu = gpu();
        gpu.layers[5][2][SOURCE_BG1] = 0x1111 | ENABLE_PIXEL;
        gpu.layers[5][0][SOURCE_BG3] = 0x2222 | ENABLE_PIXEL;
        gpu.resolve_scanline();
        assert_eq!(gpu.scanline[5], 0x2222 | ENABLE_PIXEL);
    }

    #[test]
    fn obj_beats_backgrounds_at_equal_priority() {
        let mut gpu = gpu();
        gpu.layers[9][1][SOURCE_BG0] = 0x1111 | ENABLE_PIXEL;
        gpu.layers[9][1][SOURCE_OBJ] = 0x3333 | ENABLE_PIXEL;
        gpu.resolve_scanline();
        assert_eq!(gpu.scanline[9], 0x3333 | ENABLE_PIXEL);
    }

    #[test]
    fn brightness_arithmetic_saturates() {
        assert_eq!(brighten(pack(0x1f, 0, 0), 16), pack(0x1f, 0x1f, 0x1f));
        assert_eq!(darken(pack(0x1f, 0x10, 0x1), 16), pack(0, 0, 0));
        assert_eq!(brighten(pack(0x10, 0x10, 0x10), 0), pack(0x10, 0x10, 0x10));
    }

    #[test]
    fn alpha_blend_is_component_wise() {
        let a = pack(0x1f, 0x00, 0x10);
        let b = pack(0x00, 0x1f, 0x10);
        assert_eq!(blend(a, b, 8, 8), pack(0x0f, 0x0f, 0x10));
        // Saturating coefficients clip per channel.
        assert_eq!(blend(a, b, 16, 16), pack(0x1f, 0x1f, 0x1f));
    }
}
