//! Sprite rendering and collision detection.
//!
//! Sprites draw in two passes around the background: pass 0 for sprites
//! with priority-behind-background, pass 1 for the rest.  Collision uses
//! the per-line background-opaque map and pairwise pixel coverage.

use super::{FrameBuffer, Vic, VicMemView};
use crate::machine::irq::{IrqLine, IrqSource};
use crate::mem::vic_read;

impl Vic {
    /// Screen X for a sprite, applying the 9th bit, the hardware offset,
    /// and the border origin.
    pub(crate) fn sprite_screen_x(&self, index: usize) -> i32 {
        let mut x = self.regs.sprite_x[index] as i32;
        if self.regs.sprite_x_msb & (1 << index) != 0 {
            x += 256;
        }
        x - self.cfg.hardware_x + super::BORDER_SIZE as i32
    }

    /// If the sprite covers `raster`, returns (row within sprite data,
    /// framebuffer line).
    pub(crate) fn sprite_covers_raster(&self, index: usize, raster: u16) -> Option<(u8, i32)> {
        let y = self.regs.sprite_y[index] as u16;
        let expanded = self.regs.sprite_y_expansion & (1 << index) != 0;
        let height = if expanded { 42 } else { 21 };
        if raster < y || raster >= y + height {
            return None;
        }
        let mut row = raster - y;
        if expanded {
            row /= 2;
        }
        Some((row as u8, self.fb_y(raster)))
    }

    fn sprite_row_bits(&self, mem: &VicMemView, index: usize, row: u8) -> u32 {
        let addr = self.spr_ptr_base[index] + row as u16 * 3;
        (vic_read(mem, addr) as u32) << 16
            | (vic_read(mem, addr + 1) as u32) << 8
            | vic_read(mem, addr + 2) as u32
    }

    /// Walk the solid pixels of one sprite row, honouring multicolour
    /// pairs and X expansion, calling `emit` for every covered X.
    fn for_each_solid_pixel(
        &self,
        bits: u32,
        multicolor: bool,
        expanded: bool,
        base_x: i32,
        x1: i32,
        mut emit: impl FnMut(i32),
    ) {
        if !multicolor {
            let dup = if expanded { 2 } else { 1 };
            for bit in 0..24 {
                if bits & (1 << (23 - bit)) == 0 {
                    continue;
                }
                let draw_x = base_x + bit * dup;
                if draw_x >= x1 {
                    break;
                }
                for sub in 0..dup {
                    emit(draw_x + sub);
                }
            }
        } else {
            let dup = if expanded { 4 } else { 2 };
            for pair in 0..12 {
                let two = (bits >> (22 - pair * 2)) & 0x03;
                if two == 0 {
                    continue;
                }
                let draw_x = base_x + pair * dup;
                if draw_x >= x1 {
                    break;
                }
                for sub in 0..dup {
                    emit(draw_x + sub);
                }
            }
        }
    }

    pub(crate) fn render_sprites(
        &mut self,
        mem: &VicMemView,
        fb: &mut FrameBuffer,
        pass: u8,
        raster: u16,
    ) {
        for i in 0..8 {
            if self.regs.sprite_enabled & (1 << i) == 0 {
                continue;
            }
            let Some((row, _)) = self.sprite_covers_raster(i, raster) else {
                continue;
            };
            let behind = self.regs.sprite_priority & (1 << i) != 0;
            if (pass == 0) != behind {
                continue;
            }
            self.draw_sprite(mem, fb, i, row, raster);
        }
    }

    fn draw_sprite(
        &mut self,
        mem: &VicMemView,
        fb: &mut FrameBuffer,
        index: usize,
        row: u8,
        raster: u16,
    ) {
        let sprite_x = self.sprite_screen_x(index);
        let expanded = self.regs.sprite_x_expansion & (1 << index) != 0;
        let multicolor = self.regs.sprite_multicolor & (1 << index) != 0;
        let bits = self.sprite_row_bits(mem, index, row);
        let (x0, x1) = self.inner_window(raster);
        let y = self.fb_y(raster);

        let color = self.regs.sprite_colors[index] & 0x0F;
        let mc1 = self.regs.sprite_multicolor1 & 0x0F;
        let mc2 = self.regs.sprite_multicolor2 & 0x0F;

        if !multicolor {
            let dup = if expanded { 2 } else { 1 };
            for bit in 0..24 {
                if bits & (1 << (23 - bit)) == 0 {
                    continue;
                }
                let draw_x = sprite_x + bit * dup;
                if draw_x >= x1 {
                    break;
                }
                for sub in 0..dup {
                    let px = draw_x + sub;
                    if px >= x0 && px < x1 {
                        fb.set_pixel(px, y, color);
                    }
                }
            }
        } else {
            let dup = if expanded { 4 } else { 2 };
            for pair in 0..12 {
                let two = (bits >> (22 - pair * 2)) & 0x03;
                if two == 0 {
                    continue;
                }
                let draw_x = sprite_x + pair * dup;
                if draw_x >= x1 {
                    break;
                }
                let pix_color = match two {
                    1 => mc1,
                    2 => color,
                    _ => mc2,
                };
                for sub in 0..dup {
                    let px = draw_x + sub;
                    if px >= x0 && px < x1 {
                        fb.set_pixel(px, y, pix_color);
                    }
                }
            }
        }
    }

    // ── Collision detection ───────────────────────────────────

    pub(crate) fn detect_sprite_sprite_collision(
        &mut self,
        mem: &VicMemView,
        raster: u16,
        irq: &mut IrqLine,
    ) {
        let old = self.regs.sprite_collision;

        for a in 0..8 {
            if self.regs.sprite_enabled & (1 << a) == 0 {
                continue;
            }
            for b in a + 1..8 {
                if self.regs.sprite_enabled & (1 << b) == 0 {
                    continue;
                }
                if self.sprites_overlap_on_line(mem, a, b, raster) {
                    self.regs.sprite_collision |= (1 << a) | (1 << b);
                }
            }
        }

        // $D019: bit 1 latches sprite-sprite, bit 2 sprite-background.
        if self.regs.sprite_collision & !old != 0 {
            self.regs.interrupt_status |= 0x02;
            if self.regs.interrupt_enable & 0x02 != 0 {
                irq.raise(IrqSource::Vic);
            }
        }
    }

    fn sprites_overlap_on_line(&self, mem: &VicMemView, a: usize, b: usize, raster: u16) -> bool {
        let Some((row_a, _)) = self.sprite_covers_raster(a, raster) else {
            return false;
        };
        let Some((row_b, _)) = self.sprite_covers_raster(b, raster) else {
            return false;
        };

        let bits_a = self.sprite_row_bits(mem, a, row_a);
        let bits_b = self.sprite_row_bits(mem, b, row_b);
        let (_, x1) = self.inner_window(raster);

        let mut cover = [false; 512];
        self.for_each_solid_pixel(
            bits_a,
            self.regs.sprite_multicolor & (1 << a) != 0,
            self.regs.sprite_x_expansion & (1 << a) != 0,
            self.sprite_screen_x(a),
            x1,
            |px| {
                if (0..512).contains(&px) {
                    cover[px as usize] = true;
                }
            },
        );

        let mut hit = false;
        self.for_each_solid_pixel(
            bits_b,
            self.regs.sprite_multicolor & (1 << b) != 0,
            self.regs.sprite_x_expansion & (1 << b) != 0,
            self.sprite_screen_x(b),
            x1,
            |px| {
                if (0..512).contains(&px) && cover[px as usize] {
                    hit = true;
                }
            },
        );
        hit
    }

    pub(crate) fn detect_sprite_background_collision(
        &mut self,
        mem: &VicMemView,
        raster: u16,
        irq: &mut IrqLine,
    ) {
        let old = self.regs.sprite_data_collision;

        for i in 0..8 {
            if self.regs.sprite_enabled & (1 << i) == 0 {
                continue;
            }
            if self.sprite_overlaps_background(mem, i, raster) {
                self.regs.sprite_data_collision |= 1 << i;
            }
        }

        if self.regs.sprite_data_collision & !old != 0 {
            self.regs.interrupt_status |= 0x04;
            if self.regs.interrupt_enable & 0x04 != 0 {
                irq.raise(IrqSource::Vic);
            }
        }
    }

    fn sprite_overlaps_background(&self, mem: &VicMemView, index: usize, raster: u16) -> bool {
        let Some((row, fb_line)) = self.sprite_covers_raster(index, raster) else {
            return false;
        };

        let bits = self.sprite_row_bits(mem, index, row);
        let multicolor = self.regs.sprite_multicolor & (1 << index) != 0;
        let expanded = self.regs.sprite_x_expansion & (1 << index) != 0;
        let sprite_x = self.sprite_screen_x(index);

        let cols = if self.csel_40(raster) { 40 } else { 38 };
        let fine = self.fine_x_scroll(raster) as i32;
        let x0 = super::BORDER_SIZE as i32 + if cols == 38 { 4 } else { 0 };
        let left_paint = x0 - fine;
        let right_paint = x0 + cols * 8;

        let mut hit = false;
        self.for_each_solid_pixel(bits, multicolor, expanded, sprite_x, right_paint, |px| {
            if px >= left_paint && px < right_paint && self.bg_opaque_at(px, fb_line) {
                hit = true;
            }
        });
        hit
    }
}
