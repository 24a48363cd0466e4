//! # Shared Frame Buffer
//!
//! One byte per pixel for CGA/EGA, two 4-bit pixels per byte for MDA (even
//! pixel in the low nibble). The buffer is sized for the largest visible area
//! of any supported mode plus a little slack, and a separate 8-row strip holds
//! on-screen text until it is copied over the picture.
//!
//! Storage is a flat array of `AtomicU32` words so the acquisition context can
//! write whole sampled words while the output context reads concurrently,
//! without locks and without unsafe code. Single-byte writes (text, test
//! patterns) go through an atomic read-modify-write of the containing word.
//! Tearing between a word written by capture and one read by the renderer is a
//! one-frame visual artifact, never a memory-safety issue.

use crate::timings::TimingProfile;
use crate::VideoFormat;
use std::sync::atomic::{AtomicU32, Ordering};

/// Horizontal slack, because the measured border is off by a few pixels.
pub const XB: usize = 8;
/// Vertical slack.
pub const YB: usize = 2;
/// Buffer width in bytes.
pub const BUFF_X: usize = 640 + XB;
/// Buffer height in rows.
pub const BUFF_Y: usize = 350 + YB;
pub const WORDS_PER_ROW: usize = BUFF_X / 4;
/// Height of the text strip.
pub const TXT_ROWS: usize = 8;
/// Keeps the six colour bits of each sampled byte, dropping the sync bits.
pub const RGB_MASK_4: u32 = 0x3F3F_3F3F;

/// Foreground colour used for text, per format.
pub fn text_color(format: VideoFormat) -> u8 {
    match format {
        // video + intensity
        VideoFormat::Mda => 0b11,
        // bright cyan
        VideoFormat::Cga | VideoFormat::Ega => 0b01_1111,
    }
}

fn words(count: usize) -> Box<[AtomicU32]> {
    (0..count).map(|_| AtomicU32::new(0)).collect()
}

#[derive(Debug)]
pub struct FrameBuffer {
    pixels: Box<[AtomicU32]>,
    overlay: Box<[AtomicU32]>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        FrameBuffer {
            pixels: words(WORDS_PER_ROW * BUFF_Y),
            overlay: words(WORDS_PER_ROW * TXT_ROWS),
        }
    }

    fn word_index(y: usize, byte_x: usize) -> usize {
        y * WORDS_PER_ROW + byte_x / 4
    }

    fn read_byte(words: &[AtomicU32], y: usize, byte_x: usize) -> u8 {
        let word = words[Self::word_index(y, byte_x)].load(Ordering::Relaxed);
        (word >> ((byte_x % 4) * 8)) as u8
    }

    /// Replaces the bits selected by `mask` in one byte.
    fn update_byte(words: &[AtomicU32], y: usize, byte_x: usize, mask: u8, value: u8) {
        let shift = (byte_x % 4) * 8;
        let mask = u32::from(mask) << shift;
        let bits = (u32::from(value) << shift) & mask;
        // fetch_update only fails when the closure returns None.
        let _ = words[Self::word_index(y, byte_x)].fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |w| Some((w & !mask) | bits),
        );
    }

    fn write_pixel(words: &[AtomicU32], rows: usize, format: VideoFormat, y: i32, x: i32, v: u8) {
        if y < 0 || x < 0 {
            return;
        }
        let (y, x) = (y as usize, x as usize);
        if y >= rows {
            return;
        }
        match format {
            VideoFormat::Cga | VideoFormat::Ega => {
                if x < BUFF_X {
                    Self::update_byte(words, y, x, 0xff, v);
                }
            }
            VideoFormat::Mda => {
                if x / 2 < BUFF_X {
                    if x % 2 == 0 {
                        Self::update_byte(words, y, x / 2, 0x0f, v & 0x0f);
                    } else {
                        Self::update_byte(words, y, x / 2, 0xf0, (v & 0x0f) << 4);
                    }
                }
            }
        }
    }

    /// Stores four sampled CGA/EGA pixels at byte column `x` of row `y`.
    /// Out-of-range coordinates are clamped to the last word of the buffer.
    #[inline]
    pub fn set_rgb_word(&self, y: u32, x: u32, word: u32) {
        let x = (x as usize).min(BUFF_X - 4);
        let y = (y as usize).min(BUFF_Y - 1);
        self.pixels[Self::word_index(y, x)].store(word, Ordering::Relaxed);
    }

    /// Stores eight sampled MDA pixels at byte column `byte_x` of row `y`.
    #[inline]
    pub fn set_mono_word(&self, y: u32, byte_x: u32, word: u32) {
        self.set_rgb_word(y, byte_x, word);
    }

    /// Raw word at byte column `x` (rounded down to a word).
    pub fn word_at(&self, y: usize, x: usize) -> u32 {
        self.pixels[Self::word_index(y, x)].load(Ordering::Relaxed)
    }

    pub fn byte(&self, y: usize, x: usize) -> u8 {
        Self::read_byte(&self.pixels, y, x)
    }

    /// CGA/EGA pixel `x` of row `y`.
    pub fn rgb_pixel(&self, y: usize, x: usize) -> u8 {
        self.byte(y, x)
    }

    /// MDA pixel `x` of row `y` (4-bit value, video/intensity in the low bits).
    pub fn mono_pixel(&self, y: usize, x: usize) -> u8 {
        let byte = self.byte(y, x / 2);
        if x % 2 == 0 {
            byte & 0x0f
        } else {
            byte >> 4
        }
    }

    /// Pixel accessor matching the packing of `format`.
    pub fn pixel(&self, format: VideoFormat, y: usize, x: usize) -> u8 {
        match format {
            VideoFormat::Mda => self.mono_pixel(y, x),
            VideoFormat::Cga | VideoFormat::Ega => self.rgb_pixel(y, x),
        }
    }

    /// Writes one pixel of the picture, ignoring out-of-range coordinates.
    pub fn set_pixel(&self, format: VideoFormat, y: i32, x: i32, value: u8) {
        Self::write_pixel(&self.pixels, BUFF_Y, format, y, x, value);
    }

    /// Writes one pixel of the text strip.
    pub fn set_overlay_pixel(&self, format: VideoFormat, y: i32, x: i32, value: u8) {
        Self::write_pixel(&self.overlay, TXT_ROWS, format, y, x, value);
    }

    pub fn overlay_byte(&self, y: usize, x: usize) -> u8 {
        Self::read_byte(&self.overlay, y, x)
    }

    pub fn clear(&self) {
        for w in self.pixels.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    pub fn clear_overlay(&self) {
        for w in self.overlay.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Blanks every row from `line` to the bottom.
    pub fn fill_rows_after(&self, line: usize) {
        if line >= BUFF_Y {
            return;
        }
        for w in self.pixels[line * WORDS_PER_ROW..].iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Copies the text strip over the picture starting at `top_row`.
    pub fn copy_overlay_to_screen(&self, top_row: usize) {
        let rows = TXT_ROWS.min(BUFF_Y.saturating_sub(top_row));
        let start = top_row * WORDS_PER_ROW;
        for (dst, src) in self.pixels[start..start + rows * WORDS_PER_ROW]
            .iter()
            .zip(self.overlay.iter())
        {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Draws the placeholder shown while no input is connected: colour bars
    /// over the top three quarters and a checkerboard below.
    pub fn no_signal(&self, profile: &TimingProfile) {
        self.clear();
        let width = profile.horizontal.visible as i32;
        let height = (profile.vertical.visible as usize).min(BUFF_Y) as i32;
        let bars: &[u8] = match profile.format {
            VideoFormat::Mda => &[0b11, 0b10, 0b01, 0b00],
            VideoFormat::Cga | VideoFormat::Ega => &[
                0b11_1111, 0b11_1100, 0b00_1111, 0b00_1100, 0b11_0011, 0b11_0000, 0b00_0011,
                0b00_0000,
            ],
        };
        let bar_w = (width / bars.len() as i32).max(1);
        let split = height * 3 / 4;
        for y in 0..height {
            for x in 0..width {
                let value = if y < split {
                    bars[((x / bar_w) as usize).min(bars.len() - 1)]
                } else if ((x / 16) + (y / 16)) % 2 == 0 {
                    text_color(profile.format)
                } else {
                    0
                };
                self.set_pixel(profile.format, y, x, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timings::{default_profile, PRESETS};

    #[test]
    fn rgb_words_are_little_endian_bytes() {
        let buf = FrameBuffer::new();
        buf.set_rgb_word(3, 8, 0x0403_0201);
        assert_eq!(buf.rgb_pixel(3, 8), 1);
        assert_eq!(buf.rgb_pixel(3, 9), 2);
        assert_eq!(buf.rgb_pixel(3, 11), 4);
        assert_eq!(buf.word_at(3, 8), 0x0403_0201);
    }

    #[test]
    fn mono_pixels_pack_two_per_byte() {
        let buf = FrameBuffer::new();
        // pixel n in nibble n
        buf.set_mono_word(0, 4, 0x7654_3210);
        for px in 0..8 {
            assert_eq!(buf.mono_pixel(0, 8 + px), px as u8, "pixel {}", px);
        }
        buf.set_pixel(VideoFormat::Mda, 1, 5, 0b11);
        assert_eq!(buf.byte(1, 2), 0x30);
        buf.set_pixel(VideoFormat::Mda, 1, 4, 0b10);
        assert_eq!(buf.byte(1, 2), 0x32);
    }

    #[test]
    fn writes_are_clamped_to_the_buffer() {
        let buf = FrameBuffer::new();
        buf.set_rgb_word(10_000, 10_000, 0xAABB_CCDD);
        assert_eq!(buf.word_at(BUFF_Y - 1, BUFF_X - 4), 0xAABB_CCDD);
        buf.set_pixel(VideoFormat::Cga, -1, 5, 1);
        buf.set_pixel(VideoFormat::Cga, 5, BUFF_X as i32, 1);
    }

    #[test]
    fn overlay_copy_lands_on_text_rows() {
        let buf = FrameBuffer::new();
        buf.set_overlay_pixel(VideoFormat::Ega, 0, 0, 9);
        buf.set_overlay_pixel(VideoFormat::Ega, 7, 647, 5);
        buf.copy_overlay_to_screen(175);
        assert_eq!(buf.rgb_pixel(175, 0), 9);
        assert_eq!(buf.rgb_pixel(182, 647), 5);
        buf.copy_overlay_to_screen(BUFF_Y - 2);
        assert_eq!(buf.rgb_pixel(BUFF_Y - 2, 0), 9);
    }

    #[test]
    fn fill_and_clear_blank_the_picture() {
        let buf = FrameBuffer::new();
        buf.no_signal(default_profile());
        assert_ne!(buf.rgb_pixel(0, 0), 0, "placeholder draws colour bars");
        buf.fill_rows_after(100);
        assert_eq!(buf.rgb_pixel(150, 0), 0);
        assert_ne!(buf.rgb_pixel(10, 0), 0);
        buf.clear();
        assert_eq!(buf.rgb_pixel(10, 0), 0);
    }

    #[test]
    fn mda_placeholder_fits_the_buffer() {
        let buf = FrameBuffer::new();
        buf.no_signal(&PRESETS[0]);
        assert_eq!(buf.mono_pixel(0, 0), 0b11);
    }
}
