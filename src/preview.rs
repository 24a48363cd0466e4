//! # Terminal Preview
//!
//! Development-mode stand-in for the video output: the frame buffer is
//! downsampled into a character grid, one glyph per cell, brighter pixels
//! giving denser glyphs.

use crate::frame_buffer::{FrameBuffer, BUFF_Y};
use crate::pipeline::OutputRenderer;
use crate::timings::TimingProfile;
use crate::VideoFormat;
use std::io::Write;

/// Glyphs from dark to bright.
const RAMP: &[char] = &[' ', '.', ':', '-', '=', '+', '*', '#', '%', '@'];
const COLUMNS: usize = 80;
const ROWS: usize = 25;

/// Brightness of one pixel on a 0..=6 scale.
fn level(format: VideoFormat, value: u8) -> u32 {
    match format {
        // video counts double, intensity adds one
        VideoFormat::Mda => u32::from(value & 0b01) * 4 + u32::from(value & 0b10 != 0) * 2,
        VideoFormat::Cga | VideoFormat::Ega => (value & 0x3f).count_ones(),
    }
}

/// Renders the visible area of `buffer` as text, with a one-line header.
pub fn draw_ascii(buffer: &FrameBuffer, profile: &TimingProfile) -> String {
    let width = profile.horizontal.visible as usize;
    let height = (profile.vertical.visible as usize).min(BUFF_Y);
    let cell_w = width.div_ceil(COLUMNS).max(1);
    let cell_h = height.div_ceil(ROWS).max(1);

    let mut out = format!("{} [{}]\n", profile.name, profile.summary());
    for cy in (0..height).step_by(cell_h) {
        for cx in (0..width).step_by(cell_w) {
            let mut sum = 0;
            let mut count = 0;
            for y in cy..(cy + cell_h).min(height) {
                for x in cx..(cx + cell_w).min(width) {
                    sum += level(profile.format, buffer.pixel(profile.format, y, x));
                    count += 1;
                }
            }
            let idx = (sum * (RAMP.len() as u32 - 1)) / (count.max(1) * 6);
            out.push(RAMP[idx as usize]);
        }
        out.push('\n');
    }
    out
}

/// [`OutputRenderer`] that prints a preview every `every` frames.
pub struct PreviewRenderer {
    out: Box<dyn Write + Send>,
    every: u64,
    frame: u64,
}

impl PreviewRenderer {
    pub fn new(out: Box<dyn Write + Send>, every: u64) -> Self {
        PreviewRenderer {
            out,
            every: every.max(1),
            frame: 0,
        }
    }

    pub fn stdout(every: u64) -> Self {
        Self::new(Box::new(std::io::stdout()), every)
    }
}

impl OutputRenderer for PreviewRenderer {
    fn set_geometry(&mut self, profile: &TimingProfile) {
        log::info!("Preview geometry: {}", profile.summary());
    }

    fn render_frame(&mut self, buffer: &FrameBuffer, profile: &TimingProfile) {
        let due = self.frame % self.every == 0;
        self.frame += 1;
        if !due {
            return;
        }
        let text = draw_ascii(buffer, profile);
        if let Err(e) = self
            .out
            .write_all(text.as_bytes())
            .and_then(|_| self.out.flush())
        {
            log::warn!("Preview write failed: {}", e);
        }
    }
}
