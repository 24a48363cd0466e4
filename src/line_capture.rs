//! # Scanline Capture
//!
//! One reader per pixel packing, each specialized at compile time on whether
//! the line's pixels are kept or thrown away (the rows under an active text
//! strip are read but not stored). [`read_line`] is the only place that picks
//! a reader, from the active profile's format.
//!
//! Every reader follows the same rhythm:
//! 1. wait for the previous horizontal retrace to end
//! 2. inside the vertical border, wait for the next retrace without sampling
//! 3. otherwise pop pixel words until the visible width plus border is covered,
//!    storing those past the border
//! 4. wait for the retrace and report whether vertical sync is asserted
//!
//! The sampler FIFO already holds [`FIFO_WORDS`] stale words when a line
//! starts, which is why the skip distance is the border plus one FIFO's worth
//! of pixels.

use crate::border::BorderOffsets;
use crate::frame_buffer::{FrameBuffer, BUFF_Y, RGB_MASK_4};
use crate::hardware::{pop_pixels_blocking, wait_hsync, AbortToken, HardwareError, SignalPort};
use crate::timings::TimingProfile;
use crate::VideoFormat;

/// Depth of the pixel sampler's receive FIFO.
pub const FIFO_WORDS: u32 = 8;

/// Everything a reader needs for one frame, copied out of the profile so the
/// per-line path does no lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineGeometry {
    pub format: VideoFormat,
    pub h_visible: u32,
    /// Rows that fit both the profile and the buffer.
    pub rows: u32,
    pub border: BorderOffsets,
    /// VSync level that ends the frame.
    pub retrace_level: bool,
}

impl LineGeometry {
    pub fn new(profile: &TimingProfile, border: BorderOffsets) -> Self {
        LineGeometry {
            format: profile.format,
            h_visible: profile.horizontal.visible,
            rows: profile.vertical.visible.min(BUFF_Y as u32),
            border,
            retrace_level: profile.retrace_level(),
        }
    }

    /// Buffer row of `line`, if it is a captured row.
    fn row(&self, line: u32) -> Option<u32> {
        line.checked_sub(self.border.y()).filter(|r| *r < self.rows)
    }
}

/// Captures one scanline and returns whether the vertical retrace has begun.
///
/// With `discard` set the pixel words are still consumed, so the FIFO stays in
/// step, but nothing is written.
pub fn read_line<P: SignalPort + ?Sized>(
    port: &mut P,
    buffer: &FrameBuffer,
    geo: &LineGeometry,
    line: u32,
    discard: bool,
    abort: &AbortToken,
) -> Result<bool, HardwareError> {
    match (geo.format, discard) {
        (VideoFormat::Cga | VideoFormat::Ega, false) => {
            read_line_rgb::<P, false>(port, buffer, geo, line, abort)
        }
        (VideoFormat::Cga | VideoFormat::Ega, true) => {
            read_line_rgb::<P, true>(port, buffer, geo, line, abort)
        }
        (VideoFormat::Mda, false) => read_line_mono::<P, false>(port, buffer, geo, line, abort),
        (VideoFormat::Mda, true) => read_line_mono::<P, true>(port, buffer, geo, line, abort),
    }
}

#[inline]
fn finish_line<P: SignalPort + ?Sized>(
    port: &mut P,
    geo: &LineGeometry,
    abort: &AbortToken,
) -> Result<bool, HardwareError> {
    wait_hsync(port, true, abort)?;
    Ok(port.vsync_level() == geo.retrace_level)
}

/// CGA/EGA: four one-byte pixels per word.
fn read_line_rgb<P: SignalPort + ?Sized, const DISCARD: bool>(
    port: &mut P,
    buffer: &FrameBuffer,
    geo: &LineGeometry,
    line: u32,
    abort: &AbortToken,
) -> Result<bool, HardwareError> {
    wait_hsync(port, false, abort)?;
    if line < geo.border.y() {
        return finish_line(port, geo, abort);
    }
    let row = geo.row(line);
    let adj = (geo.border.x() + FIFO_WORDS * 4) & !3;
    let x_max = geo.h_visible + adj;
    let mut x = 0;
    loop {
        let word = pop_pixels_blocking(port, abort)?;
        if !DISCARD && x >= adj {
            if let Some(row) = row {
                buffer.set_rgb_word(row, x - adj, word & RGB_MASK_4);
            }
        }
        x += 4;
        if x >= x_max {
            break;
        }
    }
    finish_line(port, geo, abort)
}

/// MDA: eight 4-bit pixels per word, stored two per byte. The buffer column
/// advances by 4 bytes for every 8 pixels.
fn read_line_mono<P: SignalPort + ?Sized, const DISCARD: bool>(
    port: &mut P,
    buffer: &FrameBuffer,
    geo: &LineGeometry,
    line: u32,
    abort: &AbortToken,
) -> Result<bool, HardwareError> {
    wait_hsync(port, false, abort)?;
    if line < geo.border.y() {
        return finish_line(port, geo, abort);
    }
    let row = geo.row(line);
    let adj = geo.border.x() + FIFO_WORDS * 8;
    let buff_border = (adj / 2) & !3;
    let x_max = geo.h_visible + adj;
    let mut buff_x = 0;
    let mut pixel_x = 0;
    loop {
        let word = pop_pixels_blocking(port, abort)?;
        if !DISCARD && buff_x >= buff_border {
            if let Some(row) = row {
                buffer.set_mono_word(row, buff_x - buff_border, word);
            }
        }
        buff_x += 4;
        pixel_x += 8;
        if pixel_x >= x_max {
            break;
        }
    }
    finish_line(port, geo, abort)
}
