//! # On-Screen Text
//!
//! Status messages go into the frame buffer's text strip and are copied over
//! the middle of the picture once per frame until they expire. The information
//! page is drawn straight into the picture area, since capture is paused while
//! it is shown.
//!
//! Drawing goes through `embedded-graphics` mono fonts: the buffer regions are
//! exposed as `DrawTarget<Color = BinaryColor>` canvases that translate lit
//! pixels into the active format's text colour.

use crate::frame_buffer::{text_color, FrameBuffer, BUFF_X, BUFF_Y, TXT_ROWS};
use crate::timings::TimingProfile;
use crate::VideoFormat;
use core::convert::Infallible;
use embedded_graphics::{
    mono_font::{
        ascii::{FONT_5X8, FONT_6X10},
        MonoFont, MonoTextStyle,
    },
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Text sink used by the supervisor. Calls never block.
pub trait TextOverlay: Send {
    /// Follows the active profile so text lands in the right place and packing.
    fn set_profile(&mut self, profile: &TimingProfile);
    /// Shows a one-line message for `duration_ms`, or until replaced when 0.
    fn display_text(&mut self, text: &str, duration_ms: u32);
    /// Shows a multi-line page over the whole picture.
    fn display_page(&mut self, text: &str);
    fn clear_text(&mut self);
    /// Expires old messages and stamps the current one onto the picture.
    /// Returns whether a message strip is showing.
    fn tick(&mut self) -> bool;
}

/// Draws into one of the frame buffer's regions.
struct Canvas<'a> {
    buffer: &'a FrameBuffer,
    format: VideoFormat,
    color: u8,
    size: Size,
    strip: bool,
}

impl OriginDimensions for Canvas<'_> {
    fn size(&self) -> Size {
        self.size
    }
}

impl DrawTarget for Canvas<'_> {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(p, c) in pixels {
            let value = if c.is_on() { self.color } else { 0 };
            if self.strip {
                self.buffer.set_overlay_pixel(self.format, p.y, p.x, value);
            } else {
                self.buffer.set_pixel(self.format, p.y, p.x, value);
            }
        }
        Ok(())
    }
}

fn text_width(font: &MonoFont<'_>, text: &str) -> u32 {
    let advance = font.character_size.width + font.character_spacing;
    text.chars().count() as u32 * advance
}

struct Message {
    expires: Option<Instant>,
}

/// [`TextOverlay`] that renders into the shared frame buffer.
pub struct FrameBufferOverlay {
    buffer: Arc<FrameBuffer>,
    format: VideoFormat,
    width: u32,
    height: u32,
    text_top: usize,
    message: Option<Message>,
}

impl FrameBufferOverlay {
    pub fn new(buffer: Arc<FrameBuffer>, profile: &TimingProfile) -> Self {
        let mut overlay = FrameBufferOverlay {
            buffer,
            format: profile.format,
            width: 0,
            height: 0,
            text_top: 0,
            message: None,
        };
        overlay.set_profile(profile);
        overlay
    }

    fn canvas(&self, strip: bool) -> Canvas<'_> {
        let height = if strip { TXT_ROWS as u32 } else { self.height };
        Canvas {
            buffer: &self.buffer,
            format: self.format,
            color: text_color(self.format),
            size: Size::new(self.width, height),
            strip,
        }
    }
}

impl TextOverlay for FrameBufferOverlay {
    fn set_profile(&mut self, profile: &TimingProfile) {
        self.format = profile.format;
        self.width = profile.horizontal.visible.min(BUFF_X as u32 * 2);
        self.height = profile.vertical.visible.min(BUFF_Y as u32);
        self.text_top = (profile.text_row_top() as usize).min(BUFF_Y - TXT_ROWS);
    }

    fn display_text(&mut self, text: &str, duration_ms: u32) {
        self.buffer.clear_overlay();
        let line = text.split('\n').collect::<Vec<_>>().join("  ");
        let x = self.width.saturating_sub(text_width(&FONT_5X8, &line)) / 2;
        let style = MonoTextStyle::new(&FONT_5X8, BinaryColor::On);
        Text::with_baseline(&line, Point::new(x as i32, 0), style, Baseline::Top)
            .draw(&mut self.canvas(true))
            .ok();
        self.message = Some(Message {
            expires: (duration_ms > 0)
                .then(|| Instant::now() + Duration::from_millis(u64::from(duration_ms))),
        });
    }

    fn display_page(&mut self, text: &str) {
        self.clear_text();
        self.buffer.clear();
        let style = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
        let line_height = FONT_6X10.character_size.height as i32 + 2;
        let mut canvas = self.canvas(false);
        for (i, line) in text.lines().enumerate() {
            Text::with_baseline(
                line,
                Point::new(8, 8 + i as i32 * line_height),
                style,
                Baseline::Top,
            )
            .draw(&mut canvas)
            .ok();
        }
    }

    fn clear_text(&mut self) {
        self.message = None;
        self.buffer.clear_overlay();
    }

    fn tick(&mut self) -> bool {
        let expired = match &self.message {
            None => return false,
            Some(msg) => msg.expires.map_or(false, |at| Instant::now() >= at),
        };
        if expired {
            self.clear_text();
            return false;
        }
        self.buffer.copy_overlay_to_screen(self.text_top);
        true
    }
}

/// Everything sent to a [`RecordingOverlay`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OverlayEvent {
    Text(String),
    Page(String),
    Clear,
}

/// Shared view of a [`RecordingOverlay`]'s history.
#[derive(Clone, Debug, Default)]
pub struct OverlayLog(Arc<Mutex<Vec<OverlayEvent>>>);

impl OverlayLog {
    pub fn events(&self) -> Vec<OverlayEvent> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Texts shown so far, in order.
    pub fn texts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OverlayEvent::Text(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.texts().iter().filter(|t| t.contains(needle)).count()
    }

    fn push(&self, event: OverlayEvent) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Overlay that only records what it was asked to show.
#[derive(Debug, Default)]
pub struct RecordingOverlay {
    log: OverlayLog,
    showing: bool,
}

impl RecordingOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> OverlayLog {
        self.log.clone()
    }
}

impl TextOverlay for RecordingOverlay {
    fn set_profile(&mut self, _profile: &TimingProfile) {}

    fn display_text(&mut self, text: &str, _duration_ms: u32) {
        self.showing = true;
        self.log.push(OverlayEvent::Text(text.to_string()));
    }

    fn display_page(&mut self, text: &str) {
        self.log.push(OverlayEvent::Page(text.to_string()));
    }

    fn clear_text(&mut self) {
        self.showing = false;
        self.log.push(OverlayEvent::Clear);
    }

    fn tick(&mut self) -> bool {
        self.showing
    }
}
