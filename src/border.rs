//! # Capture Border and Auto-Adjust
//!
//! Every TTL source places its visible area slightly differently inside the
//! blanking interval. The border is the offset from the end of sync to the
//! first visible pixel (horizontally) or line (vertically); line capture skips
//! exactly that much.
//!
//! [`BorderAutoAdjuster`] measures the border from a dedicated sampling probe
//! that reports, for each line, a down-counter value taken at the first
//! non-blank pixel. Over a short window of frames it keeps the smallest margin
//! seen on each axis and then commits it.
//!
//! The adjuster never owns the canonical border: the supervisor keeps a
//! [`BorderState`] and lends it to [`BorderAutoAdjuster::frame_tick`].

use crate::VideoFormat;
use log::{debug, info};

/// Only every Nth frame is evaluated, to keep measurement from flickering.
pub const THROTTLE: u32 = 4;
/// Evaluated frames before the accumulators are reset and measuring begins.
pub const START_AFTER: u32 = 2;
/// Evaluated frames until the measurement is committed.
pub const DURATION: u32 = 16;
/// Horizontal accumulator start value (worst case).
pub const X_BORDER_INIT: u32 = 164;
/// Vertical accumulator start value (worst case).
pub const Y_BORDER_INIT: u32 = 64;
/// Lines the border probe lags behind capture; its FIFO fills during retrace.
pub const PROBE_LINE_LATENCY: u32 = 4;
/// Packed value meaning "no border stored".
pub const INVALID_BORDER: u32 = u32::MAX;

/// Start value of the border probe's down-counter for `format`.
pub const fn border_counter(format: VideoFormat) -> u32 {
    match format {
        VideoFormat::Cga | VideoFormat::Ega => 700,
        VideoFormat::Mda => 800,
    }
}

/// Horizontal and vertical capture offsets. `x` is always a multiple of 4.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BorderOffsets {
    x: u32,
    y: u32,
}

impl BorderOffsets {
    /// Builds offsets, rounding `x` down to a whole word.
    pub const fn new(x: u32, y: u32) -> Self {
        BorderOffsets { x: x & !3, y }
    }

    pub const fn x(&self) -> u32 {
        self.x
    }

    pub const fn y(&self) -> u32 {
        self.y
    }

    /// Store encoding: `x` in the low half-word, `y` in the high one.
    pub fn pack(&self) -> u32 {
        (self.x & 0xffff) | ((self.y & 0xffff) << 16)
    }

    /// Inverse of [`BorderOffsets::pack`]; [`INVALID_BORDER`] decodes to `None`.
    pub fn unpack(raw: u32) -> Option<Self> {
        if raw == INVALID_BORDER {
            return None;
        }
        Some(Self::new(raw & 0xffff, raw >> 16))
    }
}

/// Axes the user has pinned by hand; a pinned axis is never measured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BorderPins {
    pub x: Option<u32>,
    pub y: Option<u32>,
}

impl BorderPins {
    fn apply(&self, measured: BorderOffsets) -> BorderOffsets {
        BorderOffsets::new(
            self.x.unwrap_or(measured.x),
            self.y.unwrap_or(measured.y),
        )
    }
}

/// Canonical border values, owned by the supervisor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BorderState {
    /// Offsets used by line capture right now.
    pub active: BorderOffsets,
    /// Last committed border per format family, indexed by [`VideoFormat::index`].
    pub stored: [Option<BorderOffsets>; 3],
    pub pins: BorderPins,
}

impl BorderState {
    pub fn stored_for(&self, format: VideoFormat) -> Option<BorderOffsets> {
        self.stored[format.index()]
    }

    /// Re-applies the stored border of `format`, if there is one, honoring pins.
    /// Returns whether a stored border existed.
    pub fn restore(&mut self, format: VideoFormat) -> bool {
        match self.stored_for(format) {
            Some(stored) => {
                self.active = self.pins.apply(stored);
                true
            }
            None => {
                self.active = self.pins.apply(self.active);
                false
            }
        }
    }
}

/// Result of a finished measurement window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BorderCommit {
    pub offsets: BorderOffsets,
    /// The active border moved; the caller should clear stale pixels.
    pub changed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjusterMode {
    Off,
    SingleShot,
    Continuous,
}

/// Windowed min-tracking border measurement.
#[derive(Debug)]
pub struct BorderAutoAdjuster {
    mode: AdjusterMode,
    start_frame: u32,
    stop_frame: u32,
    frame_cnt: u32,
    throttle_cnt: u32,
    tmp_x: u32,
    tmp_y: u32,
}

impl Default for BorderAutoAdjuster {
    fn default() -> Self {
        Self::new()
    }
}

impl BorderAutoAdjuster {
    pub fn new() -> Self {
        BorderAutoAdjuster {
            mode: AdjusterMode::Off,
            start_frame: 0,
            stop_frame: 0,
            frame_cnt: 0,
            throttle_cnt: 0,
            tmp_x: X_BORDER_INIT,
            tmp_y: Y_BORDER_INIT,
        }
    }

    pub fn mode(&self) -> AdjusterMode {
        self.mode
    }

    pub fn is_continuous(&self) -> bool {
        self.mode == AdjusterMode::Continuous
    }

    fn reset_accumulators(&mut self) {
        self.tmp_x = X_BORDER_INIT;
        self.tmp_y = Y_BORDER_INIT;
    }

    /// Arms a new measurement window. A running adjuster keeps its mode and
    /// just restarts the window.
    pub fn force_start(&mut self, continuous: bool) {
        if self.mode == AdjusterMode::Off {
            self.mode = if continuous {
                AdjusterMode::Continuous
            } else {
                AdjusterMode::SingleShot
            };
        }
        self.frame_cnt = 0;
        self.start_frame = self.frame_cnt + START_AFTER;
        self.stop_frame = self.frame_cnt + DURATION;
        self.reset_accumulators();
    }

    pub fn stop(&mut self) {
        self.mode = AdjusterMode::Off;
    }

    /// Feeds one line's probe sample. `raw` of `0xffffffff` means the probe saw
    /// nothing and counts as a blank line.
    pub fn collect(&mut self, raw: u32, counter: u32, line: u32) {
        if self.mode == AdjusterMode::Off {
            return;
        }
        let raw = if raw == u32::MAX { 0 } else { raw };
        let border = counter.wrapping_sub(raw) & !3;
        self.tmp_x = self.tmp_x.min(border);
        if raw != 0 {
            self.tmp_y = self.tmp_y.min(line.saturating_sub(PROBE_LINE_LATENCY));
        }
    }

    /// Advances the window by one frame. On the stop frame the measured border
    /// (with pinned axes substituted) becomes `state.active` and the stored
    /// border of `format`, and a continuous adjuster re-arms.
    pub fn frame_tick(
        &mut self,
        state: &mut BorderState,
        format: VideoFormat,
    ) -> Option<BorderCommit> {
        if self.mode == AdjusterMode::Off {
            return None;
        }
        self.throttle_cnt = self.throttle_cnt.wrapping_add(1);
        if self.throttle_cnt % THROTTLE != 0 {
            return None;
        }
        self.frame_cnt += 1;
        if self.frame_cnt == self.start_frame {
            self.reset_accumulators();
            return None;
        }
        if self.frame_cnt != self.stop_frame {
            return None;
        }

        let offsets = state.pins.apply(BorderOffsets::new(self.tmp_x, self.tmp_y));
        let changed = offsets != state.active;
        state.active = offsets;
        state.stored[format.index()] = Some(offsets);
        info!(
            "Auto adjust {}: x={} y={}{}",
            format,
            offsets.x(),
            offsets.y(),
            if changed { "" } else { " (unchanged)" }
        );

        match self.mode {
            AdjusterMode::Continuous => self.force_start(true),
            _ => {
                debug!("Single-shot auto adjust finished");
                self.mode = AdjusterMode::Off;
            }
        }
        Some(BorderCommit { offsets, changed })
    }
}
