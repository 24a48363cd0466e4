//! # Timing Profiles and the Preset Catalog
//!
//! A [`TimingProfile`] describes one TTL video mode: blanking intervals for
//! both axes, sync polarities, nominal rates and the pixel clock. The catalog is
//! a fixed table; its order is the priority among presets that share the same
//! vertical rate and polarity.
//!
//! ## Field convention
//! `front_porch` is the blank interval between the end of the sync pulse and
//! the first visible pixel (or line). It is the initial capture border of the
//! profile. `back_porch` is the blank interval after the visible area.
//!
//! ## Alignment
//! Horizontal visible counts are multiples of 4 so that captured lines can be
//! moved in whole 32-bit words. The presets carry 8 extra pixels of slack on
//! top of the nominal width because the measured border is only accurate to a
//! few pixels.

use crate::border::BorderPins;
use crate::frame_buffer::{BUFF_X, BUFF_Y, XB, YB};
use crate::{Polarity, VideoFormat};

/// Blanking and visible counts along one axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisTiming {
    pub front_porch: u32,
    pub visible: u32,
    pub back_porch: u32,
    pub sync: u32,
}

impl AxisTiming {
    pub const fn total(&self) -> u32 {
        self.front_porch + self.visible + self.back_porch + self.sync
    }
}

/// Immutable description of a TTL video mode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimingProfile {
    pub name: &'static str,
    pub format: VideoFormat,
    pub horizontal: AxisTiming,
    pub vertical: AxisTiming,
    pub h_polarity: Polarity,
    pub v_polarity: Polarity,
    pub h_hz: f32,
    pub v_hz: f32,
    pub pixel_clock_hz: u32,
}

impl TimingProfile {
    /// True when both profiles capture into the same buffer layout, which is
    /// all the output renderer cares about.
    pub fn same_geometry(&self, other: &TimingProfile) -> bool {
        self.format == other.format
            && self.horizontal.visible == other.horizontal.visible
            && self.vertical.visible == other.vertical.visible
    }

    /// Capture border `(x, y)` assumed before any measurement.
    pub fn border_origin(&self) -> (u32, u32) {
        (self.horizontal.front_porch & !3, self.vertical.front_porch)
    }

    /// VSync level that marks the vertical retrace.
    pub fn retrace_level(&self) -> bool {
        self.v_polarity.asserted_level()
    }

    /// Tells the 350-line EGA mode apart from the 200-line modes.
    pub fn is_high_res(&self) -> bool {
        self.vertical.visible > 200
    }

    /// First buffer row covered by the on-screen text strip.
    pub fn text_row_top(&self) -> u32 {
        self.vertical.visible / 2
    }

    /// Width of a captured line in buffer bytes.
    pub fn row_bytes(&self) -> u32 {
        let width = if self.format.packs_two_pixels_per_byte() {
            self.horizontal.visible / 2
        } else {
            self.horizontal.visible
        };
        width.min(BUFF_X as u32)
    }

    /// One-line description, e.g. `CGA 648x200 V:60Hz- H:15700Hz+`.
    pub fn summary(&self) -> String {
        format!(
            "{} {}x{} V:{:.0}Hz{} H:{:.0}Hz{}",
            self.format,
            self.horizontal.visible,
            self.vertical.visible,
            self.v_hz,
            self.v_polarity,
            self.h_hz,
            self.h_polarity
        )
    }
}

/// Maximum distance between a measured and a nominal vertical rate.
pub const HZ_TOLERANCE: f32 = 1.0;

const fn axis(front_porch: u32, visible: u32, back_porch: u32, sync: u32) -> AxisTiming {
    AxisTiming {
        front_porch,
        visible,
        back_porch,
        sync,
    }
}

/// The known TTL modes. Table order is lookup priority.
pub const PRESETS: [TimingProfile; 4] = [
    TimingProfile {
        name: "MDA 720x350@50Hz",
        format: VideoFormat::Mda,
        horizontal: axis(16, 720 + XB as u32, 20, 126),
        vertical: axis(20, 350, 4, 16),
        h_polarity: Polarity::Pos,
        v_polarity: Polarity::Neg,
        h_hz: 18430.0,
        v_hz: 50.0,
        pixel_clock_hz: 16_257_000,
    },
    TimingProfile {
        name: "CGA 640x200@60Hz",
        format: VideoFormat::Cga,
        horizontal: axis(68, 640 + XB as u32, 40, 163),
        vertical: axis(30, 200, 30, 3),
        h_polarity: Polarity::Pos,
        v_polarity: Polarity::Pos,
        h_hz: 15700.0,
        v_hz: 60.0,
        pixel_clock_hz: 14_318_181,
    },
    // Electrically a CGA mode, so it shares the CGA capture path and settings.
    TimingProfile {
        name: "EGA 640x200@60Hz",
        format: VideoFormat::Cga,
        horizontal: axis(68, 640 + XB as u32, 40, 163),
        vertical: axis(20, 200, 40, 3),
        h_polarity: Polarity::Pos,
        v_polarity: Polarity::Pos,
        h_hz: 15700.0,
        v_hz: 60.0,
        pixel_clock_hz: 14_318_181,
    },
    TimingProfile {
        name: "EGA 640x350@60Hz",
        format: VideoFormat::Ega,
        horizontal: axis(28, 640 + XB as u32, 20, 56),
        vertical: axis(4, 350, 56, 3),
        h_polarity: Polarity::Pos,
        v_polarity: Polarity::Neg,
        h_hz: 21850.0,
        v_hz: 60.0,
        pixel_clock_hz: 16_257_000,
    },
];

/// Index into [`PRESETS`] of the profile used before anything is detected.
pub const DEFAULT_PRESET: usize = 2;

/// Finds the first preset whose vertical polarity matches exactly and whose
/// vertical rate is within [`HZ_TOLERANCE`] of `measured_hz`.
pub fn lookup(v_polarity: Polarity, measured_hz: f32) -> Option<&'static TimingProfile> {
    PRESETS
        .iter()
        .find(|p| (measured_hz - p.v_hz).abs() <= HZ_TOLERANCE && p.v_polarity == v_polarity)
}

/// Finds a preset by name, ignoring case.
pub fn preset(name: &str) -> Option<&'static TimingProfile> {
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

pub fn default_profile() -> &'static TimingProfile {
    &PRESETS[DEFAULT_PRESET]
}

/// The preset that owns the default settings of a format family.
pub fn reference_profile(format: VideoFormat) -> &'static TimingProfile {
    match format {
        VideoFormat::Mda => &PRESETS[0],
        VideoFormat::Cga => &PRESETS[1],
        VideoFormat::Ega => &PRESETS[3],
    }
}

/// Factory pixel clock of a format family.
pub fn nominal_pixel_clock(format: VideoFormat) -> u32 {
    reference_profile(format).pixel_clock_hz
}

// Manual override limits.
const H_VISIBLE_MIN: u32 = 64;
const H_VISIBLE_STEP: u32 = 8;
const MDA_H_VISIBLE_MAX: u32 = 800;
const V_VISIBLE_MIN: u32 = 32;
const V_VISIBLE_MAX: u32 = (BUFF_Y - YB) as u32;
const V_VISIBLE_STEP: u32 = 2;
const H_BORDER_MAX: u32 = 400;
const H_BORDER_STEP: u32 = 4;
const V_BORDER_MAX: u32 = 200;

/// Entries of the manual timing menu, in menu order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManualItem {
    Enabled,
    Format,
    HVisible,
    VVisible,
    XBorderAuto,
    XBorder,
    YBorderAuto,
    YBorder,
    SamplingOffset,
}

impl ManualItem {
    pub const ALL: [ManualItem; 9] = [
        ManualItem::Enabled,
        ManualItem::Format,
        ManualItem::HVisible,
        ManualItem::VVisible,
        ManualItem::XBorderAuto,
        ManualItem::XBorder,
        ManualItem::YBorderAuto,
        ManualItem::YBorder,
        ManualItem::SamplingOffset,
    ];

    pub fn next(self) -> Self {
        let idx = Self::ALL.iter().position(|i| *i == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }

    pub fn label(self) -> &'static str {
        match self {
            ManualItem::Enabled => "MANUAL",
            ManualItem::Format => "MODE",
            ManualItem::HVisible => "HORIZ",
            ManualItem::VVisible => "VERT",
            ManualItem::XBorderAuto => "X BORDER AUTO",
            ManualItem::XBorder => "X BORDER",
            ManualItem::YBorderAuto => "Y BORDER AUTO",
            ManualItem::YBorder => "Y BORDER",
            ManualItem::SamplingOffset => "SAMPLING OFFSET",
        }
    }
}

/// User-forced timing that replaces auto-detection while enabled.
///
/// Every edit is clamped on the spot; there is no invalid manual timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManualTiming {
    pub enabled: bool,
    pub format: VideoFormat,
    pub h_visible: u32,
    pub v_visible: u32,
    pub x_border_auto: bool,
    pub h_border: u32,
    pub y_border_auto: bool,
    pub v_border: u32,
}

impl Default for ManualTiming {
    fn default() -> Self {
        Self::from_profile(default_profile())
    }
}

impl ManualTiming {
    /// Seeds the manual values from an existing profile, disabled.
    pub fn from_profile(profile: &TimingProfile) -> Self {
        let (h_border, v_border) = profile.border_origin();
        ManualTiming {
            enabled: false,
            format: profile.format,
            h_visible: profile.horizontal.visible,
            v_visible: profile.vertical.visible,
            x_border_auto: true,
            h_border,
            y_border_auto: true,
            v_border,
        }
    }

    fn h_visible_max(format: VideoFormat) -> u32 {
        match format {
            VideoFormat::Mda => MDA_H_VISIBLE_MAX,
            VideoFormat::Cga | VideoFormat::Ega => BUFF_X as u32,
        }
    }

    /// Forces every field into its legal range.
    pub fn clamped(mut self) -> Self {
        let h_max = Self::h_visible_max(self.format);
        self.h_visible = self.h_visible.clamp(H_VISIBLE_MIN, h_max) & !3;
        self.v_visible = self.v_visible.clamp(V_VISIBLE_MIN, V_VISIBLE_MAX);
        self.h_border = self.h_border.min(H_BORDER_MAX) & !3;
        self.v_border = self.v_border.min(V_BORDER_MAX);
        self
    }

    /// Applies one menu step to `item`. Toggles flip regardless of direction.
    /// [`ManualItem::SamplingOffset`] lives with the calibration state and is
    /// left untouched here.
    pub fn adjust(&mut self, item: ManualItem, increase: bool) {
        let step = |val: u32, by: u32| {
            if increase {
                val.saturating_add(by)
            } else {
                val.saturating_sub(by)
            }
        };
        match item {
            ManualItem::Enabled => self.enabled = !self.enabled,
            ManualItem::Format => {
                self.format = if increase {
                    self.format.next()
                } else {
                    self.format.prev()
                }
            }
            ManualItem::HVisible => self.h_visible = step(self.h_visible, H_VISIBLE_STEP),
            ManualItem::VVisible => self.v_visible = step(self.v_visible, V_VISIBLE_STEP),
            ManualItem::XBorderAuto => self.x_border_auto = !self.x_border_auto,
            ManualItem::XBorder => self.h_border = step(self.h_border, H_BORDER_STEP),
            ManualItem::YBorderAuto => self.y_border_auto = !self.y_border_auto,
            ManualItem::YBorder => self.v_border = step(self.v_border, 1),
            ManualItem::SamplingOffset => {}
        }
        *self = self.clamped();
    }

    /// Text shown for `item` in the menu.
    pub fn describe(&self, item: ManualItem) -> String {
        let on_off = |b: bool| if b { "ON" } else { "OFF" };
        match item {
            ManualItem::Enabled => on_off(self.enabled).to_string(),
            ManualItem::Format => self.format.to_string(),
            ManualItem::HVisible => self.h_visible.to_string(),
            ManualItem::VVisible => self.v_visible.to_string(),
            ManualItem::XBorderAuto => on_off(self.x_border_auto).to_string(),
            ManualItem::XBorder => self.h_border.to_string(),
            ManualItem::YBorderAuto => on_off(self.y_border_auto).to_string(),
            ManualItem::YBorder => self.v_border.to_string(),
            ManualItem::SamplingOffset => String::new(),
        }
    }

    /// Builds the substitute profile. Polarities and rates are taken from the
    /// live measurement because the user only pins the geometry.
    pub fn to_profile(
        &self,
        h_polarity: Polarity,
        v_polarity: Polarity,
        h_hz: f32,
        v_hz: f32,
    ) -> TimingProfile {
        let base = reference_profile(self.format);
        let mut horizontal = base.horizontal;
        horizontal.visible = self.h_visible;
        horizontal.front_porch = self.h_border;
        let mut vertical = base.vertical;
        vertical.visible = self.v_visible;
        vertical.front_porch = self.v_border;
        TimingProfile {
            name: "MANUAL",
            format: self.format,
            horizontal,
            vertical,
            h_polarity,
            v_polarity,
            h_hz,
            v_hz,
            pixel_clock_hz: base.pixel_clock_hz,
        }
    }

    /// Border axes the user has pinned. Only meaningful while enabled.
    pub fn border_pins(&self) -> BorderPins {
        if !self.enabled {
            return BorderPins::default();
        }
        BorderPins {
            x: (!self.x_border_auto).then_some(self.h_border),
            y: (!self.y_border_auto).then_some(self.v_border),
        }
    }
}
