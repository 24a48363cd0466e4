//! # TTL Reader Core Library
//!
//! This library digitizes the TTL video signal produced by legacy MDA, CGA and
//! EGA display adapters. It detects the incoming timing, tunes the sampling
//! clock to the adapter's pixel clock and captures every scanline into a shared
//! frame buffer that an independent output renderer keeps consuming.
//!
//! ## Design Philosophy
//!
//! ### Hardware behind narrow seams
//! - **Data plane**: sync levels and sampled pixel words arrive through
//!   [`hardware::SignalPort`]; the capture loop only ever spins on the named
//!   waits in [`hardware`]
//! - **Control plane**: sampling programs are installed through the shared
//!   [`program_loader::ProgramLoader`], which serializes both execution contexts
//! - **Everything else** (buttons, text overlay, configuration store, output
//!   renderer) is consumed through small traits so the engine runs unchanged
//!   against the synthetic signal in [`sim`]
//!
//! ### Two execution contexts
//! 1. **Acquisition**: [`supervisor::ModeSupervisor`] owns detection,
//!    calibration, border auto-adjust and per-line capture
//! 2. **Output**: [`pipeline::PipelineCoordinator`] renders the frame buffer at
//!    its own cadence and restarts acquisition when the input signal comes and goes
//!
//! The two contexts share exactly two things: the lock-free
//! [`frame_buffer::FrameBuffer`] and the [`pipeline::SharedTiming`] handle,
//! which is swapped as a whole whenever the active profile changes.
//!
//! ## Core Types
//! - [`VideoFormat`]: the three TTL families, and the single dispatch point for
//!   every format-specialized code path
//! - [`Polarity`]: sync pulse polarity

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod border;
pub mod calibrator;
pub mod clock_divider;
pub mod config;
pub mod config_store;
pub mod frame_buffer;
#[cfg(feature = "hardware")]
pub mod hal_port;
pub mod hardware;
pub mod input;
pub mod line_capture;
pub mod measure;
pub mod overlay;
pub mod pipeline;
pub mod preview;
pub mod program_loader;
pub mod sim;
pub mod supervisor;
pub mod timings;

pub use clock_divider::ClockDivider;
pub use timings::TimingProfile;

/// One of the three TTL video families.
///
/// The format decides how pixels are sampled (6-bit RGBI for CGA/EGA, 2-bit
/// video/intensity for MDA) and how they are packed in the frame buffer.
///
/// # Example
/// ```
/// use ttl_reader_lib::VideoFormat;
///
/// assert_eq!(VideoFormat::Mda.index(), 0);
/// assert_eq!(VideoFormat::from_index(2), Some(VideoFormat::Ega));
/// assert!(VideoFormat::Mda.packs_two_pixels_per_byte());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoFormat {
    /// Monochrome, 2 bits per pixel, two pixels packed per byte
    Mda,
    /// 4-color 640x200, one 6-bit pixel per byte
    Cga,
    /// 16-color, up to 640x350, one 6-bit pixel per byte
    Ega,
}

impl VideoFormat {
    /// All formats in persisted order.
    pub const ALL: [VideoFormat; 3] = [VideoFormat::Mda, VideoFormat::Cga, VideoFormat::Ega];

    /// Stable index used for per-format arrays and the configuration store.
    pub const fn index(self) -> usize {
        match self {
            VideoFormat::Mda => 0,
            VideoFormat::Cga => 1,
            VideoFormat::Ega => 2,
        }
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            VideoFormat::Mda => "MDA",
            VideoFormat::Cga => "CGA",
            VideoFormat::Ega => "EGA",
        }
    }

    /// Number of pixels the sampling hardware packs into one 32-bit word.
    pub const fn pixels_per_word(self) -> u32 {
        match self {
            VideoFormat::Mda => 8,
            VideoFormat::Cga | VideoFormat::Ega => 4,
        }
    }

    pub const fn packs_two_pixels_per_byte(self) -> bool {
        matches!(self, VideoFormat::Mda)
    }

    /// Next format in menu order, wrapping around.
    pub fn next(self) -> Self {
        Self::ALL[(self.index() + 1) % Self::ALL.len()]
    }

    /// Previous format in menu order, wrapping around.
    pub fn prev(self) -> Self {
        Self::ALL[(self.index() + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sync pulse polarity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    /// Pulse is high, line idles low
    Pos,
    /// Pulse is low, line idles high
    Neg,
}

impl Polarity {
    /// The raw line level seen while the sync pulse is asserted.
    pub const fn asserted_level(self) -> bool {
        matches!(self, Polarity::Pos)
    }

    pub const fn symbol(self) -> char {
        match self {
            Polarity::Pos => '+',
            Polarity::Neg => '-',
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}
