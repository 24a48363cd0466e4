//! # Hardware Seams
//!
//! The engine never touches pins or sampler registers directly. It sees:
//!
//! - [`SignalPort`]: the data plane owned by the acquisition context. Raw
//!   sync levels, the sampler FIFOs and a microsecond clock.
//! - [`SamplerBackend`]: the control plane. Claiming slots and installing,
//!   draining, enabling or removing sampling programs. Shared by both contexts
//!   through [`crate::program_loader::ProgramLoader`].
//! - [`NoSignalWatch`]: the independent "is anything plugged in" probe the
//!   output context polls.
//!
//! ## Suspension points
//! The acquisition context only ever blocks in the spin waits below. They have
//! no timeout. Liveness on a dead input comes from the coordinator raising the
//! context's [`AbortToken`], which makes the pending wait return
//! [`HardwareError::Aborted`].

use crate::clock_divider::ClockDivider;
use crate::VideoFormat;
use std::fmt;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Number of independent sampler blocks.
pub const SAMPLER_BLOCKS: usize = 2;
/// Program slots per block.
pub const SLOTS_PER_BLOCK: usize = 4;
/// Block used by the acquisition context.
pub const ACQUISITION_BLOCK: usize = 0;
/// Block used by the output context.
pub const OUTPUT_BLOCK: usize = 1;

/// Failures of the sampling hardware layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// Every slot of the block is taken. Indicates a wiring defect.
    #[error("no free sampler slot in block {0}")]
    NoFreeSlot(usize),

    /// The slot was never claimed or is out of range.
    #[error("unknown sampler slot {0}")]
    UnknownSlot(SlotId),

    /// The backend refused the program or its configuration.
    #[error("program rejected: {0}")]
    Rejected(String),

    /// The coordinator asked this context to stop.
    #[error("acquisition aborted")]
    Aborted,
}

/// Address of one program slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId {
    pub block: usize,
    pub index: usize,
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.index)
    }
}

/// Programs the sampler can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerProgram {
    /// Pixel sampler, stretched to `grain` steps per pixel.
    Pixels { format: VideoFormat, grain: u32 },
    /// First-visible-pixel probe feeding the border adjuster.
    Border { format: VideoFormat },
    /// Low-time counter on the vertical sync line.
    VSyncPolarity,
    /// Low-time counter on the horizontal sync line.
    HSyncPolarity,
    /// Watches for any sync activity.
    NoSignal,
    /// Re-emits the frame buffer in the output format.
    Output { format: VideoFormat },
}

impl SamplerProgram {
    pub fn name(&self) -> String {
        match self {
            SamplerProgram::Pixels { format, grain } => format!("{} pixels/{}", format, grain),
            SamplerProgram::Border { format } => format!("{} border", format),
            SamplerProgram::VSyncPolarity => "vsync polarity".to_string(),
            SamplerProgram::HSyncPolarity => "hsync polarity".to_string(),
            SamplerProgram::NoSignal => "no signal".to_string(),
            SamplerProgram::Output { format } => format!("{} output", format),
        }
    }
}

/// Per-install settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ProgramConfig {
    pub divider: ClockDivider,
    /// Sampling phase in program steps (pixel programs only).
    pub sampling_offset: u32,
    /// Value preloaded into the program's counter register.
    pub counter_init: Option<u32>,
}

/// Data plane of the acquisition context.
pub trait SignalPort: Send {
    fn hsync_level(&mut self) -> bool;
    fn vsync_level(&mut self) -> bool;
    /// Next packed pixel word, if one is queued.
    fn try_pop_pixels(&mut self) -> Option<u32>;
    /// Next border probe sample, one per line.
    fn try_pop_border(&mut self) -> Option<u32>;
    /// Latest vertical low-time count, one per frame.
    fn try_pop_vsync_polarity(&mut self) -> Option<u32>;
    /// Latest horizontal low-time count.
    fn try_pop_hsync_polarity(&mut self) -> Option<u32>;
    /// Monotonic time in microseconds.
    fn now_us(&mut self) -> u64;
}

/// Control plane of the sampler.
pub trait SamplerBackend: Send {
    /// Reserves a free slot in `block`.
    fn claim(&mut self, block: usize) -> Result<SlotId, HardwareError>;
    fn unclaim(&mut self, slot: SlotId);
    fn install(
        &mut self,
        slot: SlotId,
        program: &SamplerProgram,
        config: &ProgramConfig,
    ) -> Result<(), HardwareError>;
    fn remove(&mut self, slot: SlotId);
    /// Drops whatever the slot's FIFO still holds.
    fn drain(&mut self, slot: SlotId);
    fn set_enabled(&mut self, slot: SlotId, enabled: bool);
}

/// Independent probe for input presence.
pub trait NoSignalWatch: Send + Sync {
    fn signal_present(&self) -> bool;
}

/// Cooperative stop request for one run of the acquisition context.
#[derive(Clone, Debug, Default)]
pub struct AbortToken(Arc<AtomicBool>);

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn check(&self) -> Result<(), HardwareError> {
        if self.is_raised() {
            Err(HardwareError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Spins until the horizontal sync line reads `level`.
#[inline]
pub fn wait_hsync<P: SignalPort + ?Sized>(
    port: &mut P,
    level: bool,
    abort: &AbortToken,
) -> Result<(), HardwareError> {
    while port.hsync_level() != level {
        abort.check()?;
        spin_loop();
    }
    Ok(())
}

/// Spins until the vertical sync line reads `level`.
#[inline]
pub fn wait_vsync<P: SignalPort + ?Sized>(
    port: &mut P,
    level: bool,
    abort: &AbortToken,
) -> Result<(), HardwareError> {
    while port.vsync_level() != level {
        abort.check()?;
        spin_loop();
    }
    Ok(())
}

/// Spins until a pixel word is available.
#[inline]
pub fn pop_pixels_blocking<P: SignalPort + ?Sized>(
    port: &mut P,
    abort: &AbortToken,
) -> Result<u32, HardwareError> {
    loop {
        if let Some(word) = port.try_pop_pixels() {
            return Ok(word);
        }
        abort.check()?;
        spin_loop();
    }
}

/// Spins until the border probe has a sample.
#[inline]
pub fn pop_border_blocking<P: SignalPort + ?Sized>(
    port: &mut P,
    abort: &AbortToken,
) -> Result<u32, HardwareError> {
    loop {
        if let Some(raw) = port.try_pop_border() {
            return Ok(raw);
        }
        abort.check()?;
        spin_loop();
    }
}

/// Most recent sample of a polarity probe, discarding older ones.
pub fn latest<F: FnMut() -> Option<u32>>(mut pop: F) -> Option<u32> {
    let mut last = None;
    while let Some(v) = pop() {
        last = Some(v);
    }
    last
}
