//! # Mode Supervisor
//!
//! The acquisition context's main loop. One call to
//! [`ModeSupervisor::run_frame`] is one input frame:
//!
//! 1. sample the buttons
//! 2. capture every line until vertical retrace, feeding the border probe to
//!    the auto-adjuster (skipped while there is no signal or the information
//!    page is up, so a dead input never hangs the menus)
//! 3. let the auto-adjuster finish its window and persist a committed border
//! 4. service the active user action
//! 5. every [`MODE_CHECK_FRAMES`] frames, measure the signal and switch
//!    profile, recalibrate and reprogram the sampler when it changed
//!
//! ## User actions
//! At most one [`UserAction`] is active. Bank switches and auto-adjust
//! requests are only accepted while idle, so they can never interleave with an
//! open editor.
//!
//! ## Failures
//! Unknown modes, bad stored settings and out-of-range edits are handled here
//! and never leave the loop. The only error [`ModeSupervisor::run_frame`]
//! returns in practice is [`HardwareError::Aborted`], raised by the coordinator
//! to restart the context.

use crate::border::{border_counter, BorderAutoAdjuster, BorderOffsets, BorderState};
use crate::calibrator::{border_divider, CalibrationState};
use crate::config_store::{SharedStore, StoredSettings, BANK_COUNT};
use crate::frame_buffer::{FrameBuffer, TXT_ROWS};
use crate::hardware::{
    latest, pop_border_blocking, wait_vsync, AbortToken, HardwareError, ProgramConfig,
    SamplerProgram, SignalPort, ACQUISITION_BLOCK,
};
use crate::input::{ButtonInput, ButtonSample, ButtonState};
use crate::line_capture::{read_line, LineGeometry};
use crate::measure::{
    derive_polarity, horizontal_hz, vertical_hz, FrameClock, SignalMeasurement,
    SYNC_PROBE_COUNTER_INIT,
};
use crate::overlay::TextOverlay;
use crate::pipeline::SharedTiming;
use crate::program_loader::{ClaimedSlot, ProgramLoader};
use crate::timings::{lookup, nominal_pixel_clock, ManualItem, TimingProfile};
use crate::ClockDivider;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Frames between two signal measurements.
pub const MODE_CHECK_FRAMES: u64 = 8;
/// Idle frames after which the pixel-clock editor closes.
pub const PX_CLK_TIMEOUT_FRAMES: u32 = 300;
/// Idle frames after which the manual menu applies and closes.
pub const MANUAL_TIMEOUT_FRAMES: u32 = 300;
pub const PX_CLK_LARGE_STEP: u32 = 10_000;
pub const PX_CLK_SMALL_STEP: u32 = 1_000;
/// Consecutive failed lookups before "unknown mode" is shown.
pub const UNKNOWN_MODE_SHOW_MSG_MIN_COUNT: u32 = 4;
/// Times "unknown mode" is shown at most.
pub const UNKNOWN_MODE_SHOW_MSG_MAX_COUNT: u32 = 5;
/// How long status messages stay up.
pub const TEXT_MS: u32 = 2000;

/// Everything the supervisor owns exclusively and hands back on restart.
pub struct SupervisorIo {
    pub port: Box<dyn SignalPort>,
    pub buttons: Box<dyn ButtonInput>,
    pub overlay: Box<dyn TextOverlay>,
}

/// Host-level knobs of the acquisition context.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SupervisorSettings {
    pub hardware_hz: u32,
    pub auto_adjust_always_on: bool,
    /// Pause per frame while capture is skipped.
    pub idle_pause: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            hardware_hz: 270_000_000,
            auto_adjust_always_on: false,
            idle_pause: Duration::from_millis(16),
        }
    }
}

/// Services shared with the output context, injected by the coordinator.
#[derive(Clone)]
pub struct SupervisorContext {
    pub loader: Arc<ProgramLoader>,
    pub store: Arc<SharedStore>,
    pub buffer: Arc<FrameBuffer>,
    pub timing: SharedTiming,
    pub settings: SupervisorSettings,
}

/// How one run of the acquisition context starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Input is absent: show the placeholder and skip capture.
    pub no_signal: bool,
    /// Discard stored settings (both buttons held at power-up).
    pub reset_to_defaults: bool,
}

/// The single user interaction being serviced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserAction {
    None,
    PixelClock { idle: u32, reset_asked: bool },
    Manual { item: ManualItem, idle: u32 },
    Info,
}

/// Limits how often an unrecognized signal is reported.
#[derive(Debug, Default)]
struct UnknownModeThrottle {
    misses: u32,
    shown: u32,
}

impl UnknownModeThrottle {
    /// Counts a failed lookup; returns whether to show the message now.
    fn miss(&mut self) -> bool {
        self.misses += 1;
        if self.misses >= UNKNOWN_MODE_SHOW_MSG_MIN_COUNT
            && self.shown < UNKNOWN_MODE_SHOW_MSG_MAX_COUNT
        {
            self.shown += 1;
            return true;
        }
        false
    }

    fn hit(&mut self) {
        self.misses = 0;
    }
}

/// Same mode, ignoring the measured rates carried by manual profiles.
fn same_mode(a: &TimingProfile, b: &TimingProfile) -> bool {
    a.name == b.name
        && a.format == b.format
        && a.horizontal == b.horizontal
        && a.vertical == b.vertical
        && a.v_polarity == b.v_polarity
}

fn mhz(hz: u32) -> f64 {
    f64::from(hz) / 1.0e6
}

/// Detection, calibration and capture for one run of the acquisition context.
pub struct ModeSupervisor {
    ctx: SupervisorContext,
    io: SupervisorIo,
    abort: AbortToken,
    no_signal: bool,
    pixels: ClaimedSlot,
    border_probe: ClaimedSlot,
    vsync_probe: ClaimedSlot,
    hsync_probe: ClaimedSlot,
    profile: TimingProfile,
    settings: StoredSettings,
    calibration: [CalibrationState; 3],
    border: BorderState,
    adjuster: BorderAutoAdjuster,
    clock: FrameClock,
    last_frame_us: u64,
    lines_read: u32,
    measurement: SignalMeasurement,
    unknown: UnknownModeThrottle,
    action: UserAction,
    strip_showing: bool,
    frame: u64,
}

impl ModeSupervisor {
    /// Claims the acquisition slots, loads the stored settings and programs
    /// the sampler for the currently published profile.
    ///
    /// Fails only when the sampler has no free slot, which is fatal.
    pub fn start(
        ctx: SupervisorContext,
        io: SupervisorIo,
        abort: AbortToken,
        options: StartOptions,
    ) -> Result<Self, HardwareError> {
        let pixels = ctx.loader.claim(ACQUISITION_BLOCK)?;
        let border_probe = ctx.loader.claim(ACQUISITION_BLOCK)?;
        let vsync_probe = ctx.loader.claim(ACQUISITION_BLOCK)?;
        let hsync_probe = ctx.loader.claim(ACQUISITION_BLOCK)?;

        let settings = if options.reset_to_defaults {
            info!("Resetting stored settings to defaults");
            StoredSettings::default()
        } else {
            ctx.store.load()
        };
        let profile = *ctx.timing.current();
        let measurement = SignalMeasurement {
            v_hz: profile.v_hz,
            h_hz: profile.h_hz,
            v_polarity: profile.v_polarity,
            h_polarity: profile.h_polarity,
        };

        let mut sup = ModeSupervisor {
            ctx,
            io,
            abort,
            no_signal: options.no_signal,
            pixels,
            border_probe,
            vsync_probe,
            hsync_probe,
            profile,
            calibration: CalibrationState::defaults(),
            border: BorderState {
                stored: settings.active().border,
                ..BorderState::default()
            },
            settings,
            adjuster: BorderAutoAdjuster::new(),
            clock: FrameClock::default(),
            last_frame_us: 0,
            lines_read: 0,
            measurement,
            unknown: UnknownModeThrottle::default(),
            action: UserAction::None,
            strip_showing: false,
            frame: 0,
        };

        let probe = ProgramConfig {
            divider: ClockDivider::MIN,
            sampling_offset: 0,
            counter_init: Some(SYNC_PROBE_COUNTER_INIT),
        };
        sup.vsync_probe.load(SamplerProgram::VSyncPolarity, &probe)?;
        sup.hsync_probe.load(SamplerProgram::HSyncPolarity, &probe)?;

        if options.reset_to_defaults {
            sup.save();
            sup.show("RESET TO DEFAULTS");
        }
        if sup.settings.active().manual.enabled {
            sup.profile = sup.manual_profile();
            sup.ctx.timing.publish(sup.profile);
        }
        sup.io.overlay.set_profile(&sup.profile);
        sup.reconfigure()?;
        if sup.ctx.settings.auto_adjust_always_on {
            sup.adjuster.force_start(true);
        }
        if sup.no_signal {
            sup.ctx.buffer.no_signal(&sup.profile);
            sup.io.overlay.display_text("NO SIGNAL", 0);
        }
        info!(
            "Acquisition started: {}{}",
            sup.profile.name,
            if sup.no_signal { " (no signal)" } else { "" }
        );
        Ok(sup)
    }

    pub fn profile(&self) -> &TimingProfile {
        &self.profile
    }

    pub fn settings(&self) -> &StoredSettings {
        &self.settings
    }

    pub fn calibration(&self, format: crate::VideoFormat) -> &CalibrationState {
        &self.calibration[format.index()]
    }

    pub fn border(&self) -> &BorderState {
        &self.border
    }

    pub fn adjuster(&self) -> &BorderAutoAdjuster {
        &self.adjuster
    }

    pub fn measurement(&self) -> &SignalMeasurement {
        &self.measurement
    }

    pub fn user_action(&self) -> UserAction {
        self.action
    }

    pub fn is_no_signal(&self) -> bool {
        self.no_signal
    }

    /// Frames run so far.
    pub fn frames(&self) -> u64 {
        self.frame
    }

    /// Runs frames until the coordinator aborts this run, then hands back the
    /// I/O for the next one. Claimed slots are released on the way out.
    pub fn run(mut self) -> SupervisorIo {
        loop {
            match self.run_frame() {
                Ok(()) => {}
                Err(HardwareError::Aborted) => break,
                Err(e) => error!("Acquisition frame failed: {}", e),
            }
        }
        debug!("Acquisition stopped after {} frames", self.frame);
        let ModeSupervisor { io, .. } = self;
        io
    }

    /// One input frame.
    pub fn run_frame(&mut self) -> Result<(), HardwareError> {
        self.abort.check()?;
        let buttons = self.io.buttons.tick();

        let capturing = !self.no_signal && self.action != UserAction::Info;
        if capturing {
            self.capture_frame()?;
        } else {
            self.clock.reset();
            if !self.ctx.settings.idle_pause.is_zero() {
                std::thread::sleep(self.ctx.settings.idle_pause);
            }
        }

        // A window only advances over captured frames.
        let commit = if capturing {
            self.adjuster.frame_tick(&mut self.border, self.profile.format)
        } else {
            None
        };
        if let Some(commit) = commit {
            if commit.changed {
                self.ctx.buffer.clear();
            }
            self.settings.active_mut().border = self.border.stored;
            self.save();
        }

        self.handle_buttons(buttons)?;

        self.frame += 1;
        if self.frame % MODE_CHECK_FRAMES == 0
            && !self.no_signal
            && matches!(self.action, UserAction::None)
        {
            self.check_mode()?;
        }

        self.strip_showing = self.io.overlay.tick();
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<(), HardwareError> {
        let port = &mut *self.io.port;
        let abort = &self.abort;
        wait_vsync(port, !self.profile.retrace_level(), abort)?;
        if let Some(period) = self.clock.frame_begin(port.now_us()) {
            self.last_frame_us = period;
        }

        let geo = LineGeometry::new(&self.profile, self.border.active);
        let counter = border_counter(self.profile.format);
        let strip = if self.strip_showing {
            let top = self.profile.text_row_top() + geo.border.y();
            top..top + TXT_ROWS as u32
        } else {
            0..0
        };
        let mut line = 0;
        loop {
            let discard = strip.contains(&line);
            let retrace = read_line(port, &self.ctx.buffer, &geo, line, discard, abort)?;
            let raw = pop_border_blocking(port, abort)?;
            self.adjuster.collect(raw, counter, line);
            line += 1;
            if retrace {
                break;
            }
        }
        self.lines_read = line;
        Ok(())
    }

    fn measure(&mut self) -> SignalMeasurement {
        let hw = self.ctx.settings.hardware_hz;
        let prev = self.measurement;
        let v_hz = vertical_hz(self.last_frame_us);
        let h_hz = horizontal_hz(self.lines_read, self.profile.vertical.sync, v_hz);
        let port = &mut *self.io.port;
        let polarity = |raw: Option<u32>, hz: f32, fallback| match raw {
            Some(raw) if hz > 0.0 => derive_polarity(raw, 1.0e9 / f64::from(hz), hw),
            _ => fallback,
        };
        let v_raw = latest(|| port.try_pop_vsync_polarity());
        let h_raw = latest(|| port.try_pop_hsync_polarity());
        SignalMeasurement {
            v_hz,
            h_hz,
            v_polarity: polarity(v_raw, v_hz, prev.v_polarity),
            h_polarity: polarity(h_raw, h_hz, prev.h_polarity),
        }
    }

    fn manual_profile(&self) -> TimingProfile {
        let m = &self.measurement;
        self.settings
            .active()
            .manual
            .to_profile(m.h_polarity, m.v_polarity, m.h_hz, m.v_hz)
    }

    fn check_mode(&mut self) -> Result<(), HardwareError> {
        self.measurement = self.measure();
        let candidate = if self.settings.active().manual.enabled {
            Some(self.manual_profile())
        } else {
            lookup(self.measurement.v_polarity, self.measurement.v_hz).copied()
        };
        match candidate {
            Some(profile) => {
                self.unknown.hit();
                if !same_mode(&profile, &self.profile) {
                    self.switch_profile(profile)?;
                }
            }
            None => {
                debug!("No preset for {}", self.measurement.summary());
                if self.unknown.miss() {
                    let text = format!("UNKNOWN MODE\n{}", self.measurement.summary());
                    warn!("{}", text.replace('\n', " "));
                    self.io.overlay.display_text(&text, TEXT_MS);
                }
            }
        }
        Ok(())
    }

    /// Makes `profile` the active one and reprograms everything for it.
    fn switch_profile(&mut self, profile: TimingProfile) -> Result<(), HardwareError> {
        info!(
            "Mode change: {} -> {} ({})",
            self.profile.name,
            profile.name,
            self.measurement.summary()
        );
        self.profile = profile;
        self.ctx.timing.publish(profile);
        self.io.overlay.set_profile(&profile);
        self.reconfigure()
    }

    /// Recalibrates the active family, reloads the pixel and border programs
    /// and re-applies the border. Formats without a stored border get a
    /// single-shot auto-adjust.
    fn reconfigure(&mut self) -> Result<(), HardwareError> {
        let format = self.profile.format;
        let hw = self.ctx.settings.hardware_hz;
        let bank = *self.settings.active();
        let cal = &mut self.calibration[format.index()];
        cal.pixel_clock_hz = bank.pixel_clock_hz[format.index()];
        cal.sampling_offset = bank.sampling_offset[format.index()];
        match cal.recalibrate(format, hw) {
            Some(c) => info!(
                "Calibrated {} at {:.3} MHz: grain {} divider {} (error {:.5})",
                format,
                mhz(cal.pixel_clock_hz),
                c.grain,
                c.divider,
                c.error
            ),
            None => warn!("No calibration for {} at {} Hz", format, cal.pixel_clock_hz),
        }
        let cal = *cal;

        self.pixels.load(
            SamplerProgram::Pixels {
                format,
                grain: cal.grain,
            },
            &ProgramConfig {
                divider: cal.divider,
                sampling_offset: cal.sampling_offset,
                counter_init: None,
            },
        )?;
        self.border_probe.load(
            SamplerProgram::Border { format },
            &ProgramConfig {
                divider: border_divider(cal.pixel_clock_hz, hw),
                sampling_offset: 0,
                counter_init: Some(border_counter(format)),
            },
        )?;

        self.border.pins = bank.manual.border_pins();
        if self.border.stored_for(format).is_none() {
            let (x, y) = self.profile.border_origin();
            self.border.active = BorderOffsets::new(x, y);
        }
        if !self.border.restore(format) {
            debug!("No stored border for {}, measuring", format);
            self.adjuster.force_start(self.ctx.settings.auto_adjust_always_on);
        }
        self.ctx.buffer.clear();
        Ok(())
    }

    fn save(&mut self) {
        if let Err(e) = self.ctx.store.save(&self.settings) {
            warn!("Saving settings failed: {}", e);
        }
    }

    fn show(&mut self, text: &str) {
        self.io.overlay.display_text(text, TEXT_MS);
    }

    fn handle_buttons(&mut self, b: ButtonSample) -> Result<(), HardwareError> {
        match self.action {
            UserAction::None => self.idle_buttons(b),
            UserAction::PixelClock { idle, reset_asked } => {
                self.pixel_clock_buttons(b, idle, reset_asked)
            }
            UserAction::Manual { item, idle } => self.manual_buttons(b, item, idle),
            UserAction::Info => {
                if b.auto_adjust.is_release() || b.pixel_clock.is_release() {
                    self.action = UserAction::None;
                    self.io.overlay.clear_text();
                    self.ctx.buffer.clear();
                }
                Ok(())
            }
        }
    }

    fn idle_buttons(&mut self, b: ButtonSample) -> Result<(), HardwareError> {
        match b.auto_adjust {
            ButtonState::Release => {
                info!("Auto adjust requested");
                self.adjuster.force_start(false);
                self.show("AUTO ADJUST");
                return Ok(());
            }
            ButtonState::LongPress => {
                if self.adjuster.is_continuous() {
                    self.adjuster.stop();
                    self.show("AUTO ADJUST OFF");
                } else {
                    self.adjuster.stop();
                    self.adjuster.force_start(true);
                    self.show("AUTO ADJUST ALWAYS ON");
                }
                return Ok(());
            }
            ButtonState::MedRelease => {
                self.action = UserAction::Manual {
                    item: ManualItem::Enabled,
                    idle: 0,
                };
                self.show_manual_item(ManualItem::Enabled);
                return Ok(());
            }
            ButtonState::None | ButtonState::Pressed => {}
        }
        match b.pixel_clock {
            ButtonState::Release => {
                self.action = UserAction::PixelClock {
                    idle: 0,
                    reset_asked: false,
                };
                self.show_pixel_clock();
            }
            ButtonState::MedRelease => self.switch_bank()?,
            ButtonState::LongPress => {
                self.action = UserAction::Info;
                let page = self.info_page();
                self.io.overlay.display_page(&page);
            }
            ButtonState::None | ButtonState::Pressed => {}
        }
        Ok(())
    }

    fn show_pixel_clock(&mut self) {
        let format = self.profile.format;
        let text = format!(
            "{}\nPxCLK:{:.3}MHz",
            format,
            mhz(self.settings.active().pixel_clock_hz[format.index()])
        );
        self.io.overlay.display_text(&text, 0);
    }

    fn pixel_clock_buttons(
        &mut self,
        b: ButtonSample,
        idle: u32,
        reset_asked: bool,
    ) -> Result<(), HardwareError> {
        if b.pixel_clock == ButtonState::LongPress {
            self.save();
            self.show("PxCLK SAVED");
            self.action = UserAction::None;
            return Ok(());
        }
        if b.auto_adjust == ButtonState::LongPress {
            if !reset_asked {
                self.io.overlay.display_text("RESET PxCLK TO DEFAULTS?", 0);
                self.action = UserAction::PixelClock {
                    idle: 0,
                    reset_asked: true,
                };
                return Ok(());
            }
            self.settings.active_mut().pixel_clock_hz =
                crate::VideoFormat::ALL.map(nominal_pixel_clock);
            self.save();
            self.reconfigure()?;
            self.show("RESET OK");
            self.action = UserAction::None;
            return Ok(());
        }

        let raise = b.pixel_clock.is_release();
        let lower = b.auto_adjust.is_release();
        if !raise && !lower {
            if idle + 1 >= PX_CLK_TIMEOUT_FRAMES {
                self.show("EXIT PxCLK");
                self.action = UserAction::None;
            } else {
                self.action = UserAction::PixelClock {
                    idle: idle + 1,
                    reset_asked,
                };
            }
            return Ok(());
        }

        let small = b.pixel_clock == ButtonState::MedRelease
            || b.auto_adjust == ButtonState::MedRelease;
        let step = if small {
            PX_CLK_SMALL_STEP
        } else {
            PX_CLK_LARGE_STEP
        };
        let format = self.profile.format;
        let clock = &mut self.settings.active_mut().pixel_clock_hz[format.index()];
        *clock = if raise {
            clock.saturating_add(step)
        } else {
            clock.saturating_sub(step).max(PX_CLK_LARGE_STEP)
        };
        debug!("Pixel clock of {} now {} Hz", format, clock);
        self.action = UserAction::PixelClock {
            idle: 0,
            reset_asked: false,
        };
        self.reconfigure()?;
        self.show_pixel_clock();
        Ok(())
    }

    fn show_manual_item(&mut self, item: ManualItem) {
        let format = self.profile.format;
        let value = match item {
            ManualItem::SamplingOffset => {
                self.settings.active().sampling_offset[format.index()].to_string()
            }
            _ => self.settings.active().manual.describe(item),
        };
        let text = format!("{}: {}", item.label(), value);
        self.io.overlay.display_text(&text, 0);
    }

    fn manual_buttons(
        &mut self,
        b: ButtonSample,
        item: ManualItem,
        idle: u32,
    ) -> Result<(), HardwareError> {
        if b.pixel_clock == ButtonState::LongPress {
            self.apply_manual()?;
            self.save();
            self.show("MANUAL SAVED");
            self.action = UserAction::None;
            return Ok(());
        }
        if b.pixel_clock == ButtonState::Release {
            let next = item.next();
            self.action = UserAction::Manual {
                item: next,
                idle: 0,
            };
            self.show_manual_item(next);
            return Ok(());
        }
        if b.auto_adjust.is_release() {
            let increase = b.auto_adjust == ButtonState::Release;
            let format = self.profile.format;
            let bank = self.settings.active_mut();
            if item == ManualItem::SamplingOffset {
                let mut cal = CalibrationState::for_format(format);
                cal.sampling_offset = bank.sampling_offset[format.index()];
                cal.step_sampling_offset(increase);
                bank.sampling_offset[format.index()] = cal.sampling_offset;
            } else {
                bank.manual.adjust(item, increase);
            }
            self.action = UserAction::Manual { item, idle: 0 };
            self.apply_manual()?;
            self.show_manual_item(item);
            return Ok(());
        }
        if idle + 1 >= MANUAL_TIMEOUT_FRAMES {
            self.apply_manual()?;
            self.io.overlay.clear_text();
            self.action = UserAction::None;
        } else {
            self.action = UserAction::Manual {
                item,
                idle: idle + 1,
            };
        }
        Ok(())
    }

    /// Puts the manual timing into effect, or hands control back to detection
    /// when it is disabled.
    fn apply_manual(&mut self) -> Result<(), HardwareError> {
        if self.settings.active().manual.enabled {
            let profile = self.manual_profile();
            self.switch_profile(profile)
        } else {
            self.reconfigure()
        }
    }

    fn switch_bank(&mut self) -> Result<(), HardwareError> {
        self.settings.active_bank = (self.settings.active_bank + 1) % BANK_COUNT;
        info!("Switching to profile bank {}", self.settings.active_bank);
        self.border.stored = self.settings.active().border;
        self.save();
        if self.settings.active().manual.enabled {
            let profile = self.manual_profile();
            self.switch_profile(profile)?;
        } else {
            self.reconfigure()?;
        }
        let text = format!("PROFILE {}", self.settings.active_bank);
        self.show(&text);
        Ok(())
    }

    fn info_page(&self) -> String {
        let p = &self.profile;
        let m = &self.measurement;
        let cal = &self.calibration[p.format.index()];
        format!(
            "{}\n{}\nV:{:.2}Hz{}\nH:{:.0}Hz{}\nPxCLK:{:.3}MHz\nSAMPLING OFFSET:{}\n\
             H VISIBLE:{} BACK:{}\nV VISIBLE:{} BACK:{}\nBORDER X:{} Y:{}\nPROFILE:{}",
            p.name,
            p.format,
            m.v_hz,
            m.v_polarity,
            m.h_hz,
            m.h_polarity,
            mhz(cal.pixel_clock_hz),
            cal.sampling_offset,
            p.horizontal.visible,
            p.horizontal.back_porch,
            p.vertical.visible,
            p.vertical.back_porch,
            self.border.active.x(),
            self.border.active.y(),
            self.settings.active_bank
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{MemoryStore, OutputLockout};
    use crate::input::ScriptedButtons;
    use crate::overlay::{OverlayEvent, OverlayLog, RecordingOverlay};
    use crate::sim::{SamplerLog, SimBackend, SimSignal, SimSwitch};
    use crate::timings::{default_profile, PRESETS};
    use crate::{Polarity, VideoFormat};

    const HW: u32 = 270_000_000;

    struct Harness {
        sup: ModeSupervisor,
        overlay: OverlayLog,
        store: Arc<SharedStore>,
        timing: SharedTiming,
        samplers: SamplerLog,
        buffer: Arc<FrameBuffer>,
    }

    impl Harness {
        fn run(&mut self, frames: u64) {
            for _ in 0..frames {
                self.sup.run_frame().expect("frame");
            }
        }
    }

    fn harness_with(
        source: TimingProfile,
        connected: bool,
        buttons: ScriptedButtons,
        options: StartOptions,
    ) -> Harness {
        let backend = SimBackend::new();
        let samplers = backend.log();
        let loader = Arc::new(ProgramLoader::new(Box::new(backend)));
        let store = Arc::new(SharedStore::new(
            Box::new(MemoryStore::new()),
            Arc::new(OutputLockout::new()),
        ));
        let buffer = Arc::new(FrameBuffer::new());
        let timing = SharedTiming::new(*default_profile());
        let overlay = RecordingOverlay::new();
        let overlay_log = overlay.log();
        let ctx = SupervisorContext {
            loader,
            store: Arc::clone(&store),
            buffer: Arc::clone(&buffer),
            timing: timing.clone(),
            settings: SupervisorSettings {
                hardware_hz: HW,
                auto_adjust_always_on: false,
                idle_pause: Duration::ZERO,
            },
        };
        let io = SupervisorIo {
            port: Box::new(SimSignal::new(source, HW, SimSwitch::new(connected))),
            buttons: Box::new(buttons),
            overlay: Box::new(overlay),
        };
        let sup = ModeSupervisor::start(ctx, io, AbortToken::new(), options).expect("start");
        Harness {
            sup,
            overlay: overlay_log,
            store,
            timing,
            samplers,
            buffer,
        }
    }

    fn harness(source: TimingProfile, buttons: ScriptedButtons) -> Harness {
        harness_with(source, true, buttons, StartOptions::default())
    }

    #[test]
    fn detects_cga_and_calibrates_tightly() {
        let mut h = harness(PRESETS[1], ScriptedButtons::new());
        h.run(MODE_CHECK_FRAMES + 1);
        assert_eq!(h.sup.profile().name, "CGA 640x200@60Hz");
        assert_eq!(h.timing.current().name, "CGA 640x200@60Hz", "published");
        let cal = h.sup.calibration(VideoFormat::Cga);
        let ideal = f64::from(HW) / (14_318_181.0 * f64::from(cal.grain));
        assert!(
            (cal.divider.value() - ideal).abs() < 0.002,
            "divider {} vs ideal {}",
            cal.divider,
            ideal
        );
        let m = h.sup.measurement();
        assert!((m.v_hz - 60.0).abs() < 0.1, "measured {}", m.v_hz);
        assert_eq!(m.v_polarity, Polarity::Pos);
        let pixels = h
            .samplers
            .snapshot()
            .find_current(|p| matches!(p, SamplerProgram::Pixels { .. }));
        assert_eq!(
            pixels.map(|r| r.program),
            Some(SamplerProgram::Pixels {
                format: VideoFormat::Cga,
                grain: cal.grain
            })
        );
    }

    #[test]
    fn detects_negative_polarity_modes() {
        let cases = [
            (PRESETS[3], "EGA 640x350@60Hz"),
            (PRESETS[0], "MDA 720x350@50Hz"),
        ];
        for (source, name) in cases {
            let mut h = harness(source, ScriptedButtons::new());
            h.run(2 * MODE_CHECK_FRAMES);
            assert_eq!(h.sup.profile().name, name);
            assert_eq!(h.sup.measurement().v_polarity, Polarity::Neg);
        }
    }

    #[test]
    fn border_is_measured_and_persisted() {
        let mut h = harness(PRESETS[3], ScriptedButtons::new());
        h.run(MODE_CHECK_FRAMES + 4 * (crate::border::DURATION as u64 + 2));
        let expected = BorderOffsets::new(28, 4);
        assert_eq!(h.sup.border().active, expected);
        assert_eq!(h.sup.border().stored_for(VideoFormat::Ega), Some(expected));
        let stored = h.store.load();
        assert_eq!(stored.active().border[VideoFormat::Ega.index()], Some(expected));
    }

    #[test]
    fn captured_pixels_match_the_source() {
        let mut h = harness(PRESETS[1], ScriptedButtons::new());
        h.run(MODE_CHECK_FRAMES + 4 * (crate::border::DURATION as u64 + 2) + 2);
        assert_eq!(h.sup.border().active, BorderOffsets::new(68, 30));
        for (y, x) in [(0, 0), (10, 17), (120, 301), (199, 639)] {
            assert_eq!(
                h.buffer.rgb_pixel(y, x),
                crate::sim::rgb_pattern(x as u32, y as u32),
                "pixel ({}, {})",
                y,
                x
            );
        }
    }

    #[test]
    fn unknown_mode_is_reported_a_bounded_number_of_times() {
        let mut odd = PRESETS[1];
        odd.name = "odd";
        odd.v_hz = 55.0;
        let mut h = harness(odd, ScriptedButtons::new());
        h.run(20 * MODE_CHECK_FRAMES);
        assert_eq!(h.sup.frames(), 20 * MODE_CHECK_FRAMES, "capture keeps running");
        assert_eq!(
            h.overlay.count_containing("UNKNOWN MODE"),
            UNKNOWN_MODE_SHOW_MSG_MAX_COUNT as usize
        );
        assert_eq!(h.sup.profile().name, default_profile().name);
    }

    #[test]
    fn pixel_clock_editor_steps_and_saves() {
        let buttons = ScriptedButtons::new()
            .at(1, ButtonSample::pixel_clock(ButtonState::Release))
            .at(2, ButtonSample::pixel_clock(ButtonState::Release))
            .at(3, ButtonSample::pixel_clock(ButtonState::MedRelease))
            .at(4, ButtonSample::auto_adjust(ButtonState::MedRelease))
            .at(5, ButtonSample::pixel_clock(ButtonState::LongPress));
        let mut h = harness(PRESETS[1], buttons);
        h.run(7);
        let expected = 14_318_181 + 10_000 + 1_000 - 1_000;
        assert_eq!(h.sup.user_action(), UserAction::None);
        assert_eq!(h.sup.calibration(VideoFormat::Cga).pixel_clock_hz, expected);
        assert_eq!(
            h.store.load().active().pixel_clock_hz[VideoFormat::Cga.index()],
            expected
        );
        assert_eq!(h.overlay.count_containing("PxCLK SAVED"), 1);
    }

    #[test]
    fn pixel_clock_reset_needs_confirmation() {
        let long_auto = ButtonSample::auto_adjust(ButtonState::LongPress);
        let buttons = ScriptedButtons::new()
            .at(1, ButtonSample::pixel_clock(ButtonState::Release))
            .at(2, ButtonSample::pixel_clock(ButtonState::Release))
            .at(3, long_auto)
            .at(4, long_auto);
        let mut h = harness(PRESETS[1], buttons);
        h.run(4);
        assert_eq!(
            h.sup.user_action(),
            UserAction::PixelClock {
                idle: 0,
                reset_asked: true
            }
        );
        h.run(1);
        assert_eq!(h.sup.user_action(), UserAction::None);
        assert_eq!(
            h.sup.settings().active().pixel_clock_hz[VideoFormat::Cga.index()],
            14_318_181
        );
        assert_eq!(h.overlay.count_containing("RESET OK"), 1);
    }

    #[test]
    fn pixel_clock_editor_times_out() {
        let buttons =
            ScriptedButtons::new().at(0, ButtonSample::pixel_clock(ButtonState::Release));
        let mut h = harness_with(
            PRESETS[1],
            false,
            buttons,
            StartOptions {
                no_signal: true,
                reset_to_defaults: false,
            },
        );
        h.run(1);
        assert!(matches!(h.sup.user_action(), UserAction::PixelClock { .. }));
        h.run(u64::from(PX_CLK_TIMEOUT_FRAMES));
        assert_eq!(h.sup.user_action(), UserAction::None);
        assert_eq!(h.overlay.count_containing("EXIT PxCLK"), 1);
    }

    #[test]
    fn manual_timing_replaces_detection() {
        let buttons = ScriptedButtons::new()
            .at(1, ButtonSample::auto_adjust(ButtonState::MedRelease))
            .at(2, ButtonSample::auto_adjust(ButtonState::Release))
            .at(3, ButtonSample::pixel_clock(ButtonState::LongPress));
        let mut h = harness(PRESETS[1], buttons);
        h.run(3 * MODE_CHECK_FRAMES);
        assert_eq!(h.sup.profile().name, "MANUAL");
        assert_eq!(h.timing.current().name, "MANUAL");
        assert!(h.store.load().active().manual.enabled, "saved");
        assert_eq!(h.overlay.count_containing("MANUAL: ON"), 1);
    }

    #[test]
    fn manual_sampling_offset_wraps() {
        let lower = ButtonSample::auto_adjust(ButtonState::MedRelease);
        let mut buttons =
            ScriptedButtons::new().at(1, ButtonSample::auto_adjust(ButtonState::MedRelease));
        for frame in 2..10 {
            buttons = buttons.at(frame, ButtonSample::pixel_clock(ButtonState::Release));
        }
        buttons = buttons.at(10, lower);
        let mut h = harness(PRESETS[1], buttons);
        h.run(11);
        assert_eq!(
            h.sup.user_action(),
            UserAction::Manual {
                item: ManualItem::SamplingOffset,
                idle: 0
            }
        );
        let format = h.sup.profile().format;
        assert_eq!(h.sup.calibration(format).sampling_offset, 7);
    }

    #[test]
    fn bank_switch_is_persisted() {
        let buttons =
            ScriptedButtons::new().at(1, ButtonSample::pixel_clock(ButtonState::MedRelease));
        let mut h = harness(PRESETS[1], buttons);
        h.run(2);
        assert_eq!(h.sup.settings().active_bank, 1);
        assert_eq!(h.store.load().active_bank, 1);
        assert_eq!(h.overlay.count_containing("PROFILE 1"), 1);
    }

    #[test]
    fn info_page_pauses_capture_until_released() {
        let buttons = ScriptedButtons::new()
            .at(1, ButtonSample::pixel_clock(ButtonState::LongPress))
            .at(5, ButtonSample::auto_adjust(ButtonState::Release));
        let mut h = harness(PRESETS[1], buttons);
        h.run(2);
        assert_eq!(h.sup.user_action(), UserAction::Info);
        let page = h.overlay.events().into_iter().find_map(|e| match e {
            OverlayEvent::Page(p) => Some(p),
            _ => None,
        });
        assert!(page.expect("page shown").contains("PxCLK:"));
        h.run(4);
        assert_eq!(h.sup.user_action(), UserAction::None);
    }

    #[test]
    fn auto_adjust_buttons() {
        let buttons = ScriptedButtons::new()
            .at(1, ButtonSample::auto_adjust(ButtonState::LongPress))
            .at(3, ButtonSample::auto_adjust(ButtonState::LongPress));
        let mut h = harness(PRESETS[1], buttons);
        h.run(2);
        assert!(h.sup.adjuster().is_continuous());
        h.run(2);
        assert!(!h.sup.adjuster().is_continuous());
        assert_eq!(h.overlay.count_containing("AUTO ADJUST OFF"), 1);
    }

    #[test]
    fn no_signal_mode_skips_capture() {
        let mut h = harness_with(
            PRESETS[1],
            false,
            ScriptedButtons::new(),
            StartOptions {
                no_signal: true,
                reset_to_defaults: false,
            },
        );
        h.run(3 * MODE_CHECK_FRAMES);
        assert!(h.sup.is_no_signal());
        assert_eq!(h.overlay.count_containing("NO SIGNAL"), 1);
        assert_ne!(h.buffer.rgb_pixel(0, 0), 0, "placeholder drawn");
    }

    #[test]
    fn reset_to_defaults_overwrites_the_store() {
        let h = harness_with(
            PRESETS[1],
            true,
            ScriptedButtons::new().holding_both(),
            StartOptions {
                no_signal: false,
                reset_to_defaults: true,
            },
        );
        assert_eq!(h.sup.settings(), &StoredSettings::default());
        assert!(h.store.load().active().border.iter().all(Option::is_none));
        assert_eq!(h.overlay.count_containing("RESET TO DEFAULTS"), 1);
    }

    #[test]
    fn abort_unblocks_a_dead_input() {
        let switch = SimSwitch::new(false);
        let mut h = harness(PRESETS[1], ScriptedButtons::new());
        h.sup.io.port = Box::new(SimSignal::new(PRESETS[1], HW, switch));
        let abort = h.sup.abort.clone();
        let waiter = std::thread::spawn(move || {
            let result = h.sup.run_frame();
            (h, result)
        });
        std::thread::sleep(Duration::from_millis(20));
        abort.raise();
        let (h, result) = waiter.join().expect("join");
        assert_eq!(result, Err(HardwareError::Aborted));
        let claimed = h.samplers.clone();
        drop(h);
        assert_eq!(claimed.snapshot().claimed_count(), 0, "slots released");
    }
}
