//! # Synthetic TTL Source
//!
//! A cycle-free model of a TTL adapter and the sampler in front of it, good
//! enough to drive the whole engine on a desktop: detection, calibration,
//! border measurement, capture and the signal-loss restart all run against it
//! unchanged.
//!
//! ## Frame model
//! Each frame is `total` lines: the vertical front porch (blank), the visible
//! lines, blank lines, then the `sync` retrace lines. `total` follows from the
//! nominal rates (`round(h_hz / v_hz)`, never less than the profile needs) and
//! one line lasts `1 / (v_hz * total)`, so frame periods measure exactly the
//! nominal vertical rate.
//!
//! ## Time and polling
//! Virtual time only moves when lines end, and lines end when the engine polls:
//! - HSync: the first poll of a fresh line reports retrace and starts the line
//!   (its pixel words become available), the next poll reports the visible
//!   part, the one after that ends the line and reports retrace again.
//! - VSync: a poll directly following another VSync poll ends the current
//!   line, modelling time spent spinning on the retrace.
//!
//! ## Probes
//! Pixel lines start with [`FIFO_WORDS`] stale words. The border probe yields
//! one sample per line and lags [`PROBE_LINE_LATENCY`] lines behind because its
//! FIFO is refilled with blanks during every vertical retrace. Both polarity
//! probes report once per frame.
//!
//! A disconnected source never toggles its sync lines and never produces
//! pixels, so anything waiting on it spins until aborted.

use crate::border::{border_counter, PROBE_LINE_LATENCY};
use crate::hardware::{
    HardwareError, NoSignalWatch, ProgramConfig, SamplerBackend, SamplerProgram, SignalPort,
    SlotId, SAMPLER_BLOCKS, SLOTS_PER_BLOCK,
};
use crate::line_capture::FIFO_WORDS;
use crate::measure::probe_sample;
use crate::timings::TimingProfile;
use crate::VideoFormat;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Cable state shared between the source and whoever plugs it in.
#[derive(Clone, Debug, Default)]
pub struct SimSwitch(Arc<AtomicBool>);

impl SimSwitch {
    pub fn new(connected: bool) -> Self {
        SimSwitch(Arc::new(AtomicBool::new(connected)))
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl NoSignalWatch for SimSwitch {
    fn signal_present(&self) -> bool {
        self.is_connected()
    }
}

/// Test-pattern pixel of a CGA/EGA source: never zero, sync bits set.
pub fn rgb_pattern(x: u32, row: u32) -> u8 {
    (((x / 8 + row) % 63) + 1) as u8
}

/// Test-pattern pixel of an MDA source: never zero.
pub fn mono_pattern(x: u32, row: u32) -> u8 {
    ((x / 8 + row) % 3 + 1) as u8
}

const SYNC_NOISE: u8 = 0x40;

/// Synthetic source implementing [`SignalPort`].
#[derive(Debug)]
pub struct SimSignal {
    profile: TimingProfile,
    hardware_hz: u32,
    switch: SimSwitch,
    total_lines: u32,
    line_us: f64,
    line: u32,
    line_active: bool,
    hsync_polls: u32,
    after_vsync_poll: bool,
    word_idx: u32,
    time_us: f64,
    frames: u64,
    border: VecDeque<u32>,
    vsync_probe: VecDeque<u32>,
    hsync_probe: VecDeque<u32>,
}

impl SimSignal {
    pub fn new(profile: TimingProfile, hardware_hz: u32, switch: SimSwitch) -> Self {
        let v = profile.vertical;
        let nominal = (profile.h_hz / profile.v_hz.max(1.0)).round() as u32;
        let total_lines = nominal.max(v.front_porch + v.visible + v.sync + 1);
        let line_us = 1.0e6 / (f64::from(profile.v_hz.max(1.0)) * f64::from(total_lines));
        SimSignal {
            profile,
            hardware_hz,
            switch,
            total_lines,
            line_us,
            line: 0,
            line_active: false,
            hsync_polls: 0,
            after_vsync_poll: false,
            word_idx: 0,
            time_us: 0.0,
            frames: 0,
            border: (0..PROBE_LINE_LATENCY).map(|_| 0).collect(),
            vsync_probe: VecDeque::new(),
            hsync_probe: VecDeque::new(),
        }
    }

    pub fn profile(&self) -> &TimingProfile {
        &self.profile
    }

    pub fn total_lines(&self) -> u32 {
        self.total_lines
    }

    /// Completed frames.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn in_vsync(&self) -> bool {
        self.line >= self.total_lines - self.profile.vertical.sync
    }

    fn visible_row(&self) -> Option<u32> {
        let v = self.profile.vertical;
        (self.line >= v.front_porch && self.line < v.front_porch + v.visible)
            .then(|| self.line - v.front_porch)
    }

    fn border_sample(&self) -> u32 {
        match self.visible_row() {
            Some(_) => border_counter(self.profile.format) - self.profile.horizontal.front_porch,
            None => 0,
        }
    }

    fn end_line(&mut self) {
        let sample = self.border_sample();
        self.border.push_back(sample);
        self.line += 1;
        self.time_us += self.line_us;
        self.line_active = false;
        self.hsync_polls = 0;
        self.word_idx = 0;
        if self.line >= self.total_lines {
            self.line = 0;
            self.frames += 1;
            self.border.clear();
            self.border.extend((0..PROBE_LINE_LATENCY).map(|_| 0));
            self.push_polarity_samples();
        }
    }

    fn push_polarity_samples(&mut self) {
        let frame_ns = self.line_us * 1000.0 * f64::from(self.total_lines);
        let sync_ns = self.line_us * 1000.0 * f64::from(self.profile.vertical.sync);
        let v_low = match self.profile.v_polarity.asserted_level() {
            true => frame_ns - sync_ns,
            false => sync_ns,
        };
        let h = self.profile.horizontal;
        let line_ns = self.line_us * 1000.0;
        let h_sync_ns = line_ns * f64::from(h.sync) / f64::from(h.total().max(1));
        let h_low = match self.profile.h_polarity.asserted_level() {
            true => line_ns - h_sync_ns,
            false => h_sync_ns,
        };
        self.vsync_probe.push_back(probe_sample(v_low, self.hardware_hz));
        self.hsync_probe.push_back(probe_sample(h_low, self.hardware_hz));
    }

    fn pixel(&self, p: u32) -> u8 {
        let h = self.profile.horizontal;
        let (row, x) = match (self.visible_row(), p.checked_sub(h.front_porch)) {
            (Some(row), Some(x)) if x < h.visible => (row, x),
            _ => return 0,
        };
        match self.profile.format {
            VideoFormat::Mda => mono_pattern(x, row),
            VideoFormat::Cga | VideoFormat::Ega => rgb_pattern(x, row) | SYNC_NOISE,
        }
    }

    fn word(&self, idx: u32) -> u32 {
        if idx < FIFO_WORDS {
            return 0;
        }
        let per_word = self.profile.format.pixels_per_word();
        let first = (idx - FIFO_WORDS) * per_word;
        (0..per_word).fold(0, |acc, i| {
            let px = u32::from(self.pixel(first + i));
            match self.profile.format {
                VideoFormat::Mda => acc | ((px & 0xf) << (4 * i)),
                VideoFormat::Cga | VideoFormat::Ega => acc | (px << (8 * i)),
            }
        })
    }
}

impl SignalPort for SimSignal {
    fn hsync_level(&mut self) -> bool {
        self.after_vsync_poll = false;
        if !self.switch.is_connected() {
            return false;
        }
        if !self.line_active {
            self.line_active = true;
            return true;
        }
        self.hsync_polls += 1;
        if self.hsync_polls == 1 {
            false
        } else {
            self.end_line();
            true
        }
    }

    fn vsync_level(&mut self) -> bool {
        if !self.switch.is_connected() {
            return false;
        }
        if self.after_vsync_poll {
            self.end_line();
        }
        self.after_vsync_poll = true;
        self.in_vsync() == self.profile.v_polarity.asserted_level()
    }

    fn try_pop_pixels(&mut self) -> Option<u32> {
        if !self.line_active || !self.switch.is_connected() {
            return None;
        }
        let word = self.word(self.word_idx);
        self.word_idx += 1;
        Some(word)
    }

    fn try_pop_border(&mut self) -> Option<u32> {
        self.border.pop_front()
    }

    fn try_pop_vsync_polarity(&mut self) -> Option<u32> {
        self.vsync_probe.pop_front()
    }

    fn try_pop_hsync_polarity(&mut self) -> Option<u32> {
        self.hsync_probe.pop_front()
    }

    fn now_us(&mut self) -> u64 {
        self.time_us as u64
    }
}

/// One install request seen by [`SimBackend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstallRecord {
    pub slot: SlotId,
    pub program: SamplerProgram,
    pub config: ProgramConfig,
}

/// State of the simulated sampler, as recorded so far.
#[derive(Clone, Debug, Default)]
pub struct SamplerSnapshot {
    pub installs: Vec<InstallRecord>,
    removals: BTreeMap<SlotId, usize>,
    enabled: BTreeMap<SlotId, bool>,
    claimed: [[bool; SLOTS_PER_BLOCK]; SAMPLER_BLOCKS],
    current: BTreeMap<SlotId, InstallRecord>,
}

impl SamplerSnapshot {
    pub fn installed_in(&self, slot: SlotId) -> Vec<SamplerProgram> {
        self.installs
            .iter()
            .filter(|r| r.slot == slot)
            .map(|r| r.program)
            .collect()
    }

    pub fn removals(&self, slot: SlotId) -> usize {
        self.removals.get(&slot).copied().unwrap_or(0)
    }

    pub fn is_enabled(&self, slot: SlotId) -> bool {
        self.enabled.get(&slot).copied().unwrap_or(false)
    }

    pub fn is_claimed(&self, slot: SlotId) -> bool {
        self.claimed
            .get(slot.block)
            .and_then(|b| b.get(slot.index))
            .copied()
            .unwrap_or(false)
    }

    /// Program currently installed in any slot, matching `pred`.
    pub fn find_current<F: Fn(&SamplerProgram) -> bool>(&self, pred: F) -> Option<InstallRecord> {
        self.current.values().find(|r| pred(&r.program)).copied()
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.iter().flatten().filter(|c| **c).count()
    }
}

/// Shared handle onto a [`SimBackend`]'s record.
#[derive(Clone, Debug, Default)]
pub struct SamplerLog(Arc<Mutex<SamplerSnapshot>>);

impl SamplerLog {
    pub fn snapshot(&self) -> SamplerSnapshot {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut SamplerSnapshot) -> R) -> R {
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Sampler control plane that records what it is asked to do.
#[derive(Debug, Default)]
pub struct SimBackend {
    log: SamplerLog,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> SamplerLog {
        self.log.clone()
    }

    fn check(snap: &SamplerSnapshot, slot: SlotId) -> Result<(), HardwareError> {
        if snap.is_claimed(slot) {
            Ok(())
        } else {
            Err(HardwareError::UnknownSlot(slot))
        }
    }
}

impl SamplerBackend for SimBackend {
    fn claim(&mut self, block: usize) -> Result<SlotId, HardwareError> {
        self.log.with(|snap| {
            let slots = snap
                .claimed
                .get_mut(block)
                .ok_or(HardwareError::NoFreeSlot(block))?;
            let index = slots
                .iter()
                .position(|c| !c)
                .ok_or(HardwareError::NoFreeSlot(block))?;
            slots[index] = true;
            Ok(SlotId { block, index })
        })
    }

    fn unclaim(&mut self, slot: SlotId) {
        self.log.with(|snap| {
            if let Some(c) = snap
                .claimed
                .get_mut(slot.block)
                .and_then(|b| b.get_mut(slot.index))
            {
                *c = false;
            }
        })
    }

    fn install(
        &mut self,
        slot: SlotId,
        program: &SamplerProgram,
        config: &ProgramConfig,
    ) -> Result<(), HardwareError> {
        self.log.with(|snap| {
            Self::check(snap, slot)?;
            let record = InstallRecord {
                slot,
                program: *program,
                config: *config,
            };
            snap.installs.push(record);
            snap.current.insert(slot, record);
            Ok(())
        })
    }

    fn remove(&mut self, slot: SlotId) {
        self.log.with(|snap| {
            *snap.removals.entry(slot).or_insert(0) += 1;
            snap.current.remove(&slot);
        })
    }

    fn drain(&mut self, _slot: SlotId) {}

    fn set_enabled(&mut self, slot: SlotId, enabled: bool) {
        self.log.with(|snap| {
            snap.enabled.insert(slot, enabled);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{wait_hsync, wait_vsync, AbortToken};
    use crate::measure::{derive_polarity, vertical_hz};
    use crate::timings::PRESETS;
    use crate::Polarity;

    const HW: u32 = 270_000_000;

    fn connected(profile: &TimingProfile) -> SimSignal {
        SimSignal::new(*profile, HW, SimSwitch::new(true))
    }

    /// Runs one frame the way the capture loop does; returns lines read.
    fn read_frame(sim: &mut SimSignal, retrace: bool) -> u32 {
        let abort = AbortToken::new();
        wait_vsync(sim, !retrace, &abort).expect("vsync");
        let mut lines = 0;
        loop {
            wait_hsync(sim, false, &abort).expect("hsync low");
            wait_hsync(sim, true, &abort).expect("hsync high");
            lines += 1;
            if sim.vsync_level() == retrace {
                return lines;
            }
        }
    }

    #[test]
    fn frame_period_matches_nominal_rate() {
        for profile in PRESETS.iter() {
            let mut sim = connected(profile);
            let retrace = profile.retrace_level();
            read_frame(&mut sim, retrace);
            let t0 = sim.now_us();
            let lines = read_frame(&mut sim, retrace);
            let hz = vertical_hz(sim.now_us() - t0);
            assert!((hz - profile.v_hz).abs() < 0.05, "{} measured {}", profile.name, hz);
            assert_eq!(lines + profile.vertical.sync, sim.total_lines(), "{}", profile.name);
        }
    }

    #[test]
    fn mismatched_polarity_still_takes_one_frame() {
        let profile = &PRESETS[3];
        let mut sim = connected(profile);
        read_frame(&mut sim, true);
        let t0 = sim.now_us();
        read_frame(&mut sim, true);
        let hz = vertical_hz(sim.now_us() - t0);
        assert!((hz - 60.0).abs() < 0.05, "measured {}", hz);
    }

    #[test]
    fn polarity_probes_report_the_source_polarity() {
        for profile in PRESETS.iter() {
            let mut sim = connected(profile);
            read_frame(&mut sim, profile.retrace_level());
            read_frame(&mut sim, profile.retrace_level());
            let raw = sim.try_pop_vsync_polarity().expect("one sample per frame");
            assert_eq!(
                derive_polarity(raw, 1.0e9 / f64::from(profile.v_hz), HW),
                profile.v_polarity,
                "{}",
                profile.name
            );
            let raw = sim.try_pop_hsync_polarity().expect("one sample per frame");
            assert_eq!(
                derive_polarity(raw, 1.0e9 / f64::from(profile.h_hz), HW),
                Polarity::Pos
            );
        }
    }

    #[test]
    fn border_probe_lags_by_fifo_depth() {
        let profile = &PRESETS[1];
        let mut sim = connected(profile);
        let abort = AbortToken::new();
        read_frame(&mut sim, true);
        wait_vsync(&mut sim, false, &abort).expect("vsync");
        let mut first_nonzero = None;
        for line in 0..60 {
            wait_hsync(&mut sim, false, &abort).expect("hsync low");
            wait_hsync(&mut sim, true, &abort).expect("hsync high");
            let raw = sim.try_pop_border().expect("one sample per line");
            if raw != 0 && first_nonzero.is_none() {
                first_nonzero = Some(line);
                assert_eq!(border_counter(VideoFormat::Cga) - raw, 68);
            }
        }
        assert_eq!(
            first_nonzero,
            Some(profile.vertical.front_porch + PROBE_LINE_LATENCY)
        );
    }

    #[test]
    fn pixel_words_start_with_stale_fifo_entries() {
        let profile = &PRESETS[1];
        let mut sim = connected(profile);
        assert!(sim.try_pop_pixels().is_none(), "no line started yet");
        sim.line = profile.vertical.front_porch;
        assert!(sim.hsync_level(), "first poll starts the line");
        let words: Vec<u32> = (0..40).filter_map(|_| sim.try_pop_pixels()).collect();
        assert!(words[..FIFO_WORDS as usize].iter().all(|w| *w == 0));
        let first_visible = (FIFO_WORDS + 68 / 4) as usize;
        assert_eq!(words[first_visible - 1], 0, "still in the porch");
        assert_eq!(words[first_visible] & 0xff, u32::from(rgb_pattern(0, 0) | SYNC_NOISE));
    }

    #[test]
    fn disconnected_source_is_silent() {
        let switch = SimSwitch::new(false);
        let mut sim = SimSignal::new(PRESETS[1], HW, switch.clone());
        assert!(!sim.hsync_level());
        assert!(!sim.vsync_level());
        assert!(sim.try_pop_pixels().is_none());
        assert!(!switch.signal_present());
        switch.set_connected(true);
        assert!(switch.signal_present());
        assert!(sim.hsync_level());
    }

    #[test]
    fn backend_tracks_claims() {
        let mut backend = SimBackend::new();
        let log = backend.log();
        let slot = backend.claim(0).expect("slot");
        assert!(backend
            .install(slot, &SamplerProgram::NoSignal, &ProgramConfig::default())
            .is_ok());
        let bogus = SlotId { block: 0, index: 3 };
        assert_eq!(
            backend.install(bogus, &SamplerProgram::NoSignal, &ProgramConfig::default()),
            Err(HardwareError::UnknownSlot(bogus))
        );
        assert_eq!(backend.claim(7), Err(HardwareError::NoFreeSlot(7)));
        assert_eq!(log.snapshot().claimed_count(), 1);
    }
}
