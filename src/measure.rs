//! Measured signal properties: sync polarity from the probe programs, rates
//! from frame timestamps and line counts.

use crate::Polarity;

/// Start value of the polarity probes' low-time down-counters.
pub const SYNC_PROBE_COUNTER_INIT: u32 = 1 << 31;
/// Program steps per counter decrement.
pub const PROBE_LOOP_INSTRUCTIONS: f64 = 2.0;

/// Duration of one program step.
pub fn instruction_ns(hardware_hz: u32) -> f64 {
    1.0e9 / f64::from(hardware_hz.max(1))
}

/// Time the sync line spent low during one period, from a raw probe sample.
pub fn low_time_ns(raw: u32, hardware_hz: u32) -> f64 {
    let loops = SYNC_PROBE_COUNTER_INIT.wrapping_sub(raw);
    f64::from(loops) * PROBE_LOOP_INSTRUCTIONS * instruction_ns(hardware_hz)
}

/// A line that idles low and pulses high is low for most of its period.
pub fn derive_polarity(raw: u32, period_ns: f64, hardware_hz: u32) -> Polarity {
    if low_time_ns(raw, hardware_hz) > period_ns / 2.0 {
        Polarity::Pos
    } else {
        Polarity::Neg
    }
}

/// Raw probe value a sync line with the given low time would produce.
pub fn probe_sample(low_ns: f64, hardware_hz: u32) -> u32 {
    let loops = (low_ns / (PROBE_LOOP_INSTRUCTIONS * instruction_ns(hardware_hz))) as u32;
    SYNC_PROBE_COUNTER_INIT.wrapping_sub(loops)
}

pub fn vertical_hz(frame_us: u64) -> f32 {
    if frame_us == 0 {
        return 0.0;
    }
    (1.0e6 / frame_us as f64) as f32
}

/// Line rate from the lines counted in one frame plus the retrace lines the
/// capture loop never sees.
pub fn horizontal_hz(lines_read: u32, v_sync_lines: u32, v_hz: f32) -> f32 {
    (lines_read + v_sync_lines) as f32 * v_hz
}

/// Tracks frame-begin timestamps to produce frame periods.
#[derive(Debug, Default)]
pub struct FrameClock {
    last_begin_us: Option<u64>,
}

impl FrameClock {
    /// Records a new frame start; returns the time since the previous one.
    pub fn frame_begin(&mut self, now_us: u64) -> Option<u64> {
        let period = self.last_begin_us.map(|last| now_us.saturating_sub(last));
        self.last_begin_us = Some(now_us);
        period
    }

    /// Forgets the last frame, e.g. after a pause with capture skipped.
    pub fn reset(&mut self) {
        self.last_begin_us = None;
    }
}

/// Everything detection needs, as measured.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SignalMeasurement {
    pub v_hz: f32,
    pub h_hz: f32,
    pub v_polarity: Polarity,
    pub h_polarity: Polarity,
}

impl SignalMeasurement {
    pub fn summary(&self) -> String {
        format!(
            "V:{:.1}Hz{} H:{:.0}Hz{}",
            self.v_hz, self.v_polarity, self.h_hz, self.h_polarity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HW: u32 = 270_000_000;

    #[test]
    fn long_low_time_means_positive_pulse() {
        let period = 1.0e9 / 60.0;
        let raw = probe_sample(period - 190_000.0, HW);
        assert_eq!(derive_polarity(raw, period, HW), Polarity::Pos);
        let raw = probe_sample(190_000.0, HW);
        assert_eq!(derive_polarity(raw, period, HW), Polarity::Neg);
    }

    #[test]
    fn untouched_counter_reads_as_negative() {
        assert_eq!(
            derive_polarity(SYNC_PROBE_COUNTER_INIT, 1.0e9 / 50.0, HW),
            Polarity::Neg
        );
    }

    #[test]
    fn rates_from_frame_period_and_lines() {
        assert!((vertical_hz(16_667) - 60.0).abs() < 0.01);
        assert_eq!(vertical_hz(0), 0.0);
        assert!((horizontal_hz(259, 3, 60.0) - 15_720.0).abs() < 0.5);
    }

    #[test]
    fn frame_clock_needs_two_frames() {
        let mut clock = FrameClock::default();
        assert_eq!(clock.frame_begin(1_000), None);
        assert_eq!(clock.frame_begin(21_000), Some(20_000));
        clock.reset();
        assert_eq!(clock.frame_begin(50_000), None);
    }
}
