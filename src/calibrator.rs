//! # Sampling Clock Calibration
//!
//! The sampler can only slow its clock by a fixed-point divider with 1/256
//! resolution, and can only stretch each pixel by a whole number of program
//! steps (the grain). Neither axis alone gets close enough to an arbitrary
//! pixel clock, so [`calibrate`] searches both jointly and keeps the pair whose
//! programmable divider lands nearest to the ideal one.

use crate::clock_divider::ClockDivider;
use crate::timings::nominal_pixel_clock;
use crate::VideoFormat;
use std::ops::RangeInclusive;

/// Grain of the border probe program.
pub const BORDER_GRAIN: u32 = 10;
/// Largest sampling phase offset the pixel programs accept.
pub const MAX_SAMPLING_OFFSET: u32 = 7;

/// Candidate grains for the pixel program of `format`.
pub fn grain_range(format: VideoFormat) -> RangeInclusive<u32> {
    match format {
        VideoFormat::Cga | VideoFormat::Ega => 4..=16,
        VideoFormat::Mda => 5..=16,
    }
}

/// Winner of a calibration search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
    pub grain: u32,
    pub divider: ClockDivider,
    /// `|divider - ideal|` in ratio units.
    pub error: f64,
}

/// Finds the `(grain, divider)` pair with the smallest quantization error.
///
/// For every grain the ideal ratio `hw / (target * grain)` is rounded down to
/// the divider grid and one step up; both candidates are scored. Ties keep
/// the earlier candidate, so smaller grains win. Returns `None` only for an
/// empty grain range or a zero target clock.
pub fn calibrate(
    target_hz: u32,
    hardware_hz: u32,
    grains: RangeInclusive<u32>,
) -> Option<Calibration> {
    if target_hz == 0 {
        return None;
    }
    let mut best: Option<Calibration> = None;
    for grain in grains.filter(|g| *g > 0) {
        let ideal = f64::from(hardware_hz) / (f64::from(target_hz) * f64::from(grain));
        let floor = ClockDivider::from_ratio(ideal);
        for divider in [floor, floor.incremented()] {
            let error = (divider.value() - ideal).abs();
            if best.map_or(true, |b| error < b.error) {
                best = Some(Calibration {
                    grain,
                    divider,
                    error,
                });
            }
        }
    }
    best
}

/// Divider of the border probe, which runs at a fixed grain.
pub fn border_divider(pixel_clock_hz: u32, hardware_hz: u32) -> ClockDivider {
    if pixel_clock_hz == 0 {
        return ClockDivider::MIN;
    }
    ClockDivider::from_ratio(
        f64::from(hardware_hz) / (f64::from(pixel_clock_hz) * f64::from(BORDER_GRAIN)),
    )
}

/// Sampling setup of one format family.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationState {
    pub grain: u32,
    pub divider: ClockDivider,
    pub pixel_clock_hz: u32,
    pub sampling_offset: u32,
}

impl CalibrationState {
    /// Factory setup. The divider is a placeholder until the first
    /// [`CalibrationState::recalibrate`].
    pub fn for_format(format: VideoFormat) -> Self {
        let divider = match format {
            VideoFormat::Cga | VideoFormat::Mda => ClockDivider::new(1, 66),
            VideoFormat::Ega => ClockDivider::new(1, 131),
        };
        CalibrationState {
            grain: *grain_range(format).start(),
            divider,
            pixel_clock_hz: nominal_pixel_clock(format),
            sampling_offset: 0,
        }
    }

    /// Factory setup of every family, indexed by [`VideoFormat::index`].
    pub fn defaults() -> [CalibrationState; 3] {
        VideoFormat::ALL.map(Self::for_format)
    }

    /// Re-runs the search for the current pixel clock. A failed search keeps
    /// the previous values.
    pub fn recalibrate(&mut self, format: VideoFormat, hardware_hz: u32) -> Option<Calibration> {
        let result = calibrate(self.pixel_clock_hz, hardware_hz, grain_range(format))?;
        self.grain = result.grain;
        self.divider = result.divider;
        Some(result)
    }

    /// Steps the sampling phase, wrapping within `0..=MAX_SAMPLING_OFFSET`.
    pub fn step_sampling_offset(&mut self, increase: bool) {
        let span = MAX_SAMPLING_OFFSET + 1;
        self.sampling_offset = if increase {
            (self.sampling_offset + 1) % span
        } else {
            (self.sampling_offset + span - 1) % span
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HW: u32 = 270_000_000;

    /// Every divider on the grid within a few steps of the ideal ratio.
    fn grid_around(ideal: f64) -> Vec<ClockDivider> {
        let mut div = ClockDivider::from_ratio(ideal);
        for _ in 0..4 {
            div.decrement();
        }
        (0..10)
            .map(|_| {
                let d = div;
                div.increment();
                d
            })
            .collect()
    }

    #[test]
    fn chosen_pair_beats_every_grid_candidate() {
        for format in VideoFormat::ALL {
            let target = nominal_pixel_clock(format);
            let best = calibrate(target, HW, grain_range(format)).expect("non-empty range");
            for grain in grain_range(format) {
                let ideal = f64::from(HW) / (f64::from(target) * f64::from(grain));
                for div in grid_around(ideal) {
                    let err = (div.value() - ideal).abs();
                    assert!(
                        best.error <= err,
                        "{}: grain {} div {} err {} beats chosen {:?}",
                        format,
                        grain,
                        div,
                        err,
                        best
                    );
                }
            }
        }
    }

    #[test]
    fn nominal_clocks_calibrate_within_bound() {
        for format in VideoFormat::ALL {
            let best = calibrate(nominal_pixel_clock(format), HW, grain_range(format))
                .expect("calibration result");
            assert!(
                best.error < 0.002,
                "{} divider error {} too large",
                format,
                best.error
            );
            assert!(grain_range(format).contains(&best.grain));
        }
    }

    #[test]
    fn adjusted_clocks_stay_within_bound() {
        for khz in (13_000..16_000).step_by(37) {
            let best = calibrate(khz * 1000, HW, grain_range(VideoFormat::Cga))
                .expect("calibration result");
            assert!(best.error < 0.002, "{} kHz error {}", khz, best.error);
        }
    }

    #[test]
    fn degenerate_inputs_yield_nothing() {
        assert!(calibrate(0, HW, 4..=16).is_none());
        #[allow(clippy::reversed_empty_ranges)]
        let empty = 5..=4;
        assert!(calibrate(14_318_181, HW, empty).is_none());
    }

    #[test]
    fn recalibrate_updates_state() {
        let mut state = CalibrationState::for_format(VideoFormat::Ega);
        let result = state
            .recalibrate(VideoFormat::Ega, HW)
            .expect("calibration result");
        assert_eq!(state.grain, result.grain);
        assert_eq!(state.divider, result.divider);
    }

    #[test]
    fn sampling_offset_wraps() {
        let mut state = CalibrationState::for_format(VideoFormat::Cga);
        state.step_sampling_offset(false);
        assert_eq!(state.sampling_offset, MAX_SAMPLING_OFFSET);
        state.step_sampling_offset(true);
        assert_eq!(state.sampling_offset, 0);
    }

    #[test]
    fn border_divider_uses_fixed_grain() {
        let div = border_divider(14_318_181, HW);
        assert_eq!(div.int_part(), 1);
        assert!((div.value() - 1.8857).abs() < 0.004);
    }
}
