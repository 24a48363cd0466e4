//! # embedded-hal Adapters
//!
//! Board glue for the `hardware` feature. Sync lines, the presence detect
//! line and the two buttons are plain `embedded_hal::digital::InputPin`s. The
//! sampler FIFOs are board specific and come in through [`SamplerFifos`].
//!
//! A pin read error is treated as a low level and logged at trace level; the
//! acquisition loop has no way to recover from a broken pin anyway.

use crate::hardware::{NoSignalWatch, SignalPort};
use crate::input::{ButtonInput, ButtonSample, Debouncer};
use embedded_hal::digital::InputPin;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// The four queues the acquisition programs feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fifo {
    Pixels,
    Border,
    VSyncPolarity,
    HSyncPolarity,
}

/// Non-blocking reads from the sampler's receive queues.
pub trait SamplerFifos: Send {
    fn try_pop(&mut self, fifo: Fifo) -> Option<u32>;
}

fn read<P: InputPin>(pin: &mut P) -> bool {
    pin.is_high().unwrap_or_else(|e| {
        log::trace!("pin read failed: {:?}", e);
        false
    })
}

/// [`SignalPort`] over two sync input pins and the board's FIFOs.
pub struct HalSignalPort<H, V, F> {
    hsync: H,
    vsync: V,
    fifos: F,
    epoch: Instant,
}

impl<H, V, F> HalSignalPort<H, V, F>
where
    H: InputPin + Send,
    V: InputPin + Send,
    F: SamplerFifos,
{
    pub fn new(hsync: H, vsync: V, fifos: F) -> Self {
        HalSignalPort {
            hsync,
            vsync,
            fifos,
            epoch: Instant::now(),
        }
    }
}

impl<H, V, F> SignalPort for HalSignalPort<H, V, F>
where
    H: InputPin + Send,
    V: InputPin + Send,
    F: SamplerFifos,
{
    fn hsync_level(&mut self) -> bool {
        read(&mut self.hsync)
    }

    fn vsync_level(&mut self) -> bool {
        read(&mut self.vsync)
    }

    fn try_pop_pixels(&mut self) -> Option<u32> {
        self.fifos.try_pop(Fifo::Pixels)
    }

    fn try_pop_border(&mut self) -> Option<u32> {
        self.fifos.try_pop(Fifo::Border)
    }

    fn try_pop_vsync_polarity(&mut self) -> Option<u32> {
        self.fifos.try_pop(Fifo::VSyncPolarity)
    }

    fn try_pop_hsync_polarity(&mut self) -> Option<u32> {
        self.fifos.try_pop(Fifo::HSyncPolarity)
    }

    fn now_us(&mut self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

/// Presence detect line, high while a source drives the input.
pub struct PinWatch<P>(Mutex<P>);

impl<P: InputPin + Send> PinWatch<P> {
    pub fn new(pin: P) -> Self {
        PinWatch(Mutex::new(pin))
    }
}

impl<P: InputPin + Send> NoSignalWatch for PinWatch<P> {
    fn signal_present(&self) -> bool {
        let mut pin = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        read(&mut *pin)
    }
}

/// The two front-panel buttons, active low.
pub struct HalButtons<A, P> {
    auto_adjust: A,
    pixel_clock: P,
    auto_deb: Debouncer,
    clock_deb: Debouncer,
}

impl<A, P> HalButtons<A, P>
where
    A: InputPin + Send,
    P: InputPin + Send,
{
    pub fn new(auto_adjust: A, pixel_clock: P) -> Self {
        HalButtons {
            auto_adjust,
            pixel_clock,
            auto_deb: Debouncer::new(),
            clock_deb: Debouncer::new(),
        }
    }
}

impl<A, P> ButtonInput for HalButtons<A, P>
where
    A: InputPin + Send,
    P: InputPin + Send,
{
    fn tick(&mut self) -> ButtonSample {
        let auto = !read(&mut self.auto_adjust);
        let clock = !read(&mut self.pixel_clock);
        ButtonSample {
            auto_adjust: self.auto_deb.update(auto),
            pixel_clock: self.clock_deb.update(clock),
        }
    }

    fn both_held(&mut self) -> bool {
        !read(&mut self.auto_adjust) && !read(&mut self.pixel_clock)
    }
}
