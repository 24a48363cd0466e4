//! # Button Input
//!
//! The supervisor only ever sees one [`ButtonSample`] per frame. Where the
//! states come from (GPIO pins through [`Debouncer`], a scripted sequence in
//! tests, nothing at all) is hidden behind [`ButtonInput`].

use std::collections::VecDeque;

/// Raw samples that must agree before a level change is accepted.
pub const DEBOUNCE_SAMPLES: usize = 2;
/// Frames a button must be held to count as a long press.
pub const LONG_PRESS_FRAMES: u32 = 120;
/// Held at least this long, a release counts as a medium release.
pub const MED_RELEASE_FRAMES: u32 = LONG_PRESS_FRAMES / 4;

/// Gesture seen on one button during the last frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ButtonState {
    #[default]
    None,
    /// Held down (including the frame it went down).
    Pressed,
    /// Short press released.
    Release,
    /// Medium press released.
    MedRelease,
    /// Held for [`LONG_PRESS_FRAMES`]; the following release is swallowed.
    LongPress,
}

impl ButtonState {
    pub fn is_release(self) -> bool {
        matches!(self, ButtonState::Release | ButtonState::MedRelease)
    }
}

/// Both buttons, sampled together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ButtonSample {
    pub auto_adjust: ButtonState,
    pub pixel_clock: ButtonState,
}

impl ButtonSample {
    pub fn auto_adjust(state: ButtonState) -> Self {
        ButtonSample {
            auto_adjust: state,
            ..Self::default()
        }
    }

    pub fn pixel_clock(state: ButtonState) -> Self {
        ButtonSample {
            pixel_clock: state,
            ..Self::default()
        }
    }

    /// Neither button produced a gesture the menus react to.
    pub fn is_idle(&self) -> bool {
        let quiet = |s: ButtonState| matches!(s, ButtonState::None | ButtonState::Pressed);
        quiet(self.auto_adjust) && quiet(self.pixel_clock)
    }
}

pub trait ButtonInput: Send {
    /// Samples both buttons. Called exactly once per frame.
    fn tick(&mut self) -> ButtonSample;

    /// Both buttons held down right now. Checked once at start-up.
    fn both_held(&mut self) -> bool {
        false
    }
}

/// Input with no buttons attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoButtons;

impl ButtonInput for NoButtons {
    fn tick(&mut self) -> ButtonSample {
        ButtonSample::default()
    }
}

/// Turns raw per-frame pin readings into [`ButtonState`]s.
#[derive(Debug, Clone)]
pub struct Debouncer {
    history: [bool; DEBOUNCE_SAMPLES],
    pos: usize,
    last: bool,
    held_frames: u32,
    ignore_release: bool,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}

impl Debouncer {
    pub fn new() -> Self {
        Debouncer {
            history: [false; DEBOUNCE_SAMPLES],
            pos: 0,
            last: false,
            held_frames: 0,
            ignore_release: false,
        }
    }

    /// Debounced level.
    pub fn is_held(&self) -> bool {
        self.last
    }

    /// Feeds one raw reading (`true` = pressed) and returns the gesture.
    pub fn update(&mut self, pressed: bool) -> ButtonState {
        self.history[self.pos] = pressed;
        self.pos = (self.pos + 1) % DEBOUNCE_SAMPLES;
        let level = if self.history.iter().all(|&h| h == pressed) {
            pressed
        } else {
            self.last
        };
        let state = match (self.last, level) {
            (false, true) => {
                self.held_frames = 0;
                ButtonState::Pressed
            }
            (true, false) => {
                if self.ignore_release {
                    self.ignore_release = false;
                    ButtonState::None
                } else if self.held_frames >= MED_RELEASE_FRAMES {
                    ButtonState::MedRelease
                } else {
                    ButtonState::Release
                }
            }
            (true, true) => {
                self.held_frames += 1;
                if self.held_frames == LONG_PRESS_FRAMES {
                    self.ignore_release = true;
                    ButtonState::LongPress
                } else {
                    ButtonState::Pressed
                }
            }
            (false, false) => ButtonState::None,
        };
        self.last = level;
        state
    }
}

/// Replays gestures at given frame numbers; idle otherwise.
#[derive(Debug, Default, Clone)]
pub struct ScriptedButtons {
    frame: u64,
    events: VecDeque<(u64, ButtonSample)>,
    hold_both: bool,
}

impl ScriptedButtons {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a gesture for frame `frame` (counted from the first tick, 0-based).
    /// Events must be added in frame order.
    pub fn at(mut self, frame: u64, sample: ButtonSample) -> Self {
        self.events.push_back((frame, sample));
        self
    }

    /// Reports both buttons held at start-up.
    pub fn holding_both(mut self) -> Self {
        self.hold_both = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl ButtonInput for ScriptedButtons {
    fn tick(&mut self) -> ButtonSample {
        let frame = self.frame;
        self.frame += 1;
        match self.events.front() {
            Some(&(at, sample)) if at <= frame => {
                self.events.pop_front();
                sample
            }
            _ => ButtonSample::default(),
        }
    }

    fn both_held(&mut self) -> bool {
        self.hold_both
    }
}
