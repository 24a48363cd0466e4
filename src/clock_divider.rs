//! # Sampling Clock Divider
//!
//! The sampling hardware derives its clock by dividing the system clock by a
//! fixed-point ratio: a 16-bit integer part and an 8-bit fraction (256ths).
//! [`ClockDivider`] mirrors that register pair exactly, so every value it can
//! hold is a value the hardware can be programmed with.

use std::fmt;

/// Fixed-point (integer.fraction/256) sampling clock ratio.
///
/// Field order matters: the derived ordering compares the integer part first,
/// which matches numeric ordering of [`ClockDivider::value`].
///
/// # Example
/// ```
/// use ttl_reader_lib::ClockDivider;
///
/// let div = ClockDivider::from_ratio(4.75);
/// assert_eq!((div.int_part(), div.frac_part()), (4, 192));
/// assert_eq!(div.value(), 4.75);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockDivider {
    int: u16,
    frac: u8,
}

impl ClockDivider {
    /// Smallest ratio the hardware accepts (divide by one).
    pub const MIN: ClockDivider = ClockDivider { int: 1, frac: 0 };
    /// Largest representable ratio.
    pub const MAX: ClockDivider = ClockDivider {
        int: u16::MAX,
        frac: u8::MAX,
    };

    /// Builds a divider from raw register values. An integer part of zero is
    /// not a valid divider and is raised to one.
    pub const fn new(int: u16, frac: u8) -> Self {
        if int == 0 {
            ClockDivider { int: 1, frac }
        } else {
            ClockDivider { int, frac }
        }
    }

    /// Converts a floating ratio by truncation: the integer part is dropped
    /// toward zero and the remainder is scaled to 256ths, again truncating.
    /// Ratios outside the representable range saturate.
    pub fn from_ratio(ratio: f64) -> Self {
        if !ratio.is_finite() || ratio < 1.0 {
            return Self::MIN;
        }
        if ratio >= f64::from(u16::MAX) + 1.0 {
            return Self::MAX;
        }
        let int = ratio.trunc();
        let frac = ((ratio - int) * 256.0).trunc();
        Self::new(int as u16, frac.min(255.0) as u8)
    }

    pub const fn int_part(&self) -> u16 {
        self.int
    }

    pub const fn frac_part(&self) -> u8 {
        self.frac
    }

    /// The ratio this divider programs: `int + frac / 256`.
    pub fn value(&self) -> f64 {
        f64::from(self.int) + f64::from(self.frac) / 256.0
    }

    /// Steps to the next representable ratio, saturating at [`Self::MAX`].
    pub fn increment(&mut self) {
        if *self == Self::MAX {
            return;
        }
        if self.frac == u8::MAX {
            self.frac = 0;
            self.int += 1;
        } else {
            self.frac += 1;
        }
    }

    /// Steps to the previous representable ratio, saturating at [`Self::MIN`].
    pub fn decrement(&mut self) {
        if *self == Self::MIN {
            return;
        }
        if self.frac == 0 {
            self.frac = u8::MAX;
            self.int -= 1;
        } else {
            self.frac -= 1;
        }
    }

    /// Copy of `self` stepped up once.
    pub fn incremented(mut self) -> Self {
        self.increment();
        self
    }

    /// Copy of `self` stepped down once.
    pub fn decremented(mut self) -> Self {
        self.decrement();
        self
    }
}

impl Default for ClockDivider {
    fn default() -> Self {
        Self::MIN
    }
}

impl fmt::Display for ClockDivider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}F{}", self.int, self.frac)
    }
}
