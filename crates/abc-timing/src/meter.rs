//! Time signatures.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A meter such as 4/4 or 6/8.
///
/// The denominator is a power of two no larger than [`TimeSignature::MAX_DENOMINATOR`]
/// and the numerator fits in a MIDI data byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSignature {
    pub numerator: u8,
    pub denominator: u8,
}

impl TimeSignature {
    pub const MAX_DENOMINATOR: u8 = 8;
    pub const FOUR_FOUR: TimeSignature = TimeSignature {
        numerator: 4,
        denominator: 4,
    };

    pub fn new(numerator: u32, denominator: u32) -> Result<Self> {
        if denominator == 0 || !denominator.is_power_of_two() {
            return Err(Error::TimeSignature(format!(
                "the denominator must be a power of 2, got {denominator}"
            )));
        }
        if denominator > Self::MAX_DENOMINATOR as u32 {
            return Err(Error::TimeSignature(format!(
                "the denominator must be no greater than {}, got {denominator}",
                Self::MAX_DENOMINATOR
            )));
        }
        if numerator == 0 || numerator > 255 {
            return Err(Error::TimeSignature(format!(
                "the numerator must be between 1 and 255, got {numerator}"
            )));
        }

        Ok(TimeSignature {
            numerator: numerator as u8,
            denominator: denominator as u8,
        })
    }

    /// Build from the first two bytes of a time-signature meta event, where
    /// the denominator is stored as a power of two. Meters the notation can't
    /// express fall back to 4/4.
    pub fn from_midi(numerator: u8, denominator_pow: u8) -> Self {
        if denominator_pow > 3 {
            return Self::FOUR_FOUR;
        }
        Self::new(numerator as u32, 1u32 << denominator_pow).unwrap_or(Self::FOUR_FOUR)
    }

    /// Best guess at whether the meter is compound (6/8, 9/8, 12/8...).
    pub fn is_compound(&self) -> bool {
        self.numerator % 3 == 0
    }

    /// Meter as a decimal, e.g. 0.75 for 3/4.
    pub fn ratio(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::FOUR_FOUR
    }
}

impl FromStr for TimeSignature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "C" => return Ok(Self::FOUR_FOUR),
            "C|" => return Self::new(2, 2),
            _ => {}
        }

        let parts: Vec<&str> = s.split(['/', ':', '|', ' ']).collect();
        let [num, den] = parts.as_slice() else {
            return Err(Error::TimeSignature(format!(
                "\"{s}\" is not a valid time signature (expected format: 4/4)"
            )));
        };

        let parse = |part: &str| {
            part.parse::<u32>().map_err(|e| {
                Error::TimeSignature(format!("\"{s}\" is not a valid time signature: {e}"))
            })
        };
        Self::new(parse(*num)?, parse(*den)?)
    }
}

impl TryFrom<String> for TimeSignature {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TimeSignature> for String {
    fn from(ts: TimeSignature) -> String {
        ts.to_string()
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}
