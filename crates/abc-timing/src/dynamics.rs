//! ABC dynamics markings and their volume levels.

use std::fmt;

use serde::{Deserialize, Serialize};

const MAX_VOLUME: u8 = 127;

/// Dynamics markings from softest to loudest.
///
/// Each marking carries a MIDI velocity (what it is matched against) and the
/// volume a player renders it at. `ffff` sits above MIDI's 127 so that the
/// loudest notes still get their own marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dynamics {
    Pppp,
    Ppp,
    Pp,
    P,
    Mp,
    Mf,
    F,
    Ff,
    Fff,
    Ffff,
}

impl Dynamics {
    pub const ALL: [Dynamics; 10] = [
        Dynamics::Pppp,
        Dynamics::Ppp,
        Dynamics::Pp,
        Dynamics::P,
        Dynamics::Mp,
        Dynamics::Mf,
        Dynamics::F,
        Dynamics::Ff,
        Dynamics::Fff,
        Dynamics::Ffff,
    ];

    pub const DEFAULT: Dynamics = Dynamics::Mf;
    pub const MINIMUM: Dynamics = Dynamics::Pppp;
    pub const MAXIMUM: Dynamics = Dynamics::Ffff;

    pub fn midi_volume(self) -> i32 {
        match self {
            Dynamics::Pppp => 4,
            Dynamics::Ppp => 16,
            Dynamics::Pp => 32,
            Dynamics::P => 48,
            Dynamics::Mp => 64,
            Dynamics::Mf => 80,
            Dynamics::F => 96,
            Dynamics::Ff => 112,
            Dynamics::Fff => 127,
            Dynamics::Ffff => 144,
        }
    }

    pub fn abc_volume(self) -> i32 {
        match self {
            Dynamics::Pppp => 56,
            Dynamics::Ppp => 64,
            Dynamics::Pp => 72,
            Dynamics::P => 80,
            Dynamics::Mp => 88,
            Dynamics::Mf => 96,
            Dynamics::F => 104,
            Dynamics::Ff => 112,
            Dynamics::Fff => 120,
            Dynamics::Ffff => 127,
        }
    }

    /// Playback volume, clamped to the MIDI range.
    pub fn volume(self, abc: bool) -> u8 {
        let vol = if abc { self.abc_volume() } else { self.midi_volume() };
        vol.clamp(0, MAX_VOLUME as i32) as u8
    }

    /// The marking whose MIDI velocity is closest to `velocity`.
    ///
    /// The table is walked from the softest marking and the walk stops at
    /// the first entry that isn't strictly closer, so ties go to the softer
    /// marking.
    pub fn from_midi_velocity(velocity: i32) -> Dynamics {
        let mut best = Dynamics::ALL[0];
        let mut best_delta = (velocity - best.midi_volume()).abs();

        for &candidate in &Dynamics::ALL[1..] {
            let delta = (velocity - candidate.midi_volume()).abs();
            if delta >= best_delta {
                break;
            }
            best = candidate;
            best_delta = delta;
        }

        best
    }

    pub fn label(self) -> &'static str {
        match self {
            Dynamics::Pppp => "pppp",
            Dynamics::Ppp => "ppp",
            Dynamics::Pp => "pp",
            Dynamics::P => "p",
            Dynamics::Mp => "mp",
            Dynamics::Mf => "mf",
            Dynamics::F => "f",
            Dynamics::Ff => "ff",
            Dynamics::Fff => "fff",
            Dynamics::Ffff => "ffff",
        }
    }
}

impl Default for Dynamics {
    fn default() -> Self {
        Dynamics::DEFAULT
    }
}

impl fmt::Display for Dynamics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
