//! Note-length grid for a single tempo.
//!
//! ABC can only express note lengths that are whole multiples of the unit
//! note length, and players can't reproduce notes much shorter than
//! [`SHORTEST_NOTE_MICROS`]. [`TimingInfo`] picks the finest power-of-two (or
//! triplet) subdivision whose duration at the export tempo is at least that
//! long, and derives the bar length on that grid.

use serde::Serialize;
use tracing::trace;

use crate::meter::TimeSignature;
use crate::tempo::{mpq_to_bpm, ONE_MINUTE_MICROS, ONE_SECOND_MICROS};
use crate::{Error, Result};

pub const SHORTEST_NOTE_MICROS: u64 = ONE_MINUTE_MICROS / 1000;
pub const LONGEST_NOTE_MICROS: u64 = 8 * ONE_SECOND_MICROS;

/// Fastest export tempo in BPM.
pub const MAX_TEMPO: u32 = (ONE_MINUTE_MICROS / SHORTEST_NOTE_MICROS) as u32;
/// Slowest export tempo in BPM, rounded up.
pub const MIN_TEMPO: u32 =
    ((ONE_MINUTE_MICROS + LONGEST_NOTE_MICROS / 2) / LONGEST_NOTE_MICROS) as u32;

/// Grid descriptor for one (tempo, meter, triplet) combination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimingInfo {
    /// Source tempo, microseconds per quarter note.
    pub tempo_mpq: u32,
    /// Tempo the notes will be written at, after the export tempo factor.
    pub export_tempo_mpq: u32,
    pub resolution_ppq: u32,
    pub meter: TimeSignature,
    pub triplet_timing: bool,

    /// The ABC default note length for the meter (8 for eighth notes, 16 for sixteenths).
    pub default_divisor: u32,
    /// The grid unit as a fraction of a whole note: 1/`min_note_divisor`.
    pub min_note_divisor: u32,
    pub min_note_length_ticks: u64,
    /// Duration of one grid unit at the export tempo.
    pub min_note_length_micros: u64,
    pub max_note_length_ticks: u64,
    pub bar_length_ticks: u64,
}

impl TimingInfo {
    pub fn new(
        tempo_mpq: u32,
        resolution_ppq: u32,
        export_tempo_factor: f32,
        meter: TimeSignature,
        triplet_timing: bool,
    ) -> Result<Self> {
        if !export_tempo_factor.is_finite() || export_tempo_factor <= 0.0 {
            return Err(Error::Conversion(format!(
                "export tempo factor must be positive, got {export_tempo_factor}"
            )));
        }
        if tempo_mpq == 0 || resolution_ppq == 0 {
            return Err(Error::Conversion(format!(
                "invalid tempo data: tempo {tempo_mpq} MPQN at resolution {resolution_ppq}"
            )));
        }

        let export_tempo_mpq = (tempo_mpq as f64 / export_tempo_factor as f64).round() as u32;
        let export_tempo_bpm = mpq_to_bpm(export_tempo_mpq as f64);
        if !(MIN_TEMPO as f64..=MAX_TEMPO as f64).contains(&export_tempo_bpm) {
            return Err(Error::Conversion(format!(
                "tempo {} is out of range. Must be between {MIN_TEMPO} and {MAX_TEMPO}",
                export_tempo_bpm.round()
            )));
        }

        // ABC default note length: sixteenths for a meter below 0.75 (2/4),
        // eighths otherwise, relative to the meter's beat unit.
        let default_divisor =
            (if meter.ratio() < 0.75 { 16 } else { 8 }) * 4 / meter.denominator as u32;

        let mut divisor = default_divisor;
        if triplet_timing {
            divisor *= 3;
        }

        // One grid unit lasts whole_note_micros / divisor. Compare as a
        // fraction so that truncation never pushes it across a bound.
        let whole_note_micros = 4 * export_tempo_mpq as u64;
        while divisor > 1 && whole_note_micros < SHORTEST_NOTE_MICROS * divisor as u64 {
            divisor /= 2;
        }
        debug_assert!(whole_note_micros >= SHORTEST_NOTE_MICROS * divisor as u64);

        while whole_note_micros >= 2 * SHORTEST_NOTE_MICROS * divisor as u64 {
            divisor *= 2;
        }

        if meter.denominator as u32 > divisor {
            return Err(Error::Conversion(format!(
                "the denominator of the meter must be no greater than {divisor}"
            )));
        }

        let min_note_length_ticks = 4 * resolution_ppq as u64 / divisor as u64;
        if min_note_length_ticks == 0 {
            return Err(Error::Conversion(format!(
                "a resolution of {resolution_ppq} ticks per quarter note is too coarse for 1/{divisor} notes"
            )));
        }

        let min_note_length_micros = whole_note_micros / divisor as u64;
        let max_note_length_ticks =
            min_note_length_ticks * (LONGEST_NOTE_MICROS / min_note_length_micros);
        let bar_length_ticks = divisor as u64 * min_note_length_ticks * meter.numerator as u64
            / meter.denominator as u64;

        trace!(
            tempo_mpq,
            export_tempo_mpq,
            min_note_divisor = divisor,
            min_note_length_ticks,
            bar_length_ticks,
            "computed note grid"
        );

        Ok(TimingInfo {
            tempo_mpq,
            export_tempo_mpq,
            resolution_ppq,
            meter,
            triplet_timing,
            default_divisor,
            min_note_divisor: divisor,
            min_note_length_ticks,
            min_note_length_micros,
            max_note_length_ticks,
            bar_length_ticks,
        })
    }

    pub fn tempo_bpm(&self) -> u32 {
        mpq_to_bpm(self.tempo_mpq as f64).round() as u32
    }

    pub fn export_tempo_bpm(&self) -> u32 {
        mpq_to_bpm(self.export_tempo_mpq as f64).round() as u32
    }
}

/// Remembers the most recent grid so that runs of the same tempo don't
/// recompute it.
///
/// Resolution, export factor and meter are fixed for the cache's lifetime; the
/// entry is replaced whenever the tempo or triplet flag differs from the
/// previous call.
#[derive(Debug, Clone)]
pub struct GridCache {
    resolution_ppq: u32,
    export_tempo_factor: f32,
    meter: TimeSignature,
    last: Option<CachedGrid>,
}

#[derive(Debug, Clone)]
struct CachedGrid {
    tempo_mpq: u32,
    triplet_timing: bool,
    info: TimingInfo,
}

impl GridCache {
    pub fn new(resolution_ppq: u32, export_tempo_factor: f32, meter: TimeSignature) -> Self {
        GridCache {
            resolution_ppq,
            export_tempo_factor,
            meter,
            last: None,
        }
    }

    pub fn get(&mut self, tempo_mpq: u32, triplet_timing: bool) -> Result<&TimingInfo> {
        let entry = match self.last.take() {
            Some(cached)
                if cached.tempo_mpq == tempo_mpq && cached.triplet_timing == triplet_timing =>
            {
                cached
            }
            _ => CachedGrid {
                tempo_mpq,
                triplet_timing,
                info: TimingInfo::new(
                    tempo_mpq,
                    self.resolution_ppq,
                    self.export_tempo_factor,
                    self.meter,
                    triplet_timing,
                )?,
            },
        };

        Ok(&self.last.insert(entry).info)
    }
}
