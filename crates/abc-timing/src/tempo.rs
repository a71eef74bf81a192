//! Tempo units and tick/microsecond conversions shared by the tempo maps.

pub const ONE_SECOND_MICROS: u64 = 1_000_000;
pub const ONE_MINUTE_MICROS: u64 = 60 * ONE_SECOND_MICROS;

/// 120 BPM, the MIDI default when a sequence carries no tempo events.
pub const DEFAULT_TEMPO_MPQ: u32 = 500_000;

/// Anything that can place ticks on a wall-clock timeline.
pub trait TempoCache {
    fn tick_to_micros(&self, tick: u64) -> u64;
    fn micros_to_tick(&self, micros: u64) -> u64;
}

/// Anything that knows where bar lines fall.
pub trait BarNumberCache {
    fn tick_to_bar_number(&self, tick: u64) -> u32;
}

/// Microseconds per quarter note to beats per minute.
pub fn mpq_to_bpm(mpq: f64) -> f64 {
    ONE_MINUTE_MICROS as f64 / mpq
}

/// Beats per minute to microseconds per quarter note.
pub fn bpm_to_mpq(bpm: f64) -> f64 {
    ONE_MINUTE_MICROS as f64 / bpm
}

/// Snap a tempo to the nearest whole BPM, returned as MPQN.
pub fn round_tempo_mpq(mpq: f64) -> f64 {
    bpm_to_mpq(mpq_to_bpm(mpq).round())
}

/// Duration of `ticks` at a constant tempo. Truncates toward zero.
pub fn ticks_to_micros(ticks: u64, tempo_mpq: u32, resolution: u32) -> u64 {
    (ticks as u128 * tempo_mpq as u128 / resolution as u128) as u64
}

/// Inverse of [`ticks_to_micros`], rounded to the nearest tick so that a
/// truncated forward conversion still maps back onto the tick it came from.
pub fn micros_to_ticks(micros: u64, tempo_mpq: u32, resolution: u32) -> u64 {
    let mpq = tempo_mpq as u128;
    ((micros as u128 * resolution as u128 + mpq / 2) / mpq) as u64
}

/// Largest multiple of `grid` that is `<= value`.
pub fn floor_grid(value: u64, grid: u64) -> u64 {
    (value / grid) * grid
}

/// Nearest multiple of `grid`, halves rounding up.
pub fn round_grid(value: u64, grid: u64) -> u64 {
    ((value + grid / 2) / grid) * grid
}
