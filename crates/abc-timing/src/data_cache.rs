//! One-pass extraction of channel state and the raw tempo map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::channel_map::{ChannelStateMap, CHANNEL_COUNT};
use crate::meter::TimeSignature;
use crate::sequence::{Division, Sequence, SequenceMessage};
use crate::tempo::{
    micros_to_ticks, mpq_to_bpm, ticks_to_micros, BarNumberCache, TempoCache, DEFAULT_TEMPO_MPQ,
    ONE_SECOND_MICROS,
};

pub const DRUM_CHANNEL: u8 = 9;

pub const DEFAULT_INSTRUMENT: u8 = 0;
pub const DEFAULT_CHANNEL_VOLUME: u8 = 100;
pub const DEFAULT_PITCH_BEND_RANGE_SEMITONES: u8 = 2;
pub const DEFAULT_PITCH_BEND_RANGE_CENTS: u8 = 0;

pub const CHANNEL_VOLUME_CONTROLLER_COARSE: u8 = 7;
pub const DATA_ENTRY_COARSE: u8 = 6;
pub const DATA_ENTRY_FINE: u8 = 38;
pub const REGISTERED_PARAMETER_NUMBER_LSB: u8 = 100;
pub const REGISTERED_PARAMETER_NUMBER_MSB: u8 = 101;

pub const REGISTERED_PARAM_PITCH_BEND_RANGE: u16 = 0x0000;
pub const REGISTERED_PARAM_NONE: u16 = 0x3FFF;

/// A tempo change in the source sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempoEvent {
    pub tick: u64,
    pub tempo_mpq: u32,
    /// Wall-clock start of this tempo.
    pub micros: u64,
}

impl TempoEvent {
    pub const DEFAULT: TempoEvent = TempoEvent {
        tick: 0,
        tempo_mpq: DEFAULT_TEMPO_MPQ,
        micros: 0,
    };
}

/// Everything the exporter needs to know about a sequence that isn't a note:
/// per-channel instrument, volume and pitch-bend range, the tempo map, the
/// meter, and the song length.
///
/// Built once from a [`Sequence`] and immutable afterward.
#[derive(Debug, Clone)]
pub struct SequenceDataCache {
    division: Division,
    tick_resolution: u32,
    primary_tempo_mpq: u32,
    min_tempo_mpq: u32,
    max_tempo_mpq: u32,
    time_signature: TimeSignature,
    tempo: BTreeMap<u64, TempoEvent>,
    song_length_ticks: u64,

    instruments: ChannelStateMap<u8>,
    volume: ChannelStateMap<u8>,
    pitch_bend_coarse: ChannelStateMap<u8>,
    pitch_bend_fine: ChannelStateMap<u8>,
}

impl SequenceDataCache {
    pub fn new(sequence: &Sequence) -> Self {
        let division = sequence.division;
        let tick_resolution = sequence.resolution.max(1);

        let mut tempo = BTreeMap::new();
        tempo.insert(0, TempoEvent::DEFAULT);

        // Total microseconds spent at each tempo value, in first-seen order
        let mut tempo_lengths: Vec<(u32, u64)> = Vec::new();
        let mut accumulate = |tempo_mpq: u32, micros: u64| {
            match tempo_lengths.iter_mut().find(|(mpq, _)| *mpq == tempo_mpq) {
                Some((_, total)) => *total += micros,
                None => tempo_lengths.push((tempo_mpq, micros)),
            }
        };

        let mut instruments = ChannelStateMap::new(DEFAULT_INSTRUMENT);
        let mut volume = ChannelStateMap::new(DEFAULT_CHANNEL_VOLUME);
        let mut pitch_bend_coarse = ChannelStateMap::new(DEFAULT_PITCH_BEND_RANGE_SEMITONES);
        let mut pitch_bend_fine = ChannelStateMap::new(DEFAULT_PITCH_BEND_RANGE_CENTS);

        // Active registered parameter number per channel
        let mut rpn = [REGISTERED_PARAM_NONE; CHANNEL_COUNT];

        let mut time_signature = None;
        let mut ignored_tempo_events = 0usize;
        let last_tick = sequence.last_tick();

        for (track_index, track) in sequence.tracks.iter().enumerate() {
            for event in track {
                let tick = event.tick;

                match &event.message {
                    SequenceMessage::ProgramChange { channel, program } => {
                        if *channel != DRUM_CHANNEL {
                            instruments.insert(*channel, tick, *program);
                        }
                    }
                    SequenceMessage::ControlChange {
                        channel,
                        controller,
                        value,
                    } => {
                        let ch = *channel as usize;
                        let value = *value & 0x7F;
                        match *controller {
                            CHANNEL_VOLUME_CONTROLLER_COARSE => volume.insert(*channel, tick, value),
                            REGISTERED_PARAMETER_NUMBER_MSB => {
                                rpn[ch] = (rpn[ch] & 0x7F) | ((value as u16) << 7);
                            }
                            REGISTERED_PARAMETER_NUMBER_LSB => {
                                rpn[ch] = (rpn[ch] & (0x7F << 7)) | value as u16;
                            }
                            DATA_ENTRY_COARSE if rpn[ch] == REGISTERED_PARAM_PITCH_BEND_RANGE => {
                                pitch_bend_coarse.insert(*channel, tick, value);
                            }
                            DATA_ENTRY_FINE if rpn[ch] == REGISTERED_PARAM_PITCH_BEND_RANGE => {
                                pitch_bend_fine.insert(*channel, tick, value);
                            }
                            _ => {}
                        }
                    }
                    SequenceMessage::Tempo(tempo_mpq) if track_index == 0 => {
                        if division != Division::Ppq {
                            ignored_tempo_events += 1;
                            continue;
                        }

                        let prev = floor_tempo(&tempo, tick);
                        let elapsed =
                            ticks_to_micros(tick - prev.tick, prev.tempo_mpq, tick_resolution);
                        accumulate(prev.tempo_mpq, elapsed);
                        tempo.insert(
                            tick,
                            TempoEvent {
                                tick,
                                tempo_mpq: *tempo_mpq,
                                micros: prev.micros + elapsed,
                            },
                        );
                    }
                    SequenceMessage::TimeSignature {
                        numerator,
                        denominator_pow,
                    } => {
                        if time_signature.is_none() {
                            time_signature =
                                Some(TimeSignature::from_midi(*numerator, *denominator_pow));
                        }
                    }
                    _ => {}
                }
            }
        }

        if ignored_tempo_events > 0 {
            warn!(
                count = ignored_tempo_events,
                "ignoring tempo events in a timecode-based sequence"
            );
        }

        // The final tempo runs until the end of the song
        let last = floor_tempo(&tempo, last_tick);
        accumulate(
            last.tempo_mpq,
            ticks_to_micros(last_tick - last.tick, last.tempo_mpq, tick_resolution),
        );

        let mut primary: Option<(u32, u64)> = None;
        for &(mpq, micros) in &tempo_lengths {
            if primary.map_or(true, |(_, best)| micros > best) {
                primary = Some((mpq, micros));
            }
        }
        let primary_tempo_mpq = primary.map(|(mpq, _)| mpq).unwrap_or(DEFAULT_TEMPO_MPQ);

        let min_tempo_mpq = tempo.values().map(|t| t.tempo_mpq).min().unwrap_or(DEFAULT_TEMPO_MPQ);
        let max_tempo_mpq = tempo.values().map(|t| t.tempo_mpq).max().unwrap_or(DEFAULT_TEMPO_MPQ);

        info!(
            primary_tempo_mpq,
            tempo_changes = tempo.len(),
            song_length_ticks = last_tick,
            "scanned sequence"
        );

        SequenceDataCache {
            division,
            tick_resolution,
            primary_tempo_mpq,
            min_tempo_mpq,
            max_tempo_mpq,
            time_signature: time_signature.unwrap_or_default(),
            tempo,
            song_length_ticks: last_tick,
            instruments,
            volume,
            pitch_bend_coarse,
            pitch_bend_fine,
        }
    }

    /// Parse Standard MIDI File bytes and scan them.
    pub fn parse(midi_bytes: &[u8]) -> crate::Result<Self> {
        Ok(Self::new(&Sequence::parse(midi_bytes)?))
    }

    pub fn instrument(&self, channel: u8, tick: u64) -> u8 {
        self.instruments.get(channel, tick)
    }

    pub fn volume(&self, channel: u8, tick: u64) -> u8 {
        self.volume.get(channel, tick)
    }

    /// Pitch-bend range in semitones, including the fine (cents) part.
    pub fn pitch_bend_range(&self, channel: u8, tick: u64) -> f64 {
        self.pitch_bend_coarse.get(channel, tick) as f64
            + self.pitch_bend_fine.get(channel, tick) as f64 / 100.0
    }

    pub fn tempo_mpq(&self, tick: u64) -> u32 {
        self.tempo_event_for_tick(tick).tempo_mpq
    }

    pub fn tempo_bpm(&self, tick: u64) -> u32 {
        mpq_to_bpm(self.tempo_mpq(tick) as f64).round() as u32
    }

    pub fn primary_tempo_mpq(&self) -> u32 {
        self.primary_tempo_mpq
    }

    pub fn primary_tempo_bpm(&self) -> u32 {
        mpq_to_bpm(self.primary_tempo_mpq as f64).round() as u32
    }

    /// Smallest MPQN, i.e. the fastest tempo.
    pub fn min_tempo_mpq(&self) -> u32 {
        self.min_tempo_mpq
    }

    /// Largest MPQN, i.e. the slowest tempo.
    pub fn max_tempo_mpq(&self) -> u32 {
        self.max_tempo_mpq
    }

    pub fn min_tempo_bpm(&self) -> u32 {
        mpq_to_bpm(self.max_tempo_mpq as f64).round() as u32
    }

    pub fn max_tempo_bpm(&self) -> u32 {
        mpq_to_bpm(self.min_tempo_mpq as f64).round() as u32
    }

    pub fn division(&self) -> Division {
        self.division
    }

    pub fn tick_resolution(&self) -> u32 {
        self.tick_resolution
    }

    pub fn song_length_ticks(&self) -> u64 {
        self.song_length_ticks
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    /// Bar length at the sequence's own meter, ignoring any export grid.
    pub fn bar_length_ticks(&self) -> u64 {
        4 * self.tick_resolution as u64 * self.time_signature.numerator as u64
            / self.time_signature.denominator as u64
    }

    /// The raw tempo map, always containing an entry at tick 0.
    pub fn tempo_events(&self) -> &BTreeMap<u64, TempoEvent> {
        &self.tempo
    }

    pub fn tempo_event_for_tick(&self, tick: u64) -> TempoEvent {
        floor_tempo(&self.tempo, tick)
    }

    pub fn tempo_event_for_micros(&self, micros: u64) -> TempoEvent {
        self.tempo
            .values()
            .take_while(|t| t.micros <= micros)
            .last()
            .copied()
            .unwrap_or(TempoEvent::DEFAULT)
    }
}

fn floor_tempo(tempo: &BTreeMap<u64, TempoEvent>, tick: u64) -> TempoEvent {
    tempo
        .range(..=tick)
        .next_back()
        .map(|(_, t)| *t)
        .unwrap_or(TempoEvent::DEFAULT)
}

impl TempoCache for SequenceDataCache {
    fn tick_to_micros(&self, tick: u64) -> u64 {
        if let Division::Timecode { frames_per_second } = self.division {
            let ticks_per_second = frames_per_second as f64 * self.tick_resolution as f64;
            return (ONE_SECOND_MICROS as f64 * tick as f64 / ticks_per_second) as u64;
        }

        let t = self.tempo_event_for_tick(tick);
        t.micros + ticks_to_micros(tick - t.tick, t.tempo_mpq, self.tick_resolution)
    }

    fn micros_to_tick(&self, micros: u64) -> u64 {
        if let Division::Timecode { frames_per_second } = self.division {
            let ticks_per_second = frames_per_second as f64 * self.tick_resolution as f64;
            return (ticks_per_second * micros as f64 / ONE_SECOND_MICROS as f64) as u64;
        }

        let t = self.tempo_event_for_micros(micros);
        t.tick + micros_to_ticks(micros - t.micros, t.tempo_mpq, self.tick_resolution)
    }
}

impl BarNumberCache for SequenceDataCache {
    fn tick_to_bar_number(&self, tick: u64) -> u32 {
        (tick / self.bar_length_ticks()) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{SequenceEvent, Track};

    fn ppq(tracks: Vec<Track>) -> SequenceDataCache {
        SequenceDataCache::new(&Sequence::new(Division::Ppq, 480, tracks))
    }

    fn tempo(tick: u64, mpq: u32) -> SequenceEvent {
        SequenceEvent::new(tick, SequenceMessage::Tempo(mpq))
    }

    fn cc(tick: u64, channel: u8, controller: u8, value: u8) -> SequenceEvent {
        SequenceEvent::new(
            tick,
            SequenceMessage::ControlChange {
                channel,
                controller,
                value,
            },
        )
    }

    #[test]
    fn empty_sequence_uses_defaults() {
        let cache = ppq(vec![]);
        assert_eq!(cache.primary_tempo_mpq(), DEFAULT_TEMPO_MPQ);
        assert_eq!(cache.primary_tempo_bpm(), 120);
        assert_eq!(cache.tempo_events().len(), 1);
        assert_eq!(cache.time_signature(), TimeSignature::FOUR_FOUR);
        assert_eq!(cache.instrument(0, 0), DEFAULT_INSTRUMENT);
        assert_eq!(cache.volume(0, 0), DEFAULT_CHANNEL_VOLUME);
        assert_eq!(cache.pitch_bend_range(0, 0), 2.0);
    }

    #[test]
    fn primary_tempo_is_longest_sounding() {
        // 4 beats at 120, 2 beats at 60, 1 beat at 120 again, end at tick 480*7
        // 120 BPM: 5 beats * 0.5s = 2.5s; 60 BPM: 2 beats * 1s = 2s
        let cache = ppq(vec![vec![
            tempo(0, 500_000),
            tempo(1920, 1_000_000),
            tempo(2880, 500_000),
            SequenceEvent::new(3360, SequenceMessage::TrackName("end".into())),
        ]]);

        assert_eq!(cache.primary_tempo_mpq(), 500_000);
        assert_eq!(cache.song_length_ticks(), 3360);
        assert_eq!(cache.min_tempo_mpq(), 500_000);
        assert_eq!(cache.max_tempo_mpq(), 1_000_000);
        assert_eq!(cache.min_tempo_bpm(), 60);
        assert_eq!(cache.max_tempo_bpm(), 120);

        // Slow section dominates once it runs longer
        let cache = ppq(vec![vec![
            tempo(0, 500_000),
            tempo(960, 1_000_000),
            SequenceEvent::new(2880, SequenceMessage::TrackName("end".into())),
        ]]);
        assert_eq!(cache.primary_tempo_mpq(), 1_000_000);
    }

    #[test]
    fn primary_tempo_tie_goes_to_first_seen() {
        // 1s at 120 BPM (960 ticks) then 1s at 60 BPM (480 ticks)
        let cache = ppq(vec![vec![
            tempo(0, 500_000),
            tempo(960, 1_000_000),
            SequenceEvent::new(1440, SequenceMessage::TrackName("end".into())),
        ]]);
        assert_eq!(cache.primary_tempo_mpq(), 500_000);
    }

    #[test]
    fn trailing_time_counts_toward_primary_tempo() {
        // 1000 ticks at 120 BPM, then 5008 ticks at 60 BPM that hold no kept events
        let mut seq = Sequence::new(
            Division::Ppq,
            480,
            vec![vec![tempo(0, 500_000), tempo(1000, 1_000_000)]],
        );
        seq.length_ticks = 6008;
        let cache = SequenceDataCache::new(&seq);

        assert_eq!(cache.song_length_ticks(), 6008);
        assert_eq!(cache.primary_tempo_mpq(), 1_000_000);
    }

    #[test]
    fn tempo_map_and_micros() {
        let cache = ppq(vec![vec![tempo(0, 500_000), tempo(960, 1_000_000)]]);

        assert_eq!(cache.tempo_mpq(959), 500_000);
        assert_eq!(cache.tempo_mpq(960), 1_000_000);
        assert_eq!(cache.tempo_bpm(960), 60);

        assert_eq!(cache.tick_to_micros(960), 1_000_000);
        assert_eq!(cache.tick_to_micros(1440), 2_000_000);
        assert_eq!(cache.micros_to_tick(2_000_000), 1440);
        assert_eq!(cache.micros_to_tick(500_000), 480);
    }

    #[test]
    fn same_tick_tempo_overwrites() {
        let cache = ppq(vec![vec![tempo(0, 400_000), tempo(0, 600_000)]]);
        assert_eq!(cache.tempo_events().len(), 1);
        assert_eq!(cache.tempo_mpq(0), 600_000);
    }

    #[test]
    fn tempo_only_read_from_first_track() {
        let cache = ppq(vec![vec![], vec![tempo(0, 1_000_000)]]);
        assert_eq!(cache.tempo_mpq(0), DEFAULT_TEMPO_MPQ);
    }

    #[test]
    fn timecode_sequence_ignores_tempo() {
        let seq = Sequence::new(
            Division::Timecode {
                frames_per_second: 25.0,
            },
            40,
            vec![vec![tempo(0, 1_000_000), tempo(100, 250_000)]],
        );
        let cache = SequenceDataCache::new(&seq);

        assert_eq!(cache.tempo_events().len(), 1);
        assert_eq!(cache.primary_tempo_mpq(), DEFAULT_TEMPO_MPQ);
        // 1000 ticks per second
        assert_eq!(cache.tick_to_micros(1000), 1_000_000);
        assert_eq!(cache.micros_to_tick(500_000), 500);
    }

    #[test]
    fn channel_state_tracking() {
        let cache = ppq(vec![vec![
            SequenceEvent::new(
                0,
                SequenceMessage::ProgramChange {
                    channel: 1,
                    program: 40,
                },
            ),
            SequenceEvent::new(
                0,
                SequenceMessage::ProgramChange {
                    channel: DRUM_CHANNEL,
                    program: 5,
                },
            ),
            cc(100, 1, CHANNEL_VOLUME_CONTROLLER_COARSE, 64),
            // Data entry before selecting the RPN is ignored
            cc(150, 1, DATA_ENTRY_COARSE, 7),
            cc(200, 1, REGISTERED_PARAMETER_NUMBER_MSB, 0),
            cc(200, 1, REGISTERED_PARAMETER_NUMBER_LSB, 0),
            cc(210, 1, DATA_ENTRY_COARSE, 12),
            cc(210, 1, DATA_ENTRY_FINE, 50),
            // Selecting another RPN stops pitch-bend updates
            cc(300, 1, REGISTERED_PARAMETER_NUMBER_LSB, 1),
            cc(310, 1, DATA_ENTRY_COARSE, 3),
        ]]);

        assert_eq!(cache.instrument(1, 0), 40);
        assert_eq!(cache.instrument(DRUM_CHANNEL, 0), DEFAULT_INSTRUMENT);
        assert_eq!(cache.volume(1, 99), DEFAULT_CHANNEL_VOLUME);
        assert_eq!(cache.volume(1, 100), 64);
        assert_eq!(cache.pitch_bend_range(1, 150), 2.0);
        assert_eq!(cache.pitch_bend_range(1, 210), 12.5);
        assert_eq!(cache.pitch_bend_range(1, 400), 12.5);
    }

    #[test]
    fn time_signature_and_bars() {
        let cache = ppq(vec![vec![
            SequenceEvent::new(
                0,
                SequenceMessage::TimeSignature {
                    numerator: 3,
                    denominator_pow: 2,
                },
            ),
            SequenceEvent::new(
                960,
                SequenceMessage::TimeSignature {
                    numerator: 6,
                    denominator_pow: 3,
                },
            ),
        ]]);

        assert_eq!(cache.time_signature(), TimeSignature::new(3, 4).unwrap());
        assert_eq!(cache.bar_length_ticks(), 1440);
        assert_eq!(cache.tick_to_bar_number(1439), 0);
        assert_eq!(cache.tick_to_bar_number(1440), 1);
    }
}
