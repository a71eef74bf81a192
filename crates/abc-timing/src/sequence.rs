//! Raw MIDI sequences as the timing engine consumes them.
//!
//! A [`Sequence`] is a list of tracks, each an ordered list of events at
//! absolute ticks. It can be built by hand or parsed from Standard MIDI File
//! bytes with [`Sequence::parse`].

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use serde::{Deserialize, Serialize};

/// How ticks relate to wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Division {
    /// Ticks per quarter note; tempo events set the quarter-note duration.
    Ppq,
    /// Ticks per SMPTE frame; tempo events have no meaning.
    Timecode { frames_per_second: f32 },
}

/// The subset of MIDI messages the timing engine cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceMessage {
    ProgramChange { channel: u8, program: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    NoteOn { channel: u8, key: u8, velocity: u8 },
    NoteOff { channel: u8, key: u8, velocity: u8 },
    /// Set-tempo meta event, microseconds per quarter note.
    Tempo(u32),
    /// Time-signature meta event; the denominator is a power of two.
    TimeSignature { numerator: u8, denominator_pow: u8 },
    TrackName(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceEvent {
    pub tick: u64,
    pub message: SequenceMessage,
}

impl SequenceEvent {
    pub fn new(tick: u64, message: SequenceMessage) -> Self {
        SequenceEvent { tick, message }
    }
}

pub type Track = Vec<SequenceEvent>;

/// A complete MIDI sequence: timing division plus tracks in file order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub division: Division,
    /// Ticks per quarter note for [`Division::Ppq`], ticks per frame otherwise.
    pub resolution: u32,
    pub tracks: Vec<Track>,
    /// Tick of the last event in any track, counting events that aren't
    /// kept (end of track, sysex, pitch bend and so on).
    #[serde(default)]
    pub length_ticks: u64,
}

impl Sequence {
    pub fn new(division: Division, resolution: u32, tracks: Vec<Track>) -> Self {
        let length_ticks = last_event_tick(&tracks);
        Sequence {
            division,
            resolution,
            tracks,
            length_ticks,
        }
    }

    /// Parse Standard MIDI File bytes.
    pub fn parse(midi_bytes: &[u8]) -> crate::Result<Self> {
        let smf = Smf::parse(midi_bytes).map_err(|e| crate::Error::MidiParse(e.to_string()))?;
        Ok(Self::from_smf(&smf))
    }

    /// Convert a parsed SMF, accumulating delta times into absolute ticks.
    pub fn from_smf(smf: &Smf) -> Self {
        let (division, resolution) = match smf.header.timing {
            Timing::Metrical(ticks) => (Division::Ppq, ticks.as_int() as u32),
            Timing::Timecode(fps, subframes) => (
                Division::Timecode {
                    frames_per_second: fps.as_f32(),
                },
                subframes as u32,
            ),
        };

        let mut length_ticks = 0u64;
        let tracks: Vec<Vec<SequenceEvent>> = smf
            .tracks
            .iter()
            .map(|track| {
                let mut current_tick: u64 = 0;
                let mut events = Vec::new();

                for event in track {
                    current_tick += event.delta.as_int() as u64;
                    length_ticks = length_ticks.max(current_tick);

                    let message = match event.kind {
                        TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => {
                            Some(SequenceMessage::Tempo(tempo.as_int()))
                        }
                        TrackEventKind::Meta(MetaMessage::TimeSignature(num, denom_pow, _, _)) => {
                            Some(SequenceMessage::TimeSignature {
                                numerator: num,
                                denominator_pow: denom_pow,
                            })
                        }
                        TrackEventKind::Meta(MetaMessage::TrackName(bytes)) => Some(
                            SequenceMessage::TrackName(String::from_utf8_lossy(bytes).into_owned()),
                        ),
                        TrackEventKind::Midi { channel, message } => {
                            let channel = channel.as_int();
                            match message {
                                MidiMessage::ProgramChange { program } => {
                                    Some(SequenceMessage::ProgramChange {
                                        channel,
                                        program: program.as_int(),
                                    })
                                }
                                MidiMessage::Controller { controller, value } => {
                                    Some(SequenceMessage::ControlChange {
                                        channel,
                                        controller: controller.as_int(),
                                        value: value.as_int(),
                                    })
                                }
                                MidiMessage::NoteOn { key, vel } => Some(SequenceMessage::NoteOn {
                                    channel,
                                    key: key.as_int(),
                                    velocity: vel.as_int(),
                                }),
                                MidiMessage::NoteOff { key, vel } => {
                                    Some(SequenceMessage::NoteOff {
                                        channel,
                                        key: key.as_int(),
                                        velocity: vel.as_int(),
                                    })
                                }
                                _ => None,
                            }
                        }
                        _ => None,
                    };

                    if let Some(message) = message {
                        events.push(SequenceEvent::new(current_tick, message));
                    }
                }

                events
            })
            .collect();

        Sequence {
            division,
            resolution,
            length_ticks: length_ticks.max(last_event_tick(&tracks)),
            tracks,
        }
    }

    /// Where the song ends: the later of [`Sequence::length_ticks`] and the
    /// last kept event.
    pub fn last_tick(&self) -> u64 {
        self.length_ticks.max(last_event_tick(&self.tracks))
    }
}

fn last_event_tick(tracks: &[Track]) -> u64 {
    tracks
        .iter()
        .filter_map(|t| t.last())
        .map(|e| e.tick)
        .max()
        .unwrap_or(0)
}
