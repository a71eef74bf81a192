//! Per-track note extraction.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::warn;

use crate::channel_map::CHANNEL_COUNT;
use crate::data_cache::{SequenceDataCache, DEFAULT_CHANNEL_VOLUME, DRUM_CHANNEL};
use crate::note::{Note, NoteEvent};
use crate::sequence::{Sequence, SequenceMessage, Track};

/// Track names that sequencers write by default.
const PLACEHOLDER_NAMES: [&str; 2] = ["untitled", "WinJammer Demo"];

/// The notes of one track plus what is known about how they were played.
#[derive(Debug, Clone, Serialize)]
pub struct TrackInfo {
    pub track_number: usize,
    pub name: Option<String>,
    pub is_drum_track: bool,
    pub channels: BTreeSet<u8>,
    /// Programs sounding when notes started. Empty for drum tracks.
    pub instruments: BTreeSet<u8>,
    pub notes_in_use: BTreeSet<u8>,
    pub min_velocity: u8,
    pub max_velocity: u8,
    #[serde(skip)]
    pub events: Vec<NoteEvent>,
}

impl TrackInfo {
    /// Extract every track of `sequence`.
    pub fn from_sequence(sequence: &Sequence, cache: &SequenceDataCache) -> Vec<TrackInfo> {
        sequence
            .tracks
            .iter()
            .enumerate()
            .map(|(i, track)| TrackInfo::new(track, i, cache))
            .collect()
    }

    pub fn new(track: &Track, track_number: usize, cache: &SequenceDataCache) -> Self {
        let mut name = None;
        let mut is_drum_track = None;
        let mut channels = BTreeSet::new();
        let mut instruments = BTreeSet::new();

        // Slots, so that a retriggered note can be dropped in place
        let mut events: Vec<Option<NoteEvent>> = Vec::new();
        let mut sounding: [Vec<usize>; CHANNEL_COUNT] = std::array::from_fn(|_| Vec::new());
        let mut retriggered = 0usize;

        for event in track {
            let tick = event.tick;
            match &event.message {
                SequenceMessage::TrackName(text) if name.is_none() => {
                    let text = text.trim();
                    if !text.is_empty()
                        && !PLACEHOLDER_NAMES.iter().any(|p| text.eq_ignore_ascii_case(p))
                    {
                        name = Some(text.to_string());
                    }
                }
                &SequenceMessage::NoteOn {
                    channel,
                    key,
                    velocity,
                } if velocity > 0 => {
                    channels.insert(channel);
                    let drums = channel == DRUM_CHANNEL;
                    match is_drum_track {
                        None => is_drum_track = Some(drums),
                        Some(d) if d != drums => {
                            warn!(track_number, channel, "track contains both notes and drums");
                        }
                        _ => {}
                    }

                    let velocity = scale_velocity(velocity, cache.volume(channel, tick));
                    let on = &mut sounding[channel as usize];
                    if let Some(pos) = on
                        .iter()
                        .position(|&i| events[i].as_ref().is_some_and(|e| e.note == Note::Midi(key)))
                    {
                        events[on.remove(pos)] = None;
                        retriggered += 1;
                    }

                    if !drums {
                        instruments.insert(cache.instrument(channel, tick));
                    }
                    on.push(events.len());
                    events.push(Some(NoteEvent::new(Note::Midi(key), velocity, tick, tick)));
                }
                &SequenceMessage::NoteOn { channel, key, .. }
                | &SequenceMessage::NoteOff { channel, key, .. } => {
                    let on = &mut sounding[channel as usize];
                    if let Some(pos) = on
                        .iter()
                        .position(|&i| events[i].as_ref().is_some_and(|e| e.note == Note::Midi(key)))
                    {
                        if let Some(ne) = events[on.remove(pos)].as_mut() {
                            ne.end_tick = tick;
                        }
                    }
                }
                _ => {}
            }
        }

        // Close anything still sounding at the track's last tick
        let track_end = track.last().map(|e| e.tick).unwrap_or(0);
        let unclosed: usize = sounding.iter().map(Vec::len).sum();
        if unclosed + retriggered > 0 {
            warn!(
                track_number,
                unclosed, retriggered, "notes not turned off before the end of the track"
            );
        }
        for i in sounding.iter().flatten() {
            if let Some(ne) = events[*i].as_mut() {
                ne.end_tick = track_end;
            }
        }

        let mut events: Vec<NoteEvent> = events.into_iter().flatten().collect();
        events.sort();

        let notes_in_use = events
            .iter()
            .filter_map(|e| match e.note {
                Note::Midi(key) => Some(key),
                Note::Rest => None,
            })
            .collect();
        let min_velocity = events.iter().map(|e| e.velocity).min().unwrap_or(0);
        let max_velocity = events.iter().map(|e| e.velocity).max().unwrap_or(127);

        TrackInfo {
            track_number,
            name,
            is_drum_track: is_drum_track.unwrap_or(false),
            channels,
            instruments,
            notes_in_use,
            min_velocity,
            max_velocity,
            events,
        }
    }

    pub fn has_notes(&self) -> bool {
        !self.events.is_empty()
    }
}

/// Fold channel volume into note velocity.
fn scale_velocity(velocity: u8, channel_volume: u8) -> u8 {
    (velocity as u32 * channel_volume as u32 / DEFAULT_CHANNEL_VOLUME as u32).min(127) as u8
}
