use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tempo::TempoCache;

/// A pitch, or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Note {
    /// Sorts before every pitch.
    Rest,
    Midi(u8),
}

impl Note {
    /// MIDI note number, or -1 for a rest.
    pub fn id(self) -> i32 {
        match self {
            Note::Rest => -1,
            Note::Midi(key) => key as i32,
        }
    }

    pub fn is_rest(self) -> bool {
        matches!(self, Note::Rest)
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Note::Rest => f.write_str("z"),
            Note::Midi(key) => write!(f, "{key}"),
        }
    }
}

/// A note (or rest) placed in time.
///
/// Notes split across a bar line or tempo change become a chain of events;
/// every event after the first points back at its predecessor through
/// `ties_from`.
#[derive(Debug, Clone)]
pub struct NoteEvent {
    pub note: Note,
    pub velocity: u8,
    pub start_tick: u64,
    pub end_tick: u64,
    pub ties_from: Option<Arc<NoteEvent>>,
}

impl NoteEvent {
    pub fn new(note: Note, velocity: u8, start_tick: u64, end_tick: u64) -> Self {
        NoteEvent {
            note,
            velocity,
            start_tick,
            end_tick,
            ties_from: None,
        }
    }

    pub fn rest(start_tick: u64, end_tick: u64) -> Self {
        NoteEvent::new(Note::Rest, 0, start_tick, end_tick)
    }

    pub fn length_ticks(&self) -> u64 {
        self.end_tick.saturating_sub(self.start_tick)
    }

    pub fn set_length_ticks(&mut self, length_ticks: u64) {
        self.end_tick = self.start_tick + length_ticks;
    }

    pub fn start_micros(&self, tempo: &impl TempoCache) -> u64 {
        tempo.tick_to_micros(self.start_tick)
    }

    pub fn end_micros(&self, tempo: &impl TempoCache) -> u64 {
        tempo.tick_to_micros(self.end_tick)
    }

    pub fn length_micros(&self, tempo: &impl TempoCache) -> u64 {
        self.end_micros(tempo).saturating_sub(self.start_micros(tempo))
    }

    pub fn is_rest(&self) -> bool {
        self.note.is_rest()
    }

    /// Whether this event continues a note that started earlier.
    pub fn is_tie_continuation(&self) -> bool {
        self.ties_from.is_some()
    }

    /// The first event of this event's tie chain.
    pub fn tie_start(&self) -> &NoteEvent {
        let mut event = self;
        while let Some(prev) = &event.ties_from {
            debug_assert!(prev.start_tick < event.start_tick);
            event = prev;
        }
        event
    }

    /// Split at `split_tick` into a head ending there and a tail tied to the
    /// head. Rests are split without a tie.
    pub fn split_with_tie_at_tick(&self, split_tick: u64) -> (Arc<NoteEvent>, NoteEvent) {
        debug_assert!(split_tick > self.start_tick && split_tick < self.end_tick);

        let head = Arc::new(NoteEvent {
            end_tick: split_tick,
            ..self.clone()
        });
        let tail = NoteEvent {
            note: self.note,
            velocity: self.velocity,
            start_tick: split_tick,
            end_tick: self.end_tick,
            ties_from: (!self.is_rest()).then(|| Arc::clone(&head)),
        };
        (head, tail)
    }
}

impl PartialEq for NoteEvent {
    fn eq(&self, other: &Self) -> bool {
        self.start_tick == other.start_tick
            && self.end_tick == other.end_tick
            && self.note == other.note
    }
}

impl Eq for NoteEvent {}

impl Ord for NoteEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_tick
            .cmp(&other.start_tick)
            .then(self.note.cmp(&other.note))
            .then(self.end_tick.cmp(&other.end_tick))
    }
}

impl PartialOrd for NoteEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Linear;

    // One tick per millisecond
    impl TempoCache for Linear {
        fn tick_to_micros(&self, tick: u64) -> u64 {
            tick * 1000
        }
        fn micros_to_tick(&self, micros: u64) -> u64 {
            micros / 1000
        }
    }

    #[test]
    fn lengths() {
        let mut e = NoteEvent::new(Note::Midi(60), 90, 100, 340);
        assert_eq!(e.length_ticks(), 240);
        assert_eq!(e.start_micros(&Linear), 100_000);
        assert_eq!(e.length_micros(&Linear), 240_000);

        e.set_length_ticks(60);
        assert_eq!(e.end_tick, 160);
    }

    #[test]
    fn ordering_by_start_then_note() {
        let mut events = vec![
            NoteEvent::new(Note::Midi(64), 90, 0, 10),
            NoteEvent::rest(0, 10),
            NoteEvent::new(Note::Midi(60), 90, 5, 10),
            NoteEvent::new(Note::Midi(60), 90, 0, 10),
        ];
        events.sort();

        let order: Vec<(u64, Note)> = events.iter().map(|e| (e.start_tick, e.note)).collect();
        assert_eq!(
            order,
            vec![
                (0, Note::Rest),
                (0, Note::Midi(60)),
                (0, Note::Midi(64)),
                (5, Note::Midi(60)),
            ]
        );
    }

    #[test]
    fn split_builds_tie_chain() {
        let note = NoteEvent::new(Note::Midi(67), 100, 0, 300);
        let (head, tail) = note.split_with_tie_at_tick(120);
        let (middle, last) = tail.split_with_tie_at_tick(240);

        assert_eq!(head.end_tick, 120);
        assert!(!head.is_tie_continuation());
        assert!(last.is_tie_continuation());
        assert_eq!((last.start_tick, last.end_tick), (240, 300));
        assert_eq!(middle.tie_start(), &*head);
        assert_eq!(last.tie_start(), &*head);
    }

    #[test]
    fn rests_split_without_tie() {
        let (_, tail) = NoteEvent::rest(0, 100).split_with_tie_at_tick(50);
        assert!(!tail.is_tie_continuation());
        assert_eq!(Note::Rest.id(), -1);
        assert_eq!(Note::Rest.to_string(), "z");
    }
}
