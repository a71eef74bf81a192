//! Grouping of simultaneous notes into chords.

use std::sync::Arc;

use tracing::debug;

use crate::dynamics::Dynamics;
use crate::note::NoteEvent;
use crate::quantized::QuantizedTimingInfo;
use crate::tempo::{BarNumberCache, TempoCache};

/// Most notes a player can sound at once.
pub const MAX_CHORD_NOTES: usize = 6;

/// Notes that start together.
///
/// A chord ends when its *shortest* member ends. Once built, a chord is only
/// read, and can be shared across threads.
#[derive(Debug, Clone)]
pub struct Chord {
    notes: Vec<Arc<NoteEvent>>,
    start_tick: u64,
    end_tick: u64,
    too_many_notes: bool,
}

impl Chord {
    pub fn new(first: Arc<NoteEvent>) -> Self {
        Chord {
            start_tick: first.start_tick,
            end_tick: first.end_tick,
            notes: vec![first],
            too_many_notes: false,
        }
    }

    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }

    pub fn end_tick(&self) -> u64 {
        self.end_tick
    }

    pub fn start_micros(&self, tempo: &impl TempoCache) -> u64 {
        tempo.tick_to_micros(self.start_tick)
    }

    pub fn end_micros(&self, tempo: &impl TempoCache) -> u64 {
        tempo.tick_to_micros(self.end_tick)
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Arc<NoteEvent>> {
        self.notes.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<NoteEvent>> {
        self.notes.iter()
    }

    /// Set once a note had to be dropped or was rejected for being empty.
    pub fn has_too_many_notes(&self) -> bool {
        self.too_many_notes
    }

    /// Add a note. Returns false, leaving the chord unchanged, when the chord
    /// is full or the note has zero length.
    pub fn add(&mut self, note: Arc<NoteEvent>) -> bool {
        if note.length_ticks() == 0 {
            self.too_many_notes = true;
            return false;
        }
        if self.notes.len() >= MAX_CHORD_NOTES {
            return false;
        }

        self.end_tick = self.end_tick.min(note.end_tick);
        self.notes.push(note);
        true
    }

    /// Add a note, evicting the most recently added members to make room.
    pub fn force_add(&mut self, note: Arc<NoteEvent>) -> bool {
        while self.notes.len() >= MAX_CHORD_NOTES {
            self.remove(self.notes.len() - 1);
            self.too_many_notes = true;
        }
        self.add(note)
    }

    /// Remove the note at `i`. A chord never drops its last note; that call
    /// returns `None`.
    pub fn remove(&mut self, i: usize) -> Option<Arc<NoteEvent>> {
        if self.notes.len() <= 1 || i >= self.notes.len() {
            return None;
        }

        let removed = self.notes.remove(i);
        if removed.end_tick == self.end_tick {
            self.recalc_end_tick();
        }
        Some(removed)
    }

    pub fn remove_note(&mut self, note: &NoteEvent) -> bool {
        match self.notes.iter().position(|n| **n == *note) {
            Some(i) => self.remove(i).is_some(),
            None => false,
        }
    }

    pub fn recalc_end_tick(&mut self) {
        if let Some(end) = self.notes.iter().map(|n| n.end_tick).min() {
            self.end_tick = end;
        }
    }

    pub fn sort(&mut self) {
        self.notes.sort();
    }

    /// Marking for the loudest member that starts here. Rests and tied
    /// continuations don't count; `None` if nothing is left.
    pub fn calc_dynamics(&self) -> Option<Dynamics> {
        self.notes
            .iter()
            .filter(|n| !n.is_rest() && !n.is_tie_continuation())
            .map(|n| n.velocity)
            .max()
            .map(|velocity| Dynamics::from_midi_velocity(velocity as i32))
    }
}

/// Quantize note events and group them into a sequence of chords that play
/// back to back.
///
/// Overlapping notes that start at different times are not tied. Instead a
/// chord that would sound past the start of the next one gets a rest member
/// that ends there, and gaps between chords become rest chords. Nothing lasts
/// longer than the region's `max_note_length_ticks`.
pub fn build_chords(events: Vec<NoteEvent>, timing: &QuantizedTimingInfo) -> Vec<Chord> {
    let mut events: Vec<NoteEvent> = events
        .into_iter()
        .filter_map(|mut ne| {
            ne.start_tick = timing.quantize(ne.start_tick);
            ne.end_tick = timing.quantize(ne.end_tick);

            if ne.end_tick <= ne.start_tick {
                if ne.is_rest() {
                    return None;
                }
                let grid = timing.timing_info(ne.start_tick).min_note_length_ticks;
                ne.set_length_ticks(grid);
            }
            Some(ne)
        })
        .collect();
    events.sort();
    remove_duplicate_notes(&mut events);
    break_long_notes(&mut events, timing);

    let mut events = events.into_iter().map(Arc::new);
    let Some(first) = events.next() else {
        return Vec::new();
    };

    let rest_velocity = Dynamics::DEFAULT.midi_volume() as u8;
    let mut chords = Vec::new();
    let mut current = Chord::new(first);

    for ne in events {
        if ne.start_tick == current.start_tick() {
            let (tick, note) = (ne.start_tick, ne.note);
            if !current.add(ne) {
                debug!(tick, %note, "dropping note from full chord");
            }
            continue;
        }

        let next = Chord::new(ne);

        // The next chord starts when the shortest member of this one ends, so
        // a chord that runs too long gets a rest that ends on time.
        if current.end_tick() > next.start_tick() {
            let mut rest = NoteEvent::rest(current.start_tick(), next.start_tick());
            rest.velocity = rest_velocity;
            let tick = current.start_tick();
            if current.len() >= MAX_CHORD_NOTES {
                debug!(tick, "evicting a note to end a full chord on time");
            }
            current.force_add(Arc::new(rest));
        }

        let mut gap = Vec::new();
        if current.end_tick() < next.start_tick() {
            let mut rest = NoteEvent::rest(current.end_tick(), next.start_tick());
            rest.velocity = rest_velocity;
            gap.push(rest);
            break_long_notes(&mut gap, timing);
        }

        chords.push(std::mem::replace(&mut current, next));
        chords.extend(gap.into_iter().map(|rest| Chord::new(Arc::new(rest))));
    }
    chords.push(current);

    chords
}

/// Cap every event at the longest note a player can hold. When the event runs
/// across at least one whole bar, the cut moves back to a bar line. Notes are
/// cut short; a rest carries on with another rest from the cut.
///
/// `events` must be sorted and stays sorted.
fn break_long_notes(events: &mut Vec<NoteEvent>, timing: &QuantizedTimingInfo) {
    let mut i = 0;
    while i < events.len() {
        let (start, end) = (events[i].start_tick, events[i].end_tick);
        let mut cut = start + timing.timing_info(start).max_note_length_ticks;

        if end > cut {
            let bar_start = timing.tick_to_bar_start_tick(cut);
            if timing.tick_to_bar_end_tick(start) < bar_start {
                cut = bar_start;
            }

            if events[i].is_rest() {
                let mut rest = NoteEvent::rest(cut, end);
                rest.velocity = events[i].velocity;
                let at = events.partition_point(|e| *e < rest);
                events.insert(at, rest);
            } else {
                let note = events[i].note;
                debug!(
                    tick = start,
                    %note,
                    bar = timing.tick_to_bar_number(start),
                    "cutting note longer than a player can hold"
                );
            }
            events[i].end_tick = cut;
        }
        i += 1;
    }
}

/// Merge repeated notes of the same pitch. Two that start together become one
/// with the longer length; a later one cuts the earlier one off and lasts at
/// least as long as it would have.
fn remove_duplicate_notes(events: &mut Vec<NoteEvent>) {
    let mut keep = vec![true; events.len()];
    let mut sounding: Vec<usize> = Vec::new();

    for i in 0..events.len() {
        let mut duplicate = false;
        let mut j = 0;
        while j < sounding.len() {
            let on = sounding[j];
            if events[on].end_tick < events[i].start_tick {
                sounding.remove(j);
                continue;
            }
            if events[on].note != events[i].note {
                j += 1;
                continue;
            }

            if events[on].start_tick == events[i].start_tick {
                events[on].end_tick = events[on].end_tick.max(events[i].end_tick);
                keep[i] = false;
                duplicate = true;
                break;
            }

            events[i].end_tick = events[i].end_tick.max(events[on].end_tick);
            events[on].end_tick = events[i].start_tick;
            sounding.remove(j);
        }

        if !duplicate {
            sounding.push(i);
        }
    }

    let mut keep = keep.into_iter();
    events.retain(|_| keep.next().unwrap_or(true));
}
