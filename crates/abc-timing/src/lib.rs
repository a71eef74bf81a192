//! Timing for MIDI to ABC export.
//!
//! A performed MIDI sequence is scanned once into a [`SequenceDataCache`]
//! (channel state and the raw tempo map). [`QuantizedTimingInfo`] then snaps
//! that tempo map onto a grid of note lengths ABC can write and players can
//! reproduce, and [`build_chords`] groups the quantized notes into chords.
//!
//! ```no_run
//! use abc_timing::{build_chords, ExportSettings, QuantizedTimingInfo, Sequence,
//!     SequenceDataCache, TrackInfo};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bytes = std::fs::read("song.mid")?;
//! let sequence = Sequence::parse(&bytes)?;
//! let cache = SequenceDataCache::new(&sequence);
//! let timing = QuantizedTimingInfo::new(&cache, &ExportSettings::for_sequence(&cache))?;
//!
//! for track in TrackInfo::from_sequence(&sequence, &cache) {
//!     let chords = build_chords(track.events, &timing);
//!     println!("{} chords", chords.len());
//! }
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

pub mod channel_map;
pub mod chord;
pub mod config;
pub mod data_cache;
pub mod dynamics;
pub mod meter;
pub mod note;
pub mod quantized;
pub mod sequence;
pub mod tempo;
pub mod timing;
pub mod track;

pub use channel_map::ChannelStateMap;
pub use chord::{build_chords, Chord, MAX_CHORD_NOTES};
pub use config::{ConfigSources, ExportSettings};
pub use data_cache::{SequenceDataCache, TempoEvent};
pub use dynamics::Dynamics;
pub use meter::TimeSignature;
pub use note::{Note, NoteEvent};
pub use quantized::{QuantizedTimingInfo, TimingRegion};
pub use sequence::{Division, Sequence, SequenceEvent, SequenceMessage, Track};
pub use tempo::{BarNumberCache, TempoCache};
pub use timing::{GridCache, TimingInfo, MAX_TEMPO, MIN_TEMPO};
pub use track::TrackInfo;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("MIDI parse error: {0}")]
    MidiParse(String),

    /// The sequence can't be laid onto an ABC timing grid.
    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("invalid time signature: {0}")]
    TimeSignature(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {message}", config_source(.path))]
    ConfigParse {
        path: Option<PathBuf>,
        message: String,
    },

    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn config_source(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "<string>".to_string(),
    }
}
