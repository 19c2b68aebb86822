//! Standard MIDI File reader/writer (formats 0, 1 and 2).
//!
//! The reader accepts running status and length-prefixed SysEx/meta events;
//! the writer always emits canonical full-status form. Parse → write → parse
//! is identity on the in-memory model.

pub mod file;
mod reader;
pub mod vlq;
mod writer;

pub use file::{
    Division, Format, Header, MidiFile, TempoMap, Track, TrackEvent, DEFAULT_US_PER_QUARTER,
    META_END_OF_TRACK, META_SET_TEMPO,
};
