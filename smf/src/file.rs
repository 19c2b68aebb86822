use midi_hub_core::{HubError, HubResult, MidiMessage};

/// Meta type byte for Set Tempo (`FF 51 03 tttttt`).
pub const META_SET_TEMPO: u8 = 0x51;
/// Meta type byte for End of Track (`FF 2F 00`).
pub const META_END_OF_TRACK: u8 = 0x2F;

/// Default tempo when a file carries no Set Tempo meta: 120 BPM.
pub const DEFAULT_US_PER_QUARTER: u32 = 500_000;

/// SMF header chunk format word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Format 0: a single multi-channel track.
    Single,
    /// Format 1: simultaneous tracks of one sequence.
    Multi,
    /// Format 2: sequentially independent single-track patterns.
    Sequential,
}

impl Format {
    pub fn from_u16(value: u16) -> HubResult<Self> {
        match value {
            0 => Ok(Format::Single),
            1 => Ok(Format::Multi),
            2 => Ok(Format::Sequential),
            other => Err(HubError::UnsupportedFormat(format!("SMF format {other}"))),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Format::Single => 0,
            Format::Multi => 1,
            Format::Sequential => 2,
        }
    }
}

const DIVISION_SMPTE_BIT: u16 = 0x8000;

/// Meaning of delta-time ticks: metrical (ticks per quarter note) or
/// SMPTE time code (frames per second and sub-frame resolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Division {
    TicksPerQuarter(u16),
    Smpte { frames_per_second: u8, resolution: u8 },
}

impl Division {
    pub fn from_u16(value: u16) -> HubResult<Self> {
        if value & DIVISION_SMPTE_BIT != 0 {
            let fps = (-((value >> 8) as u8 as i8)) as u8;
            match fps {
                24 | 25 | 29 | 30 => Ok(Division::Smpte {
                    frames_per_second: fps,
                    resolution: (value & 0xFF) as u8,
                }),
                other => Err(HubError::UnsupportedFormat(format!(
                    "SMPTE frame rate {other}"
                ))),
            }
        } else {
            Ok(Division::TicksPerQuarter(value))
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Division::TicksPerQuarter(tpq) => tpq & !DIVISION_SMPTE_BIT,
            Division::Smpte {
                frames_per_second,
                resolution,
            } => {
                let fps = (-(frames_per_second as i8)) as u8;
                ((fps as u16) << 8) | resolution as u16
            }
        }
    }

    pub fn ticks_per_quarter(self) -> Option<u16> {
        match self {
            Division::TicksPerQuarter(tpq) => Some(tpq),
            Division::Smpte { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub format: Format,
    pub division: Division,
}

/// One track event: delta ticks since the previous event plus the message.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackEvent {
    pub delta: u32,
    pub message: MidiMessage,
}

/// An ordered list of track events plus a cached absolute-tick index,
/// computed once at construction so playback and seeking never re-walk the
/// delta chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    events: Vec<TrackEvent>,
    absolute: Vec<u64>,
}

impl Track {
    pub fn new(events: Vec<TrackEvent>) -> Self {
        let mut absolute = Vec::with_capacity(events.len());
        let mut tick = 0u64;
        for ev in &events {
            tick += ev.delta as u64;
            absolute.push(tick);
        }
        Self { events, absolute }
    }

    pub fn events(&self) -> &[TrackEvent] {
        &self.events
    }

    /// Absolute tick of each event, parallel to `events()`.
    pub fn absolute_ticks(&self) -> &[u64] {
        &self.absolute
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn end_tick(&self) -> u64 {
        self.absolute.last().copied().unwrap_or(0)
    }

    /// True when the final event is End of Track, as the format requires.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self.events.last(),
            Some(TrackEvent {
                message: MidiMessage::Meta {
                    meta_type: META_END_OF_TRACK,
                    ..
                },
                ..
            })
        )
    }
}

/// Tempo map: sorted `(tick, microseconds per quarter)` pairs collected from
/// Set Tempo metas across all tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempoMap {
    entries: Vec<(u64, u32)>,
}

impl Default for TempoMap {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl TempoMap {
    pub fn new(mut entries: Vec<(u64, u32)>) -> Self {
        entries.sort_by_key(|&(tick, _)| tick);
        // Equal ticks: the later entry wins.
        entries.dedup_by(|next, prev| {
            if next.0 == prev.0 {
                prev.1 = next.1;
                true
            } else {
                false
            }
        });
        Self { entries }
    }

    pub fn entries(&self) -> &[(u64, u32)] {
        &self.entries
    }

    /// Tempo in effect at `tick` (the latest entry at or before it).
    pub fn us_per_quarter_at(&self, tick: u64) -> u32 {
        match self.entries.partition_point(|&(t, _)| t <= tick) {
            0 => DEFAULT_US_PER_QUARTER,
            n => self.entries[n - 1].1,
        }
    }
}

/// An in-memory Standard MIDI File.
#[derive(Debug, Clone, PartialEq)]
pub struct MidiFile {
    pub header: Header,
    pub tracks: Vec<Track>,
}

impl MidiFile {
    pub fn ticks_per_quarter(&self) -> Option<u16> {
        self.header.division.ticks_per_quarter()
    }

    /// Collect the tempo map from Set Tempo metas in every track.
    pub fn tempo_map(&self) -> TempoMap {
        let mut entries = Vec::new();
        for track in &self.tracks {
            for (ev, &tick) in track.events().iter().zip(track.absolute_ticks()) {
                if let MidiMessage::Meta { meta_type, data } = &ev.message {
                    if *meta_type == META_SET_TEMPO && data.len() == 3 {
                        let uspq =
                            ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32;
                        entries.push((tick, uspq));
                    }
                }
            }
        }
        TempoMap::new(entries)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> HubResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    pub fn save(&self, path: impl AsRef<std::path::Path>) -> HubResult<()> {
        std::fs::write(path, self.write())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tempo_map_lookup() {
        let map = TempoMap::new(vec![(480, 400_000), (0, 500_000), (960, 300_000)]);
        assert_eq!(map.us_per_quarter_at(0), 500_000);
        assert_eq!(map.us_per_quarter_at(479), 500_000);
        assert_eq!(map.us_per_quarter_at(480), 400_000);
        assert_eq!(map.us_per_quarter_at(10_000), 300_000);
    }

    #[test]
    fn empty_tempo_map_defaults_to_120_bpm() {
        let map = TempoMap::default();
        assert_eq!(map.us_per_quarter_at(0), DEFAULT_US_PER_QUARTER);
    }

    #[test]
    fn absolute_index_accumulates_deltas() {
        let track = Track::new(vec![
            TrackEvent {
                delta: 10,
                message: MidiMessage::Meta {
                    meta_type: 0x01,
                    data: b"a".to_vec(),
                },
            },
            TrackEvent {
                delta: 20,
                message: MidiMessage::Meta {
                    meta_type: META_END_OF_TRACK,
                    data: Vec::new(),
                },
            },
        ]);
        assert_eq!(track.absolute_ticks(), &[10, 30]);
        assert_eq!(track.end_tick(), 30);
        assert!(track.is_terminated());
    }

    #[test]
    fn smpte_division_round_trip() {
        let div = Division::from_u16(0xE728).unwrap();
        assert_eq!(
            div,
            Division::Smpte {
                frames_per_second: 25,
                resolution: 0x28
            }
        );
        assert_eq!(Division::from_u16(div.to_u16()).unwrap(), div);
    }
}
