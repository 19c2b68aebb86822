use midi_hub_core::{Channel, MidiMessage};
use smf::{Division, Format, Header, MidiFile, Track, TrackEvent, META_END_OF_TRACK, META_SET_TEMPO};

fn ch(n: u8) -> Channel {
    Channel::new(n).unwrap()
}

fn end_of_track() -> TrackEvent {
    TrackEvent {
        delta: 0,
        message: MidiMessage::Meta {
            meta_type: META_END_OF_TRACK,
            data: Vec::new(),
        },
    }
}

fn tempo(delta: u32, us_per_quarter: u32) -> TrackEvent {
    TrackEvent {
        delta,
        message: MidiMessage::Meta {
            meta_type: META_SET_TEMPO,
            data: vec![
                (us_per_quarter >> 16) as u8,
                (us_per_quarter >> 8) as u8,
                us_per_quarter as u8,
            ],
        },
    }
}

fn note_pair(delta: u32, channel: u8, note: u8, velocity: u8, length: u32) -> Vec<TrackEvent> {
    vec![
        TrackEvent {
            delta,
            message: MidiMessage::NoteOn {
                channel: ch(channel),
                note,
                velocity,
            },
        },
        TrackEvent {
            delta: length,
            message: MidiMessage::NoteOff {
                channel: ch(channel),
                note,
                velocity: 0,
            },
        },
    ]
}

fn format1_fixture() -> MidiFile {
    // Conductor track with a two-entry tempo map, plus two note tracks.
    let mut conductor = vec![tempo(0, 500_000), tempo(960, 400_000)];
    conductor.push(end_of_track());

    let mut melody = note_pair(0, 1, 60, 100, 480);
    melody.extend(note_pair(0, 1, 64, 90, 480));
    melody.push(end_of_track());

    let mut bass = note_pair(240, 2, 36, 110, 960);
    bass.push(end_of_track());

    MidiFile {
        header: Header {
            format: Format::Multi,
            division: Division::TicksPerQuarter(480),
        },
        tracks: vec![Track::new(conductor), Track::new(melody), Track::new(bass)],
    }
}

#[test]
fn format1_round_trip_preserves_model() {
    let original = format1_fixture();
    let bytes = original.write();
    let parsed = MidiFile::parse(&bytes).expect("round-trip parse");

    assert_eq!(parsed, original);
    assert_eq!(parsed.tracks.len(), 3);
    assert_eq!(
        parsed.tracks.iter().map(Track::len).collect::<Vec<_>>(),
        original.tracks.iter().map(Track::len).collect::<Vec<_>>(),
    );
    assert_eq!(parsed.tempo_map().entries(), &[(0, 500_000), (960, 400_000)]);

    // parse(write(parse(x))) == parse(x)
    let again = MidiFile::parse(&parsed.write()).expect("second parse");
    assert_eq!(again, parsed);
}

#[test]
fn running_status_input_parses_to_same_model() {
    // Hand-assembled track using running status for the second note pair.
    let mut body: Vec<u8> = Vec::new();
    body.extend_from_slice(&[0x00, 0x90, 60, 100]);
    body.extend_from_slice(&[0x60, 60, 0]); // running status NoteOn, vel 0 => NoteOff
    body.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);

    let mut bytes: Vec<u8> = Vec::new();
    bytes.extend_from_slice(b"MThd");
    bytes.extend_from_slice(&6u32.to_be_bytes());
    bytes.extend_from_slice(&0u16.to_be_bytes());
    bytes.extend_from_slice(&1u16.to_be_bytes());
    bytes.extend_from_slice(&96u16.to_be_bytes());
    bytes.extend_from_slice(b"MTrk");
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&body);

    let parsed = MidiFile::parse(&bytes).expect("parse running-status input");
    let events = parsed.tracks[0].events();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[1].message,
        MidiMessage::NoteOff {
            channel: ch(1),
            note: 60,
            velocity: 0
        }
    );

    // The canonical writer expands running status; the model is unchanged.
    let rewritten = MidiFile::parse(&parsed.write()).expect("reparse");
    assert_eq!(rewritten, parsed);
}

#[test]
fn unknown_meta_event_survives_round_trip() {
    let track = Track::new(vec![
        TrackEvent {
            delta: 0,
            message: MidiMessage::Meta {
                meta_type: 0x60,
                data: vec![1, 2, 3, 4],
            },
        },
        end_of_track(),
    ]);
    let file = MidiFile {
        header: Header {
            format: Format::Single,
            division: Division::TicksPerQuarter(96),
        },
        tracks: vec![track],
    };
    let parsed = MidiFile::parse(&file.write()).unwrap();
    assert_eq!(parsed, file);
}

#[test]
fn sysex_event_survives_round_trip() {
    let track = Track::new(vec![
        TrackEvent {
            delta: 10,
            message: MidiMessage::SysEx(vec![0xF0, 0x43, 0x10, 0x4C, 0x00, 0xF7]),
        },
        end_of_track(),
    ]);
    let file = MidiFile {
        header: Header {
            format: Format::Single,
            division: Division::TicksPerQuarter(96),
        },
        tracks: vec![track],
    };
    let parsed = MidiFile::parse(&file.write()).unwrap();
    assert_eq!(parsed, file);
}

#[test]
fn truncated_file_is_rejected() {
    let original = format1_fixture();
    let bytes = original.write();
    assert!(MidiFile::parse(&bytes[..bytes.len() - 3]).is_err());
}

#[test]
fn bad_magic_is_rejected() {
    let mut bytes = format1_fixture().write();
    bytes[0] = b'X';
    assert!(matches!(
        MidiFile::parse(&bytes),
        Err(midi_hub_core::HubError::BadMagic)
    ));
}

#[test]
fn save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.mid");
    let original = format1_fixture();
    original.save(&path).unwrap();
    let loaded = MidiFile::load(&path).unwrap();
    assert_eq!(loaded, original);
}
