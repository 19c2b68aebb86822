use midi_hub_core::{MidiEvent, MidiMessage};

/// Add parallel notes at fixed semitone intervals. Applied to NoteOn and
/// NoteOff alike so every added voice gets closed.
#[derive(Debug, Clone)]
pub struct Chord {
    intervals: Vec<i8>,
}

impl Chord {
    pub fn new(intervals: Vec<i8>) -> Self {
        Self { intervals }
    }

    /// Major triad voicing: root + 4 + 7.
    pub fn major_triad() -> Self {
        Self::new(vec![4, 7])
    }

    /// Minor triad voicing: root + 3 + 7.
    pub fn minor_triad() -> Self {
        Self::new(vec![3, 7])
    }

    pub fn process(&self, event: &MidiEvent) -> Vec<MidiEvent> {
        let note = match &event.message {
            MidiMessage::NoteOn { note, .. } | MidiMessage::NoteOff { note, .. } => *note,
            _ => return vec![event.clone()],
        };
        let mut out = vec![event.clone()];
        for &interval in &self.intervals {
            let candidate = note as i16 + interval as i16;
            if !(0..=127).contains(&candidate) {
                continue;
            }
            let message = match &event.message {
                MidiMessage::NoteOn {
                    channel, velocity, ..
                } => MidiMessage::NoteOn {
                    channel: *channel,
                    note: candidate as u8,
                    velocity: *velocity,
                },
                MidiMessage::NoteOff {
                    channel, velocity, ..
                } => MidiMessage::NoteOff {
                    channel: *channel,
                    note: candidate as u8,
                    velocity: *velocity,
                },
                _ => unreachable!(),
            };
            out.push(MidiEvent::new(event.timestamp_us, message));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleKind {
    Major,
    NaturalMinor,
    Chromatic,
}

impl ScaleKind {
    fn intervals(&self) -> &'static [i16] {
        match self {
            ScaleKind::Major => &[0, 2, 4, 5, 7, 9, 11],
            ScaleKind::NaturalMinor => &[0, 2, 3, 5, 7, 8, 10],
            ScaleKind::Chromatic => &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11],
        }
    }
}

/// Add harmony voices a number of scale degrees away, staying inside the
/// configured scale. Input notes outside the scale pass unharmonized.
#[derive(Debug, Clone)]
pub struct Harmonizer {
    root: u8,
    scale: ScaleKind,
    degrees: Vec<i32>,
}

impl Harmonizer {
    pub fn new(root: u8, scale: ScaleKind, degrees: Vec<i32>) -> Self {
        Self {
            root: root % 12,
            scale,
            degrees,
        }
    }

    fn harmonize(&self, note: u8, degrees_up: i32) -> Option<u8> {
        let intervals = self.scale.intervals();
        let len = intervals.len() as i32;
        let semitone = (note as i16 - self.root as i16).rem_euclid(12);
        let degree = intervals.iter().position(|&i| i == semitone)? as i32;

        let target = degree + degrees_up;
        let octave_shift = target.div_euclid(len);
        let target_degree = target.rem_euclid(len) as usize;
        let offset =
            intervals[target_degree] - intervals[degree as usize] + (octave_shift as i16 * 12);
        let candidate = note as i16 + offset;
        (0..=127).contains(&candidate).then_some(candidate as u8)
    }

    pub fn process(&self, event: &MidiEvent) -> Vec<MidiEvent> {
        let note = match &event.message {
            MidiMessage::NoteOn { note, .. } | MidiMessage::NoteOff { note, .. } => *note,
            _ => return vec![event.clone()],
        };
        let mut out = vec![event.clone()];
        for &degrees in &self.degrees {
            let Some(harmony) = self.harmonize(note, degrees) else {
                continue;
            };
            let message = match &event.message {
                MidiMessage::NoteOn {
                    channel, velocity, ..
                } => MidiMessage::NoteOn {
                    channel: *channel,
                    note: harmony,
                    velocity: *velocity,
                },
                MidiMessage::NoteOff {
                    channel, velocity, ..
                } => MidiMessage::NoteOff {
                    channel: *channel,
                    note: harmony,
                    velocity: *velocity,
                },
                _ => unreachable!(),
            };
            out.push(MidiEvent::new(event.timestamp_us, message));
        }
        out
    }
}
