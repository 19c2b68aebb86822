use midi_hub_core::{Channel, MidiEvent, MidiMessage};

/// Echoes notes at a fixed interval with velocity decay. The dry message
/// passes through immediately; echoes sit in a local timestamped queue
/// until `tick` releases them.
#[derive(Debug, Clone)]
pub struct Delay {
    interval_us: u64,
    repeats: u32,
    decay: f32,
    pending: Vec<MidiEvent>,
    /// Echo NoteOns already released whose echo NoteOff is still pending.
    sounding: Vec<(Channel, u8)>,
}

impl Delay {
    pub fn new(interval_us: u64, repeats: u32, decay: f32) -> Self {
        Self {
            interval_us: interval_us.max(1_000),
            repeats: repeats.min(16),
            decay: decay.clamp(0.0, 1.0),
            pending: Vec::new(),
            sounding: Vec::new(),
        }
    }

    pub fn process(&mut self, event: &MidiEvent) -> Vec<MidiEvent> {
        match &event.message {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => {
                for k in 1..=self.repeats {
                    let scaled = (*velocity as f32 * self.decay.powi(k as i32)).round();
                    let echo_velocity = (scaled as u8).clamp(1, 127);
                    self.pending.push(MidiEvent::new(
                        event.timestamp_us + k as u64 * self.interval_us,
                        MidiMessage::NoteOn {
                            channel: *channel,
                            note: *note,
                            velocity: echo_velocity,
                        },
                    ));
                }
                vec![event.clone()]
            }
            MidiMessage::NoteOff { channel, note, .. } => {
                for k in 1..=self.repeats {
                    self.pending.push(MidiEvent::new(
                        event.timestamp_us + k as u64 * self.interval_us,
                        MidiMessage::NoteOff {
                            channel: *channel,
                            note: *note,
                            velocity: 0,
                        },
                    ));
                }
                vec![event.clone()]
            }
            _ => vec![event.clone()],
        }
    }

    pub fn tick(&mut self, now_us: u64) -> Vec<MidiEvent> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        self.pending.sort_by_key(|e| e.timestamp_us);
        let split = self.pending.partition_point(|e| e.timestamp_us <= now_us);
        let mut due: Vec<MidiEvent> = self.pending.drain(..split).collect();
        for event in &mut due {
            match &event.message {
                MidiMessage::NoteOn { channel, note, .. } => {
                    self.sounding.push((*channel, *note));
                }
                MidiMessage::NoteOff { channel, note, .. } => {
                    if let Some(pos) = self
                        .sounding
                        .iter()
                        .position(|&(c, n)| c == *channel && n == *note)
                    {
                        self.sounding.remove(pos);
                    }
                }
                _ => {}
            }
        }
        due
    }

    /// Drop queued echoes and close every echo note that already sounded.
    pub fn reset(&mut self, now_us: u64) -> Vec<MidiEvent> {
        self.pending.clear();
        self.sounding
            .drain(..)
            .map(|(channel, note)| {
                MidiEvent::new(
                    now_us,
                    MidiMessage::NoteOff {
                        channel,
                        note,
                        velocity: 0,
                    },
                )
            })
            .collect()
    }
}
