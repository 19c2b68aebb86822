use midi_hub_core::{Channel, HubResult, MidiEvent, MidiMessage};

/// Subset of the 16 MIDI channels as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSet(u16);

impl ChannelSet {
    pub fn all() -> Self {
        Self(0xFFFF)
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_channels(numbers: &[u8]) -> HubResult<Self> {
        let mut set = Self::empty();
        for &n in numbers {
            set = set.with(Channel::new(n)?);
        }
        Ok(set)
    }

    pub fn with(self, channel: Channel) -> Self {
        Self(self.0 | 1 << channel.nibble())
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.0 & (1 << channel.nibble()) != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn channels(&self) -> Vec<u8> {
        Channel::all()
            .filter(|ch| self.contains(*ch))
            .map(|ch| ch.number())
            .collect()
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Pass-through for channel messages on an allowed channel; everything
/// without a channel (SysEx, realtime) always passes.
#[derive(Debug, Clone, Copy)]
pub struct ChannelFilter {
    allowed: ChannelSet,
}

impl ChannelFilter {
    pub fn new(allowed: ChannelSet) -> Self {
        Self { allowed }
    }

    pub fn process(&self, event: &MidiEvent) -> Vec<MidiEvent> {
        match event.message.channel() {
            Some(ch) if !self.allowed.contains(ch) => Vec::new(),
            _ => vec![event.clone()],
        }
    }
}

/// Shift NoteOn/NoteOff by a fixed number of semitones. Notes leaving the
/// 0..=127 range are dropped, not wrapped.
#[derive(Debug, Clone, Copy)]
pub struct Transpose {
    semitones: i8,
}

impl Transpose {
    pub fn new(semitones: i8) -> Self {
        Self {
            semitones: semitones.clamp(-24, 24),
        }
    }

    pub fn semitones(&self) -> i8 {
        self.semitones
    }

    pub fn process(&self, event: &MidiEvent) -> Vec<MidiEvent> {
        let shift = |note: u8| -> Option<u8> {
            let shifted = note as i16 + self.semitones as i16;
            (0..=127).contains(&shifted).then_some(shifted as u8)
        };
        let message = match &event.message {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => match shift(*note) {
                Some(note) => MidiMessage::NoteOn {
                    channel: *channel,
                    note,
                    velocity: *velocity,
                },
                None => return Vec::new(),
            },
            MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => match shift(*note) {
                Some(note) => MidiMessage::NoteOff {
                    channel: *channel,
                    note,
                    velocity: *velocity,
                },
                None => return Vec::new(),
            },
            other => other.clone(),
        };
        vec![MidiEvent::new(event.timestamp_us, message)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveShape {
    Linear,
    Log,
    Exp,
}

/// Reshape NoteOn velocity through a curve and gain, clamped to 1..=127 so
/// an attenuated NoteOn never collapses into a NoteOff-by-zero.
#[derive(Debug, Clone, Copy)]
pub struct VelocityCurve {
    shape: CurveShape,
    gain: f32,
}

impl VelocityCurve {
    pub fn new(shape: CurveShape, gain: f32) -> Self {
        Self {
            shape,
            gain: gain.clamp(0.0, 2.0),
        }
    }

    fn map(&self, velocity: u8) -> u8 {
        let x = velocity as f32 / 127.0;
        let shaped = match self.shape {
            CurveShape::Linear => x,
            CurveShape::Log => (1.0 + 9.0 * x).log10(),
            CurveShape::Exp => (10f32.powf(x) - 1.0) / 9.0,
        };
        (shaped * self.gain * 127.0).round().clamp(1.0, 127.0) as u8
    }

    pub fn process(&self, event: &MidiEvent) -> Vec<MidiEvent> {
        let message = match &event.message {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => MidiMessage::NoteOn {
                channel: *channel,
                note: *note,
                velocity: self.map(*velocity),
            },
            other => other.clone(),
        };
        vec![MidiEvent::new(event.timestamp_us, message)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(message: MidiMessage) -> MidiEvent {
        MidiEvent::new(0, message)
    }

    fn note_on(channel: u8, note: u8, velocity: u8) -> MidiEvent {
        ev(MidiMessage::NoteOn {
            channel: Channel::new(channel).unwrap(),
            note,
            velocity,
        })
    }

    #[test]
    fn channel_filter_admits_and_drops() {
        let filter = ChannelFilter::new(ChannelSet::from_channels(&[1, 3]).unwrap());
        assert_eq!(filter.process(&note_on(1, 60, 100)).len(), 1);
        assert!(filter.process(&note_on(2, 60, 100)).is_empty());
        assert_eq!(filter.process(&note_on(3, 60, 100)).len(), 1);
        // SysEx has no channel and always passes.
        assert_eq!(
            filter
                .process(&ev(MidiMessage::SysEx(vec![0xF0, 0x43, 0xF7])))
                .len(),
            1
        );
    }

    #[test]
    fn transpose_shifts_and_drops_out_of_range() {
        let up = Transpose::new(12);
        let out = up.process(&note_on(1, 60, 100));
        assert!(matches!(
            out[0].message,
            MidiMessage::NoteOn { note: 72, .. }
        ));

        // 127 + 1 is dropped, not wrapped.
        let one_up = Transpose::new(1);
        assert!(one_up.process(&note_on(1, 127, 100)).is_empty());
        let down = Transpose::new(-1);
        assert!(down.process(&note_on(1, 0, 100)).is_empty());
    }

    #[test]
    fn velocity_curve_clamps_to_valid_range() {
        let hot = VelocityCurve::new(CurveShape::Linear, 2.0);
        let out = hot.process(&note_on(1, 60, 100));
        assert!(matches!(
            out[0].message,
            MidiMessage::NoteOn { velocity: 127, .. }
        ));

        let cold = VelocityCurve::new(CurveShape::Linear, 0.0);
        let out = cold.process(&note_on(1, 60, 100));
        // Floor of 1: never emit a NoteOn that means NoteOff.
        assert!(matches!(
            out[0].message,
            MidiMessage::NoteOn { velocity: 1, .. }
        ));
    }

    #[test]
    fn log_curve_lifts_soft_notes() {
        let log = VelocityCurve::new(CurveShape::Log, 1.0);
        let out = log.process(&note_on(1, 60, 32));
        let MidiMessage::NoteOn { velocity, .. } = out[0].message else {
            panic!("expected NoteOn");
        };
        assert!(velocity > 32);

        let exp = VelocityCurve::new(CurveShape::Exp, 1.0);
        let out = exp.process(&note_on(1, 60, 32));
        let MidiMessage::NoteOn { velocity, .. } = out[0].message else {
            panic!("expected NoteOn");
        };
        assert!(velocity < 32);
    }

    #[test]
    fn channel_set_round_trip() {
        let set = ChannelSet::from_channels(&[1, 16]).unwrap();
        assert_eq!(set.channels(), vec![1, 16]);
        assert!(ChannelSet::from_channels(&[0]).is_err());
        assert!(ChannelSet::from_channels(&[17]).is_err());
    }
}
