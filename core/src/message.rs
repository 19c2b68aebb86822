use std::fmt;

use bytes::Buf;

use crate::error::{HubError, HubResult};

/// 1-based MIDI channel, 1..=16. The wire nibble (0..=15) never leaks out of
/// the codec layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    pub fn new(number: u8) -> HubResult<Self> {
        if (1..=16).contains(&number) {
            Ok(Self(number))
        } else {
            Err(HubError::ChannelOutOfRange(number))
        }
    }

    /// From the low nibble of a status byte.
    pub fn from_nibble(nibble: u8) -> Self {
        Self((nibble & 0x0F) + 1)
    }

    pub fn nibble(self) -> u8 {
        self.0 - 1
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = Channel> {
        (1..=16).map(Channel)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// System real-time messages. Single byte, may be interleaved anywhere in a
/// byte stream and never affect running status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RealtimeMessage {
    TimingClock,
    Start,
    Continue,
    Stop,
    ActiveSensing,
    SystemReset,
}

impl RealtimeMessage {
    pub fn from_status(status: u8) -> Option<Self> {
        match status {
            0xF8 => Some(RealtimeMessage::TimingClock),
            0xFA => Some(RealtimeMessage::Start),
            0xFB => Some(RealtimeMessage::Continue),
            0xFC => Some(RealtimeMessage::Stop),
            0xFE => Some(RealtimeMessage::ActiveSensing),
            0xFF => Some(RealtimeMessage::SystemReset),
            _ => None,
        }
    }

    pub fn status(self) -> u8 {
        match self {
            RealtimeMessage::TimingClock => 0xF8,
            RealtimeMessage::Start => 0xFA,
            RealtimeMessage::Continue => 0xFB,
            RealtimeMessage::Stop => 0xFC,
            RealtimeMessage::ActiveSensing => 0xFE,
            RealtimeMessage::SystemReset => 0xFF,
        }
    }
}

/// Message kind without payload, used as a lookup key (latency profiles,
/// filters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    NoteOn,
    NoteOff,
    PolyAftertouch,
    ControlChange,
    ProgramChange,
    ChannelPressure,
    PitchBend,
    SysEx,
    Meta,
    Realtime,
}

/// Typed MIDI message.
///
/// `SysEx` holds the complete frame bytes including the F0/F7 framing.
/// `Meta` only occurs in file context; it has no raw-stream wire form and
/// `write_to` skips it (the SMF writer emits metas itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: Channel, note: u8, velocity: u8 },
    NoteOff { channel: Channel, note: u8, velocity: u8 },
    PolyAftertouch { channel: Channel, note: u8, pressure: u8 },
    ControlChange { channel: Channel, controller: u8, value: u8 },
    ProgramChange { channel: Channel, program: u8 },
    ChannelPressure { channel: Channel, pressure: u8 },
    PitchBend { channel: Channel, value: u16 },
    SysEx(Vec<u8>),
    Meta { meta_type: u8, data: Vec<u8> },
    Realtime(RealtimeMessage),
}

fn data_byte(buf: &mut &[u8]) -> HubResult<u8> {
    if !buf.has_remaining() {
        return Err(HubError::Truncated);
    }
    let b = buf.get_u8();
    if b > 0x7F {
        return Err(HubError::MalformedPayload(format!(
            "expected data byte, got 0x{b:02X}"
        )));
    }
    Ok(b)
}

impl MidiMessage {
    /// Parse one message from the front of `data`.
    ///
    /// `running_status` carries the last channel status byte across calls,
    /// per the MIDI running-status rule: a leading data byte reuses it,
    /// channel statuses replace it, system common statuses clear it and
    /// real-time statuses leave it untouched.
    ///
    /// Returns the message and the number of bytes consumed.
    pub fn parse(data: &[u8], running_status: &mut Option<u8>) -> HubResult<(Self, usize)> {
        if data.is_empty() {
            return Err(HubError::Truncated);
        }
        let first = data[0];

        // Real-time messages are self-contained single bytes.
        if first >= 0xF8 {
            let rt = RealtimeMessage::from_status(first).ok_or_else(|| {
                HubError::MalformedPayload(format!("undefined real-time status 0x{first:02X}"))
            })?;
            return Ok((MidiMessage::Realtime(rt), 1));
        }

        let (status, status_len) = if first >= 0x80 {
            (first, 1usize)
        } else {
            let status = running_status.ok_or_else(|| {
                HubError::MalformedPayload("data byte without running status".to_string())
            })?;
            (status, 0usize)
        };

        let mut buf = &data[status_len..];
        let message = match status & 0xF0 {
            0x80 => {
                let channel = Channel::from_nibble(status);
                let note = data_byte(&mut buf)?;
                let velocity = data_byte(&mut buf)?;
                MidiMessage::NoteOff { channel, note, velocity }
            }
            0x90 => {
                let channel = Channel::from_nibble(status);
                let note = data_byte(&mut buf)?;
                let velocity = data_byte(&mut buf)?;
                MidiMessage::NoteOn { channel, note, velocity }
            }
            0xA0 => {
                let channel = Channel::from_nibble(status);
                let note = data_byte(&mut buf)?;
                let pressure = data_byte(&mut buf)?;
                MidiMessage::PolyAftertouch { channel, note, pressure }
            }
            0xB0 => {
                let channel = Channel::from_nibble(status);
                let controller = data_byte(&mut buf)?;
                let value = data_byte(&mut buf)?;
                MidiMessage::ControlChange { channel, controller, value }
            }
            0xC0 => {
                let channel = Channel::from_nibble(status);
                let program = data_byte(&mut buf)?;
                MidiMessage::ProgramChange { channel, program }
            }
            0xD0 => {
                let channel = Channel::from_nibble(status);
                let pressure = data_byte(&mut buf)?;
                MidiMessage::ChannelPressure { channel, pressure }
            }
            0xE0 => {
                let channel = Channel::from_nibble(status);
                let lsb = data_byte(&mut buf)?;
                let msb = data_byte(&mut buf)?;
                MidiMessage::PitchBend {
                    channel,
                    value: ((msb as u16) << 7) | lsb as u16,
                }
            }
            0xF0 => {
                // System common clears running status.
                *running_status = None;
                match status {
                    0xF0 => {
                        let end = data
                            .iter()
                            .position(|&b| b == 0xF7)
                            .ok_or(HubError::Truncated)?;
                        return Ok((MidiMessage::SysEx(data[..=end].to_vec()), end + 1));
                    }
                    other => {
                        return Err(HubError::MalformedPayload(format!(
                            "unsupported system common status 0x{other:02X}"
                        )));
                    }
                }
            }
            _ => unreachable!("status byte has high bit set"),
        };

        *running_status = Some(status);
        let consumed = status_len + (data.len() - status_len - buf.remaining());
        Ok((message.canonicalized(), consumed))
    }

    /// Canonical wire bytes: full status, no running-status compression.
    /// `Meta` has no raw wire form and writes nothing.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                out.extend_from_slice(&[0x80 | channel.nibble(), *note, *velocity]);
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                out.extend_from_slice(&[0x90 | channel.nibble(), *note, *velocity]);
            }
            MidiMessage::PolyAftertouch { channel, note, pressure } => {
                out.extend_from_slice(&[0xA0 | channel.nibble(), *note, *pressure]);
            }
            MidiMessage::ControlChange { channel, controller, value } => {
                out.extend_from_slice(&[0xB0 | channel.nibble(), *controller, *value]);
            }
            MidiMessage::ProgramChange { channel, program } => {
                out.extend_from_slice(&[0xC0 | channel.nibble(), *program]);
            }
            MidiMessage::ChannelPressure { channel, pressure } => {
                out.extend_from_slice(&[0xD0 | channel.nibble(), *pressure]);
            }
            MidiMessage::PitchBend { channel, value } => {
                out.extend_from_slice(&[
                    0xE0 | channel.nibble(),
                    (value & 0x7F) as u8,
                    (value >> 7) as u8,
                ]);
            }
            MidiMessage::SysEx(frame) => out.extend_from_slice(frame),
            MidiMessage::Meta { .. } => {}
            MidiMessage::Realtime(rt) => out.push(rt.status()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3);
        self.write_to(&mut out);
        out
    }

    /// NoteOn with velocity 0 is NoteOff in disguise; normalize on input so
    /// downstream stages only ever see one spelling.
    pub fn canonicalized(self) -> Self {
        match self {
            MidiMessage::NoteOn { channel, note, velocity: 0 } => MidiMessage::NoteOff {
                channel,
                note,
                velocity: 0,
            },
            other => other,
        }
    }

    pub fn channel(&self) -> Option<Channel> {
        match self {
            MidiMessage::NoteOn { channel, .. }
            | MidiMessage::NoteOff { channel, .. }
            | MidiMessage::PolyAftertouch { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. }
            | MidiMessage::ChannelPressure { channel, .. }
            | MidiMessage::PitchBend { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MidiMessage::NoteOn { .. } => MessageKind::NoteOn,
            MidiMessage::NoteOff { .. } => MessageKind::NoteOff,
            MidiMessage::PolyAftertouch { .. } => MessageKind::PolyAftertouch,
            MidiMessage::ControlChange { .. } => MessageKind::ControlChange,
            MidiMessage::ProgramChange { .. } => MessageKind::ProgramChange,
            MidiMessage::ChannelPressure { .. } => MessageKind::ChannelPressure,
            MidiMessage::PitchBend { .. } => MessageKind::PitchBend,
            MidiMessage::SysEx(_) => MessageKind::SysEx,
            MidiMessage::Meta { .. } => MessageKind::Meta,
            MidiMessage::Realtime(_) => MessageKind::Realtime,
        }
    }

    /// Channel mode message: all notes off (CC 123).
    pub fn all_notes_off(channel: Channel) -> Self {
        MidiMessage::ControlChange {
            channel,
            controller: 123,
            value: 0,
        }
    }

    /// Channel mode message: all sound off (CC 120).
    pub fn all_sound_off(channel: Channel) -> Self {
        MidiMessage::ControlChange {
            channel,
            controller: 120,
            value: 0,
        }
    }
}

/// A message stamped with the monotonic clock. This is the unit that flows
/// through router, processors and scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    pub timestamp_us: u64,
    pub message: MidiMessage,
}

impl MidiEvent {
    pub fn new(timestamp_us: u64, message: MidiMessage) -> Self {
        Self {
            timestamp_us,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_note_on() {
        let mut rs = None;
        let (msg, used) = MidiMessage::parse(&[0x95, 60, 100], &mut rs).unwrap();
        assert_eq!(used, 3);
        assert_eq!(
            msg,
            MidiMessage::NoteOn {
                channel: Channel::new(6).unwrap(),
                note: 60,
                velocity: 100
            }
        );
        assert_eq!(rs, Some(0x95));
    }

    #[test]
    fn running_status_reuses_last_channel_status() {
        let mut rs = None;
        let data = [0x90, 60, 100, 61, 101];
        let (_, used) = MidiMessage::parse(&data, &mut rs).unwrap();
        let (msg, used2) = MidiMessage::parse(&data[used..], &mut rs).unwrap();
        assert_eq!(used2, 2);
        assert_eq!(
            msg,
            MidiMessage::NoteOn {
                channel: Channel::new(1).unwrap(),
                note: 61,
                velocity: 101
            }
        );
    }

    #[test]
    fn data_byte_without_running_status_is_rejected() {
        let mut rs = None;
        assert!(matches!(
            MidiMessage::parse(&[60, 100], &mut rs),
            Err(HubError::MalformedPayload(_))
        ));
    }

    #[test]
    fn note_on_velocity_zero_is_canonicalized() {
        let mut rs = None;
        let (msg, _) = MidiMessage::parse(&[0x90, 60, 0], &mut rs).unwrap();
        assert_eq!(msg.kind(), MessageKind::NoteOff);
    }

    #[test]
    fn sysex_frame_kept_verbatim() {
        let mut rs = Some(0x90);
        let frame = [0xF0, 0x43, 0x01, 0x02, 0xF7];
        let (msg, used) = MidiMessage::parse(&frame, &mut rs).unwrap();
        assert_eq!(used, 5);
        assert_eq!(msg, MidiMessage::SysEx(frame.to_vec()));
        // System common clears running status.
        assert_eq!(rs, None);
        assert_eq!(msg.to_bytes(), frame.to_vec());
    }

    #[test]
    fn unterminated_sysex_is_truncated() {
        let mut rs = None;
        assert!(matches!(
            MidiMessage::parse(&[0xF0, 0x43, 0x01], &mut rs),
            Err(HubError::Truncated)
        ));
    }

    #[test]
    fn realtime_does_not_touch_running_status() {
        let mut rs = Some(0x92);
        let (msg, used) = MidiMessage::parse(&[0xF8], &mut rs).unwrap();
        assert_eq!(used, 1);
        assert_eq!(msg, MidiMessage::Realtime(RealtimeMessage::TimingClock));
        assert_eq!(rs, Some(0x92));
    }

    #[test]
    fn pitch_bend_round_trip() {
        let mut rs = None;
        let bytes = [0xE2, 0x21, 0x45];
        let (msg, _) = MidiMessage::parse(&bytes, &mut rs).unwrap();
        assert_eq!(msg.to_bytes(), bytes.to_vec());
    }

    #[test]
    fn channel_bounds() {
        assert!(Channel::new(0).is_err());
        assert!(Channel::new(17).is_err());
        assert_eq!(Channel::new(16).unwrap().nibble(), 15);
        assert_eq!(Channel::from_nibble(0x0F).number(), 16);
    }
}
