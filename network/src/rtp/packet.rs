use bytes::{Buf, BufMut, BytesMut};
use midi_hub_core::{HubError, HubResult};

use super::journal::Journal;

/// Dynamic payload type used for RTP-MIDI streams.
pub const RTP_MIDI_PAYLOAD_TYPE: u8 = 97;

const FLAG_B_LONG_LENGTH: u8 = 0x80;
const FLAG_J_JOURNAL: u8 = 0x40;
const FLAG_Z_FIRST_DELTA: u8 = 0x20;
const FLAG_P_SYSEX_START: u8 = 0x10;

/// One MIDI command with its delta time inside the RTP-MIDI command section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedCommand {
    pub delta_time: u32,
    pub bytes: Vec<u8>,
}

impl TimedCommand {
    pub fn new(delta_time: u32, bytes: Vec<u8>) -> Self {
        Self { delta_time, bytes }
    }
}

/// Plain RTP header (no CSRC, no extension payloads — RTP-MIDI uses
/// neither).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(ssrc: u32, sequence_number: u16, timestamp: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            marker: true,
            payload_type: RTP_MIDI_PAYLOAD_TYPE,
            sequence_number,
            timestamp,
            ssrc,
        }
    }

    pub fn parse(data: &mut &[u8]) -> HubResult<Self> {
        if data.len() < 12 {
            return Err(HubError::Truncated);
        }
        let b0 = data.get_u8();
        let b1 = data.get_u8();
        Ok(Self {
            version: (b0 >> 6) & 0x03,
            padding: b0 & 0x20 != 0,
            extension: b0 & 0x10 != 0,
            marker: b1 & 0x80 != 0,
            payload_type: b1 & 0x7F,
            sequence_number: data.get_u16(),
            timestamp: data.get_u32(),
            ssrc: data.get_u32(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8((self.version << 6) | ((self.padding as u8) << 5) | ((self.extension as u8) << 4));
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }
}

/// Full RTP-MIDI packet: header, command section, optional recovery
/// journal.
#[derive(Debug, Clone, PartialEq)]
pub struct RtpMidiPacket {
    pub header: RtpHeader,
    pub commands: Vec<TimedCommand>,
    pub journal: Option<Journal>,
}

impl RtpMidiPacket {
    pub fn new(ssrc: u32, sequence_number: u16, timestamp: u32) -> Self {
        Self {
            header: RtpHeader::new(ssrc, sequence_number, timestamp),
            commands: Vec::new(),
            journal: None,
        }
    }

    pub fn parse(data: &[u8]) -> HubResult<Self> {
        let mut rest = data;
        let header = RtpHeader::parse(&mut rest)?;
        if header.version != 2 {
            return Err(HubError::MalformedPayload(format!(
                "RTP version {}",
                header.version
            )));
        }

        if rest.is_empty() {
            return Err(HubError::Truncated);
        }
        let flags = rest[0];
        rest = &rest[1..];
        let section_len = if flags & FLAG_B_LONG_LENGTH != 0 {
            if rest.is_empty() {
                return Err(HubError::Truncated);
            }
            let lo = rest[0];
            rest = &rest[1..];
            (((flags & 0x0F) as usize) << 8) | lo as usize
        } else {
            (flags & 0x0F) as usize
        };

        if rest.len() < section_len {
            return Err(HubError::Truncated);
        }
        let (mut section, mut tail) = rest.split_at(section_len);
        let commands = parse_command_section(&mut section, flags & FLAG_Z_FIRST_DELTA != 0)?;

        let journal = if flags & FLAG_J_JOURNAL != 0 {
            Some(Journal::parse(&mut tail)?)
        } else {
            None
        };

        Ok(Self {
            header,
            commands,
            journal,
        })
    }

    pub fn serialize(&self) -> HubResult<Vec<u8>> {
        let mut section = BytesMut::new();
        let first_delta_zero = self.commands.first().map_or(true, |c| c.delta_time == 0);
        for (i, cmd) in self.commands.iter().enumerate() {
            // With the Z flag set the first delta time is implicit.
            if !(i == 0 && first_delta_zero) {
                write_vlq(cmd.delta_time, &mut section);
            }
            section.put_slice(&cmd.bytes);
        }
        if section.len() > 0x0FFF {
            return Err(HubError::MalformedPayload(format!(
                "command section of {} bytes exceeds the 12-bit length field",
                section.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(section.len() + 64);
        self.header.write(&mut buf);

        let mut flags = 0u8;
        if first_delta_zero {
            flags |= FLAG_Z_FIRST_DELTA;
        }
        if self.journal.is_some() {
            flags |= FLAG_J_JOURNAL;
        }
        if self
            .commands
            .first()
            .is_some_and(|c| c.bytes.first() == Some(&0xF0))
        {
            flags |= FLAG_P_SYSEX_START;
        }
        if section.len() > 0x0F {
            buf.put_u8(flags | FLAG_B_LONG_LENGTH | ((section.len() >> 8) as u8 & 0x0F));
            buf.put_u8((section.len() & 0xFF) as u8);
        } else {
            buf.put_u8(flags | section.len() as u8);
        }
        buf.put_slice(&section);

        if let Some(journal) = &self.journal {
            journal.write(&mut buf)?;
        }
        Ok(buf.to_vec())
    }
}

fn parse_command_section(section: &mut &[u8], first_delta_zero: bool) -> HubResult<Vec<TimedCommand>> {
    let mut commands = Vec::new();
    let mut first = true;
    while !section.is_empty() {
        let delta = if first && first_delta_zero {
            0
        } else {
            read_vlq(section)?
        };
        first = false;

        let Some(&status) = section.first() else {
            return Err(HubError::Truncated);
        };
        let len = command_length(status, section)?;
        if section.len() < len {
            return Err(HubError::Truncated);
        }
        let (bytes, rest) = section.split_at(len);
        commands.push(TimedCommand::new(delta, bytes.to_vec()));
        *section = rest;
    }
    Ok(commands)
}

/// Wire length of a MIDI command starting at `data[0]`. SysEx scans for its
/// F7 terminator.
pub(crate) fn command_length(status: u8, data: &[u8]) -> HubResult<usize> {
    match status & 0xF0 {
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => Ok(3),
        0xC0 | 0xD0 => Ok(2),
        0xF0 => match status {
            0xF0 => data
                .iter()
                .position(|&b| b == 0xF7)
                .map(|p| p + 1)
                .ok_or(HubError::Truncated),
            0xF1 | 0xF3 => Ok(2),
            0xF2 => Ok(3),
            0xF6 | 0xF8 | 0xFA | 0xFB | 0xFC | 0xFE | 0xFF => Ok(1),
            other => Err(HubError::MalformedPayload(format!(
                "undefined status byte 0x{other:02X}"
            ))),
        },
        _ => Err(HubError::MalformedPayload(format!(
            "expected status byte, got 0x{status:02X}"
        ))),
    }
}

pub(crate) fn read_vlq(data: &mut &[u8]) -> HubResult<u32> {
    let mut value = 0u32;
    for _ in 0..4 {
        let Some((&byte, rest)) = data.split_first() else {
            return Err(HubError::Truncated);
        };
        *data = rest;
        value = (value << 7) | (byte & 0x7F) as u32;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(HubError::MalformedPayload(
        "delta time VLQ exceeds 4 bytes".to_string(),
    ))
}

pub(crate) fn write_vlq(value: u32, buf: &mut BytesMut) {
    let mut tmp = [0u8; 4];
    let mut idx = 3;
    tmp[3] = (value & 0x7F) as u8;
    let mut rest = value >> 7;
    while rest > 0 {
        idx -= 1;
        tmp[idx] = ((rest & 0x7F) | 0x80) as u8;
        rest >>= 7;
    }
    buf.put_slice(&tmp[idx..]);
}
