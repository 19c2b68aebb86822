//! Recovery journal: each outgoing packet carries a compact history of
//! recently sent packets so a receiver can repair sequence gaps without
//! retransmission round trips.

use bytes::{Buf, BufMut, BytesMut};
use midi_hub_core::{HubError, HubResult};

use super::packet::{command_length, read_vlq, write_vlq, TimedCommand};

/// How many sent packets the journal history retains.
pub const JOURNAL_HISTORY: usize = 64;

/// One journaled packet: its sequence number and the commands it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub sequence_nr: u16,
    pub commands: Vec<TimedCommand>,
}

impl JournalEntry {
    fn write(&self, buf: &mut BytesMut) -> HubResult<()> {
        let mut body = BytesMut::new();
        for cmd in &self.commands {
            write_vlq(cmd.delta_time, &mut body);
            body.put_slice(&cmd.bytes);
        }
        if body.len() > u16::MAX as usize {
            return Err(HubError::MalformedPayload(
                "journal entry too large".to_string(),
            ));
        }
        buf.put_u16(self.sequence_nr);
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);
        Ok(())
    }

    fn parse(data: &mut &[u8]) -> HubResult<Self> {
        if data.len() < 4 {
            return Err(HubError::Truncated);
        }
        let sequence_nr = data.get_u16();
        let body_len = data.get_u16() as usize;
        if data.len() < body_len {
            return Err(HubError::Truncated);
        }
        let (mut body, rest) = data.split_at(body_len);
        *data = rest;

        let mut commands = Vec::new();
        while !body.is_empty() {
            let delta = read_vlq(&mut body)?;
            let Some(&status) = body.first() else {
                return Err(HubError::Truncated);
            };
            let len = command_length(status, body)?;
            if body.len() < len {
                return Err(HubError::Truncated);
            }
            let (bytes, tail) = body.split_at(len);
            commands.push(TimedCommand::new(delta, bytes.to_vec()));
            body = tail;
        }
        Ok(Self {
            sequence_nr,
            commands,
        })
    }
}

/// Enhanced journal section: checkpoint plus entry list.
#[derive(Debug, Clone, PartialEq)]
pub struct Journal {
    /// 0 = channel journal, 1 = system journal.
    pub a_bit: bool,
    pub ch_bits: u8,
    /// Oldest sequence number still covered by this journal.
    pub checkpoint_sequence: u16,
    pub entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn from_history(entries: Vec<JournalEntry>) -> Self {
        let checkpoint_sequence = entries.first().map_or(0, |e| e.sequence_nr);
        Self {
            a_bit: false,
            ch_bits: 0,
            checkpoint_sequence,
            entries,
        }
    }

    pub fn write(&self, buf: &mut BytesMut) -> HubResult<()> {
        // S=1 marks the enhanced form.
        buf.put_u8(0x80 | ((self.a_bit as u8) << 6) | (self.ch_bits & 0x3F));
        buf.put_u16(self.checkpoint_sequence);
        buf.put_u16(self.entries.len() as u16);
        for entry in &self.entries {
            entry.write(buf)?;
        }
        Ok(())
    }

    pub fn parse(data: &mut &[u8]) -> HubResult<Self> {
        if data.len() < 5 {
            return Err(HubError::Truncated);
        }
        let b0 = data.get_u8();
        if b0 & 0x80 == 0 {
            return Err(HubError::MalformedPayload(
                "journal S bit not set".to_string(),
            ));
        }
        let a_bit = b0 & 0x40 != 0;
        let ch_bits = b0 & 0x3F;
        let checkpoint_sequence = data.get_u16();
        let count = data.get_u16() as usize;
        let mut entries = Vec::with_capacity(count.min(JOURNAL_HISTORY));
        for _ in 0..count {
            entries.push(JournalEntry::parse(data)?);
        }
        Ok(Self {
            a_bit,
            ch_bits,
            checkpoint_sequence,
            entries,
        })
    }

    pub fn entry(&self, sequence_nr: u16) -> Option<&JournalEntry> {
        self.entries.iter().find(|e| e.sequence_nr == sequence_nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u16) -> JournalEntry {
        JournalEntry {
            sequence_nr: seq,
            commands: vec![
                TimedCommand::new(0, vec![0x90, 60, 100]),
                TimedCommand::new(120, vec![0x80, 60, 0]),
            ],
        }
    }

    #[test]
    fn journal_round_trip() {
        let journal = Journal::from_history(vec![entry(10), entry(11), entry(12)]);
        let mut buf = BytesMut::new();
        journal.write(&mut buf).unwrap();
        let mut slice = &buf[..];
        let parsed = Journal::parse(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(parsed, journal);
        assert_eq!(parsed.checkpoint_sequence, 10);
    }

    #[test]
    fn lookup_by_sequence() {
        let journal = Journal::from_history(vec![entry(5), entry(6)]);
        assert!(journal.entry(6).is_some());
        assert!(journal.entry(7).is_none());
    }

    #[test]
    fn truncated_journal_is_rejected() {
        let journal = Journal::from_history(vec![entry(1)]);
        let mut buf = BytesMut::new();
        journal.write(&mut buf).unwrap();
        let mut slice = &buf[..buf.len() - 2];
        assert!(Journal::parse(&mut slice).is_err());
    }
}
