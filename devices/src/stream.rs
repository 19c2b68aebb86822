//! Incremental parser turning a raw MIDI byte stream into timestamped
//! events. Handles running status, buffered SysEx frames and real-time
//! bytes interleaved mid-message.

use log::warn;
use midi_hub_core::{HubError, MidiClock, MidiEvent, MidiMessage, RealtimeMessage};

#[derive(Debug)]
pub struct StreamParser {
    clock: MidiClock,
    running_status: Option<u8>,
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new(clock: MidiClock) -> Self {
        Self {
            clock,
            running_status: None,
            buffer: Vec::with_capacity(64),
        }
    }

    /// Feed freshly read bytes; returns every completed message, stamped
    /// with arrival time. Malformed bytes are logged and skipped, never
    /// fatal.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<MidiEvent> {
        let now = self.clock.now_us();
        let mut out = Vec::new();

        for &byte in bytes {
            // Real-time bytes may appear anywhere, including inside another
            // message; they are complete on their own and skip the buffer.
            if byte >= 0xF8 {
                match RealtimeMessage::from_status(byte) {
                    Some(rt) => out.push(MidiEvent::new(now, MidiMessage::Realtime(rt))),
                    None => warn!("dropping undefined real-time byte 0x{byte:02X}"),
                }
                continue;
            }
            self.buffer.push(byte);
        }

        loop {
            if self.buffer.is_empty() {
                break;
            }
            match MidiMessage::parse(&self.buffer, &mut self.running_status) {
                Ok((message, used)) => {
                    self.buffer.drain(..used);
                    out.push(MidiEvent::new(now, message));
                }
                Err(HubError::Truncated) => break,
                Err(e) => {
                    // Resync one byte at a time past the garbage.
                    warn!("dropping byte 0x{:02X}: {e}", self.buffer[0]);
                    self.buffer.remove(0);
                }
            }
        }
        out
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
