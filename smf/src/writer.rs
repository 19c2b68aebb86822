use midi_hub_core::MidiMessage;

use crate::file::MidiFile;
use crate::vlq::write_vlq;

impl MidiFile {
    /// Serialize to canonical SMF bytes.
    ///
    /// Canonical means every event carries its full status byte (no running
    /// status), which keeps serialized output stable across edits. Parsing
    /// the result yields the identical in-memory model.
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);
        out.extend_from_slice(b"MThd");
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&self.header.format.to_u16().to_be_bytes());
        out.extend_from_slice(&(self.tracks.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.header.division.to_u16().to_be_bytes());

        for track in &self.tracks {
            let mut body = Vec::with_capacity(track.len() * 4);
            for ev in track.events() {
                write_vlq(ev.delta, &mut body);
                write_track_message(&ev.message, &mut body);
            }
            out.extend_from_slice(b"MTrk");
            out.extend_from_slice(&(body.len() as u32).to_be_bytes());
            out.extend_from_slice(&body);
        }
        out
    }
}

fn write_track_message(message: &MidiMessage, out: &mut Vec<u8>) {
    match message {
        MidiMessage::Meta { meta_type, data } => {
            out.push(0xFF);
            out.push(*meta_type);
            write_vlq(data.len() as u32, out);
            out.extend_from_slice(data);
        }
        MidiMessage::SysEx(frame) => match frame.split_first() {
            Some((0xF0, rest)) => {
                out.push(0xF0);
                write_vlq(rest.len() as u32, out);
                out.extend_from_slice(rest);
            }
            _ => {
                // Escape form for frames without an F0 prefix.
                out.push(0xF7);
                write_vlq(frame.len() as u32, out);
                out.extend_from_slice(frame);
            }
        },
        other => other.write_to(out),
    }
}
