use log::{debug, trace, warn};
use midi_hub_core::{HubError, HubResult, MidiMessage};

use crate::file::{Division, Format, Header, MidiFile, Track, TrackEvent, META_END_OF_TRACK};
use crate::vlq::read_vlq;

fn read_u16(data: &mut &[u8]) -> HubResult<u16> {
    if data.len() < 2 {
        return Err(HubError::Truncated);
    }
    let v = u16::from_be_bytes([data[0], data[1]]);
    *data = &data[2..];
    Ok(v)
}

fn read_u32(data: &mut &[u8]) -> HubResult<u32> {
    if data.len() < 4 {
        return Err(HubError::Truncated);
    }
    let v = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    *data = &data[4..];
    Ok(v)
}

fn read_n<'a>(data: &mut &'a [u8], n: usize) -> HubResult<&'a [u8]> {
    if data.len() < n {
        return Err(HubError::Truncated);
    }
    let (head, rest) = data.split_at(n);
    *data = rest;
    Ok(head)
}

fn expect_tag(data: &mut &[u8], tag: &[u8; 4]) -> HubResult<()> {
    let got = read_n(data, 4)?;
    if got != tag {
        return Err(HubError::BadMagic);
    }
    Ok(())
}

impl MidiFile {
    /// Parse a complete SMF byte buffer.
    ///
    /// Running status is honored on read. Meta events are carried opaquely
    /// (`Meta { meta_type, data }`), so types we do not interpret survive a
    /// round trip untouched.
    pub fn parse(bytes: &[u8]) -> HubResult<Self> {
        let mut data = bytes;
        expect_tag(&mut data, b"MThd")?;
        let header_len = read_u32(&mut data)?;
        if header_len != 6 {
            return Err(HubError::MalformedPayload(format!(
                "MThd length {header_len}, expected 6"
            )));
        }
        let format = Format::from_u16(read_u16(&mut data)?)?;
        let num_tracks = read_u16(&mut data)?;
        let division = Division::from_u16(read_u16(&mut data)?)?;
        if format == Format::Single && num_tracks != 1 {
            return Err(HubError::MalformedPayload(format!(
                "format 0 file with {num_tracks} tracks"
            )));
        }
        trace!("MThd: {format:?}, {num_tracks} track(s), {division:?}");

        let mut tracks = Vec::with_capacity(num_tracks as usize);
        for i in 0..num_tracks {
            debug!("parsing track {} of {}", i + 1, num_tracks);
            tracks.push(parse_track(&mut data)?);
        }
        Ok(MidiFile {
            header: Header { format, division },
            tracks,
        })
    }
}

fn parse_track(data: &mut &[u8]) -> HubResult<Track> {
    expect_tag(data, b"MTrk")?;
    let chunk_len = read_u32(data)? as usize;
    let mut chunk = read_n(data, chunk_len)?;

    let mut events = Vec::new();
    let mut running_status: Option<u8> = None;
    loop {
        if chunk.is_empty() {
            // The chunk may not run out before End of Track.
            return Err(HubError::Truncated);
        }
        let delta = read_vlq(&mut chunk)?;
        let message = parse_track_message(&mut chunk, &mut running_status)?;
        let is_end = matches!(
            &message,
            MidiMessage::Meta { meta_type, .. } if *meta_type == META_END_OF_TRACK
        );
        events.push(TrackEvent { delta, message });
        if is_end {
            if !chunk.is_empty() {
                return Err(HubError::MalformedPayload(
                    "data after End of Track".to_string(),
                ));
            }
            break;
        }
    }
    Ok(Track::new(events))
}

fn parse_track_message(
    chunk: &mut &[u8],
    running_status: &mut Option<u8>,
) -> HubResult<MidiMessage> {
    let Some(&status) = chunk.first() else {
        return Err(HubError::Truncated);
    };
    match status {
        0xFF => {
            // Meta event: FF type <vlq len> <data>. Clears running status.
            *running_status = None;
            *chunk = &chunk[1..];
            let Some((&meta_type, rest)) = chunk.split_first() else {
                return Err(HubError::Truncated);
            };
            *chunk = rest;
            let len = read_vlq(chunk)? as usize;
            let data = read_n(chunk, len)?.to_vec();
            if !known_meta_type(meta_type) {
                // Non-fatal: carried opaquely and re-emitted verbatim.
                warn!("{}", HubError::UnknownMetaEvent(meta_type));
            }
            Ok(MidiMessage::Meta { meta_type, data })
        }
        0xF0 => {
            // SysEx: F0 <vlq len> <data ... F7>. The in-memory frame keeps
            // its F0 prefix so stream and file forms share one shape.
            *running_status = None;
            *chunk = &chunk[1..];
            let len = read_vlq(chunk)? as usize;
            let body = read_n(chunk, len)?;
            let mut frame = Vec::with_capacity(len + 1);
            frame.push(0xF0);
            frame.extend_from_slice(body);
            Ok(MidiMessage::SysEx(frame))
        }
        0xF7 => {
            // SysEx escape/continuation: raw bytes without an F0 prefix.
            // Preserved as-is; the writer picks the F7 form back.
            *running_status = None;
            *chunk = &chunk[1..];
            let len = read_vlq(chunk)? as usize;
            Ok(MidiMessage::SysEx(read_n(chunk, len)?.to_vec()))
        }
        _ => {
            let (message, used) = MidiMessage::parse(*chunk, running_status)?;
            *chunk = &chunk[used..];
            Ok(message)
        }
    }
}

fn known_meta_type(meta_type: u8) -> bool {
    matches!(meta_type, 0x00..=0x09 | 0x20 | 0x21 | 0x2F | 0x51 | 0x54 | 0x58 | 0x59 | 0x7F)
}
