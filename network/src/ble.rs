//! BLE MIDI packet codec per the Apple profile: a packet header byte
//! carries the high 6 bits of a 13-bit millisecond timestamp, and every
//! message in the packet is preceded by a timestamp byte carrying the low
//! 7 bits.

use log::debug;
use midi_hub_core::{HubError, HubResult};

use crate::rtp::packet::command_length;

/// The 13-bit millisecond counter wraps every 8192 ms.
pub const TIMESTAMP_WINDOW_MS: u64 = 8192;

const HEADER_BIT: u8 = 0x80;

/// One decoded message with its 13-bit packet timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleMessage {
    pub timestamp_ms13: u16,
    pub bytes: Vec<u8>,
}

/// Encode messages sharing one packet. `timestamp_ms13` is the low 13 bits
/// of the sender's millisecond clock.
pub fn encode_packet(timestamp_ms13: u16, messages: &[&[u8]]) -> Vec<u8> {
    let ts = timestamp_ms13 & 0x1FFF;
    let mut out = Vec::with_capacity(2 + messages.iter().map(|m| m.len() + 1).sum::<usize>());
    out.push(HEADER_BIT | ((ts >> 7) as u8 & 0x3F));
    for msg in messages {
        out.push(HEADER_BIT | (ts & 0x7F) as u8);
        out.extend_from_slice(msg);
    }
    out
}

/// Decode one BLE MIDI packet into its timestamped messages.
pub fn decode_packet(data: &[u8]) -> HubResult<Vec<BleMessage>> {
    if data.len() < 2 {
        return Err(HubError::Truncated);
    }
    let header = data[0];
    if header & HEADER_BIT == 0 {
        return Err(HubError::MalformedPayload(
            "BLE packet header bit not set".to_string(),
        ));
    }
    let ts_high = ((header & 0x3F) as u16) << 7;

    let mut messages = Vec::new();
    let mut rest = &data[1..];
    while !rest.is_empty() {
        let ts_byte = rest[0];
        if ts_byte & HEADER_BIT == 0 {
            return Err(HubError::MalformedPayload(
                "expected BLE timestamp byte".to_string(),
            ));
        }
        let timestamp_ms13 = ts_high | (ts_byte & 0x7F) as u16;
        rest = &rest[1..];

        let Some(&status) = rest.first() else {
            return Err(HubError::Truncated);
        };
        let len = command_length(status, rest)?;
        if rest.len() < len {
            return Err(HubError::Truncated);
        }
        let (bytes, tail) = rest.split_at(len);
        messages.push(BleMessage {
            timestamp_ms13,
            bytes: bytes.to_vec(),
        });
        rest = tail;
    }
    Ok(messages)
}

/// Rebuilds absolute timestamps from the 13-bit packet counter, detecting
/// rollover inside the 8192 ms window and re-anchoring against the local
/// clock when accumulated drift exceeds half a window.
#[derive(Debug, Default)]
pub struct TimestampReconstructor {
    /// Offset between the peer's millisecond counter and our clock origin.
    anchor_us: Option<u64>,
    last_ms13: u16,
    rollovers: u64,
}

impl TimestampReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute microseconds (on the local clock) for a message stamped
    /// `ts_ms13`, given that the packet arrived at `now_us`.
    pub fn absolute_us(&mut self, ts_ms13: u16, now_us: u64) -> u64 {
        let ts_ms13 = ts_ms13 & 0x1FFF;
        let anchor = match self.anchor_us {
            Some(a) => a,
            None => {
                let anchor = now_us.saturating_sub(ts_ms13 as u64 * 1000);
                self.anchor_us = Some(anchor);
                self.last_ms13 = ts_ms13;
                anchor
            }
        };

        if ts_ms13 < self.last_ms13 {
            self.rollovers += 1;
        }
        self.last_ms13 = ts_ms13;

        let peer_ms = self.rollovers * TIMESTAMP_WINDOW_MS + ts_ms13 as u64;
        let absolute = anchor + peer_ms * 1000;

        // Clocks wander; if the reconstruction drifts more than half a
        // window from arrival time, re-anchor on this packet.
        let drift = absolute.abs_diff(now_us);
        if drift > TIMESTAMP_WINDOW_MS * 1000 / 2 {
            debug!("BLE timestamp drift {drift} us, re-anchoring");
            let anchor = now_us.saturating_sub(peer_ms * 1000);
            self.anchor_us = Some(anchor);
            return now_us;
        }
        absolute
    }
}
