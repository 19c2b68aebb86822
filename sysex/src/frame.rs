use midi_hub_core::{HubError, HubResult};

use crate::manufacturer::ManufacturerId;

pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;

/// A decoded SysEx frame: manufacturer ID plus the payload bytes between
/// the ID and the trailing F7. Payload bytes are 7-bit clean by invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysExFrame {
    pub manufacturer: ManufacturerId,
    pub payload: Vec<u8>,
}

/// Sub-ID structure of a universal SysEx frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniversalHeader {
    pub realtime: bool,
    /// Target device, 0x7F = "all call".
    pub device_id: u8,
    pub sub_id1: u8,
    pub sub_id2: u8,
}

impl SysExFrame {
    pub fn new(manufacturer: ManufacturerId, payload: Vec<u8>) -> Self {
        Self {
            manufacturer,
            payload,
        }
    }

    /// Parse a complete frame, F0 through F7.
    ///
    /// Any byte >= 0x80 between the framing bytes makes the frame invalid;
    /// callers discard such frames per the propagation policy.
    pub fn parse(bytes: &[u8]) -> HubResult<Self> {
        if bytes.len() < 2 {
            return Err(HubError::Truncated);
        }
        if bytes[0] != SYSEX_START {
            return Err(HubError::MalformedPayload(
                "frame does not start with F0".to_string(),
            ));
        }
        if *bytes.last().unwrap() != SYSEX_END {
            return Err(HubError::Truncated);
        }
        let inner = &bytes[1..bytes.len() - 1];
        if let Some(bad) = inner.iter().find(|&&b| b >= 0x80) {
            return Err(HubError::MalformedPayload(format!(
                "byte 0x{bad:02X} inside SysEx payload"
            )));
        }
        let (manufacturer, id_len) = ManufacturerId::decode(inner)?;
        Ok(Self {
            manufacturer,
            payload: inner[id_len..].to_vec(),
        })
    }

    /// Canonical single-frame encoding: F0, ID, payload, F7.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 5);
        out.push(SYSEX_START);
        self.manufacturer.encode(&mut out);
        out.extend_from_slice(&self.payload);
        out.push(SYSEX_END);
        out
    }

    /// Sub-ID header for universal frames, `None` for vendor frames or
    /// payloads too short to carry one.
    pub fn universal(&self) -> Option<UniversalHeader> {
        let realtime = match self.manufacturer {
            ManufacturerId::UniversalRealtime => true,
            ManufacturerId::UniversalNonRealtime => false,
            _ => return None,
        };
        if self.payload.len() < 3 {
            return None;
        }
        Some(UniversalHeader {
            realtime,
            device_id: self.payload[0],
            sub_id1: self.payload[1],
            sub_id2: self.payload[2],
        })
    }
}
