//! Multi-packet transfer for payloads larger than one frame. Byte 0 of each
//! chunk's payload is the marker; data bytes follow. Partial transfers are
//! keyed by (source device, manufacturer) and expire after two seconds.

use std::collections::HashMap;

use log::warn;
use midi_hub_core::{HubError, HubResult};

use crate::frame::SysExFrame;
use crate::manufacturer::ManufacturerId;

/// Default maximum data bytes per chunk (marker byte not counted).
pub const DEFAULT_MAX_CHUNK_PAYLOAD: usize = 256;

/// Reassembly timeout for a partial transfer.
pub const REASSEMBLY_TIMEOUT_US: u64 = 2_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkMarker {
    First = 0x00,
    Continue = 0x01,
    Last = 0x02,
    Single = 0x03,
}

impl ChunkMarker {
    pub fn from_byte(byte: u8) -> HubResult<Self> {
        match byte {
            0x00 => Ok(ChunkMarker::First),
            0x01 => Ok(ChunkMarker::Continue),
            0x02 => Ok(ChunkMarker::Last),
            0x03 => Ok(ChunkMarker::Single),
            other => Err(HubError::MalformedPayload(format!(
                "unknown chunk marker 0x{other:02X}"
            ))),
        }
    }
}

/// Splits a logical frame into marker-prefixed chunks.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_payload: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_PAYLOAD)
    }
}

impl Chunker {
    pub fn new(max_payload: usize) -> Self {
        assert!(max_payload > 0, "chunk payload size must be positive");
        Self { max_payload }
    }

    /// One frame per chunk. A payload that fits in a single chunk gets the
    /// `Single` marker; larger payloads become `First, Continue*, Last`.
    pub fn split(&self, frame: &SysExFrame) -> Vec<SysExFrame> {
        let data = &frame.payload;
        if data.len() <= self.max_payload {
            let mut payload = Vec::with_capacity(data.len() + 1);
            payload.push(ChunkMarker::Single as u8);
            payload.extend_from_slice(data);
            return vec![SysExFrame::new(frame.manufacturer, payload)];
        }

        let chunks: Vec<&[u8]> = data.chunks(self.max_payload).collect();
        let last = chunks.len() - 1;
        chunks
            .iter()
            .enumerate()
            .map(|(i, slice)| {
                let marker = if i == 0 {
                    ChunkMarker::First
                } else if i == last {
                    ChunkMarker::Last
                } else {
                    ChunkMarker::Continue
                };
                let mut payload = Vec::with_capacity(slice.len() + 1);
                payload.push(marker as u8);
                payload.extend_from_slice(slice);
                SysExFrame::new(frame.manufacturer, payload)
            })
            .collect()
    }
}

#[derive(Debug)]
struct Partial {
    data: Vec<u8>,
    started_us: u64,
}

/// Reassembles chunked transfers back into logical frames. Timeouts are
/// driven by the caller's clock (`now_us`) so behavior is deterministic.
#[derive(Debug)]
pub struct Reassembler {
    timeout_us: u64,
    partial: HashMap<(String, ManufacturerId), Partial>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(REASSEMBLY_TIMEOUT_US)
    }
}

impl Reassembler {
    pub fn new(timeout_us: u64) -> Self {
        Self {
            timeout_us,
            partial: HashMap::new(),
        }
    }

    /// Feed one received chunk. Returns the reassembled logical frame when
    /// the chunk completes a transfer.
    pub fn feed(
        &mut self,
        device_id: &str,
        frame: &SysExFrame,
        now_us: u64,
    ) -> HubResult<Option<SysExFrame>> {
        let Some((&marker_byte, data)) = frame.payload.split_first() else {
            return Err(HubError::MalformedPayload("empty chunk payload".to_string()));
        };
        let marker = ChunkMarker::from_byte(marker_byte)?;
        let key = (device_id.to_string(), frame.manufacturer);

        match marker {
            ChunkMarker::Single => Ok(Some(SysExFrame::new(frame.manufacturer, data.to_vec()))),
            ChunkMarker::First => {
                if self.partial.contains_key(&key) {
                    warn!(
                        "device {device_id}: new transfer started before the previous one completed"
                    );
                }
                self.partial.insert(
                    key,
                    Partial {
                        data: data.to_vec(),
                        started_us: now_us,
                    },
                );
                Ok(None)
            }
            ChunkMarker::Continue => match self.partial.get_mut(&key) {
                Some(partial) => {
                    partial.data.extend_from_slice(data);
                    Ok(None)
                }
                None => Err(HubError::MalformedPayload(
                    "continuation chunk without a started transfer".to_string(),
                )),
            },
            ChunkMarker::Last => match self.partial.remove(&key) {
                Some(mut partial) => {
                    partial.data.extend_from_slice(data);
                    Ok(Some(SysExFrame::new(frame.manufacturer, partial.data)))
                }
                None => Err(HubError::MalformedPayload(
                    "final chunk without a started transfer".to_string(),
                )),
            },
        }
    }

    /// Drop transfers older than the timeout, returning one
    /// `IncompleteFrame` per dropped transfer for reporting.
    pub fn expire(&mut self, now_us: u64) -> Vec<HubError> {
        let timeout = self.timeout_us;
        let expired: Vec<_> = self
            .partial
            .iter()
            .filter(|(_, p)| now_us.saturating_sub(p.started_us) >= timeout)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .map(|key| {
                self.partial.remove(&key);
                HubError::IncompleteFrame { device_id: key.0 }
            })
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}
