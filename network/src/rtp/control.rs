//! AppleMIDI session control messages: invitation handshake, session end
//! and the CK clock-sync exchange. All share the 0xFFFF magic prefix and a
//! two-letter command code.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use midi_hub_core::{HubError, HubResult};

pub const PROTOCOL_VERSION: u32 = 2;

/// Common header for IN/OK/NO/BY messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub command: [u8; 2],
    pub initiator_token: u32,
    pub ssrc: u32,
}

impl ControlHeader {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(0xFF);
        buf.put_u8(0xFF);
        buf.put_slice(&self.command);
        buf.put_u32(PROTOCOL_VERSION);
        buf.put_u32(self.initiator_token);
        buf.put_u32(self.ssrc);
    }

    fn parse(reader: &mut Bytes) -> HubResult<Self> {
        if reader.len() < 16 {
            return Err(HubError::Truncated);
        }
        if reader.get_u8() != 0xFF || reader.get_u8() != 0xFF {
            return Err(HubError::BadMagic);
        }
        let command = [reader.get_u8(), reader.get_u8()];
        let version = reader.get_u32();
        if version != PROTOCOL_VERSION {
            return Err(HubError::UnsupportedFormat(format!(
                "AppleMIDI protocol version {version}"
            )));
        }
        Ok(Self {
            command,
            initiator_token: reader.get_u32(),
            ssrc: reader.get_u32(),
        })
    }
}

fn read_name(reader: &mut Bytes) -> HubResult<String> {
    let bytes: Vec<u8> = reader.iter().take_while(|&&b| b != 0).cloned().collect();
    let name = String::from_utf8(bytes)
        .map_err(|_| HubError::MalformedPayload("session name is not UTF-8".to_string()))?;
    Ok(name)
}

/// `IN` — session invitation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invitation {
    pub header: ControlHeader,
    pub name: String,
}

/// `OK` — invitation accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct InvitationAccepted {
    pub header: ControlHeader,
    pub name: String,
}

/// `NO` — invitation rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct InvitationRejected {
    pub header: ControlHeader,
}

/// `BY` — session teardown.
#[derive(Debug, Clone, PartialEq)]
pub struct EndSession {
    pub header: ControlHeader,
}

/// `CK` — one leg of the three-way clock synchronization. Timestamps are
/// in 100 µs units of the sender's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSync {
    pub ssrc: u32,
    pub count: u8,
    pub timestamps: [u64; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Invitation(Invitation),
    InvitationAccepted(InvitationAccepted),
    InvitationRejected(InvitationRejected),
    EndSession(EndSession),
    ClockSync(ClockSync),
}

impl ControlMessage {
    pub fn invitation(initiator_token: u32, ssrc: u32, name: &str) -> Self {
        ControlMessage::Invitation(Invitation {
            header: ControlHeader {
                command: *b"IN",
                initiator_token,
                ssrc,
            },
            name: name.to_string(),
        })
    }

    pub fn accepted(initiator_token: u32, ssrc: u32, name: &str) -> Self {
        ControlMessage::InvitationAccepted(InvitationAccepted {
            header: ControlHeader {
                command: *b"OK",
                initiator_token,
                ssrc,
            },
            name: name.to_string(),
        })
    }

    pub fn rejected(initiator_token: u32, ssrc: u32) -> Self {
        ControlMessage::InvitationRejected(InvitationRejected {
            header: ControlHeader {
                command: *b"NO",
                initiator_token,
                ssrc,
            },
        })
    }

    pub fn end_session(initiator_token: u32, ssrc: u32) -> Self {
        ControlMessage::EndSession(EndSession {
            header: ControlHeader {
                command: *b"BY",
                initiator_token,
                ssrc,
            },
        })
    }

    pub fn clock_sync(ssrc: u32, count: u8, timestamps: [u64; 3]) -> Self {
        ControlMessage::ClockSync(ClockSync {
            ssrc,
            count,
            timestamps,
        })
    }

    /// True when a datagram looks like session control rather than RTP
    /// data (0xFFFF magic cannot start a valid RTP v2 header).
    pub fn matches(data: &[u8]) -> bool {
        data.len() >= 4 && data[0] == 0xFF && data[1] == 0xFF
    }

    pub fn parse(data: &[u8]) -> HubResult<Self> {
        if data.len() < 4 {
            return Err(HubError::Truncated);
        }
        let command = [data[2], data[3]];
        let mut reader = Bytes::copy_from_slice(data);
        match &command {
            b"IN" => {
                let header = ControlHeader::parse(&mut reader)?;
                let name = read_name(&mut reader)?;
                Ok(ControlMessage::Invitation(Invitation { header, name }))
            }
            b"OK" => {
                let header = ControlHeader::parse(&mut reader)?;
                let name = read_name(&mut reader)?;
                Ok(ControlMessage::InvitationAccepted(InvitationAccepted {
                    header,
                    name,
                }))
            }
            b"NO" => {
                let header = ControlHeader::parse(&mut reader)?;
                Ok(ControlMessage::InvitationRejected(InvitationRejected {
                    header,
                }))
            }
            b"BY" => {
                let header = ControlHeader::parse(&mut reader)?;
                Ok(ControlMessage::EndSession(EndSession { header }))
            }
            b"CK" => {
                if reader.len() < 36 {
                    return Err(HubError::Truncated);
                }
                reader.advance(4); // magic + command
                let ssrc = reader.get_u32();
                let count = reader.get_u8();
                reader.advance(3); // padding
                let timestamps = [reader.get_u64(), reader.get_u64(), reader.get_u64()];
                Ok(ControlMessage::ClockSync(ClockSync {
                    ssrc,
                    count,
                    timestamps,
                }))
            }
            other => Err(HubError::MalformedPayload(format!(
                "unknown AppleMIDI command {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            ControlMessage::Invitation(m) => {
                m.header.write(&mut buf);
                buf.put_slice(m.name.as_bytes());
                buf.put_u8(0);
            }
            ControlMessage::InvitationAccepted(m) => {
                m.header.write(&mut buf);
                buf.put_slice(m.name.as_bytes());
                buf.put_u8(0);
            }
            ControlMessage::InvitationRejected(m) => m.header.write(&mut buf),
            ControlMessage::EndSession(m) => m.header.write(&mut buf),
            ControlMessage::ClockSync(m) => {
                buf.put_u8(0xFF);
                buf.put_u8(0xFF);
                buf.put_slice(b"CK");
                buf.put_u32(m.ssrc);
                buf.put_u8(m.count);
                buf.put_slice(&[0, 0, 0]);
                buf.put_u64(m.timestamps[0]);
                buf.put_u64(m.timestamps[1]);
                buf.put_u64(m.timestamps[2]);
            }
        }
        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invitation_round_trip() {
        let msg = ControlMessage::invitation(0x1234, 0xABCD, "hub");
        let bytes = msg.serialize();
        assert!(ControlMessage::matches(&bytes));
        assert_eq!(ControlMessage::parse(&bytes).unwrap(), msg);
    }

    #[test]
    fn all_commands_round_trip() {
        for msg in [
            ControlMessage::accepted(1, 2, "peer"),
            ControlMessage::rejected(1, 2),
            ControlMessage::end_session(1, 2),
            ControlMessage::clock_sync(7, 1, [100, 200, 0]),
        ] {
            assert_eq!(ControlMessage::parse(&msg.serialize()).unwrap(), msg);
        }
    }

    #[test]
    fn rtp_data_does_not_match_control_magic() {
        // An RTP v2 header starts with 0x80.
        assert!(!ControlMessage::matches(&[0x80, 0x61, 0x00, 0x01]));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut bytes = ControlMessage::rejected(1, 2).serialize();
        bytes[2] = b'X';
        bytes[3] = b'Y';
        assert!(ControlMessage::parse(&bytes).is_err());
    }
}
