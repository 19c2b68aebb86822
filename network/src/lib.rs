//! Network transports: RTP-MIDI (RFC 6295 framing, AppleMIDI session
//! control, recovery journal) and the BLE MIDI packet codec.

pub mod ble;
pub mod rtp;
pub mod server;

pub use server::{rtp_device_id, run_rtp_server, RtpInbound, RtpOutbound};
