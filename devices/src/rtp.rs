//! RTP-MIDI endpoint adapter. Sessions live in the network server task;
//! this device is the pipeline-facing sink side. Inbound traffic from
//! peers enters the pipeline through the server's ingress bridge, tagged
//! with the per-peer `rtp:<addr>` device ID.

use std::net::SocketAddr;

use midi_hub_core::{HubError, HubResult, MidiEvent, MidiMessage};
use network::rtp::TimedCommand;
use network::RtpOutbound;
use sysex::CapabilityDescriptor;
use tokio::sync::mpsc;

use crate::{ConnectionState, DeviceInfo, Direction, MidiDevice, TransportKind};

pub struct RtpMidiDevice {
    info: DeviceInfo,
    state: ConnectionState,
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<RtpOutbound>,
}

impl RtpMidiDevice {
    /// `peer = None` addresses every established session (broadcast sink).
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        peer: Option<SocketAddr>,
        outbound: mpsc::UnboundedSender<RtpOutbound>,
    ) -> Self {
        Self {
            info: DeviceInfo {
                id: id.into(),
                name: name.into(),
                transport: TransportKind::Rtp,
                direction: Direction::Output,
                capabilities: CapabilityDescriptor::default(),
            },
            state: ConnectionState::Disconnected,
            peer,
            outbound,
        }
    }
}

impl MidiDevice for RtpMidiDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn open(&mut self) -> HubResult<()> {
        self.state = ConnectionState::Connected;
        Ok(())
    }

    fn close(&mut self) -> HubResult<()> {
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn send(&mut self, message: &MidiMessage) -> HubResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(HubError::TransportClosed);
        }
        let bytes = message.to_bytes();
        if bytes.is_empty() {
            return Ok(());
        }
        self.outbound
            .send(RtpOutbound {
                peer: self.peer,
                commands: vec![TimedCommand::new(0, bytes)],
            })
            .map_err(|_| {
                self.state = ConnectionState::Error;
                HubError::TransportClosed
            })
    }

    fn poll(&mut self) -> HubResult<Vec<MidiEvent>> {
        // Input arrives through the server's ingress bridge, not here.
        Ok(Vec::new())
    }
}
