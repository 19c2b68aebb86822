//! BLE MIDI endpoint. The OS Bluetooth stack delivers characteristic
//! values (packets) over a channel; this wrapper decodes them and rebuilds
//! absolute timestamps from the 13-bit packet clock.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::warn;
use midi_hub_core::{HubError, HubResult, MidiClock, MidiEvent, MidiMessage};
use network::ble::{decode_packet, encode_packet, TimestampReconstructor};
use sysex::CapabilityDescriptor;

use crate::{ConnectionState, DeviceInfo, Direction, MidiDevice, TransportKind};

/// Transport-side handle: feed received BLE packets in, take packets to
/// write out.
#[derive(Debug, Clone)]
pub struct BleLink {
    pub packets_in: Sender<Vec<u8>>,
    pub packets_out: Receiver<Vec<u8>>,
}

pub struct BleMidiDevice {
    info: DeviceInfo,
    state: ConnectionState,
    clock: MidiClock,
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
    reconstructor: TimestampReconstructor,
}

impl BleMidiDevice {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        clock: MidiClock,
    ) -> (Self, BleLink) {
        let (packets_in, rx) = unbounded();
        let (tx, packets_out) = unbounded();
        let device = Self {
            info: DeviceInfo {
                id: id.into(),
                name: name.into(),
                transport: TransportKind::Ble,
                direction: Direction::Bidirectional,
                capabilities: CapabilityDescriptor::default(),
            },
            state: ConnectionState::Disconnected,
            clock,
            rx,
            tx,
            reconstructor: TimestampReconstructor::new(),
        };
        (
            device,
            BleLink {
                packets_in,
                packets_out,
            },
        )
    }
}

impl MidiDevice for BleMidiDevice {
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
        let ts13 = (self.clock.now_us() / 1000 % 8192) as u16;
        self.tx
            .send(encode_packet(ts13, &[&bytes]))
            .map_err(|_| HubError::TransportClosed)
    }

    fn poll(&mut self) -> HubResult<Vec<MidiEvent>> {
        if self.state != ConnectionState::Connected {
            return Err(HubError::TransportClosed);
        }
        let mut events = Vec::new();
        loop {
            let packet = match self.rx.try_recv() {
                Ok(p) => p,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.state = ConnectionState::Error;
                    return Err(HubError::TransportClosed);
                }
            };
            let now = self.clock.now_us();
            let messages = match decode_packet(&packet) {
                Ok(m) => m,
                Err(e) => {
                    // Per policy, a bad packet is logged and dropped.
                    warn!("device {}: {e}", self.info.id);
                    continue;
                }
            };
            for msg in messages {
                let timestamp = self.reconstructor.absolute_us(msg.timestamp_ms13, now);
                let mut running_status = None;
                match MidiMessage::parse(&msg.bytes, &mut running_status) {
                    Ok((message, _)) => events.push(MidiEvent::new(timestamp, message)),
                    Err(e) => warn!("device {}: {e}", self.info.id),
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midi_hub_core::Channel;

    #[test]
    fn decodes_incoming_packets_with_timestamps() {
        let (mut dev, link) = BleMidiDevice::new("ble-1", "Pad", MidiClock::new());
        dev.open().unwrap();

        link.packets_in
            .send(encode_packet(500, &[&[0x90, 60, 100], &[0x80, 60, 0]]))
            .unwrap();
        let events = dev.poll().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].message, MidiMessage::NoteOn { .. }));
        assert!(matches!(events[1].message, MidiMessage::NoteOff { .. }));
    }

    #[test]
    fn outgoing_messages_are_packetized() {
        let (mut dev, link) = BleMidiDevice::new("ble-2", "Pad", MidiClock::new());
        dev.open().unwrap();
        dev.send(&MidiMessage::NoteOn {
            channel: Channel::new(1).unwrap(),
            note: 72,
            velocity: 80,
        })
        .unwrap();
        let packet = link.packets_out.try_recv().unwrap();
        let decoded = decode_packet(&packet).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].bytes, vec![0x90, 72, 80]);
    }

    #[test]
    fn malformed_packet_is_dropped_not_fatal() {
        let (mut dev, link) = BleMidiDevice::new("ble-3", "Pad", MidiClock::new());
        dev.open().unwrap();
        link.packets_in.send(vec![0x00, 0x01]).unwrap();
        link.packets_in
            .send(encode_packet(0, &[&[0x90, 61, 99]]))
            .unwrap();
        let events = dev.poll().unwrap();
        assert_eq!(events.len(), 1);
    }
}
