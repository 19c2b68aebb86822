//! In-process virtual MIDI port. The application side holds a
//! [`VirtualPort`] handle: whatever it injects shows up as device input,
//! whatever the pipeline sends to the device shows up on the handle.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use midi_hub_core::{HubError, HubResult, MidiClock, MidiEvent, MidiMessage};
use sysex::CapabilityDescriptor;

use crate::{ConnectionState, DeviceInfo, Direction, MidiDevice, TransportKind};

/// Application-side handle of a virtual device.
#[derive(Debug, Clone)]
pub struct VirtualPort {
    pub inject_tx: Sender<MidiMessage>,
    pub sent_rx: Receiver<MidiMessage>,
}

impl VirtualPort {
    /// Inject a message as if the device had produced it.
    pub fn inject(&self, message: MidiMessage) {
        let _ = self.inject_tx.send(message);
    }

    /// Everything the pipeline has sent to the device so far.
    pub fn drain_sent(&self) -> Vec<MidiMessage> {
        self.sent_rx.try_iter().collect()
    }
}

pub struct VirtualMidiDevice {
    info: DeviceInfo,
    state: ConnectionState,
    clock: MidiClock,
    input_rx: Receiver<MidiMessage>,
    output_tx: Sender<MidiMessage>,
}

impl VirtualMidiDevice {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        clock: MidiClock,
    ) -> (Self, VirtualPort) {
        let (inject_tx, input_rx) = unbounded();
        let (output_tx, sent_rx) = unbounded();
        let device = Self {
            info: DeviceInfo {
                id: id.into(),
                name: name.into(),
                transport: TransportKind::Virtual,
                direction: Direction::Bidirectional,
                capabilities: CapabilityDescriptor::default(),
            },
            state: ConnectionState::Disconnected,
            clock,
            input_rx,
            output_tx,
        };
        (device, VirtualPort { inject_tx, sent_rx })
    }
}

impl MidiDevice for VirtualMidiDevice {
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
        self.output_tx
            .send(message.clone())
            .map_err(|_| HubError::TransportClosed)
    }

    fn poll(&mut self) -> HubResult<Vec<MidiEvent>> {
        if self.state != ConnectionState::Connected {
            return Err(HubError::TransportClosed);
        }
        let now = self.clock.now_us();
        let mut events = Vec::new();
        loop {
            match self.input_rx.try_recv() {
                Ok(message) => events.push(MidiEvent::new(now, message.canonicalized())),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.state = ConnectionState::Error;
                    return Err(HubError::TransportClosed);
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
    fn loopback_in_and_out() {
        let (mut dev, port) = VirtualMidiDevice::new("virt-1", "Loop", MidiClock::new());
        dev.open().unwrap();

        port.inject(MidiMessage::NoteOn {
            channel: Channel::new(1).unwrap(),
            note: 60,
            velocity: 100,
        });
        let events = dev.poll().unwrap();
        assert_eq!(events.len(), 1);

        dev.send(&MidiMessage::NoteOff {
            channel: Channel::new(1).unwrap(),
            note: 60,
            velocity: 0,
        })
        .unwrap();
        assert_eq!(port.drain_sent().len(), 1);
    }

    #[test]
    fn injected_note_on_velocity_zero_is_canonicalized() {
        let (mut dev, port) = VirtualMidiDevice::new("virt-2", "Loop", MidiClock::new());
        dev.open().unwrap();
        port.inject(MidiMessage::NoteOn {
            channel: Channel::new(2).unwrap(),
            note: 70,
            velocity: 0,
        });
        let events = dev.poll().unwrap();
        assert!(matches!(
            events[0].message,
            MidiMessage::NoteOff { note: 70, .. }
        ));
    }

    #[test]
    fn closed_device_rejects_io() {
        let (mut dev, _port) = VirtualMidiDevice::new("virt-3", "Loop", MidiClock::new());
        assert!(dev.poll().is_err());
        assert!(dev
            .send(&MidiMessage::all_sound_off(Channel::new(1).unwrap()))
            .is_err());
    }
}
