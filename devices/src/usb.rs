//! USB (and USB-serial) MIDI endpoint over a raw byte stream. The OS-level
//! transport hands us `Read`/`Write` halves; this wrapper frames messages
//! with the incremental stream parser.

use std::io::{Read, Write};

use log::debug;
use midi_hub_core::{HubError, HubResult, MidiClock, MidiEvent, MidiMessage};
use sysex::CapabilityDescriptor;

use crate::stream::StreamParser;
use crate::{ConnectionState, DeviceInfo, Direction, MidiDevice, TransportKind};

pub struct UsbMidiDevice {
    info: DeviceInfo,
    state: ConnectionState,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    parser: StreamParser,
    read_buf: [u8; 512],
}

impl UsbMidiDevice {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        reader: Option<Box<dyn Read + Send>>,
        writer: Option<Box<dyn Write + Send>>,
        clock: MidiClock,
    ) -> Self {
        let direction = match (reader.is_some(), writer.is_some()) {
            (true, true) => Direction::Bidirectional,
            (true, false) => Direction::Input,
            _ => Direction::Output,
        };
        Self {
            info: DeviceInfo {
                id: id.into(),
                name: name.into(),
                transport: TransportKind::Usb,
                direction,
                capabilities: CapabilityDescriptor::default(),
            },
            state: ConnectionState::Disconnected,
            reader,
            writer,
            parser: StreamParser::new(clock),
            read_buf: [0; 512],
        }
    }
}

impl MidiDevice for UsbMidiDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn open(&mut self) -> HubResult<()> {
        self.state = ConnectionState::Connected;
        debug!("usb device {} opened", self.info.id);
        Ok(())
    }

    fn close(&mut self) -> HubResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
        self.reader = None;
        self.writer = None;
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn send(&mut self, message: &MidiMessage) -> HubResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(HubError::TransportClosed);
        }
        let writer = self.writer.as_mut().ok_or(HubError::TransportClosed)?;
        let bytes = message.to_bytes();
        if bytes.is_empty() {
            return Ok(());
        }
        if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
            self.state = ConnectionState::Error;
            return Err(HubError::Io(e));
        }
        Ok(())
    }

    fn poll(&mut self) -> HubResult<Vec<MidiEvent>> {
        if self.state != ConnectionState::Connected {
            return Err(HubError::TransportClosed);
        }
        let reader = self.reader.as_mut().ok_or(HubError::TransportClosed)?;
        match reader.read(&mut self.read_buf) {
            Ok(0) => {
                self.state = ConnectionState::Error;
                Err(HubError::TransportClosed)
            }
            Ok(n) => {
                let buf = self.read_buf;
                Ok(self.parser.feed(&buf[..n]))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => {
                self.state = ConnectionState::Error;
                Err(HubError::Io(e))
            }
        }
    }
}
