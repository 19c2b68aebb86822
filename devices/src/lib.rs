//! Uniform device endpoints over USB byte streams, in-process virtual
//! ports, BLE MIDI links and RTP-MIDI peers, plus the manager that owns
//! them.

pub mod ble;
pub mod manager;
pub mod rtp;
pub mod stream;
pub mod usb;
pub mod virtual_dev;

pub use manager::{DeviceManager, DRAIN_DEADLINE_MS};

use midi_hub_core::{HubResult, MidiEvent, MidiMessage};
use sysex::CapabilityDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Usb,
    Virtual,
    Ble,
    Rtp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Usb => "usb",
            TransportKind::Virtual => "virtual",
            TransportKind::Ble => "ble",
            TransportKind::Rtp => "rtp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
    Bidirectional,
}

impl Direction {
    pub fn is_input(&self) -> bool {
        matches!(self, Direction::Input | Direction::Bidirectional)
    }

    pub fn is_output(&self) -> bool {
        matches!(self, Direction::Output | Direction::Bidirectional)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
            Direction::Bidirectional => "bidirectional",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

/// Stable identity and capabilities of an endpoint. The ID is the handle
/// everything else (routes, API, events) refers to.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub transport: TransportKind,
    pub direction: Direction,
    pub capabilities: CapabilityDescriptor,
}

/// Narrow transport-agnostic device interface. One implementation per
/// transport; no hierarchy beyond this trait.
pub trait MidiDevice: Send {
    fn info(&self) -> &DeviceInfo;

    fn state(&self) -> ConnectionState;

    fn open(&mut self) -> HubResult<()>;

    fn close(&mut self) -> HubResult<()>;

    /// Synchronous send of one message towards the transport.
    fn send(&mut self, message: &MidiMessage) -> HubResult<()>;

    /// Collect any input received since the last poll. Non-blocking for
    /// channel-backed transports; byte-stream transports may block in their
    /// dedicated reader task.
    fn poll(&mut self) -> HubResult<Vec<MidiEvent>>;

    /// Sends still queued towards the wire; the manager drains this before
    /// removal.
    fn pending_sends(&self) -> usize {
        0
    }
}
