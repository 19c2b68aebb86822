use std::fmt;

/// Error kinds shared by every stage of the MIDI pipeline.
///
/// Parse failures on input are logged and dropped per message; transport
/// failures move the device into the `Error` state; state-machine violations
/// are returned synchronously to the caller.
#[derive(Debug)]
pub enum HubError {
    /// Input ended before a complete message/chunk/file could be read.
    Truncated,
    /// A container did not start with the expected magic bytes.
    BadMagic,
    /// The format is recognized but not supported by this build.
    UnsupportedFormat(String),
    /// A meta event type we do not interpret. Non-fatal; the payload is
    /// preserved as opaque bytes by the SMF codec.
    UnknownMetaEvent(u8),
    /// MIDI channels are 1-based, 1..=16.
    ChannelOutOfRange(u8),
    /// Frame-level validation failed (bad framing, 7-bit violation, ...).
    MalformedPayload(String),
    /// A multi-chunk SysEx transfer never completed within the timeout.
    IncompleteFrame { device_id: String },
    /// The underlying transport is gone; the device moves to `Error` state.
    TransportClosed,
    /// Sequence gap on a lossy transport that the journal could not repair.
    PacketLoss(u32),
    /// A bounded queue rejected an event after the bounded retry.
    BackpressureDropped,
    /// `drain()` did not complete within its wall-clock deadline.
    DrainTimeout,
    /// A scheduled event whose due time had already passed at dispatch.
    LatePacket,
    /// Lookup failure for a named entity (device, route, preset, ...).
    NotFound { entity: &'static str, id: String },
    /// An operation was requested in a state that does not allow it.
    InvalidState { op: &'static str, state: String },
    /// IO error from a file or socket.
    Io(std::io::Error),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::Truncated => write!(f, "truncated input"),
            HubError::BadMagic => write!(f, "bad magic bytes"),
            HubError::UnsupportedFormat(what) => write!(f, "unsupported format: {what}"),
            HubError::UnknownMetaEvent(t) => write!(f, "unknown meta event type 0x{t:02X}"),
            HubError::ChannelOutOfRange(ch) => write!(f, "channel {ch} out of range 1..=16"),
            HubError::MalformedPayload(why) => write!(f, "malformed payload: {why}"),
            HubError::IncompleteFrame { device_id } => {
                write!(f, "incomplete SysEx frame from device {device_id}")
            }
            HubError::TransportClosed => write!(f, "transport closed"),
            HubError::PacketLoss(n) => write!(f, "{n} packet(s) lost"),
            HubError::BackpressureDropped => write!(f, "event dropped due to backpressure"),
            HubError::DrainTimeout => write!(f, "drain did not complete within deadline"),
            HubError::LatePacket => write!(f, "event dispatched after its due time"),
            HubError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            HubError::InvalidState { op, state } => {
                write!(f, "operation {op} not allowed in state {state}")
            }
            HubError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for HubError {}

impl From<std::io::Error> for HubError {
    fn from(e: std::io::Error) -> Self {
        HubError::Io(e)
    }
}

pub type HubResult<T> = Result<T, HubError>;
