pub mod control;
pub mod journal;
pub mod packet;
pub mod session;

pub use control::ControlMessage;
pub use journal::{Journal, JournalEntry, JOURNAL_HISTORY};
pub use packet::{RtpHeader, RtpMidiPacket, TimedCommand, RTP_MIDI_PAYLOAD_TYPE};
pub use session::{HandleOutcome, RtpMidiSession, SessionEvent, SessionState, HANDSHAKE_TIMEOUT_US};
