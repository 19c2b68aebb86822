//! Shared foundations of the MIDI hub: monotonic clock, typed message
//! model, error kinds, event bus and the lock-free primitives used by the
//! realtime pipeline.

pub mod clock;
pub mod error;
pub mod event_bus;
pub mod message;
pub mod pool;
pub mod spsc;

pub use clock::{Anchor, MidiClock, TickConverter};
pub use error::{HubError, HubResult};
pub use event_bus::{Event, EventBus, Throttle};
pub use message::{Channel, MessageKind, MidiEvent, MidiMessage, RealtimeMessage};
pub use pool::Pool;

use serde::{Deserialize, Serialize};

/// Player transport state. Lives here rather than in the engine crate so
/// bus events can carry it without a dependency cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Stopped,
    Loaded,
    Playing,
    Paused,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportState::Stopped => "stopped",
            TransportState::Loaded => "loaded",
            TransportState::Playing => "playing",
            TransportState::Paused => "paused",
        };
        f.write_str(s)
    }
}
