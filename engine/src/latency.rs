//! Per-instrument latency compensation. Hardware synths and network sinks
//! respond at different speeds; subtracting a per-device delay from the
//! scheduled timestamp lines the audible result back up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use midi_hub_core::{Channel, MessageKind, MidiMessage};

/// Delay lookup for one sink device: most specific match wins
/// ((kind, channel), then kind, then the device default).
#[derive(Debug, Clone, Default)]
pub struct LatencyProfile {
    pub default_us: u64,
    pub by_kind: HashMap<MessageKind, u64>,
    pub by_kind_channel: HashMap<(MessageKind, u8), u64>,
    /// Informational only; no scheduling decision keys off it.
    pub jitter_us: u64,
}

impl LatencyProfile {
    pub fn fixed(default_us: u64) -> Self {
        Self {
            default_us,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, kind: MessageKind, channel: Option<Channel>) -> u64 {
        if let Some(ch) = channel {
            if let Some(&us) = self.by_kind_channel.get(&(kind, ch.number())) {
                return us;
            }
        }
        self.by_kind.get(&kind).copied().unwrap_or(self.default_us)
    }
}

/// Applies profiles to outgoing timestamps and counts events that were
/// already late by the time they were compensated.
#[derive(Debug, Default)]
pub struct LatencyCompensator {
    profiles: RwLock<HashMap<String, LatencyProfile>>,
    late: AtomicU64,
}

impl LatencyCompensator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_profile(&self, sink_id: impl Into<String>, profile: LatencyProfile) {
        self.profiles
            .write()
            .expect("profiles lock poisoned")
            .insert(sink_id.into(), profile);
    }

    pub fn remove_profile(&self, sink_id: &str) {
        self.profiles
            .write()
            .expect("profiles lock poisoned")
            .remove(sink_id);
    }

    /// `(adjusted_due, late)`. A late event is not delayed further; the
    /// scheduler dispatches it immediately and it is counted here.
    pub fn adjust(
        &self,
        sink_id: &str,
        message: &MidiMessage,
        due_us: u64,
        now_us: u64,
    ) -> (u64, bool) {
        let delay = self
            .profiles
            .read()
            .expect("profiles lock poisoned")
            .get(sink_id)
            .map(|p| p.delay_for(message.kind(), message.channel()))
            .unwrap_or(0);
        let adjusted = due_us.saturating_sub(delay);
        let late = adjusted < now_us;
        if late {
            self.late.fetch_add(1, Ordering::Relaxed);
        }
        (adjusted, late)
    }

    pub fn late_events(&self) -> u64 {
        self.late.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on() -> MidiMessage {
        MidiMessage::NoteOn {
            channel: Channel::new(1).unwrap(),
            note: 60,
            velocity: 100,
        }
    }

    #[test]
    fn most_specific_entry_wins() {
        let mut profile = LatencyProfile::fixed(1_000);
        profile.by_kind.insert(MessageKind::NoteOn, 2_000);
        profile
            .by_kind_channel
            .insert((MessageKind::NoteOn, 1), 3_000);

        assert_eq!(
            profile.delay_for(MessageKind::NoteOn, Some(Channel::new(1).unwrap())),
            3_000
        );
        assert_eq!(
            profile.delay_for(MessageKind::NoteOn, Some(Channel::new(2).unwrap())),
            2_000
        );
        assert_eq!(profile.delay_for(MessageKind::ControlChange, None), 1_000);
    }

    #[test]
    fn adjust_subtracts_delay() {
        let comp = LatencyCompensator::new();
        comp.set_profile("synth", LatencyProfile::fixed(5_000));
        let (due, late) = comp.adjust("synth", &note_on(), 100_000, 0);
        assert_eq!(due, 95_000);
        assert!(!late);
    }

    #[test]
    fn unprofiled_sink_passes_through() {
        let comp = LatencyCompensator::new();
        let (due, late) = comp.adjust("unknown", &note_on(), 42_000, 0);
        assert_eq!(due, 42_000);
        assert!(!late);
    }

    #[test]
    fn late_events_are_counted() {
        let comp = LatencyCompensator::new();
        comp.set_profile("synth", LatencyProfile::fixed(10_000));
        let (due, late) = comp.adjust("synth", &note_on(), 5_000, 50_000);
        assert_eq!(due, 0);
        assert!(late);
        assert_eq!(comp.late_events(), 1);
    }
}
