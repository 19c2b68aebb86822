use log::trace;
use midi_hub_core::{Channel, MidiEvent, MidiMessage};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpPattern {
    Up,
    Down,
    UpDown,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeldNote {
    channel: Channel,
    note: u8,
    velocity: u8,
}

/// Consumes NoteOn/NoteOff and replays the held set as a pattern at a
/// fixed step interval. The first step fires at the timestamp of the
/// NoteOn that started the phrase; one note sounds at a time.
#[derive(Debug, Clone)]
pub struct Arpeggiator {
    pattern: ArpPattern,
    interval_us: u64,
    /// Insertion order preserved; patterns order by pitch on the fly.
    held: Vec<HeldNote>,
    step: usize,
    next_fire_us: Option<u64>,
    sounding: Option<(Channel, u8)>,
}

impl Arpeggiator {
    pub fn new(pattern: ArpPattern, interval_us: u64) -> Self {
        Self {
            pattern,
            interval_us: interval_us.max(1_000),
            held: Vec::new(),
            step: 0,
            next_fire_us: None,
            sounding: None,
        }
    }

    /// Step once per `divisions`th of a beat at the given tempo.
    pub fn per_beat(pattern: ArpPattern, us_per_quarter: u32, divisions: u32) -> Self {
        Self::new(pattern, (us_per_quarter / divisions.max(1)) as u64)
    }

    pub fn process(&mut self, event: &MidiEvent) -> Vec<MidiEvent> {
        match &event.message {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => {
                let held = HeldNote {
                    channel: *channel,
                    note: *note,
                    velocity: *velocity,
                };
                if !self
                    .held
                    .iter()
                    .any(|h| h.note == held.note && h.channel == held.channel)
                {
                    self.held.push(held);
                }
                if self.next_fire_us.is_none() {
                    self.next_fire_us = Some(event.timestamp_us);
                }
                Vec::new()
            }
            MidiMessage::NoteOff { channel, note, .. } => {
                self.held
                    .retain(|h| !(h.note == *note && h.channel == *channel));
                Vec::new()
            }
            _ => vec![event.clone()],
        }
    }

    pub fn tick(&mut self, now_us: u64) -> Vec<MidiEvent> {
        let mut out = Vec::new();
        while let Some(fire) = self.next_fire_us {
            if fire > now_us {
                break;
            }
            // Close whatever is sounding before the next step.
            if let Some((channel, note)) = self.sounding.take() {
                out.push(MidiEvent::new(
                    fire,
                    MidiMessage::NoteOff {
                        channel,
                        note,
                        velocity: 0,
                    },
                ));
            }
            if self.held.is_empty() {
                self.next_fire_us = None;
                break;
            }

            let next = self.pick(self.step);
            trace!("arp step {} -> note {}", self.step, next.note);
            out.push(MidiEvent::new(
                fire,
                MidiMessage::NoteOn {
                    channel: next.channel,
                    note: next.note,
                    velocity: next.velocity,
                },
            ));
            self.sounding = Some((next.channel, next.note));
            self.step = self.step.wrapping_add(1);
            self.next_fire_us = Some(fire + self.interval_us);
        }
        out
    }

    pub fn reset(&mut self, now_us: u64) -> Vec<MidiEvent> {
        self.held.clear();
        self.step = 0;
        self.next_fire_us = None;
        match self.sounding.take() {
            Some((channel, note)) => vec![MidiEvent::new(
                now_us,
                MidiMessage::NoteOff {
                    channel,
                    note,
                    velocity: 0,
                },
            )],
            None => Vec::new(),
        }
    }

    fn pick(&self, step: usize) -> HeldNote {
        let mut by_pitch: Vec<HeldNote> = self.held.clone();
        by_pitch.sort_by_key(|h| h.note);
        let len = by_pitch.len();
        let index = match self.pattern {
            ArpPattern::Up => step % len,
            ArpPattern::Down => len - 1 - (step % len),
            ArpPattern::UpDown => {
                if len == 1 {
                    0
                } else {
                    let period = 2 * len - 2;
                    let phase = step % period;
                    if phase < len {
                        phase
                    } else {
                        period - phase
                    }
                }
            }
            ArpPattern::Random => rand::thread_rng().gen_range(0..len),
        };
        by_pitch[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(at_us: u64, note: u8) -> MidiEvent {
        MidiEvent::new(
            at_us,
            MidiMessage::NoteOn {
                channel: Channel::new(1).unwrap(),
                note,
                velocity: 100,
            },
        )
    }

    fn emitted_note_ons(events: &[MidiEvent]) -> Vec<(u64, u8)> {
        events
            .iter()
            .filter_map(|e| match e.message {
                MidiMessage::NoteOn { note, .. } => Some((e.timestamp_us, note)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn up_pattern_at_120_bpm() {
        // Quarter-note steps at 120 BPM = one step each 500 ms.
        let mut arp = Arpeggiator::new(ArpPattern::Up, 500_000);
        arp.process(&note_on(0, 60));
        arp.process(&note_on(10_000, 64));
        arp.process(&note_on(20_000, 67));

        // Drive ticks up to t = 2s the way the router loop would.
        let mut emitted = Vec::new();
        let mut t = 0u64;
        while t <= 2_000_000 {
            emitted.extend(arp.tick(t));
            t += 1_000;
        }

        let ons = emitted_note_ons(&emitted);
        assert_eq!(
            ons,
            vec![
                (0, 60),
                (500_000, 64),
                (1_000_000, 67),
                (1_500_000, 60),
                (2_000_000, 64),
            ]
        );
        // Each NoteOn is preceded by the previous step's NoteOff.
        let offs = emitted
            .iter()
            .filter(|e| matches!(e.message, MidiMessage::NoteOff { .. }))
            .count();
        assert_eq!(offs, 4);
    }

    #[test]
    fn down_pattern_reverses_pitch_order() {
        let mut arp = Arpeggiator::new(ArpPattern::Down, 100_000);
        arp.process(&note_on(0, 60));
        arp.process(&note_on(0, 64));
        arp.process(&note_on(0, 67));
        let mut emitted = Vec::new();
        for t in [0, 100_000, 200_000] {
            emitted.extend(arp.tick(t));
        }
        assert_eq!(
            emitted_note_ons(&emitted)
                .iter()
                .map(|&(_, n)| n)
                .collect::<Vec<_>>(),
            vec![67, 64, 60]
        );
    }

    #[test]
    fn updown_pattern_bounces() {
        let mut arp = Arpeggiator::new(ArpPattern::UpDown, 100_000);
        for n in [60, 64, 67] {
            arp.process(&note_on(0, n));
        }
        let mut notes = Vec::new();
        for step in 0..6 {
            notes.extend(
                emitted_note_ons(&arp.tick(step * 100_000))
                    .iter()
                    .map(|&(_, n)| n),
            );
        }
        assert_eq!(notes, vec![60, 64, 67, 64, 60, 64]);
    }

    #[test]
    fn releasing_all_keys_stops_the_pattern_with_a_note_off() {
        let mut arp = Arpeggiator::new(ArpPattern::Up, 100_000);
        arp.process(&note_on(0, 60));
        assert_eq!(arp.tick(0).len(), 1);

        arp.process(&MidiEvent::new(
            50_000,
            MidiMessage::NoteOff {
                channel: Channel::new(1).unwrap(),
                note: 60,
                velocity: 0,
            },
        ));
        let out = arp.tick(100_000);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].message, MidiMessage::NoteOff { note: 60, .. }));
        // Nothing further fires.
        assert!(arp.tick(500_000).is_empty());
    }

    #[test]
    fn reset_releases_the_sounding_note() {
        let mut arp = Arpeggiator::new(ArpPattern::Up, 100_000);
        arp.process(&note_on(0, 62));
        arp.tick(0);
        let out = arp.reset(5_000);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].message, MidiMessage::NoteOff { note: 62, .. }));
        assert!(arp.tick(1_000_000).is_empty());
    }

    #[test]
    fn non_note_messages_pass_through() {
        let mut arp = Arpeggiator::new(ArpPattern::Up, 100_000);
        let cc = MidiEvent::new(
            0,
            MidiMessage::ControlChange {
                channel: Channel::new(1).unwrap(),
                controller: 1,
                value: 64,
            },
        );
        assert_eq!(arp.process(&cc), vec![cc.clone()]);
    }
}
