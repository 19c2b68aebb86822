//! Ordered transform pipeline. Each stage is a pure function over
//! (message, now, local state); stages may emit zero or more messages and
//! the chain feeds each stage's output into the next. Stages that hold
//! time-based state (arpeggiator, delay) release due events on `tick`.

mod arpeggiator;
mod basic;
mod chord;
mod delay;

pub use arpeggiator::{ArpPattern, Arpeggiator};
pub use basic::{ChannelFilter, ChannelSet, CurveShape, Transpose, VelocityCurve};
pub use chord::{Chord, Harmonizer, ScaleKind};
pub use delay::Delay;

use midi_hub_core::MidiEvent;

/// Flat set of processor variants; state lives inside each variant and is
/// only ever touched from the router path that owns the chain.
#[derive(Debug, Clone)]
pub enum Processor {
    ChannelFilter(ChannelFilter),
    Transpose(Transpose),
    Velocity(VelocityCurve),
    Arpeggiator(Arpeggiator),
    Delay(Delay),
    Chord(Chord),
    Harmonizer(Harmonizer),
}

impl Processor {
    pub fn process(&mut self, event: &MidiEvent) -> Vec<MidiEvent> {
        match self {
            Processor::ChannelFilter(p) => p.process(event),
            Processor::Transpose(p) => p.process(event),
            Processor::Velocity(p) => p.process(event),
            Processor::Arpeggiator(p) => p.process(event),
            Processor::Delay(p) => p.process(event),
            Processor::Chord(p) => p.process(event),
            Processor::Harmonizer(p) => p.process(event),
        }
    }

    /// Release events that have become due. Stateless stages return
    /// nothing.
    pub fn tick(&mut self, now_us: u64) -> Vec<MidiEvent> {
        match self {
            Processor::Arpeggiator(p) => p.tick(now_us),
            Processor::Delay(p) => p.tick(now_us),
            _ => Vec::new(),
        }
    }

    /// Clear local state. Stages that have a NoteOn sounding emit the
    /// matching NoteOff so no note is left hanging.
    pub fn reset(&mut self, now_us: u64) -> Vec<MidiEvent> {
        match self {
            Processor::Arpeggiator(p) => p.reset(now_us),
            Processor::Delay(p) => p.reset(now_us),
            _ => Vec::new(),
        }
    }
}

/// A named, ordered list of processors with chain-local state.
#[derive(Debug, Clone, Default)]
pub struct ProcessorChain {
    id: String,
    stages: Vec<Processor>,
}

/// Run `events` through every stage in `stages`, in order.
fn cascade(stages: &mut [Processor], events: Vec<MidiEvent>) -> Vec<MidiEvent> {
    let mut current = events;
    for stage in stages {
        if current.is_empty() {
            break;
        }
        let mut next = Vec::new();
        for event in &current {
            next.extend(stage.process(event));
        }
        current = next;
    }
    current
}

impl ProcessorChain {
    pub fn new(id: impl Into<String>, stages: Vec<Processor>) -> Self {
        Self {
            id: id.into(),
            stages,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn process(&mut self, event: &MidiEvent) -> Vec<MidiEvent> {
        cascade(&mut self.stages, vec![event.clone()])
    }

    /// Tick every stage; what stage N releases flows through stages N+1..
    pub fn tick(&mut self, now_us: u64) -> Vec<MidiEvent> {
        let mut out = Vec::new();
        for i in 0..self.stages.len() {
            let (head, tail) = self.stages.split_at_mut(i + 1);
            let released = head[i].tick(now_us);
            if !released.is_empty() {
                out.extend(cascade(tail, released));
            }
        }
        out
    }

    /// Reset every stage. Released NoteOffs flow through the downstream
    /// stages so they reach the sink in the same shape live notes did.
    pub fn reset(&mut self, now_us: u64) -> Vec<MidiEvent> {
        let mut out = Vec::new();
        for i in 0..self.stages.len() {
            let (head, tail) = self.stages.split_at_mut(i + 1);
            let released = head[i].reset(now_us);
            if !released.is_empty() {
                out.extend(cascade(tail, released));
            }
        }
        out
    }
}
