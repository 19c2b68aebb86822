//! Timestamped dispatch to device sinks. Two interchangeable strategies
//! behind one interface: a condvar-driven priority queue and a 1 ms
//! time-bucket ring fed from a lock-free SPSC queue. Selection is
//! process-wide at configuration time.

mod heap;
mod ring;

pub use heap::HeapScheduler;
pub use ring::RingScheduler;

use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use midi_hub_core::{EventBus, HubError, HubResult, MidiClock, MidiMessage};

/// Events due within this window of "now" dispatch immediately.
pub const DISPATCH_EPSILON_US: u64 = 500;

/// The dispatch task re-evaluates at least this often, so a submit with an
/// earlier deadline never waits longer than this.
pub const MAX_DISPATCH_WAIT: Duration = Duration::from_millis(10);

/// Default wall-clock bound for `drain`.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(1);

/// One queued dispatch. Ordered by due time, FIFO among equal deadlines
/// via the per-scheduler sequence number.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub due_us: u64,
    pub sink_id: String,
    pub message: MidiMessage,
    pub seq: u64,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.due_us == other.due_us && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due_us
            .cmp(&other.due_us)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Callback delivering a due event to its sink (the device manager).
pub type SinkFn = Arc<dyn Fn(&ScheduledEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStrategy {
    PriorityQueue,
    RingBuffer,
}

impl FromStr for SchedulerStrategy {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heap" | "priority" | "priority_queue" => Ok(SchedulerStrategy::PriorityQueue),
            "ring" | "ring_buffer" => Ok(SchedulerStrategy::RingBuffer),
            other => Err(HubError::UnsupportedFormat(format!(
                "scheduler strategy '{other}'"
            ))),
        }
    }
}

/// Common scheduler interface. Both implementations guarantee monotone
/// non-decreasing dispatch order, FIFO among equal deadlines, and a
/// bounded `drain`.
pub trait Scheduler: Send + Sync {
    /// Queue a message for `sink_id` at `due_us`. Never blocks beyond a
    /// bounded retry; overflow reports `BackpressureDropped`.
    fn submit(&self, sink_id: &str, message: MidiMessage, due_us: u64) -> HubResult<()>;

    fn pending(&self) -> usize;

    /// Events dispatched after their due time had already passed.
    fn late_events(&self) -> u64;

    /// Dispatch everything still queued, regardless of due time, within
    /// `deadline`.
    fn drain(&self, deadline: Duration) -> HubResult<()>;

    fn shutdown(&self);
}

/// Construct and start the configured strategy.
pub fn start_scheduler(
    strategy: SchedulerStrategy,
    clock: MidiClock,
    sink: SinkFn,
    bus: EventBus,
) -> Arc<dyn Scheduler> {
    match strategy {
        SchedulerStrategy::PriorityQueue => HeapScheduler::start(clock, sink, bus),
        SchedulerStrategy::RingBuffer => RingScheduler::start(clock, sink, bus),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records dispatches with their wall-clock arrival.
    #[derive(Default)]
    pub struct CaptureSink {
        pub dispatched: Mutex<Vec<(u64, String, MidiMessage)>>,
    }

    impl CaptureSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn sink_fn(self: &Arc<Self>, clock: MidiClock) -> SinkFn {
            let me = Arc::clone(self);
            Arc::new(move |ev: &ScheduledEvent| {
                me.dispatched.lock().unwrap().push((
                    clock.now_us(),
                    ev.sink_id.clone(),
                    ev.message.clone(),
                ));
            })
        }

        pub fn count(&self) -> usize {
            self.dispatched.lock().unwrap().len()
        }

        pub fn notes(&self) -> Vec<u8> {
            self.dispatched
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, _, m)| match m {
                    MidiMessage::NoteOn { note, .. } => Some(*note),
                    _ => None,
                })
                .collect()
        }
    }
}
