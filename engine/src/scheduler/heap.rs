//! Priority-queue strategy: a min-heap by (due, seq) guarded by a mutex,
//! with a condvar waking the single dispatch task on submit. The task
//! sleeps until the head's due time, capped at 10 ms so a newly submitted
//! earlier deadline is picked up promptly.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};
use midi_hub_core::{Event, EventBus, HubError, HubResult, MidiClock, MidiMessage, Throttle};

use super::{
    Scheduler, ScheduledEvent, SinkFn, DISPATCH_EPSILON_US, MAX_DISPATCH_WAIT,
};

struct Shared {
    heap: BinaryHeap<Reverse<ScheduledEvent>>,
    stopped: bool,
}

pub struct HeapScheduler {
    shared: Mutex<Shared>,
    cv: Condvar,
    clock: MidiClock,
    sink: SinkFn,
    bus: EventBus,
    seq: AtomicU64,
    late: AtomicU64,
    late_since_report: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HeapScheduler {
    pub fn start(clock: MidiClock, sink: SinkFn, bus: EventBus) -> Arc<dyn Scheduler> {
        let scheduler = Arc::new(Self {
            shared: Mutex::new(Shared {
                heap: BinaryHeap::new(),
                stopped: false,
            }),
            cv: Condvar::new(),
            clock,
            sink,
            bus,
            seq: AtomicU64::new(0),
            late: AtomicU64::new(0),
            late_since_report: AtomicU64::new(0),
            worker: Mutex::new(None),
        });

        let runner = Arc::clone(&scheduler);
        let handle = std::thread::Builder::new()
            .name("sched-heap".to_string())
            .spawn(move || runner.run())
            .expect("failed to spawn scheduler task");
        *scheduler.worker.lock().expect("worker lock poisoned") = Some(handle);
        scheduler
    }

    fn run(&self) {
        debug!("heap scheduler dispatch task started");
        let mut late_throttle = Throttle::late_rate();
        loop {
            let mut batch = Vec::new();
            {
                let mut guard = self.shared.lock().expect("scheduler lock poisoned");
                if guard.stopped {
                    break;
                }
                let now = self.clock.now_us();
                while let Some(Reverse(head)) = guard.heap.peek() {
                    if head.due_us <= now + DISPATCH_EPSILON_US {
                        batch.push(guard.heap.pop().unwrap().0);
                    } else {
                        break;
                    }
                }
                if batch.is_empty() {
                    let wait = match guard.heap.peek() {
                        Some(Reverse(head)) => {
                            Duration::from_micros(head.due_us.saturating_sub(now))
                                .min(MAX_DISPATCH_WAIT)
                        }
                        None => MAX_DISPATCH_WAIT,
                    };
                    let (g, _) = self
                        .cv
                        .wait_timeout(guard, wait)
                        .expect("scheduler lock poisoned");
                    drop(g);
                    continue;
                }
            }
            self.dispatch(&batch, &mut late_throttle);
        }
        debug!("heap scheduler dispatch task stopped");
    }

    fn dispatch(&self, batch: &[ScheduledEvent], late_throttle: &mut Throttle) {
        let now = self.clock.now_us();
        for event in batch {
            if event.due_us + DISPATCH_EPSILON_US < now {
                self.late.fetch_add(1, Ordering::Relaxed);
                self.late_since_report.fetch_add(1, Ordering::Relaxed);
            }
            (self.sink)(event);
        }
        // Aggregated late-count reporting, at most once a second.
        if late_throttle.ready(now) {
            let count = self.late_since_report.swap(0, Ordering::Relaxed);
            if count > 0 {
                self.bus.publish(Event::SchedulerLate { count });
            }
        }
    }
}

impl Scheduler for HeapScheduler {
    fn submit(&self, sink_id: &str, message: MidiMessage, due_us: u64) -> HubResult<()> {
        let event = ScheduledEvent {
            due_us,
            sink_id: sink_id.to_string(),
            message,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        {
            let mut guard = self.shared.lock().expect("scheduler lock poisoned");
            if guard.stopped {
                return Err(HubError::InvalidState {
                    op: "submit",
                    state: "scheduler stopped".to_string(),
                });
            }
            guard.heap.push(Reverse(event));
        }
        self.cv.notify_one();
        Ok(())
    }

    fn pending(&self) -> usize {
        self.shared.lock().expect("scheduler lock poisoned").heap.len()
    }

    fn late_events(&self) -> u64 {
        self.late.load(Ordering::Relaxed)
    }

    fn drain(&self, deadline: Duration) -> HubResult<()> {
        let until = Instant::now() + deadline;
        // Flush everything now, in (due, seq) order, from the caller's
        // thread; due times in the future do not extend the wait.
        loop {
            let next = {
                let mut guard = self.shared.lock().expect("scheduler lock poisoned");
                guard.heap.pop()
            };
            match next {
                Some(Reverse(event)) => {
                    (self.sink)(&event);
                    if Instant::now() >= until {
                        let left = self.pending();
                        if left > 0 {
                            warn!("drain deadline hit with {left} event(s) pending");
                            return Err(HubError::DrainTimeout);
                        }
                    }
                }
                None => return Ok(()),
            }
        }
    }

    fn shutdown(&self) {
        {
            let mut guard = self.shared.lock().expect("scheduler lock poisoned");
            guard.stopped = true;
        }
        self.cv.notify_all();
        if let Some(handle) = self.worker.lock().expect("worker lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::CaptureSink;
    use super::*;

    #[test]
    fn dispatches_in_due_order() {
        let clock = MidiClock::new();
        let sink = CaptureSink::new();
        let scheduler = HeapScheduler::start(
            clock.clone(),
            sink.sink_fn(clock.clone()),
            EventBus::new(8),
        );

        let base = clock.now_us();
        let note = |n: u8| MidiMessage::NoteOn {
            channel: midi_hub_core::Channel::new(1).unwrap(),
            note: n,
            velocity: 100,
        };
        // Submitted out of order.
        scheduler.submit("out", note(62), base + 30_000).unwrap();
        scheduler.submit("out", note(60), base + 10_000).unwrap();
        scheduler.submit("out", note(61), base + 20_000).unwrap();

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(sink.notes(), vec![60, 61, 62]);
        scheduler.shutdown();
    }

    #[test]
    fn equal_deadlines_keep_fifo_order() {
        let clock = MidiClock::new();
        let sink = CaptureSink::new();
        let scheduler = HeapScheduler::start(
            clock.clone(),
            sink.sink_fn(clock.clone()),
            EventBus::new(8),
        );

        let due = clock.now_us() + 20_000;
        for n in [70, 71, 72, 73] {
            scheduler
                .submit(
                    "out",
                    MidiMessage::NoteOn {
                        channel: midi_hub_core::Channel::new(1).unwrap(),
                        note: n,
                        velocity: 1,
                    },
                    due,
                )
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(sink.notes(), vec![70, 71, 72, 73]);
        scheduler.shutdown();
    }

    #[test]
    fn past_due_dispatches_immediately_and_counts_late() {
        let clock = MidiClock::new();
        let sink = CaptureSink::new();
        let scheduler = HeapScheduler::start(
            clock.clone(),
            sink.sink_fn(clock.clone()),
            EventBus::new(8),
        );

        std::thread::sleep(Duration::from_millis(5));
        scheduler
            .submit("out", MidiMessage::all_notes_off(midi_hub_core::Channel::new(1).unwrap()), 0)
            .unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(sink.count(), 1);
        assert_eq!(scheduler.late_events(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn drain_flushes_far_future_events() {
        let clock = MidiClock::new();
        let sink = CaptureSink::new();
        let scheduler = HeapScheduler::start(
            clock.clone(),
            sink.sink_fn(clock.clone()),
            EventBus::new(8),
        );

        let far = clock.now_us() + 60_000_000;
        for n in 0..5u8 {
            scheduler
                .submit(
                    "out",
                    MidiMessage::NoteOff {
                        channel: midi_hub_core::Channel::new(1).unwrap(),
                        note: 60 + n,
                        velocity: 0,
                    },
                    far + n as u64,
                )
                .unwrap();
        }
        scheduler.drain(Duration::from_secs(1)).unwrap();
        assert_eq!(sink.count(), 5);
        assert_eq!(scheduler.pending(), 0);
        scheduler.shutdown();
    }

    #[test]
    fn submit_after_shutdown_is_invalid_state() {
        let clock = MidiClock::new();
        let sink = CaptureSink::new();
        let scheduler = HeapScheduler::start(
            clock.clone(),
            sink.sink_fn(clock.clone()),
            EventBus::new(8),
        );
        scheduler.shutdown();
        assert!(matches!(
            scheduler.submit(
                "out",
                MidiMessage::all_notes_off(midi_hub_core::Channel::new(1).unwrap()),
                0
            ),
            Err(HubError::InvalidState { .. })
        ));
    }
}
