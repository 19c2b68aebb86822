//! Ring-buffer strategy: producers hand events to a lock-free SPSC ring;
//! the dispatch task bins them into 1 ms time buckets and walks a cursor
//! across the ring once per millisecond. Bounded everywhere: a full ring
//! or bucket drops the newest event with `BackpressureDropped` after a
//! 1 ms retry, keeping what is already queued.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};
use midi_hub_core::spsc;
use midi_hub_core::{Event, EventBus, HubError, HubResult, MidiClock, MidiMessage, Pool, Throttle};

use super::{Scheduler, ScheduledEvent, SinkFn, DISPATCH_EPSILON_US};

/// Number of 1 ms buckets; must be a power of two.
const BUCKET_COUNT: usize = 4096;
/// Events per bucket before overflow.
const BUCKET_CAP: usize = 64;
/// Capacity of the feeding SPSC ring.
const FEED_CAPACITY: usize = 4096;
/// Bounded submit retry before reporting backpressure.
const SUBMIT_RETRY: Duration = Duration::from_millis(1);

pub struct RingScheduler {
    producer: Mutex<spsc::Producer<ScheduledEvent>>,
    clock: MidiClock,
    seq: AtomicU64,
    late: AtomicU64,
    late_since_report: AtomicU64,
    queued: AtomicUsize,
    stop: AtomicBool,
    draining: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Dispatcher {
    consumer: spsc::Consumer<ScheduledEvent>,
    buckets: Vec<Vec<ScheduledEvent>>,
    /// Events beyond the ring horizon, keyed by their millisecond.
    spill: BTreeMap<u64, Vec<ScheduledEvent>>,
    cursor_ms: u64,
    sink: SinkFn,
    bus: EventBus,
    late_throttle: Throttle,
    /// Recycles drained bucket vectors so the steady state allocates
    /// nothing per millisecond.
    bucket_pool: Pool<Vec<ScheduledEvent>>,
}

impl RingScheduler {
    pub fn start(clock: MidiClock, sink: SinkFn, bus: EventBus) -> Arc<dyn Scheduler> {
        let (producer, consumer) = spsc::ring(FEED_CAPACITY);
        let scheduler = Arc::new(Self {
            producer: Mutex::new(producer),
            clock: clock.clone(),
            seq: AtomicU64::new(0),
            late: AtomicU64::new(0),
            late_since_report: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let runner = Arc::clone(&scheduler);
        let mut dispatcher = Dispatcher {
            consumer,
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            spill: BTreeMap::new(),
            cursor_ms: clock.now_us() / 1000,
            sink,
            bus,
            late_throttle: Throttle::late_rate(),
            bucket_pool: Pool::new(64),
        };
        let handle = std::thread::Builder::new()
            .name("sched-ring".to_string())
            .spawn(move || runner.run(&mut dispatcher))
            .expect("failed to spawn scheduler task");
        *scheduler.worker.lock().expect("worker lock poisoned") = Some(handle);
        scheduler
    }

    fn run(&self, d: &mut Dispatcher) {
        debug!("ring scheduler dispatch task started");
        while !self.stop.load(Ordering::SeqCst) {
            self.ingest(d);
            if self.draining.load(Ordering::SeqCst) {
                self.flush_all(d);
                continue;
            }
            self.advance(d);
            std::thread::sleep(Duration::from_micros(500));
        }
        debug!("ring scheduler dispatch task stopped");
    }

    /// Pull newly submitted events out of the SPSC ring into buckets.
    fn ingest(&self, d: &mut Dispatcher) {
        while let Some(event) = d.consumer.pop() {
            let due_ms = event.due_us / 1000;
            if due_ms <= d.cursor_ms {
                // Already past its bucket: dispatch now, marked late.
                self.dispatch_one(d, &event);
            } else if due_ms < d.cursor_ms + BUCKET_COUNT as u64 {
                let bucket = &mut d.buckets[(due_ms as usize) & (BUCKET_COUNT - 1)];
                if bucket.len() >= BUCKET_CAP {
                    // Keep the oldest, report the newcomer.
                    warn!("{}", HubError::BackpressureDropped);
                    self.queued.fetch_sub(1, Ordering::Relaxed);
                } else {
                    bucket.push(event);
                }
            } else {
                d.spill.entry(due_ms).or_default().push(event);
            }
        }
    }

    /// Walk the cursor forward, draining each elapsed bucket in order.
    fn advance(&self, d: &mut Dispatcher) {
        let now_ms = self.clock.now_us() / 1000;
        while d.cursor_ms < now_ms {
            d.cursor_ms += 1;
            let index = (d.cursor_ms as usize) & (BUCKET_COUNT - 1);
            let mut due = d.bucket_pool.take();
            std::mem::swap(&mut due, &mut d.buckets[index]);
            due.sort();
            for event in &due {
                self.dispatch_one(d, event);
            }
            due.clear();
            d.bucket_pool.put(due);

            // Pull spilled events that now fit inside the horizon.
            let horizon = d.cursor_ms + BUCKET_COUNT as u64;
            let inside: Vec<u64> = d.spill.range(..horizon).map(|(&ms, _)| ms).collect();
            for ms in inside {
                if let Some(events) = d.spill.remove(&ms) {
                    let bucket = &mut d.buckets[(ms as usize) & (BUCKET_COUNT - 1)];
                    bucket.extend(events);
                }
            }
        }
    }

    /// Drain mode: everything queued goes out now, in (due, seq) order.
    fn flush_all(&self, d: &mut Dispatcher) {
        let mut all: Vec<ScheduledEvent> = Vec::new();
        for bucket in d.buckets.iter_mut() {
            all.append(bucket);
        }
        let spill = std::mem::take(&mut d.spill);
        for (_, mut events) in spill {
            all.append(&mut events);
        }
        while let Some(event) = d.consumer.pop() {
            all.push(event);
        }
        all.sort();
        for event in &all {
            self.dispatch_one(d, event);
        }
    }

    fn dispatch_one(&self, d: &mut Dispatcher, event: &ScheduledEvent) {
        let now = self.clock.now_us();
        if event.due_us + DISPATCH_EPSILON_US < now {
            self.late.fetch_add(1, Ordering::Relaxed);
            self.late_since_report.fetch_add(1, Ordering::Relaxed);
        }
        (d.sink)(event);
        self.queued.fetch_sub(1, Ordering::Relaxed);
        if d.late_throttle.ready(now) {
            let count = self.late_since_report.swap(0, Ordering::Relaxed);
            if count > 0 {
                d.bus.publish(Event::SchedulerLate { count });
            }
        }
    }
}

impl Scheduler for RingScheduler {
    fn submit(&self, sink_id: &str, message: MidiMessage, due_us: u64) -> HubResult<()> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(HubError::InvalidState {
                op: "submit",
                state: "scheduler stopped".to_string(),
            });
        }
        let mut event = ScheduledEvent {
            due_us,
            sink_id: sink_id.to_string(),
            message,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        let deadline = Instant::now() + SUBMIT_RETRY;
        let mut producer = self.producer.lock().expect("producer lock poisoned");
        loop {
            match producer.push(event) {
                Ok(()) => {
                    self.queued.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(back) => {
                    if Instant::now() >= deadline {
                        warn!("{}", HubError::BackpressureDropped);
                        return Err(HubError::BackpressureDropped);
                    }
                    event = back;
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
    }

    fn pending(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    fn late_events(&self) -> u64 {
        self.late.load(Ordering::Relaxed)
    }

    fn drain(&self, deadline: Duration) -> HubResult<()> {
        self.draining.store(true, Ordering::SeqCst);
        let until = Instant::now() + deadline;
        while self.queued.load(Ordering::Relaxed) > 0 {
            if Instant::now() >= until {
                self.draining.store(false, Ordering::SeqCst);
                warn!(
                    "drain deadline hit with {} event(s) pending",
                    self.queued.load(Ordering::Relaxed)
                );
                return Err(HubError::DrainTimeout);
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        self.draining.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().expect("worker lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::CaptureSink;
    use super::*;
    use midi_hub_core::Channel;

    fn note(n: u8) -> MidiMessage {
        MidiMessage::NoteOn {
            channel: Channel::new(1).unwrap(),
            note: n,
            velocity: 100,
        }
    }

    #[test]
    fn dispatches_in_due_order() {
        let clock = MidiClock::new();
        let sink = CaptureSink::new();
        let scheduler = RingScheduler::start(
            clock.clone(),
            sink.sink_fn(clock.clone()),
            EventBus::new(8),
        );

        let base = clock.now_us();
        scheduler.submit("out", note(67), base + 40_000).unwrap();
        scheduler.submit("out", note(60), base + 15_000).unwrap();
        scheduler.submit("out", note(64), base + 25_000).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(sink.notes(), vec![60, 64, 67]);
        scheduler.shutdown();
    }

    #[test]
    fn same_millisecond_keeps_submit_order() {
        let clock = MidiClock::new();
        let sink = CaptureSink::new();
        let scheduler = RingScheduler::start(
            clock.clone(),
            sink.sink_fn(clock.clone()),
            EventBus::new(8),
        );

        let due = clock.now_us() + 20_000;
        for n in [50, 51, 52] {
            scheduler.submit("out", note(n), due).unwrap();
        }
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(sink.notes(), vec![50, 51, 52]);
        scheduler.shutdown();
    }

    #[test]
    fn far_future_events_spill_and_drain() {
        let clock = MidiClock::new();
        let sink = CaptureSink::new();
        let scheduler = RingScheduler::start(
            clock.clone(),
            sink.sink_fn(clock.clone()),
            EventBus::new(8),
        );

        // Beyond the 4096 ms horizon.
        let far = clock.now_us() + 10_000_000;
        scheduler.submit("out", note(40), far).unwrap();
        scheduler.submit("out", note(41), far + 1).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(sink.count(), 0);

        scheduler.drain(Duration::from_secs(1)).unwrap();
        assert_eq!(sink.notes(), vec![40, 41]);
        scheduler.shutdown();
    }

    #[test]
    fn past_due_submissions_count_late() {
        let clock = MidiClock::new();
        let sink = CaptureSink::new();
        let scheduler = RingScheduler::start(
            clock.clone(),
            sink.sink_fn(clock.clone()),
            EventBus::new(8),
        );
        std::thread::sleep(Duration::from_millis(5));
        scheduler.submit("out", note(30), 0).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.count(), 1);
        assert_eq!(scheduler.late_events(), 1);
        scheduler.shutdown();
    }
}
