use log::trace;
use tokio::sync::broadcast;

use crate::TransportState;

/// State-change notifications fanned out to observers. Publication is
/// non-blocking; slow subscribers lag and drop per broadcast semantics
/// rather than stalling the publisher.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceConnected { device_id: String },
    DeviceDisconnected { device_id: String },
    DeviceError { device_id: String, kind: String },
    PlayerPosition { tick: u64, wallclock_us: u64 },
    PlayerState { state: TransportState },
    RouteChanged { route_id: String },
    SysExReceived { device_id: String, frame: Vec<u8> },
    SchedulerLate { count: u64 },
}

/// Broadcast-backed event bus. Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. A send error only means there is currently no
    /// subscriber, which is not a fault.
    pub fn publish(&self, event: Event) {
        if self.tx.send(event).is_err() {
            trace!("event published with no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Rate limiter for high-frequency topics (player position <= 20 Hz,
/// late-event counts <= 1 Hz). Driven by caller timestamps so it behaves
/// deterministically under test clocks.
#[derive(Debug)]
pub struct Throttle {
    min_interval_us: u64,
    last_us: Option<u64>,
}

impl Throttle {
    pub fn new(min_interval_us: u64) -> Self {
        Self {
            min_interval_us,
            last_us: None,
        }
    }

    /// Max 20 Hz.
    pub fn position_rate() -> Self {
        Self::new(50_000)
    }

    /// Max 1 Hz.
    pub fn late_rate() -> Self {
        Self::new(1_000_000)
    }

    /// True when enough time has passed since the last accepted publish;
    /// accepting advances the window.
    pub fn ready(&mut self, now_us: u64) -> bool {
        match self.last_us {
            Some(last) if now_us < last.saturating_add(self.min_interval_us) => false,
            _ => {
                self.last_us = Some(now_us);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_delivers_to_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(Event::RouteChanged {
            route_id: "r1".into(),
        });
        let ev = rx.try_recv().unwrap();
        assert_eq!(
            ev,
            Event::RouteChanged {
                route_id: "r1".into()
            }
        );
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.publish(Event::SchedulerLate { count: 3 });
    }

    #[test]
    fn throttle_coalesces() {
        let mut t = Throttle::new(50_000);
        assert!(t.ready(0));
        assert!(!t.ready(10_000));
        assert!(!t.ready(49_999));
        assert!(t.ready(50_000));
        assert!(!t.ready(60_000));
        assert!(t.ready(150_000));
    }
}
