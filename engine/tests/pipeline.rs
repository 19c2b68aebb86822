//! End-to-end dataplane tests: ingress -> route -> chain -> scheduler ->
//! sink, plus player transport behavior.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use engine::processor::{
    ArpPattern, Arpeggiator, ChannelFilter, ChannelSet, Processor, ProcessorChain, Transpose,
};
use engine::{
    start_player, start_router, start_scheduler, LatencyCompensator, Route, SchedulerStrategy,
};
use midi_hub_core::{Channel, EventBus, HubError, MidiClock, MidiEvent, MidiMessage, TransportState};
use smf::{Division, Format, Header, MidiFile, Track, TrackEvent, META_END_OF_TRACK};

#[derive(Clone, Default)]
struct Capture {
    events: Arc<Mutex<Vec<(u64, String, MidiMessage)>>>,
}

impl Capture {
    fn sent_to(&self, sink: &str) -> Vec<MidiMessage> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s, _)| s == sink)
            .map(|(_, _, m)| m.clone())
            .collect()
    }

    fn note_ons(&self, sink: &str) -> Vec<u8> {
        self.sent_to(sink)
            .iter()
            .filter_map(|m| match m {
                MidiMessage::NoteOn { note, .. } => Some(*note),
                _ => None,
            })
            .collect()
    }
}

struct Pipeline {
    clock: MidiClock,
    capture: Capture,
    scheduler: Arc<dyn engine::Scheduler>,
    router: engine::RouterHandle,
}

fn pipeline() -> Pipeline {
    let clock = MidiClock::new();
    let bus = EventBus::new(32);
    let capture = Capture::default();
    let sink_events = Arc::clone(&capture.events);
    let sink_clock = clock.clone();
    let scheduler = start_scheduler(
        SchedulerStrategy::PriorityQueue,
        clock.clone(),
        Arc::new(move |ev: &engine::ScheduledEvent| {
            sink_events.lock().unwrap().push((
                sink_clock.now_us(),
                ev.sink_id.clone(),
                ev.message.clone(),
            ));
        }),
        bus.clone(),
    );
    let compensator = Arc::new(LatencyCompensator::new());
    let (router, _join) = start_router(
        clock.clone(),
        Arc::clone(&scheduler),
        compensator,
        bus,
    );
    Pipeline {
        clock,
        capture,
        scheduler,
        router,
    }
}

fn ch(n: u8) -> Channel {
    Channel::new(n).unwrap()
}

fn note_on(clock: &MidiClock, channel: u8, note: u8) -> MidiEvent {
    MidiEvent::new(
        clock.now_us(),
        MidiMessage::NoteOn {
            channel: ch(channel),
            note,
            velocity: 100,
        },
    )
}

fn settle() {
    std::thread::sleep(Duration::from_millis(60));
}

#[test]
fn channel_filter_and_transpose_route() {
    let p = pipeline();
    let chain = ProcessorChain::new(
        "filter+transpose",
        vec![
            Processor::ChannelFilter(ChannelFilter::new(ChannelSet::from_channels(&[1]).unwrap())),
            Processor::Transpose(Transpose::new(12)),
        ],
    );
    let route = Route::new("keys", "synth").with_chain(chain);
    p.router.add_route(route).unwrap();

    p.router.inject("keys", note_on(&p.clock, 1, 60));
    p.router.inject("keys", note_on(&p.clock, 2, 60));
    settle();

    // Channel 1 passes transposed an octave; channel 2 never arrives.
    let received = p.capture.sent_to("synth");
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0],
        MidiMessage::NoteOn {
            channel: ch(1),
            note: 72,
            velocity: 100
        }
    );
}

#[test]
fn solo_route_silences_the_others() {
    let p = pipeline();
    let mut route_a = Route::new("keys", "sink-a");
    route_a.solo = true;
    let a_id = route_a.id.clone();
    p.router.add_route(route_a).unwrap();
    p.router.add_route(Route::new("keys", "sink-b")).unwrap();
    p.router.add_route(Route::new("keys", "sink-c")).unwrap();

    p.router.inject("keys", note_on(&p.clock, 1, 64));
    settle();

    assert_eq!(p.capture.note_ons("sink-a"), vec![64]);
    assert!(p.capture.note_ons("sink-b").is_empty());
    assert!(p.capture.note_ons("sink-c").is_empty());

    // Clearing solo restores normal fanout.
    p.router.set_solo(&a_id, false).unwrap();
    p.router.inject("keys", note_on(&p.clock, 1, 65));
    settle();
    assert_eq!(p.capture.note_ons("sink-b"), vec![65]);
    assert_eq!(p.capture.note_ons("sink-c"), vec![65]);
}

#[test]
fn muted_solo_route_does_not_emit() {
    let p = pipeline();
    let mut route = Route::new("keys", "sink");
    route.solo = true;
    route.mute = true;
    p.router.add_route(route).unwrap();
    p.router.inject("keys", note_on(&p.clock, 1, 60));
    settle();
    assert!(p.capture.sent_to("sink").is_empty());
}

#[test]
fn gain_scales_velocity_with_floor() {
    let p = pipeline();
    let mut route = Route::new("keys", "sink");
    route.gain = 0.5;
    let id = route.id.clone();
    p.router.add_route(route).unwrap();

    p.router.inject("keys", note_on(&p.clock, 1, 60));
    settle();
    assert_eq!(
        p.capture.sent_to("sink")[0],
        MidiMessage::NoteOn {
            channel: ch(1),
            note: 60,
            velocity: 50
        }
    );

    p.router.set_gain(&id, 0.0).unwrap();
    p.router.inject("keys", note_on(&p.clock, 1, 61));
    settle();
    let last = p.capture.sent_to("sink").pop().unwrap();
    assert_eq!(
        last,
        MidiMessage::NoteOn {
            channel: ch(1),
            note: 61,
            velocity: 1
        }
    );
}

#[test]
fn chain_reset_balances_note_on_and_off_at_the_sink() {
    let p = pipeline();
    let chain = ProcessorChain::new(
        "arp",
        vec![Processor::Arpeggiator(Arpeggiator::new(
            ArpPattern::Up,
            20_000,
        ))],
    );
    p.router
        .add_route(Route::new("keys", "sink").with_chain(chain))
        .unwrap();

    p.router.inject("keys", note_on(&p.clock, 1, 60));
    std::thread::sleep(Duration::from_millis(100));
    p.router.reset_chains(None).unwrap();
    settle();

    let messages = p.capture.sent_to("sink");
    let ons = messages
        .iter()
        .filter(|m| matches!(m, MidiMessage::NoteOn { .. }))
        .count();
    let offs = messages
        .iter()
        .filter(|m| matches!(m, MidiMessage::NoteOff { .. }))
        .count();
    assert!(ons > 0, "arpeggiator should have emitted steps");
    assert_eq!(ons, offs, "every NoteOn must be closed after reset");

    // Nothing fires after the reset.
    let count = messages.len();
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(p.capture.sent_to("sink").len(), count);
}

#[test]
fn route_edits_surface_not_found() {
    let p = pipeline();
    assert!(matches!(
        p.router.set_mute("ghost", true),
        Err(HubError::NotFound { .. })
    ));
    assert!(matches!(
        p.router.remove_route("ghost"),
        Err(HubError::NotFound { .. })
    ));
}

fn one_note_file(note_tick: u32) -> MidiFile {
    let events = vec![
        TrackEvent {
            delta: note_tick,
            message: MidiMessage::NoteOn {
                channel: ch(1),
                note: 72,
                velocity: 96,
            },
        },
        TrackEvent {
            delta: 120,
            message: MidiMessage::NoteOff {
                channel: ch(1),
                note: 72,
                velocity: 0,
            },
        },
        TrackEvent {
            delta: 0,
            message: MidiMessage::Meta {
                meta_type: META_END_OF_TRACK,
                data: Vec::new(),
            },
        },
    ];
    MidiFile {
        header: Header {
            format: Format::Single,
            division: Division::TicksPerQuarter(480),
        },
        tracks: vec![Track::new(events)],
    }
}

#[test]
fn player_seek_then_play_emits_after_remaining_ticks() {
    let p = pipeline();
    let bus = EventBus::new(16);
    p.router
        .add_route(Route::new(engine::PLAYER_SOURCE_ID, "synth"))
        .unwrap();
    let (player, _join) = start_player(p.clock.clone(), p.router.clone(), bus);

    // NoteOn sits at tick 480; seek half-way there.
    player.load(one_note_file(480)).unwrap();
    player.seek(240).unwrap();
    let started = Instant::now();
    player.play().unwrap();

    // 240 ticks at 480 tpq / 500_000 us per quarter = 250 ms.
    let deadline = Instant::now() + Duration::from_secs(2);
    let elapsed = loop {
        if !p.capture.note_ons("synth").is_empty() {
            break started.elapsed();
        }
        assert!(Instant::now() < deadline, "note never arrived");
        std::thread::sleep(Duration::from_millis(2));
    };
    assert!(
        elapsed >= Duration::from_millis(200) && elapsed <= Duration::from_millis(400),
        "expected ~250 ms, got {elapsed:?}"
    );
    assert_eq!(p.capture.note_ons("synth"), vec![72]);
}

#[test]
fn player_transport_state_machine() {
    let p = pipeline();
    let bus = EventBus::new(16);
    let (player, _join) = start_player(p.clock.clone(), p.router.clone(), bus);

    // play before load is an InvalidState error.
    assert!(matches!(
        player.play(),
        Err(HubError::InvalidState { .. })
    ));
    assert!(matches!(
        player.pause(),
        Err(HubError::InvalidState { .. })
    ));

    player.load(one_note_file(480)).unwrap();
    assert_eq!(player.status().state, TransportState::Loaded);

    player.play().unwrap();
    assert_eq!(player.status().state, TransportState::Playing);

    player.pause().unwrap();
    assert_eq!(player.status().state, TransportState::Paused);

    player.play().unwrap();
    player.stop().unwrap();
    let status = player.status();
    assert_eq!(status.state, TransportState::Stopped);
    assert_eq!(status.tick, 0);
}

#[test]
fn player_transpose_applies_at_emit_time() {
    let p = pipeline();
    let bus = EventBus::new(16);
    p.router
        .add_route(Route::new(engine::PLAYER_SOURCE_ID, "synth"))
        .unwrap();
    let (player, _join) = start_player(p.clock.clone(), p.router.clone(), bus);

    player.load(one_note_file(0)).unwrap();
    player.set_transpose(12).unwrap();
    player.play().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let notes = p.capture.note_ons("synth");
        if !notes.is_empty() {
            assert_eq!(notes, vec![84]);
            break;
        }
        assert!(Instant::now() < deadline, "note never arrived");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn scheduler_offset_defers_route_output() {
    let p = pipeline();
    let mut route = Route::new("keys", "sink");
    route.offset_us = 80_000;
    p.router.add_route(route).unwrap();

    p.router.inject("keys", note_on(&p.clock, 1, 60));
    std::thread::sleep(Duration::from_millis(20));
    assert!(p.capture.sent_to("sink").is_empty());
    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(p.capture.note_ons("sink"), vec![60]);
    assert_eq!(p.scheduler.pending(), 0);
}
