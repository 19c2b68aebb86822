//! Many-to-many routing from source devices to sink devices. Each ingress
//! message fans out to every matching route, through that route's
//! processor chain, gain/offset, the latency compensator and into the
//! scheduler.
//!
//! Chain state is owned by the router task alone; edits arrive over a
//! command channel and readers see a copy-on-write snapshot, so one
//! ingress dispatch always observes a single consistent route table.

use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use midi_hub_core::{
    Channel, Event, EventBus, HubError, HubResult, MidiClock, MidiEvent, MidiMessage,
};

use crate::latency::LatencyCompensator;
use crate::processor::{ChannelSet, ProcessorChain};
use crate::scheduler::Scheduler;

/// Source ID the file player uses when injecting into the router.
pub const PLAYER_SOURCE_ID: &str = "player";

/// Remaps a message's channel on the way to the sink. Identity by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    table: [u8; 16],
}

impl Default for ChannelMap {
    fn default() -> Self {
        let mut table = [0u8; 16];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = i as u8 + 1;
        }
        Self { table }
    }
}

impl ChannelMap {
    pub fn identity() -> Self {
        Self::default()
    }

    /// Send every channel to one fixed output channel.
    pub fn constant(channel: Channel) -> Self {
        Self {
            table: [channel.number(); 16],
        }
    }

    pub fn set(&mut self, from: Channel, to: Channel) {
        self.table[from.nibble() as usize] = to.number();
    }

    pub fn remap(&self, channel: Channel) -> Channel {
        Channel::new(self.table[channel.nibble() as usize]).unwrap_or(channel)
    }
}

/// A configured connection from one source to one sink.
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub source_id: String,
    pub channels: ChannelSet,
    pub chain: ProcessorChain,
    pub sink_id: String,
    pub channel_map: ChannelMap,
    pub mute: bool,
    pub solo: bool,
    pub gain: f32,
    pub offset_us: i64,
}

impl Route {
    pub fn new(source_id: impl Into<String>, sink_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            channels: ChannelSet::all(),
            chain: ProcessorChain::default(),
            sink_id: sink_id.into(),
            channel_map: ChannelMap::identity(),
            mute: false,
            solo: false,
            gain: 1.0,
            offset_us: 0,
        }
    }

    pub fn with_channels(mut self, channels: ChannelSet) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_chain(mut self, chain: ProcessorChain) -> Self {
        self.chain = chain;
        self
    }
}

/// Immutable view of a route for API readers.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSnapshot {
    pub id: String,
    pub source_id: String,
    pub sink_id: String,
    pub channels: u16,
    pub mute: bool,
    pub solo: bool,
    pub gain: f32,
    pub offset_us: i64,
}

type Reply = Sender<HubResult<()>>;

enum RouterCommand {
    Add(Box<Route>, Reply),
    Remove(String, Reply),
    SetMute(String, bool, Reply),
    SetSolo(String, bool, Reply),
    SetGain(String, f32, Reply),
    SetOffset(String, i64, Reply),
    SetChain(String, ProcessorChain, Reply),
    /// Reset one chain, or all when `None`; realizes the all-notes-off
    /// guarantee.
    Reset(Option<String>, Reply),
}

/// Handle shared with the control layer and the player.
#[derive(Clone)]
pub struct RouterHandle {
    ingress_tx: Sender<(String, MidiEvent)>,
    cmd_tx: Sender<RouterCommand>,
    snapshot: Arc<RwLock<Arc<Vec<RouteSnapshot>>>>,
}

impl RouterHandle {
    /// Ingress side: what device readers and the player feed.
    pub fn ingress(&self) -> Sender<(String, MidiEvent)> {
        self.ingress_tx.clone()
    }

    pub fn inject(&self, source_id: &str, event: MidiEvent) {
        if self.ingress_tx.send((source_id.to_string(), event)).is_err() {
            warn!("router ingress closed");
        }
    }

    pub fn routes(&self) -> Vec<RouteSnapshot> {
        self.snapshot
            .read()
            .expect("snapshot lock poisoned")
            .as_ref()
            .clone()
    }

    fn call(&self, build: impl FnOnce(Reply) -> RouterCommand) -> HubResult<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.cmd_tx
            .send(build(reply_tx))
            .map_err(|_| HubError::TransportClosed)?;
        reply_rx
            .recv_timeout(Duration::from_secs(1))
            .map_err(|_| HubError::TransportClosed)?
    }

    pub fn add_route(&self, route: Route) -> HubResult<()> {
        self.call(|reply| RouterCommand::Add(Box::new(route), reply))
    }

    pub fn remove_route(&self, id: &str) -> HubResult<()> {
        self.call(|reply| RouterCommand::Remove(id.to_string(), reply))
    }

    pub fn set_mute(&self, id: &str, mute: bool) -> HubResult<()> {
        self.call(|reply| RouterCommand::SetMute(id.to_string(), mute, reply))
    }

    pub fn set_solo(&self, id: &str, solo: bool) -> HubResult<()> {
        self.call(|reply| RouterCommand::SetSolo(id.to_string(), solo, reply))
    }

    pub fn set_gain(&self, id: &str, gain: f32) -> HubResult<()> {
        self.call(|reply| RouterCommand::SetGain(id.to_string(), gain, reply))
    }

    pub fn set_offset(&self, id: &str, offset_us: i64) -> HubResult<()> {
        self.call(|reply| RouterCommand::SetOffset(id.to_string(), offset_us, reply))
    }

    pub fn set_chain(&self, id: &str, chain: ProcessorChain) -> HubResult<()> {
        self.call(|reply| RouterCommand::SetChain(id.to_string(), chain, reply))
    }

    pub fn reset_chains(&self, id: Option<&str>) -> HubResult<()> {
        self.call(|reply| RouterCommand::Reset(id.map(str::to_string), reply))
    }
}

struct Router {
    routes: Vec<Route>,
    clock: MidiClock,
    scheduler: Arc<dyn Scheduler>,
    compensator: Arc<LatencyCompensator>,
    bus: EventBus,
    snapshot: Arc<RwLock<Arc<Vec<RouteSnapshot>>>>,
}

/// Start the router task. It exits when both channel ends (handle clones)
/// are gone.
pub fn start_router(
    clock: MidiClock,
    scheduler: Arc<dyn Scheduler>,
    compensator: Arc<LatencyCompensator>,
    bus: EventBus,
) -> (RouterHandle, JoinHandle<()>) {
    let (ingress_tx, ingress_rx) = unbounded();
    let (cmd_tx, cmd_rx) = unbounded();
    let snapshot = Arc::new(RwLock::new(Arc::new(Vec::new())));

    let handle = RouterHandle {
        ingress_tx,
        cmd_tx,
        snapshot: Arc::clone(&snapshot),
    };

    let mut router = Router {
        routes: Vec::new(),
        clock,
        scheduler,
        compensator,
        bus,
        snapshot,
    };
    let join = std::thread::Builder::new()
        .name("router".to_string())
        .spawn(move || router.run(ingress_rx, cmd_rx))
        .expect("failed to spawn router task");
    (handle, join)
}

impl Router {
    fn run(
        &mut self,
        ingress_rx: Receiver<(String, MidiEvent)>,
        cmd_rx: Receiver<RouterCommand>,
    ) {
        debug!("router task started");
        loop {
            match ingress_rx.recv_timeout(Duration::from_millis(1)) {
                Ok((source_id, event)) => self.dispatch(&source_id, &event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while let Ok(cmd) = cmd_rx.try_recv() {
                self.apply(cmd);
            }
            self.tick();
        }
        debug!("router task stopped");
    }

    fn solo_active(&self) -> bool {
        self.routes.iter().any(|r| r.solo)
    }

    /// One ingress message through every matching route.
    fn dispatch(&mut self, source_id: &str, event: &MidiEvent) {
        let now = self.clock.now_us();
        let solo_active = self.solo_active();
        for route in &mut self.routes {
            if route.source_id != source_id {
                continue;
            }
            if let Some(ch) = event.message.channel() {
                if !route.channels.contains(ch) {
                    continue;
                }
            }
            if route.mute || (solo_active && !route.solo) {
                continue;
            }
            let outputs = route.chain.process(event);
            emit(
                route,
                outputs,
                now,
                &self.compensator,
                self.scheduler.as_ref(),
            );
        }
    }

    /// Release due events from stateful stages.
    fn tick(&mut self) {
        let now = self.clock.now_us();
        let solo_active = self.solo_active();
        for route in &mut self.routes {
            let outputs = route.chain.tick(now);
            if outputs.is_empty() {
                continue;
            }
            if route.mute || (solo_active && !route.solo) {
                continue;
            }
            emit(
                route,
                outputs,
                now,
                &self.compensator,
                self.scheduler.as_ref(),
            );
        }
    }

    fn apply(&mut self, cmd: RouterCommand) {
        let (result, changed_id, reply) = match cmd {
            RouterCommand::Add(route, reply) => {
                let id = route.id.clone();
                if self.routes.iter().any(|r| r.id == id) {
                    (
                        Err(HubError::InvalidState {
                            op: "route.add",
                            state: format!("route {id} already exists"),
                        }),
                        None,
                        reply,
                    )
                } else {
                    info!("route {id}: {} -> {}", route.source_id, route.sink_id);
                    self.routes.push(*route);
                    (Ok(()), Some(id), reply)
                }
            }
            RouterCommand::Remove(id, reply) => match self.routes.iter().position(|r| r.id == id) {
                Some(index) => {
                    // Closing state before the route disappears.
                    let mut route = self.routes.remove(index);
                    let now = self.clock.now_us();
                    let outputs = route.chain.reset(now);
                    emit(
                        &route,
                        outputs,
                        now,
                        &self.compensator,
                        self.scheduler.as_ref(),
                    );
                    (Ok(()), Some(id), reply)
                }
                None => (
                    Err(HubError::NotFound {
                        entity: "route",
                        id,
                    }),
                    None,
                    reply,
                ),
            },
            RouterCommand::SetMute(id, mute, reply) => {
                let r = self.edit(&id, |route| route.mute = mute);
                (r, Some(id), reply)
            }
            RouterCommand::SetSolo(id, solo, reply) => {
                let r = self.edit(&id, |route| route.solo = solo);
                (r, Some(id), reply)
            }
            RouterCommand::SetGain(id, gain, reply) => {
                let r = self.edit(&id, |route| route.gain = gain.clamp(0.0, 2.0));
                (r, Some(id), reply)
            }
            RouterCommand::SetOffset(id, offset_us, reply) => {
                let r = self.edit(&id, |route| route.offset_us = offset_us);
                (r, Some(id), reply)
            }
            RouterCommand::SetChain(id, chain, reply) => {
                // Route edits reset the outgoing chain first so held notes
                // never leak past the edit.
                let now = self.clock.now_us();
                let r = match self.routes.iter_mut().find(|r| r.id == id) {
                    Some(route) => {
                        let outputs = route.chain.reset(now);
                        emit(
                            route,
                            outputs,
                            now,
                            &self.compensator,
                            self.scheduler.as_ref(),
                        );
                        route.chain = chain;
                        Ok(())
                    }
                    None => Err(HubError::NotFound {
                        entity: "route",
                        id: id.clone(),
                    }),
                };
                (r, Some(id), reply)
            }
            RouterCommand::Reset(target, reply) => {
                let now = self.clock.now_us();
                let mut found = target.is_none();
                for route in &mut self.routes {
                    if target.as_deref().is_some_and(|id| id != route.id) {
                        continue;
                    }
                    found = true;
                    let outputs = route.chain.reset(now);
                    emit(
                        route,
                        outputs,
                        now,
                        &self.compensator,
                        self.scheduler.as_ref(),
                    );
                }
                let r = if found {
                    Ok(())
                } else {
                    Err(HubError::NotFound {
                        entity: "route",
                        id: target.unwrap_or_default(),
                    })
                };
                (r, None, reply)
            }
        };

        if result.is_ok() {
            self.publish_snapshot();
            if let Some(id) = changed_id {
                self.bus.publish(Event::RouteChanged { route_id: id });
            }
        }
        let _ = reply.send(result);
    }

    fn edit(&mut self, id: &str, f: impl FnOnce(&mut Route)) -> HubResult<()> {
        match self.routes.iter_mut().find(|r| r.id == id) {
            Some(route) => {
                f(route);
                Ok(())
            }
            None => Err(HubError::NotFound {
                entity: "route",
                id: id.to_string(),
            }),
        }
    }

    fn publish_snapshot(&self) {
        let view: Vec<RouteSnapshot> = self
            .routes
            .iter()
            .map(|r| RouteSnapshot {
                id: r.id.clone(),
                source_id: r.source_id.clone(),
                sink_id: r.sink_id.clone(),
                channels: r.channels.bits(),
                mute: r.mute,
                solo: r.solo,
                gain: r.gain,
                offset_us: r.offset_us,
            })
            .collect();
        *self.snapshot.write().expect("snapshot lock poisoned") = Arc::new(view);
    }
}

/// Gain, channel remap, offset, latency compensation, scheduler submit.
fn emit(
    route: &Route,
    outputs: Vec<MidiEvent>,
    now_us: u64,
    compensator: &LatencyCompensator,
    scheduler: &dyn Scheduler,
) {
    for out in outputs {
        let mut message = out.message;
        if let MidiMessage::NoteOn {
            channel,
            note,
            velocity,
        } = message
        {
            // Gain scales velocity; floor 1 so attenuation never turns a
            // NoteOn into an implicit NoteOff.
            let scaled = ((velocity as f32 * route.gain).round() as i32).clamp(1, 127) as u8;
            message = MidiMessage::NoteOn {
                channel,
                note,
                velocity: scaled,
            };
        }
        if let Some(ch) = message.channel() {
            let mapped = route.channel_map.remap(ch);
            if mapped != ch {
                message = remap_channel(message, mapped);
            }
        }

        let due = out.timestamp_us.saturating_add_signed(route.offset_us);
        let (due, late) = compensator.adjust(&route.sink_id, &message, due, now_us);
        if late {
            debug!("route {}: late event for {}", route.id, route.sink_id);
        }
        if let Err(e) = scheduler.submit(&route.sink_id, message, due) {
            warn!("route {}: {e}", route.id);
        }
    }
}

fn remap_channel(message: MidiMessage, to: Channel) -> MidiMessage {
    match message {
        MidiMessage::NoteOn { note, velocity, .. } => MidiMessage::NoteOn {
            channel: to,
            note,
            velocity,
        },
        MidiMessage::NoteOff { note, velocity, .. } => MidiMessage::NoteOff {
            channel: to,
            note,
            velocity,
        },
        MidiMessage::PolyAftertouch { note, pressure, .. } => MidiMessage::PolyAftertouch {
            channel: to,
            note,
            pressure,
        },
        MidiMessage::ControlChange {
            controller, value, ..
        } => MidiMessage::ControlChange {
            channel: to,
            controller,
            value,
        },
        MidiMessage::ProgramChange { program, .. } => MidiMessage::ProgramChange {
            channel: to,
            program,
        },
        MidiMessage::ChannelPressure { pressure, .. } => MidiMessage::ChannelPressure {
            channel: to,
            pressure,
        },
        MidiMessage::PitchBend { value, .. } => MidiMessage::PitchBend { channel: to, value },
        other => other,
    }
}
