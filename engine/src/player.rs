//! Standard MIDI file playback. The player task walks a precomputed
//! absolute-tick event stream, sleeping until each event's wall time under
//! the active tempo, and injects messages into the router as if they came
//! from a device named [`PLAYER_SOURCE_ID`].

use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use midi_hub_core::{
    Anchor, Channel, Event, EventBus, HubError, HubResult, MidiClock, MidiEvent, MidiMessage,
    Throttle, TickConverter, TransportState,
};
use smf::{MidiFile, TempoMap, META_SET_TEMPO};

use crate::router::{RouterHandle, PLAYER_SOURCE_ID};

/// Tempo scale bounds.
pub const TEMPO_SCALE_MIN: f64 = 0.25;
pub const TEMPO_SCALE_MAX: f64 = 4.0;

/// Playback position and transport settings, readable without touching
/// the player task.
#[derive(Debug, Clone)]
pub struct PlayerStatus {
    pub state: TransportState,
    pub tick: u64,
    pub tempo_scale: f64,
    pub transpose: i8,
    pub us_per_quarter: u32,
    pub file_loaded: bool,
    pub length_ticks: u64,
}

impl Default for PlayerStatus {
    fn default() -> Self {
        Self {
            state: TransportState::Stopped,
            tick: 0,
            tempo_scale: 1.0,
            transpose: 0,
            us_per_quarter: smf::DEFAULT_US_PER_QUARTER,
            file_loaded: false,
            length_ticks: 0,
        }
    }
}

/// Flattened, tick-sorted event stream of one file.
struct PreparedSong {
    events: Vec<(u64, MidiMessage)>,
    ticks_per_quarter: u16,
    tempo_map: TempoMap,
    length_ticks: u64,
}

fn prepare(file: &MidiFile) -> HubResult<PreparedSong> {
    let Some(ticks_per_quarter) = file.ticks_per_quarter() else {
        return Err(HubError::UnsupportedFormat(
            "SMPTE-division files are not playable".to_string(),
        ));
    };
    let tempo_map = file.tempo_map();

    // Format 2 patterns are sequentially independent; play the first.
    let tracks: &[smf::Track] = match file.header.format {
        smf::Format::Sequential => &file.tracks[..file.tracks.len().min(1)],
        _ => &file.tracks,
    };

    let mut events = Vec::new();
    for track in tracks {
        for (event, &tick) in track.events().iter().zip(track.absolute_ticks()) {
            events.push((tick, event.message.clone()));
        }
    }
    // Stable by tick: simultaneous events keep track order.
    events.sort_by_key(|&(tick, _)| tick);
    let length_ticks = events.last().map_or(0, |&(tick, _)| tick);

    Ok(PreparedSong {
        events,
        ticks_per_quarter,
        tempo_map,
        length_ticks,
    })
}

type Reply = Sender<HubResult<()>>;

enum PlayerCommand {
    Load(Box<MidiFile>, Reply),
    Play(Reply),
    Pause(Reply),
    Stop(Reply),
    Seek(u64, Reply),
    SetTempoScale(f64, Reply),
    SetTranspose(i8, Reply),
}

#[derive(Clone)]
pub struct PlayerHandle {
    cmd_tx: Sender<PlayerCommand>,
    status: Arc<RwLock<PlayerStatus>>,
}

impl PlayerHandle {
    fn call(&self, build: impl FnOnce(Reply) -> PlayerCommand) -> HubResult<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.cmd_tx
            .send(build(reply_tx))
            .map_err(|_| HubError::TransportClosed)?;
        reply_rx
            .recv_timeout(Duration::from_secs(1))
            .map_err(|_| HubError::TransportClosed)?
    }

    pub fn load(&self, file: MidiFile) -> HubResult<()> {
        self.call(|reply| PlayerCommand::Load(Box::new(file), reply))
    }

    pub fn play(&self) -> HubResult<()> {
        self.call(PlayerCommand::Play)
    }

    pub fn pause(&self) -> HubResult<()> {
        self.call(PlayerCommand::Pause)
    }

    pub fn stop(&self) -> HubResult<()> {
        self.call(PlayerCommand::Stop)
    }

    pub fn seek(&self, tick: u64) -> HubResult<()> {
        self.call(|reply| PlayerCommand::Seek(tick, reply))
    }

    pub fn set_tempo_scale(&self, scale: f64) -> HubResult<()> {
        self.call(|reply| PlayerCommand::SetTempoScale(scale, reply))
    }

    pub fn set_transpose(&self, semitones: i8) -> HubResult<()> {
        self.call(|reply| PlayerCommand::SetTranspose(semitones, reply))
    }

    pub fn status(&self) -> PlayerStatus {
        self.status.read().expect("status lock poisoned").clone()
    }
}

pub fn start_player(
    clock: MidiClock,
    router: RouterHandle,
    bus: EventBus,
) -> (PlayerHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = unbounded();
    let status = Arc::new(RwLock::new(PlayerStatus::default()));
    let handle = PlayerHandle {
        cmd_tx,
        status: Arc::clone(&status),
    };

    let mut player = Player {
        clock,
        router,
        bus,
        song: None,
        state: TransportState::Stopped,
        position_tick: 0,
        cursor: 0,
        tempo_scale: 1.0,
        transpose: 0,
        conv: TickConverter::new(480, smf::DEFAULT_US_PER_QUARTER),
        anchor: Anchor::new(0, 0),
        status,
        position_throttle: Throttle::position_rate(),
    };
    let join = std::thread::Builder::new()
        .name("player".to_string())
        .spawn(move || player.run(cmd_rx))
        .expect("failed to spawn player task");
    (handle, join)
}

struct Player {
    clock: MidiClock,
    router: RouterHandle,
    bus: EventBus,
    song: Option<PreparedSong>,
    state: TransportState,
    position_tick: u64,
    cursor: usize,
    tempo_scale: f64,
    transpose: i8,
    conv: TickConverter,
    anchor: Anchor,
    status: Arc<RwLock<PlayerStatus>>,
    position_throttle: Throttle,
}

impl Player {
    fn run(&mut self, cmd_rx: Receiver<PlayerCommand>) {
        debug!("player task started");
        loop {
            let wait = self.next_wait();
            match cmd_rx.recv_timeout(wait) {
                Ok(cmd) => self.handle(cmd),
                Err(RecvTimeoutError::Timeout) => {
                    if self.state == TransportState::Playing {
                        self.emit_due();
                        self.publish_position();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("player task stopped");
    }

    fn next_wait(&self) -> Duration {
        if self.state != TransportState::Playing {
            return Duration::from_millis(100);
        }
        let Some(song) = &self.song else {
            return Duration::from_millis(100);
        };
        match song.events.get(self.cursor) {
            Some(&(tick, _)) => {
                let due = self.anchor.event_time_us(&self.conv, tick, self.tempo_scale);
                let now = self.clock.now_us();
                Duration::from_micros(due.saturating_sub(now)).min(Duration::from_millis(25))
            }
            None => Duration::from_millis(1),
        }
    }

    fn handle(&mut self, cmd: PlayerCommand) {
        let (result, reply) = match cmd {
            PlayerCommand::Load(file, reply) => (self.load(&file), reply),
            PlayerCommand::Play(reply) => (self.play(), reply),
            PlayerCommand::Pause(reply) => (self.pause(), reply),
            PlayerCommand::Stop(reply) => (self.stop(), reply),
            PlayerCommand::Seek(tick, reply) => (self.seek(tick), reply),
            PlayerCommand::SetTempoScale(scale, reply) => (self.set_tempo_scale(scale), reply),
            PlayerCommand::SetTranspose(semitones, reply) => {
                self.transpose = semitones.clamp(-24, 24);
                self.update_status();
                (Ok(()), reply)
            }
        };
        let _ = reply.send(result);
    }

    fn invalid(&self, op: &'static str) -> HubError {
        HubError::InvalidState {
            op,
            state: self.state.to_string(),
        }
    }

    fn load(&mut self, file: &MidiFile) -> HubResult<()> {
        if self.state == TransportState::Playing || self.state == TransportState::Paused {
            self.silence();
        }
        let song = prepare(file)?;
        info!(
            "loaded file: {} event(s), {} tick(s)",
            song.events.len(),
            song.length_ticks
        );
        self.conv = TickConverter::new(
            song.ticks_per_quarter,
            song.tempo_map.us_per_quarter_at(0),
        );
        self.song = Some(song);
        self.position_tick = 0;
        self.cursor = 0;
        self.set_state(TransportState::Loaded);
        Ok(())
    }

    fn play(&mut self) -> HubResult<()> {
        match self.state {
            TransportState::Playing => Ok(()),
            TransportState::Loaded | TransportState::Paused | TransportState::Stopped => {
                if self.song.is_none() {
                    return Err(self.invalid("player.play"));
                }
                // Re-anchor at the current position; resume and cold start
                // share the same math.
                self.anchor = Anchor::new(self.clock.now_us(), self.position_tick);
                self.set_state(TransportState::Playing);
                Ok(())
            }
        }
    }

    fn pause(&mut self) -> HubResult<()> {
        if self.state != TransportState::Playing {
            return Err(self.invalid("player.pause"));
        }
        self.position_tick = self.current_tick();
        self.set_state(TransportState::Paused);
        Ok(())
    }

    fn stop(&mut self) -> HubResult<()> {
        match self.state {
            TransportState::Playing | TransportState::Paused | TransportState::Loaded => {
                self.silence();
                self.position_tick = 0;
                self.cursor = 0;
                if let Some(song) = &self.song {
                    self.conv =
                        TickConverter::new(song.ticks_per_quarter, song.tempo_map.us_per_quarter_at(0));
                }
                self.set_state(TransportState::Stopped);
                Ok(())
            }
            TransportState::Stopped => Err(self.invalid("player.stop")),
        }
    }

    fn seek(&mut self, tick: u64) -> HubResult<()> {
        let Some(song) = &self.song else {
            return Err(self.invalid("player.seek"));
        };
        let tick = tick.min(song.length_ticks);
        let cursor = song.events.partition_point(|&(t, _)| t < tick);
        let us_per_quarter = song.tempo_map.us_per_quarter_at(tick);

        self.silence();
        self.position_tick = tick;
        self.cursor = cursor;
        self.conv.set_us_per_quarter(us_per_quarter);
        match self.state {
            // Re-enter the running states with a fresh anchor.
            TransportState::Playing => {
                self.anchor = Anchor::new(self.clock.now_us(), tick);
                self.update_status();
            }
            TransportState::Paused => self.update_status(),
            _ => self.set_state(TransportState::Loaded),
        }
        Ok(())
    }

    fn set_tempo_scale(&mut self, scale: f64) -> HubResult<()> {
        let scale = scale.clamp(TEMPO_SCALE_MIN, TEMPO_SCALE_MAX);
        if self.state == TransportState::Playing {
            // Anchor at the current position so the scale change applies
            // from here on, not retroactively.
            let tick = self.current_tick();
            self.position_tick = tick;
            self.anchor = Anchor::new(self.clock.now_us(), tick);
        }
        self.tempo_scale = scale;
        self.update_status();
        Ok(())
    }

    /// Emit every event whose wall time has arrived.
    fn emit_due(&mut self) {
        let now = self.clock.now_us();
        loop {
            let Some(song) = &self.song else { return };
            let Some(&(tick, ref message)) = song.events.get(self.cursor) else {
                // End of the stream: full stop, position back to zero.
                info!("playback finished");
                let _ = self.stop();
                return;
            };
            let due = self.anchor.event_time_us(&self.conv, tick, self.tempo_scale);
            if due > now {
                return;
            }

            let message = message.clone();
            self.cursor += 1;
            self.position_tick = tick;

            match &message {
                MidiMessage::Meta { meta_type, data } if *meta_type == META_SET_TEMPO => {
                    if data.len() == 3 {
                        let uspq =
                            ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32;
                        debug!("tempo change at tick {tick}: {uspq} us/quarter");
                        self.conv.set_us_per_quarter(uspq);
                        // Re-anchor at the scheduled (not actual) time so
                        // jitter does not accumulate into drift.
                        self.anchor = Anchor::new(due, tick);
                        self.update_status();
                    }
                }
                MidiMessage::Meta { .. } => {}
                _ => {
                    if let Some(message) = self.transposed(message) {
                        self.router
                            .inject(PLAYER_SOURCE_ID, MidiEvent::new(self.clock.now_us(), message));
                    }
                }
            }
        }
    }

    /// Global transpose applied at emit time; out-of-range notes drop.
    fn transposed(&self, message: MidiMessage) -> Option<MidiMessage> {
        if self.transpose == 0 {
            return Some(message);
        }
        let shift = |note: u8| -> Option<u8> {
            let shifted = note as i16 + self.transpose as i16;
            (0..=127).contains(&shifted).then_some(shifted as u8)
        };
        match message {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => shift(note).map(|note| MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            }),
            MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => shift(note).map(|note| MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            }),
            other => Some(other),
        }
    }

    fn current_tick(&self) -> u64 {
        if self.state != TransportState::Playing {
            return self.position_tick;
        }
        let elapsed = self.clock.now_us().saturating_sub(self.anchor.wall_us);
        let scaled = (elapsed as f64 * self.tempo_scale) as u64;
        self.anchor.tick + self.conv.us_to_ticks(scaled)
    }

    /// All-notes-off on every channel through the normal routing path,
    /// plus a chain reset so stateful processors release held notes.
    fn silence(&mut self) {
        let now = self.clock.now_us();
        for channel in Channel::all() {
            self.router
                .inject(PLAYER_SOURCE_ID, MidiEvent::new(now, MidiMessage::all_notes_off(channel)));
        }
        if let Err(e) = self.router.reset_chains(None) {
            warn!("chain reset on stop failed: {e}");
        }
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            info!("player: {} -> {}", self.state, state);
            self.state = state;
            self.bus.publish(Event::PlayerState { state });
        }
        self.update_status();
    }

    fn update_status(&self) {
        let mut status = self.status.write().expect("status lock poisoned");
        status.state = self.state;
        status.tick = self.position_tick;
        status.tempo_scale = self.tempo_scale;
        status.transpose = self.transpose;
        status.us_per_quarter = self.conv.us_per_quarter();
        status.file_loaded = self.song.is_some();
        status.length_ticks = self.song.as_ref().map_or(0, |s| s.length_ticks);
    }

    fn publish_position(&mut self) {
        let now = self.clock.now_us();
        if self.position_throttle.ready(now) {
            let tick = self.current_tick();
            self.bus.publish(Event::PlayerPosition {
                tick,
                wallclock_us: now,
            });
            let mut status = self.status.write().expect("status lock poisoned");
            status.tick = tick;
        }
    }
}
