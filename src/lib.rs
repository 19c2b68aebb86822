//! Service assembly: configuration, component wiring and the main service
//! loop tying devices, router, schedulers, player and the control API
//! together.

pub mod api;
pub mod preset;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use log::{error, info, warn};

use devices::virtual_dev::VirtualMidiDevice;
use devices::DeviceManager;
use engine::{
    start_player, start_router, start_scheduler, LatencyCompensator, LatencyProfile,
    SchedulerStrategy, DRAIN_DEADLINE,
};
use midi_hub_core::{Event, EventBus, MidiClock};
use sysex::Reassembler;

/// Service configuration, loaded from TOML.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// "heap" (priority queue) or "ring" (time-bucket ring buffer).
    pub scheduler: Option<String>,
    /// UDP port for the RTP-MIDI server; disabled when absent.
    pub rtp_port: Option<u16>,
    /// Session name announced to RTP peers.
    pub session_name: Option<String>,
    /// TCP port of the line-delimited JSON control API.
    pub api_port: Option<u16>,
    pub log_level: Option<String>,
    /// Virtual ports created at startup.
    pub virtual_ports: Option<Vec<String>>,
    /// Fixed output latency per device ID, microseconds.
    pub latency: Option<std::collections::HashMap<String, u64>>,
    /// Directory used by the preset store.
    pub preset_dir: Option<String>,
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let config: Config = toml::from_str(&content).with_context(|| format!("parsing {path}"))?;
        Ok(config)
    }

    pub fn scheduler_strategy(&self) -> Result<SchedulerStrategy> {
        match self.scheduler.as_deref() {
            None => Ok(SchedulerStrategy::PriorityQueue),
            Some(name) => name.parse().map_err(anyhow::Error::from),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: None,
            rtp_port: Some(5004),
            session_name: None,
            api_port: Some(7400),
            log_level: None,
            virtual_ports: None,
            latency: None,
            preset_dir: None,
        }
    }
}

/// Everything the control layer needs a handle to.
#[derive(Clone)]
pub struct HubContext {
    pub clock: MidiClock,
    pub bus: EventBus,
    pub manager: Arc<DeviceManager>,
    pub router: engine::RouterHandle,
    pub player: engine::PlayerHandle,
    pub scheduler: Arc<dyn engine::Scheduler>,
    pub compensator: Arc<LatencyCompensator>,
    pub presets: Arc<dyn preset::PresetStore>,
    /// Sink side of the RTP server; lets the API register RTP output
    /// devices.
    pub rtp_outbound: tokio::sync::mpsc::UnboundedSender<network::RtpOutbound>,
}

/// Build and run the whole service until `running` flips to false.
pub async fn run_service_loop(config: Config, running: Arc<AtomicBool>) -> Result<()> {
    info!("service loop starting");
    let clock = MidiClock::new();
    let bus = EventBus::new(256);

    // --- Scheduler, compensator, router ---
    let compensator = Arc::new(LatencyCompensator::new());
    if let Some(latency) = &config.latency {
        for (device_id, us) in latency {
            compensator.set_profile(device_id.clone(), LatencyProfile::fixed(*us));
        }
    }

    let strategy = config.scheduler_strategy()?;
    info!("scheduler strategy: {strategy:?}");

    let (sysex_tx, sysex_rx) = unbounded();

    // The sink closure is filled in after the manager exists; route through
    // a once-settable slot.
    let manager_slot: Arc<std::sync::OnceLock<Arc<DeviceManager>>> =
        Arc::new(std::sync::OnceLock::new());
    let sink_slot = Arc::clone(&manager_slot);
    let scheduler = start_scheduler(
        strategy,
        clock.clone(),
        Arc::new(move |ev: &engine::ScheduledEvent| {
            if let Some(manager) = sink_slot.get() {
                if let Err(e) = manager.send_to(&ev.sink_id, &ev.message) {
                    warn!("dispatch to {} failed: {e}", ev.sink_id);
                }
            }
        }),
        bus.clone(),
    );

    let (router, _router_join) = start_router(
        clock.clone(),
        Arc::clone(&scheduler),
        Arc::clone(&compensator),
        bus.clone(),
    );

    // --- Device manager, wired into the router ingress ---
    let manager = DeviceManager::new(router.ingress(), sysex_tx, bus.clone(), clock.clone());
    manager_slot
        .set(Arc::clone(&manager))
        .map_err(|_| anyhow::anyhow!("manager slot set twice"))?;

    for name in config.virtual_ports.clone().unwrap_or_default() {
        let (device, _port) = VirtualMidiDevice::new(name.clone(), name.clone(), clock.clone());
        if let Err(e) = manager.add(Box::new(device)) {
            warn!("virtual port {name}: {e}");
        }
    }

    // --- SysEx reassembly task ---
    let sysex_bus = bus.clone();
    let sysex_clock = clock.clone();
    let sysex_running = Arc::clone(&running);
    let sysex_join = std::thread::Builder::new()
        .name("sysex-reassembly".to_string())
        .spawn(move || {
            let mut reassembler = Reassembler::default();
            while sysex_running.load(Ordering::SeqCst) {
                match sysex_rx.recv_timeout(Duration::from_millis(250)) {
                    Ok((device_id, frame_bytes)) => {
                        api::handle_sysex_input(
                            &mut reassembler,
                            &sysex_bus,
                            &device_id,
                            &frame_bytes,
                            sysex_clock.now_us(),
                        );
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
                for e in reassembler.expire(sysex_clock.now_us()) {
                    warn!("{e}");
                }
            }
        })?;

    // --- Player ---
    let (player, _player_join) = start_player(clock.clone(), router.clone(), bus.clone());

    // --- Preset store ---
    let preset_dir = config
        .preset_dir
        .clone()
        .unwrap_or_else(|| "presets".to_string());
    let presets: Arc<dyn preset::PresetStore> =
        Arc::new(preset::FilePresetStore::new(preset_dir));

    // --- RTP-MIDI server task ---
    let (rtp_outbound_tx, rtp_outbound_rx) = tokio::sync::mpsc::unbounded_channel();

    let context = HubContext {
        clock: clock.clone(),
        bus: bus.clone(),
        manager: Arc::clone(&manager),
        router: router.clone(),
        player: player.clone(),
        scheduler: Arc::clone(&scheduler),
        compensator: Arc::clone(&compensator),
        presets,
        rtp_outbound: rtp_outbound_tx.clone(),
    };

    if let Some(port) = config.rtp_port {
        let session_name = config
            .session_name
            .clone()
            .unwrap_or_else(|| "midi-hub".to_string());
        let rtp_clock = clock.clone();
        let rtp_bus = bus.clone();
        let rtp_running = Arc::clone(&running);
        let (rtp_inbound_tx, rtp_inbound_rx) = unbounded::<network::RtpInbound>();

        // Bridge inbound RTP commands into the router as device input.
        let bridge_ingress = router.ingress();
        let bridge_clock = clock.clone();
        std::thread::Builder::new()
            .name("rtp-ingress".to_string())
            .spawn(move || {
                for inbound in rtp_inbound_rx {
                    let now = bridge_clock.now_us();
                    for command in inbound.commands {
                        let mut running_status = None;
                        match midi_hub_core::MidiMessage::parse(&command.bytes, &mut running_status)
                        {
                            Ok((message, _)) => {
                                if bridge_ingress
                                    .send((
                                        inbound.device_id.clone(),
                                        midi_hub_core::MidiEvent::new(now, message),
                                    ))
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Err(e) => warn!("{}: {e}", inbound.device_id),
                        }
                    }
                }
            })?;

        tokio::spawn(async move {
            if let Err(e) = network::run_rtp_server(
                port,
                session_name,
                rtp_clock,
                rtp_inbound_tx,
                rtp_outbound_rx,
                rtp_bus,
                rtp_running,
            )
            .await
            {
                error!("RTP server failed: {e}");
            }
        });
    } else {
        drop(rtp_outbound_rx);
    }

    // --- Control API task ---
    if let Some(port) = config.api_port {
        let api_context = context.clone();
        let api_running = Arc::clone(&running);
        tokio::spawn(async move {
            if let Err(e) = api::run_api_server(port, api_context, api_running).await {
                error!("control API server failed: {e}");
            }
        });
    }

    // --- Main wait loop ---
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("service loop stopping");
    // Stop playback first so the chains release held notes, flush pending
    // NoteOffs, then tear the devices down.
    let _ = player.stop();
    if let Err(e) = scheduler.drain(DRAIN_DEADLINE) {
        warn!("{e}");
    }
    scheduler.shutdown();
    manager.shutdown();
    let _ = sysex_join;
    bus.publish(Event::PlayerState {
        state: midi_hub_core::TransportState::Stopped,
    });
    info!("service shut down");
    Ok(())
}
