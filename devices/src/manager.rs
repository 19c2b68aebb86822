//! Device registry. Lookups run against a copy-on-write snapshot so the
//! hot path never waits on registry edits; writers serialize on the write
//! lock and swap in a new map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use midi_hub_core::{Event, EventBus, HubError, HubResult, MidiClock, MidiEvent, MidiMessage};

use crate::{ConnectionState, DeviceInfo, MidiDevice};

/// How long `remove` waits for queued sends before force-closing.
pub const DRAIN_DEADLINE_MS: u64 = 500;

/// Reader task idle sleep between empty polls.
const READER_IDLE: Duration = Duration::from_millis(1);

type SharedDevice = Arc<Mutex<Box<dyn MidiDevice>>>;

#[derive(Clone)]
struct DeviceEntry {
    info: DeviceInfo,
    device: SharedDevice,
}

struct ReaderTask {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct DeviceManager {
    registry: RwLock<Arc<HashMap<String, DeviceEntry>>>,
    readers: Mutex<HashMap<String, ReaderTask>>,
    ingress: Sender<(String, MidiEvent)>,
    sysex_tap: Sender<(String, Vec<u8>)>,
    bus: EventBus,
    clock: MidiClock,
}

impl DeviceManager {
    pub fn new(
        ingress: Sender<(String, MidiEvent)>,
        sysex_tap: Sender<(String, Vec<u8>)>,
        bus: EventBus,
        clock: MidiClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(Arc::new(HashMap::new())),
            readers: Mutex::new(HashMap::new()),
            ingress,
            sysex_tap,
            bus,
            clock,
        })
    }

    fn snapshot(&self) -> Arc<HashMap<String, DeviceEntry>> {
        Arc::clone(&self.registry.read().expect("registry lock poisoned"))
    }

    /// Register and open a device. Input-capable devices get a dedicated
    /// reader task wired into the router ingress.
    pub fn add(self: &Arc<Self>, device: Box<dyn MidiDevice>) -> HubResult<()> {
        let info = device.info().clone();
        let id = info.id.clone();

        {
            let guard = self.registry.read().expect("registry lock poisoned");
            if guard.contains_key(&id) {
                return Err(HubError::InvalidState {
                    op: "device.add",
                    state: format!("device {id} already registered"),
                });
            }
        }

        let shared: SharedDevice = Arc::new(Mutex::new(device));
        shared.lock().expect("device lock poisoned").open()?;

        {
            let mut guard = self.registry.write().expect("registry lock poisoned");
            let mut next: HashMap<String, DeviceEntry> = (**guard).clone();
            next.insert(
                id.clone(),
                DeviceEntry {
                    info: info.clone(),
                    device: Arc::clone(&shared),
                },
            );
            *guard = Arc::new(next);
        }

        if info.direction.is_input() {
            self.spawn_reader(&id, shared);
        }

        info!("device {id} ({}) registered", info.name);
        self.bus.publish(Event::DeviceConnected {
            device_id: id,
        });
        Ok(())
    }

    fn spawn_reader(self: &Arc<Self>, id: &str, device: SharedDevice) {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let ingress = self.ingress.clone();
        let sysex_tap = self.sysex_tap.clone();
        let bus = self.bus.clone();
        let device_id = id.to_string();

        let handle = std::thread::Builder::new()
            .name(format!("reader-{device_id}"))
            .spawn(move || {
                debug!("reader task for {device_id} started");
                while !stop_flag.load(Ordering::SeqCst) {
                    let polled = device.lock().expect("device lock poisoned").poll();
                    match polled {
                        Ok(events) if events.is_empty() => std::thread::sleep(READER_IDLE),
                        Ok(events) => {
                            for event in events {
                                if let MidiMessage::SysEx(frame) = &event.message {
                                    let _ = sysex_tap.send((device_id.clone(), frame.clone()));
                                }
                                if ingress.send((device_id.clone(), event)).is_err() {
                                    warn!("ingress closed; reader for {device_id} exiting");
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            error!("device {device_id} input failed: {e}");
                            bus.publish(Event::DeviceError {
                                device_id: device_id.clone(),
                                kind: e.to_string(),
                            });
                            return;
                        }
                    }
                }
                debug!("reader task for {device_id} stopped");
            })
            .expect("failed to spawn reader task");

        self.readers
            .lock()
            .expect("readers lock poisoned")
            .insert(id.to_string(), ReaderTask { stop, handle });
    }

    /// Drain pending sends (bounded), close, and drop the device.
    pub fn remove(&self, id: &str) -> HubResult<()> {
        let entry = {
            let mut guard = self.registry.write().expect("registry lock poisoned");
            let mut next: HashMap<String, DeviceEntry> = (**guard).clone();
            let entry = next.remove(id).ok_or_else(|| HubError::NotFound {
                entity: "device",
                id: id.to_string(),
            })?;
            *guard = Arc::new(next);
            entry
        };

        if let Some(reader) = self
            .readers
            .lock()
            .expect("readers lock poisoned")
            .remove(id)
        {
            reader.stop.store(true, Ordering::SeqCst);
            let _ = reader.handle.join();
        }

        // Bounded drain, then force-close.
        let deadline = Instant::now() + Duration::from_millis(DRAIN_DEADLINE_MS);
        loop {
            let pending = entry
                .device
                .lock()
                .expect("device lock poisoned")
                .pending_sends();
            if pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!("device {id}: force-closing with {pending} send(s) pending");
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        entry
            .device
            .lock()
            .expect("device lock poisoned")
            .close()?;

        info!("device {id} removed");
        self.bus.publish(Event::DeviceDisconnected {
            device_id: id.to_string(),
        });
        Ok(())
    }

    pub fn list(&self) -> Vec<DeviceInfo> {
        let mut infos: Vec<DeviceInfo> = self
            .snapshot()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn info(&self, id: &str) -> HubResult<DeviceInfo> {
        self.snapshot()
            .get(id)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| HubError::NotFound {
                entity: "device",
                id: id.to_string(),
            })
    }

    pub fn state_of(&self, id: &str) -> HubResult<ConnectionState> {
        let snapshot = self.snapshot();
        let entry = snapshot.get(id).ok_or_else(|| HubError::NotFound {
            entity: "device",
            id: id.to_string(),
        })?;
        let state = entry.device.lock().expect("device lock poisoned").state();
        Ok(state)
    }

    /// Send one message to a device by ID. This is the scheduler's sink.
    pub fn send_to(&self, id: &str, message: &MidiMessage) -> HubResult<()> {
        let snapshot = self.snapshot();
        let entry = snapshot.get(id).ok_or_else(|| HubError::NotFound {
            entity: "device",
            id: id.to_string(),
        })?;
        let result = entry
            .device
            .lock()
            .expect("device lock poisoned")
            .send(message);
        if let Err(e) = &result {
            self.bus.publish(Event::DeviceError {
                device_id: id.to_string(),
                kind: e.to_string(),
            });
        }
        result
    }

    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Close everything. Readers stop first so no input races teardown.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.snapshot().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.remove(&id) {
                warn!("shutdown: removing {id} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_dev::VirtualMidiDevice;
    use crossbeam_channel::unbounded;
    use midi_hub_core::Channel;

    fn manager() -> (
        Arc<DeviceManager>,
        crossbeam_channel::Receiver<(String, MidiEvent)>,
        crossbeam_channel::Receiver<(String, Vec<u8>)>,
    ) {
        let (ingress_tx, ingress_rx) = unbounded();
        let (sysex_tx, sysex_rx) = unbounded();
        let manager = DeviceManager::new(ingress_tx, sysex_tx, EventBus::new(16), MidiClock::new());
        (manager, ingress_rx, sysex_rx)
    }

    #[test]
    fn add_list_remove() {
        let (manager, _ingress, _sysex) = manager();
        let (dev, _port) = VirtualMidiDevice::new("v1", "Port A", MidiClock::new());
        manager.add(Box::new(dev)).unwrap();
        assert_eq!(manager.list().len(), 1);
        assert_eq!(manager.state_of("v1").unwrap(), ConnectionState::Connected);

        manager.remove("v1").unwrap();
        assert!(manager.list().is_empty());
        assert!(matches!(
            manager.remove("v1"),
            Err(HubError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let (manager, _ingress, _sysex) = manager();
        let (a, _pa) = VirtualMidiDevice::new("dup", "A", MidiClock::new());
        let (b, _pb) = VirtualMidiDevice::new("dup", "B", MidiClock::new());
        manager.add(Box::new(a)).unwrap();
        assert!(matches!(
            manager.add(Box::new(b)),
            Err(HubError::InvalidState { .. })
        ));
    }

    #[test]
    fn reader_feeds_ingress() {
        let (manager, ingress, _sysex) = manager();
        let (dev, port) = VirtualMidiDevice::new("v2", "Keys", MidiClock::new());
        manager.add(Box::new(dev)).unwrap();

        port.inject(MidiMessage::NoteOn {
            channel: Channel::new(1).unwrap(),
            note: 60,
            velocity: 100,
        });
        let (device_id, event) = ingress
            .recv_timeout(Duration::from_secs(1))
            .expect("reader should forward the event");
        assert_eq!(device_id, "v2");
        assert!(matches!(event.message, MidiMessage::NoteOn { .. }));
        manager.remove("v2").unwrap();
    }

    #[test]
    fn sysex_input_hits_the_tap() {
        let (manager, ingress, sysex) = manager();
        let (dev, port) = VirtualMidiDevice::new("v3", "Pad", MidiClock::new());
        manager.add(Box::new(dev)).unwrap();

        port.inject(MidiMessage::SysEx(vec![0xF0, 0x43, 0x01, 0xF7]));
        let (device_id, frame) = sysex
            .recv_timeout(Duration::from_secs(1))
            .expect("sysex tap should fire");
        assert_eq!(device_id, "v3");
        assert_eq!(frame, vec![0xF0, 0x43, 0x01, 0xF7]);
        // The frame still flows through normal ingress as well.
        assert!(ingress.recv_timeout(Duration::from_secs(1)).is_ok());
        manager.remove("v3").unwrap();
    }

    #[test]
    fn send_to_unknown_device_is_not_found() {
        let (manager, _ingress, _sysex) = manager();
        assert!(matches!(
            manager.send_to("ghost", &MidiMessage::all_notes_off(Channel::new(1).unwrap())),
            Err(HubError::NotFound { .. })
        ));
    }
}
