//! UDP server task hosting one `RtpMidiSession` per peer. Accepts session
//! invitations, answers clock sync, forwards received commands to the
//! pipeline ingress and sends queued outbound commands to established
//! peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use midi_hub_core::{Event, EventBus, HubError, MidiClock};

use crate::rtp::packet::TimedCommand;
use crate::rtp::session::{RtpMidiSession, SessionEvent};

/// Commands received from a peer, tagged with its synthetic device ID.
#[derive(Debug, Clone)]
pub struct RtpInbound {
    pub device_id: String,
    pub commands: Vec<TimedCommand>,
}

/// Commands to push out. `peer = None` fans out to every established peer.
#[derive(Debug, Clone)]
pub struct RtpOutbound {
    pub peer: Option<SocketAddr>,
    pub commands: Vec<TimedCommand>,
}

pub fn rtp_device_id(peer: &SocketAddr) -> String {
    format!("rtp:{peer}")
}

/// Run the RTP-MIDI server until the stop token flips.
pub async fn run_rtp_server(
    port: u16,
    session_name: String,
    clock: MidiClock,
    inbound_tx: crossbeam_channel::Sender<RtpInbound>,
    mut outbound_rx: mpsc::UnboundedReceiver<RtpOutbound>,
    bus: EventBus,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    info!("RTP-MIDI server listening on port {port}");

    let mut sessions: HashMap<SocketAddr, RtpMidiSession> = HashMap::new();
    let mut buf = vec![0u8; 2048];
    let mut housekeeping = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let (len, peer) = match recv {
                    Ok(ok) => ok,
                    Err(e) => {
                        error!("RTP socket receive failed: {e}");
                        continue;
                    }
                };
                let session = sessions
                    .entry(peer)
                    .or_insert_with(|| RtpMidiSession::new(session_name.clone()));
                let now = clock.now_us();
                match session.handle_datagram(&buf[..len], now) {
                    Ok(outcome) => {
                        for reply in outcome.replies {
                            if let Err(e) = socket.send_to(&reply, peer).await {
                                error!("RTP send to {peer} failed: {e}");
                            }
                        }
                        for event in outcome.events {
                            dispatch_session_event(peer, event, &inbound_tx, &bus);
                        }
                    }
                    // A bad datagram never tears the session down.
                    Err(e) => warn!("dropping datagram from {peer}: {e}"),
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(outbound) = outbound else { break };
                let now = clock.now_us();
                let media_ts = (now / 100) as u32;
                let targets: Vec<SocketAddr> = match outbound.peer {
                    Some(peer) => vec![peer],
                    None => sessions.keys().copied().collect(),
                };
                for peer in targets {
                    let Some(session) = sessions.get_mut(&peer) else { continue };
                    match session.send_midi(outbound.commands.clone(), media_ts) {
                        Ok(packet) => {
                            if let Err(e) = socket.send_to(&packet, peer).await {
                                error!("RTP send to {peer} failed: {e}");
                            }
                        }
                        Err(HubError::InvalidState { .. }) => {}
                        Err(e) => warn!("cannot send to {peer}: {e}"),
                    }
                }
            }
            _ = housekeeping.tick() => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let now = clock.now_us();
                for (peer, session) in sessions.iter_mut() {
                    if session.check_handshake_timeout(now) {
                        bus.publish(Event::DeviceError {
                            device_id: rtp_device_id(peer),
                            kind: HubError::TransportClosed.to_string(),
                        });
                    }
                }
            }
        }
    }

    // Tell every peer we are going away.
    for (peer, session) in sessions.iter_mut() {
        let bye = session.end();
        let _ = socket.send_to(&bye, *peer).await;
    }
    info!("RTP-MIDI server stopped");
    Ok(())
}

fn dispatch_session_event(
    peer: SocketAddr,
    event: SessionEvent,
    inbound_tx: &crossbeam_channel::Sender<RtpInbound>,
    bus: &EventBus,
) {
    let device_id = rtp_device_id(&peer);
    match event {
        SessionEvent::Established { peer_ssrc } => {
            info!("RTP peer {peer} established (ssrc {peer_ssrc:#010X})");
            bus.publish(Event::DeviceConnected { device_id });
        }
        SessionEvent::Terminated => {
            bus.publish(Event::DeviceDisconnected { device_id });
        }
        SessionEvent::MidiReceived(commands) | SessionEvent::MidiRecovered(commands) => {
            if inbound_tx
                .send(RtpInbound {
                    device_id,
                    commands,
                })
                .is_err()
            {
                warn!("RTP ingress channel closed; dropping commands");
            }
        }
        SessionEvent::PacketLoss(count) => {
            warn!("{}", HubError::PacketLoss(count));
            bus.publish(Event::DeviceError {
                device_id,
                kind: HubError::PacketLoss(count).to_string(),
            });
        }
    }
}
