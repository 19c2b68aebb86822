//! Per-peer RTP-MIDI session: AppleMIDI handshake, clock sync, data
//! exchange with gap detection and journal-based recovery.
//!
//! The session is a synchronous state machine driven with explicit `now_us`
//! timestamps; the UDP server task owns the socket and feeds datagrams in.

use std::collections::{BTreeSet, VecDeque};

use log::{debug, info, warn};
use midi_hub_core::{HubError, HubResult};

use super::control::ControlMessage;
use super::journal::{Journal, JournalEntry, JOURNAL_HISTORY};
use super::packet::{RtpMidiPacket, TimedCommand};

/// Handshake gives up after this long without an OK.
pub const HANDSHAKE_TIMEOUT_US: u64 = 5_000_000;

/// A sequence gap larger than this is treated as a peer restart rather
/// than packet loss.
const RESET_GAP: u16 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingOk,
    ClockSync,
    Established,
    Terminated,
}

/// What a datagram did to the session, surfaced to the server task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Established { peer_ssrc: u32 },
    Terminated,
    MidiReceived(Vec<TimedCommand>),
    /// Commands replayed out of a peer's journal after a gap.
    MidiRecovered(Vec<TimedCommand>),
    PacketLoss(u32),
}

/// Replies to send back to the peer plus events for the caller.
#[derive(Debug, Default)]
pub struct HandleOutcome {
    pub replies: Vec<Vec<u8>>,
    pub events: Vec<SessionEvent>,
}

pub struct RtpMidiSession {
    name: String,
    ssrc: u32,
    initiator_token: u32,
    state: SessionState,
    peer_ssrc: Option<u32>,
    sequence: u16,
    handshake_started_us: Option<u64>,
    send_history: VecDeque<JournalEntry>,
    received: BTreeSet<u16>,
    /// Most recently accepted sequence number; wrap-aware, unlike the
    /// ordered `received` set.
    last_seq: Option<u16>,
}

impl RtpMidiSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ssrc: rand::random(),
            initiator_token: rand::random(),
            state: SessionState::Idle,
            peer_ssrc: None,
            sequence: rand::random(),
            handshake_started_us: None,
            send_history: VecDeque::with_capacity(JOURNAL_HISTORY),
            received: BTreeSet::new(),
            last_seq: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn peer_ssrc(&self) -> Option<u32> {
        self.peer_ssrc
    }

    /// Start the handshake as initiator. Returns the IN datagram to send.
    pub fn initiate(&mut self, now_us: u64) -> HubResult<Vec<u8>> {
        if self.state != SessionState::Idle {
            return Err(HubError::InvalidState {
                op: "initiate",
                state: format!("{:?}", self.state),
            });
        }
        self.state = SessionState::AwaitingOk;
        self.handshake_started_us = Some(now_us);
        info!("session '{}': sending invitation", self.name);
        Ok(ControlMessage::invitation(self.initiator_token, self.ssrc, &self.name).serialize())
    }

    /// Expire a pending handshake. Returns true when it timed out, in which
    /// case the session is back to `Idle` and the device should surface a
    /// transport error.
    pub fn check_handshake_timeout(&mut self, now_us: u64) -> bool {
        if self.state == SessionState::AwaitingOk {
            if let Some(started) = self.handshake_started_us {
                if now_us.saturating_sub(started) >= HANDSHAKE_TIMEOUT_US {
                    warn!("session '{}': handshake timed out", self.name);
                    self.state = SessionState::Idle;
                    self.handshake_started_us = None;
                    return true;
                }
            }
        }
        false
    }

    /// Feed one received datagram (control or data).
    pub fn handle_datagram(&mut self, data: &[u8], now_us: u64) -> HubResult<HandleOutcome> {
        if ControlMessage::matches(data) {
            self.handle_control(ControlMessage::parse(data)?, now_us)
        } else {
            self.handle_data(data)
        }
    }

    fn handle_control(&mut self, msg: ControlMessage, now_us: u64) -> HubResult<HandleOutcome> {
        let mut out = HandleOutcome::default();
        match msg {
            ControlMessage::Invitation(inv) => match self.state {
                SessionState::Idle => {
                    info!(
                        "session '{}': accepting invitation from '{}'",
                        self.name, inv.name
                    );
                    self.peer_ssrc = Some(inv.header.ssrc);
                    self.state = SessionState::Established;
                    out.replies.push(
                        ControlMessage::accepted(inv.header.initiator_token, self.ssrc, &self.name)
                            .serialize(),
                    );
                    out.events.push(SessionEvent::Established {
                        peer_ssrc: inv.header.ssrc,
                    });
                }
                _ => {
                    debug!(
                        "session '{}': rejecting invitation in state {:?}",
                        self.name, self.state
                    );
                    out.replies.push(
                        ControlMessage::rejected(inv.header.initiator_token, self.ssrc).serialize(),
                    );
                }
            },
            ControlMessage::InvitationAccepted(ok) => {
                if self.state == SessionState::AwaitingOk
                    && ok.header.initiator_token == self.initiator_token
                {
                    info!(
                        "session '{}': invitation accepted by '{}'",
                        self.name, ok.name
                    );
                    self.peer_ssrc = Some(ok.header.ssrc);
                    self.state = SessionState::ClockSync;
                    self.handshake_started_us = None;
                    // Kick off the CK exchange as initiator.
                    out.replies.push(
                        ControlMessage::clock_sync(self.ssrc, 0, [now_us / 100, 0, 0]).serialize(),
                    );
                    out.events.push(SessionEvent::Established {
                        peer_ssrc: ok.header.ssrc,
                    });
                }
            }
            ControlMessage::InvitationRejected(_) => {
                warn!("session '{}': invitation rejected", self.name);
                self.state = SessionState::Idle;
                self.handshake_started_us = None;
            }
            ControlMessage::EndSession(_) => {
                info!("session '{}': peer ended the session", self.name);
                self.state = SessionState::Terminated;
                out.events.push(SessionEvent::Terminated);
            }
            ControlMessage::ClockSync(ck) => match ck.count {
                0 => {
                    // Responder leg: echo the peer's timestamp, add ours.
                    out.replies.push(
                        ControlMessage::clock_sync(
                            self.ssrc,
                            1,
                            [ck.timestamps[0], now_us / 100, 0],
                        )
                        .serialize(),
                    );
                }
                1 => {
                    out.replies.push(
                        ControlMessage::clock_sync(
                            self.ssrc,
                            2,
                            [ck.timestamps[0], ck.timestamps[1], now_us / 100],
                        )
                        .serialize(),
                    );
                    if self.state == SessionState::ClockSync {
                        self.state = SessionState::Established;
                    }
                }
                2 => {
                    debug!("session '{}': clock sync complete", self.name);
                    if self.state == SessionState::ClockSync {
                        self.state = SessionState::Established;
                    }
                }
                other => {
                    warn!("session '{}': CK with count {other}", self.name);
                }
            },
        }
        Ok(out)
    }

    fn handle_data(&mut self, data: &[u8]) -> HubResult<HandleOutcome> {
        let packet = RtpMidiPacket::parse(data)?;
        let mut out = HandleOutcome::default();
        let seq = packet.header.sequence_number;

        if self.received.contains(&seq) {
            debug!("session '{}': duplicate packet {seq}", self.name);
            return Ok(out);
        }

        if let Some(last) = self.last_seq {
            let expected = last.wrapping_add(1);
            let gap = seq.wrapping_sub(expected);
            if gap >= 0x8000 {
                // Older than the stream position: a straggler, drop it.
                debug!("session '{}': stale packet {seq} (last {last})", self.name);
                return Ok(out);
            }
            if gap > RESET_GAP {
                info!("session '{}': large gap, assuming peer restart", self.name);
                self.received.clear();
            } else if gap > 0 {
                let mut recovered = Vec::new();
                let mut lost = 0u32;
                let mut missing = expected;
                while missing != seq {
                    if self.received.contains(&missing) {
                        missing = missing.wrapping_add(1);
                        continue;
                    }
                    match packet.journal.as_ref().and_then(|j| j.entry(missing)) {
                        Some(entry) => {
                            self.received.insert(missing);
                            recovered.extend(entry.commands.iter().cloned());
                        }
                        None => lost += 1,
                    }
                    missing = missing.wrapping_add(1);
                }
                if !recovered.is_empty() {
                    info!(
                        "session '{}': recovered {} command(s) from journal",
                        self.name,
                        recovered.len()
                    );
                    out.events.push(SessionEvent::MidiRecovered(recovered));
                }
                if lost > 0 {
                    warn!("session '{}': {lost} packet(s) lost", self.name);
                    out.events.push(SessionEvent::PacketLoss(lost));
                }
            }
        }

        self.received.insert(seq);
        self.last_seq = Some(seq);
        // Bound the receive history; only the recent window matters for
        // duplicate and gap detection.
        while self.received.len() > 4096 {
            let oldest = *self.received.iter().next().unwrap();
            self.received.remove(&oldest);
        }

        if !packet.commands.is_empty() {
            out.events.push(SessionEvent::MidiReceived(packet.commands));
        }
        Ok(out)
    }

    /// Build a data packet carrying `commands`, with a journal covering the
    /// send history. `timestamp` is in the session's media clock units.
    pub fn send_midi(
        &mut self,
        commands: Vec<TimedCommand>,
        timestamp: u32,
    ) -> HubResult<Vec<u8>> {
        if self.state != SessionState::Established && self.state != SessionState::ClockSync {
            return Err(HubError::InvalidState {
                op: "send_midi",
                state: format!("{:?}", self.state),
            });
        }

        let mut packet = RtpMidiPacket::new(self.ssrc, self.sequence, timestamp);
        packet.commands = commands.clone();
        if !self.send_history.is_empty() {
            packet.journal = Some(Journal::from_history(
                self.send_history.iter().cloned().collect(),
            ));
        }
        let bytes = packet.serialize()?;

        if self.send_history.len() == JOURNAL_HISTORY {
            self.send_history.pop_front();
        }
        self.send_history.push_back(JournalEntry {
            sequence_nr: self.sequence,
            commands,
        });
        self.sequence = self.sequence.wrapping_add(1);
        Ok(bytes)
    }

    /// Build the BY datagram and terminate locally.
    pub fn end(&mut self) -> Vec<u8> {
        self.state = SessionState::Terminated;
        ControlMessage::end_session(self.initiator_token, self.ssrc).serialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn establish_pair() -> (RtpMidiSession, RtpMidiSession) {
        let mut initiator = RtpMidiSession::new("initiator");
        let mut responder = RtpMidiSession::new("responder");

        let invite = initiator.initiate(0).unwrap();
        let outcome = responder.handle_datagram(&invite, 10).unwrap();
        assert_eq!(responder.state(), SessionState::Established);
        let ok = &outcome.replies[0];

        let outcome = initiator.handle_datagram(ok, 20).unwrap();
        assert!(matches!(
            outcome.events[0],
            SessionEvent::Established { .. }
        ));
        // CK0 -> CK1 -> CK2 completes the sync.
        let ck0 = &outcome.replies[0];
        let ck1 = &responder.handle_datagram(ck0, 30).unwrap().replies[0];
        let outcome = initiator.handle_datagram(ck1, 40).unwrap();
        assert_eq!(initiator.state(), SessionState::Established);
        let ck2 = &outcome.replies[0];
        responder.handle_datagram(ck2, 50).unwrap();

        (initiator, responder)
    }

    #[test]
    fn handshake_and_clock_sync() {
        let (initiator, responder) = establish_pair();
        assert_eq!(initiator.state(), SessionState::Established);
        assert_eq!(responder.state(), SessionState::Established);
        assert_eq!(initiator.peer_ssrc(), Some(responder.ssrc()));
        assert_eq!(responder.peer_ssrc(), Some(initiator.ssrc()));
    }

    #[test]
    fn handshake_timeout_after_five_seconds() {
        let mut session = RtpMidiSession::new("s");
        session.initiate(0).unwrap();
        assert!(!session.check_handshake_timeout(4_999_999));
        assert!(session.check_handshake_timeout(5_000_000));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn midi_flows_after_establishment() {
        let (mut tx, mut rx) = establish_pair();
        let commands = vec![TimedCommand::new(0, vec![0x90, 60, 100])];
        let packet = tx.send_midi(commands.clone(), 1000).unwrap();
        let outcome = rx.handle_datagram(&packet, 100).unwrap();
        assert_eq!(outcome.events, vec![SessionEvent::MidiReceived(commands)]);
    }

    #[test]
    fn send_before_establishment_is_invalid_state() {
        let mut session = RtpMidiSession::new("s");
        assert!(matches!(
            session.send_midi(vec![], 0),
            Err(HubError::InvalidState { .. })
        ));
    }

    #[test]
    fn dropped_packet_recovers_from_journal() {
        let (mut tx, mut rx) = establish_pair();
        let first = tx
            .send_midi(vec![TimedCommand::new(0, vec![0x90, 60, 100])], 0)
            .unwrap();
        let dropped = tx
            .send_midi(vec![TimedCommand::new(0, vec![0x90, 64, 100])], 10)
            .unwrap();
        let third = tx
            .send_midi(vec![TimedCommand::new(0, vec![0x90, 67, 100])], 20)
            .unwrap();

        rx.handle_datagram(&first, 0).unwrap();
        drop(dropped);
        let outcome = rx.handle_datagram(&third, 30).unwrap();

        // The missing packet's commands come back through the journal and
        // no loss is reported.
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::MidiRecovered(cmds) if cmds[0].bytes == vec![0x90, 64, 100])));
        assert!(!outcome
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::PacketLoss(_))));
    }

    #[test]
    fn unrecoverable_gap_reports_packet_loss() {
        let (mut tx, mut rx) = establish_pair();
        let first = tx
            .send_midi(vec![TimedCommand::new(0, vec![0x90, 60, 100])], 0)
            .unwrap();
        rx.handle_datagram(&first, 0).unwrap();

        // Skip a sequence number without journal coverage by sending a
        // packet whose journal we strip.
        let _lost = tx
            .send_midi(vec![TimedCommand::new(0, vec![0x90, 62, 100])], 5)
            .unwrap();
        let mut next = tx
            .send_midi(vec![TimedCommand::new(0, vec![0x90, 64, 100])], 10)
            .unwrap();
        // Rebuild the packet without its journal.
        let parsed = RtpMidiPacket::parse(&next).unwrap();
        let mut stripped = RtpMidiPacket::new(
            parsed.header.ssrc,
            parsed.header.sequence_number,
            parsed.header.timestamp,
        );
        stripped.commands = parsed.commands;
        next = stripped.serialize().unwrap();

        let outcome = rx.handle_datagram(&next, 20).unwrap();
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::PacketLoss(1))));
    }

    #[test]
    fn duplicate_packets_are_ignored() {
        let (mut tx, mut rx) = establish_pair();
        let packet = tx
            .send_midi(vec![TimedCommand::new(0, vec![0x90, 60, 100])], 0)
            .unwrap();
        assert_eq!(rx.handle_datagram(&packet, 0).unwrap().events.len(), 1);
        assert!(rx.handle_datagram(&packet, 10).unwrap().events.is_empty());
    }
}
