//! Authoritative match state: waiting room, active match, leaderboard hold.
//!
//! [`Session`] is driven by exactly one task. It owns the grid, the peer
//! registry and the phase, so nothing here needs a lock beyond the per-link
//! mutexes it shares with the network tasks. Every method takes `now`
//! explicitly; datagrams it wants sent accumulate in an outgoing queue that
//! the caller drains with [`Session::take_outgoing`].

use crate::config::ServerConfig;
use crate::network::{bump, ServerStats};
use crate::peer_registry::{LinkTable, Lifecycle, Peer, PeerRegistry};
use log::{debug, info, warn};
use shared::payload::ClaimRequest;
use shared::{
    rank_leaderboard, ArqLink, ClaimOutcome, Grid, LeaderboardEntry, Message, Packet, Phase,
    SendOutcome, SessionEvent,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Work handed from the receive task to the session task.
#[derive(Debug)]
pub enum Inbound {
    /// JOIN_REQUEST from an unknown endpoint, or one that restarted.
    Connect { addr: SocketAddr, packet: Packet },
    /// In-order delivery from a known peer's link.
    Deliver { addr: SocketAddr, packet: Packet },
}

pub struct Session {
    config: ServerConfig,
    phase: Phase,
    phase_since: Instant,
    grid: Grid,
    registry: PeerRegistry,
    snapshot_id: u32,
    dirty: bool,
    participants: Vec<u8>,
    leaderboard: Vec<LeaderboardEntry>,
    events: mpsc::UnboundedSender<SessionEvent>,
    stats: Arc<ServerStats>,
    outgoing: Vec<(SocketAddr, Vec<u8>)>,
}

impl Session {
    pub fn new(
        config: ServerConfig,
        links: LinkTable,
        events: mpsc::UnboundedSender<SessionEvent>,
        stats: Arc<ServerStats>,
        now: Instant,
    ) -> Self {
        let registry = PeerRegistry::new(links, config.max_players, config.window_size);
        Self {
            grid: Grid::new(config.rows, config.cols),
            registry,
            phase: Phase::Waiting,
            phase_since: now,
            snapshot_id: 0,
            dirty: false,
            participants: Vec::new(),
            leaderboard: Vec::new(),
            events,
            stats,
            outgoing: Vec::new(),
            config,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn snapshot_id(&self) -> u32 {
        self.snapshot_id
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Player ids taking part in the current (or just ended) match.
    pub fn participants(&self) -> &[u8] {
        &self.participants
    }

    /// Standings of the most recent match.
    pub fn leaderboard(&self) -> &[LeaderboardEntry] {
        &self.leaderboard
    }

    /// Datagrams queued since the last call, with their destinations.
    pub fn take_outgoing(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn handle(&mut self, inbound: Inbound, now: Instant) {
        match inbound {
            Inbound::Connect { addr, packet } => self.on_connect(addr, packet, now),
            Inbound::Deliver { addr, packet } => match self.registry.find_by_addr(addr) {
                Some(id) => self.dispatch(id, packet, now),
                None => {
                    bump(&self.stats.unknown_peer_drops);
                    debug!("Dropping delivery from departed peer at {}", addr);
                }
            },
        }
        self.flush(now);
    }

    /// Timer-driven work: idle peers, match expiry, the leaderboard hold and
    /// pending snapshots.
    pub fn poll(&mut self, now: Instant) {
        for id in self.registry.idle_peers(now, self.config.idle_timeout) {
            info!("Peer {} timed out", id);
            self.depart(id, now);
        }

        let elapsed = now.saturating_duration_since(self.phase_since);
        match self.phase {
            Phase::Active if elapsed >= self.config.match_duration => {
                info!("Match time is up");
                self.end_match(now);
            }
            Phase::Ended if elapsed >= self.config.end_hold => self.return_to_waiting(now),
            _ => {}
        }

        self.flush(now);
    }

    fn on_connect(&mut self, addr: SocketAddr, packet: Packet, now: Instant) {
        if let Some(existing) = self.registry.find_by_addr(addr) {
            let restarted = self
                .registry
                .get(existing)
                .map_or(false, |peer| peer.link.lock().is_restart(&packet.header));
            if !restarted {
                // A retransmitted JOIN raced the first one; the link dedups it.
                self.feed(existing, packet, now);
                return;
            }
            info!("Peer {} at {} restarted, replacing it", existing, addr);
            self.depart(existing, now);
        }

        match self.registry.add_peer(addr, now) {
            Some(id) => {
                self.emit(SessionEvent::PeerJoined(id));
                self.feed(id, packet, now);
            }
            None => {
                warn!("Refusing join from {}: server full", addr);
                self.refuse(addr, packet, now);
            }
        }
    }

    /// Runs a packet through the peer's link and handles what it delivers.
    fn feed(&mut self, id: u8, packet: Packet, now: Instant) {
        let Some(peer) = self.registry.get(id) else {
            return;
        };

        let delivered = {
            let mut link = peer.link.lock();
            let received = link.on_receive(packet, now);
            let addr = peer.addr;
            self.outgoing
                .extend(link.drain_outgoing().into_iter().map(|bytes| (addr, bytes)));
            received.delivered
        };

        for packet in delivered {
            self.dispatch(id, packet, now);
        }
    }

    /// Answers a join the server has no room for. The throwaway link acks
    /// the request and carries a single JOIN_RESPONSE with id 0.
    fn refuse(&mut self, addr: SocketAddr, packet: Packet, now: Instant) {
        let mut link = ArqLink::new(self.config.window_size, now);
        link.on_receive(packet, now);
        link.send(
            shared::MessageType::JoinResponse,
            &Message::JoinResponse { player_id: 0 }.to_payload(),
            now,
        );
        self.outgoing
            .extend(link.drain_outgoing().into_iter().map(|bytes| (addr, bytes)));
    }

    fn dispatch(&mut self, id: u8, packet: Packet, now: Instant) {
        let message = match Message::parse(packet.header.msg_type, &packet.payload) {
            Ok(message) => message,
            Err(e) => {
                bump(&self.stats.protocol_drops);
                debug!("Dropping packet from peer {}: {}", id, e);
                return;
            }
        };

        match message {
            Message::JoinRequest => self.on_join(id, now),
            Message::ClaimRequest(claim) => {
                self.apply_claim(id, claim, packet.header.timestamp);
            }
            Message::Leave => {
                info!("Peer {} left", id);
                self.depart(id, now);
            }
            other => {
                bump(&self.stats.protocol_drops);
                debug!("Unexpected {:?} from peer {}", other.kind(), id);
            }
        }
    }

    fn on_join(&mut self, id: u8, now: Instant) {
        self.send_reliable(id, Message::JoinResponse { player_id: id }, now);

        let waiting = self
            .registry
            .get(id)
            .map_or(false, |peer| peer.lifecycle == Lifecycle::WaitingRoom);
        if waiting {
            self.broadcast_waiting_room(now);
            self.try_start(now);
        }
    }

    /// Applies one claim using the sender's packet timestamp.
    ///
    /// Rejections are silent towards the peer; the ARQ ack has already gone
    /// out by the time a claim reaches the session.
    pub fn apply_claim(&mut self, id: u8, claim: ClaimRequest, timestamp: u64) -> ClaimOutcome {
        let active = self.phase == Phase::Active
            && self
                .registry
                .get(id)
                .map_or(false, |peer| peer.lifecycle == Lifecycle::Active);

        let outcome = if active {
            self.grid
                .apply_claim(claim.row as usize, claim.col as usize, id, timestamp)
        } else {
            ClaimOutcome::NotActive
        };

        if outcome.is_accepted() {
            bump(&self.stats.claims_accepted);
            self.dirty = true;
            debug!("Peer {} claimed ({}, {}) at {}", id, claim.row, claim.col, timestamp);
        } else {
            bump(&self.stats.claims_rejected);
            debug!(
                "Rejected claim ({}, {}) from peer {}: {:?}",
                claim.row, claim.col, id, outcome
            );
        }
        outcome
    }

    /// Removes a peer for good and releases everything it owned.
    pub fn depart(&mut self, id: u8, now: Instant) {
        let Some(peer) = self.registry.remove_peer(id) else {
            return;
        };
        let was_waiting = self.participants.iter().all(|p| *p != id);

        let freed = self.grid.release(id);
        if freed > 0 {
            debug!("Released {} cells of peer {}", freed, id);
            self.dirty = true;
        }
        self.participants.retain(|p| *p != id);
        self.emit(SessionEvent::PeerLeft(peer.id));

        if was_waiting {
            self.broadcast_waiting_room(now);
        } else if self.phase == Phase::Active
            && self.registry.count_in(Lifecycle::Active) < self.config.min_players
        {
            info!("Not enough players left to continue the match");
            self.end_match(now);
        }
    }

    fn try_start(&mut self, now: Instant) {
        if self.phase != Phase::Waiting
            || self.registry.count_in(Lifecycle::WaitingRoom) < self.config.min_players
        {
            return;
        }

        let ids = self.registry.ids_in(Lifecycle::WaitingRoom);
        for id in &ids {
            if let Some(peer) = self.registry.get_mut(*id) {
                peer.lifecycle = Lifecycle::Active;
            }
        }
        self.participants = ids.clone();
        self.set_phase(Phase::Active, now);
        info!("Match started with players {:?}", ids);

        let duration_secs = self.config.match_duration_secs();
        for id in ids {
            self.send_reliable(id, Message::GameStart { duration_secs }, now);
        }
        self.dirty = true;
    }

    fn end_match(&mut self, now: Instant) {
        // Final grid goes out ahead of GAME_OVER.
        self.flush(now);

        let scores: Vec<(u8, u16)> = self
            .participants
            .iter()
            .map(|id| (*id, self.grid.count_owned_by(*id).min(u16::MAX as usize) as u16))
            .collect();
        self.leaderboard = rank_leaderboard(&scores);
        self.set_phase(Phase::Ended, now);

        // Waiting-room peers see the result too; only participants are ranked.
        let everyone: Vec<u8> = self.registry.peers().map(|peer| peer.id).collect();
        for id in everyone {
            self.send_reliable(id, Message::GameOver, now);
            self.send_reliable(id, Message::Leaderboard(self.leaderboard.clone()), now);
        }
        info!("Match over, leaderboard {:?}", self.leaderboard);
        self.emit(SessionEvent::LeaderboardReady(self.leaderboard.clone()));
    }

    fn return_to_waiting(&mut self, now: Instant) {
        for id in std::mem::take(&mut self.participants) {
            if self.registry.remove_peer(id).is_some() {
                self.emit(SessionEvent::PeerLeft(id));
            }
        }

        self.grid.reset();
        self.dirty = false;
        self.set_phase(Phase::Waiting, now);
        self.broadcast_waiting_room(now);
        self.try_start(now);
    }

    fn set_phase(&mut self, phase: Phase, now: Instant) {
        info!("Session {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        self.phase_since = now;
        self.emit(SessionEvent::PhaseChanged(phase));
    }

    fn broadcast_waiting_room(&mut self, now: Instant) {
        let players = self.registry.ids_in(Lifecycle::WaitingRoom);
        let required = self.config.min_players.min(u8::MAX as usize) as u8;
        for id in players.clone() {
            self.send_reliable(
                id,
                Message::WaitingRoom {
                    players: players.clone(),
                    required,
                },
                now,
            );
        }
    }

    /// Sends through the peer's link, parking the message in its backlog when
    /// the window is full so later messages never overtake it. The backlog
    /// holds at most one window of messages; beyond that they are dropped.
    fn send_reliable(&mut self, id: u8, message: Message, now: Instant) {
        let limit = self.config.window_size as usize;
        let Some(peer) = self.registry.get_mut(id) else {
            return;
        };
        let kind = message.kind();

        if peer.backlog.is_empty() {
            if transmit(peer, &message, now, &mut self.outgoing) != SendOutcome::WindowFull {
                return;
            }
            debug!("Window full for peer {}, deferring {:?}", id, kind);
        }

        if !peer.defer(message, limit) {
            bump(&self.stats.window_full_drops);
            warn!("Backlog full for peer {}, dropping {:?}", id, kind);
        }
    }

    fn flush(&mut self, now: Instant) {
        for peer in self.registry.peers_mut() {
            while let Some(message) = peer.backlog.front() {
                match transmit(peer, message, now, &mut self.outgoing) {
                    SendOutcome::WindowFull => break,
                    _ => {
                        peer.backlog.pop_front();
                    }
                }
            }
        }

        if self.dirty {
            self.dirty = false;
            self.snapshot_id = self.snapshot_id.wrapping_add(1);
            for peer in self.registry.peers_mut() {
                if peer.lifecycle == Lifecycle::Active {
                    peer.snapshot_pending = true;
                }
            }
            self.emit(SessionEvent::GridChanged(self.grid.snapshot(self.snapshot_id)));
        }

        if !self.registry.peers().any(|peer| peer.snapshot_pending) {
            return;
        }

        // Retries always carry the latest grid.
        let snapshot = Message::BoardSnapshot {
            snapshot_id: self.snapshot_id,
            packed: self.grid.snapshot(self.snapshot_id).packed(),
        };
        for peer in self.registry.peers_mut() {
            if !peer.snapshot_pending || !peer.backlog.is_empty() {
                continue;
            }
            match transmit(peer, &snapshot, now, &mut self.outgoing) {
                SendOutcome::Sent { .. } => {
                    peer.snapshot_pending = false;
                    bump(&self.stats.snapshots_sent);
                }
                // Stays pending for the next flush.
                SendOutcome::WindowFull => {}
                SendOutcome::Closed | SendOutcome::Rejected => peer.snapshot_pending = false,
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

fn transmit(
    peer: &Peer,
    message: &Message,
    now: Instant,
    outgoing: &mut Vec<(SocketAddr, Vec<u8>)>,
) -> SendOutcome {
    let mut link = peer.link.lock();
    let payload = message.to_payload();
    let outcome = match message {
        Message::BoardSnapshot { snapshot_id, .. } => {
            link.send_with_snapshot(message.kind(), &payload, *snapshot_id as u16, now)
        }
        _ => link.send(message.kind(), &payload, now),
    };
    outgoing.extend(
        link.drain_outgoing()
            .into_iter()
            .map(|bytes| (peer.addr, bytes)),
    );
    outcome
}
