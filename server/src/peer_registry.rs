//! Peer bookkeeping for the grid server
//!
//! This module tracks every remote endpoint the server has admitted:
//! - Player id assignment (smallest unused id, capped by capacity)
//! - Lifecycle of each peer (waiting room, active in a match, departed)
//! - Ownership of one ARQ link per peer, shared with the network tasks
//!
//! The registry is owned by the session task, which is the only writer of
//! link-table membership. Network tasks only read the table to find the link
//! for a source address.

use log::info;
use parking_lot::{Mutex, RwLock};
use shared::{ArqLink, Message};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type SharedLink = Arc<Mutex<ArqLink>>;

/// Links indexed by remote address, read by the receive and retransmit tasks.
pub type LinkTable = Arc<RwLock<HashMap<SocketAddr, SharedLink>>>;

pub fn new_link_table() -> LinkTable {
    Arc::new(RwLock::new(HashMap::new()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    WaitingRoom,
    Active,
    Departed,
}

/// A connected remote player
#[derive(Debug)]
pub struct Peer {
    pub id: u8,
    pub addr: SocketAddr,
    pub lifecycle: Lifecycle,
    pub link: SharedLink,
    /// A snapshot newer than the last one sent is waiting for window space.
    pub snapshot_pending: bool,
    /// Reliable messages that found the window full, sent in order later.
    pub backlog: VecDeque<Message>,
}

impl Peer {
    /// Time since anything was last heard from this peer.
    pub fn idle_for(&self, now: Instant) -> Duration {
        self.link.lock().idle_for(now)
    }

    /// Parks `message` until the window has room. A newer WAITING_ROOM
    /// replaces a queued one in place. Returns false when the backlog already
    /// holds `limit` messages and `message` was dropped.
    pub fn defer(&mut self, message: Message, limit: usize) -> bool {
        if let Message::WaitingRoom { .. } = message {
            if let Some(queued) = self
                .backlog
                .iter_mut()
                .find(|queued| matches!(queued, Message::WaitingRoom { .. }))
            {
                *queued = message;
                return true;
            }
        }

        if self.backlog.len() >= limit {
            return false;
        }
        self.backlog.push_back(message);
        true
    }
}

/// Manages admitted peers and their links
///
/// Peers are kept ordered by id so broadcasts and leaderboards visit them in
/// a stable order.
pub struct PeerRegistry {
    peers: BTreeMap<u8, Peer>,
    links: LinkTable,
    max_peers: usize,
    window_size: u32,
}

impl PeerRegistry {
    pub fn new(links: LinkTable, max_peers: usize, window_size: u32) -> Self {
        Self {
            peers: BTreeMap::new(),
            links,
            max_peers,
            window_size,
        }
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    /// Admits a peer from `addr` into the waiting room.
    ///
    /// Returns the assigned id, or `None` when the server is full. Callers
    /// must remove any previous peer at `addr` first.
    pub fn add_peer(&mut self, addr: SocketAddr, now: Instant) -> Option<u8> {
        if self.is_full() {
            return None;
        }

        let id = (1..=self.max_peers as u8).find(|id| !self.peers.contains_key(id))?;
        let link = Arc::new(Mutex::new(ArqLink::new(self.window_size, now)));
        self.links.write().insert(addr, Arc::clone(&link));

        info!("Peer {} joined from {}", id, addr);
        self.peers.insert(
            id,
            Peer {
                id,
                addr,
                lifecycle: Lifecycle::WaitingRoom,
                link,
                snapshot_pending: false,
                backlog: VecDeque::new(),
            },
        );
        Some(id)
    }

    /// Removes a peer and shuts its link down.
    ///
    /// The link is closed while the table is write-locked, so the
    /// retransmission task can never pick it up again afterwards.
    pub fn remove_peer(&mut self, id: u8) -> Option<Peer> {
        let mut peer = self.peers.remove(&id)?;
        {
            let mut links = self.links.write();
            if links
                .get(&peer.addr)
                .map_or(false, |link| Arc::ptr_eq(link, &peer.link))
            {
                links.remove(&peer.addr);
            }
            peer.link.lock().close();
        }
        peer.lifecycle = Lifecycle::Departed;
        info!("Peer {} ({}) removed", id, peer.addr);
        Some(peer)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<u8> {
        self.peers
            .values()
            .find(|peer| peer.addr == addr)
            .map(|peer| peer.id)
    }

    pub fn get(&self, id: u8) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    /// Ids in the given lifecycle, ascending.
    pub fn ids_in(&self, lifecycle: Lifecycle) -> Vec<u8> {
        self.peers
            .values()
            .filter(|peer| peer.lifecycle == lifecycle)
            .map(|peer| peer.id)
            .collect()
    }

    pub fn count_in(&self, lifecycle: Lifecycle) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.lifecycle == lifecycle)
            .count()
    }

    /// Peers whose link has been silent for longer than `timeout`.
    pub fn idle_peers(&self, now: Instant, timeout: Duration) -> Vec<u8> {
        self.peers
            .values()
            .filter(|peer| peer.idle_for(now) > timeout)
            .map(|peer| peer.id)
            .collect()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::MessageType;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn registry(max: usize) -> PeerRegistry {
        PeerRegistry::new(new_link_table(), max, 6)
    }

    #[test]
    fn test_backlog_is_capped() {
        let mut reg = registry(4);
        reg.add_peer(addr(1), Instant::now());
        let peer = reg.get_mut(1).unwrap();

        assert!(peer.defer(Message::GameStart { duration_secs: 60 }, 2));
        assert!(peer.defer(Message::GameOver, 2));
        assert!(!peer.defer(Message::Leaderboard(Vec::new()), 2));
        assert_eq!(peer.backlog.len(), 2);
    }

    #[test]
    fn test_newer_waiting_room_replaces_queued_one() {
        let mut reg = registry(4);
        reg.add_peer(addr(1), Instant::now());
        let peer = reg.get_mut(1).unwrap();

        for n in 1..=50u8 {
            let players = (1..=n % 4 + 1).collect();
            assert!(peer.defer(Message::WaitingRoom { players, required: 2 }, 2));
        }
        assert!(peer.defer(Message::GameStart { duration_secs: 60 }, 2));
        assert!(peer.defer(Message::WaitingRoom { players: vec![1], required: 2 }, 2));

        assert_eq!(
            peer.backlog.iter().collect::<Vec<_>>(),
            vec![
                &Message::WaitingRoom { players: vec![1], required: 2 },
                &Message::GameStart { duration_secs: 60 },
            ]
        );
    }

    #[test]
    fn test_add_peer_assigns_sequential_ids() {
        let mut reg = registry(4);
        let now = Instant::now();
        assert_eq!(reg.add_peer(addr(1), now), Some(1));
        assert_eq!(reg.add_peer(addr(2), now), Some(2));
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.links().read().len(), 2);
        assert_eq!(reg.get(1).map(|p| p.lifecycle), Some(Lifecycle::WaitingRoom));
    }

    #[test]
    fn test_freed_id_is_reused_first() {
        let mut reg = registry(4);
        let now = Instant::now();
        reg.add_peer(addr(1), now);
        reg.add_peer(addr(2), now);
        reg.add_peer(addr(3), now);

        reg.remove_peer(2);
        assert_eq!(reg.add_peer(addr(4), now), Some(2));
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut reg = registry(1);
        let now = Instant::now();
        assert!(reg.add_peer(addr(1), now).is_some());
        assert!(reg.is_full());
        assert_eq!(reg.add_peer(addr(2), now), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_remove_closes_link_and_clears_table() {
        let mut reg = registry(2);
        let now = Instant::now();
        let id = reg.add_peer(addr(1), now).unwrap();
        let link = Arc::clone(&reg.get(id).unwrap().link);
        link.lock().send(MessageType::GameOver, &[], now);

        let removed = reg.remove_peer(id).unwrap();
        assert_eq!(removed.lifecycle, Lifecycle::Departed);
        assert!(reg.links().read().is_empty());
        assert!(link.lock().is_closed());
        assert_eq!(link.lock().in_flight(), 0);
        assert!(reg.remove_peer(id).is_none());
    }

    #[test]
    fn test_find_by_addr() {
        let mut reg = registry(2);
        let now = Instant::now();
        reg.add_peer(addr(1), now);
        let id = reg.add_peer(addr(2), now).unwrap();

        assert_eq!(reg.find_by_addr(addr(2)), Some(id));
        assert_eq!(reg.find_by_addr(addr(9)), None);
    }

    #[test]
    fn test_idle_peers_use_link_last_heard() {
        let mut reg = registry(2);
        let start = Instant::now();
        reg.add_peer(addr(1), start);

        let timeout = Duration::from_secs(10);
        assert!(reg.idle_peers(start + Duration::from_secs(5), timeout).is_empty());
        assert_eq!(reg.idle_peers(start + Duration::from_secs(11), timeout), vec![1]);
    }

    #[test]
    fn test_ids_by_lifecycle() {
        let mut reg = registry(3);
        let now = Instant::now();
        reg.add_peer(addr(1), now);
        reg.add_peer(addr(2), now);
        reg.get_mut(2).unwrap().lifecycle = Lifecycle::Active;

        assert_eq!(reg.ids_in(Lifecycle::WaitingRoom), vec![1]);
        assert_eq!(reg.ids_in(Lifecycle::Active), vec![2]);
        assert_eq!(reg.count_in(Lifecycle::Active), 1);
    }
}
