//! Client-side mirror of the server session.
//!
//! [`ClientSession`] turns the reliable messages the server sends into the
//! same [`SessionEvent`]s the server publishes, so presentation code can be
//! written once against either side.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::{GridSnapshot, LeaderboardEntry, Message, Phase, SessionEvent};

/// What the local player currently knows about its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatus {
    pub player_id: Option<u8>,
    pub phase: Phase,
    /// The server answered the join with "full".
    pub refused: bool,
    pub last_snapshot_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ClientSession {
    rows: usize,
    cols: usize,
    player_id: Option<u8>,
    phase: Phase,
    refused: bool,
    waiting: Vec<u8>,
    grid: Option<GridSnapshot>,
    last_snapshot_id: Option<u32>,
    leaderboard: Vec<LeaderboardEntry>,
    match_duration_secs: Option<u16>,
}

impl ClientSession {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            player_id: None,
            phase: Phase::Waiting,
            refused: false,
            waiting: Vec::new(),
            grid: None,
            last_snapshot_id: None,
            leaderboard: Vec::new(),
            match_duration_secs: None,
        }
    }

    pub fn player_id(&self) -> Option<u8> {
        self.player_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn grid(&self) -> Option<&GridSnapshot> {
        self.grid.as_ref()
    }

    pub fn leaderboard(&self) -> &[LeaderboardEntry] {
        &self.leaderboard
    }

    pub fn match_duration_secs(&self) -> Option<u16> {
        self.match_duration_secs
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            player_id: self.player_id,
            phase: self.phase,
            refused: self.refused,
            last_snapshot_id: self.last_snapshot_id,
        }
    }

    /// True when a claim on (row, col) is worth sending at all.
    pub fn can_claim(&self, row: u8, col: u8) -> bool {
        self.player_id.is_some()
            && self.phase == Phase::Active
            && (row as usize) < self.rows
            && (col as usize) < self.cols
    }

    /// Forgets the previous membership before joining again. The last
    /// applied snapshot id is kept until the server answers the join, so
    /// late snapshots from the old membership stay discarded.
    pub fn reset(&mut self) {
        self.player_id = None;
        self.phase = Phase::Waiting;
        self.refused = false;
        self.waiting.clear();
        self.grid = None;
        self.match_duration_secs = None;
    }

    /// Applies one message delivered by the link, returning the events it
    /// produces.
    pub fn apply(&mut self, message: Message) -> Vec<SessionEvent> {
        match message {
            Message::JoinResponse { player_id: 0 } => {
                warn!("Server is full, join refused");
                self.refused = true;
                Vec::new()
            }
            Message::JoinResponse { player_id } => {
                info!("Joined as player {}", player_id);
                self.player_id = Some(player_id);
                // A restarted server numbers its snapshots from 1 again.
                self.last_snapshot_id = None;
                vec![SessionEvent::PeerJoined(player_id)]
            }
            Message::WaitingRoom { players, required } => {
                debug!("Waiting room {:?}, {} required", players, required);
                let mut events = Vec::new();
                for id in &players {
                    if !self.waiting.contains(id) && Some(*id) != self.player_id {
                        events.push(SessionEvent::PeerJoined(*id));
                    }
                }
                for id in &self.waiting {
                    if !players.contains(id) && Some(*id) != self.player_id {
                        events.push(SessionEvent::PeerLeft(*id));
                    }
                }
                self.waiting = players;
                events
            }
            Message::GameStart { duration_secs } => {
                info!("Match started ({} s)", duration_secs);
                self.phase = Phase::Active;
                self.match_duration_secs = Some(duration_secs);
                self.waiting.clear();
                vec![SessionEvent::PhaseChanged(Phase::Active)]
            }
            Message::BoardSnapshot {
                snapshot_id,
                packed,
            } => {
                if self.last_snapshot_id.map_or(false, |last| snapshot_id <= last) {
                    debug!("Ignoring stale snapshot {}", snapshot_id);
                    return Vec::new();
                }
                match GridSnapshot::unpack(snapshot_id, &packed, self.rows, self.cols) {
                    Some(snapshot) => {
                        self.last_snapshot_id = Some(snapshot_id);
                        self.grid = Some(snapshot.clone());
                        vec![SessionEvent::GridChanged(snapshot)]
                    }
                    None => {
                        warn!(
                            "Snapshot {} has {} bytes, expected a {}x{} grid",
                            snapshot_id,
                            packed.len(),
                            self.rows,
                            self.cols
                        );
                        Vec::new()
                    }
                }
            }
            Message::GameOver if self.phase != Phase::Active => {
                debug!("A match we did not play in is over");
                Vec::new()
            }
            Message::GameOver => {
                info!("Match over");
                self.phase = Phase::Ended;
                vec![SessionEvent::PhaseChanged(Phase::Ended)]
            }
            Message::Leaderboard(entries) => {
                self.leaderboard = entries.clone();
                vec![SessionEvent::LeaderboardReady(entries)]
            }
            other => {
                debug!("Ignoring {:?} from server", other.kind());
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::payload::pack_cells;

    fn snapshot(id: u32, owner_of_first: u8) -> Message {
        let mut cells = vec![0u8; 400];
        cells[0] = owner_of_first;
        Message::BoardSnapshot {
            snapshot_id: id,
            packed: pack_cells(&cells),
        }
    }

    #[test]
    fn test_join_response_sets_player_id() {
        let mut session = ClientSession::new(20, 20);
        let events = session.apply(Message::JoinResponse { player_id: 3 });
        assert_eq!(events, vec![SessionEvent::PeerJoined(3)]);
        assert_eq!(session.player_id(), Some(3));
        assert!(!session.can_claim(0, 0), "no claims before the match starts");
    }

    #[test]
    fn test_refused_join() {
        let mut session = ClientSession::new(20, 20);
        assert!(session.apply(Message::JoinResponse { player_id: 0 }).is_empty());
        assert!(session.status().refused);
        assert_eq!(session.player_id(), None);
    }

    #[test]
    fn test_waiting_room_diffs_become_events() {
        let mut session = ClientSession::new(20, 20);
        session.apply(Message::JoinResponse { player_id: 1 });

        let events = session.apply(Message::WaitingRoom { players: vec![1, 2, 3], required: 4 });
        assert_eq!(events, vec![SessionEvent::PeerJoined(2), SessionEvent::PeerJoined(3)]);

        let events = session.apply(Message::WaitingRoom { players: vec![1, 3], required: 4 });
        assert_eq!(events, vec![SessionEvent::PeerLeft(2)]);
    }

    #[test]
    fn test_game_start_enables_claims() {
        let mut session = ClientSession::new(20, 20);
        session.apply(Message::JoinResponse { player_id: 1 });
        let events = session.apply(Message::GameStart { duration_secs: 60 });

        assert_eq!(events, vec![SessionEvent::PhaseChanged(Phase::Active)]);
        assert!(session.can_claim(19, 19));
        assert!(!session.can_claim(20, 0));
        assert_eq!(session.match_duration_secs(), Some(60));
    }

    #[test]
    fn test_stale_snapshots_are_discarded() {
        let mut session = ClientSession::new(20, 20);

        assert_eq!(session.apply(snapshot(5, 2)).len(), 1);
        assert!(session.apply(snapshot(4, 3)).is_empty());
        assert!(session.apply(snapshot(5, 3)).is_empty());
        assert_eq!(session.grid().and_then(|g| g.owner(0, 0)), Some(2));

        assert_eq!(session.apply(snapshot(6, 3)).len(), 1);
        assert_eq!(session.grid().and_then(|g| g.owner(0, 0)), Some(3));
    }

    #[test]
    fn test_wrong_sized_snapshot_is_ignored() {
        let mut session = ClientSession::new(20, 20);
        let events = session.apply(Message::BoardSnapshot { snapshot_id: 1, packed: vec![0; 10] });
        assert!(events.is_empty());
        assert_eq!(session.status().last_snapshot_id, None);
    }

    #[test]
    fn test_game_over_then_leaderboard() {
        let mut session = ClientSession::new(20, 20);
        session.apply(Message::JoinResponse { player_id: 1 });
        session.apply(Message::GameStart { duration_secs: 60 });

        assert_eq!(
            session.apply(Message::GameOver),
            vec![SessionEvent::PhaseChanged(Phase::Ended)]
        );
        assert!(!session.can_claim(0, 0));

        let entries = vec![LeaderboardEntry { player_id: 1, score: 4, rank: 1 }];
        assert_eq!(
            session.apply(Message::Leaderboard(entries.clone())),
            vec![SessionEvent::LeaderboardReady(entries)]
        );
    }

    #[test]
    fn test_result_of_other_match_keeps_waiting() {
        let mut session = ClientSession::new(20, 20);
        session.apply(Message::JoinResponse { player_id: 3 });

        assert!(session.apply(Message::GameOver).is_empty());
        assert_eq!(session.phase(), Phase::Waiting);

        let entries = vec![LeaderboardEntry { player_id: 1, score: 2, rank: 1 }];
        assert_eq!(
            session.apply(Message::Leaderboard(entries.clone())),
            vec![SessionEvent::LeaderboardReady(entries)]
        );
        assert_eq!(session.phase(), Phase::Waiting);
    }

    #[test]
    fn test_reset_keeps_snapshot_watermark() {
        let mut session = ClientSession::new(20, 20);
        session.apply(Message::JoinResponse { player_id: 1 });
        session.apply(snapshot(9, 1));
        session.reset();

        assert_eq!(session.player_id(), None);
        assert_eq!(session.phase(), Phase::Waiting);
        assert!(session.apply(snapshot(9, 1)).is_empty());
    }

    #[test]
    fn test_rejoin_accepts_ids_of_restarted_server() {
        let mut session = ClientSession::new(20, 20);
        session.apply(Message::JoinResponse { player_id: 1 });
        session.apply(snapshot(40, 1));
        session.reset();

        session.apply(Message::JoinResponse { player_id: 2 });
        assert_eq!(session.apply(snapshot(1, 2)).len(), 1);
        assert_eq!(session.status().last_snapshot_id, Some(1));
        assert_eq!(session.grid().and_then(|g| g.owner(0, 0)), Some(2));
    }
}
