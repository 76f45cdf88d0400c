//! Selective-Repeat ARQ for one remote peer.
//!
//! [`ArqLink`] owns both directions of a reliable channel: a send window of
//! at most `N` unacknowledged packets with per-packet timers, and a receive
//! reorder buffer that turns arbitrary arrival order into exactly-once,
//! in-order delivery.
//!
//! ```text
//!   base                next_seq
//!    │                     │
//! ───┼─────────────────────┼───────────────▶ seq space
//!    │ <── in flight  ───▶ │ <─ sendable ─▶ base + N
//! ```
//!
//! The link performs no I/O. Every datagram it wants on the wire (new data,
//! retransmissions, ACKs, heartbeats) is queued and collected by the caller
//! through [`ArqLink::drain_outgoing`].

use crate::rtt::RttEstimator;
use crate::wire::{self, Header, MessageType, Packet};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW_SIZE: u32 = 6;

/// Result of handing a message to the link (or, client side, of a local
/// claim submission).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    /// Queued for transmission under `seq`.
    Sent { seq: u32 },
    /// `N` packets are already unacknowledged; nothing was sent.
    WindowFull,
    /// The link has been shut down.
    Closed,
    /// Refused before reaching the link (invalid locally or unencodable).
    Rejected,
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub sent: u64,
    pub retransmitted: u64,
    /// Sends refused because the window was full.
    pub dropped: u64,
    pub received: u64,
    pub duplicates: u64,
    pub reorder_overflow: u64,
    pub rtt_samples: u64,
}

#[derive(Debug, Clone)]
struct InFlight {
    bytes: Vec<u8>,
    sent_at: Instant,
    retransmitted: bool,
    transmissions: u32,
}

/// What one inbound packet produced.
#[derive(Debug, Default)]
pub struct Received {
    /// Packets now deliverable, in sequence order.
    pub delivered: Vec<Packet>,
    /// True when the packet was a duplicate of something already delivered.
    pub duplicate: bool,
}

#[derive(Debug)]
pub struct ArqLink {
    window_size: u32,
    base: u32,
    next_seq: u32,
    in_flight: BTreeMap<u32, InFlight>,

    expected_seq: u32,
    reorder: BTreeMap<u32, Packet>,
    last_delivered: Option<u32>,
    /// Header timestamp of the delivered seq-0 packet.
    origin_timestamp: Option<u64>,

    rtt: RttEstimator,
    last_heard: Instant,
    closed: bool,
    outbox: Vec<Vec<u8>>,
    stats: LinkStats,
}

impl ArqLink {
    pub fn new(window_size: u32, now: Instant) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            base: 0,
            next_seq: 0,
            in_flight: BTreeMap::new(),
            expected_seq: 0,
            reorder: BTreeMap::new(),
            last_delivered: None,
            origin_timestamp: None,
            rtt: RttEstimator::new(),
            last_heard: now,
            closed: false,
            outbox: Vec::new(),
            stats: LinkStats::default(),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    pub fn can_send(&self) -> bool {
        !self.closed && self.next_seq < self.base.saturating_add(self.window_size)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn last_heard(&self) -> Instant {
        self.last_heard
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heard)
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            rtt_samples: self.rtt.samples(),
            ..self.stats.clone()
        }
    }

    /// Piggyback value for outgoing data: last in-order delivered seq + 1,
    /// or 0 when nothing has been delivered yet.
    pub fn piggyback_ack(&self) -> u32 {
        self.last_delivered.map(|seq| seq.wrapping_add(1)).unwrap_or(0)
    }

    pub fn send(&mut self, kind: MessageType, payload: &[u8], now: Instant) -> SendOutcome {
        self.send_with_snapshot(kind, payload, 0, now)
    }

    /// Sends a reliable message, stamping `snapshot_id` into the header.
    pub fn send_with_snapshot(
        &mut self,
        kind: MessageType,
        payload: &[u8],
        snapshot_id: u16,
        now: Instant,
    ) -> SendOutcome {
        if self.closed {
            return SendOutcome::Closed;
        }
        if !self.can_send() {
            self.stats.dropped += 1;
            return SendOutcome::WindowFull;
        }

        let seq = self.next_seq;
        let bytes = match wire::encode(kind, seq, self.piggyback_ack(), snapshot_id, payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {:?} (seq {}): {}", kind, seq, e);
                return SendOutcome::Rejected;
            }
        };

        self.outbox.push(bytes.clone());
        self.in_flight.insert(
            seq,
            InFlight {
                bytes,
                sent_at: now,
                retransmitted: false,
                transmissions: 1,
            },
        );
        self.next_seq += 1;
        self.stats.sent += 1;
        SendOutcome::Sent { seq }
    }

    /// Queues an unsequenced keep-alive.
    pub fn send_heartbeat(&mut self) {
        if self.closed {
            return;
        }
        match wire::encode(MessageType::Heartbeat, 0, self.piggyback_ack(), 0, &[]) {
            Ok(bytes) => self.outbox.push(bytes),
            Err(e) => warn!("Failed to encode heartbeat: {}", e),
        }
    }

    /// Requeues every in-flight packet older than the current RTO, byte for
    /// byte. Returns the sequence numbers that were resent.
    pub fn poll_retransmit(&mut self, now: Instant) -> Vec<u32> {
        if self.closed {
            return Vec::new();
        }

        let rto = self.rtt.rto();
        let mut resent = Vec::new();
        for (seq, entry) in self.in_flight.iter_mut() {
            if now.saturating_duration_since(entry.sent_at) > rto {
                self.outbox.push(entry.bytes.clone());
                entry.sent_at = now;
                entry.retransmitted = true;
                entry.transmissions += 1;
                resent.push(*seq);
            }
        }

        if !resent.is_empty() {
            self.stats.retransmitted += resent.len() as u64;
            debug!("Retransmitting {:?} (rto {:.0} ms)", resent, self.rtt.rto_ms());
        }
        resent
    }

    /// Marks `seq` acknowledged. Returns false when it was not in flight.
    pub fn on_ack(&mut self, seq: u32, now: Instant) -> bool {
        let Some(entry) = self.in_flight.remove(&seq) else {
            return false;
        };

        // Karn's rule: retransmitted packets give ambiguous samples.
        if !entry.retransmitted {
            self.rtt
                .record_sample(now.saturating_duration_since(entry.sent_at));
        }

        while self.base < self.next_seq && !self.in_flight.contains_key(&self.base) {
            self.base += 1;
        }
        true
    }

    /// Number of times `seq` has been put on the wire, if still in flight.
    pub fn transmissions(&self, seq: u32) -> Option<u32> {
        self.in_flight.get(&seq).map(|entry| entry.transmissions)
    }

    /// True when `header` is a fresh JOIN_REQUEST from a peer that restarted
    /// its sequence space after this link already delivered its seq 0.
    pub fn is_restart(&self, header: &Header) -> bool {
        header.seq == 0
            && header.kind() == Ok(MessageType::JoinRequest)
            && self
                .origin_timestamp
                .map_or(false, |origin| origin != header.timestamp)
    }

    /// Processes one validated packet from the peer.
    pub fn on_receive(&mut self, packet: Packet, now: Instant) -> Received {
        let mut received = Received::default();
        if self.closed {
            return received;
        }
        self.last_heard = now;

        match packet.header.kind() {
            Ok(MessageType::Ack) => {
                self.on_ack(packet.header.ack, now);
                return received;
            }
            Ok(MessageType::Heartbeat) => return received,
            _ => {}
        }

        self.stats.received += 1;
        let seq = packet.header.seq;
        self.queue_ack(seq);

        let piggyback = packet.header.ack;
        if piggyback != 0 {
            self.on_ack(piggyback - 1, now);
        }

        if seq == self.expected_seq {
            self.deliver(packet, &mut received.delivered);
            while let Some(next) = self.reorder.remove(&self.expected_seq) {
                self.deliver(next, &mut received.delivered);
            }
        } else if seq > self.expected_seq {
            let in_window = seq - self.expected_seq < self.window_size;
            if self.reorder.contains_key(&seq) {
                self.stats.duplicates += 1;
                received.duplicate = true;
            } else if in_window && (self.reorder.len() as u32) < self.window_size {
                self.reorder.insert(seq, packet);
            } else {
                self.stats.reorder_overflow += 1;
                debug!(
                    "Dropping seq {} outside reorder window (expected {})",
                    seq, self.expected_seq
                );
            }
        } else {
            self.stats.duplicates += 1;
            received.duplicate = true;
        }

        received
    }

    fn deliver(&mut self, packet: Packet, out: &mut Vec<Packet>) {
        if packet.header.seq == 0 {
            self.origin_timestamp = Some(packet.header.timestamp);
        }
        self.last_delivered = Some(packet.header.seq);
        self.expected_seq = packet.header.seq + 1;
        out.push(packet);
    }

    fn queue_ack(&mut self, seq: u32) {
        match wire::encode(MessageType::Ack, 0, seq, 0, &[]) {
            Ok(bytes) => self.outbox.push(bytes),
            Err(e) => warn!("Failed to encode ack for seq {}: {}", seq, e),
        }
    }

    /// Takes every datagram queued since the last call.
    pub fn drain_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    /// Stops the link: the window, reorder buffer and queued datagrams are
    /// discarded and nothing is ever retransmitted again.
    pub fn close(&mut self) {
        self.closed = true;
        self.in_flight.clear();
        self.reorder.clear();
        self.outbox.clear();
        self.base = self.next_seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode, encode_at};

    fn data(seq: u32, ack: u32) -> Packet {
        let bytes = encode_at(MessageType::ClaimRequest, seq, ack, 0, &[0, 0, 0, 0], 1_000).unwrap();
        decode(&bytes).into_packet().unwrap()
    }

    fn ack(seq: u32) -> Packet {
        let bytes = encode_at(MessageType::Ack, 0, seq, 0, &[], 1_000).unwrap();
        decode(&bytes).into_packet().unwrap()
    }

    fn join(timestamp: u64) -> Packet {
        let bytes = encode_at(MessageType::JoinRequest, 0, 0, 0, &[], timestamp).unwrap();
        decode(&bytes).into_packet().unwrap()
    }

    fn assert_window_invariant(link: &ArqLink) {
        assert!(link.base() <= link.next_seq());
        assert!(link.next_seq() <= link.base() + link.window_size());
        assert!(link.in_flight() <= link.window_size() as usize);
    }

    #[test]
    fn test_send_assigns_sequential_numbers() {
        let now = Instant::now();
        let mut link = ArqLink::new(6, now);

        assert_eq!(link.send(MessageType::JoinRequest, &[], now), SendOutcome::Sent { seq: 0 });
        assert_eq!(link.send(MessageType::Leave, &[], now), SendOutcome::Sent { seq: 1 });
        assert_eq!(link.drain_outgoing().len(), 2);
        assert!(link.drain_outgoing().is_empty());
        assert_eq!(link.stats().sent, 2);
    }

    #[test]
    fn test_window_full_rejects_immediately() {
        let now = Instant::now();
        let mut link = ArqLink::new(6, now);

        for expected in 0..6 {
            assert_eq!(
                link.send(MessageType::GameOver, &[], now),
                SendOutcome::Sent { seq: expected }
            );
            assert_window_invariant(&link);
        }
        assert_eq!(link.send(MessageType::GameOver, &[], now), SendOutcome::WindowFull);
        assert_eq!(link.stats().dropped, 1);
        assert_eq!(link.next_seq(), 6);
        assert_window_invariant(&link);
    }

    #[test]
    fn test_selective_ack_slides_base_only_past_contiguous_acks() {
        let now = Instant::now();
        let mut link = ArqLink::new(6, now);
        for _ in 0..4 {
            link.send(MessageType::GameOver, &[], now);
        }

        assert!(link.on_ack(1, now));
        assert_eq!(link.base(), 0);
        assert!(link.on_ack(0, now));
        assert_eq!(link.base(), 2);
        assert!(!link.on_ack(0, now), "second ack for the same seq is ignored");
        assert!(!link.on_ack(42, now));
        assert!(link.on_ack(3, now));
        assert!(link.on_ack(2, now));
        assert_eq!(link.base(), 4);
        assert_eq!(link.in_flight(), 0);
        assert_window_invariant(&link);
    }

    #[test]
    fn test_window_reopens_after_ack() {
        let now = Instant::now();
        let mut link = ArqLink::new(2, now);
        link.send(MessageType::GameOver, &[], now);
        link.send(MessageType::GameOver, &[], now);
        assert_eq!(link.send(MessageType::GameOver, &[], now), SendOutcome::WindowFull);

        link.on_ack(0, now);
        assert_eq!(link.send(MessageType::GameOver, &[], now), SendOutcome::Sent { seq: 2 });
    }

    #[test]
    fn test_out_of_order_arrival_is_delivered_in_order_once() {
        let now = Instant::now();
        let mut link = ArqLink::new(6, now);

        let first = link.on_receive(data(0, 0), now);
        assert_eq!(first.delivered.len(), 1);

        let early = link.on_receive(data(2, 0), now);
        assert!(early.delivered.is_empty());
        assert_eq!(link.buffered(), 1);

        let late = link.on_receive(data(1, 0), now);
        let seqs: Vec<u32> = late.delivered.iter().map(|p| p.header.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(link.expected_seq(), 3);
        assert_eq!(link.buffered(), 0);

        // Every data packet is acknowledged, including the buffered one.
        assert_eq!(link.drain_outgoing().len(), 3);

        let replay = link.on_receive(data(2, 0), now);
        assert!(replay.delivered.is_empty());
        assert!(replay.duplicate);
        assert_eq!(link.stats().duplicates, 1);
        assert_eq!(link.drain_outgoing().len(), 1, "duplicates are still acked");
    }

    #[test]
    fn test_reorder_buffer_bounded_by_window() {
        let now = Instant::now();
        let mut link = ArqLink::new(6, now);

        let beyond = link.on_receive(data(6, 0), now);
        assert!(beyond.delivered.is_empty());
        assert_eq!(link.buffered(), 0);
        assert_eq!(link.stats().reorder_overflow, 1);

        link.on_receive(data(5, 0), now);
        assert_eq!(link.buffered(), 1);
    }

    #[test]
    fn test_retransmits_after_rto_with_same_bytes() {
        let start = Instant::now();
        let mut link = ArqLink::new(6, start);
        link.send(MessageType::ClaimRequest, &[1, 2, 0, 0], start);
        let original = link.drain_outgoing().remove(0);

        // Initial RTO is 100 + 4 * 50 ms.
        assert!(link.poll_retransmit(start + Duration::from_millis(299)).is_empty());
        assert_eq!(link.poll_retransmit(start + Duration::from_millis(301)), vec![0]);

        let resent = link.drain_outgoing();
        assert_eq!(resent, vec![original]);
        assert_eq!(link.transmissions(0), Some(2));
        assert_eq!(link.stats().retransmitted, 1);

        // Timer was reset by the retransmission.
        assert!(link.poll_retransmit(start + Duration::from_millis(400)).is_empty());
    }

    #[test]
    fn test_only_timed_out_packets_are_resent() {
        let start = Instant::now();
        let mut link = ArqLink::new(6, start);
        link.send(MessageType::GameOver, &[], start);
        link.send(MessageType::GameOver, &[], start + Duration::from_millis(200));

        assert_eq!(link.poll_retransmit(start + Duration::from_millis(350)), vec![0]);
    }

    #[test]
    fn test_karn_rule_skips_retransmitted_samples() {
        let start = Instant::now();
        let mut link = ArqLink::new(6, start);
        link.send(MessageType::GameOver, &[], start);
        link.send(MessageType::GameOver, &[], start);
        link.poll_retransmit(start + Duration::from_millis(500));

        link.on_ack(0, start + Duration::from_millis(510));
        assert_eq!(link.rtt().samples(), 0);

        link.send(MessageType::GameOver, &[], start + Duration::from_millis(600));
        link.on_ack(2, start + Duration::from_millis(620));
        assert_eq!(link.rtt().samples(), 1);
        assert_eq!(link.stats().rtt_samples, 1);
    }

    #[test]
    fn test_ack_packet_and_piggyback_both_acknowledge() {
        let now = Instant::now();
        let mut link = ArqLink::new(6, now);
        link.send(MessageType::GameOver, &[], now);
        link.send(MessageType::GameOver, &[], now);

        link.on_receive(ack(1), now);
        assert_eq!(link.in_flight(), 1);

        // Peer delivered our seq 0, so it piggybacks 0 + 1.
        link.on_receive(data(0, 1), now);
        assert_eq!(link.in_flight(), 0);
        assert_eq!(link.base(), 2);
    }

    #[test]
    fn test_outgoing_data_piggybacks_last_delivered() {
        let now = Instant::now();
        let mut link = ArqLink::new(6, now);
        assert_eq!(link.piggyback_ack(), 0);

        link.on_receive(data(0, 0), now);
        link.on_receive(data(1, 0), now);
        link.drain_outgoing();
        assert_eq!(link.piggyback_ack(), 2);

        link.send(MessageType::GameOver, &[], now);
        let sent = decode(&link.drain_outgoing()[0]);
        assert_eq!(sent.header.ack, 2);
    }

    #[test]
    fn test_restart_detected_by_new_join_timestamp() {
        let now = Instant::now();
        let mut link = ArqLink::new(6, now);
        assert!(!link.is_restart(&join(10).header));

        link.on_receive(join(10), now);
        assert!(!link.is_restart(&join(10).header), "retransmitted join is not a restart");
        assert!(link.is_restart(&join(11).header));
        assert!(!link.is_restart(&data(0, 0).header));
    }

    #[test]
    fn test_closed_link_is_inert() {
        let now = Instant::now();
        let mut link = ArqLink::new(6, now);
        link.send(MessageType::GameOver, &[], now);
        link.close();

        assert_eq!(link.in_flight(), 0);
        assert!(link.drain_outgoing().is_empty());
        assert_eq!(link.send(MessageType::GameOver, &[], now), SendOutcome::Closed);
        assert!(link.poll_retransmit(now + Duration::from_secs(5)).is_empty());
        assert!(link.on_receive(data(0, 0), now).delivered.is_empty());
    }

    #[test]
    fn test_any_receive_refreshes_last_heard() {
        let start = Instant::now();
        let mut link = ArqLink::new(6, start);
        let later = start + Duration::from_secs(3);
        assert_eq!(link.idle_for(later), Duration::from_secs(3));

        let heartbeat = decode(&encode_at(MessageType::Heartbeat, 0, 0, 0, &[], 5).unwrap())
            .into_packet()
            .unwrap();
        link.on_receive(heartbeat, later);
        assert_eq!(link.idle_for(later), Duration::ZERO);
    }
}
