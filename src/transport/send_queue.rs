//! Bounded priority send queue and retransmission bookkeeping
//!
//! Egress order is strict priority: CONTROL, then KEY-frame video, then
//! FEC, then PREDICTED video, then audio; within a priority class packets
//! leave in enqueue order. The queue is bounded in bytes, sized by the
//! engine to `max_queue_latency_ms` worth of traffic at the current target
//! bitrate, and sheds from the lowest-priority tail when it overflows.
//!
//! [`ArqTracker`] keeps every sent-but-unacknowledged packet for selective
//! retransmission. A packet becomes a retransmission candidate when its
//! RTO elapses while later traffic keeps being acknowledged (duplicate
//! cumulative ACKs), or immediately on an explicit NACK. Retransmissions
//! keep their original sequence number and go out with the RETRANSMIT
//! kind.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::codec::frame::FrameClass;
use crate::transport::congestion::DUPACK_THRESHOLD;
use crate::transport::packet::{Packet, PacketKind};

/// Egress priority, lower is sooner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    /// Session control traffic
    Control = 0,
    /// KEY-frame video fragments (and their retransmissions)
    KeyVideo = 1,
    /// FEC recovery packets
    Fec = 2,
    /// PREDICTED-frame video fragments
    PredictedVideo = 3,
    /// Audio passthrough
    Audio = 4,
}

/// Priority class of a packet
pub fn priority_of(packet: &Packet) -> Priority {
    match packet.header.kind {
        PacketKind::Control => Priority::Control,
        PacketKind::Fec => Priority::Fec,
        PacketKind::Audio => Priority::Audio,
        PacketKind::Video | PacketKind::Retransmit => match packet.header.frame_class {
            FrameClass::Key => Priority::KeyVideo,
            _ => Priority::PredictedVideo,
        },
    }
}

/// Bounded, priority-ordered egress queue
#[derive(Debug)]
pub struct SendQueue {
    /// Keyed by (priority, arrival); first entry is next out the door
    entries: BTreeMap<(Priority, u64), Packet>,
    arrival: u64,
    queued_bytes: usize,
    byte_budget: usize,
    overflow_dropped: u64,
}

impl SendQueue {
    /// Create a queue with an initial byte budget
    pub fn new(byte_budget: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            arrival: 0,
            queued_bytes: 0,
            byte_budget: byte_budget.max(1),
            overflow_dropped: 0,
        }
    }

    /// Packets currently queued
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently queued
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Packets shed on overflow so far
    pub fn overflow_dropped(&self) -> u64 {
        self.overflow_dropped
    }

    /// Queue fullness in [0, 1]
    pub fn fullness(&self) -> f64 {
        self.queued_bytes as f64 / self.byte_budget as f64
    }

    /// Retune the byte budget when the target bitrate moves
    pub fn set_byte_budget(&mut self, byte_budget: usize) {
        self.byte_budget = byte_budget.max(1);
        self.shed();
    }

    /// Enqueue a packet, shedding the lowest-priority tail on overflow
    pub fn push(&mut self, packet: Packet) {
        self.queued_bytes += packet.wire_len();
        self.entries.insert((priority_of(&packet), self.arrival), packet);
        self.arrival += 1;
        self.shed();
    }

    /// Dequeue the highest-priority, oldest packet
    pub fn pop(&mut self) -> Option<Packet> {
        let (&key, _) = self.entries.iter().next()?;
        let packet = self.entries.remove(&key)?;
        self.queued_bytes -= packet.wire_len();
        Some(packet)
    }

    fn shed(&mut self) {
        while self.queued_bytes > self.byte_budget && self.entries.len() > 1 {
            let (&key, _) = self.entries.iter().next_back().expect("non-empty");
            let dropped = self.entries.remove(&key).expect("key just observed");
            self.queued_bytes -= dropped.wire_len();
            self.overflow_dropped += 1;
            warn!(
                priority = ?key.0,
                seq = dropped.header.seq,
                "send queue overflow, tail packet dropped"
            );
        }
    }
}

/// One packet awaiting acknowledgment
#[derive(Debug)]
struct PendingPacket {
    packet: Packet,
    sent_at: Instant,
    retransmitted: bool,
}

/// Result of processing a cumulative ACK
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// `(wire bytes, rtt)` for every packet the ACK covered
    pub acked: Vec<(usize, Duration)>,
    /// Whether this ACK duplicated the previous cumulative value
    pub duplicate: bool,
}

/// Sent-packet ledger driving selective retransmission
#[derive(Debug, Default)]
pub struct ArqTracker {
    pending: BTreeMap<u32, PendingPacket>,
    last_cum_ack: Option<u32>,
    dup_acks: u32,
    retransmissions: u64,
}

impl ArqTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets awaiting acknowledgment
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Retransmissions issued so far
    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    /// Record a packet handed to the socket
    ///
    /// Only video-bearing packets are tracked; control, FEC and audio are
    /// never retransmitted.
    pub fn on_sent(&mut self, packet: &Packet, now: Instant) {
        if !matches!(packet.header.kind, PacketKind::Video | PacketKind::Retransmit) {
            return;
        }
        self.pending
            .entry(packet.header.seq)
            .and_modify(|p| p.sent_at = now)
            .or_insert_with(|| PendingPacket {
                packet: packet.clone(),
                sent_at: now,
                retransmitted: packet.header.kind == PacketKind::Retransmit,
            });
    }

    /// Process a cumulative ACK covering everything up to `cum_seq`
    pub fn on_ack(&mut self, cum_seq: u32, now: Instant) -> AckOutcome {
        let duplicate = self.last_cum_ack == Some(cum_seq);
        if duplicate {
            self.dup_acks += 1;
        } else {
            self.last_cum_ack = Some(cum_seq);
            self.dup_acks = 0;
        }

        let mut outcome = AckOutcome { duplicate, ..AckOutcome::default() };
        let covered: Vec<u32> = self
            .pending
            .range(..=cum_seq)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in covered {
            if let Some(pending) = self.pending.remove(&seq) {
                let rtt = now.duration_since(pending.sent_at);
                // Retransmitted packets give ambiguous RTT samples (Karn)
                if !pending.retransmitted {
                    outcome.acked.push((pending.packet.wire_len(), rtt));
                } else {
                    outcome.acked.push((pending.packet.wire_len(), Duration::ZERO));
                }
            }
        }
        outcome
    }

    /// Look up a NACKed packet for immediate retransmission
    pub fn on_nack(&mut self, seq: u32) -> Option<RetransmitCandidate> {
        let pending = self.pending.get(&seq)?;
        Some(RetransmitCandidate {
            seq,
            class: pending.packet.header.frame_class,
            capture_ts_us: pending.packet.header.capture_ts_us,
        })
    }

    /// Packets whose RTO elapsed while later traffic kept being ACKed
    ///
    /// The duplicate-ACK count stands in for "three subsequent packets
    /// acknowledged": each duplicate of the cumulative ACK means something
    /// beyond the hole arrived at the receiver.
    pub fn timed_out(&self, now: Instant, rto: Duration) -> Vec<RetransmitCandidate> {
        if self.dup_acks < DUPACK_THRESHOLD {
            return Vec::new();
        }
        self.pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) > rto)
            .map(|(&seq, p)| RetransmitCandidate {
                seq,
                class: p.packet.header.frame_class,
                capture_ts_us: p.packet.header.capture_ts_us,
            })
            .collect()
    }

    /// Pull a packet for retransmission, re-marked with the RETRANSMIT kind
    ///
    /// The packet keeps its original sequence number; the ledger entry
    /// stays until an ACK finally covers it.
    pub fn take_for_retransmit(&mut self, seq: u32, now: Instant) -> Option<Packet> {
        let pending = self.pending.get_mut(&seq)?;
        pending.retransmitted = true;
        pending.sent_at = now;
        self.retransmissions += 1;
        let mut packet = pending.packet.clone();
        packet.header.kind = PacketKind::Retransmit;
        debug!(seq, "packet queued for retransmission");
        Some(packet)
    }

    /// Drop a stale pending packet the policy refused to retransmit
    pub fn abandon(&mut self, seq: u32) {
        if self.pending.remove(&seq).is_some() {
            trace!(seq, "stale pending packet abandoned");
        }
    }
}

/// A pending packet eligible for retransmission, pending policy approval
#[derive(Debug, Clone, Copy)]
pub struct RetransmitCandidate {
    /// Original sequence number
    pub seq: u32,
    /// Frame class, drives the staleness policy
    pub class: FrameClass,
    /// Capture timestamp, drives the staleness policy
    pub capture_ts_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::transport::packet::{
        ControlTrailer, ControlType, PacketHeader, Trailer, VideoTrailer,
    };

    fn video(seq: u32, class: FrameClass, payload_len: usize) -> Packet {
        Packet {
            header: PacketHeader {
                session_id: 1,
                seq,
                capture_ts_us: 0,
                kind: PacketKind::Video,
                frame_class: class,
                flags: 0,
                payload_len: payload_len as u16,
            },
            trailer: Trailer::Video(VideoTrailer {
                frame_id: 1,
                packet_index: 0,
                packet_count: 1,
                fragment_offset: 0,
            }),
            payload: Bytes::from(vec![0u8; payload_len]),
        }
    }

    fn control(seq: u32) -> Packet {
        Packet {
            header: PacketHeader {
                session_id: 1,
                seq,
                capture_ts_us: 0,
                kind: PacketKind::Control,
                frame_class: FrameClass::Audio,
                flags: 0,
                payload_len: 0,
            },
            trailer: Trailer::Control(ControlTrailer {
                control_type: ControlType::Keepalive,
                datum: 0,
            }),
            payload: Bytes::new(),
        }
    }

    fn audio(seq: u32) -> Packet {
        let mut p = video(seq, FrameClass::Audio, 10);
        p.header.kind = PacketKind::Audio;
        p.trailer = Trailer::Audio(crate::transport::packet::AudioTrailer {
            sample_count: 1,
            channels: 1,
            format: 0,
        });
        p
    }

    #[test]
    fn test_priority_ordering() {
        let mut queue = SendQueue::new(1 << 20);
        queue.push(audio(1));
        queue.push(video(2, FrameClass::Predicted, 100));
        queue.push(video(3, FrameClass::Key, 100));
        queue.push(control(4));

        let order: Vec<u32> = std::iter::from_fn(|| queue.pop().map(|p| p.header.seq)).collect();
        assert_eq!(order, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = SendQueue::new(1 << 20);
        for seq in 0..5 {
            queue.push(video(seq, FrameClass::Key, 50));
        }
        let order: Vec<u32> = std::iter::from_fn(|| queue.pop().map(|p| p.header.seq)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_overflow_sheds_lowest_priority_tail() {
        // Budget fits roughly three 141-byte video packets
        let mut queue = SendQueue::new(450);
        queue.push(video(1, FrameClass::Key, 100));
        queue.push(video(2, FrameClass::Predicted, 100));
        queue.push(video(3, FrameClass::Predicted, 100));
        queue.push(video(4, FrameClass::Key, 100));

        assert!(queue.overflow_dropped() > 0);
        // Shedding removed predicted-tail entries, key frames survive
        let seqs: Vec<u32> = std::iter::from_fn(|| queue.pop().map(|p| p.header.seq)).collect();
        assert!(seqs.contains(&1));
        assert!(seqs.contains(&4));
        assert!(!seqs.contains(&3));
    }

    #[test]
    fn test_budget_shrink_sheds() {
        let mut queue = SendQueue::new(1 << 20);
        for seq in 0..10 {
            queue.push(video(seq, FrameClass::Predicted, 100));
        }
        assert_eq!(queue.len(), 10);
        queue.set_byte_budget(300);
        assert!(queue.len() <= 3);
        assert!(queue.overflow_dropped() >= 7);
    }

    #[test]
    fn test_arq_cumulative_ack() {
        let mut arq = ArqTracker::new();
        let t0 = Instant::now();
        for seq in 1..=5 {
            arq.on_sent(&video(seq, FrameClass::Key, 100), t0);
        }
        assert_eq!(arq.in_flight(), 5);

        let outcome = arq.on_ack(3, t0 + Duration::from_millis(40));
        assert_eq!(outcome.acked.len(), 3);
        assert!(!outcome.duplicate);
        assert_eq!(arq.in_flight(), 2);
        for (_, rtt) in &outcome.acked {
            assert_eq!(*rtt, Duration::from_millis(40));
        }
    }

    #[test]
    fn test_arq_duplicate_acks_trigger_timeout_candidates() {
        let mut arq = ArqTracker::new();
        let t0 = Instant::now();
        for seq in 1..=4 {
            arq.on_sent(&video(seq, FrameClass::Key, 100), t0);
        }
        arq.on_ack(1, t0 + Duration::from_millis(10));

        let rto = Duration::from_millis(100);
        let later = t0 + Duration::from_millis(200);
        // RTO elapsed but no duplicate ACKs yet: not lost, maybe reordered
        assert!(arq.timed_out(later, rto).is_empty());

        for _ in 0..DUPACK_THRESHOLD {
            let outcome = arq.on_ack(1, later);
            assert!(outcome.duplicate);
        }
        let candidates = arq.timed_out(later, rto);
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].seq, 2);
    }

    #[test]
    fn test_retransmit_keeps_seq_and_changes_kind() {
        let mut arq = ArqTracker::new();
        let t0 = Instant::now();
        arq.on_sent(&video(7, FrameClass::Key, 100), t0);

        let retransmit = arq.take_for_retransmit(7, t0 + Duration::from_millis(50)).unwrap();
        assert_eq!(retransmit.header.seq, 7);
        assert_eq!(retransmit.header.kind, PacketKind::Retransmit);
        assert_eq!(arq.retransmissions(), 1);

        // Karn: the eventual ACK reports a zero RTT sample for it
        let outcome = arq.on_ack(7, t0 + Duration::from_millis(90));
        assert_eq!(outcome.acked.len(), 1);
        assert_eq!(outcome.acked[0].1, Duration::ZERO);
    }

    #[test]
    fn test_nack_lookup_and_abandon() {
        let mut arq = ArqTracker::new();
        let t0 = Instant::now();
        arq.on_sent(&video(9, FrameClass::Predicted, 100), t0);

        let candidate = arq.on_nack(9).unwrap();
        assert_eq!(candidate.seq, 9);
        assert_eq!(candidate.class, FrameClass::Predicted);

        arq.abandon(9);
        assert!(arq.on_nack(9).is_none());
        assert_eq!(arq.in_flight(), 0);
    }

    #[test]
    fn test_control_packets_not_tracked() {
        let mut arq = ArqTracker::new();
        arq.on_sent(&control(1), Instant::now());
        assert_eq!(arq.in_flight(), 0);
    }
}
