//! Frame fragmentation and reassembly
//!
//! The sender side splits one [`EncodedFrame`] into MTU-bounded VIDEO
//! packets carrying `(frame_id, packet_index, packet_count,
//! fragment_offset)`. Sequence numbers are deliberately left at zero; the
//! pacer assigns them at egress so retransmissions and FEC interleave
//! without renumbering.
//!
//! The receiver side is [`FrameAssembler`]: it collects fragments per
//! frame id, hands back the exact original byte sequence once index
//! coverage is contiguous, and abandons partial frames that outlive the
//! reassembly deadline (twice the current RTT).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::codec::frame::{EncodedFrame, FrameClass};
use crate::transport::packet::{
    AudioTrailer, Packet, PacketHeader, PacketKind, Trailer, VideoTrailer, FLAG_FIRST_OF_FRAME,
    FLAG_LAST_OF_FRAME, VIDEO_HEADER_SIZE,
};

/// Sender-side fragmenter
#[derive(Debug, Clone)]
pub struct Packetizer {
    session_id: u32,
    mtu: usize,
}

impl Packetizer {
    /// Create a fragmenter for one session
    ///
    /// `mtu` is the full datagram budget; the caller validated it against
    /// [`crate::transport::packet::MIN_MTU`] at configuration time.
    pub fn new(session_id: u32, mtu: usize) -> Self {
        Self { session_id, mtu }
    }

    /// Payload bytes available per video packet
    pub fn max_payload(&self) -> usize {
        self.mtu - VIDEO_HEADER_SIZE
    }

    /// Split an encoded frame into ordered VIDEO packets
    ///
    /// A zero-length frame produces no packets. `seq` is zero on every
    /// packet until the pacer assigns the real value.
    pub fn packetize(&self, frame: &EncodedFrame) -> Vec<Packet> {
        if frame.data.is_empty() {
            return Vec::new();
        }
        let max_payload = self.max_payload();
        let total = frame.data.len().div_ceil(max_payload);
        let mut packets = Vec::with_capacity(total);

        for index in 0..total {
            let offset = index * max_payload;
            let end = (offset + max_payload).min(frame.data.len());
            let payload = frame.data.slice(offset..end);

            let mut flags = 0u8;
            if index == 0 {
                flags |= FLAG_FIRST_OF_FRAME;
            }
            if index == total - 1 {
                flags |= FLAG_LAST_OF_FRAME;
            }

            packets.push(Packet {
                header: PacketHeader {
                    session_id: self.session_id,
                    seq: 0,
                    capture_ts_us: frame.capture_ts_us,
                    kind: PacketKind::Video,
                    frame_class: frame.class,
                    flags,
                    payload_len: payload.len() as u16,
                },
                trailer: Trailer::Video(VideoTrailer {
                    frame_id: frame.frame_id as u32,
                    packet_index: index as u16,
                    packet_count: total as u16,
                    fragment_offset: offset as u32,
                }),
                payload,
            });
        }

        trace!(
            frame_id = frame.frame_id,
            bytes = frame.data.len(),
            packets = packets.len(),
            "frame packetized"
        );
        packets
    }

    /// Wrap a pre-encoded audio payload into a single AUDIO packet
    ///
    /// Audio is carried, not encoded, so payloads above the MTU budget are
    /// the collaborator's bug; they are truncated with a warning rather
    /// than fragmented.
    pub fn packetize_audio(
        &self,
        payload: Bytes,
        capture_ts_us: u64,
        sample_count: u32,
        channels: u8,
        format: u8,
    ) -> Packet {
        let budget = self.mtu - crate::transport::packet::HEADER_SIZE - 6;
        let payload = if payload.len() > budget {
            warn!(len = payload.len(), budget, "audio payload exceeds MTU budget, truncating");
            payload.slice(..budget)
        } else {
            payload
        };
        Packet {
            header: PacketHeader {
                session_id: self.session_id,
                seq: 0,
                capture_ts_us,
                kind: PacketKind::Audio,
                frame_class: FrameClass::Audio,
                flags: FLAG_FIRST_OF_FRAME | FLAG_LAST_OF_FRAME,
                payload_len: payload.len() as u16,
            },
            trailer: Trailer::Audio(AudioTrailer { sample_count, channels, format }),
            payload,
        }
    }
}

/// A frame the assembler completed
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    /// Frame identifier from the video trailer
    pub frame_id: u32,
    /// Frame classification
    pub class: FrameClass,
    /// Capture timestamp carried by the fragments
    pub capture_ts_us: u64,
    /// The exact encoded byte sequence the sender fragmented
    pub data: Bytes,
}

/// One frame's fragments in flight
#[derive(Debug)]
struct PartialFrame {
    class: FrameClass,
    capture_ts_us: u64,
    count: u16,
    received: Vec<Option<Bytes>>,
    arrived: usize,
    first_seen: Instant,
}

/// Receiver-side reassembler
#[derive(Debug)]
pub struct FrameAssembler {
    pending: HashMap<u32, PartialFrame>,
    /// Frames abandoned past the reassembly deadline
    discarded: u64,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self { pending: HashMap::new(), discarded: 0 }
    }

    /// Frames discarded on timeout so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Frames currently partially assembled
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed one VIDEO or RETRANSMIT packet
    ///
    /// Returns the completed frame once all `packet_count` fragments with
    /// contiguous indices have arrived. Duplicates and inconsistent
    /// fragments are dropped.
    pub fn insert(&mut self, packet: &Packet, now: Instant) -> Option<AssembledFrame> {
        let Trailer::Video(trailer) = packet.trailer else {
            return None;
        };
        self.insert_fragment(
            trailer,
            packet.header.frame_class,
            packet.header.capture_ts_us,
            packet.payload.clone(),
            now,
        )
    }

    /// Feed one fragment directly (FEC recovery path)
    pub fn insert_fragment(
        &mut self,
        trailer: VideoTrailer,
        class: FrameClass,
        capture_ts_us: u64,
        payload: Bytes,
        now: Instant,
    ) -> Option<AssembledFrame> {
        if trailer.packet_count == 0 || trailer.packet_index >= trailer.packet_count {
            warn!(
                frame_id = trailer.frame_id,
                index = trailer.packet_index,
                count = trailer.packet_count,
                "fragment with inconsistent indices dropped"
            );
            return None;
        }

        let partial = self.pending.entry(trailer.frame_id).or_insert_with(|| PartialFrame {
            class,
            capture_ts_us,
            count: trailer.packet_count,
            received: vec![None; usize::from(trailer.packet_count)],
            arrived: 0,
            first_seen: now,
        });

        if partial.count != trailer.packet_count {
            warn!(
                frame_id = trailer.frame_id,
                expected = partial.count,
                got = trailer.packet_count,
                "fragment disagrees on packet count, dropped"
            );
            return None;
        }

        let slot = &mut partial.received[usize::from(trailer.packet_index)];
        if slot.is_some() {
            trace!(frame_id = trailer.frame_id, index = trailer.packet_index, "duplicate fragment");
            return None;
        }
        *slot = Some(payload);
        partial.arrived += 1;

        if partial.arrived < usize::from(partial.count) {
            return None;
        }

        let partial = self.pending.remove(&trailer.frame_id)?;
        let mut data = BytesMut::new();
        for fragment in partial.received.into_iter().flatten() {
            data.extend_from_slice(&fragment);
        }
        debug!(frame_id = trailer.frame_id, bytes = data.len(), "frame reassembled");
        Some(AssembledFrame {
            frame_id: trailer.frame_id,
            class: partial.class,
            capture_ts_us: partial.capture_ts_us,
            data: data.freeze(),
        })
    }

    /// Abandon partial frames older than `2 × rtt`
    ///
    /// Returns how many frames were discarded by this sweep; the caller
    /// feeds that into the loss statistics.
    pub fn sweep(&mut self, now: Instant, rtt: Duration) -> usize {
        let deadline = rtt * 2;
        let before = self.pending.len();
        self.pending.retain(|frame_id, partial| {
            let keep = now.duration_since(partial.first_seen) <= deadline;
            if !keep {
                debug!(
                    frame_id,
                    arrived = partial.arrived,
                    count = partial.count,
                    "partial frame abandoned past reassembly deadline"
                );
            }
            keep
        });
        let dropped = before - self.pending.len();
        self.discarded += dropped as u64;
        dropped
    }
}
