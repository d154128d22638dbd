//! Forward error correction
//!
//! Groups of consecutive source packets are protected by recovery packets
//! such that any K of K+M packets reconstruct all K. Two algorithms:
//!
//! - **XOR** for M = 1: the recovery payload is the byte-wise XOR of all
//!   K protected units.
//! - **Reed-Solomon** over GF(256) for M ≥ 1: M parity symbols per byte
//!   position from a Cauchy-style generator, whose square submatrices are
//!   all invertible, so recovery works from *any* K survivors.
//!
//! Each protected unit is the packet payload prefixed with its 16-bit
//! length and zero-padded to the group's unit size; recovery therefore
//! restores exact payload lengths, not just padded bytes.
//!
//! Groups never span frames, so a lost KEY frame boundary cannot couple
//! two frames' fates. The recovery ratio follows the congestion
//! controller's loss estimate: `M = ceil(K · clamp(loss · 1.2, 0, 0.4))`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::codec::frame::FrameClass;
use crate::transport::packet::{
    FecAlgorithm, FecTrailer, Packet, PacketHeader, PacketKind, Trailer,
};

/// Largest number of source packets protected by one group
pub const MAX_FEC_GROUP: usize = 16;

/// Hard cap on the recovery ratio M/K
pub const MAX_RECOVERY_RATIO: f64 = 0.4;

/// Loss-rate headroom applied before the ratio clamp
const LOSS_HEADROOM: f64 = 1.2;

// GF(256) with the 0x11D polynomial, log/exp tables built at compile time
const GF_POLY: u16 = 0x11D;

const fn build_gf_tables() -> ([u8; 256], [u8; 512]) {
    let mut log = [0u8; 256];
    let mut exp = [0u8; 512];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        exp[i + 255] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x >= 256 {
            x ^= GF_POLY;
        }
        i += 1;
    }
    (log, exp)
}

const GF_TABLES: ([u8; 256], [u8; 512]) = build_gf_tables();
const GF_LOG: [u8; 256] = GF_TABLES.0;
const GF_EXP: [u8; 512] = GF_TABLES.1;

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    GF_EXP[usize::from(GF_LOG[usize::from(a)]) + usize::from(GF_LOG[usize::from(b)])]
}

#[inline]
fn gf_inv(a: u8) -> u8 {
    debug_assert!(a != 0, "zero has no inverse in GF(256)");
    GF_EXP[255 - usize::from(GF_LOG[usize::from(a)])]
}

/// Cauchy generator coefficient for recovery row `r`, source column `i`
///
/// Rows index `K..K+M`, columns `0..K`; the sets are disjoint so the
/// denominators are nonzero and every square submatrix is invertible.
#[inline]
fn coefficient(k: usize, r: usize, i: usize) -> u8 {
    gf_inv(((k + r) as u8) ^ (i as u8))
}

/// Recovery packet count for a group of `k` at the given loss estimate
pub fn recovery_count(k: usize, loss_rate: f64) -> usize {
    let ratio = (loss_rate * LOSS_HEADROOM).clamp(0.0, MAX_RECOVERY_RATIO);
    (k as f64 * ratio).ceil() as usize
}

/// Sender-side group builder
#[derive(Debug, Default)]
pub struct FecEncoder {
    next_group_id: u16,
}

impl FecEncoder {
    /// Create a builder with group ids starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce recovery packets for one frame's source packets
    ///
    /// The input must be the VIDEO packets of a single frame (groups never
    /// cross frame boundaries); frames larger than [`MAX_FEC_GROUP`] split
    /// into multiple groups. Returns only the recovery packets.
    pub fn protect(&mut self, source: &[Packet], loss_rate: f64) -> Vec<Packet> {
        let mut out = Vec::new();
        for chunk in source.chunks(MAX_FEC_GROUP) {
            out.extend(self.protect_group(chunk, loss_rate));
        }
        out
    }

    fn protect_group(&mut self, source: &[Packet], loss_rate: f64) -> Vec<Packet> {
        let k = source.len();
        if k == 0 {
            return Vec::new();
        }
        let m = recovery_count(k, loss_rate);
        if m == 0 {
            return Vec::new();
        }
        // Group members must stay addressable as u8 symbols
        debug_assert!(k + m <= 255);

        let Trailer::Video(first) = source[0].trailer else {
            warn!("FEC protection requested for non-video packets, skipping");
            return Vec::new();
        };

        let unit_len = 2 + source
            .iter()
            .map(|p| p.payload.len())
            .max()
            .unwrap_or(0);
        let units: Vec<Vec<u8>> = source.iter().map(|p| pad_unit(&p.payload, unit_len)).collect();

        let algorithm = if m == 1 { FecAlgorithm::Xor } else { FecAlgorithm::ReedSolomon };
        let group_id = self.next_group_id;
        self.next_group_id = self.next_group_id.wrapping_add(1);

        let mut packets = Vec::with_capacity(m);
        for r in 0..m {
            let mut parity = vec![0u8; unit_len];
            match algorithm {
                FecAlgorithm::Xor => {
                    for unit in &units {
                        for (p, &u) in parity.iter_mut().zip(unit.iter()) {
                            *p ^= u;
                        }
                    }
                }
                FecAlgorithm::ReedSolomon => {
                    for (i, unit) in units.iter().enumerate() {
                        let c = coefficient(k, r, i);
                        for (p, &u) in parity.iter_mut().zip(unit.iter()) {
                            *p ^= gf_mul(c, u);
                        }
                    }
                }
            }

            packets.push(Packet {
                header: PacketHeader {
                    session_id: source[0].header.session_id,
                    seq: 0,
                    capture_ts_us: source[0].header.capture_ts_us,
                    kind: PacketKind::Fec,
                    frame_class: source[0].header.frame_class,
                    flags: 0,
                    payload_len: parity.len() as u16,
                },
                trailer: Trailer::Fec(FecTrailer {
                    group_id,
                    algorithm,
                    recovery_index: r as u8,
                    k: k as u16,
                    m: m as u16,
                    frame_id: first.frame_id,
                    base_index: first.packet_index,
                    protected_len: unit_len as u16,
                }),
                payload: Bytes::from(parity),
            });
        }
        debug!(group_id, k, m, ?algorithm, "FEC group built");
        packets
    }
}

fn pad_unit(payload: &[u8], unit_len: usize) -> Vec<u8> {
    let mut unit = vec![0u8; unit_len];
    unit[0..2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    unit[2..2 + payload.len()].copy_from_slice(payload);
    unit
}

fn unwrap_unit(unit: &[u8]) -> Option<Bytes> {
    if unit.len() < 2 {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([unit[0], unit[1]]));
    if 2 + len > unit.len() {
        return None;
    }
    Some(Bytes::copy_from_slice(&unit[2..2 + len]))
}

/// A source packet the receiver rebuilt from recovery data
#[derive(Debug, Clone)]
pub struct RecoveredFragment {
    /// Frame the fragment belongs to
    pub frame_id: u32,
    /// Fragment index within the frame
    pub packet_index: u16,
    /// Frame classification carried by the group
    pub class: FrameClass,
    /// Capture timestamp carried by the group
    pub capture_ts_us: u64,
    /// Exact original payload
    pub payload: Bytes,
}

/// One group awaiting enough packets to recover
#[derive(Debug)]
struct GroupState {
    algorithm: FecAlgorithm,
    k: usize,
    m: usize,
    frame_id: u32,
    base_index: u16,
    unit_len: usize,
    class: FrameClass,
    capture_ts_us: u64,
    recovery: Vec<Option<Bytes>>,
    first_seen: Instant,
    released: bool,
}

/// Receiver-side recovery engine
///
/// Source fragments are fed as they arrive; FEC packets open groups. Once
/// a group holds at least K of its K+M packets, the missing sources are
/// rebuilt and handed back so the caller can feed them into reassembly as
/// if they had arrived.
#[derive(Debug, Default)]
pub struct FecReceiver {
    /// Received source payloads by (frame_id, packet_index)
    fragments: HashMap<(u32, u16), (Bytes, Instant)>,
    groups: HashMap<u16, GroupState>,
    recovered_total: u64,
}

impl FecReceiver {
    /// Create an empty receiver
    pub fn new() -> Self {
        Self::default()
    }

    /// Source packets rebuilt so far
    pub fn recovered_total(&self) -> u64 {
        self.recovered_total
    }

    /// Note an arrived VIDEO fragment
    pub fn on_video(&mut self, frame_id: u32, packet_index: u16, payload: Bytes, now: Instant) {
        self.fragments.insert((frame_id, packet_index), (payload, now));
    }

    /// Feed one FEC packet; returns any fragments it allowed to recover
    pub fn on_fec(&mut self, packet: &Packet, now: Instant) -> Vec<RecoveredFragment> {
        let Trailer::Fec(trailer) = packet.trailer else {
            return Vec::new();
        };
        let group = self.groups.entry(trailer.group_id).or_insert_with(|| GroupState {
            algorithm: trailer.algorithm,
            k: usize::from(trailer.k),
            m: usize::from(trailer.m),
            frame_id: trailer.frame_id,
            base_index: trailer.base_index,
            unit_len: usize::from(trailer.protected_len),
            class: packet.header.frame_class,
            capture_ts_us: packet.header.capture_ts_us,
            recovery: vec![None; usize::from(trailer.m)],
            first_seen: now,
            released: false,
        });
        if group.released {
            return Vec::new();
        }
        let idx = usize::from(trailer.recovery_index);
        if idx < group.recovery.len() && group.recovery[idx].is_none() {
            group.recovery[idx] = Some(packet.payload.clone());
        }
        self.try_recover(trailer.group_id)
    }

    /// Re-check a group after more source fragments arrived
    pub fn poll_group(&mut self, group_id: u16) -> Vec<RecoveredFragment> {
        self.try_recover(group_id)
    }

    /// Drop groups and orphan fragments past `2·RTT + max_reorder`
    pub fn sweep(&mut self, now: Instant, rtt: Duration, max_reorder: Duration) {
        let deadline = rtt * 2 + max_reorder;
        self.groups.retain(|group_id, group| {
            let keep = now.duration_since(group.first_seen) <= deadline;
            if !keep && !group.released {
                debug!(group_id, "FEC group abandoned past recovery deadline");
            }
            keep
        });
        self.fragments.retain(|_, (_, seen)| now.duration_since(*seen) <= deadline);
    }

    fn try_recover(&mut self, group_id: u16) -> Vec<RecoveredFragment> {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return Vec::new();
        };
        if group.released {
            return Vec::new();
        }

        let member = |i: usize| (group.frame_id, group.base_index + i as u16);
        let missing: Vec<usize> = (0..group.k)
            .filter(|&i| !self.fragments.contains_key(&member(i)))
            .collect();
        if missing.is_empty() {
            group.released = true;
            return Vec::new();
        }

        let parity_rows: Vec<(usize, &Bytes)> = group
            .recovery
            .iter()
            .enumerate()
            .filter_map(|(r, p)| p.as_ref().map(|p| (r, p)))
            .collect();
        if parity_rows.len() < missing.len() {
            // Fewer than K of K+M so far
            return Vec::new();
        }

        let unit_len = group.unit_len;
        let known_units: Vec<(usize, Vec<u8>)> = (0..group.k)
            .filter_map(|i| {
                self.fragments
                    .get(&member(i))
                    .map(|(payload, _)| (i, pad_unit(payload, unit_len)))
            })
            .collect();

        let solved: Option<Vec<Vec<u8>>> = match group.algorithm {
            FecAlgorithm::Xor => {
                // Single parity recovers exactly one loss
                if missing.len() != 1 {
                    warn!(
                        group_id,
                        missing = missing.len(),
                        m = group.m,
                        "XOR group cannot recover multiple losses"
                    );
                    group.released = true;
                    return Vec::new();
                }
                let (_, parity) = parity_rows[0];
                let mut unit: Vec<u8> = parity.to_vec();
                unit.resize(unit_len, 0);
                for (_, known) in &known_units {
                    for (u, &kb) in unit.iter_mut().zip(known.iter()) {
                        *u ^= kb;
                    }
                }
                Some(vec![unit])
            }
            FecAlgorithm::ReedSolomon => solve_reed_solomon(
                group.k,
                unit_len,
                &missing,
                &known_units,
                &parity_rows,
            ),
        };

        let Some(units) = solved else {
            warn!(group_id, "FEC group system was singular, abandoning");
            group.released = true;
            return Vec::new();
        };

        let mut out = Vec::new();
        for (&i, unit) in missing.iter().zip(units.iter()) {
            let Some(payload) = unwrap_unit(unit) else {
                warn!(group_id, index = i, "recovered unit carried a bad length prefix");
                continue;
            };
            let (frame_id, packet_index) = member(i);
            self.fragments
                .insert((frame_id, packet_index), (payload.clone(), group.first_seen));
            out.push(RecoveredFragment {
                frame_id,
                packet_index,
                class: group.class,
                capture_ts_us: group.capture_ts_us,
                payload,
            });
        }
        group.released = true;
        self.recovered_total += out.len() as u64;
        trace!(group_id, recovered = out.len(), "FEC recovery complete");
        out
    }
}

/// Solve for the missing units via Gaussian elimination over GF(256)
///
/// One elimination pass over the coefficient matrix drives the byte-wise
/// right-hand sides (whole units) along with it.
fn solve_reed_solomon(
    k: usize,
    unit_len: usize,
    missing: &[usize],
    known: &[(usize, Vec<u8>)],
    parity_rows: &[(usize, &Bytes)],
) -> Option<Vec<Vec<u8>>> {
    let n = missing.len();

    // Syndromes: parity minus the contribution of every known unit
    let mut matrix: Vec<Vec<u8>> = Vec::with_capacity(n);
    let mut rhs: Vec<Vec<u8>> = Vec::with_capacity(n);
    for &(r, parity) in parity_rows.iter().take(n) {
        let mut row = vec![0u8; n];
        for (col, &i) in missing.iter().enumerate() {
            row[col] = coefficient(k, r, i);
        }
        let mut b: Vec<u8> = parity.to_vec();
        b.resize(unit_len, 0);
        for (i, unit) in known {
            let c = coefficient(k, r, *i);
            for (bb, &u) in b.iter_mut().zip(unit.iter()) {
                *bb ^= gf_mul(c, u);
            }
        }
        matrix.push(row);
        rhs.push(b);
    }

    // Forward elimination with partial pivoting
    for col in 0..n {
        let pivot = (col..n).find(|&r| matrix[r][col] != 0)?;
        matrix.swap(col, pivot);
        rhs.swap(col, pivot);

        let inv = gf_inv(matrix[col][col]);
        for v in matrix[col].iter_mut() {
            *v = gf_mul(*v, inv);
        }
        for v in rhs[col].iter_mut() {
            *v = gf_mul(*v, inv);
        }

        for row in 0..n {
            if row == col || matrix[row][col] == 0 {
                continue;
            }
            let factor = matrix[row][col];
            for c in 0..n {
                let scaled = gf_mul(factor, matrix[col][c]);
                matrix[row][c] ^= scaled;
            }
            let (dst, src) = if row < col {
                let (a, b) = rhs.split_at_mut(col);
                (&mut a[row], &b[0])
            } else {
                let (a, b) = rhs.split_at_mut(row);
                (&mut b[0], &a[col])
            };
            for (d, &s) in dst.iter_mut().zip(src.iter()) {
                *d ^= gf_mul(factor, s);
            }
        }
    }

    Some(rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::packetizer::Packetizer;
    use crate::codec::frame::EncodedFrame;

    fn frame_packets(len: usize, frame_id: u64, mtu: usize) -> Vec<Packet> {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 253) as u8).collect();
        let frame = EncodedFrame {
            frame_id,
            capture_ts_us: 1000,
            class: FrameClass::Key,
            is_recovery_point: true,
            data: Bytes::from(data),
        };
        Packetizer::new(9, mtu).packetize(&frame)
    }

    #[test]
    fn test_gf_arithmetic() {
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "a={a}");
            assert_eq!(gf_mul(a, 1), a);
            assert_eq!(gf_mul(a, 0), 0);
        }
        // Commutativity spot checks
        assert_eq!(gf_mul(0x53, 0xCA), gf_mul(0xCA, 0x53));
    }

    #[test]
    fn test_recovery_count_policy() {
        // Zero loss: no recovery packets
        assert_eq!(recovery_count(10, 0.0), 0);
        // Mild loss gets one parity packet
        assert_eq!(recovery_count(10, 0.05), 1);
        // Ratio clamps at 0.4 for heavy loss
        assert_eq!(recovery_count(10, 0.5), 4);
        assert_eq!(recovery_count(10, 0.9), 4);
    }

    #[test]
    fn test_xor_recovers_single_loss() {
        let source = frame_packets(10 * 150, 1, 150 + 41);
        assert_eq!(source.len(), 10);

        let mut encoder = FecEncoder::new();
        let recovery = encoder.protect(&source, 0.05);
        assert_eq!(recovery.len(), 1);
        let Trailer::Fec(t) = recovery[0].trailer else { panic!() };
        assert_eq!(t.algorithm, FecAlgorithm::Xor);

        // Drop source index 3; feed the rest plus the recovery packet
        let mut receiver = FecReceiver::new();
        let now = Instant::now();
        for packet in source.iter().filter(|p| {
            let Trailer::Video(v) = p.trailer else { panic!() };
            v.packet_index != 3
        }) {
            let Trailer::Video(v) = packet.trailer else { panic!() };
            receiver.on_video(v.frame_id, v.packet_index, packet.payload.clone(), now);
        }
        let recovered = receiver.on_fec(&recovery[0], now);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].packet_index, 3);
        assert_eq!(recovered[0].payload, source[3].payload);
    }

    #[test]
    fn test_reed_solomon_recovers_up_to_m_losses() {
        let source = frame_packets(8 * 120, 2, 120 + 41);
        assert_eq!(source.len(), 8);

        let mut encoder = FecEncoder::new();
        // 30% loss: m = ceil(8 * 0.36) = 3
        let recovery = encoder.protect(&source, 0.3);
        assert_eq!(recovery.len(), 3);
        let Trailer::Fec(t) = recovery[0].trailer else { panic!() };
        assert_eq!(t.algorithm, FecAlgorithm::ReedSolomon);

        // Drop three source packets (indices 0, 4, 7)
        let dropped = [0u16, 4, 7];
        let mut receiver = FecReceiver::new();
        let now = Instant::now();
        for packet in &source {
            let Trailer::Video(v) = packet.trailer else { panic!() };
            if !dropped.contains(&v.packet_index) {
                receiver.on_video(v.frame_id, v.packet_index, packet.payload.clone(), now);
            }
        }
        let mut recovered = Vec::new();
        for packet in &recovery {
            recovered.extend(receiver.on_fec(packet, now));
        }
        assert_eq!(recovered.len(), 3);
        for fragment in &recovered {
            let original = source
                .iter()
                .find(|p| {
                    let Trailer::Video(v) = p.trailer else { panic!() };
                    v.packet_index == fragment.packet_index
                })
                .unwrap();
            assert_eq!(fragment.payload, original.payload, "index {}", fragment.packet_index);
        }
    }

    #[test]
    fn test_reed_solomon_needs_k_survivors() {
        let source = frame_packets(8 * 120, 3, 120 + 41);
        let mut encoder = FecEncoder::new();
        let recovery = encoder.protect(&source, 0.3); // m = 3

        // Drop four sources but supply only three parities: 7 < K = 8
        let dropped = [0u16, 2, 4, 7];
        let mut receiver = FecReceiver::new();
        let now = Instant::now();
        for packet in &source {
            let Trailer::Video(v) = packet.trailer else { panic!() };
            if !dropped.contains(&v.packet_index) {
                receiver.on_video(v.frame_id, v.packet_index, packet.payload.clone(), now);
            }
        }
        let mut recovered = Vec::new();
        for packet in &recovery {
            recovered.extend(receiver.on_fec(packet, now));
        }
        assert!(recovered.is_empty());
    }

    #[test]
    fn test_short_last_fragment_recovers_exact_length() {
        // 3 full payloads plus a 10-byte tail; lose the tail
        let source = frame_packets(3 * 100 + 10, 4, 100 + 41);
        assert_eq!(source.len(), 4);

        let mut encoder = FecEncoder::new();
        let recovery = encoder.protect(&source, 0.05);
        assert_eq!(recovery.len(), 1);

        let mut receiver = FecReceiver::new();
        let now = Instant::now();
        for packet in source.iter().take(3) {
            let Trailer::Video(v) = packet.trailer else { panic!() };
            receiver.on_video(v.frame_id, v.packet_index, packet.payload.clone(), now);
        }
        let recovered = receiver.on_fec(&recovery[0], now);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].payload.len(), 10);
        assert_eq!(recovered[0].payload, source[3].payload);
    }

    #[test]
    fn test_zero_loss_produces_no_recovery() {
        let source = frame_packets(1000, 5, 200);
        let mut encoder = FecEncoder::new();
        assert!(encoder.protect(&source, 0.0).is_empty());
    }

    #[test]
    fn test_large_frame_splits_into_groups() {
        // 40 packets: chunks of 16 / 16 / 8, distinct group ids
        let source = frame_packets(40 * 100, 6, 100 + 41);
        assert_eq!(source.len(), 40);
        let mut encoder = FecEncoder::new();
        let recovery = encoder.protect(&source, 0.1);
        let mut group_ids: Vec<u16> = recovery
            .iter()
            .map(|p| {
                let Trailer::Fec(t) = p.trailer else { panic!() };
                t.group_id
            })
            .collect();
        group_ids.dedup();
        assert_eq!(group_ids.len(), 3);
    }

    #[test]
    fn test_group_sweep_abandons_stale_groups() {
        let source = frame_packets(10 * 100, 7, 100 + 41);
        let mut encoder = FecEncoder::new();
        let recovery = encoder.protect(&source, 0.05);

        let mut receiver = FecReceiver::new();
        let t0 = Instant::now();
        // Only the FEC packet arrives; the group can never complete
        receiver.on_fec(&recovery[0], t0);
        receiver.sweep(
            t0 + Duration::from_millis(500),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        assert!(receiver.groups.is_empty());
    }

    #[test]
    fn test_fragments_arriving_after_fec_packet() {
        let source = frame_packets(6 * 100, 8, 100 + 41);
        let mut encoder = FecEncoder::new();
        let recovery = encoder.protect(&source, 0.05);

        let mut receiver = FecReceiver::new();
        let now = Instant::now();
        // FEC first, then all but one source
        assert!(receiver.on_fec(&recovery[0], now).is_empty());
        for packet in source.iter().skip(1) {
            let Trailer::Video(v) = packet.trailer else { panic!() };
            receiver.on_video(v.frame_id, v.packet_index, packet.payload.clone(), now);
        }
        let Trailer::Fec(t) = recovery[0].trailer else { panic!() };
        let recovered = receiver.poll_group(t.group_id);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].payload, source[0].payload);
    }
}
