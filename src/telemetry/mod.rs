//! Engine statistics
//!
//! Hot paths bump lock-free counters; once a second the engine folds them
//! together with the congestion controller's view into a
//! [`StatsSnapshot`] for the statistics callback. Recoverable errors never
//! surface individually; they show up here as counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared across workers
#[derive(Debug, Default)]
pub struct EngineCounters {
    /// Datagrams handed to the socket
    pub packets_sent: AtomicU64,
    /// Bytes handed to the socket
    pub bytes_sent: AtomicU64,
    /// Datagrams received and parsed
    pub packets_received: AtomicU64,
    /// Frames the governor emitted
    pub frames_encoded: AtomicU64,
    /// Frames the governor dropped
    pub frames_dropped: AtomicU64,
    /// Retransmissions issued
    pub retransmissions: AtomicU64,
    /// FEC recovery packets produced
    pub fec_packets_sent: AtomicU64,
    /// Packets shed by send-queue overflow
    pub queue_overflow_dropped: AtomicU64,
    /// Malformed or checksum-failed datagrams discarded
    pub receive_errors: AtomicU64,
    /// Transient socket errors retried
    pub transient_send_errors: AtomicU64,
}

impl EngineCounters {
    /// Add `n` to a counter
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Bump a counter by one
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time statistics handed to the `on_statistics` callback
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Datagrams handed to the socket since start
    pub packets_sent: u64,
    /// Bytes handed to the socket since start
    pub bytes_sent: u64,
    /// Datagrams received since start
    pub packets_received: u64,
    /// Frames encoded since start
    pub frames_encoded: u64,
    /// Frames dropped by the governor since start
    pub frames_dropped: u64,
    /// Retransmissions issued since start
    pub retransmissions: u64,
    /// FEC recovery packets produced since start
    pub fec_packets_sent: u64,
    /// Send-queue overflow drops since start
    pub queue_overflow_dropped: u64,
    /// Receive-side parse/checksum discards since start
    pub receive_errors: u64,
    /// Transient send errors retried since start
    pub transient_send_errors: u64,

    /// Congestion controller's published target, bits per second
    pub target_bitrate: u64,
    /// Encoder output rate over the last second, bits per second
    pub output_bitrate: u64,
    /// Smoothed round-trip time, milliseconds
    pub srtt_ms: f64,
    /// Loss-event rate over the sliding window
    pub loss_rate: f64,
    /// Packets waiting in the send queue
    pub queue_depth: usize,
    /// Live sessions
    pub sessions: usize,
    /// QP the next frame will start from
    pub current_qp: u8,
}

impl EngineCounters {
    /// Fold the counters into a snapshot skeleton
    ///
    /// The caller fills in the controller- and queue-derived fields.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            fec_packets_sent: self.fec_packets_sent.load(Ordering::Relaxed),
            queue_overflow_dropped: self.queue_overflow_dropped.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            transient_send_errors: self.transient_send_errors.load(Ordering::Relaxed),
            ..StatsSnapshot::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_fold_into_snapshot() {
        let counters = EngineCounters::default();
        EngineCounters::bump(&counters.packets_sent);
        EngineCounters::add(&counters.bytes_sent, 1400);
        EngineCounters::bump(&counters.frames_encoded);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.packets_sent, 1);
        assert_eq!(snapshot.bytes_sent, 1400);
        assert_eq!(snapshot.frames_encoded, 1);
        assert_eq!(snapshot.frames_dropped, 0);
    }
}
