//! Closed-loop congestion control
//!
//! Couples the transport to the encoder: RTT, loss and delivery-rate
//! estimates come in from the feedback worker, a target bitrate and pacing
//! interval go out to the governor and the pacer.
//!
//! Estimation is BBR-style (bottleneck bandwidth is the maximum delivery
//! rate over a 10-RTT sliding window, propagation delay the minimum RTT
//! over the same window) while the window arithmetic stays Reno-style:
//! slow start doubles per RTT, congestion avoidance adds one packet per
//! window, a loss event halves `ss_thresh` and enters fast recovery until
//! the flight drains below the window.
//!
//! Every method takes an explicit `now`, so the whole controller is
//! deterministic under test.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::codec::frame::FrameClass;
use crate::transport::packet::MAX_PACKET_SIZE;

/// Loss-rate sliding average length, in congestion windows
const LOSS_WINDOW_COUNT: usize = 64;

/// Bandwidth / min-RTT sliding window length, in smoothed RTTs
const ESTIMATE_WINDOW_RTTS: u32 = 10;

/// Target bitrate recomputation period
const RETARGET_INTERVAL: Duration = Duration::from_millis(100);

/// Floor for the pacing interval
const MIN_PACING_INTERVAL_US: u64 = 1_000;

/// Subsequent ACKs required before a timed-out packet counts as lost
pub const DUPACK_THRESHOLD: u32 = 3;

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionPhase {
    /// Exponential window growth until `ss_thresh` or first loss
    SlowStart,
    /// Additive increase
    Avoidance,
    /// Draining after an RTO-style loss burst
    Recovery,
    /// Post-loss-event state until the flight fits the window
    FastRecovery,
}

/// Bitrate clamps and latency policy from the engine configuration
#[derive(Debug, Clone)]
pub struct CongestionConfig {
    /// Bitrate published before any feedback arrives, bits per second
    pub initial_bitrate: u64,
    /// Lower clamp for the target bitrate
    pub min_bitrate: u64,
    /// Upper clamp for the target bitrate
    pub max_bitrate: u64,
    /// PREDICTED frames older than this are never retransmitted
    pub max_latency_ms: u64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            initial_bitrate: 2_000_000,
            min_bitrate: 100_000,
            max_bitrate: 20_000_000,
            max_latency_ms: 200,
        }
    }
}

/// What the controller publishes after a retarget tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateUpdate {
    /// Encoder/pacer target, bits per second
    pub target_bitrate: u64,
    /// Pacer sleep between datagrams, microseconds
    pub pacing_interval_us: u64,
}

/// The congestion controller proper
#[derive(Debug)]
pub struct CongestionController {
    config: CongestionConfig,
    phase: CongestionPhase,
    /// Congestion window in packets
    cwnd: f64,
    ss_thresh: f64,
    bytes_in_flight: u64,

    srtt: Option<Duration>,
    rttvar: Duration,
    /// (when, rtt) samples inside the estimate window
    rtt_window: VecDeque<(Instant, Duration)>,
    /// (when, bits/s) delivery-rate samples inside the estimate window
    bw_window: VecDeque<(Instant, u64)>,
    /// Delivery accounting for the next bandwidth sample
    delivered_bytes: u64,
    delivery_epoch: Option<Instant>,

    /// Completed per-window loss ratios, most recent last
    loss_windows: VecDeque<f64>,
    window_sent: u32,
    window_lost: u32,

    target_bitrate: u64,
    pacing_interval_us: u64,
    last_retarget: Option<Instant>,
}

impl CongestionController {
    /// Create a controller in slow start at the configured initial rate
    pub fn new(config: CongestionConfig) -> Self {
        let initial = config
            .initial_bitrate
            .clamp(config.min_bitrate, config.max_bitrate);
        Self {
            config,
            phase: CongestionPhase::SlowStart,
            cwnd: 10.0,
            ss_thresh: f64::MAX,
            bytes_in_flight: 0,
            srtt: None,
            rttvar: Duration::ZERO,
            rtt_window: VecDeque::new(),
            bw_window: VecDeque::new(),
            delivered_bytes: 0,
            delivery_epoch: None,
            loss_windows: VecDeque::new(),
            window_sent: 0,
            window_lost: 0,
            target_bitrate: initial,
            pacing_interval_us: pacing_for(initial),
            last_retarget: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> CongestionPhase {
        self.phase
    }

    /// Congestion window in packets (never below 1)
    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    /// Slow-start threshold in packets
    pub fn ss_thresh(&self) -> f64 {
        self.ss_thresh
    }

    /// Unacknowledged bytes on the wire
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Smoothed RTT, if any sample arrived yet
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// RTT variance estimate
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Minimum RTT over the estimate window
    pub fn min_rtt(&self) -> Option<Duration> {
        self.rtt_window.iter().map(|&(_, rtt)| rtt).min()
    }

    /// Maximum delivery rate over the estimate window, bits per second
    pub fn bottleneck_bandwidth(&self) -> Option<u64> {
        self.bw_window.iter().map(|&(_, bw)| bw).max()
    }

    /// Loss-event rate averaged over the last 64 congestion windows
    pub fn loss_rate(&self) -> f64 {
        if self.loss_windows.is_empty() {
            return 0.0;
        }
        self.loss_windows.iter().sum::<f64>() / self.loss_windows.len() as f64
    }

    /// Most recently published target bitrate
    pub fn target_bitrate(&self) -> u64 {
        self.target_bitrate
    }

    /// Most recently published pacing interval
    pub fn pacing_interval_us(&self) -> u64 {
        self.pacing_interval_us
    }

    /// Retransmission timeout: `srtt + 4 · rttvar`
    pub fn rto(&self) -> Duration {
        match self.srtt {
            Some(srtt) => srtt + 4 * self.rttvar,
            None => Duration::from_millis(200),
        }
    }

    /// Account one packet handed to the wire
    pub fn on_packet_sent(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes as u64;
        self.window_sent += 1;
        self.roll_loss_window();
    }

    /// Fold in one RTT sample (RFC 6298 smoothing)
    pub fn on_rtt_sample(&mut self, sample: Duration, now: Instant) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let delta = if srtt > sample { srtt - sample } else { sample - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }
        self.rtt_window.push_back((now, sample));
        self.evict_window(now);
    }

    /// Account acknowledged bytes and grow the window
    pub fn on_ack(&mut self, bytes: usize, now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u64);

        // Delivery-rate sampling for the bottleneck estimate
        self.delivered_bytes += bytes as u64;
        let epoch = *self.delivery_epoch.get_or_insert(now);
        let elapsed = now.duration_since(epoch);
        let sample_period = self.srtt.unwrap_or(Duration::from_millis(50));
        if elapsed >= sample_period && !elapsed.is_zero() {
            let bits_per_sec =
                (self.delivered_bytes as u128 * 8_000_000 / elapsed.as_micros().max(1)) as u64;
            self.bw_window.push_back((now, bits_per_sec));
            self.delivered_bytes = 0;
            self.delivery_epoch = Some(now);
            self.evict_window(now);
        }

        match self.phase {
            CongestionPhase::SlowStart => {
                self.cwnd += 1.0;
                if self.cwnd >= self.ss_thresh {
                    self.phase = CongestionPhase::Avoidance;
                }
            }
            CongestionPhase::Avoidance | CongestionPhase::Recovery => {
                self.cwnd += 1.0 / self.cwnd;
                self.phase = CongestionPhase::Avoidance;
            }
            CongestionPhase::FastRecovery => {
                // Hold the window until the flight drains below it
                let cwnd_bytes = (self.cwnd * MAX_PACKET_SIZE as f64) as u64;
                if self.bytes_in_flight <= cwnd_bytes {
                    self.phase = CongestionPhase::Avoidance;
                }
            }
        }
        self.cwnd = self.cwnd.max(1.0);
    }

    /// Account one loss event: halve, floor at one packet, fast-recover
    pub fn on_loss_event(&mut self, lost_bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes as u64);
        self.window_lost += 1;
        self.ss_thresh = (self.cwnd / 2.0).max(1.0);
        self.cwnd = self.ss_thresh;
        self.phase = CongestionPhase::FastRecovery;
        self.roll_loss_window();
        debug!(
            cwnd = self.cwnd,
            ss_thresh = self.ss_thresh,
            "loss event, entering fast recovery"
        );
    }

    /// Account a full retransmission timeout: collapse the window
    ///
    /// Unlike a fast-recovery loss event, an RTO means the pipe went
    /// quiet; the window restarts from one packet.
    pub fn on_retransmission_timeout(&mut self) {
        self.ss_thresh = (self.cwnd / 2.0).max(1.0);
        self.cwnd = 1.0;
        self.phase = CongestionPhase::Recovery;
        debug!(ss_thresh = self.ss_thresh, "retransmission timeout, window collapsed");
    }

    /// Periodic retarget: publish bitrate and pacing every 100 ms
    ///
    /// `target = bottleneck_bw · (1 − loss_rate)`, clamped to the
    /// configured range; before any bandwidth sample exists the initial
    /// bitrate stands.
    pub fn maybe_retarget(&mut self, now: Instant) -> Option<RateUpdate> {
        if let Some(last) = self.last_retarget {
            if now.duration_since(last) < RETARGET_INTERVAL {
                return None;
            }
        }
        self.last_retarget = Some(now);

        let base = self.bottleneck_bandwidth().unwrap_or(self.config.initial_bitrate);
        let target = ((base as f64) * (1.0 - self.loss_rate())) as u64;
        self.target_bitrate = target.clamp(self.config.min_bitrate, self.config.max_bitrate);
        self.pacing_interval_us = pacing_for(self.target_bitrate);

        trace!(
            target = self.target_bitrate,
            pacing_us = self.pacing_interval_us,
            loss = self.loss_rate(),
            "bitrate retarget"
        );
        Some(RateUpdate {
            target_bitrate: self.target_bitrate,
            pacing_interval_us: self.pacing_interval_us,
        })
    }

    /// Whether a timed-out packet is still worth retransmitting
    ///
    /// KEY-frame packets always are. PREDICTED packets are only while the
    /// frame is fresher than `max_latency_ms`; past that, staleness wins
    /// over completeness.
    pub fn retransmit_allowed(&self, class: FrameClass, frame_age: Duration) -> bool {
        match class {
            FrameClass::Key => true,
            FrameClass::Predicted | FrameClass::ReferenceDropped => {
                frame_age < Duration::from_millis(self.config.max_latency_ms)
            }
            FrameClass::Audio => false,
        }
    }

    /// Close the current loss window once a window's worth of packets went out
    fn roll_loss_window(&mut self) {
        if f64::from(self.window_sent) < self.cwnd.max(1.0) {
            return;
        }
        let total = self.window_sent + self.window_lost;
        let ratio = if total == 0 {
            0.0
        } else {
            f64::from(self.window_lost) / f64::from(total)
        };
        self.loss_windows.push_back(ratio);
        while self.loss_windows.len() > LOSS_WINDOW_COUNT {
            self.loss_windows.pop_front();
        }
        self.window_sent = 0;
        self.window_lost = 0;
    }

    fn evict_window(&mut self, now: Instant) {
        let horizon = self.srtt.unwrap_or(Duration::from_millis(100)) * ESTIMATE_WINDOW_RTTS;
        while let Some(&(t, _)) = self.rtt_window.front() {
            if now.duration_since(t) > horizon {
                self.rtt_window.pop_front();
            } else {
                break;
            }
        }
        while let Some(&(t, _)) = self.bw_window.front() {
            if now.duration_since(t) > horizon {
                self.bw_window.pop_front();
            } else {
                break;
            }
        }
    }
}

fn pacing_for(bitrate: u64) -> u64 {
    let bits_per_packet = (MAX_PACKET_SIZE * 8) as u64;
    let interval = bits_per_packet * 1_000_000 / bitrate.max(1);
    interval.max(MIN_PACING_INTERVAL_US)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> CongestionController {
        CongestionController::new(CongestionConfig::default())
    }

    #[test]
    fn test_srtt_smoothing() {
        let mut cc = controller();
        let t = Instant::now();
        cc.on_rtt_sample(Duration::from_millis(100), t);
        assert_eq!(cc.srtt(), Some(Duration::from_millis(100)));
        assert_eq!(cc.rttvar(), Duration::from_millis(50));

        cc.on_rtt_sample(Duration::from_millis(200), t);
        // srtt = 7/8·100 + 1/8·200 = 112.5 ms
        assert_eq!(cc.srtt(), Some(Duration::from_micros(112_500)));
    }

    #[test]
    fn test_cwnd_never_below_one() {
        let mut cc = controller();
        for _ in 0..50 {
            cc.on_loss_event(MAX_PACKET_SIZE);
        }
        assert!(cc.cwnd() >= 1.0);
        assert!(cc.ss_thresh() >= 1.0);
    }

    #[test]
    fn test_loss_event_halves_and_enters_fast_recovery() {
        let mut cc = controller();
        let t = Instant::now();
        // Grow the window in slow start
        for _ in 0..20 {
            cc.on_packet_sent(1000);
            cc.on_ack(1000, t);
        }
        let before = cc.cwnd();
        cc.on_loss_event(1000);
        assert_eq!(cc.ss_thresh(), before / 2.0);
        assert_eq!(cc.cwnd(), before / 2.0);
        assert_eq!(cc.phase(), CongestionPhase::FastRecovery);
    }

    #[test]
    fn test_fast_recovery_exits_when_flight_drains() {
        let mut cc = controller();
        let t = Instant::now();
        for _ in 0..30 {
            cc.on_packet_sent(MAX_PACKET_SIZE);
        }
        cc.on_loss_event(MAX_PACKET_SIZE);
        assert_eq!(cc.phase(), CongestionPhase::FastRecovery);

        // Draining the flight below cwnd re-enters avoidance
        for _ in 0..29 {
            cc.on_ack(MAX_PACKET_SIZE, t);
        }
        assert_eq!(cc.phase(), CongestionPhase::Avoidance);
    }

    #[test]
    fn test_slow_start_transitions_to_avoidance_at_threshold() {
        let mut cc = controller();
        let t = Instant::now();
        cc.on_loss_event(0); // sets a finite ss_thresh, enters fast recovery
        cc.on_ack(0, t); // flight is empty, drops to avoidance
        assert_eq!(cc.phase(), CongestionPhase::Avoidance);

        let before = cc.cwnd();
        cc.on_ack(0, t);
        // Additive increase is sub-packet per ack
        assert!(cc.cwnd() - before < 1.0);
    }

    #[test]
    fn test_bandwidth_estimate_tracks_delivery() {
        let mut cc = controller();
        let t0 = Instant::now();
        cc.on_rtt_sample(Duration::from_millis(40), t0);
        // 125 kB over 50 ms = 20 Mbit/s
        cc.on_ack(25_000, t0);
        cc.on_ack(100_000, t0 + Duration::from_millis(50));
        let bw = cc.bottleneck_bandwidth().expect("sample recorded");
        assert!((19_000_000..21_000_000).contains(&bw), "bw = {bw}");
    }

    #[test]
    fn test_retarget_interval_and_clamping() {
        let mut cc = controller();
        let t0 = Instant::now();
        let update = cc.maybe_retarget(t0).expect("first retarget fires");
        assert_eq!(update.target_bitrate, 2_000_000);

        // Within 100 ms nothing is published
        assert!(cc.maybe_retarget(t0 + Duration::from_millis(50)).is_none());
        assert!(cc.maybe_retarget(t0 + Duration::from_millis(120)).is_some());
    }

    #[test]
    fn test_loss_rate_feeds_bitrate_down() {
        let mut cc = controller();
        let t0 = Instant::now();
        cc.on_rtt_sample(Duration::from_millis(20), t0);

        // Deliver ~10 Mbit/s, then report heavy loss windows
        cc.on_ack(25_000, t0);
        cc.on_ack(25_000, t0 + Duration::from_millis(20));
        for i in 0..200 {
            cc.on_packet_sent(1000);
            if i % 10 == 0 {
                cc.on_loss_event(1000);
            }
        }
        let loss = cc.loss_rate();
        assert!(loss > 0.0);

        let update = cc.maybe_retarget(t0 + Duration::from_millis(200)).unwrap();
        let bw = cc.bottleneck_bandwidth().unwrap();
        assert!(update.target_bitrate <= bw);
    }

    #[test]
    fn test_pacing_interval_floor() {
        // Absurdly high bitrate still paces at 1 ms minimum
        assert_eq!(pacing_for(u64::MAX / 2), MIN_PACING_INTERVAL_US);
        // 1400-byte packets at 1.12 Mbit/s pace at 10 ms
        assert_eq!(pacing_for(1_120_000), 10_000);
    }

    #[test]
    fn test_retransmit_staleness_policy() {
        let cc = controller();
        assert!(cc.retransmit_allowed(FrameClass::Key, Duration::from_secs(5)));
        assert!(cc.retransmit_allowed(FrameClass::Predicted, Duration::from_millis(100)));
        assert!(!cc.retransmit_allowed(FrameClass::Predicted, Duration::from_millis(300)));
        assert!(!cc.retransmit_allowed(FrameClass::Audio, Duration::ZERO));
    }

    #[test]
    fn test_rto_collapses_window() {
        let mut cc = controller();
        let t = Instant::now();
        for _ in 0..20 {
            cc.on_ack(0, t);
        }
        let before = cc.cwnd();
        cc.on_retransmission_timeout();
        assert_eq!(cc.phase(), CongestionPhase::Recovery);
        assert_eq!(cc.cwnd(), 1.0);
        assert_eq!(cc.ss_thresh(), before / 2.0);
    }

    #[test]
    fn test_rto_tracks_rtt_variance() {
        let mut cc = controller();
        let t = Instant::now();
        cc.on_rtt_sample(Duration::from_millis(100), t);
        // srtt 100 ms, rttvar 50 ms → rto 300 ms
        assert_eq!(cc.rto(), Duration::from_millis(300));
    }
}
