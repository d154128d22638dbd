//! Low-latency encoder governor
//!
//! Wraps the codec inner loop with a hard per-frame time budget. The
//! governor decides, before any pixel is touched, whether a frame is worth
//! encoding at all (frame dropping), how hard to quantize it (adaptive
//! QP), and how much search effort to spend (candidate restriction). After
//! each encode it folds the observed wall-clock back into the next frame's
//! QP.
//!
//! State machine per call: `IDLE → ENCODING → {EMITTED | DROPPED} → IDLE`.
//! Drops never touch the reference plane, so a dropped frame is invisible
//! to later prediction.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::codec::encoder::FrameEncoder;
use crate::codec::frame::{EncodedFrame, RawFrame};
use crate::codec::{CodecError, CodecVariant, ComplexityPreset};

/// Consecutive drops after which a frame is encoded regardless, so the
/// reference picture cannot starve
const MAX_CONSECUTIVE_DROPS: u32 = 5;

/// Pre-encode estimate overrun that triggers emergency measures
const ESTIMATE_OVERRUN_FACTOR: f64 = 1.5;

/// QP step applied when the deadline was exceeded
const QP_STEP_OVERRUN: i32 = 5;

/// QP step recovered when the encode finished in under half the budget
const QP_STEP_RECOVER: i32 = 2;

/// Flat QP boost applied when the pre-encode estimate blows the budget
const QP_STEP_EMERGENCY: i32 = 10;

/// Governor timing configuration
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Hard deadline for one encode call, milliseconds
    pub max_encoding_time_ms: u64,
    /// Target frame period (1000 / fps), milliseconds
    pub target_frame_period_ms: u64,
    /// Starting quantization parameter
    pub initial_qp: u8,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_encoding_time_ms: 16,
            target_frame_period_ms: 33,
            initial_qp: 30,
        }
    }
}

/// Why the governor refused to encode a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Capture is running ahead of the encoder
    BehindSchedule,
    /// Downstream queue has been saturated for two frame periods
    Backpressure,
    /// The inner loop failed twice (original QP and the raised retry)
    CodecFailure,
}

/// Outcome of one governed encode call
#[derive(Debug)]
pub enum EncodeOutcome {
    /// The frame was encoded within policy
    Emitted(EncodedFrame),
    /// The frame was skipped; the reference plane is untouched
    Dropped(DropReason),
}

/// Externally visible governor phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorState {
    /// Waiting for a frame
    Idle,
    /// Inside the codec inner loop
    Encoding,
}

/// Counters the engine folds into its statistics callback
#[derive(Debug, Clone, Copy, Default)]
pub struct GovernorStats {
    /// Frames successfully encoded
    pub frames_encoded: u64,
    /// Frames dropped by policy
    pub frames_dropped: u64,
    /// Wall-clock of the most recent encode, milliseconds
    pub last_encode_ms: u64,
    /// QP the next frame will start from
    pub current_qp: u8,
}

/// Deadline-enforcing wrapper around [`FrameEncoder`]
pub struct EncoderGovernor {
    config: GovernorConfig,
    encoder: FrameEncoder,
    preset: ComplexityPreset,
    qp: u8,
    state: GovernorState,
    consecutive_drops: u32,
    /// Timestamp of the previous `encode_at` call, emitted or not; a gap
    /// above 1.5 frame periods means the pipeline fell behind
    last_frame_time: Option<Instant>,
    /// When the downstream channel first reported saturation
    saturated_since: Option<Instant>,
    stats: GovernorStats,
}

impl EncoderGovernor {
    /// Build a governor around a fresh encoder
    pub fn new(
        variant: CodecVariant,
        preset: ComplexityPreset,
        gop_size: u32,
        width: usize,
        height: usize,
        config: GovernorConfig,
    ) -> Self {
        let qp = variant.clamp_qp(i32::from(config.initial_qp));
        Self {
            config,
            encoder: FrameEncoder::new(variant, preset, gop_size, width, height),
            preset,
            qp,
            state: GovernorState::Idle,
            consecutive_drops: 0,
            last_frame_time: None,
            saturated_since: None,
            stats: GovernorStats {
                current_qp: qp,
                ..GovernorStats::default()
            },
        }
    }

    /// Encode one frame under the configured deadline
    pub fn encode(&mut self, frame: &RawFrame) -> Result<EncodeOutcome, CodecError> {
        self.encode_at(frame, Instant::now())
    }

    /// Clock-explicit encode; the engine passes `Instant::now()`
    ///
    /// All schedule decisions derive from `now`, which keeps the drop
    /// policy deterministic under test.
    pub fn encode_at(&mut self, frame: &RawFrame, now: Instant) -> Result<EncodeOutcome, CodecError> {
        let period = Duration::from_millis(self.config.target_frame_period_ms);
        // The schedule reference moves on every call, emitted or dropped,
        // so one stall sheds one frame instead of poisoning the stream
        let previous = self.last_frame_time.replace(now);

        // Saturated downstream for two frame periods: shed PREDICTED frames
        if let Some(since) = self.saturated_since {
            if now.duration_since(since) >= 2 * period && !self.encoder.next_is_key() {
                self.record_drop(DropReason::Backpressure);
                return Ok(EncodeOutcome::Dropped(DropReason::Backpressure));
            }
        }

        // Behind schedule: drop, unless drops have piled up so far that the
        // reference would starve
        if let Some(last) = previous {
            let behind = now.duration_since(last) > period + period / 2;
            if behind && self.consecutive_drops <= MAX_CONSECUTIVE_DROPS {
                self.record_drop(DropReason::BehindSchedule);
                return Ok(EncodeOutcome::Dropped(DropReason::BehindSchedule));
            }
        }

        // Pre-encode cost estimate; an obviously over-budget frame encodes
        // at raised QP with a restricted candidate set instead of blowing
        // the deadline
        let estimate_ms = self.estimate_cost_ms(frame);
        let budget = self.config.max_encoding_time_ms as f64;
        let mut frame_qp = self.qp;
        let mut restricted = false;
        if estimate_ms > budget * ESTIMATE_OVERRUN_FACTOR {
            frame_qp = self.variant().clamp_qp(i32::from(frame_qp) + QP_STEP_EMERGENCY);
            self.encoder.set_preset(ComplexityPreset::new(9));
            restricted = true;
            debug!(estimate_ms, frame_qp, "emergency preset for oversized frame");
        }

        self.state = GovernorState::Encoding;
        let start = Instant::now();
        let result = self.encode_with_retry(frame, frame_qp);
        let elapsed = start.elapsed();
        if restricted {
            self.encoder.set_preset(self.preset);
        }
        self.state = GovernorState::Idle;

        let encoded = match result {
            Ok(encoded) => encoded,
            Err(err) if err_is_recoverable(&err) => {
                warn!(%err, frame_id = frame.frame_id, "encode failed twice, dropping frame");
                self.record_drop(DropReason::CodecFailure);
                return Ok(EncodeOutcome::Dropped(DropReason::CodecFailure));
            }
            Err(err) => return Err(err),
        };

        // Fold the observed time into the next frame's QP
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed_ms > self.config.max_encoding_time_ms {
            self.qp = self.variant().clamp_qp(i32::from(self.qp) + QP_STEP_OVERRUN);
            debug!(elapsed_ms, qp = self.qp, "deadline exceeded, raising QP");
        } else if elapsed_ms * 2 < self.config.max_encoding_time_ms {
            self.qp = self.variant().clamp_qp(i32::from(self.qp) - QP_STEP_RECOVER);
        }

        self.consecutive_drops = 0;
        self.stats.frames_encoded += 1;
        self.stats.last_encode_ms = elapsed_ms;
        self.stats.current_qp = self.qp;

        Ok(EncodeOutcome::Emitted(encoded))
    }

    /// Recoverable failure: retry once at raised QP, per the error policy
    fn encode_with_retry(&mut self, frame: &RawFrame, qp: u8) -> Result<EncodedFrame, CodecError> {
        match self.encoder.encode(frame, qp) {
            Ok(frame) => Ok(frame),
            Err(err) if err_is_recoverable(&err) => {
                let retry_qp = self.variant().clamp_qp(i32::from(qp) + QP_STEP_OVERRUN);
                warn!(%err, retry_qp, "encode failed, retrying at raised QP");
                self.encoder.encode(frame, retry_qp)
            }
            Err(err) => Err(err),
        }
    }

    /// Report downstream queue saturation (encoder→packetizer channel)
    pub fn set_channel_saturated(&mut self, saturated: bool, now: Instant) {
        match (saturated, self.saturated_since) {
            (true, None) => self.saturated_since = Some(now),
            (false, Some(_)) => self.saturated_since = None,
            _ => {}
        }
    }

    /// Fold the published bitrate target into the QP baseline
    ///
    /// Called by the engine once per statistics tick with the encoder's
    /// output EMA and the congestion controller's target.
    pub fn adjust_for_bitrate(&mut self, output_bps: u64, target_bps: u64) {
        if target_bps == 0 {
            return;
        }
        if output_bps > target_bps + target_bps / 10 {
            self.qp = self.variant().clamp_qp(i32::from(self.qp) + 1);
        } else if output_bps * 10 < target_bps * 8 {
            self.qp = self.variant().clamp_qp(i32::from(self.qp) - 1);
        }
        self.stats.current_qp = self.qp;
    }

    /// Force the next frame to be a KEY frame
    pub fn request_key_frame(&mut self) {
        self.encoder.request_key_frame();
    }

    /// Current phase (observable for diagnostics)
    pub fn state(&self) -> GovernorState {
        self.state
    }

    /// QP the next frame will start from
    pub fn current_qp(&self) -> u8 {
        self.qp
    }

    /// Counter snapshot for the statistics callback
    pub fn stats(&self) -> GovernorStats {
        self.stats
    }

    fn variant(&self) -> CodecVariant {
        self.encoder.variant()
    }

    fn record_drop(&mut self, reason: DropReason) {
        self.consecutive_drops += 1;
        self.stats.frames_dropped += 1;
        debug!(?reason, consecutive = self.consecutive_drops, "frame dropped");
    }

    /// Rough encode-time estimate from sampled pixel variance
    ///
    /// Scales with picture area, content activity, and the search effort
    /// of the active preset. Only the ratio against the deadline matters.
    fn estimate_cost_ms(&self, frame: &RawFrame) -> f64 {
        let mut sum = 0u64;
        let mut sum_sq = 0u64;
        let mut count = 0u64;
        let mut y = 0;
        while y < frame.height {
            let row = &frame.luma[y * frame.stride..y * frame.stride + frame.width];
            let mut x = 0;
            while x < frame.width {
                let p = u64::from(row[x]);
                sum += p;
                sum_sq += p * p;
                count += 1;
                x += 8;
            }
            y += 8;
        }
        if count == 0 {
            return 0.0;
        }
        let mean = sum as f64 / count as f64;
        let variance = (sum_sq as f64 / count as f64 - mean * mean).max(0.0);

        let megapixels = (frame.width * frame.height) as f64 / 1_000_000.0;
        let activity = 1.0 + variance / 2_000.0;
        let effort = match self.preset.0 {
            0 => 8.0,
            1..=3 => 3.0,
            4..=6 => 1.5,
            _ => 1.0,
        };
        megapixels * activity * effort * 4.0
    }
}

fn err_is_recoverable(err: &CodecError) -> bool {
    matches!(
        err,
        CodecError::Bitstream(_) | CodecError::DeadlineExceeded { .. }
    )
}
