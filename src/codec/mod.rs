//! Block-based codec core
//!
//! Four codec variants share one inner loop; they differ only in block-size
//! caps, the partition kinds they may signal, their entropy backend, and
//! their optional tool set. [`CodecVariant`] is the tagged descriptor the
//! inner loop is parameterized by.

pub mod bitstream;
pub mod block;
pub mod encoder;
pub mod entropy;
pub mod frame;
pub mod governor;
pub mod motion;
pub mod transform;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::bitstream::BitstreamError;
use crate::codec::block::PartitionKind;
use crate::codec::entropy::EntropyBackend;
use crate::codec::motion::SearchStrategy;

/// Errors from the codec inner loop and its governor wrapper
///
/// These are the recoverable codec class: the governor retries once at a
/// raised QP, then drops the frame; nothing here is fatal to the engine.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame buffer does not match the declared geometry
    #[error("malformed frame: luma buffer smaller than stride × height")]
    MalformedFrame,

    /// Frame geometry changed mid-stream
    #[error("frame geometry changed from {expected_w}x{expected_h} to {got_w}x{got_h}")]
    GeometryChanged {
        /// Width the encoder was built for
        expected_w: usize,
        /// Height the encoder was built for
        expected_h: usize,
        /// Submitted width
        got_w: usize,
        /// Submitted height
        got_h: usize,
    },

    /// The bitstream layer failed mid-frame
    #[error("bitstream failure: {0}")]
    Bitstream(#[from] BitstreamError),

    /// The encode deadline was exceeded and the retry also overran
    #[error("encode deadline exceeded ({elapsed_ms} ms > {budget_ms} ms)")]
    DeadlineExceeded {
        /// Wall-clock the encode actually took
        elapsed_ms: u64,
        /// Configured budget
        budget_ms: u64,
    },
}

/// The four codec flavors, distinguished only by descriptor values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodecVariant {
    /// 16×16 macroblocks, run-length entropy coding
    Narrow,
    /// 64×64 coding tree units, arithmetic coding
    HevcLike,
    /// 128×128 superblocks, arithmetic coding, smooth/paeth intra
    Av1Like,
    /// 256×256 units, arithmetic coding, ternary splits, affine tools
    VvcLike,
}

impl CodecVariant {
    /// Largest coding block edge for this variant
    pub fn max_block_size(self) -> usize {
        match self {
            CodecVariant::Narrow => 16,
            CodecVariant::HevcLike => 64,
            CodecVariant::Av1Like => 128,
            CodecVariant::VvcLike => 256,
        }
    }

    /// Inclusive QP ceiling
    pub fn max_qp(self) -> u8 {
        match self {
            CodecVariant::Narrow => 51,
            _ => 63,
        }
    }

    /// Rate-distortion lambda scale factor `k` in `k · 2^((QP−12)/3)`
    pub fn lambda_k(self) -> f64 {
        match self {
            CodecVariant::Narrow => 0.68,
            _ => 0.85,
        }
    }

    /// Residual coder used by this variant
    pub fn entropy_backend(self) -> EntropyBackend {
        match self {
            CodecVariant::Narrow => EntropyBackend::RunLength,
            _ => EntropyBackend::Arithmetic,
        }
    }

    /// Partition kinds this variant may signal
    pub fn allowed_partitions(self) -> &'static [PartitionKind] {
        match self {
            CodecVariant::Narrow => &[PartitionKind::None, PartitionKind::QuadSplit],
            CodecVariant::HevcLike => &[
                PartitionKind::None,
                PartitionKind::QuadSplit,
                PartitionKind::HorizontalSplit,
                PartitionKind::VerticalSplit,
            ],
            CodecVariant::Av1Like => &[
                PartitionKind::None,
                PartitionKind::QuadSplit,
                PartitionKind::HorizontalSplit,
                PartitionKind::VerticalSplit,
            ],
            CodecVariant::VvcLike => &[
                PartitionKind::None,
                PartitionKind::QuadSplit,
                PartitionKind::HorizontalSplit,
                PartitionKind::VerticalSplit,
                PartitionKind::TernaryHorizontal,
                PartitionKind::TernaryVertical,
            ],
        }
    }

    /// Whether affine inter prediction is in the tool set
    pub fn supports_affine(self) -> bool {
        matches!(self, CodecVariant::VvcLike)
    }

    /// Whether intra block copy is in the tool set
    pub fn supports_intra_block_copy(self) -> bool {
        matches!(self, CodecVariant::Av1Like | CodecVariant::VvcLike)
    }

    /// Clamp a QP into this variant's valid range
    pub fn clamp_qp(self, qp: i32) -> u8 {
        qp.clamp(0, i32::from(self.max_qp())) as u8
    }

    /// Rate-distortion lambda at a given QP
    pub fn lambda(self, qp: u8) -> f64 {
        self.lambda_k() * 2f64.powf((f64::from(qp) - 12.0) / 3.0)
    }
}

/// Speed/quality preset, 0 (thorough) through 9 (fastest)
///
/// Gates the partition candidate set, the motion strategy, and whether
/// block columns may encode in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComplexityPreset(pub u8);

impl ComplexityPreset {
    /// Clamp into the valid 0..=9 range
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    /// Partition kinds actually evaluated at this preset
    ///
    /// Low presets search the variant's full candidate set; fast presets
    /// shrink it toward leaf-or-quad.
    pub fn partition_candidates(self, variant: CodecVariant) -> Vec<PartitionKind> {
        let allowed = variant.allowed_partitions();
        match self.0 {
            0..=2 => allowed.to_vec(),
            3..=5 => allowed
                .iter()
                .copied()
                .filter(|k| {
                    !matches!(
                        k,
                        PartitionKind::TernaryHorizontal | PartitionKind::TernaryVertical
                    )
                })
                .collect(),
            _ => vec![PartitionKind::None, PartitionKind::QuadSplit],
        }
    }

    /// Motion search strategy at this preset
    pub fn motion_strategy(self) -> SearchStrategy {
        match self.0 {
            0 => SearchStrategy::Full,
            1..=3 => SearchStrategy::Adaptive,
            4..=6 => SearchStrategy::Diamond,
            _ => SearchStrategy::ThreeStep,
        }
    }

    /// Whether block columns may be encoded concurrently
    pub fn allows_parallel_columns(self) -> bool {
        self.0 >= 7
    }

    /// Whether the partition decision may use SATD distortion
    pub fn uses_satd(self) -> bool {
        self.0 <= 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_descriptors() {
        assert_eq!(CodecVariant::Narrow.max_block_size(), 16);
        assert_eq!(CodecVariant::HevcLike.max_block_size(), 64);
        assert_eq!(CodecVariant::Av1Like.max_block_size(), 128);
        assert_eq!(CodecVariant::VvcLike.max_block_size(), 256);

        assert_eq!(CodecVariant::Narrow.max_qp(), 51);
        assert_eq!(CodecVariant::VvcLike.max_qp(), 63);

        assert_eq!(CodecVariant::Narrow.entropy_backend(), EntropyBackend::RunLength);
        assert_eq!(CodecVariant::Av1Like.entropy_backend(), EntropyBackend::Arithmetic);
    }

    #[test]
    fn test_only_vvc_signals_ternary() {
        for variant in [CodecVariant::Narrow, CodecVariant::HevcLike, CodecVariant::Av1Like] {
            assert!(!variant
                .allowed_partitions()
                .contains(&PartitionKind::TernaryHorizontal));
        }
        assert!(CodecVariant::VvcLike
            .allowed_partitions()
            .contains(&PartitionKind::TernaryVertical));
    }

    #[test]
    fn test_lambda_grows_with_qp() {
        let v = CodecVariant::HevcLike;
        assert!(v.lambda(30) > v.lambda(20));
        // Doubles every three QP steps
        let ratio = v.lambda(33) / v.lambda(30);
        assert!((ratio - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_qp_clamping() {
        assert_eq!(CodecVariant::Narrow.clamp_qp(80), 51);
        assert_eq!(CodecVariant::VvcLike.clamp_qp(80), 63);
        assert_eq!(CodecVariant::Narrow.clamp_qp(-4), 0);
    }

    #[test]
    fn test_preset_gates_candidates() {
        let thorough = ComplexityPreset::new(0).partition_candidates(CodecVariant::VvcLike);
        assert_eq!(thorough.len(), 6);

        let mid = ComplexityPreset::new(4).partition_candidates(CodecVariant::VvcLike);
        assert!(!mid.contains(&PartitionKind::TernaryHorizontal));

        let fast = ComplexityPreset::new(9).partition_candidates(CodecVariant::VvcLike);
        assert_eq!(fast, vec![PartitionKind::None, PartitionKind::QuadSplit]);
    }

    #[test]
    fn test_preset_motion_strategies() {
        assert_eq!(ComplexityPreset::new(0).motion_strategy(), SearchStrategy::Full);
        assert_eq!(ComplexityPreset::new(9).motion_strategy(), SearchStrategy::ThreeStep);
        assert!(ComplexityPreset::new(8).allows_parallel_columns());
        assert!(!ComplexityPreset::new(3).allows_parallel_columns());
    }
}
