//! 8×8 transform and scalar quantization
//!
//! All codec variants share one transform size: a forward type-II DCT over
//! 8×8 residual blocks with a precomputed cosine table, and its exactly
//! symmetric inverse. Quantization is scalar: each coefficient is divided
//! by `base_step(qp) · quant_matrix[i][j]` and rounded to nearest;
//! dequantization multiplies back.
//!
//! The step ladder has 48 entries and doubles roughly every six QP steps.
//! Ladder addressing depends on the variant's QP range: the narrow-block
//! codec (QP 0–51) indexes `qp % 48`, so its top four QP values wrap to
//! the bottom of the ladder; the wide-block variants (QP 0–63) clamp
//! indices past the ladder to the last entry.

use std::f64::consts::PI;

use crate::codec::CodecVariant;

/// Transform dimension (blocks are `BLOCK_DIM × BLOCK_DIM`)
pub const BLOCK_DIM: usize = 8;

/// Coefficient count per block
pub const BLOCK_LEN: usize = BLOCK_DIM * BLOCK_DIM;

/// Quantizer step scale per QP, before the quantization matrix is applied
///
/// Doubles every six entries, H.264-style.
const QP_SCALE: [f64; 48] = [
    0.625, 0.6875, 0.8125, 0.875, 1.0, 1.125, 1.25, 1.375, 1.625, 1.75, 2.0, 2.25, 2.5, 2.75,
    3.25, 3.5, 4.0, 4.5, 5.0, 5.5, 6.5, 7.0, 8.0, 9.0, 10.0, 11.0, 13.0, 14.0, 16.0, 18.0, 20.0,
    22.0, 26.0, 28.0, 32.0, 36.0, 40.0, 44.0, 52.0, 56.0, 64.0, 72.0, 80.0, 88.0, 104.0, 112.0,
    128.0, 144.0,
];

/// Flat quantization matrix (uniform weighting across frequencies)
const QUANT_MATRIX: [u8; BLOCK_LEN] = [16; BLOCK_LEN];

/// Ladder position for a QP under the variant's addressing rule
fn ladder_index(variant: CodecVariant, qp: u8) -> usize {
    match variant {
        CodecVariant::Narrow => usize::from(qp) % QP_SCALE.len(),
        _ => usize::from(qp).min(QP_SCALE.len() - 1),
    }
}

/// Effective quantizer step at `qp` for the flat matrix
///
/// `dequantize(quantize(x, v, qp), v, qp)` stays within
/// `base_step(v, qp) / 2` of `x` (plus rounding noise from the
/// floating-point transform path).
pub fn base_step(variant: CodecVariant, qp: u8) -> f64 {
    QP_SCALE[ladder_index(variant, qp)] * f64::from(QUANT_MATRIX[0])
}

/// 8×8 type-II DCT with precomputed basis
///
/// One instance is built per encoder and reused for every block; the
/// cosine table is the only state.
#[derive(Debug, Clone)]
pub struct Dct8 {
    /// `cos[(2x + 1) · u · π / 16]` indexed `[x][u]`
    cos: [[f64; BLOCK_DIM]; BLOCK_DIM],
}

impl Default for Dct8 {
    fn default() -> Self {
        Self::new()
    }
}

impl Dct8 {
    /// Build the transform, precomputing the cosine table
    pub fn new() -> Self {
        let mut cos = [[0.0; BLOCK_DIM]; BLOCK_DIM];
        for (x, row) in cos.iter_mut().enumerate() {
            for (u, c) in row.iter_mut().enumerate() {
                *c = (((2 * x + 1) * u) as f64 * PI / (2.0 * BLOCK_DIM as f64)).cos();
            }
        }
        Self { cos }
    }

    /// Forward DCT of a residual block (row-major, 64 samples)
    pub fn forward(&self, input: &[i16; BLOCK_LEN], output: &mut [f64; BLOCK_LEN]) {
        for u in 0..BLOCK_DIM {
            for v in 0..BLOCK_DIM {
                let mut sum = 0.0;
                for x in 0..BLOCK_DIM {
                    for y in 0..BLOCK_DIM {
                        sum += f64::from(input[x * BLOCK_DIM + y]) * self.cos[x][u] * self.cos[y][v];
                    }
                }
                let cu = if u == 0 { 1.0 / 2f64.sqrt() } else { 1.0 };
                let cv = if v == 0 { 1.0 / 2f64.sqrt() } else { 1.0 };
                output[u * BLOCK_DIM + v] = 0.25 * cu * cv * sum;
            }
        }
    }

    /// Inverse DCT back to spatial residual, rounded to integers
    pub fn inverse(&self, input: &[f64; BLOCK_LEN], output: &mut [i16; BLOCK_LEN]) {
        for x in 0..BLOCK_DIM {
            for y in 0..BLOCK_DIM {
                let mut sum = 0.0;
                for u in 0..BLOCK_DIM {
                    for v in 0..BLOCK_DIM {
                        let cu = if u == 0 { 1.0 / 2f64.sqrt() } else { 1.0 };
                        let cv = if v == 0 { 1.0 / 2f64.sqrt() } else { 1.0 };
                        sum += cu * cv * input[u * BLOCK_DIM + v] * self.cos[x][u] * self.cos[y][v];
                    }
                }
                output[x * BLOCK_DIM + y] = (0.25 * sum).round() as i16;
            }
        }
    }
}

/// Quantize DCT coefficients at `qp`, rounding to nearest level
pub fn quantize(coeffs: &[f64; BLOCK_LEN], variant: CodecVariant, qp: u8) -> [i16; BLOCK_LEN] {
    let scale = QP_SCALE[ladder_index(variant, qp)];
    let mut out = [0i16; BLOCK_LEN];
    for (i, (level, &c)) in out.iter_mut().zip(coeffs.iter()).enumerate() {
        let step = f64::from(QUANT_MATRIX[i]) * scale;
        *level = (c / step).round() as i16;
    }
    out
}

/// Expand quantized levels back to coefficient magnitudes
pub fn dequantize(levels: &[i16; BLOCK_LEN], variant: CodecVariant, qp: u8) -> [f64; BLOCK_LEN] {
    let scale = QP_SCALE[ladder_index(variant, qp)];
    let mut out = [0.0f64; BLOCK_LEN];
    for (i, (c, &level)) in out.iter_mut().zip(levels.iter()).enumerate() {
        let step = f64::from(QUANT_MATRIX[i]) * scale;
        *c = f64::from(level) * step;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_block() -> [i16; BLOCK_LEN] {
        let mut b = [0i16; BLOCK_LEN];
        for (i, s) in b.iter_mut().enumerate() {
            *s = (i as i16 % 17) * 3 - 24;
        }
        b
    }

    #[test]
    fn test_dct_roundtrip_is_lossless_without_quantization() {
        let dct = Dct8::new();
        let input = ramp_block();
        let mut coeffs = [0.0; BLOCK_LEN];
        let mut output = [0i16; BLOCK_LEN];

        dct.forward(&input, &mut coeffs);
        dct.inverse(&coeffs, &mut output);

        assert_eq!(input, output);
    }

    #[test]
    fn test_dct_dc_of_flat_block() {
        let dct = Dct8::new();
        let input = [100i16; BLOCK_LEN];
        let mut coeffs = [0.0; BLOCK_LEN];
        dct.forward(&input, &mut coeffs);

        // A flat block concentrates all energy in the DC coefficient
        assert!((coeffs[0] - 800.0).abs() < 1e-6);
        for &c in &coeffs[1..] {
            assert!(c.abs() < 1e-6, "AC coefficient should be zero, got {c}");
        }
    }

    #[test]
    fn test_quantizer_error_bound() {
        // Invariant: |dequantize(quantize(c, qp), qp) - c| <= base_step(qp)/2 + 1
        let cases = [
            (CodecVariant::Narrow, [0u8, 12, 26, 40, 47, 48, 51]),
            (CodecVariant::VvcLike, [0u8, 12, 26, 40, 47, 55, 63]),
        ];
        for (variant, qps) in cases {
            for qp in qps {
                let mut coeffs = [0.0f64; BLOCK_LEN];
                for (i, c) in coeffs.iter_mut().enumerate() {
                    *c = (i as f64 - 32.0) * 973.0; // spans ±2^15
                }
                let levels = quantize(&coeffs, variant, qp);
                let restored = dequantize(&levels, variant, qp);
                let bound = base_step(variant, qp) / 2.0 + 1.0;
                for (orig, rest) in coeffs.iter().zip(restored.iter()) {
                    assert!(
                        (orig - rest).abs() <= bound,
                        "{variant:?} qp={qp}: {orig} -> {rest} exceeds {bound}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_wide_ladder_clamps_past_end() {
        let v = CodecVariant::VvcLike;
        for qp in 1..48u8 {
            assert!(base_step(v, qp) >= base_step(v, qp - 1));
        }
        // Indices past the 48-entry ladder hold at the last step
        assert_eq!(base_step(v, 48), base_step(v, 47));
        assert_eq!(base_step(v, 63), base_step(v, 47));
    }

    #[test]
    fn test_narrow_ladder_wraps_modulo() {
        let v = CodecVariant::Narrow;
        for qp in 1..48u8 {
            assert!(base_step(v, qp) >= base_step(v, qp - 1));
        }
        // QP 48..=51 wrap to the bottom of the ladder
        assert_eq!(base_step(v, 48), base_step(v, 0));
        assert_eq!(base_step(v, 51), base_step(v, 3));
    }

    #[test]
    fn test_zero_block_quantizes_to_zero() {
        let coeffs = [0.0f64; BLOCK_LEN];
        let levels = quantize(&coeffs, CodecVariant::Narrow, 30);
        assert!(levels.iter().all(|&l| l == 0));
    }
}
