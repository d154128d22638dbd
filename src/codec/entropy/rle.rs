//! Run-length variable-length coefficient coder
//!
//! The narrow-block codec's residual coder. A quantized 8×8 block is
//! zigzag-scanned into (level, preceding-zeros) pairs, then coded as:
//!
//! 1. total nonzero count (exp-Golomb)
//! 2. trailing ±1 count, clamped to 3 (exp-Golomb)
//! 3. one sign bit per trailing ±1
//! 4. each remaining level as a 4-bit magnitude with an escape extension,
//!    followed by its sign bit
//! 5. total zeros preceding the last nonzero (exp-Golomb)
//! 6. per-coefficient zero runs while any zeros remain unaccounted
//!
//! The decoder is the exact inverse; both sides are deterministic and
//! byte-identical across runs for a given block.

use crate::codec::bitstream::{BitReader, BitWriter, BitstreamResult};
use crate::codec::transform::BLOCK_LEN;

/// Zigzag scan order for an 8×8 block (row-major indices)
pub const ZIGZAG_8X8: [usize; BLOCK_LEN] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27,
    20, 13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58,
    59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

/// Magnitudes below this code directly in 4 bits; larger ones escape
const LEVEL_ESCAPE: u32 = 15;

/// Most trailing ±1 coefficients given compact sign-only coding
const MAX_TRAILING_ONES: usize = 3;

/// Encode one quantized block's coefficients into `writer`
pub fn encode_block(writer: &mut BitWriter, block: &[i16; BLOCK_LEN]) {
    // Scan into (level, zeros-before) pairs
    let mut levels: Vec<i16> = Vec::new();
    let mut runs: Vec<u32> = Vec::new();
    let mut zero_run = 0u32;
    for &pos in &ZIGZAG_8X8 {
        let coeff = block[pos];
        if coeff == 0 {
            zero_run += 1;
        } else {
            levels.push(coeff);
            runs.push(zero_run);
            zero_run = 0;
        }
    }

    let total_coeffs = levels.len();
    writer.write_ue(total_coeffs as u32);
    if total_coeffs == 0 {
        return;
    }

    // Trailing ±1 coefficients at the end of the scan
    let trailing_ones = levels
        .iter()
        .rev()
        .take(MAX_TRAILING_ONES)
        .take_while(|l| l.abs() == 1)
        .count();
    writer.write_ue(trailing_ones as u32);

    // Signs of the trailing ones, scan order
    for &level in &levels[total_coeffs - trailing_ones..] {
        writer.write_bit(level < 0);
    }

    // Remaining levels: escape-extended magnitude then sign
    for &level in &levels[..total_coeffs - trailing_ones] {
        let magnitude = u32::from(level.unsigned_abs());
        if magnitude < LEVEL_ESCAPE {
            writer.write_bits(magnitude, 4);
        } else {
            writer.write_bits(LEVEL_ESCAPE, 4);
            writer.write_ue(magnitude - LEVEL_ESCAPE);
        }
        writer.write_bit(level < 0);
    }

    // Zeros interleaved before the last nonzero
    let total_zeros: u32 = runs.iter().sum();
    writer.write_ue(total_zeros);

    // Per-coefficient runs until the zero budget is spent
    let mut zeros_left = total_zeros;
    for &run in &runs {
        if zeros_left == 0 {
            break;
        }
        writer.write_ue(run);
        zeros_left -= run;
    }
}

/// Decode one block previously written by [`encode_block`]
pub fn decode_block(reader: &mut BitReader<'_>) -> BitstreamResult<[i16; BLOCK_LEN]> {
    let mut block = [0i16; BLOCK_LEN];

    let total_coeffs = reader.read_ue()? as usize;
    if total_coeffs == 0 {
        return Ok(block);
    }

    // Clamp against corrupt input so a bad stream cannot underflow below
    let trailing_ones = (reader.read_ue()? as usize).min(total_coeffs);

    let mut trailing: Vec<i16> = Vec::with_capacity(trailing_ones);
    for _ in 0..trailing_ones {
        trailing.push(if reader.read_bit()? { -1 } else { 1 });
    }

    let mut levels: Vec<i16> = Vec::with_capacity(total_coeffs);
    for _ in 0..total_coeffs - trailing_ones {
        let prefix = reader.read_bits(4)?;
        let magnitude = if prefix == LEVEL_ESCAPE {
            LEVEL_ESCAPE + reader.read_ue()?
        } else {
            prefix
        };
        let negative = reader.read_bit()?;
        let value = magnitude as i16;
        levels.push(if negative { -value } else { value });
    }
    levels.extend_from_slice(&trailing);

    let total_zeros = reader.read_ue()?;
    let mut runs: Vec<u32> = Vec::with_capacity(total_coeffs);
    let mut zeros_left = total_zeros;
    for _ in 0..total_coeffs {
        if zeros_left == 0 {
            runs.push(0);
        } else {
            let run = reader.read_ue()?;
            runs.push(run);
            zeros_left = zeros_left.saturating_sub(run);
        }
    }

    // Re-expand along the scan
    let mut scan_pos = 0usize;
    for (level, run) in levels.iter().zip(runs.iter()) {
        scan_pos += *run as usize;
        if scan_pos >= BLOCK_LEN {
            break;
        }
        block[ZIGZAG_8X8[scan_pos]] = *level;
        scan_pos += 1;
    }

    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(block: &[i16; BLOCK_LEN]) -> [i16; BLOCK_LEN] {
        let mut writer = BitWriter::new();
        encode_block(&mut writer, block);
        let bytes = writer.finish();
        let mut reader = BitReader::new(&bytes);
        decode_block(&mut reader).unwrap()
    }

    #[test]
    fn test_all_zero_block_is_one_symbol() {
        let block = [0i16; BLOCK_LEN];
        let mut writer = BitWriter::new();
        encode_block(&mut writer, &block);
        // Exp-Golomb "0" is a single bit
        assert_eq!(writer.bit_len(), 1);
        assert_eq!(roundtrip(&block), block);
    }

    #[test]
    fn test_typical_quantized_block() {
        let mut block = [0i16; BLOCK_LEN];
        block[0] = 23; // DC
        block[1] = -7;
        block[8] = 4;
        block[16] = -1;
        block[9] = 1;
        block[2] = -2;
        assert_eq!(roundtrip(&block), block);
    }

    #[test]
    fn test_trailing_ones_and_signs() {
        let mut block = [0i16; BLOCK_LEN];
        // Along the zigzag: a big level then three ±1s
        block[0] = 9;
        block[1] = -1;
        block[8] = 1;
        block[16] = -1;
        assert_eq!(roundtrip(&block), block);
    }

    #[test]
    fn test_escape_levels() {
        let mut block = [0i16; BLOCK_LEN];
        block[0] = 300;
        block[1] = -15;
        block[8] = 14;
        block[63] = -1000;
        assert_eq!(roundtrip(&block), block);
    }

    #[test]
    fn test_dense_block() {
        let mut block = [0i16; BLOCK_LEN];
        for (i, c) in block.iter_mut().enumerate() {
            *c = (i as i16 % 5) - 2;
        }
        assert_eq!(roundtrip(&block), block);
    }

    #[test]
    fn test_single_last_coefficient() {
        let mut block = [0i16; BLOCK_LEN];
        block[63] = 1; // last scan position, 63 zeros before it
        assert_eq!(roundtrip(&block), block);
    }

    #[test]
    fn test_deterministic_output() {
        let mut block = [0i16; BLOCK_LEN];
        block[0] = 5;
        block[9] = -3;
        let mut a = BitWriter::new();
        let mut b = BitWriter::new();
        encode_block(&mut a, &block);
        encode_block(&mut b, &block);
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn test_many_random_blocks_roundtrip() {
        // Deterministic pseudo-random coverage across sparsities
        let mut state = 0x1234_5678u32;
        let mut next = move || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            state
        };
        for density in [2u32, 8, 20, 50] {
            let mut block = [0i16; BLOCK_LEN];
            for c in block.iter_mut() {
                if next() % 64 < density {
                    *c = ((next() % 4001) as i16) - 2000;
                }
            }
            assert_eq!(roundtrip(&block), block);
        }
    }
}
