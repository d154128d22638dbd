//! Entropy coding backends
//!
//! Two residual coders share the zigzag scan: a run-length variable-length
//! coder ([`rle`]) used by the narrow-block codec, and an adaptive binary
//! arithmetic coder ([`arithmetic`]) used by the wide-block codecs. Both
//! are deterministic and ship with exact-inverse decoders.

pub mod arithmetic;
pub mod rle;

pub use arithmetic::{ArithmeticDecoder, ArithmeticEncoder, ContextModel};
pub use rle::{decode_block, encode_block, ZIGZAG_8X8};

use crate::codec::transform::BLOCK_LEN;

/// Residual coefficient coder selected by the codec variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyBackend {
    /// Run-length variable-length coding (narrow-block codec)
    RunLength,
    /// Context-adaptive binary arithmetic coding (wide-block codecs)
    Arithmetic,
}

/// Contexts the arithmetic backend keeps per frame
///
/// One model per syntax element family; all reset at frame start so frames
/// decode independently.
#[derive(Debug, Clone, Default)]
pub struct FrameContexts {
    /// Partition-split flags
    pub split: ContextModel,
    /// Intra/inter selector
    pub inter: ContextModel,
    /// Coded-block (any nonzero coefficient) flags
    pub coded_block: ContextModel,
    /// Coefficient significance flags
    pub significant: ContextModel,
}

/// Encode a quantized block through the arithmetic coder
///
/// Coefficients ride as a significance flag per scan position (context
/// coded) plus sign and exp-Golomb-style magnitude in bypass bins.
pub fn encode_block_arithmetic(
    enc: &mut ArithmeticEncoder,
    ctxs: &mut FrameContexts,
    block: &[i16; BLOCK_LEN],
) {
    let any = block.iter().any(|&c| c != 0);
    enc.encode_bin(&mut ctxs.coded_block, any);
    if !any {
        return;
    }
    for &pos in &ZIGZAG_8X8 {
        let coeff = block[pos];
        enc.encode_bin(&mut ctxs.significant, coeff != 0);
        if coeff != 0 {
            enc.encode_bypass(coeff < 0);
            encode_magnitude(enc, u32::from(coeff.unsigned_abs()));
        }
    }
}

/// Decode a block written by [`encode_block_arithmetic`]
pub fn decode_block_arithmetic(
    dec: &mut ArithmeticDecoder<'_>,
    ctxs: &mut FrameContexts,
) -> [i16; BLOCK_LEN] {
    let mut block = [0i16; BLOCK_LEN];
    if !dec.decode_bin(&mut ctxs.coded_block) {
        return block;
    }
    for &pos in &ZIGZAG_8X8 {
        if dec.decode_bin(&mut ctxs.significant) {
            let negative = dec.decode_bypass();
            let magnitude = decode_magnitude(dec) as i16;
            block[pos] = if negative { -magnitude } else { magnitude };
        }
    }
    block
}

/// Code an arbitrary unsigned value through bypass bins
pub fn encode_ue_bypass(enc: &mut ArithmeticEncoder, value: u32) {
    encode_magnitude(enc, value.saturating_add(1));
}

/// Inverse of [`encode_ue_bypass`]
pub fn decode_ue_bypass(dec: &mut ArithmeticDecoder<'_>) -> u32 {
    decode_magnitude(dec) - 1
}

/// Code a signed value through bypass bins (zigzag mapping)
pub fn encode_se_bypass(enc: &mut ArithmeticEncoder, value: i32) {
    let mapped = if value <= 0 {
        (-(i64::from(value)) * 2) as u32
    } else {
        (value as u32) * 2 - 1
    };
    encode_ue_bypass(enc, mapped);
}

/// Inverse of [`encode_se_bypass`]
pub fn decode_se_bypass(dec: &mut ArithmeticDecoder<'_>) -> i32 {
    let ue = decode_ue_bypass(dec);
    if ue % 2 == 0 {
        -((ue / 2) as i32)
    } else {
        ((ue + 1) / 2) as i32
    }
}

/// Unary-prefixed magnitude in bypass bins (value >= 1)
fn encode_magnitude(enc: &mut ArithmeticEncoder, magnitude: u32) {
    let coded = magnitude; // >= 1
    let bits = 32 - coded.leading_zeros() as u8;
    for _ in 0..bits - 1 {
        enc.encode_bypass(false);
    }
    enc.encode_bypass(true);
    if bits > 1 {
        enc.encode_bypass_bits(coded & ((1 << (bits - 1)) - 1), bits - 1);
    }
}

fn decode_magnitude(dec: &mut ArithmeticDecoder<'_>) -> u32 {
    let mut leading = 0u8;
    while !dec.decode_bypass() {
        leading += 1;
        // A valid u32 magnitude never has 31+ prefix zeros
        if leading >= 31 {
            break;
        }
    }
    if leading == 0 {
        return 1;
    }
    (1 << leading) | dec.decode_bypass_bits(leading)
}
