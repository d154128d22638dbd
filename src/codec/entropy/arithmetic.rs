//! Binary arithmetic coder with adaptive context models
//!
//! The wide-block codecs' entropy engine. Each syntax element bin is coded
//! against a [`ContextModel`]: a 6-bit probability state plus the current
//! most-probable symbol. States walk fixed 64-entry transition tables, one
//! for MPS outcomes and one for LPS outcomes; the LPS probability shrinks
//! roughly geometrically with the state index.
//!
//! Internally this is a carry-propagating byte-oriented range coder: a
//! 32-bit `range`, a 64-bit `low` whose carries fold into a buffered byte
//! and a run of pending 0xFF bytes, renormalizing whenever `range` drops
//! below 2^24. Both directions are deterministic: the same bin sequence
//! always produces byte-identical output.

/// LPS probability per state, in 1/2048ths of the coding range
///
/// State 0 is equiprobable; each step scales by ~0.949, flooring so deep
/// states keep a nonzero escape probability.
const LPS_PROB: [u16; 64] = [
    1024, 972, 922, 875, 831, 788, 748, 710, 674, 639, 607, 576, 546, 519, 492, 467, 443, 421,
    399, 379, 359, 341, 324, 307, 292, 277, 263, 249, 236, 224, 213, 202, 192, 182, 173, 164, 156,
    148, 140, 133, 126, 120, 114, 108, 102, 97, 92, 87, 83, 79, 75, 71, 67, 64, 61, 58, 55, 52,
    49, 47, 44, 42, 40, 38,
];

/// State transition after coding the most probable symbol
const NEXT_STATE_MPS: [u8; 64] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
    26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48,
    49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 62, 63,
];

/// State transition after coding the least probable symbol
const NEXT_STATE_LPS: [u8; 64] = [
    0, 0, 1, 2, 2, 4, 4, 5, 6, 7, 8, 9, 9, 11, 11, 12, 13, 13, 15, 15, 16, 16, 18, 18, 19, 19,
    21, 21, 22, 22, 23, 24, 24, 25, 26, 26, 27, 27, 28, 29, 29, 30, 30, 30, 31, 32, 32, 33, 33,
    33, 34, 34, 35, 35, 35, 36, 36, 36, 37, 37, 37, 38, 38, 63,
];

const RENORM_LIMIT: u32 = 1 << 24;
const PROB_BITS: u32 = 11;

/// Adaptive probability state for one syntax element
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextModel {
    /// Probability state, 0 (equiprobable) to 63 (heavily skewed)
    pub state: u8,
    /// Current most probable symbol, 0 or 1
    pub mps: u8,
}

impl ContextModel {
    /// Fresh equiprobable context
    pub fn new() -> Self {
        Self::default()
    }
}

/// Arithmetic bin encoder
#[derive(Debug)]
pub struct ArithmeticEncoder {
    low: u64,
    range: u32,
    buffered_byte: u8,
    /// Bytes (the buffered one plus a run of 0xFF) awaiting carry resolution
    pending_bytes: u64,
    out: Vec<u8>,
}

impl Default for ArithmeticEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArithmeticEncoder {
    /// Create an encoder with an empty output buffer
    pub fn new() -> Self {
        Self {
            low: 0,
            range: u32::MAX,
            buffered_byte: 0,
            pending_bytes: 1,
            out: Vec::new(),
        }
    }

    /// Code one bin against `ctx`, updating its state
    pub fn encode_bin(&mut self, ctx: &mut ContextModel, bin: bool) {
        let lps_bound = (self.range >> PROB_BITS) * u32::from(LPS_PROB[usize::from(ctx.state)]);
        if u8::from(bin) == ctx.mps {
            // MPS occupies the upper part of the range
            self.low += u64::from(lps_bound);
            self.range -= lps_bound;
            ctx.state = NEXT_STATE_MPS[usize::from(ctx.state)];
        } else {
            self.range = lps_bound;
            if ctx.state == 0 {
                ctx.mps ^= 1;
            }
            ctx.state = NEXT_STATE_LPS[usize::from(ctx.state)];
        }
        self.renormalize();
    }

    /// Code one equiprobable bin without touching any context
    pub fn encode_bypass(&mut self, bin: bool) {
        let half = self.range >> 1;
        if bin {
            self.low += u64::from(half);
            self.range -= half;
        } else {
            self.range = half;
        }
        self.renormalize();
    }

    /// Code `value`'s low `num_bits` bits as bypass bins, MSB first
    pub fn encode_bypass_bits(&mut self, value: u32, num_bits: u8) {
        for i in (0..num_bits.min(32)).rev() {
            self.encode_bypass((value >> i) & 1 != 0);
        }
    }

    /// Terminate the stream and return the coded bytes
    ///
    /// Emits four termination bins in a deep-state context, then flushes
    /// the remaining low bits.
    pub fn finish(mut self) -> Vec<u8> {
        let mut term = ContextModel { state: 63, mps: 0 };
        for _ in 0..4 {
            self.encode_bin(&mut term, true);
        }
        for _ in 0..5 {
            self.shift_low();
        }
        self.out
    }

    #[inline]
    fn renormalize(&mut self) {
        while self.range < RENORM_LIMIT {
            self.shift_low();
            self.range <<= 8;
        }
    }

    fn shift_low(&mut self) {
        // Emit once the top byte can no longer be changed by a carry
        if (self.low as u32) < 0xFF00_0000 || self.low > u64::from(u32::MAX) {
            let carry = (self.low >> 32) as u8;
            let mut byte = self.buffered_byte;
            while self.pending_bytes > 0 {
                self.out.push(byte.wrapping_add(carry));
                byte = 0xFF;
                self.pending_bytes -= 1;
            }
            self.buffered_byte = (self.low >> 24) as u8;
        }
        self.pending_bytes += 1;
        self.low = (self.low << 8) & u64::from(u32::MAX);
    }
}

/// Arithmetic bin decoder, the exact inverse of [`ArithmeticEncoder`]
#[derive(Debug)]
pub struct ArithmeticDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    code: u32,
    range: u32,
}

impl<'a> ArithmeticDecoder<'a> {
    /// Create a decoder over bytes produced by [`ArithmeticEncoder::finish`]
    pub fn new(data: &'a [u8]) -> Self {
        let mut dec = Self {
            data,
            pos: 0,
            code: 0,
            range: u32::MAX,
        };
        // Prefetch; the first byte is the encoder's zero-initialized buffer
        for _ in 0..5 {
            dec.code = (dec.code << 8) | u32::from(dec.next_byte());
        }
        dec
    }

    /// Decode one bin against `ctx`, updating its state in lockstep with
    /// the encoder
    pub fn decode_bin(&mut self, ctx: &mut ContextModel) -> bool {
        let lps_bound = (self.range >> PROB_BITS) * u32::from(LPS_PROB[usize::from(ctx.state)]);
        let bin;
        if self.code < lps_bound {
            bin = ctx.mps ^ 1;
            self.range = lps_bound;
            if ctx.state == 0 {
                ctx.mps ^= 1;
            }
            ctx.state = NEXT_STATE_LPS[usize::from(ctx.state)];
        } else {
            bin = ctx.mps;
            self.code -= lps_bound;
            self.range -= lps_bound;
            ctx.state = NEXT_STATE_MPS[usize::from(ctx.state)];
        }
        self.renormalize();
        bin != 0
    }

    /// Decode one equiprobable bin
    pub fn decode_bypass(&mut self) -> bool {
        let half = self.range >> 1;
        let bin = if self.code < half {
            self.range = half;
            false
        } else {
            self.code -= half;
            self.range -= half;
            true
        };
        self.renormalize();
        bin
    }

    /// Decode `num_bits` bypass bins into an MSB-first value
    pub fn decode_bypass_bits(&mut self, num_bits: u8) -> u32 {
        let mut value = 0u32;
        for _ in 0..num_bits.min(32) {
            value = (value << 1) | u32::from(self.decode_bypass());
        }
        value
    }

    #[inline]
    fn renormalize(&mut self) {
        while self.range < RENORM_LIMIT {
            self.code = (self.code << 8) | u32::from(self.next_byte());
            self.range <<= 8;
        }
    }

    #[inline]
    fn next_byte(&mut self) -> u8 {
        // Reads past the flushed tail decode as zero padding
        let byte = self.data.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        byte
    }
}
