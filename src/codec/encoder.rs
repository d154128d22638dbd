//! Codec inner loop
//!
//! One parametric implementation drives all four codec variants. Per
//! frame, each superblock runs the same pipeline:
//!
//! 1. recursive partition decision by rate-distortion cost `D + λ·R`
//! 2. intra or inter prediction at each leaf
//! 3. 8×8 transform and quantization of the residual
//! 4. entropy coding of partition kinds, modes, vectors and coefficients
//! 5. reconstruction into the plane that becomes the next reference
//!
//! Frames are split into tiles of whole superblock columns. At high
//! complexity presets tiles encode concurrently: intra prediction stays
//! tile-local, motion estimation reads the shared reference plane, and the
//! per-tile bitstreams are stitched with length prefixes. One tile is the
//! sequential case.
//!
//! Reconstruction commits only after a block's coding succeeds, so a
//! cancelled or failed encode never publishes a partial reference.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::codec::bitstream::BitWriter;
use crate::codec::block::{
    predict_intra, CodingBlock, InterMode, IntraMode, PartitionKind, Prediction,
};
use crate::codec::entropy::{
    encode_block_arithmetic, encode_se_bypass, ArithmeticEncoder, EntropyBackend, FrameContexts,
};
use crate::codec::frame::{EncodedFrame, FrameClass, Plane, RawFrame};
use crate::codec::motion::{self, MotionVector, MV_BLOCK};
use crate::codec::transform::{dequantize, quantize, Dct8, BLOCK_DIM, BLOCK_LEN};
use crate::codec::{CodecError, CodecVariant, ComplexityPreset};

/// Smallest codable leaf edge; matches the transform dimension
const MIN_LEAF: usize = BLOCK_DIM;

/// Upper bound on concurrent tile encoders
const MAX_TILES: usize = 4;

/// Stateful per-session frame encoder
///
/// Owns the reference plane. Single-owner: exactly one encoder worker
/// drives it per session.
pub struct FrameEncoder {
    variant: CodecVariant,
    preset: ComplexityPreset,
    gop_size: u32,
    width: usize,
    height: usize,
    padded_w: usize,
    padded_h: usize,
    dct: Dct8,
    /// Most recent non-dropped reference picture
    reference: Option<Plane>,
    /// Frames emitted since the last KEY frame (KEY itself counts as 1)
    frames_since_key: u32,
}

impl FrameEncoder {
    /// Create an encoder for a fixed frame geometry
    pub fn new(
        variant: CodecVariant,
        preset: ComplexityPreset,
        gop_size: u32,
        width: usize,
        height: usize,
    ) -> Self {
        let padded_w = width.div_ceil(MIN_LEAF) * MIN_LEAF;
        let padded_h = height.div_ceil(MIN_LEAF) * MIN_LEAF;
        Self {
            variant,
            preset,
            gop_size: gop_size.max(1),
            width,
            height,
            padded_w,
            padded_h,
            dct: Dct8::new(),
            reference: None,
            frames_since_key: 0,
        }
    }

    /// The variant this encoder was built for
    pub fn variant(&self) -> CodecVariant {
        self.variant
    }

    /// Replace the complexity preset (governor control path)
    pub fn set_preset(&mut self, preset: ComplexityPreset) {
        self.preset = preset;
    }

    /// Force the next frame to be a KEY frame
    pub fn request_key_frame(&mut self) {
        self.frames_since_key = self.gop_size;
    }

    /// Whether the next encoded frame will be a KEY frame
    pub fn next_is_key(&self) -> bool {
        self.reference.is_none() || self.frames_since_key >= self.gop_size
    }

    /// Encode one frame at the given QP
    ///
    /// Emits a KEY frame every `gop_size` frames (and whenever no reference
    /// exists), PREDICTED otherwise. The reconstruction becomes the new
    /// reference only after the whole frame coded successfully.
    pub fn encode(&mut self, frame: &RawFrame, qp: u8) -> Result<EncodedFrame, CodecError> {
        if !frame.is_well_formed() {
            return Err(CodecError::MalformedFrame);
        }
        if frame.width != self.width || frame.height != self.height {
            return Err(CodecError::GeometryChanged {
                expected_w: self.width,
                expected_h: self.height,
                got_w: frame.width,
                got_h: frame.height,
            });
        }

        let qp = self.variant.clamp_qp(i32::from(qp));
        let class = if self.next_is_key() {
            FrameClass::Key
        } else {
            FrameClass::Predicted
        };

        let source = pad_plane(frame, self.padded_w, self.padded_h);
        let reference = if class == FrameClass::Key {
            None
        } else {
            self.reference.as_ref()
        };

        let sb = self.variant.max_block_size();
        let tiles = plan_tiles(self.padded_w, sb, self.tile_count());

        let mut outputs: Vec<(Vec<u8>, Plane)> = Vec::with_capacity(tiles.len());
        if tiles.len() == 1 {
            let (x0, tile_w) = tiles[0];
            outputs.push(self.code_tile(&source, reference, class, qp, x0, tile_w));
        } else {
            // Fan out whole superblock columns; the reference plane is
            // read-only so concurrent motion estimation is safe
            let this: &FrameEncoder = self;
            let results: Vec<_> = std::thread::scope(|scope| {
                let handles: Vec<_> = tiles
                    .iter()
                    .map(|&(x0, tile_w)| {
                        let source = &source;
                        scope.spawn(move || this.code_tile(source, reference, class, qp, x0, tile_w))
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().expect("tile encoder panicked")).collect()
            });
            outputs = results;
        }

        // Stitch tile reconstructions into the next reference
        let mut recon = Plane::new(self.padded_w, self.padded_h);
        for (&(x0, tile_w), (_, tile_recon)) in tiles.iter().zip(outputs.iter()) {
            for y in 0..self.padded_h {
                let src = &tile_recon.row(y)[..tile_w];
                for (dx, &p) in src.iter().enumerate() {
                    *recon.pixel_mut(x0 + dx, y) = p;
                }
            }
        }

        let mut payload = BytesMut::with_capacity(outputs.iter().map(|(b, _)| b.len() + 8).sum());
        payload.put_u8(class as u8);
        payload.put_u8(qp);
        payload.put_u16(outputs.len() as u16);
        for (bytes, _) in &outputs {
            payload.put_u32(bytes.len() as u32);
            payload.put_slice(bytes);
        }

        self.reference = Some(recon);
        self.frames_since_key = if class == FrameClass::Key {
            1
        } else {
            self.frames_since_key + 1
        };

        debug!(
            frame_id = frame.frame_id,
            ?class,
            qp,
            bytes = payload.len(),
            tiles = outputs.len(),
            "frame encoded"
        );

        Ok(EncodedFrame {
            frame_id: frame.frame_id,
            capture_ts_us: frame.capture_ts_us,
            class,
            is_recovery_point: class == FrameClass::Key,
            data: Bytes::from(payload),
        })
    }

    fn tile_count(&self) -> usize {
        if self.preset.allows_parallel_columns() {
            MAX_TILES
        } else {
            1
        }
    }

    fn code_tile(
        &self,
        source: &Plane,
        reference: Option<&Plane>,
        class: FrameClass,
        qp: u8,
        x0: usize,
        tile_w: usize,
    ) -> (Vec<u8>, Plane) {
        let mut coder = TileCoder {
            variant: self.variant,
            preset: self.preset,
            qp,
            lambda: self.variant.lambda(qp),
            dct: &self.dct,
            source,
            reference,
            intra_only: class == FrameClass::Key,
            x0,
            tile_w,
            height: self.padded_h,
            recon: Plane::new(tile_w, self.padded_h),
            prev_mv: None,
            sink: EntropySink::new(self.variant.entropy_backend()),
        };
        coder.run();
        let TileCoder { sink, recon, .. } = coder;
        (sink.finish(), recon)
    }
}

/// Tile boundaries `(x0, width)` covering whole superblock columns
fn plan_tiles(padded_w: usize, sb: usize, want: usize) -> Vec<(usize, usize)> {
    let sb_cols = padded_w.div_ceil(sb);
    let tiles = want.clamp(1, sb_cols);
    let cols_per_tile = sb_cols.div_ceil(tiles);
    let mut out = Vec::new();
    let mut col = 0;
    while col < sb_cols {
        let x0 = col * sb;
        let end_col = (col + cols_per_tile).min(sb_cols);
        let x1 = (end_col * sb).min(padded_w);
        out.push((x0, x1 - x0));
        col = end_col;
    }
    out
}

/// Replicate-pad a raw frame into a plane of block-aligned dimensions
fn pad_plane(frame: &RawFrame, padded_w: usize, padded_h: usize) -> Plane {
    let mut plane = Plane::new(padded_w, padded_h);
    for y in 0..padded_h {
        let sy = y.min(frame.height - 1);
        let src_row = &frame.luma[sy * frame.stride..sy * frame.stride + frame.width];
        for x in 0..padded_w {
            *plane.pixel_mut(x, y) = src_row[x.min(frame.width - 1)];
        }
    }
    plane
}

/// Entropy backend state for one tile's bitstream
enum EntropySink {
    RunLength(BitWriter),
    Arithmetic {
        enc: ArithmeticEncoder,
        ctxs: FrameContexts,
    },
}

impl EntropySink {
    fn new(backend: EntropyBackend) -> Self {
        match backend {
            EntropyBackend::RunLength => EntropySink::RunLength(BitWriter::new()),
            EntropyBackend::Arithmetic => EntropySink::Arithmetic {
                enc: ArithmeticEncoder::new(),
                ctxs: FrameContexts::default(),
            },
        }
    }

    fn finish(self) -> Vec<u8> {
        match self {
            EntropySink::RunLength(writer) => writer.finish(),
            EntropySink::Arithmetic { enc, .. } => enc.finish(),
        }
    }
}

/// Per-tile coding state
struct TileCoder<'a> {
    variant: CodecVariant,
    preset: ComplexityPreset,
    qp: u8,
    lambda: f64,
    dct: &'a Dct8,
    /// Padded source picture, global coordinates
    source: &'a Plane,
    /// Reference picture for inter prediction, global coordinates
    reference: Option<&'a Plane>,
    intra_only: bool,
    /// Tile left edge in the frame
    x0: usize,
    tile_w: usize,
    height: usize,
    /// Tile-local reconstruction (column `x0` maps to local 0)
    recon: Plane,
    /// Motion vector of the previous inter leaf, seeds adaptive search
    prev_mv: Option<MotionVector>,
    sink: EntropySink,
}

impl TileCoder<'_> {
    fn run(&mut self) {
        let sb = self.variant.max_block_size();
        for y in (0..self.height).step_by(sb) {
            let h = sb.min(self.height - y);
            for lx in (0..self.tile_w).step_by(sb) {
                let x = self.x0 + lx;
                let w = sb.min(self.tile_w - lx);
                let (block, _, _) = self.code_region(x, y, w, h);
                self.write_tree(&block);
            }
        }
    }

    /// Decide and code one region; returns the tree, distortion and rate
    ///
    /// The chosen candidate's reconstruction is committed to the tile
    /// plane on return; rejected candidates are rolled back.
    fn code_region(&mut self, x: usize, y: usize, w: usize, h: usize) -> (CodingBlock, u64, u32) {
        let snapshot = self.copy_recon(x, y, w, h);
        let mut best: Option<(CodingBlock, u64, u32, f64, Vec<u8>)> = None;

        for kind in self.preset.partition_candidates(self.variant) {
            let result = match kind {
                PartitionKind::None => Some(self.code_leaf(x, y, w, h)),
                split => {
                    let regions = split.child_regions(x, y, w, h);
                    if !regions
                        .iter()
                        .all(|&(_, _, cw, ch)| cw >= MIN_LEAF && ch >= MIN_LEAF && cw % MIN_LEAF == 0 && ch % MIN_LEAF == 0)
                    {
                        None
                    } else {
                        let mut children = Vec::with_capacity(regions.len());
                        let mut dist = 0u64;
                        let mut rate = 3u32; // partition signaling
                        for (cx, cy, cw, ch) in regions {
                            let (child, d, r) = self.code_region(cx, cy, cw, ch);
                            children.push(child);
                            dist += d;
                            rate += r;
                        }
                        let mut node = CodingBlock::leaf(x, y, w, h);
                        node.partition = split;
                        node.children = children;
                        Some((node, dist, rate))
                    }
                }
            };

            let Some((block, dist, rate)) = result else {
                continue;
            };
            let cost = dist as f64 + self.lambda * f64::from(rate);
            let better = best.as_ref().map_or(true, |(_, _, _, c, _)| cost < *c);
            if better {
                let committed = self.copy_recon(x, y, w, h);
                best = Some((block, dist, rate, cost, committed));
            }
            self.restore_recon(x, y, w, h, &snapshot);
        }

        let (block, dist, rate, _, committed) =
            best.expect("partition candidates always include a leaf");
        self.restore_recon(x, y, w, h, &committed);
        (block, dist, rate)
    }

    /// Code one leaf: pick the cheapest prediction, transform and commit
    fn code_leaf(&mut self, x: usize, y: usize, w: usize, h: usize) -> (CodingBlock, u64, u32) {
        let lx = x - self.x0;
        let mut candidates: Vec<(Prediction, Option<MotionVector>, Vec<u8>)> = Vec::new();

        for mode in IntraMode::ALL {
            let mut pred = vec![0u8; w * h];
            predict_intra(mode, &self.recon, lx, y, w, h, &mut pred);
            candidates.push((Prediction::Intra(mode), None, pred));
        }

        if !self.intra_only && w >= MV_BLOCK && h >= MV_BLOCK {
            if let Some(reference) = self.reference {
                let mv = motion::estimate(
                    self.preset.motion_strategy(),
                    self.source,
                    reference,
                    x,
                    y,
                    self.prev_mv,
                );
                if let Some(pred) = compensate(reference, x, y, w, h, mv) {
                    let mode = if self.prev_mv == Some(mv) {
                        InterMode::Merge
                    } else {
                        InterMode::Amvp
                    };
                    candidates.push((Prediction::Inter(mode), Some(mv), pred));
                }
            }
        }

        let mut best: Option<(CodingBlock, u64, u32, f64, Vec<u8>)> = None;
        for (prediction, mv, pred) in candidates {
            let (coeffs, recon_buf) = self.code_residual(x, y, w, h, &pred);
            let dist = self.leaf_distortion(x, y, w, h, &recon_buf);
            let rate = prediction_rate(prediction, mv)
                + coeffs.iter().map(|b| coefficient_rate(b)).sum::<u32>();
            let cost = dist as f64 + self.lambda * f64::from(rate);

            if best.as_ref().map_or(true, |(_, _, _, c, _)| cost < *c) {
                let mut leaf = CodingBlock::leaf(x, y, w, h);
                leaf.prediction = Some(prediction);
                leaf.motion = mv;
                leaf.coefficients = coeffs;
                best = Some((leaf, dist, rate, cost, recon_buf));
            }
        }

        let (leaf, dist, rate, _, recon_buf) = best.expect("intra candidates are never empty");
        if let Some(mv) = leaf.motion {
            self.prev_mv = Some(mv);
        }
        for row in 0..h {
            for col in 0..w {
                *self.recon.pixel_mut(lx + col, y + row) = recon_buf[row * w + col];
            }
        }
        trace!(x, y, w, h, dist, rate, "leaf coded");
        (leaf, dist, rate)
    }

    /// Distortion between the source region and a candidate reconstruction
    ///
    /// Thorough presets pay for SATD (Hadamard-transformed differences,
    /// sharper around edges); fast presets use plain SAD.
    fn leaf_distortion(&self, x: usize, y: usize, w: usize, h: usize, recon_buf: &[u8]) -> u64 {
        if self.preset.uses_satd() {
            let mut total = 0i64;
            for by in (0..h).step_by(4) {
                for bx in (0..w).step_by(4) {
                    let mut diff = [[0i32; 4]; 4];
                    for i in 0..4.min(h - by) {
                        for j in 0..4.min(w - bx) {
                            let src = i32::from(self.source.pixel(x + bx + j, y + by + i));
                            let rec = i32::from(recon_buf[(by + i) * w + bx + j]);
                            diff[i][j] = src - rec;
                        }
                    }
                    for row in diff.iter_mut() {
                        let a = row[0] + row[2];
                        let b = row[1] + row[3];
                        let c = row[0] - row[2];
                        let d = row[1] - row[3];
                        *row = [a + b, c + d, a - b, c - d];
                    }
                    for j in 0..4 {
                        let a = diff[0][j] + diff[2][j];
                        let b = diff[1][j] + diff[3][j];
                        let c = diff[0][j] - diff[2][j];
                        let d = diff[1][j] - diff[3][j];
                        total += i64::from((a + b).abs())
                            + i64::from((c + d).abs())
                            + i64::from((a - b).abs())
                            + i64::from((c - d).abs());
                    }
                }
            }
            (total / 2) as u64
        } else {
            let mut dist = 0u64;
            for row in 0..h {
                let src = &self.source.row(y + row)[x..x + w];
                let rec = &recon_buf[row * w..row * w + w];
                for (a, b) in src.iter().zip(rec.iter()) {
                    dist += u64::from(a.abs_diff(*b));
                }
            }
            dist
        }
    }

    /// Transform, quantize and reconstruct the residual against `pred`
    fn code_residual(
        &self,
        x: usize,
        y: usize,
        w: usize,
        h: usize,
        pred: &[u8],
    ) -> (Vec<[i16; BLOCK_LEN]>, Vec<u8>) {
        let mut coeffs = Vec::with_capacity((w / BLOCK_DIM) * (h / BLOCK_DIM));
        let mut recon_buf = vec![0u8; w * h];

        for sy in (0..h).step_by(BLOCK_DIM) {
            for sx in (0..w).step_by(BLOCK_DIM) {
                let mut residual = [0i16; BLOCK_LEN];
                for row in 0..BLOCK_DIM {
                    for col in 0..BLOCK_DIM {
                        let src = i16::from(self.source.pixel(x + sx + col, y + sy + row));
                        let prd = i16::from(pred[(sy + row) * w + sx + col]);
                        residual[row * BLOCK_DIM + col] = src - prd;
                    }
                }

                let mut freq = [0.0f64; BLOCK_LEN];
                self.dct.forward(&residual, &mut freq);
                let levels = quantize(&freq, self.variant, self.qp);

                let restored = dequantize(&levels, self.variant, self.qp);
                let mut rec_res = [0i16; BLOCK_LEN];
                self.dct.inverse(&restored, &mut rec_res);

                for row in 0..BLOCK_DIM {
                    for col in 0..BLOCK_DIM {
                        let prd = i16::from(pred[(sy + row) * w + sx + col]);
                        let px = (prd + rec_res[row * BLOCK_DIM + col]).clamp(0, 255) as u8;
                        recon_buf[(sy + row) * w + sx + col] = px;
                    }
                }
                coeffs.push(levels);
            }
        }
        (coeffs, recon_buf)
    }

    /// Serialize a decided tree into the tile bitstream
    fn write_tree(&mut self, block: &CodingBlock) {
        match &mut self.sink {
            EntropySink::RunLength(writer) => {
                writer.write_ue(block.partition.symbol());
                if block.partition == PartitionKind::None {
                    match block.prediction.expect("decided leaf carries a prediction") {
                        Prediction::Intra(mode) => {
                            writer.write_bit(false);
                            writer.write_ue(mode.symbol());
                        }
                        Prediction::Inter(mode) => {
                            writer.write_bit(true);
                            writer.write_ue(inter_symbol(mode));
                            let mv = block.motion.unwrap_or(MotionVector { dx: 0, dy: 0, cost: 0 });
                            writer.write_se(i32::from(mv.dx));
                            writer.write_se(i32::from(mv.dy));
                        }
                    }
                    for levels in &block.coefficients {
                        crate::codec::entropy::encode_block(writer, levels);
                    }
                    return;
                }
            }
            EntropySink::Arithmetic { enc, ctxs } => {
                let split = block.partition != PartitionKind::None;
                enc.encode_bin(&mut ctxs.split, split);
                if split {
                    enc.encode_bypass_bits(block.partition.symbol() - 1, 3);
                } else {
                    match block.prediction.expect("decided leaf carries a prediction") {
                        Prediction::Intra(mode) => {
                            enc.encode_bin(&mut ctxs.inter, false);
                            enc.encode_bypass_bits(mode.symbol(), 3);
                        }
                        Prediction::Inter(mode) => {
                            enc.encode_bin(&mut ctxs.inter, true);
                            enc.encode_bypass_bits(inter_symbol(mode), 2);
                            let mv = block.motion.unwrap_or(MotionVector { dx: 0, dy: 0, cost: 0 });
                            encode_se_bypass(enc, i32::from(mv.dx));
                            encode_se_bypass(enc, i32::from(mv.dy));
                        }
                    }
                    for levels in &block.coefficients {
                        encode_block_arithmetic(enc, ctxs, levels);
                    }
                    return;
                }
            }
        }
        for child in &block.children {
            self.write_tree(child);
        }
    }

    fn copy_recon(&self, x: usize, y: usize, w: usize, h: usize) -> Vec<u8> {
        let lx = x - self.x0;
        let mut out = Vec::with_capacity(w * h);
        for row in 0..h {
            out.extend_from_slice(&self.recon.row(y + row)[lx..lx + w]);
        }
        out
    }

    fn restore_recon(&mut self, x: usize, y: usize, w: usize, h: usize, saved: &[u8]) {
        let lx = x - self.x0;
        for row in 0..h {
            for col in 0..w {
                *self.recon.pixel_mut(lx + col, y + row) = saved[row * w + col];
            }
        }
    }
}

/// Motion-compensated prediction for a whole leaf, if in bounds
fn compensate(
    reference: &Plane,
    x: usize,
    y: usize,
    w: usize,
    h: usize,
    mv: MotionVector,
) -> Option<Vec<u8>> {
    let rx = x as i64 + i64::from(mv.dx);
    let ry = y as i64 + i64::from(mv.dy);
    if rx < 0
        || ry < 0
        || rx + w as i64 > reference.width() as i64
        || ry + h as i64 > reference.height() as i64
    {
        return None;
    }
    let (rx, ry) = (rx as usize, ry as usize);
    let mut pred = Vec::with_capacity(w * h);
    for row in 0..h {
        pred.extend_from_slice(&reference.row(ry + row)[rx..rx + w]);
    }
    Some(pred)
}

fn inter_symbol(mode: InterMode) -> u32 {
    match mode {
        InterMode::Merge => 0,
        InterMode::Amvp => 1,
        InterMode::Affine => 2,
        InterMode::IntraBlockCopy => 3,
    }
}

/// Estimated signaling bits for a leaf's prediction decision
fn prediction_rate(prediction: Prediction, mv: Option<MotionVector>) -> u32 {
    match prediction {
        Prediction::Intra(_) => 4,
        Prediction::Inter(InterMode::Merge) => 3,
        Prediction::Inter(_) => {
            let mv = mv.unwrap_or(MotionVector { dx: 0, dy: 0, cost: 0 });
            3 + se_bits(i32::from(mv.dx)) + se_bits(i32::from(mv.dy))
        }
    }
}

/// Estimated bits to code one 8×8 coefficient block
fn coefficient_rate(levels: &[i16; BLOCK_LEN]) -> u32 {
    let mut bits = 4; // count / coded-block overhead
    for &level in levels {
        if level != 0 {
            let magnitude = u32::from(level.unsigned_abs());
            bits += 2 + 2 * (32 - magnitude.leading_zeros());
        }
    }
    bits
}

fn se_bits(v: i32) -> u32 {
    let mapped = if v <= 0 { (-(v as i64) * 2) as u32 } else { (v as u32) * 2 - 1 };
    2 * (32 - (mapped + 1).leading_zeros()) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(width: usize, height: usize, value: u8, frame_id: u64) -> RawFrame {
        RawFrame::luma_only(
            width,
            height,
            Bytes::from(vec![value; width * height]),
            frame_id * 33_333,
            frame_id,
        )
    }

    fn gradient_frame(width: usize, height: usize, frame_id: u64, shift: usize) -> RawFrame {
        let mut luma = vec![0u8; width * height];
        for y in 0..height {
            for x in 0..width {
                let v = ((x + shift) as f64 * 0.13).sin() * 60.0
                    + (y as f64 * 0.11).cos() * 50.0
                    + 128.0;
                luma[y * width + x] = v as u8;
            }
        }
        RawFrame::luma_only(width, height, Bytes::from(luma), frame_id * 33_333, frame_id)
    }

    #[test]
    fn test_first_frame_is_key() {
        let mut enc = FrameEncoder::new(CodecVariant::Narrow, ComplexityPreset::new(5), 30, 64, 64);
        let frame = gray_frame(64, 64, 128, 0);
        let encoded = enc.encode(&frame, 32).unwrap();
        assert_eq!(encoded.class, FrameClass::Key);
        assert!(encoded.is_recovery_point);
        assert!(!encoded.data.is_empty());
    }

    #[test]
    fn test_gop_cadence() {
        let mut enc = FrameEncoder::new(CodecVariant::Narrow, ComplexityPreset::new(6), 4, 32, 32);
        let mut classes = Vec::new();
        for i in 0..9 {
            let frame = gray_frame(32, 32, 100 + i as u8, i);
            classes.push(enc.encode(&frame, 30).unwrap().class);
        }
        assert_eq!(
            classes,
            vec![
                FrameClass::Key,
                FrameClass::Predicted,
                FrameClass::Predicted,
                FrameClass::Predicted,
                FrameClass::Key,
                FrameClass::Predicted,
                FrameClass::Predicted,
                FrameClass::Predicted,
                FrameClass::Key,
            ]
        );
    }

    #[test]
    fn test_predicted_frames_are_smaller_for_static_content() {
        let mut enc = FrameEncoder::new(CodecVariant::Narrow, ComplexityPreset::new(4), 30, 64, 64);
        let key = enc.encode(&gradient_frame(64, 64, 0, 0), 12).unwrap();
        let predicted = enc.encode(&gradient_frame(64, 64, 1, 0), 12).unwrap();
        assert_eq!(predicted.class, FrameClass::Predicted);
        assert!(
            predicted.data.len() < key.data.len(),
            "static predicted frame ({}) should undercut key frame ({})",
            predicted.data.len(),
            key.data.len()
        );
    }

    #[test]
    fn test_all_variants_encode() {
        for variant in [
            CodecVariant::Narrow,
            CodecVariant::HevcLike,
            CodecVariant::Av1Like,
            CodecVariant::VvcLike,
        ] {
            let mut enc = FrameEncoder::new(variant, ComplexityPreset::new(6), 30, 64, 64);
            let encoded = enc.encode(&gradient_frame(64, 64, 0, 0), 32).unwrap();
            assert!(!encoded.data.is_empty(), "{variant:?} produced no bytes");
            let encoded = enc.encode(&gradient_frame(64, 64, 1, 2), 32).unwrap();
            assert_eq!(encoded.class, FrameClass::Predicted, "{variant:?}");
        }
    }

    #[test]
    fn test_deterministic_bitstream() {
        let encode_twice = || {
            let mut enc =
                FrameEncoder::new(CodecVariant::HevcLike, ComplexityPreset::new(5), 30, 48, 48);
            let a = enc.encode(&gradient_frame(48, 48, 0, 0), 28).unwrap();
            let b = enc.encode(&gradient_frame(48, 48, 1, 3), 28).unwrap();
            (a.data, b.data)
        };
        assert_eq!(encode_twice(), encode_twice());
    }

    #[test]
    fn test_geometry_change_rejected() {
        let mut enc = FrameEncoder::new(CodecVariant::Narrow, ComplexityPreset::new(5), 30, 64, 64);
        let err = enc.encode(&gray_frame(32, 32, 0, 0), 30).unwrap_err();
        assert!(matches!(err, CodecError::GeometryChanged { .. }));
    }

    #[test]
    fn test_malformed_frame_rejected() {
        let mut enc = FrameEncoder::new(CodecVariant::Narrow, ComplexityPreset::new(5), 30, 64, 64);
        let frame = RawFrame::luma_only(64, 64, Bytes::from(vec![0u8; 10]), 0, 0);
        assert!(matches!(enc.encode(&frame, 30), Err(CodecError::MalformedFrame)));
    }

    #[test]
    fn test_non_block_aligned_dimensions() {
        let mut enc = FrameEncoder::new(CodecVariant::Narrow, ComplexityPreset::new(6), 30, 50, 30);
        let frame = gray_frame(50, 30, 77, 0);
        let encoded = enc.encode(&frame, 35).unwrap();
        assert_eq!(encoded.class, FrameClass::Key);
    }

    #[test]
    fn test_parallel_tiles_match_geometry() {
        // Preset 8 fans out tile columns; the encode must still succeed on
        // a frame wider than one superblock
        let mut enc =
            FrameEncoder::new(CodecVariant::Narrow, ComplexityPreset::new(8), 30, 128, 32);
        let encoded = enc.encode(&gradient_frame(128, 32, 0, 0), 30).unwrap();
        assert!(!encoded.data.is_empty());
    }

    #[test]
    fn test_higher_qp_compresses_harder() {
        let frame = gradient_frame(64, 64, 0, 0);
        let encode_at = |qp: u8| {
            let mut enc =
                FrameEncoder::new(CodecVariant::Narrow, ComplexityPreset::new(5), 30, 64, 64);
            enc.encode(&frame, qp).unwrap().data.len()
        };
        assert!(encode_at(45) <= encode_at(10));
    }

    #[test]
    fn test_key_frame_resets_reference() {
        let mut enc = FrameEncoder::new(CodecVariant::Narrow, ComplexityPreset::new(6), 2, 32, 32);
        enc.encode(&gray_frame(32, 32, 10, 0), 30).unwrap();
        enc.encode(&gray_frame(32, 32, 20, 1), 30).unwrap();
        // GOP of 2: third frame keys again
        let third = enc.encode(&gray_frame(32, 32, 30, 2), 30).unwrap();
        assert_eq!(third.class, FrameClass::Key);
        assert_eq!(enc.frames_since_key, 1);
    }

    #[test]
    fn test_request_key_frame() {
        let mut enc = FrameEncoder::new(CodecVariant::Narrow, ComplexityPreset::new(6), 100, 32, 32);
        enc.encode(&gray_frame(32, 32, 10, 0), 30).unwrap();
        assert!(!enc.next_is_key());
        enc.request_key_frame();
        assert!(enc.next_is_key());
    }
}
