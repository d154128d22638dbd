//! Coding block tree and prediction modes
//!
//! A frame is covered by superblocks that split recursively into a
//! partition tree. Each node owns its children exclusively; leaves carry a
//! prediction decision, the quantized coefficients of their 8×8 transform
//! sub-blocks, and (for inter leaves) a motion vector.

use crate::codec::frame::Plane;
use crate::codec::motion::MotionVector;
use crate::codec::transform::BLOCK_LEN;

/// How a region splits into children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// Leaf: coded as a single prediction unit
    None,
    /// Two halves stacked vertically
    HorizontalSplit,
    /// Two halves side by side
    VerticalSplit,
    /// Four quadrants
    QuadSplit,
    /// Three horizontal stripes, 1:2:1
    TernaryHorizontal,
    /// Three vertical stripes, 1:2:1
    TernaryVertical,
}

impl PartitionKind {
    /// Child regions `(x, y, width, height)` of a `w × h` region at `(x, y)`
    ///
    /// [`PartitionKind::None`] yields no children. Regions too small to
    /// split the requested way yield no children either; the partition
    /// decision never proposes those.
    pub fn child_regions(self, x: usize, y: usize, w: usize, h: usize) -> Vec<(usize, usize, usize, usize)> {
        match self {
            PartitionKind::None => Vec::new(),
            PartitionKind::HorizontalSplit => {
                vec![(x, y, w, h / 2), (x, y + h / 2, w, h - h / 2)]
            }
            PartitionKind::VerticalSplit => {
                vec![(x, y, w / 2, h), (x + w / 2, y, w - w / 2, h)]
            }
            PartitionKind::QuadSplit => vec![
                (x, y, w / 2, h / 2),
                (x + w / 2, y, w - w / 2, h / 2),
                (x, y + h / 2, w / 2, h - h / 2),
                (x + w / 2, y + h / 2, w - w / 2, h - h / 2),
            ],
            PartitionKind::TernaryHorizontal => {
                let q = h / 4;
                vec![(x, y, w, q), (x, y + q, w, h / 2), (x, y + q + h / 2, w, h - q - h / 2)]
            }
            PartitionKind::TernaryVertical => {
                let q = w / 4;
                vec![(x, y, q, h), (x + q, y, w / 2, h), (x + q + w / 2, y, w - q - w / 2, h)]
            }
        }
    }

    /// Symbol index used when signaling the partition in the bitstream
    pub fn symbol(self) -> u32 {
        match self {
            PartitionKind::None => 0,
            PartitionKind::HorizontalSplit => 1,
            PartitionKind::VerticalSplit => 2,
            PartitionKind::QuadSplit => 3,
            PartitionKind::TernaryHorizontal => 4,
            PartitionKind::TernaryVertical => 5,
        }
    }
}

/// Intra prediction modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntraMode {
    /// Mean of the available neighbors
    Dc,
    /// Copy the row above
    Vertical,
    /// Copy the column to the left
    Horizontal,
    /// 45° down-right diagonal from the top neighbors
    DiagonalDown,
    /// Distance-weighted blend of top and left
    Smooth,
    /// Paeth predictor per sample
    Paeth,
}

impl IntraMode {
    /// Modes evaluated by the encoder, cheapest first
    pub const ALL: [IntraMode; 6] = [
        IntraMode::Dc,
        IntraMode::Vertical,
        IntraMode::Horizontal,
        IntraMode::DiagonalDown,
        IntraMode::Smooth,
        IntraMode::Paeth,
    ];

    /// Symbol index used when signaling the mode
    pub fn symbol(self) -> u32 {
        match self {
            IntraMode::Dc => 0,
            IntraMode::Vertical => 1,
            IntraMode::Horizontal => 2,
            IntraMode::DiagonalDown => 3,
            IntraMode::Smooth => 4,
            IntraMode::Paeth => 5,
        }
    }
}

/// Inter prediction modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterMode {
    /// Inherit the neighboring vector outright
    Merge,
    /// Neighboring predictor plus a coded vector difference
    Amvp,
    /// Affine motion (wide-block tool)
    Affine,
    /// Intra block copy within the current picture (wide-block tool)
    IntraBlockCopy,
}

/// Leaf prediction decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prediction {
    /// Spatial prediction from reconstructed neighbors
    Intra(IntraMode),
    /// Temporal prediction against the reference picture
    Inter(InterMode),
}

/// One node of the partition tree
///
/// Interior nodes own children; leaves own their prediction, motion and
/// quantized coefficients (one 64-entry array per 8×8 transform block,
/// raster order within the leaf).
#[derive(Debug, Clone)]
pub struct CodingBlock {
    /// Left edge in pixels
    pub x: usize,
    /// Top edge in pixels
    pub y: usize,
    /// Region width in pixels
    pub width: usize,
    /// Region height in pixels
    pub height: usize,
    /// How this region splits
    pub partition: PartitionKind,
    /// Children for interior nodes, empty for leaves
    pub children: Vec<CodingBlock>,
    /// Prediction decision at a leaf
    pub prediction: Option<Prediction>,
    /// Motion vector when the leaf codes inter
    pub motion: Option<MotionVector>,
    /// Quantized transform coefficients of the leaf's 8×8 sub-blocks
    pub coefficients: Vec<[i16; BLOCK_LEN]>,
}

impl CodingBlock {
    /// Build an undecided leaf covering a region
    pub fn leaf(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
            partition: PartitionKind::None,
            children: Vec::new(),
            prediction: None,
            motion: None,
            coefficients: Vec::new(),
        }
    }

    /// Depth of the subtree rooted here (a leaf is depth 1)
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(CodingBlock::depth).max().unwrap_or(0)
    }

    /// Count of leaf blocks in the subtree
    pub fn leaf_count(&self) -> usize {
        if self.children.is_empty() {
            1
        } else {
            self.children.iter().map(CodingBlock::leaf_count).sum()
        }
    }
}

/// Compute an intra prediction for a `w × h` leaf at `(x, y)`
///
/// Neighbors come from the reconstruction plane: the row above and the
/// column to the left. Missing neighbors (frame edge) read as mid-gray.
pub fn predict_intra(
    mode: IntraMode,
    recon: &Plane,
    x: usize,
    y: usize,
    w: usize,
    h: usize,
    out: &mut [u8],
) {
    debug_assert!(out.len() >= w * h);

    let top = |i: usize| -> u8 {
        if y > 0 && x + i < recon.width() {
            recon.pixel(x + i, y - 1)
        } else {
            128
        }
    };
    let left = |i: usize| -> u8 {
        if x > 0 && y + i < recon.height() {
            recon.pixel(x - 1, y + i)
        } else {
            128
        }
    };
    let corner = if x > 0 && y > 0 { recon.pixel(x - 1, y - 1) } else { 128 };

    match mode {
        IntraMode::Dc => {
            let mut sum = 0u32;
            for i in 0..w {
                sum += u32::from(top(i));
            }
            for i in 0..h {
                sum += u32::from(left(i));
            }
            let dc = (sum / (w + h) as u32) as u8;
            out[..w * h].fill(dc);
        }
        IntraMode::Vertical => {
            for row in 0..h {
                for col in 0..w {
                    out[row * w + col] = top(col);
                }
            }
        }
        IntraMode::Horizontal => {
            for row in 0..h {
                let v = left(row);
                out[row * w..row * w + w].fill(v);
            }
        }
        IntraMode::DiagonalDown => {
            for row in 0..h {
                for col in 0..w {
                    out[row * w + col] = top(col + row + 1);
                }
            }
        }
        IntraMode::Smooth => {
            for row in 0..h {
                for col in 0..w {
                    // Weight toward the nearer edge
                    let wt = (h - row) as u32;
                    let wl = (w - col) as u32;
                    let v = (u32::from(top(col)) * wt + u32::from(left(row)) * wl + (wt + wl) / 2)
                        / (wt + wl);
                    out[row * w + col] = v as u8;
                }
            }
        }
        IntraMode::Paeth => {
            for row in 0..h {
                for col in 0..w {
                    let t = i32::from(top(col));
                    let l = i32::from(left(row));
                    let c = i32::from(corner);
                    let base = t + l - c;
                    let (dt, dl, dc) = ((base - t).abs(), (base - l).abs(), (base - c).abs());
                    let v = if dt <= dl && dt <= dc {
                        t
                    } else if dl <= dc {
                        l
                    } else {
                        c
                    };
                    out[row * w + col] = v as u8;
                }
            }
        }
    }
}
