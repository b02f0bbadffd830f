//! Layer Shape Model
//!
//! One `Layer` per operator occurrence in the input IR. Besides the raw
//! tensor extents, each layer carries the clipping decided for the active
//! transformation mode: the accelerator only implements a slice of the
//! tensor (limited channel parallelism), and `tile_multiplier` counts how
//! many sequential invocations of that slice cover the full operator.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::largest_divisor_at_most;

/// Operator families the explorer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    Conv2d,
    DepthwiseConv2d,
    Matmul,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 3] = [
        OperatorKind::Conv2d,
        OperatorKind::DepthwiseConv2d,
        OperatorKind::Matmul,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorKind::Conv2d => "conv2d",
            OperatorKind::DepthwiseConv2d => "depthwise_conv2d",
            OperatorKind::Matmul => "matmul",
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loop transformation explored in one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TransformMode {
    Permute,
    Tile,
    Unroll,
}

impl TransformMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformMode::Permute => "permute",
            TransformMode::Tile => "tile",
            TransformMode::Unroll => "unroll",
        }
    }
}

impl fmt::Display for TransformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch / width / height / channel extents of a 4-D activation tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nhwc {
    pub batch: usize,
    pub width: usize,
    pub height: usize,
    pub channel: usize,
}

impl Nhwc {
    pub fn new(batch: usize, width: usize, height: usize, channel: usize) -> Self {
        Nhwc { batch, width, height, channel }
    }
}

/// Batch / width / height extents of a batched matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent3 {
    pub batch: usize,
    pub width: usize,
    pub height: usize,
}

impl Extent3 {
    pub fn new(batch: usize, width: usize, height: usize) -> Self {
        Extent3 { batch, width, height }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2d {
    pub dilation: usize,
    pub stride: usize,
    pub input: Nhwc,
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub kernel_input_channel: usize,
    pub kernel_output_channel: usize,
    pub output: Nhwc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthwiseConv2d {
    pub dilation: usize,
    pub stride: usize,
    pub input: Nhwc,
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub kernel_channel: usize,
    /// Channel multiplier (`hwcm` form only)
    pub kernel_multiplier: Option<usize>,
    pub output: Nhwc,
    pub output_multiplier: Option<usize>,
}

/// Batched matmul: `output[b, w, h] += input[b, w, k] * kernel[b, k, h]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matmul {
    pub input: Extent3,
    pub kernel: Extent3,
    pub output: Extent3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerShape {
    Conv2d(Conv2d),
    DepthwiseConv2d(DepthwiseConv2d),
    Matmul(Matmul),
}

impl LayerShape {
    pub fn kind(&self) -> OperatorKind {
        match self {
            LayerShape::Conv2d(_) => OperatorKind::Conv2d,
            LayerShape::DepthwiseConv2d(_) => OperatorKind::DepthwiseConv2d,
            LayerShape::Matmul(_) => OperatorKind::Matmul,
        }
    }

    /// Multiply-accumulate work of the full, unclipped operator (2 FLOPs per MAC)
    pub fn flop_count(&self) -> u64 {
        let product = |dims: &[usize]| dims.iter().map(|&d| d as u64).product::<u64>() * 2;
        match self {
            LayerShape::Conv2d(c) => product(&[
                c.output.batch, c.output.width, c.output.height, c.output.channel,
                c.kernel_width, c.kernel_height, c.input.channel,
            ]),
            LayerShape::DepthwiseConv2d(d) => product(&[
                d.output.batch, d.output.width, d.output.height,
                d.kernel_width, d.kernel_height, d.input.channel,
            ]),
            LayerShape::Matmul(m) => product(&[
                m.output.batch, m.output.width, m.output.height, m.kernel.width,
            ]),
        }
    }
}

/// Per-dimension clipped extents; `None` means the actual extent is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clipping {
    /// Conv2d output channel, or the depthwise channel multiplier
    pub output_channel: Option<usize>,
    pub input_channel: Option<usize>,
    /// Matmul: also clips the input width
    pub output_width: Option<usize>,
    /// Matmul: also clips the kernel height
    pub output_height: Option<usize>,
    /// Matmul contraction dimension: also clips the input height
    pub kernel_width: Option<usize>,
}

/// Accumulates the tile multiplier while clipping dimensions
struct Clipper {
    tiles: u64,
}

impl Clipper {
    fn clip(&mut self, actual: usize, cap: usize) -> Option<usize> {
        if actual <= cap {
            return None;
        }
        let clipped = largest_divisor_at_most(actual, cap);
        self.tiles *= (actual / clipped) as u64;
        Some(clipped)
    }
}

/// Input-channel cap for convolutions.
///
/// Permute/tile key the ladder on input height; unroll keys it on kernel
/// height, except for large inputs which are always cut to one channel.
fn channel_cap(mode: TransformMode, input_height: usize, kernel_height: usize) -> Option<usize> {
    match mode {
        TransformMode::Permute | TransformMode::Tile => Some(match input_height {
            0..=16 => 128,
            17..=32 => 32,
            33..=64 => 8,
            _ => 1,
        }),
        TransformMode::Unroll if input_height > 64 => Some(1),
        TransformMode::Unroll => match kernel_height {
            0..=3 => Some(32),
            4..=5 => Some(8),
            6..=7 => Some(4),
            8..=11 => Some(1),
            _ => None,
        },
    }
}

fn matmul_cap(mode: TransformMode) -> usize {
    match mode {
        TransformMode::Permute | TransformMode::Tile => 128,
        TransformMode::Unroll => 32,
    }
}

/// Decide clipped extents and the resulting tile multiplier.
///
/// Pure and deterministic: the same shape and mode always give the same answer.
pub fn derive_clipping(shape: &LayerShape, mode: TransformMode) -> (Clipping, u64) {
    let mut clipper = Clipper { tiles: 1 };
    let mut clipping = Clipping::default();

    match shape {
        LayerShape::Conv2d(c) => {
            clipping.output_channel = clipper.clip(c.output.channel, 1);
            if let Some(cap) = channel_cap(mode, c.input.height, c.kernel_height) {
                clipping.input_channel = clipper.clip(c.input.channel, cap);
            }
        }
        LayerShape::DepthwiseConv2d(d) => {
            clipping.output_channel = clipper.clip(d.kernel_multiplier.unwrap_or(1), 1);
            if let Some(cap) = channel_cap(mode, d.input.height, d.kernel_height) {
                clipping.input_channel = clipper.clip(d.input.channel, cap);
            }
        }
        LayerShape::Matmul(m) => {
            let cap = matmul_cap(mode);
            clipping.output_width = clipper.clip(m.output.width, cap);
            clipping.output_height = clipper.clip(m.output.height, cap);
            if m.kernel.width == m.input.height {
                clipping.kernel_width = clipper.clip(m.kernel.width, cap);
            }
        }
    }

    (clipping, clipper.tiles)
}

/// One operator instance under exploration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    /// `<kind>_<ordinal>`
    pub name: String,
    pub shape: LayerShape,
    pub mode: TransformMode,
    pub clipping: Clipping,
    pub flop_count: u64,
    pub tile_multiplier: u64,
    /// Kernel artifact, set once it has been written
    pub file_path: Option<PathBuf>,
}

impl Layer {
    pub fn new(name: impl Into<String>, shape: LayerShape, mode: TransformMode) -> Self {
        let (clipping, tile_multiplier) = derive_clipping(&shape, mode);
        Layer {
            name: name.into(),
            flop_count: shape.flop_count(),
            shape,
            mode,
            clipping,
            tile_multiplier,
            file_path: None,
        }
    }

    pub fn kind(&self) -> OperatorKind {
        self.shape.kind()
    }

    /// Ordinal suffix of the layer name (`conv2d_3` → 3)
    pub fn ordinal(&self) -> Option<usize> {
        self.name.rsplit('_').next()?.parse().ok()
    }

    /// The slice of the operator one accelerator instance implements
    pub fn implemented_shape(&self) -> LayerShape {
        let clip = &self.clipping;
        match &self.shape {
            LayerShape::Conv2d(c) => {
                let in_c = clip.input_channel.unwrap_or(c.input.channel);
                let out_c = clip.output_channel.unwrap_or(c.output.channel);
                LayerShape::Conv2d(Conv2d {
                    input: Nhwc { channel: in_c, ..c.input },
                    kernel_input_channel: in_c,
                    kernel_output_channel: out_c,
                    output: Nhwc { channel: out_c, ..c.output },
                    ..c.clone()
                })
            }
            LayerShape::DepthwiseConv2d(d) => {
                let in_c = clip.input_channel.unwrap_or(d.input.channel);
                LayerShape::DepthwiseConv2d(DepthwiseConv2d {
                    input: Nhwc { channel: in_c, ..d.input },
                    kernel_channel: in_c,
                    kernel_multiplier: None,
                    output: Nhwc { channel: in_c, ..d.output },
                    output_multiplier: None,
                    ..d.clone()
                })
            }
            LayerShape::Matmul(m) => {
                // each operand keeps its own extent unless that dimension was clipped
                LayerShape::Matmul(Matmul {
                    input: Extent3 {
                        width: clip.output_width.unwrap_or(m.input.width),
                        height: clip.kernel_width.unwrap_or(m.input.height),
                        ..m.input
                    },
                    kernel: Extent3 {
                        width: clip.kernel_width.unwrap_or(m.kernel.width),
                        height: clip.output_height.unwrap_or(m.kernel.height),
                        ..m.kernel
                    },
                    output: Extent3 {
                        width: clip.output_width.unwrap_or(m.output.width),
                        height: clip.output_height.unwrap_or(m.output.height),
                        ..m.output
                    },
                })
            }
        }
    }

    /// One-line description used by the CLI and logs
    pub fn summary(&self) -> String {
        let shape = match &self.shape {
            LayerShape::Conv2d(c) => format!(
                "in {}x{}x{}x{} k {}x{}x{}x{} out {}x{}x{}x{} s{} d{}",
                c.input.batch, c.input.width, c.input.height, c.input.channel,
                c.kernel_width, c.kernel_height, c.kernel_input_channel, c.kernel_output_channel,
                c.output.batch, c.output.width, c.output.height, c.output.channel,
                c.stride, c.dilation,
            ),
            LayerShape::DepthwiseConv2d(d) => format!(
                "in {}x{}x{}x{} k {}x{}x{}{} out {}x{}x{}x{} s{} d{}",
                d.input.batch, d.input.width, d.input.height, d.input.channel,
                d.kernel_width, d.kernel_height, d.kernel_channel,
                d.kernel_multiplier.map(|m| format!("x{}", m)).unwrap_or_default(),
                d.output.batch, d.output.width, d.output.height, d.output.channel,
                d.stride, d.dilation,
            ),
            LayerShape::Matmul(m) => format!(
                "in {}x{}x{} k {}x{}x{} out {}x{}x{}",
                m.input.batch, m.input.width, m.input.height,
                m.kernel.batch, m.kernel.width, m.kernel.height,
                m.output.batch, m.output.width, m.output.height,
            ),
        };
        format!("{} [{}] tiles={} flops={}", self.name, shape, self.tile_multiplier, self.flop_count)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn conv(input: Nhwc, kernel: (usize, usize), output: Nhwc) -> LayerShape {
        LayerShape::Conv2d(Conv2d {
            dilation: 1,
            stride: 1,
            input,
            kernel_width: kernel.0,
            kernel_height: kernel.1,
            kernel_input_channel: input.channel,
            kernel_output_channel: output.channel,
            output,
        })
    }

    pub(crate) fn depthwise(input: Nhwc, kernel: usize, multiplier: Option<usize>) -> LayerShape {
        LayerShape::DepthwiseConv2d(DepthwiseConv2d {
            dilation: 1,
            stride: 1,
            input,
            kernel_width: kernel,
            kernel_height: kernel,
            kernel_channel: input.channel,
            kernel_multiplier: multiplier,
            output: input,
            output_multiplier: multiplier,
        })
    }

    pub(crate) fn matmul(m: usize, k: usize, n: usize) -> LayerShape {
        LayerShape::Matmul(Matmul {
            input: Extent3::new(1, m, k),
            kernel: Extent3::new(1, k, n),
            output: Extent3::new(1, m, n),
        })
    }

    fn assert_clip_invariants(layer: &Layer) {
        let pairs: Vec<(usize, Option<usize>)> = match (&layer.shape, &layer.clipping) {
            (LayerShape::Conv2d(c), clip) => vec![
                (c.output.channel, clip.output_channel),
                (c.input.channel, clip.input_channel),
            ],
            (LayerShape::DepthwiseConv2d(d), clip) => vec![
                (d.kernel_multiplier.unwrap_or(1), clip.output_channel),
                (d.input.channel, clip.input_channel),
            ],
            (LayerShape::Matmul(m), clip) => vec![
                (m.output.width, clip.output_width),
                (m.output.height, clip.output_height),
                (m.kernel.width, clip.kernel_width),
            ],
        };
        let mut expected_tiles = 1;
        for (actual, clipped) in pairs {
            if let Some(clipped) = clipped {
                assert!(clipped <= actual);
                assert_eq!(actual % clipped, 0);
                expected_tiles *= (actual / clipped) as u64;
            }
        }
        assert_eq!(layer.tile_multiplier, expected_tiles);
    }

    #[test]
    fn test_conv_tile_clipping() {
        let shape = conv(Nhwc::new(1, 56, 56, 256), (3, 3), Nhwc::new(1, 56, 56, 1));
        let layer = Layer::new("conv2d_1", shape, TransformMode::Tile);

        assert_eq!(layer.clipping.output_channel, None);
        assert_eq!(layer.clipping.input_channel, Some(8));
        assert_eq!(layer.tile_multiplier, 32);
        assert_clip_invariants(&layer);
    }

    #[test]
    fn test_conv_output_channel_forced_clip() {
        let shape = conv(Nhwc::new(1, 14, 14, 512), (3, 3), Nhwc::new(1, 14, 14, 64));
        let layer = Layer::new("conv2d_2", shape, TransformMode::Permute);

        assert_eq!(layer.clipping.output_channel, Some(1));
        assert_eq!(layer.clipping.input_channel, Some(128));
        assert_eq!(layer.tile_multiplier, 64 * 4);
        assert_clip_invariants(&layer);
    }

    #[test]
    fn test_conv_height_bands() {
        let cases = [(16, 512, 128), (17, 96, 32), (32, 96, 32), (33, 96, 8), (64, 12, 6), (65, 3, 1)];
        for (height, channels, expected) in cases {
            let shape = conv(Nhwc::new(1, height, height, channels), (3, 3), Nhwc::new(1, height, height, 1));
            let layer = Layer::new("conv2d_1", shape, TransformMode::Tile);
            assert_eq!(layer.clipping.input_channel, Some(expected), "height {}", height);
            assert_clip_invariants(&layer);
        }
    }

    #[test]
    fn test_conv_unroll_kernel_bands() {
        let cases = [(3, Some(32)), (5, Some(8)), (7, Some(4)), (11, Some(1)), (13, None)];
        for (k, expected) in cases {
            let shape = conv(Nhwc::new(1, 28, 28, 96), (k, k), Nhwc::new(1, 28, 28, 1));
            let layer = Layer::new("conv2d_1", shape, TransformMode::Unroll);
            assert_eq!(layer.clipping.input_channel, expected, "kernel {}", k);
            assert_clip_invariants(&layer);
        }

        let large = conv(Nhwc::new(1, 112, 112, 32), (3, 3), Nhwc::new(1, 112, 112, 1));
        let layer = Layer::new("conv2d_1", large, TransformMode::Unroll);
        assert_eq!(layer.clipping.input_channel, Some(1));
        assert_eq!(layer.tile_multiplier, 32);
    }

    #[test]
    fn test_no_clipping_means_single_tile() {
        let shape = conv(Nhwc::new(1, 8, 8, 16), (3, 3), Nhwc::new(1, 8, 8, 1));
        let layer = Layer::new("conv2d_1", shape, TransformMode::Tile);
        assert_eq!(layer.clipping, Clipping::default());
        assert_eq!(layer.tile_multiplier, 1);
    }

    #[test]
    fn test_depthwise_multiplier_is_output_clip() {
        let shape = depthwise(Nhwc::new(1, 28, 28, 96), 3, Some(2));
        let layer = Layer::new("depthwise_conv2d_1", shape, TransformMode::Tile);

        assert_eq!(layer.clipping.output_channel, Some(1));
        assert_eq!(layer.clipping.input_channel, Some(32));
        assert_eq!(layer.tile_multiplier, 2 * 3);
        assert_clip_invariants(&layer);
    }

    #[test]
    fn test_matmul_clipping() {
        let layer = Layer::new("matmul_1", matmul(256, 768, 3072), TransformMode::Tile);
        assert_eq!(layer.clipping.output_width, Some(128));
        assert_eq!(layer.clipping.output_height, Some(128));
        assert_eq!(layer.clipping.kernel_width, Some(128));
        assert_eq!(layer.tile_multiplier, 2 * 24 * 6);
        assert_clip_invariants(&layer);

        let unrolled = Layer::new("matmul_1", matmul(256, 768, 3072), TransformMode::Unroll);
        assert_eq!(unrolled.clipping.output_width, Some(32));
        assert_clip_invariants(&unrolled);
    }

    #[test]
    fn test_flop_count_unaffected_by_mode() {
        let shape = conv(Nhwc::new(1, 56, 56, 256), (3, 3), Nhwc::new(1, 56, 56, 64));
        let flops: Vec<u64> = [TransformMode::Permute, TransformMode::Tile, TransformMode::Unroll]
            .into_iter()
            .map(|mode| Layer::new("conv2d_1", shape.clone(), mode).flop_count)
            .collect();
        assert_eq!(flops[0], 56 * 56 * 64 * 3 * 3 * 256 * 2);
        assert!(flops.iter().all(|&f| f == flops[0]));
    }

    #[test]
    fn test_clipping_is_deterministic() {
        let shape = matmul(512, 1024, 1000);
        let a = derive_clipping(&shape, TransformMode::Permute);
        let b = derive_clipping(&shape, TransformMode::Permute);
        assert_eq!(a, b);
    }

    #[test]
    fn test_implemented_shape() {
        let shape = conv(Nhwc::new(1, 56, 56, 256), (3, 3), Nhwc::new(1, 56, 56, 64));
        let layer = Layer::new("conv2d_4", shape, TransformMode::Tile);
        match layer.implemented_shape() {
            LayerShape::Conv2d(c) => {
                assert_eq!(c.input.channel, 8);
                assert_eq!(c.kernel_input_channel, 8);
                assert_eq!(c.kernel_output_channel, 1);
                assert_eq!(c.output.channel, 1);
                assert_eq!(c.output.width, 56);
            }
            other => panic!("unexpected shape {:?}", other),
        }
        assert_eq!(layer.ordinal(), Some(4));

        let mm = Layer::new("matmul_1", matmul(256, 768, 64), TransformMode::Tile);
        match mm.implemented_shape() {
            LayerShape::Matmul(m) => {
                assert_eq!((m.input.width, m.input.height), (128, 128));
                assert_eq!((m.kernel.width, m.kernel.height), (128, 64));
                assert_eq!((m.output.width, m.output.height), (128, 64));
            }
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_matmul_implemented_shape_keeps_unclipped_operands() {
        // contraction extents disagree, so kernel width is never clipped
        let shape = LayerShape::Matmul(Matmul {
            input: Extent3::new(1, 256, 20),
            kernel: Extent3::new(1, 24, 8),
            output: Extent3::new(1, 256, 8),
        });
        let layer = Layer::new("matmul_2", shape, TransformMode::Tile);
        assert_eq!(layer.clipping.kernel_width, None);
        assert_eq!(layer.clipping.output_width, Some(128));

        match layer.implemented_shape() {
            LayerShape::Matmul(m) => {
                assert_eq!(m.input, Extent3::new(1, 128, 20));
                assert_eq!(m.kernel, Extent3::new(1, 24, 8));
                assert_eq!(m.output, Extent3::new(1, 128, 8));
            }
            other => panic!("unexpected shape {:?}", other),
        }
    }
}
