//! IR Frontend
//!
//! Line-oriented scan of a linalg-on-memref module for the operators the
//! explorer understands. Each recognized call site becomes one `Layer`
//! named `<kind>_<ordinal>`, ordinals counted per kind in file order.

use std::path::Path;

use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::{Captures, Regex};

use crate::error::{DseError, Result};
use crate::layers::{
    Conv2d, DepthwiseConv2d, Extent3, Layer, LayerShape, Matmul, Nhwc, OperatorKind,
    TransformMode,
};

/// Pattern for a convolution-like op with scalar dilation/stride attributes.
/// Groups: dilation, stride, ins names, input type, kernel type, outs name, output type.
macro_rules! conv_pattern {
    ($op:literal) => {
        concat!(
            r"linalg\.", $op,
            r"\s*\{\s*dilations\s*=\s*dense<(\d+)>\s*:\s*tensor<\d+xi64>\s*,",
            r"\s*strides\s*=\s*dense<(\d+)>\s*:\s*tensor<\d+xi64>\s*[^}]*\}",
            r"\s*ins\(\s*([^:]+):\s*memref<([^>]+)>\s*,\s*memref<([^>]+)>\s*\)",
            r"\s*outs\(\s*([^:]+):\s*memref<([^>]+)>\s*\)",
        )
    };
}

lazy_static! {
    static ref CONV2D: Regex = Regex::new(conv_pattern!("conv_2d_nhwc_hwcf")).unwrap();
    static ref DEPTHWISE_MULTIPLIER: Regex =
        Regex::new(conv_pattern!("depthwise_conv_2d_nhwc_hwcm")).unwrap();
    static ref DEPTHWISE: Regex = Regex::new(conv_pattern!("depthwise_conv_2d_nhwc_hwc")).unwrap();
    // Groups: ins names, input type, kernel type, outs name, output type
    static ref BATCH_MATMUL: Regex = Regex::new(concat!(
        r"linalg\.batch_matmul",
        r"\s*ins\(\s*([^:]+):\s*memref<([^>]+)>\s*,\s*memref<([^>]+)>\s*\)",
        r"\s*outs\(\s*([^:]+):\s*memref<([^>]+)>\s*\)",
    ))
    .unwrap();
}

/// Decode `AxBx...xT` into its extents, dropping the trailing element type
pub fn parse_tensor_shape(shape: &str) -> Result<Vec<usize>> {
    let invalid = |reason: &str| DseError::InvalidShape {
        shape: shape.to_string(),
        reason: reason.to_string(),
    };
    let (dims, _element_type) = shape
        .trim()
        .rsplit_once('x')
        .ok_or_else(|| invalid("no element type"))?;
    dims.split('x')
        .map(|d| d.trim().parse::<usize>().map_err(|_| invalid("non-integer extent")))
        .collect()
}

fn expect_rank(shape: &str, dims: &[usize], ranks: &[usize]) -> Result<()> {
    if ranks.contains(&dims.len()) {
        Ok(())
    } else {
        Err(DseError::InvalidShape {
            shape: shape.to_string(),
            reason: format!("expected rank {:?}, found {}", ranks, dims.len()),
        })
    }
}

fn nhwc(dims: &[usize]) -> Nhwc {
    Nhwc::new(dims[0], dims[1], dims[2], dims[3])
}

fn scalar(caps: &Captures, idx: usize) -> usize {
    caps[idx].parse().unwrap_or(1)
}

fn conv2d_from(caps: &Captures) -> Result<LayerShape> {
    let input = parse_tensor_shape(&caps[4])?;
    let kernel = parse_tensor_shape(&caps[5])?;
    let output = parse_tensor_shape(&caps[7])?;
    expect_rank(&caps[4], &input, &[4])?;
    expect_rank(&caps[5], &kernel, &[4])?;
    expect_rank(&caps[7], &output, &[4])?;
    Ok(LayerShape::Conv2d(Conv2d {
        dilation: scalar(caps, 1),
        stride: scalar(caps, 2),
        input: nhwc(&input),
        kernel_width: kernel[0],
        kernel_height: kernel[1],
        kernel_input_channel: kernel[2],
        kernel_output_channel: kernel[3],
        output: nhwc(&output),
    }))
}

fn depthwise_from(caps: &Captures) -> Result<LayerShape> {
    let input = parse_tensor_shape(&caps[4])?;
    let kernel = parse_tensor_shape(&caps[5])?;
    let output = parse_tensor_shape(&caps[7])?;
    expect_rank(&caps[4], &input, &[4])?;
    expect_rank(&caps[5], &kernel, &[3, 4])?;
    expect_rank(&caps[7], &output, &[4, 5])?;
    Ok(LayerShape::DepthwiseConv2d(DepthwiseConv2d {
        dilation: scalar(caps, 1),
        stride: scalar(caps, 2),
        input: nhwc(&input),
        kernel_width: kernel[0],
        kernel_height: kernel[1],
        kernel_channel: kernel[2],
        kernel_multiplier: kernel.get(3).copied(),
        output: nhwc(&output),
        output_multiplier: output.get(4).copied(),
    }))
}

fn matmul_from(caps: &Captures) -> Result<LayerShape> {
    let input = parse_tensor_shape(&caps[2])?;
    let kernel = parse_tensor_shape(&caps[3])?;
    let output = parse_tensor_shape(&caps[5])?;
    for (text, dims) in [(&caps[2], &input), (&caps[3], &kernel), (&caps[5], &output)] {
        expect_rank(text, dims, &[3])?;
    }
    let extent = |d: &[usize]| Extent3::new(d[0], d[1], d[2]);
    Ok(LayerShape::Matmul(Matmul {
        input: extent(&input),
        kernel: extent(&kernel),
        output: extent(&output),
    }))
}

/// Recognize a single line; at most one operator per line
fn match_line(line: &str) -> Option<Result<LayerShape>> {
    if let Some(caps) = CONV2D.captures(line) {
        return Some(conv2d_from(&caps));
    }
    if let Some(caps) = DEPTHWISE_MULTIPLIER.captures(line).or_else(|| DEPTHWISE.captures(line)) {
        return Some(depthwise_from(&caps));
    }
    BATCH_MATMUL.captures(line).map(|caps| matmul_from(&caps))
}

/// Extract every operator of the requested kinds, in file order
pub fn scan_ir(text: &str, kinds: &[OperatorKind], mode: TransformMode) -> Result<Vec<Layer>> {
    let mut layers = Vec::new();
    let mut counts = [0usize; 3];

    for (line_no, line) in text.lines().enumerate() {
        let Some(shape) = match_line(line) else {
            continue;
        };
        let shape = match shape {
            Ok(shape) => shape,
            Err(e) => {
                warn!("line {}: skipping operator, {}", line_no + 1, e);
                continue;
            }
        };
        let kind = shape.kind();
        if !kinds.contains(&kind) {
            continue;
        }
        let slot = OperatorKind::ALL.iter().position(|k| *k == kind).unwrap_or(0);
        counts[slot] += 1;
        let layer = Layer::new(format!("{}_{}", kind, counts[slot]), shape, mode);
        debug!("line {}: {}", line_no + 1, layer.summary());
        layers.push(layer);
    }

    info!(
        "Found {} conv2d, {} depthwise_conv2d, {} matmul layers",
        counts[0], counts[1], counts[2]
    );
    Ok(layers)
}

/// Read and scan an IR file
pub fn read_ir(path: &Path, kinds: &[OperatorKind], mode: TransformMode) -> Result<Vec<Layer>> {
    let text = std::fs::read_to_string(path).map_err(|e| DseError::io(path, e))?;
    scan_ir(&text, kinds, mode)
}

/// Model name used in run ids and result file names: the input file stem,
/// restricted to characters safe inside shell commands
pub fn model_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Which layers (by ordinal) to explore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerSelection {
    #[default]
    All,
    /// Ordinals `start..=end`; open-ended when `end` is `None`
    Range { start: usize, end: Option<usize> },
    Single(usize),
}

impl LayerSelection {
    /// Keep the selected layers. An out-of-range selection is reported and
    /// leaves the set untouched.
    pub fn apply(&self, layers: Vec<Layer>) -> Vec<Layer> {
        let total = layers.len();
        match *self {
            LayerSelection::All => layers,
            LayerSelection::Range { start, end } => {
                let end = end.unwrap_or(total);
                if start == 0 || end > total {
                    warn!("Layer range {}..={} out of range (1..={}), exploring all layers", start, end, total);
                    return layers;
                }
                layers
                    .into_iter()
                    .filter(|l| l.ordinal().is_some_and(|n| n >= start && n <= end))
                    .collect()
            }
            LayerSelection::Single(n) => {
                if n == 0 || n > total {
                    warn!("Selected layer {} out of range (1..={}), exploring all layers", n, total);
                    return layers;
                }
                layers.into_iter().filter(|l| l.ordinal() == Some(n)).take(1).collect()
            }
        }
    }
}
