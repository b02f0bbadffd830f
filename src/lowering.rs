//! Kernel artifact writer
//!
//! Emits one standalone kernel function per layer, declaring the implemented
//! (post-clipping) tensors as memref arguments and wrapping the single linalg
//! op in an accelerator launch region for outlining.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{DseError, Result};
use crate::layers::{Layer, LayerShape, TransformMode};

/// Directory holding the kernels of one model/mode session
pub fn kernel_dir(prefix: &str, model: &str, mode: TransformMode) -> PathBuf {
    PathBuf::from(format!("{}_{}_{}", prefix, model, mode))
}

fn join_dims(dims: &[usize]) -> String {
    dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("x")
}

/// Render the kernel function for a layer
pub fn render_kernel(layer: &Layer) -> String {
    let (op, input, kernel, output) = match layer.implemented_shape() {
        LayerShape::Conv2d(c) => (
            format!(
                "linalg.conv_2d_nhwc_hwcf {{dilations = dense<{}> : tensor<2xi64>, strides = dense<{}> : tensor<2xi64>}}",
                c.dilation, c.stride
            ),
            join_dims(&[c.input.batch, c.input.width, c.input.height, c.input.channel]),
            join_dims(&[c.kernel_width, c.kernel_height, c.kernel_input_channel, c.kernel_output_channel]),
            join_dims(&[c.output.batch, c.output.width, c.output.height, c.output.channel]),
        ),
        LayerShape::DepthwiseConv2d(d) => (
            format!(
                "linalg.depthwise_conv_2d_nhwc_hwc {{dilations = dense<{}> : tensor<2xi64>, strides = dense<{}> : tensor<2xi64>}}",
                d.dilation, d.stride
            ),
            join_dims(&[d.input.batch, d.input.width, d.input.height, d.input.channel]),
            join_dims(&[d.kernel_width, d.kernel_height, d.kernel_channel]),
            join_dims(&[d.output.batch, d.output.width, d.output.height, d.output.channel]),
        ),
        LayerShape::Matmul(m) => (
            "linalg.batch_matmul".to_string(),
            join_dims(&[m.input.batch, m.input.width, m.input.height]),
            join_dims(&[m.kernel.batch, m.kernel.width, m.kernel.height]),
            join_dims(&[m.output.batch, m.output.width, m.output.height]),
        ),
    };

    let mut text = String::new();
    let _ = writeln!(
        text,
        "func.func @main(%arg0: memref<{i}xf32>, %arg1: memref<{k}xf32>, %arg2: memref<{o}xf32>) {{",
        i = input, k = kernel, o = output
    );
    text.push_str("  cf.br ^bb1\n");
    text.push_str("^bb1:  // pred: ^bb0\n");
    text.push_str("  soda.launch {\n");
    let _ = writeln!(
        text,
        "    {op} ins(%arg0, %arg1 : memref<{i}xf32>, memref<{k}xf32>) outs(%arg2 : memref<{o}xf32>)",
        op = op, i = input, k = kernel, o = output
    );
    text.push_str("    soda.terminator\n");
    text.push_str("  }\n");
    text.push_str("  return\n");
    text.push_str("}\n");
    text
}

/// Write `<dir>/<layer>.mlir` and remember its path on the layer
pub fn write_kernel(layer: &mut Layer, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| DseError::io(dir, e))?;
    let path = dir.join(format!("{}.mlir", layer.name));
    std::fs::write(&path, render_kernel(layer)).map_err(|e| DseError::io(&path, e))?;
    debug!("Wrote kernel {}", path.display());
    layer.file_path = Some(path.clone());
    Ok(path)
}
