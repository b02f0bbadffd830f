//! Results recording
//!
//! One append-only CSV table per model × operator kind × mode. The column set
//! depends on both the operator kind (layer and implemented-shape columns)
//! and the mode (permutation order, tile sizes, or unroll pair).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::configurations::Configuration;
use crate::error::{DseError, Result};
use crate::layers::{Layer, LayerShape, OperatorKind, TransformMode};
use crate::metrics::DerivedMetrics;

const RESULT_COLUMNS: [&str; 9] = [
    "simulation_cycles",
    "total_power",
    "area",
    "utilization",
    "runtime_in_s",
    "gflops",
    "gflops_per_watt",
    "energy_consumed",
    "flop_count",
];

/// One persisted row together with its header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub kind: OperatorKind,
    pub mode: TransformMode,
    pub header: Vec<String>,
    pub row: Vec<String>,
}

fn cell<T: ToString>(value: T) -> String {
    value.to_string()
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl ResultRecord {
    pub fn new(run_id: &str, layer: &Layer, configuration: &Configuration, metrics: &DerivedMetrics) -> Self {
        let mut header: Vec<String> = Vec::new();
        let mut row: Vec<String> = Vec::new();

        header.push("configuration".into());
        row.push(run_id.to_string());
        let (layer_header, layer_row) = layer_columns(&layer.shape);
        header.extend(layer_header);
        row.extend(layer_row);

        let (mode_header, mode_row) = mode_columns(layer.kind(), configuration);
        header.extend(mode_header);
        row.extend(mode_row);

        let (implemented_header, implemented_row) = implemented_columns(&layer.implemented_shape());
        header.extend(implemented_header);
        row.extend(implemented_row);
        header.push("number_of_tiles".into());
        row.push(cell(layer.tile_multiplier));

        header.extend(RESULT_COLUMNS.iter().map(|c| c.to_string()));
        row.extend([
            cell(metrics.simulation_cycles),
            cell(metrics.total_power),
            cell(metrics.area),
            optional(metrics.utilization),
            cell(metrics.runtime_s),
            cell(metrics.throughput_gflops),
            cell(metrics.efficiency_gflops_per_watt),
            cell(metrics.energy_j),
            cell(metrics.flop_count),
        ]);

        ResultRecord {
            kind: layer.kind(),
            mode: configuration.mode(),
            header,
            row,
        }
    }
}

fn named(names: &[&str], values: Vec<String>) -> (Vec<String>, Vec<String>) {
    debug_assert_eq!(names.len(), values.len());
    (names.iter().map(|n| n.to_string()).collect(), values)
}

fn layer_columns(shape: &LayerShape) -> (Vec<String>, Vec<String>) {
    match shape {
        LayerShape::Conv2d(c) => named(
            &[
                "strides", "dilations",
                "input_batch", "input_width", "input_height", "input_channel",
                "kernel_width", "kernel_height", "kernel_input_channels", "kernel_output_channels",
                "output_batch", "output_width", "output_height", "output_channel",
            ],
            vec![
                cell(c.stride), cell(c.dilation),
                cell(c.input.batch), cell(c.input.width), cell(c.input.height), cell(c.input.channel),
                cell(c.kernel_width), cell(c.kernel_height),
                cell(c.kernel_input_channel), cell(c.kernel_output_channel),
                cell(c.output.batch), cell(c.output.width), cell(c.output.height), cell(c.output.channel),
            ],
        ),
        LayerShape::DepthwiseConv2d(d) => named(
            &[
                "strides", "dilations",
                "input_batch", "input_width", "input_height", "input_channel",
                "kernel_width", "kernel_height", "kernel_input_channel", "kernel_multiplier",
                "output_batch", "output_width", "output_height", "output_channel", "output_multiplier",
            ],
            vec![
                cell(d.stride), cell(d.dilation),
                cell(d.input.batch), cell(d.input.width), cell(d.input.height), cell(d.input.channel),
                cell(d.kernel_width), cell(d.kernel_height),
                cell(d.kernel_channel), optional(d.kernel_multiplier),
                cell(d.output.batch), cell(d.output.width), cell(d.output.height), cell(d.output.channel),
                optional(d.output_multiplier),
            ],
        ),
        LayerShape::Matmul(m) => named(
            &[
                "input_batch", "input_width", "input_height",
                "weight_batch", "weight_width", "weight_height",
                "output_batch", "output_width", "output_height",
            ],
            vec![
                cell(m.input.batch), cell(m.input.width), cell(m.input.height),
                cell(m.kernel.batch), cell(m.kernel.width), cell(m.kernel.height),
                cell(m.output.batch), cell(m.output.width), cell(m.output.height),
            ],
        ),
    }
}

fn mode_columns(kind: OperatorKind, configuration: &Configuration) -> (Vec<String>, Vec<String>) {
    match configuration {
        Configuration::Permute { order, .. } => (
            (1..=order.len()).map(|i| format!("permutation_order_{}", i)).collect(),
            order.iter().map(cell).collect(),
        ),
        Configuration::Tile(tiles) => {
            let names: &[&str] = match kind {
                OperatorKind::Conv2d => &[
                    "tiled_output_batch", "tiled_output_width", "tiled_output_height",
                    "tiled_output_channel", "tiled_kernel_width", "tiled_kernel_height",
                    "tiled_input_channel",
                ],
                OperatorKind::DepthwiseConv2d => &[
                    "tiled_output_batch", "tiled_output_width", "tiled_output_height",
                    "tiled_input_channel", "tiled_kernel_width", "tiled_kernel_height",
                ],
                OperatorKind::Matmul => &[
                    "tiled_output_batch", "tiled_output_width", "tiled_output_height",
                    "tiled_kernel_width",
                ],
            };
            // Curated tuples come from user config and may not match the kind's arity
            let header = (0..tiles.len())
                .map(|i| names.get(i).map(|n| n.to_string()).unwrap_or_else(|| format!("tiled_dim_{}", i + 1)))
                .collect();
            (header, tiles.iter().map(cell).collect())
        }
        Configuration::Unroll { depth, factor } => (
            vec!["unroll_full".into(), "unroll_factor".into()],
            vec![cell(depth), cell(factor)],
        ),
    }
}

fn implemented_columns(shape: &LayerShape) -> (Vec<String>, Vec<String>) {
    match shape {
        LayerShape::Conv2d(c) => named(
            &[
                "actual_input_batch", "actual_input_width", "actual_input_height", "actual_input_channel",
                "actual_kernel_width", "actual_kernel_height",
                "actual_kernel_input_channels", "actual_kernel_output_channels",
                "actual_output_batch", "actual_output_width", "actual_output_height", "actual_output_channel",
            ],
            vec![
                cell(c.input.batch), cell(c.input.width), cell(c.input.height), cell(c.input.channel),
                cell(c.kernel_width), cell(c.kernel_height),
                cell(c.kernel_input_channel), cell(c.kernel_output_channel),
                cell(c.output.batch), cell(c.output.width), cell(c.output.height), cell(c.output.channel),
            ],
        ),
        LayerShape::DepthwiseConv2d(d) => named(
            &[
                "actual_input_batch", "actual_input_width", "actual_input_height", "actual_input_channel",
                "actual_kernel_width", "actual_kernel_height", "actual_kernel_input_channels",
                "actual_output_batch", "actual_output_width", "actual_output_height", "actual_output_channel",
            ],
            vec![
                cell(d.input.batch), cell(d.input.width), cell(d.input.height), cell(d.input.channel),
                cell(d.kernel_width), cell(d.kernel_height), cell(d.kernel_channel),
                cell(d.output.batch), cell(d.output.width), cell(d.output.height), cell(d.output.channel),
            ],
        ),
        LayerShape::Matmul(m) => named(
            &[
                "actual_input_batch", "actual_input_width", "actual_input_height",
                "actual_weight_batch", "actual_weight_width", "actual_weight_height",
                "actual_output_batch", "actual_output_width", "actual_output_height",
            ],
            vec![
                cell(m.input.batch), cell(m.input.width), cell(m.input.height),
                cell(m.kernel.batch), cell(m.kernel.width), cell(m.kernel.height),
                cell(m.output.batch), cell(m.output.width), cell(m.output.height),
            ],
        ),
    }
}

/// Result tables of one model
#[derive(Debug, Clone)]
pub struct ResultsTable {
    dir: PathBuf,
    model: String,
}

impl ResultsTable {
    pub fn new(dir: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        ResultsTable { dir: dir.into(), model: model.into() }
    }

    pub fn path_for(&self, kind: OperatorKind, mode: TransformMode) -> PathBuf {
        self.dir.join(format!("{}_{}_{}.csv", self.model, kind, mode))
    }

    /// Append a row, writing the header first if the file is new or empty
    pub fn append(&self, record: &ResultRecord) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).map_err(|e| DseError::io(&self.dir, e))?;
        let path = self.path_for(record.kind, record.mode);
        let needs_header = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DseError::io(&path, e))?;

        let mut text = String::new();
        if needs_header {
            text.push_str(&record.header.join(","));
            text.push('\n');
        }
        text.push_str(&record.row.join(","));
        text.push('\n');
        file.write_all(text.as_bytes()).map_err(|e| DseError::io(&path, e))?;

        info!("Recorded {} in {}", record.row.first().map(String::as_str).unwrap_or(""), path.display());
        Ok(path)
    }

    /// Read back all data rows of a table (header excluded)
    pub fn rows(path: &Path) -> Result<Vec<Vec<String>>> {
        let text = std::fs::read_to_string(path).map_err(|e| DseError::io(path, e))?;
        Ok(text
            .lines()
            .skip(1)
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.split(',').map(str::to_string).collect())
            .collect())
    }
}
