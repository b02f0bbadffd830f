//! Explorer Configuration Module
//!
//! Defines the external toolchain invocation, the on-disk layout of
//! artifacts/results, and the knobs bounding the explored space.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DseError, Result};

/// Complete explorer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DseConfig {
    /// How the external tools are invoked
    pub toolchain: ToolchainConfig,
    /// Where artifacts, logs and results live
    pub paths: PathsConfig,
    /// Exploration parameters
    pub exploration: ExplorationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Prefix for every compiler-pass command (container runner + image)
    pub container_prefix: String,
    /// Pass driver with the accelerator-outlining passes
    pub soda_opt: String,
    /// Upstream pass driver
    pub mlir_opt: String,
    /// IR-to-LLVM translator
    pub mlir_translate: String,
    /// High-level-synthesis wrapper script, receives the run id
    pub hls_script: String,
    /// Physical-design wrapper script, receives the run id
    pub physical_design_script: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Per-run intermediate artifacts (cleaned after each run)
    pub output_dir: PathBuf,
    /// Per-run progress logs (never cleaned)
    pub log_dir: PathBuf,
    /// Result tables
    pub results_dir: PathBuf,
    /// Directory holding `<kind>_mapping.csv` permutation tables
    pub mapping_dir: PathBuf,
    /// Prefix of the per-model kernel directory (`<prefix>_<model>_<mode>`)
    pub layers_dir_prefix: String,
    /// Synthesis log, `{output}` and `{id}` are expanded
    pub synthesis_log: String,
    /// Physical-design report, `{output}` and `{id}` are expanded
    pub power_report: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationConfig {
    /// Clock frequency the simulated cycle counts are converted with
    pub target_frequency_hz: f64,
    /// Curated (short, hand-picked) or exhaustive configuration sets
    pub strategy: ExplorationStrategy,
    /// Keep per-run artifacts instead of deleting them
    pub keep_artifacts: bool,
    /// Hand-picked tile combinations used by the curated strategy
    pub curated_tiles: CuratedTiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExplorationStrategy {
    /// Short curated lists for conv2d/matmul, full sets for depthwise tiling
    Curated,
    /// Full cross-products for every operator kind
    Exhaustive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuratedTiles {
    /// `[batch, out_w, out_h, out_c, k_w, k_h, in_c]`
    pub conv2d: Vec<usize>,
    /// `[batch, out_w, out_h, k_w]`
    pub matmul: Vec<usize>,
}

impl Default for DseConfig {
    fn default() -> Self {
        DseConfig {
            toolchain: ToolchainConfig {
                container_prefix: "docker run -u $(id -u) -v $(pwd):/working_dir --rm agostini01/soda"
                    .to_string(),
                soda_opt: "soda-opt".to_string(),
                mlir_opt: "mlir-opt".to_string(),
                mlir_translate: "mlir-translate".to_string(),
                hls_script: "scripts/run-bambu.sh".to_string(),
                physical_design_script: "scripts/run-openroad.sh".to_string(),
            },
            paths: PathsConfig {
                output_dir: PathBuf::from("output"),
                log_dir: PathBuf::from("output-logs"),
                results_dir: PathBuf::from("results"),
                mapping_dir: PathBuf::from("scripts"),
                layers_dir_prefix: "layers".to_string(),
                synthesis_log: "{output}/{id}/bambu-log".to_string(),
                power_report: "{output}/{id}/HLS_output/Synthesis/bash_flow/openroad/logs/nangate45/main_kernel/base/6_report.log"
                    .to_string(),
            },
            exploration: ExplorationConfig {
                target_frequency_hz: 100e6,  // 100 MHz
                strategy: ExplorationStrategy::Curated,
                keep_artifacts: false,
                curated_tiles: CuratedTiles {
                    conv2d: vec![1, 14, 14, 1, 3, 3, 16],
                    matmul: vec![1, 1, 64, 16],
                },
            },
        }
    }
}

impl PathsConfig {
    /// Expand `{output}` and `{id}` in a path template
    pub fn expand(&self, template: &str, run_id: &str) -> PathBuf {
        PathBuf::from(
            template
                .replace("{output}", &self.output_dir.to_string_lossy())
                .replace("{id}", run_id),
        )
    }

    /// Progress log for one run
    pub fn progress_log(&self, run_id: &str) -> PathBuf {
        self.log_dir.join(format!("progress-{}.txt", run_id))
    }
}

impl DseConfig {
    /// Save configuration to TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str).map_err(|e| DseError::io(path, e))
    }

    /// Load configuration from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let toml_str = std::fs::read_to_string(path).map_err(|e| DseError::io(path, e))?;
        Ok(toml::from_str(&toml_str)?)
    }
}
