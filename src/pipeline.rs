//! Pipeline Orchestrator
//!
//! Drives one configuration of one layer through the external flow:
//!
//! ```text
//! outline → lower-memrefs → optimize(mode) → dce → translate → hls → physical-design
//! ```
//!
//! Stages run synchronously through a [`StageRunner`], each appending its
//! combined output to the run's progress log. A failing stage does not stop
//! the run; missing outputs surface later as missing metrics. Whatever
//! happens, artifacts carrying the run id are removed afterwards.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use itertools::Itertools;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::DseConfig;
use crate::configurations::Configuration;
use crate::error::{DseError, MetricsError, Result};
use crate::layers::Layer;
use crate::metrics::{DerivedMetrics, RawMetrics};
use crate::results::{ResultRecord, ResultsTable};

/// Mode-independent lowering sub-pipeline of the optimize stage
const LOWERING_PASSES: [&str; 16] = [
    "-affine-scalrep",
    "-cse",
    "-affine-data-copy-generate='generate-dma=false fast-mem-space=0'",
    "-erase-buffer-deallocation",
    "-promote-buffers-to-stack='max-rank-of-allocated-memref=4 max-alloc-size-in-bytes=4096'",
    "-lower-affine",
    "-convert-scf-to-cf",
    "-convert-memref-to-llvm",
    "-convert-math-to-llvm",
    "-convert-math-to-libm",
    "-arith-expand",
    "-memref-expand",
    "-convert-arith-to-llvm",
    "-convert-func-to-llvm='use-bare-ptr-memref-call-conv'",
    "-reconcile-unrealized-casts",
    "--mlir-print-ir-after-all",
];

const UNROLL_FULL: &str = "-affine-loop-unroll='unroll-full'";

/// External flow stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Outline,
    LowerMemrefs,
    Optimize,
    DeadCodeElimination,
    Translate,
    HighLevelSynthesis,
    PhysicalDesign,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Outline,
        Stage::LowerMemrefs,
        Stage::Optimize,
        Stage::DeadCodeElimination,
        Stage::Translate,
        Stage::HighLevelSynthesis,
        Stage::PhysicalDesign,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Outline => "outline",
            Stage::LowerMemrefs => "lower-memrefs",
            Stage::Optimize => "optimize",
            Stage::DeadCodeElimination => "dce",
            Stage::Translate => "translate",
            Stage::HighLevelSynthesis => "hls",
            Stage::PhysicalDesign => "physical-design",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes one stage command
pub trait StageRunner {
    /// Run `command` to completion, sending its combined output to `log`.
    ///
    /// Only a failure to start the command is an error; exit status is the
    /// runner's business to report.
    fn run(&mut self, ctx: &RunContext<'_>, stage: Stage, command: &str, log: &File) -> Result<()>;
}

/// Runs stages through `sh -c`
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl StageRunner for ShellRunner {
    fn run(&mut self, ctx: &RunContext<'_>, stage: Stage, command: &str, log: &File) -> Result<()> {
        let launch_err = |source| DseError::StageLaunch { stage: stage.to_string(), source };
        let stdout = log.try_clone().map_err(launch_err)?;
        let stderr = log.try_clone().map_err(launch_err)?;

        debug!("[{}] {}", stage, command);
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()
            .map_err(launch_err)?;

        if !status.success() {
            warn!("{}: stage {} exited with {}", ctx.run_id, stage, status);
        }
        Ok(())
    }
}

/// Records commands without executing anything
#[derive(Debug, Clone, Default)]
pub struct DryRunRunner {
    pub commands: Vec<(String, Stage, String)>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StageRunner for DryRunRunner {
    fn run(&mut self, ctx: &RunContext<'_>, stage: Stage, command: &str, log: &File) -> Result<()> {
        info!("[dry-run] {} {}: {}", ctx.run_id, stage, command);
        let mut out = log;
        writeln!(out, "$ {}", command).map_err(|e| DseError::io(ctx.progress_log(), e))?;
        self.commands.push((ctx.run_id.clone(), stage, command.to_string()));
        Ok(())
    }
}

/// How a single run ended
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Recorded {
        run_id: String,
        metrics: DerivedMetrics,
        table: PathBuf,
    },
    Failed {
        run_id: String,
        reason: MetricsError,
    },
}

impl RunOutcome {
    pub fn run_id(&self) -> &str {
        match self {
            RunOutcome::Recorded { run_id, .. } | RunOutcome::Failed { run_id, .. } => run_id,
        }
    }
}

/// Everything one run needs, fixed for its whole duration
#[derive(Debug, Clone)]
pub struct RunContext<'a> {
    pub run_id: String,
    pub layer: &'a Layer,
    pub configuration: &'a Configuration,
    pub config: &'a DseConfig,
    kernel: PathBuf,
}

impl<'a> RunContext<'a> {
    pub fn new(model: &str, layer: &'a Layer, configuration: &'a Configuration, config: &'a DseConfig) -> Self {
        let kernel = layer
            .file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.mlir", layer.name)));
        RunContext {
            run_id: configuration.run_id(model, &layer.name),
            layer,
            configuration,
            config,
            kernel,
        }
    }

    pub fn progress_log(&self) -> PathBuf {
        self.config.paths.progress_log(&self.run_id)
    }

    pub fn synthesis_log(&self) -> PathBuf {
        self.config.paths.expand(&self.config.paths.synthesis_log, &self.run_id)
    }

    pub fn power_report(&self) -> PathBuf {
        self.config.paths.expand(&self.config.paths.power_report, &self.run_id)
    }

    fn tool(&self, name: &str) -> String {
        let prefix = self.config.toolchain.container_prefix.trim();
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{} {}", prefix, name)
        }
    }

    /// Pass list of the optimize stage with the configuration's directives injected
    pub fn optimize_passes(&self) -> Vec<String> {
        let mut passes: Vec<String> = LOWERING_PASSES.iter().map(|p| p.to_string()).collect();
        match self.configuration {
            Configuration::Permute { order, .. } => {
                passes.insert(
                    0,
                    format!("-test-loop-permutation='permutation-map={}'", order.iter().join(",")),
                );
            }
            Configuration::Tile(tiles) => {
                passes.retain(|p| !p.starts_with("-promote-buffers-to-stack"));
                if tiles.iter().any(|&t| t != 0) {
                    passes.insert(0, format!("-affine-loop-tile='tile-sizes={}'", tiles.iter().join(",")));
                }
            }
            Configuration::Unroll { depth, factor } => {
                passes.retain(|p| {
                    !p.starts_with("-affine-data-copy-generate") && !p.starts_with("-erase-buffer-deallocation")
                });
                let directives: Vec<String> = if *factor == 0 {
                    vec![UNROLL_FULL.to_string(); *depth]
                } else {
                    let mut d = vec![UNROLL_FULL.to_string(); depth.saturating_sub(1)];
                    d.push(format!("-affine-loop-unroll='unroll-factor={}'", factor));
                    d
                };
                // after -cse
                for (i, directive) in directives.into_iter().enumerate() {
                    passes.insert(2 + i, directive);
                }
            }
        }
        passes
    }

    /// Shell command for a stage
    pub fn command(&self, stage: Stage) -> String {
        let out = self.config.paths.output_dir.display();
        let id = &self.run_id;
        let tools = &self.config.toolchain;
        match stage {
            Stage::Outline => format!(
                "{} -soda-outline-bambu-code -soda-extract-arguments-to-xml='using-bare-ptr' \
                 -soda-generate-bambu-accelcode -convert-linalg-to-affine-loops {} \
                 -o {out}/04a{id}.mlir 2>&1 | cat > {out}/05aintermediate-{id}.mlir",
                self.tool(&tools.soda_opt),
                self.kernel.display(),
            ),
            Stage::LowerMemrefs => format!(
                "{} -expand-strided-metadata {out}/04a{id}.mlir -o {out}/04b{id}.mlir \
                 2>&1 | cat > {out}/05bintermediate-{id}.mlir",
                self.tool(&tools.mlir_opt),
            ),
            Stage::Optimize => format!(
                "{} {} {out}/04b{id}.mlir -o {out}/04c{id}.mlir 2>&1 | cat > {out}/05cintermediate-{id}.mlir",
                self.tool(&tools.soda_opt),
                self.optimize_passes().join(" "),
            ),
            Stage::DeadCodeElimination => format!(
                "{} -symbol-dce {out}/04c{id}.mlir -o {out}/04d{id}.mlir \
                 2>&1 | cat > {out}/05dintermediate-{id}.mlir",
                self.tool(&tools.mlir_opt),
            ),
            Stage::Translate => format!(
                "{} -opaque-pointers=0 --mlir-to-llvmir {out}/04d{id}.mlir -o {out}/05{id}.ll",
                self.tool(&tools.mlir_translate),
            ),
            Stage::HighLevelSynthesis => format!(
                "{} {id} 2>&1 | tee {out}/bambu-{id}.log",
                tools.hls_script,
            ),
            Stage::PhysicalDesign => format!(
                "{} {id} 2>&1 | tee {out}/openroad-{id}.log",
                tools.physical_design_script,
            ),
        }
    }

    /// Run every stage, extract metrics, record the row and clean up.
    ///
    /// Cleanup runs even when a stage could not be launched.
    pub fn execute<R: StageRunner>(&self, runner: &mut R, results: &ResultsTable) -> Result<RunOutcome> {
        let paths = &self.config.paths;
        for dir in [&paths.output_dir, &paths.log_dir] {
            std::fs::create_dir_all(dir).map_err(|e| DseError::io(dir, e))?;
        }
        let log_path = self.progress_log();
        let log = File::create(&log_path).map_err(|e| DseError::io(&log_path, e))?;

        info!("Running {} ({})", self.run_id, self.configuration);
        let outcome = self.run_stages(runner, &log, &log_path).and_then(|raw| self.finish(raw, results));

        if self.config.exploration.keep_artifacts {
            debug!("Keeping artifacts of {}", self.run_id);
        } else {
            let removed = remove_artifacts(&paths.output_dir, &self.run_id);
            debug!("Removed {} artifacts of {}", removed, self.run_id);
        }
        outcome
    }

    fn run_stages<R: StageRunner>(&self, runner: &mut R, log: &File, log_path: &Path) -> Result<RawMetrics> {
        let mut out = log;
        let note_err = |e| DseError::io(log_path, e);
        let mut raw = RawMetrics::default();

        for stage in Stage::ALL {
            writeln!(out, "==> {}", stage).map_err(note_err)?;
            runner.run(self, stage, &self.command(stage), log)?;

            match stage {
                Stage::HighLevelSynthesis => {
                    let path = self.synthesis_log();
                    raw.read_synthesis_log(&path);
                    let written = match raw.simulation_cycles {
                        Some(cycles) => writeln!(out, "Average execution in cycles: {}", cycles),
                        None => writeln!(out, "Average execution in cycles: not found in {}", path.display()),
                    };
                    written.map_err(note_err)?;
                }
                Stage::PhysicalDesign => {
                    raw.read_power_report(&self.power_report());
                    let show = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_else(|| "n/a".into());
                    writeln!(out, "Optimized accelerator:").map_err(note_err)?;
                    writeln!(out, "  total power consumption: {} W", show(raw.total_power)).map_err(note_err)?;
                    writeln!(out, "  available chip area: {} um^2", show(raw.area)).map_err(note_err)?;
                    writeln!(out, "  utilized chip area: {}%", show(raw.utilization)).map_err(note_err)?;
                }
                _ => {}
            }
        }
        Ok(raw)
    }

    fn finish(&self, raw: RawMetrics, results: &ResultsTable) -> Result<RunOutcome> {
        let frequency = self.config.exploration.target_frequency_hz;
        match DerivedMetrics::derive(&raw, self.layer, frequency) {
            Ok(metrics) => {
                let record = ResultRecord::new(&self.run_id, self.layer, self.configuration, &metrics);
                let table = results.append(&record)?;
                info!(
                    "{}: {} cycles, {:.3} GFLOPS, {:.3} GFLOPS/W",
                    self.run_id, metrics.simulation_cycles, metrics.throughput_gflops,
                    metrics.efficiency_gflops_per_watt
                );
                Ok(RunOutcome::Recorded { run_id: self.run_id.clone(), metrics, table })
            }
            Err(reason) => {
                warn!("{}: not recorded, {}", self.run_id, reason);
                Ok(RunOutcome::Failed { run_id: self.run_id.clone(), reason })
            }
        }
    }
}

/// Delete every entry under `dir` whose name contains `run_id`; returns how many
fn remove_artifacts(dir: &Path, run_id: &str) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot scan {} for cleanup: {}", dir.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if entry.file_name().to_string_lossy().contains(run_id) {
            let result = if is_dir {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        } else if is_dir {
            removed += remove_artifacts(&path, run_id);
        }
    }
    removed
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layers::tests::{conv, matmul};
    use crate::layers::{Nhwc, OperatorKind, TransformMode};

    /// Pretends to be the toolchain: drops artifacts and canned tool logs
    pub(crate) struct ScriptedRunner {
        pub(crate) cycles: Option<u64>,
        pub(crate) stages: Vec<Stage>,
    }

    impl StageRunner for ScriptedRunner {
        fn run(&mut self, ctx: &RunContext<'_>, stage: Stage, _command: &str, log: &File) -> Result<()> {
            self.stages.push(stage);
            let mut out = log;
            writeln!(out, "fake {}", stage).unwrap();
            let output = &ctx.config.paths.output_dir;
            match stage {
                Stage::Outline => {
                    std::fs::write(output.join(format!("04a{}.mlir", ctx.run_id)), "module {}").unwrap();
                }
                Stage::HighLevelSynthesis => {
                    let path = ctx.synthesis_log();
                    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                    let text = match self.cycles {
                        Some(c) => format!("Average execution time: {} cycles\n", c),
                        None => "simulation failed\n".to_string(),
                    };
                    std::fs::write(path, text).unwrap();
                }
                Stage::PhysicalDesign => {
                    let path = ctx.power_report();
                    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                    std::fs::write(
                        path,
                        "Total  1.0e-02  2.0e-02  1.0e-05  5.0e-02  100.0%\nDesign area 5123 u^2 37% utilization.\n",
                    )
                    .unwrap();
                }
                _ => {}
            }
            Ok(())
        }
    }

    pub(crate) fn test_config(root: &Path) -> DseConfig {
        let mut config = DseConfig::default();
        config.paths.layers_dir_prefix = root.join("layers").to_string_lossy().into_owned();
        config.paths.mapping_dir = root.join("mappings");
        config.paths.output_dir = root.join("output");
        config.paths.log_dir = root.join("output-logs");
        config.paths.results_dir = root.join("results");
        config
    }

    fn tile_layer() -> Layer {
        Layer::new(
            "conv2d_1",
            conv(Nhwc::new(1, 56, 56, 256), (3, 3), Nhwc::new(1, 56, 56, 1)),
            TransformMode::Tile,
        )
    }

    #[test]
    fn test_optimize_passes_per_mode() {
        let config = DseConfig::default();
        let layer = tile_layer();

        let tile = Configuration::Tile(vec![1, 14, 14, 1, 3, 3, 16]);
        let passes = RunContext::new("net", &layer, &tile, &config).optimize_passes();
        assert_eq!(passes[0], "-affine-loop-tile='tile-sizes=1,14,14,1,3,3,16'");
        assert!(!passes.iter().any(|p| p.contains("promote-buffers-to-stack")));
        assert_eq!(passes.len(), 16);

        let untiled = Configuration::Tile(vec![0; 6]);
        let passes = RunContext::new("net", &layer, &untiled, &config).optimize_passes();
        assert_eq!(passes[0], "-affine-scalrep");
        assert_eq!(passes.len(), 15);

        let perm = Configuration::Permute { draft: vec![0, 1, 2, 3], order: vec![0, 2, 1, 3] };
        let passes = RunContext::new("net", &layer, &perm, &config).optimize_passes();
        assert_eq!(passes[0], "-test-loop-permutation='permutation-map=0,2,1,3'");
        assert_eq!(passes.last().map(String::as_str), Some("--mlir-print-ir-after-all"));
    }

    #[test]
    fn test_unroll_directives_follow_cse() {
        let config = DseConfig::default();
        let layer = tile_layer();

        let partial = Configuration::Unroll { depth: 3, factor: 4 };
        let passes = RunContext::new("net", &layer, &partial, &config).optimize_passes();
        assert_eq!(&passes[..2], &["-affine-scalrep", "-cse"]);
        assert_eq!(&passes[2..4], &[UNROLL_FULL, UNROLL_FULL]);
        assert_eq!(passes[4], "-affine-loop-unroll='unroll-factor=4'");
        assert!(!passes.iter().any(|p| p.contains("data-copy-generate") || p.contains("erase-buffer")));

        let full = Configuration::Unroll { depth: 2, factor: 0 };
        let passes = RunContext::new("net", &layer, &full, &config).optimize_passes();
        assert_eq!(passes.iter().filter(|p| p.as_str() == UNROLL_FULL).count(), 2);

        let none = Configuration::Unroll { depth: 0, factor: 0 };
        let passes = RunContext::new("net", &layer, &none, &config).optimize_passes();
        assert_eq!(passes.len(), 14);
        assert!(!passes.iter().any(|p| p.contains("affine-loop-unroll")));
    }

    #[test]
    fn test_stage_commands() {
        let mut config = DseConfig::default();
        config.toolchain.container_prefix = String::new();
        let mut layer = Layer::new("matmul_1", matmul(64, 64, 64), TransformMode::Tile);
        layer.file_path = Some(PathBuf::from("layers_net_tile/matmul_1.mlir"));
        let tile = Configuration::Tile(vec![0; 4]);
        let ctx = RunContext::new("net", &layer, &tile, &config);
        let id = "net_tile_matmul_1_0x0x0x0";
        assert_eq!(ctx.run_id, id);

        let outline = ctx.command(Stage::Outline);
        assert!(outline.starts_with("soda-opt -soda-outline-bambu-code"));
        assert!(outline.contains("layers_net_tile/matmul_1.mlir -o output/04a"));
        assert!(outline.ends_with(&format!("cat > output/05aintermediate-{}.mlir", id)));

        assert_eq!(
            ctx.command(Stage::Translate),
            format!("mlir-translate -opaque-pointers=0 --mlir-to-llvmir output/04d{id}.mlir -o output/05{id}.ll")
        );
        assert_eq!(
            ctx.command(Stage::HighLevelSynthesis),
            format!("scripts/run-bambu.sh {id} 2>&1 | tee output/bambu-{id}.log")
        );

        let with_container = DseConfig::default();
        let ctx = RunContext::new("net", &layer, &tile, &with_container);
        assert!(ctx.command(Stage::DeadCodeElimination).starts_with("docker run"));
        assert!(ctx.command(Stage::DeadCodeElimination).contains("mlir-opt -symbol-dce"));
    }

    #[test]
    fn test_execute_records_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let layer = tile_layer();
        let tile = Configuration::Tile(vec![1, 14, 14, 1, 3, 3, 16]);
        let ctx = RunContext::new("net", &layer, &tile, &config);
        let results = ResultsTable::new(&config.paths.results_dir, "net");

        let mut runner = ScriptedRunner { cycles: Some(1000), stages: Vec::new() };
        let outcome = ctx.execute(&mut runner, &results).unwrap();

        assert_eq!(runner.stages, Stage::ALL.to_vec());
        match outcome {
            RunOutcome::Recorded { metrics, table, .. } => {
                assert_eq!(metrics.simulation_cycles, 32_000);
                assert_eq!(table, results.path_for(OperatorKind::Conv2d, TransformMode::Tile));
                assert_eq!(ResultsTable::rows(&table).unwrap().len(), 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // artifacts gone, progress log kept
        let leftovers: Vec<_> = std::fs::read_dir(&config.paths.output_dir).unwrap().collect();
        assert!(leftovers.is_empty());
        let progress = std::fs::read_to_string(ctx.progress_log()).unwrap();
        assert!(progress.contains("Average execution in cycles: 1000"));
        assert!(progress.contains("total power consumption: 0.05 W"));
    }

    #[test]
    fn test_missing_cycles_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.exploration.keep_artifacts = true;
        let layer = tile_layer();
        let tile = Configuration::Tile(vec![1, 14, 14, 1, 3, 3, 16]);
        let ctx = RunContext::new("net", &layer, &tile, &config);
        let results = ResultsTable::new(&config.paths.results_dir, "net");

        let mut runner = ScriptedRunner { cycles: None, stages: Vec::new() };
        let outcome = ctx.execute(&mut runner, &results).unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { reason: MetricsError::MissingCycles, .. }));
        assert!(!results.path_for(OperatorKind::Conv2d, TransformMode::Tile).exists());
        assert!(config.paths.output_dir.join(format!("04a{}.mlir", ctx.run_id)).exists());
    }

    #[test]
    fn test_failed_run_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let layer = tile_layer();
        let tile = Configuration::Tile(vec![1, 14, 14, 1, 3, 3, 16]);
        let ctx = RunContext::new("net", &layer, &tile, &config);
        let results = ResultsTable::new(&config.paths.results_dir, "net");

        let mut runner = ScriptedRunner { cycles: None, stages: Vec::new() };
        let outcome = ctx.execute(&mut runner, &results).unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        let leftovers: Vec<_> = std::fs::read_dir(&config.paths.output_dir).unwrap().collect();
        assert!(leftovers.is_empty());
        assert!(ctx.progress_log().exists());
    }

    /// Behaves like the toolchain until `fail_at`, where the shell cannot start
    struct LaunchFailure {
        inner: ScriptedRunner,
        fail_at: Stage,
    }

    impl StageRunner for LaunchFailure {
        fn run(&mut self, ctx: &RunContext<'_>, stage: Stage, command: &str, log: &File) -> Result<()> {
            if stage == self.fail_at {
                return Err(DseError::StageLaunch {
                    stage: stage.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "sh not found"),
                });
            }
            self.inner.run(ctx, stage, command, log)
        }
    }

    #[test]
    fn test_launch_failure_cleans_up_and_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let layer = tile_layer();
        let tile = Configuration::Tile(vec![1, 14, 14, 1, 3, 3, 16]);
        let ctx = RunContext::new("net", &layer, &tile, &config);
        let results = ResultsTable::new(&config.paths.results_dir, "net");

        let mut runner = LaunchFailure {
            inner: ScriptedRunner { cycles: Some(1000), stages: Vec::new() },
            fail_at: Stage::Optimize,
        };
        let err = ctx.execute(&mut runner, &results).unwrap_err();

        assert!(matches!(err, DseError::StageLaunch { ref stage, .. } if stage == "optimize"));
        assert_eq!(runner.inner.stages, vec![Stage::Outline, Stage::LowerMemrefs]);
        let leftovers: Vec<_> = std::fs::read_dir(&config.paths.output_dir).unwrap().collect();
        assert!(leftovers.is_empty());
        assert!(!results.path_for(OperatorKind::Conv2d, TransformMode::Tile).exists());
    }

    #[test]
    fn test_shell_runner_ignores_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.toolchain.container_prefix = String::new();
        for tool in [
            &mut config.toolchain.soda_opt,
            &mut config.toolchain.mlir_opt,
            &mut config.toolchain.mlir_translate,
            &mut config.toolchain.hls_script,
            &mut config.toolchain.physical_design_script,
        ] {
            *tool = "echo failing; exit 3;".to_string();
        }
        let layer = tile_layer();
        let tile = Configuration::Tile(vec![0; 7]);
        let ctx = RunContext::new("net", &layer, &tile, &config);
        let results = ResultsTable::new(&config.paths.results_dir, "net");

        let outcome = ctx.execute(&mut ShellRunner, &results).unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { reason: MetricsError::MissingCycles, .. }));
        let progress = std::fs::read_to_string(ctx.progress_log()).unwrap();
        for stage in Stage::ALL {
            assert!(progress.contains(&format!("==> {}", stage)), "stage {} did not run", stage);
        }
        assert_eq!(progress.matches("failing").count(), 7);
        assert!(progress.contains("Optimized accelerator:"));
    }

    #[test]
    fn test_dry_run_logs_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let layer = Layer::new("matmul_1", matmul(16, 16, 16), TransformMode::Unroll);
        let unroll = Configuration::Unroll { depth: 2, factor: 0 };
        let ctx = RunContext::new("net", &layer, &unroll, &config);
        let results = ResultsTable::new(&config.paths.results_dir, "net");

        let mut runner = DryRunRunner::new();
        let outcome = ctx.execute(&mut runner, &results).unwrap();

        assert_eq!(outcome.run_id(), "net_unroll_matmul_1_unroll_2_factor_0");
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(runner.commands.len(), 7);
        assert!(runner.commands[2].2.contains(UNROLL_FULL));
    }

    #[test]
    fn test_remove_artifacts_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("keep");
        std::fs::create_dir_all(nested.join("run_a_dir")).unwrap();
        std::fs::write(dir.path().join("04arun_a.mlir"), "").unwrap();
        std::fs::write(dir.path().join("04arun_b.mlir"), "").unwrap();
        std::fs::write(nested.join("bambu-run_a.log"), "").unwrap();

        assert_eq!(remove_artifacts(dir.path(), "run_a"), 3);
        assert!(dir.path().join("04arun_b.mlir").exists());
        assert!(nested.exists());
    }
}
