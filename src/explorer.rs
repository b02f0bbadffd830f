//! Design Space Explorer
//!
//! Walks every selected layer through every generated configuration, one run
//! at a time, and collects the recorded design points. Also answers the
//! usual questions afterwards: which run is best for an objective, and
//! which runs are Pareto-optimal.

use std::collections::HashMap;
use std::fmt;

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::DseConfig;
use crate::configurations::{Configuration, ConfigurationGenerator, PermutationTable};
use crate::error::Result;
use crate::layers::{Layer, OperatorKind, TransformMode};
use crate::lowering::{kernel_dir, write_kernel};
use crate::metrics::DerivedMetrics;
use crate::pipeline::{RunContext, RunOutcome, StageRunner};
use crate::results::ResultsTable;

/// A recorded run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignPoint {
    pub run_id: String,
    pub layer: String,
    pub configuration: Configuration,
    pub metrics: DerivedMetrics,
}

/// A run that produced no row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRun {
    pub run_id: String,
    pub layer: String,
    pub configuration: Configuration,
    pub reason: String,
}

/// Everything one exploration session produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationSummary {
    pub model: String,
    pub mode: TransformMode,
    pub layers: usize,
    pub recorded: Vec<DesignPoint>,
    pub failed: Vec<FailedRun>,
}

impl ExplorationSummary {
    pub fn new(model: impl Into<String>, mode: TransformMode) -> Self {
        ExplorationSummary {
            model: model.into(),
            mode,
            layers: 0,
            recorded: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn push(&mut self, layer: &Layer, configuration: &Configuration, outcome: RunOutcome) {
        match outcome {
            RunOutcome::Recorded { run_id, metrics, .. } => self.recorded.push(DesignPoint {
                run_id,
                layer: layer.name.clone(),
                configuration: configuration.clone(),
                metrics,
            }),
            RunOutcome::Failed { run_id, reason } => self.failed.push(FailedRun {
                run_id,
                layer: layer.name.clone(),
                configuration: configuration.clone(),
                reason: reason.to_string(),
            }),
        }
    }

    pub fn total_runs(&self) -> usize {
        self.recorded.len() + self.failed.len()
    }

    /// Find best recorded run for a specific objective
    pub fn find_best(&self, objective: Objective) -> Option<&DesignPoint> {
        self.recorded.iter().max_by(|a, b| {
            let score_a = objective.score(&a.metrics);
            let score_b = objective.score(&b.metrics);
            score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// Best run per layer, in the order layers were explored
    pub fn best_per_layer(&self, objective: Objective) -> Vec<&DesignPoint> {
        let mut order: Vec<&str> = Vec::new();
        let mut best: HashMap<&str, &DesignPoint> = HashMap::new();
        for point in &self.recorded {
            let layer = point.layer.as_str();
            let better = match best.get(layer) {
                None => {
                    order.push(layer);
                    true
                }
                Some(current) => objective.score(&point.metrics) > objective.score(&current.metrics),
            };
            if better {
                best.insert(layer, point);
            }
        }
        order.into_iter().filter_map(|l| best.get(l).copied()).collect()
    }

    pub fn pareto_frontier(&self) -> ParetoFrontier {
        ParetoFrontier::compute(self.recorded.clone())
    }
}

/// Pareto frontier of recorded runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParetoFrontier {
    pub points: Vec<DesignPoint>,
    pub dominated: Vec<DesignPoint>,
}

impl ParetoFrontier {
    /// A dominates B: no worse anywhere, strictly better somewhere
    fn dominates(a: &DerivedMetrics, b: &DerivedMetrics) -> bool {
        let all_better_or_equal = a.throughput_gflops >= b.throughput_gflops
            && a.efficiency_gflops_per_watt >= b.efficiency_gflops_per_watt
            && a.area <= b.area
            && a.total_power <= b.total_power;

        let strictly_better = a.throughput_gflops > b.throughput_gflops
            || a.efficiency_gflops_per_watt > b.efficiency_gflops_per_watt
            || a.area < b.area
            || a.total_power < b.total_power;

        all_better_or_equal && strictly_better
    }

    pub fn compute(points: Vec<DesignPoint>) -> Self {
        let mut frontier: Vec<DesignPoint> = Vec::new();
        let mut dominated = Vec::new();

        for point in points {
            if frontier.iter().any(|f| Self::dominates(&f.metrics, &point.metrics)) {
                dominated.push(point);
                continue;
            }
            let (beaten, kept): (Vec<_>, Vec<_>) = frontier
                .into_iter()
                .partition(|f| Self::dominates(&point.metrics, &f.metrics));
            dominated.extend(beaten);
            frontier = kept;
            frontier.push(point);
        }

        ParetoFrontier { points: frontier, dominated }
    }
}

/// Optimization objectives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    MaxThroughput,
    MaxEfficiency,
    MinArea,
    MinPower,
    MinEnergy,
}

impl Objective {
    pub const ALL: [Objective; 5] = [
        Objective::MaxThroughput,
        Objective::MaxEfficiency,
        Objective::MinArea,
        Objective::MinPower,
        Objective::MinEnergy,
    ];

    /// Higher is better
    pub fn score(&self, metrics: &DerivedMetrics) -> f64 {
        match self {
            Objective::MaxThroughput => metrics.throughput_gflops,
            Objective::MaxEfficiency => metrics.efficiency_gflops_per_watt,
            Objective::MinArea => -metrics.area,
            Objective::MinPower => -metrics.total_power,
            Objective::MinEnergy => -metrics.energy_j,
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Objective::MaxThroughput => "max throughput",
            Objective::MaxEfficiency => "max efficiency",
            Objective::MinArea => "min area",
            Objective::MinPower => "min power",
            Objective::MinEnergy => "min energy",
        };
        f.write_str(name)
    }
}

/// Design space exploration engine
pub struct DesignExplorer<R: StageRunner> {
    pub config: DseConfig,
    pub model: String,
    pub mode: TransformMode,
    runner: R,
    generator: ConfigurationGenerator,
    permutations: HashMap<OperatorKind, PermutationTable>,
    results: ResultsTable,
}

impl<R: StageRunner> DesignExplorer<R> {
    pub fn new(config: DseConfig, model: impl Into<String>, mode: TransformMode, runner: R) -> Self {
        let model = model.into();
        let generator = ConfigurationGenerator::new(
            config.exploration.strategy,
            config.exploration.curated_tiles.clone(),
        );
        let results = ResultsTable::new(&config.paths.results_dir, &model);
        DesignExplorer {
            config,
            model,
            mode,
            runner,
            generator,
            permutations: HashMap::new(),
            results,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn results(&self) -> &ResultsTable {
        &self.results
    }

    /// Configurations for one layer; permutation tables are loaded on first use
    pub fn configurations_for(&mut self, layer: &Layer) -> Result<Vec<Configuration>> {
        let kind = layer.kind();
        if self.mode == TransformMode::Permute && !self.permutations.contains_key(&kind) {
            let path = PermutationTable::path_for(&self.config.paths.mapping_dir, kind);
            self.permutations.insert(kind, PermutationTable::load(&path)?);
        }
        let empty = PermutationTable::new();
        let table = self.permutations.get(&kind).unwrap_or(&empty);
        Ok(self.generator.generate(layer, table))
    }

    /// Configurations per layer without running anything
    pub fn plan(&mut self, layers: &[Layer]) -> Result<Vec<(Layer, Vec<Configuration>)>> {
        let mut planned = Vec::with_capacity(layers.len());
        for layer in layers {
            let layer = self.align_mode(layer.clone());
            let configurations = self.configurations_for(&layer)?;
            planned.push((layer, configurations));
        }
        Ok(planned)
    }

    /// Layers carry clipping for the mode they were scanned with
    fn align_mode(&self, layer: Layer) -> Layer {
        if layer.mode == self.mode {
            layer
        } else {
            let mut aligned = Layer::new(layer.name, layer.shape, self.mode);
            aligned.file_path = layer.file_path;
            aligned
        }
    }

    pub fn explore(&mut self, layers: Vec<Layer>) -> Result<ExplorationSummary> {
        self.explore_with_progress(layers, |_, _, _| {})
    }

    /// Explore with progress callback `(done, total, outcome)`
    pub fn explore_with_progress<F>(&mut self, layers: Vec<Layer>, mut callback: F) -> Result<ExplorationSummary>
    where
        F: FnMut(usize, usize, &RunOutcome),
    {
        let kernels = kernel_dir(&self.config.paths.layers_dir_prefix, &self.model, self.mode);
        let mut planned = self.plan(&layers)?;
        for (layer, _) in planned.iter_mut() {
            write_kernel(layer, &kernels)?;
        }

        let total: usize = planned.iter().map(|(_, configs)| configs.len()).sum();
        info!(
            "Exploring {} layers of {} in {} mode: {} runs",
            planned.len(), self.model, self.mode, total
        );

        let mut summary = ExplorationSummary::new(&self.model, self.mode);
        summary.layers = planned.len();
        let mut done = 0;
        for (layer, configurations) in &planned {
            info!("{}", layer.summary());
            for configuration in configurations {
                let ctx = RunContext::new(&self.model, layer, configuration, &self.config);
                let outcome = ctx.execute(&mut self.runner, &self.results)?;
                done += 1;
                callback(done, total, &outcome);
                summary.push(layer, configuration, outcome);
            }
        }

        info!(
            "Finished {}: {} recorded, {} failed",
            self.model, summary.recorded.len(), summary.failed.len()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::{conv, matmul};
    use crate::layers::Nhwc;
    use crate::pipeline::tests::{test_config, ScriptedRunner};
    use crate::pipeline::Stage;

    fn point(run_id: &str, layer: &str, gflops: f64, efficiency: f64, area: f64, power: f64) -> DesignPoint {
        DesignPoint {
            run_id: run_id.to_string(),
            layer: layer.to_string(),
            configuration: Configuration::Tile(vec![0; 4]),
            metrics: DerivedMetrics {
                simulation_cycles: 1000,
                total_power: power,
                area,
                utilization: None,
                runtime_s: 1e-5,
                throughput_gflops: gflops,
                efficiency_gflops_per_watt: efficiency,
                energy_j: power * 1e-5,
                flop_count: 1000,
            },
        }
    }

    fn layers(mode: TransformMode) -> Vec<Layer> {
        vec![
            Layer::new("conv2d_1", conv(Nhwc::new(1, 56, 56, 256), (3, 3), Nhwc::new(1, 56, 56, 1)), mode),
            Layer::new("matmul_1", matmul(64, 64, 64), mode),
        ]
    }

    #[test]
    fn test_pareto_frontier() {
        let points = vec![
            point("a", "l", 10.0, 100.0, 50.0, 0.1),
            point("b", "l", 5.0, 50.0, 60.0, 0.1),
            point("c", "l", 20.0, 80.0, 40.0, 0.25),
        ];
        let frontier = ParetoFrontier::compute(points);
        let ids: Vec<&str> = frontier.points.iter().map(|p| p.run_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(frontier.dominated.len(), 1);
        assert_eq!(frontier.dominated[0].run_id, "b");
    }

    #[test]
    fn test_find_best_and_per_layer() {
        let mut summary = ExplorationSummary::new("net", TransformMode::Tile);
        summary.recorded = vec![
            point("a", "conv2d_1", 10.0, 100.0, 50.0, 0.1),
            point("b", "conv2d_1", 30.0, 60.0, 70.0, 0.5),
            point("c", "matmul_1", 20.0, 80.0, 40.0, 0.25),
        ];

        assert_eq!(summary.find_best(Objective::MaxThroughput).unwrap().run_id, "b");
        assert_eq!(summary.find_best(Objective::MinArea).unwrap().run_id, "c");
        assert_eq!(summary.find_best(Objective::MinPower).unwrap().run_id, "a");

        let best: Vec<&str> = summary
            .best_per_layer(Objective::MaxEfficiency)
            .iter()
            .map(|p| p.run_id.as_str())
            .collect();
        assert_eq!(best, vec!["a", "c"]);

        assert!(ExplorationSummary::new("net", TransformMode::Tile).find_best(Objective::MinEnergy).is_none());
    }

    #[test]
    fn test_explore_records_every_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runner = ScriptedRunner { cycles: Some(1000), stages: Vec::new() };
        let mut explorer = DesignExplorer::new(config, "net", TransformMode::Tile, runner);

        let mut progress = Vec::new();
        let summary = explorer
            .explore_with_progress(layers(TransformMode::Tile), |done, total, _| progress.push((done, total)))
            .unwrap();

        // curated: one tiling per kind
        assert_eq!(summary.layers, 2);
        assert_eq!(summary.recorded.len(), 2);
        assert!(summary.failed.is_empty());
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
        assert_eq!(explorer.runner().stages.len(), 2 * Stage::ALL.len());

        let conv_table = explorer.results().path_for(OperatorKind::Conv2d, TransformMode::Tile);
        assert_eq!(ResultsTable::rows(&conv_table).unwrap().len(), 1);
        let kernel = dir.path().join("layers_net_tile").join("matmul_1.mlir");
        assert!(kernel.exists());
    }

    #[test]
    fn test_failed_runs_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runner = ScriptedRunner { cycles: None, stages: Vec::new() };
        let mut explorer = DesignExplorer::new(config, "net", TransformMode::Unroll, runner);

        // scanned for tile, explored for unroll: clipping is re-derived
        let summary = explorer.explore(layers(TransformMode::Tile)).unwrap();
        assert!(summary.recorded.is_empty());
        assert_eq!(summary.failed.len(), 4);
        assert!(summary.failed.iter().all(|f| f.reason.contains("Average execution")));
        assert_eq!(summary.total_runs(), 4);
        assert!(!explorer.results().path_for(OperatorKind::Matmul, TransformMode::Unroll).exists());
    }

    #[test]
    fn test_permutation_plan_uses_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.paths.mapping_dir).unwrap();
        std::fs::write(
            config.paths.mapping_dir.join("matmul_mapping.csv"),
            "\"0,1,2,3\",\"0,3,2,1\"\n",
        )
        .unwrap();

        let mut explorer = DesignExplorer::new(config, "net", TransformMode::Permute, ScriptedRunner {
            cycles: Some(1),
            stages: Vec::new(),
        });
        let plan = explorer.plan(&layers(TransformMode::Permute)).unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].1.len(), 2);
        assert_eq!(
            plan[1].1[0],
            Configuration::Permute { draft: vec![0, 1, 2, 3], order: vec![0, 3, 2, 1] }
        );
        assert_eq!(plan[1].1[0].run_id("net", &plan[1].0.name), "net_permute_matmul_1_0123");
    }
}
