//! Accelerator Design-Space Explorer - Command Line Interface
//!
//! Usage:
//!   accel-dse explore [OPTIONS]       Run every configuration through the HLS flow
//!   accel-dse layers [OPTIONS]        List extracted layers and their clipping
//!   accel-dse configs [OPTIONS]       List generated configurations without running
//!   accel-dse init-config [OPTIONS]   Write the default configuration

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use colored::*;

use accel_dse::frontend::{model_name, read_ir};
use accel_dse::prelude::*;

#[derive(Parser)]
#[command(name = "accel-dse")]
#[command(about = "Design-space exploration of loop transformations for HLS tensor-operator accelerators")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output results in JSON format (for machine parsing)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Input model, operator kinds, mode and layer selection
#[derive(Args)]
struct LayerArgs {
    /// linalg-level IR file to scan
    #[arg(long)]
    read_mlir: PathBuf,

    /// Loop transformation to explore
    #[arg(long, value_enum)]
    mode: TransformMode,

    /// Explore conv_2d_nhwc_hwcf layers
    #[arg(long)]
    conv2d: bool,

    /// Explore depthwise convolution layers
    #[arg(long)]
    depthwise_conv2d: bool,

    /// Explore batch_matmul layers
    #[arg(long)]
    matmul: bool,

    /// First layer ordinal to explore
    #[arg(long, conflicts_with = "select_layer")]
    start_layer: Option<usize>,

    /// Last layer ordinal to explore (inclusive)
    #[arg(long, requires = "start_layer")]
    end_layer: Option<usize>,

    /// Explore a single layer ordinal
    #[arg(long)]
    select_layer: Option<usize>,

    /// Curated or exhaustive configuration sets
    #[arg(long, value_enum)]
    strategy: Option<ExplorationStrategy>,
}

impl LayerArgs {
    fn kinds(&self) -> Vec<OperatorKind> {
        let flagged: Vec<OperatorKind> = [
            (self.conv2d, OperatorKind::Conv2d),
            (self.depthwise_conv2d, OperatorKind::DepthwiseConv2d),
            (self.matmul, OperatorKind::Matmul),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .map(|(_, kind)| kind)
        .collect();
        if flagged.is_empty() {
            OperatorKind::ALL.to_vec()
        } else {
            flagged
        }
    }

    fn selection(&self) -> LayerSelection {
        match (self.select_layer, self.start_layer) {
            (Some(n), _) => LayerSelection::Single(n),
            (None, Some(start)) => LayerSelection::Range { start, end: self.end_layer },
            (None, None) => LayerSelection::All,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Explore every configuration of every selected layer
    Explore {
        #[command(flatten)]
        layers: LayerArgs,

        /// Target clock frequency in Hz
        #[arg(long)]
        frequency: Option<f64>,

        /// Keep per-run artifacts instead of deleting them
        #[arg(long)]
        keep_artifacts: bool,

        /// Log stage commands without executing them
        #[arg(long)]
        dry_run: bool,

        /// Output Pareto frontier only
        #[arg(short, long)]
        pareto_only: bool,
    },

    /// List extracted layers with clipping and tile counts
    Layers {
        #[command(flatten)]
        layers: LayerArgs,
    },

    /// List generated configurations and run ids per layer
    Configs {
        #[command(flatten)]
        layers: LayerArgs,
    },

    /// Write the default configuration to a TOML file
    InitConfig {
        #[arg(short, long, default_value = "dse.toml")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let json_output = cli.json;

    let mut config = match &cli.config {
        Some(path) => DseConfig::load(path).unwrap_or_else(|e| fail(json_output, &e.to_string())),
        None => DseConfig::default(),
    };

    match cli.command {
        Commands::Explore { layers, frequency, keep_artifacts, dry_run, pareto_only } => {
            if let Some(hz) = frequency {
                config.exploration.target_frequency_hz = hz;
            }
            if keep_artifacts {
                config.exploration.keep_artifacts = true;
            }
            run_exploration(config, &layers, dry_run, pareto_only, json_output);
        }
        Commands::Layers { layers } => show_layers(&config, &layers, json_output),
        Commands::Configs { layers } => show_configurations(config, &layers, json_output),
        Commands::InitConfig { output } => write_default_config(&output, json_output),
    }
}

fn fail(json_output: bool, message: &str) -> ! {
    if json_output {
        eprintln!("{}", serde_json::json!({ "error": message }));
    } else {
        eprintln!("{}: {}", "Error".red(), message);
    }
    std::process::exit(1);
}

fn banner(title: &str) {
    println!("{}", "╔══════════════════════════════════════════════════════════════╗".cyan());
    println!("{}", format!("║  {:<60}║", title).cyan());
    println!("{}", "╚══════════════════════════════════════════════════════════════╝".cyan());
    println!();
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => fail(true, &e.to_string()),
    }
}

/// Scan, select and mode-tag the layers named on the command line
fn load_layers(config: &mut DseConfig, args: &LayerArgs, json_output: bool) -> (String, Vec<Layer>) {
    if let Some(strategy) = args.strategy {
        config.exploration.strategy = strategy;
    }
    let layers = read_ir(&args.read_mlir, &args.kinds(), args.mode)
        .unwrap_or_else(|e| fail(json_output, &e.to_string()));
    (model_name(&args.read_mlir), args.selection().apply(layers))
}

fn run_exploration(mut config: DseConfig, args: &LayerArgs, dry_run: bool, pareto_only: bool, json_output: bool) {
    if !json_output {
        banner("Accelerator Design Space Exploration");
    }

    let (model, layers) = load_layers(&mut config, args, json_output);
    if !json_output {
        println!("Configuration:");
        println!("  • Model: {}", model);
        println!("  • Mode: {}", args.mode);
        println!("  • Strategy: {:?}", config.exploration.strategy);
        println!("  • Layers: {}", layers.len());
        println!("  • Target frequency: {:.0} MHz", config.exploration.target_frequency_hz / 1e6);
        if dry_run {
            println!("  • {}", "Dry run: commands are logged, not executed".yellow());
        }
        println!();
    }

    let summary = if dry_run {
        explore(DesignExplorer::new(config, &model, args.mode, DryRunRunner::new()), layers, json_output)
    } else {
        explore(DesignExplorer::new(config, &model, args.mode, ShellRunner), layers, json_output)
    };

    report_summary(&summary, pareto_only, json_output);
}

fn explore<R: StageRunner>(mut explorer: DesignExplorer<R>, layers: Vec<Layer>, json_output: bool) -> ExplorationSummary {
    let result = if json_output {
        explorer.explore(layers)
    } else {
        explorer.explore_with_progress(layers, |current, total, outcome| {
            let status = match outcome {
                RunOutcome::Recorded { .. } => "recorded".green(),
                RunOutcome::Failed { .. } => "failed".red(),
            };
            print!("\rProgress: {}/{} ({:.1}%) {} {}   ", current, total,
                   100.0 * current as f64 / total as f64, outcome.run_id(), status);
            let _ = std::io::stdout().flush();
        })
    };
    if !json_output {
        println!();
    }
    result.unwrap_or_else(|e| fail(json_output, &e.to_string()))
}

#[derive(serde::Serialize)]
struct ExplorationOutput<'a> {
    summary: &'a ExplorationSummary,
    pareto: ParetoFrontier,
    best_per_layer: Vec<&'a DesignPoint>,
}

fn report_summary(summary: &ExplorationSummary, pareto_only: bool, json_output: bool) {
    let frontier = summary.pareto_frontier();

    if json_output {
        print_json(&ExplorationOutput {
            summary,
            pareto: frontier,
            best_per_layer: summary.best_per_layer(Objective::MaxThroughput),
        });
        return;
    }

    println!();
    println!("Runs: {} total, {} recorded, {} failed",
             summary.total_runs(), summary.recorded.len(), summary.failed.len());
    println!();
    println!("{}", "PARETO-OPTIMAL DESIGNS".green());
    println!("════════════════════════════════════════════════════════════════════════════════════");
    println!("{:<44} {:>12} {:>12} {:>12} {:>10}",
             "Run", "GFLOPS", "GFLOPS/W", "Area (um²)", "Power (W)");
    println!("────────────────────────────────────────────────────────────────────────────────────");
    for point in &frontier.points {
        print_point(point);
    }

    if !pareto_only && !frontier.dominated.is_empty() {
        println!();
        println!("{}", "DOMINATED DESIGNS".yellow());
        println!("────────────────────────────────────────────────────────────────────────────────────");
        for point in frontier.dominated.iter().take(10) {
            print_point(point);
        }
        if frontier.dominated.len() > 10 {
            println!("... and {} more", frontier.dominated.len() - 10);
        }
    }

    println!();
    println!("{}", "BEST DESIGNS BY OBJECTIVE".cyan());
    println!("────────────────────────────────────────────────────────────────────────────────────");
    for objective in Objective::ALL {
        if let Some(best) = summary.find_best(objective) {
            println!("{:<16} {} ({:.3} GFLOPS, {:.3e} J)", format!("{}:", objective),
                     best.run_id, best.metrics.throughput_gflops, best.metrics.energy_j);
        }
    }

    if !pareto_only && summary.layers > 1 {
        println!();
        println!("{}", "BEST DESIGN PER LAYER (max throughput)".cyan());
        println!("────────────────────────────────────────────────────────────────────────────────────");
        for point in summary.best_per_layer(Objective::MaxThroughput) {
            println!("{:<20} {}", point.layer, point.run_id);
            print_point(point);
        }
    }

    if !pareto_only && !summary.failed.is_empty() {
        println!();
        println!("{}", "FAILED RUNS".red());
        println!("────────────────────────────────────────────────────────────────────────────────────");
        for failed in summary.failed.iter().take(10) {
            println!("{}: {}", failed.run_id, failed.reason);
        }
        if summary.failed.len() > 10 {
            println!("... and {} more", summary.failed.len() - 10);
        }
    }
}

fn print_point(point: &DesignPoint) {
    println!("{:<44} {:>12.3} {:>12.3} {:>12.1} {:>10.4}",
             point.run_id,
             point.metrics.throughput_gflops,
             point.metrics.efficiency_gflops_per_watt,
             point.metrics.area,
             point.metrics.total_power);
}

fn show_layers(config: &DseConfig, args: &LayerArgs, json_output: bool) {
    let mut config = config.clone();
    let (model, layers) = load_layers(&mut config, args, json_output);

    if json_output {
        print_json(&layers);
        return;
    }

    banner(&format!("Layers of {} ({} mode)", model, args.mode));
    for layer in &layers {
        println!("{}", layer.name.green());
        println!("  {}", layer.summary());
        let clip = &layer.clipping;
        let clipped: Vec<String> = [
            ("output channel", clip.output_channel),
            ("input channel", clip.input_channel),
            ("output width", clip.output_width),
            ("output height", clip.output_height),
            ("kernel width", clip.kernel_width),
        ]
        .iter()
        .filter_map(|(name, value)| value.map(|v| format!("{} → {}", name, v)))
        .collect();
        if clipped.is_empty() {
            println!("  clipping: none");
        } else {
            println!("  clipping: {}", clipped.join(", "));
        }
        println!("  tiles: {}  FLOPs: {}", layer.tile_multiplier, layer.flop_count);
    }
}

#[derive(serde::Serialize)]
struct PlannedRun {
    run_id: String,
    configuration: Configuration,
}

#[derive(serde::Serialize)]
struct LayerPlan {
    layer: String,
    runs: Vec<PlannedRun>,
}

fn show_configurations(mut config: DseConfig, args: &LayerArgs, json_output: bool) {
    let (model, layers) = load_layers(&mut config, args, json_output);
    let mut explorer = DesignExplorer::new(config, &model, args.mode, DryRunRunner::new());
    let planned = explorer.plan(&layers).unwrap_or_else(|e| fail(json_output, &e.to_string()));

    let plans: Vec<LayerPlan> = planned
        .iter()
        .map(|(layer, configurations)| LayerPlan {
            layer: layer.name.clone(),
            runs: configurations
                .iter()
                .map(|c| PlannedRun { run_id: c.run_id(&model, &layer.name), configuration: c.clone() })
                .collect(),
        })
        .collect();

    if json_output {
        print_json(&plans);
        return;
    }

    banner(&format!("Configurations of {} ({} mode)", model, args.mode));
    let total: usize = plans.iter().map(|p| p.runs.len()).sum();
    for plan in &plans {
        println!("{} ({} configurations)", plan.layer.green(), plan.runs.len());
        for run in &plan.runs {
            let marker = if run.configuration.is_baseline() { " (baseline)" } else { "" };
            println!("  {:<56} {}{}", run.run_id, run.configuration, marker);
        }
    }
    println!();
    println!("Total: {} runs", total);
}

fn write_default_config(path: &Path, json_output: bool) {
    if let Err(e) = DseConfig::default().save(path) {
        fail(json_output, &e.to_string());
    }
    if json_output {
        println!("{}", serde_json::json!({ "written": path.display().to_string() }));
    } else {
        println!("{} {}", "Wrote default configuration to".green(), path.display());
    }
}
