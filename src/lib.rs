//! Accelerator Design-Space Explorer
//!
//! Explores loop transformations (permutation, tiling, unrolling) of tensor
//! operators extracted from a linalg-level IR, pushing every configuration
//! through an external HLS + physical-design flow and recording
//! performance/power/area for comparison.
//!
//! # Overview
//!
//! For each operator instance the explorer:
//! - derives a hardware-aware clipping of the operator's tensor shapes
//!   (how much of the tensor one accelerator instance implements, and how many
//!   sequential invocations cover the full tensor)
//! - enumerates a bounded set of loop-transformation configurations
//! - runs each configuration through the external tool stages, strictly
//!   sequentially
//! - scrapes cycles, power and area from the tool logs and extrapolates them
//!   to the full tensor
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use accel_dse::prelude::*;
//!
//! let config = DseConfig::default();
//! let text = std::fs::read_to_string("resnet.mlir").unwrap();
//! let layers = scan_ir(&text, &OperatorKind::ALL, TransformMode::Tile).unwrap();
//!
//! let mut explorer = DesignExplorer::new(config, "resnet", TransformMode::Tile, ShellRunner);
//! let summary = explorer.explore(layers).unwrap();
//!
//! if let Some(best) = summary.find_best(Objective::MaxThroughput) {
//!     println!("{}: {:.2} GFLOPS", best.run_id, best.metrics.throughput_gflops);
//! }
//! ```
//!
//! # Pipeline
//!
//! ```text
//! outline → lower-memrefs → optimize(mode) → dce → translate → HLS → physical design
//!                                                               ↓            ↓
//!                                                            cycles     power, area
//! ```

pub mod config;
pub mod configurations;
pub mod error;
pub mod explorer;
pub mod frontend;
pub mod layers;
pub mod lowering;
pub mod metrics;
pub mod pipeline;
pub mod results;

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::config::{DseConfig, ExplorationConfig, ExplorationStrategy, PathsConfig,
                           ToolchainConfig, CuratedTiles};
    pub use crate::configurations::{Configuration, ConfigurationGenerator, PermutationTable};
    pub use crate::error::{DseError, MetricsError};
    pub use crate::explorer::{DesignExplorer, DesignPoint, ExplorationSummary, FailedRun,
                             Objective, ParetoFrontier};
    pub use crate::frontend::{scan_ir, LayerSelection};
    pub use crate::layers::{Clipping, Conv2d, DepthwiseConv2d, Layer, LayerShape, Matmul,
                           Nhwc, OperatorKind, TransformMode, Extent3};
    pub use crate::lowering::write_kernel;
    pub use crate::metrics::{DerivedMetrics, RawMetrics};
    pub use crate::pipeline::{DryRunRunner, RunContext, RunOutcome, ShellRunner, Stage,
                             StageRunner};
    pub use crate::results::{ResultRecord, ResultsTable};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest divisor of `n` that does not exceed `cap`.
///
/// 1 divides everything, so for `cap >= 1` this always has an answer.
/// `n == 0` has no meaningful divisor and yields 0.
pub fn largest_divisor_at_most(n: usize, cap: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let cap = cap.clamp(1, n);
    (1..=cap).rev().find(|d| n % d == 0).unwrap_or(1)
}

/// Candidate tile sizes for one dimension.
///
/// Kernel dimensions get every odd size from 3 up to `max_extent`; other
/// dimensions get powers of two from 4 below `max_extent`. Both always end
/// with `max_extent` itself.
pub fn tile_size_ladder(max_extent: usize, is_kernel_dim: bool) -> Vec<usize> {
    if max_extent == 0 {
        return Vec::new();
    }
    let mut sizes: Vec<usize> = if is_kernel_dim {
        (3..=max_extent).step_by(2).collect()
    } else {
        powers_of_two_below(max_extent)
    };
    if !sizes.contains(&max_extent) {
        sizes.push(max_extent);
    }
    sizes
}

/// Candidate partial-unroll factors: powers of two from 4, excluding `max_extent`.
pub fn unroll_size_ladder(max_extent: usize) -> Vec<usize> {
    powers_of_two_below(max_extent)
}

fn powers_of_two_below(limit: usize) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut p = 4;
    while p < limit {
        sizes.push(p);
        p *= 2;
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_largest_divisor() {
        assert_eq!(largest_divisor_at_most(256, 8), 8);
        assert_eq!(largest_divisor_at_most(96, 32), 32);
        assert_eq!(largest_divisor_at_most(960, 128), 120);
        assert_eq!(largest_divisor_at_most(7, 4), 1);
        assert_eq!(largest_divisor_at_most(12, 100), 12);
        assert_eq!(largest_divisor_at_most(12, 0), 1);
    }

    #[test]
    fn test_divisor_always_divides() {
        for n in 1..300 {
            for cap in [1, 4, 8, 32, 128] {
                let d = largest_divisor_at_most(n, cap);
                assert!(d <= cap && d <= n);
                assert_eq!(n % d, 0);
            }
        }
    }

    #[test]
    fn test_tile_ladders() {
        assert_eq!(tile_size_ladder(128, false), vec![4, 8, 16, 32, 64, 128]);
        assert_eq!(tile_size_ladder(56, false), vec![4, 8, 16, 32, 56]);
        assert_eq!(tile_size_ladder(7, true), vec![3, 5, 7]);
        assert_eq!(tile_size_ladder(4, true), vec![3, 4]);
        assert_eq!(tile_size_ladder(1, true), vec![1]);
        assert_eq!(tile_size_ladder(2, false), vec![2]);
    }

    #[test]
    fn test_unroll_ladder() {
        assert_eq!(unroll_size_ladder(16), vec![4, 8]);
        assert_eq!(unroll_size_ladder(17), vec![4, 8, 16]);
        assert!(unroll_size_ladder(3).is_empty());
    }
}
