//! Configuration Generator
//!
//! Produces the finite set of loop-transformation configurations explored
//! for one layer. Generation only reads the layer; ordering is stable so
//! result tables from different sessions line up row by row.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::{CuratedTiles, ExplorationStrategy};
use crate::error::{DseError, Result};
use crate::layers::{Layer, LayerShape, OperatorKind, TransformMode};
use crate::{tile_size_ladder, unroll_size_ladder};

/// One explored point of the transformation space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Configuration {
    /// Loop order; `draft` names the run, `order` is what the pass receives
    Permute { draft: Vec<usize>, order: Vec<usize> },
    /// Per-dimension tile sizes; all zeros means "no tiling"
    Tile(Vec<usize>),
    /// Fully unroll `depth - 1` loops, then unroll one more by `factor`
    /// (`factor == 0` unrolls that loop fully as well)
    Unroll { depth: usize, factor: usize },
}

impl Configuration {
    pub fn mode(&self) -> TransformMode {
        match self {
            Configuration::Permute { .. } => TransformMode::Permute,
            Configuration::Tile(_) => TransformMode::Tile,
            Configuration::Unroll { .. } => TransformMode::Unroll,
        }
    }

    /// Unique identifier of the run evaluating this configuration.
    ///
    /// Every artifact and log of the run is named after it.
    pub fn run_id(&self, model: &str, layer: &str) -> String {
        match self {
            Configuration::Permute { draft, .. } => {
                format!("{}_permute_{}_{}", model, layer, draft.iter().join(""))
            }
            Configuration::Tile(tiles) => {
                format!("{}_tile_{}_{}", model, layer, tiles.iter().join("x"))
            }
            Configuration::Unroll { depth, factor } => {
                format!("{}_unroll_{}_unroll_{}_factor_{}", model, layer, depth, factor)
            }
        }
    }

    /// True when the configuration leaves the loop nest untouched
    pub fn is_baseline(&self) -> bool {
        match self {
            Configuration::Permute { order, .. } => order.iter().enumerate().all(|(i, &p)| i == p),
            Configuration::Tile(tiles) => tiles.iter().all(|&t| t == 0),
            Configuration::Unroll { depth, .. } => *depth == 0,
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Configuration::Permute { draft, order } if draft == order => {
                write!(f, "permute [{}]", order.iter().join(","))
            }
            Configuration::Permute { draft, order } => {
                write!(f, "permute [{}] (as [{}])", draft.iter().join(","), order.iter().join(","))
            }
            Configuration::Tile(tiles) => write!(f, "tile [{}]", tiles.iter().join(",")),
            Configuration::Unroll { depth, factor: 0 } => write!(f, "unroll depth {} full", depth),
            Configuration::Unroll { depth, factor } => {
                write!(f, "unroll depth {} factor {}", depth, factor)
            }
        }
    }
}

/// Translation from the draft loop order to the order the permutation pass expects.
///
/// Loaded from `<kind>_mapping.csv`, rows `"draft","actual"`. Orders without
/// an entry are used verbatim.
// TODO: drop once the permutation pass interprets permutation-map in the draft order.
#[derive(Debug, Clone, Default)]
pub struct PermutationTable {
    entries: HashMap<String, Vec<usize>>,
}

impl PermutationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapping file for an operator kind inside `dir`
    pub fn path_for(dir: &Path, kind: OperatorKind) -> PathBuf {
        dir.join(format!("{}_mapping.csv", kind))
    }

    /// Load a table; a missing file yields an empty table
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Permutation mapping {} not found, using draft orders as-is", path.display());
            return Ok(Self::new());
        }
        let text = std::fs::read_to_string(path).map_err(|e| DseError::io(path, e))?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let mut table = Self::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields = split_record(line);
            let draft = fields.first().map(|s| s.trim()).unwrap_or_default();
            let actual = fields.get(1).map(|s| s.trim()).unwrap_or_default();
            if actual.is_empty() {
                continue;
            }
            let order_of = |field: &str| {
                parse_order(field).ok_or_else(|| DseError::InvalidMapping {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: format!("'{}' is not a comma-separated loop order", field),
                })
            };
            let draft = order_of(draft)?;
            table.insert(&draft, order_of(actual)?);
        }
        debug!("Loaded {} permutation mappings from {}", table.len(), path.display());
        Ok(table)
    }

    /// Map `draft` to `actual`, replacing any earlier entry
    pub fn insert(&mut self, draft: &[usize], actual: Vec<usize>) {
        self.entries.insert(draft.iter().join(","), actual);
    }

    pub fn translate(&self, draft: &[usize]) -> Vec<usize> {
        self.entries
            .get(&draft.iter().join(","))
            .cloned()
            .unwrap_or_else(|| draft.to_vec())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_order(s: &str) -> Option<Vec<usize>> {
    s.split(',').map(|p| p.trim().parse().ok()).collect()
}

/// Split one CSV record, honouring double-quoted fields
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Builds configuration sets per layer
#[derive(Debug, Clone)]
pub struct ConfigurationGenerator {
    pub strategy: ExplorationStrategy,
    pub curated_tiles: CuratedTiles,
}

impl ConfigurationGenerator {
    pub fn new(strategy: ExplorationStrategy, curated_tiles: CuratedTiles) -> Self {
        ConfigurationGenerator { strategy, curated_tiles }
    }

    /// All configurations for `layer` in its active mode
    pub fn generate(&self, layer: &Layer, permutations: &PermutationTable) -> Vec<Configuration> {
        let configs: Vec<Configuration> = match layer.mode {
            TransformMode::Permute => Self::draft_orders(layer.kind())
                .into_iter()
                .map(|draft| {
                    let order = permutations.translate(&draft);
                    Configuration::Permute { draft, order }
                })
                .collect(),
            TransformMode::Tile => self
                .tilings(layer)
                .into_iter()
                .map(Configuration::Tile)
                .collect(),
            TransformMode::Unroll => self
                .unrollings(layer)
                .into_iter()
                .map(|(depth, factor)| Configuration::Unroll { depth, factor })
                .collect(),
        };
        debug!("{}: {} {} configurations", layer.name, configs.len(), layer.mode);
        configs
    }

    /// Hand-picked loop orders per operator kind; index 0 (batch) never moves
    pub fn draft_orders(kind: OperatorKind) -> Vec<Vec<usize>> {
        match kind {
            OperatorKind::Conv2d => vec![vec![0, 1, 2, 3, 4, 5, 6], vec![0, 2, 1, 3, 5, 6, 4]],
            OperatorKind::DepthwiseConv2d => {
                let mut orders = grouped_orders(&[1, 2, 3], &[4, 5]);
                orders.extend(grouped_orders(&[3, 4, 5], &[1, 2]));
                orders
            }
            OperatorKind::Matmul => [1, 2, 3]
                .into_iter()
                .permutations(3)
                .map(|p| std::iter::once(0).chain(p).collect())
                .collect(),
        }
    }

    fn tilings(&self, layer: &Layer) -> Vec<Vec<usize>> {
        let exhaustive = self.strategy == ExplorationStrategy::Exhaustive;
        match layer.implemented_shape() {
            LayerShape::Conv2d(_) if !exhaustive => vec![self.curated_tiles.conv2d.clone()],
            LayerShape::Matmul(_) if !exhaustive => vec![self.curated_tiles.matmul.clone()],
            LayerShape::Conv2d(c) => {
                let out_c = c.output.channel;
                let batch = c.output.batch;
                let mut tiles = Vec::new();
                for o in tile_size_ladder(c.output.height, false) {
                    for k in tile_size_ladder(c.kernel_height, true) {
                        if o < k {
                            continue;
                        }
                        for ic in tile_size_ladder(c.input.channel, false) {
                            tiles.push(vec![batch, o, o, out_c, k, k, ic]);
                        }
                    }
                }
                drop_full_extent(tiles)
            }
            LayerShape::DepthwiseConv2d(d) => {
                let batch = d.output.batch;
                let mut tiles = Vec::new();
                for o in tile_size_ladder(d.output.height, false) {
                    for k in tile_size_ladder(d.kernel_height, true) {
                        if o < k {
                            continue;
                        }
                        for ic in tile_size_ladder(d.input.channel, false) {
                            tiles.push(vec![batch, o, o, ic, k, k]);
                        }
                    }
                }
                std::iter::once(vec![0; 6]).chain(drop_full_extent(tiles)).collect()
            }
            LayerShape::Matmul(m) => {
                let tiles = tile_size_ladder(m.output.width, false)
                    .into_iter()
                    .cartesian_product(tile_size_ladder(m.output.height, false))
                    .cartesian_product(tile_size_ladder(m.kernel.width, false))
                    .map(|((w, h), k)| vec![m.output.batch, w, h, k])
                    .collect();
                std::iter::once(vec![0; 4]).chain(drop_full_extent(tiles)).collect()
            }
        }
    }

    fn unrollings(&self, layer: &Layer) -> Vec<(usize, usize)> {
        let exhaustive = self.strategy == ExplorationStrategy::Exhaustive;
        match layer.implemented_shape() {
            LayerShape::Conv2d(c) if exhaustive => {
                let kernel = unroll_size_ladder(c.kernel_height);
                unroll_grid(&[unroll_size_ladder(c.input.channel), kernel.clone(), kernel])
            }
            LayerShape::DepthwiseConv2d(d) if exhaustive => {
                let kernel = unroll_size_ladder(d.kernel_height);
                unroll_grid(&[kernel.clone(), kernel, unroll_size_ladder(d.input.channel)])
            }
            LayerShape::Matmul(m) if exhaustive => unroll_grid(&[
                unroll_size_ladder(m.kernel.width),
                unroll_size_ladder(m.output.height),
            ]),
            LayerShape::Conv2d(_) | LayerShape::DepthwiseConv2d(_) => vec![(0, 0), (3, 0)],
            LayerShape::Matmul(_) => vec![(0, 0), (2, 0)],
        }
    }
}

/// `[0] + perm(first) + perm(second)` for every pair of permutations
fn grouped_orders(first: &[usize], second: &[usize]) -> Vec<Vec<usize>> {
    let mut orders: Vec<Vec<usize>> = Vec::new();
    for head in first.iter().copied().permutations(first.len()) {
        for tail in second.iter().copied().permutations(second.len()) {
            orders.push(std::iter::once(0).chain(head.iter().copied()).chain(tail).collect());
        }
    }
    orders
}

/// The last cross-product entry tiles every loop by its full extent, i.e. no tiling
fn drop_full_extent(mut tiles: Vec<Vec<usize>>) -> Vec<Vec<usize>> {
    tiles.pop();
    tiles
}

/// `(0,0)`, then per depth `d` (1-based): `(d, f)` for each partial factor, then `(d, 0)`
fn unroll_grid(ladders: &[Vec<usize>]) -> Vec<(usize, usize)> {
    let mut combos = vec![(0, 0)];
    for (i, ladder) in ladders.iter().enumerate() {
        let depth = i + 1;
        combos.extend(ladder.iter().map(|&f| (depth, f)));
        combos.push((depth, 0));
    }
    combos
}
