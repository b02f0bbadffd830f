//! Results extraction
//!
//! Scrapes the high-level-synthesis log for simulated cycle counts and the
//! physical-design report for power, area and utilization, then derives
//! the performance figures recorded for each configuration.

use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::MetricsError;
use crate::layers::Layer;

/// Values scraped from tool logs; `None` when the log or the line is missing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetrics {
    /// Cycles of one clipped-kernel invocation
    pub simulation_cycles: Option<u64>,
    /// Watts
    pub total_power: Option<f64>,
    /// Square micrometers
    pub area: Option<f64>,
    /// Percent
    pub utilization: Option<f64>,
}

/// Last "Average execution" cycle count reported by the synthesis log
pub fn parse_synthesis_log(text: &str) -> Option<u64> {
    text.lines()
        .filter(|line| line.contains("Average execution"))
        .filter_map(|line| {
            line.split_whitespace()
                .find(|tok| tok.chars().all(|c| c.is_ascii_digit()))
                .and_then(|tok| tok.parse().ok())
        })
        .last()
}

/// Power, area and utilization from the physical-design report
pub fn parse_power_report(text: &str) -> (Option<f64>, Option<f64>, Option<f64>) {
    let mut power = None;
    let mut area = None;
    let mut utilization = None;

    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if line.contains("Total") && !line.contains("Group") {
            if let Some(value) = tokens.get(4).and_then(|t| t.parse().ok()) {
                power = Some(value);
            }
        }
        if line.contains("Design area") {
            if let Some(value) = tokens.get(2).and_then(|t| t.parse().ok()) {
                area = Some(value);
            }
            if let Some(value) = tokens.get(4).and_then(|t| t.trim_end_matches('%').parse().ok()) {
                utilization = Some(value);
            }
        }
    }

    (power, area, utilization)
}

impl RawMetrics {
    /// Take the cycle count from the synthesis log; a missing log clears it
    pub fn read_synthesis_log(&mut self, path: &Path) {
        self.simulation_cycles = match std::fs::read_to_string(path) {
            Ok(text) => parse_synthesis_log(&text),
            Err(e) => {
                debug!("No synthesis log at {}: {}", path.display(), e);
                None
            }
        };
    }

    /// Take power, area and utilization from the physical-design report
    pub fn read_power_report(&mut self, path: &Path) {
        let (power, area, utilization) = match std::fs::read_to_string(path) {
            Ok(text) => parse_power_report(&text),
            Err(e) => {
                debug!("No power report at {}: {}", path.display(), e);
                (None, None, None)
            }
        };
        self.total_power = power;
        self.area = area;
        self.utilization = utilization;
    }
}

/// Figures of merit for one configuration of one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    /// Cycles for the whole operator (clipped cycles times tile count)
    pub simulation_cycles: u64,
    pub total_power: f64,
    pub area: f64,
    pub utilization: Option<f64>,
    pub runtime_s: f64,
    pub throughput_gflops: f64,
    pub efficiency_gflops_per_watt: f64,
    pub energy_j: f64,
    pub flop_count: u64,
}

impl DerivedMetrics {
    /// Scale the clipped measurement up to the full layer.
    ///
    /// Any missing or zero value that would poison the division chain is an
    /// error; callers skip recording such runs.
    pub fn derive(raw: &RawMetrics, layer: &Layer, frequency_hz: f64) -> Result<Self, MetricsError> {
        let cycles = raw.simulation_cycles.ok_or(MetricsError::MissingCycles)?;
        let power = raw.total_power.ok_or(MetricsError::MissingPower)?;
        let area = raw.area.ok_or(MetricsError::MissingArea)?;

        let actual_cycles = cycles.saturating_mul(layer.tile_multiplier);
        let runtime_s = actual_cycles as f64 / frequency_hz;
        if actual_cycles == 0 || !runtime_s.is_finite() || runtime_s <= 0.0 {
            return Err(MetricsError::ZeroRuntime { cycles: actual_cycles, frequency_hz });
        }
        if power == 0.0 {
            return Err(MetricsError::ZeroPower);
        }
        if !power.is_finite() || power < 0.0 {
            return Err(MetricsError::InvalidPower { value: power });
        }
        if !area.is_finite() || area <= 0.0 {
            return Err(MetricsError::InvalidArea { value: area });
        }
        let utilization = raw.utilization.filter(|u| u.is_finite());

        let throughput_gflops = layer.flop_count as f64 / runtime_s / 1e9;
        let metrics = DerivedMetrics {
            simulation_cycles: actual_cycles,
            total_power: power,
            area,
            utilization,
            runtime_s,
            throughput_gflops,
            efficiency_gflops_per_watt: throughput_gflops / power,
            energy_j: power * runtime_s,
            flop_count: layer.flop_count,
        };
        metrics.check_finite()?;
        Ok(metrics)
    }

    fn check_finite(&self) -> Result<(), MetricsError> {
        let derived = [
            ("runtime", self.runtime_s),
            ("throughput", self.throughput_gflops),
            ("efficiency", self.efficiency_gflops_per_watt),
            ("energy", self.energy_j),
        ];
        match derived.iter().find(|(_, value)| !value.is_finite()) {
            Some((name, _)) => Err(MetricsError::NonFiniteMetric { name: *name }),
            None => Ok(()),
        }
    }
}
