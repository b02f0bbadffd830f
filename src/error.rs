//! Error types shared across the explorer.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort an exploration step (as opposed to a single failed run).
#[derive(Error, Debug)]
pub enum DseError {
    /// I/O error with the path that caused it
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// A tensor shape string from the IR could not be decoded
    #[error("Invalid tensor shape '{shape}': {reason}")]
    InvalidShape { shape: String, reason: String },

    /// A row of a permutation translation table is malformed
    #[error("Invalid permutation mapping in {path} line {line}: {reason}")]
    InvalidMapping {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// The shell for a pipeline stage could not be started
    #[error("Failed to launch stage '{stage}': {source}")]
    StageLaunch {
        stage: String,
        #[source]
        source: std::io::Error,
    },
}

impl DseError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DseError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Reasons a finished run cannot be turned into a result row.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    #[error("synthesis log has no 'Average execution' cycle count")]
    MissingCycles,

    #[error("physical-design report has no total power line")]
    MissingPower,

    #[error("physical-design report has no design area line")]
    MissingArea,

    #[error("total power is zero")]
    ZeroPower,

    /// Negative, infinite or NaN power figure
    #[error("total power {value} W is not a usable measurement")]
    InvalidPower { value: f64 },

    #[error("design area {value} um^2 is not a usable measurement")]
    InvalidArea { value: f64 },

    #[error("derived {name} is not finite")]
    NonFiniteMetric { name: &'static str },

    #[error("runtime is zero ({cycles} cycles at {frequency_hz} Hz)")]
    ZeroRuntime { cycles: u64, frequency_hz: f64 },
}

pub type Result<T> = std::result::Result<T, DseError>;
