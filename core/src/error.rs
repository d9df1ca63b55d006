use std::fmt;

use thiserror::Error;

/// Load-time configuration failures. Always reported before any record
/// is processed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Match weights must sum to 1.0, got {sum:.6}")]
    WeightSum { sum: f64 },

    #[error("Match weight '{dimension}' must lie in [0, 1], got {value}")]
    WeightOutOfRange { dimension: &'static str, value: f64 },

    #[error("Threshold '{name}' must lie in [0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },

    #[error("Invalid setting '{name}': {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("Duplicate metric '{metric_id}' in ontology")]
    DuplicateMetric { metric_id: String },

    #[error("Metric '{metric_id}' uses unknown formula kind '{kind}'")]
    UnknownFormulaKind { metric_id: String, kind: String },

    #[error("Metric '{metric_id}' has an invalid formula: {reason}")]
    InvalidFormula { metric_id: String, reason: String },

    #[error("Metric '{metric_id}' references unknown input '{input}'")]
    UnknownInput { metric_id: String, input: String },

    #[error("Ontology contains a cycle: {}", cycle.join(" -> "))]
    CyclicOntology { cycle: Vec<String> },

    #[error("Cannot parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },
}

/// The pipeline stage an invocation failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolution,
    Metrics,
    Detection,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolution => write!(f, "resolution"),
            Self::Metrics    => write!(f, "metrics"),
            Self::Detection  => write!(f, "detection"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid record #{index} ('{record_key}') in {stage} stage: {reason}")]
    InvalidRecord {
        stage:      Stage,
        index:      usize,
        record_key: String,
        reason:     String,
    },

    #[error("Unknown metric '{metric_id}' in {stage} stage")]
    UnknownMetric { stage: Stage, metric_id: String },

    #[error("Metric '{metric_id}' failed in {stage} stage: {reason}")]
    MetricFailed {
        stage:     Stage,
        metric_id: String,
        reason:    String,
    },

    #[error("Pipeline cancelled before {stage} stage completed")]
    Cancelled { stage: Stage },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// The stage that failed, when the failure is attributable to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::InvalidRecord { stage, .. }
            | Self::UnknownMetric { stage, .. }
            | Self::MetricFailed { stage, .. }
            | Self::Cancelled { stage } => Some(*stage),
            _ => None,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
