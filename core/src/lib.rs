//! Revenue intelligence core.
//!
//! Normalized records from billing and CRM connectors go through three
//! stages:
//!   resolution  - blocking, pairwise scoring, clustering, canonical entities
//!   metrics     - a DAG of metric definitions evaluated per tenant and month
//!   detection   - z-score and rate-of-change anomalies over metric series
//!
//! `engine::RevenuePipeline` drives all three; `invocation` exposes each
//! stage as a JSON tool; `store` persists finished runs to SQLite.

pub mod types;
pub mod error;
pub mod config;
pub mod normalize;
pub mod record;

// Resolution
pub mod blocking;
pub mod scoring;
pub mod clustering;
pub mod canonical;
pub mod resolver;

// Metrics
pub mod ontology;
pub mod metric_engine;

// Detection
pub mod anomaly_detector;

pub mod event;
pub mod engine;
pub mod store;
pub mod invocation;

// Synthetic data
pub mod rng;
pub mod name_generator;
pub mod synthetic;

pub use config::PipelineConfig;
pub use engine::{CancellationToken, PipelineReport, RevenuePipeline};
pub use error::{ConfigError, PipelineError, PipelineResult, Stage};
pub use record::{EntityType, NormalizedRecord};
pub use types::Period;
