//! Stage events: the run log of one pipeline invocation.
//!
//! RULE: events are emitted only after a stage completes. A cancelled or
//! failed run never publishes the events of a half-finished stage.

use crate::types::{Period, RunId, TenantId};
use serde::{Deserialize, Serialize};

/// Every event a pipeline run emits, in emission order.
/// Variants are added over time, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id:    RunId,
        tenant_id: TenantId,
        records:   usize,
        periods:   usize,
    },
    SnapshotResolved {
        period:         Period,
        records:        usize,
        entities:       usize,
        accepted_pairs: usize,
        review_pairs:   usize,
    },
    MetricsComputed {
        period:   Period,
        values:   usize,
        warnings: usize,
    },
    AnomaliesDetected {
        series:    usize,
        anomalies: usize,
    },
    RunCompleted {
        run_id:        RunId,
        entities:      usize,
        metric_values: usize,
        anomalies:     usize,
    },
}

impl PipelineEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. }        => "run_started",
            Self::SnapshotResolved { .. }  => "snapshot_resolved",
            Self::MetricsComputed { .. }   => "metrics_computed",
            Self::AnomaliesDetected { .. } => "anomalies_detected",
            Self::RunCompleted { .. }      => "run_completed",
        }
    }

    /// The stage that emitted the event.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } | Self::RunCompleted { .. } => "pipeline",
            Self::SnapshotResolved { .. }  => "resolution",
            Self::MetricsComputed { .. }   => "metrics",
            Self::AnomaliesDetected { .. } => "detection",
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub run_id:     RunId,
    pub seq:        u32,
    pub stage:      String,
    pub event_type: String,
    pub payload:    String, // JSON-serialized PipelineEvent
}

impl EventLogEntry {
    pub fn from_event(run_id: &str, seq: u32, event: &PipelineEvent) -> serde_json::Result<Self> {
        Ok(Self {
            id:         None,
            run_id:     run_id.to_string(),
            seq,
            stage:      event.stage().to_string(),
            event_type: event.type_name().to_string(),
            payload:    serde_json::to_string(event)?,
        })
    }
}
