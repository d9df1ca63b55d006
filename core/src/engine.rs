//! The pipeline driver: records in, canonical entities, metric values and
//! anomalies out.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Group records into monthly snapshots by `ingested_at`
//!   2. Resolution  - one resolver pass per snapshot
//!   3. Metrics     - every ontology metric per snapshot period
//!   4. Detection   - every metric series, history included
//!   5. Commit      - metric ledger updated, report returned
//!
//! RULES:
//!   - Each stage reads only the completed output of the stage before it.
//!   - Cancellation is checked between stages and between snapshots.
//!   - Nothing is committed until detection completes: a cancelled or failed
//!     run leaves the ledger exactly as it found it.
//!   - The pipeline holds no randomness; same input, same report.

use crate::{
    anomaly_detector::{Anomaly, AnomalyDetector},
    canonical::CanonicalEntity,
    config::PipelineConfig,
    error::{PipelineError, PipelineResult, Stage},
    event::PipelineEvent,
    metric_engine::{Computation, MetricEngine, MetricValue},
    ontology::Ontology,
    record::NormalizedRecord,
    resolver::{EntityResolver, ResolutionStats},
    scoring::MatchScore,
    types::{EntityId, MetricId, Period, RunId, TenantId},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cooperative cancellation flag shared across threads.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, stage: Stage) -> PipelineResult<()> {
        if self.is_cancelled() {
            log::warn!("pipeline: cancelled during {stage} stage, discarding results");
            return Err(PipelineError::Cancelled { stage });
        }
        Ok(())
    }
}

// ── Report ───────────────────────────────────────────────────────────────────

/// Resolution output for one monthly snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotReport {
    pub period:   Period,
    pub entities: Vec<CanonicalEntity>,
    pub review:   Vec<MatchScore>,
    pub stats:    ResolutionStats,
}

/// Contributing entities of one (metric, period) value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricLineage {
    pub metric_id:  MetricId,
    pub period:     Period,
    pub entity_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id:        RunId,
    pub tenant_id:     TenantId,
    pub snapshots:     Vec<SnapshotReport>,
    pub metric_values: Vec<MetricValue>,
    pub lineage:       Vec<MetricLineage>,
    pub anomalies:     Vec<Anomaly>,
    pub events:        Vec<PipelineEvent>,
}

impl PipelineReport {
    pub fn periods(&self) -> Vec<Period> {
        self.snapshots.iter().map(|s| s.period).collect()
    }

    pub fn entity_count(&self) -> usize {
        self.snapshots.iter().map(|s| s.entities.len()).sum()
    }

    pub fn value(&self, metric_id: &str, period: Period) -> Option<&MetricValue> {
        self.metric_values
            .iter()
            .find(|v| v.metric_id == metric_id && v.period == period)
    }

    /// Values of one metric, oldest first.
    pub fn series(&self, metric_id: &str) -> Vec<&MetricValue> {
        self.metric_values.iter().filter(|v| v.metric_id == metric_id).collect()
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct RevenuePipeline {
    resolver: EntityResolver,
    engine:   MetricEngine,
    detector: AnomalyDetector,
}

impl RevenuePipeline {
    /// Build every stage from `config`. All configuration errors surface here,
    /// before any record is touched.
    pub fn new(config: &PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self {
            resolver: EntityResolver::new(config.resolution.clone())?,
            engine:   MetricEngine::from_config(&config.metrics)?,
            detector: AnomalyDetector::new(config.anomaly.clone())?,
        })
    }

    /// Same as `new`, with an explicit ontology.
    pub fn with_ontology(config: &PipelineConfig, ontology: Ontology) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self {
            resolver: EntityResolver::new(config.resolution.clone())?,
            engine:   MetricEngine::new(ontology, &config.metrics),
            detector: AnomalyDetector::new(config.anomaly.clone())?,
        })
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    pub fn engine(&self) -> &MetricEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut MetricEngine {
        &mut self.engine
    }

    /// Load values persisted by earlier invocations as metric history.
    pub fn seed_history(&mut self, values: &[MetricValue]) -> usize {
        self.engine.seed_history(values)
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    pub fn ontology(&self) -> &Ontology {
        self.engine.ontology()
    }

    /// Run every stage over `records` for one tenant.
    pub fn run(
        &mut self,
        run_id: &str,
        tenant_id: &str,
        records: &[NormalizedRecord],
        cancel: &CancellationToken,
    ) -> PipelineResult<PipelineReport> {
        let snapshots = group_by_period(records);
        let mut events = vec![PipelineEvent::RunStarted {
            run_id:    run_id.to_string(),
            tenant_id: tenant_id.to_string(),
            records:   records.len(),
            periods:   snapshots.len(),
        }];
        log::info!(
            "pipeline: run '{run_id}' for tenant '{tenant_id}': {} records over {} periods",
            records.len(),
            snapshots.len()
        );

        // ── Resolution ───────────────────────────────────────────────────────
        let mut resolved = Vec::with_capacity(snapshots.len());
        for (period, batch) in &snapshots {
            cancel.check(Stage::Resolution)?;
            let report = self.resolver.resolve_detailed(batch)?;
            resolved.push(SnapshotReport {
                period:   *period,
                entities: report.entities,
                review:   report.review,
                stats:    report.stats,
            });
        }
        cancel.check(Stage::Resolution)?;
        for s in &resolved {
            events.push(PipelineEvent::SnapshotResolved {
                period:         s.period,
                records:        s.stats.records,
                entities:       s.stats.entities,
                accepted_pairs: s.stats.accepted_pairs,
                review_pairs:   s.stats.review_pairs,
            });
        }

        // ── Metrics ──────────────────────────────────────────────────────────
        let mut computations: Vec<(Period, Computation)> = Vec::with_capacity(resolved.len());
        for s in &resolved {
            cancel.check(Stage::Metrics)?;
            let mut computation =
                self.engine.evaluate(tenant_id, s.period, &s.entities, self.engine.ontology().order())?;
            // The ledger only holds committed runs; link to this run's own
            // previous month when it has one.
            if let Some((earlier_period, earlier)) = computations.last() {
                if *earlier_period == s.period.prev() {
                    let previous: BTreeMap<&str, f64> =
                        earlier.values.iter().map(|v| (v.metric_id.as_str(), v.value)).collect();
                    for v in &mut computation.values {
                        if let Some(p) = previous.get(v.metric_id.as_str()) {
                            v.set_previous(Some(*p));
                        }
                    }
                }
            }
            computations.push((s.period, computation));
        }
        cancel.check(Stage::Metrics)?;
        for (period, c) in &computations {
            events.push(PipelineEvent::MetricsComputed {
                period:   *period,
                values:   c.values.len(),
                warnings: c.values.iter().map(|v| v.warnings.len()).sum(),
            });
        }

        // ── Detection ────────────────────────────────────────────────────────
        // Earlier runs supply history; this run's values replace theirs.
        let mut history: BTreeMap<MetricId, BTreeMap<Period, MetricValue>> = BTreeMap::new();
        for (metric_id, values) in self.engine.all_series(tenant_id) {
            let by_period = history.entry(metric_id).or_default();
            for v in values {
                by_period.insert(v.period, v);
            }
        }
        for (_, c) in &computations {
            for v in &c.values {
                history.entry(v.metric_id.clone()).or_default().insert(v.period, v.clone());
            }
        }
        let series: BTreeMap<MetricId, Vec<MetricValue>> = history
            .into_iter()
            .map(|(metric_id, by_period)| (metric_id, by_period.into_values().collect()))
            .collect();

        let run_periods: Vec<Period> = resolved.iter().map(|s| s.period).collect();
        let anomalies: Vec<Anomaly> = self
            .detector
            .detect_all(&series)?
            .into_iter()
            .filter(|a| run_periods.contains(&a.period))
            .collect();
        cancel.check(Stage::Detection)?;
        events.push(PipelineEvent::AnomaliesDetected {
            series:    series.len(),
            anomalies: anomalies.len(),
        });

        // ── Commit ───────────────────────────────────────────────────────────
        let mut metric_values = Vec::new();
        let mut lineage = Vec::new();
        for (period, c) in computations {
            self.engine.commit(&c);
            for (metric_id, entity_ids) in c.lineage {
                lineage.push(MetricLineage { metric_id, period, entity_ids });
            }
            metric_values.extend(c.values);
        }

        let entity_count: usize = resolved.iter().map(|s| s.entities.len()).sum();
        events.push(PipelineEvent::RunCompleted {
            run_id:        run_id.to_string(),
            entities:      entity_count,
            metric_values: metric_values.len(),
            anomalies:     anomalies.len(),
        });
        log::info!(
            "pipeline: run '{run_id}' complete: {entity_count} entities, {} metric values, {} anomalies",
            metric_values.len(),
            anomalies.len()
        );

        Ok(PipelineReport {
            run_id: run_id.to_string(),
            tenant_id: tenant_id.to_string(),
            snapshots: resolved,
            metric_values,
            lineage,
            anomalies,
            events,
        })
    }
}

/// Records bucketed by the month of `ingested_at`, input order kept within
/// each bucket.
pub fn group_by_period(records: &[NormalizedRecord]) -> BTreeMap<Period, Vec<NormalizedRecord>> {
    let mut out: BTreeMap<Period, Vec<NormalizedRecord>> = BTreeMap::new();
    for r in records {
        out.entry(r.snapshot_period()).or_default().push(r.clone());
    }
    out
}
