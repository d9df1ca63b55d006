//! Metric computation engine: evaluates the ontology over one period's
//! canonical entities.
//!
//! EXECUTION ORDER (per compute_all call):
//!   1. leaf quantities from entity lifecycles (one pass over entities)
//!   2. every metric in the ontology's topological order
//!   3. consistency checks (decomposition, expected range) as warnings
//!   4. ledger + lineage update, keyed by (tenant, metric, period)
//!
//! Opening state is read at the end of the previous period, closing state
//! at the end of this one. Recomputing a key overwrites it. Each value
//! carries its change against the ledger's value for the previous period.

use crate::{
    canonical::CanonicalEntity,
    config::MetricsConfig,
    error::{PipelineError, PipelineResult, Stage},
    ontology::{Formula, LeafQuantity, MetricDef, Ontology, Unit},
    record::EntityType,
    types::{EntityId, MetricId, Period, TenantId},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ── Output types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricWarning {
    /// Signed components do not add up to the parent value.
    DecompositionMismatch {
        expected:   f64,
        actual:     f64,
        difference: f64,
    },
    OutOfRange {
        value: f64,
        low:   f64,
        high:  f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub metric_id: MetricId,
    pub tenant_id: TenantId,
    pub period:    Period,
    pub value:     f64,
    pub unit:      Unit,
    /// Component values of a decomposition metric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<BTreeMap<MetricId, f64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings:  Vec<MetricWarning>,
    /// Value of the same metric in the preceding period, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value:  Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_absolute: Option<f64>,
    /// Percent change against `previous_value`; `None` when that is 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_percent:  Option<f64>,
}

impl MetricValue {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Set the preceding period's value and the changes derived from it.
    pub fn set_previous(&mut self, previous: Option<f64>) {
        self.previous_value = previous;
        self.change_absolute = previous.map(|p| self.value - p);
        self.change_percent = previous
            .filter(|p| *p != 0.0)
            .map(|p| (self.value - p) / p * 100.0);
    }
}

/// One evaluation pass: values in ontology order plus the entity ids each
/// value was computed from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Computation {
    pub values:  Vec<MetricValue>,
    pub lineage: BTreeMap<MetricId, Vec<EntityId>>,
}

// ── Leaf quantities ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct Leaf {
    value:        f64,
    contributors: BTreeSet<EntityId>,
}

impl Leaf {
    fn add(&mut self, amount: f64, entity_id: &str) {
        self.value += amount;
        self.contributors.insert(entity_id.to_string());
    }
}

/// Every leaf quantity for `period`, in one pass over `entities`.
///
/// Invoices never contribute. Entities without a parsable amount still
/// count as customers but are left out of amount aggregates.
fn leaf_quantities(entities: &[CanonicalEntity], period: Period) -> BTreeMap<LeafQuantity, Leaf> {
    let open_date = period.prev().end();
    let close_date = period.end();

    let mut leaves: BTreeMap<LeafQuantity, Leaf> = BTreeMap::new();
    let mut open_customers: BTreeMap<String, BTreeSet<EntityId>> = BTreeMap::new();
    let mut close_customers: BTreeMap<String, BTreeSet<EntityId>> = BTreeMap::new();
    let mut unpriced = 0usize;

    for entity in entities.iter().filter(|e| e.entity_type != EntityType::Invoice) {
        let lifecycle = entity.lifecycle();
        let open = lifecycle.active_at(open_date);
        let close = lifecycle.active_at(close_date);
        let id = entity.entity_id.as_str();

        if open {
            open_customers.entry(entity.customer_key()).or_default().insert(id.to_string());
        }
        if close {
            close_customers.entry(entity.customer_key()).or_default().insert(id.to_string());
        }

        let Some(closing) = entity.amount() else {
            if open || close {
                unpriced += 1;
            }
            continue;
        };
        let opening = entity.opening_amount().unwrap_or(closing);

        match (open, close) {
            (true, true) => {
                leaves.entry(LeafQuantity::RecurringAmount).or_default().add(closing, id);
                leaves.entry(LeafQuantity::OpeningAmount).or_default().add(opening, id);
                if closing > opening {
                    leaves.entry(LeafQuantity::ExpansionAmount).or_default().add(closing - opening, id);
                } else if closing < opening {
                    leaves.entry(LeafQuantity::ContractionAmount).or_default().add(opening - closing, id);
                }
            }
            (false, true) => {
                leaves.entry(LeafQuantity::RecurringAmount).or_default().add(closing, id);
                leaves.entry(LeafQuantity::NewAmount).or_default().add(closing, id);
            }
            (true, false) => {
                leaves.entry(LeafQuantity::OpeningAmount).or_default().add(opening, id);
                leaves.entry(LeafQuantity::ChurnedAmount).or_default().add(opening, id);
            }
            (false, false) => {}
        }
    }

    if unpriced > 0 {
        log::warn!("metrics: {unpriced} live entities in {period} have no parsable amount");
    }

    let count = |keys: Vec<&BTreeSet<EntityId>>| Leaf {
        value: keys.len() as f64,
        contributors: keys.into_iter().flatten().cloned().collect(),
    };
    leaves.insert(LeafQuantity::ActiveCustomers, count(close_customers.values().collect()));
    leaves.insert(LeafQuantity::OpeningCustomers, count(open_customers.values().collect()));
    leaves.insert(
        LeafQuantity::ChurnedCustomers,
        count(
            open_customers
                .iter()
                .filter(|(k, _)| !close_customers.contains_key(*k))
                .map(|(_, ids)| ids)
                .collect(),
        ),
    );
    leaves.insert(
        LeafQuantity::NewCustomers,
        count(
            close_customers
                .iter()
                .filter(|(k, _)| !open_customers.contains_key(*k))
                .map(|(_, ids)| ids)
                .collect(),
        ),
    );
    leaves
}

// ── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct LedgerEntry {
    value:   MetricValue,
    lineage: Vec<EntityId>,
}

#[derive(Debug, Clone)]
pub struct MetricEngine {
    ontology:  Ontology,
    tolerance: f64,
    ledger:    BTreeMap<(TenantId, MetricId, Period), LedgerEntry>,
}

impl MetricEngine {
    pub fn new(ontology: Ontology, config: &MetricsConfig) -> Self {
        Self {
            ontology,
            tolerance: config.decomposition_tolerance,
            ledger: BTreeMap::new(),
        }
    }

    /// Engine over the configured ontology file, or the built-in one.
    pub fn from_config(config: &MetricsConfig) -> PipelineResult<Self> {
        let ontology = match &config.ontology_path {
            Some(path) => Ontology::load(path)?,
            None => Ontology::revenue()?,
        };
        Ok(Self::new(ontology, config))
    }

    pub fn ontology(&self) -> &Ontology {
        &self.ontology
    }

    /// Evaluate every metric for one (tenant, period) and record the results.
    pub fn compute_all(
        &mut self,
        tenant_id: &str,
        period: Period,
        entities: &[CanonicalEntity],
    ) -> PipelineResult<Vec<MetricValue>> {
        let computation = self.evaluate(tenant_id, period, entities, self.ontology.order())?;
        self.commit(&computation);

        let warnings: usize = computation.values.iter().map(|v| v.warnings.len()).sum();
        log::info!(
            "metrics: tenant '{tenant_id}' {period}: {} values from {} entities ({warnings} warnings)",
            computation.values.len(),
            entities.len()
        );
        Ok(computation.values)
    }

    /// Evaluate one metric, reading only the metrics it depends on. The
    /// ledger is left untouched.
    pub fn compute(
        &self,
        metric_id: &str,
        tenant_id: &str,
        period: Period,
        entities: &[CanonicalEntity],
    ) -> PipelineResult<MetricValue> {
        let needed = self.ontology.closure(metric_id).ok_or_else(|| PipelineError::UnknownMetric {
            stage: Stage::Metrics,
            metric_id: metric_id.to_string(),
        })?;
        let computation = self.evaluate(tenant_id, period, entities, &needed)?;
        computation
            .values
            .into_iter()
            .find(|v| v.metric_id == metric_id)
            .ok_or_else(|| PipelineError::MetricFailed {
                stage: Stage::Metrics,
                metric_id: metric_id.to_string(),
                reason: "not produced by evaluation".into(),
            })
    }

    /// Pure evaluation of `metric_ids`, which must be closed under inputs
    /// and in topological order.
    pub fn evaluate(
        &self,
        tenant_id: &str,
        period: Period,
        entities: &[CanonicalEntity],
        metric_ids: &[MetricId],
    ) -> PipelineResult<Computation> {
        let leaves = leaf_quantities(entities, period);
        let mut values: BTreeMap<&str, f64> = BTreeMap::new();
        let mut out = Computation::default();

        for metric_id in metric_ids {
            let def = self.ontology.get(metric_id).ok_or_else(|| PipelineError::UnknownMetric {
                stage: Stage::Metrics,
                metric_id: metric_id.clone(),
            })?;
            let (value, breakdown, lineage) = self.evaluate_one(def, &leaves, &values, &out.lineage)?;

            let mut warnings = Vec::new();
            if let (Formula::Decomposition { components, .. }, Some(parts)) = (&def.formula, &breakdown) {
                let expected: f64 = components
                    .iter()
                    .map(|c| c.sign.apply(parts.get(&c.metric_id).copied().unwrap_or(0.0)))
                    .sum();
                let difference = value - expected;
                if difference.abs() > self.tolerance * value.abs().max(1.0) {
                    log::warn!(
                        "metrics: {metric_id} {period} decomposition off by {difference:.6} \
                         ({value} vs components {expected})"
                    );
                    warnings.push(MetricWarning::DecompositionMismatch {
                        expected,
                        actual: value,
                        difference,
                    });
                }
            }
            if let Some((low, high)) = def.expected_range {
                if value < low || value > high {
                    log::warn!("metrics: {metric_id} {period} = {value} outside [{low}, {high}]");
                    warnings.push(MetricWarning::OutOfRange { value, low, high });
                }
            }

            values.insert(metric_id.as_str(), value);
            out.lineage.insert(metric_id.clone(), lineage);
            let mut metric_value = MetricValue {
                metric_id: metric_id.clone(),
                tenant_id: tenant_id.to_string(),
                period,
                value,
                unit: def.unit,
                breakdown,
                warnings,
                previous_value: None,
                change_absolute: None,
                change_percent: None,
            };
            metric_value.set_previous(self.value(tenant_id, metric_id, period.prev()).map(|v| v.value));
            out.values.push(metric_value);
        }
        Ok(out)
    }

    fn evaluate_one(
        &self,
        def: &MetricDef,
        leaves: &BTreeMap<LeafQuantity, Leaf>,
        values: &BTreeMap<&str, f64>,
        lineage: &BTreeMap<MetricId, Vec<EntityId>>,
    ) -> PipelineResult<(f64, Option<BTreeMap<MetricId, f64>>, Vec<EntityId>)> {
        let input = |id: &str| -> PipelineResult<f64> {
            values.get(id).copied().ok_or_else(|| PipelineError::MetricFailed {
                stage: Stage::Metrics,
                metric_id: def.metric_id.clone(),
                reason: format!("input '{id}' not evaluated yet"),
            })
        };
        let leaf = |q: LeafQuantity| leaves.get(&q).map(|l| l.value).unwrap_or(0.0);

        let mut contributors: BTreeSet<EntityId> = def
            .formula
            .inputs()
            .iter()
            .filter_map(|i| lineage.get(*i))
            .flatten()
            .cloned()
            .collect();
        if let Some(q) = def.formula.quantity() {
            if let Some(l) = leaves.get(&q) {
                contributors.extend(l.contributors.iter().cloned());
            }
        }

        let (value, breakdown) = match &def.formula {
            Formula::Sum { quantity: Some(q), .. } => (leaf(*q), None),
            Formula::Sum { quantity: None, inputs } => {
                let mut total = 0.0;
                for i in inputs {
                    total += input(i)?;
                }
                (total, None)
            }
            Formula::Ratio { numerator, denominator, scale } => {
                let num = input(numerator)?;
                let den = input(denominator)?;
                // No customers is a valid zero state, not a fault.
                let value = if den == 0.0 { 0.0 } else { num / den * scale };
                (value, None)
            }
            Formula::Difference { minuend, subtrahend } => (input(minuend)? - input(subtrahend)?, None),
            Formula::Decomposition { quantity, components } => {
                let mut parts = BTreeMap::new();
                for c in components {
                    parts.insert(c.metric_id.clone(), input(&c.metric_id)?);
                }
                (leaf(*quantity), Some(parts))
            }
        };

        if !value.is_finite() {
            return Err(PipelineError::MetricFailed {
                stage: Stage::Metrics,
                metric_id: def.metric_id.clone(),
                reason: format!("evaluated to {value}"),
            });
        }
        Ok((value, breakdown, contributors.into_iter().collect()))
    }

    /// Store a computation in the ledger, overwriting any earlier value
    /// for the same (tenant, metric, period).
    pub fn commit(&mut self, computation: &Computation) {
        for value in &computation.values {
            let lineage = computation.lineage.get(&value.metric_id).cloned().unwrap_or_default();
            self.ledger.insert(
                (value.tenant_id.clone(), value.metric_id.clone(), value.period),
                LedgerEntry { value: value.clone(), lineage },
            );
        }
    }

    /// Load values persisted by earlier invocations so they serve as
    /// history. Lineage is not restored; a key already in the ledger is
    /// left alone.
    pub fn seed_history(&mut self, values: &[MetricValue]) -> usize {
        let mut loaded = 0;
        for value in values {
            let key = (value.tenant_id.clone(), value.metric_id.clone(), value.period);
            if self.ledger.contains_key(&key) {
                continue;
            }
            self.ledger.insert(key, LedgerEntry { value: value.clone(), lineage: Vec::new() });
            loaded += 1;
        }
        log::debug!("metrics: seeded {loaded} historical values");
        loaded
    }

    // ── Ledger queries ───────────────────────────────────────────────────────

    pub fn value(&self, tenant_id: &str, metric_id: &str, period: Period) -> Option<&MetricValue> {
        self.ledger
            .get(&(tenant_id.to_string(), metric_id.to_string(), period))
            .map(|e| &e.value)
    }

    /// Entity ids that fed the stored value, sorted.
    pub fn lineage(&self, tenant_id: &str, metric_id: &str, period: Period) -> Option<&[EntityId]> {
        self.ledger
            .get(&(tenant_id.to_string(), metric_id.to_string(), period))
            .map(|e| e.lineage.as_slice())
    }

    /// Stored values of one metric, oldest period first.
    pub fn series(&self, tenant_id: &str, metric_id: &str) -> Vec<MetricValue> {
        self.ledger
            .iter()
            .filter(|((t, m, _), _)| t == tenant_id && m == metric_id)
            .map(|(_, e)| e.value.clone())
            .collect()
    }

    /// Every stored series for a tenant, keyed by metric id.
    pub fn all_series(&self, tenant_id: &str) -> BTreeMap<MetricId, Vec<MetricValue>> {
        let mut out: BTreeMap<MetricId, Vec<MetricValue>> = BTreeMap::new();
        for ((t, m, _), e) in &self.ledger {
            if t == tenant_id {
                out.entry(m.clone()).or_default().push(e.value.clone());
            }
        }
        out
    }

    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }
}
