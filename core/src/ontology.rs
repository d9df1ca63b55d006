//! Metric ontology: a validated DAG of metric definitions.
//!
//! Validation happens once, at load time:
//!   - metric ids are unique
//!   - every formula is well-formed and its kind is known
//!   - every input names a metric in the same ontology
//!   - the dependency graph has no cycle
//!
//! The topological order and the per-depth levels are computed here and
//! never re-derived per call.

use crate::{error::ConfigError, types::MetricId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const DEFAULT_ONTOLOGY: &str = include_str!("../../data/ontology/revenue_metrics.json");

const FORMULA_KINDS: &[&str] = &["sum", "ratio", "difference", "decomposition"];

// ── Metric metadata ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Currency,
    Count,
    Ratio,
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Revenue,
    Retention,
    Growth,
    Efficiency,
}

/// Which way a movement is good news.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    UpGood,
    DownGood,
    #[default]
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Monthly,
}

// ── Formulas ─────────────────────────────────────────────────────────────────

/// Quantities computed directly from canonical entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafQuantity {
    /// Closing amount of subscriptions active at period end.
    RecurringAmount,
    /// Opening amount of subscriptions active at the previous period end.
    OpeningAmount,
    NewAmount,
    ExpansionAmount,
    ContractionAmount,
    ChurnedAmount,
    ActiveCustomers,
    OpeningCustomers,
    ChurnedCustomers,
    NewCustomers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sign {
    Add,
    Subtract,
}

impl Sign {
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Self::Add      => value,
            Self::Subtract => -value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub metric_id: MetricId,
    pub sign:      Sign,
}

fn unit_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Formula {
    /// Aggregate a leaf quantity, or add up other metrics. Exactly one of
    /// the two must be given.
    Sum {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quantity: Option<LeafQuantity>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        inputs:   Vec<MetricId>,
    },
    /// `numerator / denominator * scale`; exactly 0 when the denominator is 0.
    Ratio {
        numerator:   MetricId,
        denominator: MetricId,
        #[serde(default = "unit_scale")]
        scale:       f64,
    },
    Difference {
        minuend:    MetricId,
        subtrahend: MetricId,
    },
    /// Value is `quantity`; the signed components must add up to it.
    Decomposition {
        quantity:   LeafQuantity,
        components: Vec<Component>,
    },
}

impl Formula {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sum { .. }           => "sum",
            Self::Ratio { .. }         => "ratio",
            Self::Difference { .. }    => "difference",
            Self::Decomposition { .. } => "decomposition",
        }
    }

    /// Metrics this formula reads, in declaration order.
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            Self::Sum { inputs, .. } => inputs.iter().map(String::as_str).collect(),
            Self::Ratio { numerator, denominator, .. } => vec![numerator.as_str(), denominator.as_str()],
            Self::Difference { minuend, subtrahend } => vec![minuend.as_str(), subtrahend.as_str()],
            Self::Decomposition { components, .. } => {
                components.iter().map(|c| c.metric_id.as_str()).collect()
            }
        }
    }

    /// The entity-level quantity this formula reads directly, if any.
    pub fn quantity(&self) -> Option<LeafQuantity> {
        match self {
            Self::Sum { quantity, .. } => *quantity,
            Self::Decomposition { quantity, .. } => Some(*quantity),
            _ => None,
        }
    }

    fn validate(&self, metric_id: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidFormula {
            metric_id: metric_id.to_string(),
            reason: reason.to_string(),
        };
        match self {
            Self::Sum { quantity: Some(_), inputs } if !inputs.is_empty() => {
                Err(invalid("sum takes either a quantity or inputs, not both"))
            }
            Self::Sum { quantity: None, inputs } if inputs.is_empty() => {
                Err(invalid("sum needs a quantity or at least one input"))
            }
            Self::Ratio { scale, .. } if !scale.is_finite() => Err(invalid("ratio scale must be finite")),
            Self::Decomposition { components, .. } if components.is_empty() => {
                Err(invalid("decomposition needs at least one component"))
            }
            _ => Ok(()),
        }
    }
}

// ── Definitions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDef {
    pub metric_id:   MetricId,
    pub name:        String,
    #[serde(default)]
    pub description: String,
    pub category:    Category,
    #[serde(default)]
    pub direction:   Direction,
    pub unit:        Unit,
    #[serde(default)]
    pub period_granularity: Granularity,
    pub formula:     Formula,
    /// Plausible `[low, high]`; values outside draw a warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_range: Option<(f64, f64)>,
}

impl MetricDef {
    pub fn is_leaf(&self) -> bool {
        self.formula.inputs().is_empty()
    }
}

/// Compact row for `list_metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub metric_id:    MetricId,
    pub name:         String,
    pub description:  String,
    pub category:     Category,
    pub direction:    Direction,
    pub unit:         Unit,
    pub formula_kind: String,
    pub inputs:       Vec<MetricId>,
    pub level:        usize,
}

#[derive(Debug, Deserialize)]
struct OntologyFile {
    #[serde(default)]
    name:    String,
    metrics: Vec<serde_json::Value>,
}

// ── Ontology ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Ontology {
    name:    String,
    metrics: BTreeMap<MetricId, MetricDef>,
    order:   Vec<MetricId>,
    levels:  Vec<Vec<MetricId>>,
}

impl Ontology {
    /// Validate `defs` and fix the evaluation order.
    pub fn new(name: impl Into<String>, defs: Vec<MetricDef>) -> Result<Self, ConfigError> {
        let mut metrics = BTreeMap::new();
        for def in defs {
            def.formula.validate(&def.metric_id)?;
            if metrics.contains_key(&def.metric_id) {
                return Err(ConfigError::DuplicateMetric { metric_id: def.metric_id });
            }
            metrics.insert(def.metric_id.clone(), def);
        }

        for def in metrics.values() {
            for input in def.formula.inputs() {
                if !metrics.contains_key(input) {
                    return Err(ConfigError::UnknownInput {
                        metric_id: def.metric_id.clone(),
                        input: input.to_string(),
                    });
                }
            }
        }

        let order = topological_order(&metrics)?;
        let levels = group_levels(&metrics, &order);
        let name = name.into();
        log::debug!(
            "ontology '{name}': {} metrics in {} levels",
            order.len(),
            levels.len()
        );
        Ok(Self { name, metrics, order, levels })
    }

    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let file: OntologyFile = serde_json::from_str(input).map_err(|e| ConfigError::Parse {
            what: "ontology",
            reason: e.to_string(),
        })?;

        let mut defs = Vec::with_capacity(file.metrics.len());
        for raw in file.metrics {
            let metric_id = raw
                .get("metric_id")
                .and_then(|v| v.as_str())
                .unwrap_or("<unnamed>")
                .to_string();
            // Catch unknown kinds before serde folds them into a generic error.
            let kind = raw
                .get("formula")
                .and_then(|f| f.get("kind"))
                .and_then(|k| k.as_str())
                .unwrap_or_default()
                .to_string();
            if !FORMULA_KINDS.contains(&kind.as_str()) {
                return Err(ConfigError::UnknownFormulaKind { metric_id, kind });
            }
            let def: MetricDef = serde_json::from_value(raw).map_err(|e| ConfigError::InvalidFormula {
                metric_id: metric_id.clone(),
                reason: e.to_string(),
            })?;
            defs.push(def);
        }
        Self::new(file.name, defs)
    }

    /// Load a custom ontology from a JSON file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read ontology {path}: {e}"))?;
        Ok(Self::from_json(&content)?)
    }

    /// The built-in revenue ontology.
    pub fn revenue() -> Result<Self, ConfigError> {
        Self::from_json(DEFAULT_ONTOLOGY)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, metric_id: &str) -> Option<&MetricDef> {
        self.metrics.get(metric_id)
    }

    pub fn contains(&self, metric_id: &str) -> bool {
        self.metrics.contains_key(metric_id)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Every metric, inputs before dependents.
    pub fn order(&self) -> &[MetricId] {
        &self.order
    }

    /// Metrics grouped by dependency depth. Level 0 holds the leaves; no
    /// metric depends on another metric in its own level.
    pub fn levels(&self) -> &[Vec<MetricId>] {
        &self.levels
    }

    pub fn level_of(&self, metric_id: &str) -> Option<usize> {
        self.levels.iter().position(|level| level.iter().any(|m| m == metric_id))
    }

    /// Definitions in evaluation order.
    pub fn defs(&self) -> impl Iterator<Item = &MetricDef> {
        self.order.iter().filter_map(|id| self.metrics.get(id))
    }

    /// `metric_id` and everything it depends on, in evaluation order.
    pub fn closure(&self, metric_id: &str) -> Option<Vec<MetricId>> {
        if !self.contains(metric_id) {
            return None;
        }
        let mut needed = BTreeSet::new();
        let mut stack = vec![metric_id.to_string()];
        while let Some(id) = stack.pop() {
            if !needed.insert(id.clone()) {
                continue;
            }
            if let Some(def) = self.metrics.get(&id) {
                stack.extend(def.formula.inputs().into_iter().map(str::to_string));
            }
        }
        Some(self.order.iter().filter(|id| needed.contains(*id)).cloned().collect())
    }

    pub fn summary(&self) -> Vec<MetricSummary> {
        self.defs()
            .map(|def| MetricSummary {
                metric_id:    def.metric_id.clone(),
                name:         def.name.clone(),
                description:  def.description.clone(),
                category:     def.category,
                direction:    def.direction,
                unit:         def.unit,
                formula_kind: def.formula.kind().to_string(),
                inputs:       def.formula.inputs().into_iter().map(str::to_string).collect(),
                level:        self.level_of(&def.metric_id).unwrap_or_default(),
            })
            .collect()
    }
}

// ── Graph helpers ────────────────────────────────────────────────────────────

/// Kahn's algorithm; ready metrics are taken in id order so the result is
/// deterministic.
fn topological_order(metrics: &BTreeMap<MetricId, MetricDef>) -> Result<Vec<MetricId>, ConfigError> {
    let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (id, def) in metrics {
        let inputs: BTreeSet<&str> = def.formula.inputs().into_iter().collect();
        pending.insert(id.as_str(), inputs.len());
        for input in inputs {
            dependents.entry(input).or_default().push(id.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(metrics.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        for &dependent in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(n) = pending.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() < metrics.len() {
        let stuck: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(&id, _)| id)
            .collect();
        return Err(ConfigError::CyclicOntology { cycle: find_cycle(metrics, &stuck) });
    }
    Ok(order)
}

/// Walk input edges among the stuck metrics until one repeats. Every stuck
/// metric has at least one stuck input, so the walk always closes.
fn find_cycle(metrics: &BTreeMap<MetricId, MetricDef>, stuck: &BTreeSet<&str>) -> Vec<String> {
    let Some(&start) = stuck.first() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = metrics
            .get(current)
            .and_then(|def| def.formula.inputs().into_iter().find(|i| stuck.contains(i)));
        let Some(next) = next else {
            return path.iter().map(|s| s.to_string()).collect();
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }
}

fn group_levels(metrics: &BTreeMap<MetricId, MetricDef>, order: &[MetricId]) -> Vec<Vec<MetricId>> {
    let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
    let mut levels: Vec<Vec<MetricId>> = Vec::new();
    for id in order {
        let d = metrics
            .get(id)
            .map(|def| {
                def.formula
                    .inputs()
                    .iter()
                    .filter_map(|i| depth.get(i))
                    .map(|d| d + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        depth.insert(id.as_str(), d);
        if levels.len() <= d {
            levels.resize_with(d + 1, Vec::new);
        }
        levels[d].push(id.clone());
    }
    levels
}
