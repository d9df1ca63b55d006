//! Anomaly detector: z-score and rate-of-change over metric time series.
//!
//! Both methods run independently on every series and their findings are
//! concatenated: one period can be flagged once per method. Severity maps
//! each method's raw deviation into [0, 1) with `d / (d + threshold)`, so
//! findings compare across metrics regardless of unit.
//!
//! Too little history is a quiet state, never an error.

use crate::{
    config::AnomalyConfig,
    error::{PipelineError, PipelineResult, Stage},
    metric_engine::MetricValue,
    types::{MetricId, Period, TenantId},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Relative floor under which a window's dispersion counts as zero.
const ZERO_DISPERSION: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Zscore,
    RateOfChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Movement {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric_id:      MetricId,
    pub tenant_id:      TenantId,
    pub period:         Period,
    pub method:         Method,
    pub observed_value: f64,
    /// Window mean (z-score) or previous value (rate of change).
    pub baseline:       f64,
    /// z, the raw gap when the window is flat, or the fractional change.
    pub deviation:      f64,
    pub severity:       f64,
    pub direction:      Movement,
    /// Parent metric when this series is a decomposition component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_of:   Option<MetricId>,
}

/// A flagged point before it is labelled with metric and tenant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Finding {
    pub index:     usize,
    pub method:    Method,
    pub observed:  f64,
    pub baseline:  f64,
    pub deviation: f64,
    pub severity:  f64,
}

// ── Methods ──────────────────────────────────────────────────────────────────

/// `d / (d + threshold)`: 0 at no deviation, approaching 1 as it grows.
pub fn severity(deviation: f64, threshold: f64) -> f64 {
    let d = deviation.abs();
    if d == 0.0 {
        0.0
    } else {
        d / (d + threshold)
    }
}

/// Flags index `i` when its value sits more than `threshold` population
/// standard deviations from the mean of the `window` values before it.
///
/// A flat window flags any nonzero deviation at full severity.
pub fn zscore_findings(values: &[f64], window: usize, threshold: f64) -> Vec<Finding> {
    let mut out = Vec::new();
    if window == 0 || values.len() <= window {
        return out;
    }
    for i in window..values.len() {
        let history = &values[i - window..i];
        let mean = history.iter().sum::<f64>() / window as f64;
        let variance = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window as f64;
        let std = variance.sqrt();
        let current = values[i];
        let gap = current - mean;
        let floor = ZERO_DISPERSION * mean.abs().max(1.0);

        if std <= floor {
            if gap.abs() > floor {
                out.push(Finding {
                    index: i,
                    method: Method::Zscore,
                    observed: current,
                    baseline: mean,
                    deviation: gap,
                    severity: 1.0,
                });
            }
            continue;
        }

        let z = gap / std;
        if z.abs() > threshold {
            out.push(Finding {
                index: i,
                method: Method::Zscore,
                observed: current,
                baseline: mean,
                deviation: z,
                severity: severity(z, threshold),
            });
        }
    }
    out
}

/// Flags index `i` by its change `(v[i] − v[i−1]) / |v[i−1]|`.
///
/// Once `min_history` earlier changes exist, the change is scored against
/// their mean and population standard deviation and flagged when
/// `|z| >= z_threshold`; the finding's deviation is then that z. With less
/// history, or when every earlier change was identical, the change itself
/// must exceed `threshold` in magnitude. Steps from zero are skipped: no
/// rate exists.
pub fn rate_of_change_findings(
    values: &[f64],
    threshold: f64,
    min_history: usize,
    z_threshold: f64,
) -> Vec<Finding> {
    let mut out = Vec::new();
    let mut changes: Vec<f64> = Vec::new();
    for i in 1..values.len() {
        let previous = values[i - 1];
        if previous == 0.0 {
            continue;
        }
        let current = values[i];
        let change = (current - previous) / previous.abs();

        let adaptive = if changes.len() >= min_history {
            let n = changes.len() as f64;
            let mean = changes.iter().sum::<f64>() / n;
            let std = (changes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n).sqrt();
            (std > ZERO_DISPERSION * mean.abs().max(1.0)).then(|| (change - mean) / std)
        } else {
            None
        };
        changes.push(change);

        let (flagged, deviation, scale) = match adaptive {
            Some(z) => (z.abs() >= z_threshold, z, z_threshold),
            None => (change.abs() > threshold, change, threshold),
        };
        if flagged {
            out.push(Finding {
                index: i,
                method: Method::RateOfChange,
                observed: current,
                baseline: previous,
                deviation,
                severity: severity(deviation, scale),
            });
        }
    }
    out
}

// ── Detector ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Anomalies in one metric's series for one tenant.
    ///
    /// The series may arrive in any order; it is read oldest first. Mixed
    /// metrics, mixed tenants or a repeated period are rejected.
    pub fn detect(&self, series: &[MetricValue]) -> PipelineResult<Vec<Anomaly>> {
        let Some(first) = series.first() else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<&MetricValue> = series.iter().collect();
        ordered.sort_by_key(|v| v.period);

        if let Some(other) = ordered
            .iter()
            .find(|v| v.metric_id != first.metric_id || v.tenant_id != first.tenant_id)
        {
            return Err(PipelineError::MetricFailed {
                stage: Stage::Detection,
                metric_id: first.metric_id.clone(),
                reason: format!(
                    "series mixes '{}'/'{}' with '{}'/'{}'",
                    first.metric_id, first.tenant_id, other.metric_id, other.tenant_id
                ),
            });
        }
        if let Some(pair) = ordered.windows(2).find(|w| w[0].period == w[1].period) {
            return Err(PipelineError::MetricFailed {
                stage: Stage::Detection,
                metric_id: first.metric_id.clone(),
                reason: format!("period {} appears twice", pair[0].period),
            });
        }

        let periods: Vec<Period> = ordered.iter().map(|v| v.period).collect();
        let values: Vec<f64> = ordered.iter().map(|v| v.value).collect();
        let mut anomalies = self.label(&first.metric_id, &first.tenant_id, None, &periods, &values);

        if self.config.detect_components {
            let components: BTreeSet<&MetricId> = ordered
                .iter()
                .filter_map(|v| v.breakdown.as_ref())
                .flat_map(|b| b.keys())
                .collect();
            for component in components {
                let component_values: Vec<f64> = ordered
                    .iter()
                    .map(|v| {
                        v.breakdown
                            .as_ref()
                            .and_then(|b| b.get(component))
                            .copied()
                            .unwrap_or(0.0)
                    })
                    .collect();
                anomalies.extend(self.label(
                    component,
                    &first.tenant_id,
                    Some(&first.metric_id),
                    &periods,
                    &component_values,
                ));
            }
        }
        Ok(anomalies)
    }

    /// Every series of a map, in metric-id order.
    pub fn detect_all(&self, series: &BTreeMap<MetricId, Vec<MetricValue>>) -> PipelineResult<Vec<Anomaly>> {
        let mut all = Vec::new();
        for values in series.values() {
            all.extend(self.detect(values)?);
        }
        log::info!(
            "detection: {} anomalies across {} series (window {}, z {}, rate {})",
            all.len(),
            series.len(),
            self.config.window,
            self.config.z_threshold,
            self.config.rate_threshold
        );
        Ok(all)
    }

    fn label(
        &self,
        metric_id: &str,
        tenant_id: &str,
        component_of: Option<&str>,
        periods: &[Period],
        values: &[f64],
    ) -> Vec<Anomaly> {
        let mut findings = zscore_findings(values, self.config.window, self.config.z_threshold);
        findings.extend(rate_of_change_findings(
            values,
            self.config.rate_threshold,
            self.config.rate_history,
            self.config.rate_z_threshold,
        ));
        findings.sort_by_key(|f| (f.index, f.method));

        findings
            .into_iter()
            .filter_map(|f| {
                let period = *periods.get(f.index)?;
                log::debug!(
                    "detection: {metric_id} {period} {:?} observed {} baseline {} severity {:.3}",
                    f.method, f.observed, f.baseline, f.severity
                );
                Some(Anomaly {
                    metric_id: metric_id.to_string(),
                    tenant_id: tenant_id.to_string(),
                    period,
                    method: f.method,
                    observed_value: f.observed,
                    baseline: f.baseline,
                    deviation: f.deviation,
                    severity: f.severity,
                    direction: if f.observed >= f.baseline { Movement::Up } else { Movement::Down },
                    component_of: component_of.map(str::to_string),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_bounded_and_monotonic() {
        assert_eq!(severity(0.0, 2.0), 0.0);
        let mut last = 0.0;
        for d in [0.5, 1.0, 2.0, 5.0, 50.0, 5000.0] {
            let s = severity(d, 2.0);
            assert!(s > last && s < 1.0, "severity({d}) = {s}");
            last = s;
        }
        assert_eq!(severity(-3.0, 2.0), severity(3.0, 2.0));
    }

    #[test]
    fn zscore_needs_a_full_window() {
        assert!(zscore_findings(&[1.0, 2.0, 100.0], 6, 2.0).is_empty());
    }

    #[test]
    fn zscore_uses_population_std() {
        // mean 10, population std 1 over [9, 11, 9, 11]
        let findings = zscore_findings(&[9.0, 11.0, 9.0, 11.0, 12.5], 4, 2.0);
        assert_eq!(findings.len(), 1);
        assert!((findings[0].deviation - 2.5).abs() < 1e-12);
        assert!((findings[0].severity - 2.5 / 4.5).abs() < 1e-12);
    }

    #[test]
    fn rate_of_change_skips_zero_base() {
        assert!(rate_of_change_findings(&[0.0, 50.0], 0.15, 7, 2.0).is_empty());
        let drop = rate_of_change_findings(&[200.0, 100.0], 0.15, 7, 2.0);
        assert_eq!(drop.len(), 1);
        assert!((drop[0].deviation + 0.5).abs() < 1e-12);
    }

    /// Values whose period-over-period changes follow `changes`.
    fn compound(changes: &[f64]) -> Vec<f64> {
        let mut values = vec![1000.0];
        for c in changes {
            let last = values[values.len() - 1];
            values.push(last * (1.0 + c));
        }
        values
    }

    #[test]
    fn rate_of_change_judges_against_a_calm_history() {
        // Eight changes of 2% and 4%: mean 3%, std 1%. A 10% step is z = 7.
        let mut changes = [0.02, 0.04].repeat(4);
        changes.push(0.10);
        let findings = rate_of_change_findings(&compound(&changes), 0.15, 7, 2.0);
        assert_eq!(findings.len(), 1, "{findings:?}");
        assert_eq!(findings[0].index, 9);
        assert!((findings[0].deviation - 7.0).abs() < 1e-6);
        assert!((findings[0].severity - 7.0 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn rate_of_change_tolerates_a_volatile_history() {
        // Swings of +25% and -20% break the fixed limit at first. Once seven
        // of them are on record they are routine, and so is another +20%.
        let mut changes = [0.25, -0.20].repeat(4);
        changes.push(0.20);
        let findings = rate_of_change_findings(&compound(&changes), 0.15, 7, 2.0);
        assert!(findings.iter().any(|f| f.index == 1));
        assert!(findings.iter().all(|f| f.index < 8), "{findings:?}");
    }

    #[test]
    fn rate_of_change_uses_the_fixed_threshold_until_history_builds() {
        // Four calm changes, then 10%: below 15% and too little history to score.
        let values = compound(&[0.02, 0.04, 0.02, 0.04, 0.10]);
        assert!(rate_of_change_findings(&values, 0.15, 7, 2.0).is_empty());
        let flat = compound(&[0.0; 8]);
        assert!(rate_of_change_findings(&flat, 0.15, 7, 2.0).is_empty());
    }
}
