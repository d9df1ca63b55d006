use revenue_core::{
    anomaly_detector::{AnomalyDetector, Method, Movement},
    config::AnomalyConfig,
    error::{ConfigError, PipelineError, Stage},
    metric_engine::MetricValue,
    ontology::Unit,
    types::Period,
};
use std::collections::BTreeMap;

// ── Helpers ──────────────────────────────────────────────────────────────────

fn series(metric_id: &str, values: &[f64]) -> Vec<MetricValue> {
    let mut period = Period::january(2024);
    values
        .iter()
        .map(|&value| {
            let v = MetricValue {
                metric_id: metric_id.to_string(),
                tenant_id: "acme".to_string(),
                period,
                value,
                unit: Unit::Currency,
                breakdown: None,
                warnings: Vec::new(),
                previous_value: None,
                change_absolute: None,
                change_percent: None,
            };
            period = period.next();
            v
        })
        .collect()
}

fn detector() -> AnomalyDetector {
    let _ = env_logger::builder().is_test(true).try_init();
    AnomalyDetector::new(AnomalyConfig::default()).unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// Six flat months then a 5x jump: flagged by both methods in month seven.
#[test]
fn revenue_jump_is_flagged_by_both_methods() {
    let values = series("mrr", &[100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 500.0]);
    let anomalies = detector().detect(&values).unwrap();

    assert_eq!(anomalies.len(), 2, "{anomalies:?}");
    let july = Period::new(2024, 7).unwrap();
    assert!(anomalies.iter().all(|a| a.period == july && a.direction == Movement::Up));

    let z = anomalies.iter().find(|a| a.method == Method::Zscore).unwrap();
    assert_eq!(z.baseline, 100.0);
    assert_eq!(z.observed_value, 500.0);
    assert!(z.severity > 0.99, "z severity {}", z.severity);

    let roc = anomalies.iter().find(|a| a.method == Method::RateOfChange).unwrap();
    assert!((roc.deviation - 4.0).abs() < 1e-12);
    assert!((roc.severity - 4.0 / 4.15).abs() < 1e-12);
    assert!(roc.severity < 1.0);
}

#[test]
fn steady_series_has_no_anomalies() {
    let values = series("mrr", &[250.0; 12]);
    assert!(detector().detect(&values).unwrap().is_empty());
}

#[test]
fn short_history_is_quiet_not_an_error() {
    // Three points: no z-score window yet, and no large moves.
    let values = series("mrr", &[100.0, 104.0, 101.0]);
    assert!(detector().detect(&values).unwrap().is_empty());
    assert!(detector().detect(&[]).unwrap().is_empty());
}

#[test]
fn zero_baseline_is_skipped_by_rate_of_change() {
    let values = series("new_mrr", &[0.0, 80.0]);
    assert!(detector().detect(&values).unwrap().is_empty());
}

#[test]
fn noisy_window_uses_standard_score() {
    // Mean 100, population std 10.
    let values = series("mrr", &[90.0, 110.0, 90.0, 110.0, 90.0, 110.0, 135.0]);
    let anomalies = detector().detect(&values).unwrap();

    let z = anomalies.iter().find(|a| a.method == Method::Zscore).unwrap();
    assert!((z.deviation - 3.5).abs() < 1e-9);
    assert!((z.severity - 3.5 / 5.5).abs() < 1e-9);
}

#[test]
fn drops_are_flagged_downward() {
    let values = series("mrr", &[1000.0, 1010.0, 990.0, 1000.0, 1005.0, 995.0, 600.0]);
    let anomalies = detector().detect(&values).unwrap();

    assert!(!anomalies.is_empty());
    assert!(anomalies.iter().all(|a| a.direction == Movement::Down && a.deviation < 0.0));
}

#[test]
fn input_order_does_not_matter() {
    let mut values = series("mrr", &[100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 500.0]);
    let expected = detector().detect(&values).unwrap();
    values.reverse();
    assert_eq!(detector().detect(&values).unwrap(), expected);
}

#[test]
fn component_series_are_scanned_with_their_parent() {
    let mut values = series("mrr", &[100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0]);
    for (i, v) in values.iter_mut().enumerate() {
        let new = if i == 6 { 60.0 } else { 10.0 };
        v.breakdown = Some(BTreeMap::from([
            ("new_mrr".to_string(), new),
            ("prior_mrr".to_string(), 90.0),
        ]));
    }

    let anomalies = detector().detect(&values).unwrap();
    assert!(!anomalies.is_empty());
    assert!(anomalies
        .iter()
        .all(|a| a.metric_id == "new_mrr" && a.component_of.as_deref() == Some("mrr")));

    let quiet = AnomalyDetector::new(AnomalyConfig { detect_components: false, ..Default::default() })
        .unwrap()
        .detect(&values)
        .unwrap();
    assert!(quiet.is_empty());
}

#[test]
fn detect_all_scans_each_series() {
    let map = BTreeMap::from([
        ("mrr".to_string(), series("mrr", &[100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 500.0])),
        ("arpu".to_string(), series("arpu", &[50.0; 7])),
    ]);
    let anomalies = detector().detect_all(&map).unwrap();
    assert_eq!(anomalies.len(), 2);
    assert!(anomalies.iter().all(|a| a.metric_id == "mrr"));
}

#[test]
fn mixed_series_are_rejected() {
    let mut values = series("mrr", &[1.0, 2.0]);
    values.extend(series("arpu", &[3.0]));
    match detector().detect(&values) {
        Err(PipelineError::MetricFailed { stage, .. }) => assert_eq!(stage, Stage::Detection),
        other => panic!("expected MetricFailed, got {other:?}"),
    }

    let mut repeated = series("mrr", &[1.0, 2.0]);
    repeated.push(repeated[0].clone());
    assert!(detector().detect(&repeated).is_err());
}

#[test]
fn degenerate_config_is_rejected() {
    let err = AnomalyDetector::new(AnomalyConfig { window: 1, ..Default::default() });
    assert!(matches!(
        err,
        Err(PipelineError::Config(ConfigError::InvalidSetting { name: "window", .. }))
    ));
    let err = AnomalyDetector::new(AnomalyConfig { rate_history: 1, ..Default::default() });
    assert!(matches!(
        err,
        Err(PipelineError::Config(ConfigError::InvalidSetting { name: "rate_history", .. }))
    ));
}
