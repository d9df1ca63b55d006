//! THE MOST IMPORTANT TEST IN THE PROJECT.
//!
//! Two pipelines, same seed, same records.
//! They must produce identical entities, bit-identical metric values and
//! identical anomalies. Any divergence is a blocker: do not merge until fixed.

use revenue_core::{
    config::PipelineConfig,
    engine::{CancellationToken, PipelineReport, RevenuePipeline},
    synthetic::{self, Spike, SyntheticConfig},
};

fn run(seed: u64) -> PipelineReport {
    let records = synthetic::generate(SyntheticConfig {
        seed,
        customers: 80,
        months: 12,
        spike: Some(Spike { month: 9, factor: 0.6 }),
        ..Default::default()
    });
    let mut pipeline = RevenuePipeline::new(&PipelineConfig::default()).expect("default config");
    pipeline
        .run(&format!("det-test-{seed}"), "acme", &records, &CancellationToken::new())
        .expect("pipeline run")
}

#[test]
fn same_seed_produces_identical_reports() {
    const SEED: u64 = 0xDEAD_BEEF_CAFE_1234;

    let a = run(SEED);
    let b = run(SEED);

    assert_eq!(a.snapshots.len(), b.snapshots.len());
    for (sa, sb) in a.snapshots.iter().zip(&b.snapshots) {
        assert_eq!(sa.entities, sb.entities, "entities diverged in {}", sa.period);
    }

    assert_eq!(a.metric_values.len(), b.metric_values.len());
    for (va, vb) in a.metric_values.iter().zip(&b.metric_values) {
        assert_eq!(
            va.value.to_bits(),
            vb.value.to_bits(),
            "{} {} diverged:\n  A: {}\n  B: {}",
            va.metric_id, va.period, va.value, vb.value
        );
    }

    assert_eq!(a.lineage, b.lineage);
    assert_eq!(a.anomalies, b.anomalies);
    assert_eq!(a.events, b.events);
}

#[test]
fn different_seeds_produce_different_reports() {
    let a = run(42);
    let b = run(99);

    // This test verifies that seed differences are actually observable.
    let any_different = a
        .metric_values
        .iter()
        .zip(&b.metric_values)
        .any(|(x, y)| x.value != y.value);
    assert!(any_different, "Different seeds produced identical metrics: seed is not being used");
}
