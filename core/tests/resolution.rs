use chrono::{DateTime, TimeZone, Utc};
use revenue_core::{
    config::{MatchWeights, ResolutionConfig},
    error::{ConfigError, PipelineError, Stage},
    record::{fields, EntityType, NormalizedRecord},
    resolver::EntityResolver,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, 9, 0, 0).unwrap()
}

fn record(source: &str, id: &str) -> NormalizedRecord {
    NormalizedRecord::new(source, EntityType::Subscription, id, at(28))
}

fn resolver() -> EntityResolver {
    let _ = env_logger::builder().is_test(true).try_init();
    EntityResolver::new(ResolutionConfig::default()).expect("default config is valid")
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// Email exact (0.35) + company name after suffix folding (0.25) + shared
/// email domain (0.15) = 0.75, above the 0.70 accept threshold.
#[test]
fn acme_spellings_merge_into_one_entity() {
    let records = vec![
        record("billing", "b-1")
            .with(fields::EMAIL, "a@acme.com")
            .with(fields::COMPANY_NAME, "Acme Inc"),
        record("crm", "c-1")
            .with(fields::EMAIL, "a@acme.com")
            .with(fields::COMPANY_NAME, "ACME INCORPORATED"),
    ];

    let report = resolver().resolve_detailed(&records).unwrap();

    assert_eq!(report.scores.len(), 1);
    let score = &report.scores[0];
    assert!((score.total - 0.75).abs() < 1e-9, "total = {}", score.total);
    assert!(score.accepted);
    assert_eq!(score.dimensions.company_name, 1.0);

    assert_eq!(report.entities.len(), 1);
    let entity = &report.entities[0];
    assert_eq!(entity.member_ids, vec!["billing:b-1", "crm:c-1"]);
    assert_eq!(entity.source_count, 2);
    assert!((entity.confidence - 0.75).abs() < 1e-9);
}

/// A–B and B–C clear the threshold; A–C alone does not. All three still
/// end up in one entity.
#[test]
fn accepted_matches_are_transitive() {
    let config = ResolutionConfig {
        weights: MatchWeights {
            email:        0.3,
            company_name: 0.3,
            domain:       0.1,
            temporal:     0.1,
            amount:       0.1,
            phone:        0.1,
        },
        ..Default::default()
    };
    let records = vec![
        record("crm", "a")
            .with(fields::EMAIL, "x@acme.com")
            .with(fields::COMPANY_NAME, "Acme Inc"),
        record("billing", "b")
            .with(fields::EMAIL, "x@acme.com")
            .with(fields::COMPANY_NAME, "Acme Inc")
            .with(fields::PHONE, "+1 555-010-1234")
            .with(fields::START_DATE, "2025-03-01")
            .with(fields::AMOUNT, "100"),
        record("support", "c")
            .with(fields::EMAIL, "ops@acme.com")
            .with(fields::COMPANY_NAME, "Acme")
            .with(fields::PHONE, "(555) 010-1234")
            .with(fields::START_DATE, "2025-03-01")
            .with(fields::AMOUNT, "$100.00"),
    ];

    let report = EntityResolver::new(config).unwrap().resolve_detailed(&records).unwrap();

    let a_c = report
        .scores
        .iter()
        .find(|s| s.left == 0 && s.right == 2)
        .expect("a and c share a name block");
    assert!(!a_c.accepted, "a-c scored {}", a_c.total);
    assert_eq!(report.stats.accepted_pairs, 2);

    assert_eq!(report.entities.len(), 1);
    assert_eq!(report.entities[0].member_ids.len(), 3);
}

#[test]
fn middling_scores_go_to_review_without_merging() {
    // Emails share only their domain (0.8 x 0.35), name and domain agree:
    // 0.28 + 0.25 + 0.15 = 0.68.
    let records = vec![
        record("billing", "b-1")
            .with(fields::EMAIL, "alice@globex.com")
            .with(fields::COMPANY_NAME, "Globex Corp"),
        record("crm", "c-1")
            .with(fields::EMAIL, "bob@globex.com")
            .with(fields::COMPANY_NAME, "Globex Corporation"),
    ];

    let report = resolver().resolve_detailed(&records).unwrap();

    assert_eq!(report.review.len(), 1);
    assert!((report.review[0].total - 0.68).abs() < 1e-9, "total = {}", report.review[0].total);
    assert!(report.review[0].evidence.iter().any(|e| e.starts_with("email_domain")));
    assert_eq!(report.entities.len(), 2);
    assert_eq!(report.stats.singletons, 2);
}

/// Email, domain, date and amount agree, nothing else is known:
/// 0.35 + 0.15 + 0.10 + 0.10 lands exactly on the 0.70 threshold.
#[test]
fn score_exactly_at_threshold_is_accepted() {
    let records = vec![
        record("billing", "b-1")
            .with(fields::EMAIL, "ops@initech.com")
            .with(fields::START_DATE, "2025-03-01")
            .with(fields::AMOUNT, "100"),
        record("crm", "c-1")
            .with(fields::EMAIL, "OPS@initech.com")
            .with(fields::START_DATE, "2025-03-01")
            .with(fields::AMOUNT, "$100.00"),
    ];

    let report = resolver().resolve_detailed(&records).unwrap();

    assert_eq!(report.scores.len(), 1);
    assert_eq!(report.scores[0].total, 0.7);
    assert!(report.scores[0].accepted);
    assert!(report.review.is_empty());
    assert_eq!(report.entities.len(), 1);
}

/// Two subscriptions of one customer in one billing export share every
/// identifying field but are still two subscriptions.
#[test]
fn records_from_one_source_are_never_paired() {
    let records = vec![
        record("billing", "sub_1")
            .with(fields::CUSTOMER_ID, "cus_1")
            .with(fields::EMAIL, "a@acme.com")
            .with(fields::COMPANY_NAME, "Acme Inc")
            .with(fields::AMOUNT, "100"),
        record("billing", "sub_2")
            .with(fields::CUSTOMER_ID, "cus_1")
            .with(fields::EMAIL, "a@acme.com")
            .with(fields::COMPANY_NAME, "Acme Inc")
            .with(fields::AMOUNT, "200"),
    ];

    let report = resolver().resolve_detailed(&records).unwrap();

    assert!(report.scores.is_empty());
    assert!(report.stats.blocking.same_source_pairs > 0);
    assert_eq!(report.entities.len(), 2);
}

#[test]
fn records_without_match_keys_become_singletons() {
    let records = vec![
        record("billing", "b-1").with(fields::AMOUNT, "10"),
        record("billing", "b-2").with(fields::PLAN, "pro"),
    ];

    let entities = resolver().resolve(&records).unwrap();

    assert_eq!(entities.len(), 2);
    for e in &entities {
        assert!(e.is_singleton());
        assert_eq!(e.confidence, 1.0);
    }
}

#[test]
fn different_entity_types_never_merge() {
    let records = vec![
        NormalizedRecord::new("billing", EntityType::Customer, "cus-1", at(3))
            .with(fields::EMAIL, "a@acme.com")
            .with(fields::COMPANY_NAME, "Acme"),
        NormalizedRecord::new("crm", EntityType::Invoice, "inv-1", at(3))
            .with(fields::EMAIL, "a@acme.com")
            .with(fields::COMPANY_NAME, "Acme"),
    ];
    assert_eq!(resolver().resolve(&records).unwrap().len(), 2);
}

#[test]
fn resolution_is_idempotent_and_order_independent() {
    let records = vec![
        record("billing", "b-1")
            .with(fields::EMAIL, "a@acme.com")
            .with(fields::COMPANY_NAME, "Acme Inc"),
        record("crm", "c-1")
            .with(fields::EMAIL, "a@acme.com")
            .with(fields::COMPANY_NAME, "Acme LLC"),
        record("billing", "b-2")
            .with(fields::EMAIL, "z@initech.com")
            .with(fields::COMPANY_NAME, "Initech"),
    ];
    let r = resolver();

    let first = r.resolve(&records).unwrap();
    let second = r.resolve(&records).unwrap();
    assert_eq!(first, second);

    let mut reversed = records.clone();
    reversed.reverse();
    let mut ids_forward: Vec<String> = first.iter().map(|e| e.entity_id.clone()).collect();
    let mut ids_reversed: Vec<String> =
        r.resolve(&reversed).unwrap().iter().map(|e| e.entity_id.clone()).collect();
    ids_forward.sort();
    ids_reversed.sort();
    assert_eq!(ids_forward, ids_reversed);
}

#[test]
fn empty_batch_resolves_to_nothing() {
    let report = resolver().resolve_detailed(&[]).unwrap();
    assert!(report.entities.is_empty());
    assert_eq!(report.stats.records, 0);
}

#[test]
fn weights_must_sum_to_one() {
    let config = ResolutionConfig {
        weights: MatchWeights { email: 0.45, ..Default::default() },
        ..Default::default()
    };
    match EntityResolver::new(config) {
        Err(PipelineError::Config(ConfigError::WeightSum { sum })) => {
            assert!((sum - 1.10).abs() < 1e-9, "sum = {sum}");
        }
        other => panic!("expected WeightSum, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn duplicate_record_keys_are_rejected() {
    let records = vec![
        record("billing", "b-1").with(fields::EMAIL, "a@acme.com"),
        record("billing", "b-1").with(fields::EMAIL, "b@acme.com"),
    ];
    match resolver().resolve(&records) {
        Err(PipelineError::InvalidRecord { stage, index, record_key, .. }) => {
            assert_eq!(stage, Stage::Resolution);
            assert_eq!(index, 1);
            assert_eq!(record_key, "billing:b-1");
        }
        other => panic!("expected InvalidRecord, got {other:?}"),
    }
}
