//! Entity resolver: blocking, scoring, clustering and canonical selection
//! composed into one deterministic pass.
//!
//! EXECUTION ORDER (fixed):
//!   1. validate records (non-empty external id, unique key)
//!   2. build blocking index, enumerate candidate pairs
//!   3. score every candidate pair
//!   4. cluster accepted pairs (connected components)
//!   5. select one canonical entity per cluster
//!
//! Same records in the same order with the same config always yield the
//! same clusters and the same entity ids.

use crate::{
    blocking::{BlockingIndex, BlockingStats},
    canonical::{select_canonical, CanonicalEntity},
    clustering::build_clusters,
    config::ResolutionConfig,
    error::{PipelineError, PipelineResult, Stage},
    record::NormalizedRecord,
    scoring::{MatchScore, PairScorer},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionStats {
    pub records:        usize,
    pub blocking:       BlockingStats,
    pub accepted_pairs: usize,
    pub review_pairs:   usize,
    pub entities:       usize,
    pub singletons:     usize,
}

/// Everything one resolution pass produced, for callers that want more
/// than the entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub entities: Vec<CanonicalEntity>,
    /// Every scored candidate pair, accepted or not.
    pub scores:   Vec<MatchScore>,
    /// Pairs in the review band: close, but never merged.
    pub review:   Vec<MatchScore>,
    pub stats:    ResolutionStats,
}

#[derive(Debug, Clone)]
pub struct EntityResolver {
    config: ResolutionConfig,
    scorer: PairScorer,
}

impl EntityResolver {
    /// Validates the configuration before any record is seen.
    pub fn new(config: ResolutionConfig) -> PipelineResult<Self> {
        config.validate()?;
        let scorer = PairScorer::new(&config);
        Ok(Self { config, scorer })
    }

    pub fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    pub fn resolve(&self, records: &[NormalizedRecord]) -> PipelineResult<Vec<CanonicalEntity>> {
        Ok(self.resolve_detailed(records)?.entities)
    }

    pub fn resolve_detailed(&self, records: &[NormalizedRecord]) -> PipelineResult<ResolutionReport> {
        validate_records(records)?;

        let index = BlockingIndex::build(records, self.config.name_prefix_len);
        let (pairs, blocking) = index.candidate_pairs(self.config.max_bucket_size);

        let scores: Vec<MatchScore> = pairs
            .iter()
            .map(|pair| self.scorer.score(pair, &records[pair.left], &records[pair.right]))
            .collect();

        let review: Vec<MatchScore> = scores
            .iter()
            .filter(|s| !s.accepted && s.total >= self.config.review_threshold)
            .cloned()
            .collect();

        let clusters = build_clusters(records.len(), &scores);
        let entities: Vec<CanonicalEntity> = clusters
            .iter()
            .filter_map(|c| select_canonical(records, c, &self.config.numeric_fields))
            .collect();

        let stats = ResolutionStats {
            records: records.len(),
            blocking,
            accepted_pairs: scores.iter().filter(|s| s.accepted).count(),
            review_pairs: review.len(),
            entities: entities.len(),
            singletons: entities.iter().filter(|e| e.is_singleton()).count(),
        };
        log::info!(
            "resolution: {} records -> {} entities ({} accepted pairs, {} for review)",
            stats.records, stats.entities, stats.accepted_pairs, stats.review_pairs
        );
        for r in &review {
            log::debug!(
                "resolution: review {} <> {} scored {:.4}",
                records[r.left].key(), records[r.right].key(), r.total
            );
        }

        Ok(ResolutionReport { entities, scores, review, stats })
    }
}

fn validate_records(records: &[NormalizedRecord]) -> PipelineResult<()> {
    let mut seen = BTreeSet::new();
    for (index, record) in records.iter().enumerate() {
        if record.external_id.trim().is_empty() {
            return Err(PipelineError::InvalidRecord {
                stage: Stage::Resolution,
                index,
                record_key: record.key(),
                reason: "external_id is empty".into(),
            });
        }
        let key = record.key();
        if !seen.insert(key.clone()) {
            return Err(PipelineError::InvalidRecord {
                stage: Stage::Resolution,
                index,
                record_key: key,
                reason: "duplicate source_id/external_id in one batch".into(),
            });
        }
    }
    Ok(())
}
