//! Blocking index: partitions records into small candidate buckets so the
//! scorer never compares all n² pairs.
//!
//! A record is placed in one bucket per key it yields:
//!   - exact normalized email
//!   - company domain (website or email domain, free-mail excluded)
//!   - company-name prefix (first N chars of the folded name, spaces removed)
//!   - phone digits
//!
//! Keys are namespaced by entity type: only records of the same type meet.
//! Records yielding no key land in no bucket and become singleton clusters.
//!
//! Only records from different sources are paired: two rows of one export
//! (two subscriptions of one customer, say) stay separate entities.

use crate::{
    normalize,
    record::NormalizedRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Two record indices (`left < right`) and the first key that paired them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub left:         usize,
    pub right:        usize,
    pub blocking_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingStats {
    pub buckets:           usize,
    pub skipped_buckets:   usize,
    pub candidate_pairs:   usize,
    /// Within-bucket pairs dropped because both records share a source.
    pub same_source_pairs: usize,
    pub unblocked:         usize,
}

/// Bucket key → record indices, in key order.
#[derive(Debug, Clone, Default)]
pub struct BlockingIndex {
    buckets: BTreeMap<String, Vec<usize>>,
    unblocked: Vec<usize>,
    /// `source_id` of every record, by index.
    sources: Vec<String>,
}

impl BlockingIndex {
    pub fn build(records: &[NormalizedRecord], name_prefix_len: usize) -> Self {
        let mut index = Self::default();
        for (i, record) in records.iter().enumerate() {
            index.sources.push(record.source_id.clone());
            let keys = blocking_keys(record, name_prefix_len);
            if keys.is_empty() {
                index.unblocked.push(i);
                continue;
            }
            for key in keys {
                index.buckets.entry(key).or_default().push(i);
            }
        }
        index
    }

    pub fn bucket(&self, key: &str) -> Option<&[usize]> {
        self.buckets.get(key).map(Vec::as_slice)
    }

    pub fn buckets(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.buckets.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Records that produced no blocking key at all.
    pub fn unblocked(&self) -> &[usize] {
        &self.unblocked
    }

    /// Every distinct cross-source pair within a bucket, ordered by
    /// `(left, right)`.
    ///
    /// A pair reachable through several buckets is emitted once, carrying
    /// the lexicographically first key. Buckets above `max_bucket_size`
    /// are skipped.
    pub fn candidate_pairs(&self, max_bucket_size: usize) -> (Vec<CandidatePair>, BlockingStats) {
        let mut seen: BTreeMap<(usize, usize), &str> = BTreeMap::new();
        let mut same_source: BTreeSet<(usize, usize)> = BTreeSet::new();
        let mut stats = BlockingStats {
            buckets: self.buckets.len(),
            unblocked: self.unblocked.len(),
            ..BlockingStats::default()
        };

        for (key, members) in &self.buckets {
            if members.len() > max_bucket_size {
                log::warn!(
                    "blocking: skipping bucket '{key}' with {} records (limit {max_bucket_size})",
                    members.len()
                );
                stats.skipped_buckets += 1;
                continue;
            }
            for (a, &left) in members.iter().enumerate() {
                for &right in &members[a + 1..] {
                    if self.sources[left] == self.sources[right] {
                        same_source.insert((left, right));
                        continue;
                    }
                    seen.entry((left, right)).or_insert(key.as_str());
                }
            }
        }

        let pairs: Vec<CandidatePair> = seen
            .into_iter()
            .map(|((left, right), key)| CandidatePair {
                left,
                right,
                blocking_key: key.to_string(),
            })
            .collect();
        stats.candidate_pairs = pairs.len();
        stats.same_source_pairs = same_source.len();
        log::debug!(
            "blocking: {} buckets, {} candidate pairs ({} same-source skipped), {} unblocked records",
            stats.buckets, stats.candidate_pairs, stats.same_source_pairs, stats.unblocked
        );
        (pairs, stats)
    }
}

/// All blocking keys of one record, deduplicated and sorted.
pub fn blocking_keys(record: &NormalizedRecord, name_prefix_len: usize) -> Vec<String> {
    let ty = record.entity_type;
    let mut keys = BTreeSet::new();

    if let Some(email) = record.email() {
        keys.insert(format!("{ty}|email:{email}"));
    }
    if let Some(domain) = record.company_domain() {
        if !normalize::is_free_mail(&domain) {
            keys.insert(format!("{ty}|domain:{domain}"));
        }
    }
    if let Some(name) = record.company_name() {
        let compact: String = name.chars().filter(|c| !c.is_whitespace()).collect();
        let prefix: String = compact.chars().take(name_prefix_len).collect();
        if !prefix.is_empty() {
            keys.insert(format!("{ty}|name:{prefix}"));
        }
    }
    if let Some(phone) = record.phone() {
        keys.insert(format!("{ty}|phone:{phone}"));
    }
    keys.into_iter().collect()
}
