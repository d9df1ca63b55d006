//! Canonical selector: one merged entity per cluster.
//!
//! Merge policy, per field:
//!   - numeric fields: value from the most complete record
//!   - everything else: value from the most recently ingested record
//!   - ties: lexicographically smallest external_id, then source_id
//!
//! No randomness anywhere: the same cluster always yields the same entity.

use crate::{
    clustering::Cluster,
    normalize,
    record::{fields, populated, EntityType, Lifecycle, NormalizedRecord},
    types::{EntityId, RecordKey},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Namespace for v5 entity ids. Changing it changes every id.
const ENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x5e1f_0c3a_7b2d_4e91_a6c8_03d4_f2b7_19e5);

/// Which record won a merged field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSource {
    pub source_id:   String,
    pub external_id: String,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub entity_id:      EntityId,
    pub entity_type:    EntityType,
    pub fields:         BTreeMap<String, String>,
    pub provenance:     BTreeMap<String, FieldSource>,
    /// Sorted `source_id:external_id` keys of every member record.
    pub member_ids:     Vec<RecordKey>,
    pub confidence:     f64,
    pub max_confidence: f64,
    pub source_count:   usize,
}

impl CanonicalEntity {
    pub fn field(&self, name: &str) -> Option<&str> {
        populated(&self.fields, name)
    }

    pub fn amount(&self) -> Option<f64> {
        self.field(fields::AMOUNT).and_then(normalize::parse_amount)
    }

    /// Amount at the start of the period: `previous_amount`, else `amount`.
    pub fn opening_amount(&self) -> Option<f64> {
        self.field(fields::PREVIOUS_AMOUNT)
            .and_then(normalize::parse_amount)
            .or_else(|| self.amount())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_fields(&self.fields)
    }

    /// Key used for distinct-customer counts: customer id, else email, else
    /// the entity itself.
    pub fn customer_key(&self) -> String {
        self.field(fields::CUSTOMER_ID)
            .map(str::to_string)
            .or_else(|| self.field(fields::EMAIL).and_then(normalize::normalize_email))
            .unwrap_or_else(|| self.entity_id.clone())
    }

    pub fn is_singleton(&self) -> bool {
        self.member_ids.len() == 1
    }
}

/// Deterministic id: UUID v5 over the sorted member keys.
pub fn entity_id_for(member_ids: &[RecordKey]) -> EntityId {
    Uuid::new_v5(&ENTITY_NAMESPACE, member_ids.join("\n").as_bytes()).to_string()
}

/// Merge one cluster of `records` into a canonical entity.
///
/// `cluster.members` must be non-empty and index into `records`.
pub fn select_canonical(
    records: &[NormalizedRecord],
    cluster: &Cluster,
    numeric_fields: &[String],
) -> Option<CanonicalEntity> {
    let members: Vec<&NormalizedRecord> =
        cluster.members.iter().filter_map(|&i| records.get(i)).collect();
    let first = members.first()?;

    let mut member_ids: Vec<RecordKey> = members.iter().map(|r| r.key()).collect();
    member_ids.sort();
    member_ids.dedup();

    let names: BTreeSet<&str> = members
        .iter()
        .flat_map(|r| r.fields.keys().map(String::as_str))
        .collect();

    let mut merged = BTreeMap::new();
    let mut provenance = BTreeMap::new();
    for name in names {
        let numeric = numeric_fields.iter().any(|f| f == name);
        let winner = members
            .iter()
            .filter(|r| r.field(name).is_some())
            .min_by(|a, b| {
                let primary = if numeric {
                    Reverse(a.completeness()).cmp(&Reverse(b.completeness()))
                } else {
                    Reverse(a.ingested_at).cmp(&Reverse(b.ingested_at))
                };
                primary.then_with(|| tie_break(a, b))
            });
        if let Some(r) = winner {
            if let Some(value) = r.field(name) {
                merged.insert(name.to_string(), value.to_string());
                provenance.insert(
                    name.to_string(),
                    FieldSource {
                        source_id:   r.source_id.clone(),
                        external_id: r.external_id.clone(),
                        ingested_at: r.ingested_at,
                    },
                );
            }
        }
    }

    let source_count = members
        .iter()
        .map(|r| r.source_id.as_str())
        .collect::<BTreeSet<_>>()
        .len();

    Some(CanonicalEntity {
        entity_id: entity_id_for(&member_ids),
        entity_type: first.entity_type,
        fields: merged,
        provenance,
        member_ids,
        confidence: cluster.confidence,
        max_confidence: cluster.max_score,
        source_count,
    })
}

fn tie_break(a: &NormalizedRecord, b: &NormalizedRecord) -> Ordering {
    a.external_id
        .cmp(&b.external_id)
        .then_with(|| a.source_id.cmp(&b.source_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 0, 0, 0).unwrap()
    }

    fn cluster(members: Vec<usize>) -> Cluster {
        Cluster { members, confidence: 0.8, max_score: 0.9 }
    }

    #[test]
    fn recency_wins_text_and_completeness_wins_amount() {
        let records = vec![
            NormalizedRecord::new("crm", EntityType::Subscription, "c-9", at(20))
                .with(fields::COMPANY_NAME, "Acme Incorporated")
                .with(fields::AMOUNT, "95"),
            NormalizedRecord::new("billing", EntityType::Subscription, "b-1", at(2))
                .with(fields::COMPANY_NAME, "Acme Inc")
                .with(fields::AMOUNT, "100")
                .with(fields::PLAN, "pro")
                .with(fields::STATUS, "active"),
        ];
        let numeric = vec!["amount".to_string()];
        let entity = select_canonical(&records, &cluster(vec![0, 1]), &numeric).unwrap();

        assert_eq!(entity.field(fields::COMPANY_NAME), Some("Acme Incorporated"));
        assert_eq!(entity.provenance[fields::COMPANY_NAME].source_id, "crm");
        assert_eq!(entity.field(fields::AMOUNT), Some("100"));
        assert_eq!(entity.provenance[fields::AMOUNT].external_id, "b-1");
        assert_eq!(entity.member_ids, vec!["billing:b-1", "crm:c-9"]);
        assert_eq!(entity.source_count, 2);
    }

    #[test]
    fn ties_go_to_smallest_external_id() {
        let records = vec![
            NormalizedRecord::new("a", EntityType::Customer, "z-2", at(5)).with(fields::PLAN, "basic"),
            NormalizedRecord::new("a", EntityType::Customer, "a-1", at(5)).with(fields::PLAN, "pro"),
        ];
        let entity = select_canonical(&records, &cluster(vec![0, 1]), &[]).unwrap();
        assert_eq!(entity.field(fields::PLAN), Some("pro"));
    }

    #[test]
    fn entity_id_depends_only_on_members() {
        let ids = vec!["billing:1".to_string(), "crm:7".to_string()];
        assert_eq!(entity_id_for(&ids), entity_id_for(&ids.clone()));
        assert_ne!(entity_id_for(&ids), entity_id_for(&ids[..1]));
    }
}
