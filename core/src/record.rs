//! Normalized records: the only input the core accepts from connectors.
//!
//! RULE: records are immutable once produced. Every stage reads them by
//! index and never rewrites a field in place.

use crate::{
    normalize,
    types::{Period, RecordKey},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Well-known field names ───────────────────────────────────────────────────

pub mod fields {
    pub const EMAIL:           &str = "email";
    pub const COMPANY_NAME:    &str = "company_name";
    pub const DOMAIN:          &str = "domain";
    pub const PHONE:           &str = "phone";
    pub const AMOUNT:          &str = "amount";
    pub const PREVIOUS_AMOUNT: &str = "previous_amount";
    pub const TIMESTAMP:       &str = "timestamp";
    pub const PLAN:            &str = "plan";
    pub const STATUS:          &str = "status";
    pub const START_DATE:      &str = "start_date";
    pub const END_DATE:        &str = "end_date";
    pub const CUSTOMER_ID:     &str = "customer_id";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Customer,
    Subscription,
    Invoice,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Customer     => write!(f, "customer"),
            Self::Subscription => write!(f, "subscription"),
            Self::Invoice      => write!(f, "invoice"),
        }
    }
}

/// One record as emitted by a connector.
///
/// `entity_type`, `external_id` and `ingested_at` are required; every entry
/// in `fields` is optional and compared only when both sides carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source_id:   String,
    pub entity_type: EntityType,
    pub external_id: String,
    #[serde(default)]
    pub fields:      BTreeMap<String, String>,
    pub ingested_at: DateTime<Utc>,
}

impl NormalizedRecord {
    pub fn new(
        source_id: impl Into<String>,
        entity_type: EntityType,
        external_id: impl Into<String>,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            entity_type,
            external_id: external_id.into(),
            fields: BTreeMap::new(),
            ingested_at,
        }
    }

    /// Builder-style field setter, used by connectors and tests.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// `source_id:external_id`.
    pub fn key(&self) -> RecordKey {
        format!("{}:{}", self.source_id, self.external_id)
    }

    /// Trimmed, non-empty field value.
    pub fn field(&self, name: &str) -> Option<&str> {
        populated(&self.fields, name)
    }

    /// Number of populated fields; the tie-breaker for numeric merges.
    pub fn completeness(&self) -> usize {
        self.fields.values().filter(|v| !v.trim().is_empty()).count()
    }

    pub fn email(&self) -> Option<String> {
        self.field(fields::EMAIL).and_then(normalize::normalize_email)
    }

    /// Company domain: the `domain` field, else the email's domain.
    pub fn company_domain(&self) -> Option<String> {
        self.field(fields::DOMAIN)
            .and_then(normalize::normalize_domain)
            .or_else(|| self.field(fields::EMAIL).and_then(normalize::normalize_email_domain))
    }

    pub fn company_name(&self) -> Option<String> {
        self.field(fields::COMPANY_NAME)
            .map(normalize::normalize_company_name)
            .filter(|n| !n.is_empty())
    }

    pub fn phone(&self) -> Option<String> {
        self.field(fields::PHONE).and_then(normalize::normalize_phone)
    }

    pub fn amount(&self) -> Option<f64> {
        self.field(fields::AMOUNT).and_then(normalize::parse_amount)
    }

    /// Event time used by the temporal dimension: `timestamp`, else `start_date`.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        self.field(fields::TIMESTAMP)
            .or_else(|| self.field(fields::START_DATE))
            .and_then(normalize::parse_timestamp)
    }

    /// The monthly snapshot this record belongs to.
    pub fn snapshot_period(&self) -> Period {
        Period::containing(self.ingested_at.date_naive())
    }
}

/// Lifecycle view of a record or canonical entity's field map, used by the
/// metric engine's leaf quantities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lifecycle {
    pub start:  Option<NaiveDate>,
    pub end:    Option<NaiveDate>,
    pub active_status: Option<bool>,
}

const ACTIVE_STATUSES: &[&str] = &["active", "trialing", "past_due"];

/// Trimmed, non-empty value of `name` in a field map.
pub fn populated<'m>(map: &'m BTreeMap<String, String>, name: &str) -> Option<&'m str> {
    map.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

impl Lifecycle {
    pub fn from_fields(map: &BTreeMap<String, String>) -> Self {
        Self {
            start: populated(map, fields::START_DATE).and_then(normalize::parse_date),
            end: populated(map, fields::END_DATE).and_then(normalize::parse_date),
            active_status: populated(map, fields::STATUS)
                .map(|s| ACTIVE_STATUSES.contains(&s.to_lowercase().as_str())),
        }
    }

    /// Whether the subscription is live at the end of `date`.
    ///
    /// With a parsable start date the dates decide; otherwise the status
    /// field does, and an entity with neither is treated as active.
    pub fn active_at(&self, date: NaiveDate) -> bool {
        match self.start {
            Some(start) => {
                if start > date {
                    return false;
                }
                match self.end {
                    Some(end) => end > date,
                    None => self.active_status.unwrap_or(true),
                }
            }
            None => match self.end {
                Some(end) => end > date && self.active_status.unwrap_or(true),
                None => self.active_status.unwrap_or(true),
            },
        }
    }
}
