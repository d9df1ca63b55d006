//! Shared primitive types used across the entire pipeline.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A stable identifier for a canonical entity (derived from its members).
pub type EntityId = String;

/// Identifier of a metric definition in the ontology.
pub type MetricId = String;

/// The tenant whose data is being analysed.
pub type TenantId = String;

/// `source_id:external_id`: unique per record within one snapshot.
pub type RecordKey = String;

/// One pipeline invocation.
pub type RunId = String;

/// Earliest and latest year a period may carry. Every neighbour of a
/// period in this range (`prev`, `next`, their first and last days) is a
/// valid calendar date.
pub const MIN_YEAR: i32 = 1;
pub const MAX_YEAR: i32 = 9999;

/// A calendar month. All metric values are scoped to exactly one period.
///
/// Ordering is chronological. Serialized as `"YYYY-MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year:  i32,
    month: u32,
}

impl Period {
    /// `None` for a month outside 1..=12 or a year outside
    /// `MIN_YEAR..=MAX_YEAR`.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        ((1..=12).contains(&month) && (MIN_YEAR..=MAX_YEAR).contains(&year))
            .then_some(Self { year, month })
    }

    /// January of `year`.
    pub const fn january(year: i32) -> Self {
        Self { year, month: 1 }
    }

    /// The period containing `date`.
    pub fn containing(date: NaiveDate) -> Self {
        Self { year: date.year(), month: date.month() }
    }

    pub fn year(&self) -> i32  { self.year }
    pub fn month(&self) -> u32 { self.month }

    /// First day of the month.
    pub fn start(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .unwrap_or(NaiveDate::MIN)
    }

    /// Last day of the month.
    pub fn end(&self) -> NaiveDate {
        self.next().start().pred_opt().unwrap_or(NaiveDate::MIN)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    pub fn prev(&self) -> Self {
        if self.month == 1 {
            Self { year: self.year - 1, month: 12 }
        } else {
            Self { year: self.year, month: self.month - 1 }
        }
    }

    /// Every period from `self` through `last`, inclusive.
    pub fn through(self, last: Period) -> Vec<Period> {
        let mut out = Vec::new();
        let mut p = self;
        while p <= last {
            out.push(p);
            p = p.next();
        }
        out
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got '{s}'"))?;
        let year: i32 = y.parse().map_err(|_| format!("bad year in '{s}'"))?;
        let month: u32 = m.parse().map_err(|_| format!("bad month in '{s}'"))?;
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(format!("year out of range {MIN_YEAR}..={MAX_YEAR} in '{s}'"));
        }
        Period::new(year, month).ok_or_else(|| format!("month out of range in '{s}'"))
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
