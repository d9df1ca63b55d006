//! Seeded synthetic record streams for demos and determinism tests.
//!
//! One subscription per customer, exported at every month end by up to
//! three sources:
//!   billing    - every live subscription, clean names, `sub_NNNNN` ids
//!   crm        - a subset of the same subscriptions under `opp_NNNNN` ids,
//!                with noisy company names, phone formatting and email case
//!   warehouse  - an occasional replayed copy of a billing row, landed half
//!                an hour before the billing export itself
//!
//! Month by month, live subscriptions may churn, expand or contract, and new
//! ones start. An optional spike adds a burst of new revenue in one month.
//! Same config, same records.

use crate::{
    name_generator::NameGenerator,
    record::{fields, EntityType, NormalizedRecord},
    rng::{RngBank, StreamRng, StreamSlot},
    types::Period,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const BILLING_SOURCE: &str = "billing";
pub const CRM_SOURCE: &str = "crm";
pub const WAREHOUSE_SOURCE: &str = "warehouse";

/// Base monthly price per seat.
const PLANS: &[(&str, f64)] = &[("starter", 49.0), ("growth", 249.0), ("scale", 999.0)];

const SPIKE_SUBSCRIPTIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spike {
    /// Zero-based month index.
    pub month:  usize,
    /// New revenue added that month, as a multiple of the opening MRR.
    pub factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub seed:             u64,
    pub customers:        usize,
    pub months:           usize,
    pub start:            Period,
    pub new_rate:         f64,
    pub churn_rate:       f64,
    pub expansion_rate:   f64,
    pub contraction_rate: f64,
    /// Share of subscriptions the CRM also holds.
    pub crm_coverage:     f64,
    /// Share of billing exports the warehouse replays.
    pub duplicate_rate:   f64,
    pub spike:            Option<Spike>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            seed:             42,
            customers:        60,
            months:           12,
            start:            Period::january(2024),
            new_rate:         0.05,
            churn_rate:       0.03,
            expansion_rate:   0.06,
            contraction_rate: 0.03,
            crm_coverage:     0.7,
            duplicate_rate:   0.05,
            spike:            None,
        }
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    number:      usize,
    company:     String,
    crm_company: Option<String>,
    email:       String,
    domain:      String,
    phone:       String,
    plan:        &'static str,
    start:       NaiveDate,
    end:         Option<NaiveDate>,
    amount:      f64,
    /// Amount at the last month end, when it changed this month.
    previous:    Option<f64>,
    crm_lag:     i64,
}

impl Subscription {
    fn live_during(&self, period: Period) -> bool {
        self.start <= period.end() && self.end.map_or(true, |end| end >= period.start())
    }
}

/// Generator state for one synthetic dataset.
pub struct SyntheticGenerator {
    config:     SyntheticConfig,
    customers:  StreamRng,
    lifecycle:  StreamRng,
    amounts:    StreamRng,
    duplicates: StreamRng,
    contacts:   StreamRng,
    used_domains: BTreeSet<String>,
    next_number:  usize,
}

impl SyntheticGenerator {
    pub fn new(config: SyntheticConfig) -> Self {
        let bank = RngBank::new(config.seed);
        Self {
            customers:   bank.stream(StreamSlot::Customers),
            lifecycle:   bank.stream(StreamSlot::Lifecycle),
            amounts:     bank.stream(StreamSlot::Amounts),
            duplicates:  bank.stream(StreamSlot::Duplicates),
            contacts:    bank.stream(StreamSlot::Contacts),
            used_domains: BTreeSet::new(),
            next_number: 1,
            config,
        }
    }

    /// Every period the dataset covers, oldest first.
    pub fn periods(&self) -> Vec<Period> {
        let mut out = Vec::with_capacity(self.config.months);
        let mut p = self.config.start;
        for _ in 0..self.config.months {
            out.push(p);
            p = p.next();
        }
        out
    }

    /// All records of all months, in export order.
    pub fn generate(mut self) -> Vec<NormalizedRecord> {
        let periods = self.periods();
        let Some(&first) = periods.first() else {
            return Vec::new();
        };

        let mut subs: Vec<Subscription> = Vec::new();
        for _ in 0..self.config.customers {
            let age = 30 + self.lifecycle.next_u64_below(690) as i64;
            let start = first.start() - Duration::days(age);
            subs.push(self.new_subscription(start, None));
        }

        let mut records = Vec::new();
        for (month, &period) in periods.iter().enumerate() {
            let opening_mrr: f64 = subs
                .iter()
                .filter(|s| s.start < period.start() && s.end.is_none())
                .map(|s| s.amount)
                .sum();

            for sub in subs.iter_mut() {
                sub.previous = None;
                if sub.start >= period.start() || sub.end.is_some() {
                    continue;
                }
                self.advance(sub, period);
            }

            let live = subs.iter().filter(|s| s.end.is_none()).count() as f64;
            let expected = live * self.config.new_rate;
            let mut new_count = expected.floor() as usize;
            if self.lifecycle.chance(expected.fract()) {
                new_count += 1;
            }
            for _ in 0..new_count {
                let start = period.start() + Duration::days(self.lifecycle.next_u64_below(28) as i64);
                subs.push(self.new_subscription(start, None));
            }

            if let Some(spike) = self.config.spike.filter(|s| s.month == month) {
                let each = round_cents(opening_mrr * spike.factor / SPIKE_SUBSCRIPTIONS as f64);
                log::debug!("synthetic: spike of {SPIKE_SUBSCRIPTIONS} x {each:.2} in {period}");
                for _ in 0..SPIKE_SUBSCRIPTIONS {
                    let start = period.start() + Duration::days(self.lifecycle.next_u64_below(28) as i64);
                    subs.push(self.new_subscription(start, Some(each)));
                }
            }

            for sub in subs.iter().filter(|s| s.live_during(period)) {
                records.extend(self.export(sub, period));
            }
        }

        log::info!(
            "synthetic: seed {} produced {} records for {} subscriptions over {} months",
            self.config.seed,
            records.len(),
            subs.len(),
            periods.len()
        );
        records
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    fn advance(&mut self, sub: &mut Subscription, period: Period) {
        let opening = sub.amount;
        if self.lifecycle.chance(self.config.churn_rate) {
            let offset = self.lifecycle.next_u64_below(28) as i64;
            sub.end = Some(period.start() + Duration::days(offset));
            sub.previous = Some(opening);
        } else if self.lifecycle.chance(self.config.expansion_rate) {
            sub.amount = round_cents(opening * self.amounts.range(1.1, 1.6));
            sub.previous = Some(opening);
        } else if self.lifecycle.chance(self.config.contraction_rate) {
            sub.amount = round_cents(opening * self.amounts.range(0.5, 0.9));
            sub.previous = Some(opening);
        }
    }

    fn new_subscription(&mut self, start: NaiveDate, amount: Option<f64>) -> Subscription {
        let number = self.next_number;
        self.next_number += 1;

        let company = self.unique_company_name();
        let domain = NameGenerator::domain_for(&company);
        let contact = NameGenerator::contact_name(&mut self.contacts);
        let phone = format!(
            "{:03}{:03}{:04}",
            200 + self.contacts.next_u64_below(800),
            self.contacts.next_u64_below(1000),
            self.contacts.next_u64_below(10_000)
        );

        let (plan, base) = self.amounts.pick(PLANS).copied().unwrap_or(PLANS[0]);
        let seats = 1.0 + self.amounts.next_u64_below(5) as f64;
        let amount = amount.unwrap_or_else(|| round_cents(base * seats));

        let crm_company = self
            .duplicates
            .chance(self.config.crm_coverage)
            .then(|| NameGenerator::noisy_variant(&company, &mut self.duplicates));
        let crm_lag = self.duplicates.next_u64_below(4) as i64;

        Subscription {
            number,
            email: format!("{contact}@{domain}"),
            company,
            crm_company,
            domain,
            phone,
            plan,
            start,
            end: None,
            amount,
            previous: None,
            crm_lag,
        }
    }

    /// Unique up to legal suffix, so no two customers share a domain.
    fn unique_company_name(&mut self) -> String {
        let mut name = NameGenerator::company_name(&mut self.customers);
        let mut attempt = 1;
        while self.used_domains.contains(&NameGenerator::domain_for(&name)) {
            attempt += 1;
            let base = NameGenerator::company_name(&mut self.customers);
            name = match base.rsplit_once(' ') {
                Some((head, suffix)) => format!("{head} {attempt} {suffix}"),
                None => format!("{base} {attempt}"),
            };
        }
        self.used_domains.insert(NameGenerator::domain_for(&name));
        name
    }

    // ── Export ───────────────────────────────────────────────────────────────

    fn export(&mut self, sub: &Subscription, period: Period) -> Vec<NormalizedRecord> {
        let status = match sub.end {
            Some(end) if end <= period.end() => "canceled",
            _ => "active",
        };
        let mut out = Vec::new();

        let billing_at = month_end_at(period, 23 * 60);
        let mut billing = NormalizedRecord::new(
            BILLING_SOURCE,
            EntityType::Subscription,
            format!("sub_{:05}", sub.number),
            billing_at,
        )
        .with(fields::CUSTOMER_ID, format!("cus_{:05}", sub.number))
        .with(fields::EMAIL, sub.email.as_str())
        .with(fields::COMPANY_NAME, sub.company.as_str())
        .with(fields::DOMAIN, sub.domain.as_str())
        .with(fields::PHONE, format_phone_e164(&sub.phone))
        .with(fields::PLAN, sub.plan)
        .with(fields::STATUS, status)
        .with(fields::START_DATE, sub.start.to_string())
        .with(fields::AMOUNT, format!("{:.2}", sub.amount));
        if let Some(end) = sub.end {
            billing = billing.with(fields::END_DATE, end.to_string());
        }
        if let Some(previous) = sub.previous {
            billing = billing.with(fields::PREVIOUS_AMOUNT, format!("{previous:.2}"));
        }

        if self.duplicates.chance(self.config.duplicate_rate) {
            let mut replay = billing.clone();
            replay.source_id = WAREHOUSE_SOURCE.to_string();
            replay.ingested_at = billing_at - Duration::minutes(30);
            out.push(replay);
        }
        out.push(billing);

        if let Some(crm_company) = &sub.crm_company {
            let crm_at = month_end_at(period, 60 * (1 + self.duplicates.next_u64_below(20) as i64));
            let email = if self.duplicates.chance(0.5) {
                sub.email.to_uppercase()
            } else {
                sub.email.clone()
            };
            let mut crm = NormalizedRecord::new(
                CRM_SOURCE,
                EntityType::Subscription,
                format!("opp_{:05}", sub.number),
                crm_at,
            )
            .with(fields::EMAIL, email)
            .with(fields::COMPANY_NAME, crm_company.as_str())
            .with(fields::PHONE, format_phone_local(&sub.phone))
            .with(fields::TIMESTAMP, (sub.start + Duration::days(sub.crm_lag)).to_string())
            .with(fields::AMOUNT, format!("${:.2}", sub.amount));
            if let Some(end) = sub.end {
                crm = crm.with(fields::END_DATE, end.to_string());
            }
            out.push(crm);
        }
        out
    }
}

/// Records for `config`, the usual entry point.
pub fn generate(config: SyntheticConfig) -> Vec<NormalizedRecord> {
    SyntheticGenerator::new(config).generate()
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `minutes` after midnight on the last day of `period`.
fn month_end_at(period: Period, minutes: i64) -> DateTime<Utc> {
    let midnight = period.end().and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
    midnight + Duration::minutes(minutes)
}

fn format_phone_e164(digits: &str) -> String {
    format!("+1 {}-{}-{}", &digits[0..3], &digits[3..6], &digits[6..10])
}

fn format_phone_local(digits: &str) -> String {
    format!("({}) {}-{}", &digits[0..3], &digits[3..6], &digits[6..10])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SyntheticConfig {
        SyntheticConfig { customers: 20, months: 4, ..Default::default() }
    }

    #[test]
    fn same_seed_same_records() {
        assert_eq!(generate(small()), generate(small()));
        let other = SyntheticConfig { seed: 7, ..small() };
        assert_ne!(generate(small()), generate(other));
    }

    #[test]
    fn every_record_lands_in_a_generated_period() {
        let generator = SyntheticGenerator::new(small());
        let periods = generator.periods();
        let records = generator.generate();
        assert!(!records.is_empty());
        for r in &records {
            assert!(periods.contains(&r.snapshot_period()), "{}", r.ingested_at);
            assert!(r.amount().is_some());
        }
    }

    #[test]
    fn first_month_prices_are_whole_seats() {
        let generator = SyntheticGenerator::new(small());
        let first = generator.periods()[0];
        let records = generator.generate();
        let fresh = records.iter().filter(|r| {
            r.source_id == BILLING_SOURCE
                && r.snapshot_period() == first
                && r.field(fields::PREVIOUS_AMOUNT).is_none()
        });
        let mut checked = 0;
        for r in fresh {
            let plan = r.field(fields::PLAN).unwrap();
            let base = PLANS.iter().find(|(name, _)| *name == plan).unwrap().1;
            let seats = r.amount().unwrap() / base;
            assert!((1.0..=5.0).contains(&seats), "{plan}: {seats} seats");
            assert!((seats - seats.round()).abs() < 1e-9, "{plan}: {seats} seats");
            checked += 1;
        }
        assert!(checked > 0);
    }

    #[test]
    fn replays_come_from_the_warehouse() {
        let config = SyntheticConfig { duplicate_rate: 1.0, ..small() };
        let records = generate(config);
        let billing = records.iter().filter(|r| r.source_id == BILLING_SOURCE).count();
        let warehouse: Vec<&NormalizedRecord> =
            records.iter().filter(|r| r.source_id == WAREHOUSE_SOURCE).collect();
        assert_eq!(warehouse.len(), billing);
        assert!(warehouse.iter().all(|r| r.external_id.starts_with("sub_")));
    }

    #[test]
    fn month_end_timestamps() {
        let at = month_end_at(Period::january(2024), 23 * 60);
        assert_eq!(at.to_rfc3339(), "2024-01-31T23:00:00+00:00");
    }

    #[test]
    fn phone_formats_normalize_alike() {
        use crate::normalize::normalize_phone;
        assert_eq!(
            normalize_phone(&format_phone_e164("5550101234")),
            normalize_phone(&format_phone_local("5550101234"))
        );
    }
}
