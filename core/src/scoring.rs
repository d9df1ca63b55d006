//! Pairwise scorer: weighted similarity of two records across six
//! dimensions.
//!
//! Each dimension scores in [0, 1]; a dimension either side lacks scores 0
//! rather than failing the comparison. The weighted total is rounded to four
//! decimals before the threshold test so the inclusive boundary is stable
//! under float noise.

use crate::{
    blocking::CandidatePair,
    config::{MatchWeights, ResolutionConfig},
    normalize,
    record::{fields, NormalizedRecord},
};
use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

/// Email score for two addresses on the same company (non-free-mail) domain.
const EMAIL_SAME_DOMAIN: f64 = 0.8;

/// Company-name similarity at or above this counts as an exact match.
const NAME_EXACT_FLOOR: f64 = 0.95;
/// Company-name similarity below this is noise and scores 0.
const NAME_FUZZY_FLOOR: f64 = 0.80;

const SECONDS_PER_DAY: f64 = 86_400.0;

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub email:        f64,
    pub company_name: f64,
    pub domain:       f64,
    pub temporal:     f64,
    pub amount:       f64,
    pub phone:        f64,
}

impl DimensionScores {
    pub fn weighted_total(&self, w: &MatchWeights) -> f64 {
        let total = self.email * w.email
            + self.company_name * w.company_name
            + self.domain * w.domain
            + self.temporal * w.temporal
            + self.amount * w.amount
            + self.phone * w.phone;
        (total * 10_000.0).round() / 10_000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub left:         usize,
    pub right:        usize,
    pub blocking_key: String,
    pub dimensions:   DimensionScores,
    pub total:        f64,
    pub accepted:     bool,
    pub evidence:     Vec<String>,
}

// ── Scorer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PairScorer {
    weights:                 MatchWeights,
    accept_threshold:        f64,
    temporal_tolerance_days: f64,
    amount_tolerance:        f64,
}

impl PairScorer {
    /// Build from an already-validated resolution config.
    pub fn new(config: &ResolutionConfig) -> Self {
        Self {
            weights:                 config.weights,
            accept_threshold:        config.accept_threshold,
            temporal_tolerance_days: config.temporal_tolerance_days,
            amount_tolerance:        config.amount_tolerance,
        }
    }

    pub fn score(
        &self,
        pair: &CandidatePair,
        a: &NormalizedRecord,
        b: &NormalizedRecord,
    ) -> MatchScore {
        let mut evidence = Vec::new();
        let mut dims = DimensionScores::default();

        if let (Some(ea), Some(eb)) = (a.email(), b.email()) {
            dims.email = email_similarity(&ea, &eb);
            if dims.email == 1.0 {
                evidence.push(format!("email_exact: {ea}"));
            } else if dims.email > 0.0 {
                let domain = normalize::normalize_email_domain(&ea).unwrap_or_default();
                evidence.push(format!("email_domain: {domain}"));
            }
        }

        if let (Some(na), Some(nb)) = (a.company_name(), b.company_name()) {
            dims.company_name = company_name_similarity(&na, &nb);
            if dims.company_name > 0.0 {
                evidence.push(format!(
                    "company_name {:.2}: {} <> {}",
                    dims.company_name,
                    a.field(fields::COMPANY_NAME).unwrap_or_default(),
                    b.field(fields::COMPANY_NAME).unwrap_or_default(),
                ));
            }
        }

        if let (Some(da), Some(db)) = (a.company_domain(), b.company_domain()) {
            if da == db && !normalize::is_free_mail(&da) {
                dims.domain = 1.0;
                evidence.push(format!("domain_exact: {da}"));
            }
        }

        if let (Some(ta), Some(tb)) = (a.event_time(), b.event_time()) {
            let days = (ta - tb).num_seconds().abs() as f64 / SECONDS_PER_DAY;
            dims.temporal = proximity(days, self.temporal_tolerance_days);
            if dims.temporal > 0.0 {
                evidence.push(format!("temporal {:.2}: {days:.1}d apart", dims.temporal));
            }
        }

        if let (Some(xa), Some(xb)) = (a.amount(), b.amount()) {
            dims.amount = proximity(relative_difference(xa, xb), self.amount_tolerance);
            if dims.amount > 0.0 {
                evidence.push(format!("amount {:.2}: {xa} <> {xb}", dims.amount));
            }
        }

        if let (Some(pa), Some(pb)) = (a.phone(), b.phone()) {
            if pa == pb {
                dims.phone = 1.0;
                evidence.push(format!("phone_exact: {pa}"));
            }
        }

        let total = dims.weighted_total(&self.weights);
        MatchScore {
            left: pair.left,
            right: pair.right,
            blocking_key: pair.blocking_key.clone(),
            dimensions: dims,
            total,
            accepted: total >= self.accept_threshold,
            evidence,
        }
    }
}

// ── Similarity functions ─────────────────────────────────────────────────────

/// 1.0 for the same address, 0.8 for the same company domain, else 0.
/// Both arguments are normalized emails.
pub fn email_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    match (normalize::normalize_email_domain(a), normalize::normalize_email_domain(b)) {
        (Some(da), Some(db)) if da == db && !normalize::is_free_mail(&da) => EMAIL_SAME_DOMAIN,
        _ => 0.0,
    }
}

/// Linear decay: 1.0 at zero difference, 0.0 at or beyond `tolerance`.
pub fn proximity(difference: f64, tolerance: f64) -> f64 {
    if tolerance <= 0.0 {
        return if difference == 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - difference.abs() / tolerance).clamp(0.0, 1.0)
}

/// |a − b| relative to the larger magnitude; 0 when both are zero.
pub fn relative_difference(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        0.0
    } else {
        (a - b).abs() / scale
    }
}

/// Token-aware similarity of two already-normalized company names.
///
/// Takes the best of a token-sort ratio (word order ignored) and a
/// token-set ratio (shared words dominate), then applies the exact and
/// noise floors.
pub fn company_name_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let raw = token_sort_ratio(a, b).max(token_set_ratio(a, b));
    if raw >= NAME_EXACT_FLOOR {
        1.0
    } else if raw >= NAME_FUZZY_FLOOR {
        raw
    } else {
        0.0
    }
}

fn sorted_tokens(s: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}

fn token_sort_ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&sorted_tokens(a).join(" "), &sorted_tokens(b).join(" "))
}

fn token_set_ratio(a: &str, b: &str) -> f64 {
    let ta = sorted_tokens(a);
    let tb = sorted_tokens(b);
    let common: Vec<&str> = ta.iter().copied().filter(|t| tb.contains(t)).collect();
    if common.is_empty() {
        return 0.0;
    }
    let only_a: Vec<&str> = ta.iter().copied().filter(|t| !common.contains(t)).collect();
    let only_b: Vec<&str> = tb.iter().copied().filter(|t| !common.contains(t)).collect();

    let base = common.join(" ");
    let join = |rest: &[&str]| {
        if rest.is_empty() {
            base.clone()
        } else {
            format!("{base} {}", rest.join(" "))
        }
    };
    let full_a = join(&only_a);
    let full_b = join(&only_b);

    strsim::normalized_levenshtein(&base, &full_a)
        .max(strsim::normalized_levenshtein(&base, &full_b))
        .max(strsim::normalized_levenshtein(&full_a, &full_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proximity_decays_to_zero_at_tolerance() {
        assert_eq!(proximity(0.0, 7.0), 1.0);
        assert!((proximity(3.5, 7.0) - 0.5).abs() < 1e-12);
        assert_eq!(proximity(7.0, 7.0), 0.0);
        assert_eq!(proximity(30.0, 7.0), 0.0);
    }

    #[test]
    fn name_similarity_handles_order_and_noise() {
        assert_eq!(company_name_similarity("acme", "acme"), 1.0);
        assert_eq!(company_name_similarity("blue river labs", "labs blue river"), 1.0);
        assert!(company_name_similarity("northwind traders", "northwind trader") >= 0.9);
        assert_eq!(company_name_similarity("acme", "globex"), 0.0);
        assert_eq!(company_name_similarity("", "acme"), 0.0);
    }

    #[test]
    fn email_scores_exact_then_company_domain() {
        assert_eq!(email_similarity("a@acme.com", "a@acme.com"), 1.0);
        assert_eq!(email_similarity("a@acme.com", "b@acme.com"), 0.8);
        assert_eq!(email_similarity("a@gmail.com", "b@gmail.com"), 0.0);
        assert_eq!(email_similarity("a@acme.com", "a@globex.com"), 0.0);
    }

    #[test]
    fn relative_difference_is_symmetric() {
        assert_eq!(relative_difference(0.0, 0.0), 0.0);
        assert!((relative_difference(100.0, 90.0) - 0.1).abs() < 1e-12);
        assert_eq!(relative_difference(100.0, 90.0), relative_difference(90.0, 100.0));
    }
}
