//! Field normalization shared by blocking, scoring and metric evaluation.
//!
//! Every function here is total: malformed input yields `None` (or an empty
//! string), never an error. Missing or unparsable values degrade a scoring
//! dimension or drop a record from an aggregate; they never abort a run.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Legal-form tokens dropped from company names before comparison.
const LEGAL_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "corp", "corporation", "co", "company",
    "llc", "ltd", "limited", "plc", "gmbh", "sa",
];

/// Consumer mail providers: sharing one says nothing about the company.
const FREE_MAIL_DOMAINS: &[&str] = &[
    "gmail.com", "googlemail.com", "yahoo.com", "outlook.com", "hotmail.com",
    "icloud.com", "aol.com", "proton.me", "protonmail.com",
];

const MIN_PHONE_DIGITS: usize = 7;
const PHONE_DIGITS_KEPT: usize = 10;

/// Lower-cased, trimmed email; `None` unless it has a local part and domain.
pub fn normalize_email(email: &str) -> Option<String> {
    let e = email.trim().to_lowercase();
    let (local, domain) = e.split_once('@')?;
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return None;
    }
    Some(e)
}

/// Domain part of an email address.
pub fn normalize_email_domain(email: &str) -> Option<String> {
    normalize_email(email).and_then(|e| e.split_once('@').map(|(_, d)| d.to_string()))
}

/// Bare host of a website or domain field: scheme, `www.`, port and path removed.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let mut d = raw.trim().to_lowercase();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = d.strip_prefix(scheme) {
            d = rest.to_string();
        }
    }
    if let Some(rest) = d.strip_prefix("www.") {
        d = rest.to_string();
    }
    let host = d
        .split(|c: char| matches!(c, '/' | ':' | '?' | '#'))
        .next()
        .unwrap_or_default();
    if host.is_empty() || !host.contains('.') {
        return None;
    }
    Some(host.to_string())
}

pub fn is_free_mail(domain: &str) -> bool {
    FREE_MAIL_DOMAINS.contains(&domain)
}

/// Case-folded, punctuation-free company name with legal suffixes removed.
///
/// `"  Acme Corp. "` and `"ACME INCORPORATED"` both become `"acme"`.
pub fn normalize_company_name(name: &str) -> String {
    let folded: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    let tokens: Vec<&str> = folded.split_whitespace().collect();
    let kept: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|t| !LEGAL_SUFFIXES.contains(t))
        .collect();
    // A name made only of legal tokens ("Company Ltd") keeps them.
    if kept.is_empty() {
        tokens.join(" ")
    } else {
        kept.join(" ")
    }
}

/// Last ten digits of a phone number; `None` below seven digits.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < MIN_PHONE_DIGITS {
        return None;
    }
    let skip = digits.len().saturating_sub(PHONE_DIGITS_KEPT);
    Some(digits[skip..].to_string())
}

/// Parse a monetary amount, tolerating currency symbols and separators.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | ' '))
        .collect();
    let value: f64 = cleaned.parse().ok()?;
    value.is_finite().then_some(value)
}

/// Parse an RFC 3339 timestamp, `YYYY-MM-DD HH:MM:SS`, or a bare date
/// (taken as midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(ndt.and_utc());
    }
    parse_bare_date(s)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}

/// Calendar date of any value `parse_timestamp` accepts.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    parse_bare_date(s).or_else(|| parse_timestamp(s).map(|dt| dt.date_naive()))
}

fn parse_bare_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_domain() {
        assert_eq!(normalize_email_domain("alice@acme.com").as_deref(), Some("acme.com"));
        assert_eq!(normalize_email_domain("BOB@BETA.IO").as_deref(), Some("beta.io"));
        assert_eq!(normalize_email_domain("invalid"), None);
        assert_eq!(normalize_email_domain(""), None);
    }

    #[test]
    fn company_names_drop_legal_forms() {
        assert_eq!(normalize_company_name("Acme Corp."), "acme");
        assert_eq!(normalize_company_name("Beta Inc"), "beta");
        assert_eq!(normalize_company_name("  Gamma LLC  "), "gamma");
        assert_eq!(normalize_company_name("ACME INCORPORATED"), "acme");
        assert_eq!(normalize_company_name("The Company"), "the");
        assert_eq!(normalize_company_name(""), "");
    }

    #[test]
    fn website_domains() {
        assert_eq!(normalize_domain("https://www.Acme.com/pricing").as_deref(), Some("acme.com"));
        assert_eq!(normalize_domain("acme.io:8080").as_deref(), Some("acme.io"));
        assert_eq!(normalize_domain("localhost"), None);
    }

    #[test]
    fn phones_keep_last_ten_digits() {
        assert_eq!(normalize_phone("+1 (555) 123-4567").as_deref(), Some("5551234567"));
        assert_eq!(normalize_phone("555.123.4567").as_deref(), Some("5551234567"));
        assert_eq!(normalize_phone("12-34"), None);
    }

    #[test]
    fn amounts_and_dates() {
        assert_eq!(parse_amount("$1,200.50"), Some(1200.5));
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount("NaN"), None);
        assert_eq!(parse_date("2025-03-14").map(|d| d.to_string()).as_deref(), Some("2025-03-14"));
        assert_eq!(
            parse_date("2025-03-14T22:10:00Z").map(|d| d.to_string()).as_deref(),
            Some("2025-03-14")
        );
        assert!(parse_timestamp("2025-03-14 08:00:00").is_some());
        assert!(parse_timestamp("14/03/2025").is_none());
    }
}
