//! Deterministic company and contact name generation from curated lists.
//!
//! Also produces the noisy spellings a second system would hold for the same
//! company: a different legal suffix, shouted case, or a dropped suffix.

use crate::rng::StreamRng;

pub struct NameGenerator;

impl NameGenerator {
    /// "Prefix Industry Suffix", e.g. "Northwind Analytics Inc".
    pub fn company_name(rng: &mut StreamRng) -> String {
        let prefix = rng.pick(PREFIXES).copied().unwrap_or("Acme");
        let industry = rng.pick(INDUSTRIES).copied().unwrap_or("Software");
        let suffix = rng.pick(LEGAL_SUFFIXES).copied().unwrap_or("Inc");
        format!("{prefix} {industry} {suffix}")
    }

    /// Lower-case contact first name, used as an email local part.
    pub fn contact_name(rng: &mut StreamRng) -> &'static str {
        rng.pick(CONTACTS).copied().unwrap_or("ops")
    }

    /// Web domain for a company name: folded words minus the legal suffix.
    pub fn domain_for(company: &str) -> String {
        let words: Vec<String> = company
            .split_whitespace()
            .filter(|w| !LEGAL_SUFFIXES.contains(w))
            .map(|w| w.to_lowercase().chars().filter(|c| c.is_ascii_alphanumeric()).collect())
            .collect();
        format!("{}.com", words.concat())
    }

    /// The same company as another system might spell it.
    pub fn noisy_variant(company: &str, rng: &mut StreamRng) -> String {
        let mut words: Vec<&str> = company.split_whitespace().collect();
        let has_suffix = words.last().is_some_and(|w| LEGAL_SUFFIXES.contains(w));
        match rng.next_u64_below(3) {
            0 if has_suffix => {
                let alt = rng.pick(ALT_SUFFIXES).copied().unwrap_or("Incorporated");
                words.pop();
                words.push(alt);
                words.join(" ")
            }
            1 => company.to_uppercase(),
            _ => {
                if has_suffix {
                    words.pop();
                }
                words.join(" ")
            }
        }
    }
}

const PREFIXES: &[&str] = &[
    "Northwind", "Bluebird", "Summit", "Ironclad", "Lumen", "Harbor", "Vertex", "Cobalt",
    "Evergreen", "Redwood", "Atlas", "Quantum", "Brightline", "Cedar", "Orbit", "Granite",
    "Silverline", "Keystone", "Meridian", "Pioneer", "Tidewater", "Juniper", "Falcon", "Beacon",
];

const INDUSTRIES: &[&str] = &[
    "Analytics", "Software", "Logistics", "Health", "Robotics", "Media", "Payments",
    "Security", "Energy", "Learning", "Foods", "Labs", "Cloud", "Design", "Networks",
];

const LEGAL_SUFFIXES: &[&str] = &["Inc", "LLC", "Corp", "Ltd", "Co"];

const ALT_SUFFIXES: &[&str] = &["Incorporated", "Corporation", "Limited", "Company"];

const CONTACTS: &[&str] = &[
    "alice", "bob", "carla", "deepak", "elena", "femi", "grace", "hiro", "ines", "jonas",
    "kavya", "liam", "maya", "noor", "oscar", "priya", "quinn", "rosa", "sven", "tara",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_company_name;
    use crate::rng::{RngBank, StreamSlot};

    #[test]
    fn names_are_deterministic() {
        let mut a = RngBank::new(12345).stream(StreamSlot::Customers);
        let mut b = RngBank::new(12345).stream(StreamSlot::Customers);
        for _ in 0..20 {
            assert_eq!(NameGenerator::company_name(&mut a), NameGenerator::company_name(&mut b));
        }
    }

    #[test]
    fn noisy_variants_normalize_to_the_same_name() {
        let mut rng = RngBank::new(9).stream(StreamSlot::Duplicates);
        for _ in 0..50 {
            let name = NameGenerator::company_name(&mut rng);
            let variant = NameGenerator::noisy_variant(&name, &mut rng);
            assert_eq!(
                normalize_company_name(&name),
                normalize_company_name(&variant),
                "{name} vs {variant}"
            );
        }
    }

    #[test]
    fn domains_drop_legal_suffix() {
        assert_eq!(NameGenerator::domain_for("Northwind Analytics Inc"), "northwindanalytics.com");
    }
}
