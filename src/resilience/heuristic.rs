//! Last-resort guess at a company page when the provider cannot answer

use crate::cache::normalize_key;
use crate::types::Candidate;

pub const WELL_KNOWN_CONFIDENCE: f64 = 0.6;
pub const SLUG_CONFIDENCE: f64 = 0.3;

const WELL_KNOWN: &[(&str, &str, &str)] = &[
    ("google", "google", "Google"),
    ("alphabet", "google", "Google"),
    ("microsoft", "microsoft", "Microsoft"),
    ("apple", "apple", "Apple"),
    ("amazon", "amazon", "Amazon"),
    ("meta", "meta", "Meta"),
    ("facebook", "meta", "Meta"),
    ("ibm", "ibm", "IBM"),
    ("oracle", "oracle", "Oracle"),
    ("salesforce", "salesforce", "Salesforce"),
    ("netflix", "netflix", "Netflix"),
    ("intel", "intel", "Intel"),
    ("nvidia", "nvidia", "NVIDIA"),
    ("adobe", "adobe", "Adobe"),
    ("accenture", "accenture", "Accenture"),
    ("deloitte", "deloitte", "Deloitte"),
];

const LEGAL_SUFFIXES: &[&str] = &[
    "incorporated", "inc", "corporation", "corp", "company", "co", "llc", "ltd", "limited",
    "plc", "gmbh", "ag", "sa", "bv", "pty", "group", "holdings",
];

/// Slug of `name`: lowercase alphanumerics joined by `-`, legal suffixes dropped
pub fn company_slug(name: &str) -> String {
    let normalized = normalize_key(name);
    let mut words: Vec<String> = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();

    while words.len() > 1 && words.last().is_some_and(|w| LEGAL_SUFFIXES.contains(&w.as_str())) {
        words.pop();
    }
    words.join("-")
}

/// Deterministic low-confidence candidates for `name` under `base_url`
pub fn heuristic_guess(name: &str, base_url: &str) -> Vec<Candidate> {
    let slug = company_slug(name);
    if slug.is_empty() {
        return Vec::new();
    }
    let base = base_url.trim_end_matches('/');

    if let Some((_, known_slug, display)) = WELL_KNOWN.iter().find(|(key, _, _)| *key == slug) {
        return vec![Candidate::new(
            format!("{}/{}", base, known_slug),
            *display,
            *known_slug,
            WELL_KNOWN_CONFIDENCE,
        )
        .with_snippet("Well-known company")];
    }

    vec![Candidate::new(
        format!("{}/{}", base, slug),
        name.trim(),
        slug.clone(),
        SLUG_CONFIDENCE,
    )
    .with_snippet("Guessed from company name")]
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://www.linkedin.com/company/";

    #[test]
    fn test_slug_strips_suffixes_and_punctuation() {
        assert_eq!(company_slug("Acme Corp"), "acme");
        assert_eq!(company_slug("  Blue Sky Widgets, Inc. "), "blue-sky-widgets");
        assert_eq!(company_slug("Smith & Sons Holdings Ltd"), "smith-sons");
        assert_eq!(company_slug("Co"), "co");
        assert_eq!(company_slug("!!!"), "");
    }

    #[test]
    fn test_well_known_table() {
        let guess = heuristic_guess("Facebook, Inc.", BASE);
        assert_eq!(guess.len(), 1);
        assert_eq!(guess[0].url, "https://www.linkedin.com/company/meta");
        assert_eq!(guess[0].confidence, WELL_KNOWN_CONFIDENCE);
    }

    #[test]
    fn test_slug_guess_is_deterministic() {
        let a = heuristic_guess("Acme Corp", BASE);
        let b = heuristic_guess("acme corp ", BASE);
        assert_eq!(a[0].url, b[0].url);
        assert_eq!(a[0].confidence, SLUG_CONFIDENCE);
        assert_eq!(a[0].slug, "acme");
        assert!(heuristic_guess("   ", BASE).is_empty());
    }
}
