//! Merchant name canonicalization
//!
//! Every layer that keys on a merchant (override table, shared cache,
//! categorization log) derives the key through this module, so the same
//! raw string always lands on the same row.

/// Canonical lookup key for a merchant: lower-cased and trimmed.
pub fn merchant_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Display form returned by the parser. Words that already carry an
/// uppercase letter (acronyms like "AC") are kept verbatim.
pub fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            if word.chars().any(|c| c.is_uppercase()) {
                word.to_string()
            } else {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
