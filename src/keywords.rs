//! Keyword classifier
//!
//! Static category→keyword gazetteer: deterministic, free, offline. This is
//! tier 3 of the resolution waterfall and the merchant-spotting source for
//! the parser. The table is immutable configuration; longest-keyword-wins
//! tie-breaks are computed from keyword length so results never depend on
//! table order.

/// Static keyword table — zero allocation
pub const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "Coffee",
        &["starbucks", "dunkin", "peets", "coffee", "espresso", "latte", "cafe"],
    ),
    (
        "Dining",
        &[
            "restaurant", "mcdonalds", "chipotle", "taco bell", "burger king", "wendys",
            "pizza", "sushi", "dinner", "lunch", "breakfast", "doordash", "ubereats",
            "grubhub", "takeout",
        ],
    ),
    (
        "Groceries",
        &[
            "walmart", "costco", "kroger", "safeway", "aldi", "trader joes", "whole foods",
            "grocery", "groceries", "supermarket",
        ],
    ),
    (
        "Transportation",
        &[
            "uber", "lyft", "gas", "shell", "chevron", "exxon", "parking", "metro",
            "bus fare", "train ticket", "toll",
        ],
    ),
    (
        "Shopping",
        &[
            "amazon", "target", "best buy", "ebay", "etsy", "ikea", "clothes", "clothing",
            "shoes", "mall",
        ],
    ),
    (
        "Entertainment",
        &[
            "netflix", "spotify", "hulu", "movie", "cinema", "concert", "theater",
            "tickets", "steam", "video game",
        ],
    ),
    (
        "Utilities",
        &[
            "electric", "electricity", "water bill", "internet", "comcast", "verizon",
            "phone bill", "utility",
        ],
    ),
    (
        "Health",
        &[
            "pharmacy", "cvs", "walgreens", "doctor", "dentist", "gym", "fitness",
            "clinic", "copay",
        ],
    ),
    (
        "Home Services",
        &[
            "repair", "plumber", "plumbing", "electrician", "cleaning", "lawn", "hvac",
            "handyman", "maintenance", "pest control",
        ],
    ),
    (
        "Travel",
        &[
            "hotel", "airbnb", "flight", "airline", "delta", "united airlines", "expedia",
            "rental car",
        ],
    ),
    (
        "Subscriptions",
        &["subscription", "membership", "patreon", "icloud", "youtube premium"],
    ),
];

/// Category seed for fresh stores. Ends with the fallback category the
/// waterfall's tier 5 looks for by name.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "Coffee",
    "Dining",
    "Groceries",
    "Transportation",
    "Shopping",
    "Entertainment",
    "Utilities",
    "Health",
    "Home Services",
    "Travel",
    "Subscriptions",
    "Miscellaneous",
];

/// Brand-like names the parser may promote to a merchant directly. Generic
/// category words ("repair", "coffee") stay out of this list so vague
/// statements keep flowing through the residual-text heuristic.
pub const MERCHANT_NAMES: &[&str] = &[
    "starbucks", "dunkin", "peets", "mcdonalds", "chipotle", "taco bell", "burger king",
    "wendys", "doordash", "ubereats", "grubhub", "walmart", "costco", "kroger", "safeway",
    "aldi", "trader joes", "whole foods", "uber", "lyft", "shell", "chevron", "exxon",
    "amazon", "target", "best buy", "ebay", "etsy", "ikea", "netflix", "spotify", "hulu",
    "comcast", "verizon", "cvs", "walgreens", "airbnb", "delta", "expedia", "patreon",
    "icloud", "steam",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeywordMatch {
    pub category: &'static str,
    pub keyword: &'static str,
}

/// Word-boundary containment check. Both sides are expected lower-cased.
pub(crate) fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let begin = start + pos;
        let end = begin + needle.len();
        let before_ok = haystack[..begin]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = begin + 1;
    }
    false
}

/// Classify free text against the keyword table. Scans every supplied text
/// and returns the longest matching keyword's category.
pub fn classify<'a, I>(texts: I) -> Option<KeywordMatch>
where
    I: IntoIterator<Item = &'a str>,
{
    let lowered: Vec<String> = texts.into_iter().map(|t| t.to_lowercase()).collect();

    let mut best: Option<KeywordMatch> = None;
    for (category, keywords) in CATEGORY_KEYWORDS.iter().copied() {
        for keyword in keywords.iter().copied() {
            if lowered.iter().any(|text| contains_word(text, keyword)) {
                let longer = best.map_or(true, |b| keyword.len() > b.keyword.len());
                if longer {
                    best = Some(KeywordMatch { category, keyword });
                }
            }
        }
    }
    best
}

/// Spot a known merchant name inside an utterance, longest match first.
pub fn spot_merchant(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();

    let mut best: Option<&'static str> = None;
    for name in MERCHANT_NAMES.iter().copied() {
        if contains_word(&lowered, name) && best.map_or(true, |b| name.len() > b.len()) {
            best = Some(name);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_boundary_matching() {
        assert!(contains_word("grabbed a latte today", "latte"));
        assert!(!contains_word("scuba gear", "uber"));
        assert!(!contains_word("gasoline", "gas"));
        assert!(contains_word("gas station", "gas"));
    }

    #[test]
    fn test_classify_longest_keyword_wins() {
        // "coffee" (Coffee) and "starbucks" (Coffee) both hit; across
        // categories the longer keyword decides.
        let hit = classify(["water bill due"]).unwrap();
        assert_eq!(hit.category, "Utilities");

        let hit = classify(["whole foods run"]).unwrap();
        assert_eq!(hit.category, "Groceries");
        assert_eq!(hit.keyword, "whole foods");
    }

    #[test]
    fn test_classify_across_multiple_texts() {
        let hit = classify(["Starbucks", "morning treat"]).unwrap();
        assert_eq!(hit.category, "Coffee");
    }

    #[test]
    fn test_classify_miss() {
        assert!(classify(["completely unknown merchant"]).is_none());
    }

    #[test]
    fn test_spot_merchant_prefers_longer_name() {
        assert_eq!(spot_merchant("lunch at taco bell"), Some("taco bell"));
        assert_eq!(spot_merchant("add $6 coffee starbucks"), Some("starbucks"));
        assert_eq!(spot_merchant("paid the plumber"), None);
    }
}
