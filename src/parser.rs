//! Expense intent parser
//!
//! Converts one raw utterance plus the current date into a structured
//! `ParsedCommand`, or `None` when no expense is detected. Extraction is
//! oracle-first when a classification oracle is available; the
//! deterministic heuristic below is the fallback and the offline path.

use chrono::{Days, Months, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::keywords::{self, contains_word};
use crate::merchant::title_case;
use crate::models::{ExpenseIntent, ParsedCommand};
use crate::oracle::{ClassificationOracle, OracleExpenseParse};

/// Tokens that indicate the user is stating a spend action.
const ACTION_TOKENS: &[&str] = &[
    "add", "log", "spent", "paid", "bought", "purchased", "got", "grabbed", "ordered",
    "picked", "dropped",
];

/// Leading words that mark an informational question, not a statement.
const QUESTION_STARTERS: &[&str] = &[
    "how", "what", "when", "where", "why", "who", "which", "did", "do", "does", "am",
    "is", "are", "can", "could", "should", "will",
];

/// Words stripped before the residual-text merchant heuristic.
const STOPWORDS: &[&str] = &[
    "i", "a", "an", "the", "my", "me", "we", "our", "your", "it", "its", "this", "that",
    "these", "those", "of", "on", "in", "for", "with", "to", "was", "is", "am", "are",
    "be", "been", "just", "some", "new", "at", "from", "and", "or", "up", "out",
    "today", "yesterday", "ago", "day", "days", "week", "weeks", "month", "months",
    "dollars", "bucks", "usd",
];

/// Tokens that terminate an "at/from <name>" clause.
const CLAUSE_STOPPERS: &[&str] = &[
    "for", "on", "yesterday", "today", "this", "last", "because", "and", "with", "ago",
    "to",
];

/// Service verbs recognized by the residual heuristic, with the noun used
/// to synthesize a merchant label ("<Object> <ServiceNoun>").
const SERVICE_VERBS: &[(&str, &str)] = &[
    ("repairing", "Repair"),
    ("repaired", "Repair"),
    ("repair", "Repair"),
    ("fixing", "Repair"),
    ("fixed", "Repair"),
    ("fix", "Repair"),
    ("installing", "Installation"),
    ("installed", "Installation"),
    ("install", "Installation"),
    ("cleaning", "Cleaning"),
    ("cleaned", "Cleaning"),
    ("servicing", "Service"),
    ("serviced", "Service"),
    ("service", "Service"),
    ("maintenance", "Maintenance"),
];

lazy_static! {
    static ref DOLLAR_AMOUNT_RE: Regex =
        Regex::new(r"\$\s?(\d+(?:\.\d{1,2})?)").expect("valid amount pattern");
    static ref BARE_AMOUNT_RE: Regex =
        Regex::new(r"\d+(?:\.\d{1,2})?").expect("valid amount pattern");
    static ref AMOUNT_TOKEN_RE: Regex =
        Regex::new(r"^\$?\d+(?:\.\d{1,2})?$").expect("valid amount token pattern");
    static ref RELATIVE_DATE_RE: Regex =
        Regex::new(r"(\d+)\s+(day|week|month)s?\s+ago").expect("valid date pattern");
}

/// Parse one utterance with the deterministic heuristic.
///
/// Gate: the text must contain a digit and an action token, and must not
/// read as a question; everything else short-circuits to `None`.
pub fn parse(text: &str, today: NaiveDate) -> Option<ParsedCommand> {
    let trimmed = text.trim();
    let lowered = trimmed.to_lowercase();

    if !lowered.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    if !ACTION_TOKENS.iter().any(|t| contains_word(&lowered, t)) {
        return None;
    }
    if is_question(&lowered) {
        return None;
    }

    let amount = extract_amount(&lowered)?;
    if amount <= 0.0 {
        return None;
    }
    let spent_on = extract_date(&lowered, today);
    let tokens = tokenize(trimmed);

    // Merchant ladder, highest-trust source first.

    // 1. Explicit "at/from <name>" clause, trusted verbatim.
    if let Some((merchant, clause)) = at_from_clause(&tokens) {
        let description = residual_description(&tokens, Some(clause), None);
        return Some(ParsedCommand {
            intent: ExpenseIntent::Add,
            amount,
            merchant: title_case(&merchant),
            description,
            spent_on,
        });
    }

    // 2. Gazetteer spotting, longest keyword wins.
    if let Some(name) = keywords::spot_merchant(&lowered) {
        let description = residual_description(&tokens, None, Some(name));
        return Some(ParsedCommand {
            intent: ExpenseIntent::Add,
            amount,
            merchant: title_case(name),
            description,
            spent_on,
        });
    }

    // 3. Residual-text heuristic. No named merchant means the statement is
    // conversational; the result needs confirmation before persisting.
    let residual = residual_tokens(&tokens, None, None);
    if residual.is_empty() {
        return None;
    }
    let merchant = match service_label(&residual) {
        Some(label) => label,
        None => title_case(&residual.join(" ")),
    };

    Some(ParsedCommand {
        intent: ExpenseIntent::Suggest,
        amount,
        merchant,
        description: None,
        spent_on,
    })
}

/// Oracle-first extraction. Any oracle failure or unusable payload falls
/// back to the deterministic heuristic; a clean "no expense" verdict from
/// the oracle is trusted as-is.
pub async fn parse_with_oracle(
    oracle: &dyn ClassificationOracle,
    text: &str,
    today: NaiveDate,
) -> Option<ParsedCommand> {
    match oracle.parse_expense(text).await {
        Ok(payload) if payload.intent == ExpenseIntent::None => {
            debug!("oracle reported no expense content");
            None
        }
        Ok(payload) => match command_from_oracle(payload, today) {
            Some(command) => Some(command),
            None => {
                warn!("oracle expense payload unusable, falling back to heuristic parse");
                parse(text, today)
            }
        },
        Err(error) => {
            warn!(%error, "expense parse oracle unavailable, falling back to heuristic parse");
            parse(text, today)
        }
    }
}

fn command_from_oracle(payload: OracleExpenseParse, today: NaiveDate) -> Option<ParsedCommand> {
    let merchant = payload.merchant.trim();
    if merchant.is_empty() || payload.amount <= 0.0 {
        return None;
    }

    let spent_on = match payload.date_hint.as_deref() {
        Some(hint) => resolve_date_hint(hint, today),
        None => today,
    };
    let description = payload
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());

    Some(ParsedCommand {
        intent: payload.intent,
        amount: payload.amount,
        merchant: title_case(merchant),
        description,
        spent_on,
    })
}

fn is_question(lowered: &str) -> bool {
    if lowered.ends_with('?') {
        return true;
    }
    lowered
        .split_whitespace()
        .next()
        .map_or(false, |first| QUESTION_STARTERS.contains(&first))
}

/// First currency-shaped numeric token. Dollar-prefixed amounts win; a
/// second number in the same sentence is ignored.
fn extract_amount(lowered: &str) -> Option<f64> {
    if let Some(cap) = DOLLAR_AMOUNT_RE.captures(lowered) {
        return cap[1].parse().ok();
    }

    let date_span = RELATIVE_DATE_RE.find(lowered).map(|m| (m.start(), m.end()));
    for m in BARE_AMOUNT_RE.find_iter(lowered) {
        if let Some((start, end)) = date_span {
            if m.start() >= start && m.end() <= end {
                continue;
            }
        }
        return m.as_str().parse().ok();
    }
    None
}

fn extract_date(lowered: &str, today: NaiveDate) -> NaiveDate {
    if contains_word(lowered, "yesterday") {
        return today.checked_sub_days(Days::new(1)).unwrap_or(today);
    }
    if let Some(cap) = RELATIVE_DATE_RE.captures(lowered) {
        let n: u64 = match cap[1].parse() {
            Ok(n) => n,
            Err(_) => return today,
        };
        return match &cap[2] {
            "day" => today.checked_sub_days(Days::new(n)).unwrap_or(today),
            "week" => today.checked_sub_days(Days::new(n * 7)).unwrap_or(today),
            "month" => today
                .checked_sub_months(Months::new(n as u32))
                .unwrap_or(today),
            _ => today,
        };
    }
    today
}

fn resolve_date_hint(hint: &str, today: NaiveDate) -> NaiveDate {
    let lowered = hint.trim().to_lowercase();
    if lowered.is_empty() || lowered == "today" {
        return today;
    }
    if let Ok(date) = NaiveDate::parse_from_str(&lowered, "%Y-%m-%d") {
        return date;
    }
    extract_date(&lowered, today)
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| {
                matches!(c, ',' | '.' | '!' | '?' | ';' | ':' | '"' | '(' | ')')
            })
            .to_string()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn is_amount_token(lowered: &str) -> bool {
    AMOUNT_TOKEN_RE.is_match(lowered)
}

/// Locate an "at/from <name>" clause. Returns the name (original casing)
/// and the token span to exclude from the description.
fn at_from_clause(tokens: &[String]) -> Option<(String, (usize, usize))> {
    let pos = tokens.iter().position(|t| {
        let l = t.to_lowercase();
        l == "at" || l == "from"
    })?;

    let mut name: Vec<&str> = Vec::new();
    let mut end = pos + 1;
    for tok in &tokens[pos + 1..] {
        let l = tok.to_lowercase();
        if is_amount_token(&l) || CLAUSE_STOPPERS.contains(&l.as_str()) {
            break;
        }
        // Skip leading articles: "at the airport" names "airport".
        if name.is_empty() && matches!(l.as_str(), "the" | "a" | "an" | "my") {
            end += 1;
            continue;
        }
        name.push(tok.as_str());
        end += 1;
    }

    if name.is_empty() {
        None
    } else {
        Some((name.join(" "), (pos, end)))
    }
}

/// Tokens left after stripping amounts, date phrases, stopwords, and
/// action verbs. Original casing is preserved.
fn residual_tokens(
    tokens: &[String],
    exclude_span: Option<(usize, usize)>,
    exclude_merchant: Option<&str>,
) -> Vec<String> {
    let merchant_words: Vec<&str> = exclude_merchant
        .map(|m| m.split_whitespace().collect())
        .unwrap_or_default();

    tokens
        .iter()
        .enumerate()
        .filter(|(i, tok)| {
            if let Some((start, end)) = exclude_span {
                if *i >= start && *i < end {
                    return false;
                }
            }
            let l = tok.to_lowercase();
            !is_amount_token(&l)
                && !STOPWORDS.contains(&l.as_str())
                && !ACTION_TOKENS.contains(&l.as_str())
                && !merchant_words.contains(&l.as_str())
        })
        .map(|(_, tok)| tok.clone())
        .collect()
}

fn residual_description(
    tokens: &[String],
    exclude_span: Option<(usize, usize)>,
    exclude_merchant: Option<&str>,
) -> Option<String> {
    let residual = residual_tokens(tokens, exclude_span, exclude_merchant);
    if residual.is_empty() {
        None
    } else {
        Some(residual.join(" ").to_lowercase())
    }
}

/// Synthesize "<Object> <ServiceNoun>" when the residual text reads as a
/// service statement ("fixing the home AC" → "Home AC Repair").
fn service_label(residual: &[String]) -> Option<String> {
    let verb_pos = residual
        .iter()
        .position(|t| SERVICE_VERBS.iter().any(|(v, _)| t.eq_ignore_ascii_case(v)))?;
    let noun = SERVICE_VERBS
        .iter()
        .find(|(v, _)| residual[verb_pos].eq_ignore_ascii_case(v))
        .map(|(_, noun)| *noun)?;

    let object: Vec<&str> = residual
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != verb_pos)
        .map(|(_, t)| t.as_str())
        .collect();

    if object.is_empty() {
        Some(noun.to_string())
    } else {
        Some(title_case(&format!("{} {}", object.join(" "), noun)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    #[test]
    fn test_explicit_add_with_gazetteer_merchant() {
        let parsed = parse("add $6 coffee starbucks", today()).unwrap();
        assert_eq!(parsed.intent, ExpenseIntent::Add);
        assert_eq!(parsed.amount, 6.0);
        assert_eq!(parsed.merchant, "Starbucks");
        assert_eq!(parsed.description.as_deref(), Some("coffee"));
        assert_eq!(parsed.spent_on, today());
    }

    #[test]
    fn test_question_returns_none() {
        assert!(parse("how am i doing this month?", today()).is_none());
        assert!(parse("how much have I spent on the 3 subscriptions?", today()).is_none());
    }

    #[test]
    fn test_gate_requires_digit_and_action_token() {
        assert!(parse("coffee was great", today()).is_none());
        assert!(parse("the total is 45", today()).is_none());
    }

    #[test]
    fn test_at_clause_wins_over_everything() {
        let parsed = parse("spent $40 at Joe's Diner yesterday", today()).unwrap();
        assert_eq!(parsed.intent, ExpenseIntent::Add);
        assert_eq!(parsed.merchant, "Joe's Diner");
        assert_eq!(parsed.spent_on, today().pred_opt().unwrap());
    }

    #[test]
    fn test_from_clause_with_description() {
        let parsed = parse("bought groceries from walmart for $85", today()).unwrap();
        assert_eq!(parsed.intent, ExpenseIntent::Add);
        assert_eq!(parsed.merchant, "Walmart");
        assert_eq!(parsed.description.as_deref(), Some("groceries"));
        assert_eq!(parsed.amount, 85.0);
    }

    #[test]
    fn test_service_statement_synthesizes_label() {
        let parsed = parse("I spent $2500 fixing the home AC", today()).unwrap();
        assert_eq!(parsed.intent, ExpenseIntent::Suggest);
        assert_eq!(parsed.merchant, "Home AC Repair");
        assert_eq!(parsed.amount, 2500.0);
    }

    #[test]
    fn test_vague_statement_suggests_residual_merchant() {
        let parsed = parse("log 12.50 lunch", today()).unwrap();
        assert_eq!(parsed.intent, ExpenseIntent::Suggest);
        assert_eq!(parsed.merchant, "Lunch");
        assert_eq!(parsed.amount, 12.50);
    }

    #[test]
    fn test_relative_dates() {
        let parsed = parse("paid $100 for cleaning 2 weeks ago", today()).unwrap();
        assert_eq!(parsed.merchant, "Cleaning");
        assert_eq!(
            parsed.spent_on,
            today().checked_sub_days(Days::new(14)).unwrap()
        );

        let parsed = parse("got $20 gas 3 days ago", today()).unwrap();
        assert_eq!(parsed.amount, 20.0);
        assert_eq!(
            parsed.spent_on,
            today().checked_sub_days(Days::new(3)).unwrap()
        );
    }

    #[test]
    fn test_first_amount_wins() {
        let parsed = parse("add $6 coffee and a $9 sandwich", today()).unwrap();
        assert_eq!(parsed.amount, 6.0);
    }

    #[test]
    fn test_no_merchant_derivable_returns_none() {
        assert!(parse("spent $50", today()).is_none());
    }

    #[tokio::test]
    async fn test_oracle_first_parse_with_fallback() {
        use crate::oracle::MockOracle;

        let oracle = MockOracle {
            category: None,
            parse: Some(OracleExpenseParse {
                intent: ExpenseIntent::Add,
                amount: 14.25,
                merchant: "blue bottle".to_string(),
                description: Some("cold brew".to_string()),
                date_hint: Some("yesterday".to_string()),
            }),
        };
        let parsed = parse_with_oracle(
            &oracle,
            "grabbed cold brew at blue bottle for 14.25",
            today(),
        )
        .await
        .unwrap();
        assert_eq!(parsed.merchant, "Blue Bottle");
        assert_eq!(parsed.amount, 14.25);
        assert_eq!(parsed.spent_on, today().pred_opt().unwrap());

        // A dead oracle falls back to the heuristic.
        let oracle = MockOracle::default();
        let parsed = parse_with_oracle(&oracle, "add $6 coffee starbucks", today())
            .await
            .unwrap();
        assert_eq!(parsed.merchant, "Starbucks");
        assert_eq!(parsed.intent, ExpenseIntent::Add);
    }

    #[tokio::test]
    async fn test_oracle_none_verdict_is_trusted() {
        use crate::oracle::MockOracle;

        let oracle = MockOracle {
            category: None,
            parse: Some(OracleExpenseParse {
                intent: ExpenseIntent::None,
                amount: 0.0,
                merchant: String::new(),
                description: None,
                date_hint: None,
            }),
        };
        // The heuristic would have parsed this, but the oracle's clean
        // "no expense" verdict wins.
        assert!(parse_with_oracle(&oracle, "add $6 coffee starbucks", today())
            .await
            .is_none());
    }
}
