//! Conversational dispatcher
//!
//! Top-level orchestrator for one conversation. Classifies each utterance,
//! invokes the parser and the resolution waterfall, executes or defers the
//! resulting action, and owns the one-slot pending-confirmation state
//! machine. A dispatcher instance is scoped to a single conversation; the
//! pending slot has no identity beyond "the one thing this instance is
//! tracking".

use async_trait::async_trait;
use chrono::{Datelike, NaiveTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::insights::InsightsProvider;
use crate::keywords::contains_word;
use crate::models::{
    BudgetGoal, Category, Expense, ExpenseIntent, ExpenseUpdate, NewExpense, ParsedCommand,
    PendingSuggestion, ResolvedCategory,
};
use crate::oracle::ClassificationOracle;
use crate::parser;
use crate::resolution::{CategoryResolver, ResolutionRequest};
use crate::store::ExpenseStore;
use crate::Result;

const AFFIRMATIONS: &[&str] = &[
    "yes", "yeah", "yep", "yup", "sure", "ok", "okay", "confirm", "correct", "right",
    "please do", "do it", "add it", "sounds good", "go ahead", "y",
];

const NEGATIONS: &[&str] = &[
    "no", "nope", "nah", "cancel", "skip", "don't", "dont", "do not", "wrong",
    "never mind", "nevermind", "n",
];

const UPDATE_KEYWORDS: &[&str] = &["change", "update", "edit", "correct"];
const EXPORT_KEYWORDS: &[&str] = &["export", "download", "csv"];
const SEARCH_KEYWORDS: &[&str] = &["search", "find", "show me", "show my", "list my", "look up", "look for"];

const UPDATE_FILLER: &[&str] = &[
    "change", "update", "edit", "correct", "set", "make", "the", "my", "a", "an", "that",
    "this", "it", "expense", "entry", "record", "purchase", "transaction", "to", "from",
    "please", "one",
];

const SEARCH_FILLER: &[&str] = &[
    "search", "find", "show", "list", "look", "up", "for", "me", "my", "all", "on", "in",
    "the", "a", "an", "of", "expenses", "expense", "spending", "transactions", "please",
];

const BUDGET_FILLER: &[&str] = &[
    "set", "a", "an", "the", "my", "budget", "goal", "to", "for", "of", "at", "per",
    "month", "monthly", "limit", "remove", "delete", "clear", "cancel", "please",
];

lazy_static! {
    static ref UPDATE_AMOUNT_RE: Regex =
        Regex::new(r"\bto\s+\$?(\d+(?:\.\d{1,2})?)").expect("valid update amount pattern");
    static ref BUDGET_AMOUNT_RE: Regex =
        Regex::new(r"\$?(\d+(?:\.\d{1,2})?)").expect("valid budget amount pattern");
    static ref MONTH_DAY_RE: Regex =
        Regex::new(r"\b(\d{1,2})/(\d{1,2})\b").expect("valid month/day pattern");
}

/// Action callbacks exposed by the surrounding application. The dispatcher
/// calls these; it does not implement them.
#[async_trait]
pub trait AssistantCallbacks: Send + Sync {
    async fn reload_expenses(&self);
    async fn search(&self, query: &str);
    async fn export(&self);
}

/// Callbacks that do nothing. Default wiring for headless use.
pub struct NoopCallbacks;

#[async_trait]
impl AssistantCallbacks for NoopCallbacks {
    async fn reload_expenses(&self) {}
    async fn search(&self, _query: &str) {}
    async fn export(&self) {}
}

/// Explicit finite-state value object for the confirmation machine:
/// Idle (no pending) or AwaitingConfirmation (exactly one pending).
#[derive(Debug, Default)]
pub struct ConversationState {
    pending: Option<PendingSuggestion>,
}

impl ConversationState {
    fn take_pending(&mut self) -> Option<PendingSuggestion> {
        self.pending.take()
    }

    fn set_pending(&mut self, pending: PendingSuggestion) {
        self.pending = Some(pending);
    }

    pub fn is_awaiting_confirmation(&self) -> bool {
        self.pending.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirmation {
    Affirmed,
    Denied,
    Unrelated,
}

/// Result of one dispatched turn.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Inserted { expense: Expense, message: String },
    Proposal { message: String },
    Dismissed { message: String },
    Updated { expense: Expense, message: String },
    SearchRequested { query: String },
    ExportRequested,
    BudgetGoalSet { category_name: String, monthly_limit: f64, message: String },
    BudgetGoalRemoved { category_name: String, message: String },
    Failure { message: String },
    /// Nothing expense-shaped detected; the caller falls back to its
    /// generic informational handling.
    NotHandled,
}

/// Per-conversation dispatcher.
pub struct Dispatcher {
    store: Arc<dyn ExpenseStore>,
    resolver: CategoryResolver,
    oracle: Option<Arc<dyn ClassificationOracle>>,
    insights: Arc<dyn InsightsProvider>,
    callbacks: Arc<dyn AssistantCallbacks>,
    user_id: Uuid,
    active: bool,
    state: ConversationState,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ExpenseStore>,
        oracle: Option<Arc<dyn ClassificationOracle>>,
        insights: Arc<dyn InsightsProvider>,
        callbacks: Arc<dyn AssistantCallbacks>,
        user_id: Uuid,
    ) -> Self {
        let resolver = CategoryResolver::new(Arc::clone(&store), oracle.clone());

        Self {
            store,
            resolver,
            oracle,
            insights,
            callbacks,
            user_id,
            active: true,
            state: ConversationState::default(),
        }
    }

    /// Capability gate. An inactive dispatcher performs no detection and
    /// defers every turn to the caller's generic handling.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_awaiting_confirmation(&self) -> bool {
        self.state.is_awaiting_confirmation()
    }

    /// Process one user turn.
    pub async fn handle_message(&mut self, text: &str) -> Result<DispatchOutcome> {
        if !self.active {
            return Ok(DispatchOutcome::NotHandled);
        }

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(DispatchOutcome::NotHandled);
        }

        // A pending suggestion gets exactly one chance: the very next turn
        // confirms it, denies it, or silently discards it.
        if let Some(pending) = self.state.take_pending() {
            match read_confirmation(trimmed) {
                Confirmation::Affirmed => {
                    info!(merchant = %pending.merchant, "pending suggestion confirmed");
                    return self
                        .insert_with_category(
                            pending.amount,
                            pending.merchant,
                            pending.description,
                            pending.spent_on,
                            pending.resolved,
                        )
                        .await;
                }
                Confirmation::Denied => {
                    info!(merchant = %pending.merchant, "pending suggestion denied");
                    return Ok(DispatchOutcome::Dismissed {
                        message: format!("Okay, I won't add the {} expense.", pending.merchant),
                    });
                }
                Confirmation::Unrelated => {
                    debug!(merchant = %pending.merchant, "pending suggestion unaddressed, discarding");
                }
            }
        }

        let lowered = trimmed.to_lowercase();

        if contains_word(&lowered, "budget") {
            return self.handle_budget(&lowered).await;
        }
        if EXPORT_KEYWORDS.iter().any(|k| contains_word(&lowered, k)) {
            self.callbacks.export().await;
            return Ok(DispatchOutcome::ExportRequested);
        }
        if UPDATE_KEYWORDS.iter().any(|k| contains_word(&lowered, k)) {
            return self.handle_update(&lowered).await;
        }
        if SEARCH_KEYWORDS.iter().any(|k| contains_word(&lowered, k)) {
            let query = extract_search_query(&lowered);
            self.callbacks.search(&query).await;
            return Ok(DispatchOutcome::SearchRequested { query });
        }

        let today = Utc::now().date_naive();
        let parsed = match &self.oracle {
            Some(oracle) => parser::parse_with_oracle(oracle.as_ref(), trimmed, today).await,
            None => parser::parse(trimmed, today),
        };

        let Some(command) = parsed else {
            return Ok(DispatchOutcome::NotHandled);
        };

        match command.intent {
            ExpenseIntent::Add => self.insert_command(command, trimmed).await,
            ExpenseIntent::Suggest => self.propose(command, trimmed).await,
            ExpenseIntent::None => Ok(DispatchOutcome::NotHandled),
        }
    }

    async fn resolve_for(
        &self,
        command: &ParsedCommand,
        original: &str,
    ) -> Result<ResolvedCategory> {
        let allowed_categories = self.store.list_categories(self.user_id).await?;
        self.resolver
            .resolve(&ResolutionRequest {
                user_id: self.user_id,
                merchant: command.merchant.clone(),
                description: command.description.clone(),
                full_message: Some(original.to_string()),
                allowed_categories,
            })
            .await
    }

    async fn insert_command(
        &mut self,
        command: ParsedCommand,
        original: &str,
    ) -> Result<DispatchOutcome> {
        let resolved = self.resolve_for(&command, original).await?;
        self.insert_with_category(
            command.amount,
            command.merchant,
            command.description,
            command.spent_on,
            resolved,
        )
        .await
    }

    async fn insert_with_category(
        &mut self,
        amount: f64,
        merchant: String,
        description: Option<String>,
        spent_on: chrono::NaiveDate,
        resolved: ResolvedCategory,
    ) -> Result<DispatchOutcome> {
        let new_expense = NewExpense {
            user_id: self.user_id,
            amount,
            merchant,
            category_id: resolved.category_id,
            category_name: resolved.category_name.clone(),
            description,
            spent_at: spent_on.and_time(NaiveTime::MIN).and_utc(),
        };

        match self.store.insert_expense(new_expense).await {
            Ok(expense) => {
                self.resolver.log_resolution(
                    self.user_id,
                    Some(expense.expense_id),
                    &expense.merchant,
                    &resolved,
                );
                self.callbacks.reload_expenses().await;

                let mut message = format!(
                    "Added ${:.2} at {} under {}.",
                    expense.amount, expense.merchant, expense.category_name
                );
                if let Some(note) = self
                    .insights
                    .weekly_spike_note(self.user_id, expense.category_id)
                    .await
                {
                    message.push(' ');
                    message.push_str(&note);
                }

                Ok(DispatchOutcome::Inserted { expense, message })
            }
            Err(error) => {
                warn!(%error, "expense insert failed");
                Ok(DispatchOutcome::Failure {
                    message: format!("I couldn't add that expense: {}", error),
                })
            }
        }
    }

    /// Resolve read-only, park the candidate, and ask.
    async fn propose(&mut self, command: ParsedCommand, original: &str) -> Result<DispatchOutcome> {
        let resolved = self.resolve_for(&command, original).await?;

        let message = format!(
            "It sounds like you spent ${:.2} on {}. Should I add it under {}?",
            command.amount, command.merchant, resolved.category_name
        );

        self.state.set_pending(PendingSuggestion {
            amount: command.amount,
            merchant: command.merchant,
            description: command.description,
            spent_on: command.spent_on,
            resolved,
            created_at: Utc::now(),
        });

        Ok(DispatchOutcome::Proposal { message })
    }

    async fn handle_update(&mut self, lowered: &str) -> Result<DispatchOutcome> {
        let categories = self.store.list_categories(self.user_id).await?;
        let (query, update) = parse_update_request(lowered, &categories);

        if update.is_empty() {
            return Ok(DispatchOutcome::Failure {
                message: "I couldn't tell what to change. Try something like \
                          \"change the starbucks expense to $10\"."
                    .to_string(),
            });
        }
        if query.is_empty() {
            return Ok(DispatchOutcome::Failure {
                message: "I couldn't tell which expense to change.".to_string(),
            });
        }

        let expenses = match self.store.list_expenses(self.user_id).await {
            Ok(expenses) => expenses,
            Err(error) => {
                warn!(%error, "expense listing failed during update");
                return Ok(DispatchOutcome::Failure {
                    message: format!("I couldn't load your expenses: {}", error),
                });
            }
        };

        let Some(target) = find_target(&expenses, &query) else {
            return Ok(DispatchOutcome::Failure {
                message: format!("I couldn't find an expense matching \"{}\".", query),
            });
        };
        let target_id = target.expense_id;
        let target_merchant = target.merchant.clone();
        let corrected_category = update.category.clone();

        match self.store.update_expense(target_id, update).await {
            Ok(expense) => {
                // A manual category edit feeds the learning loop.
                if let Some(category) = corrected_category {
                    self.resolver
                        .record_user_correction(
                            self.user_id,
                            Some(target_id),
                            &target_merchant,
                            &category,
                        )
                        .await;
                }
                self.callbacks.reload_expenses().await;

                let message = format!(
                    "Updated {}: ${:.2} under {}.",
                    expense.merchant, expense.amount, expense.category_name
                );
                Ok(DispatchOutcome::Updated { expense, message })
            }
            Err(error) => {
                warn!(%error, "expense update failed");
                Ok(DispatchOutcome::Failure {
                    message: format!("I couldn't update that expense: {}", error),
                })
            }
        }
    }

    async fn handle_budget(&mut self, lowered: &str) -> Result<DispatchOutcome> {
        let categories = self.store.list_categories(self.user_id).await?;
        let removing = ["remove", "delete", "clear", "cancel"]
            .iter()
            .any(|k| contains_word(lowered, k));

        let (category_text, amount) = parse_budget_request(lowered);

        let Some(category) = fuzzy_match_category(&category_text, &categories) else {
            return Ok(DispatchOutcome::Failure {
                message: format!("I couldn't match a category for \"{}\".", category_text),
            });
        };
        let category = category.clone();

        if removing {
            return match self
                .store
                .remove_budget_goal(self.user_id, category.category_id)
                .await
            {
                Ok(()) => Ok(DispatchOutcome::BudgetGoalRemoved {
                    message: format!("Removed the {} budget.", category.name),
                    category_name: category.name,
                }),
                Err(error) => Ok(DispatchOutcome::Failure {
                    message: format!("I couldn't remove that budget: {}", error),
                }),
            };
        }

        let Some(monthly_limit) = amount else {
            return Ok(DispatchOutcome::Failure {
                message: "I couldn't tell what limit to set. Try \
                          \"set groceries budget to $300\"."
                    .to_string(),
            });
        };

        match self
            .store
            .set_budget_goal(BudgetGoal {
                user_id: self.user_id,
                category_id: category.category_id,
                category_name: category.name.clone(),
                monthly_limit,
                updated_at: Utc::now(),
            })
            .await
        {
            Ok(()) => Ok(DispatchOutcome::BudgetGoalSet {
                message: format!("Set a ${:.2} monthly budget for {}.", monthly_limit, category.name),
                category_name: category.name,
                monthly_limit,
            }),
            Err(error) => Ok(DispatchOutcome::Failure {
                message: format!("I couldn't save that budget: {}", error),
            }),
        }
    }
}

fn read_confirmation(text: &str) -> Confirmation {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '\'')
        .collect();
    let normalized = normalized.trim();

    if AFFIRMATIONS.contains(&normalized) {
        return Confirmation::Affirmed;
    }
    if NEGATIONS.contains(&normalized) {
        return Confirmation::Denied;
    }

    let first = normalized.split_whitespace().next().unwrap_or("");
    if AFFIRMATIONS.contains(&first) {
        Confirmation::Affirmed
    } else if NEGATIONS.contains(&first) {
        Confirmation::Denied
    } else {
        Confirmation::Unrelated
    }
}

/// Locate the update target by a strict ordered cascade; tiers are never
/// merged or ranked against each other. Within a tier the first match in
/// listing order wins.
fn find_target<'a>(expenses: &'a [Expense], query: &str) -> Option<&'a Expense> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return None;
    }

    // 1. Exact merchant equality.
    if let Some(hit) = expenses.iter().find(|e| e.merchant.to_lowercase() == q) {
        return Some(hit);
    }

    // 2. Merchant substring containment.
    if let Some(hit) = expenses
        .iter()
        .find(|e| e.merchant.to_lowercase().contains(&q))
    {
        return Some(hit);
    }

    // 3. Amount equality within a cent.
    if let Some(amount) = parse_query_amount(&q) {
        if let Some(hit) = expenses.iter().find(|e| (e.amount - amount).abs() < 0.01) {
            return Some(hit);
        }
    }

    // 4. "M/D" token against the spend date.
    if let Some((month, day)) = parse_month_day(&q) {
        if let Some(hit) = expenses
            .iter()
            .find(|e| e.spent_at.month() == month && e.spent_at.day() == day)
        {
            return Some(hit);
        }
    }

    None
}

fn parse_query_amount(query: &str) -> Option<f64> {
    query
        .split_whitespace()
        .find_map(|tok| tok.trim_start_matches('$').parse::<f64>().ok())
}

fn parse_month_day(query: &str) -> Option<(u32, u32)> {
    let cap = MONTH_DAY_RE.captures(query)?;
    let month: u32 = cap[1].parse().ok()?;
    let day: u32 = cap[2].parse().ok()?;
    if (1..=12).contains(&month) && (1..=31).contains(&day) {
        Some((month, day))
    } else {
        None
    }
}

fn parse_update_request(lowered: &str, categories: &[Category]) -> (String, ExpenseUpdate) {
    let mut update = ExpenseUpdate::default();
    let mut remaining = lowered.to_string();

    // "to $X" sets a new amount.
    let amount_span = UPDATE_AMOUNT_RE.captures(&remaining).and_then(|cap| {
        let range = cap.get(0)?.range();
        let amount = cap[1].parse::<f64>().ok()?;
        Some((range, amount))
    });
    if let Some((range, amount)) = amount_span {
        update.amount = Some(amount);
        remaining.replace_range(range, " ");
    }

    // "to <category>" sets a new category; a category word anywhere else
    // stays part of the target query.
    if let Some(to_pos) = remaining.rfind(" to ") {
        let tail = remaining[to_pos + 4..].trim().to_string();
        if let Some(category) = fuzzy_match_category(&tail, categories) {
            update.category = Some(category.clone());
            remaining.truncate(to_pos);
        }
    }

    let query = remaining
        .split_whitespace()
        .filter(|tok| !UPDATE_FILLER.contains(tok))
        .collect::<Vec<_>>()
        .join(" ");

    (query, update)
}

fn extract_search_query(lowered: &str) -> String {
    lowered
        .split_whitespace()
        .map(|tok| tok.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|tok| !tok.is_empty() && !SEARCH_FILLER.contains(tok))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Residual category text plus the first dollar amount in a budget
/// phrase. Handles "set X budget to $Y", "$Y budget for X" and the like.
fn parse_budget_request(lowered: &str) -> (String, Option<f64>) {
    let amount = BUDGET_AMOUNT_RE
        .captures(lowered)
        .and_then(|cap| cap[1].parse::<f64>().ok());

    let category_text = lowered
        .split_whitespace()
        .map(|tok| tok.trim_matches(|c: char| !c.is_alphanumeric() && c != '$' && c != '.'))
        .filter(|tok| {
            !tok.is_empty()
                && !BUDGET_FILLER.contains(tok)
                && !BUDGET_AMOUNT_RE
                    .find(tok)
                    .map_or(false, |m| m.as_str() == *tok)
        })
        .collect::<Vec<_>>()
        .join(" ");

    (category_text, amount)
}

/// Exact name match first, then substring containment in either
/// direction. Never guesses past that.
fn fuzzy_match_category<'a>(text: &str, categories: &'a [Category]) -> Option<&'a Category> {
    let needle = text.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }

    categories
        .iter()
        .find(|c| c.name.to_lowercase() == needle)
        .or_else(|| {
            categories.iter().find(|c| {
                let name = c.name.to_lowercase();
                name.contains(&needle) || needle.contains(&name)
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::{NoInsights, StaticInsights};
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingCallbacks {
        reloads: AtomicUsize,
        searches: Mutex<Vec<String>>,
        exports: AtomicUsize,
    }

    #[async_trait]
    impl AssistantCallbacks for RecordingCallbacks {
        async fn reload_expenses(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
        async fn search(&self, query: &str) {
            self.searches.lock().await.push(query.to_string());
        }
        async fn export(&self) {
            self.exports.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (Arc<InMemoryStore>, Arc<RecordingCallbacks>, Uuid, Dispatcher) {
        let store = Arc::new(InMemoryStore::with_default_categories());
        let callbacks = Arc::new(RecordingCallbacks::default());
        let user_id = Uuid::new_v4();
        let dispatcher = Dispatcher::new(
            store.clone(),
            None,
            Arc::new(NoInsights),
            callbacks.clone(),
            user_id,
        );
        (store, callbacks, user_id, dispatcher)
    }

    #[tokio::test]
    async fn test_add_inserts_and_reloads() {
        let (store, callbacks, user_id, mut dispatcher) = setup();

        let outcome = dispatcher.handle_message("add $6 coffee starbucks").await.unwrap();
        let DispatchOutcome::Inserted { expense, .. } = outcome else {
            panic!("expected insert");
        };
        assert_eq!(expense.amount, 6.0);
        assert_eq!(expense.merchant, "Starbucks");
        assert_eq!(expense.category_name, "Coffee");

        assert_eq!(store.list_expenses(user_id).await.unwrap().len(), 1);
        assert_eq!(callbacks.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_suggest_confirm_inserts_exactly_once() {
        let (store, _, user_id, mut dispatcher) = setup();

        let outcome = dispatcher
            .handle_message("I spent $2500 fixing the home AC")
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Proposal { .. }));
        assert!(dispatcher.is_awaiting_confirmation());
        assert!(store.list_expenses(user_id).await.unwrap().is_empty());

        let outcome = dispatcher.handle_message("yes").await.unwrap();
        let DispatchOutcome::Inserted { expense, .. } = outcome else {
            panic!("expected insert on confirmation");
        };
        assert_eq!(expense.amount, 2500.0);
        assert_eq!(expense.merchant, "Home AC Repair");
        assert!(!dispatcher.is_awaiting_confirmation());

        // A second "yes" finds Idle state and falls through to normal
        // processing, producing no insert.
        let outcome = dispatcher.handle_message("yes").await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::NotHandled));
        assert_eq!(store.list_expenses(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_suggest_denied_inserts_nothing() {
        let (store, _, user_id, mut dispatcher) = setup();

        dispatcher
            .handle_message("spent 80 on mowing the lawn")
            .await
            .unwrap();
        assert!(dispatcher.is_awaiting_confirmation());

        let outcome = dispatcher.handle_message("no").await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dismissed { .. }));
        assert!(!dispatcher.is_awaiting_confirmation());
        assert!(store.list_expenses(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_reply_discards_pending_and_processes_fresh() {
        let (store, _, user_id, mut dispatcher) = setup();

        dispatcher
            .handle_message("I spent $2500 fixing the home AC")
            .await
            .unwrap();
        assert!(dispatcher.is_awaiting_confirmation());

        let outcome = dispatcher.handle_message("what's my balance").await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::NotHandled));
        assert!(!dispatcher.is_awaiting_confirmation());
        assert!(store.list_expenses(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_merchant_substring_tier() {
        let (_, _, _, mut dispatcher) = setup();

        dispatcher.handle_message("add $45 at Target").await.unwrap();
        dispatcher.handle_message("add $45 at Costco").await.unwrap();

        let outcome = dispatcher
            .handle_message("change the costco expense to $99")
            .await
            .unwrap();
        let DispatchOutcome::Updated { expense, .. } = outcome else {
            panic!("expected update");
        };
        assert_eq!(expense.merchant, "Costco");
        assert_eq!(expense.amount, 99.0);
    }

    #[tokio::test]
    async fn test_update_amount_tier_first_match_wins() {
        let (_, _, _, mut dispatcher) = setup();

        dispatcher.handle_message("add $45 at Target").await.unwrap();
        dispatcher.handle_message("add $45 at Costco").await.unwrap();

        let outcome = dispatcher.handle_message("change 45 to $50").await.unwrap();
        let DispatchOutcome::Updated { expense, .. } = outcome else {
            panic!("expected update");
        };
        // Ambiguous amount matches take the first expense in listing order.
        assert_eq!(expense.merchant, "Target");
        assert_eq!(expense.amount, 50.0);
    }

    #[tokio::test]
    async fn test_update_category_triggers_learning_loop() {
        let (store, _, user_id, mut dispatcher) = setup();

        dispatcher.handle_message("add $6 coffee starbucks").await.unwrap();
        let outcome = dispatcher
            .handle_message("update starbucks to dining")
            .await
            .unwrap();
        let DispatchOutcome::Updated { expense, .. } = outcome else {
            panic!("expected update");
        };
        assert_eq!(expense.category_name, "Dining");

        let pinned = store.get_override(user_id, "starbucks").await.unwrap().unwrap();
        assert_eq!(pinned.category_name, "Dining");
    }

    #[tokio::test]
    async fn test_update_target_not_found_is_named_failure() {
        let (_, _, _, mut dispatcher) = setup();

        let outcome = dispatcher
            .handle_message("change the starbucks expense to $10")
            .await
            .unwrap();
        let DispatchOutcome::Failure { message } = outcome else {
            panic!("expected failure");
        };
        assert!(message.contains("starbucks"));
    }

    #[tokio::test]
    async fn test_budget_set_and_remove() {
        let (store, _, user_id, mut dispatcher) = setup();
        let categories = store.list_categories(user_id).await.unwrap();
        let groceries = categories.iter().find(|c| c.name == "Groceries").unwrap();

        let outcome = dispatcher
            .handle_message("set groceries budget to $300")
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::BudgetGoalSet { monthly_limit, .. } if monthly_limit == 300.0
        ));
        let goal = store.budget_goal(user_id, groceries.category_id).await.unwrap();
        assert_eq!(goal.monthly_limit, 300.0);

        let outcome = dispatcher
            .handle_message("remove the groceries budget")
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::BudgetGoalRemoved { .. }));
        assert!(store.budget_goal(user_id, groceries.category_id).await.is_none());
    }

    #[tokio::test]
    async fn test_budget_unknown_category_names_the_text() {
        let (_, _, _, mut dispatcher) = setup();

        let outcome = dispatcher
            .handle_message("set unicorns budget to $50")
            .await
            .unwrap();
        let DispatchOutcome::Failure { message } = outcome else {
            panic!("expected failure");
        };
        assert!(message.contains("unicorns"));
    }

    #[tokio::test]
    async fn test_search_and_export_delegate() {
        let (_, callbacks, _, mut dispatcher) = setup();

        let outcome = dispatcher.handle_message("find coffee expenses").await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::SearchRequested { .. }));
        assert_eq!(
            callbacks.searches.lock().await.clone(),
            vec!["coffee".to_string()]
        );

        let outcome = dispatcher.handle_message("export my data").await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::ExportRequested));
        assert_eq!(callbacks.exports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inactive_dispatcher_detects_nothing() {
        let (store, _, user_id, mut dispatcher) = setup();
        dispatcher.set_active(false);

        let outcome = dispatcher.handle_message("add $6 coffee starbucks").await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::NotHandled));
        assert!(store.list_expenses(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spend_spike_note_is_appended() {
        let store = Arc::new(InMemoryStore::with_default_categories());
        let user_id = Uuid::new_v4();
        let categories = store.list_categories(user_id).await.unwrap();
        let coffee = categories.iter().find(|c| c.name == "Coffee").unwrap();

        let insights = StaticInsights::new().with_note(
            coffee.category_id,
            "Heads up: Coffee spending is up 40% this week.",
        );
        let mut dispatcher = Dispatcher::new(
            store.clone(),
            None,
            Arc::new(insights),
            Arc::new(NoopCallbacks),
            user_id,
        );

        let outcome = dispatcher.handle_message("add $6 coffee starbucks").await.unwrap();
        let DispatchOutcome::Inserted { message, .. } = outcome else {
            panic!("expected insert");
        };
        assert!(message.contains("up 40%"));
    }

    #[test]
    fn test_read_confirmation_lexicons() {
        assert_eq!(read_confirmation("yes"), Confirmation::Affirmed);
        assert_eq!(read_confirmation("Yes please!"), Confirmation::Affirmed);
        assert_eq!(read_confirmation("nope"), Confirmation::Denied);
        assert_eq!(read_confirmation("what's my balance"), Confirmation::Unrelated);
    }

    #[test]
    fn test_find_target_date_tier() {
        let base = Expense {
            expense_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount: 20.0,
            merchant: "Shell".to_string(),
            category_id: Uuid::new_v4(),
            category_name: "Transportation".to_string(),
            description: None,
            spent_at: chrono::NaiveDate::from_ymd_opt(2024, 6, 3)
                .unwrap()
                .and_time(NaiveTime::MIN)
                .and_utc(),
            created_at: Utc::now(),
        };
        let expenses = vec![base];

        let hit = find_target(&expenses, "6/3").unwrap();
        assert_eq!(hit.merchant, "Shell");
        assert!(find_target(&expenses, "7/3").is_none());
    }
}
