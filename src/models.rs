//! Core data models for the expense assistant

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

/// Three-way intent split produced by the parser.
///
/// `Add` is auto-actionable; `Suggest` requires a confirmation turn;
/// `None` means the message carries no expense information.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExpenseIntent {
    Add,
    Suggest,
    None,
}

/// Which waterfall tier produced a category assignment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    UserOverride,
    GlobalCache,
    Keyword,
    Ai,
    Fallback,
    UserCorrection,
}

impl ResolvedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedBy::UserOverride => "user_override",
            ResolvedBy::GlobalCache => "global_cache",
            ResolvedBy::Keyword => "keyword",
            ResolvedBy::Ai => "ai",
            ResolvedBy::Fallback => "fallback",
            ResolvedBy::UserCorrection => "user_correction",
        }
    }
}

impl fmt::Display for ResolvedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//
// ================= Parser Output =================
//

/// Transient extraction result, created per utterance and consumed
/// immediately. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedCommand {
    pub intent: ExpenseIntent,
    pub amount: f64,
    pub merchant: String,
    pub description: Option<String>,
    /// Date hint resolved against "today" at parse time.
    pub spent_on: NaiveDate,
}

//
// ================= Categories =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Category {
    pub category_id: Uuid,
    pub name: String,
}

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            category_id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// A category assignment with provenance and confidence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedCategory {
    pub category_id: Uuid,
    pub category_name: String,
    pub resolved_by: ResolvedBy,
    pub confidence: f64,
}

//
// ================= Resolution Records =================
//

/// A user's permanent per-merchant correction. Highest-precedence signal;
/// later corrections replace earlier ones outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOverride {
    pub user_id: Uuid,
    pub merchant_key: String,
    pub category_name: String,
    pub updated_at: DateTime<Utc>,
}

/// Cross-user shared cache entry, updated by incremental weighted average.
/// Confidence stays in [0, 0.99]; 1.0 is reserved for user overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantResolution {
    pub merchant_key: String,
    pub category_name: String,
    pub confidence: f64,
    pub resolution_count: i64,
    pub last_resolved_at: DateTime<Utc>,
}

/// Append-only audit record. Write-only from the pipeline's perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionLogEntry {
    pub user_id: Uuid,
    pub expense_id: Option<Uuid>,
    pub merchant_key: String,
    pub category_name: String,
    pub resolved_by: ResolvedBy,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

//
// ================= Expenses =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expense {
    pub expense_id: Uuid,
    pub user_id: Uuid,
    pub amount: f64,
    pub merchant: String,
    pub category_id: Uuid,
    pub category_name: String,
    pub description: Option<String>,
    pub spent_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExpense {
    pub user_id: Uuid,
    pub amount: f64,
    pub merchant: String,
    pub category_id: Uuid,
    pub category_name: String,
    pub description: Option<String>,
    pub spent_at: DateTime<Utc>,
}

/// Field updates applied to a single located expense.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpenseUpdate {
    pub amount: Option<f64>,
    pub merchant: Option<String>,
    pub description: Option<String>,
    pub category: Option<Category>,
}

impl ExpenseUpdate {
    pub fn is_empty(&self) -> bool {
        self.amount.is_none()
            && self.merchant.is_none()
            && self.description.is_none()
            && self.category.is_none()
    }
}

//
// ================= Budget Goals =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetGoal {
    pub user_id: Uuid,
    pub category_id: Uuid,
    pub category_name: String,
    pub monthly_limit: f64,
    pub updated_at: DateTime<Utc>,
}

//
// ================= Pending Suggestion =================
//

/// One ephemeral "did you mean to add this?" candidate. At most one
/// instance exists per conversation; it is cleared on the very next turn
/// regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSuggestion {
    pub amount: f64,
    pub merchant: String,
    pub description: Option<String>,
    pub spent_on: NaiveDate,
    /// Category resolved read-only at suggestion time; reused verbatim
    /// if the user confirms.
    pub resolved: ResolvedCategory,
    pub created_at: DateTime<Utc>,
}
