//! Remote classification oracle trait and implementations
//!
//! The oracle covers the two judgment calls the deterministic pipeline
//! delegates when a model is available: expense intent extraction and
//! category classification. Every call is treated as unreliable; callers
//! must degrade gracefully on any error.

use crate::models::ExpenseIntent;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod gemini;
pub use gemini::GeminiOracle;

/// Structured expense extraction returned by the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleExpenseParse {
    pub intent: ExpenseIntent,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub merchant: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub date_hint: Option<String>,
}

/// Trait for the remote text-classification/extraction oracle (LLM controlled)
#[async_trait]
pub trait ClassificationOracle: Send + Sync {
    /// Extract a structured expense candidate from raw text.
    async fn parse_expense(&self, message: &str) -> Result<OracleExpenseParse>;

    /// Pick one category name for a merchant. The caller validates the
    /// answer against its allowed list; this method returns the raw name.
    async fn classify_category(
        &self,
        merchant: &str,
        description: Option<&str>,
        message: Option<&str>,
        allowed: &[String],
    ) -> Result<String>;
}

/// Mock oracle for development & testing
/// Keeps system functional without LLM dependency
#[derive(Debug, Default)]
pub struct MockOracle {
    /// Fixed answer for `classify_category`; `None` means the call errors
    /// like an unreachable service.
    pub category: Option<String>,
    /// Fixed answer for `parse_expense`; `None` means the call errors.
    pub parse: Option<OracleExpenseParse>,
}

#[async_trait]
impl ClassificationOracle for MockOracle {
    async fn parse_expense(&self, _message: &str) -> Result<OracleExpenseParse> {
        self.parse.clone().ok_or_else(|| {
            crate::error::AssistantError::LlmError("mock oracle has no parse answer".to_string())
        })
    }

    async fn classify_category(
        &self,
        _merchant: &str,
        _description: Option<&str>,
        _message: Option<&str>,
        _allowed: &[String],
    ) -> Result<String> {
        self.category.clone().ok_or_else(|| {
            crate::error::AssistantError::LlmError(
                "mock oracle has no category answer".to_string(),
            )
        })
    }
}
