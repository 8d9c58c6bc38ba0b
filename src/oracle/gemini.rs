//! Gemini-backed classification oracle
//!
//! Uses a long-lived reqwest::Client for connection pooling. Both
//! capabilities ask for JSON-only answers and strip markdown fences
//! before parsing; anything that doesn't parse is an oracle miss, never
//! a pipeline failure.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use super::{ClassificationOracle, OracleExpenseParse};
use crate::error::AssistantError;
use crate::Result;

/// Reusable Gemini client (connection-pooled)
pub struct GeminiOracle {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiOracle {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".to_string(),
        }
    }

    /// Send one prompt and return the first candidate's text.
    async fn generate(&self, query: &str, system_prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(AssistantError::LlmError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.base_url, self.api_key);

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: query.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.1,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 256,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: system_prompt.to_string(),
                }],
            },
        };

        info!("Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                AssistantError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(AssistantError::LlmError(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            AssistantError::LlmError(format!("Gemini parse error: {}", e))
        })?;

        let answer = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| AssistantError::LlmError("Empty response from Gemini".to_string()))?;

        Ok(answer)
    }
}

#[async_trait]
impl ClassificationOracle for GeminiOracle {
    async fn parse_expense(&self, message: &str) -> Result<OracleExpenseParse> {
        let prompt = format!(
            r#"Extract expense information from this message:

"{}"

Rules:
- intent is "add" when the user names a specific merchant or gives a clear
  command, "suggest" when spending is described without a specific
  merchant, "none" when the message carries no expense
- amount is the money spent (number, no currency sign)
- merchant is the place or payee, title-cased
- description is a short noun phrase for what was bought, or null
- date_hint is "today", "yesterday", "N days ago" or null
- Return ONLY valid JSON, no explanation text
- JSON format:

{{
  "intent": "add",
  "amount": 6.0,
  "merchant": "Starbucks",
  "description": "coffee",
  "date_hint": "today"
}}
"#,
            message
        );

        let response = self.generate(&prompt, EXTRACTION_SYSTEM_PROMPT).await?;
        let cleaned = strip_fences(&response);

        serde_json::from_str(cleaned).map_err(|e| {
            AssistantError::LlmError(format!(
                "Failed to parse Gemini expense response: {} | raw={}",
                e, response
            ))
        })
    }

    async fn classify_category(
        &self,
        merchant: &str,
        description: Option<&str>,
        message: Option<&str>,
        allowed: &[String],
    ) -> Result<String> {
        let prompt = format!(
            r#"Pick the best spending category for this expense.

Merchant: {}
Description: {}
Original message: {}

Allowed categories:
- {}

Rules:
- Answer with EXACTLY one category name from the allowed list
- No explanation text, no punctuation, just the name
"#,
            merchant,
            description.unwrap_or("(none)"),
            message.unwrap_or("(none)"),
            allowed.join("\n- "),
        );

        let response = self.generate(&prompt, CLASSIFICATION_SYSTEM_PROMPT).await?;
        let cleaned = strip_fences(&response).trim_matches('"').trim();

        if cleaned.is_empty() {
            return Err(AssistantError::LlmError(
                "Empty category from Gemini".to_string(),
            ));
        }

        Ok(cleaned.to_string())
    }
}

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are an expense extraction engine for a personal finance assistant.

Guidelines:
- Extract only what the user actually said
- Never invent merchants or amounts
- Prefer "suggest" over "add" when the merchant is vague

Format: respond with a single JSON object and nothing else."#;

const CLASSIFICATION_SYSTEM_PROMPT: &str = r#"You are a spending categorization engine.

Guidelines:
- Choose from the allowed list only
- Pick the most specific category that fits

Format: respond with one category name and nothing else."#;

/// Strip a ```json ... ``` fence (or bare backticks) around a response.
fn strip_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}
