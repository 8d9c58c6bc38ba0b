//! REST API server for the expense assistant
//!
//! Exposes the conversational dispatcher via HTTP. Each conversation gets
//! its own dispatcher instance so the pending-confirmation slot is never
//! shared across chats.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::dispatcher::{AssistantCallbacks, DispatchOutcome, Dispatcher};
use crate::insights::InsightsProvider;
use crate::oracle::ClassificationOracle;
use crate::store::ExpenseStore;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub user_id: Option<String>,
    pub chat_id: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn ExpenseStore>,
    pub oracle: Option<Arc<dyn ClassificationOracle>>,
    pub insights: Arc<dyn InsightsProvider>,
    pub callbacks: Arc<dyn AssistantCallbacks>,
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Mutex<Dispatcher>>>>>,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn ExpenseStore>,
        oracle: Option<Arc<dyn ClassificationOracle>>,
        insights: Arc<dyn InsightsProvider>,
        callbacks: Arc<dyn AssistantCallbacks>,
    ) -> Self {
        Self {
            store,
            oracle,
            insights,
            callbacks,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn dispatcher_for(&self, conversation_id: Uuid, user_id: Uuid) -> Arc<Mutex<Dispatcher>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(dispatcher) = sessions.get(&conversation_id) {
                return Arc::clone(dispatcher);
            }
        }

        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(conversation_id).or_insert_with(|| {
            Arc::new(Mutex::new(Dispatcher::new(
                Arc::clone(&self.store),
                self.oracle.clone(),
                Arc::clone(&self.insights),
                Arc::clone(&self.callbacks),
                user_id,
            )))
        }))
    }
}

/// =============================
/// Helpers — String → UUID Parsing
/// =============================

fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

fn parse_or_stable_uuid(value: Option<&str>, fallback_seed: &str) -> Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => stable_uuid_from_string(fallback_seed),
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = parse_or_stable_uuid(req.user_id.as_deref(), "anonymous-user");
    let conversation_id = req
        .chat_id
        .as_deref()
        .map(|value| parse_or_stable_uuid(Some(value), "chat-fallback"))
        .unwrap_or(user_id);

    info!(
        "chat_handler ids => conversation_id={} user_id={}",
        conversation_id, user_id
    );

    let dispatcher = state.dispatcher_for(conversation_id, user_id).await;
    let result = {
        let mut dispatcher = dispatcher.lock().await;
        dispatcher.handle_message(&req.message).await
    };

    match result {
        Ok(outcome) => {
            let answer = outcome_answer(&outcome);
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({
                    "answer": answer,
                    "outcome": outcome,
                    "conversation_id": conversation_id.to_string(),
                    "user_id": user_id.to_string(),
                }))),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Chat handler failed: {}", e))),
        ),
    }
}

fn outcome_answer(outcome: &DispatchOutcome) -> String {
    match outcome {
        DispatchOutcome::Inserted { message, .. }
        | DispatchOutcome::Proposal { message }
        | DispatchOutcome::Dismissed { message }
        | DispatchOutcome::Updated { message, .. }
        | DispatchOutcome::BudgetGoalSet { message, .. }
        | DispatchOutcome::BudgetGoalRemoved { message, .. }
        | DispatchOutcome::Failure { message } => message.clone(),
        DispatchOutcome::SearchRequested { query } => {
            format!("Searching your expenses for \"{}\".", query)
        }
        DispatchOutcome::ExportRequested => "Starting your export.".to_string(),
        DispatchOutcome::NotHandled => {
            "I track your spending. Tell me things like \"add $6 coffee at starbucks\"."
                .to_string()
        }
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/api/chat", post(chat_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_uuid_is_deterministic() {
        let a = stable_uuid_from_string("user-42");
        let b = stable_uuid_from_string("user-42");
        assert_eq!(a, b);
        assert_ne!(a, stable_uuid_from_string("user-43"));
    }

    #[test]
    fn test_parse_or_stable_uuid_accepts_real_uuids() {
        let id = Uuid::new_v4();
        assert_eq!(parse_or_stable_uuid(Some(&id.to_string()), "seed"), id);
        assert_eq!(
            parse_or_stable_uuid(None, "seed"),
            stable_uuid_from_string("seed")
        );
    }
}
