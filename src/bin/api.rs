use expense_assistant::{
    api::{start_server, ApiState},
    dispatcher::NoopCallbacks,
    insights::NoInsights,
    oracle::{ClassificationOracle, GeminiOracle},
    store::store_from_env,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let gemini_api_key = std::env::var("GEMINI_API_KEY").unwrap_or_else(|_| {
        eprintln!("GEMINI_API_KEY not set; categorization will rely on keywords and cache");
        String::new()
    });

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Expense Assistant - API Server");
    info!("Port: {}", api_port);

    // Create components
    let store = store_from_env();
    let oracle: Option<Arc<dyn ClassificationOracle>> = if gemini_api_key.is_empty() {
        None
    } else {
        Some(Arc::new(GeminiOracle::new(gemini_api_key)))
    };

    let state = ApiState::new(store, oracle, Arc::new(NoInsights), Arc::new(NoopCallbacks));

    info!("Dispatcher sessions ready");
    start_server(state, api_port).await?;

    Ok(())
}
