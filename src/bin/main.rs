use expense_assistant::{
    dispatcher::{Dispatcher, NoopCallbacks},
    insights::NoInsights,
    store::{ExpenseStore, InMemoryStore},
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Expense Assistant starting");

    // Create components
    let store = Arc::new(InMemoryStore::with_default_categories());
    let user_id = Uuid::new_v4();
    let mut dispatcher = Dispatcher::new(
        store.clone(),
        None,
        Arc::new(NoInsights),
        Arc::new(NoopCallbacks),
        user_id,
    );

    // Run a sample conversation
    let turns = [
        "add $6 coffee starbucks",
        "I spent $2500 fixing the home AC",
        "yes",
        "set groceries budget to $300",
        "change the starbucks expense to $8",
        "how am i doing this month?",
    ];

    for turn in turns {
        println!("\n> {}", turn);
        match dispatcher.handle_message(turn).await {
            Ok(outcome) => println!("{:#?}", outcome),
            Err(e) => eprintln!("dispatch failed: {}", e),
        }
    }

    let expenses = store.list_expenses(user_id).await?;
    println!("\n=== EXPENSES ===");
    for expense in expenses {
        println!(
            "  {} ${:.2} ({})",
            expense.merchant, expense.amount, expense.category_name
        );
    }

    Ok(())
}
