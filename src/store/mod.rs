//! Persistence layer
//!
//! The core issues point lookups by exact key, upserts, and inserts; no
//! transactions span tables. `InMemoryStore` backs development and tests;
//! the postgres backend is selected automatically when a database URL is
//! configured.

use crate::keywords::DEFAULT_CATEGORIES;
use crate::models::{
    BudgetGoal, Category, Expense, ExpenseUpdate, MerchantResolution, NewExpense,
    ResolutionLogEntry, UserOverride,
};
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub mod postgres;
pub use postgres::PgStore;

/// Trait for expense persistence
#[async_trait::async_trait]
pub trait ExpenseStore: Send + Sync {
    async fn list_categories(&self, user_id: Uuid) -> Result<Vec<Category>>;

    async fn insert_expense(&self, expense: NewExpense) -> Result<Expense>;
    async fn list_expenses(&self, user_id: Uuid) -> Result<Vec<Expense>>;
    async fn update_expense(&self, expense_id: Uuid, update: ExpenseUpdate) -> Result<Expense>;

    async fn get_override(&self, user_id: Uuid, merchant_key: &str)
        -> Result<Option<UserOverride>>;
    async fn upsert_override(&self, entry: UserOverride) -> Result<()>;

    async fn get_merchant_resolution(&self, merchant_key: &str)
        -> Result<Option<MerchantResolution>>;
    async fn upsert_merchant_resolution(&self, entry: MerchantResolution) -> Result<()>;

    async fn append_resolution_log(&self, entry: ResolutionLogEntry) -> Result<()>;

    async fn set_budget_goal(&self, goal: BudgetGoal) -> Result<()>;
    async fn remove_budget_goal(&self, user_id: Uuid, category_id: Uuid) -> Result<()>;
}

/// Pick a store backend from the environment: postgres when a database URL
/// is configured and reachable, in-memory otherwise.
pub fn store_from_env() -> Arc<dyn ExpenseStore> {
    let database_url = env::var("POSTGRES_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .ok();

    if let Some(url) = database_url {
        match PgStore::connect_lazy(&url) {
            Ok(store) => {
                info!("Expense store backend: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Expense store backend: in-memory");
    Arc::new(InMemoryStore::with_default_categories())
}

/// In-memory store for development and tests
pub struct InMemoryStore {
    categories: Arc<RwLock<Vec<Category>>>,
    // Vec keeps insertion order, which the update cascade's first-match
    // semantics depend on.
    expenses: Arc<RwLock<Vec<Expense>>>,
    overrides: Arc<RwLock<HashMap<(Uuid, String), UserOverride>>>,
    resolutions: Arc<RwLock<HashMap<String, MerchantResolution>>>,
    log: Arc<RwLock<Vec<ResolutionLogEntry>>>,
    budget_goals: Arc<RwLock<HashMap<(Uuid, Uuid), BudgetGoal>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            categories: Arc::new(RwLock::new(Vec::new())),
            expenses: Arc::new(RwLock::new(Vec::new())),
            overrides: Arc::new(RwLock::new(HashMap::new())),
            resolutions: Arc::new(RwLock::new(HashMap::new())),
            log: Arc::new(RwLock::new(Vec::new())),
            budget_goals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_default_categories() -> Self {
        let store = Self::new();
        {
            let mut categories = store
                .categories
                .try_write()
                .expect("fresh store lock is uncontended");
            categories.extend(DEFAULT_CATEGORIES.iter().map(|name| Category::new(*name)));
        }
        store
    }

    pub fn with_categories(names: &[&str]) -> Self {
        let store = Self::new();
        {
            let mut categories = store
                .categories
                .try_write()
                .expect("fresh store lock is uncontended");
            categories.extend(names.iter().map(|name| Category::new(*name)));
        }
        store
    }

    /// Snapshot of the categorization log, for assertions in tests.
    pub async fn resolution_log(&self) -> Vec<ResolutionLogEntry> {
        self.log.read().await.clone()
    }

    /// Snapshot of a budget goal, for assertions in tests.
    pub async fn budget_goal(&self, user_id: Uuid, category_id: Uuid) -> Option<BudgetGoal> {
        self.budget_goals
            .read()
            .await
            .get(&(user_id, category_id))
            .cloned()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExpenseStore for InMemoryStore {
    async fn list_categories(&self, _user_id: Uuid) -> Result<Vec<Category>> {
        Ok(self.categories.read().await.clone())
    }

    async fn insert_expense(&self, expense: NewExpense) -> Result<Expense> {
        let record = Expense {
            expense_id: Uuid::new_v4(),
            user_id: expense.user_id,
            amount: expense.amount,
            merchant: expense.merchant,
            category_id: expense.category_id,
            category_name: expense.category_name,
            description: expense.description,
            spent_at: expense.spent_at,
            created_at: Utc::now(),
        };

        let mut expenses = self.expenses.write().await;
        expenses.push(record.clone());
        Ok(record)
    }

    async fn list_expenses(&self, user_id: Uuid) -> Result<Vec<Expense>> {
        let expenses = self.expenses.read().await;
        Ok(expenses
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_expense(&self, expense_id: Uuid, update: ExpenseUpdate) -> Result<Expense> {
        let mut expenses = self.expenses.write().await;
        let record = expenses
            .iter_mut()
            .find(|e| e.expense_id == expense_id)
            .ok_or_else(|| {
                crate::error::AssistantError::NotFound(format!("expense {}", expense_id))
            })?;

        if let Some(amount) = update.amount {
            record.amount = amount;
        }
        if let Some(merchant) = update.merchant {
            record.merchant = merchant;
        }
        if let Some(description) = update.description {
            record.description = Some(description);
        }
        if let Some(category) = update.category {
            record.category_id = category.category_id;
            record.category_name = category.name;
        }

        Ok(record.clone())
    }

    async fn get_override(
        &self,
        user_id: Uuid,
        merchant_key: &str,
    ) -> Result<Option<UserOverride>> {
        let overrides = self.overrides.read().await;
        Ok(overrides.get(&(user_id, merchant_key.to_string())).cloned())
    }

    async fn upsert_override(&self, entry: UserOverride) -> Result<()> {
        let mut overrides = self.overrides.write().await;
        overrides.insert((entry.user_id, entry.merchant_key.clone()), entry);
        Ok(())
    }

    async fn get_merchant_resolution(
        &self,
        merchant_key: &str,
    ) -> Result<Option<MerchantResolution>> {
        let resolutions = self.resolutions.read().await;
        Ok(resolutions.get(merchant_key).cloned())
    }

    async fn upsert_merchant_resolution(&self, entry: MerchantResolution) -> Result<()> {
        let mut resolutions = self.resolutions.write().await;
        resolutions.insert(entry.merchant_key.clone(), entry);
        Ok(())
    }

    async fn append_resolution_log(&self, entry: ResolutionLogEntry) -> Result<()> {
        let mut log = self.log.write().await;
        log.push(entry);
        Ok(())
    }

    async fn set_budget_goal(&self, goal: BudgetGoal) -> Result<()> {
        let mut goals = self.budget_goals.write().await;
        goals.insert((goal.user_id, goal.category_id), goal);
        Ok(())
    }

    async fn remove_budget_goal(&self, user_id: Uuid, category_id: Uuid) -> Result<()> {
        let mut goals = self.budget_goals.write().await;
        goals.remove(&(user_id, category_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn new_expense(user_id: Uuid, merchant: &str, amount: f64, category: &Category) -> NewExpense {
        NewExpense {
            user_id,
            amount,
            merchant: merchant.to_string(),
            category_id: category.category_id,
            category_name: category.name.clone(),
            description: None,
            spent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_list_expenses() {
        let store = InMemoryStore::with_default_categories();
        let user_id = Uuid::new_v4();
        let categories = store.list_categories(user_id).await.unwrap();
        assert!(!categories.is_empty());

        store
            .insert_expense(new_expense(user_id, "Starbucks", 6.0, &categories[0]))
            .await
            .unwrap();
        store
            .insert_expense(new_expense(Uuid::new_v4(), "Target", 40.0, &categories[0]))
            .await
            .unwrap();

        let expenses = store.list_expenses(user_id).await.unwrap();
        assert_eq!(expenses.len(), 1);
        assert_eq!(expenses[0].merchant, "Starbucks");
    }

    #[tokio::test]
    async fn test_override_upsert_replaces_outright() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();

        store
            .upsert_override(UserOverride {
                user_id,
                merchant_key: "starbucks".to_string(),
                category_name: "Coffee".to_string(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .upsert_override(UserOverride {
                user_id,
                merchant_key: "starbucks".to_string(),
                category_name: "Dining".to_string(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let stored = store.get_override(user_id, "starbucks").await.unwrap().unwrap();
        assert_eq!(stored.category_name, "Dining");
    }

    #[tokio::test]
    async fn test_update_missing_expense_is_not_found() {
        let store = InMemoryStore::new();
        let result = store
            .update_expense(Uuid::new_v4(), ExpenseUpdate::default())
            .await;
        assert!(result.is_err());
    }
}
