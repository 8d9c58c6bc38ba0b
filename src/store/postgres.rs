//! Postgres expense store
//!
//! Lazy pool, schema bootstrap on first use, plain upserts. No
//! cross-table transactions: every write the pipeline issues is
//! independently useful.

use super::ExpenseStore;
use crate::error::AssistantError;
use crate::keywords::DEFAULT_CATEGORIES;
use crate::models::{
    BudgetGoal, Category, Expense, ExpenseUpdate, MerchantResolution, NewExpense,
    ResolutionLogEntry, ResolvedBy, UserOverride,
};
use crate::Result;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

pub struct PgStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgStore {
    /// Build a store over a lazily-connected pool. The first query
    /// triggers the actual connection and the schema bootstrap.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
            .map_err(|e| AssistantError::DatabaseError(format!("Failed to build pool: {}", e)))?;

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS categories (
                      category_id UUID PRIMARY KEY,
                      name TEXT NOT NULL UNIQUE
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS expenses (
                      expense_id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      amount DOUBLE PRECISION NOT NULL,
                      merchant TEXT NOT NULL,
                      category_id UUID NOT NULL,
                      category_name TEXT NOT NULL,
                      description TEXT,
                      spent_at TIMESTAMPTZ NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_expenses_user_time
                    ON expenses (user_id, created_at);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS user_category_overrides (
                      user_id UUID NOT NULL,
                      merchant_key TEXT NOT NULL,
                      category_name TEXT NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL,
                      PRIMARY KEY (user_id, merchant_key)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS merchant_resolutions (
                      merchant_key TEXT PRIMARY KEY,
                      category_name TEXT NOT NULL,
                      confidence DOUBLE PRECISION NOT NULL,
                      resolution_count BIGINT NOT NULL,
                      last_resolved_at TIMESTAMPTZ NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS categorization_log (
                      user_id UUID NOT NULL,
                      expense_id UUID,
                      merchant_key TEXT NOT NULL,
                      category_name TEXT NOT NULL,
                      resolved_by TEXT NOT NULL,
                      confidence DOUBLE PRECISION NOT NULL,
                      logged_at TIMESTAMPTZ NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS budget_goals (
                      user_id UUID NOT NULL,
                      category_id UUID NOT NULL,
                      category_name TEXT NOT NULL,
                      monthly_limit DOUBLE PRECISION NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL,
                      PRIMARY KEY (user_id, category_id)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                for name in DEFAULT_CATEGORIES {
                    sqlx::query(
                        "INSERT INTO categories (category_id, name) VALUES ($1, $2)
                         ON CONFLICT (name) DO NOTHING",
                    )
                    .bind(Uuid::new_v4())
                    .bind(name)
                    .execute(&self.pool)
                    .await?;
                }

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                AssistantError::DatabaseError(format!("Failed to initialize schema: {}", e))
            })?;

        Ok(())
    }

    fn resolved_by_to_db(resolved_by: ResolvedBy) -> &'static str {
        resolved_by.as_str()
    }

    fn map_expense(row: &sqlx::postgres::PgRow) -> Expense {
        Expense {
            expense_id: row.try_get("expense_id").unwrap_or_else(|_| Uuid::nil()),
            user_id: row.try_get("user_id").unwrap_or_else(|_| Uuid::nil()),
            amount: row.try_get("amount").unwrap_or(0.0),
            merchant: row.try_get("merchant").unwrap_or_default(),
            category_id: row.try_get("category_id").unwrap_or_else(|_| Uuid::nil()),
            category_name: row.try_get("category_name").unwrap_or_default(),
            description: row.try_get("description").ok(),
            spent_at: row.try_get("spent_at").unwrap_or_else(|_| chrono::Utc::now()),
            created_at: row
                .try_get("created_at")
                .unwrap_or_else(|_| chrono::Utc::now()),
        }
    }

    fn db_error(context: &str, e: sqlx::Error) -> AssistantError {
        AssistantError::DatabaseError(format!("{}: {}", context, e))
    }
}

#[async_trait::async_trait]
impl ExpenseStore for PgStore {
    async fn list_categories(&self, _user_id: Uuid) -> Result<Vec<Category>> {
        self.ensure_schema().await?;

        let rows = sqlx::query("SELECT category_id, name FROM categories ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::db_error("Failed to load categories", e))?;

        Ok(rows
            .iter()
            .map(|row| Category {
                category_id: row.try_get("category_id").unwrap_or_else(|_| Uuid::nil()),
                name: row.try_get("name").unwrap_or_default(),
            })
            .collect())
    }

    async fn insert_expense(&self, expense: NewExpense) -> Result<Expense> {
        self.ensure_schema().await?;

        let expense_id = Uuid::new_v4();
        let created_at = chrono::Utc::now();

        sqlx::query(
            r#"
            INSERT INTO expenses
              (expense_id, user_id, amount, merchant, category_id, category_name, description, spent_at, created_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(expense_id)
        .bind(expense.user_id)
        .bind(expense.amount)
        .bind(&expense.merchant)
        .bind(expense.category_id)
        .bind(&expense.category_name)
        .bind(&expense.description)
        .bind(expense.spent_at)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_error("Failed to insert expense", e))?;

        Ok(Expense {
            expense_id,
            user_id: expense.user_id,
            amount: expense.amount,
            merchant: expense.merchant,
            category_id: expense.category_id,
            category_name: expense.category_name,
            description: expense.description,
            spent_at: expense.spent_at,
            created_at,
        })
    }

    async fn list_expenses(&self, user_id: Uuid) -> Result<Vec<Expense>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT expense_id, user_id, amount, merchant, category_id, category_name,
                   description, spent_at, created_at
            FROM expenses
            WHERE user_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::db_error("Failed to load expenses", e))?;

        Ok(rows.iter().map(Self::map_expense).collect())
    }

    async fn update_expense(&self, expense_id: Uuid, update: ExpenseUpdate) -> Result<Expense> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT expense_id, user_id, amount, merchant, category_id, category_name,
                   description, spent_at, created_at
            FROM expenses
            WHERE expense_id = $1
            "#,
        )
        .bind(expense_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::db_error("Failed to load expense", e))?
        .ok_or_else(|| AssistantError::NotFound(format!("expense {}", expense_id)))?;

        let mut record = Self::map_expense(&row);
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

        sqlx::query(
            r#"
            UPDATE expenses
            SET amount = $1, merchant = $2, description = $3,
                category_id = $4, category_name = $5
            WHERE expense_id = $6
            "#,
        )
        .bind(record.amount)
        .bind(&record.merchant)
        .bind(&record.description)
        .bind(record.category_id)
        .bind(&record.category_name)
        .bind(expense_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_error("Failed to update expense", e))?;

        Ok(record)
    }

    async fn get_override(
        &self,
        user_id: Uuid,
        merchant_key: &str,
    ) -> Result<Option<UserOverride>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT user_id, merchant_key, category_name, updated_at
            FROM user_category_overrides
            WHERE user_id = $1 AND merchant_key = $2
            "#,
        )
        .bind(user_id)
        .bind(merchant_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::db_error("Failed to load override", e))?;

        Ok(row.map(|row| UserOverride {
            user_id,
            merchant_key: merchant_key.to_string(),
            category_name: row.try_get("category_name").unwrap_or_default(),
            updated_at: row
                .try_get("updated_at")
                .unwrap_or_else(|_| chrono::Utc::now()),
        }))
    }

    async fn upsert_override(&self, entry: UserOverride) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO user_category_overrides (user_id, merchant_key, category_name, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, merchant_key)
            DO UPDATE SET category_name = EXCLUDED.category_name,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(entry.user_id)
        .bind(&entry.merchant_key)
        .bind(&entry.category_name)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_error("Failed to upsert override", e))?;

        Ok(())
    }

    async fn get_merchant_resolution(
        &self,
        merchant_key: &str,
    ) -> Result<Option<MerchantResolution>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT merchant_key, category_name, confidence, resolution_count, last_resolved_at
            FROM merchant_resolutions
            WHERE merchant_key = $1
            "#,
        )
        .bind(merchant_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::db_error("Failed to load merchant resolution", e))?;

        Ok(row.map(|row| MerchantResolution {
            merchant_key: merchant_key.to_string(),
            category_name: row.try_get("category_name").unwrap_or_default(),
            confidence: row.try_get("confidence").unwrap_or(0.0),
            resolution_count: row.try_get("resolution_count").unwrap_or(0),
            last_resolved_at: row
                .try_get("last_resolved_at")
                .unwrap_or_else(|_| chrono::Utc::now()),
        }))
    }

    async fn upsert_merchant_resolution(&self, entry: MerchantResolution) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO merchant_resolutions
              (merchant_key, category_name, confidence, resolution_count, last_resolved_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (merchant_key)
            DO UPDATE SET category_name = EXCLUDED.category_name,
                          confidence = EXCLUDED.confidence,
                          resolution_count = EXCLUDED.resolution_count,
                          last_resolved_at = EXCLUDED.last_resolved_at
            "#,
        )
        .bind(&entry.merchant_key)
        .bind(&entry.category_name)
        .bind(entry.confidence)
        .bind(entry.resolution_count)
        .bind(entry.last_resolved_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_error("Failed to upsert merchant resolution", e))?;

        Ok(())
    }

    async fn append_resolution_log(&self, entry: ResolutionLogEntry) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO categorization_log
              (user_id, expense_id, merchant_key, category_name, resolved_by, confidence, logged_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.expense_id)
        .bind(&entry.merchant_key)
        .bind(&entry.category_name)
        .bind(Self::resolved_by_to_db(entry.resolved_by))
        .bind(entry.confidence)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_error("Failed to append categorization log", e))?;

        Ok(())
    }

    async fn set_budget_goal(&self, goal: BudgetGoal) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO budget_goals (user_id, category_id, category_name, monthly_limit, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, category_id)
            DO UPDATE SET monthly_limit = EXCLUDED.monthly_limit,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(goal.user_id)
        .bind(goal.category_id)
        .bind(&goal.category_name)
        .bind(goal.monthly_limit)
        .bind(goal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_error("Failed to set budget goal", e))?;

        Ok(())
    }

    async fn remove_budget_goal(&self, user_id: Uuid, category_id: Uuid) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query("DELETE FROM budget_goals WHERE user_id = $1 AND category_id = $2")
            .bind(user_id)
            .bind(category_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::db_error("Failed to remove budget goal", e))?;

        Ok(())
    }
}
