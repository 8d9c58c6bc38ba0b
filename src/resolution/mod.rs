//! Category resolution waterfall
//!
//! Five signal sources evaluated strictly in order, first accepted answer
//! wins: user override, shared cache, keyword classifier, remote oracle,
//! fallback. Each tier is a small function returning an optional result,
//! so no individual signal-source failure is ever visible to the caller;
//! tier 5 is the termination guarantee. Cache and log writes are
//! fire-and-forget and may lose a concurrent update (last-writer-wins) —
//! the cache is an optimization layer, overrides stay authoritative.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AssistantError;
use crate::keywords;
use crate::merchant::merchant_key;
use crate::models::{
    Category, MerchantResolution, ResolutionLogEntry, ResolvedBy, ResolvedCategory, UserOverride,
};
use crate::oracle::ClassificationOracle;
use crate::store::ExpenseStore;
use crate::Result;

/// Minimum stored confidence for a cache hit to be accepted.
pub const CACHE_ACCEPT_THRESHOLD: f64 = 0.6;
/// Fixed confidence of a keyword-table hit.
pub const KEYWORD_CONFIDENCE: f64 = 0.7;
/// Fixed confidence of an accepted oracle answer.
pub const ORACLE_CONFIDENCE: f64 = 0.8;
/// Confidence of the always-available fallback tier.
pub const FALLBACK_CONFIDENCE: f64 = 0.1;
/// Confidence a user correction pushes into the shared cache.
pub const CORRECTION_CONFIDENCE: f64 = 0.9;
/// Cache ceiling; 1.0 is reserved for explicit user overrides.
pub const CACHE_CONFIDENCE_CEILING: f64 = 0.99;

const FALLBACK_CATEGORY: &str = "Miscellaneous";

/// Inputs for one resolution.
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub user_id: Uuid,
    pub merchant: String,
    pub description: Option<String>,
    pub full_message: Option<String>,
    pub allowed_categories: Vec<Category>,
}

/// Incremental weighted mean, capped below certainty. Smooths a single
/// noisy classification while repeated consistent signal converges upward.
pub fn blend_confidence(old_confidence: f64, old_count: i64, incoming: f64) -> f64 {
    let count = old_count.max(0) as f64;
    ((old_confidence * count + incoming) / (count + 1.0)).min(CACHE_CONFIDENCE_CEILING)
}

/// The waterfall. Holds the store and an optional oracle; cheap signal
/// sources always run before the remote one.
pub struct CategoryResolver {
    store: Arc<dyn ExpenseStore>,
    oracle: Option<Arc<dyn ClassificationOracle>>,
}

impl CategoryResolver {
    pub fn new(
        store: Arc<dyn ExpenseStore>,
        oracle: Option<Arc<dyn ClassificationOracle>>,
    ) -> Self {
        Self { store, oracle }
    }

    /// Resolve a category for a merchant. Never fails while
    /// `allowed_categories` is non-empty.
    pub async fn resolve(&self, request: &ResolutionRequest) -> Result<ResolvedCategory> {
        if request.allowed_categories.is_empty() {
            return Err(AssistantError::ResolutionError(
                "no categories available to resolve against".to_string(),
            ));
        }

        let key = merchant_key(&request.merchant);

        if let Some(hit) = self.from_override(request, &key).await {
            debug!(merchant_key = %key, category = %hit.category_name, "resolved by user override");
            return Ok(hit);
        }

        if let Some(hit) = self.from_cache(request, &key).await {
            debug!(merchant_key = %key, category = %hit.category_name, "resolved by shared cache");
            return Ok(hit);
        }

        if let Some(hit) = self.from_keywords(request) {
            debug!(merchant_key = %key, category = %hit.category_name, "resolved by keyword table");
            self.spawn_cache_update(key, hit.category_name.clone(), KEYWORD_CONFIDENCE);
            return Ok(hit);
        }

        if let Some(hit) = self.from_oracle(request).await {
            debug!(merchant_key = %key, category = %hit.category_name, "resolved by oracle");
            self.spawn_cache_update(key, hit.category_name.clone(), ORACLE_CONFIDENCE);
            return Ok(hit);
        }

        debug!(merchant_key = %key, "falling back to default category");
        Ok(self.fallback(request))
    }

    /// Tier 1: exact (user, merchant) override. Always wins if present.
    async fn from_override(
        &self,
        request: &ResolutionRequest,
        key: &str,
    ) -> Option<ResolvedCategory> {
        let entry = match self.store.get_override(request.user_id, key).await {
            Ok(entry) => entry?,
            Err(error) => {
                warn!(%error, merchant_key = %key, "override lookup failed, treating as miss");
                return None;
            }
        };

        match find_allowed(&request.allowed_categories, &entry.category_name) {
            Some(category) => Some(ResolvedCategory {
                category_id: category.category_id,
                category_name: category.name.clone(),
                resolved_by: ResolvedBy::UserOverride,
                confidence: 1.0,
            }),
            None => {
                warn!(
                    merchant_key = %key,
                    category = %entry.category_name,
                    "override names a category outside the allowed list, skipping"
                );
                None
            }
        }
    }

    /// Tier 2: cross-user shared cache, accepted above the threshold.
    async fn from_cache(&self, request: &ResolutionRequest, key: &str) -> Option<ResolvedCategory> {
        let entry = match self.store.get_merchant_resolution(key).await {
            Ok(entry) => entry?,
            Err(error) => {
                warn!(%error, merchant_key = %key, "cache lookup failed, treating as miss");
                return None;
            }
        };

        if entry.confidence < CACHE_ACCEPT_THRESHOLD {
            return None;
        }

        let category = find_allowed(&request.allowed_categories, &entry.category_name)?;
        Some(ResolvedCategory {
            category_id: category.category_id,
            category_name: category.name.clone(),
            resolved_by: ResolvedBy::GlobalCache,
            confidence: entry.confidence,
        })
    }

    /// Tier 3: deterministic keyword table over merchant + description +
    /// full message.
    fn from_keywords(&self, request: &ResolutionRequest) -> Option<ResolvedCategory> {
        let texts = [
            request.merchant.as_str(),
            request.description.as_deref().unwrap_or(""),
            request.full_message.as_deref().unwrap_or(""),
        ];
        let hit = keywords::classify(texts)?;
        let category = find_allowed(&request.allowed_categories, hit.category)?;

        Some(ResolvedCategory {
            category_id: category.category_id,
            category_name: category.name.clone(),
            resolved_by: ResolvedBy::Keyword,
            confidence: KEYWORD_CONFIDENCE,
        })
    }

    /// Tier 4: remote oracle. Answers outside the allowed list are
    /// rejected — they read as hallucination or drift.
    async fn from_oracle(&self, request: &ResolutionRequest) -> Option<ResolvedCategory> {
        let oracle = self.oracle.as_ref()?;
        let allowed_names: Vec<String> = request
            .allowed_categories
            .iter()
            .map(|c| c.name.clone())
            .collect();

        let answer = match oracle
            .classify_category(
                &request.merchant,
                request.description.as_deref(),
                request.full_message.as_deref(),
                &allowed_names,
            )
            .await
        {
            Ok(answer) => answer,
            Err(error) => {
                warn!(%error, merchant = %request.merchant, "classification oracle unavailable, treating as miss");
                return None;
            }
        };

        match find_allowed(&request.allowed_categories, answer.trim()) {
            Some(category) => Some(ResolvedCategory {
                category_id: category.category_id,
                category_name: category.name.clone(),
                resolved_by: ResolvedBy::Ai,
                confidence: ORACLE_CONFIDENCE,
            }),
            None => {
                warn!(
                    answer = %answer,
                    "oracle named a category outside the allowed list, rejecting"
                );
                None
            }
        }
    }

    /// Tier 5: cannot fail while the category list is non-empty.
    fn fallback(&self, request: &ResolutionRequest) -> ResolvedCategory {
        let category = find_allowed(&request.allowed_categories, FALLBACK_CATEGORY)
            .unwrap_or(&request.allowed_categories[0]);

        ResolvedCategory {
            category_id: category.category_id,
            category_name: category.name.clone(),
            resolved_by: ResolvedBy::Fallback,
            confidence: FALLBACK_CONFIDENCE,
        }
    }

    /// Fire-and-forget cache write. The resolution has already been
    /// returned by the time this lands; a lost concurrent update is
    /// accepted.
    fn spawn_cache_update(&self, merchant_key: String, category_name: String, incoming: f64) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            apply_cache_update(store.as_ref(), &merchant_key, &category_name, incoming).await;
        });
    }

    /// Fire-and-forget categorization log append.
    pub fn log_resolution(
        &self,
        user_id: Uuid,
        expense_id: Option<Uuid>,
        merchant: &str,
        resolved: &ResolvedCategory,
    ) {
        let entry = ResolutionLogEntry {
            user_id,
            expense_id,
            merchant_key: merchant_key(merchant),
            category_name: resolved.category_name.clone(),
            resolved_by: resolved.resolved_by,
            confidence: resolved.confidence,
            timestamp: Utc::now(),
        };

        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(error) = store.append_resolution_log(entry).await {
                warn!(%error, "categorization log append failed");
            }
        });
    }

    /// Learning loop: a manual category edit pins an override, pushes a
    /// high-confidence update into the shared cache, and records the
    /// correction. The three writes are independent; partial completion
    /// is logged, not rolled back.
    pub async fn record_user_correction(
        &self,
        user_id: Uuid,
        expense_id: Option<Uuid>,
        merchant: &str,
        category: &Category,
    ) {
        let key = merchant_key(merchant);

        if let Err(error) = self
            .store
            .upsert_override(UserOverride {
                user_id,
                merchant_key: key.clone(),
                category_name: category.name.clone(),
                updated_at: Utc::now(),
            })
            .await
        {
            warn!(%error, merchant_key = %key, "override upsert failed");
        }

        apply_cache_update(
            self.store.as_ref(),
            &key,
            &category.name,
            CORRECTION_CONFIDENCE,
        )
        .await;

        if let Err(error) = self
            .store
            .append_resolution_log(ResolutionLogEntry {
                user_id,
                expense_id,
                merchant_key: key.clone(),
                category_name: category.name.clone(),
                resolved_by: ResolvedBy::UserCorrection,
                confidence: 1.0,
                timestamp: Utc::now(),
            })
            .await
        {
            warn!(%error, merchant_key = %key, "correction log append failed");
        }
    }
}

/// Read-blend-write cache update. Two near-simultaneous updates for the
/// same key may both read the old state; last writer wins.
async fn apply_cache_update(
    store: &dyn ExpenseStore,
    merchant_key: &str,
    category_name: &str,
    incoming: f64,
) {
    let existing = match store.get_merchant_resolution(merchant_key).await {
        Ok(existing) => existing,
        Err(error) => {
            warn!(%error, merchant_key, "cache read failed, skipping update");
            return;
        }
    };

    let entry = match existing {
        Some(prev) => MerchantResolution {
            merchant_key: prev.merchant_key,
            category_name: category_name.to_string(),
            confidence: blend_confidence(prev.confidence, prev.resolution_count, incoming),
            resolution_count: prev.resolution_count + 1,
            last_resolved_at: Utc::now(),
        },
        None => MerchantResolution {
            merchant_key: merchant_key.to_string(),
            category_name: category_name.to_string(),
            confidence: blend_confidence(0.0, 0, incoming),
            resolution_count: 1,
            last_resolved_at: Utc::now(),
        },
    };

    if let Err(error) = store.upsert_merchant_resolution(entry).await {
        warn!(%error, merchant_key, "cache write failed, resolution already returned");
    }
}

fn find_allowed<'a>(allowed: &'a [Category], name: &str) -> Option<&'a Category> {
    allowed.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MockOracle;
    use crate::store::InMemoryStore;

    const TEST_CATEGORIES: &[&str] = &["Coffee", "Dining", "Groceries", "Miscellaneous"];

    fn request(store_user: Uuid, merchant: &str, categories: Vec<Category>) -> ResolutionRequest {
        ResolutionRequest {
            user_id: store_user,
            merchant: merchant.to_string(),
            description: None,
            full_message: None,
            allowed_categories: categories,
        }
    }

    async fn setup() -> (Arc<InMemoryStore>, Vec<Category>, Uuid) {
        let store = Arc::new(InMemoryStore::with_categories(TEST_CATEGORIES));
        let categories = store.list_categories(Uuid::nil()).await.unwrap();
        (store, categories, Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_override_supremacy() {
        let (store, categories, user_id) = setup().await;

        // Cache and keyword table both say Coffee; the override must win.
        store
            .upsert_merchant_resolution(MerchantResolution {
                merchant_key: "starbucks".to_string(),
                category_name: "Coffee".to_string(),
                confidence: 0.95,
                resolution_count: 10,
                last_resolved_at: Utc::now(),
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

        let resolver = CategoryResolver::new(store.clone(), None);
        let resolved = resolver
            .resolve(&request(user_id, "Starbucks", categories))
            .await
            .unwrap();

        assert_eq!(resolved.category_name, "Dining");
        assert_eq!(resolved.resolved_by, ResolvedBy::UserOverride);
        assert_eq!(resolved.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_cache_threshold() {
        let (store, categories, user_id) = setup().await;

        // Below threshold: skipped, keyword tier answers instead.
        store
            .upsert_merchant_resolution(MerchantResolution {
                merchant_key: "starbucks".to_string(),
                category_name: "Dining".to_string(),
                confidence: 0.59,
                resolution_count: 1,
                last_resolved_at: Utc::now(),
            })
            .await
            .unwrap();

        let resolver = CategoryResolver::new(store.clone(), None);
        let resolved = resolver
            .resolve(&request(user_id, "Starbucks", categories.clone()))
            .await
            .unwrap();
        assert_eq!(resolved.resolved_by, ResolvedBy::Keyword);
        assert_eq!(resolved.category_name, "Coffee");
        assert_eq!(resolved.confidence, KEYWORD_CONFIDENCE);

        // At threshold: accepted with its stored confidence.
        store
            .upsert_merchant_resolution(MerchantResolution {
                merchant_key: "starbucks".to_string(),
                category_name: "Dining".to_string(),
                confidence: 0.6,
                resolution_count: 2,
                last_resolved_at: Utc::now(),
            })
            .await
            .unwrap();

        let resolved = resolver
            .resolve(&request(user_id, "Starbucks", categories))
            .await
            .unwrap();
        assert_eq!(resolved.resolved_by, ResolvedBy::GlobalCache);
        assert_eq!(resolved.confidence, 0.6);
    }

    #[tokio::test]
    async fn test_oracle_accepted_when_in_allowed_list() {
        let (store, categories, user_id) = setup().await;
        let oracle = Arc::new(MockOracle {
            category: Some("Dining".to_string()),
            parse: None,
        });

        let resolver = CategoryResolver::new(store.clone(), Some(oracle));
        let resolved = resolver
            .resolve(&request(user_id, "Some Unknown Bistro", categories))
            .await
            .unwrap();

        assert_eq!(resolved.resolved_by, ResolvedBy::Ai);
        assert_eq!(resolved.category_name, "Dining");
        assert_eq!(resolved.confidence, ORACLE_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_oracle_out_of_list_answer_rejected() {
        let (store, categories, user_id) = setup().await;
        let oracle = Arc::new(MockOracle {
            category: Some("Rocket Fuel".to_string()),
            parse: None,
        });

        let resolver = CategoryResolver::new(store.clone(), Some(oracle));
        let resolved = resolver
            .resolve(&request(user_id, "Unknown Vendor", categories))
            .await
            .unwrap();

        assert_eq!(resolved.resolved_by, ResolvedBy::Fallback);
        assert_eq!(resolved.category_name, "Miscellaneous");
        assert_eq!(resolved.confidence, FALLBACK_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_total_fallback_guarantee() {
        let (store, _, user_id) = setup().await;

        // No Miscellaneous in the caller's list: first category is used.
        let custom = vec![Category::new("Rent"), Category::new("Food")];
        let resolver = CategoryResolver::new(store.clone(), None);
        let resolved = resolver
            .resolve(&request(user_id, "Unknown Vendor", custom))
            .await
            .unwrap();
        assert_eq!(resolved.category_name, "Rent");

        // Empty list is the only failure mode.
        assert!(resolver
            .resolve(&request(user_id, "Unknown Vendor", vec![]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_confidence_domain() {
        let (store, categories, user_id) = setup().await;
        let resolver = CategoryResolver::new(store.clone(), None);

        for merchant in ["Starbucks", "Unknown Vendor", "walmart"] {
            let resolved = resolver
                .resolve(&request(user_id, merchant, categories.clone()))
                .await
                .unwrap();
            let c = resolved.confidence;
            let in_domain = c == 1.0
                || (0.6..=CACHE_CONFIDENCE_CEILING).contains(&c)
                || c == KEYWORD_CONFIDENCE
                || c == ORACLE_CONFIDENCE
                || c == FALLBACK_CONFIDENCE;
            assert!(in_domain, "confidence {} escaped the domain", c);
        }
    }

    #[tokio::test]
    async fn test_cache_monotonic_convergence() {
        let (store, _, _) = setup().await;

        let mut last = 0.0;
        for _ in 0..50 {
            apply_cache_update(store.as_ref(), "starbucks", "Coffee", 0.9).await;
            let entry = store
                .get_merchant_resolution("starbucks")
                .await
                .unwrap()
                .unwrap();
            assert!(entry.confidence >= last);
            assert!(entry.confidence <= CACHE_CONFIDENCE_CEILING);
            last = entry.confidence;
        }
    }

    #[test]
    fn test_blend_confidence() {
        assert!((blend_confidence(0.7, 1, 0.8) - 0.75).abs() < 1e-9);
        assert_eq!(blend_confidence(0.0, 0, 0.7), 0.7);
        assert!(blend_confidence(0.99, 1000, 1.0) <= CACHE_CONFIDENCE_CEILING);
    }

    #[tokio::test]
    async fn test_learning_loop_writes() {
        let (store, categories, user_id) = setup().await;
        let resolver = CategoryResolver::new(store.clone(), None);
        let dining = categories.iter().find(|c| c.name == "Dining").unwrap();

        resolver
            .record_user_correction(user_id, None, "Starbucks", dining)
            .await;

        let pinned = store.get_override(user_id, "starbucks").await.unwrap().unwrap();
        assert_eq!(pinned.category_name, "Dining");

        let cached = store
            .get_merchant_resolution("starbucks")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.category_name, "Dining");
        assert_eq!(cached.confidence, CORRECTION_CONFIDENCE);
        assert_eq!(cached.resolution_count, 1);

        let log = store.resolution_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].resolved_by, ResolvedBy::UserCorrection);
        assert_eq!(log[0].confidence, 1.0);
    }

    #[tokio::test]
    async fn test_correction_can_flip_cache_category() {
        let (store, categories, user_id) = setup().await;
        let resolver = CategoryResolver::new(store.clone(), None);

        store
            .upsert_merchant_resolution(MerchantResolution {
                merchant_key: "starbucks".to_string(),
                category_name: "Coffee".to_string(),
                confidence: 0.7,
                resolution_count: 1,
                last_resolved_at: Utc::now(),
            })
            .await
            .unwrap();

        let dining = categories.iter().find(|c| c.name == "Dining").unwrap();
        resolver
            .record_user_correction(user_id, None, "Starbucks", dining)
            .await;

        let cached = store
            .get_merchant_resolution("starbucks")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.category_name, "Dining");
        assert!((cached.confidence - 0.8).abs() < 1e-9);
        assert_eq!(cached.resolution_count, 2);
    }
}
