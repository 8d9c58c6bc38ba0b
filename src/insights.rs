//! Insights collaborator interface
//!
//! Read-only query: does a category have a recent weekly spend spike for
//! this user? The note is cosmetic; anything uncertain answers `None` and
//! failures are never surfaced.

use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
pub trait InsightsProvider: Send + Sync {
    /// A short human-readable note, or nothing.
    async fn weekly_spike_note(&self, user_id: Uuid, category_id: Uuid) -> Option<String>;
}

/// Provider with no signal. Default wiring.
pub struct NoInsights;

#[async_trait]
impl InsightsProvider for NoInsights {
    async fn weekly_spike_note(&self, _user_id: Uuid, _category_id: Uuid) -> Option<String> {
        None
    }
}

/// Fixed per-category notes, for the demo binary and tests.
#[derive(Default)]
pub struct StaticInsights {
    notes: HashMap<Uuid, String>,
}

impl StaticInsights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_note(mut self, category_id: Uuid, note: impl Into<String>) -> Self {
        self.notes.insert(category_id, note.into());
        self
    }
}

#[async_trait]
impl InsightsProvider for StaticInsights {
    async fn weekly_spike_note(&self, _user_id: Uuid, category_id: Uuid) -> Option<String> {
        self.notes.get(&category_id).cloned()
    }
}
