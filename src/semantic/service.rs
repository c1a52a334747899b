//! Recommendation queries over stored embeddings.
//!
//! Queries run synchronously on the caller's thread:
//! - profile → items: the profile's stored vector against every item vector
//! - text → items: one provider call for the query vector, then the same scan
//! - profile → profiles: the profile's vector against every other profile

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::semantic::embeddings::{EmbeddingProvider, ProviderError};
use crate::semantic::index::{Match, MatchError, SimilarityMatcher};
use crate::semantic::storage::{EmbeddingStore, VectorStorageError};

/// Errors that can occur during recommendation queries.
#[derive(Debug, thiserror::Error)]
pub enum SemanticSearchError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] ProviderError),

    #[error("Match error: {0}")]
    Match(#[from] MatchError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),
}

/// A match plus whether its snapshot is older than the staleness window.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    #[serde(flatten)]
    pub matched: Match,
    pub stale: bool,
}

/// Service answering recommendation queries.
pub struct SemanticSearchService {
    provider: Arc<dyn EmbeddingProvider>,
    profiles: Arc<dyn EmbeddingStore>,
    items: Arc<dyn EmbeddingStore>,
    matcher: Arc<dyn SimilarityMatcher>,
    max_snapshot_age: Duration,
}

impl SemanticSearchService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        profiles: Arc<dyn EmbeddingStore>,
        items: Arc<dyn EmbeddingStore>,
        matcher: Arc<dyn SimilarityMatcher>,
        max_snapshot_age: Duration,
    ) -> Self {
        Self {
            provider,
            profiles,
            items,
            matcher,
            max_snapshot_age,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Rank items against the stored embedding of `profile_id`.
    ///
    /// A profile without an embedding yet gets an empty list.
    pub fn recommend_for_profile(
        &self,
        profile_id: &str,
        limit: usize,
    ) -> Result<Vec<Recommendation>, SemanticSearchError> {
        let Some(profile) = self.profiles.get(profile_id)? else {
            log::warn!("no embedding found for profile {profile_id}");
            return Ok(vec![]);
        };

        let matches = self
            .matcher
            .top_k(&profile.vector, self.items.get_all()?, limit)?;

        Ok(self.with_staleness(matches, Utc::now()))
    }

    /// Rank items against free text.
    pub fn recommend_for_text(
        &self,
        text: &str,
        limit: usize,
    ) -> Result<Vec<Recommendation>, SemanticSearchError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let query = self.provider.embed(text)?;
        let matches = self.matcher.top_k(&query, self.items.get_all()?, limit)?;

        Ok(self.with_staleness(matches, Utc::now()))
    }

    /// Rank other profiles against the stored embedding of `profile_id`.
    pub fn similar_profiles(
        &self,
        profile_id: &str,
        limit: usize,
    ) -> Result<Vec<Recommendation>, SemanticSearchError> {
        let Some(profile) = self.profiles.get(profile_id)? else {
            log::warn!("no embedding found for profile {profile_id}");
            return Ok(vec![]);
        };

        let own_id = profile.entity_id.clone();
        let others = Box::new(
            self.profiles
                .get_all()?
                .filter(move |record| record.entity_id != own_id),
        );
        let matches = self.matcher.top_k(&profile.vector, others, limit)?;

        Ok(self.with_staleness(matches, Utc::now()))
    }

    /// Number of stored (profile, item) embeddings.
    pub fn indexed_counts(&self) -> Result<(usize, usize), SemanticSearchError> {
        Ok((self.profiles.get_all()?.count(), self.items.get_all()?.count()))
    }

    fn with_staleness(&self, matches: Vec<Match>, now: DateTime<Utc>) -> Vec<Recommendation> {
        matches
            .into_iter()
            .map(|matched| Recommendation {
                stale: is_stale(matched.generated_at, now, self.max_snapshot_age),
                matched,
            })
            .collect()
    }
}

/// True when a snapshot generated at `generated_at` is past `max_age`.
pub fn is_stale(generated_at: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
    now.signed_duration_since(generated_at) > max_age
}
