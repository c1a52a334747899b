//! Entity selection for refresh batches.
//!
//! The coordinator only decides *which* entities need a new embedding and
//! hands one [`RefreshJob`] per entity to the scheduler. It never waits for
//! the jobs; the returned counts are what was scheduled, not what succeeded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    app::{
        errors::AppError,
        task_runner::{RefreshJob, TaskScheduler},
    },
    documents::{self, DocumentStore, Query, Since, UPDATED_AT_FIELD},
    entities::EntityKind,
    semantic::{self, EmbeddingStore},
};

#[derive(Debug, thiserror::Error)]
#[error("invalid since filter '{0}'")]
pub struct InvalidFilter(pub String);

/// Parse a `since` filter value.
pub fn parse_since(raw: &str) -> Result<DateTime<Utc>, InvalidFilter> {
    documents::parse_timestamp(raw).ok_or_else(|| InvalidFilter(raw.to_string()))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub profile_count: usize,
    pub item_count: usize,
}

pub struct BatchCoordinator {
    docs: Arc<dyn DocumentStore>,
    scheduler: Arc<dyn TaskScheduler>,
    profile_embeddings: Arc<dyn EmbeddingStore>,
    item_embeddings: Arc<dyn EmbeddingStore>,
    max_snapshot_age: chrono::Duration,
}

impl BatchCoordinator {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        scheduler: Arc<dyn TaskScheduler>,
        profile_embeddings: Arc<dyn EmbeddingStore>,
        item_embeddings: Arc<dyn EmbeddingStore>,
        max_snapshot_age: chrono::Duration,
    ) -> Self {
        Self {
            docs,
            scheduler,
            profile_embeddings,
            item_embeddings,
            max_snapshot_age,
        }
    }

    /// Schedule a refresh for every `kind` entity updated at or after
    /// `since`, up to `limit` entities.
    ///
    /// An unparseable `since` is logged and ignored; `limit` still applies.
    pub fn select_and_schedule(
        &self,
        kind: EntityKind,
        since: Option<&str>,
        limit: Option<usize>,
    ) -> Result<usize, AppError> {
        let since = since.and_then(|raw| match parse_since(raw) {
            Ok(at) => Some(Since {
                field: UPDATED_AT_FIELD.to_string(),
                at,
            }),
            Err(err) => {
                log::warn!("{err}, refreshing {kind}s without a date filter");
                None
            }
        });

        let selected = self
            .docs
            .query(kind.source_collection(), &Query { since, limit })?;

        let mut scheduled = 0;
        for (id, _) in selected {
            self.scheduler.schedule(RefreshJob::new(kind, id))?;
            scheduled += 1;
        }

        log::info!("scheduled {scheduled} {kind} refreshes");
        Ok(scheduled)
    }

    /// Schedule a refresh of a single entity.
    pub fn refresh_one(&self, kind: EntityKind, id: &str) -> Result<(), AppError> {
        if self.docs.get(kind.source_collection(), id)?.is_none() {
            return Err(AppError::NotFound(format!("{kind} {id}")));
        }

        self.scheduler.schedule(RefreshJob::new(kind, id))
    }

    pub fn refresh_all(&self) -> Result<BatchCounts, AppError> {
        self.batch_process(None, None)
    }

    /// [`Self::select_and_schedule`] over profiles and items with one filter.
    pub fn batch_process(
        &self,
        since: Option<&str>,
        limit: Option<usize>,
    ) -> Result<BatchCounts, AppError> {
        Ok(BatchCounts {
            profile_count: self.select_and_schedule(EntityKind::Profile, since, limit)?,
            item_count: self.select_and_schedule(EntityKind::Item, since, limit)?,
        })
    }

    /// Schedule a refresh for every stored `kind` embedding older than the
    /// configured snapshot age.
    pub fn schedule_stale(&self, kind: EntityKind) -> Result<usize, AppError> {
        let store = match kind {
            EntityKind::Profile => &self.profile_embeddings,
            EntityKind::Item => &self.item_embeddings,
        };

        let now = Utc::now();
        let stale: Vec<String> = store
            .get_all()?
            .filter(|record| semantic::is_stale(record.generated_at, now, self.max_snapshot_age))
            .map(|record| record.entity_id)
            .collect();

        for id in &stale {
            self.scheduler.schedule(RefreshJob::new(kind, id.as_str()))?;
        }

        log::info!("scheduled {} stale {kind} refreshes", stale.len());
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{Collection, Document, MemoryDocuments};
    use crate::semantic::{EmbeddingRecord, VectorStorage};
    use crate::tests::RecordingScheduler;
    use chrono::TimeZone;
    use serde_json::json;

    struct Fixture {
        docs: Arc<MemoryDocuments>,
        scheduler: Arc<RecordingScheduler>,
        items: Arc<VectorStorage>,
        coordinator: BatchCoordinator,
    }

    fn fixture() -> Fixture {
        let docs = Arc::new(MemoryDocuments::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let profiles = Arc::new(VectorStorage::new(docs.clone(), Collection::ProfileEmbeddings));
        let items = Arc::new(VectorStorage::new(docs.clone(), Collection::ItemEmbeddings));
        let coordinator = BatchCoordinator::new(
            docs.clone(),
            scheduler.clone(),
            profiles,
            items.clone(),
            chrono::Duration::days(7),
        );
        Fixture {
            docs,
            scheduler,
            items,
            coordinator,
        }
    }

    fn seed(docs: &MemoryDocuments, collection: Collection, id: &str, updated_at: &str) {
        docs.set(
            collection,
            id,
            json!({"updatedAt": updated_at}).as_object().cloned().unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_parse_since() {
        assert_eq!(
            parse_since("2024-06-01").unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
        );
        assert!(parse_since("yesterday").is_err());
    }

    #[test]
    fn test_since_filter_and_limit() {
        let f = fixture();
        seed(&f.docs, Collection::Profiles, "a", "2024-01-01T00:00:00Z");
        seed(&f.docs, Collection::Profiles, "b", "2024-06-02T00:00:00Z");
        seed(&f.docs, Collection::Profiles, "c", "2024-07-01T00:00:00Z");

        let count = f
            .coordinator
            .select_and_schedule(EntityKind::Profile, Some("2024-06-01"), None)
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(f.scheduler.ids(), vec!["b", "c"]);

        let count = f
            .coordinator
            .select_and_schedule(EntityKind::Profile, Some("2024-06-01"), Some(1))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_invalid_since_runs_unfiltered_with_limit() {
        let f = fixture();
        for i in 0..8 {
            seed(&f.docs, Collection::Profiles, &format!("u{i}"), "2020-01-01");
        }

        let (logs, _guard) = crate::tests::capture_logs();
        let count = f
            .coordinator
            .select_and_schedule(EntityKind::Profile, Some("not-a-date"), Some(5))
            .unwrap();
        assert_eq!(count, 5);

        let output = logs.contents();
        let warning = output
            .lines()
            .find(|line| line.contains("invalid since filter 'not-a-date'"))
            .unwrap_or_else(|| panic!("no warning in {output:?}"));
        assert!(warning.contains("WARN"));
        assert_eq!(f.scheduler.jobs().len(), 5);
        assert!(f
            .scheduler
            .jobs()
            .iter()
            .all(|job| job.kind == EntityKind::Profile));
    }

    #[test]
    fn test_refresh_one_requires_source_record() {
        let f = fixture();
        seed(&f.docs, Collection::Items, "i1", "2024-01-01");

        f.coordinator.refresh_one(EntityKind::Item, "i1").unwrap();
        assert!(matches!(
            f.coordinator.refresh_one(EntityKind::Item, "missing"),
            Err(AppError::NotFound(_))
        ));
        assert_eq!(f.scheduler.jobs(), vec![RefreshJob::new(EntityKind::Item, "i1")]);
    }

    #[test]
    fn test_refresh_all_counts_both_kinds() {
        let f = fixture();
        seed(&f.docs, Collection::Profiles, "u1", "2024-01-01");
        seed(&f.docs, Collection::Items, "i1", "2024-01-01");
        seed(&f.docs, Collection::Items, "i2", "2024-01-01");

        let counts = f.coordinator.refresh_all().unwrap();
        assert_eq!(
            counts,
            BatchCounts {
                profile_count: 1,
                item_count: 2
            }
        );
        assert_eq!(f.scheduler.jobs().len(), 3);
    }

    #[test]
    fn test_schedule_stale() {
        let f = fixture();
        let record = |id: &str, age_days: i64| EmbeddingRecord {
            entity_id: id.to_string(),
            vector: vec![1.0],
            generated_at: Utc::now() - chrono::Duration::days(age_days),
            model: "fake".to_string(),
            snapshot: Document::new(),
        };
        f.items.upsert("fresh", record("fresh", 1)).unwrap();
        f.items.upsert("old", record("old", 30)).unwrap();

        assert_eq!(f.coordinator.schedule_stale(EntityKind::Item).unwrap(), 1);
        assert_eq!(f.scheduler.ids(), vec!["old"]);
        assert_eq!(f.coordinator.schedule_stale(EntityKind::Profile).unwrap(), 0);
    }
}
